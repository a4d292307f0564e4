// nexus-play CLI - walk a playbook's per-host task sequence

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use glob::Pattern;
use parking_lot::Mutex;

use nexus_play::executor::{
    FactCache, GatherPolicy, HostSnapshot, PlayContext, PlayIterator, RoleTracker, TagFilter,
};
use nexus_play::inventory::Inventory;
use nexus_play::output::{NexusError, OutputFormat, OutputWriter, PlayRecap, TaskStep};
use nexus_play::parser::ast::{Playbook, Task, Value};
use nexus_play::parser::{parse_playbook_file, parse_task_file, RoleResolver};
use nexus_play::plugins::{CallbackManager, JsonLogCallback, TracingCallback};

#[derive(Parser)]
#[command(
    name = "nexus-play",
    about = "Walk the per-host task order of a playbook",
    version,
    disable_colored_help = true,
    term_width = 0
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show failures
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: OutputFormat,

    /// Append iterator events as JSON lines to this file
    #[arg(long, global = true)]
    log_json: Option<PathBuf>,
}

/// Arguments shared by every subcommand that walks a playbook
#[derive(clap::Args, Debug, Clone)]
struct WalkArgs {
    /// Path to the playbook file
    playbook: PathBuf,

    /// Path to the inventory file
    #[arg(short, long)]
    inventory: Option<PathBuf>,

    /// Comma-separated host list (alternative to inventory file)
    #[arg(short = 'H', long)]
    hosts: Option<String>,

    /// Only run tasks with these tags (comma-separated)
    #[arg(short = 't', long)]
    tags: Option<String>,

    /// Skip tasks with these tags (comma-separated)
    #[arg(long)]
    skip_tags: Option<String>,

    /// Start at the first task matching this name or glob
    #[arg(long)]
    start_at_task: Option<String>,

    /// Fact gathering policy: smart, explicit or implicit
    /// (defaults to $NEXUS_GATHERING, then implicit)
    #[arg(long)]
    gathering: Option<GatherPolicy>,

    /// Additional role search path (can repeat)
    #[arg(long = "roles-path")]
    roles_paths: Vec<PathBuf>,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// List the tasks each host would run, assuming nothing fails
    ListTasks {
        #[command(flatten)]
        walk: WalkArgs,
    },

    /// Walk all hosts concurrently, failing the tasks that match --fail
    Simulate {
        #[command(flatten)]
        walk: WalkArgs,

        /// Fail tasks whose name matches this glob (can repeat)
        #[arg(long = "fail")]
        fail: Vec<String>,

        /// Only fail tasks on these hosts (can repeat, default all hosts)
        #[arg(long = "fail-host")]
        fail_hosts: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = OutputWriter::new(cli.output_format, cli.verbose, cli.quiet);
    let callbacks = match build_callbacks(cli.log_json.as_deref()) {
        Ok(callbacks) => Arc::new(callbacks),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::ListTasks { walk } => list_tasks(&walk, &output, callbacks).map(|_| true),
        Commands::Simulate {
            walk,
            fail,
            fail_hosts,
        } => match FailurePlan::new(&fail, fail_hosts) {
            Ok(plan) => simulate(&walk, plan, &output, callbacks).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn build_callbacks(log_json: Option<&Path>) -> anyhow::Result<CallbackManager> {
    let mut callbacks = CallbackManager::new().with(Box::new(TracingCallback));
    if let Some(path) = log_json {
        let json_log = JsonLogCallback::new(path)
            .with_context(|| format!("Failed to open JSON log {}", path.display()))?;
        callbacks.add(Box::new(json_log));
    }
    tracing::debug!(plugins = ?callbacks.plugin_names(), "callbacks ready");
    Ok(callbacks)
}

/// Everything a walk needs that lives longer than one play
struct Session {
    playbook: Playbook,
    playbook_dir: PathBuf,
    inventory: Inventory,
    resolver: RoleResolver,
    context: PlayContext,
    fact_cache: FactCache,
    role_tracker: Arc<RoleTracker>,
    callbacks: Arc<CallbackManager>,
}

impl Session {
    fn load(walk: &WalkArgs, callbacks: Arc<CallbackManager>) -> anyhow::Result<Self> {
        let playbook = parse_playbook_file(&walk.playbook)?;
        let inventory = load_inventory(walk)?;

        let mut resolver = RoleResolver::new();
        resolver.add_playbook_relative_path(&walk.playbook);
        for path in &walk.roles_paths {
            resolver.add_search_path(path);
        }

        let mut context = PlayContext::new()
            .with_tag_filter(TagFilter::from_args(walk.tags.as_deref(), walk.skip_tags.as_deref()))
            .with_gather_policy(walk.gathering.unwrap_or_else(GatherPolicy::from_env));
        if let Some(start) = &walk.start_at_task {
            context = context.with_start_at_task(start.clone());
        }

        tracing::debug!(
            playbook = %walk.playbook.display(),
            plays = playbook.plays.len(),
            hosts = inventory.host_count(),
            tags = %context.tag_filter.describe(),
            gathering = %context.gather_policy,
            "session loaded"
        );

        Ok(Session {
            playbook_dir: walk
                .playbook
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            playbook,
            inventory,
            resolver,
            context,
            fact_cache: FactCache::new(),
            role_tracker: Arc::new(RoleTracker::new()),
            callbacks,
        })
    }

    fn iterator(&mut self, play_index: usize) -> anyhow::Result<PlayIterator> {
        let play = &self.playbook.plays[play_index];
        let roles = self.resolver.resolve_play_roles(play)?;
        Ok(PlayIterator::new(
            &self.inventory,
            play,
            &roles,
            &mut self.context,
            &self.fact_cache,
            self.role_tracker.clone(),
            self.callbacks.clone(),
        )?)
    }

    /// Bookkeeping an executor does after running `task` on `host`
    fn after_task(&self, iterator: &mut PlayIterator, host: &str, task: &Task) -> Result<(), NexusError> {
        if let Some(role) = &task.role {
            self.role_tracker.record_task_run(role, host);
        }

        match task.action.as_str() {
            "setup" => {
                let facts = HashMap::from([(
                    "inventory_hostname".to_string(),
                    Value::String(host.to_string()),
                )]);
                self.fact_cache.update_facts(host, facts);
            }
            "include_tasks" | "import_tasks" => {
                if let Some(file) = include_target(task) {
                    let tasks = parse_task_file(&self.playbook_dir.join(file))?;
                    iterator.add_tasks(host, tasks)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Inventory file, then the CLI host list, then localhost
fn load_inventory(walk: &WalkArgs) -> anyhow::Result<Inventory> {
    if let Some(path) = &walk.inventory {
        return Ok(Inventory::from_file(path)?);
    }
    if let Some(hosts) = &walk.hosts {
        let inventory = Inventory::from_cli_hosts(hosts);
        if inventory.host_count() == 0 {
            return Err(anyhow!("--hosts did not name any host"));
        }
        return Ok(inventory);
    }
    Ok(Inventory::from_cli_hosts("localhost"))
}

fn include_target(task: &Task) -> Option<&str> {
    task.args
        .get("_raw_params")
        .or_else(|| task.args.get("file"))
        .and_then(Value::as_str)
}

/// Which tasks fail during a simulation
#[derive(Debug, Clone)]
struct FailurePlan {
    patterns: Vec<Pattern>,
    hosts: Vec<String>,
}

impl FailurePlan {
    fn new(patterns: &[String], hosts: Vec<String>) -> anyhow::Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p).with_context(|| format!("Invalid --fail pattern '{}'", p)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(FailurePlan { patterns, hosts })
    }

    fn should_fail(&self, host: &str, task: &Task) -> bool {
        if !self.hosts.is_empty() && !self.hosts.iter().any(|h| h == host) {
            return false;
        }
        self.patterns.iter().any(|p| p.matches(task.get_name()))
    }
}

fn task_step(
    host: &str,
    index: usize,
    task: &Task,
    snapshot: &HostSnapshot,
    iterator: &PlayIterator,
    failed: bool,
) -> TaskStep {
    TaskStep {
        host: host.to_string(),
        index,
        task_name: task.get_name().to_string(),
        role: task.role.clone(),
        run_state: iterator.section_of(snapshot, task),
        failed,
    }
}

/// Print every host's task sequence, one host at a time
fn list_tasks(walk: &WalkArgs, output: &OutputWriter, callbacks: Arc<CallbackManager>) -> anyhow::Result<()> {
    let mut session = Session::load(walk, callbacks)?;

    for play_index in 0..session.playbook.plays.len() {
        let mut iterator = session.iterator(play_index)?;
        let hosts = iterator.hosts();
        output.print_play_header(iterator.play_name(), hosts.len());

        for host in &hosts {
            output.print_host_header(host);
            let mut index = 0;
            while let (snapshot, Some(task)) = iterator.get_next_task_for_host(host, false)? {
                index += 1;
                output.print_task(&task_step(host, index, &task, &snapshot, &iterator, false));
                session.after_task(&mut iterator, host, &task)?;
            }
        }
    }

    Ok(())
}

/// Drive every host from its own tokio task. Returns false when any host
/// ended the playbook failed.
async fn simulate(
    walk: &WalkArgs,
    plan: FailurePlan,
    output: &OutputWriter,
    callbacks: Arc<CallbackManager>,
) -> anyhow::Result<bool> {
    let session = Arc::new(Mutex::new(Session::load(walk, callbacks)?));
    let plan = Arc::new(plan);
    let mut recap = PlayRecap::new();
    let started = Instant::now();

    let play_count = session.lock().playbook.plays.len();
    for play_index in 0..play_count {
        let iterator = session.lock().iterator(play_index)?;
        let hosts = iterator.hosts();
        output.print_play_header(iterator.play_name(), hosts.len());
        let iterator = Arc::new(Mutex::new(iterator));

        let handles: Vec<_> = hosts
            .iter()
            .cloned()
            .map(|host| {
                let iterator = iterator.clone();
                let session = session.clone();
                let plan = plan.clone();
                tokio::spawn(async move { run_host(host, iterator, session, plan).await })
            })
            .collect();

        let mut play_recap = PlayRecap::new();
        for result in join_all(handles).await {
            let steps = result.context("host task panicked")??;
            for step in &steps {
                output.print_task(step);
                play_recap.record(step);
            }
        }

        for host in &hosts {
            play_recap.add_host(host);
        }
        play_recap.failed_hosts = iterator.lock().get_failed_hosts();
        recap.merge(play_recap);
    }

    recap.total_duration = started.elapsed();
    output.print_recap(&recap);
    Ok(!recap.has_failures())
}

async fn run_host(
    host: String,
    iterator: Arc<Mutex<PlayIterator>>,
    session: Arc<Mutex<Session>>,
    plan: Arc<FailurePlan>,
) -> Result<Vec<TaskStep>, NexusError> {
    let mut steps = Vec::new();

    loop {
        let step = {
            let mut iterator = iterator.lock();
            let (snapshot, Some(task)) = iterator.get_next_task_for_host(&host, false)? else {
                break;
            };

            let failed = plan.should_fail(&host, &task);
            let step = task_step(&host, steps.len() + 1, &task, &snapshot, &iterator, failed);
            if failed {
                iterator.mark_host_failed(&host)?;
            } else {
                session.lock().after_task(&mut iterator, &host, &task)?;
            }
            step
        };

        steps.push(step);
        tokio::task::yield_now().await;
    }

    Ok(steps)
}
