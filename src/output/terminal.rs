// Terminal output for play walks

use std::collections::{BTreeMap, BTreeSet};
use std::io::IsTerminal;
use std::time::Duration;

use colored::*;

use crate::executor::host_state::RunState;

/// Terminal output manager
pub struct TerminalOutput {
    verbose: bool,
    quiet: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        // Respect NO_COLOR (https://no-color.org/) and plain pipes
        if std::env::var("NO_COLOR").is_ok() || !std::io::stdout().is_terminal() {
            colored::control::set_override(false);
        }

        TerminalOutput { verbose, quiet }
    }

    /// Print a header for a play
    pub fn print_play_header(&self, play: &str, hosts_count: usize) {
        if self.quiet {
            return;
        }
        println!();
        println!("{}", format_play_header(play, hosts_count));
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Print the host a task listing belongs to
    pub fn print_host_header(&self, host: &str) {
        if self.quiet {
            return;
        }
        println!();
        println!("{} {}", "HOST".yellow().bold(), host.white().bold());
    }

    /// Print one task handed out by the iterator
    pub fn print_task(&self, step: &TaskStep) {
        if self.quiet && !step.failed {
            return;
        }
        println!("{}", format_task_step(step, self.verbose));
    }

    /// Print the recap summary
    pub fn print_recap(&self, recap: &PlayRecap) {
        if self.quiet && !recap.has_failures() {
            return;
        }

        println!();
        println!("{}", "PLAY RECAP".green().bold());
        println!("{}", "─".repeat(60).dimmed());
        for line in format_recap(recap) {
            println!("{}", line);
        }

        println!();
        println!("Total time: {:.2}s", recap.total_duration.as_secs_f64());
    }
}

fn format_play_header(play: &str, hosts_count: usize) -> String {
    let name = if play.is_empty() { "unnamed play" } else { play };
    format!("{} {} ({} hosts)", "PLAY".green().bold(), name.cyan(), hosts_count)
}

fn format_task_step(step: &TaskStep, verbose: bool) -> String {
    let section = match step.run_state {
        RunState::Setup => "setup".blue(),
        RunState::Main => "main".normal(),
        RunState::Rescue => "rescue".yellow(),
        RunState::Always => "always".cyan(),
        RunState::Complete => "complete".dimmed(),
    };

    let mut line = format!(
        "  {:>3}. [{}] {}",
        step.index,
        section,
        match &step.role {
            Some(role) => format!("{} : {}", role.dimmed(), step.task_name),
            None => step.task_name.clone(),
        }
    );

    if verbose {
        line.push_str(&format!(" {}", format!("({})", step.host).dimmed()));
    }
    if step.failed {
        line.push_str(&format!(" {}", "FAILED".red().bold()));
    }
    line
}

fn format_recap(recap: &PlayRecap) -> Vec<String> {
    recap
        .hosts
        .iter()
        .map(|(host, stats)| {
            let ok = format!("ok={}", stats.ok).green();
            let failed = if stats.failed > 0 {
                format!("failed={}", stats.failed).red().bold()
            } else {
                format!("failed={}", stats.failed).normal()
            };
            let rescued = format!("rescued={}", stats.rescued).yellow();
            let status = if recap.failed_hosts.contains(host) {
                "FAILED".red().bold()
            } else {
                "ok".green()
            };

            format!(
                "{:<30} : {}    {}    {}    {}",
                host.white().bold(),
                ok,
                failed,
                rescued,
                status
            )
        })
        .collect()
}

/// One task handed out for a host
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStep {
    pub host: String,
    /// Position in the host's sequence, starting at 1
    pub index: usize,
    pub task_name: String,
    pub role: Option<String>,
    /// Section of the innermost block the task came from
    pub run_state: RunState,
    /// The simulated run marked this task failed
    pub failed: bool,
}

/// Statistics for a single host
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HostStats {
    pub ok: usize,
    pub failed: usize,
    /// Tasks run from rescue sections
    pub rescued: usize,
}

impl HostStats {
    pub fn record(&mut self, step: &TaskStep) {
        if step.failed {
            self.failed += 1;
        } else {
            self.ok += 1;
        }
        if step.run_state == RunState::Rescue {
            self.rescued += 1;
        }
    }
}

/// Summary of a play walk
#[derive(Debug, Default, Clone)]
pub struct PlayRecap {
    pub hosts: BTreeMap<String, HostStats>,
    /// Hosts the iterator reports as failed at the end of the play
    pub failed_hosts: BTreeSet<String>,
    pub total_duration: Duration,
}

impl PlayRecap {
    pub fn new() -> Self {
        PlayRecap::default()
    }

    /// Make sure the host shows up even if it never ran a task
    pub fn add_host(&mut self, host: &str) {
        self.hosts.entry(host.to_string()).or_default();
    }

    pub fn record(&mut self, step: &TaskStep) {
        self.hosts.entry(step.host.clone()).or_default().record(step);
    }

    /// Fold another play's recap into this one
    pub fn merge(&mut self, other: PlayRecap) {
        for (host, stats) in other.hosts {
            let entry = self.hosts.entry(host).or_default();
            entry.ok += stats.ok;
            entry.failed += stats.failed;
            entry.rescued += stats.rescued;
        }
        self.failed_hosts.extend(other.failed_hosts);
        self.total_duration += other.total_duration;
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_hosts.is_empty()
    }

    pub fn total_tasks(&self) -> usize {
        self.hosts.values().map(|s| s.ok + s.failed).sum()
    }
}
