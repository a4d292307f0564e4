// Callback plugin system for the play iterator
//
// The iterator reports what it does through a CallbackManager handed to it
// at construction. Plugins never influence iteration.

use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::executor::host_state::RunState;
use crate::parser::ast::Task;

/// Hooks into the play iterator's lifecycle
pub trait CallbackPlugin: Send + Sync {
    /// Get the name of this plugin
    fn name(&self) -> &str;

    fn on_iterator_start(&self, _play: &str, _hosts: &[String], _blocks: usize) {}

    /// A task was handed out for execution (never called for peeks)
    fn on_task_selected(&self, _host: &str, _task: &Task, _run_state: RunState) {}

    /// The host ran out of tasks
    fn on_host_complete(&self, _host: &str, _failed: bool) {}

    /// A failure was recorded while the host was in `run_state`
    fn on_host_failed(&self, _host: &str, _run_state: RunState) {}

    fn on_tasks_added(&self, _host: &str, _count: usize) {}

    /// Start-at-task matched `task` for the host
    fn on_start_at_task(&self, _host: &str, _task: &Task) {}
}

/// Manager for callback plugins
#[derive(Default)]
pub struct CallbackManager {
    plugins: Vec<Box<dyn CallbackPlugin>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        CallbackManager {
            plugins: Vec::new(),
        }
    }

    pub fn add(&mut self, plugin: Box<dyn CallbackPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn with(mut self, plugin: Box<dyn CallbackPlugin>) -> Self {
        self.add(plugin);
        self
    }

    /// Names of the registered plugins, in call order
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn on_iterator_start(&self, play: &str, hosts: &[String], blocks: usize) {
        for plugin in &self.plugins {
            plugin.on_iterator_start(play, hosts, blocks);
        }
    }

    pub fn on_task_selected(&self, host: &str, task: &Task, run_state: RunState) {
        for plugin in &self.plugins {
            plugin.on_task_selected(host, task, run_state);
        }
    }

    pub fn on_host_complete(&self, host: &str, failed: bool) {
        for plugin in &self.plugins {
            plugin.on_host_complete(host, failed);
        }
    }

    pub fn on_host_failed(&self, host: &str, run_state: RunState) {
        for plugin in &self.plugins {
            plugin.on_host_failed(host, run_state);
        }
    }

    pub fn on_tasks_added(&self, host: &str, count: usize) {
        for plugin in &self.plugins {
            plugin.on_tasks_added(host, count);
        }
    }

    pub fn on_start_at_task(&self, host: &str, task: &Task) {
        for plugin in &self.plugins {
            plugin.on_start_at_task(host, task);
        }
    }
}

// ========== Built-in Plugins ==========

/// Emits iterator events as tracing events
pub struct TracingCallback;

impl CallbackPlugin for TracingCallback {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_iterator_start(&self, play: &str, hosts: &[String], blocks: usize) {
        tracing::info!(play, hosts = hosts.len(), blocks, "iterating play");
    }

    fn on_task_selected(&self, host: &str, task: &Task, run_state: RunState) {
        tracing::debug!(
            host,
            task = task.get_name(),
            task_id = %task.id,
            role = task.role.as_deref().unwrap_or("-"),
            state = %run_state,
            "task selected"
        );
    }

    fn on_host_complete(&self, host: &str, failed: bool) {
        if failed {
            tracing::warn!(host, "host finished with failures");
        } else {
            tracing::info!(host, "host finished");
        }
    }

    fn on_host_failed(&self, host: &str, run_state: RunState) {
        tracing::debug!(host, state = %run_state, "failure recorded");
    }

    fn on_tasks_added(&self, host: &str, count: usize) {
        tracing::debug!(host, count, "tasks inserted");
    }

    fn on_start_at_task(&self, host: &str, task: &Task) {
        tracing::info!(host, task = task.get_name(), "starting at task");
    }
}

/// JSON log callback - writes one event per line to a file
pub struct JsonLogCallback {
    file: Arc<Mutex<File>>,
}

impl JsonLogCallback {
    /// Create a new JSON log callback that appends to the specified file
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(JsonLogCallback {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn write_event(&self, mut event: serde_json::Value) {
        if let Some(map) = event.as_object_mut() {
            map.insert(
                "timestamp".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
        }
        let mut file = self.file.lock();
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
    }
}

impl CallbackPlugin for JsonLogCallback {
    fn name(&self) -> &str {
        "json_log"
    }

    fn on_iterator_start(&self, play: &str, hosts: &[String], blocks: usize) {
        self.write_event(json!({
            "event": "iterator_start",
            "play": play,
            "hosts": hosts,
            "blocks": blocks,
        }));
    }

    fn on_task_selected(&self, host: &str, task: &Task, run_state: RunState) {
        self.write_event(json!({
            "event": "task_selected",
            "host": host,
            "task": task.get_name(),
            "task_id": task.id,
            "role": task.role,
            "run_state": run_state,
        }));
    }

    fn on_host_complete(&self, host: &str, failed: bool) {
        self.write_event(json!({
            "event": "host_complete",
            "host": host,
            "failed": failed,
        }));
    }

    fn on_host_failed(&self, host: &str, run_state: RunState) {
        self.write_event(json!({
            "event": "host_failed",
            "host": host,
            "run_state": run_state,
        }));
    }

    fn on_tasks_added(&self, host: &str, count: usize) {
        self.write_event(json!({
            "event": "tasks_added",
            "host": host,
            "count": count,
        }));
    }

    fn on_start_at_task(&self, host: &str, task: &Task) {
        self.write_event(json!({
            "event": "start_at_task",
            "host": host,
            "task": task.get_name(),
        }));
    }
}
