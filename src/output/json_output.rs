// JSON output for structured logging

use std::collections::BTreeMap;
use std::io::Write;

use parking_lot::Mutex;
use serde_json::json;

use super::terminal::{PlayRecap, TaskStep};

/// JSON output manager for machine-readable logging (NDJSON on stdout)
pub struct JsonOutput {
    verbose: bool,
    quiet: bool,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl JsonOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        Self::with_writer(verbose, quiet, Box::new(std::io::stdout()))
    }

    /// Write events to `sink` instead of stdout
    pub fn with_writer(verbose: bool, quiet: bool, sink: Box<dyn Write + Send>) -> Self {
        JsonOutput {
            verbose,
            quiet,
            sink: Mutex::new(sink),
        }
    }

    pub fn print_play_header(&self, play: &str, hosts_count: usize) {
        if self.quiet {
            return;
        }

        self.emit_json(&json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "play_start",
            "play": play,
            "hosts_count": hosts_count,
        }));
    }

    /// Host headers only structure the text output
    pub fn print_host_header(&self, _host: &str) {}

    pub fn print_task(&self, step: &TaskStep) {
        if self.quiet && !step.failed {
            return;
        }

        let mut event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "task",
            "host": step.host,
            "index": step.index,
            "task": step.task_name,
            "section": step.run_state,
            "failed": step.failed,
        });

        if self.verbose {
            if let Some(obj) = event.as_object_mut() {
                obj.insert("role".to_string(), json!(step.role));
            }
        }

        self.emit_json(&event);
    }

    pub fn print_recap(&self, recap: &PlayRecap) {
        if self.quiet && !recap.has_failures() {
            return;
        }

        let hosts: BTreeMap<&str, serde_json::Value> = recap
            .hosts
            .iter()
            .map(|(host, stats)| {
                (
                    host.as_str(),
                    json!({
                        "ok": stats.ok,
                        "failed": stats.failed,
                        "rescued": stats.rescued,
                    }),
                )
            })
            .collect();

        self.emit_json(&json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "recap",
            "hosts": hosts,
            "failed_hosts": recap.failed_hosts,
            "total_tasks": recap.total_tasks(),
            "total_duration_ms": recap.total_duration.as_millis() as u64,
            "has_failures": recap.has_failures(),
        }));
    }

    /// Emit a JSON object as a single line (NDJSON format)
    fn emit_json(&self, value: &serde_json::Value) {
        if let Ok(json_str) = serde_json::to_string(value) {
            let mut sink = self.sink.lock();
            let _ = writeln!(sink, "{}", json_str);
        }
    }
}
