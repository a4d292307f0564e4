// Per-host role progress
//
// Executors record that a role ran a task on a host; the play iterator
// marks the role completed for that host when the host moves on to a task
// from a different role.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct RoleTracker {
    /// role name -> hosts that have run at least one of its tasks
    had_task_run: RwLock<HashMap<String, HashSet<String>>>,
    /// role name -> hosts for which the role is finished
    completed: RwLock<HashMap<String, HashSet<String>>>,
}

impl RoleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a task of `role` ran on `host`
    pub fn record_task_run(&self, role: &str, host: &str) {
        self.had_task_run
            .write()
            .entry(role.to_string())
            .or_default()
            .insert(host.to_string());
    }

    pub fn had_task_run(&self, role: &str, host: &str) -> bool {
        self.had_task_run
            .read()
            .get(role)
            .map(|hosts| hosts.contains(host))
            .unwrap_or(false)
    }

    pub fn mark_completed(&self, role: &str, host: &str) {
        self.completed
            .write()
            .entry(role.to_string())
            .or_default()
            .insert(host.to_string());
    }

    pub fn is_completed(&self, role: &str, host: &str) -> bool {
        self.completed
            .read()
            .get(role)
            .map(|hosts| hosts.contains(host))
            .unwrap_or(false)
    }

    /// Hosts for which `role` is finished, sorted
    pub fn completed_hosts(&self, role: &str) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .completed
            .read()
            .get(role)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        hosts.sort();
        hosts
    }

    /// Clear all state (new playbook run)
    pub fn clear(&self) {
        self.had_task_run.write().clear();
        self.completed.write().clear();
    }
}
