// Play context: per-run options that shape how a play is iterated

use glob::Pattern;

use super::facts::GatherPolicy;
use super::tags::TagFilter;
use crate::parser::ast::Task;

/// Options for iterating a play
#[derive(Debug, Clone, Default)]
pub struct PlayContext {
    /// Skip ahead to the first task whose name matches (exact or glob).
    /// Cleared once a play has matched it.
    pub start_at_task: Option<String>,
    /// Tag selection applied when the play is compiled
    pub tag_filter: TagFilter,
    /// When to inject the implicit setup task
    pub gather_policy: GatherPolicy,
}

impl PlayContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_at_task(mut self, task: impl Into<String>) -> Self {
        self.start_at_task = Some(task.into());
        self
    }

    pub fn with_tag_filter(mut self, filter: TagFilter) -> Self {
        self.tag_filter = filter;
        self
    }

    pub fn with_gather_policy(mut self, policy: GatherPolicy) -> Self {
        self.gather_policy = policy;
        self
    }

    /// Whether `task` is the one `start_at_task` points to
    pub fn matches_start_at(&self, task: &Task) -> bool {
        match &self.start_at_task {
            Some(wanted) => name_matches(wanted, &task.name) || name_matches(wanted, task.get_name()),
            None => false,
        }
    }
}

/// Exact or glob match of a task name
fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern == name {
        return true;
    }
    // An invalid glob can still match exactly, which was checked above
    Pattern::new(pattern)
        .map(|p| p.matches(name))
        .unwrap_or(false)
}
