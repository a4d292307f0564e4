// Tag selection for play compilation
// - include/skip lists, case-insensitive
// - special tags: always, never
// - block tags are inherited by everything nested inside the block

use std::collections::HashSet;
use std::sync::Arc;

use crate::parser::ast::{Block, Section, TaskOrBlock};

/// Tag filter for selecting which tasks to run
#[derive(Debug, Clone)]
pub struct TagFilter {
    /// Tags that must be present (any of)
    include_tags: HashSet<String>,
    /// Tags that must NOT be present
    skip_tags: HashSet<String>,
}

impl TagFilter {
    pub fn new() -> Self {
        TagFilter {
            include_tags: HashSet::new(),
            skip_tags: HashSet::new(),
        }
    }

    /// Create filter from CLI arguments
    pub fn from_args(tags: Option<&str>, skip_tags: Option<&str>) -> Self {
        TagFilter {
            include_tags: tags.map(Self::parse_tag_list).unwrap_or_default(),
            skip_tags: skip_tags.map(Self::parse_tag_list).unwrap_or_default(),
        }
    }

    fn parse_tag_list(tags: &str) -> HashSet<String> {
        tags.split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Check if a task should run based on its (inherited) tags
    pub fn should_run(&self, task_tags: &[String]) -> bool {
        let tags: HashSet<String> = task_tags.iter().map(|t| t.to_lowercase()).collect();

        if tags.contains("always") && !self.skip_tags.contains("always") {
            return true;
        }

        if tags.contains("never") && !self.include_tags.contains("never") {
            return false;
        }

        // exclusion wins over inclusion
        if tags.iter().any(|t| self.skip_tags.contains(t)) {
            return false;
        }

        if self.include_tags.is_empty() {
            return true;
        }

        tags.iter().any(|t| self.include_tags.contains(t))
    }

    /// Copy of `block` with only the entries this filter selects. Nested
    /// blocks left without main tasks are dropped.
    pub fn filter_block(&self, block: &Block) -> Block {
        self.filter_block_inherited(block, &[])
    }

    fn filter_block_inherited(&self, block: &Block, inherited: &[String]) -> Block {
        let tags = inherit_tags(inherited, &block.tags);
        let mut filtered = Block {
            block: Vec::new(),
            rescue: Vec::new(),
            always: Vec::new(),
            ..block.clone()
        };

        for section in [Section::Main, Section::Rescue, Section::Always] {
            let kept = self.filter_entries(block.section(section), &tags);
            *filtered.section_mut(section) = kept;
        }

        filtered
    }

    fn filter_entries(&self, entries: &[TaskOrBlock], inherited: &[String]) -> Vec<TaskOrBlock> {
        entries
            .iter()
            .filter_map(|entry| match entry {
                TaskOrBlock::Task(task) => {
                    let tags = inherit_tags(inherited, &task.tags);
                    self.should_run(&tags).then(|| entry.clone())
                }
                TaskOrBlock::Block(nested) => {
                    let nested = self.filter_block_inherited(nested, inherited);
                    nested
                        .has_tasks()
                        .then(|| TaskOrBlock::Block(Arc::new(nested)))
                }
            })
            .collect()
    }

    /// Get a human-readable description of the filter
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();

        if !self.include_tags.is_empty() {
            let mut tags: Vec<_> = self.include_tags.iter().cloned().collect();
            tags.sort();
            parts.push(format!("include: [{}]", tags.join(", ")));
        }

        if !self.skip_tags.is_empty() {
            let mut tags: Vec<_> = self.skip_tags.iter().cloned().collect();
            tags.sort();
            parts.push(format!("skip: [{}]", tags.join(", ")));
        }

        if parts.is_empty() {
            "all tasks".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Combine parent tags with a task's own tags
pub fn inherit_tags(parent_tags: &[String], task_tags: &[String]) -> Vec<String> {
    let mut combined: Vec<String> = parent_tags.to_vec();
    for tag in task_tags {
        if !combined.contains(tag) {
            combined.push(tag.clone());
        }
    }
    combined
}
