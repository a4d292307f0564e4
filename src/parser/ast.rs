// Task and block model for Nexus plays

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Stable identity of a task. Survives clones and serde round trips, so a
/// task that went through a worker can be matched back to its original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host targeting pattern
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostPattern {
    /// All hosts
    #[default]
    All,
    /// A specific group or host name
    Group(String),
    /// Union/intersection/exclusion pattern, e.g. "web:&prod:!canary"
    Pattern(String),
    /// localhost only
    Localhost,
}

impl HostPattern {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match s {
            "" | "all" | "*" => HostPattern::All,
            "localhost" => HostPattern::Localhost,
            _ if s.contains(':') => HostPattern::Pattern(s.to_string()),
            _ => HostPattern::Group(s.to_string()),
        }
    }
}

/// A leaf unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Module to run (`command`, `setup`, `include_tasks`, ...)
    pub action: String,
    pub args: HashMap<String, Value>,
    /// Role this task was loaded from
    pub role: Option<String>,
    pub tags: Vec<String>,
    pub when: Option<String>,
    pub notify: Vec<String>,
}

impl Task {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Task {
            id: TaskId::new(),
            name: name.into(),
            action: action.into(),
            args: HashMap::new(),
            role: None,
            tags: Vec::new(),
            when: None,
            notify: Vec::new(),
        }
    }

    /// The implicit fact-gathering task injected at the start of a play
    pub fn setup() -> Self {
        let mut task = Task::new("Gathering Facts", "setup");
        task.tags.push("always".to_string());
        task
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Display name: the task name, or the action when unnamed
    pub fn get_name(&self) -> &str {
        if self.name.is_empty() {
            &self.action
        } else {
            &self.name
        }
    }
}

/// Either a Task or a nested Block inside a block section
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOrBlock {
    Task(Arc<Task>),
    Block(Arc<Block>),
}

impl TaskOrBlock {
    pub fn task(task: Task) -> Self {
        TaskOrBlock::Task(Arc::new(task))
    }

    pub fn block(block: Block) -> Self {
        TaskOrBlock::Block(Arc::new(block))
    }

    pub fn is_block(&self) -> bool {
        matches!(self, TaskOrBlock::Block(_))
    }
}

/// Which of a block's three task lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Main,
    Rescue,
    Always,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Section::Main => "main",
            Section::Rescue => "rescue",
            Section::Always => "always",
        };
        write!(f, "{}", s)
    }
}

/// try/rescue/finally grouping of tasks
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub name: Option<String>,
    /// Main tasks (the "try" section)
    pub block: Vec<TaskOrBlock>,
    /// Tasks to run if the main section fails
    pub rescue: Vec<TaskOrBlock>,
    /// Tasks that run regardless of outcome
    pub always: Vec<TaskOrBlock>,
    pub when: Option<String>,
    pub tags: Vec<String>,
    pub role: Option<String>,
}

impl Block {
    /// Implicit block wrapping a flat list of tasks
    pub fn from_tasks(tasks: Vec<TaskOrBlock>) -> Self {
        Block {
            block: tasks,
            ..Block::default()
        }
    }

    pub fn has_tasks(&self) -> bool {
        !self.block.is_empty()
    }

    pub fn section(&self, section: Section) -> &[TaskOrBlock] {
        match section {
            Section::Main => &self.block,
            Section::Rescue => &self.rescue,
            Section::Always => &self.always,
        }
    }

    pub fn section_mut(&mut self, section: Section) -> &mut Vec<TaskOrBlock> {
        match section {
            Section::Main => &mut self.block,
            Section::Rescue => &mut self.rescue,
            Section::Always => &mut self.always,
        }
    }

    /// Stamp a role name on this block and everything nested in it
    pub fn set_role(&mut self, role: &str) {
        self.role = Some(role.to_string());
        for section in [Section::Main, Section::Rescue, Section::Always] {
            for entry in self.section_mut(section).iter_mut() {
                entry.set_role(role);
            }
        }
    }

    /// Number of leaf tasks in all sections, recursively
    pub fn task_count(&self) -> usize {
        [&self.block, &self.rescue, &self.always]
            .iter()
            .flat_map(|s| s.iter())
            .map(|entry| match entry {
                TaskOrBlock::Task(_) => 1,
                TaskOrBlock::Block(b) => b.task_count(),
            })
            .sum()
    }
}

impl TaskOrBlock {
    fn set_role(&mut self, role: &str) {
        match self {
            TaskOrBlock::Task(task) => Arc::make_mut(task).role = Some(role.to_string()),
            TaskOrBlock::Block(block) => Arc::make_mut(block).set_role(role),
        }
    }
}

/// Reference to a role in a play
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRef {
    pub role: String,
    pub vars: HashMap<String, Value>,
    pub tags: Vec<String>,
}

/// A loaded role: its task list and handlers
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub path: String,
    pub tasks: Vec<TaskOrBlock>,
    pub handlers: Vec<Task>,
}

/// A single play
#[derive(Debug, Clone, Default)]
pub struct Play {
    pub name: String,
    pub source_file: String,
    pub hosts: HostPattern,
    pub vars: HashMap<String, Value>,
    /// Unset, explicitly on, or explicitly off
    pub gather_facts: Option<bool>,
    pub pre_tasks: Vec<TaskOrBlock>,
    pub roles: Vec<RoleRef>,
    pub tasks: Vec<TaskOrBlock>,
    pub post_tasks: Vec<TaskOrBlock>,
    pub handlers: Vec<Task>,
}

/// A parsed playbook file: one or more plays run in order
#[derive(Debug, Clone, Default)]
pub struct Playbook {
    pub source_file: String,
    pub plays: Vec<Play>,
}

impl Playbook {
    pub fn task_count(&self) -> usize {
        self.plays
            .iter()
            .flat_map(|p| p.pre_tasks.iter().chain(&p.tasks).chain(&p.post_tasks))
            .map(|entry| match entry {
                TaskOrBlock::Task(_) => 1,
                TaskOrBlock::Block(b) => b.task_count(),
            })
            .sum()
    }
}

impl Play {
    /// Flatten the play into its ordered top-level blocks.
    ///
    /// `roles` must hold the resolved roles in the order of `self.roles`;
    /// their tasks run between pre_tasks and tasks.
    pub fn compile(&self, roles: &[Role]) -> Vec<Block> {
        let mut blocks = compile_task_list(&self.pre_tasks);

        for (role, role_ref) in roles.iter().zip(self.roles.iter()) {
            for mut block in compile_task_list(&role.tasks) {
                block.set_role(&role.name);
                block.tags.extend(role_ref.tags.iter().cloned());
                blocks.push(block);
            }
        }

        blocks.extend(compile_task_list(&self.tasks));
        blocks.extend(compile_task_list(&self.post_tasks));
        blocks
    }

    /// Handlers contributed by the play's roles, stamped with the role name
    pub fn compile_roles_handlers(&self, roles: &[Role]) -> Vec<Task> {
        roles
            .iter()
            .flat_map(|role| {
                role.handlers
                    .iter()
                    .cloned()
                    .map(move |h| h.with_role(role.name.clone()))
            })
            .collect()
    }
}

/// Group consecutive bare tasks into implicit blocks; explicit blocks stay
/// top-level blocks of their own.
fn compile_task_list(entries: &[TaskOrBlock]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut pending: Vec<TaskOrBlock> = Vec::new();

    for entry in entries {
        match entry {
            TaskOrBlock::Task(_) => pending.push(entry.clone()),
            TaskOrBlock::Block(block) => {
                if !pending.is_empty() {
                    blocks.push(Block::from_tasks(std::mem::take(&mut pending)));
                }
                blocks.push(block.as_ref().clone());
            }
        }
    }

    if !pending.is_empty() {
        blocks.push(Block::from_tasks(pending));
    }

    blocks
}

/// Runtime value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dict(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::List(l) => {
                let items: Vec<String> = l.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Dict(d) => {
                let mut items: Vec<String> = d.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                items.sort();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}
