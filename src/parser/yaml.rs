// YAML playbook parser

use serde::Deserialize;
use serde_yaml::{Mapping, Value as YamlValue};
use std::collections::HashMap;
use std::path::Path;

use super::ast::*;
use crate::output::errors::{NexusError, ParseError, ParseErrorKind};

/// Task keywords that are never the action of a task
const TASK_KEYWORDS: &[&str] = &[
    "args",
    "become",
    "become_user",
    "changed_when",
    "delay",
    "delegate_to",
    "environment",
    "failed_when",
    "ignore_errors",
    "loop",
    "no_log",
    "register",
    "retries",
    "run_once",
    "until",
    "vars",
    "with_items",
];

/// Raw YAML play structure (before AST conversion)
#[derive(Debug, Deserialize)]
struct RawPlay {
    name: Option<String>,
    hosts: Option<String>,
    vars: Option<HashMap<String, YamlValue>>,
    /// Unset, or explicitly on/off
    gather_facts: Option<bool>,
    /// Run before roles
    pre_tasks: Option<Vec<RawTask>>,
    roles: Option<Vec<RawRoleRef>>,
    tasks: Option<Vec<RawTask>>,
    /// Run after tasks
    post_tasks: Option<Vec<RawTask>>,
    handlers: Option<Vec<RawTask>>,
}

/// Role reference - can be a simple string or object with vars
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRoleRef {
    Name(String),
    Full {
        #[serde(alias = "name")]
        role: String,
        #[serde(default)]
        vars: HashMap<String, YamlValue>,
        tags: Option<TagsValue>,
    },
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: Option<String>,
    when: Option<YamlValue>,
    /// Tags for filtering (string or list)
    tags: Option<TagsValue>,
    notify: Option<TagsValue>,
    /// Block tasks (main execution) - if present, this is a block
    block: Option<Vec<RawTask>>,
    /// Rescue tasks (error handling)
    rescue: Option<Vec<RawTask>>,
    /// Always tasks (cleanup)
    always: Option<Vec<RawTask>>,
    /// The action and task keywords, in file order
    #[serde(flatten)]
    rest: Mapping,
}

/// A single string (comma-separated) or a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagsValue {
    Single(String),
    Multiple(Vec<String>),
}

impl TagsValue {
    fn into_list(self) -> Vec<String> {
        match self {
            TagsValue::Single(s) => s
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            TagsValue::Multiple(v) => v,
        }
    }
}

/// Parse a playbook from a file
pub fn parse_playbook_file(path: &Path) -> Result<Playbook, NexusError> {
    let content = std::fs::read_to_string(path).map_err(|e| NexusError::Io {
        message: format!("Failed to read playbook file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    parse_playbook(&content, path.to_string_lossy().to_string())
}

/// Parse a playbook from a string: a list of plays or a single play
pub fn parse_playbook(content: &str, source_file: String) -> Result<Playbook, NexusError> {
    let doc: YamlValue =
        serde_yaml::from_str(content).map_err(|e| yaml_error(&e, &source_file))?;

    let raw_plays: Vec<RawPlay> = match doc {
        YamlValue::Sequence(_) => {
            serde_yaml::from_str(content).map_err(|e| yaml_error(&e, &source_file))?
        }
        YamlValue::Mapping(_) => {
            vec![serde_yaml::from_str(content).map_err(|e| yaml_error(&e, &source_file))?]
        }
        YamlValue::Null => Vec::new(),
        _ => {
            return Err(ParseError::new(
                ParseErrorKind::InvalidValue,
                "A playbook must be a list of plays or a single play",
            )
            .in_file(&source_file)
            .into())
        }
    };

    let plays = raw_plays
        .into_iter()
        .map(|raw| convert_play(raw, &source_file))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Playbook { source_file, plays })
}

/// Parse a task file (a plain list of tasks), as used by roles and includes
pub fn parse_task_file(path: &Path) -> Result<Vec<TaskOrBlock>, NexusError> {
    let content = std::fs::read_to_string(path).map_err(|e| NexusError::Io {
        message: format!("Failed to read task file: {}", e),
        path: Some(path.to_path_buf()),
    })?;
    parse_task_list(&content, &path.to_string_lossy())
}

/// Parse a YAML list of tasks
pub fn parse_task_list(content: &str, source_file: &str) -> Result<Vec<TaskOrBlock>, NexusError> {
    let raw: Option<Vec<RawTask>> =
        serde_yaml::from_str(content).map_err(|e| yaml_error(&e, source_file))?;
    convert_task_list(raw, source_file)
}

/// Parse a YAML list of handlers
pub(crate) fn parse_handler_list(content: &str, source_file: &str) -> Result<Vec<Task>, NexusError> {
    let raw: Option<Vec<RawTask>> =
        serde_yaml::from_str(content).map_err(|e| yaml_error(&e, source_file))?;
    convert_handlers(raw, source_file)
}

fn yaml_error(e: &serde_yaml::Error, source_file: &str) -> NexusError {
    let (line, column) = extract_yaml_error_location(e);
    ParseError::new(ParseErrorKind::InvalidYaml, format!("Invalid YAML: {}", e))
        .in_file(source_file)
        .at(line, column)
        .with_suggestion("Check YAML syntax - ensure proper indentation and valid YAML")
        .into()
}

pub(crate) fn extract_yaml_error_location(e: &serde_yaml::Error) -> (Option<usize>, Option<usize>) {
    if let Some(loc) = e.location() {
        (Some(loc.line()), Some(loc.column()))
    } else {
        (None, None)
    }
}

fn convert_play(raw: RawPlay, source_file: &str) -> Result<Play, NexusError> {
    let hosts = raw
        .hosts
        .as_deref()
        .map(HostPattern::parse)
        .unwrap_or_default();

    let vars = raw
        .vars
        .map(|vars| vars.iter().map(|(k, v)| (k.clone(), yaml_to_value(v))).collect())
        .unwrap_or_default();

    let roles = raw
        .roles
        .unwrap_or_default()
        .into_iter()
        .map(convert_role_ref)
        .collect();

    Ok(Play {
        name: raw.name.unwrap_or_default(),
        source_file: source_file.to_string(),
        hosts,
        vars,
        gather_facts: raw.gather_facts,
        pre_tasks: convert_task_list(raw.pre_tasks, source_file)?,
        roles,
        tasks: convert_task_list(raw.tasks, source_file)?,
        post_tasks: convert_task_list(raw.post_tasks, source_file)?,
        handlers: convert_handlers(raw.handlers, source_file)?,
    })
}

fn convert_role_ref(raw: RawRoleRef) -> RoleRef {
    match raw {
        RawRoleRef::Name(role) => RoleRef {
            role,
            vars: HashMap::new(),
            tags: Vec::new(),
        },
        RawRoleRef::Full { role, vars, tags } => RoleRef {
            role,
            vars: vars.iter().map(|(k, v)| (k.clone(), yaml_to_value(v))).collect(),
            tags: tags.map(TagsValue::into_list).unwrap_or_default(),
        },
    }
}

fn convert_task_list(
    raw: Option<Vec<RawTask>>,
    source_file: &str,
) -> Result<Vec<TaskOrBlock>, NexusError> {
    raw.unwrap_or_default()
        .into_iter()
        .map(|t| convert_task_or_block(t, source_file))
        .collect()
}

fn convert_handlers(raw: Option<Vec<RawTask>>, source_file: &str) -> Result<Vec<Task>, NexusError> {
    raw.unwrap_or_default()
        .into_iter()
        .map(|raw| {
            if raw.block.is_some() {
                return Err(ParseError::new(
                    ParseErrorKind::InvalidValue,
                    format!(
                        "Handler '{}' cannot be a block",
                        raw.name.as_deref().unwrap_or("unnamed")
                    ),
                )
                .in_file(source_file)
                .into());
            }
            convert_task(raw, source_file)
        })
        .collect()
}

/// Convert RawTask to either Task or Block
fn convert_task_or_block(raw: RawTask, source_file: &str) -> Result<TaskOrBlock, NexusError> {
    if raw.block.is_some() {
        return Ok(TaskOrBlock::block(convert_block(raw, source_file)?));
    }
    if raw.rescue.is_some() || raw.always.is_some() {
        return Err(ParseError::new(
            ParseErrorKind::MissingField,
            "'rescue' and 'always' are only allowed together with 'block'",
        )
        .in_file(source_file)
        .with_suggestion("Put the tasks under a 'block:' key")
        .into());
    }
    Ok(TaskOrBlock::task(convert_task(raw, source_file)?))
}

fn convert_block(raw: RawTask, source_file: &str) -> Result<Block, NexusError> {
    Ok(Block {
        name: raw.name,
        block: convert_task_list(raw.block, source_file)?,
        rescue: convert_task_list(raw.rescue, source_file)?,
        always: convert_task_list(raw.always, source_file)?,
        when: raw.when.as_ref().map(condition_text),
        tags: raw.tags.map(TagsValue::into_list).unwrap_or_default(),
        role: None,
    })
}

fn convert_task(raw: RawTask, source_file: &str) -> Result<Task, NexusError> {
    let name = raw.name.unwrap_or_default();

    let (action, value) = raw
        .rest
        .iter()
        .filter_map(|(k, v)| k.as_str().map(|k| (k, v)))
        .find(|(k, _)| !TASK_KEYWORDS.contains(k))
        .ok_or_else(|| {
            let label = if name.is_empty() { "unnamed task" } else { name.as_str() };
            NexusError::from(
                ParseError::new(
                    ParseErrorKind::MissingField,
                    format!("Task '{}' has no action", label),
                )
                .in_file(source_file)
                .with_suggestion("Add a module key, e.g. 'command: echo hello'"),
            )
        })?;

    let mut task = Task::new(name.clone(), action);

    match value {
        YamlValue::Mapping(map) => task.args.extend(mapping_to_args(map)),
        YamlValue::Null => {}
        scalar => {
            task.args.insert("_raw_params".to_string(), yaml_to_value(scalar));
        }
    }
    if let Some(YamlValue::Mapping(extra)) = raw.rest.get("args") {
        task.args.extend(mapping_to_args(extra));
    }

    task.tags = raw.tags.map(TagsValue::into_list).unwrap_or_default();
    task.notify = raw.notify.map(TagsValue::into_list).unwrap_or_default();
    task.when = raw.when.as_ref().map(condition_text);
    Ok(task)
}

fn mapping_to_args(map: &Mapping) -> impl Iterator<Item = (String, Value)> + '_ {
    map.iter()
        .filter_map(|(k, v)| k.as_str().map(|key| (key.to_string(), yaml_to_value(v))))
}

/// `when` may be a string, a bool, or a list of conditions joined with `and`
fn condition_text(when: &YamlValue) -> String {
    match when {
        YamlValue::String(s) => s.clone(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Sequence(items) => items
            .iter()
            .map(condition_text)
            .collect::<Vec<_>>()
            .join(" and "),
        other => yaml_to_value(other).to_string(),
    }
}

pub(crate) fn yaml_to_value(yaml: &YamlValue) -> Value {
    match yaml {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(*b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                Value::Int(0)
            }
        }
        YamlValue::String(s) => Value::String(s.clone()),
        YamlValue::Sequence(seq) => Value::List(seq.iter().map(yaml_to_value).collect()),
        YamlValue::Mapping(map) => Value::Dict(mapping_to_args(map).collect()),
        YamlValue::Tagged(tagged) => yaml_to_value(&tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn only_task(entry: &TaskOrBlock) -> &Task {
        match entry {
            TaskOrBlock::Task(task) => task,
            TaskOrBlock::Block(_) => panic!("Expected Task, got Block"),
        }
    }

    fn only_block(entry: &TaskOrBlock) -> &Block {
        match entry {
            TaskOrBlock::Block(block) => block,
            TaskOrBlock::Task(_) => panic!("Expected Block, got Task"),
        }
    }

    #[test]
    fn test_parse_single_play() {
        let yaml = r#"
name: web
hosts: webservers
gather_facts: false

tasks:
  - name: Install nginx
    package:
      name: nginx
      state: present
    tags: [web, packages]
  - command: echo hello
"#;

        let playbook = parse_playbook(yaml, "site.yml".to_string()).unwrap();
        assert_eq!(playbook.plays.len(), 1);

        let play = &playbook.plays[0];
        assert_eq!(play.name, "web");
        assert_eq!(play.hosts, HostPattern::Group("webservers".to_string()));
        assert_eq!(play.gather_facts, Some(false));
        assert_eq!(play.source_file, "site.yml");

        let install = only_task(&play.tasks[0]);
        assert_eq!(install.action, "package");
        assert_eq!(install.args.get("name"), Some(&Value::from("nginx")));
        assert_eq!(install.tags, vec!["web", "packages"]);

        let echo = only_task(&play.tasks[1]);
        assert_eq!(echo.get_name(), "command");
        assert_eq!(echo.args.get("_raw_params"), Some(&Value::from("echo hello")));
    }

    #[test]
    fn test_parse_play_list_with_sections() {
        let yaml = r#"
- hosts: all
  pre_tasks:
    - debug: msg=pre
  roles:
    - common
    - role: web
      tags: web
  tasks:
    - name: main
      command: /bin/true
  post_tasks:
    - debug: msg=post
  handlers:
    - name: restart nginx
      service: name=nginx state=restarted
- name: second
  hosts: db:&prod
  tasks: []
"#;

        let playbook = parse_playbook(yaml, "site.yml".to_string()).unwrap();
        assert_eq!(playbook.plays.len(), 2);

        let first = &playbook.plays[0];
        assert_eq!(first.gather_facts, None);
        assert_eq!(first.pre_tasks.len(), 1);
        assert_eq!(first.post_tasks.len(), 1);
        assert_eq!(first.roles.len(), 2);
        assert_eq!(first.roles[0].role, "common");
        assert_eq!(first.roles[1].tags, vec!["web"]);
        assert_eq!(first.handlers[0].name, "restart nginx");

        assert_eq!(playbook.plays[1].hosts, HostPattern::Pattern("db:&prod".to_string()));
        assert_eq!(playbook.task_count(), 3);
    }

    #[test]
    fn test_parse_nested_blocks() {
        let yaml = r#"
hosts: all
tasks:
  - name: outer
    tags: deploy
    when: deploy_enabled
    block:
      - command: step one
      - block:
          - command: inner
        rescue:
          - command: inner rescue
    rescue:
      - debug: msg=recover
    always:
      - debug: msg=cleanup
"#;

        let playbook = parse_playbook(yaml, "site.yml".to_string()).unwrap();
        let outer = only_block(&playbook.plays[0].tasks[0]);

        assert_eq!(outer.name.as_deref(), Some("outer"));
        assert_eq!(outer.tags, vec!["deploy"]);
        assert_eq!(outer.when.as_deref(), Some("deploy_enabled"));
        assert_eq!(outer.block.len(), 2);
        assert_eq!(outer.rescue.len(), 1);
        assert_eq!(outer.always.len(), 1);

        let inner = only_block(&outer.block[1]);
        assert_eq!(inner.rescue.len(), 1);
        assert_eq!(outer.task_count(), 5);
    }

    #[test]
    fn test_keywords_are_not_actions() {
        let yaml = r#"
hosts: all
tasks:
  - name: keyword first
    register: out
    ignore_errors: true
    shell: uptime
    args:
      chdir: /tmp
    when:
      - a
      - b
    notify: restart
"#;

        let playbook = parse_playbook(yaml, "site.yml".to_string()).unwrap();
        let task = only_task(&playbook.plays[0].tasks[0]);
        assert_eq!(task.action, "shell");
        assert_eq!(task.args.get("chdir"), Some(&Value::from("/tmp")));
        assert_eq!(task.when.as_deref(), Some("a and b"));
        assert_eq!(task.notify, vec!["restart"]);
    }

    #[test]
    fn test_task_without_action() {
        let yaml = r#"
hosts: all
tasks:
  - name: nothing to do
    register: out
"#;

        let err = parse_playbook(yaml, "site.yml".to_string()).unwrap_err();
        match err {
            NexusError::Parse(e) => {
                assert_eq!(e.kind, ParseErrorKind::MissingField);
                assert!(e.message.contains("nothing to do"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_rescue_without_block() {
        let yaml = r#"
hosts: all
tasks:
  - rescue:
      - command: x
"#;
        assert!(parse_playbook(yaml, "site.yml".to_string()).is_err());
    }

    #[test]
    fn test_invalid_yaml_has_location() {
        let yaml = "hosts: all\ntasks:\n  - name: x\n    command: [unclosed\n";
        let err = parse_playbook(yaml, "broken.yml".to_string()).unwrap_err();
        match err {
            NexusError::Parse(e) => {
                assert_eq!(e.kind, ParseErrorKind::InvalidYaml);
                assert_eq!(e.file.as_deref(), Some("broken.yml"));
                assert!(e.line.is_some());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_scalar_playbook_rejected() {
        let err = parse_playbook("just a string", "x.yml".to_string()).unwrap_err();
        assert!(matches!(err, NexusError::Parse(ref e) if e.kind == ParseErrorKind::InvalidValue));
        assert!(parse_playbook("", "empty.yml".to_string()).unwrap().plays.is_empty());
    }

    #[test]
    fn test_parse_task_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.yml");
        std::fs::write(&path, "- command: one\n- block:\n    - command: two\n").unwrap();

        let tasks = parse_task_file(&path).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[1].is_block());

        assert!(matches!(
            parse_task_file(&dir.path().join("missing.yml")),
            Err(NexusError::Io { .. })
        ));
    }

    #[test]
    fn test_handlers_cannot_be_blocks() {
        let err = parse_handler_list("- name: h\n  block:\n    - command: x\n", "handlers.yml");
        assert!(err.is_err());
    }
}
