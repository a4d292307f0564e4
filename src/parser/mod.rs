// Parser module for playbooks, task files and roles

pub mod ast;
pub mod roles;
pub mod yaml;

pub use ast::*;
pub use roles::{load_role, RoleResolver};
pub use yaml::{parse_playbook, parse_playbook_file, parse_task_file, parse_task_list};
