// Role loader
//
// Roles follow a conventional directory structure:
//   roles/
//     rolename/
//       tasks/
//         main.yml          # Main task list
//       handlers/
//         main.yml          # Handler definitions

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::ast::*;
use super::yaml::{parse_handler_list, parse_task_list};
use crate::output::errors::NexusError;

/// Role search paths
#[derive(Debug, Clone)]
pub struct RoleResolver {
    /// Paths to search for roles (in order of priority)
    search_paths: Vec<PathBuf>,
    /// Cache of loaded roles
    loaded_roles: HashMap<String, Role>,
}

impl RoleResolver {
    /// Create a new role resolver searching `./roles`
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("./roles")],
            loaded_roles: HashMap::new(),
        }
    }

    /// Add a search path (lowest priority)
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    /// Search `<playbook dir>/roles` before everything else
    pub fn add_playbook_relative_path(&mut self, playbook_path: &Path) {
        if let Some(parent) = playbook_path.parent() {
            let roles_dir = parent.join("roles");
            if !self.search_paths.contains(&roles_dir) {
                self.search_paths.insert(0, roles_dir);
            }
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Resolve a role by name, loading it if necessary
    pub fn resolve(&mut self, role_name: &str) -> Result<&Role, NexusError> {
        if !self.loaded_roles.contains_key(role_name) {
            let role_path = self.find_role_path(role_name)?;
            let role = load_role(&role_path, role_name)?;
            tracing::debug!(role = role_name, path = %role_path.display(), "loaded role");
            self.loaded_roles.insert(role_name.to_string(), role);
        }

        self.loaded_roles
            .get(role_name)
            .ok_or_else(|| self.not_found(role_name))
    }

    /// Resolve every role a play references, in play order
    pub fn resolve_play_roles(&mut self, play: &Play) -> Result<Vec<Role>, NexusError> {
        play.roles
            .iter()
            .map(|role_ref| self.resolve(&role_ref.role).cloned())
            .collect()
    }

    /// Find the path to a role directory
    fn find_role_path(&self, role_name: &str) -> Result<PathBuf, NexusError> {
        // A role may be named by its path
        let direct_path = PathBuf::from(role_name);
        if role_name.contains('/') && direct_path.is_dir() {
            return Ok(direct_path);
        }

        self.search_paths
            .iter()
            .map(|search_path| expand_tilde(search_path).join(role_name))
            .find(|role_dir| role_dir.is_dir())
            .ok_or_else(|| self.not_found(role_name))
    }

    fn not_found(&self, role_name: &str) -> NexusError {
        let searched: Vec<String> = self
            .search_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        NexusError::Role {
            role: role_name.to_string(),
            message: format!(
                "Role '{}' not found (searched: {})",
                role_name,
                searched.join(", ")
            ),
            suggestion: Some("Create the role directory or check the name".to_string()),
        }
    }
}

impl Default for RoleResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Load a role from a directory
pub fn load_role(role_path: &Path, role_name: &str) -> Result<Role, NexusError> {
    let tasks = match read_role_file(role_path, "tasks")? {
        Some((content, file)) => parse_task_list(&content, &file)?,
        None => Vec::new(),
    };

    let handlers = match read_role_file(role_path, "handlers")? {
        Some((content, file)) => parse_handler_list(&content, &file)?,
        None => Vec::new(),
    };

    Ok(Role {
        name: role_name.to_string(),
        path: role_path.to_string_lossy().to_string(),
        tasks,
        handlers,
    })
}

/// Read `<role>/<subdir>/main.yml` if it exists
fn read_role_file(role_path: &Path, subdir: &str) -> Result<Option<(String, String)>, NexusError> {
    let file = role_path.join(subdir).join("main.yml");
    if !file.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&file).map_err(|e| NexusError::Io {
        message: format!("Failed to read role {}: {}", subdir, e),
        path: Some(file.clone()),
    })?;

    Ok(Some((content, file.to_string_lossy().to_string())))
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
