// Inventory module for host management

mod static_inv;

pub use static_inv::*;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashSet;

use crate::output::errors::NexusError;
use crate::parser::ast::{HostPattern, Value};

/// A single host in the inventory
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub vars: HashMap<String, Value>,
    pub groups: Vec<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Host {
            address: name.clone(),
            name,
            vars: HashMap::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// A group of hosts
#[derive(Debug, Clone, Default)]
pub struct HostGroup {
    pub name: String,
    pub hosts: Vec<String>,
    pub children: Vec<String>,
    pub vars: HashMap<String, Value>,
}

impl HostGroup {
    pub fn new(name: impl Into<String>) -> Self {
        HostGroup {
            name: name.into(),
            hosts: Vec::new(),
            children: Vec::new(),
            vars: HashMap::new(),
        }
    }
}

/// Names of hosts whose facts have been gathered.
///
/// Clones share the same set, so the flag set by one play iterator is seen
/// by the next one built from the same inventory.
#[derive(Debug, Clone, Default)]
pub struct FactsGathered(Arc<DashSet<String>>);

impl FactsGathered {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(host)
    }

    pub fn insert(&self, host: &str) {
        self.0.insert(host.to_string());
    }

    pub fn remove(&self, host: &str) {
        self.0.remove(host);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The complete inventory
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub hosts: HashMap<String, Host>,
    pub groups: HashMap<String, HostGroup>,
    facts_gathered: FactsGathered,
}

impl Inventory {
    pub fn new() -> Self {
        let mut inv = Inventory::default();
        // Always have an "all" group
        inv.groups.insert("all".to_string(), HostGroup::new("all"));
        inv
    }

    /// Load inventory from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, NexusError> {
        parse_inventory_file(path)
    }

    /// Create inventory from CLI hosts string (comma-separated)
    ///
    /// Example: "web1,web2,192.168.1.10"
    pub fn from_cli_hosts(hosts_str: &str) -> Self {
        let mut inv = Inventory::new();

        for host_str in hosts_str.split(',') {
            let host_str = host_str.trim();
            if host_str.is_empty() {
                continue;
            }
            inv.add_host(Host::new(host_str));
        }

        inv
    }

    /// Shared set of hosts that already gathered facts
    pub fn facts_gathered(&self) -> FactsGathered {
        self.facts_gathered.clone()
    }
}

impl Inventory {
    /// Add a host to the inventory
    pub fn add_host(&mut self, host: Host) {
        let name = host.name.clone();

        if let Some(all) = self.groups.get_mut("all") {
            if !all.hosts.contains(&name) {
                all.hosts.push(name.clone());
            }
        }

        for group_name in &host.groups {
            let group = self
                .groups
                .entry(group_name.clone())
                .or_insert_with(|| HostGroup::new(group_name));
            if !group.hosts.contains(&name) {
                group.hosts.push(name.clone());
            }
        }

        self.hosts.insert(name, host);
    }

    /// Add a group to the inventory
    pub fn add_group(&mut self, group: HostGroup) {
        self.groups.insert(group.name.clone(), group);
    }

    /// Hosts matching a pattern, sorted by name
    pub fn get_hosts(&self, pattern: &HostPattern) -> Vec<&Host> {
        let mut hosts = match pattern {
            HostPattern::All => self.hosts.values().collect(),
            HostPattern::Group(name) => self.resolve(name),
            HostPattern::Pattern(pat) => self.match_pattern(pat),
            HostPattern::Localhost => ["localhost", "127.0.0.1"]
                .iter()
                .find_map(|name| self.hosts.get(*name))
                .into_iter()
                .collect(),
        };
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    /// Get a single host by name
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// A group name expands to its hosts, otherwise a host name to itself
    fn resolve(&self, name: &str) -> Vec<&Host> {
        if let Some(group) = self.groups.get(name) {
            self.expand_group(group, &mut HashSet::new())
        } else {
            self.hosts.get(name).into_iter().collect()
        }
    }

    /// Expand a group to its hosts (including children)
    fn expand_group<'a>(&'a self, group: &HostGroup, visited: &mut HashSet<String>) -> Vec<&'a Host> {
        if !visited.insert(group.name.clone()) {
            return Vec::new();
        }

        let mut hosts: Vec<&Host> = group
            .hosts
            .iter()
            .filter_map(|name| self.hosts.get(name))
            .collect();

        for child_name in &group.children {
            if let Some(child) = self.groups.get(child_name) {
                hosts.extend(self.expand_group(child, visited));
            }
        }

        let mut seen = HashSet::new();
        hosts.retain(|h| seen.insert(h.name.clone()));
        hosts
    }

    /// Match hosts against a compound pattern
    fn match_pattern(&self, pattern: &str) -> Vec<&Host> {
        // - "webservers:dbservers" (union)
        // - "webservers:&prod" (intersection)
        // - "webservers:!staging" (exclusion)
        let mut result: Vec<&Host> = Vec::new();

        for part in pattern.split(':') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some(name) = part.strip_prefix('&') {
                let keep: HashSet<&str> = self.resolve(name).into_iter().map(|h| h.name.as_str()).collect();
                result.retain(|h| keep.contains(h.name.as_str()));
            } else if let Some(name) = part.strip_prefix('!') {
                let drop: HashSet<&str> = self.resolve(name).into_iter().map(|h| h.name.as_str()).collect();
                result.retain(|h| !drop.contains(h.name.as_str()));
            } else {
                for host in self.resolve(part) {
                    if !result.iter().any(|h| h.name == host.name) {
                        result.push(host);
                    }
                }
            }
        }

        result
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}
