// Static YAML inventory parser
use std::path::Path;

use serde_yaml::{Mapping, Value as YamlValue};

use super::{Host, HostGroup, Inventory};
use crate::output::errors::NexusError;
use crate::parser::yaml::yaml_to_value;

/// Parse inventory from a YAML file
pub fn parse_inventory_file(path: &Path) -> Result<Inventory, NexusError> {
    let content = std::fs::read_to_string(path).map_err(|e| NexusError::Io {
        message: format!("Failed to read inventory file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    parse_inventory(&content)
}

/// Parse inventory from a YAML string.
///
/// Accepts the Ansible layout (`all:` or top-level group names, each with
/// `hosts`/`children`/`vars`) and the flat layout (top-level `hosts:` list
/// plus a `groups:` mapping).
pub fn parse_inventory(content: &str) -> Result<Inventory, NexusError> {
    let yaml: YamlValue = serde_yaml::from_str(content).map_err(|e| NexusError::Inventory {
        message: format!("Invalid inventory YAML: {}", e),
        suggestion: Some("Check inventory file syntax".to_string()),
    })?;

    let Some(map) = yaml.as_mapping() else {
        return Err(NexusError::Inventory {
            message: "Inventory must be a YAML mapping".to_string(),
            suggestion: Some("Start with 'all:' or 'hosts:'".to_string()),
        });
    };

    let mut inventory = Inventory::new();
    let flat = !map.contains_key("all") && (map.contains_key("hosts") || map.contains_key("groups"));

    if flat {
        if let Some(hosts) = map.get("hosts") {
            load_hosts(&mut inventory, None, hosts)?;
        }
        if let Some(groups) = map.get("groups").and_then(YamlValue::as_mapping) {
            for (name, body) in string_entries(groups) {
                load_group(&mut inventory, name, body)?;
            }
        }
    } else {
        for (name, body) in string_entries(map) {
            load_group(&mut inventory, name, body)?;
        }
    }

    Ok(inventory)
}

/// Entries of a mapping whose keys are strings
fn string_entries(map: &Mapping) -> impl Iterator<Item = (&str, &YamlValue)> {
    map.iter().filter_map(|(k, v)| k.as_str().map(|k| (k, v)))
}

/// Load one group body; `children` may nest bodies or just name groups
fn load_group(inventory: &mut Inventory, name: &str, body: &YamlValue) -> Result<(), NexusError> {
    if !inventory.groups.contains_key(name) {
        inventory.add_group(HostGroup::new(name));
    }

    // `group:` with nothing under it
    let Some(map) = body.as_mapping() else {
        return Ok(());
    };

    if let Some(hosts) = map.get("hosts") {
        load_hosts(inventory, Some(name), hosts)?;
    }

    if let Some(vars) = map.get("vars").and_then(YamlValue::as_mapping) {
        if let Some(group) = inventory.groups.get_mut(name) {
            group
                .vars
                .extend(string_entries(vars).map(|(k, v)| (k.to_string(), yaml_to_value(v))));
        }
    }

    match map.get("children") {
        Some(YamlValue::Mapping(children)) => {
            for (child, child_body) in string_entries(children) {
                add_child(inventory, name, child);
                load_group(inventory, child, child_body)?;
            }
        }
        Some(YamlValue::Sequence(children)) => {
            for child in children.iter().filter_map(YamlValue::as_str) {
                add_child(inventory, name, child);
            }
        }
        _ => {}
    }

    Ok(())
}

fn add_child(inventory: &mut Inventory, parent: &str, child: &str) {
    if let Some(group) = inventory.groups.get_mut(parent) {
        if !group.children.iter().any(|c| c == child) {
            group.children.push(child.to_string());
        }
    }
}

/// Load a `hosts:` section, either `name: {vars}` pairs or a list of names
/// and `{name: .., address: ..}` entries
fn load_hosts(inventory: &mut Inventory, group: Option<&str>, hosts: &YamlValue) -> Result<(), NexusError> {
    let mut loaded = Vec::new();

    match hosts {
        YamlValue::Null => {}
        YamlValue::Mapping(map) => {
            for (name, keys) in string_entries(map) {
                let mut host = Host::new(name);
                if let Some(keys) = keys.as_mapping() {
                    apply_host_keys(&mut host, keys);
                }
                loaded.push(host);
            }
        }
        YamlValue::Sequence(entries) => {
            for entry in entries {
                let host = match entry {
                    YamlValue::String(name) => Host::new(name),
                    YamlValue::Mapping(keys) => {
                        let name = keys.get("name").and_then(YamlValue::as_str).ok_or_else(|| {
                            NexusError::Inventory {
                                message: "Host entry without a 'name'".to_string(),
                                suggestion: Some("Use '- name: web1' or a plain host name".to_string()),
                            }
                        })?;
                        let mut host = Host::new(name);
                        apply_host_keys(&mut host, keys);
                        host
                    }
                    other => {
                        return Err(NexusError::Inventory {
                            message: format!("Unsupported host entry: {:?}", other),
                            suggestion: None,
                        })
                    }
                };
                loaded.push(host);
            }
        }
        other => {
            return Err(NexusError::Inventory {
                message: format!("'hosts' must be a mapping or a list, got {:?}", other),
                suggestion: None,
            })
        }
    }

    for mut host in loaded {
        if let Some(group) = group {
            if !host.groups.iter().any(|g| g == group) {
                host.groups.insert(0, group.to_string());
            }
        }
        merge_host(inventory, host);
    }

    Ok(())
}

/// Add a host, or fold its groups and vars into an existing entry when the
/// host is listed more than once
fn merge_host(inventory: &mut Inventory, host: Host) {
    let Some(existing) = inventory.hosts.get_mut(&host.name) else {
        inventory.add_host(host);
        return;
    };

    let new_groups: Vec<String> = host
        .groups
        .into_iter()
        .filter(|g| !existing.groups.contains(g))
        .collect();
    existing.groups.extend(new_groups.iter().cloned());
    if host.address != host.name {
        existing.address = host.address;
    }
    existing.vars.extend(host.vars);

    for group in new_groups {
        let entry = inventory
            .groups
            .entry(group.clone())
            .or_insert_with(|| HostGroup::new(group));
        if !entry.hosts.contains(&host.name) {
            entry.hosts.push(host.name.clone());
        }
    }
}

/// Connection keys set the address, `groups` adds memberships, anything
/// else is a host variable
fn apply_host_keys(host: &mut Host, keys: &Mapping) {
    for (key, value) in string_entries(keys) {
        match key {
            "name" => {}
            "address" | "ansible_host" | "host" => {
                if let Some(addr) = value.as_str() {
                    host.address = addr.to_string();
                }
            }
            "groups" => {
                let groups = value.as_sequence().into_iter().flatten().filter_map(YamlValue::as_str);
                host.groups.extend(groups.map(str::to_string));
            }
            _ => {
                host.vars.insert(key.to_string(), yaml_to_value(value));
            }
        }
    }
}
