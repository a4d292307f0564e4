// Fact cache and fact-gathering policy
//
// The cache is what the variable layer keeps between plays; the iterator
// only asks whether a host is present in it. The policy decides whether
// the implicit setup task is injected when a host starts a play.

use std::collections::HashMap;
use std::str::FromStr;

use parking_lot::RwLock;

use crate::parser::ast::Value;

/// Facts cached per host name
#[derive(Debug, Default)]
pub struct FactCache {
    hosts: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl FactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any facts are cached for `host`
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.read().contains_key(host)
    }

    /// Merge gathered facts into the host's entry, creating it if needed
    pub fn update_facts(&self, host: &str, new_facts: HashMap<String, Value>) {
        self.hosts
            .write()
            .entry(host.to_string())
            .or_default()
            .extend(new_facts);
    }
}

/// When to inject the implicit setup task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatherPolicy {
    /// Gather unless the play turns gathering off, and only for hosts
    /// that have not gathered yet
    Smart,
    /// Gather only when the play asks for it
    Explicit,
    /// Gather unless the play turns gathering off
    #[default]
    Implicit,
}

impl GatherPolicy {
    /// Name of the environment variable consulted by `from_env`
    pub const ENV_VAR: &'static str = "NEXUS_GATHERING";

    /// Read the policy from NEXUS_GATHERING, falling back to the default
    pub fn from_env() -> Self {
        std::env::var(Self::ENV_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// `play_gather_facts` is the play's tri-state setting
    pub fn should_gather(&self, play_gather_facts: Option<bool>, already_gathered: bool) -> bool {
        let implied = play_gather_facts.unwrap_or(true);
        match self {
            GatherPolicy::Smart => implied && !already_gathered,
            GatherPolicy::Explicit => play_gather_facts == Some(true),
            GatherPolicy::Implicit => implied,
        }
    }
}

impl FromStr for GatherPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "smart" => Ok(GatherPolicy::Smart),
            "explicit" => Ok(GatherPolicy::Explicit),
            "implicit" => Ok(GatherPolicy::Implicit),
            other => Err(format!(
                "unknown gathering policy '{}' (expected smart, explicit or implicit)",
                other
            )),
        }
    }
}

impl std::fmt::Display for GatherPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatherPolicy::Smart => "smart",
            GatherPolicy::Explicit => "explicit",
            GatherPolicy::Implicit => "implicit",
        };
        write!(f, "{}", s)
    }
}
