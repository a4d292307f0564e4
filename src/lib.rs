// nexus-play - per-host task iteration for nexus playbooks
//
// Walks a play's blocks for every targeted host with block/rescue/always
// semantics, fact-gathering policy, start-at-task and tag selection, and
// dynamic task insertion.

pub mod executor;
pub mod inventory;
pub mod output;
pub mod parser;
pub mod plugins;

pub use executor::{GatherPolicy, HostSnapshot, PlayContext, PlayIterator, RunState};
pub use inventory::{Host, HostGroup, Inventory};
pub use output::{NexusError, PlayRecap, TaskStep};
pub use parser::{parse_playbook, parse_playbook_file, Playbook};

/// Version of the nexus-play crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{FactCache, GatherPolicy, PlayContext, PlayIterator, RoleTracker, TagFilter};
    pub use crate::inventory::{Host, Inventory};
    pub use crate::output::NexusError;
    pub use crate::parser::{parse_playbook, parse_playbook_file, Playbook, TaskOrBlock};
    pub use crate::plugins::{CallbackManager, CallbackPlugin};
}
