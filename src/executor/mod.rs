// Executor module - per-host task iteration for a play

pub mod context;
pub mod facts;
pub mod host_state;
pub mod iterator;
pub mod roles;
pub mod tags;

pub use context::PlayContext;
pub use facts::{FactCache, GatherPolicy};
pub use host_state::{
    FailState, FailedSection, HostSnapshot, HostState, RunState, StateArena, StateError, StateId,
};
pub use iterator::PlayIterator;
pub use roles::RoleTracker;
pub use tags::{inherit_tags, TagFilter};
