// Per-host cursor state for the play iterator
//
// Every host owns a tree of HostState nodes: the root walks the play's
// top-level blocks, and a child node exists while the host is inside a
// block nested in one of the parent's sections. Nodes live in a StateArena
// and refer to their children by StateId, so copying a host's tree for a
// peek is a flat slot copy rather than a recursive object clone.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::parser::ast::{Block, Section};

/// Which part of the block tree a host is walking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Setup,
    Main,
    Rescue,
    Always,
    Complete,
}

impl RunState {
    /// The block section walked in this state, if any
    pub fn section(&self) -> Option<Section> {
        match self {
            RunState::Main => Some(Section::Main),
            RunState::Rescue => Some(Section::Rescue),
            RunState::Always => Some(Section::Always),
            RunState::Setup | RunState::Complete => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Setup => "SETUP",
            RunState::Main => "MAIN",
            RunState::Rescue => "RESCUE",
            RunState::Always => "ALWAYS",
            RunState::Complete => "COMPLETE",
        };
        write!(f, "{}", s)
    }
}

/// A section that can record a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedSection {
    Setup,
    Main,
    Rescue,
    Always,
}

impl FailedSection {
    const ALL: [FailedSection; 4] = [
        FailedSection::Setup,
        FailedSection::Main,
        FailedSection::Rescue,
        FailedSection::Always,
    ];

    fn bit(self) -> u8 {
        match self {
            FailedSection::Setup => 1,
            FailedSection::Main => 1 << 1,
            FailedSection::Rescue => 1 << 2,
            FailedSection::Always => 1 << 3,
        }
    }
}

impl From<Section> for FailedSection {
    fn from(section: Section) -> Self {
        match section {
            Section::Main => FailedSection::Main,
            Section::Rescue => FailedSection::Rescue,
            Section::Always => FailedSection::Always,
        }
    }
}

/// Set of sections that have recorded a failure. Only ever grows, except
/// when a rescue section absorbs the failure and the set is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailState {
    bits: u8,
}

impl FailState {
    pub const NONE: FailState = FailState { bits: 0 };

    pub fn insert(&mut self, section: FailedSection) {
        self.bits |= section.bit();
    }

    pub fn contains(&self, section: FailedSection) -> bool {
        self.bits & section.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    pub fn sections(&self) -> Vec<FailedSection> {
        FailedSection::ALL
            .iter()
            .copied()
            .filter(|s| self.contains(*s))
            .collect()
    }
}

impl fmt::Display for FailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names: Vec<&str> = self
            .sections()
            .into_iter()
            .map(|s| match s {
                FailedSection::Setup => "SETUP",
                FailedSection::Main => "MAIN",
                FailedSection::Rescue => "RESCUE",
                FailedSection::Always => "ALWAYS",
            })
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

impl Serialize for FailState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.sections().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("block index {index} is past the last block ({len} blocks)")]
    NoMoreBlocks { index: usize, len: usize },

    #[error("state slot {0} is empty")]
    MissingState(usize),
}

/// Index of a HostState inside a StateArena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(usize);

impl StateId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One level of a host's position in the block tree
#[derive(Debug, Clone)]
pub struct HostState {
    /// Blocks walked at this level; a child state holds exactly one
    pub blocks: Arc<Vec<Arc<Block>>>,
    pub block_index: usize,
    pub main_task_index: usize,
    pub rescue_task_index: usize,
    pub always_task_index: usize,
    /// Role of the most recently yielded task
    pub current_role: Option<String>,
    pub run_state: RunState,
    pub fail_state: FailState,
    /// Set while the implicit setup task is outstanding
    pub pending_setup: bool,
    /// Set once start-at-task has positioned this host
    pub did_start_at_task: bool,
    pub main_child_state: Option<StateId>,
    pub rescue_child_state: Option<StateId>,
    pub always_child_state: Option<StateId>,
}

impl HostState {
    pub fn new(blocks: Arc<Vec<Arc<Block>>>) -> Self {
        HostState {
            blocks,
            block_index: 0,
            main_task_index: 0,
            rescue_task_index: 0,
            always_task_index: 0,
            current_role: None,
            run_state: RunState::Setup,
            fail_state: FailState::NONE,
            pending_setup: false,
            did_start_at_task: false,
            main_child_state: None,
            rescue_child_state: None,
            always_child_state: None,
        }
    }

    /// State for walking a single nested block
    pub fn for_nested_block(block: Arc<Block>, current_role: Option<String>) -> Self {
        let mut state = HostState::new(Arc::new(vec![block]));
        state.run_state = RunState::Main;
        state.current_role = current_role;
        state
    }

    pub fn current_block(&self) -> Result<&Arc<Block>, StateError> {
        self.blocks.get(self.block_index).ok_or(StateError::NoMoreBlocks {
            index: self.block_index,
            len: self.blocks.len(),
        })
    }

    /// Mutable access to the current block, copied first if it is shared
    /// with other states
    pub fn current_block_mut(&mut self) -> Result<&mut Block, StateError> {
        let (index, len) = (self.block_index, self.blocks.len());
        let blocks = Arc::make_mut(&mut self.blocks);
        blocks
            .get_mut(index)
            .map(Arc::make_mut)
            .ok_or(StateError::NoMoreBlocks { index, len })
    }

    pub fn task_index(&self, section: Section) -> usize {
        match section {
            Section::Main => self.main_task_index,
            Section::Rescue => self.rescue_task_index,
            Section::Always => self.always_task_index,
        }
    }

    pub fn task_index_mut(&mut self, section: Section) -> &mut usize {
        match section {
            Section::Main => &mut self.main_task_index,
            Section::Rescue => &mut self.rescue_task_index,
            Section::Always => &mut self.always_task_index,
        }
    }

    pub fn child_state(&self, section: Section) -> Option<StateId> {
        match section {
            Section::Main => self.main_child_state,
            Section::Rescue => self.rescue_child_state,
            Section::Always => self.always_child_state,
        }
    }

    pub fn child_state_mut(&mut self, section: Section) -> &mut Option<StateId> {
        match section {
            Section::Main => &mut self.main_child_state,
            Section::Rescue => &mut self.rescue_child_state,
            Section::Always => &mut self.always_child_state,
        }
    }

    /// The child for the section currently being walked
    pub fn active_child(&self) -> Option<StateId> {
        self.run_state.section().and_then(|s| self.child_state(s))
    }

    fn children(&self) -> impl Iterator<Item = StateId> {
        [self.main_child_state, self.rescue_child_state, self.always_child_state]
            .into_iter()
            .flatten()
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HOST STATE: block={}, task={}, rescue={}, always={}, role={}, run_state={}, fail_state={}, pending_setup={}, did_start_at_task={}",
            self.block_index,
            self.main_task_index,
            self.rescue_task_index,
            self.always_task_index,
            self.current_role.as_deref().unwrap_or("-"),
            self.run_state,
            self.fail_state,
            self.pending_setup,
            self.did_start_at_task,
        )
    }
}

/// Slot storage for HostState trees
#[derive(Debug, Clone, Default)]
pub struct StateArena {
    slots: Vec<Option<HostState>>,
    free: Vec<usize>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: HostState) -> StateId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(state);
                StateId(index)
            }
            None => {
                self.slots.push(Some(state));
                StateId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: StateId) -> Result<&HostState, StateError> {
        self.slots
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(StateError::MissingState(id.0))
    }

    pub fn get_mut(&mut self, id: StateId) -> Result<&mut HostState, StateError> {
        self.slots
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(StateError::MissingState(id.0))
    }

    /// Deep copy of the tree rooted at `id`; the copy shares no slots with
    /// the original
    pub fn clone_subtree(&mut self, id: StateId) -> Result<StateId, StateError> {
        let mut state = self.get(id)?.clone();
        for section in [Section::Main, Section::Rescue, Section::Always] {
            if let Some(child) = state.child_state(section) {
                *state.child_state_mut(section) = Some(self.clone_subtree(child)?);
            }
        }
        Ok(self.insert(state))
    }

    /// Free the tree rooted at `id`
    pub fn release(&mut self, id: StateId) {
        let Some(state) = self.slots.get_mut(id.0).and_then(|slot| slot.take()) else {
            return;
        };
        for child in state.children() {
            self.release(child);
        }
        self.free.push(id.0);
    }

    /// Number of live states
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the tree rooted at `id` out into a standalone snapshot
    pub fn snapshot(&self, id: StateId) -> Result<HostSnapshot, StateError> {
        let mut arena = StateArena::new();
        let root_id = self.copy_into(id, &mut arena)?;
        let root = arena.get(root_id)?.clone();
        Ok(HostSnapshot { arena, root })
    }

    fn copy_into(&self, id: StateId, target: &mut StateArena) -> Result<StateId, StateError> {
        let mut state = self.get(id)?.clone();
        for section in [Section::Main, Section::Rescue, Section::Always] {
            if let Some(child) = state.child_state(section) {
                *state.child_state_mut(section) = Some(self.copy_into(child, target)?);
            }
        }
        Ok(target.insert(state))
    }
}

/// A detached copy of one host's state tree, safe to hold while the
/// iterator keeps advancing. Child ids resolve against the copied arena.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    arena: StateArena,
    root: HostState,
}

impl HostSnapshot {
    /// Root of the tree
    pub fn state(&self) -> &HostState {
        &self.root
    }

    pub fn run_state(&self) -> RunState {
        self.root.run_state
    }

    pub fn fail_state(&self) -> FailState {
        self.root.fail_state
    }

    /// Child state of the root for `section`, as its own snapshot
    pub fn child(&self, section: Section) -> Option<HostSnapshot> {
        let child = self.arena.get(self.root.child_state(section)?).ok()?;
        Some(HostSnapshot {
            arena: self.arena.clone(),
            root: child.clone(),
        })
    }

    /// Root followed by every active descendant
    fn active_chain(&self) -> impl Iterator<Item = &HostState> {
        std::iter::successors(Some(&self.root), move |state| {
            state.active_child().and_then(|id| self.arena.get(id).ok())
        })
    }

    /// Deepest state reachable through active children
    pub fn active(&self) -> &HostState {
        self.active_chain().last().unwrap_or(&self.root)
    }

    /// Depth of the active chain; 0 when no child is active
    pub fn depth(&self) -> usize {
        self.active_chain().count() - 1
    }
}

impl fmt::Display for HostSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for child in self.active_chain().skip(1) {
            write!(f, "\n  child: {}", child)?;
        }
        Ok(())
    }
}
