// Play iterator: hands out each host's next task
//
// The iterator owns one state tree per host and walks the play's blocks
// with block/rescue/always semantics. It is synchronous and holds no locks;
// callers that drive hosts from several tasks wrap it in a mutex.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::context::PlayContext;
use super::facts::{FactCache, GatherPolicy};
use super::host_state::{
    FailedSection, HostSnapshot, HostState, RunState, StateArena, StateError, StateId,
};
use super::roles::RoleTracker;
use crate::inventory::{FactsGathered, Inventory};
use crate::output::errors::NexusError;
use crate::parser::ast::{Block, Play, Role, Section, Task, TaskId, TaskOrBlock};
use crate::plugins::callbacks::CallbackManager;

/// Per-play iterator over every targeted host's tasks
pub struct PlayIterator {
    play_name: String,
    /// Tag-filtered top-level blocks shared by every host's initial state
    blocks: Arc<Vec<Arc<Block>>>,
    handlers: Vec<Arc<Task>>,
    arena: StateArena,
    host_states: HashMap<String, StateId>,
    gather_facts: Option<bool>,
    gather_policy: GatherPolicy,
    facts_gathered: FactsGathered,
    roles: Arc<RoleTracker>,
    callbacks: Arc<CallbackManager>,
    setup_task: Arc<Task>,
}

/// What a single pass over one state level decided
enum Move {
    /// A bookkeeping transition happened; evaluate again
    Again,
    /// Moved on to the next top-level block, dropping these child states
    NextBlock(Vec<StateId>),
    Finished,
    Yield(Arc<Task>),
    /// Continue walking an existing child state
    Resume(Section, StateId),
    /// Start walking a nested block in a new child state
    Enter(Section, Arc<Block>),
}

impl PlayIterator {
    /// Build the iterator for `play`.
    ///
    /// `roles` are the play's resolved roles in order. When the context
    /// carries a start-at-task directive every host is fast-forwarded to
    /// the first matching task, and the directive is cleared once matched.
    pub fn new(
        inventory: &Inventory,
        play: &Play,
        roles: &[Role],
        context: &mut PlayContext,
        fact_cache: &FactCache,
        role_tracker: Arc<RoleTracker>,
        callbacks: Arc<CallbackManager>,
    ) -> Result<Self, NexusError> {
        let blocks: Vec<Arc<Block>> = play
            .compile(roles)
            .iter()
            .map(|block| context.tag_filter.filter_block(block))
            .filter(Block::has_tasks)
            .map(Arc::new)
            .collect();

        let mut handlers: Vec<Arc<Task>> = play.handlers.iter().cloned().map(Arc::new).collect();
        handlers.extend(play.compile_roles_handlers(roles).into_iter().map(Arc::new));

        let mut iterator = PlayIterator {
            play_name: play.name.clone(),
            blocks: Arc::new(blocks),
            handlers,
            arena: StateArena::new(),
            host_states: HashMap::new(),
            gather_facts: play.gather_facts,
            gather_policy: context.gather_policy,
            facts_gathered: inventory.facts_gathered(),
            roles: role_tracker,
            callbacks,
            setup_task: Arc::new(Task::setup()),
        };

        let host_names: Vec<String> = inventory
            .get_hosts(&play.hosts)
            .iter()
            .map(|h| h.name.clone())
            .collect();

        for name in &host_names {
            if fact_cache.contains(name) {
                iterator.facts_gathered.insert(name);
            }
            let id = iterator.arena.insert(HostState::new(iterator.blocks.clone()));
            iterator.host_states.insert(name.clone(), id);
        }

        iterator
            .callbacks
            .on_iterator_start(&play.name, &host_names, iterator.blocks.len());

        if context.start_at_task.is_some() {
            let mut matched = false;
            for name in &host_names {
                matched |= iterator.fast_forward(name, context)?;
            }
            if matched {
                context.start_at_task = None;
            }
        }

        Ok(iterator)
    }

    pub fn play_name(&self) -> &str {
        &self.play_name
    }

    /// Top-level blocks after tag filtering
    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// Play handlers followed by role handlers
    pub fn handlers(&self) -> &[Arc<Task>] {
        &self.handlers
    }

    /// Hosts tracked by this iterator, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.host_states.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Snapshot of the host's persisted state
    pub fn get_host_state(&self, host: &str) -> Result<HostSnapshot, NexusError> {
        let id = self.state_id(host)?;
        Ok(self.arena.snapshot(id)?)
    }

    /// Snapshot of the deepest active state for the host
    pub fn get_active_state(&self, host: &str) -> Result<HostSnapshot, NexusError> {
        let id = self.active_id(self.state_id(host)?)?;
        Ok(self.arena.snapshot(id)?)
    }

    /// Next task for `host`, and the state the host would be in after it.
    ///
    /// A `None` task means the host has nothing left to run. With `peek`
    /// set nothing is persisted and no side effects happen, so repeated
    /// peeks return the same task.
    pub fn get_next_task_for_host(
        &mut self,
        host: &str,
        peek: bool,
    ) -> Result<(HostSnapshot, Option<Arc<Task>>), NexusError> {
        self.next_task(host, peek, false)
    }

    /// Record a failure for the host's currently running task
    pub fn mark_host_failed(&mut self, host: &str) -> Result<(), NexusError> {
        let root = self.state_id(host)?;
        let active = self.arena.get(self.active_id(root)?)?.run_state;
        set_failed_state(&mut self.arena, root)?;
        self.callbacks.on_host_failed(host, active);
        Ok(())
    }

    /// Hosts that finished all their work in a failed condition
    pub fn get_failed_hosts(&self) -> BTreeSet<String> {
        self.host_states
            .iter()
            .filter(|(_, id)| {
                self.arena
                    .get(**id)
                    .map(|s| s.run_state == RunState::Complete && !s.fail_state.is_empty())
                    .unwrap_or(false)
            })
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Whether the host is currently failed, looking through active nested
    /// blocks. A failure that a rescue section is still handling does not
    /// count.
    pub fn is_failed(&self, host: &str) -> Result<bool, NexusError> {
        let id = self.state_id(host)?;
        Ok(check_failed_state(&self.arena, Some(id))?)
    }

    /// Whether the host, or any active nested block, is running a rescue
    /// section
    pub fn is_any_block_rescuing(&self, host: &str) -> Result<bool, NexusError> {
        let mut current = Some(self.state_id(host)?);
        while let Some(id) = current {
            let state = self.arena.get(id)?;
            if state.run_state == RunState::Rescue {
                return Ok(true);
            }
            current = state.active_child();
        }
        Ok(false)
    }

    /// Find the authoritative task with the same identity as `task`,
    /// searching the host's blocks (including dynamically added tasks) and
    /// then the play's handlers.
    pub fn get_original_task(
        &self,
        host: &str,
        task: &Task,
    ) -> Result<Option<Arc<Task>>, NexusError> {
        let id = self.state_id(host)?;
        if let Some(found) = search_state(&self.arena, id, task.id)? {
            return Ok(Some(found));
        }
        if self.setup_task.id == task.id {
            return Ok(Some(self.setup_task.clone()));
        }
        Ok(self.handlers.iter().find(|h| h.id == task.id).cloned())
    }

    /// Section a task returned by `get_next_task_for_host` came from, given
    /// the snapshot returned with it. The implicit setup task is reported as
    /// SETUP even though the host has already moved on to MAIN.
    pub fn section_of(&self, snapshot: &HostSnapshot, task: &Task) -> RunState {
        if task.id == self.setup_task.id && snapshot.state().pending_setup {
            RunState::Setup
        } else {
            snapshot.active().run_state
        }
    }

    /// Splice `tasks` into the host's current section, right before the
    /// next task it would run. Ignored for hosts that failed outside of a
    /// rescue or always section.
    pub fn add_tasks(&mut self, host: &str, tasks: Vec<TaskOrBlock>) -> Result<(), NexusError> {
        let root = self.state_id(host)?;
        let count = tasks.len();
        if insert_tasks_into_state(&mut self.arena, root, &tasks)? {
            self.callbacks.on_tasks_added(host, count);
        }
        Ok(())
    }

    fn state_id(&self, host: &str) -> Result<StateId, NexusError> {
        self.host_states
            .get(host)
            .copied()
            .ok_or_else(|| NexusError::invalid_host(host))
    }

    fn active_id(&self, root: StateId) -> Result<StateId, StateError> {
        let mut id = root;
        while let Some(child) = self.arena.get(id)?.active_child() {
            id = child;
        }
        Ok(id)
    }

    /// Step the host until the start-at-task directive matches or the host
    /// runs out of tasks. On a match the host goes back to SETUP so fact
    /// gathering is decided again; a host with no match keeps its exhausted
    /// cursor and gets no setup task.
    /// Returns whether the directive matched.
    fn fast_forward(&mut self, host: &str, context: &PlayContext) -> Result<bool, NexusError> {
        loop {
            let (_, task) = self.next_task(host, true, true)?;
            let Some(task) = task else { return Ok(false) };
            if context.matches_start_at(&task) {
                self.callbacks.on_start_at_task(host, &task);
                break;
            }
            self.next_task(host, false, true)?;
        }

        let root = self.state_id(host)?;
        let state = self.arena.get_mut(root)?;
        state.run_state = RunState::Setup;
        state.pending_setup = false;
        state.did_start_at_task = true;
        Ok(true)
    }

    /// `quiet` steps are the fast-forward ones: they move the cursor but
    /// leave facts, role progress and callbacks alone.
    fn next_task(
        &mut self,
        host: &str,
        peek: bool,
        quiet: bool,
    ) -> Result<(HostSnapshot, Option<Arc<Task>>), NexusError> {
        let root = self.state_id(host)?;
        let was_complete = self.arena.get(root)?.run_state == RunState::Complete;
        let work = self.arena.clone_subtree(root)?;

        let task = match self.next_task_from_state(work, host, peek, quiet) {
            Ok(task) => task,
            Err(e) => {
                self.arena.release(work);
                return Err(e.into());
            }
        };
        let snapshot = self.arena.snapshot(work)?;

        if peek {
            self.arena.release(work);
            return Ok((snapshot, task));
        }

        self.arena.release(root);
        self.host_states.insert(host.to_string(), work);

        if !quiet {
            match &task {
                Some(task) => {
                    let section = self.section_of(&snapshot, task);
                    self.callbacks.on_task_selected(host, task, section)
                }
                None if !was_complete => self
                    .callbacks
                    .on_host_complete(host, !snapshot.fail_state().is_empty()),
                None => {}
            }
        }

        Ok((snapshot, task))
    }

    fn next_task_from_state(
        &mut self,
        id: StateId,
        host: &str,
        peek: bool,
        quiet: bool,
    ) -> Result<Option<Arc<Task>>, StateError> {
        let state = self.arena.get_mut(id)?;
        let mut task = None;

        match state.run_state {
            RunState::Complete => return Ok(None),
            RunState::Setup => {
                state.run_state = RunState::Main;
                state.pending_setup = true;

                let gathered = self.facts_gathered.contains(host);
                if self.gather_policy.should_gather(self.gather_facts, gathered) {
                    if !peek && !quiet {
                        self.facts_gathered.insert(host);
                    }
                    task = Some(self.setup_task.clone());
                } else {
                    state.pending_setup = false;
                }
            }
            _ => {}
        }

        if task.is_none() {
            task = step_state(&mut self.arena, id)?;
        }

        if let Some(role) = task.as_ref().and_then(|t| t.role.clone()) {
            let state = self.arena.get_mut(id)?;
            if let Some(previous) = &state.current_role {
                if *previous != role && !peek && !quiet && self.roles.had_task_run(previous, host) {
                    self.roles.mark_completed(previous, host);
                }
            }
            state.current_role = Some(role);
        }

        Ok(task)
    }
}

/// Walk one state level until a task comes out or the level is finished
fn step_state(arena: &mut StateArena, id: StateId) -> Result<Option<Arc<Task>>, StateError> {
    loop {
        let state = arena.get_mut(id)?;
        let (section, child) = match next_move(state) {
            Move::Again => continue,
            Move::NextBlock(stale) => {
                for child in stale {
                    arena.release(child);
                }
                continue;
            }
            Move::Finished => return Ok(None),
            Move::Yield(task) => return Ok(Some(task)),
            Move::Resume(section, child) => (section, child),
            Move::Enter(section, block) => {
                let nested = HostState::for_nested_block(block, state.current_role.clone());
                let child = arena.insert(nested);
                *arena.get_mut(id)?.child_state_mut(section) = Some(child);
                (section, child)
            }
        };

        if let Some(task) = step_state(arena, child)? {
            return Ok(Some(task));
        }

        // The nested block is done; carry a single failure bit up
        let child_failed = !arena.get(child)?.fail_state.is_empty();
        arena.release(child);
        let state = arena.get_mut(id)?;
        if child_failed {
            state.fail_state.insert(section.into());
        }
        *state.child_state_mut(section) = None;
        *state.task_index_mut(section) += 1;
    }
}

fn next_move(state: &mut HostState) -> Move {
    let section = match state.run_state {
        RunState::Complete => return Move::Finished,
        RunState::Setup => {
            state.run_state = RunState::Main;
            return Move::Again;
        }
        RunState::Main => Section::Main,
        RunState::Rescue => Section::Rescue,
        RunState::Always => Section::Always,
    };

    let block = match state.current_block() {
        Ok(block) => block.clone(),
        Err(_) => {
            state.run_state = RunState::Complete;
            return Move::Finished;
        }
    };

    match section {
        Section::Main => {
            state.pending_setup = false;
            if state.fail_state.contains(FailedSection::Main) {
                state.run_state = RunState::Rescue;
                return Move::Again;
            }
        }
        Section::Rescue => {
            if state.fail_state.contains(FailedSection::Rescue) {
                state.run_state = RunState::Always;
                return Move::Again;
            }
        }
        Section::Always => {}
    }

    let entries = block.section(section);
    let index = state.task_index(section);

    if index >= entries.len() {
        match section {
            Section::Main => state.run_state = RunState::Always,
            Section::Rescue => {
                // a completed rescue absolves the whole block
                if !entries.is_empty() {
                    state.fail_state.clear();
                }
                state.run_state = RunState::Always;
            }
            Section::Always => {
                if state.fail_state.is_empty() {
                    return Move::NextBlock(advance_block(state));
                }
                state.run_state = RunState::Complete;
            }
        }
        return Move::Again;
    }

    if let Some(child) = state.child_state(section) {
        return Move::Resume(section, child);
    }

    match &entries[index] {
        TaskOrBlock::Block(nested) => Move::Enter(section, nested.clone()),
        TaskOrBlock::Task(task) => {
            *state.task_index_mut(section) += 1;
            Move::Yield(task.clone())
        }
    }
}

/// Move to the next top-level block, returning the child states it dropped
fn advance_block(state: &mut HostState) -> Vec<StateId> {
    state.block_index += 1;
    state.main_task_index = 0;
    state.rescue_task_index = 0;
    state.always_task_index = 0;
    state.run_state = RunState::Main;
    [
        state.main_child_state.take(),
        state.rescue_child_state.take(),
        state.always_child_state.take(),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn set_failed_state(arena: &mut StateArena, id: StateId) -> Result<(), StateError> {
    let state = arena.get_mut(id)?;

    if state.pending_setup {
        state.fail_state.insert(FailedSection::Setup);
        state.run_state = RunState::Complete;
        return Ok(());
    }

    let Some(section) = state.run_state.section() else {
        return Ok(());
    };

    if let Some(child) = state.child_state(section) {
        return set_failed_state(arena, child);
    }

    state.fail_state.insert(section.into());
    state.run_state = match section {
        Section::Main => RunState::Rescue,
        Section::Rescue => RunState::Always,
        Section::Always => RunState::Complete,
    };
    Ok(())
}

fn check_failed_state(arena: &StateArena, id: Option<StateId>) -> Result<bool, StateError> {
    let Some(id) = id else {
        return Ok(false);
    };
    let state = arena.get(id)?;

    match state.run_state {
        RunState::Rescue if check_failed_state(arena, state.rescue_child_state)? => {
            return Ok(true)
        }
        RunState::Always if check_failed_state(arena, state.always_child_state)? => {
            return Ok(true)
        }
        _ => {}
    }

    if !state.fail_state.is_empty() {
        return Ok(match state.run_state {
            RunState::Rescue => state.fail_state.contains(FailedSection::Rescue),
            RunState::Always => state.fail_state.contains(FailedSection::Always),
            _ => true,
        });
    }

    if state.run_state == RunState::Main && check_failed_state(arena, state.main_child_state)? {
        let block = state.current_block()?;
        return Ok(block.rescue.is_empty() || state.fail_state.contains(FailedSection::Rescue));
    }

    Ok(false)
}

fn search_state(
    arena: &StateArena,
    id: StateId,
    task_id: TaskId,
) -> Result<Option<Arc<Task>>, StateError> {
    let state = arena.get(id)?;
    if let Some(found) = state.blocks.iter().find_map(|b| search_block(b, task_id)) {
        return Ok(Some(found));
    }
    for section in [Section::Main, Section::Rescue, Section::Always] {
        if let Some(child) = state.child_state(section) {
            if let Some(found) = search_state(arena, child, task_id)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

fn search_block(block: &Block, task_id: TaskId) -> Option<Arc<Task>> {
    [&block.block, &block.rescue, &block.always]
        .into_iter()
        .flatten()
        .find_map(|entry| match entry {
            TaskOrBlock::Task(task) if task.id == task_id => Some(task.clone()),
            TaskOrBlock::Task(_) => None,
            TaskOrBlock::Block(nested) => search_block(nested, task_id),
        })
}

/// Returns whether anything was inserted
fn insert_tasks_into_state(
    arena: &mut StateArena,
    id: StateId,
    tasks: &[TaskOrBlock],
) -> Result<bool, StateError> {
    let state = arena.get_mut(id)?;

    let in_recovery = matches!(state.run_state, RunState::Rescue | RunState::Always);
    if (!state.fail_state.is_empty() && !in_recovery) || tasks.is_empty() {
        return Ok(false);
    }

    let Some(section) = state.run_state.section() else {
        return Ok(false);
    };

    if let Some(child) = state.child_state(section) {
        return insert_tasks_into_state(arena, child, tasks);
    }

    let index = state.task_index(section);
    let block = match state.current_block_mut() {
        Ok(block) => block,
        Err(StateError::NoMoreBlocks { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    let entries = block.section_mut(section);
    let at = index.min(entries.len());
    entries.splice(at..at, tasks.iter().cloned());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tags::TagFilter;
    use crate::plugins::callbacks::CallbackPlugin;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn task(name: &str) -> TaskOrBlock {
        TaskOrBlock::task(Task::new(name, "command"))
    }

    fn tasks(names: &[&str]) -> Vec<TaskOrBlock> {
        names.iter().map(|n| task(n)).collect()
    }

    fn block(main: &[&str], rescue: &[&str], always: &[&str]) -> Block {
        Block {
            block: tasks(main),
            rescue: tasks(rescue),
            always: tasks(always),
            ..Block::default()
        }
    }

    fn play(entries: Vec<TaskOrBlock>) -> Play {
        Play {
            name: "test play".to_string(),
            gather_facts: Some(false),
            tasks: entries,
            ..Play::default()
        }
    }

    fn iterator_with(inventory: &Inventory, play: &Play, context: &mut PlayContext) -> PlayIterator {
        PlayIterator::new(
            inventory,
            play,
            &[],
            context,
            &FactCache::new(),
            Arc::new(RoleTracker::new()),
            Arc::new(CallbackManager::new()),
        )
        .unwrap()
    }

    fn iterator(play: &Play) -> PlayIterator {
        iterator_with(&Inventory::from_cli_hosts("h1"), play, &mut PlayContext::new())
    }

    fn next(it: &mut PlayIterator, host: &str) -> Option<String> {
        it.get_next_task_for_host(host, false)
            .unwrap()
            .1
            .map(|t| t.get_name().to_string())
    }

    fn drain(it: &mut PlayIterator, host: &str) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(name) = next(it, host) {
            names.push(name);
            assert!(names.len() < 100, "iterator did not terminate");
        }
        names
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CallbackPlugin for Arc<Recorder> {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_task_selected(&self, host: &str, task: &Task, run_state: RunState) {
            self.events
                .lock()
                .push(format!("{} {} {}", host, task.get_name(), run_state));
        }

        fn on_host_complete(&self, host: &str, failed: bool) {
            self.events.lock().push(format!("{} complete failed={}", host, failed));
        }

        fn on_host_failed(&self, host: &str, run_state: RunState) {
            self.events.lock().push(format!("{} failed in {}", host, run_state));
        }

        fn on_tasks_added(&self, host: &str, count: usize) {
            self.events.lock().push(format!("{} added {}", host, count));
        }
    }

    #[test]
    fn test_example_scenario() {
        let p = play(vec![TaskOrBlock::block(block(&["a", "b"], &[], &["c"]))]);
        let mut it = iterator(&p);

        let (state, t) = it.get_next_task_for_host("h1", false).unwrap();
        assert_eq!(t.unwrap().name, "a");
        assert_eq!(state.run_state(), RunState::Main);

        let (state, t) = it.get_next_task_for_host("h1", false).unwrap();
        assert_eq!(t.unwrap().name, "b");
        assert_eq!(state.run_state(), RunState::Main);

        let (state, t) = it.get_next_task_for_host("h1", false).unwrap();
        assert_eq!(t.unwrap().name, "c");
        assert_eq!(state.run_state(), RunState::Always);

        let (state, t) = it.get_next_task_for_host("h1", false).unwrap();
        assert!(t.is_none());
        assert_eq!(state.run_state(), RunState::Complete);
        assert!(it.get_failed_hosts().is_empty());
    }

    #[test]
    fn test_terminates_and_stays_complete() {
        let nested = Block {
            block: vec![task("n1"), TaskOrBlock::block(block(&["deep"], &[], &["deep-always"]))],
            always: tasks(&["n-always"]),
            ..Block::default()
        };
        let p = play(vec![
            task("a"),
            TaskOrBlock::block(Block {
                block: vec![task("b"), TaskOrBlock::block(nested)],
                rescue: tasks(&["r"]),
                always: tasks(&["c"]),
                ..Block::default()
            }),
            task("d"),
        ]);
        let mut it = iterator(&p);

        assert_eq!(
            drain(&mut it, "h1"),
            vec!["a", "b", "n1", "deep", "deep-always", "n-always", "c", "d"]
        );
        assert_eq!(it.get_host_state("h1").unwrap().run_state(), RunState::Complete);
        assert_eq!(next(&mut it, "h1"), None);
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let p = play(vec![task("a"), task("b")]);
        let mut it = iterator(&p);

        for _ in 0..3 {
            let (_, t) = it.get_next_task_for_host("h1", true).unwrap();
            assert_eq!(t.unwrap().name, "a");
        }
        let (_, peeked) = it.get_next_task_for_host("h1", true).unwrap();
        let (_, real) = it.get_next_task_for_host("h1", false).unwrap();
        assert_eq!(peeked.unwrap().id, real.unwrap().id);
        assert_eq!(next(&mut it, "h1").as_deref(), Some("b"));
    }

    #[test]
    fn test_peek_does_not_leak_states() {
        let p = play(vec![TaskOrBlock::block(Block {
            block: vec![TaskOrBlock::block(block(&["x", "y"], &[], &[]))],
            ..Block::default()
        })]);
        let mut it = iterator(&p);
        next(&mut it, "h1");
        let live = it.arena.len();

        for _ in 0..5 {
            it.get_next_task_for_host("h1", true).unwrap();
        }
        assert_eq!(it.arena.len(), live);
    }

    #[test]
    fn test_no_leaf_repeats_within_a_section() {
        let p = play(vec![TaskOrBlock::block(block(&["a", "b"], &["r1", "r2"], &["c"]))]);
        let mut it = iterator(&p);

        let mut seen = Vec::new();
        while let (_, Some(t)) = it.get_next_task_for_host("h1", false).unwrap() {
            assert!(!seen.contains(&t.id), "{} yielded twice", t.name);
            seen.push(t.id);
            if t.name == "b" {
                it.mark_host_failed("h1").unwrap();
            }
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_rescue_absorbs_failure() {
        let p = play(vec![TaskOrBlock::block(block(&["a", "b"], &["r1", "r2"], &[]))]);
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("a"));
        it.mark_host_failed("h1").unwrap();
        assert!(it.is_any_block_rescuing("h1").unwrap());
        assert!(!it.is_failed("h1").unwrap());

        assert_eq!(next(&mut it, "h1").as_deref(), Some("r1"));
        assert_eq!(next(&mut it, "h1").as_deref(), Some("r2"));
        assert_eq!(next(&mut it, "h1"), None);

        let state = it.get_host_state("h1").unwrap();
        assert_eq!(state.run_state(), RunState::Complete);
        assert!(state.fail_state().is_empty());
        assert!(it.get_failed_hosts().is_empty());
    }

    #[test]
    fn test_unrescued_failure_surfaces() {
        let p = play(vec![task("a"), task("b")]);
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("a"));
        it.mark_host_failed("h1").unwrap();
        assert_eq!(it.get_host_state("h1").unwrap().run_state(), RunState::Rescue);

        assert_eq!(next(&mut it, "h1"), None);
        let state = it.get_host_state("h1").unwrap();
        assert_eq!(state.run_state(), RunState::Complete);
        assert!(state.fail_state().contains(FailedSection::Main));
        assert_eq!(it.get_failed_hosts(), BTreeSet::from(["h1".to_string()]));
        assert!(it.is_failed("h1").unwrap());
    }

    #[test]
    fn test_failure_stops_later_blocks() {
        let p = play(vec![
            TaskOrBlock::block(block(&["a"], &[], &["cleanup"])),
            task("never"),
        ]);
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("a"));
        it.mark_host_failed("h1").unwrap();
        assert_eq!(drain(&mut it, "h1"), vec!["cleanup"]);
        assert!(it.get_failed_hosts().contains("h1"));
    }

    #[test]
    fn test_nested_block_is_transparent() {
        let flat = play(vec![task("a"), task("b"), task("c")]);
        let wrapped = play(vec![TaskOrBlock::block(Block {
            block: vec![
                task("a"),
                TaskOrBlock::block(Block::from_tasks(tasks(&["b"]))),
                task("c"),
            ],
            ..Block::default()
        })]);

        let mut flat_it = iterator(&flat);
        let mut wrapped_it = iterator(&wrapped);
        assert_eq!(drain(&mut flat_it, "h1"), drain(&mut wrapped_it, "h1"));
    }

    #[test]
    fn test_nested_failure_propagates_one_level() {
        let inner = block(&["inner"], &[], &["inner-always"]);
        let p = play(vec![TaskOrBlock::block(Block {
            block: vec![TaskOrBlock::block(inner), task("after")],
            rescue: tasks(&["outer-rescue"]),
            always: tasks(&["outer-always"]),
            ..Block::default()
        })]);
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("inner"));
        it.mark_host_failed("h1").unwrap();

        // the failure lands on the nested block first
        let state = it.get_host_state("h1").unwrap();
        assert!(state.fail_state().is_empty());
        let active = it.get_active_state("h1").unwrap();
        assert_eq!(active.run_state(), RunState::Rescue);
        assert!(active.fail_state().contains(FailedSection::Main));
        assert!(!it.is_failed("h1").unwrap());

        assert_eq!(
            drain(&mut it, "h1"),
            vec!["inner-always", "outer-rescue", "outer-always"]
        );
        assert!(it.get_failed_hosts().is_empty());
    }

    #[test]
    fn test_rescue_failure_keeps_host_failed() {
        let p = play(vec![TaskOrBlock::block(block(&["a"], &["r1", "r2"], &["c"]))]);
        let mut it = iterator(&p);

        next(&mut it, "h1");
        it.mark_host_failed("h1").unwrap();
        assert_eq!(next(&mut it, "h1").as_deref(), Some("r1"));
        it.mark_host_failed("h1").unwrap();

        assert_eq!(drain(&mut it, "h1"), vec!["c"]);
        let state = it.get_host_state("h1").unwrap();
        assert!(state.fail_state().contains(FailedSection::Main));
        assert!(state.fail_state().contains(FailedSection::Rescue));
        assert!(it.get_failed_hosts().contains("h1"));
    }

    #[test]
    fn test_always_failure_completes_immediately() {
        let p = play(vec![
            TaskOrBlock::block(block(&["a"], &[], &["c1", "c2"])),
            task("next"),
        ]);
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("a"));
        assert_eq!(next(&mut it, "h1").as_deref(), Some("c1"));
        it.mark_host_failed("h1").unwrap();

        let state = it.get_host_state("h1").unwrap();
        assert_eq!(state.run_state(), RunState::Complete);
        assert!(state.fail_state().contains(FailedSection::Always));
        assert_eq!(next(&mut it, "h1"), None);
        assert!(it.get_failed_hosts().contains("h1"));
    }

    #[test]
    fn test_setup_task_and_setup_failure() {
        let mut p = play(vec![TaskOrBlock::block(block(&["a"], &["r"], &["c"]))]);
        p.gather_facts = Some(true);
        let mut it = iterator(&p);

        let (state, t) = it.get_next_task_for_host("h1", false).unwrap();
        let setup = t.unwrap();
        assert_eq!(setup.action, "setup");
        assert!(state.state().pending_setup);
        assert_eq!(state.run_state(), RunState::Main);
        assert_eq!(it.section_of(&state, &setup), RunState::Setup);

        it.mark_host_failed("h1").unwrap();
        let state = it.get_host_state("h1").unwrap();
        assert_eq!(state.run_state(), RunState::Complete);
        assert!(state.fail_state().contains(FailedSection::Setup));
        assert_eq!(next(&mut it, "h1"), None);
        assert!(it.get_failed_hosts().contains("h1"));
    }

    #[test]
    fn test_pending_setup_cleared_on_next_step() {
        let mut p = play(vec![task("a")]);
        p.gather_facts = None;
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("Gathering Facts"));
        let (state, t) = it.get_next_task_for_host("h1", false).unwrap();
        let t = t.unwrap();
        assert_eq!(t.name, "a");
        assert!(!state.state().pending_setup);
        assert_eq!(it.section_of(&state, &t), RunState::Main);
    }

    #[test]
    fn test_smart_gathering_skips_known_hosts() {
        let mut p = play(vec![task("a")]);
        p.gather_facts = None;
        let inventory = Inventory::from_cli_hosts("known,fresh");
        inventory.facts_gathered().insert("known");
        let mut context = PlayContext::new().with_gather_policy(GatherPolicy::Smart);
        let mut it = iterator_with(&inventory, &p, &mut context);

        assert_eq!(next(&mut it, "known").as_deref(), Some("a"));
        assert_eq!(next(&mut it, "fresh").as_deref(), Some("Gathering Facts"));
        assert!(inventory.facts_gathered().contains("fresh"));

        // a second play sees the flag and does not gather again
        let mut it = iterator_with(&inventory, &p, &mut context);
        assert_eq!(next(&mut it, "fresh").as_deref(), Some("a"));
    }

    #[test]
    fn test_fact_cache_seeds_gathered_flag() {
        let mut p = play(vec![task("a")]);
        p.gather_facts = None;
        let inventory = Inventory::from_cli_hosts("cached");
        let cache = FactCache::new();
        cache.update_facts("cached", HashMap::new());
        let mut context = PlayContext::new().with_gather_policy(GatherPolicy::Smart);

        let mut it = PlayIterator::new(
            &inventory,
            &p,
            &[],
            &mut context,
            &cache,
            Arc::new(RoleTracker::new()),
            Arc::new(CallbackManager::new()),
        )
        .unwrap();
        assert_eq!(next(&mut it, "cached").as_deref(), Some("a"));
    }

    #[test]
    fn test_peeked_setup_does_not_mark_gathered() {
        let mut p = play(vec![task("a")]);
        p.gather_facts = None;
        let inventory = Inventory::from_cli_hosts("h1");
        let mut context = PlayContext::new().with_gather_policy(GatherPolicy::Smart);
        let mut it = iterator_with(&inventory, &p, &mut context);

        let (_, first) = it.get_next_task_for_host("h1", true).unwrap();
        let (_, second) = it.get_next_task_for_host("h1", true).unwrap();
        assert_eq!(first.unwrap().id, second.unwrap().id);
        assert!(!inventory.facts_gathered().contains("h1"));
    }

    #[test]
    fn test_add_tasks_runs_next() {
        let p = play(vec![task("a"), task("b")]);
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("a"));
        it.add_tasks("h1", tasks(&["t1", "t2"])).unwrap();
        assert_eq!(drain(&mut it, "h1"), vec!["t1", "t2", "b"]);
        // the shared block list is untouched
        assert_eq!(it.blocks()[0].block.len(), 2);
    }

    #[test]
    fn test_add_tasks_is_per_host() {
        let p = play(vec![task("a"), task("b")]);
        let mut it = iterator_with(&Inventory::from_cli_hosts("h1,h2"), &p, &mut PlayContext::new());

        next(&mut it, "h1");
        next(&mut it, "h2");
        it.add_tasks("h1", tasks(&["extra"])).unwrap();

        assert_eq!(drain(&mut it, "h1"), vec!["extra", "b"]);
        assert_eq!(drain(&mut it, "h2"), vec!["b"]);
    }

    #[test]
    fn test_add_tasks_into_child_state() {
        let p = play(vec![TaskOrBlock::block(Block {
            block: vec![TaskOrBlock::block(block(&["x", "y"], &[], &[])), task("after")],
            ..Block::default()
        })]);
        let mut it = iterator(&p);

        assert_eq!(next(&mut it, "h1").as_deref(), Some("x"));
        it.add_tasks("h1", tasks(&["inserted"])).unwrap();
        assert_eq!(drain(&mut it, "h1"), vec!["inserted", "y", "after"]);
    }

    #[test]
    fn test_add_tasks_into_rescue() {
        let p = play(vec![TaskOrBlock::block(block(&["a"], &["r1", "r2"], &[]))]);
        let mut it = iterator(&p);

        next(&mut it, "h1");
        it.mark_host_failed("h1").unwrap();
        assert_eq!(next(&mut it, "h1").as_deref(), Some("r1"));
        it.add_tasks("h1", tasks(&["rescue-extra"])).unwrap();
        assert_eq!(drain(&mut it, "h1"), vec!["rescue-extra", "r2"]);
    }

    #[test]
    fn test_add_tasks_ignored_after_main_failure() {
        let p = play(vec![task("a"), task("b")]);
        let mut it = iterator(&p);

        next(&mut it, "h1");
        it.mark_host_failed("h1").unwrap();
        // failed MAIN, not yet moved on from the failed section
        let root = it.state_id("h1").unwrap();
        it.arena.get_mut(root).unwrap().run_state = RunState::Main;
        it.add_tasks("h1", tasks(&["late"])).unwrap();

        assert_eq!(drain(&mut it, "h1"), Vec::<String>::new());
    }

    #[test]
    fn test_add_empty_task_list_is_noop() {
        let p = play(vec![task("a")]);
        let recorder = Arc::new(Recorder::default());
        let mut callbacks = CallbackManager::new();
        callbacks.add(Box::new(recorder.clone()));
        let mut it = PlayIterator::new(
            &Inventory::from_cli_hosts("h1"),
            &p,
            &[],
            &mut PlayContext::new(),
            &FactCache::new(),
            Arc::new(RoleTracker::new()),
            Arc::new(callbacks),
        )
        .unwrap();

        it.add_tasks("h1", Vec::new()).unwrap();
        assert!(recorder.events.lock().is_empty());
        assert_eq!(drain(&mut it, "h1"), vec!["a"]);
    }

    #[test]
    fn test_get_original_task() {
        let handler = Task::new("restart", "service");
        let mut p = play(vec![TaskOrBlock::block(Block {
            block: vec![task("a"), TaskOrBlock::block(block(&["deep"], &[], &[]))],
            rescue: tasks(&["r"]),
            ..Block::default()
        })]);
        p.handlers.push(handler.clone());
        let mut it = iterator(&p);

        let deep = match &it.blocks()[0].block[1] {
            TaskOrBlock::Block(b) => match &b.block[0] {
                TaskOrBlock::Task(t) => t.clone(),
                TaskOrBlock::Block(_) => unreachable!(),
            },
            TaskOrBlock::Task(_) => unreachable!(),
        };

        // a copy that went through serialization still finds its original
        let copy: Task = serde_json::from_str(&serde_json::to_string(&*deep).unwrap()).unwrap();
        let found = it.get_original_task("h1", &copy).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &deep));

        let found = it.get_original_task("h1", &handler).unwrap().unwrap();
        assert_eq!(found.name, "restart");

        assert!(it.get_original_task("h1", &Task::new("other", "command")).unwrap().is_none());

        next(&mut it, "h1");
        let added = Task::new("added", "command");
        it.add_tasks("h1", vec![TaskOrBlock::task(added.clone())]).unwrap();
        assert!(it.get_original_task("h1", &added).unwrap().is_some());
    }

    #[test]
    fn test_invalid_host() {
        let p = play(vec![task("a")]);
        let mut it = iterator(&p);

        for err in [
            it.get_next_task_for_host("nope", false).map(|_| ()),
            it.get_host_state("nope").map(|_| ()),
            it.mark_host_failed("nope"),
            it.add_tasks("nope", tasks(&["x"])),
            it.get_original_task("nope", &Task::new("x", "command")).map(|_| ()),
        ] {
            assert!(matches!(err, Err(NexusError::InvalidHost { .. })));
        }
    }

    #[test]
    fn test_start_at_task_skips_every_host() {
        let p = play(vec![task("one"), task("two"), task("three")]);
        let mut context = PlayContext::new().with_start_at_task("tw*");
        let mut it = iterator_with(&Inventory::from_cli_hosts("h1,h2"), &p, &mut context);

        assert!(context.start_at_task.is_none());
        let state = it.get_host_state("h1").unwrap();
        assert_eq!(state.run_state(), RunState::Setup);
        assert!(state.state().did_start_at_task);

        assert_eq!(drain(&mut it, "h1"), vec!["two", "three"]);
        assert_eq!(drain(&mut it, "h2"), vec!["two", "three"]);
    }

    #[test]
    fn test_start_at_task_regathers_facts() {
        let mut p = play(vec![task("one"), task("two")]);
        p.gather_facts = Some(true);
        let inventory = Inventory::from_cli_hosts("h1");
        let mut context = PlayContext::new()
            .with_start_at_task("two")
            .with_gather_policy(GatherPolicy::Smart);
        let mut it = iterator_with(&inventory, &p, &mut context);

        assert_eq!(drain(&mut it, "h1"), vec!["Gathering Facts", "two"]);
    }

    #[test]
    fn test_start_at_task_without_match() {
        let mut p = play(vec![task("one")]);
        p.gather_facts = Some(true);
        let mut context = PlayContext::new().with_start_at_task("missing");
        let mut it = iterator_with(&Inventory::from_cli_hosts("h1"), &p, &mut context);

        assert_eq!(context.start_at_task.as_deref(), Some("missing"));
        let state = it.get_host_state("h1").unwrap();
        assert_ne!(state.run_state(), RunState::Setup);
        assert!(!state.state().did_start_at_task);
        assert_eq!(drain(&mut it, "h1"), Vec::<String>::new());
    }

    #[test]
    fn test_role_completion_on_boundary() {
        let tracker = Arc::new(RoleTracker::new());
        let p = play(vec![
            TaskOrBlock::task(Task::new("w1", "command").with_role("web")),
            TaskOrBlock::task(Task::new("w2", "command").with_role("web")),
            TaskOrBlock::task(Task::new("d1", "command").with_role("db")),
            TaskOrBlock::task(Task::new("d2", "command").with_role("db")),
        ]);
        let mut it = PlayIterator::new(
            &Inventory::from_cli_hosts("h1"),
            &p,
            &[],
            &mut PlayContext::new(),
            &FactCache::new(),
            tracker.clone(),
            Arc::new(CallbackManager::new()),
        )
        .unwrap();

        next(&mut it, "h1");
        tracker.record_task_run("web", "h1");
        next(&mut it, "h1");

        // peeking across the boundary has no effect
        it.get_next_task_for_host("h1", true).unwrap();
        assert!(!tracker.is_completed("web", "h1"));

        assert_eq!(next(&mut it, "h1").as_deref(), Some("d1"));
        assert!(tracker.is_completed("web", "h1"));
        assert_eq!(it.get_host_state("h1").unwrap().state().current_role.as_deref(), Some("db"));

        // db never recorded a run, so it is not completed
        next(&mut it, "h1");
        next(&mut it, "h1");
        assert!(!tracker.is_completed("db", "h1"));
    }

    #[test]
    fn test_tag_filter_drops_empty_blocks() {
        let p = play(vec![
            TaskOrBlock::task(Task::new("a", "command").with_tags(&["web"])),
            TaskOrBlock::block(Block {
                block: vec![TaskOrBlock::task(Task::new("b", "command").with_tags(&["db"]))],
                always: tasks(&["c"]),
                ..Block::default()
            }),
        ]);
        let mut context = PlayContext::new().with_tag_filter(TagFilter::from_args(Some("web"), None));
        let mut it = iterator_with(&Inventory::from_cli_hosts("h1"), &p, &mut context);

        assert_eq!(it.blocks().len(), 1);
        assert_eq!(drain(&mut it, "h1"), vec!["a"]);
    }

    #[test]
    fn test_handlers_include_role_handlers() {
        let role = Role {
            name: "web".to_string(),
            path: "roles/web".to_string(),
            tasks: tasks(&["r1"]),
            handlers: vec![Task::new("reload", "service")],
        };
        let mut p = play(vec![task("a")]);
        p.roles.push(crate::parser::ast::RoleRef {
            role: "web".to_string(),
            vars: HashMap::new(),
            tags: Vec::new(),
        });
        p.handlers.push(Task::new("restart", "service"));

        let it = PlayIterator::new(
            &Inventory::from_cli_hosts("h1"),
            &p,
            std::slice::from_ref(&role),
            &mut PlayContext::new(),
            &FactCache::new(),
            Arc::new(RoleTracker::new()),
            Arc::new(CallbackManager::new()),
        )
        .unwrap();

        let names: Vec<&str> = it.handlers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["restart", "reload"]);
        assert_eq!(it.handlers()[1].role.as_deref(), Some("web"));
    }

    #[test]
    fn test_callbacks_see_progress() {
        let p = play(vec![TaskOrBlock::block(block(&["a"], &["r"], &[]))]);
        let recorder = Arc::new(Recorder::default());
        let mut callbacks = CallbackManager::new();
        callbacks.add(Box::new(recorder.clone()));
        let mut it = PlayIterator::new(
            &Inventory::from_cli_hosts("h1"),
            &p,
            &[],
            &mut PlayContext::new(),
            &FactCache::new(),
            Arc::new(RoleTracker::new()),
            Arc::new(callbacks),
        )
        .unwrap();

        it.get_next_task_for_host("h1", true).unwrap();
        next(&mut it, "h1");
        it.mark_host_failed("h1").unwrap();
        it.add_tasks("h1", tasks(&["x"])).unwrap();
        drain(&mut it, "h1");
        next(&mut it, "h1");

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "h1 a MAIN",
                "h1 failed in MAIN",
                "h1 added 1",
                "h1 x RESCUE",
                "h1 r RESCUE",
                "h1 complete failed=false",
            ]
        );
    }

    #[test]
    fn test_hosts_sorted() {
        let p = play(vec![task("a")]);
        let it = iterator_with(&Inventory::from_cli_hosts("web2,db1,web1"), &p, &mut PlayContext::new());
        assert_eq!(it.hosts(), vec!["db1", "web1", "web2"]);
    }
}
