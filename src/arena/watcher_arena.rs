// Watcher arena - storage for evaluation unit metadata
//
// This module defines WatcherMetadata, a unified struct for render units,
// watch units and computed (lazy) units, the ambient target stack, and the
// low-level helpers the run protocol in watcher.rs is built from.
//
// WatcherMetadata contains:
// - deps / new_deps: the dependency set of the last completed run and the
//   scratch set collected by the run in progress
// - state: Idle / Queued / Stale / TornDown (Active is derived from `running`)
// - getter / callback / before: the unit's closures, stored directly in the
//   arena and taken out while they execute
//
// TARGET STACK:
// At most one unit is the "target" at any time. Reads of reactive state call
// DepId::depend(), which attributes the read to the current target. Nested
// runs (a computed read during a render) push onto the stack and restore the
// previous target when they finish, including on panic (TargetGuard).

use crate::error::Error;
use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::Rc;

use super::DepId;

/// Lifecycle states of an evaluation unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// Not running, dependency set reflects the last run
    Idle,
    /// Currently executing its body as the ambient target
    Active,
    /// Notified of a change and waiting in the scheduler queue
    Queued,
    /// Lazy unit known to be dirty, recomputed on next read
    Stale,
    /// Unsubscribed from everything, will never run again
    TornDown,
}

pub(crate) type Job = Box<dyn FnMut()>;

/// Closure slots of a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    /// The tracked body
    Getter,
    /// Untracked follow-up after a re-run (watch callbacks)
    Callback,
    /// Hook run by the scheduler before a queued re-run
    Before,
}

// Flag bit positions
pub(crate) const FLAG_LAZY: u8 = 1 << 0;
pub(crate) const FLAG_SYNC: u8 = 1 << 1;
pub(crate) const FLAG_USER: u8 = 1 << 2;

thread_local! {
    /// Per-thread unit arena
    static WATCHER_ARENA: RefCell<Slab<WatcherMetadata>> = const { RefCell::new(Slab::new()) };

    /// Creation counter; ids are strictly increasing, never reused
    static NEXT_WATCHER_UID: Cell<u32> = const { Cell::new(1) };

    /// Ambient evaluation context. `None` entries mark untracked sections.
    static TARGET_STACK: RefCell<Vec<Option<WatcherId>>> = const { RefCell::new(Vec::new()) };
}

/// Get the unit reads are currently attributed to (if any)
pub(crate) fn current_target() -> Option<WatcherId> {
    TARGET_STACK
        .try_with(|stack| stack.borrow().last().copied().flatten())
        .ok()
        .flatten()
}

/// Make `target` the active unit, remembering the previous one
pub(crate) fn push_target(target: Option<WatcherId>) {
    TARGET_STACK.with(|stack| stack.borrow_mut().push(target));
}

/// Restore the previously active unit
pub(crate) fn pop_target() -> Result<Option<WatcherId>, Error> {
    TARGET_STACK
        .try_with(|stack| stack.borrow_mut().pop())
        .ok()
        .flatten()
        .ok_or(Error::TargetStackUnderflow)
}

/// Depth of the target stack (number of nested runs/untracked sections)
#[cfg(test)]
pub(crate) fn target_depth() -> usize {
    TARGET_STACK
        .try_with(|stack| stack.borrow().len())
        .unwrap_or(0)
}

/// RAII guard pairing a push with its pop.
/// The pop happens even if the guarded body panics.
pub(crate) struct TargetGuard {
    _private: (),
}

impl TargetGuard {
    /// Push `target` (None = untracked) and pop it again on drop
    pub(crate) fn new(target: Option<WatcherId>) -> Self {
        push_target(target);
        Self { _private: () }
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        if let Err(err) = pop_target() {
            crate::error::diagnose(err);
        }
    }
}

/// Unique identifier for an evaluation unit in the arena.
///
/// Ordering follows creation order (`uid`), which is the order the scheduler
/// runs units in: a parent created before its children re-runs before them.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct WatcherId {
    index: u32,
    uid: u32,
}

impl Ord for WatcherId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.uid.cmp(&other.uid).then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for WatcherId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl WatcherId {
    /// Creation-order identifier
    pub fn uid(self) -> u32 {
        self.uid
    }

    fn index(self) -> usize {
        self.index as usize
    }

    /// Access the unit metadata with a closure (read-only)
    ///
    /// Returns None if the unit has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&WatcherMetadata) -> R,
    {
        WATCHER_ARENA
            .try_with(|arena| {
                let arena = arena.borrow();
                arena
                    .get(self.index())
                    .filter(|meta| meta.uid == self.uid)
                    .map(f)
            })
            .ok()
            .flatten()
    }

    /// Diagnostic label
    pub fn label(self) -> Rc<str> {
        self.with(|meta| meta.label.clone())
            .unwrap_or_else(|| Rc::from("<dropped unit>"))
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current lifecycle state; a removed unit reports TornDown
    pub fn state(self) -> WatcherState {
        self.with(|meta| match meta.state.get() {
            WatcherState::TornDown => WatcherState::TornDown,
            _ if meta.running.get() => WatcherState::Active,
            state => state,
        })
        .unwrap_or(WatcherState::TornDown)
    }

    pub(crate) fn raw_state(self) -> WatcherState {
        self.with(|meta| meta.state.get())
            .unwrap_or(WatcherState::TornDown)
    }

    pub(crate) fn set_state(self, state: WatcherState) {
        self.with(|meta| {
            if meta.state.get() != WatcherState::TornDown {
                meta.state.set(state);
            }
        });
    }

    pub(crate) fn is_running(self) -> bool {
        self.with(|meta| meta.running.get()).unwrap_or(false)
    }

    pub(crate) fn set_running(self, running: bool) {
        self.with(|meta| meta.running.set(running));
    }

    pub(crate) fn has_flag(self, flag: u8) -> bool {
        self.with(|meta| meta.flags & flag != 0).unwrap_or(false)
    }

    /// The dependency a lazy unit notifies when it goes stale
    pub(crate) fn own_dep(self) -> Option<DepId> {
        self.with(|meta| meta.own_dep).flatten()
    }

    pub(crate) fn stale_announced(self) -> bool {
        self.with(|meta| meta.stale_announced.get()).unwrap_or(false)
    }

    pub(crate) fn set_stale_announced(self, announced: bool) {
        self.with(|meta| meta.stale_announced.set(announced));
    }

    // =========================================================================
    // Dependency bookkeeping
    // =========================================================================

    /// Record a dependency read during the current run.
    ///
    /// The subscription is only added when the dependency is new to this
    /// run and was not already part of the previous run's set.
    pub(crate) fn add_dep(self, dep: DepId) {
        let subscribe = self
            .with(|meta| {
                meta.new_deps.borrow_mut().insert(dep) && !meta.deps.borrow().contains(&dep)
            })
            .unwrap_or(false);
        if subscribe {
            dep.add_sub(self);
        }
    }

    /// Start a fresh collection pass
    pub(crate) fn clear_new_deps(self) {
        self.with(|meta| meta.new_deps.borrow_mut().clear());
    }

    /// Reconcile after a run: unsubscribe from every dependency of the
    /// previous run that was not read again, then adopt the new set.
    pub(crate) fn cleanup_deps(self) {
        let stale: Vec<DepId> = self
            .with(|meta| {
                let fresh = meta.new_deps.take();
                let previous = meta.deps.replace(fresh);
                let current = meta.deps.borrow();
                previous
                    .into_iter()
                    .filter(|dep| !current.contains(dep))
                    .collect()
            })
            .unwrap_or_default();
        for dep in stale {
            cov_mark::hit!(stale_dependency_dropped);
            dep.remove_sub(self);
        }
    }

    /// Drop a dependency that is being destroyed from both sets
    pub(crate) fn forget_dep(self, dep: DepId) {
        self.with(|meta| {
            meta.deps.borrow_mut().shift_remove(&dep);
            meta.new_deps.borrow_mut().shift_remove(&dep);
        });
    }

    /// Unsubscribe from every dependency and empty both sets
    pub(crate) fn unsubscribe_all(self) {
        let deps: Vec<DepId> = self
            .with(|meta| {
                let mut all = meta.deps.take();
                all.extend(meta.new_deps.take());
                all.into_iter().collect()
            })
            .unwrap_or_default();
        for dep in deps {
            dep.remove_sub(self);
        }
    }

    /// Snapshot of the dependency set of the last completed run
    pub fn dep_ids(self) -> Vec<DepId> {
        self.with(|meta| meta.deps.borrow().iter().copied().collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Closures
    // =========================================================================

    /// Whether the given closure slot is populated
    pub(crate) fn has_job(self, slot: Slot) -> bool {
        self.with(|meta| meta.slot(slot).borrow().is_some())
            .unwrap_or(false)
    }

    /// Run the closure stored in `slot`.
    ///
    /// The arena is not borrowed while the closure runs: the closure is taken
    /// out, run, and put back by a drop guard (also when it panics), so it can
    /// freely create, read or drop other units. Returns false when the slot
    /// was empty, e.g. because the closure is already running further up the
    /// stack.
    pub(crate) fn run_job(self, slot: Slot) -> bool {
        struct JobGuard {
            watcher: WatcherId,
            slot: Slot,
            job: Option<Job>,
        }

        impl Drop for JobGuard {
            fn drop(&mut self) {
                let mut job = self.job.take();
                let slot = self.slot;
                self.watcher.with(|meta| {
                    let mut cell = meta.slot(slot).borrow_mut();
                    if cell.is_none() {
                        *cell = job.take();
                    }
                });
                // Unit removed while its closure ran; drop it outside the arena borrow.
                drop(job);
            }
        }

        let Some(job) = self.with(|meta| meta.slot(slot).borrow_mut().take()).flatten() else {
            return false;
        };
        let mut guard = JobGuard {
            watcher: self,
            slot,
            job: Some(job),
        };
        if let Some(job) = guard.job.as_mut() {
            job();
        }
        true
    }
}

/// Metadata for one evaluation unit.
pub(crate) struct WatcherMetadata {
    uid: u32,
    label: Rc<str>,
    /// Flags bitset: lazy / sync / user (watch)
    flags: u8,
    state: Cell<WatcherState>,
    running: Cell<bool>,
    /// Dependencies of the last completed run
    deps: RefCell<IndexSet<DepId, FastHashBuilder>>,
    /// Dependencies collected by the run in progress
    new_deps: RefCell<IndexSet<DepId, FastHashBuilder>>,
    /// Lazy units: the dependency their readers subscribe to
    own_dep: Option<DepId>,
    /// Lazy units: readers were notified of the current staleness
    stale_announced: Cell<bool>,
    getter: RefCell<Option<Job>>,
    callback: RefCell<Option<Job>>,
    before: RefCell<Option<Job>>,
}

impl WatcherMetadata {
    /// Metadata for a unit running `getter`
    pub(crate) fn new(label: Rc<str>, flags: u8, getter: Job) -> Self {
        let state = if flags & FLAG_LAZY != 0 {
            // Lazy units compute on first read
            WatcherState::Stale
        } else {
            WatcherState::Idle
        };
        Self {
            uid: 0,
            label,
            flags,
            state: Cell::new(state),
            running: Cell::new(false),
            deps: RefCell::new(IndexSet::default()),
            new_deps: RefCell::new(IndexSet::default()),
            own_dep: None,
            stale_announced: Cell::new(false),
            getter: RefCell::new(Some(getter)),
            callback: RefCell::new(None),
            before: RefCell::new(None),
        }
    }

    pub(crate) fn with_callback(mut self, callback: Option<Job>) -> Self {
        self.callback = RefCell::new(callback);
        self
    }

    pub(crate) fn with_before(mut self, before: Option<Job>) -> Self {
        self.before = RefCell::new(before);
        self
    }

    pub(crate) fn with_own_dep(mut self, dep: DepId) -> Self {
        self.own_dep = Some(dep);
        self
    }

    fn slot(&self, slot: Slot) -> &RefCell<Option<Job>> {
        match slot {
            Slot::Getter => &self.getter,
            Slot::Callback => &self.callback,
            Slot::Before => &self.before,
        }
    }
}

/// Insert unit metadata into the arena, assigning the next creation id
pub(crate) fn watcher_arena_insert(mut metadata: WatcherMetadata) -> WatcherId {
    let uid = NEXT_WATCHER_UID.with(|next| {
        let uid = next.get();
        next.set(uid + 1);
        uid
    });
    metadata.uid = uid;
    WATCHER_ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        let entry = arena.vacant_entry();
        let index = entry.key() as u32;
        entry.insert(metadata);
        WatcherId { index, uid }
    })
}

/// Remove a unit from the arena. Returns false for stale ids.
pub(crate) fn watcher_arena_remove(id: WatcherId) -> bool {
    let removed = WATCHER_ARENA
        .try_with(|arena| {
            let mut arena = arena.borrow_mut();
            match arena.get(id.index()) {
                Some(meta) if meta.uid == id.uid => Some(arena.remove(id.index())),
                _ => None,
            }
        })
        .ok()
        .flatten();
    // Closures may own reactive values; they are dropped after the borrow ends.
    let existed = removed.is_some();
    drop(removed);
    existed
}

/// Number of live units on this thread
pub fn watcher_count() -> usize {
    WATCHER_ARENA
        .try_with(|arena| arena.borrow().len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{dep_arena_insert, dep_arena_remove};

    fn noop_unit() -> WatcherId {
        watcher_arena_insert(WatcherMetadata::new(Rc::from("test"), 0, Box::new(|| {})))
    }

    #[test]
    fn stale_access_returns_defaults() {
        let id = noop_unit();
        assert!(watcher_arena_remove(id));
        assert!(!watcher_arena_remove(id));

        assert!(id.with(|_| ()).is_none());
        assert_eq!(id.state(), WatcherState::TornDown);
        assert!(id.dep_ids().is_empty());
        assert!(!id.run_job(Slot::Getter));
    }

    #[test]
    fn ids_are_ordered_by_creation() {
        let first = noop_unit();
        let second = noop_unit();
        assert!(first < second);
        assert!(first.uid() < second.uid());

        watcher_arena_remove(first);
        let third = noop_unit();
        assert!(second < third);

        watcher_arena_remove(second);
        watcher_arena_remove(third);
    }

    #[test]
    fn job_restored_after_panic() {
        let runs = Rc::new(Cell::new(0usize));
        let runs_in_job = runs.clone();
        let id = watcher_arena_insert(WatcherMetadata::new(
            Rc::from("panicky"),
            0,
            Box::new(move || {
                runs_in_job.set(runs_in_job.get() + 1);
                if runs_in_job.get() == 1 {
                    panic!("first run fails");
                }
            }),
        ));

        let result = std::panic::catch_unwind(|| id.run_job(Slot::Getter));
        assert!(result.is_err());
        assert!(id.has_job(Slot::Getter));

        assert!(id.run_job(Slot::Getter));
        assert_eq!(runs.get(), 2);
        watcher_arena_remove(id);
    }

    #[test]
    fn target_guard_restores_on_panic() {
        let outer = noop_unit();
        let inner = noop_unit();

        let _outer_guard = TargetGuard::new(Some(outer));
        assert_eq!(current_target(), Some(outer));

        let result = std::panic::catch_unwind(|| {
            let _guard = TargetGuard::new(Some(inner));
            assert_eq!(current_target(), Some(inner));
            panic!("body failed");
        });
        assert!(result.is_err());
        assert_eq!(current_target(), Some(outer));

        {
            let _untracked = TargetGuard::new(None);
            assert_eq!(current_target(), None);
        }
        assert_eq!(current_target(), Some(outer));

        drop(_outer_guard);
        watcher_arena_remove(outer);
        watcher_arena_remove(inner);
    }

    #[test]
    fn pop_without_push_is_reported() {
        assert_eq!(target_depth(), 0);
        assert_eq!(pop_target(), Err(Error::TargetStackUnderflow));
    }

    #[test]
    fn add_dep_subscribes_once_and_cleanup_drops_stale() {
        cov_mark::check!(stale_dependency_dropped);
        let unit = noop_unit();
        let kept = dep_arena_insert();
        let dropped = dep_arena_insert();

        unit.clear_new_deps();
        unit.add_dep(kept);
        unit.add_dep(kept);
        unit.add_dep(dropped);
        unit.cleanup_deps();
        assert_eq!(unit.dep_ids(), vec![kept, dropped]);
        assert_eq!(kept.with_subs(|subs| subs.len()), Some(1));

        // Second pass only reads `kept`
        unit.clear_new_deps();
        unit.add_dep(kept);
        unit.cleanup_deps();
        assert_eq!(unit.dep_ids(), vec![kept]);
        assert_eq!(dropped.with_subs(|subs| subs.len()), Some(0));
        assert_eq!(kept.with_subs(|subs| subs.len()), Some(1));

        dep_arena_remove(kept);
        assert!(unit.dep_ids().is_empty());
        dep_arena_remove(dropped);
        watcher_arena_remove(unit);
    }
}
