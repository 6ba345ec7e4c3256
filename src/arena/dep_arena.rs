// Dependency arena - storage for dependency metadata
//
// Each Dep is a subscriber registry for one observable slot: a reactive
// property, a whole collection (the Ob's dependency) or a computed value.
//
// MODEL:
// - Dep = only holds subscribers (units that read it during their last run)
// - Unit = only holds its dependency sets (current + scratch for the running pass)
// The two sides are kept symmetric: a unit is in dep.subscribers exactly when
// the dep is in unit.deps (or in unit.new_deps during a run).

use crate::error::Failure;
use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use slab::Slab;
use std::cell::{Cell, RefCell};

use super::watcher_arena::current_target;
use super::WatcherId;

thread_local! {
    /// Per-thread dependency arena
    static DEP_ARENA: RefCell<Slab<DepMetadata>> = const { RefCell::new(Slab::new()) };

    static NEXT_DEP_UID: Cell<u32> = const { Cell::new(0) };
}

/// Unique identifier for a dependency in the arena.
///
/// `index` addresses the slab slot, `uid` is unique for the lifetime of the
/// thread, so an id whose dependency was removed never aliases a newer one
/// that reuses the slot. Stale ids are inert: every operation on them is a
/// no-op.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DepId {
    index: u32,
    uid: u32,
}

impl DepId {
    /// Unique, monotonically assigned identifier
    pub fn uid(self) -> u32 {
        self.uid
    }

    fn index(self) -> usize {
        self.index as usize
    }

    /// Access the dependency metadata with a closure (read-only)
    ///
    /// Returns None if the dependency has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&DepMetadata) -> R,
    {
        DEP_ARENA
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

    /// Register the active unit (if any) as a subscriber.
    ///
    /// The active unit records this dependency in its scratch set and
    /// subscribes itself unless it already did during an earlier run.
    pub fn depend(self) {
        if let Some(target) = current_target() {
            target.add_dep(self);
        }
    }

    /// Subscribe a unit (idempotent)
    pub(crate) fn add_sub(self, watcher: WatcherId) {
        self.with(|meta| {
            meta.subscribers.borrow_mut().insert(watcher);
        });
    }

    /// Unsubscribe a unit
    pub(crate) fn remove_sub(self, watcher: WatcherId) {
        self.with(|meta| {
            meta.subscribers.borrow_mut().shift_remove(&watcher);
        });
    }

    /// Execute a closure with the subscribers of this dependency
    pub(crate) fn with_subs<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&IndexSet<WatcherId, FastHashBuilder>) -> R,
    {
        self.with(|meta| f(&meta.subscribers.borrow()))
    }

    /// Notify every subscriber that the observed slot changed.
    ///
    /// Subscribers are snapshotted first, so units that subscribe or
    /// unsubscribe while the round runs do not affect it. In synchronous mode
    /// of a debug build the snapshot is sorted by unit id, since the scheduler
    /// does not sort in that mode.
    ///
    /// Every subscriber is updated even if an earlier one failed; the first
    /// unhandled failure is returned afterwards.
    pub(crate) fn notify(self) -> Result<(), Failure> {
        let Some(mut subs) = self.with_subs(|subs| subs.iter().copied().collect::<Vec<_>>()) else {
            return Ok(());
        };
        self.with(|meta| meta.notify_count.set(meta.notify_count.get() + 1));

        if cfg!(debug_assertions) && !crate::config::async_mode() {
            cov_mark::hit!(notify_sorted_for_sync_mode);
            subs.sort_by_key(|watcher| watcher.uid());
        }
        tracing::trace!(dep = self.uid, subscribers = subs.len(), "notify");

        let mut first_failure = None;
        for watcher in subs {
            if let Err(failure) = watcher.update() {
                first_failure.get_or_insert(failure);
            }
        }
        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Notify, re-raising an unhandled failure of a synchronous unit to the
    /// caller that performed the mutation.
    pub(crate) fn notify_or_raise(self) {
        if let Err(failure) = self.notify() {
            failure.raise();
        }
    }

    /// How often this dependency notified its subscribers
    pub fn notify_count(self) -> u64 {
        self.with(|meta| meta.notify_count.get()).unwrap_or(0)
    }
}

/// Metadata for a dependency stored in the arena.
#[derive(Debug)]
pub(crate) struct DepMetadata {
    uid: u32,
    /// Units subscribed to this dependency, in subscription order.
    pub(crate) subscribers: RefCell<IndexSet<WatcherId, FastHashBuilder>>,
    notify_count: Cell<u64>,
}

impl DepMetadata {
    fn new(uid: u32) -> Self {
        Self {
            uid,
            subscribers: RefCell::new(IndexSet::default()),
            notify_count: Cell::new(0),
        }
    }
}

/// Allocate a fresh dependency and return its ID
pub(crate) fn dep_arena_insert() -> DepId {
    let uid = NEXT_DEP_UID.with(|next| {
        let uid = next.get();
        next.set(uid + 1);
        uid
    });
    DEP_ARENA.with(|arena| {
        let mut arena = arena.borrow_mut();
        let entry = arena.vacant_entry();
        let index = entry.key() as u32;
        entry.insert(DepMetadata::new(uid));
        DepId { index, uid }
    })
}

/// Remove a dependency from the arena and from the dependency sets of all
/// of its subscribers.
pub(crate) fn dep_arena_remove(id: DepId) {
    let subscribers: Vec<WatcherId> = id
        .with_subs(|subs| subs.iter().copied().collect())
        .unwrap_or_default();
    for watcher in subscribers {
        watcher.forget_dep(id);
    }

    let removed = DEP_ARENA
        .try_with(|arena| {
            let mut arena = arena.borrow_mut();
            match arena.get(id.index()) {
                Some(meta) if meta.uid == id.uid => Some(arena.remove(id.index())),
                _ => None,
            }
        })
        .ok()
        .flatten();
    drop(removed);
}

/// Number of live dependencies on this thread
pub fn dep_count() -> usize {
    DEP_ARENA
        .try_with(|arena| arena.borrow().len())
        .unwrap_or(0)
}
