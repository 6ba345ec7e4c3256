// Arena-based storage for reactive node metadata
//
// This module provides two separate arenas:
// - Dep arena: stores DepMetadata (subscribers, notification count)
// - Watcher arena: stores WatcherMetadata (dependency sets, state, closures)
//
// Both arenas are per-thread slabs behind RefCell. DepId and WatcherId are
// copyable generational ids indexing into the slabs; ids of removed entries
// are inert.

// watcher_arena first: dep_arena depends on WatcherId and the target stack
pub mod watcher_arena;
pub mod dep_arena;

pub use watcher_arena::{watcher_count, WatcherId, WatcherState};
pub(crate) use watcher_arena::{
    current_target, watcher_arena_insert, watcher_arena_remove, Slot, TargetGuard,
    WatcherMetadata, FLAG_LAZY, FLAG_SYNC, FLAG_USER,
};

pub use dep_arena::{dep_count, DepId};
pub(crate) use dep_arena::{dep_arena_insert, dep_arena_remove};
