#![deny(missing_docs)]

//! Dependency-tracking reactive core for component-based rendering.
//!
//! Plain data is made observable, computations record which observable
//! values they read while running, and changes re-run exactly the
//! computations that read the changed value. Re-runs are batched per update
//! cycle and happen in creation order.
//!
//! # Quick Start
//!
//! ```ignore
//! use reaktiv_observer::{flush, observe, Object, Value, Watcher};
//!
//! let state = Object::from_entries([("count", 0)]);
//! observe(&Value::from(state.clone()));
//!
//! // Runs immediately and records `count` as a dependency
//! let render = Watcher::render({
//!     let state = state.clone();
//!     move || println!("count = {:?}", state.get("count"))
//! });
//!
//! state.set("count", 1);
//! state.set("count", 2);
//! state.set("count", 3);
//!
//! flush()?; // render runs once, printing count = Number(3)
//! ```
//!
//! # Core Types
//!
//! - [`Value`], [`Object`], [`Array`] - dynamic data; [`observe`] makes it reactive.
//! - [`Dep`] - subscriber registry for one observable slot.
//! - [`Watcher`] - evaluation unit (render or watch) re-running on change.
//! - [`Computed<T>`] - lazily evaluated, cached derived value.
//! - [`Reactive<T>`] - typed reactive cell.
//!
//! # Observing data
//!
//! ```ignore
//! let value = Value::from(object.clone());
//! observe(&value);              // Properties become reactive (recursively)
//! object.get("a");              // Tracked read
//! object.set("a", 2);           // Notifies readers
//! set(&value, "b", 3)?;         // Add a reactive key, notify key-set readers
//! del(&value, "a")?;            // Remove a key, notify key-set readers
//! array.push(4);                // Array mutators notify the array's readers
//! ```
//!
//! # Watching
//!
//! ```ignore
//! let w = watch(move || state.get("name"), |new, old| println!("{old:?} -> {new:?}"));
//! let p = watch_path(&root, "user.name", |new, _| println!("{new:?}"), WatchOptions::new())?;
//! let s = watch_with(source, callback, WatchOptions::new().sync(true).deep(true));
//! ```
//!
//! # Update cycle
//!
//! ```ignore
//! flush()?;                      // Run queued units and tick callbacks
//! batch(|| { /* changes */ })?;  // Defer re-runs to the end of the closure
//! next_tick(|| { ... });         // Run after the next flush of units
//! is_flush_pending();            // Check if work is queued
//! untracked(|| { ... });         // Read without subscribing
//! ```
//!
//! All state is per thread. Hosts with an event loop install
//! [`Config::on_tick`] to learn when a flush should be scheduled.

// Internal modules
pub(crate) mod arena;
mod batch;
mod computed;
mod config;
mod dep;
mod error;
mod hash;
mod observer;
mod reactive;
mod scheduler;
mod tick;
mod watcher;

// Core types
pub use arena::{DepId, WatcherId, WatcherState};
pub use computed::Computed;
pub use dep::Dep;
pub use observer::{Array, Key, Object, Observer, Value};
pub use reactive::Reactive;
pub use watcher::{WatchOptions, Watcher};

// Observation
pub use observer::{define_reactive, define_reactive_shallow, del, mark_raw, observe, observe_root, set};

// Watching and the update cycle
pub use batch::{batch, is_batching};
pub use tick::{flush, is_flush_pending, next_tick};
pub use watcher::{untracked, watch, watch_path, watch_with};

// Configuration and errors
pub use config::{Config, ConfigGuard, DEFAULT_MAX_UPDATE_COUNT};
pub use error::{Error, Result};

// Diagnostics
pub use arena::{dep_count, watcher_count};
