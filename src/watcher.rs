use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::arena::{
    watcher_arena_insert, watcher_arena_remove, Slot, TargetGuard, WatcherId, WatcherMetadata,
    WatcherState, FLAG_LAZY, FLAG_SYNC, FLAG_USER,
};
use crate::error::{invoke_guarded, report, Error, Failure, Result};
use crate::observer::{traverse, Value};
use crate::scheduler::queue_watcher;

/// Run `f` without attributing its reads to the active unit
///
/// # Example
/// ```ignore
/// let watcher = Watcher::render(move || {
///     let tracked = state.get("count");
///     let peeked = untracked(|| state.get("other")); // no subscription
/// });
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    // The guard restores the previous target even if f panics
    let _guard = TargetGuard::new(None);
    f()
}

// =============================================================================
// Run protocol
// =============================================================================

impl WatcherId {
    fn describe(self, what: &str) -> String {
        let kind = if self.has_flag(FLAG_LAZY) {
            "computed"
        } else if self.has_flag(FLAG_USER) {
            "watcher"
        } else {
            "render unit"
        };
        format!("{what} for {kind} \"{}\"", self.label())
    }

    /// Execute the body as the ambient target and reconcile dependencies.
    ///
    /// Dependencies read before a failure are kept.
    fn collect(self) -> std::result::Result<(), Failure> {
        self.clear_new_deps();
        self.set_running(true);
        let outcome = {
            let _target = TargetGuard::new(Some(self));
            invoke_guarded(
                || self.describe("getter"),
                || {
                    self.run_job(Slot::Getter);
                },
            )
        };
        self.set_running(false);
        self.cleanup_deps();
        outcome
    }

    fn invoke_callback(self) -> std::result::Result<(), Failure> {
        let _untracked = TargetGuard::new(None);
        invoke_guarded(
            || self.describe("callback"),
            || {
                self.run_job(Slot::Callback);
            },
        )
    }

    /// Run the `before` hook the scheduler calls ahead of a queued re-run
    pub(crate) fn run_before(self) -> std::result::Result<(), Failure> {
        if !self.has_job(Slot::Before) {
            return Ok(());
        }
        let _untracked = TargetGuard::new(None);
        invoke_guarded(
            || self.describe("before hook"),
            || {
                self.run_job(Slot::Before);
            },
        )
        .or_else(report)
    }

    /// Re-run the body, then the callback (watch units).
    ///
    /// Failures are reported; an `Err` means no error handler took it.
    pub(crate) fn run(self) -> std::result::Result<(), Failure> {
        if self.raw_state() == WatcherState::TornDown {
            return Ok(());
        }
        if self.is_running() {
            cov_mark::hit!(reentrant_run_skipped);
            return Ok(());
        }
        trace!(unit = %self.label(), uid = self.uid(), "run");
        // A re-queue during the run leaves the unit Queued
        self.set_state(WatcherState::Idle);
        let collected = self.collect();
        match collected {
            Err(failure) => report(failure),
            Ok(()) if self.has_job(Slot::Callback) => self.invoke_callback().or_else(report),
            Ok(()) => Ok(()),
        }
    }

    /// Recompute a lazy unit.
    ///
    /// The unit only becomes clean when its getter succeeded, so a failed
    /// computation is retried on the next read.
    pub(crate) fn evaluate(self) -> std::result::Result<(), Failure> {
        if self.is_running() {
            cov_mark::hit!(reentrant_run_skipped);
            return Ok(());
        }
        self.collect()?;
        self.set_state(WatcherState::Idle);
        Ok(())
    }

    /// React to a change of one of the dependencies.
    pub(crate) fn update(self) -> std::result::Result<(), Failure> {
        match self.raw_state() {
            WatcherState::TornDown => Ok(()),
            state if self.has_flag(FLAG_LAZY) => {
                // Readers hear about each staleness once
                if state == WatcherState::Stale && self.stale_announced() {
                    return Ok(());
                }
                self.set_state(WatcherState::Stale);
                self.set_stale_announced(true);
                match self.own_dep() {
                    Some(dep) => dep.notify(),
                    None => Ok(()),
                }
            }
            _ if self.has_flag(FLAG_SYNC) => self.run(),
            _ => queue_watcher(self),
        }
    }

    /// Unsubscribe from everything; the unit never runs again.
    pub(crate) fn teardown(self) -> Result<()> {
        if self.is_running() {
            return Err(Error::TeardownWhileActive {
                unit: self.label().to_string(),
            });
        }
        if self.raw_state() != WatcherState::TornDown {
            self.unsubscribe_all();
            self.set_state(WatcherState::TornDown);
        }
        Ok(())
    }
}

// =============================================================================
// Options
// =============================================================================

/// Options for render and watch units
///
/// ```ignore
/// let options = WatchOptions::new()
///     .label("profile")
///     .deep(true)
///     .immediate(true);
/// ```
#[derive(Default)]
pub struct WatchOptions {
    label: Option<Rc<str>>,
    deep: bool,
    sync: bool,
    immediate: bool,
    before: Option<Box<dyn FnMut()>>,
}

impl WatchOptions {
    /// Default options: queued, shallow, callback only on change
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in diagnostics
    pub fn label(mut self, label: impl Into<Rc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Track every nested property of the watched value
    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    /// Re-run right at notification instead of queueing
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Invoke the callback once on creation with `Null` as old value
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Hook the scheduler runs right before a queued re-run
    pub fn before(mut self, hook: impl FnMut() + 'static) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    fn flags(&self, user: bool) -> u8 {
        let mut flags = 0;
        if self.sync {
            flags |= FLAG_SYNC;
        }
        if user {
            flags |= FLAG_USER;
        }
        flags
    }
}

impl std::fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchOptions")
            .field("label", &self.label)
            .field("deep", &self.deep)
            .field("sync", &self.sync)
            .field("immediate", &self.immediate)
            .field("before", &self.before.is_some())
            .finish()
    }
}

// =============================================================================
// Watcher handle
// =============================================================================

/// Handle to an evaluation unit that re-runs when its dependencies change
///
/// A unit runs once on creation, recording every reactive read as a
/// dependency. When one of them changes the unit is queued and re-runs at
/// the next [`flush`](crate::flush), in creation order with the other queued
/// units. Each run replaces the dependency set, so reads that stop happening
/// stop triggering re-runs.
///
/// # Example
/// ```ignore
/// let state = Object::new();
/// state.set("count", 0);
/// observe(&Value::Object(state.clone()));
///
/// let render = Watcher::render({
///     let state = state.clone();
///     move || println!("count = {:?}", state.get("count"))
/// });
///
/// state.set("count", 1);
/// state.set("count", 2);
/// flush()?; // prints once: count = Number(2.0)
/// ```
///
/// Dropping the handle tears the unit down.
pub struct Watcher {
    id: WatcherId,
}

impl Watcher {
    /// Create a render unit and run it immediately
    ///
    /// # Panics
    /// Re-raises a panic of the first run when no error handler is
    /// configured.
    pub fn render<F>(body: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self::render_with(body, WatchOptions::new())
    }

    /// Create a render unit with options (`label`, `sync`, `before`)
    pub fn render_with<F>(body: F, options: WatchOptions) -> Self
    where
        F: FnMut() + 'static,
    {
        let label = options.label.clone().unwrap_or_else(|| Rc::from("render"));
        let metadata = WatcherMetadata::new(label, options.flags(false), Box::new(body))
            .with_before(options.before);
        Self::start(metadata)
    }

    fn start(metadata: WatcherMetadata) -> Self {
        // Wrapped before the first run so an unwinding run still frees it
        let watcher = Watcher {
            id: watcher_arena_insert(metadata),
        };
        if let Err(failure) = watcher.id.run() {
            failure.raise();
        }
        watcher
    }

    /// Wrap an existing unit id (internal use only)
    pub(crate) fn from_raw(id: WatcherId) -> Self {
        Self { id }
    }

    /// Copyable id of this unit
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Creation-order identifier
    pub fn uid(&self) -> u32 {
        self.id.uid()
    }

    /// Diagnostic label
    pub fn label(&self) -> Rc<str> {
        self.id.label()
    }

    /// Current lifecycle state
    pub fn state(&self) -> WatcherState {
        self.id.state()
    }

    /// Number of dependencies recorded by the last run
    pub fn dependency_count(&self) -> usize {
        self.id.dep_ids().len()
    }

    /// Trigger the unit as if a dependency changed
    ///
    /// # Panics
    /// Like [`Dep::notify`](crate::Dep::notify) for synchronous units.
    pub fn force_update(&self) {
        if let Err(failure) = self.id.update() {
            failure.raise();
        }
    }

    /// Unsubscribe from all dependencies without dropping the handle.
    ///
    /// Queued re-runs of a torn down unit are skipped.
    pub fn teardown(&self) -> Result<()> {
        self.id.teardown()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.id.unsubscribe_all();
        self.id.set_state(WatcherState::TornDown);
        watcher_arena_remove(self.id);
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("uid", &self.uid())
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Watch units
// =============================================================================

struct WatchSlot {
    current: Value,
    fresh: Option<Value>,
    initialized: bool,
}

/// Watch the value produced by `source`, calling `callback(new, old)` when it
/// changes.
///
/// Object and array values always trigger the callback when a tracked read
/// changed, since they may have been mutated in place.
pub fn watch<S, C>(source: S, callback: C) -> Watcher
where
    S: FnMut() -> Value + 'static,
    C: FnMut(&Value, &Value) + 'static,
{
    watch_with(source, callback, WatchOptions::new())
}

/// [`watch`] with options
pub fn watch_with<S, C>(mut source: S, mut callback: C, options: WatchOptions) -> Watcher
where
    S: FnMut() -> Value + 'static,
    C: FnMut(&Value, &Value) + 'static,
{
    let WatchOptions {
        deep, immediate, ..
    } = options;
    let flags = options.flags(true);
    let label = options.label.unwrap_or_else(|| Rc::from("watcher"));

    let slot = Rc::new(RefCell::new(WatchSlot {
        current: Value::Null,
        fresh: None,
        initialized: false,
    }));

    let getter_slot = slot.clone();
    let getter = Box::new(move || {
        let value = source();
        if deep {
            traverse(&value);
        }
        getter_slot.borrow_mut().fresh = Some(value);
    });

    let on_change = Box::new(move || {
        let fire = {
            let mut slot = slot.borrow_mut();
            let Some(new) = slot.fresh.take() else {
                return;
            };
            if !slot.initialized {
                slot.initialized = true;
                slot.current = new.clone();
                immediate.then(|| (new, Value::Null))
            } else if new != slot.current || new.is_object_like() || deep {
                let old = std::mem::replace(&mut slot.current, new.clone());
                Some((new, old))
            } else {
                None
            }
        };
        if let Some((new, old)) = fire {
            callback(&new, &old);
        }
    });

    let metadata = WatcherMetadata::new(label, flags, getter)
        .with_callback(Some(on_change))
        .with_before(options.before);
    Watcher::start(metadata)
}

/// Watch a dot-delimited property path such as `"user.address.city"`.
///
/// Segments address object properties (tracked) and array indices.
pub fn watch_path<C>(target: &Value, path: &str, callback: C, options: WatchOptions) -> Result<Watcher>
where
    C: FnMut(&Value, &Value) + 'static,
{
    let segments = parse_path(path)?;
    let target = target.clone();
    let options = match options.label {
        Some(_) => options,
        None => options.label(path),
    };
    let source = move || {
        segments
            .iter()
            .try_fold(target.clone(), |value, segment| match &value {
                Value::Object(object) => Some(object.get(segment)),
                Value::Array(array) => segment.parse::<usize>().ok().map(|index| array.get(index)),
                _ => None,
            })
            .unwrap_or(Value::Null)
    };
    Ok(watch_with(source, callback, options))
}

fn parse_path(path: &str) -> Result<Vec<Rc<str>>> {
    let valid = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'));
    if !valid {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(path.split('.').map(Rc::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{observe, Object};
    use std::cell::Cell;

    #[test]
    fn parse_path_rejects_brackets() {
        assert_eq!(
            parse_path("a[0]").unwrap_err(),
            Error::InvalidPath("a[0]".to_string())
        );
        assert_eq!(parse_path("a.$b.c_1").unwrap().len(), 3);
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let state = Object::new();
        state.set("a", 1);
        state.set("b", 2);
        observe(&Value::Object(state.clone()));

        let runs = Rc::new(Cell::new(0));
        let watcher = Watcher::render_with(
            {
                let state = state.clone();
                let runs = runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    state.get("a");
                    untracked(|| state.get("b"));
                }
            },
            WatchOptions::new().sync(true),
        );
        assert_eq!(watcher.dependency_count(), 1);

        state.set("b", 3);
        assert_eq!(runs.get(), 1);
        state.set("a", 4);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn teardown_stops_updates() {
        let state = Object::new();
        state.set("a", 1);
        observe(&Value::Object(state.clone()));

        let runs = Rc::new(Cell::new(0));
        let watcher = Watcher::render_with(
            {
                let state = state.clone();
                let runs = runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    state.get("a");
                }
            },
            WatchOptions::new().sync(true).label("counter"),
        );
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert!(watcher.teardown().is_ok());
        assert_eq!(watcher.state(), WatcherState::TornDown);
        assert_eq!(watcher.dependency_count(), 0);

        state.set("a", 2);
        watcher.force_update();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn teardown_while_active_is_rejected() {
        let handle: Rc<RefCell<Option<Watcher>>> = Rc::new(RefCell::new(None));
        let outcome = Rc::new(RefCell::new(None));
        let watcher = Watcher::render_with(
            {
                let handle = handle.clone();
                let outcome = outcome.clone();
                move || {
                    if let Some(watcher) = handle.borrow().as_ref() {
                        *outcome.borrow_mut() = Some(watcher.teardown());
                    }
                }
            },
            WatchOptions::new().sync(true).label("self-destructing"),
        );
        *handle.borrow_mut() = Some(watcher);

        if let Some(watcher) = handle.borrow().as_ref() {
            watcher.force_update();
        }
        assert_eq!(
            *outcome.borrow(),
            Some(Err(Error::TeardownWhileActive {
                unit: "self-destructing".to_string()
            }))
        );
        let state = handle.borrow().as_ref().map(Watcher::state);
        assert_eq!(state, Some(WatcherState::Idle));
    }

    #[test]
    fn watch_immediate_passes_null_old_value() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let _watcher = watch_with(
            || Value::from(7),
            {
                let calls = calls.clone();
                move |new, old| calls.borrow_mut().push((new.clone(), old.clone()))
            },
            WatchOptions::new().immediate(true),
        );
        assert_eq!(*calls.borrow(), vec![(Value::from(7), Value::Null)]);
    }

    #[test]
    fn reentrant_run_is_skipped() {
        cov_mark::check!(reentrant_run_skipped);
        let state = Object::new();
        state.set("n", 0);
        observe(&Value::Object(state.clone()));

        let runs = Rc::new(Cell::new(0));
        let _watcher = Watcher::render_with(
            {
                let state = state.clone();
                let runs = runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    let n = state.get("n").as_number().unwrap_or(0.0);
                    state.set("n", n + 1.0);
                }
            },
            WatchOptions::new().sync(true),
        );
        assert_eq!(runs.get(), 1);
        assert_eq!(state.get("n"), Value::from(1));
    }
}
