use crate::arena::{watcher_arena_insert, WatcherMetadata, WatcherState, FLAG_LAZY};
use crate::dep::Dep;
use crate::error::{report, Error, Failure, Result};
use crate::watcher::Watcher;
use std::cell::RefCell;
use std::rc::Rc;

type Setter<T> = RefCell<Box<dyn FnMut(T)>>;

/// Lazily evaluated, cached derived value
///
/// A Computed runs its getter on the first read and caches the result. When
/// one of the getter's dependencies changes it does not recompute: it only
/// turns stale and notifies the units that read it. The next read recomputes.
///
/// # How it works
/// Internally, a Computed is composed of:
/// - A lazy evaluation unit that tracks the getter's dependencies
/// - A Dep that readers of the computed subscribe to
/// - The cached value of the last successful evaluation
///
/// # Example
/// ```ignore
/// let state = Object::from_entries([("x", 1), ("y", 2)]);
/// observe(&Value::from(state.clone()));
///
/// let sum = Computed::new({
///     let state = state.clone();
///     move || {
///         let x = state.get("x").as_number().unwrap_or(0.0);
///         let y = state.get("y").as_number().unwrap_or(0.0);
///         x + y
///     }
/// });
///
/// assert_eq!(sum.get(), 3.0); // Runs the getter
/// state.set("x", 5);          // Marks it stale, nothing runs
/// assert_eq!(sum.get(), 7.0); // Runs the getter again
/// ```
pub struct Computed<T> {
    /// Lazy unit recomputing the value.
    /// Declared before `dep` so the unit is torn down first.
    watcher: Watcher,

    /// Output dependency - readers subscribe to this.
    dep: Dep,

    /// Cached computed value
    value: Rc<RefCell<Option<T>>>,

    setter: Option<Setter<T>>,
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a computed value without setter
    pub fn new<F>(getter: F) -> Rc<Self>
    where
        F: FnMut() -> T + 'static,
    {
        Self::new_internal("computed", getter, None)
    }

    /// Create a computed value with a label used in diagnostics
    pub fn named<F>(label: &str, getter: F) -> Rc<Self>
    where
        F: FnMut() -> T + 'static,
    {
        Self::new_internal(label, getter, None)
    }

    /// Create a computed value whose [`set`](Computed::set) calls `setter`
    ///
    /// The setter usually writes the reactive state the getter reads.
    pub fn with_setter<F, S>(getter: F, setter: S) -> Rc<Self>
    where
        F: FnMut() -> T + 'static,
        S: FnMut(T) + 'static,
    {
        Self::new_internal("computed", getter, Some(Box::new(setter)))
    }

    fn new_internal<F>(label: &str, mut getter: F, setter: Option<Box<dyn FnMut(T)>>) -> Rc<Self>
    where
        F: FnMut() -> T + 'static,
    {
        let dep = Dep::new();
        let value: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));

        let value_for_unit = value.clone();
        let job = Box::new(move || {
            let fresh = getter();
            let previous = value_for_unit.borrow_mut().replace(fresh);
            drop(previous);
        });

        // Lazy units start stale: nothing runs until the first read
        let metadata =
            WatcherMetadata::new(Rc::from(label), FLAG_LAZY, job).with_own_dep(dep.id());
        let watcher = Watcher::from_raw(watcher_arena_insert(metadata));

        Rc::new(Self {
            watcher,
            dep,
            value,
            setter: setter.map(RefCell::new),
        })
    }

    fn read(&self) -> std::result::Result<T, Failure> {
        let id = self.watcher.id();
        if id.raw_state() == WatcherState::Stale {
            if let Err(failure) = id.evaluate() {
                // Still stale: the next change must reach the readers again
                id.set_stale_announced(false);
                let error = failure.error.clone();
                report(failure)?;
                // Handled: fall back to the last good value below
                if self.value.borrow().is_none() {
                    return Err(Failure::from_error(error));
                }
            }
        }

        // Track this computed as a dependency of the running unit
        self.dep.depend();

        let cached = self.value.borrow().clone();
        cached.ok_or_else(|| {
            Failure::from_error(Error::Computation {
                info: format!("getter for computed \"{}\"", id.label()),
                message: "value read during its own evaluation".to_string(),
            })
        })
    }

    /// Get the value, recomputing it first if it is stale
    ///
    /// # Panics
    /// Re-raises a panic of the getter when no error handler is configured.
    pub fn get(&self) -> T {
        match self.read() {
            Ok(value) => value,
            Err(failure) => failure.raise(),
        }
    }

    /// Like [`get`](Computed::get), returning getter failures as
    /// [`Error::Computation`]
    pub fn try_get(&self) -> Result<T> {
        self.read().map_err(|failure| failure.error)
    }

    /// Call the setter with `value`
    ///
    /// Fails with [`Error::ReadonlyComputed`] when there is no setter.
    pub fn set(&self, value: T) -> Result<()> {
        let Some(setter) = &self.setter else {
            return Err(Error::ReadonlyComputed(self.watcher.label().to_string()));
        };
        let mut setter = setter.borrow_mut();
        setter(value);
        Ok(())
    }

    /// Whether the next read recomputes
    pub fn is_stale(&self) -> bool {
        self.watcher.id().raw_state() == WatcherState::Stale
    }

    /// The lazy unit behind this computed
    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    /// The dependency readers subscribe to
    pub fn dep(&self) -> &Dep {
        &self.dep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::observer::{observe, Object, Value};
    use crate::watcher::WatchOptions;
    use std::cell::Cell;

    fn number(object: &Object, key: &str) -> f64 {
        object.get(key).as_number().unwrap_or(0.0)
    }

    #[test]
    fn computed_defers_and_caches() {
        let call_count = Rc::new(Cell::new(0));
        let computed = Computed::new({
            let call_count = call_count.clone();
            move || {
                call_count.set(call_count.get() + 1);
                42
            }
        });
        assert!(computed.is_stale());
        assert_eq!(call_count.get(), 0);

        assert_eq!(computed.get(), 42);
        assert_eq!(computed.get(), 42);
        assert_eq!(call_count.get(), 1);
        assert!(!computed.is_stale());
    }

    #[test]
    fn computed_turns_stale_on_change() {
        let state = Object::from_entries([("x", 1), ("y", 2)]);
        observe(&Value::from(state.clone()));
        let call_count = Rc::new(Cell::new(0));
        let sum = Computed::new({
            let state = state.clone();
            let call_count = call_count.clone();
            move || {
                call_count.set(call_count.get() + 1);
                number(&state, "x") + number(&state, "y")
            }
        });

        assert_eq!(sum.get(), 3.0);
        state.set("x", 5);
        assert!(sum.is_stale());
        assert_eq!(call_count.get(), 1);
        assert_eq!(sum.get(), 7.0);
        assert_eq!(call_count.get(), 2);
    }

    #[test]
    fn stale_computed_notifies_readers_once() {
        let state = Object::from_entries([("x", 1)]);
        observe(&Value::from(state.clone()));
        let double = Computed::new({
            let state = state.clone();
            move || number(&state, "x") * 2.0
        });
        assert_eq!(double.get(), 2.0);

        state.set("x", 2);
        state.set("x", 3);
        // Second change finds it already stale
        assert_eq!(double.dep().notify_count(), 1);
        assert_eq!(double.get(), 6.0);
    }

    #[test]
    fn computed_without_setter_is_readonly() {
        let computed = Computed::named("total", || 1);
        assert_eq!(
            computed.set(2),
            Err(Error::ReadonlyComputed("total".to_string()))
        );
    }

    #[test]
    fn setter_writes_through() {
        let state = Object::from_entries([("first", "Ada"), ("last", "Lovelace")]);
        observe(&Value::from(state.clone()));
        let full_name = Computed::with_setter(
            {
                let state = state.clone();
                move || {
                    format!(
                        "{} {}",
                        state.get("first").as_str().unwrap_or_default(),
                        state.get("last").as_str().unwrap_or_default()
                    )
                }
            },
            {
                let state = state.clone();
                move |name: String| {
                    if let Some((first, last)) = name.split_once(' ') {
                        state.set("first", first);
                        state.set("last", last);
                    }
                }
            },
        );
        assert_eq!(full_name.get(), "Ada Lovelace");
        assert_eq!(full_name.set("Grace Hopper".to_string()), Ok(()));
        assert!(full_name.is_stale());
        assert_eq!(full_name.get(), "Grace Hopper");
    }

    #[test]
    fn failed_evaluation_is_retried() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _config = Config::new()
            .error_handler({
                let seen = seen.clone();
                move |err| seen.borrow_mut().push(err.clone())
            })
            .install();

        let attempts = Rc::new(Cell::new(0));
        let flaky = Computed::named("flaky", {
            let attempts = attempts.clone();
            move || {
                attempts.set(attempts.get() + 1);
                if attempts.get() == 1 {
                    panic!("not yet");
                }
                attempts.get()
            }
        });

        assert!(flaky.try_get().is_err());
        assert_eq!(
            seen.borrow().as_slice(),
            [Error::Computation {
                info: "getter for computed \"flaky\"".to_string(),
                message: "not yet".to_string(),
            }]
        );
        assert!(flaky.is_stale());
        assert_eq!(flaky.try_get(), Ok(2));
    }

    #[test]
    fn readers_hear_about_recovery_after_handled_failure() {
        let _config = Config::new().error_handler(|_| {}).install();
        let state = Object::from_entries([("ok", Value::from(true)), ("x", Value::from(1))]);
        observe(&Value::from(state.clone()));
        let double = Computed::named("double", {
            let state = state.clone();
            move || {
                if state.get("ok") != Value::from(true) {
                    panic!("not ready");
                }
                number(&state, "x") * 2.0
            }
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _render = Watcher::render_with(
            {
                let double = double.clone();
                let seen = seen.clone();
                move || seen.borrow_mut().push(double.get())
            },
            WatchOptions::new().sync(true),
        );
        assert_eq!(*seen.borrow(), vec![2.0]);

        // Failed evaluation hands out the last good value and stays stale
        state.set("ok", false);
        assert_eq!(*seen.borrow(), vec![2.0, 2.0]);
        assert!(double.is_stale());

        state.set("x", 5);
        state.set("ok", true);
        assert_eq!(*seen.borrow(), vec![2.0, 2.0, 10.0]);
        assert!(!double.is_stale());
    }

    #[test]
    fn unhandled_failure_surfaces_from_try_get() {
        let broken = Computed::named("broken", || -> u32 { panic!("broken getter") });
        assert_eq!(
            broken.try_get(),
            Err(Error::Computation {
                info: "getter for computed \"broken\"".to_string(),
                message: "broken getter".to_string(),
            })
        );
    }
}
