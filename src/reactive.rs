use std::cell::RefCell;
use std::rc::Rc;

use crate::dep::Dep;

/// Typed reactive cell
///
/// Holds one value next to the [`Dep`] tracking it: [`get`](Reactive::get)
/// subscribes the running unit, [`set`](Reactive::set) notifies subscribers
/// when the value actually changed.
///
/// # Example
/// ```ignore
/// let width = Reactive::new(10.0);
/// let area = Computed::new({
///     let width = width.clone();
///     move || width.get() * 2.0
/// });
///
/// width.set(12.0); // area turns stale
/// ```
pub struct Reactive<T> {
    value: RefCell<T>,
    dep: Dep,
}

impl<T: Clone + PartialEq + 'static> Reactive<T> {
    /// Create a cell holding `value`
    pub fn new(value: T) -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(value),
            dep: Dep::new(),
        })
    }

    /// Read the value, tracking it as a dependency
    pub fn get(&self) -> T {
        self.dep.depend();
        self.value.borrow().clone()
    }

    /// Read the value without tracking
    pub fn get_untracked(&self) -> T {
        self.value.borrow().clone()
    }

    /// Replace the value; equal values do not notify
    pub fn set(&self, value: T) {
        let previous = {
            let mut current = self.value.borrow_mut();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value)
        };
        drop(previous);
        self.dep.notify();
    }

    /// Modify a copy of the value and store it with [`set`](Reactive::set)
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get_untracked();
        f(&mut value);
        self.set(value);
    }

    /// The dependency backing this cell
    pub fn dep(&self) -> &Dep {
        &self.dep
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Reactive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactive")
            .field("value", &self.value)
            .field("dep", &self.dep.uid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{WatchOptions, Watcher};
    use std::cell::Cell;

    #[test]
    fn equal_values_do_not_notify() {
        let cell = Reactive::new(1);
        cell.set(1);
        assert_eq!(cell.dep().notify_count(), 0);
        cell.set(2);
        cell.update(|v| *v += 1);
        assert_eq!(cell.get_untracked(), 3);
        assert_eq!(cell.dep().notify_count(), 2);
    }

    #[test]
    fn get_subscribes_the_running_unit() {
        let cell = Reactive::new(String::from("a"));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _watcher = Watcher::render_with(
            {
                let cell = cell.clone();
                let seen = seen.clone();
                move || seen.borrow_mut().push(cell.get())
            },
            WatchOptions::new().sync(true),
        );
        cell.set("b".to_string());
        assert_eq!(*seen.borrow(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cell.dep().subscriber_count(), 1);

        let runs = Rc::new(Cell::new(0));
        let _second = Watcher::render_with(
            {
                let cell = cell.clone();
                let runs = runs.clone();
                move || {
                    runs.set(runs.get() + 1);
                    cell.get_untracked();
                }
            },
            WatchOptions::new().sync(true),
        );
        cell.set("c".to_string());
        assert_eq!(runs.get(), 1);
    }
}
