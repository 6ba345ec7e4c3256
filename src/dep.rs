use crate::arena::{dep_arena_insert, dep_arena_remove, DepId};

/// Subscriber registry for one observable slot.
///
/// A `Dep` holds no value. Whoever owns the observed data calls
/// [`depend`](Dep::depend) when the data is read and [`notify`](Dep::notify)
/// after it changed. Reactive properties, observed collections, computed
/// values and [`Reactive`](crate::Reactive) cells are all built on this.
///
/// # Usage
/// ```ignore
/// struct Counter {
///     count: Cell<u32>,
///     dep: Dep,
/// }
///
/// impl Counter {
///     fn get(&self) -> u32 {
///         self.dep.depend(); // Track if a unit is running
///         self.count.get()
///     }
///
///     fn increment(&self) {
///         self.count.set(self.count.get() + 1);
///         self.dep.notify(); // Re-run (or queue) subscribers
///     }
/// }
/// ```
///
/// Dropping a `Dep` removes it from the dependency sets of all its
/// subscribers.
#[derive(Debug)]
pub struct Dep {
    id: DepId,
}

impl Dep {
    /// Allocate a new dependency in the arena
    pub fn new() -> Self {
        Dep {
            id: dep_arena_insert(),
        }
    }

    /// Copyable id of this dependency
    pub fn id(&self) -> DepId {
        self.id
    }

    /// Unique creation-order identifier
    pub fn uid(&self) -> u32 {
        self.id.uid()
    }

    /// Register the active unit (if any) as a subscriber
    pub fn depend(&self) {
        self.id.depend();
    }

    /// Notify all subscribers of a change.
    ///
    /// Lazy subscribers turn stale, synchronous ones re-run right away and
    /// all others are queued for the next flush.
    ///
    /// # Panics
    /// Re-raises the panic of a synchronous subscriber when no error handler
    /// is configured. All subscribers are notified before that happens.
    pub fn notify(&self) {
        self.id.notify_or_raise();
    }

    /// Number of units currently subscribed
    pub fn subscriber_count(&self) -> usize {
        self.id.with_subs(|subs| subs.len()).unwrap_or(0)
    }

    /// How often this dependency notified its subscribers
    pub fn notify_count(&self) -> u64 {
        self.id.notify_count()
    }
}

impl Default for Dep {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dep {
    fn drop(&mut self) {
        dep_arena_remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::dep_count;

    #[test]
    fn drop_frees_arena_slot() {
        let before = dep_count();
        let dep = Dep::new();
        assert_eq!(dep_count(), before + 1);
        drop(dep);
        assert_eq!(dep_count(), before);
    }

    #[test]
    fn notify_without_subscribers_is_counted() {
        let dep = Dep::new();
        dep.depend();
        dep.notify();
        dep.notify();
        assert_eq!(dep.subscriber_count(), 0);
        assert_eq!(dep.notify_count(), 2);
    }

    #[test]
    fn uids_increase() {
        let first = Dep::new();
        let second = Dep::new();
        assert!(second.uid() > first.uid());
    }
}
