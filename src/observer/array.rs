// Intercepted array mutations
//
// Each mutator performs the real operation first, observes the elements it
// inserted and then notifies the array's observer. Arrays that were never
// observed are mutated silently.

use std::cmp::Ordering;

use super::{observe_items, Array, Value};

impl Array {
    fn mutated(&self, inserted: &[Value]) {
        let Some(ob) = self.observer() else {
            return;
        };
        observe_items(inserted);
        ob.dep().notify();
    }

    /// Append `value`, returning the new length
    pub fn push(&self, value: impl Into<Value>) -> usize {
        let value = value.into();
        let len = {
            let mut items = self.0.items.borrow_mut();
            items.push(value.clone());
            items.len()
        };
        self.mutated(&[value]);
        len
    }

    /// Remove and return the last element
    pub fn pop(&self) -> Option<Value> {
        let removed = self.0.items.borrow_mut().pop();
        self.mutated(&[]);
        removed
    }

    /// Remove and return the first element
    pub fn shift(&self) -> Option<Value> {
        let removed = {
            let mut items = self.0.items.borrow_mut();
            (!items.is_empty()).then(|| items.remove(0))
        };
        self.mutated(&[]);
        removed
    }

    /// Prepend `value`, returning the new length
    pub fn unshift(&self, value: impl Into<Value>) -> usize {
        let value = value.into();
        let len = {
            let mut items = self.0.items.borrow_mut();
            items.insert(0, value.clone());
            items.len()
        };
        self.mutated(&[value]);
        len
    }

    /// Remove `delete_count` elements at `start` and insert `items` there.
    ///
    /// `start` and `delete_count` are clamped to the array bounds. Returns
    /// the removed elements.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Vec<Value> {
        let removed = {
            let mut current = self.0.items.borrow_mut();
            let start = start.min(current.len());
            let end = start.saturating_add(delete_count).min(current.len());
            current.splice(start..end, items.iter().cloned()).collect::<Vec<_>>()
        };
        self.mutated(&items);
        removed
    }

    /// Sort with [`Value::sort_cmp`]
    pub fn sort(&self) {
        self.sort_by(Value::sort_cmp);
    }

    /// Sort with a comparator (stable)
    pub fn sort_by<F>(&self, compare: F)
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        // The comparator may read the array, so it runs on a copy
        let mut sorted = self.to_vec();
        sorted.sort_by(compare);
        let previous = std::mem::replace(&mut *self.0.items.borrow_mut(), sorted);
        drop(previous);
        self.mutated(&[]);
    }

    /// Reverse the elements in place
    pub fn reverse(&self) {
        self.0.items.borrow_mut().reverse();
        self.mutated(&[]);
    }

    /// Grow the array to `len` elements with `Null`, without notifying
    pub(crate) fn pad_to(&self, len: usize) {
        let mut items = self.0.items.borrow_mut();
        if items.len() < len {
            items.resize(len, Value::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{observe, Object};

    fn numbers(array: &Array) -> Vec<f64> {
        array.to_vec().iter().filter_map(Value::as_number).collect()
    }

    #[test]
    fn mutators_behave_like_their_vec_counterparts() {
        let array = Array::from_vec(vec![Value::from(3), Value::from(1), Value::from(2)]);
        assert_eq!(array.push(4), 4);
        assert_eq!(array.unshift(0), 5);
        assert_eq!(array.pop(), Some(Value::from(4)));
        assert_eq!(array.shift(), Some(Value::from(0)));
        assert_eq!(numbers(&array), vec![3.0, 1.0, 2.0]);

        array.sort();
        assert_eq!(numbers(&array), vec![1.0, 2.0, 3.0]);
        array.reverse();
        assert_eq!(numbers(&array), vec![3.0, 2.0, 1.0]);

        let removed = array.splice(1, 5, vec![Value::from(9)]);
        assert_eq!(removed, vec![Value::from(2), Value::from(1)]);
        assert_eq!(numbers(&array), vec![3.0, 9.0]);

        assert_eq!(Array::new().shift(), None);
    }

    #[test]
    fn mutations_of_observed_array_notify_and_observe_inserted() {
        let array = Array::new();
        let ob = observe(&Value::from(array.clone())).expect("arrays are observable");

        let element = Object::from_entries([("x", 1)]);
        array.push(element.clone());
        assert!(element.observer().is_some());
        assert!(element.is_reactive("x"));

        array.splice(0, 0, vec![Value::from(Object::new())]);
        array.pop();
        array.sort_by(|a, b| b.sort_cmp(a));
        assert_eq!(ob.dep().notify_count(), 4);
    }

    #[test]
    fn unobserved_array_does_not_observe_elements() {
        let array = Array::new();
        let element = Object::new();
        array.push(element.clone());
        assert!(element.observer().is_none());
    }
}
