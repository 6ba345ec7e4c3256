use std::collections::HashSet;
use std::rc::Rc;

use crate::hash::FastHashBuilder;

use super::Value;

/// Read every nested property of `value` so the active unit depends on all
/// of them (deep watching).
///
/// Each object or array is visited once, so cyclic data terminates.
pub(crate) fn traverse(value: &Value) {
    let mut seen = HashSet::with_hasher(FastHashBuilder);
    visit(value, &mut seen);
}

fn visit(value: &Value, seen: &mut HashSet<usize, FastHashBuilder>) {
    match value {
        Value::Object(object) => {
            if object.is_raw() || !seen.insert(Rc::as_ptr(&object.0) as usize) {
                return;
            }
            for key in object.keys() {
                // Tracked read
                visit(&object.get(&key), seen);
            }
        }
        Value::Array(array) => {
            if array.is_raw() || !seen.insert(Rc::as_ptr(&array.0) as usize) {
                return;
            }
            for item in array.to_vec() {
                visit(&item, seen);
            }
        }
        _ => {}
    }
}
