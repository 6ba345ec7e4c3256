//! Observation layer: makes objects and arrays report reads and writes.
//!
//! An [`Observer`] is attached to every object or array that entered the
//! reactive system. For objects it turns each own property into a reactive
//! property backed by its own [`Dep`]; for arrays it observes the elements.
//! Its own dependency is notified for structural changes the property
//! dependencies cannot express: keys added with [`set`] or removed with
//! [`del`], and array mutations.

mod array;
mod traverse;
mod value;

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::arena::DepId;
use crate::dep::Dep;
use crate::error::{Error, Result};

pub(crate) use traverse::traverse;
pub use value::{Array, Key, Object, Value};

use value::{ArrayInner, ObjectInner, Property, Reactivity};

enum Target {
    Object(Weak<ObjectInner>),
    Array(Weak<ArrayInner>),
}

struct ObserverInner {
    dep: Dep,
    /// Number of roots using the value as their data
    vm_count: Cell<u32>,
    target: Target,
}

/// Observable wrapper of one object or array
///
/// Created once per value by [`observe`]; observing the value again returns
/// the same observer. It lives as long as the value it wraps.
#[derive(Clone)]
pub struct Observer(Rc<ObserverInner>);

impl Observer {
    fn new(target: Target) -> Self {
        Observer(Rc::new(ObserverInner {
            dep: Dep::new(),
            vm_count: Cell::new(0),
            target,
        }))
    }

    /// Unique identifier (the id of its dependency)
    pub fn id(&self) -> u32 {
        self.0.dep.uid()
    }

    /// Collection-level dependency
    pub fn dep(&self) -> &Dep {
        &self.0.dep
    }

    pub(crate) fn dep_id(&self) -> DepId {
        self.0.dep.id()
    }

    /// How many roots use the wrapped value as their data
    pub fn vm_count(&self) -> u32 {
        self.0.vm_count.get()
    }

    /// The wrapped value, while it is alive
    pub fn value(&self) -> Option<Value> {
        match &self.0.target {
            Target::Object(weak) => weak.upgrade().map(|inner| Value::Object(Object(inner))),
            Target::Array(weak) => weak.upgrade().map(|inner| Value::Array(Array(inner))),
        }
    }

    /// Whether both handles are the same observer
    pub fn ptr_eq(&self, other: &Observer) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id())
            .field("vm_count", &self.vm_count())
            .finish()
    }
}

/// Attach an observer to `value`, or return the one it already has.
///
/// Objects get all their properties made reactive (recursively), arrays get
/// their elements observed. Primitives and values excluded with
/// [`mark_raw`] are not observed and yield `None`.
pub fn observe(value: &Value) -> Option<Observer> {
    match value {
        Value::Object(object) => {
            if let Some(ob) = object.0.ob.get() {
                return Some(ob.clone());
            }
            if object.is_raw() {
                return None;
            }
            // Attached before walking, so cycles terminate
            let ob = object
                .0
                .ob
                .get_or_init(|| Observer::new(Target::Object(Rc::downgrade(&object.0))))
                .clone();
            walk(object);
            Some(ob)
        }
        Value::Array(array) => {
            if let Some(ob) = array.0.ob.get() {
                return Some(ob.clone());
            }
            if array.is_raw() {
                return None;
            }
            let ob = array
                .0
                .ob
                .get_or_init(|| Observer::new(Target::Array(Rc::downgrade(&array.0))))
                .clone();
            observe_items(&array.to_vec());
            Some(ob)
        }
        _ => None,
    }
}

/// [`observe`] a value used as the root data of a component.
///
/// Root data can not gain or lose keys through [`set`]/[`del`].
pub fn observe_root(value: &Value) -> Option<Observer> {
    let ob = observe(value)?;
    ob.0.vm_count.set(ob.0.vm_count.get() + 1);
    Some(ob)
}

/// Exclude `value` from observation. Has no effect on an already observed
/// value.
pub fn mark_raw(value: &Value) {
    match value {
        Value::Object(object) => object.0.raw.set(true),
        Value::Array(array) => array.0.raw.set(true),
        _ => {}
    }
}

pub(crate) fn observe_items(items: &[Value]) {
    for item in items {
        observe(item);
    }
}

fn walk(object: &Object) {
    for key in object.keys() {
        let existing = {
            let props = object.0.props.borrow();
            props
                .get(&key)
                .map(|prop| (prop.value.clone(), prop.reactive.is_some()))
        };
        match existing {
            // Keep the dependency (and its subscribers) of reactive properties
            Some((value, true)) => {
                let child = observe(&value);
                let mut props = object.0.props.borrow_mut();
                if let Some(reactive) = props.get_mut(&key).and_then(|prop| prop.reactive.as_mut()) {
                    if !reactive.shallow {
                        reactive.child = child;
                    }
                }
            }
            Some((value, false)) => define(object, key, value, false),
            None => {}
        }
    }
}

fn define(object: &Object, key: Rc<str>, value: Value, shallow: bool) {
    let child = if shallow { None } else { observe(&value) };
    let property = Property {
        value,
        reactive: Some(Reactivity {
            dep: Dep::new(),
            shallow,
            child,
        }),
    };
    let replaced = object.0.props.borrow_mut().insert(key, property);
    drop(replaced);
}

/// Define (or redefine) `key` on `object` as a reactive property holding
/// `value`, observing the value recursively.
pub fn define_reactive(object: &Object, key: &str, value: impl Into<Value>) {
    define(object, Rc::from(key), value.into(), false);
}

/// Like [`define_reactive`], without observing the value: only assignments
/// of the property itself are tracked.
pub fn define_reactive_shallow(object: &Object, key: &str, value: impl Into<Value>) {
    define(object, Rc::from(key), value.into(), true);
}

/// Subscribe the active unit to the observers of every element of `array`,
/// recursively for nested arrays.
pub(crate) fn depend_array(array: &Array) {
    for item in array.to_vec() {
        match &item {
            Value::Object(object) => {
                if let Some(ob) = object.0.ob.get() {
                    ob.dep().depend();
                }
            }
            Value::Array(nested) => {
                if let Some(ob) = nested.0.ob.get() {
                    ob.dep().depend();
                }
                depend_array(nested);
            }
            _ => {}
        }
    }
}

/// Assign `key` on `target`, adding it as a reactive property if needed.
///
/// - existing object keys are assigned through [`Object::set`]
/// - array indices replace the element, padding with `Null` past the end
/// - new keys on an observed object become reactive and notify the
///   observer's dependency, so units depending on the key set re-run
/// - new keys on an unobserved object are plain assignments
///
/// Returns the assigned value.
pub fn set(target: &Value, key: impl Into<Key>, value: impl Into<Value>) -> Result<Value> {
    let key = key.into();
    let value = value.into();
    match (target, &key) {
        (Value::Array(array), Key::Index(index)) => {
            array.pad_to(*index);
            array.splice(*index, 1, vec![value.clone()]);
            Ok(value)
        }
        (Value::Object(object), _) => {
            let name = key.to_name();
            if object.contains_key(&name) {
                object.set(&name, value.clone());
                return Ok(value);
            }
            let ob = object.observer();
            if ob.as_ref().is_some_and(|ob| ob.vm_count() > 0) {
                return Err(Error::RootDataMutation);
            }
            match ob {
                None => object.set(&name, value.clone()),
                Some(ob) => {
                    define(object, name, value.clone(), false);
                    ob.dep().notify();
                }
            }
            Ok(value)
        }
        _ => Err(Error::InvalidTarget { op: "set" }),
    }
}

/// Delete `key` from `target`, notifying the observer's dependency if the
/// target is observed. Missing keys are ignored.
pub fn del(target: &Value, key: impl Into<Key>) -> Result<()> {
    let key = key.into();
    match (target, &key) {
        (Value::Array(array), Key::Index(index)) => {
            if *index < array.len() {
                array.splice(*index, 1, Vec::new());
            }
            Ok(())
        }
        (Value::Object(object), _) => {
            let ob = object.observer();
            if ob.as_ref().is_some_and(|ob| ob.vm_count() > 0) {
                return Err(Error::RootDataMutation);
            }
            if object.remove(&key.to_name()).is_none() {
                return Ok(());
            }
            if let Some(ob) = ob {
                ob.dep().notify();
            }
            Ok(())
        }
        _ => Err(Error::InvalidTarget { op: "delete" }),
    }
}
