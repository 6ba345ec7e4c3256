//! Dynamic values the observation layer works on.
//!
//! `Object` and `Array` are shared handles: cloning one clones the handle,
//! not the data, and equality between them is identity. Everything else
//! compares by value, with `NaN` equal to itself.

use std::cell::{Cell, OnceCell, RefCell};
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::arena::current_target;
use crate::dep::Dep;
use crate::hash::FastHashBuilder;

use super::{depend_array, observe, Observer};

/// A value stored in reactive data
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value (also returned for missing keys and indices)
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Number, compared with `NaN == NaN`
    Number(f64),
    /// Immutable string
    String(Rc<str>),
    /// Shared object handle
    Object(Object),
    /// Shared array handle
    Array(Array),
}

impl Value {
    /// Object or array
    pub fn is_object_like(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Array(_))
    }

    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The number, if this is one
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The string, if this is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// The object handle, if this is one
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The array handle, if this is one
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    /// Ordering used by [`Array::sort`]: by kind (null, bool, number,
    /// string, array, object), then numbers numerically and strings
    /// lexicographically. Arrays and objects of the same kind keep their
    /// relative order.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Same-value equality: `NaN` equals `NaN`, objects and arrays by identity
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Object(o) => fmt::Debug::fmt(o, f),
            Value::Array(a) => fmt::Debug::fmt(a, f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(Array::from_vec(items.into_iter().map(Into::into).collect()))
    }
}

/// Property key for [`set`](crate::set) and [`del`](crate::del)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    /// Object property name
    Name(Rc<str>),
    /// Array index (or the decimal property name on objects)
    Index(usize),
}

impl Key {
    pub(crate) fn to_name(&self) -> Rc<str> {
        match self {
            Key::Name(name) => name.clone(),
            Key::Index(index) => Rc::from(index.to_string()),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(Rc::from(name))
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(Rc::from(name))
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index)
    }
}

// =============================================================================
// Object
// =============================================================================

/// Reactive side of a property defined with `define_reactive`
pub(crate) struct Reactivity {
    pub(crate) dep: Dep,
    pub(crate) shallow: bool,
    /// Observer of the current value (deep properties only)
    pub(crate) child: Option<Observer>,
}

pub(crate) struct Property {
    pub(crate) value: Value,
    pub(crate) reactive: Option<Reactivity>,
}

pub(crate) struct ObjectInner {
    pub(crate) props: RefCell<IndexMap<Rc<str>, Property, FastHashBuilder>>,
    pub(crate) ob: OnceCell<Observer>,
    pub(crate) raw: Cell<bool>,
}

/// Shared, insertion-ordered map of properties
///
/// Properties start out plain. [`observe`](crate::observe) (or
/// [`define_reactive`](crate::define_reactive)) turns them reactive: reading
/// them through [`get`](Object::get) tracks them and assigning them through
/// [`set`](Object::set) notifies the units that read them.
#[derive(Clone)]
pub struct Object(pub(crate) Rc<ObjectInner>);

impl Object {
    /// Empty, unobserved object
    pub fn new() -> Self {
        Object(Rc::new(ObjectInner {
            props: RefCell::new(IndexMap::default()),
            ob: OnceCell::new(),
            raw: Cell::new(false),
        }))
    }

    /// Build an object from key/value pairs (unobserved)
    pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Rc<str>>,
        V: Into<Value>,
    {
        let object = Self::new();
        {
            let mut props = object.0.props.borrow_mut();
            for (key, value) in entries {
                props.insert(
                    key.into(),
                    Property {
                        value: value.into(),
                        reactive: None,
                    },
                );
            }
        }
        object
    }

    /// Whether both handles point to the same object
    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The observer of this object, if it was observed
    pub fn observer(&self) -> Option<Observer> {
        self.0.ob.get().cloned()
    }

    pub(crate) fn is_raw(&self) -> bool {
        self.0.raw.get()
    }

    /// Read a property.
    ///
    /// Reading a reactive property while a unit runs subscribes the unit to
    /// the property, to the observer of the value, and for arrays to the
    /// observers of all nested elements. Missing keys read as `Null`.
    pub fn get(&self, key: &str) -> Value {
        let (value, dep, child) = {
            let props = self.0.props.borrow();
            let Some(prop) = props.get(key) else {
                return Value::Null;
            };
            match &prop.reactive {
                Some(reactive) => (
                    prop.value.clone(),
                    Some(reactive.dep.id()),
                    reactive.child.as_ref().map(Observer::dep_id),
                ),
                None => (prop.value.clone(), None, None),
            }
        };
        if let Some(dep) = dep {
            if current_target().is_some() {
                dep.depend();
                if let Some(child) = child {
                    child.depend();
                    if let Value::Array(array) = &value {
                        depend_array(array);
                    }
                }
            }
        }
        value
    }

    /// Assign a property.
    ///
    /// Reactive properties ignore same-value assignments; otherwise they store
    /// the value, observe it (unless shallow) and notify their subscribers.
    /// Plain and missing properties are written without notification; use
    /// [`set`](crate::set) to add a key reactively.
    ///
    /// # Panics
    /// Re-raises the panic of a synchronous unit, like
    /// [`Dep::notify`](crate::Dep::notify).
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let shallow = {
            let props = self.0.props.borrow();
            match props.get(key) {
                Some(Property {
                    reactive: Some(reactive),
                    value: current,
                }) => {
                    if *current == value {
                        return;
                    }
                    Some(reactive.shallow)
                }
                _ => None,
            }
        };
        let Some(shallow) = shallow else {
            // Plain assignment; the replaced value drops after the borrow
            let replaced = self.0.props.borrow_mut().insert(
                Rc::from(key),
                Property {
                    value,
                    reactive: None,
                },
            );
            drop(replaced);
            return;
        };

        let child = if shallow { None } else { observe(&value) };
        let stored = {
            let mut props = self.0.props.borrow_mut();
            props.get_mut(key).and_then(|prop| {
                let reactive = prop.reactive.as_mut()?;
                reactive.child = child;
                Some((std::mem::replace(&mut prop.value, value), reactive.dep.id()))
            })
        };
        if let Some((old, dep)) = stored {
            drop(old);
            dep.notify_or_raise();
        }
    }

    /// Whether the key exists (untracked)
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.props.borrow().contains_key(key)
    }

    /// Property names in insertion order (untracked)
    pub fn keys(&self) -> Vec<Rc<str>> {
        self.0.props.borrow().keys().cloned().collect()
    }

    /// Number of properties (untracked)
    pub fn len(&self) -> usize {
        self.0.props.borrow().len()
    }

    /// Whether the object has no properties
    pub fn is_empty(&self) -> bool {
        self.0.props.borrow().is_empty()
    }

    /// Whether `key` is a reactive property
    pub fn is_reactive(&self, key: &str) -> bool {
        self.0
            .props
            .borrow()
            .get(key)
            .is_some_and(|prop| prop.reactive.is_some())
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.0.props.borrow_mut().shift_remove(key);
        removed.map(|prop| prop.value)
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys only: values may refer back to this object
        let keys = self.0.props.try_borrow().map(|props| props.keys().cloned().collect::<Vec<_>>());
        match keys {
            Ok(keys) => f.debug_struct("Object").field("keys", &keys).finish(),
            Err(_) => f.write_str("Object { <borrowed> }"),
        }
    }
}

// =============================================================================
// Array
// =============================================================================

pub(crate) struct ArrayInner {
    pub(crate) items: RefCell<Vec<Value>>,
    pub(crate) ob: OnceCell<Observer>,
    pub(crate) raw: Cell<bool>,
}

/// Shared, growable list of values
///
/// Reads are untracked: an array is tracked as a whole through the reactive
/// property holding it. The mutating methods notify the array's observer.
#[derive(Clone)]
pub struct Array(pub(crate) Rc<ArrayInner>);

impl Array {
    /// Empty, unobserved array
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Array holding `items` (unobserved)
    pub fn from_vec(items: Vec<Value>) -> Self {
        Array(Rc::new(ArrayInner {
            items: RefCell::new(items),
            ob: OnceCell::new(),
            raw: Cell::new(false),
        }))
    }

    /// Whether both handles point to the same array
    pub fn ptr_eq(&self, other: &Array) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The observer of this array, if it was observed
    pub fn observer(&self) -> Option<Observer> {
        self.0.ob.get().cloned()
    }

    pub(crate) fn is_raw(&self) -> bool {
        self.0.raw.get()
    }

    /// Element at `index`, `Null` when out of bounds
    pub fn get(&self, index: usize) -> Value {
        self.0.items.borrow().get(index).cloned().unwrap_or_default()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.0.items.borrow().len()
    }

    /// Whether the array is empty
    pub fn is_empty(&self) -> bool {
        self.0.items.borrow().is_empty()
    }

    /// Snapshot of the elements
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.items.borrow().clone()
    }
}

impl Default for Array {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.items.try_borrow() {
            Ok(items) => write!(f, "Array(len={})", items.len()),
            Err(_) => f.write_str("Array(<borrowed>)"),
        }
    }
}
