//! Event values and the object handles they may carry
//!
//! A site buffer is monomorphic: it is created for one [`ValueKind`] and only
//! ever stores values of that kind. Object values are held according to the
//! session's [`RetentionPolicy`](crate::recording::retention::RetentionPolicy).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

/// Scalar kind of the values observed at a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object,
    ObjectId,
    /// Declared type of sites that carry no value; recorded as `Int` 0
    Void,
}

impl ValueKind {
    /// Kind actually stored in a buffer for a site declared with this kind
    pub fn storage_kind(self) -> ValueKind {
        match self {
            ValueKind::Void => ValueKind::Int,
            other => other,
        }
    }

    pub fn is_object(self) -> bool {
        matches!(self, ValueKind::Object | ValueKind::ObjectId)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A host-program object that can be traced by reference
///
/// Identity is the address of the shared allocation, so two `Arc`s to the
/// same object render the same token.
pub trait TracedObject: Send + Sync + 'static {
    /// Runtime type name written next to the identity token
    fn type_name(&self) -> &str;

    /// Text captured with the identity (strings, exception messages)
    fn text_content(&self) -> Option<&str> {
        None
    }

    /// Elements of an array object; `None` for non-array objects
    fn array_elements(&self) -> Option<Vec<Option<ObjectRef>>> {
        None
    }

    /// True for arrays whose declared element type is itself an array
    ///
    /// A type-level fact: it holds for `int[2][0][5]`'s middle dimension even
    /// though that array has no elements to inspect.
    fn element_is_array(&self) -> bool {
        false
    }
}

/// Shared handle to a traced object
pub type ObjectRef = Arc<dyn TracedObject>;

impl TracedObject for String {
    fn type_name(&self) -> &str {
        "String"
    }

    fn text_content(&self) -> Option<&str> {
        Some(self.as_str())
    }
}

/// Identity token of an object: the address of its allocation
pub fn identity_of(obj: &ObjectRef) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

/// Interned object identity used by the `Id` retention policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectId {
    pub id: u64,
    pub type_name: Arc<str>,
    pub content: Option<Arc<str>>,
}

impl ObjectId {
    pub fn new(id: u64, type_name: impl Into<Arc<str>>, content: Option<Arc<str>>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            content,
        }
    }

    /// Identity of the null reference
    pub fn null() -> Self {
        Self::new(0, "null", None)
    }
}

/// One observed value, exactly one scalar kind
#[derive(Clone)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Option<ObjectRef>),
    ObjectId(ObjectId),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Byte(_) => ValueKind::Byte,
            Value::Char(_) => ValueKind::Char,
            Value::Short(_) => ValueKind::Short,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Object(_) => ValueKind::Object,
            Value::ObjectId(_) => ValueKind::ObjectId,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "Boolean({v})"),
            Value::Byte(v) => write!(f, "Byte({v})"),
            Value::Char(v) => write!(f, "Char({v})"),
            Value::Short(v) => write!(f, "Short({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Long(v) => write!(f, "Long({v})"),
            Value::Float(v) => write!(f, "Float({v:?})"),
            Value::Double(v) => write!(f, "Double({v:?})"),
            Value::Object(None) => write!(f, "Object(null)"),
            Value::Object(Some(o)) => {
                write!(f, "Object({}@{:x})", o.type_name(), identity_of(o))
            }
            Value::ObjectId(id) => write!(f, "ObjectId({id:?})"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Object(a), Value::Object(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => identity_of(a) == identity_of(b),
                _ => false,
            },
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            _ => false,
        }
    }
}

/// How an object slot holds its referent
#[derive(Clone, Default)]
pub enum ObjectSlot {
    #[default]
    Null,
    Strong(ObjectRef),
    Weak(Weak<dyn TracedObject>),
}

/// What an object slot resolves to at read time
pub enum Resolved {
    Null,
    Collected,
    Live(ObjectRef),
}

impl ObjectSlot {
    pub fn resolve(&self) -> Resolved {
        match self {
            ObjectSlot::Null => Resolved::Null,
            ObjectSlot::Strong(o) => Resolved::Live(Arc::clone(o)),
            ObjectSlot::Weak(w) => match w.upgrade() {
                Some(o) => Resolved::Live(o),
                None => Resolved::Collected,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_void_is_stored_as_int() {
        assert_eq!(ValueKind::Void.storage_kind(), ValueKind::Int);
        assert_eq!(ValueKind::Long.storage_kind(), ValueKind::Long);
    }

    #[test]
    fn test_object_identity_is_shared_by_clones() {
        let a: ObjectRef = Arc::new("x".to_string());
        let b = Arc::clone(&a);
        let c: ObjectRef = Arc::new("x".to_string());

        assert_eq!(identity_of(&a), identity_of(&b));
        assert_ne!(identity_of(&a), identity_of(&c));
        assert_eq!(Value::Object(Some(a.clone())), Value::Object(Some(b)));
        assert_ne!(Value::Object(Some(a)), Value::Object(Some(c)));
    }

    #[test]
    fn test_weak_slot_resolves_collected() {
        let obj: ObjectRef = Arc::new("gone".to_string());
        let slot = ObjectSlot::Weak(Arc::downgrade(&obj));
        assert!(matches!(slot.resolve(), Resolved::Live(_)));

        drop(obj);
        assert!(matches!(slot.resolve(), Resolved::Collected));
    }
}
