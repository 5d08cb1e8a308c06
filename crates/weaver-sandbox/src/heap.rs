//! Runtime values and the object heap.

use std::collections::HashMap;

use weaver_unit::STRING_TYPE;

/// Index of an object in the [`Heap`].
pub type ObjRef = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Null,
    Ref(ObjRef),
}

impl Value {
    /// Zero value of a field or array element of `descriptor`.
    pub fn default_for(descriptor: &str) -> Value {
        match descriptor.as_bytes().first() {
            Some(b'I') | Some(b'Z') => Value::Int(0),
            Some(b'J') => Value::Long(0),
            _ => Value::Null,
        }
    }

    pub fn bool(b: bool) -> Value {
        Value::Int(i32::from(b))
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    /// `Some(None)` for null, `Some(Some(r))` for a reference.
    pub fn as_object(self) -> Option<Option<ObjRef>> {
        match self {
            Value::Null => Some(None),
            Value::Ref(r) => Some(Some(r)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Str(String),
    Array { elem: String, items: Vec<Value> },
    Instance {
        class: String,
        fields: HashMap<String, Value>,
    },
}

impl Object {
    pub fn class_name(&self) -> String {
        match self {
            Object::Str(_) => STRING_TYPE.to_string(),
            Object::Array { elem, .. } => format!("[{}", elem),
            Object::Instance { class, .. } => class.clone(),
        }
    }
}

/// Objects are never collected.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
}

impl Heap {
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.objects.push(object);
        self.objects.len() - 1
    }

    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        self.objects.get(r)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.objects.get_mut(r)
    }

    pub fn string(&self, r: ObjRef) -> Option<&str> {
        match self.objects.get(r)? {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
