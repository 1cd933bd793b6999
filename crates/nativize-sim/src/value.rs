//! Managed and native values.

use std::fmt;

use nativize_model::TypeRef;

/// Index of an object in a session's managed heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

/// A managed pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Element `index` of an array.
    Element { array: ObjRef, index: usize },
    /// The value inside a box.
    Boxed(ObjRef),
}

/// A value on the evaluation stack, in a local, argument or array slot.
///
/// Small integers, booleans and characters are all `I32`; both float
/// widths are `F64`; native ints and unmanaged pointers are `Ptr`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F64(f64),
    Ptr(u64),
    Null,
    Ref(ObjRef),
    Addr(Address),
    /// A value type instance in its native layout.
    Struct(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::I32(_) => "int32",
            Value::I64(_) => "int64",
            Value::F64(_) => "float",
            Value::Ptr(_) => "native int",
            Value::Null => "null",
            Value::Ref(_) => "object",
            Value::Addr(_) => "managed pointer",
            Value::Struct(_) => "value type",
        }
    }

    /// Branch truthiness: non-zero, non-null.
    pub fn is_true(&self) -> bool {
        match self {
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::F64(v) => *v != 0.0,
            Value::Ptr(v) => *v != 0,
            Value::Null => false,
            Value::Ref(_) | Value::Addr(_) | Value::Struct(_) => true,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<u64> {
        match self {
            Value::Ptr(v) => Some(*v),
            Value::I32(v) => Some(*v as i64 as u64),
            Value::I64(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_i32().map(|v| v != 0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}L"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Ptr(v) => write!(f, "{v:#x}"),
            Value::Null => f.write_str("null"),
            Value::Ref(r) => write!(f, "obj#{}", r.0),
            Value::Addr(a) => write!(f, "&{a:?}"),
            Value::Struct(bytes) => write!(f, "struct[{}]", bytes.len()),
        }
    }
}

/// An object in the managed heap.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// UTF-16 code units.
    Str(Vec<u16>),
    Array { element: TypeRef, items: Vec<Value> },
    Exception { class: String, message: String },
    Delegate { ty: TypeRef, target: u64 },
    Type(TypeRef),
    Boxed { ty: TypeRef, value: Value },
}

impl Object {
    pub fn class_name(&self) -> String {
        match self {
            Object::Str(_) => "System.String".to_string(),
            Object::Array { element, .. } => format!("{element}[]"),
            Object::Exception { class, .. } => class.clone(),
            Object::Delegate { ty, .. } => ty.to_string(),
            Object::Type(_) => "System.Type".to_string(),
            Object::Boxed { ty, .. } => ty.to_string(),
        }
    }
}

/// A value crossing into or out of native code.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Void,
    I32(i32),
    I64(i64),
    F64(f64),
    Ptr(u64),
    Struct(Vec<u8>),
}

impl NativeValue {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            NativeValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NativeValue::I64(v) => Some(*v),
            NativeValue::I32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<u64> {
        match self {
            NativeValue::Ptr(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[u8]> {
        match self {
            NativeValue::Struct(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(Value::I32(2).is_true());
        assert!(!Value::Ptr(0).is_true());
        assert!(!Value::Null.is_true());
        assert!(Value::Ref(ObjRef(0)).is_true());
    }

    #[test]
    fn pointer_widening() {
        assert_eq!(Value::I32(-1).as_ptr(), Some(u64::MAX));
        assert_eq!(Value::Ptr(16).as_ptr(), Some(16));
        assert_eq!(Value::Null.as_ptr(), None);
    }
}
