//! Type references.
//!
//! A [`TypeRef`] names a type as it appears in a signature, a field, a local or
//! an instruction operand. Named types are resolved against the module (and
//! the definitions loaded from its references) by [`crate::module::Module::find_type`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Built-in types with a fixed meaning in every module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    Void,
    Boolean,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    IntPtr,
    UIntPtr,
    F32,
    F64,
    String,
    Object,
}

impl PrimitiveType {
    /// Numeric and pointer-sized primitives: identical layout on both sides
    /// of a native call.
    pub fn is_numeric_or_pointer(self) -> bool {
        matches!(
            self,
            PrimitiveType::I8
                | PrimitiveType::U8
                | PrimitiveType::I16
                | PrimitiveType::U16
                | PrimitiveType::I32
                | PrimitiveType::U32
                | PrimitiveType::I64
                | PrimitiveType::U64
                | PrimitiveType::IntPtr
                | PrimitiveType::UIntPtr
                | PrimitiveType::F32
                | PrimitiveType::F64
        )
    }

    /// Whether values of this primitive live on the managed heap.
    pub fn is_reference(self) -> bool {
        matches!(self, PrimitiveType::String | PrimitiveType::Object)
    }

    /// Size in bytes of an unboxed value, for a target with 8-byte pointers.
    pub fn size_bytes(self) -> Option<usize> {
        match self {
            PrimitiveType::Void => None,
            PrimitiveType::Boolean | PrimitiveType::I8 | PrimitiveType::U8 => Some(1),
            PrimitiveType::Char | PrimitiveType::I16 | PrimitiveType::U16 => Some(2),
            PrimitiveType::I32 | PrimitiveType::U32 | PrimitiveType::F32 => Some(4),
            PrimitiveType::I64
            | PrimitiveType::U64
            | PrimitiveType::F64
            | PrimitiveType::IntPtr
            | PrimitiveType::UIntPtr
            | PrimitiveType::String
            | PrimitiveType::Object => Some(8),
        }
    }

    /// The framework name of the primitive (e.g. `System.Int32`).
    pub fn system_name(self) -> &'static str {
        match self {
            PrimitiveType::Void => "System.Void",
            PrimitiveType::Boolean => "System.Boolean",
            PrimitiveType::Char => "System.Char",
            PrimitiveType::I8 => "System.SByte",
            PrimitiveType::U8 => "System.Byte",
            PrimitiveType::I16 => "System.Int16",
            PrimitiveType::U16 => "System.UInt16",
            PrimitiveType::I32 => "System.Int32",
            PrimitiveType::U32 => "System.UInt32",
            PrimitiveType::I64 => "System.Int64",
            PrimitiveType::U64 => "System.UInt64",
            PrimitiveType::IntPtr => "System.IntPtr",
            PrimitiveType::UIntPtr => "System.UIntPtr",
            PrimitiveType::F32 => "System.Single",
            PrimitiveType::F64 => "System.Double",
            PrimitiveType::String => "System.String",
            PrimitiveType::Object => "System.Object",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PrimitiveType::Void => "void",
            PrimitiveType::Boolean => "bool",
            PrimitiveType::Char => "char",
            PrimitiveType::I8 => "int8",
            PrimitiveType::U8 => "uint8",
            PrimitiveType::I16 => "int16",
            PrimitiveType::U16 => "uint16",
            PrimitiveType::I32 => "int32",
            PrimitiveType::U32 => "uint32",
            PrimitiveType::I64 => "int64",
            PrimitiveType::U64 => "uint64",
            PrimitiveType::IntPtr => "native int",
            PrimitiveType::UIntPtr => "native uint",
            PrimitiveType::F32 => "float32",
            PrimitiveType::F64 => "float64",
            PrimitiveType::String => "string",
            PrimitiveType::Object => "object",
        };
        f.write_str(text)
    }
}

/// Namespace-qualified type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeName {
    pub namespace: String,
    pub name: String,
}

impl TypeName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Split a dotted full name: the last segment is the type name.
    pub fn parse(full_name: &str) -> Self {
        match full_name.rfind('.') {
            Some(pos) => Self::new(&full_name[..pos], &full_name[pos + 1..]),
            None => Self::new("", full_name),
        }
    }

    pub fn full_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

/// A reference to a type from a signature, field, local or operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    Primitive(PrimitiveType),
    /// A class, struct, enum or delegate defined in the module or a reference.
    Named(TypeName),
    /// Unmanaged pointer.
    Pointer(Box<TypeRef>),
    /// Array with the given rank; rank 1 is a zero-based vector.
    Array { element: Box<TypeRef>, rank: u32 },
    /// Managed reference (`ref`/`out` parameters, pinned element locals).
    ByRef(Box<TypeRef>),
}

impl TypeRef {
    pub fn void() -> Self {
        TypeRef::Primitive(PrimitiveType::Void)
    }

    pub fn boolean() -> Self {
        TypeRef::Primitive(PrimitiveType::Boolean)
    }

    pub fn char() -> Self {
        TypeRef::Primitive(PrimitiveType::Char)
    }

    pub fn u8() -> Self {
        TypeRef::Primitive(PrimitiveType::U8)
    }

    pub fn i32() -> Self {
        TypeRef::Primitive(PrimitiveType::I32)
    }

    pub fn i64() -> Self {
        TypeRef::Primitive(PrimitiveType::I64)
    }

    pub fn f64() -> Self {
        TypeRef::Primitive(PrimitiveType::F64)
    }

    pub fn int_ptr() -> Self {
        TypeRef::Primitive(PrimitiveType::IntPtr)
    }

    pub fn string() -> Self {
        TypeRef::Primitive(PrimitiveType::String)
    }

    pub fn object() -> Self {
        TypeRef::Primitive(PrimitiveType::Object)
    }

    /// A named type from its dotted full name.
    pub fn named(full_name: &str) -> Self {
        TypeRef::Named(TypeName::parse(full_name))
    }

    /// Single-dimensional, zero-based array.
    pub fn vector(element: TypeRef) -> Self {
        TypeRef::Array {
            element: Box::new(element),
            rank: 1,
        }
    }

    pub fn array(element: TypeRef, rank: u32) -> Self {
        TypeRef::Array {
            element: Box::new(element),
            rank,
        }
    }

    pub fn by_ref(inner: TypeRef) -> Self {
        TypeRef::ByRef(Box::new(inner))
    }

    pub fn pointer(inner: TypeRef) -> Self {
        TypeRef::Pointer(Box::new(inner))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Primitive(PrimitiveType::Void))
    }

    pub fn is_primitive(&self, primitive: PrimitiveType) -> bool {
        matches!(self, TypeRef::Primitive(p) if *p == primitive)
    }

    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeRef::ByRef(_))
    }

    /// The referenced type for `T&`, or the type itself.
    pub fn strip_by_ref(&self) -> &TypeRef {
        match self {
            TypeRef::ByRef(inner) => inner,
            other => other,
        }
    }

    /// Element type and rank when this is an array.
    pub fn as_array(&self) -> Option<(&TypeRef, u32)> {
        match self {
            TypeRef::Array { element, rank } => Some((element, *rank)),
            _ => None,
        }
    }

    pub fn as_named(&self) -> Option<&TypeName> {
        match self {
            TypeRef::Named(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Primitive(p) => write!(f, "{p}"),
            TypeRef::Named(name) => write!(f, "{name}"),
            TypeRef::Pointer(inner) => write!(f, "{inner}*"),
            TypeRef::Array { element, rank } => {
                write!(f, "{element}[")?;
                for _ in 1..*rank {
                    write!(f, ",")?;
                }
                write!(f, "]")
            }
            TypeRef::ByRef(inner) => write!(f, "{inner}&"),
        }
    }
}

impl From<PrimitiveType> for TypeRef {
    fn from(p: PrimitiveType) -> Self {
        TypeRef::Primitive(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotted_name() {
        let name = TypeName::parse("System.Runtime.InteropServices.Marshal");
        assert_eq!(name.namespace, "System.Runtime.InteropServices");
        assert_eq!(name.name, "Marshal");
        assert_eq!(name.to_string(), "System.Runtime.InteropServices.Marshal");

        let bare = TypeName::parse("Point");
        assert!(bare.namespace.is_empty());
        assert_eq!(bare.to_string(), "Point");
    }

    #[test]
    fn display_compound_types() {
        assert_eq!(TypeRef::vector(TypeRef::string()).to_string(), "string[]");
        assert_eq!(TypeRef::array(TypeRef::i32(), 2).to_string(), "int32[,]");
        assert_eq!(TypeRef::by_ref(TypeRef::i32()).to_string(), "int32&");
        assert_eq!(TypeRef::pointer(TypeRef::u8()).to_string(), "uint8*");
        assert_eq!(TypeRef::int_ptr().to_string(), "native int");
    }

    #[test]
    fn strip_by_ref_only_unwraps_one_level() {
        let ty = TypeRef::by_ref(TypeRef::i64());
        assert_eq!(ty.strip_by_ref(), &TypeRef::i64());
        assert_eq!(TypeRef::i64().strip_by_ref(), &TypeRef::i64());
    }

    #[test]
    fn primitive_classes() {
        assert!(PrimitiveType::IntPtr.is_numeric_or_pointer());
        assert!(!PrimitiveType::Boolean.is_numeric_or_pointer());
        assert!(!PrimitiveType::Char.is_numeric_or_pointer());
        assert!(PrimitiveType::String.is_reference());
        assert_eq!(PrimitiveType::Char.size_bytes(), Some(2));
        assert_eq!(PrimitiveType::Void.size_bytes(), None);
    }
}
