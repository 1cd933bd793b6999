//! Native layout of managed values.
//!
//! Value types are laid out sequentially with natural alignment, pointers
//! are 8 bytes, and everything is little-endian.

use nativize_model::{Module, PrimitiveType, TypeKind, TypeRef};

use crate::error::{Result, SimError};
use crate::value::{NativeValue, Value};

/// Size and alignment of a type stored inline.
pub fn size_align(module: &Module, ty: &TypeRef) -> Result<(usize, usize)> {
    match ty {
        TypeRef::Primitive(PrimitiveType::Void) => Err(unsupported(ty)),
        TypeRef::Primitive(p) => {
            let size = p.size_bytes().ok_or_else(|| unsupported(ty))?;
            Ok((size, size))
        }
        TypeRef::Pointer(_) => Ok((8, 8)),
        TypeRef::Named(name) => {
            let def = module
                .find_type(name)
                .ok_or_else(|| SimError::Unsupported(format!("unresolved type {name}")))?;
            match def.kind {
                TypeKind::Enum { underlying } => {
                    size_align(module, &TypeRef::Primitive(underlying))
                }
                TypeKind::Struct => {
                    let mut offset = 0;
                    let mut max_align = 1;
                    for field in def.fields.iter().filter(|f| !f.is_static) {
                        let (size, align) = size_align(module, &field.ty)?;
                        offset = round_up(offset, align) + size;
                        max_align = max_align.max(align);
                    }
                    Ok((round_up(offset.max(1), max_align), max_align))
                }
                _ => Ok((8, 8)),
            }
        }
        TypeRef::Array { .. } | TypeRef::ByRef(_) => Ok((8, 8)),
    }
}

pub fn size_of(module: &Module, ty: &TypeRef) -> Result<usize> {
    size_align(module, ty).map(|(size, _)| size)
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

fn unsupported(ty: &TypeRef) -> SimError {
    SimError::Unsupported(format!("no native layout for {ty}"))
}

/// Resolve enums to their underlying primitive.
fn normalize(module: &Module, ty: &TypeRef) -> TypeRef {
    if let TypeRef::Named(name) = ty {
        if let Some(def) = module.find_type(name) {
            if let TypeKind::Enum { underlying } = def.kind {
                return TypeRef::Primitive(underlying);
            }
        }
    }
    ty.clone()
}

fn is_struct(module: &Module, ty: &TypeRef) -> bool {
    match ty {
        TypeRef::Named(name) => module
            .find_type(name)
            .map(|d| matches!(d.kind, TypeKind::Struct))
            .unwrap_or(false),
        _ => false,
    }
}

/// Zero value of a type.
pub fn default_value(module: &Module, ty: &TypeRef) -> Value {
    match normalize(module, ty) {
        TypeRef::Primitive(p) => match p {
            PrimitiveType::I64 | PrimitiveType::U64 => Value::I64(0),
            PrimitiveType::F32 | PrimitiveType::F64 => Value::F64(0.0),
            PrimitiveType::IntPtr | PrimitiveType::UIntPtr => Value::Ptr(0),
            PrimitiveType::String | PrimitiveType::Object | PrimitiveType::Void => Value::Null,
            _ => Value::I32(0),
        },
        TypeRef::Pointer(_) => Value::Ptr(0),
        ref named @ TypeRef::Named(_) if is_struct(module, named) => {
            Value::Struct(vec![0; size_of(module, named).unwrap_or(0)])
        }
        _ => Value::Null,
    }
}

/// Bytes of `value` stored as `ty`.
pub fn encode(module: &Module, ty: &TypeRef, value: &Value) -> Result<Vec<u8>> {
    let ty = normalize(module, ty);
    let size = size_of(module, &ty)?;
    let mismatch = || SimError::Unsupported(format!("cannot store {} as {ty}", value.kind()));
    let bytes = match (&ty, value) {
        (TypeRef::Primitive(PrimitiveType::F32), Value::F64(v)) => {
            (*v as f32).to_le_bytes().to_vec()
        }
        (TypeRef::Primitive(PrimitiveType::F64), Value::F64(v)) => v.to_le_bytes().to_vec(),
        (TypeRef::Named(_), Value::Struct(bytes)) if bytes.len() == size => bytes.clone(),
        (TypeRef::Primitive(_) | TypeRef::Pointer(_), Value::I32(v)) => {
            i64::from(*v).to_le_bytes()[..size].to_vec()
        }
        (TypeRef::Primitive(_) | TypeRef::Pointer(_), Value::I64(v)) => {
            v.to_le_bytes()[..size].to_vec()
        }
        (TypeRef::Primitive(_) | TypeRef::Pointer(_), Value::Ptr(v)) => {
            v.to_le_bytes()[..size].to_vec()
        }
        _ => return Err(mismatch()),
    };
    Ok(bytes)
}

/// Value of type `ty` read from `bytes`.
pub fn decode(module: &Module, ty: &TypeRef, bytes: &[u8]) -> Result<Value> {
    let ty = normalize(module, ty);
    let size = size_of(module, &ty)?;
    if bytes.len() < size {
        return Err(SimError::Native(format!(
            "{} bytes available for {ty} of size {size}",
            bytes.len()
        )));
    }
    let mut raw = [0u8; 8];
    let take = size.min(8);
    raw[..take].copy_from_slice(&bytes[..take]);
    let unsigned = u64::from_le_bytes(raw);
    let value = match &ty {
        TypeRef::Primitive(p) => match p {
            PrimitiveType::Boolean
            | PrimitiveType::U8
            | PrimitiveType::Char
            | PrimitiveType::U16 => Value::I32(unsigned as i32),
            PrimitiveType::I8 => Value::I32(i32::from(bytes[0] as i8)),
            PrimitiveType::I16 => Value::I32(i32::from(i16::from_le_bytes([bytes[0], bytes[1]]))),
            PrimitiveType::I32 | PrimitiveType::U32 => Value::I32(unsigned as u32 as i32),
            PrimitiveType::I64 | PrimitiveType::U64 => Value::I64(unsigned as i64),
            PrimitiveType::F32 => Value::F64(f64::from(f32::from_bits(unsigned as u32))),
            PrimitiveType::F64 => Value::F64(f64::from_bits(unsigned)),
            PrimitiveType::IntPtr | PrimitiveType::UIntPtr => Value::Ptr(unsigned),
            _ => return Err(unsupported(&ty)),
        },
        TypeRef::Pointer(_) => Value::Ptr(unsigned),
        TypeRef::Named(_) => Value::Struct(bytes[..size].to_vec()),
        _ => return Err(unsupported(&ty)),
    };
    Ok(value)
}

/// Managed value to the native argument of type `ty`.
pub fn to_native(module: &Module, ty: &TypeRef, value: &Value) -> Result<NativeValue> {
    let ty = normalize(module, ty);
    let mismatch = || SimError::Unsupported(format!("cannot pass {} as {ty}", value.kind()));
    match &ty {
        TypeRef::Primitive(p) => match (p, value) {
            (PrimitiveType::I64 | PrimitiveType::U64, Value::I64(v)) => Ok(NativeValue::I64(*v)),
            (PrimitiveType::I64 | PrimitiveType::U64, Value::I32(v)) => {
                Ok(NativeValue::I64(i64::from(*v)))
            }
            (PrimitiveType::F32 | PrimitiveType::F64, Value::F64(v)) => Ok(NativeValue::F64(*v)),
            (PrimitiveType::IntPtr | PrimitiveType::UIntPtr, v) => {
                v.as_ptr().map(NativeValue::Ptr).ok_or_else(mismatch)
            }
            (_, Value::I32(v)) if p.size_bytes().is_some_and(|s| s <= 4) => {
                Ok(NativeValue::I32(*v))
            }
            _ => Err(mismatch()),
        },
        TypeRef::Pointer(_) => value.as_ptr().map(NativeValue::Ptr).ok_or_else(mismatch),
        TypeRef::Named(_) => match value {
            Value::Struct(bytes) => Ok(NativeValue::Struct(bytes.clone())),
            _ => Err(mismatch()),
        },
        _ => Err(mismatch()),
    }
}

/// Native return value to a managed value of type `ty`.
pub fn from_native(module: &Module, ty: &TypeRef, value: &NativeValue) -> Result<Option<Value>> {
    if ty.is_void() {
        return Ok(None);
    }
    let ty = normalize(module, ty);
    let mismatch = || SimError::Native(format!("native code returned {value:?} for {ty}"));
    let converted = match (&ty, value) {
        (TypeRef::Primitive(PrimitiveType::I64 | PrimitiveType::U64), v) => {
            Value::I64(v.as_i64().ok_or_else(mismatch)?)
        }
        (TypeRef::Primitive(PrimitiveType::F32 | PrimitiveType::F64), NativeValue::F64(v)) => {
            Value::F64(*v)
        }
        (TypeRef::Primitive(PrimitiveType::IntPtr | PrimitiveType::UIntPtr), v)
        | (TypeRef::Pointer(_), v) => Value::Ptr(v.as_ptr().ok_or_else(mismatch)?),
        (TypeRef::Primitive(p), NativeValue::I32(v)) => Value::I32(narrow(*p, *v)),
        (TypeRef::Named(_), NativeValue::Struct(bytes)) => decode(module, &ty, bytes)?,
        _ => return Err(mismatch()),
    };
    Ok(Some(converted))
}

/// Truncate a native int32 to the width of a small primitive.
fn narrow(p: PrimitiveType, v: i32) -> i32 {
    match p {
        PrimitiveType::U8 | PrimitiveType::Boolean => v & 0xFF,
        PrimitiveType::I8 => i32::from(v as i8),
        PrimitiveType::U16 | PrimitiveType::Char => v & 0xFFFF,
        PrimitiveType::I16 => i32::from(v as i16),
        _ => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativize_model::builder::ModuleBuilder;

    fn module() -> Module {
        ModuleBuilder::new("l")
            .value_type("Geo.Point", |t| t.field("X", TypeRef::i32()).field("Y", TypeRef::i32()))
            .value_type("Geo.Mixed", |t| {
                t.field("Tag", TypeRef::u8()).field("Value", TypeRef::i64())
            })
            .enum_type("Geo.Mode", PrimitiveType::U8)
            .build()
    }

    #[test]
    fn struct_layout_aligns_fields() {
        let m = module();
        assert_eq!(size_align(&m, &TypeRef::named("Geo.Point")).unwrap(), (8, 4));
        assert_eq!(size_align(&m, &TypeRef::named("Geo.Mixed")).unwrap(), (16, 8));
        assert_eq!(size_of(&m, &TypeRef::named("Geo.Mode")).unwrap(), 1);
    }

    #[test]
    fn encode_and_decode_small_integers() {
        let m = module();
        assert_eq!(encode(&m, &TypeRef::u8(), &Value::I32(0x1FF)).unwrap(), vec![0xFF]);
        assert_eq!(decode(&m, &TypeRef::u8(), &[0xFF]).unwrap(), Value::I32(255));
        assert_eq!(
            decode(&m, &TypeRef::Primitive(PrimitiveType::I8), &[0xFF]).unwrap(),
            Value::I32(-1)
        );
        assert_eq!(
            decode(&m, &TypeRef::int_ptr(), &7u64.to_le_bytes()).unwrap(),
            Value::Ptr(7)
        );
    }

    #[test]
    fn defaults() {
        let m = module();
        assert_eq!(default_value(&m, &TypeRef::boolean()), Value::I32(0));
        assert_eq!(default_value(&m, &TypeRef::string()), Value::Null);
        assert_eq!(default_value(&m, &TypeRef::named("Geo.Point")), Value::Struct(vec![0; 8]));
        assert_eq!(default_value(&m, &TypeRef::named("Geo.Mode")), Value::I32(0));
    }

    #[test]
    fn native_conversions() {
        let m = module();
        assert_eq!(
            to_native(&m, &TypeRef::i32(), &Value::I32(5)).unwrap(),
            NativeValue::I32(5)
        );
        assert_eq!(
            to_native(&m, &TypeRef::int_ptr(), &Value::Ptr(9)).unwrap(),
            NativeValue::Ptr(9)
        );
        assert!(to_native(&m, &TypeRef::i32(), &Value::Null).is_err());
        assert_eq!(
            from_native(&m, &TypeRef::u8(), &NativeValue::I32(0x1234)).unwrap(),
            Some(Value::I32(0x34))
        );
        assert_eq!(from_native(&m, &TypeRef::void(), &NativeValue::Void).unwrap(), None);
    }
}
