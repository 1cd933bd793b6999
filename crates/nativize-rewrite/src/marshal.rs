//! Marshalling plans for parameter and return slots.
//!
//! Every slot of an import stub gets exactly one [`MarshallingPlan`] during
//! discovery. A slot with no plan fails the run; the body compiler only ever
//! sees supported shapes.

use std::fmt;

use serde::Serialize;

use nativize_model::{CharSet, MarshalInfo, NativeType, ParamDef, PrimitiveType, TypeRef};

use crate::classify::TypeClassifier;
use crate::error::{Result, RewriteError};

/// Character encoding of a marshalled string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StringEncoding {
    /// Single-byte code units, null-terminated.
    Ansi,
    /// UTF-16 code units, null-terminated.
    Unicode,
}

/// Width of a boolean on the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolWidth {
    /// 4-byte integer.
    Int32,
    /// Single byte (`I1`/`U1` annotations).
    Byte,
}

/// How one slot crosses the native boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum MarshallingPlan {
    /// Same representation on both sides.
    Direct,
    AnsiString,
    UnicodeString,
    /// Pinned; the address of the first element is passed.
    BlittableArray,
    /// Elements converted one by one into a temporary address array.
    StringArray(StringEncoding),
    /// Passed as a function pointer.
    Delegate,
    /// Pinned; the address of the referent is passed.
    ByRef,
    /// Converted to 0/1 of the given width.
    BooleanToInt(BoolWidth),
}

impl MarshallingPlan {
    /// The type the slot has in the native thunk signature.
    pub fn native_type(&self, managed: &TypeRef) -> TypeRef {
        match self {
            MarshallingPlan::Direct => managed.clone(),
            MarshallingPlan::BooleanToInt(BoolWidth::Int32) => TypeRef::i32(),
            MarshallingPlan::BooleanToInt(BoolWidth::Byte) => TypeRef::u8(),
            MarshallingPlan::AnsiString
            | MarshallingPlan::UnicodeString
            | MarshallingPlan::BlittableArray
            | MarshallingPlan::StringArray(_)
            | MarshallingPlan::Delegate
            | MarshallingPlan::ByRef => TypeRef::int_ptr(),
        }
    }

    pub fn for_string(encoding: StringEncoding) -> Self {
        match encoding {
            StringEncoding::Ansi => MarshallingPlan::AnsiString,
            StringEncoding::Unicode => MarshallingPlan::UnicodeString,
        }
    }
}

impl fmt::Display for MarshallingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshallingPlan::Direct => write!(f, "direct"),
            MarshallingPlan::AnsiString => write!(f, "ansi-string"),
            MarshallingPlan::UnicodeString => write!(f, "unicode-string"),
            MarshallingPlan::BlittableArray => write!(f, "blittable-array"),
            MarshallingPlan::StringArray(StringEncoding::Ansi) => write!(f, "string-array(ansi)"),
            MarshallingPlan::StringArray(StringEncoding::Unicode) => {
                write!(f, "string-array(unicode)")
            }
            MarshallingPlan::Delegate => write!(f, "delegate"),
            MarshallingPlan::ByRef => write!(f, "by-ref"),
            MarshallingPlan::BooleanToInt(BoolWidth::Int32) => write!(f, "bool-to-int32"),
            MarshallingPlan::BooleanToInt(BoolWidth::Byte) => write!(f, "bool-to-byte"),
        }
    }
}

/// Encoding for a string slot: an explicit annotation wins, then the
/// declared string mode; ANSI when neither says Unicode.
pub fn string_encoding(annotation: Option<NativeType>, char_set: CharSet) -> StringEncoding {
    match annotation {
        Some(NativeType::LPStr) | Some(NativeType::LPTStr) => StringEncoding::Ansi,
        Some(NativeType::LPWStr) => StringEncoding::Unicode,
        _ => match char_set {
            CharSet::Unicode => StringEncoding::Unicode,
            CharSet::Ansi | CharSet::Auto | CharSet::NotSpecified => StringEncoding::Ansi,
        },
    }
}

/// Context shared by the plans of one import stub.
pub struct SlotContext<'a> {
    pub method: &'a str,
    pub char_set: CharSet,
}

impl SlotContext<'_> {
    fn reject(&self, ty: &TypeRef, reason: impl Into<String>) -> RewriteError {
        RewriteError::UnsupportedSignature {
            method: self.method.to_string(),
            ty: ty.to_string(),
            reason: reason.into(),
        }
    }
}

/// Plan for one parameter.
pub fn plan_parameter(
    classifier: &mut TypeClassifier<'_>,
    cx: &SlotContext<'_>,
    param: &ParamDef,
) -> Result<MarshallingPlan> {
    let ty = &param.ty;
    let annotation = checked_annotation(cx, ty, param.marshal.as_ref())?;

    if let TypeRef::ByRef(inner) = ty {
        if inner.as_array().is_some() || !classifier.is_blittable(inner)? {
            return Err(cx.reject(ty, "by-reference slots must refer to a blittable value"));
        }
        if let Some(native) = annotation {
            if !is_natural_native(classifier, inner, native)? {
                return Err(cx.reject(ty, format!("annotation {native:?} does not fit")));
            }
        }
        return Ok(MarshallingPlan::ByRef);
    }

    if let Some((element, rank)) = ty.as_array() {
        if rank != 1 {
            return Err(cx.reject(ty, "multi-dimensional arrays are not supported"));
        }
        if classifier.is_string(element) {
            let element_annotation = match param.marshal.as_ref() {
                Some(info) => match info.native {
                    NativeType::LPArray => info.element,
                    other => {
                        return Err(cx.reject(ty, format!("annotation {other:?} does not fit")))
                    }
                },
                None => None,
            };
            if let Some(e) = element_annotation {
                if !matches!(e, NativeType::LPStr | NativeType::LPTStr | NativeType::LPWStr) {
                    return Err(cx.reject(ty, format!("element annotation {e:?} does not fit")));
                }
            }
            return Ok(MarshallingPlan::StringArray(string_encoding(
                element_annotation,
                cx.char_set,
            )));
        }
        if !classifier.is_blittable(ty)? {
            return Err(cx.reject(ty, "array elements are not blittable"));
        }
        if let Some(native) = annotation {
            let element_ok = match param.marshal.as_ref().and_then(|m| m.element) {
                Some(e) => is_natural_native(classifier, element, e)?,
                None => true,
            };
            if native != NativeType::LPArray || !element_ok {
                return Err(cx.reject(ty, format!("annotation {native:?} does not fit")));
            }
        }
        return Ok(MarshallingPlan::BlittableArray);
    }

    plan_value(classifier, cx, ty, annotation)
}

/// Plan for the return slot.
pub fn plan_return(
    classifier: &mut TypeClassifier<'_>,
    cx: &SlotContext<'_>,
    ty: &TypeRef,
    marshal: Option<&MarshalInfo>,
) -> Result<MarshallingPlan> {
    let annotation = checked_annotation(cx, ty, marshal)?;
    if ty.is_void() {
        if annotation.is_some() {
            return Err(cx.reject(ty, "void return cannot be annotated"));
        }
        return Ok(MarshallingPlan::Direct);
    }
    if ty.is_by_ref() {
        return Err(cx.reject(ty, "by-reference returns are not supported"));
    }
    if ty.as_array().is_some() {
        return Err(cx.reject(ty, "array returns are not supported"));
    }
    plan_value(classifier, cx, ty, annotation)
}

/// Shared rules for scalar, string, delegate and value-type slots.
fn plan_value(
    classifier: &mut TypeClassifier<'_>,
    cx: &SlotContext<'_>,
    ty: &TypeRef,
    annotation: Option<NativeType>,
) -> Result<MarshallingPlan> {
    if classifier.is_boolean(ty) {
        return match annotation {
            None | Some(NativeType::Bool) | Some(NativeType::I4) | Some(NativeType::U4) => {
                Ok(MarshallingPlan::BooleanToInt(BoolWidth::Int32))
            }
            Some(NativeType::I1) | Some(NativeType::U1) => {
                Ok(MarshallingPlan::BooleanToInt(BoolWidth::Byte))
            }
            Some(other) => Err(cx.reject(ty, format!("annotation {other:?} does not fit"))),
        };
    }

    if classifier.is_string(ty) {
        return match annotation {
            None
            | Some(NativeType::LPStr)
            | Some(NativeType::LPTStr)
            | Some(NativeType::LPWStr) => Ok(MarshallingPlan::for_string(string_encoding(
                annotation,
                cx.char_set,
            ))),
            Some(other) => Err(cx.reject(ty, format!("annotation {other:?} does not fit"))),
        };
    }

    if ty.is_primitive(PrimitiveType::Char) {
        return Err(cx.reject(ty, "char has no fixed native width"));
    }

    if classifier.is_delegate(ty)? {
        return match annotation {
            None | Some(NativeType::FunctionPtr) => Ok(MarshallingPlan::Delegate),
            Some(other) => Err(cx.reject(ty, format!("annotation {other:?} does not fit"))),
        };
    }

    if classifier.is_blittable(ty)? {
        if let Some(native) = annotation {
            if !is_natural_native(classifier, ty, native)? {
                return Err(cx.reject(ty, format!("annotation {native:?} does not fit")));
            }
        }
        return Ok(MarshallingPlan::Direct);
    }

    Err(cx.reject(ty, "type has no marshalling plan"))
}

/// Reject custom marshalers up front; return the annotation's native type.
fn checked_annotation(
    cx: &SlotContext<'_>,
    ty: &TypeRef,
    marshal: Option<&MarshalInfo>,
) -> Result<Option<NativeType>> {
    match marshal {
        Some(info)
            if info.native == NativeType::CustomMarshaler || info.custom_marshaler.is_some() =>
        {
            Err(cx.reject(ty, "custom marshalers are not supported"))
        }
        Some(info) => Ok(Some(info.native)),
        None => Ok(None),
    }
}

/// Whether `native` is the representation the type has anyway.
fn is_natural_native(
    classifier: &mut TypeClassifier<'_>,
    ty: &TypeRef,
    native: NativeType,
) -> Result<bool> {
    let natural = match ty {
        TypeRef::Primitive(p) => match p {
            PrimitiveType::I8 => native == NativeType::I1,
            PrimitiveType::U8 => native == NativeType::U1,
            PrimitiveType::I16 => native == NativeType::I2,
            PrimitiveType::U16 => native == NativeType::U2,
            PrimitiveType::I32 => native == NativeType::I4,
            PrimitiveType::U32 => native == NativeType::U4,
            PrimitiveType::I64 => native == NativeType::I8,
            PrimitiveType::U64 => native == NativeType::U8,
            PrimitiveType::F32 => native == NativeType::R4,
            PrimitiveType::F64 => native == NativeType::R8,
            PrimitiveType::IntPtr => native == NativeType::SysInt,
            PrimitiveType::UIntPtr => native == NativeType::SysUInt,
            _ => false,
        },
        TypeRef::Named(name) => {
            native == NativeType::Struct
                && classifier.resolve(name)?.is_value_type()
        }
        TypeRef::Pointer(_) => native == NativeType::SysInt || native == NativeType::SysUInt,
        TypeRef::Array { .. } | TypeRef::ByRef(_) => false,
    };
    Ok(natural)
}
