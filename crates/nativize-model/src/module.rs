//! The mutable module model.
//!
//! A [`Module`] owns its type definitions. Definitions loaded from referenced
//! assemblies live in [`Module::references`]; they are consulted when
//! resolving value types and delegates but are never rewritten.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, Result};
use crate::il::MethodBody;
use crate::types::{PrimitiveType, TypeName, TypeRef};

/// Member accessibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    #[default]
    Private,
    /// Visible within the defining assembly.
    Assembly,
}

/// What a type definition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Class,
    /// A value type; layout is the sequence of its instance fields.
    Struct,
    Delegate,
    Enum { underlying: PrimitiveType },
    Interface,
}

/// Native representation requested by an explicit marshalling annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeType {
    /// 4-byte Win32 `BOOL`.
    Bool,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    SysInt,
    SysUInt,
    /// Single-byte, null-terminated string.
    LPStr,
    /// UTF-16, null-terminated string.
    LPWStr,
    /// Platform-dependent string.
    LPTStr,
    BStr,
    LPArray,
    SafeArray,
    ByValArray,
    FunctionPtr,
    Struct,
    Interface,
    IUnknown,
    CustomMarshaler,
}

/// An explicit marshalling annotation on a parameter, return value or field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarshalInfo {
    pub native: NativeType,
    /// Element representation for `LPArray`.
    #[serde(default)]
    pub element: Option<NativeType>,
    /// Marshaler type name for `CustomMarshaler`.
    #[serde(default)]
    pub custom_marshaler: Option<String>,
}

impl MarshalInfo {
    pub fn new(native: NativeType) -> Self {
        Self {
            native,
            element: None,
            custom_marshaler: None,
        }
    }

    /// An `LPArray` annotation with the given element representation.
    pub fn array_of(element: NativeType) -> Self {
        Self {
            native: NativeType::LPArray,
            element: Some(element),
            custom_marshaler: None,
        }
    }
}

/// Calling convention declared on a native import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PInvokeCallConv {
    /// Platform default.
    Winapi,
    Cdecl,
    StdCall,
    ThisCall,
    FastCall,
    /// Raw convention bits this model does not name.
    Other(u16),
}

/// Declared string mode of a native import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharSet {
    #[default]
    NotSpecified,
    Ansi,
    Unicode,
    Auto,
}

/// Declarative native-import metadata attached to a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PInvokeInfo {
    /// Library the symbol lives in, as declared.
    pub module: String,
    /// Symbol name; the method name when absent.
    #[serde(default)]
    pub entry_point: Option<String>,
    pub calling_convention: PInvokeCallConv,
    #[serde(default)]
    pub char_set: CharSet,
    #[serde(default)]
    pub exact_spelling: bool,
    #[serde(default)]
    pub set_last_error: bool,
}

/// A field of a type definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeRef,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_readonly: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub marshal: Option<MarshalInfo>,
}

/// A method parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    pub ty: TypeRef,
    #[serde(default)]
    pub marshal: Option<MarshalInfo>,
}

/// Method attribute bits the rewriter reads or sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodFlags {
    #[serde(default)]
    pub aggressive_inlining: bool,
    #[serde(default)]
    pub no_inlining: bool,
    /// `.cctor` and `.ctor` carry both special-name bits.
    #[serde(default)]
    pub special_name: bool,
    #[serde(default)]
    pub hide_by_sig: bool,
    /// Body is supplied by the runtime (delegate `Invoke`, for instance).
    #[serde(default)]
    pub runtime_managed: bool,
}

/// A method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<ParamDef>,
    pub return_type: TypeRef,
    #[serde(default)]
    pub return_marshal: Option<MarshalInfo>,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub flags: MethodFlags,
    /// Present on import stubs until they are rewritten.
    #[serde(default)]
    pub pinvoke: Option<PInvokeInfo>,
    #[serde(default)]
    pub body: Option<MethodBody>,
}

impl MethodDef {
    pub fn is_pinvoke(&self) -> bool {
        self.pinvoke.is_some()
    }

    pub fn param_types(&self) -> Vec<TypeRef> {
        self.params.iter().map(|p| p.ty.clone()).collect()
    }

    /// Name plus parameter types; unique within a type.
    pub fn same_signature(&self, other: &MethodDef) -> bool {
        self.name == other.name
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty == b.ty)
    }

    /// `Name(int32, string)` rendering used in diagnostics.
    pub fn display_signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|p| p.ty.to_string()).collect();
        format!("{} {}({})", self.return_type, self.name, params.join(", "))
    }
}

/// A type definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: TypeName,
    pub kind: TypeKind,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_sealed: bool,
    #[serde(default)]
    pub before_field_init: bool,
    #[serde(default)]
    pub base: Option<TypeRef>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::Struct | TypeKind::Enum { .. })
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn has_member_named(&self, name: &str) -> bool {
        self.field(name).is_some() || self.method(name).is_some()
    }

    /// Append a field; names are unique within a type.
    pub fn add_field(&mut self, field: FieldDef) -> Result<usize> {
        if self.field(&field.name).is_some() {
            return Err(ModelError::DuplicateMember {
                kind: "field",
                owner: self.name.to_string(),
                name: field.name,
            });
        }
        self.fields.push(field);
        Ok(self.fields.len() - 1)
    }

    /// Append a method; name plus parameter types are unique within a type.
    pub fn add_method(&mut self, method: MethodDef) -> Result<usize> {
        if self.methods.iter().any(|m| m.same_signature(&method)) {
            return Err(ModelError::DuplicateMember {
                kind: "method",
                owner: self.name.to_string(),
                name: method.display_signature(),
            });
        }
        self.methods.push(method);
        Ok(self.methods.len() - 1)
    }
}

/// Position of a method inside [`Module::types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodHandle {
    pub type_index: usize,
    pub method_index: usize,
}

/// A loaded module: the unit the rewriter transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    /// Module version id; regenerated whenever the module is rewritten.
    pub mvid: Uuid,
    #[serde(default)]
    pub assembly_refs: Vec<String>,
    pub types: Vec<TypeDef>,
    /// Definitions from referenced assemblies, available for resolution only.
    #[serde(default)]
    pub references: Vec<TypeDef>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mvid: Uuid::new_v4(),
            assembly_refs: Vec::new(),
            types: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Resolve a type by name: own definitions first, then references.
    pub fn find_type(&self, name: &TypeName) -> Option<&TypeDef> {
        self.types
            .iter()
            .chain(self.references.iter())
            .find(|t| &t.name == name)
    }

    /// Index of an owned type definition.
    pub fn type_index(&self, name: &TypeName) -> Option<usize> {
        self.types.iter().position(|t| &t.name == name)
    }

    pub fn type_mut(&mut self, name: &TypeName) -> Result<&mut TypeDef> {
        self.types
            .iter_mut()
            .find(|t| &t.name == name)
            .ok_or_else(|| ModelError::TypeNotFound(name.to_string()))
    }

    pub fn method(&self, handle: MethodHandle) -> &MethodDef {
        &self.types[handle.type_index].methods[handle.method_index]
    }

    pub fn method_mut(&mut self, handle: MethodHandle) -> &mut MethodDef {
        &mut self.types[handle.type_index].methods[handle.method_index]
    }

    /// Every owned method in module order.
    pub fn methods(&self) -> impl Iterator<Item = (MethodHandle, &TypeDef, &MethodDef)> {
        self.types.iter().enumerate().flat_map(|(ti, ty)| {
            ty.methods.iter().enumerate().map(move |(mi, m)| {
                (
                    MethodHandle {
                        type_index: ti,
                        method_index: mi,
                    },
                    ty,
                    m,
                )
            })
        })
    }

    pub fn method_count(&self) -> usize {
        self.types.iter().map(|t| t.methods.len()).sum()
    }

    /// Number of methods still carrying native-import metadata.
    pub fn import_stub_count(&self) -> usize {
        self.methods().filter(|(_, _, m)| m.is_pinvoke()).count()
    }

    /// Give the module a fresh version id.
    pub fn regenerate_mvid(&mut self) {
        self.mvid = Uuid::new_v4();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{method, param, ModuleBuilder};

    fn sample() -> Module {
        ModuleBuilder::new("sample")
            .class("App.Native", |t| {
                t.method(
                    method("Add", TypeRef::i32())
                        .with_params(vec![param("a", TypeRef::i32()), param("b", TypeRef::i32())])
                        .import("m"),
                )
            })
            .reference_struct("System.Drawing.Point", |t| {
                t.field("X", TypeRef::i32()).field("Y", TypeRef::i32())
            })
            .build()
    }

    #[test]
    fn find_type_searches_references() {
        let module = sample();
        assert!(module.find_type(&TypeName::parse("App.Native")).is_some());
        assert!(module
            .find_type(&TypeName::parse("System.Drawing.Point"))
            .is_some());
        assert!(module.type_index(&TypeName::parse("System.Drawing.Point")).is_none());
        assert!(module.find_type(&TypeName::parse("Missing")).is_none());
    }

    #[test]
    fn duplicate_members_rejected() {
        let mut module = sample();
        let ty = module.type_mut(&TypeName::parse("App.Native")).unwrap();
        let dup = ty.methods[0].clone();
        let err = ty.add_method(dup).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateMember { kind: "method", .. }));

        let field = FieldDef {
            name: "p_Add".into(),
            ty: TypeRef::int_ptr(),
            is_static: true,
            is_readonly: false,
            visibility: Visibility::Private,
            marshal: None,
        };
        ty.add_field(field.clone()).unwrap();
        assert!(ty.add_field(field).is_err());
    }

    #[test]
    fn overload_with_different_params_allowed() {
        let mut module = sample();
        let ty = module.type_mut(&TypeName::parse("App.Native")).unwrap();
        let overload = method("Add", TypeRef::i64())
            .with_params(vec![param("a", TypeRef::i64()), param("b", TypeRef::i64())]);
        assert_eq!(ty.add_method(overload).unwrap(), 1);
    }

    #[test]
    fn counts_and_handles() {
        let module = sample();
        assert_eq!(module.method_count(), 1);
        assert_eq!(module.import_stub_count(), 1);
        let (handle, ty, m) = module.methods().next().unwrap();
        assert_eq!(ty.name.name, "Native");
        assert_eq!(module.method(handle), m);
        assert_eq!(m.display_signature(), "int32 Add(int32, int32)");
    }

    #[test]
    fn regenerate_mvid_changes_identity() {
        let mut module = sample();
        let before = module.mvid;
        module.regenerate_mvid();
        assert_ne!(before, module.mvid);
    }
}
