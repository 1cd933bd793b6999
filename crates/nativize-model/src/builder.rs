//! Module construction API.
//!
//! `ModuleBuilder` assembles modules programmatically, mostly for tests and
//! tooling that fabricate inputs without a container file.
//!
//! # Example
//!
//! ```rust
//! use nativize_model::builder::{method, param, ModuleBuilder};
//! use nativize_model::types::TypeRef;
//!
//! let module = ModuleBuilder::new("demo")
//!     .class("Demo.Native", |t| {
//!         t.method(
//!             method("Add", TypeRef::i32())
//!                 .with_params(vec![param("a", TypeRef::i32()), param("b", TypeRef::i32())])
//!                 .import("m"),
//!         )
//!     })
//!     .build();
//! assert_eq!(module.import_stub_count(), 1);
//! ```

use crate::module::{
    CharSet, FieldDef, MarshalInfo, MethodDef, MethodFlags, Module, PInvokeCallConv, PInvokeInfo,
    ParamDef, TypeDef, TypeKind, Visibility,
};
use crate::types::{PrimitiveType, TypeName, TypeRef};

/// A builder for modules.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        let mut module = Module::new(name);
        module.assembly_refs.push("System.Runtime".to_string());
        Self { module }
    }

    pub fn assembly_ref(mut self, name: &str) -> Self {
        self.module.assembly_refs.push(name.to_string());
        self
    }

    /// Define a class owned by the module.
    pub fn class(mut self, full_name: &str, f: impl FnOnce(TypeBuilder) -> TypeBuilder) -> Self {
        let def = f(TypeBuilder::new(full_name, TypeKind::Class)).def;
        self.module.types.push(def);
        self
    }

    /// Define a value type owned by the module.
    pub fn value_type(
        mut self,
        full_name: &str,
        f: impl FnOnce(TypeBuilder) -> TypeBuilder,
    ) -> Self {
        let def = f(TypeBuilder::new(full_name, TypeKind::Struct)).def;
        self.module.types.push(def);
        self
    }

    /// Define a delegate type owned by the module.
    pub fn delegate(mut self, full_name: &str, ret: TypeRef, params: Vec<TypeRef>) -> Self {
        self.module.types.push(delegate_def(full_name, ret, params));
        self
    }

    pub fn enum_type(mut self, full_name: &str, underlying: PrimitiveType) -> Self {
        let def = TypeBuilder::new(full_name, TypeKind::Enum { underlying })
            .field("value__", TypeRef::Primitive(underlying))
            .def;
        self.module.types.push(def);
        self
    }

    /// A value type loaded from a referenced assembly.
    pub fn reference_struct(
        mut self,
        full_name: &str,
        f: impl FnOnce(TypeBuilder) -> TypeBuilder,
    ) -> Self {
        let def = f(TypeBuilder::new(full_name, TypeKind::Struct)).def;
        self.module.references.push(def);
        self
    }

    /// A class loaded from a referenced assembly.
    pub fn reference_class(
        mut self,
        full_name: &str,
        f: impl FnOnce(TypeBuilder) -> TypeBuilder,
    ) -> Self {
        let def = f(TypeBuilder::new(full_name, TypeKind::Class)).def;
        self.module.references.push(def);
        self
    }

    /// A delegate loaded from a referenced assembly.
    pub fn reference_delegate(
        mut self,
        full_name: &str,
        ret: TypeRef,
        params: Vec<TypeRef>,
    ) -> Self {
        self.module
            .references
            .push(delegate_def(full_name, ret, params));
        self
    }

    pub fn add_type(mut self, def: TypeDef) -> Self {
        self.module.types.push(def);
        self
    }

    pub fn build(self) -> Module {
        self.module
    }
}

fn delegate_def(full_name: &str, ret: TypeRef, params: Vec<TypeRef>) -> TypeDef {
    let invoke = MethodDef {
        name: "Invoke".to_string(),
        params: params
            .into_iter()
            .enumerate()
            .map(|(i, ty)| param(&format!("arg{i}"), ty))
            .collect(),
        return_type: ret,
        return_marshal: None,
        is_static: false,
        visibility: Visibility::Public,
        flags: MethodFlags {
            runtime_managed: true,
            hide_by_sig: true,
            ..MethodFlags::default()
        },
        pinvoke: None,
        body: None,
    };
    let mut builder = TypeBuilder::new(full_name, TypeKind::Delegate);
    builder.def.base = Some(TypeRef::named("System.MulticastDelegate"));
    builder.def.is_sealed = true;
    builder.method(invoke).def
}

/// A builder for one type definition.
pub struct TypeBuilder {
    def: TypeDef,
}

impl TypeBuilder {
    pub fn new(full_name: &str, kind: TypeKind) -> Self {
        let base = match kind {
            TypeKind::Struct => Some(TypeRef::named("System.ValueType")),
            TypeKind::Enum { .. } => Some(TypeRef::named("System.Enum")),
            TypeKind::Class => Some(TypeRef::object()),
            TypeKind::Delegate | TypeKind::Interface => None,
        };
        Self {
            def: TypeDef {
                name: TypeName::parse(full_name),
                kind,
                visibility: Visibility::Public,
                is_abstract: false,
                is_sealed: matches!(kind, TypeKind::Struct | TypeKind::Enum { .. }),
                before_field_init: false,
                base,
                fields: Vec::new(),
                methods: Vec::new(),
            },
        }
    }

    /// Instance field.
    pub fn field(mut self, name: &str, ty: TypeRef) -> Self {
        self.def.fields.push(FieldDef {
            name: name.to_string(),
            ty,
            is_static: false,
            is_readonly: false,
            visibility: Visibility::Public,
            marshal: None,
        });
        self
    }

    /// Instance field carrying an explicit marshalling annotation.
    pub fn marshalled_field(mut self, name: &str, ty: TypeRef, marshal: MarshalInfo) -> Self {
        self.def.fields.push(FieldDef {
            name: name.to_string(),
            ty,
            is_static: false,
            is_readonly: false,
            visibility: Visibility::Public,
            marshal: Some(marshal),
        });
        self
    }

    pub fn static_field(mut self, name: &str, ty: TypeRef) -> Self {
        self.def.fields.push(FieldDef {
            name: name.to_string(),
            ty,
            is_static: true,
            is_readonly: false,
            visibility: Visibility::Private,
            marshal: None,
        });
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.def.methods.push(method);
        self
    }

    pub fn build(self) -> TypeDef {
        self.def
    }
}

/// A public static method with no parameters and no body.
pub fn method(name: &str, ret: TypeRef) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        params: Vec::new(),
        return_type: ret,
        return_marshal: None,
        is_static: true,
        visibility: Visibility::Public,
        flags: MethodFlags {
            hide_by_sig: true,
            ..MethodFlags::default()
        },
        pinvoke: None,
        body: None,
    }
}

pub fn param(name: &str, ty: TypeRef) -> ParamDef {
    ParamDef {
        name: name.to_string(),
        ty,
        marshal: None,
    }
}

impl ParamDef {
    pub fn with_marshal(mut self, marshal: MarshalInfo) -> Self {
        self.marshal = Some(marshal);
        self
    }
}

impl MethodDef {
    pub fn with_params(mut self, params: Vec<ParamDef>) -> Self {
        self.params = params;
        self
    }

    pub fn with_return_marshal(mut self, marshal: MarshalInfo) -> Self {
        self.return_marshal = Some(marshal);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Turn the method into an import stub bound to `library` with the
    /// platform-default convention.
    pub fn import(mut self, library: &str) -> Self {
        self.pinvoke = Some(PInvokeInfo {
            module: library.to_string(),
            entry_point: None,
            calling_convention: PInvokeCallConv::Winapi,
            char_set: CharSet::NotSpecified,
            exact_spelling: false,
            set_last_error: false,
        });
        self
    }

    /// Adjust the import metadata; no effect on ordinary methods.
    pub fn with_pinvoke(mut self, f: impl FnOnce(&mut PInvokeInfo)) -> Self {
        if let Some(info) = self.pinvoke.as_mut() {
            f(info);
        }
        self
    }

    pub fn calling_convention(self, convention: PInvokeCallConv) -> Self {
        self.with_pinvoke(|p| p.calling_convention = convention)
    }

    pub fn char_set(self, char_set: CharSet) -> Self {
        self.with_pinvoke(|p| p.char_set = char_set)
    }

    pub fn entry_point(self, entry: &str) -> Self {
        self.with_pinvoke(|p| p.entry_point = Some(entry.to_string()))
    }
}
