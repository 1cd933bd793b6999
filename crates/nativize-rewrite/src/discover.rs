//! Import stub discovery and validation.
//!
//! Walks every method of the module in order, picks out those carrying
//! native-import metadata, and computes a marshalling plan for each slot.
//! The first slot without a plan fails the whole run before anything is
//! mutated.

use indexmap::{IndexMap, IndexSet};
use log::debug;

use nativize_model::{
    CharSet, MarshalInfo, MethodDef, MethodHandle, Module, PInvokeCallConv, TypeName, TypeRef,
    UnmanagedCallConv,
};

use crate::classify::TypeClassifier;
use crate::error::{Result, RewriteError};
use crate::marshal::{plan_parameter, plan_return, MarshallingPlan, SlotContext};

/// One parameter of an import stub.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSlot {
    pub name: String,
    pub ty: TypeRef,
    pub marshal: Option<MarshalInfo>,
    pub by_ref: bool,
    pub plan: MarshallingPlan,
}

impl ParamSlot {
    /// Type of this slot in the native thunk signature.
    pub fn native_type(&self) -> TypeRef {
        self.plan.native_type(&self.ty)
    }
}

/// Return slot of an import stub.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnSlot {
    pub ty: TypeRef,
    pub marshal: Option<MarshalInfo>,
    pub plan: MarshallingPlan,
}

impl ReturnSlot {
    pub fn native_type(&self) -> TypeRef {
        self.plan.native_type(&self.ty)
    }
}

/// A validated import stub.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedFunction {
    pub handle: MethodHandle,
    pub declaring_type: TypeName,
    pub name: String,
    pub params: Vec<ParamSlot>,
    pub return_slot: ReturnSlot,
    pub declared_convention: PInvokeCallConv,
    /// Indirect-call convention the declared one maps to.
    pub convention: UnmanagedCallConv,
    pub char_set: CharSet,
    /// Library as declared on the stub.
    pub library: String,
    /// Symbol to resolve; the method name when no entry point is declared.
    pub symbol: String,
    pub set_last_error: bool,
}

impl ImportedFunction {
    /// `Namespace.Type::Name`
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }

    pub fn param_types(&self) -> Vec<TypeRef> {
        self.params.iter().map(|p| p.ty.clone()).collect()
    }

    pub fn native_param_types(&self) -> Vec<TypeRef> {
        self.params.iter().map(ParamSlot::native_type).collect()
    }

    pub fn has_string_arrays(&self) -> bool {
        self.params
            .iter()
            .any(|p| matches!(p.plan, MarshallingPlan::StringArray(_)))
    }
}

/// Map a declared convention to an indirect-call convention.
pub fn unmanaged_convention(declared: PInvokeCallConv) -> Option<UnmanagedCallConv> {
    match declared {
        PInvokeCallConv::Cdecl => Some(UnmanagedCallConv::C),
        PInvokeCallConv::StdCall | PInvokeCallConv::Winapi => Some(UnmanagedCallConv::StdCall),
        PInvokeCallConv::FastCall => Some(UnmanagedCallConv::FastCall),
        PInvokeCallConv::ThisCall => Some(UnmanagedCallConv::ThisCall),
        PInvokeCallConv::Other(_) => None,
    }
}

/// Stubs and libraries of one declaring type, in discovery order.
#[derive(Debug, Default, Clone)]
pub struct TypeImports {
    pub functions: Vec<ImportedFunction>,
    pub libraries: IndexSet<String>,
}

/// Everything discovery found, keyed by declaring type.
#[derive(Debug, Default, Clone)]
pub struct DiscoveredImports {
    by_type: IndexMap<TypeName, TypeImports>,
}

impl DiscoveredImports {
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Total number of stubs.
    pub fn len(&self) -> usize {
        self.by_type.values().map(|t| t.functions.len()).sum()
    }

    /// Declaring types that have stubs, in module order.
    pub fn types(&self) -> impl Iterator<Item = &TypeName> {
        self.by_type.keys()
    }

    pub fn functions(&self, ty: &TypeName) -> &[ImportedFunction] {
        self.by_type
            .get(ty)
            .map(|t| t.functions.as_slice())
            .unwrap_or(&[])
    }

    /// Distinct libraries of a declaring type, in first-use order.
    pub fn libraries(&self, ty: &TypeName) -> impl Iterator<Item = &str> {
        self.by_type
            .get(ty)
            .into_iter()
            .flat_map(|t| t.libraries.iter().map(String::as_str))
    }

    /// All stubs in discovery order.
    pub fn all(&self) -> impl Iterator<Item = &ImportedFunction> {
        self.by_type.values().flat_map(|t| t.functions.iter())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TypeName, &TypeImports)> {
        self.by_type.iter()
    }
}

/// Which types discovery leaves alone.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// The generated helper type; its loader primitives stay declarative.
    pub helper_type: TypeName,
    /// Declaring types whose stubs stay declarative.
    pub excluded_types: Vec<TypeName>,
}

/// Find and validate every import stub of the module.
pub fn discover(module: &Module, options: &DiscoveryOptions) -> Result<DiscoveredImports> {
    let mut classifier = TypeClassifier::new(module);
    let mut found = DiscoveredImports::default();

    for (handle, ty, method) in module.methods() {
        let Some(pinvoke) = method.pinvoke.as_ref() else {
            continue;
        };
        if ty.name == options.helper_type {
            continue;
        }
        if options.excluded_types.contains(&ty.name) {
            debug!("skipping {}::{} (type excluded)", ty.name, method.name);
            continue;
        }

        let function = analyze(&mut classifier, handle, &ty.name, method)?;
        debug!(
            "discovered {} -> {}!{} ({:?})",
            function.qualified_name(),
            function.library,
            function.symbol,
            function.convention
        );

        let entry = found.by_type.entry(ty.name.clone()).or_default();
        entry.libraries.insert(pinvoke.module.clone());
        entry.functions.push(function);
    }

    Ok(found)
}

fn analyze(
    classifier: &mut TypeClassifier<'_>,
    handle: MethodHandle,
    declaring_type: &TypeName,
    method: &MethodDef,
) -> Result<ImportedFunction> {
    let qualified = format!("{}::{}", declaring_type, method.name);
    let Some(pinvoke) = method.pinvoke.as_ref() else {
        return Err(RewriteError::UnsupportedSignature {
            method: qualified,
            ty: method.return_type.to_string(),
            reason: "method is not an import stub".to_string(),
        });
    };

    if !method.is_static {
        return Err(RewriteError::UnsupportedSignature {
            method: qualified,
            ty: declaring_type.to_string(),
            reason: "import stubs must be static".to_string(),
        });
    }

    let convention = unmanaged_convention(pinvoke.calling_convention).ok_or_else(|| {
        RewriteError::UnknownCallingConvention {
            method: qualified.clone(),
            convention: format!("{:?}", pinvoke.calling_convention),
        }
    })?;

    let cx = SlotContext {
        method: &qualified,
        char_set: pinvoke.char_set,
    };

    let return_plan = plan_return(
        classifier,
        &cx,
        &method.return_type,
        method.return_marshal.as_ref(),
    )?;

    let mut params = Vec::with_capacity(method.params.len());
    for param in &method.params {
        let plan = plan_parameter(classifier, &cx, param)?;
        params.push(ParamSlot {
            name: param.name.clone(),
            ty: param.ty.clone(),
            marshal: param.marshal.clone(),
            by_ref: param.ty.is_by_ref(),
            plan,
        });
    }

    Ok(ImportedFunction {
        handle,
        declaring_type: declaring_type.clone(),
        name: method.name.clone(),
        params,
        return_slot: ReturnSlot {
            ty: method.return_type.clone(),
            marshal: method.return_marshal.clone(),
            plan: return_plan,
        },
        declared_convention: pinvoke.calling_convention,
        convention,
        char_set: pinvoke.char_set,
        library: pinvoke.module.clone(),
        symbol: pinvoke
            .entry_point
            .clone()
            .unwrap_or_else(|| method.name.clone()),
        set_last_error: pinvoke.set_last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::StringEncoding;
    use nativize_model::builder::{method, param, ModuleBuilder};

    fn options() -> DiscoveryOptions {
        DiscoveryOptions {
            helper_type: TypeName::new("", "PInvokeHelpers"),
            excluded_types: Vec::new(),
        }
    }

    fn module() -> Module {
        ModuleBuilder::new("d")
            .class("App.Math", |t| {
                t.method(
                    method("Add", TypeRef::i32())
                        .with_params(vec![param("a", TypeRef::i32()), param("b", TypeRef::i32())])
                        .import("m")
                        .calling_convention(PInvokeCallConv::Cdecl),
                )
                .method(method("Managed", TypeRef::void()))
                .method(
                    method("Sqrt", TypeRef::f64())
                        .with_params(vec![param("x", TypeRef::f64())])
                        .import("libm")
                        .entry_point("sqrt"),
                )
                .method(
                    method("Sub", TypeRef::i32())
                        .with_params(vec![param("a", TypeRef::i32()), param("b", TypeRef::i32())])
                        .import("m"),
                )
            })
            .class("App.Text", |t| {
                t.method(
                    method("Puts", TypeRef::i32())
                        .with_params(vec![param("s", TypeRef::string())])
                        .import("libc")
                        .char_set(CharSet::Unicode),
                )
            })
            .class("PInvokeHelpers", |t| {
                t.method(
                    method("dlopen", TypeRef::int_ptr())
                        .with_params(vec![param("name", TypeRef::string())])
                        .import("libdl"),
                )
            })
            .build()
    }

    #[test]
    fn groups_by_type_and_library() {
        let m = module();
        let found = discover(&m, &options()).unwrap();
        assert_eq!(found.len(), 4);

        let types: Vec<String> = found.types().map(|t| t.to_string()).collect();
        assert_eq!(types, vec!["App.Math", "App.Text"]);

        let math = TypeName::parse("App.Math");
        let names: Vec<&str> = found.functions(&math).iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Add", "Sqrt", "Sub"]);
        let libs: Vec<&str> = found.libraries(&math).collect();
        assert_eq!(libs, vec!["m", "libm"]);

        assert!(found.functions(&TypeName::parse("Nope")).is_empty());
    }

    #[test]
    fn records_symbol_and_convention() {
        let m = module();
        let found = discover(&m, &options()).unwrap();
        let math = TypeName::parse("App.Math");
        let sqrt = &found.functions(&math)[1];
        assert_eq!(sqrt.symbol, "sqrt");
        assert_eq!(sqrt.convention, UnmanagedCallConv::StdCall);
        let add = &found.functions(&math)[0];
        assert_eq!(add.symbol, "Add");
        assert_eq!(add.convention, UnmanagedCallConv::C);
        assert_eq!(add.qualified_name(), "App.Math::Add");
        assert_eq!(add.native_param_types(), vec![TypeRef::i32(), TypeRef::i32()]);

        let puts = &found.functions(&TypeName::parse("App.Text"))[0];
        assert_eq!(
            puts.params[0].plan,
            MarshallingPlan::for_string(StringEncoding::Unicode)
        );
    }

    #[test]
    fn helper_type_is_skipped() {
        let m = module();
        let found = discover(&m, &options()).unwrap();
        assert!(found.all().all(|f| f.declaring_type.name != "PInvokeHelpers"));
    }

    #[test]
    fn excluded_types_are_skipped() {
        let m = module();
        let mut opts = options();
        opts.excluded_types.push(TypeName::parse("App.Text"));
        let found = discover(&m, &opts).unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn unknown_convention_fails() {
        let m = ModuleBuilder::new("x")
            .class("App.Odd", |t| {
                t.method(
                    method("F", TypeRef::void())
                        .import("odd")
                        .calling_convention(PInvokeCallConv::Other(9)),
                )
            })
            .build();
        let err = discover(&m, &options()).unwrap_err();
        assert!(matches!(err, RewriteError::UnknownCallingConvention { .. }));
    }

    #[test]
    fn first_unsupported_slot_names_method() {
        let m = ModuleBuilder::new("x")
            .class("App.Bad", |t| {
                t.method(
                    method("Grid", TypeRef::void())
                        .with_params(vec![param("g", TypeRef::array(TypeRef::f64(), 2))])
                        .import("grid"),
                )
            })
            .build();
        match discover(&m, &options()).unwrap_err() {
            RewriteError::UnsupportedSignature { method, ty, .. } => {
                assert_eq!(method, "App.Bad::Grid");
                assert_eq!(ty, "float64[,]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn instance_stub_rejected() {
        let mut stub = method("F", TypeRef::void()).import("x");
        stub.is_static = false;
        let m = ModuleBuilder::new("x")
            .class("App.Inst", |t| t.method(stub))
            .build();
        assert!(matches!(
            discover(&m, &options()),
            Err(RewriteError::UnsupportedSignature { .. })
        ));
    }
}
