//! Rewrite pipeline orchestrator.

use std::time::Instant;

use log::{info, warn};

use nativize_model::{MethodBody, MethodHandle, Module};

use crate::compile::MarshallingCompiler;
use crate::config::RewriteConfig;
use crate::discover::{discover, DiscoveryOptions};
use crate::error::{Result, RewriteError};
use crate::loader::{HelperType, PlatformLoaderBuilder};
use crate::plan::{TransformationPlanner, TypePlan};
use crate::report::RewriteReport;

/// Output of a successful rewrite.
#[derive(Debug)]
pub struct RewriteOutput {
    pub module: Module,
    pub report: RewriteReport,
}

/// Run the full rewrite:
/// discover + validate -> plan -> compile bodies -> build helper type -> install.
///
/// Every fallible step runs before the module is touched.
pub fn rewrite(mut module: Module, config: &RewriteConfig) -> Result<RewriteOutput> {
    let start = Instant::now();
    config.validate()?;

    let helper_name = config.helper_type_name();
    let helper = HelperType::new(helper_name.clone());
    let mut report = RewriteReport::new(&module.name, &helper_name.to_string());

    // Stage 1: discovery and validation
    let imports = discover(
        &module,
        &DiscoveryOptions {
            helper_type: helper_name.clone(),
            excluded_types: config.excluded_type_names(),
        },
    )?;

    if imports.is_empty() {
        info!("{}: no import stubs, module unchanged", module.name);
        report.duration_ms = start.elapsed().as_millis() as u64;
        return Ok(RewriteOutput { module, report });
    }
    if module.type_index(&helper_name).is_some() {
        return Err(RewriteError::HelperTypeConflict {
            name: helper_name.to_string(),
        });
    }

    for function in imports.all().filter(|f| f.set_last_error) {
        let message = format!(
            "{}: last-error capture is not supported and was dropped",
            function.qualified_name()
        );
        warn!("{message}");
        report.warnings.push(message);
    }

    // Stage 2: per-type scaffolding
    let planner = TransformationPlanner::new(helper.clone(), config);
    let mut plans: Vec<TypePlan> = Vec::new();
    for (name, type_imports) in imports.iter() {
        let def = module
            .find_type(name)
            .ok_or_else(|| RewriteError::UnresolvedType {
                type_name: name.to_string(),
            })?;
        plans.push(planner.plan_type(def, type_imports)?);
    }

    // Stage 3: replacement bodies
    let compiler = MarshallingCompiler::new(helper.strings());
    let mut bodies: Vec<(MethodHandle, MethodBody)> = Vec::new();
    for record in plans.iter().flat_map(|p| p.records.iter()) {
        bodies.push((record.function.handle, compiler.compile(record)?));
    }

    // Stage 4: helper type
    let helper_def = PlatformLoaderBuilder::new(helper, config.dlopen_flags).build()?;

    // Stage 5: install
    for plan in &plans {
        let def = module
            .type_mut(&plan.declaring_type)
            .map_err(|e| RewriteError::emit(format!("members of {}", plan.declaring_type), e))?;
        planner.install(def, plan)?;
        info!(
            "{}: rewrote {} stubs ({} libraries)",
            plan.declaring_type,
            plan.records.len(),
            plan.libraries.len()
        );
        report.record_type(plan);
    }
    for (handle, body) in bodies {
        let method = module.method_mut(handle);
        method.pinvoke = None;
        method.body = Some(body);
    }
    module.types.push(helper_def);
    module.regenerate_mvid();

    report.duration_ms = start.elapsed().as_millis() as u64;
    Ok(RewriteOutput { module, report })
}

/// Rewrite `module` in place. On error the module is left untouched.
pub fn rewrite_in_place(module: &mut Module, config: &RewriteConfig) -> Result<RewriteReport> {
    let output = rewrite(module.clone(), config)?;
    *module = output.module;
    Ok(output.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativize_model::builder::{method, param, ModuleBuilder};
    use nativize_model::{PInvokeCallConv, TypeName, TypeRef};

    /// Stubs left outside the generated helper type.
    fn remaining_stubs(module: &Module) -> usize {
        module
            .methods()
            .filter(|(_, ty, m)| m.is_pinvoke() && ty.name.name != "PInvokeHelpers")
            .count()
    }

    fn add_module() -> Module {
        ModuleBuilder::new("app")
            .class("App.Native", |t| {
                t.method(
                    method("Add", TypeRef::i32())
                        .with_params(vec![param("a", TypeRef::i32()), param("b", TypeRef::i32())])
                        .import("m")
                        .calling_convention(PInvokeCallConv::Cdecl),
                )
            })
            .build()
    }

    #[test]
    fn rewrites_add() {
        let module = add_module();
        let mvid = module.mvid;
        let output = rewrite(module, &RewriteConfig::default()).unwrap();

        assert_eq!(remaining_stubs(&output.module), 0);
        assert_ne!(output.module.mvid, mvid);
        let helper = output
            .module
            .find_type(&TypeName::new("", "PInvokeHelpers"))
            .unwrap();
        assert!(helper.method("LoadLibrary").is_some());

        let native = output.module.find_type(&TypeName::parse("App.Native")).unwrap();
        let add = native.method("Add").unwrap();
        assert!(add.pinvoke.is_none());
        assert!(add.body.is_some());
        for member in ["p_Add", "pl_m"] {
            assert!(native.field(member).is_some(), "missing {member}");
        }
        for member in ["init_Add", "native_Add", "LoadLibrarym"] {
            assert!(native.method(member).is_some(), "missing {member}");
        }

        assert!(!output.report.unchanged);
        assert_eq!(output.report.stubs.len(), 1);
        assert_eq!(output.report.stubs[0].symbol, "Add");
    }

    #[test]
    fn module_without_stubs_is_unchanged() {
        let module = ModuleBuilder::new("plain")
            .class("App.Plain", |t| t.method(method("Run", TypeRef::void())))
            .build();
        let output = rewrite(module.clone(), &RewriteConfig::default()).unwrap();
        assert_eq!(output.module, module);
        assert!(output.report.unchanged);
    }

    #[test]
    fn second_rewrite_is_noop() {
        let first = rewrite(add_module(), &RewriteConfig::default()).unwrap().module;
        let second = rewrite(first.clone(), &RewriteConfig::default()).unwrap();
        assert_eq!(second.module, first);
        assert!(second.report.unchanged);
    }

    #[test]
    fn helper_conflict_with_remaining_stubs() {
        let module = ModuleBuilder::new("app")
            .class("PInvokeHelpers", |t| t)
            .class("App.Native", |t| {
                t.method(method("Beep", TypeRef::void()).import("kernel32"))
            })
            .build();
        let err = rewrite(module, &RewriteConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            RewriteError::HelperTypeConflict { ref name } if name == "PInvokeHelpers"
        ));
    }

    #[test]
    fn failing_run_leaves_module_untouched() {
        let mut module = ModuleBuilder::new("app")
            .class("App.Native", |t| {
                t.method(
                    method("Ok", TypeRef::void()).import("m"),
                )
                .method(
                    method("Grid", TypeRef::void())
                        .with_params(vec![param("g", TypeRef::array(TypeRef::i32(), 2))])
                        .import("m"),
                )
            })
            .build();
        let before = module.clone();
        let err = rewrite_in_place(&mut module, &RewriteConfig::default()).unwrap_err();
        assert!(matches!(err, RewriteError::UnsupportedSignature { .. }));
        assert_eq!(module, before);
    }

    #[test]
    fn set_last_error_is_reported() {
        let module = ModuleBuilder::new("app")
            .class("App.Native", |t| {
                t.method(
                    method("Close", TypeRef::i32())
                        .with_params(vec![param("h", TypeRef::int_ptr())])
                        .import("kernel32")
                        .with_pinvoke(|p| p.set_last_error = true),
                )
            })
            .build();
        let output = rewrite(module, &RewriteConfig::default()).unwrap();
        assert_eq!(output.report.warnings.len(), 1);
        assert!(output.report.warnings[0].contains("App.Native::Close"));
    }

    #[test]
    fn excluded_types_keep_their_stubs() {
        let config = RewriteConfig::parse("excluded-types = [\"App.Keep\"]\n").unwrap();
        let module = ModuleBuilder::new("app")
            .class("App.Keep", |t| t.method(method("Beep", TypeRef::void()).import("kernel32")))
            .class("App.Native", |t| t.method(method("Tick", TypeRef::void()).import("m")))
            .build();
        let output = rewrite(module, &config).unwrap();
        assert_eq!(remaining_stubs(&output.module), 1);
        let keep = output.module.find_type(&TypeName::parse("App.Keep")).unwrap();
        assert!(keep.method("Beep").unwrap().pinvoke.is_some());
    }

    #[test]
    fn custom_helper_name() {
        let toml = "[helper-type]\nnamespace = \"App.Interop\"\nname = \"Loader\"\n";
        let config = RewriteConfig::parse(toml).unwrap();
        let output = rewrite(add_module(), &config).unwrap();
        assert!(output
            .module
            .find_type(&TypeName::new("App.Interop", "Loader"))
            .is_some());
        assert_eq!(output.report.helper_type, "App.Interop.Loader");
    }
}
