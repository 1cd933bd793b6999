//! Replacement bodies for import stubs.
//!
//! A compiled stub, in order:
//!
//! 1. init check: `if (p_X == 0) init_X();`
//! 2. string-array pre-pass: one address array per string-array parameter,
//!    then a try block opens
//! 3. per-parameter marshalling, pushing the thunk's arguments
//! 4. `native_X(args..., p_X)`
//! 5. return conversion
//! 6. with string arrays: the result is staged in a local and the finally
//!    block frees every native copy
//!
//! Null and empty arrays cross as a null pointer; a null string crosses as
//! a null pointer in both encodings.

use std::collections::HashMap;

use nativize_model::{bcl, IlEmitter, Instr, MethodBody, TypeRef};

use crate::discover::ParamSlot;
use crate::error::{Result, RewriteError};
use crate::helpers::StringHelpers;
use crate::marshal::{BoolWidth, MarshallingPlan};
use crate::plan::TransformationRecord;

/// Compiles stub bodies against one helper type.
pub struct MarshallingCompiler {
    strings: StringHelpers,
}

impl MarshallingCompiler {
    pub fn new(strings: StringHelpers) -> Self {
        Self { strings }
    }

    pub fn compile(&self, record: &TransformationRecord) -> Result<MethodBody> {
        let function = &record.function;
        let mut e = IlEmitter::new();

        let ready = e.define_label();
        e.emit(Instr::Ldsfld(record.cell.clone()));
        e.emit(Instr::Brtrue(ready));
        e.emit(Instr::Call(record.initializer.clone()));
        e.mark_label(ready);

        let mut address_arrays: HashMap<usize, u16> = HashMap::new();
        for (index, slot) in function.params.iter().enumerate() {
            if matches!(slot.plan, MarshallingPlan::StringArray(_)) {
                let local = e.declare_local(TypeRef::vector(TypeRef::int_ptr()));
                emit_address_array(&mut e, index as u16, local);
                address_arrays.insert(index, local);
            }
        }

        let protected = !address_arrays.is_empty();
        if protected {
            e.begin_try();
            for (index, slot) in function.params.iter().enumerate() {
                if let (MarshallingPlan::StringArray(encoding), Some(local)) =
                    (slot.plan, address_arrays.get(&index))
                {
                    e.emit(Instr::Ldarg(index as u16));
                    e.emit(Instr::Ldloc(*local));
                    e.emit(Instr::Call(self.strings.string_array_prolog(encoding)));
                }
            }
        }

        for (index, slot) in function.params.iter().enumerate() {
            self.emit_argument(&mut e, index as u16, slot, address_arrays.get(&index).copied());
        }

        e.emit(Instr::Ldsfld(record.cell.clone()));
        e.emit(Instr::Call(record.thunk.clone()));
        self.emit_return(&mut e, record);

        let returns_value = !function.return_slot.ty.is_void();
        if protected {
            let result = returns_value.then(|| e.declare_local(function.return_slot.ty.clone()));
            if let Some(local) = result {
                e.emit(Instr::Stloc(local));
            }
            e.begin_finally();
            for (index, _) in function.params.iter().enumerate() {
                if let Some(local) = address_arrays.get(&index) {
                    e.emit(Instr::Ldloc(*local));
                    e.emit(Instr::Call(self.strings.string_array_epilog()));
                }
            }
            e.end_try();
            if let Some(local) = result {
                e.emit(Instr::Ldloc(local));
            }
        }
        e.emit(Instr::Ret);

        e.finish().map_err(|err| {
            RewriteError::emit(format!("body of {}", function.qualified_name()), err)
        })
    }

    fn emit_argument(&self, e: &mut IlEmitter, index: u16, slot: &ParamSlot, addrs: Option<u16>) {
        match slot.plan {
            MarshallingPlan::Direct => e.emit(Instr::Ldarg(index)),
            MarshallingPlan::BooleanToInt(width) => {
                e.emit(Instr::Ldarg(index));
                e.emit(Instr::LdcI4(0));
                e.emit(Instr::CgtUn);
                if width == BoolWidth::Byte {
                    e.emit(Instr::ConvU1);
                }
            }
            MarshallingPlan::ByRef => {
                let pin = e.declare_pinned(slot.ty.clone());
                e.emit(Instr::Ldarg(index));
                e.emit(Instr::Stloc(pin));
                e.emit(Instr::Ldloc(pin));
                e.emit(Instr::ConvI);
            }
            MarshallingPlan::BlittableArray => {
                let element = slot
                    .ty
                    .as_array()
                    .map(|(element, _)| element.clone())
                    .unwrap_or_else(TypeRef::u8);
                emit_pinned_array(e, Instr::Ldarg(index), element);
            }
            MarshallingPlan::UnicodeString => {
                let pin = e.declare_pinned(TypeRef::string());
                let null = e.define_label();
                e.emit(Instr::Ldarg(index));
                e.emit(Instr::Stloc(pin));
                e.emit(Instr::Ldloc(pin));
                e.emit(Instr::ConvI);
                e.emit(Instr::Dup);
                e.emit(Instr::Brfalse(null));
                e.emit(Instr::Call(bcl::offset_to_string_data()));
                e.emit(Instr::Add);
                e.mark_label(null);
            }
            MarshallingPlan::AnsiString => {
                let bytes = e.declare_local(TypeRef::vector(TypeRef::u8()));
                e.emit(Instr::Ldarg(index));
                e.emit(Instr::Call(self.strings.string_to_ansi_byte_array()));
                e.emit(Instr::Stloc(bytes));
                emit_pinned_array(e, Instr::Ldloc(bytes), TypeRef::u8());
            }
            MarshallingPlan::StringArray(_) => {
                if let Some(local) = addrs {
                    emit_pinned_array(e, Instr::Ldloc(local), TypeRef::int_ptr());
                }
            }
            MarshallingPlan::Delegate => {
                let have = e.define_label();
                let done = e.define_label();
                e.emit(Instr::Ldarg(index));
                e.emit(Instr::Brtrue(have));
                emit_null_pointer(e);
                e.emit(Instr::Br(done));
                e.mark_label(have);
                e.emit(Instr::Ldarg(index));
                e.emit(Instr::Call(bcl::get_function_pointer_for_delegate()));
                e.mark_label(done);
            }
        }
    }

    fn emit_return(&self, e: &mut IlEmitter, record: &TransformationRecord) {
        let slot = &record.function.return_slot;
        if slot.ty.is_void() {
            return;
        }
        match slot.plan {
            MarshallingPlan::BooleanToInt(_) => {
                e.emit(Instr::LdcI4(0));
                e.emit(Instr::CgtUn);
            }
            MarshallingPlan::AnsiString => e.emit(Instr::Call(bcl::ptr_to_string_ansi())),
            MarshallingPlan::UnicodeString => e.emit(Instr::Call(bcl::ptr_to_string_uni())),
            MarshallingPlan::Delegate => {
                let have = e.define_label();
                let done = e.define_label();
                e.emit(Instr::Dup);
                e.emit(Instr::Brtrue(have));
                e.emit(Instr::Pop);
                e.emit(Instr::Ldnull);
                e.emit(Instr::Br(done));
                e.mark_label(have);
                e.emit(Instr::Ldtoken(slot.ty.clone()));
                e.emit(Instr::Call(bcl::type_from_handle()));
                e.emit(Instr::Call(bcl::get_delegate_for_function_pointer()));
                e.emit(Instr::Castclass(slot.ty.clone()));
                e.mark_label(done);
            }
            MarshallingPlan::Direct
            | MarshallingPlan::ByRef
            | MarshallingPlan::BlittableArray
            | MarshallingPlan::StringArray(_) => {}
        }
    }
}

/// `addrs = new IntPtr[arg == null ? 0 : arg.Length]`
fn emit_address_array(e: &mut IlEmitter, index: u16, local: u16) {
    let non_null = e.define_label();
    let sized = e.define_label();
    e.emit(Instr::Ldarg(index));
    e.emit(Instr::Brtrue(non_null));
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::Br(sized));
    e.mark_label(non_null);
    e.emit(Instr::Ldarg(index));
    e.emit(Instr::Ldlen);
    e.emit(Instr::ConvI4);
    e.mark_label(sized);
    e.emit(Instr::Newarr(TypeRef::int_ptr()));
    e.emit(Instr::Stloc(local));
}

/// Push the address of element 0, pinned; null for a null or empty array.
fn emit_pinned_array(e: &mut IlEmitter, load: Instr, element: TypeRef) {
    let pin = e.declare_pinned(TypeRef::by_ref(element.clone()));
    let empty = e.define_label();
    let done = e.define_label();

    e.emit(load.clone());
    e.emit(Instr::Brfalse(empty));
    e.emit(load.clone());
    e.emit(Instr::Ldlen);
    e.emit(Instr::ConvI4);
    e.emit(Instr::Brfalse(empty));
    e.emit(load);
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::Ldelema(element));
    e.emit(Instr::Stloc(pin));
    e.emit(Instr::Ldloc(pin));
    e.emit(Instr::ConvI);
    e.emit(Instr::Br(done));
    e.mark_label(empty);
    emit_null_pointer(e);
    e.mark_label(done);
}

fn emit_null_pointer(e: &mut IlEmitter) {
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::ConvU);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RewriteConfig;
    use crate::discover::{discover, DiscoveryOptions};
    use crate::loader::HelperType;
    use crate::plan::{TransformationPlanner, TypePlan};
    use nativize_model::builder::{method, param, ModuleBuilder};
    use nativize_model::{MarshalInfo, Module, NativeType, PInvokeCallConv, TypeName};

    fn plan(module: &Module) -> TypePlan {
        let config = RewriteConfig::default();
        let found = discover(
            module,
            &DiscoveryOptions {
                helper_type: config.helper_type_name(),
                excluded_types: Vec::new(),
            },
        )
        .unwrap();
        let (name, imports) = found.iter().next().unwrap();
        let helper = HelperType::new(config.helper_type_name());
        let planner = TransformationPlanner::new(helper, &config);
        planner.plan_type(module.find_type(name).unwrap(), imports).unwrap()
    }

    fn compile(module: &Module, index: usize) -> MethodBody {
        let plan = plan(module);
        let helper = HelperType::new(TypeName::new("", "PInvokeHelpers"));
        MarshallingCompiler::new(helper.strings())
            .compile(&plan.records[index])
            .unwrap()
    }

    fn single(m: nativize_model::MethodDef) -> Module {
        ModuleBuilder::new("c")
            .delegate("App.Callback", TypeRef::void(), vec![TypeRef::i32()])
            .class("App.Native", |t| t.method(m))
            .build()
    }

    #[test]
    fn add_body_shape() {
        let m = single(
            method("Add", TypeRef::i32())
                .with_params(vec![param("a", TypeRef::i32()), param("b", TypeRef::i32())])
                .import("m")
                .calling_convention(PInvokeCallConv::Cdecl),
        );
        let body = compile(&m, 0);
        assert_eq!(
            body.opcodes(),
            vec!["ldsfld", "brtrue", "call", "ldarg", "ldarg", "ldsfld", "call", "ret"]
        );
        assert!(body.regions.is_empty());
        match &body.instrs[6] {
            Instr::Call(r) => assert_eq!(r.name, "native_Add"),
            other => panic!("expected thunk call, got {other}"),
        }
    }

    #[test]
    fn boolean_width_follows_annotation() {
        let m = single(
            method("Flag", TypeRef::boolean())
                .with_params(vec![
                    param("wide", TypeRef::boolean()),
                    param("narrow", TypeRef::boolean())
                        .with_marshal(MarshalInfo::new(NativeType::U1)),
                ])
                .import("m"),
        );
        let ops = compile(&m, 0).opcodes();
        assert_eq!(ops.iter().filter(|o| *o == "cgt.un").count(), 3);
        assert_eq!(ops.iter().filter(|o| *o == "conv.u1").count(), 1);
    }

    #[test]
    fn string_array_uses_finally() {
        let m = single(
            method("Join", TypeRef::i32())
                .with_params(vec![param("items", TypeRef::vector(TypeRef::string()))])
                .import("m"),
        );
        let body = compile(&m, 0);
        assert_eq!(body.regions.len(), 1);
        let region = body.regions[0];
        let finally = &body.instrs[region.finally_start..region.finally_end];
        assert!(finally
            .iter()
            .any(|i| matches!(i, Instr::Call(r) if r.name == "StringArrayMarshallingEpilog")));
        let tried = &body.instrs[region.try_start..region.try_end];
        assert!(tried
            .iter()
            .any(|i| matches!(i, Instr::Call(r) if r.name == "StringArrayMarshallingProlog")));
        // result staged in a local and reloaded after the region
        assert_eq!(body.instrs.last(), Some(&Instr::Ret));
        assert!(matches!(body.instrs[body.instrs.len() - 2], Instr::Ldloc(_)));
    }

    #[test]
    fn unicode_string_array_uses_wide_prolog() {
        let m = single(
            method("Join", TypeRef::void())
                .with_params(vec![param("items", TypeRef::vector(TypeRef::string()))
                    .with_marshal(MarshalInfo::array_of(NativeType::LPWStr))])
                .import("m"),
        );
        let body = compile(&m, 0);
        assert!(body
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Call(r) if r.name == "StringArrayMarshallingPrologUni")));
    }

    #[test]
    fn pinned_locals_for_arrays_strings_and_refs() {
        let m = single(
            method("Fill", TypeRef::void())
                .with_params(vec![
                    param("buf", TypeRef::vector(TypeRef::u8())),
                    param("name", TypeRef::string())
                        .with_marshal(MarshalInfo::new(NativeType::LPWStr)),
                    param("count", TypeRef::by_ref(TypeRef::i32())),
                    param("ansi", TypeRef::string()),
                ])
                .import("m"),
        );
        let body = compile(&m, 0);
        let pinned: Vec<&TypeRef> = body
            .locals
            .iter()
            .filter(|l| l.pinned)
            .map(|l| &l.ty)
            .collect();
        assert_eq!(
            pinned,
            vec![
                &TypeRef::by_ref(TypeRef::u8()),
                &TypeRef::string(),
                &TypeRef::by_ref(TypeRef::i32()),
                &TypeRef::by_ref(TypeRef::u8()),
            ]
        );
        assert!(body
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Call(r) if r.name == "StringToAnsiByteArray")));
        assert!(body.instrs.contains(&Instr::Call(bcl::offset_to_string_data())));
    }

    #[test]
    fn string_and_delegate_returns() {
        let m = single(
            method("Name", TypeRef::string())
                .with_return_marshal(MarshalInfo::new(NativeType::LPWStr))
                .import("m"),
        );
        let body = compile(&m, 0);
        assert!(body.instrs.contains(&Instr::Call(bcl::ptr_to_string_uni())));
        assert!(!body.instrs.contains(&Instr::Call(bcl::free_hglobal())));

        let m = single(method("Callback", TypeRef::named("App.Callback")).import("m"));
        let body = compile(&m, 0);
        assert!(body
            .instrs
            .contains(&Instr::Castclass(TypeRef::named("App.Callback"))));
        assert!(body
            .instrs
            .contains(&Instr::Call(bcl::get_delegate_for_function_pointer())));
    }

    #[test]
    fn delegate_parameter_converted() {
        let m = single(
            method("Register", TypeRef::void())
                .with_params(vec![param("cb", TypeRef::named("App.Callback"))])
                .import("m"),
        );
        let body = compile(&m, 0);
        assert!(body
            .instrs
            .contains(&Instr::Call(bcl::get_function_pointer_for_delegate())));
    }
}
