//! Per-stub scaffolding: address cells, lazy initializers and native thunks.
//!
//! For each declaring type the planner allocates one library cell and one
//! load routine per distinct library, then for each stub an address cell,
//! an initializer and a thunk:
//!
//! ```text
//! static IntPtr pl_libm;                 // library handle, zero until loaded
//! static IntPtr p_Add;                   // symbol address, zero until resolved
//! static void LoadLibrarylibm()          { pl_libm = Helper.LoadLibrary("libm"); }
//! static void init_Add()                 { if (pl_libm == 0) LoadLibrarylibm();
//!                                          p_Add = Helper.GetProcAddress(pl_libm, "Add"); }
//! static int native_Add(int a, int b, IntPtr fn) => calli cdecl int32(int32, int32)
//! ```
//!
//! Generated names never collide with existing members: the first free
//! name among `base`, `base_1`, `base_2`, ... is used.

use std::collections::HashSet;

use indexmap::IndexMap;
use log::debug;

use nativize_model::{
    CallSite, FieldDef, FieldRef, IlEmitter, Instr, MethodDef, MethodFlags, MethodRef, ParamDef,
    TypeDef, TypeName, TypeRef, Visibility,
};

use crate::config::RewriteConfig;
use crate::discover::{ImportedFunction, TypeImports};
use crate::error::{Result, RewriteError};
use crate::loader::HelperType;

/// Library cell and load routine shared by all stubs of a declaring type
/// that import from the same library.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryRecord {
    /// Library as declared on the stubs.
    pub library: String,
    /// Name passed to the loader (after aliasing).
    pub load_name: String,
    pub cell: FieldRef,
    pub loader: MethodRef,
}

/// Members generated for one stub.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformationRecord {
    pub function: ImportedFunction,
    pub cell: FieldRef,
    pub initializer: MethodRef,
    pub thunk: MethodRef,
    pub call_site: CallSite,
    pub library: LibraryRecord,
}

/// Everything generated for one declaring type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypePlan {
    pub declaring_type: TypeName,
    pub libraries: Vec<LibraryRecord>,
    pub records: Vec<TransformationRecord>,
}

/// Hands out member names unique within one type.
struct NameAllocator {
    taken: HashSet<String>,
}

impl NameAllocator {
    fn for_type(def: &TypeDef) -> Self {
        let mut taken = HashSet::new();
        taken.extend(def.fields.iter().map(|f| f.name.clone()));
        taken.extend(def.methods.iter().map(|m| m.name.clone()));
        Self { taken }
    }

    fn fresh(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 0;
        while self.taken.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        self.taken.insert(candidate.clone());
        candidate
    }
}

/// Library name as an identifier fragment.
pub fn sanitize_library(library: &str) -> String {
    library
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Plans and installs the scaffolding of each declaring type.
pub struct TransformationPlanner<'c> {
    helper: HelperType,
    config: &'c RewriteConfig,
}

impl<'c> TransformationPlanner<'c> {
    pub fn new(helper: HelperType, config: &'c RewriteConfig) -> Self {
        Self { helper, config }
    }

    /// Choose names and signatures; does not touch the type.
    pub fn plan_type(&self, def: &TypeDef, imports: &TypeImports) -> Result<TypePlan> {
        let mut names = NameAllocator::for_type(def);
        let owner = def.name.clone();

        let mut libraries: IndexMap<&str, LibraryRecord> = IndexMap::new();
        for library in &imports.libraries {
            let fragment = sanitize_library(library);
            let cell = names.fresh(&format!("pl_{fragment}"));
            let loader = names.fresh(&format!("LoadLibrary{fragment}"));
            libraries.insert(
                library.as_str(),
                LibraryRecord {
                    library: library.clone(),
                    load_name: self.config.load_name(library).to_string(),
                    cell: FieldRef::new(owner.clone(), &cell, TypeRef::int_ptr()),
                    loader: MethodRef::new_static(
                        owner.clone(),
                        &loader,
                        Vec::new(),
                        TypeRef::void(),
                    ),
                },
            );
        }

        let mut records = Vec::with_capacity(imports.functions.len());
        for function in &imports.functions {
            let library = libraries
                .get(function.library.as_str())
                .cloned()
                .ok_or_else(|| RewriteError::MissingLibrary {
                    method: format!("{}::{}", owner, function.name),
                    library: function.library.clone(),
                })?;
            let cell = names.fresh(&format!("p_{}", function.name));
            let initializer = names.fresh(&format!("init_{}", function.name));
            let thunk = names.fresh(&format!("native_{}", function.name));

            let call_site = CallSite {
                convention: function.convention,
                return_type: function.return_slot.native_type(),
                params: function.native_param_types(),
            };
            let mut thunk_params = call_site.params.clone();
            thunk_params.push(TypeRef::int_ptr());

            records.push(TransformationRecord {
                function: function.clone(),
                cell: FieldRef::new(owner.clone(), &cell, TypeRef::int_ptr()),
                initializer: MethodRef::new_static(
                    owner.clone(),
                    &initializer,
                    Vec::new(),
                    TypeRef::void(),
                ),
                thunk: MethodRef::new_static(
                    owner.clone(),
                    &thunk,
                    thunk_params,
                    call_site.return_type.clone(),
                ),
                call_site,
                library,
            });
        }

        Ok(TypePlan {
            declaring_type: owner,
            libraries: libraries.into_values().collect(),
            records,
        })
    }

    /// Add the planned cells and routines to the declaring type.
    pub fn install(&self, def: &mut TypeDef, plan: &TypePlan) -> Result<()> {
        let context = |what: &str| format!("{what} of {}", plan.declaring_type);

        for library in &plan.libraries {
            def.add_field(address_cell(&library.cell))
                .map_err(|e| RewriteError::emit(context("library cell"), e))?;
            def.add_method(self.library_loader(library)?)
                .map_err(|e| RewriteError::emit(context("library loader"), e))?;
            debug!(
                "{}: {} loads '{}'",
                plan.declaring_type, library.loader.name, library.load_name
            );
        }

        for record in &plan.records {
            def.add_field(address_cell(&record.cell))
                .map_err(|e| RewriteError::emit(context("address cell"), e))?;
            def.add_method(self.initializer(record)?)
                .map_err(|e| RewriteError::emit(context("initializer"), e))?;
            def.add_method(thunk(record)?)
                .map_err(|e| RewriteError::emit(context("thunk"), e))?;
            debug!(
                "{}: {} / {} / {} for {}",
                plan.declaring_type,
                record.cell.name,
                record.initializer.name,
                record.thunk.name,
                record.function.name
            );
        }
        Ok(())
    }

    /// `pl_X = Helper.LoadLibrary("<load name>")`
    fn library_loader(&self, library: &LibraryRecord) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        e.emit(Instr::Ldstr(library.load_name.clone()));
        e.emit(Instr::Call(self.helper.load_library()));
        e.emit(Instr::Stsfld(library.cell.clone()));
        e.emit(Instr::Ret);
        private_static(&library.loader.name, Vec::new(), TypeRef::void(), e)
    }

    /// Load the library if needed, then resolve and store the address.
    fn initializer(&self, record: &TransformationRecord) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        let have_library = e.define_label();
        e.emit(Instr::Ldsfld(record.library.cell.clone()));
        e.emit(Instr::Brtrue(have_library));
        e.emit(Instr::Call(record.library.loader.clone()));
        e.mark_label(have_library);
        e.emit(Instr::Ldsfld(record.library.cell.clone()));
        e.emit(Instr::Ldstr(record.function.symbol.clone()));
        e.emit(Instr::Call(self.helper.get_proc_address()));
        e.emit(Instr::Stsfld(record.cell.clone()));
        e.emit(Instr::Ret);
        private_static(&record.initializer.name, Vec::new(), TypeRef::void(), e)
    }
}

/// Forward every argument to one indirect call through the trailing address.
fn thunk(record: &TransformationRecord) -> Result<MethodDef> {
    let mut e = IlEmitter::new();
    for index in 0..record.thunk.params.len() {
        e.emit(Instr::Ldarg(index as u16));
    }
    e.emit(Instr::Calli(record.call_site.clone()));
    e.emit(Instr::Ret);

    let mut params: Vec<(String, TypeRef)> = record
        .function
        .params
        .iter()
        .map(|p| (p.name.clone(), p.native_type()))
        .collect();
    params.push(("fn".to_string(), TypeRef::int_ptr()));

    let mut method = private_static(
        &record.thunk.name,
        params,
        record.thunk.return_type.clone(),
        e,
    )?;
    method.flags.aggressive_inlining = true;
    Ok(method)
}

fn address_cell(cell: &FieldRef) -> FieldDef {
    FieldDef {
        name: cell.name.clone(),
        ty: cell.ty.clone(),
        is_static: true,
        is_readonly: false,
        visibility: Visibility::Private,
        marshal: None,
    }
}

fn private_static(
    name: &str,
    params: Vec<(String, TypeRef)>,
    ret: TypeRef,
    e: IlEmitter,
) -> Result<MethodDef> {
    let body = e
        .finish()
        .map_err(|err| RewriteError::emit(format!("body of {name}"), err))?;
    Ok(MethodDef {
        name: name.to_string(),
        params: params
            .into_iter()
            .map(|(name, ty)| ParamDef {
                name,
                ty,
                marshal: None,
            })
            .collect(),
        return_type: ret,
        return_marshal: None,
        is_static: true,
        visibility: Visibility::Private,
        flags: MethodFlags {
            hide_by_sig: true,
            ..MethodFlags::default()
        },
        pinvoke: None,
        body: Some(body),
    })
}
