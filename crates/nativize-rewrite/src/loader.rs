//! The generated helper type: native library loading on every OS family.
//!
//! The helper type holds hand-authored, already-final loader imports for
//! each family (Linux `libdl`, Darwin `libSystem`, BSD `libc`, Windows
//! `kernel32`), an OS-name probe built on `uname`, a memoized Unix-flavour
//! detector, per-call dispatchers and the facade every rewritten stub uses:
//!
//! ```text
//! LoadLibrary(name)            -> handle   throws "LoadLibrary failed for: <name>"
//! GetProcAddress(handle, sym)  -> address  throws "GetProcAddress failed for: <sym>"
//! FreeLibrary(handle)          -> status
//! ```
//!
//! The facade branches on `isUnix`, which the static constructor computes
//! once from the platform newline convention.

use log::debug;

use nativize_model::{
    bcl, CharSet, FieldDef, FieldRef, IlEmitter, Instr, MethodDef, MethodFlags, MethodRef,
    PInvokeCallConv, PInvokeInfo, ParamDef, TypeDef, TypeKind, TypeName, TypeRef, Visibility,
};

use crate::error::{Result, RewriteError};
use crate::helpers::{self, StringHelpers};

/// Message of the exception thrown when no loader family matches.
pub const PLATFORM_NOT_SUPPORTED: &str = "Platform Not Supported";
pub const LOAD_FAILED_PREFIX: &str = "LoadLibrary failed for: ";
pub const RESOLVE_FAILED_PREFIX: &str = "GetProcAddress failed for: ";

/// Bytes allocated for the `utsname` record; larger than any supported
/// platform's record.
pub const UNAME_BUFFER_SIZE: i32 = 8192;

/// Field holding the OS-family flag.
pub const IS_UNIX_FIELD: &str = "isUnix";
/// Field holding the detected Unix flavour; zero until first detection.
pub const UNIX_FLAVOR_FIELD: &str = "unixFlavor";

/// A Unix flavour with its own loader library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixFlavor {
    Linux,
    Darwin,
    Bsd,
}

impl UnixFlavor {
    pub const ALL: [UnixFlavor; 3] = [UnixFlavor::Linux, UnixFlavor::Darwin, UnixFlavor::Bsd];

    /// Member-name prefix of the flavour's loader triad.
    pub fn prefix(self) -> &'static str {
        match self {
            UnixFlavor::Linux => "linux_",
            UnixFlavor::Darwin => "darwin_",
            UnixFlavor::Bsd => "bsd_",
        }
    }

    /// Library exporting `dlopen`, `dlclose` and `dlsym`.
    pub fn library(self) -> &'static str {
        match self {
            UnixFlavor::Linux => "libdl",
            UnixFlavor::Darwin => "libSystem",
            UnixFlavor::Bsd => "libc",
        }
    }
}

/// `uname` system names in detection order, with the flavour each selects.
/// The cell value stored for a match is its position plus one.
pub const SYSTEM_NAMES: [(&str, UnixFlavor); 4] = [
    ("Linux", UnixFlavor::Linux),
    ("Darwin", UnixFlavor::Darwin),
    ("FreeBSD", UnixFlavor::Bsd),
    ("NetBSD", UnixFlavor::Bsd),
];

/// References to the members of the generated helper type.
#[derive(Debug, Clone)]
pub struct HelperType {
    pub name: TypeName,
}

impl HelperType {
    pub fn new(name: TypeName) -> Self {
        Self { name }
    }

    pub fn method(&self, name: &str, params: Vec<TypeRef>, ret: TypeRef) -> MethodRef {
        MethodRef::new_static(self.name.clone(), name, params, ret)
    }

    pub fn field(&self, name: &str, ty: TypeRef) -> FieldRef {
        FieldRef::new(self.name.clone(), name, ty)
    }

    /// `IntPtr LoadLibrary(string)`
    pub fn load_library(&self) -> MethodRef {
        self.method("LoadLibrary", vec![TypeRef::string()], TypeRef::int_ptr())
    }

    /// `IntPtr GetProcAddress(IntPtr, string)`
    pub fn get_proc_address(&self) -> MethodRef {
        self.method(
            "GetProcAddress",
            vec![TypeRef::int_ptr(), TypeRef::string()],
            TypeRef::int_ptr(),
        )
    }

    /// `int32 FreeLibrary(IntPtr)`
    pub fn free_library(&self) -> MethodRef {
        self.method("FreeLibrary", vec![TypeRef::int_ptr()], TypeRef::i32())
    }

    fn is_unix_field(&self) -> FieldRef {
        self.field(IS_UNIX_FIELD, TypeRef::boolean())
    }

    fn unix_flavor_field(&self) -> FieldRef {
        self.field(UNIX_FLAVOR_FIELD, TypeRef::i32())
    }

    fn dlopen(&self, prefix: &str) -> MethodRef {
        self.method(
            &format!("{prefix}dlopen"),
            vec![TypeRef::string(), TypeRef::i32()],
            TypeRef::int_ptr(),
        )
    }

    fn dlclose(&self, prefix: &str) -> MethodRef {
        self.method(
            &format!("{prefix}dlclose"),
            vec![TypeRef::int_ptr()],
            TypeRef::i32(),
        )
    }

    fn dlsym(&self, prefix: &str) -> MethodRef {
        self.method(
            &format!("{prefix}dlsym"),
            vec![TypeRef::int_ptr(), TypeRef::string()],
            TypeRef::int_ptr(),
        )
    }

    pub fn strings(&self) -> StringHelpers {
        StringHelpers::new(self.clone())
    }
}

/// Builds the helper type definition.
pub struct PlatformLoaderBuilder {
    helper: HelperType,
    dlopen_flags: i32,
}

impl PlatformLoaderBuilder {
    pub fn new(helper: HelperType, dlopen_flags: i32) -> Self {
        Self {
            helper,
            dlopen_flags,
        }
    }

    pub fn build(&self) -> Result<TypeDef> {
        let mut def = TypeDef {
            name: self.helper.name.clone(),
            kind: TypeKind::Class,
            visibility: Visibility::Assembly,
            is_abstract: true,
            is_sealed: true,
            before_field_init: true,
            base: Some(TypeRef::object()),
            fields: Vec::new(),
            methods: Vec::new(),
        };

        def.fields.push(FieldDef {
            name: IS_UNIX_FIELD.to_string(),
            ty: TypeRef::boolean(),
            is_static: true,
            is_readonly: true,
            visibility: Visibility::Private,
            marshal: None,
        });
        def.fields.push(FieldDef {
            name: UNIX_FLAVOR_FIELD.to_string(),
            ty: TypeRef::i32(),
            is_static: true,
            is_readonly: false,
            visibility: Visibility::Private,
            marshal: None,
        });

        let mut methods = Vec::new();
        for flavor in UnixFlavor::ALL {
            methods.extend(unix_triad(flavor));
        }
        methods.extend(windows_triad());
        methods.push(uname_import());
        methods.push(self.system_name()?);
        methods.push(self.unix_flavor()?);
        methods.push(self.dispatch_dlopen()?);
        methods.push(self.dispatch_dlclose()?);
        methods.push(self.dispatch_dlsym()?);
        methods.push(self.is_unix()?);
        methods.push(self.static_constructor()?);
        methods.push(self.facade_load()?);
        methods.push(self.facade_free()?);
        methods.push(self.facade_resolve()?);
        methods.extend(helpers::build_string_helpers()?);

        for method in methods {
            def.add_method(method)
                .map_err(|e| RewriteError::emit(format!("helper type {}", self.helper.name), e))?;
        }

        debug!(
            "built helper type {} ({} methods)",
            def.name,
            def.methods.len()
        );
        Ok(def)
    }

    /// `string GetSystemName()`: the `uname` sysname, or "" when `uname` fails.
    fn system_name(&self) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        let buffer = e.declare_local(TypeRef::int_ptr());
        let result = e.declare_local(TypeRef::string());

        e.emit(Instr::LdcI4(UNAME_BUFFER_SIZE));
        e.emit(Instr::Call(bcl::alloc_hglobal()));
        e.emit(Instr::Stloc(buffer));

        let end = e.begin_try();
        let ok = e.define_label();
        e.emit(Instr::Ldloc(buffer));
        e.emit(Instr::Call(self.helper.method(
            "libc_uname",
            vec![TypeRef::int_ptr()],
            TypeRef::i32(),
        )));
        e.emit(Instr::Brfalse(ok));
        e.emit(Instr::Ldstr(String::new()));
        e.emit(Instr::Stloc(result));
        e.emit(Instr::Leave(end));
        e.mark_label(ok);
        e.emit(Instr::Ldloc(buffer));
        e.emit(Instr::Call(bcl::ptr_to_string_ansi()));
        e.emit(Instr::Stloc(result));
        e.begin_finally();
        e.emit(Instr::Ldloc(buffer));
        e.emit(Instr::Call(bcl::free_hglobal()));
        e.end_try();

        e.emit(Instr::Ldloc(result));
        e.emit(Instr::Ret);

        finish_static("GetSystemName", Vec::new(), TypeRef::string(), e)
    }

    /// `int32 GetUnixFlavor()`: memoized; throws on an unknown system.
    fn unix_flavor(&self) -> Result<MethodDef> {
        let cell = self.helper.unix_flavor_field();
        let mut e = IlEmitter::new();
        let name = e.declare_local(TypeRef::string());
        let done = e.define_label();
        let store = e.define_label();

        e.emit(Instr::Ldsfld(cell.clone()));
        e.emit(Instr::Dup);
        e.emit(Instr::Brtrue(done));
        e.emit(Instr::Pop);
        e.emit(Instr::Call(self.helper.method(
            "GetSystemName",
            Vec::new(),
            TypeRef::string(),
        )));
        e.emit(Instr::Stloc(name));

        for (index, (system, _)) in SYSTEM_NAMES.iter().enumerate() {
            let next = e.define_label();
            e.emit(Instr::Ldloc(name));
            e.emit(Instr::Ldstr(system.to_string()));
            e.emit(Instr::Call(bcl::string_equals()));
            e.emit(Instr::Brfalse(next));
            e.emit(Instr::LdcI4(index as i32 + 1));
            e.emit(Instr::Br(store));
            e.mark_label(next);
        }
        emit_throw(&mut e, PLATFORM_NOT_SUPPORTED);

        e.mark_label(store);
        e.emit(Instr::Dup);
        e.emit(Instr::Stsfld(cell));
        e.mark_label(done);
        e.emit(Instr::Ret);

        finish_static("GetUnixFlavor", Vec::new(), TypeRef::i32(), e)
    }

    /// Switch on the flavour and forward all arguments to its triad member.
    fn dispatch(
        &self,
        name: &str,
        params: Vec<(&str, TypeRef)>,
        ret: TypeRef,
        target: impl Fn(&str) -> MethodRef,
    ) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        let labels: Vec<_> = UnixFlavor::ALL.iter().map(|_| e.define_label()).collect();
        let label_of = |flavor: UnixFlavor| labels[flavor as usize];

        e.emit(Instr::Call(self.helper.method(
            "GetUnixFlavor",
            Vec::new(),
            TypeRef::i32(),
        )));
        e.emit(Instr::LdcI4(1));
        e.emit(Instr::Sub);
        e.emit(Instr::Switch(
            SYSTEM_NAMES.iter().map(|(_, f)| label_of(*f)).collect(),
        ));
        emit_throw(&mut e, PLATFORM_NOT_SUPPORTED);

        for flavor in UnixFlavor::ALL {
            e.mark_label(label_of(flavor));
            for index in 0..params.len() {
                e.emit(Instr::Ldarg(index as u16));
            }
            e.emit(Instr::Call(target(flavor.prefix())));
            e.emit(Instr::Ret);
        }

        finish_static(name, params, ret, e)
    }

    fn dispatch_dlopen(&self) -> Result<MethodDef> {
        self.dispatch(
            "dlopen",
            vec![("fileName", TypeRef::string()), ("flags", TypeRef::i32())],
            TypeRef::int_ptr(),
            |prefix| self.helper.dlopen(prefix),
        )
    }

    fn dispatch_dlclose(&self) -> Result<MethodDef> {
        self.dispatch(
            "dlclose",
            vec![("handle", TypeRef::int_ptr())],
            TypeRef::i32(),
            |prefix| self.helper.dlclose(prefix),
        )
    }

    fn dispatch_dlsym(&self) -> Result<MethodDef> {
        self.dispatch(
            "dlsym",
            vec![("handle", TypeRef::int_ptr()), ("symbol", TypeRef::string())],
            TypeRef::int_ptr(),
            |prefix| self.helper.dlsym(prefix),
        )
    }

    /// `bool IsUnix()`: newline convention probe.
    fn is_unix(&self) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        e.emit(Instr::Call(bcl::environment_newline()));
        e.emit(Instr::Ldstr("\n".to_string()));
        e.emit(Instr::Call(bcl::string_equals()));
        e.emit(Instr::Ret);
        finish_static("IsUnix", Vec::new(), TypeRef::boolean(), e)
    }

    fn static_constructor(&self) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        e.emit(Instr::Call(self.helper.method(
            "IsUnix",
            Vec::new(),
            TypeRef::boolean(),
        )));
        e.emit(Instr::Stsfld(self.helper.is_unix_field()));
        e.emit(Instr::Ret);
        let mut method = finish_static(".cctor", Vec::new(), TypeRef::void(), e)?;
        method.visibility = Visibility::Private;
        method.flags.special_name = true;
        Ok(method)
    }

    /// `IntPtr LoadLibrary(string name)`
    fn facade_load(&self) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        let handle = e.declare_local(TypeRef::int_ptr());
        let windows = e.define_label();
        let check = e.define_label();
        let ok = e.define_label();

        e.emit(Instr::Ldsfld(self.helper.is_unix_field()));
        e.emit(Instr::Brfalse(windows));
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::LdcI4(self.dlopen_flags));
        e.emit(Instr::Call(self.helper.dlopen("")));
        e.emit(Instr::Stloc(handle));
        e.emit(Instr::Br(check));
        e.mark_label(windows);
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Call(windows_method(
            "LoadLibrary",
            vec![TypeRef::string()],
            TypeRef::int_ptr(),
            &self.helper,
        )));
        e.emit(Instr::Stloc(handle));
        e.mark_label(check);
        e.emit(Instr::Ldloc(handle));
        e.emit(Instr::Brtrue(ok));
        emit_throw_with(&mut e, LOAD_FAILED_PREFIX, 0);
        e.mark_label(ok);
        e.emit(Instr::Ldloc(handle));
        e.emit(Instr::Ret);

        finish_static(
            "LoadLibrary",
            vec![("name", TypeRef::string())],
            TypeRef::int_ptr(),
            e,
        )
    }

    /// `IntPtr GetProcAddress(IntPtr handle, string symbol)`
    fn facade_resolve(&self) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        let address = e.declare_local(TypeRef::int_ptr());
        let windows = e.define_label();
        let check = e.define_label();
        let ok = e.define_label();

        e.emit(Instr::Ldsfld(self.helper.is_unix_field()));
        e.emit(Instr::Brfalse(windows));
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Ldarg(1));
        e.emit(Instr::Call(self.helper.dlsym("")));
        e.emit(Instr::Stloc(address));
        e.emit(Instr::Br(check));
        e.mark_label(windows);
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Ldarg(1));
        e.emit(Instr::Call(windows_method(
            "GetProcAddress",
            vec![TypeRef::int_ptr(), TypeRef::string()],
            TypeRef::int_ptr(),
            &self.helper,
        )));
        e.emit(Instr::Stloc(address));
        e.mark_label(check);
        e.emit(Instr::Ldloc(address));
        e.emit(Instr::Brtrue(ok));
        emit_throw_with(&mut e, RESOLVE_FAILED_PREFIX, 1);
        e.mark_label(ok);
        e.emit(Instr::Ldloc(address));
        e.emit(Instr::Ret);

        finish_static(
            "GetProcAddress",
            vec![("handle", TypeRef::int_ptr()), ("symbol", TypeRef::string())],
            TypeRef::int_ptr(),
            e,
        )
    }

    /// `int32 FreeLibrary(IntPtr handle)`: the raw platform status.
    fn facade_free(&self) -> Result<MethodDef> {
        let mut e = IlEmitter::new();
        let windows = e.define_label();

        e.emit(Instr::Ldsfld(self.helper.is_unix_field()));
        e.emit(Instr::Brfalse(windows));
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Call(self.helper.dlclose("")));
        e.emit(Instr::Ret);
        e.mark_label(windows);
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Call(windows_method(
            "FreeLibrary",
            vec![TypeRef::int_ptr()],
            TypeRef::i32(),
            &self.helper,
        )));
        e.emit(Instr::Ret);

        finish_static(
            "FreeLibrary",
            vec![("handle", TypeRef::int_ptr())],
            TypeRef::i32(),
            e,
        )
    }
}

fn windows_method(
    name: &str,
    params: Vec<TypeRef>,
    ret: TypeRef,
    helper: &HelperType,
) -> MethodRef {
    helper.method(&format!("windows_{name}"), params, ret)
}

/// `throw new Exception(message)`
pub(crate) fn emit_throw(e: &mut IlEmitter, message: &str) {
    e.emit(Instr::Ldstr(message.to_string()));
    e.emit(Instr::Newobj(bcl::exception_ctor()));
    e.emit(Instr::Throw);
}

/// `throw new Exception(prefix + argN)`
fn emit_throw_with(e: &mut IlEmitter, prefix: &str, arg: u16) {
    e.emit(Instr::Ldstr(prefix.to_string()));
    e.emit(Instr::Ldarg(arg));
    e.emit(Instr::Call(bcl::string_concat2()));
    e.emit(Instr::Newobj(bcl::exception_ctor()));
    e.emit(Instr::Throw);
}

/// An assembly-visible static method with the emitted body.
pub(crate) fn finish_static(
    name: &str,
    params: Vec<(&str, TypeRef)>,
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
            .map(|(n, ty)| ParamDef {
                name: n.to_string(),
                ty,
                marshal: None,
            })
            .collect(),
        return_type: ret,
        return_marshal: None,
        is_static: true,
        visibility: Visibility::Assembly,
        flags: MethodFlags {
            hide_by_sig: true,
            ..MethodFlags::default()
        },
        pinvoke: None,
        body: Some(body),
    })
}

/// A declarative import that stays as is.
fn loader_import(
    name: &str,
    library: &str,
    entry: &str,
    params: Vec<(&str, TypeRef)>,
    ret: TypeRef,
    convention: PInvokeCallConv,
    char_set: CharSet,
) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        params: params
            .into_iter()
            .map(|(n, ty)| ParamDef {
                name: n.to_string(),
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
        pinvoke: Some(PInvokeInfo {
            module: library.to_string(),
            entry_point: Some(entry.to_string()),
            calling_convention: convention,
            char_set,
            exact_spelling: true,
            set_last_error: false,
        }),
        body: None,
    }
}

fn unix_triad(flavor: UnixFlavor) -> Vec<MethodDef> {
    let prefix = flavor.prefix();
    let library = flavor.library();
    vec![
        loader_import(
            &format!("{prefix}dlopen"),
            library,
            "dlopen",
            vec![("fileName", TypeRef::string()), ("flags", TypeRef::i32())],
            TypeRef::int_ptr(),
            PInvokeCallConv::Cdecl,
            CharSet::Ansi,
        ),
        loader_import(
            &format!("{prefix}dlclose"),
            library,
            "dlclose",
            vec![("handle", TypeRef::int_ptr())],
            TypeRef::i32(),
            PInvokeCallConv::Cdecl,
            CharSet::Ansi,
        ),
        loader_import(
            &format!("{prefix}dlsym"),
            library,
            "dlsym",
            vec![("handle", TypeRef::int_ptr()), ("symbol", TypeRef::string())],
            TypeRef::int_ptr(),
            PInvokeCallConv::Cdecl,
            CharSet::Ansi,
        ),
    ]
}

fn windows_triad() -> Vec<MethodDef> {
    vec![
        loader_import(
            "windows_LoadLibrary",
            "kernel32",
            "LoadLibraryW",
            vec![("fileName", TypeRef::string())],
            TypeRef::int_ptr(),
            PInvokeCallConv::Winapi,
            CharSet::Unicode,
        ),
        loader_import(
            "windows_FreeLibrary",
            "kernel32",
            "FreeLibrary",
            vec![("handle", TypeRef::int_ptr())],
            TypeRef::i32(),
            PInvokeCallConv::Winapi,
            CharSet::Ansi,
        ),
        loader_import(
            "windows_GetProcAddress",
            "kernel32",
            "GetProcAddress",
            vec![("handle", TypeRef::int_ptr()), ("symbol", TypeRef::string())],
            TypeRef::int_ptr(),
            PInvokeCallConv::Winapi,
            CharSet::Ansi,
        ),
    ]
}

fn uname_import() -> MethodDef {
    loader_import(
        "libc_uname",
        "libc",
        "uname",
        vec![("buffer", TypeRef::int_ptr())],
        TypeRef::i32(),
        PInvokeCallConv::Cdecl,
        CharSet::Ansi,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helper() -> TypeDef {
        PlatformLoaderBuilder::new(HelperType::new(TypeName::new("", "PInvokeHelpers")), 1)
            .build()
            .unwrap()
    }

    #[test]
    fn declares_all_triads() {
        let def = helper();
        for flavor in UnixFlavor::ALL {
            for member in ["dlopen", "dlclose", "dlsym"] {
                let name = format!("{}{member}", flavor.prefix());
                let m = def.method(&name).unwrap_or_else(|| panic!("missing {name}"));
                let info = m.pinvoke.as_ref().unwrap();
                assert_eq!(info.module, flavor.library());
                assert_eq!(info.entry_point.as_deref(), Some(member));
                assert_eq!(info.calling_convention, PInvokeCallConv::Cdecl);
            }
        }
        for member in ["LoadLibrary", "FreeLibrary", "GetProcAddress"] {
            let m = def.method(&format!("windows_{member}")).unwrap();
            assert_eq!(m.pinvoke.as_ref().unwrap().module, "kernel32");
        }
        assert_eq!(def.method("libc_uname").unwrap().pinvoke.as_ref().unwrap().module, "libc");
    }

    #[test]
    fn managed_members_have_bodies() {
        let def = helper();
        for name in [
            "GetSystemName",
            "GetUnixFlavor",
            "dlopen",
            "dlclose",
            "dlsym",
            "IsUnix",
            ".cctor",
            "LoadLibrary",
            "FreeLibrary",
            "GetProcAddress",
            "StringToAnsiByteArray",
            "StringArrayMarshallingProlog",
            "StringArrayMarshallingPrologUni",
            "StringArrayMarshallingEpilog",
        ] {
            let m = def.method(name).unwrap_or_else(|| panic!("missing {name}"));
            assert!(m.pinvoke.is_none(), "{name} should be managed");
            assert!(m.body.is_some(), "{name} should have a body");
        }
    }

    #[test]
    fn flags_and_fields() {
        let def = helper();
        let is_unix = def.field(IS_UNIX_FIELD).unwrap();
        assert!(is_unix.is_static && is_unix.is_readonly);
        let flavor = def.field(UNIX_FLAVOR_FIELD).unwrap();
        assert!(flavor.is_static && !flavor.is_readonly);
        let cctor = def.method(".cctor").unwrap();
        assert!(cctor.flags.special_name);
        assert!(def.is_abstract && def.is_sealed);
    }

    #[test]
    fn detection_order() {
        let def = helper();
        let body = def.method("GetUnixFlavor").unwrap().body.as_ref().unwrap();
        let names: Vec<&str> = body
            .instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Ldstr(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            names,
            vec!["Linux", "Darwin", "FreeBSD", "NetBSD", PLATFORM_NOT_SUPPORTED]
        );
    }

    #[test]
    fn dispatcher_maps_both_bsds_to_one_triad() {
        let def = helper();
        let body = def.method("dlopen").unwrap().body.as_ref().unwrap();
        let table = body
            .instrs
            .iter()
            .find_map(|i| match i {
                Instr::Switch(labels) => Some(labels.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table[2], table[3]);
        assert_ne!(table[0], table[1]);
    }

    #[test]
    fn dlopen_flags_are_configurable() {
        let def = PlatformLoaderBuilder::new(HelperType::new(TypeName::new("X", "H")), 258)
            .build()
            .unwrap();
        let body = def.method("LoadLibrary").unwrap().body.as_ref().unwrap();
        assert!(body.instrs.contains(&Instr::LdcI4(258)));
    }

    #[test]
    fn system_name_frees_in_finally() {
        let def = helper();
        let body = def.method("GetSystemName").unwrap().body.as_ref().unwrap();
        assert_eq!(body.regions.len(), 1);
        let region = body.regions[0];
        let finally = &body.instrs[region.finally_start..region.finally_end];
        assert!(finally.contains(&Instr::Call(bcl::free_hglobal())));
    }
}
