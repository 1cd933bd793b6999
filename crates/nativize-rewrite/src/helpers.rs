//! String marshalling helpers added to the helper type.
//!
//! Stubs call these for the conversions that need a loop: narrowing a
//! string to a NUL-terminated byte array, and copying a string array into
//! a block of native strings and freeing it again.

use nativize_model::{bcl, IlEmitter, Instr, MethodDef, MethodRef, TypeRef};

use crate::error::Result;
use crate::loader::{finish_static, HelperType};
use crate::marshal::StringEncoding;

/// References to the string helpers of one helper type.
#[derive(Debug, Clone)]
pub struct StringHelpers {
    helper: HelperType,
}

impl StringHelpers {
    pub fn new(helper: HelperType) -> Self {
        Self { helper }
    }

    /// `uint8[] StringToAnsiByteArray(string)`: low byte of each character
    /// plus a terminating zero; null for a null string.
    pub fn string_to_ansi_byte_array(&self) -> MethodRef {
        self.helper.method(
            "StringToAnsiByteArray",
            vec![TypeRef::string()],
            TypeRef::vector(TypeRef::u8()),
        )
    }

    /// `void StringArrayMarshallingProlog[Uni](string[], IntPtr[])`
    pub fn string_array_prolog(&self, encoding: StringEncoding) -> MethodRef {
        self.helper.method(
            prolog_name(encoding),
            vec![
                TypeRef::vector(TypeRef::string()),
                TypeRef::vector(TypeRef::int_ptr()),
            ],
            TypeRef::void(),
        )
    }

    /// `void StringArrayMarshallingEpilog(IntPtr[])`
    pub fn string_array_epilog(&self) -> MethodRef {
        self.helper.method(
            "StringArrayMarshallingEpilog",
            vec![TypeRef::vector(TypeRef::int_ptr())],
            TypeRef::void(),
        )
    }
}

fn prolog_name(encoding: StringEncoding) -> &'static str {
    match encoding {
        StringEncoding::Ansi => "StringArrayMarshallingProlog",
        StringEncoding::Unicode => "StringArrayMarshallingPrologUni",
    }
}

pub(crate) fn build_string_helpers() -> Result<Vec<MethodDef>> {
    Ok(vec![
        string_to_ansi_byte_array()?,
        string_array_prolog(StringEncoding::Ansi)?,
        string_array_prolog(StringEncoding::Unicode)?,
        string_array_epilog()?,
    ])
}

fn string_to_ansi_byte_array() -> Result<MethodDef> {
    let mut e = IlEmitter::new();
    let len = e.declare_local(TypeRef::i32());
    let bytes = e.declare_local(TypeRef::vector(TypeRef::u8()));
    let i = e.declare_local(TypeRef::i32());
    let have = e.define_label();
    let body = e.define_label();
    let cond = e.define_label();

    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Brtrue(have));
    e.emit(Instr::Ldnull);
    e.emit(Instr::Ret);

    e.mark_label(have);
    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Call(bcl::string_length()));
    e.emit(Instr::Stloc(len));
    e.emit(Instr::Ldloc(len));
    e.emit(Instr::LdcI4(1));
    e.emit(Instr::Add);
    e.emit(Instr::Newarr(TypeRef::u8()));
    e.emit(Instr::Stloc(bytes));
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::Stloc(i));
    e.emit(Instr::Br(cond));

    e.mark_label(body);
    e.emit(Instr::Ldloc(bytes));
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::Call(bcl::string_chars()));
    e.emit(Instr::ConvU1);
    e.emit(Instr::StelemI1);
    emit_increment(&mut e, i);

    e.mark_label(cond);
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::Ldloc(len));
    e.emit(Instr::Blt(body));

    e.emit(Instr::Ldloc(bytes));
    e.emit(Instr::Ldloc(len));
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::StelemI1);
    e.emit(Instr::Ldloc(bytes));
    e.emit(Instr::Ret);

    finish_static(
        "StringToAnsiByteArray",
        vec![("s", TypeRef::string())],
        TypeRef::vector(TypeRef::u8()),
        e,
    )
}

/// Fills `addrs[i]` with a native copy of `strings[i]`; does nothing for a
/// null source array. Null elements stay zero.
fn string_array_prolog(encoding: StringEncoding) -> Result<MethodDef> {
    let convert = match encoding {
        StringEncoding::Ansi => bcl::string_to_hglobal_ansi(),
        StringEncoding::Unicode => bcl::string_to_hglobal_uni(),
    };
    let mut e = IlEmitter::new();
    let i = e.declare_local(TypeRef::i32());
    let done = e.define_label();
    let body = e.define_label();
    let cond = e.define_label();

    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Brfalse(done));
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::Stloc(i));
    e.emit(Instr::Br(cond));

    e.mark_label(body);
    e.emit(Instr::Ldarg(1));
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::LdelemRef);
    e.emit(Instr::Call(convert));
    e.emit(Instr::StelemI);
    emit_increment(&mut e, i);

    e.mark_label(cond);
    emit_index_in_bounds(&mut e, i, body);

    e.mark_label(done);
    e.emit(Instr::Ret);

    finish_static(
        prolog_name(encoding),
        vec![
            ("strings", TypeRef::vector(TypeRef::string())),
            ("addrs", TypeRef::vector(TypeRef::int_ptr())),
        ],
        TypeRef::void(),
        e,
    )
}

/// Frees every non-zero entry of `addrs` and zeroes it.
fn string_array_epilog() -> Result<MethodDef> {
    let mut e = IlEmitter::new();
    let i = e.declare_local(TypeRef::i32());
    let done = e.define_label();
    let body = e.define_label();
    let next = e.define_label();
    let cond = e.define_label();

    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Brfalse(done));
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::Stloc(i));
    e.emit(Instr::Br(cond));

    e.mark_label(body);
    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::LdelemI);
    e.emit(Instr::Brfalse(next));
    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::LdelemI);
    e.emit(Instr::Call(bcl::free_hglobal()));
    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Ldloc(i));
    e.emit(Instr::LdcI4(0));
    e.emit(Instr::ConvI);
    e.emit(Instr::StelemI);
    e.mark_label(next);
    emit_increment(&mut e, i);

    e.mark_label(cond);
    emit_index_in_bounds(&mut e, i, body);

    e.mark_label(done);
    e.emit(Instr::Ret);

    finish_static(
        "StringArrayMarshallingEpilog",
        vec![("addrs", TypeRef::vector(TypeRef::int_ptr()))],
        TypeRef::void(),
        e,
    )
}

fn emit_increment(e: &mut IlEmitter, local: u16) {
    e.emit(Instr::Ldloc(local));
    e.emit(Instr::LdcI4(1));
    e.emit(Instr::Add);
    e.emit(Instr::Stloc(local));
}

/// `if (i < arg0.Length) goto body`
fn emit_index_in_bounds(e: &mut IlEmitter, local: u16, body: nativize_model::Label) {
    e.emit(Instr::Ldloc(local));
    e.emit(Instr::Ldarg(0));
    e.emit(Instr::Ldlen);
    e.emit(Instr::ConvI4);
    e.emit(Instr::Blt(body));
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativize_model::TypeName;

    fn refs() -> StringHelpers {
        HelperType::new(TypeName::new("", "PInvokeHelpers")).strings()
    }

    #[test]
    fn references_match_definitions() {
        let defs = build_string_helpers().unwrap();
        let r = refs();
        for reference in [
            r.string_to_ansi_byte_array(),
            r.string_array_prolog(StringEncoding::Ansi),
            r.string_array_prolog(StringEncoding::Unicode),
            r.string_array_epilog(),
        ] {
            let def = defs
                .iter()
                .find(|d| d.name == reference.name)
                .unwrap_or_else(|| panic!("no definition for {}", reference.name));
            assert_eq!(def.param_types(), reference.params);
            assert_eq!(def.return_type, reference.return_type);
        }
    }

    #[test]
    fn prolog_uses_requested_encoding() {
        let ansi = string_array_prolog(StringEncoding::Ansi).unwrap();
        let uni = string_array_prolog(StringEncoding::Unicode).unwrap();
        let calls = |m: &MethodDef| {
            m.body
                .as_ref()
                .unwrap()
                .instrs
                .iter()
                .filter_map(|i| match i {
                    Instr::Call(r) => Some(r.name.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(calls(&ansi), vec!["StringToHGlobalAnsi"]);
        assert_eq!(calls(&uni), vec!["StringToHGlobalUni"]);
    }

    #[test]
    fn byte_array_loop_uses_signed_compare() {
        let def = string_to_ansi_byte_array().unwrap();
        let body = def.body.unwrap();
        assert!(body.instrs.iter().any(|i| matches!(i, Instr::Blt(_))));
        assert_eq!(body.locals.len(), 3);
    }
}
