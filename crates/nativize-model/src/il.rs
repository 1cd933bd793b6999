//! Instruction representation.
//!
//! Bodies are sequences of [`Instr`] with symbolic [`Label`] branch targets.
//! Labels resolve to instruction indices through [`MethodBody::labels`];
//! operand encoding is left to whatever serializes the module.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{TypeName, TypeRef};

/// Branch target, resolved through [`MethodBody::labels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Reference to a method, as used by `call` and `newobj`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub owner: TypeName,
    pub name: String,
    pub params: Vec<TypeRef>,
    pub return_type: TypeRef,
    /// Instance method (constructors included).
    #[serde(default)]
    pub has_this: bool,
}

impl MethodRef {
    pub fn new_static(owner: TypeName, name: &str, params: Vec<TypeRef>, ret: TypeRef) -> Self {
        Self {
            owner,
            name: name.to_string(),
            params,
            return_type: ret,
            has_this: false,
        }
    }

    pub fn constructor(owner: TypeName, params: Vec<TypeRef>) -> Self {
        Self {
            owner,
            name: ".ctor".to_string(),
            params,
            return_type: TypeRef::void(),
            has_this: true,
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(
            f,
            "{}{} {}::{}({})",
            if self.has_this { "instance " } else { "" },
            self.return_type,
            self.owner,
            self.name,
            params.join(", ")
        )
    }
}

/// Reference to a static field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub owner: TypeName,
    pub name: String,
    pub ty: TypeRef,
}

impl FieldRef {
    pub fn new(owner: TypeName, name: &str, ty: TypeRef) -> Self {
        Self {
            owner,
            name: name.to_string(),
            ty,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}::{}", self.ty, self.owner, self.name)
    }
}

/// Calling convention of an indirect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmanagedCallConv {
    C,
    StdCall,
    ThisCall,
    FastCall,
}

impl fmt::Display for UnmanagedCallConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnmanagedCallConv::C => "unmanaged cdecl",
            UnmanagedCallConv::StdCall => "unmanaged stdcall",
            UnmanagedCallConv::ThisCall => "unmanaged thiscall",
            UnmanagedCallConv::FastCall => "unmanaged fastcall",
        };
        f.write_str(text)
    }
}

/// Signature of an indirect call target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    pub convention: UnmanagedCallConv,
    pub return_type: TypeRef,
    pub params: Vec<TypeRef>,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(
            f,
            "{} {}({})",
            self.convention,
            self.return_type,
            params.join(", ")
        )
    }
}

/// The instruction subset the rewriter emits and the simulator executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Instr {
    Ldarg(u16),
    Ldloc(u16),
    Stloc(u16),
    LdcI4(i32),
    LdcI8(i64),
    Ldnull,
    Ldstr(String),
    Ldsfld(FieldRef),
    Stsfld(FieldRef),
    Dup,
    Pop,
    Add,
    Sub,
    /// Unsigned greater-than; pushes 1 or 0.
    CgtUn,
    ConvI,
    ConvU,
    ConvI4,
    ConvU1,
    Br(Label),
    Brtrue(Label),
    Brfalse(Label),
    /// Signed less-than branch.
    Blt(Label),
    /// Jump table on a zero-based int32; falls through when out of range.
    Switch(Vec<Label>),
    /// Exit a protected region, running enclosing finally blocks.
    Leave(Label),
    Endfinally,
    Call(MethodRef),
    Calli(CallSite),
    Newobj(MethodRef),
    Newarr(TypeRef),
    Ldlen,
    LdelemI,
    LdelemRef,
    StelemI,
    StelemI1,
    Ldelema(TypeRef),
    Ldtoken(TypeRef),
    Castclass(TypeRef),
    Throw,
    Ret,
}

impl Instr {
    /// Labels this instruction can transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Instr::Br(l)
            | Instr::Brtrue(l)
            | Instr::Brfalse(l)
            | Instr::Blt(l)
            | Instr::Leave(l) => vec![*l],
            Instr::Switch(ls) => ls.clone(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Ldarg(i) => write!(f, "ldarg {i}"),
            Instr::Ldloc(i) => write!(f, "ldloc {i}"),
            Instr::Stloc(i) => write!(f, "stloc {i}"),
            Instr::LdcI4(v) => write!(f, "ldc.i4 {v}"),
            Instr::LdcI8(v) => write!(f, "ldc.i8 {v}"),
            Instr::Ldnull => f.write_str("ldnull"),
            Instr::Ldstr(s) => write!(f, "ldstr {s:?}"),
            Instr::Ldsfld(field) => write!(f, "ldsfld {field}"),
            Instr::Stsfld(field) => write!(f, "stsfld {field}"),
            Instr::Dup => f.write_str("dup"),
            Instr::Pop => f.write_str("pop"),
            Instr::Add => f.write_str("add"),
            Instr::Sub => f.write_str("sub"),
            Instr::CgtUn => f.write_str("cgt.un"),
            Instr::ConvI => f.write_str("conv.i"),
            Instr::ConvU => f.write_str("conv.u"),
            Instr::ConvI4 => f.write_str("conv.i4"),
            Instr::ConvU1 => f.write_str("conv.u1"),
            Instr::Br(l) => write!(f, "br {l}"),
            Instr::Brtrue(l) => write!(f, "brtrue {l}"),
            Instr::Brfalse(l) => write!(f, "brfalse {l}"),
            Instr::Blt(l) => write!(f, "blt {l}"),
            Instr::Switch(ls) => {
                let names: Vec<String> = ls.iter().map(|l| l.to_string()).collect();
                write!(f, "switch ({})", names.join(", "))
            }
            Instr::Leave(l) => write!(f, "leave {l}"),
            Instr::Endfinally => f.write_str("endfinally"),
            Instr::Call(m) => write!(f, "call {m}"),
            Instr::Calli(site) => write!(f, "calli {site}"),
            Instr::Newobj(m) => write!(f, "newobj {m}"),
            Instr::Newarr(t) => write!(f, "newarr {t}"),
            Instr::Ldlen => f.write_str("ldlen"),
            Instr::LdelemI => f.write_str("ldelem.i"),
            Instr::LdelemRef => f.write_str("ldelem.ref"),
            Instr::StelemI => f.write_str("stelem.i"),
            Instr::StelemI1 => f.write_str("stelem.i1"),
            Instr::Ldelema(t) => write!(f, "ldelema {t}"),
            Instr::Ldtoken(t) => write!(f, "ldtoken {t}"),
            Instr::Castclass(t) => write!(f, "castclass {t}"),
            Instr::Throw => f.write_str("throw"),
            Instr::Ret => f.write_str("ret"),
        }
    }
}

/// A local variable slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDef {
    pub ty: TypeRef,
    /// The referenced object does not move while the local holds it.
    #[serde(default)]
    pub pinned: bool,
}

/// A try/finally pair, as half-open instruction index ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRegion {
    pub try_start: usize,
    pub try_end: usize,
    pub finally_start: usize,
    pub finally_end: usize,
}

impl ProtectedRegion {
    pub fn try_contains(&self, pc: usize) -> bool {
        (self.try_start..self.try_end).contains(&pc)
    }

    pub fn finally_contains(&self, pc: usize) -> bool {
        (self.finally_start..self.finally_end).contains(&pc)
    }
}

/// A finished method body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub locals: Vec<LocalDef>,
    pub instrs: Vec<Instr>,
    /// Instruction index of each label, indexed by label id.
    pub labels: Vec<usize>,
    /// Innermost regions first.
    #[serde(default)]
    pub regions: Vec<ProtectedRegion>,
    #[serde(default = "default_init_locals")]
    pub init_locals: bool,
    pub max_stack: u16,
}

fn default_init_locals() -> bool {
    true
}

impl MethodBody {
    pub fn label_target(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied()
    }

    /// Listing with `IL_nnnn:` offsets and label markers, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (i, instr) in self.instrs.iter().enumerate() {
            for (id, _) in self.labels.iter().enumerate().filter(|(_, at)| **at == i) {
                out.push_str(&format!("L{id}:\n"));
            }
            for region in &self.regions {
                if region.try_start == i {
                    out.push_str(".try {\n");
                }
                if region.finally_start == i {
                    out.push_str("} finally {\n");
                }
            }
            out.push_str(&format!("  IL_{i:04}: {instr}\n"));
            for region in &self.regions {
                if region.finally_end == i + 1 {
                    out.push_str("}\n");
                }
            }
        }
        for (id, _) in self
            .labels
            .iter()
            .enumerate()
            .filter(|(_, at)| **at == self.instrs.len())
        {
            out.push_str(&format!("L{id}:\n"));
        }
        out
    }

    /// Mnemonics only, without operands or labels.
    pub fn opcodes(&self) -> Vec<String> {
        self.instrs
            .iter()
            .map(|i| {
                let text = i.to_string();
                text.split(' ').next().unwrap_or_default().to_string()
            })
            .collect()
    }
}
