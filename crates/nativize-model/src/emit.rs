//! Instruction emitter with labels, locals and protected regions.
//!
//! Errors are collected as instructions are emitted and reported once by
//! [`IlEmitter::finish`], so code generators can emit straight-line without
//! threading a `Result` through every call.
//!
//! # Example
//!
//! ```rust
//! use nativize_model::emit::IlEmitter;
//! use nativize_model::il::Instr;
//! use nativize_model::types::TypeRef;
//!
//! let mut e = IlEmitter::new();
//! let tmp = e.declare_local(TypeRef::i32());
//! let done = e.begin_try();
//! e.emit(Instr::LdcI4(1));
//! e.emit(Instr::Stloc(tmp));
//! e.begin_finally();
//! e.end_try();
//! e.emit(Instr::Ldloc(tmp));
//! e.emit(Instr::Ret);
//! let body = e.finish().unwrap();
//! assert_eq!(body.regions.len(), 1);
//! assert_eq!(body.label_target(done), Some(body.instrs.len() - 2));
//! ```

use crate::error::{ModelError, Result};
use crate::il::{Instr, Label, LocalDef, MethodBody, ProtectedRegion};
use crate::types::TypeRef;

#[derive(Debug)]
struct OpenRegion {
    try_start: usize,
    try_end: Option<usize>,
    finally_start: Option<usize>,
    end: Label,
}

/// Builds a [`MethodBody`] one instruction at a time.
#[derive(Debug, Default)]
pub struct IlEmitter {
    instrs: Vec<Instr>,
    labels: Vec<Option<usize>>,
    /// Stack height recorded by the first branch to each label.
    label_depths: Vec<Option<u16>>,
    locals: Vec<LocalDef>,
    regions: Vec<ProtectedRegion>,
    open: Vec<OpenRegion>,
    depth: u16,
    max_depth: u16,
    reachable: bool,
    errors: Vec<ModelError>,
}

impl IlEmitter {
    pub fn new() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    pub fn define_label(&mut self) -> Label {
        self.labels.push(None);
        self.label_depths.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind a label to the next emitted instruction.
    pub fn mark_label(&mut self, label: Label) {
        let slot = label.0 as usize;
        if self.labels[slot].is_some() {
            self.errors
                .push(ModelError::LabelMarkedTwice { label: label.0 });
            return;
        }
        self.labels[slot] = Some(self.instrs.len());
        if !self.reachable {
            self.depth = self.label_depths[slot].unwrap_or(0);
            self.reachable = true;
        }
    }

    pub fn declare_local(&mut self, ty: TypeRef) -> u16 {
        self.locals.push(LocalDef { ty, pinned: false });
        (self.locals.len() - 1) as u16
    }

    /// A local whose referent is pinned while the local holds it.
    pub fn declare_pinned(&mut self, ty: TypeRef) -> u16 {
        self.locals.push(LocalDef { ty, pinned: true });
        (self.locals.len() - 1) as u16
    }

    pub fn emit(&mut self, instr: Instr) {
        let (pops, pushes) = stack_effect(&instr);
        if pops > self.depth {
            self.errors.push(ModelError::StackUnderflow {
                at: self.instrs.len(),
            });
            self.depth = 0;
        } else {
            self.depth -= pops;
        }
        self.depth += pushes;
        self.max_depth = self.max_depth.max(self.depth);

        for target in instr.targets() {
            let slot = &mut self.label_depths[target.0 as usize];
            if slot.is_none() {
                *slot = Some(self.depth);
            }
        }

        match instr {
            Instr::Br(_) | Instr::Ret | Instr::Throw | Instr::Endfinally => {
                self.reachable = false;
            }
            Instr::Leave(_) => {
                self.depth = 0;
                self.reachable = false;
            }
            _ => {}
        }
        self.instrs.push(instr);
    }

    /// Open a try block. Returns the label that follows the whole region.
    pub fn begin_try(&mut self) -> Label {
        if self.depth != 0 {
            self.errors.push(ModelError::UnbalancedRegion {
                detail: format!("try entered with {} stack items", self.depth),
            });
        }
        let end = self.define_label();
        self.open.push(OpenRegion {
            try_start: self.instrs.len(),
            try_end: None,
            finally_start: None,
            end,
        });
        end
    }

    /// Close the try block with `leave` and open its finally handler.
    pub fn begin_finally(&mut self) {
        let Some(end) = self.open.last().map(|r| r.end) else {
            self.errors.push(ModelError::UnbalancedRegion {
                detail: "finally without try".to_string(),
            });
            return;
        };
        if self.reachable {
            self.emit(Instr::Leave(end));
        }
        let at = self.instrs.len();
        if let Some(region) = self.open.last_mut() {
            if region.finally_start.is_some() {
                self.errors.push(ModelError::UnbalancedRegion {
                    detail: "second finally for one try".to_string(),
                });
                return;
            }
            region.try_end = Some(at);
            region.finally_start = Some(at);
        }
        self.depth = 0;
        self.reachable = true;
    }

    /// Close the finally handler with `endfinally` and mark the end label.
    pub fn end_try(&mut self) {
        let Some(region) = self.open.pop() else {
            self.errors.push(ModelError::UnbalancedRegion {
                detail: "end of region without try".to_string(),
            });
            return;
        };
        let (Some(try_end), Some(finally_start)) = (region.try_end, region.finally_start) else {
            self.errors.push(ModelError::UnbalancedRegion {
                detail: "try closed without finally".to_string(),
            });
            return;
        };
        if self.reachable {
            self.emit(Instr::Endfinally);
        }
        self.regions.push(ProtectedRegion {
            try_start: region.try_start,
            try_end,
            finally_start,
            finally_end: self.instrs.len(),
        });
        self.depth = 0;
        self.mark_label(region.end);
    }

    /// Validate and produce the body.
    pub fn finish(mut self) -> Result<MethodBody> {
        if let Some(region) = self.open.first() {
            self.errors.push(ModelError::UnbalancedRegion {
                detail: format!("try opened at {} never closed", region.try_start),
            });
        }
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        let mut labels = Vec::with_capacity(self.labels.len());
        for (id, target) in self.labels.iter().enumerate() {
            match target {
                Some(at) => labels.push(*at),
                None => return Err(ModelError::UnmarkedLabel { label: id as u32 }),
            }
        }
        Ok(MethodBody {
            locals: self.locals,
            instrs: self.instrs,
            labels,
            regions: self.regions,
            init_locals: true,
            max_stack: self.max_depth.max(1),
        })
    }
}

/// Items popped and pushed by one instruction.
fn stack_effect(instr: &Instr) -> (u16, u16) {
    let returns = |ty: &TypeRef| u16::from(!ty.is_void());
    match instr {
        Instr::Ldarg(_)
        | Instr::Ldloc(_)
        | Instr::LdcI4(_)
        | Instr::LdcI8(_)
        | Instr::Ldnull
        | Instr::Ldstr(_)
        | Instr::Ldsfld(_)
        | Instr::Ldtoken(_) => (0, 1),
        Instr::Stloc(_) | Instr::Stsfld(_) | Instr::Pop => (1, 0),
        Instr::Dup => (1, 2),
        Instr::Add | Instr::Sub | Instr::CgtUn => (2, 1),
        Instr::ConvI
        | Instr::ConvU
        | Instr::ConvI4
        | Instr::ConvU1
        | Instr::Castclass(_)
        | Instr::Ldlen
        | Instr::Newarr(_) => (1, 1),
        Instr::Br(_) | Instr::Leave(_) | Instr::Endfinally | Instr::Ret => (0, 0),
        Instr::Brtrue(_) | Instr::Brfalse(_) | Instr::Switch(_) | Instr::Throw => (1, 0),
        Instr::Blt(_) => (2, 0),
        Instr::Call(m) => (
            m.params.len() as u16 + u16::from(m.has_this),
            returns(&m.return_type),
        ),
        Instr::Calli(site) => (site.params.len() as u16 + 1, returns(&site.return_type)),
        Instr::Newobj(m) => (m.params.len() as u16, 1),
        Instr::LdelemI | Instr::LdelemRef | Instr::Ldelema(_) => (2, 1),
        Instr::StelemI | Instr::StelemI1 => (3, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmarked_label_is_error() {
        let mut e = IlEmitter::new();
        let l = e.define_label();
        e.emit(Instr::Br(l));
        assert_eq!(e.finish(), Err(ModelError::UnmarkedLabel { label: 0 }));
    }

    #[test]
    fn label_marked_twice_is_error() {
        let mut e = IlEmitter::new();
        let l = e.define_label();
        e.mark_label(l);
        e.emit(Instr::Ret);
        e.mark_label(l);
        assert_eq!(e.finish(), Err(ModelError::LabelMarkedTwice { label: 0 }));
    }

    #[test]
    fn unclosed_try_is_error() {
        let mut e = IlEmitter::new();
        e.begin_try();
        e.emit(Instr::Ret);
        assert!(matches!(
            e.finish(),
            Err(ModelError::UnbalancedRegion { .. })
        ));
    }

    #[test]
    fn finally_without_try_is_error() {
        let mut e = IlEmitter::new();
        e.begin_finally();
        assert!(matches!(
            e.finish(),
            Err(ModelError::UnbalancedRegion { .. })
        ));
    }

    #[test]
    fn underflow_detected() {
        let mut e = IlEmitter::new();
        e.emit(Instr::Pop);
        assert_eq!(e.finish(), Err(ModelError::StackUnderflow { at: 0 }));
    }

    #[test]
    fn region_ranges_and_implicit_leave() {
        let mut e = IlEmitter::new();
        let l = e.declare_local(TypeRef::i32());
        let end = e.begin_try();
        e.emit(Instr::LdcI4(5));
        e.emit(Instr::Stloc(l));
        e.begin_finally();
        e.emit(Instr::Ldnull);
        e.emit(Instr::Pop);
        e.end_try();
        e.emit(Instr::Ldloc(l));
        e.emit(Instr::Ret);
        let body = e.finish().unwrap();

        // ldc, stloc, leave | ldnull, pop, endfinally | ldloc, ret
        let region = body.regions[0];
        assert_eq!(region.try_start, 0);
        assert_eq!(region.try_end, 3);
        assert_eq!(region.finally_start, 3);
        assert_eq!(region.finally_end, 6);
        assert_eq!(body.instrs[2], Instr::Leave(end));
        assert_eq!(body.instrs[5], Instr::Endfinally);
        assert_eq!(body.label_target(end), Some(6));
    }

    #[test]
    fn depth_restored_at_branch_target() {
        let mut e = IlEmitter::new();
        let skip = e.define_label();
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Dup);
        e.emit(Instr::Brtrue(skip));
        e.emit(Instr::Pop);
        e.emit(Instr::LdcI4(1));
        e.emit(Instr::Ret);
        e.mark_label(skip);
        e.emit(Instr::Ret);
        let body = e.finish().unwrap();
        assert_eq!(body.max_stack, 2);
    }

    #[test]
    fn call_effects_follow_signature() {
        use crate::il::MethodRef;
        use crate::types::TypeName;

        let concat = MethodRef::new_static(
            TypeName::parse("System.String"),
            "Concat",
            vec![TypeRef::string(), TypeRef::string()],
            TypeRef::string(),
        );
        assert_eq!(stack_effect(&Instr::Call(concat)), (2, 1));
        let exception = TypeName::parse("System.Exception");
        let ctor = MethodRef::constructor(exception, vec![TypeRef::string()]);
        assert_eq!(stack_effect(&Instr::Newobj(ctor)), (1, 1));
    }
}
