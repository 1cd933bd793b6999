//! Mutable module model and instruction emitter.
//!
//! This crate is what the rewriter consumes: type, method, field and
//! parameter definitions with their native-import and marshalling metadata,
//! plus an emitter for method bodies with labels, pinned locals and
//! try/finally regions.
//!
//! ## Modules
//!
//! - [`types`]: Type references and primitive types
//! - [`module`]: Module, type, method, field and parameter definitions
//! - [`il`]: Instructions, method/field references, method bodies
//! - [`emit`]: Label-based instruction emitter with protected regions
//! - [`builder`]: Programmatic module construction
//! - [`bcl`]: Runtime library members referenced by generated code

pub mod bcl;
pub mod builder;
pub mod emit;
pub mod error;
pub mod il;
pub mod module;
pub mod types;

pub use emit::IlEmitter;
pub use error::ModelError;
pub use il::{CallSite, FieldRef, Instr, Label, MethodBody, MethodRef, UnmanagedCallConv};
pub use module::{
    CharSet, FieldDef, MarshalInfo, MethodDef, MethodFlags, MethodHandle, Module, NativeType,
    PInvokeCallConv, PInvokeInfo, ParamDef, TypeDef, TypeKind, Visibility,
};
pub use types::{PrimitiveType, TypeName, TypeRef};
