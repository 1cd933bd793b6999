//! An interpreter for modules, with a scripted native side.
//!
//! Rewritten stubs are ordinary method bodies, so their behaviour can be
//! checked by running them: [`Machine`] loads a module next to a
//! [`NativeWorld`] of fake libraries, and a [`Session`] calls into it.
//! Methods that still carry import metadata are executed the way the
//! runtime would marshal them, which makes before/after comparisons
//! possible.
//!
//! ```rust
//! use nativize_model::builder::{method, param, ModuleBuilder};
//! use nativize_model::TypeRef;
//! use nativize_sim::{i32_arg, Machine, NativeValue, NativeWorld, Platform, Value};
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
//! let world = NativeWorld::builder(Platform::linux())
//!     .library("m", |lib| {
//!         lib.function("Add", |_, args| {
//!             Ok(NativeValue::I32(i32_arg(args, 0)? + i32_arg(args, 1)?))
//!         })
//!     })
//!     .build();
//!
//! let machine = Machine::new(module, world).unwrap();
//! let sum = machine
//!     .session()
//!     .call("Demo.Native", "Add", vec![Value::I32(2), Value::I32(3)])
//!     .unwrap();
//! assert_eq!(sum, Some(Value::I32(5)));
//! ```

pub mod error;
mod interp;
mod intrinsics;
pub mod layout;
pub mod machine;
pub mod memory;
pub mod native;
pub mod value;

pub use error::{Result, SimError};
pub use machine::{Machine, Session};
pub use memory::{BlockKind, HeapStats, NativeHeap};
pub use native::{
    f64_arg, i32_arg, i64_arg, ptr_arg, LoadRecord, NativeCtx, NativeFault, NativeResult,
    NativeWorld, OsFamily, Platform,
};
pub use value::{Address, NativeValue, ObjRef, Object, Value};
