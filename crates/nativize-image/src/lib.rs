//! Binary module container format (.nmd).
//!
//! Handles reading and writing module images with content-addressed
//! integrity verification.
//!
//! ## File Layout
//!
//! ```text
//! NMD File Layout:
//! ┌──────────────────────────────┐
//! │ Magic: 0x4E4D4400 ("NMD\0") │  4 bytes
//! │ Version: major.minor.patch   │  3 bytes
//! │ Flags                        │  1 byte
//! ├──────────────────────────────┤
//! │ Header                       │
//! │   type_count: u64            │
//! │   method_count: u64          │
//! │   import_stub_count: u64     │
//! │   payload_length: u64        │
//! ├──────────────────────────────┤
//! │ JSON payload                 │
//! │   (module data)              │
//! ├──────────────────────────────┤
//! │ Content Hash (SHA-256)       │  32 bytes
//! └──────────────────────────────┘
//! ```

mod format;

pub use format::{ImageError, ImageFile, ImageFlags, ImageHeader, ImageVersion};
