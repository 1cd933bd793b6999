//! The simulated native side: libraries, exported functions and the OS
//! loader entry points the generated helper type calls.
//!
//! A [`NativeWorld`] is fixed at construction. Every exported function gets
//! a unique address; `dlsym`/`GetProcAddress` hand those addresses to
//! managed code, and an indirect call through one runs the registered
//! closure with a [`NativeCtx`] for memory access.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::trace;

use crate::error::SimError;
use crate::memory::{BlockKind, NativeHeap};
use crate::value::NativeValue;

const LIBRARY_HANDLE_BASE: u64 = 0x1000;
const FUNCTION_BASE: u64 = 0x7f00_0000_0000;

/// `utsname` record sizes: six 65-byte fields on Linux, five 256-byte
/// fields elsewhere.
const LINUX_UTSNAME_SIZE: usize = 6 * 65;
const BSD_UTSNAME_SIZE: usize = 5 * 256;

/// A failure inside native code.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeFault {
    /// Access outside every live block.
    InvalidAddress(u64),
    /// A structured exception raised by the callee; surfaces as a managed
    /// exception in the caller.
    Raise(String),
    /// Arguments did not match what the function expects.
    Type(String),
}

impl fmt::Display for NativeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeFault::InvalidAddress(addr) => write!(f, "access violation at {addr:#x}"),
            NativeFault::Raise(message) => write!(f, "raised: {message}"),
            NativeFault::Type(message) => write!(f, "bad arguments: {message}"),
        }
    }
}

impl From<SimError> for NativeFault {
    fn from(err: SimError) -> Self {
        match err {
            SimError::InvalidAddress(addr) => NativeFault::InvalidAddress(addr),
            other => NativeFault::Type(other.to_string()),
        }
    }
}

pub type NativeResult = Result<NativeValue, NativeFault>;

/// Body of a native function.
pub type NativeFn = Arc<dyn Fn(&NativeCtx<'_>, &[NativeValue]) -> NativeResult + Send + Sync>;

/// OS family, as seen through the platform newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Unix,
    Windows,
}

/// The simulated operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub family: OsFamily,
    /// What `uname` reports.
    pub sysname: String,
    pub newline: String,
}

impl Platform {
    fn unix(sysname: &str) -> Self {
        Self {
            family: OsFamily::Unix,
            sysname: sysname.to_string(),
            newline: "\n".to_string(),
        }
    }

    pub fn linux() -> Self {
        Self::unix("Linux")
    }

    pub fn darwin() -> Self {
        Self::unix("Darwin")
    }

    pub fn freebsd() -> Self {
        Self::unix("FreeBSD")
    }

    pub fn netbsd() -> Self {
        Self::unix("NetBSD")
    }

    /// A Unix whose `uname` reports `sysname` and which has only `libc`.
    pub fn custom_unix(sysname: &str) -> Self {
        Self::unix(sysname)
    }

    pub fn windows() -> Self {
        Self {
            family: OsFamily::Windows,
            sysname: "Windows_NT".to_string(),
            newline: "\r\n".to_string(),
        }
    }

    /// Library exporting the `dl*` family, if this platform has one.
    pub fn dl_library(&self) -> Option<&'static str> {
        match (self.family, self.sysname.as_str()) {
            (OsFamily::Unix, "Linux") => Some("libdl"),
            (OsFamily::Unix, "Darwin") => Some("libSystem"),
            (OsFamily::Unix, "FreeBSD" | "NetBSD") => Some("libc"),
            _ => None,
        }
    }

    fn utsname_size(&self) -> usize {
        if self.sysname == "Linux" {
            LINUX_UTSNAME_SIZE
        } else {
            BSD_UTSNAME_SIZE
        }
    }
}

/// One `dlopen`/`LoadLibraryW` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRecord {
    pub name: String,
    pub flags: i32,
}

struct Library {
    handle: u64,
    symbols: IndexMap<String, u64>,
}

struct NativeFunction {
    library: String,
    symbol: String,
    body: NativeFn,
    calls: AtomicUsize,
}

/// Libraries and functions of the simulated process.
pub struct NativeWorld {
    platform: Platform,
    libraries: IndexMap<String, Library>,
    functions: HashMap<u64, NativeFunction>,
    load_log: Mutex<Vec<LoadRecord>>,
}

impl fmt::Debug for NativeWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeWorld")
            .field("platform", &self.platform)
            .field("libraries", &self.libraries.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl NativeWorld {
    pub fn builder(platform: Platform) -> NativeWorldBuilder {
        NativeWorldBuilder {
            platform,
            libraries: Vec::new(),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Handle of a library, by exact name.
    pub fn library_handle(&self, name: &str) -> Option<u64> {
        self.libraries.get(name).map(|l| l.handle)
    }

    pub fn has_library(&self, name: &str) -> bool {
        self.libraries.contains_key(name)
    }

    /// Open a library the way the OS loader would, logging the request.
    /// Zero when no library has that name.
    pub fn open(&self, name: &str, flags: i32) -> u64 {
        self.lock_log().push(LoadRecord {
            name: name.to_string(),
            flags,
        });
        let handle = self.library_handle(name).unwrap_or(0);
        trace!("open {name:?} flags={flags} -> {handle:#x}");
        handle
    }

    /// Whether `handle` was returned by [`NativeWorld::open`].
    pub fn is_handle(&self, handle: u64) -> bool {
        self.libraries.values().any(|l| l.handle == handle)
    }

    /// Address of `symbol` in the library with `handle`; zero when absent.
    pub fn symbol(&self, handle: u64, symbol: &str) -> u64 {
        self.libraries
            .values()
            .find(|l| l.handle == handle)
            .and_then(|l| l.symbols.get(symbol).copied())
            .unwrap_or(0)
    }

    /// Address of an export, by library name.
    pub fn function_address(&self, library: &str, symbol: &str) -> Option<u64> {
        self.libraries
            .get(library)
            .and_then(|l| l.symbols.get(symbol).copied())
    }

    /// How many times an export has been called.
    pub fn call_count(&self, library: &str, symbol: &str) -> usize {
        self.function_address(library, symbol)
            .and_then(|addr| self.functions.get(&addr))
            .map(|f| f.calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Every library load request so far, in order.
    pub fn load_log(&self) -> Vec<LoadRecord> {
        self.lock_log().clone()
    }

    /// `library!symbol` of the function at `addr`.
    pub fn describe(&self, addr: u64) -> Option<String> {
        self.functions
            .get(&addr)
            .map(|f| format!("{}!{}", f.library, f.symbol))
    }

    /// Call the function at `addr`.
    pub fn invoke(&self, ctx: &NativeCtx<'_>, addr: u64, args: &[NativeValue]) -> NativeResult {
        let function = self
            .functions
            .get(&addr)
            .ok_or(NativeFault::InvalidAddress(addr))?;
        function.calls.fetch_add(1, Ordering::SeqCst);
        trace!("native call {}!{}", function.library, function.symbol);
        (function.body)(ctx, args)
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, Vec<LoadRecord>> {
        self.load_log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exports of one library under construction.
pub struct LibraryBuilder {
    name: String,
    functions: Vec<(String, NativeFn)>,
}

impl LibraryBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: Vec::new(),
        }
    }

    pub fn function(
        mut self,
        symbol: &str,
        body: impl Fn(&NativeCtx<'_>, &[NativeValue]) -> NativeResult + Send + Sync + 'static,
    ) -> Self {
        self.functions.push((symbol.to_string(), Arc::new(body)));
        self
    }
}

pub struct NativeWorldBuilder {
    platform: Platform,
    libraries: Vec<LibraryBuilder>,
}

impl NativeWorldBuilder {
    /// Add a library. Exports are merged into a platform library of the
    /// same name.
    pub fn library(mut self, name: &str, f: impl FnOnce(LibraryBuilder) -> LibraryBuilder) -> Self {
        self.libraries.push(f(LibraryBuilder::new(name)));
        self
    }

    pub fn build(self) -> NativeWorld {
        let mut world = NativeWorld {
            platform: self.platform.clone(),
            libraries: IndexMap::new(),
            functions: HashMap::new(),
            load_log: Mutex::new(Vec::new()),
        };
        let libraries = system_libraries(&self.platform)
            .into_iter()
            .chain(self.libraries);
        for library in libraries {
            let count = world.libraries.len() as u64;
            let entry = world
                .libraries
                .entry(library.name.clone())
                .or_insert_with(|| Library {
                    handle: LIBRARY_HANDLE_BASE + count * 0x10,
                    symbols: IndexMap::new(),
                });
            for (symbol, body) in library.functions {
                let addr = FUNCTION_BASE + (world.functions.len() as u64) * 0x10;
                entry.symbols.insert(symbol.clone(), addr);
                world.functions.insert(
                    addr,
                    NativeFunction {
                        library: library.name.clone(),
                        symbol,
                        body,
                        calls: AtomicUsize::new(0),
                    },
                );
            }
        }
        world
    }
}

/// What native code sees of the process.
pub struct NativeCtx<'a> {
    heap: &'a NativeHeap,
    world: &'a NativeWorld,
}

impl<'a> NativeCtx<'a> {
    pub fn new(heap: &'a NativeHeap, world: &'a NativeWorld) -> Self {
        Self { heap, world }
    }

    pub fn heap(&self) -> &NativeHeap {
        self.heap
    }

    pub fn world(&self) -> &NativeWorld {
        self.world
    }

    /// NUL-terminated single-byte string, one character per byte.
    pub fn read_cstr(&self, addr: u64) -> Result<String, NativeFault> {
        Ok(self.heap.read_cstr(addr)?.iter().map(|b| char::from(*b)).collect())
    }

    /// NUL-terminated UTF-16 string.
    pub fn read_wstr(&self, addr: u64) -> Result<String, NativeFault> {
        Ok(String::from_utf16_lossy(&self.heap.read_wstr(addr)?))
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, NativeFault> {
        Ok(self.heap.read(addr, len)?)
    }

    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<(), NativeFault> {
        Ok(self.heap.write(addr, bytes)?)
    }

    pub fn read_i32(&self, addr: u64) -> Result<i32, NativeFault> {
        Ok(self.heap.read_i32(addr)?)
    }

    pub fn write_i32(&self, addr: u64, value: i32) -> Result<(), NativeFault> {
        Ok(self.heap.write_i32(addr, value)?)
    }

    pub fn read_ptr(&self, addr: u64) -> Result<u64, NativeFault> {
        Ok(self.heap.read_ptr(addr)?)
    }

    pub fn write_ptr(&self, addr: u64, value: u64) -> Result<(), NativeFault> {
        Ok(self.heap.write_ptr(addr, value)?)
    }

    /// Library-owned single-byte string; never freed.
    pub fn alloc_static_cstr(&self, text: &str) -> u64 {
        let mut bytes: Vec<u8> = text.chars().map(latin1).collect();
        bytes.push(0);
        self.heap.alloc_bytes(&bytes, BlockKind::Static)
    }

    /// Library-owned UTF-16 string; never freed.
    pub fn alloc_static_wstr(&self, text: &str) -> u64 {
        let mut bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        bytes.extend([0, 0]);
        self.heap.alloc_bytes(&bytes, BlockKind::Static)
    }

    /// Call another native function, e.g. a callback pointer.
    pub fn call(&self, addr: u64, args: &[NativeValue]) -> NativeResult {
        self.world.invoke(self, addr, args)
    }
}

/// Character to its single-byte form; `?` above U+00FF.
pub fn latin1(c: char) -> u8 {
    u8::try_from(u32::from(c)).unwrap_or(b'?')
}

pub fn ptr_arg(args: &[NativeValue], index: usize) -> Result<u64, NativeFault> {
    args.get(index)
        .and_then(NativeValue::as_ptr)
        .ok_or_else(|| NativeFault::Type(format!("argument {index} is not a pointer")))
}

pub fn i32_arg(args: &[NativeValue], index: usize) -> Result<i32, NativeFault> {
    args.get(index)
        .and_then(NativeValue::as_i32)
        .ok_or_else(|| NativeFault::Type(format!("argument {index} is not an int32")))
}

pub fn i64_arg(args: &[NativeValue], index: usize) -> Result<i64, NativeFault> {
    args.get(index)
        .and_then(NativeValue::as_i64)
        .ok_or_else(|| NativeFault::Type(format!("argument {index} is not an int64")))
}

pub fn f64_arg(args: &[NativeValue], index: usize) -> Result<f64, NativeFault> {
    args.get(index)
        .and_then(NativeValue::as_f64)
        .ok_or_else(|| NativeFault::Type(format!("argument {index} is not a float")))
}

fn system_libraries(platform: &Platform) -> Vec<LibraryBuilder> {
    match platform.family {
        OsFamily::Windows => vec![LibraryBuilder::new("kernel32")
            .function("LoadLibraryW", |ctx, args| {
                let name = ctx.read_wstr(ptr_arg(args, 0)?)?;
                Ok(NativeValue::Ptr(ctx.world().open(&name, 0)))
            })
            .function("FreeLibrary", |ctx, args| {
                let ok = ctx.world().is_handle(ptr_arg(args, 0)?);
                Ok(NativeValue::I32(i32::from(ok)))
            })
            .function("GetProcAddress", |ctx, args| {
                let symbol = ctx.read_cstr(ptr_arg(args, 1)?)?;
                Ok(NativeValue::Ptr(ctx.world().symbol(ptr_arg(args, 0)?, &symbol)))
            })],
        OsFamily::Unix => {
            let libc = LibraryBuilder::new("libc").function("uname", uname);
            match platform.dl_library() {
                Some("libc") => vec![dl_exports(libc)],
                Some(name) => vec![dl_exports(LibraryBuilder::new(name)), libc],
                None => vec![libc],
            }
        }
    }
}

fn dl_exports(library: LibraryBuilder) -> LibraryBuilder {
    library
        .function("dlopen", |ctx, args| {
            let name = ctx.read_cstr(ptr_arg(args, 0)?)?;
            Ok(NativeValue::Ptr(ctx.world().open(&name, i32_arg(args, 1)?)))
        })
        .function("dlclose", |ctx, args| {
            let known = ctx.world().is_handle(ptr_arg(args, 0)?);
            Ok(NativeValue::I32(if known { 0 } else { -1 }))
        })
        .function("dlsym", |ctx, args| {
            let symbol = ctx.read_cstr(ptr_arg(args, 1)?)?;
            Ok(NativeValue::Ptr(ctx.world().symbol(ptr_arg(args, 0)?, &symbol)))
        })
}

/// Writes a whole `utsname` record; faults when the buffer is smaller.
fn uname(ctx: &NativeCtx<'_>, args: &[NativeValue]) -> NativeResult {
    let buffer = ptr_arg(args, 0)?;
    let platform = ctx.world().platform();
    let mut record = vec![0u8; platform.utsname_size()];
    for (slot, c) in record.iter_mut().zip(platform.sysname.chars()) {
        *slot = latin1(c);
    }
    ctx.write_bytes(buffer, &record)?;
    Ok(NativeValue::I32(0))
}
