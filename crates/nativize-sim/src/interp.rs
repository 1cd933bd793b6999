//! Instruction execution.
//!
//! Control leaves a protected region three ways: `leave` runs the finally
//! blocks of every region it exits, innermost first; an exception runs the
//! finally blocks of every region enclosing the faulting instruction and
//! propagates to the caller; `ret` is only valid outside regions.
//!
//! `conv.i` on a managed pointer or a string pins it: the object's data is
//! copied into a native block that is refreshed before every native call,
//! copied back after it, and freed when the top-level call returns.

use std::sync::Arc;

use log::trace;

use nativize_model::il::ProtectedRegion;
use nativize_model::{
    bcl, CharSet, Instr, MethodBody, MethodDef, MethodRef, PrimitiveType, TypeRef,
};

use crate::error::{Result, SimError};
use crate::intrinsics;
use crate::layout;
use crate::machine::{Machine, Session};
use crate::memory::BlockKind;
use crate::native::{latin1, NativeCtx, NativeFault};
use crate::value::{Address, NativeValue, ObjRef, Object, Value};

/// Byte offset of the first character in a pinned string block.
pub(crate) const STRING_DATA_OFFSET: i32 = 8;

pub(crate) const NULL_REFERENCE: &str = "System.NullReferenceException";
pub(crate) const INDEX_OUT_OF_RANGE: &str = "System.IndexOutOfRangeException";
const INVALID_CAST: &str = "System.InvalidCastException";
const OVERFLOW: &str = "System.OverflowException";
const DLL_NOT_FOUND: &str = "System.DllNotFoundException";
const ENTRY_POINT_NOT_FOUND: &str = "System.EntryPointNotFoundException";
const SEH: &str = "System.Runtime.InteropServices.SEHException";

/// Why execution stopped unwinding normally.
#[derive(Debug)]
pub(crate) enum Trap {
    /// A managed exception object in flight.
    Exception(ObjRef),
    Fatal(SimError),
}

impl From<SimError> for Trap {
    fn from(err: SimError) -> Self {
        Trap::Fatal(err)
    }
}

pub(crate) type Exec<T> = std::result::Result<T, Trap>;

enum Exit {
    Return(Option<Value>),
    EndFinally,
}

enum Flow {
    Next,
    Jump(usize),
    Leave(usize),
    Exit(Exit),
}

#[derive(Debug, Clone, PartialEq)]
enum PinSource {
    /// Array elements from `start` to the end.
    Elements { array: ObjRef, start: usize },
    Boxed(ObjRef),
    /// Header bytes, UTF-16 characters and a terminator.
    Str(ObjRef),
}

#[derive(Debug)]
pub(crate) struct Pin {
    block: u64,
    source: PinSource,
}

struct Frame<'m> {
    name: String,
    method: &'m MethodDef,
    body: &'m MethodBody,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    pc: usize,
}

impl Frame<'_> {
    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| SimError::StackUnderflow {
            method: self.name.clone(),
            pc: self.pc,
        })
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if self.stack.len() < n {
            return Err(SimError::StackUnderflow {
                method: self.name.clone(),
                pc: self.pc,
            });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn mismatch(&self, expected: &'static str, found: &Value) -> SimError {
        SimError::TypeMismatch {
            method: self.name.clone(),
            pc: self.pc,
            expected,
            found: found.kind().to_string(),
        }
    }

    fn pop_i32(&mut self) -> Result<i32> {
        let value = self.pop()?;
        value.as_i32().ok_or_else(|| self.mismatch("int32", &value))
    }

    fn target(&self, label: nativize_model::Label) -> Result<usize> {
        self.body
            .label_target(label)
            .ok_or_else(|| SimError::BadLabel(self.name.clone()))
    }
}

impl Session {
    /// Run a method of the module by handle.
    pub(crate) fn invoke_def(
        &mut self,
        handle: (usize, usize),
        args: Vec<Value>,
    ) -> Exec<Option<Value>> {
        let machine = Arc::clone(&self.machine);
        let def = &machine.module.types[handle.0];
        let method = &def.methods[handle.1];
        let name = format!("{}::{}", def.name, method.name);

        if method.pinvoke.is_some() {
            return self.declarative_call(&machine, &name, method, args);
        }
        let body = method
            .body
            .as_ref()
            .ok_or_else(|| SimError::MissingBody(name.clone()))?;
        trace!("enter {name}");

        let locals = body
            .locals
            .iter()
            .map(|l| layout::default_value(&machine.module, &l.ty))
            .collect();
        let mut frame = Frame {
            name,
            method,
            body,
            args,
            locals,
            stack: Vec::new(),
            pc: 0,
        };
        match self.run(&mut frame, 0)? {
            Exit::Return(value) => Ok(value),
            Exit::EndFinally => Err(SimError::Unsupported(format!(
                "endfinally outside a finally block in {}",
                frame.name
            ))
            .into()),
        }
    }

    /// Call through a method reference: module methods first, then the
    /// runtime library.
    pub(crate) fn call_method(
        &mut self,
        target: &MethodRef,
        args: Vec<Value>,
    ) -> Exec<Option<Value>> {
        match self.resolve(&target.owner, &target.name, &target.params) {
            Some(handle) => self.invoke_def(handle, args),
            None => intrinsics::call(self, target, args),
        }
    }

    fn run(&mut self, frame: &mut Frame<'_>, start: usize) -> Exec<Exit> {
        let body = frame.body;
        let mut pc = start;
        loop {
            let instr = body.instrs.get(pc).ok_or_else(|| {
                SimError::Unsupported(format!("fell off the end of {}", frame.name))
            })?;
            frame.pc = pc;
            match self.step(frame, instr) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Leave(target)) => {
                    frame.stack.clear();
                    let exited: Vec<ProtectedRegion> = body
                        .regions
                        .iter()
                        .filter(|r| r.try_contains(pc) && !r.try_contains(target))
                        .copied()
                        .collect();
                    for region in exited {
                        self.run_finally(frame, region)?;
                    }
                    pc = target;
                }
                Ok(Flow::Exit(exit)) => return Ok(exit),
                Err(Trap::Exception(obj)) => {
                    let enclosing: Vec<ProtectedRegion> = body
                        .regions
                        .iter()
                        .filter(|r| r.try_contains(pc))
                        .copied()
                        .collect();
                    for region in enclosing {
                        self.run_finally(frame, region)?;
                    }
                    return Err(Trap::Exception(obj));
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    fn run_finally(&mut self, frame: &mut Frame<'_>, region: ProtectedRegion) -> Exec<()> {
        let saved = std::mem::take(&mut frame.stack);
        let exit = self.run(frame, region.finally_start)?;
        frame.stack = saved;
        match exit {
            Exit::EndFinally => Ok(()),
            Exit::Return(_) => Err(SimError::Unsupported(format!(
                "ret inside a finally block of {}",
                frame.name
            ))
            .into()),
        }
    }

    fn step(&mut self, frame: &mut Frame<'_>, instr: &Instr) -> Exec<Flow> {
        match instr {
            Instr::Ldarg(i) => {
                let value = frame
                    .args
                    .get(*i as usize)
                    .cloned()
                    .ok_or_else(|| {
                        SimError::Unsupported(format!("no argument {i} in {}", frame.name))
                    })?;
                frame.stack.push(value);
            }
            Instr::Ldloc(i) => {
                let value = frame
                    .locals
                    .get(*i as usize)
                    .cloned()
                    .ok_or_else(|| {
                        SimError::Unsupported(format!("no local {i} in {}", frame.name))
                    })?;
                frame.stack.push(value);
            }
            Instr::Stloc(i) => {
                let value = frame.pop()?;
                let slot = frame
                    .locals
                    .get_mut(*i as usize)
                    .ok_or_else(|| SimError::Unsupported(format!("no local {i}")))?;
                *slot = value;
            }
            Instr::LdcI4(v) => frame.stack.push(Value::I32(*v)),
            Instr::LdcI8(v) => frame.stack.push(Value::I64(*v)),
            Instr::Ldnull => frame.stack.push(Value::Null),
            Instr::Ldstr(text) => {
                let value = self.string(text);
                frame.stack.push(value);
            }
            Instr::Ldsfld(field) => frame.stack.push(self.machine.load_static(field)?),
            Instr::Stsfld(field) => {
                let value = frame.pop()?;
                self.machine.store_static(field, &value)?;
            }
            Instr::Dup => {
                let value = frame.pop()?;
                frame.stack.push(value.clone());
                frame.stack.push(value);
            }
            Instr::Pop => {
                frame.pop()?;
            }
            Instr::Add | Instr::Sub => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                let result = arithmetic(instr, &lhs, &rhs)
                    .ok_or_else(|| frame.mismatch("numeric operands", &rhs))?;
                frame.stack.push(result);
            }
            Instr::CgtUn => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                let (a, b) = match (unsigned(&lhs), unsigned(&rhs)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(frame.mismatch("comparable operands", &lhs).into()),
                };
                frame.stack.push(Value::I32(i32::from(a > b)));
            }
            Instr::ConvI => {
                let value = frame.pop()?;
                let converted = match value {
                    Value::I32(v) => Value::Ptr(i64::from(v) as u64),
                    Value::I64(v) => Value::Ptr(v as u64),
                    Value::Ptr(v) => Value::Ptr(v),
                    Value::Null => Value::Ptr(0),
                    Value::Addr(address) => Value::Ptr(self.pin_address(address)?),
                    Value::Ref(obj) => Value::Ptr(self.pin_string(obj)?),
                    other => {
                        return Err(frame.mismatch("integer or pinnable reference", &other).into())
                    }
                };
                frame.stack.push(converted);
            }
            Instr::ConvU => {
                let value = frame.pop()?;
                let converted = match value {
                    Value::I32(v) => Value::Ptr(u64::from(v as u32)),
                    Value::I64(v) => Value::Ptr(v as u64),
                    Value::Ptr(v) => Value::Ptr(v),
                    other => return Err(frame.mismatch("integer", &other).into()),
                };
                frame.stack.push(converted);
            }
            Instr::ConvI4 => {
                let value = frame.pop()?;
                let converted = match value {
                    Value::I32(v) => v,
                    Value::I64(v) => v as i32,
                    Value::Ptr(v) => v as i32,
                    other => return Err(frame.mismatch("integer", &other).into()),
                };
                frame.stack.push(Value::I32(converted));
            }
            Instr::ConvU1 => {
                let value = frame.pop()?;
                let converted = match value {
                    Value::I32(v) => v & 0xFF,
                    Value::I64(v) => (v & 0xFF) as i32,
                    Value::Ptr(v) => (v & 0xFF) as i32,
                    other => return Err(frame.mismatch("integer", &other).into()),
                };
                frame.stack.push(Value::I32(converted));
            }
            Instr::Br(label) => return Ok(Flow::Jump(frame.target(*label)?)),
            Instr::Brtrue(label) | Instr::Brfalse(label) => {
                let value = frame.pop()?;
                if value.is_true() == matches!(instr, Instr::Brtrue(_)) {
                    return Ok(Flow::Jump(frame.target(*label)?));
                }
            }
            Instr::Blt(label) => {
                let rhs = frame.pop()?;
                let lhs = frame.pop()?;
                let less = match (&lhs, &rhs) {
                    (Value::I32(a), Value::I32(b)) => a < b,
                    (Value::I64(a), Value::I64(b)) => a < b,
                    _ => return Err(frame.mismatch("int32 operands", &lhs).into()),
                };
                if less {
                    return Ok(Flow::Jump(frame.target(*label)?));
                }
            }
            Instr::Switch(labels) => {
                let index = frame.pop_i32()?;
                if let Some(label) = usize::try_from(index).ok().and_then(|i| labels.get(i)) {
                    return Ok(Flow::Jump(frame.target(*label)?));
                }
            }
            Instr::Leave(label) => return Ok(Flow::Leave(frame.target(*label)?)),
            Instr::Endfinally => return Ok(Flow::Exit(Exit::EndFinally)),
            Instr::Call(target) => {
                let count = target.params.len() + usize::from(target.has_this);
                let args = frame.pop_n(count)?;
                if let Some(value) = self.call_method(target, args)? {
                    frame.stack.push(value);
                }
            }
            Instr::Calli(site) => {
                let fn_ptr = frame.pop()?;
                let addr = fn_ptr
                    .as_ptr()
                    .ok_or_else(|| frame.mismatch("function pointer", &fn_ptr))?;
                let args = frame.pop_n(site.params.len())?;
                let result = self.indirect_call(addr, &site.params, &site.return_type, args)?;
                if let Some(value) = result {
                    frame.stack.push(value);
                }
            }
            Instr::Newobj(ctor) => {
                let args = frame.pop_n(ctor.params.len())?;
                let value = intrinsics::construct(self, ctor, args)?;
                frame.stack.push(value);
            }
            Instr::Newarr(element) => {
                let count = frame.pop_i32()?;
                let Ok(len) = usize::try_from(count) else {
                    return Err(
                        self.raise(OVERFLOW, "Arithmetic operation resulted in an overflow.")
                    );
                };
                let items = vec![layout::default_value(&self.machine.module, element); len];
                let value = self.array(element.clone(), items);
                frame.stack.push(value);
            }
            Instr::Ldlen => {
                let array = frame.pop()?;
                let len = self.array_ref(&array)?.1.len();
                frame.stack.push(Value::Ptr(len as u64));
            }
            Instr::LdelemI | Instr::LdelemRef => {
                let index = frame.pop_i32()?;
                let array = frame.pop()?;
                let (_, items) = self.array_ref(&array)?;
                let item = usize::try_from(index).ok().and_then(|i| items.get(i)).cloned();
                match item {
                    Some(value) => frame.stack.push(value),
                    None => return Err(self.index_out_of_range()),
                }
            }
            Instr::StelemI | Instr::StelemI1 => {
                let value = frame.pop()?;
                let index = frame.pop_i32()?;
                let array = frame.pop()?;
                let stored = if matches!(instr, Instr::StelemI1) {
                    let v = value.as_i32().ok_or_else(|| frame.mismatch("int32", &value))?;
                    Value::I32(v & 0xFF)
                } else {
                    Value::Ptr(value.as_ptr().ok_or_else(|| frame.mismatch("native int", &value))?)
                };
                let (obj, items) = self.array_ref(&array)?;
                let Some(index) = usize::try_from(index).ok().filter(|i| *i < items.len()) else {
                    return Err(self.index_out_of_range());
                };
                if let Object::Array { items, .. } = self.object_mut(obj)? {
                    items[index] = stored;
                }
            }
            Instr::Ldelema(_) => {
                let index = frame.pop_i32()?;
                let array = frame.pop()?;
                let (obj, items) = self.array_ref(&array)?;
                match usize::try_from(index).ok().filter(|i| *i < items.len()) {
                    Some(index) => frame
                        .stack
                        .push(Value::Addr(Address::Element { array: obj, index })),
                    None => return Err(self.index_out_of_range()),
                }
            }
            Instr::Ldtoken(ty) => {
                let token = self.alloc(Object::Type(ty.clone()));
                frame.stack.push(Value::Ref(token));
            }
            Instr::Castclass(ty) => {
                let value = frame.pop()?;
                if let Value::Ref(obj) = &value {
                    if let Object::Delegate { ty: actual, .. } = self.object(*obj)? {
                        if actual != ty {
                            let message = format!(
                                "Unable to cast object of type '{actual}' to type '{ty}'."
                            );
                            return Err(self.raise(INVALID_CAST, message));
                        }
                    }
                }
                frame.stack.push(value);
            }
            Instr::Throw => {
                let value = frame.pop()?;
                return match value {
                    Value::Ref(obj) => Err(Trap::Exception(obj)),
                    _ => Err(self.null_reference()),
                };
            }
            Instr::Ret => {
                let value = if frame.method.return_type.is_void() {
                    None
                } else {
                    Some(frame.pop()?)
                };
                return Ok(Flow::Exit(Exit::Return(value)));
            }
        }
        Ok(Flow::Next)
    }

    /// Allocate an exception object of `class` and start throwing it.
    pub(crate) fn raise(&mut self, class: &str, message: impl Into<String>) -> Trap {
        let obj = self.alloc(Object::Exception {
            class: class.to_string(),
            message: message.into(),
        });
        Trap::Exception(obj)
    }

    pub(crate) fn null_reference(&mut self) -> Trap {
        self.raise(NULL_REFERENCE, "Object reference not set to an instance of an object.")
    }

    fn index_out_of_range(&mut self) -> Trap {
        self.raise(INDEX_OUT_OF_RANGE, "Index was outside the bounds of the array.")
    }

    /// The array behind `value` and a copy of its items.
    fn array_ref(&mut self, value: &Value) -> Exec<(ObjRef, Vec<Value>)> {
        match value {
            Value::Ref(obj) => match self.object(*obj)? {
                Object::Array { items, .. } => Ok((*obj, items.clone())),
                other => {
                    Err(SimError::Unsupported(format!("{} is not an array", other.class_name()))
                        .into())
                }
            },
            Value::Null => Err(self.null_reference()),
            other => Err(SimError::Unsupported(format!("{} is not an array", other.kind())).into()),
        }
    }

    pub(crate) fn string_units(&mut self, value: &Value) -> Exec<Vec<u16>> {
        match value {
            Value::Ref(obj) => match self.object(*obj)? {
                Object::Str(units) => Ok(units.clone()),
                other => {
                    Err(SimError::Unsupported(format!("{} is not a string", other.class_name()))
                        .into())
                }
            },
            Value::Null => Err(self.null_reference()),
            other => Err(SimError::Unsupported(format!("{} is not a string", other.kind())).into()),
        }
    }

    // --- pinning ---------------------------------------------------------

    fn pin_address(&mut self, address: Address) -> Exec<u64> {
        let source = match address {
            Address::Element { array, index } => PinSource::Elements { array, start: index },
            Address::Boxed(obj) => PinSource::Boxed(obj),
        };
        self.pin(source)
    }

    fn pin_string(&mut self, obj: ObjRef) -> Exec<u64> {
        match self.object(obj)? {
            Object::Str(_) => self.pin(PinSource::Str(obj)),
            other => Err(SimError::Unsupported(format!(
                "cannot take the address of {}",
                other.class_name()
            ))
            .into()),
        }
    }

    fn pin(&mut self, source: PinSource) -> Exec<u64> {
        if let Some(pin) = self.pins.iter().find(|p| p.source == source) {
            return Ok(pin.block);
        }
        let bytes = self.pinned_bytes(&source)?;
        let block = self.machine.heap.alloc_bytes(&bytes, BlockKind::Pinned);
        self.pins.push(Pin { block, source });
        Ok(block)
    }

    fn pinned_bytes(&self, source: &PinSource) -> Result<Vec<u8>> {
        let module = &self.machine.module;
        match source {
            PinSource::Elements { array, start } => match self.object(*array)? {
                Object::Array { element, items } => {
                    let mut bytes = Vec::new();
                    for item in items.iter().skip(*start) {
                        bytes.extend(layout::encode(module, element, item)?);
                    }
                    Ok(bytes)
                }
                other => Err(SimError::Unsupported(format!("cannot pin {}", other.class_name()))),
            },
            PinSource::Boxed(obj) => match self.object(*obj)? {
                Object::Boxed { ty, value } => layout::encode(module, ty, value),
                other => Err(SimError::Unsupported(format!("cannot pin {}", other.class_name()))),
            },
            PinSource::Str(obj) => match self.object(*obj)? {
                Object::Str(units) => {
                    let mut bytes = vec![0u8; STRING_DATA_OFFSET as usize];
                    bytes[..4].copy_from_slice(&(units.len() as u32).to_le_bytes());
                    bytes.extend(units.iter().flat_map(|u| u.to_le_bytes()));
                    bytes.extend([0, 0]);
                    Ok(bytes)
                }
                other => Err(SimError::Unsupported(format!("cannot pin {}", other.class_name()))),
            },
        }
    }

    fn sync_pins_out(&self) -> Result<()> {
        for pin in &self.pins {
            let bytes = self.pinned_bytes(&pin.source)?;
            self.machine.heap.write(pin.block, &bytes)?;
        }
        Ok(())
    }

    /// Copy native writes back into pinned arrays and boxes.
    fn sync_pins_in(&mut self) -> Result<()> {
        let machine = Arc::clone(&self.machine);
        let module = &machine.module;
        for index in 0..self.pins.len() {
            let (block, source) = (self.pins[index].block, self.pins[index].source.clone());
            match source {
                PinSource::Elements { array, start } => {
                    if let Object::Array { element, items } = self.object_mut(array)? {
                        let size = layout::size_of(module, element)?;
                        let data = machine.heap.read(block, size * (items.len() - start))?;
                        let chunks = data.chunks_exact(size);
                        for (item, chunk) in items.iter_mut().skip(start).zip(chunks) {
                            *item = layout::decode(module, element, chunk)?;
                        }
                    }
                }
                PinSource::Boxed(obj) => {
                    if let Object::Boxed { ty, value } = self.object_mut(obj)? {
                        let data = machine.heap.read(block, layout::size_of(module, ty)?)?;
                        *value = layout::decode(module, ty, &data)?;
                    }
                }
                PinSource::Str(_) => {}
            }
        }
        Ok(())
    }

    /// Free every pinned block; called when a top-level call returns.
    pub(crate) fn release_pins(&mut self) -> Result<()> {
        for pin in std::mem::take(&mut self.pins) {
            self.machine.heap.free(pin.block)?;
        }
        Ok(())
    }

    // --- native calls ----------------------------------------------------

    /// `calli` to native code at `addr`.
    fn indirect_call(
        &mut self,
        addr: u64,
        params: &[TypeRef],
        ret: &TypeRef,
        args: Vec<Value>,
    ) -> Exec<Option<Value>> {
        let machine = Arc::clone(&self.machine);
        let native_args = params
            .iter()
            .zip(&args)
            .map(|(ty, value)| layout::to_native(&machine.module, ty, value))
            .collect::<Result<Vec<_>>>()?;
        self.sync_pins_out()?;
        let ctx = NativeCtx::new(&machine.heap, &machine.world);
        let outcome = machine.world.invoke(&ctx, addr, &native_args);
        self.sync_pins_in()?;
        let value = self.native_outcome(outcome)?;
        Ok(layout::from_native(&machine.module, ret, &value)?)
    }

    fn native_outcome(
        &mut self,
        outcome: std::result::Result<NativeValue, NativeFault>,
    ) -> Exec<NativeValue> {
        match outcome {
            Ok(value) => Ok(value),
            Err(NativeFault::Raise(message)) => Err(self.raise(SEH, message)),
            Err(NativeFault::InvalidAddress(addr)) => Err(SimError::InvalidAddress(addr).into()),
            Err(NativeFault::Type(message)) => Err(SimError::Native(message).into()),
        }
    }

    /// Runtime-provided marshalling for a method that still carries import
    /// metadata: strings become temporary native copies, booleans 4-byte
    /// integers, everything else crosses as is.
    fn declarative_call(
        &mut self,
        machine: &Machine,
        name: &str,
        method: &MethodDef,
        args: Vec<Value>,
    ) -> Exec<Option<Value>> {
        let Some(info) = method.pinvoke.as_ref() else {
            return Err(SimError::MissingBody(name.to_string()).into());
        };
        let Some(handle) = machine.world.library_handle(&info.module) else {
            return Err(self.raise(DLL_NOT_FOUND, format!("Unable to load DLL '{}'", info.module)));
        };
        let symbol = info.entry_point.as_deref().unwrap_or(&method.name);
        let addr = machine.world.symbol(handle, symbol);
        if addr == 0 {
            let message = format!(
                "Unable to find an entry point named '{symbol}' in DLL '{}'",
                info.module
            );
            return Err(self.raise(ENTRY_POINT_NOT_FOUND, message));
        }
        trace!("{name} -> {}!{symbol}", info.module);

        let mut temps = Vec::new();
        let mut native_args = Vec::with_capacity(args.len());
        for (param, value) in method.params.iter().zip(&args) {
            let native = match (&param.ty, value) {
                (TypeRef::Primitive(PrimitiveType::String), Value::Null) => NativeValue::Ptr(0),
                (TypeRef::Primitive(PrimitiveType::String), value) => {
                    let units = self.string_units(value)?;
                    let bytes = encode_for_charset(&units, info.char_set);
                    let block = machine.heap.alloc_bytes(&bytes, BlockKind::Temp);
                    temps.push(block);
                    NativeValue::Ptr(block)
                }
                (TypeRef::Primitive(PrimitiveType::Boolean), value) => {
                    NativeValue::I32(i32::from(value.is_true()))
                }
                (ty, value) => layout::to_native(&machine.module, ty, value)?,
            };
            native_args.push(native);
        }

        self.sync_pins_out()?;
        let ctx = NativeCtx::new(&machine.heap, &machine.world);
        let outcome = machine.world.invoke(&ctx, addr, &native_args);
        self.sync_pins_in()?;
        for block in temps {
            machine.heap.free(block)?;
        }
        let value = self.native_outcome(outcome)?;

        if method.return_type.is_primitive(PrimitiveType::Boolean) {
            let raw = value.as_i32().unwrap_or(0);
            return Ok(Some(Value::I32(i32::from(raw != 0))));
        }
        if method.return_type.is_primitive(PrimitiveType::String) {
            let text = match value.as_ptr() {
                None | Some(0) => return Ok(Some(Value::Null)),
                Some(addr) if info.char_set == CharSet::Unicode => machine.heap.read_wstr(addr)?,
                Some(addr) => machine.heap.read_cstr(addr)?.into_iter().map(u16::from).collect(),
            };
            return Ok(Some(Value::Ref(self.alloc(Object::Str(text)))));
        }
        Ok(layout::from_native(&machine.module, &method.return_type, &value)?)
    }
}

fn encode_for_charset(units: &[u16], char_set: CharSet) -> Vec<u8> {
    match char_set {
        CharSet::Unicode => units
            .iter()
            .flat_map(|u| u.to_le_bytes())
            .chain([0, 0])
            .collect(),
        _ => String::from_utf16_lossy(units)
            .chars()
            .map(latin1)
            .chain([0])
            .collect(),
    }
}

fn arithmetic(op: &Instr, lhs: &Value, rhs: &Value) -> Option<Value> {
    let sub = matches!(op, Instr::Sub);
    Some(match (lhs, rhs) {
        (Value::I32(a), Value::I32(b)) => {
            Value::I32(if sub { a.wrapping_sub(*b) } else { a.wrapping_add(*b) })
        }
        (Value::I64(a), Value::I64(b)) => {
            Value::I64(if sub { a.wrapping_sub(*b) } else { a.wrapping_add(*b) })
        }
        (Value::F64(a), Value::F64(b)) => Value::F64(if sub { a - b } else { a + b }),
        (Value::Ptr(_), _) | (_, Value::Ptr(_)) => {
            let (a, b) = (lhs.as_ptr()?, rhs.as_ptr()?);
            Value::Ptr(if sub { a.wrapping_sub(b) } else { a.wrapping_add(b) })
        }
        _ => return None,
    })
}

/// Operand of `cgt.un`; object references compare as non-zero.
fn unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::I32(v) => Some(u64::from(*v as u32)),
        Value::I64(v) => Some(*v as u64),
        Value::Ptr(v) => Some(*v),
        Value::Null => Some(0),
        Value::Ref(_) => Some(1),
        _ => None,
    }
}

pub(crate) fn is_exception_ctor(target: &MethodRef) -> bool {
    target.name == ".ctor" && target.owner.full_name() == bcl::EXCEPTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{NativeWorld, Platform};
    use nativize_model::builder::{method, param, ModuleBuilder};
    use nativize_model::{FieldRef, IlEmitter, Module, TypeName};

    fn with_body(
        name: &str,
        ret: TypeRef,
        params: Vec<(&str, TypeRef)>,
        e: IlEmitter,
    ) -> MethodDef {
        let params = params.into_iter().map(|(n, t)| param(n, t)).collect();
        let mut m = method(name, ret).with_params(params);
        m.body = Some(e.finish().unwrap());
        m
    }

    fn machine(methods: Vec<MethodDef>) -> Arc<Machine> {
        let module: Module = ModuleBuilder::new("t")
            .class("T", |mut t| {
                t = t.static_field("log", TypeRef::i32());
                for m in methods {
                    t = t.method(m);
                }
                t
            })
            .build();
        Machine::new(module, NativeWorld::builder(Platform::linux()).build()).unwrap()
    }

    fn log_field() -> FieldRef {
        FieldRef::new(TypeName::parse("T"), "log", TypeRef::i32())
    }

    /// `log = log * 10 + digit`
    fn emit_log(e: &mut IlEmitter, digit: i32) {
        e.emit(Instr::Ldsfld(log_field()));
        e.emit(Instr::Dup);
        e.emit(Instr::Add);
        e.emit(Instr::Dup);
        e.emit(Instr::Dup);
        e.emit(Instr::Add);
        e.emit(Instr::Dup);
        e.emit(Instr::Add);
        e.emit(Instr::Add);
        e.emit(Instr::LdcI4(digit));
        e.emit(Instr::Add);
        e.emit(Instr::Stsfld(log_field()));
    }

    #[test]
    fn loop_and_branches() {
        // sum of 0..n
        let mut e = IlEmitter::new();
        let i = e.declare_local(TypeRef::i32());
        let acc = e.declare_local(TypeRef::i32());
        let body = e.define_label();
        let cond = e.define_label();
        e.emit(Instr::Br(cond));
        e.mark_label(body);
        e.emit(Instr::Ldloc(acc));
        e.emit(Instr::Ldloc(i));
        e.emit(Instr::Add);
        e.emit(Instr::Stloc(acc));
        e.emit(Instr::Ldloc(i));
        e.emit(Instr::LdcI4(1));
        e.emit(Instr::Add);
        e.emit(Instr::Stloc(i));
        e.mark_label(cond);
        e.emit(Instr::Ldloc(i));
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Blt(body));
        e.emit(Instr::Ldloc(acc));
        e.emit(Instr::Ret);

        let m = machine(vec![with_body("Sum", TypeRef::i32(), vec![("n", TypeRef::i32())], e)]);
        let result = m.session().call("T", "Sum", vec![Value::I32(5)]).unwrap();
        assert_eq!(result, Some(Value::I32(10)));
    }

    #[test]
    fn leave_runs_finally_once() {
        let mut e = IlEmitter::new();
        e.begin_try();
        emit_log(&mut e, 1);
        e.begin_finally();
        emit_log(&mut e, 2);
        e.end_try();
        emit_log(&mut e, 3);
        e.emit(Instr::Ret);

        let m = machine(vec![with_body("Run", TypeRef::void(), vec![], e)]);
        m.session().call("T", "Run", Vec::new()).unwrap();
        assert_eq!(m.static_value("T", "log"), Some(Value::I32(123)));
    }

    #[test]
    fn exception_runs_finally_then_propagates() {
        let mut e = IlEmitter::new();
        e.begin_try();
        emit_log(&mut e, 1);
        e.emit(Instr::Ldstr("boom".into()));
        e.emit(Instr::Newobj(bcl::exception_ctor()));
        e.emit(Instr::Throw);
        e.begin_finally();
        emit_log(&mut e, 2);
        e.end_try();
        emit_log(&mut e, 3);
        e.emit(Instr::Ret);

        let m = machine(vec![with_body("Run", TypeRef::void(), vec![], e)]);
        let err = m.session().call("T", "Run", Vec::new()).unwrap_err();
        assert_eq!(
            err,
            SimError::Unhandled {
                class: "System.Exception".into(),
                message: "boom".into()
            }
        );
        assert_eq!(m.static_value("T", "log"), Some(Value::I32(12)));
    }

    #[test]
    fn switch_falls_through_out_of_range() {
        let mut e = IlEmitter::new();
        let zero = e.define_label();
        let one = e.define_label();
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::Switch(vec![zero, one]));
        e.emit(Instr::LdcI4(-1));
        e.emit(Instr::Ret);
        e.mark_label(zero);
        e.emit(Instr::LdcI4(100));
        e.emit(Instr::Ret);
        e.mark_label(one);
        e.emit(Instr::LdcI4(200));
        e.emit(Instr::Ret);

        let m = machine(vec![with_body("Pick", TypeRef::i32(), vec![("i", TypeRef::i32())], e)]);
        let mut s = m.session();
        for (input, expected) in [(0, 100), (1, 200), (2, -1), (-1, -1)] {
            let got = s.call("T", "Pick", vec![Value::I32(input)]).unwrap();
            assert_eq!(got, Some(Value::I32(expected)), "input {input}");
        }
    }

    #[test]
    fn array_bounds_raise() {
        let mut e = IlEmitter::new();
        e.emit(Instr::LdcI4(2));
        e.emit(Instr::Newarr(TypeRef::int_ptr()));
        e.emit(Instr::Ldarg(0));
        e.emit(Instr::LdelemI);
        e.emit(Instr::Ret);

        let m = machine(vec![with_body("At", TypeRef::int_ptr(), vec![("i", TypeRef::i32())], e)]);
        let mut s = m.session();
        assert_eq!(s.call("T", "At", vec![Value::I32(1)]).unwrap(), Some(Value::Ptr(0)));
        let err = s.call("T", "At", vec![Value::I32(2)]).unwrap_err();
        assert!(matches!(
            err,
            SimError::Unhandled { ref class, .. } if class == INDEX_OUT_OF_RANGE
        ));
    }

    #[test]
    fn pinned_box_round_trips_native_writes() {
        let world = NativeWorld::builder(Platform::linux())
            .library("m", |lib| {
                lib.function("Bump", |ctx, args| {
                    let p = crate::native::ptr_arg(args, 0)?;
                    let v = ctx.read_i32(p)?;
                    ctx.write_i32(p, v + 1)?;
                    Ok(NativeValue::Void)
                })
            })
            .build();
        let module = ModuleBuilder::new("t").class("T", |t| t).build();
        let m = Machine::new(module, world).unwrap();
        let mut s = m.session();
        let target = m.world().function_address("m", "Bump").unwrap();
        let slot = s.boxed(TypeRef::i32(), Value::I32(41));
        let Value::Addr(address) = slot.clone() else { unreachable!() };

        let ptr = s.pin_address(address).unwrap();
        assert_eq!(s.pin_address(address).unwrap(), ptr);
        s.indirect_call(target, &[TypeRef::int_ptr()], &TypeRef::void(), vec![Value::Ptr(ptr)])
            .ok()
            .unwrap();
        assert_eq!(s.unbox(&slot), Some(Value::I32(42)));

        s.release_pins().unwrap();
        assert_eq!(m.heap().stats().live_blocks, 0);
    }
}
