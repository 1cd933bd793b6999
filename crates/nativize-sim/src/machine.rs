//! Loaded program state and per-thread execution sessions.
//!
//! A [`Machine`] owns the module, the native world, the native heap and the
//! static fields, and is shared across threads. Each thread runs managed
//! code through its own [`Session`], which owns that thread's managed
//! objects. Static fields hold scalars only, so no object crosses sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use nativize_model::{FieldRef, Module, PrimitiveType, TypeKind, TypeName, TypeRef};

use crate::error::{Result, SimError};
use crate::interp::{Pin, Trap};
use crate::layout;
use crate::memory::NativeHeap;
use crate::native::NativeWorld;
use crate::value::{Address, ObjRef, Object, Value};

struct StaticCell {
    ty: TypeRef,
    bits: AtomicU64,
}

/// A module loaded into a simulated process.
pub struct Machine {
    pub(crate) module: Module,
    pub(crate) world: NativeWorld,
    pub(crate) heap: NativeHeap,
    statics: HashMap<(TypeName, String), StaticCell>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("module", &self.module.name)
            .field("world", &self.world)
            .field("statics", &self.statics.len())
            .finish()
    }
}

impl Machine {
    /// Load `module` and run every type initializer.
    pub fn new(module: Module, world: NativeWorld) -> Result<Arc<Machine>> {
        let mut statics = HashMap::new();
        for def in &module.types {
            for field in def.fields.iter().filter(|f| f.is_static) {
                if is_scalar(&module, &field.ty) {
                    statics.insert(
                        (def.name.clone(), field.name.clone()),
                        StaticCell {
                            ty: field.ty.clone(),
                            bits: AtomicU64::new(0),
                        },
                    );
                }
            }
        }
        let machine = Arc::new(Machine {
            module,
            world,
            heap: NativeHeap::new(),
            statics,
        });

        let initializers: Vec<(usize, TypeName)> = machine
            .module
            .types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.method(".cctor").is_some_and(|m| m.body.is_some()))
            .map(|(i, t)| (i, t.name.clone()))
            .collect();
        let mut session = machine.session();
        for (type_index, type_name) in initializers {
            debug!("running type initializer of {type_name}");
            session
                .run_initializer(type_index)
                .map_err(|source| SimError::TypeInitializer {
                    type_name: type_name.to_string(),
                    source: Box::new(source),
                })?;
        }
        Ok(machine)
    }

    pub fn session(self: &Arc<Self>) -> Session {
        Session {
            machine: Arc::clone(self),
            objects: Vec::new(),
            pins: Vec::new(),
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn world(&self) -> &NativeWorld {
        &self.world
    }

    pub fn heap(&self) -> &NativeHeap {
        &self.heap
    }

    /// Current value of a static field, e.g. `("App.Native", "p_Add")`.
    pub fn static_value(&self, owner: &str, field: &str) -> Option<Value> {
        let cell = self
            .statics
            .get(&(TypeName::parse(owner), field.to_string()))?;
        decode_bits(&self.module, &cell.ty, cell.bits.load(Ordering::SeqCst)).ok()
    }

    pub(crate) fn load_static(&self, field: &FieldRef) -> Result<Value> {
        let cell = self.cell(field)?;
        decode_bits(&self.module, &cell.ty, cell.bits.load(Ordering::SeqCst))
    }

    pub(crate) fn store_static(&self, field: &FieldRef, value: &Value) -> Result<()> {
        let cell = self.cell(field)?;
        let bytes = layout::encode(&self.module, &cell.ty, value)?;
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(&bytes);
        cell.bits.store(u64::from_le_bytes(raw), Ordering::SeqCst);
        Ok(())
    }

    fn cell(&self, field: &FieldRef) -> Result<&StaticCell> {
        self.statics
            .get(&(field.owner.clone(), field.name.clone()))
            .ok_or_else(|| SimError::MissingField(field.to_string()))
    }
}

/// Static fields the machine can hold: values that fit in 8 bytes.
fn is_scalar(module: &Module, ty: &TypeRef) -> bool {
    match ty {
        TypeRef::Primitive(p) => {
            p.is_numeric_or_pointer() || matches!(p, PrimitiveType::Boolean | PrimitiveType::Char)
        }
        TypeRef::Pointer(_) => true,
        TypeRef::Named(name) => module
            .find_type(name)
            .is_some_and(|d| matches!(d.kind, TypeKind::Enum { .. })),
        _ => false,
    }
}

fn decode_bits(module: &Module, ty: &TypeRef, bits: u64) -> Result<Value> {
    layout::decode(module, ty, &bits.to_le_bytes())
}

/// One thread of managed execution.
pub struct Session {
    pub(crate) machine: Arc<Machine>,
    pub(crate) objects: Vec<Object>,
    pub(crate) pins: Vec<Pin>,
}

impl Session {
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Call the first method named `method` on `type_name`.
    pub fn call(
        &mut self,
        type_name: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let owner = TypeName::parse(type_name);
        let handle = self
            .machine
            .module
            .type_index(&owner)
            .and_then(|ti| {
                let def = &self.machine.module.types[ti];
                def.methods.iter().position(|m| m.name == method).map(|mi| (ti, mi))
            })
            .ok_or_else(|| SimError::MissingMethod(format!("{type_name}::{method}")))?;
        self.call_handle(handle, args)
    }

    /// Call the overload of `method` taking exactly `params`.
    pub fn call_sig(
        &mut self,
        type_name: &str,
        method: &str,
        params: &[TypeRef],
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let owner = TypeName::parse(type_name);
        let handle = self
            .resolve(&owner, method, params)
            .ok_or_else(|| SimError::MissingMethod(format!("{type_name}::{method}")))?;
        self.call_handle(handle, args)
    }

    fn call_handle(&mut self, handle: (usize, usize), args: Vec<Value>) -> Result<Option<Value>> {
        let outcome = self.invoke_def(handle, args);
        let released = self.release_pins();
        let value = outcome.map_err(|trap| self.unhandled(trap))?;
        released?;
        Ok(value)
    }

    fn run_initializer(&mut self, type_index: usize) -> Result<()> {
        let method_index = self.machine.module.types[type_index]
            .methods
            .iter()
            .position(|m| m.name == ".cctor")
            .ok_or_else(|| SimError::MissingMethod(".cctor".to_string()))?;
        self.call_handle((type_index, method_index), Vec::new())
            .map(|_| ())
    }

    pub(crate) fn resolve(
        &self,
        owner: &TypeName,
        name: &str,
        params: &[TypeRef],
    ) -> Option<(usize, usize)> {
        let ti = self.machine.module.type_index(owner)?;
        let mi = self.machine.module.types[ti]
            .methods
            .iter()
            .position(|m| m.name == name && m.param_types() == params)?;
        Some((ti, mi))
    }

    fn unhandled(&self, trap: Trap) -> SimError {
        match trap {
            Trap::Fatal(err) => err,
            Trap::Exception(obj) => match self.objects.get(obj.0 as usize) {
                Some(Object::Exception { class, message }) => SimError::Unhandled {
                    class: class.clone(),
                    message: message.clone(),
                },
                Some(other) => SimError::Unhandled {
                    class: other.class_name(),
                    message: String::new(),
                },
                None => SimError::Unsupported(format!("thrown object #{} is gone", obj.0)),
            },
        }
    }

    pub(crate) fn alloc(&mut self, object: Object) -> ObjRef {
        self.objects.push(object);
        ObjRef((self.objects.len() - 1) as u32)
    }

    pub(crate) fn object(&self, r: ObjRef) -> Result<&Object> {
        self.objects
            .get(r.0 as usize)
            .ok_or_else(|| SimError::Unsupported(format!("dangling object #{}", r.0)))
    }

    pub(crate) fn object_mut(&mut self, r: ObjRef) -> Result<&mut Object> {
        self.objects
            .get_mut(r.0 as usize)
            .ok_or_else(|| SimError::Unsupported(format!("dangling object #{}", r.0)))
    }

    /// A new managed string.
    pub fn string(&mut self, text: &str) -> Value {
        Value::Ref(self.alloc(Object::Str(text.encode_utf16().collect())))
    }

    /// Contents of a string value; `None` for null or a non-string.
    pub fn read_string(&self, value: &Value) -> Option<String> {
        match value {
            Value::Ref(r) => match self.objects.get(r.0 as usize)? {
                Object::Str(units) => Some(String::from_utf16_lossy(units)),
                _ => None,
            },
            _ => None,
        }
    }

    /// A `string[]` with `None` as null elements.
    pub fn string_array(&mut self, items: &[Option<&str>]) -> Value {
        let values = items
            .iter()
            .map(|item| match item {
                Some(text) => self.string(text),
                None => Value::Null,
            })
            .collect();
        self.array(TypeRef::string(), values)
    }

    pub fn array(&mut self, element: TypeRef, items: Vec<Value>) -> Value {
        Value::Ref(self.alloc(Object::Array { element, items }))
    }

    pub fn array_items(&self, value: &Value) -> Option<Vec<Value>> {
        match value {
            Value::Ref(r) => match self.objects.get(r.0 as usize)? {
                Object::Array { items, .. } => Some(items.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// A managed pointer to a fresh box holding `value`, for by-reference
    /// arguments.
    pub fn boxed(&mut self, ty: TypeRef, value: Value) -> Value {
        Value::Addr(Address::Boxed(self.alloc(Object::Boxed { ty, value })))
    }

    /// Current content of the box behind a managed pointer.
    pub fn unbox(&self, value: &Value) -> Option<Value> {
        match value {
            Value::Addr(Address::Boxed(r)) => match self.objects.get(r.0 as usize)? {
                Object::Boxed { value, .. } => Some(value.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// A delegate of type `ty` whose native entry point is `target`.
    pub fn delegate(&mut self, ty: TypeRef, target: u64) -> Value {
        Value::Ref(self.alloc(Object::Delegate { ty, target }))
    }

    pub fn delegate_target(&self, value: &Value) -> Option<u64> {
        match value {
            Value::Ref(r) => match self.objects.get(r.0 as usize)? {
                Object::Delegate { target, .. } => Some(*target),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::Platform;
    use nativize_model::builder::{method, ModuleBuilder};
    use nativize_model::{IlEmitter, Instr};

    fn counter_module() -> Module {
        let mut e = IlEmitter::new();
        e.emit(Instr::LdcI4(41));
        e.emit(Instr::Stsfld(FieldRef::new(
            TypeName::parse("App.Counter"),
            "value",
            TypeRef::i32(),
        )));
        e.emit(Instr::Ret);
        let mut cctor = method(".cctor", TypeRef::void());
        cctor.body = Some(e.finish().unwrap());

        ModuleBuilder::new("m")
            .class("App.Counter", |t| {
                t.static_field("value", TypeRef::i32())
                    .static_field("name", TypeRef::string())
                    .method(cctor)
            })
            .build()
    }

    fn linux() -> NativeWorld {
        NativeWorld::builder(Platform::linux()).build()
    }

    #[test]
    fn type_initializers_run_at_load() {
        let machine = Machine::new(counter_module(), linux()).unwrap();
        assert_eq!(machine.static_value("App.Counter", "value"), Some(Value::I32(41)));
        assert_eq!(machine.static_value("App.Counter", "name"), None);
    }

    #[test]
    fn failing_initializer() {
        let mut module = counter_module();
        let body = module.types[0].methods[0].body.as_mut().unwrap();
        let missing = FieldRef::new(TypeName::parse("App.Counter"), "missing", TypeRef::i32());
        body.instrs[1] = Instr::Stsfld(missing);
        let err = Machine::new(module, linux()).unwrap_err();
        assert!(matches!(
            err,
            SimError::TypeInitializer { ref type_name, .. } if type_name == "App.Counter"
        ));
    }

    #[test]
    fn session_objects() {
        let machine = Machine::new(counter_module(), linux()).unwrap();
        let mut s = machine.session();
        let text = s.string("hi");
        assert_eq!(s.read_string(&text).as_deref(), Some("hi"));
        assert_eq!(s.read_string(&Value::Null), None);

        let arr = s.string_array(&[Some("a"), None]);
        let items = s.array_items(&arr).unwrap();
        assert_eq!(items[1], Value::Null);
        assert_eq!(s.read_string(&items[0]).as_deref(), Some("a"));

        let b = s.boxed(TypeRef::i32(), Value::I32(3));
        assert_eq!(s.unbox(&b), Some(Value::I32(3)));

        let d = s.delegate(TypeRef::named("App.Callback"), 0x40);
        assert_eq!(s.delegate_target(&d), Some(0x40));
    }

    #[test]
    fn unknown_method() {
        let machine = Machine::new(counter_module(), linux()).unwrap();
        let err = machine.session().call("App.Counter", "Nope", Vec::new()).unwrap_err();
        assert!(matches!(err, SimError::MissingMethod(_)));
    }
}
