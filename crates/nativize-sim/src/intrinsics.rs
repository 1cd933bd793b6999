//! Runtime library members generated code calls.

use nativize_model::{bcl, MethodRef};

use crate::error::SimError;
use crate::interp::{is_exception_ctor, Exec, Trap, INDEX_OUT_OF_RANGE, STRING_DATA_OFFSET};
use crate::machine::Session;
use crate::memory::BlockKind;
use crate::native::latin1;
use crate::value::{Object, Value};

const ARGUMENT_NULL: &str = "System.ArgumentNullException";

pub(crate) fn call(
    session: &mut Session,
    target: &MethodRef,
    args: Vec<Value>,
) -> Exec<Option<Value>> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    let owner = target.owner.full_name();
    let value = match (owner.as_str(), target.name.as_str()) {
        (bcl::MARSHAL, "AllocHGlobal") => {
            let size = arg(0).as_i32().unwrap_or(0).max(0) as usize;
            Value::Ptr(session.machine.heap.alloc(size, BlockKind::HGlobal))
        }
        (bcl::MARSHAL, "FreeHGlobal") => {
            let addr = pointer(&arg(0))?;
            if addr != 0 {
                session.machine.heap.free(addr)?;
            }
            return Ok(None);
        }
        (bcl::MARSHAL, "PtrToStringAnsi") => match pointer(&arg(0))? {
            0 => Value::Null,
            addr => {
                let bytes = session.machine.heap.read_cstr(addr)?;
                let text: String = bytes.iter().map(|b| char::from(*b)).collect();
                session.string(&text)
            }
        },
        (bcl::MARSHAL, "PtrToStringUni") => match pointer(&arg(0))? {
            0 => Value::Null,
            addr => {
                let units = session.machine.heap.read_wstr(addr)?;
                Value::Ref(session.alloc(Object::Str(units)))
            }
        },
        (bcl::MARSHAL, "StringToHGlobalAnsi") => match arg(0) {
            Value::Null => Value::Ptr(0),
            text => {
                let units = session.string_units(&text)?;
                let mut bytes: Vec<u8> =
                    String::from_utf16_lossy(&units).chars().map(latin1).collect();
                bytes.push(0);
                Value::Ptr(session.machine.heap.alloc_bytes(&bytes, BlockKind::HGlobal))
            }
        },
        (bcl::MARSHAL, "StringToHGlobalUni") => match arg(0) {
            Value::Null => Value::Ptr(0),
            text => {
                let units = session.string_units(&text)?;
                let bytes: Vec<u8> = units
                    .iter()
                    .flat_map(|u| u.to_le_bytes())
                    .chain([0, 0])
                    .collect();
                Value::Ptr(session.machine.heap.alloc_bytes(&bytes, BlockKind::HGlobal))
            }
        },
        (bcl::MARSHAL, "GetFunctionPointerForDelegate") => match session.delegate_target(&arg(0)) {
            Some(target) => Value::Ptr(target),
            None => {
                return Err(session.raise(ARGUMENT_NULL, "Value cannot be null. (Parameter 'd')"))
            }
        },
        (bcl::MARSHAL, "GetDelegateForFunctionPointer") => {
            let addr = pointer(&arg(0))?;
            let ty = match arg(1) {
                Value::Ref(obj) => match session.object(obj)? {
                    Object::Type(ty) => ty.clone(),
                    other => {
                        return Err(unsupported(format!("{} is not a type", other.class_name())))
                    }
                },
                _ => {
                    return Err(
                        session.raise(ARGUMENT_NULL, "Value cannot be null. (Parameter 't')")
                    )
                }
            };
            session.delegate(ty, addr)
        }
        (bcl::STRING, "op_Equality") => {
            let equal = match (arg(0), arg(1)) {
                (Value::Null, Value::Null) => true,
                (Value::Null, _) | (_, Value::Null) => false,
                (a, b) => session.string_units(&a)? == session.string_units(&b)?,
            };
            Value::I32(i32::from(equal))
        }
        (bcl::STRING, "Concat") => {
            let mut units = Vec::new();
            for value in [arg(0), arg(1)] {
                if value != Value::Null {
                    units.extend(session.string_units(&value)?);
                }
            }
            Value::Ref(session.alloc(Object::Str(units)))
        }
        (bcl::STRING, "get_Length") => Value::I32(session.string_units(&arg(0))?.len() as i32),
        (bcl::STRING, "get_Chars") => {
            let units = session.string_units(&arg(0))?;
            let index = arg(1).as_i32().unwrap_or(-1);
            match usize::try_from(index).ok().and_then(|i| units.get(i)) {
                Some(unit) => Value::I32(i32::from(*unit)),
                None => {
                    let message = "Index was outside the bounds of the array.";
                    return Err(session.raise(INDEX_OUT_OF_RANGE, message));
                }
            }
        }
        (bcl::ENVIRONMENT, "get_NewLine") => {
            let newline = session.machine.world.platform().newline.clone();
            session.string(&newline)
        }
        (bcl::RUNTIME_HELPERS, "get_OffsetToStringData") => Value::I32(STRING_DATA_OFFSET),
        (bcl::TYPE, "GetTypeFromHandle") => arg(0),
        _ => return Err(SimError::MissingMethod(target.to_string()).into()),
    };
    Ok(Some(value))
}

/// `newobj` on a runtime library type.
pub(crate) fn construct(session: &mut Session, ctor: &MethodRef, args: Vec<Value>) -> Exec<Value> {
    if !is_exception_ctor(ctor) {
        return Err(SimError::MissingMethod(ctor.to_string()).into());
    }
    let message = match args.first() {
        Some(Value::Null) | None => String::new(),
        Some(text) => String::from_utf16_lossy(&session.string_units(text)?),
    };
    let obj = session.alloc(Object::Exception {
        class: bcl::EXCEPTION.to_string(),
        message,
    });
    Ok(Value::Ref(obj))
}

fn pointer(value: &Value) -> Exec<u64> {
    value
        .as_ptr()
        .ok_or_else(|| unsupported(format!("expected a native int, found {}", value.kind())))
}

fn unsupported(message: String) -> Trap {
    SimError::Unsupported(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::native::{NativeWorld, Platform};
    use nativize_model::builder::ModuleBuilder;
    use nativize_model::TypeRef;
    use std::sync::Arc;

    fn machine(platform: Platform) -> Arc<Machine> {
        let world = NativeWorld::builder(platform).build();
        Machine::new(ModuleBuilder::new("i").build(), world).unwrap()
    }

    fn invoke(s: &mut Session, target: MethodRef, args: Vec<Value>) -> Option<Value> {
        call(s, &target, args).unwrap()
    }

    #[test]
    fn hglobal_strings() {
        let m = machine(Platform::linux());
        let mut s = m.session();
        let text = s.string("h\u{e9}llo");
        let p = invoke(&mut s, bcl::string_to_hglobal_ansi(), vec![text]).unwrap();
        let back = invoke(&mut s, bcl::ptr_to_string_ansi(), vec![p.clone()]).unwrap();
        assert_eq!(s.read_string(&back).as_deref(), Some("h\u{e9}llo"));
        assert_eq!(m.heap().stats().live_hglobal, 1);
        invoke(&mut s, bcl::free_hglobal(), vec![p]);
        assert_eq!(m.heap().stats().live_hglobal, 0);

        let null = invoke(&mut s, bcl::string_to_hglobal_uni(), vec![Value::Null]).unwrap();
        assert_eq!(null, Value::Ptr(0));
        assert_eq!(invoke(&mut s, bcl::ptr_to_string_uni(), vec![null.clone()]), Some(Value::Null));
        assert_eq!(invoke(&mut s, bcl::free_hglobal(), vec![null]), None);
    }

    #[test]
    fn string_members() {
        let m = machine(Platform::linux());
        let mut s = m.session();
        let a = s.string("ab");
        let b = s.string("ab");
        assert_eq!(
            invoke(&mut s, bcl::string_equals(), vec![a.clone(), b]),
            Some(Value::I32(1))
        );
        assert_eq!(
            invoke(&mut s, bcl::string_equals(), vec![a.clone(), Value::Null]),
            Some(Value::I32(0))
        );
        let joined = invoke(&mut s, bcl::string_concat2(), vec![a.clone(), Value::Null]).unwrap();
        assert_eq!(s.read_string(&joined).as_deref(), Some("ab"));
        assert_eq!(invoke(&mut s, bcl::string_length(), vec![a.clone()]), Some(Value::I32(2)));
        assert_eq!(
            invoke(&mut s, bcl::string_chars(), vec![a.clone(), Value::I32(1)]),
            Some(Value::I32('b' as i32))
        );
        assert!(matches!(
            call(&mut s, &bcl::string_chars(), vec![a, Value::I32(5)]),
            Err(Trap::Exception(_))
        ));
    }

    #[test]
    fn newline_follows_platform() {
        for (platform, expected) in [(Platform::linux(), "\n"), (Platform::windows(), "\r\n")] {
            let m = machine(platform);
            let mut s = m.session();
            let nl = invoke(&mut s, bcl::environment_newline(), Vec::new()).unwrap();
            assert_eq!(s.read_string(&nl).as_deref(), Some(expected));
        }
    }

    #[test]
    fn exception_constructor() {
        let m = machine(Platform::linux());
        let mut s = m.session();
        let msg = s.string("nope");
        let Value::Ref(obj) = construct(&mut s, &bcl::exception_ctor(), vec![msg]).unwrap() else {
            panic!("expected an object");
        };
        assert_eq!(
            s.object(obj).unwrap(),
            &Object::Exception {
                class: "System.Exception".into(),
                message: "nope".into()
            }
        );
    }

    #[test]
    fn unknown_member() {
        let m = machine(Platform::linux());
        let mut s = m.session();
        let target = MethodRef::new_static(
            nativize_model::TypeName::parse("System.Console"),
            "WriteLine",
            vec![],
            TypeRef::void(),
        );
        assert!(matches!(
            call(&mut s, &target, Vec::new()),
            Err(Trap::Fatal(SimError::MissingMethod(_)))
        ));
    }
}
