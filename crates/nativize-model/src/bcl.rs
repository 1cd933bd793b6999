//! References to the runtime library members generated code calls.

use crate::il::MethodRef;
use crate::types::{TypeName, TypeRef};

pub const MARSHAL: &str = "System.Runtime.InteropServices.Marshal";
pub const STRING: &str = "System.String";
pub const ENVIRONMENT: &str = "System.Environment";
pub const RUNTIME_HELPERS: &str = "System.Runtime.CompilerServices.RuntimeHelpers";
pub const TYPE: &str = "System.Type";
pub const EXCEPTION: &str = "System.Exception";
pub const DELEGATE: &str = "System.Delegate";
pub const MULTICAST_DELEGATE: &str = "System.MulticastDelegate";
pub const RUNTIME_TYPE_HANDLE: &str = "System.RuntimeTypeHandle";

fn marshal(name: &str, params: Vec<TypeRef>, ret: TypeRef) -> MethodRef {
    MethodRef::new_static(TypeName::parse(MARSHAL), name, params, ret)
}

fn string(name: &str, params: Vec<TypeRef>, ret: TypeRef) -> MethodRef {
    MethodRef::new_static(TypeName::parse(STRING), name, params, ret)
}

/// `IntPtr Marshal.AllocHGlobal(int32)`
pub fn alloc_hglobal() -> MethodRef {
    marshal("AllocHGlobal", vec![TypeRef::i32()], TypeRef::int_ptr())
}

/// `void Marshal.FreeHGlobal(IntPtr)`
pub fn free_hglobal() -> MethodRef {
    marshal("FreeHGlobal", vec![TypeRef::int_ptr()], TypeRef::void())
}

pub fn ptr_to_string_ansi() -> MethodRef {
    marshal("PtrToStringAnsi", vec![TypeRef::int_ptr()], TypeRef::string())
}

pub fn ptr_to_string_uni() -> MethodRef {
    marshal("PtrToStringUni", vec![TypeRef::int_ptr()], TypeRef::string())
}

pub fn string_to_hglobal_ansi() -> MethodRef {
    marshal("StringToHGlobalAnsi", vec![TypeRef::string()], TypeRef::int_ptr())
}

pub fn string_to_hglobal_uni() -> MethodRef {
    marshal("StringToHGlobalUni", vec![TypeRef::string()], TypeRef::int_ptr())
}

pub fn get_function_pointer_for_delegate() -> MethodRef {
    marshal(
        "GetFunctionPointerForDelegate",
        vec![TypeRef::named(DELEGATE)],
        TypeRef::int_ptr(),
    )
}

pub fn get_delegate_for_function_pointer() -> MethodRef {
    marshal(
        "GetDelegateForFunctionPointer",
        vec![TypeRef::int_ptr(), TypeRef::named(TYPE)],
        TypeRef::named(DELEGATE),
    )
}

/// `bool String.op_Equality(string, string)`
pub fn string_equals() -> MethodRef {
    string(
        "op_Equality",
        vec![TypeRef::string(), TypeRef::string()],
        TypeRef::boolean(),
    )
}

pub fn string_concat2() -> MethodRef {
    string(
        "Concat",
        vec![TypeRef::string(), TypeRef::string()],
        TypeRef::string(),
    )
}

pub fn string_length() -> MethodRef {
    MethodRef {
        has_this: true,
        ..string("get_Length", Vec::new(), TypeRef::i32())
    }
}

pub fn string_chars() -> MethodRef {
    MethodRef {
        has_this: true,
        ..string("get_Chars", vec![TypeRef::i32()], TypeRef::char())
    }
}

pub fn environment_newline() -> MethodRef {
    MethodRef::new_static(
        TypeName::parse(ENVIRONMENT),
        "get_NewLine",
        Vec::new(),
        TypeRef::string(),
    )
}

/// Byte offset of the first character inside a string object.
pub fn offset_to_string_data() -> MethodRef {
    MethodRef::new_static(
        TypeName::parse(RUNTIME_HELPERS),
        "get_OffsetToStringData",
        Vec::new(),
        TypeRef::i32(),
    )
}

pub fn type_from_handle() -> MethodRef {
    MethodRef::new_static(
        TypeName::parse(TYPE),
        "GetTypeFromHandle",
        vec![TypeRef::named(RUNTIME_TYPE_HANDLE)],
        TypeRef::named(TYPE),
    )
}

/// `Exception(string message)`
pub fn exception_ctor() -> MethodRef {
    MethodRef::constructor(TypeName::parse(EXCEPTION), vec![TypeRef::string()])
}
