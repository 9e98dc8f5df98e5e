//! Value tagging, boxing and string adapters.

use wasmtime::{Caller, ExternRef};

use crate::host::{arg, index};
use crate::instance::BridgeState;
use crate::marshal::{self, ModuleString, StringWidth};
use crate::value::{HostString, HostValue, MarshalError};

type Ref = Option<ExternRef>;

// ---------------------------------------------------------------------------
// Tags & boxing
// ---------------------------------------------------------------------------

/// type_tag(value) -> i32
pub(crate) fn host_type_tag(value: Ref) -> anyhow::Result<i32> {
    Ok(arg(&value)?.kind().tag())
}

/// undefined() -> externref
pub(crate) fn host_undefined() -> Ref {
    HostValue::Undefined.to_extern()
}

/// is_undefined(value) -> i32
pub(crate) fn host_is_undefined(value: Ref) -> anyhow::Result<i32> {
    Ok(arg(&value)?.is_undefined() as i32)
}

/// identical(a, b) -> i32
pub(crate) fn host_identical(a: Ref, b: Ref) -> anyhow::Result<i32> {
    Ok(arg(&a)?.strict_equals(&arg(&b)?) as i32)
}

/// box_bool(i32) -> externref
pub(crate) fn host_box_bool(value: i32) -> Ref {
    HostValue::Bool(value != 0).to_extern()
}

/// unbox_bool(value) -> i32
pub(crate) fn host_unbox_bool(value: Ref) -> anyhow::Result<i32> {
    match arg(&value)? {
        HostValue::Bool(b) => Ok(b as i32),
        HostValue::Null => Err(MarshalError::NullReference.into()),
        other => Err(MarshalError::TypeMismatch {
            expected: "boolean",
            found: other.kind(),
        }
        .into()),
    }
}

/// box_number(f64) -> externref
pub(crate) fn host_box_number(value: f64) -> Ref {
    HostValue::Number(value).to_extern()
}

/// unbox_number(value) -> f64
pub(crate) fn host_unbox_number(value: Ref) -> anyhow::Result<f64> {
    Ok(arg(&value)?.as_number()?)
}

/// to_display_string(value) -> externref
pub(crate) fn host_to_display_string(value: Ref) -> anyhow::Result<Ref> {
    Ok(HostValue::String(arg(&value)?.to_display_string()).to_extern())
}

/// is_error(value) -> i32
pub(crate) fn host_is_error(value: Ref) -> anyhow::Result<i32> {
    Ok(matches!(arg(&value)?, HostValue::Error(_)) as i32)
}

/// error_message(error) -> externref
pub(crate) fn host_error_message(value: Ref) -> anyhow::Result<Ref> {
    match arg(&value)? {
        HostValue::Error(e) => Ok(HostValue::from(e.message().as_str()).to_extern()),
        other => Err(MarshalError::TypeMismatch {
            expected: "error",
            found: other.kind(),
        }
        .into()),
    }
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

/// string_to_module(string) -> handle
pub(crate) fn host_string_to_module(
    mut caller: Caller<'_, BridgeState>,
    value: Ref,
) -> anyhow::Result<i32> {
    let value = arg(&value)?;
    let s = value.as_string()?;
    Ok(marshal::string_to_module(&mut caller, s)?.handle)
}

fn string_from_module(
    caller: &mut Caller<'_, BridgeState>,
    handle: i32,
    length: i32,
    width: StringWidth,
) -> anyhow::Result<Ref> {
    let s = ModuleString {
        handle,
        length: index(length)?,
        width,
    };
    Ok(HostValue::String(marshal::string_from_module(caller, s)?).to_extern())
}

/// string_from_module_1(handle, length) -> externref
pub(crate) fn host_string_from_module_1(
    mut caller: Caller<'_, BridgeState>,
    handle: i32,
    length: i32,
) -> anyhow::Result<Ref> {
    string_from_module(&mut caller, handle, length, StringWidth::OneByte)
}

/// string_from_module_2(handle, length) -> externref
pub(crate) fn host_string_from_module_2(
    mut caller: Caller<'_, BridgeState>,
    handle: i32,
    length: i32,
) -> anyhow::Result<Ref> {
    string_from_module(&mut caller, handle, length, StringWidth::TwoByte)
}

/// decode_utf8(ptr, len) -> externref
///
/// Invalid sequences decode to U+FFFD.
pub(crate) fn host_decode_utf8(
    mut caller: Caller<'_, BridgeState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Ref> {
    let bytes = marshal::bytes_from_module(&mut caller, index(ptr)?, index(len)?)?;
    let s = HostString::from(String::from_utf8_lossy(&bytes).as_ref());
    Ok(HostValue::String(s).to_extern())
}
