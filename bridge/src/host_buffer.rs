//! Array buffer, typed array and data view adapters.
//!
//! Typed array contents move to and from linear memory only by copying.
//! Multi-byte data view accessors take the byte order from the module as
//! an `i32` flag (non-zero means little-endian).

use wasmtime::{Caller, ExternRef};

use crate::host::{arg, count, index};
use crate::instance::BridgeState;
use crate::marshal;
use crate::value::{ArrayBuffer, DataView, ElementKind, HostValue, MarshalError, TypedArray};

type Ref = Option<ExternRef>;

fn array_buffer(value: &HostValue) -> Result<&ArrayBuffer, MarshalError> {
    match value {
        HostValue::ArrayBuffer(b) => Ok(b),
        HostValue::Null => Err(MarshalError::NullReference),
        other => Err(MarshalError::TypeMismatch {
            expected: "array buffer",
            found: other.kind(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Array buffers
// ---------------------------------------------------------------------------

/// array_buffer_new(byte_length) -> externref
pub(crate) fn host_array_buffer_new(len: i32) -> anyhow::Result<Ref> {
    Ok(HostValue::ArrayBuffer(ArrayBuffer::new(index(len)?)).to_extern())
}

/// array_buffer_byte_length(buffer) -> i32
pub(crate) fn host_array_buffer_byte_length(buffer: Ref) -> anyhow::Result<i32> {
    let buffer = arg(&buffer)?;
    Ok(count(array_buffer(&buffer)?.byte_length())?)
}

// ---------------------------------------------------------------------------
// Typed arrays
// ---------------------------------------------------------------------------

/// typed_array_new(type_tag, length) -> externref
pub(crate) fn host_typed_array_new(tag: i32, len: i32) -> anyhow::Result<Ref> {
    let kind = ElementKind::from_tag(tag).ok_or(MarshalError::InvalidTypeTag(tag))?;
    Ok(HostValue::TypedArray(TypedArray::new(kind, index(len)?)).to_extern())
}

/// typed_array_length(array) -> i32
pub(crate) fn host_typed_array_length(array: Ref) -> anyhow::Result<i32> {
    Ok(count(arg(&array)?.as_typed_array()?.len())?)
}

/// typed_array_get(array, index) -> f64
pub(crate) fn host_typed_array_get(array: Ref, i: i32) -> anyhow::Result<f64> {
    let array = arg(&array)?;
    let array = array.as_typed_array()?;
    let i = index(i)?;
    array.get(i).ok_or_else(|| {
        MarshalError::OutOfBounds {
            offset: i,
            len: 1,
            size: array.len(),
        }
        .into()
    })
}

/// typed_array_set(array, index, value)
pub(crate) fn host_typed_array_set(array: Ref, i: i32, value: f64) -> anyhow::Result<()> {
    arg(&array)?.as_typed_array()?.set(index(i)?, value)?;
    Ok(())
}

/// typed_array_from_module_list(type_tag, list) -> externref
pub(crate) fn host_typed_array_from_module_list(
    mut caller: Caller<'_, BridgeState>,
    tag: i32,
    list: i32,
) -> anyhow::Result<Ref> {
    let kind = ElementKind::from_tag(tag).ok_or(MarshalError::InvalidTypeTag(tag))?;
    let array = marshal::typed_array_from_module_list(&mut caller, kind, list)?;
    Ok(HostValue::TypedArray(array).to_extern())
}

/// typed_array_copy_from_module(array, start, count, ptr)
pub(crate) fn host_typed_array_copy_from_module(
    mut caller: Caller<'_, BridgeState>,
    array: Ref,
    start: i32,
    len: i32,
    ptr: i32,
) -> anyhow::Result<()> {
    let array = arg(&array)?;
    marshal::typed_array_from_module(
        &mut caller,
        array.as_typed_array()?,
        index(start)?,
        index(len)?,
        index(ptr)?,
    )?;
    Ok(())
}

/// typed_array_copy_to_module(array, start, count, ptr)
pub(crate) fn host_typed_array_copy_to_module(
    mut caller: Caller<'_, BridgeState>,
    array: Ref,
    start: i32,
    len: i32,
    ptr: i32,
) -> anyhow::Result<()> {
    let array = arg(&array)?;
    marshal::typed_array_to_module(
        &mut caller,
        array.as_typed_array()?,
        index(start)?,
        index(len)?,
        index(ptr)?,
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Data views
// ---------------------------------------------------------------------------

/// data_view_new(byte_length) -> externref
pub(crate) fn host_data_view_new(len: i32) -> anyhow::Result<Ref> {
    Ok(HostValue::DataView(DataView::new(index(len)?)).to_extern())
}

/// data_view_of(buffer, offset, length) -> externref
///
/// `buffer` may be an array buffer or any view; offsets are relative to the
/// start of the view.
pub(crate) fn host_data_view_of(buffer: Ref, offset: i32, len: i32) -> anyhow::Result<Ref> {
    let (buffer, base) = match arg(&buffer)? {
        HostValue::ArrayBuffer(b) => (b, 0),
        HostValue::TypedArray(a) => (a.buffer().clone(), a.byte_offset()),
        HostValue::DataView(v) => (v.buffer().clone(), v.byte_offset()),
        HostValue::Null => return Err(MarshalError::NullReference.into()),
        other => {
            return Err(MarshalError::TypeMismatch {
                expected: "array buffer or view",
                found: other.kind(),
            }
            .into())
        }
    };
    let view = DataView::over(buffer, base + index(offset)?, index(len)?)?;
    Ok(HostValue::DataView(view).to_extern())
}

/// data_view_byte_length(view) -> i32
pub(crate) fn host_data_view_byte_length(view: Ref) -> anyhow::Result<i32> {
    Ok(count(arg(&view)?.as_data_view()?.byte_length())?)
}

/// data_view_copy(view, offset, length) -> externref
pub(crate) fn host_data_view_copy(view: Ref, offset: i32, len: i32) -> anyhow::Result<Ref> {
    let view = arg(&view)?;
    let copy = view.as_data_view()?.copy(index(offset)?, index(len)?)?;
    Ok(HostValue::DataView(copy).to_extern())
}

/// data_view_from_module(ptr, length) -> externref
pub(crate) fn host_data_view_from_module(
    mut caller: Caller<'_, BridgeState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Ref> {
    let bytes = marshal::bytes_from_module(&mut caller, index(ptr)?, index(len)?)?;
    Ok(HostValue::DataView(DataView::from_bytes(bytes)).to_extern())
}

/// data_view_get_int8(view, offset) -> i32
pub(crate) fn host_data_view_get_int8(view: Ref, offset: i32) -> anyhow::Result<i32> {
    let view = arg(&view)?;
    Ok(i32::from(view.as_data_view()?.get_int8(index(offset)?, true)?))
}

/// data_view_get_uint8(view, offset) -> i32
pub(crate) fn host_data_view_get_uint8(view: Ref, offset: i32) -> anyhow::Result<i32> {
    let view = arg(&view)?;
    Ok(i32::from(view.as_data_view()?.get_uint8(index(offset)?, true)?))
}

/// data_view_set_int8(view, offset, value)
pub(crate) fn host_data_view_set_int8(view: Ref, offset: i32, value: i32) -> anyhow::Result<()> {
    arg(&view)?
        .as_data_view()?
        .set_int8(index(offset)?, value as i8, true)?;
    Ok(())
}

/// data_view_set_uint8(view, offset, value)
pub(crate) fn host_data_view_set_uint8(view: Ref, offset: i32, value: i32) -> anyhow::Result<()> {
    arg(&view)?
        .as_data_view()?
        .set_uint8(index(offset)?, value as u8, true)?;
    Ok(())
}

macro_rules! data_view_adapters {
    ($( $get:ident, $set:ident => $view_get:ident, $view_set:ident, $wasm:ty, $native:ty; )*) => {
        $(
            pub(crate) fn $get(view: Ref, offset: i32, little_endian: i32) -> anyhow::Result<$wasm> {
                let view = arg(&view)?;
                let value = view
                    .as_data_view()?
                    .$view_get(index(offset)?, little_endian != 0)?;
                Ok(value as $wasm)
            }

            pub(crate) fn $set(
                view: Ref,
                offset: i32,
                value: $wasm,
                little_endian: i32,
            ) -> anyhow::Result<()> {
                arg(&view)?
                    .as_data_view()?
                    .$view_set(index(offset)?, value as $native, little_endian != 0)?;
                Ok(())
            }
        )*
    };
}

data_view_adapters! {
    host_data_view_get_int16, host_data_view_set_int16 => get_int16, set_int16, i32, i16;
    host_data_view_get_uint16, host_data_view_set_uint16 => get_uint16, set_uint16, i32, u16;
    host_data_view_get_int32, host_data_view_set_int32 => get_int32, set_int32, i32, i32;
    host_data_view_get_uint32, host_data_view_set_uint32 => get_uint32, set_uint32, i32, u32;
    host_data_view_get_big_int64, host_data_view_set_big_int64 => get_big_int64, set_big_int64, i64, i64;
    host_data_view_get_big_uint64, host_data_view_set_big_uint64 => get_big_uint64, set_big_uint64, i64, u64;
    host_data_view_get_float32, host_data_view_set_float32 => get_float32, set_float32, f32, f32;
    host_data_view_get_float64, host_data_view_set_float64 => get_float64, set_float64, f64, f64;
}
