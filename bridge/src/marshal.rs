//! Conversions that go through the module's reserved exports.
//!
//! Strings, lists, closures and callbacks live in the module; the host only
//! reaches them through the reserved `$...` exports of the primary
//! instance. Everything here takes the store (or a `Caller`) so it can be
//! used both from the embedder and from inside host adapters.

use wasmtime::{AsContextMut, Func, Instance, StoreContextMut, Val};

use crate::function::{ForeignFunction, HostFunction, MAX_CLOSURE_ARITY};
use crate::instance::BridgeState;
use crate::memory::SharedMemory;
use crate::value::{ElementKind, HostArray, HostString, HostValue, MarshalError, TypedArray};

/// Maximum code units read per chunk when copying a module string.
pub const STRING_READ_CHUNK: usize = 500;

/// Longest string handled by the `$stringAllocate1_N` fast paths.
pub const STRING_FAST_PATH_MAX: usize = 10;

/// Packed representation of a module string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringWidth {
    /// Every code unit is below 256.
    OneByte,
    /// At least one code unit is 256 or above.
    TwoByte,
}

impl StringWidth {
    /// Narrowest width able to hold `units`.
    pub fn of(units: &[u16]) -> Self {
        if units.iter().fold(0u16, |acc, u| acc | u) < 256 {
            StringWidth::OneByte
        } else {
            StringWidth::TwoByte
        }
    }

    fn suffix(self) -> u8 {
        match self {
            StringWidth::OneByte => 1,
            StringWidth::TwoByte => 2,
        }
    }
}

/// A string allocated in the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleString {
    /// Module-side handle.
    pub handle: i32,
    /// Length in code units.
    pub length: usize,
    /// Packed width.
    pub width: StringWidth,
}

type Cx<'a> = StoreContextMut<'a, BridgeState>;

fn primary(cx: &Cx<'_>) -> Result<Instance, MarshalError> {
    cx.data().primary.ok_or(MarshalError::NotLinked)
}

fn lookup(cx: &mut Cx<'_>, name: &str) -> Result<Option<Func>, MarshalError> {
    let instance = primary(cx)?;
    Ok(instance.get_func(&mut *cx, name))
}

fn export(cx: &mut Cx<'_>, name: &str) -> Result<Func, MarshalError> {
    lookup(cx, name)?.ok_or_else(|| MarshalError::MissingExport(name.to_string()))
}

fn memory(cx: &Cx<'_>) -> Result<SharedMemory, MarshalError> {
    cx.data()
        .memory
        .ok_or_else(|| MarshalError::MissingExport("memory".to_string()))
}

fn call_i32(cx: &mut Cx<'_>, func: Func, name: &str, params: &[Val]) -> anyhow::Result<i32> {
    let mut results = [Val::I32(0)];
    func.call(&mut *cx, params, &mut results)?;
    results[0]
        .i32()
        .ok_or_else(|| MarshalError::UnexpectedResult(name.to_string()).into())
}

fn i32_arg(value: usize) -> Result<i32, MarshalError> {
    i32::try_from(value).map_err(|_| MarshalError::OutOfBounds {
        offset: value,
        len: 0,
        size: i32::MAX as usize,
    })
}

/// Copy a host string into the module.
pub fn string_to_module(
    mut store: impl AsContextMut<Data = BridgeState>,
    s: &HostString,
) -> anyhow::Result<ModuleString> {
    let mut cx = store.as_context_mut();
    let units = s.units();
    let width = StringWidth::of(units);
    let length = units.len();

    if width == StringWidth::OneByte && (1..=STRING_FAST_PATH_MAX).contains(&length) {
        let name = format!("$stringAllocate1_{}", length);
        if let Some(func) = lookup(&mut cx, &name)? {
            let params: Vec<Val> = units.iter().map(|u| Val::I32(i32::from(*u))).collect();
            let handle = call_i32(&mut cx, func, &name, &params)?;
            return Ok(ModuleString {
                handle,
                length,
                width,
            });
        }
    }

    let allocate = format!("$stringAllocate{}", width.suffix());
    let write = format!("$stringWrite{}", width.suffix());
    let allocate_fn = export(&mut cx, &allocate)?;
    let write_fn = export(&mut cx, &write)?;

    let handle = call_i32(&mut cx, allocate_fn, &allocate, &[Val::I32(i32_arg(length)?)])?;
    for (i, unit) in units.iter().enumerate() {
        let params = [
            Val::I32(handle),
            Val::I32(i32_arg(i)?),
            Val::I32(i32::from(*unit)),
        ];
        write_fn.call(&mut cx, &params, &mut [])?;
    }

    Ok(ModuleString {
        handle,
        length,
        width,
    })
}

/// Copy a module string into a host string, at most `STRING_READ_CHUNK`
/// code units at a time.
pub fn string_from_module(
    mut store: impl AsContextMut<Data = BridgeState>,
    s: ModuleString,
) -> anyhow::Result<HostString> {
    if s.length == 0 {
        return Ok(HostString::empty());
    }
    let mut cx = store.as_context_mut();
    let read = format!("$stringRead{}", s.width.suffix());
    let read_fn = export(&mut cx, &read)?;

    let mut result = HostString::empty();
    let mut start = 0;
    while start < s.length {
        let end = (start + STRING_READ_CHUNK).min(s.length);
        let mut chunk = Vec::with_capacity(end - start);
        for i in start..end {
            let unit = call_i32(&mut cx, read_fn, &read, &[Val::I32(s.handle), Val::I32(i32_arg(i)?)])?;
            chunk.push(unit as u16);
        }
        result = result.concat(&HostString::from_units(chunk));
        start = end;
    }
    Ok(result)
}

/// Build a host array from a module list via `$listLength` / `$listRead`.
pub fn list_from_module(
    mut store: impl AsContextMut<Data = BridgeState>,
    list: i32,
) -> anyhow::Result<HostArray> {
    let mut cx = store.as_context_mut();
    let length_fn = export(&mut cx, "$listLength")?;
    let read_fn = export(&mut cx, "$listRead")?;

    let length = call_i32(&mut cx, length_fn, "$listLength", &[Val::I32(list)])?;
    let array = HostArray::new();
    for i in 0..length.max(0) {
        let mut results = [Val::ExternRef(None)];
        read_fn.call(&mut cx, &[Val::I32(list), Val::I32(i)], &mut results)?;
        let value = match &results[0] {
            Val::ExternRef(r) => HostValue::from_extern(r.as_ref())?,
            _ => return Err(MarshalError::UnexpectedResult("$listRead".to_string()).into()),
        };
        array.push(value);
    }
    Ok(array)
}

/// Build a typed array of `kind` from a module list of numbers. Each element
/// goes through the element type's number conversion.
pub fn typed_array_from_module_list(
    mut store: impl AsContextMut<Data = BridgeState>,
    kind: ElementKind,
    list: i32,
) -> anyhow::Result<TypedArray> {
    let values = list_from_module(store.as_context_mut(), list)?
        .to_vec()
        .iter()
        .map(HostValue::as_number)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TypedArray::from_values(kind, &values))
}

/// Copy `len` bytes of linear memory starting at `ptr`.
pub fn bytes_from_module(
    mut store: impl AsContextMut<Data = BridgeState>,
    ptr: usize,
    len: usize,
) -> Result<Vec<u8>, MarshalError> {
    let cx = store.as_context_mut();
    memory(&cx)?.read(&cx, ptr, len)
}

/// Write `count` elements of `array`, from `start`, to linear memory at
/// `ptr` in little-endian order.
pub fn typed_array_to_module(
    mut store: impl AsContextMut<Data = BridgeState>,
    array: &TypedArray,
    start: usize,
    count: usize,
    ptr: usize,
) -> Result<(), MarshalError> {
    let mut cx = store.as_context_mut();
    let bytes = array.to_le_bytes(start, count)?;
    memory(&cx)?.write(&mut cx, ptr, &bytes)
}

/// Overwrite `count` elements of `array`, from `start`, with little-endian
/// data read from linear memory at `ptr`.
pub fn typed_array_from_module(
    mut store: impl AsContextMut<Data = BridgeState>,
    array: &TypedArray,
    start: usize,
    count: usize,
    ptr: usize,
) -> Result<(), MarshalError> {
    let cx = store.as_context_mut();
    let len = count
        .checked_mul(array.kind().width())
        .ok_or(MarshalError::OutOfBounds {
            offset: start,
            len: count,
            size: array.len(),
        })?;
    let bytes = memory(&cx)?.read(&cx, ptr, len)?;
    array.set_from_le_bytes(start, &bytes)
}

/// Call a module closure through its `$closureCallN` trampoline.
///
/// Missing arguments are passed as `undefined`; extra ones are dropped.
pub fn invoke_module_function(
    mut store: impl AsContextMut<Data = BridgeState>,
    function: &ForeignFunction,
    args: &[HostValue],
) -> anyhow::Result<HostValue> {
    let mut cx = store.as_context_mut();
    let arity = function.arity();
    if arity > MAX_CLOSURE_ARITY {
        return Err(MarshalError::UnsupportedArity(arity).into());
    }

    let trampoline = function.trampoline();
    let func = export(&mut cx, &trampoline)?;
    let argc = args.len().min(arity);

    let mut params = Vec::with_capacity(arity + 2);
    params.push(Val::I32(function.closure()));
    params.push(Val::I32(i32_arg(argc)?));
    for i in 0..arity {
        let arg = args.get(i).cloned().unwrap_or(HostValue::Undefined);
        params.push(Val::ExternRef(arg.to_extern()));
    }

    let mut results = [Val::ExternRef(None)];
    func.call(&mut cx, &params, &mut results)?;
    match &results[0] {
        Val::ExternRef(r) => Ok(HostValue::from_extern(r.as_ref())?),
        _ => Err(MarshalError::UnexpectedResult(trampoline).into()),
    }
}

/// Run a queued callback through `$invokeCallback`.
pub fn dispatch_callback(
    mut store: impl AsContextMut<Data = BridgeState>,
    callback: i32,
) -> anyhow::Result<()> {
    let mut cx = store.as_context_mut();
    let func = export(&mut cx, "$invokeCallback")?;
    func.call(&mut cx, &[Val::I32(callback)], &mut [])?;
    Ok(())
}

/// Deliver pending closure releases to `$releaseClosure`.
///
/// The export is optional; without it the queue is just cleared.
pub fn release_closures(mut store: impl AsContextMut<Data = BridgeState>) -> anyhow::Result<usize> {
    let mut cx = store.as_context_mut();
    let released = cx.data_mut().functions.take_released();
    if released.is_empty() {
        return Ok(0);
    }

    let Some(func) = lookup(&mut cx, "$releaseClosure")? else {
        return Ok(0);
    };
    for closure in &released {
        log::trace!("[bridge] releasing closure {}", closure);
        func.call(&mut cx, &[Val::I32(*closure)], &mut [])?;
    }
    Ok(released.len())
}

/// Call the cleanup function of every finalization registry whose target
/// is gone, passing the held value.
pub fn run_finalizers(mut store: impl AsContextMut<Data = BridgeState>) -> anyhow::Result<usize> {
    let mut cx = store.as_context_mut();
    let due = cx.data_mut().finalizers.collect();
    for (cleanup, held) in &due {
        let args = std::slice::from_ref(held);
        match cleanup {
            HostFunction::Native(f) => {
                f(args)?;
            }
            HostFunction::Module(f) => {
                invoke_module_function(&mut cx, f, args)?;
            }
        }
    }
    if !due.is_empty() {
        log::trace!("[bridge] ran {} finalizers", due.len());
    }
    Ok(due.len())
}
