//! Array, object and function adapters.

use wasmtime::{Caller, ExternRef};

use crate::finalization::FinalizationRegistry;
use crate::function::HostFunction;
use crate::host::{arg, count, index};
use crate::instance::BridgeState;
use crate::marshal;
use crate::value::{HostArray, HostObject, HostValue, MarshalError};

type Ref = Option<ExternRef>;

// ---------------------------------------------------------------------------
// Arrays
// ---------------------------------------------------------------------------

/// array_new() -> externref
pub(crate) fn host_array_new() -> Ref {
    HostValue::Array(HostArray::new()).to_extern()
}

/// array_length(array) -> i32
pub(crate) fn host_array_length(array: Ref) -> anyhow::Result<i32> {
    Ok(count(arg(&array)?.as_array()?.len())?)
}

/// array_get(array, index) -> externref
pub(crate) fn host_array_get(array: Ref, i: i32) -> anyhow::Result<Ref> {
    let array = arg(&array)?;
    Ok(array.as_array()?.get(index(i)?).to_extern())
}

/// array_set(array, index, value)
pub(crate) fn host_array_set(array: Ref, i: i32, value: Ref) -> anyhow::Result<()> {
    arg(&array)?.as_array()?.set(index(i)?, arg(&value)?);
    Ok(())
}

/// array_push(array, value)
pub(crate) fn host_array_push(array: Ref, value: Ref) -> anyhow::Result<()> {
    arg(&array)?.as_array()?.push(arg(&value)?);
    Ok(())
}

/// array_from_module_list(list) -> externref
pub(crate) fn host_array_from_module_list(
    mut caller: Caller<'_, BridgeState>,
    list: i32,
) -> anyhow::Result<Ref> {
    let array = marshal::list_from_module(&mut caller, list)?;
    Ok(HostValue::Array(array).to_extern())
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// object_new() -> externref
pub(crate) fn host_object_new() -> Ref {
    HostValue::Object(HostObject::new()).to_extern()
}

/// object_get(object, key) -> externref (undefined when absent)
pub(crate) fn host_object_get(object: Ref, key: Ref) -> anyhow::Result<Ref> {
    let object = arg(&object)?;
    let key = arg(&key)?;
    let value = object
        .as_object()?
        .get(key.as_string()?)
        .unwrap_or(HostValue::Undefined);
    Ok(value.to_extern())
}

/// object_set(object, key, value)
pub(crate) fn host_object_set(object: Ref, key: Ref, value: Ref) -> anyhow::Result<()> {
    let key = arg(&key)?.as_string()?.clone();
    arg(&object)?.as_object()?.set(key, arg(&value)?);
    Ok(())
}

/// object_has(object, key) -> i32
pub(crate) fn host_object_has(object: Ref, key: Ref) -> anyhow::Result<i32> {
    let key = arg(&key)?;
    Ok(arg(&object)?.as_object()?.has(key.as_string()?) as i32)
}

/// object_delete(object, key) -> i32
pub(crate) fn host_object_delete(object: Ref, key: Ref) -> anyhow::Result<i32> {
    let key = arg(&key)?;
    Ok(arg(&object)?.as_object()?.delete(key.as_string()?) as i32)
}

/// object_keys(object) -> externref (array of strings)
pub(crate) fn host_object_keys(object: Ref) -> anyhow::Result<Ref> {
    let keys = arg(&object)?
        .as_object()?
        .keys()
        .into_iter()
        .map(HostValue::String)
        .collect();
    Ok(HostValue::Array(HostArray::from_values(keys)).to_extern())
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

fn wrap_function(caller: &mut Caller<'_, BridgeState>, closure: i32, arity: usize) -> Ref {
    let function = caller.data_mut().functions.wrap(closure, arity);
    HostValue::Function(HostFunction::Module(function)).to_extern()
}

/// wrap_function_0(closure) -> externref
pub(crate) fn host_wrap_function_0(mut caller: Caller<'_, BridgeState>, closure: i32) -> Ref {
    wrap_function(&mut caller, closure, 0)
}

/// wrap_function_1(closure) -> externref
pub(crate) fn host_wrap_function_1(mut caller: Caller<'_, BridgeState>, closure: i32) -> Ref {
    wrap_function(&mut caller, closure, 1)
}

/// wrap_function_2(closure) -> externref
pub(crate) fn host_wrap_function_2(mut caller: Caller<'_, BridgeState>, closure: i32) -> Ref {
    wrap_function(&mut caller, closure, 2)
}

/// wrap_function_3(closure) -> externref
pub(crate) fn host_wrap_function_3(mut caller: Caller<'_, BridgeState>, closure: i32) -> Ref {
    wrap_function(&mut caller, closure, 3)
}

/// is_module_function(value) -> i32
pub(crate) fn host_is_module_function(value: Ref) -> anyhow::Result<i32> {
    Ok(match arg(&value)? {
        HostValue::Function(f) => f.is_module_function() as i32,
        _ => 0,
    })
}

/// unwrap_function(function) -> closure
pub(crate) fn host_unwrap_function(value: Ref) -> anyhow::Result<i32> {
    match arg(&value)? {
        HostValue::Function(HostFunction::Module(f)) => Ok(f.closure()),
        _ => Err(MarshalError::NotModuleFunction.into()),
    }
}

/// call_function(function, args) -> externref
pub(crate) fn host_call_function(
    mut caller: Caller<'_, BridgeState>,
    function: Ref,
    args: Ref,
) -> anyhow::Result<Ref> {
    let function = arg(&function)?;
    let args = match arg(&args)? {
        HostValue::Undefined | HostValue::Null => Vec::new(),
        other => other.as_array()?.to_vec(),
    };
    let result = match function.as_function()? {
        HostFunction::Native(f) => f(&args)?,
        HostFunction::Module(f) => marshal::invoke_module_function(&mut caller, f, &args)?,
    };
    Ok(result.to_extern())
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

/// finalization_registry_new(cleanup) -> externref
pub(crate) fn host_finalization_registry_new(
    mut caller: Caller<'_, BridgeState>,
    cleanup: Ref,
) -> anyhow::Result<Ref> {
    let cleanup = arg(&cleanup)?.as_function()?.clone();
    let registry = FinalizationRegistry::new(cleanup);
    caller.data_mut().finalizers.track(&registry);
    Ok(HostValue::FinalizationRegistry(registry).to_extern())
}

/// finalization_register(registry, target, held, token); a null token
/// cannot be unregistered
pub(crate) fn host_finalization_register(
    registry: Ref,
    target: Ref,
    held: Ref,
    token: Ref,
) -> anyhow::Result<()> {
    let registry = arg(&registry)?;
    let token = match arg(&token)? {
        HostValue::Null => None,
        token => Some(token),
    };
    registry
        .as_finalization_registry()?
        .register(&arg(&target)?, arg(&held)?, token.as_ref())?;
    Ok(())
}

/// finalization_unregister(registry, token) -> i32
pub(crate) fn host_finalization_unregister(registry: Ref, token: Ref) -> anyhow::Result<i32> {
    let registry = arg(&registry)?;
    Ok(registry
        .as_finalization_registry()?
        .unregister(&arg(&token)?)? as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HostString;

    fn value(r: Ref) -> HostValue {
        HostValue::from_extern(r.as_ref()).unwrap()
    }

    #[test]
    fn test_array_adapters() {
        let array = host_array_new();
        host_array_push(array.clone(), host_object_new()).unwrap();
        host_array_set(array.clone(), 2, HostValue::from(5.0).to_extern()).unwrap();
        assert_eq!(host_array_length(array.clone()).unwrap(), 3);
        assert!(value(host_array_get(array.clone(), 1).unwrap()).is_undefined());
        assert_eq!(
            value(host_array_get(array.clone(), 2).unwrap()).as_number().unwrap(),
            5.0
        );
        assert!(host_array_get(array, -1).is_err());
        assert!(host_array_length(host_object_new()).is_err());
    }

    #[test]
    fn test_object_adapters() {
        let object = host_object_new();
        let key = HostValue::from("name").to_extern();
        host_object_set(object.clone(), key.clone(), HostValue::from("kpio").to_extern()).unwrap();
        assert_eq!(host_object_has(object.clone(), key.clone()).unwrap(), 1);
        assert_eq!(
            value(host_object_get(object.clone(), key.clone()).unwrap())
                .as_string()
                .unwrap(),
            &HostString::from("kpio")
        );

        let keys = value(host_object_keys(object.clone()).unwrap());
        assert_eq!(keys.as_array().unwrap().len(), 1);

        assert_eq!(host_object_delete(object.clone(), key.clone()).unwrap(), 1);
        assert!(value(host_object_get(object, key).unwrap()).is_undefined());
    }

    #[test]
    fn test_object_key_must_be_string() {
        let object = host_object_new();
        assert!(host_object_get(object, HostValue::from(1.0).to_extern()).is_err());
    }

    #[test]
    fn test_unwrap_rejects_native_functions() {
        let native = HostValue::Function(HostFunction::native(|_| Ok(HostValue::Undefined)));
        let native = native.to_extern();
        assert_eq!(host_is_module_function(native.clone()).unwrap(), 0);
        let err = host_unwrap_function(native).unwrap_err();
        assert_eq!(
            err.downcast_ref::<MarshalError>(),
            Some(&MarshalError::NotModuleFunction)
        );
        assert!(host_unwrap_function(host_object_new()).is_err());
    }
}
