//! Host function registry.
//!
//! Every function the module may import from the `host` namespace is a
//! variant of `HostImport`, declared once with its import name, arity and
//! adapter. The registry binds the whole table into a linker and checks a
//! module's declared imports against it before linking, so a misspelt name
//! or a wrong parameter count is reported by name instead of as a generic
//! link failure.

use std::fmt;

use wasmtime::{ExternRef, ExternType, Linker, Module};

use crate::host_buffer::*;
use crate::host_object::*;
use crate::host_system::*;
use crate::host_value::*;
use crate::instance::{BridgeState, Imports};
use crate::value::{HostValue, MarshalError};

/// Namespace of the built-in host table.
pub const HOST_NAMESPACE: &str = "host";

/// Namespace of the deferred loader import.
pub const DEFERRED_NAMESPACE: &str = "deferred";

/// Name of the deferred loader import.
pub const LOAD_MODULE: &str = "loadModule";

/// Slot under which deferred modules see the primary exports.
pub const PRIMARY_SLOT: &str = "module0";

/// Import resolution failures.
#[derive(Debug)]
pub enum LinkError {
    /// wasmtime could not resolve or type-check an import.
    Unresolved(wasmtime::Error),
    /// The module imports a `host` function that does not exist.
    UnknownHostImport(String),
    /// The module declares a `host` import with the wrong parameter count.
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    /// A `host` import is not declared as a function.
    NotAFunction(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Unresolved(e) => write!(f, "{}", e),
            LinkError::UnknownHostImport(name) => {
                write!(f, "unknown host import `{}`", name)
            }
            LinkError::ArityMismatch {
                name,
                expected,
                found,
            } => write!(
                f,
                "host import `{}` takes {} parameters, module declares {}",
                name, expected, found
            ),
            LinkError::NotAFunction(name) => {
                write!(f, "host import `{}` must be a function", name)
            }
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Unresolved(e) => Some(&**e),
            _ => None,
        }
    }
}

macro_rules! host_imports {
    ($( $variant:ident => $name:literal, $arity:literal, $adapter:path; )*) => {
        /// A function of the built-in host table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HostImport {
            $( $variant, )*
        }

        impl HostImport {
            /// Every entry of the table.
            pub const ALL: &'static [HostImport] = &[ $( HostImport::$variant, )* ];

            /// Import name in the `host` namespace.
            pub fn name(self) -> &'static str {
                match self {
                    $( HostImport::$variant => $name, )*
                }
            }

            /// Number of wasm parameters.
            pub fn arity(self) -> usize {
                match self {
                    $( HostImport::$variant => $arity, )*
                }
            }

            /// Look up an entry by import name.
            pub fn from_name(name: &str) -> Option<HostImport> {
                match name {
                    $( $name => Some(HostImport::$variant), )*
                    _ => None,
                }
            }

            /// Bind the adapter into `linker`.
            pub fn define(self, linker: &mut Linker<BridgeState>) -> anyhow::Result<()> {
                match self {
                    $( HostImport::$variant => {
                        linker.func_wrap(HOST_NAMESPACE, $name, $adapter)?;
                    } )*
                }
                Ok(())
            }
        }
    };
}

host_imports! {
    // ---- Console & platform ----
    Print => "print", 1, host_print;
    DateNow => "date_now", 0, host_date_now;
    PerformanceNow => "performance_now", 0, host_performance_now;
    GlobalThis => "global_this", 0, host_global_this;
    IsWindows => "is_windows", 0, host_is_windows;

    // ---- Timers & microtasks ----
    SetTimeout => "set_timeout", 2, host_set_timeout;
    SetInterval => "set_interval", 2, host_set_interval;
    ClearTimeout => "clear_timeout", 1, host_clear_timeout;
    ClearInterval => "clear_interval", 1, host_clear_interval;
    QueueMicrotask => "queue_microtask", 1, host_queue_microtask;

    // ---- Values ----
    TypeTag => "type_tag", 1, host_type_tag;
    Undefined => "undefined", 0, host_undefined;
    IsUndefined => "is_undefined", 1, host_is_undefined;
    Identical => "identical", 2, host_identical;
    BoxBool => "box_bool", 1, host_box_bool;
    UnboxBool => "unbox_bool", 1, host_unbox_bool;
    BoxNumber => "box_number", 1, host_box_number;
    UnboxNumber => "unbox_number", 1, host_unbox_number;
    ToDisplayString => "to_display_string", 1, host_to_display_string;
    IsError => "is_error", 1, host_is_error;
    ErrorMessage => "error_message", 1, host_error_message;

    // ---- Strings ----
    StringToModule => "string_to_module", 1, host_string_to_module;
    StringFromModule1 => "string_from_module_1", 2, host_string_from_module_1;
    StringFromModule2 => "string_from_module_2", 2, host_string_from_module_2;
    DecodeUtf8 => "decode_utf8", 2, host_decode_utf8;

    // ---- Arrays & objects ----
    ArrayNew => "array_new", 0, host_array_new;
    ArrayLength => "array_length", 1, host_array_length;
    ArrayGet => "array_get", 2, host_array_get;
    ArraySet => "array_set", 3, host_array_set;
    ArrayPush => "array_push", 2, host_array_push;
    ArrayFromModuleList => "array_from_module_list", 1, host_array_from_module_list;
    ObjectNew => "object_new", 0, host_object_new;
    ObjectGet => "object_get", 2, host_object_get;
    ObjectSet => "object_set", 3, host_object_set;
    ObjectHas => "object_has", 2, host_object_has;
    ObjectDelete => "object_delete", 2, host_object_delete;
    ObjectKeys => "object_keys", 1, host_object_keys;

    // ---- Functions ----
    WrapFunction0 => "wrap_function_0", 1, host_wrap_function_0;
    WrapFunction1 => "wrap_function_1", 1, host_wrap_function_1;
    WrapFunction2 => "wrap_function_2", 1, host_wrap_function_2;
    WrapFunction3 => "wrap_function_3", 1, host_wrap_function_3;
    IsModuleFunction => "is_module_function", 1, host_is_module_function;
    UnwrapFunction => "unwrap_function", 1, host_unwrap_function;
    CallFunction => "call_function", 2, host_call_function;

    // ---- Finalization ----
    FinalizationRegistryNew => "finalization_registry_new", 1, host_finalization_registry_new;
    FinalizationRegister => "finalization_register", 4, host_finalization_register;
    FinalizationUnregister => "finalization_unregister", 2, host_finalization_unregister;

    // ---- Array buffers & typed arrays ----
    ArrayBufferNew => "array_buffer_new", 1, host_array_buffer_new;
    ArrayBufferByteLength => "array_buffer_byte_length", 1, host_array_buffer_byte_length;
    TypedArrayNew => "typed_array_new", 2, host_typed_array_new;
    TypedArrayLength => "typed_array_length", 1, host_typed_array_length;
    TypedArrayGet => "typed_array_get", 2, host_typed_array_get;
    TypedArraySet => "typed_array_set", 3, host_typed_array_set;
    TypedArrayCopyFromModule => "typed_array_copy_from_module", 4, host_typed_array_copy_from_module;
    TypedArrayCopyToModule => "typed_array_copy_to_module", 4, host_typed_array_copy_to_module;
    TypedArrayFromModuleList => "typed_array_from_module_list", 2, host_typed_array_from_module_list;

    // ---- Data views ----
    DataViewNew => "data_view_new", 1, host_data_view_new;
    DataViewOf => "data_view_of", 3, host_data_view_of;
    DataViewByteLength => "data_view_byte_length", 1, host_data_view_byte_length;
    DataViewCopy => "data_view_copy", 3, host_data_view_copy;
    DataViewFromModule => "data_view_from_module", 2, host_data_view_from_module;
    DataViewGetInt8 => "data_view_get_int8", 2, host_data_view_get_int8;
    DataViewGetUint8 => "data_view_get_uint8", 2, host_data_view_get_uint8;
    DataViewGetInt16 => "data_view_get_int16", 3, host_data_view_get_int16;
    DataViewGetUint16 => "data_view_get_uint16", 3, host_data_view_get_uint16;
    DataViewGetInt32 => "data_view_get_int32", 3, host_data_view_get_int32;
    DataViewGetUint32 => "data_view_get_uint32", 3, host_data_view_get_uint32;
    DataViewGetBigInt64 => "data_view_get_big_int64", 3, host_data_view_get_big_int64;
    DataViewGetBigUint64 => "data_view_get_big_uint64", 3, host_data_view_get_big_uint64;
    DataViewGetFloat32 => "data_view_get_float32", 3, host_data_view_get_float32;
    DataViewGetFloat64 => "data_view_get_float64", 3, host_data_view_get_float64;
    DataViewSetInt8 => "data_view_set_int8", 3, host_data_view_set_int8;
    DataViewSetUint8 => "data_view_set_uint8", 3, host_data_view_set_uint8;
    DataViewSetInt16 => "data_view_set_int16", 4, host_data_view_set_int16;
    DataViewSetUint16 => "data_view_set_uint16", 4, host_data_view_set_uint16;
    DataViewSetInt32 => "data_view_set_int32", 4, host_data_view_set_int32;
    DataViewSetUint32 => "data_view_set_uint32", 4, host_data_view_set_uint32;
    DataViewSetBigInt64 => "data_view_set_big_int64", 4, host_data_view_set_big_int64;
    DataViewSetBigUint64 => "data_view_set_big_uint64", 4, host_data_view_set_big_uint64;
    DataViewSetFloat32 => "data_view_set_float32", 4, host_data_view_set_float32;
    DataViewSetFloat64 => "data_view_set_float64", 4, host_data_view_set_float64;
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Bind the whole host table.
pub fn register_all(linker: &mut Linker<BridgeState>) -> anyhow::Result<()> {
    for import in HostImport::ALL {
        import.define(linker)?;
    }
    log::debug!("[bridge] registered {} host functions", HostImport::ALL.len());
    Ok(())
}

/// Check the module's `host` imports against the table.
///
/// Names supplied by the caller's `Imports` are left to wasmtime's own type
/// check, since they replace the built-in entry.
pub fn validate_imports(module: &Module, overrides: &Imports) -> Result<(), LinkError> {
    for import in module.imports() {
        if import.module() != HOST_NAMESPACE || overrides.contains(HOST_NAMESPACE, import.name()) {
            continue;
        }

        let name = import.name();
        let entry = HostImport::from_name(name)
            .ok_or_else(|| LinkError::UnknownHostImport(name.to_string()))?;
        match import.ty() {
            ExternType::Func(ty) => {
                let found = ty.params().len();
                if found != entry.arity() {
                    return Err(LinkError::ArityMismatch {
                        name: name.to_string(),
                        expected: entry.arity(),
                        found,
                    });
                }
            }
            _ => return Err(LinkError::NotAFunction(name.to_string())),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Adapter helpers
// ---------------------------------------------------------------------------

/// Host value behind an incoming reference.
pub(crate) fn arg(r: &Option<ExternRef>) -> Result<HostValue, MarshalError> {
    HostValue::from_extern(r.as_ref())
}

/// Non-negative index or length received from the module.
pub(crate) fn index(value: i32) -> Result<usize, MarshalError> {
    usize::try_from(value).map_err(|_| MarshalError::OutOfBounds {
        offset: 0,
        len: 0,
        size: 0,
    })
}

/// Length or count reported back to the module.
pub(crate) fn count(value: usize) -> Result<i32, MarshalError> {
    i32::try_from(value).map_err(|_| MarshalError::OutOfBounds {
        offset: value,
        len: 0,
        size: i32::MAX as usize,
    })
}
