//! KPIO WASM Bridge
//!
//! This crate hosts application modules on top of wasmtime. It compiles a
//! module after negotiating optional engine capabilities, instantiates it
//! against a large table of host functions, links deferred sub-modules into
//! the already running instance, and marshals host values across the
//! boundary.
//!
//! # Architecture
//!
//! - `capability`: Capability probing (`Capabilities`, `probe`)
//! - `engine`: Engine configuration, validation and the compile entry points
//! - `module`: `CompiledModule` and the `instantiate` step
//! - `instance`: `InstantiatedModule`, store data and caller-supplied imports
//! - `host`: Host function registry (`HostImport`) and import validation
//! - `host_system` / `host_value` / `host_object` / `host_buffer`: Host adapters
//! - `js_string`: `wasm:js-string` builtins and polyfill
//! - `value`: Host value model (strings, arrays, buffers, objects, type tags)
//! - `marshal`: Conversions that go through the module's reserved exports
//! - `function`: Module function wrappers and release notifications
//! - `finalization`: Finalization registries over weak host values
//! - `memory`: Shared linear memory handle
//! - `timer`: Timer and microtask queue
//! - `deferred`: Deferred module loader and registry

pub mod capability;
pub mod deferred;
pub mod engine;
pub mod finalization;
pub mod function;
pub mod host;
pub mod host_buffer;
pub mod host_object;
pub mod host_system;
pub mod host_value;
pub mod instance;
pub mod js_string;
pub mod marshal;
pub mod memory;
pub mod module;
pub mod timer;
pub mod value;

use std::fmt;
use std::io::Read;

pub use capability::{probe, Capabilities};
pub use deferred::{
    DeferredLoadError, DeferredLoadRecord, DeferredSource, DirectoryLoader, LoadDeferredWasm,
    LoadState, StaticLoader,
};
pub use engine::Engine;
pub use finalization::FinalizationRegistry;
pub use function::{ForeignFunction, HostFunction};
pub use host::{HostImport, LinkError};
pub use instance::{BridgeState, Imports, InstantiatedModule, ENTRY_POINT};
pub use js_string::StringBuiltins;
pub use marshal::{ModuleString, StringWidth};
pub use memory::SharedMemory;
pub use module::{CompiledModule, InstantiateOptions};
pub use value::{
    ArrayBuffer, DataView, ElementKind, HostArray, HostError, HostObject, HostString, HostValue,
    MarshalError, TypedArray, ValueKind,
};

/// Bridge error types.
#[derive(Debug)]
pub enum BridgeError {
    /// The global engine has not been initialized.
    NotInitialized,
    /// The engine rejected the configuration.
    Config(wasmtime::Error),
    /// Malformed binary, or one incompatible with the negotiated capabilities.
    Compile(wasmtime::Error),
    /// Import resolution failed.
    Link(LinkError),
    /// A deferred module could not be fetched, compiled or linked.
    DeferredLoad(DeferredLoadError),
    /// A value could not be converted across the boundary.
    Marshal(MarshalError),
    /// Trap or host error raised while running module code.
    Execution(wasmtime::Error),
    /// Reading a module source failed.
    Io(std::io::Error),
}

impl BridgeError {
    /// Classify an error that surfaced from a module call.
    ///
    /// Marshalling failures raised by host adapters trap the module; they are
    /// recovered here so callers can match on them.
    pub(crate) fn from_trap(error: wasmtime::Error) -> Self {
        match error.downcast::<MarshalError>() {
            Ok(marshal) => BridgeError::Marshal(marshal),
            Err(error) => BridgeError::Execution(error),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::NotInitialized => write!(f, "engine not initialized"),
            BridgeError::Config(e) => write!(f, "invalid engine configuration: {}", e),
            BridgeError::Compile(e) => write!(f, "compilation failed: {}", e),
            BridgeError::Link(e) => write!(f, "link failed: {}", e),
            BridgeError::DeferredLoad(e) => write!(f, "deferred load failed: {}", e),
            BridgeError::Marshal(e) => write!(f, "marshalling failed: {}", e),
            BridgeError::Execution(e) => write!(f, "execution failed: {}", e),
            BridgeError::Io(e) => write!(f, "reading module source failed: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::NotInitialized => None,
            BridgeError::Config(e) | BridgeError::Compile(e) | BridgeError::Execution(e) => {
                Some(&**e)
            }
            BridgeError::Link(e) => Some(e),
            BridgeError::DeferredLoad(e) => Some(e),
            BridgeError::Marshal(e) => Some(e),
            BridgeError::Io(e) => Some(e),
        }
    }
}

impl From<LinkError> for BridgeError {
    fn from(e: LinkError) -> Self {
        BridgeError::Link(e)
    }
}

impl From<MarshalError> for BridgeError {
    fn from(e: MarshalError) -> Self {
        BridgeError::Marshal(e)
    }
}

impl From<DeferredLoadError> for BridgeError {
    fn from(e: DeferredLoadError) -> Self {
        BridgeError::DeferredLoad(e)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e)
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Enable reference types (externref is the carrier for host values).
    pub enable_reference_types: bool,
    /// Enable bulk memory operations.
    pub enable_bulk_memory: bool,
    /// Enable SIMD instructions.
    pub enable_simd: bool,
    /// Let the engine recognise `wasm:js-string` imports as builtins.
    pub enable_string_builtins: bool,
    /// Bind the `wasm:js-string` polyfill when the builtins are not negotiated.
    pub string_polyfill: bool,
    /// Maximum memory per store (in pages, 64KB each).
    pub max_memory_pages: u32,
    /// Maximum wasm stack size in bytes.
    pub stack_size: usize,
    /// Cache compiled deferred modules by name.
    pub cache_deferred_modules: bool,
    /// Read size used when draining a streaming module source.
    pub stream_chunk_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            enable_reference_types: true,
            enable_bulk_memory: true,
            enable_simd: true,
            enable_string_builtins: true,
            string_polyfill: true,
            max_memory_pages: 16384, // 1 GB
            stack_size: 1024 * 1024, // 1 MB
            cache_deferred_modules: false,
            stream_chunk_size: 64 * 1024,
        }
    }
}

/// Initialize the global engine with the default configuration.
pub fn init() -> Result<(), BridgeError> {
    engine::init()
}

/// Initialize the global engine with a custom configuration.
pub fn init_with_config(config: BridgeConfig) -> Result<(), BridgeError> {
    engine::init_with_config(config)
}

/// Compile a module from fully buffered bytes using the global engine.
pub fn compile_from_bytes(bytes: &[u8]) -> Result<CompiledModule, BridgeError> {
    engine::get()?.compile_from_bytes(bytes)
}

/// Compile a module from a streaming source using the global engine.
pub fn compile_from_stream<R: Read>(source: R) -> Result<CompiledModule, BridgeError> {
    engine::get()?.compile_from_stream(source)
}
