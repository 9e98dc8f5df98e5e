//! Engine configuration and the compile entry points.
//!
//! The engine wraps a `wasmtime::Engine` together with the bridge
//! configuration. A process-wide engine can be installed with `init` and
//! fetched with `get`; tests and embedders that need several differently
//! configured engines construct them directly.

use std::io::{self, Read};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use spin::Mutex;
use wasmtime::ExternType;

use crate::capability::{probe, Capabilities};
use crate::js_string;
use crate::module::CompiledModule;
use crate::{BridgeConfig, BridgeError};

/// Global engine instance.
static ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

/// Initialize the engine with default configuration.
pub fn init() -> Result<(), BridgeError> {
    init_with_config(BridgeConfig::default())
}

/// Initialize the engine with custom configuration.
pub fn init_with_config(config: BridgeConfig) -> Result<(), BridgeError> {
    let engine = Engine::new(config)?;
    *ENGINE.lock() = Some(engine);
    log::info!("[bridge] engine initialized");
    Ok(())
}

/// Get a handle to the global engine.
pub fn get() -> Result<Engine, BridgeError> {
    ENGINE.lock().clone().ok_or(BridgeError::NotInitialized)
}

/// Compilation engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: wasmtime::Engine,
    config: Arc<BridgeConfig>,
}

impl Engine {
    /// Create a new engine with the given configuration.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config
            .wasm_reference_types(config.enable_reference_types)
            .wasm_bulk_memory(config.enable_bulk_memory)
            .wasm_simd(config.enable_simd)
            .max_wasm_stack(config.stack_size);
        if !config.enable_simd {
            wasm_config.wasm_relaxed_simd(false);
        }

        let inner = wasmtime::Engine::new(&wasm_config).map_err(BridgeError::Config)?;
        Ok(Engine {
            inner,
            config: Arc::new(config),
        })
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Underlying wasmtime engine.
    pub fn inner(&self) -> &wasmtime::Engine {
        &self.inner
    }

    /// Check that `bytes` form a module acceptable under `capabilities`.
    pub fn validate(&self, bytes: &[u8], capabilities: Capabilities) -> anyhow::Result<()> {
        self.compile_raw(bytes, capabilities).map(drop)
    }

    /// Compile `bytes` with an already negotiated capability set.
    pub fn compile(
        &self,
        bytes: &[u8],
        capabilities: Capabilities,
    ) -> Result<CompiledModule, BridgeError> {
        let module = self
            .compile_raw(bytes, capabilities)
            .map_err(BridgeError::Compile)?;
        Ok(CompiledModule::new(self.clone(), module, capabilities))
    }

    /// Probe capabilities, then compile fully buffered bytes.
    pub fn compile_from_bytes(&self, bytes: &[u8]) -> Result<CompiledModule, BridgeError> {
        let capabilities = probe(self);
        self.compile(bytes, capabilities)
    }

    /// Probe capabilities, then drain `source` and compile it.
    pub fn compile_from_stream<R: Read>(&self, source: R) -> Result<CompiledModule, BridgeError> {
        let capabilities = probe(self);
        let bytes = read_source(source, self.config.stream_chunk_size)?;
        log::debug!("[bridge] read {} bytes from module stream", bytes.len());
        self.compile(&bytes, capabilities)
    }

    /// Compile and enforce the capability contract. Errors are returned as
    /// produced by wasmtime.
    pub(crate) fn compile_raw(
        &self,
        bytes: &[u8],
        capabilities: Capabilities,
    ) -> anyhow::Result<wasmtime::Module> {
        let module = wasmtime::Module::from_binary(&self.inner, bytes)?;
        if capabilities.contains(Capabilities::STRING_BUILTINS) {
            self.check_string_builtins(&module)?;
        }
        Ok(module)
    }

    fn check_string_builtins(&self, module: &wasmtime::Module) -> anyhow::Result<()> {
        if !self.config.enable_string_builtins {
            bail!("string builtins are not enabled on this engine");
        }
        for import in module.imports() {
            if import.module() != js_string::NAMESPACE {
                continue;
            }
            let name = import.name();
            let builtin = js_string::Builtin::from_name(name)
                .ok_or_else(|| anyhow!("unknown string builtin `{}`", name))?;
            match import.ty() {
                ExternType::Func(ty) => builtin.check(&ty)?,
                _ => bail!("string builtin `{}` must be imported as a function", name),
            }
        }
        Ok(())
    }
}

/// Read a module source to the end in chunks of `chunk_size` bytes.
pub(crate) fn read_source<R: Read>(mut source: R, chunk_size: usize) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(bytes)
}
