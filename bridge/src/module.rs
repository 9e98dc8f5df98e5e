//! Compiled modules and instantiation.

use std::fmt;
use std::sync::Arc;

use wasmtime::{Linker, Store, StoreLimitsBuilder};

use crate::capability::Capabilities;
use crate::deferred::{self, LoadDeferredWasm};
use crate::engine::Engine;
use crate::host::{self, LinkError, DEFERRED_NAMESPACE, LOAD_MODULE, PRIMARY_SLOT};
use crate::instance::{BridgeState, Imports, InstantiatedModule};
use crate::js_string;
use crate::memory::{SharedMemory, PAGE_SIZE};
use crate::BridgeError;

/// Options for `CompiledModule::instantiate`.
#[derive(Clone, Default)]
pub struct InstantiateOptions {
    /// Strategy used when the module requests a deferred module.
    pub load_deferred_wasm: Option<Arc<dyn LoadDeferredWasm>>,
}

impl InstantiateOptions {
    /// Options without a deferred loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deferred loader.
    pub fn with_loader(mut self, loader: impl LoadDeferredWasm + 'static) -> Self {
        self.load_deferred_wasm = Some(Arc::new(loader));
        self
    }
}

impl fmt::Debug for InstantiateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstantiateOptions")
            .field("load_deferred_wasm", &self.load_deferred_wasm.is_some())
            .finish()
    }
}

struct CompiledInner {
    engine: Engine,
    module: wasmtime::Module,
    capabilities: Capabilities,
}

/// A compiled module plus the capability set it was compiled with.
///
/// Immutable and cheap to clone. Every `instantiate` call creates an
/// independent store and instance.
#[derive(Clone)]
pub struct CompiledModule(Arc<CompiledInner>);

impl CompiledModule {
    pub(crate) fn new(engine: Engine, module: wasmtime::Module, capabilities: Capabilities) -> Self {
        CompiledModule(Arc::new(CompiledInner {
            engine,
            module,
            capabilities,
        }))
    }

    /// Capabilities negotiated for this module.
    pub fn capabilities(&self) -> Capabilities {
        self.0.capabilities
    }

    /// Engine that compiled the module.
    pub fn engine(&self) -> &Engine {
        &self.0.engine
    }

    /// Underlying wasmtime module.
    pub fn module(&self) -> &wasmtime::Module {
        &self.0.module
    }

    /// Declared imports as `(namespace, name)` pairs.
    pub fn imports(&self) -> Vec<(String, String)> {
        self.0
            .module
            .imports()
            .map(|i| (i.module().to_string(), i.name().to_string()))
            .collect()
    }

    /// Declared export names.
    pub fn exports(&self) -> Vec<String> {
        self.0
            .module
            .exports()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Link the module against the host table and `imports`, and create an
    /// instance.
    ///
    /// Caller imports shadow built-in entries with the same name. The
    /// `deferred.loadModule` import is always available to the primary
    /// module; a missing loader only surfaces when a load is requested.
    pub fn instantiate(
        &self,
        imports: Imports,
        options: InstantiateOptions,
    ) -> Result<InstantiatedModule, BridgeError> {
        host::validate_imports(self.module(), &imports)?;

        let engine = self.engine();
        let mut linker: Linker<BridgeState> = Linker::new(engine.inner());
        linker.allow_shadowing(true);
        host::register_all(&mut linker).map_err(LinkError::Unresolved)?;
        imports.apply(&mut linker).map_err(LinkError::Unresolved)?;
        let string_builtins = js_string::bind(&mut linker, self.capabilities(), engine.config())
            .map_err(LinkError::Unresolved)?;

        // Deferred modules get everything above plus `module0`, but no loader.
        let mut deferred_linker = linker.clone();
        linker
            .func_wrap(DEFERRED_NAMESPACE, LOAD_MODULE, deferred::host_load_module)
            .map_err(LinkError::Unresolved)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(engine.config().max_memory_pages as usize * PAGE_SIZE)
            .build();
        let state = BridgeState::new(
            engine.clone(),
            self.capabilities(),
            string_builtins,
            limits,
            options.load_deferred_wasm,
        );
        let mut store = Store::new(engine.inner(), state);
        store.limiter(|state| &mut state.limits);

        let instance = linker
            .instantiate(&mut store, self.module())
            .map_err(LinkError::Unresolved)?;
        deferred_linker
            .instance(&mut store, PRIMARY_SLOT, instance)
            .map_err(LinkError::Unresolved)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .map(SharedMemory::new);
        let state = store.data_mut();
        state.primary = Some(instance);
        state.memory = memory;
        state.deferred.set_linker(deferred_linker);

        log::info!(
            "[bridge] instantiated module ({} imports, {} exports, strings: {:?})",
            self.module().imports().len(),
            self.module().exports().len(),
            string_builtins
        );
        Ok(InstantiatedModule::new(store, instance, self.clone()))
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("capabilities", &self.0.capabilities)
            .finish()
    }
}
