//! Deferred module loading.
//!
//! A running module asks for a sub-module by name through the
//! `deferred.loadModule` import. The bytes come from the session's
//! `LoadDeferredWasm` strategy; they are compiled with the session's
//! capability set and linked against the primary instance, whose exports
//! (memory, table, functions) are visible under the `module0` slot.
//!
//! A failed load never traps the caller. The import returns an error value
//! the module can inspect with `host.is_error` / `host.error_message`, and
//! the primary instance stays usable.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use wasmtime::{Caller, ExternRef, Instance, Linker};

use crate::capability::Capabilities;
use crate::engine::read_source;
use crate::instance::BridgeState;
use crate::value::{HostError, HostValue};

// ---------------------------------------------------------------------------
// Sources & loaders
// ---------------------------------------------------------------------------

/// Bytes of a deferred module.
pub enum DeferredSource {
    /// Fully buffered module.
    Bytes(Vec<u8>),
    /// Module read from a stream.
    Stream(Box<dyn Read + Send>),
}

impl DeferredSource {
    fn into_bytes(self, chunk_size: usize) -> io::Result<Vec<u8>> {
        match self {
            DeferredSource::Bytes(bytes) => Ok(bytes),
            DeferredSource::Stream(reader) => read_source(reader, chunk_size),
        }
    }
}

impl fmt::Debug for DeferredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredSource::Bytes(b) => write!(f, "DeferredSource::Bytes({})", b.len()),
            DeferredSource::Stream(_) => write!(f, "DeferredSource::Stream"),
        }
    }
}

/// Strategy for obtaining deferred module bytes by logical name.
pub trait LoadDeferredWasm: Send + Sync {
    /// Fetch the module called `name`.
    fn load(&self, name: &str) -> anyhow::Result<DeferredSource>;
}

impl<F> LoadDeferredWasm for F
where
    F: Fn(&str) -> anyhow::Result<DeferredSource> + Send + Sync,
{
    fn load(&self, name: &str) -> anyhow::Result<DeferredSource> {
        self(name)
    }
}

/// Serves modules from memory.
#[derive(Debug, Default, Clone)]
pub struct StaticLoader {
    modules: HashMap<String, Vec<u8>>,
}

impl StaticLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register module bytes under `name`.
    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> &mut Self {
        self.modules.insert(name.into(), bytes);
        self
    }

    /// Builder form of `insert`.
    pub fn with(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(name, bytes);
        self
    }
}

impl LoadDeferredWasm for StaticLoader {
    fn load(&self, name: &str) -> anyhow::Result<DeferredSource> {
        self.modules
            .get(name)
            .cloned()
            .map(DeferredSource::Bytes)
            .ok_or_else(|| anyhow!("no deferred module named `{}`", name))
    }
}

/// Streams `<root>/<name>.wasm` from disk.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    root: PathBuf,
}

impl DirectoryLoader {
    /// Serve modules from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryLoader { root: root.into() }
    }
}

impl LoadDeferredWasm for DirectoryLoader {
    fn load(&self, name: &str) -> anyhow::Result<DeferredSource> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            bail!("invalid deferred module name `{}`", name);
        }
        let path = self.root.join(format!("{}.wasm", name));
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        Ok(DeferredSource::Stream(Box::new(file)))
    }
}

// ---------------------------------------------------------------------------
// Load state machine
// ---------------------------------------------------------------------------

/// Progress of one deferred load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Fetching,
    Compiling,
    Linking,
    Linked,
    Failed,
}

impl LoadState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadState::Linked | LoadState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: LoadState) -> bool {
        use LoadState::*;
        match (self, next) {
            (Idle, Fetching) | (Fetching, Compiling) | (Compiling, Linking) | (Linking, Linked) => {
                true
            }
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Deferred load failures.
#[derive(Debug)]
pub enum DeferredLoadError {
    /// The session has no loader.
    NoLoader,
    /// The loader rejected the request.
    Fetch(anyhow::Error),
    /// Reading a streamed source failed.
    Source(io::Error),
    /// The bytes did not compile.
    Compile(anyhow::Error),
    /// Linking against the primary instance failed.
    Link(anyhow::Error),
    /// Illegal state transition.
    InvalidTransition { from: LoadState, to: LoadState },
}

impl fmt::Display for DeferredLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredLoadError::NoLoader => write!(f, "no deferred module loader configured"),
            DeferredLoadError::Fetch(e) => write!(f, "fetch failed: {:#}", e),
            DeferredLoadError::Source(e) => write!(f, "reading module source failed: {}", e),
            DeferredLoadError::Compile(e) => write!(f, "compilation failed: {:#}", e),
            DeferredLoadError::Link(e) => write!(f, "link failed: {:#}", e),
            DeferredLoadError::InvalidTransition { from, to } => {
                write!(f, "invalid load transition {:?} -> {:?}", from, to)
            }
        }
    }
}

impl std::error::Error for DeferredLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeferredLoadError::Fetch(e)
            | DeferredLoadError::Compile(e)
            | DeferredLoadError::Link(e) => Some(&**e),
            DeferredLoadError::Source(e) => Some(e),
            _ => None,
        }
    }
}

/// Record of one load request.
#[derive(Clone)]
pub struct DeferredLoadRecord {
    name: String,
    state: LoadState,
    capabilities: Capabilities,
    instance: Option<Instance>,
    error: Option<String>,
}

impl DeferredLoadRecord {
    fn new(name: &str, capabilities: Capabilities) -> Self {
        DeferredLoadRecord {
            name: name.to_string(),
            state: LoadState::Idle,
            capabilities,
            instance: None,
            error: None,
        }
    }

    fn advance(&mut self, next: LoadState) -> Result<(), DeferredLoadError> {
        if !self.state.can_advance_to(next) {
            return Err(DeferredLoadError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::trace!("[deferred] `{}`: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Requested module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current (terminal once the call returned) state.
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Capability set the module was compiled with.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Linked instance.
    pub fn instance(&self) -> Option<Instance> {
        self.instance
    }

    /// Failure message.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl fmt::Debug for DeferredLoadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredLoadRecord")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .field("linked", &self.instance.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// A linked deferred module, as seen by the module that requested it.
#[derive(Clone)]
pub struct DeferredModule(Arc<DeferredInner>);

struct DeferredInner {
    name: String,
    instance: Instance,
}

impl DeferredModule {
    /// Logical module name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The deferred instance.
    pub fn instance(&self) -> Instance {
        self.0.instance
    }

    /// Whether both handles come from the same load.
    pub fn ptr_eq(a: &DeferredModule, b: &DeferredModule) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for DeferredModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeferredModule({})", self.0.name)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Load records kept per session; older ones are dropped first.
pub const MAX_LOAD_RECORDS: usize = 256;

/// Per-session deferred loading state.
pub(crate) struct DeferredRegistry {
    loader: Option<Arc<dyn LoadDeferredWasm>>,
    linker: Option<Linker<BridgeState>>,
    records: Vec<DeferredLoadRecord>,
    cache: Option<HashMap<String, wasmtime::Module>>,
}

impl DeferredRegistry {
    pub(crate) fn new(loader: Option<Arc<dyn LoadDeferredWasm>>, cache: bool) -> Self {
        DeferredRegistry {
            loader,
            linker: None,
            records: Vec::new(),
            cache: cache.then(HashMap::new),
        }
    }

    /// Install the linker deferred modules are instantiated with.
    pub(crate) fn set_linker(&mut self, linker: Linker<BridgeState>) {
        self.linker = Some(linker);
    }

    pub(crate) fn records(&self) -> &[DeferredLoadRecord] {
        &self.records
    }

    pub(crate) fn push_record(&mut self, record: DeferredLoadRecord) {
        if self.records.len() >= MAX_LOAD_RECORDS {
            let excess = self.records.len() + 1 - MAX_LOAD_RECORDS;
            self.records.drain(..excess);
        }
        self.records.push(record);
    }
}

// ---------------------------------------------------------------------------
// loadModule import
// ---------------------------------------------------------------------------

/// deferred.loadModule(name) -> externref (module or error value)
pub(crate) fn host_load_module(
    mut caller: Caller<'_, BridgeState>,
    name: Option<ExternRef>,
) -> anyhow::Result<Option<ExternRef>> {
    let name = HostValue::from_extern(name.as_ref())?
        .as_string()?
        .to_string_lossy();

    let value = match load(&mut caller, &name) {
        Ok(module) => {
            log::info!("[deferred] linked `{}`", name);
            HostValue::Module(module)
        }
        Err(e) => {
            log::warn!("[deferred] loading `{}` failed: {}", name, e);
            HostValue::Error(HostError::new(e.into()))
        }
    };
    Ok(value.to_extern())
}

fn load(caller: &mut Caller<'_, BridgeState>, name: &str) -> Result<DeferredModule, DeferredLoadError> {
    let mut record = DeferredLoadRecord::new(name, caller.data().capabilities);
    let result = run(caller, &mut record);

    if let Err(e) = &result {
        if !record.state.is_terminal() {
            record.state = LoadState::Failed;
        }
        record.error = Some(e.to_string());
    }
    caller.data_mut().deferred.push_record(record);
    result
}

fn run(
    caller: &mut Caller<'_, BridgeState>,
    record: &mut DeferredLoadRecord,
) -> Result<DeferredModule, DeferredLoadError> {
    record.advance(LoadState::Fetching)?;
    let cached = caller
        .data()
        .deferred
        .cache
        .as_ref()
        .and_then(|cache| cache.get(&record.name).cloned());

    let module = match cached {
        Some(module) => {
            log::debug!("[deferred] `{}` served from cache", record.name);
            record.advance(LoadState::Compiling)?;
            module
        }
        None => {
            let loader = caller
                .data()
                .deferred
                .loader
                .clone()
                .ok_or(DeferredLoadError::NoLoader)?;
            let source = loader.load(&record.name).map_err(DeferredLoadError::Fetch)?;

            record.advance(LoadState::Compiling)?;
            let engine = caller.data().engine.clone();
            let bytes = source
                .into_bytes(engine.config().stream_chunk_size)
                .map_err(DeferredLoadError::Source)?;
            let module = engine
                .compile_raw(&bytes, record.capabilities)
                .map_err(DeferredLoadError::Compile)?;

            if let Some(cache) = caller.data_mut().deferred.cache.as_mut() {
                cache.insert(record.name.clone(), module.clone());
            }
            module
        }
    };

    record.advance(LoadState::Linking)?;
    let linker = caller
        .data()
        .deferred
        .linker
        .clone()
        .ok_or_else(|| DeferredLoadError::Link(anyhow!("primary instance is not linked")))?;
    let instance = linker
        .instantiate(&mut *caller, &module)
        .map_err(DeferredLoadError::Link)?;

    record.advance(LoadState::Linked)?;
    record.instance = Some(instance);
    Ok(DeferredModule(Arc::new(DeferredInner {
        name: record.name.clone(),
        instance,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use LoadState::*;
        assert!(Idle.can_advance_to(Fetching));
        assert!(Fetching.can_advance_to(Compiling));
        assert!(Compiling.can_advance_to(Linking));
        assert!(Linking.can_advance_to(Linked));
        assert!(Idle.can_advance_to(Failed));
        assert!(Linking.can_advance_to(Failed));

        assert!(!Idle.can_advance_to(Linked));
        assert!(!Fetching.can_advance_to(Linking));
        assert!(!Linked.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Fetching));
    }

    #[test]
    fn test_record_rejects_skipped_state() {
        let mut record = DeferredLoadRecord::new("chunk_1", Capabilities::empty());
        record.advance(LoadState::Fetching).unwrap();
        assert!(matches!(
            record.advance(LoadState::Linked),
            Err(DeferredLoadError::InvalidTransition {
                from: LoadState::Fetching,
                to: LoadState::Linked
            })
        ));
        assert_eq!(record.state(), LoadState::Fetching);
    }

    #[test]
    fn test_records_are_capped() {
        let mut registry = DeferredRegistry::new(None, false);
        for i in 0..MAX_LOAD_RECORDS + 44 {
            let name = format!("chunk_{}", i);
            registry.push_record(DeferredLoadRecord::new(&name, Capabilities::empty()));
        }
        let records = registry.records();
        assert_eq!(records.len(), MAX_LOAD_RECORDS);
        assert_eq!(records[0].name(), "chunk_44");
        assert_eq!(
            records[MAX_LOAD_RECORDS - 1].name(),
            format!("chunk_{}", MAX_LOAD_RECORDS + 43)
        );
    }

    #[test]
    fn test_static_loader() {
        let loader = StaticLoader::new().with("chunk_1", vec![1, 2, 3]);
        match loader.load("chunk_1").unwrap() {
            DeferredSource::Bytes(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected source {:?}", other),
        }
        assert!(loader.load("chunk_2").is_err());
    }

    #[test]
    fn test_closure_loader() {
        let loader = |name: &str| -> anyhow::Result<DeferredSource> {
            Ok(DeferredSource::Bytes(name.as_bytes().to_vec()))
        };
        let source = LoadDeferredWasm::load(&loader, "ab").unwrap();
        assert_eq!(source.into_bytes(1).unwrap(), b"ab".to_vec());
    }

    #[test]
    fn test_directory_loader() {
        let dir = std::env::temp_dir().join(format!("wasm-bridge-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("chunk_1.wasm"), b"\0asm").unwrap();

        let loader = DirectoryLoader::new(&dir);
        let bytes = loader.load("chunk_1").unwrap().into_bytes(2).unwrap();
        assert_eq!(bytes, b"\0asm".to_vec());
        assert!(loader.load("missing").is_err());
        assert!(loader.load("../chunk_1").is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
