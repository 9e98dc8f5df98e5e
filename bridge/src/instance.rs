//! Live instances.
//!
//! An `InstantiatedModule` owns the store of one session. The store data
//! (`BridgeState`) carries everything host adapters need while module code
//! runs: the negotiated capabilities, the primary instance and its memory,
//! the deferred registry, timers, closure wrappers and captured console
//! output.

use std::sync::Arc;
use std::time::Instant;

use wasmtime::{Instance, IntoFunc, Linker, Store, StoreLimits, Val};

use crate::capability::Capabilities;
use crate::deferred::{DeferredLoadRecord, DeferredRegistry, LoadDeferredWasm, LoadState};
use crate::engine::Engine;
use crate::finalization::FinalizerSet;
use crate::function::{FunctionRegistry, HostFunction};
use crate::js_string::StringBuiltins;
use crate::marshal::{self, ModuleString};
use crate::memory::SharedMemory;
use crate::module::CompiledModule;
use crate::timer::TimerQueue;
use crate::value::{ElementKind, HostArray, HostObject, HostString, HostValue, MarshalError, TypedArray};
use crate::BridgeError;

/// Reserved entry point export.
pub const ENTRY_POINT: &str = "$invokeMain";

/// Store data of one session.
pub struct BridgeState {
    pub(crate) engine: Engine,
    pub(crate) capabilities: Capabilities,
    pub(crate) string_builtins: StringBuiltins,
    pub(crate) limits: StoreLimits,
    pub(crate) primary: Option<Instance>,
    pub(crate) memory: Option<SharedMemory>,
    pub(crate) deferred: DeferredRegistry,
    pub(crate) timers: TimerQueue,
    pub(crate) functions: FunctionRegistry,
    pub(crate) finalizers: FinalizerSet,
    pub(crate) console: Vec<String>,
    pub(crate) globals: HostObject,
    pub(crate) started: Instant,
}

impl BridgeState {
    pub(crate) fn new(
        engine: Engine,
        capabilities: Capabilities,
        string_builtins: StringBuiltins,
        limits: StoreLimits,
        loader: Option<Arc<dyn LoadDeferredWasm>>,
    ) -> Self {
        let cache = engine.config().cache_deferred_modules;
        BridgeState {
            engine,
            capabilities,
            string_builtins,
            limits,
            primary: None,
            memory: None,
            deferred: DeferredRegistry::new(loader, cache),
            timers: TimerQueue::new(),
            functions: FunctionRegistry::new(),
            finalizers: FinalizerSet::new(),
            console: Vec::new(),
            globals: HostObject::new(),
            started: Instant::now(),
        }
    }

    /// State that is not attached to any instance.
    #[cfg(test)]
    pub(crate) fn detached(engine: Engine) -> Self {
        BridgeState::new(
            engine,
            Capabilities::empty(),
            StringBuiltins::Absent,
            StoreLimits::default(),
            None,
        )
    }

    /// Capabilities shared by every module of the session.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// How `wasm:js-string` was bound.
    pub fn string_builtins(&self) -> StringBuiltins {
        self.string_builtins
    }

    /// The primary instance, once linked.
    pub fn primary(&self) -> Option<Instance> {
        self.primary
    }

    /// The session's linear memory, if the primary exports one.
    pub fn memory(&self) -> Option<SharedMemory> {
        self.memory
    }

    /// Lines written through `host.print`.
    pub fn console_output(&self) -> &[String] {
        &self.console
    }

    /// The object returned by `host.global_this`.
    pub fn globals(&self) -> &HostObject {
        &self.globals
    }
}

type Definer = Box<dyn FnOnce(&mut Linker<BridgeState>) -> anyhow::Result<()>>;

/// Caller-supplied imports, layered over the built-in host table.
///
/// Entries are applied in insertion order after the built-in table, so an
/// entry with the same namespace and name replaces the built-in one and a
/// later entry replaces an earlier one.
#[derive(Default)]
pub struct Imports {
    entries: Vec<(String, String, Definer)>,
}

impl Imports {
    /// Create an empty import set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host function import.
    pub fn func_wrap<Params, Results, F>(&mut self, module: &str, name: &str, func: F) -> &mut Self
    where
        F: IntoFunc<BridgeState, Params, Results> + 'static,
        Params: 'static,
        Results: 'static,
    {
        let (m, n) = (module.to_string(), name.to_string());
        let define: Definer = Box::new(move |linker| {
            linker.func_wrap(&m, &n, func)?;
            Ok(())
        });
        self.entries
            .push((module.to_string(), name.to_string(), define));
        self
    }

    /// Whether an entry for `module`/`name` exists.
    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(m, n, _)| m == module && n == name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn apply(self, linker: &mut Linker<BridgeState>) -> anyhow::Result<()> {
        for (module, name, define) in self.entries {
            log::debug!("[bridge] caller import {}.{}", module, name);
            define(linker)?;
        }
        Ok(())
    }
}

/// A live primary instance and its session.
pub struct InstantiatedModule {
    store: Store<BridgeState>,
    instance: Instance,
    module: CompiledModule,
}

impl InstantiatedModule {
    pub(crate) fn new(store: Store<BridgeState>, instance: Instance, module: CompiledModule) -> Self {
        InstantiatedModule {
            store,
            instance,
            module,
        }
    }

    /// Call `$invokeMain` with `args` packed into a host array.
    ///
    /// Queued microtasks run and pending closure releases are delivered
    /// once the entry point returns.
    pub fn invoke_entry_point(&mut self, args: &[HostValue]) -> Result<(), BridgeError> {
        let main = self
            .instance
            .get_func(&mut self.store, ENTRY_POINT)
            .ok_or_else(|| MarshalError::MissingExport(ENTRY_POINT.to_string()))?;

        let args = HostValue::Array(HostArray::from_values(args.to_vec()));
        let mut results = vec![Val::I32(0); main.ty(&self.store).results().len()];
        main.call(&mut self.store, &[Val::ExternRef(args.to_extern())], &mut results)
            .map_err(BridgeError::from_trap)?;

        self.run_microtasks()?;
        self.release_closures()?;
        self.run_finalizers()?;
        Ok(())
    }

    /// Call any export of the primary instance.
    pub fn invoke_function(&mut self, name: &str, params: &[Val]) -> Result<Vec<Val>, BridgeError> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| MarshalError::MissingExport(name.to_string()))?;
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];
        func.call(&mut self.store, params, &mut results)
            .map_err(BridgeError::from_trap)?;
        Ok(results)
    }

    /// Call a host function value; module closures go through their
    /// trampoline.
    pub fn call_function(
        &mut self,
        function: &HostFunction,
        args: &[HostValue],
    ) -> Result<HostValue, BridgeError> {
        match function {
            HostFunction::Native(f) => f(args).map_err(BridgeError::Execution),
            HostFunction::Module(f) => marshal::invoke_module_function(&mut self.store, f, args)
                .map_err(BridgeError::from_trap),
        }
    }

    /// Wrapper for a module closure, shared with any live wrapper.
    pub fn wrap_function(&mut self, closure: i32, arity: usize) -> HostFunction {
        HostFunction::Module(self.store.data_mut().functions.wrap(closure, arity))
    }

    /// Fire every timer due at `now`, draining microtasks after each one.
    /// Returns the number of timer callbacks dispatched.
    pub fn pump(&mut self, now: Instant) -> Result<usize, BridgeError> {
        let mut fired = 0;
        while let Some(callback) = self.store.data_mut().timers.pop_due(now) {
            marshal::dispatch_callback(&mut self.store, callback).map_err(BridgeError::from_trap)?;
            fired += 1;
            self.run_microtasks()?;
        }
        self.run_microtasks()?;
        self.release_closures()?;
        self.run_finalizers()?;
        Ok(fired)
    }

    /// Run queued microtasks until the queue is empty.
    pub fn run_microtasks(&mut self) -> Result<usize, BridgeError> {
        let mut ran = 0;
        while let Some(callback) = self.store.data_mut().timers.pop_microtask() {
            marshal::dispatch_callback(&mut self.store, callback).map_err(BridgeError::from_trap)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Tell the module about closures whose last host wrapper is gone.
    pub fn release_closures(&mut self) -> Result<usize, BridgeError> {
        self.store.gc();
        marshal::release_closures(&mut self.store).map_err(BridgeError::from_trap)
    }

    /// Call cleanup functions of finalization registries whose targets are
    /// gone.
    pub fn run_finalizers(&mut self) -> Result<usize, BridgeError> {
        self.store.gc();
        marshal::run_finalizers(&mut self.store).map_err(BridgeError::from_trap)
    }

    /// Copy a host string into the module.
    pub fn string_to_module(&mut self, s: &HostString) -> Result<ModuleString, BridgeError> {
        marshal::string_to_module(&mut self.store, s).map_err(BridgeError::from_trap)
    }

    /// Copy a module string into the host.
    pub fn string_from_module(&mut self, s: ModuleString) -> Result<HostString, BridgeError> {
        marshal::string_from_module(&mut self.store, s).map_err(BridgeError::from_trap)
    }

    /// Copy a typed array into linear memory at `ptr` (little-endian).
    pub fn write_typed_array(&mut self, array: &TypedArray, ptr: usize) -> Result<(), BridgeError> {
        marshal::typed_array_to_module(&mut self.store, array, 0, array.len(), ptr)?;
        Ok(())
    }

    /// Copy `len` elements at `ptr` out of linear memory into a new array.
    pub fn read_typed_array(
        &mut self,
        kind: ElementKind,
        ptr: usize,
        len: usize,
    ) -> Result<TypedArray, BridgeError> {
        let array = TypedArray::new(kind, len);
        marshal::typed_array_from_module(&mut self.store, &array, 0, len, ptr)?;
        Ok(array)
    }

    /// Names of the primary exports.
    pub fn export_names(&mut self) -> Vec<String> {
        self.instance
            .exports(&mut self.store)
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Every deferred load requested so far.
    pub fn deferred_loads(&self) -> &[DeferredLoadRecord] {
        self.store.data().deferred.records()
    }

    /// Most recent linked instance of the deferred module `name`.
    pub fn deferred_instance(&self, name: &str) -> Option<Instance> {
        self.deferred_loads()
            .iter()
            .rev()
            .filter(|r| r.name() == name && r.state() == LoadState::Linked)
            .find_map(|r| r.instance())
    }

    /// Lines written through `host.print`.
    pub fn console_output(&self) -> &[String] {
        self.store.data().console_output()
    }

    /// The object returned by `host.global_this`.
    pub fn globals(&self) -> &HostObject {
        self.store.data().globals()
    }

    /// The session's linear memory.
    pub fn memory(&self) -> Option<SharedMemory> {
        self.store.data().memory()
    }

    /// Capabilities of the session.
    pub fn capabilities(&self) -> Capabilities {
        self.store.data().capabilities()
    }

    /// How `wasm:js-string` was bound.
    pub fn string_builtins(&self) -> StringBuiltins {
        self.store.data().string_builtins()
    }

    /// The primary instance.
    pub fn instance(&self) -> Instance {
        self.instance
    }

    /// The module this instance was created from.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Store<BridgeState> {
        &self.store
    }

    /// Get mutable access to the store.
    pub fn store_mut(&mut self) -> &mut Store<BridgeState> {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{DeferredSource, StaticLoader};
    use crate::host::LinkError;
    use crate::marshal::StringWidth;
    use crate::module::InstantiateOptions;
    use crate::value::ValueKind;
    use crate::BridgeConfig;
    use std::time::Duration;
    use wasmtime::Caller;

    const STRINGS: &str = r#"
    (module
      (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
      (import "host" "string_to_module" (func $to_module (param externref) (result i32)))
      (memory (export "memory") 1)
      (global $heap (mut i32) (i32.const 1024))
      (global $fast (export "fast_calls") (mut i32) (i32.const 0))

      (func $alloc (param $size i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $size)))
        (local.get $ptr))

      ;; one-byte strings: [length:i32][unit:u8]*
      (func (export "$stringAllocate1") (param $len i32) (result i32)
        (local $s i32)
        (local.set $s (call $alloc (i32.add (local.get $len) (i32.const 4))))
        (i32.store (local.get $s) (local.get $len))
        (local.get $s))
      (func (export "$stringWrite1") (param $s i32) (param $i i32) (param $unit i32)
        (i32.store8 offset=4 (i32.add (local.get $s) (local.get $i)) (local.get $unit)))
      (func (export "$stringRead1") (param $s i32) (param $i i32) (result i32)
        (i32.load8_u offset=4 (i32.add (local.get $s) (local.get $i))))
      (func (export "$stringAllocate1_2") (param $a i32) (param $b i32) (result i32)
        (local $s i32)
        (global.set $fast (i32.add (global.get $fast) (i32.const 1)))
        (local.set $s (call $alloc (i32.const 6)))
        (i32.store (local.get $s) (i32.const 2))
        (i32.store8 offset=4 (local.get $s) (local.get $a))
        (i32.store8 offset=5 (local.get $s) (local.get $b))
        (local.get $s))

      ;; two-byte strings: [length:i32][unit:u16]*
      (func (export "$stringAllocate2") (param $len i32) (result i32)
        (local $s i32)
        (local.set $s
          (call $alloc (i32.add (i32.shl (local.get $len) (i32.const 1)) (i32.const 4))))
        (i32.store (local.get $s) (local.get $len))
        (local.get $s))
      (func (export "$stringWrite2") (param $s i32) (param $i i32) (param $unit i32)
        (i32.store16 offset=4
          (i32.add (local.get $s) (i32.shl (local.get $i) (i32.const 1)))
          (local.get $unit)))
      (func (export "$stringRead2") (param $s i32) (param $i i32) (result i32)
        (i32.load16_u offset=4
          (i32.add (local.get $s) (i32.shl (local.get $i) (i32.const 1)))))

      (func (export "$invokeMain") (param $args externref)
        (i32.store (i32.const 0)
          (call $to_module (call $array_get (local.get $args) (i32.const 0))))))
    "#;

    const PRIMARY: &str = r#"
    (module
      (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
      (import "host" "is_error" (func $is_error (param externref) (result i32)))
      (import "deferred" "loadModule" (func $load (param externref) (result externref)))
      (type $thunk (func (result i32)))
      (memory (export "memory") 1)
      (table (export "table") 4 funcref)
      (func (export "$bump") (result i32) (i32.const 35))
      (func (export "$invokeMain") (param $args externref)
        (if (call $is_error (call $load (call $array_get (local.get $args) (i32.const 0))))
          (then (i32.store (i32.const 0) (i32.const -1)))
          (else (i32.store (i32.const 0) (call_indirect (type $thunk) (i32.const 1)))))))
    "#;

    const CHUNK: &str = r#"
    (module
      (import "module0" "memory" (memory 1))
      (import "module0" "table" (table 4 funcref))
      (import "module0" "$bump" (func $bump (result i32)))
      (func $chunk (result i32) (i32.add (call $bump) (i32.const 7)))
      (elem (i32.const 1) $chunk)
      (func (export "chunk_value") (result i32) (call $chunk)))
    "#;

    fn engine_with(config: BridgeConfig) -> Engine {
        Engine::new(config).unwrap()
    }

    fn compile(engine: &Engine, wat: &str) -> CompiledModule {
        engine
            .compile_from_bytes(&wat::parse_str(wat).unwrap())
            .unwrap()
    }

    fn instantiate(wat: &str, imports: Imports, options: InstantiateOptions) -> InstantiatedModule {
        let engine = engine_with(BridgeConfig::default());
        compile(&engine, wat).instantiate(imports, options).unwrap()
    }

    fn read_i32(instance: &InstantiatedModule, offset: usize) -> i32 {
        let memory = instance.memory().unwrap();
        memory.read_u32(instance.store(), offset).unwrap() as i32
    }

    fn chunk_loader() -> StaticLoader {
        StaticLoader::new().with("chunk_1", wat::parse_str(CHUNK).unwrap())
    }

    // ---- Strings ----

    #[test]
    fn test_hello_end_to_end() {
        let mut instance = instantiate(STRINGS, Imports::new(), InstantiateOptions::new());
        instance
            .invoke_entry_point(&[HostValue::from("hello")])
            .unwrap();

        let handle = read_i32(&instance, 0);
        let memory = instance.memory().unwrap();
        let length = memory.read_u32(instance.store(), handle as usize).unwrap() as usize;
        assert_eq!(length, 5);
        let units = memory
            .read(instance.store(), handle as usize + 4, length)
            .unwrap();
        assert_eq!(units, vec![104, 101, 108, 108, 111]);

        let s = instance
            .string_from_module(ModuleString {
                handle,
                length,
                width: StringWidth::OneByte,
            })
            .unwrap();
        assert_eq!(s, HostString::from("hello"));
    }

    #[test]
    fn test_string_round_trips() {
        let mut instance = instantiate(STRINGS, Imports::new(), InstantiateOptions::new());
        let long: Vec<u16> = (0..1234u16).map(|i| 0x100 + i).collect();
        let cases = vec![
            HostString::from(""),
            HostString::from("a"),
            HostString::from("\u{ff}ÿ latin"),
            HostString::from("Ω≈ç€"),
            HostString::from("emoji 😀"),
            HostString::from_units(vec![0x61, 0xd800, 0x62]),
            HostString::from_units(vec![0xdc00]),
            HostString::from_units(long),
            HostString::from("x".repeat(1001).as_str()),
        ];

        for s in cases {
            let module_string = instance.string_to_module(&s).unwrap();
            assert_eq!(module_string.length, s.len());
            assert_eq!(module_string.width, StringWidth::of(s.units()));
            let back = instance.string_from_module(module_string).unwrap();
            assert_eq!(back, s);
        }
    }

    #[test]
    fn test_string_width_selection() {
        let mut instance = instantiate(STRINGS, Imports::new(), InstantiateOptions::new());
        let one = instance.string_to_module(&HostString::from("\u{ff}")).unwrap();
        assert_eq!(one.width, StringWidth::OneByte);
        let two = instance.string_to_module(&HostString::from("\u{100}")).unwrap();
        assert_eq!(two.width, StringWidth::TwoByte);
    }

    #[test]
    fn test_string_fast_path_used_when_exported() {
        let mut instance = instantiate(STRINGS, Imports::new(), InstantiateOptions::new());
        let s = instance.string_to_module(&HostString::from("ok")).unwrap();
        let fast = instance
            .instance()
            .get_global(instance.store_mut(), "fast_calls")
            .unwrap();
        assert_eq!(fast.get(instance.store_mut()).i32(), Some(1));
        assert_eq!(
            instance.string_from_module(s).unwrap(),
            HostString::from("ok")
        );

        instance.string_to_module(&HostString::from("abc")).unwrap();
        assert_eq!(fast.get(instance.store_mut()).i32(), Some(1));
    }

    // ---- Typed arrays ----

    fn sample_values(kind: ElementKind) -> Vec<f64> {
        match kind {
            ElementKind::Int8 => vec![-128.0, -1.0, 0.0, 127.0],
            ElementKind::Uint8 | ElementKind::Uint8Clamped => vec![0.0, 1.0, 128.0, 255.0],
            ElementKind::Int16 => vec![-32768.0, -2.0, 0.0, 32767.0],
            ElementKind::Uint16 => vec![0.0, 1.0, 40000.0, 65535.0],
            ElementKind::Int32 => vec![i32::MIN as f64, -5.0, 0.0, i32::MAX as f64],
            ElementKind::Uint32 => vec![0.0, 1.0, 3e9, u32::MAX as f64],
            ElementKind::Float32 => vec![-1.5, 0.0, 0.25, 1e10],
            ElementKind::Float64 => vec![-1.5, 1e300, f64::MIN_POSITIVE, 0.1],
        }
    }

    #[test]
    fn test_typed_array_round_trips() {
        let mut instance = instantiate(STRINGS, Imports::new(), InstantiateOptions::new());
        for kind in ElementKind::ALL {
            let values = sample_values(kind);
            let array = TypedArray::from_values(kind, &values);
            instance.write_typed_array(&array, 256).unwrap();
            let back = instance.read_typed_array(kind, 256, values.len()).unwrap();
            assert_eq!(back.kind(), kind);
            assert_eq!(back.len(), values.len());
            assert_eq!(back.to_vec(), values, "{:?}", kind);
        }
    }

    #[test]
    fn test_typed_array_memory_is_little_endian() {
        let mut instance = instantiate(STRINGS, Imports::new(), InstantiateOptions::new());
        let array = TypedArray::from_values(ElementKind::Int16, &[-2.0, 258.0]);
        instance.write_typed_array(&array, 64).unwrap();
        let bytes = instance.memory().unwrap().read(instance.store(), 64, 4).unwrap();
        assert_eq!(bytes, vec![0xfe, 0xff, 0x02, 0x01]);
        assert!(instance.read_typed_array(ElementKind::Float64, 65530, 1).is_err());
    }

    const LISTS: &str = r#"
    (module
      (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
      (import "host" "array_push" (func $push (param externref externref)))
      (import "host" "box_number" (func $box (param f64) (result externref)))
      (import "host" "unbox_number" (func $unbox (param externref) (result f64)))
      (import "host" "typed_array_from_module_list"
        (func $from_list (param i32 i32) (result externref)))
      (memory (export "memory") 1)
      ;; lists: [length:i32][pad:i32][value:f64]*
      (func (export "$listLength") (param $list i32) (result i32)
        (i32.load (local.get $list)))
      (func (export "$listRead") (param $list i32) (param $i i32) (result externref)
        (call $box (f64.load offset=8
          (i32.add (local.get $list) (i32.shl (local.get $i) (i32.const 3))))))
      (func (export "$invokeMain") (param $args externref)
        (call $push
          (call $array_get (local.get $args) (i32.const 1))
          (call $from_list
            (i32.trunc_f64_s (call $unbox (call $array_get (local.get $args) (i32.const 0))))
            (i32.const 64)))))
    "#;

    fn write_number_list(instance: &mut InstantiatedModule, values: &[f64]) {
        let memory = instance.memory().unwrap();
        memory
            .write_u32(instance.store_mut(), 64, values.len() as u32)
            .unwrap();
        for (i, v) in values.iter().enumerate() {
            memory
                .write(instance.store_mut(), 72 + i * 8, &v.to_le_bytes())
                .unwrap();
        }
    }

    #[test]
    fn test_typed_array_from_module_list() {
        let mut instance = instantiate(LISTS, Imports::new(), InstantiateOptions::new());
        let values = [-1.5, 255.5, 256.0, 70000.0];
        write_number_list(&mut instance, &values);

        for kind in ElementKind::ALL {
            let out = HostArray::new();
            instance
                .invoke_entry_point(&[
                    HostValue::from(kind.value_kind().tag() as f64),
                    HostValue::Array(out.clone()),
                ])
                .unwrap();
            let array = out.get(0);
            let array = array.as_typed_array().unwrap();
            assert_eq!(array.kind(), kind);
            assert_eq!(
                array.to_vec(),
                TypedArray::from_values(kind, &values).to_vec(),
                "{:?}",
                kind
            );
            match kind {
                ElementKind::Int8 => assert_eq!(array.to_vec(), vec![-1.0, -1.0, 0.0, 112.0]),
                ElementKind::Uint8Clamped => {
                    assert_eq!(array.to_vec(), vec![0.0, 255.0, 255.0, 255.0])
                }
                _ => {}
            }
        }

        let err = instance
            .invoke_entry_point(&[HostValue::from(-1.0), HostValue::Array(HostArray::new())])
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Marshal(MarshalError::InvalidTypeTag(-1))
        ));
    }

    #[test]
    fn test_empty_module_list() {
        let mut instance = instantiate(LISTS, Imports::new(), InstantiateOptions::new());
        write_number_list(&mut instance, &[]);
        let out = HostArray::new();
        instance
            .invoke_entry_point(&[
                HostValue::from(ElementKind::Float64.value_kind().tag() as f64),
                HostValue::Array(out.clone()),
            ])
            .unwrap();
        assert!(out.get(0).as_typed_array().unwrap().is_empty());
    }

    // ---- Functions ----

    const CLOSURES: &str = r#"
    (module
      (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
      (import "host" "array_push" (func $push (param externref externref)))
      (import "host" "wrap_function_1" (func $wrap1 (param i32) (result externref)))
      (memory (export "memory") 1)
      (func (export "$invokeMain") (param $args externref)
        (local $out externref)
        (local.set $out (call $array_get (local.get $args) (i32.const 0)))
        (call $push (local.get $out) (call $wrap1 (i32.const 7)))
        (call $push (local.get $out) (call $wrap1 (i32.const 7))))
      (func (export "$closureCall1")
        (param $closure i32) (param $argc i32) (param $a externref) (result externref)
        (i32.store (i32.const 0) (local.get $closure))
        (i32.store (i32.const 4) (local.get $argc))
        (local.get $a))
      (func (export "$releaseClosure") (param $closure i32)
        (i32.store (i32.const 8) (local.get $closure))))
    "#;

    #[test]
    fn test_wrapper_identity() {
        let mut instance = instantiate(CLOSURES, Imports::new(), InstantiateOptions::new());
        let out = HostArray::new();
        instance
            .invoke_entry_point(&[HostValue::Array(out.clone())])
            .unwrap();
        assert_eq!(out.len(), 2);

        let a = out.get(0).as_function().unwrap().clone();
        let b = out.get(1).as_function().unwrap().clone();
        assert!(a.is_module_function());
        assert!(b.is_module_function());
        assert!(HostFunction::ptr_eq(&a, &b));

        for f in [&a, &b] {
            let result = instance.call_function(f, &[HostValue::from("x")]).unwrap();
            assert_eq!(result.as_string().unwrap(), &HostString::from("x"));
            assert_eq!(read_i32(&instance, 0), 7);
            assert_eq!(read_i32(&instance, 4), 1);
        }

        let missing_arg = instance.call_function(&a, &[]).unwrap();
        assert!(missing_arg.is_undefined());
        assert_eq!(read_i32(&instance, 4), 0);
    }

    #[test]
    fn test_release_notification() {
        let mut instance = instantiate(CLOSURES, Imports::new(), InstantiateOptions::new());
        let out = HostArray::new();
        instance
            .invoke_entry_point(&[HostValue::Array(out.clone())])
            .unwrap();
        assert_eq!(read_i32(&instance, 8), 0);

        drop(out);
        assert_eq!(instance.release_closures().unwrap(), 1);
        assert_eq!(read_i32(&instance, 8), 7);
        assert_eq!(instance.release_closures().unwrap(), 0);
    }

    #[test]
    fn test_call_native_function_from_module() {
        const CALLER: &str = r#"
        (module
          (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
          (import "host" "call_function" (func $call (param externref externref) (result externref)))
          (import "host" "print" (func $print (param externref)))
          (func (export "$invokeMain") (param $args externref)
            (call $print
              (call $call
                (call $array_get (local.get $args) (i32.const 0))
                (call $array_get (local.get $args) (i32.const 1))))))
        "#;
        let mut instance = instantiate(CALLER, Imports::new(), InstantiateOptions::new());
        let native = HostFunction::native(|args| Ok(HostValue::from(args.len() as f64 * 10.0)));
        let args = HostArray::from_values(vec![1.0.into(), 2.0.into()]);
        instance
            .invoke_entry_point(&[HostValue::Function(native), HostValue::Array(args)])
            .unwrap();
        assert_eq!(instance.console_output(), &["20".to_string()]);
    }

    #[test]
    fn test_empty_string_skips_read_export() {
        let mut instance = instantiate(CLOSURES, Imports::new(), InstantiateOptions::new());
        let empty = instance
            .string_from_module(ModuleString {
                handle: 0,
                length: 0,
                width: StringWidth::OneByte,
            })
            .unwrap();
        assert!(empty.is_empty());
        assert!(instance
            .string_from_module(ModuleString {
                handle: 0,
                length: 1,
                width: StringWidth::OneByte,
            })
            .is_err());
    }

    // ---- Finalization ----

    const FINALIZATION: &str = r#"
    (module
      (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
      (import "host" "object_new" (func $object_new (result externref)))
      (import "host" "box_number" (func $box (param f64) (result externref)))
      (import "host" "unbox_number" (func $unbox (param externref) (result f64)))
      (import "host" "wrap_function_1" (func $wrap1 (param i32) (result externref)))
      (import "host" "finalization_registry_new"
        (func $registry_new (param externref) (result externref)))
      (import "host" "finalization_register"
        (func $register (param externref externref externref externref)))
      (import "host" "finalization_unregister"
        (func $unregister (param externref externref) (result i32)))
      (memory (export "memory") 1)
      (global $registry (mut externref) (ref.null extern))
      (func (export "$invokeMain") (param $args externref)
        (local $token externref)
        (global.set $registry (call $registry_new (call $wrap1 (i32.const 9))))
        (call $register (global.get $registry)
          (call $object_new) (call $box (f64.const 1)) (ref.null extern))
        (call $register (global.get $registry)
          (call $array_get (local.get $args) (i32.const 0))
          (call $box (f64.const 2))
          (ref.null extern))
        (local.set $token (call $object_new))
        (call $register (global.get $registry)
          (call $object_new) (call $box (f64.const 4)) (local.get $token))
        (i32.store (i32.const 16)
          (call $unregister (global.get $registry) (local.get $token))))
      ;; cleanup: count calls, sum held values, record the closure id
      (func (export "$closureCall1")
        (param $closure i32) (param $argc i32) (param $held externref) (result externref)
        (i32.store (i32.const 0) (i32.add (i32.load (i32.const 0)) (i32.const 1)))
        (i32.store (i32.const 4)
          (i32.add
            (i32.load (i32.const 4))
            (i32.trunc_f64_s (call $unbox (local.get $held)))))
        (i32.store (i32.const 8) (local.get $closure))
        (ref.null extern)))
    "#;

    #[test]
    fn test_finalization_cleanup_runs_for_dropped_targets() {
        let mut instance = instantiate(FINALIZATION, Imports::new(), InstantiateOptions::new());
        let kept = HostObject::new();
        instance
            .invoke_entry_point(&[HostValue::Object(kept.clone())])
            .unwrap();

        // only the unreachable target was reported
        assert_eq!(read_i32(&instance, 0), 1);
        assert_eq!(read_i32(&instance, 4), 1);
        assert_eq!(read_i32(&instance, 8), 9);
        assert_eq!(read_i32(&instance, 16), 1);
        assert_eq!(instance.run_finalizers().unwrap(), 0);

        drop(kept);
        assert_eq!(instance.run_finalizers().unwrap(), 1);
        assert_eq!(read_i32(&instance, 0), 2);
        assert_eq!(read_i32(&instance, 4), 3);
        assert_eq!(instance.run_finalizers().unwrap(), 0);
    }

    #[test]
    fn test_finalization_rejects_primitive_target() {
        const PRIMITIVE: &str = r#"
        (module
          (import "host" "box_number" (func $box (param f64) (result externref)))
          (import "host" "wrap_function_1" (func $wrap1 (param i32) (result externref)))
          (import "host" "finalization_registry_new"
            (func $registry_new (param externref) (result externref)))
          (import "host" "finalization_register"
            (func $register (param externref externref externref externref)))
          (func (export "$invokeMain") (param $args externref)
            (call $register
              (call $registry_new (call $wrap1 (i32.const 1)))
              (call $box (f64.const 1))
              (ref.null extern)
              (ref.null extern))))
        "#;
        let mut instance = instantiate(PRIMITIVE, Imports::new(), InstantiateOptions::new());
        let err = instance.invoke_entry_point(&[]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Marshal(MarshalError::TypeMismatch {
                expected: "object",
                found: ValueKind::Number
            })
        ));
    }

    // ---- Display ----

    #[test]
    fn test_print_self_containing_array() {
        const CYCLE: &str = r#"
        (module
          (import "host" "array_new" (func $array_new (result externref)))
          (import "host" "array_push" (func $push (param externref externref)))
          (import "host" "box_number" (func $box (param f64) (result externref)))
          (import "host" "print" (func $print (param externref)))
          (import "host" "to_display_string" (func $display (param externref) (result externref)))
          (func (export "$invokeMain") (param $args externref)
            (local $a externref)
            (local.set $a (call $array_new))
            (call $push (local.get $a) (local.get $a))
            (call $push (local.get $a) (call $box (f64.const 5)))
            (call $print (local.get $a))
            (call $print (call $display (local.get $a)))))
        "#;
        let mut instance = instantiate(CYCLE, Imports::new(), InstantiateOptions::new());
        instance.invoke_entry_point(&[]).unwrap();
        assert_eq!(
            instance.console_output(),
            &[",5".to_string(), ",5".to_string()]
        );
    }

    // ---- Errors & linking ----

    #[test]
    fn test_marshal_failure_traps() {
        const UNBOX: &str = r#"
        (module
          (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
          (import "host" "unbox_number" (func $unbox (param externref) (result f64)))
          (func (export "$invokeMain") (param $args externref)
            (drop (call $unbox (call $array_get (local.get $args) (i32.const 0))))))
        "#;
        let mut instance = instantiate(UNBOX, Imports::new(), InstantiateOptions::new());
        let err = instance
            .invoke_entry_point(&[HostValue::from("x")])
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Marshal(MarshalError::TypeMismatch {
                expected: "number",
                found: ValueKind::String
            })
        ));
        assert!(instance.invoke_entry_point(&[HostValue::from(1.0)]).is_ok());
    }

    #[test]
    fn test_missing_import_is_link_error() {
        let engine = engine_with(BridgeConfig::default());
        let module = compile(&engine, r#"(module (import "env" "missing" (func)))"#);
        let err = module
            .instantiate(Imports::new(), InstantiateOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Link(LinkError::Unresolved(_))));
    }

    #[test]
    fn test_bad_host_import_is_reported_by_name() {
        let engine = engine_with(BridgeConfig::default());
        let module = compile(&engine, r#"(module (import "host" "print" (func)))"#);
        let err = module
            .instantiate(Imports::new(), InstantiateOptions::new())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BridgeError::Link(LinkError::ArityMismatch { expected: 1, found: 0, .. })
        ));
    }

    #[test]
    fn test_caller_imports_take_precedence() {
        const PRINTER: &str = r#"
        (module
          (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
          (import "host" "print" (func $print (param externref)))
          (func (export "$invokeMain") (param $args externref)
            (call $print (call $array_get (local.get $args) (i32.const 0)))))
        "#;

        let mut plain = instantiate(PRINTER, Imports::new(), InstantiateOptions::new());
        plain.invoke_entry_point(&[HostValue::from("hi")]).unwrap();
        assert_eq!(plain.console_output(), &["hi".to_string()]);

        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut imports = Imports::new();
        imports.func_wrap(
            "host",
            "print",
            move |_caller: Caller<'_, BridgeState>, v: Option<wasmtime::ExternRef>| {
                let value = HostValue::from_extern(v.as_ref())?;
                sink.lock().push(value.to_display_string().to_string_lossy());
                anyhow::Ok(())
            },
        );
        let mut custom = instantiate(PRINTER, imports, InstantiateOptions::new());
        custom.invoke_entry_point(&[HostValue::from("hi")]).unwrap();
        assert_eq!(*seen.lock(), vec!["hi".to_string()]);
        assert!(custom.console_output().is_empty());
    }

    #[test]
    fn test_instances_are_independent() {
        let engine = engine_with(BridgeConfig::default());
        let module = compile(&engine, STRINGS);
        let mut first = module
            .instantiate(Imports::new(), InstantiateOptions::new())
            .unwrap();
        let second = module
            .instantiate(Imports::new(), InstantiateOptions::new())
            .unwrap();
        first.invoke_entry_point(&[HostValue::from("a")]).unwrap();
        assert_ne!(read_i32(&first, 0), 0);
        assert_eq!(read_i32(&second, 0), 0);
    }

    // ---- Deferred modules ----

    #[test]
    fn test_chunk_1_deferred_load() {
        let mut instance = instantiate(
            PRIMARY,
            Imports::new(),
            InstantiateOptions::new().with_loader(chunk_loader()),
        );
        let exports_before = instance.export_names();

        instance
            .invoke_entry_point(&[HostValue::from("chunk_1")])
            .unwrap();
        assert_eq!(read_i32(&instance, 0), 42);
        assert_eq!(instance.export_names(), exports_before);

        let record = &instance.deferred_loads()[0];
        assert_eq!(record.name(), "chunk_1");
        assert_eq!(record.state(), LoadState::Linked);
        assert_eq!(record.capabilities(), instance.capabilities());

        let chunk = instance.deferred_instance("chunk_1").unwrap();
        let value = chunk
            .get_typed_func::<(), i32>(instance.store_mut(), "chunk_value")
            .unwrap()
            .call(instance.store_mut(), ())
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_deferred_fetch_failure_is_isolated() {
        let loader = |_name: &str| -> anyhow::Result<DeferredSource> {
            Err(anyhow::anyhow!("network down"))
        };
        let mut instance = instantiate(
            PRIMARY,
            Imports::new(),
            InstantiateOptions::new().with_loader(loader),
        );

        instance
            .invoke_entry_point(&[HostValue::from("chunk_1")])
            .unwrap();
        assert_eq!(read_i32(&instance, 0), -1);

        let record = &instance.deferred_loads()[0];
        assert_eq!(record.state(), LoadState::Failed);
        assert!(record.error().unwrap().contains("network down"));
        assert!(instance.deferred_instance("chunk_1").is_none());

        instance
            .invoke_entry_point(&[HostValue::from("chunk_1")])
            .unwrap();
        assert_eq!(instance.deferred_loads().len(), 2);
    }

    #[test]
    fn test_deferred_without_loader_fails_at_request() {
        let mut instance = instantiate(PRIMARY, Imports::new(), InstantiateOptions::new());
        instance
            .invoke_entry_point(&[HostValue::from("chunk_1")])
            .unwrap();
        assert_eq!(read_i32(&instance, 0), -1);
        let record = &instance.deferred_loads()[0];
        assert_eq!(record.state(), LoadState::Failed);
        assert!(record.error().unwrap().contains("no deferred module loader"));
    }

    #[test]
    fn test_deferred_compile_failure() {
        let loader = StaticLoader::new().with("chunk_1", b"garbage".to_vec());
        let mut instance = instantiate(
            PRIMARY,
            Imports::new(),
            InstantiateOptions::new().with_loader(loader),
        );
        instance
            .invoke_entry_point(&[HostValue::from("chunk_1")])
            .unwrap();
        assert_eq!(read_i32(&instance, 0), -1);
        assert!(instance.deferred_loads()[0]
            .error()
            .unwrap()
            .starts_with("compilation failed"));
    }

    #[test]
    fn test_deferred_streamed_source() {
        let bytes = wat::parse_str(CHUNK).unwrap();
        let loader = move |_name: &str| -> anyhow::Result<DeferredSource> {
            Ok(DeferredSource::Stream(Box::new(std::io::Cursor::new(bytes.clone()))))
        };
        let mut instance = instantiate(
            PRIMARY,
            Imports::new(),
            InstantiateOptions::new().with_loader(loader),
        );
        instance
            .invoke_entry_point(&[HostValue::from("chunk_1")])
            .unwrap();
        assert_eq!(read_i32(&instance, 0), 42);
    }

    #[test]
    fn test_deferred_cache() {
        let calls = Arc::new(spin::Mutex::new(0));
        let counter = calls.clone();
        let bytes = wat::parse_str(CHUNK).unwrap();
        let loader = move |_name: &str| -> anyhow::Result<DeferredSource> {
            *counter.lock() += 1;
            Ok(DeferredSource::Bytes(bytes.clone()))
        };
        let engine = engine_with(BridgeConfig {
            cache_deferred_modules: true,
            ..BridgeConfig::default()
        });
        let mut instance = compile(&engine, PRIMARY)
            .instantiate(Imports::new(), InstantiateOptions::new().with_loader(loader))
            .unwrap();

        for _ in 0..2 {
            instance
                .invoke_entry_point(&[HostValue::from("chunk_1")])
                .unwrap();
            assert_eq!(read_i32(&instance, 0), 42);
        }
        assert_eq!(*calls.lock(), 1);
        assert_eq!(instance.deferred_loads().len(), 2);
    }

    const STRING_PRIMARY: &str = r#"
    (module
      (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
      (import "host" "is_error" (func $is_error (param externref) (result i32)))
      (import "deferred" "loadModule" (func $load (param externref) (result externref)))
      (import "wasm:js-string" "length" (func $length (param externref) (result i32)))
      (memory (export "memory") 1)
      (func (export "$invokeMain") (param $args externref)
        (i32.store (i32.const 0)
          (call $length (call $array_get (local.get $args) (i32.const 0))))
        (i32.store (i32.const 4)
          (call $is_error (call $load (call $array_get (local.get $args) (i32.const 1)))))))
    "#;

    const STRING_CHUNK: &str = r#"
    (module
      (import "wasm:js-string" "length" (func (param externref) (result i32))))
    "#;

    fn run_string_session(config: BridgeConfig) -> InstantiatedModule {
        let engine = engine_with(config);
        let loader = StaticLoader::new().with("strings", wat::parse_str(STRING_CHUNK).unwrap());
        let mut instance = compile(&engine, STRING_PRIMARY)
            .instantiate(Imports::new(), InstantiateOptions::new().with_loader(loader))
            .unwrap();
        instance
            .invoke_entry_point(&[HostValue::from("four"), HostValue::from("strings")])
            .unwrap();
        instance
    }

    #[test]
    fn test_capabilities_consistent_with_builtins() {
        let instance = run_string_session(BridgeConfig::default());
        assert_eq!(instance.capabilities(), Capabilities::STRING_BUILTINS);
        assert_eq!(instance.string_builtins(), StringBuiltins::Native);
        assert_eq!(read_i32(&instance, 0), 4);
        assert_eq!(read_i32(&instance, 4), 0);
        assert_eq!(
            instance.deferred_loads()[0].capabilities(),
            Capabilities::STRING_BUILTINS
        );
    }

    #[test]
    fn test_capabilities_consistent_with_polyfill() {
        let instance = run_string_session(BridgeConfig {
            enable_string_builtins: false,
            ..BridgeConfig::default()
        });
        assert!(instance.capabilities().is_empty());
        assert_eq!(instance.string_builtins(), StringBuiltins::Polyfill);
        assert_eq!(read_i32(&instance, 0), 4);
        assert_eq!(read_i32(&instance, 4), 0);
        assert!(instance.deferred_loads()[0].capabilities().is_empty());
    }

    #[test]
    fn test_string_namespace_absent() {
        let engine = engine_with(BridgeConfig {
            enable_string_builtins: false,
            string_polyfill: false,
            ..BridgeConfig::default()
        });
        let err = compile(&engine, STRING_PRIMARY)
            .instantiate(Imports::new(), InstantiateOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Link(LinkError::Unresolved(_))));
    }

    // ---- Timers ----

    #[test]
    fn test_timers_fire_once_and_cancel() {
        const TIMERS: &str = r#"
        (module
          (import "host" "set_timeout" (func $set_timeout (param i32 f64) (result i32)))
          (import "host" "clear_timeout" (func $clear (param i32)))
          (import "host" "queue_microtask" (func $micro (param i32)))
          (memory (export "memory") 1)
          (func (export "$invokeMain") (param $args externref)
            (drop (call $set_timeout (i32.const 1) (f64.const 0)))
            (call $clear (call $set_timeout (i32.const 2) (f64.const 0)))
            (call $micro (i32.const 3)))
          (func (export "$invokeCallback") (param $id i32)
            (local $addr i32)
            (local.set $addr (i32.shl (local.get $id) (i32.const 2)))
            (i32.store (local.get $addr)
              (i32.add (i32.load (local.get $addr)) (i32.const 1)))))
        "#;
        let mut instance = instantiate(TIMERS, Imports::new(), InstantiateOptions::new());
        instance.invoke_entry_point(&[]).unwrap();
        assert_eq!(read_i32(&instance, 12), 1);
        assert_eq!(read_i32(&instance, 4), 0);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(instance.pump(later).unwrap(), 1);
        assert_eq!(instance.pump(later).unwrap(), 0);
        assert_eq!(read_i32(&instance, 4), 1);
        assert_eq!(read_i32(&instance, 8), 0);
        assert_eq!(read_i32(&instance, 12), 1);
    }

    #[test]
    fn test_global_this_is_stable() {
        const GLOBALS: &str = r#"
        (module
          (import "host" "global_this" (func $global (result externref)))
          (import "host" "object_set" (func $set (param externref externref externref)))
          (import "host" "array_get" (func $array_get (param externref i32) (result externref)))
          (func (export "$invokeMain") (param $args externref)
            (call $set
              (call $global)
              (call $array_get (local.get $args) (i32.const 0))
              (call $array_get (local.get $args) (i32.const 1)))))
        "#;
        let mut instance = instantiate(GLOBALS, Imports::new(), InstantiateOptions::new());
        instance
            .invoke_entry_point(&[HostValue::from("answer"), HostValue::from(42.0)])
            .unwrap();
        let answer = instance.globals().get(&HostString::from("answer")).unwrap();
        assert_eq!(answer.as_number().unwrap(), 42.0);
    }
}
