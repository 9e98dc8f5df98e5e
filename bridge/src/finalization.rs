//! Finalization registries.
//!
//! A registry watches host values through weak handles. Once a registered
//! target is gone, the registry's cleanup function is called with the held
//! value at the next safe point: after an entry point call and after each
//! `pump`. Unregistering by token drops the pending notifications of every
//! cell registered with that token.

use std::fmt;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::function::HostFunction;
use crate::value::{HostValue, MarshalError, WeakValue};

struct Cell {
    target: WeakValue,
    held: HostValue,
    token: Option<WeakValue>,
}

struct RegistryInner {
    cleanup: HostFunction,
    cells: Mutex<Vec<Cell>>,
}

/// Cleanup callbacks keyed on the lifetime of host values.
#[derive(Clone)]
pub struct FinalizationRegistry(Arc<RegistryInner>);

impl FinalizationRegistry {
    /// Registry calling `cleanup(held)` for each collected target.
    pub fn new(cleanup: HostFunction) -> Self {
        FinalizationRegistry(Arc::new(RegistryInner {
            cleanup,
            cells: Mutex::new(Vec::new()),
        }))
    }

    /// The cleanup function.
    pub fn cleanup(&self) -> &HostFunction {
        &self.0.cleanup
    }

    /// Watch `target`. `token`, when given, can later be passed to
    /// `unregister`. Targets and tokens must be reference values.
    pub fn register(
        &self,
        target: &HostValue,
        held: HostValue,
        token: Option<&HostValue>,
    ) -> Result<(), MarshalError> {
        let target = weak_handle(target)?;
        let token = token.map(weak_handle).transpose()?;
        self.0.cells.lock().push(Cell {
            target,
            held,
            token,
        });
        Ok(())
    }

    /// Forget every cell registered with `token`. Returns whether any was.
    pub fn unregister(&self, token: &HostValue) -> Result<bool, MarshalError> {
        weak_handle(token)?;
        let mut cells = self.0.cells.lock();
        let before = cells.len();
        cells.retain(|cell| !cell.token.as_ref().map_or(false, |t| t.refers_to(token)));
        Ok(cells.len() != before)
    }

    /// Number of cells still watched.
    pub fn len(&self) -> usize {
        self.0.cells.lock().len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the cells whose target is gone and return their held values.
    pub fn collect(&self) -> Vec<HostValue> {
        let mut cells = self.0.cells.lock();
        let mut held = Vec::new();
        cells.retain(|cell| {
            if cell.target.is_alive() {
                true
            } else {
                held.push(cell.held.clone());
                false
            }
        });
        held
    }

    /// Whether both handles are the same registry.
    pub fn ptr_eq(a: &FinalizationRegistry, b: &FinalizationRegistry) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for FinalizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizationRegistry")
            .field("cells", &self.len())
            .finish()
    }
}

fn weak_handle(value: &HostValue) -> Result<WeakValue, MarshalError> {
    match value {
        HostValue::Null => Err(MarshalError::NullReference),
        other => WeakValue::new(other).ok_or(MarshalError::TypeMismatch {
            expected: "object",
            found: other.kind(),
        }),
    }
}

/// Registries created in one session. Registries the module dropped are
/// pruned and never notify.
#[derive(Default)]
pub(crate) struct FinalizerSet {
    registries: Vec<Weak<RegistryInner>>,
}

impl FinalizerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&mut self, registry: &FinalizationRegistry) {
        self.registries.push(Arc::downgrade(&registry.0));
    }

    /// Cleanup calls that are due, as `(cleanup, held)` pairs.
    pub(crate) fn collect(&mut self) -> Vec<(HostFunction, HostValue)> {
        self.registries.retain(|r| r.strong_count() > 0);
        let mut due = Vec::new();
        for inner in self.registries.iter().filter_map(Weak::upgrade) {
            let registry = FinalizationRegistry(inner);
            for held in registry.collect() {
                due.push((registry.cleanup().clone(), held));
            }
        }
        due
    }
}
