//! Function values crossing the boundary.
//!
//! A host function is either a native Rust callable or a wrapper around a
//! module closure. Wrappers are created through the `FunctionRegistry`,
//! which hands out the existing wrapper while one is alive so a closure is
//! wrapped exactly once per arity. Dropping the last wrapper queues the closure id;
//! the bridge later tells the module through `$releaseClosure`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::value::HostValue;

/// Signature of native host functions.
pub type NativeFn = dyn Fn(&[HostValue]) -> anyhow::Result<HostValue> + Send + Sync;

/// Highest arity with a `$closureCallN` trampoline.
pub const MAX_CLOSURE_ARITY: usize = 3;

/// A callable host value.
#[derive(Clone)]
pub enum HostFunction {
    /// Implemented by the host.
    Native(Arc<NativeFn>),
    /// Wraps a closure that lives in the module.
    Module(ForeignFunction),
}

impl HostFunction {
    /// Wrap a Rust closure.
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&[HostValue]) -> anyhow::Result<HostValue> + Send + Sync + 'static,
    {
        HostFunction::Native(Arc::new(f))
    }

    /// Whether the function was created by the module.
    pub fn is_module_function(&self) -> bool {
        matches!(self, HostFunction::Module(_))
    }

    /// The module wrapper, if this is one.
    pub fn as_module_function(&self) -> Option<&ForeignFunction> {
        match self {
            HostFunction::Module(f) => Some(f),
            HostFunction::Native(_) => None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakFunction {
        match self {
            HostFunction::Native(f) => WeakFunction::Native(Arc::downgrade(f)),
            HostFunction::Module(f) => WeakFunction::Module(Arc::downgrade(&f.0)),
        }
    }

    /// Identity comparison.
    pub fn ptr_eq(a: &HostFunction, b: &HostFunction) -> bool {
        match (a, b) {
            (HostFunction::Native(a), HostFunction::Native(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (HostFunction::Module(a), HostFunction::Module(b)) => ForeignFunction::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFunction::Native(_) => write!(f, "HostFunction::Native"),
            HostFunction::Module(m) => write!(f, "HostFunction::Module({:?})", m),
        }
    }
}

/// Weak handle to a function value.
#[derive(Clone)]
pub(crate) enum WeakFunction {
    Native(Weak<NativeFn>),
    Module(Weak<ForeignInner>),
}

impl WeakFunction {
    pub(crate) fn is_alive(&self) -> bool {
        match self {
            WeakFunction::Native(f) => f.strong_count() > 0,
            WeakFunction::Module(f) => f.strong_count() > 0,
        }
    }

    pub(crate) fn ptr_eq(&self, other: &WeakFunction) -> bool {
        match (self, other) {
            (WeakFunction::Native(a), WeakFunction::Native(b)) => {
                a.as_ptr() as *const () == b.as_ptr() as *const ()
            }
            (WeakFunction::Module(a), WeakFunction::Module(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }
}

pub(crate) struct ForeignInner {
    closure: i32,
    arity: usize,
    released: Arc<Mutex<Vec<i32>>>,
}

impl Drop for ForeignInner {
    fn drop(&mut self) {
        self.released.lock().push(self.closure);
    }
}

/// Host-side wrapper around a module closure.
#[derive(Clone)]
pub struct ForeignFunction(Arc<ForeignInner>);

impl ForeignFunction {
    /// Closure id understood by the module.
    pub fn closure(&self) -> i32 {
        self.0.closure
    }

    /// Number of parameters the closure takes.
    pub fn arity(&self) -> usize {
        self.0.arity
    }

    /// Export forwarding calls for this arity.
    pub fn trampoline(&self) -> String {
        format!("$closureCall{}", self.0.arity)
    }

    /// Whether both handles are the same wrapper.
    pub fn ptr_eq(a: &ForeignFunction, b: &ForeignFunction) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignFunction")
            .field("closure", &self.0.closure)
            .field("arity", &self.0.arity)
            .finish()
    }
}

/// Identity table for module closures.
#[derive(Default)]
pub struct FunctionRegistry {
    live: HashMap<(i32, usize), Weak<ForeignInner>>,
    released: Arc<Mutex<Vec<i32>>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrapper for `closure` at `arity`; reuses the live wrapper for the
    /// same pair if there is one.
    pub fn wrap(&mut self, closure: i32, arity: usize) -> ForeignFunction {
        if let Some(inner) = self.live.get(&(closure, arity)).and_then(Weak::upgrade) {
            return ForeignFunction(inner);
        }

        let inner = Arc::new(ForeignInner {
            closure,
            arity,
            released: self.released.clone(),
        });
        self.live.insert((closure, arity), Arc::downgrade(&inner));
        ForeignFunction(inner)
    }

    /// Number of closures with a live wrapper.
    pub fn live_count(&self) -> usize {
        let mut closures: Vec<i32> = self
            .live
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|((closure, _), _)| *closure)
            .collect();
        closures.sort_unstable();
        closures.dedup();
        closures.len()
    }

    /// Closure ids whose last wrapper is gone.
    ///
    /// An id that was wrapped again after its release was queued is skipped;
    /// it will be queued again when the new wrapper goes away.
    pub fn take_released(&mut self) -> Vec<i32> {
        let queued = std::mem::take(&mut *self.released.lock());
        let mut released = Vec::with_capacity(queued.len());
        for id in queued {
            let alive = self
                .live
                .iter()
                .any(|((closure, _), w)| *closure == id && w.strong_count() > 0);
            if !alive && !released.contains(&id) {
                self.live.retain(|(closure, _), _| *closure != id);
                released.push(id);
            }
        }
        released
    }
}
