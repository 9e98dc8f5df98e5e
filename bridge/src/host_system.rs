//! Console, clock, platform and timer adapters.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use wasmtime::{Caller, ExternRef};

use crate::host::arg;
use crate::instance::BridgeState;
use crate::value::HostValue;

type Ref = Option<ExternRef>;

// ---------------------------------------------------------------------------
// Console & platform
// ---------------------------------------------------------------------------

/// print(value)
pub(crate) fn host_print(mut caller: Caller<'_, BridgeState>, value: Ref) -> anyhow::Result<()> {
    let line = arg(&value)?.to_display_string().to_string_lossy();
    log::info!("[console] {}", line);
    caller.data_mut().console.push(line);
    Ok(())
}

/// date_now() -> f64 (milliseconds since the Unix epoch)
pub(crate) fn host_date_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// performance_now() -> f64 (milliseconds since the session started)
pub(crate) fn host_performance_now(caller: Caller<'_, BridgeState>) -> f64 {
    caller.data().started.elapsed().as_secs_f64() * 1000.0
}

/// global_this() -> externref
pub(crate) fn host_global_this(caller: Caller<'_, BridgeState>) -> Ref {
    HostValue::Object(caller.data().globals.clone()).to_extern()
}

/// is_windows() -> i32
pub(crate) fn host_is_windows() -> i32 {
    cfg!(windows) as i32
}

// ---------------------------------------------------------------------------
// Timers & microtasks
// ---------------------------------------------------------------------------

/// Delay in milliseconds from the module; negative and NaN mean "now".
fn delay(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
}

/// set_timeout(callback, delay_ms) -> handle
pub(crate) fn host_set_timeout(
    mut caller: Caller<'_, BridgeState>,
    callback: i32,
    delay_ms: f64,
) -> i32 {
    let handle = caller
        .data_mut()
        .timers
        .set_timeout(Instant::now(), delay(delay_ms), callback);
    log::trace!("[bridge] timeout {} scheduled in {}ms", handle, delay_ms);
    handle
}

/// set_interval(callback, period_ms) -> handle
pub(crate) fn host_set_interval(
    mut caller: Caller<'_, BridgeState>,
    callback: i32,
    period_ms: f64,
) -> i32 {
    caller
        .data_mut()
        .timers
        .set_interval(Instant::now(), delay(period_ms), callback)
}

/// clear_timeout(handle)
pub(crate) fn host_clear_timeout(mut caller: Caller<'_, BridgeState>, handle: i32) {
    caller.data_mut().timers.cancel(handle);
}

/// clear_interval(handle)
pub(crate) fn host_clear_interval(mut caller: Caller<'_, BridgeState>, handle: i32) {
    caller.data_mut().timers.cancel(handle);
}

/// queue_microtask(callback)
pub(crate) fn host_queue_microtask(mut caller: Caller<'_, BridgeState>, callback: i32) {
    caller.data_mut().timers.queue_microtask(callback);
}
