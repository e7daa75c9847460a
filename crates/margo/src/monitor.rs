//! The monitoring callback tap: per-subsystem begin/end event pairs
//! (`progress`, `trigger`, `rpc_handler`, `bulk`, `finalize`, ...) each
//! carrying a small args payload, mirroring Mochi-Margo's
//! `margo_monitor_event_t` enumeration. Narrowed here to the events the
//! core actually fires.

/// One observable lifecycle point.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ProgressBegin { timeout_ms: u64 },
    ProgressEnd { outcome: &'static str },
    TriggerBegin,
    TriggerEnd { count: usize },
    RpcHandlerBegin { rpc_id: u64, name: String },
    RpcHandlerEnd { rpc_id: u64, name: String },
    ForwardBegin { rpc_id: u64 },
    ForwardEnd { rpc_id: u64, success: bool },
    FinalizeBegin,
    FinalizeEnd,
}

/// Installed monitor callback. Must not error — their failures are
/// ignored, which the trait reflects by simply not returning a
/// `Result`.
pub trait Monitor: Send + Sync {
    fn on_event(&self, event: &MonitorEvent);
}

/// The default no-op monitor.
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn on_event(&self, _event: &MonitorEvent) {}
}

/// A monitor that logs every event at `trace` level, useful in tests
/// and examples without wiring a real observability backend.
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn on_event(&self, event: &MonitorEvent) {
        tracing::trace!(?event, "margo monitor event");
    }
}
