//! The transport capability set Margo consumes.
//!
//! Margo treats the concrete network transport as an external
//! collaborator — a plug-in providing non-blocking progress/trigger,
//! address resolution, handle lifecycle, one-shot forward/respond, and
//! bulk (RDMA-style) transfer. This crate defines that boundary as the
//! [`Transport`] trait and ships one reference implementation,
//! [`loopback::LoopbackTransport`], used by `margo`'s own test suite
//! and examples. A production transport (the Mercury/libfabric
//! equivalent) is left to integrators to provide.

mod addr;
mod bulk;
mod error;
pub mod loopback;

pub use addr::Address;
pub use bulk::{BulkHandle, BulkKind, BulkOp, BulkSegment, CancelToken};
pub use error::TransportError;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque per-destination-per-RPC handle issued by the transport.
///
/// Mirrors `hg_handle_t`: callers never inspect its contents, only pass
/// it back into the `Transport` that created it. `Arc<dyn Any>` is the
/// safe-Rust stand-in for the C side's untyped pointer.
#[derive(Clone)]
pub struct RawHandle(pub Arc<dyn Any + Send + Sync>);

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle(..)")
    }
}

/// Outcome of one non-blocking progress call. Any other outcome is
/// fatal and is represented as `Err(TransportError::Other)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Work was made; the caller should trigger before progressing again.
    Success,
    /// No work was made within the timeout.
    Timeout,
}

/// Invoked by the transport, from within the progress ULT, when a
/// submitted operation completes. `Ok(bytes)` carries the raw response
/// (forward) or acknowledgement (respond/bulk — empty) payload.
pub type CompletionSink = Box<dyn FnOnce(Result<Vec<u8>, TransportError>) + Send>;

/// Invoked by the transport, from within `trigger`, when an inbound RPC
/// is delivered: `(effective id, a handle to respond with, raw
/// payload)`. Installed once at `Instance` init — the generalization of
/// Mercury's per-registration processing-function callback into a
/// single dispatch entry point the core demuxes itself.
pub type InboundSink = Box<dyn Fn(u64, RawHandle, Vec<u8>) + Send + Sync>;

/// The capability set a transport must provide.
///
/// Object-safe so that `margo::Instance` can hold `Arc<dyn Transport>`
/// without becoming generic over the concrete transport everywhere.
pub trait Transport: Send + Sync + 'static {
    /// This process's own address, as known to the transport.
    fn self_address(&self) -> Address;
    /// Resolve a peer by its serialized address string.
    fn lookup(&self, address_str: &str) -> Result<Address, TransportError>;
    fn address_to_string(&self, addr: &Address) -> String;
    fn address_from_string(&self, s: &str) -> Result<Address, TransportError>;
    fn address_compare(&self, a: &Address, b: &Address) -> bool;
    fn address_dup(&self, addr: &Address) -> Address;
    /// Forget a local reference to `addr` without notifying the peer.
    fn address_set_remove(&self, addr: &Address);

    /// Register an RPC name, returning its 64-bit id. Collision with an
    /// already-registered name under the same id is an error; the same
    /// name registered twice returns the same id (idempotent).
    fn register_rpc(&self, name: &str) -> Result<u64, TransportError>;
    fn deregister_rpc(&self, id: u64) -> Result<(), TransportError>;

    fn create_handle(&self, addr: Address, id: u64) -> Result<RawHandle, TransportError>;
    /// Reset a handle (possibly recycled from a cache) to a new destination/id.
    fn reset_handle(&self, handle: &RawHandle, addr: Address, id: u64) -> Result<(), TransportError>;
    fn destroy_handle(&self, handle: RawHandle);
    fn handle_ref_incr(&self, handle: &RawHandle);
    fn handle_ref_count(&self, handle: &RawHandle) -> i64;

    /// Submit a one-shot forward. Non-blocking: returns once the
    /// operation is queued, `completion` runs later from `trigger`.
    fn forward(
        &self,
        handle: &RawHandle,
        payload: Vec<u8>,
        completion: CompletionSink,
    ) -> Result<(), TransportError>;

    /// Submit a response to a previously received forward.
    fn respond(
        &self,
        handle: &RawHandle,
        payload: Vec<u8>,
        completion: CompletionSink,
    ) -> Result<(), TransportError>;

    /// Best-effort cancellation of an in-flight forward/respond on `handle`.
    fn cancel(&self, handle: &RawHandle) -> Result<(), TransportError>;

    fn bulk_create(&self, segments: Vec<BulkSegment>, kind: BulkKind) -> Result<BulkHandle, TransportError>;
    fn bulk_free(&self, handle: BulkHandle);
    fn bulk_serialize(&self, handle: &BulkHandle) -> Vec<u8>;
    fn bulk_deserialize(&self, bytes: &[u8]) -> Result<BulkHandle, TransportError>;

    /// Submit a bulk transfer. Returns a cancel token immediately;
    /// `completion` runs later from `trigger`.
    #[allow(clippy::too_many_arguments)]
    fn bulk_transfer(
        &self,
        op: BulkOp,
        origin_addr: Address,
        origin: BulkHandle,
        origin_offset: usize,
        local: BulkHandle,
        local_offset: usize,
        size: usize,
        completion: CompletionSink,
    ) -> Result<CancelToken, TransportError>;

    fn cancel_bulk(&self, token: &CancelToken) -> Result<(), TransportError>;

    /// Non-blocking progress, with a bound on how long to block.
    fn progress(&self, timeout_ms: u64) -> Result<ProgressOutcome, TransportError>;
    /// Trigger at most `max_count` completed operations' callbacks.
    /// Returns the number actually triggered.
    fn trigger(&self, timeout_ms: u64, max_count: usize) -> Result<usize, TransportError>;

    /// Install the callback invoked when an inbound RPC is delivered.
    /// Called once by `margo::Instance` during initialization.
    fn set_rpc_received_callback(&self, callback: InboundSink);
}
