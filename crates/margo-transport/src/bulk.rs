use std::any::Any;
use std::sync::Arc;

/// A local memory region offered up for bulk transfer — the safe-Rust
/// stand-in for the (pointer, size) pairs `HG_Bulk_create` takes.
#[derive(Clone)]
pub struct BulkSegment {
    pub data: Arc<parking_lot::Mutex<Vec<u8>>>,
    pub offset: usize,
    pub len: usize,
}

impl BulkSegment {
    pub fn new(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            data: Arc::new(parking_lot::Mutex::new(bytes)),
            offset: 0,
            len,
        }
    }
}

/// Access mode a bulk handle's segments were registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkKind {
    Read,
    Write,
    ReadWrite,
}

/// Direction of a bulk transfer, relative to the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    /// Pull bytes from the origin into the local segments.
    Pull,
    /// Push local bytes into the origin's segments.
    Push,
}

/// An opaque bulk memory handle (`hg_bulk_t` equivalent).
#[derive(Clone)]
pub struct BulkHandle(pub Arc<dyn Any + Send + Sync>);

impl std::fmt::Debug for BulkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BulkHandle(..)")
    }
}

/// A token identifying one in-flight, cancellable bulk transfer.
#[derive(Clone)]
pub struct CancelToken(pub Arc<dyn Any + Send + Sync>);

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CancelToken(..)")
    }
}
