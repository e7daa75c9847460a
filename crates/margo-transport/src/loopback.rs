//! An in-process reference [`Transport`] implementation.
//!
//! `LoopbackTransport` models the capability set of §6.1 without a real
//! network: every "wire" operation is a direct hand-off between two
//! [`LoopbackTransport`] instances that share this process, found by
//! name through a process-wide directory. It exists so that `margo`'s
//! own test suite and examples can exercise the full request lifecycle
//! (forward/respond/bulk, progress/trigger, cancellation) without a
//! real network transport plugged in.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{
    Address, BulkHandle, BulkKind, BulkOp, BulkSegment, CancelToken, CompletionSink, InboundSink,
    ProgressOutcome, RawHandle, Transport, TransportError,
};

fn fnv1a_hash48(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash & 0x0000_ffff_ffff_ffff) << 16
}

struct PendingInbound {
    rpc_id: u64,
    payload: Vec<u8>,
    origin: Weak<LoopbackTransportInner>,
    req_id: u64,
}

/// Either end of a handle's lifecycle: a client-issued handle created
/// via `create_handle`/the handle cache (used for `forward`), or a
/// server-issued handle the transport hands to the inbound callback
/// (used for `respond`). Both share one concrete type so they can live
/// behind the same `RawHandle` / `Arc<dyn Any>`.
struct LoopbackHandleState {
    dest: Mutex<Option<String>>,
    id: AtomicU64,
    refcount: AtomicI64,
    reply: Option<ReplyTicket>,
}

struct ReplyTicket {
    origin: Weak<LoopbackTransportInner>,
    req_id: u64,
}

struct LoopbackBulk {
    segments: Vec<BulkSegment>,
    #[allow(dead_code)]
    kind: BulkKind,
}

struct LoopbackTransportInner {
    name: String,
    self_weak: OnceLock<Weak<LoopbackTransportInner>>,
    rpc_by_name: Mutex<HashMap<String, u64>>,
    rpc_by_id: Mutex<HashMap<u64, String>>,
    inbound: Mutex<VecDeque<PendingInbound>>,
    ready: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    wake: Condvar,
    wake_mtx: Mutex<()>,
    pending_forwards: Mutex<HashMap<u64, CompletionSink>>,
    next_req_id: AtomicU64,
    rpc_received: Mutex<Option<InboundSink>>,
    bulks: Mutex<HashMap<u64, LoopbackBulk>>,
    next_bulk_id: AtomicU64,
}

fn network() -> &'static Mutex<HashMap<String, Weak<LoopbackTransportInner>>> {
    static NETWORK: OnceLock<Mutex<HashMap<String, Weak<LoopbackTransportInner>>>> = OnceLock::new();
    NETWORK.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A named node on the in-process loopback "network".
pub struct LoopbackTransport {
    inner: Arc<LoopbackTransportInner>,
}

impl LoopbackTransport {
    /// Create a new node and publish it under `name` in the process-wide
    /// directory. Panics if `name` is already registered — names must be
    /// unique the way two distinct Mercury addresses would be.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let inner = Arc::new_cyclic(|weak: &Weak<LoopbackTransportInner>| LoopbackTransportInner {
            name: name.clone(),
            self_weak: {
                let cell = OnceLock::new();
                let _ = cell.set(weak.clone());
                cell
            },
            rpc_by_name: Mutex::new(HashMap::new()),
            rpc_by_id: Mutex::new(HashMap::new()),
            inbound: Mutex::new(VecDeque::new()),
            ready: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            wake_mtx: Mutex::new(()),
            pending_forwards: Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
            rpc_received: Mutex::new(None),
            bulks: Mutex::new(HashMap::new()),
            next_bulk_id: AtomicU64::new(1),
        });
        let mut dir = network().lock();
        assert!(
            !dir.contains_key(&name),
            "loopback node {name:?} already exists"
        );
        dir.insert(name, Arc::downgrade(&inner));
        Arc::new(Self { inner })
    }

    fn find_node(name: &str) -> Option<Arc<LoopbackTransportInner>> {
        network().lock().get(name).and_then(Weak::upgrade)
    }

    fn wake_one(&self) {
        let _g = self.inner.wake_mtx.lock();
        self.inner.wake.notify_all();
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        network().lock().remove(&self.inner.name);
    }
}

impl Transport for LoopbackTransport {
    fn self_address(&self) -> Address {
        Address(Arc::new(self.inner.name.clone()))
    }

    fn lookup(&self, address_str: &str) -> Result<Address, TransportError> {
        if Self::find_node(address_str).is_some() {
            Ok(Address(Arc::new(address_str.to_string())))
        } else {
            Err(TransportError::NoDevice(format!(
                "no loopback node named {address_str:?}"
            )))
        }
    }

    fn address_to_string(&self, addr: &Address) -> String {
        addr.0
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default()
    }

    fn address_from_string(&self, s: &str) -> Result<Address, TransportError> {
        self.lookup(s)
    }

    fn address_compare(&self, a: &Address, b: &Address) -> bool {
        self.address_to_string(a) == self.address_to_string(b)
    }

    fn address_dup(&self, addr: &Address) -> Address {
        Address(Arc::new(self.address_to_string(addr)))
    }

    fn address_set_remove(&self, _addr: &Address) {}

    fn register_rpc(&self, name: &str) -> Result<u64, TransportError> {
        let mut by_name = self.inner.rpc_by_name.lock();
        if let Some(id) = by_name.get(name) {
            return Ok(*id);
        }
        let id = fnv1a_hash48(name);
        let mut by_id = self.inner.rpc_by_id.lock();
        if let Some(existing) = by_id.get(&id) {
            if existing != name {
                return Err(TransportError::Other(format!(
                    "rpc name hash collision between {existing:?} and {name:?}"
                )));
            }
        }
        by_name.insert(name.to_string(), id);
        by_id.insert(id, name.to_string());
        tracing::trace!(node = %self.inner.name, name, id, "registered rpc name on loopback node");
        Ok(id)
    }

    fn deregister_rpc(&self, id: u64) -> Result<(), TransportError> {
        let mut by_id = self.inner.rpc_by_id.lock();
        match by_id.remove(&id) {
            Some(name) => {
                self.inner.rpc_by_name.lock().remove(&name);
                Ok(())
            }
            None => Err(TransportError::NoEntry(format!("rpc id {id:#x}"))),
        }
    }

    fn create_handle(&self, addr: Address, id: u64) -> Result<RawHandle, TransportError> {
        let dest = self.address_to_string(&addr);
        Ok(RawHandle(Arc::new(LoopbackHandleState {
            dest: Mutex::new(Some(dest)),
            id: AtomicU64::new(id),
            refcount: AtomicI64::new(1),
            reply: None,
        })))
    }

    fn reset_handle(&self, handle: &RawHandle, addr: Address, id: u64) -> Result<(), TransportError> {
        let state = handle
            .0
            .downcast_ref::<LoopbackHandleState>()
            .ok_or_else(|| TransportError::InvalidArgument("not a loopback handle".into()))?;
        if state.reply.is_some() {
            return Err(TransportError::InvalidArgument(
                "cannot reset an inbound (reply) handle".into(),
            ));
        }
        *state.dest.lock() = Some(self.address_to_string(&addr));
        state.id.store(id, Ordering::SeqCst);
        Ok(())
    }

    fn destroy_handle(&self, _handle: RawHandle) {}

    fn handle_ref_incr(&self, handle: &RawHandle) {
        if let Some(state) = handle.0.downcast_ref::<LoopbackHandleState>() {
            state.refcount.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle_ref_count(&self, handle: &RawHandle) -> i64 {
        handle
            .0
            .downcast_ref::<LoopbackHandleState>()
            .map(|s| s.refcount.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn forward(
        &self,
        handle: &RawHandle,
        payload: Vec<u8>,
        completion: CompletionSink,
    ) -> Result<(), TransportError> {
        let state = handle
            .0
            .downcast_ref::<LoopbackHandleState>()
            .ok_or_else(|| TransportError::InvalidArgument("not a loopback handle".into()))?;
        let dest_name = state
            .dest
            .lock()
            .clone()
            .ok_or_else(|| TransportError::InvalidArgument("handle has no destination".into()))?;
        let target = Self::find_node(&dest_name)
            .ok_or_else(|| TransportError::NoDevice(format!("peer {dest_name:?} is gone")))?;
        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(from = %self.inner.name, to = %dest_name, req_id, "forwarding rpc");
        self.inner.pending_forwards.lock().insert(req_id, completion);
        target.inbound.lock().push_back(PendingInbound {
            rpc_id: state.id.load(Ordering::SeqCst),
            payload,
            origin: self.inner.self_weak.get().unwrap().clone(),
            req_id,
        });
        if let Some(origin_wake) = network().lock().get(&target.name).and_then(Weak::upgrade) {
            let _g = origin_wake.wake_mtx.lock();
            origin_wake.wake.notify_all();
        }
        Ok(())
    }

    fn respond(
        &self,
        handle: &RawHandle,
        payload: Vec<u8>,
        completion: CompletionSink,
    ) -> Result<(), TransportError> {
        let state = handle
            .0
            .downcast_ref::<LoopbackHandleState>()
            .ok_or_else(|| TransportError::InvalidArgument("not a loopback handle".into()))?;
        let ticket = state
            .reply
            .as_ref()
            .ok_or_else(|| TransportError::InvalidArgument("handle has no reply path".into()))?;
        let origin = ticket
            .origin
            .upgrade()
            .ok_or_else(|| TransportError::NoDevice("origin is gone".into()))?;
        let req_id = ticket.req_id;
        if let Some(origin_completion) = origin.pending_forwards.lock().remove(&req_id) {
            origin
                .ready
                .lock()
                .push_back(Box::new(move || origin_completion(Ok(payload))));
            let _g = origin.wake_mtx.lock();
            origin.wake.notify_all();
        }
        // The local respond() call itself completes immediately (fire-and-forget),
        // but its completion is still only run from this node's own trigger().
        self.inner.ready.lock().push_back(Box::new(move || completion(Ok(Vec::new()))));
        self.wake_one();
        Ok(())
    }

    fn cancel(&self, handle: &RawHandle) -> Result<(), TransportError> {
        let _ = handle;
        // Best-effort: loopback operations complete synchronously at
        // submission time, so by the time cancel() can run there is
        // nothing left in flight to interrupt.
        Ok(())
    }

    fn bulk_create(&self, segments: Vec<BulkSegment>, kind: BulkKind) -> Result<BulkHandle, TransportError> {
        let id = self.inner.next_bulk_id.fetch_add(1, Ordering::SeqCst);
        self.inner.bulks.lock().insert(id, LoopbackBulk { segments, kind });
        Ok(BulkHandle(Arc::new((self.inner.name.clone(), id))))
    }

    fn bulk_free(&self, handle: BulkHandle) {
        if let Some((_, id)) = handle.0.downcast_ref::<(String, u64)>() {
            self.inner.bulks.lock().remove(id);
        }
    }

    fn bulk_serialize(&self, handle: &BulkHandle) -> Vec<u8> {
        if let Some((owner, id)) = handle.0.downcast_ref::<(String, u64)>() {
            let mut out = owner.clone().into_bytes();
            out.push(0);
            out.extend_from_slice(&id.to_be_bytes());
            out
        } else {
            Vec::new()
        }
    }

    fn bulk_deserialize(&self, bytes: &[u8]) -> Result<BulkHandle, TransportError> {
        let split = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| TransportError::InvalidArgument("malformed bulk token".into()))?;
        let owner = String::from_utf8(bytes[..split].to_vec())
            .map_err(|e| TransportError::InvalidArgument(e.to_string()))?;
        let id_bytes: [u8; 8] = bytes[split + 1..]
            .try_into()
            .map_err(|_| TransportError::InvalidArgument("malformed bulk token".into()))?;
        Ok(BulkHandle(Arc::new((owner, u64::from_be_bytes(id_bytes)))))
    }

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
    ) -> Result<CancelToken, TransportError> {
        let _ = origin_addr;
        let origin_owner = origin
            .0
            .downcast_ref::<(String, u64)>()
            .ok_or_else(|| TransportError::InvalidArgument("not a loopback bulk handle".into()))?;
        let local_owner = local
            .0
            .downcast_ref::<(String, u64)>()
            .ok_or_else(|| TransportError::InvalidArgument("not a loopback bulk handle".into()))?;
        let origin_node = Self::find_node(&origin_owner.0)
            .ok_or_else(|| TransportError::NoDevice("bulk origin peer is gone".into()))?;
        let local_node = Self::find_node(&local_owner.0)
            .ok_or_else(|| TransportError::NoDevice("bulk local peer is gone".into()))?;

        let result = (|| -> Result<(), TransportError> {
            let origin_bulks = origin_node.bulks.lock();
            let origin_bulk = origin_bulks
                .get(&origin_owner.1)
                .ok_or_else(|| TransportError::NoEntry("origin bulk handle".into()))?;
            let local_bulks = local_node.bulks.lock();
            let local_bulk = local_bulks
                .get(&local_owner.1)
                .ok_or_else(|| TransportError::NoEntry("local bulk handle".into()))?;

            match op {
                BulkOp::Pull => {
                    let bytes = read_at(&origin_bulk.segments, origin_offset, size)?;
                    write_at(&local_bulk.segments, local_offset, &bytes)
                }
                BulkOp::Push => {
                    let bytes = read_at(&local_bulk.segments, local_offset, size)?;
                    write_at(&origin_bulk.segments, origin_offset, &bytes)
                }
            }
        })();

        self.inner.ready.lock().push_back(Box::new(move || completion(result.map(|_| Vec::new()))));
        self.wake_one();
        Ok(CancelToken(Arc::new(())))
    }

    fn cancel_bulk(&self, _token: &CancelToken) -> Result<(), TransportError> {
        Ok(())
    }

    fn progress(&self, timeout_ms: u64) -> Result<ProgressOutcome, TransportError> {
        let has_work = || !self.inner.inbound.lock().is_empty() || !self.inner.ready.lock().is_empty();
        if has_work() {
            return Ok(ProgressOutcome::Success);
        }
        if timeout_ms == 0 {
            return Ok(ProgressOutcome::Timeout);
        }
        let mut guard = self.inner.wake_mtx.lock();
        self.inner
            .wake
            .wait_for(&mut guard, Duration::from_millis(timeout_ms));
        drop(guard);
        Ok(if has_work() {
            ProgressOutcome::Success
        } else {
            ProgressOutcome::Timeout
        })
    }

    fn set_rpc_received_callback(&self, callback: InboundSink) {
        *self.inner.rpc_received.lock() = Some(callback);
    }

    fn trigger(&self, _timeout_ms: u64, max_count: usize) -> Result<usize, TransportError> {
        let mut triggered = 0usize;
        while triggered < max_count {
            let next = self.inner.ready.lock().pop_front();
            match next {
                Some(job) => {
                    job();
                    triggered += 1;
                }
                None => break,
            }
        }
        while triggered < max_count {
            let next = self.inner.inbound.lock().pop_front();
            match next {
                Some(delivery) => {
                    let handle = RawHandle(Arc::new(LoopbackHandleState {
                        dest: Mutex::new(None),
                        id: AtomicU64::new(delivery.rpc_id),
                        refcount: AtomicI64::new(1),
                        reply: Some(ReplyTicket {
                            origin: delivery.origin,
                            req_id: delivery.req_id,
                        }),
                    }));
                    if let Some(cb) = self.inner.rpc_received.lock().as_ref() {
                        cb(delivery.rpc_id, handle, delivery.payload);
                    }
                    triggered += 1;
                }
                None => break,
            }
        }
        Ok(triggered)
    }
}

/// Read `size` bytes starting at `offset` from a segment list, treating
/// it as one logical contiguous region (the same view `HG_Bulk_access`
/// gives callers of a multi-segment bulk handle).
fn read_at(segments: &[BulkSegment], offset: usize, size: usize) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::with_capacity(size);
    let mut skip = offset;
    for seg in segments {
        if out.len() == size {
            break;
        }
        if skip >= seg.len {
            skip -= seg.len;
            continue;
        }
        let data = seg.data.lock();
        let start = seg.offset + skip;
        let avail = seg.len - skip;
        let take = avail.min(size - out.len());
        out.extend_from_slice(&data[start..start + take]);
        skip = 0;
    }
    if out.len() != size {
        return Err(TransportError::InvalidArgument(
            "bulk transfer size exceeds segment bounds".into(),
        ));
    }
    Ok(out)
}

fn write_at(segments: &[BulkSegment], offset: usize, bytes: &[u8]) -> Result<(), TransportError> {
    let mut written = 0usize;
    let mut skip = offset;
    for seg in segments {
        if written == bytes.len() {
            break;
        }
        if skip >= seg.len {
            skip -= seg.len;
            continue;
        }
        let mut data = seg.data.lock();
        let start = seg.offset + skip;
        let avail = seg.len - skip;
        let take = avail.min(bytes.len() - written);
        data[start..start + take].copy_from_slice(&bytes[written..written + take]);
        written += take;
        skip = 0;
    }
    if written != bytes.len() {
        return Err(TransportError::InvalidArgument(
            "bulk transfer size exceeds segment bounds".into(),
        ));
    }
    Ok(())
}
