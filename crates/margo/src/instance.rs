use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use margo_config::MargoConfig;
use margo_transport::{Address, BulkHandle, BulkKind, BulkOp, BulkSegment, CancelToken, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, debug_span, info, warn};

use crate::abt::{pool::AccessClass, pool::PoolKind, ArgobotsSubstrate, Pool};
use crate::diagnostics::{Diagnostics, DiagnosticsCounters};
use crate::envelope::Envelope;
use crate::error::{ErrorKind, MargoError};
use crate::finalize::FinalizeState;
use crate::handle_cache::HandleCache;
use crate::monitor::{Monitor, MonitorEvent, NullMonitor};
use crate::progress::{self, ProgressState};
use crate::registry::{HandlerContext, RpcHandler, RpcRegistry};
use crate::request;
use crate::timer::TimerWheel;

thread_local! {
    static CURRENT_RPC_ID: RefCell<HashMap<usize, u64>> = RefCell::new(HashMap::new());
}

/// Sentinel used for "no parent RPC".
pub const NO_PARENT_RPC_ID: u64 = 0;

const SHUTDOWN_RPC_NAME: &str = "__shutdown__";

/// The root object. Owns, in dependency order, the Argobots substrate,
/// the transport substrate, the handle cache, the timer wheel, the RPC
/// registry, the progress ULT, and an optional monitor. `Arc<Instance>`
/// stands in for an explicit reference-count field — every
/// outstanding handle, pending request, and handler ULT holds a clone.
pub struct Instance {
    transport: Arc<dyn Transport>,
    substrate: Arc<ArgobotsSubstrate>,
    registry: RpcRegistry,
    handle_cache: HandleCache,
    timers: TimerWheel,
    finalize: FinalizeState,
    progress_state: ProgressState,
    diagnostics: DiagnosticsCounters,
    monitor: Arc<dyn Monitor>,
    self_weak: OnceLock<Weak<Instance>>,
    shutdown_rpc_id: OnceLock<u64>,
}

struct ShutdownHandler {
    instance: Weak<Instance>,
}

#[async_trait::async_trait]
impl RpcHandler for ShutdownHandler {
    async fn handle(&self, ctx: HandlerContext) {
        if let Some(instance) = self.instance.upgrade() {
            info!("received __shutdown__, requesting finalize");
            instance.finalize();
        }
        let envelope = Envelope::success_response(Vec::new());
        let _ = ctx.instance.respond_raw(ctx.handle, envelope).await;
    }
}

impl Instance {
    /// Build the substrate from the configuration document, then wire
    /// up everything else and spawn the progress ULT.
    pub fn init(
        config: &MargoConfig,
        transport: Arc<dyn Transport>,
        monitor: Option<Arc<dyn Monitor>>,
        enable_remote_shutdown: bool,
    ) -> Result<Arc<Self>, MargoError> {
        margo_config::validate(config, false)
            .map(|warnings| {
                for w in warnings {
                    warn!("{w}");
                }
            })
            .map_err(|e| MargoError::InvalidArgument(e.to_string()))?;

        let substrate = ArgobotsSubstrate::new();
        for pool_cfg in &config.argobots.pools {
            if pool_cfg.name.as_deref() == Some("__primary__") {
                continue;
            }
            let kind = match pool_cfg.kind {
                margo_config::PoolKindConfig::BlockingFifo => PoolKind::BlockingFifo,
                margo_config::PoolKindConfig::Fifo => PoolKind::BasicFifo,
                margo_config::PoolKindConfig::RandomWorkStealing => PoolKind::RandomWorkStealing,
                margo_config::PoolKindConfig::PriorityBlocking => PoolKind::PriorityBlocking,
                margo_config::PoolKindConfig::External => PoolKind::External,
            };
            let access = match pool_cfg.access {
                margo_config::AccessConfig::Private => AccessClass::Private,
                margo_config::AccessConfig::Spsc => AccessClass::Spsc,
                margo_config::AccessConfig::Mpsc => AccessClass::Mpsc,
                margo_config::AccessConfig::Spmc => AccessClass::Spmc,
                margo_config::AccessConfig::Mpmc => AccessClass::Mpmc,
            };
            substrate
                .add_pool(pool_cfg.name.clone(), kind, access, true)
                .map_err(|e| MargoError::InvalidArgument(e.to_string()))?;
        }
        for es_cfg in &config.argobots.xstreams {
            if es_cfg.name.as_deref() == Some("__primary__") {
                continue;
            }
            let pool_names: Vec<String> = es_cfg
                .scheduler
                .pools
                .iter()
                .map(|p| match p {
                    margo_config::PoolRef::Name(n) => n.clone(),
                    margo_config::PoolRef::Index(i) => config
                        .argobots
                        .pools
                        .get(*i)
                        .and_then(|p| p.name.clone())
                        .unwrap_or_else(|| "__primary__".to_string()),
                })
                .collect();
            substrate
                .add_xstream(es_cfg.name.clone(), Some(es_cfg.affinity.clone()), pool_names, true)
                .map_err(|e| MargoError::InvalidArgument(e.to_string()))?;
        }
        substrate
            .set_progress_pool(&config.progress_pool)
            .map_err(|e| MargoError::InvalidArgument(e.to_string()))?;
        substrate
            .set_rpc_pool(&config.rpc_pool)
            .map_err(|e| MargoError::InvalidArgument(e.to_string()))?;

        let handle_cache = HandleCache::new(transport.clone(), config.handle_cache_size, transport.self_address());

        let instance = Arc::new_cyclic(|weak: &Weak<Instance>| Self {
            transport: transport.clone(),
            substrate,
            registry: RpcRegistry::new(transport.clone()),
            handle_cache,
            timers: TimerWheel::new(),
            finalize: FinalizeState::new(),
            progress_state: ProgressState::new(config.progress_timeout_ub_msec, config.progress_spindown_msec),
            diagnostics: DiagnosticsCounters::new(),
            monitor: monitor.unwrap_or_else(|| Arc::new(NullMonitor)),
            self_weak: {
                let cell = OnceLock::new();
                let _ = cell.set(weak.clone());
                cell
            },
            shutdown_rpc_id: OnceLock::new(),
        });

        if enable_remote_shutdown {
            let id = instance.registry.register(
                SHUTDOWN_RPC_NAME,
                instance.substrate.rpc_pool(),
                Arc::new(ShutdownHandler {
                    instance: Arc::downgrade(&instance),
                }),
            )?;
            let _ = instance.shutdown_rpc_id.set(id);
        }

        {
            let weak = Arc::downgrade(&instance);
            transport.set_rpc_received_callback(Box::new(move |rpc_id, handle, payload| {
                let Some(instance) = weak.upgrade() else { return };
                instance.dispatch_inbound(rpc_id, handle, payload);
            }));
        }

        let progress_pool = instance.substrate.progress_pool();
        crate::abt::spawn(&progress_pool, progress::run(instance.clone()));

        Ok(instance)
    }

    fn dispatch_inbound(self: &Arc<Self>, rpc_id: u64, handle: margo_transport::RawHandle, payload: Vec<u8>) {
        let entry = self.registry.resolve_for_dispatch(rpc_id, self.substrate.rpc_pool());
        let envelope = match Envelope::decode(&payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping inbound message with malformed envelope");
                return;
            }
        };
        self.finalize.incr_pending();
        let instance = self.clone();
        let pool = entry.pool.clone();
        let handler = entry.handler.clone();
        let name = entry.name.clone();
        crate::abt::spawn(&pool, async move {
            let span = debug_span!("margo::rpc", name = %name, id = rpc_id);
            let _enter = span.enter();
            instance.monitor().on_event(&MonitorEvent::RpcHandlerBegin {
                rpc_id,
                name: name.clone(),
            });
            instance.set_current_rpc_id(rpc_id);
            let ctx = HandlerContext {
                instance: instance.clone(),
                handle,
                payload: envelope.payload,
                parent_rpc_id: envelope.parent_rpc_id,
                rpc_id,
            };
            handler.handle(ctx).await;
            instance.clear_current_rpc_id();
            instance.monitor().on_event(&MonitorEvent::RpcHandlerEnd { rpc_id, name });
            if instance.finalize.decr_pending_triggers_finalize() {
                instance.drive_finalize_from_last_operation();
            }
        });
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak.get().expect("self_weak set in init").upgrade().expect("instance alive")
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn substrate(&self) -> &Arc<ArgobotsSubstrate> {
        &self.substrate
    }

    pub(crate) fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    pub(crate) fn finalize_state(&self) -> &FinalizeState {
        &self.finalize
    }

    pub(crate) fn progress_state(&self) -> &ProgressState {
        &self.progress_state
    }

    pub(crate) fn diagnostics(&self) -> &DiagnosticsCounters {
        &self.diagnostics
    }

    pub fn monitor(&self) -> &Arc<dyn Monitor> {
        &self.monitor
    }

    fn instance_key(&self) -> usize {
        self as *const Self as usize
    }

    fn set_current_rpc_id(&self, id: u64) {
        CURRENT_RPC_ID.with(|c| c.borrow_mut().insert(self.instance_key(), id));
    }

    fn clear_current_rpc_id(&self) {
        CURRENT_RPC_ID.with(|c| c.borrow_mut().remove(&self.instance_key()));
    }

    /// The thread-local `current_rpc_id`. Keyed per-instance so nested
    /// instances in test harnesses don't collide.
    pub fn current_rpc_id(&self) -> u64 {
        CURRENT_RPC_ID.with(|c| c.borrow().get(&self.instance_key()).copied().unwrap_or(NO_PARENT_RPC_ID))
    }

    pub fn register<H: RpcHandler + 'static>(&self, name: &str, handler: H) -> Result<u64, MargoError> {
        self.registry.register(name, self.substrate.rpc_pool(), Arc::new(handler))
    }

    pub fn register_on_pool<H: RpcHandler + 'static>(
        &self,
        name: &str,
        pool: &Arc<Pool>,
        handler: H,
    ) -> Result<u64, MargoError> {
        self.registry.register(name, pool.clone(), Arc::new(handler))
    }

    pub fn provider_register<H: RpcHandler + 'static>(
        &self,
        name: &str,
        provider: u16,
        handler: H,
    ) -> Result<u64, MargoError> {
        self.registry
            .provider_register(name, provider, self.substrate.rpc_pool(), Arc::new(handler))
    }

    pub fn deregister(&self, id: u64) -> Result<(), MargoError> {
        self.registry.deregister(id)
    }

    pub fn lookup(&self, address_str: &str) -> Result<Address, MargoError> {
        Ok(self.transport.lookup(address_str)?)
    }

    /// Forward a typed request to `name`/`provider` at `addr_str`.
    /// JSON-encodes the request and decodes the response with the
    /// default codec; use [`Instance::forward_raw`] to supply payload
    /// bytes directly.
    pub async fn forward<Req, Resp>(
        &self,
        addr_str: &str,
        name: &str,
        provider: u16,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp, MargoError>
    where
        Req: Serialize + Send + Sync,
        Resp: DeserializeOwned,
    {
        let encoded = serde_json::to_vec(request).map_err(|e| MargoError::Other(e.to_string()))?;
        let response_bytes = self.forward_raw(addr_str, name, provider, encoded, timeout).await?;
        serde_json::from_slice(&response_bytes).map_err(|e| MargoError::Other(e.to_string()))
    }

    pub async fn forward_raw(
        &self,
        addr_str: &str,
        name: &str,
        provider: u16,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, MargoError> {
        let instance = self.arc();
        let addr = self.transport.lookup(addr_str)?;
        // Step 1: resolve the effective id (on-demand local registration, §4.2 step 1).
        let effective_id = self.registry.effective_id(name, provider, self.substrate.rpc_pool())?;
        // Step 2: reset/acquire a handle pointed at destination+id.
        let (handle, from_cache) = self.handle_cache.acquire(addr, effective_id)?;
        // Step 3: parent id from the thread-local key.
        let parent_rpc_id = self.current_rpc_id();
        // Step 4: package the envelope.
        let envelope = Envelope::request(parent_rpc_id, payload).encode();

        self.monitor().on_event(&MonitorEvent::ForwardBegin { rpc_id: effective_id });

        let submit_handle = handle.clone();
        let cancel_handle = handle.clone();
        let transport = self.transport.clone();
        let cancel_transport = self.transport.clone();
        let result = request::drive(
            &instance,
            timeout,
            move |sink| transport.forward(&submit_handle, envelope, sink),
            move || {
                let _ = cancel_transport.cancel(&cancel_handle);
            },
        )
        .await;

        if from_cache {
            self.handle_cache.release(handle);
        } else {
            self.transport.destroy_handle(handle);
        }

        self.monitor().on_event(&MonitorEvent::ForwardEnd {
            rpc_id: effective_id,
            success: result.is_ok(),
        });

        // Decode the response envelope to recover the
        // application-level error code.
        let bytes = result?;
        Envelope::decode(&bytes)?.into_result()
    }

    /// Send a response envelope carrying `envelope`'s error code/payload.
    /// Used both by user handlers (via the typed wrapper handlers build
    /// themselves) and internally for sentinel "no such RPC"/error
    /// responses.
    pub async fn respond_raw(&self, handle: margo_transport::RawHandle, envelope: Envelope) -> Result<(), MargoError> {
        let instance = self.arc();
        let bytes = envelope.encode();
        let transport = self.transport.clone();
        let submit_handle = handle.clone();
        let cancel_transport = self.transport.clone();
        let cancel_handle = handle.clone();
        request::drive(
            &instance,
            None,
            move |sink| transport.respond(&submit_handle, bytes, sink),
            move || {
                let _ = cancel_transport.cancel(&cancel_handle);
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn respond<Resp: Serialize>(&self, handle: margo_transport::RawHandle, value: &Resp) -> Result<(), MargoError> {
        let payload = serde_json::to_vec(value).map_err(|e| MargoError::Other(e.to_string()))?;
        self.respond_raw(handle, Envelope::success_response(payload)).await
    }

    pub async fn respond_error(&self, handle: margo_transport::RawHandle, kind: ErrorKind, message: impl Into<String>) -> Result<(), MargoError> {
        self.respond_raw(handle, Envelope::error_response(kind, message)).await
    }

    /// One sub-transfer of a bulk operation; public so
    /// [`crate::bulk::chunked_transfer`] can drive many in parallel.
    #[allow(clippy::too_many_arguments)]
    pub async fn bulk_transfer_one(
        self: &Arc<Self>,
        op: BulkOp,
        origin_addr: Address,
        origin: BulkHandle,
        origin_offset: usize,
        local: BulkHandle,
        local_offset: usize,
        size: usize,
        timeout: Option<Duration>,
    ) -> Result<(), MargoError> {
        let transport = self.transport.clone();
        let cancel_transport = self.transport.clone();
        let cancel_token: Arc<OnceLock<CancelToken>> = Arc::new(OnceLock::new());
        let cancel_token_for_submit = cancel_token.clone();
        let cancel_token_for_cancel = cancel_token.clone();
        request::drive(
            self,
            timeout,
            move |sink| {
                let token = transport.bulk_transfer(op, origin_addr, origin, origin_offset, local, local_offset, size, sink)?;
                let _ = cancel_token_for_submit.set(token);
                Ok(())
            },
            move || {
                if let Some(token) = cancel_token_for_cancel.get() {
                    let _ = cancel_transport.cancel_bulk(token);
                }
            },
        )
        .await
        .map(|_| ())
    }

    pub fn bulk_create(&self, segments: Vec<BulkSegment>, kind: BulkKind) -> Result<BulkHandle, MargoError> {
        Ok(self.transport.bulk_create(segments, kind)?)
    }

    pub fn bulk_free(&self, handle: BulkHandle) {
        self.transport.bulk_free(handle);
    }

    /// Move the progress ULT onto `new_pool_name`. Repoints
    /// the substrate's progress-pool pointer (used for heuristic
    /// sampling) and requests the actual relocation; the running
    /// progress loop picks the request up at the top of its next
    /// iteration, re-spawns itself onto the new pool, and ends its old
    /// task there — so the old pool's execution stream can safely be
    /// removed once this call returns and the next iteration has run.
    pub fn migrate_progress(&self, new_pool_name: &str) -> Result<(), MargoError> {
        let pool = self
            .substrate
            .pool(new_pool_name)
            .ok_or_else(|| MargoError::InvalidArgument(format!("no such pool: {new_pool_name}")))?;
        self.substrate
            .migrate_progress(new_pool_name)
            .map_err(|e| MargoError::InvalidArgument(e.to_string()))?;
        self.progress_state.request_migration(pool);
        Ok(())
    }

    pub fn diagnostics_snapshot(&self) -> Diagnostics {
        Diagnostics {
            num_progress_calls: self.diagnostics.num_progress_calls.load(Ordering::Relaxed),
            num_trigger_calls: self.diagnostics.num_trigger_calls.load(Ordering::Relaxed),
            timers_armed: self.diagnostics.timers_armed.load(Ordering::Relaxed),
            timers_fired: self.diagnostics.timers_fired.load(Ordering::Relaxed),
            handle_cache_hits: self.handle_cache.hit_count(),
            handle_cache_misses: self.handle_cache.miss_count(),
            handle_cache_in_use: self.handle_cache.in_use_count(),
            pending_operations: self.finalize.pending_count(),
        }
    }

    /// Phase 1 of finalize. If no handler ULT is in flight,
    /// drives phase 2 immediately; otherwise the last one to exit does.
    pub fn finalize(self: &Arc<Self>) {
        if self.finalize.request_finalize() {
            self.drive_finalize_from_last_operation();
        }
    }

    pub(crate) fn drive_finalize_from_last_operation(self: &Arc<Self>) {
        let instance = self.clone();
        std::thread::spawn(move || {
            instance.run_finalize_phase2();
        });
    }

    fn run_finalize_phase2(self: &Arc<Self>) {
        self.monitor().on_event(&MonitorEvent::FinalizeBegin);
        // The progress ULT notices this at the top of its next iteration,
        // or after its current blocking-progress call times out — at most
        // one `progress_timeout_ub_msec` later.
        self.progress_state.shutdown_flag.store(true, Ordering::Release);
        self.finalize.wait_progress_drained();
        self.substrate.shutdown_all();
        debug!(diagnostics = ?self.diagnostics_snapshot(), "margo instance finalized");
        let last_out = self.finalize.mark_finalized();
        self.monitor().on_event(&MonitorEvent::FinalizeEnd);
        if last_out {
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        debug!("running margo instance cleanup");
    }

    pub fn wait_for_finalize(&self) {
        if self.finalize.wait_for_finalize() {
            self.cleanup();
        }
    }

    pub fn finalize_and_wait(self: &Arc<Self>) {
        self.finalize();
        self.wait_for_finalize();
    }

    pub fn is_finalized(&self) -> bool {
        self.finalize.is_finalized()
    }
}
