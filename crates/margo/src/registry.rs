use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::abt::Pool;
use crate::envelope::Envelope;
use crate::error::{ErrorKind, MargoError};
use crate::identifier::{demux, mux};
use crate::instance::Instance;

/// Everything a handler ULT is given: the inbound handle
/// (for `respond`), the decoded-later request payload, and the parent
/// RPC id recovered from the envelope, published here and in the
/// instance's thread-local key before the handler runs.
pub struct HandlerContext {
    pub instance: Arc<Instance>,
    pub handle: margo_transport::RawHandle,
    pub payload: Vec<u8>,
    pub parent_rpc_id: u64,
    pub rpc_id: u64,
}

/// A registered RPC's server-side logic. Object-safe so the registry
/// can hold `Arc<dyn RpcHandler>` without becoming generic per-RPC.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext);
}

/// Installed for a muxed id with no matching registration at all:
/// responds `no-entry` and drops the handle.
pub(crate) struct NullHandler;

#[async_trait]
impl RpcHandler for NullHandler {
    async fn handle(&self, ctx: HandlerContext) {
        let envelope = Envelope::error_response(ErrorKind::NoEntry, "no matching registration");
        let _ = ctx.instance.respond_raw(ctx.handle, envelope).await;
    }
}

/// Installed for a muxed id whose base name is registered, but not
/// under this provider: responds `no-match` rather than `no-entry`, so
/// the origin can tell "nothing here by that name" apart from "this
/// service doesn't run under that provider id".
pub(crate) struct NoMatchHandler {
    pub name: String,
    pub provider: u16,
}

#[async_trait]
impl RpcHandler for NoMatchHandler {
    async fn handle(&self, ctx: HandlerContext) {
        let envelope = Envelope::no_match_response(self.name.clone(), self.provider);
        let _ = ctx.instance.respond_raw(ctx.handle, envelope).await;
    }
}

pub struct RegistryEntry {
    pub name: String,
    pub pool: Arc<Pool>,
    pub handler: Arc<dyn RpcHandler>,
}

/// Keyed by the 64-bit RPC identifier. One mutex guards the whole
/// table; on-demand provider registration is serialized for free by
/// taking that same lock for the whole check-then-insert, so
/// concurrent forwarders to an unregistered `(name, provider)` pair
/// never race each other into a duplicate registration.
pub struct RpcRegistry {
    transport: Arc<dyn margo_transport::Transport>,
    entries: Mutex<HashMap<u64, RegistryEntry>>,
    by_name: Mutex<HashMap<String, u64>>,
}

impl RpcRegistry {
    pub fn new(transport: Arc<dyn margo_transport::Transport>) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
        }
    }

    /// Register `name` against `pool`/`handler` at provider 0 (no
    /// provider). Returns the effective id.
    pub fn register(
        &self,
        name: &str,
        pool: Arc<Pool>,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<u64, MargoError> {
        self.provider_register(name, 0, pool, handler)
    }

    pub fn provider_register(
        &self,
        name: &str,
        provider: u16,
        pool: Arc<Pool>,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<u64, MargoError> {
        let base_id = self.transport.register_rpc(name)?;
        let id = mux(base_id, provider);
        let mut entries = self.entries.lock();
        entries.insert(
            id,
            RegistryEntry {
                name: name.to_string(),
                pool,
                handler,
            },
        );
        self.by_name.lock().insert(name.to_string(), base_id);
        debug!(name, provider, id, "registered rpc");
        Ok(id)
    }

    pub fn deregister(&self, id: u64) -> Result<(), MargoError> {
        let mut entries = self.entries.lock();
        entries
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| MargoError::NoEntry(format!("rpc id {id:#x}")))
    }

    /// Resolve `(name, provider)` to its effective id for `forward`'s
    /// step 1. A pure client that never called [`RpcRegistry::register`]
    /// for `name` still needs a valid id to put on the wire, so if
    /// either the base name or this exact provider-muxed id isn't
    /// registered locally yet, it is registered on demand using the
    /// base RPC's codecs (implicit — the caller already encoded the
    /// payload) and the sentinel no-entry handler.
    /// Holding `entries`/`by_name` for the whole check-then-insert
    /// serializes this per `(name, provider)` pair.
    pub fn effective_id(&self, name: &str, provider: u16, default_pool: Arc<Pool>) -> Result<u64, MargoError> {
        let mut by_name = self.by_name.lock();
        let base_id = match by_name.get(name) {
            Some(id) => *id,
            None => {
                let id = self.transport.register_rpc(name)?;
                by_name.insert(name.to_string(), id);
                id
            }
        };
        drop(by_name);
        let effective = mux(base_id, provider);
        let mut entries = self.entries.lock();
        entries.entry(effective).or_insert_with(|| RegistryEntry {
            name: name.to_string(),
            pool: default_pool,
            handler: Arc::new(NullHandler),
        });
        Ok(effective)
    }

    /// Look up the entry for an inbound muxed id. If the
    /// base (hash) part is known under a different provider but this
    /// exact muxed id is not, that is `no-match` (registration name
    /// known but not for this provider) rather than `no-entry`.
    pub fn lookup(&self, id: u64) -> Option<RegistryEntryView> {
        let entries = self.entries.lock();
        entries.get(&id).map(|e| RegistryEntryView {
            name: e.name.clone(),
            pool: e.pool.clone(),
            handler: e.handler.clone(),
        })
    }

    /// `fallback_pool` is where the sentinel `NullHandler`/`NoMatchHandler`
    /// runs when `id` matches no registration at all — it must be a pool
    /// some execution stream actually schedules (the instance's
    /// `rpc_pool`, per the caller), never an ad hoc unscheduled pool, or
    /// the sentinel's response is queued but never polled and the origin
    /// hangs until its own timeout instead of seeing `no-entry`/`no-match`.
    pub fn resolve_for_dispatch(&self, id: u64, fallback_pool: Arc<Pool>) -> RegistryEntryView {
        if let Some(view) = self.lookup(id) {
            return view;
        }
        let (base, provider) = demux(id);
        let known_name = {
            let by_name = self.by_name.lock();
            by_name
                .iter()
                .find(|(_, bid)| **bid == base)
                .map(|(n, _)| n.clone())
        };
        match known_name {
            Some(name) => {
                debug!(name, provider, id, "no-match, dispatching sentinel");
                RegistryEntryView {
                    name: name.clone(),
                    pool: fallback_pool,
                    handler: Arc::new(NoMatchHandler { name, provider }),
                }
            }
            None => {
                debug!(provider, id, "no-entry, dispatching sentinel");
                RegistryEntryView {
                    name: "<unknown>".to_string(),
                    pool: fallback_pool,
                    handler: Arc::new(NullHandler),
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct RegistryEntryView {
    pub name: String,
    pub pool: Arc<Pool>,
    pub handler: Arc<dyn RpcHandler>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abt::pool::AccessClass;
    use crate::identifier::mux;
    use margo_transport::loopback::LoopbackTransport;

    struct Noop;
    #[async_trait]
    impl RpcHandler for Noop {
        async fn handle(&self, _ctx: HandlerContext) {}
    }

    fn fresh_registry(node: &str) -> RpcRegistry {
        let transport: Arc<dyn margo_transport::Transport> = LoopbackTransport::new(node);
        RpcRegistry::new(transport)
    }

    fn pool() -> Arc<Pool> {
        Pool::new("p", crate::abt::pool::PoolKind::BlockingFifo, AccessClass::Mpmc, true)
    }

    #[test]
    fn lookup_recovers_the_registered_provider() {
        let registry = fresh_registry("reg-lookup");
        let id = registry.provider_register("svc", 7, pool(), Arc::new(Noop)).unwrap();
        let (base, provider) = demux(id);
        assert_eq!(provider, 7);
        assert_eq!(mux(base, 7), id);
        assert!(registry.lookup(id).is_some());
    }

    #[test]
    fn effective_id_registers_a_pure_client_on_demand() {
        let registry = fresh_registry("reg-client-only");
        // Never called register()/provider_register() — mirrors a pure
        // client that only ever forwards.
        let id = registry.effective_id("never_registered", 0, pool()).unwrap();
        assert!(registry.lookup(id).is_some());
        // Calling it again for the same (name, provider) must not create
        // a second entry or re-register with the transport.
        let id2 = registry.effective_id("never_registered", 0, pool()).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn resolve_for_dispatch_distinguishes_no_match_from_no_entry() {
        let registry = fresh_registry("reg-dispatch");
        let id = registry.provider_register("svc", 42, pool(), Arc::new(Noop)).unwrap();
        let (base, _) = demux(id);

        // Same name, different (unregistered) provider: no-match.
        let other_provider_id = mux(base, 43);
        let view = registry.resolve_for_dispatch(other_provider_id, pool());
        assert_eq!(view.name, "svc");

        // A base id nobody has ever registered: no-entry.
        let unknown_id = mux(0xffff_0000_0000_0000, 1);
        let view = registry.resolve_for_dispatch(unknown_id, pool());
        assert_eq!(view.name, "<unknown>");
    }

    #[test]
    fn deregister_is_idempotent_failure_on_second_call() {
        let registry = fresh_registry("reg-deregister");
        let id = registry.register("svc", pool(), Arc::new(Noop)).unwrap();
        assert!(registry.deregister(id).is_ok());
        assert!(registry.deregister(id).is_err());
    }
}
