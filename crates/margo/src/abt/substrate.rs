use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::pool::{AccessClass, Pool, PoolKind};
use super::stream::ExecutionStream;

pub const PRIMARY_ES: &str = "__primary__";
pub const PRIMARY_POOL: &str = "__primary__";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("no such pool: {0}")]
    NoSuchPool(String),
    #[error("no such execution stream: {0}")]
    NoSuchXstream(String),
    #[error("pool {0} is still referenced or non-empty")]
    PoolInUse(String),
    #[error("the __primary__ execution stream cannot be removed")]
    PrimaryXstreamProtected,
    #[error("duplicate name: {0}")]
    DuplicateName(String),
}

struct Inner {
    pools: HashMap<String, Arc<Pool>>,
    xstreams: HashMap<String, Arc<ExecutionStream>>,
    progress_pool: String,
    rpc_pool: String,
    next_pool_seq: usize,
    next_es_seq: usize,
}

/// Named pools and execution streams, plus the reference-counting and
/// `__primary__` invariants. One mutex guards the whole substrate.
///
/// **Decision table for `__primary__` handling**: rather than
/// replicate the original's distributed, init-order-dependent checks,
/// this substrate enforces a single rule regardless of how it came to
/// exist: the `__primary__` pool exists iff the `__primary__` ES
/// exists and is that ES's first scheduled pool. `new()` establishes
/// both together; nothing else is allowed to create one without the
/// other.
pub struct ArgobotsSubstrate {
    inner: Mutex<Inner>,
}

impl ArgobotsSubstrate {
    /// Construct the substrate with its mandatory `__primary__`
    /// pool/ES pair already wired together.
    pub fn new() -> Arc<Self> {
        let primary_pool = Pool::new(PRIMARY_POOL, PoolKind::BlockingFifo, AccessClass::Mpmc, true);
        let primary_es = ExecutionStream::new(PRIMARY_ES, true, None, vec![primary_pool.clone()]);

        let mut pools = HashMap::new();
        pools.insert(PRIMARY_POOL.to_string(), primary_pool);
        let mut xstreams = HashMap::new();
        xstreams.insert(PRIMARY_ES.to_string(), primary_es);

        Arc::new(Self {
            inner: Mutex::new(Inner {
                pools,
                xstreams,
                progress_pool: PRIMARY_POOL.to_string(),
                rpc_pool: PRIMARY_POOL.to_string(),
                next_pool_seq: 0,
                next_es_seq: 0,
            }),
        })
    }

    pub fn progress_pool(&self) -> Arc<Pool> {
        let inner = self.inner.lock();
        inner.pools[&inner.progress_pool].clone()
    }

    pub fn rpc_pool(&self) -> Arc<Pool> {
        let inner = self.inner.lock();
        inner.pools[&inner.rpc_pool].clone()
    }

    pub fn set_progress_pool(&self, name: &str) -> Result<(), SubstrateError> {
        let mut inner = self.inner.lock();
        if !inner.pools.contains_key(name) {
            return Err(SubstrateError::NoSuchPool(name.to_string()));
        }
        inner.progress_pool = name.to_string();
        Ok(())
    }

    pub fn set_rpc_pool(&self, name: &str) -> Result<(), SubstrateError> {
        let mut inner = self.inner.lock();
        if !inner.pools.contains_key(name) {
            return Err(SubstrateError::NoSuchPool(name.to_string()));
        }
        inner.rpc_pool = name.to_string();
        Ok(())
    }

    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.inner.lock().pools.get(name).cloned()
    }

    pub fn xstream(&self, name: &str) -> Option<Arc<ExecutionStream>> {
        self.inner.lock().xstreams.get(name).cloned()
    }

    fn generate_pool_name(inner: &mut Inner) -> String {
        let n = inner.next_pool_seq;
        inner.next_pool_seq += 1;
        format!("__pool_{n}__")
    }

    fn generate_es_name(inner: &mut Inner) -> String {
        let n = inner.next_es_seq;
        inner.next_es_seq += 1;
        format!("__xstream_{n}__")
    }

    /// Add a pool, at runtime or during config-driven setup. `name =
    /// None` generates `__pool_N__`.
    pub fn add_pool(
        &self,
        name: Option<String>,
        kind: PoolKind,
        access: AccessClass,
        owning: bool,
    ) -> Result<Arc<Pool>, SubstrateError> {
        let mut inner = self.inner.lock();
        let name = name.unwrap_or_else(|| Self::generate_pool_name(&mut inner));
        if inner.pools.contains_key(&name) {
            return Err(SubstrateError::DuplicateName(name));
        }
        let pool = Pool::new(name.clone(), kind, access, owning);
        inner.pools.insert(name, pool.clone());
        Ok(pool)
    }

    /// Adopt an externally-owned pool (not destroyed on teardown).
    pub fn add_external_pool(&self, name: String, pool: Arc<Pool>) -> Result<(), SubstrateError> {
        let mut inner = self.inner.lock();
        if inner.pools.contains_key(&name) {
            return Err(SubstrateError::DuplicateName(name));
        }
        inner.pools.insert(name, pool);
        Ok(())
    }

    pub fn add_xstream(
        &self,
        name: Option<String>,
        affinity: Option<Vec<i32>>,
        pool_names: Vec<String>,
        owning: bool,
    ) -> Result<Arc<ExecutionStream>, SubstrateError> {
        let mut inner = self.inner.lock();
        let name = name.unwrap_or_else(|| Self::generate_es_name(&mut inner));
        if inner.xstreams.contains_key(&name) {
            return Err(SubstrateError::DuplicateName(name));
        }
        let mut pools = Vec::with_capacity(pool_names.len());
        for pn in &pool_names {
            let pool = inner
                .pools
                .get(pn)
                .cloned()
                .ok_or_else(|| SubstrateError::NoSuchPool(pn.clone()))?;
            pools.push(pool);
        }
        let es = ExecutionStream::new(name.clone(), owning, affinity, pools);
        inner.xstreams.insert(name, es.clone());
        Ok(es)
    }

    /// Remove a pool. Fails while its reference count is non-zero or
    /// while it still has queued work.
    pub fn remove_pool(&self, name: &str) -> Result<(), SubstrateError> {
        let mut inner = self.inner.lock();
        if name == PRIMARY_POOL {
            return Err(SubstrateError::PoolInUse(name.to_string()));
        }
        let pool = inner
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| SubstrateError::NoSuchPool(name.to_string()))?;
        if pool.ref_count() > 0 || !pool.is_empty() {
            return Err(SubstrateError::PoolInUse(name.to_string()));
        }
        inner.pools.remove(name);
        Ok(())
    }

    /// Remove an execution stream. The `__primary__` ES can never be removed.
    pub fn remove_xstream(&self, name: &str) -> Result<(), SubstrateError> {
        if name == PRIMARY_ES {
            return Err(SubstrateError::PrimaryXstreamProtected);
        }
        let mut inner = self.inner.lock();
        let es = inner
            .xstreams
            .remove(name)
            .ok_or_else(|| SubstrateError::NoSuchXstream(name.to_string()))?;
        es.join();
        Ok(())
    }

    /// Repoint the substrate's notion of "the progress pool" at
    /// `new_pool`. This only updates what `progress_pool()`
    /// reports for heuristic sampling; it does not relocate the
    /// already-spawned progress ULT itself. Callers needing the actual
    /// migration (the ULT's `Task` moved between pools, so the old
    /// pool's ES can be retired) want [`crate::instance::Instance::migrate_progress`].
    pub fn migrate_progress(&self, new_pool: &str) -> Result<(), SubstrateError> {
        self.set_progress_pool(new_pool)
    }

    pub fn shutdown_all(&self) {
        let inner = self.inner.lock();
        for es in inner.xstreams.values() {
            es.shutdown();
        }
        for es in inner.xstreams.values() {
            es.join();
        }
    }
}
