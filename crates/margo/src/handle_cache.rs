use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use margo_transport::{Address, RawHandle, Transport, TransportError};

/// Reuse of expensive per-destination handles. Pre-creates
/// `capacity` handles with a null destination/id on construction;
/// `acquire` resets one from the free list, `release` returns it.
/// Protected by one mutex.
pub struct HandleCache {
    transport: Arc<dyn Transport>,
    free_list: Mutex<VecDeque<RawHandle>>,
    in_use: Mutex<HashMap<usize, RawHandle>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn handle_key(handle: &RawHandle) -> usize {
    Arc::as_ptr(&handle.0) as *const () as usize
}

impl HandleCache {
    /// `null_addr`/`null_id` are used only to materialize the
    /// placeholder handles that seed the free list; they are
    /// overwritten by the first `acquire`.
    pub fn new(transport: Arc<dyn Transport>, capacity: usize, null_addr: Address) -> Self {
        let mut free_list = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            if let Ok(h) = transport.create_handle(transport.address_dup(&null_addr), 0) {
                free_list.push_back(h);
            }
        }
        Self {
            transport,
            free_list: Mutex::new(free_list),
            in_use: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Pop a handle from the free list, reset it to `(dest, id)`, and
    /// record it in the in-use table. On reset failure (or an empty
    /// free list) falls back to a freshly created handle, which the
    /// caller must destroy directly rather than `release` — signalled
    /// by the returned `from_cache = false`.
    pub fn acquire(&self, dest: Address, id: u64) -> Result<(RawHandle, bool), TransportError> {
        let popped = self.free_list.lock().pop_front();
        if let Some(handle) = popped {
            match self.transport.reset_handle(&handle, dest.clone(), id) {
                Ok(()) => {
                    self.in_use.lock().insert(handle_key(&handle), handle.clone());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((handle, true));
                }
                Err(_) => {
                    self.free_list.lock().push_back(handle);
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let handle = self.transport.create_handle(dest, id)?;
        Ok((handle, false))
    }

    /// Return `handle` to the free list if it came from the cache;
    /// user-created handles (not found in the in-use table) are left
    /// untouched for the caller to destroy.
    pub fn release(&self, handle: RawHandle) {
        let key = handle_key(&handle);
        if self.in_use.lock().remove(&key).is_some() {
            self.free_list.lock().push_back(handle);
        } else {
            self.transport.destroy_handle(handle);
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use margo_transport::loopback::LoopbackTransport;

    fn fresh_pair(node: &str, peer: &str) -> (Arc<dyn Transport>, Address) {
        let transport: Arc<dyn Transport> = LoopbackTransport::new(node);
        // A second node so the cache's seed handles have somewhere real
        // to point at.
        let _peer = LoopbackTransport::new(peer);
        let addr = transport.lookup(peer).unwrap();
        (transport, addr)
    }

    #[test]
    fn acquire_reuses_seeded_handles_before_creating_new_ones() {
        let (transport, addr) = fresh_pair("hc-node-a", "hc-node-b");
        let cache = HandleCache::new(transport.clone(), 2, transport.self_address());

        let (h1, from_cache1) = cache.acquire(addr.clone(), 0xaaaa).unwrap();
        let (h2, from_cache2) = cache.acquire(addr.clone(), 0xbbbb).unwrap();
        assert!(from_cache1 && from_cache2);
        assert_eq!(cache.hit_count(), 2);
        assert_eq!(cache.miss_count(), 0);
        assert_eq!(cache.in_use_count(), 2);

        // The free list is now empty (capacity 2, both acquired): a third
        // acquire is a genuine cache miss.
        let (_h3, from_cache3) = cache.acquire(addr, 0xcccc).unwrap();
        assert!(!from_cache3);
        assert_eq!(cache.miss_count(), 1);

        cache.release(h1);
        cache.release(h2);
    }

    #[test]
    fn release_returns_cache_acquired_handles_to_the_free_list() {
        let (transport, addr) = fresh_pair("hc-node-c", "hc-node-d");
        let cache = HandleCache::new(transport.clone(), 1, transport.self_address());

        let (handle, from_cache) = cache.acquire(addr.clone(), 1).unwrap();
        assert!(from_cache);
        assert_eq!(cache.in_use_count(), 1);

        cache.release(handle);
        assert_eq!(cache.in_use_count(), 0);

        // Released handle is back on the free list: the next acquire is a hit again.
        let (_h, from_cache_again) = cache.acquire(addr, 2).unwrap();
        assert!(from_cache_again);
        assert_eq!(cache.hit_count(), 2);
        assert_eq!(cache.miss_count(), 0);
    }

    #[test]
    fn release_of_a_user_created_handle_is_left_untouched() {
        let (transport, addr) = fresh_pair("hc-node-e", "hc-node-f");
        let cache = HandleCache::new(transport.clone(), 0, transport.self_address());

        // Created directly, never through the cache — mirrors the
        // `acquire` cache-miss fallback path.
        let handle = transport.create_handle(addr, 99).unwrap();
        assert_eq!(cache.in_use_count(), 0);

        // release() must not insert it into the free list, since it was
        // never in the in-use table.
        cache.release(handle);
        assert_eq!(cache.in_use_count(), 0);
        assert_eq!(cache.hit_count(), 0);
    }
}
