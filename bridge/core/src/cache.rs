//! The action cache: collapses idempotent register/deregister calls and
//! memoizes catalog reads for one sync period.
//!
//! Registry providers charge latency for idempotent writes. The cache skips
//! a write when the content hash is unchanged, but only after the change
//! has been attempted at least twice, so a transient registry error on the
//! first attempt cannot wedge an instance in the wrong state.

use crate::discovery::DiscoveryError;
use crate::hash::structural;
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    registered_hash: u64,
    registered_at: Option<Instant>,
    reg_retries: u32,
    deregistered_at: Option<Instant>,
    dereg_retries: u32,
    last_accessed_at: Instant,
}

impl Entry {
    fn new() -> Self {
        Self {
            registered_hash: 0,
            registered_at: None,
            reg_retries: 0,
            deregistered_at: None,
            dereg_retries: 0,
            last_accessed_at: Instant::now(),
        }
    }

    fn register_newer(&self) -> bool {
        match (self.registered_at, self.deregistered_at) {
            (Some(reg), Some(dereg)) => reg > dereg,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Thread-safe per-connector dedupe state. One coarse lock guards the map;
/// each entry carries its own lock for state transitions so unrelated keys
/// never contend.
#[derive(Clone, Debug)]
pub struct ActionCache {
    sync_period: Duration,
    entries: Arc<Mutex<HashMap<String, Arc<Mutex<Entry>>>>>,
}

impl ActionCache {
    pub fn new(sync_period: Duration) -> Self {
        Self {
            sync_period,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<Entry>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Entry::new())))
            .clone();
        entry.lock().last_accessed_at = Instant::now();
        entry
    }

    /// Registers through the cache. The write is skipped only when the
    /// content hash is unchanged, the registration is newer than any
    /// deregistration, and the same state has already been applied twice.
    pub async fn register<T, F, Fut>(
        &self,
        key: &str,
        instance: &T,
        do_register: F,
    ) -> Result<(), DiscoveryError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DiscoveryError>>,
    {
        let entry = self.entry(key);
        {
            let mut e = entry.lock();
            match structural(instance) {
                Ok(hash) => {
                    if hash != e.registered_hash {
                        e.reg_retries = 0;
                        e.registered_hash = hash;
                    } else if !e.register_newer() {
                        // Re-registering after a teardown restarts the
                        // attempt budget.
                        e.reg_retries = 0;
                    } else if e.reg_retries > 1 {
                        tracing::trace!(%key, "register suppressed by cache");
                        return Ok(());
                    }
                }
                Err(error) => {
                    tracing::warn!(%key, %error, "failed to hash registration");
                    e.reg_retries = 0;
                }
            }
        }

        do_register().await?;

        let mut e = entry.lock();
        e.reg_retries += 1;
        e.registered_at = Some(Instant::now());
        Ok(())
    }

    /// Deregisters through the cache, skipping once the teardown has been
    /// applied twice with no intervening registration.
    pub async fn deregister<F, Fut>(&self, key: &str, do_deregister: F) -> Result<(), DiscoveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DiscoveryError>>,
    {
        let entry = self.entry(key);
        {
            let mut e = entry.lock();
            if e.register_newer() {
                e.dereg_retries = 0;
            } else if e.dereg_retries > 1 {
                tracing::trace!(%key, "deregister suppressed by cache");
                return Ok(());
            }
        }

        do_deregister().await?;

        let mut e = entry.lock();
        e.dereg_retries += 1;
        e.deregistered_at = Some(Instant::now());
        Ok(())
    }

    /// Evicts entries untouched for three sync periods. Runs until the
    /// caller drops the future.
    pub async fn run_cleaner(&self) {
        let ttl = self.sync_period * 3;
        let mut interval = tokio::time::interval(self.sync_period);
        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut entries = self.entries.lock();
            entries.retain(|_, entry| now.duration_since(entry.lock().last_accessed_at) < ttl);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Memoizes one catalog read per key per sync period, recomputing under a
/// per-key async lock so concurrent readers do not stampede the registry.
#[derive(Clone, Debug)]
pub struct CatalogCache<T> {
    sync_period: Duration,
    entries: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<CatalogEntry<T>>>>>>>,
}

#[derive(Clone, Debug)]
struct CatalogEntry<T> {
    result: Arc<T>,
    refreshed_at: Instant,
}

impl<T: Send + 'static> CatalogCache<T> {
    pub fn new(sync_period: Duration) -> Self {
        Self {
            sync_period,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<Arc<T>, DiscoveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DiscoveryError>>,
    {
        let slot = {
            let mut entries = self.entries.lock();
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;
        if let Some(entry) = guard.as_ref() {
            if entry.refreshed_at.elapsed() < self.sync_period {
                return Ok(entry.result.clone());
            }
        }
        let result = Arc::new(compute().await?);
        *guard = Some(CatalogEntry {
            result: result.clone(),
            refreshed_at: Instant::now(),
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn count_register(
        cache: &ActionCache,
        key: &str,
        payload: &str,
        calls: &Arc<AtomicUsize>,
    ) -> impl Future<Output = Result<(), DiscoveryError>> {
        let cache = cache.clone();
        let key = key.to_string();
        let payload = payload.to_string();
        let calls = calls.clone();
        async move {
            cache
                .register(&key, &payload, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }
    }

    #[tokio::test]
    async fn third_identical_register_is_suppressed() {
        let cache = ActionCache::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            count_register(&cache, "svc", "payload", &calls).await.unwrap();
        }
        // Two real attempts per state change, then served from cache.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn changed_payload_resets_attempts() {
        let cache = ActionCache::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            count_register(&cache, "svc", "a", &calls).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        for _ in 0..3 {
            count_register(&cache, "svc", "b", &calls).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_register_does_not_consume_budget() {
        let cache = ActionCache::new(Duration::from_secs(5));
        let failed: Result<(), _> = cache
            .register("svc", &"a", || async {
                Err(DiscoveryError::Transient(anyhow::anyhow!("boom")))
            })
            .await;
        assert!(failed.is_err());

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            count_register(&cache, "svc", "a", &calls).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deregister_budget_restarts_after_register() {
        let cache = ActionCache::new(Duration::from_secs(5));
        let deregs = Arc::new(AtomicUsize::new(0));
        let dereg = |cache: &ActionCache| {
            let cache = cache.clone();
            let deregs = deregs.clone();
            async move {
                cache
                    .deregister("svc", || async {
                        deregs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }
        };

        for _ in 0..3 {
            dereg(&cache).await.unwrap();
        }
        assert_eq!(deregs.load(Ordering::SeqCst), 2);

        cache.register("svc", &"a", || async { Ok(()) }).await.unwrap();
        for _ in 0..3 {
            dereg(&cache).await.unwrap();
        }
        assert_eq!(deregs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cleaner_evicts_idle_entries() {
        let cache = ActionCache::new(Duration::from_millis(10));
        cache.register("svc", &"a", || async { Ok(()) }).await.unwrap();
        assert_eq!(cache.len(), 1);

        let cleaner = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.run_cleaner().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cleaner.abort();
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn catalog_cache_serves_fresh_reads() {
        let cache = CatalogCache::<Vec<String>>::new(Duration::from_secs(5));
        let computes = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let computes = computes.clone();
            let out = cache
                .get_or_compute("all", || async move {
                    computes.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["payments".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(out.as_slice(), ["payments".to_string()]);
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }
}
