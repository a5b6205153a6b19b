//! A generic list-watch driver: events from a cluster watch stream are keyed,
//! deduplicated through a rate-limited work queue, and dispatched to a
//! resource handler. Every syncer in the bridge runs on one of these.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod queue;

pub use self::metrics::Metrics;
pub use self::queue::{WorkQueue, MAX_RETRIES};

use ahash::{AHashMap, AHashSet};
use anyhow::{bail, Result};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// What a watched resource's handler provides to the runtime.
///
/// `upsert` is invoked with the freshest cached object for a key; `delete`
/// with the last object observed before the key vanished. Both may fail;
/// failures are requeued with back-off up to [`MAX_RETRIES`] times.
#[async_trait::async_trait]
pub trait Handle<T>: Send + Sync + 'static {
    async fn upsert(&self, key: &str, obj: &T) -> Result<()>;

    async fn delete(&self, key: &str, last: &T) -> Result<()>;

    /// Gate checked after the initial list completes, before workers start.
    async fn ready(&self) -> bool {
        true
    }

    /// Optional background task, cancelled when the runtime stops.
    async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A shared read handle over a runtime's object cache.
#[derive(Debug)]
pub struct Store<T>(Arc<RwLock<AHashMap<String, Arc<T>>>>);

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Store<T> {
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.0.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, Arc<T>)> {
        self.0
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// Drives one resource kind: consumes the watch stream into a cache, keys
/// every event as `<namespace>/<name>`, and fans keys out to workers.
#[derive(Debug)]
pub struct Watcher<T> {
    kind: &'static str,
    workers: usize,
    cache: Arc<RwLock<AHashMap<String, Arc<T>>>>,
    tombstones: RwLock<AHashMap<String, Arc<T>>>,
    relist: Mutex<Option<AHashSet<String>>>,
    queue: Arc<WorkQueue<String>>,
    metrics: Metrics,
}

// === impl Watcher ===

impl<T> Watcher<T>
where
    T: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, workers: usize, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            kind,
            workers: workers.max(1),
            cache: Arc::new(RwLock::new(AHashMap::new())),
            tombstones: RwLock::new(AHashMap::new()),
            relist: Mutex::new(None),
            queue: WorkQueue::new(),
            metrics,
        })
    }

    pub fn store(&self) -> Store<T> {
        Store(self.cache.clone())
    }

    /// Lets an engine nudge a key through the queue without a watch event,
    /// e.g. when a related resource changed.
    pub fn nudge(&self, key: String) {
        self.queue.add(key);
    }

    /// Runs the watch until `shutdown` fires or the stream terminates.
    /// Fails fast if the initial list cannot complete.
    pub async fn run<H: Handle<T>>(
        self: Arc<Self>,
        api: Api<T>,
        handler: Arc<H>,
        shutdown: drain::Watch,
    ) -> Result<()> {
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let background = tokio::spawn({
            let handler = handler.clone();
            async move { handler.run(stop_rx).await }
        });

        let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
        loop {
            match stream.next().await {
                Some(Ok(Event::InitDone)) => {
                    self.observe(Event::InitDone);
                    break;
                }
                Some(Ok(ev)) => self.observe(ev),
                Some(Err(error)) => bail!("initial {} list failed: {error}", self.kind),
                None => bail!("{} watch ended during initial list", self.kind),
            }
        }
        while !handler.ready().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!(kind = %self.kind, objects = self.cache.read().len(), "cache synced");

        let workers = (0..self.workers)
            .map(|_| tokio::spawn(self.clone().work(handler.clone())))
            .collect::<Vec<_>>();

        let release = shutdown.signaled();
        tokio::pin!(release);
        let released = loop {
            tokio::select! {
                release = &mut release => break Some(release),
                ev = stream.next() => match ev {
                    Some(Ok(ev)) => self.observe(ev),
                    Some(Err(error)) => {
                        warn!(kind = %self.kind, %error, "watch stream error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    None => break None,
                },
            }
        };

        self.queue.shut_down();
        let _ = stop_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }
        let _ = background.await;
        drop(released);
        Ok(())
    }

    async fn work<H: Handle<T>>(self: Arc<Self>, handler: Arc<H>) {
        while let Some(key) = self.queue.get().await {
            let outcome = tokio::spawn({
                let runtime = self.clone();
                let handler = handler.clone();
                let key = key.clone();
                async move { runtime.process(&*handler, &key).await }
            })
            .await;
            self.queue.done(&key);
            match outcome {
                Ok(Ok(())) => self.queue.forget(&key),
                Ok(Err(error)) => {
                    self.metrics.incr_requeue(self.kind);
                    debug!(kind = %self.kind, %key, %error, "handler failed; requeueing");
                    if !self.queue.retry(key.clone()) {
                        self.metrics.incr_drop(self.kind);
                        warn!(
                            kind = %self.kind, %key, %error,
                            "dropping after {MAX_RETRIES} failed attempts",
                        );
                    }
                }
                Err(panicked) => {
                    error!(kind = %self.kind, %key, "handler panicked: {panicked}");
                    if !self.queue.retry(key.clone()) {
                        self.metrics.incr_drop(self.kind);
                    }
                }
            }
        }
    }

    /// Re-reads the key from the cache so that stale event payloads never
    /// reach the handler.
    async fn process<H: Handle<T>>(&self, handler: &H, key: &str) -> Result<()> {
        let obj = self.cache.read().get(key).cloned();
        if let Some(obj) = obj {
            return handler.upsert(key, &obj).await;
        }
        let last = self.tombstones.read().get(key).cloned();
        if let Some(last) = last {
            handler.delete(key, &last).await?;
            self.tombstones.write().remove(key);
        }
        Ok(())
    }

    fn observe(&self, ev: Event<T>) {
        match ev {
            Event::Init => {
                let seen = self.cache.read().keys().cloned().collect();
                *self.relist.lock() = Some(seen);
            }
            Event::InitApply(obj) | Event::Apply(obj) => {
                let key = object_key(&obj);
                if let Some(relist) = self.relist.lock().as_mut() {
                    relist.remove(&key);
                }
                self.tombstones.write().remove(&key);
                self.cache.write().insert(key.clone(), Arc::new(obj));
                self.metrics.incr_event(self.kind, "apply");
                self.queue.add(key);
            }
            Event::Delete(obj) => {
                let key = object_key(&obj);
                self.cache.write().remove(&key);
                self.tombstones.write().insert(key.clone(), Arc::new(obj));
                self.metrics.incr_event(self.kind, "delete");
                self.queue.add(key);
            }
            Event::InitDone => {
                // Objects deleted while the watch was disconnected produce
                // no delete event; reconcile them off the relist snapshot.
                let stale = self.relist.lock().take().unwrap_or_default();
                for key in stale {
                    if let Some(obj) = self.cache.write().remove(&key) {
                        self.tombstones.write().insert(key.clone(), obj);
                        self.metrics.incr_event(self.kind, "delete");
                        self.queue.add(key);
                    }
                }
            }
        }
    }
}

fn object_key<T: kube::Resource>(obj: &T) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

/// Retries a cluster-API write on 409 conflicts with short back-off; any
/// other outcome is returned as-is.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> kube::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = kube::Result<T>>,
{
    let mut delay = Duration::from_millis(10);
    for _ in 0..4 {
        match op().await {
            Err(kube::Error::Api(e)) if e.code == 409 => {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(500));
            }
            other => return other,
        }
    }
    op().await
}
