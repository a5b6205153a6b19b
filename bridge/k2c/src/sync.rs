//! The registry-side reconciler: keeps per-service watchers alive, reaps
//! orphaned registrations, and applies the pending deregister/register sets
//! through the action cache.
//!
//! Deregistrations always run before registrations within a pass, so an
//! address that moved between services is never briefly duplicated.

use crate::{Config, Context};
use ahash::AHashMap;
use futures::future::join_all;
use registry_bridge_core::{
    ActionCache, CatalogDeregistration, DiscoveryClient, QueryOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Syncer {
    disc: Arc<dyn DiscoveryClient>,
    config: Arc<Config>,
    ctx: Arc<Context>,
    cache: ActionCache,
    trigger: Notify,
    /// Per-service pollers, keyed by cloud service name.
    watchers: parking_lot::Mutex<AHashMap<String, JoinHandle<()>>>,
    /// The reaper must not run before the first full pass has populated the
    /// registration maps, or it would tear down everything it sees.
    primed: AtomicBool,
}

// === impl Syncer ===

impl Syncer {
    pub fn new(
        disc: Arc<dyn DiscoveryClient>,
        config: Arc<Config>,
        ctx: Arc<Context>,
    ) -> Arc<Self> {
        let cache = ActionCache::new(config.sync_period);
        Arc::new(Self {
            disc,
            config,
            ctx,
            cache,
            trigger: Notify::new(),
            watchers: parking_lot::Mutex::new(AHashMap::new()),
            primed: AtomicBool::new(false),
        })
    }

    /// Asks for a reconcile ahead of the next timer tick.
    pub fn schedule(&self) {
        self.trigger.notify_one();
    }

    /// Reconciles until shutdown, at `sync_period` or on demand.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let cleaner = {
            let cache = self.cache.clone();
            tokio::spawn(async move { cache.run_cleaner().await })
        };
        let mut interval = tokio::time::interval(self.config.sync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => self.sync().await,
                _ = self.trigger.notified() => self.sync().await,
            }
        }
        cleaner.abort();
        let mut watchers = self.watchers.lock();
        for (_, handle) in watchers.drain() {
            handle.abort();
        }
    }

    pub(crate) async fn sync(self: &Arc<Self>) {
        if self.config.purge {
            self.ctx.purge();
        }
        self.reconcile_watchers();
        self.reap().await;
        self.deregister_pass().await;
        self.ensure_namespaces().await;
        self.register_pass().await;
        self.primed.store(true, Ordering::Release);
    }

    /// One poller per currently-advertised service; pollers for services no
    /// longer advertised are cancelled.
    fn reconcile_watchers(self: &Arc<Self>) {
        let names = self.ctx.service_names();
        let mut watchers = self.watchers.lock();
        watchers.retain(|name, handle| {
            if names.contains(name) {
                true
            } else {
                handle.abort();
                false
            }
        });
        for name in names {
            if !watchers.contains_key(&name) {
                let handle = tokio::spawn(self.clone().watch_service(name.clone()));
                watchers.insert(name, handle);
            }
        }
    }

    /// Polls the registry for one service and queues deregistrations for
    /// instances this connector no longer derives.
    async fn watch_service(self: Arc<Self>, name: String) {
        let mut interval = tokio::time::interval(self.config.sync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let instances = match self
                .disc
                .registered_instances(&name, &QueryOptions::default())
                .await
            {
                Ok(instances) => instances,
                Err(error) => {
                    debug!(service = %name, %error, "failed to list registered instances");
                    continue;
                }
            };
            let known = self.ctx.registrations();
            let mut deregs = self.ctx.deregs.write();
            for instance in instances {
                let ns = instance.namespace.clone().unwrap_or_default();
                let wanted = known
                    .get(&ns)
                    .is_some_and(|ids| ids.contains_key(&instance.service_id));
                if !wanted {
                    deregs.insert(
                        instance.service_id.clone(),
                        CatalogDeregistration {
                            node: instance.node,
                            service_id: instance.service_id,
                            service_name: instance.service_name,
                            namespace: instance.namespace,
                        },
                    );
                }
            }
        }
    }

    /// Queues deregistrations for whole services the cluster no longer
    /// produces.
    async fn reap(&self) {
        if !self.primed.load(Ordering::Acquire) {
            return;
        }
        let services = match self.disc.registered_services(&QueryOptions::default()).await {
            Ok(services) => services,
            Err(error) => {
                warn!(%error, "failed to list registered services");
                return;
            }
        };
        let names = self.ctx.service_names();
        for service in services {
            if names.contains(&service.service) {
                continue;
            }
            let instances = match self
                .disc
                .registered_instances(&service.service, &QueryOptions::default())
                .await
            {
                Ok(instances) => instances,
                Err(error) => {
                    debug!(service = %service.service, %error, "failed to list orphaned instances");
                    continue;
                }
            };
            let mut deregs = self.ctx.deregs.write();
            for instance in instances {
                deregs.insert(
                    instance.service_id.clone(),
                    CatalogDeregistration {
                        node: instance.node,
                        service_id: instance.service_id,
                        service_name: instance.service_name,
                        namespace: instance.namespace,
                    },
                );
            }
        }
    }

    /// Drains the pending set; failures are not retried here because the
    /// watchers re-observe the registry next period.
    async fn deregister_pass(&self) {
        let pending = self
            .ctx
            .deregs
            .write()
            .drain()
            .map(|(_, d)| d)
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return;
        }
        let passes = pending.into_iter().map(|dereg| {
            let cache = self.cache.clone();
            let disc = self.disc.clone();
            async move {
                for attempt in 0..2u8 {
                    match cache
                        .deregister(&dereg.service_id, || disc.deregister(&dereg))
                        .await
                    {
                        Ok(()) => {
                            info!(id = %dereg.service_id, "deregistered instance");
                            return;
                        }
                        Err(error) if error.is_transient() && attempt == 0 => {
                            debug!(id = %dereg.service_id, %error, "retrying deregister");
                        }
                        Err(error) => {
                            warn!(id = %dereg.service_id, %error, "failed to deregister");
                            return;
                        }
                    }
                }
            }
        });
        join_all(passes).await;
    }

    async fn ensure_namespaces(&self) {
        if !self.disc.enable_namespaces() {
            return;
        }
        for ns in self.ctx.registrations().into_keys() {
            if ns.is_empty() {
                continue;
            }
            match self.disc.ensure_namespace_exists(&ns).await {
                Ok(created) => {
                    if created {
                        info!(namespace = %ns, "created registry namespace");
                    }
                }
                Err(error) => warn!(namespace = %ns, %error, "failed to ensure namespace"),
            }
        }
    }

    async fn register_pass(&self) {
        let registrations = self
            .ctx
            .registrations()
            .into_values()
            .flat_map(AHashMap::into_values)
            .collect::<Vec<_>>();
        let passes = registrations.into_iter().map(|reg| {
            let cache = self.cache.clone();
            let disc = self.disc.clone();
            async move {
                for attempt in 0..2u8 {
                    match cache
                        .register(&reg.service.id, &reg, || disc.register(&reg))
                        .await
                    {
                        Ok(()) => return,
                        Err(error) if error.is_transient() && attempt == 0 => {
                            debug!(id = %reg.service.id, %error, "retrying register");
                        }
                        Err(error) => {
                            warn!(id = %reg.service.id, %error, "failed to register");
                            return;
                        }
                    }
                }
            }
        });
        join_all(passes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OwnedRegistration;
    use parking_lot::Mutex;
    use registry_bridge_core::{
        AgentService, CatalogRegistration, CatalogService, CloudInstance, DiscoveryError,
        NamespacedService, ProviderId, RateLimiter,
    };
    use registry_bridge_k8s_api::ConnectorSpec;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        registered: Mutex<Vec<CatalogService>>,
        services: Mutex<Vec<NamespacedService>>,
    }

    #[async_trait::async_trait]
    impl DiscoveryClient for Recorder {
        async fn catalog_services(
            &self,
            _: &QueryOptions,
        ) -> Result<Vec<NamespacedService>, DiscoveryError> {
            Ok(vec![])
        }

        async fn catalog_instances(
            &self,
            _: &str,
            _: &QueryOptions,
        ) -> Result<Vec<CloudInstance>, DiscoveryError> {
            Ok(vec![])
        }

        async fn registered_services(
            &self,
            _: &QueryOptions,
        ) -> Result<Vec<NamespacedService>, DiscoveryError> {
            Ok(self.services.lock().clone())
        }

        async fn registered_instances(
            &self,
            service: &str,
            _: &QueryOptions,
        ) -> Result<Vec<CatalogService>, DiscoveryError> {
            Ok(self
                .registered
                .lock()
                .iter()
                .filter(|r| r.service_name == service)
                .cloned()
                .collect())
        }

        async fn register(&self, reg: &CatalogRegistration) -> Result<(), DiscoveryError> {
            self.events.lock().push(format!("register:{}", reg.service.id));
            Ok(())
        }

        async fn deregister(&self, dereg: &CatalogDeregistration) -> Result<(), DiscoveryError> {
            self.events
                .lock()
                .push(format!("deregister:{}", dereg.service_id));
            Ok(())
        }

        fn provider(&self) -> ProviderId {
            ProviderId::Consul
        }
    }

    fn config() -> Arc<Config> {
        let spec: ConnectorSpec = serde_json::from_value(serde_json::json!({
            "httpAddr": "consul:8500",
            "deriveNamespace": "derive",
            "syncToK8S": {"enable": false},
            "syncFromK8S": {"enable": true},
        }))
        .unwrap();
        Arc::new(Config::new(&spec, "uid-1", RateLimiter::new(500, 750)))
    }

    fn registration(id: &str, service: &str) -> OwnedRegistration {
        OwnedRegistration {
            registry_ns: String::new(),
            registration: CatalogRegistration {
                node: "k8s-sync".to_string(),
                address: "10.2.0.7".to_string(),
                service: AgentService {
                    id: id.to_string(),
                    service: service.to_string(),
                    ..Default::default()
                },
                check: None,
            },
        }
    }

    #[tokio::test]
    async fn deregisters_before_registering() {
        let disc = Arc::new(Recorder::default());
        let ctx = Arc::new(Context::default());
        ctx.by_key
            .write()
            .insert("shop/checkout".to_string(), vec![registration("a-1", "checkout")]);
        ctx.deregs.write().insert(
            "b-1".to_string(),
            CatalogDeregistration {
                node: "k8s-sync".to_string(),
                service_id: "b-1".to_string(),
                service_name: "basket".to_string(),
                namespace: None,
            },
        );

        let syncer = Syncer::new(disc.clone(), config(), ctx);
        syncer.sync().await;

        let events = disc.events.lock().clone();
        assert_eq!(events, vec!["deregister:b-1", "register:a-1"]);
    }

    #[tokio::test]
    async fn dereg_map_is_cleared_after_the_pass() {
        let disc = Arc::new(Recorder::default());
        let ctx = Arc::new(Context::default());
        ctx.deregs.write().insert(
            "b-1".to_string(),
            CatalogDeregistration {
                service_id: "b-1".to_string(),
                ..Default::default()
            },
        );
        let syncer = Syncer::new(disc, config(), ctx.clone());
        syncer.sync().await;
        assert!(ctx.deregs.read().is_empty());
    }

    #[tokio::test]
    async fn reaper_waits_for_the_first_pass() {
        let disc = Arc::new(Recorder::default());
        *disc.services.lock() = vec![NamespacedService {
            namespace: String::new(),
            service: "orphan".to_string(),
        }];
        *disc.registered.lock() = vec![CatalogService {
            node: "k8s-sync".to_string(),
            service_id: "orphan-1".to_string(),
            service_name: "orphan".to_string(),
            namespace: None,
        }];

        let ctx = Arc::new(Context::default());
        let syncer = Syncer::new(disc.clone(), config(), ctx.clone());

        // First pass: the reaper is still gated; nothing is deregistered.
        syncer.sync().await;
        assert!(disc.events.lock().is_empty());

        // Second pass: the orphan is noticed and queued, then drained.
        syncer.sync().await;
        assert_eq!(disc.events.lock().clone(), vec!["deregister:orphan-1"]);
    }

    #[tokio::test]
    async fn stale_watcher_entries_are_cancelled() {
        let disc = Arc::new(Recorder::default());
        let ctx = Arc::new(Context::default());
        ctx.by_key
            .write()
            .insert("shop/checkout".to_string(), vec![registration("a-1", "checkout")]);
        let syncer = Syncer::new(disc, config(), ctx.clone());
        syncer.sync().await;
        assert!(syncer.watchers.lock().contains_key("checkout"));

        ctx.by_key.write().clear();
        syncer.sync().await;
        assert!(syncer.watchers.lock().is_empty());
    }
}
