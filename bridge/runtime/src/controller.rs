//! Owns a single connector's life: fetches the resource, gates on a
//! structural hash of its spec, validates it, and (re)spawns the sync
//! engines under a fresh cancellation scope.

use crate::machine::MachineDiscovery;
use anyhow::Result;
use kubert::lease::Claim;
use registry_bridge_core::{DiscoveryClient, ProviderId, RateLimiter, UnknownProvider};
use registry_bridge_k8s_api::{
    Api, Connector, ConnectorSpec, ConsulConnector, Endpoints, EurekaConnector, Gateway,
    GatewayConnector, Ingress, Limiter, MachineConnector, NacosConnector, Node, Service,
    VirtualMachine, ZookeeperConnector,
};
use registry_bridge_k8s_watch::{Handle, Metrics, Store, Watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Produces the discovery adapter for a connector. Wire-level registry
/// clients are supplied by the embedder; the machine inventory ships
/// in-tree because it reads the cluster itself.
pub trait AdapterFactory: Send + Sync + 'static {
    fn create(&self, connector: &Connector, seams: AdapterSeams) -> Result<Arc<dyn DiscoveryClient>>;
}

/// Everything a factory may need beyond the connector spec itself.
pub struct AdapterSeams {
    /// The VM inventory; populated only for the Machine provider.
    pub vms: Option<Store<VirtualMachine>>,
    /// Per-call timeout for provider HTTP clients.
    pub http_timeout: Duration,
}

/// The in-tree factory: Machine only. Any wire provider is an unknown
/// provider here and fatal at startup.
pub struct BuiltinAdapters;

impl AdapterFactory for BuiltinAdapters {
    fn create(&self, connector: &Connector, seams: AdapterSeams) -> Result<Arc<dyn DiscoveryClient>> {
        match (connector, connector.spec()) {
            (Connector::Machine(_), Some(spec)) => {
                let vms = seams
                    .vms
                    .ok_or_else(|| anyhow::anyhow!("machine adapter requires a VM inventory"))?;
                Ok(Arc::new(MachineDiscovery::new(
                    vms,
                    spec.sync_to_k8s.cluster_id.clone(),
                    spec.as_internal_services,
                )))
            }
            _ => Err(anyhow::Error::new(UnknownProvider(
                connector.provider().to_string(),
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The spec cannot be applied; reported on status, retried only when
    /// the spec changes.
    #[error("invalid connector spec: {0}")]
    Invalid(String),
    /// The process cannot make progress; the supervisor restarts the pod.
    #[error(transparent)]
    Fatal(anyhow::Error),
    /// Retried on the next update or reconfirm round.
    #[error(transparent)]
    Transient(anyhow::Error),
}

/// Engine contexts of the current generation, for status reporting.
#[derive(Clone, Default)]
pub struct Contexts {
    pub c2k: Option<Arc<registry_bridge_c2k::Context>>,
    pub k2c: Option<Arc<registry_bridge_k2c::Context>>,
    pub k2g: Option<Arc<registry_bridge_k2g::Context>>,
}

struct Children {
    stop: tokio::sync::watch::Sender<bool>,
    drain: drain::Signal,
    tasks: Vec<JoinHandle<()>>,
    disc: Option<Arc<dyn DiscoveryClient>>,
}

#[derive(Default)]
struct State {
    last_hash: Option<u64>,
    children: Option<Children>,
    contexts: Contexts,
    last_error: Option<String>,
}

pub struct Controller {
    client: kube::Client,
    provider: ProviderId,
    name: String,
    workers: usize,
    fallback_limiter: Limiter,
    http_timeout: Duration,
    adapters: Arc<dyn AdapterFactory>,
    metrics: Metrics,
    hostname: String,
    claims: Option<tokio::sync::watch::Receiver<Arc<Claim>>>,
    state: tokio::sync::Mutex<State>,
}

// === impl Controller ===

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: kube::Client,
        provider: ProviderId,
        name: String,
        workers: usize,
        fallback_limiter: Limiter,
        http_timeout: Duration,
        adapters: Arc<dyn AdapterFactory>,
        metrics: Metrics,
        hostname: String,
        claims: Option<tokio::sync::watch::Receiver<Arc<Claim>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            provider,
            name,
            workers,
            fallback_limiter,
            http_timeout,
            adapters,
            metrics,
            hostname,
            claims,
            state: tokio::sync::Mutex::new(State::default()),
        })
    }

    /// Runs one reconcile, downgrading everything but fatal errors to logs.
    /// Used as the broadcast listener's callback.
    pub async fn sync(&self) -> Result<()> {
        match self.reconcile().await {
            Ok(()) => Ok(()),
            Err(ReconcileError::Invalid(reason)) => {
                warn!(provider = %self.provider, connector = %self.name, %reason, "connector spec rejected");
                Ok(())
            }
            Err(ReconcileError::Transient(error)) => {
                warn!(provider = %self.provider, connector = %self.name, %error, "reconcile failed; awaiting the next update");
                Ok(())
            }
            Err(ReconcileError::Fatal(error)) => Err(error),
        }
    }

    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        let connector = self.fetch().await.map_err(ReconcileError::Transient)?;
        let hash = spec_hash(&connector)
            .map_err(|e| ReconcileError::Transient(anyhow::Error::new(e)))?;

        let mut state = self.state.lock().await;

        if connector.leader_election() && !self.is_leader() {
            debug!(provider = %self.provider, connector = %self.name, "not leader; engines idle");
            teardown(&mut state).await;
            // Re-apply from scratch once the lease is claimed.
            state.last_hash = None;
            return Ok(());
        }

        if state.last_hash == Some(hash) {
            debug!(provider = %self.provider, connector = %self.name, "spec unchanged");
            return Ok(());
        }

        if let Err(reason) = validate(&connector) {
            state.last_error = Some(reason.clone());
            state.last_hash = Some(hash);
            teardown(&mut state).await;
            return Err(ReconcileError::Invalid(reason));
        }
        state.last_error = None;

        teardown(&mut state).await;
        self.spawn_children(&mut state, &connector)?;
        state.last_hash = Some(hash);
        info!(provider = %self.provider, connector = %self.name, "connector applied");
        Ok(())
    }

    async fn fetch(&self) -> Result<Connector> {
        let client = self.client.clone();
        let connector = match self.provider {
            ProviderId::Consul => Connector::Consul(
                Api::<ConsulConnector>::all(client).get(&self.name).await?,
            ),
            ProviderId::Eureka => Connector::Eureka(
                Api::<EurekaConnector>::all(client).get(&self.name).await?,
            ),
            ProviderId::Nacos => {
                Connector::Nacos(Api::<NacosConnector>::all(client).get(&self.name).await?)
            }
            ProviderId::Zookeeper => Connector::Zookeeper(
                Api::<ZookeeperConnector>::all(client).get(&self.name).await?,
            ),
            ProviderId::Machine => Connector::Machine(
                Api::<MachineConnector>::all(client).get(&self.name).await?,
            ),
            ProviderId::Gateway => Connector::Gateway(
                Api::<GatewayConnector>::all(client).get(&self.name).await?,
            ),
        };
        Ok(connector)
    }

    fn spawn_children(
        &self,
        state: &mut State,
        connector: &Connector,
    ) -> Result<(), ReconcileError> {
        let (drain_tx, drain_rx) = drain::channel();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let mut tasks = Vec::new();
        let mut contexts = Contexts::default();
        let mut disc_held = None;
        let uid = connector.uid();

        if let Some(spec) = connector.spec() {
            let limiter = {
                let Limiter { limit, burst } = spec.limiter.unwrap_or(self.fallback_limiter);
                RateLimiter::new(limit, burst)
            };

            let vms = (self.provider == ProviderId::Machine).then(|| {
                let watcher = Watcher::<VirtualMachine>::new("virtualmachines", 1, self.metrics.clone());
                let store = watcher.store();
                spawn_watch(
                    &mut tasks,
                    watcher,
                    Api::all(self.client.clone()),
                    Arc::new(Inventory),
                    drain_rx.clone(),
                );
                store
            });

            let disc = self
                .adapters
                .create(
                    connector,
                    AdapterSeams {
                        vms,
                        http_timeout: self.http_timeout,
                    },
                )
                .map_err(|e| {
                    if e.is::<UnknownProvider>() {
                        ReconcileError::Fatal(e)
                    } else {
                        ReconcileError::Transient(e)
                    }
                })?;

            // Purge still needs a running engine to tear its state down.
            if spec.sync_to_k8s.enable || spec.purge {
                contexts.c2k = Some(self.spawn_c2k(
                    spec,
                    &uid,
                    disc.clone(),
                    limiter.clone(),
                    &mut tasks,
                    &drain_rx,
                    &stop_rx,
                ));
            }
            if spec.sync_from_k8s.enable || spec.purge {
                contexts.k2c = Some(self.spawn_k2c(
                    spec,
                    &uid,
                    disc.clone(),
                    limiter,
                    &mut tasks,
                    &drain_rx,
                    &stop_rx,
                ));
            }
            disc_held = Some(disc);
        } else if let Some(gateway) = connector.gateway_spec() {
            if gateway.sync_to_fgw.enable || gateway.sync_to_fgw.purge {
                let Limiter { limit, burst } = self.fallback_limiter;
                let config = Arc::new(registry_bridge_k2g::Config::new(
                    gateway,
                    &uid,
                    RateLimiter::new(limit, burst),
                ));
                let ctx = Arc::new(registry_bridge_k2g::Context::default());
                contexts.k2g = Some(ctx.clone());

                let services = Watcher::<Service>::new("services", self.workers, self.metrics.clone());
                let gateways = Watcher::<Gateway>::new("gateways", 1, self.metrics.clone());
                let endpoints = Watcher::<Endpoints>::new("endpoints", self.workers, self.metrics.clone());

                let source = registry_bridge_k2g::RouteSource::new(
                    self.client.clone(),
                    config,
                    ctx,
                    gateways.store(),
                    endpoints.store(),
                );
                spawn_watch(
                    &mut tasks,
                    gateways,
                    Api::all(self.client.clone()),
                    registry_bridge_k2g::GatewayNudger::new(services.clone()),
                    drain_rx.clone(),
                );
                spawn_watch(
                    &mut tasks,
                    endpoints,
                    Api::all(self.client.clone()),
                    registry_bridge_k2c::EndpointsNudger::new(services.clone()),
                    drain_rx.clone(),
                );
                spawn_watch(
                    &mut tasks,
                    services,
                    Api::all(self.client.clone()),
                    source,
                    drain_rx.clone(),
                );
            }
        }

        drop(drain_rx);
        state.children = Some(Children {
            stop: stop_tx,
            drain: drain_tx,
            tasks,
            disc: disc_held,
        });
        state.contexts = contexts;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_c2k(
        &self,
        spec: &ConnectorSpec,
        uid: &str,
        disc: Arc<dyn DiscoveryClient>,
        limiter: RateLimiter,
        tasks: &mut Vec<JoinHandle<()>>,
        drain_rx: &drain::Watch,
        stop_rx: &tokio::sync::watch::Receiver<bool>,
    ) -> Arc<registry_bridge_c2k::Context> {
        let config = Arc::new(registry_bridge_c2k::Config::new(spec, uid, limiter));
        let ctx = Arc::new(registry_bridge_c2k::Context::default());
        let syncer = registry_bridge_c2k::Syncer::new(
            self.client.clone(),
            disc.clone(),
            config.clone(),
            ctx.clone(),
        );

        // The derive namespace holds everything this direction owns.
        let services = Watcher::<Service>::new("services", self.workers, self.metrics.clone());
        spawn_watch(
            tasks,
            services,
            Api::namespaced(self.client.clone(), &config.derive_namespace),
            syncer.clone(),
            drain_rx.clone(),
        );

        let endpoints = Watcher::<Endpoints>::new("endpoints", self.workers, self.metrics.clone());
        spawn_watch(
            tasks,
            endpoints,
            Api::namespaced(self.client.clone(), &config.derive_namespace),
            registry_bridge_c2k::EndpointsHandler::new(
                self.client.clone(),
                disc.clone(),
                config.clone(),
                ctx.clone(),
            ),
            drain_rx.clone(),
        );

        // Purged connectors stop feeding the catalog in; the syncer then
        // deletes everything it owns as the watch replays those services.
        if !spec.purge {
            let source = registry_bridge_c2k::Source::new(disc, config, syncer);
            tasks.push(tokio::spawn(source.run(stop_rx.clone())));
        }
        ctx
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_k2c(
        &self,
        spec: &ConnectorSpec,
        uid: &str,
        disc: Arc<dyn DiscoveryClient>,
        limiter: RateLimiter,
        tasks: &mut Vec<JoinHandle<()>>,
        drain_rx: &drain::Watch,
        stop_rx: &tokio::sync::watch::Receiver<bool>,
    ) -> Arc<registry_bridge_k2c::Context> {
        let config = Arc::new(registry_bridge_k2c::Config::new(spec, uid, limiter));
        let ctx = Arc::new(registry_bridge_k2c::Context::default());
        let syncer =
            registry_bridge_k2c::Syncer::new(disc.clone(), config.clone(), ctx.clone());
        tasks.push(tokio::spawn(syncer.clone().run(stop_rx.clone())));

        let services = Watcher::<Service>::new("services", self.workers, self.metrics.clone());
        let endpoints = Watcher::<Endpoints>::new("endpoints", self.workers, self.metrics.clone());
        let nodes = Watcher::<Node>::new("nodes", 1, self.metrics.clone());
        let ingresses = Watcher::<Ingress>::new("ingresses", 1, self.metrics.clone());

        let source = registry_bridge_k2c::ServiceSource::new(
            disc,
            config.clone(),
            ctx.clone(),
            syncer,
            endpoints.store(),
            nodes.store(),
            ingresses.store(),
        );
        spawn_watch(
            tasks,
            endpoints,
            Api::all(self.client.clone()),
            registry_bridge_k2c::EndpointsNudger::new(services.clone()),
            drain_rx.clone(),
        );
        spawn_watch(
            tasks,
            nodes,
            Api::all(self.client.clone()),
            Arc::new(Inventory),
            drain_rx.clone(),
        );
        if config.spec.sync_ingress {
            spawn_watch(
                tasks,
                ingresses,
                Api::all(self.client.clone()),
                registry_bridge_k2c::IngressNudger::new(services.clone()),
                drain_rx.clone(),
            );
        }
        spawn_watch(
            tasks,
            services,
            Api::all(self.client.clone()),
            source,
            drain_rx.clone(),
        );
        ctx
    }

    pub(crate) fn is_leader(&self) -> bool {
        match &self.claims {
            None => true,
            Some(claims) => claims.borrow().is_current_for(&self.hostname),
        }
    }

    pub(crate) fn client(&self) -> kube::Client {
        self.client.clone()
    }

    pub(crate) fn target(&self) -> (ProviderId, &str) {
        (self.provider, &self.name)
    }

    pub(crate) async fn snapshot(&self) -> (Contexts, Option<String>) {
        let state = self.state.lock().await;
        (state.contexts.clone(), state.last_error.clone())
    }
}

/// Stops the current generation: syncers first, then the watchers, then
/// the adapter's connection pools.
async fn teardown(state: &mut State) {
    if let Some(children) = state.children.take() {
        let _ = children.stop.send(true);
        children.drain.drain().await;
        if let Some(disc) = &children.disc {
            disc.close();
        }
        for task in children.tasks {
            let _ = task.await;
        }
    }
    state.contexts = Contexts::default();
}

fn spec_hash(connector: &Connector) -> Result<u64, serde_json::Error> {
    match (connector.spec(), connector.gateway_spec()) {
        (Some(spec), _) => registry_bridge_core::hash::structural(spec),
        (_, Some(gateway)) => registry_bridge_core::hash::structural(gateway),
        (None, None) => Ok(0),
    }
}

/// No sync tasks start for a spec that fails here; the failure lands on
/// the connector's status.
fn validate(connector: &Connector) -> Result<(), String> {
    if let Some(gateway) = connector.gateway_spec() {
        if gateway.gateway_name.is_empty() {
            return Err("gatewayName must not be empty".to_string());
        }
        return Ok(());
    }
    if let Some(spec) = connector.spec() {
        if spec.http_addr.is_empty() && connector.provider() != ProviderId::Machine {
            return Err("httpAddr must not be empty".to_string());
        }
        if (spec.sync_to_k8s.enable || spec.sync_from_k8s.enable)
            && spec.derive_namespace.is_empty()
        {
            return Err(
                "deriveNamespace must not be empty when a sync direction is enabled".to_string(),
            );
        }
    }
    Ok(())
}

/// Fills a store from the watch stream without reacting to events; used
/// for inventories that other handlers read on demand.
struct Inventory;

#[async_trait::async_trait]
impl<T: Send + Sync + 'static> Handle<T> for Inventory {
    async fn upsert(&self, _key: &str, _obj: &T) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str, _last: &T) -> Result<()> {
        Ok(())
    }
}

fn spawn_watch<T, H>(
    tasks: &mut Vec<JoinHandle<()>>,
    watcher: Arc<Watcher<T>>,
    api: Api<T>,
    handler: Arc<H>,
    shutdown: drain::Watch,
) where
    T: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    H: Handle<T>,
{
    tasks.push(tokio::spawn(async move {
        if let Err(error) = watcher.run(api, handler, shutdown).await {
            error!(%error, "watch terminated");
        }
    }));
}
