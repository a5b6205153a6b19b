use crate::{
    broker::{Broker, BroadcastListener, Event, EventOp, Topic},
    controller::{AdapterFactory, BuiltinAdapters, Controller},
    lease, status,
};
use anyhow::{bail, Result};
use clap::Parser;
use registry_bridge_core::ProviderId;
use registry_bridge_k8s_api::{
    Api, ConsulConnector, EurekaConnector, GatewayConnector, Limiter, MachineConnector,
    NacosConnector, ZookeeperConnector,
};
use registry_bridge_k8s_watch::{Handle, Metrics, Watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The quiet window applied to connector-update bursts before the engines
/// are reconfigured.
const LISTENER_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[clap(name = "registry-bridge", about = "A service-registry bridge connector")]
pub struct Args {
    #[clap(
        long = "verbosity",
        default_value = "registry_bridge=info,warn",
        env = "REGISTRY_BRIDGE_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "fsm")]
    mesh_name: String,

    #[clap(long, default_value = "fsm-system")]
    fsm_namespace: String,

    /// The service discovery provider bridged by this pod.
    #[clap(long)]
    sdr_provider: ProviderId,

    /// The name of the connector resource to reconcile.
    #[clap(long)]
    sdr_connector: String,

    #[clap(long, default_value = "cluster.local")]
    trust_domain: String,

    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    leader_election: bool,

    /// Cluster-API call budget applied when the connector spec carries no
    /// limiter of its own.
    #[clap(long, default_value = "500")]
    k8s_client_limit: u32,

    #[clap(long, default_value = "750")]
    k8s_client_burst: u32,

    /// Per-call timeout, in seconds, for provider HTTP clients.
    #[clap(long, default_value = "15")]
    k8s_client_timeout: u64,

    /// Workers per watch runtime.
    #[clap(long, default_value = "2")]
    ctok_workers: usize,

    /// Identifies the owning pod for lease claims and event attribution.
    #[clap(long, env = "CONNECTOR_POD_NAME")]
    connector_pod_name: String,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run(Arc::new(BuiltinAdapters)).await
    }

    /// Runs the bridge with the given adapter factory; embedders supply
    /// wire-level registry clients through it.
    pub async fn run(self, adapters: Arc<dyn AdapterFactory>) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            mesh_name,
            fsm_namespace,
            sdr_provider,
            sdr_connector,
            trust_domain,
            leader_election,
            k8s_client_limit,
            k8s_client_burst,
            k8s_client_timeout,
            ctok_workers,
            connector_pod_name,
        } = self;

        let mut prom = <prometheus_client::registry::Registry>::default();
        let watch_metrics = Metrics::register(prom.sub_registry_with_prefix("workqueue"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        info!(
            provider = %sdr_provider,
            connector = %sdr_connector,
            %mesh_name,
            %trust_domain,
            "starting registry bridge",
        );

        let claims = if leader_election {
            let lease_name = format!("registry-bridge-{sdr_provider}-{sdr_connector}");
            Some(
                lease::init(
                    &runtime,
                    &fsm_namespace,
                    &lease_name,
                    &mesh_name,
                    &connector_pod_name,
                )
                .await?,
            )
        } else {
            None
        };

        let controller = Controller::new(
            runtime.client(),
            sdr_provider,
            sdr_connector.clone(),
            ctok_workers,
            Limiter {
                limit: k8s_client_limit,
                burst: k8s_client_burst,
            },
            Duration::from_secs(k8s_client_timeout),
            adapters,
            watch_metrics.clone(),
            connector_pod_name,
            claims.clone(),
        );

        let broker = Arc::new(Broker::new());
        let listener = BroadcastListener::new(&broker, LISTENER_PERIOD);

        // The connector resource itself drives reconfiguration.
        let publish = Arc::new(Publish {
            broker: broker.clone(),
            provider: sdr_provider,
            name: sdr_connector.clone(),
        });
        let shutdown = runtime.shutdown_handle();
        let watch_client = runtime.client();
        match sdr_provider {
            ProviderId::Consul => spawn_connector_watch::<ConsulConnector>(
                "consulconnectors",
                &watch_client,
                &watch_metrics,
                publish,
                shutdown.clone(),
            ),
            ProviderId::Eureka => spawn_connector_watch::<EurekaConnector>(
                "eurekaconnectors",
                &watch_client,
                &watch_metrics,
                publish,
                shutdown.clone(),
            ),
            ProviderId::Nacos => spawn_connector_watch::<NacosConnector>(
                "nacosconnectors",
                &watch_client,
                &watch_metrics,
                publish,
                shutdown.clone(),
            ),
            ProviderId::Zookeeper => spawn_connector_watch::<ZookeeperConnector>(
                "zookeeperconnectors",
                &watch_client,
                &watch_metrics,
                publish,
                shutdown.clone(),
            ),
            ProviderId::Machine => spawn_connector_watch::<MachineConnector>(
                "machineconnectors",
                &watch_client,
                &watch_metrics,
                publish,
                shutdown.clone(),
            ),
            ProviderId::Gateway => spawn_connector_watch::<GatewayConnector>(
                "gatewayconnectors",
                &watch_client,
                &watch_metrics,
                publish,
                shutdown.clone(),
            ),
        }

        // Leadership changes re-run the reconcile so the new leader picks
        // the engines up (and the old one idles them).
        if let Some(mut claims) = claims {
            let broker = broker.clone();
            let name = sdr_connector.clone();
            tokio::spawn(async move {
                while claims.changed().await.is_ok() {
                    broker.publish(
                        Topic::ConnectorUpdate,
                        Event {
                            provider: sdr_provider,
                            name: name.clone(),
                            op: EventOp::Updated,
                        },
                    );
                }
            });
        }

        tokio::spawn(status::run(controller.clone(), shutdown));

        let listener_task = tokio::spawn({
            let controller = controller.clone();
            async move {
                listener
                    .run(|| {
                        let controller = controller.clone();
                        async move { controller.sync().await }
                    })
                    .await
            }
        });

        tokio::select! {
            res = listener_task => match res {
                Ok(Ok(())) => bail!("connector listener terminated"),
                Ok(Err(error)) => return Err(error),
                Err(error) => return Err(error.into()),
            },
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
        }

        Ok(())
    }
}

/// Forwards watch events for the configured connector onto the broker.
struct Publish {
    broker: Arc<Broker>,
    provider: ProviderId,
    name: String,
}

impl Publish {
    fn publish(&self, key: &str, op: EventOp) {
        // Connector resources are cluster-scoped; keys are `/<name>`.
        let name = key.rsplit('/').next().unwrap_or_default();
        if name != self.name {
            return;
        }
        self.broker.publish(
            Topic::ConnectorUpdate,
            Event {
                provider: self.provider,
                name: name.to_string(),
                op,
            },
        );
    }
}

#[async_trait::async_trait]
impl<T: Send + Sync + 'static> Handle<T> for Publish {
    async fn upsert(&self, key: &str, _obj: &T) -> Result<()> {
        self.publish(key, EventOp::Updated);
        Ok(())
    }

    async fn delete(&self, key: &str, _last: &T) -> Result<()> {
        self.publish(key, EventOp::Deleted);
        Ok(())
    }
}

fn spawn_connector_watch<T>(
    kind: &'static str,
    client: &kube::Client,
    metrics: &Metrics,
    handler: Arc<Publish>,
    shutdown: drain::Watch,
) where
    T: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T::DynamicType: Default,
{
    let watcher = Watcher::<T>::new(kind, 1, metrics.clone());
    let api = Api::<T>::all(client.clone());
    tokio::spawn(async move {
        if let Err(error) = watcher.run(api, handler, shutdown).await {
            error!(%kind, %error, "connector watch terminated");
        }
    });
}
