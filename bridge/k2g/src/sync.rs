//! Writes routes for eligible cluster services and tears them down when a
//! service leaves the set or changes protocol.

use crate::route::{
    build_route, hostnames, is_internal, listener_parents, port_protocol, RouteKind, RouteObject,
};
use crate::{Config, Context};
use ahash::AHashSet;
use anyhow::{Context as _, Result};
use gateway_api::apis::experimental::{
    gateways::Gateway, grpcroutes::GRPCRoute, httproutes::HTTPRoute, tcproutes::TCPRoute,
};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;
use registry_bridge_core::hash::structural;
use registry_bridge_k8s_api::labels;
use registry_bridge_k8s_watch::{retry_on_conflict, Handle, Store, Watcher};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub struct RouteSource {
    client: kube::Client,
    config: Arc<Config>,
    ctx: Arc<Context>,
    gateways: Store<Gateway>,
    endpoints: Store<Endpoints>,
}

// === impl RouteSource ===

impl RouteSource {
    pub fn new(
        client: kube::Client,
        config: Arc<Config>,
        ctx: Arc<Context>,
        gateways: Store<Gateway>,
        endpoints: Store<Endpoints>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            ctx,
            gateways,
            endpoints,
        })
    }

    fn gateway(&self) -> Option<Arc<Gateway>> {
        self.gateways
            .entries()
            .into_iter()
            .map(|(_, gw)| gw)
            .find(|gw| gw.name_any() == self.config.gateway_name)
    }

    async fn apply(&self, ns: &str, route: RouteObject) -> Result<()> {
        match route {
            RouteObject::Http(route) => {
                let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), ns);
                self.apply_route(api, route, |r| &r.spec).await
            }
            RouteObject::Grpc(route) => {
                let api: Api<GRPCRoute> = Api::namespaced(self.client.clone(), ns);
                self.apply_route(api, route, |r| &r.spec).await
            }
            RouteObject::Tcp(route) => {
                let api: Api<TCPRoute> = Api::namespaced(self.client.clone(), ns);
                self.apply_route(api, route, |r| &r.spec).await
            }
        }
    }

    /// Creates the route, or replaces it when its spec drifted. The spec
    /// hash is structural, so server-side defaulting does not churn.
    async fn apply_route<T, S>(&self, api: Api<T>, desired: T, spec_of: fn(&T) -> &S) -> Result<()>
    where
        T: kube::Resource<DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        S: Serialize,
    {
        let name = desired.name_any();
        self.config.limiter.acquire().await;
        let current = api.get_opt(&name).await.context("fetching route")?;
        match current {
            None => {
                api.create(&PostParams::default(), &desired)
                    .await
                    .context("creating route")?;
                info!(route = %name, kind = %T::kind(&()), "created route");
            }
            Some(current) => {
                let unchanged = structural(spec_of(&current)).context("hashing route")?
                    == structural(spec_of(&desired)).context("hashing route")?;
                if unchanged {
                    return Ok(());
                }
                self.config.limiter.acquire().await;
                retry_on_conflict(|| {
                    let api = api.clone();
                    let mut desired = desired.clone();
                    let name = name.clone();
                    async move {
                        let current = api.get(&name).await?;
                        desired.meta_mut().resource_version =
                            current.meta().resource_version.clone();
                        api.replace(&name, &PostParams::default(), &desired).await
                    }
                })
                .await
                .context("replacing route")?;
                info!(route = %name, kind = %T::kind(&()), "replaced route");
            }
        }
        Ok(())
    }

    async fn delete_route<T>(&self, api: Api<T>, name: &str) -> Result<()>
    where
        T: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        self.config.limiter.acquire().await;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(route = %name, kind = %T::kind(&()), "deleted route");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(error) => Err(error).context("deleting route"),
        }
    }

    /// Deletes the service's route in every kind not in `keep`. Kinds that
    /// were never written delete as a no-op.
    async fn delete_kinds(&self, ns: &str, name: &str, keep: &AHashSet<RouteKind>) -> Result<()> {
        for kind in RouteKind::ALL {
            if keep.contains(&kind) {
                continue;
            }
            match kind {
                RouteKind::Http => {
                    self.delete_route(Api::<HTTPRoute>::namespaced(self.client.clone(), ns), name)
                        .await?
                }
                RouteKind::Grpc => {
                    self.delete_route(Api::<GRPCRoute>::namespaced(self.client.clone(), ns), name)
                        .await?
                }
                RouteKind::Tcp => {
                    self.delete_route(Api::<TCPRoute>::namespaced(self.client.clone(), ns), name)
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str, ns: &str, name: &str) -> Result<()> {
        self.delete_kinds(ns, name, &AHashSet::new()).await?;
        self.ctx.synced.write().remove(key);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handle<Service> for RouteSource {
    async fn upsert(&self, key: &str, svc: &Service) -> Result<()> {
        let Some((ns, name)) = key.split_once('/') else {
            return Ok(());
        };
        if !eligible(&self.config, ns, svc) {
            return self.remove(key, ns, name).await;
        }
        let Some(gateway) = self.gateway() else {
            debug!(gateway = %self.config.gateway_name, "gateway not observed yet");
            return Ok(());
        };

        let internal = is_internal(svc);
        let endpoints = self.endpoints.get(key);
        let ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.clone())
            .unwrap_or_default();
        let mut kept = AHashSet::new();
        for port in &ports {
            let protocol = port_protocol(port);
            let parents = listener_parents(&self.config, &gateway, internal, &protocol);
            if parents.is_empty() {
                debug!(service = %name, %protocol, "no gateway listener for port");
                continue;
            }
            let route = build_route(
                svc,
                port,
                &protocol,
                hostnames(svc, endpoints.as_deref()),
                &parents,
            );
            kept.insert(route.kind());
            self.apply(ns, route).await?;
        }
        // A port that changed protocols leaves a route of the old kind behind.
        self.delete_kinds(ns, name, &kept).await?;
        if kept.is_empty() {
            self.ctx.synced.write().remove(key);
        } else {
            self.ctx.synced.write().insert(key.to_string());
        }
        Ok(())
    }

    async fn delete(&self, key: &str, _last: &Service) -> Result<()> {
        let Some((ns, name)) = key.split_once('/') else {
            return Ok(());
        };
        self.remove(key, ns, name).await
    }
}

/// A listener change can reparent any route, so every service gets nudged.
/// Gateway edits are rare enough for this to be cheap.
pub struct GatewayNudger {
    services: Arc<Watcher<Service>>,
    store: Store<Service>,
}

// === impl GatewayNudger ===

impl GatewayNudger {
    pub fn new(services: Arc<Watcher<Service>>) -> Arc<Self> {
        let store = services.store();
        Arc::new(Self { services, store })
    }

    fn nudge_all(&self) {
        for key in self.store.keys() {
            self.services.nudge(key);
        }
    }
}

#[async_trait::async_trait]
impl Handle<Gateway> for GatewayNudger {
    async fn upsert(&self, _key: &str, _obj: &Gateway) -> Result<()> {
        self.nudge_all();
        Ok(())
    }

    async fn delete(&self, _key: &str, _last: &Gateway) -> Result<()> {
        self.nudge_all();
        Ok(())
    }
}

pub(crate) fn eligible(config: &Config, ns: &str, svc: &Service) -> bool {
    if !config.spec.enable || config.spec.purge {
        return false;
    }
    if !namespace_allowed(config, ns) {
        return false;
    }
    match annotation(svc, labels::ANNOTATION_SERVICE_SYNC_K8S_TO_FGW)
        .and_then(|v| v.parse::<bool>().ok())
    {
        Some(true) => {}
        Some(false) => return false,
        None => {
            if !config.spec.default_sync {
                return false;
            }
        }
    }
    // Routes need an in-cluster backend; ExternalName services have none.
    !matches!(
        svc.spec.as_ref().and_then(|s| s.type_.as_deref()),
        Some("ExternalName")
    )
}

fn namespace_allowed(config: &Config, ns: &str) -> bool {
    let spec = &config.spec;
    if spec
        .deny_k8s_namespaces
        .iter()
        .any(|d| d == "*" || d == ns)
    {
        return false;
    }
    spec.allow_k8s_namespaces
        .iter()
        .any(|a| a == "*" || a == ns)
}

fn annotation<'a>(svc: &'a Service, key: &str) -> Option<&'a str> {
    svc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use registry_bridge_core::RateLimiter;
    use registry_bridge_k8s_api::{GatewayListenerSelector, GatewaySyncSpec, SyncToFgwSpec};
    use std::time::Duration;

    fn config(sync: SyncToFgwSpec) -> Config {
        let spec = GatewaySyncSpec {
            gateway_name: "fsm-gateway".to_string(),
            ingress: GatewayListenerSelector {
                http_port: 10080,
                grpc_port: 10190,
            },
            egress: GatewayListenerSelector {
                http_port: 10090,
                grpc_port: 10290,
            },
            sync_to_fgw: sync,
            leader_election: None,
        };
        Config::new(&spec, "uid-1", RateLimiter::new(500, 750))
    }

    fn sync_spec() -> SyncToFgwSpec {
        SyncToFgwSpec {
            enable: true,
            purge: false,
            sync_period: Duration::from_secs(5).into(),
            default_sync: true,
            allow_k8s_namespaces: vec!["*".to_string()],
            deny_k8s_namespaces: vec![],
        }
    }

    fn service(annotations: Option<std::collections::BTreeMap<String, String>>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                annotations,
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn default_sync_admits_unannotated_services() {
        let config = config(sync_spec());
        assert!(eligible(&config, "shop", &service(None)));
    }

    #[test]
    fn annotation_opt_out_wins_over_default_sync() {
        let config = config(sync_spec());
        let svc = service(Some(btreemap! {
            labels::ANNOTATION_SERVICE_SYNC_K8S_TO_FGW.to_string() => "false".to_string(),
        }));
        assert!(!eligible(&config, "shop", &svc));
    }

    #[test]
    fn annotation_opt_in_overrides_disabled_default() {
        let mut sync = sync_spec();
        sync.default_sync = false;
        let config = config(sync);
        assert!(!eligible(&config, "shop", &service(None)));

        let svc = service(Some(btreemap! {
            labels::ANNOTATION_SERVICE_SYNC_K8S_TO_FGW.to_string() => "true".to_string(),
        }));
        assert!(eligible(&config, "shop", &svc));
    }

    #[test]
    fn deny_list_beats_allow_list() {
        let mut sync = sync_spec();
        sync.deny_k8s_namespaces = vec!["shop".to_string()];
        let config = config(sync);
        assert!(!eligible(&config, "shop", &service(None)));
        assert!(eligible(&config, "other", &service(None)));
    }

    #[test]
    fn external_name_services_are_skipped() {
        let config = config(sync_spec());
        let mut svc = service(None);
        svc.spec = Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some("web.example.com".to_string()),
            ..Default::default()
        });
        assert!(!eligible(&config, "shop", &svc));
    }

    #[test]
    fn purge_disables_the_direction() {
        let mut sync = sync_spec();
        sync.purge = true;
        let config = config(sync);
        assert!(!eligible(&config, "shop", &service(None)));
    }
}
