//! Reconciles the catalog snapshot against the cluster: plans a create/delete
//! set from aggregated descriptors and applies it through the rate limiter.
//!
//! Changed services are only ever deleted here; the next pass observes the
//! absence and recreates them, which keeps every apply a plain create.

use crate::{endpoints, Aggregation, Aggregator, Config, Context, Conversion};
use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::ResourceExt;
use registry_bridge_core::blob::{self, MicroSvcMeta};
use registry_bridge_core::hash::{fnv64, structural};
use registry_bridge_core::{
    DiscoveryClient, NamespacedService, ProviderId, PROTOCOL_GRPC, PROTOCOL_HTTP,
};
use registry_bridge_k8s_api::labels;
use registry_bridge_k8s_watch::Handle;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// A burst of triggers settles for this long before a sync runs.
const SYNC_QUIET: Duration = Duration::from_secs(1);
/// A continuous stream of triggers cannot defer a sync past this.
const SYNC_MAX_DELAY: Duration = Duration::from_secs(5);

pub struct Syncer {
    client: kube::Client,
    disc: Arc<dyn DiscoveryClient>,
    config: Arc<Config>,
    ctx: Arc<Context>,
    aggregator: Aggregator,
    trigger: Notify,
    /// Until the source reports its first catalog, an empty source set means
    /// "unknown", not "the catalog is empty"; deletes wait for it.
    primed: AtomicBool,
}

// === impl Syncer ===

impl Syncer {
    pub fn new(
        client: kube::Client,
        disc: Arc<dyn DiscoveryClient>,
        config: Arc<Config>,
        ctx: Arc<Context>,
    ) -> Arc<Self> {
        let aggregator = Aggregator::new(disc.clone(), config.clone(), ctx.clone());
        Arc::new(Self {
            client,
            disc,
            config,
            ctx,
            aggregator,
            trigger: Notify::new(),
            primed: AtomicBool::new(false),
        })
    }

    /// Installs the latest catalog snapshot and schedules a sync.
    pub fn set_services(
        &self,
        services: AHashMap<String, Conversion>,
        mut catalog: Vec<NamespacedService>,
    ) {
        let mut native = AHashMap::with_capacity(services.len());
        let mut external = AHashMap::new();
        for (kube_name, conversion) in services {
            if !conversion.external_name.is_empty() {
                external.insert(conversion.service.clone(), conversion.external_name);
            }
            native.insert(kube_name, conversion.service);
        }
        *self.ctx.source_services.write() = native.clone();
        *self.ctx.native_services.write() = native;
        *self.ctx.external_services.write() = external;

        catalog.sort_by(|a, b| (&a.namespace, &a.service).cmp(&(&b.namespace, &b.service)));
        if let Ok(hash) = structural(&catalog) {
            self.ctx
                .catalog_hash
                .store(hash, std::sync::atomic::Ordering::Relaxed);
        }
        *self.ctx.catalog_services.write() = catalog;

        self.primed.store(true, Ordering::Release);
        self.trigger.notify_one();
    }

    async fn sync(&self) {
        if !self.primed.load(Ordering::Acquire) {
            return;
        }
        let (creates, deletes) = self.plan().await;
        if creates.is_empty() && deletes.is_empty() {
            return;
        }
        debug!(
            creates = creates.len(),
            deletes = deletes.len(),
            "applying planned changes"
        );
        self.apply(creates, deletes).await;
    }

    /// One planning pass over the source set. Never mutates the cluster.
    async fn plan(&self) -> (Vec<(Service, Option<Endpoints>)>, Vec<String>) {
        let native = self
            .ctx
            .native_services
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        let external = self.ctx.external_services.read().clone();
        let synced_hash = self.ctx.synced_hash.read().clone();

        let mut source: AHashMap<String, String> = native.iter().cloned().collect();
        let mut creates = Vec::new();
        let mut deletes = AHashSet::new();
        let internal_sync =
            self.config.spec.with_gateway.enable && self.disc.is_internal_services();

        for (kube_name, cloud_name) in &native {
            if let Some(external_name) = external.get(cloud_name) {
                let agg = Aggregation {
                    services: AHashMap::new(),
                    labels: self.config.spec.append_labels.clone(),
                    annotations: self.config.spec.append_annotations.clone(),
                };
                let svc = materialize_external(
                    &self.config,
                    self.disc.provider(),
                    kube_name,
                    cloud_name,
                    &agg,
                    external_name,
                );
                match synced_hash.get(kube_name) {
                    Some(h) if *h == service_hash(&svc) => {}
                    Some(_) => {
                        deletes.insert(kube_name.clone());
                    }
                    None => creates.push((svc, None)),
                }
                continue;
            }

            let agg = match self.aggregator.aggregate(kube_name).await {
                Ok(agg) => agg,
                Err(error) => {
                    warn!(service = %cloud_name, %error, "aggregation failed; skipping");
                    continue;
                }
            };
            if agg.services.is_empty() && synced_hash.contains_key(kube_name) {
                deletes.insert(kube_name.clone());
                continue;
            }
            for (name, meta) in &agg.services {
                source.insert(name.clone(), cloud_name.clone());
                let mut meta = meta.clone();
                if let Some(fixed) = self.config.spec.fixed_http_service_port {
                    merge_fixed(&mut meta, PROTOCOL_HTTP, fixed);
                }
                if let Some(fixed) = self.config.spec.fixed_grpc_service_port {
                    merge_fixed(&mut meta, PROTOCOL_GRPC, fixed);
                }
                if meta.endpoints.is_empty() {
                    if synced_hash.contains_key(name) {
                        deletes.insert(name.clone());
                    }
                    continue;
                }
                let svc = match materialize(
                    &self.config,
                    self.disc.provider(),
                    name,
                    cloud_name,
                    &agg,
                    &meta,
                ) {
                    Ok(svc) => svc,
                    Err(error) => {
                        warn!(service = %name, %error, "failed to encode endpoint blob");
                        continue;
                    }
                };
                match synced_hash.get(name) {
                    Some(h) if *h == service_hash(&svc) => {}
                    Some(_) => {
                        deletes.insert(name.clone());
                    }
                    None => {
                        let eps = endpoints::build_endpoints(&svc, &meta, internal_sync);
                        creates.push((svc, Some(eps)));
                    }
                }
            }
        }

        // Anything this connector owns that the source no longer produces.
        for name in self.ctx.synced_services.read().keys() {
            if !source.contains_key(name) {
                deletes.insert(name.clone());
            }
        }
        *self.ctx.source_services.write() = source;

        (creates, deletes.into_iter().collect())
    }

    async fn apply(&self, creates: Vec<(Service, Option<Endpoints>)>, deletes: Vec<String>) {
        let ns = &self.config.derive_namespace;
        let services: Api<Service> = Api::namespaced(self.client.clone(), ns);
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), ns);

        for name in deletes {
            self.config.limiter.acquire().await;
            match services.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(service = %name, "deleted service"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(error) => {
                    warn!(service = %name, %error, "failed to delete service");
                    continue;
                }
            }
            let _ = endpoints.delete(&name, &DeleteParams::default()).await;
            self.ctx.synced_services.write().remove(&name);
            self.ctx.synced_hash.write().remove(&name);
        }

        for (svc, eps) in creates {
            self.config.limiter.acquire().await;
            let name = svc.name_any();
            match services.create(&PostParams::default(), &svc).await {
                Ok(created) => {
                    info!(service = %name, "created service");
                    self.ctx
                        .synced_hash
                        .write()
                        .insert(name.clone(), service_hash(&created));
                    self.ctx
                        .synced_services
                        .write()
                        .insert(name.clone(), Arc::new(created));
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!(service = %name, "service already exists");
                }
                Err(error) => {
                    warn!(service = %name, %error, "failed to create service");
                    continue;
                }
            }
            if let Some(eps) = eps {
                self.config.limiter.acquire().await;
                match endpoints.create(&PostParams::default(), &eps).await {
                    Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => {}
                    Err(error) => {
                        warn!(service = %name, %error, "failed to create endpoints");
                    }
                }
            }
        }
    }

    fn owned(&self, svc: &Service) -> bool {
        let sourced = svc
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::CLOUD_SOURCED_SERVICE_LABEL))
            .map(String::as_str)
            == Some("true");
        let managed = svc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(labels::ANNOTATION_CLOUD_SERVICE_MANAGED_BY))
            == Some(&self.config.connector_uid);
        sourced && managed
    }

    /// Waits out a burst of triggers; returns once no new trigger arrived
    /// for [`SYNC_QUIET`] or the deadline passed.
    async fn settle(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
        let deadline = tokio::time::Instant::now() + SYNC_MAX_DELAY;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SYNC_QUIET) => return,
                _ = tokio::time::sleep_until(deadline) => return,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = self.trigger.notified() => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl Handle<Service> for Syncer {
    /// Tracks services this connector owns so the planner can diff against
    /// what is actually in the cluster.
    async fn upsert(&self, key: &str, svc: &Service) -> Result<()> {
        let (ns, name) = split_key(key);
        if ns != self.config.derive_namespace || !self.owned(svc) {
            return Ok(());
        }
        let hash = service_hash(svc);
        let drifted = self.ctx.synced_hash.read().get(name) != Some(&hash);
        self.ctx
            .synced_services
            .write()
            .insert(name.to_string(), Arc::new(svc.clone()));
        self.ctx.synced_hash.write().insert(name.to_string(), hash);
        if drifted {
            self.trigger.notify_one();
        }
        Ok(())
    }

    async fn delete(&self, key: &str, _last: &Service) -> Result<()> {
        let (ns, name) = split_key(key);
        if ns != self.config.derive_namespace {
            return Ok(());
        }
        self.ctx.synced_services.write().remove(name);
        self.ctx.synced_hash.write().remove(name);
        if self.ctx.source_services.read().contains_key(name) {
            // Still wanted; schedule a recreate.
            self.trigger.notify_one();
        }
        Ok(())
    }

    /// The derive namespace must exist before anything is materialized.
    async fn ready(&self) -> bool {
        Api::<Namespace>::all(self.client.clone())
            .get(&self.config.derive_namespace)
            .await
            .is_ok()
    }

    async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = self.trigger.notified() => {
                    self.settle(&mut shutdown).await;
                    if *shutdown.borrow() {
                        return;
                    }
                    self.sync().await;
                }
            }
        }
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

/// Hashes the parts of a service this connector controls. Server-populated
/// metadata (uid, resourceVersion) stays out so a create round-trip does not
/// read back as drift.
pub(crate) fn service_hash(svc: &Service) -> u64 {
    let mut buf = Vec::new();
    if let Some(labels) = &svc.metadata.labels {
        if let Ok(bytes) = serde_json::to_vec(labels) {
            buf.extend(bytes);
        }
    }
    if let Some(annotations) = &svc.metadata.annotations {
        if let Ok(bytes) = serde_json::to_vec(annotations) {
            buf.extend(bytes);
        }
    }
    if let Some(spec) = &svc.spec {
        if let Some(ports) = &spec.ports {
            if let Ok(bytes) = serde_json::to_vec(ports) {
                buf.extend(bytes);
            }
        }
        if let Some(external_name) = &spec.external_name {
            if let Ok(bytes) = serde_json::to_vec(external_name) {
                buf.extend(bytes);
            }
        }
    }
    fnv64(&buf)
}

/// Collapses multi-port endpoints of one protocol onto one service port:
/// the port backed by the most endpoints wins (the larger port on a tie)
/// and is remapped to `fixed`. Endpoints without a port of that protocol
/// are untouched.
fn merge_fixed(meta: &mut MicroSvcMeta, wanted: &str, fixed: u16) {
    let mut buckets: AHashMap<u16, usize> = AHashMap::new();
    for ep in meta.endpoints.values() {
        for (port, protocol) in &ep.ports {
            if protocol == wanted {
                *buckets.entry(*port).or_default() += 1;
            }
        }
    }
    let Some(winner) = buckets
        .iter()
        .max_by(|(pa, ca), (pb, cb)| ca.cmp(cb).then(pa.cmp(pb)))
        .map(|(port, _)| *port)
    else {
        return;
    };
    meta.endpoints.retain(|_, ep| {
        ep.ports
            .iter()
            .all(|(port, protocol)| protocol != wanted || *port == winner)
    });
    meta.target_ports
        .retain(|port, protocol| protocol != wanted || *port == winner);
    meta.service_ports
        .get_or_insert_with(BTreeMap::new)
        .insert(winner, fixed);
}

fn base_metadata(
    config: &Config,
    provider: ProviderId,
    cloud_name: &str,
    agg: &Aggregation,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels_out = agg.labels.clone();
    labels_out.insert(
        labels::CLOUD_SOURCED_SERVICE_LABEL.to_string(),
        "true".to_string(),
    );
    let mut annotations = agg.annotations.clone();
    annotations.insert(
        labels::ANNOTATION_CLOUD_SERVICE_PROVIDER.to_string(),
        provider.to_string(),
    );
    annotations.insert(
        labels::ANNOTATION_CLOUD_SERVICE_MANAGED_BY.to_string(),
        config.connector_uid.clone(),
    );
    annotations.insert(
        labels::ANNOTATION_CLOUD_SERVICE_INHERITED_FROM.to_string(),
        cloud_name.to_string(),
    );
    if !config.cluster_set.is_empty() {
        annotations.insert(
            labels::ANNOTATION_CLOUD_SERVICE_INHERITED_CLUSTER_ID.to_string(),
            config.cluster_set.clone(),
        );
    }
    (labels_out, annotations)
}

/// Builds the cluster service for one aggregated descriptor, including the
/// encoded endpoint blob.
pub(crate) fn materialize(
    config: &Config,
    provider: ProviderId,
    name: &str,
    cloud_name: &str,
    agg: &Aggregation,
    meta: &MicroSvcMeta,
) -> Result<Service, serde_json::Error> {
    let (mut svc_labels, mut annotations) = base_metadata(config, provider, cloud_name, agg);
    if let Some(grpc) = &meta.grpc_meta {
        svc_labels.insert(
            labels::GRPC_SERVICE_INTERFACE_LABEL.to_string(),
            grpc.interface.clone(),
        );
    }
    if meta.health_check {
        // Health-checked services must not loop back out of the cluster.
        annotations.insert(
            labels::ANNOTATION_CLOUD_HEALTH_CHECK_SERVICE.to_string(),
            "true".to_string(),
        );
        annotations.insert(
            labels::ANNOTATION_SERVICE_SYNC_K8S_TO_CLOUD.to_string(),
            "false".to_string(),
        );
        annotations.insert(
            labels::ANNOTATION_SERVICE_SYNC_K8S_TO_FGW.to_string(),
            "false".to_string(),
        );
    }
    let (enc, hash) = blob::encode(meta)?;
    annotations.insert(labels::ANNOTATION_MESH_ENDPOINT_ADDR.to_string(), enc);
    annotations.insert(
        labels::ANNOTATION_MESH_ENDPOINT_HASH.to_string(),
        hash.to_string(),
    );

    let mut ports = Vec::with_capacity(meta.target_ports.len());
    for (&target, protocol) in &meta.target_ports {
        let port = meta
            .service_ports
            .as_ref()
            .and_then(|remap| remap.get(&target))
            .copied()
            .unwrap_or(target);
        let app_protocol = (protocol == PROTOCOL_HTTP || protocol == PROTOCOL_GRPC)
            .then(|| protocol.clone());
        ports.push(ServicePort {
            name: Some(format!("{protocol}{port}")),
            port: i32::from(port),
            protocol: Some("TCP".to_string()),
            app_protocol,
            target_port: Some(IntOrString::Int(i32::from(target))),
            ..Default::default()
        });
    }

    let mut selector = BTreeMap::new();
    selector.insert(labels::CLOUD_SERVICE_LABEL.to_string(), name.to_string());

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(config.derive_namespace.clone()),
            labels: Some(svc_labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            // Headless: endpoints carry the real addresses, so kube-proxy
            // must not allocate a virtual IP in front of them.
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(ports),
            ip_families: Some(vec!["IPv4".to_string()]),
            ip_family_policy: Some("SingleStack".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

/// Builds an ExternalName service for a conversion override; no endpoints
/// are materialized for these.
pub(crate) fn materialize_external(
    config: &Config,
    provider: ProviderId,
    name: &str,
    cloud_name: &str,
    agg: &Aggregation,
    external_name: &str,
) -> Service {
    let (svc_labels, annotations) = base_metadata(config, provider, cloud_name, agg);
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(config.derive_namespace.clone()),
            labels: Some(svc_labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(external_name.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_bridge_core::blob::MicroEndpointMeta;
    use registry_bridge_core::RateLimiter;
    use registry_bridge_k8s_api::ConnectorSpec;

    fn config(patch: serde_json::Value) -> Config {
        let mut spec = serde_json::json!({
            "httpAddr": "consul:8500",
            "deriveNamespace": "derive",
            "syncToK8S": {"enable": true},
            "syncFromK8S": {"enable": false},
        });
        if let (Some(obj), Some(to)) = (
            patch.as_object(),
            spec.get_mut("syncToK8S").and_then(|v| v.as_object_mut()),
        ) {
            for (k, v) in obj {
                to.insert(k.clone(), v.clone());
            }
        }
        let spec: ConnectorSpec = serde_json::from_value(spec).unwrap();
        Config::new(&spec, "uid-1", RateLimiter::new(500, 750))
    }

    fn http_meta(addrs_and_ports: &[(&str, u16)]) -> MicroSvcMeta {
        let mut meta = MicroSvcMeta::default();
        for (addr, port) in addrs_and_ports {
            meta.target_ports.insert(*port, PROTOCOL_HTTP.to_string());
            let mut ep = MicroEndpointMeta {
                address: addr.to_string(),
                ..Default::default()
            };
            ep.ports.insert(*port, PROTOCOL_HTTP.to_string());
            meta.endpoints.insert(addr.to_string(), ep);
        }
        meta
    }

    fn agg() -> Aggregation {
        Aggregation::default()
    }

    #[test]
    fn materialized_service_carries_ownership_and_blob() {
        let config = config(serde_json::json!({"clusterId": "set-1"}));
        let meta = http_meta(&[("10.1.1.5", 8080)]);
        let svc =
            materialize(&config, ProviderId::Consul, "payments", "payments", &agg(), &meta)
                .unwrap();

        let labels_out = svc.metadata.labels.as_ref().unwrap();
        assert_eq!(labels_out[labels::CLOUD_SOURCED_SERVICE_LABEL], "true");
        let annotations = svc.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[labels::ANNOTATION_CLOUD_SERVICE_PROVIDER], "consul");
        assert_eq!(annotations[labels::ANNOTATION_CLOUD_SERVICE_MANAGED_BY], "uid-1");
        assert_eq!(
            annotations[labels::ANNOTATION_CLOUD_SERVICE_INHERITED_CLUSTER_ID],
            "set-1"
        );

        let decoded =
            blob::decode(&annotations[labels::ANNOTATION_MESH_ENDPOINT_ADDR]).unwrap();
        assert_eq!(decoded, meta);

        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("http8080"));
        assert_eq!(port.port, 8080);
        assert_eq!(port.app_protocol.as_deref(), Some("http"));
        assert_eq!(
            spec.selector.as_ref().unwrap()[labels::CLOUD_SERVICE_LABEL],
            "payments"
        );
    }

    #[test]
    fn health_checked_services_never_sync_back_out() {
        let config = config(serde_json::json!({}));
        let mut meta = http_meta(&[("10.1.1.5", 8080)]);
        meta.health_check = true;
        let svc =
            materialize(&config, ProviderId::Consul, "payments", "payments", &agg(), &meta)
                .unwrap();
        let annotations = svc.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[labels::ANNOTATION_SERVICE_SYNC_K8S_TO_CLOUD], "false");
        assert_eq!(annotations[labels::ANNOTATION_SERVICE_SYNC_K8S_TO_FGW], "false");
    }

    #[test]
    fn external_conversion_becomes_external_name() {
        let config = config(serde_json::json!({}));
        let svc = materialize_external(
            &config,
            ProviderId::Eureka,
            "payments",
            "payments",
            &agg(),
            "payments.example.com",
        );
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
        assert_eq!(spec.external_name.as_deref(), Some("payments.example.com"));
        assert!(spec.ports.is_none());
    }

    #[test]
    fn fixed_port_collapse_keeps_the_biggest_bucket() {
        let mut meta = http_meta(&[
            ("10.1.1.5", 8080),
            ("10.1.1.6", 8080),
            ("10.1.1.7", 9090),
        ]);
        merge_fixed(&mut meta, PROTOCOL_HTTP, 80);
        assert_eq!(meta.endpoints.len(), 2);
        assert!(!meta.endpoints.contains_key("10.1.1.7"));
        assert_eq!(meta.target_ports.len(), 1);
        assert_eq!(meta.service_ports.as_ref().unwrap()[&8080], 80);
    }

    #[test]
    fn fixed_port_collapse_breaks_ties_toward_the_larger_port() {
        let mut meta = http_meta(&[("10.1.1.5", 8080), ("10.1.1.7", 9090)]);
        merge_fixed(&mut meta, PROTOCOL_HTTP, 80);
        assert!(meta.endpoints.contains_key("10.1.1.7"));
        assert!(!meta.endpoints.contains_key("10.1.1.5"));
    }

    #[test]
    fn fixed_grpc_port_collapses_only_grpc_endpoints() {
        let mut meta = http_meta(&[("10.1.1.5", 8080)]);
        for (addr, port) in [("10.1.1.8", 50051_u16), ("10.1.1.9", 50052)] {
            meta.target_ports.insert(port, PROTOCOL_GRPC.to_string());
            let mut ep = MicroEndpointMeta {
                address: addr.to_string(),
                ..Default::default()
            };
            ep.ports.insert(port, PROTOCOL_GRPC.to_string());
            meta.endpoints.insert(addr.to_string(), ep);
        }
        merge_fixed(&mut meta, PROTOCOL_GRPC, 50000);
        // The http endpoint is untouched; the grpc tie breaks upward.
        assert!(meta.endpoints.contains_key("10.1.1.5"));
        assert!(meta.endpoints.contains_key("10.1.1.9"));
        assert!(!meta.endpoints.contains_key("10.1.1.8"));
        assert_eq!(meta.service_ports.as_ref().unwrap()[&50052], 50000);
        assert_eq!(meta.target_ports[&8080], PROTOCOL_HTTP);
    }

    #[test]
    fn fixed_port_remap_rewrites_the_service_port() {
        let config = config(serde_json::json!({"fixedHttpServicePort": 80}));
        let mut meta = http_meta(&[("10.1.1.5", 8080)]);
        merge_fixed(&mut meta, PROTOCOL_HTTP, 80);
        let svc =
            materialize(&config, ProviderId::Consul, "payments", "payments", &agg(), &meta)
                .unwrap();
        let port = &svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.name.as_deref(), Some("http80"));
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn unchanged_builds_hash_identically() {
        let config = config(serde_json::json!({}));
        let meta = http_meta(&[("10.1.1.5", 8080)]);
        let a = materialize(&config, ProviderId::Consul, "payments", "payments", &agg(), &meta)
            .unwrap();
        let b = materialize(&config, ProviderId::Consul, "payments", "payments", &agg(), &meta)
            .unwrap();
        assert_eq!(service_hash(&a), service_hash(&b));

        let changed = http_meta(&[("10.1.1.5", 8080), ("10.1.1.6", 8080)]);
        let c =
            materialize(&config, ProviderId::Consul, "payments", "payments", &agg(), &changed)
                .unwrap();
        assert_ne!(service_hash(&a), service_hash(&c));
    }
}
