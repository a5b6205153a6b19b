//! Derives catalog registrations from cluster services.
//!
//! One registration is produced per service x address candidate; which
//! addresses qualify depends on the service type. The instance id is a pure
//! function of the registration's identity fields, so re-deriving the same
//! service yields the same ids and the syncer's retries stay idempotent.

use crate::{Config, Context, OwnedRegistration, Syncer};
use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use k8s_openapi::api::core::v1::{Endpoints, EndpointSubset, Node, Service, ServicePort};
use k8s_openapi::api::networking::v1::Ingress;
use registry_bridge_core::hash::instance_id;
use registry_bridge_core::{
    AgentCheck, AgentService, AgentWeights, CatalogDeregistration, CatalogRegistration,
    DiscoveryClient, PROTOCOL_GRPC, PROTOCOL_HTTP,
};
use registry_bridge_k8s_api::{labels, NodePortSyncType};
use registry_bridge_k8s_watch::{Handle, Store, Watcher};
use std::sync::Arc;

/// Node name attached to registrations when the connector does not pin one.
const DEFAULT_SYNC_NODE: &str = "k8s-sync";

pub struct ServiceSource {
    disc: Arc<dyn DiscoveryClient>,
    config: Arc<Config>,
    ctx: Arc<Context>,
    syncer: Arc<Syncer>,
    endpoints: Store<Endpoints>,
    nodes: Store<Node>,
    ingresses: Store<Ingress>,
}

// === impl ServiceSource ===

impl ServiceSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        disc: Arc<dyn DiscoveryClient>,
        config: Arc<Config>,
        ctx: Arc<Context>,
        syncer: Arc<Syncer>,
        endpoints: Store<Endpoints>,
        nodes: Store<Node>,
        ingresses: Store<Ingress>,
    ) -> Arc<Self> {
        Arc::new(Self {
            disc,
            config,
            ctx,
            syncer,
            endpoints,
            nodes,
            ingresses,
        })
    }

    /// Drops a service's registrations and queues their deregistrations.
    fn remove(&self, key: &str) {
        let Some(prev) = self.ctx.by_key.write().remove(key) else {
            return;
        };
        let mut deregs = self.ctx.deregs.write();
        for owned in prev {
            deregs.insert(
                owned.registration.service.id.clone(),
                deregistration_of(&owned),
            );
        }
        drop(deregs);
        self.syncer.schedule();
    }
}

#[async_trait::async_trait]
impl Handle<Service> for ServiceSource {
    async fn upsert(&self, key: &str, svc: &Service) -> Result<()> {
        let ns = key.split_once('/').map(|(ns, _)| ns).unwrap_or_default();
        if !eligible(&self.config, ns, svc) {
            self.remove(key);
            return Ok(());
        }

        let endpoints = self.endpoints.get(key);
        let ingresses = self
            .ingresses
            .entries()
            .into_iter()
            .map(|(_, ing)| ing)
            .collect::<Vec<_>>();
        let nodes = self.nodes.clone();
        let lookup = move |name: &str| nodes.get(&format!("/{name}"));
        let regs = generate(&self.config, svc, endpoints.as_deref(), &lookup, &ingresses);
        if regs.is_empty() {
            self.remove(key);
            return Ok(());
        }

        let registry_ns = self.disc.registered_namespace(ns);
        let new_ids = regs
            .iter()
            .map(|r| r.service.id.clone())
            .collect::<AHashSet<_>>();
        let owned = regs
            .into_iter()
            .map(|registration| OwnedRegistration {
                registry_ns: registry_ns.clone(),
                registration,
            })
            .collect::<Vec<_>>();
        let prev = self.ctx.by_key.write().insert(key.to_string(), owned);
        if let Some(prev) = prev {
            // Addresses that fell out of the set are torn down.
            let mut deregs = self.ctx.deregs.write();
            for old in prev {
                if !new_ids.contains(&old.registration.service.id) {
                    deregs.insert(old.registration.service.id.clone(), deregistration_of(&old));
                }
            }
        }
        self.syncer.schedule();
        Ok(())
    }

    async fn delete(&self, key: &str, _last: &Service) -> Result<()> {
        self.remove(key);
        Ok(())
    }
}

/// Endpoint churn re-evaluates the owning service; the keys line up.
pub struct EndpointsNudger {
    services: Arc<Watcher<Service>>,
}

impl EndpointsNudger {
    pub fn new(services: Arc<Watcher<Service>>) -> Arc<Self> {
        Arc::new(Self { services })
    }
}

#[async_trait::async_trait]
impl Handle<Endpoints> for EndpointsNudger {
    async fn upsert(&self, key: &str, _obj: &Endpoints) -> Result<()> {
        self.services.nudge(key.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str, _last: &Endpoints) -> Result<()> {
        self.services.nudge(key.to_string());
        Ok(())
    }
}

/// An ingress change can affect any service in its namespace, so all of
/// them get nudged. Ingress events are rare enough for this to be cheap.
pub struct IngressNudger {
    services: Arc<Watcher<Service>>,
    store: Store<Service>,
}

impl IngressNudger {
    pub fn new(services: Arc<Watcher<Service>>) -> Arc<Self> {
        let store = services.store();
        Arc::new(Self { services, store })
    }

    fn nudge_namespace(&self, key: &str) {
        let ns = key.split_once('/').map(|(ns, _)| ns).unwrap_or_default();
        let prefix = format!("{ns}/");
        for key in self.store.keys() {
            if key.starts_with(&prefix) {
                self.services.nudge(key);
            }
        }
    }
}

#[async_trait::async_trait]
impl Handle<Ingress> for IngressNudger {
    async fn upsert(&self, key: &str, _obj: &Ingress) -> Result<()> {
        self.nudge_namespace(key);
        Ok(())
    }

    async fn delete(&self, key: &str, _last: &Ingress) -> Result<()> {
        self.nudge_namespace(key);
        Ok(())
    }
}

fn deregistration_of(owned: &OwnedRegistration) -> CatalogDeregistration {
    CatalogDeregistration {
        node: owned.registration.node.clone(),
        service_id: owned.registration.service.id.clone(),
        service_name: owned.registration.service.service.clone(),
        namespace: (!owned.registry_ns.is_empty()).then(|| owned.registry_ns.clone()),
    }
}

/// Whether a cluster service should be advertised to the registry.
pub(crate) fn eligible(config: &Config, ns: &str, svc: &Service) -> bool {
    if ns == config.derive_namespace {
        return false;
    }
    if !namespace_allowed(config, ns) {
        return false;
    }
    match annotation(svc, labels::ANNOTATION_SERVICE_SYNC_K8S_TO_CLOUD)
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
    match svc.spec.as_ref().and_then(|s| s.type_.as_deref()) {
        Some("NodePort") | Some("LoadBalancer") => true,
        Some("ClusterIP") | None => config.spec.sync_cluster_ip_services,
        _ => false,
    }
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

/// Splits a tag annotation on commas, honoring `\,` escapes.
pub(crate) fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut cur = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                cur.push(',');
                chars.next();
            }
            ',' => {
                let tag = cur.trim();
                if !tag.is_empty() {
                    tags.push(tag.to_string());
                }
                cur.clear();
            }
            c => cur.push(c),
        }
    }
    let tag = cur.trim();
    if !tag.is_empty() {
        tags.push(tag.to_string());
    }
    tags
}

fn is_http(port: &ServicePort) -> bool {
    port.app_protocol.as_deref() == Some(PROTOCOL_HTTP)
        || port.name.as_deref().is_some_and(|n| n.starts_with("http"))
}

fn is_grpc(port: &ServicePort) -> bool {
    port.app_protocol.as_deref() == Some(PROTOCOL_GRPC)
        || port.name.as_deref().is_some_and(|n| n.starts_with("grpc"))
}

/// Picks the http and grpc service ports. An explicit port-name annotation
/// wins for http; otherwise the first matching port, falling back to the
/// first port at all.
fn select_ports<'a>(
    svc: &'a Service,
    override_name: Option<&str>,
) -> (Option<&'a ServicePort>, Option<&'a ServicePort>) {
    let Some(ports) = svc.spec.as_ref().and_then(|s| s.ports.as_ref()) else {
        return (None, None);
    };
    let http = override_name
        .and_then(|name| ports.iter().find(|p| p.name.as_deref() == Some(name)))
        .or_else(|| ports.iter().find(|p| is_http(p)))
        .or_else(|| ports.first());
    let grpc = ports.iter().find(|p| is_grpc(p));
    (http, grpc)
}

/// The backend port of `svc_port` within a subset.
fn subset_port(subset: &EndpointSubset, svc_port: &ServicePort) -> u16 {
    let Some(ports) = subset.ports.as_ref() else {
        return 0;
    };
    if ports.len() == 1 {
        return as_u16(ports[0].port);
    }
    ports
        .iter()
        .find(|p| p.name == svc_port.name)
        .map(|p| as_u16(p.port))
        .unwrap_or(0)
}

fn as_u16(port: i32) -> u16 {
    u16::try_from(port).unwrap_or(0)
}

fn node_address(node: &Node, mode: NodePortSyncType) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    let find = |kind: &str| {
        addresses
            .iter()
            .find(|a| a.type_ == kind)
            .map(|a| a.address.clone())
    };
    match mode {
        NodePortSyncType::ExternalOnly => find("ExternalIP"),
        NodePortSyncType::InternalOnly => find("InternalIP"),
        NodePortSyncType::ExternalFirst => find("ExternalIP").or_else(|| find("InternalIP")),
    }
}

/// Ingress hosts that front `svc_name` at path `/`, with the port picked by
/// TLS coverage.
fn ingress_overrides(
    config: &Config,
    ns: &str,
    svc_name: &str,
    ingresses: &[Arc<Ingress>],
) -> Vec<(String, u16)> {
    let mut out = Vec::new();
    let mut seen = AHashSet::new();
    for ing in ingresses {
        if ing.metadata.namespace.as_deref() != Some(ns) {
            continue;
        }
        let Some(spec) = &ing.spec else {
            continue;
        };
        let tls_hosts = spec
            .tls
            .iter()
            .flatten()
            .flat_map(|t| t.hosts.iter().flatten())
            .map(String::as_str)
            .collect::<AHashSet<_>>();
        for rule in spec.rules.iter().flatten() {
            let Some(http) = &rule.http else {
                continue;
            };
            let matched = http.paths.iter().any(|p| {
                p.path.as_deref().map_or(true, |path| path == "/")
                    && p.backend
                        .service
                        .as_ref()
                        .is_some_and(|s| s.name == svc_name)
            });
            if !matched {
                continue;
            }
            let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
                continue;
            };
            let port = if tls_hosts.contains(host) { 443 } else { 80 };
            let addr = if config.spec.sync_ingress_load_balancer_ips {
                ing.status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.as_ref())
                    .and_then(|entries| entries.first())
                    .and_then(|e| e.ip.clone())
                    .unwrap_or_else(|| host.to_string())
            } else {
                host.to_string()
            };
            if seen.insert((addr.clone(), port)) {
                out.push((addr, port));
            }
        }
    }
    out
}

/// Builds the registration set for one eligible service.
pub(crate) fn generate(
    config: &Config,
    svc: &Service,
    endpoints: Option<&Endpoints>,
    lookup_node: &dyn Fn(&str) -> Option<Arc<Node>>,
    ingresses: &[Arc<Ingress>],
) -> Vec<CatalogRegistration> {
    let cluster_ns = svc.metadata.namespace.clone().unwrap_or_default();
    let svc_name = svc.metadata.name.clone().unwrap_or_default();

    let mut registered = format!("{}{svc_name}", config.spec.add_service_prefix);
    if config.spec.add_k8s_namespace_as_service_suffix {
        registered = format!("{registered}-{cluster_ns}");
    }

    let mut tags = vec![labels::K8S_TAG.to_string()];
    if let Some(raw) = annotation(svc, labels::ANNOTATION_SERVICE_TAGS) {
        tags.extend(parse_tags(raw));
    }
    for tag in &config.spec.append_tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }

    let mut metadata = AHashMap::new();
    metadata.insert(
        labels::META_SOURCE_KEY.to_string(),
        labels::META_SOURCE_VALUE.to_string(),
    );
    metadata.insert(labels::META_SERVICE_KEY.to_string(), svc_name.clone());
    metadata.insert(labels::META_NAMESPACE_KEY.to_string(), cluster_ns.clone());
    metadata.insert(
        labels::META_CONNECTOR_UID_KEY.to_string(),
        config.connector_uid.clone(),
    );
    if !config.cluster_set.is_empty() {
        metadata.insert(
            labels::META_CLUSTER_SET_KEY.to_string(),
            config.cluster_set.clone(),
        );
    }
    for meta in &config.spec.append_metadatas {
        metadata.insert(meta.key.clone(), meta.value.clone());
    }
    if let Some(annotations) = &svc.metadata.annotations {
        for (key, value) in annotations {
            if let Some(stripped) = key.strip_prefix(labels::ANNOTATION_SERVICE_META_PREFIX) {
                metadata.insert(stripped.to_string(), value.clone());
            }
        }
    }

    let weights = annotation(svc, labels::ANNOTATION_SERVICE_WEIGHT)
        .and_then(|w| w.parse::<u32>().ok())
        .filter(|w| *w > 1)
        .map(|passing| AgentWeights {
            passing,
            warning: 1,
        });

    let node = if config.spec.node_name.is_empty() {
        DEFAULT_SYNC_NODE.to_string()
    } else {
        config.spec.node_name.clone()
    };

    let make = |address: String, http_port: u16, grpc_port: u16| {
        let id = instance_id(&registered, &address, http_port, grpc_port, &config.cluster_set);
        CatalogRegistration {
            node: node.clone(),
            address: address.clone(),
            service: AgentService {
                id: id.clone(),
                service: registered.clone(),
                address,
                http_port,
                grpc_port,
                tags: tags.clone(),
                metadata: metadata.clone(),
                weights,
            },
            check: Some(AgentCheck {
                check_id: format!("{cluster_ns}/{id}"),
                name: "Kubernetes Readiness Check".to_string(),
                service_id: id,
                status: "passing".to_string(),
                output: "ok".to_string(),
            }),
        }
    };

    let override_name = annotation(svc, labels::ANNOTATION_SERVICE_PORT);
    let (http_sp, grpc_sp) = select_ports(svc, override_name);
    let mut regs = Vec::new();

    // External IPs trump everything else.
    if let Some(external_ips) = svc
        .spec
        .as_ref()
        .and_then(|s| s.external_ips.as_ref())
        .filter(|ips| !ips.is_empty())
    {
        let http = http_sp.map(|p| as_u16(p.port)).unwrap_or(0);
        let grpc = grpc_sp.map(|p| as_u16(p.port)).unwrap_or(0);
        for ip in external_ips {
            if config.ip_filter.permits(ip) {
                regs.push(make(ip.clone(), http, grpc));
            }
        }
        return regs;
    }

    let svc_type = svc.spec.as_ref().and_then(|s| s.type_.as_deref());
    match svc_type {
        Some("NodePort") => {
            let http = http_sp.and_then(|p| p.node_port).map(as_u16).unwrap_or(0);
            let grpc = grpc_sp.and_then(|p| p.node_port).map(as_u16).unwrap_or(0);
            let mut seen = AHashSet::new();
            for subset in endpoints.and_then(|e| e.subsets.as_ref()).into_iter().flatten() {
                for addr in subset.addresses.iter().flatten() {
                    let Some(node_name) = addr.node_name.as_deref() else {
                        continue;
                    };
                    let Some(node) = lookup_node(node_name) else {
                        continue;
                    };
                    let Some(address) = node_address(&node, config.spec.node_port_sync_type)
                    else {
                        continue;
                    };
                    if config.ip_filter.permits(&address) && seen.insert(address.clone()) {
                        regs.push(make(address, http, grpc));
                    }
                }
            }
        }
        Some("LoadBalancer") if !config.spec.sync_load_balancer_endpoints => {
            let http = http_sp.map(|p| as_u16(p.port)).unwrap_or(0);
            let grpc = grpc_sp.map(|p| as_u16(p.port)).unwrap_or(0);
            let entries = svc
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref());
            for entry in entries.into_iter().flatten() {
                let Some(address) = entry.ip.clone().or_else(|| entry.hostname.clone()) else {
                    continue;
                };
                if config.ip_filter.permits(&address) {
                    regs.push(make(address, http, grpc));
                }
            }
        }
        _ => {
            // ClusterIP, or LoadBalancer advertising its backing endpoints.
            if config.spec.sync_ingress {
                let overrides = ingress_overrides(config, &cluster_ns, &svc_name, ingresses);
                if !overrides.is_empty() {
                    for (address, port) in overrides {
                        if config.ip_filter.permits(&address) {
                            regs.push(make(address, port, 0));
                        }
                    }
                    return regs;
                }
            }
            for subset in endpoints.and_then(|e| e.subsets.as_ref()).into_iter().flatten() {
                let http = http_sp.map(|p| subset_port(subset, p)).unwrap_or(0);
                let grpc = grpc_sp.map(|p| subset_port(subset, p)).unwrap_or(0);
                for addr in subset.addresses.iter().flatten() {
                    if config.ip_filter.permits(&addr.ip) {
                        regs.push(make(addr.ip.clone(), http, grpc));
                    }
                }
            }
        }
    }
    regs
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, LoadBalancerIngress, LoadBalancerStatus, NodeAddress,
        NodeStatus, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS,
    };
    use kube::api::ObjectMeta;
    use registry_bridge_core::RateLimiter;
    use registry_bridge_k8s_api::ConnectorSpec;
    use rstest::rstest;

    fn config(patch: serde_json::Value) -> Config {
        let mut spec = serde_json::json!({
            "httpAddr": "consul:8500",
            "deriveNamespace": "derive",
            "syncToK8S": {"enable": false, "clusterId": "set-1"},
            "syncFromK8S": {"enable": true},
        });
        if let (Some(obj), Some(from)) = (
            patch.as_object(),
            spec.get_mut("syncFromK8S").and_then(|v| v.as_object_mut()),
        ) {
            for (k, v) in obj {
                from.insert(k.clone(), v.clone());
            }
        }
        let spec: ConnectorSpec = serde_json::from_value(spec).unwrap();
        Config::new(&spec, "uid-1", RateLimiter::new(500, 750))
    }

    fn service(ns: &str, name: &str, type_: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    node_port: Some(30080),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn endpoints(addrs: &[(&str, Option<&str>)], port: i32) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta::default(),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    addrs
                        .iter()
                        .map(|(ip, node)| EndpointAddress {
                            ip: ip.to_string(),
                            node_name: node.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    fn no_nodes(_: &str) -> Option<Arc<Node>> {
        None
    }

    #[rstest]
    #[case::derive_ns_excluded("derive", "ClusterIP", serde_json::json!({}), None, false)]
    #[case::cluster_ip_allowed("shop", "ClusterIP", serde_json::json!({}), None, true)]
    #[case::cluster_ip_disabled(
        "shop",
        "ClusterIP",
        serde_json::json!({"syncClusterIPServices": false}),
        None,
        false
    )]
    #[case::node_port_always(
        "shop",
        "NodePort",
        serde_json::json!({"syncClusterIPServices": false}),
        None,
        true
    )]
    #[case::deny_beats_allow(
        "shop",
        "ClusterIP",
        serde_json::json!({"allowK8SNamespaces": ["*"], "denyK8SNamespaces": ["shop"]}),
        None,
        false
    )]
    #[case::allow_list_misses(
        "shop",
        "ClusterIP",
        serde_json::json!({"allowK8SNamespaces": ["other"]}),
        None,
        false
    )]
    #[case::annotation_opts_out("shop", "ClusterIP", serde_json::json!({}), Some("false"), false)]
    #[case::annotation_opts_in(
        "shop",
        "ClusterIP",
        serde_json::json!({"defaultSync": false}),
        Some("true"),
        true
    )]
    #[case::default_sync_off("shop", "ClusterIP", serde_json::json!({"defaultSync": false}), None, false)]
    #[case::external_name_never("shop", "ExternalName", serde_json::json!({}), None, false)]
    fn eligibility(
        #[case] ns: &str,
        #[case] type_: &str,
        #[case] patch: serde_json::Value,
        #[case] annotation: Option<&str>,
        #[case] expect: bool,
    ) {
        let config = config(patch);
        let mut svc = service(ns, "checkout", type_);
        if let Some(v) = annotation {
            svc.metadata.annotations = Some(
                [(
                    labels::ANNOTATION_SERVICE_SYNC_K8S_TO_CLOUD.to_string(),
                    v.to_string(),
                )]
                .into(),
            );
        }
        assert_eq!(eligible(&config, ns, &svc), expect);
    }

    #[test]
    fn tags_honor_escaped_commas() {
        assert_eq!(
            parse_tags(r"canary, team=pay\,ments ,"),
            vec!["canary".to_string(), "team=pay,ments".to_string()]
        );
    }

    #[test]
    fn cluster_ip_registers_each_ready_address() {
        let config = config(serde_json::json!({}));
        let svc = service("shop", "checkout", "ClusterIP");
        let eps = endpoints(&[("10.2.0.7", None), ("10.2.0.8", None)], 8080);
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[]);

        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].service.service, "checkout");
        assert_eq!(regs[0].service.http_port, 8080);
        assert_eq!(regs[0].service.id, "checkout-10.2.0.7-8080-set-1");
        assert_eq!(regs[0].service.tags, vec!["k8s".to_string()]);
        assert_eq!(
            regs[0].service.metadata[labels::META_NAMESPACE_KEY],
            "shop"
        );
        let check = regs[0].check.as_ref().unwrap();
        assert_eq!(check.check_id, "shop/checkout-10.2.0.7-8080-set-1");
        assert_eq!(check.status, "passing");

        // Same inputs, same ids.
        let again = generate(&config, &svc, Some(&eps), &no_nodes, &[]);
        assert_eq!(regs[0].service.id, again[0].service.id);
        assert_eq!(regs[1].service.id, again[1].service.id);
    }

    #[test]
    fn naming_applies_prefix_and_namespace_suffix() {
        let config = config(serde_json::json!({
            "addServicePrefix": "k8s-",
            "addK8SNamespaceAsServiceSuffix": true,
        }));
        let svc = service("shop", "checkout", "ClusterIP");
        let eps = endpoints(&[("10.2.0.7", None)], 8080);
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[]);
        assert_eq!(regs[0].service.service, "k8s-checkout-shop");
    }

    #[test]
    fn weight_annotation_sets_passing_weight() {
        let config = config(serde_json::json!({}));
        let mut svc = service("shop", "checkout", "ClusterIP");
        svc.metadata.annotations = Some(
            [(labels::ANNOTATION_SERVICE_WEIGHT.to_string(), "8".to_string())].into(),
        );
        let eps = endpoints(&[("10.2.0.7", None)], 8080);
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[]);
        assert_eq!(
            regs[0].service.weights,
            Some(AgentWeights {
                passing: 8,
                warning: 1
            })
        );
    }

    #[test]
    fn meta_annotations_become_metadata() {
        let config = config(serde_json::json!({}));
        let mut svc = service("shop", "checkout", "ClusterIP");
        svc.metadata.annotations = Some(
            [(
                format!("{}version", labels::ANNOTATION_SERVICE_META_PREFIX),
                "v2".to_string(),
            )]
            .into(),
        );
        let eps = endpoints(&[("10.2.0.7", None)], 8080);
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[]);
        assert_eq!(regs[0].service.metadata["version"], "v2");
    }

    #[test]
    fn external_ips_win_over_endpoints() {
        let config = config(serde_json::json!({}));
        let mut svc = service("shop", "checkout", "ClusterIP");
        svc.spec.as_mut().unwrap().external_ips =
            Some(vec!["192.0.2.10".to_string(), "192.0.2.11".to_string()]);
        let eps = endpoints(&[("10.2.0.7", None)], 8080);
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[]);
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].address, "192.0.2.10");
        assert_eq!(regs[0].service.http_port, 80);
    }

    fn node(external: Option<&str>, internal: Option<&str>) -> Node {
        let mut addresses = Vec::new();
        if let Some(ip) = external {
            addresses.push(NodeAddress {
                type_: "ExternalIP".to_string(),
                address: ip.to_string(),
            });
        }
        if let Some(ip) = internal {
            addresses.push(NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.to_string(),
            });
        }
        Node {
            status: Some(NodeStatus {
                addresses: Some(addresses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_port_external_first_falls_back_to_internal() {
        let config = config(serde_json::json!({"nodePortSyncType": "ExternalFirst"}));
        let svc = service("shop", "checkout", "NodePort");
        let eps = endpoints(&[("10.2.0.7", Some("node-a"))], 8080);
        let internal_only = node(None, Some("10.0.0.5"));
        let lookup = move |_: &str| Some(Arc::new(internal_only.clone()));
        let regs = generate(&config, &svc, Some(&eps), &lookup, &[]);
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].address, "10.0.0.5");
        assert_eq!(regs[0].service.http_port, 30080);
    }

    #[test]
    fn node_port_external_only_skips_internal_nodes() {
        let config = config(serde_json::json!({"nodePortSyncType": "ExternalOnly"}));
        let svc = service("shop", "checkout", "NodePort");
        let eps = endpoints(&[("10.2.0.7", Some("node-a"))], 8080);
        let internal_only = node(None, Some("10.0.0.5"));
        let lookup = move |_: &str| Some(Arc::new(internal_only.clone()));
        let regs = generate(&config, &svc, Some(&eps), &lookup, &[]);
        assert!(regs.is_empty());
    }

    fn ingress(ns: &str, svc_name: &str, host: &str, tls: bool) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some("edge".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                tls: tls.then(|| {
                    vec![IngressTLS {
                        hosts: Some(vec![host.to_string()]),
                        ..Default::default()
                    }]
                }),
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: svc_name.to_string(),
                                    port: None,
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn ingress_host_overrides_endpoint_addresses() {
        let config = config(serde_json::json!({"syncIngress": true}));
        let svc = service("shop", "checkout", "ClusterIP");
        let eps = endpoints(&[("10.2.0.7", None)], 8080);
        let ing = Arc::new(ingress("shop", "checkout", "checkout.example.com", false));
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[ing]);
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].address, "checkout.example.com");
        assert_eq!(regs[0].service.http_port, 80);
    }

    #[test]
    fn tls_covered_host_registers_port_443() {
        let config = config(serde_json::json!({"syncIngress": true}));
        let svc = service("shop", "checkout", "ClusterIP");
        let eps = endpoints(&[("10.2.0.7", None)], 8080);
        let ing = Arc::new(ingress("shop", "checkout", "checkout.example.com", true));
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[ing]);
        assert_eq!(regs[0].service.http_port, 443);
    }

    #[test]
    fn load_balancer_uses_status_ingress() {
        let config = config(serde_json::json!({}));
        let mut svc = service("shop", "checkout", "LoadBalancer");
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.9".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        let regs = generate(&config, &svc, None, &no_nodes, &[]);
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].address, "203.0.113.9");
        assert_eq!(regs[0].service.http_port, 80);
    }

    #[test]
    fn excluded_ip_ranges_drop_endpoint_addresses() {
        let config = config(serde_json::json!({"excludeIpRanges": ["10.2.0.0/16"]}));
        let svc = service("shop", "checkout", "ClusterIP");
        let eps = endpoints(&[("10.2.0.7", None), ("172.16.0.9", None)], 8080);
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[]);
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].address, "172.16.0.9");
    }

    #[test]
    fn filter_ip_ranges_keep_only_matching_addresses() {
        let config = config(serde_json::json!({"filterIpRanges": ["172.16.0.0/12"]}));
        let svc = service("shop", "checkout", "ClusterIP");
        let eps = endpoints(&[("10.2.0.7", None), ("172.16.0.9", None)], 8080);
        let regs = generate(&config, &svc, Some(&eps), &no_nodes, &[]);
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].address, "172.16.0.9");
    }

    #[test]
    fn excluded_node_addresses_produce_no_node_port_registration() {
        let config = config(serde_json::json!({
            "nodePortSyncType": "ExternalFirst",
            "excludeIpRanges": ["10.0.0.0/8"],
        }));
        let svc = service("shop", "checkout", "NodePort");
        let eps = endpoints(&[("10.2.0.7", Some("node-a"))], 8080);
        let internal_only = node(None, Some("10.0.0.5"));
        let lookup = move |_: &str| Some(Arc::new(internal_only.clone()));
        let regs = generate(&config, &svc, Some(&eps), &lookup, &[]);
        assert!(regs.is_empty());
    }

    #[test]
    fn excluded_load_balancer_addresses_are_not_registered() {
        let config = config(serde_json::json!({"excludeIpRanges": ["203.0.113.0/24"]}));
        let mut svc = service("shop", "checkout", "LoadBalancer");
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.9".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        let regs = generate(&config, &svc, None, &no_nodes, &[]);
        assert!(regs.is_empty());
    }
}
