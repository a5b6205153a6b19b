//! Connector custom resources: one cluster-scoped CRD per provider, all
//! sharing the same spec schema, plus a tagged [`Connector`] sum used by
//! the controller once the kind is known.
//!
//! Only the semantic subset the engines read is modeled here; deployment
//! fields (replicas, resources, image pull secrets) belong to the operator
//! that schedules connector pods, not to the bridge itself.

use crate::duration::K8sDuration;
use kube::{CustomResource, ResourceExt};
use registry_bridge_core::{Metadata, ProviderId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How a NodePort service's registration address is chosen.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum NodePortSyncType {
    /// Use a node's ExternalIP; skip the endpoint when none exists.
    #[default]
    ExternalOnly,
    /// Use a node's InternalIP.
    InternalOnly,
    /// Prefer ExternalIP, falling back to InternalIP.
    ExternalFirst,
}

/// Gateway settings for the cloud-to-cluster direction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct C2KGateway {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub multi_gateways: bool,
}

/// Gateway settings for the cluster-to-cloud direction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K2CGateway {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub gateway_mode: GatewayMode,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    #[default]
    Forward,
    Proxy,
}

/// Shared rate-limiter settings for cluster-API calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Limiter {
    pub limit: u32,
    pub burst: u32,
}

impl Default for Limiter {
    fn default() -> Self {
        Self {
            limit: 500,
            burst: 750,
        }
    }
}

/// Maps one catalog service onto a differently named cluster service,
/// optionally materialized as an ExternalName service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConversion {
    #[serde(default)]
    pub namespace: String,
    pub service: String,
    pub convert_name: String,
    #[serde(default)]
    pub external_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversionStrategy {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub service_conversions: Vec<ServiceConversion>,
}

/// Turns instance tags or metadata into labels/annotations on materialized
/// services.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappingStrategy {
    #[serde(default)]
    pub enable: bool,
    /// tag/metadata key → label key.
    #[serde(default)]
    pub label_conversions: BTreeMap<String, String>,
    /// tag/metadata key → annotation key.
    #[serde(default)]
    pub annotation_conversions: BTreeMap<String, String>,
}

/// Cloud→cluster settings.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncToK8sSpec {
    pub enable: bool,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default = "default_true")]
    pub passing_only: bool,
    #[serde(default)]
    pub filter_ip_ranges: Vec<String>,
    #[serde(default)]
    pub exclude_ip_ranges: Vec<String>,
    #[serde(default)]
    pub filter_tag: String,
    #[serde(default)]
    pub prefix_tag: String,
    #[serde(default)]
    pub suffix_tag: String,
    #[serde(default)]
    pub filter_metadatas: Vec<Metadata>,
    #[serde(default)]
    pub exclude_metadatas: Vec<Metadata>,
    #[serde(default)]
    pub prefix_metadata: String,
    #[serde(default)]
    pub suffix_metadata: String,
    #[serde(default)]
    pub fixed_http_service_port: Option<u16>,
    #[serde(default)]
    pub fixed_grpc_service_port: Option<u16>,
    #[serde(default)]
    pub append_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub append_annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub tag_strategy: MappingStrategy,
    #[serde(default)]
    pub metadata_strategy: MappingStrategy,
    #[serde(default)]
    pub conversion_strategy: ConversionStrategy,
    #[serde(default)]
    pub with_gateway: C2KGateway,
}

/// Cluster→cloud settings.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncFromK8sSpec {
    pub enable: bool,
    #[serde(default = "default_true")]
    pub default_sync: bool,
    #[serde(default = "default_true")]
    pub sync_cluster_ip_services: bool,
    #[serde(default)]
    pub sync_load_balancer_endpoints: bool,
    #[serde(default)]
    pub node_port_sync_type: NodePortSyncType,
    #[serde(default)]
    pub sync_ingress: bool,
    #[serde(default)]
    pub sync_ingress_load_balancer_ips: bool,
    #[serde(default)]
    pub add_service_prefix: String,
    #[serde(default, rename = "addK8SNamespaceAsServiceSuffix")]
    pub add_k8s_namespace_as_service_suffix: bool,
    #[serde(default)]
    pub append_tags: Vec<String>,
    #[serde(default)]
    pub append_metadatas: Vec<Metadata>,
    #[serde(default = "default_allow_all")]
    pub allow_k8s_namespaces: Vec<String>,
    #[serde(default)]
    pub deny_k8s_namespaces: Vec<String>,
    #[serde(default)]
    pub filter_ip_ranges: Vec<String>,
    #[serde(default)]
    pub exclude_ip_ranges: Vec<String>,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub enable_namespaces: bool,
    #[serde(default = "default_namespace")]
    pub destination_namespace: String,
    #[serde(default)]
    pub with_gateway: K2CGateway,
}

impl Default for SyncFromK8sSpec {
    fn default() -> Self {
        Self {
            enable: false,
            default_sync: true,
            sync_cluster_ip_services: true,
            sync_load_balancer_endpoints: false,
            node_port_sync_type: NodePortSyncType::default(),
            sync_ingress: false,
            sync_ingress_load_balancer_ips: false,
            add_service_prefix: String::new(),
            add_k8s_namespace_as_service_suffix: false,
            append_tags: Vec::new(),
            append_metadatas: Vec::new(),
            allow_k8s_namespaces: default_allow_all(),
            deny_k8s_namespaces: Vec::new(),
            filter_ip_ranges: Vec::new(),
            exclude_ip_ranges: Vec::new(),
            node_name: String::new(),
            enable_namespaces: false,
            destination_namespace: default_namespace(),
            with_gateway: K2CGateway::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_allow_all() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_sync_period() -> K8sDuration {
    Duration::from_secs(5).into()
}

/// The provider-independent connector spec: an immutable snapshot taken by
/// the controller at each reconcile.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSpec {
    pub http_addr: String,
    pub derive_namespace: String,
    #[serde(default)]
    pub purge: bool,
    #[serde(default)]
    pub as_internal_services: bool,
    #[serde(default = "default_sync_period")]
    pub sync_period: K8sDuration,
    #[serde(rename = "syncToK8S")]
    pub sync_to_k8s: SyncToK8sSpec,
    #[serde(rename = "syncFromK8S")]
    pub sync_from_k8s: SyncFromK8sSpec,
    #[serde(default)]
    pub limiter: Option<Limiter>,
    #[serde(default)]
    pub leader_election: Option<bool>,
}

impl ConnectorSpec {
    pub fn sync_period(&self) -> Duration {
        let d = Duration::from(self.sync_period);
        if d.is_zero() {
            Duration::from_secs(5)
        } else {
            d
        }
    }

    pub fn leader_election(&self) -> bool {
        self.leader_election.unwrap_or(true)
    }

    pub fn limiter(&self) -> Limiter {
        self.limiter.unwrap_or_default()
    }
}

/// Status written by the connector controller's status timer.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStatus {
    #[serde(default)]
    pub current_status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, rename = "toK8SServiceCnt")]
    pub to_k8s_service_cnt: usize,
    #[serde(default, rename = "fromK8SServiceCnt")]
    pub from_k8s_service_cnt: usize,
    #[serde(default)]
    pub catalog_services_hash: String,
}

macro_rules! connector_crd {
    ($spec:ident, $kind:literal, $shortname:literal) => {
        #[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
        #[kube(
            group = "connector.flomesh.io",
            version = "v1alpha1",
            kind = $kind,
            status = "ConnectorStatus",
            shortname = $shortname
        )]
        #[serde(rename_all = "camelCase")]
        pub struct $spec {
            #[serde(flatten)]
            pub connector: ConnectorSpec,
        }
    };
}

connector_crd!(ConsulSpec, "ConsulConnector", "consulconnector");
connector_crd!(EurekaSpec, "EurekaConnector", "eurekaconnector");
connector_crd!(NacosSpec, "NacosConnector", "nacosconnector");
connector_crd!(ZookeeperSpec, "ZookeeperConnector", "zookeeperconnector");
connector_crd!(MachineSpec, "MachineConnector", "machineconnector");

/// Listener selection for one side of the gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayListenerSelector {
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub grpc_port: u16,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncToFgwSpec {
    pub enable: bool,
    #[serde(default)]
    pub purge: bool,
    #[serde(default = "default_sync_period")]
    pub sync_period: K8sDuration,
    #[serde(default = "default_true")]
    pub default_sync: bool,
    #[serde(default = "default_allow_all")]
    pub allow_k8s_namespaces: Vec<String>,
    #[serde(default)]
    pub deny_k8s_namespaces: Vec<String>,
}

// Matches the serde defaults; in particular the sync period must not
// default to zero.
impl Default for SyncToFgwSpec {
    fn default() -> Self {
        Self {
            enable: false,
            purge: false,
            sync_period: default_sync_period(),
            default_sync: default_true(),
            allow_k8s_namespaces: default_allow_all(),
            deny_k8s_namespaces: Vec::new(),
        }
    }
}

/// The gateway connector projects cluster services onto gateway routes
/// instead of bridging to a registry.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "connector.flomesh.io",
    version = "v1alpha1",
    kind = "GatewayConnector",
    status = "ConnectorStatus",
    shortname = "gatewayconnector"
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySyncSpec {
    pub gateway_name: String,
    #[serde(default)]
    pub ingress: GatewayListenerSelector,
    #[serde(default)]
    pub egress: GatewayListenerSelector,
    pub sync_to_fgw: SyncToFgwSpec,
    #[serde(default)]
    pub leader_election: Option<bool>,
}

/// A fetched connector resource of any kind.
#[derive(Clone, Debug)]
pub enum Connector {
    Consul(ConsulConnector),
    Eureka(EurekaConnector),
    Nacos(NacosConnector),
    Zookeeper(ZookeeperConnector),
    Machine(MachineConnector),
    Gateway(GatewayConnector),
}

impl Connector {
    pub fn provider(&self) -> ProviderId {
        match self {
            Self::Consul(_) => ProviderId::Consul,
            Self::Eureka(_) => ProviderId::Eureka,
            Self::Nacos(_) => ProviderId::Nacos,
            Self::Zookeeper(_) => ProviderId::Zookeeper,
            Self::Machine(_) => ProviderId::Machine,
            Self::Gateway(_) => ProviderId::Gateway,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Consul(c) => c.name_any(),
            Self::Eureka(c) => c.name_any(),
            Self::Nacos(c) => c.name_any(),
            Self::Zookeeper(c) => c.name_any(),
            Self::Machine(c) => c.name_any(),
            Self::Gateway(c) => c.name_any(),
        }
    }

    pub fn uid(&self) -> String {
        match self {
            Self::Consul(c) => c.uid(),
            Self::Eureka(c) => c.uid(),
            Self::Nacos(c) => c.uid(),
            Self::Zookeeper(c) => c.uid(),
            Self::Machine(c) => c.uid(),
            Self::Gateway(c) => c.uid(),
        }
        .unwrap_or_default()
    }

    /// The registry-bridging spec; absent for the gateway connector.
    pub fn spec(&self) -> Option<&ConnectorSpec> {
        match self {
            Self::Consul(c) => Some(&c.spec.connector),
            Self::Eureka(c) => Some(&c.spec.connector),
            Self::Nacos(c) => Some(&c.spec.connector),
            Self::Zookeeper(c) => Some(&c.spec.connector),
            Self::Machine(c) => Some(&c.spec.connector),
            Self::Gateway(_) => None,
        }
    }

    pub fn gateway_spec(&self) -> Option<&GatewaySyncSpec> {
        match self {
            Self::Gateway(c) => Some(&c.spec),
            _ => None,
        }
    }

    pub fn leader_election(&self) -> bool {
        match self {
            Self::Gateway(c) => c.spec.leader_election.unwrap_or(true),
            _ => self.spec().map(|s| s.leader_election()).unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_apply() {
        let spec: ConnectorSpec = serde_json::from_value(serde_json::json!({
            "httpAddr": "consul.example.com:8500",
            "deriveNamespace": "derive",
            "syncToK8S": {"enable": true},
            "syncFromK8S": {"enable": false},
        }))
        .unwrap();
        assert_eq!(spec.sync_period(), Duration::from_secs(5));
        assert!(spec.leader_election());
        assert_eq!(spec.limiter().limit, 500);
        assert_eq!(spec.limiter().burst, 750);
        assert!(spec.sync_to_k8s.passing_only);
        assert_eq!(spec.sync_from_k8s.allow_k8s_namespaces, vec!["*"]);
    }

    #[test]
    fn crd_spec_flattens() {
        let consul: ConsulSpec = serde_json::from_value(serde_json::json!({
            "httpAddr": "consul:8500",
            "deriveNamespace": "derive",
            "syncPeriod": "10s",
            "syncToK8S": {"enable": true, "filterTag": "k8s"},
            "syncFromK8S": {"enable": true},
        }))
        .unwrap();
        assert_eq!(consul.connector.sync_period(), Duration::from_secs(10));
        assert_eq!(consul.connector.sync_to_k8s.filter_tag, "k8s");
    }
}
