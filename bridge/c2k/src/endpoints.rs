//! Keeps the Endpoints of materialized services matching their blob: any
//! drift observed on the watch stream is rewritten from the decoded
//! descriptor, and gateway-fronted services get their EndpointSlice pointed
//! at the gateway address.

use crate::{Config, Context};
use anyhow::{Context as _, Result};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service,
};
use k8s_openapi::api::discovery::v1::{
    Endpoint, EndpointConditions, EndpointPort as SlicePort, EndpointSlice,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::ResourceExt;
use registry_bridge_core::blob::MicroSvcMeta;
use registry_bridge_core::{DecodeCache, DiscoveryClient};
use registry_bridge_k8s_api::labels;
use registry_bridge_k8s_watch::{retry_on_conflict, Handle};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct EndpointsHandler {
    client: kube::Client,
    disc: Arc<dyn DiscoveryClient>,
    config: Arc<Config>,
    ctx: Arc<Context>,
    cache: DecodeCache,
}

// === impl EndpointsHandler ===

impl EndpointsHandler {
    pub fn new(
        client: kube::Client,
        disc: Arc<dyn DiscoveryClient>,
        config: Arc<Config>,
        ctx: Arc<Context>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            disc,
            config,
            ctx,
            cache: DecodeCache::default(),
        })
    }

    async fn restore(&self, ns: &str, name: &str, svc: &Service, current: &Endpoints) -> Result<()> {
        let annotations = svc.metadata.annotations.clone().unwrap_or_default();
        let (Some(enc), Some(hash)) = (
            annotations.get(labels::ANNOTATION_MESH_ENDPOINT_ADDR),
            annotations.get(labels::ANNOTATION_MESH_ENDPOINT_HASH),
        ) else {
            // ExternalName conversions carry no blob.
            return Ok(());
        };
        let meta = self
            .cache
            .decode(ns, name, hash, enc)
            .context("decoding endpoint annotation")?;
        let internal_sync =
            self.config.spec.with_gateway.enable && self.disc.is_internal_services();
        let desired = build_endpoints(svc, &meta, internal_sync);

        if current.subsets != desired.subsets
            || current.metadata.labels != desired.metadata.labels
        {
            debug!(service = %name, "restoring endpoints from descriptor");
            let api: Api<Endpoints> = Api::namespaced(self.client.clone(), ns);
            self.config.limiter.acquire().await;
            retry_on_conflict(|| {
                let api = api.clone();
                let mut desired = desired.clone();
                let name = name.to_string();
                async move {
                    let current = api.get(&name).await?;
                    desired.metadata.resource_version = current.metadata.resource_version;
                    api.replace(&name, &PostParams::default(), &desired).await
                }
            })
            .await
            .context("replacing endpoints")?;
        }

        if let Some(gateway) = svc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(labels::ANNOTATION_CLOUD_VIA_GATEWAY))
        {
            self.point_slice_at_gateway(ns, name, gateway, desired.subsets.as_deref())
                .await?;
        }
        Ok(())
    }

    /// Rewrites the service's first EndpointSlice so traffic resolves to the
    /// gateway rather than the (unreachable) instance addresses. The slice
    /// is taken over from kube's mirroring controller.
    async fn point_slice_at_gateway(
        &self,
        ns: &str,
        name: &str,
        gateway: &str,
        subsets: Option<&[EndpointSubset]>,
    ) -> Result<()> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), ns);
        let selector = format!("{}={name}", labels::ENDPOINT_SLICE_SERVICE_NAME_LABEL);
        self.config.limiter.acquire().await;
        let slices = api
            .list(&ListParams::default().labels(&selector))
            .await
            .context("listing endpoint slices")?;
        let Some(slice) = slices.items.into_iter().next() else {
            return Ok(());
        };
        let mut slice = slice;
        if !rewrite_slice(&mut slice, gateway, subsets) {
            warn!(service = %name, %gateway, "unparsable gateway address; leaving slice alone");
            return Ok(());
        }
        let slice_name = slice.name_any();
        self.config.limiter.acquire().await;
        retry_on_conflict(|| {
            let api = api.clone();
            let mut slice = slice.clone();
            let slice_name = slice_name.clone();
            async move {
                let current = api.get(&slice_name).await?;
                slice.metadata.resource_version = current.metadata.resource_version;
                api.replace(&slice_name, &PostParams::default(), &slice).await
            }
        })
        .await
        .context("replacing endpoint slice")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handle<Endpoints> for EndpointsHandler {
    async fn upsert(&self, key: &str, obj: &Endpoints) -> Result<()> {
        let Some((ns, name)) = key.split_once('/') else {
            return Ok(());
        };
        if ns != self.config.derive_namespace {
            return Ok(());
        }
        // Only endpoints of services this connector materialized.
        let svc = self.ctx.synced_services.read().get(name).cloned();
        let Some(svc) = svc else {
            return Ok(());
        };
        self.restore(ns, name, &svc, obj).await
    }

    /// Deleted endpoints come back with the service on the next sync; there
    /// is nothing to clean up here.
    async fn delete(&self, _key: &str, _last: &Endpoints) -> Result<()> {
        Ok(())
    }
}

/// Builds the Endpoints of a materialized service: one subset carrying the
/// service's ports (at their backend values) and every instance address
/// from the descriptor.
pub(crate) fn build_endpoints(svc: &Service, meta: &MicroSvcMeta, internal_sync: bool) -> Endpoints {
    let name = svc.name_any();
    let mut ep_labels = BTreeMap::new();
    ep_labels.insert(
        labels::CLOUD_SOURCED_SERVICE_LABEL.to_string(),
        "true".to_string(),
    );
    ep_labels.insert(labels::CLOUD_SERVICE_LABEL.to_string(), name.clone());

    let mut annotations = BTreeMap::new();
    if let Some(cluster_id) = svc
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::ANNOTATION_CLOUD_SERVICE_INHERITED_CLUSTER_ID))
    {
        annotations.insert(
            labels::ANNOTATION_CLOUD_SERVICE_INHERITED_CLUSTER_ID.to_string(),
            cluster_id.clone(),
        );
    }
    if internal_sync {
        annotations.insert(
            labels::ANNOTATION_MESH_SERVICE_INTERNAL_SYNC.to_string(),
            "true".to_string(),
        );
    }

    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let target = match &p.target_port {
                        Some(IntOrString::Int(t)) => *t,
                        _ => p.port,
                    };
                    EndpointPort {
                        name: p.name.clone(),
                        port: target,
                        protocol: Some("TCP".to_string()),
                        app_protocol: p.app_protocol.clone(),
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let addresses = meta
        .endpoints
        .keys()
        .map(|addr| EndpointAddress {
            ip: addr.clone(),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Endpoints {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: svc.metadata.namespace.clone(),
            labels: Some(ep_labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        subsets: (!addresses.is_empty()).then(|| {
            vec![EndpointSubset {
                addresses: Some(addresses),
                ports: Some(ports),
                ..Default::default()
            }]
        }),
    }
}

/// Points a slice at `gateway` (`addr:port`): a single endpoint and port
/// replace whatever the mirroring controller wrote, and the managed-by
/// label is cleared so it stops fighting us. Returns false when the
/// gateway address does not parse.
fn rewrite_slice(
    slice: &mut EndpointSlice,
    gateway: &str,
    subsets: Option<&[EndpointSubset]>,
) -> bool {
    let Some((addr, port)) = gateway.rsplit_once(':') else {
        return false;
    };
    let Ok(port) = port.parse::<i32>() else {
        return false;
    };
    if let Some(slice_labels) = slice.metadata.labels.as_mut() {
        slice_labels.remove(labels::ENDPOINT_SLICE_MANAGED_BY_LABEL);
    }
    let port_name = subsets
        .and_then(|s| s.first())
        .and_then(|s| s.ports.as_ref())
        .and_then(|p| p.first())
        .and_then(|p| p.name.clone());
    slice.endpoints = vec![Endpoint {
        addresses: vec![addr.to_string()],
        conditions: Some(EndpointConditions {
            ready: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }];
    slice.ports = Some(vec![SlicePort {
        name: port_name,
        port: Some(port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::materialize;
    use crate::Aggregation;
    use registry_bridge_core::blob::MicroEndpointMeta;
    use registry_bridge_core::{ProviderId, RateLimiter, PROTOCOL_HTTP};
    use registry_bridge_k8s_api::ConnectorSpec;

    fn config() -> Config {
        let spec: ConnectorSpec = serde_json::from_value(serde_json::json!({
            "httpAddr": "consul:8500",
            "deriveNamespace": "derive",
            "syncToK8S": {"enable": true, "clusterId": "set-1"},
            "syncFromK8S": {"enable": false},
        }))
        .unwrap();
        Config::new(&spec, "uid-1", RateLimiter::new(500, 750))
    }

    fn meta() -> MicroSvcMeta {
        let mut meta = MicroSvcMeta::default();
        meta.target_ports.insert(8080, PROTOCOL_HTTP.to_string());
        for addr in ["10.1.1.5", "10.1.1.6"] {
            let mut ep = MicroEndpointMeta {
                address: addr.to_string(),
                ..Default::default()
            };
            ep.ports.insert(8080, PROTOCOL_HTTP.to_string());
            meta.endpoints.insert(addr.to_string(), ep);
        }
        meta
    }

    fn service(meta: &MicroSvcMeta) -> Service {
        materialize(
            &config(),
            ProviderId::Consul,
            "payments",
            "payments",
            &Aggregation::default(),
            meta,
        )
        .unwrap()
    }

    #[test]
    fn endpoints_mirror_the_descriptor() {
        let meta = meta();
        let eps = build_endpoints(&service(&meta), &meta, false);

        let ep_labels = eps.metadata.labels.as_ref().unwrap();
        assert_eq!(ep_labels[labels::CLOUD_SERVICE_LABEL], "payments");

        let subset = &eps.subsets.as_ref().unwrap()[0];
        let addrs: Vec<_> = subset
            .addresses
            .as_ref()
            .unwrap()
            .iter()
            .map(|a| a.ip.as_str())
            .collect();
        assert_eq!(addrs, vec!["10.1.1.5", "10.1.1.6"]);
        let port = &subset.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(port.name.as_deref(), Some("http8080"));
    }

    #[test]
    fn inherited_cluster_id_propagates() {
        let meta = meta();
        let eps = build_endpoints(&service(&meta), &meta, true);
        let annotations = eps.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations[labels::ANNOTATION_CLOUD_SERVICE_INHERITED_CLUSTER_ID],
            "set-1"
        );
        assert_eq!(annotations[labels::ANNOTATION_MESH_SERVICE_INTERNAL_SYNC], "true");
    }

    #[test]
    fn gateway_rewrite_replaces_slice_contents() {
        let meta = meta();
        let eps = build_endpoints(&service(&meta), &meta, false);
        let mut slice = EndpointSlice {
            metadata: ObjectMeta {
                name: Some("payments-abcde".to_string()),
                labels: Some(
                    [
                        (
                            labels::ENDPOINT_SLICE_MANAGED_BY_LABEL.to_string(),
                            "endpointslice-controller.k8s.io".to_string(),
                        ),
                        (
                            labels::ENDPOINT_SLICE_SERVICE_NAME_LABEL.to_string(),
                            "payments".to_string(),
                        ),
                    ]
                    .into(),
                ),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![],
            ports: None,
        };
        assert!(rewrite_slice(&mut slice, "10.0.0.100:10080", eps.subsets.as_deref()));
        assert!(!slice
            .metadata
            .labels
            .as_ref()
            .unwrap()
            .contains_key(labels::ENDPOINT_SLICE_MANAGED_BY_LABEL));
        assert_eq!(slice.endpoints[0].addresses, vec!["10.0.0.100".to_string()]);
        assert_eq!(
            slice.endpoints[0]
                .conditions
                .as_ref()
                .and_then(|c| c.ready),
            Some(true)
        );
        assert_eq!(slice.ports.as_ref().unwrap()[0].port, Some(10080));

        assert!(!rewrite_slice(&mut slice, "not-an-addr", None));
    }
}
