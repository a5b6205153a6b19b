//! Folds cloud instances into per-service descriptors: filters first, then
//! name fan-out, then per-endpoint port/protocol assignment.

use crate::{Config, Context};
use ahash::AHashMap;
use registry_bridge_core::blob::{GrpcMeta, MicroEndpointMeta, MicroSvcMeta, WithGatewayMode};
use registry_bridge_core::{
    CloudInstance, DiscoveryClient, DiscoveryError, QueryOptions, PROTOCOL_GRPC, PROTOCOL_HTTP,
};
use registry_bridge_k8s_api::labels;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The outcome of aggregating one cloud service: descriptors keyed by
/// cluster service name (the base name plus any fan-out extensions), and
/// the labels/annotations accumulated from tag and metadata conversions.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub services: AHashMap<String, MicroSvcMeta>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

pub struct Aggregator {
    disc: Arc<dyn DiscoveryClient>,
    config: Arc<Config>,
    ctx: Arc<Context>,
}

// === impl Aggregator ===

impl Aggregator {
    pub fn new(disc: Arc<dyn DiscoveryClient>, config: Arc<Config>, ctx: Arc<Context>) -> Self {
        Self { disc, config, ctx }
    }

    pub async fn aggregate(&self, kube_svc_name: &str) -> Result<Aggregation, DiscoveryError> {
        let mut agg = Aggregation {
            services: AHashMap::new(),
            labels: self.config.spec.append_labels.clone(),
            annotations: self.config.spec.append_annotations.clone(),
        };

        let Some(cloud_name) = self.ctx.native_services.read().get(kube_svc_name).cloned()
        else {
            return Ok(agg);
        };

        let opts = QueryOptions::blocking(Duration::from_secs(5));
        let instances = self.disc.catalog_instances(&cloud_name, &opts).await?;
        for mut instance in instances {
            instance.service_name = instance.service_name.to_lowercase();
            if !self.permits(&instance) {
                continue;
            }
            let mut names = vec![kube_svc_name.to_string()];
            self.fan_out_tags(kube_svc_name, &instance, &mut names, &mut agg);
            self.fan_out_metadata(kube_svc_name, &instance, &mut names, &mut agg);
            for name in &names {
                self.fold(&mut agg.services, name, &instance);
            }
        }
        Ok(agg)
    }

    /// Filter order: cluster set, then metadata rules, then IP ranges. Any
    /// rejection drops the instance from every emitted service.
    fn permits(&self, instance: &CloudInstance) -> bool {
        let cluster_set = instance.meta(labels::CLOUD_CLUSTER_SET_KEY).unwrap_or("");
        if !cluster_set.is_empty()
            && !self.config.cluster_set.is_empty()
            && cluster_set != self.config.cluster_set
        {
            return false;
        }
        if !self.config.metadata_filter.permits(&instance.metadata) {
            return false;
        }
        self.config.ip_filter.permits(&instance.address)
    }

    fn fan_out_tags(
        &self,
        base: &str,
        instance: &CloudInstance,
        names: &mut Vec<String>,
        agg: &mut Aggregation,
    ) {
        let spec = &self.config.spec;
        let mut prefix = String::new();
        let mut suffix = String::new();
        for tag in &instance.tags {
            let Some((key, value)) = tag.split_once('=') else {
                continue;
            };
            if !spec.prefix_tag.is_empty() && key == spec.prefix_tag {
                prefix = value.to_string();
            }
            if !spec.suffix_tag.is_empty() && key == spec.suffix_tag {
                suffix = value.to_string();
            }
            if spec.tag_strategy.enable {
                if let Some(label) = spec.tag_strategy.label_conversions.get(key) {
                    agg.labels.insert(label.clone(), value.to_string());
                }
                if let Some(annotation) = spec.tag_strategy.annotation_conversions.get(key) {
                    agg.annotations.insert(annotation.clone(), value.to_string());
                }
            }
        }
        if let Some(extended) = extend_name(base, &prefix, &suffix) {
            names.push(extended);
        }
    }

    fn fan_out_metadata(
        &self,
        base: &str,
        instance: &CloudInstance,
        names: &mut Vec<String>,
        agg: &mut Aggregation,
    ) {
        let spec = &self.config.spec;
        let mut prefix = String::new();
        let mut suffix = String::new();
        for (key, value) in &instance.metadata {
            if !spec.prefix_metadata.is_empty() && key.eq_ignore_ascii_case(&spec.prefix_metadata)
            {
                prefix = value.clone();
            }
            if !spec.suffix_metadata.is_empty() && key.eq_ignore_ascii_case(&spec.suffix_metadata)
            {
                suffix = value.clone();
            }
            if spec.metadata_strategy.enable {
                if let Some(label) = spec.metadata_strategy.label_conversions.get(key) {
                    agg.labels.insert(label.clone(), value.clone());
                }
                if let Some(annotation) = spec.metadata_strategy.annotation_conversions.get(key) {
                    agg.annotations.insert(annotation.clone(), value.clone());
                }
            }
        }
        if let Some(extended) = extend_name(base, &prefix, &suffix) {
            names.push(extended);
        }
    }

    fn fold(
        &self,
        services: &mut AHashMap<String, MicroSvcMeta>,
        name: &str,
        instance: &CloudInstance,
    ) {
        let meta = services.entry(name.to_string()).or_default();

        if !instance.ports.is_empty() {
            let remap = meta.service_ports.get_or_insert_with(BTreeMap::new);
            for (target, port) in &instance.ports {
                remap.insert(*target, *port);
            }
        }
        meta.health_check = instance.health_check;

        let mut ep = MicroEndpointMeta {
            address: instance.address.clone(),
            ..Default::default()
        };
        if instance.http_port > 0 {
            meta.target_ports
                .insert(instance.http_port, PROTOCOL_HTTP.to_string());
            ep.ports.insert(instance.http_port, PROTOCOL_HTTP.to_string());
        }
        if instance.grpc_port > 0 {
            meta.target_ports
                .insert(instance.grpc_port, PROTOCOL_GRPC.to_string());
            ep.ports.insert(instance.grpc_port, PROTOCOL_GRPC.to_string());
            self.fold_grpc(meta, &mut ep, instance);
        }

        ep.native.cluster_id = instance.cluster_id.clone();
        ep.native.via_gateway_mode = instance
            .meta(labels::CLOUD_VIA_GATEWAY_MODE_KEY)
            .map(|mode| {
                if mode.eq_ignore_ascii_case("proxy") {
                    WithGatewayMode::Proxy
                } else {
                    WithGatewayMode::Forward
                }
            })
            .unwrap_or_default();
        if let Some(http) = instance.meta(labels::CLOUD_HTTP_VIA_GATEWAY_KEY) {
            ep.native.via_gateway_http = http.to_string();
        }
        if let Some(grpc) = instance.meta(labels::CLOUD_GRPC_VIA_GATEWAY_KEY) {
            ep.native.via_gateway_grpc = grpc.to_string();
        }
        if let Some(set) = instance
            .meta(labels::CLOUD_CLUSTER_SET_KEY)
            .filter(|s| !s.is_empty())
        {
            ep.native.cluster_set = set.to_string();
            ep.native.cluster_id = set.to_string();
        }
        if ep.native.cluster_set.is_empty() {
            ep.native.cluster_set = ep.native.cluster_id.clone();
        }

        ep.local.internal_service = !ep.native.cluster_set.is_empty()
            && ep.native.cluster_set == self.config.cluster_set
            && self.disc.is_internal_services();
        ep.local.with_gateway = self.config.spec.with_gateway.enable;
        ep.local.with_multi_gateways = self.config.spec.with_gateway.multi_gateways;

        meta.endpoints.insert(instance.address.clone(), ep);
    }

    /// Populates the service-level gRPC descriptor (method to the endpoint
    /// addresses serving it) when the instance advertises its interface.
    fn fold_grpc(&self, meta: &mut MicroSvcMeta, ep: &mut MicroEndpointMeta, instance: &CloudInstance) {
        let (Some(interface), Some(methods)) = (
            instance.meta(labels::CLOUD_GRPC_INTERFACE_KEY),
            instance.meta(labels::CLOUD_GRPC_METHODS_KEY),
        ) else {
            return;
        };
        if interface.is_empty() || methods.is_empty() {
            return;
        }
        let grpc = meta.grpc_meta.get_or_insert_with(GrpcMeta::default);
        grpc.interface = interface.to_string();
        for method in methods.split(',').filter(|m| !m.is_empty()) {
            let addrs = grpc.methods.entry(method.to_string()).or_default();
            if !addrs.contains(&instance.address) {
                addrs.push(instance.address.clone());
            }
        }
        ep.grpc_meta = Some(
            instance
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
    }
}

fn extend_name(base: &str, prefix: &str, suffix: &str) -> Option<String> {
    if prefix.is_empty() && suffix.is_empty() {
        return None;
    }
    let mut name = base.to_string();
    if !prefix.is_empty() {
        name = format!("{prefix}-{name}");
    }
    if !suffix.is_empty() {
        name = format!("{name}-{suffix}");
    }
    Some(name)
}
