//! The encoded endpoint blob: the string contract between the C2K syncer
//! (which writes it into a service annotation) and the endpoints
//! materializer (which decodes it to build subsets).
//!
//! The encoding is JSON, base64 (standard alphabet), hashed with FNV-1/64.
//! Field names and map-key ordering are part of the contract: existing
//! deployments carry blobs written by prior versions, so both sides of the
//! codec live here and nowhere else. Decodes are memoized in a small LRU
//! keyed by `(namespace, name, hash)` since the same annotation is decoded
//! on every endpoints event.

use crate::hash::fnv64;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Gateway forwarding mode advertised by a cloud instance.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithGatewayMode {
    #[default]
    Forward,
    Proxy,
}

/// Per-service descriptor materialized into the cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MicroSvcMeta {
    /// Backend port → protocol.
    #[serde(rename = "TargetPorts", default)]
    pub target_ports: BTreeMap<u16, String>,

    /// Optional target-port → service-port remapping, present when a fixed
    /// service port is configured.
    #[serde(rename = "Ports", default, skip_serializing_if = "Option::is_none")]
    pub service_ports: Option<BTreeMap<u16, u16>>,

    /// Endpoint address → endpoint descriptor.
    #[serde(rename = "Endpoints", default)]
    pub endpoints: BTreeMap<String, MicroEndpointMeta>,

    #[serde(rename = "GRPCMeta", default, skip_serializing_if = "Option::is_none")]
    pub grpc_meta: Option<GrpcMeta>,

    #[serde(rename = "HealthCheck", default)]
    pub health_check: bool,
}

/// gRPC routing descriptor captured during aggregation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcMeta {
    #[serde(rename = "Interface", default)]
    pub interface: String,
    /// Method name → endpoint addresses serving it.
    #[serde(rename = "Methods", default)]
    pub methods: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MicroEndpointMeta {
    #[serde(rename = "Ports", default)]
    pub ports: BTreeMap<u16, String>,

    #[serde(rename = "Address", default)]
    pub address: String,

    /// Instance metadata carried through for gRPC endpoints.
    #[serde(rename = "GRPCMeta", default, skip_serializing_if = "Option::is_none")]
    pub grpc_meta: Option<BTreeMap<String, String>>,

    #[serde(rename = "Native", default)]
    pub native: NativeMeta,

    #[serde(rename = "Local", default)]
    pub local: LocalMeta,
}

/// What the instance said about itself, cloud side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeMeta {
    #[serde(rename = "ClusterSet", default)]
    pub cluster_set: String,
    #[serde(rename = "ClusterId", default)]
    pub cluster_id: String,
    #[serde(rename = "ViaGatewayHttp", default, skip_serializing_if = "String::is_empty")]
    pub via_gateway_http: String,
    #[serde(rename = "ViaGatewayGrpc", default, skip_serializing_if = "String::is_empty")]
    pub via_gateway_grpc: String,
    #[serde(rename = "ViaGatewayMode", default)]
    pub via_gateway_mode: WithGatewayMode,
}

/// How this connector will reach the instance, cluster side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalMeta {
    #[serde(rename = "InternalService", default)]
    pub internal_service: bool,
    #[serde(rename = "WithGateway", default)]
    pub with_gateway: bool,
    #[serde(rename = "WithMultiGateways", default)]
    pub with_multi_gateways: bool,
    #[serde(rename = "BindFgwPorts", default)]
    pub bind_fgw_ports: BTreeMap<u16, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 in endpoint annotation: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid endpoint blob: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a meta blob, returning the annotation value and its hash.
pub fn encode(meta: &MicroSvcMeta) -> Result<(String, u64), serde_json::Error> {
    let bytes = serde_json::to_vec(meta)?;
    let hash = fnv64(&bytes);
    Ok((BASE64.encode(&bytes), hash))
}

/// Decodes a blob without touching the cache. Used by tests and by callers
/// that do not know the owning service.
pub fn decode(enc: &str) -> Result<MicroSvcMeta, DecodeError> {
    let bytes = BASE64.decode(enc)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// A decode cache keyed by `<namespace>.<name>.<hash>`. The hash comes from
/// the sibling annotation, so a changed blob always misses.
#[derive(Clone, Debug)]
pub struct DecodeCache {
    lru: Arc<Mutex<Lru>>,
}

impl Default for DecodeCache {
    fn default() -> Self {
        Self::new(512)
    }
}

impl DecodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lru: Arc::new(Mutex::new(Lru::new(capacity))),
        }
    }

    /// Decodes through the cache.
    pub fn decode(
        &self,
        namespace: &str,
        name: &str,
        hash: &str,
        enc: &str,
    ) -> Result<Arc<MicroSvcMeta>, DecodeError> {
        let key = format!("{namespace}.{name}.{hash}");
        if let Some(meta) = self.lru.lock().get(&key) {
            return Ok(meta);
        }
        let meta = Arc::new(decode(enc)?);
        self.lru.lock().put(key, meta.clone());
        Ok(meta)
    }
}

/// Minimal LRU: a map plus an access-ordered queue. Capacity is small and
/// lookups are hot, so the O(n) reorder on hit is fine.
#[derive(Debug)]
struct Lru {
    capacity: usize,
    map: ahash::AHashMap<String, Arc<MicroSvcMeta>>,
    order: VecDeque<String>,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: ahash::AHashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<MicroSvcMeta>> {
        let meta = self.map.get(key)?.clone();
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
        Some(meta)
    }

    fn put(&mut self, key: String, meta: Arc<MicroSvcMeta>) {
        if self.map.insert(key.clone(), meta).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }
}
