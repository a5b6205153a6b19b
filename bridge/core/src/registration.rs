//! Catalog records exchanged with the external registry.
//!
//! These types form the conversion seam shared by every adapter: wire
//! formats differ per provider, but each adapter converts to and from this
//! set on ingress/egress.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

/// A service name qualified by the registry-side namespace (empty when the
/// provider does not support namespaces).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedService {
    pub namespace: String,
    pub service: String,
}

/// One network-reachable endpoint of a cloud service, as reported by a
/// `CatalogInstances` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub service_name: String,
    /// Unique within `service_name`.
    pub instance_id: String,
    pub cluster_id: String,
    pub address: String,
    pub http_port: u16,
    pub grpc_port: u16,
    /// Optional target-port to service-port remap advertised by the
    /// instance; empty when the instance exposes its ports directly.
    pub ports: HashMap<u16, u16>,
    pub health_check: bool,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl CloudInstance {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A registration previously written by this connector, as read back via
/// `RegisteredInstances`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogService {
    pub node: String,
    pub service_id: String,
    pub service_name: String,
    pub namespace: Option<String>,
}

/// The service block of a registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentService {
    /// Deterministic: a pure function of (name, address, port, cluster set).
    pub id: String,
    pub service: String,
    pub address: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub weights: Option<AgentWeights>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWeights {
    pub passing: u32,
    pub warning: u32,
}

/// A readiness check mirrored from the cluster side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCheck {
    /// `<namespace>/<serviceInstanceId>`.
    pub check_id: String,
    pub name: String,
    pub service_id: String,
    pub status: String,
    pub output: String,
}

/// The record inserted into the external registry to advertise one
/// cluster-sourced service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogRegistration {
    pub node: String,
    pub address: String,
    pub service: AgentService,
    pub check: Option<AgentCheck>,
}

/// Mirror of a registration, sufficient to remove it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogDeregistration {
    pub node: String,
    pub service_id: String,
    pub service_name: String,
    pub namespace: Option<String>,
}
