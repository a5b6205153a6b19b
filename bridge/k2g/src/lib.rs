//! The cluster-to-gateway direction: projects eligible cluster services
//! onto gateway routes, one per service port, parented on the connector's
//! gateway listeners.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod route;
mod sync;

pub use self::route::{RouteObject, CLUSTER_WEIGHT_ACCEPT_ALL, GRPC_ROUTE_INTERFACE};
pub use self::sync::{GatewayNudger, RouteSource};

use ahash::AHashSet;
use parking_lot::RwLock;
use registry_bridge_core::RateLimiter;
use registry_bridge_k8s_api::{GatewayListenerSelector, GatewaySyncSpec, SyncToFgwSpec};
use std::time::Duration;

/// Immutable settings for the cluster-to-gateway direction.
#[derive(Clone, Debug)]
pub struct Config {
    pub gateway_name: String,
    pub connector_uid: String,
    pub sync_period: Duration,
    pub ingress: GatewayListenerSelector,
    pub egress: GatewayListenerSelector,
    pub spec: SyncToFgwSpec,
    pub limiter: RateLimiter,
}

// === impl Config ===

impl Config {
    pub fn new(connector: &GatewaySyncSpec, connector_uid: &str, limiter: RateLimiter) -> Self {
        Self {
            gateway_name: connector.gateway_name.clone(),
            connector_uid: connector_uid.to_string(),
            sync_period: Duration::from(connector.sync_to_fgw.sync_period),
            ingress: connector.ingress.clone(),
            egress: connector.egress.clone(),
            spec: connector.sync_to_fgw.clone(),
            limiter,
        }
    }
}

/// Cluster service keys that currently have routes written for them.
#[derive(Debug, Default)]
pub struct Context {
    pub synced: RwLock<AHashSet<String>>,
}

// === impl Context ===

impl Context {
    /// Number of services projected onto the gateway, for status reporting.
    pub fn synced_count(&self) -> usize {
        self.synced.read().len()
    }

    pub fn purge(&self) {
        self.synced.write().clear();
    }
}
