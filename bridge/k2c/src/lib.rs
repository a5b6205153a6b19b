//! The cluster-to-cloud direction: watches cluster services, endpoints, and
//! ingresses, derives catalog registrations, and reconciles them against
//! the registry on a fixed period.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod source;
mod sync;

pub use self::source::{EndpointsNudger, IngressNudger, ServiceSource};
pub use self::sync::Syncer;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use registry_bridge_core::{
    CatalogDeregistration, CatalogRegistration, IpRangeFilter, RateLimiter,
};
use registry_bridge_k8s_api::{ConnectorSpec, SyncFromK8sSpec};
use std::time::Duration;

/// Immutable settings for the cluster-to-cloud direction.
#[derive(Clone, Debug)]
pub struct Config {
    pub derive_namespace: String,
    pub connector_uid: String,
    pub cluster_set: String,
    pub sync_period: Duration,
    /// When set, every reconcile tears the registry-side state down.
    pub purge: bool,
    pub spec: SyncFromK8sSpec,
    /// CIDR constraints applied to every address before it is registered.
    pub ip_filter: IpRangeFilter,
    pub limiter: RateLimiter,
}

// === impl Config ===

impl Config {
    pub fn new(connector: &ConnectorSpec, connector_uid: &str, limiter: RateLimiter) -> Self {
        Self {
            derive_namespace: connector.derive_namespace.clone(),
            connector_uid: connector_uid.to_string(),
            cluster_set: connector.sync_to_k8s.cluster_id.clone(),
            sync_period: connector.sync_period(),
            purge: connector.purge,
            ip_filter: IpRangeFilter::from_strs(
                &connector.sync_from_k8s.filter_ip_ranges,
                &connector.sync_from_k8s.exclude_ip_ranges,
            ),
            spec: connector.sync_from_k8s.clone(),
            limiter,
        }
    }
}

/// A registration together with the registry-side namespace it targets.
#[derive(Clone, Debug)]
pub struct OwnedRegistration {
    pub registry_ns: String,
    pub registration: CatalogRegistration,
}

/// The engine's reflected state: what each cluster service produced, and
/// what is pending removal. The source writes, the syncer reads and drains.
#[derive(Debug, Default)]
pub struct Context {
    /// Cluster service key (`ns/name`) to the registrations derived from it.
    pub by_key: RwLock<AHashMap<String, Vec<OwnedRegistration>>>,
    /// Pending deregistrations, keyed by service instance id.
    pub deregs: RwLock<AHashMap<String, CatalogDeregistration>>,
}

// === impl Context ===

impl Context {
    /// Every cloud service name currently produced by the cluster.
    pub fn service_names(&self) -> AHashSet<String> {
        self.by_key
            .read()
            .values()
            .flatten()
            .map(|owned| owned.registration.service.service.clone())
            .collect()
    }

    /// Snapshot as `registry namespace → instance id → registration`.
    pub fn registrations(&self) -> AHashMap<String, AHashMap<String, CatalogRegistration>> {
        let mut out: AHashMap<String, AHashMap<String, CatalogRegistration>> = AHashMap::new();
        for owned in self.by_key.read().values().flatten() {
            out.entry(owned.registry_ns.clone()).or_default().insert(
                owned.registration.service.id.clone(),
                owned.registration.clone(),
            );
        }
        out
    }

    /// Number of distinct cloud services advertised, for status reporting.
    pub fn registered_count(&self) -> usize {
        self.service_names().len()
    }

    pub fn purge(&self) {
        self.by_key.write().clear();
    }
}
