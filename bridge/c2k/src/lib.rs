//! The cloud-to-cluster direction: polls the registry catalog, aggregates
//! per-instance metadata into per-service descriptors, and materializes
//! them as cluster services plus endpoints.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod aggregate;
mod endpoints;
mod source;
mod sync;

pub use self::aggregate::{Aggregation, Aggregator};
pub use self::endpoints::EndpointsHandler;
pub use self::source::{sanitize_service_name, Conversion, Source};
pub use self::sync::Syncer;

use ahash::AHashMap;
use k8s_openapi::api::core::v1::Service;
use parking_lot::RwLock;
use registry_bridge_core::{
    IpRangeFilter, MetadataFilter, NamespacedService, RateLimiter,
};
use registry_bridge_k8s_api::{ConnectorSpec, SyncToK8sSpec};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

/// Immutable settings for one reconcile of the cloud-to-cluster direction.
#[derive(Clone, Debug)]
pub struct Config {
    pub derive_namespace: String,
    pub connector_uid: String,
    /// This controller's cluster set; instances advertising a different set
    /// are foreign and skipped.
    pub cluster_set: String,
    pub sync_period: Duration,
    pub spec: SyncToK8sSpec,
    pub ip_filter: IpRangeFilter,
    pub metadata_filter: MetadataFilter,
    /// Shared process-wide; gates every cluster-API call.
    pub limiter: RateLimiter,
}

// === impl Config ===

impl Config {
    pub fn new(connector: &ConnectorSpec, connector_uid: &str, limiter: RateLimiter) -> Self {
        let spec = connector.sync_to_k8s.clone();
        Self {
            derive_namespace: connector.derive_namespace.clone(),
            connector_uid: connector_uid.to_string(),
            cluster_set: spec.cluster_id.clone(),
            sync_period: connector.sync_period(),
            ip_filter: IpRangeFilter::from_strs(&spec.filter_ip_ranges, &spec.exclude_ip_ranges),
            metadata_filter: MetadataFilter::new(
                spec.filter_metadatas.clone(),
                spec.exclude_metadatas.clone(),
            ),
            limiter,
            spec,
        }
    }
}

/// The engine's reflected state. The source and syncer mutate disjoint
/// sub-maps; readers (status reporting) only take snapshots.
#[derive(Debug, Default)]
pub struct Context {
    /// Kube service name to cloud service name, including fan-out
    /// extensions discovered during aggregation.
    pub source_services: RwLock<AHashMap<String, String>>,
    /// Kube service name to cloud service name as set by the source loop.
    pub native_services: RwLock<AHashMap<String, String>>,
    /// Cloud service name to its ExternalName override.
    pub external_services: RwLock<AHashMap<String, String>>,
    /// Cluster services owned by this connector, by service name.
    pub synced_services: RwLock<AHashMap<String, Arc<Service>>>,
    pub synced_hash: RwLock<AHashMap<String, u64>>,
    /// Last raw catalog listing, kept for the status sub-resource.
    pub catalog_services: RwLock<Vec<NamespacedService>>,
    pub catalog_hash: AtomicU64,
}

// === impl Context ===

impl Context {
    /// Number of cluster services currently materialized.
    pub fn synced_count(&self) -> usize {
        self.synced_services.read().len()
    }

    pub fn catalog_hash(&self) -> u64 {
        self.catalog_hash.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Forces a full teardown: the next sync observes an empty source set
    /// and deletes everything this connector materialized.
    pub fn purge(&self) {
        self.source_services.write().clear();
        self.native_services.write().clear();
        self.external_services.write().clear();
    }
}
