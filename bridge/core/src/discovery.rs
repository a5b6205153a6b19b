//! The capability set every registry adapter satisfies.
//!
//! Wire-level clients live outside this crate; the engines only ever see
//! this trait plus the conversion types in [`crate::registration`].

use crate::registration::{
    CatalogDeregistration, CatalogRegistration, CatalogService, CloudInstance, NamespacedService,
};
use std::{fmt, time::Duration};

/// Discriminates the registry kind a connector bridges to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Consul,
    Eureka,
    Nacos,
    Zookeeper,
    Machine,
    Gateway,
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Consul => "consul",
            Self::Eureka => "eureka",
            Self::Nacos => "nacos",
            Self::Zookeeper => "zookeeper",
            Self::Machine => "machine",
            Self::Gateway => "gateway",
        };
        s.fmt(f)
    }
}

impl std::str::FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consul" => Ok(Self::Consul),
            "eureka" => Ok(Self::Eureka),
            "nacos" => Ok(Self::Nacos),
            "zookeeper" => Ok(Self::Zookeeper),
            "machine" => Ok(Self::Machine),
            "gateway" => Ok(Self::Gateway),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown service discovery provider: {0}")]
pub struct UnknownProvider(pub String);

/// Options threaded through every catalog read.
///
/// Providers with blocking indexes (Consul style) update `wait_index` from
/// each response so the next call blocks until change or `wait_time`;
/// providers without them return immediately and the caller sleeps.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub allow_stale: bool,
    pub wait_index: u64,
    pub wait_time: Duration,
    /// Registry-side namespace override.
    pub namespace: Option<String>,
    /// Free-form filter expression, passed through to the provider.
    pub filter: Option<String>,
}

impl QueryOptions {
    pub fn blocking(wait_time: Duration) -> Self {
        Self {
            allow_stale: true,
            wait_index: 1,
            wait_time,
            ..Default::default()
        }
    }
}

/// Remote failures are split by whether a retry can help. The action cache
/// retries `Transient` errors (at most twice per reconcile) and drops
/// `Permanent` ones until the input changes.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("transient registry error: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("permanent registry error: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl DiscoveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Abstracts one external registry behind a fixed operation set.
#[async_trait::async_trait]
pub trait DiscoveryClient: Send + Sync + 'static {
    /// All services visible in the registry catalog.
    async fn catalog_services(
        &self,
        opts: &QueryOptions,
    ) -> Result<Vec<NamespacedService>, DiscoveryError>;

    /// All instances of one catalog service.
    async fn catalog_instances(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> Result<Vec<CloudInstance>, DiscoveryError>;

    /// Services previously written by this connector, identified by the
    /// connector-uid metadata marker.
    async fn registered_services(
        &self,
        opts: &QueryOptions,
    ) -> Result<Vec<NamespacedService>, DiscoveryError>;

    /// Instances previously written by this connector for one service.
    async fn registered_instances(
        &self,
        service: &str,
        opts: &QueryOptions,
    ) -> Result<Vec<CatalogService>, DiscoveryError>;

    async fn register(&self, reg: &CatalogRegistration) -> Result<(), DiscoveryError>;

    async fn deregister(&self, dereg: &CatalogDeregistration) -> Result<(), DiscoveryError>;

    fn enable_namespaces(&self) -> bool {
        false
    }

    /// Creates the registry-side namespace if needed. Returns whether a
    /// namespace was created.
    async fn ensure_namespace_exists(&self, _ns: &str) -> Result<bool, DiscoveryError> {
        Ok(false)
    }

    /// Maps a cluster namespace to the registry-side namespace.
    fn registered_namespace(&self, _cluster_ns: &str) -> String {
        String::new()
    }

    /// Whether services fronted by this connector are reachable only
    /// through the gateway.
    fn is_internal_services(&self) -> bool {
        false
    }

    fn provider(&self) -> ProviderId;

    /// Releases persistent connection pools.
    fn close(&self) {}
}
