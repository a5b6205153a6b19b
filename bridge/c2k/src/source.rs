//! The source loop: lists the registry catalog, applies service-name
//! conversions, and hands the normalized set to the syncer.

use crate::{Config, Syncer};
use ahash::AHashMap;
use registry_bridge_core::{DiscoveryClient, NamespacedService, QueryOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Cluster names must be valid DNS labels; cloud registries are looser.
pub fn sanitize_service_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.', ' '], "-")
}

/// How one catalog service maps onto the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conversion {
    /// The cloud service name.
    pub service: String,
    /// Non-empty when the cluster service should be materialized as an
    /// ExternalName service pointing here.
    pub external_name: String,
}

pub struct Source {
    disc: Arc<dyn DiscoveryClient>,
    config: Arc<Config>,
    syncer: Arc<Syncer>,
}

// === impl Source ===

impl Source {
    pub fn new(disc: Arc<dyn DiscoveryClient>, config: Arc<Config>, syncer: Arc<Syncer>) -> Self {
        Self {
            disc,
            config,
            syncer,
        }
    }

    /// Polls the catalog until shutdown. Providers with blocking indexes
    /// park inside `catalog_services`; the sleep below paces the rest.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let opts = QueryOptions::blocking(Duration::from_secs(5));
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.disc.catalog_services(&opts).await {
                Ok(catalog) => {
                    trace!(count = catalog.len(), "received services from cloud");
                    let services = self.convert(&catalog);
                    self.syncer.set_services(services, catalog);
                }
                Err(error) => {
                    warn!(%error, "error querying catalog services, will retry");
                }
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(opts.wait_time) => {}
            }
        }
    }

    fn convert(&self, catalog: &[NamespacedService]) -> AHashMap<String, Conversion> {
        let conversions = &self.config.spec.conversion_strategy;
        let mut services = AHashMap::with_capacity(catalog.len());
        for entry in catalog {
            let mut kube_name = sanitize_service_name(&entry.service);
            let mut external_name = String::new();
            if conversions.enable {
                let matched = conversions.service_conversions.iter().find(|c| {
                    c.service == entry.service
                        && (c.namespace.is_empty() || c.namespace == entry.namespace)
                });
                if let Some(conversion) = matched {
                    kube_name = sanitize_service_name(&conversion.convert_name);
                    external_name = conversion.external_name.clone();
                }
            }
            services.insert(
                kube_name,
                Conversion {
                    service: entry.service.clone(),
                    external_name,
                },
            );
        }
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_to_dns_labels() {
        assert_eq!(sanitize_service_name("Shop.Payments_API v2"), "shop-payments-api-v2");
        assert_eq!(sanitize_service_name("payments"), "payments");
    }
}
