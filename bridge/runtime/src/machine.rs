//! The machine inventory adapter: catalog reads are served from
//! `VirtualMachine` resources watched in-cluster, so the provider needs no
//! wire client. The inventory is read-only; cluster-to-cloud registration
//! is rejected.

use anyhow::anyhow;
use async_trait::async_trait;
use registry_bridge_core::{
    CatalogDeregistration, CatalogRegistration, CatalogService, CloudInstance, DiscoveryClient,
    DiscoveryError, NamespacedService, ProviderId, QueryOptions, PROTOCOL_GRPC,
};
use registry_bridge_k8s_api::{ResourceExt, VirtualMachine};
use registry_bridge_k8s_watch::Store;

pub struct MachineDiscovery {
    vms: Store<VirtualMachine>,
    cluster_id: String,
    as_internal: bool,
}

// === impl MachineDiscovery ===

impl MachineDiscovery {
    pub fn new(vms: Store<VirtualMachine>, cluster_id: String, as_internal: bool) -> Self {
        Self {
            vms,
            cluster_id,
            as_internal,
        }
    }
}

#[async_trait]
impl DiscoveryClient for MachineDiscovery {
    async fn catalog_services(
        &self,
        _opts: &QueryOptions,
    ) -> Result<Vec<NamespacedService>, DiscoveryError> {
        let mut names = self
            .vms
            .entries()
            .into_iter()
            .flat_map(|(_, vm)| {
                vm.spec
                    .services
                    .iter()
                    .map(|s| s.service_name.clone())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        Ok(names
            .into_iter()
            .map(|service| NamespacedService {
                namespace: String::new(),
                service,
            })
            .collect())
    }

    async fn catalog_instances(
        &self,
        service: &str,
        _opts: &QueryOptions,
    ) -> Result<Vec<CloudInstance>, DiscoveryError> {
        let mut instances = self
            .vms
            .entries()
            .into_iter()
            .filter_map(|(_, vm)| instance_of(&vm, service, &self.cluster_id))
            .collect::<Vec<_>>();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    async fn registered_services(
        &self,
        _opts: &QueryOptions,
    ) -> Result<Vec<NamespacedService>, DiscoveryError> {
        Ok(Vec::new())
    }

    async fn registered_instances(
        &self,
        _service: &str,
        _opts: &QueryOptions,
    ) -> Result<Vec<CatalogService>, DiscoveryError> {
        Ok(Vec::new())
    }

    async fn register(&self, _reg: &CatalogRegistration) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Permanent(anyhow!(
            "the machine inventory is read-only"
        )))
    }

    async fn deregister(&self, _dereg: &CatalogDeregistration) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Permanent(anyhow!(
            "the machine inventory is read-only"
        )))
    }

    fn is_internal_services(&self) -> bool {
        self.as_internal
    }

    fn provider(&self) -> ProviderId {
        ProviderId::Machine
    }
}

/// Folds a machine's service entries for `service` into one instance.
/// Machines without an address are not reachable and produce nothing.
fn instance_of(vm: &VirtualMachine, service: &str, cluster_id: &str) -> Option<CloudInstance> {
    if vm.spec.machine_ip.is_empty() {
        return None;
    }
    let mut http_port = 0;
    let mut grpc_port = 0;
    for entry in &vm.spec.services {
        if entry.service_name != service {
            continue;
        }
        let grpc = entry
            .app_protocol
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(PROTOCOL_GRPC));
        if grpc {
            grpc_port = entry.port;
        } else {
            http_port = entry.port;
        }
    }
    if http_port == 0 && grpc_port == 0 {
        return None;
    }
    let uid = vm.uid().unwrap_or_default();
    Some(CloudInstance {
        service_name: service.to_string(),
        instance_id: format!("{service}-{uid}"),
        cluster_id: cluster_id.to_string(),
        address: vm.spec.machine_ip.clone(),
        http_port,
        grpc_port,
        health_check: false,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_bridge_k8s_api::vm::{VirtualMachineSpec, VmServiceSpec};
    use registry_bridge_k8s_api::ObjectMeta;

    fn vm(ip: &str, services: Vec<VmServiceSpec>) -> VirtualMachine {
        VirtualMachine {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("vm-1".to_string()),
                uid: Some("u-123".to_string()),
                ..Default::default()
            },
            spec: VirtualMachineSpec {
                machine_ip: ip.to_string(),
                services,
                ..Default::default()
            },
            status: None,
        }
    }

    fn entry(service: &str, protocol: &str, port: u16) -> VmServiceSpec {
        VmServiceSpec {
            service_name: service.to_string(),
            app_protocol: Some(protocol.to_string()),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn http_and_grpc_entries_fold_into_one_instance() {
        let vm = vm(
            "10.1.2.3",
            vec![entry("billing", "http", 8080), entry("billing", "grpc", 9090)],
        );
        let inst = instance_of(&vm, "billing", "set-a").unwrap();
        assert_eq!(inst.instance_id, "billing-u-123");
        assert_eq!(inst.address, "10.1.2.3");
        assert_eq!(inst.http_port, 8080);
        assert_eq!(inst.grpc_port, 9090);
        assert_eq!(inst.cluster_id, "set-a");
        assert!(!inst.health_check);
    }

    #[test]
    fn machines_without_an_address_are_unreachable() {
        let vm = vm("", vec![entry("billing", "http", 8080)]);
        assert_eq!(instance_of(&vm, "billing", ""), None);
    }

    #[test]
    fn machines_not_running_the_service_produce_nothing() {
        let vm = vm("10.1.2.3", vec![entry("billing", "http", 8080)]);
        assert_eq!(instance_of(&vm, "shipping", ""), None);
    }
}
