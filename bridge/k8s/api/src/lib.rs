#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod connector;
mod duration;
pub mod labels;
pub mod vm;

pub use self::connector::{
    C2KGateway, Connector, ConnectorSpec, ConnectorStatus, ConsulConnector, ConversionStrategy,
    EurekaConnector, GatewayConnector, GatewayListenerSelector, GatewayMode, GatewaySyncSpec,
    K2CGateway, Limiter, MachineConnector, MappingStrategy, NacosConnector, NodePortSyncType,
    ServiceConversion, SyncFromK8sSpec, SyncToFgwSpec, SyncToK8sSpec, ZookeeperConnector,
};
pub use self::duration::K8sDuration;
pub use self::vm::{VirtualMachine, VirtualMachineStatus, VmServiceSpec};
pub use gateway_api::apis::experimental::{
    gateways::Gateway, grpcroutes::GRPCRoute, httproutes::HTTPRoute, tcproutes::TCPRoute,
};
pub use k8s_openapi::api::{
    self,
    core::v1::{Endpoints, Node, Service, ServicePort, ServiceSpec},
    discovery::v1::EndpointSlice,
    networking::v1::Ingress,
};
pub use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, ResourceExt};

/// Returns the `<namespace>/<name>` controller key for an object.
pub fn object_key<T: kube::Resource>(obj: &T) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}
