//! The VirtualMachine resource: the inventory the Machine provider reads
//! instead of an external registry.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes one VM and the services it exposes.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "machine.flomesh.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    shortname = "vm",
    status = "VirtualMachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// The IP address of the vm's sidecar.
    #[serde(rename = "sidecarIP", default, skip_serializing_if = "Option::is_none")]
    pub sidecar_ip: Option<String>,

    /// The IP address of the vm.
    #[serde(rename = "machineIP")]
    pub machine_ip: String,

    /// IP family (IPv4 or IPv6) assigned to this vm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_family: Option<String>,

    /// The ServiceAccount this vm runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// The services exposed by this vm.
    #[serde(default)]
    pub services: Vec<VmServiceSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmServiceSpec {
    pub service_name: String,

    /// The name of this port within the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,

    /// The IP protocol for this port. Defaults to TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The application protocol for this port (e.g. http or grpc).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    /// The port exposed by this service.
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}
