//! Labels and annotations written to (or read from) cluster objects.
//!
//! These strings are a wire contract shared with deployed meshes; renaming
//! any of them orphans objects written by earlier versions.

/// Label marking a service as materialized from the cloud registry.
pub const CLOUD_SOURCED_SERVICE_LABEL: &str = "flomesh.io/cloud-sourced-service";

/// Label pinning a materialized service's selector and endpoints to the
/// cloud service that produced them.
pub const CLOUD_SERVICE_LABEL: &str = "flomesh.io/cloud-service";

/// Label advertising the gRPC interface a materialized service serves.
pub const GRPC_SERVICE_INTERFACE_LABEL: &str = "flomesh.io/grpc-service-interface";

/// Annotation naming the provider a materialized service came from.
pub const ANNOTATION_CLOUD_SERVICE_PROVIDER: &str = "flomesh.io/cloud-service-provider";

/// Annotation carrying the UID of the connector that materialized a service.
pub const ANNOTATION_CLOUD_SERVICE_MANAGED_BY: &str = "flomesh.io/cloud-service-managed-by";

/// Annotation naming the cloud service a materialized service was derived
/// from.
pub const ANNOTATION_CLOUD_SERVICE_INHERITED_FROM: &str =
    "flomesh.io/cloud-service-inherited-from";

/// Annotation marking a materialized service whose instances carry a cloud
/// health check; such services are never synced back out.
pub const ANNOTATION_CLOUD_HEALTH_CHECK_SERVICE: &str =
    "flomesh.io/cloud-health-check-service";

/// Annotation carrying the source cluster id of a materialized service.
pub const ANNOTATION_CLOUD_SERVICE_INHERITED_CLUSTER_ID: &str =
    "flomesh.io/cloud-service-inherited-cluster-id";

/// Annotation holding the base64-encoded endpoint blob.
pub const ANNOTATION_MESH_ENDPOINT_ADDR: &str = "flomesh.io/cloud-endpoints";

/// Annotation holding the FNV-64 hash of the endpoint blob.
pub const ANNOTATION_MESH_ENDPOINT_HASH: &str = "flomesh.io/cloud-endpoints-hash";

/// Annotation marking a materialized service as reachable only through the
/// connector's gateway.
pub const ANNOTATION_MESH_SERVICE_INTERNAL_SYNC: &str = "flomesh.io/mesh-service-internal-sync";

/// Annotation carrying `addr:port` of the gateway fronting a service's
/// endpoints.
pub const ANNOTATION_CLOUD_VIA_GATEWAY: &str = "flomesh.io/cloud-service-via-gateway";

/// Annotation advertising gRPC-via-gateway routing metadata.
pub const ANNOTATION_CLOUD_GRPC_VIA_GATEWAY: &str = "flomesh.io/cloud-grpc-via-gateway";

/// Explicit opt-in/out for syncing a cluster service to the cloud registry.
/// Overrides the connector's default-sync policy.
pub const ANNOTATION_SERVICE_SYNC_K8S_TO_CLOUD: &str = "flomesh.io/service-sync-k8s-to-cloud";

/// Explicit opt-in/out for projecting a cluster service onto gateway routes.
pub const ANNOTATION_SERVICE_SYNC_K8S_TO_FGW: &str = "flomesh.io/service-sync-k8s-to-fgw";

/// Comma-separated tags appended to registrations (`\,` escapes a comma).
pub const ANNOTATION_SERVICE_TAGS: &str = "flomesh.io/service-tags";

/// Prefix for annotations that become registration metadata:
/// `flomesh.io/service-meta-foo: v` yields metadata `foo: v`.
pub const ANNOTATION_SERVICE_META_PREFIX: &str = "flomesh.io/service-meta-";

/// Registration weight; honored when it parses as an integer > 1.
pub const ANNOTATION_SERVICE_WEIGHT: &str = "flomesh.io/service-weight";

/// Overrides the name of the port selected for registration.
pub const ANNOTATION_SERVICE_PORT: &str = "flomesh.io/service-port";

/// Metadata keys stamped onto every registration.
pub const META_SOURCE_KEY: &str = "fsm-connector-external-source";
pub const META_SOURCE_VALUE: &str = "kubernetes";
pub const META_SERVICE_KEY: &str = "fsm-connector-service";
pub const META_NAMESPACE_KEY: &str = "fsm-connector-external-k8s-ns";
pub const META_CONNECTOR_UID_KEY: &str = "fsm-connector-uid";
pub const META_CLUSTER_SET_KEY: &str = "fsm-connector-cluster-set";

/// Tag applied to every cluster-sourced registration.
pub const K8S_TAG: &str = "k8s";

/// Instance metadata keys read during C2K aggregation.
pub const CLOUD_CLUSTER_SET_KEY: &str = "fsm-connector-cluster-set";
pub const CLOUD_VIA_GATEWAY_MODE_KEY: &str = "fsm-connector-via-gateway-mode";
pub const CLOUD_HTTP_VIA_GATEWAY_KEY: &str = "fsm-connector-http-via-gateway";
pub const CLOUD_GRPC_VIA_GATEWAY_KEY: &str = "fsm-connector-grpc-via-gateway";
pub const CLOUD_GRPC_INTERFACE_KEY: &str = "gRPC.interface";
pub const CLOUD_GRPC_METHODS_KEY: &str = "gRPC.methods";

/// Label kube sets on EndpointSlices it manages; cleared when the bridge
/// takes a slice over.
pub const ENDPOINT_SLICE_MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";

/// Label selecting the EndpointSlices of a service.
pub const ENDPOINT_SLICE_SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
