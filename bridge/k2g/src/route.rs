//! Builds the gateway route for one service port. The route kind follows
//! the port's app protocol; the parent references point at gateway
//! listeners on the connector's configured ingress or egress ports.

use crate::Config;
use gateway_api::apis::experimental::{
    gateways::Gateway, grpcroutes as grpc, httproutes as http, tcproutes as tcp,
};
use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use registry_bridge_core::{blob, PROTOCOL_GRPC, PROTOCOL_HTTP};
use registry_bridge_k8s_api::labels;

/// Weight carried by every generated backend reference.
pub const CLUSTER_WEIGHT_ACCEPT_ALL: i32 = 100;

/// Interface matched by generated gRPC routes.
pub const GRPC_ROUTE_INTERFACE: &str = "grpc.GrpcService";

const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

/// A generated route of whichever kind the port called for.
#[derive(Clone, Debug)]
pub enum RouteObject {
    Http(http::HTTPRoute),
    Grpc(grpc::GRPCRoute),
    Tcp(tcp::TCPRoute),
}

// === impl RouteObject ===

impl RouteObject {
    pub(crate) fn kind(&self) -> RouteKind {
        match self {
            Self::Http(_) => RouteKind::Http,
            Self::Grpc(_) => RouteKind::Grpc,
            Self::Tcp(_) => RouteKind::Tcp,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum RouteKind {
    Http,
    Grpc,
    Tcp,
}

impl RouteKind {
    pub(crate) const ALL: [Self; 3] = [Self::Http, Self::Grpc, Self::Tcp];
}

/// A gateway listener a route attaches under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParentListener {
    pub namespace: String,
    pub gateway: String,
    pub port: i32,
}

/// The effective protocol of a service port, lowercased. The app protocol
/// wins when set; otherwise the L4 protocol (effectively always tcp).
pub(crate) fn port_protocol(port: &ServicePort) -> String {
    port.app_protocol
        .clone()
        .or_else(|| port.protocol.clone())
        .unwrap_or_else(|| "TCP".to_string())
        .to_ascii_lowercase()
}

/// Whether the service is an internal source, which attaches it to the
/// ingress side of the gateway rather than the egress side. Materialized
/// cloud services carry both sync annotations.
pub(crate) fn is_internal(svc: &Service) -> bool {
    let Some(annotations) = svc.metadata.annotations.as_ref() else {
        return false;
    };
    annotations.contains_key(labels::ANNOTATION_SERVICE_SYNC_K8S_TO_CLOUD)
        && annotations.contains_key(labels::ANNOTATION_SERVICE_SYNC_K8S_TO_FGW)
}

/// Listeners of the connector's gateway matching the side and protocol of
/// the route. Non-http, non-grpc ports attach where http does.
pub(crate) fn listener_parents(
    config: &Config,
    gateway: &Gateway,
    internal: bool,
    protocol: &str,
) -> Vec<ParentListener> {
    let selector = if internal {
        &config.ingress
    } else {
        &config.egress
    };
    let want = if protocol == PROTOCOL_GRPC {
        selector.grpc_port
    } else {
        selector.http_port
    };
    if want == 0 {
        return Vec::new();
    }
    let ns = gateway.metadata.namespace.clone().unwrap_or_default();
    let name = gateway.name_any();
    gateway
        .spec
        .listeners
        .iter()
        .filter(|listener| listener.port == i32::from(want))
        .map(|listener| ParentListener {
            namespace: ns.clone(),
            gateway: name.clone(),
            port: listener.port,
        })
        .collect()
}

/// Hostnames a route answers to: the service's cluster names plus every
/// current instance address. Cloud-materialized services carry their
/// addresses in the endpoint descriptor; plain services in Endpoints.
pub(crate) fn hostnames(svc: &Service, endpoints: Option<&Endpoints>) -> Vec<String> {
    let name = svc.name_any();
    let ns = svc.metadata.namespace.as_deref().unwrap_or_default();
    let mut out = vec![
        name.clone(),
        format!("{name}.{ns}"),
        format!("{name}.{ns}.svc"),
    ];
    if let Some(enc) = svc
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::ANNOTATION_MESH_ENDPOINT_ADDR))
    {
        if let Ok(meta) = blob::decode(enc) {
            out.extend(meta.endpoints.keys().cloned());
            return out;
        }
    }
    if let Some(endpoints) = endpoints {
        for subset in endpoints.subsets.iter().flatten() {
            for addr in subset.addresses.iter().flatten() {
                out.push(addr.ip.clone());
            }
        }
    }
    out
}

pub(crate) fn build_route(
    svc: &Service,
    port: &ServicePort,
    protocol: &str,
    hostnames: Vec<String>,
    parents: &[ParentListener],
) -> RouteObject {
    let name = svc.name_any();
    let metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: svc.metadata.namespace.clone(),
        ..Default::default()
    };
    match protocol {
        PROTOCOL_HTTP => RouteObject::Http(http::HTTPRoute {
            metadata,
            spec: http::HTTPRouteSpec {
                parent_refs: Some(
                    parents
                        .iter()
                        .map(|p| http::HTTPRouteParentRefs {
                            group: Some(GATEWAY_GROUP.to_string()),
                            kind: Some("Gateway".to_string()),
                            namespace: Some(p.namespace.clone()),
                            name: p.gateway.clone(),
                            section_name: None,
                            port: Some(p.port),
                        })
                        .collect(),
                ),
                hostnames: Some(hostnames),
                rules: Some(vec![http::HTTPRouteRules {
                    matches: Some(vec![http::HTTPRouteRulesMatches {
                        path: Some(http::HTTPRouteRulesMatchesPath {
                            r#type: Some(http::HTTPRouteRulesMatchesPathType::PathPrefix),
                            value: Some("/".to_string()),
                        }),
                        ..Default::default()
                    }]),
                    backend_refs: Some(vec![http::HTTPRouteRulesBackendRefs {
                        group: Some(String::new()),
                        kind: Some("Service".to_string()),
                        namespace: svc.metadata.namespace.clone(),
                        name: name.clone(),
                        port: Some(port.port),
                        weight: Some(CLUSTER_WEIGHT_ACCEPT_ALL),
                        filters: None,
                    }]),
                    ..Default::default()
                }]),
            },
            status: None,
        }),
        PROTOCOL_GRPC => RouteObject::Grpc(grpc::GRPCRoute {
            metadata,
            spec: grpc::GRPCRouteSpec {
                parent_refs: Some(
                    parents
                        .iter()
                        .map(|p| grpc::GRPCRouteParentRefs {
                            group: Some(GATEWAY_GROUP.to_string()),
                            kind: Some("Gateway".to_string()),
                            namespace: Some(p.namespace.clone()),
                            name: p.gateway.clone(),
                            section_name: None,
                            port: Some(p.port),
                        })
                        .collect(),
                ),
                hostnames: Some(hostnames),
                rules: Some(vec![grpc::GRPCRouteRules {
                    name: None,
                    matches: Some(vec![grpc::GRPCRouteRulesMatches {
                        headers: None,
                        method: Some(grpc::GRPCRouteRulesMatchesMethod {
                            method: None,
                            service: Some(GRPC_ROUTE_INTERFACE.to_string()),
                            r#type: Some(grpc::GRPCRouteRulesMatchesMethodType::Exact),
                        }),
                    }]),
                    filters: None,
                    backend_refs: Some(vec![grpc::GRPCRouteRulesBackendRefs {
                        filters: None,
                        group: Some(String::new()),
                        kind: Some("Service".to_string()),
                        namespace: svc.metadata.namespace.clone(),
                        name: name.clone(),
                        port: Some(port.port),
                        weight: Some(CLUSTER_WEIGHT_ACCEPT_ALL),
                    }]),
                    session_persistence: None,
                }]),
            },
            status: None,
        }),
        // Anything else rides the gateway as raw TCP.
        _ => RouteObject::Tcp(tcp::TCPRoute {
            metadata,
            spec: tcp::TCPRouteSpec {
                parent_refs: Some(
                    parents
                        .iter()
                        .map(|p| tcp::TCPRouteParentRefs {
                            group: Some(GATEWAY_GROUP.to_string()),
                            kind: Some("Gateway".to_string()),
                            namespace: Some(p.namespace.clone()),
                            name: p.gateway.clone(),
                            section_name: None,
                            port: Some(p.port),
                        })
                        .collect(),
                ),
                rules: vec![tcp::TCPRouteRules {
                    name: None,
                    backend_refs: Some(vec![tcp::TCPRouteRulesBackendRefs {
                        group: Some(String::new()),
                        kind: Some("Service".to_string()),
                        namespace: svc.metadata.namespace.clone(),
                        name: name.clone(),
                        port: Some(port.port),
                        weight: Some(CLUSTER_WEIGHT_ACCEPT_ALL),
                    }]),
                }],
            },
            status: None,
        }),
    }
}
