#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod blob;
pub mod cache;
pub mod discovery;
mod filter;
pub mod hash;
mod limiter;
pub mod registration;

pub use self::{
    blob::{DecodeCache, GrpcMeta, MicroEndpointMeta, MicroSvcMeta, WithGatewayMode},
    cache::{ActionCache, CatalogCache},
    discovery::{DiscoveryClient, DiscoveryError, ProviderId, QueryOptions, UnknownProvider},
    filter::{IpRangeFilter, Metadata, MetadataFilter},
    limiter::RateLimiter,
    registration::{
        AgentCheck, AgentService, AgentWeights, CatalogDeregistration, CatalogRegistration,
        CatalogService, CloudInstance, NamespacedService,
    },
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// Identifies objects written by this controller.
pub const CONNECTOR_NAME: &str = "flomesh.io/registry-bridge";

/// Protocol names used in port maps and service annotations.
pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_GRPC: &str = "grpc";
pub const PROTOCOL_TCP: &str = "tcp";
