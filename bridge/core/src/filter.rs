//! Instance filters applied during aggregation: CIDR allow/exclude lists
//! and metadata allow/exclude lists.

use ahash::AHashMap as HashMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A key/value expectation from the connector spec. An empty expected value
/// matches any value (presence-only).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Metadata {
    pub key: String,
    pub value: String,
}

/// Keep-only and drop CIDR lists. An empty keep list keeps everything.
#[derive(Clone, Debug, Default)]
pub struct IpRangeFilter {
    filter: Vec<IpNet>,
    exclude: Vec<IpNet>,
}

impl IpRangeFilter {
    pub fn new(filter: Vec<IpNet>, exclude: Vec<IpNet>) -> Self {
        Self { filter, exclude }
    }

    /// Parses CIDR strings, dropping any that do not parse. Bad ranges in a
    /// spec are reported by validation, not here.
    pub fn from_strs(filter: &[String], exclude: &[String]) -> Self {
        let parse = |ranges: &[String]| {
            ranges
                .iter()
                .filter_map(|r| r.parse::<IpNet>().ok())
                .collect::<Vec<_>>()
        };
        Self::new(parse(filter), parse(exclude))
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty() && self.exclude.is_empty()
    }

    pub fn permits(&self, addr: &str) -> bool {
        let Ok(ip) = addr.parse::<IpAddr>() else {
            // Hostnames pass; CIDR filters only constrain literal addresses.
            return true;
        };
        if !self.filter.is_empty() && !self.filter.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        !self.exclude.iter().any(|net| net.contains(&ip))
    }
}

/// Metadata allow/exclude rules.
#[derive(Clone, Debug, Default)]
pub struct MetadataFilter {
    filter: Vec<Metadata>,
    exclude: Vec<Metadata>,
}

impl MetadataFilter {
    pub fn new(filter: Vec<Metadata>, exclude: Vec<Metadata>) -> Self {
        Self { filter, exclude }
    }

    /// Keeps an instance only when every filter entry matches (an entry
    /// with an empty value matches when the key is absent or any value) and
    /// no exclude entry matches.
    pub fn permits(&self, metadata: &HashMap<String, String>) -> bool {
        for rule in &self.filter {
            match metadata.get(&rule.key) {
                Some(v) => {
                    if !rule.value.is_empty() && *v != rule.value {
                        return false;
                    }
                }
                None => {
                    if !rule.value.is_empty() {
                        return false;
                    }
                }
            }
        }
        for rule in &self.exclude {
            if let Some(v) = metadata.get(&rule.key) {
                if rule.value.is_empty() || *v == rule.value {
                    return false;
                }
            }
        }
        true
    }
}
