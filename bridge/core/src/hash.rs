//! Content hashing for dedupe decisions and derived identifiers.
//!
//! Two distinct hashes are used across the bridge:
//!
//! * [`fnv64`]: FNV-1 over raw bytes. This is a wire contract: the
//!   endpoint-hash annotation embeds this value, so existing deployments
//!   depend on it staying stable.
//! * [`structural`]: an order-insensitive hash over any serializable
//!   value, used to decide whether a spec or registration actually changed.
//!   Null fields, empty collections, and zero values do not contribute, so
//!   a round-trip through defaulted fields does not produce a spurious
//!   change.

use serde::Serialize;
use serde_json::Value;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1, 64-bit.
pub fn fnv64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u64::from(*b);
    }
    hash
}

/// Hashes any serializable value, ignoring nulls, empties, and zeroes, and
/// treating arrays as sets.
pub fn structural<T: Serialize>(value: &T) -> Result<u64, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    Ok(hash_value(&json))
}

fn hash_value(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Bool(b) => {
            if *b {
                fnv64(b"true")
            } else {
                0
            }
        }
        Value::Number(n) => {
            if n.as_f64() == Some(0.0) {
                0
            } else {
                fnv64(n.to_string().as_bytes())
            }
        }
        Value::String(s) => {
            if s.is_empty() {
                0
            } else {
                fnv64(s.as_bytes())
            }
        }
        // Order-insensitive: element hashes are combined by wrapping
        // addition so [a, b] and [b, a] collapse to the same value.
        Value::Array(items) => items.iter().map(hash_value).fold(0u64, u64::wrapping_add),
        Value::Object(map) => {
            let mut hash = 0u64;
            for (key, val) in map {
                let vh = hash_value(val);
                if vh == 0 {
                    continue;
                }
                hash = hash.wrapping_add(fnv64(key.as_bytes()) ^ vh.rotate_left(17));
            }
            hash
        }
    }
}

/// Derives the service-instance id for a cluster-sourced registration: a
/// pure function of the service name, address, ports, and cluster set. Not
/// meant to be particularly human-friendly.
pub fn instance_id(
    name: &str,
    addr: &str,
    http_port: u16,
    grpc_port: u16,
    cluster_set: &str,
) -> String {
    let id = if grpc_port > 0 {
        format!("{name}-{addr}-{http_port}-{grpc_port}-{cluster_set}")
    } else {
        format!("{name}-{addr}-{http_port}-{cluster_set}")
    };
    id.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[test]
    fn fnv64_matches_known_vectors() {
        assert_eq!(fnv64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv64(b"a"), 0xaf63_bd4c_8601_b7be);
        assert_eq!(fnv64(b"foobar"), 0x340d_8765_a4dd_a9c2);
    }

    #[derive(Serialize)]
    struct Reg<'a> {
        name: &'a str,
        tags: Vec<&'a str>,
        weight: u32,
        note: Option<&'a str>,
    }

    #[test]
    fn structural_ignores_nil_and_zero() {
        let a = Reg {
            name: "checkout",
            tags: vec!["k8s"],
            weight: 0,
            note: None,
        };
        let b = Reg {
            name: "checkout",
            tags: vec!["k8s"],
            weight: 0,
            note: Some(""),
        };
        assert_eq!(structural(&a).unwrap(), structural(&b).unwrap());
    }

    #[test]
    fn structural_treats_slices_as_sets() {
        let a = Reg {
            name: "checkout",
            tags: vec!["k8s", "canary"],
            weight: 2,
            note: None,
        };
        let b = Reg {
            name: "checkout",
            tags: vec!["canary", "k8s"],
            weight: 2,
            note: None,
        };
        assert_eq!(structural(&a).unwrap(), structural(&b).unwrap());
    }

    #[test]
    fn structural_detects_changes() {
        let a = Reg {
            name: "checkout",
            tags: vec!["k8s"],
            weight: 2,
            note: None,
        };
        let b = Reg {
            name: "checkout",
            tags: vec!["k8s"],
            weight: 3,
            note: None,
        };
        assert_ne!(structural(&a).unwrap(), structural(&b).unwrap());
    }

    #[test]
    fn instance_id_is_pure_and_lowercase() {
        let a = instance_id("Checkout", "10.2.0.7", 9000, 0, "default");
        assert_eq!(a, "checkout-10.2.0.7-9000-default");
        assert_eq!(
            instance_id("checkout", "10.2.0.7", 9000, 50051, "default"),
            "checkout-10.2.0.7-9000-50051-default"
        );
    }
}
