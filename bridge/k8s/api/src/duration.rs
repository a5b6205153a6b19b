//! Go-style duration strings, as used by `metav1.Duration` fields like
//! `spec.syncPeriod` ("5s", "1m30s", "250ms").

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct K8sDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("invalid duration unit; expected one of 'ns', 'us', 'ms', 's', 'm', or 'h'")]
    InvalidUnit,
    #[error("duration is missing a unit")]
    NoUnit,
    #[error("invalid number in duration: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration(duration): K8sDuration) -> Self {
        duration
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    // Same grammar as Go's time.ParseDuration, minus the sign (a negative
    // sync period is rejected by validation anyway).
    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        fn unit(u: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            Ok(match u {
                "ns" => Duration::from_nanos(1),
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            })
        }

        s = s.trim_start_matches('+');
        let mut total = Duration::ZERO;
        while !s.is_empty() {
            if s == "0" {
                return Ok(Self(Duration::ZERO));
            }
            let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) else {
                return Err(ParseError::NoUnit);
            };
            let (val, rest) = s.split_at(unit_start);
            let val = val.parse::<f64>()?;
            let unit_end = rest
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(rest.len());
            let (u, rest) = rest.split_at(unit_end);
            total += unit(u)?.mul_f64(val);
            s = rest;
        }
        Ok(Self(total))
    }
}

impl Serialize for K8sDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = K8sDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration` format")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

impl schemars::JsonSchema for K8sDuration {
    fn schema_name() -> String {
        "K8sDuration".to_owned()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            format: None,
            ..Default::default()
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_durations() {
        let cases: &[(&str, Duration)] = &[
            ("0", Duration::ZERO),
            ("5s", Duration::from_secs(5)),
            ("250ms", Duration::from_millis(250)),
            ("1m30s", Duration::from_secs(90)),
            ("1.5h", Duration::from_secs(5400)),
        ];
        for (s, expected) in cases {
            assert_eq!(s.parse::<K8sDuration>().unwrap(), K8sDuration(*expected), "{s}");
        }
    }

    #[test]
    fn rejects_unitless() {
        assert_eq!("5".parse::<K8sDuration>(), Err(ParseError::NoUnit));
    }

    #[test]
    fn round_trips_through_json() {
        let d: K8sDuration = serde_json::from_str("\"5s\"").unwrap();
        assert_eq!(Duration::from(d), Duration::from_secs(5));
    }
}
