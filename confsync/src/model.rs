//! Serde model of the configuration document, as found on disk and inside
//! `config_snapshot` push messages.
//!
//! Two shapes are accepted, selected by field presence:
//!
//! - legacy: `cellEndpoints` maps placement keys straight to URLs
//! - extended: `placements` carries a full descriptor per placement
//!
//! When both are present, `placements` wins. Durations are human-readable
//! strings ("10s", "500ms").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: String,
    #[serde(rename = "routingTable", default)]
    pub routing_table: HashMap<String, String>,
    #[serde(rename = "cellEndpoints", default, skip_serializing_if = "Option::is_none")]
    pub cell_endpoints: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placements: Option<HashMap<String, PlacementDocument>>,
    #[serde(rename = "defaultPlacement")]
    pub default_placement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiers: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlacementDocument {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_body_bytes: Option<u64>,
}

impl PlacementDocument {
    /// Descriptor carrying only a URL, as synthesized from the legacy shape.
    pub fn url_only(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fallback: None,
            health_check: None,
            circuit_breaker: None,
            concurrency_limit: None,
            max_request_body_bytes: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckDocument {
    pub path: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerDocument {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
