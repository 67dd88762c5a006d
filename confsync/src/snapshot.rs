//! Validated, immutable configuration snapshots.
//!
//! `Snapshot::from_document` is the only way to produce a snapshot: it checks
//! every referential and value invariant and either returns a fully usable
//! snapshot or the first failing invariant. There are no partial successes.

use crate::model::{ConfigDocument, PlacementDocument};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};
use url::Url;

pub type RoutingKey = String;
pub type PlacementKey = String;

/// Tier names assumed when the document does not declare its own set.
pub const DEFAULT_TIERS: &[&str] = &["tier1", "tier2", "tier3"];

/// Where a snapshot was admitted from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    ControlPlane,
}

impl ConfigSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::File => "file",
            ConfigSource::ControlPlane => "control_plane",
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthCheckPolicy {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CircuitBreakerPolicy {
    pub failure_threshold: u32,
    pub timeout: Duration,
}

/// A placement and the policies attached to it.
///
/// `concurrency_limit` and `max_request_body_bytes` are normalized at
/// validation time: 0 and absent both mean "unlimited" and are stored as
/// `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub url: Url,
    pub fallback: Option<PlacementKey>,
    pub health_check: Option<HealthCheckPolicy>,
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
    pub concurrency_limit: Option<u32>,
    pub max_request_body_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version: String,
    pub routing_table: HashMap<RoutingKey, PlacementKey>,
    pub placements: HashMap<PlacementKey, Placement>,
    pub default_placement: PlacementKey,
    pub tier_set: HashSet<String>,
    pub source: ConfigSource,
    pub admitted_at: SystemTime,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not parse config document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("version must be non-empty")]
    EmptyVersion,
    #[error("defaultPlacement '{0}' not found in placements")]
    UnknownDefaultPlacement(String),
    #[error("routingTable['{routing_key}'] references unknown placement '{placement}'")]
    UnknownRoutingTarget {
        routing_key: String,
        placement: String,
    },
    #[error("placement '{placement}' references unknown fallback '{fallback}'")]
    UnknownFallback {
        placement: String,
        fallback: String,
    },
    #[error("placement '{placement}' has invalid url '{url}': {source}")]
    InvalidUrl {
        placement: String,
        url: String,
        source: url::ParseError,
    },
    #[error("placement '{placement}' has unsupported url scheme '{scheme}' (expected http or https)")]
    UnsupportedScheme { placement: String, scheme: String },
    #[error("placement '{placement}' has a url without a host")]
    MissingHost { placement: String },
    #[error("placement '{placement}': {field} must be positive")]
    NonPositiveDuration {
        placement: String,
        field: &'static str,
    },
    #[error("placement '{placement}': failure_threshold must be positive")]
    ZeroFailureThreshold { placement: String },
}

impl Snapshot {
    /// Validates a candidate document and builds the snapshot. Total: either
    /// every invariant holds and the whole snapshot is returned, or the first
    /// violation (in deterministic key order) is reported.
    pub fn from_document(doc: ConfigDocument, source: ConfigSource) -> Result<Self, ConfigError> {
        if doc.version.is_empty() {
            return Err(ConfigError::EmptyVersion);
        }

        // The extended shape wins when both are present.
        let descriptors: HashMap<String, PlacementDocument> = match (doc.placements, doc.cell_endpoints) {
            (Some(placements), _) => placements,
            (None, Some(endpoints)) => endpoints
                .into_iter()
                .map(|(key, url)| (key, PlacementDocument::url_only(url)))
                .collect(),
            (None, None) => HashMap::new(),
        };

        let mut keys: Vec<&String> = descriptors.keys().collect();
        keys.sort();

        let mut placements = HashMap::with_capacity(descriptors.len());
        for key in &keys {
            let descriptor = &descriptors[*key];
            let placement = validate_placement(key, descriptor)?;
            placements.insert((*key).clone(), placement);
        }

        for key in &keys {
            if let Some(fallback) = &descriptors[*key].fallback {
                if !placements.contains_key(fallback) {
                    return Err(ConfigError::UnknownFallback {
                        placement: (*key).clone(),
                        fallback: fallback.clone(),
                    });
                }
            }
        }

        if !placements.contains_key(&doc.default_placement) {
            return Err(ConfigError::UnknownDefaultPlacement(doc.default_placement));
        }

        let mut routing_keys: Vec<&String> = doc.routing_table.keys().collect();
        routing_keys.sort();
        for routing_key in routing_keys {
            let target = &doc.routing_table[routing_key];
            if !placements.contains_key(target) {
                return Err(ConfigError::UnknownRoutingTarget {
                    routing_key: routing_key.clone(),
                    placement: target.clone(),
                });
            }
        }

        let tier_set = match doc.tiers {
            Some(tiers) => tiers.into_iter().collect(),
            None => DEFAULT_TIERS.iter().map(|t| t.to_string()).collect(),
        };

        Ok(Snapshot {
            version: doc.version,
            routing_table: doc.routing_table,
            placements,
            default_placement: doc.default_placement,
            tier_set,
            source,
            admitted_at: SystemTime::now(),
        })
    }

    pub fn placement(&self, key: &str) -> Option<&Placement> {
        self.placements.get(key)
    }

    pub fn is_tier(&self, key: &str) -> bool {
        self.tier_set.contains(key)
    }
}

fn validate_placement(key: &str, doc: &PlacementDocument) -> Result<Placement, ConfigError> {
    let url = Url::parse(&doc.url).map_err(|source| ConfigError::InvalidUrl {
        placement: key.to_string(),
        url: doc.url.clone(),
        source,
    })?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ConfigError::UnsupportedScheme {
                placement: key.to_string(),
                scheme: scheme.to_string(),
            });
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::MissingHost {
            placement: key.to_string(),
        });
    }

    let health_check = match &doc.health_check {
        Some(hc) => {
            if hc.interval.is_zero() {
                return Err(ConfigError::NonPositiveDuration {
                    placement: key.to_string(),
                    field: "health_check.interval",
                });
            }
            if hc.timeout.is_zero() {
                return Err(ConfigError::NonPositiveDuration {
                    placement: key.to_string(),
                    field: "health_check.timeout",
                });
            }
            Some(HealthCheckPolicy {
                path: hc.path.clone(),
                interval: hc.interval,
                timeout: hc.timeout,
            })
        }
        None => None,
    };

    let circuit_breaker = match &doc.circuit_breaker {
        Some(cb) => {
            if cb.failure_threshold == 0 {
                return Err(ConfigError::ZeroFailureThreshold {
                    placement: key.to_string(),
                });
            }
            if cb.timeout.is_zero() {
                return Err(ConfigError::NonPositiveDuration {
                    placement: key.to_string(),
                    field: "circuit_breaker.timeout",
                });
            }
            Some(CircuitBreakerPolicy {
                failure_threshold: cb.failure_threshold,
                timeout: cb.timeout,
            })
        }
        None => None,
    };

    Ok(Placement {
        url,
        fallback: doc.fallback.clone(),
        health_check,
        circuit_breaker,
        concurrency_limit: doc.concurrency_limit.filter(|limit| *limit > 0),
        max_request_body_bytes: doc.max_request_body_bytes.filter(|max| *max > 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(json: &str) -> ConfigDocument {
        serde_json::from_str(json).unwrap()
    }

    fn valid_document() -> ConfigDocument {
        document(
            r#"{
                "version": "1.0.0",
                "routingTable": {"visa": "visa", "acme": "tier1"},
                "placements": {
                    "visa": {"url": "http://u-visa", "fallback": "tier3"},
                    "tier1": {"url": "http://u-t1"},
                    "tier3": {"url": "http://u-t3"}
                },
                "defaultPlacement": "tier3"
            }"#,
        )
    }

    #[test]
    fn valid_document_builds_snapshot() {
        let snapshot = Snapshot::from_document(valid_document(), ConfigSource::File).unwrap();
        assert_eq!(snapshot.version, "1.0.0");
        assert_eq!(snapshot.placements.len(), 3);
        assert_eq!(snapshot.placement("visa").unwrap().fallback.as_deref(), Some("tier3"));
        assert_eq!(snapshot.source, ConfigSource::File);
        assert!(snapshot.is_tier("tier1"));
        assert!(snapshot.is_tier("tier3"));
        assert!(!snapshot.is_tier("visa"));
    }

    #[test]
    fn legacy_shape_synthesizes_placements() {
        let doc = document(
            r#"{
                "version": "0.9",
                "routingTable": {"acme": "acme"},
                "cellEndpoints": {"acme": "http://u-acme", "tier3": "http://u-t3"},
                "defaultPlacement": "tier3"
            }"#,
        );
        let snapshot = Snapshot::from_document(doc, ConfigSource::File).unwrap();
        let acme = snapshot.placement("acme").unwrap();
        assert_eq!(acme.url.as_str(), "http://u-acme/");
        assert!(acme.fallback.is_none());
        assert!(acme.circuit_breaker.is_none());
    }

    #[test]
    fn placements_win_over_cell_endpoints() {
        let doc = document(
            r#"{
                "version": "1.1",
                "routingTable": {},
                "cellEndpoints": {"ghost": "http://ignored"},
                "placements": {"tier3": {"url": "http://u-t3"}},
                "defaultPlacement": "tier3"
            }"#,
        );
        let snapshot = Snapshot::from_document(doc, ConfigSource::File).unwrap();
        assert_eq!(snapshot.placements.len(), 1);
        assert!(snapshot.placement("ghost").is_none());
    }

    #[test]
    fn empty_version_rejected() {
        let mut doc = valid_document();
        doc.version = String::new();
        let err = Snapshot::from_document(doc, ConfigSource::File).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyVersion));
    }

    #[test]
    fn unknown_routing_target_rejected() {
        let mut doc = valid_document();
        doc.routing_table.insert("lost".into(), "ghost".into());
        let err = Snapshot::from_document(doc, ConfigSource::File).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unknown_default_placement_rejected() {
        let mut doc = valid_document();
        doc.default_placement = "ghost".into();
        let err = Snapshot::from_document(doc, ConfigSource::File).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefaultPlacement(p) if p == "ghost"));
    }

    #[test]
    fn unknown_fallback_rejected() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {"tier3": {"url": "http://u-t3", "fallback": "ghost"}},
                "defaultPlacement": "tier3"
            }"#,
        );
        let err = Snapshot::from_document(doc, ConfigSource::File).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFallback { fallback, .. } if fallback == "ghost"));
    }

    #[test]
    fn non_http_scheme_rejected() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {"tier3": {"url": "ftp://u-t3"}},
                "defaultPlacement": "tier3"
            }"#,
        );
        let err = Snapshot::from_document(doc, ConfigSource::File).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme { scheme, .. } if scheme == "ftp"));
    }

    #[test]
    fn relative_url_rejected() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {"tier3": {"url": "not a url"}},
                "defaultPlacement": "tier3"
            }"#,
        );
        assert!(Snapshot::from_document(doc, ConfigSource::File).is_err());
    }

    #[test]
    fn zero_durations_rejected() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {
                    "tier3": {
                        "url": "http://u-t3",
                        "health_check": {"path": "/health", "interval": "0s", "timeout": "2s"}
                    }
                },
                "defaultPlacement": "tier3"
            }"#,
        );
        let err = Snapshot::from_document(doc, ConfigSource::File).unwrap_err();
        assert!(matches!(err, ConfigError::NonPositiveDuration { field, .. } if field == "health_check.interval"));
    }

    #[test]
    fn zero_failure_threshold_rejected() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {
                    "tier3": {
                        "url": "http://u-t3",
                        "circuit_breaker": {"failure_threshold": 0, "timeout": "30s"}
                    }
                },
                "defaultPlacement": "tier3"
            }"#,
        );
        let err = Snapshot::from_document(doc, ConfigSource::File).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroFailureThreshold { .. }));
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {
                    "tier3": {"url": "http://u-t3", "concurrency_limit": 0, "max_request_body_bytes": 0}
                },
                "defaultPlacement": "tier3"
            }"#,
        );
        let snapshot = Snapshot::from_document(doc, ConfigSource::File).unwrap();
        let tier3 = snapshot.placement("tier3").unwrap();
        assert_eq!(tier3.concurrency_limit, None);
        assert_eq!(tier3.max_request_body_bytes, None);
    }

    #[test]
    fn empty_routing_table_is_valid() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {"tier3": {"url": "http://u-t3"}},
                "defaultPlacement": "tier3"
            }"#,
        );
        let snapshot = Snapshot::from_document(doc, ConfigSource::File).unwrap();
        assert!(snapshot.routing_table.is_empty());
    }

    #[test]
    fn declared_tiers_override_default_set() {
        let doc = document(
            r#"{
                "version": "1",
                "routingTable": {},
                "placements": {"pool-a": {"url": "http://u-a"}},
                "defaultPlacement": "pool-a",
                "tiers": ["pool-a"]
            }"#,
        );
        let snapshot = Snapshot::from_document(doc, ConfigSource::File).unwrap();
        assert!(snapshot.is_tier("pool-a"));
        assert!(!snapshot.is_tier("tier1"));
    }

    // A document serialized and re-validated yields the same snapshot, modulo
    // provenance and admission time.
    #[test]
    fn snapshot_round_trips_through_serialization() {
        let doc = valid_document();
        let first = Snapshot::from_document(doc.clone(), ConfigSource::File).unwrap();

        let json = serde_json::to_string(&doc).unwrap();
        let reparsed: ConfigDocument = serde_json::from_str(&json).unwrap();
        let second = Snapshot::from_document(reparsed, ConfigSource::ControlPlane).unwrap();

        assert_eq!(first.version, second.version);
        assert_eq!(first.routing_table, second.routing_table);
        assert_eq!(first.placements, second.placements);
        assert_eq!(first.default_placement, second.default_placement);
        assert_eq!(first.tier_set, second.tier_set);
    }
}
