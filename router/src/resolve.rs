//! The routing resolver: a pure lookup from routing key to placement.
//!
//! Unknown and empty keys fall back to the snapshot's default placement, so
//! every request has somewhere to go as long as a snapshot is active. The
//! resolver is the only source of truth for the route reason surfaced in
//! logs and response headers.

use confsync::snapshot::Snapshot;
use url::Url;

/// Why a placement was chosen for a routing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteReason {
    Dedicated,
    Tier,
    Default,
}

impl RouteReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RouteReason::Dedicated => "dedicated",
            RouteReason::Tier => "tier",
            RouteReason::Default => "default",
        }
    }
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RouteDecision {
    pub placement: String,
    pub endpoint: Url,
    pub reason: RouteReason,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ResolveError {
    // Cannot occur on a validated snapshot; surfaces as a 500.
    #[error("no placement configured for '{0}'")]
    MissingPlacement(String),
}

pub fn resolve(routing_key: &str, snapshot: &Snapshot) -> Result<RouteDecision, ResolveError> {
    let (placement_key, reason) = match snapshot.routing_table.get(routing_key) {
        Some(target) if !routing_key.is_empty() => {
            let reason = if snapshot.is_tier(target) {
                RouteReason::Tier
            } else {
                RouteReason::Dedicated
            };
            (target.clone(), reason)
        }
        _ => (snapshot.default_placement.clone(), RouteReason::Default),
    };

    let placement = snapshot
        .placement(&placement_key)
        .ok_or_else(|| ResolveError::MissingPlacement(placement_key.clone()))?;

    Ok(RouteDecision {
        placement: placement_key,
        endpoint: placement.url.clone(),
        reason,
    })
}
