//! Active health checking.
//!
//! Each placement with a `health_check` policy gets its own probe task: GET
//! `url + path` with the configured timeout, every interval, starting with an
//! immediate check. 2xx means healthy; anything else (connection error,
//! timeout, non-2xx) means unhealthy. Everything without a policy is healthy
//! forever (fail-open). State flips are logged edge-triggered.

use confsync::snapshot::{HealthCheckPolicy, Snapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read side consulted by the proxy engine.
pub trait HealthView: Send + Sync {
    fn state(&self, placement: &str) -> HealthState;
}

struct ProbeStatus {
    state: HealthState,
    last_check: Option<SystemTime>,
}

struct Probe {
    url: Url,
    policy: HealthCheckPolicy,
    status: Mutex<ProbeStatus>,
    cancel: CancellationToken,
}

pub struct HealthMonitor {
    probes: RwLock<HashMap<String, Arc<Probe>>>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            probes: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    /// Reconciles probe tasks against a newly published snapshot: probes for
    /// retired placements are cancelled, changed policies restart their
    /// probe, new placements start healthy.
    pub fn apply(&self, snapshot: &Snapshot) {
        let mut probes = self.probes.write();

        probes.retain(|key, probe| {
            let keep = snapshot.placement(key).is_some_and(|placement| {
                placement.health_check.as_ref() == Some(&probe.policy)
                    && placement.url == probe.url
            });
            if !keep {
                probe.cancel.cancel();
            }
            keep
        });

        for (key, placement) in &snapshot.placements {
            let Some(policy) = &placement.health_check else {
                continue;
            };
            if probes.contains_key(key) {
                continue;
            }
            let probe = Arc::new(Probe {
                url: placement.url.clone(),
                policy: policy.clone(),
                status: Mutex::new(ProbeStatus {
                    state: HealthState::Healthy,
                    last_check: None,
                }),
                cancel: self.shutdown.child_token(),
            });
            probes.insert(key.clone(), probe.clone());

            let client = self.client.clone();
            let placement_key = key.clone();
            tokio::spawn(async move {
                run_probe(client, placement_key, probe).await;
            });
        }
    }

    pub fn last_check(&self, placement: &str) -> Option<SystemTime> {
        self.probes
            .read()
            .get(placement)
            .and_then(|probe| probe.status.lock().last_check)
    }
}

impl HealthView for HealthMonitor {
    fn state(&self, placement: &str) -> HealthState {
        match self.probes.read().get(placement) {
            Some(probe) => probe.status.lock().state,
            // Fail-open for placements without a health check.
            None => HealthState::Healthy,
        }
    }
}

async fn run_probe(client: reqwest::Client, placement: String, probe: Arc<Probe>) {
    let mut ticker = tokio::time::interval(probe.policy.interval);
    // interval's first tick fires immediately: the initial check runs now.
    loop {
        tokio::select! {
            _ = probe.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let (state, detail) = check_once(&client, &probe).await;
        record(&placement, &probe, state, &detail);
    }
}

async fn check_once(client: &reqwest::Client, probe: &Probe) -> (HealthState, String) {
    let mut url = probe.url.clone();
    url.set_path(&probe.policy.path);

    match client.get(url).timeout(probe.policy.timeout).send().await {
        Ok(response) if response.status().is_success() => (HealthState::Healthy, String::new()),
        Ok(response) => (
            HealthState::Unhealthy,
            format!("status_{}", response.status().as_u16()),
        ),
        Err(err) => (HealthState::Unhealthy, err.to_string()),
    }
}

fn record(placement: &str, probe: &Probe, new_state: HealthState, detail: &str) {
    let mut status = probe.status.lock();
    let old_state = status.state;
    status.state = new_state;
    status.last_check = Some(SystemTime::now());
    drop(status);

    if old_state != new_state {
        tracing::info!(
            placement,
            url = %probe.url,
            old_state = %old_state,
            new_state = %new_state,
            detail,
            "health state changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confsync::model::ConfigDocument;
    use confsync::snapshot::ConfigSource;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot_with_health(url: &str) -> Snapshot {
        let doc: ConfigDocument = serde_json::from_str(&format!(
            r#"{{
                "version": "1",
                "routingTable": {{}},
                "placements": {{
                    "visa": {{
                        "url": "{url}",
                        "health_check": {{"path": "/health", "interval": "50ms", "timeout": "1s"}}
                    }},
                    "tier3": {{"url": "http://u-t3"}}
                }},
                "defaultPlacement": "tier3"
            }}"#
        ))
        .unwrap();
        Snapshot::from_document(doc, ConfigSource::File).unwrap()
    }

    #[tokio::test]
    async fn placements_without_a_policy_are_healthy() {
        let monitor = HealthMonitor::new(CancellationToken::new());
        monitor.apply(&snapshot_with_health("http://u-visa"));
        assert_eq!(monitor.state("tier3"), HealthState::Healthy);
        assert_eq!(monitor.state("unknown"), HealthState::Healthy);
    }

    #[tokio::test]
    async fn healthy_upstream_stays_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let monitor = HealthMonitor::new(CancellationToken::new());
        monitor.apply(&snapshot_with_health(&server.uri()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(monitor.state("visa"), HealthState::Healthy);
        assert!(monitor.last_check("visa").is_some());
    }

    #[tokio::test]
    async fn failing_upstream_goes_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let monitor = HealthMonitor::new(CancellationToken::new());
        monitor.apply(&snapshot_with_health(&server.uri()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(monitor.state("visa"), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn unreachable_upstream_goes_unhealthy() {
        // Bind and drop a listener so the port refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let monitor = HealthMonitor::new(CancellationToken::new());
        monitor.apply(&snapshot_with_health(&format!("http://{addr}")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.state("visa"), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn retired_placements_fall_back_to_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let monitor = HealthMonitor::new(CancellationToken::new());
        monitor.apply(&snapshot_with_health(&server.uri()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(monitor.state("visa"), HealthState::Unhealthy);

        // visa loses its health check in the next snapshot.
        let doc: ConfigDocument = serde_json::from_str(
            r#"{
                "version": "2",
                "routingTable": {},
                "placements": {"tier3": {"url": "http://u-t3"}},
                "defaultPlacement": "tier3"
            }"#,
        )
        .unwrap();
        monitor.apply(&Snapshot::from_document(doc, ConfigSource::File).unwrap());
        assert_eq!(monitor.state("visa"), HealthState::Healthy);
    }
}
