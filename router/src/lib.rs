//! The request-path engine: resolves each request to a placement, applies
//! admission, circuit and health gates, and streams it to the chosen cell.

pub mod circuit;
pub mod debug;
pub mod errors;
pub mod health;
pub mod limits;
pub mod metrics_defs;
pub mod proxy;
pub mod resolve;

use crate::circuit::CircuitBreakerSet;
use crate::errors::RouterError;
use crate::health::HealthMonitor;
use crate::limits::AdmissionController;
use crate::proxy::ProxyEngine;
use confsync::snapshot::Snapshot;
use confsync::store::ConfigStore;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub drain_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            drain_grace: Duration::from_secs(10),
        }
    }
}

/// Hyper service for the proxy port: `/debug/config` reads the store,
/// everything else goes through the proxy engine.
pub struct RouterService {
    engine: Arc<ProxyEngine>,
    store: Arc<ConfigStore>,
}

impl RouterService {
    pub fn new(engine: Arc<ProxyEngine>, store: Arc<ConfigStore>) -> Self {
        Self { engine, store }
    }
}

impl Service<Request<Incoming>> for RouterService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        if req.method() == Method::GET && req.uri().path() == "/debug/config" {
            let store = self.store.clone();
            return Box::pin(async move { Ok(debug::config_response(&store.current())) });
        }

        let engine = self.engine.clone();
        Box::pin(async move { Ok(engine.handle(req).await) })
    }
}

/// Builds the per-placement runtime state, keeps it reconciled against
/// snapshot replacements, and serves until `shutdown` fires.
pub async fn run(
    config: RouterConfig,
    store: Arc<ConfigStore>,
    shutdown: CancellationToken,
) -> Result<(), RouterError> {
    let health = Arc::new(HealthMonitor::new(shutdown.clone()));
    let circuit = Arc::new(CircuitBreakerSet::new());
    let limits = Arc::new(AdmissionController::new());

    apply_all(&store.current(), &health, &circuit, &limits);
    tokio::spawn(reconcile(
        store.clone(),
        health.clone(),
        circuit.clone(),
        limits.clone(),
        shutdown.clone(),
    ));

    let engine = Arc::new(ProxyEngine::new(
        store.clone(),
        health,
        circuit,
        limits,
    ));
    let service = RouterService::new(engine, store);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(host = %config.host, port = config.port, "router listening");
    shared::http::serve(listener, service, shutdown, config.drain_grace).await?;
    Ok(())
}

fn apply_all(
    snapshot: &Snapshot,
    health: &HealthMonitor,
    circuit: &CircuitBreakerSet,
    limits: &AdmissionController,
) {
    health.apply(snapshot);
    circuit.apply(snapshot);
    limits.apply(snapshot);
}

/// Re-applies per-placement state whenever a new snapshot is published.
async fn reconcile(
    store: Arc<ConfigStore>,
    health: Arc<HealthMonitor>,
    circuit: Arc<CircuitBreakerSet>,
    limits: Arc<AdmissionController>,
    shutdown: CancellationToken,
) {
    let mut events = store.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    apply_all(&store.current(), &health, &circuit, &limits);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
