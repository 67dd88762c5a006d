//! The per-request pipeline: resolve, admit, gate on circuit and health,
//! stream to the upstream, account the outcome.
//!
//! Every step either resolves the request (writes a response and returns) or
//! is transparent; nothing is logged-and-rethrown. Exactly one structured
//! completion record is emitted per request, on every exit path including
//! client cancellation.

use crate::circuit::{CircuitGuard, CircuitState};
use crate::health::{HealthState, HealthView};
use crate::limits::{AdmissionController, SlotGuard};
use crate::metrics_defs::{ADMISSION_REJECTED, FAILOVERS, REQUEST_DURATION};
use crate::resolve::{self, RouteDecision};
use crate::{BoxError, ProxyBody};
use confsync::snapshot::Snapshot;
use confsync::store::ConfigStore;
use http::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::http::{PeerAddr, add_via_header, error_response_msg, filter_hop_by_hop};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use url::Url;

pub const HEADER_ROUTING_KEY: &str = "x-routing-key";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const HEADER_ROUTED_TO: &str = "x-routed-to";
pub const HEADER_ROUTE_REASON: &str = "x-route-reason";
pub const HEADER_FAILOVER_REASON: &str = "x-failover-reason";
pub const HEADER_CIRCUIT_STATE: &str = "x-circuit-state";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailoverReason {
    CircuitOpen,
    UpstreamUnhealthy,
}

impl FailoverReason {
    const fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::CircuitOpen => "circuit_open",
            FailoverReason::UpstreamUnhealthy => "upstream_unhealthy",
        }
    }
}

pub struct ProxyEngine {
    store: Arc<ConfigStore>,
    health: Arc<dyn HealthView>,
    circuit: Arc<dyn CircuitGuard>,
    limits: Arc<AdmissionController>,
    client: Client<HttpConnector, Incoming>,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<ConfigStore>,
        health: Arc<dyn HealthView>,
        circuit: Arc<dyn CircuitGuard>,
        limits: Arc<AdmissionController>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            store,
            health,
            circuit,
            limits,
            client,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let request_id = request_id(req.headers());
        let mut log = CompletionLog::new(&request_id, req.method().clone(), req.uri().path());

        // 1. The routing key is required.
        let routing_key = match req
            .headers()
            .get(HEADER_ROUTING_KEY)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
        {
            Some(key) => key.to_string(),
            None => {
                log.status = Some(StatusCode::BAD_REQUEST.as_u16());
                return local_response(
                    StatusCode::BAD_REQUEST,
                    "Bad Request: X-Routing-Key header is required",
                    &request_id,
                    None,
                );
            }
        };
        log.routing_key = routing_key.clone();

        // 2-3. One snapshot handle for the whole request; a publish happening
        // mid-request does not affect this one.
        let snapshot = self.store.current();
        let decision = match resolve::resolve(&routing_key, &snapshot) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(
                    request_id = %request_id,
                    routing_key = %routing_key,
                    error = %err,
                    "resolution failed against a validated snapshot"
                );
                log.status = Some(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
                return local_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    &request_id,
                    None,
                );
            }
        };
        log.placement = decision.placement.clone();
        log.route_reason = decision.reason.as_str();
        log.upstream = decision.endpoint.to_string();

        // 4. Concurrency admission; the guard releases the slot on every
        // exit path, including cancellation. On the success path it rides
        // along with the response body until streaming finishes.
        let slot = match self.limits.try_acquire(&decision.placement) {
            Some(slot) => slot,
            None => {
                metrics::counter!(ADMISSION_REJECTED.name, "placement" => decision.placement.clone())
                    .increment(1);
                log.status = Some(StatusCode::TOO_MANY_REQUESTS.as_u16());
                log.reject_reason = "concurrency_limit";
                return local_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too Many Requests: concurrency limit reached",
                    &request_id,
                    Some(&decision),
                );
            }
        };

        // 5. Declared body size against the per-placement cap.
        if let Some(length) = content_length(req.headers()) {
            if length > 0 && !self.limits.check_body_size(&decision.placement, length) {
                log.status = Some(StatusCode::PAYLOAD_TOO_LARGE.as_u16());
                log.reject_reason = "body_size_limit";
                return local_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Payload Too Large",
                    &request_id,
                    Some(&decision),
                );
            }
        }

        // 6-7. Circuit and health gates, with at most one step of failover.
        let mut target = decision.clone();
        let mut failover: Option<FailoverReason> = None;
        let mut circuit_header_state: Option<CircuitState> = None;

        if !self.circuit.allow(&decision.placement) {
            let original_state = self.circuit.state(&decision.placement);
            match fallback_of(&snapshot, &decision.placement) {
                Some((fallback_key, fallback_url)) => {
                    circuit_header_state = Some(original_state);
                    failover = Some(FailoverReason::CircuitOpen);
                    target.placement = fallback_key;
                    target.endpoint = fallback_url;
                }
                None => {
                    log.status = Some(StatusCode::SERVICE_UNAVAILABLE.as_u16());
                    log.reject_reason = "circuit_open";
                    let mut response = local_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Service Unavailable: circuit breaker open",
                        &request_id,
                        Some(&decision),
                    );
                    insert_str_header(
                        response.headers_mut(),
                        HEADER_CIRCUIT_STATE,
                        original_state.as_str(),
                    );
                    return response;
                }
            }
        }

        if failover.is_none() && self.health.state(&decision.placement) == HealthState::Unhealthy {
            if let Some((fallback_key, fallback_url)) = fallback_of(&snapshot, &decision.placement)
            {
                failover = Some(FailoverReason::UpstreamUnhealthy);
                target.placement = fallback_key;
                target.endpoint = fallback_url;
            } else if decision.placement != snapshot.default_placement {
                if let Some(default) = snapshot.placement(&snapshot.default_placement) {
                    failover = Some(FailoverReason::UpstreamUnhealthy);
                    target.placement = snapshot.default_placement.clone();
                    target.endpoint = default.url.clone();
                }
            }
            // The default placement itself being unhealthy with no fallback:
            // attempt it anyway.
        }

        if let Some(reason) = failover {
            metrics::counter!(FAILOVERS.name, "reason" => reason.as_str()).increment(1);
            tracing::info!(
                request_id = %request_id,
                original_placement = %decision.placement,
                failover_placement = %target.placement,
                reason = reason.as_str(),
                "failing over"
            );
            log.placement = target.placement.clone();
            log.upstream = target.endpoint.to_string();
            log.failover_reason = reason.as_str();
        }

        // 8. Build the upstream request; the inbound body is streamed, never
        // buffered.
        let upstream_req = match build_upstream_request(req, &target, &request_id) {
            Ok(upstream_req) => upstream_req,
            Err(err) => {
                tracing::error!(request_id = %request_id, error = %err, "could not build upstream request");
                log.status = Some(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
                return local_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    &request_id,
                    Some(&decision),
                );
            }
        };

        // 9-11. Execute with the response-header deadline; classify the
        // outcome for the breaker of the placement actually contacted.
        let started = log.started;
        let upstream_result =
            tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, self.client.request(upstream_req)).await;

        let response = match upstream_result {
            Err(_elapsed) => {
                self.circuit.record_failure(&target.placement);
                log.status = Some(StatusCode::GATEWAY_TIMEOUT.as_u16());
                log.reject_reason = "upstream_timeout";
                return local_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Gateway Timeout",
                    &request_id,
                    Some(&target),
                );
            }
            Ok(Err(err)) => {
                self.circuit.record_failure(&target.placement);
                tracing::warn!(
                    request_id = %request_id,
                    placement = %target.placement,
                    upstream = %target.endpoint,
                    error = %err,
                    "upstream transport error"
                );
                log.status = Some(StatusCode::BAD_GATEWAY.as_u16());
                log.reject_reason = "transport_error";
                return local_response(
                    StatusCode::BAD_GATEWAY,
                    "Bad Gateway",
                    &request_id,
                    Some(&target),
                );
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_server_error() {
            self.circuit.record_failure(&target.placement);
        } else {
            self.circuit.record_success(&target.placement);
        }

        // Copy the response through, then attach the explainability headers.
        let (mut parts, body) = response.into_parts();
        filter_hop_by_hop(&mut parts.headers, parts.version);
        add_via_header(&mut parts.headers, parts.version);
        insert_str_header(&mut parts.headers, HEADER_REQUEST_ID, &request_id);
        insert_str_header(&mut parts.headers, HEADER_ROUTED_TO, &target.placement);
        insert_str_header(&mut parts.headers, HEADER_ROUTE_REASON, decision.reason.as_str());
        if let Some(reason) = failover {
            insert_str_header(&mut parts.headers, HEADER_FAILOVER_REASON, reason.as_str());
        }
        let circuit_state =
            circuit_header_state.unwrap_or_else(|| self.circuit.state(&target.placement));
        insert_str_header(&mut parts.headers, HEADER_CIRCUIT_STATE, circuit_state.as_str());

        log.status = Some(status.as_u16());

        // 30 s whole-request budget, counted from arrival, enforced on the
        // streamed response body. The admission slot is released when the
        // body finishes (or is dropped on disconnect).
        let deadline = tokio::time::Instant::from_std(started + REQUEST_DEADLINE);
        let body = RelayBody::new(body, deadline, slot).boxed();
        Response::from_parts(parts, body)
    }
}

/// Propagated request id, or a fresh 128-bit hex id when absent.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(HEADER_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn fallback_of(snapshot: &Snapshot, placement: &str) -> Option<(String, Url)> {
    let fallback = snapshot.placement(placement)?.fallback.clone()?;
    let url = snapshot.placement(&fallback)?.url.clone();
    Some((fallback, url))
}

fn insert_str_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn local_response(
    status: StatusCode,
    message: &str,
    request_id: &str,
    decision: Option<&RouteDecision>,
) -> Response<ProxyBody> {
    let mut response = error_response_msg::<BoxError>(status, message);
    let headers = response.headers_mut();
    insert_str_header(headers, HEADER_REQUEST_ID, request_id);
    if let Some(decision) = decision {
        insert_str_header(headers, HEADER_ROUTED_TO, &decision.placement);
        insert_str_header(headers, HEADER_ROUTE_REASON, decision.reason.as_str());
    }
    response
}

fn build_upstream_request(
    req: Request<Incoming>,
    target: &RouteDecision,
    request_id: &str,
) -> Result<Request<Incoming>, http::Error> {
    let (mut parts, body) = req.into_parts();

    // scheme + authority from the placement, path + query from the inbound
    // request.
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut upstream_url = target.endpoint.clone();
    match path_and_query.split_once('?') {
        Some((path, query)) => {
            upstream_url.set_path(path);
            upstream_url.set_query(Some(query));
        }
        None => {
            upstream_url.set_path(path_and_query);
            upstream_url.set_query(None);
        }
    }
    let uri: Uri = upstream_url.as_str().parse().map_err(http::Error::from)?;

    let inbound_version = parts.version;
    filter_hop_by_hop(&mut parts.headers, inbound_version);
    add_via_header(&mut parts.headers, inbound_version);
    // The upstream's Host comes from the placement URL.
    parts.headers.remove(HOST);

    insert_str_header(&mut parts.headers, HEADER_REQUEST_ID, request_id);

    if let Some(PeerAddr(peer)) = parts.extensions.get::<PeerAddr>() {
        let client_ip = peer.ip().to_string();
        let forwarded = match parts
            .headers
            .get(HEADER_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(prior) => format!("{prior}, {client_ip}"),
            None => client_ip,
        };
        insert_str_header(&mut parts.headers, HEADER_FORWARDED_FOR, &forwarded);
    }

    let proto = if parts.uri.scheme_str() == Some("https") {
        "https"
    } else {
        "http"
    };
    insert_str_header(&mut parts.headers, HEADER_FORWARDED_PROTO, proto);

    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body)
}

/// One structured record per request. Emitted on drop so cancellation (the
/// handler future being dropped) still produces a record, marked as such.
struct CompletionLog {
    request_id: String,
    method: Method,
    path: String,
    routing_key: String,
    placement: String,
    route_reason: &'static str,
    upstream: String,
    failover_reason: &'static str,
    reject_reason: &'static str,
    status: Option<u16>,
    started: Instant,
}

impl CompletionLog {
    fn new(request_id: &str, method: Method, path: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            method,
            path: path.to_string(),
            routing_key: String::new(),
            placement: String::new(),
            route_reason: "",
            upstream: String::new(),
            failover_reason: "",
            reject_reason: "",
            status: None,
            started: Instant::now(),
        }
    }
}

impl Drop for CompletionLog {
    fn drop(&mut self) {
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        match self.status {
            Some(status) => {
                tracing::info!(
                    request_id = %self.request_id,
                    method = %self.method,
                    path = %self.path,
                    routing_key = %self.routing_key,
                    placement = %self.placement,
                    route_reason = self.route_reason,
                    upstream = %self.upstream,
                    status,
                    failover_reason = self.failover_reason,
                    reject_reason = self.reject_reason,
                    duration_ms,
                    "request completed"
                );
                metrics::histogram!(
                    REQUEST_DURATION.name,
                    "status" => status.to_string(),
                    "placement" => self.placement.clone(),
                    "reason" => self.route_reason,
                )
                .record(self.started.elapsed().as_secs_f64());
            }
            None => {
                tracing::info!(
                    request_id = %self.request_id,
                    method = %self.method,
                    path = %self.path,
                    routing_key = %self.routing_key,
                    placement = %self.placement,
                    route_reason = self.route_reason,
                    status = "client_canceled",
                    duration_ms,
                    "request canceled"
                );
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("whole-request deadline exceeded while streaming the upstream response")]
struct DeadlineExceeded;

/// Upstream response body relayed to the client: aborts the stream when the
/// whole-request deadline passes and holds the admission slot until the
/// stream is done. Timeouts are the only backpressure toward upstreams.
struct RelayBody<B> {
    inner: B,
    deadline: Pin<Box<tokio::time::Sleep>>,
    _slot: SlotGuard,
}

impl<B> RelayBody<B> {
    fn new(inner: B, deadline: tokio::time::Instant, slot: SlotGuard) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            _slot: slot,
        }
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(DeadlineExceeded.into())));
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
