//! HTTP plumbing shared by axon services: the accept loop with graceful
//! drain, hop-by-hop header hygiene for proxied messages, and canned error
//! responses.

use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PROXY_NAME: &str = "axon";

/// Peer address of the inbound connection. The accept loop stashes this in
/// request extensions so handlers can append to X-Forwarded-For.
#[derive(Clone, Copy, Debug)]
pub struct PeerAddr(pub SocketAddr);

/// Per-connection wrapper that tags every request with the peer address
/// before delegating to the shared service.
struct ConnService<S> {
    inner: Arc<S>,
    peer: SocketAddr,
}

impl<S, B> Service<Request<Incoming>> for ConnService<S>
where
    S: Service<Request<Incoming>, Response = Response<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, mut req: Request<Incoming>) -> Self::Future {
        req.extensions_mut().insert(PeerAddr(self.peer));
        self.inner.call(req)
    }
}

/// Serves `service` on an already-bound listener until `shutdown` fires,
/// then drains in-flight connections for up to `grace` before returning.
///
/// Binding is left to the caller so a bind failure stays a bootstrap error.
pub async fn serve<S, B>(
    listener: TcpListener,
    service: S,
    shutdown: CancellationToken,
    grace: Duration,
) -> std::io::Result<()>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let service = Arc::new(service);
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let _ = stream.set_nodelay(true);
                let io = TokioIo::new(stream);
                let svc = ConnService { inner: service.clone(), peer };

                // Hand the connection to hyper; auto-detect h1/h2 on this socket.
                let conn = Builder::new(TokioExecutor::new())
                    .serve_connection(io, svc)
                    .into_owned();
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    let _ = conn.await;
                });
            }
        }
    }

    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(grace) => {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "drain grace expired, closing remaining connections"
            );
        }
    }
    Ok(())
}

// Hop-by-hop headers are connection-scoped and must not be forwarded: the
// RFC 7230 set, anything the Connection header lists, and keep-alive before
// HTTP/1.1. HTTP/2+ has no hop-by-hop headers. Applied to proxied messages
// in both directions.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if version >= Version::HTTP_2 {
        return headers;
    }

    let mut drop_set: HashSet<HeaderName> = [
        CONNECTION,
        TRANSFER_ENCODING,
        TE,
        TRAILER,
        UPGRADE,
        PROXY_AUTHORIZATION,
        PROXY_AUTHENTICATE,
    ]
    .into_iter()
    .collect();
    if version < Version::HTTP_11 {
        drop_set.insert(HeaderName::from_static("keep-alive"));
    }
    let connection_listed = headers
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok());
    drop_set.extend(connection_listed);

    for name in drop_set {
        headers.remove(&name);
    }
    headers
}

fn via_protocol(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}

/// Appends this proxy to the Via chain, collapsing any multi-line chain into
/// one header. Applied in both directions.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let Some(protocol) = via_protocol(version) else {
        tracing::warn!(?version, "unknown HTTP version, skipping Via header");
        return;
    };

    let mut chain: Vec<String> = headers
        .get_all(VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_owned)
        .collect();
    chain.push(format!("{protocol} {PROXY_NAME}"));

    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(VIA, value);
    }
}

/// Canned error response with the status canonical reason as body.
pub fn error_response<E>(status: StatusCode) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    let reason = status.canonical_reason().unwrap_or("error");
    error_response_msg(status, reason)
}

/// Canned error response with a caller-supplied human-readable body.
pub fn error_response_msg<E>(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    let body = Full::new(Bytes::from(format!("{message}\n")))
        .map_err(|e| match e {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
