//! Read-only debug surface: which config is live and where it came from.

use crate::{BoxError, ProxyBody};
use confsync::snapshot::Snapshot;
use http::header::{CONTENT_TYPE, HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use shared::http::error_response;

#[derive(Serialize)]
struct DebugConfig<'a> {
    version: &'a str,
    source: &'a str,
    last_reload_at: String,
}

/// Body of `GET /debug/config`.
pub fn config_response(snapshot: &Snapshot) -> Response<ProxyBody> {
    let payload = DebugConfig {
        version: &snapshot.version,
        source: snapshot.source.as_str(),
        last_reload_at: humantime::format_rfc3339_seconds(snapshot.admitted_at).to_string(),
    };

    let json = match serde_json::to_vec(&payload) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(error = %err, "could not serialize debug config");
            return error_response::<BoxError>(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut response = Response::new(
        Full::new(Bytes::from(json))
            .map_err(|e| match e {})
            .boxed(),
    );
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use confsync::model::ConfigDocument;
    use confsync::snapshot::ConfigSource;

    #[tokio::test]
    async fn reports_version_and_source() {
        let doc: ConfigDocument = serde_json::from_str(
            r#"{
                "version": "1.2.3",
                "routingTable": {},
                "placements": {"tier3": {"url": "http://u-t3"}},
                "defaultPlacement": "tier3"
            }"#,
        )
        .unwrap();
        let snapshot = Snapshot::from_document(doc, ConfigSource::ControlPlane).unwrap();

        let response = config_response(&snapshot);
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["version"], "1.2.3");
        assert_eq!(parsed["source"], "control_plane");
        assert!(parsed["last_reload_at"].as_str().unwrap().contains('T'));
    }
}
