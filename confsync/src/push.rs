//! Push client: a single long-lived WebSocket channel to the control plane.
//!
//! The control plane pushes full `config_snapshot` messages on connect and on
//! every change; the client validates each one through the store and answers
//! with `ack` or `nack`. The client never polls. Connection loss triggers
//! reconnection with exponential backoff; a lost control plane never affects
//! the active snapshot.

use crate::metrics_defs::PUSH_RECONNECTS;
use crate::protocol::{
    AckMessage, ConfigSnapshotMessage, Envelope, NackMessage, Reply, TYPE_CONFIG_SNAPSHOT,
};
use crate::snapshot::ConfigSource;
use crate::store::ConfigStore;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

pub struct PushClient {
    url: String,
    store: Arc<ConfigStore>,
}

impl PushClient {
    pub fn new(url: impl Into<String>, store: Arc<ConfigStore>) -> Self {
        Self {
            url: url.into(),
            store,
        }
    }

    /// Connect-dispatch-reconnect loop. Returns when `shutdown` fires; the
    /// token is observed while connecting, while backing off, and between
    /// frames.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = BASE_BACKOFF;

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return,
                connected = connect_async(self.url.as_str()) => connected,
            };

            let stream = match connected {
                Ok((stream, _response)) => stream,
                Err(err) => {
                    tracing::warn!(
                        url = %self.url,
                        error = %err,
                        retry_in_secs = backoff.as_secs(),
                        "control plane connect failed"
                    );
                    metrics::counter!(PUSH_RECONNECTS.name, "outcome" => "failed").increment(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            backoff = BASE_BACKOFF;
            tracing::info!(url = %self.url, "connected to control plane");
            metrics::counter!(PUSH_RECONNECTS.name, "outcome" => "connected").increment(1);

            self.drive(stream, &shutdown).await;
            if shutdown.is_cancelled() {
                return;
            }
            tracing::warn!(url = %self.url, "control plane connection lost");
        }
    }

    /// Reads frames until the connection drops or shutdown fires.
    async fn drive(
        &self,
        mut stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        shutdown: &CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = stream.close(None).await;
                    return;
                }
                frame = stream.next() => frame,
            };

            match frame {
                None => return,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "push channel read failed");
                    return;
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = self.handle_frame(&text) {
                        let json = match serde_json::to_string(&reply) {
                            Ok(json) => json,
                            Err(err) => {
                                tracing::error!(error = %err, "could not serialize reply");
                                continue;
                            }
                        };
                        if stream.send(Message::Text(json)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => return,
                // Pings are answered by the protocol layer; binary frames are
                // not part of the protocol.
                Some(Ok(_)) => {}
            }
        }
    }

    /// Dispatches one inbound frame; the returned reply, if any, is written
    /// back on the channel.
    fn handle_frame(&self, text: &str) -> Option<Reply> {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable push message, ignoring");
                return None;
            }
        };

        if envelope.kind != TYPE_CONFIG_SNAPSHOT {
            tracing::warn!(kind = %envelope.kind, "unknown push message type, ignoring");
            return None;
        }

        let version = envelope.version.unwrap_or_default();
        let message: ConfigSnapshotMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(version = %version, error = %err, "malformed config snapshot");
                return Some(Reply::Nack(NackMessage::new(version, err.to_string())));
            }
        };

        match self
            .store
            .try_replace(message.document, ConfigSource::ControlPlane)
        {
            Ok(event) => {
                tracing::info!(version = %event.new_version, "applied pushed config snapshot");
                Some(Reply::Ack(AckMessage::new(event.new_version)))
            }
            Err(err) => {
                tracing::warn!(version = %version, error = %err, "rejected pushed config snapshot");
                Some(Reply::Nack(NackMessage::new(version, err.to_string())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConfigDocument;
    use crate::snapshot::Snapshot;
    use tokio::net::TcpListener;

    fn store_with_version(version: &str) -> Arc<ConfigStore> {
        let doc: ConfigDocument = serde_json::from_str(&format!(
            r#"{{
                "version": "{version}",
                "routingTable": {{}},
                "placements": {{"tier3": {{"url": "http://u-t3"}}}},
                "defaultPlacement": "tier3"
            }}"#
        ))
        .unwrap();
        let snapshot = Snapshot::from_document(doc, ConfigSource::File).unwrap();
        Arc::new(ConfigStore::new(snapshot))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = BASE_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn valid_snapshot_is_acked_and_applied() {
        let store = store_with_version("1");
        let client = PushClient::new("ws://unused", store.clone());

        let reply = client.handle_frame(
            r#"{
                "type": "config_snapshot",
                "version": "2",
                "routingTable": {},
                "placements": {"tier3": {"url": "http://u-t3"}},
                "defaultPlacement": "tier3"
            }"#,
        );

        assert_eq!(reply, Some(Reply::Ack(AckMessage::new("2"))));
        assert_eq!(store.current().version, "2");
        assert_eq!(store.current().source, ConfigSource::ControlPlane);
    }

    #[test]
    fn invalid_snapshot_is_nacked_and_not_applied() {
        let store = store_with_version("1");
        let client = PushClient::new("ws://unused", store.clone());

        let reply = client.handle_frame(
            r#"{
                "type": "config_snapshot",
                "version": "2",
                "routingTable": {"a": "ghost"},
                "placements": {"tier3": {"url": "http://u-t3"}},
                "defaultPlacement": "tier3"
            }"#,
        );

        match reply {
            Some(Reply::Nack(nack)) => {
                assert_eq!(nack.version, "2");
                assert!(nack.error.contains("ghost"));
            }
            other => panic!("expected nack, got {other:?}"),
        }
        assert_eq!(store.current().version, "1");
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let store = store_with_version("1");
        let client = PushClient::new("ws://unused", store.clone());

        let reply = client.handle_frame(r#"{"type": "rebalance", "version": "9"}"#);
        assert!(reply.is_none());
        assert_eq!(store.current().version, "1");
    }

    #[test]
    fn garbage_frame_is_ignored() {
        let store = store_with_version("1");
        let client = PushClient::new("ws://unused", store.clone());
        assert!(client.handle_frame("not json").is_none());
    }

    #[tokio::test]
    async fn acks_over_a_live_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{
                    "type": "config_snapshot",
                    "version": "2",
                    "routingTable": {},
                    "placements": {"tier3": {"url": "http://u-t3"}},
                    "defaultPlacement": "tier3"
                }"#
                .to_string(),
            ))
            .await
            .unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            let _ = reply_tx.send(reply.into_text().unwrap());
        });

        let store = store_with_version("1");
        let shutdown = CancellationToken::new();
        let client = PushClient::new(format!("ws://{addr}"), store.clone());
        let task = tokio::spawn(client.run(shutdown.clone()));

        let reply = reply_rx.await.unwrap();
        let ack: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["version"], "2");
        assert_eq!(store.current().version, "2");

        shutdown.cancel();
        task.await.unwrap();
    }
}
