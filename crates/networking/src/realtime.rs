//! Realtime change channel
//!
//! The backend pushes insert/update/delete notifications per table. The sync
//! engine treats these as a freshness optimization only: a dropped channel is
//! never replayed, the next reconciliation catches up instead.
//!
//! Wire protocol over WebSocket:
//! - client sends `{"type": "subscribe", "table": ..., "owner_id": ...}`
//! - server sends `{"type": "insert" | "update" | "delete", "table": ...,
//!   "record": {...}, "old_record": {"id": ...}}`
//! - any other message type (acks, heartbeats) is ignored

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use storage::Record;
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::remote::RemoteConfig;

/// Realtime channel errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Could not open the channel
    #[error("Failed to connect realtime channel: {0}")]
    Connect(String),

    /// Channel dropped after opening
    #[error("Realtime channel dropped: {0}")]
    Dropped(String),

    /// Invalid realtime endpoint
    #[error("Invalid realtime URL: {0}")]
    InvalidUrl(String),
}

/// Kind of remote change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Record created
    Insert,
    /// Record modified
    Update,
    /// Record removed
    Delete,
}

/// A single change notification
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What happened
    pub kind: ChangeKind,
    /// Remote table
    pub table: String,
    /// New row for inserts and updates
    pub record: Option<Record>,
    /// Id of the removed row for deletes
    pub old_id: Option<String>,
}

impl ChangeEvent {
    /// Insert or update event
    pub fn upsert(kind: ChangeKind, table: impl Into<String>, record: Record) -> Self {
        Self {
            kind,
            table: table.into(),
            record: Some(record),
            old_id: None,
        }
    }

    /// Delete event
    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            record: None,
            old_id: Some(id.into()),
        }
    }
}

/// Stream of change notifications; a dropped or closed channel ends it with an error
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, SubscriptionError>>;

/// Opens per-table change channels
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Subscribe to changes of one table, scoped to an owner
    async fn subscribe(
        &self,
        table: &str,
        owner_id: &str,
    ) -> Result<ChangeStream, SubscriptionError>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    Insert { table: String, record: Value },
    Update { table: String, record: Value },
    Delete { table: String, old_record: Value },
    #[serde(other)]
    Other,
}

/// Parse one server text frame; `None` for control or malformed messages
pub fn parse_server_message(text: &str) -> Option<ChangeEvent> {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::trace!(error = %e, "ignoring unparseable realtime message");
            return None;
        }
    };

    match message {
        ServerMessage::Insert { table, record } => {
            Record::from_value(record)
                .ok()
                .map(|r| ChangeEvent::upsert(ChangeKind::Insert, table, r))
        }
        ServerMessage::Update { table, record } => {
            Record::from_value(record)
                .ok()
                .map(|r| ChangeEvent::upsert(ChangeKind::Update, table, r))
        }
        ServerMessage::Delete { table, old_record } => old_record
            .get("id")
            .and_then(Value::as_str)
            .map(|id| ChangeEvent::delete(table, id)),
        ServerMessage::Other => None,
    }
}

/// WebSocket implementation of [`RealtimeTransport`]
pub struct WebSocketTransport {
    config: RemoteConfig,
}

impl WebSocketTransport {
    /// Create a transport for the given backend
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    /// Resolve the realtime endpoint
    ///
    /// Uses `realtime_url` when set, otherwise swaps the service URL's scheme
    /// to ws/wss and appends `/realtime/v1/websocket`.
    pub fn endpoint(&self) -> Result<Url, SubscriptionError> {
        let raw = match &self.config.realtime_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/realtime/v1/websocket",
                self.config.service_url.trim_end_matches('/')
            ),
        };
        let mut url = Url::parse(&raw).map_err(|e| SubscriptionError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| SubscriptionError::InvalidUrl(raw.clone()))?;
        }
        if !self.config.api_key.is_empty() {
            url.query_pairs_mut().append_pair("apikey", &self.config.api_key);
        }
        Ok(url)
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn subscribe(
        &self,
        table: &str,
        owner_id: &str,
    ) -> Result<ChangeStream, SubscriptionError> {
        let url = self.endpoint()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.bearer()))
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        tracing::debug!(table, owner_id, "connecting realtime channel");
        let (ws_stream, _) =
            connect_async(request).await.map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_msg = serde_json::json!({
            "type": "subscribe",
            "table": table,
            "owner_id": owner_id,
        });
        write
            .send(Message::Text(subscribe_msg.to_string().into()))
            .await
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;

        let table = table.to_string();
        let stream = async_stream::try_stream! {
            while let Some(msg) = read.next().await {
                let msg = msg.map_err(|e| SubscriptionError::Dropped(e.to_string()))?;
                match msg {
                    Message::Text(text) => {
                        if let Some(event) = parse_server_message(text.as_str()) {
                            if event.table == table {
                                yield event;
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        write
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|e| SubscriptionError::Dropped(e.to_string()))?;
                    }
                    Message::Close(frame) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        Err::<(), _>(SubscriptionError::Dropped(reason))?;
                    }
                    _ => {}
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_insert() {
        let text = r#"{"type":"insert","table":"orders","record":{
            "id":"o1","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z",
            "owner_id":"a","total":12}}"#;
        let event = parse_server_message(text).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.table, "orders");
        assert_eq!(event.record.unwrap().id, "o1");
    }

    #[test]
    fn test_parse_delete() {
        let text = r#"{"type":"delete","table":"orders","old_record":{"id":"o1"}}"#;
        let event = parse_server_message(text).unwrap();
        assert_eq!(event, ChangeEvent::delete("orders", "o1"));
    }

    #[test]
    fn test_parse_ignores_control_and_garbage() {
        assert!(parse_server_message(r#"{"type":"subscribed","table":"orders"}"#).is_none());
        assert!(parse_server_message("not json").is_none());
        assert!(parse_server_message(r#"{"type":"update","table":"orders","record":{"id":"x"}}"#)
            .is_none());
    }

    #[test]
    fn test_endpoint_derived_from_service_url() {
        let transport = WebSocketTransport::new(
            RemoteConfig::new("https://pos.example.com/").with_api_key("anon"),
        );
        let url = transport.endpoint().unwrap();
        assert_eq!(url.as_str(), "wss://pos.example.com/realtime/v1/websocket?apikey=anon");
    }

    #[test]
    fn test_endpoint_explicit() {
        let transport = WebSocketTransport::new(
            RemoteConfig::new("http://localhost:54321").with_realtime_url("ws://127.0.0.1:9000/rt"),
        );
        assert_eq!(transport.endpoint().unwrap().as_str(), "ws://127.0.0.1:9000/rt");
    }

    #[test]
    fn test_endpoint_invalid() {
        let transport =
            WebSocketTransport::new(RemoteConfig::new("http://x").with_realtime_url("::nope::"));
        assert!(matches!(transport.endpoint(), Err(SubscriptionError::InvalidUrl(_))));
    }
}
