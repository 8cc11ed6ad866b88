//! Typed network event records
//!
//! A [`NetworkEventRecord`] is one decoded protocol message. Records are
//! immutable values: stores fold them into aggregates, the registry reads
//! handshake and icon records into server state.

use serde::{Deserialize, Serialize};

use crate::protocol::EVENT_STREAM_MIME;

/// One HTTP header as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Case-insensitive header lookup
pub fn header_value<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// How a captured body string is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Text,
    Base64,
}

impl BodyEncoding {
    pub fn from_base64_flag(base64_encoded: bool) -> Self {
        if base64_encoded {
            BodyEncoding::Base64
        } else {
            BodyEncoding::Text
        }
    }
}

/// Handshake sent by the app when a connection opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub schema_version: u32,
    pub package_name: String,
    pub process_name: Option<String>,
    pub pid: Option<u32>,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub state: String,
    pub wall_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIcon {
    pub package_name: String,
    pub width: u32,
    pub height: u32,
    pub base64_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestWillBeSent {
    pub request_id: String,
    pub wall_time_ms: i64,
    pub url: String,
    pub method: String,
    pub headers: Vec<HttpHeader>,
    pub post_data: Option<String>,
    pub has_post_data: bool,
    pub body_size: Option<u64>,
    pub body_encoding: Option<BodyEncoding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseReceived {
    pub request_id: String,
    pub wall_time_ms: i64,
    pub url: Option<String>,
    pub status: u16,
    pub status_text: Option<String>,
    pub headers: Vec<HttpHeader>,
    pub mime_type: Option<String>,
    pub body: Option<String>,
    pub body_size: Option<u64>,
    pub body_encoding: Option<BodyEncoding>,
}

impl ResponseReceived {
    /// Whether the response is typed as a server-sent event stream
    pub fn is_event_stream(&self) -> bool {
        let content_type = self
            .mime_type
            .as_deref()
            .or_else(|| header_value(&self.headers, "content-type"));
        content_type.is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(EVENT_STREAM_MIME))
        })
    }
}

/// Generic completion marker for a non-streaming request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFinished {
    pub request_id: String,
    pub wall_time_ms: i64,
    pub encoded_data_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFailed {
    pub request_id: String,
    pub wall_time_ms: i64,
    pub error_text: String,
    pub canceled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStreamEvent {
    pub request_id: String,
    pub wall_time_ms: i64,
    pub sequence: u64,
    pub event_name: Option<String>,
    pub event_id: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCloseReason {
    Completed,
    Failed,
    Cancelled,
}

/// Terminal marker for a server-sent event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStreamClosed {
    pub request_id: String,
    pub wall_time_ms: i64,
    pub reason: StreamCloseReason,
    pub error: Option<String>,
    pub total_events: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketWillOpen {
    pub socket_id: String,
    pub wall_time_ms: i64,
    pub url: String,
    pub headers: Vec<HttpHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketOpened {
    pub socket_id: String,
    pub wall_time_ms: i64,
    pub status: u16,
    pub headers: Vec<HttpHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub socket_id: String,
    pub wall_time_ms: i64,
    pub direction: FrameDirection,
    pub opcode: u8,
    pub payload: String,
    pub payload_size: Option<u64>,
}

/// A close frame, either requested locally or received from the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketCloseFrame {
    pub socket_id: String,
    pub wall_time_ms: i64,
    pub code: u16,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketClosed {
    pub socket_id: String,
    pub wall_time_ms: i64,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketFailed {
    pub socket_id: String,
    pub wall_time_ms: i64,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketCancelled {
    pub socket_id: String,
    pub wall_time_ms: i64,
}

/// A message the translator could not map; kept for forward compatibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownMessage {
    pub claimed_type: Option<String>,
    pub raw: String,
}

/// Decoded protocol event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkEventRecord {
    Hello(Hello),
    Lifecycle(Lifecycle),
    AppIcon(AppIcon),
    ReplayComplete,
    RequestWillBeSent(RequestWillBeSent),
    ResponseReceived(ResponseReceived),
    RequestFinished(RequestFinished),
    RequestFailed(RequestFailed),
    ResponseStreamEvent(ResponseStreamEvent),
    ResponseStreamClosed(ResponseStreamClosed),
    WebSocketWillOpen(WebSocketWillOpen),
    WebSocketOpened(WebSocketOpened),
    WebSocketMessageSent(WebSocketMessage),
    WebSocketMessageReceived(WebSocketMessage),
    WebSocketClosing(WebSocketCloseFrame),
    WebSocketClosed(WebSocketClosed),
    WebSocketFailed(WebSocketFailed),
    WebSocketCloseRequested(WebSocketCloseFrame),
    WebSocketCancelled(WebSocketCancelled),
    Unknown(UnknownMessage),
}

impl NetworkEventRecord {
    /// Request id or socket id the record belongs to, if any
    pub fn entity_id(&self) -> Option<&str> {
        use NetworkEventRecord::*;
        match self {
            RequestWillBeSent(r) => Some(&r.request_id),
            ResponseReceived(r) => Some(&r.request_id),
            RequestFinished(r) => Some(&r.request_id),
            RequestFailed(r) => Some(&r.request_id),
            ResponseStreamEvent(r) => Some(&r.request_id),
            ResponseStreamClosed(r) => Some(&r.request_id),
            WebSocketWillOpen(r) => Some(&r.socket_id),
            WebSocketOpened(r) => Some(&r.socket_id),
            WebSocketMessageSent(r) | WebSocketMessageReceived(r) => Some(&r.socket_id),
            WebSocketClosing(r) | WebSocketCloseRequested(r) => Some(&r.socket_id),
            WebSocketClosed(r) => Some(&r.socket_id),
            WebSocketFailed(r) => Some(&r.socket_id),
            WebSocketCancelled(r) => Some(&r.socket_id),
            Hello(_) | Lifecycle(_) | AppIcon(_) | ReplayComplete | Unknown(_) => None,
        }
    }

    /// Wall-clock time of the record in epoch milliseconds, if it carries one
    pub fn wall_time_ms(&self) -> Option<i64> {
        use NetworkEventRecord::*;
        match self {
            Lifecycle(r) => Some(r.wall_time_ms),
            RequestWillBeSent(r) => Some(r.wall_time_ms),
            ResponseReceived(r) => Some(r.wall_time_ms),
            RequestFinished(r) => Some(r.wall_time_ms),
            RequestFailed(r) => Some(r.wall_time_ms),
            ResponseStreamEvent(r) => Some(r.wall_time_ms),
            ResponseStreamClosed(r) => Some(r.wall_time_ms),
            WebSocketWillOpen(r) => Some(r.wall_time_ms),
            WebSocketOpened(r) => Some(r.wall_time_ms),
            WebSocketMessageSent(r) | WebSocketMessageReceived(r) => Some(r.wall_time_ms),
            WebSocketClosing(r) | WebSocketCloseRequested(r) => Some(r.wall_time_ms),
            WebSocketClosed(r) => Some(r.wall_time_ms),
            WebSocketFailed(r) => Some(r.wall_time_ms),
            WebSocketCancelled(r) => Some(r.wall_time_ms),
            Hello(_) | AppIcon(_) | ReplayComplete | Unknown(_) => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        use NetworkEventRecord::*;
        match self {
            Hello(_) => "hello",
            Lifecycle(_) => "lifecycle",
            AppIcon(_) => "app_icon",
            ReplayComplete => "replay_complete",
            RequestWillBeSent(_) => "request_will_be_sent",
            ResponseReceived(_) => "response_received",
            RequestFinished(_) => "request_finished",
            RequestFailed(_) => "request_failed",
            ResponseStreamEvent(_) => "response_stream_event",
            ResponseStreamClosed(_) => "response_stream_closed",
            WebSocketWillOpen(_) => "web_socket_will_open",
            WebSocketOpened(_) => "web_socket_opened",
            WebSocketMessageSent(_) => "web_socket_message_sent",
            WebSocketMessageReceived(_) => "web_socket_message_received",
            WebSocketClosing(_) => "web_socket_closing",
            WebSocketClosed(_) => "web_socket_closed",
            WebSocketFailed(_) => "web_socket_failed",
            WebSocketCloseRequested(_) => "web_socket_close_requested",
            WebSocketCancelled(_) => "web_socket_cancelled",
            Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(mime: Option<&str>, headers: Vec<HttpHeader>) -> ResponseReceived {
        ResponseReceived {
            request_id: "1".to_string(),
            wall_time_ms: 0,
            url: None,
            status: 200,
            status_text: None,
            headers,
            mime_type: mime.map(str::to_string),
            body: None,
            body_size: None,
            body_encoding: None,
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = vec![HttpHeader::new("Content-Length", "0")];
        assert_eq!(header_value(&headers, "content-length"), Some("0"));
        assert_eq!(header_value(&headers, "content-type"), None);
    }

    #[test]
    fn test_event_stream_detection() {
        assert!(response(Some("text/event-stream"), vec![]).is_event_stream());
        assert!(response(
            None,
            vec![HttpHeader::new("Content-Type", "text/event-stream; charset=utf-8")]
        )
        .is_event_stream());
        assert!(!response(Some("application/json"), vec![]).is_event_stream());
        assert!(!response(None, vec![]).is_event_stream());
    }

    #[test]
    fn test_entity_id_and_kind() {
        let record = NetworkEventRecord::WebSocketCancelled(WebSocketCancelled {
            socket_id: "ws-1".to_string(),
            wall_time_ms: 42,
        });
        assert_eq!(record.entity_id(), Some("ws-1"));
        assert_eq!(record.wall_time_ms(), Some(42));
        assert_eq!(record.kind(), "web_socket_cancelled");

        assert_eq!(NetworkEventRecord::ReplayComplete.entity_id(), None);
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let record = NetworkEventRecord::RequestFinished(RequestFinished {
            request_id: "7".to_string(),
            wall_time_ms: 1,
            encoded_data_length: Some(10),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "request_finished");
        assert_eq!(json["request_id"], "7");
    }
}
