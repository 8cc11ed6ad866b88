//! Protocol translator
//!
//! Turns raw protocol lines from one connection into [`NetworkEventRecord`]s.
//! The translator does no I/O. It keeps two pieces of per-connection state:
//!
//! - the offset between the device's wall clock and monotonic clock, fixed by
//!   the first message carrying both, so later messages that only carry a
//!   monotonic timestamp still get a wall time;
//! - the set of requests whose response is an event stream, so their generic
//!   `loadingFinished`/`loadingFailed` become a stream-closed record with the
//!   accumulated event and byte counts.

use std::collections::HashMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::protocol::{
    methods, parse_wire_message, WireMessage, CANCELLED_REASON, CLOSE_OPCODE,
};
use crate::records::*;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Response to a command the host sent
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub id: u64,
    /// `Err` carries the error message reported by the app
    pub outcome: Result<Value, String>,
}

/// Output of [`ProtocolTranslator::translate`]
#[derive(Debug, Clone, PartialEq)]
pub enum TranslatedMessage {
    Event(NetworkEventRecord),
    CommandResult(CommandResult),
}

#[derive(Debug, Default, Clone, Copy)]
struct StreamProgress {
    events: u64,
    bytes: u64,
}

/// Per-connection decoder
#[derive(Debug, Default)]
pub struct ProtocolTranslator {
    clock_offset_ms: Option<i64>,
    streams: HashMap<String, StreamProgress>,
}

impl ProtocolTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset (wall ms minus monotonic ms) once one has been observed
    pub fn clock_offset_ms(&self) -> Option<i64> {
        self.clock_offset_ms
    }

    /// Decode one protocol line. Never fails; see [`UnknownMessage`].
    pub fn translate(&mut self, line: &str) -> TranslatedMessage {
        match parse_wire_message(line) {
            WireMessage::Event { method, params } => {
                TranslatedMessage::Event(self.translate_event(&method, params, line))
            }
            WireMessage::CommandResult { id, outcome } => {
                TranslatedMessage::CommandResult(CommandResult { id, outcome })
            }
            WireMessage::Unrecognized { claimed_type } => {
                TranslatedMessage::Event(unknown(claimed_type, line))
            }
        }
    }

    fn translate_event(&mut self, method: &str, params: Value, raw: &str) -> NetworkEventRecord {
        let wall_time_ms = self.resolve_wall_time(&params);

        let record = match method {
            methods::HELLO => decode::<HelloParams>(params).map(|p| {
                NetworkEventRecord::Hello(Hello {
                    schema_version: p.schema_version,
                    package_name: p.package_name,
                    process_name: p.process_name,
                    pid: p.pid,
                    features: p.features,
                })
            }),
            methods::LIFECYCLE => decode::<LifecycleParams>(params).map(|p| {
                NetworkEventRecord::Lifecycle(Lifecycle {
                    state: p.state,
                    wall_time_ms,
                })
            }),
            methods::APP_ICON => decode::<AppIconParams>(params).map(|p| {
                NetworkEventRecord::AppIcon(AppIcon {
                    package_name: p.package_name,
                    width: p.width,
                    height: p.height,
                    base64_data: p.base64_data,
                })
            }),
            methods::REPLAY_COMPLETE => Some(NetworkEventRecord::ReplayComplete),
            methods::REQUEST_WILL_BE_SENT => decode::<RequestParams>(params).map(|p| {
                let has_body = p.request.post_data.is_some();
                NetworkEventRecord::RequestWillBeSent(RequestWillBeSent {
                    request_id: p.request_id,
                    wall_time_ms,
                    url: p.request.url,
                    method: p.request.method,
                    headers: p.request.headers,
                    post_data: p.request.post_data,
                    has_post_data: p.request.has_post_data || has_body,
                    body_size: p.request.body_size,
                    body_encoding: has_body
                        .then(|| BodyEncoding::from_base64_flag(p.request.base64_encoded)),
                })
            }),
            methods::RESPONSE_RECEIVED => self.response_received(params, wall_time_ms),
            methods::LOADING_FINISHED => self.loading_finished(params, wall_time_ms),
            methods::LOADING_FAILED => self.loading_failed(params, wall_time_ms),
            methods::EVENT_SOURCE_MESSAGE_RECEIVED => self.stream_event(params, wall_time_ms),
            methods::WEB_SOCKET_CREATED => decode::<WebSocketCreatedParams>(params).map(|p| {
                NetworkEventRecord::WebSocketWillOpen(WebSocketWillOpen {
                    socket_id: p.request_id,
                    wall_time_ms,
                    url: p.url,
                    headers: p.headers,
                })
            }),
            methods::WEB_SOCKET_HANDSHAKE_RESPONSE_RECEIVED => {
                decode::<HandshakeParams>(params).map(|p| {
                    NetworkEventRecord::WebSocketOpened(WebSocketOpened {
                        socket_id: p.request_id,
                        wall_time_ms,
                        status: p.response.status,
                        headers: p.response.headers,
                    })
                })
            }
            methods::WEB_SOCKET_FRAME_SENT => decode::<FrameParams>(params)
                .map(|p| frame_record(p, FrameDirection::Sent, wall_time_ms)),
            methods::WEB_SOCKET_FRAME_RECEIVED => decode::<FrameParams>(params)
                .map(|p| frame_record(p, FrameDirection::Received, wall_time_ms)),
            methods::WEB_SOCKET_CLOSED => decode::<ClosedParams>(params).map(|p| {
                let cancelled = p.code.is_none()
                    && p.reason
                        .as_deref()
                        .is_some_and(|r| r.eq_ignore_ascii_case(CANCELLED_REASON));
                if cancelled {
                    NetworkEventRecord::WebSocketCancelled(WebSocketCancelled {
                        socket_id: p.request_id,
                        wall_time_ms,
                    })
                } else {
                    NetworkEventRecord::WebSocketClosed(WebSocketClosed {
                        socket_id: p.request_id,
                        wall_time_ms,
                        code: p.code,
                        reason: p.reason,
                    })
                }
            }),
            methods::WEB_SOCKET_FRAME_ERROR => decode::<FrameErrorParams>(params).map(|p| {
                NetworkEventRecord::WebSocketFailed(WebSocketFailed {
                    socket_id: p.request_id,
                    wall_time_ms,
                    error_message: p.error_message,
                })
            }),
            _ => None,
        };

        record.unwrap_or_else(|| {
            debug!("Unmapped or malformed {} message", method);
            unknown(Some(method.to_string()), raw)
        })
    }

    fn response_received(&mut self, params: Value, wall_time_ms: i64) -> Option<NetworkEventRecord> {
        let p = decode::<ResponseParams>(params)?;
        let has_body = p.response.body.is_some();
        let response = ResponseReceived {
            request_id: p.request_id,
            wall_time_ms,
            url: p.response.url,
            status: p.response.status,
            status_text: p.response.status_text,
            headers: p.response.headers,
            mime_type: p.response.mime_type,
            body: p.response.body,
            body_size: p.response.body_size,
            body_encoding: has_body
                .then(|| BodyEncoding::from_base64_flag(p.response.base64_encoded)),
        };
        if response.is_event_stream() {
            self.streams
                .entry(response.request_id.clone())
                .or_default();
        }
        Some(NetworkEventRecord::ResponseReceived(response))
    }

    fn stream_event(&mut self, params: Value, wall_time_ms: i64) -> Option<NetworkEventRecord> {
        let p = decode::<EventSourceParams>(params)?;
        let progress = self.streams.entry(p.request_id.clone()).or_default();
        progress.events += 1;
        progress.bytes += p.data.len() as u64;
        Some(NetworkEventRecord::ResponseStreamEvent(ResponseStreamEvent {
            request_id: p.request_id,
            wall_time_ms,
            sequence: p.sequence.unwrap_or(progress.events),
            event_name: p.event_name,
            event_id: p.event_id,
            data: p.data,
        }))
    }

    fn loading_finished(&mut self, params: Value, wall_time_ms: i64) -> Option<NetworkEventRecord> {
        let p = decode::<LoadingFinishedParams>(params)?;
        let record = match self.streams.remove(&p.request_id) {
            Some(progress) => NetworkEventRecord::ResponseStreamClosed(ResponseStreamClosed {
                request_id: p.request_id,
                wall_time_ms,
                reason: StreamCloseReason::Completed,
                error: None,
                total_events: progress.events,
                total_bytes: progress.bytes,
            }),
            None => NetworkEventRecord::RequestFinished(RequestFinished {
                request_id: p.request_id,
                wall_time_ms,
                encoded_data_length: p.encoded_data_length,
            }),
        };
        Some(record)
    }

    fn loading_failed(&mut self, params: Value, wall_time_ms: i64) -> Option<NetworkEventRecord> {
        let p = decode::<LoadingFailedParams>(params)?;
        let record = match self.streams.remove(&p.request_id) {
            Some(progress) => NetworkEventRecord::ResponseStreamClosed(ResponseStreamClosed {
                request_id: p.request_id,
                wall_time_ms,
                reason: if p.canceled {
                    StreamCloseReason::Cancelled
                } else {
                    StreamCloseReason::Failed
                },
                error: Some(p.error_text),
                total_events: progress.events,
                total_bytes: progress.bytes,
            }),
            None => NetworkEventRecord::RequestFailed(RequestFailed {
                request_id: p.request_id,
                wall_time_ms,
                error_text: p.error_text,
                canceled: p.canceled,
            }),
        };
        Some(record)
    }

    fn resolve_wall_time(&mut self, params: &Value) -> i64 {
        let wall = params.get("wallTimeMs").and_then(as_i64_lossy);
        let monotonic_ms = params
            .get("monotonicNs")
            .and_then(as_i64_lossy)
            .map(|ns| ns / NANOS_PER_MILLI);

        match (wall, monotonic_ms) {
            (Some(wall), Some(monotonic)) => {
                if self.clock_offset_ms.is_none() {
                    self.clock_offset_ms = Some(wall - monotonic);
                }
                wall
            }
            (Some(wall), None) => wall,
            (None, Some(monotonic)) => match self.clock_offset_ms {
                Some(offset) => monotonic + offset,
                None => Utc::now().timestamp_millis(),
            },
            (None, None) => Utc::now().timestamp_millis(),
        }
    }
}

fn frame_record(p: FrameParams, direction: FrameDirection, wall_time_ms: i64) -> NetworkEventRecord {
    if p.response.opcode == CLOSE_OPCODE {
        if let Some(code) = p.response.close_code {
            let frame = WebSocketCloseFrame {
                socket_id: p.request_id,
                wall_time_ms,
                code,
                reason: p.response.close_reason,
            };
            return match direction {
                FrameDirection::Sent => NetworkEventRecord::WebSocketCloseRequested(frame),
                FrameDirection::Received => NetworkEventRecord::WebSocketClosing(frame),
            };
        }
    }

    let message = WebSocketMessage {
        socket_id: p.request_id,
        wall_time_ms,
        direction,
        opcode: p.response.opcode,
        payload: p.response.payload_data,
        payload_size: p.response.payload_size,
    };
    match direction {
        FrameDirection::Sent => NetworkEventRecord::WebSocketMessageSent(message),
        FrameDirection::Received => NetworkEventRecord::WebSocketMessageReceived(message),
    }
}

fn unknown(claimed_type: Option<String>, raw: &str) -> NetworkEventRecord {
    NetworkEventRecord::Unknown(UnknownMessage {
        claimed_type,
        raw: raw.to_string(),
    })
}

fn decode<T: DeserializeOwned>(params: Value) -> Option<T> {
    serde_json::from_value(params).ok()
}

fn as_i64_lossy(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelloParams {
    schema_version: u32,
    package_name: String,
    process_name: Option<String>,
    pid: Option<u32>,
    #[serde(default)]
    features: Vec<String>,
}

#[derive(Deserialize)]
struct LifecycleParams {
    state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppIconParams {
    package_name: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    base64_data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestParams {
    request_id: String,
    request: RequestPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestPayload {
    url: String,
    method: String,
    #[serde(default)]
    headers: Vec<HttpHeader>,
    post_data: Option<String>,
    #[serde(default)]
    has_post_data: bool,
    body_size: Option<u64>,
    #[serde(default)]
    base64_encoded: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseParams {
    request_id: String,
    response: ResponsePayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePayload {
    url: Option<String>,
    status: u16,
    status_text: Option<String>,
    #[serde(default)]
    headers: Vec<HttpHeader>,
    mime_type: Option<String>,
    body: Option<String>,
    body_size: Option<u64>,
    #[serde(default)]
    base64_encoded: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFinishedParams {
    request_id: String,
    encoded_data_length: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFailedParams {
    request_id: String,
    #[serde(default)]
    error_text: String,
    #[serde(default)]
    canceled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventSourceParams {
    request_id: String,
    sequence: Option<u64>,
    event_name: Option<String>,
    event_id: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebSocketCreatedParams {
    request_id: String,
    url: String,
    #[serde(default)]
    headers: Vec<HttpHeader>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeParams {
    request_id: String,
    response: HandshakePayload,
}

#[derive(Deserialize)]
struct HandshakePayload {
    status: u16,
    #[serde(default)]
    headers: Vec<HttpHeader>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameParams {
    request_id: String,
    response: FramePayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FramePayload {
    opcode: u8,
    #[serde(default)]
    payload_data: String,
    payload_size: Option<u64>,
    close_code: Option<u16>,
    close_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosedParams {
    request_id: String,
    code: Option<u16>,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameErrorParams {
    request_id: String,
    error_message: String,
}
