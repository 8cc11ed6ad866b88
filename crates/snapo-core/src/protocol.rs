//! Wire protocol types
//!
//! Each connection carries newline-delimited JSON. Inbound lines are either
//! events (`method` + `params`), command results (`id` + `result` or
//! `error.message`), or a `FeatureEvent` envelope wrapping one of those.
//! Outbound lines are feature envelopes built by the helpers below.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method discriminators
pub mod methods {
    pub const HELLO: &str = "Hello";
    pub const LIFECYCLE: &str = "Lifecycle";
    pub const APP_ICON: &str = "AppIcon";
    pub const REPLAY_COMPLETE: &str = "ReplayComplete";

    pub const REQUEST_WILL_BE_SENT: &str = "Network.requestWillBeSent";
    pub const RESPONSE_RECEIVED: &str = "Network.responseReceived";
    pub const LOADING_FINISHED: &str = "Network.loadingFinished";
    pub const LOADING_FAILED: &str = "Network.loadingFailed";
    pub const EVENT_SOURCE_MESSAGE_RECEIVED: &str = "Network.eventSourceMessageReceived";

    pub const WEB_SOCKET_CREATED: &str = "Network.webSocketCreated";
    pub const WEB_SOCKET_HANDSHAKE_RESPONSE_RECEIVED: &str =
        "Network.webSocketHandshakeResponseReceived";
    pub const WEB_SOCKET_FRAME_SENT: &str = "Network.webSocketFrameSent";
    pub const WEB_SOCKET_FRAME_RECEIVED: &str = "Network.webSocketFrameReceived";
    pub const WEB_SOCKET_CLOSED: &str = "Network.webSocketClosed";
    pub const WEB_SOCKET_FRAME_ERROR: &str = "Network.webSocketFrameError";

    pub const GET_REQUEST_POST_DATA: &str = "Network.getRequestPostData";
    pub const GET_RESPONSE_BODY: &str = "Network.getResponseBody";
}

/// Envelope type for feature events sent by the app
pub const FEATURE_EVENT: &str = "FeatureEvent";
/// Envelope type announcing that the host opened a feature
pub const FEATURE_OPENED: &str = "FeatureOpened";
/// Envelope type carrying a host command for a feature
pub const FEATURE_COMMAND: &str = "FeatureCommand";

/// Feature name of the network inspector
pub const NETWORK_FEATURE: &str = "network";

/// WebSocket close opcode
pub const CLOSE_OPCODE: u8 = 8;

/// Mime type of server-sent event streams
pub const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Error message the app returns when it kept no body for a request
pub const NO_BODY_CAPTURED: &str = "No body captured";

/// Reason string marking a cancelled WebSocket
pub const CANCELLED_REASON: &str = "cancelled";

/// A command sent from the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Error half of a command response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandError {
    pub message: String,
}

/// Host-to-app feature envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundEnvelope {
    #[serde(rename = "FeatureOpened")]
    FeatureOpened { feature: String },
    #[serde(rename = "FeatureCommand")]
    FeatureCommand { feature: String, payload: Value },
}

impl OutboundEnvelope {
    /// Serialize as one protocol line, including the trailing newline
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Classified inbound message, before any per-method decoding
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// An event with its method and (possibly empty) params
    Event { method: String, params: Value },
    /// A response to a command sent by the host
    CommandResult {
        id: u64,
        outcome: Result<Value, String>,
    },
    /// Anything that isn't a recognizable message
    Unrecognized { claimed_type: Option<String> },
}

/// Classify one inbound line
///
/// Never fails: malformed input is reported as [`WireMessage::Unrecognized`].
pub fn parse_wire_message(line: &str) -> WireMessage {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => classify(value),
        Err(_) => WireMessage::Unrecognized { claimed_type: None },
    }
}

fn classify(mut value: Value) -> WireMessage {
    let Some(object) = value.as_object_mut() else {
        return WireMessage::Unrecognized { claimed_type: None };
    };

    if object.get("type").and_then(Value::as_str) == Some(FEATURE_EVENT) {
        let feature = object
            .get("feature")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if feature != NETWORK_FEATURE {
            return WireMessage::Unrecognized {
                claimed_type: Some(format!("{FEATURE_EVENT}:{feature}")),
            };
        }
        return match object.remove("payload") {
            Some(payload) => classify(payload),
            None => WireMessage::Unrecognized {
                claimed_type: Some(FEATURE_EVENT.to_string()),
            },
        };
    }

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        let params = object
            .remove("params")
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default()));
        return WireMessage::Event { method, params };
    }

    if let Some(id) = object.get("id").and_then(Value::as_u64) {
        if let Some(error) = object.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            return WireMessage::CommandResult {
                id,
                outcome: Err(message),
            };
        }
        let result = object.remove("result").unwrap_or(Value::Null);
        return WireMessage::CommandResult {
            id,
            outcome: Ok(result),
        };
    }

    WireMessage::Unrecognized {
        claimed_type: object
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Build a network command wrapped for delivery as a feature command
pub fn network_command(id: u64, method: &str, params: Value) -> Value {
    serde_json::to_value(CommandMessage {
        id,
        method: method.to_string(),
        params,
    })
    .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_event() {
        let msg = parse_wire_message(r#"{"method":"Hello","params":{"schemaVersion":1}}"#);
        assert_eq!(
            msg,
            WireMessage::Event {
                method: "Hello".to_string(),
                params: json!({"schemaVersion": 1}),
            }
        );
    }

    #[test]
    fn test_parse_event_without_params() {
        let msg = parse_wire_message(r#"{"method":"ReplayComplete"}"#);
        assert_eq!(
            msg,
            WireMessage::Event {
                method: "ReplayComplete".to_string(),
                params: json!({}),
            }
        );
    }

    #[test]
    fn test_parse_feature_event_envelope() {
        let line = json!({
            "type": "FeatureEvent",
            "feature": "network",
            "payload": {"method": "Network.loadingFinished", "params": {"requestId": "1"}}
        })
        .to_string();

        match parse_wire_message(&line) {
            WireMessage::Event { method, params } => {
                assert_eq!(method, methods::LOADING_FINISHED);
                assert_eq!(params["requestId"], "1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_envelope_for_other_feature() {
        let line = r#"{"type":"FeatureEvent","feature":"prefs","payload":{"method":"x"}}"#;
        assert_eq!(
            parse_wire_message(line),
            WireMessage::Unrecognized {
                claimed_type: Some("FeatureEvent:prefs".to_string())
            }
        );
    }

    #[test]
    fn test_parse_command_results() {
        assert_eq!(
            parse_wire_message(r#"{"id":4,"result":{"body":"hi"}}"#),
            WireMessage::CommandResult {
                id: 4,
                outcome: Ok(json!({"body": "hi"})),
            }
        );
        assert_eq!(
            parse_wire_message(r#"{"id":5,"error":{"message":"No body captured"}}"#),
            WireMessage::CommandResult {
                id: 5,
                outcome: Err(NO_BODY_CAPTURED.to_string()),
            }
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(
            parse_wire_message("not json"),
            WireMessage::Unrecognized { claimed_type: None }
        );
        assert_eq!(
            parse_wire_message("[1,2]"),
            WireMessage::Unrecognized { claimed_type: None }
        );
        assert_eq!(
            parse_wire_message(r#"{"type":"Mystery"}"#),
            WireMessage::Unrecognized {
                claimed_type: Some("Mystery".to_string())
            }
        );
    }

    #[test]
    fn test_outbound_envelopes() {
        let opened = OutboundEnvelope::FeatureOpened {
            feature: NETWORK_FEATURE.to_string(),
        };
        assert_eq!(
            opened.to_line().unwrap(),
            "{\"type\":\"FeatureOpened\",\"feature\":\"network\"}\n"
        );

        let command = OutboundEnvelope::FeatureCommand {
            feature: NETWORK_FEATURE.to_string(),
            payload: network_command(9, methods::GET_RESPONSE_BODY, json!({"requestId": "r1"})),
        };
        let value: Value = serde_json::from_str(command.to_line().unwrap().trim()).unwrap();
        assert_eq!(value["type"], "FeatureCommand");
        assert_eq!(value["payload"]["id"], 9);
        assert_eq!(value["payload"]["method"], "Network.getResponseBody");
        assert_eq!(value["payload"]["params"]["requestId"], "r1");
    }
}
