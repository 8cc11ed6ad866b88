//! Event Sink Trait
//!
//! This module provides the EventSink trait for decoupling inspector output
//! from any particular frontend. Implementations can print to stdout (CLI),
//! feed a UI, or record for tests. [`forward_events`] watches a running
//! [`InspectorService`] and calls the sink for every changed item.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::body_fetch::{BodyFetchEvent, BodyFetchOutcome};
use crate::server::{ServerIdentity, ServerState};
use crate::service::InspectorService;
use crate::store::{RequestAggregate, RequestKey, SocketKey, WebSocketAggregate};

/// Event sink for inspector output
#[async_trait]
pub trait EventSink: Send + Sync {
    /// A server appeared or its state changed
    async fn emit_server(&self, server: &ServerState) -> Result<(), String>;

    /// A server was deleted
    async fn emit_server_removed(&self, identity: &ServerIdentity) -> Result<(), String>;

    /// A request aggregate was created or updated
    async fn emit_request(&self, request: &RequestAggregate) -> Result<(), String>;

    /// A WebSocket aggregate was created or updated
    async fn emit_websocket(&self, socket: &WebSocketAggregate) -> Result<(), String>;

    /// A body fetch resolved
    async fn emit_body_fetch(&self, event: &BodyFetchEvent) -> Result<(), String>;
}

/// No-op event sink for testing or headless use
#[derive(Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit_server(&self, _server: &ServerState) -> Result<(), String> {
        Ok(())
    }

    async fn emit_server_removed(&self, _identity: &ServerIdentity) -> Result<(), String> {
        Ok(())
    }

    async fn emit_request(&self, _request: &RequestAggregate) -> Result<(), String> {
        Ok(())
    }

    async fn emit_websocket(&self, _socket: &WebSocketAggregate) -> Result<(), String> {
        Ok(())
    }

    async fn emit_body_fetch(&self, _event: &BodyFetchEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout event sink for CLI mode - prints events to console
#[derive(Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    fn print_json<T: serde::Serialize>(&self, event: &str, payload: &T) -> Result<(), String> {
        let payload = serde_json::to_value(payload).map_err(|e| e.to_string())?;
        println!("{}", serde_json::json!({ "event": event, "payload": payload }));
        Ok(())
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn emit_server(&self, server: &ServerState) -> Result<(), String> {
        if self.json_output {
            return self.print_json("server", server);
        }
        let status = if server.is_connected {
            "connected"
        } else {
            "disconnected"
        };
        let mut line = format!("Server {} {}", server.display_name(), status);
        if server.schema_newer_than_supported {
            line.push_str(" (newer schema than supported)");
        } else if server.schema_older_than_supported {
            line.push_str(" (older schema than supported)");
        }
        println!("{line}");
        Ok(())
    }

    async fn emit_server_removed(&self, identity: &ServerIdentity) -> Result<(), String> {
        if self.json_output {
            return self.print_json("server_removed", identity);
        }
        println!("Server {identity} removed");
        Ok(())
    }

    async fn emit_request(&self, request: &RequestAggregate) -> Result<(), String> {
        if self.json_output {
            return self.print_json("request", request);
        }
        println!("{}", describe_request(request));
        Ok(())
    }

    async fn emit_websocket(&self, socket: &WebSocketAggregate) -> Result<(), String> {
        if self.json_output {
            return self.print_json("websocket", socket);
        }
        println!("{}", describe_websocket(socket));
        Ok(())
    }

    async fn emit_body_fetch(&self, event: &BodyFetchEvent) -> Result<(), String> {
        if self.json_output {
            return self.print_json("body_fetch", event);
        }
        let outcome = match &event.outcome {
            BodyFetchOutcome::Stored => "stored".to_string(),
            BodyFetchOutcome::NoBodyCaptured => "no body captured".to_string(),
            BodyFetchOutcome::Failed(message) => format!("failed: {message}"),
        };
        println!(
            "{:?} body of {}: {}",
            event.kind, event.key.request_id, outcome
        );
        Ok(())
    }
}

fn describe_request(request: &RequestAggregate) -> String {
    let started = request.request.as_ref().map(|r| r.wall_time_ms);
    let method = request.method().unwrap_or("-");
    let url = request.url().unwrap_or("?");

    let status = if let Some(failure) = &request.failure {
        format!("failed ({})", failure.error_text)
    } else if let Some(response) = &request.response {
        if request.is_streaming() {
            let state = if request.stream_closed.is_some() {
                "closed"
            } else {
                "open"
            };
            format!(
                "{} stream {} ({} events)",
                response.status,
                state,
                request.stream_events.len()
            )
        } else {
            response.status.to_string()
        }
    } else {
        "pending".to_string()
    };

    let mut line = format!("[{}] {} {} {}", format_time(started), method, url, status);
    if let Some(duration) = request.duration_ms() {
        line.push_str(&format!(" {duration} ms"));
    }
    line
}

fn describe_websocket(socket: &WebSocketAggregate) -> String {
    let started = socket.will_open.as_ref().map(|w| w.wall_time_ms);
    let url = socket.url().unwrap_or("?");
    let state = if socket.cancelled.is_some() {
        "cancelled".to_string()
    } else if let Some(failed) = &socket.failed {
        format!("failed ({})", failed.error_message)
    } else if socket.closed.is_some() {
        "closed".to_string()
    } else if socket.closing.is_some() || socket.close_requested.is_some() {
        "closing".to_string()
    } else if socket.opened.is_some() {
        "open".to_string()
    } else {
        "connecting".to_string()
    };
    format!(
        "[{}] WS {} {} ({} frames)",
        format_time(started),
        url,
        state,
        socket.messages.len()
    )
}

/// Render epoch milliseconds as a UTC wall-clock time
fn format_time(wall_time_ms: Option<i64>) -> String {
    wall_time_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "--:--:--.---".to_string())
}

/// Remembers what was last reported so only changes are emitted
#[derive(Default)]
pub struct ChangeTracker {
    servers: HashMap<ServerIdentity, ServerState>,
    requests: HashMap<RequestKey, DateTime<Utc>>,
    websockets: HashMap<SocketKey, DateTime<Utc>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns changed servers and identities that disappeared
    pub fn servers<'a>(
        &mut self,
        snapshot: &'a [ServerState],
    ) -> (Vec<&'a ServerState>, Vec<ServerIdentity>) {
        let changed: Vec<&ServerState> = snapshot
            .iter()
            .filter(|s| self.servers.get(&s.identity) != Some(*s))
            .collect();
        let removed: Vec<ServerIdentity> = self
            .servers
            .keys()
            .filter(|id| !snapshot.iter().any(|s| &s.identity == *id))
            .cloned()
            .collect();
        self.servers = snapshot
            .iter()
            .map(|s| (s.identity.clone(), s.clone()))
            .collect();
        (changed, removed)
    }

    pub fn requests<'a>(&mut self, snapshot: &'a [RequestAggregate]) -> Vec<&'a RequestAggregate> {
        let changed = snapshot
            .iter()
            .filter(|a| self.requests.get(&a.key) != Some(&a.last_updated_at))
            .collect();
        self.requests = snapshot
            .iter()
            .map(|a| (a.key.clone(), a.last_updated_at))
            .collect();
        changed
    }

    pub fn websockets<'a>(
        &mut self,
        snapshot: &'a [WebSocketAggregate],
    ) -> Vec<&'a WebSocketAggregate> {
        let changed = snapshot
            .iter()
            .filter(|a| self.websockets.get(&a.key) != Some(&a.last_updated_at))
            .collect();
        self.websockets = snapshot
            .iter()
            .map(|a| (a.key.clone(), a.last_updated_at))
            .collect();
        changed
    }
}

/// Feed every change of a running service into a sink until shutdown
pub async fn forward_events<S: EventSink>(
    service: &InspectorService,
    sink: &S,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut servers_rx = service.subscribe_servers();
    let mut requests_rx = service.subscribe_requests();
    let mut websockets_rx = service.subscribe_websockets();
    let mut fetch_rx = service.subscribe_body_fetch_events();
    let mut tracker = ChangeTracker::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            changed = servers_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = servers_rx.borrow_and_update().clone();
                let (changed, removed) = tracker.servers(&snapshot);
                for server in changed {
                    report(sink.emit_server(server).await);
                }
                for identity in removed {
                    report(sink.emit_server_removed(&identity).await);
                }
            }
            changed = requests_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = requests_rx.borrow_and_update().clone();
                for request in tracker.requests(&snapshot) {
                    report(sink.emit_request(request).await);
                }
            }
            changed = websockets_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = websockets_rx.borrow_and_update().clone();
                for socket in tracker.websockets(&snapshot) {
                    report(sink.emit_websocket(socket).await);
                }
            }
            event = fetch_rx.recv() => match event {
                Ok(event) => report(sink.emit_body_fetch(&event).await),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} body fetch events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn report(result: Result<(), String>) {
    if let Err(e) = result {
        warn!("Failed to emit event: {}", e);
    }
}
