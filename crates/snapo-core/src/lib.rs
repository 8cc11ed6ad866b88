//! Snap-O Core Library
//!
//! Host-side core of the Snap-O network inspector. It discovers debug
//! channels exposed by instrumented Android processes, connects to them
//! through device-bridge tunnels, decodes their event stream, and rebuilds
//! HTTP requests and WebSocket sessions as observable aggregates.
//!
//! # Modules
//!
//! - [`service`] - Facade wiring everything together
//! - [`monitor`] - Per-device polling for debug sockets
//! - [`registry`] - Server state and connection lifecycle
//! - [`translator`] - Per-connection protocol decoding
//! - [`protocol`] - Wire message framing and envelopes
//! - [`records`] - Typed event records
//! - [`store`] - Request and WebSocket aggregate stores
//! - [`body_fetch`] - On-demand request/response body fetching
//! - [`bridge`] - Device bridge seam and the adb implementation
//! - [`events`] - Event sink trait for decoupling from frontends
//! - [`config`] - Configuration
//! - [`error`] - Error types

pub mod body_fetch;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod protocol;
pub mod records;
pub mod registry;
pub mod server;
pub mod service;
pub mod store;
mod task;
pub mod translator;

// Re-export commonly used types
pub use body_fetch::{BodyFetchEvent, BodyFetchOutcome, BodyKind};
pub use bridge::{AdbBridge, BridgeError, Device, DeviceBridge};
pub use config::InspectorConfig;
pub use error::{InspectorError, Result};
pub use events::{forward_events, EventSink, NoOpEventSink, StdoutEventSink};
pub use records::NetworkEventRecord;
pub use server::{ServerIdentity, ServerState};
pub use service::{ClearedEntries, InspectorService};
pub use store::{RequestAggregate, RequestKey, SocketKey, WebSocketAggregate};
