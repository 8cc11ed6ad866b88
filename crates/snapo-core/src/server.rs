//! Server identity and per-server state
//!
//! A "server" is one debug channel exposed by an instrumented process,
//! identified by the device it runs on and its socket name.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{AppIcon, Hello};

/// Natural key of one debug channel instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub device_id: String,
    /// Socket name with the debug channel prefix stripped
    pub socket_name: String,
}

impl ServerIdentity {
    pub fn new(device_id: impl Into<String>, socket_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            socket_name: socket_name.into(),
        }
    }

    /// Process id encoded in the socket name suffix, if any
    ///
    /// Socket names end in the pid, either alone (`4321`) or after the
    /// last underscore (`com.example_4321`).
    pub fn pid(&self) -> Option<u32> {
        self.socket_name
            .rsplit('_')
            .next()
            .and_then(|suffix| suffix.parse().ok())
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.socket_name)
    }
}

/// Everything the host knows about one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub identity: ServerIdentity,
    /// Local end of the tunnel
    pub local_port: u16,
    pub hello: Option<Hello>,
    pub app_icon: Option<AppIcon>,
    /// Best-effort package name read before the handshake arrives
    pub package_name_hint: Option<String>,
    pub is_connected: bool,
    pub last_event_at: Option<DateTime<Utc>>,
    /// Wall minus monotonic clock of the device, once observed
    pub wall_clock_base_ms: Option<i64>,
    pub schema_newer_than_supported: bool,
    pub schema_older_than_supported: bool,
    pub lifecycle_state: Option<String>,
    pub replay_complete: bool,
}

impl ServerState {
    pub fn new(identity: ServerIdentity, local_port: u16) -> Self {
        Self {
            identity,
            local_port,
            hello: None,
            app_icon: None,
            package_name_hint: None,
            is_connected: true,
            last_event_at: None,
            wall_clock_base_ms: None,
            schema_newer_than_supported: false,
            schema_older_than_supported: false,
            lifecycle_state: None,
            replay_complete: false,
        }
    }

    /// Keep what a previous incarnation of this server already told us
    pub fn carry_over(&mut self, previous: &ServerState, supported_schema_version: u32) {
        if let Some(hello) = previous.hello.clone() {
            self.apply_hello(hello, supported_schema_version);
        }
        self.app_icon = previous.app_icon.clone();
        self.package_name_hint = previous.package_name_hint.clone();
    }

    pub fn apply_hello(&mut self, hello: Hello, supported_schema_version: u32) {
        self.schema_newer_than_supported = hello.schema_version > supported_schema_version;
        self.schema_older_than_supported = hello.schema_version < supported_schema_version;
        self.hello = Some(hello);
    }

    /// Store an icon if it belongs to this app and differs from the cached one
    pub fn accept_app_icon(&mut self, icon: AppIcon) -> bool {
        if let Some(hello) = &self.hello {
            if hello.package_name != icon.package_name {
                return false;
            }
        }
        if self.app_icon.as_ref() == Some(&icon) {
            return false;
        }
        self.app_icon = Some(icon);
        true
    }

    /// Package name from the handshake, falling back to the pre-handshake hint
    pub fn package_name(&self) -> Option<&str> {
        self.hello
            .as_ref()
            .map(|h| h.package_name.as_str())
            .or(self.package_name_hint.as_deref())
    }

    pub fn supports_feature(&self, feature: &str) -> bool {
        self.hello
            .as_ref()
            .is_some_and(|h| h.features.iter().any(|f| f == feature))
    }

    pub fn display_name(&self) -> String {
        match self.package_name() {
            Some(package) => format!("{package} ({})", self.identity.device_id),
            None => self.identity.to_string(),
        }
    }
}
