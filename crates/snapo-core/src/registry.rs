//! Server connection registry
//!
//! Owns every [`ServerState`] and the connection behind it. Each connection
//! is a tunnel from a local TCP port to the device's debug socket plus a
//! receive loop decoding newline-delimited protocol messages. Handshake and
//! icon messages update the server state here; everything else is passed on
//! to the rest of the pipeline as a [`PipelineMessage`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::body_fetch::CommandSender;
use crate::bridge::{BridgeError, DeviceBridge};
use crate::config::InspectorConfig;
use crate::error::{InspectorError, Result};
use crate::protocol::OutboundEnvelope;
use crate::records::NetworkEventRecord;
use crate::server::{ServerIdentity, ServerState};
use crate::task::TaskHandle;
use crate::translator::{CommandResult, ProtocolTranslator, TranslatedMessage};

/// Messages the registry hands to the rest of the inspector
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineMessage {
    /// A decoded event for the stores
    Event {
        server: ServerIdentity,
        record: NetworkEventRecord,
    },
    /// A response to a command the host sent
    CommandResult {
        server: ServerIdentity,
        result: CommandResult,
    },
    /// The server state was deleted; its aggregates should go too
    ServerRemoved(ServerIdentity),
    /// The connection ended on its own (EOF or read error)
    ///
    /// `connection_id` tells this connection apart from a later one to the
    /// same server.
    ConnectionLost {
        server: ServerIdentity,
        connection_id: u64,
    },
}

struct Connection {
    id: u64,
    task: TaskHandle,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    local_port: u16,
}

struct RegistryInner {
    bridge: Arc<dyn DeviceBridge>,
    config: InspectorConfig,
    servers: Mutex<BTreeMap<ServerIdentity, ServerState>>,
    connections: Mutex<HashMap<ServerIdentity, Connection>>,
    /// Starts in progress, by the connection id they will use
    starting: Mutex<HashMap<ServerIdentity, u64>>,
    next_connection_id: AtomicU64,
    retained: Mutex<HashSet<ServerIdentity>>,
    pipeline_tx: mpsc::UnboundedSender<PipelineMessage>,
    servers_tx: watch::Sender<Vec<ServerState>>,
}

impl RegistryInner {
    fn publish(&self, servers: &BTreeMap<ServerIdentity, ServerState>) {
        self.servers_tx
            .send_replace(servers.values().cloned().collect());
    }

    /// Run a bridge call, giving up after the configured bridge timeout
    async fn bridge_call<T>(
        &self,
        operation: &str,
        call: impl Future<Output = std::result::Result<T, BridgeError>>,
    ) -> std::result::Result<T, BridgeError> {
        tokio::time::timeout(self.config.bridge_timeout(), call)
            .await
            .unwrap_or_else(|_| {
                Err(BridgeError::TimedOut {
                    operation: operation.to_string(),
                    timeout_ms: self.config.bridge_timeout_ms,
                })
            })
    }

    async fn release_tunnel(&self, identity: &ServerIdentity, local_port: u16) {
        let removal = self
            .bridge
            .remove_forward(&identity.device_id, local_port);
        if let Err(e) = self.bridge_call("forward --remove", removal).await {
            warn!("Failed to remove tunnel for {}: {}", identity, e);
        }
    }

    fn emit(&self, message: PipelineMessage) {
        if self.pipeline_tx.send(message).is_err() {
            debug!("Pipeline receiver dropped");
        }
    }

    /// Update server state for one record; returns whether to forward it
    async fn observe(
        &self,
        identity: &ServerIdentity,
        record: &NetworkEventRecord,
        clock_offset_ms: Option<i64>,
    ) -> bool {
        let mut servers = self.servers.lock().await;
        let Some(state) = servers.get_mut(identity) else {
            debug!("Dropping {} for removed server {}", record.kind(), identity);
            return false;
        };

        let forward = match record {
            NetworkEventRecord::Hello(hello) => {
                info!(
                    "{} says hello: {} (schema {})",
                    identity, hello.package_name, hello.schema_version
                );
                state.apply_hello(hello.clone(), self.config.supported_schema_version);
                if state.schema_newer_than_supported {
                    warn!(
                        "{} speaks schema {}, newer than supported {}",
                        identity, hello.schema_version, self.config.supported_schema_version
                    );
                }
                false
            }
            NetworkEventRecord::AppIcon(icon) => {
                if !state.accept_app_icon(icon.clone()) {
                    return false;
                }
                debug!("Updated app icon for {}", identity);
                false
            }
            _ => {
                state.last_event_at = Some(Utc::now());
                if clock_offset_ms.is_some() {
                    state.wall_clock_base_ms = clock_offset_ms;
                }
                match record {
                    NetworkEventRecord::Lifecycle(lifecycle) => {
                        state.lifecycle_state = Some(lifecycle.state.clone());
                    }
                    NetworkEventRecord::ReplayComplete => state.replay_complete = true,
                    _ => {}
                }
                true
            }
        };

        self.publish(&servers);
        forward
    }

    async fn mark_disconnected(&self, identity: &ServerIdentity) {
        let mut servers = self.servers.lock().await;
        if let Some(state) = servers.get_mut(identity) {
            state.is_connected = false;
            self.publish(&servers);
        }
    }

    /// Delete a server unless it is retained, in which case it only disconnects
    async fn retire(&self, identity: &ServerIdentity) {
        let retained = self.retained.lock().await.contains(identity);
        let mut servers = self.servers.lock().await;
        if retained {
            if let Some(state) = servers.get_mut(identity) {
                state.is_connected = false;
            }
            self.publish(&servers);
            return;
        }

        if servers.remove(identity).is_some() {
            self.publish(&servers);
            drop(servers);
            info!("Removed server {}", identity);
            self.emit(PipelineMessage::ServerRemoved(identity.clone()));
        }
    }

    async fn lookup_package_hint(&self, identity: &ServerIdentity) {
        let Some(pid) = identity.pid() else {
            return;
        };
        let command = format!("cat /proc/{pid}/cmdline");
        let shell = self.bridge.shell(&identity.device_id, &command);
        let output = match self.bridge_call("shell", shell).await {
            Ok(output) => output,
            Err(e) => {
                debug!("Package lookup for {} failed: {}", identity, e);
                return;
            }
        };
        let Some(hint) = output
            .split('\0')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return;
        };

        let mut servers = self.servers.lock().await;
        if let Some(state) = servers.get_mut(identity) {
            if state.hello.is_none() && state.package_name_hint.is_none() {
                debug!("Package hint for {}: {}", identity, hint);
                state.package_name_hint = Some(hint.to_string());
                self.publish(&servers);
            }
        }
    }
}

/// Connection receive loop
async fn run_connection(
    inner: Arc<RegistryInner>,
    identity: ServerIdentity,
    connection_id: u64,
    read_half: OwnedReadHalf,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut translator = ProtocolTranslator::new();

    let lost = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break false,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match translator.translate(&line) {
                        TranslatedMessage::Event(record) => {
                            if let NetworkEventRecord::Unknown(unknown) = &record {
                                debug!(
                                    "Unknown message from {}: {:?}",
                                    identity, unknown.claimed_type
                                );
                            }
                            if inner
                                .observe(&identity, &record, translator.clock_offset_ms())
                                .await
                            {
                                inner.emit(PipelineMessage::Event {
                                    server: identity.clone(),
                                    record,
                                });
                            }
                        }
                        TranslatedMessage::CommandResult(result) => {
                            inner.emit(PipelineMessage::CommandResult {
                                server: identity.clone(),
                                result,
                            });
                        }
                    }
                }
                Ok(None) => {
                    info!("Server {} closed the connection", identity);
                    break true;
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", identity, e);
                    break true;
                }
            }
        }
    };

    if lost {
        inner.mark_disconnected(&identity).await;
        inner.emit(PipelineMessage::ConnectionLost {
            server: identity,
            connection_id,
        });
    }
}

/// Registry of debug channel servers and their connections
#[derive(Clone)]
pub struct ServerConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ServerConnectionRegistry {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        config: InspectorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineMessage>) {
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let (servers_tx, _) = watch::channel(Vec::new());
        let registry = Self {
            inner: Arc::new(RegistryInner {
                bridge,
                config,
                servers: Mutex::new(BTreeMap::new()),
                connections: Mutex::new(HashMap::new()),
                starting: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
                retained: Mutex::new(HashSet::new()),
                pipeline_tx,
                servers_tx,
            }),
        };
        (registry, pipeline_rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ServerState>> {
        self.inner.servers_tx.subscribe()
    }

    pub fn servers(&self) -> Vec<ServerState> {
        self.inner.servers_tx.borrow().clone()
    }

    pub async fn server(&self, identity: &ServerIdentity) -> Option<ServerState> {
        self.inner.servers.lock().await.get(identity).cloned()
    }

    pub async fn is_connected(&self, identity: &ServerIdentity) -> bool {
        self.inner.connections.lock().await.contains_key(identity)
    }

    /// Open a tunnel and connection to a debug socket
    ///
    /// Does nothing if the server is already connected or being connected.
    /// `socket_name` is the name with the debug channel prefix stripped. The
    /// bridge and the TCP connect run without holding any registry lock.
    pub async fn start_server_connection(&self, device_id: &str, socket_name: &str) -> Result<()> {
        let identity = ServerIdentity::new(device_id, socket_name);
        let connection_id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        {
            let connections = self.inner.connections.lock().await;
            let mut starting = self.inner.starting.lock().await;
            if connections.contains_key(&identity) || starting.contains_key(&identity) {
                return Ok(());
            }
            starting.insert(identity.clone(), connection_id);
        }

        let (stream, local_port) = match self.open_channel(&identity).await {
            Ok(opened) => opened,
            Err(e) => {
                let mut starting = self.inner.starting.lock().await;
                if starting.get(&identity) == Some(&connection_id) {
                    starting.remove(&identity);
                }
                return Err(e);
            }
        };

        let mut connections = self.inner.connections.lock().await;
        let still_wanted = {
            let mut starting = self.inner.starting.lock().await;
            let wanted = starting.get(&identity) == Some(&connection_id);
            if wanted {
                starting.remove(&identity);
            }
            wanted
        };
        if !still_wanted {
            drop(connections);
            debug!("Start of {} was cancelled while connecting", identity);
            self.inner.release_tunnel(&identity, local_port).await;
            return Ok(());
        }

        let needs_hint = {
            let mut servers = self.inner.servers.lock().await;
            let mut state = ServerState::new(identity.clone(), local_port);
            if let Some(previous) = servers.get(&identity) {
                state.carry_over(previous, self.inner.config.supported_schema_version);
            }
            let needs_hint = state.hello.is_none() && state.package_name_hint.is_none();
            servers.insert(identity.clone(), state);
            self.inner.publish(&servers);
            needs_hint
        };

        let (read_half, write_half) = stream.into_split();
        let inner = self.inner.clone();
        let loop_identity = identity.clone();
        let task = TaskHandle::spawn(move |shutdown_rx| {
            run_connection(inner, loop_identity, connection_id, read_half, shutdown_rx)
        });
        connections.insert(
            identity.clone(),
            Connection {
                id: connection_id,
                task,
                writer: Arc::new(Mutex::new(write_half)),
                local_port,
            },
        );
        drop(connections);

        info!("Connected to {} on port {}", identity, local_port);

        if needs_hint {
            self.inner.lookup_package_hint(&identity).await;
        }
        Ok(())
    }

    /// Request the tunnel and connect through it
    async fn open_channel(&self, identity: &ServerIdentity) -> Result<(TcpStream, u16)> {
        let full_name = format!("{}{}", self.inner.config.socket_prefix, identity.socket_name);
        let forward = self.inner.bridge.forward(&identity.device_id, &full_name);
        let local_port = self
            .inner
            .bridge_call("forward", forward)
            .await
            .map_err(|e| InspectorError::TunnelFailed {
                server: identity.clone(),
                reason: e.to_string(),
            })?;

        let connect = TcpStream::connect(("127.0.0.1", local_port));
        let reason = match tokio::time::timeout(self.inner.config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok((stream, local_port));
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        self.inner.release_tunnel(identity, local_port).await;
        Err(InspectorError::ConnectFailed {
            server: identity.clone(),
            reason,
        })
    }

    /// Close a server's connection and tunnel, then delete or retain its state
    ///
    /// A start still in progress for the server is abandoned.
    pub async fn stop_server_connection(&self, identity: &ServerIdentity) {
        let connection = {
            let mut connections = self.inner.connections.lock().await;
            if self.inner.starting.lock().await.remove(identity).is_some() {
                debug!("Abandoning pending start of {}", identity);
            }
            connections.remove(identity)
        };
        if let Some(connection) = connection {
            self.close(identity, connection).await;
        }
        self.inner.retire(identity).await;
    }

    /// Tear down a connection that ended on its own
    ///
    /// Only acts if `connection_id` is still the server's live connection, so
    /// a late notice cannot close a newer connection. Returns whether it did.
    pub async fn stop_lost_connection(&self, identity: &ServerIdentity, connection_id: u64) -> bool {
        let connection = {
            let mut connections = self.inner.connections.lock().await;
            let is_current = connections
                .get(identity)
                .is_some_and(|current| current.id == connection_id);
            if is_current {
                connections.remove(identity)
            } else {
                None
            }
        };
        let Some(connection) = connection else {
            debug!("Ignoring stale connection loss for {}", identity);
            return false;
        };
        self.close(identity, connection).await;
        self.inner.retire(identity).await;
        true
    }

    async fn close(&self, identity: &ServerIdentity, connection: Connection) {
        connection.task.cancel().await;
        self.inner
            .release_tunnel(identity, connection.local_port)
            .await;
        debug!("Stopped connection to {}", identity);
    }

    /// Stop every server on a device
    pub async fn remove_servers_for_device(&self, device_id: &str) {
        let mut identities: HashSet<ServerIdentity> = self
            .inner
            .servers
            .lock()
            .await
            .keys()
            .filter(|id| id.device_id == device_id)
            .cloned()
            .collect();
        identities.extend(
            self.inner
                .connections
                .lock()
                .await
                .keys()
                .filter(|id| id.device_id == device_id)
                .cloned(),
        );
        identities.extend(
            self.inner
                .starting
                .lock()
                .await
                .keys()
                .filter(|id| id.device_id == device_id)
                .cloned(),
        );

        for identity in identities {
            self.stop_server_connection(&identity).await;
        }
    }

    /// Replace the set of identities that survive disconnection
    pub async fn update_retained_servers(
        &self,
        identities: impl IntoIterator<Item = ServerIdentity>,
    ) {
        *self.inner.retained.lock().await = identities.into_iter().collect();
        self.purge_stale_servers().await;
    }

    /// Delete servers that are disconnected and no longer retained
    pub async fn purge_stale_servers(&self) -> usize {
        let retained = self.inner.retained.lock().await.clone();
        let mut servers = self.inner.servers.lock().await;
        let stale: Vec<ServerIdentity> = servers
            .values()
            .filter(|s| !s.is_connected && !retained.contains(&s.identity))
            .map(|s| s.identity.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }

        for identity in &stale {
            servers.remove(identity);
        }
        self.inner.publish(&servers);
        drop(servers);

        for identity in &stale {
            info!("Purged stale server {}", identity);
            self.inner
                .emit(PipelineMessage::ServerRemoved(identity.clone()));
        }
        stale.len()
    }

    /// Send a feature command to one server; returns whether it was written
    pub async fn send_feature_command(
        &self,
        identity: &ServerIdentity,
        feature: &str,
        payload: Value,
    ) -> bool {
        let envelope = OutboundEnvelope::FeatureCommand {
            feature: feature.to_string(),
            payload,
        };
        let sent = async {
            let writer = self.writer_for(identity).await?;
            write_envelope(&writer, &envelope).await
        };
        match sent.await {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to send {} command to {}: {}", feature, identity, e);
                false
            }
        }
    }

    /// Announce that a feature was opened, to one server or to all of them
    ///
    /// Returns whether at least one connection received it.
    pub async fn send_feature_opened(
        &self,
        feature: &str,
        identity: Option<&ServerIdentity>,
    ) -> bool {
        let envelope = OutboundEnvelope::FeatureOpened {
            feature: feature.to_string(),
        };
        let targets: Vec<(ServerIdentity, Arc<Mutex<OwnedWriteHalf>>)> = {
            let connections = self.inner.connections.lock().await;
            connections
                .iter()
                .filter(|(id, _)| identity.map_or(true, |wanted| *id == wanted))
                .map(|(id, c)| (id.clone(), c.writer.clone()))
                .collect()
        };

        let mut delivered = false;
        for (id, writer) in targets {
            match write_envelope(&writer, &envelope).await {
                Ok(()) => delivered = true,
                Err(e) => warn!("Failed to send {} opened to {}: {}", feature, id, e),
            }
        }
        delivered
    }

    /// Cancel every connection and release every tunnel
    ///
    /// A tunnel that fails to release is logged and skipped.
    pub async fn stop_all(&self) {
        let connections: Vec<(ServerIdentity, Connection)> = {
            let mut connections = self.inner.connections.lock().await;
            self.inner.starting.lock().await.clear();
            connections.drain().collect()
        };
        for (identity, connection) in connections {
            self.close(&identity, connection).await;
        }

        let mut servers = self.inner.servers.lock().await;
        for state in servers.values_mut() {
            state.is_connected = false;
        }
        self.inner.publish(&servers);
    }

    async fn writer_for(&self, identity: &ServerIdentity) -> Result<Arc<Mutex<OwnedWriteHalf>>> {
        self.inner
            .connections
            .lock()
            .await
            .get(identity)
            .map(|c| c.writer.clone())
            .ok_or_else(|| InspectorError::UnknownServer(identity.clone()))
    }
}

async fn write_envelope(writer: &Mutex<OwnedWriteHalf>, envelope: &OutboundEnvelope) -> Result<()> {
    let line = envelope.to_line()?;
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl CommandSender for ServerConnectionRegistry {
    async fn send_feature_command(
        &self,
        server: &ServerIdentity,
        feature: &str,
        payload: Value,
    ) -> bool {
        ServerConnectionRegistry::send_feature_command(self, server, feature, payload).await
    }
}
