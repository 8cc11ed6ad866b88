//! Inspector service facade
//!
//! Wires the socket monitor, the connection registry, the aggregate stores
//! and the body fetch coordinator together, and is the only surface
//! consumers (UI, CLI) talk to. Two background tasks do the wiring: one
//! turns monitor notifications into connection starts and stops, the other
//! routes registry output to the stores and the coordinator.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::body_fetch::{BodyFetchCoordinator, BodyFetchEvent};
use crate::bridge::{Device, DeviceBridge};
use crate::config::InspectorConfig;
use crate::error::Result;
use crate::monitor::{DeviceSocketMonitor, MonitorEvent};
use crate::registry::{PipelineMessage, ServerConnectionRegistry};
use crate::server::{ServerIdentity, ServerState};
use crate::store::{RequestAggregate, RequestKey, RequestStore, WebSocketAggregate, WebSocketStore};
use crate::task::TaskHandle;

/// Number of aggregates evicted by [`InspectorService::clear_completed_entries`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedEntries {
    pub requests: usize,
    pub websockets: usize,
}

/// Running inspector
pub struct InspectorService {
    monitor: Arc<DeviceSocketMonitor>,
    registry: ServerConnectionRegistry,
    requests: Arc<RequestStore>,
    websockets: Arc<WebSocketStore>,
    body_fetch: Arc<BodyFetchCoordinator>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl InspectorService {
    /// Build every component and spawn the wiring tasks
    ///
    /// Must be called from within a tokio runtime. Monitoring starts with the
    /// first [`InspectorService::update_devices`] call.
    pub fn start(config: InspectorConfig, bridge: Arc<dyn DeviceBridge>) -> Result<Self> {
        config.validate()?;

        let (monitor, monitor_rx) = DeviceSocketMonitor::new(bridge.clone(), &config);
        let monitor = Arc::new(monitor);
        let max_attempts = config.max_body_fetch_attempts;
        let (registry, pipeline_rx) = ServerConnectionRegistry::new(bridge, config);
        let requests = Arc::new(RequestStore::new());
        let websockets = Arc::new(WebSocketStore::new());
        let body_fetch = Arc::new(BodyFetchCoordinator::new(
            requests.clone(),
            Arc::new(registry.clone()),
            max_attempts,
        ));

        let monitor_task = {
            let monitor = monitor.clone();
            let registry = registry.clone();
            TaskHandle::spawn(move |shutdown_rx| {
                run_monitor_events(monitor, registry, monitor_rx, shutdown_rx)
            })
        };
        let pipeline_task = {
            let router = PipelineRouter {
                monitor: monitor.clone(),
                registry: registry.clone(),
                requests: requests.clone(),
                websockets: websockets.clone(),
                body_fetch: body_fetch.clone(),
            };
            TaskHandle::spawn(move |shutdown_rx| router.run(pipeline_rx, shutdown_rx))
        };

        info!("Inspector service started");
        Ok(Self {
            monitor,
            registry,
            requests,
            websockets,
            body_fetch,
            tasks: Mutex::new(vec![monitor_task, pipeline_task]),
        })
    }

    /// Feed the current device list from the device tracker
    pub async fn update_devices(&self, devices: &[Device]) {
        self.monitor.update_devices(devices).await;
    }

    pub fn subscribe_servers(&self) -> watch::Receiver<Vec<ServerState>> {
        self.registry.subscribe()
    }

    pub fn servers(&self) -> Vec<ServerState> {
        self.registry.servers()
    }

    pub fn subscribe_requests(&self) -> watch::Receiver<Vec<RequestAggregate>> {
        self.requests.subscribe()
    }

    pub fn requests(&self) -> Vec<RequestAggregate> {
        self.requests.snapshot()
    }

    pub fn subscribe_websockets(&self) -> watch::Receiver<Vec<WebSocketAggregate>> {
        self.websockets.subscribe()
    }

    pub fn websockets(&self) -> Vec<WebSocketAggregate> {
        self.websockets.snapshot()
    }

    pub fn subscribe_body_fetch_events(&self) -> broadcast::Receiver<BodyFetchEvent> {
        self.body_fetch.subscribe()
    }

    /// Replace the identities kept after disconnection and purge the rest
    pub async fn update_retained_servers(
        &self,
        identities: impl IntoIterator<Item = ServerIdentity>,
    ) {
        self.registry.update_retained_servers(identities).await;
    }

    pub async fn clear_completed_entries(&self) -> ClearedEntries {
        let cleared = ClearedEntries {
            requests: self.requests.clear_completed_entries().await,
            websockets: self.websockets.clear_completed_entries().await,
        };
        self.body_fetch.forget_evicted().await;
        cleared
    }

    /// Fetch whichever bodies of a request are missing; returns commands sent
    pub async fn request_bodies_for_request(&self, key: &RequestKey) -> usize {
        self.body_fetch.request_bodies_for_request(key).await
    }

    pub async fn send_feature_opened(&self, feature: &str, server: Option<&ServerIdentity>) -> bool {
        self.registry.send_feature_opened(feature, server).await
    }

    pub async fn send_feature_command(
        &self,
        server: &ServerIdentity,
        feature: &str,
        payload: Value,
    ) -> bool {
        self.registry
            .send_feature_command(server, feature, payload)
            .await
    }

    /// Cancel every loop and release every tunnel
    pub async fn stop(&self) {
        self.monitor.stop_all().await;
        let tasks: Vec<TaskHandle> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.cancel().await;
        }
        self.registry.stop_all().await;
        info!("Inspector service stopped");
    }
}

async fn run_monitor_events(
    monitor: Arc<DeviceSocketMonitor>,
    registry: ServerConnectionRegistry,
    mut events_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = events_rx.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        // Handling waits on the bridge, so it has to yield to shutdown too
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = handle_monitor_event(&monitor, &registry, event) => {}
        }
    }
}

async fn handle_monitor_event(
    monitor: &DeviceSocketMonitor,
    registry: &ServerConnectionRegistry,
    event: MonitorEvent,
) {
    match event {
        MonitorEvent::SocketsChanged {
            device_id,
            added,
            removed,
        } => {
            for socket_name in removed {
                registry
                    .stop_server_connection(&ServerIdentity::new(&device_id, socket_name))
                    .await;
            }
            for socket_name in added {
                if let Err(e) = registry
                    .start_server_connection(&device_id, &socket_name)
                    .await
                {
                    warn!("{}", e);
                    monitor.forget_socket(&device_id, &socket_name).await;
                }
            }
        }
        MonitorEvent::DeviceDisconnected { device_id } => {
            registry.remove_servers_for_device(&device_id).await;
        }
    }
}

struct PipelineRouter {
    monitor: Arc<DeviceSocketMonitor>,
    registry: ServerConnectionRegistry,
    requests: Arc<RequestStore>,
    websockets: Arc<WebSocketStore>,
    body_fetch: Arc<BodyFetchCoordinator>,
}

impl PipelineRouter {
    async fn run(
        self,
        mut pipeline_rx: mpsc::UnboundedReceiver<PipelineMessage>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown_rx.recv() => break,
                message = pipeline_rx.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = self.route(message) => {}
            }
        }
    }

    async fn route(&self, message: PipelineMessage) {
        match message {
            PipelineMessage::Event { server, record } => {
                if self.requests.handle(&server, &record).await {
                    return;
                }
                if !self.websockets.handle(&server, &record).await {
                    debug!("No store for {} from {}", record.kind(), server);
                }
            }
            PipelineMessage::CommandResult { server, result } => {
                self.body_fetch.handle_command_result(&server, result).await;
            }
            PipelineMessage::ServerRemoved(server) => {
                self.requests.remove_server(&server).await;
                self.websockets.remove_server(&server).await;
                self.body_fetch.remove_server(&server).await;
            }
            PipelineMessage::ConnectionLost {
                server,
                connection_id,
            } => {
                // Stop before forgetting so the next poll can't race a live connection
                if self
                    .registry
                    .stop_lost_connection(&server, connection_id)
                    .await
                {
                    self.monitor
                        .forget_socket(&server.device_id, &server.socket_name)
                        .await;
                }
            }
        }
    }
}
