//! Watch loop for CLI
//!
//! Feeds the device list from the bridge into the inspector, opens the
//! network feature on every newly connected server, and prints everything
//! the inspector reconstructs until interrupted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use snapo_core::events::{forward_events, EventSink};
use snapo_core::protocol::NETWORK_FEATURE;
use snapo_core::{DeviceBridge, InspectorService, ServerIdentity};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// Knobs for [`run_watch`]
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// How often the device list is refreshed
    pub device_poll_interval: Duration,
    /// Upper bound on one device listing
    pub bridge_timeout: Duration,
    /// Keep disconnected servers (and their traffic) around
    pub retain_servers: bool,
    /// Fetch bodies of completed requests automatically
    pub fetch_bodies: bool,
}

/// Run until Ctrl-C, then shut the inspector down
pub async fn run_watch<E: EventSink + 'static>(
    service: Arc<InspectorService>,
    bridge: Arc<dyn DeviceBridge>,
    options: WatchOptions,
    event_sink: E,
) -> Result<(), String> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let forwarder = {
        let service = service.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { forward_events(&service, &event_sink, shutdown_rx).await })
    };

    let mut servers_rx = service.subscribe_servers();
    let mut requests_rx = service.subscribe_requests();
    let mut device_poll = tokio::time::interval(options.device_poll_interval);
    device_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut opened: HashSet<ServerIdentity> = HashSet::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    break Err(format!("Failed to listen for Ctrl-C: {e}"));
                }
                tracing::info!("Interrupted, shutting down");
                break Ok(());
            }

            _ = device_poll.tick() => {
                match tokio::time::timeout(options.bridge_timeout, bridge.list_devices()).await {
                    Ok(Ok(devices)) => service.update_devices(&devices).await,
                    Ok(Err(e)) => tracing::warn!("Failed to list devices: {}", e),
                    Err(_) => tracing::warn!("Listing devices timed out"),
                }
            }

            changed = servers_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let servers = servers_rx.borrow_and_update().clone();

                if options.retain_servers {
                    service
                        .update_retained_servers(servers.iter().map(|s| s.identity.clone()))
                        .await;
                }

                opened.retain(|id| servers.iter().any(|s| &s.identity == id && s.is_connected));
                for server in servers.iter().filter(|s| s.is_connected) {
                    if opened.contains(&server.identity) {
                        continue;
                    }
                    if service
                        .send_feature_opened(NETWORK_FEATURE, Some(&server.identity))
                        .await
                    {
                        opened.insert(server.identity.clone());
                    }
                }
            }

            changed = requests_rx.changed(), if options.fetch_bodies => {
                if changed.is_err() {
                    break Ok(());
                }
                let completed: Vec<_> = requests_rx
                    .borrow_and_update()
                    .iter()
                    .filter(|r| r.is_complete())
                    .map(|r| r.key.clone())
                    .collect();
                for key in completed {
                    service.request_bodies_for_request(&key).await;
                }
            }
        }
    };

    let _ = shutdown_tx.send(());
    if let Err(e) = forwarder.await {
        tracing::warn!("Event forwarder failed: {}", e);
    }
    service.stop().await;
    result
}
