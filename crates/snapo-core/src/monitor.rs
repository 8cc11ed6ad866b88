//! Device socket monitor
//!
//! Polls each live device for abstract sockets carrying the debug channel
//! prefix and reports changes against the previously known set. A device
//! that disappears from the device list has its poll loop cancelled and its
//! known sockets cleared.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bridge::{Device, DeviceBridge};
use crate::config::InspectorConfig;
use crate::task::TaskHandle;

/// Notification raised by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The debug sockets of a device changed since the last poll
    SocketsChanged {
        device_id: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// A device left the device list
    DeviceDisconnected { device_id: String },
}

/// Symmetric difference between two socket sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Returns `None` when both sets are equal
pub fn diff_sockets(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Option<SocketDiff> {
    let added: Vec<String> = current.difference(previous).cloned().collect();
    let removed: Vec<String> = previous.difference(current).cloned().collect();
    if added.is_empty() && removed.is_empty() {
        None
    } else {
        Some(SocketDiff { added, removed })
    }
}

/// Keep debug channel sockets, stripping the prefix
pub fn filter_debug_sockets(names: &[String], prefix: &str) -> BTreeSet<String> {
    names
        .iter()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

struct MonitorInner {
    bridge: Arc<dyn DeviceBridge>,
    socket_prefix: String,
    bridge_timeout: Duration,
    known: Mutex<HashMap<String, BTreeSet<String>>>,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl MonitorInner {
    async fn poll_once(&self, device_id: &str) -> bool {
        let listing = self.bridge.list_abstract_sockets(device_id);
        let current = match tokio::time::timeout(self.bridge_timeout, listing).await {
            Ok(Ok(names)) => filter_debug_sockets(&names, &self.socket_prefix),
            Ok(Err(e)) => {
                warn!("Socket poll failed for {}: {}", device_id, e);
                BTreeSet::new()
            }
            Err(_) => {
                warn!("Socket poll timed out for {}", device_id);
                BTreeSet::new()
            }
        };

        let mut known = self.known.lock().await;
        let previous = known.entry(device_id.to_string()).or_default();
        let Some(diff) = diff_sockets(previous, &current) else {
            return false;
        };
        *previous = current;
        drop(known);

        debug!(
            "Sockets changed on {}: +{:?} -{:?}",
            device_id, diff.added, diff.removed
        );
        let _ = self.events_tx.send(MonitorEvent::SocketsChanged {
            device_id: device_id.to_string(),
            added: diff.added,
            removed: diff.removed,
        });
        true
    }
}

/// Per-device socket poller
pub struct DeviceSocketMonitor {
    inner: Arc<MonitorInner>,
    poll_interval: Duration,
    loops: Mutex<HashMap<String, TaskHandle>>,
}

impl DeviceSocketMonitor {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        config: &InspectorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                bridge,
                socket_prefix: config.socket_prefix.clone(),
                bridge_timeout: config.bridge_timeout(),
                known: Mutex::new(HashMap::new()),
                events_tx,
            }),
            poll_interval: config.poll_interval(),
            loops: Mutex::new(HashMap::new()),
        };
        (monitor, events_rx)
    }

    /// Reconcile poll loops with the current device list
    pub async fn update_devices(&self, devices: &[Device]) {
        let wanted: HashSet<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        let running: Vec<String> = self.loops.lock().await.keys().cloned().collect();

        for device_id in running.iter().filter(|id| !wanted.contains(id.as_str())) {
            self.stop_device(device_id).await;
        }
        for device in devices {
            self.start_device(&device.id).await;
        }
    }

    /// Start polling a device; does nothing if it is already polled
    pub async fn start_device(&self, device_id: &str) {
        let mut loops = self.loops.lock().await;
        if loops.contains_key(device_id) {
            return;
        }

        info!("Monitoring sockets on {}", device_id);
        let inner = self.inner.clone();
        let period = self.poll_interval;
        let id = device_id.to_string();
        let task = TaskHandle::spawn(move |mut shutdown_rx| async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = async {
                        interval.tick().await;
                        inner.poll_once(&id).await;
                    } => {}
                }
            }
            debug!("Socket poll loop for {} stopped", id);
        });
        loops.insert(device_id.to_string(), task);
    }

    /// Cancel a device's poll loop and report it as disconnected
    pub async fn stop_device(&self, device_id: &str) {
        let Some(task) = self.loops.lock().await.remove(device_id) else {
            return;
        };
        task.cancel().await;
        self.inner.known.lock().await.remove(device_id);

        info!("Device {} disconnected", device_id);
        let _ = self.inner.events_tx.send(MonitorEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
    }

    /// Drop a socket from the known set so the next poll reports it again
    pub async fn forget_socket(&self, device_id: &str, socket_name: &str) {
        if let Some(sockets) = self.inner.known.lock().await.get_mut(device_id) {
            if sockets.remove(socket_name) {
                debug!("Forgot socket {} on {}", socket_name, device_id);
            }
        }
    }

    /// Poll a device immediately; returns whether a change was reported
    pub async fn poll_once(&self, device_id: &str) -> bool {
        self.inner.poll_once(device_id).await
    }

    pub async fn known_sockets(&self, device_id: &str) -> BTreeSet<String> {
        self.inner
            .known
            .lock()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn monitored_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.loops.lock().await.keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Cancel every poll loop without raising disconnect notifications
    pub async fn stop_all(&self) {
        let loops: Vec<TaskHandle> = self.loops.lock().await.drain().map(|(_, t)| t).collect();
        for task in loops {
            task.cancel().await;
        }
        self.inner.known.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::FakeBridge;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn new_monitor(bridge: Arc<FakeBridge>) -> (DeviceSocketMonitor, mpsc::UnboundedReceiver<MonitorEvent>) {
        let config = InspectorConfig::new().with_poll_interval_ms(50);
        DeviceSocketMonitor::new(bridge, &config)
    }

    #[test]
    fn test_diff_sockets() {
        let diff = diff_sockets(&set(&["A", "B"]), &set(&["B", "C"])).unwrap();
        assert_eq!(diff.added, vec!["C"]);
        assert_eq!(diff.removed, vec!["A"]);
        assert!(diff_sockets(&set(&["A"]), &set(&["A"])).is_none());
    }

    #[test]
    fn test_filter_debug_sockets() {
        let names = vec![
            "snapo_server_1234".to_string(),
            "jdwp-control".to_string(),
            "snapo_server_".to_string(),
            "snapo_server_com.example_77".to_string(),
        ];
        assert_eq!(
            filter_debug_sockets(&names, "snapo_server_"),
            set(&["1234", "com.example_77"])
        );
    }

    #[tokio::test]
    async fn test_poll_reports_changes_only() {
        let bridge = Arc::new(FakeBridge::new());
        let (monitor, mut events) = new_monitor(bridge.clone());

        bridge.set_sockets("emu", &["snapo_server_A", "snapo_server_B", "other"]);
        assert!(monitor.poll_once("emu").await);
        events.try_recv().unwrap();

        bridge.set_sockets("emu", &["snapo_server_B", "snapo_server_C"]);
        assert!(monitor.poll_once("emu").await);
        assert_eq!(
            events.try_recv().unwrap(),
            MonitorEvent::SocketsChanged {
                device_id: "emu".to_string(),
                added: vec!["C".to_string()],
                removed: vec!["A".to_string()],
            }
        );

        assert!(!monitor.poll_once("emu").await);
        assert!(events.try_recv().is_err());
        assert_eq!(monitor.known_sockets("emu").await, set(&["B", "C"]));
    }

    #[tokio::test]
    async fn test_poll_failure_counts_as_no_sockets() {
        let bridge = Arc::new(FakeBridge::new());
        let (monitor, mut events) = new_monitor(bridge.clone());

        bridge.set_sockets("emu", &["snapo_server_A"]);
        monitor.poll_once("emu").await;
        events.try_recv().unwrap();

        bridge.fail_listing("emu", true);
        monitor.poll_once("emu").await;
        assert_eq!(
            events.try_recv().unwrap(),
            MonitorEvent::SocketsChanged {
                device_id: "emu".to_string(),
                added: vec![],
                removed: vec!["A".to_string()],
            }
        );

        bridge.fail_listing("emu", false);
        monitor.poll_once("emu").await;
        assert!(matches!(
            events.try_recv().unwrap(),
            MonitorEvent::SocketsChanged { added, .. } if added == vec!["A".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_forget_socket_is_rediscovered() {
        let bridge = Arc::new(FakeBridge::new());
        let (monitor, mut events) = new_monitor(bridge.clone());

        bridge.set_sockets("emu", &["snapo_server_A"]);
        monitor.poll_once("emu").await;
        events.try_recv().unwrap();

        monitor.forget_socket("emu", "A").await;
        assert!(monitor.poll_once("emu").await);
        assert!(matches!(
            events.try_recv().unwrap(),
            MonitorEvent::SocketsChanged { added, removed, .. }
                if added == vec!["A".to_string()] && removed.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_device_loops_follow_device_list() {
        let bridge = Arc::new(FakeBridge::new());
        let (monitor, mut events) = new_monitor(bridge.clone());
        bridge.set_sockets("emu", &["snapo_server_A"]);

        monitor.update_devices(&[Device::new("emu", "Emulator")]).await;
        assert_eq!(monitor.monitored_devices().await, vec!["emu"]);

        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, MonitorEvent::SocketsChanged { .. }));
        assert!(bridge.list_calls() >= 1);

        monitor.update_devices(&[]).await;
        assert!(monitor.monitored_devices().await.is_empty());
        assert!(monitor.known_sockets("emu").await.is_empty());

        let last = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(MonitorEvent::DeviceDisconnected { device_id }) => break device_id,
                    Some(_) => continue,
                    None => panic!("monitor channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(last, "emu");

        let calls = bridge.list_calls();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bridge.list_calls(), calls);
    }

    #[tokio::test]
    async fn test_stop_unknown_device_is_silent() {
        let bridge = Arc::new(FakeBridge::new());
        let (monitor, mut events) = new_monitor(bridge);
        monitor.stop_device("ghost").await;
        assert!(events.try_recv().is_err());
    }
}
