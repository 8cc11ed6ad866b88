//! WebSocket session aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::table::OrderedTable;
use crate::records::{
    NetworkEventRecord, WebSocketCancelled, WebSocketCloseFrame, WebSocketClosed,
    WebSocketFailed, WebSocketMessage, WebSocketOpened, WebSocketWillOpen,
};
use crate::server::ServerIdentity;

/// Composite key of a WebSocket aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketKey {
    pub server: ServerIdentity,
    pub socket_id: String,
}

impl SocketKey {
    pub fn new(server: ServerIdentity, socket_id: impl Into<String>) -> Self {
        Self {
            server,
            socket_id: socket_id.into(),
        }
    }
}

/// Reconstructed view of one WebSocket session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketAggregate {
    pub key: SocketKey,
    pub will_open: Option<WebSocketWillOpen>,
    pub opened: Option<WebSocketOpened>,
    pub closing: Option<WebSocketCloseFrame>,
    pub closed: Option<WebSocketClosed>,
    pub failed: Option<WebSocketFailed>,
    pub close_requested: Option<WebSocketCloseFrame>,
    pub cancelled: Option<WebSocketCancelled>,
    /// Frames in arrival order
    pub messages: Vec<WebSocketMessage>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl WebSocketAggregate {
    pub fn new(key: SocketKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            will_open: None,
            opened: None,
            closing: None,
            closed: None,
            failed: None,
            close_requested: None,
            cancelled: None,
            messages: Vec::new(),
            first_seen_at: now,
            last_updated_at: now,
        }
    }

    pub fn apply(&mut self, record: &NetworkEventRecord, now: DateTime<Utc>) -> bool {
        match record {
            NetworkEventRecord::WebSocketWillOpen(r) => self.will_open = Some(r.clone()),
            NetworkEventRecord::WebSocketOpened(r) => self.opened = Some(r.clone()),
            NetworkEventRecord::WebSocketMessageSent(r)
            | NetworkEventRecord::WebSocketMessageReceived(r) => self.messages.push(r.clone()),
            NetworkEventRecord::WebSocketClosing(r) => self.closing = Some(r.clone()),
            NetworkEventRecord::WebSocketClosed(r) => self.closed = Some(r.clone()),
            NetworkEventRecord::WebSocketFailed(r) => self.failed = Some(r.clone()),
            NetworkEventRecord::WebSocketCloseRequested(r) => {
                self.close_requested = Some(r.clone())
            }
            NetworkEventRecord::WebSocketCancelled(r) => self.cancelled = Some(r.clone()),
            _ => return false,
        }
        self.last_updated_at = now;
        true
    }

    /// Closed, cancelled, or failed
    pub fn is_terminated(&self) -> bool {
        self.closed.is_some() || self.cancelled.is_some() || self.failed.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.will_open.as_ref().map(|w| w.url.as_str())
    }
}

fn socket_id_of(record: &NetworkEventRecord) -> Option<&str> {
    match record {
        NetworkEventRecord::WebSocketWillOpen(_)
        | NetworkEventRecord::WebSocketOpened(_)
        | NetworkEventRecord::WebSocketMessageSent(_)
        | NetworkEventRecord::WebSocketMessageReceived(_)
        | NetworkEventRecord::WebSocketClosing(_)
        | NetworkEventRecord::WebSocketClosed(_)
        | NetworkEventRecord::WebSocketFailed(_)
        | NetworkEventRecord::WebSocketCloseRequested(_)
        | NetworkEventRecord::WebSocketCancelled(_) => record.entity_id(),
        _ => None,
    }
}

/// Single-writer store of WebSocket aggregates
pub struct WebSocketStore {
    table: Mutex<OrderedTable<SocketKey, WebSocketAggregate>>,
    snapshot_tx: watch::Sender<Vec<WebSocketAggregate>>,
}

impl WebSocketStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            table: Mutex::new(OrderedTable::new()),
            snapshot_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<WebSocketAggregate>> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<WebSocketAggregate> {
        self.snapshot_tx.borrow().clone()
    }

    pub async fn get(&self, key: &SocketKey) -> Option<WebSocketAggregate> {
        self.table.lock().await.get(key).cloned()
    }

    /// Apply one record; returns whether this store accepted it
    pub async fn handle(&self, server: &ServerIdentity, record: &NetworkEventRecord) -> bool {
        let Some(socket_id) = socket_id_of(record) else {
            return false;
        };
        let key = SocketKey::new(server.clone(), socket_id);
        let now = Utc::now();

        let mut table = self.table.lock().await;
        let aggregate = table.upsert_with(key.clone(), || WebSocketAggregate::new(key, now));
        aggregate.apply(record, now);
        self.publish(&table);
        true
    }

    /// Evict sessions that were closed, cancelled, or failed
    pub async fn clear_completed_entries(&self) -> usize {
        let mut table = self.table.lock().await;
        let removed = table.retain(|_, aggregate| !aggregate.is_terminated());
        debug!("Cleared {} terminated WebSockets", removed);
        self.publish(&table);
        removed
    }

    pub async fn remove_server(&self, server: &ServerIdentity) -> usize {
        let mut table = self.table.lock().await;
        let removed = table.retain(|key, _| &key.server != server);
        if removed > 0 {
            debug!("Removed {} WebSockets for {}", removed, server);
        }
        self.publish(&table);
        removed
    }

    fn publish(&self, table: &OrderedTable<SocketKey, WebSocketAggregate>) {
        self.snapshot_tx.send_replace(table.snapshot());
    }
}

impl Default for WebSocketStore {
    fn default() -> Self {
        Self::new()
    }
}
