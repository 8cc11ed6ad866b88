//! HTTP request aggregates
//!
//! A [`RequestAggregate`] is built up from every request-scoped record that
//! shares a `(server, request id)` key: the initiating request, the response
//! or failure, the completion marker, and for event streams the ordered
//! stream events and the closing record.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::table::OrderedTable;
use crate::records::{
    BodyEncoding, NetworkEventRecord, RequestFailed, RequestFinished, RequestWillBeSent,
    ResponseReceived, ResponseStreamClosed, ResponseStreamEvent,
};
use crate::server::ServerIdentity;

/// Composite key of a request aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub server: ServerIdentity,
    pub request_id: String,
}

impl RequestKey {
    pub fn new(server: ServerIdentity, request_id: impl Into<String>) -> Self {
        Self {
            server,
            request_id: request_id.into(),
        }
    }
}

/// Reconstructed view of one HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAggregate {
    pub key: RequestKey,
    pub request: Option<RequestWillBeSent>,
    pub response: Option<ResponseReceived>,
    pub failure: Option<RequestFailed>,
    pub finished: Option<RequestFinished>,
    /// Sorted by (sequence, wall time)
    pub stream_events: Vec<ResponseStreamEvent>,
    pub stream_closed: Option<ResponseStreamClosed>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl RequestAggregate {
    pub fn new(key: RequestKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            request: None,
            response: None,
            failure: None,
            finished: None,
            stream_events: Vec::new(),
            stream_closed: None,
            first_seen_at: now,
            last_updated_at: now,
        }
    }

    /// Fold one request-scoped record; other records are ignored
    pub fn apply(&mut self, record: &NetworkEventRecord, now: DateTime<Utc>) -> bool {
        match record {
            NetworkEventRecord::RequestWillBeSent(r) => self.request = Some(r.clone()),
            NetworkEventRecord::ResponseReceived(r) => {
                self.response = Some(r.clone());
                self.failure = None;
            }
            NetworkEventRecord::RequestFailed(r) => {
                self.failure = Some(r.clone());
                self.response = None;
            }
            NetworkEventRecord::RequestFinished(r) => self.finished = Some(r.clone()),
            NetworkEventRecord::ResponseStreamEvent(r) => self.merge_stream_event(r.clone()),
            NetworkEventRecord::ResponseStreamClosed(r) => self.stream_closed = Some(r.clone()),
            _ => return false,
        }
        self.last_updated_at = now;
        true
    }

    fn merge_stream_event(&mut self, event: ResponseStreamEvent) {
        match self
            .stream_events
            .iter_mut()
            .find(|e| e.sequence == event.sequence)
        {
            Some(existing) => *existing = event,
            None => self.stream_events.push(event),
        }
        self.stream_events
            .sort_by_key(|e| (e.sequence, e.wall_time_ms));
    }

    /// Whether the response is (or behaved like) a server-sent event stream
    pub fn is_streaming(&self) -> bool {
        self.response.as_ref().is_some_and(|r| r.is_event_stream())
            || !self.stream_events.is_empty()
            || self.stream_closed.is_some()
    }

    /// Whether nothing more is expected for this request
    pub fn is_complete(&self) -> bool {
        if self.failure.is_some() || self.stream_closed.is_some() {
            return true;
        }
        !self.is_streaming() && self.response.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.request
            .as_ref()
            .map(|r| r.url.as_str())
            .or_else(|| self.response.as_ref().and_then(|r| r.url.as_deref()))
    }

    pub fn method(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.method.as_str())
    }

    /// Elapsed device time between the request and its terminal record
    pub fn duration_ms(&self) -> Option<i64> {
        let start = self.request.as_ref()?.wall_time_ms;
        let end = self
            .stream_closed
            .as_ref()
            .map(|c| c.wall_time_ms)
            .or_else(|| self.finished.as_ref().map(|f| f.wall_time_ms))
            .or_else(|| self.failure.as_ref().map(|f| f.wall_time_ms))
            .or_else(|| self.response.as_ref().map(|r| r.wall_time_ms))?;
        Some(end - start)
    }
}

fn request_id_of(record: &NetworkEventRecord) -> Option<&str> {
    match record {
        NetworkEventRecord::RequestWillBeSent(_)
        | NetworkEventRecord::ResponseReceived(_)
        | NetworkEventRecord::RequestFailed(_)
        | NetworkEventRecord::RequestFinished(_)
        | NetworkEventRecord::ResponseStreamEvent(_)
        | NetworkEventRecord::ResponseStreamClosed(_) => record.entity_id(),
        _ => None,
    }
}

/// Single-writer store of request aggregates
pub struct RequestStore {
    table: Mutex<OrderedTable<RequestKey, RequestAggregate>>,
    snapshot_tx: watch::Sender<Vec<RequestAggregate>>,
}

impl RequestStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            table: Mutex::new(OrderedTable::new()),
            snapshot_tx,
        }
    }

    /// Subscribe to snapshots, republished after every mutation
    pub fn subscribe(&self) -> watch::Receiver<Vec<RequestAggregate>> {
        self.snapshot_tx.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Vec<RequestAggregate> {
        self.snapshot_tx.borrow().clone()
    }

    /// Keys present in the latest published snapshot
    pub fn keys(&self) -> HashSet<RequestKey> {
        self.snapshot_tx
            .borrow()
            .iter()
            .map(|aggregate| aggregate.key.clone())
            .collect()
    }

    pub async fn get(&self, key: &RequestKey) -> Option<RequestAggregate> {
        self.table.lock().await.get(key).cloned()
    }

    /// Apply one record; returns whether this store accepted it
    pub async fn handle(&self, server: &ServerIdentity, record: &NetworkEventRecord) -> bool {
        let Some(request_id) = request_id_of(record) else {
            return false;
        };
        let key = RequestKey::new(server.clone(), request_id);
        let now = Utc::now();

        let mut table = self.table.lock().await;
        let aggregate = table.upsert_with(key.clone(), || RequestAggregate::new(key, now));
        aggregate.apply(record, now);
        self.publish(&table);
        true
    }

    /// Write a fetched request body into the initiating record
    pub async fn set_request_body(
        &self,
        key: &RequestKey,
        body: String,
        encoding: BodyEncoding,
    ) -> bool {
        let mut table = self.table.lock().await;
        let Some(request) = table.get_mut(key).and_then(|a| a.request.as_mut()) else {
            return false;
        };
        request.post_data = Some(body);
        request.body_encoding = Some(encoding);
        request.has_post_data = true;
        if let Some(aggregate) = table.get_mut(key) {
            aggregate.last_updated_at = Utc::now();
        }
        self.publish(&table);
        true
    }

    /// Write a fetched response body into the response record
    pub async fn set_response_body(
        &self,
        key: &RequestKey,
        body: String,
        encoding: BodyEncoding,
    ) -> bool {
        let mut table = self.table.lock().await;
        let Some(response) = table.get_mut(key).and_then(|a| a.response.as_mut()) else {
            return false;
        };
        response.body = Some(body);
        response.body_encoding = Some(encoding);
        if let Some(aggregate) = table.get_mut(key) {
            aggregate.last_updated_at = Utc::now();
        }
        self.publish(&table);
        true
    }

    /// Evict failed, closed-stream, and finished non-streaming requests
    pub async fn clear_completed_entries(&self) -> usize {
        let mut table = self.table.lock().await;
        let removed = table.retain(|_, aggregate| !aggregate.is_complete());
        debug!("Cleared {} completed requests", removed);
        self.publish(&table);
        removed
    }

    /// Evict every aggregate belonging to `server`
    pub async fn remove_server(&self, server: &ServerIdentity) -> usize {
        let mut table = self.table.lock().await;
        let removed = table.retain(|key, _| &key.server != server);
        if removed > 0 {
            debug!("Removed {} requests for {}", removed, server);
        }
        self.publish(&table);
        removed
    }

    fn publish(&self, table: &OrderedTable<RequestKey, RequestAggregate>) {
        self.snapshot_tx.send_replace(table.snapshot());
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}
