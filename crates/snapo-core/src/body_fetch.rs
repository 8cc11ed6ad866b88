//! On-demand body fetching
//!
//! Request and response bodies are not pushed by the app; the host asks for
//! them with a numbered command and the answer comes back as a command
//! result. The coordinator decides which bodies are worth asking for, makes
//! sure only one command per body is in flight, and writes the answer back
//! into the request store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::protocol::{methods, network_command, NETWORK_FEATURE, NO_BODY_CAPTURED};
use crate::records::{header_value, BodyEncoding};
use crate::server::ServerIdentity;
use crate::store::{RequestAggregate, RequestKey, RequestStore};
use crate::translator::CommandResult;

const EVENT_CAPACITY: usize = 256;

/// Delivers feature commands to a server connection
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Returns whether the command was written to the connection
    async fn send_feature_command(
        &self,
        server: &ServerIdentity,
        feature: &str,
        payload: Value,
    ) -> bool;
}

/// Which body of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Request,
    Response,
}

impl BodyKind {
    fn method(self) -> &'static str {
        match self {
            BodyKind::Request => methods::GET_REQUEST_POST_DATA,
            BodyKind::Response => methods::GET_RESPONSE_BODY,
        }
    }
}

/// How a body fetch ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum BodyFetchOutcome {
    /// The body was written into the aggregate
    Stored,
    /// The app kept no body for this request
    NoBodyCaptured,
    /// Any other error reported by the app, or an unusable result
    Failed(String),
}

/// Published once per resolved body fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyFetchEvent {
    pub key: RequestKey,
    pub kind: BodyKind,
    pub outcome: BodyFetchOutcome,
}

/// Whether the outgoing body should be fetched
pub fn needs_request_body(aggregate: &RequestAggregate) -> bool {
    let Some(request) = &aggregate.request else {
        return false;
    };
    if request.post_data.is_some() || request.body_size == Some(0) {
        return false;
    }
    if declared_length(&request.headers) == Some(0) {
        return false;
    }
    request.has_post_data || request.body_size.is_some_and(|size| size > 0)
}

/// Whether the response body should be fetched
pub fn needs_response_body(aggregate: &RequestAggregate) -> bool {
    let Some(response) = &aggregate.response else {
        return false;
    };
    if response.body.is_some() || aggregate.failure.is_some() {
        return false;
    }
    if aggregate
        .method()
        .is_some_and(|method| method.eq_ignore_ascii_case("HEAD"))
    {
        return false;
    }
    if matches!(response.status, 100..=199 | 204 | 205 | 304) {
        return false;
    }
    if response.body_size == Some(0) || declared_length(&response.headers) == Some(0) {
        return false;
    }
    if aggregate
        .finished
        .as_ref()
        .is_some_and(|f| f.encoded_data_length == Some(0))
    {
        return false;
    }
    // Event streams are only fetched once closed
    !aggregate.is_streaming() || aggregate.stream_closed.is_some()
}

fn declared_length(headers: &[crate::records::HttpHeader]) -> Option<u64> {
    header_value(headers, "content-length").and_then(|v| v.trim().parse().ok())
}

type BodyKey = (RequestKey, BodyKind);

#[derive(Default)]
struct FetchState {
    next_id: u64,
    pending: HashMap<u64, BodyKey>,
    in_flight: HashSet<BodyKey>,
    attempts: HashMap<BodyKey, u32>,
}

/// Dispatches body fetch commands and resolves their results
pub struct BodyFetchCoordinator {
    store: Arc<RequestStore>,
    sender: Arc<dyn CommandSender>,
    max_attempts: u32,
    state: Mutex<FetchState>,
    events_tx: broadcast::Sender<BodyFetchEvent>,
}

impl BodyFetchCoordinator {
    pub fn new(store: Arc<RequestStore>, sender: Arc<dyn CommandSender>, max_attempts: u32) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            sender,
            max_attempts,
            state: Mutex::new(FetchState::default()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BodyFetchEvent> {
        self.events_tx.subscribe()
    }

    /// Ask for whichever bodies of a request are still missing
    ///
    /// Returns how many commands were dispatched.
    pub async fn request_bodies_for_request(&self, key: &RequestKey) -> usize {
        let reserved = self.reserve(key).await;
        let mut dispatched = 0;

        for (id, kind) in reserved {
            let payload = network_command(id, kind.method(), json!({ "requestId": key.request_id }));
            if self
                .sender
                .send_feature_command(&key.server, NETWORK_FEATURE, payload)
                .await
            {
                debug!("Requested {:?} body of {} (command {})", kind, key.request_id, id);
                dispatched += 1;
            } else {
                warn!(
                    "Failed to dispatch {:?} body fetch for {} on {}",
                    kind, key.request_id, key.server
                );
                self.release_failed_dispatch(id, (key.clone(), kind)).await;
            }
        }
        dispatched
    }

    /// Pick the bodies to fetch and mark them in flight
    async fn reserve(&self, key: &RequestKey) -> Vec<(u64, BodyKind)> {
        let mut state = self.state.lock().await;
        // Read under the fetch lock so a result landing concurrently is seen
        let Some(aggregate) = self.store.get(key).await else {
            return Vec::new();
        };

        let mut reserved = Vec::new();
        for kind in [BodyKind::Request, BodyKind::Response] {
            let needed = match kind {
                BodyKind::Request => needs_request_body(&aggregate),
                BodyKind::Response => needs_response_body(&aggregate),
            };
            if !needed {
                continue;
            }

            let body_key = (key.clone(), kind);
            if state.in_flight.contains(&body_key) {
                continue;
            }
            let attempts = state.attempts.entry(body_key.clone()).or_insert(0);
            if *attempts >= self.max_attempts {
                debug!("Giving up on {:?} body of {}", kind, key.request_id);
                continue;
            }
            *attempts += 1;

            state.next_id += 1;
            let id = state.next_id;
            state.pending.insert(id, body_key.clone());
            state.in_flight.insert(body_key);
            reserved.push((id, kind));
        }
        reserved
    }

    async fn release_failed_dispatch(&self, id: u64, body_key: BodyKey) {
        let mut state = self.state.lock().await;
        state.pending.remove(&id);
        if let Some(attempts) = state.attempts.get_mut(&body_key) {
            *attempts = attempts.saturating_sub(1);
        }
        state.in_flight.remove(&body_key);
    }

    /// Resolve a command result; `None` if it doesn't answer a body fetch
    pub async fn handle_command_result(
        &self,
        server: &ServerIdentity,
        result: CommandResult,
    ) -> Option<BodyFetchOutcome> {
        let (key, kind) = {
            let state = self.state.lock().await;
            match state.pending.get(&result.id) {
                Some((key, kind)) if &key.server == server => (key.clone(), *kind),
                _ => {
                    debug!("Ignoring result {} from {}", result.id, server);
                    return None;
                }
            }
        };

        let outcome = match result.outcome {
            Err(message) if message == NO_BODY_CAPTURED => BodyFetchOutcome::NoBodyCaptured,
            Err(message) => BodyFetchOutcome::Failed(message),
            Ok(value) => self.store_body(&key, kind, &value).await,
        };

        {
            let mut state = self.state.lock().await;
            state.pending.remove(&result.id);
            let body_key = (key.clone(), kind);
            match &outcome {
                BodyFetchOutcome::NoBodyCaptured => {
                    state.attempts.insert(body_key.clone(), self.max_attempts);
                }
                // The body is in the store now, so the key won't be asked for again
                BodyFetchOutcome::Stored => {
                    state.attempts.remove(&body_key);
                }
                BodyFetchOutcome::Failed(_) => {}
            }
            state.in_flight.remove(&body_key);
        }

        match &outcome {
            BodyFetchOutcome::Stored => debug!("Stored {:?} body of {}", kind, key.request_id),
            BodyFetchOutcome::NoBodyCaptured => {
                info!("No {:?} body captured for {}", kind, key.request_id)
            }
            BodyFetchOutcome::Failed(message) => {
                warn!("{:?} body fetch for {} failed: {}", kind, key.request_id, message)
            }
        }
        let _ = self.events_tx.send(BodyFetchEvent {
            key,
            kind,
            outcome: outcome.clone(),
        });
        Some(outcome)
    }

    async fn store_body(&self, key: &RequestKey, kind: BodyKind, value: &Value) -> BodyFetchOutcome {
        let field = match kind {
            BodyKind::Request => "postData",
            BodyKind::Response => "body",
        };
        let Some(body) = value
            .get(field)
            .or_else(|| value.get("body"))
            .and_then(Value::as_str)
        else {
            return BodyFetchOutcome::Failed(format!("Result has no {field}"));
        };
        let encoding = BodyEncoding::from_base64_flag(
            value
                .get("base64Encoded")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        );

        let stored = match kind {
            BodyKind::Request => {
                self.store
                    .set_request_body(key, body.to_string(), encoding)
                    .await
            }
            BodyKind::Response => {
                self.store
                    .set_response_body(key, body.to_string(), encoding)
                    .await
            }
        };
        if stored {
            BodyFetchOutcome::Stored
        } else {
            BodyFetchOutcome::Failed("Request is no longer tracked".to_string())
        }
    }

    /// Forget every fetch belonging to a removed server
    pub async fn remove_server(&self, server: &ServerIdentity) {
        let mut state = self.state.lock().await;
        state.pending.retain(|_, (key, _)| &key.server != server);
        state.in_flight.retain(|(key, _)| &key.server != server);
        state.attempts.retain(|(key, _), _| &key.server != server);
    }

    /// Drop attempt counts for requests the store no longer holds
    ///
    /// Returns how many counts were dropped.
    pub async fn forget_evicted(&self) -> usize {
        let live = self.store.keys();
        let mut state = self.state.lock().await;
        let before = state.attempts.len();
        state.attempts.retain(|(key, _), _| live.contains(key));
        before - state.attempts.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    #[cfg(test)]
    async fn tracked_attempts(&self) -> usize {
        self.state.lock().await.attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{HttpHeader, NetworkEventRecord, RequestFinished, RequestWillBeSent};
    use crate::store::requests::fixtures::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSender {
        sent: std::sync::Mutex<Vec<(ServerIdentity, String, Value)>>,
        failing: AtomicBool,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(ServerIdentity, String, Value)> {
            self.sent.lock().unwrap().clone()
        }

        fn last_id(&self) -> u64 {
            self.sent().last().unwrap().2["id"].as_u64().unwrap()
        }
    }

    #[async_trait]
    impl CommandSender for RecordingSender {
        async fn send_feature_command(
            &self,
            server: &ServerIdentity,
            feature: &str,
            payload: Value,
        ) -> bool {
            if self.failing.load(Ordering::SeqCst) {
                return false;
            }
            tokio::task::yield_now().await;
            self.sent
                .lock()
                .unwrap()
                .push((server.clone(), feature.to_string(), payload));
            true
        }
    }

    fn server() -> ServerIdentity {
        ServerIdentity::new("emulator-5554", "1234")
    }

    fn aggregate(records: &[NetworkEventRecord]) -> RequestAggregate {
        let now = Utc::now();
        let mut aggregate = RequestAggregate::new(RequestKey::new(server(), "r1"), now);
        for record in records {
            aggregate.apply(record, now);
        }
        aggregate
    }

    async fn setup(
        records: &[NetworkEventRecord],
        max_attempts: u32,
    ) -> (Arc<RequestStore>, Arc<RecordingSender>, BodyFetchCoordinator) {
        let store = Arc::new(RequestStore::new());
        for record in records {
            store.handle(&server(), record).await;
        }
        let sender = Arc::new(RecordingSender::default());
        let coordinator = BodyFetchCoordinator::new(store.clone(), sender.clone(), max_attempts);
        (store, sender, coordinator)
    }

    fn key() -> RequestKey {
        RequestKey::new(server(), "r1")
    }

    #[test]
    fn test_bodyless_responses() {
        let head = aggregate(&[request("r1", "HEAD"), response("r1", 200, vec![])]);
        assert!(!needs_response_body(&head));

        let no_content = aggregate(&[request("r1", "POST"), response("r1", 204, vec![])]);
        assert!(!needs_response_body(&no_content));

        for status in [101, 205, 304] {
            let bodyless = aggregate(&[request("r1", "GET"), response("r1", status, vec![])]);
            assert!(!needs_response_body(&bodyless), "status {status}");
        }

        let empty = aggregate(&[
            request("r1", "GET"),
            response("r1", 200, vec![HttpHeader::new("Content-Length", "0")]),
        ]);
        assert!(!needs_response_body(&empty));

        let finished_empty = aggregate(&[
            request("r1", "GET"),
            response("r1", 200, vec![]),
            NetworkEventRecord::RequestFinished(RequestFinished {
                request_id: "r1".to_string(),
                wall_time_ms: 1_300,
                encoded_data_length: Some(0),
            }),
        ]);
        assert!(!needs_response_body(&finished_empty));

        let unknown_length = aggregate(&[request("r1", "GET"), response("r1", 200, vec![])]);
        assert!(needs_response_body(&unknown_length));
    }

    #[test]
    fn test_response_body_not_needed_without_response_or_after_failure() {
        assert!(!needs_response_body(&aggregate(&[request("r1", "GET")])));
        assert!(!needs_response_body(&aggregate(&[
            request("r1", "GET"),
            failure("r1", "timeout"),
        ])));
    }

    #[test]
    fn test_event_stream_waits_for_close() {
        let open = aggregate(&[
            request("r1", "GET"),
            sse_response("r1"),
            stream_event("r1", 0, "a"),
        ]);
        assert!(!needs_response_body(&open));

        let closed = aggregate(&[
            request("r1", "GET"),
            sse_response("r1"),
            stream_event("r1", 0, "a"),
            stream_closed("r1"),
        ]);
        assert!(needs_response_body(&closed));
    }

    #[test]
    fn test_request_body_predicate() {
        assert!(!needs_request_body(&aggregate(&[request("r1", "GET")])));

        let NetworkEventRecord::RequestWillBeSent(mut post) = request("r1", "POST") else {
            unreachable!()
        };
        post.has_post_data = true;
        let pending = aggregate(&[NetworkEventRecord::RequestWillBeSent(post.clone())]);
        assert!(needs_request_body(&pending));

        post.post_data = Some("{}".to_string());
        let captured = aggregate(&[NetworkEventRecord::RequestWillBeSent(post)]);
        assert!(!needs_request_body(&captured));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_dispatch_once() {
        let (store, sender, coordinator) =
            setup(&[request("r1", "GET"), response("r1", 200, vec![])], 3).await;

        let request_key = key();
        let (a, b) = tokio::join!(
            coordinator.request_bodies_for_request(&request_key),
            coordinator.request_bodies_for_request(&request_key)
        );
        assert_eq!(a + b, 1);
        assert_eq!(sender.sent().len(), 1);

        let (target, feature, payload) = sender.sent().remove(0);
        assert_eq!(target, server());
        assert_eq!(feature, "network");
        assert_eq!(payload["method"], "Network.getResponseBody");
        assert_eq!(payload["params"]["requestId"], "r1");

        let outcome = coordinator
            .handle_command_result(
                &server(),
                CommandResult {
                    id: sender.last_id(),
                    outcome: Ok(json!({"body": "aGk=", "base64Encoded": true})),
                },
            )
            .await;
        assert_eq!(outcome, Some(BodyFetchOutcome::Stored));

        let stored = store.get(&key()).await.unwrap();
        let response = stored.response.as_ref().unwrap();
        assert_eq!(response.body.as_deref(), Some("aGk="));
        assert_eq!(response.body_encoding, Some(BodyEncoding::Base64));
        assert_eq!(response.status, 200);
        assert!(stored.request.as_ref().unwrap().post_data.is_none());

        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 0);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_no_body_captured_is_final() {
        let (_store, sender, coordinator) =
            setup(&[request("r1", "GET"), response("r1", 200, vec![])], 3).await;
        let mut events = coordinator.subscribe();

        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 1);
        let outcome = coordinator
            .handle_command_result(
                &server(),
                CommandResult {
                    id: sender.last_id(),
                    outcome: Err("No body captured".to_string()),
                },
            )
            .await;
        assert_eq!(outcome, Some(BodyFetchOutcome::NoBodyCaptured));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, BodyKind::Response);
        assert_eq!(event.outcome, BodyFetchOutcome::NoBodyCaptured);

        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 0);
    }

    #[tokio::test]
    async fn test_failures_retry_until_attempts_run_out() {
        let (_store, sender, coordinator) =
            setup(&[request("r1", "GET"), response("r1", 200, vec![])], 2).await;

        for _ in 0..2 {
            assert_eq!(coordinator.request_bodies_for_request(&key()).await, 1);
            let outcome = coordinator
                .handle_command_result(
                    &server(),
                    CommandResult {
                        id: sender.last_id(),
                        outcome: Err("Connection reset".to_string()),
                    },
                )
                .await;
            assert_eq!(
                outcome,
                Some(BodyFetchOutcome::Failed("Connection reset".to_string()))
            );
        }
        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_releases_in_flight() {
        let (_store, sender, coordinator) =
            setup(&[request("r1", "GET"), response("r1", 200, vec![])], 1).await;

        sender.failing.store(true, Ordering::SeqCst);
        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 0);
        assert_eq!(coordinator.pending_count().await, 0);

        sender.failing.store(false, Ordering::SeqCst);
        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 1);
    }

    #[tokio::test]
    async fn test_request_body_is_written_to_request() {
        let post = NetworkEventRecord::RequestWillBeSent(RequestWillBeSent {
            request_id: "r1".to_string(),
            wall_time_ms: 1_000,
            url: "https://example.com/upload".to_string(),
            method: "POST".to_string(),
            headers: vec![],
            post_data: None,
            has_post_data: true,
            body_size: Some(2),
            body_encoding: None,
        });
        let (store, sender, coordinator) = setup(&[post], 3).await;

        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 1);
        assert_eq!(sender.sent()[0].2["method"], "Network.getRequestPostData");

        let outcome = coordinator
            .handle_command_result(
                &server(),
                CommandResult {
                    id: sender.last_id(),
                    outcome: Ok(json!({"postData": "{}"})),
                },
            )
            .await;
        assert_eq!(outcome, Some(BodyFetchOutcome::Stored));

        let stored = store.get(&key()).await.unwrap();
        let request = stored.request.unwrap();
        assert_eq!(request.post_data.as_deref(), Some("{}"));
        assert_eq!(request.body_encoding, Some(BodyEncoding::Text));
        assert!(stored.response.is_none());
    }

    #[tokio::test]
    async fn test_results_for_other_servers_or_ids_are_ignored() {
        let (_store, sender, coordinator) =
            setup(&[request("r1", "GET"), response("r1", 200, vec![])], 3).await;
        coordinator.request_bodies_for_request(&key()).await;
        let id = sender.last_id();

        let other = ServerIdentity::new("emulator-5556", "1234");
        let result = CommandResult {
            id,
            outcome: Ok(json!({"body": "x"})),
        };
        assert_eq!(coordinator.handle_command_result(&other, result.clone()).await, None);
        let unknown = CommandResult {
            id: id + 100,
            outcome: Ok(json!({"body": "x"})),
        };
        assert_eq!(coordinator.handle_command_result(&server(), unknown).await, None);
        assert_eq!(coordinator.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_server_purges_bookkeeping() {
        let (_store, sender, coordinator) =
            setup(&[request("r1", "GET"), response("r1", 200, vec![])], 3).await;
        coordinator.request_bodies_for_request(&key()).await;
        let id = sender.last_id();

        coordinator.remove_server(&server()).await;
        assert_eq!(coordinator.pending_count().await, 0);
        let result = CommandResult {
            id,
            outcome: Ok(json!({"body": "x"})),
        };
        assert_eq!(coordinator.handle_command_result(&server(), result).await, None);
    }

    #[tokio::test]
    async fn test_unknown_request_dispatches_nothing() {
        let (_store, sender, coordinator) = setup(&[], 3).await;
        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 0);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stored_body_drops_attempt_count() {
        let (_store, sender, coordinator) =
            setup(&[request("r1", "GET"), response("r1", 200, vec![])], 3).await;

        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 1);
        assert_eq!(coordinator.tracked_attempts().await, 1);
        let outcome = coordinator
            .handle_command_result(
                &server(),
                CommandResult {
                    id: sender.last_id(),
                    outcome: Ok(json!({"body": "{}"})),
                },
            )
            .await;
        assert_eq!(outcome, Some(BodyFetchOutcome::Stored));
        assert_eq!(coordinator.tracked_attempts().await, 0);
        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 0);
    }

    #[tokio::test]
    async fn test_forget_evicted_drops_cleared_requests() {
        let (store, sender, coordinator) = setup(
            &[
                request("r1", "GET"),
                response("r1", 200, vec![]),
                request("r2", "GET"),
            ],
            3,
        )
        .await;

        assert_eq!(coordinator.request_bodies_for_request(&key()).await, 1);
        coordinator
            .handle_command_result(
                &server(),
                CommandResult {
                    id: sender.last_id(),
                    outcome: Err("No body captured".to_string()),
                },
            )
            .await;
        assert_eq!(coordinator.tracked_attempts().await, 1);

        // Nothing evicted yet
        assert_eq!(coordinator.forget_evicted().await, 0);

        assert_eq!(store.clear_completed_entries().await, 1);
        assert_eq!(coordinator.forget_evicted().await, 1);
        assert_eq!(coordinator.tracked_attempts().await, 0);
        assert!(store.get(&RequestKey::new(server(), "r2")).await.is_some());
    }
}
