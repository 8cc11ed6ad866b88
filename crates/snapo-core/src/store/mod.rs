//! Event-sourced aggregate stores
//!
//! Each store owns its aggregates behind a single mutex, folds one record per
//! `handle` call, and republishes an ordered snapshot after every mutation.
//! Observers only ever see cloned snapshots.

mod table;

pub mod requests;
pub mod websockets;

pub use requests::{RequestAggregate, RequestKey, RequestStore};
pub use websockets::{SocketKey, WebSocketAggregate, WebSocketStore};
