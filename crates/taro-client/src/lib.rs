//! Taro Client - node-side session SDK
//!
//! This crate provides:
//! - `NodeSession`: a node's connection to the coordinator, with a local
//!   cache of faulted roots kept current by server pushes
//! - `LockGuard`: scoped lock acquisition that releases on every exit path
//! - Reconnect handling that replays missed change sets

pub mod error;
pub mod session;

pub use error::ClientError;
pub use session::{LockGuard, NodeSession};
