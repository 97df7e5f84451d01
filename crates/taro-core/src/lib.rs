//! Taro Core - distributed lock manager and shared-object coordinator
//!
//! This crate provides:
//! - Lock table and lock manager (levels, upgrade, pinning, greedy, recall)
//! - Wait/notify coordination across nodes
//! - Transaction coordinator replicating ordered change sets
//! - Root registry with type-checked bindings and cache eviction
//! - Membership and reconnect service with ordered topology events
//! - Snapshot persistence for coordinator crash/restart

pub mod coordinator;
pub mod handler;
pub mod model;
pub mod service;

// Re-export commonly used types
pub use coordinator::Coordinator;
pub use model::Configuration;
pub use service::membership::{TopologyListener, TopologyPublisher};
