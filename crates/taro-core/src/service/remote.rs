// Per-node push channel registry
// Asynchronous notifications (recall, topology, change-set delivery) flow to
// nodes over the channel registered when the node's connection is accepted.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use taro_api::model::NodeId;
use taro_api::remote::ServerPush;

/// Registry of connected nodes' push channels
#[derive(Default)]
pub struct PushRegistry {
    channels: DashMap<NodeId, mpsc::UnboundedSender<ServerPush>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a push channel for a node, replacing any stale one
    pub fn register(&self, node: &str) -> mpsc::UnboundedReceiver<ServerPush> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(node.to_string(), tx);
        debug!(node = %node, "registered push channel");
        rx
    }

    /// Drop a node's push channel (connection lost or node left)
    pub fn unregister(&self, node: &str) {
        self.channels.remove(node);
        debug!(node = %node, "unregistered push channel");
    }

    pub fn is_connected(&self, node: &str) -> bool {
        self.channels.contains_key(node)
    }

    /// Send a push to one node
    ///
    /// Returns `false` if the node has no live channel; callers that need
    /// delivery guarantees queue the payload for replay instead.
    pub fn send(&self, node: &str, push: ServerPush) -> bool {
        match self.channels.get(node) {
            Some(tx) => tx.send(push).is_ok(),
            None => false,
        }
    }

    /// Send a push to every connected node
    pub fn broadcast(&self, push: &ServerPush) {
        for entry in self.channels.iter() {
            let _ = entry.value().send(push.clone());
        }
    }

    pub fn connected_count(&self) -> usize {
        self.channels.len()
    }
}
