//! Membership and reconnect service
//!
//! Tracks node lifecycle `JOINING -> ACTIVE -> (DISCONNECTED -> RECONNECTING
//! -> ACTIVE) | LEFT`, demotes disconnected nodes inside a bounded grace
//! window, replays missed change sets on reconnection, and delivers topology
//! events to every listener exactly once per transition, in order:
//! `JOINED -> ENABLED -> {DISABLED -> ENABLED}* -> LEFT`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use taro_api::model::{
    Node, NodeId, NodeState, TopologyEvent, TopologyEventKind, TopologySnapshot,
};
use taro_api::remote::ServerPush;
use taro_common::TaroError;

use super::lock_manager::{HoldRecord, LockManager};
use super::remote::PushRegistry;
use super::root_registry::RootRegistry;
use super::transaction::TransactionCoordinator;

/// Trait for handling topology transitions
#[async_trait]
pub trait TopologyListener: Send + Sync {
    async fn on_topology_event(&self, event: &TopologyEvent);
}

/// Publishes topology events to registered listeners and subscribers
///
/// Listeners are awaited in registration order under the membership
/// transition lock, so every listener sees every transition exactly once and
/// in the same order.
pub struct TopologyPublisher {
    broadcast_tx: broadcast::Sender<TopologyEvent>,
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
}

impl TopologyPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));
        Self {
            broadcast_tx,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn TopologyListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!(total = listeners.len(), "registered topology listener");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.broadcast_tx.subscribe()
    }

    pub async fn publish(&self, event: &TopologyEvent) {
        let _ = self.broadcast_tx.send(event.clone());
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_topology_event(event).await;
        }
    }
}

/// A simple logging listener for debugging
pub struct LoggingTopologyListener;

#[async_trait]
impl TopologyListener for LoggingTopologyListener {
    async fn on_topology_event(&self, event: &TopologyEvent) {
        info!(
            kind = %event.kind,
            node = %event.node_id,
            version = event.version,
            "topology event"
        );
    }
}

/// Membership and reconnect service
///
/// Clone-able handle; all state lives behind shared maps, as the other
/// coordinator services do.
#[derive(Clone)]
pub struct MembershipService {
    nodes: Arc<DashMap<NodeId, Node>>,
    version: Arc<AtomicU64>,
    publisher: Arc<TopologyPublisher>,
    locks: Arc<LockManager>,
    txns: Arc<TransactionCoordinator>,
    roots: Arc<RootRegistry>,
    push: Arc<PushRegistry>,
    grace: Duration,
    /// Serializes every transition so events fire in topology order
    transition_mu: Arc<Mutex<()>>,
    /// Bumped on every disconnect; stale grace timers check it and stand down
    disconnect_epochs: Arc<DashMap<NodeId, u64>>,
    disconnect_records: Arc<DashMap<NodeId, Vec<HoldRecord>>>,
}

impl MembershipService {
    pub fn new(
        locks: Arc<LockManager>,
        txns: Arc<TransactionCoordinator>,
        roots: Arc<RootRegistry>,
        push: Arc<PushRegistry>,
        grace: Duration,
        event_queue_size: usize,
    ) -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            version: Arc::new(AtomicU64::new(0)),
            publisher: Arc::new(TopologyPublisher::new(event_queue_size)),
            locks,
            txns,
            roots,
            push,
            grace,
            transition_mu: Arc::new(Mutex::new(())),
            disconnect_epochs: Arc::new(DashMap::new()),
            disconnect_records: Arc::new(DashMap::new()),
        }
    }

    /// Recover known nodes from a snapshot, before `start`
    ///
    /// Recovered nodes come back DISCONNECTED; the DISABLED events fire from
    /// `start` so listeners registered after a restart observe them.
    pub fn recover(&self, topology_version: u64, node_ids: Vec<NodeId>) {
        self.version.store(topology_version, Ordering::SeqCst);
        for node_id in node_ids {
            let mut node = Node::new(node_id.clone());
            node.state = NodeState::Disconnected;
            self.nodes.insert(node_id, node);
        }
    }

    /// Announce recovered nodes and open their grace windows
    pub async fn start(&self) {
        let _guard = self.transition_mu.lock().await;
        let recovered: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|e| e.value().state == NodeState::Disconnected)
            .map(|e| e.key().clone())
            .collect();
        for node_id in recovered {
            info!(node = %node_id, "recovered node awaiting reconnection");
            self.publish_event(TopologyEventKind::Disabled, &node_id).await;
            self.arm_grace_timer(&node_id);
        }
    }

    /// Register a node, returning the topology it joined
    pub async fn join(&self, node_id: &str) -> Result<TopologySnapshot, TaroError> {
        let _guard = self.transition_mu.lock().await;
        if let Some(existing) = self.nodes.get(node_id) {
            let state = existing.state;
            drop(existing);
            match state {
                NodeState::Disconnected | NodeState::Reconnecting => {
                    return Err(TaroError::IllegalArgument(format!(
                        "node '{}' is inside its grace window; reconnect instead",
                        node_id
                    )));
                }
                NodeState::Left => {}
                _ => {
                    return Err(TaroError::IllegalArgument(format!(
                        "node '{}' already joined",
                        node_id
                    )));
                }
            }
        }

        self.nodes.insert(node_id.to_string(), Node::new(node_id));
        self.version.fetch_add(1, Ordering::SeqCst);
        info!(node = %node_id, "node joined");
        self.publish_event(TopologyEventKind::Joined, node_id).await;
        Ok(self.snapshot())
    }

    /// The node finished faulting its initial state; it is now fully active
    pub async fn sync_complete(&self, node_id: &str) -> Result<(), TaroError> {
        let _guard = self.transition_mu.lock().await;
        {
            let mut node = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| TaroError::UnknownNode(node_id.to_string()))?;
            if node.state != NodeState::Joining {
                return Err(TaroError::IllegalArgument(format!(
                    "node '{}' is {} rather than JOINING",
                    node_id, node.state
                )));
            }
            node.state = NodeState::Active;
            node.last_seen = taro_common::current_timestamp();
        }
        self.publish_event(TopologyEventKind::Enabled, node_id).await;
        Ok(())
    }

    /// Connection lost: demote the node and open its grace window
    ///
    /// Non-greedy holds are released so other nodes are not blocked
    /// indefinitely; greedy and pinned lock state and unacknowledged
    /// change-set sequences are retained until the window closes.
    pub async fn disconnect(&self, node_id: &str) -> Result<(), TaroError> {
        let _guard = self.transition_mu.lock().await;
        {
            let mut node = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| TaroError::UnknownNode(node_id.to_string()))?;
            if !node.is_connected() {
                return Err(TaroError::IllegalArgument(format!(
                    "node '{}' is not connected",
                    node_id
                )));
            }
            node.state = NodeState::Disconnected;
            node.last_seen = taro_common::current_timestamp();
        }

        let records = self.locks.release_for_disconnect(node_id).await;
        self.disconnect_records.insert(node_id.to_string(), records);
        self.txns.rollback_all(node_id);
        self.push.unregister(node_id);

        warn!(node = %node_id, grace_ms = self.grace.as_millis() as u64, "node disconnected");
        self.publish_event(TopologyEventKind::Disabled, node_id).await;
        self.arm_grace_timer(node_id);
        Ok(())
    }

    fn arm_grace_timer(&self, node_id: &str) {
        let epoch = {
            let mut entry = self
                .disconnect_epochs
                .entry(node_id.to_string())
                .or_insert(0);
            *entry += 1;
            *entry
        };
        let service = self.clone();
        let node_id = node_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            service.expire_grace(&node_id, epoch).await;
        });
    }

    /// Grace window expiry; fires exactly once per disconnect epoch
    async fn expire_grace(&self, node_id: &str, epoch: u64) {
        let _guard = self.transition_mu.lock().await;
        let current = self
            .disconnect_epochs
            .get(node_id)
            .map(|e| *e)
            .unwrap_or(0);
        if current != epoch {
            return;
        }
        let still_disconnected = self
            .nodes
            .get(node_id)
            .is_some_and(|n| n.state == NodeState::Disconnected);
        if !still_disconnected {
            return;
        }
        warn!(node = %node_id, "reconnect grace window expired");
        self.finalize_left(node_id).await;
    }

    /// Reconnect inside the grace window: replay missed change sets in
    /// commit order, restore prior holds, resume as ACTIVE
    ///
    /// The node's push channel must be re-registered before this call so
    /// replayed deliveries have somewhere to land.
    pub async fn reconnect(&self, node_id: &str) -> Result<TopologySnapshot, TaroError> {
        let _guard = self.transition_mu.lock().await;
        {
            let mut node = self.nodes.get_mut(node_id).ok_or_else(|| {
                TaroError::Timeout(format!(
                    "grace window for node '{}' expired; rejoin required",
                    node_id
                ))
            })?;
            match node.state {
                NodeState::Disconnected => {}
                NodeState::Left => {
                    return Err(TaroError::Timeout(format!(
                        "grace window for node '{}' expired; rejoin required",
                        node_id
                    )));
                }
                other => {
                    return Err(TaroError::IllegalArgument(format!(
                        "node '{}' is {} rather than DISCONNECTED",
                        node_id, other
                    )));
                }
            }
            node.state = NodeState::Reconnecting;
        }
        // Invalidate the armed grace timer
        self.disconnect_epochs
            .entry(node_id.to_string())
            .and_modify(|e| *e += 1)
            .or_insert(1);

        let replayed = self.txns.replay_missed(node_id);
        let records = self
            .disconnect_records
            .remove(node_id)
            .map(|(_, r)| r)
            .unwrap_or_default();
        let restored = self.locks.try_restore(node_id, &records).await;

        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.state = NodeState::Active;
            node.last_seen = taro_common::current_timestamp();
        }
        info!(node = %node_id, replayed, restored, "node reconnected");
        self.publish_event(TopologyEventKind::Enabled, node_id).await;
        Ok(self.snapshot())
    }

    /// Explicit final departure
    pub async fn leave(&self, node_id: &str) -> Result<(), TaroError> {
        let _guard = self.transition_mu.lock().await;
        if !self.nodes.contains_key(node_id) {
            return Err(TaroError::UnknownNode(node_id.to_string()));
        }
        self.finalize_left(node_id).await;
        Ok(())
    }

    /// Drop every trace of the node and fire LEFT; callers hold the
    /// transition lock
    async fn finalize_left(&self, node_id: &str) {
        self.locks.release_for_disconnect(node_id).await;
        self.locks.drop_retained_for(node_id).await;
        self.txns.forget_node(node_id);
        self.roots.unsubscribe_all(node_id);
        self.push.unregister(node_id);
        self.disconnect_records.remove(node_id);
        self.nodes.remove(node_id);
        self.version.fetch_add(1, Ordering::SeqCst);
        info!(node = %node_id, "node left");
        self.publish_event(TopologyEventKind::Left, node_id).await;
    }

    async fn publish_event(&self, kind: TopologyEventKind, node_id: &str) {
        let event = TopologyEvent::new(kind, node_id, self.version.load(Ordering::SeqCst));
        self.publisher.publish(&event).await;
        self.push.broadcast(&ServerPush::Topology(event));
    }

    /// Versioned ordered list of currently connected nodes
    pub fn snapshot(&self) -> TopologySnapshot {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| e.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.node_id.cmp(&b.node_id)));
        TopologySnapshot {
            version: self.version.load(Ordering::SeqCst),
            nodes,
        }
    }

    pub fn topology_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.get(node_id).map(|n| n.state)
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|n| n.is_connected())
    }

    pub fn require_connected(&self, node_id: &str) -> Result<(), TaroError> {
        if self.is_connected(node_id) {
            Ok(())
        } else {
            Err(TaroError::UnknownNode(node_id.to_string()))
        }
    }

    pub fn known_node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn register_listener(&self, listener: Arc<dyn TopologyListener>) {
        self.publisher.register_listener(listener).await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.publisher.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingListener {
        events: AsyncMutex<Vec<(TopologyEventKind, NodeId)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: AsyncMutex::new(Vec::new()),
            })
        }

        async fn recorded(&self) -> Vec<(TopologyEventKind, NodeId)> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait]
    impl TopologyListener for RecordingListener {
        async fn on_topology_event(&self, event: &TopologyEvent) {
            self.events
                .lock()
                .await
                .push((event.kind, event.node_id.clone()));
        }
    }

    fn service(grace: Duration) -> MembershipService {
        let push = Arc::new(PushRegistry::new());
        let locks = Arc::new(LockManager::new(push.clone()));
        let roots = Arc::new(RootRegistry::new());
        let txns = Arc::new(TransactionCoordinator::new(
            locks.clone(),
            roots.clone(),
            push.clone(),
        ));
        MembershipService::new(locks, txns, roots, push, grace, 64)
    }

    #[tokio::test]
    async fn test_join_sync_leave_event_order() {
        let membership = service(Duration::from_secs(30));
        let listener = RecordingListener::new();
        membership.register_listener(listener.clone()).await;

        membership.join("n0").await.unwrap();
        membership.sync_complete("n0").await.unwrap();
        membership.leave("n0").await.unwrap();

        assert_eq!(
            listener.recorded().await,
            vec![
                (TopologyEventKind::Joined, "n0".to_string()),
                (TopologyEventKind::Enabled, "n0".to_string()),
                (TopologyEventKind::Left, "n0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_join_without_sync_produces_no_enabled() {
        let membership = service(Duration::from_secs(30));
        let listener = RecordingListener::new();
        membership.register_listener(listener.clone()).await;

        membership.join("n1").await.unwrap();
        membership.leave("n1").await.unwrap();

        assert_eq!(
            listener.recorded().await,
            vec![
                (TopologyEventKind::Joined, "n1".to_string()),
                (TopologyEventKind::Left, "n1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_within_window() {
        let membership = service(Duration::from_secs(30));
        let listener = RecordingListener::new();
        membership.register_listener(listener.clone()).await;

        membership.join("n0").await.unwrap();
        membership.sync_complete("n0").await.unwrap();
        membership.disconnect("n0").await.unwrap();
        assert_eq!(membership.node_state("n0"), Some(NodeState::Disconnected));

        membership.reconnect("n0").await.unwrap();
        assert_eq!(membership.node_state("n0"), Some(NodeState::Active));

        assert_eq!(
            listener.recorded().await,
            vec![
                (TopologyEventKind::Joined, "n0".to_string()),
                (TopologyEventKind::Enabled, "n0".to_string()),
                (TopologyEventKind::Disabled, "n0".to_string()),
                (TopologyEventKind::Enabled, "n0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_grace_window_expiry_fires_once() {
        let membership = service(Duration::from_millis(40));
        let listener = RecordingListener::new();
        membership.register_listener(listener.clone()).await;

        membership.join("n0").await.unwrap();
        membership.sync_complete("n0").await.unwrap();
        membership.disconnect("n0").await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(membership.node_state("n0"), None);

        // Reconnect after expiry requires a fresh join
        assert!(matches!(
            membership.reconnect("n0").await,
            Err(TaroError::Timeout(_))
        ));

        let events = listener.recorded().await;
        let lefts = events
            .iter()
            .filter(|(k, _)| *k == TopologyEventKind::Left)
            .count();
        assert_eq!(lefts, 1);
    }

    #[tokio::test]
    async fn test_reconnect_cancels_grace_timer() {
        let membership = service(Duration::from_millis(40));
        membership.join("n0").await.unwrap();
        membership.sync_complete("n0").await.unwrap();
        membership.disconnect("n0").await.unwrap();
        membership.reconnect("n0").await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        // The stale timer stood down; the node is still a member
        assert_eq!(membership.node_state("n0"), Some(NodeState::Active));
    }

    #[tokio::test]
    async fn test_recovered_nodes_fire_disabled_on_start() {
        let membership = service(Duration::from_secs(30));
        membership.recover(5, vec!["n0".to_string()]);

        let listener = RecordingListener::new();
        membership.register_listener(listener.clone()).await;
        membership.start().await;

        assert_eq!(
            listener.recorded().await,
            vec![(TopologyEventKind::Disabled, "n0".to_string())]
        );
        assert_eq!(membership.topology_version(), 5);
        assert_eq!(membership.node_state("n0"), Some(NodeState::Disconnected));
    }

    #[tokio::test]
    async fn test_join_bumps_topology_version() {
        let membership = service(Duration::from_secs(30));
        assert_eq!(membership.topology_version(), 0);
        membership.join("a").await.unwrap();
        assert_eq!(membership.topology_version(), 1);
        membership.join("b").await.unwrap();
        assert_eq!(membership.topology_version(), 2);
        assert_eq!(membership.snapshot().nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_double_join_rejected() {
        let membership = service(Duration::from_secs(30));
        membership.join("a").await.unwrap();
        assert!(matches!(
            membership.join("a").await,
            Err(TaroError::IllegalArgument(_))
        ));
    }
}
