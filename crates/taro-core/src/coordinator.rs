//! Coordinator facade wiring the services together
//!
//! Owns startup (snapshot recovery before any request is accepted) and
//! shutdown, and orchestrates the operations that span services: a commit
//! flushes the open change set before the lock is released, a wait flushes
//! before the hold is relinquished, a disconnect rolls back and demotes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{info, warn};

use taro_api::change::ChangeEntry;
use taro_api::model::{
    LockLevel, NodeState, RootScope, RootType, TopologyEvent, TopologySnapshot,
};
use taro_api::remote::{BeginLockOutcome, ServerPush, WaitOutcome};
use taro_common::TaroError;

use crate::model::Configuration;
use crate::service::lock_manager::{CommitOutcome, LockInfo, LockManager};
use crate::service::membership::{LoggingTopologyListener, MembershipService, TopologyListener};
use crate::service::remote::PushRegistry;
use crate::service::root_registry::RootRegistry;
use crate::service::snapshot::{DurableState, NodeDurable, SnapshotStore};
use crate::service::transaction::TransactionCoordinator;
use crate::service::wait_notify::WaitNotify;

pub struct Coordinator {
    config: Configuration,
    push: Arc<PushRegistry>,
    locks: Arc<LockManager>,
    roots: Arc<RootRegistry>,
    txns: Arc<TransactionCoordinator>,
    wait_notify: WaitNotify,
    membership: MembershipService,
    snapshot: SnapshotStore,
    running: Arc<RwLock<bool>>,
}

impl Coordinator {
    /// Build a coordinator, reconstructing lock/greedy/pinned state from the
    /// persisted snapshot before any request is accepted
    pub async fn new(config: Configuration) -> anyhow::Result<Self> {
        let push = Arc::new(PushRegistry::new());
        let locks = Arc::new(LockManager::new(push.clone()));
        let roots = Arc::new(RootRegistry::new());
        let txns = Arc::new(TransactionCoordinator::new(
            locks.clone(),
            roots.clone(),
            push.clone(),
        ));
        let wait_notify = WaitNotify::new(locks.clone());
        let membership = MembershipService::new(
            locks.clone(),
            txns.clone(),
            roots.clone(),
            push.clone(),
            config.reconnect_grace(),
            config.event_queue_size(),
        );
        let snapshot = SnapshotStore::new(config.snapshot_path());

        let coordinator = Self {
            config,
            push,
            locks,
            roots,
            txns,
            wait_notify,
            membership,
            snapshot,
            running: Arc::new(RwLock::new(false)),
        };
        coordinator.recover().await?;
        Ok(coordinator)
    }

    async fn recover(&self) -> anyhow::Result<()> {
        let Some(state) = self.snapshot.load().await? else {
            return Ok(());
        };
        self.locks.load_durable(state.locks).await;
        self.roots.load_durable(state.roots);
        self.txns.load_durable(
            state.commit_seq,
            state
                .nodes
                .iter()
                .map(|n| (n.node_id.clone(), n.published_seq))
                .collect(),
        );
        self.membership.recover(
            state.topology_version,
            state.nodes.into_iter().map(|n| n.node_id).collect(),
        );
        info!("coordinator state reconstructed from snapshot");
        Ok(())
    }

    /// Start serving: announces recovered nodes and opens their grace windows
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        self.membership
            .register_listener(Arc::new(LoggingTopologyListener))
            .await;
        self.membership.start().await;
        *running = true;
        info!("coordinator started");
        Ok(())
    }

    /// Persist the durable fraction and stop accepting work
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        self.persist().await;
        *running = false;
        info!("coordinator stopped");
    }

    // ----- membership surface -----

    /// Admit a node; returns the topology and the node's push channel
    pub async fn join(
        &self,
        node_id: &str,
    ) -> Result<(TopologySnapshot, mpsc::UnboundedReceiver<ServerPush>), TaroError> {
        self.require_running().await?;
        let rx = self.push.register(node_id);
        match self.membership.join(node_id).await {
            Ok(snapshot) => {
                self.persist().await;
                Ok((snapshot, rx))
            }
            Err(err) => {
                self.push.unregister(node_id);
                Err(err)
            }
        }
    }

    pub async fn sync_complete(&self, node_id: &str) -> Result<(), TaroError> {
        self.membership.sync_complete(node_id).await
    }

    /// Reconnect inside the grace window; missed change sets are replayed
    /// onto the returned push channel in commit order
    pub async fn reconnect(
        &self,
        node_id: &str,
    ) -> Result<(TopologySnapshot, mpsc::UnboundedReceiver<ServerPush>), TaroError> {
        self.require_running().await?;
        let rx = self.push.register(node_id);
        match self.membership.reconnect(node_id).await {
            Ok(snapshot) => Ok((snapshot, rx)),
            Err(err) => {
                self.push.unregister(node_id);
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self, node_id: &str) -> Result<(), TaroError> {
        self.membership.disconnect(node_id).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn leave(&self, node_id: &str) -> Result<(), TaroError> {
        self.membership.leave(node_id).await?;
        self.persist().await;
        Ok(())
    }

    // ----- lock surface -----

    pub async fn begin_lock(
        &self,
        node_id: &str,
        lock_id: &str,
        level: LockLevel,
        greedy: bool,
    ) -> Result<BeginLockOutcome, TaroError> {
        self.membership.require_connected(node_id)?;
        self.locks.begin_lock(node_id, lock_id, level, greedy).await
    }

    /// Flush the node's pending change set, then release or retain the hold
    pub async fn commit_lock(
        &self,
        node_id: &str,
        lock_id: &str,
    ) -> Result<CommitOutcome, TaroError> {
        self.membership.require_connected(node_id)?;
        self.txns.flush(node_id, lock_id).await?;
        let outcome = self.locks.commit_lock(node_id, lock_id).await?;
        self.persist().await;
        Ok(outcome)
    }

    /// Discard the open change set and release without greedy retention
    pub async fn abort_lock(&self, node_id: &str, lock_id: &str) -> Result<(), TaroError> {
        self.txns.rollback(node_id, lock_id);
        self.locks.abort_lock(node_id, lock_id).await?;
        self.persist().await;
        Ok(())
    }

    pub async fn pin_lock(&self, lock_id: &str) {
        self.locks.pin_lock(lock_id).await;
        self.persist().await;
    }

    pub async fn evict_lock(&self, lock_id: &str) -> Result<(), TaroError> {
        self.locks.evict_lock(lock_id).await?;
        self.persist().await;
        Ok(())
    }

    // ----- wait/notify surface -----

    /// Flush pending changes, release the hold, park until notified or the
    /// bound expires, then re-acquire the prior level
    pub async fn wait(
        &self,
        node_id: &str,
        lock_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, TaroError> {
        self.membership.require_connected(node_id)?;
        self.txns.flush(node_id, lock_id).await?;
        self.wait_notify.wait(node_id, lock_id, timeout).await
    }

    pub async fn notify(&self, lock_id: &str) -> usize {
        self.wait_notify.notify(lock_id).await
    }

    pub async fn notify_all(&self, lock_id: &str) -> usize {
        self.wait_notify.notify_all(lock_id).await
    }

    pub async fn interrupt_wait(&self, node_id: &str, lock_id: &str) -> bool {
        self.wait_notify.interrupt(node_id, lock_id).await
    }

    // ----- root and transaction surface -----

    pub async fn bind_root(
        &self,
        node_id: &str,
        scope: RootScope,
        root: &str,
        root_type: RootType,
        initial: serde_json::Value,
    ) -> Result<(), TaroError> {
        self.membership.require_connected(node_id)?;
        self.roots.bind(node_id, scope, root, root_type, initial)?;
        self.persist().await;
        Ok(())
    }

    pub async fn fault_root(
        &self,
        node_id: &str,
        scope: RootScope,
        root: &str,
    ) -> Result<serde_json::Value, TaroError> {
        self.membership.require_connected(node_id)?;
        self.roots.fault(node_id, scope, root)
    }

    pub fn read_entry(
        &self,
        scope: RootScope,
        root: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, TaroError> {
        self.roots.read_entry(scope, root, key)
    }

    pub async fn evict_cache(
        &self,
        scope: RootScope,
        root: &str,
        target: usize,
    ) -> Result<usize, TaroError> {
        self.roots.evict_cache(scope, root, target)
    }

    pub async fn record_mutation(
        &self,
        node_id: &str,
        lock_id: &str,
        entry: ChangeEntry,
    ) -> Result<(), TaroError> {
        self.membership.require_connected(node_id)?;
        self.txns.record_mutation(node_id, lock_id, entry).await
    }

    pub async fn publish_change_set(
        &self,
        node_id: &str,
        lock_id: &str,
        seq: u64,
        ops: Vec<ChangeEntry>,
    ) -> Result<u64, TaroError> {
        self.membership.require_connected(node_id)?;
        let ack = self.txns.publish_change_set(node_id, lock_id, seq, ops).await?;
        self.persist().await;
        Ok(ack)
    }

    pub fn ack_delivery(&self, node_id: &str, commit_seq: u64) {
        self.txns.ack_delivery(node_id, commit_seq);
    }

    // ----- introspection -----

    pub fn topology(&self) -> TopologySnapshot {
        self.membership.snapshot()
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.membership.node_state(node_id)
    }

    pub async fn lock_info(&self, lock_id: &str) -> Option<LockInfo> {
        self.locks.lock_info(lock_id).await
    }

    pub fn root_value(&self, scope: RootScope, root: &str) -> Option<serde_json::Value> {
        self.roots.value_of(scope, root)
    }

    pub async fn register_listener(&self, listener: Arc<dyn TopologyListener>) {
        self.membership.register_listener(listener).await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.membership.subscribe_events()
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Snapshot recovery must finish (via `start`) before nodes are admitted
    async fn require_running(&self) -> Result<(), TaroError> {
        if *self.running.read().await {
            Ok(())
        } else {
            Err(TaroError::CoordinatorUnavailable(
                "coordinator not started".to_string(),
            ))
        }
    }

    /// Write the durable fraction; persistence failures are logged rather
    /// than failing the triggering operation
    async fn persist(&self) {
        if !self.snapshot.is_enabled() {
            return;
        }
        let watermarks = self.txns.durable_watermarks();
        let mut nodes: Vec<NodeDurable> = self
            .membership
            .known_node_ids()
            .into_iter()
            .map(|node_id| {
                let published_seq = watermarks
                    .iter()
                    .find(|(n, _)| *n == node_id)
                    .map(|(_, s)| *s)
                    .unwrap_or(0);
                NodeDurable {
                    node_id,
                    published_seq,
                }
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let state = DurableState {
            topology_version: self.membership.topology_version(),
            commit_seq: self.txns.current_commit_seq(),
            locks: self.locks.durable_fraction().await,
            roots: self.roots.durable(),
            nodes,
        };
        if let Err(err) = self.snapshot.save(&state).await {
            warn!(error = %err, "failed to persist coordinator snapshot");
        }
    }
}
