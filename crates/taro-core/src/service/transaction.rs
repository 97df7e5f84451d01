//! Transaction coordinator: ordered change-set commit and replication
//!
//! Batches a node's mutations performed under one lock hold into a single
//! ordered change set, commits it to the authoritative root registry, and
//! fans it out to every other node that has the affected root faulted in —
//! in the same commit order for all recipients. Replays of an already-applied
//! (node, seq) are detected by the per-node monotonic sequence and dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use taro_api::change::{ChangeEntry, ChangeSet};
use taro_api::model::{LockLevel, NodeId, RootScope};
use taro_api::remote::ServerPush;
use taro_common::TaroError;

use super::lock_manager::LockManager;
use super::remote::PushRegistry;
use super::root_registry::RootRegistry;

/// One committed change set queued for a subscriber until acknowledged
#[derive(Clone, Debug)]
pub struct Delivery {
    pub scope: RootScope,
    pub root: String,
    pub commit_seq: u64,
    pub changes: ChangeSet,
}

pub struct TransactionCoordinator {
    locks: Arc<LockManager>,
    roots: Arc<RootRegistry>,
    push: Arc<PushRegistry>,
    /// Open change sets keyed by (node, lock)
    open: DashMap<(NodeId, String), ChangeSet>,
    /// Highest publish sequence applied per node
    published: DashMap<NodeId, u64>,
    /// Unacknowledged deliveries per subscriber, in commit order
    pending_deliveries: DashMap<NodeId, VecDeque<Delivery>>,
    commit_seq: AtomicU64,
    /// Serializes commit application so no two observers see two WRITE
    /// change sets on one lock in different relative orders
    commit_mu: Mutex<()>,
}

impl TransactionCoordinator {
    pub fn new(
        locks: Arc<LockManager>,
        roots: Arc<RootRegistry>,
        push: Arc<PushRegistry>,
    ) -> Self {
        Self {
            locks,
            roots,
            push,
            open: DashMap::new(),
            published: DashMap::new(),
            pending_deliveries: DashMap::new(),
            commit_seq: AtomicU64::new(0),
            commit_mu: Mutex::new(()),
        }
    }

    /// Append a mutation to the node's open change set for `lock_id`
    ///
    /// Legal only while the node holds a mutating level: no hold at all is an
    /// unlocked shared access, a READ hold is read-only. Both are rejected
    /// synchronously without touching shared state.
    pub async fn record_mutation(
        &self,
        node: &str,
        lock_id: &str,
        entry: ChangeEntry,
    ) -> Result<(), TaroError> {
        let level = self.locks.effective_level(node, lock_id).await;
        if level == LockLevel::None {
            return Err(TaroError::UnlockedSharedAccess {
                node: node.to_string(),
                lock_id: lock_id.to_string(),
            });
        }
        if !level.permits_write() {
            return Err(TaroError::ReadOnlyLock {
                node: node.to_string(),
                lock_id: lock_id.to_string(),
            });
        }
        self.open
            .entry((node.to_string(), lock_id.to_string()))
            .or_insert_with(|| ChangeSet::new(node, lock_id, 0))
            .ops
            .push(entry);
        Ok(())
    }

    /// Flush the node's open change set for a lock, committing it if any
    /// mutations were recorded; returns the assigned commit sequence
    pub async fn flush(&self, node: &str, lock_id: &str) -> Result<Option<u64>, TaroError> {
        let Some((_, mut changes)) = self
            .open
            .remove(&(node.to_string(), lock_id.to_string()))
        else {
            return Ok(None);
        };
        if changes.is_empty() {
            return Ok(None);
        }
        let seq = {
            let mut watermark = self.published.entry(node.to_string()).or_insert(0);
            *watermark += 1;
            *watermark
        };
        changes.seq = seq;
        let commit_seq = self.commit(changes).await?;
        Ok(Some(commit_seq))
    }

    /// Commit an explicitly published change set
    ///
    /// Idempotence: a replay of an already-applied (node, seq) — after a
    /// reconnect, say — is detected and dropped; the ack is returned as if
    /// the change set had just been applied.
    pub async fn publish_change_set(
        &self,
        node: &str,
        lock_id: &str,
        seq: u64,
        ops: Vec<ChangeEntry>,
    ) -> Result<u64, TaroError> {
        let last = self.published.get(node).map(|s| *s).unwrap_or(0);
        if seq <= last {
            debug!(node = %node, seq, "dropping replayed change set");
            return Ok(seq);
        }

        let level = self.locks.effective_level(node, lock_id).await;
        if level == LockLevel::None {
            return Err(TaroError::UnlockedSharedAccess {
                node: node.to_string(),
                lock_id: lock_id.to_string(),
            });
        }
        if !level.permits_write() {
            return Err(TaroError::ReadOnlyLock {
                node: node.to_string(),
                lock_id: lock_id.to_string(),
            });
        }

        self.published.insert(node.to_string(), seq);
        let mut changes = ChangeSet::new(node, lock_id, seq);
        changes.ops = ops;
        self.commit(changes).await?;
        Ok(seq)
    }

    /// Apply one change set atomically and fan it out to subscribers
    async fn commit(&self, changes: ChangeSet) -> Result<u64, TaroError> {
        let _guard = self.commit_mu.lock().await;
        let commit_seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;

        self.roots.apply(&changes, commit_seq)?;
        info!(
            node = %changes.node,
            lock = %changes.lock_id,
            seq = changes.seq,
            commit_seq,
            ops = changes.ops.len(),
            "change set committed"
        );

        for (scope, root) in changes.touched_roots() {
            let mut subset = ChangeSet::new(changes.node.clone(), changes.lock_id.clone(), changes.seq);
            subset.ops = changes
                .ops
                .iter()
                .filter(|e| e.scope == scope && e.root == root)
                .cloned()
                .collect();

            for subscriber in self.roots.subscribers_of(scope, &root) {
                if subscriber == changes.node {
                    continue;
                }
                let delivery = Delivery {
                    scope,
                    root: root.clone(),
                    commit_seq,
                    changes: subset.clone(),
                };
                self.pending_deliveries
                    .entry(subscriber.clone())
                    .or_default()
                    .push_back(delivery);
                // Disconnected subscribers keep the delivery queued for replay
                self.push.send(
                    &subscriber,
                    ServerPush::ChangeSetDelivery {
                        scope,
                        root: root.clone(),
                        commit_seq,
                        changes: subset.clone(),
                    },
                );
            }
        }
        Ok(commit_seq)
    }

    /// Acknowledge deliveries up to and including `commit_seq`
    pub fn ack_delivery(&self, node: &str, commit_seq: u64) {
        if let Some(mut queue) = self.pending_deliveries.get_mut(node) {
            while queue
                .front()
                .is_some_and(|d| d.commit_seq <= commit_seq)
            {
                queue.pop_front();
            }
        }
    }

    /// Redeliver every unacknowledged change set to a reconnected node, in
    /// commit order
    pub fn replay_missed(&self, node: &str) -> usize {
        let Some(queue) = self.pending_deliveries.get(node) else {
            return 0;
        };
        let mut replayed = 0;
        for delivery in queue.iter() {
            self.push.send(
                node,
                ServerPush::ChangeSetDelivery {
                    scope: delivery.scope,
                    root: delivery.root.clone(),
                    commit_seq: delivery.commit_seq,
                    changes: delivery.changes.clone(),
                },
            );
            replayed += 1;
        }
        if replayed > 0 {
            info!(node = %node, replayed, "replayed missed change sets");
        }
        replayed
    }

    /// Roll back the node's open change set for one lock
    pub fn rollback(&self, node: &str, lock_id: &str) {
        if self
            .open
            .remove(&(node.to_string(), lock_id.to_string()))
            .is_some()
        {
            debug!(node = %node, lock = %lock_id, "open change set rolled back");
        }
    }

    /// Roll back all of the node's open change sets (disconnect)
    pub fn rollback_all(&self, node: &str) {
        self.open.retain(|(n, _), _| n != node);
    }

    /// Drop every trace of a departed node
    pub fn forget_node(&self, node: &str) {
        self.rollback_all(node);
        self.published.remove(node);
        self.pending_deliveries.remove(node);
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn published_seq(&self, node: &str) -> u64 {
        self.published.get(node).map(|s| *s).unwrap_or(0)
    }

    pub fn pending_delivery_count(&self, node: &str) -> usize {
        self.pending_deliveries
            .get(node)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn current_commit_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::SeqCst)
    }

    /// Durable watermarks for the coordinator snapshot
    pub fn durable_watermarks(&self) -> Vec<(NodeId, u64)> {
        self.published
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn load_durable(&self, commit_seq: u64, watermarks: Vec<(NodeId, u64)>) {
        self.commit_seq.store(commit_seq, Ordering::SeqCst);
        for (node, seq) in watermarks {
            self.published.insert(node, seq);
        }
    }
}
