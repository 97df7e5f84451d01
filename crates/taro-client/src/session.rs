//! Node session: a node's connection to the coordinator
//!
//! Holds the per-node push channel and a local cache of faulted roots.
//! Lock acquisition goes through [`LockGuard`], an explicit begin/commit
//! bracket that aborts on drop so the lock is released on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use taro_api::change::{ChangeEntry, ChangeOp};
use taro_api::model::{LockLevel, NodeId, RootScope, RootType, TopologySnapshot};
use taro_api::remote::{ServerPush, WaitOutcome};
use taro_core::Coordinator;

use crate::error::ClientError;

pub struct NodeSession {
    node_id: NodeId,
    coordinator: Arc<Coordinator>,
    pushes: Mutex<mpsc::UnboundedReceiver<ServerPush>>,
    /// Faulted roots, kept current by change-set deliveries
    cache: DashMap<(RootScope, String), Value>,
    /// Highest commit sequence applied locally; redeliveries at or below it
    /// are acknowledged without re-applying
    applied_commit_seq: AtomicU64,
}

impl NodeSession {
    /// Join the cluster and open the push channel
    pub async fn join(
        coordinator: Arc<Coordinator>,
        node_id: &str,
    ) -> Result<(Self, TopologySnapshot), ClientError> {
        let (snapshot, rx) = coordinator.join(node_id).await?;
        Ok((
            Self {
                node_id: node_id.to_string(),
                coordinator,
                pushes: Mutex::new(rx),
                cache: DashMap::new(),
                applied_commit_seq: AtomicU64::new(0),
            },
            snapshot,
        ))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Report initial sync complete; the node becomes fully active
    pub async fn sync_complete(&self) -> Result<(), ClientError> {
        self.coordinator.sync_complete(&self.node_id).await?;
        Ok(())
    }

    /// Bind a root (create-on-first-bind, type-checked thereafter) and fault
    /// it into the local cache
    pub async fn bind_root(
        &self,
        scope: RootScope,
        root: &str,
        root_type: RootType,
        initial: Value,
    ) -> Result<Value, ClientError> {
        self.coordinator
            .bind_root(&self.node_id, scope, root, root_type, initial)
            .await?;
        self.fault_root(scope, root).await
    }

    /// Fault a root into the local cache, subscribing to its change sets
    pub async fn fault_root(&self, scope: RootScope, root: &str) -> Result<Value, ClientError> {
        let value = self.coordinator.fault_root(&self.node_id, scope, root).await?;
        self.cache.insert((scope, root.to_string()), value.clone());
        Ok(value)
    }

    /// Local view of a faulted root
    pub fn cached_root(&self, scope: RootScope, root: &str) -> Option<Value> {
        self.cache
            .get(&(scope, root.to_string()))
            .map(|v| v.value().clone())
    }

    /// Begin a lock; the returned guard commits explicitly and aborts on drop
    pub async fn lock(
        &self,
        lock_id: &str,
        level: LockLevel,
    ) -> Result<LockGuard, ClientError> {
        self.lock_with(lock_id, level, false).await
    }

    /// Begin a greedy lock, retained locally across begin/commit cycles
    /// until the coordinator recalls it
    pub async fn lock_greedy(
        &self,
        lock_id: &str,
        level: LockLevel,
    ) -> Result<LockGuard, ClientError> {
        self.lock_with(lock_id, level, true).await
    }

    async fn lock_with(
        &self,
        lock_id: &str,
        level: LockLevel,
        greedy: bool,
    ) -> Result<LockGuard, ClientError> {
        self.coordinator
            .begin_lock(&self.node_id, lock_id, level, greedy)
            .await?;
        Ok(LockGuard {
            coordinator: self.coordinator.clone(),
            node_id: self.node_id.clone(),
            lock_id: lock_id.to_string(),
            finished: false,
        })
    }

    /// Park on the lock's wait queue until notified or the bound expires
    pub async fn wait(
        &self,
        lock_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, ClientError> {
        Ok(self.coordinator.wait(&self.node_id, lock_id, timeout).await?)
    }

    pub async fn notify(&self, lock_id: &str) -> usize {
        self.coordinator.notify(lock_id).await
    }

    pub async fn notify_all(&self, lock_id: &str) -> usize {
        self.coordinator.notify_all(lock_id).await
    }

    /// Drain queued server pushes, applying change-set deliveries to the
    /// local cache and answering recalls
    ///
    /// Deliveries apply in commit order; a redelivered commit sequence is
    /// acknowledged without re-applying. Call between transactions.
    pub async fn process_pushes(&self) -> Result<usize, ClientError> {
        let mut rx = self.pushes.lock().await;
        let mut handled = 0;
        while let Ok(push) = rx.try_recv() {
            handled += 1;
            match push {
                ServerPush::ChangeSetDelivery {
                    scope,
                    root,
                    commit_seq,
                    changes,
                } => {
                    let applied = self.applied_commit_seq.load(Ordering::SeqCst);
                    if commit_seq > applied {
                        if let Some(mut cached) = self.cache.get_mut(&(scope, root.clone())) {
                            for entry in &changes.ops {
                                entry.op.apply_to(&mut cached)?;
                            }
                        }
                        self.applied_commit_seq.store(commit_seq, Ordering::SeqCst);
                        debug!(node = %self.node_id, root = %root, commit_seq, "applied change set");
                    } else {
                        debug!(node = %self.node_id, commit_seq, "skipped redelivered change set");
                    }
                    self.coordinator.ack_delivery(&self.node_id, commit_seq);
                }
                ServerPush::Recall { lock_id } => {
                    // Commit releases the retained greedy state so the
                    // conflicting requester can proceed
                    if let Err(err) = self
                        .coordinator
                        .commit_lock(&self.node_id, &lock_id)
                        .await
                    {
                        warn!(node = %self.node_id, lock = %lock_id, error = %err, "recall release failed");
                    }
                }
                ServerPush::Topology(event) => {
                    debug!(node = %self.node_id, kind = %event.kind, peer = %event.node_id, "topology push");
                }
            }
        }
        Ok(handled)
    }

    /// Simulate a dropped connection (the coordinator demotes this node)
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.coordinator.disconnect(&self.node_id).await?;
        Ok(())
    }

    /// Reconnect inside the grace window; missed change sets are replayed
    /// and applied to the local cache
    pub async fn reconnect(&self) -> Result<TopologySnapshot, ClientError> {
        let (snapshot, rx) = self.coordinator.reconnect(&self.node_id).await?;
        *self.pushes.lock().await = rx;
        self.process_pushes().await?;
        Ok(snapshot)
    }

    /// Leave the cluster for good
    pub async fn leave(self) -> Result<(), ClientError> {
        self.coordinator.leave(&self.node_id).await?;
        Ok(())
    }
}

/// Scoped lock acquisition
///
/// Mutations recorded through the guard join the node's open change set for
/// this lock; `commit` flushes and releases (or downgrades a nested upgrade,
/// or retains a greedy hold). Dropping an uncommitted guard aborts the
/// transaction so the lock is released on every exit path.
pub struct LockGuard {
    coordinator: Arc<Coordinator>,
    node_id: NodeId,
    lock_id: String,
    finished: bool,
}

impl LockGuard {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    async fn record(&self, scope: RootScope, root: &str, op: ChangeOp) -> Result<(), ClientError> {
        self.coordinator
            .record_mutation(
                &self.node_id,
                &self.lock_id,
                ChangeEntry {
                    scope,
                    root: root.to_string(),
                    op,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn map_put(
        &self,
        scope: RootScope,
        root: &str,
        key: &str,
        value: Value,
    ) -> Result<(), ClientError> {
        self.record(
            scope,
            root,
            ChangeOp::MapPut {
                key: key.to_string(),
                value,
            },
        )
        .await
    }

    pub async fn map_remove(
        &self,
        scope: RootScope,
        root: &str,
        key: &str,
    ) -> Result<(), ClientError> {
        self.record(
            scope,
            root,
            ChangeOp::MapRemove {
                key: key.to_string(),
            },
        )
        .await
    }

    pub async fn list_push(
        &self,
        scope: RootScope,
        root: &str,
        value: Value,
    ) -> Result<(), ClientError> {
        self.record(scope, root, ChangeOp::ListPush { value }).await
    }

    pub async fn field_set(
        &self,
        scope: RootScope,
        root: &str,
        path: &str,
        value: Value,
    ) -> Result<(), ClientError> {
        self.record(
            scope,
            root,
            ChangeOp::FieldSet {
                path: path.to_string(),
                value,
            },
        )
        .await
    }

    pub async fn replace(
        &self,
        scope: RootScope,
        root: &str,
        value: Value,
    ) -> Result<(), ClientError> {
        self.record(scope, root, ChangeOp::Replace { value }).await
    }

    /// Flush the change set and release (or downgrade/retain) the lock
    pub async fn commit(mut self) -> Result<(), ClientError> {
        self.coordinator
            .commit_lock(&self.node_id, &self.lock_id)
            .await?;
        self.finished = true;
        Ok(())
    }

    /// Discard recorded mutations and release without greedy retention
    pub async fn abort(mut self) -> Result<(), ClientError> {
        self.coordinator
            .abort_lock(&self.node_id, &self.lock_id)
            .await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Guarantee release on unwinding/early-return exit paths
        let coordinator = self.coordinator.clone();
        let node_id = self.node_id.clone();
        let lock_id = self.lock_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = coordinator.abort_lock(&node_id, &lock_id).await {
                    debug!(node = %node_id, lock = %lock_id, error = %err, "drop abort skipped");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taro_core::model::ConfigurationBuilder;

    async fn coordinator() -> Arc<Coordinator> {
        let config = ConfigurationBuilder::new().build().unwrap();
        let coordinator = Arc::new(Coordinator::new(config).await.unwrap());
        coordinator.start().await.unwrap();
        coordinator
    }

    async fn active_session(coordinator: &Arc<Coordinator>, node_id: &str) -> NodeSession {
        let (session, _) = NodeSession::join(coordinator.clone(), node_id).await.unwrap();
        session.sync_complete().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_guard_commit_publishes_to_peers() {
        let coordinator = coordinator().await;
        let a = active_session(&coordinator, "a").await;
        let b = active_session(&coordinator, "b").await;

        a.bind_root(RootScope::Instance, "m", RootType::Map, json!({}))
            .await
            .unwrap();
        b.fault_root(RootScope::Instance, "m").await.unwrap();

        let guard = a.lock("map-lock", LockLevel::Write).await.unwrap();
        guard
            .map_put(RootScope::Instance, "m", "k", json!(42))
            .await
            .unwrap();
        guard.commit().await.unwrap();

        b.process_pushes().await.unwrap();
        assert_eq!(
            b.cached_root(RootScope::Instance, "m"),
            Some(json!({"k": 42}))
        );
    }

    #[tokio::test]
    async fn test_write_under_read_guard_fails() {
        let coordinator = coordinator().await;
        let a = active_session(&coordinator, "a").await;
        a.bind_root(RootScope::Instance, "m", RootType::Map, json!({}))
            .await
            .unwrap();

        let guard = a.lock("map-lock", LockLevel::Read).await.unwrap();
        let err = guard
            .map_put(RootScope::Instance, "m", "k", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_coordinator_error(),
            Some(taro_common::TaroError::ReadOnlyLock { .. })
        ));
        guard.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_lock() {
        let coordinator = coordinator().await;
        let a = active_session(&coordinator, "a").await;
        let b = active_session(&coordinator, "b").await;

        {
            let _guard = a.lock("l", LockLevel::Write).await.unwrap();
            // dropped without commit
        }
        // Give the drop-abort task a moment
        tokio::time::sleep(Duration::from_millis(50)).await;

        let guard = b.lock("l", LockLevel::Write).await.unwrap();
        guard.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_root_bind_conflict_via_session() {
        let coordinator = coordinator().await;
        let a = active_session(&coordinator, "a").await;
        let b = active_session(&coordinator, "b").await;

        a.bind_root(RootScope::Instance, "root", RootType::Int, json!(1))
            .await
            .unwrap();
        let err = b
            .bind_root(RootScope::Instance, "root", RootType::Long, json!(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_coordinator_error(),
            Some(taro_common::TaroError::TypeConflict { .. })
        ));
    }
}
