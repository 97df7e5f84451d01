//! Lock manager: grants, queues, upgrades, pinning, greedy retention, recall
//!
//! All decisions touching one lock's state run under that lock's mutex from
//! the [`LockTable`]; queued callers park on oneshot channels so the
//! coordinator never blocks its dispatch path on one node.

use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info};

use taro_api::model::LockLevel;
use taro_api::remote::{BeginLockOutcome, ServerPush};
use taro_common::TaroError;

use serde::{Deserialize, Serialize};

use super::lock_table::{
    GreedyRetention, LockDurable, LockState, LockTable, PendingRequest,
};
use super::remote::PushRegistry;

/// What happened to the hold on commit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nested write scope returned to its outer READ
    Downgraded,
    /// Hold fully released
    Released,
    /// Greedy hold retained locally, no network-visible release
    RetainedGreedy,
}

/// A released hold remembered across a disconnect for best-effort restore
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoldRecord {
    pub lock_id: String,
    pub level: LockLevel,
    pub outer_level: Option<LockLevel>,
}

/// Introspection snapshot of one lock
#[derive(Clone, Debug)]
pub struct LockInfo {
    pub lock_id: String,
    pub holds: Vec<taro_api::model::LockHold>,
    pub pinned: bool,
    pub retained: Option<GreedyRetention>,
    pub recall_pending: bool,
    pub pending: usize,
    pub waiters: usize,
    pub last_level: Option<LockLevel>,
}

pub struct LockManager {
    table: LockTable,
    push: Arc<PushRegistry>,
}

impl LockManager {
    pub fn new(push: Arc<PushRegistry>) -> Self {
        Self {
            table: LockTable::new(),
            push,
        }
    }

    /// Per-lock entry for the wait/notify coordinator
    pub(crate) fn entry(&self, lock_id: &str) -> Arc<Mutex<LockState>> {
        self.table.entry(lock_id)
    }

    pub(crate) fn get_entry(&self, lock_id: &str) -> Option<Arc<Mutex<LockState>>> {
        self.table.get(lock_id)
    }

    /// Begin a lock at the given level
    ///
    /// Returns `Granted` when no conflicting hold existed, `Queued` when the
    /// request had to park in arrival order; by the time the call returns the
    /// node holds the lock either way. A parked request is cancellable via
    /// [`LockManager::cancel_pending`] or node disconnect, in which case the
    /// call fails without affecting other queued requests.
    pub async fn begin_lock(
        &self,
        node: &str,
        lock_id: &str,
        level: LockLevel,
        greedy: bool,
    ) -> Result<BeginLockOutcome, TaroError> {
        if level == LockLevel::None {
            return Err(TaroError::IllegalArgument(
                "cannot begin a lock at level NONE".to_string(),
            ));
        }

        let entry = self.table.entry(lock_id);
        let (ticket, rx) = {
            let mut state = entry.lock().await;

            // Re-entrant paths for a node that already holds the lock
            if let Some(hold) = state.hold_of(node) {
                if hold.level >= level {
                    return Ok(BeginLockOutcome::Granted);
                }
                if hold.level == LockLevel::Read && level == LockLevel::Write {
                    if !state.conflicts_with(node, LockLevel::Write) {
                        state.upgrade_hold(node);
                        debug!(node = %node, lock = %lock_id, "lock upgraded READ -> WRITE");
                        return Ok(BeginLockOutcome::Granted);
                    }
                    // Other readers present: park the upgrade in arrival order
                    let (tx, rx) = oneshot::channel();
                    let ticket = taro_common::new_ticket_id();
                    state.push_pending(PendingRequest {
                        ticket: ticket.clone(),
                        node: node.to_string(),
                        level,
                        greedy,
                        outer_level: None,
                        upgrade: true,
                        grant_tx: tx,
                    });
                    drop(state);
                    return self.park(rx, ticket, lock_id).await;
                }
                return Err(TaroError::IllegalLockState(format!(
                    "cannot raise {} hold to {} on '{}'",
                    hold.level, level, lock_id
                )));
            }

            // Reactivate the node's own greedy retention without renegotiating
            if let Some(retained) = state.retention().cloned()
                && retained.node == node
            {
                if retained.level >= level {
                    state.take_retention();
                    state.add_hold(node, retained.level, true, None);
                    debug!(node = %node, lock = %lock_id, "greedy retention reactivated");
                    return Ok(BeginLockOutcome::Granted);
                }
                // Raising the retained level renegotiates like a fresh request
                state.take_retention();
            }

            if state.grantable(node, level) {
                state.add_hold(node, level, greedy, None);
                debug!(node = %node, lock = %lock_id, level = %level, "lock granted");
                return Ok(BeginLockOutcome::Granted);
            }

            self.issue_recall_if_needed(&mut state, node, level, lock_id);

            let (tx, rx) = oneshot::channel();
            let ticket = taro_common::new_ticket_id();
            state.push_pending(PendingRequest {
                ticket: ticket.clone(),
                node: node.to_string(),
                level,
                greedy,
                outer_level: None,
                upgrade: false,
                grant_tx: tx,
            });
            debug!(node = %node, lock = %lock_id, level = %level, ticket = %ticket, "lock request queued");
            (ticket, rx)
        };

        self.park(rx, ticket, lock_id).await
    }

    async fn park(
        &self,
        rx: oneshot::Receiver<()>,
        ticket: String,
        lock_id: &str,
    ) -> Result<BeginLockOutcome, TaroError> {
        match rx.await {
            Ok(()) => Ok(BeginLockOutcome::Queued { ticket }),
            Err(_) => Err(TaroError::NodeLost(format!(
                "queued request for lock '{}' was cancelled",
                lock_id
            ))),
        }
    }

    /// Recall a greedy holder whose state blocks `level`, at most once
    fn issue_recall_if_needed(
        &self,
        state: &mut LockState,
        node: &str,
        level: LockLevel,
        lock_id: &str,
    ) {
        if state.recall_pending {
            return;
        }
        let target = if state.retention_blocks(node, level) {
            state.retention().map(|r| r.node.clone())
        } else {
            state
                .holds()
                .iter()
                .find(|h| h.node != node && h.greedy && !h.level.compatible_with(level))
                .map(|h| h.node.clone())
        };
        if let Some(holder) = target {
            state.recall_pending = true;
            info!(lock = %lock_id, holder = %holder, "recalling greedily held lock");
            self.push.send(
                &holder,
                ServerPush::Recall {
                    lock_id: lock_id.to_string(),
                },
            );
        }
    }

    /// Commit the node's hold: downgrade a nested write scope, retain a
    /// greedy hold locally, or release and grant queued requests
    ///
    /// A node answering a recall with no active hold releases its retention
    /// here, which lets the recalled requester proceed.
    pub async fn commit_lock(
        &self,
        node: &str,
        lock_id: &str,
    ) -> Result<CommitOutcome, TaroError> {
        let entry = self.table.entry(lock_id);
        let mut state = entry.lock().await;

        let Some(hold) = state.hold_of(node).cloned() else {
            if state.retention().is_some_and(|r| r.node == node) {
                state.take_retention();
                state.recall_pending = false;
                state.grant_pending();
                info!(node = %node, lock = %lock_id, "greedy retention released");
                return Ok(CommitOutcome::Released);
            }
            return Err(TaroError::IllegalLockState(format!(
                "commit without hold on '{}'",
                lock_id
            )));
        };

        if hold.outer_level.is_some() {
            state.downgrade_hold(node);
            state.grant_pending();
            debug!(node = %node, lock = %lock_id, "lock downgraded WRITE -> READ");
            return Ok(CommitOutcome::Downgraded);
        }

        state.remove_hold(node);
        if hold.greedy && !state.recall_pending {
            state.set_retention(node, hold.level);
            state.grant_pending();
            debug!(node = %node, lock = %lock_id, "greedy hold retained locally");
            return Ok(CommitOutcome::RetainedGreedy);
        }

        // A recalled greedy holder has now released for real; a non-greedy
        // release leaves a recall aimed at someone else in flight
        if hold.greedy {
            state.recall_pending = false;
        }
        state.grant_pending();
        debug!(node = %node, lock = %lock_id, "lock released");
        Ok(CommitOutcome::Released)
    }

    /// Release without greedy retention (aborted transaction)
    pub async fn abort_lock(&self, node: &str, lock_id: &str) -> Result<(), TaroError> {
        let entry = self.table.entry(lock_id);
        let mut state = entry.lock().await;

        if let Some(hold) = state.remove_hold(node) {
            if hold.greedy {
                state.recall_pending = false;
            }
            state.grant_pending();
            return Ok(());
        }
        if state.retention().is_some_and(|r| r.node == node) {
            state.take_retention();
            state.recall_pending = false;
            state.grant_pending();
            return Ok(());
        }
        Err(TaroError::IllegalLockState(format!(
            "abort without hold on '{}'",
            lock_id
        )))
    }

    /// Effective level of the node's hold, NONE when it holds nothing
    pub async fn effective_level(&self, node: &str, lock_id: &str) -> LockLevel {
        match self.table.get(lock_id) {
            Some(entry) => {
                let state = entry.lock().await;
                state
                    .hold_of(node)
                    .map(|h| h.level)
                    .unwrap_or(LockLevel::None)
            }
            None => LockLevel::None,
        }
    }

    /// Retain the lock's level/holder metadata even at zero holds
    pub async fn pin_lock(&self, lock_id: &str) {
        let entry = self.table.entry(lock_id);
        let mut state = entry.lock().await;
        state.pinned = true;
        debug!(lock = %lock_id, "lock pinned");
    }

    /// Forcibly clear cached, inactive greedy state
    ///
    /// Never revokes an active hold. Refused while a recall is draining on
    /// the same lock: recall requests always complete before an eviction is
    /// honored.
    pub async fn evict_lock(&self, lock_id: &str) -> Result<(), TaroError> {
        let Some(entry) = self.table.get(lock_id) else {
            return Err(TaroError::IllegalArgument(format!(
                "unknown lock '{}'",
                lock_id
            )));
        };
        let mut state = entry.lock().await;
        if state.recall_pending {
            return Err(TaroError::RecallInFlight(lock_id.to_string()));
        }
        state.clear_retained_state();
        state.grant_pending();
        info!(lock = %lock_id, "cached lock state evicted");
        Ok(())
    }

    /// Withdraw a queued request; other queued requests are unaffected
    pub async fn cancel_pending(
        &self,
        node: &str,
        lock_id: &str,
        ticket: Option<&str>,
    ) -> bool {
        let Some(entry) = self.table.get(lock_id) else {
            return false;
        };
        let mut state = entry.lock().await;
        let removed = state.remove_pending(node, ticket);
        if removed {
            state.grant_pending();
        }
        removed
    }

    /// Re-acquire a lock after a wait, restoring the prior levels as one
    /// atomic step through the normal grant path
    pub(crate) async fn reacquire(
        &self,
        node: &str,
        lock_id: &str,
        level: LockLevel,
        outer_level: Option<LockLevel>,
        greedy: bool,
    ) -> Result<(), TaroError> {
        let entry = self.table.entry(lock_id);
        let rx = {
            let mut state = entry.lock().await;
            if state.grantable(node, level) {
                state.add_hold(node, level, greedy, outer_level);
                return Ok(());
            }
            self.issue_recall_if_needed(&mut state, node, level, lock_id);
            let (tx, rx) = oneshot::channel();
            state.push_pending(PendingRequest {
                ticket: taro_common::new_ticket_id(),
                node: node.to_string(),
                level,
                greedy,
                outer_level,
                upgrade: false,
                grant_tx: tx,
            });
            rx
        };
        rx.await.map_err(|_| {
            TaroError::NodeLost(format!(
                "re-acquisition of lock '{}' was cancelled",
                lock_id
            ))
        })
    }

    /// Connection lost: drop the node's queued requests and wait entries,
    /// release its non-greedy holds, convert active greedy holds into
    /// retention for the grace window
    pub async fn release_for_disconnect(&self, node: &str) -> Vec<HoldRecord> {
        let mut records = Vec::new();
        for entry in self.table.entries() {
            let mut state = entry.lock().await;
            state.remove_all_pending_for(node);
            if let Some(waiter) = state.remove_waiter(node) {
                let _ = waiter
                    .wake_tx
                    .send(super::lock_table::WaitWake::Interrupted);
            }
            if let Some(hold) = state.remove_hold(node) {
                if hold.greedy {
                    state.set_retention(node, hold.level);
                } else {
                    records.push(HoldRecord {
                        lock_id: state.lock_id.clone(),
                        level: hold.level,
                        outer_level: hold.outer_level,
                    });
                }
            }
            state.grant_pending();
        }
        if !records.is_empty() {
            info!(node = %node, released = records.len(), "released non-greedy holds of disconnected node");
        }
        records
    }

    /// Best-effort restore of holds released at disconnect; holds taken over
    /// by other nodes in the meantime are skipped
    pub async fn try_restore(&self, node: &str, records: &[HoldRecord]) -> usize {
        let mut restored = 0;
        for record in records {
            let entry = self.table.entry(&record.lock_id);
            let mut state = entry.lock().await;
            if state.hold_of(node).is_none() && state.grantable(node, record.level) {
                state.add_hold(node, record.level, false, record.outer_level);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(node = %node, restored, "restored lock holds after reconnect");
        }
        restored
    }

    /// Final departure: drop greedy retention and answer outstanding recalls
    pub async fn drop_retained_for(&self, node: &str) {
        for entry in self.table.entries() {
            let mut state = entry.lock().await;
            if state.retention().is_some_and(|r| r.node == node) {
                state.take_retention();
                state.recall_pending = false;
                state.grant_pending();
            }
        }
    }

    pub async fn lock_info(&self, lock_id: &str) -> Option<LockInfo> {
        let entry = self.table.get(lock_id)?;
        let state = entry.lock().await;
        Some(LockInfo {
            lock_id: state.lock_id.clone(),
            holds: state.holds().to_vec(),
            pinned: state.pinned,
            retained: state.retention().cloned(),
            recall_pending: state.recall_pending,
            pending: state.pending_len(),
            waiters: state.waiter_len(),
            last_level: state.last_level(),
        })
    }

    /// Durable fraction of every lock, for the coordinator snapshot
    pub async fn durable_fraction(&self) -> Vec<LockDurable> {
        let mut durable = Vec::new();
        for entry in self.table.entries() {
            let state = entry.lock().await;
            if let Some(d) = state.durable() {
                durable.push(d);
            }
        }
        durable
    }

    pub async fn load_durable(&self, locks: Vec<LockDurable>) {
        for durable in locks {
            let entry = self.table.entry(&durable.lock_id);
            let mut state = entry.lock().await;
            state.apply_durable(durable);
        }
    }
}
