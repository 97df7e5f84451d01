//! Lock table: per-lock state machines
//!
//! Leaf component. Each entry tracks active holds, the FIFO pending-request
//! queue, the FIFO wait queue, the pinned flag and greedy retention. All
//! decisions that touch one lock go through the per-lock mutex owned by
//! [`LockTable`]; operations on different locks never contend.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};

use taro_api::model::{LockHold, LockLevel, NodeId};

/// How a parked waiter was woken
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitWake {
    Notified,
    Interrupted,
}

/// A queued lock request parked on its grant channel
pub(crate) struct PendingRequest {
    pub ticket: String,
    pub node: NodeId,
    pub level: LockLevel,
    pub greedy: bool,
    /// Outer level restored when re-acquiring after a wait
    pub outer_level: Option<LockLevel>,
    /// READ → WRITE upgrade of an existing hold rather than a fresh grant
    pub upgrade: bool,
    pub grant_tx: oneshot::Sender<()>,
}

/// A node parked in wait(), holding its prior levels for re-acquisition
pub(crate) struct WaitEntry {
    pub node: NodeId,
    pub level: LockLevel,
    pub outer_level: Option<LockLevel>,
    pub greedy: bool,
    pub enqueued_at: i64,
    pub wake_tx: oneshot::Sender<WaitWake>,
}

/// Greedy lock state retained locally by a node between begin/commit cycles
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GreedyRetention {
    pub node: NodeId,
    pub level: LockLevel,
}

/// Durable fraction of one lock's state, survives a coordinator restart
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockDurable {
    pub lock_id: String,
    pub pinned: bool,
    pub retained: Option<GreedyRetention>,
    pub last_level: Option<LockLevel>,
    pub last_holder: Option<NodeId>,
}

/// Whether a request at `incoming` must recall a greedy retention at `retained`
///
/// Retained CONCURRENT state carries unordered changes that must flush before
/// anyone serializes against the lock, so READ and WRITE both recall it;
/// another CONCURRENT request never does.
pub(crate) fn retention_conflicts(incoming: LockLevel, retained: LockLevel) -> bool {
    if !incoming.compatible_with(retained) {
        return true;
    }
    retained == LockLevel::Concurrent
        && matches!(incoming, LockLevel::Read | LockLevel::Write)
}

/// State machine for one lock
pub struct LockState {
    pub lock_id: String,
    holds: Vec<LockHold>,
    pending: VecDeque<PendingRequest>,
    waiters: VecDeque<WaitEntry>,
    pub pinned: bool,
    retained: Option<GreedyRetention>,
    /// A recall push is outstanding; eviction is refused until it drains
    pub recall_pending: bool,
    last_level: Option<LockLevel>,
    last_holder: Option<NodeId>,
    next_order: u64,
}

impl LockState {
    pub fn new(lock_id: impl Into<String>) -> Self {
        Self {
            lock_id: lock_id.into(),
            holds: Vec::new(),
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
            pinned: false,
            retained: None,
            recall_pending: false,
            last_level: None,
            last_holder: None,
            next_order: 0,
        }
    }

    pub fn hold_of(&self, node: &str) -> Option<&LockHold> {
        self.holds.iter().find(|h| h.node == node)
    }

    pub fn holds(&self) -> &[LockHold] {
        &self.holds
    }

    pub fn retention(&self) -> Option<&GreedyRetention> {
        self.retained.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn waiter_len(&self) -> usize {
        self.waiters.len()
    }

    pub fn last_level(&self) -> Option<LockLevel> {
        self.last_level
    }

    /// Whether an existing hold of another node conflicts with `level`
    pub fn conflicts_with(&self, node: &str, level: LockLevel) -> bool {
        self.holds
            .iter()
            .any(|h| h.node != node && !h.level.compatible_with(level))
    }

    /// Whether another node's greedy retention blocks `level` until recalled
    pub fn retention_blocks(&self, node: &str, level: LockLevel) -> bool {
        self.retained
            .as_ref()
            .is_some_and(|r| r.node != node && retention_conflicts(level, r.level))
    }

    pub fn grantable(&self, node: &str, level: LockLevel) -> bool {
        !self.conflicts_with(node, level) && !self.retention_blocks(node, level)
    }

    pub fn add_hold(
        &mut self,
        node: &str,
        level: LockLevel,
        greedy: bool,
        outer_level: Option<LockLevel>,
    ) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        self.holds.push(LockHold {
            node: node.to_string(),
            level,
            outer_level,
            order,
            greedy,
        });
        self.last_level = Some(level);
        self.last_holder = Some(node.to_string());
        order
    }

    /// Nested READ → WRITE upgrade for a node already holding READ
    pub fn upgrade_hold(&mut self, node: &str) -> bool {
        match self.holds.iter_mut().find(|h| h.node == node) {
            Some(hold) if hold.level == LockLevel::Read && hold.outer_level.is_none() => {
                hold.outer_level = Some(LockLevel::Read);
                hold.level = LockLevel::Write;
                self.last_level = Some(LockLevel::Write);
                self.last_holder = Some(node.to_string());
                true
            }
            _ => false,
        }
    }

    /// Implicit downgrade when a nested write scope returns to its outer READ
    pub fn downgrade_hold(&mut self, node: &str) -> bool {
        match self.holds.iter_mut().find(|h| h.node == node) {
            Some(hold) => match hold.outer_level.take() {
                Some(outer) => {
                    hold.level = outer;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn remove_hold(&mut self, node: &str) -> Option<LockHold> {
        let idx = self.holds.iter().position(|h| h.node == node)?;
        Some(self.holds.remove(idx))
    }

    pub(crate) fn push_pending(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
    }

    /// Remove a queued request (cancellation); drops its grant channel
    pub fn remove_pending(&mut self, node: &str, ticket: Option<&str>) -> bool {
        let before = self.pending.len();
        self.pending
            .retain(|r| !(r.node == node && ticket.is_none_or(|t| r.ticket == t)));
        before != self.pending.len()
    }

    pub fn remove_all_pending_for(&mut self, node: &str) {
        self.pending.retain(|r| r.node != node);
    }

    pub(crate) fn push_waiter(&mut self, entry: WaitEntry) {
        self.waiters.push_back(entry);
    }

    /// Oldest waiter first
    pub(crate) fn pop_waiter(&mut self) -> Option<WaitEntry> {
        self.waiters.pop_front()
    }

    pub(crate) fn drain_waiters(&mut self) -> Vec<WaitEntry> {
        self.waiters.drain(..).collect()
    }

    pub(crate) fn remove_waiter(&mut self, node: &str) -> Option<WaitEntry> {
        let idx = self.waiters.iter().position(|w| w.node == node)?;
        self.waiters.remove(idx)
    }

    pub fn set_retention(&mut self, node: &str, level: LockLevel) {
        self.retained = Some(GreedyRetention {
            node: node.to_string(),
            level,
        });
    }

    pub fn take_retention(&mut self) -> Option<GreedyRetention> {
        self.retained.take()
    }

    /// Grant queued requests in strict arrival order
    ///
    /// Stops at the first request that cannot be granted; later compatible
    /// requests never overtake it (FIFO fairness, no priority levels).
    pub fn grant_pending(&mut self) {
        loop {
            let can = match self.pending.front() {
                None => break,
                Some(front) => {
                    if front.upgrade {
                        self.hold_of(&front.node)
                            .is_some_and(|h| h.level == LockLevel::Read)
                            && !self.conflicts_with(&front.node, LockLevel::Write)
                    } else {
                        self.grantable(&front.node, front.level)
                    }
                }
            };
            if !can {
                break;
            }
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            // Grant only if the requester is still parked on its channel;
            // a cancelled request is skipped without touching hold state.
            if request.upgrade {
                if request.grant_tx.send(()).is_ok() {
                    self.upgrade_hold(&request.node);
                }
            } else if request.grant_tx.send(()).is_ok() {
                self.add_hold(
                    &request.node,
                    request.level,
                    request.greedy,
                    request.outer_level,
                );
            }
        }
    }

    /// Lock-level exclusion invariant: at most one WRITE holder, and a WRITE
    /// holder excludes every READ and CONCURRENT hold
    pub fn holds_invariant(&self) -> bool {
        let writers = self
            .holds
            .iter()
            .filter(|h| h.level == LockLevel::Write)
            .count();
        writers <= 1 && (writers == 0 || self.holds.len() == 1)
    }

    /// Durable fraction for the coordinator snapshot, if any
    pub fn durable(&self) -> Option<LockDurable> {
        if !self.pinned && self.retained.is_none() {
            return None;
        }
        Some(LockDurable {
            lock_id: self.lock_id.clone(),
            pinned: self.pinned,
            retained: self.retained.clone(),
            last_level: self.last_level,
            last_holder: self.last_holder.clone(),
        })
    }

    pub fn apply_durable(&mut self, durable: LockDurable) {
        self.pinned = durable.pinned;
        self.retained = durable.retained;
        self.last_level = durable.last_level;
        self.last_holder = durable.last_holder;
    }

    /// Clears retained metadata after an eviction; active holds are untouched
    pub fn clear_retained_state(&mut self) {
        self.retained = None;
        self.last_level = None;
        self.last_holder = None;
    }
}

/// Map from lock id to its state machine, one async mutex per lock
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<LockState>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-lock entry, created on first reference
    pub fn entry(&self, lock_id: &str) -> Arc<Mutex<LockState>> {
        self.locks
            .entry(lock_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LockState::new(lock_id))))
            .clone()
    }

    pub fn get(&self, lock_id: &str) -> Option<Arc<Mutex<LockState>>> {
        self.locks.get(lock_id).map(|e| e.value().clone())
    }

    pub fn entries(&self) -> Vec<Arc<Mutex<LockState>>> {
        self.locks.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(node: &str, level: LockLevel) -> (PendingRequest, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest {
                ticket: taro_common::new_ticket_id(),
                node: node.to_string(),
                level,
                greedy: false,
                outer_level: None,
                upgrade: false,
                grant_tx: tx,
            },
            rx,
        )
    }

    #[test]
    fn test_write_excludes_everything() {
        let mut state = LockState::new("l");
        state.add_hold("a", LockLevel::Write, false, None);

        assert!(state.conflicts_with("b", LockLevel::Write));
        assert!(state.conflicts_with("b", LockLevel::Read));
        assert!(state.conflicts_with("b", LockLevel::Concurrent));
        // The holder itself never conflicts with its own hold
        assert!(!state.conflicts_with("a", LockLevel::Read));
        assert!(state.holds_invariant());
    }

    #[test]
    fn test_readers_and_concurrent_coexist() {
        let mut state = LockState::new("l");
        state.add_hold("a", LockLevel::Read, false, None);
        state.add_hold("b", LockLevel::Read, false, None);
        state.add_hold("c", LockLevel::Concurrent, false, None);

        assert!(!state.conflicts_with("d", LockLevel::Read));
        assert!(!state.conflicts_with("d", LockLevel::Concurrent));
        assert!(state.conflicts_with("d", LockLevel::Write));
        assert!(state.holds_invariant());
    }

    #[test]
    fn test_fifo_grant_with_barrier() {
        let mut state = LockState::new("l");
        state.add_hold("a", LockLevel::Write, false, None);

        let (w_req, mut w_rx) = request("b", LockLevel::Write);
        let (r_req, mut r_rx) = request("c", LockLevel::Read);
        state.push_pending(w_req);
        state.push_pending(r_req);

        // Nothing grantable while the writer holds
        state.grant_pending();
        assert!(w_rx.try_recv().is_err());

        state.remove_hold("a");
        state.grant_pending();

        // b's WRITE granted first; c's READ must not overtake it
        assert!(w_rx.try_recv().is_ok());
        assert!(r_rx.try_recv().is_err());
        assert_eq!(state.hold_of("b").map(|h| h.level), Some(LockLevel::Write));

        state.remove_hold("b");
        state.grant_pending();
        assert!(r_rx.try_recv().is_ok());
    }

    #[test]
    fn test_cancelled_request_is_skipped() {
        let mut state = LockState::new("l");
        state.add_hold("a", LockLevel::Write, false, None);

        let (req, rx) = request("b", LockLevel::Write);
        state.push_pending(req);
        drop(rx);

        state.remove_hold("a");
        state.grant_pending();
        assert!(state.hold_of("b").is_none());
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let mut state = LockState::new("l");
        state.add_hold("a", LockLevel::Read, false, None);

        assert!(state.upgrade_hold("a"));
        let hold = state.hold_of("a").unwrap();
        assert_eq!(hold.level, LockLevel::Write);
        assert_eq!(hold.outer_level, Some(LockLevel::Read));
        assert!(state.holds_invariant());

        // Second upgrade of the same hold is rejected
        assert!(!state.upgrade_hold("a"));

        assert!(state.downgrade_hold("a"));
        assert_eq!(state.hold_of("a").unwrap().level, LockLevel::Read);
        assert!(!state.downgrade_hold("a"));
    }

    #[test]
    fn test_upgrade_requires_sole_ownership() {
        let mut state = LockState::new("l");
        state.add_hold("a", LockLevel::Read, false, None);
        state.add_hold("b", LockLevel::Read, false, None);

        assert!(state.conflicts_with("a", LockLevel::Write));
    }

    #[test]
    fn test_retention_conflict_rules() {
        // WRITE recalls any retention
        assert!(retention_conflicts(LockLevel::Write, LockLevel::Read));
        assert!(retention_conflicts(LockLevel::Write, LockLevel::Concurrent));
        // READ coexists with retained READ, recalls retained CONCURRENT
        assert!(!retention_conflicts(LockLevel::Read, LockLevel::Read));
        assert!(retention_conflicts(LockLevel::Read, LockLevel::Concurrent));
        // CONCURRENT never recalls another CONCURRENT
        assert!(!retention_conflicts(
            LockLevel::Concurrent,
            LockLevel::Concurrent
        ));
        assert!(retention_conflicts(LockLevel::Concurrent, LockLevel::Write));
    }

    #[test]
    fn test_durable_roundtrip() {
        let mut state = LockState::new("l");
        state.pinned = true;
        state.add_hold("a", LockLevel::Write, true, None);
        state.remove_hold("a");
        state.set_retention("a", LockLevel::Write);

        let durable = state.durable().unwrap();
        let encoded = serde_json::to_string(&durable).unwrap();
        let decoded: LockDurable = serde_json::from_str(&encoded).unwrap();

        let mut restored = LockState::new("l");
        restored.apply_durable(decoded);
        assert!(restored.pinned);
        assert_eq!(restored.retention().map(|r| r.level), Some(LockLevel::Write));
        assert_eq!(restored.last_level(), Some(LockLevel::Write));
    }

    #[test]
    fn test_unpinned_idle_lock_has_no_durable_fraction() {
        let mut state = LockState::new("l");
        state.add_hold("a", LockLevel::Read, false, None);
        assert!(state.durable().is_none());
    }

    #[test]
    fn test_wait_queue_fifo() {
        let mut state = LockState::new("l");
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        state.push_waiter(WaitEntry {
            node: "w1".to_string(),
            level: LockLevel::Write,
            outer_level: None,
            greedy: false,
            enqueued_at: 1,
            wake_tx: tx1,
        });
        state.push_waiter(WaitEntry {
            node: "w2".to_string(),
            level: LockLevel::Write,
            outer_level: None,
            greedy: false,
            enqueued_at: 2,
            wake_tx: tx2,
        });

        assert_eq!(state.pop_waiter().map(|w| w.node), Some("w1".to_string()));
        assert_eq!(state.pop_waiter().map(|w| w.node), Some("w2".to_string()));
        assert!(state.pop_waiter().is_none());
    }
}
