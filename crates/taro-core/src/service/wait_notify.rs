//! Wait/notify coordination across nodes
//!
//! Per-lock FIFO wait queues integrated with the lock manager: a waiter
//! atomically releases its hold and enqueues under the per-lock mutex, parks
//! on a oneshot, and on any exit re-acquires its prior level through the
//! normal grant path as a single atomic step.
//!
//! Per (lock, node) the states run
//! `HOLDING -> WAITING -> {NOTIFIED, TIMED_OUT, INTERRUPTED} -> HOLDING`,
//! except that an interrupted waiter never re-acquires.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use taro_api::remote::WaitOutcome;
use taro_common::TaroError;

use super::lock_manager::LockManager;
use super::lock_table::{WaitEntry, WaitWake};

pub struct WaitNotify {
    locks: Arc<LockManager>,
}

impl WaitNotify {
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self { locks }
    }

    /// Release the caller's hold, park until notified or the bound expires,
    /// then re-acquire the prior level
    ///
    /// The caller must hold the lock. `None` waits until notified or
    /// interrupted. A woken waiter competes for the lock through the normal
    /// grant rule, so it may briefly queue behind a pending WRITE request.
    pub async fn wait(
        &self,
        node: &str,
        lock_id: &str,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, TaroError> {
        let entry = self.locks.entry(lock_id);
        let (level, outer_level, greedy, rx) = {
            let mut state = entry.lock().await;
            let Some(hold) = state.remove_hold(node) else {
                return Err(TaroError::IllegalLockState(format!(
                    "wait without hold on '{}'",
                    lock_id
                )));
            };
            let (tx, rx) = tokio::sync::oneshot::channel();
            state.push_waiter(WaitEntry {
                node: node.to_string(),
                level: hold.level,
                outer_level: hold.outer_level,
                greedy: hold.greedy,
                enqueued_at: taro_common::current_timestamp(),
                wake_tx: tx,
            });
            // The hold is gone; queued requests may proceed while we wait
            state.grant_pending();
            (hold.level, hold.outer_level, hold.greedy, rx)
        };
        debug!(node = %node, lock = %lock_id, "node waiting");

        let wake = match timeout {
            Some(bound) => match tokio::time::timeout(bound, rx).await {
                Ok(wake) => wake,
                Err(_elapsed) => {
                    // The bound fired exactly once; withdraw the entry unless
                    // a racing notify already consumed it
                    {
                        let mut state = entry.lock().await;
                        state.remove_waiter(node);
                    }
                    self.locks
                        .reacquire(node, lock_id, level, outer_level, greedy)
                        .await?;
                    debug!(node = %node, lock = %lock_id, "wait timed out");
                    return Ok(WaitOutcome::TimedOut);
                }
            },
            None => rx.await,
        };

        match wake {
            Ok(WaitWake::Notified) => {
                self.locks
                    .reacquire(node, lock_id, level, outer_level, greedy)
                    .await?;
                debug!(node = %node, lock = %lock_id, "node resumed after notify");
                Ok(WaitOutcome::Resumed)
            }
            Ok(WaitWake::Interrupted) => Err(TaroError::NodeLost(format!(
                "wait on '{}' interrupted",
                lock_id
            ))),
            Err(_) => Err(TaroError::Internal(format!(
                "wait channel on '{}' closed",
                lock_id
            ))),
        }
    }

    /// Wake exactly one waiter, oldest enqueued first
    ///
    /// Waking only marks the waiter runnable; it still competes for the lock.
    pub async fn notify(&self, lock_id: &str) -> usize {
        let Some(entry) = self.locks.get_entry(lock_id) else {
            return 0;
        };
        let mut state = entry.lock().await;
        while let Some(waiter) = state.pop_waiter() {
            let waited_ms = taro_common::current_timestamp() - waiter.enqueued_at;
            // A dead channel means the waiter timed out concurrently; the
            // wake falls through to the next oldest
            if waiter.wake_tx.send(WaitWake::Notified).is_ok() {
                debug!(lock = %lock_id, node = %waiter.node, waited_ms, "notified one waiter");
                return 1;
            }
        }
        0
    }

    /// Wake every waiter
    pub async fn notify_all(&self, lock_id: &str) -> usize {
        let Some(entry) = self.locks.get_entry(lock_id) else {
            return 0;
        };
        let mut state = entry.lock().await;
        let mut woken = 0;
        for waiter in state.drain_waiters() {
            if waiter.wake_tx.send(WaitWake::Notified).is_ok() {
                woken += 1;
            }
        }
        if woken > 0 {
            debug!(lock = %lock_id, woken, "notified all waiters");
        }
        woken
    }

    /// Cancel a blocked wait; the node never re-acquires and the entry is
    /// removed without side effects on other waiters
    pub async fn interrupt(&self, node: &str, lock_id: &str) -> bool {
        let Some(entry) = self.locks.get_entry(lock_id) else {
            return false;
        };
        let mut state = entry.lock().await;
        match state.remove_waiter(node) {
            Some(waiter) => {
                let _ = waiter.wake_tx.send(WaitWake::Interrupted);
                true
            }
            None => false,
        }
    }
}
