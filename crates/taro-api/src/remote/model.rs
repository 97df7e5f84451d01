//! Coordinator protocol models
//!
//! Requests carry synchronous call semantics from the node's point of view;
//! server pushes (recall, topology events, change-set delivery) flow the
//! other way over the per-node channel registered at join.

use serde::{Deserialize, Serialize};

use crate::change::{ChangeEntry, ChangeSet};
use crate::model::{LockLevel, NodeId, RootScope, RootType, TopologyEvent, TopologySnapshot};

/// Outcome of a lock request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BeginLockOutcome {
    /// Granted immediately, no conflicting hold existed
    Granted,
    /// Conflicting holds exist; the request is queued in arrival order
    Queued { ticket: String },
}

/// Outcome of a wait call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitOutcome {
    /// Woken by notify/notifyAll and re-acquired the prior level
    Resumed,
    /// Bounded timeout expired before a notify arrived
    TimedOut,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeginLockRequest {
    pub node_id: NodeId,
    pub lock_id: String,
    pub level: LockLevel,
    /// Retain the lock locally across begin/commit cycles until recalled
    #[serde(default)]
    pub greedy: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitLockRequest {
    pub node_id: NodeId,
    pub lock_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitRequest {
    pub node_id: NodeId,
    pub lock_id: String,
    /// None waits until notified
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindRootRequest {
    pub node_id: NodeId,
    pub scope: RootScope,
    pub root: String,
    pub root_type: RootType,
    pub initial: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishChangeSetRequest {
    pub node_id: NodeId,
    pub lock_id: String,
    pub seq: u64,
    pub changes: Vec<ChangeEntry>,
}

/// Coordinator requests, one variant per protocol operation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    Join(JoinRequest),
    SyncComplete { node_id: NodeId },
    Reconnect { node_id: NodeId },
    Leave { node_id: NodeId },
    BeginLock(BeginLockRequest),
    CommitLock(CommitLockRequest),
    AbortLock(CommitLockRequest),
    PinLock { lock_id: String },
    EvictLock { lock_id: String },
    Wait(WaitRequest),
    Notify { lock_id: String },
    NotifyAll { lock_id: String },
    BindRoot(BindRootRequest),
    FaultRoot { node_id: NodeId, scope: RootScope, root: String },
    EvictCache { scope: RootScope, root: String, target: usize },
    PublishChangeSet(PublishChangeSetRequest),
    AckDelivery { node_id: NodeId, commit_seq: u64 },
}

/// Coordinator responses, mirroring [`Request`] variants
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Joined(TopologySnapshot),
    Ok,
    BeginLock(BeginLockOutcome),
    Wait { outcome: WaitOutcome },
    RootValue { value: serde_json::Value },
    Evicted { count: usize },
    Ack { seq: u64 },
}

/// Asynchronous notifications pushed from the coordinator to one node
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "push", rename_all = "snake_case")]
pub enum ServerPush {
    /// Release a greedily retained lock so a conflicting requester can proceed
    Recall { lock_id: String },
    /// Membership transition
    Topology(TopologyEvent),
    /// Committed change set for a root this node has faulted in
    ChangeSetDelivery {
        scope: RootScope,
        root: String,
        /// Global commit order, identical for every recipient
        commit_seq: u64,
        changes: ChangeSet,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_lock_outcome_tagging() {
        let queued = BeginLockOutcome::Queued {
            ticket: "t-1".to_string(),
        };
        let encoded = serde_json::to_string(&queued).unwrap();
        assert!(encoded.contains("queued"));
        assert!(encoded.contains("t-1"));

        let decoded: BeginLockOutcome = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, queued);
    }

    #[test]
    fn test_request_roundtrip() {
        let req = Request::BeginLock(BeginLockRequest {
            node_id: "node-1".to_string(),
            lock_id: "map-lock".to_string(),
            level: LockLevel::Write,
            greedy: true,
        });
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Request::BeginLock(r) => {
                assert_eq!(r.level, LockLevel::Write);
                assert!(r.greedy);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_greedy_defaults_false() {
        let decoded: BeginLockRequest = serde_json::from_str(
            r#"{"node_id":"n","lock_id":"l","level":"read"}"#,
        )
        .unwrap();
        assert!(!decoded.greedy);
    }
}
