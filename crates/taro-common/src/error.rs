//! Error types and error codes for Taro
//!
//! This module defines:
//! - `TaroError`: typed error signals reported to calling nodes
//! - `ErrorCode`: structured error codes for protocol responses
//!
//! The coordinator is a long-lived service; errors are surfaced as typed
//! signals on the call that triggered them, never as process exits.

use serde::{Deserialize, Serialize};

/// Typed error signals for the coordinator protocol
#[derive(thiserror::Error, Debug)]
pub enum TaroError {
    /// Mutation attempted without any active hold on the lock
    #[error("unlocked shared access: node '{node}' mutated under lock '{lock_id}' without holding it")]
    UnlockedSharedAccess { node: String, lock_id: String },

    /// Mutation attempted under a READ-only hold
    #[error("read-only lock: node '{node}' mutated under READ hold on lock '{lock_id}'")]
    ReadOnlyLock { node: String, lock_id: String },

    /// Second, structurally incompatible bind of an existing root name
    #[error("type conflict on root '{root}': bound as {bound}, rebind attempted as {attempted}")]
    TypeConflict {
        root: String,
        bound: String,
        attempted: String,
    },

    /// Wait or reconnect grace window expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// Node connection lost mid-transaction
    #[error("node lost: {0}")]
    NodeLost(String),

    /// Node is not known to the cluster (never joined, or already left)
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    /// Root name is not bound
    #[error("unknown root '{0}'")]
    UnknownRoot(String),

    /// Eviction refused while a recall is draining on the same lock
    #[error("recall in flight on lock '{0}'")]
    RecallInFlight(String),

    /// Request arrived before snapshot recovery completed
    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    /// Lock state disagrees with the request (e.g. commit without a hold)
    #[error("illegal lock state: {0}")]
    IllegalLockState(String),

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaroError {
    /// Whether the error is a protocol violation (caller bug, shared state intact)
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TaroError::UnlockedSharedAccess { .. } | TaroError::ReadOnlyLock { .. }
        )
    }

    /// The structured code reported on the protocol surface
    pub fn code(&self) -> ErrorCode<'static> {
        match self {
            TaroError::UnlockedSharedAccess { .. } => UNLOCKED_SHARED_ACCESS,
            TaroError::ReadOnlyLock { .. } => READ_ONLY_LOCK,
            TaroError::TypeConflict { .. } => ROOT_TYPE_CONFLICT,
            TaroError::Timeout(_) => OPERATION_TIMEOUT,
            TaroError::NodeLost(_) => NODE_LOST,
            TaroError::UnknownNode(_) => UNKNOWN_NODE,
            TaroError::UnknownRoot(_) => UNKNOWN_ROOT,
            TaroError::RecallInFlight(_) => RECALL_IN_FLIGHT,
            TaroError::CoordinatorUnavailable(_) => COORDINATOR_UNAVAILABLE,
            TaroError::IllegalLockState(_) => ILLEGAL_LOCK_STATE,
            TaroError::IllegalArgument(_) => ILLEGAL_ARGUMENT,
            TaroError::Internal(_) => SERVER_ERROR,
        }
    }
}

/// Error code structure for protocol responses
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const ILLEGAL_ARGUMENT: ErrorCode<'static> = ErrorCode {
    code: 10000,
    message: "illegal argument",
};

pub const UNKNOWN_NODE: ErrorCode<'static> = ErrorCode {
    code: 10001,
    message: "unknown node",
};

pub const UNKNOWN_ROOT: ErrorCode<'static> = ErrorCode {
    code: 10002,
    message: "unknown root",
};

pub const UNLOCKED_SHARED_ACCESS: ErrorCode<'static> = ErrorCode {
    code: 20001,
    message: "unlocked shared access",
};

pub const READ_ONLY_LOCK: ErrorCode<'static> = ErrorCode {
    code: 20002,
    message: "attempt to write under read-only lock",
};

pub const ILLEGAL_LOCK_STATE: ErrorCode<'static> = ErrorCode {
    code: 20003,
    message: "illegal lock state",
};

pub const RECALL_IN_FLIGHT: ErrorCode<'static> = ErrorCode {
    code: 20004,
    message: "recall in flight",
};

pub const ROOT_TYPE_CONFLICT: ErrorCode<'static> = ErrorCode {
    code: 21001,
    message: "root type conflict",
};

pub const OPERATION_TIMEOUT: ErrorCode<'static> = ErrorCode {
    code: 22001,
    message: "operation timeout",
};

pub const NODE_LOST: ErrorCode<'static> = ErrorCode {
    code: 23001,
    message: "node connection lost",
};

pub const COORDINATOR_UNAVAILABLE: ErrorCode<'static> = ErrorCode {
    code: 23002,
    message: "coordinator unavailable",
};

pub const SERVER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30000,
    message: "server error",
};
