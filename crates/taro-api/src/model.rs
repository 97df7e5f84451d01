//! Common data model for the Taro cluster
//!
//! Defines node identity and liveness, lock levels and holds, root type
//! bindings, and topology snapshots/events shared by the coordinator and the
//! node-side SDK.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// Default timeouts and intervals (milliseconds)
pub const DEFAULT_RECONNECT_GRACE_MS: u64 = 30_000;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1024;

/// Node identity within the cluster
pub type NodeId = String;

/// Liveness state of a participating node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Joined, initial sync not yet complete
    Joining,
    /// Fully participating
    Active,
    /// Connection lost, inside the reconnect grace window
    Disconnected,
    /// Reconnected, reconciling missed state
    Reconnecting,
    /// Departed, all transient state dropped
    Left,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Joining => write!(f, "JOINING"),
            NodeState::Active => write!(f, "ACTIVE"),
            NodeState::Disconnected => write!(f, "DISCONNECTED"),
            NodeState::Reconnecting => write!(f, "RECONNECTING"),
            NodeState::Left => write!(f, "LEFT"),
        }
    }
}

/// A participating node process
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub state: NodeState,
    /// Join time, epoch millis
    pub joined_at: i64,
    /// Last observed activity, epoch millis
    pub last_seen: i64,
    /// Highest change-set sequence published by this node and applied
    pub published_seq: u64,
    /// Highest commit sequence delivered to and acknowledged by this node
    pub acked_commit_seq: u64,
}

impl Node {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let now = taro_common::current_timestamp();
        Self {
            node_id: node_id.into(),
            state: NodeState::Joining,
            joined_at: now,
            last_seen: now,
            published_seq: 0,
            acked_commit_seq: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            NodeState::Joining | NodeState::Active | NodeState::Reconnecting
        )
    }
}

/// Exclusivity grading of a lock hold
///
/// Ordered: `None < Concurrent < Read < Write`. WRITE is exclusive, READ is
/// shared among readers, CONCURRENT admits unordered concurrent holders whose
/// changes are never serialized against each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    None,
    Concurrent,
    Read,
    Write,
}

impl LockLevel {
    /// Whether two holds at these levels may coexist on one lock
    ///
    /// WRITE excludes everything; READ and CONCURRENT coexist freely.
    pub fn compatible_with(self, other: LockLevel) -> bool {
        !matches!(self, LockLevel::Write) && !matches!(other, LockLevel::Write)
    }

    /// Whether a hold at this level permits mutation
    pub fn permits_write(self) -> bool {
        matches!(self, LockLevel::Concurrent | LockLevel::Write)
    }
}

impl Display for LockLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockLevel::None => write!(f, "NONE"),
            LockLevel::Concurrent => write!(f, "CONCURRENT"),
            LockLevel::Read => write!(f, "READ"),
            LockLevel::Write => write!(f, "WRITE"),
        }
    }
}

impl FromStr for LockLevel {
    type Err = taro_common::TaroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(LockLevel::None),
            "CONCURRENT" => Ok(LockLevel::Concurrent),
            "READ" => Ok(LockLevel::Read),
            "WRITE" => Ok(LockLevel::Write),
            other => Err(taro_common::TaroError::IllegalArgument(format!(
                "unknown lock level '{}'",
                other
            ))),
        }
    }
}

/// One node's hold on a lock
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockHold {
    pub node: NodeId,
    pub level: LockLevel,
    /// Outer level shadowed by a nested upgrade (READ under an upgraded WRITE)
    #[serde(default)]
    pub outer_level: Option<LockLevel>,
    /// Acquisition order within the lock, monotonically increasing
    pub order: u64,
    /// Greedy holds are retained locally across begin/commit cycles
    #[serde(default)]
    pub greedy: bool,
}

/// Explicit type tag bound to a root name at first publish
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootType {
    Int,
    Long,
    Float,
    Bool,
    Text,
    Map,
    List,
}

impl Display for RootType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RootType::Int => write!(f, "Int"),
            RootType::Long => write!(f, "Long"),
            RootType::Float => write!(f, "Float"),
            RootType::Bool => write!(f, "Bool"),
            RootType::Text => write!(f, "Text"),
            RootType::Map => write!(f, "Map"),
            RootType::List => write!(f, "List"),
        }
    }
}

/// Scope of a root binding
///
/// Static-scope roots model class-level shared state; instance-scope roots
/// model per-object shared state. The two namespaces are independent but obey
/// the same create-on-first-bind, type-checked-thereafter lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootScope {
    Instance,
    Static,
}

impl Display for RootScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RootScope::Instance => write!(f, "instance"),
            RootScope::Static => write!(f, "static"),
        }
    }
}

/// Versioned ordered list of currently connected nodes
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: u64,
    pub nodes: Vec<Node>,
}

/// Kind of a topology transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyEventKind {
    /// Node joined the cluster
    Joined,
    /// Initial sync complete, or connection regained
    Enabled,
    /// Connection lost, grace window open
    Disabled,
    /// Final departure
    Left,
}

impl Display for TopologyEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyEventKind::Joined => write!(f, "JOINED"),
            TopologyEventKind::Enabled => write!(f, "ENABLED"),
            TopologyEventKind::Disabled => write!(f, "DISABLED"),
            TopologyEventKind::Left => write!(f, "LEFT"),
        }
    }
}

/// Topology transition delivered to all cluster listeners
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyEvent {
    pub kind: TopologyEventKind,
    pub node_id: NodeId,
    /// Topology version after the transition
    pub version: u64,
    /// Event time, epoch millis
    pub timestamp: i64,
}

impl TopologyEvent {
    pub fn new(kind: TopologyEventKind, node_id: impl Into<NodeId>, version: u64) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            version,
            timestamp: taro_common::current_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_level_ordering() {
        assert!(LockLevel::None < LockLevel::Concurrent);
        assert!(LockLevel::Concurrent < LockLevel::Read);
        assert!(LockLevel::Read < LockLevel::Write);
    }

    #[test]
    fn test_lock_level_compatibility() {
        // WRITE excludes everything
        assert!(!LockLevel::Write.compatible_with(LockLevel::Write));
        assert!(!LockLevel::Write.compatible_with(LockLevel::Read));
        assert!(!LockLevel::Write.compatible_with(LockLevel::Concurrent));
        assert!(!LockLevel::Read.compatible_with(LockLevel::Write));

        // READ and CONCURRENT coexist
        assert!(LockLevel::Read.compatible_with(LockLevel::Read));
        assert!(LockLevel::Read.compatible_with(LockLevel::Concurrent));
        assert!(LockLevel::Concurrent.compatible_with(LockLevel::Concurrent));
    }

    #[test]
    fn test_lock_level_write_permission() {
        assert!(LockLevel::Write.permits_write());
        assert!(LockLevel::Concurrent.permits_write());
        assert!(!LockLevel::Read.permits_write());
        assert!(!LockLevel::None.permits_write());
    }

    #[test]
    fn test_lock_level_from_str() {
        assert_eq!("write".parse::<LockLevel>().unwrap(), LockLevel::Write);
        assert_eq!("READ".parse::<LockLevel>().unwrap(), LockLevel::Read);
        assert!("upgrade".parse::<LockLevel>().is_err());
    }

    #[test]
    fn test_node_connected_states() {
        let mut node = Node::new("node-1");
        assert_eq!(node.state, NodeState::Joining);
        assert!(node.is_connected());

        node.state = NodeState::Disconnected;
        assert!(!node.is_connected());

        node.state = NodeState::Left;
        assert!(!node.is_connected());
    }

    #[test]
    fn test_topology_event_display_kinds() {
        assert_eq!(TopologyEventKind::Joined.to_string(), "JOINED");
        assert_eq!(TopologyEventKind::Enabled.to_string(), "ENABLED");
        assert_eq!(TopologyEventKind::Disabled.to_string(), "DISABLED");
        assert_eq!(TopologyEventKind::Left.to_string(), "LEFT");
    }
}
