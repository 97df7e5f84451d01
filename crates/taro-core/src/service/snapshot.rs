//! Snapshot persistence for the coordinator's durable state
//!
//! The durable fraction — pinned/greedy lock state, root bindings and their
//! latest committed sequences, per-node publish watermarks — is written as
//! one JSON document via a temp file and an atomic rename, and loaded before
//! the coordinator accepts requests after a restart.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use taro_api::model::NodeId;

use super::lock_table::LockDurable;
use super::root_registry::RootDurable;

/// Per-node watermarks that survive a coordinator restart
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDurable {
    pub node_id: NodeId,
    pub published_seq: u64,
}

/// Everything the coordinator must reconstruct before accepting requests
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DurableState {
    pub topology_version: u64,
    pub commit_seq: u64,
    #[serde(default)]
    pub locks: Vec<LockDurable>,
    #[serde(default)]
    pub roots: Vec<RootDurable>,
    #[serde(default)]
    pub nodes: Vec<NodeDurable>,
}

pub struct SnapshotStore {
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// `None` disables persistence entirely
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Write the snapshot atomically (temp file, then rename)
    pub async fn save(&self, state: &DurableState) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load the snapshot if one exists
    pub async fn load(&self) -> anyhow::Result<Option<DurableState>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<DurableState>(&bytes) {
            Ok(state) => {
                info!(
                    path = %path.display(),
                    locks = state.locks.len(),
                    roots = state.roots.len(),
                    nodes = state.nodes.len(),
                    "loaded coordinator snapshot"
                );
                Ok(Some(state))
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "snapshot unreadable, starting empty");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taro_api::model::{LockLevel, RootScope, RootType};

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let store = SnapshotStore::new(Some(path.clone()));

        let state = DurableState {
            topology_version: 3,
            commit_seq: 42,
            locks: vec![LockDurable {
                lock_id: "l".to_string(),
                pinned: true,
                retained: None,
                last_level: Some(LockLevel::Write),
                last_holder: Some("a".to_string()),
            }],
            roots: vec![RootDurable {
                scope: RootScope::Static,
                name: "counter".to_string(),
                root_type: RootType::Long,
                value: serde_json::json!(41),
                last_commit_seq: 42,
            }],
            nodes: vec![NodeDurable {
                node_id: "a".to_string(),
                published_seq: 7,
            }],
        };

        store.save(&state).await.unwrap();
        assert!(path.exists());

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.topology_version, 3);
        assert_eq!(loaded.commit_seq, 42);
        assert_eq!(loaded.locks.len(), 1);
        assert_eq!(loaded.roots[0].name, "counter");
        assert_eq!(loaded.nodes[0].published_seq, 7);
    }

    #[tokio::test]
    async fn test_missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(Some(dir.path().join("missing.json")));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_store_is_noop() {
        let store = SnapshotStore::new(None);
        assert!(!store.is_enabled());
        store.save(&DurableState::default()).await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = SnapshotStore::new(Some(path));
        assert!(store.load().await.unwrap().is_none());
    }
}
