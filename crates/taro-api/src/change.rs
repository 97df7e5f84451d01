//! Change-set payloads replicated between nodes
//!
//! A change set is the ordered batch of field/element mutations a node
//! performed while holding one lock. Mutations are explicit tagged-variant
//! descriptors applied through the root registry, never opaque field pokes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use taro_common::TaroError;

use crate::model::{NodeId, RootScope};

/// One field/element-level mutation descriptor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Replace the value at a field path on a struct-shaped root
    FieldSet { path: String, value: Value },
    /// Insert or replace a mapping on a map-shaped root
    MapPut { key: String, value: Value },
    /// Remove a mapping from a map-shaped root
    MapRemove { key: String },
    /// Append an element to a list-shaped root
    ListPush { value: Value },
    /// Replace an element of a list-shaped root
    ListSet { index: usize, value: Value },
    /// Replace the whole root value (scalar roots)
    Replace { value: Value },
}

impl ChangeOp {
    /// Apply this mutation to a root value in place
    ///
    /// Used identically by the authoritative registry and by node-local
    /// caches applying a delivered change set, so both sides converge.
    pub fn apply_to(&self, value: &mut Value) -> Result<(), TaroError> {
        match self {
            ChangeOp::FieldSet { path, value: new } => set_field(value, path, new.clone()),
            ChangeOp::MapPut { key, value: new } => {
                as_object_mut(value)?.insert(key.clone(), new.clone());
                Ok(())
            }
            ChangeOp::MapRemove { key } => {
                as_object_mut(value)?.remove(key);
                Ok(())
            }
            ChangeOp::ListPush { value: new } => {
                as_array_mut(value)?.push(new.clone());
                Ok(())
            }
            ChangeOp::ListSet { index, value: new } => {
                let list = as_array_mut(value)?;
                match list.get_mut(*index) {
                    Some(slot) => {
                        *slot = new.clone();
                        Ok(())
                    }
                    None => Err(TaroError::IllegalArgument(format!(
                        "list index {} out of bounds (len {})",
                        index,
                        list.len()
                    ))),
                }
            }
            ChangeOp::Replace { value: new } => {
                *value = new.clone();
                Ok(())
            }
        }
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut serde_json::Map<String, Value>, TaroError> {
    value
        .as_object_mut()
        .ok_or_else(|| TaroError::IllegalArgument("map operation on non-map root".to_string()))
}

fn as_array_mut(value: &mut Value) -> Result<&mut Vec<Value>, TaroError> {
    value
        .as_array_mut()
        .ok_or_else(|| TaroError::IllegalArgument("list operation on non-list root".to_string()))
}

/// Navigate a dot-separated field path, creating intermediate objects
fn set_field(value: &mut Value, path: &str, new: Value) -> Result<(), TaroError> {
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            TaroError::IllegalArgument(format!("field path '{}' traverses a non-object", path))
        })?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), new);
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Err(TaroError::IllegalArgument("empty field path".to_string()))
}

/// A mutation targeted at one root
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub scope: RootScope,
    pub root: String,
    #[serde(flatten)]
    pub op: ChangeOp,
}

/// Ordered batch of mutations committed atomically under one lock hold
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Publishing node
    pub node: NodeId,
    /// Lock the mutations were performed under
    pub lock_id: String,
    /// Per-node monotonically increasing publish sequence
    pub seq: u64,
    /// Mutations in program order
    pub ops: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new(node: impl Into<NodeId>, lock_id: impl Into<String>, seq: u64) -> Self {
        Self {
            node: node.into(),
            lock_id: lock_id.into(),
            seq,
            ops: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Distinct roots touched by this change set, in first-touch order
    pub fn touched_roots(&self) -> Vec<(RootScope, String)> {
        let mut roots: Vec<(RootScope, String)> = Vec::new();
        for entry in &self.ops {
            let key = (entry.scope, entry.root.clone());
            if !roots.contains(&key) {
                roots.push(key);
            }
        }
        roots
    }
}
