//! Root registry: named entry points into the shared object graph
//!
//! Roots are created lazily on first bind and carry one explicit type tag
//! for their lifetime; a second, structurally incompatible bind under the
//! same name is rejected as a type conflict, in the instance namespace and
//! the static namespace alike. The registry holds the authoritative value,
//! applies committed change sets in commit order, tracks which nodes have
//! each root faulted in, and runs the shared-map cache evictor.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use taro_api::change::ChangeSet;
use taro_api::model::{NodeId, RootScope, RootType};
use taro_common::TaroError;

/// Cache residency bookkeeping for one map entry
///
/// The accessed mark is set on every observation and cleared by an eviction
/// sweep; an entry whose mark was cleared by the previous sweep and not
/// re-set since is newly-observed-then-stale, the only thing the evictor
/// targets.
#[derive(Clone, Debug)]
struct EntryMeta {
    accessed: bool,
}

impl EntryMeta {
    fn observed() -> Self {
        Self { accessed: true }
    }
}

struct RootEntry {
    root_type: RootType,
    value: Value,
    bound_by: NodeId,
    last_commit_seq: u64,
    /// Nodes with this root faulted into their local cache
    subscribers: HashSet<NodeId>,
    /// Per-key residency marks for map-shaped roots
    observation: HashMap<String, EntryMeta>,
}

/// Durable fraction of one root, survives a coordinator restart
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootDurable {
    pub scope: RootScope,
    pub name: String,
    pub root_type: RootType,
    pub value: Value,
    pub last_commit_seq: u64,
}

fn value_matches(root_type: RootType, value: &Value) -> bool {
    match root_type {
        RootType::Int | RootType::Long => value.is_i64() || value.is_u64(),
        RootType::Float => value.is_number(),
        RootType::Bool => value.is_boolean(),
        RootType::Text => value.is_string(),
        RootType::Map => value.is_object(),
        RootType::List => value.is_array(),
    }
}

#[derive(Default)]
pub struct RootRegistry {
    roots: DashMap<(RootScope, String), RootEntry>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a root name, creating it on first bind
    ///
    /// A root name is bound to exactly one type for its lifetime; rebinding
    /// with the same type is an idempotent subscribe, rebinding with an
    /// incompatible type fails synchronously with a type conflict.
    pub fn bind(
        &self,
        node: &str,
        scope: RootScope,
        name: &str,
        root_type: RootType,
        initial: Value,
    ) -> Result<(), TaroError> {
        match self.roots.entry((scope, name.to_string())) {
            Entry::Occupied(mut existing) => {
                let entry = existing.get_mut();
                if entry.root_type != root_type {
                    return Err(TaroError::TypeConflict {
                        root: name.to_string(),
                        bound: entry.root_type.to_string(),
                        attempted: root_type.to_string(),
                    });
                }
                // The existing value wins; the caller faults it in
                entry.subscribers.insert(node.to_string());
                Ok(())
            }
            Entry::Vacant(vacant) => {
                if !value_matches(root_type, &initial) {
                    return Err(TaroError::IllegalArgument(format!(
                        "initial value for root '{}' does not match type {}",
                        name, root_type
                    )));
                }
                let mut observation = HashMap::new();
                if let Some(object) = initial.as_object() {
                    for key in object.keys() {
                        observation.insert(key.clone(), EntryMeta::observed());
                    }
                }
                let mut subscribers = HashSet::new();
                subscribers.insert(node.to_string());
                vacant.insert(RootEntry {
                    root_type,
                    value: initial,
                    bound_by: node.to_string(),
                    last_commit_seq: 0,
                    subscribers,
                    observation,
                });
                info!(scope = %scope, root = %name, r#type = %root_type, node = %node, "root bound");
                Ok(())
            }
        }
    }

    /// Fault a root into a node's local cache
    ///
    /// Subscribes the node to change-set delivery for the root and marks
    /// every current map entry as observed.
    pub fn fault(&self, node: &str, scope: RootScope, name: &str) -> Result<Value, TaroError> {
        let mut entry = self
            .roots
            .get_mut(&(scope, name.to_string()))
            .ok_or_else(|| TaroError::UnknownRoot(name.to_string()))?;
        entry.subscribers.insert(node.to_string());
        for meta in entry.observation.values_mut() {
            meta.accessed = true;
        }
        debug!(scope = %scope, root = %name, node = %node, "root faulted in");
        Ok(entry.value.clone())
    }

    /// Read one mapping of a map-shaped root, marking it observed
    pub fn read_entry(
        &self,
        scope: RootScope,
        name: &str,
        key: &str,
    ) -> Result<Option<Value>, TaroError> {
        let mut entry = self
            .roots
            .get_mut(&(scope, name.to_string()))
            .ok_or_else(|| TaroError::UnknownRoot(name.to_string()))?;
        let value = entry.value.get(key).cloned();
        if value.is_some() {
            entry
                .observation
                .entry(key.to_string())
                .and_modify(|meta| meta.accessed = true)
                .or_insert_with(EntryMeta::observed);
        }
        Ok(value)
    }

    /// Apply one committed change set in commit order
    pub fn apply(&self, changes: &ChangeSet, commit_seq: u64) -> Result<(), TaroError> {
        for change in &changes.ops {
            let mut entry = self
                .roots
                .get_mut(&(change.scope, change.root.clone()))
                .ok_or_else(|| TaroError::UnknownRoot(change.root.clone()))?;
            change.op.apply_to(&mut entry.value)?;
            match &change.op {
                taro_api::change::ChangeOp::MapPut { key, .. } => {
                    entry
                        .observation
                        .insert(key.clone(), EntryMeta::observed());
                }
                taro_api::change::ChangeOp::MapRemove { key } => {
                    entry.observation.remove(key);
                }
                taro_api::change::ChangeOp::Replace { value } => {
                    // A replaced map restarts residency tracking from scratch
                    entry.observation.clear();
                    if let Some(object) = value.as_object() {
                        for key in object.keys() {
                            entry.observation.insert(key.clone(), EntryMeta::observed());
                        }
                    }
                }
                _ => {}
            }
            entry.last_commit_seq = commit_seq;
        }
        Ok(())
    }

    /// Evict up to `target` newly-observed-then-stale cache entries
    ///
    /// An eviction sweep removes the residency records of entries whose
    /// accessed mark was cleared by the previous sweep and never re-set,
    /// then clears the marks of the survivors. Entries observed since the
    /// last sweep always survive it. The authoritative value is untouched.
    pub fn evict_cache(
        &self,
        scope: RootScope,
        name: &str,
        target: usize,
    ) -> Result<usize, TaroError> {
        let mut entry = self
            .roots
            .get_mut(&(scope, name.to_string()))
            .ok_or_else(|| TaroError::UnknownRoot(name.to_string()))?;

        let stale: Vec<String> = entry
            .observation
            .iter()
            .filter(|(_, meta)| !meta.accessed)
            .map(|(key, _)| key.clone())
            .take(target)
            .collect();
        for key in &stale {
            entry.observation.remove(key);
        }
        for meta in entry.observation.values_mut() {
            meta.accessed = false;
        }
        info!(scope = %scope, root = %name, evicted = stale.len(), target, "cache eviction sweep");
        Ok(stale.len())
    }

    /// Nodes with the root currently faulted in
    pub fn subscribers_of(&self, scope: RootScope, name: &str) -> Vec<NodeId> {
        self.roots
            .get(&(scope, name.to_string()))
            .map(|entry| entry.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unsubscribe(&self, node: &str, scope: RootScope, name: &str) {
        if let Some(mut entry) = self.roots.get_mut(&(scope, name.to_string())) {
            entry.subscribers.remove(node);
        }
    }

    /// Drop a departed node from every subscription set
    pub fn unsubscribe_all(&self, node: &str) {
        for mut entry in self.roots.iter_mut() {
            entry.subscribers.remove(node);
        }
    }

    pub fn value_of(&self, scope: RootScope, name: &str) -> Option<Value> {
        self.roots
            .get(&(scope, name.to_string()))
            .map(|entry| entry.value.clone())
    }

    pub fn root_type_of(&self, scope: RootScope, name: &str) -> Option<RootType> {
        self.roots
            .get(&(scope, name.to_string()))
            .map(|entry| entry.root_type)
    }

    pub fn bound_by(&self, scope: RootScope, name: &str) -> Option<NodeId> {
        self.roots
            .get(&(scope, name.to_string()))
            .map(|entry| entry.bound_by.clone())
    }

    pub fn resident_entries(&self, scope: RootScope, name: &str) -> usize {
        self.roots
            .get(&(scope, name.to_string()))
            .map(|entry| entry.observation.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Durable fraction for the coordinator snapshot
    pub fn durable(&self) -> Vec<RootDurable> {
        self.roots
            .iter()
            .map(|entry| RootDurable {
                scope: entry.key().0,
                name: entry.key().1.clone(),
                root_type: entry.root_type,
                value: entry.value.clone(),
                last_commit_seq: entry.last_commit_seq,
            })
            .collect()
    }

    pub fn load_durable(&self, roots: Vec<RootDurable>) {
        for durable in roots {
            let mut observation = HashMap::new();
            if let Some(object) = durable.value.as_object() {
                for key in object.keys() {
                    observation.insert(key.clone(), EntryMeta::observed());
                }
            }
            self.roots.insert(
                (durable.scope, durable.name),
                RootEntry {
                    root_type: durable.root_type,
                    value: durable.value,
                    bound_by: String::new(),
                    last_commit_seq: durable.last_commit_seq,
                    subscribers: HashSet::new(),
                    observation,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taro_api::change::{ChangeEntry, ChangeOp};

    fn put(registry: &RootRegistry, name: &str, key: &str, value: Value, commit_seq: u64) {
        let mut changes = ChangeSet::new("writer", "l", commit_seq);
        changes.ops.push(ChangeEntry {
            scope: RootScope::Instance,
            root: name.to_string(),
            op: ChangeOp::MapPut {
                key: key.to_string(),
                value,
            },
        });
        registry.apply(&changes, commit_seq).unwrap();
    }

    #[test]
    fn test_duplicate_root_type_conflict_instance_scope() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Instance, "root", RootType::Int, json!(1))
            .unwrap();

        let err = registry
            .bind("b", RootScope::Instance, "root", RootType::Long, json!(2))
            .unwrap_err();
        match err {
            TaroError::TypeConflict {
                root,
                bound,
                attempted,
            } => {
                assert_eq!(root, "root");
                assert_eq!(bound, "Int");
                assert_eq!(attempted, "Long");
            }
            other => panic!("expected type conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_root_type_conflict_static_scope() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Static, "root", RootType::Int, json!(1))
            .unwrap();
        assert!(matches!(
            registry.bind("b", RootScope::Static, "root", RootType::Long, json!(2)),
            Err(TaroError::TypeConflict { .. })
        ));
        // Scopes are independent namespaces
        registry
            .bind("b", RootScope::Instance, "root", RootType::Long, json!(2))
            .unwrap();
    }

    #[test]
    fn test_rebind_same_type_keeps_existing_value() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Instance, "counter", RootType::Int, json!(7))
            .unwrap();
        registry
            .bind("b", RootScope::Instance, "counter", RootType::Int, json!(99))
            .unwrap();

        assert_eq!(
            registry.value_of(RootScope::Instance, "counter"),
            Some(json!(7))
        );
        assert_eq!(registry.subscribers_of(RootScope::Instance, "counter").len(), 2);
    }

    #[test]
    fn test_initial_value_must_match_type() {
        let registry = RootRegistry::new();
        assert!(matches!(
            registry.bind("a", RootScope::Instance, "m", RootType::Map, json!(5)),
            Err(TaroError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_fault_subscribes_and_returns_value() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Instance, "m", RootType::Map, json!({"k": 1}))
            .unwrap();

        let value = registry.fault("b", RootScope::Instance, "m").unwrap();
        assert_eq!(value, json!({"k": 1}));
        let mut subscribers = registry.subscribers_of(RootScope::Instance, "m");
        subscribers.sort();
        assert_eq!(subscribers, vec!["a".to_string(), "b".to_string()]);

        assert!(matches!(
            registry.fault("b", RootScope::Instance, "missing"),
            Err(TaroError::UnknownRoot(_))
        ));
    }

    #[test]
    fn test_eviction_targets_only_newly_observed_then_stale() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Instance, "m", RootType::Map, json!({}))
            .unwrap();

        // 100 mappings added and observed
        for i in 0..100 {
            put(&registry, "m", &format!("old-{}", i), json!(i), i as u64 + 1);
        }
        assert_eq!(registry.resident_entries(RootScope::Instance, "m"), 100);

        // All 100 were observed since the last sweep: nothing is evicted
        let evicted = registry.evict_cache(RootScope::Instance, "m", 100).unwrap();
        assert_eq!(evicted, 0);

        // A fresh batch of 100 is added and observed; the prior 100 are now
        // stale and exactly they are evicted
        for i in 0..100 {
            put(&registry, "m", &format!("new-{}", i), json!(i), 200 + i as u64);
        }
        let evicted = registry.evict_cache(RootScope::Instance, "m", 100).unwrap();
        assert_eq!(evicted, 100);
        assert_eq!(registry.resident_entries(RootScope::Instance, "m"), 100);

        // The authoritative value keeps every mapping
        let value = registry.value_of(RootScope::Instance, "m").unwrap();
        assert_eq!(value.as_object().unwrap().len(), 200);
    }

    #[test]
    fn test_re_observation_protects_from_eviction() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Instance, "m", RootType::Map, json!({}))
            .unwrap();
        put(&registry, "m", "k1", json!(1), 1);
        put(&registry, "m", "k2", json!(2), 2);

        // First sweep ages both entries
        assert_eq!(registry.evict_cache(RootScope::Instance, "m", 10).unwrap(), 0);

        // k1 is observed again; only k2 is stale at the next sweep
        registry.read_entry(RootScope::Instance, "m", "k1").unwrap();
        assert_eq!(registry.evict_cache(RootScope::Instance, "m", 10).unwrap(), 1);
        assert_eq!(registry.resident_entries(RootScope::Instance, "m"), 1);
    }

    #[test]
    fn test_eviction_respects_target() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Instance, "m", RootType::Map, json!({}))
            .unwrap();
        for i in 0..10 {
            put(&registry, "m", &format!("k{}", i), json!(i), i as u64 + 1);
        }
        registry.evict_cache(RootScope::Instance, "m", 10).unwrap();

        // Only `target` stale entries go per sweep
        assert_eq!(registry.evict_cache(RootScope::Instance, "m", 4).unwrap(), 4);
    }

    #[test]
    fn test_apply_unknown_root_fails() {
        let registry = RootRegistry::new();
        let mut changes = ChangeSet::new("a", "l", 1);
        changes.ops.push(ChangeEntry {
            scope: RootScope::Instance,
            root: "missing".to_string(),
            op: ChangeOp::Replace { value: json!(1) },
        });
        assert!(matches!(
            registry.apply(&changes, 1),
            Err(TaroError::UnknownRoot(_))
        ));
    }

    #[test]
    fn test_durable_roundtrip() {
        let registry = RootRegistry::new();
        registry
            .bind("a", RootScope::Static, "counter", RootType::Long, json!(41))
            .unwrap();

        let durable = registry.durable();
        let restored = RootRegistry::new();
        restored.load_durable(durable);

        assert_eq!(
            restored.value_of(RootScope::Static, "counter"),
            Some(json!(41))
        );
        assert_eq!(
            restored.root_type_of(RootScope::Static, "counter"),
            Some(RootType::Long)
        );
        // A conflicting rebind still fails after a restart
        assert!(matches!(
            restored.bind("b", RootScope::Static, "counter", RootType::Int, json!(0)),
            Err(TaroError::TypeConflict { .. })
        ));
    }
}
