//! In-memory registry backed by the RocksDB store
//!
//! Each group sits behind its own `tokio::sync::Mutex`; every read or write
//! of a group happens under that lock and no code path holds two group locks
//! at once. A mutation either commits to disk with its events or is rolled
//! back in memory.

use super::events::{Event, EventLog, Note};
use super::model::{Formation, Group, GroupKey, GroupRecord, Node};
use super::store::{Counters, RegistryStore};
use crate::common::error::{Error, Result};
use crate::common::metrics::METRICS;
use crate::common::protocol::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

pub const DEFAULT_FORMATION: &str = "default";

pub type GroupHandle = Arc<Mutex<Group>>;

/// Side effects of a group mutation besides the group itself.
#[derive(Debug, Default)]
pub struct Changes {
    pub notes: Vec<Note>,
    /// Nodes to delete from the store
    pub removed: Vec<NodeId>,
}

impl Changes {
    pub fn note(&mut self, note: Note) {
        self.notes.push(note);
    }

    pub fn extend(&mut self, notes: Vec<Note>) {
        self.notes.extend(notes);
    }
}

pub struct Registry {
    store: RegistryStore,
    groups: RwLock<HashMap<GroupKey, GroupHandle>>,
    node_index: RwLock<HashMap<NodeId, GroupKey>>,
    formations: RwLock<BTreeMap<String, Formation>>,
    /// Serializes id allocation with the write that persists it
    sequencer: std::sync::Mutex<Counters>,
    events: std::sync::Mutex<EventLog>,
}

impl Registry {
    /// Open the store and rebuild the in-memory view. Node liveness restarts
    /// at `now`.
    pub fn open(path: impl AsRef<Path>, events_retained: usize, now: u64) -> Result<Self> {
        let store = RegistryStore::open(path, events_retained)?;
        let snapshot = store.load()?;

        let mut records: HashMap<GroupKey, GroupRecord> = snapshot
            .groups
            .into_iter()
            .map(|r| (GroupKey::new(r.formation.clone(), r.group_id), r))
            .collect();
        let mut members: HashMap<GroupKey, BTreeMap<NodeId, Node>> = HashMap::new();
        let mut node_index = HashMap::new();
        for mut node in snapshot.nodes {
            node.last_report_at = now;
            let key = GroupKey::new(node.formation.clone(), node.group_id);
            node_index.insert(node.node_id, key.clone());
            members.entry(key).or_default().insert(node.node_id, node);
        }

        let mut groups = HashMap::new();
        for (key, nodes) in members {
            let group = match records.remove(&key) {
                Some(record) => Group::from_record(record, nodes),
                None => {
                    let mut group = Group::new(&key);
                    group.nodes = nodes;
                    group
                }
            };
            groups.insert(key, Arc::new(Mutex::new(group)));
        }
        // an emptied group still gates its next primary on the dropped one
        for (key, record) in records {
            if record.tombstone.is_some() {
                groups.insert(key, Arc::new(Mutex::new(Group::from_record(record, BTreeMap::new()))));
            }
        }

        let mut formations: BTreeMap<String, Formation> = snapshot
            .formations
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        if !formations.contains_key(DEFAULT_FORMATION) {
            let formation = Formation {
                name: DEFAULT_FORMATION.to_string(),
                created_at: now,
            };
            store.put_formation(&formation)?;
            formations.insert(formation.name.clone(), formation);
        }

        let mut log = EventLog::new(events_retained);
        for event in snapshot.events {
            log.push(event);
        }

        info!(
            nodes = node_index.len(),
            groups = groups.len(),
            formations = formations.len(),
            "Registry loaded"
        );
        METRICS.registered_nodes.set(node_index.len() as u64);

        Ok(Self {
            store,
            groups: RwLock::new(groups),
            node_index: RwLock::new(node_index),
            formations: RwLock::new(formations),
            sequencer: std::sync::Mutex::new(snapshot.counters),
            events: std::sync::Mutex::new(log),
        })
    }

    // === Groups ===

    pub async fn group(&self, key: &GroupKey) -> Option<GroupHandle> {
        self.groups.read().await.get(key).cloned()
    }

    pub async fn group_or_create(&self, key: &GroupKey) -> GroupHandle {
        if let Some(handle) = self.group(key).await {
            return handle;
        }
        let mut groups = self.groups.write().await;
        groups
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Group::new(key))))
            .clone()
    }

    /// Group a node belongs to.
    pub async fn group_of(&self, node_id: NodeId) -> Result<(GroupKey, GroupHandle)> {
        let key = self
            .node_index
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(Error::NodeNotFound(node_id))?;
        let handle = self.group(&key).await.ok_or(Error::NodeNotFound(node_id))?;
        Ok((key, handle))
    }

    /// Groups of a formation, ordered by group id.
    pub async fn groups_of(&self, formation: &str) -> Vec<(GroupKey, GroupHandle)> {
        let groups = self.groups.read().await;
        let mut found: Vec<_> = groups
            .iter()
            .filter(|(k, _)| k.formation == formation)
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub async fn all_groups(&self) -> Vec<(GroupKey, GroupHandle)> {
        let groups = self.groups.read().await;
        let mut found: Vec<_> = groups.iter().map(|(k, h)| (k.clone(), h.clone())).collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub async fn index_node(&self, node_id: NodeId, key: GroupKey) {
        let mut index = self.node_index.write().await;
        index.insert(node_id, key);
        METRICS.registered_nodes.set(index.len() as u64);
    }

    pub async fn unindex_node(&self, node_id: NodeId) {
        let mut index = self.node_index.write().await;
        index.remove(&node_id);
        METRICS.registered_nodes.set(index.len() as u64);
    }

    pub async fn node_count(&self) -> usize {
        self.node_index.read().await.len()
    }

    /// Run `f` on the locked group and persist the outcome. On any error the
    /// in-memory group is restored.
    pub async fn mutate<T, F>(&self, handle: &GroupHandle, now: u64, f: F) -> Result<T>
    where
        F: FnOnce(&mut Group, &mut Changes) -> Result<T>,
    {
        let mut group = handle.lock().await;
        let before = group.clone();
        let mut changes = Changes::default();

        let value = match f(&mut group, &mut changes) {
            Ok(value) => value,
            Err(e) => {
                *group = before;
                return Err(e);
            }
        };

        if *group == before && changes.notes.is_empty() && changes.removed.is_empty() {
            return Ok(value);
        }
        if let Err(e) = self.commit(&group, &changes, now) {
            *group = before;
            return Err(e);
        }
        Ok(value)
    }

    fn commit(&self, group: &Group, changes: &Changes, now: u64) -> Result<()> {
        let mut counters = self
            .sequencer
            .lock()
            .map_err(|_| Error::Internal("registry sequencer poisoned".into()))?;

        let mut next = *counters;
        let events = self.number(&mut next, &group.formation, group.group_id, &changes.notes, now);
        self.store
            .commit_group(group, &changes.removed, &events, next)?;
        *counters = next;
        self.publish(events);
        Ok(())
    }

    fn number(
        &self,
        counters: &mut Counters,
        formation: &str,
        group_id: u32,
        notes: &[Note],
        now: u64,
    ) -> Vec<Event> {
        notes
            .iter()
            .cloned()
            .map(|note| {
                let id = counters.next_event_id;
                counters.next_event_id += 1;
                note.into_event(id, formation, group_id, now)
            })
            .collect()
    }

    fn publish(&self, events: Vec<Event>) {
        if let Ok(mut log) = self.events.lock() {
            for event in events {
                log.push(event);
            }
        }
    }

    /// Reserve a node id. Persisted by the next commit.
    pub fn allocate_node_id(&self) -> Result<NodeId> {
        let mut counters = self
            .sequencer
            .lock()
            .map_err(|_| Error::Internal("registry sequencer poisoned".into()))?;
        let id = counters.next_node_id.max(1);
        counters.next_node_id = id + 1;
        Ok(id)
    }

    // === Formations ===

    pub async fn formation_exists(&self, name: &str) -> bool {
        self.formations.read().await.contains_key(name)
    }

    pub async fn list_formations(&self) -> Vec<Formation> {
        self.formations.read().await.values().cloned().collect()
    }

    pub async fn create_formation(&self, name: &str, now: u64) -> Result<Formation> {
        let mut formations = self.formations.write().await;
        if formations.contains_key(name) {
            return Err(Error::FormationExists(name.to_string()));
        }
        let formation = Formation {
            name: name.to_string(),
            created_at: now,
        };
        self.store.put_formation(&formation)?;
        formations.insert(name.to_string(), formation.clone());
        drop(formations);

        self.record(name, format!("formation {} created", name), now)?;
        Ok(formation)
    }

    pub async fn drop_formation(&self, name: &str, now: u64) -> Result<()> {
        if name == DEFAULT_FORMATION {
            return Err(Error::InvalidSetting(format!(
                "formation {} cannot be dropped",
                DEFAULT_FORMATION
            )));
        }
        let mut formations = self.formations.write().await;
        if !formations.contains_key(name) {
            return Err(Error::FormationNotFound(name.to_string()));
        }
        for (_, handle) in self.groups_of(name).await {
            if !handle.lock().await.nodes.is_empty() {
                return Err(Error::FormationNotEmpty(name.to_string()));
            }
        }
        self.store.delete_formation(name)?;
        formations.remove(name);
        drop(formations);

        self.groups.write().await.retain(|k, _| k.formation != name);
        self.record(name, format!("formation {} dropped", name), now)?;
        Ok(())
    }

    /// Formation-level event, outside any group.
    fn record(&self, formation: &str, description: String, now: u64) -> Result<()> {
        let mut counters = self
            .sequencer
            .lock()
            .map_err(|_| Error::Internal("registry sequencer poisoned".into()))?;
        let mut next = *counters;
        let events = self.number(&mut next, formation, 0, &[Note::group(description)], now);
        self.store.commit_events(&events, next)?;
        *counters = next;
        self.publish(events);
        Ok(())
    }

    // === Events ===

    /// Newest first.
    pub fn events(&self, formation: Option<&str>, count: usize) -> Vec<Event> {
        self.events
            .lock()
            .map(|log| log.recent(formation, count))
            .unwrap_or_default()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fsm::NodeState;
    use crate::monitor::model::fixtures::node;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_mutate_commits_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry");
        let key = GroupKey::new(DEFAULT_FORMATION, 0);
        {
            let registry = Registry::open(&path, 100, 0).unwrap();
            let id = registry.allocate_node_id().unwrap();
            assert_eq!(id, 1);

            let handle = registry.group_or_create(&key).await;
            registry
                .mutate(&handle, 10, |group, changes| {
                    let n = node(id, NodeState::Single, 50);
                    changes.note(Note::node(&n, "registered"));
                    group.nodes.insert(id, n);
                    Ok(())
                })
                .await
                .unwrap();
            registry.index_node(id, key.clone()).await;
        }

        let registry = Registry::open(&path, 100, 5_000).unwrap();
        let (found, handle) = registry.group_of(1).await.unwrap();
        assert_eq!(found, key);
        let group = handle.lock().await;
        // liveness restarts at load time
        assert_eq!(group.nodes[&1].last_report_at, 5_000);
        drop(group);

        assert_eq!(registry.allocate_node_id().unwrap(), 2);
        let events = registry.events(Some(DEFAULT_FORMATION), 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].description, "registered");
    }

    #[tokio::test]
    async fn test_failed_mutation_rolls_back() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry"), 100, 0).unwrap();
        let handle = registry
            .group_or_create(&GroupKey::new(DEFAULT_FORMATION, 0))
            .await;

        let result: Result<()> = registry
            .mutate(&handle, 0, |group, _| {
                group.nodes.insert(7, node(7, NodeState::Single, 50));
                Err(Error::InvalidSetting("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(handle.lock().await.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_formations() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry"), 100, 0).unwrap();

        assert!(registry.formation_exists(DEFAULT_FORMATION).await);
        registry.create_formation("billing", 1).await.unwrap();
        assert!(matches!(
            registry.create_formation("billing", 2).await,
            Err(Error::FormationExists(_))
        ));
        assert_eq!(registry.list_formations().await.len(), 2);

        let handle = registry.group_or_create(&GroupKey::new("billing", 0)).await;
        registry
            .mutate(&handle, 3, |group, _| {
                group.nodes.insert(1, node(1, NodeState::Single, 50));
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(
            registry.drop_formation("billing", 4).await,
            Err(Error::FormationNotEmpty(_))
        ));

        handle.lock().await.nodes.clear();
        registry.drop_formation("billing", 5).await.unwrap();
        assert!(!registry.formation_exists("billing").await);
        assert!(matches!(
            registry.drop_formation(DEFAULT_FORMATION, 6).await,
            Err(Error::InvalidSetting(_))
        ));
    }
}
