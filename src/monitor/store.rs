//! Registry store using RocksDB
//!
//! Stores:
//! - Nodes (node_id → node record)
//! - Groups (formation/group_id → quorum, health, election, tombstone)
//! - Formations
//! - Event history (event_id → event), trimmed to a retained count
//! - Id counters
//!
//! A group mutation is written as one `WriteBatch`: every node of the group,
//! the group record, the new events and the counters land together or not at all.

use super::events::Event;
use super::model::{Formation, Group, GroupKey, GroupRecord, Node};
use crate::common::error::{Error, Result};
use crate::common::protocol::NodeId;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

const CF_NODES: &str = "nodes";
const CF_GROUPS: &str = "groups";
const CF_FORMATIONS: &str = "formations";
const CF_EVENTS: &str = "events";
const CF_META: &str = "meta";

const META_NEXT_NODE_ID: &str = "next_node_id";
const META_NEXT_EVENT_ID: &str = "next_event_id";

/// Id counters persisted with each commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub next_node_id: u64,
    pub next_event_id: u64,
}

/// Everything read back at startup.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub groups: Vec<GroupRecord>,
    pub formations: Vec<Formation>,
    /// Oldest first
    pub events: Vec<Event>,
    pub counters: Counters,
}

pub struct RegistryStore {
    db: DB,
    events_retained: u64,
}

impl RegistryStore {
    /// Open or create the registry
    pub fn open(path: impl AsRef<Path>, events_retained: usize) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_NODES, CF_GROUPS, CF_FORMATIONS, CF_EVENTS, CF_META],
        )?;

        Ok(Self {
            db,
            events_retained: events_retained.max(1) as u64,
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::RegistryCorrupted(format!("missing column family {}", name)))
    }

    /// Read the whole registry.
    pub fn load(&self) -> Result<Snapshot> {
        let nodes = self.scan::<Node>(CF_NODES)?;
        let groups = self.scan::<GroupRecord>(CF_GROUPS)?;
        let formations = self.scan::<Formation>(CF_FORMATIONS)?;
        let events = self.scan::<Event>(CF_EVENTS)?;
        let counters = Counters {
            next_node_id: self.get_counter(META_NEXT_NODE_ID)?.unwrap_or(1),
            next_event_id: self.get_counter(META_NEXT_EVENT_ID)?.unwrap_or(1),
        };

        Ok(Snapshot {
            nodes,
            groups,
            formations,
            events,
            counters,
        })
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut items = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            items.push(decode(&value)?);
        }
        Ok(items)
    }

    fn get_counter(&self, key: &str) -> Result<Option<u64>> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::RegistryCorrupted(format!("counter {} has {} bytes", key, bytes.len()))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Atomically write a group, drop the removed nodes and append events.
    pub fn commit_group(
        &self,
        group: &Group,
        removed: &[NodeId],
        events: &[Event],
        counters: Counters,
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        let nodes_cf = self.cf(CF_NODES)?;
        let groups_cf = self.cf(CF_GROUPS)?;

        for node in group.nodes.values() {
            batch.put_cf(nodes_cf, node.node_id.to_be_bytes(), encode(node)?);
        }
        for node_id in removed {
            batch.delete_cf(nodes_cf, node_id.to_be_bytes());
        }

        let key = group.key().encode();
        if group.nodes.is_empty() && group.tombstone.is_none() {
            batch.delete_cf(groups_cf, key.as_bytes());
        } else {
            batch.put_cf(groups_cf, key.as_bytes(), encode(&group.record())?);
        }

        self.append_events(&mut batch, events)?;
        self.put_counters(&mut batch, counters)?;

        self.db.write(batch)?;
        Ok(())
    }

    /// Events not tied to a group mutation (formation changes).
    pub fn commit_events(&self, events: &[Event], counters: Counters) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.append_events(&mut batch, events)?;
        self.put_counters(&mut batch, counters)?;
        self.db.write(batch)?;
        Ok(())
    }

    fn append_events(&self, batch: &mut WriteBatch, events: &[Event]) -> Result<()> {
        let cf = self.cf(CF_EVENTS)?;
        for event in events {
            batch.put_cf(cf, event.event_id.to_be_bytes(), encode(event)?);
        }
        if let Some(last) = events.last() {
            let keep_from = (last.event_id + 1).saturating_sub(self.events_retained);
            if keep_from > 0 {
                batch.delete_range_cf(cf, 0u64.to_be_bytes(), keep_from.to_be_bytes());
            }
        }
        Ok(())
    }

    fn put_counters(&self, batch: &mut WriteBatch, counters: Counters) -> Result<()> {
        let cf = self.cf(CF_META)?;
        batch.put_cf(cf, META_NEXT_NODE_ID.as_bytes(), counters.next_node_id.to_be_bytes());
        batch.put_cf(cf, META_NEXT_EVENT_ID.as_bytes(), counters.next_event_id.to_be_bytes());
        Ok(())
    }

    // === Formation operations ===

    pub fn put_formation(&self, formation: &Formation) -> Result<()> {
        let cf = self.cf(CF_FORMATIONS)?;
        self.db
            .put_cf(cf, formation.name.as_bytes(), encode(formation)?)?;
        Ok(())
    }

    pub fn delete_formation(&self, name: &str) -> Result<()> {
        let cf = self.cf(CF_FORMATIONS)?;
        self.db.delete_cf(cf, name.as_bytes())?;
        Ok(())
    }

    /// Group record by key
    pub fn get_group(&self, key: &GroupKey) -> Result<Option<GroupRecord>> {
        let cf = self.cf(CF_GROUPS)?;
        match self.db.get_cf(cf, key.encode().as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::RegistryCorrupted(e.to_string()))
}
