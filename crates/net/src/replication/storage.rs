//! Mapping from network entity ids to the host application's local objects.

use std::collections::HashMap;

use super::NetworkEntityId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkEntityRecord {
    pub network_id: NetworkEntityId,
    /// Opaque handle the factory returned for the local game object.
    pub local_id: u64,
    pub class_id: u32,
    pub controlled_by: u32,
    /// Position the entity was spawned with, replayed for late joiners.
    pub spawn_position: (f32, f32),
}

#[derive(Debug, Default)]
pub struct NetworkEntityStorage {
    records: HashMap<NetworkEntityId, NetworkEntityRecord>,
}

impl NetworkEntityStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: NetworkEntityRecord) {
        self.records.insert(record.network_id, record);
    }

    pub fn get(&self, network_id: NetworkEntityId) -> Option<&NetworkEntityRecord> {
        self.records.get(&network_id)
    }

    pub fn remove(&mut self, network_id: NetworkEntityId) -> Option<NetworkEntityRecord> {
        self.records.remove(&network_id)
    }

    pub fn contains(&self, network_id: NetworkEntityId) -> bool {
        self.records.contains_key(&network_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkEntityRecord> {
        self.records.values()
    }

    /// Ids of every stored entity. Collected so callers can mutate while
    /// walking the set.
    pub fn ids(&self) -> Vec<NetworkEntityId> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
