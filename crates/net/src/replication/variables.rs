//! Registry of replicated scalar fields and their dirty tracking.

use std::collections::HashMap;

use log::warn;

use super::NetworkEntityId;

/// Identifier a replicated variable gets on registration. Unique within one
/// handler, never the sentinel.
pub type VariableId = u32;

pub const INVALID_VARIABLE_ID: VariableId = 0;

#[derive(Debug)]
struct VariableEntry {
    entity_id: NetworkEntityId,
    value: f32,
    dirty: bool,
}

/// Tracks every replicated f32 by id, grouped by owning entity.
///
/// The server marks values dirty through [`set`](Self::set) and drains them
/// with [`collect_changes`](Self::collect_changes); the client writes received
/// deltas back through [`apply_change`](Self::apply_change).
#[derive(Debug, Default)]
pub struct NetworkVariablesHandler {
    next_id: VariableId,
    variables: HashMap<VariableId, VariableEntry>,
    by_entity: HashMap<NetworkEntityId, Vec<VariableId>>,
}

impl NetworkVariablesHandler {
    pub fn new() -> Self {
        Self {
            next_id: INVALID_VARIABLE_ID,
            variables: HashMap::new(),
            by_entity: HashMap::new(),
        }
    }

    fn advance_id(&mut self) -> VariableId {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == INVALID_VARIABLE_ID {
            self.next_id = 1;
        }
        self.next_id
    }

    /// Registers a new variable owned by `entity_id`, returning its id.
    pub fn register(&mut self, entity_id: NetworkEntityId, initial: f32) -> VariableId {
        let id = self.advance_id();
        self.variables.insert(
            id,
            VariableEntry {
                entity_id,
                value: initial,
                dirty: false,
            },
        );
        self.by_entity.entry(entity_id).or_default().push(id);
        id
    }

    pub fn get(&self, id: VariableId) -> Option<f32> {
        self.variables.get(&id).map(|entry| entry.value)
    }

    /// Authoritative write. Marks the variable dirty when the value changes.
    pub fn set(&mut self, id: VariableId, value: f32) {
        match self.variables.get_mut(&id) {
            Some(entry) => {
                if entry.value != value {
                    entry.value = value;
                    entry.dirty = true;
                }
            }
            None => warn!("set on unregistered variable {id}"),
        }
    }

    /// Replica write from a received delta. Never marks dirty.
    pub fn apply_change(&mut self, id: VariableId, value: f32) {
        match self.variables.get_mut(&id) {
            Some(entry) => entry.value = value,
            None => warn!("received delta for unregistered variable {id}"),
        }
    }

    /// Ids registered for one entity, in registration order.
    pub fn variables_of(&self, entity_id: NetworkEntityId) -> &[VariableId] {
        self.by_entity
            .get(&entity_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drains this entity's dirty variables as `(id, value)` pairs.
    pub fn collect_changes(&mut self, entity_id: NetworkEntityId) -> Vec<(VariableId, f32)> {
        let mut changes = Vec::new();
        let Some(ids) = self.by_entity.get(&entity_id) else {
            return changes;
        };
        for id in ids {
            if let Some(entry) = self.variables.get_mut(id) {
                if entry.dirty {
                    entry.dirty = false;
                    changes.push((*id, entry.value));
                }
            }
        }
        changes
    }

    /// Current values of every variable the entity owns, dirty or not.
    pub fn snapshot(&self, entity_id: NetworkEntityId) -> Vec<(VariableId, f32)> {
        self.variables_of(entity_id)
            .iter()
            .filter_map(|id| self.get(*id).map(|value| (*id, value)))
            .collect()
    }

    /// Drops every variable the entity owns.
    pub fn unregister_entity(&mut self, entity_id: NetworkEntityId) {
        if let Some(ids) = self.by_entity.remove(&entity_id) {
            for id in ids {
                self.variables.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
