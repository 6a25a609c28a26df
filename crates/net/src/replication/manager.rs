//! Entity lifecycle and delta-update plumbing on top of the variable and
//! storage layers.

use std::collections::VecDeque;

use log::{debug, warn};

use crate::buffer::ReadBuffer;
use crate::error::CodecError;
use crate::message::ReplicationAction;

use super::storage::{NetworkEntityRecord, NetworkEntityStorage};
use super::variables::{NetworkVariablesHandler, VariableId};
use super::{NetworkEntityId, INVALID_ENTITY_ID};

/// Most `(slot, value)` pairs one Update payload can carry.
const MAX_PAIRS_PER_UPDATE: usize = u8::MAX as usize;

/// Everything the factory needs to construct one local entity.
pub struct EntitySpawnContext<'a> {
    pub network_id: NetworkEntityId,
    pub class_id: u32,
    pub controlled_by: u32,
    pub position: (f32, f32),
    /// Register the entity's replicated fields here during construction.
    pub variables: &'a mut NetworkVariablesHandler,
}

/// Bridge to the host application's entity world. The library never touches
/// game objects directly.
pub trait NetworkEntityFactory {
    /// Builds the local object and returns an opaque handle for it.
    fn create_entity(&mut self, ctx: EntitySpawnContext<'_>) -> u64;

    fn destroy_entity(&mut self, local_id: u64);
}

/// One replication event ready to be framed into a wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationCommand {
    pub action: ReplicationAction,
    pub entity_id: NetworkEntityId,
    pub controlled_by: u32,
    pub class_id: u32,
    pub data: Vec<u8>,
}

/// Server-side entity authority and client-side entity mirror.
///
/// One instance per role; the server drives [`create_network_entity`],
/// [`collect_world_changes`] and [`remove_network_entity`], the client feeds
/// received commands through [`handle_command`].
///
/// [`create_network_entity`]: Self::create_network_entity
/// [`collect_world_changes`]: Self::collect_world_changes
/// [`remove_network_entity`]: Self::remove_network_entity
/// [`handle_command`]: Self::handle_command
#[derive(Default)]
pub struct ReplicationManager {
    storage: NetworkEntityStorage,
    variables: NetworkVariablesHandler,
    next_entity_id: NetworkEntityId,
    outgoing: VecDeque<ReplicationCommand>,
}

impl ReplicationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variables(&self) -> &NetworkVariablesHandler {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut NetworkVariablesHandler {
        &mut self.variables
    }

    pub fn entity_count(&self) -> usize {
        self.storage.len()
    }

    pub fn contains_entity(&self, id: NetworkEntityId) -> bool {
        self.storage.contains(id)
    }

    pub fn local_id_of(&self, id: NetworkEntityId) -> Option<u64> {
        self.storage.get(id).map(|record| record.local_id)
    }

    fn advance_entity_id(&mut self) -> NetworkEntityId {
        self.next_entity_id = self.next_entity_id.wrapping_add(1);
        if self.next_entity_id == INVALID_ENTITY_ID {
            self.next_entity_id = 1;
        }
        self.next_entity_id
    }

    /// Spawns a server-authoritative entity and queues its Create command.
    pub fn create_network_entity(
        &mut self,
        class_id: u32,
        controlled_by: u32,
        x: f32,
        y: f32,
        factory: &mut dyn NetworkEntityFactory,
    ) -> NetworkEntityId {
        let network_id = self.advance_entity_id();
        let local_id = factory.create_entity(EntitySpawnContext {
            network_id,
            class_id,
            controlled_by,
            position: (x, y),
            variables: &mut self.variables,
        });
        self.storage.insert(NetworkEntityRecord {
            network_id,
            local_id,
            class_id,
            controlled_by,
            spawn_position: (x, y),
        });
        debug!("created network entity {network_id} (class {class_id}, local {local_id})");
        self.outgoing.push_back(ReplicationCommand {
            action: ReplicationAction::Create,
            entity_id: network_id,
            controlled_by,
            class_id,
            data: encode_create(x, y),
        });
        network_id
    }

    /// Destroys the entity locally and queues its Destroy command. Unknown
    /// ids are ignored.
    pub fn remove_network_entity(
        &mut self,
        network_id: NetworkEntityId,
        factory: &mut dyn NetworkEntityFactory,
    ) {
        let Some(record) = self.storage.remove(network_id) else {
            warn!("remove of unknown network entity {network_id}");
            return;
        };
        factory.destroy_entity(record.local_id);
        self.variables.unregister_entity(network_id);
        self.outgoing.push_back(ReplicationCommand {
            action: ReplicationAction::Destroy,
            entity_id: network_id,
            controlled_by: record.controlled_by,
            class_id: record.class_id,
            data: Vec::new(),
        });
    }

    /// Scans every entity for dirty variables and queues one Update command
    /// per entity that changed.
    pub fn collect_world_changes(&mut self) {
        for network_id in self.storage.ids() {
            let changes = self.variables.collect_changes(network_id);
            if changes.is_empty() {
                continue;
            }
            let Some(record) = self.storage.get(network_id) else {
                continue;
            };
            let (controlled_by, class_id) = (record.controlled_by, record.class_id);
            let pairs = self.slot_pairs(network_id, &changes);
            for chunk in pairs.chunks(MAX_PAIRS_PER_UPDATE) {
                self.outgoing.push_back(ReplicationCommand {
                    action: ReplicationAction::Update,
                    entity_id: network_id,
                    controlled_by,
                    class_id,
                    data: encode_update(chunk),
                });
            }
        }
    }

    /// Variable ids are local to one handler; on the wire a variable is named
    /// by its registration slot within its entity, which both endpoints derive
    /// the same way from the factory's registration order.
    fn slot_pairs(
        &self,
        entity_id: NetworkEntityId,
        changes: &[(VariableId, f32)],
    ) -> Vec<(u32, f32)> {
        let ids = self.variables.variables_of(entity_id);
        changes
            .iter()
            .filter_map(|(id, value)| {
                ids.iter()
                    .position(|candidate| candidate == id)
                    .map(|slot| (slot as u32, *value))
            })
            .collect()
    }

    /// Create + full-value Update for every live entity, for a peer joining
    /// after the world already exists. Replayed in ascending entity-id order
    /// so every join sees the same sequence.
    pub fn full_state_commands(&self) -> Vec<ReplicationCommand> {
        let mut ids = self.storage.ids();
        ids.sort_unstable();
        let mut commands = Vec::new();
        for network_id in ids {
            let Some(record) = self.storage.get(network_id) else {
                continue;
            };
            commands.push(ReplicationCommand {
                action: ReplicationAction::Create,
                entity_id: record.network_id,
                controlled_by: record.controlled_by,
                class_id: record.class_id,
                data: encode_create(record.spawn_position.0, record.spawn_position.1),
            });
            let snapshot: Vec<(u32, f32)> = self
                .variables
                .snapshot(network_id)
                .iter()
                .enumerate()
                .map(|(slot, (_, value))| (slot as u32, *value))
                .collect();
            for chunk in snapshot.chunks(MAX_PAIRS_PER_UPDATE) {
                commands.push(ReplicationCommand {
                    action: ReplicationAction::Update,
                    entity_id: record.network_id,
                    controlled_by: record.controlled_by,
                    class_id: record.class_id,
                    data: encode_update(chunk),
                });
            }
        }
        commands
    }

    pub fn take_outgoing(&mut self) -> Option<ReplicationCommand> {
        self.outgoing.pop_front()
    }

    /// Applies one received command to the local mirror.
    pub fn handle_command(
        &mut self,
        command: &ReplicationCommand,
        factory: &mut dyn NetworkEntityFactory,
    ) {
        self.apply_remote(
            command.action,
            command.entity_id,
            command.controlled_by,
            command.class_id,
            &command.data,
            factory,
        );
    }

    /// Same as [`handle_command`](Self::handle_command) but borrows the
    /// payload, so a pooled message never needs its data copied out.
    pub fn apply_remote(
        &mut self,
        action: ReplicationAction,
        entity_id: NetworkEntityId,
        controlled_by: u32,
        class_id: u32,
        data: &[u8],
        factory: &mut dyn NetworkEntityFactory,
    ) {
        match action {
            ReplicationAction::Create => {
                self.handle_create(entity_id, controlled_by, class_id, data, factory)
            }
            ReplicationAction::Update => {
                self.handle_update(entity_id, controlled_by, class_id, data, factory)
            }
            ReplicationAction::Destroy => self.handle_destroy(entity_id, factory),
        }
    }

    fn handle_create(
        &mut self,
        entity_id: NetworkEntityId,
        controlled_by: u32,
        class_id: u32,
        data: &[u8],
        factory: &mut dyn NetworkEntityFactory,
    ) {
        if self.storage.contains(entity_id) {
            debug!("duplicate create for network entity {entity_id}, ignoring");
            return;
        }
        let position = match decode_create(data) {
            Ok(position) => position,
            Err(e) => {
                warn!("malformed create payload for entity {entity_id}: {e}");
                return;
            }
        };
        self.spawn_mirror(entity_id, controlled_by, class_id, position, factory);
    }

    fn handle_update(
        &mut self,
        entity_id: NetworkEntityId,
        controlled_by: u32,
        class_id: u32,
        data: &[u8],
        factory: &mut dyn NetworkEntityFactory,
    ) {
        if !self.storage.contains(entity_id) {
            warn!("update for unknown network entity {entity_id}, creating it defensively");
            self.spawn_mirror(entity_id, controlled_by, class_id, (0.0, 0.0), factory);
        }
        let pairs = match decode_update(data) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("malformed update payload for entity {entity_id}: {e}");
                return;
            }
        };
        for (slot, value) in pairs {
            let resolved = self
                .variables
                .variables_of(entity_id)
                .get(slot as usize)
                .copied();
            match resolved {
                Some(id) => self.variables.apply_change(id, value),
                None => warn!("update slot {slot} out of range for entity {entity_id}"),
            }
        }
    }

    fn handle_destroy(&mut self, entity_id: NetworkEntityId, factory: &mut dyn NetworkEntityFactory) {
        let Some(record) = self.storage.remove(entity_id) else {
            warn!("destroy for unknown network entity {entity_id}, ignoring");
            return;
        };
        factory.destroy_entity(record.local_id);
        self.variables.unregister_entity(entity_id);
    }

    fn spawn_mirror(
        &mut self,
        network_id: NetworkEntityId,
        controlled_by: u32,
        class_id: u32,
        position: (f32, f32),
        factory: &mut dyn NetworkEntityFactory,
    ) {
        let local_id = factory.create_entity(EntitySpawnContext {
            network_id,
            class_id,
            controlled_by,
            position,
            variables: &mut self.variables,
        });
        self.storage.insert(NetworkEntityRecord {
            network_id,
            local_id,
            class_id,
            controlled_by,
            spawn_position: position,
        });
    }
}

fn encode_create(x: f32, y: f32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&x.to_le_bytes());
    data.extend_from_slice(&y.to_le_bytes());
    data
}

fn decode_create(data: &[u8]) -> Result<(f32, f32), CodecError> {
    let mut reader = ReadBuffer::new(data);
    Ok((reader.read_f32()?, reader.read_f32()?))
}

/// `pair_count:u8` then `(slot:u32, value:f32)` pairs.
fn encode_update(pairs: &[(u32, f32)]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + pairs.len() * 8);
    data.push(pairs.len() as u8);
    for (slot, value) in pairs {
        data.extend_from_slice(&slot.to_le_bytes());
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

fn decode_update(data: &[u8]) -> Result<Vec<(u32, f32)>, CodecError> {
    let mut reader = ReadBuffer::new(data);
    let count = reader.read_u8()? as usize;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        pairs.push((reader.read_u32()?, reader.read_f32()?));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in for the game world. Every spawned entity registers two
    /// variables so delta updates have something to mutate.
    #[derive(Default)]
    struct ToyFactory {
        next_local: u64,
        alive: Vec<u64>,
        spawn_positions: Vec<(f32, f32)>,
    }

    impl NetworkEntityFactory for ToyFactory {
        fn create_entity(&mut self, ctx: EntitySpawnContext<'_>) -> u64 {
            ctx.variables.register(ctx.network_id, ctx.position.0);
            ctx.variables.register(ctx.network_id, ctx.position.1);
            self.next_local += 1;
            self.alive.push(self.next_local);
            self.spawn_positions.push(ctx.position);
            self.next_local
        }

        fn destroy_entity(&mut self, local_id: u64) {
            self.alive.retain(|id| *id != local_id);
        }
    }

    #[test]
    fn create_allocates_non_zero_ids_and_queues_command() {
        let mut manager = ReplicationManager::new();
        let mut factory = ToyFactory::default();

        let id = manager.create_network_entity(3, 0, 1.0, 2.0, &mut factory);
        assert_ne!(id, INVALID_ENTITY_ID);
        assert_eq!(factory.alive.len(), 1);

        let command = manager.take_outgoing().unwrap();
        assert_eq!(command.action, ReplicationAction::Create);
        assert_eq!(command.entity_id, id);
        assert_eq!(command.class_id, 3);
        assert_eq!(decode_create(&command.data).unwrap(), (1.0, 2.0));
        assert!(manager.take_outgoing().is_none());
    }

    #[test]
    fn dirty_variables_become_one_update_per_entity() {
        let mut manager = ReplicationManager::new();
        let mut factory = ToyFactory::default();
        let a = manager.create_network_entity(1, 0, 0.0, 0.0, &mut factory);
        let _b = manager.create_network_entity(1, 0, 0.0, 0.0, &mut factory);
        while manager.take_outgoing().is_some() {}

        let a_var = manager.variables().variables_of(a)[0];
        manager.variables_mut().set(a_var, 42.0);
        manager.collect_world_changes();

        let command = manager.take_outgoing().unwrap();
        assert_eq!(command.action, ReplicationAction::Update);
        assert_eq!(command.entity_id, a);
        assert_eq!(decode_update(&command.data).unwrap(), vec![(0, 42.0)]);
        assert!(manager.take_outgoing().is_none());

        manager.collect_world_changes();
        assert!(manager.take_outgoing().is_none());
    }

    #[test]
    fn client_ignores_duplicate_create_and_still_applies_updates() {
        let mut server = ReplicationManager::new();
        let mut server_factory = ToyFactory::default();
        let id = server.create_network_entity(1, 0, 5.0, 6.0, &mut server_factory);
        let create = server.take_outgoing().unwrap();

        let mut client = ReplicationManager::new();
        let mut client_factory = ToyFactory::default();
        client.handle_command(&create, &mut client_factory);
        client.handle_command(&create, &mut client_factory);
        assert_eq!(client.entity_count(), 1);
        assert_eq!(client_factory.alive.len(), 1);

        let var = client.variables().variables_of(id)[0];
        let update = ReplicationCommand {
            action: ReplicationAction::Update,
            entity_id: id,
            controlled_by: 0,
            class_id: 1,
            data: encode_update(&[(0, 99.0)]),
        };
        client.handle_command(&update, &mut client_factory);
        assert_eq!(client.variables().get(var), Some(99.0));
    }

    #[test]
    fn unknown_update_creates_defensively_unknown_destroy_is_ignored() {
        let mut client = ReplicationManager::new();
        let mut factory = ToyFactory::default();

        let update = ReplicationCommand {
            action: ReplicationAction::Update,
            entity_id: 77,
            controlled_by: 0,
            class_id: 2,
            data: encode_update(&[]),
        };
        client.handle_command(&update, &mut factory);
        assert!(client.contains_entity(77));
        assert_eq!(factory.spawn_positions, vec![(0.0, 0.0)]);

        let destroy = ReplicationCommand {
            action: ReplicationAction::Destroy,
            entity_id: 1234,
            controlled_by: 0,
            class_id: 2,
            data: Vec::new(),
        };
        client.handle_command(&destroy, &mut factory);
        assert_eq!(client.entity_count(), 1);
    }

    #[test]
    fn destroy_unregisters_variables_and_local_object() {
        let mut manager = ReplicationManager::new();
        let mut factory = ToyFactory::default();
        let id = manager.create_network_entity(1, 0, 0.0, 0.0, &mut factory);
        let var = manager.variables().variables_of(id)[0];

        manager.remove_network_entity(id, &mut factory);
        assert!(factory.alive.is_empty());
        assert!(!manager.contains_entity(id));
        assert_eq!(manager.variables().get(var), None);

        let commands: Vec<ReplicationAction> = std::iter::from_fn(|| manager.take_outgoing())
            .map(|c| c.action)
            .collect();
        assert_eq!(
            commands,
            vec![ReplicationAction::Create, ReplicationAction::Destroy]
        );
    }

    #[test]
    fn full_state_replays_creates_and_current_values() {
        let mut manager = ReplicationManager::new();
        let mut factory = ToyFactory::default();
        let id = manager.create_network_entity(1, 0, 3.0, 4.0, &mut factory);
        let var = manager.variables().variables_of(id)[0];
        manager.variables_mut().set(var, 10.0);
        manager.collect_world_changes();
        while manager.take_outgoing().is_some() {}

        let commands = manager.full_state_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].action, ReplicationAction::Create);
        assert_eq!(decode_create(&commands[0].data).unwrap(), (3.0, 4.0));
        assert_eq!(commands[1].action, ReplicationAction::Update);
        let pairs = decode_update(&commands[1].data).unwrap();
        assert!(pairs.contains(&(0, 10.0)));
    }

    /// Server-side create/destroy churn before a join leaves the two
    /// handlers with different variable ids; deltas must still land on the
    /// right variables.
    #[test]
    fn late_joiner_after_entity_churn_still_receives_deltas() {
        let mut server = ReplicationManager::new();
        let mut server_factory = ToyFactory::default();
        let scrapped = server.create_network_entity(1, 0, 0.0, 0.0, &mut server_factory);
        server.remove_network_entity(scrapped, &mut server_factory);
        let a = server.create_network_entity(1, 0, 1.0, 2.0, &mut server_factory);
        let b = server.create_network_entity(1, 0, 3.0, 4.0, &mut server_factory);
        while server.take_outgoing().is_some() {}

        let mut client = ReplicationManager::new();
        let mut client_factory = ToyFactory::default();
        for command in server.full_state_commands() {
            client.handle_command(&command, &mut client_factory);
        }
        assert_eq!(client.entity_count(), 2);

        let b_second = server.variables().variables_of(b)[1];
        server.variables_mut().set(b_second, 42.0);
        server.collect_world_changes();
        while let Some(update) = server.take_outgoing() {
            client.handle_command(&update, &mut client_factory);
        }

        let b_vars = client.variables().variables_of(b).to_vec();
        assert_eq!(client.variables().get(b_vars[0]), Some(3.0));
        assert_eq!(client.variables().get(b_vars[1]), Some(42.0));
        let a_vars = client.variables().variables_of(a).to_vec();
        assert_eq!(client.variables().get(a_vars[0]), Some(1.0));
        assert_eq!(client.variables().get(a_vars[1]), Some(2.0));
    }
}
