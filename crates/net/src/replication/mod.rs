//! Server-authoritative entity replication over the reliable-ordered channel.
//!
//! The server creates, updates, and destroys network entities; clients mirror
//! them through a [`NetworkEntityFactory`] the host application provides.

mod manager;
mod storage;
mod variables;

pub use manager::{
    EntitySpawnContext, NetworkEntityFactory, ReplicationCommand, ReplicationManager,
};
pub use storage::{NetworkEntityRecord, NetworkEntityStorage};
pub use variables::{NetworkVariablesHandler, VariableId, INVALID_VARIABLE_ID};

/// Network-wide entity identifier. Zero is the reserved invalid value.
pub type NetworkEntityId = u32;

pub const INVALID_ENTITY_ID: NetworkEntityId = 0;
