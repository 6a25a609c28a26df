pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod message;
pub mod packet;
pub mod peer;
pub mod pool;
pub mod remote_peer;
pub mod replication;
pub mod server;
pub mod transport;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use channel::{Channel, ChannelKind, sequence_newer_than};
pub use client::{Client, ClientState};
pub use config::{ClientConfig, DEFAULT_SERVER_PORT, PeerConfig, ServerConfig};
pub use error::{CodecError, NetError};
pub use event::PeerEvent;
pub use message::{
    DenyReason, DisconnectReason, Message, MessageBody, MessageFlags, MessageKind,
    ReplicationAction,
};
pub use packet::{MAX_PACKET_SIZE, NetworkPacket};
pub use peer::Peer;
pub use pool::MessagePool;
pub use replication::{
    EntitySpawnContext, NetworkEntityFactory, NetworkEntityId, NetworkEntityStorage,
    NetworkVariablesHandler, ReplicationCommand, ReplicationManager, VariableId,
};
pub use server::Server;
pub use transport::NetworkStats;
