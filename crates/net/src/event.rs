//! Notifications surfaced to the host application, drained once per tick.

use std::net::SocketAddr;

use crate::message::DisconnectReason;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// This endpoint finished its own connection (client: handshake complete;
    /// server: socket bound and listening).
    LocalConnected { client_index: u16 },
    /// This endpoint lost or gave up its own connection.
    LocalDisconnected { reason: DisconnectReason },
    /// A counterpart completed the handshake.
    RemoteConnected { peer_id: u16, addr: SocketAddr },
    /// A counterpart was dropped (explicit, timeout, or shutdown).
    RemoteDisconnected {
        peer_id: u16,
        reason: DisconnectReason,
    },
    /// An Inputs blob arrived from a connected peer.
    InputsReceived { peer_id: u16, data: Vec<u8> },
}
