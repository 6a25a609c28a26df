//! Server role: admission control, peer promotion, time sync, world authority.

use std::net::SocketAddr;

use log::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::PendingConnection;
use crate::error::NetError;
use crate::event::PeerEvent;
use crate::message::{
    DenyReason, DisconnectReason, Message, MessageBody, MessageFlags, MessageKind,
};
use crate::packet::NetworkPacket;
use crate::peer::{generate_salt, Peer};
use crate::remote_peer::RemotePeer;
use crate::replication::{
    NetworkEntityFactory, NetworkEntityId, ReplicationCommand, ReplicationManager,
};
use crate::transport::NetworkStats;

/// Listens on the well-known port and owns the authoritative world.
pub struct Server {
    peer: Peer,
    config: ServerConfig,
    running: bool,
    next_peer_id: u16,
    /// Milliseconds since `start`, accumulated from tick deltas.
    server_time_ms: f64,
    replication: ReplicationManager,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            peer: Peer::new(config.peer.clone()),
            config,
            running: false,
            next_peer_id: 0,
            server_time_ms: 0.0,
            replication: ReplicationManager::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn connected_count(&self) -> usize {
        self.peer.connected_count()
    }

    pub fn server_time_ms(&self) -> f64 {
        self.server_time_ms
    }

    pub fn stats(&self) -> NetworkStats {
        self.peer.stats()
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    pub fn replication_mut(&mut self) -> &mut ReplicationManager {
        &mut self.replication
    }

    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.peer.poll_event()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.peer.local_addr()
    }

    /// Binds the listen socket. The only hard startup failure.
    pub fn start(&mut self) -> Result<(), NetError> {
        self.peer.start(("0.0.0.0", self.config.port))?;
        self.running = true;
        info!("server listening on port {}", self.config.port);
        self.peer.push_event(PeerEvent::LocalConnected { client_index: 0 });
        Ok(())
    }

    /// Notifies every peer, drops them, and closes the socket.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        for (peer_id, reason) in self.peer.stop(DisconnectReason::Shutdown) {
            self.peer
                .push_event(PeerEvent::RemoteDisconnected { peer_id, reason });
        }
        self.running = false;
        self.peer.push_event(PeerEvent::LocalDisconnected {
            reason: DisconnectReason::Shutdown,
        });
        info!("server stopped");
    }

    /// Spawns a replicated entity; its Create goes out to every client.
    pub fn create_entity(
        &mut self,
        class_id: u32,
        controlled_by: u32,
        x: f32,
        y: f32,
        factory: &mut dyn NetworkEntityFactory,
    ) -> NetworkEntityId {
        self.replication
            .create_network_entity(class_id, controlled_by, x, y, factory)
    }

    pub fn remove_entity(&mut self, id: NetworkEntityId, factory: &mut dyn NetworkEntityFactory) {
        self.replication.remove_network_entity(id, factory);
    }

    /// One protocol step: admit and promote connections, service connected
    /// peers, replicate world changes, flush everything outbound.
    pub fn tick(&mut self, dt: f32) {
        if !self.running {
            return;
        }
        self.server_time_ms += f64::from(dt) * 1000.0;

        for (addr, packet) in self.peer.receive_datagrams() {
            match self.peer.peers.slot_by_addr(addr) {
                Some(slot) => self.peer.process_peer_packet(slot, packet),
                None => self.handle_unauthenticated(addr, packet),
            }
        }
        if self.peer.take_reset_hint() {
            trace!("socket reset observed; relying on inactivity timeout");
        }

        for mut pending in self.peer.pending.advance_timers(dt) {
            debug!("handshake with {} timed out", pending.addr);
            pending.channel.reset(&mut self.peer.pool);
        }

        self.peer.update_peers(dt);

        for slot in self.peer.peers.slots_occupied() {
            self.drain_peer(slot);
        }

        self.replication.collect_world_changes();
        while let Some(command) = self.replication.take_outgoing() {
            self.broadcast_replication(&command);
        }

        for (peer_id, reason) in self.peer.flush_disconnects() {
            self.peer
                .push_event(PeerEvent::RemoteDisconnected { peer_id, reason });
        }

        self.peer.flush_outbound();
    }

    fn handle_unauthenticated(&mut self, addr: SocketAddr, packet: NetworkPacket) {
        for message in packet.into_messages() {
            match message.body {
                MessageBody::ConnectionRequest { client_salt } => {
                    self.peer.release(message);
                    self.on_connection_request(addr, client_salt);
                }
                MessageBody::ConnectionChallengeResponse { prefix } => {
                    self.peer.release(message);
                    self.on_challenge_response(addr, prefix);
                }
                _ => {
                    trace!(
                        "ignoring {:?} from unauthenticated {addr}",
                        message.body.kind()
                    );
                    self.peer.release(message);
                }
            }
        }
    }

    fn on_connection_request(&mut self, addr: SocketAddr, client_salt: u64) {
        if let Some(slot) = self.peer.peers.slot_by_addr(addr) {
            // Our accept was lost; say it again.
            self.queue_accept(slot);
            return;
        }
        if self.peer.peers.is_full() && !self.peer.pending.contains_addr(addr) {
            debug!("denying {addr}: server full");
            self.peer.send_denied_now(addr, DenyReason::ServerFull);
            return;
        }

        if let Some(pending) = self.peer.pending.get_by_addr_mut(addr) {
            if pending.client_salt != client_salt {
                // Same address, new connection attempt. Restart the exchange.
                pending.client_salt = client_salt;
                pending.server_salt = generate_salt();
            }
        } else {
            let pending = PendingConnection::new(
                addr,
                client_salt,
                generate_salt(),
                self.peer.config.handshake_timeout_secs,
            );
            if self.peer.pending.insert(pending).is_none() {
                debug!("denying {addr}: no pending slot free");
                self.peer.send_denied_now(addr, DenyReason::ServerFull);
                return;
            }
        }
        self.queue_challenge(addr);
    }

    fn on_challenge_response(&mut self, addr: SocketAddr, prefix: u64) {
        if let Some(slot) = self.peer.peers.slot_by_addr(addr) {
            self.queue_accept(slot);
            return;
        }
        let Some(pending) = self.peer.pending.get_by_addr_mut(addr) else {
            trace!("challenge response from {addr} with no pending handshake");
            return;
        };
        if pending.prefix() != prefix {
            warn!("challenge response from {addr} with wrong prefix, ignoring");
            return;
        }
        if self.peer.peers.is_full() {
            debug!("denying {addr} at promotion: server full");
            if let Some(mut pending) = self.peer.pending.remove_by_addr(addr) {
                pending.channel.reset(&mut self.peer.pool);
            }
            self.peer.send_denied_now(addr, DenyReason::ServerFull);
            return;
        }

        if let Some(mut pending) = self.peer.pending.remove_by_addr(addr) {
            pending.channel.reset(&mut self.peer.pool);
        }
        let peer_id = self.advance_peer_id();
        let timeout = self.peer.config.inactivity_timeout_secs;
        let Some(slot) = self
            .peer
            .peers
            .insert(RemotePeer::new(addr, peer_id, prefix, timeout))
        else {
            return;
        };
        debug!("promoted {addr} to peer {peer_id}");
        self.queue_accept(slot);
        self.sync_world_to(slot);
        self.peer
            .push_event(PeerEvent::RemoteConnected { peer_id, addr });
    }

    fn advance_peer_id(&mut self) -> u16 {
        self.next_peer_id = self.next_peer_id.wrapping_add(1);
        if self.next_peer_id == 0 {
            self.next_peer_id = 1;
        }
        self.next_peer_id
    }

    fn drain_peer(&mut self, slot: usize) {
        while let Some(message) = self.peer.take_ready(slot) {
            self.dispatch_ready(slot, message);
        }
    }

    fn dispatch_ready(&mut self, slot: usize, mut message: Message) {
        match &mut message.body {
            MessageBody::TimeRequest { remote_time } => {
                let remote_time = *remote_time;
                self.peer.release(message);
                self.queue_time_response(slot, remote_time);
            }
            MessageBody::Inputs { data } => {
                let data = std::mem::take(data);
                self.peer.release(message);
                if let Some(peer_id) = self.peer.peers.get(slot).map(|p| p.id) {
                    self.peer
                        .push_event(PeerEvent::InputsReceived { peer_id, data });
                }
            }
            MessageBody::Disconnection { prefix, reason } => {
                let (prefix, reason) = (*prefix, *reason);
                self.peer.release(message);
                let matches = self
                    .peer
                    .peers
                    .get(slot)
                    .is_some_and(|p| p.data_prefix == prefix);
                if matches {
                    self.peer.queue_disconnect(slot, reason, false);
                } else {
                    trace!("disconnection with mismatched prefix, ignoring");
                }
            }
            _ => {
                trace!("ignoring {:?} from connected peer", message.body.kind());
                self.peer.release(message);
            }
        }
    }

    fn queue_challenge(&mut self, addr: SocketAddr) {
        let Some(pending) = self.peer.pending.get_by_addr_mut(addr) else {
            return;
        };
        let (client_salt, server_salt) = (pending.client_salt, pending.server_salt);
        let mut message = self.peer.pool.lend(MessageKind::ConnectionChallenge);
        if let MessageBody::ConnectionChallenge {
            client_salt: cs,
            server_salt: ss,
        } = &mut message.body
        {
            *cs = client_salt;
            *ss = server_salt;
        }
        match self.peer.pending.get_by_addr_mut(addr) {
            Some(pending) => pending.queue_outgoing(message),
            None => self.peer.release(message),
        }
    }

    fn queue_accept(&mut self, slot: usize) {
        let Some((prefix, id)) = self.peer.peers.get(slot).map(|p| (p.data_prefix, p.id)) else {
            return;
        };
        let mut message = self.peer.pool.lend(MessageKind::ConnectionAccepted);
        if let MessageBody::ConnectionAccepted {
            prefix: p,
            client_index,
        } = &mut message.body
        {
            *p = prefix;
            *client_index = id;
        }
        self.peer.queue_to_slot(slot, message);
    }

    fn queue_time_response(&mut self, slot: usize, remote_time: u32) {
        let mut message = self.peer.pool.lend(MessageKind::TimeResponse);
        if let MessageBody::TimeResponse {
            remote_time: rt,
            server_time,
        } = &mut message.body
        {
            *rt = remote_time;
            *server_time = self.server_time_ms as u32;
        }
        self.peer.queue_to_slot(slot, message);
    }

    fn queue_replication_to(&mut self, slot: usize, command: &ReplicationCommand) {
        let mut message = self.peer.pool.lend(MessageKind::Replication);
        message.flags = MessageFlags::RELIABLE | MessageFlags::ORDERED;
        if let MessageBody::Replication {
            action,
            entity_id,
            controlled_by,
            class_id,
            data,
        } = &mut message.body
        {
            *action = command.action;
            *entity_id = command.entity_id;
            *controlled_by = command.controlled_by;
            *class_id = command.class_id;
            data.clear();
            data.extend_from_slice(&command.data);
        }
        self.peer.queue_to_slot(slot, message);
    }

    fn broadcast_replication(&mut self, command: &ReplicationCommand) {
        for slot in self.peer.peers.slots_occupied() {
            self.queue_replication_to(slot, command);
        }
    }

    /// Replays the existing world to a peer that joined after entities were
    /// already live.
    fn sync_world_to(&mut self, slot: usize) {
        for command in self.replication.full_state_commands() {
            self.queue_replication_to(slot, &command);
        }
    }
}
