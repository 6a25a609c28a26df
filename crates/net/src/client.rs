//! Client role: handshake initiation, time sync, inputs, entity mirroring.

use std::net::{SocketAddr, ToSocketAddrs};

use log::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::connection::PendingConnection;
use crate::error::NetError;
use crate::event::PeerEvent;
use crate::message::{
    DenyReason, DisconnectReason, Message, MessageBody, MessageFlags, MessageKind,
};
use crate::packet::NetworkPacket;
use crate::peer::{generate_salt, Peer};
use crate::remote_peer::RemotePeer;
use crate::replication::{NetworkEntityFactory, ReplicationManager};
use crate::transport::NetworkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    SendingConnectionRequest,
    SendingChallengeResponse,
    Connected,
}

/// Connects to one server and mirrors its replicated world.
///
/// Drive it with [`tick`](Self::tick) at a fixed rate and drain notifications
/// through [`poll_event`](Self::poll_event).
pub struct Client {
    peer: Peer,
    config: ClientConfig,
    state: ClientState,
    server_addr: Option<SocketAddr>,
    server_slot: Option<usize>,
    client_salt: u64,
    data_prefix: u64,
    client_index: u16,
    resend_left: f32,
    time_sync_left: f32,
    /// Milliseconds since `connect`, accumulated from tick deltas.
    local_time_ms: f64,
    server_clock_offset_ms: f64,
    replication: ReplicationManager,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            peer: Peer::new(config.peer.clone()),
            config,
            state: ClientState::Disconnected,
            server_addr: None,
            server_slot: None,
            client_salt: 0,
            data_prefix: 0,
            client_index: 0,
            resend_left: 0.0,
            time_sync_left: 0.0,
            local_time_ms: 0.0,
            server_clock_offset_ms: 0.0,
            replication: ReplicationManager::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Index the server assigned on acceptance. Meaningless before that.
    pub fn client_index(&self) -> u16 {
        self.client_index
    }

    /// Estimated server clock, in milliseconds, from the last time sync.
    pub fn server_time_ms(&self) -> f64 {
        self.local_time_ms + self.server_clock_offset_ms
    }

    pub fn stats(&self) -> NetworkStats {
        self.peer.stats()
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.peer.poll_event()
    }

    /// Binds an ephemeral local port and starts the handshake.
    pub fn connect<A: ToSocketAddrs>(&mut self, server_addr: A) -> Result<(), NetError> {
        let server_addr = server_addr
            .to_socket_addrs()
            .map_err(NetError::Io)?
            .next()
            .ok_or_else(|| {
                NetError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "server address did not resolve",
                ))
            })?;
        self.peer.start("0.0.0.0:0")?;
        self.client_salt = generate_salt();
        self.data_prefix = 0;
        self.server_addr = Some(server_addr);
        self.peer.pending.insert(PendingConnection::new(
            server_addr,
            self.client_salt,
            0,
            self.peer.config.handshake_timeout_secs,
        ));
        self.state = ClientState::SendingConnectionRequest;
        self.resend_left = 0.0;
        debug!("connecting to {server_addr} with salt {:#x}", self.client_salt);
        Ok(())
    }

    /// Sends Disconnection to the server and tears local state down.
    pub fn disconnect(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        if let Some(slot) = self.server_slot {
            self.peer.queue_disconnect(slot, DisconnectReason::Shutdown, true);
            self.peer.flush_disconnects();
        }
        self.teardown(DisconnectReason::Shutdown);
    }

    /// Queues an Inputs blob for the server on the channel `flags` select.
    pub fn send_inputs(&mut self, data: &[u8], flags: MessageFlags) -> Result<(), NetError> {
        if !self.peer.is_running() {
            return Err(NetError::NotRunning);
        }
        let slot = self.server_slot.ok_or(NetError::NotConnected)?;
        let mut message = self.peer.pool.lend(MessageKind::Inputs);
        message.flags = flags;
        if let MessageBody::Inputs { data: payload } = &mut message.body {
            payload.clear();
            payload.extend_from_slice(data);
        }
        self.peer.queue_to_slot(slot, message);
        Ok(())
    }

    /// One protocol step: receive, advance timers, resend handshake or sync
    /// time, flush outbound traffic.
    pub fn tick(&mut self, dt: f32, factory: &mut dyn NetworkEntityFactory) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.local_time_ms += f64::from(dt) * 1000.0;

        for (addr, packet) in self.peer.receive_datagrams() {
            if Some(addr) != self.server_addr {
                trace!("dropping datagram from unexpected address {addr}");
                self.release_packet(packet);
                continue;
            }
            match self.server_slot {
                Some(slot) => self.peer.process_peer_packet(slot, packet),
                None => self.handle_handshake_packet(packet),
            }
        }
        if self.state == ClientState::Disconnected {
            return;
        }

        if self.peer.take_reset_hint() {
            if let Some(slot) = self.server_slot {
                debug!("socket reset from server, disconnecting");
                self.peer.queue_disconnect(slot, DisconnectReason::Unknown, false);
            }
        }

        let expired = self.peer.pending.advance_timers(dt);
        if !expired.is_empty() && self.server_slot.is_none() {
            for mut pending in expired {
                pending.channel.reset(&mut self.peer.pool);
            }
            debug!("handshake timed out");
            self.teardown(DisconnectReason::Timeout);
            return;
        }

        self.peer.update_peers(dt);

        match self.state {
            ClientState::SendingConnectionRequest | ClientState::SendingChallengeResponse => {
                self.resend_left -= dt;
                if self.resend_left <= 0.0 {
                    self.queue_handshake_message();
                    self.resend_left = self.peer.config.handshake_resend_secs;
                }
            }
            ClientState::Connected => {
                self.drain_ready(factory);
                self.time_sync_left -= dt;
                if self.time_sync_left <= 0.0 {
                    self.queue_time_request();
                    self.time_sync_left = self.config.time_sync_interval_secs;
                }
            }
            ClientState::Disconnected => return,
        }

        let dropped = self.peer.flush_disconnects();
        if let Some((_, reason)) = dropped.into_iter().next() {
            self.teardown(reason);
            return;
        }

        self.peer.flush_outbound();
    }

    fn handle_handshake_packet(&mut self, packet: NetworkPacket) {
        for message in packet.into_messages() {
            match message.body {
                MessageBody::ConnectionChallenge {
                    client_salt,
                    server_salt,
                } => {
                    self.peer.release(message);
                    self.on_challenge(client_salt, server_salt);
                }
                MessageBody::ConnectionAccepted {
                    prefix,
                    client_index,
                } => {
                    self.peer.release(message);
                    self.on_accepted(prefix, client_index);
                }
                MessageBody::ConnectionDenied { reason } => {
                    self.peer.release(message);
                    self.on_denied(reason);
                    return;
                }
                _ => {
                    trace!("ignoring {:?} during handshake", message.body.kind());
                    self.peer.release(message);
                }
            }
        }
    }

    fn on_challenge(&mut self, client_salt: u64, server_salt: u64) {
        if self.state != ClientState::SendingConnectionRequest {
            return;
        }
        if client_salt != self.client_salt {
            warn!("challenge with foreign client salt, ignoring");
            return;
        }
        self.data_prefix = self.client_salt ^ server_salt;
        self.state = ClientState::SendingChallengeResponse;
        self.resend_left = 0.0;
        debug!("challenge accepted, prefix {:#x}", self.data_prefix);
    }

    fn on_accepted(&mut self, prefix: u64, client_index: u16) {
        if self.state != ClientState::SendingChallengeResponse {
            return;
        }
        if prefix != self.data_prefix {
            warn!("accept with mismatched prefix, ignoring");
            return;
        }
        let Some(addr) = self.server_addr else {
            return;
        };
        if let Some(mut pending) = self.peer.pending.remove_by_addr(addr) {
            pending.channel.reset(&mut self.peer.pool);
        }
        let timeout = self.peer.config.inactivity_timeout_secs;
        self.server_slot = self
            .peer
            .peers
            .insert(RemotePeer::new(addr, client_index, self.data_prefix, timeout));
        self.client_index = client_index;
        self.state = ClientState::Connected;
        self.time_sync_left = 0.0;
        debug!("connected as client {client_index}");
        self.peer.push_event(PeerEvent::LocalConnected { client_index });
    }

    fn on_denied(&mut self, reason: DenyReason) {
        debug!("connection denied: {reason:?}");
        let reason = match reason {
            DenyReason::ServerFull => DisconnectReason::ServerFull,
            DenyReason::Unknown => DisconnectReason::Unknown,
        };
        self.teardown(reason);
    }

    fn drain_ready(&mut self, factory: &mut dyn NetworkEntityFactory) {
        let Some(slot) = self.server_slot else {
            return;
        };
        while let Some(message) = self.peer.take_ready(slot) {
            let disconnect = self.dispatch_ready(message, factory);
            if let Some(reason) = disconnect {
                self.peer.queue_disconnect(slot, reason, false);
                return;
            }
        }
    }

    /// Returns a reason when the message asks us to drop the connection.
    fn dispatch_ready(
        &mut self,
        message: Message,
        factory: &mut dyn NetworkEntityFactory,
    ) -> Option<DisconnectReason> {
        match &message.body {
            MessageBody::Disconnection { prefix, reason } => {
                let (prefix, reason) = (*prefix, *reason);
                self.peer.release(message);
                if prefix != self.data_prefix {
                    trace!("disconnection with mismatched prefix, ignoring");
                    return None;
                }
                debug!("server closed the connection: {}", reason.as_str());
                Some(reason)
            }
            MessageBody::TimeResponse {
                remote_time,
                server_time,
            } => {
                let (remote_time, server_time) = (*remote_time, *server_time);
                self.peer.release(message);
                self.on_time_response(remote_time, server_time);
                None
            }
            MessageBody::Replication {
                action,
                entity_id,
                controlled_by,
                class_id,
                data,
            } => {
                self.replication.apply_remote(
                    *action,
                    *entity_id,
                    *controlled_by,
                    *class_id,
                    data,
                    factory,
                );
                self.peer.release(message);
                None
            }
            _ => {
                trace!("ignoring {:?} while connected", message.body.kind());
                self.peer.release(message);
                None
            }
        }
    }

    fn on_time_response(&mut self, remote_time: u32, server_time: u32) {
        let now = self.local_time_ms;
        let sent_at = f64::from(remote_time);
        if sent_at > now {
            return;
        }
        let rtt = now - sent_at;
        self.server_clock_offset_ms = f64::from(server_time) + rtt / 2.0 - now;
        trace!(
            "time sync: rtt {rtt:.1} ms, offset {:.1} ms",
            self.server_clock_offset_ms
        );
    }

    fn queue_handshake_message(&mut self) {
        let Some(addr) = self.server_addr else {
            return;
        };
        let kind = match self.state {
            ClientState::SendingConnectionRequest => MessageKind::ConnectionRequest,
            ClientState::SendingChallengeResponse => MessageKind::ConnectionChallengeResponse,
            _ => return,
        };
        let mut message = self.peer.pool.lend(kind);
        match &mut message.body {
            MessageBody::ConnectionRequest { client_salt } => *client_salt = self.client_salt,
            MessageBody::ConnectionChallengeResponse { prefix } => *prefix = self.data_prefix,
            _ => {}
        }
        match self.peer.pending.get_by_addr_mut(addr) {
            Some(pending) => pending.queue_outgoing(message),
            None => self.peer.release(message),
        }
    }

    fn queue_time_request(&mut self) {
        let Some(slot) = self.server_slot else {
            return;
        };
        let mut message = self.peer.pool.lend(MessageKind::TimeRequest);
        if let MessageBody::TimeRequest { remote_time } = &mut message.body {
            *remote_time = self.local_time_ms as u32;
        }
        self.peer.queue_to_slot(slot, message);
    }

    fn release_packet(&mut self, packet: NetworkPacket) {
        for message in packet.into_messages() {
            self.peer.release(message);
        }
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        self.peer.stop(reason);
        self.state = ClientState::Disconnected;
        self.server_addr = None;
        self.server_slot = None;
        self.data_prefix = 0;
        self.peer.push_event(PeerEvent::LocalDisconnected { reason });
    }
}
