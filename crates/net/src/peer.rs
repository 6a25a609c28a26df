//! Shared mechanics under both roles: socket draining, packet routing,
//! timers, the deferred-disconnect queue, and the per-channel flush.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};

use log::{debug, trace};

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::channel::{Channel, ChannelKind};
use crate::config::PeerConfig;
use crate::connection::PendingConnectionSlots;
use crate::error::NetError;
use crate::event::PeerEvent;
use crate::message::{DenyReason, DisconnectReason, Message, MessageBody, MessageKind};
use crate::packet::{NetworkPacket, MAX_PACKET_SIZE};
use crate::pool::MessagePool;
use crate::remote_peer::RemotePeerSlots;
use crate::transport::{NetworkStats, RecvOutcome, Transport};

/// Largest payload a UDP datagram can carry; anything bigger never decodes.
const RECV_BUFFER_SIZE: usize = 1 << 16;

pub(crate) fn generate_salt() -> u64 {
    rand::random()
}

#[derive(Debug)]
struct DisconnectRequest {
    slot: usize,
    reason: DisconnectReason,
    notify_remote: bool,
}

/// The protocol substrate a [`crate::Client`] or [`crate::Server`] drives.
///
/// All state is owned here and only ever touched from within a single tick;
/// there are no background threads and no locks.
pub struct Peer {
    transport: Option<Transport>,
    recv_buffer: Box<[u8]>,
    pub(crate) pool: MessagePool,
    pub(crate) pending: PendingConnectionSlots,
    pub(crate) peers: RemotePeerSlots,
    events: VecDeque<PeerEvent>,
    deferred_disconnects: Vec<DisconnectRequest>,
    pub(crate) config: PeerConfig,
    reset_hint: bool,
}

impl Peer {
    pub(crate) fn new(config: PeerConfig) -> Self {
        Self {
            transport: None,
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            pool: MessagePool::with_capacity(config.pool_messages_per_kind),
            pending: PendingConnectionSlots::new(config.max_connections),
            peers: RemotePeerSlots::new(config.max_connections),
            events: VecDeque::new(),
            deferred_disconnects: Vec::new(),
            config,
            reset_hint: false,
        }
    }

    pub(crate) fn start<A: ToSocketAddrs>(&mut self, bind_addr: A) -> Result<(), NetError> {
        let transport = Transport::bind(bind_addr)?;
        debug!("peer bound to {}", transport.local_addr());
        self.transport = Some(transport);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(Transport::local_addr)
    }

    pub fn stats(&self) -> NetworkStats {
        self.transport
            .as_ref()
            .map(Transport::stats)
            .unwrap_or_default()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.count()
    }

    pub(crate) fn push_event(&mut self, event: PeerEvent) {
        self.events.push_back(event);
    }

    /// Pops the next pending notification, oldest first.
    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    /// Drains every datagram the socket has this tick, decoding each into a
    /// packet of pool-lent messages. Malformed datagrams are dropped.
    pub(crate) fn receive_datagrams(&mut self) -> Vec<(SocketAddr, NetworkPacket)> {
        let mut received = Vec::new();
        let Some(transport) = self.transport.as_mut() else {
            return received;
        };
        loop {
            match transport.recv_into(&mut self.recv_buffer) {
                RecvOutcome::Datagram { len, addr } => {
                    let mut reader = ReadBuffer::new(&self.recv_buffer[..len]);
                    match NetworkPacket::read_pooled(&mut reader, &mut self.pool) {
                        Ok(packet) => received.push((addr, packet)),
                        Err(e) => trace!("dropping malformed datagram from {addr}: {e}"),
                    }
                }
                RecvOutcome::Empty => break,
                RecvOutcome::Reset => self.reset_hint = true,
            }
        }
        received
    }

    /// True once when the OS signalled a remote reset since the last call.
    pub(crate) fn take_reset_hint(&mut self) -> bool {
        std::mem::take(&mut self.reset_hint)
    }

    /// Feeds a packet from a connected peer through ack processing and
    /// channel routing, restarting its inactivity countdown.
    pub(crate) fn process_peer_packet(&mut self, slot: usize, packet: NetworkPacket) {
        let pool = &mut self.pool;
        let Some(peer) = self.peers.get_mut(slot) else {
            for message in packet.into_messages() {
                pool.release(message);
            }
            return;
        };
        peer.touch(self.config.inactivity_timeout_secs);
        peer.channel_mut(ChannelKind::ReliableOrdered).process_acks(
            packet.last_acked,
            packet.ack_bits,
            pool,
        );
        for message in packet.into_messages() {
            peer.route_received(message, pool);
        }
    }

    /// Next message ready for the application from any of a peer's channels.
    pub(crate) fn take_ready(&mut self, slot: usize) -> Option<Message> {
        let peer = self.peers.get_mut(slot)?;
        peer.channels_mut().find_map(Channel::next_ready)
    }

    pub(crate) fn queue_to_slot(&mut self, slot: usize, message: Message) {
        match self.peers.get_mut(slot) {
            Some(peer) => peer.queue_outgoing(message),
            None => self.pool.release(message),
        }
    }

    pub(crate) fn release(&mut self, message: Message) {
        self.pool.release(message);
    }

    /// Advances inactivity and channel timers, queuing a disconnect for any
    /// peer that went silent. Publishes the worst smoothed RTT to the stats.
    pub(crate) fn update_peers(&mut self, dt: f32) {
        let mut worst_rtt = 0.0f32;
        let mut inactive = Vec::new();
        for slot in self.peers.slots_occupied() {
            if let Some(peer) = self.peers.get_mut(slot) {
                peer.update_channels(dt);
                worst_rtt = worst_rtt.max(peer.smoothed_rtt_ms());
                if peer.is_inactive() {
                    inactive.push(slot);
                }
            }
        }
        for slot in inactive {
            self.queue_disconnect(slot, DisconnectReason::Timeout, true);
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.set_rtt_ms(worst_rtt);
        }
    }

    /// Defers removal to the end of the tick so the active peer set is never
    /// mutated while it is being iterated.
    pub(crate) fn queue_disconnect(
        &mut self,
        slot: usize,
        reason: DisconnectReason,
        notify_remote: bool,
    ) {
        if self.deferred_disconnects.iter().any(|r| r.slot == slot) {
            return;
        }
        self.deferred_disconnects.push(DisconnectRequest {
            slot,
            reason,
            notify_remote,
        });
    }

    /// Drains the deferred-disconnect queue, returning `(peer_id, reason)`
    /// for each peer actually removed.
    pub(crate) fn flush_disconnects(&mut self) -> Vec<(u16, DisconnectReason)> {
        let mut dropped = Vec::new();
        let requests: Vec<DisconnectRequest> = self.deferred_disconnects.drain(..).collect();
        for request in requests {
            let Some(mut peer) = self.peers.take(request.slot) else {
                continue;
            };
            if request.notify_remote {
                self.send_disconnection_now(peer.addr, peer.data_prefix, request.reason);
            }
            peer.reset(&mut self.pool);
            debug!(
                "peer {} at {} removed: {}",
                peer.id,
                peer.addr,
                request.reason.as_str()
            );
            dropped.push((peer.id, request.reason));
        }
        dropped
    }

    /// Fire-and-forget Disconnection notice, outside any channel.
    pub(crate) fn send_disconnection_now(
        &mut self,
        addr: SocketAddr,
        prefix: u64,
        reason: DisconnectReason,
    ) {
        let mut message = self.pool.lend(MessageKind::Disconnection);
        if let MessageBody::Disconnection {
            prefix: p,
            reason: r,
        } = &mut message.body
        {
            *p = prefix;
            *r = reason;
        }
        self.send_single_now(addr, message);
    }

    /// Fire-and-forget ConnectionDenied, for addresses that never get a slot.
    pub(crate) fn send_denied_now(&mut self, addr: SocketAddr, reason: DenyReason) {
        let mut message = self.pool.lend(MessageKind::ConnectionDenied);
        if let MessageBody::ConnectionDenied { reason: r } = &mut message.body {
            *r = reason;
        }
        self.send_single_now(addr, message);
    }

    fn send_single_now(&mut self, addr: SocketAddr, message: Message) {
        let Some(transport) = self.transport.as_mut() else {
            self.pool.release(message);
            return;
        };
        let mut packet = NetworkPacket::new(0, 0, 0);
        packet.push(message);
        let mut buffer = WriteBuffer::with_capacity(MAX_PACKET_SIZE);
        if packet.write(&mut buffer).is_ok() {
            transport.send_to(buffer.as_slice(), addr);
        }
        for message in packet.into_messages() {
            self.pool.release(message);
        }
    }

    /// One packet per pending connection with traffic, then one per
    /// (peer, channel) with traffic or unsent ack state.
    pub(crate) fn flush_outbound(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let pool = &mut self.pool;
        for pending in self.pending.iter_mut() {
            flush_channel(transport, pool, &mut pending.channel, pending.addr);
        }
        for peer in self.peers.iter_mut() {
            let addr = peer.addr;
            for channel in peer.channels_mut() {
                flush_channel(transport, pool, channel, addr);
            }
        }
    }

    /// Tears everything down: notifies and drops remote peers, resets
    /// pending handshakes, closes the socket.
    pub(crate) fn stop(&mut self, reason: DisconnectReason) -> Vec<(u16, DisconnectReason)> {
        for slot in self.peers.slots_occupied() {
            self.queue_disconnect(slot, reason, true);
        }
        let dropped = self.flush_disconnects();
        self.pending.reset_all(&mut self.pool);
        self.transport = None;
        self.reset_hint = false;
        dropped
    }
}

/// Assembles and sends one packet from a channel, honoring the datagram
/// budget. Messages return to the channel (reliable) or the pool (unreliable)
/// once serialized.
fn flush_channel(
    transport: &mut Transport,
    pool: &mut MessagePool,
    channel: &mut Channel,
    addr: SocketAddr,
) {
    if !channel.has_outgoing() && !channel.has_dirty_acks() {
        return;
    }

    let (last_acked, ack_bits) = channel.generate_acks();
    let mut packet = NetworkPacket::new(channel.next_packet_sequence(), last_acked, ack_bits);

    while let Some(size) = channel.peek_outgoing_size() {
        if !packet.fits(size) {
            break;
        }
        match channel.next_outgoing() {
            Some(message) => packet.push(message),
            None => break,
        }
    }

    // An oversized lone message can push past MAX_PACKET_SIZE; size the
    // scratch buffer for it rather than failing the write.
    let mut buffer = WriteBuffer::with_capacity(packet.size().max(MAX_PACKET_SIZE));
    match packet.write(&mut buffer) {
        Ok(()) => transport.send_to(buffer.as_slice(), addr),
        Err(e) => log::error!("packet serialization failed: {e}"),
    }

    for message in packet.into_messages() {
        if let Some(released) = channel.mark_sent(message) {
            pool.release(released);
        }
    }
}
