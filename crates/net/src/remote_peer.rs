//! Post-handshake peer state and the fixed-capacity peer registry.

use std::net::SocketAddr;

use crate::channel::{Channel, ChannelKind, CHANNEL_KIND_COUNT};
use crate::message::Message;
use crate::pool::MessagePool;

/// A fully connected counterpart: address, assigned id, the salt-derived data
/// prefix, the inactivity countdown, and one instance of each channel policy.
#[derive(Debug)]
pub struct RemotePeer {
    pub addr: SocketAddr,
    pub id: u16,
    pub data_prefix: u64,
    pub inactivity_left: f32,
    channels: [Channel; CHANNEL_KIND_COUNT],
}

impl RemotePeer {
    pub fn new(addr: SocketAddr, id: u16, data_prefix: u64, inactivity_timeout: f32) -> Self {
        Self {
            addr,
            id,
            data_prefix,
            inactivity_left: inactivity_timeout,
            channels: [
                Channel::new(ChannelKind::UnreliableUnordered),
                Channel::new(ChannelKind::UnreliableOrdered),
                Channel::new(ChannelKind::ReliableOrdered),
            ],
        }
    }

    pub fn channel(&self, kind: ChannelKind) -> &Channel {
        &self.channels[kind as usize]
    }

    pub fn channel_mut(&mut self, kind: ChannelKind) -> &mut Channel {
        &mut self.channels[kind as usize]
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }

    /// Queues an outbound message on the channel its flags select.
    pub fn queue_outgoing(&mut self, message: Message) {
        let kind = ChannelKind::for_flags(message.flags);
        self.channels[kind as usize].queue_outgoing(message);
    }

    /// Routes an inbound message to the channel its flags select.
    pub fn route_received(&mut self, message: Message, pool: &mut MessagePool) {
        let kind = ChannelKind::for_flags(message.flags);
        self.channels[kind as usize].handle_received(message, pool);
    }

    /// Restarts the inactivity countdown; called on every authenticated
    /// datagram from this peer.
    pub fn touch(&mut self, inactivity_timeout: f32) {
        self.inactivity_left = inactivity_timeout;
    }

    pub fn update_channels(&mut self, dt: f32) {
        self.inactivity_left -= dt;
        for channel in &mut self.channels {
            channel.update(dt);
        }
    }

    pub fn is_inactive(&self) -> bool {
        self.inactivity_left <= 0.0
    }

    pub fn smoothed_rtt_ms(&self) -> f32 {
        self.channel(ChannelKind::ReliableOrdered).smoothed_rtt_ms()
    }

    pub fn reset(&mut self, pool: &mut MessagePool) {
        for channel in &mut self.channels {
            channel.reset(pool);
        }
    }
}

/// Fixed slot table of connected peers, owned by the peer for its lifetime.
#[derive(Debug)]
pub struct RemotePeerSlots {
    slots: Vec<Option<RemotePeer>>,
}

impl RemotePeerSlots {
    pub fn new(max_connections: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(max_connections, || None);
        Self { slots }
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Places a peer into the first free slot, returning its slot index.
    pub fn insert(&mut self, peer: RemotePeer) -> Option<usize> {
        debug_assert!(!self.contains_addr(peer.addr));
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(peer);
        Some(slot)
    }

    pub fn contains_addr(&self, addr: SocketAddr) -> bool {
        self.slots.iter().flatten().any(|peer| peer.addr == addr)
    }

    pub fn slot_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.addr == addr))
    }

    pub fn slot_by_id(&self, id: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.id == id))
    }

    pub fn get(&self, slot: usize) -> Option<&RemotePeer> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut RemotePeer> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn take(&mut self, slot: usize) -> Option<RemotePeer> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemotePeer> {
        self.slots.iter_mut().flatten()
    }

    pub fn slots_occupied(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].is_some())
            .collect()
    }
}
