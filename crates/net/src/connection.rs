//! Handshake-scoped state for addresses that have not completed the salt
//! exchange.

use std::net::SocketAddr;

use crate::channel::{Channel, ChannelKind};
use crate::message::Message;
use crate::pool::MessagePool;

#[derive(Debug)]
pub struct PendingConnection {
    pub addr: SocketAddr,
    pub client_salt: u64,
    pub server_salt: u64,
    pub timeout_left: f32,
    /// Handshake traffic rides a single best-effort channel; the endpoints
    /// retry on a cadence instead of relying on acks.
    pub channel: Channel,
}

impl PendingConnection {
    pub fn new(addr: SocketAddr, client_salt: u64, server_salt: u64, timeout: f32) -> Self {
        Self {
            addr,
            client_salt,
            server_salt,
            timeout_left: timeout,
            channel: Channel::new(ChannelKind::UnreliableUnordered),
        }
    }

    pub fn prefix(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    pub fn queue_outgoing(&mut self, message: Message) {
        self.channel.queue_outgoing(message);
    }
}

/// Fixed-capacity slot table for in-flight handshakes. Sized at twice the
/// connection limit since more handshakes than connections can be in the air.
#[derive(Debug)]
pub struct PendingConnectionSlots {
    slots: Vec<Option<PendingConnection>>,
}

impl PendingConnectionSlots {
    pub fn new(max_connections: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(max_connections * 2, || None);
        Self { slots }
    }

    pub fn get_by_addr_mut(&mut self, addr: SocketAddr) -> Option<&mut PendingConnection> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|pending| pending.addr == addr)
    }

    pub fn contains_addr(&self, addr: SocketAddr) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|pending| pending.addr == addr)
    }

    /// Inserts into the first free slot. At most one pending connection per
    /// address ever exists; callers check `contains_addr` first.
    pub fn insert(&mut self, pending: PendingConnection) -> Option<&mut PendingConnection> {
        debug_assert!(!self.contains_addr(pending.addr));
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(pending);
        self.slots[slot].as_mut()
    }

    pub fn remove_by_addr(&mut self, addr: SocketAddr) -> Option<PendingConnection> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.addr == addr))?;
        self.slots[slot].take()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingConnection> {
        self.slots.iter_mut().flatten()
    }

    /// Decrements handshake timers and removes anything that ran out,
    /// returning the expired connections for teardown.
    pub fn advance_timers(&mut self, dt: f32) -> Vec<PendingConnection> {
        let mut expired = Vec::new();
        for slot in &mut self.slots {
            let ran_out = slot.as_mut().is_some_and(|pending| {
                pending.timeout_left -= dt;
                pending.timeout_left <= 0.0
            });
            if ran_out {
                expired.extend(slot.take());
            }
        }
        expired
    }

    pub fn reset_all(&mut self, pool: &mut MessagePool) {
        for slot in &mut self.slots {
            if let Some(mut pending) = slot.take() {
                pending.channel.reset(pool);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn one_pending_per_address() {
        let mut slots = PendingConnectionSlots::new(2);
        slots.insert(PendingConnection::new(addr(1000), 1, 2, 5.0));
        assert!(slots.contains_addr(addr(1000)));
        assert!(!slots.contains_addr(addr(1001)));
        assert_eq!(slots.count(), 1);

        let removed = slots.remove_by_addr(addr(1000)).unwrap();
        assert_eq!(removed.prefix(), 1 ^ 2);
        assert_eq!(slots.count(), 0);
    }

    #[test]
    fn capacity_is_twice_the_connection_limit() {
        let mut slots = PendingConnectionSlots::new(1);
        assert!(slots
            .insert(PendingConnection::new(addr(1), 0, 0, 5.0))
            .is_some());
        assert!(slots
            .insert(PendingConnection::new(addr(2), 0, 0, 5.0))
            .is_some());
        assert!(slots
            .insert(PendingConnection::new(addr(3), 0, 0, 5.0))
            .is_none());
    }

    #[test]
    fn timers_expire_handshakes() {
        let mut slots = PendingConnectionSlots::new(2);
        slots.insert(PendingConnection::new(addr(1), 0, 0, 1.0));
        slots.insert(PendingConnection::new(addr(2), 0, 0, 3.0));

        assert!(slots.advance_timers(0.5).is_empty());
        let expired = slots.advance_timers(1.0);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].addr, addr(1));
        assert_eq!(slots.count(), 1);
    }
}
