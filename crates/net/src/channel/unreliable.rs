//! The two best-effort delivery policies.

use std::collections::VecDeque;

use super::sequence_newer_than;
use crate::message::Message;
use crate::pool::MessagePool;

/// No deduplication, no acks, no retransmission: messages surface in arrival
/// order, whatever that order is.
#[derive(Debug, Default)]
pub struct UnreliableUnorderedChannel {
    to_send: VecDeque<Message>,
    ready: VecDeque<Message>,
    next_sequence: u16,
    packet_sequence: u16,
}

impl UnreliableUnorderedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_outgoing(&mut self, message: Message) {
        self.to_send.push_back(message);
    }

    pub fn has_outgoing(&self) -> bool {
        !self.to_send.is_empty()
    }

    /// Wire size of the next message to go out, without taking it.
    pub fn peek_outgoing_size(&self) -> Option<usize> {
        self.to_send.front().map(|m| m.size())
    }

    pub fn next_outgoing(&mut self) -> Option<Message> {
        let mut message = self.to_send.pop_front()?;
        message.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Some(message)
    }

    pub fn handle_received(&mut self, message: Message) {
        self.ready.push_back(message);
    }

    pub fn next_ready(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    pub fn next_packet_sequence(&mut self) -> u16 {
        let sequence = self.packet_sequence;
        self.packet_sequence = self.packet_sequence.wrapping_add(1);
        sequence
    }

    pub fn reset(&mut self, pool: &mut MessagePool) {
        for message in self.to_send.drain(..).chain(self.ready.drain(..)) {
            pool.release(message);
        }
        self.next_sequence = 0;
        self.packet_sequence = 0;
    }
}

/// Drops anything older than the newest sequence seen; never waits for gaps.
#[derive(Debug, Default)]
pub struct UnreliableOrderedChannel {
    to_send: VecDeque<Message>,
    ready: VecDeque<Message>,
    next_sequence: u16,
    packet_sequence: u16,
    last_received: Option<u16>,
}

impl UnreliableOrderedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_outgoing(&mut self, message: Message) {
        self.to_send.push_back(message);
    }

    pub fn has_outgoing(&self) -> bool {
        !self.to_send.is_empty()
    }

    /// Wire size of the next message to go out, without taking it.
    pub fn peek_outgoing_size(&self) -> Option<usize> {
        self.to_send.front().map(|m| m.size())
    }

    pub fn next_outgoing(&mut self) -> Option<Message> {
        let mut message = self.to_send.pop_front()?;
        message.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Some(message)
    }

    pub fn handle_received(&mut self, message: Message, pool: &mut MessagePool) {
        let newer = match self.last_received {
            None => true,
            Some(last) => sequence_newer_than(message.sequence, last),
        };
        if newer {
            self.last_received = Some(message.sequence);
            self.ready.push_back(message);
        } else {
            pool.release(message);
        }
    }

    pub fn next_ready(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    pub fn next_packet_sequence(&mut self) -> u16 {
        let sequence = self.packet_sequence;
        self.packet_sequence = self.packet_sequence.wrapping_add(1);
        sequence
    }

    pub fn reset(&mut self, pool: &mut MessagePool) {
        for message in self.to_send.drain(..).chain(self.ready.drain(..)) {
            pool.release(message);
        }
        self.next_sequence = 0;
        self.packet_sequence = 0;
        self.last_received = None;
    }
}
