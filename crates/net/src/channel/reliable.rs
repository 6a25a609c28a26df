//! Reliable, in-order delivery with per-message acks and retransmission.

use std::collections::{HashMap, VecDeque};

use super::sequence_newer_than;
use crate::message::Message;
use crate::pool::MessagePool;

/// Rolling window of recently acked sequences, indexed `sequence % 1024`.
const ACK_WINDOW_SIZE: usize = 1024;

/// Cap on messages parked while a predecessor is outstanding. An arrival past
/// the cap is dropped unacked, so the sender's RTO brings it back.
const WAITING_CAP: usize = ACK_WINDOW_SIZE;

/// Retransmission timeout before the first RTT sample exists, in seconds.
const INITIAL_RTO_SECS: f32 = 0.5;

/// EMA weight of a new RTT sample, out of 100.
const RTT_ALPHA: f32 = 10.0;

#[derive(Debug, Clone, Copy, Default)]
struct AckEntry {
    sequence: u16,
    acked: bool,
}

#[derive(Debug)]
struct InFlightMessage {
    message: Message,
    /// Seconds until this message is eligible for resend.
    rto_left: f32,
    /// Seconds since transmission, fed into the RTT estimate on ack.
    age: f32,
}

#[derive(Debug)]
pub struct ReliableOrderedChannel {
    // Send side.
    to_send: VecDeque<Message>,
    retransmit: VecDeque<Message>,
    in_flight: Vec<InFlightMessage>,
    next_sequence: u16,
    packet_sequence: u16,
    smoothed_rtt_ms: f32,

    // Receive side.
    window: Box<[AckEntry; ACK_WINDOW_SIZE]>,
    last_acked: u16,
    acks_dirty: bool,
    next_expected: u16,
    waiting: HashMap<u16, Message>,
    ready: VecDeque<Message>,
}

/// Sequence 0 is never assigned, so a packet header with `last_acked == 0`
/// cannot falsely retire anything.
#[inline]
fn advance_sequence(sequence: u16) -> u16 {
    let next = sequence.wrapping_add(1);
    if next == 0 { 1 } else { next }
}

impl Default for ReliableOrderedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableOrderedChannel {
    pub fn new() -> Self {
        Self {
            to_send: VecDeque::new(),
            retransmit: VecDeque::new(),
            in_flight: Vec::new(),
            next_sequence: 1,
            packet_sequence: 0,
            smoothed_rtt_ms: 0.0,
            window: Box::new([AckEntry::default(); ACK_WINDOW_SIZE]),
            last_acked: 0,
            acks_dirty: false,
            next_expected: 1,
            waiting: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn queue_outgoing(&mut self, message: Message) {
        self.to_send.push_back(message);
    }

    pub fn has_outgoing(&self) -> bool {
        !self.retransmit.is_empty() || !self.to_send.is_empty()
    }

    /// Wire size of the next message to go out, without taking it.
    pub fn peek_outgoing_size(&self) -> Option<usize> {
        self.retransmit
            .front()
            .or_else(|| self.to_send.front())
            .map(|m| m.size())
    }

    /// Expired retransmits go out first, keeping their original sequence
    /// numbers; fresh messages are sequenced here.
    pub fn next_outgoing(&mut self) -> Option<Message> {
        if let Some(message) = self.retransmit.pop_front() {
            return Some(message);
        }
        let mut message = self.to_send.pop_front()?;
        message.sequence = self.next_sequence;
        self.next_sequence = advance_sequence(self.next_sequence);
        Some(message)
    }

    pub fn mark_sent(&mut self, message: Message) {
        self.in_flight.push(InFlightMessage {
            message,
            rto_left: self.current_rto(),
            age: 0.0,
        });
    }

    fn current_rto(&self) -> f32 {
        if self.smoothed_rtt_ms > 0.0 {
            self.smoothed_rtt_ms / 1000.0 * 2.0
        } else {
            INITIAL_RTO_SECS
        }
    }

    pub fn update(&mut self, dt: f32) {
        let mut i = 0;
        while i < self.in_flight.len() {
            let entry = &mut self.in_flight[i];
            entry.age += dt;
            entry.rto_left -= dt;
            if entry.rto_left <= 0.0 {
                let entry = self.in_flight.swap_remove(i);
                self.retransmit.push_back(entry.message);
            } else {
                i += 1;
            }
        }
    }

    fn record_ack(&mut self, sequence: u16) {
        let entry = &mut self.window[sequence as usize % ACK_WINDOW_SIZE];
        entry.sequence = sequence;
        entry.acked = true;
        if self.last_acked == 0 || sequence_newer_than(sequence, self.last_acked) {
            self.last_acked = sequence;
        }
        self.acks_dirty = true;
    }

    fn is_duplicate(&self, sequence: u16) -> bool {
        let entry = &self.window[sequence as usize % ACK_WINDOW_SIZE];
        entry.acked && entry.sequence == sequence
    }

    pub fn handle_received(&mut self, message: Message, pool: &mut MessagePool) {
        let sequence = message.sequence;
        if self.is_duplicate(sequence) {
            pool.release(message);
            return;
        }

        if sequence == self.next_expected {
            self.record_ack(sequence);
            self.ready.push_back(message);
            self.next_expected = advance_sequence(self.next_expected);
            // Anything parked behind this message is now contiguous.
            while let Some(parked) = self.waiting.remove(&self.next_expected) {
                self.ready.push_back(parked);
                self.next_expected = advance_sequence(self.next_expected);
            }
        } else if sequence_newer_than(sequence, self.next_expected) {
            if self.waiting.len() >= WAITING_CAP {
                // Dropped without acking; the sender's RTO retransmits it.
                pool.release(message);
                return;
            }
            self.record_ack(sequence);
            self.waiting.insert(sequence, message);
        } else {
            // Behind the expectation but outside the dedup window: delivered
            // long ago. Ack so the sender stops resending.
            self.record_ack(sequence);
            pool.release(message);
        }
    }

    pub fn next_ready(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    pub fn has_dirty_acks(&self) -> bool {
        self.acks_dirty
    }

    pub fn generate_acks(&mut self) -> (u16, u32) {
        self.acks_dirty = false;
        if self.last_acked == 0 {
            return (0, 0);
        }
        let mut bits = 0u32;
        for i in 0..32u16 {
            let sequence = self.last_acked.wrapping_sub(1 + i);
            if sequence == 0 {
                continue;
            }
            let entry = &self.window[sequence as usize % ACK_WINDOW_SIZE];
            if entry.acked && entry.sequence == sequence {
                bits |= 1 << i;
            }
        }
        (self.last_acked, bits)
    }

    pub fn process_acks(&mut self, last_acked: u16, ack_bits: u32, pool: &mut MessagePool) {
        if last_acked == 0 {
            return;
        }
        self.retire(last_acked, pool);
        for i in 0..32u16 {
            if ack_bits & (1 << i) != 0 {
                self.retire(last_acked.wrapping_sub(1 + i), pool);
            }
        }
    }

    fn retire(&mut self, sequence: u16, pool: &mut MessagePool) {
        if sequence == 0 {
            return;
        }
        if let Some(pos) = self
            .in_flight
            .iter()
            .position(|e| e.message.sequence == sequence)
        {
            let entry = self.in_flight.swap_remove(pos);
            self.sample_rtt(entry.age * 1000.0);
            pool.release(entry.message);
            return;
        }
        // The ack may land while the message sits in the resend queue.
        if let Some(pos) = self
            .retransmit
            .iter()
            .position(|m| m.sequence == sequence)
        {
            if let Some(message) = self.retransmit.remove(pos) {
                pool.release(message);
            }
        }
    }

    fn sample_rtt(&mut self, sample_ms: f32) {
        if self.smoothed_rtt_ms == 0.0 {
            self.smoothed_rtt_ms = sample_ms;
        } else {
            self.smoothed_rtt_ms =
                ((100.0 - RTT_ALPHA) * self.smoothed_rtt_ms + RTT_ALPHA * sample_ms) / 100.0;
        }
    }

    pub fn smoothed_rtt_ms(&self) -> f32 {
        self.smoothed_rtt_ms
    }

    pub fn next_packet_sequence(&mut self) -> u16 {
        let sequence = self.packet_sequence;
        self.packet_sequence = self.packet_sequence.wrapping_add(1);
        sequence
    }

    pub fn reset(&mut self, pool: &mut MessagePool) {
        for message in self.to_send.drain(..).chain(self.retransmit.drain(..)) {
            pool.release(message);
        }
        for entry in self.in_flight.drain(..) {
            pool.release(entry.message);
        }
        for (_, message) in self.waiting.drain() {
            pool.release(message);
        }
        for message in self.ready.drain(..) {
            pool.release(message);
        }
        self.window.fill(AckEntry::default());
        self.next_sequence = 1;
        self.packet_sequence = 0;
        self.smoothed_rtt_ms = 0.0;
        self.last_acked = 0;
        self.acks_dirty = false;
        self.next_expected = 1;
    }
}
