//! Transmission channels: the three delivery policies a peer pair maintains.
//!
//! Dispatch is a tagged enum over a closed variant set rather than trait
//! objects, so every policy branch is exhaustiveness-checked.

mod reliable;
mod unreliable;

pub use reliable::ReliableOrderedChannel;
pub use unreliable::{UnreliableOrderedChannel, UnreliableUnorderedChannel};

use crate::message::{Message, MessageFlags};
use crate::pool::MessagePool;

/// Half of the u16 sequence space, the wraparound threshold for "newer than"
/// comparisons.
const SEQUENCE_HALF_RANGE: u16 = 1 << 15;

/// Wraparound-aware sequence comparison: `a` is newer than `b` even when the
/// counter has wrapped between them.
#[inline]
pub fn sequence_newer_than(a: u16, b: u16) -> bool {
    ((a > b) && (a - b <= SEQUENCE_HALF_RANGE)) || ((a < b) && (b - a > SEQUENCE_HALF_RANGE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ChannelKind {
    UnreliableUnordered = 0,
    UnreliableOrdered = 1,
    ReliableOrdered = 2,
}

pub const CHANNEL_KIND_COUNT: usize = 3;

impl ChannelKind {
    /// Maps a message's flag byte to the channel that carries it. A reliable
    /// message always rides the reliable-ordered channel; there is no
    /// reliable-unordered policy.
    pub fn for_flags(flags: MessageFlags) -> Self {
        if flags.contains(MessageFlags::RELIABLE) {
            Self::ReliableOrdered
        } else if flags.contains(MessageFlags::ORDERED) {
            Self::UnreliableOrdered
        } else {
            Self::UnreliableUnordered
        }
    }
}

#[derive(Debug)]
pub enum Channel {
    UnreliableUnordered(UnreliableUnorderedChannel),
    UnreliableOrdered(UnreliableOrderedChannel),
    ReliableOrdered(ReliableOrderedChannel),
}

impl Channel {
    pub fn new(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::UnreliableUnordered => {
                Self::UnreliableUnordered(UnreliableUnorderedChannel::new())
            }
            ChannelKind::UnreliableOrdered => {
                Self::UnreliableOrdered(UnreliableOrderedChannel::new())
            }
            ChannelKind::ReliableOrdered => Self::ReliableOrdered(ReliableOrderedChannel::new()),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::UnreliableUnordered(_) => ChannelKind::UnreliableUnordered,
            Self::UnreliableOrdered(_) => ChannelKind::UnreliableOrdered,
            Self::ReliableOrdered(_) => ChannelKind::ReliableOrdered,
        }
    }

    /// Queues an outbound message; it gets its sequence number on dequeue.
    pub fn queue_outgoing(&mut self, message: Message) {
        match self {
            Self::UnreliableUnordered(c) => c.queue_outgoing(message),
            Self::UnreliableOrdered(c) => c.queue_outgoing(message),
            Self::ReliableOrdered(c) => c.queue_outgoing(message),
        }
    }

    /// True when a flush would put at least one message on the wire.
    pub fn has_outgoing(&self) -> bool {
        match self {
            Self::UnreliableUnordered(c) => c.has_outgoing(),
            Self::UnreliableOrdered(c) => c.has_outgoing(),
            Self::ReliableOrdered(c) => c.has_outgoing(),
        }
    }

    /// Wire size of the next message a flush would take, without taking it.
    pub fn peek_outgoing_size(&self) -> Option<usize> {
        match self {
            Self::UnreliableUnordered(c) => c.peek_outgoing_size(),
            Self::UnreliableOrdered(c) => c.peek_outgoing_size(),
            Self::ReliableOrdered(c) => c.peek_outgoing_size(),
        }
    }

    /// Hands out the next message to transmit, assigning its sequence number.
    /// Ownership passes to the caller for serialization; return it through
    /// [`Channel::mark_sent`].
    pub fn next_outgoing(&mut self) -> Option<Message> {
        match self {
            Self::UnreliableUnordered(c) => c.next_outgoing(),
            Self::UnreliableOrdered(c) => c.next_outgoing(),
            Self::ReliableOrdered(c) => c.next_outgoing(),
        }
    }

    /// Accounts for a transmitted message. Unreliable channels give the
    /// message back for pool release; the reliable channel keeps it for
    /// retransmission until acked.
    #[must_use]
    pub fn mark_sent(&mut self, message: Message) -> Option<Message> {
        match self {
            Self::UnreliableUnordered(_) | Self::UnreliableOrdered(_) => Some(message),
            Self::ReliableOrdered(c) => {
                c.mark_sent(message);
                None
            }
        }
    }

    /// Feeds an inbound message through dedup/ordering; messages that should
    /// reach the application surface through [`Channel::next_ready`].
    pub fn handle_received(&mut self, message: Message, pool: &mut MessagePool) {
        match self {
            Self::UnreliableUnordered(c) => c.handle_received(message),
            Self::UnreliableOrdered(c) => c.handle_received(message, pool),
            Self::ReliableOrdered(c) => c.handle_received(message, pool),
        }
    }

    /// Pops the next message in delivery order, if any.
    pub fn next_ready(&mut self) -> Option<Message> {
        match self {
            Self::UnreliableUnordered(c) => c.next_ready(),
            Self::UnreliableOrdered(c) => c.next_ready(),
            Self::ReliableOrdered(c) => c.next_ready(),
        }
    }

    /// `(last_acked, ack_bits)` for the outgoing packet header. Clears the
    /// dirty flag.
    pub fn generate_acks(&mut self) -> (u16, u32) {
        match self {
            Self::ReliableOrdered(c) => c.generate_acks(),
            _ => (0, 0),
        }
    }

    /// True when ack state changed since the last [`Channel::generate_acks`],
    /// which forces a packet flush even with nothing queued.
    pub fn has_dirty_acks(&self) -> bool {
        match self {
            Self::ReliableOrdered(c) => c.has_dirty_acks(),
            _ => false,
        }
    }

    /// Retires in-flight messages named by a received packet header.
    pub fn process_acks(&mut self, last_acked: u16, ack_bits: u32, pool: &mut MessagePool) {
        if let Self::ReliableOrdered(c) = self {
            c.process_acks(last_acked, ack_bits, pool);
        }
    }

    /// Time-based housekeeping; `dt` is caller-supplied elapsed seconds.
    pub fn update(&mut self, dt: f32) {
        if let Self::ReliableOrdered(c) = self {
            c.update(dt);
        }
    }

    pub fn reset(&mut self, pool: &mut MessagePool) {
        match self {
            Self::UnreliableUnordered(c) => c.reset(pool),
            Self::UnreliableOrdered(c) => c.reset(pool),
            Self::ReliableOrdered(c) => c.reset(pool),
        }
    }

    /// Per-channel outgoing packet counter.
    pub fn next_packet_sequence(&mut self) -> u16 {
        match self {
            Self::UnreliableUnordered(c) => c.next_packet_sequence(),
            Self::UnreliableOrdered(c) => c.next_packet_sequence(),
            Self::ReliableOrdered(c) => c.next_packet_sequence(),
        }
    }

    /// Smoothed RTT in milliseconds; zero until the reliable channel has a
    /// sample.
    pub fn smoothed_rtt_ms(&self) -> f32 {
        match self {
            Self::ReliableOrdered(c) => c.smoothed_rtt_ms(),
            _ => 0.0,
        }
    }
}
