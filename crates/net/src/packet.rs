//! One wire transmission: a packet header plus zero or more messages.

use log::warn;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::CodecError;
use crate::message::Message;

/// Practical datagram budget; staying under it avoids IP fragmentation on
/// common paths.
pub const MAX_PACKET_SIZE: usize = 1200;

/// `sequence:u16, last_acked:u16, ack_bits:u32, message_count:u8`.
pub const PACKET_HEADER_SIZE: usize = 9;

#[derive(Debug)]
pub struct NetworkPacket {
    pub sequence: u16,
    pub last_acked: u16,
    pub ack_bits: u32,
    messages: Vec<Message>,
}

impl NetworkPacket {
    pub fn new(sequence: u16, last_acked: u16, ack_bits: u32) -> Self {
        Self {
            sequence,
            last_acked,
            ack_bits,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Header plus every contained message, in wire bytes.
    pub fn size(&self) -> usize {
        PACKET_HEADER_SIZE + self.messages.iter().map(Message::size).sum::<usize>()
    }

    /// Whether a message of `message_size` wire bytes still fits under
    /// [`MAX_PACKET_SIZE`]. An oversized message alone in a packet is let
    /// through with a warning; the network may fragment it, but refusing to
    /// send would wedge the channel.
    pub fn fits(&self, message_size: usize) -> bool {
        if self.messages.len() >= u8::MAX as usize {
            return false;
        }
        if self.is_empty() && PACKET_HEADER_SIZE + message_size > MAX_PACKET_SIZE {
            warn!(
                "single message of {message_size} bytes exceeds packet budget {MAX_PACKET_SIZE}"
            );
            return true;
        }
        self.size() + message_size <= MAX_PACKET_SIZE
    }

    pub fn push(&mut self, message: Message) {
        debug_assert!(self.messages.len() < u8::MAX as usize);
        self.messages.push(message);
    }

    pub fn write(&self, buffer: &mut WriteBuffer) -> Result<(), CodecError> {
        buffer.write_u16(self.sequence)?;
        buffer.write_u16(self.last_acked)?;
        buffer.write_u32(self.ack_bits)?;
        buffer.write_u8(self.messages.len() as u8)?;
        for message in &self.messages {
            message.write(buffer)?;
        }
        Ok(())
    }

    pub fn read(buffer: &mut ReadBuffer) -> Result<Self, CodecError> {
        let sequence = buffer.read_u16()?;
        let last_acked = buffer.read_u16()?;
        let ack_bits = buffer.read_u32()?;
        let count = buffer.read_u8()? as usize;

        let mut packet = Self::new(sequence, last_acked, ack_bits);
        packet.messages.reserve(count);
        for _ in 0..count {
            packet.messages.push(Message::read(buffer)?);
        }
        Ok(packet)
    }

    /// Decode with messages lent from the pool instead of freshly allocated.
    pub fn read_pooled(
        buffer: &mut ReadBuffer,
        pool: &mut crate::pool::MessagePool,
    ) -> Result<Self, CodecError> {
        let sequence = buffer.read_u16()?;
        let last_acked = buffer.read_u16()?;
        let ack_bits = buffer.read_u32()?;
        let count = buffer.read_u8()? as usize;

        let mut packet = Self::new(sequence, last_acked, ack_bits);
        packet.messages.reserve(count);
        for _ in 0..count {
            packet.messages.push(Message::read_pooled(buffer, pool)?);
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, MessageFlags};

    fn ping(remote_time: u32) -> Message {
        Message::new(
            MessageFlags::empty(),
            MessageBody::TimeRequest { remote_time },
        )
    }

    #[test]
    fn round_trip_with_messages() {
        let mut packet = NetworkPacket::new(7, 3, 0b101);
        packet.push(ping(1));
        packet.push(ping(2));

        let mut buffer = WriteBuffer::with_capacity(MAX_PACKET_SIZE);
        packet.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), packet.size());

        let mut reader = ReadBuffer::new(buffer.as_slice());
        let decoded = NetworkPacket::read(&mut reader).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.last_acked, 3);
        assert_eq!(decoded.ack_bits, 0b101);
        assert_eq!(decoded.messages(), packet.messages());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn empty_packet_is_just_the_header() {
        let packet = NetworkPacket::new(0, 0, 0);
        assert_eq!(packet.size(), PACKET_HEADER_SIZE);

        let mut buffer = WriteBuffer::with_capacity(MAX_PACKET_SIZE);
        packet.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), PACKET_HEADER_SIZE);
    }

    #[test]
    fn fits_respects_packet_budget() {
        let mut packet = NetworkPacket::new(0, 0, 0);
        let big = Message::new(
            MessageFlags::empty(),
            MessageBody::Inputs {
                data: vec![0u8; 600],
            },
        );
        assert!(packet.fits(big.size()));
        let big_size = big.size();
        packet.push(big);

        assert!(!packet.fits(big_size));
        assert!(packet.fits(ping(0).size()));
    }

    #[test]
    fn oversized_single_message_is_allowed() {
        let packet = NetworkPacket::new(0, 0, 0);
        assert!(packet.fits(MAX_PACKET_SIZE * 2));
    }

    #[test]
    fn truncated_packet_fails_to_decode() {
        let mut packet = NetworkPacket::new(1, 0, 0);
        packet.push(ping(9));

        let mut buffer = WriteBuffer::with_capacity(MAX_PACKET_SIZE);
        packet.write(&mut buffer).unwrap();

        let data = &buffer.as_slice()[..buffer.len() - 2];
        let mut reader = ReadBuffer::new(data);
        assert!(NetworkPacket::read(&mut reader).is_err());
    }
}
