//! The closed set of protocol messages and their wire layout.
//!
//! Every message serializes as `kind:u8, sequence:u16, flags:u8` followed by a
//! kind-specific payload. Each message knows its own serialized size so packet
//! assembly can stop before breaching the datagram budget.

use bitflags::bitflags;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::CodecError;

/// Bytes of `kind + sequence + flags` preceding every payload.
pub const MESSAGE_HEADER_SIZE: usize = 4;

pub const MESSAGE_KIND_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ConnectionRequest = 0,
    ConnectionAccepted = 1,
    ConnectionDenied = 2,
    ConnectionChallenge = 3,
    ConnectionChallengeResponse = 4,
    Disconnection = 5,
    TimeRequest = 6,
    TimeResponse = 7,
    Replication = 8,
    Inputs = 9,
}

impl MessageKind {
    pub const ALL: [Self; MESSAGE_KIND_COUNT] = [
        Self::ConnectionRequest,
        Self::ConnectionAccepted,
        Self::ConnectionDenied,
        Self::ConnectionChallenge,
        Self::ConnectionChallengeResponse,
        Self::Disconnection,
        Self::TimeRequest,
        Self::TimeResponse,
        Self::Replication,
        Self::Inputs,
    ];

    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => Self::ConnectionRequest,
            1 => Self::ConnectionAccepted,
            2 => Self::ConnectionDenied,
            3 => Self::ConnectionChallenge,
            4 => Self::ConnectionChallengeResponse,
            5 => Self::Disconnection,
            6 => Self::TimeRequest,
            7 => Self::TimeResponse,
            8 => Self::Replication,
            9 => Self::Inputs,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        const RELIABLE = 1 << 0;
        const ORDERED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DenyReason {
    #[default]
    Unknown = 0,
    ServerFull = 1,
}

impl DenyReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ServerFull,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DisconnectReason {
    #[default]
    Unknown = 0,
    Timeout = 1,
    Shutdown = 2,
    ServerFull = 3,
}

impl DisconnectReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Timeout,
            2 => Self::Shutdown,
            3 => Self::ServerFull,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Timeout => "timed out",
            Self::Shutdown => "shut down",
            Self::ServerFull => "server full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationAction {
    Create = 0,
    Update = 1,
    Destroy = 2,
}

impl ReplicationAction {
    fn from_u8(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => Self::Create,
            1 => Self::Update,
            2 => Self::Destroy,
            _ => return Err(CodecError::Malformed("replication action out of range")),
        })
    }
}

/// Kind-specific payload of a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    ConnectionRequest {
        client_salt: u64,
    },
    ConnectionAccepted {
        prefix: u64,
        client_index: u16,
    },
    ConnectionDenied {
        reason: DenyReason,
    },
    ConnectionChallenge {
        client_salt: u64,
        server_salt: u64,
    },
    ConnectionChallengeResponse {
        prefix: u64,
    },
    Disconnection {
        prefix: u64,
        reason: DisconnectReason,
    },
    TimeRequest {
        remote_time: u32,
    },
    TimeResponse {
        remote_time: u32,
        server_time: u32,
    },
    Replication {
        action: ReplicationAction,
        entity_id: u32,
        controlled_by: u32,
        class_id: u32,
        data: Vec<u8>,
    },
    Inputs {
        data: Vec<u8>,
    },
}

impl MessageBody {
    /// A zeroed payload of the given kind, used by the pool when a free list
    /// runs dry.
    pub fn default_for(kind: MessageKind) -> Self {
        match kind {
            MessageKind::ConnectionRequest => Self::ConnectionRequest { client_salt: 0 },
            MessageKind::ConnectionAccepted => Self::ConnectionAccepted {
                prefix: 0,
                client_index: 0,
            },
            MessageKind::ConnectionDenied => Self::ConnectionDenied {
                reason: DenyReason::Unknown,
            },
            MessageKind::ConnectionChallenge => Self::ConnectionChallenge {
                client_salt: 0,
                server_salt: 0,
            },
            MessageKind::ConnectionChallengeResponse => {
                Self::ConnectionChallengeResponse { prefix: 0 }
            }
            MessageKind::Disconnection => Self::Disconnection {
                prefix: 0,
                reason: DisconnectReason::Unknown,
            },
            MessageKind::TimeRequest => Self::TimeRequest { remote_time: 0 },
            MessageKind::TimeResponse => Self::TimeResponse {
                remote_time: 0,
                server_time: 0,
            },
            MessageKind::Replication => Self::Replication {
                action: ReplicationAction::Create,
                entity_id: 0,
                controlled_by: 0,
                class_id: 0,
                data: Vec::new(),
            },
            MessageKind::Inputs => Self::Inputs { data: Vec::new() },
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConnectionRequest { .. } => MessageKind::ConnectionRequest,
            Self::ConnectionAccepted { .. } => MessageKind::ConnectionAccepted,
            Self::ConnectionDenied { .. } => MessageKind::ConnectionDenied,
            Self::ConnectionChallenge { .. } => MessageKind::ConnectionChallenge,
            Self::ConnectionChallengeResponse { .. } => MessageKind::ConnectionChallengeResponse,
            Self::Disconnection { .. } => MessageKind::Disconnection,
            Self::TimeRequest { .. } => MessageKind::TimeRequest,
            Self::TimeResponse { .. } => MessageKind::TimeResponse,
            Self::Replication { .. } => MessageKind::Replication,
            Self::Inputs { .. } => MessageKind::Inputs,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Self::ConnectionRequest { .. } => 8,
            Self::ConnectionAccepted { .. } => 10,
            Self::ConnectionDenied { .. } => 1,
            Self::ConnectionChallenge { .. } => 16,
            Self::ConnectionChallengeResponse { .. } => 8,
            Self::Disconnection { .. } => 9,
            Self::TimeRequest { .. } => 4,
            Self::TimeResponse { .. } => 8,
            Self::Replication { data, .. } => 15 + data.len(),
            Self::Inputs { data } => 2 + data.len(),
        }
    }
}

/// One typed protocol unit, lent from the pool and reclaimed after the send is
/// acknowledged or local processing finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sequence: u16,
    pub flags: MessageFlags,
    pub body: MessageBody,
}

impl Message {
    pub fn new(flags: MessageFlags, body: MessageBody) -> Self {
        Self {
            sequence: 0,
            flags,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(MessageFlags::RELIABLE)
    }

    pub fn is_ordered(&self) -> bool {
        self.flags.contains(MessageFlags::ORDERED)
    }

    /// Serialized size in bytes, header included.
    pub fn size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.body.payload_size()
    }

    pub fn write(&self, buffer: &mut WriteBuffer) -> Result<(), CodecError> {
        buffer.write_u8(self.kind() as u8)?;
        buffer.write_u16(self.sequence)?;
        buffer.write_u8(self.flags.bits())?;

        match &self.body {
            MessageBody::ConnectionRequest { client_salt } => {
                buffer.write_u64(*client_salt)?;
            }
            MessageBody::ConnectionAccepted {
                prefix,
                client_index,
            } => {
                buffer.write_u64(*prefix)?;
                buffer.write_u16(*client_index)?;
            }
            MessageBody::ConnectionDenied { reason } => {
                buffer.write_u8(*reason as u8)?;
            }
            MessageBody::ConnectionChallenge {
                client_salt,
                server_salt,
            } => {
                buffer.write_u64(*client_salt)?;
                buffer.write_u64(*server_salt)?;
            }
            MessageBody::ConnectionChallengeResponse { prefix } => {
                buffer.write_u64(*prefix)?;
            }
            MessageBody::Disconnection { prefix, reason } => {
                buffer.write_u64(*prefix)?;
                buffer.write_u8(*reason as u8)?;
            }
            MessageBody::TimeRequest { remote_time } => {
                buffer.write_u32(*remote_time)?;
            }
            MessageBody::TimeResponse {
                remote_time,
                server_time,
            } => {
                buffer.write_u32(*remote_time)?;
                buffer.write_u32(*server_time)?;
            }
            MessageBody::Replication {
                action,
                entity_id,
                controlled_by,
                class_id,
                data,
            } => {
                buffer.write_u8(*action as u8)?;
                buffer.write_u32(*entity_id)?;
                buffer.write_u32(*controlled_by)?;
                buffer.write_u32(*class_id)?;
                buffer.write_u16(data.len() as u16)?;
                buffer.write_bytes(data)?;
            }
            MessageBody::Inputs { data } => {
                buffer.write_u16(data.len() as u16)?;
                buffer.write_bytes(data)?;
            }
        }
        Ok(())
    }

    /// Decodes into a pool-lent instance, reusing its payload capacity. The
    /// steady-state receive path goes through here; [`Message::read`] is the
    /// allocating variant.
    pub fn read_pooled(
        buffer: &mut ReadBuffer,
        pool: &mut crate::pool::MessagePool,
    ) -> Result<Self, CodecError> {
        let kind = MessageKind::from_u8(buffer.read_u8()?)?;
        let mut message = pool.lend(kind);
        message.sequence = buffer.read_u16()?;
        message.flags = MessageFlags::from_bits_truncate(buffer.read_u8()?);

        match &mut message.body {
            MessageBody::ConnectionRequest { client_salt } => {
                *client_salt = buffer.read_u64()?;
            }
            MessageBody::ConnectionAccepted {
                prefix,
                client_index,
            } => {
                *prefix = buffer.read_u64()?;
                *client_index = buffer.read_u16()?;
            }
            MessageBody::ConnectionDenied { reason } => {
                *reason = DenyReason::from_u8(buffer.read_u8()?);
            }
            MessageBody::ConnectionChallenge {
                client_salt,
                server_salt,
            } => {
                *client_salt = buffer.read_u64()?;
                *server_salt = buffer.read_u64()?;
            }
            MessageBody::ConnectionChallengeResponse { prefix } => {
                *prefix = buffer.read_u64()?;
            }
            MessageBody::Disconnection { prefix, reason } => {
                *prefix = buffer.read_u64()?;
                *reason = DisconnectReason::from_u8(buffer.read_u8()?);
            }
            MessageBody::TimeRequest { remote_time } => {
                *remote_time = buffer.read_u32()?;
            }
            MessageBody::TimeResponse {
                remote_time,
                server_time,
            } => {
                *remote_time = buffer.read_u32()?;
                *server_time = buffer.read_u32()?;
            }
            MessageBody::Replication {
                action,
                entity_id,
                controlled_by,
                class_id,
                data,
            } => {
                *action = ReplicationAction::from_u8(buffer.read_u8()?)?;
                *entity_id = buffer.read_u32()?;
                *controlled_by = buffer.read_u32()?;
                *class_id = buffer.read_u32()?;
                let len = buffer.read_u16()? as usize;
                data.clear();
                data.extend_from_slice(buffer.read_bytes(len)?);
            }
            MessageBody::Inputs { data } => {
                let len = buffer.read_u16()? as usize;
                data.clear();
                data.extend_from_slice(buffer.read_bytes(len)?);
            }
        }

        Ok(message)
    }

    pub fn read(buffer: &mut ReadBuffer) -> Result<Self, CodecError> {
        let kind = MessageKind::from_u8(buffer.read_u8()?)?;
        let sequence = buffer.read_u16()?;
        let flags = MessageFlags::from_bits_truncate(buffer.read_u8()?);

        let body = match kind {
            MessageKind::ConnectionRequest => MessageBody::ConnectionRequest {
                client_salt: buffer.read_u64()?,
            },
            MessageKind::ConnectionAccepted => MessageBody::ConnectionAccepted {
                prefix: buffer.read_u64()?,
                client_index: buffer.read_u16()?,
            },
            MessageKind::ConnectionDenied => MessageBody::ConnectionDenied {
                reason: DenyReason::from_u8(buffer.read_u8()?),
            },
            MessageKind::ConnectionChallenge => MessageBody::ConnectionChallenge {
                client_salt: buffer.read_u64()?,
                server_salt: buffer.read_u64()?,
            },
            MessageKind::ConnectionChallengeResponse => MessageBody::ConnectionChallengeResponse {
                prefix: buffer.read_u64()?,
            },
            MessageKind::Disconnection => MessageBody::Disconnection {
                prefix: buffer.read_u64()?,
                reason: DisconnectReason::from_u8(buffer.read_u8()?),
            },
            MessageKind::TimeRequest => MessageBody::TimeRequest {
                remote_time: buffer.read_u32()?,
            },
            MessageKind::TimeResponse => MessageBody::TimeResponse {
                remote_time: buffer.read_u32()?,
                server_time: buffer.read_u32()?,
            },
            MessageKind::Replication => {
                let action = ReplicationAction::from_u8(buffer.read_u8()?)?;
                let entity_id = buffer.read_u32()?;
                let controlled_by = buffer.read_u32()?;
                let class_id = buffer.read_u32()?;
                let len = buffer.read_u16()? as usize;
                MessageBody::Replication {
                    action,
                    entity_id,
                    controlled_by,
                    class_id,
                    data: buffer.read_bytes(len)?.to_vec(),
                }
            }
            MessageKind::Inputs => {
                let len = buffer.read_u16()? as usize;
                MessageBody::Inputs {
                    data: buffer.read_bytes(len)?.to_vec(),
                }
            }
        };

        Ok(Self {
            sequence,
            flags,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let mut buffer = WriteBuffer::with_capacity(2048);
        message.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), message.size());

        let mut reader = ReadBuffer::new(buffer.as_slice());
        let decoded = Message::read(&mut reader).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn round_trip_every_kind() {
        let bodies = [
            MessageBody::ConnectionRequest {
                client_salt: u64::MAX,
            },
            MessageBody::ConnectionAccepted {
                prefix: 0xDEAD_BEEF_CAFE_F00D,
                client_index: u16::MAX,
            },
            MessageBody::ConnectionDenied {
                reason: DenyReason::ServerFull,
            },
            MessageBody::ConnectionChallenge {
                client_salt: 0,
                server_salt: u64::MAX,
            },
            MessageBody::ConnectionChallengeResponse { prefix: 1 },
            MessageBody::Disconnection {
                prefix: 42,
                reason: DisconnectReason::Timeout,
            },
            MessageBody::TimeRequest {
                remote_time: u32::MAX,
            },
            MessageBody::TimeResponse {
                remote_time: 0,
                server_time: u32::MAX,
            },
            MessageBody::Replication {
                action: ReplicationAction::Update,
                entity_id: 7,
                controlled_by: u32::MAX,
                class_id: 3,
                data: vec![1, 2, 3, 4, 5],
            },
            MessageBody::Inputs {
                data: vec![0xFF; 64],
            },
        ];

        for (i, body) in bodies.into_iter().enumerate() {
            let mut message = Message::new(MessageFlags::RELIABLE | MessageFlags::ORDERED, body);
            message.sequence = i as u16 * 1000;
            round_trip(message);
        }
    }

    #[test]
    fn round_trip_zeroed_bodies() {
        for kind in 0..MESSAGE_KIND_COUNT as u8 {
            let kind = MessageKind::from_u8(kind).unwrap();
            round_trip(Message::new(
                MessageFlags::empty(),
                MessageBody::default_for(kind),
            ));
        }
    }

    #[test]
    fn pooled_read_matches_allocating_read() {
        let mut pool = crate::pool::MessagePool::with_capacity(2);
        let mut message = Message::new(
            MessageFlags::RELIABLE | MessageFlags::ORDERED,
            MessageBody::Replication {
                action: ReplicationAction::Create,
                entity_id: 12,
                controlled_by: 1,
                class_id: 2,
                data: vec![9, 8, 7],
            },
        );
        message.sequence = 321;

        let mut buffer = WriteBuffer::with_capacity(256);
        message.write(&mut buffer).unwrap();

        let mut reader = ReadBuffer::new(buffer.as_slice());
        let pooled = Message::read_pooled(&mut reader, &mut pool).unwrap();
        assert_eq!(pooled, message);

        let mut reader = ReadBuffer::new(buffer.as_slice());
        assert_eq!(Message::read(&mut reader).unwrap(), pooled);
    }

    #[test]
    fn kind_byte_is_first_on_the_wire() {
        let message = Message::new(
            MessageFlags::empty(),
            MessageBody::TimeRequest { remote_time: 9 },
        );
        let mut buffer = WriteBuffer::with_capacity(64);
        message.write(&mut buffer).unwrap();
        assert_eq!(buffer.as_slice()[0], MessageKind::TimeRequest as u8);
    }

    #[test]
    fn unknown_kind_byte_rejected() {
        let data = [200u8, 0, 0, 0];
        let mut reader = ReadBuffer::new(&data);
        assert_eq!(
            Message::read(&mut reader),
            Err(CodecError::UnknownKind(200))
        );
    }

    #[test]
    fn unknown_reason_bytes_decode_to_unknown() {
        assert_eq!(DisconnectReason::from_u8(250), DisconnectReason::Unknown);
        assert_eq!(DenyReason::from_u8(250), DenyReason::Unknown);
    }
}
