//! Per-kind free-list allocator for [`Message`] instances.
//!
//! Steady-state traffic lends and reclaims messages here instead of touching
//! the heap; payload buffers keep their capacity across reuse.

use log::warn;

use crate::message::{Message, MessageBody, MessageFlags, MessageKind, MESSAGE_KIND_COUNT};

const DEFAULT_PER_KIND: usize = 32;

pub struct MessagePool {
    free: [Vec<Message>; MESSAGE_KIND_COUNT],
    per_kind_cap: usize,
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PER_KIND)
    }
}

impl MessagePool {
    /// Pre-sizes every kind's free list with `per_kind` instances.
    pub fn with_capacity(per_kind: usize) -> Self {
        let free = MessageKind::ALL.map(|kind| {
            let mut list = Vec::with_capacity(per_kind);
            list.resize_with(per_kind, || {
                Message::new(MessageFlags::empty(), MessageBody::default_for(kind))
            });
            list
        });
        Self {
            free,
            per_kind_cap: per_kind,
        }
    }

    /// Pops a free instance of `kind`, or allocates a fresh one when the list
    /// has run dry.
    pub fn lend(&mut self, kind: MessageKind) -> Message {
        match self.free[kind as usize].pop() {
            Some(message) => message,
            None => {
                warn!("message pool dry for {kind:?}, allocating");
                Message::new(MessageFlags::empty(), MessageBody::default_for(kind))
            }
        }
    }

    /// Returns a message to its kind's free list after resetting owned
    /// payload buffers.
    pub fn release(&mut self, mut message: Message) {
        message.sequence = 0;
        message.flags = MessageFlags::empty();
        match &mut message.body {
            MessageBody::Replication { data, .. } | MessageBody::Inputs { data } => data.clear(),
            _ => {}
        }

        let list = &mut self.free[message.kind() as usize];
        // Fallback allocations are not retained past the configured size.
        if list.len() < self.per_kind_cap {
            list.push(message);
        }
    }

    #[cfg(test)]
    fn free_count(&self, kind: MessageKind) -> usize {
        self.free[kind as usize].len()
    }
}
