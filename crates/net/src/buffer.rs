//! Fixed-width binary read/write primitives over byte buffers.
//!
//! All multi-byte integers are little-endian on the wire. Floats travel as
//! their IEEE-754 bit pattern.

use crate::error::CodecError;

/// A write cursor over a fixed-capacity byte buffer.
///
/// Writes past the capacity fail with [`CodecError::Overflow`] instead of
/// growing the buffer, so a packet can never exceed the datagram size it was
/// sized for.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl WriteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    fn check(&self, needed: usize) -> Result<(), CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::Overflow {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.check(1)?;
        self.data.push(value);
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), CodecError> {
        self.check(2)?;
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), CodecError> {
        self.check(4)?;
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), CodecError> {
        self.check(8)?;
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<(), CodecError> {
        self.write_u32(value.to_bits())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.check(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

/// A read cursor over a received datagram.
#[derive(Debug)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::Underflow {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.cursor..self.cursor + needed];
        self.cursor += needed;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }
}
