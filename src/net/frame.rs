//! Length-prefixed framing of the raw byte stream.
//!
//! Every message on the wire is `magic:u64le | length:u64le | body[length]`.
//! The magic doubles as a cheap check that both ends speak the same network.

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};

use super::error::FramingError;

pub const HEADER_SIZE: usize = 2 * std::mem::size_of::<u64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u64,
    pub length: u64,
}

impl FrameHeader {
    pub fn new(magic: u64, length: u64) -> Self {
        Self { magic, length }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.magic);
        LittleEndian::write_u64(&mut buf[8..16], self.length);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: LittleEndian::read_u64(&buf[0..8]),
            length: LittleEndian::read_u64(&buf[8..16]),
        }
    }

    /// Checks the header against what this end expects and returns the body
    /// length.
    pub fn validate(&self, magic: u64, max_len: u64) -> Result<usize, FramingError> {
        if self.magic != magic {
            return Err(FramingError::BadMagic {
                expected: magic,
                actual: self.magic,
            });
        }
        if self.length > max_len || usize::try_from(self.length).is_err() {
            return Err(FramingError::TooLarge {
                length: self.length,
                limit: max_len,
            });
        }
        Ok(self.length as usize)
    }
}

/// Header and body in one contiguous buffer so the writer issues a single
/// write per message.
pub fn encode_frame(magic: u64, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&FrameHeader::new(magic, body.len() as u64).encode());
    buf.extend_from_slice(body);
    buf
}

/// Which part of a frame the reader is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Header,
    Body { expected: usize },
}

/// Read side of a connection as a plain state machine: bytes go in, whole
/// frames come out. It knows nothing about sockets, so it is driven by the
/// connection's reader task and by tests alike.
///
/// A framing error poisons the decoder; the stream cannot be trusted after a
/// bad header, so every later call returns the same error.
pub struct FrameDecoder {
    magic: u64,
    max_len: u64,
    buffer: Vec<u8>,
    /// Start of the unconsumed bytes in `buffer`.
    consumed: usize,
    phase: ReadPhase,
    poisoned: Option<FramingError>,
}

impl FrameDecoder {
    pub fn new(magic: u64, max_len: u64) -> Self {
        Self {
            magic,
            max_len,
            buffer: Vec::new(),
            consumed: 0,
            phase: ReadPhase::Header,
            poisoned: None,
        }
    }

    /// Appends received bytes. Consumed bytes are dropped once they fill at
    /// least half the buffer.
    pub fn push(&mut self, data: &[u8]) {
        if self.consumed == self.buffer.len() {
            self.buffer.clear();
            self.consumed = 0;
        } else if self.consumed * 2 >= self.buffer.len() {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    fn unread(&self) -> &[u8] {
        &self.buffer[self.consumed..]
    }

    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    /// Bytes received but not yet part of a completed frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Returns the next complete frame body, or `None` if more bytes are
    /// needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if let Some(error) = &self.poisoned {
            return Err(error.clone());
        }

        let expected = match self.phase {
            ReadPhase::Body { expected } => expected,
            ReadPhase::Header => {
                if self.buffered() < HEADER_SIZE {
                    return Ok(None);
                }
                let header = FrameHeader::decode(array_ref![self.unread(), 0, HEADER_SIZE]);
                let expected = match header.validate(self.magic, self.max_len) {
                    Ok(len) => len,
                    Err(error) => {
                        self.poisoned = Some(error.clone());
                        return Err(error);
                    }
                };
                self.consumed += HEADER_SIZE;
                self.phase = ReadPhase::Body { expected };
                expected
            }
        };

        if self.buffered() < expected {
            return Ok(None);
        }
        let body = self.unread()[..expected].to_vec();
        self.consumed += expected;
        self.phase = ReadPhase::Header;
        Ok(Some(body))
    }
}
