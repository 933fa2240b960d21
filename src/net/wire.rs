use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};

use super::{
    address::{Address, ADDRESS_SIZE},
    error::FramingError,
};

pub const PACKET_VERSION: u8 = 1;

/// Hop budget given to packets originating at this node.
pub const DEFAULT_TTL: u8 = 40;

/// flags | ttl | service | channel | counter | sender | target
pub const PACKET_HEADER_SIZE: usize = 1 + 1 + 2 + 2 + 2 + 2 * ADDRESS_SIZE;

/// Routing control traffic exchanged between direct neighbours.
pub const SERVICE_ROUTING: u16 = 0;
pub const CHANNEL_ROUTING_REQUEST: u16 = 1;
pub const CHANNEL_ROUTING_REPLY: u16 = 2;

/// Remote calls and their replies.
pub const SERVICE_RPC: u16 = 1;
pub const CHANNEL_RPC_CALL: u16 = 1;
pub const CHANNEL_RPC_REPLY: u16 = 2;

/// The packet's first byte. The top three bits are flags, the low four bits
/// carry the protocol version.
///
/// - `direct` => meant for the neighbour on the other end of the connection,
///   never forwarded, target is ignored
/// - `broadcast` => flooded to every neighbour, target is ignored
/// - `exchange` => the sender expects a reply
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    const DIRECT: u8 = 0b1000_0000;
    const BROADCAST: u8 = 0b0100_0000;
    const EXCHANGE: u8 = 0b0010_0000;
    const VERSION_MASK: u8 = 0b0000_1111;

    pub fn new(direct: bool, broadcast: bool, exchange: bool) -> Self {
        let mut flags = PACKET_VERSION;
        if direct {
            flags |= Self::DIRECT;
        }
        if broadcast {
            flags |= Self::BROADCAST;
        }
        if exchange {
            flags |= Self::EXCHANGE;
        }
        Self(flags)
    }

    pub fn direct(&self) -> bool {
        self.0 & Self::DIRECT != 0
    }

    pub fn broadcast(&self) -> bool {
        self.0 & Self::BROADCAST != 0
    }

    pub fn exchange(&self) -> bool {
        self.0 & Self::EXCHANGE != 0
    }

    pub fn version(&self) -> u8 {
        self.0 & Self::VERSION_MASK
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl From<u8> for PacketFlags {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

impl std::fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFlags")
            .field("version", &self.version())
            .field("direct", &self.direct())
            .field("broadcast", &self.broadcast())
            .field("exchange", &self.exchange())
            .finish()
    }
}

/// The unit routed across the overlay, carried as the body of one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub flags: PacketFlags,
    pub ttl: u8,
    pub service: u16,
    pub channel: u16,
    /// Per-sender message counter, used to recognise echoed broadcasts.
    pub counter: u16,
    pub sender: Address,
    pub target: Address,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn is_direct(&self) -> bool {
        self.flags.direct()
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.broadcast()
    }

    pub fn is_exchange(&self) -> bool {
        self.flags.exchange()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PACKET_HEADER_SIZE];
        buf[0] = self.flags.byte();
        buf[1] = self.ttl;
        LittleEndian::write_u16(&mut buf[2..4], self.service);
        LittleEndian::write_u16(&mut buf[4..6], self.channel);
        LittleEndian::write_u16(&mut buf[6..8], self.counter);
        buf[8..8 + ADDRESS_SIZE].copy_from_slice(self.sender.as_bytes());
        buf[8 + ADDRESS_SIZE..PACKET_HEADER_SIZE].copy_from_slice(self.target.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(FramingError::Truncated {
                needed: PACKET_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let flags = PacketFlags::from(buf[0]);
        if flags.version() != PACKET_VERSION {
            return Err(FramingError::UnsupportedVersion(flags.version()));
        }
        Ok(Self {
            flags,
            ttl: buf[1],
            service: LittleEndian::read_u16(&buf[2..4]),
            channel: LittleEndian::read_u16(&buf[4..6]),
            counter: LittleEndian::read_u16(&buf[6..8]),
            sender: Address::from_bytes(*array_ref![buf, 8, ADDRESS_SIZE]),
            target: Address::from_bytes(*array_ref![buf, 8 + ADDRESS_SIZE, ADDRESS_SIZE]),
            payload: buf[PACKET_HEADER_SIZE..].to_vec(),
        })
    }
}
