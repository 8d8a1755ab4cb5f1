//! Wire header
//!
//! Every message starts with a fixed 32-byte little-endian header:
//!
//! | offset | size | field             |
//! |--------|------|-------------------|
//! | 0      | 2    | `version`         |
//! | 2      | 2    | `reserved`        |
//! | 4      | 2    | `responder_port`  |
//! | 6      | 2    | `flags`           |
//! | 8      | 8    | `correlation_id`  |
//! | 16     | 2    | `restart_counter` |
//! | 18     | 2    | `function_id`     |
//! | 20     | 4    | `checksum`        |
//! | 24     | 8    | `payload_len`     |
//!
//! Bits 0-1 of `flags` carry the message type. `checksum` is the constant
//! [`HEADER_MAGIC`].

use crate::error::{Error, Result};

/// Encoded header size in bytes
pub const HEADER_LEN: usize = 32;

/// Constant carried in the checksum field
pub const HEADER_MAGIC: u32 = 0xaabb_ccdd;

/// Protocol version written into outgoing headers
pub const PROTOCOL_VERSION: u16 = 1;

const MESSAGE_TYPE_MASK: u16 = 0b11;

/// Kind of message carried by a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// A request for the peer to run a registered function
    Request = 1,
    /// The answer to an earlier request
    Response = 2,
}

/// Fixed-size header preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Protocol version
    pub version: u16,
    /// Unused, written as zero
    pub reserved: u16,
    /// Port the sender listens on
    pub responder_port: u16,
    /// Message type bits and future flags
    pub flags: u16,
    /// Correlation id of the requesting frame
    pub correlation_id: u64,
    /// Sender's restart counter
    pub restart_counter: u16,
    /// Remote function identity
    pub function_id: u16,
    /// Always [`HEADER_MAGIC`]
    pub checksum: u32,
    /// Payload bytes following the header
    pub payload_len: u64,
}

impl WireHeader {
    /// Header for a new message with an empty payload
    pub fn new(
        message_type: MessageType,
        correlation_id: u64,
        function_id: u16,
        responder_port: u16,
        restart_counter: u16,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            reserved: 0,
            responder_port,
            flags: message_type as u16,
            correlation_id,
            restart_counter,
            function_id,
            checksum: HEADER_MAGIC,
            payload_len: 0,
        }
    }

    /// Message type encoded in the flags, if valid
    pub fn message_type(&self) -> Option<MessageType> {
        match self.flags & MESSAGE_TYPE_MASK {
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Response),
            _ => None,
        }
    }

    /// Encode into the start of `buf`, returning the bytes written
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < HEADER_LEN {
            return Err(Error::EncodingRange {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        buf[2..4].copy_from_slice(&self.reserved.to_le_bytes());
        buf[4..6].copy_from_slice(&self.responder_port.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.correlation_id.to_le_bytes());
        buf[16..18].copy_from_slice(&self.restart_counter.to_le_bytes());
        buf[18..20].copy_from_slice(&self.function_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload_len.to_le_bytes());
        Ok(HEADER_LEN)
    }

    /// Encode into a fresh array
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        // The array is exactly HEADER_LEN bytes long.
        let _ = self.encode_into(&mut buf);
        buf
    }

    /// Decode a header from the start of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::BadHeader {
                reason: format!("expected {} bytes, got {}", HEADER_LEN, buf.len()),
            });
        }

        let header = Self {
            version: read_u16(buf, 0),
            reserved: read_u16(buf, 2),
            responder_port: read_u16(buf, 4),
            flags: read_u16(buf, 6),
            correlation_id: read_u64(buf, 8),
            restart_counter: read_u16(buf, 16),
            function_id: read_u16(buf, 18),
            checksum: read_u32(buf, 20),
            payload_len: read_u64(buf, 24),
        };

        if header.checksum != HEADER_MAGIC {
            return Err(Error::BadHeader {
                reason: format!("bad checksum {:#010x}", header.checksum),
            });
        }
        Ok(header)
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
