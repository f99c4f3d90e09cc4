//! Wire-format definitions for RUDP segments.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (version, type, sequence, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning a
//!   [`DecodeError`] for truncated or foreign input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |     Type      |     Sequence Number (hi)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Sequence Number (lo)      |          Payload ...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 6 bytes.

use thiserror::Error;

/// Protocol version implemented by this crate.
pub const VERSION: u8 = 1;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 6;

/// Default upper bound on the payload carried by one segment.
pub const MAX_SEGMENT_SIZE: usize = 1000;

// Byte offsets of each field within the serialised header.
const OFF_VERSION: usize = 0;
const OFF_TYPE: usize = 1;
const OFF_SEQ: usize = 2;

/// Segment kind carried in the `type` header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Opens a sequence space; its sequence number is the sender's ISN.
    Syn = 1,
    /// Cumulative acknowledgement of every sequence number up to and
    /// including the one carried.
    Ack = 2,
    /// Application payload.
    Data = 3,
    /// Closes the sender's sequence space.
    Fin = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Syn),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Data),
            4 => Ok(Self::Fin),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Syn => "SYN",
            Self::Ack => "ACK",
            Self::Data => "DATA",
            Self::Fin => "FIN",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram: header fields + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version tag; [`VERSION`] for every packet this crate builds.
    pub version: u8,
    pub kind: PacketType,
    /// Sequence number in the sender's sequence space (or, for ACKs, the
    /// last contiguous sequence number received from the peer).
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    fn control(kind: PacketType, seq: u32) -> Self {
        Self {
            version: VERSION,
            kind,
            seq,
            payload: Vec::new(),
        }
    }

    pub fn syn(seq: u32) -> Self {
        Self::control(PacketType::Syn, seq)
    }

    pub fn ack(seq: u32) -> Self {
        Self::control(PacketType::Ack, seq)
    }

    pub fn fin(seq: u32) -> Self {
        Self::control(PacketType::Fin, seq)
    }

    pub fn data(seq: u32, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            kind: PacketType::Data,
            seq,
            payload,
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_VERSION] = self.version;
        buf[OFF_TYPE] = self.kind as u8;
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the version byte is not [`VERSION`], or
    /// - the type byte is not one of the four [`PacketType`]s.
    ///
    /// Payload length is not checked against any segment limit; the caller
    /// applies its own MTU policy.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::MalformedHeader { len: buf.len() });
        }

        let version = buf[OFF_VERSION];
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let kind = PacketType::try_from(buf[OFF_TYPE])?;
        let seq = u32::from_be_bytes([
            buf[OFF_SEQ],
            buf[OFF_SEQ + 1],
            buf[OFF_SEQ + 2],
            buf[OFF_SEQ + 3],
        ]);

        Ok(Packet {
            version,
            kind,
            seq,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Reads the packet type of an encoded datagram without decoding the rest.
pub fn peek_type(buf: &[u8]) -> Option<PacketType> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    PacketType::try_from(buf[OFF_TYPE]).ok()
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram of {len} bytes is shorter than the {}-byte header", HEADER_LEN)]
    MalformedHeader { len: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

// ---------------------------------------------------------------------------
// Sequence-number arithmetic
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
///
/// Valid as long as the two values are less than `u32::MAX / 2` apart.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Strict variant of [`seq_le`].
#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}
