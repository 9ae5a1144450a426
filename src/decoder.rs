// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0

//! Implements the packet decoder.
//!
//! The encoder emits fixed 40 byte records. Within a record, the last byte
//! is the header whose low five bits hold the payload length in bytes, the
//! eight bytes before it hold a timestamp, and the payload sits
//! right-aligned at the end of the remaining 31 byte window:
//!
//! ```text
//! [ ... padding | payload ] [ timestamp ] [ header ]
//!        31 bytes               8 bytes     1 byte
//! ```
//!
//! Payload fields are packed from the little end of the window, so the
//! bit cursor consumes them tail-first: bit `i` of a payload is bit
//! `i % 8` of the `i / 8`-th byte counted from the payload's last byte.

pub mod error;
pub mod payload;
pub mod util;


use crate::DiscoveryResponse;

use payload::{IOptions, Payload, Synchronization};

pub use error::Error;

/// Size of one encapsulated packet record in bytes.
pub const CHUNK_SIZE: usize = 40;

/// Size of the payload window within a record in bytes.
pub const PAYLOAD_AREA_LEN: usize = 31;

const PAYLOAD_LEN_MASK: u8 = 0x1f;

/// A single protocol packet emitted by the encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Timestamp from the record's header area. Read but unused as the
    /// encoder is assumed to run with time disabled.
    pub timestamp: u64,
    pub payload: Payload,
}

/// A decoder turning a stream of records into [Packet]s
///
/// The decoder is stateful across packets: support payloads communicate
/// the encoder's address mode, which determines how addresses of
/// subsequent format 1 and 2 payloads are parsed.
#[derive(Clone)]
pub struct Decoder<'d> {
    data: &'d [u8],
    pos: usize,
    ioptions: IOptions,
    discovery: DiscoveryResponse,
}

impl Decoder<'static> {
    pub fn new(discovery: DiscoveryResponse) -> Self {
        Decoder {
            data: &[],
            pos: 0,
            ioptions: IOptions::default(),
            discovery,
        }
    }
}

impl<'d> Decoder<'d> {
    /// Set the data being decoded
    pub fn with_data(self, data: &[u8]) -> Decoder<'_> {
        Decoder {
            data,
            pos: 0,
            ..self
        }
    }

    /// Number of input bytes not yet consumed
    pub fn bytes_left(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// The instruction trace options currently assumed by the parser
    pub fn ioptions(&self) -> &IOptions {
        &self.ioptions
    }

    /// Decode the next record into a packet
    ///
    /// Consumes exactly one record on success. On failure the stream
    /// position is left unspecified; decoding errors are not recoverable.
    pub fn decode_packet(&mut self) -> Result<Packet, Error> {
        let available = self.bytes_left();
        let chunk = self
            .data
            .get(self.pos..self.pos + CHUNK_SIZE)
            .ok_or(Error::TruncatedRecord { available })?;

        let header = chunk[CHUNK_SIZE - 1];
        let payload_len = usize::from(header & PAYLOAD_LEN_MASK);
        if payload_len == 0 || payload_len > PAYLOAD_AREA_LEN {
            return Err(Error::BadPayloadLength(payload_len));
        }
        // The timestamp window is written MSB first.
        let timestamp = u64::from_be_bytes(
            chunk[PAYLOAD_AREA_LEN..CHUNK_SIZE - 1]
                .try_into()
                .unwrap(),
        );

        let mut cursor = Cursor::new(&chunk[PAYLOAD_AREA_LEN - payload_len..PAYLOAD_AREA_LEN]);
        let payload = self.decode_payload(&mut cursor)?;
        self.pos += CHUNK_SIZE;
        Ok(Packet { timestamp, payload })
    }

    fn decode_payload(&mut self, cursor: &mut Cursor) -> Result<Payload, Error> {
        match cursor.read_bits(2)? as u8 {
            0b01 => {
                payload::Branch::decode(cursor, &self.ioptions, &self.discovery).map(Payload::Branch)
            }
            0b10 => payload::AddressInfo::decode_format2(cursor, &self.ioptions, &self.discovery)
                .map(Payload::Address),
            0b11 => {
                let sync = Synchronization::decode(cursor)?;
                if let Synchronization::Support(support) = &sync {
                    // Needed to parse the addresses of subsequent packets.
                    self.ioptions = support.ioptions;
                }
                Ok(Payload::Synchronization(sync))
            }
            format => Err(Error::UnsupportedFormat(format)),
        }
    }
}

/// A bit cursor consuming payload fields tail-first
pub(crate) struct Cursor<'d> {
    payload: &'d [u8],
    pos: usize,
}

impl<'d> Cursor<'d> {
    pub fn new(payload: &'d [u8]) -> Self {
        Cursor { payload, pos: 0 }
    }

    /// Length of the payload in bits
    pub fn total_bits(&self) -> usize {
        self.payload.len() * 8
    }

    fn check(&self, bit_count: usize) -> Result<(), Error> {
        if bit_count > 64 || self.pos + bit_count > self.total_bits() {
            Err(Error::ReadTooLong {
                bit_pos: self.pos,
                bit_count,
                payload_bits: self.total_bits(),
            })
        } else {
            Ok(())
        }
    }

    /// Read up to 64 bits as an unsigned value
    pub fn read_bits(&mut self, bit_count: usize) -> Result<u64, Error> {
        self.check(bit_count)?;
        let mut value = 0;
        for i in 0..bit_count {
            let pos = self.pos + i;
            let byte = self.payload[self.payload.len() - 1 - pos / 8];
            if byte >> (pos % 8) & 1 == 1 {
                value |= 1 << i;
            }
        }
        self.pos += bit_count;
        Ok(value)
    }

    pub fn read_bit(&mut self) -> Result<bool, Error> {
        self.read_bits(1).map(|bit| bit == 1)
    }

    fn skip(&mut self, bit_count: usize) -> Result<(), Error> {
        if self.pos + bit_count > self.total_bits() {
            return Err(Error::ReadTooLong {
                bit_pos: self.pos,
                bit_count,
                payload_bits: self.total_bits(),
            });
        }
        self.pos += bit_count;
        Ok(())
    }

    /// Read a field of arbitrary width, truncating to the low 64 bits
    pub fn read_wide(&mut self, bit_count: usize) -> Result<u64, Error> {
        if bit_count <= 64 {
            self.read_bits(bit_count)
        } else {
            let value = self.read_bits(64)?;
            self.skip(bit_count - 64)?;
            Ok(value)
        }
    }

    /// Read a compressed address field, extending its sign
    ///
    /// The result is the two's complement of the sign-extended field,
    /// reduced modulo 2^64, i.e. a signed delta in wrapped representation.
    pub fn read_compressed(&mut self, bit_count: usize) -> Result<u64, Error> {
        let value = self.read_wide(bit_count)?;
        Ok(util::sign_extend(value, bit_count))
    }
}

/// Decoding of a payload field or sub-structure from a [Cursor]
pub(crate) trait Decode: Sized {
    fn decode(cursor: &mut Cursor) -> Result<Self, Error>;
}
