// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Decoder-specific error types

use std::fmt;

/// Packet decoding errors
///
/// The packet stream is a binary protocol; every one of these is fatal for
/// the remainder of the stream since field boundaries cannot be recovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes than a whole record are left in the input
    TruncatedRecord { available: usize },
    /// The header reports a payload length outside the payload window
    BadPayloadLength(usize),
    /// The payload format is not supported by this decoder
    UnsupportedFormat(u8),
    /// A field read would run past the end of the payload
    ReadTooLong {
        bit_pos: usize,
        bit_count: usize,
        payload_bits: usize,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedRecord { available } => {
                write!(f, "Only {available} bytes left, expected a whole record")
            }
            Self::BadPayloadLength(len) => write!(f, "Bad payload length of {len} bytes"),
            Self::UnsupportedFormat(format) => write!(f, "Unsupported packet format {format}"),
            Self::ReadTooLong {
                bit_pos,
                bit_count,
                payload_bits,
            } => write!(
                f,
                "Read of {bit_count} bits at {bit_pos} exceeds payload of {payload_bits} bits",
            ),
        }
    }
}
