// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packets as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::ops::Range;

use bytes::{Buf, Bytes};

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: u16 = 12;

/// A validated view over a raw RTP packet.
///
/// Construction checks the fixed header, CSRC list, optional extension, and
/// padding; accessors then read directly from the buffer.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub struct RtpPacket {
    data: Bytes,
    payload_range: Range<u16>,
}

impl RtpPacket {
    /// Validates a raw packet.
    ///
    /// RTP doesn't define a maximum size but the transports do: UDP datagrams
    /// and interleaved frames both top out below 65,536 bytes.
    pub fn parse(data: Bytes) -> Result<Self, RtpPacketError> {
        let fail = |reason| Err(RtpPacketError { reason });
        let len = match u16::try_from(data.len()) {
            Ok(l) => l,
            Err(_) => return fail("too long"),
        };
        if len < MIN_HEADER_LEN {
            return fail("too short");
        }
        if data[0] >> 6 != 2 {
            return fail("must be version 2");
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = u16::from(data[0] & 0b0000_1111);
        let csrc_end = MIN_HEADER_LEN + 4 * csrc_count;
        let payload_start = if has_extension {
            // Fixed 4-byte extension header: 16-bit profile id, then the
            // extension length in 32-bit words (excluding the header itself).
            let Some(ext_end) = csrc_end.checked_add(4) else {
                return fail("extension is after end of packet");
            };
            if len < ext_end {
                return fail("extension is after end of packet");
            }
            let ext_words = u16::from_be_bytes([
                data[usize::from(csrc_end) + 2],
                data[usize::from(csrc_end) + 3],
            ]);
            match ext_words.checked_mul(4).and_then(|b| ext_end.checked_add(b)) {
                Some(e) => e,
                None => return fail("extension extends beyond maximum packet size"),
            }
        } else {
            csrc_end
        };
        if len < payload_start {
            return fail("payload start is after end of packet");
        }
        let payload_end = if has_padding {
            let padding_len = u16::from(data[data.len() - 1]);
            if padding_len == 0 {
                return fail("invalid padding length 0");
            }
            match len.checked_sub(padding_len) {
                Some(e) if e >= payload_start => e,
                _ => return fail("padding larger than payload"),
            }
        } else {
            len
        };
        Ok(Self {
            data,
            payload_range: payload_start..payload_end,
        })
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.data[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0b0111_1111
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// Returns only the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[usize::from(self.payload_range.start)..usize::from(self.payload_range.end)]
    }

    /// Consumes the packet, returning the payload without copying.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        let mut data = self.data;
        data.truncate(usize::from(self.payload_range.end));
        data.advance(usize::from(self.payload_range.start));
        data
    }
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("payload_type", &self.payload_type())
            .field("sequence_number", &self.sequence_number())
            .field("timestamp", &self.timestamp())
            .field("ssrc", &self.ssrc())
            .field("mark", &self.mark())
            .field("payload", &crate::hex::LimitedHex::new(self.payload(), 64))
            .finish()
    }
}

#[derive(Debug)]
pub struct RtpPacketError {
    pub reason: &'static str,
}

impl std::fmt::Display for RtpPacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.reason)
    }
}

/// Builds raw packets for tests and fixtures.
#[doc(hidden)]
pub struct RtpPacketBuilder {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub mark: bool,
}

impl RtpPacketBuilder {
    pub fn build(self, payload: &[u8]) -> Result<RtpPacket, RtpPacketError> {
        assert!(self.payload_type < 0x80, "payload type must fit in 7 bits");
        let mut data = Vec::with_capacity(usize::from(MIN_HEADER_LEN) + payload.len());
        data.push(2 << 6);
        data.push(if self.mark { 0b1000_0000 } else { 0 } | self.payload_type);
        data.extend_from_slice(&self.sequence_number.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(&self.ssrc.to_be_bytes());
        data.extend_from_slice(payload);
        RtpPacket::parse(Bytes::from(data))
    }
}
