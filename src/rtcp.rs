// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP compound packets as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).

/// RTCP packet type constants.
pub const TYPE_SENDER_REPORT: u8 = 200;
pub const TYPE_RECEIVER_REPORT: u8 = 201;
pub const TYPE_SOURCE_DESCRIPTION: u8 = 202;
pub const TYPE_BYE: u8 = 203;
pub const TYPE_APP: u8 = 204;
pub const TYPE_EXTENDED_REPORT: u8 = 207;

const COMMON_HEADER_LEN: usize = 4;

/// A generic RTCP packet, not parsed as any particular payload type.
///
/// Packets chain within a compound datagram; [`PacketRef::parse`] splits one
/// off the front, length-driven.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|   RC    |   PT          |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone)]
pub struct PacketRef<'a> {
    buf: &'a [u8],
    payload_end: usize,
}

impl<'a> PacketRef<'a> {
    /// Parses a buffer into one packet and the rest, validating only the
    /// version, padding, and length fields.
    pub fn parse(buf: &'a [u8]) -> Result<(Self, &'a [u8]), String> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(format!(
                "RTCP packets must be at least {COMMON_HEADER_LEN} bytes; have only {}",
                buf.len()
            ));
        }
        let ver = buf[0] >> 6;
        if ver != 2 {
            return Err(format!("RTCP packets must be version 2; got {ver}"));
        }

        // The header length field is in 32-bit words, minus one.
        let raw_len = u16::from_be_bytes([buf[2], buf[3]]);
        let len = (usize::from(raw_len) + 1) * 4;
        if buf.len() < len {
            return Err(format!(
                "RTCP packet header claims {len} bytes; have only {}",
                buf.len()
            ));
        }
        let (this, rest) = buf.split_at(len);
        let payload_end = if (this[0] & 0b0010_0000) != 0 {
            if raw_len == 0 {
                return Err("RTCP packet has padding but len=0".to_owned());
            }
            let padding = usize::from(this[len - 1]);
            if padding == 0 || padding > len - COMMON_HEADER_LEN {
                return Err(format!(
                    "RTCP packet of len {len} states invalid {padding} padding bytes"
                ));
            }
            len - padding
        } else {
            len
        };
        Ok((
            PacketRef {
                buf: this,
                payload_end,
            },
            rest,
        ))
    }

    /// Returns the uninterpreted payload type.
    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.buf[1]
    }

    /// Returns the low 5 bits of the first octet, typically a report count.
    #[inline]
    pub fn count(&self) -> u8 {
        self.buf[0] & 0b0001_1111
    }

    #[inline]
    pub fn has_padding(&self) -> bool {
        (self.buf[0] & 0b0010_0000) != 0
    }

    /// Returns the full raw data, including header and padding.
    #[inline]
    pub fn raw(&self) -> &'a [u8] {
        self.buf
    }

    /// Parses as a sender report, if the type matches.
    pub fn as_sender_report(self) -> Result<Option<SenderReportRef<'a>>, String> {
        if self.payload_type() == TYPE_SENDER_REPORT {
            return Ok(Some(SenderReportRef::validate(self)?));
        }
        Ok(None)
    }
}

/// Iterates over the packets of a validated compound datagram.
pub fn iterate(raw: &[u8]) -> impl Iterator<Item = Result<PacketRef<'_>, String>> {
    let mut rest = raw;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match PacketRef::parse(rest) {
            Ok((pkt, r)) => {
                rest = r;
                Some(Ok(pkt))
            }
            Err(e) => {
                rest = &[];
                Some(Err(e))
            }
        }
    })
}

/// A sender report, as defined in
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
///
/// Provides the NTP↔RTP timestamp correspondence used to map frames to wall
/// clock.
pub struct SenderReportRef<'a>(PacketRef<'a>);

impl<'a> SenderReportRef<'a> {
    fn validate(pkt: PacketRef<'a>) -> Result<Self, String> {
        const HEADER_LEN: usize = 8;
        const SENDER_INFO_LEN: usize = 20;
        const REPORT_BLOCK_LEN: usize = 24;
        let expected = HEADER_LEN + SENDER_INFO_LEN + usize::from(pkt.count()) * REPORT_BLOCK_LEN;
        if pkt.payload_end < expected {
            return Err(format!(
                "RTCP SR has invalid count={} with unpadded_byte_len={}",
                pkt.count(),
                pkt.payload_end
            ));
        }
        Ok(Self(pkt))
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[4..8].try_into().expect("4-byte slice"))
    }

    /// The full 64-bit NTP timestamp.
    #[inline]
    pub fn ntp_timestamp(&self) -> crate::NtpTimestamp {
        crate::NtpTimestamp(u64::from_be_bytes(
            self.0.buf[8..16].try_into().expect("8-byte slice"),
        ))
    }

    /// The most significant (integer seconds) word of the NTP timestamp.
    #[inline]
    pub fn ntp_seconds(&self) -> u32 {
        (self.ntp_timestamp().0 >> 32) as u32
    }

    /// The least significant (fractional) word of the NTP timestamp.
    #[inline]
    pub fn ntp_fraction(&self) -> u32 {
        self.ntp_timestamp().0 as u32
    }

    #[inline]
    pub fn rtp_timestamp(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[16..20].try_into().expect("4-byte slice"))
    }

    #[inline]
    pub fn packet_count(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[20..24].try_into().expect("4-byte slice"))
    }

    #[inline]
    pub fn octet_count(&self) -> u32 {
        u32::from_be_bytes(self.0.buf[24..28].try_into().expect("4-byte slice"))
    }
}

impl<'a> std::ops::Deref for SenderReportRef<'a> {
    type Target = PacketRef<'a>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Builds an empty receiver report: V=2, P=0, RC=0, PT=201, length=1, then
/// the sender's SSRC. Sent in reply to each received sender report.
pub fn empty_receiver_report(sender_ssrc: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = 2 << 6;
    out[1] = TYPE_RECEIVER_REPORT;
    out[3] = 1; // length in words, minus one
    out[4..8].copy_from_slice(&sender_ssrc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_sr_and_sdes() {
        // A sender report followed by a source description, as an IP camera
        // would send alongside its video stream.
        let buf = b"\x80\xc8\x00\x06\x3f\x2d\x9c\x01\
                    \xe8\x91\x30\x40\x80\x00\x00\x00\
                    \x00\x01\x86\xa0\x00\x00\x01\x2c\
                    \x00\x04\x93\xe0\
                    \x81\xca\x00\x04\x3f\x2d\x9c\x01\
                    \x01\x06\x28\x6e\x6f\x6e\x65\x29\
                    \x00\x00\x00\x00";
        let mut it = iterate(buf);
        let sr = it
            .next()
            .unwrap()
            .unwrap()
            .as_sender_report()
            .unwrap()
            .unwrap();
        assert_eq!(sr.ssrc(), 0x3f2d_9c01);
        assert_eq!(sr.ntp_timestamp(), crate::NtpTimestamp(0xe891_3040_8000_0000));
        assert_eq!(sr.ntp_seconds(), 0xe891_3040);
        assert_eq!(sr.ntp_fraction(), 0x8000_0000);
        assert_eq!(sr.rtp_timestamp(), 100_000);
        assert_eq!(sr.packet_count(), 300);
        assert_eq!(sr.octet_count(), 300_000);
        let sdes = it.next().unwrap().unwrap();
        assert_eq!(sdes.payload_type(), TYPE_SOURCE_DESCRIPTION);
        assert!(it.next().is_none());
    }

    #[test]
    fn padding() {
        let buf = b"\xa3\x00\x00\x02body\x00\x00\x00\x04more";
        let (pkt, rest) = PacketRef::parse(buf).unwrap();
        assert_eq!(pkt.count(), 3);
        assert_eq!(&pkt.buf[4..pkt.payload_end], b"body");
        assert_eq!(rest, b"more");
    }

    #[test]
    fn truncated() {
        assert!(PacketRef::parse(b"\x80\xc8\x00\x06\x66").is_err());
        assert!(PacketRef::parse(b"\x40\xc8\x00\x00").is_err()); // version 1
    }

    #[test]
    fn receiver_report_shape() {
        let rr = empty_receiver_report(0x1234_5678);
        assert_eq!(&rr, b"\x80\xc9\x00\x01\x12\x34\x56\x78");
        // It must itself parse as a well-formed RTCP packet.
        let (pkt, rest) = PacketRef::parse(&rr).unwrap();
        assert_eq!(pkt.payload_type(), TYPE_RECEIVER_REPORT);
        assert_eq!(pkt.count(), 0);
        assert!(rest.is_empty());
    }
}
