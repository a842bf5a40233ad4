// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! depacketized as specified in [RFC 6184](https://tools.ietf.org/html/rfc6184).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, Bytes};

use super::h26x::{append_annex_b, NalAccumulator};
use super::{CodecItem, Packet, ParametersRef, VideoFrame, VideoParameters};

/// Finds access-unit boundaries and produces Annex B access units.
///
/// An access unit ends at a packet with the RTP marker bit or at a timestamp
/// change. The contents of the NAL units aren't inspected beyond their
/// headers, so compliance with H.264 section 7.4.1.2.3 isn't verified.
#[derive(Debug)]
pub struct Depacketizer {
    state: State,

    /// Complete frames ready for pull. A packet whose timestamp ends the
    /// previous access unit and whose marker bit ends its own can complete
    /// two at once.
    pending: std::collections::VecDeque<VideoFrame>,

    acc: NalAccumulator<1>,
    parameters: VideoParameters,
}

#[derive(Copy, Clone, Debug)]
enum State {
    /// Not yet processing an access unit.
    Idle,

    /// Collecting NALs for the access unit with the given timestamp.
    Accumulating { timestamp: u32, loss: u16 },

    /// Discarding the rest of an access unit after interior packet loss.
    SkipToNext { timestamp: u32, loss: u16 },

    /// A marked packet finished the access unit with the given timestamp;
    /// seeing it again is an error.
    Finished { timestamp: u32, loss: u16 },
}

impl Depacketizer {
    pub(super) fn new(
        clock_rate: u32,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        if clock_rate != 90_000 {
            return Err(format!("H.264 clock rate must be 90000, not {clock_rate}"));
        }
        let config = match format_specific_params.and_then(find_sprop_parameter_sets) {
            Some(sprop) => parse_sprop_parameter_sets(sprop)?,
            None => Bytes::new(), // parameters may arrive in-band instead
        };
        Ok(Depacketizer {
            state: State::Idle,
            pending: std::collections::VecDeque::new(),
            acc: NalAccumulator::new(),
            parameters: VideoParameters {
                codec: "H264".to_owned(),
                clock_rate,
                config,
            },
        })
    }

    pub(super) fn parameters(&self) -> Option<ParametersRef<'_>> {
        Some(ParametersRef::Video(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: Packet) -> Result<(), String> {
        assert!(self.pending.is_empty(), "push before pull is exhausted");
        let r = self.push_inner(pkt);
        if r.is_err() {
            self.acc.clear();
            self.state = State::Idle;
        }
        r
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.pop_front().map(CodecItem::VideoFrame)
    }

    fn push_inner(&mut self, pkt: Packet) -> Result<(), String> {
        let seq = pkt.sequence_number;
        let (timestamp, mut loss) = match self.state {
            State::Idle => (pkt.timestamp, pkt.loss),
            State::Accumulating { timestamp, loss } => {
                if pkt.loss > 0 {
                    // Reassembly state doesn't survive a sequence gap.
                    self.acc.clear();
                    if timestamp == pkt.timestamp {
                        self.state = if pkt.mark {
                            State::Finished {
                                timestamp,
                                loss: pkt.loss,
                            }
                        } else {
                            State::SkipToNext {
                                timestamp,
                                loss: pkt.loss,
                            }
                        };
                        return Ok(());
                    }
                    (pkt.timestamp, pkt.loss)
                } else if timestamp != pkt.timestamp {
                    if self.acc.open_fragment_hdr().is_some() {
                        return Err(format!(
                            "timestamp changed from {timestamp} to {} mid-fragment at seq={seq:04x}",
                            pkt.timestamp
                        ));
                    }
                    let frame = self.finalize(timestamp, loss)?;
                    self.pending.push_back(frame);
                    (pkt.timestamp, 0)
                } else {
                    (timestamp, loss)
                }
            }
            State::SkipToNext { timestamp, loss } => {
                if pkt.timestamp == timestamp {
                    self.state = State::SkipToNext {
                        timestamp,
                        loss: loss.saturating_add(pkt.loss),
                    };
                    return Ok(());
                }
                (pkt.timestamp, loss.saturating_add(pkt.loss))
            }
            State::Finished { timestamp, loss } => {
                if timestamp == pkt.timestamp {
                    return Err(format!(
                        "packet at seq={seq:04x} repeats timestamp {timestamp} of a marked packet"
                    ));
                }
                (pkt.timestamp, loss.saturating_add(pkt.loss))
            }
        };

        let mut data = pkt.payload;
        if data.is_empty() {
            return Err(format!("empty NAL at seq={seq:04x}"));
        }
        let indicator = data[0];
        if indicator >> 7 != 0 {
            return Err(format!("NAL header has F bit set at seq={seq:04x}"));
        }
        data.advance(1);
        match indicator & 0b11111 {
            1..=23 => {
                if self.acc.open_fragment_hdr().is_some() {
                    return Err(format!(
                        "single NAL while fragment in progress at seq={seq:04x}"
                    ));
                }
                self.acc.push_whole([indicator], data)?;
            }
            24 => self.push_aggregate(data, 0, seq)?, // STAP-A
            25 => {
                // STAP-B carries a 16-bit DON before the aggregation units.
                if data.remaining() < 2 {
                    return Err(format!("STAP-B too short at seq={seq:04x}"));
                }
                data.advance(2);
                self.push_aggregate(data, 0, seq)?;
            }
            26 => {
                // MTAP16: 16-bit DONB, then per-unit DOND + 16-bit TS offset.
                if data.remaining() < 2 {
                    return Err(format!("MTAP16 too short at seq={seq:04x}"));
                }
                data.advance(2);
                self.push_aggregate(data, 3, seq)?;
            }
            27 => {
                // MTAP24, as MTAP16 but with a 24-bit TS offset.
                if data.remaining() < 2 {
                    return Err(format!("MTAP24 too short at seq={seq:04x}"));
                }
                data.advance(2);
                self.push_aggregate(data, 4, seq)?;
            }
            28 | 29 => {
                // FU-A / FU-B fragmentation units.
                if data.len() < 2 {
                    return Err(format!("FU too short at seq={seq:04x}"));
                }
                let fu_header = data[0];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let reserved = (fu_header & 0b0010_0000) != 0;
                if (start && end) || reserved {
                    return Err(format!("invalid FU header {fu_header:08b} at seq={seq:04x}"));
                }
                data.advance(1);
                if indicator & 0b11111 == 29 {
                    // FU-B exists only as the first fragment and carries a DON.
                    if !start || data.len() < 2 {
                        return Err(format!("bad FU-B at seq={seq:04x}"));
                    }
                    data.advance(2);
                }
                let hdr = (indicator & 0b0110_0000) | (fu_header & 0b0001_1111);
                match (start, self.acc.open_fragment_hdr()) {
                    (true, Some(_)) => {
                        return Err(format!(
                            "FU start while fragment in progress at seq={seq:04x}"
                        ));
                    }
                    (true, None) => self.acc.begin_fragment([hdr], data)?,
                    (false, Some(open_hdr)) => {
                        if open_hdr != [hdr] {
                            return Err(format!(
                                "FU has inconsistent NAL type: {:02x} then {hdr:02x} at seq={seq:04x}",
                                open_hdr[0]
                            ));
                        }
                        self.acc.continue_fragment(data, end)?;
                        if !end && pkt.mark {
                            return Err(format!("FU with mark but no end at seq={seq:04x}"));
                        }
                    }
                    (false, None) => {
                        if loss > 0 {
                            // The start of this fragment was lost; skip ahead.
                            self.acc.clear();
                            self.state = State::SkipToNext {
                                timestamp,
                                loss,
                            };
                            return Ok(());
                        }
                        return Err(format!(
                            "FU continuation without a start at seq={seq:04x}"
                        ));
                    }
                }
            }
            t => return Err(format!("bad NAL type {t} at seq={seq:04x}")),
        }

        self.state = if pkt.mark {
            let frame = self.finalize(timestamp, loss)?;
            self.pending.push_back(frame);
            State::Finished { timestamp, loss: 0 }
        } else {
            State::Accumulating { timestamp, loss }
        };
        Ok(())
    }

    /// Handles the shared portion of STAP/MTAP aggregation packets:
    /// a run of `(16-bit size, skip bytes, NAL)` units.
    fn push_aggregate(&mut self, mut data: Bytes, skip: usize, seq: u16) -> Result<(), String> {
        if self.acc.open_fragment_hdr().is_some() {
            return Err(format!(
                "aggregation packet while fragment in progress at seq={seq:04x}"
            ));
        }
        if data.is_empty() {
            return Err(format!("empty aggregation packet at seq={seq:04x}"));
        }
        while !data.is_empty() {
            if data.remaining() < 2 {
                return Err(format!(
                    "aggregation unit truncated before size at seq={seq:04x}"
                ));
            }
            let size = usize::from(data.get_u16());
            // For MTAPs the size covers the DOND and TS offset fields too.
            if size <= skip || data.remaining() < size {
                return Err(format!(
                    "bad aggregation unit size {size} at seq={seq:04x}"
                ));
            }
            data.advance(skip);
            let mut nal = data.split_to(size - skip);
            let hdr = nal[0];
            if hdr >> 7 != 0 {
                return Err(format!("aggregated NAL has F bit set at seq={seq:04x}"));
            }
            nal.advance(1);
            self.acc.push_whole([hdr], nal)?;
        }
        Ok(())
    }

    fn finalize(&mut self, timestamp: u32, loss: u16) -> Result<VideoFrame, String> {
        if self.acc.open_fragment_hdr().is_some() {
            return Err("access unit ended with an unterminated fragment".to_owned());
        }
        if self.acc.is_empty() {
            return Err("access unit ended with no NALs".to_owned());
        }
        let is_random_access_point = self
            .acc
            .nal_headers()
            .any(|h| h[0] & 0b11111 == 5); // IDR slice
        Ok(VideoFrame {
            timestamp,
            loss,
            is_random_access_point,
            data: self.acc.take_annex_b(),
        })
    }
}

fn find_sprop_parameter_sets(format_specific_params: &str) -> Option<&str> {
    format_specific_params
        .split(';')
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| *k == "sprop-parameter-sets")
        .map(|(_, v)| v)
}

/// Decodes `sprop-parameter-sets` into Annex B configuration bytes.
fn parse_sprop_parameter_sets(sprop: &str) -> Result<Bytes, String> {
    let mut nals = Vec::new();
    for part in sprop.split(',') {
        let nal = BASE64
            .decode(part)
            .map_err(|_| format!("invalid base64 in sprop-parameter-sets: {part:?}"))?;
        if nal.is_empty() {
            return Err("empty NAL in sprop-parameter-sets".to_owned());
        }
        // Some cameras leave Annex B start codes at the end of each set;
        // strip them rather than doubling up.
        let nal = match nal.strip_suffix(b"\x00\x00\x00\x01") {
            Some(stripped) => stripped.to_vec(),
            None => nal,
        };
        nals.push(nal);
    }
    let mut out = Vec::new();
    append_annex_b(&mut out, &nals);
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_ok(d: &mut Depacketizer, seq: u16, timestamp: u32, mark: bool, payload: &'static [u8]) {
        d.push(Packet {
            sequence_number: seq,
            timestamp,
            mark,
            loss: 0,
            payload: Bytes::from_static(payload),
        })
        .unwrap();
    }

    fn pull_video(d: &mut Depacketizer) -> VideoFrame {
        match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            o => panic!("expected video frame, got {o:?}"),
        }
    }

    #[test]
    fn depacketize_single_stap_and_fu() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        push_ok(&mut d, 0, 1000, false, b"\x06plain");
        assert!(d.pull().is_none());
        push_ok(
            &mut d,
            1,
            1000,
            false,
            b"\x18\x00\x09\x06stap-a 1\x00\x09\x06stap-a 2",
        );
        assert!(d.pull().is_none());
        push_ok(&mut d, 2, 1000, false, b"\x7c\x86fu-a start, ");
        push_ok(&mut d, 3, 1000, false, b"\x7c\x06fu-a middle, ");
        push_ok(&mut d, 4, 1000, true, b"\x7c\x46fu-a end");
        let frame = pull_video(&mut d);
        assert_eq!(frame.timestamp(), 1000);
        // The FU fragments concatenate into one NAL behind its reconstructed
        // header (type 6 from the FU header, ref idc from the indicator).
        assert_eq!(
            frame.data(),
            b"\x00\x00\x00\x01\x06plain\
              \x00\x00\x00\x01\x06stap-a 1\
              \x00\x00\x00\x01\x06stap-a 2\
              \x00\x00\x00\x01\x66fu-a start, fu-a middle, fu-a end"
        );
    }

    #[test]
    fn timestamp_change_ends_access_unit() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        // Some cameras never set the marker bit; the next timestamp flushes.
        push_ok(&mut d, 0, 1000, false, b"\x65idr");
        assert!(d.pull().is_none());
        push_ok(&mut d, 1, 4000, false, b"\x41p-frame");
        let frame = pull_video(&mut d);
        assert_eq!(frame.timestamp(), 1000);
        assert!(frame.is_random_access_point());
        assert_eq!(frame.data(), b"\x00\x00\x00\x01\x65idr");
    }

    #[test]
    fn loss_discards_partial_access_unit() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        push_ok(&mut d, 0, 1000, false, b"\x7c\x85fu start");
        d.push(Packet {
            sequence_number: 5,
            timestamp: 1000,
            mark: true,
            loss: 4,
            payload: Bytes::from_static(b"\x7c\x45fu end"),
        })
        .unwrap();
        assert!(d.pull().is_none());
        // The next access unit carries the loss count.
        push_ok(&mut d, 6, 2000, true, b"\x65idr");
        let frame = pull_video(&mut d);
        assert_eq!(frame.loss(), 4);
    }

    #[test]
    fn mtap16() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        // DONB, then one unit: size=9 (DOND + TS offset + 6-byte NAL).
        push_ok(
            &mut d,
            0,
            1000,
            true,
            b"\x1a\x00\x00\x00\x09\x00\x00\x00\x06mtap1",
        );
        let frame = pull_video(&mut d);
        assert_eq!(frame.data(), b"\x00\x00\x00\x01\x06mtap1");
    }

    #[test]
    fn sprop_config() {
        let d = Depacketizer::new(
            90_000,
            Some("packetization-mode=1;sprop-parameter-sets=Z0IAH6tAUB7TcBAQEACA,aM48gA=="),
        )
        .unwrap();
        let params = match d.parameters() {
            Some(ParametersRef::Video(p)) => p,
            o => panic!("expected video parameters, got {o:?}"),
        };
        let sps = BASE64.decode("Z0IAH6tAUB7TcBAQEACA").unwrap();
        let pps = BASE64.decode("aM48gA==").unwrap();
        let mut expected = Vec::new();
        append_annex_b(&mut expected, &[sps, pps]);
        assert_eq!(params.config(), &expected[..]);
    }

    #[test]
    fn rejects_f_bit_and_bad_clock() {
        assert!(Depacketizer::new(8_000, None).is_err());
        let mut d = Depacketizer::new(90_000, None).unwrap();
        assert!(d
            .push(Packet {
                sequence_number: 0,
                timestamp: 0,
                mark: true,
                loss: 0,
                payload: Bytes::from_static(b"\xe5bad"),
            })
            .is_err());
        // The depacketizer keeps working afterward.
        push_ok(&mut d, 1, 3000, true, b"\x65ok");
        assert_eq!(pull_video(&mut d).data(), b"\x00\x00\x00\x01\x65ok");
    }

    #[test]
    fn sequence_wraparound_keeps_fragment() {
        // Reassembly carries across the 16-bit sequence boundary; loss
        // detection is the caller's via wrapping arithmetic.
        let mut d = Depacketizer::new(90_000, None).unwrap();
        push_ok(&mut d, 0xffff, 1000, false, b"\x7c\x85wrap ");
        push_ok(&mut d, 0x0000, 1000, true, b"\x7c\x45around");
        let frame = pull_video(&mut d);
        assert_eq!(frame.data(), b"\x00\x00\x00\x01\x65wrap around");
    }
}
