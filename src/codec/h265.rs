// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video, depacketized
//! as specified in [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, Bytes};

use super::h26x::{append_annex_b, NalAccumulator};
use super::{CodecItem, Packet, ParametersRef, VideoFrame, VideoParameters};

const NAL_TYPE_AP: u8 = 48;
const NAL_TYPE_FU: u8 = 49;

/// Finds access-unit boundaries and produces Annex B access units.
///
/// Handles single NAL unit packets, aggregation packets (AP), and
/// fragmentation units (FU). DONL/DOND fields are consumed (but decoding
/// order is not restored) when the SDP signals `sprop-max-don-diff > 0`.
#[derive(Debug)]
pub struct Depacketizer {
    state: State,
    pending: std::collections::VecDeque<VideoFrame>,
    acc: NalAccumulator<2>,
    parameters: VideoParameters,

    /// True when `sprop-max-don-diff > 0`: aggregation units and first
    /// fragments carry decoding-order numbers.
    using_donl: bool,
}

#[derive(Copy, Clone, Debug)]
enum State {
    Idle,
    Accumulating { timestamp: u32, loss: u16 },
    SkipToNext { timestamp: u32, loss: u16 },
    Finished { timestamp: u32, loss: u16 },
}

fn nal_type(hdr: [u8; 2]) -> u8 {
    (hdr[0] >> 1) & 0x3f
}

impl Depacketizer {
    pub(super) fn new(
        clock_rate: u32,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        if clock_rate != 90_000 {
            return Err(format!("H.265 clock rate must be 90000, not {clock_rate}"));
        }
        let mut vps = None;
        let mut sps = None;
        let mut pps = None;
        let mut using_donl = false;
        if let Some(params) = format_specific_params {
            for p in params.split(';') {
                let Some((key, value)) = p.trim().split_once('=') else {
                    continue;
                };
                match key {
                    "sprop-vps" => vps = Some(decode_sprop_nal(value)?),
                    "sprop-sps" => sps = Some(decode_sprop_nal(value)?),
                    "sprop-pps" => pps = Some(decode_sprop_nal(value)?),
                    "sprop-max-don-diff" => {
                        using_donl = u32::from_str_radix(value.trim(), 10)
                            .map_err(|_| format!("bad sprop-max-don-diff {value:?}"))?
                            > 0;
                    }
                    _ => {}
                }
            }
        }
        let mut config = Vec::new();
        append_annex_b(
            &mut config,
            &[vps, sps, pps].into_iter().flatten().collect::<Vec<_>>(),
        );
        Ok(Depacketizer {
            state: State::Idle,
            pending: std::collections::VecDeque::new(),
            acc: NalAccumulator::new(),
            parameters: VideoParameters {
                codec: "H265".to_owned(),
                clock_rate,
                config: Bytes::from(config),
            },
            using_donl,
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
        let (timestamp, loss) = match self.state {
            State::Idle => (pkt.timestamp, pkt.loss),
            State::Accumulating { timestamp, loss } => {
                if pkt.loss > 0 {
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
        if data.len() < 2 {
            return Err(format!("H.265 payload too short at seq={seq:04x}"));
        }
        let payload_hdr = [data[0], data[1]];
        if payload_hdr[0] >> 7 != 0 {
            return Err(format!("forbidden zero bit set at seq={seq:04x}"));
        }
        data.advance(2);
        match nal_type(payload_hdr) {
            NAL_TYPE_AP => {
                if self.acc.open_fragment_hdr().is_some() {
                    return Err(format!("AP while fragment in progress at seq={seq:04x}"));
                }
                let mut first = true;
                if data.is_empty() {
                    return Err(format!("empty AP at seq={seq:04x}"));
                }
                while !data.is_empty() {
                    if self.using_donl {
                        // DONL on the first unit, DOND on the rest.
                        let skip = if first { 2 } else { 1 };
                        if data.remaining() < skip {
                            return Err(format!("AP truncated at DON at seq={seq:04x}"));
                        }
                        data.advance(skip);
                    }
                    if data.remaining() < 2 {
                        return Err(format!("AP truncated before size at seq={seq:04x}"));
                    }
                    let size = usize::from(data.get_u16());
                    if size < 2 || data.remaining() < size {
                        return Err(format!("bad AP unit size {size} at seq={seq:04x}"));
                    }
                    let mut nal = data.split_to(size);
                    let hdr = [nal[0], nal[1]];
                    nal.advance(2);
                    self.acc.push_whole(hdr, nal)?;
                    first = false;
                }
            }
            NAL_TYPE_FU => {
                if data.is_empty() {
                    return Err(format!("FU too short at seq={seq:04x}"));
                }
                let fu_header = data[0];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let fu_type = fu_header & 0b0011_1111;
                if start && end {
                    return Err(format!("FU with both S and E at seq={seq:04x}"));
                }
                data.advance(1);
                if start && self.using_donl {
                    if data.remaining() < 2 {
                        return Err(format!("FU truncated at DONL at seq={seq:04x}"));
                    }
                    data.advance(2);
                }
                let hdr = [(payload_hdr[0] & 0x81) | (fu_type << 1), payload_hdr[1]];
                match (start, self.acc.open_fragment_hdr()) {
                    (true, Some(_)) => {
                        return Err(format!(
                            "FU start while fragment in progress at seq={seq:04x}"
                        ));
                    }
                    (true, None) => self.acc.begin_fragment(hdr, data)?,
                    (false, Some(open_hdr)) => {
                        if open_hdr != hdr {
                            return Err(format!(
                                "FU has inconsistent NAL type at seq={seq:04x}"
                            ));
                        }
                        self.acc.continue_fragment(data, end)?;
                        if !end && pkt.mark {
                            return Err(format!("FU with mark but no end at seq={seq:04x}"));
                        }
                    }
                    (false, None) => {
                        if loss > 0 {
                            self.acc.clear();
                            self.state = State::SkipToNext { timestamp, loss };
                            return Ok(());
                        }
                        return Err(format!(
                            "FU continuation without a start at seq={seq:04x}"
                        ));
                    }
                }
            }
            50 => return Err(format!("PACI packets unsupported at seq={seq:04x}")),
            _ => {
                // A single NAL unit packet, possibly with a DONL.
                if self.acc.open_fragment_hdr().is_some() {
                    return Err(format!(
                        "single NAL while fragment in progress at seq={seq:04x}"
                    ));
                }
                if self.using_donl {
                    if data.remaining() < 2 {
                        return Err(format!("NAL truncated at DONL at seq={seq:04x}"));
                    }
                    data.advance(2);
                }
                self.acc.push_whole(payload_hdr, data)?;
            }
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

    fn finalize(&mut self, timestamp: u32, loss: u16) -> Result<VideoFrame, String> {
        if self.acc.open_fragment_hdr().is_some() {
            return Err("access unit ended with an unterminated fragment".to_owned());
        }
        if self.acc.is_empty() {
            return Err("access unit ended with no NALs".to_owned());
        }
        // BLA/IDR/CRA picture types mark random access points.
        let is_random_access_point = self
            .acc
            .nal_headers()
            .any(|h| (16..=21).contains(&nal_type(h)));
        Ok(VideoFrame {
            timestamp,
            loss,
            is_random_access_point,
            data: self.acc.take_annex_b(),
        })
    }
}

fn decode_sprop_nal(value: &str) -> Result<Vec<u8>, String> {
    // Multiple NALs per attribute are legal but rare; take the first.
    let first = value.split(',').next().expect("split is non-empty");
    let nal = BASE64
        .decode(first.trim())
        .map_err(|_| format!("invalid base64 in sprop attribute: {first:?}"))?;
    if nal.len() < 2 {
        return Err("sprop NAL too short".to_owned());
    }
    Ok(nal)
}
