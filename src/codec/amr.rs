// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AMR and AMR-WB audio as specified in
//! [RFC 4867](https://datatracker.ietf.org/doc/html/rfc4867), octet-aligned
//! mode: a CMR octet, a run of table-of-contents entries, then the speech
//! frames. Each speech frame is emitted in storage format (TOC octet
//! followed by the frame bytes) so it can be written to an `.amr` file
//! directly.

use std::collections::VecDeque;
use std::num::NonZeroU16;

use bytes::{Buf, Bytes};

use super::{AudioFrame, AudioParameters, CodecItem, Packet, ParametersRef};

/// Speech frame sizes in bytes by frame type, excluding the TOC octet.
/// AMR-NB modes 0-7 plus SID; indices 9-14 are reserved/invalid and 15 is
/// NO_DATA.
const NB_FRAME_BYTES: [Option<usize>; 16] = [
    Some(12), // 4.75 kbit/s
    Some(13), // 5.15
    Some(15), // 5.90
    Some(17), // 6.70
    Some(19), // 7.40
    Some(20), // 7.95
    Some(26), // 10.2
    Some(31), // 12.2
    Some(5),  // SID
    None,
    None,
    None,
    None,
    None,
    None,
    Some(0), // NO_DATA
];

const WB_FRAME_BYTES: [Option<usize>; 16] = [
    Some(17), // 6.60 kbit/s
    Some(23), // 8.85
    Some(32), // 12.65
    Some(36), // 14.25
    Some(40), // 15.85
    Some(46), // 18.25
    Some(50), // 19.85
    Some(58), // 23.05
    Some(60), // 23.85
    Some(5),  // SID
    None,
    None,
    None,
    None,
    Some(0), // speech lost
    Some(0), // NO_DATA
];

/// Samples per frame: both variants encode 20 ms of audio.
const NB_SAMPLES_PER_FRAME: u32 = 160; // at 8 kHz
const WB_SAMPLES_PER_FRAME: u32 = 320; // at 16 kHz

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Variant {
    NarrowBand,
    WideBand,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    variant: Variant,
    parameters: AudioParameters,
    pending: VecDeque<AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(
        variant: Variant,
        clock_rate: u32,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        let expected_rate = match variant {
            Variant::NarrowBand => 8_000,
            Variant::WideBand => 16_000,
        };
        if clock_rate != expected_rate {
            return Err(format!(
                "AMR clock rate must be {expected_rate}, not {clock_rate}"
            ));
        }
        if let Some(params) = format_specific_params {
            let octet_aligned = params
                .split(';')
                .filter_map(|p| p.trim().split_once('='))
                .any(|(k, v)| k == "octet-align" && v.trim() == "1");
            if !octet_aligned {
                return Err("AMR bandwidth-efficient mode is unsupported".to_owned());
            }
            for (k, v) in params.split(';').filter_map(|p| p.trim().split_once('=')) {
                if matches!(k, "crc" | "interleaving") && v.trim() != "0" {
                    return Err(format!("AMR {k} is unsupported"));
                }
            }
        } else {
            return Err("AMR requires format parameters (octet-align=1)".to_owned());
        }
        Ok(Self {
            variant,
            parameters: AudioParameters {
                codec: match variant {
                    Variant::NarrowBand => "AMR",
                    Variant::WideBand => "AMR-WB",
                }
                .to_owned(),
                clock_rate,
                channels: NonZeroU16::new(1),
                config: Bytes::new(),
            },
            pending: VecDeque::new(),
        })
    }

    pub(super) fn parameters(&self) -> Option<ParametersRef<'_>> {
        Some(ParametersRef::Audio(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: Packet) -> Result<(), String> {
        assert!(self.pending.is_empty(), "push before pull is exhausted");
        let mut data = pkt.payload;
        if data.len() < 2 {
            return Err("AMR packet too short for CMR and TOC".to_owned());
        }
        data.advance(1); // CMR

        // The TOC is a run of octets, each `F|FT(4)|Q|padding(2)`; F=1 means
        // another entry follows.
        let sizes = match self.variant {
            Variant::NarrowBand => &NB_FRAME_BYTES,
            Variant::WideBand => &WB_FRAME_BYTES,
        };
        let mut toc = Vec::new();
        loop {
            if data.is_empty() {
                return Err("AMR TOC runs past end of packet".to_owned());
            }
            let entry = data[0];
            data.advance(1);
            let frame_type = usize::from((entry >> 3) & 0xf);
            let size = sizes[frame_type]
                .ok_or_else(|| format!("reserved AMR frame type {frame_type}"))?;
            toc.push((entry, size));
            if entry & 0b1000_0000 == 0 {
                break;
            }
        }

        let samples_per_frame = match self.variant {
            Variant::NarrowBand => NB_SAMPLES_PER_FRAME,
            Variant::WideBand => WB_SAMPLES_PER_FRAME,
        };
        let mut timestamp = pkt.timestamp;
        let mut loss = pkt.loss;
        for (entry, size) in toc {
            if data.remaining() < size {
                self.pending.clear();
                return Err(format!(
                    "AMR frame of {size} bytes truncated to {}",
                    data.remaining()
                ));
            }
            // Storage format: the TOC octet with F cleared, then the frame.
            let mut frame = Vec::with_capacity(1 + size);
            frame.push(entry & 0b0111_1111);
            frame.extend_from_slice(&data[..size]);
            data.advance(size);
            self.pending.push_back(AudioFrame {
                timestamp,
                loss,
                data: Bytes::from(frame),
            });
            timestamp = timestamp.wrapping_add(samples_per_frame);
            loss = 0;
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.pop_front().map(CodecItem::AudioFrame)
    }
}
