// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-bits-per-sample audio codecs as defined in
//! [RFC 3551 section 4.5](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5):
//! G.711 µ-law and A-law, G.722, G.726, and L16. One packet carries one
//! frame of samples.

use std::num::NonZeroU16;

use bytes::Bytes;

use super::{AudioFrame, AudioParameters, CodecItem, Packet, ParametersRef};

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: AudioParameters,
    bits_per_sample: u32,
    pending: Option<AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(
        codec: &str,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        bits_per_sample: u32,
    ) -> Self {
        Self {
            parameters: AudioParameters {
                codec: codec.to_owned(),
                clock_rate,
                channels,
                config: Bytes::new(),
            },
            bits_per_sample,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<ParametersRef<'_>> {
        Some(ParametersRef::Audio(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: Packet) -> Result<(), String> {
        assert!(self.pending.is_none(), "push before pull is exhausted");
        if pkt.payload.is_empty() {
            return Err("empty audio packet".to_owned());
        }
        let bits = pkt.payload.len() as u64 * 8;
        if bits % u64::from(self.bits_per_sample) != 0 {
            return Err(format!(
                "invalid length {} for payload of {}-bit audio samples",
                pkt.payload.len(),
                self.bits_per_sample
            ));
        }
        self.pending = Some(AudioFrame {
            timestamp: pkt.timestamp,
            loss: pkt.loss,
            data: pkt.payload,
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::AudioFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_packet_one_frame() {
        let mut d = Depacketizer::new("PCMU", 8_000, NonZeroU16::new(1), 8);
        assert!(d.pull().is_none());
        d.push(Packet {
            sequence_number: 1,
            timestamp: 160,
            mark: false,
            loss: 0,
            payload: Bytes::from_static(&[0x7fu8; 160]),
        })
        .unwrap();
        let f = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            o => panic!("expected audio frame, got {o:?}"),
        };
        assert_eq!(f.timestamp(), 160);
        assert_eq!(f.data().len(), 160);
        assert!(d.pull().is_none());
    }

    #[test]
    fn rejects_partial_sample() {
        // 3 bytes isn't a whole number of 16-bit samples.
        let mut d = Depacketizer::new("L16", 44_100, NonZeroU16::new(1), 16);
        assert!(d
            .push(Packet {
                sequence_number: 1,
                timestamp: 0,
                mark: false,
                loss: 0,
                payload: Bytes::from_static(&[0u8; 3]),
            })
            .is_err());
    }
}
