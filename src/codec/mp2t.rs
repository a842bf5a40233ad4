// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-2 transport streams over RTP as specified in
//! [RFC 2250 section 2](https://datatracker.ietf.org/doc/html/rfc2250#section-2):
//! the payload is a whole number of 188-byte TS packets, passed through.

use super::{CodecItem, Packet, ParametersRef, VideoFrame, VideoParameters};

const TS_PACKET_LEN: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: VideoParameters,
    pending: Option<VideoFrame>,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32) -> Self {
        Self {
            parameters: VideoParameters {
                codec: "MP2T".to_owned(),
                clock_rate,
                config: bytes::Bytes::new(),
            },
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<ParametersRef<'_>> {
        Some(ParametersRef::Video(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: Packet) -> Result<(), String> {
        assert!(self.pending.is_none(), "push before pull is exhausted");
        if pkt.payload.is_empty() || pkt.payload.len() % TS_PACKET_LEN != 0 {
            return Err(format!(
                "RTP/MP2T payload of {} bytes is not a whole number of TS packets",
                pkt.payload.len()
            ));
        }
        if pkt.payload[0] != TS_SYNC_BYTE {
            return Err("RTP/MP2T payload doesn't start with a sync byte".to_owned());
        }
        self.pending = Some(VideoFrame {
            timestamp: pkt.timestamp,
            loss: pkt.loss,
            is_random_access_point: false, // unknowable without demuxing
            data: pkt.payload.to_vec(),
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::VideoFrame)
    }
}
