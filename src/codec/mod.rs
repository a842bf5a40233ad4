// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: one RTP depacketizer per supported codec, each
//! consuming packets in receive order and emitting zero or more assembled
//! frames. No decoding happens here; video frames are elementary-stream
//! access units and audio frames are codec access units.

use std::num::NonZeroU16;

use bytes::Bytes;

pub(crate) mod aac;
pub(crate) mod amr;
pub(crate) mod g711;
mod h26x;
pub(crate) mod jpeg;
pub(crate) mod mp2t;

#[doc(hidden)]
pub mod h264;

#[cfg(feature = "h265")]
#[doc(hidden)]
pub mod h265;

/// Parameters which describe a video stream, reported once per stream before
/// any frame.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoParameters {
    pub(crate) codec: String,
    pub(crate) clock_rate: u32,

    /// Out-of-band configuration: for H.264/H.265, the parameter-set NAL
    /// units from SDP in Annex B form; empty when the stream carries its
    /// configuration in-band only.
    pub(crate) config: Bytes,
}

impl VideoParameters {
    /// An encoding name such as `H264`, `H265`, `JPEG`, or `MP2T`.
    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn config(&self) -> &[u8] {
        &self.config
    }
}

impl std::fmt::Debug for VideoParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoParameters")
            .field("codec", &self.codec)
            .field("clock_rate", &self.clock_rate)
            .field("config", &crate::hex::LimitedHex::new(&self.config, 256))
            .finish()
    }
}

/// Parameters which describe an audio stream.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioParameters {
    pub(crate) codec: String,
    pub(crate) clock_rate: u32,
    pub(crate) channels: Option<NonZeroU16>,

    /// Out-of-band configuration: for AAC, the `AudioSpecificConfig`.
    pub(crate) config: Bytes,
}

impl AudioParameters {
    /// An encoding name such as `PCMU`, `PCMA`, `AAC`, or `AMR`.
    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn channels(&self) -> Option<NonZeroU16> {
        self.channels
    }

    pub fn config(&self) -> &[u8] {
        &self.config
    }
}

impl std::fmt::Debug for AudioParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioParameters")
            .field("codec", &self.codec)
            .field("clock_rate", &self.clock_rate)
            .field("channels", &self.channels)
            .field("config", &crate::hex::LimitedHex::new(&self.config, 256))
            .finish()
    }
}

/// Reference to the parameters of a stream.
#[derive(Copy, Clone, Debug)]
pub enum ParametersRef<'a> {
    Video(&'a VideoParameters),
    Audio(&'a AudioParameters),
}

/// A single video access unit.
///
/// For H.264/H.265 this is one access unit in Annex B byte-stream form
/// (each NAL prefixed with a four-byte start code); for JPEG a complete
/// image; for MP2T a run of transport-stream packets.
pub struct VideoFrame {
    pub(crate) timestamp: u32,
    pub(crate) loss: u16,
    pub(crate) is_random_access_point: bool,
    pub(crate) data: Vec<u8>,
}

impl VideoFrame {
    /// The RTP timestamp (typically at 90 kHz for video).
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// The number of RTP packets lost immediately before this frame. If loss
    /// occurs mid-frame, more than this many packets' data may be missing.
    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    /// True for an IDR/IRAP picture which can be decoded without reference
    /// to any earlier frame.
    #[inline]
    pub fn is_random_access_point(&self) -> bool {
        self.is_random_access_point
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp", &self.timestamp)
            .field("loss", &self.loss)
            .field("is_random_access_point", &self.is_random_access_point)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// A single audio access unit (e.g. one AAC frame or one packet of G.711
/// samples).
pub struct AudioFrame {
    pub(crate) timestamp: u32,
    pub(crate) loss: u16,
    pub(crate) data: Bytes,
}

impl AudioFrame {
    /// The RTP timestamp, in clock-rate units.
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// See [`VideoFrame::loss`].
    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("timestamp", &self.timestamp)
            .field("loss", &self.loss)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// An item produced by a [`Depacketizer`].
#[derive(Debug)]
pub enum CodecItem {
    VideoFrame(VideoFrame),
    AudioFrame(AudioFrame),
}

/// An RTP packet as handed to a depacketizer: demultiplexed, validated, and
/// annotated with the loss count since the previous packet of its stream.
#[doc(hidden)]
#[derive(Debug)]
pub struct Packet {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub mark: bool,
    pub loss: u16,
    pub payload: Bytes,
}

/// Turns RTP packets into [`CodecItem`]s.
///
/// Between any two calls to `push`, the caller must call `pull` until it
/// returns `None`; some packetization formats aggregate several frames into
/// one packet.
#[derive(Debug)]
pub struct Depacketizer(DepacketizerInner);

#[derive(Debug)]
enum DepacketizerInner {
    Aac(Box<aac::Depacketizer>),
    Amr(Box<amr::Depacketizer>),
    G711(Box<g711::Depacketizer>),
    H264(Box<h264::Depacketizer>),
    #[cfg(feature = "h265")]
    H265(Box<h265::Depacketizer>),
    Jpeg(Box<jpeg::Depacketizer>),
    Mp2t(Box<mp2t::Depacketizer>),
}

impl Depacketizer {
    /// Creates a depacketizer from SDP-derived stream facts, or an error
    /// naming why the encoding isn't supported.
    ///
    /// Encoding names follow the [IANA media type
    /// registry](https://www.iana.org/assignments/media-types/media-types.xhtml),
    /// lowercased.
    pub fn new(
        media: &str,
        encoding: &str,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        Ok(Depacketizer(match (media, encoding) {
            ("video", "h264") => DepacketizerInner::H264(Box::new(h264::Depacketizer::new(
                clock_rate,
                format_specific_params,
            )?)),
            #[cfg(feature = "h265")]
            ("video", "h265") => DepacketizerInner::H265(Box::new(h265::Depacketizer::new(
                clock_rate,
                format_specific_params,
            )?)),
            ("video" | "image", "jpeg") => {
                DepacketizerInner::Jpeg(Box::new(jpeg::Depacketizer::new(clock_rate)))
            }
            ("video", "mp2t") => {
                DepacketizerInner::Mp2t(Box::new(mp2t::Depacketizer::new(clock_rate)))
            }
            ("audio", "mpeg4-generic") => DepacketizerInner::Aac(Box::new(
                aac::Depacketizer::new(clock_rate, channels, format_specific_params)?,
            )),
            ("audio", "pcmu") => DepacketizerInner::G711(Box::new(g711::Depacketizer::new(
                "PCMU", clock_rate, channels, 8,
            ))),
            ("audio", "pcma") => DepacketizerInner::G711(Box::new(g711::Depacketizer::new(
                "PCMA", clock_rate, channels, 8,
            ))),
            ("audio", "g722" | "u8") => DepacketizerInner::G711(Box::new(
                g711::Depacketizer::new("G722", clock_rate, channels, 8),
            )),
            ("audio", "l16") => DepacketizerInner::G711(Box::new(g711::Depacketizer::new(
                "L16", clock_rate, channels, 16,
            ))),
            ("audio", "g726-16") => DepacketizerInner::G711(Box::new(g711::Depacketizer::new(
                "G726", clock_rate, channels, 2,
            ))),
            ("audio", "g726-24") => DepacketizerInner::G711(Box::new(g711::Depacketizer::new(
                "G726", clock_rate, channels, 3,
            ))),
            ("audio", "g726-32" | "dvi4") => DepacketizerInner::G711(Box::new(
                g711::Depacketizer::new("G726", clock_rate, channels, 4),
            )),
            ("audio", "g726-40") => DepacketizerInner::G711(Box::new(g711::Depacketizer::new(
                "G726", clock_rate, channels, 5,
            ))),
            ("audio", "amr") => DepacketizerInner::Amr(Box::new(amr::Depacketizer::new(
                amr::Variant::NarrowBand,
                clock_rate,
                format_specific_params,
            )?)),
            ("audio", "amr-wb") => DepacketizerInner::Amr(Box::new(amr::Depacketizer::new(
                amr::Variant::WideBand,
                clock_rate,
                format_specific_params,
            )?)),
            (_, _) => {
                return Err(format!(
                    "no depacketizer for media/encoding {media}/{encoding}"
                ))
            }
        }))
    }

    /// Returns the stream's parameters, if known.
    pub fn parameters(&self) -> Option<ParametersRef<'_>> {
        match &self.0 {
            DepacketizerInner::Aac(d) => d.parameters(),
            DepacketizerInner::Amr(d) => d.parameters(),
            DepacketizerInner::G711(d) => d.parameters(),
            DepacketizerInner::H264(d) => d.parameters(),
            #[cfg(feature = "h265")]
            DepacketizerInner::H265(d) => d.parameters(),
            DepacketizerInner::Jpeg(d) => d.parameters(),
            DepacketizerInner::Mp2t(d) => d.parameters(),
        }
    }

    /// Supplies one packet. On error the packet is dropped and any
    /// in-progress reassembly state has been discarded; the stream remains
    /// usable.
    pub fn push(&mut self, pkt: Packet) -> Result<(), String> {
        match &mut self.0 {
            DepacketizerInner::Aac(d) => d.push(pkt),
            DepacketizerInner::Amr(d) => d.push(pkt),
            DepacketizerInner::G711(d) => d.push(pkt),
            DepacketizerInner::H264(d) => d.push(pkt),
            #[cfg(feature = "h265")]
            DepacketizerInner::H265(d) => d.push(pkt),
            DepacketizerInner::Jpeg(d) => d.push(pkt),
            DepacketizerInner::Mp2t(d) => d.push(pkt),
        }
    }

    /// Retrieves the next completed frame, if any.
    pub fn pull(&mut self) -> Option<CodecItem> {
        match &mut self.0 {
            DepacketizerInner::Aac(d) => d.pull(),
            DepacketizerInner::Amr(d) => d.pull(),
            DepacketizerInner::G711(d) => d.pull(),
            DepacketizerInner::H264(d) => d.pull(),
            #[cfg(feature = "h265")]
            DepacketizerInner::H265(d) => d.pull(),
            DepacketizerInner::Jpeg(d) => d.pull(),
            DepacketizerInner::Mp2t(d) => d.pull(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_encoding() {
        assert!(Depacketizer::new("video", "av1", 90_000, None, None).is_err());
        assert!(Depacketizer::new("application", "x-foo", 90_000, None, None).is_err());
    }

    #[test]
    fn empty_input_is_idempotent() {
        // No depacketizer yields a frame before the first push.
        let mut d = Depacketizer::new("audio", "pcmu", 8_000, None, None).unwrap();
        assert!(d.pull().is_none());
        let mut d = Depacketizer::new("video", "h264", 90_000, None, None).unwrap();
        assert!(d.pull().is_none());
    }
}
