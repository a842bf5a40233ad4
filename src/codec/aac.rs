// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC audio carried as MPEG4-GENERIC in AAC-hbr mode, as specified in
//! [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640).
//!
//! Each packet starts with a 16-bit `AU-headers-length` (in bits), then that
//! many bits of AU headers (size + interleaving index), then the access
//! units themselves. A packet carries several complete AUs or one fragment
//! of a large AU; fragments accumulate until the marked packet.

use std::collections::VecDeque;
use std::num::NonZeroU16;

use bitstream_io::BitRead as _;
use bytes::{Bytes, BytesMut};

use super::{AudioFrame, AudioParameters, CodecItem, Packet, ParametersRef};

/// Fields of interest from an `AudioSpecificConfig` (ISO/IEC 14496-3
/// section 1.6.2.1).
#[derive(Debug)]
struct AudioSpecificConfig {
    sampling_frequency: u32,
    channels: u16,

    /// Samples per access unit: 1024, or 960 when the frame-length flag is
    /// set.
    frame_length: u32,
}

impl AudioSpecificConfig {
    fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
        let audio_object_type = match r
            .read::<u8>(5)
            .map_err(|e| format!("unable to read audio_object_type: {e}"))?
        {
            31 => {
                32 + r
                    .read::<u8>(6)
                    .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
            }
            o => o,
        };
        // ISO/IEC 14496-3 section 1.6.3.3.
        let sampling_frequency = match r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read sampling_frequency_index: {e}"))?
        {
            0x0 => 96_000,
            0x1 => 88_200,
            0x2 => 64_000,
            0x3 => 48_000,
            0x4 => 44_100,
            0x5 => 32_000,
            0x6 => 24_000,
            0x7 => 22_050,
            0x8 => 16_000,
            0x9 => 12_000,
            0xa => 11_025,
            0xb => 8_000,
            0xc => 7_350,
            0xf => r
                .read::<u32>(24)
                .map_err(|e| format!("unable to read sampling_frequency: {e}"))?,
            v => return Err(format!("reserved sampling_frequency_index 0x{v:x}")),
        };
        let channels = match r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read channel_configuration: {e}"))?
        {
            c @ 1..=6 => u16::from(c),
            7 => 8,
            c => return Err(format!("unsupported channel_configuration {c}")),
        };
        if audio_object_type != 2 {
            // AAC-LC covers what IP cameras send.
            return Err(format!("unsupported audio_object_type {audio_object_type}"));
        }
        // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length_flag = r
            .read_bit()
            .map_err(|e| format!("unable to read frame_length_flag: {e}"))?;
        Ok(AudioSpecificConfig {
            sampling_frequency,
            channels,
            frame_length: if frame_length_flag { 960 } else { 1024 },
        })
    }
}

fn parse_hex(config: &str) -> Result<Vec<u8>, String> {
    let config = config.trim();
    if config.len() % 2 != 0 {
        return Err("odd-length hex config".to_owned());
    }
    (0..config.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&config[i..i + 2], 16)
                .map_err(|_| format!("bad hex config {config:?}"))
        })
        .collect()
}

/// A fragment of one large access unit, spread across several packets.
#[derive(Debug)]
struct Fragment {
    timestamp: u32,
    loss: u16,
    size: usize,
    buf: BytesMut,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: AudioParameters,
    frame_length: u32,
    size_length: u32,
    index_length: u32,
    fragment: Option<Fragment>,
    pending: VecDeque<AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        let params =
            format_specific_params.ok_or_else(|| "AAC requires format parameters".to_owned())?;
        let mut mode = None;
        let mut config_hex = None;
        let mut size_length = None;
        let mut index_length = None;
        let mut index_delta_length = None;
        for (k, v) in params.split(';').filter_map(|p| p.trim().split_once('=')) {
            match k.to_ascii_lowercase().as_str() {
                "mode" => mode = Some(v.trim().to_owned()),
                "config" => config_hex = Some(v.trim().to_owned()),
                "sizelength" => size_length = parse_u32(v)?.into(),
                "indexlength" => index_length = parse_u32(v)?.into(),
                "indexdeltalength" => index_delta_length = parse_u32(v)?.into(),
                _ => {}
            }
        }
        match mode.as_deref() {
            Some(m) if m.eq_ignore_ascii_case("AAC-hbr") => {}
            m => return Err(format!("unsupported MPEG4-GENERIC mode {m:?}")),
        }
        let size_length = size_length.unwrap_or(13);
        let index_length = index_length.unwrap_or(3);
        if let Some(d) = index_delta_length {
            if d != index_length {
                return Err("indexdeltalength must match indexlength".to_owned());
            }
        }
        if size_length == 0 || size_length + index_length > 32 {
            return Err(format!(
                "bad AU header layout: sizelength={size_length} indexlength={index_length}"
            ));
        }
        let config_raw =
            parse_hex(&config_hex.ok_or_else(|| "AAC requires a config parameter".to_owned())?)?;
        let config = AudioSpecificConfig::parse(&config_raw)?;
        if config.sampling_frequency != clock_rate {
            return Err(format!(
                "RTP clock rate {clock_rate} and AAC sampling frequency {} must match",
                config.sampling_frequency
            ));
        }
        if let Some(c) = channels {
            if c.get() != config.channels {
                return Err(format!(
                    "rtpmap channels {} and AAC channel config {} must match",
                    c.get(),
                    config.channels
                ));
            }
        }
        Ok(Self {
            parameters: AudioParameters {
                codec: "AAC".to_owned(),
                clock_rate,
                channels: NonZeroU16::new(config.channels),
                config: Bytes::from(config_raw),
            },
            frame_length: config.frame_length,
            size_length,
            index_length,
            fragment: None,
            pending: VecDeque::new(),
        })
    }

    pub(super) fn parameters(&self) -> Option<ParametersRef<'_>> {
        Some(ParametersRef::Audio(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: Packet) -> Result<(), String> {
        assert!(self.pending.is_empty(), "push before pull is exhausted");
        if pkt.loss > 0 {
            if let Some(f) = self.fragment.take() {
                log::debug!(
                    "dropping in-progress AAC fragment of {} bytes after loss of {} packets",
                    f.buf.len(),
                    pkt.loss
                );
            }
        }

        let payload = pkt.payload;
        if payload.len() < 2 {
            return Err("packet too short for AU-headers-length".to_owned());
        }
        let au_headers_length_bits = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
        let header_bits = (self.size_length + self.index_length) as usize;
        if au_headers_length_bits == 0 || au_headers_length_bits % header_bits != 0 {
            return Err(format!(
                "bad AU-headers-length {au_headers_length_bits} for {header_bits}-bit headers"
            ));
        }
        let au_count = au_headers_length_bits / header_bits;
        let headers_bytes = au_headers_length_bits.div_ceil(8);
        let data_off = 2 + headers_bytes;
        if payload.len() < data_off {
            return Err("packet too short for AU headers".to_owned());
        }

        let mut r = bitstream_io::BitReader::endian(
            &payload[2..data_off],
            bitstream_io::BigEndian,
        );
        let mut sizes = Vec::with_capacity(au_count);
        for i in 0..au_count {
            let size = r
                .read::<u32>(self.size_length)
                .map_err(|e| format!("unable to read AU size: {e}"))? as usize;
            let index = r
                .read::<u32>(self.index_length)
                .map_err(|e| format!("unable to read AU index: {e}"))?;
            if index != 0 {
                // An index (or index-delta) != 0 signals interleaving.
                return Err(format!("interleaved AUs unsupported (index {index} at AU {i})"));
            }
            sizes.push(size);
        }

        let mut data = payload.slice(data_off..);
        if let Some(mut frag) = self.fragment.take() {
            if au_count != 1 {
                return Err(format!("{au_count}-AU packet while fragment in progress"));
            }
            if frag.timestamp != pkt.timestamp {
                return Err("timestamp changed mid-fragment".to_owned());
            }
            if sizes[0] != frag.size {
                return Err(format!(
                    "AU size changed {}->{} mid-fragment",
                    frag.size, sizes[0]
                ));
            }
            frag.buf.extend_from_slice(&data);
            match (frag.buf.len().cmp(&frag.size), pkt.mark) {
                (std::cmp::Ordering::Greater, _) => {
                    return Err(format!(
                        "fragmented AU of {} bytes overran declared size {}",
                        frag.buf.len(),
                        frag.size
                    ));
                }
                (std::cmp::Ordering::Less, true) => {
                    return Err("marked packet left fragmented AU incomplete".to_owned());
                }
                (std::cmp::Ordering::Less, false) => {
                    self.fragment = Some(frag);
                }
                (std::cmp::Ordering::Equal, true) => self.pending.push_back(AudioFrame {
                    timestamp: frag.timestamp,
                    loss: frag.loss,
                    data: frag.buf.freeze(),
                }),
                (std::cmp::Ordering::Equal, false) => {
                    return Err("complete fragmented AU without mark".to_owned());
                }
            }
            return Ok(());
        }

        if au_count == 1 && data.len() < sizes[0] {
            if pkt.mark {
                return Err(format!(
                    "marked packet has {} bytes of a {}-byte AU",
                    data.len(),
                    sizes[0]
                ));
            }
            let mut buf = BytesMut::with_capacity(sizes[0]);
            buf.extend_from_slice(&data);
            self.fragment = Some(Fragment {
                timestamp: pkt.timestamp,
                loss: pkt.loss,
                size: sizes[0],
                buf,
            });
            return Ok(());
        }

        let mut timestamp = pkt.timestamp;
        let mut loss = pkt.loss;
        for (i, size) in sizes.into_iter().enumerate() {
            if data.len() < size {
                self.pending.clear();
                return Err(format!("AU {i} of {size} bytes overruns packet"));
            }
            let au = data.split_to(size);
            self.pending.push_back(AudioFrame {
                timestamp,
                loss,
                data: au,
            });
            timestamp = timestamp.wrapping_add(self.frame_length);
            loss = 0;
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.pop_front().map(CodecItem::AudioFrame)
    }
}

fn parse_u32(v: &str) -> Result<u32, String> {
    u32::from_str_radix(v.trim(), 10).map_err(|_| format!("bad numeric parameter {v:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 48 kHz stereo AAC-LC: AOT=2, freq index 3, channel config 2.
    const PARAMS: &str =
        "profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1190";

    fn depacketizer() -> Depacketizer {
        Depacketizer::new(48_000, NonZeroU16::new(2), Some(PARAMS)).unwrap()
    }

    fn au_header(size: u16) -> [u8; 4] {
        // AU-headers-length = 16 bits, then size << 3 | index 0.
        let h = size << 3;
        [0, 16, (h >> 8) as u8, h as u8]
    }

    #[test]
    fn config_parsing() {
        let d = depacketizer();
        let p = match d.parameters() {
            Some(ParametersRef::Audio(p)) => p,
            o => panic!("expected audio parameters, got {o:?}"),
        };
        assert_eq!(p.codec(), "AAC");
        assert_eq!(p.clock_rate(), 48_000);
        assert_eq!(p.channels(), NonZeroU16::new(2));
        assert_eq!(p.config(), b"\x11\x90");
        assert_eq!(d.frame_length, 1024);
    }

    #[test]
    fn single_au() {
        let mut d = depacketizer();
        let mut payload = au_header(4).to_vec();
        payload.extend_from_slice(b"aac1");
        d.push(Packet {
            sequence_number: 0,
            timestamp: 0,
            mark: true,
            loss: 0,
            payload: Bytes::from(payload),
        })
        .unwrap();
        let f = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            o => panic!("expected audio frame, got {o:?}"),
        };
        assert_eq!(f.data(), b"aac1");
        assert!(d.pull().is_none());
    }

    #[test]
    fn aggregated_aus_step_timestamps() {
        let mut d = depacketizer();
        // Two 3-byte AUs: AU-headers-length = 32 bits.
        let mut payload = vec![0, 32];
        payload.extend_from_slice(&(3u16 << 3).to_be_bytes());
        payload.extend_from_slice(&(3u16 << 3).to_be_bytes());
        payload.extend_from_slice(b"oneTWO");
        d.push(Packet {
            sequence_number: 0,
            timestamp: 5000,
            mark: true,
            loss: 0,
            payload: Bytes::from(payload),
        })
        .unwrap();
        let f1 = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            o => panic!("expected audio frame, got {o:?}"),
        };
        assert_eq!(f1.data(), b"one");
        assert_eq!(f1.timestamp(), 5000);
        let f2 = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            o => panic!("expected audio frame, got {o:?}"),
        };
        assert_eq!(f2.data(), b"TWO");
        assert_eq!(f2.timestamp(), 6024);
    }

    #[test]
    fn fragmented_au() {
        let mut d = depacketizer();
        let mut p1 = au_header(8).to_vec();
        p1.extend_from_slice(b"frag");
        d.push(Packet {
            sequence_number: 0,
            timestamp: 100,
            mark: false,
            loss: 0,
            payload: Bytes::from(p1),
        })
        .unwrap();
        assert!(d.pull().is_none());
        let mut p2 = au_header(8).to_vec();
        p2.extend_from_slice(b"MENT");
        d.push(Packet {
            sequence_number: 1,
            timestamp: 100,
            mark: true,
            loss: 0,
            payload: Bytes::from(p2),
        })
        .unwrap();
        let f = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            o => panic!("expected audio frame, got {o:?}"),
        };
        assert_eq!(f.data(), b"fragMENT");
    }

    #[test]
    fn loss_drops_fragment() {
        let mut d = depacketizer();
        let mut p1 = au_header(8).to_vec();
        p1.extend_from_slice(b"frag");
        d.push(Packet {
            sequence_number: 0,
            timestamp: 100,
            mark: false,
            loss: 0,
            payload: Bytes::from(p1),
        })
        .unwrap();
        // Loss arrives; a fresh complete AU follows.
        let mut p2 = au_header(2).to_vec();
        p2.extend_from_slice(b"ok");
        d.push(Packet {
            sequence_number: 5,
            timestamp: 1124,
            mark: true,
            loss: 4,
            payload: Bytes::from(p2),
        })
        .unwrap();
        let f = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            o => panic!("expected audio frame, got {o:?}"),
        };
        assert_eq!(f.data(), b"ok");
        assert_eq!(f.loss(), 4);
    }

    #[test]
    fn rejects_mismatched_clock() {
        assert!(Depacketizer::new(44_100, None, Some(PARAMS)).is_err());
    }
}
