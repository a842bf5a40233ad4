// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [JPEG](https://www.itu.int/rec/T-REC-T.81-199209-I/en)-encoded video,
//! reassembled from RTP/JPEG fragments as specified in
//! [RFC 2435](https://www.rfc-editor.org/rfc/rfc2435.txt).
//!
//! RTP/JPEG strips the JFIF headers from the wire format; the depacketizer
//! reconstructs them from the type/quality fields and (for Q >= 128) the
//! in-band quantization tables.

use bytes::{Buf, Bytes};

use super::{CodecItem, Packet, ParametersRef, VideoFrame, VideoParameters};

#[rustfmt::skip]
const ZIGZAG: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10,
    17, 24, 32, 25, 18, 11, 4, 5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13, 6, 7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

// Tables and header synthesis ported from the reference code in RFC 2435
// Appendix A and B.

/// Table K.1 from the JPEG spec.
#[rustfmt::skip]
const LUMA_QUANTIZER: [i32; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61,
    12, 12, 14, 19, 26, 58, 60, 55,
    14, 13, 16, 24, 40, 57, 69, 56,
    14, 17, 22, 29, 51, 87, 80, 62,
    18, 22, 37, 56, 68, 109, 103, 77,
    24, 35, 55, 64, 81, 104, 113, 92,
    49, 64, 78, 87, 103, 121, 120, 101,
    72, 92, 95, 98, 112, 100, 103, 99,
];

/// Table K.2 from the JPEG spec.
#[rustfmt::skip]
const CHROMA_QUANTIZER: [i32; 64] = [
    17, 18, 24, 47, 99, 99, 99, 99,
    18, 21, 26, 66, 99, 99, 99, 99,
    24, 26, 56, 99, 99, 99, 99, 99,
    47, 66, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
];

/// Synthesizes luma and chroma quantizer tables for a Q factor below 128.
fn make_tables(q: i32) -> [u8; 128] {
    let factor = q.clamp(1, 99);
    let scale = if factor < 50 {
        5000 / factor
    } else {
        200 - factor * 2
    };
    let mut tables = [0u8; 128];
    for i in 0..64 {
        let lq = (LUMA_QUANTIZER[ZIGZAG[i]] * scale + 50) / 100;
        let cq = (CHROMA_QUANTIZER[ZIGZAG[i]] * scale + 50) / 100;
        tables[i] = lq.clamp(1, 255) as u8;
        tables[i + 64] = cq.clamp(1, 255) as u8;
    }
    tables
}

const LUM_DC_CODELENS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const LUM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const LUM_AC_CODELENS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];

#[rustfmt::skip]
const LUM_AC_SYMBOLS: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12,
    0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08,
    0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52, 0xd1, 0xf0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16,
    0x17, 0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39,
    0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59,
    0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7a, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98,
    0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6,
    0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5,
    0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4,
    0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2,
    0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea,
    0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

const CHM_DC_CODELENS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const CHM_DC_SYMBOLS: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
const CHM_AC_CODELENS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];

#[rustfmt::skip]
const CHM_AC_SYMBOLS: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21,
    0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91,
    0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33, 0x52, 0xf0,
    0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34,
    0xe1, 0x25, 0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26,
    0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58,
    0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78,
    0x79, 0x7a, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96,
    0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5,
    0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4,
    0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3,
    0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2,
    0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda,
    0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9,
    0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

fn push_quant_header(out: &mut Vec<u8>, table: &[u8], table_no: u8) {
    out.extend_from_slice(&[0xff, 0xdb, 0, table.len() as u8 + 3, table_no]);
    out.extend_from_slice(table);
}

fn push_huffman_header(
    out: &mut Vec<u8>,
    codelens: &[u8],
    symbols: &[u8],
    table_no: u8,
    table_class: u8,
) {
    out.extend_from_slice(&[
        0xff,
        0xc4,
        0,
        (3 + codelens.len() + symbols.len()) as u8,
        (table_class << 4) | table_no,
    ]);
    out.extend_from_slice(codelens);
    out.extend_from_slice(symbols);
}

/// Writes the JFIF headers that RTP/JPEG strips from the wire format.
fn push_headers(
    out: &mut Vec<u8>,
    type_field: u8,
    width: u16,
    height: u16,
    mut qtable: Bytes,
    precision: u8,
    dri: u16,
) -> Result<(), String> {
    out.extend_from_slice(&[0xff, 0xd8]); // SOI

    for (table_no, bit) in [(0u8, 1u8), (1, 2)] {
        let size = if precision & bit != 0 { 128 } else { 64 };
        if qtable.remaining() < size {
            return Err("quantization table too small".to_owned());
        }
        push_quant_header(out, &qtable[..size], table_no);
        qtable.advance(size);
    }

    if dri != 0 {
        out.extend_from_slice(&[0xff, 0xdd, 0, 4]); // DRI
        out.extend_from_slice(&dri.to_be_bytes());
    }

    out.extend_from_slice(&[0xff, 0xc0, 0, 17, 8]); // SOF, 8-bit precision
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&width.to_be_bytes());
    out.push(3); // components
    let luma_sampling = if type_field & 0x3f == 0 { 0x21 } else { 0x22 };
    out.extend_from_slice(&[0, luma_sampling, 0]); // Y
    out.extend_from_slice(&[1, 0x11, 1]); // Cb
    out.extend_from_slice(&[2, 0x11, 1]); // Cr

    push_huffman_header(out, &LUM_DC_CODELENS, &LUM_DC_SYMBOLS, 0, 0);
    push_huffman_header(out, &LUM_AC_CODELENS, &LUM_AC_SYMBOLS, 0, 1);
    push_huffman_header(out, &CHM_DC_CODELENS, &CHM_DC_SYMBOLS, 1, 0);
    push_huffman_header(out, &CHM_AC_CODELENS, &CHM_AC_SYMBOLS, 1, 1);

    out.extend_from_slice(&[0xff, 0xda, 0, 12, 3]); // SOS
    out.extend_from_slice(&[0, 0x00, 1, 0x11, 2, 0x11]);
    out.extend_from_slice(&[0, 63, 0]); // DCT coefficient range

    Ok(())
}

/// Combines fragmented RTP/JPEG packets into complete image frames.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    /// The timestamp of the in-progress frame, if any.
    in_progress: Option<u32>,

    /// Backing storage for the frame being assembled.
    data: Vec<u8>,

    /// Quantization tables seen (or synthesized) per Q value.
    qtables: Vec<Option<Bytes>>,

    pending: Option<VideoFrame>,
    parameters: VideoParameters,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32) -> Self {
        Depacketizer {
            in_progress: None,
            data: Vec::new(),
            qtables: vec![None; 256],
            pending: None,
            parameters: VideoParameters {
                codec: "JPEG".to_owned(),
                clock_rate,
                config: Bytes::new(),
            },
        }
    }

    pub(super) fn parameters(&self) -> Option<ParametersRef<'_>> {
        Some(ParametersRef::Video(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: Packet) -> Result<(), String> {
        assert!(self.pending.is_none(), "push before pull is exhausted");
        let r = self.push_inner(pkt);
        if r.is_err() {
            self.in_progress = None;
            self.data.clear();
        }
        r
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::VideoFrame)
    }

    fn push_inner(&mut self, pkt: Packet) -> Result<(), String> {
        let mut payload = pkt.payload;
        if payload.len() < 8 {
            return Err("RTP/JPEG packet too short for main header".to_owned());
        }
        if pkt.loss > 0 && self.in_progress.take().is_some() {
            self.data.clear();
        }

        //  0                   1                   2                   3
        //  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
        // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        // | Type-specific |              Fragment Offset                  |
        // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        // |      Type     |       Q       |     Width     |     Height    |
        // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        let frag_offset = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]);
        let type_field = payload[4];
        let q = payload[5];
        let width = u16::from(payload[6]) * 8;
        let height = u16::from(payload[7]) * 8;
        payload.advance(8);

        let mut dri = 0u16;
        if type_field >= 64 && type_field < 128 {
            // Restart marker header.
            if payload.remaining() < 4 {
                return Err("RTP/JPEG packet too short for restart header".to_owned());
            }
            dri = u16::from_be_bytes([payload[0], payload[1]]);
            payload.advance(4);
        }

        if frag_offset == 0 {
            if self.in_progress.take().is_some() {
                self.data.clear();
                return Err("new RTP/JPEG frame started while one was in progress".to_owned());
            }

            let mut precision = 0u8;
            let mut qtable = None;
            if q >= 128 {
                // In-band quantization table header.
                if payload.remaining() < 4 {
                    return Err("RTP/JPEG packet too short for qtable header".to_owned());
                }
                precision = payload[1];
                let len = usize::from(u16::from_be_bytes([payload[2], payload[3]]));
                payload.advance(4);
                if len > payload.remaining() {
                    return Err(format!(
                        "qtable length {len} larger than remaining payload"
                    ));
                }
                if len > 0 {
                    let table = payload.split_to(len);
                    self.qtables[usize::from(q)] = Some(table.clone());
                    qtable = Some(table);
                } else {
                    // Q >= 128 with len 0 refers to a previously sent table.
                    qtable = self.qtables[usize::from(q)].clone();
                }
            } else {
                // Q < 128 tables are synthesized from the Q factor and cached.
                if self.qtables[usize::from(q)].is_none() {
                    self.qtables[usize::from(q)] =
                        Some(Bytes::copy_from_slice(&make_tables(i32::from(q))));
                }
                qtable = self.qtables[usize::from(q)].clone();
            }
            let qtable =
                qtable.ok_or_else(|| "RTP/JPEG frame without quantization tables".to_owned())?;

            self.data.clear();
            push_headers(
                &mut self.data,
                type_field,
                width,
                height,
                qtable,
                precision,
                dri,
            )?;
            self.in_progress = Some(pkt.timestamp);
        } else {
            match self.in_progress {
                None => return Err("RTP/JPEG continuation without a start".to_owned()),
                Some(ts) if ts != pkt.timestamp => {
                    return Err("RTP/JPEG timestamp changed mid-frame".to_owned());
                }
                Some(_) => {}
            }
        }

        self.data.extend_from_slice(&payload);

        if pkt.mark {
            // Append an EOI marker if the camera didn't.
            if !self.data.ends_with(&[0xff, 0xd9]) {
                self.data.extend_from_slice(&[0xff, 0xd9]);
            }
            self.in_progress = None;
            self.pending = Some(VideoFrame {
                timestamp: pkt.timestamp,
                loss: pkt.loss,
                is_random_access_point: true, // every complete JPEG stands alone
                data: std::mem::take(&mut self.data),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_header(frag_offset: u32, q: u8) -> Vec<u8> {
        let off = frag_offset.to_be_bytes();
        vec![0, off[1], off[2], off[3], 1, q, 80, 60]
    }

    #[test]
    fn reassembles_fragments_with_synthesized_tables() {
        let mut d = Depacketizer::new(90_000);
        let mut p0 = main_header(0, 50);
        p0.extend_from_slice(b"scan-data-a");
        d.push(Packet {
            sequence_number: 0,
            timestamp: 1000,
            mark: false,
            loss: 0,
            payload: Bytes::from(p0),
        })
        .unwrap();
        assert!(d.pull().is_none());

        let mut p1 = main_header(11, 50);
        p1.extend_from_slice(b"scan-data-b");
        d.push(Packet {
            sequence_number: 1,
            timestamp: 1000,
            mark: true,
            loss: 0,
            payload: Bytes::from(p1),
        })
        .unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            o => panic!("expected video frame, got {o:?}"),
        };
        let data = frame.data();
        assert!(data.starts_with(&[0xff, 0xd8]));
        assert!(data.ends_with(&[0xff, 0xd9]));
        let scan_start = data
            .windows(11)
            .position(|w| w == b"scan-data-a")
            .expect("scan data present");
        assert_eq!(&data[scan_start..scan_start + 22], b"scan-data-ascan-data-b");
    }

    #[test]
    fn continuation_without_start_is_dropped() {
        let mut d = Depacketizer::new(90_000);
        let mut p = main_header(100, 50);
        p.extend_from_slice(b"tail");
        assert!(d
            .push(Packet {
                sequence_number: 9,
                timestamp: 1000,
                mark: true,
                loss: 3,
                payload: Bytes::from(p),
            })
            .is_err());
        assert!(d.pull().is_none());
    }

    #[test]
    fn too_short() {
        let mut d = Depacketizer::new(90_000);
        assert!(d
            .push(Packet {
                sequence_number: 0,
                timestamp: 0,
                mark: false,
                loss: 0,
                payload: Bytes::from_static(b"\x00\x00\x00"),
            })
            .is_err());
    }
}
