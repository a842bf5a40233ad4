// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Access-unit accumulation shared between the H.264 and H.265
//! depacketizers: both collect NAL units (possibly arriving in fragments)
//! and assemble them into an Annex B byte stream at the frame boundary.

use bytes::Bytes;

/// The Annex B start code written before each NAL.
pub(super) const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Collects the NAL units of one access unit.
///
/// `H` is the NAL header length in bytes: 1 for H.264, 2 for H.265. Payload
/// bytes are kept as zero-copy pieces; the header byte(s) are stored
/// separately since fragmentation units transmit them in mangled form.
#[derive(Debug)]
pub(super) struct NalAccumulator<const H: usize> {
    /// Pieces of NAL payloads, excluding header bytes. Retains its backing
    /// allocation across access units.
    pieces: Vec<Bytes>,

    /// One entry per NAL, in order.
    nals: Vec<Nal<H>>,
}

#[derive(Debug)]
struct Nal<const H: usize> {
    hdr: [u8; H],

    /// The length of `pieces` as this NAL finishes, or `u32::MAX` while a
    /// fragment is still open.
    next_piece_idx: u32,

    /// The total NAL length, including the header bytes.
    len: u32,
}

impl<const H: usize> NalAccumulator<H> {
    pub(super) fn new() -> Self {
        Self {
            pieces: Vec::new(),
            nals: Vec::new(),
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.nals.is_empty()
    }

    pub(super) fn clear(&mut self) {
        self.pieces.clear();
        self.nals.clear();
    }

    /// Adds a complete NAL.
    pub(super) fn push_whole(&mut self, hdr: [u8; H], payload: Bytes) -> Result<(), String> {
        let len = nal_len::<H>(payload.len())?;
        let next_piece_idx = self.add_piece(payload)?;
        self.nals.push(Nal {
            hdr,
            next_piece_idx,
            len,
        });
        Ok(())
    }

    /// Starts a fragmented NAL with its first piece.
    pub(super) fn begin_fragment(&mut self, hdr: [u8; H], piece: Bytes) -> Result<(), String> {
        let len = nal_len::<H>(piece.len())?;
        self.add_piece(piece)?;
        self.nals.push(Nal {
            hdr,
            next_piece_idx: u32::MAX,
            len,
        });
        Ok(())
    }

    /// Appends a piece to the open fragment; `end` closes it.
    pub(super) fn continue_fragment(&mut self, piece: Bytes, end: bool) -> Result<(), String> {
        let add = u32::try_from(piece.len()).expect("piece len < u16::MAX");
        let piece_count = self.add_piece(piece)?;
        let nal = self
            .nals
            .last_mut()
            .ok_or_else(|| "fragment continuation without a start".to_owned())?;
        nal.len = nal
            .len
            .checked_add(add)
            .ok_or_else(|| "NAL too large".to_owned())?;
        if end {
            nal.next_piece_idx = piece_count;
        }
        Ok(())
    }

    /// Returns the header of the open fragment, if one is in progress.
    pub(super) fn open_fragment_hdr(&self) -> Option<[u8; H]> {
        let nal = self.nals.last()?;
        (nal.next_piece_idx == u32::MAX).then_some(nal.hdr)
    }

    /// Iterates over the headers of all collected NALs.
    pub(super) fn nal_headers(&self) -> impl Iterator<Item = [u8; H]> + '_ {
        self.nals.iter().map(|n| n.hdr)
    }

    /// Assembles everything collected so far into an Annex B byte stream and
    /// resets for the next access unit.
    ///
    /// Panics if a fragment is still open; the caller decides whether an
    /// unterminated fragment is an error or discarded.
    pub(super) fn take_annex_b(&mut self) -> Vec<u8> {
        let total: usize = self
            .nals
            .iter()
            .map(|n| START_CODE.len() + n.len as usize)
            .sum();
        let mut out = Vec::with_capacity(total);
        let mut piece_idx = 0;
        for nal in &self.nals {
            assert!(nal.next_piece_idx != u32::MAX, "open fragment at assembly");
            let next_piece_idx = nal.next_piece_idx as usize;
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(&nal.hdr);
            for piece in &self.pieces[piece_idx..next_piece_idx] {
                out.extend_from_slice(piece);
            }
            piece_idx = next_piece_idx;
        }
        debug_assert_eq!(out.len(), total);
        self.clear();
        out
    }

    fn add_piece(&mut self, piece: Bytes) -> Result<u32, String> {
        self.pieces.push(piece);
        u32::try_from(self.pieces.len()).map_err(|_| "more than u32::MAX pieces".to_owned())
    }
}

fn nal_len<const H: usize>(payload_len: usize) -> Result<u32, String> {
    u32::try_from(payload_len + H).map_err(|_| "NAL too large".to_owned())
}

/// Appends `nals` (raw, with headers) to `out` in Annex B form.
pub(super) fn append_annex_b(out: &mut Vec<u8>, nals: &[Vec<u8>]) {
    for nal in nals {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
}
