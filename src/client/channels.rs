// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mapping of interleaved channel ids to streams.
//!
//! Each stream claims an adjacent (RTP, RTCP) channel pair, so only the
//! even-numbered half is stored.

use smallvec::SmallVec;
use std::num::NonZeroU8;

use crate::transport::PacketKind;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChannelMapping {
    pub(crate) stream_id: usize,
    pub(crate) kind: PacketKind,
}

/// Assignments of channel pairs to stream indices.
///
/// Index `channel_id / 2` holds `stream_id + 1`, so the common case of a
/// handful of streams stays inline.
#[derive(Default)]
pub(crate) struct ChannelMap(SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelMap {
    /// Returns the next even channel id with no assignment.
    pub(crate) fn next_unassigned(&self) -> Option<u8> {
        if let Some(i) = self.0.iter().position(Option::is_none) {
            return Some((i as u8) << 1);
        }
        let i = self.0.len();
        if i < 128 {
            return Some((i as u8) << 1);
        }
        None
    }

    /// Assigns the pair starting at `channel_id` to `stream_id`.
    pub(crate) fn assign(&mut self, channel_id: u8, stream_id: usize) -> Result<(), String> {
        if channel_id % 2 != 0 {
            return Err(format!("odd channel id {channel_id} for RTP"));
        }
        let stream = NonZeroU8::new(
            u8::try_from(stream_id + 1).map_err(|_| "more than 254 streams".to_owned())?,
        )
        .expect("stream_id + 1 is non-zero");
        let i = usize::from(channel_id >> 1);
        if self.0.len() <= i {
            self.0.resize(i + 1, None);
        }
        if let Some(existing) = self.0[i] {
            if usize::from(existing.get()) - 1 != stream_id {
                return Err(format!(
                    "channel pair {channel_id}-{} already assigned to stream {}",
                    channel_id + 1,
                    existing.get() - 1
                ));
            }
        }
        self.0[i] = Some(stream);
        Ok(())
    }

    /// Looks up a received channel id.
    pub(crate) fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let stream = (*self.0.get(usize::from(channel_id >> 1))?)?;
        Some(ChannelMapping {
            stream_id: usize::from(stream.get()) - 1,
            kind: if channel_id % 2 == 0 {
                PacketKind::Rtp
            } else {
                PacketKind::Rtcp
            },
        })
    }
}

impl std::fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().enumerate().filter_map(|(i, s)| {
                s.map(|s| {
                    (
                        format!("{}-{}", i << 1, (i << 1) + 1),
                        usize::from(s.get()) - 1,
                    )
                })
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_and_lookup() {
        let mut m = ChannelMap::default();
        assert_eq!(m.next_unassigned(), Some(0));
        m.assign(0, 0).unwrap();
        assert_eq!(m.next_unassigned(), Some(2));
        // The server may override our proposal with a higher pair.
        m.assign(6, 1).unwrap();
        assert_eq!(
            m.lookup(0),
            Some(ChannelMapping {
                stream_id: 0,
                kind: PacketKind::Rtp
            })
        );
        assert_eq!(
            m.lookup(7),
            Some(ChannelMapping {
                stream_id: 1,
                kind: PacketKind::Rtcp
            })
        );
        assert_eq!(m.lookup(2), None);
        assert_eq!(m.next_unassigned(), Some(2));
    }

    #[test]
    fn rejects_conflicts() {
        let mut m = ChannelMap::default();
        m.assign(0, 0).unwrap();
        assert!(m.assign(0, 1).is_err());
        assert!(m.assign(1, 1).is_err());
        m.assign(0, 0).unwrap(); // reassigning the same stream is fine
    }
}
