// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async RTSP client library for IP cameras, NVRs, and other ONVIF-style
//! devices.
//!
//! The client negotiates a media session over RTSP (RFC 2326), receives RTP
//! (RFC 3550) over interleaved TCP, unicast UDP, or multicast UDP, and
//! reassembles codec access units from the RTP payloads. It does not decode
//! media; see [`codec`] for the elementary-stream output formats.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use std::fmt::{Debug, Display};
use std::net::{IpAddr, SocketAddr};

mod error;
mod hex;

pub use error::{Error, ErrorKind};

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod auth;
pub mod client;
pub mod codec;
mod conn;
pub mod message;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
mod transport;
mod tunnel;

pub use client::{
    Credentials, Event, Events, MediaMask, PlayOptions, Session, SessionOptions, Transport,
};

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp(2_208_988_800 << 32);

/// A wallclock time in the fixed-point format of the Network Time Protocol.
///
/// The top 32 bits are seconds since 0h UTC on 1 January 1900 (wrapping every
/// 68 years); the bottom 32 bits are the fractional second. RTCP Sender
/// Reports carry timestamps in this format, and they're allowed to jump
/// backward or be complete nonsense; don't assume monotonicity.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Converts to a UTC wall-clock time, assuming the time is within 68
    /// years of the Unix epoch.
    pub fn to_utc(self) -> chrono::DateTime<chrono::Utc> {
        let since_epoch = self.0.wrapping_sub(UNIX_EPOCH.0);
        let secs = (since_epoch >> 32) as u32;
        let frac = (since_epoch & 0xFFFF_FFFF) as u32;
        let nanos = ((f64::from(frac) / f64::from(u32::MAX)) * 1e9).round() as u32;
        chrono::DateTime::UNIX_EPOCH
            + chrono::Duration::try_seconds(i64::from(secs)).expect("u32 secs in range")
            + chrono::Duration::nanoseconds(i64::from(nanos))
    }

    /// Converts from a UTC wall-clock time.
    pub fn from_utc(t: chrono::DateTime<chrono::Utc>) -> Option<Self> {
        let since_epoch = t - chrono::DateTime::UNIX_EPOCH;
        let secs = u32::try_from(since_epoch.num_seconds()).ok()?;
        let nanos = since_epoch.subsec_nanos().unsigned_abs();
        let frac = ((f64::from(nanos) / 1e9) * f64::from(u32::MAX)).round() as u32;
        Some(NtpTimestamp(
            UNIX_EPOCH
                .0
                .wrapping_add((u64::from(secs) << 32) + u64::from(frac)),
        ))
    }
}

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_utc().format("%FT%T%.3fZ"))
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub(crate) fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self::new(addr, addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture: the bottom 32 bits of `pos` can be
/// compared to the relative TCP sequence number.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    pos: u64,
    received_wall: WallTime,
}

impl RtspMessageContext {
    pub(crate) fn new(pos: u64) -> Self {
        Self {
            pos,
            received_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self::new(0)
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}
