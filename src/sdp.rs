// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SDP ([RFC 4566](https://datatracker.ietf.org/doc/html/rfc4566)) session
//! descriptions, as returned by a successful RTSP `DESCRIBE`.
//!
//! The parser is line-oriented and has two modes: `Strict` rejects unknown
//! keys and an absent session name, `Loose` (the default) skips unknown keys
//! and tolerates cameras which omit `s=`.

use std::fmt::Display;
use std::num::NonZeroU16;

/// Parser behavior on out-of-spec input.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Reject unknown keys and require a non-empty session name.
    Strict,

    /// Skip unknown keys; tolerate a missing session name.
    #[default]
    Loose,
}

/// The `o=` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

/// A `c=` line, at session or media level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub net_type: String,
    pub addr_type: String,

    /// The address, possibly with `/ttl` and `/count` suffixes for multicast.
    pub address: String,
}

impl Connection {
    /// Returns the bare address with any `/ttl` or `/count` suffix removed.
    pub fn base_address(&self) -> &str {
        self.address.split('/').next().expect("split is non-empty")
    }
}

/// A `b=` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bandwidth {
    pub kind: String,
    pub kbps: u64,
}

/// A `t=` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    pub start: u64,
    pub stop: u64,
}

/// An `a=` line: either a flag (`a=recvonly`) or a key with a value
/// (`a=rtpmap:96 H264/90000`). The value's case is preserved; key lookup is
/// case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    pub value: Option<String>,
}

/// A parsed `a=rtpmap` value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,

    /// The encoding name with ASCII characters lowercased, e.g. `h264`.
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<NonZeroU16>,
}

/// A media section: the `m=` line and everything following it up to the next
/// `m=` or end of input.
#[derive(Clone, Debug, Default)]
pub struct Media {
    /// `audio`, `video`, `application`, ...
    pub media: String,
    pub port: u16,
    pub port_count: Option<u16>,

    /// The transport, e.g. `RTP/AVP`.
    pub proto: String,

    /// RTP payload type numbers, in preference order.
    pub payload_types: Vec<u8>,

    pub title: Option<String>,
    pub connections: Vec<Connection>,
    pub bandwidth: Vec<Bandwidth>,
    pub attributes: Vec<Attribute>,
}

impl Media {
    /// Returns the value of the first attribute with the given key
    /// (case-insensitive), or `None`. A flag attribute yields `Some("")`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        attribute(&self.attributes, key)
    }

    /// Parses the `a=rtpmap` entry for the given payload type, if present.
    pub fn rtpmap(&self, payload_type: u8) -> Option<RtpMap> {
        self.attributes
            .iter()
            .filter(|a| a.key.eq_ignore_ascii_case("rtpmap"))
            .filter_map(|a| parse_rtpmap(a.value.as_deref()?))
            .find(|r| r.payload_type == payload_type)
    }

    /// Returns the `a=fmtp` format parameters for the given payload type.
    pub fn fmtp(&self, payload_type: u8) -> Option<&str> {
        self.attributes
            .iter()
            .filter(|a| a.key.eq_ignore_ascii_case("fmtp"))
            .filter_map(|a| a.value.as_deref())
            .find_map(|v| {
                let (pt, params) = v.split_once(char::is_whitespace)?;
                (u8::from_str_radix(pt.trim(), 10) == Ok(payload_type))
                    .then(|| params.trim_start())
            })
    }

    /// Returns the media-level `a=control` value, if any.
    pub fn control(&self) -> Option<&str> {
        self.attribute("control")
    }
}

/// A full session description.
#[derive(Clone, Debug)]
pub struct SessionDescription {
    pub version: u8,
    pub origin: Origin,

    /// The `s=` line; `None` only in loose mode.
    pub name: Option<String>,

    pub info: Option<String>,
    pub uri: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub connection: Option<Connection>,
    pub bandwidth: Vec<Bandwidth>,
    pub times: Vec<Timing>,
    pub attributes: Vec<Attribute>,
    pub media: Vec<Media>,
}

impl SessionDescription {
    /// Returns the value of the first session-level attribute with the given
    /// key (case-insensitive).
    pub fn attribute(&self, key: &str) -> Option<&str> {
        attribute(&self.attributes, key)
    }

    /// Parses a session description.
    pub fn parse(raw: &[u8], mode: Mode) -> Result<Self, String> {
        let raw = std::str::from_utf8(raw).map_err(|_| "SDP is not valid UTF-8".to_owned())?;
        let mut version = None;
        let mut origin = None;
        let mut name = None;
        let mut info = None;
        let mut uri = None;
        let mut email = None;
        let mut phone = None;
        let mut connection = None;
        let mut bandwidth = Vec::new();
        let mut times = Vec::new();
        let mut attributes = Vec::new();
        let mut media: Vec<Media> = Vec::new();

        for full_line in raw.lines() {
            let l = full_line.trim_end_matches('\r');
            if l.is_empty() {
                continue;
            }
            let (key, value) = match l.split_once('=') {
                Some((k, v)) if k.len() == 1 => (k.as_bytes()[0], v),
                _ => {
                    if mode == Mode::Strict {
                        return Err(format!("malformed SDP line {l:?}"));
                    }
                    continue;
                }
            };
            if key == b'm' {
                media.push(parse_media_line(value)?);
                continue;
            }
            match media.last_mut() {
                // Media-level keys: i, c, b, k, a.
                Some(m) => match key {
                    b'i' => m.title = Some(value.to_owned()),
                    b'c' => m.connections.push(parse_connection(value)?),
                    b'b' => m.bandwidth.push(parse_bandwidth(value)?),
                    b'a' => m.attributes.push(parse_attribute(value)),
                    b'k' => {}
                    _ if mode == Mode::Strict => {
                        return Err(format!("unknown media-level SDP key {:?}", key as char));
                    }
                    _ => {}
                },
                // Session-level keys.
                None => match key {
                    b'v' => {
                        version = Some(
                            u8::from_str_radix(value, 10)
                                .map_err(|_| format!("bad SDP version {value:?}"))?,
                        )
                    }
                    b'o' => origin = Some(parse_origin(value)?),
                    b's' => name = Some(value.to_owned()),
                    b'i' => info = Some(value.to_owned()),
                    b'u' => uri = Some(value.to_owned()),
                    b'e' => email = Some(value.to_owned()),
                    b'p' => phone = Some(value.to_owned()),
                    b'c' => connection = Some(parse_connection(value)?),
                    b'b' => bandwidth.push(parse_bandwidth(value)?),
                    b't' => times.push(parse_timing(value)?),
                    b'a' => attributes.push(parse_attribute(value)),
                    b'r' | b'z' | b'k' => {}
                    _ if mode == Mode::Strict => {
                        return Err(format!("unknown session-level SDP key {:?}", key as char));
                    }
                    _ => {}
                },
            }
        }

        let version = version.ok_or_else(|| "SDP is missing v=".to_owned())?;
        let origin = origin.ok_or_else(|| "SDP is missing o=".to_owned())?;
        if media.is_empty() {
            return Err("SDP has no media sections".to_owned());
        }
        if mode == Mode::Strict && name.as_deref().unwrap_or("").is_empty() {
            return Err("SDP is missing a session name".to_owned());
        }
        Ok(SessionDescription {
            version,
            origin,
            name,
            info,
            uri,
            email,
            phone,
            connection,
            bandwidth,
            times,
            attributes,
            media,
        })
    }
}

fn attribute<'a>(attrs: &'a [Attribute], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|a| a.key.eq_ignore_ascii_case(key))
        .map(|a| a.value.as_deref().unwrap_or(""))
}

fn parse_origin(value: &str) -> Result<Origin, String> {
    let mut f = value.split_ascii_whitespace();
    let origin = Origin {
        username: f.next().unwrap_or("").to_owned(),
        session_id: f.next().unwrap_or("").to_owned(),
        session_version: f.next().unwrap_or("").to_owned(),
        net_type: f.next().unwrap_or("").to_owned(),
        addr_type: f.next().unwrap_or("").to_owned(),
        address: f.next().unwrap_or("").to_owned(),
    };
    if origin.address.is_empty() {
        return Err(format!("bad o= line {value:?}"));
    }
    Ok(origin)
}

fn parse_connection(value: &str) -> Result<Connection, String> {
    let mut f = value.split_ascii_whitespace();
    let c = Connection {
        net_type: f.next().unwrap_or("").to_owned(),
        addr_type: f.next().unwrap_or("").to_owned(),
        address: f.next().unwrap_or("").to_owned(),
    };
    if c.address.is_empty() {
        return Err(format!("bad c= line {value:?}"));
    }
    Ok(c)
}

fn parse_bandwidth(value: &str) -> Result<Bandwidth, String> {
    let (kind, kbps) = value
        .split_once(':')
        .ok_or_else(|| format!("bad b= line {value:?}"))?;
    Ok(Bandwidth {
        kind: kind.to_owned(),
        kbps: u64::from_str_radix(kbps.trim(), 10).map_err(|_| format!("bad b= line {value:?}"))?,
    })
}

fn parse_timing(value: &str) -> Result<Timing, String> {
    let mut f = value.split_ascii_whitespace();
    let start = f.next().and_then(|v| u64::from_str_radix(v, 10).ok());
    let stop = f.next().and_then(|v| u64::from_str_radix(v, 10).ok());
    match (start, stop) {
        (Some(start), Some(stop)) => Ok(Timing { start, stop }),
        _ => Err(format!("bad t= line {value:?}")),
    }
}

fn parse_attribute(value: &str) -> Attribute {
    match value.split_once(':') {
        Some((k, v)) => Attribute {
            key: k.to_owned(),
            value: Some(v.to_owned()),
        },
        None => Attribute {
            key: value.to_owned(),
            value: None,
        },
    }
}

fn parse_media_line(value: &str) -> Result<Media, String> {
    let mut f = value.split_ascii_whitespace();
    let media = f
        .next()
        .ok_or_else(|| format!("bad m= line {value:?}"))?
        .to_owned();
    let port_spec = f.next().ok_or_else(|| format!("bad m= line {value:?}"))?;
    let (port, port_count) = match port_spec.split_once('/') {
        Some((p, n)) => (
            u16::from_str_radix(p, 10).map_err(|_| format!("bad m= port {port_spec:?}"))?,
            Some(u16::from_str_radix(n, 10).map_err(|_| format!("bad m= port {port_spec:?}"))?),
        ),
        None => (
            u16::from_str_radix(port_spec, 10).map_err(|_| format!("bad m= port {port_spec:?}"))?,
            None,
        ),
    };
    let proto = f
        .next()
        .ok_or_else(|| format!("m= line without proto: {value:?}"))?
        .to_owned();
    let mut payload_types = Vec::new();
    for fmt in f {
        // Non-numeric formats are possible for non-RTP protos; skip them.
        if let Ok(pt) = u8::from_str_radix(fmt, 10) {
            payload_types.push(pt);
        }
    }
    Ok(Media {
        media,
        port,
        port_count,
        proto,
        payload_types,
        ..Media::default()
    })
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    // rtpmap:<payload type> <encoding name>/<clock rate>[/<encoding parameters>]
    let (pt, rest) = value.split_once(char::is_whitespace)?;
    let payload_type = u8::from_str_radix(pt.trim(), 10).ok()?;
    let mut parts = rest.trim().split('/');
    let encoding = parts.next()?.to_ascii_lowercase();
    let clock_rate = u32::from_str_radix(parts.next()?, 10).ok()?;
    let channels = match parts.next() {
        Some(c) => Some(NonZeroU16::new(u16::from_str_radix(c, 10).ok()?)?),
        None => None,
    };
    Some(RtpMap {
        payload_type,
        encoding,
        clock_rate,
        channels,
    })
}

impl Display for SessionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "v={}\r", self.version)?;
        let o = &self.origin;
        writeln!(
            f,
            "o={} {} {} {} {} {}\r",
            o.username, o.session_id, o.session_version, o.net_type, o.addr_type, o.address
        )?;
        writeln!(f, "s={}\r", self.name.as_deref().unwrap_or(" "))?;
        if let Some(v) = &self.info {
            writeln!(f, "i={v}\r")?;
        }
        if let Some(v) = &self.uri {
            writeln!(f, "u={v}\r")?;
        }
        if let Some(v) = &self.email {
            writeln!(f, "e={v}\r")?;
        }
        if let Some(v) = &self.phone {
            writeln!(f, "p={v}\r")?;
        }
        if let Some(c) = &self.connection {
            writeln!(f, "c={} {} {}\r", c.net_type, c.addr_type, c.address)?;
        }
        for b in &self.bandwidth {
            writeln!(f, "b={}:{}\r", b.kind, b.kbps)?;
        }
        for t in &self.times {
            writeln!(f, "t={} {}\r", t.start, t.stop)?;
        }
        write_attributes(f, &self.attributes)?;
        for m in &self.media {
            write!(f, "m={} {}", m.media, m.port)?;
            if let Some(n) = m.port_count {
                write!(f, "/{n}")?;
            }
            write!(f, " {}", m.proto)?;
            for pt in &m.payload_types {
                write!(f, " {pt}")?;
            }
            writeln!(f, "\r")?;
            if let Some(v) = &m.title {
                writeln!(f, "i={v}\r")?;
            }
            for c in &m.connections {
                writeln!(f, "c={} {} {}\r", c.net_type, c.addr_type, c.address)?;
            }
            for b in &m.bandwidth {
                writeln!(f, "b={}:{}\r", b.kind, b.kbps)?;
            }
            write_attributes(f, &m.attributes)?;
        }
        Ok(())
    }
}

fn write_attributes(f: &mut std::fmt::Formatter<'_>, attrs: &[Attribute]) -> std::fmt::Result {
    for a in attrs {
        match &a.value {
            Some(v) => writeln!(f, "a={}:{v}\r", a.key)?,
            None => writeln!(f, "a={}\r", a.key)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal camera-style description: one H.264 video track.
    const H264_SDP: &str = "v=0\r\n\
        o=- 2252478537 2252478537 IN IP4 0.0.0.0\r\n\
        s=Media Presentation\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 sprop-parameter-sets=Z0IAH6tAUB7TcBAQEACA,aM48gA==\r\n\
        a=control:trackID=1\r\n";

    #[test]
    fn parse_h264_video() {
        let s = SessionDescription::parse(H264_SDP.as_bytes(), Mode::Strict).unwrap();
        assert_eq!(s.media.len(), 1);
        let m = &s.media[0];
        assert_eq!(m.media, "video");
        assert_eq!(m.payload_types, [96]);
        assert_eq!(m.control(), Some("trackID=1"));
        let rtpmap = m.rtpmap(96).unwrap();
        assert_eq!(rtpmap.encoding, "h264");
        assert_eq!(rtpmap.clock_rate, 90_000);
        assert_eq!(
            m.fmtp(96),
            Some("sprop-parameter-sets=Z0IAH6tAUB7TcBAQEACA,aM48gA==")
        );
        assert_eq!(s.attribute("control"), Some("*"));
    }

    #[test]
    fn missing_session_name() {
        let sdp = "v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 0\r\n";
        assert!(SessionDescription::parse(sdp.as_bytes(), Mode::Strict).is_err());
        let s = SessionDescription::parse(sdp.as_bytes(), Mode::Loose).unwrap();
        assert!(s.name.is_none());
        assert_eq!(s.media[0].payload_types, [0]);
    }

    #[test]
    fn requires_origin_and_media() {
        assert!(SessionDescription::parse(b"v=0\r\nm=video 0 RTP/AVP 96\r\n", Mode::Loose).is_err());
        assert!(SessionDescription::parse(
            b"v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n",
            Mode::Loose
        )
        .is_err());
    }

    #[test]
    fn unknown_key() {
        let sdp = "v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=x\r\n\
            t=0 0\r\n\
            y=bogus\r\n\
            m=video 0 RTP/AVP 96\r\n";
        assert!(SessionDescription::parse(sdp.as_bytes(), Mode::Strict).is_err());
        assert!(SessionDescription::parse(sdp.as_bytes(), Mode::Loose).is_ok());
    }

    #[test]
    fn multichannel_rtpmap() {
        let sdp = "v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=x\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 97\r\n\
            a=rtpmap:97 mpeg4-generic/48000/2\r\n";
        let s = SessionDescription::parse(sdp.as_bytes(), Mode::Loose).unwrap();
        let rtpmap = s.media[0].rtpmap(97).unwrap();
        assert_eq!(rtpmap.clock_rate, 48_000);
        assert_eq!(rtpmap.channels, NonZeroU16::new(2));
    }

    #[test]
    fn multicast_connection() {
        let sdp = "v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=x\r\n\
            t=0 0\r\n\
            m=video 5000 RTP/AVP 96\r\n\
            c=IN IP4 239.0.0.1/64\r\n\
            a=rtpmap:96 H264/90000\r\n";
        let s = SessionDescription::parse(sdp.as_bytes(), Mode::Loose).unwrap();
        let m = &s.media[0];
        assert_eq!(m.port, 5000);
        assert_eq!(m.connections[0].base_address(), "239.0.0.1");
    }

    #[test]
    fn roundtrip_preserves_media_tuples() {
        let s = SessionDescription::parse(H264_SDP.as_bytes(), Mode::Strict).unwrap();
        let reparsed =
            SessionDescription::parse(s.to_string().as_bytes(), Mode::Strict).unwrap();
        assert_eq!(reparsed.media.len(), s.media.len());
        for (a, b) in s.media.iter().zip(reparsed.media.iter()) {
            assert_eq!(a.media, b.media);
            assert_eq!(a.payload_types, b.payload_types);
            assert_eq!(a.control(), b.control());
            assert_eq!(a.rtpmap(96), b.rtpmap(96));
            assert_eq!(a.fmtp(96), b.fmtp(96));
        }
    }
}
