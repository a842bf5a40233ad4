// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers and selection of media streams from a
//! `DESCRIBE`'s session description.

use std::net::IpAddr;
use std::num::NonZeroU16;

use url::Url;

use crate::codec::Depacketizer;
use crate::sdp::SessionDescription;

/// Looks up a static payload type (< 96) in the RTP/AVP profile table
/// ([RFC 3551 section 6](https://datatracker.ietf.org/doc/html/rfc3551#section-6)),
/// returning `(media, encoding, clock_rate, channels)`. The registry is
/// closed, so this table never grows.
pub(crate) fn static_payload_type(
    pt: u8,
) -> Option<(&'static str, &'static str, u32, Option<NonZeroU16>)> {
    let one = NonZeroU16::new(1);
    Some(match pt {
        0 => ("audio", "pcmu", 8_000, one),
        4 => ("audio", "g723", 8_000, one),
        5 => ("audio", "dvi4", 8_000, one),
        6 => ("audio", "dvi4", 16_000, one),
        8 => ("audio", "pcma", 8_000, one),
        9 => ("audio", "g722", 8_000, one),
        10 => ("audio", "l16", 44_100, NonZeroU16::new(2)),
        11 => ("audio", "l16", 44_100, one),
        14 => ("audio", "mpa", 90_000, None),
        16 => ("audio", "dvi4", 11_025, one),
        17 => ("audio", "dvi4", 22_050, one),
        26 => ("video", "jpeg", 90_000, None),
        31 => ("video", "h261", 90_000, None),
        32 => ("video", "mpv", 90_000, None),
        33 => ("video", "mp2t", 90_000, None),
        34 => ("video", "h263", 90_000, None),
        _ => return None,
    })
}

/// Joins a control URL to a base URL in the non-RFC-compliant but common
/// way: relative controls are appended after a guaranteed trailing slash,
/// matching live555 and ffmpeg. Absolute controls are taken verbatim; `*`
/// means the base itself.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute) = Url::parse(control) {
        return Ok(absolute);
    }
    let base = base_url.as_str();
    let sep = if base.ends_with('/') { "" } else { "/" };
    Url::parse(&format!("{base}{sep}{control}"))
        .map_err(|e| format!("unable to join base url {base_url} with control {control:?}: {e}"))
}

/// A parsed `Session` response header
/// ([RFC 2326 section 12.37](https://datatracker.ietf.org/doc/html/rfc2326#section-12.37)).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

pub(crate) fn parse_session_header(value: &str) -> Result<SessionHeader, String> {
    match value.split_once(';') {
        None => Ok(SessionHeader {
            id: value.trim().into(),
            timeout_sec: 60, // the RFC default
        }),
        Some((id, rest)) => {
            let timeout = rest
                .trim()
                .strip_prefix("timeout=")
                .ok_or_else(|| format!("unparseable Session header {value:?}"))?;
            Ok(SessionHeader {
                id: id.trim().into(),
                timeout_sec: u32::from_str_radix(timeout.trim(), 10)
                    .map_err(|_| format!("unparseable Session timeout {timeout:?}"))?,
            })
        }
    }
}

/// The server's echoed `Transport` header on a `SETUP` response
/// ([RFC 2326 section 12.39](https://datatracker.ietf.org/doc/html/rfc2326#section-12.39)).
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TransportHeader {
    pub(crate) is_multicast: bool,

    /// The RTP interleaved channel; RTCP is the next one.
    pub(crate) channel_id: Option<u8>,

    /// The server's RTP/RTCP port pair for UDP.
    pub(crate) server_port: Option<(u16, u16)>,

    /// The address the server will send from, when it differs from the
    /// connection's peer.
    pub(crate) source: Option<IpAddr>,

    /// The multicast group (or rewritten unicast destination).
    pub(crate) destination: Option<IpAddr>,

    /// The multicast port pair.
    pub(crate) port: Option<(u16, u16)>,

    pub(crate) ssrc: Option<u32>,
}

pub(crate) fn parse_transport_header(value: &str) -> Result<TransportHeader, String> {
    let mut out = TransportHeader::default();
    for part in value.split(';') {
        let part = part.trim();
        if part.eq_ignore_ascii_case("multicast") {
            out.is_multicast = true;
        } else if let Some(v) = part.strip_prefix("interleaved=") {
            let (rtp, rtcp) = parse_pair::<u8>(v)?;
            if let Some(rtcp) = rtcp {
                if rtp.checked_add(1) != Some(rtcp) {
                    return Err(format!("non-adjacent interleaved channels {v:?}"));
                }
            }
            out.channel_id = Some(rtp);
        } else if let Some(v) = part.strip_prefix("server_port=") {
            let (rtp, rtcp) = parse_pair::<u16>(v)?;
            out.server_port = Some((rtp, rtcp.unwrap_or(rtp + 1)));
        } else if let Some(v) = part.strip_prefix("port=") {
            let (rtp, rtcp) = parse_pair::<u16>(v)?;
            out.port = Some((rtp, rtcp.unwrap_or(rtp + 1)));
        } else if let Some(v) = part.strip_prefix("source=") {
            out.source = Some(
                v.parse()
                    .map_err(|_| format!("unparseable source {v:?}"))?,
            );
        } else if let Some(v) = part.strip_prefix("destination=") {
            out.destination = Some(
                v.parse()
                    .map_err(|_| format!("unparseable destination {v:?}"))?,
            );
        } else if let Some(v) = part.strip_prefix("ssrc=") {
            out.ssrc = Some(
                u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {v:?}"))?,
            );
        }
    }
    Ok(out)
}

fn parse_pair<T: std::str::FromStr + Copy>(v: &str) -> Result<(T, Option<T>), String> {
    let mut parts = v.splitn(2, '-');
    let a = parts
        .next()
        .expect("splitn yields at least one part")
        .trim()
        .parse::<T>()
        .map_err(|_| format!("unparseable pair {v:?}"))?;
    let b = match parts.next() {
        Some(p) if !p.trim().is_empty() => Some(
            p.trim()
                .parse::<T>()
                .map_err(|_| format!("unparseable pair {v:?}"))?,
        ),
        _ => None,
    };
    Ok((a, b))
}

/// Returns whether an `OPTIONS` response's `Public` header advertises the
/// given method.
pub(crate) fn public_supports(public_header: Option<&str>, method: &str) -> bool {
    public_header
        .map(|v| v.split(',').any(|m| m.trim().eq_ignore_ascii_case(method)))
        .unwrap_or(false)
}

/// Which kind of media a selected stream carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub(crate) fn as_media(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

/// A media section selected for `SETUP`, with its depacketizer constructed.
pub(crate) struct SelectedStream {
    pub(crate) kind: StreamKind,
    pub(crate) control: Url,
    pub(crate) payload_type: u8,
    pub(crate) clock_rate: u32,
    pub(crate) depacketizer: Depacketizer,
}

/// Resolves the presentation's base URI: a non-`*` session-level `control`
/// attribute rebases everything under it (including aggregate requests like
/// `PLAY`).
pub(crate) fn session_base(sdp: &SessionDescription, base_url: &Url) -> Result<Url, String> {
    match sdp.attribute("control") {
        Some(c) => join_control(base_url, c),
        None => Ok(base_url.clone()),
    }
}

/// Selects the streams to set up: for each requested kind, the first media
/// section with a payload type that maps to a known depacketizer wins.
/// Video is selected (and therefore set up) before audio.
///
/// `base_url` should already be resolved via [`session_base`].
pub(crate) fn select_streams(
    sdp: &SessionDescription,
    base_url: &Url,
    want_video: bool,
    want_audio: bool,
) -> Result<Vec<SelectedStream>, String> {
    let mut out = Vec::new();
    let wanted = [
        (StreamKind::Video, want_video),
        (StreamKind::Audio, want_audio),
    ];
    for (kind, wanted) in wanted {
        if !wanted {
            continue;
        }
        'media: for m in sdp.media.iter().filter(|m| m.media == kind.as_media()) {
            for &pt in &m.payload_types {
                let (encoding, clock_rate, channels) = match m.rtpmap(pt) {
                    Some(r) => (r.encoding, r.clock_rate, r.channels),
                    None => match static_payload_type(pt) {
                        Some((_, e, c, ch)) => (e.to_owned(), c, ch),
                        None => continue,
                    },
                };
                match Depacketizer::new(
                    kind.as_media(),
                    &encoding,
                    clock_rate,
                    channels,
                    m.fmtp(pt),
                ) {
                    Ok(depacketizer) => {
                        let control = match m.control() {
                            Some(c) => join_control(base_url, c)?,
                            None => base_url.clone(),
                        };
                        out.push(SelectedStream {
                            kind,
                            control,
                            payload_type: pt,
                            clock_rate,
                            depacketizer,
                        });
                        break 'media;
                    }
                    Err(e) => {
                        log::debug!("skipping {} payload type {pt}: {e}", kind.as_media());
                    }
                }
            }
        }
    }
    if out.is_empty() {
        return Err("no media section matched a known depacketizer".to_owned());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::Mode;

    #[test]
    fn session_header() {
        assert_eq!(
            parse_session_header("12345678").unwrap(),
            SessionHeader {
                id: "12345678".into(),
                timeout_sec: 60,
            }
        );
        assert_eq!(
            parse_session_header("ABC; timeout=30").unwrap(),
            SessionHeader {
                id: "ABC".into(),
                timeout_sec: 30,
            }
        );
        assert!(parse_session_header("ABC; bogus=1").is_err());
    }

    #[test]
    fn transport_header_tcp() {
        let t = parse_transport_header("RTP/AVP/TCP;unicast;interleaved=4-5;ssrc=4F2B3418").unwrap();
        assert_eq!(t.channel_id, Some(4));
        assert_eq!(t.ssrc, Some(0x4f2b_3418));
        assert!(!t.is_multicast);
        assert!(parse_transport_header("RTP/AVP/TCP;interleaved=4-6").is_err());
    }

    #[test]
    fn transport_header_udp() {
        let t = parse_transport_header(
            "RTP/AVP;unicast;client_port=5000-5001;server_port=6256-6257;source=192.168.5.2",
        )
        .unwrap();
        assert_eq!(t.server_port, Some((6256, 6257)));
        assert_eq!(t.source, Some("192.168.5.2".parse().unwrap()));
    }

    #[test]
    fn transport_header_multicast() {
        let t = parse_transport_header(
            "RTP/AVP;multicast;destination=239.255.42.42;port=5004-5005;ttl=16",
        )
        .unwrap();
        assert!(t.is_multicast);
        assert_eq!(t.destination, Some("239.255.42.42".parse().unwrap()));
        assert_eq!(t.port, Some((5004, 5005)));
    }

    #[test]
    fn control_resolution() {
        let base = Url::parse("rtsp://cam/media.amp").unwrap();
        assert_eq!(
            join_control(&base, "trackID=1").unwrap().as_str(),
            "rtsp://cam/media.amp/trackID=1"
        );
        let slashed = Url::parse("rtsp://cam/media.amp/").unwrap();
        assert_eq!(
            join_control(&slashed, "trackID=1").unwrap().as_str(),
            "rtsp://cam/media.amp/trackID=1"
        );
        assert_eq!(
            join_control(&base, "rtsp://other/abs").unwrap().as_str(),
            "rtsp://other/abs"
        );
        assert_eq!(join_control(&base, "*").unwrap(), base);
    }

    #[test]
    fn public_header() {
        assert!(public_supports(
            Some("OPTIONS, DESCRIBE, SETUP, PLAY, GET_PARAMETER"),
            "GET_PARAMETER"
        ));
        assert!(!public_supports(Some("OPTIONS, DESCRIBE"), "GET_PARAMETER"));
        assert!(!public_supports(None, "GET_PARAMETER"));
    }

    #[test]
    fn selects_first_supported_media_video_first() {
        let sdp = "v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=x\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 0\r\n\
            a=control:trackID=2\r\n\
            m=video 0 RTP/AVP 98 96\r\n\
            a=rtpmap:98 AV2000/90000\r\n\
            a=rtpmap:96 H264/90000\r\n\
            a=control:trackID=1\r\n";
        let sdp = SessionDescription::parse(sdp.as_bytes(), Mode::Loose).unwrap();
        let base = Url::parse("rtsp://cam/media").unwrap();
        let streams = select_streams(&sdp, &base, true, true).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].kind, StreamKind::Video);
        // Unknown payload type 98 is skipped in favor of H.264.
        assert_eq!(streams[0].payload_type, 96);
        assert_eq!(streams[0].control.as_str(), "rtsp://cam/media/trackID=1");
        assert_eq!(streams[1].kind, StreamKind::Audio);
        assert_eq!(streams[1].payload_type, 0);
        assert_eq!(streams[1].clock_rate, 8_000);
    }

    #[test]
    fn session_control_rebases() {
        let sdp = "v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=x\r\n\
            t=0 0\r\n\
            a=control:rtsp://cam/real-base/\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264/90000\r\n\
            a=control:trackID=1\r\n";
        let sdp = SessionDescription::parse(sdp.as_bytes(), Mode::Loose).unwrap();
        let base = Url::parse("rtsp://cam/requested").unwrap();
        let base = session_base(&sdp, &base).unwrap();
        assert_eq!(base.as_str(), "rtsp://cam/real-base/");
        let streams = select_streams(&sdp, &base, true, false).unwrap();
        assert_eq!(
            streams[0].control.as_str(),
            "rtsp://cam/real-base/trackID=1"
        );
    }

    #[test]
    fn no_supported_media() {
        let sdp = "v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=x\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 98\r\n\
            a=rtpmap:98 AV2000/90000\r\n";
        let sdp = SessionDescription::parse(sdp.as_bytes(), Mode::Loose).unwrap();
        let base = Url::parse("rtsp://cam/media").unwrap();
        assert!(select_streams(&sdp, &base, true, true).is_err());
    }
}
