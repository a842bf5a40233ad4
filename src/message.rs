// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP/1.0 message model: requests, responses, and interleaved data frames,
//! as described in [RFC 2326](https://datatracker.ietf.org/doc/html/rfc2326).

use std::fmt::Display;

use bytes::{BufMut, Bytes, BytesMut};

/// An RTSP request method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Redirect,
    Record,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Redirect => "REDIRECT",
            Method::Record => "RECORD",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "REDIRECT" => Method::Redirect,
            "RECORD" => Method::Record,
            _ => return None,
        })
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// An ordered bag of RTSP headers.
///
/// Lookup is case-insensitive (RFC 2326 reuses RFC 2616's header grammar);
/// iteration preserves insertion order, and repeated names are kept.
#[derive(Clone, Debug, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the value of the first header with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values with the given name, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Appends a header, keeping any existing ones with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replaces all headers with the given name by a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.0.push((name.to_owned(), value.into()));
    }

    /// Removes all headers with the given name.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the `CSeq` value, if present and numeric.
    pub fn cseq(&self) -> Option<u32> {
        self.get("CSeq")
            .and_then(|v| u32::from_str_radix(v.trim(), 10).ok())
    }
}

/// An RTSP request.
///
/// `uri` is `None` for the `*` request-URI form (used by session-less
/// `OPTIONS` keepalives).
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub uri: Option<url::Url>,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Option<url::Url>) -> Self {
        Self {
            method,
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub(crate) fn write(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        match &self.uri {
            Some(u) => dst.extend_from_slice(u.as_str().as_bytes()),
            None => dst.put_u8(b'*'),
        }
        dst.extend_from_slice(b" RTSP/1.0\r\n");
        write_headers_and_body(&self.headers, &self.body, dst);
    }
}

/// An RTSP response.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub(crate) fn write(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(
            format!("RTSP/1.0 {} {}\r\n", self.status, self.reason).as_bytes(),
        );
        write_headers_and_body(&self.headers, &self.body, dst);
    }
}

fn write_headers_and_body(headers: &Headers, body: &Bytes, dst: &mut BytesMut) {
    let mut wrote_len = false;
    for (n, v) in headers.iter() {
        if n.eq_ignore_ascii_case("Content-Length") {
            wrote_len = true;
        }
        dst.extend_from_slice(n.as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(v.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    if !body.is_empty() && !wrote_len {
        dst.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    dst.extend_from_slice(b"\r\n");
    dst.extend_from_slice(body);
}

/// A parsed RTSP message: a request, a response, or an interleaved binary
/// frame.
#[derive(Clone, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
    Data { channel: u8, body: Bytes },
}

/// The outcome of a failed [`Message::parse`].
#[derive(Debug)]
pub enum ParseError {
    /// More bytes are needed; none have been consumed.
    Incomplete,

    /// The buffered bytes can never form a valid message.
    Invalid(String),
}

impl Message {
    /// Parses one textual RTSP message from the start of `src`, returning it
    /// and the number of bytes consumed.
    ///
    /// Interleaved (`$`-prefixed) frames are not handled here; the connection
    /// layer strips them before the text parser runs. Lines may be terminated
    /// by CRLF or bare LF (some cameras emit the latter).
    pub fn parse(src: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut pos = 0;
        let (start_line, mut pos) = match line(src, &mut pos) {
            Some(l) => (l, pos),
            None => return Err(ParseError::Incomplete),
        };
        let start_line = str_or_invalid(start_line)?;

        let mut headers = Headers::new();
        loop {
            let raw = match line(src, &mut pos) {
                Some(l) => l,
                None => return Err(ParseError::Incomplete),
            };
            if raw.is_empty() {
                break;
            }
            let raw = str_or_invalid(raw)?;
            if raw.starts_with(' ') || raw.starts_with('\t') {
                // Obsolete line folding: append to the previous header.
                match headers.0.last_mut() {
                    Some((_, v)) => {
                        v.push(' ');
                        v.push_str(raw.trim());
                    }
                    None => {
                        return Err(ParseError::Invalid(
                            "continuation line before first header".to_owned(),
                        ))
                    }
                }
                continue;
            }
            let (name, value) = raw
                .split_once(':')
                .ok_or_else(|| ParseError::Invalid(format!("header line without colon: {raw:?}")))?;
            headers.add(name.trim(), value.trim());
        }

        let body_len = match headers.get("Content-Length") {
            None => 0,
            Some(v) => usize::from_str_radix(v.trim(), 10)
                .map_err(|_| ParseError::Invalid(format!("bad Content-Length {v:?}")))?,
        };
        if src.len() < pos + body_len {
            return Err(ParseError::Incomplete);
        }
        let body = Bytes::copy_from_slice(&src[pos..pos + body_len]);
        pos += body_len;

        let msg = if let Some(rest) = start_line.strip_prefix("RTSP/1.0 ") {
            let mut parts = rest.splitn(2, ' ');
            let status = parts.next().expect("splitn yields at least one part");
            let status = u16::from_str_radix(status, 10)
                .map_err(|_| ParseError::Invalid(format!("bad status line {start_line:?}")))?;
            let reason = parts.next().unwrap_or("").to_owned();
            Message::Response(Response {
                status,
                reason,
                headers,
                body,
            })
        } else {
            let mut parts = start_line.split(' ');
            let method = parts
                .next()
                .and_then(Method::from_str)
                .ok_or_else(|| ParseError::Invalid(format!("bad request line {start_line:?}")))?;
            let uri = parts
                .next()
                .ok_or_else(|| ParseError::Invalid(format!("request line without URI: {start_line:?}")))?;
            let version = parts.next();
            if !matches!(version, Some("RTSP/1.0")) {
                return Err(ParseError::Invalid(format!(
                    "bad version in request line {start_line:?}"
                )));
            }
            let uri = if uri == "*" {
                None
            } else {
                Some(url::Url::parse(uri).map_err(|e| {
                    ParseError::Invalid(format!("bad request URI {uri:?}: {e}"))
                })?)
            };
            Message::Request(Request {
                method,
                uri,
                headers,
                body,
            })
        };
        Ok((msg, pos))
    }

    pub(crate) fn write(&self, dst: &mut BytesMut) {
        match self {
            Message::Request(r) => r.write(dst),
            Message::Response(r) => r.write(dst),
            Message::Data { channel, body } => {
                dst.put_u8(b'$');
                dst.put_u8(*channel);
                dst.put_u16(u16::try_from(body.len()).expect("interleaved frame fits in u16"));
                dst.extend_from_slice(body);
            }
        }
    }
}

/// Returns the next line (without its terminator) and advances `pos` past it,
/// or `None` if no full line is buffered yet.
fn line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let nl = src[*pos..].iter().position(|&b| b == b'\n')?;
    let start = *pos;
    let mut end = start + nl;
    *pos = end + 1;
    if end > start && src[end - 1] == b'\r' {
        end -= 1;
    }
    Some(&src[start..end])
}

fn str_or_invalid(raw: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(raw)
        .map_err(|_| ParseError::Invalid("message line is not valid UTF-8".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_with_body() {
        let raw = b"RTSP/1.0 200 OK\r\n\
                    CSeq: 2\r\n\
                    Content-Type: application/sdp\r\n\
                    Content-Length: 5\r\n\
                    \r\n\
                    hellorest";
        let (msg, len) = Message::parse(raw).unwrap();
        assert_eq!(len, raw.len() - 4);
        let resp = match msg {
            Message::Response(r) => r,
            o => panic!("expected response, got {o:?}"),
        };
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.headers.cseq(), Some(2));
        assert_eq!(&resp.body[..], b"hello");
    }

    #[test]
    fn parse_request_bare_lf() {
        let raw = b"OPTIONS rtsp://cam/stream RTSP/1.0\nCSeq: 1\n\n";
        let (msg, len) = Message::parse(raw).unwrap();
        assert_eq!(len, raw.len());
        let req = match msg {
            Message::Request(r) => r,
            o => panic!("expected request, got {o:?}"),
        };
        assert_eq!(req.method, Method::Options);
        assert_eq!(req.uri.unwrap().as_str(), "rtsp://cam/stream");
    }

    #[test]
    fn incomplete() {
        assert!(matches!(
            Message::parse(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n"),
            Err(ParseError::Incomplete)
        ));
        assert!(matches!(
            Message::parse(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 10\r\n\r\nshort"),
            Err(ParseError::Incomplete)
        ));
    }

    #[test]
    fn headers_case_insensitive_ordered() {
        let mut h = Headers::new();
        h.add("Session", "1234");
        h.add("WWW-Authenticate", "Digest realm=\"a\"");
        h.add("WWW-Authenticate", "Basic realm=\"a\"");
        assert_eq!(h.get("session"), Some("1234"));
        assert_eq!(h.get("www-authenticate"), Some("Digest realm=\"a\""));
        let all: Vec<_> = h.get_all("WWW-AUTHENTICATE").collect();
        assert_eq!(all, ["Digest realm=\"a\"", "Basic realm=\"a\""]);
    }

    #[test]
    fn roundtrip_request() {
        let req = Request::new(
            Method::Setup,
            Some(url::Url::parse("rtsp://cam/trackID=1").unwrap()),
        )
        .with_header("CSeq", "3")
        .with_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1");
        let mut buf = BytesMut::new();
        req.write(&mut buf);
        let (msg, len) = Message::parse(&buf).unwrap();
        assert_eq!(len, buf.len());
        match msg {
            Message::Request(r) => {
                assert_eq!(r.method, Method::Setup);
                assert_eq!(r.headers.cseq(), Some(3));
            }
            o => panic!("expected request, got {o:?}"),
        }
    }

    #[test]
    fn star_uri() {
        let req = Request::new(Method::Options, None).with_header("CSeq", "9");
        let mut buf = BytesMut::new();
        req.write(&mut buf);
        assert!(buf.starts_with(b"OPTIONS * RTSP/1.0\r\n"));
        let (msg, _) = Message::parse(&buf).unwrap();
        match msg {
            Message::Request(r) => assert!(r.uri.is_none()),
            o => panic!("expected request, got {o:?}"),
        }
    }
}
