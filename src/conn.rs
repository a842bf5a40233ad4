// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The framed RTSP connection: reads a stream of bytes and yields RTSP
//! messages or interleaved binary frames; writes are serialized through a
//! single sink. The send path assigns `CSeq` values and records outgoing
//! requests so responses can be paired with what prompted them.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::ErrorInt;
use crate::message::{Message, ParseError, Request};
use crate::{ConnectionContext, Error, RtspMessageContext};

/// The byte-stream requirements of a [`Connection`]: satisfied by a
/// [`TcpStream`], the HTTP tunnel, or a caller-supplied stream (e.g. a
/// TLS session for `rtsps`).
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// A received RTSP message annotated with its position in the stream.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub(crate) ctx: RtspMessageContext,
    pub(crate) msg: Message,
}

/// Why a request was sent: keepalives get filtered out of the main state
/// machine, and a 401 on one must not fail the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Purpose {
    User,
    Keepalive,
}

/// An outgoing request awaiting its response, keyed by `CSeq` in
/// [`Connection::pending`].
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) request: Request,
    pub(crate) purpose: Purpose,
    pub(crate) sent_at: tokio::time::Instant,
}

/// An RTSP connection over any [`Io`].
pub(crate) struct Connection {
    framed: Framed<BoxedIo, Codec>,

    /// The next `CSeq` value; strictly increasing over the connection.
    next_cseq: u32,

    pending: HashMap<u32, PendingRequest>,
}

impl Connection {
    pub(crate) async fn connect(host: &str, port: u16) -> Result<Self, std::io::Error> {
        let stream = TcpStream::connect((host, port)).await?;
        let ctx = ConnectionContext::new(stream.local_addr()?, stream.peer_addr()?);
        Ok(Self::from_io(Box::new(stream), ctx))
    }

    pub(crate) fn from_io(io: BoxedIo, ctx: ConnectionContext) -> Self {
        Self {
            framed: Framed::new(io, Codec { ctx, read_pos: 0 }),
            next_cseq: 1,
            pending: HashMap::new(),
        }
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.framed.codec().ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext::new(
            self.framed.codec().read_pos + self.framed.read_buffer().remaining() as u64,
        )
    }

    /// Sends a request, assigning the next `CSeq` and recording it in the
    /// pending map. Returns the assigned `CSeq`.
    pub(crate) async fn send_request(
        &mut self,
        mut req: Request,
        purpose: Purpose,
    ) -> Result<u32, Error> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        req.headers.set("CSeq", cseq.to_string());
        self.framed
            .send(Message::Request(req.clone()))
            .await
            .map_err(|e| self.wrap_write_err(e))?;
        self.pending.insert(
            cseq,
            PendingRequest {
                request: req,
                purpose,
                sent_at: tokio::time::Instant::now(),
            },
        );
        Ok(cseq)
    }

    /// Sends an interleaved data frame (e.g. an RTCP receiver report).
    pub(crate) async fn send_data(&mut self, channel: u8, body: Bytes) -> Result<(), Error> {
        self.framed
            .send(Message::Data { channel, body })
            .await
            .map_err(|e| self.wrap_write_err(e))
    }

    /// Detaches the pending request matching a response's `CSeq`.
    pub(crate) fn take_pending(&mut self, cseq: u32) -> Option<PendingRequest> {
        self.pending.remove(&cseq)
    }

    /// Returns the `CSeq` of a pending request older than `timeout`, if any.
    pub(crate) fn timed_out_cseq(&self, timeout: std::time::Duration) -> Option<u32> {
        let now = tokio::time::Instant::now();
        self.pending
            .iter()
            .find(|(_, p)| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|(&cseq, _)| cseq)
    }

    /// Reads the next message. `None` means a clean EOF.
    pub(crate) async fn next(&mut self) -> Option<Result<ReceivedMessage, Error>> {
        let conn_ctx = *self.ctx();
        let eof_ctx = self.eof_ctx();
        self.framed.next().await.map(|r| {
            r.map_err(|e| {
                wrap!(match e {
                    CodecError::Io(source) => ErrorInt::ReadError {
                        conn_ctx,
                        msg_ctx: eof_ctx,
                        source,
                    },
                    CodecError::Parse { description, pos } => ErrorInt::FramingError {
                        conn_ctx,
                        msg_ctx: RtspMessageContext::new(pos),
                        description,
                    },
                })
            })
        })
    }

    fn wrap_write_err(&self, e: CodecError) -> Error {
        match e {
            CodecError::Io(source) => wrap!(ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            }),
            CodecError::Parse { .. } => unreachable!("encoding is infallible"),
        }
    }
}

/// An intermediate error type; [`Framed`] requires the codec error to
/// implement `From<std::io::Error>`, while [`Error`] wants context.
#[derive(Debug)]
enum CodecError {
    Io(std::io::Error),
    Parse { description: String, pos: u64 },
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

/// Encodes and decodes RTSP messages and interleaved frames.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message)>, CodecError> {
        // Tolerate leading CRLFs; some servers pad between messages.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            // Interleaved binary data: `$`, channel, 16-bit length, payload.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut frame = src.split_to(len);
            frame.advance(4);
            return Ok(Some((
                len,
                Message::Data {
                    channel,
                    body: frame.freeze(),
                },
            )));
        }

        match Message::parse(&src[..]) {
            Ok((msg, len)) => {
                src.advance(len);
                Ok(Some((len, msg)))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(description)) => Err(CodecError::Parse {
                description: format!(
                    "{description}; buffered:\n{:#?}",
                    crate::hex::LimitedHex::new(&src[..], 128)
                ),
                pos: self.read_pos,
            }),
        }
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src)? {
            None => return Ok(None),
            Some((len, msg)) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext::new(self.read_pos),
        };
        self.read_pos += len as u64;
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::Decoder as _;

    fn codec() -> Codec {
        Codec {
            ctx: ConnectionContext::dummy(),
            read_pos: 0,
        }
    }

    #[test]
    fn interleaved_frame() {
        // `$`, channel 0, length 5, payload, then trailing bytes that must
        // stay buffered.
        let mut c = codec();
        let mut buf = BytesMut::from(&b"$\x00\x00\x05\xaa\xbb\xcc\xdd\xee$"[..]);
        let msg = c.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Data { channel, body } => {
                assert_eq!(channel, 0);
                assert_eq!(&body[..], b"\xaa\xbb\xcc\xdd\xee");
            }
            o => panic!("expected data frame, got {o:?}"),
        }
        assert_eq!(c.read_pos, 9);
        assert_eq!(&buf[..], b"$");
        assert!(c.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn crlf_before_data() {
        // Some servers pad a CRLF between a response and the next frame.
        let mut c = codec();
        let mut buf = BytesMut::from(&b"\r\n$\x02\x00\x03\x01\x02\x03$\x02"[..]);
        let msg = c.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg.msg, Message::Data { channel: 2, .. }));
        assert_eq!(&buf[..], b"$\x02");
    }

    #[test]
    fn split_message() {
        let mut c = codec();
        let mut buf = BytesMut::from(&b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n"[..]);
        assert!(c.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\n");
        let msg = c.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg.msg, Message::Response(_)));
    }

    #[test]
    fn invalid_message() {
        let mut c = codec();
        let mut buf = BytesMut::from(&b"NOT-RTSP blah blah\r\n\r\n"[..]);
        assert!(c.decode(&mut buf).is_err());
    }
}
