// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP over HTTP, in the widely implemented QuickTime style: a long-lived
//! `GET` carries the server→client stream (raw RTSP after the HTTP response
//! header), and a second connection `POST`s the client→server stream as
//! base64. The two are tied together by a shared `x-sessioncookie`.

use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BytesMut};
use rand::Rng as _;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf};
use tokio::net::TcpStream;
use url::Url;

use crate::ConnectionContext;

const MAX_RESPONSE_HEADER: usize = 16 * 1024;

/// A duplex byte stream tunneling RTSP through two HTTP connections.
pub(crate) struct HttpTunnel {
    get: TcpStream,
    post: TcpStream,

    /// Bytes read past the GET response header, not yet handed out.
    leftover: BytesMut,

    /// Base64 output accepted by `poll_write` but not yet written to `post`.
    out: BytesMut,
}

impl HttpTunnel {
    /// Establishes the tunnel: both connections, the `GET` handshake, and
    /// the `POST` preamble.
    pub(crate) async fn connect(url: &Url) -> Result<(Self, ConnectionContext), std::io::Error> {
        let host = url
            .host_str()
            .ok_or_else(|| bad_input("URL has no host"))?
            .to_owned();
        let port = url.port().unwrap_or(80);
        let path = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_owned(),
        };
        let cookie = {
            let mut rng = rand::thread_rng();
            format!("{:08x}{:08x}", rng.gen::<u32>(), rng.gen::<u32>())
        };

        let mut get = TcpStream::connect((host.as_str(), port)).await?;
        let ctx = ConnectionContext::new(get.local_addr()?, get.peer_addr()?);
        get.write_all(
            format!(
                "GET {path} HTTP/1.0\r\n\
                 Host: {host}\r\n\
                 x-sessioncookie: {cookie}\r\n\
                 Accept: application/x-rtsp-tunnelled\r\n\
                 Pragma: no-cache\r\n\
                 Cache-Control: no-cache\r\n\
                 \r\n"
            )
            .as_bytes(),
        )
        .await?;
        let leftover = read_http_response_header(&mut get).await?;

        let mut post = TcpStream::connect((host.as_str(), port)).await?;
        post.write_all(
            format!(
                "POST {path} HTTP/1.0\r\n\
                 Host: {host}\r\n\
                 x-sessioncookie: {cookie}\r\n\
                 Content-Type: application/x-rtsp-tunnelled\r\n\
                 Content-Length: 32767\r\n\
                 Pragma: no-cache\r\n\
                 Cache-Control: no-cache\r\n\
                 Expires: Sun, 9 Jan 1972 00:00:00 GMT\r\n\
                 \r\n"
            )
            .as_bytes(),
        )
        .await?;

        Ok((
            Self {
                get,
                post,
                leftover,
                out: BytesMut::new(),
            },
            ctx,
        ))
    }

    fn poll_drain_out(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while !self.out.is_empty() {
            let n = match Pin::new(&mut self.post).poll_write(cx, &self.out) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "POST side of tunnel closed",
                    )))
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.out.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for HttpTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = std::cmp::min(self.leftover.len(), buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.get).poll_read(cx, buf)
    }
}

impl AsyncWrite for HttpTunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        // Accept the chunk into the base64 output buffer, then write as much
        // as the POST side takes. Each chunk is encoded standalone; servers
        // decode the stream chunk-wise and tolerate the padding.
        if self.out.len() > 1 << 20 {
            // Backpressure: force a drain before buffering more.
            match self.poll_drain_out(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        let encoded = BASE64.encode(buf);
        self.out.extend_from_slice(encoded.as_bytes());
        let _ = self.poll_drain_out(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.poll_drain_out(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.post).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.poll_drain_out(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.post).poll_shutdown(cx),
            other => other,
        }
    }
}

fn bad_input(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_owned())
}

/// Reads and validates the HTTP response header of the `GET` half, returning
/// any stream bytes read past it.
async fn read_http_response_header(stream: &mut TcpStream) -> Result<BytesMut, std::io::Error> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF in tunnel HTTP response header",
            ));
        }
        if let Some(end) = find_header_end(&buf) {
            let header = buf.split_to(end);
            let header = std::str::from_utf8(&header)
                .map_err(|_| bad_input("tunnel HTTP response is not valid UTF-8"))?;
            let status_line = header.lines().next().unwrap_or("");
            let mut parts = status_line.split_ascii_whitespace();
            let version = parts.next().unwrap_or("");
            let status = parts.next().unwrap_or("");
            if !version.starts_with("HTTP/") || status != "200" {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("tunnel HTTP GET failed: {status_line:?}"),
                ));
            }
            return Ok(buf);
        }
        if buf.len() > MAX_RESPONSE_HEADER {
            return Err(bad_input("tunnel HTTP response header too large"));
        }
    }
}

/// Returns the offset just past `\r\n\r\n` (or `\n\n`), if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn header_end() {
        assert_eq!(find_header_end(b"HTTP/1.0 200 OK\r\n\r\nrest"), Some(19));
        assert_eq!(find_header_end(b"HTTP/1.0 200 OK\n\nrest"), Some(17));
        assert_eq!(find_header_end(b"HTTP/1.0 200 OK\r\n"), None);
    }

    #[tokio::test]
    async fn get_handshake_and_leftover() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = s.read(&mut buf).await.unwrap();
            let req = std::str::from_utf8(&buf[..n]).unwrap().to_owned();
            s.write_all(b"HTTP/1.0 200 OK\r\nContent-Type: application/x-rtsp-tunnelled\r\n\r\nRTSP")
                .await
                .unwrap();
            req
        });
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stream HTTP/1.0\r\nx-sessioncookie: abc\r\n\r\n")
            .await
            .unwrap();
        let leftover = read_http_response_header(&mut stream).await.unwrap();
        assert_eq!(&leftover[..], b"RTSP");
        let req = server.await.unwrap();
        assert!(req.starts_with("GET /stream"));
    }
}
