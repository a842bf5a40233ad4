// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session tests against a scripted in-process RTSP server.

use bytes::BytesMut;
use fovea::message::{Message, Method, ParseError, Request};
use fovea::{Credentials, Event, Events, NtpTimestamp, Session, SessionOptions};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};

const SDP_VIDEO_AND_AUDIO: &str = "v=0\r\n\
    o=- 1 1 IN IP4 0.0.0.0\r\n\
    s=LIVE\r\n\
    t=0 0\r\n\
    a=control:*\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAH6tAUB7TcBAQEACA,aM48gA==\r\n\
    a=control:trackID=1\r\n\
    m=audio 0 RTP/AVP 0\r\n\
    a=control:trackID=2\r\n";

const SDP_VIDEO_ONLY: &str = "v=0\r\n\
    o=- 1 1 IN IP4 0.0.0.0\r\n\
    s=LIVE\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:trackID=1\r\n";

/// One accepted connection of the scripted server.
struct ServerConn {
    stream: TcpStream,
    buf: BytesMut,
}

enum ServerMsg {
    Request(Request),
    Data { channel: u8, body: Vec<u8> },
}

impl ServerConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn read_message(&mut self) -> ServerMsg {
        loop {
            if self.buf.first() == Some(&b'$') {
                if self.buf.len() >= 4 {
                    let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
                    if self.buf.len() >= 4 + len {
                        let channel = self.buf[1];
                        let mut frame = self.buf.split_to(4 + len);
                        let body = frame.split_off(4).to_vec();
                        return ServerMsg::Data { channel, body };
                    }
                }
            } else {
                match Message::parse(&self.buf) {
                    Ok((Message::Request(r), consumed)) => {
                        let _ = self.buf.split_to(consumed);
                        return ServerMsg::Request(r);
                    }
                    Ok((m, _)) => panic!("server expected a request, got {m:?}"),
                    Err(ParseError::Incomplete) => {}
                    Err(ParseError::Invalid(e)) => panic!("bad client message: {e}"),
                }
            }
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                panic!("client closed the connection mid-script");
            }
        }
    }

    /// Reads a request, skipping any interleaved frames (receiver reports).
    async fn read_request(&mut self) -> Request {
        loop {
            match self.read_message().await {
                ServerMsg::Request(r) => return r,
                ServerMsg::Data { .. } => {}
            }
        }
    }

    async fn respond(&mut self, req: &Request, extra_headers: &str, body: &str) {
        let cseq = req.headers.cseq().expect("request has CSeq");
        let msg = format!(
            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{extra_headers}\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        );
        self.stream.write_all(msg.as_bytes()).await.unwrap();
    }

    async fn respond_unauthorized(&mut self, req: &Request, challenge: &str) {
        let cseq = req.headers.cseq().expect("request has CSeq");
        let msg = format!(
            "RTSP/1.0 401 Unauthorized\r\nCSeq: {cseq}\r\n\
             WWW-Authenticate: {challenge}\r\nContent-Length: 0\r\n\r\n"
        );
        self.stream.write_all(msg.as_bytes()).await.unwrap();
    }

    async fn send_interleaved(&mut self, channel: u8, body: &[u8]) {
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.push(b'$');
        frame.push(channel);
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(body);
        self.stream.write_all(&frame).await.unwrap();
    }
}

fn rtp_packet(payload_type: u8, seq: u16, timestamp: u32, mark: bool, payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0x80, payload_type | if mark { 0x80 } else { 0 }];
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&timestamp.to_be_bytes());
    pkt.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

fn sender_report(ntp: NtpTimestamp, rtp_timestamp: u32) -> Vec<u8> {
    let mut pkt = vec![0x80, 200, 0, 6];
    pkt.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    pkt.extend_from_slice(&ntp.0.to_be_bytes());
    pkt.extend_from_slice(&rtp_timestamp.to_be_bytes());
    pkt.extend_from_slice(&[0; 8]); // packet and octet counts
    pkt
}

async fn next_event(events: &mut Events) -> Event {
    tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended unexpectedly")
}

/// The happy path: `OPTIONS` → `DESCRIBE` → `SETUP`×2 in (video, audio)
/// order → `PLAY`, frames flowing, receiver reports sent, then a clean
/// `TEARDOWN` on stop.
#[tokio::test]
async fn interleaved_happy_path() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = url::Url::parse(&format!("rtsp://127.0.0.1:{port}/stream")).unwrap();

    let sr_time: chrono::DateTime<chrono::Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
    let sr_ntp = NtpTimestamp::from_utc(sr_time).unwrap();

    let server = tokio::spawn(async move {
        let mut c = ServerConn::accept(&listener).await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Options);
        c.respond(
            &req,
            "Public: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER\r\n",
            "",
        )
        .await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Describe);
        assert_eq!(req.headers.get("Accept"), Some("application/sdp"));
        c.respond(
            &req,
            &format!("Content-Base: rtsp://127.0.0.1:{port}/stream/\r\nContent-Type: application/sdp\r\n"),
            SDP_VIDEO_AND_AUDIO,
        )
        .await;

        // SETUPs arrive video first.
        let req = c.read_request().await;
        assert_eq!(req.method, Method::Setup);
        assert_eq!(
            req.uri.as_ref().unwrap().as_str(),
            format!("rtsp://127.0.0.1:{port}/stream/trackID=1")
        );
        assert!(req
            .headers
            .get("Transport")
            .unwrap()
            .starts_with("RTP/AVP/TCP;unicast;interleaved=0-1"));
        c.respond(
            &req,
            "Session: 23456789;timeout=60\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n",
            "",
        )
        .await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Setup);
        assert_eq!(
            req.uri.as_ref().unwrap().as_str(),
            format!("rtsp://127.0.0.1:{port}/stream/trackID=2")
        );
        assert_eq!(req.headers.get("Session"), Some("23456789"));
        c.respond(
            &req,
            "Session: 23456789;timeout=60\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n",
            "",
        )
        .await;

        // The session id from SETUP must be echoed on PLAY.
        let req = c.read_request().await;
        assert_eq!(req.method, Method::Play);
        assert_eq!(req.headers.get("Session"), Some("23456789"));
        assert_eq!(req.headers.get("Range"), Some("npt=0.000-"));
        c.respond(&req, "Session: 23456789\r\n", "").await;

        // A frame before any sender report, then a report, then another
        // frame one second later.
        c.send_interleaved(0, &rtp_packet(96, 1, 1000, true, b"\x65frame-one"))
            .await;
        c.send_interleaved(1, &sender_report(sr_ntp, 91_000)).await;
        c.send_interleaved(0, &rtp_packet(96, 2, 181_000, true, b"\x41frame-two"))
            .await;

        // The sender report must be answered by an empty receiver report.
        match c.read_message().await {
            ServerMsg::Data { channel, body } => {
                assert_eq!(channel, 1);
                assert_eq!(body[..4], [0x80, 201, 0, 1]);
                assert_eq!(body.len(), 8);
            }
            ServerMsg::Request(r) => panic!("expected receiver report, got {:?}", r.method),
        }

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Pause);
        c.respond(&req, "Session: 23456789\r\n", "").await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Teardown);
        assert_eq!(req.headers.get("Session"), Some("23456789"));
        c.respond(&req, "", "").await;
    });

    let (session, mut events) = Session::connect(url, SessionOptions::default())
        .await
        .unwrap();

    // Stream announcements fire exactly once each, video first, then the
    // setup-complete notification.
    match next_event(&mut events).await {
        Event::NewVideoStream(p) => {
            assert_eq!(p.codec(), "H264");
            assert!(!p.config().is_empty());
        }
        e => panic!("expected NewVideoStream, got {e:?}"),
    }
    match next_event(&mut events).await {
        Event::NewAudioStream(p) => assert_eq!(p.codec(), "PCMU"),
        e => panic!("expected NewAudioStream, got {e:?}"),
    }
    assert!(matches!(next_event(&mut events).await, Event::SetupComplete));

    session.play().unwrap();

    match next_event(&mut events).await {
        Event::VideoData { frame, wallclock } => {
            assert_eq!(frame.data(), b"\x00\x00\x00\x01\x65frame-one");
            assert!(frame.is_random_access_point());
            // No sender report yet: the minimum-time sentinel.
            assert_eq!(wallclock, chrono::DateTime::<chrono::Utc>::MIN_UTC);
        }
        e => panic!("expected VideoData, got {e:?}"),
    }
    match next_event(&mut events).await {
        Event::VideoData { frame, wallclock } => {
            assert_eq!(frame.data(), b"\x00\x00\x00\x01\x41frame-two");
            // 90,000 ticks past the report's RTP timestamp at 90 kHz.
            assert_eq!(wallclock, sr_time + chrono::Duration::seconds(1));
        }
        e => panic!("expected VideoData, got {e:?}"),
    }

    session.pause().unwrap();
    session.stop();
    match next_event(&mut events).await {
        Event::Finished(r) => r.unwrap(),
        e => panic!("expected Finished, got {e:?}"),
    }
    server.await.unwrap();
}

/// A 401 on `DESCRIBE` triggers exactly one retry: same URI, a fresh higher
/// `CSeq`, and a Digest `Authorization` built from the challenge.
#[tokio::test]
async fn retries_describe_after_unauthorized() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = url::Url::parse(&format!("rtsp://127.0.0.1:{port}/stream")).unwrap();

    let server = tokio::spawn(async move {
        let mut c = ServerConn::accept(&listener).await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Options);
        c.respond(&req, "Public: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN\r\n", "")
            .await;

        let first = c.read_request().await;
        assert_eq!(first.method, Method::Describe);
        assert!(first.headers.get("Authorization").is_none());
        c.respond_unauthorized(&first, "Digest realm=\"R\", nonce=\"N\"")
            .await;

        let second = c.read_request().await;
        assert_eq!(second.method, Method::Describe);
        assert_eq!(second.uri, first.uri);
        assert!(second.headers.cseq().unwrap() > first.headers.cseq().unwrap());
        let auth = second.headers.get("Authorization").unwrap();
        assert!(auth.starts_with("Digest username=\"admin\""), "{auth}");
        assert!(auth.contains("realm=\"R\""), "{auth}");
        assert!(auth.contains("nonce=\"N\""), "{auth}");
        assert!(
            auth.contains(&format!("uri=\"rtsp://127.0.0.1:{port}/stream\"")),
            "{auth}"
        );
        c.respond(
            &second,
            "Content-Type: application/sdp\r\n",
            SDP_VIDEO_ONLY,
        )
        .await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Setup);
        // The retry consumed a nonce use; the next request advances nc.
        assert!(req.headers.get("Authorization").is_some());
        c.respond(
            &req,
            "Session: 777;timeout=60\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n",
            "",
        )
        .await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Teardown);
        c.respond(&req, "", "").await;
    });

    let options = SessionOptions::default().creds(Some(Credentials {
        username: "admin".to_owned(),
        password: "1234".to_owned(),
    }));
    let (session, mut events) = Session::connect(url, options).await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        Event::NewVideoStream(_)
    ));
    assert!(matches!(next_event(&mut events).await, Event::SetupComplete));
    session.stop();
    match next_event(&mut events).await {
        Event::Finished(r) => r.unwrap(),
        e => panic!("expected Finished, got {e:?}"),
    }
    server.await.unwrap();
}

/// A 401 on a keepalive must not kill the session; the next user request
/// re-authenticates using the freshly parsed challenge.
#[tokio::test]
async fn tolerates_keepalive_unauthorized() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = url::Url::parse(&format!("rtsp://127.0.0.1:{port}/stream")).unwrap();

    let server = tokio::spawn(async move {
        let mut c = ServerConn::accept(&listener).await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Options);
        c.respond(
            &req,
            "Public: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER\r\n",
            "",
        )
        .await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Describe);
        c.respond(&req, "Content-Type: application/sdp\r\n", SDP_VIDEO_ONLY)
            .await;

        let req = c.read_request().await;
        assert_eq!(req.method, Method::Setup);
        // A one-second timeout forces a keepalive almost immediately.
        c.respond(
            &req,
            "Session: 42;timeout=1\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n",
            "",
        )
        .await;

        // The keepalive is GET_PARAMETER (advertised above); answer 401.
        let req = c.read_request().await;
        assert_eq!(req.method, Method::GetParameter);
        c.respond_unauthorized(&req, "Digest realm=\"R2\", nonce=\"N2\"")
            .await;

        // The session must survive: the next user request carries
        // credentials from the keepalive's challenge.
        let req = c.read_request().await;
        assert_eq!(req.method, Method::Play);
        let auth = req.headers.get("Authorization").unwrap();
        assert!(auth.contains("realm=\"R2\""), "{auth}");
        assert!(auth.contains("nonce=\"N2\""), "{auth}");
        c.respond(&req, "Session: 42\r\n", "").await;

        c.send_interleaved(0, &rtp_packet(96, 9, 3000, true, b"\x65alive"))
            .await;

        loop {
            let req = c.read_request().await;
            if req.method == Method::Teardown {
                c.respond(&req, "", "").await;
                break;
            }
            // Further keepalives may race the teardown; just accept them.
            c.respond(&req, "Session: 42\r\n", "").await;
        }
    });

    let options = SessionOptions::default().creds(Some(Credentials {
        username: "admin".to_owned(),
        password: "1234".to_owned(),
    }));
    let (session, mut events) = Session::connect(url, options).await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        Event::NewVideoStream(_)
    ));
    assert!(matches!(next_event(&mut events).await, Event::SetupComplete));

    // Wait for the keepalive exchange to happen, then play.
    tokio::time::sleep(std::time::Duration::from_millis(900)).await;
    session.play().unwrap();

    match next_event(&mut events).await {
        Event::VideoData { frame, .. } => {
            assert_eq!(frame.data(), b"\x00\x00\x00\x01\x65alive");
        }
        e => panic!("expected VideoData, got {e:?}"),
    }

    session.stop();
    match next_event(&mut events).await {
        Event::Finished(r) => r.unwrap(),
        e => panic!("expected Finished, got {e:?}"),
    }
    server.await.unwrap();
}

/// Play before the handshake completes is rejected, and operations after
/// stop report a closed session.
#[tokio::test]
async fn rejects_out_of_phase_commands() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = url::Url::parse(&format!("rtsp://127.0.0.1:{port}/stream")).unwrap();

    let server = tokio::spawn(async move {
        let mut c = ServerConn::accept(&listener).await;
        // Answer nothing; the client is still mid-handshake when play() is
        // attempted. Hold the connection open until the client goes away.
        let req = c.read_request().await;
        assert_eq!(req.method, Method::Options);
        let mut buf = [0u8; 1024];
        loop {
            if c.stream.read(&mut buf).await.unwrap() == 0 {
                break;
            }
        }
    });

    let (session, mut events) = Session::connect(url, SessionOptions::default())
        .await
        .unwrap();
    let err = session.play().unwrap_err();
    assert_eq!(err.kind(), fovea::ErrorKind::InvalidArgument);

    session.stop();
    match next_event(&mut events).await {
        Event::Finished(r) => r.unwrap(),
        e => panic!("expected Finished, got {e:?}"),
    }
    let err = session.play().unwrap_err();
    assert_eq!(err.kind(), fovea::ErrorKind::SessionClosed);
    server.await.unwrap();
}
