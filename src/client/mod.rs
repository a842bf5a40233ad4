// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP client session: `OPTIONS` → `DESCRIBE` → `SETUP`×N → `PLAY`,
//! keepalives, re-authentication, and demultiplexing of RTP/RTCP into
//! frame events.
//!
//! [`Session::connect`] spawns a driver task owning the connection and all
//! per-stream state; the caller controls it through [`Session`] and
//! consumes [`Event`]s from the returned [`Events`] stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use pin_project::pin_project;
use rand::Rng as _;
use tokio::sync::mpsc;
use url::Url;

use crate::auth::Authenticator;
use crate::codec::{
    AudioFrame, AudioParameters, CodecItem, Depacketizer, ParametersRef, VideoFrame,
    VideoParameters,
};
use crate::conn::{Connection, Purpose, ReceivedMessage};
use crate::error::ErrorInt;
use crate::message::{Message, Method, Request, Response};
use crate::rtp::RtpPacket;
use crate::transport::{multicast_pair, PacketKind, TransportEvent, UdpPair, UdpTransport};
use crate::tunnel::HttpTunnel;
use crate::{ConnectionContext, Error, NtpTimestamp};

mod channels;
mod parse;

use channels::ChannelMap;
use parse::{SelectedStream, StreamKind};

/// Upper bound on the keepalive period; the server's advertised session
/// timeout can only shorten it.
const KEEPALIVE_CAP: Duration = Duration::from_secs(20);

/// How long `Stop`/drop waits for the best-effort `TEARDOWN`.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Username and password for `Basic` or `Digest` authentication.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't log passwords.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Preferred lower transport for RTP.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Transport {
    /// Interleave RTP/RTCP on the RTSP TCP connection.
    #[default]
    Tcp,

    /// Unicast UDP with a locally allocated even/odd port pair.
    Udp,

    /// Multicast UDP on the group the server assigns.
    Multicast,
}

/// Which media kinds to set up.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MediaMask {
    Video,
    Audio,
    #[default]
    Both,
}

impl MediaMask {
    fn wants_video(self) -> bool {
        matches!(self, MediaMask::Video | MediaMask::Both)
    }

    fn wants_audio(self) -> bool {
        matches!(self, MediaMask::Audio | MediaMask::Both)
    }
}

/// Options which control the session as a whole, in the builder style.
pub struct SessionOptions {
    creds: Option<Credentials>,
    user_agent: String,
    transport: Transport,
    media: MediaMask,
    strict_sdp: bool,
    playback: bool,
    io_timeout: Duration,
    udp_port_range: std::ops::Range<u16>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            creds: None,
            user_agent: concat!("fovea/", env!("CARGO_PKG_VERSION")).to_owned(),
            transport: Transport::default(),
            media: MediaMask::default(),
            strict_sdp: false,
            playback: false,
            io_timeout: Duration::from_secs(10),
            udp_port_range: 5000..65000, // matching ffmpeg's defaults
        }
    }
}

impl SessionOptions {
    pub fn creds(self, creds: Option<Credentials>) -> Self {
        Self { creds, ..self }
    }

    pub fn user_agent(self, user_agent: String) -> Self {
        Self { user_agent, ..self }
    }

    pub fn transport(self, transport: Transport) -> Self {
        Self { transport, ..self }
    }

    pub fn media(self, media: MediaMask) -> Self {
        Self { media, ..self }
    }

    /// Rejects out-of-spec SDP rather than tolerating common camera quirks.
    pub fn strict_sdp(self, strict_sdp: bool) -> Self {
        Self { strict_sdp, ..self }
    }

    /// Marks this a playback (recorded media) session: `PLAY` requests get
    /// the ONVIF replay headers (`Require: onvif-replay`, `Rate-Control`).
    pub fn playback(self, playback: bool) -> Self {
        Self { playback, ..self }
    }

    /// Per-I/O timeout; also bounds each request's wait for its response.
    pub fn io_timeout(self, io_timeout: Duration) -> Self {
        Self { io_timeout, ..self }
    }

    /// The local port range the UDP transport allocates pairs from.
    pub fn udp_port_range(self, udp_port_range: std::ops::Range<u16>) -> Self {
        Self {
            udp_port_range,
            ..self
        }
    }
}

/// Options for a single `PLAY` request.
#[derive(Clone, Debug, Default)]
pub struct PlayOptions {
    from: Option<chrono::DateTime<chrono::Utc>>,
    to: Option<chrono::DateTime<chrono::Utc>>,
    speed: Option<f32>,
}

impl PlayOptions {
    /// Starts playback at the given recorded position (ONVIF replay).
    pub fn from(self, from: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            from: Some(from),
            ..self
        }
    }

    /// Stops playback at the given recorded position.
    pub fn to(self, to: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            to: Some(to),
            ..self
        }
    }

    pub fn speed(self, speed: f32) -> Self {
        Self {
            speed: Some(speed),
            ..self
        }
    }
}

/// An event from the session's driver task.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// A video stream was set up; fired once, before any of its frames.
    NewVideoStream(VideoParameters),

    /// An audio stream was set up; fired once, before any of its frames.
    NewAudioStream(AudioParameters),

    /// A complete video access unit.
    VideoData {
        frame: VideoFrame,

        /// Wall-clock time derived from the stream's last RTCP sender
        /// report, or [`chrono::DateTime::<chrono::Utc>::MIN_UTC`] before
        /// the first one arrives.
        wallclock: chrono::DateTime<chrono::Utc>,
    },

    /// A complete audio access unit.
    AudioData {
        frame: AudioFrame,
        wallclock: chrono::DateTime<chrono::Utc>,
    },

    /// All `SETUP`s succeeded; `play` may be called.
    SetupComplete,

    /// The session ended: `Ok` after `stop`, `Err` on failure. Always the
    /// final event.
    Finished(Result<(), Error>),
}

/// The stream of [`Event`]s from a session.
#[pin_project]
pub struct Events {
    #[pin]
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    /// Receives the next event; `None` after [`Event::Finished`].
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl futures::Stream for Events {
    type Item = Event;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.project().rx.get_mut().poll_recv(cx)
    }
}

const PHASE_CONNECTING: u8 = 0;
const PHASE_READY: u8 = 1;
const PHASE_PLAYING: u8 = 2;
const PHASE_PAUSED: u8 = 3;
const PHASE_FINISHED: u8 = 4;

#[derive(Default)]
struct Shared {
    phase: AtomicU8,
}

enum Command {
    Play(PlayOptions),
    Pause,
    Stop,
}

/// A handle to a live RTSP session.
///
/// Dropping the handle stops the session (with a best-effort `TEARDOWN`),
/// as does [`Session::stop`].
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Session {
    /// Connects to `url` and begins the handshake, returning as soon as the
    /// transport is established. Watch the [`Events`] stream for
    /// [`Event::SetupComplete`] and failures.
    ///
    /// Supported schemes: `rtsp` (default port 554) and `http`
    /// (RTSP-over-HTTP tunnel, default port 80). For `rtsps`, establish the
    /// TLS stream yourself and use [`Session::connect_with_stream`].
    /// Credentials may be embedded in the URL or set via
    /// [`SessionOptions::creds`].
    pub async fn connect(url: Url, options: SessionOptions) -> Result<(Self, Events), Error> {
        let (url, options) = take_url_credentials(url, options);
        let conn = match url.scheme() {
            "rtsp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| wrap!(ErrorInt::InvalidArgument("URL has no host".into())))?;
                let port = url.port().unwrap_or(554);
                timeout(options.io_timeout, Connection::connect(host, port))
                    .await?
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?
            }
            "http" => {
                let (tunnel, ctx) = timeout(options.io_timeout, HttpTunnel::connect(&url))
                    .await?
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
                Connection::from_io(Box::new(tunnel), ctx)
            }
            "rtsps" => bail!(ErrorInt::InvalidArgument(
                "rtsps needs a caller-established TLS stream; use connect_with_stream".into()
            )),
            s => bail!(ErrorInt::InvalidArgument(format!(
                "unsupported URL scheme {s:?}"
            ))),
        };
        Ok(Self::with_connection(conn, url, options))
    }

    /// Runs the session over a caller-established byte stream (e.g. a TLS
    /// session for an `rtsps` URL).
    pub fn connect_with_stream(
        io: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
        url: Url,
        options: SessionOptions,
    ) -> (Self, Events) {
        let (url, options) = take_url_credentials(url, options);
        let conn = Connection::from_io(Box::new(io), ConnectionContext::dummy());
        Self::with_connection(conn, url, options)
    }

    fn with_connection(conn: Connection, url: Url, options: SessionOptions) -> (Self, Events) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let driver = Driver {
            conn,
            options,
            base_url: url,
            auth: Authenticator::None,
            supports_get_parameter: false,
            keepalive_interval: KEEPALIVE_CAP,
            keepalive_dirty: false,
            session_id: None,
            phase: Phase::Options,
            streams: Vec::new(),
            setup_queue: VecDeque::new(),
            setup_in_flight: None,
            channels: ChannelMap::default(),
            events: event_tx,
            transport_tx,
            transport_rx,
            shared: shared.clone(),
            ssrc: rand::thread_rng().gen(),
        };
        tokio::spawn(driver.run(cmd_rx));
        (Self { cmd_tx, shared }, Events { rx: event_rx })
    }

    /// Sends `PLAY` for the whole presentation from the live position.
    pub fn play(&self) -> Result<(), Error> {
        self.play_with(PlayOptions::default())
    }

    /// Sends `PLAY` with an explicit range and/or speed.
    pub fn play_with(&self, options: PlayOptions) -> Result<(), Error> {
        self.command(Command::Play(options))
    }

    /// Sends `PAUSE`.
    pub fn pause(&self) -> Result<(), Error> {
        self.command(Command::Pause)
    }

    /// Stops the session: best-effort `TEARDOWN`, then closes all sockets.
    /// [`Event::Finished`] follows.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    fn command(&self, cmd: Command) -> Result<(), Error> {
        match self.shared.phase.load(Ordering::Acquire) {
            PHASE_CONNECTING => bail!(ErrorInt::InvalidArgument(
                "not connected: the handshake hasn't completed".into()
            )),
            PHASE_FINISHED => bail!(ErrorInt::SessionClosed),
            _ => {}
        }
        self.cmd_tx
            .send(cmd)
            .map_err(|_| wrap!(ErrorInt::SessionClosed))
    }
}

fn take_url_credentials(mut url: Url, mut options: SessionOptions) -> (Url, SessionOptions) {
    if !url.username().is_empty() || url.password().is_some() {
        if options.creds.is_none() {
            options.creds = Some(Credentials {
                username: url.username().to_owned(),
                password: url.password().unwrap_or("").to_owned(),
            });
        }
        let _ = url.set_username("");
        let _ = url.set_password(None);
    }
    (url, options)
}

async fn timeout<F: std::future::Future>(dur: Duration, f: F) -> Result<F::Output, Error> {
    tokio::time::timeout(dur, f).await.map_err(|_| {
        wrap!(ErrorInt::Timeout {
            description: "I/O timed out".to_owned(),
        })
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Options,
    Describe,
    Setup,
    Ready,
    Playing,
    Paused,
}

/// The last sender report seen on a stream, for RTP→wall-clock mapping.
#[derive(Copy, Clone, Debug)]
struct SenderReportSync {
    rtp_timestamp: u32,
    ntp: NtpTimestamp,
}

enum StreamTransportState {
    /// No `SETUP` sent yet (TCP and multicast defer everything to then).
    Unset,

    /// A UDP port pair allocated before `SETUP`; writes are suppressed
    /// until the response supplies the server's endpoints.
    PreparedUdp(UdpPair),

    Interleaved {
        rtp_channel: u8,
    },

    Udp(UdpTransport),
}

struct MediaStream {
    kind: StreamKind,
    control: Url,
    payload_type: u8,
    clock_rate: u32,
    depacketizer: Depacketizer,
    transport: StreamTransportState,
    sync: Option<SenderReportSync>,
    ssrc: Option<u32>,
    next_seq: Option<u16>,
}

struct Driver {
    conn: Connection,
    options: SessionOptions,
    base_url: Url,
    auth: Authenticator,
    supports_get_parameter: bool,
    keepalive_interval: Duration,
    keepalive_dirty: bool,
    session_id: Option<Box<str>>,
    phase: Phase,
    streams: Vec<MediaStream>,
    setup_queue: VecDeque<usize>,
    setup_in_flight: Option<usize>,
    channels: ChannelMap,
    events: mpsc::UnboundedSender<Event>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    shared: Arc<Shared>,

    /// Our SSRC, used as the sender field of outgoing receiver reports.
    ssrc: u32,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let result = self.run_inner(&mut cmd_rx).await;
        if self.session_id.is_some() {
            // Best effort; bounded so a dead server can't wedge shutdown.
            let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, self.send_teardown()).await;
        }
        for s in &mut self.streams {
            if let StreamTransportState::Udp(t) =
                std::mem::replace(&mut s.transport, StreamTransportState::Unset)
            {
                t.stop();
            }
        }
        self.shared.phase.store(PHASE_FINISHED, Ordering::Release);
        let _ = self.events.send(Event::Finished(result));
    }

    async fn run_inner(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), Error> {
        self.send_request(
            Request::new(Method::Options, Some(self.base_url.clone())),
            Purpose::User,
        )
        .await?;

        let mut keepalive = new_interval(self.keepalive_interval);
        let mut housekeeping = tokio::time::interval(Duration::from_secs(1));
        loop {
            if self.keepalive_dirty {
                self.keepalive_dirty = false;
                keepalive = new_interval(self.keepalive_interval);
            }
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    // A dropped handle stops the session like an explicit Stop.
                    None | Some(Command::Stop) => return Ok(()),
                    Some(Command::Play(opts)) => self.send_play(opts).await?,
                    Some(Command::Pause) => self.send_pause().await?,
                },
                msg = self.conn.next() => match msg {
                    None => bail!(ErrorInt::ReadError {
                        conn_ctx: *self.conn.ctx(),
                        msg_ctx: self.conn.eof_ctx(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "server closed the RTSP connection",
                        ),
                    }),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(m)) => self.handle_message(m).await?,
                },
                Some(ev) = self.transport_rx.recv() => self.handle_transport_event(ev).await?,
                _ = keepalive.tick() => self.send_keepalive().await?,
                _ = housekeeping.tick() => self.check_response_deadlines()?,
            }
        }
    }

    async fn handle_message(&mut self, m: ReceivedMessage) -> Result<(), Error> {
        match m.msg {
            Message::Response(resp) => self.handle_response(m.ctx, resp).await,
            Message::Data { channel, body } => {
                match self.channels.lookup(channel) {
                    Some(mapping) => match mapping.kind {
                        PacketKind::Rtp => self.handle_rtp(mapping.stream_id, body),
                        PacketKind::Rtcp => self.handle_rtcp(mapping.stream_id, body).await,
                    },
                    None => {
                        // Data on channels we never set up is dropped.
                        debug!(
                            "ignoring {}-byte interleaved frame on unassigned channel {channel}",
                            body.len()
                        );
                    }
                }
                Ok(())
            }
            Message::Request(req) => {
                warn!("ignoring {} request from server", req.method);
                Ok(())
            }
        }
    }

    async fn handle_response(
        &mut self,
        msg_ctx: crate::RtspMessageContext,
        resp: Response,
    ) -> Result<(), Error> {
        let cseq = match resp.headers.cseq() {
            Some(c) => c,
            None => bail!(ErrorInt::FramingError {
                conn_ctx: *self.conn.ctx(),
                msg_ctx,
                description: "response without CSeq".to_owned(),
            }),
        };
        let pending = match self.conn.take_pending(cseq) {
            Some(p) => p,
            None => bail!(ErrorInt::FramingError {
                conn_ctx: *self.conn.ctx(),
                msg_ctx,
                description: format!("response CSeq={cseq} matches no outstanding request"),
            }),
        };

        if resp.status == 401 {
            return self.handle_unauthorized(pending.request, pending.purpose, resp).await;
        }
        if pending.purpose == Purpose::Keepalive {
            // Whatever the status, a keepalive response only confirms
            // liveness.
            return Ok(());
        }
        if !resp.is_success() {
            bail!(ErrorInt::ResponseError {
                conn_ctx: *self.conn.ctx(),
                msg_ctx,
                method: pending.request.method,
                cseq,
                status: resp.status,
                description: resp.reason,
            });
        }
        match pending.request.method {
            Method::Options => self.on_options(resp).await,
            Method::Describe => self.on_describe(resp).await,
            Method::Setup => self.on_setup(msg_ctx, cseq, resp).await,
            Method::Play => {
                self.phase = Phase::Playing;
                self.shared.phase.store(PHASE_PLAYING, Ordering::Release);
                Ok(())
            }
            Method::Pause => {
                self.phase = Phase::Paused;
                self.shared.phase.store(PHASE_PAUSED, Ordering::Release);
                Ok(())
            }
            Method::Teardown => Ok(()),
            m => {
                debug!("ignoring response to {m}");
                Ok(())
            }
        }
    }

    /// Handles a 401: rebuild the authentication strategy from the fresh
    /// challenge and retry the request once. A second 401 for the same
    /// logical request fails the session; a 401 on a keepalive doesn't.
    async fn handle_unauthorized(
        &mut self,
        mut original: Request,
        purpose: Purpose,
        resp: Response,
    ) -> Result<(), Error> {
        // Servers may offer several challenges (e.g. Basic and Digest in
        // separate headers); prefer Digest.
        let challenge = resp
            .headers
            .get_all("WWW-Authenticate")
            .find(|c| c.starts_with("Digest"))
            .or_else(|| resp.headers.get("WWW-Authenticate"))
            .map(str::to_owned);
        if purpose == Purpose::Keepalive {
            if let Some(c) = &challenge {
                // Remember the challenge so the next user request
                // re-authenticates, but don't retry the keepalive itself.
                match Authenticator::from_challenge(c) {
                    Ok(a) => self.auth = a,
                    Err(e) => debug!("ignoring keepalive challenge: {e}"),
                }
            }
            return Ok(());
        }
        let Some(challenge) = challenge else {
            bail!(ErrorInt::AuthenticationFailed {
                conn_ctx: *self.conn.ctx(),
                description: "401 without WWW-Authenticate header".to_owned(),
            });
        };
        if original.headers.get("Authorization").is_some() {
            bail!(ErrorInt::AuthenticationFailed {
                conn_ctx: *self.conn.ctx(),
                description: format!(
                    "server rejected our credentials on {}",
                    original.method
                ),
            });
        }
        if self.options.creds.is_none() {
            bail!(ErrorInt::AuthenticationFailed {
                conn_ctx: *self.conn.ctx(),
                description: "authentication required but no credentials supplied".to_owned(),
            });
        }
        self.auth = Authenticator::from_challenge(&challenge).map_err(|e| {
            wrap!(ErrorInt::AuthenticationFailed {
                conn_ctx: *self.conn.ctx(),
                description: e,
            })
        })?;
        // Clone of the original request; send_request assigns a fresh CSeq.
        original.headers.remove("Authorization");
        self.send_request(original, purpose).await?;
        Ok(())
    }

    async fn on_options(&mut self, resp: Response) -> Result<(), Error> {
        self.supports_get_parameter =
            parse::public_supports(resp.headers.get("Public"), "GET_PARAMETER");
        self.phase = Phase::Describe;
        let req = Request::new(Method::Describe, Some(self.base_url.clone()))
            .with_header("Accept", "application/sdp");
        self.send_request(req, Purpose::User).await?;
        Ok(())
    }

    async fn on_describe(&mut self, resp: Response) -> Result<(), Error> {
        // The presentation's base URI: Content-Base, else Content-Location,
        // else the request URI (which base_url already holds).
        for h in ["Content-Base", "Content-Location"] {
            if let Some(v) = resp.headers.get(h) {
                if let Ok(u) = Url::parse(v.trim()) {
                    self.base_url = u;
                    break;
                }
            }
        }
        let mode = if self.options.strict_sdp {
            crate::sdp::Mode::Strict
        } else {
            crate::sdp::Mode::Loose
        };
        let sdp = crate::sdp::SessionDescription::parse(&resp.body, mode).map_err(|description| {
            wrap!(ErrorInt::UnsupportedMedia {
                description: format!("unparseable SDP: {description}"),
            })
        })?;
        self.base_url = parse::session_base(&sdp, &self.base_url)
            .map_err(|description| wrap!(ErrorInt::UnsupportedMedia { description }))?;
        let selected = parse::select_streams(
            &sdp,
            &self.base_url,
            self.options.media.wants_video(),
            self.options.media.wants_audio(),
        )
        .map_err(|description| wrap!(ErrorInt::UnsupportedMedia { description }))?;

        let local_ip = self.conn.ctx().local_addr().ip();
        for SelectedStream {
            kind,
            control,
            payload_type,
            clock_rate,
            depacketizer,
        } in selected
        {
            let transport = match self.options.transport {
                Transport::Udp => StreamTransportState::PreparedUdp(
                    UdpPair::for_ip(local_ip, self.options.udp_port_range.clone()).map_err(
                        |e| wrap!(ErrorInt::ConnectError(e)),
                    )?,
                ),
                Transport::Tcp | Transport::Multicast => StreamTransportState::Unset,
            };
            let stream_id = self.streams.len();
            self.streams.push(MediaStream {
                kind,
                control,
                payload_type,
                clock_rate,
                depacketizer,
                transport,
                sync: None,
                ssrc: None,
                next_seq: None,
            });
            self.setup_queue.push_back(stream_id);
        }
        self.phase = Phase::Setup;
        self.send_next_setup().await
    }

    async fn send_next_setup(&mut self) -> Result<(), Error> {
        let stream_id = self
            .setup_queue
            .pop_front()
            .expect("send_next_setup with non-empty queue");
        let stream = &self.streams[stream_id];
        let transport_header = match (&stream.transport, self.options.transport) {
            (_, Transport::Tcp) => {
                let ch = self.channels.next_unassigned().ok_or_else(|| {
                    wrap!(ErrorInt::InvalidArgument(
                        "out of interleaved channels".into()
                    ))
                })?;
                format!("RTP/AVP/TCP;unicast;interleaved={}-{}", ch, ch + 1)
            }
            (StreamTransportState::PreparedUdp(pair), Transport::Udp) => {
                format!(
                    "RTP/AVP/UDP;unicast;client_port={}-{}",
                    pair.rtp_port,
                    pair.rtp_port + 1
                )
            }
            (_, Transport::Multicast) => "RTP/AVP;multicast".to_owned(),
            (_, Transport::Udp) => unreachable!("UDP streams have a prepared pair"),
        };
        let mut req = Request::new(Method::Setup, Some(stream.control.clone()))
            .with_header("Transport", transport_header);
        if let Some(id) = &self.session_id {
            req.headers.add("Session", id.to_string());
        }
        self.setup_in_flight = Some(stream_id);
        self.send_request(req, Purpose::User).await?;
        Ok(())
    }

    async fn on_setup(
        &mut self,
        msg_ctx: crate::RtspMessageContext,
        cseq: u32,
        resp: Response,
    ) -> Result<(), Error> {
        let stream_id = match self.setup_in_flight.take() {
            Some(i) => i,
            None => bail!(ErrorInt::FramingError {
                conn_ctx: *self.conn.ctx(),
                msg_ctx,
                description: "SETUP response with no SETUP in flight".to_owned(),
            }),
        };
        let conn_ctx = *self.conn.ctx();
        let status = resp.status;
        let protocol_violation = move |description: String| {
            wrap!(ErrorInt::ResponseError {
                conn_ctx,
                msg_ctx,
                method: Method::Setup,
                cseq,
                status,
                description,
            })
        };

        let session = resp
            .headers
            .get("Session")
            .ok_or_else(|| protocol_violation("SETUP response without Session header".into()))
            .and_then(|v| parse::parse_session_header(v).map_err(protocol_violation))?;
        match &self.session_id {
            Some(old) if **old != *session.id => {
                // A server handing out a second session id is hopelessly
                // confused; bail out rather than guess.
                return Err(protocol_violation(format!(
                    "SETUP response changed session id from {old:?} to {:?}",
                    session.id
                )));
            }
            _ => {}
        }
        self.session_id = Some(session.id.clone());
        let advertised = Duration::from_secs(u64::from(session.timeout_sec)) / 2;
        let interval = advertised.min(KEEPALIVE_CAP);
        if interval != self.keepalive_interval {
            self.keepalive_interval = interval;
            self.keepalive_dirty = true;
        }

        let transport = resp
            .headers
            .get("Transport")
            .map(parse::parse_transport_header)
            .transpose()
            .map_err(protocol_violation)?
            .unwrap_or_default();

        match self.options.transport {
            Transport::Tcp => {
                // The server may rewrite our proposed channel pair.
                let ch = transport
                    .channel_id
                    .or_else(|| self.channels.next_unassigned())
                    .ok_or_else(|| protocol_violation("out of interleaved channels".into()))?;
                self.channels
                    .assign(ch, stream_id)
                    .map_err(protocol_violation)?;
                self.streams[stream_id].transport =
                    StreamTransportState::Interleaved { rtp_channel: ch };
            }
            Transport::Udp => {
                let pair = match std::mem::replace(
                    &mut self.streams[stream_id].transport,
                    StreamTransportState::Unset,
                ) {
                    StreamTransportState::PreparedUdp(p) => p,
                    _ => unreachable!("UDP stream lost its prepared pair"),
                };
                let (rtp_port, rtcp_port) = transport.server_port.ok_or_else(|| {
                    protocol_violation("SETUP response without server_port".into())
                })?;
                let peer_ip = transport
                    .source
                    .or(transport.destination)
                    .unwrap_or_else(|| self.conn.ctx().peer_addr().ip());
                pair.rtp_socket
                    .connect((peer_ip, rtp_port))
                    .await
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
                pair.rtcp_socket
                    .connect((peer_ip, rtcp_port))
                    .await
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
                self.streams[stream_id].transport = StreamTransportState::Udp(
                    UdpTransport::start(
                        stream_id,
                        pair.rtp_socket,
                        pair.rtcp_socket,
                        None,
                        self.transport_tx.clone(),
                    ),
                );
            }
            Transport::Multicast => {
                let group = transport.destination.ok_or_else(|| {
                    protocol_violation("multicast SETUP response without destination".into())
                })?;
                let (rtp_port, rtcp_port) = transport.port.ok_or_else(|| {
                    protocol_violation("multicast SETUP response without port".into())
                })?;
                let (rtp_socket, rtcp_socket) =
                    multicast_pair(group, rtp_port).map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
                self.streams[stream_id].transport = StreamTransportState::Udp(
                    UdpTransport::start(
                        stream_id,
                        rtp_socket,
                        rtcp_socket,
                        Some(std::net::SocketAddr::new(group, rtcp_port)),
                        self.transport_tx.clone(),
                    ),
                );
            }
        }
        if let Some(ssrc) = transport.ssrc {
            self.streams[stream_id].ssrc = Some(ssrc);
        }

        debug!(
            "stream {stream_id} ({}) set up",
            self.streams[stream_id].kind.as_media()
        );

        // The stream is live; announce it before any of its frames.
        let ev = match self.streams[stream_id].depacketizer.parameters() {
            Some(ParametersRef::Video(p)) => Event::NewVideoStream(p.clone()),
            Some(ParametersRef::Audio(p)) => Event::NewAudioStream(p.clone()),
            None => unreachable!("every depacketizer reports parameters"),
        };
        let _ = self.events.send(ev);

        if self.setup_queue.is_empty() {
            self.phase = Phase::Ready;
            self.shared.phase.store(PHASE_READY, Ordering::Release);
            let _ = self.events.send(Event::SetupComplete);
            Ok(())
        } else {
            self.send_next_setup().await
        }
    }

    async fn send_play(&mut self, opts: PlayOptions) -> Result<(), Error> {
        if !matches!(self.phase, Phase::Ready | Phase::Playing | Phase::Paused) {
            debug!("ignoring play before setup completes");
            return Ok(());
        }
        let mut req = Request::new(Method::Play, Some(self.base_url.clone()));
        if let Some(id) = &self.session_id {
            req.headers.add("Session", id.to_string());
        }
        if self.options.playback {
            req.headers.add("Require", "onvif-replay");
            req.headers.add("Rate-Control", "no");
        }
        match (opts.from, opts.to) {
            (Some(from), Some(to)) => {
                req.headers.add(
                    "Range",
                    format!("clock={}-{}", onvif_time(from), onvif_time(to)),
                );
            }
            (Some(from), None) => {
                req.headers
                    .add("Range", format!("clock={}-", onvif_time(from)));
            }
            (None, _) => {
                req.headers.add("Range", "npt=0.000-");
            }
        }
        if let Some(speed) = opts.speed {
            req.headers.add("Speed", format!("{speed}"));
        }
        self.send_request(req, Purpose::User).await?;
        Ok(())
    }

    async fn send_pause(&mut self) -> Result<(), Error> {
        if !matches!(self.phase, Phase::Playing) {
            debug!("ignoring pause while not playing");
            return Ok(());
        }
        let mut req = Request::new(Method::Pause, Some(self.base_url.clone()));
        if let Some(id) = &self.session_id {
            req.headers.add("Session", id.to_string());
        }
        self.send_request(req, Purpose::User).await?;
        Ok(())
    }

    /// Sends the periodic keepalive: `GET_PARAMETER` when the server
    /// advertises it, else a bare `OPTIONS`.
    async fn send_keepalive(&mut self) -> Result<(), Error> {
        if self.session_id.is_none() {
            return Ok(());
        }
        let mut req = if self.supports_get_parameter {
            Request::new(Method::GetParameter, Some(self.base_url.clone()))
        } else {
            Request::new(Method::Options, None)
        };
        if let Some(id) = &self.session_id {
            req.headers.add("Session", id.to_string());
        }
        self.send_request(req, Purpose::Keepalive).await?;
        Ok(())
    }

    async fn send_teardown(&mut self) {
        let Some(id) = self.session_id.clone() else {
            return;
        };
        let mut req = Request::new(Method::Teardown, Some(self.base_url.clone()));
        req.headers.add("Session", id.to_string());
        let Ok(cseq) = self.send_request(req, Purpose::User).await else {
            return;
        };
        while let Some(Ok(m)) = self.conn.next().await {
            if let Message::Response(resp) = m.msg {
                if resp.headers.cseq() == Some(cseq) {
                    return;
                }
            }
        }
    }

    async fn send_request(&mut self, mut req: Request, purpose: Purpose) -> Result<u32, Error> {
        req.headers.set("User-Agent", self.options.user_agent.clone());
        if let Some(creds) = &self.options.creds {
            let uri_string = req.uri.as_ref().map(|u| u.to_string());
            let uri = uri_string.as_deref().unwrap_or("*");
            if let Some(h) = self.auth.authorization(creds, req.method, uri, &req.body) {
                req.headers.set("Authorization", h);
            }
        }
        timeout(self.options.io_timeout, self.conn.send_request(req, purpose)).await?
    }

    /// Surfaces a timeout for any request that's been pending too long, so
    /// every request ends in exactly one response or one timeout.
    fn check_response_deadlines(&mut self) -> Result<(), Error> {
        if let Some(cseq) = self.conn.timed_out_cseq(self.options.io_timeout) {
            let p = self.conn.take_pending(cseq).expect("cseq came from the map");
            bail!(ErrorInt::Timeout {
                description: format!(
                    "no response to {} CSeq={cseq} within {:?}",
                    p.request.method, self.options.io_timeout
                ),
            });
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, ev: TransportEvent) -> Result<(), Error> {
        let data = match ev.result {
            Ok(d) => d,
            Err(source) => bail!(ErrorInt::UdpRecvError {
                conn_ctx: *self.conn.ctx(),
                stream_id: ev.stream_id,
                source,
            }),
        };
        match ev.kind {
            PacketKind::Rtp => self.handle_rtp(ev.stream_id, data),
            PacketKind::Rtcp => self.handle_rtcp(ev.stream_id, data).await,
        }
        Ok(())
    }

    fn handle_rtp(&mut self, stream_id: usize, data: Bytes) {
        let stream = &mut self.streams[stream_id];
        let pkt = match RtpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("stream {stream_id}: dropping corrupt RTP packet: {e}");
                return;
            }
        };
        if pkt.payload_type() != stream.payload_type {
            debug!(
                "stream {stream_id}: dropping packet with payload type {} (want {})",
                pkt.payload_type(),
                stream.payload_type
            );
            return;
        }
        match stream.ssrc {
            Some(expected) if expected != pkt.ssrc() => {
                // Possibly data from a stale session on a reused port.
                debug!(
                    "stream {stream_id}: dropping packet with ssrc {:08x} (want {expected:08x})",
                    pkt.ssrc()
                );
                return;
            }
            _ => stream.ssrc = Some(pkt.ssrc()),
        }
        let seq = pkt.sequence_number();
        let loss = seq.wrapping_sub(stream.next_seq.unwrap_or(seq));
        if loss >= 0x8000 {
            debug!("stream {stream_id}: dropping out-of-order packet seq={seq:04x}");
            return;
        }
        stream.next_seq = Some(seq.wrapping_add(1));
        let cpkt = crate::codec::Packet {
            sequence_number: seq,
            timestamp: pkt.timestamp(),
            mark: pkt.mark(),
            loss,
            payload: pkt.into_payload(),
        };
        if let Err(e) = stream.depacketizer.push(cpkt) {
            debug!("stream {stream_id}: depacketizer dropped packet seq={seq:04x}: {e}");
            return;
        }
        while let Some(item) = stream.depacketizer.pull() {
            let ev = match item {
                CodecItem::VideoFrame(frame) => {
                    let wallclock = wallclock(stream.sync, frame.timestamp(), stream.clock_rate);
                    Event::VideoData { frame, wallclock }
                }
                CodecItem::AudioFrame(frame) => {
                    let wallclock = wallclock(stream.sync, frame.timestamp(), stream.clock_rate);
                    Event::AudioData { frame, wallclock }
                }
            };
            let _ = self.events.send(ev);
        }
    }

    async fn handle_rtcp(&mut self, stream_id: usize, data: Bytes) {
        let mut new_sync = None;
        for pkt in crate::rtcp::iterate(&data) {
            let pkt = match pkt {
                Ok(p) => p,
                Err(e) => {
                    debug!("stream {stream_id}: dropping corrupt RTCP packet: {e}");
                    return;
                }
            };
            match pkt.as_sender_report() {
                Ok(Some(sr)) => {
                    new_sync = Some(SenderReportSync {
                        rtp_timestamp: sr.rtp_timestamp(),
                        ntp: sr.ntp_timestamp(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("stream {stream_id}: dropping corrupt RTCP SR: {e}");
                    return;
                }
            }
        }
        if new_sync.is_some() {
            self.streams[stream_id].sync = new_sync;
            // Answer each SR with an empty receiver report; failures don't
            // matter for the session.
            let rr = crate::rtcp::empty_receiver_report(self.ssrc);
            match &self.streams[stream_id].transport {
                StreamTransportState::Interleaved { rtp_channel } => {
                    let channel = rtp_channel + 1;
                    if let Err(e) = self.conn.send_data(channel, Bytes::copy_from_slice(&rr)).await
                    {
                        debug!("stream {stream_id}: unable to send receiver report: {e}");
                    }
                }
                StreamTransportState::Udp(t) => {
                    if let Err(e) = t.send_rtcp(&rr).await {
                        debug!("stream {stream_id}: unable to send receiver report: {e}");
                    }
                }
                _ => {}
            }
        }
    }
}

fn new_interval(period: Duration) -> tokio::time::Interval {
    // interval() fires immediately; delay the first tick a full period.
    let mut i = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    i.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    i
}

/// Maps an RTP timestamp to wall-clock time through the stream's last
/// sender report, or the minimum-time sentinel before the first one.
fn wallclock(
    sync: Option<SenderReportSync>,
    rtp_timestamp: u32,
    clock_rate: u32,
) -> chrono::DateTime<chrono::Utc> {
    let Some(sync) = sync else {
        return chrono::DateTime::<chrono::Utc>::MIN_UTC;
    };
    // The difference is signed: frames may predate the report slightly.
    let delta = rtp_timestamp.wrapping_sub(sync.rtp_timestamp) as i32;
    let micros = i64::from(delta) * 1_000_000 / i64::from(clock_rate.max(1));
    sync.ntp.to_utc() + chrono::Duration::microseconds(micros)
}

fn onvif_time(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}
