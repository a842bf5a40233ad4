// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; in most cases they have
/// enough information to find the offending packet in Wireshark. The broad
/// category of failure is available via [`Error::kind`].
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

/// The category of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The server couldn't be reached, or an established connection died.
    TransportUnreachable,

    /// The server rejected the supplied credentials (or none were supplied).
    AuthenticationFailed,

    /// A malformed message or an unexpected status/sequence of messages.
    ProtocolViolation,

    /// No media section matched a known depacketizer.
    UnsupportedMedia,

    /// An operation was attempted on a stopped or failed session.
    SessionClosed,

    /// An I/O operation or awaited response exceeded its deadline.
    Timeout,

    /// A bad argument from the caller.
    InvalidArgument,
}

impl Error {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self.0.as_ref() {
            ErrorInt::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ErrorInt::ConnectError(_) => ErrorKind::TransportUnreachable,
            ErrorInt::ReadError { .. } => ErrorKind::TransportUnreachable,
            ErrorInt::WriteError { .. } => ErrorKind::TransportUnreachable,
            ErrorInt::UdpRecvError { .. } => ErrorKind::TransportUnreachable,
            ErrorInt::FramingError { .. } => ErrorKind::ProtocolViolation,
            ErrorInt::ResponseError { .. } => ErrorKind::ProtocolViolation,
            ErrorInt::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            ErrorInt::UnsupportedMedia { .. } => ErrorKind::UnsupportedMedia,
            ErrorInt::SessionClosed => ErrorKind::SessionClosed,
            ErrorInt::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Returns the status code, if the error was generated from an RTSP
    /// response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::ResponseError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    FramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("{status} response to {method} CSeq={cseq}: {description}\n\n\
             conn: {conn_ctx}\nmsg: {msg_ctx}")]
    ResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: crate::message::Method,
        cseq: u32,
        status: u16,
        description: String,
    },

    #[error("Authentication failed: {description}\n\nconn: {conn_ctx}")]
    AuthenticationFailed {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("No supported media: {description}")]
    UnsupportedMedia { description: String },

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    ReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Error receiving UDP packet on stream {stream_id}: {source}\n\nconn: {conn_ctx}")]
    UdpRecvError {
        conn_ctx: ConnectionContext,
        stream_id: usize,
        source: std::io::Error,
    },

    #[error("Session closed")]
    SessionClosed,

    #[error("Timeout: {description}")]
    Timeout { description: String },
}
