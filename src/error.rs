// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages: in most cases they
/// carry enough context to find the offending message in a packet capture.
/// [`Error::kind`] gives a coarse category for callers that must branch,
/// e.g. to decide whether reconnecting with the same credentials is futile.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match *self.0 {
            ErrorInt::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ErrorInt::ConnectError(_) => ErrorKind::Connect,
            ErrorInt::RtspFramingError { .. } => ErrorKind::Framing,
            ErrorInt::RtspResponseError { .. } => ErrorKind::Response,
            ErrorInt::AuthenticationError { .. } => ErrorKind::Authentication,
            ErrorInt::RtspReadError { .. } | ErrorInt::WriteError { .. } => ErrorKind::Io,
            ErrorInt::Timeout(_) => ErrorKind::Timeout,
            ErrorInt::QueueFull { .. } => ErrorKind::Backpressure,
            ErrorInt::NoUsableTracks { .. } => ErrorKind::NoUsableTracks,
            ErrorInt::Internal(_) => ErrorKind::Internal,
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

/// Coarse classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller supplied an unusable URL or option.
    InvalidArgument,

    /// The TCP connection couldn't be established.
    Connect,

    /// The byte stream desynchronized: unexpected leading byte, bad
    /// interleaved length, or an unparseable control block.
    Framing,

    /// The server answered a request with a non-success status.
    Response,

    /// The server rejected the credentials, or demanded ones we don't have.
    Authentication,

    /// Reading or writing the connection failed, including EOF.
    Io,

    /// A read, write, or dial didn't complete within its deadline.
    Timeout,

    /// The consumer fell behind and an output queue filled up.
    Backpressure,

    /// DESCRIBE returned no video or audio track this crate can handle.
    NoUsableTracks,

    Internal,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    /// Unparseable or unexpected bytes on the connection.
    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] {status} response to {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Authentication failed for {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    AuthenticationError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from RTSP peer: {source}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("[{conn_ctx}] {queue} queue full at capacity {capacity}; consumer is too slow")]
    QueueFull {
        conn_ctx: ConnectionContext,
        queue: &'static str,
        capacity: usize,
    },

    #[error("[{conn_ctx}] No usable video or audio tracks in SDP: {description}")]
    NoUsableTracks {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}
