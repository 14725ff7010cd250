// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, PacketContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; most carry enough
/// context to find the offending packet or RTSP message in a capture. Callers
/// which need to branch on the failure should use [`Error::kind`].
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
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

/// The category of an [`Error`], as reported to the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or unsupported URL, or an unusable session description.
    UrlError,

    /// The ES_ID or control string doesn't resolve to a known stream.
    StreamNotFound,

    /// Timeout, connection reset, or other transport failure.
    NetworkFailure,

    /// Unsupported profile, transport, payload format, or direction.
    NotSupported,

    /// A depacketizer couldn't parse the payload it was given.
    NonCompliantBitstream,

    /// The server misbehaved or an internal invariant was violated.
    ServiceError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ErrorKind::UrlError => "URL error",
            ErrorKind::StreamNotFound => "stream not found",
            ErrorKind::NetworkFailure => "network failure",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::NonCompliantBitstream => "non-compliant bitstream",
            ErrorKind::ServiceError => "service error",
        })
    }
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    #[error("Bad URL: {0}")]
    UrlError(String),

    #[error("Bad session description: {0}")]
    SdpError(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Bad format-specific parameters: {0}")]
    FormatParamsError(String),

    #[error("Bad configuration value for {key}: {description}")]
    ConfigError {
        key: &'static str,
        description: String,
    },

    /// Unparseable or unexpected RTSP message.
    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    /// A non-success (or unusable) response to a command.
    ///
    /// The kind depends on the method as well as the status, so it's decided
    /// by the caller.
    #[error("[{conn_ctx}, {msg_ctx}] {status} response to {} CSeq={cseq}: \
             {description}", Into::<&str>::into(.method))]
    RtspResponseError {
        kind: ErrorKind,
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    #[error("[{conn_ctx}] no response to {} CSeq={cseq} after {elapsed:?}",
            Into::<&str>::into(.method))]
    RtspTimeout {
        conn_ctx: ConnectionContext,
        method: rtsp_types::Method,
        cseq: u32,
        elapsed: std::time::Duration,
    },

    #[error("[{conn_ctx}] RTSP connection is no longer usable")]
    RtspInvalidated { conn_ctx: ConnectionContext },

    #[error("[{conn_ctx}, {pkt_ctx} stream {stream_id}]: {description}")]
    PacketError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        stream_id: usize,
        description: String,
    },

    #[error(
        "[{conn_ctx}, {pkt_ctx}, stream={stream_id}, ssrc={ssrc:08x}, \
         seq={sequence_number:08x}] {description}"
    )]
    RtpPacketError {
        conn_ctx: ConnectionContext,
        pkt_ctx: crate::PacketContext,
        stream_id: usize,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from RTSP peer: {source}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}, {pkt_ctx}] Error receiving UDP packet: {source}")]
    UdpRecvError {
        conn_ctx: ConnectionContext,
        pkt_ctx: PacketContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error("No data received in {} ms", .elapsed.as_millis())]
    UdpTimeout { elapsed: std::time::Duration },

    #[error("Unable to access session state file {path}: {source}")]
    MigrationIoError {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ErrorInt {
    fn kind(&self) -> ErrorKind {
        match self {
            ErrorInt::UrlError(_) | ErrorInt::SdpError(_) => ErrorKind::UrlError,
            ErrorInt::StreamNotFound(_) => ErrorKind::StreamNotFound,
            ErrorInt::NotSupported(_) => ErrorKind::NotSupported,
            ErrorInt::RtspResponseError { kind, .. } => *kind,
            ErrorInt::FormatParamsError(_)
            | ErrorInt::PacketError { .. }
            | ErrorInt::RtpPacketError { .. } => {
                ErrorKind::NonCompliantBitstream
            }
            ErrorInt::RtspFramingError { .. }
            | ErrorInt::RtspTimeout { .. }
            | ErrorInt::RtspInvalidated { .. }
            | ErrorInt::ConnectError(_)
            | ErrorInt::RtspReadError { .. }
            | ErrorInt::UdpRecvError { .. }
            | ErrorInt::WriteError { .. }
            | ErrorInt::UdpTimeout { .. } => ErrorKind::NetworkFailure,
            ErrorInt::ConfigError { .. }
            | ErrorInt::MigrationIoError { .. }
            | ErrorInt::FailedPrecondition(_)
            | ErrorInt::Internal(_) => ErrorKind::ServiceError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let e = wrap!(ErrorInt::UdpTimeout {
            elapsed: std::time::Duration::from_millis(10_000),
        });
        assert_eq!(e.kind(), ErrorKind::NetworkFailure);
        assert_eq!(e.to_string(), "No data received in 10000 ms");

        let e = wrap!(ErrorInt::RtspResponseError {
            kind: ErrorKind::StreamNotFound,
            conn_ctx: ConnectionContext::dummy(),
            msg_ctx: RtspMessageContext::dummy(),
            method: rtsp_types::Method::Setup,
            cseq: 3,
            status: rtsp_types::StatusCode::NotFound,
            description: "no such track".to_owned(),
        });
        assert_eq!(e.kind(), ErrorKind::StreamNotFound);
        assert!(e.to_string().contains("SETUP CSeq=3"), "{}", e);
    }
}
