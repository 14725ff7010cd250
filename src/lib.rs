// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP/RTP streaming client core.
//!
//! Turns a network media session (described by SDP and reached over RTSP with
//! UDP or interleaved TCP transport, or as bare multicast RTP) into
//! demultiplexed, timestamped access units handed to a host media pipeline.
//! See [`client::SessionManager`] for the entry point.

#![forbid(clippy::print_stderr, clippy::print_stdout)]
// I prefer to use from_str_radix(..., 10) to explicitly note the base.
#![allow(clippy::from_str_radix_10)]

use bytes::Bytes;
use rtsp_types::Message;
use std::fmt::{Debug, Display};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod error;
mod hex;

pub mod client;
pub mod codec;
pub mod config;
mod rtcp;
pub mod rtp;
mod tokio;

#[cfg(test)]
mod testutil;

pub use crate::tokio::TokioConnector;
pub use config::{ClientConfig, TransportMode};
pub use error::{Error, ErrorKind};

use error::ErrorInt;

/// A received RTSP message: a response, a server request, or interleaved data.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub ctx: RtspMessageContext,
    pub msg: Message<Bytes>,
}

/// An extended RTP timestamp on a stream's timeline.
///
/// `timestamp` has had 32-bit wraparounds unrolled. `start` is the RTP time
/// the stream's media time is measured from: the `rtptime` of the `RTP-Info`
/// header when the server sent one, else the first packet's. Elapsed seconds
/// plus the stream's start NPT give normal play time.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    timestamp: i64,
    clock_rate: NonZeroU32,
    start: u32,
}

impl Timestamp {
    /// Returns `None` if `timestamp - start` underflows.
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: u32) -> Option<Self> {
        timestamp.checked_sub(i64::from(start))?;
        Some(Timestamp {
            timestamp,
            clock_rate,
            start,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// In Hz.
    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Clock ticks since `start`.
    #[inline]
    pub fn elapsed(&self) -> i64 {
        self.timestamp - i64::from(self.start)
    }

    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed() as f64 / f64::from(self.clock_rate.get())
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (wire {}) +{:.03}s",
            self.timestamp,
            self.timestamp as u32,
            self.elapsed_secs()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp(2_208_988_800 << 32);

/// A wallclock time in 32.32 fixed-point seconds since 1900, as RTCP sender
/// reports carry it. Servers' clocks may be arbitrarily wrong.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// The middle 32 bits, as echoed in the "last SR" field of reception reports.
    #[inline]
    pub fn compact(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Converts to UTC, assuming the NTP era that contains the Unix epoch.
    pub fn to_utc(self) -> Option<chrono::DateTime<chrono::Utc>> {
        let since_unix = self.0.wrapping_sub(UNIX_EPOCH.0);
        let secs = since_unix >> 32;
        let nanos = ((since_unix & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        chrono::DateTime::from_timestamp(secs as i64, nanos as u32)
    }
}

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_utc() {
            Some(t) => write!(f, "{}", t.format("%FT%T%.3fZ")),
            None => write!(f, "ntp:{:016x}", self.0),
        }
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// The local realtime clock's reading when something was received, for
/// matching errors against logs and packet captures.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// Identifies an RTSP control connection.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub(crate) fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self::new(unspecified, unspecified)
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            self.local_addr, self.peer_addr, self.established_wall
        )
    }
}

/// Where a message (or read error) sits within an RTSP connection.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// Byte offset within the connection's input. Over TCP the bottom 32 bits
    /// match the relative sequence number in a capture.
    pos: u64,
    received_wall: WallTime,
}

impl RtspMessageContext {
    pub(crate) fn new(pos: u64) -> Self {
        Self {
            pos,
            received_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self::new(0)
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, self.received_wall)
    }
}

/// A stream's UDP transport; interleaved streams are identified by their
/// [`ConnectionContext`] and channel instead.
#[derive(Copy, Clone, Debug)]
pub enum StreamContext {
    /// RTP addresses. RTCP uses the same hosts, one port higher.
    Udp {
        local: SocketAddr,
        peer: Option<SocketAddr>,
    },

    #[doc(hidden)]
    Dummy,
}

impl StreamContext {
    pub(crate) fn udp(local: SocketAddr, peer: Option<SocketAddr>) -> Self {
        StreamContext::Udp { local, peer }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        StreamContext::Dummy
    }
}

impl Display for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let StreamContext::Udp { local, peer } = self else {
            return f.write_str("dummy");
        };
        write!(f, "{}:{}-{}(me)", local.ip(), local.port(), local.port().saturating_add(1))?;
        if let Some(p) = peer {
            write!(f, " -> {}:{}-{}", p.ip(), p.port(), p.port().saturating_add(1))?;
        }
        Ok(())
    }
}

/// How an RTP or RTCP packet arrived.
#[derive(Copy, Clone, Debug)]
pub enum PacketContext {
    /// A UDP datagram, read at this time.
    Udp(WallTime),

    /// Interleaved in the RTSP connection.
    Interleaved(RtspMessageContext),

    #[doc(hidden)]
    Dummy,
}

impl PacketContext {
    pub(crate) fn udp() -> Self {
        PacketContext::Udp(WallTime::now())
    }

    pub(crate) fn tcp(msg_ctx: RtspMessageContext) -> Self {
        PacketContext::Interleaved(msg_ctx)
    }

    #[doc(hidden)]
    pub fn dummy() -> PacketContext {
        PacketContext::Dummy
    }
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketContext::Udp(wall) => Display::fmt(wall, f),
            PacketContext::Interleaved(msg_ctx) => Display::fmt(msg_ctx, f),
            PacketContext::Dummy => f.write_str("dummy"),
        }
    }
}
