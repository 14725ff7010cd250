// SPDX-License-Identifier: MIT OR Apache-2.0

//! The seams between session logic and the network.
//!
//! Everything here is non-blocking: the background task polls transports on
//! each tick while holding the manager lock, so an implementation must never
//! wait for the peer. Only [`Connector::connect_rtsp`], [`Connector::fetch`]
//! and [`Connector::post`] are async, and those are awaited with the lock
//! released.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;

use crate::error::ErrorInt;
use crate::{ConnectionContext, Error, ReceivedMessage, StreamContext};

/// Whether an RTSP connection can accept another request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportState {
    Ready,

    /// Unrecoverable: the peer closed the connection or a write failed.
    Invalidated,
}

/// An RTSP control connection.
pub trait RtspTransport: Send {
    fn ctx(&self) -> ConnectionContext;

    fn state(&self) -> TransportState;

    /// Queues a request and flushes what it can without blocking.
    fn send(&mut self, req: rtsp_types::Request<Bytes>) -> Result<(), Error>;

    /// Sends an interleaved data message (RTCP receiver reports, NAT keepalives).
    fn send_data(&mut self, channel_id: u8, data: Bytes) -> Result<(), Error>;

    /// Returns the next complete message, or `None` if nothing more has
    /// arrived. Responses, server requests, and interleaved data all come
    /// through here.
    fn poll_message(&mut self) -> Result<Option<ReceivedMessage>, Error>;

    /// Discards partially-received input after a reply timeout so a late or
    /// garbled reply can't be mistaken for the next one.
    fn reset(&mut self);
}

/// A pair of UDP sockets for one stream's RTP and RTCP.
pub trait RtpTransport: Send {
    fn ctx(&self) -> StreamContext;

    /// The local (even) RTP port; RTCP is the following port.
    fn local_rtp_port(&self) -> u16;

    fn is_multicast(&self) -> bool;

    /// Sets where RTCP reports and keepalives go, and which source to accept.
    fn set_peer(&mut self, rtp_addr: SocketAddr);

    fn recv_rtp(&mut self) -> Result<Option<Bytes>, Error>;

    fn recv_rtcp(&mut self) -> Result<Option<Bytes>, Error>;

    fn send_rtcp(&mut self, data: Bytes) -> Result<(), Error>;

    /// Sends a small datagram from both sockets to keep NAT bindings open.
    fn send_nat_keepalive(&mut self) -> Result<(), Error>;
}

/// How to bind a new [`RtpTransport`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RtpBinding {
    /// Local address to bind for unicast reception.
    pub local_ip: IpAddr,

    /// First RTP port to try. With `exact_port`, only this port is acceptable;
    /// otherwise successive even ports are tried. `None` picks at random.
    pub first_port: Option<u16>,
    pub exact_port: bool,

    /// Multicast group to join and its TTL.
    pub multicast: Option<(IpAddr, u8)>,
}

/// Creates transports, and fetches or posts session descriptions.
pub trait Connector: Send + Sync {
    fn connect_rtsp<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<Box<dyn RtspTransport>, Error>>;

    fn open_rtp(&self, binding: RtpBinding) -> Result<Box<dyn RtpTransport>, Error>;

    /// Fetches a remote session description (`http://`, `rtp://`).
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<Bytes, Error>> {
        let e = wrap!(ErrorInt::NotSupported(format!("fetching {url}")));
        Box::pin(futures::future::ready(Err(e)))
    }

    /// Posts a session checkpoint to a migration server.
    fn post<'a>(&'a self, url: &'a Url, body: Bytes) -> BoxFuture<'a, Result<(), Error>> {
        drop(body);
        let e = wrap!(ErrorInt::NotSupported(format!("posting to {url}")));
        Box::pin(futures::future::ready(Err(e)))
    }
}
