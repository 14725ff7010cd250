// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based [`Connector`].
//!
//! Transports are polled from the session manager's background task with a
//! no-op waker: each tick reads whatever the reactor has marked ready and
//! never waits.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, trace};
use rand::Rng;
use rtsp_types::{Data, Message};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use url::{Host, Url};

use crate::client::transport::{
    Connector, RtpBinding, RtpTransport, RtspTransport, TransportState,
};
use crate::{
    ConnectionContext, Error, ErrorInt, PacketContext, ReceivedMessage, RtspMessageContext,
    StreamContext,
};

/// Largest datagram accepted on RTP/RTCP sockets.
const MAX_DATAGRAM: usize = 65_536;

/// Sent to open NAT bindings toward the server's ports.
const NAT_KEEPALIVE: &[u8] = b"\xce\xfa\xed\xfe";

/// Connects with tokio sockets. Doesn't fetch or post over HTTP.
#[derive(Copy, Clone, Debug, Default)]
pub struct TokioConnector;

impl Connector for TokioConnector {
    fn connect_rtsp<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<Box<dyn RtspTransport>, Error>> {
        Box::pin(async move {
            let host = url
                .host()
                .ok_or_else(|| wrap!(ErrorInt::UrlError(format!("{url} has no host"))))?;
            let port = url.port().unwrap_or(554);
            if url.scheme() == "rtspu" {
                let t = TokioRtspu::connect(host, port)
                    .await
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
                debug!("[{}] RTSP over UDP to {}", t.ctx, url);
                return Ok(Box::new(t) as Box<dyn RtspTransport>);
            }
            let conn = Connection::connect(host, port)
                .await
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
            debug!("[{}] connected to {}", conn.ctx(), url);
            Ok(Box::new(TokioRtsp {
                conn,
                state: TransportState::Ready,
            }) as Box<dyn RtspTransport>)
        })
    }

    fn open_rtp(&self, binding: RtpBinding) -> Result<Box<dyn RtpTransport>, Error> {
        let local_ip = match binding.multicast {
            Some((IpAddr::V4(_), _)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Some((IpAddr::V6(_), _)) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            None => binding.local_ip,
        };
        let pair = match (binding.first_port, binding.exact_port) {
            (Some(port), true) => UdpPair::exact(local_ip, port),
            (first_port, _) => UdpPair::for_ip(local_ip, first_port),
        }
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        if let Some((group, ttl)) = binding.multicast {
            pair.join(group, ttl)
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        }
        Ok(Box::new(TokioRtp {
            pair,
            peer: None,
            multicast: binding.multicast.is_some(),
        }))
    }
}

fn noop_context() -> Context<'static> {
    Context::from_waker(futures::task::noop_waker_ref())
}

struct TokioRtsp {
    conn: Connection,
    state: TransportState,
}

impl TokioRtsp {
    fn fail(&mut self, e: ErrorInt) -> Error {
        self.state = TransportState::Invalidated;
        wrap!(e)
    }

    /// Writes out buffered requests as far as the socket allows.
    fn flush(&mut self) -> Result<(), Error> {
        let framed = Pin::new(&mut self.conn.0);
        match Sink::<Message<Bytes>>::poll_flush(framed, &mut noop_context()) {
            Poll::Ready(Err(e)) => {
                let e = self.conn.wrap_write_err(e);
                Err(self.fail(e))
            }
            _ => Ok(()),
        }
    }

    fn send_message(&mut self, msg: Message<Bytes>) -> Result<(), Error> {
        if self.state == TransportState::Invalidated {
            bail!(ErrorInt::RtspInvalidated {
                conn_ctx: *self.conn.ctx()
            });
        }

        // Framed buffers without limit; readiness only asks it to flush first.
        let framed = Pin::new(&mut self.conn.0);
        if let Poll::Ready(Err(e)) = Sink::<Message<Bytes>>::poll_ready(framed, &mut noop_context()) {
            let e = self.conn.wrap_write_err(e);
            return Err(self.fail(e));
        }
        if let Err(e) = self.conn.0.start_send_unpin(msg) {
            let e = self.conn.wrap_write_err(e);
            return Err(self.fail(e));
        }
        self.flush()
    }
}

impl RtspTransport for TokioRtsp {
    fn ctx(&self) -> ConnectionContext {
        *self.conn.ctx()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn send(&mut self, req: rtsp_types::Request<Bytes>) -> Result<(), Error> {
        self.send_message(Message::Request(req))
    }

    fn send_data(&mut self, channel_id: u8, data: Bytes) -> Result<(), Error> {
        self.send_message(Message::Data(Data::new(channel_id, data)))
    }

    fn poll_message(&mut self) -> Result<Option<ReceivedMessage>, Error> {
        if self.state == TransportState::Invalidated {
            return Ok(None);
        }
        self.flush()?;
        match self.conn.0.poll_next_unpin(&mut noop_context()) {
            Poll::Pending => Ok(None),
            Poll::Ready(Some(Ok(m))) => Ok(Some(m)),
            Poll::Ready(Some(Err(e))) => {
                let e = self.conn.wrap_read_err(e);
                Err(self.fail(e))
            }
            Poll::Ready(None) => {
                let e = ErrorInt::RtspReadError {
                    conn_ctx: *self.conn.ctx(),
                    msg_ctx: self.conn.eof_ctx(),
                    source: std::io::ErrorKind::UnexpectedEof.into(),
                };
                Err(self.fail(e))
            }
        }
    }

    fn reset(&mut self) {
        let discarded = self.conn.0.read_buffer().len();
        if discarded > 0 {
            debug!(
                "[{}] discarding {} buffered bytes",
                self.conn.ctx(),
                discarded
            );
        }
        let codec = self.conn.0.codec_mut();
        codec.read_pos += discarded as u64;
        self.conn.0.read_buffer_mut().clear();
    }
}

/// RTSP over UDP: one message per datagram, and no interleaved data.
struct TokioRtspu {
    socket: UdpSocket,
    ctx: ConnectionContext,
    state: TransportState,

    /// Bytes received so far, for message contexts.
    read_pos: u64,
}

impl TokioRtspu {
    async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let peer = match host {
            Host::Domain(h) => tokio::net::lookup_host((h, port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, format!("{h} not found"))
                })?,
            Host::Ipv4(h) => SocketAddr::new(IpAddr::V4(h), port),
            Host::Ipv6(h) => SocketAddr::new(IpAddr::V6(h), port),
        };
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self {
            ctx: ConnectionContext::new(socket.local_addr()?, peer),
            socket,
            state: TransportState::Ready,
            read_pos: 0,
        })
    }
}

impl RtspTransport for TokioRtspu {
    fn ctx(&self) -> ConnectionContext {
        self.ctx
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn send(&mut self, req: rtsp_types::Request<Bytes>) -> Result<(), Error> {
        let mut buf = Vec::new();
        if let Err(e) = Message::Request(req).write(&mut buf) {
            bail!(ErrorInt::Internal(format!("unable to serialize request: {e:?}").into()));
        }
        if let Err(source) = self.socket.try_send(&buf) {
            self.state = TransportState::Invalidated;
            bail!(ErrorInt::WriteError {
                conn_ctx: self.ctx,
                source,
            });
        }
        Ok(())
    }

    fn send_data(&mut self, channel_id: u8, _data: Bytes) -> Result<(), Error> {
        bail!(ErrorInt::NotSupported(format!(
            "interleaved channel {channel_id} over RTSP/UDP"
        )))
    }

    fn poll_message(&mut self) -> Result<Option<ReceivedMessage>, Error> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let len = match self.socket.try_recv(&mut buf) {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(source) => {
                    self.state = TransportState::Invalidated;
                    bail!(ErrorInt::RtspReadError {
                        conn_ctx: self.ctx,
                        msg_ctx: RtspMessageContext::new(self.read_pos),
                        source,
                    });
                }
            };
            let ctx = RtspMessageContext::new(self.read_pos);
            self.read_pos += len as u64;
            let raw = Bytes::copy_from_slice(&buf[..len]);
            let msg = match Message::parse(&raw[..]) {
                Ok((Message::Response(r), _)) => Message::Response(r.map_body(|b| raw.slice_ref(b))),
                Ok((Message::Request(r), _)) => Message::Request(r.map_body(|b| raw.slice_ref(b))),
                Ok((Message::Data(_), _)) | Err(_) => {
                    debug!(
                        "[{}] ignoring unparseable {}-byte datagram:\n{:#?}",
                        self.ctx,
                        len,
                        crate::hex::LimitedHex::new(&raw[..], 64)
                    );
                    continue;
                }
            };
            return Ok(Some(ReceivedMessage { ctx, msg }));
        }
    }

    fn reset(&mut self) {}
}

/// A RTSP connection framed into messages.
pub(crate) struct Connection(Framed<TcpStream, Codec>);

impl Connection {
    pub(crate) async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let ctx = ConnectionContext::new(stream.local_addr()?, stream.peer_addr()?);
        Ok(Self(Framed::new(stream, Codec { ctx, read_pos: 0 })))
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.codec().ctx
    }

    fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext::new(self.0.codec().read_pos + self.0.read_buffer().remaining() as u64)
    }

    fn wrap_write_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            },
            CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                conn_ctx: *self.ctx(),
                msg_ctx: RtspMessageContext::new(pos),
                description,
            },
        }
    }

    fn wrap_read_err(&self, e: CodecError) -> ErrorInt {
        match e {
            CodecError::IoError(source) => ErrorInt::RtspReadError {
                conn_ctx: *self.ctx(),
                msg_ctx: self.eof_ctx(),
                source,
            },
            CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                conn_ctx: *self.ctx(),
                msg_ctx: RtspMessageContext::new(pos),
                description,
            },
        }
    }
}

/// Encodes and decodes RTSP messages.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// [`Framed`] wants an error convertible from `std::io::Error`; [`Error`]
/// needs context the codec doesn't have.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // rtsp-types skips leading CRLFs; do the same so the data fast path
        // below sees the `$`.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(4);
            return Ok(Some((
                len,
                Message::Data(Data::new(channel_id, msg.freeze())),
            )));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // The parsed message borrows `src`; detach it, split off the raw
        // message, then reattach the body as `Bytes`.
        let msg = match msg {
            Message::Request(msg) => {
                let body = body_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                Message::Request(msg.replace_body(take_body(src, len, body)))
            }
            Message::Response(msg) => {
                let body = body_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                Message::Response(msg.replace_body(take_body(src, len, body)))
            }
            Message::Data(d) => {
                // Only reachable if the fast path above missed a `$`.
                let channel_id = d.channel_id();
                let body = body_range(src, d.into_body());
                Message::Data(Data::new(channel_id, take_body(src, len, body)))
            }
        };
        Ok(Some((len, msg)))
    }
}

/// Locates `body`, which the parser borrowed from `buf`, as a range within it.
fn body_range(buf: &[u8], body: &[u8]) -> Option<std::ops::Range<usize>> {
    if body.is_empty() {
        return None;
    }
    let start = (body.as_ptr() as usize).checked_sub(buf.as_ptr() as usize)?;
    let end = start.checked_add(body.len())?;
    (end <= buf.len()).then_some(start..end)
}

/// Consumes a `len`-byte message from `src`, returning its body.
fn take_body(src: &mut BytesMut, len: usize, body: Option<std::ops::Range<usize>>) -> Bytes {
    match body {
        Some(r) => {
            let mut raw = src.split_to(len);
            raw.advance(r.start);
            raw.truncate(r.len());
            raw.freeze()
        }
        None => {
            src.advance(len);
            Bytes::new()
        }
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, msg)) = self.parse_msg(src)? else {
            return Ok(None);
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext::new(self.read_pos),
        };
        self.read_pos += len as u64;
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .map_err(|e| CodecError::ParseError {
                description: format!("unable to serialize message: {e:?}"),
                pos: self.read_pos,
            })
    }
}

/// RTP and RTCP sockets on an even port and the odd port after it.
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

/// Randomly chosen RTP ports fall in ffmpeg's default range.
const RANDOM_RTP_PORTS: std::ops::Range<u16> = 5000..65000;

const BIND_ATTEMPTS: u16 = 10;

impl UdpPair {
    /// With `first_port`, tries consecutive even ports from there; otherwise
    /// random even ports.
    pub(crate) fn for_ip(ip_addr: IpAddr, first_port: Option<u16>) -> Result<Self, std::io::Error> {
        let mut rng = rand::thread_rng();
        for attempt in 0..BIND_ATTEMPTS {
            let rtp_port = match first_port {
                Some(p) => match (p & !1).checked_add(2 * attempt) {
                    Some(port) if port < u16::MAX => port,
                    _ => break,
                },
                None => rng.gen_range(RANDOM_RTP_PORTS) & !1,
            };
            match Self::try_bind(ip_addr, rtp_port)? {
                Some(pair) => return Ok(pair),
                None => trace!(
                    "{}:{} or the port after it is in use (attempt {}/{})",
                    ip_addr,
                    rtp_port,
                    attempt + 1,
                    BIND_ATTEMPTS
                ),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no free even/odd port pair on {ip_addr} after {BIND_ATTEMPTS} attempts"),
        ))
    }

    /// Binds exactly `rtp_port` and the port after it.
    pub(crate) fn exact(ip_addr: IpAddr, rtp_port: u16) -> Result<Self, std::io::Error> {
        Self::try_bind(ip_addr, rtp_port)?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{}:{}-{} in use", ip_addr, rtp_port, rtp_port.saturating_add(1)),
            )
        })
    }

    /// Returns `None` if either port is taken.
    fn try_bind(ip_addr: IpAddr, rtp_port: u16) -> Result<Option<Self>, std::io::Error> {
        let Some(rtcp_port) = rtp_port.checked_add(1) else {
            return Ok(None);
        };
        let Some(rtp_socket) = bind_udp(SocketAddr::new(ip_addr, rtp_port))? else {
            return Ok(None);
        };
        let Some(rtcp_socket) = bind_udp(SocketAddr::new(ip_addr, rtcp_port))? else {
            return Ok(None);
        };
        Ok(Some(Self {
            rtp_port,
            rtp_socket,
            rtcp_socket,
        }))
    }

    fn join(&self, group: IpAddr, ttl: u8) -> Result<(), std::io::Error> {
        for s in [&self.rtp_socket, &self.rtcp_socket] {
            match group {
                IpAddr::V4(g) => {
                    s.join_multicast_v4(g, Ipv4Addr::UNSPECIFIED)?;
                    s.set_multicast_ttl_v4(u32::from(ttl))?;
                }
                IpAddr::V6(g) => s.join_multicast_v6(&g, 0)?,
            }
        }
        debug!("joined {} on port {}", group, self.rtp_port);
        Ok(())
    }
}

/// Binds a non-blocking socket, or returns `None` if the address is in use.
fn bind_udp(addr: SocketAddr) -> Result<Option<UdpSocket>, std::io::Error> {
    let socket = match std::net::UdpSocket::bind(addr) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => return Ok(None),
        Err(e) => return Err(e),
    };
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket).map(Some)
}

struct TokioRtp {
    pair: UdpPair,

    /// The server's RTP address; RTCP is the following port.
    peer: Option<SocketAddr>,
    multicast: bool,
}

impl TokioRtp {
    fn local_addr(&self) -> SocketAddr {
        self.pair
            .rtp_socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.pair.rtp_port))
    }

    fn rtcp_peer(&self) -> Option<SocketAddr> {
        self.peer
            .map(|p| SocketAddr::new(p.ip(), p.port().saturating_add(1)))
    }

    fn recv(&self, rtcp: bool) -> Result<Option<Bytes>, Error> {
        let socket = if rtcp {
            &self.pair.rtcp_socket
        } else {
            &self.pair.rtp_socket
        };
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    // Unicast sessions only take packets from the server.
                    if let (false, Some(p)) = (self.multicast, self.peer) {
                        if from.ip() != p.ip() {
                            trace!("dropping {}-byte datagram from {}", len, from);
                            continue;
                        }
                    }
                    return Ok(Some(Bytes::copy_from_slice(&buf[..len])));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(source) => bail!(ErrorInt::UdpRecvError {
                    conn_ctx: ConnectionContext::dummy(),
                    pkt_ctx: PacketContext::udp(),
                    source,
                }),
            }
        }
    }

    fn send_to(&self, rtcp: bool, data: &[u8], to: SocketAddr) -> Result<(), Error> {
        let socket = if rtcp {
            &self.pair.rtcp_socket
        } else {
            &self.pair.rtp_socket
        };
        match socket.try_send_to(data, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("dropping {}-byte datagram to {}: socket full", data.len(), to);
                Ok(())
            }
            Err(source) => bail!(ErrorInt::WriteError {
                conn_ctx: ConnectionContext::new(self.local_addr(), to),
                source,
            }),
        }
    }
}

impl RtpTransport for TokioRtp {
    fn ctx(&self) -> StreamContext {
        StreamContext::udp(self.local_addr(), self.peer)
    }

    fn local_rtp_port(&self) -> u16 {
        self.pair.rtp_port
    }

    fn is_multicast(&self) -> bool {
        self.multicast
    }

    fn set_peer(&mut self, rtp_addr: SocketAddr) {
        self.peer = Some(rtp_addr);
    }

    fn recv_rtp(&mut self) -> Result<Option<Bytes>, Error> {
        self.recv(false)
    }

    fn recv_rtcp(&mut self) -> Result<Option<Bytes>, Error> {
        self.recv(true)
    }

    fn send_rtcp(&mut self, data: Bytes) -> Result<(), Error> {
        match self.rtcp_peer() {
            Some(to) => self.send_to(true, &data, to),
            None => Ok(()),
        }
    }

    fn send_nat_keepalive(&mut self) -> Result<(), Error> {
        let (Some(rtp), Some(rtcp)) = (self.peer, self.rtcp_peer()) else {
            return Ok(());
        };
        self.send_to(false, NAT_KEEPALIVE, rtp)?;
        self.send_to(true, NAT_KEEPALIVE, rtcp)
    }
}
