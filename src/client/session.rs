// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP command pipeline.
//!
//! Commands are queued by host calls and sent one at a time by the background
//! task: `SETUP` requests can't be pipelined because each must adopt the
//! previous response's `Session`, and the server may override the proposed
//! interleaved channel. Each command is resolved exactly once, either from its
//! reply, a timeout, or without being sent at all when aggregate control
//! already covered it.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Method, Request, Response, Version};
use tokio::time::Instant;
use url::Url;

use super::channel_mapping::{ChannelMappings, ChannelType};
use super::host::{ChannelCommand, ChannelCommandKind, ChannelHandle, HostEvent};
use super::parse;
use super::sdp::parse_description;
use super::stream::{RtpAnchor, RtpStream, RtpTimeCheck, StreamId, StreamState};
use super::transport::{RtpBinding, RtspTransport, TransportState};
use super::{ChannelTarget, Inner};
use crate::error::ErrorInt;
use crate::{ConnectionContext, Error, ErrorKind, PacketContext, RtspMessageContext};

/// A `TEARDOWN` unanswered this long is assumed to have worked.
const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(500);

const USER_AGENT: &str = concat!("rtsp-ingest/", env!("CARGO_PKG_VERSION"));

/// Limits how long one tick spends reading a busy connection.
const MAX_MESSAGES_PER_TICK: usize = 64;

/// Who is waiting on a command's result.
#[derive(Debug)]
pub(crate) enum Origin {
    /// Connecting the service (`None`) or a channel.
    Connect(Option<ChannelHandle>),

    /// A `SETUP`, confirming a channel connect if any.
    Setup(Option<ChannelHandle>),
    Channel(ChannelCommand),

    /// Keepalives, end-of-stream teardown, and close.
    Internal,
}

#[derive(Debug)]
pub(crate) struct Command {
    pub(crate) method: Method,
    pub(crate) stream: Option<StreamId>,
    pub(crate) range: Option<(f64, Option<f64>)>,

    /// Stream-level control URL, or `None` for the aggregate one.
    pub(crate) control: Option<Url>,
    pub(crate) needs_session_id: bool,

    /// For a channel `DESCRIBE`, which stream the channel wants.
    pub(crate) target: Option<ChannelTarget>,
    pub(crate) origin: Origin,
}

impl Command {
    pub(crate) fn new(method: Method, origin: Origin) -> Self {
        let needs_session_id = matches!(method, Method::Play | Method::Pause);
        Command {
            method,
            stream: None,
            range: None,
            control: None,
            needs_session_id,
            target: None,
            origin,
        }
    }

    pub(crate) fn for_stream(mut self, stream: StreamId, control: Option<Url>) -> Self {
        self.stream = Some(stream);
        self.control = control;
        self
    }

    pub(crate) fn with_range(mut self, range: Option<(f64, Option<f64>)>) -> Self {
        self.range = range;
        self
    }

    fn command_kind(&self) -> Option<&ChannelCommandKind> {
        match &self.origin {
            Origin::Channel(c) => Some(&c.kind),
            _ => None,
        }
    }
}

/// The FIFO of commands awaiting their turn. Host threads push while the
/// background task pops, so it has its own lock.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue(Mutex<VecDeque<Command>>);

impl CommandQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, command: Command) {
        self.lock().push_back(command);
    }

    fn push_front(&self, command: Command) {
        self.lock().push_front(command);
    }

    fn pop(&self) -> Option<Command> {
        self.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// The command awaiting a reply.
#[derive(Debug)]
pub(crate) struct InFlight {
    cmd: Command,
    cseq: u32,
    sent_at: Instant,
    uri: Url,
    interleave_requested: bool,

    /// Sent to the aggregate control URL.
    aggregate: bool,
}

/// One RTSP control connection and the server-side session on it.
pub(crate) struct RtspSession {
    transport: Box<dyn RtspTransport>,

    /// Where the service was described.
    pub(crate) url: Url,

    /// Aggregate control URL.
    pub(crate) control: Url,
    pub(crate) session_id: Option<Box<str>>,
    session_timeout: Duration,
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) in_flight: Option<InFlight>,

    /// The server's `PLAY` replies cover every stream, so one command per
    /// session suffices.
    pub(crate) agg_control: bool,

    /// The server refuses stream-level `PLAY`/`PAUSE` (status 460).
    pub(crate) agg_only: bool,
    pub(crate) force_interleave: bool,

    /// Start of the most recent `PLAY` range.
    pub(crate) last_range: f64,
    next_cseq: u32,
    channels: ChannelMappings,
    last_activity: Instant,
    keepalive_method: Method,
    teardown_queued: bool,
}

impl std::fmt::Debug for RtspSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtspSession")
            .field("conn", &self.transport.ctx())
            .field("control", &self.control.as_str())
            .field("session_id", &self.session_id)
            .field("queued", &self.queue.len())
            .field("in_flight", &self.in_flight.as_ref().map(|f| f.cseq))
            .field("agg_control", &self.agg_control)
            .field("agg_only", &self.agg_only)
            .field("channels", &self.channels)
            .finish()
    }
}

impl RtspSession {
    pub(crate) fn new(transport: Box<dyn RtspTransport>, url: Url, now: Instant) -> Self {
        RtspSession {
            transport,
            control: url.clone(),
            url,
            session_id: None,
            session_timeout: Duration::from_secs(60),
            queue: Arc::new(CommandQueue::default()),
            in_flight: None,
            agg_control: false,
            agg_only: false,
            force_interleave: false,
            last_range: 0.0,
            next_cseq: 1,
            channels: ChannelMappings::default(),
            last_activity: now,
            keepalive_method: Method::GetParameter,
            teardown_queued: false,
        }
    }

    pub(crate) fn ctx(&self) -> ConnectionContext {
        self.transport.ctx()
    }

    /// True when nothing is queued or awaiting a reply.
    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    /// Adopts an existing server session, as restored from a checkpoint.
    pub(crate) fn adopt(&mut self, session_id: &str, channels: &[(u8, usize)]) {
        self.session_id = Some(session_id.into());
        for &(channel_id, stream_i) in channels {
            if let Err(e) = self.channels.assign(channel_id, stream_i) {
                warn!("restored session: {}", e);
            }
        }
    }

    fn request(&self, method: Method, uri: &Url) -> Request<Bytes> {
        let with_session = method != Method::Describe;
        let mut req = Request::builder(method, Version::V1_0)
            .request_uri(uri.clone())
            .build(Bytes::new());
        if let (true, Some(id)) = (with_session, &self.session_id) {
            req.insert_header(headers::SESSION, id.to_string());
        }
        req
    }

    fn invalidated_error(&self) -> Error {
        wrap!(ErrorInt::RtspInvalidated {
            conn_ctx: self.transport.ctx(),
        })
    }
}

/// What to do with a popped command.
enum Prepared {
    Send {
        req: Request<Bytes>,
        uri: Url,
        interleave_requested: bool,
        aggregate: bool,
    },

    /// Resolved without sending.
    Resolved(Result<(), Error>),

    /// Commands queued in its place carry its origin.
    Replaced,
}

/// What to do with a command once its reply is handled.
enum Next {
    Resolve,

    /// Send it again (as with an aggregate-only server, or a channel
    /// `DESCRIBE` which now can be turned into a `SETUP`).
    Requeue,
}

fn method_str(method: &Method) -> &str {
    method.into()
}

fn response_error(
    s: &RtspSession,
    msg_ctx: RtspMessageContext,
    f: &InFlight,
    resp: &Response<Bytes>,
    kind: ErrorKind,
    description: impl Into<String>,
) -> Error {
    wrap!(ErrorInt::RtspResponseError {
        kind,
        conn_ctx: s.transport.ctx(),
        msg_ctx,
        method: f.cmd.method.clone(),
        cseq: f.cseq,
        status: resp.status(),
        description: description.into(),
    })
}

/// The base URL for relative controls in a `DESCRIBE` reply, as in
/// [RFC 2326 section C.1.1](https://tools.ietf.org/html/rfc2326#appendix-C.1.1).
fn content_base(resp: &Response<Bytes>) -> Option<Url> {
    [headers::CONTENT_BASE, headers::CONTENT_LOCATION]
        .iter()
        .filter_map(|h| resp.header(h))
        .find_map(|v| Url::parse(v.as_str()).ok())
}

/// Matches an `RTP-Info` url against a stream's control URL. Servers echo
/// either form, with or without a trailing slash.
fn control_matches(control: &Url, url: &str) -> bool {
    let c = control.as_str().trim_end_matches('/');
    let u = url.trim_end_matches('/');
    if c == u {
        return true;
    }
    match Url::parse(u) {
        Ok(parsed) => parsed.path().trim_end_matches('/') == control.path().trim_end_matches('/'),
        Err(_) => c.ends_with(&format!("/{}", u.trim_start_matches('/'))),
    }
}

impl Inner {
    /// Reports a command's result to whoever is waiting.
    pub(crate) fn resolve(&mut self, origin: Origin, result: Result<(), Error>) {
        match origin {
            Origin::Connect(None) => self.report_service_connect(result),
            Origin::Connect(Some(h)) | Origin::Setup(Some(h)) => {
                self.events.push(HostEvent::Connect(Some(h), result))
            }
            Origin::Channel(c) => self.events.push(HostEvent::Command(c, result)),
            Origin::Setup(None) | Origin::Internal => {
                if let Err(e) = result {
                    warn!("{}", e);
                    self.events
                        .push(HostEvent::Message(Err(e), "RTSP command failed".to_owned()));
                }
            }
        }
    }

    /// Runs one tick of the command pipeline.
    pub(crate) fn drive_session(&mut self, now: Instant, may_read_interleaved: bool) {
        let Some(mut s) = self.session.take() else {
            return;
        };
        self.read_messages(&mut s, now, may_read_interleaved);
        self.check_reply_timeout(&mut s, now);
        self.send_next(&mut s, now);
        self.queue_keepalive(&mut s, now);
        self.queue_teardown_at_eos(&mut s);
        self.send_interleaved_reports(&mut s, now);
        self.session = Some(s);
    }

    fn read_messages(&mut self, s: &mut RtspSession, now: Instant, may_read_interleaved: bool) {
        if s.transport.state() == TransportState::Invalidated {
            return;
        }
        for _ in 0..MAX_MESSAGES_PER_TICK {
            // Replies are always read; interleaved data only while the host
            // has room for it.
            if s.in_flight.is_none() && !may_read_interleaved {
                break;
            }
            let m = match s.transport.poll_message() {
                Ok(Some(m)) => m,
                Ok(None) => break,
                Err(e) => {
                    warn!("{}", e);
                    match s.in_flight.take() {
                        Some(f) => self.resolve(f.cmd.origin, Err(e)),
                        None => self
                            .events
                            .push(HostEvent::Message(Err(e), "RTSP connection lost".to_owned())),
                    }
                    break;
                }
            };
            match m.msg {
                rtsp_types::Message::Response(r) => self.handle_response(s, m.ctx, r, now),
                rtsp_types::Message::Request(r) => {
                    warn!(
                        "[{}, {}] ignoring {} request from server",
                        s.transport.ctx(),
                        m.ctx,
                        method_str(r.method())
                    );
                }
                rtsp_types::Message::Data(d) => {
                    let channel_id = d.channel_id();
                    self.handle_data(s, m.ctx, channel_id, d.into_body(), now);
                }
            }
        }
    }

    fn handle_data(
        &mut self,
        s: &RtspSession,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        body: Bytes,
        now: Instant,
    ) {
        let Some(m) = s.channels.lookup(channel_id) else {
            debug!("[{}] data on unassigned channel {}", msg_ctx, channel_id);
            return;
        };
        let Some(stream) = self.streams.get_mut(m.stream_i) else {
            return;
        };
        let id = StreamId(m.stream_i);
        match m.channel_type {
            ChannelType::Rtp => stream.handle_rtp(
                id,
                &s.transport.ctx(),
                &PacketContext::tcp(msg_ctx),
                body,
                now,
                &self.config,
                &mut self.events,
            ),
            ChannelType::Rtcp => stream.handle_rtcp(id, &body, now, &mut self.events),
        }
    }

    fn handle_response(
        &mut self,
        s: &mut RtspSession,
        msg_ctx: RtspMessageContext,
        resp: Response<Bytes>,
        now: Instant,
    ) {
        let cseq = parse::get_cseq(&resp);
        if s.in_flight.is_none() || s.in_flight.as_ref().map(|f| f.cseq) != cseq {
            debug!(
                "[{}, {}] ignoring unexpected {} response with CSeq {:?}",
                s.transport.ctx(),
                msg_ctx,
                u16::from(resp.status()),
                cseq
            );
            return;
        }
        let Some(mut f) = s.in_flight.take() else {
            return;
        };
        s.last_activity = now;
        debug!(
            "{} CSeq={} -> {}",
            method_str(&f.cmd.method),
            f.cseq,
            u16::from(resp.status())
        );
        let r = if resp.status().is_success() {
            self.apply_success(s, &f, msg_ctx, &resp)
        } else {
            self.apply_failure(s, &f, msg_ctx, &resp)
        };
        match r {
            Ok(Next::Resolve) => self.resolve(f.cmd.origin, Ok(())),
            Ok(Next::Requeue) => {
                if s.agg_control {
                    f.cmd.control = None;
                }
                s.queue.push_front(f.cmd);
            }
            Err(e) => self.resolve(f.cmd.origin, Err(e)),
        }
    }

    fn apply_success(
        &mut self,
        s: &mut RtspSession,
        f: &InFlight,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) -> Result<Next, Error> {
        match f.cmd.method {
            Method::Describe => self.describe_succeeded(s, f, msg_ctx, resp),
            Method::Setup => self.setup_succeeded(s, f, msg_ctx, resp),
            Method::Play => self.play_succeeded(s, f, msg_ctx, resp),
            Method::Pause => {
                for i in self.covered_streams(f, |st| st == StreamState::Running) {
                    let st = &mut self.streams[i];
                    st.halt();
                    st.paused = true;
                }
                Ok(Next::Resolve)
            }
            Method::Teardown => {
                self.torn_down(s);
                Ok(Next::Resolve)
            }
            _ => Ok(Next::Resolve),
        }
    }

    fn apply_failure(
        &mut self,
        s: &mut RtspSession,
        f: &InFlight,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) -> Result<Next, Error> {
        let status = u16::from(resp.status());
        let method = &f.cmd.method;
        if status == 460
            && !f.aggregate
            && matches!(method, Method::Play | Method::Pause | Method::Teardown)
        {
            debug!("server only allows aggregate operations; retrying");
            s.agg_only = true;
            s.agg_control = true;
            return Ok(Next::Requeue);
        }
        if *method == s.keepalive_method
            && *method == Method::GetParameter
            && matches!(status, 405 | 501)
        {
            debug!("server doesn't support GET_PARAMETER; using OPTIONS for keepalives");
            s.keepalive_method = Method::Options;
            return Ok(Next::Resolve);
        }
        let kind = match (method, status) {
            (_, 405) => ErrorKind::NotSupported,
            (Method::Describe, 300) if matches!(f.cmd.origin, Origin::Connect(Some(_))) => {
                ErrorKind::StreamNotFound
            }
            (Method::Describe, 300 | 404) => ErrorKind::UrlError,
            (Method::Setup, 404) => ErrorKind::StreamNotFound,
            _ => ErrorKind::ServiceError,
        };
        match method {
            Method::Play | Method::Pause => {
                s.agg_control = false;
                if let Some(st) = f.cmd.stream.and_then(|id| self.streams.get_mut(id.0)) {
                    st.state = StreamState::Disconnected;
                    st.check_rtp_time = RtpTimeCheck::None;
                }
            }
            Method::Setup => {
                if let Some(st) = f.cmd.stream.and_then(|id| self.streams.get_mut(id.0)) {
                    st.state = StreamState::Setup;
                }
            }
            Method::Teardown => self.torn_down(s),
            _ => {}
        }
        let body = String::from_utf8_lossy(resp.body());
        Err(response_error(s, msg_ctx, f, resp, kind, body.trim()))
    }

    fn describe_succeeded(
        &mut self,
        s: &mut RtspSession,
        f: &InFlight,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) -> Result<Next, Error> {
        if self.sdp.is_none() {
            let base_url = content_base(resp).unwrap_or_else(|| f.uri.clone());
            let desc = parse_description(
                resp.body(),
                Some(&base_url),
                &self.config,
                self.media_filter,
            )
            .map_err(|e| {
                let kind = e.kind();
                response_error(s, msg_ctx, f, resp, kind, e.to_string())
            })?;
            s.control = desc.control.clone().unwrap_or(base_url);
            s.force_interleave = desc.force_interleave;
            self.install_description(desc, true)?;
        }
        Ok(match f.cmd.origin {
            Origin::Connect(Some(_)) => Next::Requeue,
            _ => Next::Resolve,
        })
    }

    fn setup_succeeded(
        &mut self,
        s: &mut RtspSession,
        f: &InFlight,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) -> Result<Next, Error> {
        let Some(id) = f.cmd.stream else {
            return Ok(Next::Resolve);
        };
        // Takes the streams and session explicitly so no borrow outlives a call.
        let err = |streams: &mut [RtpStream], s: &RtspSession, description: String| {
            if let Some(st) = streams.get_mut(id.0) {
                st.state = StreamState::Setup;
            }
            response_error(s, msg_ctx, f, resp, ErrorKind::ServiceError, description)
        };
        let Some(session) = resp.header(&headers::SESSION) else {
            let d = "SETUP response has no Session header".to_owned();
            return Err(err(&mut self.streams, s, d));
        };
        let session = match parse::parse_session(session.as_str()) {
            Ok(h) => h,
            Err(d) => return Err(err(&mut self.streams, s, d)),
        };
        let transports = match resp.header(&headers::TRANSPORT) {
            Some(t) => match parse::parse_transports(t.as_str()) {
                Ok(t) => t,
                Err(d) => return Err(err(&mut self.streams, s, d)),
            },
            None => Vec::new(),
        };
        let Some(chosen) = transports
            .into_iter()
            .find(|t| t.interleaved.is_some() == f.interleave_requested)
        else {
            let d = if f.interleave_requested {
                "server refused interleaved transport"
            } else {
                "no usable transport in SETUP response"
            };
            return Err(err(&mut self.streams, s, d.to_owned()));
        };
        match &s.session_id {
            Some(old) if *old != session.id => {
                let d = format!(
                    "SETUP response changed session id from {:?} to {:?}",
                    old, session.id
                );
                return Err(err(&mut self.streams, s, d));
            }
            Some(_) => {}
            None => s.session_id = Some(session.id),
        }
        s.session_timeout = Duration::from_secs(session.timeout_sec.into());
        if let Some(ch) = chosen.interleaved {
            if let Err(d) = s.channels.assign(ch, id.0) {
                return Err(err(&mut self.streams, s, d));
            }
        }
        let peer_ip = s.transport.ctx().peer_addr().ip();
        let Some(st) = self.streams.get_mut(id.0) else {
            return Ok(Next::Resolve);
        };
        if let Some(ch) = chosen.interleaved {
            st.interleaved = Some(ch);
            st.transport = None;
        } else if let Some(t) = st.transport.as_mut() {
            if let Some((rtp_port, _)) = chosen.server_port.or(chosen.port) {
                t.set_peer(SocketAddr::new(chosen.source.unwrap_or(peer_ip), rtp_port));
            }
            st.server_port = chosen.server_port;
        }
        st.set_ssrc(chosen.ssrc);
        st.state = StreamState::Connected;
        debug!("stream {} set up: {:?}", id, st);
        Ok(Next::Resolve)
    }

    /// Streams a reply applies to: all matching session streams for an
    /// aggregate command, else the command's own.
    fn covered_streams(&self, f: &InFlight, state: impl Fn(StreamState) -> bool) -> Vec<usize> {
        if f.aggregate {
            self.streams
                .iter()
                .enumerate()
                .filter(|(_, st)| st.controlled && state(st.state))
                .map(|(i, _)| i)
                .collect()
        } else {
            f.cmd.stream.map(|id| id.0).into_iter().collect()
        }
    }

    fn play_succeeded(
        &mut self,
        s: &mut RtspSession,
        f: &InFlight,
        msg_ctx: RtspMessageContext,
        resp: &Response<Bytes>,
    ) -> Result<Next, Error> {
        let check = match f.cmd.command_kind() {
            Some(ChannelCommandKind::Resume) => RtpTimeCheck::RtpSeek,
            _ => RtpTimeCheck::Rtp,
        };
        let entries = match resp.header(&headers::RTP_INFO) {
            Some(v) => parse::parse_rtp_info(v.as_str()).map_err(|d| {
                response_error(s, msg_ctx, f, resp, ErrorKind::ServiceError, d)
            })?,
            None => Vec::new(),
        };
        let covered = self.covered_streams(f, |st| {
            matches!(
                st,
                StreamState::Connected | StreamState::Running | StreamState::SessionResume
            )
        });
        let start = f.cmd.range.map(|(start, _)| start);
        s.teardown_queued = false;

        if entries.is_empty() {
            debug!("PLAY reply has no RTP-Info; streams start at npt 0");
            for &i in &covered {
                let st = &mut self.streams[i];
                st.current_start = 0.0;
                st.start_unanchored();
                st.interactive = false;
            }
            return Ok(Next::Resolve);
        }

        let newly_aggregate = !s.agg_control && entries.len() > 1;
        if entries.len() > 1 {
            s.agg_control = true;
        }
        let mut anchored = Vec::with_capacity(entries.len());
        for e in &entries {
            let i = covered
                .iter()
                .copied()
                .find(|&i| {
                    self.streams[i]
                        .control
                        .as_ref()
                        .map_or(false, |c| control_matches(c, &e.url))
                })
                .or_else(|| (entries.len() == 1 && covered.len() == 1).then(|| covered[0]));
            let Some(i) = i else {
                debug!("RTP-Info for unknown stream {:?}", e.url);
                continue;
            };
            let st = &mut self.streams[i];
            if let Some(start) = start {
                st.current_start = start;
            }
            st.set_rtp_anchor(
                RtpAnchor {
                    seq: e.seq,
                    rtptime: e.rtptime,
                    ssrc: e.ssrc,
                },
                check,
            );
            st.interactive = true;
            if newly_aggregate && f.cmd.stream != Some(StreamId(i)) && st.channel.is_some() {
                st.skip_next_command = true;
            }
            anchored.push(i);
        }
        for &i in &covered {
            if !anchored.contains(&i) {
                trace!("stream {} not in RTP-Info; starting unanchored", i);
                let st = &mut self.streams[i];
                if let Some(start) = start {
                    st.current_start = start;
                }
                st.start_unanchored();
            }
        }
        Ok(Next::Resolve)
    }

    /// Forgets the server session after `TEARDOWN`; streams need a new `SETUP`.
    fn torn_down(&mut self, s: &mut RtspSession) {
        s.session_id = None;
        s.agg_control = false;
        s.channels = ChannelMappings::default();
        for st in self.streams.iter_mut().filter(|st| st.controlled) {
            st.halt();
            st.interleaved = None;
            if st.state != StreamState::Unavailable {
                st.state = StreamState::Setup;
            }
        }
    }

    fn check_reply_timeout(&mut self, s: &mut RtspSession, now: Instant) {
        let Some(f) = s.in_flight.as_ref() else {
            return;
        };
        if s.transport.state() == TransportState::Invalidated {
            let e = s.invalidated_error();
            if let Some(f) = s.in_flight.take() {
                self.resolve(f.cmd.origin, Err(e));
            }
            return;
        }
        let elapsed = now.saturating_duration_since(f.sent_at);
        if f.cmd.method == Method::Teardown {
            if elapsed < TEARDOWN_TIMEOUT {
                return;
            }
            debug!(
                "no reply to TEARDOWN CSeq={} after {:?}; assuming success",
                f.cseq, elapsed
            );
            s.transport.reset();
            self.torn_down(s);
            if let Some(f) = s.in_flight.take() {
                self.resolve(f.cmd.origin, Ok(()));
            }
            return;
        }
        if elapsed < self.config.rtsp_timeout {
            return;
        }
        let Some(f) = s.in_flight.take() else {
            return;
        };
        warn!(
            "[{}] no reply to {} CSeq={} after {:?}; resetting connection",
            s.transport.ctx(),
            method_str(&f.cmd.method),
            f.cseq,
            elapsed
        );
        s.transport.reset();
        if f.cmd.method == Method::Setup {
            if let Some(st) = f.cmd.stream.and_then(|id| self.streams.get_mut(id.0)) {
                st.state = StreamState::Setup;
            }
        }
        let e = wrap!(ErrorInt::RtspTimeout {
            conn_ctx: s.transport.ctx(),
            method: f.cmd.method.clone(),
            cseq: f.cseq,
            elapsed,
        });
        self.resolve(f.cmd.origin, Err(e));
    }

    fn send_next(&mut self, s: &mut RtspSession, now: Instant) {
        while s.in_flight.is_none() {
            let Some(cmd) = s.queue.pop() else {
                return;
            };
            let (mut req, uri, interleave_requested, aggregate) = match self.prepare(s, &cmd) {
                Prepared::Resolved(r) => {
                    self.resolve(cmd.origin, r);
                    continue;
                }
                Prepared::Replaced => continue,
                Prepared::Send {
                    req,
                    uri,
                    interleave_requested,
                    aggregate,
                } => (req, uri, interleave_requested, aggregate),
            };
            if s.transport.state() == TransportState::Invalidated {
                let e = s.invalidated_error();
                self.abandon_setup(&cmd);
                self.resolve(cmd.origin, Err(e));
                continue;
            }
            let cseq = s.next_cseq;
            s.next_cseq = s.next_cseq.wrapping_add(1);
            req.insert_header(headers::CSEQ, cseq.to_string());
            req.insert_header(headers::USER_AGENT, USER_AGENT);
            debug!("sending {} CSeq={} to {}", method_str(&cmd.method), cseq, uri);
            if let Err(e) = s.transport.send(req) {
                self.abandon_setup(&cmd);
                self.resolve(cmd.origin, Err(e));
                continue;
            }
            if cmd.method == Method::Setup {
                if let Some(st) = cmd.stream.and_then(|id| self.streams.get_mut(id.0)) {
                    st.state = StreamState::WaitingForAck;
                }
            }
            s.last_activity = now;
            s.in_flight = Some(InFlight {
                cmd,
                cseq,
                sent_at: now,
                uri,
                interleave_requested,
                aggregate,
            });
        }
    }

    fn abandon_setup(&mut self, cmd: &Command) {
        if cmd.method != Method::Setup {
            return;
        }
        if let Some(st) = cmd.stream.and_then(|id| self.streams.get_mut(id.0)) {
            st.state = StreamState::Setup;
        }
    }

    fn prepare(&mut self, s: &mut RtspSession, cmd: &Command) -> Prepared {
        match cmd.method {
            Method::Describe => self.prepare_describe(s, cmd),
            Method::Setup => self.prepare_setup(s, cmd),
            Method::Play | Method::Pause => self.prepare_play_pause(s, cmd),
            _ => {
                if s.session_id.is_none() {
                    return Prepared::Resolved(Ok(()));
                }
                let aggregate = cmd.control.is_none() || s.agg_control;
                let uri = match (&cmd.control, aggregate) {
                    (Some(c), false) => c.clone(),
                    _ => s.control.clone(),
                };
                Prepared::Send {
                    req: s.request(cmd.method.clone(), &uri),
                    uri,
                    interleave_requested: false,
                    aggregate,
                }
            }
        }
    }

    fn prepare_describe(&mut self, s: &mut RtspSession, cmd: &Command) -> Prepared {
        let channel = match cmd.origin {
            Origin::Connect(Some(channel)) if self.sdp.is_some() => channel,
            _ => {
                // Nothing described yet: ask the server.
                let uri = match &cmd.target {
                    Some(ChannelTarget::Url(u)) => u.clone(),
                    _ => s.url.clone(),
                };
                let mut req = s.request(Method::Describe, &uri);
                req.insert_header(headers::ACCEPT, "application/sdp");
                return Prepared::Send {
                    req,
                    uri,
                    interleave_requested: false,
                    aggregate: true,
                };
            }
        };
        let Some(i) = cmd
            .target
            .as_ref()
            .and_then(|t| self.find_target(t, channel))
        else {
            return Prepared::Resolved(Err(wrap!(ErrorInt::StreamNotFound(format!(
                "no stream matches {:?}",
                cmd.target
            )))));
        };
        let st = &mut self.streams[i];
        st.channel = Some(channel);
        match st.state {
            StreamState::Setup | StreamState::Disconnected => {
                let control = st.control.clone();
                s.queue.push_front(
                    Command::new(Method::Setup, Origin::Setup(Some(channel)))
                        .for_stream(StreamId(i), control),
                );
                Prepared::Replaced
            }
            StreamState::Unavailable => Prepared::Resolved(Err(wrap!(
                ErrorInt::FailedPrecondition(format!("stream {} is unavailable", st.es_id))
            ))),
            _ => Prepared::Resolved(Ok(())),
        }
    }

    fn prepare_setup(&mut self, s: &mut RtspSession, cmd: &Command) -> Prepared {
        let Some(id) = cmd.stream else {
            return Prepared::Resolved(Ok(()));
        };
        let config = self.config.clone();
        let connector = self.connector.clone();
        let Some(st) = self.streams.get_mut(id.0) else {
            return Prepared::Resolved(Err(wrap!(ErrorInt::StreamNotFound(format!(
                "stream {id}"
            )))));
        };
        if st.state.is_active() || st.state == StreamState::SessionResume {
            return Prepared::Resolved(Ok(()));
        }
        let interleave = s.force_interleave;
        let transport = if interleave {
            let Some(channel_id) = u8::try_from(id.0 * 2).ok().filter(|c| *c < u8::MAX) else {
                return Prepared::Resolved(Err(wrap!(ErrorInt::NotSupported(format!(
                    "interleaving stream {id}"
                )))));
            };
            format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                channel_id,
                channel_id + 1
            )
        } else {
            if st.transport.is_none() {
                let local_ip = match s.transport.ctx().peer_addr().ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                let binding = RtpBinding {
                    local_ip,
                    first_port: config.force_first_port,
                    exact_port: false,
                    multicast: config.force_multicast,
                };
                match connector.open_rtp(binding) {
                    Ok(t) => st.transport = Some(t),
                    Err(e) => return Prepared::Resolved(Err(e)),
                }
            }
            let port = u32::from(st.local_rtp_port().unwrap_or(0));
            match config.force_multicast {
                Some((group, ttl)) => format!(
                    "RTP/AVP;multicast;destination={};ttl={};port={}-{}",
                    group,
                    ttl,
                    port,
                    port + 1
                ),
                None => format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1),
            }
        };
        let uri = st.control.clone().unwrap_or_else(|| s.control.clone());
        let mut req = s.request(Method::Setup, &uri);
        req.insert_header(headers::TRANSPORT, transport);
        Prepared::Send {
            req,
            uri,
            interleave_requested: interleave,
            aggregate: false,
        }
    }

    fn prepare_play_pause(&mut self, s: &mut RtspSession, cmd: &Command) -> Prepared {
        if let Some(st) = cmd.stream.and_then(|id| self.streams.get_mut(id.0)) {
            if st.skip_next_command {
                trace!(
                    "stream {}: {} covered by aggregate control",
                    st.es_id,
                    method_str(&cmd.method)
                );
                st.skip_next_command = false;
                return Prepared::Resolved(Ok(()));
            }
        }
        if cmd.needs_session_id && s.session_id.is_none() {
            if matches!(cmd.command_kind(), Some(ChannelCommandKind::Stop)) {
                return Prepared::Resolved(Ok(()));
            }
            s.agg_control = false;
            if let Some(st) = cmd.stream.and_then(|id| self.streams.get_mut(id.0)) {
                st.state = StreamState::Disconnected;
                st.check_rtp_time = RtpTimeCheck::None;
            }
            return Prepared::Resolved(Err(wrap!(ErrorInt::FailedPrecondition(format!(
                "{} with no RTSP session",
                method_str(&cmd.method)
            )))));
        }
        let aggregate = cmd.control.is_none() || s.agg_control;
        if s.agg_control {
            for (i, other) in self.streams.iter_mut().enumerate() {
                if cmd.stream != Some(StreamId(i))
                    && other.controlled
                    && other.channel.is_some()
                    && other.state.is_active()
                {
                    other.skip_next_command = true;
                }
            }
        }
        let uri = match (&cmd.control, aggregate) {
            (Some(c), false) => c.clone(),
            _ => s.control.clone(),
        };
        let mut req = s.request(cmd.method.clone(), &uri);
        if let Some((start, end)) = cmd.range {
            req.insert_header(headers::RANGE, parse::format_npt_range(start, end));
        }
        Prepared::Send {
            req,
            uri,
            interleave_requested: false,
            aggregate,
        }
    }

    fn queue_keepalive(&mut self, s: &mut RtspSession, now: Instant) {
        if s.session_id.is_none() || !s.is_idle() {
            return;
        }
        if !self
            .streams
            .iter()
            .any(|st| st.controlled && st.state == StreamState::Running)
        {
            return;
        }
        if now.saturating_duration_since(s.last_activity) < s.session_timeout / 2 {
            return;
        }
        trace!("queueing {} keepalive", method_str(&s.keepalive_method));
        s.last_activity = now;
        s.queue
            .push(Command::new(s.keepalive_method.clone(), Origin::Internal));
    }

    fn queue_teardown_at_eos(&mut self, s: &mut RtspSession) {
        if s.teardown_queued || s.session_id.is_none() {
            return;
        }
        let mut running = self
            .streams
            .iter()
            .filter(|st| st.controlled && st.state == StreamState::Running && st.channel.is_some())
            .peekable();
        if running.peek().is_none() || !running.all(|st| st.eos_sent) {
            return;
        }
        info!("all streams ended; tearing down session");
        s.teardown_queued = true;
        s.queue
            .push(Command::new(Method::Teardown, Origin::Internal));
    }

    fn send_interleaved_reports(&mut self, s: &mut RtspSession, now: Instant) {
        for st in &mut self.streams {
            let Some(channel_id) = st.interleaved else {
                continue;
            };
            if let Some(rr) = st.receiver_report(now, &self.config) {
                if let Err(e) = s.transport.send_data(channel_id | 1, rr) {
                    debug!("unable to send receiver report: {}", e);
                }
            }
        }
    }
}
