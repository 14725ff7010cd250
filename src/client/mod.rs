// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session manager: turns a URL into streams and drives them.
//!
//! A [`SessionManager`] owns at most one RTSP session plus any number of
//! streams, and a background tokio task which performs all transport I/O.
//! Host calls only mutate state and queue commands; results come back
//! through the [`HostService`] callbacks, which are always invoked with the
//! manager's lock released.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use log::{debug, info, warn};
use rtsp_types::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use crate::codec::descriptor::ObjectDescriptor;
use crate::codec::{oti, DecoderConfig, StreamType};
use crate::config::{ClientConfig, MediaFilter};
use crate::error::ErrorInt;
use crate::{ConnectionContext, Error};

mod channel_mapping;
mod host;
mod migration;
mod parse;
mod rtp;
mod sdp;
mod session;
mod stream;
mod timeline;
pub mod transport;

pub use host::{ChannelCommand, ChannelCommandKind, ChannelHandle, HostService, SlStatus};
pub use stream::NetStats;

use host::HostEvent;
use migration::{Checkpoint, StreamCheckpoint};
use sdp::{parse_description, Description, DescriptorInput};
use session::{Command, Origin, RtspSession};
use stream::{RtpAnchor, RtpStream, StreamId, StreamState};
use transport::{Connector, RtpBinding};

/// How [`SessionManager::connect`] got on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The session is being described; [`HostService::on_connect`] reports
    /// the result.
    Pending,

    /// Streams are ready for channels to connect.
    Ready,

    /// A saved session was resumed in place of connecting.
    Resumed,
}

/// How a channel's URL picks its stream.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ChannelTarget {
    EsId(u16),
    Url(Url),

    /// A control string, possibly relative.
    Control(String),
}

impl ChannelTarget {
    fn parse(url: &str) -> Self {
        if let Some((_, id)) = url.split_once("ES_ID=") {
            if let Ok(id) = id.trim().parse::<u16>() {
                return ChannelTarget::EsId(id);
            }
        }
        match Url::parse(url) {
            Ok(u) => ChannelTarget::Url(u),
            Err(_) => ChannelTarget::Control(url.trim_start_matches('/').to_owned()),
        }
    }
}

/// Where [`SessionManager::connect`] gets its description.
enum Source {
    Rtsp(Url),
    Description(Bytes, Option<Url>),
    Fetch(Url),
    Embedded(RtpStream),
}

fn url_error(description: String) -> Error {
    wrap!(ErrorInt::UrlError(description))
}

fn read_description_file(path: &std::path::Path) -> Result<Source, Error> {
    let raw = std::fs::read(path)
        .map_err(|e| url_error(format!("unable to read {}: {}", path.display(), e)))?;
    Ok(Source::Description(Bytes::from(raw), None))
}

/// Parses the part of a `data:` URL after the scheme.
fn parse_data_url(rest: &str) -> Result<Source, Error> {
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| url_error(format!("data URL without payload: {rest:?}")))?;
    let mut params = meta.split(';');
    let mime = params.next().unwrap_or_default().to_ascii_lowercase();
    let mut base64 = false;
    let mut es_id = 1;
    for p in params {
        if p.eq_ignore_ascii_case("base64") {
            base64 = true;
        } else if let Some(id) = p.strip_prefix("ES_ID=") {
            es_id = id
                .parse::<u16>()
                .map_err(|_| url_error(format!("bad ES_ID in data URL: {id:?}")))?;
        }
    }
    let data = if base64 {
        Bytes::from(
            base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|e| url_error(format!("bad base64 in data URL: {e}")))?,
        )
    } else {
        Bytes::copy_from_slice(payload.as_bytes())
    };
    let (stream_type, object_type_indication) = match mime.as_str() {
        "application/sdp" => return Ok(Source::Description(data, None)),
        "application/mpeg4-od-au" => (StreamType::OBJECT_DESCRIPTOR, 0x01),
        "application/mpeg4-bifs-au" => (StreamType::SCENE, 0x02),
        "application/mpeg4-es-au" => (StreamType(0x20), oti::PRIVATE),
        _ => bail!(ErrorInt::NotSupported(format!("data URL of type {mime:?}"))),
    };
    let decoder_config = DecoderConfig {
        stream_type,
        object_type_indication,
        decoder_specific_info: None,
    };
    Ok(Source::Embedded(RtpStream::embedded(
        es_id,
        "application",
        decoder_config,
        data,
    )))
}

fn classify(url: &str) -> Result<Source, Error> {
    if let Some(rest) = url.strip_prefix("data:") {
        return parse_data_url(rest);
    }
    match Url::parse(url) {
        Ok(u) => match u.scheme() {
            "rtsp" | "rtspu" | "satip" => Ok(Source::Rtsp(u)),
            "file" => {
                let path = u
                    .to_file_path()
                    .map_err(|()| url_error(format!("bad file URL {url:?}")))?;
                read_description_file(&path)
            }
            "http" | "https" | "rtp" => Ok(Source::Fetch(u)),
            s => bail!(ErrorInt::NotSupported(format!("{s}:// URLs"))),
        },
        Err(url::ParseError::RelativeUrlWithoutBase)
            if url.to_ascii_lowercase().ends_with(".sdp") =>
        {
            read_description_file(std::path::Path::new(url))
        }
        Err(e) => Err(url_error(format!("{url:?}: {e}"))),
    }
}

/// Splits off a `#audio` or `#video` fragment.
fn split_media_fragment(url: &str) -> (&str, Option<MediaFilter>) {
    if let Some((base, fragment)) = url.rsplit_once('#') {
        if let Ok(f) = fragment.parse::<MediaFilter>() {
            return (base, Some(f));
        }
    }
    (url, None)
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// State protected by the manager lock.
pub(crate) struct Inner {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,

    /// Where the service was connected.
    url: Option<Url>,
    sdp: Option<sdp_types::Session>,

    /// Base for the description's relative controls.
    base_url: Option<Url>,
    iod: Option<Bytes>,
    isma: bool,
    media_filter: Option<MediaFilter>,
    session: Option<RtspSession>,
    streams: Vec<RtpStream>,

    /// Callbacks to dispatch once the lock is released.
    events: Vec<HostEvent>,
    service_connect_reported: bool,
    disconnect_reported: bool,

    /// Interleaved reads are paused until the host drains its buffers.
    throttled: bool,
}

impl Inner {
    fn new(config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Self {
        Inner {
            media_filter: config.media_filter,
            config,
            connector,
            url: None,
            sdp: None,
            base_url: None,
            iod: None,
            isma: false,
            session: None,
            streams: Vec::new(),
            events: Vec::new(),
            service_connect_reported: false,
            disconnect_reported: false,
            throttled: false,
        }
    }

    fn report_service_connect(&mut self, result: Result<(), Error>) {
        if self.service_connect_reported {
            return;
        }
        self.service_connect_reported = true;
        self.events.push(HostEvent::Connect(None, result));
    }

    fn report_disconnect(&mut self, result: Result<(), Error>) {
        if self.disconnect_reported {
            return;
        }
        self.disconnect_reported = true;
        self.events.push(HostEvent::Disconnect(result));
    }

    /// Creates streams for a parsed description.
    pub(crate) fn install_description(
        &mut self,
        desc: Description,
        controlled: bool,
    ) -> Result<(), Error> {
        let Description {
            sdp,
            base_url,
            iod,
            isma,
            streams,
            ..
        } = desc;
        let streams = streams
            .into_iter()
            .map(|d| RtpStream::from_description(d, controlled))
            .collect::<Result<Vec<_>, Error>>()?;
        info!(
            "described {} stream(s){}",
            streams.len(),
            if iod.is_some() { " with IOD" } else { "" }
        );
        self.streams.extend(streams);
        self.sdp = Some(sdp);
        self.base_url = base_url;
        self.iod = iod;
        self.isma = isma;
        Ok(())
    }

    fn stream_by_channel(&self, channel: ChannelHandle) -> Option<usize> {
        self.streams.iter().position(|s| s.channel == Some(channel))
    }

    /// Finds the stream `target` names which isn't bound to another channel.
    pub(crate) fn find_target(&self, target: &ChannelTarget, channel: ChannelHandle) -> Option<usize> {
        let free = |s: &RtpStream| s.channel.map_or(true, |c| c == channel);
        match target {
            ChannelTarget::EsId(id) => self
                .streams
                .iter()
                .position(|s| s.es_id == *id && free(s)),
            ChannelTarget::Url(u) => self
                .streams
                .iter()
                .position(|s| free(s) && s.control.as_ref() == Some(u))
                .or_else(|| {
                    // The service URL itself: take the first stream left.
                    let mut bare = u.clone();
                    bare.set_fragment(None);
                    if self.url.as_ref() == Some(&bare) || self.base_url.as_ref() == Some(&bare) {
                        self.streams.iter().position(|s| free(s) && s.channel.is_none())
                    } else {
                        None
                    }
                }),
            ChannelTarget::Control(c) => self.streams.iter().position(|s| {
                free(s)
                    && s.control
                        .as_ref()
                        .map_or(false, |u| u.as_str().ends_with(c.as_str()))
            }),
        }
    }

    fn interleaved_channels(&self) -> Vec<ChannelHandle> {
        self.streams
            .iter()
            .filter(|s| s.is_interleaved() && s.state == StreamState::Running)
            .filter_map(|s| s.channel)
            .collect()
    }

    /// One tick of the background task.
    fn poll(&mut self, now: Instant, occupancy: Option<Duration>) {
        match occupancy {
            Some(o) if o >= self.config.buffer_length => {
                if !self.throttled {
                    debug!("host buffer full ({:?}); pausing interleaved reads", o);
                }
                self.throttled = true;
            }
            Some(o) if o.saturating_add(self.config.rebuffer_length) < self.config.buffer_length => {
                self.throttled = false
            }
            Some(_) => {}
            None => self.throttled = false,
        }
        let conn_ctx = self
            .session
            .as_ref()
            .map_or_else(ConnectionContext::dummy, RtspSession::ctx);
        for (i, s) in self.streams.iter_mut().enumerate() {
            s.poll_udp(StreamId(i), &conn_ctx, now, &self.config, &mut self.events);
            s.deliver_embedded(&mut self.events);
        }
        self.drive_session(now, !self.throttled);
    }

    fn connect_channel(&mut self, channel: ChannelHandle, url: &str) {
        if self.stream_by_channel(channel).is_some() {
            self.events.push(HostEvent::Connect(Some(channel), Ok(())));
            return;
        }
        if let Some(rest) = url.strip_prefix("data:") {
            let r = match parse_data_url(rest) {
                Ok(Source::Embedded(mut s)) => {
                    s.channel = Some(channel);
                    self.streams.push(s);
                    Ok(())
                }
                Ok(_) => Err(wrap!(ErrorInt::NotSupported(
                    "session description as a channel".to_owned()
                ))),
                Err(e) => Err(e),
            };
            self.events.push(HostEvent::Connect(Some(channel), r));
            return;
        }
        let target = ChannelTarget::parse(url);
        if let Some(s) = &self.session {
            let mut cmd = Command::new(Method::Describe, Origin::Connect(Some(channel)));
            cmd.target = Some(target);
            s.queue.push(cmd);
            return;
        }
        let r = match self.find_target(&target, channel) {
            Some(i) => self.open_direct(i, channel),
            None => Err(wrap!(ErrorInt::StreamNotFound(format!(
                "no stream matches {url:?}"
            )))),
        };
        self.events.push(HostEvent::Connect(Some(channel), r));
    }

    /// Binds a stream received without RTSP (multicast or fixed unicast RTP).
    fn open_direct(&mut self, i: usize, channel: ChannelHandle) -> Result<(), Error> {
        let s = &mut self.streams[i];
        s.channel = Some(channel);
        if s.embedded.is_some() || s.transport.is_some() {
            return Ok(());
        }
        let multicast = s
            .address
            .filter(IpAddr::is_multicast)
            .map(|a| (a, s.multicast_ttl.unwrap_or(sdp::DEFAULT_MULTICAST_TTL)));
        let binding = RtpBinding {
            local_ip: unspecified_like(s.address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))),
            first_port: (s.sdp_port != 0).then_some(s.sdp_port),
            exact_port: s.sdp_port != 0,
            multicast,
        };
        s.transport = Some(self.connector.open_rtp(binding)?);
        Ok(())
    }

    fn disconnect_channel(&mut self, channel: ChannelHandle) -> Result<(), Error> {
        let Some(i) = self.stream_by_channel(channel) else {
            bail!(ErrorInt::StreamNotFound(format!("channel {channel:?}")));
        };
        let s = &mut self.streams[i];
        s.channel = None;
        s.halt();
        if !s.controlled {
            s.transport = None;
        }
        Ok(())
    }

    fn command(&mut self, command: ChannelCommand) {
        let Some(i) = self.stream_by_channel(command.channel) else {
            let e = wrap!(ErrorInt::StreamNotFound(format!(
                "channel {:?}",
                command.channel
            )));
            self.events.push(HostEvent::Command(command, Err(e)));
            return;
        };
        if !self.streams[i].controlled || self.session.is_none() {
            self.local_command(i, command);
            return;
        }
        match command.kind {
            ChannelCommandKind::Play { start, end } => {
                self.queue_play(i, command, Some((start, end)))
            }
            ChannelCommandKind::Resume => self.queue_play(i, command, None),
            ChannelCommandKind::Pause => self.queue_pause(i, command),
            ChannelCommandKind::Stop => self.queue_stop(i, command),
        }
    }

    /// Applies a command to a stream with no RTSP session behind it.
    fn local_command(&mut self, i: usize, command: ChannelCommand) {
        let s = &mut self.streams[i];
        match command.kind {
            ChannelCommandKind::Play { start, .. } => {
                s.current_start = s.range_start + start;
                s.start_unanchored();
            }
            ChannelCommandKind::Resume => s.start_unanchored(),
            ChannelCommandKind::Pause => {
                if !s.paused {
                    s.current_start += s.transport_time();
                }
                s.halt();
                s.paused = true;
            }
            ChannelCommandKind::Stop => {
                s.halt();
                s.current_start = 0.0;
            }
        }
        self.events.push(HostEvent::Command(command, Ok(())));
    }

    /// Queues a `PLAY` from `play` (start and end relative to the signaled
    /// range) or, if `None`, from where the stream paused.
    fn queue_play(&mut self, i: usize, command: ChannelCommand, play: Option<(f64, Option<f64>)>) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };

        // Streams which failed a PLAY or PAUSE are set up again first.
        let agg_control = sess.agg_control;
        for (j, s) in self.streams.iter_mut().enumerate() {
            if s.controlled
                && s.state == StreamState::Disconnected
                && (j == i || (agg_control && s.channel.is_some()))
            {
                s.state = StreamState::Setup;
                sess.queue.push(
                    Command::new(Method::Setup, Origin::Setup(None))
                        .for_stream(StreamId(j), s.control.clone()),
                );
            }
        }

        let any_running = self
            .streams
            .iter()
            .any(|s| s.controlled && s.state == StreamState::Running);
        let s = &mut self.streams[i];
        let range = if s.state == StreamState::SessionResume {
            s.state = StreamState::Connected;
            self.config.migration.pause.then_some((s.current_start, None))
        } else if let Some((start, end)) = play {
            let start = s.range_start + start;
            let end = match end {
                Some(e) if s.has_range => Some((s.range_start + e).min(s.range_end)),
                Some(e) => Some(s.range_start + e),
                None => s.has_range.then_some(s.range_end),
            };
            if s.skip_next_command {
                s.current_start = sess.last_range;
            } else {
                sess.last_range = start;
                s.current_start = start;
            }
            s.has_range.then_some((start, end))
        } else {
            Some((s.current_start, None))
        };
        let control = if sess.agg_control || !any_running {
            None
        } else {
            s.control.clone()
        };
        sess.queue.push(
            Command::new(Method::Play, Origin::Channel(command))
                .for_stream(StreamId(i), control)
                .with_range(range),
        );
    }

    fn queue_pause(&mut self, i: usize, command: ChannelCommand) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let s = &mut self.streams[i];
        if s.paused {
            self.events.push(HostEvent::Command(command, Ok(())));
            return;
        }
        s.current_start += s.transport_time();
        let control = if sess.agg_control {
            None
        } else {
            s.control.clone()
        };
        sess.queue.push(
            Command::new(Method::Pause, Origin::Channel(command))
                .for_stream(StreamId(i), control)
                .with_range(Some((s.current_start, None))),
        );
    }

    fn queue_stop(&mut self, i: usize, command: ChannelCommand) {
        if self.config.migration.enabled {
            // The session stays up for whoever resumes it.
            debug!("stop on stream {} ignored; session will migrate", i);
            self.events.push(HostEvent::Command(command, Ok(())));
            return;
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let others_running = self.streams.iter().enumerate().any(|(j, s)| {
            j != i && s.controlled && s.channel.is_some() && s.state == StreamState::Running
        });
        let s = &mut self.streams[i];
        s.current_start = 0.0;
        if sess.agg_only {
            s.halt();
            if others_running {
                self.events.push(HostEvent::Command(command, Ok(())));
            } else {
                sess.queue
                    .push(Command::new(Method::Teardown, Origin::Channel(command)));
            }
            return;
        }
        if s.paused {
            self.events.push(HostEvent::Command(command, Ok(())));
            return;
        }
        let control = if sess.agg_control {
            None
        } else {
            s.control.clone()
        };
        sess.queue.push(
            Command::new(Method::Pause, Origin::Channel(command))
                .for_stream(StreamId(i), control)
                .with_range(Some((0.0, None))),
        );
    }

    /// Queues a session-level command, returning false if there's no session.
    fn queue_session_command(&mut self, method: Method) -> bool {
        match &self.session {
            Some(s) if s.session_id.is_some() => {
                s.queue.push(Command::new(method, Origin::Internal));
                true
            }
            _ => false,
        }
    }

    fn descriptor_inputs(&self) -> impl Iterator<Item = DescriptorInput<'_>> {
        self.streams.iter().map(|s| DescriptorInput {
            es_id: s.es_id,
            media: &s.media,
            clock_rate: s.clock_rate,
            decoder_config: &s.decoder_config,
        })
    }

    fn checkpoint(&self) -> Result<Bytes, Error> {
        let (Some(sdp), Some(sess)) = (&self.sdp, &self.session) else {
            bail!(ErrorInt::FailedPrecondition(
                "no RTSP session to save".to_owned()
            ));
        };
        let Some(session_id) = &sess.session_id else {
            bail!(ErrorInt::FailedPrecondition(
                "RTSP session isn't set up".to_owned()
            ));
        };
        let streams = self
            .streams
            .iter()
            .filter(|s| {
                s.controlled && (s.state.is_active() || s.state == StreamState::SessionResume)
            })
            .filter_map(|s| {
                let media_index = s.media_index?;
                let (seq, rtptime) = s.last_rtp_position();
                Some((
                    media_index,
                    StreamCheckpoint {
                        client_port: s.local_rtp_port().unwrap_or(s.sdp_port),
                        server_port: s.server_port,
                        ssrc: s.ssrc().or(s.anchor.ssrc),
                        npt: s.npt(),
                        seq: seq.map(|q| q.wrapping_add(1)).or(s.anchor.seq).unwrap_or(0),
                        rtptime: rtptime.or(s.anchor.rtptime).unwrap_or(0),
                    },
                ))
            })
            .collect();
        let session_url = self.base_url.clone().unwrap_or_else(|| sess.url.clone());
        let cp = Checkpoint {
            session_id: session_id.to_string(),
            session_url,
            streams,
        };
        migration::save(sdp, &cp).map_err(|d| wrap!(ErrorInt::Internal(d.into())))
    }

    /// Rebinds a checkpoint's streams to the server session they were set up in.
    fn resume(
        &mut self,
        mut sess: RtspSession,
        desc: Description,
        session_id: &str,
    ) -> Result<(), Error> {
        sess.control = desc.control.clone().unwrap_or_else(|| sess.url.clone());
        sess.force_interleave = desc.force_interleave;
        let first = self.streams.len();
        self.install_description(desc, true)?;
        let peer = sess.ctx().peer_addr().ip();
        let mut channels = Vec::new();
        for (i, s) in self.streams.iter_mut().enumerate().skip(first) {
            let Some(cp) = s.checkpoint.clone() else {
                continue;
            };
            match cp.server_port {
                Some((rtp_port, _)) => {
                    let mut t = self.connector.open_rtp(RtpBinding {
                        local_ip: unspecified_like(peer),
                        first_port: Some(cp.client_port),
                        exact_port: true,
                        multicast: None,
                    })?;
                    t.set_peer(SocketAddr::new(peer, rtp_port));
                    s.transport = Some(t);
                }
                None => {
                    let channel_id = u8::try_from(2 * i).map_err(|_| {
                        wrap!(ErrorInt::NotSupported(format!("interleaving stream {i}")))
                    })?;
                    s.interleaved = Some(channel_id);
                    channels.push((channel_id, i));
                }
            }
            s.set_ssrc(cp.ssrc);
            s.anchor = RtpAnchor {
                seq: Some(cp.seq),
                rtptime: Some(cp.rtptime),
                ssrc: cp.ssrc,
            };
        }
        sess.adopt(session_id, &channels);
        self.url = Some(sess.url.clone());
        self.session = Some(sess);
        Ok(())
    }
}

/// State shared with the background task.
struct Shared {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    host: Arc<dyn HostService>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the lock, then dispatches the callbacks it queued.
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (r, events) = {
            let mut inner = self.lock();
            let r = f(&mut inner);
            (r, std::mem::take(&mut inner.events))
        };
        for e in events {
            e.dispatch(&*self.host);
        }
        r
    }

    fn tick(&self) {
        // Ask the host about its buffers without holding the lock, as it
        // may call back in.
        let channels = self.lock().interleaved_channels();
        let occupancy = channels
            .into_iter()
            .filter_map(|c| self.host.buffer_occupancy(c))
            .max();
        self.with_inner(|inner| inner.poll(Instant::now(), occupancy));
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(shared.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => shared.tick(),
            r = stop.changed() => {
                if r.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!("background task stopped");
}

enum TaskState {
    Idle,
    Running {
        stop: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Connects to a media service and delivers its streams to a host.
///
/// Must be used from within a tokio runtime, which runs the background task.
pub struct SessionManager {
    shared: Arc<Shared>,
    task: Mutex<TaskState>,
}

impl SessionManager {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        host: Arc<dyn HostService>,
    ) -> Self {
        let config = Arc::new(config);
        SessionManager {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::new(config.clone(), connector.clone())),
                config,
                connector,
                host,
            }),
            task: Mutex::new(TaskState::Idle),
        }
    }

    /// Connects the service at `url`.
    ///
    /// Accepts `rtsp://`, `rtspu://` and `satip://` URLs, session descriptions by
    /// `file://` URL, `.sdp` path, `http://` URL or `data:` URL, and
    /// single-AU `data:` URLs. A `#audio` or `#video` fragment restricts
    /// which streams are used. [`HostService::on_connect`] is called once
    /// with the service-level result, possibly before this returns.
    pub async fn connect(&self, url: &str) -> Result<ConnectOutcome, Error> {
        let r = self.start(url).await;
        match &r {
            Ok(ConnectOutcome::Pending) => {}
            Ok(_) => self
                .shared
                .with_inner(|inner| inner.report_service_connect(Ok(()))),
            Err(e) => {
                let e = e.clone();
                self.shared
                    .with_inner(|inner| inner.report_service_connect(Err(e)))
            }
        }
        if r.is_ok() {
            self.ensure_task();
        }
        r
    }

    async fn start(&self, url: &str) -> Result<ConnectOutcome, Error> {
        {
            let inner = self.shared.lock();
            if inner.url.is_some() || !inner.streams.is_empty() {
                bail!(ErrorInt::FailedPrecondition("already connected".to_owned()));
            }
        }
        let migration = &self.shared.config.migration;
        if let (true, Some(file)) = (migration.enabled, &migration.file) {
            if let Some(saved) = self.read_checkpoint(file).await? {
                info!("resuming session saved in {}", file);
                return self.load_state(saved).await;
            }
        }
        let (url, filter) = split_media_fragment(url);
        if filter.is_some() {
            self.shared.lock().media_filter = filter;
        }
        match classify(url)? {
            Source::Rtsp(u) => self.connect_rtsp(u).await,
            Source::Description(raw, base) => self.bind_description(raw, base).await,
            Source::Fetch(u) => {
                let raw = self.shared.connector.fetch(&u).await?;
                let base = matches!(u.scheme(), "http" | "https").then_some(u);
                self.bind_description(raw, base).await
            }
            Source::Embedded(s) => {
                self.shared.lock().streams.push(s);
                Ok(ConnectOutcome::Ready)
            }
        }
    }

    async fn read_checkpoint(&self, location: &str) -> Result<Option<Bytes>, Error> {
        if !is_remote(location) {
            return migration::read(location);
        }
        let url = Url::parse(location).map_err(|e| url_error(format!("{location:?}: {e}")))?;
        match self.shared.connector.fetch(&url).await {
            Ok(d) => Ok(Some(d)),
            Err(e) => {
                debug!("no saved session at {}: {}", location, e);
                Ok(None)
            }
        }
    }

    fn with_default_port(&self, mut url: Url) -> Result<Url, Error> {
        if url.scheme() == "satip" && url.set_scheme("rtsp").is_err() {
            bail!(ErrorInt::UrlError(format!("can't use {url} as rtsp")));
        }
        if url.port().is_none() && url.set_port(Some(self.shared.config.default_port)).is_err() {
            bail!(ErrorInt::UrlError(format!("can't set port on {url}")));
        }
        Ok(url)
    }

    async fn connect_rtsp(&self, url: Url) -> Result<ConnectOutcome, Error> {
        let url = self.with_default_port(url)?;
        let transport = self.shared.connector.connect_rtsp(&url).await?;
        self.shared.with_inner(|inner| {
            let sess = RtspSession::new(transport, url.clone(), Instant::now());
            sess.queue
                .push(Command::new(Method::Describe, Origin::Connect(None)));
            inner.url = Some(url);
            inner.session = Some(sess);
        });
        Ok(ConnectOutcome::Pending)
    }

    /// Creates streams from a description obtained without RTSP. If its
    /// control is an RTSP URL, that session is set up without `DESCRIBE`.
    async fn bind_description(&self, raw: Bytes, base: Option<Url>) -> Result<ConnectOutcome, Error> {
        let desc = {
            let inner = self.shared.lock();
            parse_description(&raw, base.as_ref(), &self.shared.config, inner.media_filter)?
        };
        if let Some((session_id, session_url)) = desc.resume.clone() {
            return self.resume(desc, &session_id, session_url).await;
        }
        let control = desc
            .control
            .clone()
            .filter(|u| matches!(u.scheme(), "rtsp" | "rtspu" | "satip"));
        let Some(control) = control else {
            self.shared
                .with_inner(|inner| inner.install_description(desc, false))?;
            return Ok(ConnectOutcome::Ready);
        };
        let url = self.with_default_port(control)?;
        let transport = self.shared.connector.connect_rtsp(&url).await?;
        self.shared.with_inner(|inner| {
            let mut sess = RtspSession::new(transport, url.clone(), Instant::now());
            sess.force_interleave = desc.force_interleave;
            inner.install_description(desc, true)?;
            inner.url = Some(url);
            inner.session = Some(sess);
            Ok::<_, Error>(())
        })?;
        Ok(ConnectOutcome::Ready)
    }

    /// Restores a session saved by [`SessionManager::save_state`].
    pub async fn load_state(&self, saved: Bytes) -> Result<ConnectOutcome, Error> {
        let desc = {
            let inner = self.shared.lock();
            parse_description(&saved, None, &self.shared.config, inner.media_filter)?
        };
        let Some((session_id, session_url)) = desc.resume.clone() else {
            bail!(ErrorInt::SdpError(
                "saved session has no session id or URL".to_owned()
            ));
        };
        self.resume(desc, &session_id, session_url).await
    }

    async fn resume(
        &self,
        desc: Description,
        session_id: &str,
        session_url: Url,
    ) -> Result<ConnectOutcome, Error> {
        let url = self.with_default_port(session_url)?;
        let transport = self.shared.connector.connect_rtsp(&url).await?;
        self.shared.with_inner(|inner| {
            let sess = RtspSession::new(transport, url, Instant::now());
            inner.resume(sess, desc, session_id)
        })?;
        Ok(ConnectOutcome::Resumed)
    }

    fn ensure_task(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*task, TaskState::Idle) {
            return;
        }
        let (stop, rx) = watch::channel(false);
        let handle = tokio::spawn(run(self.shared.clone(), rx));
        *task = TaskState::Running { stop, handle };
    }

    async fn stop_task(&self) {
        let state = std::mem::replace(
            &mut *self.task.lock().unwrap_or_else(PoisonError::into_inner),
            TaskState::Stopped,
        );
        if let TaskState::Running { stop, handle } = state {
            if stop.send(true).is_err() {
                debug!("background task already gone");
            }
            if let Err(e) = handle.await {
                warn!("background task failed: {}", e);
            }
        }
    }

    /// Connects a host channel to the stream `url` names: a stream control
    /// URL, `ES_ID=n`, the service URL (for the next unbound stream), or an
    /// embedded-AU `data:` URL. The result comes through
    /// [`HostService::on_connect`].
    pub fn connect_channel(&self, channel: ChannelHandle, url: &str) {
        self.shared
            .with_inner(|inner| inner.connect_channel(channel, url));
    }

    pub fn disconnect_channel(&self, channel: ChannelHandle) -> Result<(), Error> {
        self.shared
            .with_inner(|inner| inner.disconnect_channel(channel))
    }

    /// Plays, pauses, resumes or stops a channel. The result comes through
    /// [`HostService::on_command`].
    pub fn command(&self, command: ChannelCommand) {
        self.shared.with_inner(|inner| inner.command(command));
    }

    pub fn stats(&self, channel: ChannelHandle) -> Option<NetStats> {
        let inner = self.shared.lock();
        let i = inner.stream_by_channel(channel)?;
        Some(inner.streams[i].stats(Instant::now()))
    }

    pub fn decoder_config(&self, channel: ChannelHandle) -> Option<DecoderConfig> {
        let inner = self.shared.lock();
        let i = inner.stream_by_channel(channel)?;
        Some(inner.streams[i].decoder_config.clone())
    }

    pub fn decoder_specific_info(&self, channel: ChannelHandle) -> Option<Bytes> {
        let inner = self.shared.lock();
        let i = inner.stream_by_channel(channel)?;
        inner.streams[i].decoder_specific_info()
    }

    /// The initial object descriptor given by the service, if any.
    pub fn iod(&self) -> Option<Bytes> {
        self.shared.lock().iod.clone()
    }

    /// True if the service declared ISMA compliance.
    pub fn is_isma(&self) -> bool {
        self.shared.lock().isma
    }

    /// One object descriptor per stream, for services without an IOD.
    pub fn object_descriptors(&self) -> Vec<ObjectDescriptor> {
        sdp::object_descriptors(self.shared.lock().descriptor_inputs())
    }

    /// An IOD for playing just the first stream of `media` type.
    pub fn emulate_iod(&self, media: Option<MediaFilter>) -> Option<Bytes> {
        sdp::emulate_iod(self.shared.lock().descriptor_inputs(), media)
    }

    /// Serializes the session so it can be resumed with [`Self::load_state`].
    pub fn save_state(&self) -> Result<Bytes, Error> {
        self.shared.lock().checkpoint()
    }

    /// Waits up to `timeout` for queued commands to finish.
    async fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            self.shared.tick();
            let idle = self
                .shared
                .lock()
                .session
                .as_ref()
                .map_or(true, RtspSession::is_idle);
            if idle || Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(self.shared.config.poll_interval).await;
        }
    }

    async fn migrate_out(&self) -> Result<(), Error> {
        let config = &self.shared.config.migration;
        let data = self.save_state()?;
        if let Some(file) = &config.file {
            if is_remote(file) {
                let url = Url::parse(file).map_err(|e| url_error(format!("{file:?}: {e}")))?;
                self.shared.connector.post(&url, data.clone()).await?;
            } else {
                migration::write(file, &data)?;
            }
        }
        if let Some(server) = &config.server {
            let url = Url::parse(server).map_err(|e| url_error(format!("{server:?}: {e}")))?;
            if let Err(e) = self.shared.connector.post(&url, data).await {
                warn!("unable to post session to {}: {}", server, e);
            }
        }
        if config.pause
            && self
                .shared
                .with_inner(|inner| inner.queue_session_command(Method::Pause))
        {
            self.drain(self.shared.config.close_drain_timeout).await;
        }
        info!("session saved for migration");
        Ok(())
    }

    /// Closes the service: saves it for migration or tears it down, stops
    /// the background task, and reports [`HostService::on_disconnect`].
    pub async fn close(&self) -> Result<(), Error> {
        let config = self.shared.config.clone();
        self.drain(config.close_drain_timeout).await;
        let migrate = config.migration.enabled
            && self
                .shared
                .lock()
                .session
                .as_ref()
                .map_or(false, |s| s.session_id.is_some());
        let result = if migrate {
            self.migrate_out().await
        } else {
            if self
                .shared
                .with_inner(|inner| inner.queue_session_command(Method::Teardown))
            {
                self.drain(config.close_drain_timeout).await;
            }
            match config.migration.file.as_deref() {
                Some(f) if !is_remote(f) => migration::remove(f),
                _ => Ok(()),
            }
        };
        self.stop_task().await;
        let r = result.clone();
        self.shared.with_inner(|inner| {
            inner.session = None;
            inner.streams.clear();
            inner.report_disconnect(r);
        });
        result
    }

    #[cfg(test)]
    fn tick(&self) {
        self.shared.tick();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let TaskState::Running { stop, .. } =
            &*self.task.lock().unwrap_or_else(PoisonError::into_inner)
        {
            // The task exits on its own once it sees this or the sender drop.
            let _ = stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use rtsp_types::{headers, Request};

    use super::*;
    use crate::config::{MigrationConfig, TransportMode};
    use crate::rtp::Header;
    use crate::testutil::{
        init_logging, interleaved, reply, MockConnector, MockServer, Recorded, RecordingHost,
        Responder,
    };
    use crate::{ErrorKind, ReceivedMessage};

    const SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 192.168.5.111\r\n\
        s=Media Presentation\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        a=range:npt=0-10\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 profile-level-id=4d0029;packetization-mode=1;\
        sprop-parameter-sets=Z00AKeKQDwBE/LgLcBAQGkHiRFQ=,aO48gA==\r\n\
        a=control:trackID=1\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 AMR/8000\r\n\
        a=fmtp:97 octet-align=1\r\n\
        a=control:trackID=2\r\n";

    pub(super) const SESSION: &str = "12345678;timeout=60";

    /// How a camera serving [`SDP`] answers `req`.
    pub(super) fn camera(req: &Request<Bytes>) -> ReceivedMessage {
        let transport = req
            .header(&headers::TRANSPORT)
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default();
        match req.method() {
            Method::Describe => reply(
                req,
                200,
                &[
                    ("Content-Base", "rtsp://cam/stream/"),
                    ("Content-Type", "application/sdp"),
                ],
                SDP,
            ),
            Method::Setup => reply(
                req,
                200,
                &[("Session", SESSION), ("Transport", transport.as_str())],
                "",
            ),
            Method::Play => reply(
                req,
                200,
                &[
                    ("Session", SESSION),
                    (
                        "RTP-Info",
                        "url=rtsp://cam/stream/trackID=1;seq=1;rtptime=0,\
                         url=rtsp://cam/stream/trackID=2;seq=1;rtptime=0",
                    ),
                ],
                "",
            ),
            _ => reply(req, 200, &[("Session", SESSION)], ""),
        }
    }

    pub(super) struct Harness {
        pub(super) mgr: SessionManager,
        pub(super) server: Arc<Mutex<MockServer>>,
        pub(super) host: Arc<RecordingHost>,
    }

    impl Harness {
        /// A harness whose camera answers everything, optionally except `PLAY`.
        fn new(config: ClientConfig, answer_play: bool) -> Self {
            Self::with_responder(
                config,
                Box::new(move |req: &Request<Bytes>| match req.method() {
                    Method::Play if !answer_play => None,
                    _ => Some(camera(req)),
                }),
            )
        }

        pub(super) fn with_responder(config: ClientConfig, responder: Responder) -> Self {
            let server = MockServer::new(responder);
            let host = Arc::new(RecordingHost::default());
            let mgr = SessionManager::new(
                config,
                Arc::new(MockConnector(server.clone())),
                host.clone(),
            );
            Harness { mgr, server, host }
        }

        pub(super) fn ticks(&self, n: usize) {
            for _ in 0..n {
                self.mgr.tick();
            }
        }

        pub(super) fn sent(&self) -> Vec<Method> {
            self.server.lock().unwrap().methods()
        }

        /// Request URIs of the requests sent so far.
        pub(super) fn uris(&self) -> Vec<String> {
            self.server
                .lock()
                .unwrap()
                .sent
                .iter()
                .map(|r| r.request_uri().map_or_else(String::new, |u| u.to_string()))
                .collect()
        }

        pub(super) fn play(&self, channel: u64) -> ChannelCommand {
            let c = ChannelCommand {
                channel: ChannelHandle(channel),
                kind: ChannelCommandKind::Play {
                    start: 0.0,
                    end: None,
                },
            };
            self.mgr.command(c.clone());
            c
        }

        /// Connects the service and both channels over TCP.
        pub(super) async fn connect_both(&self) {
            assert_eq!(
                self.mgr.connect("rtsp://cam/stream").await.unwrap(),
                ConnectOutcome::Pending
            );
            self.ticks(3);
            assert_eq!(self.host.take(), vec![Recorded::Connect(None, Ok(()))]);
            self.mgr
                .connect_channel(ChannelHandle(1), "rtsp://cam/stream/trackID=1");
            self.mgr.connect_channel(ChannelHandle(2), "ES_ID=2");
            self.ticks(6);
            assert_eq!(
                self.host.take(),
                vec![
                    Recorded::Connect(Some(ChannelHandle(1)), Ok(())),
                    Recorded::Connect(Some(ChannelHandle(2)), Ok(())),
                ]
            );
        }
    }

    pub(super) fn tcp() -> ClientConfig {
        ClientConfig::default().with_transport_mode(TransportMode::TcpInterleaved)
    }

    /// One aggregate `PLAY` starts every channel; the other channel's
    /// command is answered without another request.
    #[tokio::test]
    async fn aggregate_play() {
        init_logging();
        let h = Harness::new(tcp(), true);
        h.connect_both().await;
        assert_eq!(
            h.sent(),
            vec![Method::Describe, Method::Setup, Method::Setup]
        );
        {
            let server = h.server.lock().unwrap();
            let t = server.sent[1].header(&headers::TRANSPORT).unwrap();
            assert_eq!(t.as_str(), "RTP/AVP/TCP;unicast;interleaved=0-1");
            let t = server.sent[2].header(&headers::TRANSPORT).unwrap();
            assert_eq!(t.as_str(), "RTP/AVP/TCP;unicast;interleaved=2-3");
            let s = server.sent[2].header(&headers::SESSION).unwrap();
            assert_eq!(s.as_str(), "12345678");
        }

        let p1 = h.play(1);
        let p2 = h.play(2);
        h.ticks(3);
        assert_eq!(
            h.sent().iter().filter(|m| **m == Method::Play).count(),
            1
        );
        assert_eq!(
            h.host.take(),
            vec![Recorded::Command(p1, Ok(())), Recorded::Command(p2, Ok(()))]
        );
        {
            let inner = h.mgr.shared.lock();
            assert!(inner
                .streams
                .iter()
                .all(|s| s.state == StreamState::Running));
            assert!(inner.session.as_ref().unwrap().agg_control);
        }

        // An IDR slice on the video channel reaches the host.
        let pkt = Header {
            sequence_number: 1,
            timestamp: 0,
            payload_type: 96,
            ssrc: 0x4cacc3d1,
            mark: true,
        }
        .serialize(b"\x65\x88\x84\x00\x33\xff")
        .unwrap();
        h.server
            .lock()
            .unwrap()
            .incoming
            .push_back(interleaved(0, pkt));
        h.ticks(1);
        match &h.host.take()[..] {
            [Recorded::Packet {
                channel,
                header,
                status,
                ..
            }] => {
                assert_eq!(*channel, ChannelHandle(1));
                assert!(header.random_access);
                assert_eq!(*status, SlStatus::Data);
            }
            o => panic!("unexpected callbacks {o:#?}"),
        }
        assert!(h.mgr.stats(ChannelHandle(1)).unwrap().interleaved);
        assert!(h.mgr.decoder_specific_info(ChannelHandle(1)).is_some());

        h.mgr.close().await.unwrap();
        assert_eq!(h.sent().last(), Some(&Method::Teardown));
        assert_eq!(h.host.take(), vec![Recorded::Disconnect(Ok(()))]);
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout() {
        init_logging();
        let h = Harness::new(tcp(), false);
        h.connect_both().await;
        let p1 = h.play(1);
        h.ticks(1);
        assert_eq!(h.sent().last(), Some(&Method::Play));
        tokio::time::advance(Duration::from_secs(31)).await;
        h.ticks(1);
        assert_eq!(
            h.host.take(),
            vec![Recorded::Command(p1, Err(ErrorKind::NetworkFailure))]
        );
        {
            let inner = h.mgr.shared.lock();
            let sess = inner.session.as_ref().unwrap();
            assert!(sess.in_flight.is_none());
            assert!(sess.queue.is_empty());
        }
        assert_eq!(h.server.lock().unwrap().resets, 1);
    }

    #[tokio::test]
    async fn migration_round_trip() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("session.sdp");
        let config = tcp().with_migration(MigrationConfig {
            enabled: true,
            pause: false,
            file: Some(file.to_str().unwrap().to_owned()),
            server: None,
        });
        let h = Harness::new(config.clone(), true);
        h.connect_both().await;
        h.play(1);
        h.play(2);
        h.ticks(3);

        // Half a second of video moves the checkpoint past the PLAY anchor.
        let pkt = Header {
            sequence_number: 5,
            timestamp: 45_000,
            payload_type: 96,
            ssrc: 0x4cacc3d1,
            mark: true,
        }
        .serialize(b"\x65\x88\x84\x00\x33\xff")
        .unwrap();
        h.server
            .lock()
            .unwrap()
            .incoming
            .push_back(interleaved(0, pkt));
        h.ticks(1);
        h.host.take();

        // Stop is suppressed, and close leaves the session on the server.
        let stop = ChannelCommand {
            channel: ChannelHandle(1),
            kind: ChannelCommandKind::Stop,
        };
        h.mgr.command(stop.clone());
        h.mgr.close().await.unwrap();
        assert_eq!(
            h.host.take(),
            vec![
                Recorded::Command(stop, Ok(())),
                Recorded::Disconnect(Ok(()))
            ]
        );
        assert!(!h.sent().contains(&Method::Teardown));
        assert!(file.exists());

        let h = Harness::new(config, true);
        assert_eq!(
            h.mgr.connect("rtsp://cam/stream").await.unwrap(),
            ConnectOutcome::Resumed
        );
        assert_eq!(h.host.take(), vec![Recorded::Connect(None, Ok(()))]);
        assert_eq!(
            h.server.lock().unwrap().connected,
            vec![Url::parse("rtsp://cam:554/stream/").unwrap()]
        );
        {
            let inner = h.mgr.shared.lock();
            assert_eq!(
                inner.session.as_ref().unwrap().session_id.as_deref(),
                Some("12345678")
            );
            assert_eq!(inner.streams.len(), 2);
            assert!(inner
                .streams
                .iter()
                .all(|s| s.state == StreamState::SessionResume));

            let video = &inner.streams[0];
            assert_eq!(
                video.control.as_ref().map(Url::as_str),
                Some("rtsp://cam/stream/trackID=1")
            );
            assert_eq!(video.interleaved, Some(0));
            assert_eq!(video.server_port, None);
            assert_eq!(video.ssrc(), Some(0x4cacc3d1));
            assert_eq!(video.anchor.ssrc, Some(0x4cacc3d1));
            assert_eq!(video.anchor.seq, Some(6));
            assert_eq!(video.anchor.rtptime, Some(45_000));
            assert_eq!(video.current_start, 0.5);

            // No audio arrived, so its position is still the PLAY anchor.
            let audio = &inner.streams[1];
            assert_eq!(
                audio.control.as_ref().map(Url::as_str),
                Some("rtsp://cam/stream/trackID=2")
            );
            assert_eq!(audio.interleaved, Some(2));
            assert_eq!(audio.ssrc(), None);
            assert_eq!(audio.anchor.seq, Some(1));
            assert_eq!(audio.anchor.rtptime, Some(0));
            assert_eq!(audio.current_start, 0.0);
        }
        h.mgr
            .connect_channel(ChannelHandle(1), "rtsp://cam/stream/trackID=1");
        h.ticks(2);
        assert_eq!(
            h.host.take(),
            vec![Recorded::Connect(Some(ChannelHandle(1)), Ok(()))]
        );
        let p1 = h.play(1);
        h.ticks(3);
        assert_eq!(h.host.take(), vec![Recorded::Command(p1, Ok(()))]);
        let server = h.server.lock().unwrap();
        assert_eq!(server.methods(), vec![Method::Play]);
        let play = &server.sent[0];
        assert_eq!(
            play.header(&headers::SESSION).unwrap().as_str(),
            "12345678"
        );
        assert!(play.header(&headers::RANGE).is_none());
    }

    /// A resumed UDP session binds the client ports the server was told.
    #[tokio::test]
    async fn migration_udp_ports() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("session.sdp");
        let config = ClientConfig::default().with_migration(MigrationConfig {
            enabled: true,
            pause: false,
            file: Some(file.to_str().unwrap().to_owned()),
            server: None,
        });
        let responder = || -> Responder {
            Box::new(|req: &Request<Bytes>| {
                Some(match req.method() {
                    Method::Setup => {
                        let transport = format!(
                            "{};server_port=6970-6971;ssrc=0000BEEF",
                            req.header(&headers::TRANSPORT).unwrap().as_str()
                        );
                        reply(
                            req,
                            200,
                            &[("Session", SESSION), ("Transport", transport.as_str())],
                            "",
                        )
                    }
                    _ => camera(req),
                })
            })
        };
        let h = Harness::with_responder(config.clone(), responder());
        h.connect_both().await;
        {
            let server = h.server.lock().unwrap();
            assert_eq!(
                server.bindings.iter().map(|b| b.first_port).collect::<Vec<_>>(),
                vec![None, None]
            );
            let t = server.sent[1].header(&headers::TRANSPORT).unwrap();
            assert_eq!(t.as_str(), "RTP/AVP;unicast;client_port=5000-5001");
        }
        h.play(1);
        h.play(2);
        h.ticks(3);
        h.mgr.close().await.unwrap();
        assert!(file.exists());

        let h = Harness::with_responder(config, responder());
        assert_eq!(
            h.mgr.connect("rtsp://cam/stream").await.unwrap(),
            ConnectOutcome::Resumed
        );
        let server = h.server.lock().unwrap();
        assert!(server.sent.is_empty());
        assert_eq!(
            server
                .bindings
                .iter()
                .map(|b| (b.first_port, b.exact_port))
                .collect::<Vec<_>>(),
            vec![(Some(5000), true), (Some(5002), true)]
        );
        let inner = h.mgr.shared.lock();
        for (s, port) in inner.streams.iter().zip([5000, 5002]) {
            assert_eq!(s.state, StreamState::SessionResume);
            assert_eq!(s.local_rtp_port(), Some(port));
            assert_eq!(s.interleaved, None);
            assert_eq!(s.server_port, Some((6970, 6971)));
            assert_eq!(s.ssrc(), Some(0xbeef));
            assert_eq!(s.anchor.seq, Some(1));
            assert_eq!(s.anchor.rtptime, Some(0));
        }
    }

    #[tokio::test]
    async fn embedded_data_url() {
        init_logging();
        let h = Harness::new(ClientConfig::default(), true);
        assert_eq!(
            h.mgr
                .connect("data:application/mpeg4-od-au;base64,AQID")
                .await
                .unwrap(),
            ConnectOutcome::Ready
        );
        h.mgr.connect_channel(ChannelHandle(7), "ES_ID=1");
        let play = h.play(7);
        h.ticks(1);
        let events = h.host.take();
        assert_eq!(events[0], Recorded::Connect(None, Ok(())));
        assert_eq!(events[1], Recorded::Connect(Some(ChannelHandle(7)), Ok(())));
        assert_eq!(events[2], Recorded::Command(play, Ok(())));
        assert!(matches!(
            &events[3],
            Recorded::Packet { data, status: SlStatus::Data, .. } if &data[..] == b"\x01\x02\x03"
        ));
        assert!(matches!(
            &events[4],
            Recorded::Packet {
                status: SlStatus::EndOfStream,
                ..
            }
        ));
        assert_eq!(events.len(), 5);
        assert_eq!(
            h.mgr.decoder_config(ChannelHandle(7)).unwrap().stream_type,
            StreamType::OBJECT_DESCRIPTOR
        );
    }

    #[tokio::test]
    async fn control_url_schemes() {
        for (url, expected) in [
            ("satip://cam/?src=1", "rtsp://cam:554/?src=1"),
            ("rtspu://cam/stream", "rtspu://cam:554/stream"),
            ("rtsp://cam:8554/stream", "rtsp://cam:8554/stream"),
        ] {
            let h = Harness::new(ClientConfig::default(), true);
            assert_eq!(h.mgr.connect(url).await.unwrap(), ConnectOutcome::Pending);
            assert_eq!(
                h.server.lock().unwrap().connected,
                vec![Url::parse(expected).unwrap()]
            );
        }
    }

    #[tokio::test]
    async fn unsupported_urls() {
        let h = Harness::new(ClientConfig::default(), true);
        let e = h.mgr.connect("gopher://cam/stream").await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotSupported);
        assert_eq!(
            h.host.take(),
            vec![Recorded::Connect(None, Err(ErrorKind::NotSupported))]
        );
        let h = Harness::new(ClientConfig::default(), true);
        let e = h.mgr.connect("/nonexistent/movie.sdp").await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::UrlError);
    }

    #[test]
    fn channel_targets() {
        assert_eq!(ChannelTarget::parse("ES_ID=3"), ChannelTarget::EsId(3));
        assert_eq!(
            ChannelTarget::parse("rtsp://cam/stream?ES_ID=4"),
            ChannelTarget::EsId(4)
        );
        assert_eq!(
            ChannelTarget::parse("/trackID=1"),
            ChannelTarget::Control("trackID=1".to_owned())
        );
        assert_eq!(
            split_media_fragment("rtsp://cam/stream#audio"),
            ("rtsp://cam/stream", Some(MediaFilter::Audio))
        );
        assert_eq!(split_media_fragment("rtsp://cam/a#b"), ("rtsp://cam/a#b", None));
    }
}
