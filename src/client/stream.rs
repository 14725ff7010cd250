// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-stream state: lifecycle, RTP/RTCP reception, and delivery of
//! depacketized access units to the host.

use std::net::IpAddr;
use std::num::NonZeroU32;
#[cfg(test)]
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::time::Instant;
use url::Url;

use super::host::{ChannelHandle, HostEvent, SlStatus};
use super::migration::StreamCheckpoint;
use super::rtp::InorderParser;
use super::sdp::StreamDescription;
use super::timeline::Timeline;
use super::transport::RtpTransport;
use crate::codec::{DecoderConfig, Depacketizer, PayloadKind, SlHeader, StreamType};
use crate::config::ClientConfig;
use crate::error::ErrorInt;
use crate::{ConnectionContext, Error, NtpTimestamp, PacketContext};

/// CNAME sent in receiver reports.
const CNAME: &str = "rtsp-ingest";

/// Packets this close to the anchor after a RESUME are leftovers from
/// before the pause.
const SEEK_GUARD_SECS: f64 = 0.021;

/// How close to the end of the range an access unit must be to end the stream.
const EOS_TOLERANCE_SECS: f64 = 0.2;

/// Index into the manager's stream arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StreamId(pub(crate) usize);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StreamState {
    /// Described but not yet set up.
    Setup,

    /// `SETUP` sent; awaiting the reply.
    WaitingForAck,

    /// Set up (or directly reachable) but not playing.
    Connected,
    Running,

    /// A `PLAY` or `PAUSE` failed; the next play sets it up again.
    Disconnected,

    /// No data arrived over UDP. Terminal.
    Unavailable,

    /// Restored from a migration checkpoint; set up on the server already.
    SessionResume,
}

impl StreamState {
    #[inline]
    pub(crate) fn is_active(self) -> bool {
        matches!(self, StreamState::Connected | StreamState::Running)
    }
}

/// How the next packets relate to the `RTP-Info` anchor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RtpTimeCheck {
    None,

    /// After `PLAY`: drop packets from before the anchor, then wait for a
    /// random access point where the format allows it.
    Rtp,

    /// After a resume: as above, and also drop the packets right at the anchor.
    RtpSeek,
}

/// Where the server said playback begins, from `RTP-Info`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RtpAnchor {
    pub(crate) seq: Option<u16>,
    pub(crate) rtptime: Option<u32>,
    pub(crate) ssrc: Option<u32>,
}

/// Reception and delivery statistics of one channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub access_units: u64,
    pub bytes_delivered: u64,

    /// Normal play time of the last delivered access unit, in seconds.
    pub playing_time: f64,

    /// Received bits per second since the last `PLAY`.
    pub bitrate: f64,
    pub last_sender_report: Option<NtpTimestamp>,
    pub interleaved: bool,
    pub multicast: bool,

    /// False when the server didn't send `RTP-Info`, so seeking won't line up.
    pub seekable: bool,
}

pub(crate) struct RtpStream {
    pub(crate) state: StreamState,

    /// Whether the RTSP session controls this stream.
    pub(crate) controlled: bool,
    pub(crate) media: String,
    pub(crate) media_index: Option<usize>,
    pub(crate) control: Option<Url>,
    pub(crate) es_id: u16,
    pub(crate) payload_type: u8,
    pub(crate) clock_rate: u32,
    pub(crate) depacketizer: Option<Depacketizer>,
    pub(crate) decoder_config: DecoderConfig,

    /// The single access unit of a `data:` stream.
    pub(crate) embedded: Option<Bytes>,
    pub(crate) channel: Option<ChannelHandle>,
    pub(crate) transport: Option<Box<dyn RtpTransport>>,

    /// RTP channel id, when interleaved on the RTSP connection.
    pub(crate) interleaved: Option<u8>,
    pub(crate) address: Option<IpAddr>,
    pub(crate) multicast_ttl: Option<u8>,
    pub(crate) sdp_port: u16,
    pub(crate) server_port: Option<(u16, u16)>,

    pub(crate) range_start: f64,
    pub(crate) range_end: f64,
    pub(crate) has_range: bool,

    /// NPT at the anchor of the current play.
    pub(crate) current_start: f64,
    pub(crate) anchor: RtpAnchor,
    pub(crate) check_rtp_time: RtpTimeCheck,

    /// Aggregate control already covered the next command on this stream.
    pub(crate) skip_next_command: bool,
    pub(crate) eos_sent: bool,
    pub(crate) paused: bool,

    /// Whether the server supports seeking this stream.
    pub(crate) interactive: bool,
    pub(crate) checkpoint: Option<StreamCheckpoint>,

    parser: InorderParser,
    timeline: Timeline,

    /// NPT and composition time of the last random access point delivered.
    last_rap: Option<(f64, i64)>,
    last_transport_time: f64,
    last_seq: Option<u16>,
    last_rtptime: Option<u32>,
    stats: NetStats,
    play_started: Option<Instant>,
    last_rr: Option<Instant>,
    last_nat_keepalive: Option<Instant>,
    last_sr: Option<(NtpTimestamp, Instant)>,
    rr_ssrc: u32,
}

impl std::fmt::Debug for RtpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpStream")
            .field("state", &self.state)
            .field("media", &self.media)
            .field("es_id", &self.es_id)
            .field("control", &self.control.as_ref().map(Url::as_str))
            .field("channel", &self.channel)
            .field("interleaved", &self.interleaved)
            .field("current_start", &self.current_start)
            .field("anchor", &self.anchor)
            .finish()
    }
}

impl RtpStream {
    pub(crate) fn from_description(d: StreamDescription, controlled: bool) -> Result<Self, Error> {
        let (has_range, range_start, range_end) = match d.range {
            Some((s, Some(e))) => (true, s, e),
            Some((s, None)) => (false, s, 0.0),
            None => (false, 0.0, 0.0),
        };
        let timeline = Timeline::new(None, d.clock_rate)
            .map_err(|e| wrap!(ErrorInt::SdpError(format!("stream {}: {e}", d.es_id))))?;
        let state = if d.checkpoint.is_some() {
            StreamState::SessionResume
        } else if controlled {
            StreamState::Setup
        } else {
            StreamState::Connected
        };
        let current_start = d.checkpoint.as_ref().map_or(0.0, |c| c.npt);
        let decoder_config = d.depacketizer.decoder_config().clone();
        Ok(RtpStream {
            state,
            controlled,
            media: d.media,
            media_index: Some(d.media_index),
            control: d.control,
            es_id: d.es_id,
            payload_type: d.payload_type,
            clock_rate: d.clock_rate,
            depacketizer: Some(d.depacketizer),
            decoder_config,
            embedded: None,
            channel: None,
            transport: None,
            interleaved: None,
            address: d.address,
            multicast_ttl: d.multicast_ttl,
            sdp_port: d.port,
            server_port: d.checkpoint.as_ref().and_then(|c| c.server_port),
            range_start,
            range_end,
            has_range,
            current_start,
            anchor: RtpAnchor::default(),
            check_rtp_time: RtpTimeCheck::None,
            skip_next_command: false,
            eos_sent: false,
            paused: false,
            interactive: true,
            checkpoint: d.checkpoint,
            parser: InorderParser::new(None, None),
            timeline,
            last_rap: None,
            last_transport_time: 0.0,
            last_seq: None,
            last_rtptime: None,
            stats: NetStats::default(),
            play_started: None,
            last_rr: None,
            last_nat_keepalive: None,
            last_sr: None,
            rr_ssrc: rand::random(),
        })
    }

    /// Creates a stream which delivers `au` once, then ends.
    pub(crate) fn embedded(
        es_id: u16,
        media: &str,
        decoder_config: DecoderConfig,
        au: Bytes,
    ) -> Self {
        RtpStream {
            state: StreamState::Connected,
            controlled: false,
            media: media.to_owned(),
            media_index: None,
            control: None,
            es_id,
            payload_type: 0,
            clock_rate: 1,
            depacketizer: None,
            decoder_config,
            embedded: Some(au),
            channel: None,
            transport: None,
            interleaved: None,
            address: None,
            multicast_ttl: None,
            sdp_port: 0,
            server_port: None,
            range_start: 0.0,
            range_end: 0.0,
            has_range: false,
            current_start: 0.0,
            anchor: RtpAnchor::default(),
            check_rtp_time: RtpTimeCheck::None,
            skip_next_command: false,
            eos_sent: false,
            paused: false,
            interactive: false,
            checkpoint: None,
            parser: InorderParser::new(None, None),
            timeline: Timeline::unanchored(NonZeroU32::MIN),
            last_rap: None,
            last_transport_time: 0.0,
            last_seq: None,
            last_rtptime: None,
            stats: NetStats::default(),
            play_started: None,
            last_rr: None,
            last_nat_keepalive: None,
            last_sr: None,
            rr_ssrc: 0,
        }
    }

    pub(crate) fn is_interleaved(&self) -> bool {
        self.interleaved.is_some()
    }

    pub(crate) fn is_multicast(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_multicast())
    }

    /// The local RTP port, if receiving over UDP.
    pub(crate) fn local_rtp_port(&self) -> Option<u16> {
        self.transport.as_ref().map(|t| t.local_rtp_port())
    }

    /// Time since the anchor of the last packet received, in seconds.
    pub(crate) fn transport_time(&self) -> f64 {
        self.last_transport_time
    }

    pub(crate) fn last_rtp_position(&self) -> (Option<u16>, Option<u32>) {
        (self.last_seq, self.last_rtptime)
    }

    pub(crate) fn ssrc(&self) -> Option<u32> {
        self.parser.ssrc()
    }

    /// Expects `ssrc`, as announced in the `SETUP` reply's `Transport`.
    pub(crate) fn set_ssrc(&mut self, ssrc: Option<u32>) {
        self.parser.reset(ssrc, None);
    }

    pub(crate) fn npt(&self) -> f64 {
        self.current_start + self.last_transport_time
    }

    /// Re-anchors the stream as an `RTP-Info` entry says and starts it.
    pub(crate) fn set_rtp_anchor(&mut self, anchor: RtpAnchor, check: RtpTimeCheck) {
        trace!("stream {}: anchor {:?}, {:?}", self.es_id, anchor, check);
        self.anchor = anchor;
        self.check_rtp_time = check;
        self.parser.reset(anchor.ssrc.or(self.parser.ssrc()), anchor.seq);
        self.timeline.anchor(anchor.rtptime);
        self.start_playing();
    }

    /// Starts playing without a server-provided anchor: the first packet
    /// received is at `current_start`.
    pub(crate) fn start_unanchored(&mut self) {
        self.anchor = RtpAnchor::default();
        self.check_rtp_time = RtpTimeCheck::None;
        self.parser.reset(None, None);
        self.timeline.anchor(None);
        self.start_playing();
    }

    fn start_playing(&mut self) {
        if let Some(d) = self.depacketizer.as_mut() {
            d.reset();
        }
        self.last_rap = None;
        self.last_transport_time = 0.0;
        self.eos_sent = false;
        self.paused = false;
        self.play_started = None;
        self.stats.packets_received = 0;
        self.stats.bytes_received = 0;
        self.state = StreamState::Running;
    }

    /// Marks the stream stopped at `current_start`, keeping its setup.
    pub(crate) fn halt(&mut self) {
        if let Some(d) = self.depacketizer.as_mut() {
            d.reset();
        }
        if self.state == StreamState::Running {
            self.state = StreamState::Connected;
        }
    }

    pub(crate) fn stats(&self, now: Instant) -> NetStats {
        let mut s = self.stats.clone();
        s.interleaved = self.is_interleaved();
        s.multicast = self.is_multicast();
        s.seekable = self.interactive;
        if let Some(started) = self.play_started {
            let secs = now.saturating_duration_since(started).as_secs_f64();
            if secs > 0.0 {
                s.bitrate = (s.bytes_received as f64) * 8.0 / secs;
            }
        }
        s
    }

    /// Delivers the end-of-stream marker, once.
    pub(crate) fn send_eos(&mut self, events: &mut Vec<HostEvent>) {
        if self.eos_sent {
            return;
        }
        self.eos_sent = true;
        info!("stream {}: end of stream at npt {:.3}", self.es_id, self.npt());
        if let Some(channel) = self.channel {
            events.push(HostEvent::SlPacket {
                channel,
                data: Bytes::new(),
                header: SlHeader {
                    npt: self.stats.playing_time,
                    au_start: true,
                    au_end: true,
                    ..Default::default()
                },
                status: SlStatus::EndOfStream,
            });
        }
    }

    /// Delivers the access unit of a `data:` stream.
    pub(crate) fn deliver_embedded(&mut self, events: &mut Vec<HostEvent>) {
        if self.state != StreamState::Running || self.eos_sent {
            return;
        }
        let (Some(au), Some(channel)) = (self.embedded.clone(), self.channel) else {
            return;
        };
        self.stats.access_units += 1;
        self.stats.bytes_delivered += au.len() as u64;
        events.push(HostEvent::SlPacket {
            channel,
            data: au,
            header: SlHeader {
                au_start: true,
                au_end: true,
                random_access: true,
                ..Default::default()
            },
            status: SlStatus::Data,
        });
        self.send_eos(events);
    }

    /// Handles one RTP packet.
    pub(crate) fn handle_rtp(
        &mut self,
        id: StreamId,
        conn_ctx: &ConnectionContext,
        pkt_ctx: &PacketContext,
        data: Bytes,
        now: Instant,
        config: &ClientConfig,
        events: &mut Vec<HostEvent>,
    ) {
        if self.state != StreamState::Running || self.eos_sent {
            return;
        }
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;
        self.play_started.get_or_insert(now);
        let Some(seq) = data.get(2..4).map(|s| u16::from_be_bytes([s[0], s[1]])) else {
            debug!("stream {}: runt RTP packet of {} bytes", id, data.len());
            return;
        };
        if matches!(config.packet_drop, Some(d) if d.drops(seq)) {
            trace!("stream {}: deliberately dropping seq={:04x}", id, seq);
            return;
        }
        if self.check_rtp_time != RtpTimeCheck::None {
            if let Some(anchor_seq) = self.anchor.seq {
                if seq.wrapping_sub(anchor_seq) >= 0x8000 {
                    trace!(
                        "stream {}: dropping seq={:04x} from before anchor seq={:04x}",
                        id,
                        seq,
                        anchor_seq
                    );
                    return;
                }
            }
        }
        let tcp = self.is_interleaved();
        let pkt = match self
            .parser
            .rtp(tcp, conn_ctx, pkt_ctx, &mut self.timeline, id.0, data)
        {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                warn!("stream {}: dropping packet: {}", id, e);
                return;
            }
        };
        self.stats.packets_lost += u64::from(pkt.loss());
        if pkt.header().payload_type != self.payload_type {
            // Comfort noise and the like share the sequence but not the format.
            trace!(
                "stream {}: skipping seq={:04x} of payload type {}",
                id,
                pkt.sequence_number(),
                pkt.header().payload_type
            );
            return;
        }
        self.last_seq = Some(pkt.sequence_number());
        self.last_rtptime = Some(pkt.timestamp().timestamp() as u32);
        let transport_time = pkt.timestamp().elapsed_secs();
        self.last_transport_time = transport_time;

        let Some(depacketizer) = self.depacketizer.as_mut() else {
            return;
        };
        match self.check_rtp_time {
            RtpTimeCheck::None => {}
            RtpTimeCheck::Rtp => {
                if depacketizer.kind() == PayloadKind::H264 {
                    depacketizer.set_wait_rap();
                }
                self.check_rtp_time = RtpTimeCheck::None;
            }
            RtpTimeCheck::RtpSeek => {
                if transport_time <= SEEK_GUARD_SECS {
                    return;
                }
                if depacketizer.kind() == PayloadKind::H264 {
                    depacketizer.set_wait_rap();
                }
                self.check_rtp_time = RtpTimeCheck::None;
            }
        }

        if let Err(e) = depacketizer.push(&pkt) {
            debug!(
                "stream {}: dropping access unit: {}\n{:#?}",
                id,
                e,
                crate::hex::LimitedHex::new(pkt.payload(), 64)
            );
            return;
        }
        let start = i64::from(self.timeline.start().unwrap_or(0));
        let clock_rate = f64::from(self.timeline.clock_rate().get());
        while let Some(p) = self.depacketizer.as_mut().and_then(Depacketizer::pull) {
            let mut header = p.header;
            let mut npt =
                self.current_start + ((header.composition_ts - start) as f64) / clock_rate;
            if header.random_access && header.au_start {
                if let Some((last_npt, last_cts)) = self.last_rap {
                    if npt < last_npt {
                        debug!(
                            "stream {}: clamping random access point npt {:.3} to {:.3}",
                            id, npt, last_npt
                        );
                        npt = last_npt;
                        header.composition_ts = last_cts;
                    }
                }
                self.last_rap = Some((npt, header.composition_ts));
            }
            header.npt = npt;
            self.stats.playing_time = npt;
            let au_end = header.au_end;
            if au_end {
                self.stats.access_units += 1;
            }
            self.stats.bytes_delivered += p.data.len() as u64;
            if let Some(channel) = self.channel {
                events.push(HostEvent::SlPacket {
                    channel,
                    data: p.data,
                    header,
                    status: SlStatus::Data,
                });
            }
            if au_end && self.has_range && (self.range_end - npt).abs() < EOS_TOLERANCE_SECS {
                self.send_eos(events);
                if let Some(d) = self.depacketizer.as_mut() {
                    d.reset();
                }
                return;
            }
        }
    }

    /// Handles one compound RTCP packet.
    pub(crate) fn handle_rtcp(
        &mut self,
        id: StreamId,
        data: &[u8],
        now: Instant,
        events: &mut Vec<HostEvent>,
    ) {
        if !self.state.is_active() {
            return;
        }
        match self.parser.rtcp(&mut self.timeline, data) {
            Ok(info) => {
                if let Some(sr) = info.sender_report {
                    trace!(
                        "stream {}: SR ssrc={:08x} ts={} ntp={} packets={}",
                        id,
                        sr.ssrc,
                        sr.timestamp,
                        sr.ntp_timestamp,
                        sr.packet_count
                    );
                    self.last_sr = Some((sr.ntp_timestamp, now));
                    self.stats.last_sender_report = Some(sr.ntp_timestamp);
                }
                if info.goodbye && self.state == StreamState::Running {
                    debug!("stream {}: BYE", id);
                    self.send_eos(events);
                }
            }
            Err(description) => debug!("stream {}: bad RTCP: {}", id, description),
        }
    }

    /// Returns a receiver report to send, if one is due.
    pub(crate) fn receiver_report(&mut self, now: Instant, config: &ClientConfig) -> Option<Bytes> {
        if config.disable_rtcp || self.state != StreamState::Running {
            return None;
        }
        if matches!(self.last_rr, Some(t) if now.saturating_duration_since(t) < config.rtcp_report_interval)
        {
            return None;
        }
        let (last_sr, dlsr) = match self.last_sr {
            // Delay since last SR is in units of 1/65536 seconds.
            Some((ntp, at)) => (
                ntp.compact(),
                (now.saturating_duration_since(at).as_secs_f64() * 65536.0) as u32,
            ),
            None => (0, 0),
        };
        let block = self.parser.report_block(last_sr, dlsr)?;
        self.last_rr = Some(now);
        Some(crate::rtcp::receiver_report(self.rr_ssrc, CNAME, &[block]))
    }

    /// Drains the UDP sockets, then sends whatever reports and keepalives are due.
    pub(crate) fn poll_udp(
        &mut self,
        id: StreamId,
        conn_ctx: &ConnectionContext,
        now: Instant,
        config: &ClientConfig,
        events: &mut Vec<HostEvent>,
    ) {
        if self.state != StreamState::Running || self.eos_sent || self.is_interleaved() {
            return;
        }
        let Some(mut t) = self.transport.take() else {
            return;
        };
        loop {
            match t.recv_rtp() {
                Ok(Some(data)) => {
                    self.handle_rtp(id, conn_ctx, &PacketContext::udp(), data, now, config, events)
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stream {}: {}", id, e);
                    break;
                }
            }
        }
        loop {
            match t.recv_rtcp() {
                Ok(Some(data)) => self.handle_rtcp(id, &data, now, events),
                Ok(None) => break,
                Err(e) => {
                    warn!("stream {}: {}", id, e);
                    break;
                }
            }
        }
        if let Some(rr) = self.receiver_report(now, config) {
            if let Err(e) = t.send_rtcp(rr) {
                debug!("stream {}: unable to send receiver report: {}", id, e);
            }
        }
        if let Some(interval) = config.nat_keepalive {
            let due = self
                .last_nat_keepalive
                .map_or(true, |l| now.saturating_duration_since(l) >= interval);
            if due {
                self.last_nat_keepalive = Some(now);
                if let Err(e) = t.send_nat_keepalive() {
                    debug!("stream {}: unable to send NAT keepalive: {}", id, e);
                }
            }
        }
        let multicast = t.is_multicast();
        self.transport = Some(t);
        self.check_udp_timeout(id, multicast, now, config, events);
    }

    fn check_udp_timeout(
        &mut self,
        id: StreamId,
        multicast: bool,
        now: Instant,
        config: &ClientConfig,
        events: &mut Vec<HostEvent>,
    ) {
        let Some(timeout) = config.udp_timeout else {
            return;
        };
        if multicast || self.stats.packets_received > 0 || self.state != StreamState::Running {
            return;
        }
        let started = *self.play_started.get_or_insert(now);
        let elapsed = now.saturating_duration_since(started);
        if elapsed < timeout {
            return;
        }
        warn!("stream {}: no UDP data in {:?}", id, elapsed);
        self.state = StreamState::Unavailable;
        events.push(HostEvent::Message(
            Err(wrap!(ErrorInt::UdpTimeout { elapsed })),
            format!("stream {}: UDP unavailable; try TCP interleaving", self.es_id),
        ));
    }

    /// The decoder-specific info, for hosts that don't read descriptors.
    pub(crate) fn decoder_specific_info(&self) -> Option<Bytes> {
        self.decoder_config.decoder_specific_info.clone()
    }

    #[cfg(test)]
    pub(crate) fn duration_since_play(&self, now: Instant) -> Option<Duration> {
        self.play_started.map(|s| now.saturating_duration_since(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sdp::parse_description;
    use crate::rtp::Header;

    fn stream(sdp: &[u8]) -> RtpStream {
        let mut d = parse_description(sdp, None, &ClientConfig::default(), None).unwrap();
        let mut s = RtpStream::from_description(d.streams.remove(0), false).unwrap();
        s.channel = Some(ChannelHandle(1));
        s
    }

    const AMR_SDP: &[u8] = b"v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.1\r\n\
        s=-\r\n\
        c=IN IP4 10.0.0.1\r\n\
        t=0 0\r\n\
        a=range:npt=0-1.0\r\n\
        m=audio 5000 RTP/AVP 97\r\n\
        a=rtpmap:97 AMR/8000\r\n\
        a=fmtp:97 octet-align=1\r\n";

    const H264_SDP: &[u8] = b"v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.1\r\n\
        s=-\r\n\
        c=IN IP4 10.0.0.1\r\n\
        t=0 0\r\n\
        m=video 5000 RTP/AVP 97\r\n\
        a=rtpmap:97 H264/90000\r\n\
        a=fmtp:97 packetization-mode=1\r\n";

    fn rtp(seq: u16, timestamp: u32, mark: bool, payload: &[u8]) -> Bytes {
        Header {
            sequence_number: seq,
            timestamp,
            payload_type: 97,
            ssrc: 0x1234_5678,
            mark,
        }
        .serialize(payload)
        .unwrap()
    }

    fn push(s: &mut RtpStream, data: Bytes, events: &mut Vec<HostEvent>) {
        s.handle_rtp(
            StreamId(0),
            &ConnectionContext::dummy(),
            &PacketContext::dummy(),
            data,
            Instant::now(),
            &ClientConfig::default(),
            events,
        );
    }

    fn sl_packets(events: &[HostEvent]) -> Vec<(f64, SlStatus)> {
        events
            .iter()
            .filter_map(|e| match e {
                HostEvent::SlPacket { header, status, .. } => Some((header.npt, *status)),
                _ => None,
            })
            .collect()
    }

    /// One octet-aligned AMR-NB 12.2 kbit/s frame with a zeroed payload.
    fn amr_frame() -> Vec<u8> {
        let mut p = vec![0xf0, 0x3c];
        p.extend_from_slice(&[0; 31]);
        p
    }

    #[test]
    fn end_of_stream_once() {
        let mut s = stream(AMR_SDP);
        assert!(s.has_range);
        assert_eq!(s.range_end, 1.0);
        s.set_rtp_anchor(
            RtpAnchor {
                seq: Some(10),
                rtptime: Some(8000),
                ssrc: None,
            },
            RtpTimeCheck::None,
        );
        let mut events = Vec::new();

        // Before the anchor: dropped once checking is on.
        s.check_rtp_time = RtpTimeCheck::Rtp;
        push(&mut s, rtp(9, 7840, true, &amr_frame()), &mut events);
        assert!(events.is_empty());

        push(&mut s, rtp(10, 8000, true, &amr_frame()), &mut events);
        push(&mut s, rtp(11, 8000 + 4000, true, &amr_frame()), &mut events);
        assert!(sl_packets(&events).iter().all(|(_, st)| *st == SlStatus::Data));

        // 0.85 s is within 200 ms of the end.
        push(&mut s, rtp(12, 8000 + 6800, true, &amr_frame()), &mut events);
        push(&mut s, rtp(13, 8000 + 7600, true, &amr_frame()), &mut events);
        let packets = sl_packets(&events);
        let eos: Vec<_> = packets
            .iter()
            .filter(|(_, st)| *st == SlStatus::EndOfStream)
            .collect();
        assert_eq!(eos.len(), 1);
        assert_eq!(packets.last().unwrap().1, SlStatus::EndOfStream);
        assert!((packets[packets.len() - 2].0 - 0.85).abs() < 1e-9);
    }

    #[test]
    fn goodbye_ends_stream() {
        let mut s = stream(AMR_SDP);
        s.start_unanchored();
        let mut events = Vec::new();
        push(&mut s, rtp(1, 0, true, &amr_frame()), &mut events);
        let bye = [0x81, 203, 0, 1, 0x12, 0x34, 0x56, 0x78];
        s.handle_rtcp(StreamId(0), &bye, Instant::now(), &mut events);
        s.handle_rtcp(StreamId(0), &bye, Instant::now(), &mut events);
        let packets = sl_packets(&events);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[2].1, SlStatus::EndOfStream);

        // Nothing more after EOS.
        push(&mut s, rtp(2, 160, true, &amr_frame()), &mut events);
        assert_eq!(sl_packets(&events).len(), 3);
    }

    #[test]
    fn other_payload_types_skipped() {
        let mut s = stream(AMR_SDP);
        s.start_unanchored();
        let mut events = Vec::new();
        push(&mut s, rtp(1, 0, true, &amr_frame()), &mut events);
        let comfort_noise = Header {
            sequence_number: 2,
            timestamp: 160,
            payload_type: 13,
            ssrc: 0x1234_5678,
            mark: false,
        }
        .serialize(b"\x40")
        .unwrap();
        push(&mut s, comfort_noise, &mut events);
        assert_eq!(sl_packets(&events).len(), 2);
        push(&mut s, rtp(3, 320, true, &amr_frame()), &mut events);
        assert_eq!(sl_packets(&events).len(), 4);
        let stats = s.stats(Instant::now());
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.access_units, 2);
    }

    #[test]
    fn random_access_npt_never_decreases() {
        let mut s = stream(H264_SDP);
        s.start_unanchored();
        let mut events = Vec::new();
        let idr = [0x65, 0x88, 0x84, 0x00];
        push(&mut s, rtp(1, 90_000, true, &idr), &mut events);
        push(&mut s, rtp(2, 180_000, true, &idr), &mut events);

        // A later packet whose IDR has an earlier timestamp.
        push(&mut s, rtp(3, 135_000, true, &idr), &mut events);
        let npts: Vec<f64> = sl_packets(&events).iter().map(|(n, _)| *n).collect();
        assert_eq!(npts, vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn packet_drop() {
        let mut s = stream(AMR_SDP);
        s.start_unanchored();
        let config = ClientConfig::default().with_packet_drop(Some(crate::config::PacketDrop {
            first: 2,
            frequency: std::num::NonZeroU16::new(2).unwrap(),
        }));
        let mut events = Vec::new();
        for seq in 1..=5 {
            s.handle_rtp(
                StreamId(0),
                &ConnectionContext::dummy(),
                &PacketContext::dummy(),
                rtp(seq, u32::from(seq) * 160, true, &amr_frame()),
                Instant::now(),
                &config,
                &mut events,
            );
        }
        // 2 and 4 dropped; each frame is a TOC packet plus a speech packet.
        assert_eq!(sl_packets(&events).len(), 6);
        let stats = s.stats(Instant::now());
        assert_eq!(stats.packets_received, 5);
        assert_eq!(stats.access_units, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn udp_timeout() {
        let mut s = stream(AMR_SDP);
        s.start_unanchored();
        let mut events = Vec::new();
        let config = ClientConfig::default().with_udp_timeout(Some(Duration::from_secs(1)));
        let start = Instant::now();
        s.check_udp_timeout(StreamId(0), false, start, &config, &mut events);
        assert!(events.is_empty());
        assert_eq!(s.duration_since_play(start), Some(Duration::ZERO));
        tokio::time::advance(Duration::from_secs(2)).await;
        s.check_udp_timeout(StreamId(0), false, Instant::now(), &config, &mut events);
        assert_eq!(s.state, StreamState::Unavailable);
        match &events[..] {
            [HostEvent::Message(Err(e), _)] => {
                assert_eq!(e.kind(), crate::ErrorKind::NetworkFailure)
            }
            o => panic!("unexpected events {o:?}"),
        }
    }

    #[test]
    fn embedded_au() {
        let mut s = RtpStream::embedded(
            3,
            "application",
            DecoderConfig {
                stream_type: StreamType::OBJECT_DESCRIPTOR,
                object_type_indication: 0x01,
                decoder_specific_info: None,
            },
            Bytes::from_static(b"\x01\x02"),
        );
        s.channel = Some(ChannelHandle(9));
        let mut events = Vec::new();
        s.deliver_embedded(&mut events);
        assert!(events.is_empty());
        s.start_unanchored();
        s.deliver_embedded(&mut events);
        s.deliver_embedded(&mut events);
        assert_eq!(
            sl_packets(&events),
            vec![(0.0, SlStatus::Data), (0.0, SlStatus::EndOfStream)]
        );
    }
}
