// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-wide configuration.
//!
//! A [`ClientConfig`] is built once, before connecting, and shared read-only by
//! every component of a [`crate::client::SessionManager`]. Hosts that keep
//! their options as string key/value pairs can use [`ClientConfig::from_pairs`].

use std::net::IpAddr;
use std::num::NonZeroU16;
use std::str::FromStr;
use std::time::Duration;

use log::debug;

use crate::error::ErrorInt;
use crate::Error;

/// How RTP/RTCP should be carried for RTSP-controlled streams.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Separate UDP sockets for each stream.
    #[default]
    Udp,

    /// Interleave all streams on the RTSP TCP connection.
    TcpInterleaved,

    /// Interleave only streams other than audio and video, which tolerate
    /// loss poorly (scene description, object descriptors, text).
    TcpOnlyCritical,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "udp" => TransportMode::Udp,
            "tcp" => TransportMode::TcpInterleaved,
            "tcp-critical" => TransportMode::TcpOnlyCritical,
            _ => return Err(format!("unknown transport mode {s:?}")),
        })
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            TransportMode::Udp => "udp",
            TransportMode::TcpInterleaved => "tcp",
            TransportMode::TcpOnlyCritical => "tcp-critical",
        })
    }
}

/// Restricts a session to a single media type ("single object" mode).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaFilter {
    Audio,
    Video,
}

impl MediaFilter {
    /// Returns true if an SDP media section of type `media` passes the filter.
    pub fn accepts(self, media: &str) -> bool {
        match self {
            MediaFilter::Audio => media.eq_ignore_ascii_case("audio"),
            MediaFilter::Video => media.eq_ignore_ascii_case("video"),
        }
    }
}

impl FromStr for MediaFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("audio") {
            Ok(MediaFilter::Audio)
        } else if s.eq_ignore_ascii_case("video") {
            Ok(MediaFilter::Video)
        } else {
            Err(format!("unknown media filter {s:?}"))
        }
    }
}

/// Deliberate packet loss, for exercising depacketizer recovery paths.
///
/// Packets with sequence number `seq >= first` and `(seq - first) % frequency == 0`
/// are discarded before depacketization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketDrop {
    pub first: u16,
    pub frequency: NonZeroU16,
}

impl PacketDrop {
    #[inline]
    pub fn drops(&self, seq: u16) -> bool {
        seq >= self.first && (seq - self.first) % self.frequency.get() == 0
    }
}

/// Session migration: checkpointing an in-progress session so another client
/// (or this one after a network handover) can resume it without a new SETUP.
#[derive(Clone, Debug, Default)]
pub struct MigrationConfig {
    pub enabled: bool,

    /// On close, PAUSE the session rather than leave it playing.
    pub pause: bool,

    /// Local path or `http://` URL of the checkpoint.
    pub file: Option<String>,

    /// Where to additionally POST the checkpoint on save.
    pub server: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) default_port: u16,
    pub(crate) udp_unavailable: bool,
    pub(crate) udp_timeout: Option<Duration>,
    pub(crate) rtsp_timeout: Duration,
    pub(crate) transport_mode: TransportMode,
    pub(crate) packet_drop: Option<PacketDrop>,
    pub(crate) buffer_length: Duration,
    pub(crate) rebuffer_length: Duration,
    pub(crate) force_multicast: Option<(IpAddr, u8)>,
    pub(crate) force_first_port: Option<u16>,
    pub(crate) disable_rtcp: bool,
    pub(crate) rtcp_report_interval: Duration,
    pub(crate) nat_keepalive: Option<Duration>,
    pub(crate) migration: MigrationConfig,
    pub(crate) media_filter: Option<MediaFilter>,
    pub(crate) poll_interval: Duration,
    pub(crate) close_drain_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_port: 554,
            udp_unavailable: false,
            udp_timeout: Some(Duration::from_secs(10)),
            rtsp_timeout: Duration::from_secs(30),
            transport_mode: TransportMode::Udp,
            packet_drop: None,
            buffer_length: Duration::from_millis(3000),
            rebuffer_length: Duration::ZERO,
            force_multicast: None,
            force_first_port: None,
            disable_rtcp: false,
            rtcp_report_interval: Duration::from_secs(5),
            nat_keepalive: None,
            migration: MigrationConfig::default(),
            media_filter: None,
            poll_interval: Duration::from_millis(1),
            close_drain_timeout: Duration::from_secs(2),
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        _ => bail!(ErrorInt::ConfigError {
            key,
            description: format!("expected yes/no, got {value:?}"),
        }),
    }
}

fn parse_num<T: FromStr>(key: &'static str, value: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        wrap!(ErrorInt::ConfigError {
            key,
            description: format!("{value:?}: {e}"),
        })
    })
}

/// Parses a millisecond count; zero means "disabled".
fn parse_opt_ms(key: &'static str, value: &str) -> Result<Option<Duration>, Error> {
    let ms: u64 = parse_num(key, value)?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}

impl ClientConfig {
    /// Builds a config from string key/value pairs, starting from defaults.
    ///
    /// Unknown keys are ignored. Durations are in milliseconds.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut c = Self::default();
        let mut first_drop = None;
        let mut drop_frequency = None;
        let mut multicast_ip = None;
        let mut multicast_ttl = 127;
        for (k, v) in pairs {
            match k {
                "DefaultPort" => c.default_port = parse_num("DefaultPort", v)?,
                "UDPNotAvailable" => c.udp_unavailable = parse_bool("UDPNotAvailable", v)?,
                "UDPTimeout" => c.udp_timeout = parse_opt_ms("UDPTimeout", v)?,
                "RTSPTimeout" => {
                    c.rtsp_timeout = Duration::from_millis(parse_num("RTSPTimeout", v)?)
                }
                "TransportMode" => {
                    c.transport_mode = v.parse().map_err(|description| {
                        wrap!(ErrorInt::ConfigError {
                            key: "TransportMode",
                            description,
                        })
                    })?
                }
                "FirstPacketDrop" => first_drop = Some(parse_num::<u16>("FirstPacketDrop", v)?),
                "PacketDropFrequency" => {
                    drop_frequency = Some(parse_num::<u16>("PacketDropFrequency", v)?)
                }
                "BufferLength" => {
                    c.buffer_length = Duration::from_millis(parse_num("BufferLength", v)?)
                }
                "RebufferLength" => {
                    c.rebuffer_length = Duration::from_millis(parse_num("RebufferLength", v)?)
                }
                "ForceMulticastIP" => {
                    multicast_ip = Some(parse_num::<IpAddr>("ForceMulticastIP", v)?)
                }
                "ForceMulticastTTL" => multicast_ttl = parse_num("ForceMulticastTTL", v)?,
                "ForceFirstPort" => {
                    let p: u16 = parse_num("ForceFirstPort", v)?;
                    c.force_first_port = (p != 0).then_some(p);
                }
                "DisableRTCP" => c.disable_rtcp = parse_bool("DisableRTCP", v)?,
                "NATKeepAlive" => c.nat_keepalive = parse_opt_ms("NATKeepAlive", v)?,
                "SessionMigration" => c.migration.enabled = parse_bool("SessionMigration", v)?,
                "SessionMigrationPause" => {
                    c.migration.pause = parse_bool("SessionMigrationPause", v)?
                }
                "SessionMigrationFile" => c.migration.file = Some(v.to_owned()),
                "SessionMigrationServer" => c.migration.server = Some(v.to_owned()),
                "MediaFilter" => {
                    c.media_filter = Some(v.parse().map_err(|description| {
                        wrap!(ErrorInt::ConfigError {
                            key: "MediaFilter",
                            description,
                        })
                    })?)
                }
                _ => debug!("ignoring unknown config key {:?}", k),
            }
        }
        c.packet_drop = match (first_drop, drop_frequency) {
            (Some(first), f) if first > 0 => Some(PacketDrop {
                first,
                frequency: NonZeroU16::new(f.unwrap_or(1)).unwrap_or(NonZeroU16::MIN),
            }),
            _ => None,
        };
        c.force_multicast = multicast_ip.map(|ip| (ip, multicast_ttl));
        Ok(c)
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_udp_unavailable(mut self, udp_unavailable: bool) -> Self {
        self.udp_unavailable = udp_unavailable;
        self
    }

    pub fn with_udp_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.udp_timeout = timeout;
        self
    }

    /// Sets the time to wait for a reply to any command other than TEARDOWN.
    pub fn with_rtsp_timeout(mut self, timeout: Duration) -> Self {
        self.rtsp_timeout = timeout;
        self
    }

    pub fn with_transport_mode(mut self, mode: TransportMode) -> Self {
        self.transport_mode = mode;
        self
    }

    pub fn with_packet_drop(mut self, packet_drop: Option<PacketDrop>) -> Self {
        self.packet_drop = packet_drop;
        self
    }

    pub fn with_buffering(mut self, buffer_length: Duration, rebuffer_length: Duration) -> Self {
        self.buffer_length = buffer_length;
        self.rebuffer_length = rebuffer_length;
        self
    }

    pub fn with_force_multicast(mut self, group: Option<(IpAddr, u8)>) -> Self {
        self.force_multicast = group;
        self
    }

    pub fn with_force_first_port(mut self, port: Option<u16>) -> Self {
        self.force_first_port = port;
        self
    }

    pub fn with_disable_rtcp(mut self, disable: bool) -> Self {
        self.disable_rtcp = disable;
        self
    }

    pub fn with_nat_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.nat_keepalive = interval;
        self
    }

    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    pub fn with_media_filter(mut self, filter: Option<MediaFilter>) -> Self {
        self.media_filter = filter;
        self
    }

    /// Sets how long the background task sleeps between polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    pub fn rtsp_timeout(&self) -> Duration {
        self.rtsp_timeout
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport_mode
    }

    pub fn migration(&self) -> &MigrationConfig {
        &self.migration
    }

    pub fn buffer_length(&self) -> Duration {
        self.buffer_length
    }

    pub fn rebuffer_length(&self) -> Duration {
        self.rebuffer_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pairs() {
        let c = ClientConfig::from_pairs([
            ("DefaultPort", "8554"),
            ("RTSPTimeout", "5000"),
            ("UDPTimeout", "0"),
            ("TransportMode", "tcp-critical"),
            ("FirstPacketDrop", "100"),
            ("PacketDropFrequency", "7"),
            ("ForceMulticastIP", "239.1.2.3"),
            ("DisableRTCP", "yes"),
            ("SessionMigration", "true"),
            ("SessionMigrationFile", "/tmp/session.sdp"),
            ("SomethingElse", "whatever"),
        ])
        .unwrap();
        assert_eq!(c.default_port, 8554);
        assert_eq!(c.rtsp_timeout, Duration::from_secs(5));
        assert_eq!(c.udp_timeout, None);
        assert_eq!(c.transport_mode, TransportMode::TcpOnlyCritical);
        let d = c.packet_drop.unwrap();
        assert!(d.drops(100));
        assert!(!d.drops(101));
        assert!(d.drops(107));
        assert!(!d.drops(99));
        assert_eq!(c.force_multicast, Some(("239.1.2.3".parse().unwrap(), 127)));
        assert!(c.disable_rtcp);
        assert!(c.migration.enabled);
        assert_eq!(c.migration.file.as_deref(), Some("/tmp/session.sdp"));
    }

    #[test]
    fn bad_values() {
        let e = ClientConfig::from_pairs([("DefaultPort", "abc")]).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::ServiceError);
        assert!(e.to_string().contains("DefaultPort"), "{}", e);
        ClientConfig::from_pairs([("TransportMode", "carrier-pigeon")]).unwrap_err();
    }

    #[test]
    fn transport_mode_round_trip() {
        for m in [
            TransportMode::Udp,
            TransportMode::TcpInterleaved,
            TransportMode::TcpOnlyCritical,
        ] {
            assert_eq!(m.to_string().parse::<TransportMode>().unwrap(), m);
        }
    }
}
