// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic (for audio, video, and text media types).
//!
//! This consists of RTP depacketization for each supported payload format,
//! producing sync-layer packets: access units (or fragments of them) tagged
//! with an [`SlHeader`] carrying timing and random-access information. It
//! also derives the [`DecoderConfig`] a downstream decoder needs from the SDP
//! `a=rtpmap` and `a=fmtp` attributes.

use std::collections::VecDeque;
use std::num::NonZeroU16;

use bytes::Bytes;
use log::debug;

use crate::error::ErrorInt;
use crate::rtp::ReceivedPacket;
use crate::Error;

pub(crate) mod aac;
mod amr;
pub mod descriptor;
pub mod fmtp;
mod h263;
pub(crate) mod h264;
mod latm;
mod mpeg12;
mod mpeg4;
mod text;

pub use fmtp::FormatParams;

/// An MPEG-4 systems `streamType`, as in ISO/IEC 14496-1 table 6.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct StreamType(pub u8);

impl StreamType {
    pub const OBJECT_DESCRIPTOR: StreamType = StreamType(0x01);
    pub const CLOCK_REFERENCE: StreamType = StreamType(0x02);
    pub const SCENE: StreamType = StreamType(0x03);
    pub const VISUAL: StreamType = StreamType(0x04);
    pub const AUDIO: StreamType = StreamType(0x05);
    pub const TEXT: StreamType = StreamType(0x0D);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            StreamType::OBJECT_DESCRIPTOR => "ObjectDescriptor",
            StreamType::CLOCK_REFERENCE => "ClockReference",
            StreamType::SCENE => "Scene",
            StreamType::VISUAL => "Visual",
            StreamType::AUDIO => "Audio",
            StreamType::TEXT => "Text",
            _ => return None,
        })
    }
}

impl std::fmt::Debug for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(n) => f.write_str(n),
            None => write!(f, "StreamType(0x{:02x})", self.0),
        }
    }
}

/// `objectTypeIndication` values used when synthesizing decoder configs.
pub mod oti {
    pub const MPEG4_VISUAL: u8 = 0x20;
    pub const AVC: u8 = 0x21;
    pub const MPEG4_AUDIO: u8 = 0x40;
    pub const MPEG2_AUDIO: u8 = 0x69;
    pub const MPEG1_VIDEO: u8 = 0x6A;
    pub const MPEG4_TEXT: u8 = 0x08;

    /// User-private range; used for formats with no registered indication
    /// (AMR, AMR-WB, H.263).
    pub const PRIVATE: u8 = 0x80;
}

/// What a decoder needs to know about an elementary stream.
#[derive(Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub stream_type: StreamType,
    pub object_type_indication: u8,
    pub decoder_specific_info: Option<Bytes>,
}

impl std::fmt::Debug for DecoderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderConfig")
            .field("stream_type", &self.stream_type)
            .field(
                "object_type_indication",
                &format_args!("0x{:02x}", self.object_type_indication),
            )
            .field(
                "decoder_specific_info",
                &self
                    .decoder_specific_info
                    .as_ref()
                    .map(|d| crate::hex::LimitedHex::new(d, 64)),
            )
            .finish()
    }
}

/// The closed set of supported RTP payload formats.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640) and
    /// [RFC 3016](https://datatracker.ietf.org/doc/html/rfc3016) `MP4V-ES`.
    Mpeg4Generic,

    /// [RFC 2250](https://datatracker.ietf.org/doc/html/rfc2250) audio.
    Mpeg12Audio,

    /// [RFC 2250](https://datatracker.ietf.org/doc/html/rfc2250) video.
    Mpeg12Video,

    /// [RFC 4867](https://datatracker.ietf.org/doc/html/rfc4867), octet-aligned only.
    Amr,
    AmrWb,

    /// [RFC 4629](https://datatracker.ietf.org/doc/html/rfc4629).
    H263,

    /// 3GPP timed text, [RFC 4396](https://datatracker.ietf.org/doc/html/rfc4396).
    Text3gpp,

    /// [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184), modes 0 and 1.
    H264,

    /// [RFC 6416](https://datatracker.ietf.org/doc/html/rfc6416) `MP4A-LATM`.
    Latm,
}

impl PayloadKind {
    /// Selects a payload kind from the `a=rtpmap` encoding name, or for static
    /// payload types without one, from the payload type number.
    pub fn from_encoding(encoding_name: Option<&str>, payload_type: u8) -> Option<Self> {
        let Some(name) = encoding_name else {
            return match payload_type {
                14 => Some(PayloadKind::Mpeg12Audio),
                32 => Some(PayloadKind::Mpeg12Video),
                _ => None,
            };
        };
        Some(match &name.to_ascii_lowercase()[..] {
            "mpeg4-generic" | "enc-mpeg4-generic" | "enc-generic-mp4" | "mp4v-es" => {
                PayloadKind::Mpeg4Generic
            }
            "mpa" => PayloadKind::Mpeg12Audio,
            "mpv" => PayloadKind::Mpeg12Video,
            "amr" => PayloadKind::Amr,
            "amr-wb" => PayloadKind::AmrWb,
            "h263-1998" | "h263-2000" => PayloadKind::H263,
            "3gpp-tt" => PayloadKind::Text3gpp,
            "h264" => PayloadKind::H264,
            "mp4a-latm" => PayloadKind::Latm,
            _ => return None,
        })
    }
}

/// ISMACryp fields of one access unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IsmaInfo {
    pub encrypted: bool,

    /// Byte offset of this AU in the encrypted stream.
    pub iv: u64,
    pub key_indicator: Option<u64>,
}

/// Sync-layer header accompanying each [`SlPacket`].
///
/// Timestamps are in the stream's clock rate, extended to 64 bits so they
/// don't wrap.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlHeader {
    pub composition_ts: i64,
    pub decoding_ts: Option<i64>,

    /// This packet holds the first byte of an access unit.
    pub au_start: bool,

    /// This packet holds the last byte of an access unit.
    pub au_end: bool,
    pub random_access: bool,

    /// Access unit sequence number, where the payload format signals one.
    pub sequence_number: u32,

    /// The RTP sequence number the data arrived in.
    pub packet_sequence_number: u16,

    pub au_duration: Option<u32>,
    pub isma: Option<IsmaInfo>,

    /// Normal play time in seconds; filled by the stream, not the
    /// depacketizer.
    pub npt: f64,
}

impl SlHeader {
    fn for_packet(pkt: &ReceivedPacket) -> Self {
        SlHeader {
            composition_ts: pkt.timestamp().timestamp(),
            packet_sequence_number: pkt.sequence_number(),
            ..Default::default()
        }
    }
}

/// An access unit or a fragment of one, as indicated by the header flags.
#[derive(Clone)]
pub struct SlPacket {
    pub data: Bytes,
    pub header: SlHeader,
}

impl std::fmt::Debug for SlPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlPacket")
            .field("header", &self.header)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// Turns RTP packets into [`SlPacket`]s.
pub struct Depacketizer {
    kind: PayloadKind,
    clock_rate: u32,
    config: DecoderConfig,
    unit_duration: u32,
    inner: DepacketizerInner,
    pending: VecDeque<SlPacket>,
}

#[allow(clippy::large_enum_variant)]
enum DepacketizerInner {
    Mpeg4(mpeg4::Depacketizer),
    Mpeg12Audio(mpeg12::AudioDepacketizer),
    Mpeg12Video(mpeg12::VideoDepacketizer),
    Amr(amr::Depacketizer),
    H263(h263::Depacketizer),
    Text(text::Depacketizer),
    H264(h264::Depacketizer),
    Latm(latm::Depacketizer),
}

impl std::fmt::Debug for Depacketizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Depacketizer")
            .field("kind", &self.kind)
            .field("clock_rate", &self.clock_rate)
            .field("config", &self.config)
            .field("unit_duration", &self.unit_duration)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Depacketizer {
    /// Sets up a depacketizer for one `m=` section.
    ///
    /// `fmtp` is the attribute value after the payload type, if any.
    pub fn new(
        media: &str,
        encoding_name: Option<&str>,
        payload_type: u8,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        fmtp: Option<&str>,
    ) -> Result<Self, Error> {
        let params = fmtp.map(FormatParams::parse).unwrap_or_default();
        let Some(kind) = PayloadKind::from_encoding(encoding_name, payload_type) else {
            debug!(
                "no depacketizer for {}/{} (payload type {})",
                media,
                encoding_name.unwrap_or("-"),
                payload_type
            );
            bail!(ErrorInt::NotSupported(format!(
                "no depacketizer for {}/{} (payload type {})",
                media,
                encoding_name.unwrap_or("-"),
                payload_type
            )));
        };
        let params_err = |e: String| wrap!(ErrorInt::FormatParamsError(e));
        let (inner, config) = match kind {
            PayloadKind::Mpeg4Generic => {
                let (d, config) = mpeg4::Depacketizer::new(
                    media,
                    encoding_name.unwrap_or_default(),
                    clock_rate,
                    channels,
                    &params,
                )
                .map_err(params_err)?;
                (DepacketizerInner::Mpeg4(d), config)
            }
            PayloadKind::Mpeg12Audio => (
                DepacketizerInner::Mpeg12Audio(mpeg12::AudioDepacketizer::new(clock_rate)),
                DecoderConfig {
                    stream_type: StreamType::AUDIO,
                    object_type_indication: oti::MPEG2_AUDIO,
                    decoder_specific_info: None,
                },
            ),
            PayloadKind::Mpeg12Video => (
                DepacketizerInner::Mpeg12Video(mpeg12::VideoDepacketizer::default()),
                DecoderConfig {
                    stream_type: StreamType::VISUAL,
                    object_type_indication: oti::MPEG1_VIDEO,
                    decoder_specific_info: None,
                },
            ),
            PayloadKind::Amr | PayloadKind::AmrWb => {
                if !params.get_flag("octet-align") {
                    bail!(ErrorInt::NotSupported(
                        "AMR bandwidth-efficient mode".to_owned()
                    ));
                }
                (
                    DepacketizerInner::Amr(amr::Depacketizer::new(kind == PayloadKind::AmrWb)),
                    DecoderConfig {
                        stream_type: StreamType::AUDIO,
                        object_type_indication: oti::PRIVATE,
                        decoder_specific_info: None,
                    },
                )
            }
            PayloadKind::H263 => (
                DepacketizerInner::H263(h263::Depacketizer::default()),
                DecoderConfig {
                    stream_type: StreamType::VISUAL,
                    object_type_indication: oti::PRIVATE,
                    decoder_specific_info: None,
                },
            ),
            PayloadKind::Text3gpp => {
                let dsi = text::text_config(clock_rate, &params).map_err(params_err)?;
                (
                    DepacketizerInner::Text(text::Depacketizer::default()),
                    DecoderConfig {
                        stream_type: StreamType::TEXT,
                        object_type_indication: oti::MPEG4_TEXT,
                        decoder_specific_info: Some(dsi),
                    },
                )
            }
            PayloadKind::H264 => {
                let (d, config) = h264::Depacketizer::new(&params)?;
                (DepacketizerInner::H264(d), config)
            }
            PayloadKind::Latm => {
                if params.get_u32("cpresent").map_err(params_err)?.unwrap_or(0) != 0 {
                    bail!(ErrorInt::NotSupported(
                        "MP4A-LATM with in-band configuration".to_owned()
                    ));
                }
                let config = latm::decoder_config(&params)?;
                (DepacketizerInner::Latm(latm::Depacketizer::default()), config)
            }
        };
        let unit_duration = unit_duration(&config, &params, clock_rate);
        let inner = match inner {
            DepacketizerInner::Mpeg4(d) => DepacketizerInner::Mpeg4(d.with_unit_duration(unit_duration)),
            DepacketizerInner::Latm(d) => DepacketizerInner::Latm(d.with_unit_duration(unit_duration)),
            other => other,
        };
        Ok(Depacketizer {
            kind,
            clock_rate,
            config,
            unit_duration,
            inner,
            pending: VecDeque::new(),
        })
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn decoder_config(&self) -> &DecoderConfig {
        &self.config
    }

    /// The duration of one access unit in clock rate units, or 0 if unknown.
    pub fn unit_duration(&self) -> u32 {
        self.unit_duration
    }

    /// For H.264, the signaled `packetization-mode`.
    pub fn packetization_mode(&self) -> Option<u8> {
        match &self.inner {
            DepacketizerInner::H264(d) => Some(d.packetization_mode()),
            _ => None,
        }
    }

    /// Feeds one packet. On error, anything partially reassembled is dropped
    /// and the next packet is parsed afresh.
    pub fn push(&mut self, pkt: &ReceivedPacket) -> Result<(), String> {
        let out = &mut self.pending;
        let r = match &mut self.inner {
            DepacketizerInner::Mpeg4(d) => d.push(pkt, out),
            DepacketizerInner::Mpeg12Audio(d) => d.push(pkt, out),
            DepacketizerInner::Mpeg12Video(d) => d.push(pkt, out),
            DepacketizerInner::Amr(d) => d.push(pkt, out),
            DepacketizerInner::H263(d) => d.push(pkt, out),
            DepacketizerInner::Text(d) => d.push(pkt, out),
            DepacketizerInner::H264(d) => d.push(pkt, out),
            DepacketizerInner::Latm(d) => d.push(pkt, out),
        };
        if r.is_err() {
            self.reset_inner();
        }
        r
    }

    pub fn pull(&mut self) -> Option<SlPacket> {
        self.pending.pop_front()
    }

    /// Drops partial state; the next packet starts a new access unit.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.reset_inner();
    }

    fn reset_inner(&mut self) {
        match &mut self.inner {
            DepacketizerInner::Mpeg4(d) => d.reset(),
            DepacketizerInner::Mpeg12Audio(d) => d.reset(),
            DepacketizerInner::Mpeg12Video(d) => d.reset(),
            DepacketizerInner::Amr(_) | DepacketizerInner::Latm(_) => {}
            DepacketizerInner::H263(_) => {}
            DepacketizerInner::Text(d) => d.reset(),
            DepacketizerInner::H264(d) => d.reset(),
        }
    }

    /// Discards H.264 NALs until the next IDR. No-op for other formats.
    pub fn set_wait_rap(&mut self) {
        if let DepacketizerInner::H264(d) = &mut self.inner {
            d.set_wait_rap();
        }
    }
}

/// Picks the duration of one access unit in `clock_rate` ticks: the AAC
/// frame length when an `AudioSpecificConfig` is available, else
/// `ConstantDuration`, else 0.
fn unit_duration(config: &DecoderConfig, params: &FormatParams, clock_rate: u32) -> u32 {
    if config.object_type_indication == oti::MPEG4_AUDIO {
        if let Some(asc) = config
            .decoder_specific_info
            .as_ref()
            .and_then(|dsi| aac::AudioSpecificConfig::parse(dsi).ok())
        {
            debug!(
                "AAC at {} Hz, {} channels, {} samples per frame",
                asc.sampling_frequency,
                asc.channels.channels,
                asc.frame_length
            );
            let samples = u64::from(asc.frame_length.get());
            if asc.sampling_frequency == 0 || asc.sampling_frequency == clock_rate {
                return samples as u32;
            }
            // The RTP clock need not run at the sampling rate.
            let ticks = samples * u64::from(clock_rate) / u64::from(asc.sampling_frequency);
            return u32::try_from(ticks).unwrap_or(u32::MAX);
        }
    }
    params
        .get_u32("constantduration")
        .ok()
        .flatten()
        .unwrap_or(0)
}

/// Pushes one output packet.
fn emit(out: &mut VecDeque<SlPacket>, data: Bytes, header: &SlHeader) {
    out.push_back(SlPacket {
        data,
        header: header.clone(),
    });
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::rtp::{Header, ReceivedPacket};
    use crate::Timestamp;

    /// Builds a packet at 90 kHz (or `clock_rate`) for depacketizer tests.
    pub(crate) fn pkt(
        clock_rate: u32,
        sequence_number: u16,
        timestamp: i64,
        mark: bool,
        payload: &[u8],
    ) -> ReceivedPacket {
        let header = Header {
            sequence_number,
            timestamp: 0,
            payload_type: 96,
            ssrc: 0x4cacc3d1,
            mark,
        };
        let clock_rate = std::num::NonZeroU32::new(clock_rate).unwrap();
        let timestamp = Timestamp::new(timestamp, clock_rate, 0).unwrap();
        ReceivedPacket::synthetic(header, timestamp, payload).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kinds() {
        assert_eq!(
            PayloadKind::from_encoding(Some("MPEG4-GENERIC"), 96),
            Some(PayloadKind::Mpeg4Generic)
        );
        assert_eq!(
            PayloadKind::from_encoding(Some("H263-2000"), 96),
            Some(PayloadKind::H263)
        );
        assert_eq!(
            PayloadKind::from_encoding(None, 14),
            Some(PayloadKind::Mpeg12Audio)
        );
        assert_eq!(PayloadKind::from_encoding(None, 0), None);
        assert_eq!(PayloadKind::from_encoding(Some("PCMU"), 0), None);
    }

    #[test]
    fn setup_rejections() {
        let e = Depacketizer::new("audio", Some("PCMU"), 0, 8000, None, None).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NotSupported);
        let e = Depacketizer::new("audio", Some("AMR"), 97, 8000, None, None).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NotSupported);
        let e = Depacketizer::new(
            "audio",
            Some("MP4A-LATM"),
            96,
            44100,
            None,
            Some("cpresent=1"),
        )
        .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NotSupported);
        let e = Depacketizer::new("text", Some("3gpp-tt"), 99, 1000, None, Some("width=176"))
            .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NonCompliantBitstream);
    }

    #[test]
    fn aac_unit_duration() {
        let d = Depacketizer::new(
            "audio",
            Some("mpeg4-generic"),
            96,
            48_000,
            NonZeroU16::new(1),
            Some("streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1188"),
        )
        .unwrap();
        assert_eq!(d.kind(), PayloadKind::Mpeg4Generic);
        assert_eq!(d.unit_duration(), 1024);
        assert_eq!(d.decoder_config().stream_type, StreamType::AUDIO);
        assert_eq!(d.decoder_config().object_type_indication, oti::MPEG4_AUDIO);

        // 48 kHz audio on a 90 kHz clock.
        let d = Depacketizer::new(
            "audio",
            Some("mpeg4-generic"),
            96,
            90_000,
            NonZeroU16::new(1),
            Some("streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1188"),
        )
        .unwrap();
        assert_eq!(d.unit_duration(), 1920);
    }
}
