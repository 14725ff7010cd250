// SPDX-License-Identifier: MIT OR Apache-2.0

//! Binding of session descriptions to streams.

use std::net::IpAddr;
use std::num::NonZeroU16;

use base64::Engine as _;
use bytes::Bytes;
use log::{debug, warn};
use url::Url;

use super::migration::{self, StreamCheckpoint};
use super::parse::{join_control, parse_npt_range};
use crate::codec::descriptor::{EsDescriptor, InitialObjectDescriptor, ObjectDescriptor};
use crate::codec::{DecoderConfig, Depacketizer, StreamType};
use crate::config::{ClientConfig, MediaFilter, TransportMode};
use crate::error::ErrorInt;
use crate::Error;

/// Multicast TTL assumed when the `c=` line doesn't give one.
pub(crate) const DEFAULT_MULTICAST_TTL: u8 = 127;

/// A parsed session description, ready to create streams from.
#[derive(Debug)]
pub(crate) struct Description {
    pub(crate) sdp: sdp_types::Session,

    /// Base for relative `a=control` values: the request URL or
    /// `Content-Base`, else an absolute session-level control.
    pub(crate) base_url: Option<Url>,

    /// Aggregate control URL, from session-level `a=control`.
    pub(crate) control: Option<Url>,

    /// Initial object descriptor from `a=mpeg4-iod`.
    pub(crate) iod: Option<Bytes>,
    pub(crate) isma: bool,

    /// Session id and RTSP URL, if this is a migration checkpoint.
    pub(crate) resume: Option<(String, Url)>,

    /// Whether every stream must use interleaved transport.
    pub(crate) force_interleave: bool,
    pub(crate) streams: Vec<StreamDescription>,
}

#[derive(Debug)]
pub(crate) struct StreamDescription {
    pub(crate) media: String,

    /// Index of the `m=` section, which may differ from the index within
    /// [`Description::streams`] when sections were skipped.
    pub(crate) media_index: usize,
    pub(crate) control: Option<Url>,
    pub(crate) es_id: u16,
    pub(crate) payload_type: u8,
    pub(crate) clock_rate: u32,
    pub(crate) depacketizer: Depacketizer,

    /// Destination address from `c=`, if known.
    pub(crate) address: Option<IpAddr>,

    /// TTL, if `address` is a multicast group.
    pub(crate) multicast_ttl: Option<u8>,

    /// Port from the `m=` line.
    pub(crate) port: u16,
    pub(crate) range: Option<(f64, Option<f64>)>,
    pub(crate) checkpoint: Option<StreamCheckpoint>,
}

impl StreamDescription {
    /// Streams other than audio and video don't tolerate loss, so
    /// [`TransportMode::TcpOnlyCritical`] interleaves them.
    pub(crate) fn is_critical(&self) -> bool {
        let t = self.depacketizer.decoder_config().stream_type;
        t != StreamType::AUDIO && t != StreamType::VISUAL
    }
}

/// The decoder config of static payload types without `a=rtpmap`.
fn static_rtpmap(payload_type: u8) -> Option<(&'static str, u32)> {
    match payload_type {
        14 => Some(("MPA", 90_000)),
        32 => Some(("MPV", 90_000)),
        _ => None,
    }
}

fn sdp_err(description: String) -> Error {
    wrap!(ErrorInt::SdpError(description))
}

/// Decodes the value of `a=mpeg4-iod`, a quoted `data:` URL.
fn parse_iod(value: &str) -> Result<Bytes, String> {
    let v = value.trim().trim_matches('"');
    let rest = v
        .strip_prefix("data:")
        .ok_or_else(|| format!("mpeg4-iod {v:?} isn't a data URL"))?;
    let (_, data) = rest
        .split_once(";base64,")
        .ok_or_else(|| format!("mpeg4-iod {v:?} isn't base64-encoded"))?;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| format!("mpeg4-iod has invalid base64 encoding: {e}"))
}

/// Finds the `c=` address for a media section, falling back to the session
/// level and then the `o=` address when it's missing or unspecified.
fn connection_address(
    session: &sdp_types::Session,
    media: &sdp_types::Media,
) -> Result<(Option<IpAddr>, Option<u8>), Error> {
    let Some(c) = media.connections.first().or(session.connection.as_ref()) else {
        return Ok((session.origin.unicast_address.parse().ok(), None));
    };
    if c.nettype != "IN" || (c.addrtype != "IP4" && c.addrtype != "IP6") {
        bail!(ErrorInt::NotSupported(format!(
            "connection {} {}",
            c.nettype, c.addrtype
        )));
    }
    let (addr, ttl) = match c.connection_address.split_once('/') {
        Some((a, rest)) => (a, rest.split('/').next()),
        None => (c.connection_address.as_str(), None),
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| sdp_err(format!("bad connection address {addr:?}")))?;
    if addr.is_unspecified() {
        return Ok((session.origin.unicast_address.parse().ok(), None));
    }
    if !addr.is_multicast() {
        return Ok((Some(addr), None));
    }
    let ttl = ttl
        .and_then(|t| u8::from_str_radix(t, 10).ok())
        .unwrap_or(DEFAULT_MULTICAST_TTL);
    Ok((Some(addr), Some(ttl)))
}

/// Parses the rtpmap, fmtp, and control of one media section and creates
/// its depacketizer.
fn parse_media(
    base_url: Option<&Url>,
    session: &sdp_types::Session,
    media_index: usize,
    es_id: u16,
) -> Result<StreamDescription, Error> {
    let m = &session.medias[media_index];
    let payload_type_str = m.fmt.split_ascii_whitespace().next().unwrap_or_default();
    let payload_type = u8::from_str_radix(payload_type_str, 10)
        .ok()
        .filter(|pt| pt & 0x80 == 0)
        .ok_or_else(|| sdp_err(format!("invalid RTP payload type {payload_type_str:?}")))?;

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    let mut es_id_attr = None;
    let mut range = None;
    let mut checkpoint = None;
    for a in &m.attributes {
        let v = a.value.as_deref();
        match a.attribute.as_str() {
            "rtpmap" | "fmtp" => {
                let (pt, v) = v.and_then(|v| v.split_once(' ')).ok_or_else(|| {
                    sdp_err(format!("invalid {} attribute {:?}", a.attribute, v))
                })?;
                if pt != payload_type_str {
                    continue;
                }
                if a.attribute == "rtpmap" {
                    rtpmap = Some(v.trim());
                } else {
                    fmtp = Some(v.trim());
                }
            }
            "control" => {
                control = match (v, base_url) {
                    (Some(c), Some(base)) => Some(join_control(base, c).map_err(sdp_err)?),
                    (Some(c), None) => Url::parse(c).ok(),
                    (None, _) => None,
                }
            }
            "mpeg4-esid" => {
                es_id_attr = v.and_then(|v| u16::from_str_radix(v.trim(), 10).ok());
            }
            "range" => range = v.and_then(parse_npt_range),
            migration::STREAM_STATE_ATTR => {
                checkpoint = Some(
                    StreamCheckpoint::parse(m.port, v.unwrap_or_default()).map_err(sdp_err)?,
                );
            }
            _ => {}
        }
    }

    let (encoding_name, clock_rate, channels) = match rtpmap {
        Some(rtpmap) => {
            let (e, rest) = rtpmap
                .split_once('/')
                .ok_or_else(|| sdp_err(format!("invalid rtpmap {rtpmap:?}")))?;
            let (clock_rate_str, channels_str) = match rest.split_once('/') {
                Some((c, ch)) => (c, Some(ch)),
                None => (rest, None),
            };
            let clock_rate = u32::from_str_radix(clock_rate_str, 10)
                .map_err(|_| sdp_err(format!("bad clock rate in rtpmap {rtpmap:?}")))?;
            let channels = channels_str
                .map(|c| {
                    u16::from_str_radix(c, 10)
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| sdp_err(format!("invalid channels specification {c:?}")))
                })
                .transpose()?;
            (Some(e), clock_rate, channels)
        }
        None => {
            let (e, clock_rate) = static_rtpmap(payload_type).ok_or_else(|| {
                wrap!(ErrorInt::NotSupported(format!(
                    "{} payload type {} with no rtpmap",
                    m.media, payload_type
                )))
            })?;
            (Some(e), clock_rate, None)
        }
    };
    let depacketizer = Depacketizer::new(
        &m.media,
        encoding_name,
        payload_type,
        clock_rate,
        channels,
        fmtp,
    )?;
    let (address, multicast_ttl) = connection_address(session, m)?;
    Ok(StreamDescription {
        media: m.media.clone(),
        media_index,
        control,
        es_id: es_id_attr.unwrap_or(es_id),
        payload_type,
        clock_rate,
        depacketizer,
        address,
        multicast_ttl,
        port: m.port,
        range,
        checkpoint,
    })
}

/// Parses a session description and binds its usable media sections.
///
/// `base_url` is where the description came from when that was RTSP.
/// Sections with a non-RTP/AVP profile, rejected by `media_filter`, or with
/// no supported payload format are skipped; if none remain, the last error
/// is returned.
pub(crate) fn parse_description(
    raw: &[u8],
    base_url: Option<&Url>,
    config: &ClientConfig,
    media_filter: Option<MediaFilter>,
) -> Result<Description, Error> {
    let sdp = sdp_types::Session::parse(raw).map_err(|e| {
        sdp_err(format!(
            "{}\n\n{:#?}",
            e,
            crate::hex::LimitedHex::new(raw, 1024)
        ))
    })?;

    let mut base_url = base_url.cloned();
    let mut control = None;
    let mut range = None;
    let mut iod = None;
    let mut isma = false;
    let mut session_id = None;
    let mut session_name = None;
    for a in &sdp.attributes {
        let v = a.value.as_deref();
        match a.attribute.as_str() {
            "control" => {
                let Some(c) = v else { continue };
                control = match &base_url {
                    Some(base) => Some(join_control(base, c).map_err(sdp_err)?),
                    None => Url::parse(c).ok(),
                };
                if base_url.is_none() {
                    base_url = control.clone();
                }
            }
            "range" => range = v.and_then(parse_npt_range),
            "mpeg4-iod" => match v.map(parse_iod) {
                Some(Ok(d)) => iod = Some(d),
                Some(Err(e)) => warn!("ignoring unusable IOD: {}", e),
                None => {}
            },
            "isma-compliance" => isma = true,
            migration::SESSION_ID_ATTR => session_id = v.map(str::to_owned),
            migration::SESSION_NAME_ATTR => {
                session_name = v.and_then(|v| Url::parse(v).ok());
            }
            _ => {}
        }
    }

    // A checkpoint's RTSP URL is the base its relative controls resolve against.
    if let (None, Some(u)) = (&base_url, &session_name) {
        base_url = Some(u.clone());
        if control.is_none() {
            control = Some(u.clone());
        }
    }

    let mut streams = Vec::new();
    let mut last_err = None;
    for (i, m) in sdp.medias.iter().enumerate() {
        if m.proto != "RTP/AVP" {
            debug!("skipping {} stream with profile {:?}", m.media, m.proto);
            last_err = Some(wrap!(ErrorInt::NotSupported(format!(
                "profile {:?}",
                m.proto
            ))));
            continue;
        }
        if let Some(f) = media_filter {
            if !f.accepts(&m.media) {
                debug!("skipping {} stream; filtered", m.media);
                continue;
            }
        }
        let es_id = u16::try_from(streams.len() + 1).unwrap_or(u16::MAX);
        match parse_media(base_url.as_ref(), &sdp, i, es_id) {
            Ok(s) => streams.push(s),
            Err(e) => {
                debug!("skipping {} stream {}: {}", m.media, i, e);
                last_err = Some(e);
            }
        }
    }
    for s in &mut streams {
        if s.range.is_none() {
            s.range = range;
        }
    }
    if streams.is_empty() {
        return Err(last_err.unwrap_or_else(|| {
            wrap!(ErrorInt::NotSupported(
                "no usable streams in session description".to_owned()
            ))
        }));
    }

    let port_forces_interleave = matches!(
        base_url.as_ref().and_then(Url::port),
        Some(80) | Some(8080)
    );
    let force_interleave = config.udp_unavailable
        || port_forces_interleave
        || match config.transport_mode {
            TransportMode::Udp => false,
            TransportMode::TcpInterleaved => true,
            TransportMode::TcpOnlyCritical => streams.iter().any(|s| s.is_critical()),
        };

    Ok(Description {
        sdp,
        base_url,
        control,
        iod,
        isma,
        resume: session_id.zip(session_name),
        force_interleave,
        streams,
    })
}

/// What descriptor synthesis needs to know about one stream.
pub(crate) struct DescriptorInput<'a> {
    pub(crate) es_id: u16,
    pub(crate) media: &'a str,
    pub(crate) clock_rate: u32,
    pub(crate) decoder_config: &'a DecoderConfig,
}

fn es_descriptor(s: &DescriptorInput) -> EsDescriptor {
    EsDescriptor {
        es_id: s.es_id,
        depends_on: None,
        ocr_es_id: None,
        decoder_config: s.decoder_config.clone(),
        timestamp_resolution: s.clock_rate,
    }
}

/// One object descriptor per stream, for sessions without an IOD.
pub(crate) fn object_descriptors<'a, I>(streams: I) -> Vec<ObjectDescriptor>
where
    I: IntoIterator<Item = DescriptorInput<'a>>,
{
    streams
        .into_iter()
        .map(|s| ObjectDescriptor {
            id: s.es_id,
            es: vec![es_descriptor(&s)],
        })
        .collect()
}

/// Synthesizes an IOD for "single object" playback of the first stream of
/// `media` type (or the first stream at all).
pub(crate) fn emulate_iod<'a, I>(streams: I, media: Option<MediaFilter>) -> Option<Bytes>
where
    I: IntoIterator<Item = DescriptorInput<'a>>,
{
    let s = streams
        .into_iter()
        .find(|s| media.map_or(true, |f| f.accepts(s.media)))?;
    Some(
        InitialObjectDescriptor {
            id: 1,
            es: vec![es_descriptor(&s)],
        }
        .encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::oti;

    const H264_SDP: &[u8] = b"v=0\r\n\
        o=- 1109162014219182 1 IN IP4 0.0.0.0\r\n\
        s=HIK Media Server V3.0.2\r\n\
        i=HIK Media Server Session Description : standard\r\n\
        e=NONE\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        a=range:npt=now-\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=video\r\n\
        a=fmtp:96 profile-level-id=64001E;packetization-mode=1;\
        sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA\r\n\
        m=application 0 RTP/AVP 107\r\n\
        a=rtpmap:107 vnd.onvif.metadata/90000\r\n\
        a=control:trackID=metadata\r\n";

    #[test]
    fn h264_session() {
        let base = Url::parse("rtsp://192.168.5.106:554/Streaming/Channels/101").unwrap();
        let d = parse_description(H264_SDP, Some(&base), &ClientConfig::default(), None).unwrap();
        assert_eq!(d.control.as_ref(), Some(&base));
        assert_eq!(d.streams[0].range, None);
        assert!(!d.force_interleave);
        assert_eq!(d.streams.len(), 1);
        let s = &d.streams[0];
        assert_eq!(s.media, "video");
        assert_eq!(s.es_id, 1);
        assert_eq!(s.payload_type, 96);
        assert_eq!(s.clock_rate, 90_000);
        assert_eq!(
            s.control.as_ref().unwrap().as_str(),
            "rtsp://192.168.5.106:554/Streaming/Channels/101/trackID=video"
        );
        assert_eq!(s.depacketizer.packetization_mode(), Some(1));
        let config = s.depacketizer.decoder_config();
        assert_eq!(config.stream_type, StreamType::VISUAL);
        assert_eq!(config.object_type_indication, oti::AVC);
        let dsi = config.decoder_specific_info.as_ref().unwrap();
        // avcC: version 1, then profile/compat/level from the SPS.
        assert_eq!(&dsi[..4], &[1, 0x64, 0x00, 0x1e]);
    }

    #[test]
    fn multicast_and_static_payload_types() {
        let sdp = b"v=0\r\n\
            o=- 2890844526 2890842807 IN IP4 10.47.16.5\r\n\
            s=Lecture\r\n\
            c=IN IP4 224.2.17.12/16\r\n\
            t=0 0\r\n\
            a=range:npt=0-120.5\r\n\
            a=mpeg4-iod:\"data:application/mpeg4-iod;base64,AoE=\"\r\n\
            m=audio 49170 RTP/AVP 14\r\n\
            a=mpeg4-esid:101\r\n\
            m=video 51372 RTP/AVP 32\r\n\
            c=IN IP4 10.47.16.9\r\n\
            m=audio 49172 RTP/SAVP 14\r\n";
        let d = parse_description(sdp, None, &ClientConfig::default(), None).unwrap();
        assert_eq!(d.control, None);
        assert_eq!(d.iod.as_deref(), Some(&[0x02, 0x81][..]));
        assert_eq!(d.streams.len(), 2);
        let a = &d.streams[0];
        assert_eq!(a.es_id, 101);
        assert_eq!(a.clock_rate, 90_000);
        assert_eq!(a.address, Some("224.2.17.12".parse().unwrap()));
        assert_eq!(a.multicast_ttl, Some(16));
        assert_eq!(a.port, 49170);
        assert_eq!(a.range, Some((0.0, Some(120.5))));
        let v = &d.streams[1];
        assert_eq!(v.es_id, 2);
        assert_eq!(v.media_index, 1);
        assert_eq!(v.address, Some("10.47.16.9".parse().unwrap()));
        assert_eq!(v.multicast_ttl, None);
        assert_eq!(v.depacketizer.decoder_config().stream_type, StreamType::VISUAL);

        let d = parse_description(
            sdp,
            None,
            &ClientConfig::default(),
            Some(MediaFilter::Video),
        )
        .unwrap();
        assert_eq!(d.streams.len(), 1);
        assert_eq!(d.streams[0].media, "video");
    }

    #[test]
    fn unusable() {
        let sdp = b"v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.1\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=audio 5000 RTP/AVP 0\r\n";
        let e = parse_description(sdp, None, &ClientConfig::default(), None).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NotSupported);

        let e = parse_description(b"garbage", None, &ClientConfig::default(), None).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::UrlError);
    }

    #[test]
    fn interleave_policy() {
        let base = Url::parse("rtsp://example.com:8080/x").unwrap();
        let d = parse_description(H264_SDP, Some(&base), &ClientConfig::default(), None).unwrap();
        assert!(d.force_interleave);

        let base = Url::parse("rtsp://example.com/x").unwrap();
        let critical = ClientConfig::default().with_transport_mode(TransportMode::TcpOnlyCritical);
        let d = parse_description(H264_SDP, Some(&base), &critical, None).unwrap();
        assert!(!d.force_interleave);
        let tcp = ClientConfig::default().with_transport_mode(TransportMode::TcpInterleaved);
        let d = parse_description(H264_SDP, Some(&base), &tcp, None).unwrap();
        assert!(d.force_interleave);
    }

    #[test]
    fn descriptors() {
        let base = Url::parse("rtsp://example.com/x").unwrap();
        let d = parse_description(H264_SDP, Some(&base), &ClientConfig::default(), None).unwrap();
        let inputs = || {
            d.streams.iter().map(|s| DescriptorInput {
                es_id: s.es_id,
                media: &s.media,
                clock_rate: s.clock_rate,
                decoder_config: s.depacketizer.decoder_config(),
            })
        };
        let ods = object_descriptors(inputs());
        assert_eq!(ods.len(), 1);
        assert_eq!(ods[0].id, 1);
        assert_eq!(ods[0].es[0].timestamp_resolution, 90_000);
        let iod = emulate_iod(inputs(), Some(MediaFilter::Video)).unwrap();
        assert_eq!(iod[0], crate::codec::descriptor::tag::INITIAL_OBJECT_DESCRIPTOR);
        assert!(emulate_iod(inputs(), Some(MediaFilter::Audio)).is_none());
    }
}
