// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic MPEG-4 elementary streams, as in
//! [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640) (`mpeg4-generic`,
//! optionally ISMACryp-protected as `enc-mpeg4-generic`) and
//! [RFC 3016](https://datatracker.ietf.org/doc/html/rfc3016) visual (`MP4V-ES`).

use std::collections::VecDeque;
use std::num::NonZeroU16;

use bitstream_io::BitRead;
use bytes::Bytes;

use super::{emit, oti, DecoderConfig, FormatParams, IsmaInfo, SlHeader, SlPacket, StreamType};
use crate::rtp::ReceivedPacket;

/// ISMACryp AU header fields, in bytes as signaled.
#[derive(Debug, Default)]
struct IsmaLayout {
    selective_encryption: bool,
    iv_length: u32,
    iv_delta_length: u32,
    key_indicator_length: u32,
    key_indicator_per_au: bool,
}

/// AU header field widths in bits, from the `fmtp` line.
#[derive(Debug, Default)]
struct Layout {
    size_length: u32,
    index_length: u32,
    index_delta_length: u32,
    cts_delta_length: u32,
    dts_delta_length: u32,
    random_access_indication: bool,
    stream_state_indication: u32,
    auxiliary_data_size_length: u32,
    constant_size: u32,
    constant_duration: u32,
    isma: Option<IsmaLayout>,

    /// Minimum bits of the first AU header, or 0 if there's no AU header section.
    first_header_bits: u32,

    /// Minimum bits of each following AU header.
    header_bits: u32,
}

impl Layout {
    fn parse(params: &FormatParams, encrypted: bool) -> Result<Self, String> {
        let u = |k: &str| params.get_u32(k).map(Option::unwrap_or_default);
        let mut l = Layout {
            size_length: u("sizelength")?,
            index_length: u("indexlength")?,
            index_delta_length: u("indexdeltalength")?,
            cts_delta_length: u("ctsdeltalength")?,
            dts_delta_length: u("dtsdeltalength")?,
            random_access_indication: u("randomaccessindication")? != 0,
            stream_state_indication: u("streamstateindication")?,
            auxiliary_data_size_length: u("auxiliarydatasizelength")?,
            constant_size: u("constantsize")?,
            constant_duration: u("constantduration")?,
            isma: None,
            first_header_bits: 0,
            header_bits: 0,
        };
        for (name, bits) in [
            ("sizeLength", l.size_length),
            ("indexLength", l.index_length),
            ("indexDeltaLength", l.index_delta_length),
            ("CTSDeltaLength", l.cts_delta_length),
            ("DTSDeltaLength", l.dts_delta_length),
            ("streamStateIndication", l.stream_state_indication),
            ("auxiliaryDataSizeLength", l.auxiliary_data_size_length),
        ] {
            if bits > 32 {
                return Err(format!("{name}={bits} is too large"));
            }
        }
        let mut bits = 0;
        if encrypted {
            let isma = IsmaLayout {
                selective_encryption: params.get_flag("ismacrypselectiveencryption"),
                iv_length: params.get_u32("ismacrypivlength")?.unwrap_or(4).clamp(1, 8),
                iv_delta_length: u("ismacrypdeltaivlength")?.min(8),
                key_indicator_length: u("ismacrypkeyindicatorlength")?.min(8),
                key_indicator_per_au: params.get_flag("ismacrypkeyindicatorperau"),
            };
            bits += if isma.selective_encryption {
                8
            } else {
                8 * (isma.iv_length + isma.key_indicator_length)
            };
            l.isma = Some(isma);
        }
        bits += l.cts_delta_length
            + l.dts_delta_length
            + l.size_length
            + u32::from(l.random_access_indication)
            + l.stream_state_indication;
        l.first_header_bits = bits + l.index_length;
        l.header_bits = bits + l.index_delta_length;
        Ok(l)
    }
}

#[derive(Debug)]
pub(super) struct Depacketizer {
    layout: Layout,
    unit_duration: u32,

    /// Scan for VOP start codes to find random access points.
    check_rap: bool,

    /// The previous packet had the marker bit, so this one starts an AU.
    new_au: bool,

    isma_offset: u64,
}

fn read_bits<R: BitRead>(r: &mut R, bits: u32, what: &str) -> Result<u64, String> {
    if bits == 0 {
        return Ok(0);
    }
    r.read::<u64>(bits)
        .map_err(|_| format!("AU header section too short reading {what}"))
}

impl Depacketizer {
    pub(super) fn new(
        media: &str,
        encoding_name: &str,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        params: &FormatParams,
    ) -> Result<(Self, DecoderConfig), String> {
        let encrypted = encoding_name.eq_ignore_ascii_case("enc-mpeg4-generic")
            || encoding_name.eq_ignore_ascii_case("enc-generic-mp4");
        let layout = Layout::parse(params, encrypted)?;

        let mut stream_type = params.get_u32("streamtype")?.map(|t| StreamType(t as u8));
        let mut object_type = params.get_u32("objecttype")?.map(|t| t as u8);
        if let Some(mode) = params.get("mode") {
            match &mode.to_ascii_lowercase()[..] {
                "aac-hbr" | "aac-lbr" | "celp-vbr" | "celp-cbr" => {
                    stream_type = Some(StreamType::AUDIO);
                    object_type = Some(oti::MPEG4_AUDIO);
                }
                "avc-video" => {
                    stream_type = Some(StreamType::VISUAL);
                    object_type = Some(oti::AVC);
                }
                _ => {}
            }
        }
        if encoding_name.eq_ignore_ascii_case("mp4v-es") {
            stream_type = Some(StreamType::VISUAL);
            object_type = Some(oti::MPEG4_VISUAL);
        }
        let stream_type = stream_type.unwrap_or(match media {
            "audio" => StreamType::AUDIO,
            "video" => StreamType::VISUAL,
            _ => StreamType::SCENE,
        });
        let object_type = object_type.unwrap_or(0);

        let mut dsi = params.get_hex("config")?;
        if dsi.is_none() && object_type == oti::MPEG4_AUDIO {
            dsi = Some(super::aac::default_config(
                clock_rate,
                channels.map(NonZeroU16::get).unwrap_or(1),
            ));
        }
        let check_rap = stream_type == StreamType::VISUAL
            && object_type == oti::MPEG4_VISUAL
            && !layout.random_access_indication;
        Ok((
            Depacketizer {
                layout,
                unit_duration: 0,
                check_rap,
                new_au: true,
                isma_offset: 0,
            },
            DecoderConfig {
                stream_type,
                object_type_indication: object_type,
                decoder_specific_info: dsi.map(Bytes::from),
            },
        ))
    }

    pub(super) fn with_unit_duration(self, unit_duration: u32) -> Self {
        Depacketizer {
            unit_duration,
            ..self
        }
    }

    pub(super) fn reset(&mut self) {
        self.new_au = true;
    }

    pub(super) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();
        let ts = pkt.timestamp().timestamp();
        let l = &self.layout;

        // AU-headers-length, then the AU headers themselves.
        let mut header_bits_left: i64 = 0;
        let mut pay_start = 0;
        let headers = if l.first_header_bits > 0 {
            if payload.len() < 2 {
                return Err("missing AU-headers-length".into());
            }
            header_bits_left = i64::from(u16::from_be_bytes([payload[0], payload[1]]));
            pay_start = 2 + (header_bits_left as usize + 7) / 8;
            if pay_start > payload.len() {
                return Err(format!(
                    "AU headers of {header_bits_left} bits extend past payload of {} bytes",
                    payload.len()
                ));
            }
            &payload[2..pay_start]
        } else {
            &payload[..0]
        };
        if l.auxiliary_data_size_length > 0 {
            let mut r = bitstream_io::BitReader::endian(&payload[pay_start..], bitstream_io::BigEndian);
            let aux_bits = read_bits(&mut r, l.auxiliary_data_size_length, "auxiliary size")?;
            pay_start += (l.auxiliary_data_size_length as usize + aux_bits as usize + 7) / 8;
            if pay_start > payload.len() {
                return Err("auxiliary section extends past payload".into());
            }
        }

        let mut r = bitstream_io::BitReader::endian(headers, bitstream_io::BigEndian);
        let mut hdr = SlHeader::for_packet(pkt);
        let mut first_idx = 0;
        let mut au_idx = 0;
        let mut num_au = 0u32;
        loop {
            let remaining = payload.len() - pay_start;
            let mut au_size = if l.constant_size > 0 {
                (l.constant_size as usize).min(remaining)
            } else {
                remaining
            };
            let header_bits = if num_au == 0 {
                l.first_header_bits
            } else {
                l.header_bits
            };
            hdr.au_start = self.new_au || num_au > 0;
            hdr.au_duration = (self.unit_duration > 0).then_some(self.unit_duration);
            if header_bits > 0 {
                if let Some(isma) = &l.isma {
                    let mut info = IsmaInfo {
                        encrypted: true,
                        iv: self.isma_offset,
                        key_indicator: None,
                    };
                    if isma.selective_encryption {
                        info.encrypted = read_bits(&mut r, 1, "encryption flag")? != 0;
                        read_bits(&mut r, 7, "reserved")?;
                        header_bits_left -= 8;
                    }
                    if num_au == 0 {
                        info.iv = read_bits(&mut r, 8 * isma.iv_length, "IV")?;
                        header_bits_left -= i64::from(8 * isma.iv_length);
                    } else if isma.iv_delta_length > 0 {
                        info.iv += read_bits(&mut r, 8 * isma.iv_delta_length, "IV delta")?;
                        header_bits_left -= i64::from(8 * isma.iv_delta_length);
                    }
                    if isma.key_indicator_length > 0 && (num_au == 0 || isma.key_indicator_per_au)
                    {
                        info.key_indicator = Some(read_bits(
                            &mut r,
                            8 * isma.key_indicator_length,
                            "key indicator",
                        )?);
                        header_bits_left -= i64::from(8 * isma.key_indicator_length);
                    }
                    self.isma_offset = info.iv;
                    hdr.isma = Some(info);
                }
                if l.size_length > 0 {
                    au_size = (read_bits(&mut r, l.size_length, "AU-size")? as usize).min(remaining);
                    header_bits_left -= i64::from(l.size_length);
                }
                if num_au == 0 {
                    au_idx = read_bits(&mut r, l.index_length, "AU-Index")? as i64;
                    first_idx = au_idx;
                    header_bits_left -= i64::from(l.index_length);
                } else {
                    au_idx += 1 + read_bits(&mut r, l.index_delta_length, "AU-Index-delta")? as i64;
                    header_bits_left -= i64::from(l.index_delta_length);
                }
                let derived_cts = ts + (au_idx - first_idx) * i64::from(self.unit_duration);
                hdr.composition_ts = derived_cts;
                if l.cts_delta_length > 0 {
                    let flag = read_bits(&mut r, 1, "CTS-flag")? != 0;
                    header_bits_left -= 1;
                    if flag {
                        hdr.composition_ts =
                            ts + read_bits(&mut r, l.cts_delta_length, "CTS-delta")? as i64;
                        header_bits_left -= i64::from(l.cts_delta_length);
                    }
                }
                hdr.decoding_ts = None;
                if l.dts_delta_length > 0 {
                    let flag = read_bits(&mut r, 1, "DTS-flag")? != 0;
                    header_bits_left -= 1;
                    if flag {
                        let off = read_bits(&mut r, l.dts_delta_length, "DTS-delta")? as i64;
                        hdr.decoding_ts = Some(hdr.composition_ts - off);
                        header_bits_left -= i64::from(l.dts_delta_length);
                    }
                }
                hdr.random_access = if l.random_access_indication {
                    header_bits_left -= 1;
                    read_bits(&mut r, 1, "RAP-flag")? != 0
                } else {
                    true
                };
                if l.stream_state_indication > 0 {
                    hdr.sequence_number =
                        read_bits(&mut r, l.stream_state_indication, "Stream-state")? as u32;
                    header_bits_left -= i64::from(l.stream_state_indication);
                }
            } else {
                if num_au > 0 {
                    hdr.composition_ts += i64::from(l.constant_duration);
                }
                hdr.random_access = !self.check_rap;
            }

            if hdr.au_start && self.check_rap {
                hdr.random_access = is_vop_rap(&payload[pay_start..pay_start + au_size]);
            }
            let more = header_bits_left >= i64::from(l.header_bits)
                && pay_start + au_size < payload.len()
                && (l.header_bits > 0 || l.constant_size > 0);
            hdr.au_end = pkt.mark() || more;
            emit(out, payload.slice(pay_start..pay_start + au_size), &hdr);
            if let Some(isma) = hdr.isma.as_mut() {
                isma.iv += au_size as u64;
                self.isma_offset = isma.iv;
            }
            if !more {
                break;
            }
            pay_start += au_size;
            num_au += 1;
        }
        self.new_au = pkt.mark();
        Ok(())
    }
}

/// Looks for a VOP start code; an I-VOP is a random access point.
fn is_vop_rap(data: &[u8]) -> bool {
    data.windows(5)
        .find(|w| w[..4] == [0, 0, 1, 0xB6])
        .map(|w| w[4] & 0xC0 == 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::pkt;
    use super::*;

    fn aac_hbr() -> Depacketizer {
        let (d, config) = Depacketizer::new(
            "audio",
            "mpeg4-generic",
            48_000,
            None,
            &FormatParams::parse(
                "streamtype=5;mode=AAC-hbr;config=1188;sizelength=13;indexlength=3;indexdeltalength=3",
            ),
        )
        .unwrap();
        assert_eq!(config.object_type_indication, oti::MPEG4_AUDIO);
        assert_eq!(&config.decoder_specific_info.unwrap()[..], b"\x11\x88");
        d.with_unit_duration(1024)
    }

    #[test]
    fn aac_aggregate() {
        let mut d = aac_hbr();
        let mut out = VecDeque::new();
        // Two AU headers of 16 bits: size 3 idx 0, size 2 idx-delta 0.
        let payload = b"\x00\x20\x00\x18\x00\x10abcde";
        d.push(&pkt(48_000, 1, 0, true, payload), &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].data[..], b"abc");
        assert_eq!(out[0].header.composition_ts, 0);
        assert!(out[0].header.au_start && out[0].header.au_end);
        assert_eq!(&out[1].data[..], b"de");
        assert_eq!(out[1].header.composition_ts, 1024);
        assert!(out[1].header.random_access);
    }

    #[test]
    fn fragmented_au() {
        let mut d = aac_hbr();
        let mut out = VecDeque::new();
        // AU-size 6 signaled, but only 3 bytes in each packet.
        d.push(&pkt(48_000, 1, 0, false, b"\x00\x10\x00\x30abc"), &mut out)
            .unwrap();
        d.push(&pkt(48_000, 2, 0, true, b"\x00\x10\x00\x30def"), &mut out)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].header.au_start && !out[0].header.au_end);
        assert!(!out[1].header.au_start && out[1].header.au_end);
        assert_eq!(&out[1].data[..], b"def");
    }

    #[test]
    fn truncated_headers() {
        let mut d = aac_hbr();
        let mut out = VecDeque::new();
        d.push(&pkt(48_000, 1, 0, true, b"\x00\x40\x00"), &mut out)
            .unwrap_err();
        assert!(out.is_empty());
    }

    #[test]
    fn mp4v_rap() {
        let (mut d, config) = Depacketizer::new(
            "video",
            "MP4V-ES",
            90_000,
            None,
            &FormatParams::parse("profile-level-id=1;config=000001B001"),
        )
        .unwrap();
        assert_eq!(config.stream_type, StreamType::VISUAL);
        assert_eq!(config.object_type_indication, oti::MPEG4_VISUAL);
        let mut out = VecDeque::new();
        // I-VOP (coding type 00) split over two packets.
        d.push(&pkt(90_000, 1, 0, false, b"\x00\x00\x01\xb6\x10\x11"), &mut out)
            .unwrap();
        d.push(&pkt(90_000, 2, 0, true, b"\x22\x33"), &mut out).unwrap();
        // P-VOP.
        d.push(&pkt(90_000, 3, 3000, true, b"\x00\x00\x01\xb6\x50\x11"), &mut out)
            .unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].header.au_start && out[0].header.random_access);
        assert!(!out[1].header.au_start && out[1].header.au_end);
        assert!(out[2].header.au_start && !out[2].header.random_access);
    }

    #[test]
    fn isma_iv() {
        let (mut d, _) = Depacketizer::new(
            "audio",
            "enc-mpeg4-generic",
            48_000,
            None,
            &FormatParams::parse(
                "mode=AAC-hbr;config=1188;sizelength=13;indexlength=3;indexdeltalength=3;\
                 ISMACrypIVLength=4",
            ),
        )
        .unwrap();
        let mut out = VecDeque::new();
        // 48 header bits: 32-bit IV of 0x100, then AU-size 3 / index 0.
        let payload = b"\x00\x30\x00\x00\x01\x00\x00\x18xyz";
        d.push(&pkt(48_000, 1, 0, true, payload), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        let isma = out[0].header.isma.as_ref().unwrap();
        assert!(isma.encrypted);
        assert_eq!(isma.iv, 0x100);
        assert_eq!(&out[0].data[..], b"xyz");
    }
}
