// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video.

use std::collections::VecDeque;

use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use h264_reader::nal::{NalHeader, UnitType};
use log::debug;

use super::{emit, oti, DecoderConfig, FormatParams, SlHeader, SlPacket, StreamType};
use crate::error::ErrorInt;
use crate::rtp::ReceivedPacket;
use crate::Error;

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// A depacketizer for [RFC 6184](https://tools.ietf.org/html/rfc6184)
/// single NAL unit mode and non-interleaved mode.
///
/// Each NAL is emitted as its own [`SlPacket`] prefixed by a 4-byte
/// big-endian length (matching the `avcC` written to the decoder config) or,
/// when the SDP carries no parameter sets, by an Annex B start code.
///
/// This doesn't inspect the contents of the NAL units beyond their headers.
/// A new access unit starts whenever the RTP timestamp changes.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    packetization_mode: u8,
    annex_b: bool,

    /// Discard non-IDR NALs until the next IDR, as after a seek.
    wait_rap: bool,

    last_ts: Option<i64>,

    /// The next emitted NAL is the first of its access unit.
    au_start: bool,
    random_access: bool,

    /// FU-A reassembly: 4 placeholder bytes for the prefix, then the NAL.
    fu: Option<BytesMut>,
}

impl Depacketizer {
    pub(crate) fn new(params: &FormatParams) -> Result<(Self, DecoderConfig), Error> {
        let params_err = |e: String| wrap!(ErrorInt::FormatParamsError(e));
        let packetization_mode = params
            .get_u32("packetization-mode")
            .map_err(params_err)?
            .unwrap_or(0);
        if packetization_mode == 2 {
            bail!(ErrorInt::NotSupported(
                "H.264 interleaved mode (packetization-mode=2)".to_owned()
            ));
        }
        if packetization_mode > 2 {
            bail!(ErrorInt::FormatParamsError(format!(
                "bad H.264 packetization-mode={packetization_mode}"
            )));
        }
        let (spss, ppss) = match params.get("sprop-parameter-sets") {
            Some(s) => parse_parameter_sets(s).map_err(params_err)?,
            None => (Vec::new(), Vec::new()),
        };
        let avcc = if spss.is_empty() || ppss.is_empty() {
            debug!("no SPS/PPS in sprop-parameter-sets; using Annex B start codes");
            None
        } else {
            let profile_level_id = match params.get_hex("profile-level-id") {
                Ok(Some(p)) if p.len() == 3 => [p[0], p[1], p[2]],
                _ => {
                    // Some cameras send a malformed profile-level-id; the SPS has the same bytes.
                    let sps = &spss[0];
                    if sps.len() < 4 {
                        return Err(params_err(format!("SPS too short: {} bytes", sps.len())));
                    }
                    [sps[1], sps[2], sps[3]]
                }
            };
            Some(avc_decoder_config(profile_level_id, &spss, &ppss).map_err(params_err)?)
        };
        Ok((
            Depacketizer {
                packetization_mode: packetization_mode as u8,
                annex_b: avcc.is_none(),
                wait_rap: false,
                last_ts: None,
                au_start: true,
                random_access: false,
                fu: None,
            },
            DecoderConfig {
                stream_type: StreamType::VISUAL,
                object_type_indication: oti::AVC,
                decoder_specific_info: avcc,
            },
        ))
    }

    pub(crate) fn packetization_mode(&self) -> u8 {
        self.packetization_mode
    }

    pub(crate) fn set_wait_rap(&mut self) {
        self.wait_rap = true;
    }

    pub(crate) fn reset(&mut self) {
        self.last_ts = None;
        self.au_start = true;
        self.random_access = false;
        self.fu = None;
    }

    fn header(&self, pkt: &ReceivedPacket, au_end: bool) -> SlHeader {
        SlHeader {
            au_start: self.au_start,
            au_end,
            random_access: self.random_access,
            ..SlHeader::for_packet(pkt)
        }
    }

    /// Notes the NAL type of a new NAL. Returns false if it should be dropped.
    fn check_rap(&mut self, nal_header: u8) -> Result<bool, String> {
        let h = NalHeader::new(nal_header).map_err(|_| format!("bad NAL header {nal_header:02x}"))?;
        if h.nal_unit_type() == UnitType::SliceLayerWithoutPartitioningIdr {
            self.random_access = true;
            self.wait_rap = false;
        }
        Ok(!self.wait_rap)
    }

    fn emit_nal(&mut self, pkt: &ReceivedPacket, nal: &[u8], au_end: bool, out: &mut VecDeque<SlPacket>) {
        let mut data = BytesMut::with_capacity(4 + nal.len());
        if self.annex_b {
            data.put_slice(&ANNEX_B_START_CODE);
        } else {
            data.put_u32(nal.len() as u32);
        }
        data.put_slice(nal);
        emit(out, data.freeze(), &self.header(pkt, au_end));
        self.au_start = false;
    }

    /// Emits the NAL under FU-A reassembly, if any.
    fn flush_fu(&mut self, pkt: &ReceivedPacket, au_end: bool, out: &mut VecDeque<SlPacket>) {
        let Some(mut data) = self.fu.take() else {
            return;
        };
        if self.annex_b {
            data[..4].copy_from_slice(&ANNEX_B_START_CODE);
        } else {
            let len = (data.len() - 4) as u32;
            data[..4].copy_from_slice(&len.to_be_bytes());
        }
        emit(out, data.freeze(), &self.header(pkt, au_end));
        self.au_start = false;
        self.random_access = false;
    }

    pub(crate) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();
        if payload.is_empty() {
            return Err("empty H.264 payload".into());
        }
        let ts = pkt.timestamp().timestamp();
        if self.last_ts != Some(ts) {
            // Its rest is lost, and it can't be timed as part of this AU.
            if self.fu.take().is_some() {
                debug!(
                    "dropping FU-A NAL left incomplete at timestamp {:?}",
                    self.last_ts
                );
            }
            self.last_ts = Some(ts);
            self.au_start = true;
            self.random_access = false;
        }
        let nal_type = payload[0] & 0x1F;
        if nal_type != 28 && self.fu.is_some() {
            debug!("NAL type {} before end of FU-A; flushing incomplete NAL", nal_type);
            self.flush_fu(pkt, false, out);
        }
        match nal_type {
            1..=23 => {
                if self.check_rap(payload[0])? {
                    self.emit_nal(pkt, &payload, pkt.mark(), out);
                }
            }
            24 => {
                // STAP-A: 16-bit size, then the NAL, repeated.
                let mut rest = &payload[1..];
                while !rest.is_empty() {
                    if rest.len() < 2 {
                        return Err(format!("STAP-A has {} trailing bytes", rest.len()));
                    }
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    if len == 0 || rest.len() < 2 + len {
                        return Err(format!(
                            "STAP-A NAL of {len} bytes with {} remaining",
                            rest.len() - 2
                        ));
                    }
                    let nal = &rest[2..2 + len];
                    rest = &rest[2 + len..];
                    if self.check_rap(nal[0])? {
                        self.emit_nal(pkt, nal, pkt.mark() && rest.is_empty(), out);
                    }
                }
            }
            28 => {
                // FU-A: FU indicator, FU header, then a piece of the NAL.
                if payload.len() < 3 {
                    return Err(format!("FU-A too short: {} bytes", payload.len()));
                }
                let start = (payload[1] & 0x80) != 0;
                let end = (payload[1] & 0x40) != 0;
                if start && self.fu.is_some() {
                    debug!("FU-A start before end of previous NAL; flushing incomplete NAL");
                    self.flush_fu(pkt, false, out);
                }
                let nal_header = (payload[0] & 0xE0) | (payload[1] & 0x1F);
                if !self.check_rap(nal_header & 0x7F)? {
                    return Ok(());
                }
                let fu = self.fu.get_or_insert_with(|| {
                    let mut b = BytesMut::with_capacity(4 + 2 * payload.len());
                    b.put_slice(&[0; 4]);
                    // Flag the NAL as damaged if its start was lost.
                    b.put_u8(if start { nal_header } else { nal_header | 0x80 });
                    b
                });
                fu.put_slice(&payload[2..]);
                if end || pkt.mark() {
                    self.flush_fu(pkt, pkt.mark(), out);
                }
            }
            _ => {
                return Err(format!(
                    "unsupported NAL type {nal_type} in packetization-mode={}",
                    self.packetization_mode
                ))
            }
        }
        Ok(())
    }
}

/// Decodes `sprop-parameter-sets` into (SPSs, PPSs). Other NAL types are ignored.
fn parse_parameter_sets(sprop: &str) -> Result<(Vec<Bytes>, Vec<Bytes>), String> {
    let mut spss = Vec::new();
    let mut ppss = Vec::new();
    for nal in sprop.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let nal = base64::engine::general_purpose::STANDARD
            .decode(nal)
            .map_err(|_| "NAL has invalid base64 encoding".to_owned())?;

        // GW security GW4089IP leaves Annex B start codes at the end of both
        // SPS and PPS in the sprop-parameter-sets. Strip them out.
        let nal = Bytes::from(
            nal.strip_suffix(&ANNEX_B_START_CODE[..])
                .map(<[u8]>::to_vec)
                .unwrap_or(nal),
        );
        let Some(&first) = nal.first() else {
            return Err("empty NAL".into());
        };
        let header = NalHeader::new(first).map_err(|_| format!("bad NAL header {first:02x}"))?;
        match header.nal_unit_type() {
            UnitType::SeqParameterSet | UnitType::SubsetSeqParameterSet => spss.push(nal),
            UnitType::PicParameterSet => ppss.push(nal),
            t => debug!("ignoring {t:?} in sprop-parameter-sets"),
        }
    }
    Ok((spss, ppss))
}

/// Writes an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 section 5.2.4.1)
/// with 4-byte NAL lengths.
fn avc_decoder_config(
    profile_level_id: [u8; 3],
    spss: &[Bytes],
    ppss: &[Bytes],
) -> Result<Bytes, String> {
    let len = 7 + spss.iter().chain(ppss).map(|n| 2 + n.len()).sum::<usize>();
    let mut c = BytesMut::with_capacity(len);
    c.put_u8(1); // configurationVersion
    c.put_slice(&profile_level_id);
    c.put_u8(0xFF); // reserved(6) lengthSizeMinusOne=3
    if spss.len() > 31 {
        return Err(format!("too many SPSs: {}", spss.len()));
    }
    c.put_u8(0xE0 | spss.len() as u8);
    for sps in spss {
        c.put_u16(u16::try_from(sps.len()).map_err(|_| "SPS too long")?);
        c.put_slice(sps);
    }
    c.put_u8(u8::try_from(ppss.len()).map_err(|_| "too many PPSs")?);
    for pps in ppss {
        c.put_u16(u16::try_from(pps.len()).map_err(|_| "PPS too long")?);
        c.put_slice(pps);
    }
    debug_assert_eq!(c.len(), len);
    Ok(c.freeze())
}
