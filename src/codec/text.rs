// SPDX-License-Identifier: MIT OR Apache-2.0

//! 3GPP timed text as in [RFC 4396](https://datatracker.ietf.org/doc/html/rfc4396).
//!
//! Each RTP packet carries one or more timed text units (TTUs). Type 1 TTUs
//! hold whole text samples; types 2 through 4 hold fragments of the text
//! string and its modifiers, which are reassembled here into a sample.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::{emit, FormatParams, SlHeader, SlPacket};
use crate::rtp::ReceivedPacket;

/// Builds the MPEG-4 `TextConfig` decoder specific info from the `fmtp`
/// attributes. The `tx3g` attribute (comma-separated base64 sample
/// descriptions) is mandatory.
pub(super) fn text_config(clock_rate: u32, params: &FormatParams) -> Result<Bytes, String> {
    let tx3g = params
        .get("tx3g")
        .ok_or_else(|| "3GPP timed text without tx3g".to_owned())?;
    let u = |k: &str| params.get_u32(k).map(Option::unwrap_or_default);
    let descs = tx3g
        .split(',')
        .map(|d| {
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, d.trim())
                .map_err(|_| format!("bad tx3g sample description {d:?}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let nb_desc = u8::try_from(descs.len()).map_err(|_| "too many tx3g descriptions")?;

    let mut c = BytesMut::with_capacity(32 + descs.iter().map(Vec::len).sum::<usize>());
    c.put_u8(0x10); // Base3GPPFormat
    c.put_u8(0x10); // MPEGExtendedFormat
    c.put_u8(0x10); // profileLevel
    c.put_uint(u64::from(clock_rate & 0xFF_FFFF), 3);
    // no alternate formats(1), sampleDescriptionFlags=1 (2), sample
    // descriptions follow(1), video info follows(1), reserved(3).
    c.put_u8(0b0_01_1_1_000);
    c.put_u8(u("layer")? as u8);
    c.put_u16(u("width")? as u16);
    c.put_u16(u("height")? as u16);
    c.put_u8(nb_desc);
    for d in &descs {
        c.put_slice(d);
    }
    c.put_u16(u("max-w")? as u16);
    c.put_u16(u("max-h")? as u16);
    c.put_u16(u("tx")? as u16);
    c.put_u16(u("ty")? as u16);
    Ok(c.freeze())
}

#[derive(Debug, Default)]
pub(super) struct Depacketizer {
    /// Reassembled text and modifiers, if a sample is in progress.
    buf: Option<BytesMut>,
    composition_ts: i64,
    duration: u32,
    utf16: bool,
    sample_index: u8,

    /// Length of the text string within `buf`; modifiers follow it.
    text_len: u16,
    text_frags: u8,
    cur_text_frag: u8,
    modifier_frags: u8,
}

impl Depacketizer {
    pub(super) fn reset(&mut self) {
        *self = Depacketizer::default();
    }

    /// Emits a reassembled sample as a `TextSample` header and its body.
    fn flush(&mut self, ts: i64, seq: u16, out: &mut VecDeque<SlPacket>) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        let mut hdr = SlHeader {
            composition_ts: ts,
            au_start: true,
            random_access: true,
            packet_sequence_number: seq,
            au_duration: Some(self.duration),
            ..Default::default()
        };
        let mut h = BytesMut::with_capacity(10);
        h.put_u8((u8::from(self.utf16) << 7) | 1);
        h.put_u16(8 + buf.len() as u16);
        h.put_u8(self.sample_index);
        h.put_uint(u64::from(self.duration & 0xFF_FFFF), 3);
        h.put_u16(self.text_len);
        emit(out, h.freeze(), &hdr);
        hdr.au_start = false;
        hdr.au_end = true;
        emit(out, buf.freeze(), &hdr);
        let composition_ts = self.composition_ts;
        *self = Depacketizer {
            composition_ts,
            ..Default::default()
        };
    }

    pub(super) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();
        let seq = pkt.sequence_number();
        let mut ts = pkt.timestamp().timestamp();
        let mut pos = 0;
        while pos + 3 <= payload.len() {
            let utf16 = (payload[pos] & 0x80) != 0;
            let ttu_type = payload[pos] & 0x07;
            let len = usize::from(u16::from_be_bytes([payload[pos + 1], payload[pos + 2]]));
            if len < 2 {
                break;
            }
            let end = pos + len + 1;
            if end > payload.len() {
                return Err(format!(
                    "TTU type {ttu_type} of {len} bytes at offset {pos} runs past packet of {} bytes",
                    payload.len()
                ));
            }
            let ttu = &payload[pos..end];
            match ttu_type {
                1 => {
                    self.flush(self.composition_ts, seq, out);
                    if len < 8 {
                        return Err(format!("TTU type 1 too short: {len}"));
                    }
                    let duration = u32::from_be_bytes([0, ttu[4], ttu[5], ttu[6]]);
                    let hdr = SlHeader {
                        composition_ts: ts,
                        au_start: true,
                        au_end: true,
                        random_access: true,
                        packet_sequence_number: seq,
                        au_duration: Some(duration),
                        ..Default::default()
                    };
                    emit(out, payload.slice(pos..end), &hdr);
                    self.composition_ts = ts;
                    ts += i64::from(duration);
                }
                2 => {
                    if self.composition_ts < ts {
                        self.flush(self.composition_ts, seq, out);
                    }
                    if len < 9 {
                        return Err(format!("TTU type 2 too short: {len}"));
                    }
                    self.composition_ts = ts;
                    self.utf16 = utf16;
                    let total_frags = ttu[3] >> 4;
                    let cur_frag = ttu[3] & 0x0F;
                    let duration = u32::from_be_bytes([0, ttu[4], ttu[5], ttu[6]]);
                    let sample_index = ttu[7];
                    if self.text_frags == 0 {
                        self.text_frags = total_frags;
                        self.cur_text_frag = 0;
                        self.sample_index = sample_index;
                    }
                    if total_frags != self.text_frags || self.cur_text_frag > cur_frag {
                        self.flush(self.composition_ts, seq, out);
                        self.utf16 = utf16;
                        self.text_frags = total_frags;
                        self.sample_index = sample_index;
                    }
                    self.cur_text_frag = cur_frag;
                    self.duration = duration;
                    self.buf.get_or_insert_with(BytesMut::new).put_slice(&ttu[10..]);
                    if pkt.mark() {
                        self.text_len = self.buf.as_ref().map(|b| b.len() as u16).unwrap_or(0);
                        self.flush(ts, seq, out);
                    }
                }
                3 | 4 => {
                    let buf = self.buf.get_or_insert_with(BytesMut::new);
                    if ttu_type == 3 {
                        self.text_len = buf.len() as u16;
                    }
                    if len < 6 {
                        return Err(format!("TTU type {ttu_type} too short: {len}"));
                    }
                    let frags = ttu[3] >> 4;
                    if self.modifier_frags == 0 {
                        self.modifier_frags = frags;
                    } else if self.modifier_frags != frags {
                        self.flush(self.composition_ts, seq, out);
                        self.modifier_frags = frags;
                    }
                    self.duration = u32::from_be_bytes([0, ttu[4], ttu[5], ttu[6]]);
                    self.buf.get_or_insert_with(BytesMut::new).put_slice(&ttu[7..]);
                    if pkt.mark() {
                        self.flush(ts, seq, out);
                    }
                }
                _ => {} // type 5 (sample description) and reserved types are skipped.
            }
            pos = end;
        }
        Ok(())
    }
}
