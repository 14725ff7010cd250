// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC in LATM framing (`MP4A-LATM`) as in
//! [RFC 6416](https://datatracker.ietf.org/doc/html/rfc6416), with out-of-band
//! configuration only.

use std::collections::VecDeque;

use bytes::Bytes;

use super::{emit, oti, DecoderConfig, FormatParams, SlHeader, SlPacket, StreamType};
use crate::error::ErrorInt;
use crate::rtp::ReceivedPacket;
use crate::Error;

/// Rewrites the `config` parameter's `StreamMuxConfig` as an `AudioSpecificConfig`.
pub(super) fn decoder_config(params: &FormatParams) -> Result<DecoderConfig, Error> {
    let params_err = |e: String| wrap!(ErrorInt::FormatParamsError(e));
    let smc = params
        .get_hex("config")
        .map_err(params_err)?
        .ok_or_else(|| params_err("MP4A-LATM without config".to_owned()))?;
    let asc = super::aac::stream_mux_config_to_asc(&smc).map_err(params_err)?;
    Ok(DecoderConfig {
        stream_type: StreamType::AUDIO,
        object_type_indication: oti::MPEG4_AUDIO,
        decoder_specific_info: Some(Bytes::from(asc)),
    })
}

#[derive(Debug, Default)]
pub(super) struct Depacketizer {
    unit_duration: u32,
}

impl Depacketizer {
    pub(super) fn with_unit_duration(self, unit_duration: u32) -> Self {
        Depacketizer { unit_duration }
    }

    /// Splits the packet's `PayloadLengthInfo`/`PayloadMux` pairs into frames.
    pub(super) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();
        let mut hdr = SlHeader {
            au_start: true,
            au_end: true,
            random_access: true,
            au_duration: (self.unit_duration > 0).then_some(self.unit_duration),
            ..SlHeader::for_packet(pkt)
        };
        let mut pos = 0;
        while pos < payload.len() {
            // The length is a sum of bytes, continued while each is 0xFF.
            let mut len = 0usize;
            loop {
                let Some(&b) = payload.get(pos) else {
                    return Err("LATM length runs past end of packet".into());
                };
                pos += 1;
                len += usize::from(b);
                if b != 0xFF {
                    break;
                }
            }
            if pos + len > payload.len() {
                return Err(format!(
                    "LATM frame of {len} bytes with {} remaining",
                    payload.len() - pos
                ));
            }
            emit(out, payload.slice(pos..pos + len), &hdr);
            pos += len;
            hdr.composition_ts += i64::from(self.unit_duration);
        }
        Ok(())
    }
}
