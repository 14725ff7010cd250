// SPDX-License-Identifier: MIT OR Apache-2.0

//! AMR and AMR-WB audio in the octet-aligned mode of
//! [RFC 4867](https://datatracker.ietf.org/doc/html/rfc4867).

use std::collections::VecDeque;

use super::{emit, SlHeader, SlPacket};
use crate::rtp::ReceivedPacket;

/// Speech frame sizes in bytes by frame type, excluding the TOC byte.
#[rustfmt::skip]
const NB_FRAME_SIZES: [usize; 16] = [12, 13, 15, 17, 19, 20, 26, 31, 5, 0, 0, 0, 0, 0, 0, 0];

#[rustfmt::skip]
const WB_FRAME_SIZES: [usize; 16] = [17, 23, 32, 36, 40, 46, 50, 58, 60, 5, 0, 0, 0, 0, 0, 0];

/// Samples per 20 ms frame at 8 kHz; AMR-WB uses the same RTP timestamp step.
const FRAME_DURATION: i64 = 160;

#[derive(Debug)]
pub(super) struct Depacketizer {
    sizes: &'static [usize; 16],
}

impl Depacketizer {
    pub(super) fn new(is_wb: bool) -> Self {
        Depacketizer {
            sizes: if is_wb {
                &WB_FRAME_SIZES
            } else {
                &NB_FRAME_SIZES
            },
        }
    }

    /// Emits each frame as its TOC byte followed by the speech bits, in two
    /// packets sharing one composition timestamp.
    pub(super) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();

        // Skip the CMR byte, then find the end of the table of contents.
        let toc_start = 1;
        let mut toc_end = toc_start;
        loop {
            let Some(&toc) = payload.get(toc_end) else {
                return Err("AMR table of contents runs past end of packet".into());
            };
            toc_end += 1;
            if toc & 0x80 == 0 {
                break;
            }
        }

        let mut hdr = SlHeader::for_packet(pkt);
        hdr.random_access = true;
        hdr.au_duration = Some(FRAME_DURATION as u32);
        let mut pos = toc_end;
        for i in toc_start..toc_end {
            let toc = payload[i];
            let frame_type = usize::from((toc >> 3) & 0x0F);
            let size = self.sizes[frame_type];
            if pos + size > payload.len() {
                return Err(format!(
                    "AMR frame {} of type {frame_type} ({size} bytes) runs past end of packet",
                    i - toc_start
                ));
            }
            hdr.au_start = true;
            hdr.au_end = false;
            emit(out, payload.slice(i..i + 1), &hdr);
            hdr.au_start = false;
            hdr.au_end = true;
            emit(out, payload.slice(pos..pos + size), &hdr);
            pos += size;
            hdr.composition_ts += FRAME_DURATION;
        }
        Ok(())
    }
}
