// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.263+ video as in [RFC 4629](https://datatracker.ietf.org/doc/html/rfc4629).

use std::collections::VecDeque;

use bytes::Bytes;

use super::{emit, SlHeader, SlPacket};
use crate::rtp::ReceivedPacket;

#[derive(Debug, Default)]
pub(super) struct Depacketizer;

impl Depacketizer {
    pub(super) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();
        if payload.len() < 2 {
            return Err(format!("H.263 packet too short: {} bytes", payload.len()));
        }
        // RR(5) P(1) V(1) PLEN(6) PEBIT(3). The VRC byte and extra picture
        // header are skipped.
        let p = (payload[0] & 0x04) != 0;
        let v = (payload[0] & 0x02) != 0;
        let plen = usize::from(((payload[0] & 0x01) << 5) | (payload[1] >> 3));
        let offset = 2 + usize::from(v) + plen;
        if offset > payload.len() {
            return Err(format!(
                "H.263 header of {offset} bytes exceeds packet of {} bytes",
                payload.len()
            ));
        }
        let mut hdr = SlHeader::for_packet(pkt);
        if p {
            // The two zero bytes of the picture or GOB start code are omitted.
            let Some(&ptype) = payload.get(offset + 2) else {
                return Err("H.263 picture start too short".into());
            };
            hdr.au_start = true;
            hdr.random_access = (ptype & 0x02) == 0;
            emit(out, Bytes::from_static(&[0, 0]), &hdr);
            hdr.au_start = false;
            hdr.random_access = false;
        }
        hdr.au_end = pkt.mark();
        emit(out, payload.slice(offset..), &hdr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::pkt;
    use super::*;

    #[test]
    fn picture() {
        let mut d = Depacketizer;
        let mut out = VecDeque::new();
        // P=1, then the rest of an intra picture's PSC/TR/PTYPE.
        d.push(&pkt(90_000, 1, 0, false, b"\x04\x00\x80\x02\x08\x00"), &mut out)
            .unwrap();
        // Continuation with V=1 and a VRC byte.
        d.push(&pkt(90_000, 2, 0, true, b"\x02\x00\xffrest"), &mut out)
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(&out[0].data[..], &[0, 0]);
        assert!(out[0].header.au_start && out[0].header.random_access);
        assert_eq!(&out[1].data[..], b"\x80\x02\x08\x00");
        assert!(!out[1].header.au_end);
        assert_eq!(&out[2].data[..], b"rest");
        assert!(out[2].header.au_end);

        // Inter picture: PTYPE coding type bit set.
        out.clear();
        d.push(&pkt(90_000, 3, 3003, true, b"\x04\x00\x80\x02\x0a"), &mut out)
            .unwrap();
        assert!(!out[0].header.random_access);
    }

    #[test]
    fn bad_plen() {
        let mut d = Depacketizer;
        let mut out = VecDeque::new();
        // PLEN=8 with only 2 bytes following.
        d.push(&pkt(90_000, 1, 0, true, b"\x00\x40\x01\x02"), &mut out)
            .unwrap_err();
    }
}
