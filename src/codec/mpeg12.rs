// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-1/2 audio and video as in [RFC 2250](https://datatracker.ietf.org/doc/html/rfc2250).

use std::collections::VecDeque;

use super::{emit, SlHeader, SlPacket};
use crate::rtp::ReceivedPacket;

/// The fields of an MPEG audio frame header needed to split frames.
#[derive(Debug, PartialEq, Eq)]
struct FrameHeader {
    sample_rate: u32,
    samples_per_frame: u32,
    frame_size: usize,
}

#[rustfmt::skip]
const BITRATES_KBPS: [[u16; 15]; 5] = [
    /* V1 L1 */ [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    /* V1 L2 */ [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    /* V1 L3 */ [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
    /* V2 L1 */ [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    /* V2 L2/L3 */ [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];

impl FrameHeader {
    fn parse(h: &[u8]) -> Result<Self, String> {
        if h.len() < 4 {
            return Err(format!("MPEG audio header too short: {} bytes", h.len()));
        }
        if h[0] != 0xFF || (h[1] & 0xE0) != 0xE0 {
            return Err(format!("bad MPEG audio sync {:02x}{:02x}", h[0], h[1]));
        }
        // 3 = MPEG-1, 2 = MPEG-2, 0 = MPEG-2.5.
        let version = (h[1] >> 3) & 0x3;
        // 3 = layer I, 2 = layer II, 1 = layer III.
        let layer = (h[1] >> 1) & 0x3;
        let bitrate_index = usize::from(h[2] >> 4);
        let sample_rate_index = usize::from((h[2] >> 2) & 0x3);
        let padding = u32::from((h[2] >> 1) & 0x1);
        if version == 1 || layer == 0 || bitrate_index == 0 || bitrate_index == 15 {
            return Err(format!(
                "unsupported MPEG audio header {:02x}{:02x}{:02x}{:02x}",
                h[0], h[1], h[2], h[3]
            ));
        }
        let sample_rate = *SAMPLE_RATES_V1
            .get(sample_rate_index)
            .ok_or("reserved MPEG audio sample rate")?
            >> match version {
                3 => 0,
                2 => 1,
                _ => 2,
            };
        let v1 = version == 3;
        let table = match (v1, layer) {
            (true, 3) => 0,
            (true, 2) => 1,
            (true, _) => 2,
            (false, 3) => 3,
            (false, _) => 4,
        };
        let bitrate = u32::from(BITRATES_KBPS[table][bitrate_index]) * 1000;
        let (samples_per_frame, frame_size) = match layer {
            3 => (384, (12 * bitrate / sample_rate + padding) * 4),
            2 => (1152, 144 * bitrate / sample_rate + padding),
            _ if v1 => (1152, 144 * bitrate / sample_rate + padding),
            _ => (576, 72 * bitrate / sample_rate + padding),
        };
        Ok(FrameHeader {
            sample_rate,
            samples_per_frame,
            frame_size: frame_size as usize,
        })
    }
}

#[derive(Debug)]
pub(super) struct AudioDepacketizer {
    clock_rate: u32,

    /// Bytes of a fragmented frame not yet received.
    pending_len: usize,
}

impl AudioDepacketizer {
    pub(super) fn new(clock_rate: u32) -> Self {
        AudioDepacketizer {
            clock_rate,
            pending_len: 0,
        }
    }

    pub(super) fn reset(&mut self) {
        self.pending_len = 0;
    }

    pub(super) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();
        if payload.len() < 4 {
            return Err(format!("MPA packet too short: {} bytes", payload.len()));
        }
        let offset = u16::from_be_bytes([payload[2], payload[3]]);
        let mut hdr = SlHeader::for_packet(pkt);
        let mut pos = 4;
        if offset != 0 {
            // Continuation of a frame started in an earlier packet.
            if self.pending_len == 0 {
                return Err(format!("MPA fragment at offset {offset} with no frame started"));
            }
            let len = self.pending_len.min(payload.len() - pos);
            self.pending_len -= len;
            hdr.au_end = self.pending_len == 0;
            emit(out, payload.slice(pos..pos + len), &hdr);
            return Ok(());
        }
        self.pending_len = 0;
        while pos < payload.len() {
            let frame = FrameHeader::parse(&payload[pos..])?;
            let au_duration = (u64::from(frame.samples_per_frame) * u64::from(self.clock_rate)
                / u64::from(frame.sample_rate)) as u32;
            hdr.au_start = true;
            hdr.random_access = true;
            hdr.au_duration = Some(au_duration);
            let available = payload.len() - pos;
            if frame.frame_size > available {
                hdr.au_end = false;
                self.pending_len = frame.frame_size - available;
                emit(out, payload.slice(pos..), &hdr);
                break;
            }
            hdr.au_end = true;
            emit(out, payload.slice(pos..pos + frame.frame_size), &hdr);
            pos += frame.frame_size;
            hdr.composition_ts += i64::from(au_duration);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(super) struct VideoDepacketizer {
    /// The previous packet had the marker bit set.
    after_mark: bool,
    last_ts: Option<i64>,
}

impl VideoDepacketizer {
    pub(super) fn reset(&mut self) {
        self.after_mark = false;
        self.last_ts = None;
    }

    pub(super) fn push(
        &mut self,
        pkt: &ReceivedPacket,
        out: &mut VecDeque<SlPacket>,
    ) -> Result<(), String> {
        let payload = pkt.payload_bytes();
        let mut data_start = 4;
        if payload.len() > 4 && (payload[0] & 0x04) != 0 {
            // MPEG-2 video-specific header extension.
            data_start += 4;
        }
        if payload.len() <= data_start {
            return Err(format!("MPV packet too short: {} bytes", payload.len()));
        }
        let picture_type = payload[2] & 0x07;
        let ts = pkt.timestamp().timestamp();
        let mut hdr = SlHeader::for_packet(pkt);
        hdr.au_start = self.after_mark || self.last_ts != Some(ts);
        hdr.au_end = pkt.mark();
        hdr.random_access = picture_type == 1;
        emit(out, payload.slice(data_start..), &hdr);
        self.after_mark = pkt.mark();
        self.last_ts = Some(ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::pkt;
    use super::*;

    #[test]
    fn frame_header() {
        // MPEG-1 layer III, 128 kbps, 44.1 kHz, no padding.
        assert_eq!(
            FrameHeader::parse(&[0xFF, 0xFB, 0x90, 0x64]).unwrap(),
            FrameHeader {
                sample_rate: 44_100,
                samples_per_frame: 1152,
                frame_size: 417,
            }
        );
        // MPEG-2 layer III, 64 kbps, 22.05 kHz.
        assert_eq!(
            FrameHeader::parse(&[0xFF, 0xF3, 0x80, 0xC4]).unwrap(),
            FrameHeader {
                sample_rate: 22_050,
                samples_per_frame: 576,
                frame_size: 208,
            }
        );
        FrameHeader::parse(&[0xFF, 0xFB, 0xF0, 0x64]).unwrap_err();
    }

    fn frame(len: usize) -> Vec<u8> {
        // MPEG-1 layer II, 32 kbps, 48 kHz: 96-byte frames.
        let mut f = vec![0u8; len];
        f[..4].copy_from_slice(&[0xFF, 0xFD, 0x14, 0x00]);
        f
    }

    #[test]
    fn audio_frames() {
        let mut d = AudioDepacketizer::new(90_000);
        let mut out = VecDeque::new();

        // Two whole frames in one packet.
        let mut payload = vec![0, 0, 0, 0];
        payload.extend(frame(96));
        payload.extend(frame(96));
        d.push(&pkt(90_000, 1, 0, true, &payload), &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.header.au_start && p.header.au_end));
        assert_eq!(out[0].header.au_duration, Some(2160));
        assert_eq!(out[1].header.composition_ts, 2160);
        out.clear();

        // A frame split across two packets.
        let f = frame(96);
        let mut first = vec![0, 0, 0, 0];
        first.extend_from_slice(&f[..50]);
        let mut second = vec![0, 0, 0, 50];
        second.extend_from_slice(&f[50..]);
        d.push(&pkt(90_000, 2, 4320, false, &first), &mut out).unwrap();
        d.push(&pkt(90_000, 3, 4320, true, &second), &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].header.au_start && !out[0].header.au_end);
        assert_eq!(out[0].data.len(), 50);
        assert!(!out[1].header.au_start && out[1].header.au_end);
        assert_eq!(out[1].data.len(), 46);

        // A continuation with nothing to continue.
        d.push(&pkt(90_000, 4, 6480, true, &second), &mut out).unwrap_err();
    }

    #[test]
    fn video() {
        let mut d = VideoDepacketizer::default();
        let mut out = VecDeque::new();
        // I picture in two packets, then a P picture.
        d.push(&pkt(90_000, 1, 0, false, b"\x00\x00\x01\x00seq"), &mut out)
            .unwrap();
        d.push(&pkt(90_000, 2, 0, true, b"\x00\x00\x01\x00pic"), &mut out)
            .unwrap();
        d.push(&pkt(90_000, 3, 3003, true, b"\x00\x01\x02\x00p"), &mut out)
            .unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].header.au_start && out[0].header.random_access);
        assert!(!out[0].header.au_end);
        assert_eq!(&out[0].data[..], b"seq");
        assert!(!out[1].header.au_start && out[1].header.au_end);
        assert!(out[2].header.au_start && !out[2].header.random_access);
    }
}
