// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP and RTCP handling; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).

use bytes::Bytes;
use log::{debug, trace};

use crate::rtcp::{Packet, ReportBlock};
use crate::rtp::{Header, ReceivedPacket};
use crate::{ConnectionContext, Error, ErrorInt, NtpTimestamp, PacketContext};

use super::timeline::Timeline;

/// An RTCP sender report.
#[derive(Debug)]
pub(crate) struct SenderReport {
    pub(crate) ssrc: u32,
    pub(crate) timestamp: crate::Timestamp,
    pub(crate) ntp_timestamp: NtpTimestamp,
    pub(crate) packet_count: u32,
}

/// What a compound RTCP packet told us.
#[derive(Debug, Default)]
pub(crate) struct RtcpInfo {
    pub(crate) sender_report: Option<SenderReport>,

    /// A `BYE` for the stream's SSRC (or any SSRC, if none is known yet).
    pub(crate) goodbye: bool,
}

/// RTP/RTCP demarshaller which ensures packets have the correct SSRC and
/// monotonically increasing SEQ, and keeps the reception statistics reported
/// in receiver reports.
///
/// When using UDP, skips and logs out-of-order packets. When using TCP,
/// fails on them.
///
/// This reports packet loss (via [ReceivedPacket::loss]) but doesn't prohibit
/// it, except loss of more than `i16::MAX` which would be indistinguishable
/// from non-monotonic sequence numbers.
#[derive(Debug)]
pub(crate) struct InorderParser {
    ssrc: Option<u32>,
    next_seq: Option<u16>,

    /// Sequence number of the first packet, extended.
    base_seq: Option<u32>,

    /// Highest sequence number seen, extended with wraparound cycles.
    max_seq: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
}

impl InorderParser {
    pub(crate) fn new(ssrc: Option<u32>, next_seq: Option<u16>) -> Self {
        Self {
            ssrc,
            next_seq,
            base_seq: None,
            max_seq: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
        }
    }

    /// Forgets sequence and reception state, as after a seek.
    pub(crate) fn reset(&mut self, ssrc: Option<u32>, next_seq: Option<u16>) {
        *self = Self::new(ssrc, next_seq);
    }

    #[inline]
    pub(crate) fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    pub(crate) fn rtp(
        &mut self,
        tcp: bool,
        conn_ctx: &ConnectionContext,
        pkt_ctx: &PacketContext,
        timeline: &mut Timeline,
        stream_id: usize,
        data: Bytes,
    ) -> Result<Option<ReceivedPacket>, Error> {
        let (header, payload) = Header::parse(&data).map_err(|reason| {
            wrap!(ErrorInt::PacketError {
                conn_ctx: *conn_ctx,
                pkt_ctx: *pkt_ctx,
                stream_id,
                description: format!(
                    "corrupt RTP header while expecting seq={:04x?}: {}\n{:#?}",
                    &self.next_seq,
                    reason,
                    crate::hex::LimitedHex::new(&data, 64),
                ),
            })
        })?;
        let sequence_number = header.sequence_number;
        let ssrc = header.ssrc;
        let loss = sequence_number.wrapping_sub(self.next_seq.unwrap_or(sequence_number));
        if matches!(self.ssrc, Some(s) if s != ssrc) {
            bail!(ErrorInt::RtpPacketError {
                conn_ctx: *conn_ctx,
                pkt_ctx: *pkt_ctx,
                stream_id,
                ssrc,
                sequence_number,
                description: format!(
                    "Wrong ssrc; expecting ssrc={:08x?} seq={:04x?}",
                    self.ssrc, self.next_seq
                ),
            });
        }
        if loss > 0x80_00 {
            if tcp {
                bail!(ErrorInt::RtpPacketError {
                    conn_ctx: *conn_ctx,
                    pkt_ctx: *pkt_ctx,
                    stream_id,
                    ssrc,
                    sequence_number,
                    description: format!(
                        "Out-of-order packet or large loss; expecting ssrc={:08x?} seq={:04x?}",
                        self.ssrc, self.next_seq
                    ),
                });
            }
            debug!(
                "Skipping out-of-order seq={:04x} when expecting ssrc={:08x?} seq={:04x?}",
                sequence_number, self.ssrc, self.next_seq
            );
            return Ok(None);
        }
        let timestamp = match timeline.advance_to(header.timestamp) {
            Ok(ts) => ts,
            Err(description) => bail!(ErrorInt::RtpPacketError {
                conn_ctx: *conn_ctx,
                pkt_ctx: *pkt_ctx,
                stream_id,
                ssrc,
                sequence_number,
                description,
            }),
        };
        self.ssrc = Some(ssrc);
        self.next_seq = Some(sequence_number.wrapping_add(1));
        self.count(sequence_number);
        Ok(Some(ReceivedPacket {
            ctx: *pkt_ctx,
            stream_id,
            header,
            timestamp,
            data,
            payload,
            loss,
        }))
    }

    /// Updates the extended highest sequence number and received count.
    fn count(&mut self, seq: u16) {
        self.received = self.received.wrapping_add(1);
        if self.base_seq.is_none() {
            self.base_seq = Some(u32::from(seq));
            self.max_seq = u32::from(seq);
            return;
        }
        let delta = seq.wrapping_sub(self.max_seq as u16);
        if delta < 0x80_00 {
            self.max_seq = self.max_seq.wrapping_add(u32::from(delta));
        }
    }

    pub(crate) fn rtcp(
        &mut self,
        timeline: &mut Timeline,
        data: &[u8],
    ) -> Result<RtcpInfo, String> {
        let mut info = RtcpInfo::default();
        for (i, pkt) in crate::rtcp::parse_compound(data)?.into_iter().enumerate() {
            match pkt {
                Packet::SenderReport(sr) => {
                    if i > 0 {
                        return Err("RTCP SR must be first in packet".into());
                    }
                    if matches!(self.ssrc, Some(s) if s != sr.ssrc) {
                        return Err(format!(
                            "Expected ssrc={:08x?}, got RTCP SR ssrc={:08x}",
                            self.ssrc, sr.ssrc
                        ));
                    }
                    let timestamp = timeline.place(sr.rtp_timestamp).map_err(|mut description| {
                        description.push_str(" in RTCP SR");
                        description
                    })?;
                    info.sender_report = Some(SenderReport {
                        ssrc: sr.ssrc,
                        timestamp,
                        ntp_timestamp: sr.ntp_timestamp,
                        packet_count: sr.packet_count,
                    });
                }
                Packet::Goodbye(ssrcs) => {
                    if self.ssrc.map_or(true, |s| ssrcs.contains(&s)) {
                        info.goodbye = true;
                    }
                }
                Packet::Other(pt) => trace!("rtcp: skipping pt {}", pt),
            }
        }
        Ok(info)
    }

    /// Returns a reception report block for the current source, as in
    /// [RFC 3550 appendix A.3](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.3).
    ///
    /// `last_sr` and `delay_since_last_sr` are passed through.
    pub(crate) fn report_block(
        &mut self,
        last_sr: u32,
        delay_since_last_sr: u32,
    ) -> Option<ReportBlock> {
        let ssrc = self.ssrc?;
        let base = self.base_seq?;
        let expected = self.max_seq.wrapping_sub(base).wrapping_add(1);
        let lost = i64::from(expected) - i64::from(self.received);
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = i64::from(expected_interval) - i64::from(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / i64::from(expected_interval)).min(255) as u8
        };
        Some(ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: lost.clamp(0, 0x7F_FFFF) as u32,
            extended_highest_seq: self.max_seq,
            jitter: 0,
            last_sr,
            delay_since_last_sr,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn raw(seq: u16, ts: u32, payload: &[u8]) -> Bytes {
        Header {
            sequence_number: seq,
            timestamp: ts,
            payload_type: 96,
            ssrc: 0xd25614e,
            mark: true,
        }
        .serialize(payload)
        .unwrap()
    }

    fn parse(
        parser: &mut InorderParser,
        timeline: &mut Timeline,
        tcp: bool,
        data: Bytes,
    ) -> Result<Option<ReceivedPacket>, Error> {
        parser.rtp(
            tcp,
            &ConnectionContext::dummy(),
            &PacketContext::dummy(),
            timeline,
            0,
            data,
        )
    }

    #[test]
    fn out_of_order() {
        let mut timeline = Timeline::new(None, 90_000).unwrap();
        let mut parser = InorderParser::new(Some(0xd25614e), None);

        let p = parse(&mut parser, &mut timeline, false, raw(2, 2, b"pkt 2"))
            .unwrap()
            .unwrap();
        assert_eq!(p.timestamp().elapsed(), 0);

        assert!(parse(&mut parser, &mut timeline, false, raw(1, 1, b"pkt 1"))
            .unwrap()
            .is_none());

        // The skipped packet shouldn't have adjusted time.
        let p = parse(&mut parser, &mut timeline, false, raw(3, 3, b"pkt 3"))
            .unwrap()
            .unwrap();
        assert_eq!(p.timestamp().elapsed(), 1);
        assert_eq!(p.loss(), 0);

        // ...but the same is fatal over TCP.
        let mut parser = InorderParser::new(None, Some(5));
        parse(&mut parser, &mut timeline, true, raw(4, 4, b"late")).unwrap_err();
    }

    #[test]
    fn wrong_ssrc() {
        let mut timeline = Timeline::new(None, 90_000).unwrap();
        let mut parser = InorderParser::new(Some(0x1234), None);
        let e = parse(&mut parser, &mut timeline, false, raw(1, 1, b"x")).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NonCompliantBitstream);
    }

    #[test]
    fn loss_report() {
        let mut timeline = Timeline::new(Some(0), 8_000).unwrap();
        let mut parser = InorderParser::new(None, Some(0xfffe));
        for seq in [0xfffeu16, 0xffff, 2, 3] {
            let p = parse(&mut parser, &mut timeline, false, raw(seq, 160, b"a"))
                .unwrap()
                .unwrap();
            if seq == 2 {
                assert_eq!(p.loss(), 2);
            }
        }
        let b = parser.report_block(0x1234_5678, 65536).unwrap();
        assert_eq!(b.ssrc, 0xd25614e);
        assert_eq!(b.extended_highest_seq, 0x1_0003);
        assert_eq!(b.cumulative_lost, 2);
        // 2 of 6 expected packets lost, in units of 1/256.
        assert_eq!(b.fraction_lost, 85);
        assert_eq!(b.last_sr, 0x1234_5678);

        // Nothing new: no further loss in the interval.
        let b = parser.report_block(0, 0).unwrap();
        assert_eq!(b.fraction_lost, 0);
        assert_eq!(b.cumulative_lost, 2);
    }

    #[test]
    fn sender_report_and_bye() {
        let mut timeline = Timeline::new(None, 90_000).unwrap();
        let mut parser = InorderParser::new(Some(0x66426ae1), None);
        // SR with no report blocks, then BYE for the same source.
        let buf = b"\x80\xc8\x00\x06\x66\x42\x6a\xe1\
                    \xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\
                    \x85\x2e\xf8\x07\x00\x2a\x43\x33\
                    \x2c\x4d\x5e\x4f\
                    \x81\xcb\x00\x01\x66\x42\x6a\xe1";
        let info = parser.rtcp(&mut timeline, &buf[..]).unwrap();
        let sr = info.sender_report.unwrap();
        assert_eq!(sr.ssrc, 0x66426ae1);
        assert_eq!(sr.packet_count, 0x002a4333);
        assert_eq!(sr.timestamp.elapsed(), 0);
        assert_eq!(
            sr.timestamp.clock_rate(),
            NonZeroU32::new(90_000).unwrap()
        );
        assert!(info.goodbye);

        // A BYE for another source is ignored.
        let info = parser
            .rtcp(&mut timeline, b"\x81\xcb\x00\x01\x00\x00\x00\x01")
            .unwrap();
        assert!(!info.goodbye);
    }
}
