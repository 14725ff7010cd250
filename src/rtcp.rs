// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).
//!
//! A receiver acts on two kinds of incoming packet: sender reports, which
//! relate the source's RTP clock to wall time, and goodbyes, which end the
//! stream. Everything else is skipped. Outgoing traffic is a receiver report
//! followed by the SDES `CNAME` every compound packet must carry.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::NtpTimestamp;

const PT_SENDER_REPORT: u8 = 200;
const PT_RECEIVER_REPORT: u8 = 201;
const PT_SOURCE_DESCRIPTION: u8 = 202;
const PT_GOODBYE: u8 = 203;

const REPORT_BLOCK_LEN: usize = 24;

/// The sender info section of an SR. Its report blocks describe other
/// receivers and are ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SenderInfo {
    pub(crate) ssrc: u32,
    pub(crate) ntp_timestamp: NtpTimestamp,
    pub(crate) rtp_timestamp: u32,
    pub(crate) packet_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Packet {
    SenderReport(SenderInfo),

    /// The sources which are leaving.
    Goodbye(SmallVec<[u32; 2]>),

    /// Any other payload type, including other receivers' reports.
    Other(u8),
}

/// One packet split off the front of a compound packet.
struct Chunk<'a> {
    first: u8,
    payload_type: u8,

    /// Everything after the four-byte common header, minus padding.
    body: &'a [u8],
}

#[inline]
fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn split(buf: &[u8]) -> Result<(Chunk<'_>, &[u8]), String> {
    let [first, payload_type, len_hi, len_lo, ..] = *buf else {
        return Err(format!(
            "RTCP packet of {} bytes is shorter than its header",
            buf.len()
        ));
    };
    if first >> 6 != 2 {
        return Err(format!("RTCP version must be 2; got {}", first >> 6));
    }

    // In 32-bit words minus one, counting the header and any padding.
    let len = 4 * (usize::from(u16::from_be_bytes([len_hi, len_lo])) + 1);
    if buf.len() < len {
        return Err(format!(
            "RTCP packet claims {len} bytes; only {} remain",
            buf.len()
        ));
    }
    let (this, rest) = buf.split_at(len);
    let mut body = &this[4..];
    if first & 0b0010_0000 != 0 {
        let pad = usize::from(this[len - 1]);
        if pad == 0 || pad > body.len() {
            return Err(format!(
                "RTCP packet of {len} bytes has bad padding length {pad}"
            ));
        }
        body = &body[..body.len() - pad];
    }
    Ok((
        Chunk {
            first,
            payload_type,
            body,
        },
        rest,
    ))
}

impl Chunk<'_> {
    /// The five-bit report, source or item count.
    fn count(&self) -> usize {
        usize::from(self.first & 0b0001_1111)
    }

    fn padded(&self) -> bool {
        self.first & 0b0010_0000 != 0
    }

    fn interpret(&self) -> Result<Packet, String> {
        match self.payload_type {
            PT_SENDER_REPORT => {
                // SSRC and 20 bytes of sender info precede the report blocks.
                let need = 24 + self.count() * REPORT_BLOCK_LEN;
                if self.body.len() < need {
                    return Err(format!(
                        "RTCP SR with {} report blocks needs {} bytes; has {}",
                        self.count(),
                        need,
                        self.body.len()
                    ));
                }
                let word = |i: usize| be_u32(self.body, 4 * i);
                Ok(Packet::SenderReport(SenderInfo {
                    ssrc: word(0),
                    ntp_timestamp: NtpTimestamp((u64::from(word(1)) << 32) | u64::from(word(2))),
                    rtp_timestamp: word(3),
                    packet_count: word(4),
                }))
            }
            PT_GOODBYE => {
                let n = self.count();
                if self.body.len() < 4 * n {
                    return Err(format!(
                        "RTCP BYE lists {} sources in {} bytes",
                        n,
                        self.body.len()
                    ));
                }
                Ok(Packet::Goodbye(
                    (0..n).map(|i| be_u32(self.body, 4 * i)).collect(),
                ))
            }
            pt => Ok(Packet::Other(pt)),
        }
    }
}

/// Parses a compound packet.
///
/// Validation follows [RFC 3550 appendix
/// A.2](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.2) as relaxed
/// by [RFC 5506](https://datatracker.ietf.org/doc/html/rfc5506): every packet
/// is version 2, only the last may be padded, and the lengths must account for
/// every byte. The first packet need not be an SR or RR.
pub(crate) fn parse_compound(mut raw: &[u8]) -> Result<SmallVec<[Packet; 2]>, String> {
    let mut out = SmallVec::new();
    loop {
        let (chunk, rest) = split(raw)?;
        if chunk.padded() && !rest.is_empty() {
            return Err("padding on non-final packet within RTCP compound packet".to_owned());
        }
        out.push(chunk.interpret()?);
        if rest.is_empty() {
            return Ok(out);
        }
        raw = rest;
    }
}

/// One reception report block within an RR.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ReportBlock {
    pub(crate) ssrc: u32,
    pub(crate) fraction_lost: u8,

    /// Only the low 24 bits are sent.
    pub(crate) cumulative_lost: u32,
    pub(crate) extended_highest_seq: u32,
    pub(crate) jitter: u32,

    /// Middle 32 bits of the last SR's NTP timestamp, or 0.
    pub(crate) last_sr: u32,

    /// In units of 1/65536 seconds.
    pub(crate) delay_since_last_sr: u32,
}

/// Serializes a compound RR + SDES(CNAME) packet.
pub(crate) fn receiver_report(ssrc: u32, cname: &str, blocks: &[ReportBlock]) -> Bytes {
    let blocks = &blocks[..blocks.len().min(31)];
    let mut out = BytesMut::with_capacity(8 + blocks.len() * REPORT_BLOCK_LEN + 12 + cname.len());
    out.put_u8(0x80 | blocks.len() as u8);
    out.put_u8(PT_RECEIVER_REPORT);
    out.put_u16((1 + blocks.len() * REPORT_BLOCK_LEN / 4) as u16);
    out.put_u32(ssrc);
    for b in blocks {
        out.put_u32(b.ssrc);
        out.put_u8(b.fraction_lost);
        out.put_uint(u64::from(b.cumulative_lost & 0xFF_FFFF), 3);
        out.put_u32(b.extended_highest_seq);
        out.put_u32(b.jitter);
        out.put_u32(b.last_sr);
        out.put_u32(b.delay_since_last_sr);
    }

    // SDES with one chunk: SSRC, CNAME item, null terminator, pad to 32 bits.
    let cname = &cname.as_bytes()[..cname.len().min(255)];
    let chunk_len = 4 + 2 + cname.len() + 1;
    let padded = (chunk_len + 3) & !3;
    out.put_u8(0x81);
    out.put_u8(PT_SOURCE_DESCRIPTION);
    out.put_u16((padded / 4) as u16);
    out.put_u32(ssrc);
    out.put_u8(1); // CNAME
    out.put_u8(cname.len() as u8);
    out.put_slice(cname);
    out.put_bytes(0, padded - chunk_len + 1);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dahua() {
        // Sender report and source description from a Dahua camera.
        let buf = b"\x80\xc8\x00\x06\x66\x42\x6a\xe1\
                    \xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\
                    \x85\x2e\xf8\x07\x00\x2a\x43\x33\
                    \x2f\x4c\x34\x1d\
                    \x81\xca\x00\x04\x66\x42\x6a\xe1\
                    \x01\x06\x28\x6e\x6f\x6e\x65\x29\
                    \x00\x00\x00\x00";
        let pkts = parse_compound(buf).unwrap();
        assert_eq!(
            &pkts[..],
            &[
                Packet::SenderReport(SenderInfo {
                    ssrc: 0x66426ae1,
                    ntp_timestamp: NtpTimestamp(0xe4362f99cccccccc),
                    rtp_timestamp: 0x852ef807,
                    packet_count: 0x002a4333,
                }),
                Packet::Other(PT_SOURCE_DESCRIPTION),
            ]
        );
    }

    #[test]
    fn goodbye() {
        let pkts = parse_compound(b"\x81\xcb\x00\x01\x12\x34\x56\x78").unwrap();
        assert_eq!(
            &pkts[..],
            &[Packet::Goodbye(SmallVec::from_slice(&[0x12345678]))]
        );

        // Claims two sources but only has room for one.
        parse_compound(b"\x82\xcb\x00\x01\x12\x34\x56\x78").unwrap_err();
    }

    #[test]
    fn padding() {
        // An unknown packet whose last four bytes are padding.
        let buf = b"\xa7\x00\x00\x02asdf\x00\x00\x00\x04";
        let (chunk, rest) = split(buf).unwrap();
        assert_eq!(chunk.count(), 7);
        assert_eq!(chunk.body, b"asdf");
        assert!(rest.is_empty());
        assert_eq!(&parse_compound(buf).unwrap()[..], &[Packet::Other(0)]);

        // Padding is only allowed on the final packet of a compound.
        let mut two = buf.to_vec();
        two.extend_from_slice(b"\x80\xc9\x00\x01\x00\x00\x00\x01");
        parse_compound(&two).unwrap_err();

        // Padding longer than the packet.
        parse_compound(b"\xa0\x00\x00\x00").unwrap_err();
    }

    #[test]
    fn truncated() {
        parse_compound(b"\x80\xc8").unwrap_err();
        parse_compound(b"\x80\xc8\x00\x06\x66\x42\x6a\xe1").unwrap_err();
        parse_compound(b"\x40\xcb\x00\x00").unwrap_err();

        // An SR claiming a report block it doesn't carry.
        let buf = b"\x81\xc8\x00\x06\x66\x42\x6a\xe1\
                    \xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\
                    \x85\x2e\xf8\x07\x00\x2a\x43\x33\
                    \x2f\x4c\x34\x1d";
        parse_compound(buf).unwrap_err();
    }

    #[test]
    fn build_receiver_report() {
        let rr = receiver_report(
            0xdeadbeef,
            "me@host",
            &[ReportBlock {
                ssrc: 0x12345678,
                fraction_lost: 1,
                cumulative_lost: 0x0100_0002,
                extended_highest_seq: 0x0001_0005,
                ..Default::default()
            }],
        );
        assert_eq!(
            &parse_compound(&rr).unwrap()[..],
            &[
                Packet::Other(PT_RECEIVER_REPORT),
                Packet::Other(PT_SOURCE_DESCRIPTION),
            ]
        );
        assert_eq!(&rr[..8], b"\x81\xc9\x00\x07\xde\xad\xbe\xef");
        assert_eq!(&rr[8..12], b"\x12\x34\x56\x78");

        // Cumulative loss is truncated to 24 bits.
        assert_eq!(&rr[12..16], b"\x01\x00\x00\x02");
        assert_eq!(&rr[16..20], b"\x00\x01\x00\x05");
        let sdes = &rr[32..];
        assert_eq!(sdes.len() % 4, 0);
        assert_eq!(&sdes[..2], b"\x81\xca");
        assert_eq!(&sdes[10..17], b"me@host");
        assert_eq!(sdes[17], 0);
    }
}
