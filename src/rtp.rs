// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP data packets, as in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::ops::Range;

use bytes::Bytes;

use crate::{PacketContext, Timestamp};

/// Header length with no CSRCs or extension.
const FIXED_HEADER_LEN: usize = 12;

/// UDP datagrams and interleaved RTSP data messages both top out at 64 KiB.
const MAX_PACKET_LEN: usize = u16::MAX as usize;

/// The fixed header fields of an RTP packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_type: u8,
    pub mark: bool,
}

impl Header {
    /// Parses the header of `data`, returning it and the payload's byte range.
    ///
    /// CSRCs and any header extension are skipped; padding is excluded from
    /// the payload.
    pub(crate) fn parse(data: &[u8]) -> Result<(Self, Range<usize>), &'static str> {
        if data.len() > MAX_PACKET_LEN {
            return Err("too long");
        }
        let Some(fixed) = data.get(..FIXED_HEADER_LEN) else {
            return Err("too short");
        };
        if fixed[0] >> 6 != 2 {
            return Err("must be version 2");
        }
        let mut start = FIXED_HEADER_LEN + 4 * usize::from(fixed[0] & 0b0000_1111);
        if fixed[0] & 0b0001_0000 != 0 {
            // 16-bit profile-defined id, then the length in 32-bit words.
            let Some(ext) = data.get(start..start + 4) else {
                return Err("extension is after end of packet");
            };
            start += 4 + 4 * usize::from(u16::from_be_bytes([ext[2], ext[3]]));
        }
        if start > data.len() {
            return Err("payload start is after end of packet");
        }
        let mut end = data.len();
        if fixed[0] & 0b0010_0000 != 0 {
            let pad = match data[start..].last() {
                None => return Err("missing padding"),
                Some(0) => return Err("invalid padding length 0"),
                Some(&p) => usize::from(p),
            };
            if end - start < pad {
                return Err("bad padding");
            }
            end -= pad;
        }
        let header = Header {
            sequence_number: u16::from_be_bytes([fixed[2], fixed[3]]),
            timestamp: u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
            ssrc: u32::from_be_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]),
            payload_type: fixed[1] & 0b0111_1111,
            mark: fixed[1] & 0b1000_0000 != 0,
        };
        Ok((header, start..end))
    }

    /// Serializes a packet with this header, no CSRCs, and no extension.
    #[doc(hidden)]
    pub fn serialize(&self, payload: &[u8]) -> Result<Bytes, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        if FIXED_HEADER_LEN + payload.len() > MAX_PACKET_LEN {
            return Err("payload too long");
        }
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + payload.len());
        out.push(2 << 6);
        out.push((u8::from(self.mark) << 7) | self.payload_type);
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out.into())
    }
}

/// A received RTP packet which has passed sequence and SSRC checks.
pub struct ReceivedPacket {
    pub(crate) ctx: PacketContext,
    pub(crate) stream_id: usize,
    pub(crate) header: Header,

    /// The header's RTP timestamp, extended and tied to its clock rate.
    pub(crate) timestamp: Timestamp,

    /// The whole packet as received.
    pub(crate) data: Bytes,
    pub(crate) payload: Range<usize>,

    /// Sequence numbers skipped since the previous packet.
    pub(crate) loss: u16,
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("ctx", &self.ctx)
            .field("stream_id", &self.stream_id)
            .field("header", &self.header)
            .field("timestamp", &self.timestamp)
            .field("payload", &crate::hex::LimitedHex::new(self.payload(), 64))
            .finish()
    }
}

impl ReceivedPacket {
    /// Wraps a freshly serialized packet, as depacketizer tests and benchmarks
    /// need. The header's RTP timestamp is taken from `timestamp`.
    #[doc(hidden)]
    pub fn synthetic(
        mut header: Header,
        timestamp: Timestamp,
        payload: &[u8],
    ) -> Result<Self, &'static str> {
        header.timestamp = timestamp.timestamp() as u32;
        let data = header.serialize(payload)?;
        let end = data.len();
        Ok(ReceivedPacket {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            header,
            timestamp,
            data,
            payload: FIXED_HEADER_LEN..end,
            loss: 0,
        })
    }

    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.header.mark
    }

    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    /// The whole packet, headers included.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.data[..]
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload.clone()]
    }

    /// The payload as a reference-counted [`Bytes`], without copying.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.data.slice(self.payload.clone())
    }
}
