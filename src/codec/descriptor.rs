// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 systems object descriptors (ISO/IEC 14496-1 section 7.2.6), written
//! so a host's MPEG-4 terminal can set up decoders for the session's streams.

use bytes::{BufMut, Bytes, BytesMut};

use super::DecoderConfig;

pub mod tag {
    pub const OBJECT_DESCRIPTOR: u8 = 0x01;
    pub const INITIAL_OBJECT_DESCRIPTOR: u8 = 0x02;
    pub const ES_DESCRIPTOR: u8 = 0x03;
    pub const DECODER_CONFIG: u8 = 0x04;
    pub const DECODER_SPECIFIC_INFO: u8 = 0x05;
    pub const SL_CONFIG: u8 = 0x06;

    /// The `MP4_IOD_Tag` form found in `a=mpeg4-iod` of ISMA sessions.
    pub const MP4_INITIAL_OBJECT_DESCRIPTOR: u8 = 0x10;
}

/// Writes a descriptor: tag, expandable size, then `body`.
fn put_descriptor(out: &mut BytesMut, tag: u8, body: &[u8]) {
    out.put_u8(tag);
    let len = body.len();
    let mut shift = 7 * 3;
    while shift > 0 && (len >> shift) == 0 {
        shift -= 7;
    }
    while shift > 0 {
        out.put_u8(0x80 | ((len >> shift) & 0x7F) as u8);
        shift -= 7;
    }
    out.put_u8((len & 0x7F) as u8);
    out.put_slice(body);
}

/// Reads a descriptor header, returning `(tag, body_len, header_len)`.
pub fn read_header(buf: &[u8]) -> Result<(u8, usize, usize), String> {
    let Some(&tag) = buf.first() else {
        return Err("empty descriptor".into());
    };
    let mut len = 0usize;
    for (i, &b) in buf[1..].iter().take(4).enumerate() {
        len = (len << 7) | usize::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Ok((tag, len, i + 2));
        }
    }
    Err(format!("bad size field in descriptor with tag 0x{tag:02x}"))
}

/// An `ES_Descriptor` for one RTP stream.
#[derive(Clone, Debug)]
pub struct EsDescriptor {
    pub es_id: u16,
    pub depends_on: Option<u16>,
    pub ocr_es_id: Option<u16>,
    pub decoder_config: DecoderConfig,

    /// Composition timestamp resolution; the RTP clock rate.
    pub timestamp_resolution: u32,
}

impl EsDescriptor {
    fn put(&self, out: &mut BytesMut) {
        let mut b = BytesMut::with_capacity(64);
        b.put_u16(self.es_id);
        // streamDependenceFlag, URL_Flag, OCRstreamFlag, streamPriority(5).
        b.put_u8(
            (u8::from(self.depends_on.is_some()) << 7) | (u8::from(self.ocr_es_id.is_some()) << 5),
        );
        if let Some(d) = self.depends_on {
            b.put_u16(d);
        }
        if let Some(o) = self.ocr_es_id {
            b.put_u16(o);
        }

        let c = &self.decoder_config;
        let mut dcd = BytesMut::with_capacity(32);
        dcd.put_u8(c.object_type_indication);
        dcd.put_u8((c.stream_type.0 << 2) | 0x01); // upStream=0, reserved=1
        dcd.put_uint(0, 3); // bufferSizeDB
        dcd.put_u32(0); // maxBitrate
        dcd.put_u32(0); // avgBitrate
        if let Some(dsi) = &c.decoder_specific_info {
            put_descriptor(&mut dcd, tag::DECODER_SPECIFIC_INFO, dsi);
        }
        put_descriptor(&mut b, tag::DECODER_CONFIG, &dcd);

        // Custom SLConfigDescriptor matching the fields depacketizers fill.
        let mut sl = BytesMut::with_capacity(20);
        sl.put_u8(0); // predefined
        // useAccessUnitStart/End, useRandomAccessPoint, hasRandomAccessUnitsOnly,
        // usePadding, useTimeStamps, useIdle, duration.
        sl.put_u8(0b1110_0100);
        sl.put_u32(self.timestamp_resolution);
        sl.put_u32(0); // OCRResolution
        sl.put_u8(32); // timeStampLength
        sl.put_u8(0); // OCRLength
        sl.put_u8(0); // AU_Length
        sl.put_u8(0); // instantBitrateLength
        // degradationPriorityLength(4), AU_seqNumLength(5), packetSeqNumLength(5), reserved(2).
        sl.put_u16((16 << 2) | 0b11);
        put_descriptor(&mut b, tag::SL_CONFIG, &sl);
        put_descriptor(out, tag::ES_DESCRIPTOR, &b);
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.put(&mut out);
        out.freeze()
    }
}

/// An `ObjectDescriptor` grouping the elementary streams of one media object.
#[derive(Clone, Debug)]
pub struct ObjectDescriptor {
    /// 10-bit `ObjectDescriptorID`.
    pub id: u16,
    pub es: Vec<EsDescriptor>,
}

impl ObjectDescriptor {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(128);
        // ObjectDescriptorID(10), URL_Flag(1), reserved(5).
        b.put_u16(((self.id & 0x3FF) << 6) | 0x1F);
        for es in &self.es {
            es.put(&mut b);
        }
        let mut out = BytesMut::with_capacity(b.len() + 5);
        put_descriptor(&mut out, tag::OBJECT_DESCRIPTOR, &b);
        out.freeze()
    }
}

/// An `InitialObjectDescriptor` with no profile requirements.
#[derive(Clone, Debug)]
pub struct InitialObjectDescriptor {
    pub id: u16,
    pub es: Vec<EsDescriptor>,
}

impl InitialObjectDescriptor {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(128);
        // ObjectDescriptorID(10), URL_Flag(1), includeInlineProfileLevelFlag(1), reserved(4).
        b.put_u16(((self.id & 0x3FF) << 6) | 0x0F);
        // OD, scene, audio, visual, and graphics profiles: no capability required.
        b.put_slice(&[0xFF; 5]);
        for es in &self.es {
            es.put(&mut b);
        }
        let mut out = BytesMut::with_capacity(b.len() + 5);
        put_descriptor(&mut out, tag::INITIAL_OBJECT_DESCRIPTOR, &b);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{oti, StreamType};
    use super::*;

    fn aac_es() -> EsDescriptor {
        EsDescriptor {
            es_id: 2,
            depends_on: None,
            ocr_es_id: None,
            decoder_config: DecoderConfig {
                stream_type: StreamType::AUDIO,
                object_type_indication: oti::MPEG4_AUDIO,
                decoder_specific_info: Some(Bytes::from_static(b"\x11\x90")),
            },
            timestamp_resolution: 48_000,
        }
    }

    #[test]
    fn sizes() {
        let mut out = BytesMut::new();
        put_descriptor(&mut out, 5, &[0; 0x7F]);
        assert_eq!(&out[..2], &[5, 0x7F]);
        assert_eq!(read_header(&out).unwrap(), (5, 0x7F, 2));

        let mut out = BytesMut::new();
        put_descriptor(&mut out, 5, &[0; 0x80]);
        assert_eq!(&out[..3], &[5, 0x81, 0x00]);
        assert_eq!(read_header(&out).unwrap(), (5, 0x80, 3));

        read_header(&[5, 0x80, 0x80, 0x80, 0x80, 0x01]).unwrap_err();
    }

    #[test]
    fn es_descriptor() {
        let es = aac_es().encode();
        let (t, len, hlen) = read_header(&es).unwrap();
        assert_eq!(t, tag::ES_DESCRIPTOR);
        assert_eq!(hlen + len, es.len());
        assert_eq!(&es[2..5], &[0x00, 0x02, 0x00]);

        // DecoderConfigDescriptor, then its DecoderSpecificInfo at the end.
        let (t, dcd_len, _) = read_header(&es[5..]).unwrap();
        assert_eq!(t, tag::DECODER_CONFIG);
        assert_eq!(es[7], oti::MPEG4_AUDIO);
        assert_eq!(es[8], 0x15);
        assert_eq!(&es[7 + dcd_len - 4..7 + dcd_len], &[0x05, 0x02, 0x11, 0x90]);

        let (t, sl_len, _) = read_header(&es[7 + dcd_len..]).unwrap();
        assert_eq!(t, tag::SL_CONFIG);
        assert_eq!(sl_len, 16);
        assert_eq!(&es[9 + dcd_len + 2..9 + dcd_len + 6], &48_000u32.to_be_bytes());
    }

    #[test]
    fn object_descriptors() {
        let od = ObjectDescriptor {
            id: 3,
            es: vec![aac_es()],
        }
        .encode();
        assert_eq!(od[0], tag::OBJECT_DESCRIPTOR);
        assert_eq!(&od[2..4], &[0x00, 0xDF]);
        assert_eq!(od[4], tag::ES_DESCRIPTOR);

        let iod = InitialObjectDescriptor {
            id: 1,
            es: vec![aac_es()],
        }
        .encode();
        let (t, len, hlen) = read_header(&iod).unwrap();
        assert_eq!(t, tag::INITIAL_OBJECT_DESCRIPTOR);
        assert_eq!(len + hlen, iod.len());
        assert_eq!(&iod[2..4], &[0x00, 0x4F]);
        assert_eq!(iod[9], tag::ES_DESCRIPTOR);
    }
}
