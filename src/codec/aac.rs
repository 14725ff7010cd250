// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC (Advanced Audio Codec) configuration.
//! There are many intertwined standards; see the following references:
//! *   [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640): RTP Payload
//!     for Transport of MPEG-4 Elementary Streams.
//! *   [RFC 6416](https://datatracker.ietf.org/doc/html/rfc6416): RTP Payload
//!     Format for MPEG-4 Audio/Visual Streams (LATM).
//! *   ISO/IEC 14496-3: Audio, subpart 1: Main.

use std::num::NonZeroU16;

use bitstream_io::{BitRead, BitWrite};

/// An AudioSpecificConfig as in ISO/IEC 14496-3 section 1.6.2.1.
///
/// Keeps what's needed to time access units.
#[derive(Clone, Debug)]
pub(crate) struct AudioSpecificConfig {
    pub(crate) sampling_frequency: u32,
    pub(crate) channels: &'static ChannelConfig,
    pub(crate) frame_length: NonZeroU16,
}

/// A channel configuration as in ISO/IEC 14496-3 Table 1.19.
#[derive(Debug)]
pub(crate) struct ChannelConfig {
    pub(crate) channels: u16,

    /// A human-friendly name for the channel configuration.
    // The name is used in tests and in the Debug output. Suppress dead code warning.
    #[cfg_attr(not(test), allow(dead_code))]
    name: &'static str,
}

#[rustfmt::skip]
const CHANNEL_CONFIGS: [Option<ChannelConfig>; 8] = [
    /* 0 */ None, // "defined in AOT related SpecificConfig"
    /* 1 */ Some(ChannelConfig { channels: 1, name: "mono" }),
    /* 2 */ Some(ChannelConfig { channels: 2, name: "stereo" }),
    /* 3 */ Some(ChannelConfig { channels: 3, name: "3.0" }),
    /* 4 */ Some(ChannelConfig { channels: 4, name: "4.0" }),
    /* 5 */ Some(ChannelConfig { channels: 5, name: "5.0" }),
    /* 6 */ Some(ChannelConfig { channels: 6, name: "5.1" }),
    /* 7 */ Some(ChannelConfig { channels: 8, name: "7.1" }),
];

/// ISO/IEC 14496-3 section 1.6.3.3, indices 0x0 through 0xc.
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

fn read_sampling_frequency<R: BitRead>(r: &mut R) -> Result<(u8, u32), String> {
    let i = r
        .read::<u8>(4)
        .map_err(|e| format!("unable to read sampling_frequency: {e}"))?;
    let f = match i {
        0x0..=0xc => SAMPLING_FREQUENCIES[usize::from(i)],
        0xd | 0xe => return Err(format!("reserved sampling_frequency_index value 0x{i:x}")),
        _ => r
            .read::<u32>(24)
            .map_err(|e| format!("unable to read sampling_frequency ext: {e}"))?,
    };
    Ok((i, f))
}

impl AudioSpecificConfig {
    /// Parses from raw bytes.
    pub(crate) fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
        let audio_object_type = match r
            .read::<u8>(5)
            .map_err(|e| format!("unable to read audio_object_type: {e}"))?
        {
            31 => {
                32 + r
                    .read::<u8>(6)
                    .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
            }
            o => o,
        };
        let (_, sampling_frequency) = read_sampling_frequency(&mut r)?;
        let channels_config_id = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read channels: {e}"))?;
        let channels = CHANNEL_CONFIGS
            .get(usize::from(channels_config_id))
            .ok_or_else(|| format!("reserved channelConfiguration 0x{channels_config_id:x}"))?
            .as_ref()
            .ok_or_else(|| "program_config_element parsing unimplemented".to_string())?;
        let mut core_object_type = audio_object_type;
        if audio_object_type == 5 || audio_object_type == 29 {
            // extensionSamplingFrequencyIndex + extensionSamplingFrequency.
            read_sampling_frequency(&mut r)?;
            core_object_type = r
                .read::<u8>(5)
                .map_err(|e| format!("unable to read second audioObjectType: {e}"))?;
            if core_object_type == 22 {
                r.skip(4)
                    .map_err(|e| format!("unable to read extensionChannelConfiguration: {e}"))?;
            }
        }

        // The supported types here are the ones that use GASpecificConfig.
        match core_object_type {
            1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23 => {}
            o => return Err(format!("unsupported audio_object_type {o}")),
        }

        // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length_flag = r
            .read_bit()
            .map_err(|e| format!("unable to read frame_length_flag: {e}"))?;
        let frame_length = match (core_object_type, frame_length_flag) {
            (3 /* AAC SR */, false) => 256,
            (3 /* AAC SR */, true) => {
                return Err("frame_length_flag must be false for AAC SSR".into())
            }
            (23 /* ER AAC LD */, false) => 512,
            (23 /* ER AAC LD */, true) => 480,
            (_, false) => 1024,
            (_, true) => 960,
        };

        Ok(AudioSpecificConfig {
            sampling_frequency,
            channels,
            frame_length: NonZeroU16::new(frame_length).ok_or("zero frame length")?,
        })
    }
}

/// Rewrites a LATM `StreamMuxConfig` (ISO/IEC 14496-3 section 1.7.3.1) as a
/// plain `AudioSpecificConfig`.
///
/// Only the simple single-program, single-layer form is supported.
pub(crate) fn stream_mux_config_to_asc(raw: &[u8]) -> Result<Vec<u8>, String> {
    let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
    let mut read = |bits: u32, what: &str| {
        r.read::<u32>(bits)
            .map_err(|e| format!("unable to read {what}: {e}"))
    };
    let audio_mux_version = read(1, "audioMuxVersion")?;
    let all_streams_same_time_framing = read(1, "allStreamsSameTimeFraming")?;
    let num_sub_frames = read(6, "numSubFrames")?;
    let num_program = read(4, "numProgram")?;
    let num_layer = read(3, "numLayer")?;
    if audio_mux_version != 0
        || all_streams_same_time_framing != 1
        || num_sub_frames != 0
        || num_program != 0
        || num_layer != 0
    {
        return Err(format!(
            "unsupported StreamMuxConfig audioMuxVersion={audio_mux_version} \
             allStreamsSameTimeFraming={all_streams_same_time_framing} \
             numSubFrames={num_sub_frames} numProgram={num_program} numLayer={num_layer}"
        ));
    }
    let audio_object_type = read(5, "audio_object_type")?;
    let sampling_frequency_index = read(4, "sampling_frequency_index")?;
    let sampling_frequency = if sampling_frequency_index == 0xf {
        Some(read(24, "sampling_frequency")?)
    } else {
        None
    };
    let channel_config = read(4, "channelConfiguration")?;

    // The SBR extension, if any, is implied by the rewritten core config.
    let mut w = bitstream_io::BitWriter::endian(Vec::new(), bitstream_io::BigEndian);
    let write = |w: &mut bitstream_io::BitWriter<Vec<u8>, bitstream_io::BigEndian>,
                 bits: u32,
                 v: u32| {
        w.write(bits, v).map_err(|e| format!("unable to write: {e}"))
    };
    write(&mut w, 5, audio_object_type)?;
    write(&mut w, 4, sampling_frequency_index)?;
    if let Some(f) = sampling_frequency {
        write(&mut w, 24, f)?;
    }
    write(&mut w, 4, channel_config)?;
    w.byte_align().map_err(|e| format!("unable to write: {e}"))?;
    Ok(w.into_writer())
}

/// Builds an AAC-LC `AudioSpecificConfig` for streams which signal none.
pub(crate) fn default_config(clock_rate: u32, channels: u16) -> Vec<u8> {
    let mut w = bitstream_io::BitWriter::endian(Vec::with_capacity(5), bitstream_io::BigEndian);
    let r: std::io::Result<()> = (|| {
        w.write(5, 2u8)?; // AAC LC
        match SAMPLING_FREQUENCIES.iter().position(|&f| f == clock_rate) {
            Some(i) => w.write(4, i as u8)?,
            None => {
                w.write(4, 0xfu8)?;
                w.write(24, clock_rate & 0xFF_FFFF)?;
            }
        }
        w.write(4, channels.min(7) as u8)?;
        w.byte_align()
    })();
    debug_assert!(r.is_ok(), "writes to a Vec can't fail");
    w.into_writer()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_audio_specific_config() {
        let dahua = AudioSpecificConfig::parse(&[0x11, 0x88]).unwrap();
        assert_eq!(dahua.sampling_frequency, 48_000);
        assert_eq!(dahua.channels.name, "mono");
        assert_eq!(dahua.frame_length.get(), 1024);

        let bunny = AudioSpecificConfig::parse(&[0x14, 0x90]).unwrap();
        assert_eq!(bunny.sampling_frequency, 12_000);
        assert_eq!(bunny.channels.name, "stereo");

        let rfc3640 = AudioSpecificConfig::parse(&[0x11, 0xB0]).unwrap();
        assert_eq!(rfc3640.sampling_frequency, 48_000);
        assert_eq!(rfc3640.channels.name, "5.1");

        // frameLengthFlag set.
        let short = AudioSpecificConfig::parse(&[0x11, 0x8c]).unwrap();
        assert_eq!(short.frame_length.get(), 960);
    }

    #[test]
    fn latm_config() {
        // audioMuxVersion=0, allStreamsSameTimeFraming=1, numSubFrames=0,
        // numProgram=0, numLayer=0, then AAC LC 24 kHz mono.
        let asc = stream_mux_config_to_asc(&[0x40, 0x00, 0x26, 0x10]).unwrap();
        assert_eq!(asc, [0x13, 0x08]);
        let parsed = AudioSpecificConfig::parse(&asc).unwrap();
        assert_eq!(parsed.sampling_frequency, 24_000);
        assert_eq!(parsed.channels.channels, 1);

        // numProgram != 0.
        stream_mux_config_to_asc(&[0x40, 0x10, 0x26, 0x10]).unwrap_err();
    }

    #[test]
    fn default() {
        assert_eq!(default_config(48_000, 2), [0x11, 0x90]);
        let asc = default_config(44_100, 1);
        assert_eq!(AudioSpecificConfig::parse(&asc).unwrap().sampling_frequency, 44_100);
    }
}
