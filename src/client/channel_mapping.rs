// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Routing of RTSP interleaved channels to streams.

use std::num::NonZeroU8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChannelType {
    Rtp,
    Rtcp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChannelMapping {
    pub(crate) stream_i: usize,
    pub(crate) channel_type: ChannelType,
}

/// Interleaved channel assignments of one RTSP session.
///
/// Even channel ids carry RTP and their odd successors RTCP for the same
/// stream, as `interleaved=n` implies in
/// [RFC 2326 section 10.12](https://tools.ietf.org/html/rfc2326#section-10.12).
/// Each slot holds the stream index plus one, so at most 254 streams can be
/// mapped.
#[derive(Default)]
pub(crate) struct ChannelMappings(smallvec::SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelMappings {
    /// Assigns an even channel id to RTP and its odd successor to RTCP.
    ///
    /// Reassigning a pair to the stream that already holds it is a no-op,
    /// which happens when a disconnected stream is set up again.
    pub(crate) fn assign(&mut self, channel_id: u8, stream_i: usize) -> Result<(), String> {
        if (channel_id & 1) != 0 {
            return Err(format!("Can't assign odd channel id {channel_id}"));
        }
        let slot = u8::try_from(stream_i + 1)
            .ok()
            .and_then(NonZeroU8::new)
            .ok_or_else(|| format!("Can't map channel {channel_id} to stream {stream_i}"))?;
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        match self.0[i] {
            Some(c) if c != slot => Err(format!(
                "Channel id {} is already assigned to stream {}; won't reassign to stream {}",
                channel_id,
                c.get() - 1,
                stream_i
            )),
            _ => {
                self.0[i] = Some(slot);
                Ok(())
            }
        }
    }

    /// Drops whatever pair is assigned to `stream_i`.
    pub(crate) fn unassign(&mut self, stream_i: usize) {
        for c in self.0.iter_mut() {
            if matches!(c, Some(s) if usize::from(s.get() - 1) == stream_i) {
                *c = None;
            }
        }
    }

    pub(crate) fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let c = (*self.0.get(usize::from(channel_id >> 1))?)?;
        Some(ChannelMapping {
            stream_i: usize::from(c.get() - 1),
            channel_type: if (channel_id & 1) != 0 {
                ChannelType::Rtcp
            } else {
                ChannelType::Rtp
            },
        })
    }
}

impl std::fmt::Debug for ChannelMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().enumerate().filter_map(|(i, v)| {
                v.map(|v| (format!("{}-{}", i << 1, (i << 1) + 1), v.get() - 1))
            }))
            .finish()
    }
}
