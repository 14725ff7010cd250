// SPDX-License-Identifier: MIT OR Apache-2.0

//! The interface to the consuming media pipeline.

use std::time::Duration;

use bytes::Bytes;

use crate::codec::SlHeader;
use crate::Error;

/// A host-assigned identifier for one elementary stream channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelCommandKind {
    /// Plays from `start` seconds (relative to the signaled range start) to
    /// `end`, or to the end of the range if `None`.
    Play { start: f64, end: Option<f64> },
    Pause,

    /// Plays from where the previous pause left off.
    Resume,
    Stop,
}

/// A host request on one channel. It's handed back through
/// [`HostService::on_command`] once applied or failed.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelCommand {
    pub channel: ChannelHandle,
    pub kind: ChannelCommandKind,
}

/// Whether an [`HostService::on_sl_packet`] call carries data or ends the stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlStatus {
    Data,

    /// No further packets follow; the data is empty.
    EndOfStream,
}

/// Callbacks into the host.
///
/// These are never invoked with internal locks held, so an implementation
/// may call back into the [`super::SessionManager`].
pub trait HostService: Send + Sync {
    /// Reports the result of connecting the service (`channel` is `None`) or
    /// one channel. Called exactly once per connect attempt.
    fn on_connect(&self, channel: Option<ChannelHandle>, result: Result<(), Error>);

    fn on_disconnect(&self, result: Result<(), Error>);

    fn on_command(&self, command: &ChannelCommand, result: Result<(), Error>);

    fn on_sl_packet(&self, channel: ChannelHandle, data: Bytes, header: &SlHeader, status: SlStatus);

    /// Reports progress or a non-fatal problem such as UDP silence.
    fn on_message(&self, result: Result<(), Error>, message: &str);

    /// How much media is buffered downstream of `channel`. Interleaved
    /// streams are only read while this is below the configured buffer length.
    fn buffer_occupancy(&self, channel: ChannelHandle) -> Option<Duration> {
        let _ = channel;
        None
    }
}

/// A callback collected while the manager lock is held, dispatched after.
#[derive(Debug)]
pub(crate) enum HostEvent {
    Connect(Option<ChannelHandle>, Result<(), Error>),
    Disconnect(Result<(), Error>),
    Command(ChannelCommand, Result<(), Error>),
    SlPacket {
        channel: ChannelHandle,
        data: Bytes,
        header: SlHeader,
        status: SlStatus,
    },
    Message(Result<(), Error>, String),
}

impl HostEvent {
    pub(crate) fn dispatch(self, host: &dyn HostService) {
        match self {
            HostEvent::Connect(channel, r) => host.on_connect(channel, r),
            HostEvent::Disconnect(r) => host.on_disconnect(r),
            HostEvent::Command(c, r) => host.on_command(&c, r),
            HostEvent::SlPacket {
                channel,
                data,
                header,
                status,
            } => host.on_sl_packet(channel, data, &header, status),
            HostEvent::Message(r, m) => host.on_message(r, &m),
        }
    }
}
