// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock transports and host for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use rtsp_types::{headers, Request};
use url::Url;

use crate::client::transport::{
    Connector, RtpBinding, RtpTransport, RtspTransport, TransportState,
};
use crate::client::{ChannelCommand, ChannelHandle, HostService, SlStatus};
use crate::codec::SlHeader;
use crate::{
    ConnectionContext, Error, ErrorKind, ReceivedMessage, RtspMessageContext, StreamContext,
};

pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

pub(crate) fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::from_static(b)),
        _ => panic!("unexpected message type"),
    }
}

/// Builds the reply to `req` with its CSeq.
pub(crate) fn reply(
    req: &Request<Bytes>,
    status: u16,
    headers: &[(&str, &str)],
    body: &str,
) -> ReceivedMessage {
    let cseq = req
        .header(&headers::CSEQ)
        .map(|v| v.as_str().to_owned())
        .unwrap();
    let mut raw = format!("RTSP/1.0 {status} Whatever\r\nCSeq: {cseq}\r\n");
    for (k, v) in headers {
        raw.push_str(&format!("{k}: {v}\r\n"));
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    let raw = Bytes::from(raw);
    let (msg, len) = rtsp_types::Message::parse(&raw[..]).unwrap();
    assert_eq!(len, raw.len());
    let resp = match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| raw.slice_ref(b)),
        _ => panic!("unexpected message type"),
    };
    ReceivedMessage {
        ctx: RtspMessageContext::dummy(),
        msg: rtsp_types::Message::Response(resp),
    }
}

pub(crate) fn interleaved(channel_id: u8, data: Bytes) -> ReceivedMessage {
    ReceivedMessage {
        ctx: RtspMessageContext::dummy(),
        msg: rtsp_types::Message::Data(rtsp_types::Data::new(channel_id, data)),
    }
}

pub(crate) type Responder = Box<dyn FnMut(&Request<Bytes>) -> Option<ReceivedMessage> + Send>;

/// The server side of [`MockConnector`] connections, shared with the test.
pub(crate) struct MockServer {
    pub(crate) connected: Vec<Url>,
    pub(crate) sent: Vec<Request<Bytes>>,
    pub(crate) data_sent: Vec<(u8, Bytes)>,
    pub(crate) incoming: VecDeque<ReceivedMessage>,
    pub(crate) resets: usize,
    pub(crate) bindings: Vec<RtpBinding>,
    pub(crate) posted: Vec<(Url, Bytes)>,
    responder: Responder,
}

impl MockServer {
    pub(crate) fn new(responder: Responder) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(MockServer {
            connected: Vec::new(),
            sent: Vec::new(),
            data_sent: Vec::new(),
            incoming: VecDeque::new(),
            resets: 0,
            bindings: Vec::new(),
            posted: Vec::new(),
            responder,
        }))
    }

    /// Methods of the requests sent so far.
    pub(crate) fn methods(&self) -> Vec<rtsp_types::Method> {
        self.sent.iter().map(|r| r.method().clone()).collect()
    }
}

pub(crate) struct MockRtsp(Arc<Mutex<MockServer>>);

impl RtspTransport for MockRtsp {
    fn ctx(&self) -> ConnectionContext {
        ConnectionContext::dummy()
    }

    fn state(&self) -> TransportState {
        TransportState::Ready
    }

    fn send(&mut self, req: Request<Bytes>) -> Result<(), Error> {
        let mut server = self.0.lock().unwrap();
        if let Some(reply) = (server.responder)(&req) {
            server.incoming.push_back(reply);
        }
        server.sent.push(req);
        Ok(())
    }

    fn send_data(&mut self, channel_id: u8, data: Bytes) -> Result<(), Error> {
        self.0.lock().unwrap().data_sent.push((channel_id, data));
        Ok(())
    }

    fn poll_message(&mut self) -> Result<Option<ReceivedMessage>, Error> {
        Ok(self.0.lock().unwrap().incoming.pop_front())
    }

    fn reset(&mut self) {
        self.0.lock().unwrap().resets += 1;
    }
}

/// A UDP pair which never receives anything.
pub(crate) struct MockRtp {
    port: u16,
    multicast: bool,
}

impl RtpTransport for MockRtp {
    fn ctx(&self) -> StreamContext {
        StreamContext::dummy()
    }

    fn local_rtp_port(&self) -> u16 {
        self.port
    }

    fn is_multicast(&self) -> bool {
        self.multicast
    }

    fn set_peer(&mut self, _rtp_addr: std::net::SocketAddr) {}

    fn recv_rtp(&mut self) -> Result<Option<Bytes>, Error> {
        Ok(None)
    }

    fn recv_rtcp(&mut self) -> Result<Option<Bytes>, Error> {
        Ok(None)
    }

    fn send_rtcp(&mut self, _data: Bytes) -> Result<(), Error> {
        Ok(())
    }

    fn send_nat_keepalive(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub(crate) struct MockConnector(pub(crate) Arc<Mutex<MockServer>>);

impl Connector for MockConnector {
    fn connect_rtsp<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<Box<dyn RtspTransport>, Error>> {
        self.0.lock().unwrap().connected.push(url.clone());
        let t: Box<dyn RtspTransport> = Box::new(MockRtsp(self.0.clone()));
        Box::pin(futures::future::ready(Ok(t)))
    }

    fn open_rtp(&self, binding: RtpBinding) -> Result<Box<dyn RtpTransport>, Error> {
        let mut server = self.0.lock().unwrap();
        let port = binding
            .first_port
            .unwrap_or(5000 + 2 * server.bindings.len() as u16);
        server.bindings.push(binding);
        Ok(Box::new(MockRtp {
            port,
            multicast: binding.multicast.is_some(),
        }))
    }

    fn post<'a>(&'a self, url: &'a Url, body: Bytes) -> BoxFuture<'a, Result<(), Error>> {
        self.0.lock().unwrap().posted.push((url.clone(), body));
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// A host callback, with errors reduced to their kind.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Recorded {
    Connect(Option<ChannelHandle>, Result<(), ErrorKind>),
    Disconnect(Result<(), ErrorKind>),
    Command(ChannelCommand, Result<(), ErrorKind>),
    Packet {
        channel: ChannelHandle,
        data: Bytes,
        header: SlHeader,
        status: SlStatus,
    },
    Message(Result<(), ErrorKind>, String),
}

#[derive(Default)]
pub(crate) struct RecordingHost {
    events: Mutex<Vec<Recorded>>,
    pub(crate) occupancy: Mutex<Option<Duration>>,
}

impl RecordingHost {
    /// Returns and forgets the callbacks so far.
    pub(crate) fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, r: Recorded) {
        self.events.lock().unwrap().push(r);
    }
}

fn kind(r: Result<(), Error>) -> Result<(), ErrorKind> {
    r.map_err(|e| e.kind())
}

impl HostService for RecordingHost {
    fn on_connect(&self, channel: Option<ChannelHandle>, result: Result<(), Error>) {
        self.push(Recorded::Connect(channel, kind(result)));
    }

    fn on_disconnect(&self, result: Result<(), Error>) {
        self.push(Recorded::Disconnect(kind(result)));
    }

    fn on_command(&self, command: &ChannelCommand, result: Result<(), Error>) {
        self.push(Recorded::Command(command.clone(), kind(result)));
    }

    fn on_sl_packet(&self, channel: ChannelHandle, data: Bytes, header: &SlHeader, status: SlStatus) {
        self.push(Recorded::Packet {
            channel,
            data,
            header: header.clone(),
            status,
        });
    }

    fn on_message(&self, result: Result<(), Error>, message: &str) {
        self.push(Recorded::Message(kind(result), message.to_owned()));
    }

    fn buffer_occupancy(&self, _channel: ChannelHandle) -> Option<Duration> {
        *self.occupancy.lock().unwrap()
    }
}
