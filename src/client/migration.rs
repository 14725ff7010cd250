// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session checkpoints for migration.
//!
//! A checkpoint is the original session description with each unicast
//! stream's port rewritten to the local RTP port and these extra attributes:
//!
//! ```text
//! a=x-session-id:<RTSP Session header id>
//! a=x-session-name:<RTSP URL of the session>
//! m=video <local RTP port> RTP/AVP 96
//! a=x-stream-state:server-port=6970-6971;ssrc=30A98EE7;npt=12.5;seq=4711;rtptime=3475222385
//! ```
//!
//! It's only read back by this crate; it isn't meant as an interoperable
//! extension.

use std::io::ErrorKind as IoErrorKind;

use bytes::Bytes;
use url::Url;

use crate::error::ErrorInt;
use crate::Error;

pub(crate) const SESSION_ID_ATTR: &str = "x-session-id";
pub(crate) const SESSION_NAME_ATTR: &str = "x-session-name";
pub(crate) const STREAM_STATE_ATTR: &str = "x-stream-state";

/// Where one stream was when the checkpoint was taken.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StreamCheckpoint {
    /// Local RTP port, to rebind on resume.
    pub(crate) client_port: u16,
    pub(crate) server_port: Option<(u16, u16)>,
    pub(crate) ssrc: Option<u32>,
    pub(crate) npt: f64,
    pub(crate) seq: u16,
    pub(crate) rtptime: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Checkpoint {
    pub(crate) session_id: String,
    pub(crate) session_url: Url,

    /// Pairs of `m=` section index and that stream's state.
    pub(crate) streams: Vec<(usize, StreamCheckpoint)>,
}

impl StreamCheckpoint {
    fn attribute_value(&self) -> String {
        let mut v = String::new();
        if let Some((rtp, rtcp)) = self.server_port {
            v.push_str(&format!("server-port={rtp}-{rtcp};"));
        }
        if let Some(ssrc) = self.ssrc {
            v.push_str(&format!("ssrc={ssrc:08X};"));
        }
        v.push_str(&format!(
            "npt={};seq={};rtptime={}",
            self.npt, self.seq, self.rtptime
        ));
        v
    }

    /// Parses an `x-stream-state` attribute of the `m=` section with port `client_port`.
    pub(crate) fn parse(client_port: u16, value: &str) -> Result<Self, String> {
        let mut cp = StreamCheckpoint {
            client_port,
            server_port: None,
            ssrc: None,
            npt: 0.0,
            seq: 0,
            rtptime: 0,
        };
        for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| format!("bad {STREAM_STATE_ATTR} item {part:?}"))?;
            let bad = || format!("bad {STREAM_STATE_ATTR} {k} {v:?}");
            match k {
                "server-port" => {
                    let (a, b) = v.split_once('-').ok_or_else(bad)?;
                    cp.server_port = Some((
                        u16::from_str_radix(a, 10).map_err(|_| bad())?,
                        u16::from_str_radix(b, 10).map_err(|_| bad())?,
                    ));
                }
                "ssrc" => cp.ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| bad())?),
                "npt" => cp.npt = v.parse().map_err(|_| bad())?,
                "seq" => cp.seq = u16::from_str_radix(v, 10).map_err(|_| bad())?,
                "rtptime" => cp.rtptime = u32::from_str_radix(v, 10).map_err(|_| bad())?,
                _ => {}
            }
        }
        Ok(cp)
    }
}

fn is_checkpoint_attr(a: &sdp_types::Attribute) -> bool {
    matches!(
        a.attribute.as_str(),
        SESSION_ID_ATTR | SESSION_NAME_ATTR | STREAM_STATE_ATTR
    )
}

/// Serializes `sdp` annotated with `checkpoint`.
pub(crate) fn save(sdp: &sdp_types::Session, checkpoint: &Checkpoint) -> Result<Bytes, String> {
    let mut sdp = sdp.clone();
    sdp.attributes.retain(|a| !is_checkpoint_attr(a));
    sdp.attributes.push(sdp_types::Attribute {
        attribute: SESSION_ID_ATTR.to_owned(),
        value: Some(checkpoint.session_id.clone()),
    });
    sdp.attributes.push(sdp_types::Attribute {
        attribute: SESSION_NAME_ATTR.to_owned(),
        value: Some(checkpoint.session_url.to_string()),
    });
    for m in &mut sdp.medias {
        m.attributes.retain(|a| !is_checkpoint_attr(a));
    }
    for (i, s) in &checkpoint.streams {
        let m = sdp
            .medias
            .get_mut(*i)
            .ok_or_else(|| format!("checkpoint refers to missing media section {i}"))?;
        m.port = s.client_port;
        m.attributes.push(sdp_types::Attribute {
            attribute: STREAM_STATE_ATTR.to_owned(),
            value: Some(s.attribute_value()),
        });
    }
    let mut out = Vec::new();
    sdp.write(&mut out)
        .map_err(|e| format!("unable to serialize session description: {e}"))?;
    Ok(Bytes::from(out))
}

/// Reads a checkpoint file, returning `None` if there is none.
pub(crate) fn read(path: &str) -> Result<Option<Bytes>, Error> {
    match std::fs::read(path) {
        Ok(d) => Ok(Some(Bytes::from(d))),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(source) => bail!(ErrorInt::MigrationIoError {
            path: path.to_owned(),
            source,
        }),
    }
}

pub(crate) fn write(path: &str, data: &[u8]) -> Result<(), Error> {
    std::fs::write(path, data).map_err(|source| {
        wrap!(ErrorInt::MigrationIoError {
            path: path.to_owned(),
            source,
        })
    })
}

pub(crate) fn remove(path: &str) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != IoErrorKind::NotFound => bail!(ErrorInt::MigrationIoError {
            path: path.to_owned(),
            source: e,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &[u8] = b"v=0\r\n\
        o=- 1109162014219182 1 IN IP4 192.168.1.10\r\n\
        s=Session\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        a=range:npt=0-60\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=1\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 AMR/8000\r\n\
        a=fmtp:97 octet-align=1\r\n\
        a=control:trackID=2\r\n";

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            session_id: "634214675641".to_owned(),
            session_url: Url::parse("rtsp://192.168.1.10/movie").unwrap(),
            streams: vec![
                (
                    0,
                    StreamCheckpoint {
                        client_port: 5000,
                        server_port: Some((6970, 6971)),
                        ssrc: Some(0x30a98ee7),
                        npt: 12.5,
                        seq: 4711,
                        rtptime: 3475222385,
                    },
                ),
                (
                    1,
                    StreamCheckpoint {
                        client_port: 5002,
                        server_port: None,
                        ssrc: None,
                        npt: 12.48,
                        seq: 1,
                        rtptime: 0,
                    },
                ),
            ],
        }
    }

    #[test]
    fn stream_state_attribute() {
        let cp = &checkpoint().streams[0].1;
        let v = cp.attribute_value();
        assert_eq!(
            v,
            "server-port=6970-6971;ssrc=30A98EE7;npt=12.5;seq=4711;rtptime=3475222385"
        );
        assert_eq!(&StreamCheckpoint::parse(5000, &v).unwrap(), cp);
        StreamCheckpoint::parse(5000, "npt=x").unwrap_err();
        StreamCheckpoint::parse(5000, "seq").unwrap_err();
    }

    #[test]
    fn save_rewrites_description() {
        let sdp = sdp_types::Session::parse(SDP).unwrap();
        let saved = save(&sdp, &checkpoint()).unwrap();
        let reparsed = sdp_types::Session::parse(&saved).unwrap();
        assert_eq!(
            reparsed.get_first_attribute_value(SESSION_ID_ATTR).unwrap(),
            Some("634214675641")
        );
        assert_eq!(
            reparsed
                .get_first_attribute_value(SESSION_NAME_ATTR)
                .unwrap(),
            Some("rtsp://192.168.1.10/movie")
        );
        assert_eq!(reparsed.medias[0].port, 5000);
        assert_eq!(reparsed.medias[1].port, 5002);
        assert_eq!(
            reparsed.medias[1]
                .get_first_attribute_value(STREAM_STATE_ATTR)
                .unwrap(),
            Some("npt=12.48;seq=1;rtptime=0")
        );

        // Saving again replaces rather than duplicates the annotations.
        let again = save(&reparsed, &checkpoint()).unwrap();
        let reparsed = sdp_types::Session::parse(&again).unwrap();
        assert_eq!(
            reparsed
                .attributes
                .iter()
                .filter(|a| a.attribute == SESSION_ID_ATTR)
                .count(),
            1
        );
    }

    #[test]
    fn file_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.sdp");
        let path = path.to_str().unwrap();
        assert!(read(path).unwrap().is_none());
        write(path, b"v=0\r\n").unwrap();
        assert_eq!(&read(path).unwrap().unwrap()[..], b"v=0\r\n");
        remove(path).unwrap();
        remove(path).unwrap();
        assert!(read(path).unwrap().is_none());
    }
}
