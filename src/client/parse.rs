// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers and NPT ranges.

use std::net::IpAddr;

use bytes::Bytes;
use url::Url;

/// Joins a control URL to a base URL in a non-RFC-compliant but common way.
/// This matches what live555 and ffmpeg do: relative controls are appended
/// to the base rather than replacing its last path segment.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }
    let sep = if base_url.as_str().ends_with('/') {
        ""
    } else {
        "/"
    };
    Url::parse(&format!("{}{}{}", base_url.as_str(), sep, control))
        .map_err(|e| format!("unable to join base url {base_url} with control {control:?}: {e}"))
}

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str().trim(), 10).ok())
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

/// Parses a `Session` header value, as in
/// [RFC 2326 section 12.37](https://datatracker.ietf.org/doc/html/rfc2326#section-12.37).
pub(crate) fn parse_session(value: &str) -> Result<SessionHeader, String> {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or_default().trim();
    if id.is_empty() {
        return Err(format!("empty Session header {value:?}"));
    }
    let mut timeout_sec = 60; // default
    for p in parts {
        if let Some(v) = p.trim().strip_prefix("timeout=") {
            timeout_sec =
                u32::from_str_radix(v, 10).map_err(|_| format!("Unparseable timeout {v}"))?;
        }
    }
    Ok(SessionHeader {
        id: id.into(),
        timeout_sec,
    })
}

/// One transport from a `SETUP` response's `Transport` header.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TransportSpec {
    pub(crate) profile: String,
    pub(crate) multicast: bool,
    pub(crate) interleaved: Option<u8>,
    pub(crate) ssrc: Option<u32>,
    pub(crate) source: Option<IpAddr>,
    pub(crate) destination: Option<IpAddr>,
    pub(crate) server_port: Option<(u16, u16)>,
    pub(crate) client_port: Option<(u16, u16)>,

    /// Multicast `port=`.
    pub(crate) port: Option<(u16, u16)>,
}

fn parse_port_pair(s: &str) -> Result<(u16, u16), String> {
    let (a, b) = match s.split_once('-') {
        Some((a, b)) => (a, Some(b)),
        None => (s, None),
    };
    let a = u16::from_str_radix(a, 10).map_err(|_| format!("bad port {a:?}"))?;
    let b = match b {
        Some(b) => u16::from_str_radix(b, 10).map_err(|_| format!("bad port {b:?}"))?,
        None => a.saturating_add(1),
    };
    Ok((a, b))
}

/// Parses a `Transport` header, as in
/// [RFC 2326 section 12.39](https://datatracker.ietf.org/doc/html/rfc2326#section-12.39).
/// Servers may list several transports separated by commas.
pub(crate) fn parse_transports(value: &str) -> Result<Vec<TransportSpec>, String> {
    let mut out = Vec::new();
    for t in value.split(',') {
        let mut parts = t.split(';');
        let mut spec = TransportSpec {
            profile: parts.next().unwrap_or_default().trim().to_owned(),
            ..Default::default()
        };
        for part in parts {
            let part = part.trim();
            let (key, v) = part.split_once('=').unwrap_or((part, ""));
            match key {
                "multicast" => spec.multicast = true,
                "ssrc" => {
                    // Some servers send leading spaces or fewer than 8 digits.
                    spec.ssrc = Some(
                        u32::from_str_radix(v.trim(), 16)
                            .map_err(|_| format!("Unparseable ssrc {v}"))?,
                    )
                }
                "interleaved" => {
                    let (n, m) = parse_port_pair(v)?;
                    let n = u8::try_from(n).map_err(|_| format!("bad channel number {n}"))?;
                    if u16::from(n) + 1 != m {
                        log::debug!("non-adjacent interleaved channels {}", v);
                    }
                    spec.interleaved = Some(n);
                }
                "source" => {
                    spec.source = Some(
                        v.parse()
                            .map_err(|_| format!("Transport header has unparseable source {v:?}"))?,
                    )
                }
                "destination" => spec.destination = v.parse().ok(),
                "server_port" => spec.server_port = Some(parse_port_pair(v)?),
                "client_port" => spec.client_port = Some(parse_port_pair(v)?),
                "port" => spec.port = Some(parse_port_pair(v)?),
                _ => {}
            }
        }
        out.push(spec);
    }
    Ok(out)
}

/// One entry of an `RTP-Info` header.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RtpInfo {
    pub(crate) url: String,
    pub(crate) seq: Option<u16>,
    pub(crate) rtptime: Option<u32>,
    pub(crate) ssrc: Option<u32>,
}

/// Parses an `RTP-Info` header, as in
/// [RFC 2326 section 12.33](https://tools.ietf.org/html/rfc2326#section-12.33).
pub(crate) fn parse_rtp_info(value: &str) -> Result<Vec<RtpInfo>, String> {
    let mut out = Vec::new();
    // URLs may themselves contain commas; entries start with "url=".
    let mut entries: Vec<String> = Vec::new();
    for s in value.split(',') {
        match entries.last_mut() {
            Some(last) if !s.trim_start().starts_with("url=") => {
                last.push(',');
                last.push_str(s);
            }
            _ => entries.push(s.to_owned()),
        }
    }
    for s in &entries {
        let mut parts = s.trim().split(';');
        let url = parts
            .next()
            .unwrap_or_default()
            .strip_prefix("url=")
            .ok_or_else(|| "RTP-Info missing stream URL".to_string())?;
        let mut info = RtpInfo {
            url: url.to_owned(),
            seq: None,
            rtptime: None,
            ssrc: None,
        };
        for part in parts {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| "RTP-Info param has no =".to_string())?;
            match key {
                "seq" => {
                    info.seq = Some(
                        u16::from_str_radix(value, 10).map_err(|_| format!("bad seq {value:?}"))?,
                    )
                }
                "rtptime" => {
                    info.rtptime = Some(
                        u32::from_str_radix(value, 10)
                            .map_err(|_| format!("bad rtptime {value:?}"))?,
                    )
                }
                "ssrc" => {
                    info.ssrc = Some(
                        u32::from_str_radix(value, 16)
                            .map_err(|_| format!("Unparseable ssrc {value}"))?,
                    )
                }
                _ => {}
            }
        }
        out.push(info);
    }
    Ok(out)
}

/// Parses an `npt=` range from a `Range` header or `a=range` attribute.
///
/// Returns `None` for other time formats and for live (`now-`) ranges.
pub(crate) fn parse_npt_range(value: &str) -> Option<(f64, Option<f64>)> {
    let v = value.trim().strip_prefix("npt")?.trim_start();
    let v = v.strip_prefix('=').or_else(|| v.strip_prefix(':'))?;
    let v = v.split(';').next().unwrap_or_default().trim();
    let (start, end) = v.split_once('-')?;
    let start = if start.trim().is_empty() {
        0.0
    } else {
        parse_npt_time(start.trim())?
    };
    let end = match end.trim() {
        "" => None,
        e => Some(parse_npt_time(e)?),
    };
    Some((start, end))
}

/// Parses `npt-sec` or `npt-hhmmss`.
fn parse_npt_time(s: &str) -> Option<f64> {
    if s == "now" {
        return None;
    }
    let mut secs = 0.0;
    for p in s.split(':') {
        secs = secs * 60.0 + p.parse::<f64>().ok()?;
    }
    Some(secs)
}

/// Formats a `Range` header value.
pub(crate) fn format_npt_range(start: f64, end: Option<f64>) -> String {
    match end {
        Some(e) => format!("npt={start:.3}-{e:.3}"),
        None => format!("npt={start:.3}-"),
    }
}
