// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server response frames and the typed bodies hiding behind the generic
//! 8-byte header.

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, I32, U16,
};

use crate::models::reqcode::{AttnCode, ResponseStatus};

pub const RESPONSE_HEADER_LEN: usize = 8;

/// Raw 8-byte response header in wire layout.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawResponseHeader {
    pub streamid: [u8; 2],         // opaque
    pub status: U16<BigEndian>,
    pub dlen: I32<BigEndian>,
}

/// Decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub streamid: [u8; 2],
    pub status: ResponseStatus,
    pub dlen: i32,
}

impl ResponseHeader {
    pub fn decode(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self> {
        let raw = RawResponseHeader::read_from_bytes(buf)
            .map_err(|e| anyhow!("bad response header: {e}"))?;
        let status = ResponseStatus::try_from(raw.status.get())?;
        let dlen = raw.dlen.get();
        if dlen < 0 {
            bail!("negative response length: {dlen}");
        }
        Ok(Self { streamid: raw.streamid, status, dlen })
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let raw = RawResponseHeader {
            streamid: self.streamid,
            status: (self.status as u16).into(),
            dlen: self.dlen.into(),
        };
        let mut out = [0u8; RESPONSE_HEADER_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }
}

/// One complete server message: decoded header plus its payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: ResponseHeader,
    pub data: Bytes,
}

impl Message {
    pub fn status(&self) -> ResponseStatus {
        self.header.status
    }

    pub fn is_error(&self) -> bool {
        self.header.status == ResponseStatus::Error
    }
}

/// Payload of a `redirect` response: 4-byte port, host, optional
/// `?token` and optional second `?opaque` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInfo {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub opaque: Option<String>,
}

impl RedirectInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            bail!("redirect body too short: {} bytes", data.len());
        }
        let port = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let rest = std::str::from_utf8(&data[4..])
            .map_err(|_| anyhow!("redirect host is not valid utf-8"))?
            .trim_end_matches('\0');
        let mut parts = rest.splitn(3, '?');
        let host = parts.next().unwrap_or("").to_string();
        if host.is_empty() {
            bail!("redirect body carries no host");
        }
        let token = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let opaque = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let port = if port <= 0 { crate::models::url::DEFAULT_PORT } else { port as u16 };
        Ok(Self { host, port, token, opaque })
    }
}

/// Payload of a `wait` response: 4-byte seconds plus a free-form message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitInfo {
    pub seconds: u32,
    pub message: String,
}

impl WaitInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            bail!("wait body too short: {} bytes", data.len());
        }
        let secs = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let message = String::from_utf8_lossy(&data[4..]).trim_end_matches('\0').to_string();
        Ok(Self { seconds: secs.max(0) as u32, message })
    }
}

/// Payload of a `waitresp` response: seconds until the asynchronous
/// answer is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRespInfo {
    pub seconds: u32,
}

impl WaitRespInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            bail!("waitresp body too short: {} bytes", data.len());
        }
        let secs = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Self { seconds: secs.max(0) as u32 })
    }
}

/// Payload of an `error` response: 4-byte server errno plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerErrorBody {
    pub errnum: i32,
    pub message: String,
}

impl ServerErrorBody {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            bail!("error body too short: {} bytes", data.len());
        }
        let errnum = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let message =
            String::from_utf8_lossy(&data[4..]).trim_end_matches('\0').to_string();
        Ok(Self { errnum, message })
    }
}

/// A server-pushed attention frame: 4-byte action code plus an
/// action-specific body.
#[derive(Debug, Clone)]
pub struct AttnInfo {
    pub action: AttnCode,
    pub body: Bytes,
}

impl AttnInfo {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            bail!("attention body too short: {} bytes", data.len());
        }
        let act = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let action = AttnCode::from_i32(act)
            .ok_or_else(|| anyhow!("unknown attention action code {act}"))?;
        Ok(Self { action, body: data.slice(4..) })
    }

    /// Seconds argument of `asyncwt` / `asyncdi`.
    pub fn seconds(&self) -> Result<u32> {
        if self.body.len() < 4 {
            bail!("attention body carries no seconds field");
        }
        let s = i32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]);
        Ok(s.max(0) as u32)
    }

    /// Text argument of `asyncms`.
    pub fn message_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim_end_matches('\0').to_string()
    }

    /// `asynresp` wraps the real answer for a previously parked waitresp:
    /// 4 reserved bytes, then a full response header, then its payload.
    pub fn unwrap_asynresp(&self) -> Result<Message> {
        if self.action != AttnCode::AsynResp {
            bail!("not an asynresp attention frame");
        }
        if self.body.len() < 4 + RESPONSE_HEADER_LEN {
            bail!("asynresp body too short: {} bytes", self.body.len());
        }
        let mut hdr = [0u8; RESPONSE_HEADER_LEN];
        hdr.copy_from_slice(&self.body[4..4 + RESPONSE_HEADER_LEN]);
        let header = ResponseHeader::decode(&hdr)?;
        let data = self.body.slice(4 + RESPONSE_HEADER_LEN..);
        if data.len() < header.dlen as usize {
            bail!(
                "asynresp payload truncated: have {}, header says {}",
                data.len(),
                header.dlen
            );
        }
        Ok(Message { header, data: data.slice(..header.dlen as usize) })
    }
}

/// Parsed `stat` answer. The wire form is a text record
/// `"<id> <size> <flags> <mtime>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatInfo {
    pub id: i64,
    pub size: i64,
    pub flags: u32,
    pub mtime: i64,
}

impl StatInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| anyhow!("stat answer is not valid utf-8"))?
            .trim_end_matches('\0');
        let mut it = text.split_ascii_whitespace();
        let mut next = |what: &str| {
            it.next().ok_or_else(|| anyhow!("stat answer misses field: {what}"))
        };
        let id = next("id")?.parse()?;
        let size = next("size")?.parse()?;
        let flags = next("flags")?.parse()?;
        let mtime = next("mtime")?.parse()?;
        Ok(Self { id, size, flags, mtime })
    }
}

/// Node classes appearing in a `locate` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateNodeKind {
    Manager,
    ManagerPending,
    Server,
    ServerPending,
}

/// One entry of a `locate` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateEntry {
    pub kind: LocateNodeKind,
    pub can_write: bool,
    pub host: String,
    pub port: u16,
}

impl LocateEntry {
    /// Entries come space-separated as `xy[host]:port` where `x` encodes
    /// the node class and `y` the access mode.
    pub fn parse_list(data: &[u8]) -> Result<Vec<LocateEntry>> {
        let text = std::str::from_utf8(data)
            .map_err(|_| anyhow!("locate answer is not valid utf-8"))?
            .trim_end_matches('\0');
        let mut out = Vec::new();
        for tok in text.split_ascii_whitespace() {
            let mut chars = tok.chars();
            let kind = match chars.next() {
                Some('M') => LocateNodeKind::Manager,
                Some('m') => LocateNodeKind::ManagerPending,
                Some('S') => LocateNodeKind::Server,
                Some('s') => LocateNodeKind::ServerPending,
                other => bail!("bad locate node class: {other:?}"),
            };
            let can_write = match chars.next() {
                Some('w') => true,
                Some('r') => false,
                other => bail!("bad locate access mode: {other:?}"),
            };
            let addr = chars.as_str();
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("locate entry misses port: {tok}"))?;
            let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            if host.is_empty() {
                bail!("locate entry misses host: {tok}");
            }
            out.push(LocateEntry { kind, can_write, host, port: port.parse()? });
        }
        Ok(out)
    }
}
