// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The one-shot greeting exchanged on a fresh socket before anything else.

use anyhow::{Result, bail};

/// Raw type discriminator a legacy rootd peer answers with. Such peers are
/// rejected unconditionally.
pub const LEGACY_ROOTD_TYPE: i32 = 8;

/// Protocol hint advertised in the initial frame.
pub const PROTOCOL_HINT: i32 = 2012;

pub const HANDSHAKE_FRAME_LEN: usize = 20;
pub const HANDSHAKE_BODY_LEN: usize = 12;

/// What kind of peer answered the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Unknown,
    LegacyRootd,
    BaseRedirector,
    DataServer,
}

impl ServerKind {
    pub fn is_redirector(&self) -> bool {
        matches!(self, Self::BaseRedirector)
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    pub protocol_version: i32,
    pub kind: ServerKind,
}

/// The 20-byte client greeting: four padding words, the literal 4 and the
/// protocol hint, all big-endian.
pub fn initial_frame() -> [u8; HANDSHAKE_FRAME_LEN] {
    let mut out = [0u8; HANDSHAKE_FRAME_LEN];
    out[12..16].copy_from_slice(&4i32.to_be_bytes());
    out[16..20].copy_from_slice(&PROTOCOL_HINT.to_be_bytes());
    out
}

/// First 4 bytes of the server's answer.
pub fn decode_type(buf: &[u8; 4]) -> i32 {
    i32::from_be_bytes(*buf)
}

/// The 12-byte extended body following a type-0 discriminator:
/// `{body_len == 8, protocol_version, server_kind}`.
pub fn decode_body(buf: &[u8; HANDSHAKE_BODY_LEN]) -> Result<HandshakeReply> {
    let blen = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if blen != 8 {
        bail!("handshake body length {blen}, expected 8");
    }
    let protocol_version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let kind = match i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) {
        0 => ServerKind::BaseRedirector,
        1 => ServerKind::DataServer,
        other => bail!("unknown server kind {other} in handshake"),
    };
    Ok(HandshakeReply { protocol_version, kind })
}

/// Server-side encoding of the full 16-byte answer, used by tests.
pub fn encode_reply(reply: &HandshakeReply) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[4..8].copy_from_slice(&8i32.to_be_bytes());
    out[8..12].copy_from_slice(&reply.protocol_version.to_be_bytes());
    let kind = match reply.kind {
        ServerKind::BaseRedirector => 0i32,
        ServerKind::DataServer => 1,
        ServerKind::LegacyRootd | ServerKind::Unknown => -1,
    };
    out[12..16].copy_from_slice(&kind.to_be_bytes());
    out
}
