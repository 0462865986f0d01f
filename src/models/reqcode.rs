// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Numeric vocabulary of the wire protocol: request codes, response
//! statuses, asynchronous attention actions, server error numbers and the
//! open-options bit set.
//!
//! Every multi-byte value below travels big-endian on the wire; the
//! two-byte stream id is the single exception and is never byte-swapped.

use bitflags::bitflags;
use thiserror::Error;

/// Request codes understood by the servers this client talks to.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCode {
    Auth = 3000,
    Query = 3001,
    Chmod = 3002,
    Close = 3003,
    Dirlist = 3004,
    Protocol = 3006,
    Login = 3007,
    Mkdir = 3008,
    Mv = 3009,
    Open = 3010,
    Ping = 3011,
    Read = 3013,
    Rm = 3014,
    Rmdir = 3015,
    Sync = 3016,
    Stat = 3017,
    Write = 3019,
    Prepare = 3021,
    Statx = 3022,
    Bind = 3024,
    Readv = 3025,
    Locate = 3027,
    Truncate = 3028,
}

impl RequestCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            3000 => Self::Auth,
            3001 => Self::Query,
            3002 => Self::Chmod,
            3003 => Self::Close,
            3004 => Self::Dirlist,
            3006 => Self::Protocol,
            3007 => Self::Login,
            3008 => Self::Mkdir,
            3009 => Self::Mv,
            3010 => Self::Open,
            3011 => Self::Ping,
            3013 => Self::Read,
            3014 => Self::Rm,
            3015 => Self::Rmdir,
            3016 => Self::Sync,
            3017 => Self::Stat,
            3019 => Self::Write,
            3021 => Self::Prepare,
            3022 => Self::Statx,
            3024 => Self::Bind,
            3025 => Self::Readv,
            3027 => Self::Locate,
            3028 => Self::Truncate,
            _ => return None,
        })
    }

    /// Human-readable name, for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Query => "query",
            Self::Chmod => "chmod",
            Self::Close => "close",
            Self::Dirlist => "dirlist",
            Self::Protocol => "protocol",
            Self::Login => "login",
            Self::Mkdir => "mkdir",
            Self::Mv => "mv",
            Self::Open => "open",
            Self::Ping => "ping",
            Self::Read => "read",
            Self::Rm => "rm",
            Self::Rmdir => "rmdir",
            Self::Sync => "sync",
            Self::Stat => "stat",
            Self::Write => "write",
            Self::Prepare => "prepare",
            Self::Statx => "statx",
            Self::Bind => "bind",
            Self::Readv => "readv",
            Self::Locate => "locate",
            Self::Truncate => "truncate",
        }
    }
}

/// Returned when a response carries a status word outside the known set.
#[derive(Debug, Error)]
#[error("unknown response status: {0}")]
pub struct UnknownStatus(pub u16);

/// Status word of a server response header.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok = 0,
    OkSoFar = 4000,
    Attn = 4001,
    AuthMore = 4002,
    Error = 4003,
    Redirect = 4004,
    Wait = 4005,
    WaitResp = 4006,
}

impl TryFrom<u16> for ResponseStatus {
    type Error = UnknownStatus;

    fn try_from(v: u16) -> Result<Self, UnknownStatus> {
        Ok(match v {
            0 => Self::Ok,
            4000 => Self::OkSoFar,
            4001 => Self::Attn,
            4002 => Self::AuthMore,
            4003 => Self::Error,
            4004 => Self::Redirect,
            4005 => Self::Wait,
            4006 => Self::WaitResp,
            other => return Err(UnknownStatus(other)),
        })
    }
}

/// Action codes carried by server-pushed attention frames.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttnCode {
    /// Abandon the request.
    AsyncAb = 5000,
    /// Disconnect, reconnect after N seconds.
    AsyncDi = 5001,
    /// Informational message to log.
    AsyncMs = 5002,
    /// Redirect all future requests to the indicated destination.
    AsyncRd = 5003,
    /// The delayed final answer to a prior waitresp.
    AsynResp = 5004,
    /// Pause: do not write new requests.
    AsyncWt = 5005,
    /// Resume after a pause.
    AsyncGo = 5008,
}

impl AttnCode {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            5000 => Self::AsyncAb,
            5001 => Self::AsyncDi,
            5002 => Self::AsyncMs,
            5003 => Self::AsyncRd,
            5004 => Self::AsynResp,
            5005 => Self::AsyncWt,
            5008 => Self::AsyncGo,
            _ => return None,
        })
    }
}

/// Error numbers a server may put into an `error` response body.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrno {
    ArgInvalid = 3000,
    ArgMissing = 3001,
    ArgTooLong = 3002,
    FileLocked = 3003,
    FileNotOpen = 3004,
    FsError = 3005,
    InvalidRequest = 3006,
    IoError = 3007,
    NoMemory = 3008,
    NoSpace = 3009,
    NotAuthorized = 3010,
    NotFound = 3011,
    ServerError = 3012,
    Unsupported = 3013,
    NoServer = 3014,
    NotFile = 3015,
    IsDirectory = 3016,
    Cancelled = 3017,
    ChkLenErr = 3018,
    ChkSumErr = 3019,
    InProgress = 3020,
}

impl ServerErrno {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            3000 => Self::ArgInvalid,
            3001 => Self::ArgMissing,
            3002 => Self::ArgTooLong,
            3003 => Self::FileLocked,
            3004 => Self::FileNotOpen,
            3005 => Self::FsError,
            3006 => Self::InvalidRequest,
            3007 => Self::IoError,
            3008 => Self::NoMemory,
            3009 => Self::NoSpace,
            3010 => Self::NotAuthorized,
            3011 => Self::NotFound,
            3012 => Self::ServerError,
            3013 => Self::Unsupported,
            3014 => Self::NoServer,
            3015 => Self::NotFile,
            3016 => Self::IsDirectory,
            3017 => Self::Cancelled,
            3018 => Self::ChkLenErr,
            3019 => Self::ChkSumErr,
            3020 => Self::InProgress,
            _ => return None,
        })
    }
}

/// Subcodes of the `query` request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCode {
    Stats = 1,
    Prepare = 2,
    Cksum = 3,
    Xattr = 4,
    Space = 5,
    CksCancel = 6,
    Config = 7,
    Visa = 8,
    Opaque = 16,
    OpaqueFile = 32,
}

bitflags! {
    /// Option bits of the `open` request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u16 {
        const COMPRESS = 0x0001;
        const DELETE   = 0x0002;
        const FORCE    = 0x0004;
        const NEW      = 0x0008;
        const READ     = 0x0010;
        const UPDATE   = 0x0020;
        const ASYNC    = 0x0040;
        const REFRESH  = 0x0080;
        const MKPATH   = 0x0100;
        const APPEND   = 0x0200;
        const RETSTAT  = 0x0400;
        const REPLICA  = 0x0800;
        const POSC     = 0x1000;
        const NOWAIT   = 0x2000;
        const SEQIO    = 0x4000;
    }
}

impl OpenFlags {
    /// Flags as replayed after a redirect: never re-create, always allow
    /// the write path of the original open.
    pub fn for_reopen(self) -> Self {
        let mut f = self - (Self::NEW | Self::DELETE);
        if f.contains(Self::UPDATE) || f.contains(Self::APPEND) {
            f |= Self::UPDATE;
        }
        f
    }
}

/// Option bits of the `locate` request.
pub mod locate_opts {
    pub const NOWAIT: u16 = 0x0002;
    pub const REFRESH: u16 = 0x0001;
}

/// Option bits of the `stat` request.
pub mod stat_opts {
    pub const VFS: u8 = 0x01;
}
