// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client request frames.
//!
//! Every request starts with a fixed 24-byte header:
//!
//! ```text
//! +----------+-----------+------------------+-----------+
//! | streamid | requestid |      params      | data len  |
//! |  2 bytes |  2 bytes  |     16 bytes     |  4 bytes  |
//! +----------+-----------+------------------+-----------+
//! ```
//!
//! followed by `data_len` bytes of request data. The 16-byte parameter
//! block is typed per request code; the stream id is an opaque two-byte
//! key echoed verbatim by the server.

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use enum_dispatch::enum_dispatch;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, I32, I64,
    U16,
};

use crate::models::reqcode::{OpenFlags, QueryCode, RequestCode};

pub const REQUEST_HEADER_LEN: usize = 24;
pub const PARAMS_LEN: usize = 16;

/// Raw 24-byte request header in wire layout.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RequestHeader {
    pub streamid: [u8; 2],          // 0..2, opaque
    pub requestid: U16<BigEndian>,  // 2..4
    pub params: [u8; PARAMS_LEN],   // 4..20
    pub dlen: I32<BigEndian>,       // 20..24
}

impl RequestHeader {
    pub fn decode(buf: &[u8]) -> Result<&Self> {
        let (hdr, _) = Self::ref_from_prefix(buf)
            .map_err(|e| anyhow::anyhow!("short request header: {e}"))?;
        Ok(hdr)
    }

    pub fn request_code(&self) -> Option<RequestCode> {
        RequestCode::from_u16(self.requestid.get())
    }
}

/// Fills the 16-byte parameter area of a request header.
#[enum_dispatch]
pub trait ParamBlock {
    fn fill(&self, out: &mut [u8; PARAMS_LEN]);
}

macro_rules! wire_params {
    ($name:ident { $($field:tt)* }) => {
        #[repr(C)]
        #[derive(
            Debug, Default, Clone, PartialEq,
            ZFromBytes, IntoBytes, KnownLayout, Immutable,
        )]
        pub struct $name { $($field)* }

        impl ParamBlock for $name {
            fn fill(&self, out: &mut [u8; PARAMS_LEN]) {
                out.copy_from_slice(self.as_bytes());
            }
        }
    };
}

wire_params!(OpenParams {
    pub mode: U16<BigEndian>,
    pub options: U16<BigEndian>,
    pub reserved: [u8; 12],
});

wire_params!(ReadParams {
    pub fhandle: [u8; 4],
    pub offset: I64<BigEndian>,
    pub rlen: I32<BigEndian>,
});

wire_params!(WriteParams {
    pub fhandle: [u8; 4],
    pub offset: I64<BigEndian>,
    pub pathid: u8,
    pub reserved: [u8; 3],
});

wire_params!(CloseParams {
    pub fhandle: [u8; 4],
    pub fsize: I64<BigEndian>,
    pub reserved: [u8; 4],
});

wire_params!(StatParams {
    pub options: u8,
    pub reserved: [u8; 11],
    pub fhandle: [u8; 4],
});

wire_params!(LoginParams {
    pub pid: I32<BigEndian>,
    pub username: [u8; 8],
    pub reserved: u8,
    pub ability: u8,
    pub capver: u8,
    pub role: u8,
});

wire_params!(AuthParams {
    pub reserved: [u8; 12],
    pub credtype: [u8; 4],
});

wire_params!(QueryParams {
    pub infotype: U16<BigEndian>,
    pub reserved: [u8; 2],
    pub fhandle: [u8; 4],
    pub reserved2: [u8; 8],
});

wire_params!(DirlistParams {
    pub reserved: [u8; 15],
    pub options: u8,
});

wire_params!(MkdirParams {
    pub options: u8,
    pub reserved: [u8; 13],
    pub mode: U16<BigEndian>,
});

wire_params!(MvParams {
    pub reserved: [u8; 16],
});

wire_params!(PathParams {
    pub reserved: [u8; 16],
});

wire_params!(ChmodParams {
    pub reserved: [u8; 14],
    pub mode: U16<BigEndian>,
});

wire_params!(TruncateParams {
    pub fhandle: [u8; 4],
    pub fsize: I64<BigEndian>,
    pub reserved: [u8; 4],
});

wire_params!(SyncParams {
    pub fhandle: [u8; 4],
    pub reserved: [u8; 12],
});

wire_params!(LocateParams {
    pub options: U16<BigEndian>,
    pub reserved: [u8; 14],
});

wire_params!(PrepareParams {
    pub options: u8,
    pub prty: u8,
    pub port: U16<BigEndian>,
    pub reserved: [u8; 12],
});

wire_params!(ProtocolParams {
    pub clientpv: I32<BigEndian>,
    pub reserved: [u8; 12],
});

wire_params!(BindParams {
    pub sessid: [u8; 16],
});

/// One 16-byte chunk of a vectored-read request body.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadvChunk {
    pub fhandle: [u8; 4],
    pub rlen: I32<BigEndian>,
    pub offset: I64<BigEndian>,
}

pub const READV_CHUNK_LEN: usize = 16;

/// Typed parameter block for each request code.
#[enum_dispatch(ParamBlock)]
#[derive(Debug, Clone, PartialEq)]
pub enum RequestParams {
    Open(OpenParams),
    Read(ReadParams),
    Write(WriteParams),
    Close(CloseParams),
    Stat(StatParams),
    Login(LoginParams),
    Auth(AuthParams),
    Query(QueryParams),
    Dirlist(DirlistParams),
    Mkdir(MkdirParams),
    Mv(MvParams),
    Path(PathParams),
    Chmod(ChmodParams),
    Truncate(TruncateParams),
    Sync(SyncParams),
    Locate(LocateParams),
    Prepare(PrepareParams),
    Protocol(ProtocolParams),
    Bind(BindParams),
}

/// A complete request: code, typed parameters, optional data.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub code: RequestCode,
    pub params: RequestParams,
    pub data: Bytes,
}

impl ClientRequest {
    pub fn new(code: RequestCode, params: RequestParams, data: Bytes) -> Self {
        Self { code, params, data }
    }

    pub fn open(path: &str, flags: OpenFlags, mode: u16) -> Self {
        Self::new(
            RequestCode::Open,
            RequestParams::Open(OpenParams {
                mode: mode.into(),
                options: flags.bits().into(),
                ..Default::default()
            }),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn read(fhandle: [u8; 4], offset: i64, rlen: i32) -> Self {
        Self::new(
            RequestCode::Read,
            RequestParams::Read(ReadParams {
                fhandle,
                offset: offset.into(),
                rlen: rlen.into(),
            }),
            Bytes::new(),
        )
    }

    pub fn readv(chunks: &[ReadvChunk]) -> Self {
        let mut body = BytesMut::with_capacity(chunks.len() * READV_CHUNK_LEN);
        for c in chunks {
            body.extend_from_slice(c.as_bytes());
        }
        Self::new(
            RequestCode::Readv,
            RequestParams::Path(PathParams::default()),
            body.freeze(),
        )
    }

    pub fn write(fhandle: [u8; 4], offset: i64, data: Bytes) -> Self {
        Self::new(
            RequestCode::Write,
            RequestParams::Write(WriteParams {
                fhandle,
                offset: offset.into(),
                ..Default::default()
            }),
            data,
        )
    }

    pub fn sync(fhandle: [u8; 4]) -> Self {
        Self::new(
            RequestCode::Sync,
            RequestParams::Sync(SyncParams { fhandle, ..Default::default() }),
            Bytes::new(),
        )
    }

    pub fn close(fhandle: [u8; 4]) -> Self {
        Self::new(
            RequestCode::Close,
            RequestParams::Close(CloseParams { fhandle, ..Default::default() }),
            Bytes::new(),
        )
    }

    pub fn truncate(fhandle: [u8; 4], fsize: i64) -> Self {
        Self::new(
            RequestCode::Truncate,
            RequestParams::Truncate(TruncateParams {
                fhandle,
                fsize: fsize.into(),
                ..Default::default()
            }),
            Bytes::new(),
        )
    }

    pub fn stat(path: &str) -> Self {
        Self::new(
            RequestCode::Stat,
            RequestParams::Stat(StatParams::default()),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn statx(paths: &str) -> Self {
        Self::new(
            RequestCode::Statx,
            RequestParams::Path(PathParams::default()),
            Bytes::copy_from_slice(paths.as_bytes()),
        )
    }

    pub fn dirlist(path: &str) -> Self {
        Self::new(
            RequestCode::Dirlist,
            RequestParams::Dirlist(DirlistParams::default()),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn mkdir(path: &str, mode: u16) -> Self {
        Self::new(
            RequestCode::Mkdir,
            RequestParams::Mkdir(MkdirParams {
                options: 1, // create missing path components
                mode: mode.into(),
                ..Default::default()
            }),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn rmdir(path: &str) -> Self {
        Self::new(
            RequestCode::Rmdir,
            RequestParams::Path(PathParams::default()),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn rm(path: &str) -> Self {
        Self::new(
            RequestCode::Rm,
            RequestParams::Path(PathParams::default()),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn mv(old: &str, new: &str) -> Self {
        let mut body = BytesMut::with_capacity(old.len() + new.len() + 1);
        body.extend_from_slice(old.as_bytes());
        body.extend_from_slice(b" ");
        body.extend_from_slice(new.as_bytes());
        Self::new(RequestCode::Mv, RequestParams::Mv(MvParams::default()), body.freeze())
    }

    pub fn chmod(path: &str, mode: u16) -> Self {
        Self::new(
            RequestCode::Chmod,
            RequestParams::Chmod(ChmodParams { mode: mode.into(), ..Default::default() }),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn query(code: QueryCode, args: Bytes) -> Self {
        Self::new(
            RequestCode::Query,
            RequestParams::Query(QueryParams {
                infotype: (code as u16).into(),
                ..Default::default()
            }),
            args,
        )
    }

    pub fn locate(path: &str, options: u16) -> Self {
        Self::new(
            RequestCode::Locate,
            RequestParams::Locate(LocateParams {
                options: options.into(),
                ..Default::default()
            }),
            Bytes::copy_from_slice(path.as_bytes()),
        )
    }

    pub fn prepare(paths: &str, options: u8, prty: u8) -> Self {
        Self::new(
            RequestCode::Prepare,
            RequestParams::Prepare(PrepareParams {
                options,
                prty,
                ..Default::default()
            }),
            Bytes::copy_from_slice(paths.as_bytes()),
        )
    }

    pub fn protocol(clientpv: i32) -> Self {
        Self::new(
            RequestCode::Protocol,
            RequestParams::Protocol(ProtocolParams {
                clientpv: clientpv.into(),
                ..Default::default()
            }),
            Bytes::new(),
        )
    }

    pub fn login(pid: i32, username: &str, capver: u8, token: Bytes) -> Self {
        let mut uname = [0u8; 8];
        let src = username.as_bytes();
        let n = src.len().min(8);
        uname[..n].copy_from_slice(&src[..n]);
        Self::new(
            RequestCode::Login,
            RequestParams::Login(LoginParams {
                pid: pid.into(),
                username: uname,
                capver,
                ..Default::default()
            }),
            token,
        )
    }

    pub fn auth(credtype: [u8; 4], cred: Bytes) -> Self {
        Self::new(
            RequestCode::Auth,
            RequestParams::Auth(AuthParams { credtype, ..Default::default() }),
            cred,
        )
    }

    pub fn bind(sessid: [u8; 16]) -> Self {
        Self::new(RequestCode::Bind, RequestParams::Bind(BindParams { sessid }), Bytes::new())
    }

    /// Rewrites the 4-byte server file handle for requests that carry one.
    /// Used when a fault-recovered redirect minted a fresh handle and the
    /// outstanding request must be replayed against the new server.
    pub fn set_fhandle(&mut self, fhandle: [u8; 4]) {
        match &mut self.params {
            RequestParams::Read(p) => p.fhandle = fhandle,
            RequestParams::Write(p) => p.fhandle = fhandle,
            RequestParams::Close(p) => p.fhandle = fhandle,
            RequestParams::Sync(p) => p.fhandle = fhandle,
            RequestParams::Truncate(p) => p.fhandle = fhandle,
            RequestParams::Stat(p) => p.fhandle = fhandle,
            RequestParams::Query(p) => p.fhandle = fhandle,
            _ => {}
        }
    }

    /// Serializes the header for the given stream id. The request data, if
    /// any, is written separately right after the header.
    pub fn encode_header(&self, streamid: [u8; 2]) -> Result<[u8; REQUEST_HEADER_LEN]> {
        if self.data.len() > i32::MAX as usize {
            bail!("request data too large: {} bytes", self.data.len());
        }
        let mut hdr = RequestHeader {
            streamid,
            requestid: (self.code as u16).into(),
            dlen: (self.data.len() as i32).into(),
            ..Default::default()
        };
        self.params.fill(&mut hdr.params);
        let mut out = [0u8; REQUEST_HEADER_LEN];
        out.copy_from_slice(hdr.as_bytes());
        Ok(out)
    }
}
