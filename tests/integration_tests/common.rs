// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process server speaking just enough of the wire protocol to drive
//! the client end to end: handshake, login, then scripted answers per
//! request.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use xrootd_client_rs::{
    cfg::config::Config,
    client::{auth::NoAuth, manager::ConnectionManager},
    models::{
        handshake::{self, HandshakeReply, ServerKind},
        reqcode::{RequestCode, ResponseStatus},
        request::{REQUEST_HEADER_LEN, RequestHeader},
        response::ResponseHeader,
    },
};

/// One request as the mock saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub code: Option<RequestCode>,
    pub raw_code: u16,
    pub params: [u8; 16],
    pub data: Vec<u8>,
}

impl SeenRequest {
    pub fn read_offset(&self) -> i64 {
        i64::from_be_bytes(self.params[4..12].try_into().unwrap())
    }

    pub fn read_len(&self) -> i32 {
        i32::from_be_bytes(self.params[12..16].try_into().unwrap())
    }
}

/// One scripted answer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub status: ResponseStatus,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: ResponseStatus::Ok, body }
    }

    pub fn ok_so_far(body: Vec<u8>) -> Self {
        Self { status: ResponseStatus::OkSoFar, body }
    }

    pub fn error(errnum: i32, msg: &str) -> Self {
        let mut body = errnum.to_be_bytes().to_vec();
        body.extend_from_slice(msg.as_bytes());
        Self { status: ResponseStatus::Error, body }
    }

    pub fn redirect(host: &str, port: u16) -> Self {
        let mut body = (port as i32).to_be_bytes().to_vec();
        body.extend_from_slice(host.as_bytes());
        Self { status: ResponseStatus::Redirect, body }
    }

    pub fn wait(seconds: i32, msg: &str) -> Self {
        let mut body = seconds.to_be_bytes().to_vec();
        body.extend_from_slice(msg.as_bytes());
        Self { status: ResponseStatus::Wait, body }
    }
}

pub type Handler = Arc<dyn Fn(&SeenRequest) -> Vec<Frame> + Send + Sync>;

pub struct MockServer {
    pub addr: SocketAddr,
    /// Every non-login request, in arrival order.
    pub log: Arc<Mutex<Vec<SeenRequest>>>,
}

impl MockServer {
    pub fn requests_of(&self, code: RequestCode) -> Vec<SeenRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.code == Some(code))
            .cloned()
            .collect()
    }

    /// Polls until `pred` holds over the request log, up to ~2 seconds.
    pub async fn wait_for<F>(&self, pred: F) -> bool
    where
        F: Fn(&[SeenRequest]) -> bool,
    {
        for _ in 0..40 {
            if pred(&self.log.lock().unwrap()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

pub async fn start_server(kind: ServerKind, handler: Handler) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let accept_log = log.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let handler = handler.clone();
            let log = accept_log.clone();
            tokio::spawn(async move {
                let _ = serve_conn(stream, kind, handler, log).await;
            });
        }
    });

    MockServer { addr, log }
}

async fn serve_conn(
    mut s: TcpStream,
    kind: ServerKind,
    handler: Handler,
    log: Arc<Mutex<Vec<SeenRequest>>>,
) -> std::io::Result<()> {
    let mut greeting = [0u8; handshake::HANDSHAKE_FRAME_LEN];
    s.read_exact(&mut greeting).await?;
    let reply = HandshakeReply { protocol_version: 0x310, kind };
    s.write_all(&handshake::encode_reply(&reply)).await?;

    loop {
        let mut hdr = [0u8; REQUEST_HEADER_LEN];
        if s.read_exact(&mut hdr).await.is_err() {
            return Ok(());
        }
        let (sid, raw_code, params, dlen) = {
            let parsed = RequestHeader::decode(&hdr).expect("client sent a bad header");
            let mut params = [0u8; 16];
            params.copy_from_slice(&parsed.params);
            (parsed.streamid, parsed.requestid.get(), params, parsed.dlen.get())
        };
        let mut data = vec![0u8; dlen as usize];
        if dlen > 0 {
            s.read_exact(&mut data).await?;
        }

        let code = RequestCode::from_u16(raw_code);
        if code == Some(RequestCode::Login) {
            // Session id, no security protocol list: no auth round.
            let sessid = [7u8; 16];
            let rh =
                ResponseHeader { streamid: sid, status: ResponseStatus::Ok, dlen: 16 };
            s.write_all(&rh.encode()).await?;
            s.write_all(&sessid).await?;
            continue;
        }

        let seen = SeenRequest { code, raw_code, params, data };
        log.lock().unwrap().push(seen.clone());

        for f in handler(&seen) {
            let rh = ResponseHeader {
                streamid: sid,
                status: f.status,
                dlen: f.body.len() as i32,
            };
            s.write_all(&rh.encode()).await?;
            if !f.body.is_empty() {
                s.write_all(&f.body).await?;
            }
        }
    }
}

/// Config tuned for fast tests.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.net.connect_timeout = Duration::from_secs(5);
    cfg.net.request_timeout = Duration::from_secs(5);
    cfg.net.reconnect_timeout = Duration::from_millis(100);
    cfg.net.first_connect_max_attempts = 2;
    cfg
}

pub fn manager_with(cfg: Config) -> Arc<ConnectionManager> {
    ConnectionManager::new(Arc::new(cfg), Arc::new(NoAuth))
}

pub fn url_of(addr: SocketAddr, path: &str) -> String {
    format!("root://{}:{}/{}", addr.ip(), addr.port(), path)
}
