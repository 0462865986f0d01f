// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One physical connection: a TCP session (optionally with extra parallel
//! sockets) to one `(user, host, port)`, its reader task and the stream-id
//! demux feeding per-stream inboxes.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    client::{
        auth::AuthProvider,
        common::io_with_timeout,
        inbox::{Inbox, InboxSender, inbox_pair},
    },
    errors::{ClientError, ErrorKind, Result, map_server_errno},
    models::{
        handshake::{self, HandshakeReply, ServerKind},
        reqcode::ResponseStatus,
        request::ClientRequest,
        response::{
            AttnInfo, Message, RESPONSE_HEADER_LEN, RedirectInfo, ResponseHeader,
            ServerErrorBody,
        },
    },
};

/// Capability byte sent at login: async-capable, protocol version 2.
const CAPVER: u8 = 0x80 | 0x02;

/// Stream id used for login/auth/bind before any logical connection
/// exists on the link.
const BOOTSTRAP_SID: [u8; 2] = [0, 0];

/// Upper bound on a single response payload; anything larger means a
/// corrupted stream.
const MAX_FRAME_PAYLOAD: i32 = 0x4000_0000;

/// Immutable identity of a physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    NotLogged,
    InProgress,
    Logged,
}

#[derive(Debug)]
pub struct PhysConnection {
    pub key: ConnKey,
    cfg: Arc<Config>,

    /// Write halves; index 0 is the main socket, the rest are bound
    /// parallel substreams. Each has its own write-serialization lock.
    writers: RwLock<Vec<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>>,
    next_substream: AtomicUsize,

    /// Stream-id demux: the reader tasks deliver here.
    inboxes: DashMap<[u8; 2], InboxSender>,
    /// Parked waiters for delayed (waitresp) answers.
    waitresp: DashMap<[u8; 2], oneshot::Sender<Message>>,

    server: HandshakeReply,
    session_id: OnceCell<[u8; 16]>,
    login_state: Mutex<LoginState>,

    logical_count: AtomicUsize,
    last_use: Mutex<Instant>,
    ttl: Duration,

    /// Pause gate driven by asyncwt/asyncgo attention frames.
    paused_until: Mutex<Option<Instant>>,
    pause_changed: Notify,

    /// Destination forced by an asyncrd attention frame.
    next_dest: Mutex<Option<(String, u16)>>,
    /// Reconnect-delay window requested by asyncdi.
    reconnect_not_before: Mutex<Option<Instant>>,

    cancel: CancellationToken,
    valid: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl PhysConnection {
    /// Establishes the TCP session, runs the handshake, login and the
    /// authentication loop, then binds any configured extra streams.
    pub async fn connect(
        key: ConnKey,
        cfg: Arc<Config>,
        auth: Arc<dyn AuthProvider>,
        login_token: Option<String>,
    ) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let addr = (key.host.clone(), key.port);

        let stream = io_with_timeout(
            "tcp connect",
            async { TcpStream::connect(addr).await },
            cfg.net.connect_timeout,
            &cancel,
        )
        .await
        .map_err(|e| match e.kind {
            ErrorKind::Timeout | ErrorKind::IoError => ClientError::new(
                ErrorKind::HostUnreachable,
                format!("cannot reach {key}: {}", e.message),
            ),
            _ => e,
        })?;
        stream.set_nodelay(true)?;

        let mut stream = stream;
        let server = Self::handshake(&mut stream, &cfg, &cancel).await?;
        debug!(
            "handshake with {key}: proto={} kind={:?}",
            server.protocol_version, server.kind
        );

        let ttl = if server.kind.is_redirector() {
            cfg.net.lb_conn_ttl
        } else {
            cfg.net.data_conn_ttl
        };

        let (r, w) = stream.into_split();
        let conn = Arc::new(Self {
            key,
            cfg,
            writers: RwLock::new(vec![Arc::new(tokio::sync::Mutex::new(w))]),
            next_substream: AtomicUsize::new(0),
            inboxes: DashMap::new(),
            waitresp: DashMap::new(),
            server,
            session_id: OnceCell::new(),
            login_state: Mutex::new(LoginState::NotLogged),
            logical_count: AtomicUsize::new(0),
            last_use: Mutex::new(Instant::now()),
            ttl,
            paused_until: Mutex::new(None),
            pause_changed: Notify::new(),
            next_dest: Mutex::new(None),
            reconnect_not_before: Mutex::new(None),
            cancel,
            valid: AtomicBool::new(true),
        });

        conn.clone().spawn_reader(r);
        conn.do_login(auth, login_token).await?;
        Ok(conn)
    }

    async fn handshake(
        stream: &mut TcpStream,
        cfg: &Config,
        cancel: &CancellationToken,
    ) -> Result<HandshakeReply> {
        let frame = handshake::initial_frame();
        io_with_timeout(
            "handshake write",
            stream.write_all(&frame),
            cfg.net.connect_timeout,
            cancel,
        )
        .await?;

        let mut tbuf = [0u8; 4];
        io_with_timeout(
            "handshake read type",
            stream.read_exact(&mut tbuf),
            cfg.net.connect_timeout,
            cancel,
        )
        .await?;
        match handshake::decode_type(&tbuf) {
            0 => {}
            handshake::LEGACY_ROOTD_TYPE => {
                return Err(ClientError::unsupported_protocol(
                    "peer speaks the legacy rootd protocol",
                ));
            }
            other => {
                return Err(ClientError::unsupported_protocol(format!(
                    "unexpected handshake discriminator {other}"
                )));
            }
        }

        let mut body = [0u8; handshake::HANDSHAKE_BODY_LEN];
        io_with_timeout(
            "handshake read body",
            stream.read_exact(&mut body),
            cfg.net.connect_timeout,
            cancel,
        )
        .await?;
        let reply = handshake::decode_body(&body)
            .map_err(|e| ClientError::unsupported_protocol(e.to_string()))?;
        if reply.kind == ServerKind::Unknown {
            return Err(ClientError::unsupported_protocol("peer kind unknown"));
        }
        Ok(reply)
    }

    /// Runs login and, when the server demands it, the authentication
    /// loop against the oracle. Uses the bootstrap stream id; no logical
    /// connection exists on this link yet.
    async fn do_login(
        self: &Arc<Self>,
        auth: Arc<dyn AuthProvider>,
        login_token: Option<String>,
    ) -> Result<()> {
        *lock(&self.login_state) = LoginState::InProgress;
        let inbox = self.attach_stream(BOOTSTRAP_SID)?;
        let res = self.do_login_inner(&inbox, auth, login_token).await;
        self.detach_stream(BOOTSTRAP_SID);
        *lock(&self.login_state) =
            if res.is_ok() { LoginState::Logged } else { LoginState::NotLogged };
        res
    }

    async fn do_login_inner(
        self: &Arc<Self>,
        inbox: &Inbox,
        auth: Arc<dyn AuthProvider>,
        login_token: Option<String>,
    ) -> Result<()> {
        let token = login_token.map(Bytes::from).unwrap_or_default();
        let req = ClientRequest::login(
            std::process::id() as i32,
            &self.key.user,
            CAPVER,
            token,
        );
        self.send_request(BOOTSTRAP_SID, &req).await?;

        let msg = inbox.take(self.cfg.net.request_timeout).await?;
        let payload = match msg.status() {
            ResponseStatus::Ok => msg.data,
            ResponseStatus::Error => {
                let body = ServerErrorBody::parse(&msg.data)
                    .map_err(|e| ClientError::io(e.to_string()))?;
                return Err(ClientError::new(
                    map_server_errno(body.errnum),
                    format!("login refused: {}", body.message),
                ));
            }
            other => {
                return Err(ClientError::io(format!(
                    "unexpected status {other:?} at login"
                )));
            }
        };

        if payload.len() >= 16 {
            let mut sid = [0u8; 16];
            sid.copy_from_slice(&payload[..16]);
            let _ = self.session_id.set(sid);
        }

        // A protocol list after the session id means the server wants
        // authentication.
        if payload.len() > 16 {
            self.auth_loop(inbox, auth, payload.slice(16..)).await?;
        }
        Ok(())
    }

    async fn auth_loop(
        self: &Arc<Self>,
        inbox: &Inbox,
        auth: Arc<dyn AuthProvider>,
        protocol_list: Bytes,
    ) -> Result<()> {
        let mut cred = auth.initial(&protocol_list).map_err(|e| {
            ClientError::permission_denied(format!("auth failed: {}", e.message))
        })?;
        loop {
            let req = ClientRequest::auth(cred.credtype, cred.blob.clone());
            self.send_request(BOOTSTRAP_SID, &req).await?;
            let msg = inbox.take(self.cfg.net.request_timeout).await?;
            match msg.status() {
                ResponseStatus::Ok => return Ok(()),
                ResponseStatus::AuthMore => {
                    cred = auth.next(&msg.data).map_err(|e| {
                        ClientError::permission_denied(format!(
                            "auth failed: {}",
                            e.message
                        ))
                    })?;
                }
                ResponseStatus::Error => {
                    let body = ServerErrorBody::parse(&msg.data)
                        .map_err(|e| ClientError::io(e.to_string()))?;
                    return Err(ClientError::permission_denied(format!(
                        "auth failed: {}",
                        body.message
                    )));
                }
                other => {
                    return Err(ClientError::permission_denied(format!(
                        "auth failed: unexpected status {other:?}"
                    )));
                }
            }
        }
    }

    /// Opens `count` extra sockets to the same endpoint and binds them to
    /// this session. Best-effort: a substream that fails to bind is
    /// logged and skipped.
    pub async fn bind_extra_streams(self: &Arc<Self>, count: u8) -> Result<()> {
        let Some(sessid) = self.session_id.get().copied() else {
            return Err(ClientError::io("no session id, cannot bind substreams"));
        };
        for n in 1..=count {
            match self.bind_one_stream(sessid).await {
                Ok(pathid) => {
                    debug!("bound substream {n} (pathid {pathid}) to {}", self.key);
                }
                Err(e) => {
                    warn!("bind of substream {n} to {} failed: {e}", self.key);
                }
            }
        }
        Ok(())
    }

    async fn bind_one_stream(self: &Arc<Self>, sessid: [u8; 16]) -> Result<u8> {
        let addr = (self.key.host.clone(), self.key.port);
        let mut stream = io_with_timeout(
            "substream connect",
            async { TcpStream::connect(addr).await },
            self.cfg.net.connect_timeout,
            &self.cancel,
        )
        .await?;
        stream.set_nodelay(true)?;
        Self::handshake(&mut stream, &self.cfg, &self.cancel).await?;

        // The bind round trip happens on the fresh socket before it joins
        // the demux, so read its answer directly.
        let req = ClientRequest::bind(sessid);
        let hdr = req
            .encode_header(BOOTSTRAP_SID)
            .map_err(|e| ClientError::invalid(e.to_string()))?;
        io_with_timeout(
            "bind write",
            stream.write_all(&hdr),
            self.cfg.net.request_timeout,
            &self.cancel,
        )
        .await?;

        let mut rbuf = [0u8; RESPONSE_HEADER_LEN];
        io_with_timeout(
            "bind read header",
            stream.read_exact(&mut rbuf),
            self.cfg.net.request_timeout,
            &self.cancel,
        )
        .await?;
        let rhdr = ResponseHeader::decode(&rbuf)
            .map_err(|e| ClientError::io(e.to_string()))?;
        let mut body = vec![0u8; rhdr.dlen as usize];
        if rhdr.dlen > 0 {
            io_with_timeout(
                "bind read body",
                stream.read_exact(&mut body),
                self.cfg.net.request_timeout,
                &self.cancel,
            )
            .await?;
        }
        if rhdr.status != ResponseStatus::Ok {
            return Err(ClientError::io(format!(
                "bind refused with status {:?}",
                rhdr.status
            )));
        }
        let pathid = body.first().copied().unwrap_or_default();

        let (r, w) = stream.into_split();
        self.writers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(tokio::sync::Mutex::new(w)));
        self.clone().spawn_reader(r);
        Ok(pathid)
    }

    /// Sends one encoded request on this connection, serialized per
    /// substream, honoring the pause gate.
    pub async fn send_request(&self, streamid: [u8; 2], req: &ClientRequest) -> Result<()> {
        let hdr = req
            .encode_header(streamid)
            .map_err(|e| ClientError::invalid(e.to_string()))?;
        self.write_frame(&hdr, &req.data).await
    }

    pub async fn write_frame(&self, header: &[u8], data: &[u8]) -> Result<()> {
        if !self.is_valid() {
            return Err(ClientError::canceled("connection marked invalid"));
        }
        self.wait_pause_gate().await;
        self.touch();

        let writer = {
            let g = self.writers.read().unwrap_or_else(|e| e.into_inner());
            let idx = if g.len() > 1 {
                self.next_substream.fetch_add(1, Ordering::Relaxed) % g.len()
            } else {
                0
            };
            g[idx].clone()
        };
        let mut w = writer.lock().await;
        let res = async {
            io_with_timeout(
                "write header",
                w.write_all(header),
                self.cfg.net.request_timeout,
                &self.cancel,
            )
            .await?;
            if !data.is_empty() {
                io_with_timeout(
                    "write data",
                    w.write_all(data),
                    self.cfg.net.request_timeout,
                    &self.cancel,
                )
                .await?;
            }
            Ok(())
        }
        .await;
        if res.is_err() {
            self.mark_invalid();
        }
        res
    }

    /// Blocks while an asyncwt pause is in force.
    async fn wait_pause_gate(&self) {
        loop {
            let until = *lock(&self.paused_until);
            match until {
                None => return,
                Some(t) if t <= Instant::now() => {
                    *lock(&self.paused_until) = None;
                    return;
                }
                Some(t) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(t) => {}
                        _ = self.pause_changed.notified() => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    fn spawn_reader(self: Arc<Self>, r: OwnedReadHalf) {
        tokio::spawn(async move {
            if let Err(e) = self.clone().read_loop(r).await {
                if self.is_valid() {
                    warn!("reader of {} exited: {e}", self.key);
                }
                self.mark_invalid();
            }
        });
    }

    /// Demultiplexes incoming frames by stream id. Attention frames go to
    /// the unsolicited path, everything else to the matching inbox.
    async fn read_loop(self: Arc<Self>, mut r: OwnedReadHalf) -> Result<()> {
        let mut hdr_buf = [0u8; RESPONSE_HEADER_LEN];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ClientError::canceled("reader cancelled"));
                }
                res = r.read_exact(&mut hdr_buf) => {
                    res?;
                }
            }

            let header = ResponseHeader::decode(&hdr_buf)
                .map_err(|e| ClientError::io(e.to_string()))?;
            if header.dlen > MAX_FRAME_PAYLOAD {
                return Err(ClientError::io(format!(
                    "oversized frame: {} bytes",
                    header.dlen
                )));
            }

            let mut payload = BytesMut::zeroed(header.dlen as usize);
            if header.dlen > 0 {
                io_with_timeout(
                    "read payload",
                    r.read_exact(&mut payload),
                    self.cfg.net.request_timeout,
                    &self.cancel,
                )
                .await?;
            }
            let msg = Message { header, data: payload.freeze() };

            if header.status == ResponseStatus::Attn {
                self.handle_attention(msg);
                continue;
            }

            match self.inboxes.get(&header.streamid) {
                Some(sender) => sender.put(msg),
                None => {
                    debug!(
                        "dropping frame for unknown stream {:?} on {}",
                        header.streamid, self.key
                    );
                }
            }
        }
    }

    /// Server-pushed attention frames. These fan out to connection-wide
    /// state rather than to a single stream.
    fn handle_attention(&self, msg: Message) {
        let attn = match AttnInfo::parse(msg.data) {
            Ok(a) => a,
            Err(e) => {
                warn!("bad attention frame from {}: {e}", self.key);
                return;
            }
        };
        use crate::models::reqcode::AttnCode::*;
        match attn.action {
            AsyncMs => {
                info!("server message from {}: {}", self.key, attn.message_text());
            }
            AsyncRd => match RedirectInfo::parse(&attn.body) {
                Ok(r) => {
                    debug!("{} asks to redirect to {}:{}", self.key, r.host, r.port);
                    *lock(&self.next_dest) = Some((r.host, r.port));
                }
                Err(e) => warn!("bad asyncrd body from {}: {e}", self.key),
            },
            AsyncDi => {
                let secs = attn.seconds().unwrap_or(0);
                *lock(&self.reconnect_not_before) =
                    Some(Instant::now() + Duration::from_secs(secs as u64));
                debug!("{} requested a delayed reconnect of {secs}s", self.key);
            }
            AsyncWt => {
                let secs = attn.seconds().unwrap_or(0);
                *lock(&self.paused_until) =
                    Some(Instant::now() + Duration::from_secs(secs as u64));
                self.pause_changed.notify_waiters();
                debug!("{} paused for {secs}s", self.key);
            }
            AsyncGo => {
                *lock(&self.paused_until) = None;
                self.pause_changed.notify_waiters();
                debug!("{} resumed", self.key);
            }
            AsyncAb => {
                warn!("{} asked to abort the outstanding request", self.key);
            }
            AsynResp => match attn.unwrap_asynresp() {
                Ok(inner) => {
                    let sid = inner.header.streamid;
                    match self.waitresp.remove(&sid) {
                        Some((_, tx)) => {
                            let _ = tx.send(inner);
                        }
                        None => {
                            // Nobody parked; deliver like a normal frame.
                            if let Some(sender) = self.inboxes.get(&sid) {
                                sender.put(inner);
                            }
                        }
                    }
                }
                Err(e) => warn!("bad asynresp from {}: {e}", self.key),
            },
        }
    }

    /// Registers a stream id and returns its inbox.
    pub fn attach_stream(&self, streamid: [u8; 2]) -> Result<Inbox> {
        if !self.is_valid() {
            return Err(ClientError::canceled("connection marked invalid"));
        }
        let (tx, rx) = inbox_pair(self.cancel.clone());
        match self.inboxes.entry(streamid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ClientError::invalid(format!(
                    "stream id {streamid:?} already in use on {}",
                    self.key
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
                Ok(rx)
            }
        }
    }

    pub fn detach_stream(&self, streamid: [u8; 2]) {
        self.inboxes.remove(&streamid);
        self.waitresp.remove(&streamid);
        self.touch();
    }

    /// Parks a waiter for the delayed answer of a waitresp.
    pub fn register_waitresp(&self, streamid: [u8; 2]) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waitresp.insert(streamid, tx);
        rx
    }

    pub fn unregister_waitresp(&self, streamid: [u8; 2]) {
        self.waitresp.remove(&streamid);
    }

    /// Takes the destination an asyncrd frame demanded, if any.
    pub fn take_forced_destination(&self) -> Option<(String, u16)> {
        lock(&self.next_dest).take()
    }

    /// The instant before which an asyncdi frame forbids reconnecting.
    pub fn reconnect_not_before(&self) -> Option<Instant> {
        *lock(&self.reconnect_not_before)
    }

    pub fn server_kind(&self) -> ServerKind {
        self.server.kind
    }

    pub fn protocol_version(&self) -> i32 {
        self.server.protocol_version
    }

    pub fn session_id(&self) -> Option<[u8; 16]> {
        self.session_id.get().copied()
    }

    pub fn login_state(&self) -> LoginState {
        *lock(&self.login_state)
    }

    pub fn substream_count(&self) -> usize {
        self.writers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the connection dead: the reader exits, pending takes wake
    /// with a socket error, parked waitresp waiters fail.
    pub fn mark_invalid(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            self.cancel.cancel();
            self.inboxes.clear();
            self.waitresp.clear();
        }
    }

    pub fn add_logical(&self) {
        self.logical_count.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn remove_logical(&self) {
        self.logical_count.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn logical_count(&self) -> usize {
        self.logical_count.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *lock(&self.last_use) = Instant::now();
    }

    /// True when no logical connection uses the link and its idle TTL has
    /// run out.
    pub fn expired(&self, now: Instant) -> bool {
        self.logical_count() == 0 && now.duration_since(*lock(&self.last_use)) > self.ttl
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Drop for PhysConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
