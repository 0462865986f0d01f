// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! High-level file handle: open (optionally in the background), read with
//! read-ahead into the per-file cache, write, sync, stat, truncate,
//! vectored read and close, plus the reopen callback the engine uses after
//! a fault-recovered redirect.

use std::{
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicI64, Ordering},
    },
};

use bytes::Bytes;
use once_cell::sync::Lazy;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};
use zerocopy::FromBytes as ZFromBytes;

use crate::{
    cache::ReadCache,
    client::{
        conn::{ClientConn, CommandOutcome, RedirectHandler},
        manager::ConnectionManager,
    },
    errors::{ClientError, ErrorKind, Result},
    models::{
        reqcode::OpenFlags,
        request::{ClientRequest, READV_CHUNK_LEN, ReadvChunk},
        response::StatInfo,
        url::XrdUrl,
    },
    utils::check_host_domain,
};

/// Caps process-wide concurrent opens so a recursive copy cannot fan out
/// into thousands of parked tasks.
static OPEN_SEMAPHORE: Lazy<Arc<Semaphore>> =
    Lazy::new(|| Arc::new(Semaphore::new(100)));

/// Read-ahead issue granularity.
const RA_ALIGN: i64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenState {
    InProgress,
    Open,
    Failed(ErrorKind),
    Closed,
}

/// How to open a file.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub flags: OpenFlags,
    pub mode: u16,
    /// Run the open in a background task; operations block on it through
    /// `wait_open`.
    pub parallel: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { flags: OpenFlags::READ, mode: 0, parallel: false }
    }
}

impl OpenOptions {
    pub fn read() -> Self {
        Self::default()
    }

    pub fn update() -> Self {
        Self { flags: OpenFlags::UPDATE, ..Self::default() }
    }

    pub fn create(mode: u16) -> Self {
        Self {
            flags: OpenFlags::NEW | OpenFlags::UPDATE | OpenFlags::MKPATH,
            mode,
            ..Self::default()
        }
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

pub struct FileHandle {
    conn: Arc<ClientConn>,
    url: XrdUrl,
    flags: Mutex<OpenFlags>,
    mode: u16,
    fhandle: Mutex<[u8; 4]>,
    open_state: watch::Sender<OpenState>,
    stat_cache: Mutex<Option<StatInfo>>,
    cache: Option<Arc<ReadCache>>,
    read_ahead_last: AtomicI64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("url", &self.url).finish()
    }
}

impl FileHandle {
    /// Opens `url`. With `parallel` the constructor returns immediately
    /// and the open proceeds in the background.
    pub async fn open(
        mgr: Arc<ConnectionManager>,
        url: &str,
        opts: OpenOptions,
    ) -> Result<Arc<Self>> {
        let url = XrdUrl::parse(url).map_err(|e| ClientError::invalid(e.to_string()))?;
        let conn = ClientConn::new(mgr);
        let cfg = conn.cfg().clone();

        let cache = (cfg.cache.read_cache_size > 0).then(|| {
            Arc::new(ReadCache::new(
                cfg.cache.read_cache_size,
                cfg.cache.block_removal_policy,
            ))
        });

        let (state_tx, _) = watch::channel(OpenState::InProgress);
        let fh = Arc::new(Self {
            conn,
            url,
            flags: Mutex::new(opts.flags),
            mode: opts.mode,
            fhandle: Mutex::new([0u8; 4]),
            open_state: state_tx,
            stat_cache: Mutex::new(None),
            cache,
            read_ahead_last: AtomicI64::new(0),
        });
        let fh_dyn: Arc<dyn RedirectHandler> = fh.clone();
        let weak: std::sync::Weak<dyn RedirectHandler> = Arc::downgrade(&fh_dyn);
        fh.conn.set_redirect_handler(weak);

        if opts.parallel {
            let bg = fh.clone();
            tokio::spawn(async move {
                if let Err(e) = bg.clone().do_open().await {
                    warn!("background open of {} failed: {e}", bg.url);
                }
            });
        } else {
            fh.clone().do_open().await?;
        }
        Ok(fh)
    }

    /// Candidate walk: DNS expansion, connect-domain screening, then up
    /// to `first_connect_max_attempts` rounds over the shuffled set.
    async fn do_open(self: Arc<Self>) -> Result<()> {
        let permit = OPEN_SEMAPHORE
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::canceled("open semaphore closed"))?;
        let res = self.open_with_retries().await;
        drop(permit);
        match &res {
            Ok(()) => {
                self.open_state.send_replace(OpenState::Open);
            }
            Err(e) => {
                self.open_state.send_replace(OpenState::Failed(e.kind));
            }
        }
        res
    }

    async fn open_with_retries(&self) -> Result<()> {
        let cfg = self.conn.cfg().clone();

        let candidates = self
            .url
            .expand()
            .await
            .map_err(|e| ClientError::new(ErrorKind::HostUnreachable, e.to_string()))?;
        let candidates: Vec<_> = candidates
            .into_iter()
            .filter(|ep| {
                let ok = check_host_domain(
                    &ep.host,
                    &cfg.domains.connect_allow,
                    &cfg.domains.connect_deny,
                );
                if !ok {
                    info!("skipping {ep}: outside the allowed connect domains");
                }
                ok
            })
            .collect();
        if candidates.is_empty() {
            return Err(ClientError::permission_denied(
                "no candidate endpoint passes the connect domain lists",
            ));
        }

        let mut saw_auth_failure = false;
        let mut last_err: Option<ClientError> = None;

        for round in 0..cfg.net.first_connect_max_attempts {
            for ep in &candidates {
                let target = self.url.with_endpoint(&ep.host, ep.port);
                let flags = *lock(&self.flags);
                match self.conn.connect_to(&target).await {
                    Ok(()) => match self.try_open(flags).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            debug!("open at {ep} failed: {e}");
                            if e.kind == ErrorKind::PermissionDenied {
                                saw_auth_failure = true;
                            }
                            last_err = Some(e);
                        }
                    },
                    Err(e) => {
                        debug!("connect to {ep} failed: {e}");
                        match e.kind {
                            // A legacy peer will not get better on retry.
                            ErrorKind::ProtocolUnsupported => return Err(e),
                            ErrorKind::PermissionDenied => saw_auth_failure = true,
                            _ => {}
                        }
                        last_err = Some(e);
                    }
                }
            }
            if round + 1 < cfg.net.first_connect_max_attempts {
                tokio::time::sleep(cfg.net.reconnect_timeout).await;
            }
        }

        if saw_auth_failure {
            return Err(ClientError::permission_denied(
                "authentication failed on every candidate endpoint",
            ));
        }
        Err(last_err.unwrap_or_else(|| {
            ClientError::new(ErrorKind::HostUnreachable, "no endpoint reachable")
        }))
    }

    /// One open round trip on the current connection. The engine may move
    /// us between servers mid-flight; every `Replay` rebuilds the request
    /// against the new one, with accumulated `tried=` feedback for the
    /// balancer.
    async fn try_open(&self, flags: OpenFlags) -> Result<()> {
        let mut lb_retries = 0u8;
        loop {
            let mut flags = flags;
            let mut url = self
                .conn
                .current_url()
                .unwrap_or_else(|| self.url.clone());
            url.path = self.url.path.clone();
            url.cgi = self.url.cgi.clone();

            if let Some(opaque) = self.conn.take_redirect_opaque() {
                url.add_cgi(&opaque);
            }
            let tried = self.conn.tried_hosts();
            if !tried.is_empty() {
                url.add_cgi(&format!("tried={}", tried.join(",")));
                flags |= OpenFlags::REFRESH;
            }

            let mut req = ClientRequest::open(&url.path_with_cgi(), flags, self.mode);
            match self.conn.send_command(&mut req).await {
                Ok(CommandOutcome::Done(msg)) => {
                    self.apply_open_answer(&msg.data, flags)?;
                    self.conn.clear_tried_hosts();
                    return Ok(());
                }
                Ok(CommandOutcome::Replay) => {
                    debug!("replaying open against {}", self.describe_endpoint());
                }
                Err(e)
                    if e.kind == ErrorKind::NotFound
                        && !self.conn.tried_hosts().is_empty()
                        && lb_retries < 2 =>
                {
                    // The engine rewound us to the balancer; reissue with
                    // the tried list and the refresh bit.
                    lb_retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_open_answer(&self, data: &[u8], flags: OpenFlags) -> Result<()> {
        if data.len() < 4 {
            return Err(ClientError::io("open answer misses the file handle"));
        }
        let mut fh = [0u8; 4];
        fh.copy_from_slice(&data[..4]);
        *lock(&self.fhandle) = fh;

        // With retstat the server appends a stat record after the
        // 12-byte fixed part.
        if flags.contains(OpenFlags::RETSTAT) && data.len() > 12 {
            match StatInfo::parse(&data[12..]) {
                Ok(st) => *lock(&self.stat_cache) = Some(st),
                Err(e) => debug!("ignoring malformed inline stat: {e}"),
            }
        }
        Ok(())
    }

    fn describe_endpoint(&self) -> String {
        self.conn
            .current_url()
            .map(|u| format!("{}:{}", u.host(), u.port()))
            .unwrap_or_else(|| "<unconnected>".to_string())
    }

    /// Blocks until a background open settles.
    pub async fn wait_open(&self) -> Result<()> {
        let mut rx = self.open_state.subscribe();
        loop {
            let s = *rx.borrow();
            match s {
                OpenState::Open => return Ok(()),
                OpenState::Closed => {
                    return Err(ClientError::not_open("file is closed"));
                }
                OpenState::Failed(kind) => {
                    return Err(ClientError::new(kind, "open failed"));
                }
                OpenState::InProgress => {
                    rx.changed().await.map_err(|_| {
                        ClientError::canceled("open task went away")
                    })?;
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open_state.borrow() == OpenState::Open
    }

    pub fn fhandle(&self) -> [u8; 4] {
        *lock(&self.fhandle)
    }

    pub fn url(&self) -> &XrdUrl {
        &self.url
    }

    pub fn engine(&self) -> &Arc<ClientConn> {
        &self.conn
    }

    pub fn cache(&self) -> Option<&Arc<ReadCache>> {
        self.cache.as_ref()
    }

    /// Reads `len` bytes at `offset`. Served from the cache when
    /// possible; a full hit triggers the async read-ahead. The returned
    /// buffer may be short at end of file.
    pub async fn read(&self, offset: i64, len: usize) -> Result<Bytes> {
        self.wait_open().await?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        if let Some(cache) = &self.cache {
            let mut buf = vec![0u8; len];
            let n = cache.get(offset, &mut buf, true);
            if n == len {
                debug!("cache hit: {len}@{offset}");
                self.maybe_read_ahead(offset, len as i64).await;
                return Ok(Bytes::from(buf));
            }
        }

        let mut req =
            ClientRequest::read(self.fhandle(), offset, len as i32);
        let msg = self.conn.command(&mut req).await?;
        if let Some(cache) = &self.cache {
            cache.submit(offset, msg.data.clone());
        }
        Ok(msg.data)
    }

    /// Hit-path read-ahead: push the prefetch window forward, aligned and
    /// capped by what the cache can still take.
    async fn maybe_read_ahead(&self, offset: i64, len: i64) {
        let cfg = self.conn.cfg();
        let rasize = cfg.cache.read_ahead_size as i64;
        if !cfg.net.go_async || rasize <= 0 {
            return;
        }
        let Some(cache) = &self.cache else { return };

        let last = self.read_ahead_last.load(Ordering::Acquire);
        let ra_offset = last.max(offset + len);
        let mut ra_len = rasize.min(offset + len + rasize - (offset + len).max(last));
        if ra_len <= 0 {
            return;
        }

        ra_len = (ra_len + RA_ALIGN - 1) / RA_ALIGN * RA_ALIGN;
        let room = cache.capacity().saturating_sub(cache.data_bytes()) as i64;
        ra_len = ra_len.min(room / RA_ALIGN * RA_ALIGN);
        if ra_len <= 0 {
            return;
        }

        if cache.covered(ra_offset, ra_offset + ra_len) {
            // Someone already reserved or fetched this window.
            self.read_ahead_last.store(ra_offset + ra_len, Ordering::Release);
            return;
        }

        debug!("read-ahead: {ra_len}@{ra_offset}");
        if self.read_async(ra_offset, ra_len as usize).await.is_ok() {
            self.read_ahead_last.store(ra_offset + ra_len, Ordering::Release);
        }
    }

    /// Issues an asynchronous read whose answer lands in the cache, not
    /// with a caller. The interval is reserved by a placeholder until the
    /// data (or a failure) arrives.
    pub async fn read_async(&self, offset: i64, len: usize) -> Result<()> {
        self.wait_open().await?;
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| ClientError::invalid("async reads need a cache"))?
            .clone();

        let lc = self.conn.logical()?;
        let sibling = self.conn.manager().sibling(&lc)?;
        let end = offset + len as i64;
        cache.put_placeholder(offset, end);
        let mgr = self.conn.manager().clone();
        let fhandle = self.fhandle();
        let timeout = self.conn.cfg().net.request_timeout;

        tokio::spawn(async move {
            let req = ClientRequest::read(fhandle, offset, len as i32);
            let res: Result<Bytes> = async {
                sibling.send(&req).await?;
                let mut acc: Option<bytes::BytesMut> = None;
                loop {
                    let msg = sibling.read_message(timeout).await?;
                    use crate::models::reqcode::ResponseStatus::*;
                    match msg.status() {
                        OkSoFar => {
                            acc.get_or_insert_with(Default::default)
                                .extend_from_slice(&msg.data);
                        }
                        Ok => {
                            return Result::Ok(match acc {
                                Some(mut a) => {
                                    a.extend_from_slice(&msg.data);
                                    a.freeze()
                                }
                                None => msg.data,
                            });
                        }
                        other => {
                            return Err(ClientError::io(format!(
                                "async read got status {other:?}"
                            )));
                        }
                    }
                }
            }
            .await;

            match res {
                Result::Ok(data) => {
                    let got = data.len() as i64;
                    cache.submit(offset, data);
                    if offset + got < end {
                        // Short read (end of file): release the tail
                        // reservation.
                        cache.remove_placeholder(offset + got, end);
                    }
                }
                Err(e) => {
                    warn!("async read {len}@{offset} failed: {e}");
                    cache.remove_placeholder(offset, end);
                }
            }
            mgr.disconnect(sibling.id, false);
        });
        Ok(())
    }

    /// Vectored read: many `(offset, len)` chunks in one round trip. The
    /// answer interleaves echoed chunk headers with the data.
    pub async fn read_v(&self, chunks: &[(i64, i32)]) -> Result<Vec<Bytes>> {
        self.wait_open().await?;
        let fh = self.fhandle();
        let list: Vec<ReadvChunk> = chunks
            .iter()
            .map(|&(offset, rlen)| ReadvChunk {
                fhandle: fh,
                rlen: rlen.into(),
                offset: offset.into(),
            })
            .collect();
        let mut req = ClientRequest::readv(&list);
        let msg = self.conn.command(&mut req).await?;

        let mut out = Vec::with_capacity(chunks.len());
        let mut rest = msg.data.clone();
        while !rest.is_empty() {
            let (hdr, _) = ReadvChunk::ref_from_prefix(&rest)
                .map_err(|_| ClientError::io("truncated readv chunk header"))?;
            let dlen = hdr.rlen.get() as usize;
            if rest.len() < READV_CHUNK_LEN + dlen {
                return Err(ClientError::io("truncated readv chunk data"));
            }
            out.push(rest.slice(READV_CHUNK_LEN..READV_CHUNK_LEN + dlen));
            rest = rest.slice(READV_CHUNK_LEN + dlen..);
        }
        Ok(out)
    }

    pub async fn write(&self, offset: i64, data: Bytes) -> Result<()> {
        self.wait_open().await?;
        let len = data.len() as i64;
        let mut req = ClientRequest::write(self.fhandle(), offset, data);
        self.conn.command(&mut req).await?;
        if let Some(cache) = &self.cache
            && self.conn.cfg().cache.purge_written_blocks
        {
            cache.remove(offset, offset + len);
        }
        Ok(())
    }

    /// Client-requested durability point.
    pub async fn sync(&self) -> Result<()> {
        self.wait_open().await?;
        let mut req = ClientRequest::sync(self.fhandle());
        self.conn.command(&mut req).await?;
        Ok(())
    }

    pub async fn truncate(&self, size: i64) -> Result<()> {
        self.wait_open().await?;
        let mut req = ClientRequest::truncate(self.fhandle(), size);
        self.conn.command(&mut req).await?;
        Ok(())
    }

    /// Stats the file. Answers are cached; `force` refreshes.
    pub async fn stat(&self, force: bool) -> Result<StatInfo> {
        self.wait_open().await?;
        if !force && let Some(st) = *lock(&self.stat_cache) {
            return Ok(st);
        }
        let mut req = ClientRequest::stat(&self.url.path);
        let msg = self.conn.command(&mut req).await?;
        let st = StatInfo::parse(&msg.data)
            .map_err(|e| ClientError::io(e.to_string()))?;
        *lock(&self.stat_cache) = Some(st);
        Ok(st)
    }

    pub async fn size(&self) -> Result<i64> {
        Ok(self.stat(false).await?.size)
    }

    /// Sends the protocol close and retires the handle. Any later
    /// operation fails with `NotOpen`.
    pub async fn close(&self) -> Result<()> {
        self.wait_open().await?;
        let mut req = ClientRequest::close(self.fhandle());
        let res = self.conn.command(&mut req).await;
        self.open_state.send_replace(OpenState::Closed);
        if let Some(cache) = &self.cache {
            cache.remove(0, i64::MAX);
        }
        self.conn.disconnect(false);
        res.map(|_| ())
    }
}

impl RedirectHandler for FileHandle {
    /// Replays the open on the engine's current (post-redirect)
    /// connection and reports the fresh handle token. Create-style bits
    /// are stripped so the replay never re-creates the file.
    fn reopen<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<[u8; 4]>> + Send + 'a>> {
        Box::pin(async move {
            let flags = lock(&self.flags).for_reopen();
            info!("reopening {} after a redirect", self.url.path);
            self.try_open(flags).await?;
            Ok(self.fhandle())
        })
    }
}
