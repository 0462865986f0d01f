// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The request/response engine.
//!
//! `send_command` writes one request, accumulates its possibly multi-part
//! answer and drives the redirect / wait / waitresp / error recovery
//! machine: bounded redirection within a rolling window, wait-and-reissue,
//! parked waiters for delayed answers, and reconnect-through-the-load-
//! balancer after socket faults, replaying the request with a freshly
//! minted file handle where one is involved.

use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    client::{logical::LogicalConnection, manager::ConnectionManager},
    errors::{ClientError, ErrorKind, Result, map_server_errno},
    models::{
        handshake::ServerKind,
        reqcode::{RequestCode, ResponseStatus, ServerErrno},
        request::ClientRequest,
        response::{
            Message, RedirectInfo, ServerErrorBody, WaitInfo, WaitRespInfo,
        },
        url::XrdUrl,
    },
    utils::check_host_domain,
};

/// Ceiling on wait-driven reissues for everything except `open`.
const MAX_WAIT_RETRIES: u32 = 15;

/// Callback into the owner of an open file: replay the open on the
/// engine's current connection and hand back the new file handle token.
pub trait RedirectHandler: Send + Sync {
    fn reopen<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<[u8; 4]>> + Send + 'a>>;
}

/// Outcome of `send_command`.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The final answer, with all `oksofar` parts concatenated.
    Done(Message),
    /// The engine moved to another server; `open`/`login` requests are
    /// rebuilt and reissued by the caller.
    Replay,
}

enum Recovered {
    Resend,
    Replay,
}

#[derive(Debug)]
struct RedirWindow {
    count: u16,
    window_start: Instant,
}

/// One engine instance: the connection state machine behind a file or
/// admin handle.
pub struct ClientConn {
    mgr: Arc<ConnectionManager>,
    cfg: Arc<Config>,

    conn: Mutex<Option<Arc<LogicalConnection>>>,
    url: Mutex<Option<XrdUrl>>,
    /// First redirector seen; faults fall back here.
    lb_url: Mutex<Option<XrdUrl>>,

    redir: Mutex<RedirWindow>,
    /// Token from the last redirect, forwarded at the next login.
    redir_token: Mutex<Option<String>>,
    /// Opaque CGI from the last redirect, appended to the next open.
    redir_opaque: Mutex<Option<String>>,
    /// Hosts that failed after a redirect; reported back to the balancer
    /// as `tried=`.
    tried_hosts: Mutex<Vec<String>>,
    /// Reconnect-delay inherited from an asyncdi on the dead link.
    reconnect_after: Mutex<Option<Instant>>,

    last_server_error: Mutex<Option<ServerErrorBody>>,
    redir_handler: Mutex<Option<Weak<dyn RedirectHandler>>>,
}


fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ClientConn {
    pub fn new(mgr: Arc<ConnectionManager>) -> Arc<Self> {
        let cfg = mgr.cfg().clone();
        Arc::new(Self {
            mgr,
            cfg,
            conn: Mutex::new(None),
            url: Mutex::new(None),
            lb_url: Mutex::new(None),
            redir: Mutex::new(RedirWindow { count: 0, window_start: Instant::now() }),
            redir_token: Mutex::new(None),
            redir_opaque: Mutex::new(None),
            tried_hosts: Mutex::new(Vec::new()),
            reconnect_after: Mutex::new(None),
            last_server_error: Mutex::new(None),
            redir_handler: Mutex::new(None),
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.mgr
    }

    pub fn cfg(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn set_redirect_handler(&self, h: Weak<dyn RedirectHandler>) {
        *lock(&self.redir_handler) = Some(h);
    }

    /// Connects this engine to the URL's primary endpoint, sharing the
    /// physical link where possible.
    pub async fn connect_to(&self, url: &XrdUrl) -> Result<()> {
        let token = lock(&self.redir_token).clone();
        let lc = self.mgr.connect(url, token).await?;
        self.replace_conn(Some(lc));
        *lock(&self.url) = Some(url.clone());
        Ok(())
    }

    /// Drops the current logical connection. With `force_physical` the
    /// whole link is invalidated.
    pub fn disconnect(&self, force_physical: bool) {
        let old = lock(&self.conn).take();
        if let Some(lc) = old {
            // Inherit a pending asyncdi window before the link goes away.
            if let Some(t) = lc.phys().reconnect_not_before() {
                *lock(&self.reconnect_after) = Some(t.into_std());
            }
            self.mgr.disconnect(lc.id, force_physical);
        }
    }

    fn replace_conn(&self, new: Option<Arc<LogicalConnection>>) {
        let old = {
            let mut g = lock(&self.conn);
            std::mem::replace(&mut *g, new)
        };
        if let Some(lc) = old {
            self.mgr.disconnect(lc.id, false);
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.conn)
            .as_ref()
            .is_some_and(|lc| lc.phys().is_valid())
    }

    pub fn logical(&self) -> Result<Arc<LogicalConnection>> {
        lock(&self.conn)
            .clone()
            .ok_or_else(|| ClientError::io("not connected"))
    }

    pub fn server_kind(&self) -> ServerKind {
        lock(&self.conn)
            .as_ref()
            .map(|lc| lc.phys().server_kind())
            .unwrap_or(ServerKind::Unknown)
    }

    pub fn current_url(&self) -> Option<XrdUrl> {
        lock(&self.url).clone()
    }

    pub fn lb_url(&self) -> Option<XrdUrl> {
        lock(&self.lb_url).clone()
    }

    pub fn last_server_error(&self) -> Option<ServerErrorBody> {
        lock(&self.last_server_error).clone()
    }

    /// Opaque CGI saved from the last redirect, to ride on the next open.
    pub fn take_redirect_opaque(&self) -> Option<String> {
        lock(&self.redir_opaque).take()
    }

    /// Hosts to report back to the balancer as `tried=`.
    pub fn tried_hosts(&self) -> Vec<String> {
        lock(&self.tried_hosts).clone()
    }

    pub fn clear_tried_hosts(&self) {
        lock(&self.tried_hosts).clear();
    }

    /// Convenience wrapper for request codes that are never replayed by
    /// the caller (everything except open/login).
    pub async fn command(&self, req: &mut ClientRequest) -> Result<Message> {
        match self.send_command(req).await? {
            CommandOutcome::Done(m) => Ok(m),
            CommandOutcome::Replay => Err(ClientError::io(
                "engine asked for a replay of a non-replayable request",
            )),
        }
    }

    /// Sends one request and runs the receive loop until a final answer
    /// or a terminal error. See the module docs for the fault machine.
    pub async fn send_command(
        &self,
        req: &mut ClientRequest,
    ) -> Result<CommandOutcome> {
        let replay_by_caller =
            matches!(req.code, RequestCode::Open | RequestCode::Login);
        let mut wait_retries: u32 = 0;
        let mut pending: Option<Message> = None;

        'resend: loop {
            self.pre_send_checks().await?;
            let lc = self.logical()?;

            if let Err(e) = lc.send(req).await {
                debug!("write fault for {}: {e}", req.code.name());
                match self.recover_comm_fault(req, replay_by_caller).await? {
                    Recovered::Resend => continue 'resend,
                    Recovered::Replay => return Ok(CommandOutcome::Replay),
                }
            }

            let mut acc = BytesMut::new();
            let mut parts: u32 = 0;

            loop {
                let msg = match pending.take() {
                    Some(m) => m,
                    None => {
                        match lc.read_message(self.cfg.net.request_timeout).await {
                            Ok(m) => m,
                            Err(e) if e.kind == ErrorKind::Timeout => {
                                return Err(e);
                            }
                            Err(e) => {
                                debug!(
                                    "read fault for {}: {e}",
                                    req.code.name()
                                );
                                match self
                                    .recover_comm_fault(req, replay_by_caller)
                                    .await?
                                {
                                    Recovered::Resend => continue 'resend,
                                    Recovered::Replay => {
                                        return Ok(CommandOutcome::Replay);
                                    }
                                }
                            }
                        }
                    }
                };

                match msg.status() {
                    ResponseStatus::OkSoFar => {
                        acc.extend_from_slice(&msg.data);
                        parts += 1;
                    }
                    ResponseStatus::Ok => {
                        let final_msg = if parts == 0 {
                            msg
                        } else {
                            acc.extend_from_slice(&msg.data);
                            let mut header = msg.header;
                            header.dlen = acc.len() as i32;
                            Message { header, data: acc.freeze() }
                        };
                        return Ok(CommandOutcome::Done(final_msg));
                    }
                    ResponseStatus::Error => {
                        return Err(self.handle_server_error(req, &msg).await?);
                    }
                    ResponseStatus::Redirect => {
                        let r = RedirectInfo::parse(&msg.data)
                            .map_err(|e| ClientError::io(e.to_string()))?;
                        self.handle_redirect(&r).await?;
                        if replay_by_caller {
                            return Ok(CommandOutcome::Replay);
                        }
                        if let Some(fh) = self.reopen_via_handler().await? {
                            req.set_fhandle(fh);
                        }
                        continue 'resend;
                    }
                    ResponseStatus::Wait => {
                        let w = WaitInfo::parse(&msg.data)
                            .map_err(|e| ClientError::io(e.to_string()))?;
                        if req.code != RequestCode::Open {
                            wait_retries += 1;
                            if wait_retries > MAX_WAIT_RETRIES {
                                return Err(ClientError::new(
                                    ErrorKind::TooManyErrors,
                                    format!(
                                        "{} waited {wait_retries} times",
                                        req.code.name()
                                    ),
                                ));
                            }
                        }
                        info!(
                            "server asks to wait {}s before {} ({})",
                            w.seconds,
                            req.code.name(),
                            w.message
                        );
                        tokio::time::sleep(Duration::from_secs(w.seconds as u64))
                            .await;
                        continue 'resend;
                    }
                    ResponseStatus::WaitResp => {
                        let secs = WaitRespInfo::parse(&msg.data)
                            .map_err(|e| ClientError::io(e.to_string()))?
                            .seconds as u64;
                        let rx = lc.register_waitresp();
                        let deadline = Duration::from_secs(
                            secs.max(self.cfg.net.request_timeout.as_secs()),
                        );
                        debug!(
                            "parked for a delayed answer to {} (up to {}s)",
                            req.code.name(),
                            deadline.as_secs()
                        );
                        match tokio::time::timeout(deadline, rx).await {
                            Ok(Ok(real)) => {
                                pending = Some(real);
                            }
                            Ok(Err(_)) => {
                                lc.unregister_waitresp();
                                match self
                                    .recover_comm_fault(req, replay_by_caller)
                                    .await?
                                {
                                    Recovered::Resend => continue 'resend,
                                    Recovered::Replay => {
                                        return Ok(CommandOutcome::Replay);
                                    }
                                }
                            }
                            Err(_) => {
                                lc.unregister_waitresp();
                                return Err(ClientError::timeout(format!(
                                    "delayed answer to {} never came",
                                    req.code.name()
                                )));
                            }
                        }
                    }
                    ResponseStatus::AuthMore | ResponseStatus::Attn => {
                        // Auth runs at login time; attention frames never
                        // reach inboxes. Anything else is a broken peer.
                        return Err(ClientError::io(format!(
                            "unexpected status {:?} for {}",
                            msg.status(),
                            req.code.name()
                        )));
                    }
                }
            }
        }
    }

    /// Server `error` answers. The one recoverable case is an ENOENT
    /// from a data server we were redirected to: rewind to the balancer
    /// and let the caller reissue with `tried=` and the refresh bit.
    async fn handle_server_error(
        &self,
        req: &ClientRequest,
        msg: &Message,
    ) -> Result<ClientError> {
        let body = ServerErrorBody::parse(&msg.data)
            .map_err(|e| ClientError::io(e.to_string()))?;
        *lock(&self.last_server_error) = Some(body.clone());

        if req.code == RequestCode::Open
            && ServerErrno::from_i32(body.errnum) == Some(ServerErrno::NotFound)
            && let Some(lb) = self.lb_url()
            && self.current_url().map(|u| u.host().to_string())
                != Some(lb.host().to_string())
        {
            if let Some(cur) = self.current_url() {
                lock(&self.tried_hosts).push(cur.host().to_string());
            }
            warn!(
                "open got ENOENT from a redirection target; retrying at {}",
                lb.host()
            );
            self.bump_redirect()?;
            self.go_to(&lb).await?;
            return Ok(ClientError::new(
                ErrorKind::NotFound,
                "redirection target lost the file, retry through the balancer",
            ));
        }

        Ok(ClientError::new(map_server_errno(body.errnum), body.message))
    }

    /// Explicit redirect answers: count them, remember the balancer,
    /// check the target domain and move.
    async fn handle_redirect(&self, r: &RedirectInfo) -> Result<()> {
        self.bump_redirect()?;

        // The first server that redirects us is our balancer.
        if lock(&self.lb_url).is_none()
            && let Some(cur) = self.current_url()
        {
            debug!("remembering {} as the load balancer", cur.host());
            *lock(&self.lb_url) = Some(cur);
        }

        *lock(&self.redir_token) = r.token.clone();
        if r.opaque.is_some() {
            *lock(&self.redir_opaque) = r.opaque.clone();
        }

        if !check_host_domain(
            &r.host,
            &self.cfg.domains.redir_allow,
            &self.cfg.domains.redir_deny,
        ) {
            return Err(ClientError::permission_denied(format!(
                "redirection to {} is outside the allowed domains",
                r.host
            )));
        }

        let base = self
            .current_url()
            .ok_or_else(|| ClientError::io("redirect without a current url"))?;
        let target = base.with_endpoint(&r.host, r.port);
        debug!("redirected to {}:{} (token={:?})", r.host, r.port, r.token);

        // Keep trying: on a dead target fall back to the balancer until
        // the redirection window fills up.
        let mut dest = target;
        loop {
            match self.go_to(&dest).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("cannot follow redirect to {}: {e}", dest.host());
                    let lb = self
                        .lb_url()
                        .ok_or(e)?;
                    tokio::time::sleep(self.cfg.net.reconnect_timeout).await;
                    self.bump_redirect()?;
                    dest = lb;
                }
            }
        }
    }

    /// Socket-level read/write faults: tear the link down, go back to the
    /// balancer (or rebounce on the same host), then resend. Requests
    /// carrying a file handle get a fresh one through the redirect
    /// handler first.
    async fn recover_comm_fault(
        &self,
        req: &mut ClientRequest,
        replay_by_caller: bool,
    ) -> Result<Recovered> {
        self.disconnect(true);

        let dest = match self.lb_url() {
            Some(lb) => lb,
            None => self
                .current_url()
                .ok_or_else(|| ClientError::io("communication fault with no url"))?,
        };

        loop {
            self.bump_redirect()?;
            match self.go_to(&dest).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("reconnect to {} failed: {e}", dest.host());
                    tokio::time::sleep(self.cfg.net.reconnect_timeout).await;
                }
            }
        }

        if replay_by_caller {
            return Ok(Recovered::Replay);
        }
        if let Some(fh) = self.reopen_via_handler().await? {
            req.set_fhandle(fh);
        }
        Ok(Recovered::Resend)
    }

    /// Moves the engine to another server: connect (sharing where
    /// possible), honoring any asyncdi delay window.
    pub async fn go_to(&self, url: &XrdUrl) -> Result<()> {
        let reconnect_after = lock(&self.reconnect_after).take();
        if let Some(t) = reconnect_after {
            let now = Instant::now();
            if t > now {
                let d = t - now;
                info!("honoring delayed-reconnect window: {}s", d.as_secs());
                tokio::time::sleep(d).await;
            }
        }
        self.connect_to(url).await
    }

    async fn pre_send_checks(&self) -> Result<()> {
        // A forced destination from an asyncrd frame overrides everything.
        let forced = self
            .logical()
            .ok()
            .and_then(|lc| lc.phys().take_forced_destination());
        if let Some((host, port)) = forced {
            info!("server directed us to {host}:{port}");
            let base = self
                .current_url()
                .ok_or_else(|| ClientError::io("forced redirect without a url"))?;
            self.bump_redirect()?;
            self.go_to(&base.with_endpoint(&host, port)).await?;
        }
        Ok(())
    }

    /// Counts one redirection against the rolling window.
    fn bump_redirect(&self) -> Result<()> {
        let mut w = lock(&self.redir);
        if w.window_start.elapsed() > self.cfg.net.redir_count_window {
            w.count = 0;
            w.window_start = Instant::now();
        }
        w.count += 1;
        if w.count >= self.cfg.net.max_redirects {
            return Err(ClientError::new(
                ErrorKind::TooManyRedirects,
                format!("{} redirections within the window", w.count),
            ));
        }
        Ok(())
    }

    pub fn redirect_count(&self) -> u16 {
        lock(&self.redir).count
    }

    async fn reopen_via_handler(&self) -> Result<Option<[u8; 4]>> {
        let handler = lock(&self.redir_handler).clone();
        match handler.and_then(|w| w.upgrade()) {
            Some(h) => Ok(Some(h.reopen().await?)),
            None => Ok(None),
        }
    }
}
