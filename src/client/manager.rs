// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide connection manager.
//!
//! Maps `(user, host, port)` onto shared physical connections, hands out
//! logical-connection slots whose indices double as stream ids, serializes
//! concurrent first-time connects to the same endpoint and garbage
//! collects idle links.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use dashmap::DashMap;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    client::{
        auth::AuthProvider,
        logical::LogicalConnection,
        phys::{ConnKey, PhysConnection},
    },
    errors::{ClientError, ErrorKind, Result},
    models::url::XrdUrl,
    utils::client_username,
};

/// Stream ids are the slot index truncated to 16 bits, so the table can
/// never outgrow this.
const MAX_LOGICAL_SLOTS: usize = 0x7fff;

/// Cadence of the garbage collector.
const GC_PERIOD: Duration = Duration::from_secs(2);

struct TrashEntry {
    conn: Arc<PhysConnection>,
    since: Instant,
}

enum Claim {
    /// Another task is connecting to this endpoint; wait on its channel.
    Wait(watch::Receiver<()>),
    /// We own the connect attempt; dropping the sender wakes the waiters.
    Mine(watch::Sender<()>),
}

pub struct ConnectionManager {
    cfg: Arc<Config>,
    auth: Arc<dyn AuthProvider>,
    phys: DashMap<ConnKey, Arc<PhysConnection>>,
    logical: Mutex<Vec<Option<Arc<LogicalConnection>>>>,
    connecting: tokio::sync::Mutex<HashMap<ConnKey, watch::Receiver<()>>>,
    trash: Mutex<Vec<TrashEntry>>,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionManager {
    pub fn new(cfg: Arc<Config>, auth: Arc<dyn AuthProvider>) -> Arc<Self> {
        let mgr = Arc::new(Self {
            cfg: cfg.clone(),
            auth,
            phys: DashMap::new(),
            logical: Mutex::new(Vec::new()),
            connecting: tokio::sync::Mutex::new(HashMap::new()),
            trash: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });
        if cfg.net.start_gc_task {
            let gc = Arc::downgrade(&mgr);
            let cancel = mgr.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(GC_PERIOD) => {}
                    }
                    let Some(mgr) = gc.upgrade() else { return };
                    mgr.gc_pass();
                }
            });
        }
        mgr
    }

    pub fn cfg(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// Returns a logical connection to the URL's primary endpoint,
    /// sharing a live physical connection when one exists, otherwise
    /// building one (TCP + handshake + login/auth). Concurrent first
    /// connects to the same endpoint are collapsed into one.
    pub async fn connect(
        &self,
        url: &XrdUrl,
        login_token: Option<String>,
    ) -> Result<Arc<LogicalConnection>> {
        let user = url.user.clone().unwrap_or_else(client_username);
        let key = ConnKey { user, host: url.host().to_string(), port: url.port() };

        loop {
            let claim = {
                let mut connecting = self.connecting.lock().await;
                if let Some(rx) = connecting.get(&key) {
                    Claim::Wait(rx.clone())
                } else if let Some(pc) =
                    self.phys.get(&key).map(|e| e.value().clone()).filter(|pc| pc.is_valid())
                {
                    return self.alloc_logical(pc);
                } else {
                    let (tx, rx) = watch::channel(());
                    connecting.insert(key.clone(), rx);
                    Claim::Mine(tx)
                }
            };

            match claim {
                Claim::Wait(mut rx) => {
                    // Wakes both on an explicit send and when the
                    // connecting task drops its sender.
                    let _ = rx.changed().await;
                }
                Claim::Mine(tx) => {
                    let res = self.build_phys(&key, login_token.clone()).await;
                    self.connecting.lock().await.remove(&key);
                    drop(tx);
                    let pc = res?;
                    self.phys.insert(key.clone(), pc.clone());
                    return self.alloc_logical(pc);
                }
            }
        }
    }

    async fn build_phys(
        &self,
        key: &ConnKey,
        login_token: Option<String>,
    ) -> Result<Arc<PhysConnection>> {
        let pc = PhysConnection::connect(
            key.clone(),
            self.cfg.clone(),
            self.auth.clone(),
            login_token,
        )
        .await?;
        if self.cfg.net.multistream_count > 0 {
            pc.bind_extra_streams(self.cfg.net.multistream_count).await?;
        }
        Ok(pc)
    }

    /// Picks the first free slot, appending when none is free. The slot
    /// index is the stream id.
    fn alloc_logical(&self, pc: Arc<PhysConnection>) -> Result<Arc<LogicalConnection>> {
        let mut table = lock(&self.logical);
        let idx = match table.iter().position(|slot| slot.is_none()) {
            Some(i) => i,
            None => {
                if table.len() >= MAX_LOGICAL_SLOTS {
                    return Err(ClientError::new(
                        ErrorKind::TooManyErrors,
                        "logical connection table is full",
                    ));
                }
                table.push(None);
                table.len() - 1
            }
        };
        let lc = Arc::new(LogicalConnection::new(idx, pc)?);
        table[idx] = Some(lc.clone());
        debug!("allocated logical connection {idx} on {}", lc.phys().key);
        Ok(lc)
    }

    /// Allocates a second stream on the same physical connection; used
    /// for one-shot async reads riding beside a primary stream.
    pub fn sibling(&self, of: &LogicalConnection) -> Result<Arc<LogicalConnection>> {
        let pc = of.phys().clone();
        if !pc.is_valid() {
            return Err(ClientError::canceled("connection marked invalid"));
        }
        self.alloc_logical(pc)
    }

    pub fn get(&self, id: usize) -> Option<Arc<LogicalConnection>> {
        lock(&self.logical).get(id).and_then(Clone::clone)
    }

    /// Releases a logical connection. With `force_physical` the whole
    /// link is torn down: pending takes on every sibling stream wake with
    /// a socket error and the link goes to the trash list.
    pub fn disconnect(&self, id: usize, force_physical: bool) {
        let lc = {
            let mut table = lock(&self.logical);
            table.get_mut(id).and_then(Option::take)
        };
        let Some(lc) = lc else { return };
        let pc = lc.phys().clone();
        drop(lc);
        if force_physical {
            pc.mark_invalid();
            self.phys.remove(&pc.key);
            lock(&self.trash).push(TrashEntry { conn: pc, since: Instant::now() });
        }
    }

    /// One garbage-collector pass: idle expired links are disconnected
    /// and trashed; trashed links whose TTL elapsed again are destroyed
    /// (their reader tasks have long exited by then).
    fn gc_pass(&self) {
        let now = Instant::now();

        let mut expired = Vec::new();
        for e in self.phys.iter() {
            if e.value().expired(now) || !e.value().is_valid() {
                expired.push(e.key().clone());
            }
        }
        for key in expired {
            if let Some((_, pc)) = self.phys.remove(&key) {
                debug!("gc: trashing idle connection {}", pc.key);
                pc.mark_invalid();
                lock(&self.trash).push(TrashEntry { conn: pc, since: now });
            }
        }

        lock(&self.trash).retain(|t| {
            let keep = now.duration_since(t.since) <= t.conn.ttl();
            if !keep {
                debug!("gc: destroying trashed connection {}", t.conn.key);
            }
            keep
        });
    }

    /// Endpoints with a live physical connection; mostly for diagnostics
    /// and tests.
    pub fn endpoints(&self) -> Vec<ConnKey> {
        self.phys.iter().map(|e| e.key().clone()).collect()
    }

    pub fn physical_count(&self) -> usize {
        self.phys.len()
    }

    /// Tears everything down: every link is invalidated, which wakes all
    /// pending waiters with socket errors.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for e in self.phys.iter() {
            e.value().mark_invalid();
        }
        self.phys.clear();
        lock(&self.logical).clear();
        lock(&self.trash).clear();
        warn!("connection manager shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
