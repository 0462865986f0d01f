// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Coordinated parallel reads of one file from several replica servers.
//!
//! A locate through a manager endpoint yields the source list; the file
//! is partitioned into fixed blocks; one worker per source prefetches
//! ahead of itself, steals blocks from laggards and adapts its depth
//! through reward/penalty feedback. Finished blocks flow out of order
//! into a bounded queue with explicit offsets.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    client::{
        admin::ClientAdmin,
        file::{FileHandle, OpenOptions},
        manager::ConnectionManager,
    },
    errors::{ClientError, ErrorKind, Result},
    models::{
        response::LocateNodeKind,
        url::{DEFAULT_PORT, XrdUrl},
    },
};

/// Depth cap of one worker.
const MAX_OUTSTANDING_CAP: i32 = 20;

/// Give-up threshold for a consistently failing source.
const MAX_WORKER_ERRORS: u32 = 5;

#[derive(Debug, Clone)]
struct BlockInfo {
    offset: i64,
    len: i32,
    done: bool,
    last_requested: Option<Instant>,
    requested_by: Vec<usize>,
}

impl BlockInfo {
    fn requested(&self, reader: usize) -> bool {
        self.requested_by.contains(&reader)
    }
}

#[derive(Debug)]
struct PlanInner {
    blocks: Vec<BlockInfo>,
    done_blocks: usize,
    readers: usize,
}

/// The shared partition plan of one extreme read.
#[derive(Debug)]
pub struct BlockPlan {
    inner: Mutex<PlanInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl BlockPlan {
    /// Partitions `file_size` bytes into `ceil(file_size / block_len)`
    /// blocks; the last one may be short.
    pub fn new(block_len: u64, file_size: u64) -> Self {
        let n = file_size.div_ceil(block_len.max(1)) as usize;
        let mut blocks = Vec::with_capacity(n);
        let mut offset = 0u64;
        for _ in 0..n {
            let len = (file_size - offset).min(block_len) as i32;
            blocks.push(BlockInfo {
                offset: offset as i64,
                len,
                done: false,
                last_requested: None,
                requested_by: Vec::new(),
            });
            offset += len as u64;
        }
        Self { inner: Mutex::new(PlanInner { blocks, done_blocks: 0, readers: 0 }) }
    }

    pub fn block_count(&self) -> usize {
        lock(&self.inner).blocks.len()
    }

    pub fn all_done(&self) -> bool {
        let g = lock(&self.inner);
        g.done_blocks >= g.blocks.len()
    }

    pub fn done_count(&self) -> usize {
        lock(&self.inner).done_blocks
    }

    /// Hands out a unique reader index.
    pub fn new_reader_idx(&self) -> usize {
        let mut g = lock(&self.inner);
        g.readers += 1;
        g.readers - 1
    }

    /// Picks a block worth prefetching, scanning circularly from `from`.
    /// Free blocks win; with none left, the least-recently-requested
    /// unfinished block held by fewer than three readers (and not by us)
    /// is stolen.
    pub fn block_to_prefetch(
        &self,
        from: usize,
        reader: usize,
    ) -> Option<(usize, i64, i32)> {
        let mut g = lock(&self.inner);
        let n = g.blocks.len();
        if n == 0 {
            return None;
        }

        for i in 0..n {
            let pos = (from + i) % n;
            let b = &mut g.blocks[pos];
            if b.requested_by.is_empty() && !b.done {
                b.requested_by.push(reader);
                b.last_requested = Some(Instant::now());
                return Some((pos, b.offset, b.len));
            }
        }

        // Steal from whoever has been sitting on a block the longest.
        let victim = g
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.done && !b.requested(reader) && b.requested_by.len() < 3
            })
            .min_by_key(|(_, b)| b.last_requested)
            .map(|(i, _)| i)?;
        let b = &mut g.blocks[victim];
        b.requested_by.push(reader);
        b.last_requested = Some(Instant::now());
        Some((victim, b.offset, b.len))
    }

    /// The next block this reader has prefetched and still owes a real
    /// read for, scanning circularly from `from`.
    pub fn block_to_read(&self, from: usize, reader: usize) -> Option<(usize, i64, i32)> {
        let mut g = lock(&self.inner);
        let n = g.blocks.len();
        for i in 0..n {
            let pos = (from + i) % n;
            let b = &mut g.blocks[pos];
            if !b.done && b.requested(reader) {
                b.last_requested = Some(Instant::now());
                return Some((pos, b.offset, b.len));
            }
        }
        None
    }

    /// Marks a block finished. Returns +1 when we won a contended block
    /// (reward), 0 for an uncontended finish, -1 when somebody else got
    /// there first (penalty; the buffer is a duplicate).
    pub fn mark_read(&self, idx: usize) -> i32 {
        let mut g = lock(&self.inner);
        let Some(b) = g.blocks.get_mut(idx) else { return 0 };
        if b.done {
            return -1;
        }
        b.done = true;
        let contended = b.requested_by.len() > 1;
        g.done_blocks += 1;
        if contended { 1 } else { 0 }
    }
}

/// One finished block; blocks arrive out of order, the offset says where
/// it belongs.
#[derive(Debug)]
pub struct DoneBlock {
    pub offset: i64,
    pub data: Bytes,
}

/// A running extreme read.
pub struct ExtremeRead {
    pub file_size: i64,
    pub plan: Arc<BlockPlan>,
    pub blocks: mpsc::Receiver<DoneBlock>,
    pub workers: Vec<JoinHandle<()>>,
}

/// Discovers replica sources of `path` through `manager` and opens the
/// whole machinery: one file handle and one worker per source, a shared
/// block plan, and the bounded output queue.
pub async fn extreme_read(
    mgr: Arc<ConnectionManager>,
    url: &str,
    manager_hint: Option<&str>,
    queue_depth: usize,
) -> Result<ExtremeRead> {
    let cfg = mgr.cfg().clone();
    if cfg.cache.read_cache_size == 0 {
        return Err(ClientError::new(
            ErrorKind::InvalidArgument,
            "extreme read needs the read cache enabled",
        ));
    }

    let ref_url = XrdUrl::parse(url).map_err(|e| ClientError::invalid(e.to_string()))?;
    let sources = list_sources(&mgr, &ref_url, manager_hint, cfg.xtreme.max_sources)
        .await?;
    info!("extreme read of {} from {} sources", ref_url.path, sources.len());

    // Open every source in parallel; the workers block on wait_open.
    let mut files = Vec::with_capacity(sources.len());
    for src in &sources {
        let fh = FileHandle::open(
            mgr.clone(),
            &src.to_string(),
            OpenOptions::read().parallel(),
        )
        .await?;
        files.push(fh);
    }

    // The reference answer for the size comes from the first source that
    // opens.
    let mut file_size = None;
    for f in &files {
        match f.stat(false).await {
            Ok(st) => {
                file_size = Some(st.size);
                break;
            }
            Err(e) => debug!("stat through {} failed: {e}", f.url()),
        }
    }
    let file_size = file_size.ok_or_else(|| {
        ClientError::new(ErrorKind::HostUnreachable, "no source could stat the file")
    })?;

    let plan_block = 4 * cfg.xtreme.block_size;
    let plan = Arc::new(BlockPlan::new(plan_block, file_size.max(0) as u64));
    let nblocks = plan.block_count();
    let nsources = files.len();

    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let mut workers = Vec::with_capacity(nsources);
    for file in files {
        let idx = plan.new_reader_idx();
        let start = idx * nblocks / nsources.max(1);
        let init_depth = ((nblocks / nsources.max(1)) as i32).clamp(1, 5);
        let plan = plan.clone();
        let tx = tx.clone();
        workers.push(tokio::spawn(async move {
            worker_loop(plan, file, idx, start, init_depth, plan_block, tx).await;
        }));
    }
    drop(tx);

    Ok(ExtremeRead { file_size, plan, blocks: rx, workers })
}

/// Locate-based source discovery. The reference URL's endpoint appears
/// exactly once in the result.
async fn list_sources(
    mgr: &Arc<ConnectionManager>,
    ref_url: &XrdUrl,
    manager_hint: Option<&str>,
    max_sources: usize,
) -> Result<Vec<XrdUrl>> {
    let manager_url = match manager_hint {
        Some(h) if h.contains("://") => h.to_string(),
        Some(h) => format!("root://{h}/"),
        None => format!("root://{}:{}/", ref_url.host(), ref_url.port()),
    };

    let mut out: Vec<XrdUrl> = Vec::new();
    match ClientAdmin::connect(mgr.clone(), &manager_url).await {
        Ok(adm) => match adm.locate(&ref_url.path, true).await {
            Ok(entries) => {
                for e in entries {
                    if !matches!(
                        e.kind,
                        LocateNodeKind::Server | LocateNodeKind::ServerPending
                    ) {
                        continue;
                    }
                    let port = if e.port == 0 { DEFAULT_PORT } else { e.port };
                    let u = ref_url.with_endpoint(&e.host, port);
                    if !out.contains(&u) {
                        out.push(u);
                    }
                    if out.len() >= max_sources {
                        break;
                    }
                }
            }
            Err(e) => warn!("locate through {manager_url} failed: {e}"),
        },
        Err(e) => warn!("cannot reach manager {manager_url}: {e}"),
    }

    let ref_ep = ref_url.with_endpoint(ref_url.host(), ref_url.port());
    if !out.contains(&ref_ep) {
        if out.len() >= max_sources && !out.is_empty() {
            out.pop();
        }
        out.push(ref_ep);
    }
    Ok(out)
}

/// One source worker: keep `max_outstanding` prefetches in flight, read
/// back the blocks we own, feed the queue, adapt depth on rewards and
/// penalties, quit when the plan is complete.
async fn worker_loop(
    plan: Arc<BlockPlan>,
    file: Arc<FileHandle>,
    reader_idx: usize,
    start_block: usize,
    init_depth: i32,
    plan_block: u64,
    tx: mpsc::Sender<DoneBlock>,
) {
    if let Err(e) = file.wait_open().await {
        warn!("extreme source {} never opened: {e}", file.url());
        return;
    }
    if let Some(cache) = file.cache() {
        cache.set_capacity(plan_block * init_depth.max(1) as u64 * 2);
    }

    let mut max_outstanding = init_depth;
    let mut outstanding: i32 = 0;
    let mut last_prefetched = start_block;
    let mut last_read = start_block;
    let mut errors: u32 = 0;

    loop {
        while outstanding < max_outstanding {
            let Some((idx, offset, len)) =
                plan.block_to_prefetch(last_prefetched, reader_idx)
            else {
                break;
            };
            match file.read_async(offset, len as usize).await {
                Ok(()) => {
                    last_prefetched = idx;
                    outstanding += 1;
                }
                Err(e) => {
                    debug!("prefetch {len}@{offset} failed: {e}");
                    break;
                }
            }
        }

        match plan.block_to_read(last_read, reader_idx) {
            Some((idx, offset, len)) => {
                match file.read(offset, len as usize).await {
                    Ok(data) => {
                        errors = 0;
                        last_read = idx;
                        outstanding = (outstanding - 1).max(0);

                        let reward = plan.mark_read(idx);
                        if reward >= 0 {
                            if tx
                                .send(DoneBlock { offset, data })
                                .await
                                .is_err()
                            {
                                // Consumer went away; nothing left to do.
                                return;
                            }
                        }
                        if reward > 0 {
                            max_outstanding =
                                (max_outstanding + 1).min(MAX_OUTSTANDING_CAP);
                            if let Some(cache) = file.cache() {
                                cache.set_capacity(
                                    plan_block * max_outstanding as u64 * 2,
                                );
                            }
                        }
                        if reward < 0 {
                            max_outstanding -= 1;
                        }
                        if max_outstanding <= 0 {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            max_outstanding = 1;
                        }
                        if let Some(cache) = file.cache() {
                            cache.remove(offset, offset + len as i64);
                        }
                    }
                    Err(e) => {
                        warn!("extreme read {len}@{offset} via {} failed: {e}",
                            file.url());
                        errors += 1;
                        outstanding = (outstanding - 1).max(0);
                        if errors >= MAX_WORKER_ERRORS {
                            warn!("giving up on source {}", file.url());
                            return;
                        }
                    }
                }
            }
            None => {
                if plan.all_done() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!("extreme worker {reader_idx} done ({} blocks)", plan.done_count());
    let _ = file.close().await;
}
