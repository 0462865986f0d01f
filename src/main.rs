// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use xrootd_client_rs::{
    cfg::{cli::resolve_config, logger::init_default_logger},
    client::{
        auth::NoAuth,
        file::{FileHandle, OpenOptions},
    },
    runtime::Runtime,
};
use tracing::info;

/// Minimal fetch tool: open a file, stat it, read the first bytes.
///
///   xrootd-client-rs root://host[:port]//path [config.yaml]
#[tokio::main]
async fn main() -> Result<()> {
    let _logger = init_default_logger()?;

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        bail!("usage: xrootd-client-rs <root://host[:port]//path> [config.yaml]");
    };
    let cfg = resolve_config(args.next().as_deref())
        .context("failed to resolve or load config")?;

    let rt = Runtime::new(cfg, Arc::new(NoAuth));

    let file = FileHandle::open(rt.manager().clone(), &url, OpenOptions::read())
        .await
        .context("open failed")?;
    info!("opened {url}");

    let st = file.stat(false).await.context("stat failed")?;
    info!("id={} size={} flags={} mtime={}", st.id, st.size, st.flags, st.mtime);

    let want = st.size.clamp(0, 4096) as usize;
    let data = file.read(0, want).await.context("read failed")?;
    info!("read {} bytes from the start of the file", data.len());

    if let Some(cache) = file.cache() {
        let s = cache.stats();
        info!(
            "cache: hits={}B submitted={}B miss_rate={:.2}",
            s.bytes_hit,
            s.bytes_submitted,
            s.miss_rate()
        );
    }

    file.close().await.context("close failed")?;
    rt.shutdown();
    Ok(())
}
