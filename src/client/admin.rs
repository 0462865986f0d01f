// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Namespace and query operations over the same engine a file handle
//! uses: stat, dirlist, locate, mkdir/rm/rmdir/mv/chmod, truncate by
//! path, prepare and the opaque query family.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::{
    client::{conn::ClientConn, manager::ConnectionManager},
    errors::{ClientError, Result},
    models::{
        reqcode::{QueryCode, locate_opts},
        request::ClientRequest,
        response::{LocateEntry, StatInfo},
        url::XrdUrl,
    },
};

pub struct ClientAdmin {
    conn: Arc<ClientConn>,
    url: XrdUrl,
}

impl ClientAdmin {
    /// Connects to the URL's primary endpoint. The path part of the URL
    /// is ignored; every operation names its own path.
    pub async fn connect(mgr: Arc<ConnectionManager>, url: &str) -> Result<Arc<Self>> {
        let url = XrdUrl::parse(url).map_err(|e| ClientError::invalid(e.to_string()))?;
        let conn = ClientConn::new(mgr);
        conn.connect_to(&url).await?;
        Ok(Arc::new(Self { conn, url }))
    }

    pub fn engine(&self) -> &Arc<ClientConn> {
        &self.conn
    }

    pub fn url(&self) -> &XrdUrl {
        &self.url
    }

    pub async fn stat(&self, path: &str) -> Result<StatInfo> {
        let mut req = ClientRequest::stat(path);
        let msg = self.conn.command(&mut req).await?;
        StatInfo::parse(&msg.data).map_err(|e| ClientError::io(e.to_string()))
    }

    /// Directory listing: one entry per line in the answer.
    pub async fn dirlist(&self, path: &str) -> Result<Vec<String>> {
        let mut req = ClientRequest::dirlist(path);
        let msg = self.conn.command(&mut req).await?;
        let text = String::from_utf8_lossy(&msg.data);
        Ok(text
            .split('\n')
            .map(|l| l.trim_end_matches('\0').trim())
            .filter(|l| !l.is_empty() && *l != "." && *l != "..")
            .map(str::to_string)
            .collect())
    }

    /// Asks the redirector which servers hold `path`.
    pub async fn locate(&self, path: &str, nowait: bool) -> Result<Vec<LocateEntry>> {
        let opts = if nowait { locate_opts::NOWAIT } else { 0 };
        let mut req = ClientRequest::locate(path, opts);
        let msg = self.conn.command(&mut req).await?;
        let entries = LocateEntry::parse_list(&msg.data)
            .map_err(|e| ClientError::io(e.to_string()))?;
        debug!("locate {path}: {} endpoints", entries.len());
        Ok(entries)
    }

    pub async fn mkdir(&self, path: &str, mode: u16) -> Result<()> {
        let mut req = ClientRequest::mkdir(path, mode);
        self.conn.command(&mut req).await.map(|_| ())
    }

    pub async fn rm(&self, path: &str) -> Result<()> {
        let mut req = ClientRequest::rm(path);
        self.conn.command(&mut req).await.map(|_| ())
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let mut req = ClientRequest::rmdir(path);
        self.conn.command(&mut req).await.map(|_| ())
    }

    pub async fn mv(&self, old: &str, new: &str) -> Result<()> {
        let mut req = ClientRequest::mv(old, new);
        self.conn.command(&mut req).await.map(|_| ())
    }

    pub async fn chmod(&self, path: &str, mode: u16) -> Result<()> {
        let mut req = ClientRequest::chmod(path, mode);
        self.conn.command(&mut req).await.map(|_| ())
    }

    pub async fn truncate(&self, path: &str, size: i64) -> Result<()> {
        let mut req = ClientRequest::truncate([0u8; 4], size);
        req.data = Bytes::copy_from_slice(path.as_bytes());
        self.conn.command(&mut req).await.map(|_| ())
    }

    /// Stages files server-side ahead of access.
    pub async fn prepare(&self, paths: &[&str], options: u8, priority: u8) -> Result<()> {
        let joined = paths.join("\n");
        let mut req = ClientRequest::prepare(&joined, options, priority);
        self.conn.command(&mut req).await.map(|_| ())
    }

    /// Opaque query round trip; the payload stays uninterpreted.
    pub async fn query(&self, code: QueryCode, args: &[u8]) -> Result<Bytes> {
        let mut req = ClientRequest::query(code, Bytes::copy_from_slice(args));
        let msg = self.conn.command(&mut req).await?;
        Ok(msg.data)
    }

    /// Server-computed checksum of `path`, as opaque bytes for the
    /// caller's checksum oracle.
    pub async fn query_checksum(&self, path: &str) -> Result<Bytes> {
        self.query(QueryCode::Cksum, path.as_bytes()).await
    }

    pub async fn query_config(&self, what: &str) -> Result<Bytes> {
        self.query(QueryCode::Config, what.as_bytes()).await
    }

    pub async fn query_space(&self, name: &str) -> Result<Bytes> {
        self.query(QueryCode::Space, name.as_bytes()).await
    }

    pub async fn query_xattr(&self, paths: &str) -> Result<Bytes> {
        self.query(QueryCode::Xattr, paths.as_bytes()).await
    }

    /// Path-list stat: one `statx` round trip answering a flag byte per
    /// path.
    pub async fn statx(&self, paths: &str) -> Result<Bytes> {
        let mut req = ClientRequest::statx(paths);
        let msg = self.conn.command(&mut req).await?;
        Ok(msg.data)
    }
}
