// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-stream mailbox.
//!
//! The reader task of a physical connection is the sole producer; the one
//! engine waiting on the stream is the sole consumer. Messages are FIFO
//! per stream id. Unsolicited attention frames never pass through here.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{ClientError, ErrorKind, Result},
    models::response::Message,
};

/// Producer half, held by the physical connection's demux table.
#[derive(Debug, Clone)]
pub struct InboxSender {
    tx: mpsc::UnboundedSender<Message>,
    len: Arc<AtomicUsize>,
}

impl InboxSender {
    pub fn put(&self, msg: Message) {
        if self.tx.send(msg).is_ok() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Consumer half, owned by one logical connection.
#[derive(Debug)]
pub struct Inbox {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    len: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

pub fn inbox_pair(cancel: CancellationToken) -> (InboxSender, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let len = Arc::new(AtomicUsize::new(0));
    (
        InboxSender { tx, len: len.clone() },
        Inbox { rx: tokio::sync::Mutex::new(rx), len, cancel },
    )
}

impl Inbox {
    /// Takes the next message, waiting up to `deadline`. Returns a
    /// `Timeout` error when the deadline fires and a `Canceled` error when
    /// the owning physical connection died (the sender side is dropped or
    /// the cancel token fires).
    pub async fn take(&self, deadline: Duration) -> Result<Message> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::new(
                ErrorKind::Canceled,
                "connection dropped while waiting for a response",
            )),
            res = tokio::time::timeout(deadline, rx.recv()) => match res {
                Ok(Some(msg)) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    Ok(msg)
                }
                Ok(None) => Err(ClientError::new(
                    ErrorKind::Canceled,
                    "connection dropped while waiting for a response",
                )),
                Err(_) => Err(ClientError::new(
                    ErrorKind::Timeout,
                    "no response within the request timeout",
                )),
            },
        }
    }

    /// Messages queued right now.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Throws away everything currently queued.
    pub async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
