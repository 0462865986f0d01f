// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One logical connection: a stream-id slot on a physical connection,
//! with its own inbox.

use std::{sync::Arc, time::Duration};

use tokio::sync::oneshot;

use crate::{
    client::{inbox::Inbox, phys::PhysConnection},
    errors::Result,
    models::{request::ClientRequest, response::Message},
};

#[derive(Debug)]
pub struct LogicalConnection {
    /// Slot index in the manager's logical table; the stream id is this
    /// index truncated to 16 bits.
    pub id: usize,
    streamid: [u8; 2],
    phys: Arc<PhysConnection>,
    inbox: Inbox,
}

impl LogicalConnection {
    pub(super) fn new(id: usize, phys: Arc<PhysConnection>) -> Result<Self> {
        let streamid = (id as u16).to_le_bytes();
        let inbox = phys.attach_stream(streamid)?;
        phys.add_logical();
        Ok(Self { id, streamid, phys, inbox })
    }

    pub fn streamid(&self) -> [u8; 2] {
        self.streamid
    }

    pub fn phys(&self) -> &Arc<PhysConnection> {
        &self.phys
    }

    /// Serializes and writes one request on the underlying link.
    pub async fn send(&self, req: &ClientRequest) -> Result<()> {
        self.phys.send_request(self.streamid, req).await
    }

    /// Takes the next response for this stream, bounded by `deadline`.
    pub async fn read_message(&self, deadline: Duration) -> Result<Message> {
        self.inbox.take(deadline).await
    }

    pub fn pending_messages(&self) -> usize {
        self.inbox.len()
    }

    pub async fn drain(&self) {
        self.inbox.drain().await
    }

    /// Parks a waiter for a delayed (waitresp) answer on this stream.
    pub fn register_waitresp(&self) -> oneshot::Receiver<Message> {
        self.phys.register_waitresp(self.streamid)
    }

    pub fn unregister_waitresp(&self) {
        self.phys.unregister_waitresp(self.streamid)
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        // Releasing the stream id wakes any pending take with a synthetic
        // socket error. No protocol close is sent; that is the engine's
        // responsibility.
        self.phys.detach_stream(self.streamid);
        self.phys.remove_logical();
    }
}
