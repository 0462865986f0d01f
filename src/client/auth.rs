// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Authentication oracle.
//!
//! The engine never interprets credential payloads. When a login answer
//! names security protocols, the oracle is asked for an opaque credential
//! blob; `authmore` replies are fed back until the server settles.

use bytes::Bytes;

use crate::errors::{ClientError, Result};

/// One opaque credential round.
#[derive(Debug, Clone)]
pub struct AuthCred {
    /// Four-byte protocol tag placed into the auth request parameters.
    pub credtype: [u8; 4],
    pub blob: Bytes,
}

pub trait AuthProvider: Send + Sync {
    /// Called with the raw protocol list from the login answer. Returns
    /// the first credential round or an error if no listed protocol is
    /// supported.
    fn initial(&self, protocol_list: &[u8]) -> Result<AuthCred>;

    /// Called with the server payload of an `authmore` answer.
    fn next(&self, server_reply: &[u8]) -> Result<AuthCred>;
}

/// The default oracle: carries no credentials at all. Any server that
/// insists on authentication fails the login.
#[derive(Debug, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn initial(&self, protocol_list: &[u8]) -> Result<AuthCred> {
        let list = String::from_utf8_lossy(protocol_list);
        Err(ClientError::permission_denied(format!(
            "server requires authentication ({}) but no credentials are configured",
            list.trim_end_matches('\0')
        )))
    }

    fn next(&self, _server_reply: &[u8]) -> Result<AuthCred> {
        Err(ClientError::permission_denied(
            "authentication continuation without a configured provider",
        ))
    }
}
