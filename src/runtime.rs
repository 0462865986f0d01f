// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The runtime value bundling configuration, the connection manager and
//! the authentication oracle. Public APIs take an explicit runtime; code
//! that wants the legacy process-global behavior uses
//! [`Runtime::global`], which initializes lazily from the environment.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::{
    cfg::config::Config,
    client::{
        auth::{AuthProvider, NoAuth},
        manager::ConnectionManager,
    },
};

static GLOBAL: OnceCell<Arc<Runtime>> = OnceCell::new();

pub struct Runtime {
    cfg: Arc<Config>,
    mgr: Arc<ConnectionManager>,
    auth: Arc<dyn AuthProvider>,
}

impl Runtime {
    pub fn new(cfg: Config, auth: Arc<dyn AuthProvider>) -> Arc<Self> {
        let cfg = Arc::new(cfg);
        let mgr = ConnectionManager::new(cfg.clone(), auth.clone());
        Arc::new(Self { cfg, mgr, auth })
    }

    /// The process-wide runtime: defaults plus `XRD_*` environment
    /// overrides, no credentials.
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| {
                let cfg = Config::from_env().unwrap_or_default();
                Self::new(cfg, Arc::new(NoAuth))
            })
            .clone()
    }

    pub fn cfg(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.mgr
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// Tears down every connection; pending operations wake with socket
    /// errors.
    pub fn shutdown(&self) {
        self.mgr.shutdown();
    }
}
