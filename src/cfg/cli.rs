// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// Picks the configuration source for the demo binary: an explicit
/// argument wins, then `XRD_CONFIG`, then built-in defaults plus the
/// `XRD_*` environment overrides.
pub fn resolve_config(arg: Option<&str>) -> Result<crate::cfg::config::Config> {
    let path = match arg {
        Some(p) => Some(p.to_string()),
        None => std::env::var("XRD_CONFIG").ok(),
    };
    match path {
        Some(p) => {
            let p = resolve_config_path(&p)?;
            crate::cfg::config::Config::load_from_file(p)
        }
        None => crate::cfg::config::Config::from_env(),
    }
}
