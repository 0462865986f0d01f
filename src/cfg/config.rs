// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Client configuration. Loadable from YAML; every key can additionally be
/// overridden from the environment with an `XRD_` prefix
/// (`XRD_REQUEST_TIMEOUT=120`, `XRD_REDIR_DOMAIN_DENY_RE=...`).
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Connection establishment, timeouts and retry policy.
    #[serde(default)]
    pub net: NetConfig,
    /// Read cache and read-ahead tuning.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Allow/deny lists applied to connects and redirects.
    #[serde(default)]
    pub domains: DomainConfig,
    /// Multi-source parallel read tuning.
    #[serde(default)]
    pub xtreme: XtremeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetConfig {
    #[serde(rename = "ConnectTimeout", with = "serde_secs", default = "d_secs_60")]
    /// Bound on establishing one TCP connection.
    pub connect_timeout: Duration,

    #[serde(rename = "RequestTimeout", with = "serde_secs", default = "d_secs_60")]
    /// Bound on every single receive while waiting for an answer.
    pub request_timeout: Duration,

    #[serde(rename = "MaxRedirectCount", default = "d_255")]
    /// Ceiling on redirections applied within one counting window.
    pub max_redirects: u16,

    #[serde(rename = "DebugLevel", default)]
    pub debug_level: u8,

    #[serde(rename = "ReconnectTimeout", with = "serde_secs", default = "d_secs_20")]
    /// Sleep between reconnection rounds after a communication fault.
    pub reconnect_timeout: Duration,

    #[serde(rename = "RedirCntTimeout", with = "serde_secs", default = "d_secs_3600")]
    /// Rolling window over which redirections are counted.
    pub redir_count_window: Duration,

    #[serde(rename = "FirstConnectMaxCnt", default = "d_150")]
    /// Rounds over the candidate endpoint set before the first open
    /// gives up.
    pub first_connect_max_attempts: u32,

    #[serde(rename = "GoAsync", default = "d_true")]
    /// Enables asynchronous read-ahead.
    pub go_async: bool,

    #[serde(rename = "StartGarbageCollectorTask", default = "d_true")]
    pub start_gc_task: bool,

    #[serde(rename = "MultiStreamCount", default)]
    /// Extra parallel sockets bound into each physical connection.
    pub multistream_count: u8,

    #[serde(rename = "DataServerConnTtl", with = "serde_secs", default = "d_secs_300")]
    /// Idle time-to-live of a data-server connection.
    pub data_conn_ttl: Duration,

    #[serde(rename = "LBServerConnTtl", with = "serde_secs", default = "d_secs_1200")]
    /// Idle time-to-live of a redirector connection.
    pub lb_conn_ttl: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            max_redirects: 255,
            debug_level: 0,
            reconnect_timeout: Duration::from_secs(20),
            redir_count_window: Duration::from_secs(3600),
            first_connect_max_attempts: 150,
            go_async: true,
            start_gc_task: true,
            multistream_count: 0,
            data_conn_ttl: Duration::from_secs(300),
            lb_conn_ttl: Duration::from_secs(1200),
        }
    }
}

/// Eviction order used when the cache has to make room.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Lru,
    Fifo,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CacheConfig {
    #[serde(rename = "ReadCacheSize", default)]
    /// Per-file cache capacity in bytes; 0 disables caching.
    pub read_cache_size: u64,

    #[serde(rename = "ReadAheadSize", default = "d_1mib")]
    /// Bytes fetched ahead of the caller on a cache hit.
    pub read_ahead_size: u64,

    #[serde(rename = "ReadCacheBlkRemPolicy", default)]
    pub block_removal_policy: RemovalPolicy,

    #[serde(rename = "PurgeWrittenBlocks", default)]
    /// Drop cached intervals overlapping a write.
    pub purge_written_blocks: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            read_cache_size: 0,
            read_ahead_size: 1024 * 1024,
            block_removal_policy: RemovalPolicy::Lru,
            purge_written_blocks: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DomainConfig {
    #[serde(rename = "RedirDomainAllowRE", default = "d_star")]
    pub redir_allow: String,
    #[serde(rename = "RedirDomainDenyRE", default)]
    pub redir_deny: String,
    #[serde(rename = "ConnectDomainAllowRE", default = "d_star")]
    pub connect_allow: String,
    #[serde(rename = "ConnectDomainDenyRE", default)]
    pub connect_deny: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            redir_allow: "*".to_string(),
            redir_deny: String::new(),
            connect_allow: "*".to_string(),
            connect_deny: String::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct XtremeConfig {
    #[serde(rename = "MaxSources", default = "d_12")]
    /// Ceiling on parallel source servers per extreme read.
    pub max_sources: usize,

    #[serde(rename = "BlockSize", default = "d_256kib")]
    /// Base block size; the partition plan works in 4x this unit.
    pub block_size: u64,
}

impl Default for XtremeConfig {
    fn default() -> Self {
        Self { max_sources: 12, block_size: 256 * 1024 }
    }
}

impl Config {
    /// Loads the configuration from YAML, applies environment overrides,
    /// validates and returns the ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.apply_env();
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Configuration from defaults plus environment overrides only.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env();
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        fn secs(name: &str, into: &mut Duration) {
            if let Ok(v) = std::env::var(name)
                && let Ok(n) = v.parse::<u64>()
            {
                *into = Duration::from_secs(n);
            }
        }
        fn num<T: std::str::FromStr>(name: &str, into: &mut T) {
            if let Ok(v) = std::env::var(name)
                && let Ok(n) = v.parse::<T>()
            {
                *into = n;
            }
        }
        fn flag(name: &str, into: &mut bool) {
            if let Ok(v) = std::env::var(name) {
                *into = v != "0" && !v.eq_ignore_ascii_case("false");
            }
        }
        fn text(name: &str, into: &mut String) {
            if let Ok(v) = std::env::var(name) {
                *into = v;
            }
        }

        secs("XRD_CONNECT_TIMEOUT", &mut self.net.connect_timeout);
        secs("XRD_REQUEST_TIMEOUT", &mut self.net.request_timeout);
        num("XRD_MAX_REDIRECTS", &mut self.net.max_redirects);
        num("XRD_DEBUG_LEVEL", &mut self.net.debug_level);
        secs("XRD_RECONNECT_TIMEOUT", &mut self.net.reconnect_timeout);
        secs("XRD_REDIR_COUNT_WINDOW", &mut self.net.redir_count_window);
        num(
            "XRD_FIRST_CONNECT_MAX_ATTEMPTS",
            &mut self.net.first_connect_max_attempts,
        );
        flag("XRD_GO_ASYNC", &mut self.net.go_async);
        flag("XRD_START_GC_TASK", &mut self.net.start_gc_task);
        num("XRD_MULTISTREAM_COUNT", &mut self.net.multistream_count);
        secs("XRD_DATA_CONN_TTL", &mut self.net.data_conn_ttl);
        secs("XRD_LB_CONN_TTL", &mut self.net.lb_conn_ttl);

        num("XRD_READ_CACHE_SIZE", &mut self.cache.read_cache_size);
        num("XRD_READ_AHEAD_SIZE", &mut self.cache.read_ahead_size);
        if let Ok(v) = std::env::var("XRD_READ_CACHE_BLOCK_REM_POLICY") {
            match v.to_ascii_lowercase().as_str() {
                "fifo" => self.cache.block_removal_policy = RemovalPolicy::Fifo,
                "lru" => self.cache.block_removal_policy = RemovalPolicy::Lru,
                _ => {}
            }
        }
        flag("XRD_PURGE_WRITTEN_BLOCKS", &mut self.cache.purge_written_blocks);

        text("XRD_REDIR_DOMAIN_ALLOW_RE", &mut self.domains.redir_allow);
        text("XRD_REDIR_DOMAIN_DENY_RE", &mut self.domains.redir_deny);
        text("XRD_CONNECT_DOMAIN_ALLOW_RE", &mut self.domains.connect_allow);
        text("XRD_CONNECT_DOMAIN_DENY_RE", &mut self.domains.connect_deny);

        num("XRD_MAX_SOURCES", &mut self.xtreme.max_sources);
        num("XRD_XTREME_BLOCK_SIZE", &mut self.xtreme.block_size);
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.net.max_redirects >= 1, "MaxRedirectCount must be >= 1");
        ensure!(
            self.net.first_connect_max_attempts >= 1,
            "FirstConnectMaxCnt must be >= 1"
        );
        ensure!(self.xtreme.max_sources >= 1, "MaxSources must be >= 1");
        ensure!(self.xtreme.block_size >= 16 * 1024, "BlockSize must be >= 16 KiB");

        // A cache too small for a single read-ahead block is useless and
        // makes the placeholder accounting degenerate.
        if self.cache.read_cache_size > 0
            && self.cache.read_cache_size < self.cache.read_ahead_size
        {
            self.cache.read_cache_size = self.cache.read_ahead_size;
        }
        Ok(())
    }
}

fn d_secs_20() -> Duration {
    Duration::from_secs(20)
}
fn d_secs_60() -> Duration {
    Duration::from_secs(60)
}
fn d_secs_300() -> Duration {
    Duration::from_secs(300)
}
fn d_secs_1200() -> Duration {
    Duration::from_secs(1200)
}
fn d_secs_3600() -> Duration {
    Duration::from_secs(3600)
}
fn d_255() -> u16 {
    255
}
fn d_150() -> u32 {
    150
}
fn d_12() -> usize {
    12
}
fn d_true() -> bool {
    true
}
fn d_star() -> String {
    "*".to_string()
}
fn d_1mib() -> u64 {
    1024 * 1024
}
fn d_256kib() -> u64 {
    256 * 1024
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
