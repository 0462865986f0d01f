// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! URL grammar:
//! `{root|xroot}://[user[:pw]@]host[:port][,host:port]*/path[?cgi]`.
//!
//! A missing port defaults to 1094. A URL may name several alternative
//! hosts; together with DNS alias expansion one URL resolves to a set of
//! candidate endpoints which are tried in random order.

use std::fmt;
use std::net::SocketAddr;

use anyhow::{Result, anyhow, bail};
use rand::seq::SliceRandom;

pub const DEFAULT_PORT: u16 = 1094;

/// One host:port alternative named in a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrdUrl {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// All host alternatives; the first is the primary one.
    pub endpoints: Vec<Endpoint>,
    pub path: String,
    pub cgi: Option<String>,
}

impl XrdUrl {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| anyhow!("url misses scheme: {s}"))?;
        if scheme != "root" && scheme != "xroot" {
            bail!("unsupported scheme: {scheme}");
        }

        // Authority runs until the first '/', the path until '?'.
        let (authority, tail) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (path, cgi) = match tail.split_once('?') {
            Some((p, q)) if !q.is_empty() => (p.to_string(), Some(q.to_string())),
            _ => (tail.to_string(), None),
        };

        let (userinfo, hostlist) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, authority),
        };
        let (user, password) = match userinfo {
            Some(u) => match u.split_once(':') {
                Some((name, pw)) => (Some(name.to_string()), Some(pw.to_string())),
                None => (Some(u.to_string()), None),
            },
            None => (None, None),
        };
        if let Some(u) = &user
            && u.is_empty()
        {
            bail!("empty user in url: {s}");
        }

        let mut endpoints = Vec::new();
        for part in hostlist.split(',') {
            if part.is_empty() {
                continue;
            }
            endpoints.push(parse_endpoint(part)?);
        }
        if endpoints.is_empty() {
            bail!("url names no host: {s}");
        }

        Ok(Self { scheme: scheme.to_string(), user, password, endpoints, path, cgi })
    }

    pub fn host(&self) -> &str {
        &self.endpoints[0].host
    }

    pub fn port(&self) -> u16 {
        self.endpoints[0].port
    }

    /// Rebuilds this URL pointing at a different primary endpoint,
    /// keeping user, path and CGI.
    pub fn with_endpoint(&self, host: &str, port: u16) -> Self {
        let mut url = self.clone();
        url.endpoints = vec![Endpoint { host: host.to_string(), port }];
        url
    }

    /// Appends a CGI fragment, inserting `?` or `&` as appropriate.
    pub fn add_cgi(&mut self, frag: &str) {
        if frag.is_empty() {
            return;
        }
        match &mut self.cgi {
            Some(cgi) => {
                cgi.push('&');
                cgi.push_str(frag);
            }
            None => self.cgi = Some(frag.to_string()),
        }
    }

    /// The path plus CGI as sent in an open/stat request body.
    pub fn path_with_cgi(&self) -> String {
        match &self.cgi {
            Some(cgi) => format!("{}?{}", self.path, cgi),
            None => self.path.clone(),
        }
    }

    /// Expands every named host through DNS and returns the candidate
    /// endpoints in pseudo-random order. Hosts that fail to resolve are
    /// skipped; an alias resolving to N addresses yields N candidates.
    pub async fn expand(&self) -> Result<Vec<Endpoint>> {
        let mut out = Vec::new();
        for ep in &self.endpoints {
            match tokio::net::lookup_host((ep.host.as_str(), ep.port)).await {
                Ok(addrs) => {
                    let mut seen_any = false;
                    for addr in addrs {
                        seen_any = true;
                        let a: SocketAddr = addr;
                        out.push(Endpoint { host: a.ip().to_string(), port: a.port() });
                    }
                    if !seen_any {
                        tracing::warn!("no addresses for {}", ep);
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot resolve {}: {e}", ep.host);
                }
            }
        }
        if out.is_empty() {
            bail!("none of the hosts of {} could be resolved", self);
        }
        out.dedup();
        out.shuffle(&mut rand::rng());
        Ok(out)
    }
}

fn parse_endpoint(part: &str) -> Result<Endpoint> {
    // Bracketed IPv6 literal or plain host[:port].
    if let Some(rest) = part.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated ipv6 literal: {part}"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse()?,
            None => DEFAULT_PORT,
        };
        return Ok(Endpoint { host: host.to_string(), port });
    }
    let (host, port) = match part.rsplit_once(':') {
        Some((h, p)) => (h, p.parse()?),
        None => (part, DEFAULT_PORT),
    };
    if host.is_empty() {
        bail!("empty host in endpoint: {part}");
    }
    Ok(Endpoint { host: host.to_string(), port })
}

impl fmt::Display for XrdUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(u) = &self.user {
            write!(f, "{u}@")?;
        }
        let hosts: Vec<String> = self.endpoints.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", hosts.join(","))?;
        write!(f, "{}", self.path)?;
        if let Some(cgi) = &self.cgi {
            write!(f, "?{cgi}")?;
        }
        Ok(())
    }
}
