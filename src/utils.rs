// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Small helpers shared across the crate: the domain allow/deny matcher
//! and client identity bits.

/// Matches `s` against one glob pattern where `*` stands for any run of
/// characters. The pattern is anchored at both ends.
fn glob_match(pattern: &str, s: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match p.first() {
            None => s.is_empty(),
            Some(b'*') => (0..=s.len()).any(|i| inner(&p[1..], &s[i..])),
            Some(&c) => s.first() == Some(&c) && inner(&p[1..], &s[1..]),
        }
    }
    inner(pattern.as_bytes(), s.as_bytes())
}

/// Matches a domain against a pipe-separated list of glob patterns.
/// An empty list matches nothing.
pub fn match_domain_list(domain: &str, list: &str) -> bool {
    list.split('|').filter(|p| !p.is_empty()).any(|p| glob_match(p, domain))
}

/// Decides whether a host's domain passes the allow/deny pair. A deny
/// match always loses; otherwise the domain must match the allow list.
pub fn check_host_domain(host: &str, allow: &str, deny: &str) -> bool {
    let domain = domain_to_match(host);
    if !deny.is_empty() && match_domain_list(&domain, deny) {
        return false;
    }
    match_domain_list(&domain, allow)
}

/// Extracts the part of a hostname that domain lists are matched
/// against: everything after the first label. Bare names and address
/// literals are matched whole.
pub fn domain_to_match(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    match host.split_once('.') {
        Some((_, domain)) if !domain.is_empty() => domain.to_string(),
        _ => host.to_string(),
    }
}

/// The user name sent at login when the URL does not carry one.
/// The wire field is eight characters wide.
pub fn client_username() -> String {
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "nobody".to_string());
    name.chars().take(8).collect()
}
