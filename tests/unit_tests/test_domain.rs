// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use xrootd_client_rs::utils::{check_host_domain, domain_to_match, match_domain_list};

#[test]
fn pipe_separated_globs() {
    assert!(match_domain_list("cern.ch", "cern.ch|infn.it"));
    assert!(match_domain_list("infn.it", "cern.ch|infn.it"));
    assert!(!match_domain_list("example.org", "cern.ch|infn.it"));
    assert!(match_domain_list("anything", "*"));
    assert!(!match_domain_list("anything", ""));
}

#[test]
fn wildcards_are_anchored() {
    assert!(match_domain_list("farm.example.org", "*.example.org"));
    assert!(!match_domain_list("example.org", "*.example.org"));
    assert!(match_domain_list("good-stuff.net", "*good*"));
    assert!(!match_domain_list("bad.net", "*good*"));
}

#[test]
fn redirect_outside_the_allowed_list_is_refused() {
    // A redirect target matching neither pattern must be rejected.
    let allow = "good.example|*good*";
    assert!(!check_host_domain("x.bad.example", allow, ""));
    assert!(check_host_domain("x.good.example", allow, ""));
    assert!(check_host_domain("host.verygood.example", allow, ""));
}

#[test]
fn deny_list_beats_allow_list() {
    assert!(check_host_domain("n1.farm.example", "*", ""));
    assert!(!check_host_domain("n1.farm.example", "*", "farm.example"));
    assert!(!check_host_domain("n1.farm.example", "farm.example", "farm.example"));
}

#[test]
fn matching_uses_the_domain_not_the_host() {
    assert_eq!(domain_to_match("n1.farm.example"), "farm.example");
    assert!(check_host_domain("n1.farm.example", "farm.example", ""));
    // Address literals and bare names are matched whole.
    assert_eq!(domain_to_match("10.0.0.1"), "10.0.0.1");
    assert!(check_host_domain("10.0.0.1", "10.0.*", ""));
    assert_eq!(domain_to_match("localhost"), "localhost");
}
