// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use xrootd_client_rs::{
    client::file::{FileHandle, OpenOptions},
    models::{handshake::ServerKind, reqcode::RequestCode},
};

use super::common::{Frame, Handler, manager_with, start_server, test_config, url_of};

#[tokio::test]
async fn balancer_redirects_the_open_to_a_data_server() {
    let payload = vec![0xA5u8; 1024];

    let ds_payload = payload.clone();
    let ds_handler: Handler = Arc::new(move |req| match req.code {
        Some(RequestCode::Open) => vec![Frame::ok(vec![4, 3, 2, 1])],
        Some(RequestCode::Read) => {
            let from = req.read_offset() as usize;
            let upto = (from + req.read_len() as usize).min(ds_payload.len());
            vec![Frame::ok(ds_payload[from..upto].to_vec())]
        }
        Some(RequestCode::Close) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request at the data server")],
    });
    let ds = start_server(ServerKind::DataServer, ds_handler).await;

    let ds_port = ds.addr.port();
    let lb_handler: Handler = Arc::new(move |req| match req.code {
        Some(RequestCode::Open) => vec![Frame::redirect("127.0.0.1", ds_port)],
        _ => vec![Frame::error(3006, "only open is served here")],
    });
    let lb = start_server(ServerKind::BaseRedirector, lb_handler).await;

    let mgr = manager_with(test_config());
    let file = FileHandle::open(
        mgr.clone(),
        &url_of(lb.addr, "/store/replicated"),
        OpenOptions::read(),
    )
    .await
    .unwrap();

    // The open was replayed against the data server with a fresh handle.
    assert_eq!(file.fhandle(), [4, 3, 2, 1]);
    assert_eq!(ds.requests_of(RequestCode::Open).len(), 1);

    let data = file.read(0, 1024).await.unwrap();
    assert_eq!(data.len(), 1024);
    assert!(data.iter().all(|&b| b == 0xA5));

    // Both the balancer and the data server keep a live physical
    // connection.
    assert_eq!(mgr.physical_count(), 2);
    let endpoints = mgr.endpoints();
    assert!(endpoints.iter().any(|k| k.port == lb.addr.port()));
    assert!(endpoints.iter().any(|k| k.port == ds_port));

    // The engine remembered who redirected us.
    assert_eq!(
        file.engine().lb_url().map(|u| u.port()),
        Some(lb.addr.port())
    );
    assert_eq!(file.engine().redirect_count(), 1);

    file.close().await.unwrap();
}

#[tokio::test]
async fn redirect_outside_the_allowed_domains_fails_the_open() {
    let lb_handler: Handler = Arc::new(|req| match req.code {
        Some(RequestCode::Open) => vec![Frame::redirect("x.bad.example", 1094)],
        _ => vec![Frame::error(3006, "only open is served here")],
    });
    let lb = start_server(ServerKind::BaseRedirector, lb_handler).await;

    let mut cfg = test_config();
    cfg.net.first_connect_max_attempts = 1;
    cfg.domains.redir_allow = "good.example|*good*".to_string();
    let mgr = manager_with(cfg);

    let err = FileHandle::open(
        mgr,
        &url_of(lb.addr, "/store/f"),
        OpenOptions::read(),
    )
    .await
    .unwrap_err();
    assert_eq!(
        err.kind,
        xrootd_client_rs::errors::ErrorKind::PermissionDenied
    );
}
