// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use xrootd_client_rs::{
    client::file::{FileHandle, OpenOptions},
    errors::ErrorKind,
    models::{handshake::ServerKind, reqcode::RequestCode},
};

use super::common::{Frame, Handler, manager_with, start_server, test_config, url_of};

#[tokio::test]
async fn everything_after_close_reports_not_open() {
    let handler: Handler = Arc::new(|req| match req.code {
        Some(RequestCode::Open) => vec![Frame::ok(vec![6, 6, 6, 6])],
        Some(RequestCode::Read) | Some(RequestCode::Write) => {
            vec![Frame::ok(vec![])]
        }
        Some(RequestCode::Close) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request")],
    });
    let srv = start_server(ServerKind::DataServer, handler).await;
    let mgr = manager_with(test_config());

    let file = FileHandle::open(
        mgr,
        &url_of(srv.addr, "/data/f"),
        OpenOptions::read(),
    )
    .await
    .unwrap();
    assert!(file.is_open());

    file.close().await.unwrap();
    assert!(!file.is_open());
    assert_eq!(srv.requests_of(RequestCode::Close).len(), 1);

    assert_eq!(file.read(0, 16).await.unwrap_err().kind, ErrorKind::NotOpen);
    assert_eq!(
        file.write(0, Bytes::from_static(b"x")).await.unwrap_err().kind,
        ErrorKind::NotOpen
    );
    assert_eq!(file.sync().await.unwrap_err().kind, ErrorKind::NotOpen);
    assert_eq!(file.stat(true).await.unwrap_err().kind, ErrorKind::NotOpen);
    assert_eq!(file.close().await.unwrap_err().kind, ErrorKind::NotOpen);
}

#[tokio::test]
async fn a_failed_background_open_surfaces_through_wait_open() {
    let handler: Handler = Arc::new(|req| match req.code {
        Some(RequestCode::Open) => vec![Frame::error(3011, "No such file")],
        _ => vec![Frame::error(3006, "unexpected request")],
    });
    let srv = start_server(ServerKind::DataServer, handler).await;

    let mut cfg = test_config();
    cfg.net.first_connect_max_attempts = 1;
    let mgr = manager_with(cfg);

    let file = FileHandle::open(
        mgr,
        &url_of(srv.addr, "/data/missing"),
        OpenOptions::read().parallel(),
    )
    .await
    .unwrap();

    let err = file.wait_open().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(file.read(0, 1).await.unwrap_err().kind, ErrorKind::NotFound);
}
