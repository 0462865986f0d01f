// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use xrootd_client_rs::{
    client::file::{FileHandle, OpenOptions},
    models::{handshake::ServerKind, reqcode::RequestCode},
};

use super::common::{Frame, Handler, manager_with, start_server, test_config, url_of};

#[tokio::test]
async fn wait_delays_and_reissues_the_same_open() {
    let opens = Arc::new(AtomicUsize::new(0));
    let opens_in_handler = opens.clone();

    let handler: Handler = Arc::new(move |req| match req.code {
        Some(RequestCode::Open) => {
            if opens_in_handler.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![Frame::wait(1, "busy")]
            } else {
                vec![Frame::ok(vec![8, 8, 8, 8])]
            }
        }
        Some(RequestCode::Close) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request")],
    });
    let srv = start_server(ServerKind::DataServer, handler).await;
    let mgr = manager_with(test_config());

    let started = Instant::now();
    let file = FileHandle::open(
        mgr,
        &url_of(srv.addr, "/data/busy"),
        OpenOptions::read(),
    )
    .await
    .unwrap();

    // The server asked for one second; the reissue happened after it.
    assert!(started.elapsed().as_millis() >= 1000);
    assert_eq!(opens.load(Ordering::SeqCst), 2);
    assert_eq!(file.fhandle(), [8, 8, 8, 8]);

    file.close().await.unwrap();
}

#[tokio::test]
async fn repeated_waits_on_a_read_eventually_give_up() {
    let handler: Handler = Arc::new(|req| match req.code {
        Some(RequestCode::Open) => vec![Frame::ok(vec![1, 1, 1, 1])],
        Some(RequestCode::Read) => vec![Frame::wait(0, "forever busy")],
        Some(RequestCode::Close) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request")],
    });
    let srv = start_server(ServerKind::DataServer, handler).await;
    let mgr = manager_with(test_config());

    let file = FileHandle::open(
        mgr,
        &url_of(srv.addr, "/data/stuck"),
        OpenOptions::read(),
    )
    .await
    .unwrap();

    let err = file.read(0, 16).await.unwrap_err();
    assert_eq!(err.kind, xrootd_client_rs::errors::ErrorKind::TooManyErrors);
}
