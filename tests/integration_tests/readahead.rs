// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use xrootd_client_rs::{
    client::file::{FileHandle, OpenOptions},
    models::{handshake::ServerKind, reqcode::RequestCode},
};

use super::common::{Frame, Handler, manager_with, start_server, test_config, url_of};

fn file_server(payload: Vec<u8>) -> Handler {
    Arc::new(move |req| match req.code {
        Some(RequestCode::Open) => vec![Frame::ok(vec![1, 2, 3, 4])],
        Some(RequestCode::Read) => {
            let from = req.read_offset().clamp(0, payload.len() as i64) as usize;
            let upto = (from + req.read_len() as usize).min(payload.len());
            vec![Frame::ok(payload[from..upto].to_vec())]
        }
        Some(RequestCode::Close) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request")],
    })
}

#[tokio::test]
async fn a_hit_triggers_read_ahead_and_later_reads_stay_local() {
    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 239) as u8).collect();
    let srv = start_server(ServerKind::DataServer, file_server(payload.clone())).await;

    let mut cfg = test_config();
    cfg.cache.read_cache_size = 1024 * 1024;
    cfg.cache.read_ahead_size = 16 * 1024;
    let mgr = manager_with(cfg);

    let file = FileHandle::open(
        mgr,
        &url_of(srv.addr, "/data/cached"),
        OpenOptions::read(),
    )
    .await
    .unwrap();

    // Miss: one synchronous wire read that populates the cache.
    let first = file.read(0, 4096).await.unwrap();
    assert_eq!(&first[..], &payload[..4096]);
    assert_eq!(srv.requests_of(RequestCode::Read).len(), 1);

    // Hit: served locally, and the hit pushes a read-ahead onto the wire.
    let second = file.read(0, 4096).await.unwrap();
    assert_eq!(&second[..], &payload[..4096]);

    let ra_arrived = srv
        .wait_for(|log| {
            log.iter().any(|r| {
                r.code == Some(RequestCode::Read) && r.read_offset() == 4096
            })
        })
        .await;
    assert!(ra_arrived, "no read-ahead request reached the server");

    // Once the prefetched bytes are in, reads inside the window produce
    // no new wire traffic.
    let cache = file.cache().unwrap().clone();
    let settled = {
        let mut ok = false;
        for _ in 0..40 {
            if cache.placeholder_count() == 0 {
                ok = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        ok
    };
    assert!(settled, "read-ahead answer never landed in the cache");

    let third = file.read(4096, 4096).await.unwrap();
    assert_eq!(&third[..], &payload[4096..8192]);
    // The only wire read at offset 4096 is the prefetch; the caller's
    // read was served from the cache.
    let at_4096 = srv
        .requests_of(RequestCode::Read)
        .iter()
        .filter(|r| r.read_offset() == 4096)
        .count();
    assert_eq!(at_4096, 1);

    let stats = cache.stats();
    assert!(stats.bytes_hit >= 8192);
    assert!(stats.reads_count >= 3);

    file.close().await.unwrap();
}
