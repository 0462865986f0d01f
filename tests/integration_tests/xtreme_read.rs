// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use xrootd_client_rs::{
    models::{handshake::ServerKind, reqcode::RequestCode},
    xtreme::extreme_read,
};

use super::common::{Frame, Handler, manager_with, start_server, test_config, url_of};

fn data_server(payload: Arc<Vec<u8>>) -> Handler {
    Arc::new(move |req| match req.code {
        Some(RequestCode::Open) => vec![Frame::ok(vec![3, 1, 4, 1])],
        Some(RequestCode::Stat) => {
            vec![Frame::ok(format!("77 {} 0 1690000000", payload.len()).into_bytes())]
        }
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
async fn two_sources_reassemble_the_whole_file() {
    let payload: Arc<Vec<u8>> =
        Arc::new((0..1024 * 1024u32).map(|i| (i % 233) as u8).collect());

    let ds1 = start_server(ServerKind::DataServer, data_server(payload.clone())).await;
    let ds2 = start_server(ServerKind::DataServer, data_server(payload.clone())).await;

    let locate_answer = format!(
        "Sr127.0.0.1:{} Sr127.0.0.1:{}",
        ds1.addr.port(),
        ds2.addr.port()
    );
    let mgr_handler: Handler = Arc::new(move |req| match req.code {
        Some(RequestCode::Locate) => {
            vec![Frame::ok(locate_answer.clone().into_bytes())]
        }
        _ => vec![Frame::error(3006, "only locate is served here")],
    });
    let lb = start_server(ServerKind::BaseRedirector, mgr_handler).await;

    let mut cfg = test_config();
    cfg.cache.read_cache_size = 8 * 1024 * 1024;
    cfg.xtreme.block_size = 16 * 1024; // plan works in 64 KiB units
    let mgr = manager_with(cfg);

    let mut xr = extreme_read(
        mgr,
        &url_of(ds1.addr, "/store/replicated"),
        Some(&format!("127.0.0.1:{}", lb.addr.port())),
        8,
    )
    .await
    .unwrap();

    assert_eq!(xr.file_size, payload.len() as i64);
    assert_eq!(xr.plan.block_count(), 16);

    // Blocks arrive out of order; reassemble by offset.
    let mut assembled = vec![0u8; payload.len()];
    let mut blocks = 0;
    while let Some(b) = xr.blocks.recv().await {
        let from = b.offset as usize;
        assembled[from..from + b.data.len()].copy_from_slice(&b.data);
        blocks += 1;
    }
    for w in xr.workers {
        let _ = w.await;
    }

    assert_eq!(blocks, 16);
    assert!(xr.plan.all_done());
    assert_eq!(&assembled[..], &payload[..]);

    // The read traffic went through the replica connections.
    let total_reads = ds1.requests_of(RequestCode::Read).len()
        + ds2.requests_of(RequestCode::Read).len();
    assert!(total_reads >= 16);
}
