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
        Some(RequestCode::Stat) => {
            vec![Frame::ok(format!("10 {} 0 1690000000", payload.len()).into_bytes())]
        }
        Some(RequestCode::Read) => {
            let from = req.read_offset().clamp(0, payload.len() as i64) as usize;
            let upto = (from + req.read_len() as usize).min(payload.len());
            vec![Frame::ok(payload[from..upto].to_vec())]
        }
        Some(RequestCode::Close) | Some(RequestCode::Sync) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request")],
    })
}

#[tokio::test]
async fn open_stat_read_close_round_trip() {
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let srv = start_server(ServerKind::DataServer, file_server(payload.clone())).await;
    let mgr = manager_with(test_config());

    let file = FileHandle::open(
        mgr.clone(),
        &url_of(srv.addr, "/data/f1"),
        OpenOptions::read(),
    )
    .await
    .unwrap();

    assert_eq!(file.fhandle(), [1, 2, 3, 4]);
    assert_eq!(mgr.physical_count(), 1);

    let st = file.stat(false).await.unwrap();
    assert_eq!(st.size, 1024);

    let data = file.read(0, 1024).await.unwrap();
    assert_eq!(&data[..], &payload[..]);

    // A short read at end of file.
    let tail = file.read(1000, 500).await.unwrap();
    assert_eq!(&tail[..], &payload[1000..]);

    file.sync().await.unwrap();
    file.close().await.unwrap();

    // Reads on this stream used the file handle the server minted.
    for r in srv.requests_of(RequestCode::Read) {
        assert_eq!(&r.params[..4], &[1, 2, 3, 4]);
    }
}

#[tokio::test]
async fn oksofar_parts_are_concatenated() {
    let handler: Handler = Arc::new(|req| match req.code {
        Some(RequestCode::Open) => vec![Frame::ok(vec![9, 9, 9, 9])],
        Some(RequestCode::Read) => vec![
            Frame::ok_so_far(b"part-one-".to_vec()),
            Frame::ok_so_far(b"part-two-".to_vec()),
            Frame::ok(b"end".to_vec()),
        ],
        Some(RequestCode::Close) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request")],
    });
    let srv = start_server(ServerKind::DataServer, handler).await;
    let mgr = manager_with(test_config());

    let file = FileHandle::open(
        mgr,
        &url_of(srv.addr, "/data/chunked"),
        OpenOptions::read(),
    )
    .await
    .unwrap();

    let data = file.read(0, 21).await.unwrap();
    assert_eq!(&data[..], b"part-one-part-two-end");
    file.close().await.unwrap();
}

#[tokio::test]
async fn vectored_read_round_trip() {
    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 241) as u8).collect();
    let body_payload = payload.clone();
    let handler: Handler = Arc::new(move |req| match req.code {
        Some(RequestCode::Open) => vec![Frame::ok(vec![5, 5, 5, 5])],
        Some(RequestCode::Readv) => {
            // Echo each chunk header followed by its data.
            let mut out = Vec::new();
            for chunk in req.data.chunks(16) {
                let rlen =
                    i32::from_be_bytes(chunk[4..8].try_into().unwrap()) as usize;
                let offset =
                    i64::from_be_bytes(chunk[8..16].try_into().unwrap()) as usize;
                out.extend_from_slice(chunk);
                out.extend_from_slice(&body_payload[offset..offset + rlen]);
            }
            vec![Frame::ok(out)]
        }
        Some(RequestCode::Close) => vec![Frame::ok(vec![])],
        _ => vec![Frame::error(3006, "unexpected request")],
    });
    let srv = start_server(ServerKind::DataServer, handler).await;
    let mgr = manager_with(test_config());

    let file = FileHandle::open(
        mgr,
        &url_of(srv.addr, "/data/vec"),
        OpenOptions::read(),
    )
    .await
    .unwrap();

    let chunks = file.read_v(&[(0, 100), (4096, 200), (60000, 32)]).await.unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(&chunks[0][..], &payload[0..100]);
    assert_eq!(&chunks[1][..], &payload[4096..4296]);
    assert_eq!(&chunks[2][..], &payload[60000..60032]);
    file.close().await.unwrap();
}
