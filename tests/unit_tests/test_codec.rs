// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use xrootd_client_rs::models::{
    reqcode::{OpenFlags, RequestCode},
    request::{
        ClientRequest, READV_CHUNK_LEN, REQUEST_HEADER_LEN, ReadvChunk, RequestHeader,
    },
};
use zerocopy::IntoBytes;

use super::hex_bytes;

#[test]
fn open_request_wire_layout() {
    let req = ClientRequest::open(
        "/store/f1",
        OpenFlags::READ | OpenFlags::RETSTAT,
        0o644,
    );
    let hdr = req.encode_header([0xAB, 0xCD]).unwrap();

    assert_eq!(hdr.len(), REQUEST_HEADER_LEN);
    // streamid (opaque) | requestid 3010 | mode | options | 12 reserved | dlen
    let expected = hex_bytes(
        "ABCD 0BC2 01A4 0410 000000000000000000000000 00000009",
    );
    assert_eq!(&hdr[..], &expected[..]);
    assert_eq!(req.data, Bytes::from_static(b"/store/f1"));
}

#[test]
fn read_request_wire_layout() {
    let req = ClientRequest::read([1, 2, 3, 4], 4294967296, 65536);
    let hdr = req.encode_header([0, 7]).unwrap();

    let expected = hex_bytes("0007 0BC5 01020304 0000000100000000 00010000 00000000");
    assert_eq!(&hdr[..], &expected[..]);
}

#[test]
fn header_decode_is_the_inverse_of_encode() {
    let req = ClientRequest::open("/a/b", OpenFlags::UPDATE, 0);
    let encoded = req.encode_header([0x01, 0x7F]).unwrap();

    let decoded = RequestHeader::decode(&encoded).unwrap();
    assert_eq!(decoded.streamid, [0x01, 0x7F]);
    assert_eq!(decoded.request_code(), Some(RequestCode::Open));
    assert_eq!(decoded.dlen.get(), 4);
    // Re-encoding the decoded header reproduces the original bytes.
    assert_eq!(decoded.as_bytes(), &encoded[..]);
}

#[test]
fn stream_id_is_carried_verbatim() {
    // The stream id must never be byte-swapped, whatever its bytes are.
    for sid in [[0u8, 0u8], [0x12, 0x34], [0xFF, 0x01]] {
        let req = ClientRequest::sync([9, 9, 9, 9]);
        let hdr = req.encode_header(sid).unwrap();
        assert_eq!(&hdr[..2], &sid[..]);
    }
}

#[test]
fn set_fhandle_rewrites_handle_carrying_requests() {
    let fresh = [0xDE, 0xAD, 0xBE, 0xEF];

    let mut read = ClientRequest::read([0; 4], 0, 1);
    read.set_fhandle(fresh);
    assert_eq!(&read.encode_header([0, 0]).unwrap()[4..8], &fresh[..]);

    let mut write = ClientRequest::write([0; 4], 0, Bytes::from_static(b"x"));
    write.set_fhandle(fresh);
    assert_eq!(&write.encode_header([0, 0]).unwrap()[4..8], &fresh[..]);

    let mut close = ClientRequest::close([0; 4]);
    close.set_fhandle(fresh);
    assert_eq!(&close.encode_header([0, 0]).unwrap()[4..8], &fresh[..]);

    // Requests without a handle are left alone.
    let mut open = ClientRequest::open("/f", OpenFlags::READ, 0);
    let before = open.encode_header([0, 0]).unwrap();
    open.set_fhandle(fresh);
    assert_eq!(open.encode_header([0, 0]).unwrap(), before);
}

#[test]
fn login_username_is_eight_bytes() {
    let req = ClientRequest::login(4242, "verylongname", 0x82, Bytes::new());
    let hdr = req.encode_header([0, 1]).unwrap();

    // pid | username[8] | reserved | ability | capver | role
    assert_eq!(&hdr[4..8], &4242i32.to_be_bytes());
    assert_eq!(&hdr[8..16], b"verylong");
    assert_eq!(hdr[18], 0x82);

    let short = ClientRequest::login(1, "abc", 0x82, Bytes::new());
    let hdr = short.encode_header([0, 1]).unwrap();
    assert_eq!(&hdr[8..16], b"abc\0\0\0\0\0");
}

#[test]
fn readv_body_is_a_chunk_sequence() {
    let fh = [7, 7, 7, 7];
    let chunks = [
        ReadvChunk { fhandle: fh, rlen: 1024.into(), offset: 0.into() },
        ReadvChunk { fhandle: fh, rlen: 2048.into(), offset: 8192.into() },
    ];
    let req = ClientRequest::readv(&chunks);

    assert_eq!(req.code, RequestCode::Readv);
    assert_eq!(req.data.len(), 2 * READV_CHUNK_LEN);
    assert_eq!(&req.data[..4], &fh[..]);
    assert_eq!(&req.data[4..8], &1024i32.to_be_bytes());
    assert_eq!(&req.data[8..16], &0i64.to_be_bytes());
    assert_eq!(&req.data[20..24], &2048i32.to_be_bytes());
    assert_eq!(&req.data[24..32], &8192i64.to_be_bytes());
}

#[test]
fn mv_joins_old_and_new_names() {
    let req = ClientRequest::mv("/a/old", "/b/new");
    assert_eq!(req.data, Bytes::from_static(b"/a/old /b/new"));
    let hdr = req.encode_header([0, 2]).unwrap();
    assert_eq!(&hdr[2..4], &3009u16.to_be_bytes());
}
