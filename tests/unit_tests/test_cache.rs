// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use xrootd_client_rs::cache::{ReadCache, RemovalPolicy};

fn bytes_of(n: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; n])
}

#[test]
fn get_spans_adjacent_intervals() {
    let c = ReadCache::new(1 << 20, RemovalPolicy::Lru);
    assert!(c.submit(0, Bytes::from_static(b"aaaa")));
    assert!(c.submit(4, Bytes::from_static(b"bbbb")));

    let mut buf = [0u8; 8];
    assert_eq!(c.get(0, &mut buf, true), 8);
    assert_eq!(&buf, b"aaaabbbb");

    // A gap stops the walk; the caller sees a short read.
    assert!(c.submit(12, Bytes::from_static(b"cccc")));
    let mut buf = [0u8; 16];
    assert_eq!(c.get(0, &mut buf, true), 8);
}

#[test]
fn last_submit_wins_over_the_same_range() {
    let c = ReadCache::new(1 << 20, RemovalPolicy::Lru);
    assert!(c.submit(0, bytes_of(64, b'x')));
    assert!(c.submit(16, bytes_of(16, b'y')));

    let mut buf = [0u8; 64];
    assert_eq!(c.get(0, &mut buf, false), 64);
    assert_eq!(&buf[..16], &[b'x'; 16][..]);
    assert_eq!(&buf[16..32], &[b'y'; 16][..]);
    assert_eq!(&buf[32..], &[b'x'; 32][..]);
}

#[test]
fn placeholders_reserve_but_never_serve() {
    let c = ReadCache::new(1 << 20, RemovalPolicy::Lru);
    c.put_placeholder(0, 128);
    assert_eq!(c.placeholder_count(), 1);
    assert!(c.covered(0, 128));
    assert!(c.covered(100, 200));
    assert!(!c.covered(128, 256));

    let mut buf = [0u8; 16];
    assert_eq!(c.get(0, &mut buf, true), 0);

    // Arriving data replaces the covered part of the reservation.
    assert!(c.submit(0, bytes_of(64, b'd')));
    assert_eq!(c.get(0, &mut buf, true), 16);
    assert_eq!(c.placeholder_count(), 1); // [64, 128) still reserved

    c.remove_placeholder(64, 128);
    assert_eq!(c.placeholder_count(), 0);
}

#[test]
fn duplicate_prefetch_is_suppressed_by_coverage() {
    let c = ReadCache::new(1 << 20, RemovalPolicy::Lru);
    c.put_placeholder(0, 100);
    // A second reservation over the same window adds nothing.
    c.put_placeholder(0, 100);
    assert_eq!(c.placeholder_count(), 1);
    // Only the gap beyond the reservation is newly reserved.
    c.put_placeholder(50, 150);
    assert_eq!(c.placeholder_count(), 2);
}

#[test]
fn lru_eviction_skips_placeholders_and_keeps_the_hot_item() {
    let c = ReadCache::new(100, RemovalPolicy::Lru);
    c.put_placeholder(10_000, 20_000);
    assert!(c.submit(0, bytes_of(60, b'a')));
    assert!(c.submit(100, bytes_of(30, b'b')));

    // Touch the big item so the small one is the LRU victim.
    let mut buf = [0u8; 60];
    assert_eq!(c.get(0, &mut buf, false), 60);

    assert!(c.submit(200, bytes_of(30, b'c')));
    assert_eq!(c.data_bytes(), 90);
    assert_eq!(c.get(0, &mut buf, false), 60); // survived
    let mut buf = [0u8; 30];
    assert_eq!(c.get(100, &mut buf, false), 0); // evicted
    assert_eq!(c.placeholder_count(), 1); // reservations are untouchable
}

#[test]
fn fifo_eviction_drops_the_oldest_insertion() {
    let c = ReadCache::new(100, RemovalPolicy::Fifo);
    assert!(c.submit(0, bytes_of(60, b'a')));
    assert!(c.submit(100, bytes_of(30, b'b')));

    // Touching does not save an item under FIFO.
    let mut buf = [0u8; 60];
    assert_eq!(c.get(0, &mut buf, false), 60);

    assert!(c.submit(200, bytes_of(30, b'c')));
    assert_eq!(c.get(0, &mut buf, false), 0); // oldest insertion gone
    let mut buf = [0u8; 30];
    assert_eq!(c.get(100, &mut buf, false), 30);
}

#[test]
fn capacity_is_a_hard_ceiling() {
    let c = ReadCache::new(100, RemovalPolicy::Lru);
    assert!(!c.submit(0, bytes_of(200, b'x'))); // can never fit
    assert_eq!(c.data_bytes(), 0);
    assert!(c.will_fit(64));
    assert!(!c.will_fit(100));

    assert!(c.submit(0, bytes_of(80, b'x')));
    assert!(c.submit(1000, bytes_of(80, b'y')));
    assert!(c.data_bytes() <= 100);
}

#[test]
fn remove_range_splits_partial_overlaps() {
    let c = ReadCache::new(1 << 20, RemovalPolicy::Lru);
    assert!(c.submit(0, bytes_of(100, b'z')));
    c.remove(25, 75);

    let mut buf = [0u8; 25];
    assert_eq!(c.get(0, &mut buf, false), 25);
    assert_eq!(c.get(75, &mut buf, false), 25);
    let mut buf = [0u8; 10];
    assert_eq!(c.get(30, &mut buf, false), 0);
    assert_eq!(c.data_bytes(), 50);
}

#[test]
fn stats_track_hits_misses_and_submissions() {
    let c = ReadCache::new(1 << 20, RemovalPolicy::Lru);
    assert!(c.submit(0, bytes_of(100, b's')));

    let mut buf = [0u8; 50];
    assert_eq!(c.get(0, &mut buf, true), 50);
    assert_eq!(c.get(5000, &mut buf, true), 0);

    let s = c.stats();
    assert_eq!(s.reads_count, 2);
    assert_eq!(s.miss_count, 1);
    assert_eq!(s.bytes_hit, 50);
    assert_eq!(s.bytes_submitted, 100);
    assert!((s.miss_rate() - 0.5).abs() < f32::EPSILON);
    assert!((s.usefulness() - 0.5).abs() < f32::EPSILON);
}

#[test]
fn shrinking_capacity_evicts_immediately() {
    let c = ReadCache::new(1000, RemovalPolicy::Lru);
    assert!(c.submit(0, bytes_of(400, b'a')));
    assert!(c.submit(400, bytes_of(400, b'b')));
    c.set_capacity(500);
    assert!(c.data_bytes() <= 500);
}
