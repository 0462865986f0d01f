// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use xrootd_client_rs::xtreme::BlockPlan;

const MIB: u64 = 1024 * 1024;

#[test]
fn partition_of_a_4mib_file_into_256kib_blocks() {
    let plan = BlockPlan::new(256 * 1024, 4 * MIB);
    assert_eq!(plan.block_count(), 16);
    assert!(!plan.all_done());

    // Two readers start at opposite halves.
    let r0 = plan.new_reader_idx();
    let r1 = plan.new_reader_idx();
    assert_eq!((r0, r1), (0, 1));

    let (idx, offset, len) = plan.block_to_prefetch(0, r0).unwrap();
    assert_eq!((idx, offset, len), (0, 0, 256 * 1024));
    let (idx, offset, _) = plan.block_to_prefetch(8, r1).unwrap();
    assert_eq!((idx, offset), (8, 8 * 256 * 1024));
}

#[test]
fn short_last_block() {
    let plan = BlockPlan::new(256 * 1024, 4 * MIB + 100);
    assert_eq!(plan.block_count(), 17);
    let r = plan.new_reader_idx();
    let (_, offset, len) = plan.block_to_prefetch(16, r).unwrap();
    assert_eq!(offset, 4 * MIB as i64);
    assert_eq!(len, 100);
}

#[test]
fn block_to_read_only_returns_own_blocks() {
    let plan = BlockPlan::new(1024, 4 * 1024);
    let r0 = plan.new_reader_idx();
    let r1 = plan.new_reader_idx();

    let (b0, ..) = plan.block_to_prefetch(0, r0).unwrap();
    assert_eq!(plan.block_to_read(0, r1), None);
    let got = plan.block_to_read(0, r0).unwrap();
    assert_eq!(got.0, b0);
}

#[test]
fn stealing_takes_contended_blocks_from_laggards() {
    let plan = BlockPlan::new(1024, 2 * 1024); // two blocks
    let r0 = plan.new_reader_idx();
    let r1 = plan.new_reader_idx();

    // r0 grabs both free blocks.
    assert_eq!(plan.block_to_prefetch(0, r0).unwrap().0, 0);
    assert_eq!(plan.block_to_prefetch(0, r0).unwrap().0, 1);

    // r0 never asks twice for its own block.
    assert!(plan.block_to_prefetch(0, r0).is_none());

    // r1 finds nothing free and steals; the same block is never stolen
    // into the same reader twice.
    let stolen = plan.block_to_prefetch(0, r1).unwrap().0;
    let stolen2 = plan.block_to_prefetch(0, r1).unwrap().0;
    assert_ne!(stolen, stolen2);
    assert!(plan.block_to_prefetch(0, r1).is_none());
}

#[test]
fn rewards_and_penalties() {
    let plan = BlockPlan::new(1024, 2 * 1024);
    let r0 = plan.new_reader_idx();
    let r1 = plan.new_reader_idx();

    let (contended, ..) = plan.block_to_prefetch(0, r0).unwrap();
    let (solo, ..) = plan.block_to_prefetch(0, r0).unwrap();
    assert_eq!(plan.block_to_prefetch(0, r1).unwrap().0, contended);

    // Winner of a contended block is rewarded.
    assert_eq!(plan.mark_read(contended), 1);
    // The loser finishing the same block is penalized.
    assert_eq!(plan.mark_read(contended), -1);
    // An uncontended finish is neutral.
    assert_eq!(plan.mark_read(solo), 0);

    assert!(plan.all_done());
    assert_eq!(plan.done_count(), 2);
}

#[test]
fn a_block_is_stolen_by_at_most_two_extra_readers() {
    let plan = BlockPlan::new(1024, 1024); // a single block
    let r0 = plan.new_reader_idx();
    let r1 = plan.new_reader_idx();
    let r2 = plan.new_reader_idx();
    let r3 = plan.new_reader_idx();

    assert!(plan.block_to_prefetch(0, r0).is_some()); // free
    assert!(plan.block_to_prefetch(0, r1).is_some()); // steal 1
    assert!(plan.block_to_prefetch(0, r2).is_some()); // steal 2
    // Three holders: nobody else may pile on.
    assert!(plan.block_to_prefetch(0, r3).is_none());
}
