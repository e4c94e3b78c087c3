//! End-to-end pipeline tests: mock chain → fetcher → sequencer →
//! processor → in-memory store.
//!
//! Run with: `cargo test --features test-utils`

#![cfg(feature = "test-utils")]
#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use alloy::primitives::Address;

use common::{MockChain, Pipeline, TEST_CHAIN_ID, hash_of};
use tokenflow_indexer::ports::Repository;
use tokenflow_indexer::types::primitives::{BlockNumber, TokenAmount};

const TIMEOUT: Duration = Duration::from_secs(10);

fn addr(byte: u8) -> Address {
    Address::from([byte; 20])
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLD START
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cold_start_contiguous_ingest() {
    // Blocks 100..=110, one Transfer(0xAA -> 0xBB, 500) of watched token
    // 0x70 in block 103
    let chain = MockChain::linear(0..=110);
    let token = addr(0x70);
    chain.add_transfer(103, 0, token, addr(0xAA), addr(0xBB), 500);

    let pipeline = Pipeline::start(chain, vec![token], 100).await;
    pipeline.wait_for_checkpoint(110, TIMEOUT).await;

    // 11 scheduled block rows plus the parent anchor at 99
    let blocks = pipeline.repo.blocks();
    assert_eq!(blocks.len(), 12);
    assert_eq!(blocks.first().unwrap().number.value(), 99);
    assert_eq!(blocks.last().unwrap().number.value(), 110);
    pipeline.assert_linear();

    let transfers = pipeline.repo.transfers();
    assert_eq!(transfers.len(), 1);
    let transfer = &transfers[0];
    assert_eq!(transfer.block_number.value(), 103);
    assert_eq!(transfer.log_index, 0);
    assert_eq!(transfer.from, addr(0xAA).into());
    assert_eq!(transfer.to, addr(0xBB).into());
    assert_eq!(transfer.amount, TokenAmount::parse("500").unwrap());
    assert_eq!(transfer.token_address, token.into());

    let checkpoint = pipeline.repo.checkpoint(TEST_CHAIN_ID).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_synced_block.value(), 110);

    // P3: no transfer above the checkpoint
    assert!(
        transfers
            .iter()
            .all(|t| t.block_number <= checkpoint.last_synced_block)
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn start_at_genesis_has_no_anchor() {
    let chain = MockChain::linear(0..=5);
    let pipeline = Pipeline::start(chain, vec![], 0).await;
    pipeline.wait_for_checkpoint(5, TIMEOUT).await;

    let blocks = pipeline.repo.blocks();
    assert_eq!(blocks.len(), 6);
    assert_eq!(blocks.first().unwrap().number.value(), 0);
    pipeline.assert_linear();

    pipeline.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORDERING
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_workers_still_commit_in_order() {
    // Four workers race over a hundred blocks; the sequencer must still
    // hand the processor a strictly increasing, contiguous stream (P5),
    // which shows up as a linear persisted chain (P1) and a checkpoint
    // equal to the max block (P2).
    let chain = MockChain::linear(0..=300);
    let token = addr(0x70);
    for block in (210..=280).step_by(7) {
        chain.add_transfer(block, 0, token, addr(0xAA), addr(0xBB), block);
    }

    let pipeline = Pipeline::start(chain, vec![], 200).await;
    pipeline.wait_for_checkpoint(300, TIMEOUT).await;

    pipeline.assert_linear();
    let blocks = pipeline.repo.blocks();
    assert_eq!(blocks.first().unwrap().number.value(), 199);
    assert_eq!(blocks.last().unwrap().number.value(), 300);
    assert_eq!(blocks.len(), 102);

    // Transfers landed ascending by (block, log_index)
    let transfers = pipeline.repo.transfers();
    assert_eq!(transfers.len(), 11);
    let mut sorted = transfers.clone();
    sorted.sort_by_key(|t| (t.block_number, t.log_index));
    assert_eq!(transfers, sorted);

    pipeline.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// REORG
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shallow_reorg_replaces_rewritten_blocks() {
    let chain = MockChain::linear(0..=205);
    let token = addr(0x70);
    chain.add_transfer(204, 0, token, addr(0xAA), addr(0xBB), 100);

    let pipeline = Pipeline::start(std::sync::Arc::clone(&chain), vec![], 200).await;
    pipeline.wait_for_checkpoint(205, TIMEOUT).await;
    assert_eq!(pipeline.repo.transfers().len(), 1);
    let old_204 = pipeline.repo.blocks().iter().find(|b| b.number.value() == 204).unwrap().hash;

    // The chain rewrites 204 and 205: new hashes, old transfer gone
    let new_204 = alloy::primitives::B256::from([0xF4; 32]);
    let new_205 = alloy::primitives::B256::from([0xF5; 32]);
    chain.clear_logs_above(203);
    chain.set_header(204, new_204, hash_of(203));
    chain.set_header(205, new_205, new_204);
    chain.set_header(206, hash_of(206), new_205);

    // Fetching 206 exposes the divergence (its parent is new_205)
    pipeline.wait_for_checkpoint(206, TIMEOUT).await;

    let blocks = pipeline.repo.blocks();
    let block_204 = blocks.iter().find(|b| b.number.value() == 204).unwrap();
    let block_205 = blocks.iter().find(|b| b.number.value() == 205).unwrap();
    assert_eq!(block_204.hash, new_204);
    assert_ne!(block_204.hash, old_204);
    assert_eq!(block_205.hash, new_205);
    pipeline.assert_linear();

    // Transfers from the orphaned 204 are gone (cascade)
    assert!(pipeline.repo.transfers().is_empty());

    let checkpoint = pipeline.repo.checkpoint(TEST_CHAIN_ID).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_synced_block.value(), 206);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn rollback_and_replay_converge_to_canonical_chain() {
    // P7: after a reorg within bounds, the final state equals a replay of
    // the canonical chain from the divergence point.
    let chain = MockChain::linear(0..=105);
    let pipeline = Pipeline::start(std::sync::Arc::clone(&chain), vec![], 100).await;
    pipeline.wait_for_checkpoint(105, TIMEOUT).await;

    // Rewrite the tip
    let new_105 = alloy::primitives::B256::from([0xD5; 32]);
    chain.set_header(105, new_105, hash_of(104));
    chain.set_header(106, hash_of(106), new_105);

    pipeline.wait_for_checkpoint(106, TIMEOUT).await;

    // Persisted chain equals the canonical chain block for block
    for block in pipeline.repo.blocks() {
        assert_eq!(
            Some(block.hash),
            chain.header_hash(block.number.value()),
            "block {} diverges from canonical chain",
            block.number
        );
    }
    pipeline.assert_linear();

    pipeline.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// WATCH-LIST MODES
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unwatched_tokens_are_filtered_by_the_mock_filter() {
    // With an empty watch-list (filter_mode = all), every transfer lands
    let chain = MockChain::linear(0..=20);
    chain.add_transfer(10, 0, addr(0x70), addr(0xAA), addr(0xBB), 1);
    chain.add_transfer(12, 0, addr(0x71), addr(0xAA), addr(0xBB), 2);

    let pipeline = Pipeline::start(chain, vec![], 5).await;
    pipeline.wait_for_checkpoint(20, TIMEOUT).await;

    assert_eq!(pipeline.repo.transfers().len(), 2);
    pipeline.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DUPLICATE DELIVERY
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rescheduling_a_range_is_idempotent() {
    // P4: re-delivering blocks and transfers is a no-op
    let chain = MockChain::linear(0..=30);
    chain.add_transfer(25, 0, addr(0x70), addr(0xAA), addr(0xBB), 9);

    let pipeline = Pipeline::start(chain, vec![], 20).await;
    pipeline.wait_for_checkpoint(30, TIMEOUT).await;

    let blocks_before = pipeline.repo.block_count();
    pipeline.schedule(20, 30).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(pipeline.repo.block_count(), blocks_before);
    assert_eq!(pipeline.repo.transfers().len(), 1);
    assert_eq!(
        pipeline
            .repo
            .checkpoint(TEST_CHAIN_ID)
            .await
            .unwrap()
            .unwrap()
            .last_synced_block,
        BlockNumber::new(30)
    );

    pipeline.shutdown().await;
}
