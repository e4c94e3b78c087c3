//! Repository integration tests against a real PostgreSQL container.
//!
//! Requires a running Docker daemon.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use alloy::primitives::B256;
use chrono::Utc;
use sqlx::postgres::PgPool;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

use tokenflow_indexer::error::AppError;
use tokenflow_indexer::ports::Repository;
use tokenflow_indexer::store::PostgresRepository;
use tokenflow_indexer::types::entities::{
    ActivityType, BlockRecord, TokenMetadata, TransferRecord,
};
use tokenflow_indexer::types::primitives::{BlockNumber, EthAddress, TokenAmount};

const CHAIN_ID: u64 = 11_155_111;

/// A test database instance with pool and repository.
///
/// The container is kept alive as long as this struct exists.
struct TestDb {
    repo: PostgresRepository,
    _container: ContainerAsync<Postgres>,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default()
            .start()
            .await
            .expect("failed to start postgres container");

        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let pool = connect_with_retries(&url, 30).await.expect("connect");
        let repo = PostgresRepository::new(pool);
        repo.run_migrations().await.expect("migrations");

        Self {
            repo,
            _container: container,
        }
    }
}

/// Postgres can take a moment to be fully ready even after the
/// "ready to accept connections" message appears.
async fn connect_with_retries(url: &str, max_attempts: u32) -> Result<PgPool, sqlx::Error> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match PgPool::connect(url).await {
            Ok(pool) => match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => return Ok(pool),
                Err(e) if attempts < max_attempts => {
                    tracing::debug!("connection verify failed (attempt {attempts}): {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            },
            Err(e) if attempts < max_attempts => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                tracing::debug!("connection failed (attempt {attempts}): {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

fn hash_of(number: u64) -> B256 {
    let mut bytes = [0_u8; 32];
    bytes[0] = 0xB0;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

fn block(number: u64) -> BlockRecord {
    BlockRecord {
        number: BlockNumber::new(number),
        hash: hash_of(number),
        parent_hash: hash_of(number.wrapping_sub(1)),
        timestamp: Utc::now(),
        processed_at: Utc::now(),
    }
}

fn transfer(block_number: u64, log_index: u64, amount: &str) -> TransferRecord {
    TransferRecord {
        block_number: BlockNumber::new(block_number),
        tx_hash: B256::from([0xAB; 32]),
        log_index,
        from: EthAddress::new([0x01; 20]),
        to: EthAddress::new([0x02; 20]),
        amount: TokenAmount::parse(amount).unwrap(),
        token_address: EthAddress::new([0x03; 20]),
        symbol: Some("TST".into()),
        activity_type: ActivityType::Transfer,
    }
}

#[tokio::test]
async fn commit_batch_is_atomic_and_advances_checkpoint() {
    let db = TestDb::new().await;

    let blocks = vec![block(100), block(101), block(102)];
    let transfers = vec![transfer(101, 0, "500"), transfer(102, 0, "750")];
    db.repo
        .commit_batch(CHAIN_ID, &blocks, &transfers)
        .await
        .unwrap();

    assert_eq!(
        db.repo.latest_block_number().await.unwrap(),
        Some(BlockNumber::new(102))
    );
    let checkpoint = db.repo.checkpoint(CHAIN_ID).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_synced_block.value(), 102);
    assert_eq!(db.repo.transfer_count().await.unwrap(), 2);

    let latest = db.repo.latest_transfers(10).await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].block_number.value(), 102);
    assert_eq!(latest[0].amount, TokenAmount::parse("750").unwrap());
}

#[tokio::test]
async fn duplicate_transfer_insert_is_a_noop() {
    let db = TestDb::new().await;

    db.repo
        .commit_batch(CHAIN_ID, &[block(50)], &[transfer(50, 0, "100")])
        .await
        .unwrap();
    // Same (block_number, log_index) again
    db.repo
        .commit_batch(CHAIN_ID, &[block(51)], &[transfer(50, 0, "999")])
        .await
        .unwrap();

    assert_eq!(db.repo.transfer_count().await.unwrap(), 1);
    let latest = db.repo.latest_transfers(10).await.unwrap();
    assert_eq!(latest[0].amount, TokenAmount::parse("100").unwrap());
}

#[tokio::test]
async fn hash_conflict_aborts_without_partial_state() {
    let db = TestDb::new().await;
    db.repo
        .commit_batch(CHAIN_ID, &[block(10)], &[])
        .await
        .unwrap();

    // Same height, different hash, plus a would-be transfer
    let mut conflicting = block(10);
    conflicting.hash = B256::from([0xEE; 32]);
    let err = db
        .repo
        .commit_batch(
            CHAIN_ID,
            &[block(11), conflicting],
            &[transfer(11, 0, "1")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ReorgDetected(n) if n.value() == 10));

    // The aborted transaction left nothing behind
    assert_eq!(
        db.repo.latest_block_number().await.unwrap(),
        Some(BlockNumber::new(10))
    );
    assert_eq!(db.repo.transfer_count().await.unwrap(), 0);
    assert_eq!(
        db.repo
            .checkpoint(CHAIN_ID)
            .await
            .unwrap()
            .unwrap()
            .last_synced_block
            .value(),
        10
    );
}

#[tokio::test]
async fn prune_future_data_cascades_and_rewinds() {
    let db = TestDb::new().await;
    let blocks: Vec<BlockRecord> = (200..=205).map(block).collect();
    let transfers = vec![transfer(203, 0, "10"), transfer(205, 0, "20")];
    db.repo
        .commit_batch(CHAIN_ID, &blocks, &transfers)
        .await
        .unwrap();

    let deleted = db
        .repo
        .prune_future_data(CHAIN_ID, BlockNumber::new(202))
        .await
        .unwrap();
    assert_eq!(deleted, 3);

    assert_eq!(
        db.repo.latest_block_number().await.unwrap(),
        Some(BlockNumber::new(202))
    );
    // Transfers cascade with their blocks
    assert_eq!(db.repo.transfer_count().await.unwrap(), 0);
    assert_eq!(
        db.repo
            .checkpoint(CHAIN_ID)
            .await
            .unwrap()
            .unwrap()
            .last_synced_block
            .value(),
        202
    );
}

#[tokio::test]
async fn checkpoint_is_monotonic_unless_forced() {
    let db = TestDb::new().await;

    db.repo
        .update_checkpoint(CHAIN_ID, BlockNumber::new(300))
        .await
        .unwrap();
    db.repo
        .update_checkpoint(CHAIN_ID, BlockNumber::new(250))
        .await
        .unwrap();
    assert_eq!(
        db.repo
            .checkpoint(CHAIN_ID)
            .await
            .unwrap()
            .unwrap()
            .last_synced_block
            .value(),
        300
    );

    db.repo
        .force_checkpoint(CHAIN_ID, BlockNumber::new(250))
        .await
        .unwrap();
    assert_eq!(
        db.repo
            .checkpoint(CHAIN_ID)
            .await
            .unwrap()
            .unwrap()
            .last_synced_block
            .value(),
        250
    );
}

#[tokio::test]
async fn token_metadata_round_trips() {
    let db = TestDb::new().await;
    let address = EthAddress::new([0x42; 20]);

    db.repo
        .save_token_metadata(&TokenMetadata {
            address,
            symbol: "USDC".into(),
            decimals: 6,
            name: "USD Coin".into(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    // Upsert refreshes in place
    db.repo
        .save_token_metadata(&TokenMetadata {
            address,
            symbol: "USDC".into(),
            decimals: 6,
            name: "USD Coin v2".into(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let all = db.repo.load_all_metadata().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].symbol, "USDC");
    assert_eq!(all[0].name, "USD Coin v2");
    assert_eq!(all[0].decimals, 6);
}

#[tokio::test]
async fn latest_blocks_come_back_descending() {
    let db = TestDb::new().await;
    let blocks: Vec<BlockRecord> = (1..=20).map(block).collect();
    db.repo.commit_batch(CHAIN_ID, &blocks, &[]).await.unwrap();

    let latest = db.repo.latest_blocks(5).await.unwrap();
    let numbers: Vec<u64> = latest.iter().map(|b| b.number.value()).collect();
    assert_eq!(numbers, vec![20, 19, 18, 17, 16]);
}
