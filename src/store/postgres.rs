//! PostgreSQL implementation of the repository port using SQLx.
//!
//! # Type Conversions
//!
//! PostgreSQL uses signed integers (i16, i32, i64) for numeric columns while
//! the domain uses unsigned types. These casts are safe because:
//! - Block numbers won't exceed i64::MAX (~9 quintillion)
//! - Log indices won't exceed i64::MAX
//! - Decimals are 0-255 (fits in i16)
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info, instrument};

use crate::config::DatabaseSettings;
use crate::error::{AppError, InfraError, Result};
use crate::ports::Repository;
use crate::types::entities::{BlockRecord, Checkpoint, TokenMetadata, TransferRecord};
use crate::types::primitives::{BlockNumber, EthAddress, TokenAmount};

// ═══════════════════════════════════════════════════════════════════════════════
// POSTGRES REPOSITORY
// ═══════════════════════════════════════════════════════════════════════════════

/// PostgreSQL-based repository implementation.
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a repository over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the configured pool sizing and statement deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let statement_timeout_ms = settings.statement_timeout_ms;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.connect_timeout())
            .idle_timeout(settings.idle_timeout())
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {statement_timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&settings.url)
            .await
            .map_err(InfraError::Database)?;

        info!(
            max_connections = settings.max_connections,
            "Database pool connected"
        );
        Ok(Self::new(pool))
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| InfraError::Internal(format!("Migration error: {e}")))?;
        Ok(())
    }

    async fn begin_serializable(&self) -> Result<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;
        Ok(tx)
    }

    /// Insert a block row inside a transaction, verifying hash identity
    /// when the height already exists.
    async fn insert_block_tx(
        tx: &mut Transaction<'_, Postgres>,
        block: &BlockRecord,
    ) -> Result<()> {
        let existing: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT hash FROM blocks WHERE number = $1")
                .bind(i64::from(block.number))
                .fetch_optional(&mut **tx)
                .await
                .map_err(InfraError::Database)?;

        if let Some(stored) = existing {
            if stored.as_slice() == block.hash.as_slice() {
                return Ok(());
            }
            return Err(AppError::ReorgDetected(block.number));
        }

        sqlx::query(
            r#"
            INSERT INTO blocks (number, hash, parent_hash, timestamp, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(i64::from(block.number))
        .bind(block.hash.as_slice())
        .bind(block.parent_hash.as_slice())
        .bind(block.timestamp)
        .bind(block.processed_at)
        .execute(&mut **tx)
        .await
        .map_err(InfraError::Database)?;

        Ok(())
    }

    async fn insert_transfer_tx(
        tx: &mut Transaction<'_, Postgres>,
        transfer: &TransferRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfers (
                block_number, tx_hash, log_index, from_address, to_address,
                amount, token_address, symbol, activity_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (block_number, log_index) DO NOTHING
            "#,
        )
        .bind(i64::from(transfer.block_number))
        .bind(transfer.tx_hash.as_slice())
        .bind(transfer.log_index as i64)
        .bind(transfer.from.as_bytes().as_slice())
        .bind(transfer.to.as_bytes().as_slice())
        .bind(transfer.amount.to_bigdecimal())
        .bind(transfer.token_address.as_bytes().as_slice())
        .bind(transfer.symbol.as_deref())
        .bind(transfer.activity_type.as_str())
        .execute(&mut **tx)
        .await
        .map_err(InfraError::Database)?;

        Ok(())
    }

    async fn upsert_checkpoint_tx(
        tx: &mut Transaction<'_, Postgres>,
        chain_id: u64,
        number: BlockNumber,
        monotonic: bool,
    ) -> Result<()> {
        let query = if monotonic {
            r#"
            INSERT INTO sync_checkpoints (chain_id, last_synced_block, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id) DO UPDATE SET
                last_synced_block = GREATEST(sync_checkpoints.last_synced_block, EXCLUDED.last_synced_block),
                updated_at = EXCLUDED.updated_at
            "#
        } else {
            r#"
            INSERT INTO sync_checkpoints (chain_id, last_synced_block, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id) DO UPDATE SET
                last_synced_block = EXCLUDED.last_synced_block,
                updated_at = EXCLUDED.updated_at
            "#
        };

        sqlx::query(query)
            .bind(chain_id as i64)
            .bind(i64::from(number))
            .bind(Utc::now())
            .execute(&mut **tx)
            .await
            .map_err(InfraError::Database)?;

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROW TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, FromRow)]
struct BlockRow {
    number: i64,
    hash: Vec<u8>,
    parent_hash: Vec<u8>,
    timestamp: chrono::DateTime<Utc>,
    processed_at: chrono::DateTime<Utc>,
}

fn b256_from_db(bytes: &[u8], column: &str) -> std::result::Result<B256, InfraError> {
    B256::try_from(bytes)
        .map_err(|_| InfraError::Internal(format!("invalid {column} length in DB: {}", bytes.len())))
}

impl TryFrom<BlockRow> for BlockRecord {
    type Error = InfraError;

    fn try_from(row: BlockRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            number: BlockNumber::new(row.number as u64),
            hash: b256_from_db(&row.hash, "hash")?,
            parent_hash: b256_from_db(&row.parent_hash, "parent_hash")?,
            timestamp: row.timestamp,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransferRow {
    block_number: i64,
    tx_hash: Vec<u8>,
    log_index: i64,
    from_address: Vec<u8>,
    to_address: Vec<u8>,
    amount: sqlx::types::BigDecimal,
    token_address: Vec<u8>,
    symbol: Option<String>,
    activity_type: String,
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = InfraError;

    fn try_from(row: TransferRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            block_number: BlockNumber::new(row.block_number as u64),
            tx_hash: b256_from_db(&row.tx_hash, "tx_hash")?,
            log_index: row.log_index as u64,
            from: EthAddress::from_slice(&row.from_address)
                .map_err(|e| InfraError::Internal(format!("invalid from_address in DB: {e}")))?,
            to: EthAddress::from_slice(&row.to_address)
                .map_err(|e| InfraError::Internal(format!("invalid to_address in DB: {e}")))?,
            amount: TokenAmount::from_bigdecimal(&row.amount),
            token_address: EthAddress::from_slice(&row.token_address)
                .map_err(|e| InfraError::Internal(format!("invalid token_address in DB: {e}")))?,
            symbol: row.symbol,
            activity_type: row
                .activity_type
                .parse()
                .map_err(|e| InfraError::Internal(format!("invalid activity_type in DB: {e}")))?,
        })
    }
}

#[derive(Debug, FromRow)]
struct MetadataRow {
    address: Vec<u8>,
    symbol: String,
    decimals: i16,
    name: String,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<MetadataRow> for TokenMetadata {
    type Error = InfraError;

    fn try_from(row: MetadataRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            address: EthAddress::from_slice(&row.address)
                .map_err(|e| InfraError::Internal(format!("invalid token address in DB: {e}")))?,
            symbol: row.symbol,
            decimals: row.decimals as u8,
            name: row.name,
            updated_at: row.updated_at,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORY IMPLEMENTATION
// ═══════════════════════════════════════════════════════════════════════════════

const BLOCK_COLUMNS: &str = "number, hash, parent_hash, timestamp, processed_at";
const TRANSFER_COLUMNS: &str = "block_number, tx_hash, log_index, from_address, to_address, \
                                amount, token_address, symbol, activity_type";

#[async_trait]
impl Repository for PostgresRepository {
    #[instrument(skip(self, block), fields(number = %block.number))]
    async fn save_block(&self, block: &BlockRecord) -> Result<()> {
        let mut tx = self.begin_serializable().await?;
        Self::insert_block_tx(&mut tx, block).await?;
        tx.commit().await.map_err(InfraError::Database)?;
        Ok(())
    }

    #[instrument(skip(self, transfer), fields(block = %transfer.block_number, log = transfer.log_index))]
    async fn save_transfer(&self, transfer: &TransferRecord) -> Result<()> {
        let mut tx = self.begin_serializable().await?;
        Self::insert_transfer_tx(&mut tx, transfer).await?;
        tx.commit().await.map_err(InfraError::Database)?;
        Ok(())
    }

    #[instrument(
        skip(self, blocks, transfers),
        fields(blocks = blocks.len(), transfers = transfers.len())
    )]
    async fn commit_batch(
        &self,
        chain_id: u64,
        blocks: &[BlockRecord],
        transfers: &[TransferRecord],
    ) -> Result<()> {
        let Some(max_number) = blocks.iter().map(|b| b.number).max() else {
            return Ok(());
        };

        let mut tx = self.begin_serializable().await?;

        for block in blocks {
            Self::insert_block_tx(&mut tx, block).await?;
        }
        for transfer in transfers {
            Self::insert_transfer_tx(&mut tx, transfer).await?;
        }
        Self::upsert_checkpoint_tx(&mut tx, chain_id, max_number, true).await?;

        tx.commit().await.map_err(InfraError::Database)?;
        debug!(checkpoint = %max_number, "Batch committed");
        Ok(())
    }

    async fn latest_block_number(&self) -> Result<Option<BlockNumber>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(InfraError::Database)?;
        Ok(max.map(|n| BlockNumber::new(n as u64)))
    }

    async fn block_by_number(&self, number: BlockNumber) -> Result<Option<BlockRecord>> {
        let row = sqlx::query_as::<_, BlockRow>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE number = $1"
        ))
        .bind(i64::from(number))
        .fetch_optional(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        row.map(|r| BlockRecord::try_from(r).map_err(Into::into))
            .transpose()
    }

    async fn block_hash_at(&self, number: BlockNumber) -> Result<Option<B256>> {
        let hash: Option<Vec<u8>> = sqlx::query_scalar("SELECT hash FROM blocks WHERE number = $1")
            .bind(i64::from(number))
            .fetch_optional(&self.pool)
            .await
            .map_err(InfraError::Database)?;

        hash.map(|h| b256_from_db(&h, "hash").map_err(Into::into))
            .transpose()
    }

    async fn latest_blocks(&self, limit: u32) -> Result<Vec<BlockRecord>> {
        let rows = sqlx::query_as::<_, BlockRow>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY number DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        rows.into_iter()
            .map(|r| BlockRecord::try_from(r).map_err(Into::into))
            .collect()
    }

    async fn latest_transfers(&self, limit: u32) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             ORDER BY block_number DESC, log_index DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        rows.into_iter()
            .map(|r| TransferRecord::try_from(r).map_err(Into::into))
            .collect()
    }

    async fn transfer_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transfers")
            .fetch_one(&self.pool)
            .await
            .map_err(InfraError::Database)?;
        Ok(count as u64)
    }

    async fn checkpoint(&self, chain_id: u64) -> Result<Option<Checkpoint>> {
        let row: Option<(i64, chrono::DateTime<Utc>)> = sqlx::query_as(
            "SELECT last_synced_block, updated_at FROM sync_checkpoints WHERE chain_id = $1",
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        Ok(row.map(|(last, updated_at)| Checkpoint {
            chain_id,
            last_synced_block: BlockNumber::new(last as u64),
            updated_at,
        }))
    }

    #[instrument(skip(self), fields(chain_id, number = %number))]
    async fn update_checkpoint(&self, chain_id: u64, number: BlockNumber) -> Result<()> {
        let mut tx = self.begin_serializable().await?;
        Self::upsert_checkpoint_tx(&mut tx, chain_id, number, true).await?;
        tx.commit().await.map_err(InfraError::Database)?;
        Ok(())
    }

    #[instrument(skip(self), fields(chain_id, number = %number))]
    async fn force_checkpoint(&self, chain_id: u64, number: BlockNumber) -> Result<()> {
        let mut tx = self.begin_serializable().await?;
        Self::upsert_checkpoint_tx(&mut tx, chain_id, number, false).await?;
        tx.commit().await.map_err(InfraError::Database)?;
        Ok(())
    }

    #[instrument(skip(self), fields(chain_id, keep = %keep))]
    async fn prune_future_data(&self, chain_id: u64, keep: BlockNumber) -> Result<u64> {
        let mut tx = self.begin_serializable().await?;

        let deleted = sqlx::query("DELETE FROM blocks WHERE number > $1")
            .bind(i64::from(keep))
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?
            .rows_affected();

        Self::upsert_checkpoint_tx(&mut tx, chain_id, keep, false).await?;
        tx.commit().await.map_err(InfraError::Database)?;

        debug!(deleted, "Pruned blocks above cursor");
        Ok(deleted)
    }

    #[instrument(skip(self, metadata), fields(address = %metadata.address))]
    async fn save_token_metadata(&self, metadata: &TokenMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_metadata (address, symbol, decimals, name, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (address) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                decimals = EXCLUDED.decimals,
                name = EXCLUDED.name,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(metadata.address.as_bytes().as_slice())
        .bind(&metadata.symbol)
        .bind(i16::from(metadata.decimals))
        .bind(&metadata.name)
        .bind(metadata.updated_at)
        .execute(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        Ok(())
    }

    async fn load_all_metadata(&self) -> Result<Vec<TokenMetadata>> {
        let rows = sqlx::query_as::<_, MetadataRow>(
            "SELECT address, symbol, decimals, name, updated_at FROM token_metadata",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        rows.into_iter()
            .map(|r| TokenMetadata::try_from(r).map_err(Into::into))
            .collect()
    }
}
