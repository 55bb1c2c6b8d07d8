//! Storage and database utilities for `BeaconIndexer`.
//!
//! This module owns the schema (slot tables, content blobs and the two range
//! queues) and the lease protocol that lets several indexer processes share
//! the queues without double-processing a range.

pub mod memory;

pub use memory::InMemoryStorage;

use crate::types::{
    BeaconStateRecord, GapQueue, GapRange, NewKnownGap, ReorgOutcome, SignedBlockRecord,
    SlotRecord, SlotStatus, SlotWriteModel,
};
use crate::utils::error::{BeaconIndexerError, Result};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::time::Duration;

/// Abstract interface for storage operations.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Creates tables and indexes if they do not exist.
    async fn initialize(&self) -> Result<()>;

    /// Persists one processed slot: the slot row, and for proposed slots the
    /// two content blobs plus the block and state rows. All-or-nothing.
    async fn write_slot(&self, model: &SlotWriteModel) -> Result<()>;

    /// Marks every row of `slot` whose root differs from `canonical_root` as
    /// forked and the matching row as proposed, in one transaction.
    async fn reconcile_slot(&self, slot: u64, canonical_root: &str) -> Result<ReorgOutcome>;

    /// All rows stored for `slot`.
    async fn get_slots(&self, slot: u64) -> Result<Vec<SlotRecord>>;

    async fn get_signed_block(&self, slot: u64, block_root: &str)
    -> Result<Option<SignedBlockRecord>>;

    async fn get_beacon_state(&self, slot: u64, state_root: &str)
    -> Result<Option<BeaconStateRecord>>;

    /// Raw payload stored under a content key.
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Highest slot with any row, `None` on an empty database.
    async fn highest_slot(&self) -> Result<Option<u64>>;

    /// Adds a range to the historic queue. Duplicate ranges are ignored.
    async fn insert_historic(&self, start_slot: u64, end_slot: u64, priority: i64) -> Result<()>;

    /// Adds a range to the known-gaps queue. Duplicate ranges are ignored.
    async fn insert_known_gap(&self, gap: &NewKnownGap) -> Result<()>;

    async fn find_known_gap(&self, start_slot: u64, end_slot: u64) -> Result<Option<GapRange>>;

    /// Overwrites `reprocessing_error` of an existing known gap. Returns rows updated.
    async fn update_reprocessing_error(
        &self,
        start_slot: u64,
        end_slot: u64,
        error: &str,
    ) -> Result<u64>;

    /// Atomically claims the next available range of `queue` for `worker_id`.
    ///
    /// A range is available when it is not checked out, or when `lease_ttl` is
    /// set and its lease is older than that. Known gaps are claimed oldest
    /// first and reversed rows are never handed out; historic ranges are
    /// claimed in ascending priority.
    async fn lease_range(
        &self,
        queue: GapQueue,
        worker_id: &str,
        lease_ttl: Option<Duration>,
    ) -> Result<Option<GapRange>>;

    /// Removes a completed range. Returns rows deleted.
    async fn delete_range(&self, queue: GapQueue, id: i64) -> Result<u64>;

    /// Clears every lease held by `worker_id` on `queue`. Returns rows released.
    async fn release_ranges(&self, queue: GapQueue, worker_id: &str) -> Result<u64>;

    /// Every row of `queue`, ordered by id.
    async fn list_ranges(&self, queue: GapQueue) -> Result<Vec<GapRange>>;
}

/// `PostgreSQL` storage for the indexer.
///
/// # Example
///
/// ```no_run
/// use beacon_indexer::{Storage, StorageBackend};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = Storage::new("postgresql://localhost/beacon").await?;
/// storage.initialize().await?;
/// # Ok(())
/// # }
/// ```
pub struct Storage {
    /// `PostgreSQL` connection pool
    pool: PgPool,
}

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS slots (
        epoch BIGINT NOT NULL,
        slot BIGINT NOT NULL,
        block_root TEXT NOT NULL,
        state_root TEXT NOT NULL,
        status TEXT NOT NULL,
        PRIMARY KEY (slot, block_root)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS blocks (
        key TEXT PRIMARY KEY,
        data BYTEA NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS signed_beacon_block (
        slot BIGINT NOT NULL,
        block_root TEXT NOT NULL,
        parent_block_root TEXT NOT NULL,
        eth1_block_hash TEXT NOT NULL,
        content_key TEXT NOT NULL,
        PRIMARY KEY (slot, block_root)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS beacon_state (
        slot BIGINT NOT NULL,
        state_root TEXT NOT NULL,
        content_key TEXT NOT NULL,
        PRIMARY KEY (slot, state_root)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS historic_process (
        id BIGSERIAL PRIMARY KEY,
        start_slot BIGINT NOT NULL,
        end_slot BIGINT NOT NULL,
        priority BIGINT NOT NULL DEFAULT 10,
        checked_out BOOLEAN NOT NULL DEFAULT FALSE,
        checked_out_by TEXT,
        checked_out_at TIMESTAMPTZ,
        UNIQUE (start_slot, end_slot)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS known_gaps (
        id BIGSERIAL PRIMARY KEY,
        start_slot BIGINT NOT NULL,
        end_slot BIGINT NOT NULL,
        checked_out BOOLEAN NOT NULL DEFAULT FALSE,
        checked_out_by TEXT,
        checked_out_at TIMESTAMPTZ,
        entry_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        entry_error TEXT,
        entry_process TEXT,
        reprocessing_error TEXT,
        UNIQUE (start_slot, end_slot)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_slots_status ON slots(slot, status)",
    "CREATE INDEX IF NOT EXISTS idx_historic_priority ON historic_process(priority, id)",
];

const HISTORIC_COLUMNS: &str = "id, start_slot, end_slot, checked_out, checked_out_by, \
     checked_out_at, priority, NULL::TEXT AS entry_error, NULL::TEXT AS entry_process, \
     NULL::TEXT AS reprocessing_error";

const KNOWN_GAP_COLUMNS: &str = "id, start_slot, end_slot, checked_out, checked_out_by, \
     checked_out_at, NULL::BIGINT AS priority, entry_error, entry_process, reprocessing_error";

fn columns(queue: GapQueue) -> &'static str {
    match queue {
        GapQueue::Historic => HISTORIC_COLUMNS,
        GapQueue::KnownGaps => KNOWN_GAP_COLUMNS,
    }
}

fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        BeaconIndexerError::InternalError(format!("slot {value} exceeds database range"))
    })
}

fn from_db(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        BeaconIndexerError::InternalError(format!("negative slot {value} in database"))
    })
}

fn gap_from_row(row: &PgRow) -> Result<GapRange> {
    Ok(GapRange {
        id: row.try_get("id")?,
        start_slot: from_db(row.try_get("start_slot")?)?,
        end_slot: from_db(row.try_get("end_slot")?)?,
        checked_out: row.try_get("checked_out")?,
        checked_out_by: row.try_get("checked_out_by")?,
        checked_out_at: row.try_get("checked_out_at")?,
        priority: row.try_get("priority")?,
        entry_error: row.try_get("entry_error")?,
        entry_process: row.try_get("entry_process")?,
        reprocessing_error: row.try_get("reprocessing_error")?,
    })
}

fn slot_from_row(row: &PgRow) -> Result<SlotRecord> {
    let status: String = row.try_get("status")?;
    Ok(SlotRecord {
        epoch: from_db(row.try_get("epoch")?)?,
        slot: from_db(row.try_get("slot")?)?,
        block_root: row.try_get("block_root")?,
        state_root: row.try_get("state_root")?,
        status: status.parse()?,
    })
}

impl Storage {
    /// Creates a new storage instance with a connection pool.
    ///
    /// # Errors
    ///
    /// Returns `BeaconIndexerError::DatabaseError` if connection fails.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Closes the database connection pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageBackend for Storage {
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn write_slot(&self, model: &SlotWriteModel) -> Result<()> {
        let slot = to_db(model.slot)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO slots (epoch, slot, block_root, state_root, status) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (slot, block_root) DO NOTHING",
        )
        .bind(to_db(model.epoch)?)
        .bind(slot)
        .bind(&model.block_root)
        .bind(&model.state_root)
        .bind(model.status.as_str())
        .execute(&mut *tx)
        .await?;

        if model.status != SlotStatus::Skipped {
            for (key, data) in [
                (&model.block_content_key, &model.block_ssz),
                (&model.state_content_key, &model.state_ssz),
            ] {
                sqlx::query(
                    "INSERT INTO blocks (key, data) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
                )
                .bind(key)
                .bind(data.as_ref())
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                "INSERT INTO signed_beacon_block \
                 (slot, block_root, parent_block_root, eth1_block_hash, content_key) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (slot, block_root) DO NOTHING",
            )
            .bind(slot)
            .bind(&model.block_root)
            .bind(&model.parent_block_root)
            .bind(&model.eth1_block_hash)
            .bind(&model.block_content_key)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO beacon_state (slot, state_root, content_key) \
                 VALUES ($1, $2, $3) ON CONFLICT (slot, state_root) DO NOTHING",
            )
            .bind(slot)
            .bind(&model.state_root)
            .bind(&model.state_content_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reconcile_slot(&self, slot: u64, canonical_root: &str) -> Result<ReorgOutcome> {
        let slot = to_db(slot)?;
        let mut tx = self.pool.begin().await?;

        let forked = sqlx::query(
            "UPDATE slots SET status = 'forked' WHERE slot = $1 AND block_root <> $2",
        )
        .bind(slot)
        .bind(canonical_root)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let proposed = sqlx::query(
            "UPDATE slots SET status = 'proposed' WHERE slot = $1 AND block_root = $2",
        )
        .bind(slot)
        .bind(canonical_root)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let proposed_total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM slots WHERE slot = $1 AND status = 'proposed'",
        )
        .bind(slot)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ReorgOutcome {
            forked,
            proposed,
            proposed_total: from_db(proposed_total)?,
        })
    }

    async fn get_slots(&self, slot: u64) -> Result<Vec<SlotRecord>> {
        let rows = sqlx::query(
            "SELECT epoch, slot, block_root, state_root, status FROM slots \
             WHERE slot = $1 ORDER BY block_root",
        )
        .bind(to_db(slot)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(slot_from_row).collect()
    }

    async fn get_signed_block(
        &self,
        slot: u64,
        block_root: &str,
    ) -> Result<Option<SignedBlockRecord>> {
        let row = sqlx::query(
            "SELECT slot, block_root, parent_block_root, eth1_block_hash, content_key \
             FROM signed_beacon_block WHERE slot = $1 AND block_root = $2",
        )
        .bind(to_db(slot)?)
        .bind(block_root)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SignedBlockRecord {
                slot: from_db(row.try_get("slot")?)?,
                block_root: row.try_get("block_root")?,
                parent_block_root: row.try_get("parent_block_root")?,
                eth1_block_hash: row.try_get("eth1_block_hash")?,
                content_key: row.try_get("content_key")?,
            })
        })
        .transpose()
    }

    async fn get_beacon_state(
        &self,
        slot: u64,
        state_root: &str,
    ) -> Result<Option<BeaconStateRecord>> {
        let row = sqlx::query(
            "SELECT slot, state_root, content_key FROM beacon_state \
             WHERE slot = $1 AND state_root = $2",
        )
        .bind(to_db(slot)?)
        .bind(state_root)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(BeaconStateRecord {
                slot: from_db(row.try_get("slot")?)?,
                state_root: row.try_get("state_root")?,
                content_key: row.try_get("content_key")?,
            })
        })
        .transpose()
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = sqlx::query_scalar::<_, Vec<u8>>("SELECT data FROM blocks WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(data)
    }

    async fn highest_slot(&self) -> Result<Option<u64>> {
        let result = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(slot) FROM slots")
            .fetch_one(&self.pool)
            .await?;

        result.map(from_db).transpose()
    }

    async fn insert_historic(&self, start_slot: u64, end_slot: u64, priority: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO historic_process (start_slot, end_slot, priority) VALUES ($1, $2, $3) \
             ON CONFLICT (start_slot, end_slot) DO NOTHING",
        )
        .bind(to_db(start_slot)?)
        .bind(to_db(end_slot)?)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_known_gap(&self, gap: &NewKnownGap) -> Result<()> {
        sqlx::query(
            "INSERT INTO known_gaps (start_slot, end_slot, entry_error, entry_process) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (start_slot, end_slot) DO NOTHING",
        )
        .bind(to_db(gap.start_slot)?)
        .bind(to_db(gap.end_slot)?)
        .bind(&gap.entry_error)
        .bind(&gap.entry_process)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_known_gap(&self, start_slot: u64, end_slot: u64) -> Result<Option<GapRange>> {
        let query = format!(
            "SELECT {KNOWN_GAP_COLUMNS} FROM known_gaps WHERE start_slot = $1 AND end_slot = $2"
        );
        let row = sqlx::query(&query)
            .bind(to_db(start_slot)?)
            .bind(to_db(end_slot)?)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(gap_from_row).transpose()
    }

    async fn update_reprocessing_error(
        &self,
        start_slot: u64,
        end_slot: u64,
        error: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE known_gaps SET reprocessing_error = $3 WHERE start_slot = $1 AND end_slot = $2",
        )
        .bind(to_db(start_slot)?)
        .bind(to_db(end_slot)?)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn lease_range(
        &self,
        queue: GapQueue,
        worker_id: &str,
        lease_ttl: Option<Duration>,
    ) -> Result<Option<GapRange>> {
        let (filter, order) = match queue {
            GapQueue::Historic => ("", "priority ASC, id ASC"),
            GapQueue::KnownGaps => (" AND start_slot <= end_slot", "id ASC"),
        };
        let table = queue.table();
        let select = format!(
            "SELECT id FROM {table} \
             WHERE (checked_out = FALSE \
                OR ($1::FLOAT8 IS NOT NULL AND checked_out_at < NOW() - make_interval(secs => $1::FLOAT8))){filter} \
             ORDER BY {order} LIMIT 1 FOR UPDATE SKIP LOCKED"
        );
        let claim = format!(
            "UPDATE {table} SET checked_out = TRUE, checked_out_by = $2, checked_out_at = NOW() \
             WHERE id = $1 RETURNING {}",
            columns(queue)
        );

        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar::<_, i64>(&select)
            .bind(lease_ttl.map(|ttl| ttl.as_secs_f64()))
            .fetch_optional(&mut *tx)
            .await?;

        let Some(id) = id else {
            tx.commit().await?;
            return Ok(None);
        };

        let row = sqlx::query(&claim)
            .bind(id)
            .bind(worker_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        gap_from_row(&row).map(Some)
    }

    async fn delete_range(&self, queue: GapQueue, id: i64) -> Result<u64> {
        let query = format!("DELETE FROM {} WHERE id = $1", queue.table());
        let result = sqlx::query(&query).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn release_ranges(&self, queue: GapQueue, worker_id: &str) -> Result<u64> {
        let query = format!(
            "UPDATE {} SET checked_out = FALSE, checked_out_by = NULL, checked_out_at = NULL \
             WHERE checked_out_by = $1",
            queue.table()
        );
        let result = sqlx::query(&query)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_ranges(&self, queue: GapQueue) -> Result<Vec<GapRange>> {
        let query = format!(
            "SELECT {} FROM {} ORDER BY id",
            columns(queue),
            queue.table()
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(gap_from_row).collect()
    }
}
