//! SQLite storage backend for RegistrySync.
//!
//! Persists projects, event idempotency keys, ratings, fundings, aggregates
//! and stream checkpoints in a single SQLite file. Uses `sqlx` with WAL mode
//! for concurrent read performance.
//!
//! Every idempotency guard is a database constraint or a conditional write,
//! so concurrent writers (the index loop and an API process) cannot violate
//! them:
//! - `chain_events` primary key `(chain_id, tx_hash, log_index)`
//! - `projects.on_chain_project_id` unique
//! - `ratings` keyed by `(project, rater)`, replaced only by a later log
//! - `fundings` unique on `(tx_hash, log_index)`
//!
//! # Usage
//! ```rust,no_run
//! use registrysync_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./registry.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use registrysync_core::checkpoint::{Checkpoint, CheckpointStore};
use registrysync_core::error::SyncError;
use registrysync_core::store::{
    check_transition, EventStore, FundingStore, ProjectStore, RatingStore,
};
use registrysync_core::types::{
    normalize_address, ApplyState, ChainEvent, EventKey, Funding, FundingAggregate, Project,
    ProjectStatus, Rating, RatingAggregate,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id                   TEXT    PRIMARY KEY,
        owner                TEXT    NOT NULL,
        status               TEXT    NOT NULL,
        on_chain_project_id  INTEGER UNIQUE,
        certificate_token_id INTEGER,
        certificate_contract TEXT,
        metadata_uri         TEXT,
        created_at           INTEGER NOT NULL,
        updated_at           INTEGER NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects (owner, status);",
    "CREATE TABLE IF NOT EXISTS chain_events (
        chain_id            INTEGER NOT NULL,
        tx_hash             TEXT    NOT NULL,
        log_index           INTEGER NOT NULL,
        address             TEXT    NOT NULL,
        event_name          TEXT    NOT NULL,
        on_chain_project_id INTEGER,
        payload             TEXT    NOT NULL,
        block_number        INTEGER NOT NULL,
        block_timestamp     INTEGER NOT NULL,
        state               TEXT    NOT NULL,
        PRIMARY KEY (chain_id, tx_hash, log_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_chain_events_state ON chain_events (chain_id, state);",
    "CREATE INDEX IF NOT EXISTS idx_chain_events_stream
        ON chain_events (chain_id, address, event_name, block_number);",
    "CREATE TABLE IF NOT EXISTS ratings (
        on_chain_project_id INTEGER NOT NULL,
        rater               TEXT    NOT NULL,
        stars               INTEGER NOT NULL,
        block_number        INTEGER NOT NULL,
        log_index           INTEGER NOT NULL,
        PRIMARY KEY (on_chain_project_id, rater)
    );",
    "CREATE TABLE IF NOT EXISTS rating_aggregates (
        on_chain_project_id INTEGER PRIMARY KEY,
        average             REAL    NOT NULL,
        count               INTEGER NOT NULL,
        updated_at          INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS fundings (
        on_chain_project_id INTEGER NOT NULL,
        funder              TEXT    NOT NULL,
        amount              TEXT    NOT NULL,
        tx_hash             TEXT    NOT NULL,
        log_index           INTEGER NOT NULL,
        block_number        INTEGER NOT NULL,
        UNIQUE (tx_hash, log_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_fundings_project ON fundings (on_chain_project_id);",
    "CREATE TABLE IF NOT EXISTS funding_aggregates (
        on_chain_project_id INTEGER PRIMARY KEY,
        total_base_units    TEXT    NOT NULL,
        total               REAL    NOT NULL,
        count               INTEGER NOT NULL,
        updated_at          INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        chain_id     INTEGER NOT NULL,
        stream_id    TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL,
        PRIMARY KEY (chain_id, stream_id)
    );",
];

fn storage(e: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(e.to_string())
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, SyncError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| storage(format!("timestamp out of range: {micros}")))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

/// SQLite-backed implementation of every store trait.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./registry.db"`) or a full
    /// SQLite URL (`"sqlite:./registry.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Single connection: every pooled connection to `:memory:` would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }

    async fn certificate_of(&self, id: Uuid) -> Result<Option<Option<i64>>, SyncError> {
        let row = sqlx::query("SELECT certificate_token_id FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|r| r.get::<Option<i64>, _>("certificate_token_id")))
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, owner, status, on_chain_project_id, certificate_token_id,
     certificate_contract, metadata_uri, created_at, updated_at";

fn project_from_row(row: &SqliteRow) -> Result<Project, SyncError> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    Ok(Project {
        id: Uuid::parse_str(&id).map_err(storage)?,
        owner: row.get("owner"),
        status: status.parse::<ProjectStatus>().map_err(storage)?,
        on_chain_project_id: row
            .get::<Option<i64>, _>("on_chain_project_id")
            .map(|v| v as u64),
        certificate_token_id: row
            .get::<Option<i64>, _>("certificate_token_id")
            .map(|v| v as u64),
        certificate_contract: row.get("certificate_contract"),
        metadata_uri: row.get("metadata_uri"),
        created_at: from_micros(row.get("created_at"))?,
        updated_at: from_micros(row.get("updated_at"))?,
    })
}

const EVENT_COLUMNS: &str = "chain_id, tx_hash, log_index, address, event_name,
     on_chain_project_id, payload, block_number, block_timestamp";

fn event_from_row(row: &SqliteRow) -> Result<ChainEvent, SyncError> {
    let payload: String = row.get("payload");
    Ok(ChainEvent {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        tx_hash: row.get("tx_hash"),
        log_index: row.get::<i64, _>("log_index") as u32,
        address: row.get("address"),
        event_name: row.get("event_name"),
        on_chain_project_id: row
            .get::<Option<i64>, _>("on_chain_project_id")
            .map(|v| v as u64),
        payload: serde_json::from_str(&payload).map_err(storage)?,
        block_number: row.get::<i64, _>("block_number") as u64,
        block_timestamp: row.get("block_timestamp"),
    })
}

fn parse_amount(raw: &str) -> Result<u128, SyncError> {
    raw.parse::<u128>()
        .map_err(|e| storage(format!("bad amount '{raw}': {e}")))
}

// ─── EventStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl EventStore for SqliteStorage {
    async fn event_state(&self, key: &EventKey) -> Result<Option<ApplyState>, SyncError> {
        let row = sqlx::query(
            "SELECT state FROM chain_events
             WHERE chain_id = ? AND tx_hash = ? AND log_index = ?",
        )
        .bind(key.chain_id as i64)
        .bind(&key.tx_hash)
        .bind(key.log_index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|r| r.get::<String, _>("state").parse::<ApplyState>().map_err(storage))
            .transpose()
    }

    async fn insert_observed(&self, event: &ChainEvent) -> Result<bool, SyncError> {
        let payload = serde_json::to_string(&event.payload).map_err(storage)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO chain_events
             (chain_id, tx_hash, log_index, address, event_name, on_chain_project_id,
              payload, block_number, block_timestamp, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.chain_id as i64)
        .bind(&event.tx_hash)
        .bind(event.log_index as i64)
        .bind(normalize_address(&event.address))
        .bind(&event.event_name)
        .bind(event.on_chain_project_id.map(|v| v as i64))
        .bind(&payload)
        .bind(event.block_number as i64)
        .bind(event.block_timestamp)
        .bind(ApplyState::Observed.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_applied(&self, key: &EventKey) -> Result<(), SyncError> {
        let result = sqlx::query(
            "UPDATE chain_events SET state = ?
             WHERE chain_id = ? AND tx_hash = ? AND log_index = ?",
        )
        .bind(ApplyState::Applied.as_str())
        .bind(key.chain_id as i64)
        .bind(&key.tx_hash)
        .bind(key.log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("event {key}")));
        }
        debug!(event = %key, "event applied");
        Ok(())
    }

    async fn pending_events(&self, chain_id: u64) -> Result<Vec<ChainEvent>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM chain_events
             WHERE chain_id = ? AND state = ?
             ORDER BY block_number, log_index, tx_hash"
        ))
        .bind(chain_id as i64)
        .bind(ApplyState::Observed.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn max_event_block(
        &self,
        chain_id: u64,
        address: &str,
        event_name: &str,
    ) -> Result<Option<u64>, SyncError> {
        let row = sqlx::query(
            "SELECT MAX(block_number) AS max_block FROM chain_events
             WHERE chain_id = ? AND address = ? AND event_name = ?",
        )
        .bind(chain_id as i64)
        .bind(normalize_address(address))
        .bind(event_name)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.get::<Option<i64>, _>("max_block").map(|v| v as u64))
    }

    async fn event_count(&self, chain_id: u64) -> Result<u64, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM chain_events WHERE chain_id = ?")
            .bind(chain_id as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── ProjectStore impl ───────────────────────────────────────────────────────

#[async_trait]
impl ProjectStore for SqliteStorage {
    async fn insert_project(&self, project: &Project) -> Result<(), SyncError> {
        sqlx::query(&format!(
            "INSERT INTO projects ({PROJECT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(project.id.to_string())
        .bind(normalize_address(&project.owner))
        .bind(project.status.as_str())
        .bind(project.on_chain_project_id.map(|v| v as i64))
        .bind(project.certificate_token_id.map(|v| v as i64))
        .bind(project.certificate_contract.as_deref().map(normalize_address))
        .bind(project.metadata_uri.as_deref())
        .bind(project.created_at.timestamp_micros())
        .bind(project.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn project(&self, id: Uuid) -> Result<Option<Project>, SyncError> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn project_by_on_chain_id(&self, on_chain_id: u64) -> Result<Option<Project>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE on_chain_project_id = ?"
        ))
        .bind(on_chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn bind_candidate(&self, owner: &str) -> Result<Option<Project>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects
             WHERE owner = ? AND status IN (?, ?) AND on_chain_project_id IS NULL
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1"
        ))
        .bind(normalize_address(owner))
        .bind(ProjectStatus::Submitted.as_str())
        .bind(ProjectStatus::Approved.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn bind_on_chain_id(
        &self,
        id: Uuid,
        on_chain_id: u64,
        metadata_uri: Option<&str>,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            "UPDATE projects
             SET on_chain_project_id = ?,
                 metadata_uri = COALESCE(?, metadata_uri),
                 updated_at = ?
             WHERE id = ? AND on_chain_project_id IS NULL",
        )
        .bind(on_chain_id as i64)
        .bind(metadata_uri)
        .bind(Utc::now().timestamp_micros())
        .bind(id.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                debug!(project = %id, on_chain_id, bound = done.rows_affected() == 1, "bind attempted");
                Ok(done.rows_affected() == 1)
            }
            // Another project already holds this on-chain id.
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(storage(e)),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: ProjectStatus,
        next: ProjectStatus,
    ) -> Result<bool, SyncError> {
        check_transition(expected, next)?;
        let result = sqlx::query(
            "UPDATE projects SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(Utc::now().timestamp_micros())
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_certificate(
        &self,
        id: Uuid,
        token_id: u64,
        contract: &str,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            "UPDATE projects
             SET certificate_token_id = ?, certificate_contract = ?, updated_at = ?
             WHERE id = ? AND certificate_token_id IS NULL",
        )
        .bind(token_id as i64)
        .bind(normalize_address(contract))
        .bind(Utc::now().timestamp_micros())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.certificate_of(id).await? {
            None => Err(SyncError::NotFound(format!("project {id}"))),
            Some(existing) => Ok(existing == Some(token_id as i64)),
        }
    }
}

// ─── RatingStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl RatingStore for SqliteStorage {
    async fn upsert_rating(&self, rating: &Rating) -> Result<bool, SyncError> {
        let result = sqlx::query(
            "INSERT INTO ratings (on_chain_project_id, rater, stars, block_number, log_index)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (on_chain_project_id, rater) DO UPDATE SET
                 stars = excluded.stars,
                 block_number = excluded.block_number,
                 log_index = excluded.log_index
             WHERE excluded.block_number > ratings.block_number
                OR (excluded.block_number = ratings.block_number
                    AND excluded.log_index > ratings.log_index)",
        )
        .bind(rating.on_chain_project_id as i64)
        .bind(normalize_address(&rating.rater))
        .bind(i64::from(rating.stars))
        .bind(rating.block_number as i64)
        .bind(rating.log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn ratings_for(&self, on_chain_id: u64) -> Result<Vec<Rating>, SyncError> {
        let rows = sqlx::query(
            "SELECT on_chain_project_id, rater, stars, block_number, log_index
             FROM ratings WHERE on_chain_project_id = ? ORDER BY rater",
        )
        .bind(on_chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .iter()
            .map(|r| Rating {
                on_chain_project_id: r.get::<i64, _>("on_chain_project_id") as u64,
                rater: r.get("rater"),
                stars: r.get::<i64, _>("stars") as u8,
                block_number: r.get::<i64, _>("block_number") as u64,
                log_index: r.get::<i64, _>("log_index") as u32,
            })
            .collect())
    }

    async fn upsert_rating_aggregate(&self, aggregate: &RatingAggregate) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO rating_aggregates
             (on_chain_project_id, average, count, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(aggregate.on_chain_project_id as i64)
        .bind(aggregate.average)
        .bind(aggregate.count as i64)
        .bind(aggregate.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn rating_aggregate(
        &self,
        on_chain_id: u64,
    ) -> Result<Option<RatingAggregate>, SyncError> {
        let row = sqlx::query(
            "SELECT on_chain_project_id, average, count, updated_at
             FROM rating_aggregates WHERE on_chain_project_id = ?",
        )
        .bind(on_chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|r| {
            Ok(RatingAggregate {
                on_chain_project_id: r.get::<i64, _>("on_chain_project_id") as u64,
                average: r.get("average"),
                count: r.get::<i64, _>("count") as u64,
                updated_at: from_micros(r.get("updated_at"))?,
            })
        })
        .transpose()
    }
}

// ─── FundingStore impl ───────────────────────────────────────────────────────

#[async_trait]
impl FundingStore for SqliteStorage {
    async fn insert_funding(&self, funding: &Funding) -> Result<bool, SyncError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO fundings
             (on_chain_project_id, funder, amount, tx_hash, log_index, block_number)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(funding.on_chain_project_id as i64)
        .bind(normalize_address(&funding.funder))
        .bind(funding.amount.to_string())
        .bind(&funding.tx_hash)
        .bind(funding.log_index as i64)
        .bind(funding.block_number as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fundings_for(&self, on_chain_id: u64) -> Result<Vec<Funding>, SyncError> {
        let rows = sqlx::query(
            "SELECT on_chain_project_id, funder, amount, tx_hash, log_index, block_number
             FROM fundings WHERE on_chain_project_id = ? ORDER BY rowid",
        )
        .bind(on_chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|r| {
                Ok(Funding {
                    on_chain_project_id: r.get::<i64, _>("on_chain_project_id") as u64,
                    funder: r.get("funder"),
                    amount: parse_amount(r.get("amount"))?,
                    tx_hash: r.get("tx_hash"),
                    log_index: r.get::<i64, _>("log_index") as u32,
                    block_number: r.get::<i64, _>("block_number") as u64,
                })
            })
            .collect()
    }

    async fn upsert_funding_aggregate(
        &self,
        aggregate: &FundingAggregate,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO funding_aggregates
             (on_chain_project_id, total_base_units, total, count, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(aggregate.on_chain_project_id as i64)
        .bind(aggregate.total_base_units.to_string())
        .bind(aggregate.total)
        .bind(aggregate.count as i64)
        .bind(aggregate.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn funding_aggregate(
        &self,
        on_chain_id: u64,
    ) -> Result<Option<FundingAggregate>, SyncError> {
        let row = sqlx::query(
            "SELECT on_chain_project_id, total_base_units, total, count, updated_at
             FROM funding_aggregates WHERE on_chain_project_id = ?",
        )
        .bind(on_chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|r| {
            Ok(FundingAggregate {
                on_chain_project_id: r.get::<i64, _>("on_chain_project_id") as u64,
                total_base_units: parse_amount(r.get("total_base_units"))?,
                total: r.get("total"),
                count: r.get::<i64, _>("count") as u64,
                updated_at: from_micros(r.get("updated_at"))?,
            })
        })
        .transpose()
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load_checkpoint(
        &self,
        chain_id: u64,
        stream_id: &str,
    ) -> Result<Option<Checkpoint>, SyncError> {
        let row = sqlx::query(
            "SELECT chain_id, stream_id, block_number, updated_at
             FROM checkpoints WHERE chain_id = ? AND stream_id = ?",
        )
        .bind(chain_id as i64)
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.map(|r| Checkpoint {
            chain_id: r.get::<i64, _>("chain_id") as u64,
            stream_id: r.get("stream_id"),
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (chain_id, stream_id, block_number, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(checkpoint.chain_id as i64)
        .bind(&checkpoint.stream_id)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        debug!(
            chain_id = checkpoint.chain_id,
            stream = %checkpoint.stream_id,
            block = checkpoint.block_number,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn list_checkpoints(&self, chain_id: u64) -> Result<Vec<Checkpoint>, SyncError> {
        let rows = sqlx::query(
            "SELECT chain_id, stream_id, block_number, updated_at
             FROM checkpoints WHERE chain_id = ? ORDER BY stream_id",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .iter()
            .map(|r| Checkpoint {
                chain_id: r.get::<i64, _>("chain_id") as u64,
                stream_id: r.get("stream_id"),
                block_number: r.get::<i64, _>("block_number") as u64,
                updated_at: r.get("updated_at"),
            })
            .collect())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const OWNER: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn sample_event(tx: &str, log_index: u32, block: u64) -> ChainEvent {
        ChainEvent {
            chain_id: 1,
            tx_hash: tx.into(),
            log_index,
            address: "0xRegistry".into(),
            event_name: "Rated".into(),
            on_chain_project_id: Some(7),
            payload: serde_json::json!({"projectId": "7", "stars": "4"}),
            block_number: block,
            block_timestamp: 1_700_000_000,
        }
    }

    fn rating(rater: &str, stars: u8, block: u64, log_index: u32) -> Rating {
        Rating {
            on_chain_project_id: 7,
            rater: rater.into(),
            stars,
            block_number: block,
            log_index,
        }
    }

    // ── EventStore ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn observed_then_applied() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let ev = sample_event("0xaa", 0, 100);

        assert!(store.insert_observed(&ev).await.unwrap());
        assert!(!store.insert_observed(&ev).await.unwrap());
        assert_eq!(
            store.event_state(&ev.key()).await.unwrap(),
            Some(ApplyState::Observed)
        );

        let pending = store.pending_events(1).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["stars"], "4");
        assert_eq!(pending[0].address, "0xregistry");

        store.mark_applied(&ev.key()).await.unwrap();
        assert_eq!(
            store.event_state(&ev.key()).await.unwrap(),
            Some(ApplyState::Applied)
        );
        assert!(store.pending_events(1).await.unwrap().is_empty());
        assert_eq!(store.event_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_events_in_log_order() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_observed(&sample_event("0xc", 0, 102)).await.unwrap();
        store.insert_observed(&sample_event("0xb", 3, 101)).await.unwrap();
        store.insert_observed(&sample_event("0xa", 1, 101)).await.unwrap();

        let order: Vec<(u64, u32)> = store
            .pending_events(1)
            .await
            .unwrap()
            .iter()
            .map(|e| (e.block_number, e.log_index))
            .collect();
        assert_eq!(order, vec![(101, 1), (101, 3), (102, 0)]);
    }

    #[tokio::test]
    async fn max_event_block_per_stream() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert_eq!(store.max_event_block(1, "0xregistry", "Rated").await.unwrap(), None);

        store.insert_observed(&sample_event("0xa", 0, 50)).await.unwrap();
        store.insert_observed(&sample_event("0xb", 0, 90)).await.unwrap();
        assert_eq!(
            store.max_event_block(1, "0xREGISTRY", "Rated").await.unwrap(),
            Some(90)
        );
        assert_eq!(store.max_event_block(1, "0xregistry", "Funded").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mark_applied_unknown_event_is_not_found() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let err = store
            .mark_applied(&sample_event("0xdead", 0, 1).key())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    // ── ProjectStore ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn project_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let project = Project::new(OWNER, ProjectStatus::Submitted).with_metadata_uri("ipfs://x");
        store.insert_project(&project).await.unwrap();

        let loaded = store.project(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.owner, OWNER.to_ascii_lowercase());
        assert_eq!(loaded.status, ProjectStatus::Submitted);
        assert_eq!(loaded.metadata_uri.as_deref(), Some("ipfs://x"));
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            project.created_at.timestamp_micros()
        );
        assert!(store.project(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bind_candidate_prefers_most_recent_bindable() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut older = Project::new(OWNER, ProjectStatus::Submitted);
        older.created_at -= Duration::hours(1);
        let newer = Project::new(OWNER, ProjectStatus::Submitted);
        let draft = Project::new(OWNER, ProjectStatus::Draft);
        for p in [&older, &newer, &draft] {
            store.insert_project(p).await.unwrap();
        }

        let candidate = store.bind_candidate(OWNER).await.unwrap().unwrap();
        assert_eq!(candidate.id, newer.id);

        assert!(store.bind_on_chain_id(newer.id, 42, None).await.unwrap());
        let candidate = store.bind_candidate(OWNER).await.unwrap().unwrap();
        assert_eq!(candidate.id, older.id);
    }

    #[tokio::test]
    async fn on_chain_id_binds_once() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let a = Project::new(OWNER, ProjectStatus::Submitted);
        let b = Project::new(OWNER, ProjectStatus::Submitted);
        store.insert_project(&a).await.unwrap();
        store.insert_project(&b).await.unwrap();

        assert!(store.bind_on_chain_id(a.id, 42, Some("ipfs://a")).await.unwrap());
        // same project again, and another project onto the same id
        assert!(!store.bind_on_chain_id(a.id, 43, None).await.unwrap());
        assert!(!store.bind_on_chain_id(b.id, 42, None).await.unwrap());

        let bound = store.project_by_on_chain_id(42).await.unwrap().unwrap();
        assert_eq!(bound.id, a.id);
        assert_eq!(bound.metadata_uri.as_deref(), Some("ipfs://a"));
        assert_eq!(store.project(b.id).await.unwrap().unwrap().on_chain_project_id, None);
    }

    #[tokio::test]
    async fn status_write_is_conditional() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let p = Project::new(OWNER, ProjectStatus::Submitted);
        store.insert_project(&p).await.unwrap();

        assert!(!store
            .update_status(p.id, ProjectStatus::Rejected, ProjectStatus::Approved)
            .await
            .unwrap());
        assert!(store
            .update_status(p.id, ProjectStatus::Submitted, ProjectStatus::Approved)
            .await
            .unwrap());
        assert_eq!(
            store.project(p.id).await.unwrap().unwrap().status,
            ProjectStatus::Approved
        );

        let err = store
            .update_status(p.id, ProjectStatus::Approved, ProjectStatus::Submitted)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStatus { .. }));
        assert_eq!(
            store.project(p.id).await.unwrap().unwrap().status,
            ProjectStatus::Approved
        );
    }

    #[tokio::test]
    async fn certificate_is_recorded_once() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let p = Project::new(OWNER, ProjectStatus::Approved);
        store.insert_project(&p).await.unwrap();

        assert!(store.set_certificate(p.id, 5, "0xCERT").await.unwrap());
        assert!(store.set_certificate(p.id, 5, "0xcert").await.unwrap());
        assert!(!store.set_certificate(p.id, 6, "0xcert").await.unwrap());

        let loaded = store.project(p.id).await.unwrap().unwrap();
        assert_eq!(loaded.certificate_token_id, Some(5));
        assert_eq!(loaded.certificate_contract.as_deref(), Some("0xcert"));

        let err = store.set_certificate(Uuid::new_v4(), 1, "0xcert").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    // ── RatingStore / FundingStore ────────────────────────────────────────────

    #[tokio::test]
    async fn rating_upsert_is_position_guarded() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.upsert_rating(&rating("0xA", 3, 10, 0)).await.unwrap());
        assert!(store.upsert_rating(&rating("0xa", 5, 12, 1)).await.unwrap());
        // older log and exact redelivery are both ignored
        assert!(!store.upsert_rating(&rating("0xa", 1, 11, 0)).await.unwrap());
        assert!(!store.upsert_rating(&rating("0xa", 5, 12, 1)).await.unwrap());

        let rows = store.ratings_for(7).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stars, 5);
        assert_eq!(rows[0].rater, "0xa");
    }

    #[tokio::test]
    async fn funding_is_unique_per_log() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let funding = Funding {
            on_chain_project_id: 7,
            funder: "0xF".into(),
            amount: u128::MAX,
            tx_hash: "0xabc".into(),
            log_index: 2,
            block_number: 10,
        };
        assert!(store.insert_funding(&funding).await.unwrap());
        assert!(!store.insert_funding(&funding).await.unwrap());

        let rows = store.fundings_for(7).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, u128::MAX);
    }

    #[tokio::test]
    async fn aggregates_are_replaced() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for (average, count) in [(3.0, 1), (4.0, 3)] {
            store
                .upsert_rating_aggregate(&RatingAggregate {
                    on_chain_project_id: 7,
                    average,
                    count,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let agg = store.rating_aggregate(7).await.unwrap().unwrap();
        assert_eq!(agg.count, 3);
        assert!((agg.average - 4.0).abs() < f64::EPSILON);

        store
            .upsert_funding_aggregate(&FundingAggregate {
                on_chain_project_id: 7,
                total_base_units: 1_500_000,
                total: 1.5,
                count: 2,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let agg = store.funding_aggregate(7).await.unwrap().unwrap();
        assert_eq!(agg.total_base_units, 1_500_000);
        assert!(store.funding_aggregate(8).await.unwrap().is_none());
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_upsert_and_list() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .save_checkpoint(Checkpoint::now(1, "0xreg:Rated", 100))
            .await
            .unwrap();
        store
            .save_checkpoint(Checkpoint::now(1, "0xreg:Rated", 200))
            .await
            .unwrap();
        store
            .save_checkpoint(Checkpoint::now(1, "0xreg:Funded", 150))
            .await
            .unwrap();
        store
            .save_checkpoint(Checkpoint::now(2, "0xreg:Rated", 9))
            .await
            .unwrap();

        let loaded = store.load_checkpoint(1, "0xreg:Rated").await.unwrap().unwrap();
        assert_eq!(loaded.block_number, 200);
        assert!(store.load_checkpoint(1, "0xreg:Unknown").await.unwrap().is_none());

        let ids: Vec<String> = store
            .list_checkpoints(1)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.stream_id)
            .collect();
        assert_eq!(ids, vec!["0xreg:Funded", "0xreg:Rated"]);
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let path = std::env::temp_dir().join(format!("registrysync-{}.db", Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();
        {
            let store = SqliteStorage::open(&path).await.unwrap();
            store
                .save_checkpoint(Checkpoint::now(1, "0xreg:Rated", 77))
                .await
                .unwrap();
        }
        let reopened = SqliteStorage::open(&path).await.unwrap();
        let cp = reopened.load_checkpoint(1, "0xreg:Rated").await.unwrap().unwrap();
        assert_eq!(cp.block_number, 77);
        let _ = std::fs::remove_file(&path);
    }
}
