//! PostgreSQL store for refresh jobs, transfer watchers, and wallet locks
//!
//! All operations are atomic at the database level. Dequeue uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never hand out the same
//! job twice, and the lock table implements TTL-based advisory locking
//! across processes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;

/// Identifying key material for one wallet
///
/// `xpub_van` is the sharding key; the other two fields co-vary with it and
/// are passed through because the node API requires all three headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletKeys {
    pub xpub_van: String,
    pub xpub_col: String,
    pub master_fingerprint: String,
}

impl WalletKeys {
    /// Truncated form for log lines, e.g. "tpubD...x9rQs"
    pub fn short_id(&self) -> String {
        let x = &self.xpub_van;
        if x.len() <= 10 {
            x.clone()
        } else {
            format!("{}...{}", &x[..5], &x[x.len() - 5..])
        }
    }
}

/// What caused a refresh job to be enqueued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshTrigger {
    /// Operator-requested wallet sync
    Sync,
    /// An outgoing transfer was finalized
    AssetSent,
    /// An invoice was created; the transfer may not yet be bound to an asset
    InvoiceCreated {
        recipient_id: String,
        asset_id: Option<String>,
    },
    Manual,
    /// Re-enqueued at startup for a wallet with active watchers
    Recovery,
    /// A trigger kind this build does not understand (jobs carrying one are
    /// failed permanently, never retried)
    Unknown(String),
}

impl RefreshTrigger {
    pub fn kind(&self) -> &str {
        match self {
            RefreshTrigger::Sync => "sync",
            RefreshTrigger::AssetSent => "asset_sent",
            RefreshTrigger::InvoiceCreated { .. } => "invoice_created",
            RefreshTrigger::Manual => "manual",
            RefreshTrigger::Recovery => "recovery",
            RefreshTrigger::Unknown(kind) => kind,
        }
    }

    fn recipient_id(&self) -> Option<&str> {
        match self {
            RefreshTrigger::InvoiceCreated { recipient_id, .. } => Some(recipient_id),
            _ => None,
        }
    }

    fn asset_id(&self) -> Option<&str> {
        match self {
            RefreshTrigger::InvoiceCreated { asset_id, .. } => asset_id.as_deref(),
            _ => None,
        }
    }

    fn from_columns(
        kind: &str,
        recipient_id: Option<String>,
        asset_id: Option<String>,
    ) -> Self {
        match kind {
            "sync" => RefreshTrigger::Sync,
            "asset_sent" => RefreshTrigger::AssetSent,
            "invoice_created" => match recipient_id {
                Some(recipient_id) => RefreshTrigger::InvoiceCreated {
                    recipient_id,
                    asset_id,
                },
                // invoice_created without a recipient cannot be dispatched
                None => RefreshTrigger::Unknown("invoice_created".to_string()),
            },
            "manual" => RefreshTrigger::Manual,
            "recovery" => RefreshTrigger::Recovery,
            other => RefreshTrigger::Unknown(other.to_string()),
        }
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown job status: {}", s)),
        }
    }
}

/// Watcher lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherStatus {
    Watching,
    Settled,
    Failed,
    Expired,
}

impl WatcherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherStatus::Watching => "watching",
            WatcherStatus::Settled => "settled",
            WatcherStatus::Failed => "failed",
            WatcherStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WatcherStatus::Watching)
    }
}

impl std::str::FromStr for WatcherStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watching" => Ok(WatcherStatus::Watching),
            "settled" => Ok(WatcherStatus::Settled),
            "failed" => Ok(WatcherStatus::Failed),
            "expired" => Ok(WatcherStatus::Expired),
            _ => Err(anyhow::anyhow!("Unknown watcher status: {}", s)),
        }
    }
}

/// A refresh job
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub wallet: WalletKeys,
    pub trigger: RefreshTrigger,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Result of one job handler invocation, recorded by `complete_job`
///
/// A lock skip completes the job without counting as an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    SkippedLocked,
    Failed(String),
}

/// A transfer watcher row
#[derive(Debug, Clone)]
pub struct Watcher {
    pub wallet: WalletKeys,
    pub recipient_id: String,
    pub asset_id: Option<String>,
    pub status: WatcherStatus,
    pub refresh_count: i32,
    pub last_refresh: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct JobRow {
    id: i64,
    job_id: Uuid,
    xpub_van: String,
    xpub_col: String,
    master_fingerprint: String,
    trigger: String,
    recipient_id: Option<String>,
    asset_id: Option<String>,
    status: String,
    attempts: i32,
    max_retries: i32,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            job_id: self.job_id,
            wallet: WalletKeys {
                xpub_van: self.xpub_van,
                xpub_col: self.xpub_col,
                master_fingerprint: self.master_fingerprint,
            },
            trigger: RefreshTrigger::from_columns(
                &self.trigger,
                self.recipient_id,
                self.asset_id,
            ),
            status: self.status.parse()?,
            attempts: self.attempts,
            max_retries: self.max_retries,
            created_at: self.created_at,
            processed_at: self.processed_at,
            error_message: self.error_message,
        })
    }
}

#[derive(FromRow)]
struct WatcherRow {
    xpub_van: String,
    xpub_col: String,
    master_fingerprint: String,
    recipient_id: String,
    asset_id: Option<String>,
    status: String,
    refresh_count: i32,
    last_refresh: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl WatcherRow {
    fn into_watcher(self) -> Result<Watcher> {
        Ok(Watcher {
            wallet: WalletKeys {
                xpub_van: self.xpub_van,
                xpub_col: self.xpub_col,
                master_fingerprint: self.master_fingerprint,
            },
            recipient_id: self.recipient_id,
            asset_id: self.asset_id,
            status: self.status.parse()?,
            refresh_count: self.refresh_count,
            last_refresh: self.last_refresh,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, job_id, xpub_van, xpub_col, master_fingerprint, trigger, \
     recipient_id, asset_id, status, attempts, max_retries, created_at, processed_at, \
     error_message";

const WATCHER_COLUMNS: &str = "xpub_van, xpub_col, master_fingerprint, recipient_id, asset_id, \
     status, refresh_count, last_refresh, created_at, expires_at";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS refresh_jobs (
    id BIGSERIAL PRIMARY KEY,
    job_id UUID NOT NULL UNIQUE,
    xpub_van TEXT NOT NULL,
    xpub_col TEXT NOT NULL,
    master_fingerprint TEXT NOT NULL,
    trigger TEXT NOT NULL,
    recipient_id TEXT,
    asset_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 10,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processed_at TIMESTAMPTZ,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_refresh_jobs_status ON refresh_jobs(status);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_created_at ON refresh_jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_xpub_van ON refresh_jobs(xpub_van);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_recipient_id ON refresh_jobs(recipient_id);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_asset_id ON refresh_jobs(asset_id);

CREATE TABLE IF NOT EXISTS refresh_watchers (
    id BIGSERIAL PRIMARY KEY,
    xpub_van TEXT NOT NULL,
    xpub_col TEXT NOT NULL,
    master_fingerprint TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    asset_id TEXT,
    status TEXT NOT NULL DEFAULT 'watching'
        CHECK (status IN ('watching', 'settled', 'failed', 'expired')),
    refresh_count INTEGER NOT NULL DEFAULT 0,
    last_refresh TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL,
    UNIQUE (xpub_van, recipient_id)
);

CREATE INDEX IF NOT EXISTS idx_refresh_watchers_status ON refresh_watchers(status);
CREATE INDEX IF NOT EXISTS idx_refresh_watchers_expires_at ON refresh_watchers(expires_at);
CREATE INDEX IF NOT EXISTS idx_refresh_watchers_xpub_van ON refresh_watchers(xpub_van);

CREATE TABLE IF NOT EXISTS wallet_locks (
    xpub_van TEXT PRIMARY KEY,
    locked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wallet_locks_expires_at ON wallet_locks(expires_at);
"#;

/// Store handle, cheap to clone
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to PostgreSQL with the configured pool bounds
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the schema (idempotent)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    // ----- jobs -----

    /// Insert a pending refresh job and return its id
    pub async fn enqueue(
        &self,
        wallet: &WalletKeys,
        trigger: &RefreshTrigger,
        max_retries: u32,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO refresh_jobs (
                job_id, xpub_van, xpub_col, master_fingerprint,
                trigger, recipient_id, asset_id, status, max_retries
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            "#,
        )
        .bind(job_id)
        .bind(&wallet.xpub_van)
        .bind(&wallet.xpub_col)
        .bind(&wallet.master_fingerprint)
        .bind(trigger.kind())
        .bind(trigger.recipient_id())
        .bind(trigger.asset_id())
        .bind(max_retries as i32)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job_id, wallet = %wallet.short_id(), trigger = trigger.kind(), "Enqueued refresh job");
        Ok(job_id)
    }

    /// Dequeue the oldest pending job for a wallet, marking it processing
    ///
    /// Safe against concurrent dequeuers via `FOR UPDATE SKIP LOCKED`.
    pub async fn dequeue_for_wallet(&self, xpub_van: &str) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM refresh_jobs
            WHERE xpub_van = $1 AND status = 'pending'
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#
        ))
        .bind(xpub_van)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE refresh_jobs SET status = 'processing' WHERE id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut job = row.into_job()?;
        job.status = JobStatus::Processing;
        Ok(Some(job))
    }

    /// Record the terminal outcome of a job
    ///
    /// Sets `processed_at`, transitions to completed or failed, and bumps
    /// `attempts` unless the handler skipped on lock contention.
    pub async fn complete_job(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()> {
        let (status, attempted, error_message) = match outcome {
            JobOutcome::Completed => (JobStatus::Completed, 1i32, None),
            JobOutcome::SkippedLocked => (JobStatus::Completed, 0i32, None),
            JobOutcome::Failed(message) => (JobStatus::Failed, 1i32, Some(message.as_str())),
        };

        sqlx::query(
            r#"
            UPDATE refresh_jobs
            SET status = $2, processed_at = NOW(), attempts = attempts + $3,
                error_message = $4
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(attempted)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a job by id
    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM refresh_jobs WHERE job_id = $1"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Wallets with pending jobs or watching watchers, deduplicated on
    /// `xpub_van`
    pub async fn list_wallets_needing_work(&self) -> Result<Vec<WalletKeys>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT xpub_van, xpub_col, master_fingerprint
            FROM refresh_jobs WHERE status = 'pending'
            UNION
            SELECT DISTINCT xpub_van, xpub_col, master_fingerprint
            FROM refresh_watchers WHERE status = 'watching'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut wallets: HashMap<String, WalletKeys> = HashMap::new();
        for (xpub_van, xpub_col, master_fingerprint) in rows {
            wallets.entry(xpub_van.clone()).or_insert(WalletKeys {
                xpub_van,
                xpub_col,
                master_fingerprint,
            });
        }
        Ok(wallets.into_values().collect())
    }

    // ----- watchers -----

    /// Register a watcher for a transfer; duplicate registration is a no-op
    pub async fn create_watcher(
        &self,
        wallet: &WalletKeys,
        recipient_id: &str,
        asset_id: Option<&str>,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        sqlx::query(
            r#"
            INSERT INTO refresh_watchers (
                xpub_van, xpub_col, master_fingerprint, recipient_id, asset_id,
                status, expires_at
            ) VALUES ($1, $2, $3, $4, $5, 'watching', $6)
            ON CONFLICT (xpub_van, recipient_id) DO NOTHING
            "#,
        )
        .bind(&wallet.xpub_van)
        .bind(&wallet.xpub_col)
        .bind(&wallet.master_fingerprint)
        .bind(recipient_id)
        .bind(asset_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        debug!(wallet = %wallet.short_id(), recipient_id, "Registered watcher");
        Ok(())
    }

    /// All watching watchers for a wallet, oldest first
    ///
    /// Past-expiry rows are included: they need one final tick to transition
    /// to expired and attempt cancellation.
    pub async fn list_active_watchers(&self, xpub_van: &str) -> Result<Vec<Watcher>> {
        let rows: Vec<WatcherRow> = sqlx::query_as(&format!(
            r#"
            SELECT {WATCHER_COLUMNS} FROM refresh_watchers
            WHERE xpub_van = $1 AND status = 'watching'
            ORDER BY created_at ASC
            "#
        ))
        .bind(xpub_van)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WatcherRow::into_watcher).collect()
    }

    /// Fetch one watcher row
    pub async fn get_watcher(&self, xpub_van: &str, recipient_id: &str) -> Result<Option<Watcher>> {
        let row: Option<WatcherRow> = sqlx::query_as(&format!(
            "SELECT {WATCHER_COLUMNS} FROM refresh_watchers WHERE xpub_van = $1 AND recipient_id = $2"
        ))
        .bind(xpub_van)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WatcherRow::into_watcher).transpose()
    }

    /// Bump `refresh_count` and `last_refresh` after a wallet refresh
    pub async fn record_watcher_refresh(&self, xpub_van: &str, recipient_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE refresh_watchers
            SET refresh_count = refresh_count + 1, last_refresh = NOW()
            WHERE xpub_van = $1 AND recipient_id = $2
            "#,
        )
        .bind(xpub_van)
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transition a watcher's status
    pub async fn set_watcher_status(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        status: WatcherStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE refresh_watchers SET status = $3 WHERE xpub_van = $1 AND recipient_id = $2",
        )
        .bind(xpub_van)
        .bind(recipient_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a late-discovered asset id and extend the watch window
    pub async fn bind_watcher_asset(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        asset_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        sqlx::query(
            r#"
            UPDATE refresh_watchers
            SET asset_id = $3, expires_at = $4
            WHERE xpub_van = $1 AND recipient_id = $2
            "#,
        )
        .bind(xpub_van)
        .bind(recipient_id)
        .bind(asset_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        info!(wallet = xpub_van, recipient_id, asset_id, "Bound watcher to discovered asset");
        Ok(())
    }

    // ----- wallet locks -----

    /// Try to take the wallet lock; returns false when already held
    ///
    /// Expired locks for the key are purged first, treating
    /// `expires_at = now` as expired. Expiry is computed on the database
    /// clock so competing processes never compare across clocks.
    pub async fn acquire_lock(&self, xpub_van: &str, ttl: Duration) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM wallet_locks WHERE xpub_van = $1 AND expires_at <= clock_timestamp()",
        )
        .bind(xpub_van)
        .execute(&mut *tx)
        .await?;

        let acquired: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO wallet_locks (xpub_van, locked_at, expires_at)
            VALUES ($1, clock_timestamp(), clock_timestamp() + make_interval(secs => $2))
            ON CONFLICT (xpub_van) DO NOTHING
            RETURNING xpub_van
            "#,
        )
        .bind(xpub_van)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(acquired.is_some())
    }

    /// Release the wallet lock (no-op when not held)
    pub async fn release_lock(&self, xpub_van: &str) -> Result<()> {
        sqlx::query("DELETE FROM wallet_locks WHERE xpub_van = $1")
            .bind(xpub_van)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- recovery -----

    /// Re-enqueue a recovery job for every watching watcher
    ///
    /// Called once at startup so wallets with in-flight transfers are picked
    /// up again after a restart. Returns the number of jobs created.
    pub async fn recover(&self, max_retries: u32) -> Result<u64> {
        let rows: Vec<WatcherRow> = sqlx::query_as(&format!(
            "SELECT {WATCHER_COLUMNS} FROM refresh_watchers WHERE status = 'watching'"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0u64;
        for row in rows {
            let watcher = match row.into_watcher() {
                Ok(w) => w,
                Err(e) => {
                    error!(error = %e, "Skipping unreadable watcher row during recovery");
                    continue;
                }
            };
            match self
                .enqueue(&watcher.wallet, &RefreshTrigger::Recovery, max_retries)
                .await
            {
                Ok(_) => {
                    info!(
                        wallet = %watcher.wallet.short_id(),
                        recipient_id = %watcher.recipient_id,
                        "Recovering watcher"
                    );
                    recovered += 1;
                }
                Err(e) => {
                    error!(
                        wallet = %watcher.wallet.short_id(),
                        recipient_id = %watcher.recipient_id,
                        error = %e,
                        "Failed to recover watcher"
                    );
                }
            }
        }

        Ok(recovered)
    }
}
