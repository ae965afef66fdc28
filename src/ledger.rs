//! Ledger - SQLite persistence for processed videos, quota usage and run history
//!
//! This module provides durable storage for:
//! - Processed videos (added / removed) with an append-only history
//! - Daily quota usage (consumed, saved, operations avoided)
//! - One execution record per run
//! - Short-lived claims that serialize overlapping runs on the same video
//!
//! The database is stored in XDG_DATA_HOME/tubesentry/ledger.db.
//! Every mutation is a single `BEGIN IMMEDIATE` transaction.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Columns added after the first schema version: (table, column, definition)
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("videos", "playlist_id", "TEXT NOT NULL DEFAULT ''"),
    ("videos", "duration_seconds", "INTEGER"),
    ("executions", "outcome", "TEXT NOT NULL DEFAULT 'completed'"),
];

/// Status of a processed video
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStatus {
    Added,
    Removed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Added => "added",
            VideoStatus::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(VideoStatus::Added),
            "removed" => Some(VideoStatus::Removed),
            _ => None,
        }
    }
}

/// Current state of one video
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub video_id: String,
    pub playlist_id: String,
    pub channel_name: String,
    pub status: VideoStatus,
    pub duration_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Quota usage for one UTC day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLedger {
    pub date: NaiveDate,
    pub units_consumed: u64,
    pub units_saved: u64,
    pub operations_avoided: u64,
}

impl QuotaLedger {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            units_consumed: 0,
            units_saved: 0,
            operations_avoided: 0,
        }
    }
}

/// One completed or aborted run
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub quota_used: u64,
    pub videos_added: u64,
    pub videos_removed: u64,
    pub duration_added: u64,
    pub duration_removed: u64,
    /// "completed" or "aborted: <reason>"
    pub outcome: String,
}

/// Aggregates over a trailing window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodStats {
    pub label: &'static str,
    pub runs: u64,
    pub quota_used: u64,
    pub videos_added: u64,
    pub videos_removed: u64,
    pub duration_added: u64,
    pub duration_removed: u64,
}

/// Result of trying to reserve a video for this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No claim existed, or this run already held it
    Acquired,
    /// Another run's claim was older than the stale threshold
    TakenOver { previous_run: String },
    /// Another run holds a live claim
    Held { run_id: String },
    /// The video already has an `added` record
    AlreadyProcessed,
}

impl ClaimOutcome {
    pub fn is_owned(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired | ClaimOutcome::TakenOver { .. })
    }
}

fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn to_db_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Ledger database manager
pub struct Ledger {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Ledger {
    /// Open or create the ledger at the default location
    pub fn open() -> Result<Self> {
        let db_path = Self::get_db_path()?;
        Self::open_at(db_path)
    }

    /// Open or create the ledger at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open ledger at {}", path.display()))?;

        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.clone()),
        };
        db.initialize()?;

        info!("Ledger opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory ledger (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.initialize()?;
        Ok(db)
    }

    /// Get the default ledger path
    pub fn get_db_path() -> Result<PathBuf> {
        let data_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(data_home)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".local/share")
        } else {
            PathBuf::from("/tmp")
        };

        Ok(data_dir.join("tubesentry").join("ledger.db"))
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Ledger connection lock poisoned"))
    }

    /// Initialize pragmas, schema and additive migrations
    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .context("Failed to configure journal mode")?;

        conn.execute_batch(
            r#"
            -- Current state per video
            CREATE TABLE IF NOT EXISTS videos (
                video_id TEXT PRIMARY KEY,
                channel_name TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            -- Every status change, never updated
            CREATE TABLE IF NOT EXISTS video_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id TEXT NOT NULL,
                playlist_id TEXT NOT NULL,
                channel_name TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            -- Daily quota usage
            CREATE TABLE IF NOT EXISTS quota_usage (
                date TEXT PRIMARY KEY,
                units_consumed INTEGER NOT NULL DEFAULT 0,
                units_saved INTEGER NOT NULL DEFAULT 0,
                operations_avoided INTEGER NOT NULL DEFAULT 0
            );

            -- One row per run
            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                quota_used INTEGER NOT NULL DEFAULT 0,
                videos_added INTEGER NOT NULL DEFAULT 0,
                videos_removed INTEGER NOT NULL DEFAULT 0,
                duration_added INTEGER NOT NULL DEFAULT 0,
                duration_removed INTEGER NOT NULL DEFAULT 0
            );

            -- In-flight reservations
            CREATE TABLE IF NOT EXISTS claims (
                video_id TEXT PRIMARY KEY,
                playlist_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);
            CREATE INDEX IF NOT EXISTS idx_history_video ON video_history(video_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_executions_timestamp ON executions(timestamp);
            "#,
        )
        .context("Failed to initialize ledger schema")?;

        for (table, column, definition) in ADDITIVE_COLUMNS {
            if !Self::column_exists(&conn, table, column)? {
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table, column, definition
                ))
                .with_context(|| format!("Failed to add column {}.{}", table, column))?;
                info!("Ledger migrated: added {}.{}", table, column);
            }
        }

        debug!("Ledger schema initialized");
        Ok(())
    }

    fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .with_context(|| format!("Failed to inspect table {}", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read table columns")?;
        Ok(names.iter().any(|name| name == column))
    }

    // =========================================================================
    // Video Records
    // =========================================================================

    /// True if the video has any record, added or removed
    pub fn has_been_processed(&self, video_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM videos WHERE video_id = ?1)",
                params![video_id],
                |row| row.get(0),
            )
            .context("Failed to check processed video")?;
        Ok(exists)
    }

    /// Record a video as added and release any claim on it.
    ///
    /// Returns false without writing anything when the video is already added.
    pub fn record_added(
        &self,
        video_id: &str,
        playlist_id: &str,
        channel_name: &str,
        duration_seconds: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = to_db_time(now);
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM videos WHERE video_id = ?1",
                params![video_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read video status")?;

        let written = if current.as_deref() == Some(VideoStatus::Added.as_str()) {
            debug!("Video {} already recorded as added", video_id);
            false
        } else {
            tx.execute(
                r#"
                INSERT INTO videos (video_id, playlist_id, channel_name, status, duration_seconds, timestamp)
                VALUES (?1, ?2, ?3, 'added', ?4, ?5)
                ON CONFLICT(video_id) DO UPDATE SET
                    playlist_id = ?2,
                    channel_name = ?3,
                    status = 'added',
                    duration_seconds = COALESCE(?4, duration_seconds),
                    timestamp = ?5
                "#,
                params![
                    video_id,
                    playlist_id,
                    channel_name,
                    duration_seconds.map(|d| d as i64),
                    now
                ],
            )
            .context("Failed to record added video")?;
            Self::append_history(&tx, video_id, playlist_id, channel_name, VideoStatus::Added, &now)?;
            true
        };

        tx.execute("DELETE FROM claims WHERE video_id = ?1", params![video_id])
            .context("Failed to release claim")?;
        tx.commit().context("Failed to commit added video")?;

        if written {
            debug!("Recorded video {} as added to {}", video_id, playlist_id);
        }
        Ok(written)
    }

    /// Record a video as removed from its playlist
    pub fn record_removed(
        &self,
        video_id: &str,
        playlist_id: &str,
        channel_name: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = to_db_time(now);
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        tx.execute(
            r#"
            INSERT INTO videos (video_id, playlist_id, channel_name, status, timestamp)
            VALUES (?1, ?2, ?3, 'removed', ?4)
            ON CONFLICT(video_id) DO UPDATE SET
                playlist_id = ?2,
                status = 'removed',
                timestamp = ?4
            "#,
            params![video_id, playlist_id, channel_name, now],
        )
        .context("Failed to record removed video")?;
        Self::append_history(&tx, video_id, playlist_id, channel_name, VideoStatus::Removed, &now)?;
        tx.commit().context("Failed to commit removed video")?;

        debug!("Recorded video {} as removed from {}", video_id, playlist_id);
        Ok(())
    }

    fn append_history(
        tx: &rusqlite::Transaction<'_>,
        video_id: &str,
        playlist_id: &str,
        channel_name: &str,
        status: VideoStatus,
        timestamp: &str,
    ) -> Result<()> {
        tx.execute(
            r#"
            INSERT INTO video_history (video_id, playlist_id, channel_name, status, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![video_id, playlist_id, channel_name, status.as_str(), timestamp],
        )
        .context("Failed to append video history")?;
        Ok(())
    }

    /// Get a video's current record
    pub fn get_record(&self, video_id: &str) -> Result<Option<LedgerRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT video_id, playlist_id, channel_name, status, duration_seconds, timestamp
                FROM videos
                WHERE video_id = ?1
                "#,
                params![video_id],
                |row| {
                    Ok(LedgerRecord {
                        video_id: row.get(0)?,
                        playlist_id: row.get(1)?,
                        channel_name: row.get(2)?,
                        status: VideoStatus::parse(&row.get::<_, String>(3)?)
                            .unwrap_or(VideoStatus::Added),
                        duration_seconds: row.get::<_, Option<i64>>(4)?.map(|d| d.max(0) as u64),
                        timestamp: row
                            .get::<_, String>(5)
                            .ok()
                            .and_then(|s| from_db_time(&s))
                            .unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()
            .context("Failed to query video record")?;
        Ok(record)
    }

    /// Channel that added the video, if it was added through a rule
    pub fn added_channel_name(&self, video_id: &str) -> Result<Option<String>> {
        Ok(self.get_record(video_id)?.map(|record| record.channel_name))
    }

    /// Status history of a video, oldest first
    pub fn history_for(&self, video_id: &str) -> Result<Vec<VideoStatus>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status FROM video_history WHERE video_id = ?1 ORDER BY id ASC",
        )?;
        let statuses = stmt
            .query_map(params![video_id], |row| row.get::<_, String>(0))
            .context("Failed to query video history")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect video history")?;
        Ok(statuses
            .iter()
            .filter_map(|s| VideoStatus::parse(s))
            .collect())
    }

    /// Total number of history rows, used to verify idempotent runs
    pub fn history_len(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM video_history", [], |row| row.get(0))
            .context("Failed to count video history")?;
        Ok(count.max(0) as u64)
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Reserve a video for this run before its remote insert.
    ///
    /// A claim older than `stale_after` is assumed to belong to a run that
    /// died and is taken over.
    pub fn try_claim(
        &self,
        video_id: &str,
        playlist_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ClaimOutcome> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM videos WHERE video_id = ?1",
                params![video_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read video status")?;
        if status.as_deref() == Some(VideoStatus::Added.as_str()) {
            tx.commit().context("Failed to commit claim check")?;
            return Ok(ClaimOutcome::AlreadyProcessed);
        }

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT run_id, claimed_at FROM claims WHERE video_id = ?1",
                params![video_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read claim")?;

        let outcome = match existing {
            Some((holder, _)) if holder == run_id => ClaimOutcome::Acquired,
            Some((holder, claimed_at)) => {
                let claimed_at = from_db_time(&claimed_at).unwrap_or(DateTime::<Utc>::MIN_UTC);
                if now - claimed_at < stale_after {
                    tx.commit().context("Failed to commit claim check")?;
                    return Ok(ClaimOutcome::Held { run_id: holder });
                }
                warn!(
                    "Taking over stale claim on {} held by run {} since {}",
                    video_id, holder, claimed_at
                );
                ClaimOutcome::TakenOver { previous_run: holder }
            }
            None => ClaimOutcome::Acquired,
        };

        tx.execute(
            r#"
            INSERT INTO claims (video_id, playlist_id, run_id, claimed_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(video_id) DO UPDATE SET
                playlist_id = ?2,
                run_id = ?3,
                claimed_at = ?4
            "#,
            params![video_id, playlist_id, run_id, to_db_time(now)],
        )
        .context("Failed to write claim")?;
        tx.commit().context("Failed to commit claim")?;

        Ok(outcome)
    }

    /// Drop this run's claim on a video, if it still holds one
    pub fn release_claim(&self, video_id: &str, run_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM claims WHERE video_id = ?1 AND run_id = ?2",
            params![video_id, run_id],
        )
        .context("Failed to release claim")?;
        tx.commit().context("Failed to commit claim release")?;
        Ok(())
    }

    // =========================================================================
    // Quota Usage
    // =========================================================================

    /// Add to the day's quota counters
    pub fn accumulate_quota(
        &self,
        date: NaiveDate,
        units_consumed: u64,
        units_saved: u64,
        operations_avoided: u64,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;
        tx.execute(
            r#"
            INSERT INTO quota_usage (date, units_consumed, units_saved, operations_avoided)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(date) DO UPDATE SET
                units_consumed = units_consumed + ?2,
                units_saved = units_saved + ?3,
                operations_avoided = operations_avoided + ?4
            "#,
            params![
                to_db_date(date),
                units_consumed as i64,
                units_saved as i64,
                operations_avoided as i64
            ],
        )
        .context("Failed to accumulate quota usage")?;
        tx.commit().context("Failed to commit quota usage")?;
        Ok(())
    }

    /// Quota usage for a day, zero when nothing was recorded
    pub fn quota_for(&self, date: NaiveDate) -> Result<QuotaLedger> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT units_consumed, units_saved, operations_avoided
                FROM quota_usage
                WHERE date = ?1
                "#,
                params![to_db_date(date)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query quota usage")?;

        Ok(match row {
            Some((consumed, saved, avoided)) => QuotaLedger {
                date,
                units_consumed: consumed.max(0) as u64,
                units_saved: saved.max(0) as u64,
                operations_avoided: avoided.max(0) as u64,
            },
            None => QuotaLedger::empty(date),
        })
    }

    // =========================================================================
    // Execution History
    // =========================================================================

    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;
        tx.execute(
            r#"
            INSERT INTO executions (timestamp, quota_used, videos_added, videos_removed, duration_added, duration_removed, outcome)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                to_db_time(record.timestamp),
                record.quota_used as i64,
                record.videos_added as i64,
                record.videos_removed as i64,
                record.duration_added as i64,
                record.duration_removed as i64,
                record.outcome,
            ],
        )
        .context("Failed to record execution")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit execution")?;

        debug!("Recorded execution {} ({})", id, record.outcome);
        Ok(id)
    }

    /// Trailing day / week / month / year aggregates
    pub fn stats_summary(&self, now: DateTime<Utc>) -> Result<Vec<PeriodStats>> {
        let periods = [
            ("day", Duration::days(1)),
            ("week", Duration::days(7)),
            ("month", Duration::days(30)),
            ("year", Duration::days(365)),
        ];

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(quota_used), 0),
                   COALESCE(SUM(videos_added), 0),
                   COALESCE(SUM(videos_removed), 0),
                   COALESCE(SUM(duration_added), 0),
                   COALESCE(SUM(duration_removed), 0)
            FROM executions
            WHERE timestamp >= ?1
            "#,
        )?;

        let mut summary = Vec::with_capacity(periods.len());
        for (label, window) in periods {
            let since = to_db_time(now - window);
            let stats = stmt
                .query_row(params![since], |row| {
                    let get = |i: usize| row.get::<_, i64>(i).map(|v| v.max(0) as u64);
                    Ok(PeriodStats {
                        label,
                        runs: get(0)?,
                        quota_used: get(1)?,
                        videos_added: get(2)?,
                        videos_removed: get(3)?,
                        duration_added: get(4)?,
                        duration_removed: get(5)?,
                    })
                })
                .with_context(|| format!("Failed to aggregate {} statistics", label))?;
            summary.push(stats);
        }

        Ok(summary)
    }
}
