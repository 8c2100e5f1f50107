//! Daily snapshot log and trend queries
//!
//! One snapshot per calendar day, newest first, capped at the retention window.
//! The whole log is read and rewritten on every append through a
//! [`SnapshotBackend`]:
//! - `JsonFileBackend` - single JSON document, written via temp file + rename
//! - `SqliteSnapshotBackend` - one row per day, replaced in a single transaction
//!
//! Snapshotting is best-effort: persistence errors are logged, never returned
//! from [`SnapshotStore::append`].

use chrono::{DateTime, Local, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_RETENTION: usize = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub dimension_key: String,
    pub value: u64,
}

impl SeriesPoint {
    pub fn new(dimension_key: &str, value: u64) -> Self {
        Self {
            dimension_key: dimension_key.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub date: NaiveDate,
    pub taken_at: DateTime<Utc>,
    pub series: Vec<SeriesPoint>,
}

impl Snapshot {
    pub fn value_of(&self, dimension_key: &str) -> Option<u64> {
        self.series
            .iter()
            .find(|p| p.dimension_key == dimension_key)
            .map(|p| p.value)
    }
}

/// One day of a trend series
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub count: u64,
}

#[derive(Debug)]
pub enum SnapshotError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Database(String),
    Corrupt(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err)
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err)
    }
}

impl From<rusqlite::Error> for SnapshotError {
    fn from(err: rusqlite::Error) -> Self {
        SnapshotError::Database(err.to_string())
    }
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Io(e) => write!(f, "IO error: {}", e),
            SnapshotError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SnapshotError::Database(e) => write!(f, "Database error: {}", e),
            SnapshotError::Corrupt(e) => write!(f, "Corrupt snapshot log: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Whole-log storage for snapshots
pub trait SnapshotBackend: Send {
    /// Every stored snapshot, in any order
    fn load_all(&mut self) -> Result<Vec<Snapshot>, SnapshotError>;

    /// Replace the stored log with `snapshots`
    fn save_all(&mut self, snapshots: &[Snapshot]) -> Result<(), SnapshotError>;

    /// Backend type for logging
    fn backend_type(&self) -> &'static str;
}

fn ensure_parent(path: &Path) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotBackend for JsonFileBackend {
    fn load_all(&mut self) -> Result<Vec<Snapshot>, SnapshotError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let json = fs::read_to_string(&self.path)?;
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&json)?)
    }

    fn save_all(&mut self, snapshots: &[Snapshot]) -> Result<(), SnapshotError> {
        ensure_parent(&self.path)?;

        let json = serde_json::to_string_pretty(snapshots)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        log::debug!("Saved {} snapshots to {}", snapshots.len(), self.path.display());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "JSON"
    }
}

pub struct SqliteSnapshotBackend {
    conn: Connection,
}

impl SqliteSnapshotBackend {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        ensure_parent(db_path.as_ref())?;

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                date TEXT PRIMARY KEY,
                taken_at TEXT NOT NULL,
                series TEXT NOT NULL
            )",
            [],
        )?;

        log::info!("✅ Snapshot database initialized with WAL mode");
        Ok(Self { conn })
    }
}

impl SnapshotBackend for SqliteSnapshotBackend {
    fn load_all(&mut self) -> Result<Vec<Snapshot>, SnapshotError> {
        let mut stmt = self
            .conn
            .prepare("SELECT date, taken_at, series FROM snapshots ORDER BY date DESC")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (date, taken_at, series) = row?;
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(|e| SnapshotError::Corrupt(format!("date {}: {}", date, e)))?;
            let taken_at = DateTime::parse_from_rfc3339(&taken_at)
                .map_err(|e| SnapshotError::Corrupt(format!("taken_at {}: {}", taken_at, e)))?
                .with_timezone(&Utc);

            snapshots.push(Snapshot {
                date,
                taken_at,
                series: serde_json::from_str(&series)?,
            });
        }

        Ok(snapshots)
    }

    fn save_all(&mut self, snapshots: &[Snapshot]) -> Result<(), SnapshotError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM snapshots", [])?;

        for snapshot in snapshots {
            tx.execute(
                "INSERT INTO snapshots (date, taken_at, series) VALUES (?1, ?2, ?3)",
                params![
                    snapshot.date.format("%Y-%m-%d").to_string(),
                    snapshot.taken_at.to_rfc3339(),
                    serde_json::to_string(&snapshot.series)?,
                ],
            )?;
        }

        tx.commit()?;
        log::debug!("Saved {} snapshots to SQLite", snapshots.len());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

type TodayFn = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Owner of the snapshot log; the only writer
pub struct SnapshotStore {
    backend: Mutex<Box<dyn SnapshotBackend>>,
    retention: usize,
    today: TodayFn,
}

impl SnapshotStore {
    pub fn new(backend: Box<dyn SnapshotBackend>, retention: usize) -> Self {
        Self::with_today_fn(backend, retention, Arc::new(|| Local::now().date_naive()))
    }

    /// Custom "today", for tests that need to move the calendar
    pub fn with_today_fn(backend: Box<dyn SnapshotBackend>, retention: usize, today: TodayFn) -> Self {
        log::info!(
            "📚 Snapshot store: {} backend, keeping {} days",
            backend.backend_type(),
            retention
        );

        Self {
            backend: Mutex::new(backend),
            retention: retention.max(1),
            today,
        }
    }

    /// Record today's values, replacing any earlier snapshot from today
    pub fn append(&self, series: Vec<SeriesPoint>) -> Snapshot {
        let snapshot = Snapshot {
            date: (self.today)(),
            taken_at: Utc::now(),
            series,
        };

        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);

        let mut log = match backend.load_all() {
            Ok(log) => log,
            Err(e) => {
                // Rewriting on top of an unreadable log would destroy it
                log::warn!("⚠️  Snapshot log unreadable, skipping write: {}", e);
                return snapshot;
            }
        };

        log.retain(|s| s.date != snapshot.date);
        log.push(snapshot.clone());
        log.sort_by(|a, b| b.date.cmp(&a.date));
        log.truncate(self.retention);

        match backend.save_all(&log) {
            Ok(()) => log::info!("📸 Snapshot for {} written ({} in log)", snapshot.date, log.len()),
            Err(e) => log::warn!("⚠️  Failed to persist snapshot for {}: {}", snapshot.date, e),
        }

        snapshot
    }

    /// Stored snapshots, newest first; empty when the log cannot be read
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        match backend.load_all() {
            Ok(mut log) => {
                log.sort_by(|a, b| b.date.cmp(&a.date));
                log
            }
            Err(e) => {
                log::warn!("⚠️  Failed to read snapshot log: {}", e);
                Vec::new()
            }
        }
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots().into_iter().next()
    }

    /// Values of one series since `since` (inclusive), oldest first. Days
    /// without a snapshot, or without that series, are simply absent.
    pub fn query_trend(&self, dimension_key: &str, since: NaiveDate) -> Vec<TrendPoint> {
        trend_of(&self.snapshots(), dimension_key, since)
    }

    /// Several series from a single read of the log
    pub fn query_trends(&self, dimension_keys: &[&str], since: NaiveDate) -> BTreeMap<String, Vec<TrendPoint>> {
        let log = self.snapshots();
        dimension_keys
            .iter()
            .map(|key| (key.to_string(), trend_of(&log, key, since)))
            .collect()
    }

    pub fn today(&self) -> NaiveDate {
        (self.today)()
    }
}

fn trend_of(log: &[Snapshot], dimension_key: &str, since: NaiveDate) -> Vec<TrendPoint> {
    let mut points: Vec<TrendPoint> = log
        .iter()
        .filter(|s| s.date >= since)
        .filter_map(|s| {
            s.value_of(dimension_key).map(|count| TrendPoint {
                date: s.date,
                count,
            })
        })
        .collect();

    points.sort_by_key(|p| p.date);
    points
}
