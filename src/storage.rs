//! SQLite-backed usage statistics.
//!
//! Completed requests are handed to a writer task over a channel and
//! persisted fire-and-forget; routing never depends on this store. The
//! administrative surface reads aggregates back out of the same file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use tokio::sync::mpsc;

/// One completed proxy request.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub client_id: String,
    pub subscription: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub client_id: String,
    pub total_requests: u64,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageBreakdown {
    pub requests: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub period: String,
    pub start_time: String,
    pub end_time: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub by_client: HashMap<String, UsageBreakdown>,
    pub by_subscription: HashMap<String, UsageBreakdown>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    client_id TEXT NOT NULL,
    subscription TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT '',
    path TEXT NOT NULL DEFAULT '',
    status_code INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_requests_timestamp
    ON requests(timestamp);
CREATE INDEX IF NOT EXISTS idx_requests_client
    ON requests(client_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_requests_subscription
    ON requests(subscription, timestamp);

CREATE TABLE IF NOT EXISTS clients (
    client_id TEXT PRIMARY KEY,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    total_requests INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS daily_usage (
    date TEXT NOT NULL,
    client_id TEXT NOT NULL,
    subscription TEXT NOT NULL,
    requests INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (date, client_id, subscription)
);
"#;

/// Usage store with a connection-per-call pattern; SQLite serialises
/// concurrent writers internally.
pub struct UsageStorage {
    db_path: PathBuf,
}

impl UsageStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let storage = Self { db_path };
        let conn = storage.connect()?;
        conn.execute_batch(SCHEMA)?;
        log::info!("usage storage initialized at {}", storage.db_path.display());
        Ok(storage)
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        Connection::open(&self.db_path)
    }

    /// Record one completed request: raw log line, client tracking, and the
    /// daily aggregate.
    pub fn record(&self, event: &UsageEvent) -> Result<(), rusqlite::Error> {
        let now = Utc::now();
        let timestamp = now.to_rfc3339();
        let date = now.format("%Y-%m-%d").to_string();
        let errors = i64::from(event.status_code >= 400);

        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO requests
                (timestamp, client_id, subscription, method, path, status_code, latency_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                timestamp,
                event.client_id,
                event.subscription,
                event.method,
                event.path,
                event.status_code,
                event.latency_ms as i64,
            ],
        )?;

        conn.execute(
            r#"
            INSERT INTO clients (client_id, first_seen, last_seen, total_requests)
            VALUES (?1, ?2, ?2, 1)
            ON CONFLICT(client_id) DO UPDATE SET
                last_seen = excluded.last_seen,
                total_requests = total_requests + 1
            "#,
            params![event.client_id, timestamp],
        )?;

        conn.execute(
            r#"
            INSERT INTO daily_usage (date, client_id, subscription, requests, errors)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT(date, client_id, subscription) DO UPDATE SET
                requests = requests + 1,
                errors = errors + excluded.errors
            "#,
            params![date, event.client_id, event.subscription, errors],
        )?;

        Ok(())
    }

    /// Aggregate usage for "day", "week", or "month" (anything else reads as
    /// "day").
    pub fn usage(&self, period: &str) -> Result<UsageReport, rusqlite::Error> {
        let now = Utc::now();
        let start = match period {
            "week" => now - Duration::weeks(1),
            "month" => now - Duration::days(30),
            _ => now - Duration::days(1),
        };
        let start_date = start.format("%Y-%m-%d").to_string();

        let conn = self.connect()?;
        let (total_requests, total_errors) = conn.query_row(
            r#"
            SELECT COALESCE(SUM(requests), 0), COALESCE(SUM(errors), 0)
            FROM daily_usage WHERE date >= ?1
            "#,
            params![start_date],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;

        let breakdown = |column: &str| -> Result<HashMap<String, UsageBreakdown>, rusqlite::Error> {
            let sql = format!(
                "SELECT {column}, SUM(requests), SUM(errors) FROM daily_usage \
                 WHERE date >= ?1 GROUP BY {column}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![start_date], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    UsageBreakdown {
                        requests: row.get::<_, i64>(1)? as u64,
                        errors: row.get::<_, i64>(2)? as u64,
                    },
                ))
            })?;
            rows.collect()
        };

        Ok(UsageReport {
            period: match period {
                "week" | "month" => period.to_string(),
                _ => "day".to_string(),
            },
            start_time: start.to_rfc3339(),
            end_time: now.to_rfc3339(),
            total_requests,
            total_errors,
            by_client: breakdown("client_id")?,
            by_subscription: breakdown("subscription")?,
        })
    }

    /// All known clients, most recently seen first.
    pub fn clients(&self) -> Result<Vec<ClientStats>, rusqlite::Error> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT client_id, total_requests, first_seen, last_seen
            FROM clients ORDER BY last_seen DESC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ClientStats {
                client_id: row.get(0)?,
                total_requests: row.get::<_, i64>(1)? as u64,
                first_seen: row.get(2)?,
                last_seen: row.get(3)?,
            })
        })?;
        rows.collect()
    }

    /// Prune raw request rows older than `days`, keeping the aggregates.
    pub fn cleanup_older_than(&self, days: i64) -> Result<usize, rusqlite::Error> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let conn = self.connect()?;
        let deleted = conn.execute("DELETE FROM requests WHERE timestamp < ?1", params![cutoff])?;
        if deleted > 0 {
            log::info!("cleaned up {deleted} old request records");
        }
        Ok(deleted)
    }
}

/// Spawn the fire-and-forget writer. The returned sender never blocks the
/// request path; records are dropped (with a log line) if the writer dies.
pub fn start_writer(storage: Arc<UsageStorage>) -> mpsc::UnboundedSender<UsageEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<UsageEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = storage.record(&event) {
                log::error!("failed to record usage for {}: {e}", event.client_id);
            }
        }
    });
    tx
}
