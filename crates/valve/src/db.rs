//! SQLite persistence for the settings store.
//!
//! The control core reads and writes settings synchronously from inside the
//! loop, so [`SqliteStore`] serves reads from a cache filled at boot and
//! hands writes to a background task that applies them in order.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use irrigation_core::store::{SettingsStore, Value};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/valve.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // Every connection to ":memory:" is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn load_settings(&self) -> Result<HashMap<String, Value>> {
        let rows = sqlx::query("SELECT key, int_val, real_val, text_val, blob_val FROM settings")
            .fetch_all(&self.pool)
            .await
            .context("load_settings failed")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let value = if let Some(v) = row.try_get::<Option<i64>, _>("int_val")? {
                Value::Int(v)
            } else if let Some(v) = row.try_get::<Option<f64>, _>("real_val")? {
                Value::Float(v)
            } else if let Some(v) = row.try_get::<Option<String>, _>("text_val")? {
                Value::Text(v)
            } else if let Some(v) = row.try_get::<Option<Vec<u8>>, _>("blob_val")? {
                Value::Blob(v)
            } else {
                tracing::warn!(key = %key, "settings row without value, skipped");
                continue;
            };
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Upsert one setting. The row is replaced as a whole, so a blob write
    /// is atomic.
    pub async fn put_setting(&self, key: &str, value: &Value) -> Result<()> {
        let (int_val, real_val, text_val, blob_val) = match value {
            Value::Int(v) => (Some(*v), None, None, None),
            Value::Float(v) => (None, Some(*v), None, None),
            Value::Text(v) => (None, None, Some(v.as_str()), None),
            Value::Blob(v) => (None, None, None, Some(v.as_slice())),
        };
        let now = OffsetDateTime::now_utc().unix_timestamp();

        sqlx::query(
            r#"
            INSERT INTO settings (key, int_val, real_val, text_val, blob_val, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              int_val=excluded.int_val,
              real_val=excluded.real_val,
              text_val=excluded.text_val,
              blob_val=excluded.blob_val,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(int_val)
        .bind(real_val)
        .bind(text_val)
        .bind(blob_val)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("put_setting failed key={key}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Write-behind store
// ---------------------------------------------------------------------------

enum Write {
    Put(String, Value),
    Flush(oneshot::Sender<()>),
}

/// Settings store backed by SQLite. Reads never touch the database.
pub struct SqliteStore {
    cache: HashMap<String, Value>,
    tx: mpsc::UnboundedSender<Write>,
}

/// Waits until every write queued before the call has reached the database.
#[derive(Clone)]
pub struct StoreFlusher {
    tx: mpsc::UnboundedSender<Write>,
}

impl StoreFlusher {
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Write::Flush(done_tx))
            .map_err(|_| anyhow::anyhow!("settings writer has stopped"))?;
        done_rx.await.context("settings writer dropped flush")
    }
}

impl SqliteStore {
    /// Load every setting and start the writer task.
    pub async fn open(db: Db) -> Result<(Self, StoreFlusher, JoinHandle<()>)> {
        let cache = db.load_settings().await?;
        tracing::info!(keys = cache.len(), "settings cache loaded");

        let (tx, mut rx) = mpsc::unbounded_channel::<Write>();
        let writer = tokio::spawn(async move {
            while let Some(w) = rx.recv().await {
                match w {
                    Write::Put(key, value) => {
                        if let Err(e) = db.put_setting(&key, &value).await {
                            tracing::error!(key = %key, "settings write failed: {e:#}");
                        }
                    }
                    Write::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("settings writer finished");
        });

        let flusher = StoreFlusher { tx: tx.clone() };
        Ok((Self { cache, tx }, flusher, writer))
    }
}

impl SettingsStore for SqliteStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.cache.insert(key.to_string(), value.clone());
        self.tx
            .send(Write::Put(key.to_string(), value))
            .map_err(|_| anyhow::anyhow!("settings writer has stopped, {key} not persisted"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
