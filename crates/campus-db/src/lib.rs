pub mod access;
pub mod channels;
pub mod direct;
pub mod error;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod tenant;
pub mod users;

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use tracing::info;

pub use error::{DomainError, FieldErrors};

pub struct Database {
    conn: Mutex<Connection>,
    /// Last timestamp handed out, in microseconds. Never repeats.
    clock: AtomicI64,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::from_connection(conn)?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock: AtomicI64::new(0),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DomainError>
    where
        F: FnOnce(&Connection) -> Result<T, DomainError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Run `f` inside a transaction; commits only when `f` returns `Ok`.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DomainError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, DomainError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Strictly increasing wall-clock time in microseconds, so that
    /// "created after the read cursor" is a total order.
    pub fn now_micros(&self) -> i64 {
        let wall = Utc::now().timestamp_micros();
        let mut last = self.clock.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .clock
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        from_micros(self.now_micros())
    }
}

pub fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub fn from_micros(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(v).unwrap_or_default()
}
