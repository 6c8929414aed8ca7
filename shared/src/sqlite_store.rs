//! SQLite-backed [`KvStore`] for platforms that ship an embedded database.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::capabilities::{
    check_value_size, KvError, KvKey, KvStore, KvValue, StorageErrorCode, ABSENT_VERSION,
};
use crate::model::UnixTimeMs;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    version    INTEGER NOT NULL,
    data       BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
";

fn storage_error(e: &rusqlite::Error) -> KvError {
    let code = match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
        Some(rusqlite::ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
        Some(rusqlite::ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
        Some(rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly) => {
            StorageErrorCode::PermissionDenied
        }
        Some(rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase) => {
            StorageErrorCode::Corrupted
        }
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}

/// The connection is shared behind `Arc<Mutex<_>>`; every operation takes the lock,
/// runs its SQL and releases it before returning.
#[derive(Clone)]
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let conn = Connection::open(path).map_err(|e| storage_error(&e))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory().map_err(|e| storage_error(&e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| storage_error(&e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KvError> {
        self.conn
            .lock()
            .map_err(|e| KvError::storage(StorageErrorCode::Locked, format!("{e}")))
    }

    fn current_version(conn: &Connection, raw: &str) -> Result<u64, KvError> {
        let version: Option<i64> = conn
            .query_row("SELECT version FROM kv WHERE key = ?1", params![raw], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| storage_error(&e))?;
        Ok(version.map_or(ABSENT_VERSION, to_u64))
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[async_trait::async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError> {
        let conn = self.lock()?;
        let row: Option<(Vec<u8>, i64, i64)> = conn
            .query_row(
                "SELECT data, version, updated_at FROM kv WHERE key = ?1",
                params![key.raw()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| storage_error(&e))?;
        row.map(|(data, version, updated_at)| {
            KvValue::new(data, to_u64(version), UnixTimeMs(to_u64(updated_at)))
        })
        .transpose()
    }

    async fn compare_and_swap(
        &self,
        key: &KvKey,
        expected_version: u64,
        data: Vec<u8>,
        now: UnixTimeMs,
    ) -> Result<u64, KvError> {
        check_value_size(&data)?;
        let raw = key.raw();
        let next = expected_version.saturating_add(1);
        let conn = self.lock()?;

        let changed = if expected_version == ABSENT_VERSION {
            conn.execute(
                "INSERT INTO kv (key, version, data, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO NOTHING",
                params![raw, to_i64(next), data, to_i64(now.as_millis())],
            )
        } else {
            conn.execute(
                "UPDATE kv SET version = ?2, data = ?3, updated_at = ?4
                 WHERE key = ?1 AND version = ?5",
                params![
                    raw,
                    to_i64(next),
                    data,
                    to_i64(now.as_millis()),
                    to_i64(expected_version)
                ],
            )
        }
        .map_err(|e| storage_error(&e))?;

        if changed == 1 {
            return Ok(next);
        }
        Err(KvError::VersionMismatch {
            expected: expected_version,
            found: Self::current_version(&conn, &raw)?,
        })
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])
            .map_err(|e| storage_error(&e))?;
        Ok(removed > 0)
    }
}
