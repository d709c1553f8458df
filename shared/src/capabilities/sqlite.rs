use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::kv::{KeyValueBackend, KvError, KvOperation, KvOutput, KvResult, StorageErrorCode};

/// SQLite-backed key-value medium for native shells.
///
/// Statements are small single-row operations, so they run inline on the
/// calling task rather than on a blocking pool.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(map_sqlite_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn run(&self, operation: KvOperation) -> KvResult {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection mutex poisoned"))?;

        match operation {
            KvOperation::Get { key } => {
                let value: Option<Vec<u8>> = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key.raw()], |row| {
                        row.get(0)
                    })
                    .optional()
                    .map_err(map_sqlite_error)?;
                Ok(KvOutput::Value(value))
            }
            KvOperation::Set { key, value } => {
                conn.execute(
                    r#"
                    INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![key.raw(), value, crate::get_current_time_ms() as i64],
                )
                .map_err(map_sqlite_error)?;
                Ok(KvOutput::Written)
            }
            KvOperation::Delete { key } => {
                let affected = conn
                    .execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])
                    .map_err(map_sqlite_error)?;
                Ok(KvOutput::Deleted {
                    existed: affected > 0,
                })
            }
            KvOperation::DeleteMulti { keys } => {
                let tx = conn.transaction().map_err(map_sqlite_error)?;
                let mut deleted_count = 0;
                for key in &keys {
                    deleted_count += tx
                        .execute("DELETE FROM kv WHERE key = ?1", params![key.raw()])
                        .map_err(map_sqlite_error)?;
                }
                tx.commit().map_err(map_sqlite_error)?;
                Ok(KvOutput::DeletedMulti { deleted_count })
            }
        }
    }
}

#[async_trait]
impl KeyValueBackend for SqliteKv {
    async fn execute(&self, operation: KvOperation) -> KvResult {
        self.run(operation)
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> KvError {
    use rusqlite::ErrorCode;

    let code = match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
        Some(ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
        Some(ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            StorageErrorCode::Corrupted
        }
        Some(ErrorCode::PermissionDenied) | Some(ErrorCode::ReadOnly) => {
            StorageErrorCode::PermissionDenied
        }
        Some(ErrorCode::SystemIoFailure) | Some(ErrorCode::CannotOpen) => {
            StorageErrorCode::IoError
        }
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}
