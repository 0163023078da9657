//! Database module for MedSync
//!
//! Provides the pooled SQLite connection that backs the local resource
//! replica, conflict table, sync operation log and settings.

use rusqlite::{params, Connection, Transaction};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the on-disk database and bring its schema up to date
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(init_connection);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        log::info!("Database opened at {:?}", db_path);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool
    /// is pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for existing databases
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: clinically urgent flag drives push priority
        let has_urgent: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('resources') WHERE name = 'urgent'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_urgent {
            log::info!("Running migration: Adding urgent column to resources");
            conn.execute("ALTER TABLE resources ADD COLUMN urgent INTEGER NOT NULL DEFAULT 0", [])?;
        }

        // Migration 2: remote deletions recorded on conflicts
        let has_remote_deleted: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('conflicts') WHERE name = 'remote_deleted'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_remote_deleted {
            log::info!("Running migration: Adding remote_deleted column to conflicts");
            conn.execute("ALTER TABLE conflicts ADD COLUMN remote_deleted INTEGER NOT NULL DEFAULT 0", [])?;
        }

        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        set_setting_on(&conn, key, value)
    }

    // =========================================================================
    // HELPER METHODS (for store module and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute batch SQL
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(sql).map_err(DbError::from)
    }

    /// Run `f` inside one transaction; nothing is written unless it returns Ok
    pub fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> DbResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let value = f(&tx)?;
        tx.commit()?;

        Ok(value)
    }
}

/// Per-connection setup applied by the pool
fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

/// Write a setting through an existing connection or transaction
pub fn set_setting_on<T: Serialize>(conn: &Connection, key: &str, value: &T) -> DbResult<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| DbError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
        params![key, json],
    )?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_schema() {
        let db = Database::in_memory().unwrap();
        let tables: Vec<String> = db
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                [],
                |row| row.get(0),
            )
            .unwrap();

        for expected in ["conflicts", "resources", "search_index", "settings", "sync_operations"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[test]
    fn test_migrations_add_columns() {
        let db = Database::in_memory().unwrap();
        let has_urgent: bool = db
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('resources') WHERE name = 'urgent'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(has_urgent);
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.get_setting::<String>("missing").unwrap(), None);

        db.set_setting("checkpoint", &"2026-01-01T00:00:00Z".to_string()).unwrap();
        let value: Option<String> = db.get_setting("checkpoint").unwrap();
        assert_eq!(value.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();

        let result: DbResult<()> = db.transaction(|tx| {
            set_setting_on(tx, "a", &1)?;
            Err(DbError::NotFound("forced".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.get_setting::<i32>("a").unwrap(), None);

        db.transaction(|tx| set_setting_on(tx, "a", &2)).unwrap();
        assert_eq!(db.get_setting::<i32>("a").unwrap(), Some(2));
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("replica.db");

        {
            let db = Database::new(path.clone()).unwrap();
            db.set_setting("k", &"v").unwrap();
        }

        let db = Database::new(path).unwrap();
        assert_eq!(db.get_setting::<String>("k").unwrap().as_deref(), Some("v"));
    }
}
