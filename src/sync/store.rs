//! Local Resource Store - Durable Encrypted Replica
//!
//! SQLite-backed document store keyed by `(resourceType, id)`.
//!
//! Features:
//! - Payloads are `EncryptedEnvelope`s; only index metadata is plaintext
//! - Atomic single-record upserts, multi-record pull pages in one transaction
//! - Blind-index rows for equality search without decryption
//! - Conflict table and sync operation log keyed by the same composite key
//! - Pull checkpoint committed together with the page it covers

use super::models::{
    ConflictRecord, EncryptedEnvelope, LocalResourceRecord, OperationKind, OperationStatus,
    Resolution, ResourceKey, SyncOperation, SyncStatus,
};
use crate::db::{set_setting_on, Database, DbError};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const CHECKPOINT_KEY: &str = "pull_checkpoint";

const RECORD_COLUMNS: &str = "resource_type, id, envelope, local_version, remote_version, \
                              sync_status, deleted, urgent, last_modified";

// ============================================================================
// Data Types
// ============================================================================

/// Filter over plaintext index fields only
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceFilter {
    pub sync_status: Option<SyncStatus>,
    pub modified_since: Option<DateTime<Utc>>,
    /// Blind-index match: `(field, hash_for_search(value))`
    pub index: Option<(String, String)>,
    pub include_deleted: bool,
    pub limit: Option<u32>,
}

impl ResourceFilter {
    pub fn with_status(status: SyncStatus) -> Self {
        Self {
            sync_status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_index(field: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            index: Some((field.into(), hash.into())),
            ..Self::default()
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub count: u64,
    pub bytes: u64,
    pub by_status: HashMap<SyncStatus, u64>,
    pub tombstones: u64,
    pub conflicts: u64,
}

/// Everything one pulled page changes, written atomically
#[derive(Debug, Clone)]
pub struct PullBatch {
    pub upserts: Vec<LocalResourceRecord>,
    pub purges: Vec<ResourceKey>,
    pub conflicts: Vec<ConflictRecord>,
    pub checkpoint: Option<DateTime<Utc>>,
}

// ============================================================================
// Resource Store
// ============================================================================

pub struct ResourceStore {
    db: Arc<Database>,
}

impl ResourceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------------

    /// Insert or replace one record
    pub fn put(&self, record: &LocalResourceRecord) -> StoreResult<()> {
        let conn = self.db.get_conn()?;
        put_record(&conn, record)?;

        log::debug!(
            "Stored {}/{} (local v{}, remote {:?}, {})",
            record.resource_type,
            record.id,
            record.local_version,
            record.remote_version,
            record.sync_status
        );
        Ok(())
    }

    pub fn get(&self, resource_type: &str, id: &str) -> StoreResult<Option<LocalResourceRecord>> {
        let conn = self.db.get_conn()?;
        get_record(&conn, resource_type, id)
    }

    /// Records of one type matching plaintext index fields
    pub fn query(&self, resource_type: &str, filter: &ResourceFilter) -> StoreResult<Vec<LocalResourceRecord>> {
        let mut sql = format!("SELECT {} FROM resources r WHERE r.resource_type = ?", prefixed_columns("r"));
        let mut values: Vec<Value> = vec![Value::Text(resource_type.to_string())];

        if let Some(status) = filter.sync_status {
            sql.push_str(" AND r.sync_status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(since) = filter.modified_since {
            sql.push_str(" AND r.last_modified >= ?");
            values.push(Value::Text(fmt_ts(&since)));
        }
        if !filter.include_deleted {
            sql.push_str(" AND r.deleted = 0");
        }
        if let Some((field, hash)) = &filter.index {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM search_index s \
                 WHERE s.resource_type = r.resource_type AND s.id = r.id \
                 AND s.field = ? AND s.hash = ?)",
            );
            values.push(Value::Text(field.clone()));
            values.push(Value::Text(hash.clone()));
        }

        sql.push_str(" ORDER BY r.last_modified ASC, r.id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let records = self.db.query(&sql, params_from_iter(values), map_record)?;
        Ok(records)
    }

    /// Records of any type in one of `statuses`
    pub fn records_with_status(&self, statuses: &[SyncStatus]) -> StoreResult<Vec<LocalResourceRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM resources WHERE sync_status IN ({}) ORDER BY last_modified ASC",
            RECORD_COLUMNS, placeholders
        );
        let values: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();

        Ok(self.db.query(&sql, params_from_iter(values), map_record)?)
    }

    /// Remove a record and its index rows; returns whether it existed
    pub fn delete(&self, resource_type: &str, id: &str) -> StoreResult<bool> {
        let key = ResourceKey::new(resource_type, id);
        let removed = self.db.transaction(|tx| purge_record(tx, &key))?;

        if removed {
            log::info!("Purged {} from local store", key);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let (count, bytes, tombstones) = self.db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(envelope_bytes), 0), COALESCE(SUM(deleted), 0) FROM resources",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )?;

        let rows: Vec<(String, i64)> = self.db.query(
            "SELECT sync_status, COUNT(*) FROM resources GROUP BY sync_status",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let conflicts: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE resolution = 'pending'",
            [],
            |row| row.get(0),
        )?;

        let by_status = rows
            .into_iter()
            .filter_map(|(status, n)| SyncStatus::parse(&status).map(|s| (s, n as u64)))
            .collect();

        Ok(StoreStats {
            count: count as u64,
            bytes: bytes as u64,
            by_status,
            tombstones: tombstones as u64,
            conflicts: conflicts as u64,
        })
    }

    /// Replace the blind-index rows of one resource
    pub fn set_search_terms(&self, key: &ResourceKey, terms: &[(String, String)]) -> StoreResult<()> {
        self.db.transaction(|tx| {
            tx.execute(
                "DELETE FROM search_index WHERE resource_type = ?1 AND id = ?2",
                params![key.resource_type, key.id],
            )?;
            for (field, hash) in terms {
                tx.execute(
                    "INSERT INTO search_index (resource_type, id, field, hash) VALUES (?1, ?2, ?3, ?4)",
                    params![key.resource_type, key.id, field, hash],
                )?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Write a record together with its search terms
    pub fn put_with_terms(&self, record: &LocalResourceRecord, terms: &[(String, String)]) -> StoreResult<()> {
        self.db.transaction(|tx| {
            put_record(tx, record)?;
            tx.execute(
                "DELETE FROM search_index WHERE resource_type = ?1 AND id = ?2",
                params![record.resource_type, record.id],
            )?;
            for (field, hash) in terms {
                tx.execute(
                    "INSERT INTO search_index (resource_type, id, field, hash) VALUES (?1, ?2, ?3, ?4)",
                    params![record.resource_type, record.id, field, hash],
                )?;
            }
            Ok(())
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------------

    pub fn put_conflict(&self, conflict: &ConflictRecord) -> StoreResult<()> {
        let conn = self.db.get_conn()?;
        put_conflict(&conn, conflict)?;
        Ok(())
    }

    pub fn get_conflict(&self, key: &ResourceKey) -> StoreResult<Option<ConflictRecord>> {
        let conn = self.db.get_conn()?;
        let conflict = conn
            .query_row(
                "SELECT resource_type, resource_id, local_version, remote_version, local_payload, \
                 remote_payload, remote_deleted, remote_modified, resolution, detected_at, resolved_at \
                 FROM conflicts WHERE resource_type = ?1 AND resource_id = ?2",
                params![key.resource_type, key.id],
                map_conflict,
            )
            .optional()
            .map_err(DbError::from)?;
        Ok(conflict)
    }

    /// Unresolved conflicts, oldest first
    pub fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        Ok(self.db.query(
            "SELECT resource_type, resource_id, local_version, remote_version, local_payload, \
             remote_payload, remote_deleted, remote_modified, resolution, detected_at, resolved_at \
             FROM conflicts WHERE resolution = 'pending' ORDER BY detected_at ASC",
            [],
            map_conflict,
        )?)
    }

    /// Atomically record the outcome of a resolution: the conflict row goes,
    /// the record is rewritten (or purged when `record` is None)
    pub fn commit_resolution(&self, key: &ResourceKey, record: Option<&LocalResourceRecord>) -> StoreResult<()> {
        self.db.transaction(|tx| {
            tx.execute(
                "DELETE FROM conflicts WHERE resource_type = ?1 AND resource_id = ?2",
                params![key.resource_type, key.id],
            )?;
            match record {
                Some(record) => put_record(tx, record)?,
                None => {
                    purge_record(tx, key)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sync operations
    // ------------------------------------------------------------------------

    /// Record the live operation for a key, replacing any older one
    pub fn put_operation(&self, op: &SyncOperation) -> StoreResult<()> {
        let payload = op
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        self.db.execute(
            r#"
            INSERT INTO sync_operations (
                id, resource_type, resource_id, operation, payload, base_version,
                local_version, enqueued_at, status, retry_count, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(resource_type, resource_id) DO UPDATE SET
                id = excluded.id,
                operation = excluded.operation,
                payload = excluded.payload,
                base_version = excluded.base_version,
                local_version = excluded.local_version,
                enqueued_at = excluded.enqueued_at,
                status = excluded.status,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error
            "#,
            params![
                op.id,
                op.resource_type,
                op.resource_id,
                op.operation.as_str(),
                payload,
                op.base_version,
                op.local_version,
                fmt_ts(&op.enqueued_at),
                op.status.as_str(),
                op.retry_count,
                op.last_error,
            ],
        )?;
        Ok(())
    }

    pub fn get_operation(&self, key: &ResourceKey) -> StoreResult<Option<SyncOperation>> {
        let ops = self.db.query(
            "SELECT id, resource_type, resource_id, operation, payload, base_version, local_version, \
             enqueued_at, status, retry_count, last_error \
             FROM sync_operations WHERE resource_type = ?1 AND resource_id = ?2",
            params![key.resource_type, key.id],
            map_operation,
        )?;
        Ok(ops.into_iter().next())
    }

    pub fn list_operations(&self) -> StoreResult<Vec<SyncOperation>> {
        Ok(self.db.query(
            "SELECT id, resource_type, resource_id, operation, payload, base_version, local_version, \
             enqueued_at, status, retry_count, last_error \
             FROM sync_operations ORDER BY enqueued_at ASC",
            [],
            map_operation,
        )?)
    }

    pub fn delete_operation(&self, key: &ResourceKey) -> StoreResult<()> {
        self.db.execute(
            "DELETE FROM sync_operations WHERE resource_type = ?1 AND resource_id = ?2",
            params![key.resource_type, key.id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pull checkpoint
    // ------------------------------------------------------------------------

    pub fn checkpoint(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.db.get_setting(CHECKPOINT_KEY)?)
    }

    /// Apply one pulled page; the checkpoint only moves if every write lands
    pub fn apply_pull_batch(&self, batch: &PullBatch) -> StoreResult<()> {
        self.db.transaction(|tx| {
            for record in &batch.upserts {
                put_record(tx, record)?;
            }
            for key in &batch.purges {
                purge_record(tx, key)?;
            }
            for conflict in &batch.conflicts {
                put_conflict(tx, conflict)?;
            }
            if let Some(checkpoint) = &batch.checkpoint {
                set_setting_on(tx, CHECKPOINT_KEY, checkpoint)?;
            }
            Ok(())
        })?;

        log::info!(
            "Applied pull batch: {} upserts, {} purges, {} conflicts (checkpoint {:?})",
            batch.upserts.len(),
            batch.purges.len(),
            batch.conflicts.len(),
            batch.checkpoint
        );
        Ok(())
    }
}

// ============================================================================
// SQL helpers (usable inside transactions)
// ============================================================================

/// Fixed-width UTC timestamps so text comparison matches time order
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn prefixed_columns(alias: &str) -> String {
    RECORD_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn put_record(conn: &Connection, record: &LocalResourceRecord) -> Result<(), DbError> {
    let envelope = serde_json::to_string(&record.envelope)
        .map_err(|e| DbError::Serialization(e.to_string()))?;

    conn.execute(
        r#"
        INSERT INTO resources (
            resource_type, id, envelope, envelope_bytes, local_version, remote_version,
            sync_status, deleted, urgent, last_modified
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(resource_type, id) DO UPDATE SET
            envelope = excluded.envelope,
            envelope_bytes = excluded.envelope_bytes,
            local_version = excluded.local_version,
            remote_version = excluded.remote_version,
            sync_status = excluded.sync_status,
            deleted = excluded.deleted,
            urgent = excluded.urgent,
            last_modified = excluded.last_modified
        "#,
        params![
            record.resource_type,
            record.id,
            envelope,
            record.envelope.byte_len() as i64,
            record.local_version,
            record.remote_version,
            record.sync_status.as_str(),
            record.deleted,
            record.urgent,
            fmt_ts(&record.last_modified),
        ],
    )?;
    Ok(())
}

fn get_record(conn: &Connection, resource_type: &str, id: &str) -> StoreResult<Option<LocalResourceRecord>> {
    let sql = format!("SELECT {} FROM resources WHERE resource_type = ?1 AND id = ?2", RECORD_COLUMNS);
    let record = conn
        .query_row(&sql, params![resource_type, id], map_record)
        .optional()
        .map_err(DbError::from)?;
    Ok(record)
}

fn purge_record(conn: &Connection, key: &ResourceKey) -> Result<bool, DbError> {
    conn.execute(
        "DELETE FROM search_index WHERE resource_type = ?1 AND id = ?2",
        params![key.resource_type, key.id],
    )?;
    conn.execute(
        "DELETE FROM sync_operations WHERE resource_type = ?1 AND resource_id = ?2",
        params![key.resource_type, key.id],
    )?;
    let removed = conn.execute(
        "DELETE FROM resources WHERE resource_type = ?1 AND id = ?2",
        params![key.resource_type, key.id],
    )?;
    Ok(removed > 0)
}

fn put_conflict(conn: &Connection, conflict: &ConflictRecord) -> Result<(), DbError> {
    let local = serde_json::to_string(&conflict.local_payload)
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    let remote = conflict
        .remote_payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DbError::Serialization(e.to_string()))?;

    conn.execute(
        r#"
        INSERT OR REPLACE INTO conflicts (
            resource_type, resource_id, local_version, remote_version, local_payload,
            remote_payload, remote_deleted, remote_modified, resolution, detected_at, resolved_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            conflict.resource_type,
            conflict.resource_id,
            conflict.local_version,
            conflict.remote_version,
            local,
            remote,
            conflict.remote_deleted,
            conflict.remote_modified.as_ref().map(fmt_ts),
            conflict.resolution.as_str(),
            fmt_ts(&conflict.detected_at),
            conflict.resolved_at.as_ref().map(fmt_ts),
        ],
    )?;
    Ok(())
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_envelope(idx: usize, raw: &str) -> rusqlite::Result<EncryptedEnvelope> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<LocalResourceRecord> {
    let status: String = row.get(5)?;
    Ok(LocalResourceRecord {
        resource_type: row.get(0)?,
        id: row.get(1)?,
        envelope: parse_envelope(2, &row.get::<_, String>(2)?)?,
        local_version: row.get(3)?,
        remote_version: row.get(4)?,
        sync_status: SyncStatus::parse(&status).ok_or(rusqlite::Error::InvalidColumnType(
            5,
            "sync_status".to_string(),
            Type::Text,
        ))?,
        deleted: row.get(6)?,
        urgent: row.get(7)?,
        last_modified: parse_ts(8, &row.get::<_, String>(8)?)?,
    })
}

fn map_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    Ok(ConflictRecord {
        resource_type: row.get(0)?,
        resource_id: row.get(1)?,
        local_version: row.get(2)?,
        remote_version: row.get(3)?,
        local_payload: parse_envelope(4, &row.get::<_, String>(4)?)?,
        remote_payload: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_envelope(5, &raw))
            .transpose()?,
        remote_deleted: row.get(6)?,
        remote_modified: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_ts(7, &raw))
            .transpose()?,
        resolution: Resolution::parse(&row.get::<_, String>(8)?),
        detected_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        resolved_at: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_ts(10, &raw))
            .transpose()?,
    })
}

fn map_operation(row: &Row<'_>) -> rusqlite::Result<SyncOperation> {
    let kind: String = row.get(3)?;
    Ok(SyncOperation {
        id: row.get(0)?,
        resource_type: row.get(1)?,
        resource_id: row.get(2)?,
        operation: OperationKind::parse(&kind).ok_or(rusqlite::Error::InvalidColumnType(
            3,
            "operation".to_string(),
            Type::Text,
        ))?,
        payload: row
            .get::<_, Option<String>>(4)?
            .map(|raw| parse_envelope(4, &raw))
            .transpose()?,
        base_version: row.get(5)?,
        local_version: row.get(6)?,
        enqueued_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        status: OperationStatus::parse(&row.get::<_, String>(8)?),
        retry_count: row.get(9)?,
        last_error: row.get(10)?,
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StorageError>;

// ============================================================================
// Tests
// ============================================================================
