//! Sync Data Models
//!
//! Defines the structures shared by the store, retry queue and engine:
//! - ResourceKey: `(resourceType, id)` identity of a clinical resource
//! - EncryptedEnvelope: at-rest representation of a payload
//! - LocalResourceRecord: one row of the local replica
//! - SyncOperation: a pending push owned by the engine
//! - ConflictRecord: divergence awaiting resolution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Resource Identity
// ============================================================================

/// Composite primary key of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

// ============================================================================
// Encrypted Envelope
// ============================================================================

/// Current envelope schema
pub const ENVELOPE_VERSION: u32 = 1;

/// Encrypted payload as stored locally
///
/// `iv` and `salt` are fresh per encryption call. `version` is the envelope
/// schema, not the clinical version of the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// base64 AES-256-GCM ciphertext with appended tag
    pub ciphertext: String,
    /// base64 96-bit nonce
    pub iv: String,
    /// base64 per-envelope HKDF salt
    pub salt: String,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
}

impl EncryptedEnvelope {
    /// Approximate at-rest size, used for store statistics
    pub fn byte_len(&self) -> usize {
        self.ciphertext.len() + self.iv.len() + self.salt.len()
    }
}

// ============================================================================
// Sync Status (per-resource state machine)
// ============================================================================

/// Persisted sync status of a resource
///
/// Maps onto the engine's state machine:
/// `Synced -> Pending (locally modified) -> Syncing (pushing) -> {Synced | Conflict | Error}`,
/// `Error -> Pending` after a manual retry, `Conflict -> Synced` once resolved.
/// `Pending -> Error` covers a push whose retry budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Syncing,
    Conflict,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(Self::Synced),
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "conflict" => Some(Self::Conflict),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Allowed transitions of the per-resource state machine
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Synced, Pending)
                | (Synced, Synced)
                | (Pending, Pending)
                | (Pending, Syncing)
                | (Pending, Conflict)
                | (Pending, Error)
                | (Syncing, Synced)
                | (Syncing, Pending)
                | (Syncing, Conflict)
                | (Syncing, Error)
                | (Error, Pending)
                | (Error, Conflict)
                | (Conflict, Synced)
                | (Conflict, Pending)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Local Resource Record
// ============================================================================

/// One row of the local replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalResourceRecord {
    pub resource_type: String,
    pub id: String,
    pub envelope: EncryptedEnvelope,
    /// Bumped on every local mutation
    pub local_version: i64,
    /// None until the server has acknowledged the resource once
    pub remote_version: Option<i64>,
    pub sync_status: SyncStatus,
    /// Tombstone marker, kept until the deletion is confirmed
    pub deleted: bool,
    /// Clinically urgent resources push at high priority
    pub urgent: bool,
    pub last_modified: DateTime<Utc>,
}

impl LocalResourceRecord {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.id)
    }
}

// ============================================================================
// Sync Operation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    InFlight,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_flight" => Self::InFlight,
            "failed" => Self::Failed,
            _ => Self::Queued,
        }
    }
}

/// A local mutation awaiting server acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: OperationKind,
    /// Envelope being pushed; None for deletes
    pub payload: Option<EncryptedEnvelope>,
    /// Optimistic-concurrency precondition (last observed remote version)
    pub base_version: Option<i64>,
    /// Local version this operation carries
    pub local_version: i64,
    pub enqueued_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Build the push for the record's current state
    pub fn for_record(record: &LocalResourceRecord) -> Self {
        let operation = if record.deleted {
            OperationKind::Delete
        } else if record.remote_version.is_none() {
            OperationKind::Create
        } else {
            OperationKind::Update
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource_type: record.resource_type.clone(),
            resource_id: record.id.clone(),
            operation,
            payload: (!record.deleted).then(|| record.envelope.clone()),
            base_version: record.remote_version,
            local_version: record.local_version,
            enqueued_at: Utc::now(),
            status: OperationStatus::Queued,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.resource_id)
    }
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// How conflicts are settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Caller must call `resolve`
    Manual,

    /// Newer `last_modified` wins automatically
    LastWriterWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Pending,
    Local,
    Remote,
    Merged,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "local" => Self::Local,
            "remote" => Self::Remote,
            "merged" => Self::Merged,
            _ => Self::Pending,
        }
    }
}

/// Caller's decision for a pending conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionChoice {
    Local,
    Remote,
    Merged(serde_json::Value),
}

/// Local and remote versions of a diverged resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub resource_type: String,
    pub resource_id: String,
    pub local_version: i64,
    /// None when the server copy could not be fetched
    pub remote_version: Option<i64>,
    pub local_payload: EncryptedEnvelope,
    /// None when the server side deleted the resource
    pub remote_payload: Option<EncryptedEnvelope>,
    pub remote_deleted: bool,
    pub remote_modified: Option<DateTime<Utc>>,
    pub resolution: Resolution,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.resource_id)
    }
}

// ============================================================================
// Retry Priority
// ============================================================================

/// Queue priority; higher drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

// ============================================================================
// Engine Events
// ============================================================================

/// Notifications published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged {
        key: ResourceKey,
        status: SyncStatus,
    },
    ConflictDetected {
        key: ResourceKey,
        local_version: i64,
        remote_version: Option<i64>,
    },
    ConflictResolved {
        key: ResourceKey,
        resolution: Resolution,
    },
    /// Terminal failure surfaced to the caller with a readable reason
    OperationFailed {
        key: ResourceKey,
        reason: String,
    },
    PullCompleted {
        applied: usize,
        conflicts: usize,
        checkpoint: Option<DateTime<Utc>>,
    },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> LocalResourceRecord {
        LocalResourceRecord {
            resource_type: "Patient".to_string(),
            id: "42".to_string(),
            envelope: EncryptedEnvelope {
                ciphertext: "AAAA".to_string(),
                iv: "BBBB".to_string(),
                salt: "CCCC".to_string(),
                timestamp: Utc::now(),
                version: ENVELOPE_VERSION,
            },
            local_version: 3,
            remote_version: Some(2),
            sync_status: SyncStatus::Pending,
            deleted: false,
            urgent: false,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_resource_key_display() {
        assert_eq!(ResourceKey::new("Patient", "42").to_string(), "Patient/42");
    }

    #[test]
    fn test_sync_status_strings() {
        for status in [
            SyncStatus::Synced,
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Conflict,
            SyncStatus::Error,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("bogus"), None);
    }

    #[test]
    fn test_state_machine_transitions() {
        assert!(SyncStatus::Synced.can_transition_to(SyncStatus::Pending));
        assert!(SyncStatus::Pending.can_transition_to(SyncStatus::Syncing));
        assert!(SyncStatus::Syncing.can_transition_to(SyncStatus::Conflict));
        assert!(SyncStatus::Error.can_transition_to(SyncStatus::Pending));
        assert!(SyncStatus::Conflict.can_transition_to(SyncStatus::Synced));

        assert!(!SyncStatus::Synced.can_transition_to(SyncStatus::Syncing));
        assert!(!SyncStatus::Conflict.can_transition_to(SyncStatus::Syncing));
        assert!(!SyncStatus::Error.can_transition_to(SyncStatus::Synced));
    }

    #[test]
    fn test_operation_for_record() {
        let mut record = sample_record();

        let op = SyncOperation::for_record(&record);
        assert_eq!(op.operation, OperationKind::Update);
        assert_eq!(op.base_version, Some(2));
        assert_eq!(op.local_version, 3);
        assert!(op.payload.is_some());

        record.remote_version = None;
        assert_eq!(SyncOperation::for_record(&record).operation, OperationKind::Create);

        record.deleted = true;
        let delete = SyncOperation::for_record(&record);
        assert_eq!(delete.operation, OperationKind::Delete);
        assert!(delete.payload.is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_record_serialization() {
        let record = sample_record();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"sync_status\":\"pending\""));
        let back: LocalResourceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
