//! Sync Module - Offline-first clinical resource synchronization
//!
//! Provides encrypted local storage and background sync for:
//! - FHIR-style resources keyed by `(resource_type, id)`
//! - Push of local writes with optimistic version checks
//! - Pull of the server change feed with a persisted checkpoint
//!
//! Architecture:
//! - Encryption at rest: AES-256-GCM with a PBKDF2-derived per-user key
//! - Retry queue: exponential backoff with jitter, single-flight drain
//! - Conflict Resolution: manual (local/remote/merged) or last writer wins

pub mod api;
pub mod crypto;
pub mod engine;
pub mod models;
pub mod network;
pub mod queue;
pub mod scheduler;
pub mod store;


// Re-export commonly used types
pub use api::{ApiError, ChangePage, FhirApiClient, PushAck, RemoteResource, RemoteServer};
pub use crypto::{CryptoError, CryptoService, FieldKey};
pub use engine::{ConflictDetails, EngineStats, PullSummary, SaveOptions, SyncEngine, SyncEngineError};
pub use models::{
    ConflictRecord, ConflictStrategy, EncryptedEnvelope, LocalResourceRecord, OperationKind,
    OperationStatus, Priority, Resolution, ResolutionChoice, ResourceKey, SyncEvent, SyncOperation,
    SyncStatus,
};
pub use network::{ConnectionQuality, NetworkEvent, NetworkMonitor, NetworkStatus};
pub use queue::{
    ActionOutcome, DrainReport, FailureOutcome, QueueError, QueueStats, RetryAction, RetryQueue,
    RetryQueueItem,
};
pub use scheduler::{SchedulerError, SyncScheduler};
pub use store::{ResourceFilter, ResourceStore, StorageError, StoreStats};
