//! Sync Engine - Orchestrates offline-first resource synchronization
//!
//! Coordinates the local store, crypto service, retry queue, network
//! monitor and remote server. Handles:
//! - Local writes (encrypt, persist, enqueue push)
//! - Push reconciliation (new version, conflict, retry, failure)
//! - Pull of the change feed with crash-safe checkpointing
//! - Conflict capture and resolution (manual or last-writer-wins)
//! - Startup recovery, manual retry and cancellation
//!
//! Every read-modify-write of a record runs under one short mutation
//! lock that is never held across an await. Network work only happens
//! inside a single-flight queue drain, so each key has at most one
//! round-trip in flight.

use super::api::{ApiError, PushAck, RemoteResource, RemoteServer};
use super::crypto::{CryptoError, CryptoService};
use super::models::{
    ConflictRecord, ConflictStrategy, LocalResourceRecord, OperationKind, OperationStatus,
    Priority, Resolution, ResolutionChoice, ResourceKey, SyncEvent, SyncOperation, SyncStatus,
};
use super::network::NetworkMonitor;
use super::queue::{
    ActionOutcome, DrainReport, QueueError, QueueStats, RetryAction, RetryQueue, RetryQueueItem,
};
use super::store::{PullBatch, ResourceFilter, ResourceStore, StorageError, StoreStats};
use crate::config::EngineConfig;
use crate::db::Database;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Data Types
// ============================================================================

/// Options for a local write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOptions {
    /// Push at high priority
    pub urgent: bool,
    /// `(field, plaintext value)` pairs stored as blind-index hashes
    pub search_terms: Vec<(String, String)>,
}

impl SaveOptions {
    pub fn urgent() -> Self {
        Self {
            urgent: true,
            ..Self::default()
        }
    }

    pub fn with_term(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.search_terms.push((field.into(), value.into()));
        self
    }
}

/// Outcome of one pull pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullSummary {
    pub pages: usize,
    pub applied: usize,
    pub purged: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub checkpoint: Option<DateTime<Utc>>,
}

/// A conflict with both sides decrypted for display
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDetails {
    pub conflict: ConflictRecord,
    /// None when the local side is a deletion
    pub local: Option<Value>,
    /// None when the server deleted the resource or it could not be fetched
    pub remote: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub store: StoreStats,
    pub queue: QueueStats,
    pub checkpoint: Option<DateTime<Utc>>,
}

enum PushPlan {
    Skip(ActionOutcome),
    Send { op: SyncOperation, body: Option<Value> },
}

/// Pull-page view of a key: staged record (None = purged) over the store
type Staged = HashMap<ResourceKey, Option<LocalResourceRecord>>;

// ============================================================================
// Sync Engine
// ============================================================================

pub struct SyncEngine {
    config: EngineConfig,
    store: ResourceStore,
    crypto: Arc<CryptoService>,
    remote: Arc<dyn RemoteServer>,
    queue: Arc<RetryQueue>,
    network: NetworkMonitor,
    events: broadcast::Sender<SyncEvent>,
    mutation: StdMutex<()>,
}

impl SyncEngine {
    /// Build an engine over an opened database and an initialized crypto service
    pub fn new(
        config: EngineConfig,
        db: Arc<Database>,
        crypto: Arc<CryptoService>,
        remote: Arc<dyn RemoteServer>,
        network: NetworkMonitor,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = Arc::new(RetryQueue::new(config.retry.clone()));

        Self {
            config,
            store: ResourceStore::new(db),
            crypto,
            remote,
            queue,
            network,
            events,
            mutation: StdMutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Status changes, conflicts, failures and pull completions
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Local Operations
    // ========================================================================

    /// Encrypt and persist a local write, then enqueue its push
    pub fn save(
        &self,
        resource_type: &str,
        id: &str,
        resource: &Value,
        options: SaveOptions,
    ) -> Result<LocalResourceRecord, SyncEngineError> {
        let key = ResourceKey::new(resource_type, id);
        validate_resource(&key, resource)?;

        let record = {
            let _guard = self.lock();
            let existing = self.store.get(resource_type, id)?;

            if let Some(existing) = &existing {
                if existing.sync_status == SyncStatus::Conflict {
                    return Err(SyncEngineError::UnresolvedConflict(key.to_string()));
                }
            }

            let envelope = self.crypto.encrypt(resource)?;
            let terms = options
                .search_terms
                .iter()
                .map(|(field, value)| Ok((field.clone(), self.crypto.hash_for_search(value)?)))
                .collect::<Result<Vec<_>, CryptoError>>()?;

            let record = match existing {
                Some(mut record) => {
                    transition(&mut record, SyncStatus::Pending)?;
                    record.envelope = envelope;
                    record.local_version += 1;
                    record.deleted = false;
                    record.urgent = options.urgent;
                    record.last_modified = Utc::now();
                    record
                }
                None => LocalResourceRecord {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                    envelope,
                    local_version: 1,
                    remote_version: None,
                    sync_status: SyncStatus::Pending,
                    deleted: false,
                    urgent: options.urgent,
                    last_modified: Utc::now(),
                },
            };

            self.store.put_with_terms(&record, &terms)?;
            self.record_operation(&record)?;
            record
        };

        log::info!("Saved {} locally (v{})", key, record.local_version);
        self.enqueue_push(&key, record.urgent);
        self.emit(SyncEvent::StatusChanged {
            key,
            status: SyncStatus::Pending,
        });
        Ok(record)
    }

    /// Decrypted resource, None if absent or deleted
    pub fn get(&self, resource_type: &str, id: &str) -> Result<Option<Value>, SyncEngineError> {
        match self.store.get(resource_type, id)? {
            Some(record) if !record.deleted => Ok(Some(self.crypto.decrypt(&record.envelope)?)),
            _ => Ok(None),
        }
    }

    /// Raw record including index metadata
    pub fn record(&self, resource_type: &str, id: &str) -> Result<Option<LocalResourceRecord>, SyncEngineError> {
        Ok(self.store.get(resource_type, id)?)
    }

    pub fn status(&self, resource_type: &str, id: &str) -> Result<Option<SyncStatus>, SyncEngineError> {
        Ok(self.store.get(resource_type, id)?.map(|r| r.sync_status))
    }

    pub fn query(&self, resource_type: &str, filter: &ResourceFilter) -> Result<Vec<LocalResourceRecord>, SyncEngineError> {
        Ok(self.store.query(resource_type, filter)?)
    }

    /// Equality search through the blind index; returns decrypted resources
    pub fn find_by_index(&self, resource_type: &str, field: &str, value: &str) -> Result<Vec<Value>, SyncEngineError> {
        let hash = self.crypto.hash_for_search(value)?;
        let records = self
            .store
            .query(resource_type, &ResourceFilter::with_index(field, hash))?;

        records
            .iter()
            .map(|record| self.crypto.decrypt(&record.envelope).map_err(SyncEngineError::from))
            .collect()
    }

    /// Delete a resource; goes through the sync lifecycle as a tombstone
    pub fn delete(&self, resource_type: &str, id: &str) -> Result<(), SyncEngineError> {
        let key = ResourceKey::new(resource_type, id);

        let tombstone = {
            let _guard = self.lock();
            let mut record = self
                .store
                .get(resource_type, id)?
                .ok_or_else(|| SyncEngineError::NotFound(key.to_string()))?;

            if record.sync_status == SyncStatus::Conflict {
                return Err(SyncEngineError::UnresolvedConflict(key.to_string()));
            }

            let push_id = push_item_id(&key);
            if record.remote_version.is_none() && !self.queue.is_in_flight(&push_id) {
                // never reached the server
                self.queue.cancel(&push_id);
                self.store.delete(resource_type, id)?;
                None
            } else {
                transition(&mut record, SyncStatus::Pending)?;
                record.deleted = true;
                record.local_version += 1;
                record.last_modified = Utc::now();
                self.store.put(&record)?;
                self.store.set_search_terms(&key, &[])?;
                self.record_operation(&record)?;
                Some(record)
            }
        };

        match tombstone {
            Some(record) => {
                log::info!("Deleted {} locally (tombstone v{})", key, record.local_version);
                self.enqueue_push(&key, record.urgent);
                self.emit(SyncEvent::StatusChanged {
                    key,
                    status: SyncStatus::Pending,
                });
            }
            None => log::info!("Deleted unsynced {} locally", key),
        }
        Ok(())
    }

    /// Live sync operations, oldest first
    pub fn pending_operations(&self) -> Result<Vec<SyncOperation>, SyncEngineError> {
        Ok(self.store.list_operations()?)
    }

    pub fn stats(&self) -> Result<EngineStats, SyncEngineError> {
        Ok(EngineStats {
            store: self.store.stats()?,
            queue: self.queue.stats(),
            checkpoint: self.store.checkpoint()?,
        })
    }

    // ========================================================================
    // Queue Control
    // ========================================================================

    /// Re-enqueue interrupted work after a restart
    ///
    /// `syncing` records go back to `pending`; every `pending` and `error`
    /// record is enqueued with a fresh retry budget.
    pub fn recover(&self) -> Result<usize, SyncEngineError> {
        let recovered = {
            let _guard = self.lock();
            let records = self.store.records_with_status(&[
                SyncStatus::Syncing,
                SyncStatus::Pending,
                SyncStatus::Error,
            ])?;

            let mut recovered = Vec::with_capacity(records.len());
            for mut record in records {
                if record.sync_status != SyncStatus::Pending {
                    log::info!("Recovering {} from {}", record.key(), record.sync_status);
                    record.sync_status = SyncStatus::Pending;
                    self.store.put(&record)?;
                }
                self.record_operation(&record)?;
                recovered.push((record.key(), record.urgent));
            }
            recovered
        };

        for (key, urgent) in &recovered {
            self.enqueue_push(key, *urgent);
        }
        if !recovered.is_empty() {
            log::info!("Recovered {} unsynced resources", recovered.len());
        }
        Ok(recovered.len())
    }

    /// Move an `error` record back to `pending` with a fresh retry budget
    pub fn retry(&self, resource_type: &str, id: &str) -> Result<(), SyncEngineError> {
        let key = ResourceKey::new(resource_type, id);

        let urgent = {
            let _guard = self.lock();
            let mut record = self
                .store
                .get(resource_type, id)?
                .ok_or_else(|| SyncEngineError::NotFound(key.to_string()))?;

            if record.sync_status != SyncStatus::Error {
                return Err(SyncEngineError::InvalidTransition {
                    key: key.to_string(),
                    from: record.sync_status,
                    to: SyncStatus::Pending,
                });
            }
            transition(&mut record, SyncStatus::Pending)?;
            self.store.put(&record)?;
            self.record_operation(&record)?;
            record.urgent
        };

        log::info!("Manual retry of {}", key);
        self.enqueue_push(&key, urgent);
        self.emit(SyncEvent::StatusChanged {
            key,
            status: SyncStatus::Pending,
        });
        Ok(())
    }

    /// Remove a not-yet-started push; returns false if none was waiting
    ///
    /// A push already on the wire runs to completion. The record keeps its
    /// status so `recover` or the next save picks it up again.
    pub fn cancel(&self, resource_type: &str, id: &str) -> bool {
        self.queue.cancel(&push_item_id(&ResourceKey::new(resource_type, id)))
    }

    /// Enqueue a pull of the change feed
    pub fn request_pull(&self) {
        let item = RetryQueueItem::new(RetryAction::Pull, Priority::Normal, self.config.retry.max_retries);
        self.queue.enqueue(item);
    }

    /// Run one single-flight drain; a no-op while offline or already draining
    pub async fn process_queue(&self) -> Result<Option<DrainReport>, SyncEngineError> {
        if !self.network.is_online() {
            log::debug!("Offline, leaving {} queued items", self.queue.len());
            return Ok(None);
        }

        let report = match self.queue.drain(Utc::now(), |item| self.execute(item)).await {
            Some(report) => report,
            None => return Ok(None),
        };

        self.settle_exhausted(&report.exhausted);
        Ok(Some(report))
    }

    /// Move pushes whose retry budget ran out to `error`
    ///
    /// A storage failure on one item is logged and does not stop the rest.
    fn settle_exhausted(&self, exhausted: &[RetryQueueItem]) {
        for item in exhausted {
            let reason = format!(
                "gave up after {} attempts: {}",
                item.retry_count,
                item.last_error.as_deref().unwrap_or("unknown error")
            );
            match &item.action {
                RetryAction::Push { key } => {
                    if let Err(e) = self.fail_push(key, None, &reason) {
                        log::error!("Failed to record push failure for {}: {}", key, e);
                    }
                }
                RetryAction::Pull => log::error!("Pull {}", reason),
            }
        }
    }

    /// Pull, then push everything that is ready
    pub async fn sync_now(&self) -> Result<Option<DrainReport>, SyncEngineError> {
        self.request_pull();
        self.process_queue().await
    }

    /// Discard key material; the engine cannot encrypt or decrypt afterwards
    pub fn shutdown(&self) {
        let waiting = self.queue.len();
        self.crypto.clear();
        log::info!("Sync engine shut down ({} queued items left for recovery)", waiting);
    }

    async fn execute(&self, item: RetryQueueItem) -> ActionOutcome {
        match &item.action {
            RetryAction::Push { key } => self.execute_push(key, item.retry_count).await,
            RetryAction::Pull => match self.pull().await {
                Ok(_) => ActionOutcome::Ok,
                Err(SyncEngineError::Api(e)) if e.is_retryable() => ActionOutcome::Retryable(e.to_string()),
                Err(e) => {
                    log::error!("Pull failed: {}", e);
                    ActionOutcome::Fatal(e.to_string())
                }
            },
        }
    }

    // ========================================================================
    // Push
    // ========================================================================

    async fn execute_push(&self, key: &ResourceKey, attempt: u32) -> ActionOutcome {
        let (op, body) = match self.begin_push(key, attempt) {
            Ok(PushPlan::Send { op, body }) => (op, body),
            Ok(PushPlan::Skip(outcome)) => return outcome,
            Err(e) => {
                let reason = e.to_string();
                log::error!("Cannot push {}: {}", key, reason);
                if let Err(e) = self.fail_push(key, None, &reason) {
                    log::error!("Failed to record push failure for {}: {}", key, e);
                }
                return ActionOutcome::Fatal(reason);
            }
        };

        let result = self.with_timeout(self.remote.push(&op, body.as_ref())).await;

        let remote_copy = match &result {
            Err(ApiError::VersionConflict { .. }) => Some(self.with_timeout(self.remote.fetch(key)).await),
            _ => None,
        };

        match self.finish_push(key, &op, result, remote_copy) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Failed to reconcile push of {}: {}", key, e);
                ActionOutcome::Fatal(e.to_string())
            }
        }
    }

    /// Mark the record `syncing` and snapshot the operation to send
    fn begin_push(&self, key: &ResourceKey, attempt: u32) -> Result<PushPlan, SyncEngineError> {
        let _guard = self.lock();

        let mut record = match self.store.get(&key.resource_type, &key.id)? {
            Some(record) => record,
            None => return Ok(PushPlan::Skip(ActionOutcome::Ok)),
        };

        match record.sync_status {
            SyncStatus::Synced => return Ok(PushPlan::Skip(ActionOutcome::Ok)),
            SyncStatus::Conflict => {
                return Ok(PushPlan::Skip(ActionOutcome::Fatal(format!(
                    "{} has an unresolved conflict",
                    key
                ))))
            }
            SyncStatus::Error => {
                return Ok(PushPlan::Skip(ActionOutcome::Fatal(format!(
                    "{} needs a manual retry",
                    key
                ))))
            }
            SyncStatus::Pending | SyncStatus::Syncing => {}
        }

        let body = if record.deleted {
            None
        } else {
            Some(self.crypto.decrypt(&record.envelope)?)
        };

        if record.sync_status != SyncStatus::Syncing {
            transition(&mut record, SyncStatus::Syncing)?;
            self.store.put(&record)?;
        }

        let mut op = SyncOperation::for_record(&record);
        if let Some(existing) = self.store.get_operation(key)? {
            op.id = existing.id;
            op.enqueued_at = existing.enqueued_at;
        }
        op.status = OperationStatus::InFlight;
        op.retry_count = attempt;
        self.store.put_operation(&op)?;

        log::info!(
            "Pushing {} {} (local v{}, base {:?}, attempt {})",
            op.operation.as_str(),
            key,
            op.local_version,
            op.base_version,
            attempt + 1
        );
        self.emit(SyncEvent::StatusChanged {
            key: key.clone(),
            status: SyncStatus::Syncing,
        });
        Ok(PushPlan::Send { op, body })
    }

    fn finish_push(
        &self,
        key: &ResourceKey,
        op: &SyncOperation,
        result: Result<PushAck, ApiError>,
        remote_copy: Option<Result<Option<RemoteResource>, ApiError>>,
    ) -> Result<ActionOutcome, SyncEngineError> {
        match result {
            Ok(ack) => {
                self.complete_push(key, op, ack)?;
                Ok(ActionOutcome::Ok)
            }
            Err(ApiError::VersionConflict { remote_version }) => {
                let created = self.conflict_from_push(key, remote_version, remote_copy)?;
                if created {
                    self.auto_resolve(key)?;
                }
                Ok(ActionOutcome::Fatal(format!("version conflict on {}", key)))
            }
            Err(e) if e.is_retryable() => {
                self.requeue_push(key, op, &e.to_string())?;
                Ok(ActionOutcome::Retryable(e.to_string()))
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail_push(key, Some(op), &reason)?;
                Ok(ActionOutcome::Fatal(reason))
            }
        }
    }

    fn complete_push(&self, key: &ResourceKey, op: &SyncOperation, ack: PushAck) -> Result<(), SyncEngineError> {
        let reenqueue = {
            let _guard = self.lock();
            let mut record = match self.store.get(&key.resource_type, &key.id)? {
                Some(record) => record,
                None => return Ok(()),
            };

            record.remote_version = if op.operation == OperationKind::Delete {
                None
            } else {
                ack.version.or(record.remote_version)
            };

            if record.local_version != op.local_version {
                // written again while the push was on the wire
                log::info!(
                    "{} pushed v{} but is now v{}; pushing again",
                    key,
                    op.local_version,
                    record.local_version
                );
                self.store.put(&record)?;
                self.record_operation(&record)?;
                Some(record.urgent)
            } else if record.deleted {
                self.store.delete(&key.resource_type, &key.id)?;
                log::info!("Deletion of {} confirmed, tombstone purged", key);
                None
            } else {
                transition(&mut record, SyncStatus::Synced)?;
                self.store.put(&record)?;
                self.store.delete_operation(key)?;
                log::info!("{} synced at server version {:?}", key, record.remote_version);
                None
            }
        };

        match reenqueue {
            Some(urgent) => self.enqueue_push(key, urgent),
            None => self.emit(SyncEvent::StatusChanged {
                key: key.clone(),
                status: SyncStatus::Synced,
            }),
        }
        Ok(())
    }

    /// Returns whether a new conflict was recorded
    fn conflict_from_push(
        &self,
        key: &ResourceKey,
        remote_version: Option<i64>,
        remote_copy: Option<Result<Option<RemoteResource>, ApiError>>,
    ) -> Result<bool, SyncEngineError> {
        let conflict = {
            let _guard = self.lock();
            let mut record = match self.store.get(&key.resource_type, &key.id)? {
                Some(record) => record,
                None => return Ok(false),
            };

            let (remote_version, remote_payload, remote_deleted, remote_modified) = match remote_copy {
                Some(Ok(Some(remote))) => (
                    Some(remote.version),
                    remote.resource.as_ref().map(|r| self.crypto.encrypt(r)).transpose()?,
                    remote.deleted,
                    Some(remote.last_modified),
                ),
                Some(Ok(None)) => (remote_version, None, true, None),
                Some(Err(e)) => {
                    log::warn!("Could not fetch server copy of {}: {}", key, e);
                    (remote_version, None, false, None)
                }
                None => (remote_version, None, false, None),
            };

            let conflict = ConflictRecord {
                resource_type: key.resource_type.clone(),
                resource_id: key.id.clone(),
                local_version: record.local_version,
                remote_version,
                local_payload: record.envelope.clone(),
                remote_payload,
                remote_deleted,
                remote_modified,
                resolution: Resolution::Pending,
                detected_at: Utc::now(),
                resolved_at: None,
            };

            transition(&mut record, SyncStatus::Conflict)?;
            self.store.put(&record)?;
            self.store.put_conflict(&conflict)?;
            self.store.delete_operation(key)?;
            self.queue.cancel(&push_item_id(key));
            conflict
        };

        log::warn!(
            "Conflict on {}: local v{} vs server {:?}",
            key,
            conflict.local_version,
            conflict.remote_version
        );
        self.emit_conflict(&conflict);
        Ok(true)
    }

    fn requeue_push(&self, key: &ResourceKey, op: &SyncOperation, reason: &str) -> Result<(), SyncEngineError> {
        let _guard = self.lock();

        if let Some(mut record) = self.store.get(&key.resource_type, &key.id)? {
            if record.sync_status == SyncStatus::Syncing {
                transition(&mut record, SyncStatus::Pending)?;
                self.store.put(&record)?;
            }
        }

        let mut op = op.clone();
        op.status = OperationStatus::Queued;
        op.retry_count += 1;
        op.last_error = Some(reason.to_string());
        self.store.put_operation(&op)?;

        log::warn!("Push of {} failed, will retry: {}", key, reason);
        self.emit(SyncEvent::StatusChanged {
            key: key.clone(),
            status: SyncStatus::Pending,
        });
        Ok(())
    }

    /// Terminal push failure: the record moves to `error` unless a newer
    /// local write is already waiting for its own attempt
    fn fail_push(&self, key: &ResourceKey, op: Option<&SyncOperation>, reason: &str) -> Result<(), SyncEngineError> {
        let status = {
            let _guard = self.lock();
            let mut record = match self.store.get(&key.resource_type, &key.id)? {
                Some(record) => record,
                None => return Ok(()),
            };

            let superseded = op.is_some_and(|op| op.local_version != record.local_version);
            if !superseded && record.sync_status.can_transition_to(SyncStatus::Error) {
                record.sync_status = SyncStatus::Error;
                self.store.put(&record)?;

                let mut failed = match op {
                    Some(op) => op.clone(),
                    None => self
                        .store
                        .get_operation(key)?
                        .unwrap_or_else(|| SyncOperation::for_record(&record)),
                };
                failed.status = OperationStatus::Failed;
                failed.last_error = Some(reason.to_string());
                self.store.put_operation(&failed)?;
            } else if record.sync_status == SyncStatus::Syncing {
                transition(&mut record, SyncStatus::Pending)?;
                self.store.put(&record)?;
            }
            record.sync_status
        };

        log::error!("Push of {} failed permanently: {}", key, reason);
        self.emit(SyncEvent::StatusChanged {
            key: key.clone(),
            status,
        });
        self.emit(SyncEvent::OperationFailed {
            key: key.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Pull
    // ========================================================================

    /// Fetch and merge the change feed since the stored checkpoint
    ///
    /// Each page is applied in one transaction together with the advanced
    /// checkpoint; a failure mid-pull leaves the checkpoint at the last
    /// fully written page.
    pub async fn pull(&self) -> Result<PullSummary, SyncEngineError> {
        if !self.network.is_online() {
            return Err(SyncEngineError::Offline);
        }

        let status = self.network.current();
        let page_size = if status.reduced_data {
            (self.config.pull_page_size / 2).max(1)
        } else {
            self.config.pull_page_size
        };

        let mut summary = PullSummary {
            checkpoint: self.store.checkpoint()?,
            ..PullSummary::default()
        };
        let since = summary.checkpoint;
        let mut cursor: Option<String> = None;
        let mut new_conflicts = Vec::new();

        loop {
            let page = self
                .with_timeout(self.remote.pull(since, page_size, cursor.as_deref()))
                .await?;

            let conflicts = self.apply_page(&page.entries, &mut summary)?;
            summary.pages += 1;
            new_conflicts.extend(conflicts);

            match page.next {
                Some(next) if !page.entries.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        log::info!(
            "Pull complete: {} pages, {} applied, {} purged, {} skipped, {} conflicts",
            summary.pages,
            summary.applied,
            summary.purged,
            summary.skipped,
            summary.conflicts
        );
        self.emit(SyncEvent::PullCompleted {
            applied: summary.applied,
            conflicts: summary.conflicts,
            checkpoint: summary.checkpoint,
        });

        for key in &new_conflicts {
            self.auto_resolve(key)?;
        }
        Ok(summary)
    }

    /// Merge one page; returns keys that entered `conflict`
    fn apply_page(
        &self,
        entries: &[RemoteResource],
        summary: &mut PullSummary,
    ) -> Result<Vec<ResourceKey>, SyncEngineError> {
        let (batch, new_conflicts, detected) = {
            let _guard = self.lock();

            let mut staged: Staged = HashMap::new();
            let mut conflicts: HashMap<ResourceKey, ConflictRecord> = HashMap::new();
            let mut new_conflicts = Vec::new();
            let mut checkpoint = summary.checkpoint;

            for remote in entries {
                checkpoint = checkpoint.max(Some(remote.last_modified));

                if self.queue.is_in_flight(&push_item_id(&remote.key)) {
                    // the push outcome settles this key
                    summary.skipped += 1;
                    continue;
                }

                let local = match staged.get(&remote.key) {
                    Some(entry) => entry.clone(),
                    None => self.store.get(&remote.key.resource_type, &remote.key.id)?,
                };

                match local {
                    None => {
                        if remote.deleted {
                            summary.skipped += 1;
                            continue;
                        }
                        let record = self.pulled_record(remote, None)?;
                        staged.insert(remote.key.clone(), Some(record));
                        summary.applied += 1;
                    }
                    Some(local) if local.remote_version.is_some_and(|v| remote.version <= v) => {
                        summary.skipped += 1;
                    }
                    Some(local) if local.sync_status == SyncStatus::Synced => {
                        if remote.deleted {
                            staged.insert(remote.key.clone(), None);
                            summary.purged += 1;
                        } else {
                            let record = self.pulled_record(remote, Some(local))?;
                            staged.insert(remote.key.clone(), Some(record));
                            summary.applied += 1;
                        }
                    }
                    Some(local) if local.deleted && remote.deleted => {
                        // both sides deleted
                        staged.insert(remote.key.clone(), None);
                        self.queue.cancel(&push_item_id(&remote.key));
                        summary.purged += 1;
                    }
                    Some(local) if local.sync_status == SyncStatus::Conflict => {
                        let existing = match conflicts.remove(&remote.key) {
                            Some(conflict) => Some(conflict),
                            None => self.store.get_conflict(&remote.key)?,
                        };
                        let mut conflict = match existing {
                            Some(conflict) => conflict,
                            None => self.new_conflict(&local, remote)?,
                        };
                        if conflict.remote_version.map_or(true, |v| remote.version > v) {
                            self.set_remote_side(&mut conflict, remote)?;
                        }
                        conflicts.insert(remote.key.clone(), conflict);
                        summary.skipped += 1;
                    }
                    Some(mut local) => {
                        // pending, syncing or error: keep the local write
                        let conflict = self.new_conflict(&local, remote)?;
                        transition(&mut local, SyncStatus::Conflict)?;
                        self.queue.cancel(&push_item_id(&remote.key));
                        staged.insert(remote.key.clone(), Some(local));
                        conflicts.insert(remote.key.clone(), conflict);
                        new_conflicts.push(remote.key.clone());
                        summary.conflicts += 1;
                    }
                }
            }

            let mut batch = PullBatch {
                upserts: Vec::new(),
                purges: Vec::new(),
                conflicts: conflicts.into_values().collect(),
                checkpoint,
            };
            for (key, record) in staged {
                match record {
                    Some(record) => batch.upserts.push(record),
                    None => batch.purges.push(key),
                }
            }

            self.store.apply_pull_batch(&batch)?;
            for key in &new_conflicts {
                self.store.delete_operation(key)?;
            }
            summary.checkpoint = checkpoint;

            let detected: Vec<ConflictRecord> = batch
                .conflicts
                .iter()
                .filter(|c| new_conflicts.contains(&c.key()))
                .cloned()
                .collect();
            (batch, new_conflicts, detected)
        };

        for conflict in &detected {
            log::warn!(
                "Conflict on {} during pull: local v{} vs server {:?}",
                conflict.key(),
                conflict.local_version,
                conflict.remote_version
            );
            self.emit_conflict(conflict);
        }
        for record in &batch.upserts {
            if record.sync_status == SyncStatus::Synced {
                self.emit(SyncEvent::StatusChanged {
                    key: record.key(),
                    status: SyncStatus::Synced,
                });
            }
        }
        Ok(new_conflicts)
    }

    fn pulled_record(
        &self,
        remote: &RemoteResource,
        local: Option<LocalResourceRecord>,
    ) -> Result<LocalResourceRecord, SyncEngineError> {
        let resource = remote
            .resource
            .as_ref()
            .ok_or_else(|| SyncEngineError::InvalidResource(format!("{} has no body", remote.key)))?;
        let envelope = self.crypto.encrypt(resource)?;

        Ok(match local {
            Some(mut record) => {
                record.envelope = envelope;
                record.remote_version = Some(remote.version);
                record.sync_status = SyncStatus::Synced;
                record.deleted = false;
                record.last_modified = remote.last_modified;
                record
            }
            None => LocalResourceRecord {
                resource_type: remote.key.resource_type.clone(),
                id: remote.key.id.clone(),
                envelope,
                local_version: 0,
                remote_version: Some(remote.version),
                sync_status: SyncStatus::Synced,
                deleted: false,
                urgent: false,
                last_modified: remote.last_modified,
            },
        })
    }

    fn new_conflict(
        &self,
        local: &LocalResourceRecord,
        remote: &RemoteResource,
    ) -> Result<ConflictRecord, SyncEngineError> {
        let mut conflict = ConflictRecord {
            resource_type: local.resource_type.clone(),
            resource_id: local.id.clone(),
            local_version: local.local_version,
            remote_version: None,
            local_payload: local.envelope.clone(),
            remote_payload: None,
            remote_deleted: false,
            remote_modified: None,
            resolution: Resolution::Pending,
            detected_at: Utc::now(),
            resolved_at: None,
        };
        self.set_remote_side(&mut conflict, remote)?;
        Ok(conflict)
    }

    fn set_remote_side(&self, conflict: &mut ConflictRecord, remote: &RemoteResource) -> Result<(), SyncEngineError> {
        conflict.remote_version = Some(remote.version);
        conflict.remote_payload = remote
            .resource
            .as_ref()
            .map(|r| self.crypto.encrypt(r))
            .transpose()?;
        conflict.remote_deleted = remote.deleted;
        conflict.remote_modified = Some(remote.last_modified);
        Ok(())
    }

    // ========================================================================
    // Conflict Resolution
    // ========================================================================

    /// Unresolved conflicts, oldest first
    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>, SyncEngineError> {
        Ok(self.store.list_conflicts()?)
    }

    /// Both sides of a conflict, decrypted
    pub fn conflict_details(&self, resource_type: &str, id: &str) -> Result<Option<ConflictDetails>, SyncEngineError> {
        let key = ResourceKey::new(resource_type, id);
        let conflict = match self.store.get_conflict(&key)? {
            Some(conflict) => conflict,
            None => return Ok(None),
        };

        let local_deleted = self
            .store
            .get(resource_type, id)?
            .is_some_and(|record| record.deleted);
        let local = if local_deleted {
            None
        } else {
            Some(self.crypto.decrypt(&conflict.local_payload)?)
        };
        let remote = conflict
            .remote_payload
            .as_ref()
            .map(|envelope| self.crypto.decrypt(envelope))
            .transpose()?;

        Ok(Some(ConflictDetails { conflict, local, remote }))
    }

    /// Re-fetch the server side of a pending conflict
    ///
    /// A conflict detected while the server copy could not be fetched has no
    /// remote payload; `resolve(Remote)` needs this (or a later pull) first.
    pub async fn refresh_conflict(&self, resource_type: &str, id: &str) -> Result<(), SyncEngineError> {
        let key = ResourceKey::new(resource_type, id);
        if self.store.get_conflict(&key)?.is_none() {
            return Err(SyncEngineError::NoConflict(key.to_string()));
        }

        let remote = self.with_timeout(self.remote.fetch(&key)).await?;

        {
            let _guard = self.lock();
            let mut conflict = self
                .store
                .get_conflict(&key)?
                .ok_or_else(|| SyncEngineError::NoConflict(key.to_string()))?;
            match &remote {
                Some(remote) => self.set_remote_side(&mut conflict, remote)?,
                None => {
                    conflict.remote_payload = None;
                    conflict.remote_deleted = true;
                }
            }
            self.store.put_conflict(&conflict)?;
        }

        log::info!("Refreshed server side of conflict on {}", key);
        self.auto_resolve(&key)
    }

    /// Settle a pending conflict
    ///
    /// `Local` and `Merged` push a new local version against the server's
    /// current version; `Remote` adopts the server copy (or its deletion)
    /// and fails with `NotFound` while that copy is unknown.
    pub fn resolve(
        &self,
        resource_type: &str,
        id: &str,
        choice: ResolutionChoice,
    ) -> Result<SyncStatus, SyncEngineError> {
        let key = ResourceKey::new(resource_type, id);
        if let ResolutionChoice::Merged(merged) = &choice {
            validate_resource(&key, merged)?;
        }

        let (status, resolution, urgent) = {
            let _guard = self.lock();
            let conflict = self
                .store
                .get_conflict(&key)?
                .ok_or_else(|| SyncEngineError::NoConflict(key.to_string()))?;
            let mut record = self
                .store
                .get(resource_type, id)?
                .ok_or_else(|| SyncEngineError::NotFound(key.to_string()))?;

            let server_version = if conflict.remote_deleted {
                None
            } else {
                conflict.remote_version
            };

            let resolution = match &choice {
                ResolutionChoice::Local => {
                    transition(&mut record, SyncStatus::Pending)?;
                    record.remote_version = server_version;
                    record.local_version += 1;
                    record.last_modified = Utc::now();
                    self.store.commit_resolution(&key, Some(&record))?;
                    self.record_operation(&record)?;
                    Resolution::Local
                }
                ResolutionChoice::Merged(merged) => {
                    transition(&mut record, SyncStatus::Pending)?;
                    record.envelope = self.crypto.encrypt(merged)?;
                    record.remote_version = server_version;
                    record.local_version += 1;
                    record.deleted = false;
                    record.last_modified = Utc::now();
                    self.store.commit_resolution(&key, Some(&record))?;
                    self.record_operation(&record)?;
                    Resolution::Merged
                }
                ResolutionChoice::Remote => {
                    if conflict.remote_deleted {
                        self.store.commit_resolution(&key, None)?;
                    } else {
                        let envelope = conflict.remote_payload.clone().ok_or_else(|| {
                            SyncEngineError::NotFound(format!("server copy of {}", key))
                        })?;
                        transition(&mut record, SyncStatus::Synced)?;
                        record.envelope = envelope;
                        record.remote_version = conflict.remote_version;
                        record.deleted = false;
                        record.last_modified = conflict.remote_modified.unwrap_or_else(Utc::now);
                        self.store.commit_resolution(&key, Some(&record))?;
                        self.store.delete_operation(&key)?;
                    }
                    self.queue.cancel(&push_item_id(&key));
                    Resolution::Remote
                }
            };
            (record.sync_status, resolution, record.urgent)
        };

        log::info!("Resolved conflict on {} with {}", key, resolution.as_str());
        if status == SyncStatus::Pending {
            self.enqueue_push(&key, urgent);
        }
        self.emit(SyncEvent::ConflictResolved {
            key: key.clone(),
            resolution,
        });
        self.emit(SyncEvent::StatusChanged { key, status });
        Ok(status)
    }

    /// Last-writer-wins by timestamp, when configured
    fn auto_resolve(&self, key: &ResourceKey) -> Result<(), SyncEngineError> {
        if self.config.conflict_strategy != ConflictStrategy::LastWriterWins {
            return Ok(());
        }

        let conflict = match self.store.get_conflict(key)? {
            Some(conflict) => conflict,
            None => return Ok(()),
        };
        let local_modified = self
            .store
            .get(&key.resource_type, &key.id)?
            .map(|record| record.last_modified);

        let remote_usable = conflict.remote_deleted || conflict.remote_payload.is_some();
        let choice = match (conflict.remote_modified, local_modified) {
            (Some(remote), Some(local)) if remote_usable && remote > local => ResolutionChoice::Remote,
            _ => ResolutionChoice::Local,
        };

        log::info!("Auto-resolving {} as {:?} (last writer wins)", key, choice);
        self.resolve(&key.resource_type, &key.id, choice)?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_conflict(&self, conflict: &ConflictRecord) {
        self.emit(SyncEvent::ConflictDetected {
            key: conflict.key(),
            local_version: conflict.local_version,
            remote_version: conflict.remote_version,
        });
        self.emit(SyncEvent::StatusChanged {
            key: conflict.key(),
            status: SyncStatus::Conflict,
        });
    }

    /// Persist the live operation for the record's current state
    fn record_operation(&self, record: &LocalResourceRecord) -> Result<(), SyncEngineError> {
        let key = record.key();
        let mut op = SyncOperation::for_record(record);
        if let Some(existing) = self.store.get_operation(&key)? {
            op.id = existing.id;
            op.enqueued_at = existing.enqueued_at;
        }
        self.store.put_operation(&op)?;
        Ok(())
    }

    fn enqueue_push(&self, key: &ResourceKey, urgent: bool) {
        let priority = if urgent { Priority::High } else { Priority::Normal };
        let item = RetryQueueItem::new(
            RetryAction::Push { key: key.clone() },
            priority,
            self.config.retry.max_retries,
        );
        self.queue.enqueue(item);
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        tokio::time::timeout(self.config.request_timeout(), call)
            .await
            .map_err(|_| ApiError::Timeout)?
    }
}

fn push_item_id(key: &ResourceKey) -> String {
    RetryAction::Push { key: key.clone() }.item_id()
}

fn transition(record: &mut LocalResourceRecord, next: SyncStatus) -> Result<(), SyncEngineError> {
    if !record.sync_status.can_transition_to(next) {
        return Err(SyncEngineError::InvalidTransition {
            key: record.key().to_string(),
            from: record.sync_status,
            to: next,
        });
    }
    record.sync_status = next;
    Ok(())
}

/// Resources are JSON objects whose `resourceType`, if present, matches the key
fn validate_resource(key: &ResourceKey, resource: &Value) -> Result<(), SyncEngineError> {
    let object = resource
        .as_object()
        .ok_or_else(|| SyncEngineError::InvalidResource(format!("{} is not a JSON object", key)))?;

    match object.get("resourceType").and_then(Value::as_str) {
        Some(declared) if declared != key.resource_type => Err(SyncEngineError::InvalidResource(format!(
            "{} declares resourceType {}",
            key, declared
        ))),
        _ => Ok(()),
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncEngineError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unresolved conflict on {0}")]
    UnresolvedConflict(String),

    #[error("No pending conflict on {0}")]
    NoConflict(String),

    #[error("Network is offline")]
    Offline,

    #[error("Invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: SyncStatus,
        to: SyncStatus,
    },

    #[error("Invalid resource: {0}")]
    InvalidResource(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_resource() {
        let key = ResourceKey::new("Patient", "42");
        assert!(validate_resource(&key, &json!({"resourceType": "Patient"})).is_ok());
        assert!(validate_resource(&key, &json!({"name": "A"})).is_ok());
        assert!(matches!(
            validate_resource(&key, &json!({"resourceType": "Observation"})),
            Err(SyncEngineError::InvalidResource(_))
        ));
        assert!(validate_resource(&key, &json!([1, 2])).is_err());
    }

    #[test]
    fn test_transition_guard() {
        let mut record = LocalResourceRecord {
            resource_type: "Patient".to_string(),
            id: "42".to_string(),
            envelope: crate::sync::models::EncryptedEnvelope {
                ciphertext: String::new(),
                iv: String::new(),
                salt: String::new(),
                timestamp: Utc::now(),
                version: crate::sync::models::ENVELOPE_VERSION,
            },
            local_version: 1,
            remote_version: None,
            sync_status: SyncStatus::Synced,
            deleted: false,
            urgent: false,
            last_modified: Utc::now(),
        };

        assert!(matches!(
            transition(&mut record, SyncStatus::Syncing),
            Err(SyncEngineError::InvalidTransition { .. })
        ));
        assert_eq!(record.sync_status, SyncStatus::Synced);

        transition(&mut record, SyncStatus::Pending).unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_exhausted_pushes_settle_past_storage_error() {
        let h = crate::sync::tests::harness();
        let mut events = h.engine.subscribe();
        for id in ["a", "b"] {
            h.engine
                .save("Patient", id, &json!({"resourceType": "Patient"}), SaveOptions::default())
                .unwrap();
        }
        h.db
            .execute("UPDATE resources SET envelope = 'garbage' WHERE id = ?1", ["a"])
            .unwrap();

        let exhausted: Vec<RetryQueueItem> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let mut item = RetryQueueItem::new(
                    RetryAction::Push {
                        key: ResourceKey::new("Patient", id),
                    },
                    Priority::Normal,
                    5,
                );
                item.retry_count = 5;
                item.last_error = Some("Request timed out".to_string());
                item
            })
            .collect();
        h.engine.settle_exhausted(&exhausted);

        assert!(h.engine.status("Patient", "a").is_err());
        assert_eq!(h.engine.status("Patient", "b").unwrap(), Some(SyncStatus::Error));

        let mut failed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::OperationFailed { key, reason } = event {
                failed.push((key.id, reason));
            }
        }
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "b");
        assert!(failed[0].1.contains("gave up after 5 attempts"));
    }

    #[test]
    fn test_save_options_builder() {
        let options = SaveOptions::urgent().with_term("family", "Smith");
        assert!(options.urgent);
        assert_eq!(options.search_terms, vec![("family".to_string(), "Smith".to_string())]);
    }
}
