//! Retry Queue Module - Backoff-scheduled work queue for sync actions
//!
//! Failed pushes and pulls are held here and retried with exponential
//! backoff until they succeed or exhaust their retry budget.
//!
//! Features:
//! - Tagged actions (`Push`/`Pull`) instead of opaque callbacks
//! - Priority ordering, then enqueue time
//! - Id collisions replace the waiting entry (coalescing)
//! - Exponential backoff with downward jitter, never shrinking between retries
//! - Single-flight drain; an item in flight is never dequeued twice
//! - Cancellation of items that have not started

use super::models::{Priority, ResourceKey};
use crate::config::RetryPolicy;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

/// Queue id of the (single) pull action
pub const PULL_ITEM_ID: &str = "pull";

/// Lower edge of the jitter band, keeps every jittered delay strictly below nominal
const MIN_JITTER_RATIO: f64 = 0.01;

// ============================================================================
// Data Types
// ============================================================================

/// What to retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RetryAction {
    /// Push the live sync operation of a resource
    Push { key: ResourceKey },
    /// Fetch the change feed from the stored checkpoint
    Pull,
}

impl RetryAction {
    /// Queue id; one waiting item per logical target
    pub fn item_id(&self) -> String {
        match self {
            Self::Push { key } => format!("push:{}", key),
            Self::Pull => PULL_ITEM_ID.to_string(),
        }
    }
}

/// Result of running one action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Ok,
    /// Transient failure; rescheduled with backoff
    Retryable(String),
    /// Terminal failure; removed without retry
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub id: String,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Effective delay (after jitter) counted from `enqueued_at`
    pub backoff_ms: u64,
    /// Un-jittered delay the next failure grows from
    pub nominal_backoff_ms: u64,
    pub enqueued_at: DateTime<Utc>,
    pub action: RetryAction,
    pub last_error: Option<String>,
}

impl RetryQueueItem {
    /// New item, ready immediately
    pub fn new(action: RetryAction, priority: Priority, max_retries: u32) -> Self {
        Self {
            id: action.item_id(),
            priority,
            retry_count: 0,
            max_retries,
            backoff_ms: 0,
            nominal_backoff_ms: 0,
            enqueued_at: Utc::now(),
            action,
            last_error: None,
        }
    }

    /// Caller-supplied initial delay
    pub fn with_backoff(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self.nominal_backoff_ms = backoff_ms;
        self
    }

    pub fn ready_at(&self) -> DateTime<Utc> {
        self.enqueued_at + Duration::milliseconds(self.backoff_ms as i64)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_at() <= now
    }
}

/// What `report_failure` decided
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Rescheduled { retry_count: u32, backoff_ms: u64 },
    /// Retry budget spent; the item is gone
    Exhausted { item: RetryQueueItem },
    /// A newer item with the same id was enqueued meanwhile and takes over
    Superseded,
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub processed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub exhausted: Vec<RetryQueueItem>,
    pub fatal: Vec<(RetryQueueItem, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub in_flight: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub next_ready_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    waiting: HashMap<String, RetryQueueItem>,
    in_flight: HashMap<String, RetryQueueItem>,
}

// ============================================================================
// Retry Queue
// ============================================================================

pub struct RetryQueue {
    policy: RetryPolicy,
    state: StdMutex<QueueState>,
    draining: AtomicBool,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: StdMutex::new(QueueState::default()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Add an item, replacing any waiting item with the same id
    pub fn enqueue(&self, item: RetryQueueItem) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.waiting.contains_key(&item.id) {
            log::debug!("Coalescing queue item {}", item.id);
        } else if state.in_flight.contains_key(&item.id) {
            log::debug!("Queue item {} is in flight; new entry waits for it", item.id);
        }

        log::debug!(
            "Enqueued {} ({:?}, backoff {}ms)",
            item.id,
            item.priority,
            item.backoff_ms
        );
        state.waiting.insert(item.id.clone(), item);
    }

    /// Take every ready item, highest priority first, marking them in flight
    ///
    /// Items whose id is already in flight stay queued.
    pub fn dequeue_ready(&self, now: DateTime<Utc>) -> Vec<RetryQueueItem> {
        self.ready_ids(now)
            .into_iter()
            .filter_map(|id| self.claim(&id, now))
            .collect()
    }

    /// Ids of ready items in execution order
    fn ready_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut ready: Vec<(Priority, DateTime<Utc>, &String)> = state
            .waiting
            .values()
            .filter(|item| item.is_ready(now) && !state.in_flight.contains_key(&item.id))
            .map(|item| (item.priority, item.enqueued_at, &item.id))
            .collect();

        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(b.2)));
        ready.into_iter().map(|(_, _, id)| id.clone()).collect()
    }

    /// Move one waiting item in flight, if it is still there and ready
    fn claim(&self, id: &str, now: DateTime<Utc>) -> Option<RetryQueueItem> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.in_flight.contains_key(id) || !state.waiting.get(id)?.is_ready(now) {
            return None;
        }
        let item = state.waiting.remove(id)?;
        state.in_flight.insert(id.to_string(), item.clone());
        Some(item)
    }

    /// Put an in-flight item back without counting an attempt
    ///
    /// A newer waiting item with the same id wins.
    fn release(&self, id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(item) = state.in_flight.remove(id) {
            log::warn!("Queue item {} interrupted before it finished; requeued", id);
            state.waiting.entry(id.to_string()).or_insert(item);
        }
    }

    /// Remove a finished item
    pub fn report_success(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.in_flight.remove(id).is_some() || state.waiting.remove(id).is_some() {
            log::debug!("Queue item {} completed", id);
            Ok(())
        } else {
            Err(QueueError::ItemNotFound(id.to_string()))
        }
    }

    /// Count a failure and reschedule with backoff, or give up
    pub fn report_failure(&self, id: &str, error: &str) -> Result<FailureOutcome, QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut item = match state.in_flight.remove(id) {
            Some(item) => {
                if state.waiting.contains_key(id) {
                    log::debug!("Queue item {} failed but was superseded", id);
                    return Ok(FailureOutcome::Superseded);
                }
                item
            }
            None => state
                .waiting
                .remove(id)
                .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?,
        };

        item.retry_count += 1;
        item.last_error = Some(error.to_string());

        if item.retry_count >= item.max_retries {
            log::warn!(
                "Queue item {} exhausted after {} attempts: {}",
                id,
                item.retry_count,
                error
            );
            return Ok(FailureOutcome::Exhausted { item });
        }

        let previous = if item.retry_count > 1 { item.backoff_ms } else { 0 };
        let (nominal, effective) = self.next_backoff(item.nominal_backoff_ms, previous);
        item.nominal_backoff_ms = nominal;
        item.backoff_ms = effective;
        item.enqueued_at = Utc::now();

        log::info!(
            "Queue item {} will retry in {}ms (attempt {}/{}): {}",
            id,
            effective,
            item.retry_count + 1,
            item.max_retries,
            error
        );

        let outcome = FailureOutcome::Rescheduled {
            retry_count: item.retry_count,
            backoff_ms: effective,
        };
        state.waiting.insert(id.to_string(), item);
        Ok(outcome)
    }

    /// Drop a waiting item; items already in flight run to completion
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let removed = state.waiting.remove(id).is_some();
        if removed {
            log::info!("Cancelled queue item {}", id);
        } else if state.in_flight.contains_key(id) {
            log::info!("Queue item {} already in flight; cancel ignored", id);
        }
        removed
    }

    /// Run every ready item through `execute`, one at a time
    ///
    /// Items are claimed one by one, so an item that has not started yet can
    /// still be cancelled. If the drain future is dropped mid-item, that item
    /// goes back to waiting. Returns None without doing anything if another
    /// drain is running.
    pub async fn drain<F, Fut>(&self, now: DateTime<Utc>, mut execute: F) -> Option<DrainReport>
    where
        F: FnMut(RetryQueueItem) -> Fut,
        Fut: Future<Output = ActionOutcome>,
    {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Drain already in progress, skipping");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        for id in self.ready_ids(now) {
            let item = match self.claim(&id, now) {
                Some(item) => item,
                None => continue,
            };
            report.processed += 1;

            let mut claim = ClaimGuard {
                queue: self,
                id: &id,
                finished: false,
            };
            let outcome = execute(item.clone()).await;
            claim.finished = true;
            drop(claim);

            match outcome {
                ActionOutcome::Ok => {
                    self.report_success(&id).ok();
                    report.succeeded += 1;
                }
                ActionOutcome::Retryable(error) => match self.report_failure(&id, &error) {
                    Ok(FailureOutcome::Exhausted { item }) => report.exhausted.push(item),
                    Ok(_) => report.rescheduled += 1,
                    Err(e) => log::error!("Queue bookkeeping failed for {}: {}", id, e),
                },
                ActionOutcome::Fatal(error) => {
                    log::warn!("Queue item {} failed permanently: {}", id, error);
                    self.remove_in_flight(&id);
                    report.fatal.push((item, error));
                }
            }
        }

        if report.processed > 0 {
            log::info!(
                "Drain finished: {} processed, {} ok, {} rescheduled, {} exhausted, {} fatal",
                report.processed,
                report.succeeded,
                report.rescheduled,
                report.exhausted.len(),
                report.fatal.len()
            );
        }
        Some(report)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Waiting item by id
    pub fn get(&self, id: &str) -> Option<RetryQueueItem> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting.contains_key(id) || state.in_flight.contains_key(id)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.waiting.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut stats = QueueStats {
            waiting: state.waiting.len(),
            in_flight: state.in_flight.len(),
            ..QueueStats::default()
        };
        for item in state.waiting.values() {
            match item.priority {
                Priority::High => stats.high += 1,
                Priority::Normal => stats.normal += 1,
                Priority::Low => stats.low += 1,
            }
        }
        stats.next_ready_at = state.waiting.values().map(|item| item.ready_at()).min();
        stats
    }

    fn remove_in_flight(&self, id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.remove(id);
    }

    /// `(nominal, effective)` delay for the next retry
    ///
    /// Nominal grows by `multiplier` up to the cap. Effective is nominal
    /// shortened by a random 1%..jitter_ratio, never below the previous
    /// effective delay and never above the cap.
    fn next_backoff(&self, nominal_ms: u64, previous_ms: u64) -> (u64, u64) {
        let max = self.policy.max_backoff_ms as f64;

        let nominal = if nominal_ms == 0 {
            self.policy.initial_backoff_ms as f64
        } else {
            nominal_ms as f64 * self.policy.multiplier
        }
        .min(max);

        let ratio = self.policy.jitter_ratio;
        let r = rand::thread_rng().gen_range(ratio.min(MIN_JITTER_RATIO)..=ratio);
        let jittered = (nominal * (1.0 - r)).floor();

        let effective = jittered.max(previous_ms as f64).min(max);
        (nominal as u64, effective as u64)
    }
}

/// Requeues the executing item if the drain future is dropped mid-await
struct ClaimGuard<'a> {
    queue: &'a RetryQueue,
    id: &'a str,
    finished: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.queue.release(self.id);
        }
    }
}

/// Clears the single-flight flag even if the drain future is dropped
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue item not found: {0}")]
    ItemNotFound(String),
}

// ============================================================================
// Tests
// ============================================================================
