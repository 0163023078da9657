//! Background Sync Scheduler
//!
//! Drives the engine without caller involvement:
//! - drains the retry queue on a short ticker
//! - enqueues a pull on the periodic pull timer
//! - enqueues a pull right after every debounced online transition
//!
//! Uses one Tokio task; all work goes through the engine's single-flight drain.

use super::engine::SyncEngine;
use super::network::NetworkEvent;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_PULL_INTERVAL: Duration = Duration::from_secs(60);
const MAX_PULL_INTERVAL: Duration = Duration::from_secs(86_400);

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Background driver for a [`SyncEngine`]
#[derive(Clone, Default)]
pub struct SyncScheduler {
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
    stop_signal: Arc<StdMutex<Option<Arc<Notify>>>>,
    last_run: Arc<StdMutex<Option<DateTime<Utc>>>>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start background scheduler task
    pub fn start(&self, engine: Arc<SyncEngine>) -> Result<(), SchedulerError> {
        let pull_interval = engine.config().pull_interval();
        if !(MIN_PULL_INTERVAL..=MAX_PULL_INTERVAL).contains(&pull_interval) {
            return Err(SchedulerError::InvalidInterval(format!(
                "Pull interval must be 60-86400 seconds, got {}",
                pull_interval.as_secs()
            )));
        }
        if engine.config().drain_interval().is_zero() {
            return Err(SchedulerError::InvalidInterval("Drain interval must be positive".to_string()));
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let running = self.running.clone();
        let last_run = self.last_run.clone();
        let stop = Arc::new(Notify::new());
        let signal = stop.clone();
        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, last_run, signal, engine).await;
        });

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *self.stop_signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop);

        log::info!(
            "Background scheduler started (pull every {}s)",
            pull_interval.as_secs()
        );
        Ok(())
    }

    /// Stop background scheduler task
    ///
    /// Returns at once. A drain pass that is mid-request finishes its current
    /// item first; the loop then exits without starting another pass.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(stop) = self.stop_signal.lock().unwrap_or_else(|e| e.into_inner()).take() {
            stop.notify_one();
        }

        log::info!("Background scheduler stopping");
        Ok(())
    }

    /// Wait for the loop to exit after `stop`
    pub async fn join(&self) {
        let handle = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// When the last drain pass finished
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        last_run: Arc<StdMutex<Option<DateTime<Utc>>>>,
        stop: Arc<Notify>,
        engine: Arc<SyncEngine>,
    ) {
        let mut drain = tokio::time::interval(engine.config().drain_interval());
        drain.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pull = tokio::time::interval(engine.config().pull_interval());
        pull.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut network = engine.network().subscribe();

        log::info!("Scheduler loop started");

        loop {
            tokio::select! {
                biased;
                _ = stop.notified() => {
                    log::info!("Scheduler loop: stop requested");
                    break;
                }
                _ = drain.tick() => {}
                _ = pull.tick() => {
                    log::debug!("Periodic pull due");
                    engine.request_pull();
                }
                event = network.recv() => match event {
                    Ok(NetworkEvent::Online) => {
                        log::info!("Back online, pulling and draining");
                        engine.request_pull();
                    }
                    Ok(NetworkEvent::Offline) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Scheduler missed {} network events", skipped);
                        engine.request_pull();
                    }
                    Err(RecvError::Closed) => {
                        log::warn!("Network monitor closed");
                        running.store(false, Ordering::Release);
                        break;
                    }
                },
            }

            match engine.process_queue().await {
                Ok(Some(report)) if report.processed > 0 => {
                    *last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
                }
                Ok(_) => {}
                Err(e) => log::error!("Background drain failed: {}", e),
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::SyncStatus;
    use crate::sync::tests::{drain_until_idle, harness, patient, push_id, Reply};
    use serde_json::json;

    #[tokio::test]
    async fn test_scheduler_new() {
        let scheduler = SyncScheduler::new();
        assert!(!scheduler.is_running());
        assert!(scheduler.last_run().is_none());
    }

    #[tokio::test]
    async fn test_stop_not_running() {
        let scheduler = SyncScheduler::new();
        assert!(matches!(scheduler.stop(), Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let h = harness();
        let scheduler = SyncScheduler::new();

        scheduler.start(h.engine.clone()).unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.start(h.engine.clone()),
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.stop().unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_invalid_pull_interval_rejected() {
        let mut h = harness();
        let mut config = h.engine.config().clone();
        config.pull_interval_secs = 10;
        h.rebuild(config);

        let scheduler = SyncScheduler::new();
        assert!(matches!(
            scheduler.start(h.engine.clone()),
            Err(SchedulerError::InvalidInterval(_))
        ));
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_drains_queue() {
        let h = harness();
        h.server.script_push(Reply::Version(1));
        h.engine
            .save("Patient", "1", &json!({"resourceType": "Patient"}), Default::default())
            .unwrap();

        let scheduler = SyncScheduler::new();
        scheduler.start(h.engine.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            h.engine.status("Patient", "1").unwrap(),
            Some(SyncStatus::Synced)
        );
        assert!(scheduler.last_run().is_some());
        scheduler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_push_on_the_wire_finish() {
        let h = harness();
        h.server.script_push(Reply::Hang);
        h.engine
            .save("Patient", "42", &patient("A"), Default::default())
            .unwrap();

        let scheduler = SyncScheduler::new();
        scheduler.start(h.engine.clone()).unwrap();
        while h.server.pushes().is_empty() {
            tokio::task::yield_now().await;
        }

        scheduler.stop().unwrap();
        assert!(!scheduler.is_running());
        assert!(h.engine.queue().is_in_flight(&push_id("42")));

        // the request runs into its timeout, then the loop exits
        scheduler.join().await;
        assert!(!h.engine.queue().is_in_flight(&push_id("42")));
        assert_eq!(h.engine.queue().get(&push_id("42")).unwrap().retry_count, 1);
        assert_eq!(h.engine.status("Patient", "42").unwrap(), Some(SyncStatus::Pending));
        assert_eq!(h.server.pushes().len(), 1);

        h.engine
            .save("Patient", "42", &patient("B"), Default::default())
            .unwrap();
        drain_until_idle(&h.engine).await;

        assert_eq!(h.server.pushes().len(), 2);
        assert_eq!(h.server.resource("Patient", "42"), Some((1, patient("B"))));
        assert_eq!(h.engine.status("Patient", "42").unwrap(), Some(SyncStatus::Synced));
    }
}
