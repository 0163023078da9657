//! Network Monitor - Debounced connectivity signal
//!
//! Platform code reports raw connectivity readings; the monitor publishes a
//! debounced view. Offline readings only take effect after they have held
//! for `debounce_ms`, so brief drops never reach subscribers. Recoveries are
//! reported immediately.

use crate::config::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 32;

// ============================================================================
// Data Types
// ============================================================================

/// Bandwidth class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Classify a measured downlink
    pub fn from_downlink_mbps(mbps: f64) -> Self {
        if mbps < 0.5 {
            Self::Poor
        } else if mbps < 2.0 {
            Self::Fair
        } else if mbps < 10.0 {
            Self::Good
        } else {
            Self::Excellent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub is_online: bool,
    pub quality: ConnectionQuality,
    /// Platform asks for lower-fidelity transfers
    pub reduced_data: bool,
}

impl NetworkStatus {
    pub fn online() -> Self {
        Self {
            is_online: true,
            quality: ConnectionQuality::Good,
            reduced_data: false,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            quality: ConnectionQuality::Poor,
            reduced_data: false,
        }
    }
}

/// Debounced connectivity transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
}

// ============================================================================
// Network Monitor
// ============================================================================

struct Inner {
    debounce: Duration,
    status: watch::Sender<NetworkStatus>,
    events: broadcast::Sender<NetworkEvent>,
    /// Bumped on every online reading; a pending offline timer only fires if unchanged
    generation: AtomicU64,
    pending_offline: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    pub fn new(config: &NetworkConfig, initial: NetworkStatus) -> Self {
        let (status, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                debounce: Duration::from_millis(config.debounce_ms),
                status,
                events,
                generation: AtomicU64::new(0),
                pending_offline: StdMutex::new(None),
            }),
        }
    }

    /// Debounced status
    pub fn current(&self) -> NetworkStatus {
        *self.inner.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online
    }

    /// Stream of debounced transitions
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the debounced status
    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status.subscribe()
    }

    pub fn report_online(&self) {
        let quality = self.current().quality.max(ConnectionQuality::Fair);
        self.report(NetworkStatus {
            is_online: true,
            quality,
            reduced_data: self.current().reduced_data,
        });
    }

    pub fn report_offline(&self) {
        self.report(NetworkStatus::offline());
    }

    /// Feed a raw reading from the platform
    pub fn report(&self, reading: NetworkStatus) {
        if reading.is_online {
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            self.cancel_pending_offline();
            self.inner.publish(reading);
            return;
        }

        if !self.is_online() {
            self.inner.publish(reading);
            return;
        }

        let mut pending = self
            .inner
            .pending_offline
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let generation = self.inner.generation.load(Ordering::Acquire);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                *pending = Some(handle.spawn(async move {
                    tokio::time::sleep(inner.debounce).await;
                    if inner.generation.load(Ordering::Acquire) == generation {
                        inner.publish(reading);
                    }
                }));
            }
            Err(_) => {
                log::warn!("No async runtime for debounce; applying offline reading immediately");
                drop(pending);
                self.inner.publish(reading);
            }
        }
    }

    fn cancel_pending_offline(&self) {
        let mut pending = self
            .inner
            .pending_offline
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.take() {
            if !handle.is_finished() {
                log::debug!("Connectivity recovered within debounce window");
            }
            handle.abort();
        }
    }
}

impl Inner {
    fn publish(&self, next: NetworkStatus) {
        let previous = *self.status.borrow();
        self.status.send_replace(next);

        if previous.is_online == next.is_online {
            return;
        }

        let event = if next.is_online {
            log::info!("Network online ({:?})", next.quality);
            NetworkEvent::Online
        } else {
            log::warn!("Network offline");
            NetworkEvent::Offline
        };
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn monitor() -> NetworkMonitor {
        NetworkMonitor::new(&NetworkConfig { debounce_ms: 1_000 }, NetworkStatus::online())
    }

    #[test]
    fn test_quality_classification() {
        assert_eq!(ConnectionQuality::from_downlink_mbps(0.1), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::from_downlink_mbps(1.0), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::from_downlink_mbps(5.0), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_downlink_mbps(50.0), ConnectionQuality::Excellent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_drop_is_swallowed() {
        let monitor = monitor();
        let mut events = monitor.subscribe();

        monitor.report_offline();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(monitor.is_online());

        monitor.report_online();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(monitor.is_online());
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_drop_reported_after_debounce() {
        let monitor = monitor();
        let mut events = monitor.subscribe();

        monitor.report_offline();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(!monitor.is_online());
        assert_eq!(events.try_recv(), Ok(NetworkEvent::Offline));

        monitor.report_online();
        assert!(monitor.is_online());
        assert_eq!(events.try_recv(), Ok(NetworkEvent::Online));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_offline_readings_do_not_restart_timer() {
        let monitor = monitor();
        let mut events = monitor.subscribe();

        monitor.report_offline();
        tokio::time::sleep(Duration::from_millis(600)).await;
        monitor.report_offline();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(!monitor.is_online());
        assert_eq!(events.try_recv(), Ok(NetworkEvent::Offline));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_quality_update_without_transition() {
        let monitor = monitor();
        let mut events = monitor.subscribe();

        monitor.report(NetworkStatus {
            is_online: true,
            quality: ConnectionQuality::Poor,
            reduced_data: true,
        });

        let status = monitor.current();
        assert_eq!(status.quality, ConnectionQuality::Poor);
        assert!(status.reduced_data);
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sees_debounced_status() {
        let monitor = monitor();
        let mut status = monitor.watch();
        assert!(status.borrow_and_update().is_online);

        monitor.report_offline();
        tokio::time::timeout(Duration::from_secs(5), status.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.borrow().is_online);
    }

    #[test]
    fn test_offline_without_runtime_applies_immediately() {
        let monitor = monitor();
        monitor.report_offline();
        assert!(!monitor.is_online());
    }
}
