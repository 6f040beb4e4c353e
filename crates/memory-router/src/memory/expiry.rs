//! Expiry and pressure-eviction policy, plus the background reaper.
//!
//! The ranking functions are pure so the policy can be tested without a
//! database. `ExpiryEngine` only schedules sweeps; the work itself is done by
//! [`MemoryStore::sweep_now`](crate::memory::MemoryStore::sweep_now).

use crate::memory::MemoryStore;
use crate::memory_db::{EvictionCandidate, Priority};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// An entry is expired once `now` reaches `expires_at`.
pub fn is_expired(expires_at: Option<&DateTime<Utc>>, now: &DateTime<Utc>) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

/// Eviction order, first victim first: lowest priority, then fewest accesses,
/// then least recently accessed (never accessed sorts first), then oldest
/// write. Key breaks remaining ties so the order is total.
pub fn eviction_order(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.access_count.cmp(&b.access_count))
        .then_with(|| match (&a.last_accessed, &b.last_accessed) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        })
        .then(a.updated_at.cmp(&b.updated_at))
        .then_with(|| a.key.cmp(&b.key))
}

/// Victims needed to bring `live_count` down to `capacity`. Critical entries
/// are never chosen, so fewer victims than the excess may be returned.
pub fn select_victims(
    mut candidates: Vec<EvictionCandidate>,
    live_count: usize,
    capacity: usize,
) -> Vec<EvictionCandidate> {
    let excess = live_count.saturating_sub(capacity);
    if excess == 0 {
        return Vec::new();
    }
    candidates.retain(|c| c.priority != Priority::Critical);
    candidates.sort_by(eviction_order);
    candidates.truncate(excess);
    candidates
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub expired_conversations: usize,
    pub expired_system: usize,
    pub evicted: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired_conversations + self.expired_system + self.evicted
    }
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic reaper with an explicit lifecycle.
pub struct ExpiryEngine {
    store: Arc<MemoryStore>,
    interval: Duration,
    task: Mutex<Option<RunningTask>>,
}

impl ExpiryEngine {
    pub fn new(store: Arc<MemoryStore>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(MIN_SWEEP_INTERVAL),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Spawn the sweep loop. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return false;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            info!("Expiry engine started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match store.sweep_now().await {
                            Ok(report) if report.removed() > 0 || report.errors > 0 => {
                                info!(
                                    expired_conversations = report.expired_conversations,
                                    expired_system = report.expired_system,
                                    evicted = report.evicted,
                                    errors = report.errors,
                                    "Sweep complete"
                                );
                            }
                            Ok(_) => debug!("Sweep complete, nothing to remove"),
                            Err(e) => error!("Sweep failed: {}", e),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Expiry engine stopped");
        });

        *task = Some(RunningTask {
            shutdown: shutdown_tx,
            handle,
        });
        true
    }

    /// Signal the loop and wait for it to exit. A sweep in progress finishes first.
    pub async fn stop(&self) {
        let running = self.task.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.handle.await {
                warn!("Expiry engine task ended abnormally: {}", e);
            }
        }
    }

    pub async fn sweep_now(&self) -> crate::error::MemoryResult<SweepReport> {
        self.store.sweep_now().await
    }
}
