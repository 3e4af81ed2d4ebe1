//! Replication back-pressure.
//!
//! The wire replicator exposes queue depth counters; when they cross the
//! configured ceilings a user callback is asked to throttle, and asked again
//! to release once the queue drains. Edges are delivered exactly once and in
//! order through a single-consumer queue, never under a store lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::config::StoreSettings;
use crate::replicator::StateReplicator;

pub type ThrottleCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
}

pub struct Throttle {
    replicator: Arc<dyn StateReplicator>,
    bytes_ceiling: u64,
    ops_ceiling: u64,
    refresh_every: u64,
    state: Mutex<ThrottleState>,
    engaged: AtomicBool,
    completed_since_refresh: AtomicU64,
    notify_tx: mpsc::UnboundedSender<bool>,
    callback: Arc<Mutex<Option<ThrottleCallback>>>,
}

impl Throttle {
    /// Builds the throttle and spawns its single-consumer notifier task.
    pub fn new(replicator: Arc<dyn StateReplicator>, settings: &StoreSettings) -> Arc<Self> {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<bool>();
        let callback: Arc<Mutex<Option<ThrottleCallback>>> = Arc::new(Mutex::new(None));

        let consumer_callback = callback.clone();
        tokio::spawn(async move {
            while let Some(enable) = notify_rx.recv().await {
                let cb = lock(&consumer_callback).clone();
                if let Some(cb) = cb {
                    cb(enable);
                }
            }
        });

        let throttle = Arc::new(Throttle {
            replicator,
            bytes_ceiling: settings.throttle_queued_bytes_ceiling,
            ops_ceiling: settings.throttle_queued_ops_ceiling,
            refresh_every: settings.throttle_refresh_operation_count.max(1),
            state: Mutex::new(ThrottleState::Uninitialized),
            engaged: AtomicBool::new(false),
            completed_since_refresh: AtomicU64::new(0),
            notify_tx,
            callback,
        });

        if settings.throttle_refresh_interval_ms > 0 {
            let period = std::time::Duration::from_millis(settings.throttle_refresh_interval_ms);
            let timer = throttle.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if timer.state() == ThrottleState::Stopped {
                        break;
                    }
                    timer.refresh_counters();
                }
            });
        }

        throttle
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_ceiling > 0 || self.ops_ceiling > 0
    }

    pub fn state(&self) -> ThrottleState {
        *lock(&self.state)
    }

    pub fn set_callback(&self, callback: ThrottleCallback) {
        *lock(&self.callback) = Some(callback);
    }

    pub fn transition_to_initialized(&self) {
        let mut state = lock(&self.state);
        match *state {
            ThrottleState::Started | ThrottleState::Initialized => {
                log::error!("throttle: invalid transition to Initialized from {:?}", *state);
            }
            _ => *state = ThrottleState::Initialized,
        }
    }

    pub fn transition_to_started(&self) {
        let mut state = lock(&self.state);
        if *state != ThrottleState::Initialized {
            log::error!("throttle: invalid transition to Started from {:?}", *state);
            return;
        }
        *state = ThrottleState::Started;
    }

    pub fn transition_to_stopped(&self) {
        *lock(&self.state) = ThrottleState::Stopped;
    }

    /// True while callers should apply back-pressure.
    pub fn is_throttle_needed(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Called once per completed replication; refreshes counters every N
    /// completions.
    pub fn on_replication_completed(&self) {
        if !self.is_enabled() || self.state() != ThrottleState::Started {
            return;
        }
        let n = self.completed_since_refresh.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.refresh_every {
            self.completed_since_refresh.store(0, Ordering::SeqCst);
            self.refresh_counters();
        }
    }

    /// Re-reads the replicator queue counters and schedules an edge
    /// notification if the throttle flipped.
    pub fn refresh_counters(&self) {
        if !self.is_enabled() {
            return;
        }
        let counters = self.replicator.get_queue_counters();
        let over_bytes = self.bytes_ceiling > 0 && counters.queued_bytes > self.bytes_ceiling;
        let over_ops =
            self.ops_ceiling > 0 && counters.queued_operation_count > self.ops_ceiling;
        let over = over_bytes || over_ops;

        if self.engaged.swap(over, Ordering::SeqCst) != over {
            log::info!(
                "throttle {}: bytes={} ops={}",
                if over { "engaged" } else { "released" },
                counters.queued_bytes,
                counters.queued_operation_count
            );
            let _ = self.notify_tx.send(over);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
