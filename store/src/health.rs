//! Replica health reporting.
//!
//! Reports are best-effort traces. Slow commits feed a circular buffer of
//! timestamps; when the whole window lands inside the configured threshold a
//! stateful warning is emitted, refreshed at half the threshold period.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct HealthTracker {
    threshold: Duration,
    window_size: usize,
    slow_commits: Mutex<VecDeque<Instant>>,
    last_warning: Mutex<Option<Instant>>,
    slow_commit_count: AtomicU64,
    path_too_long_reported: AtomicBool,
    fatal_error_reported: AtomicBool,
}

impl HealthTracker {
    pub fn new(threshold: Duration, window_size: usize) -> Self {
        HealthTracker {
            threshold,
            window_size: window_size.max(1),
            slow_commits: Mutex::new(VecDeque::with_capacity(window_size.max(1))),
            last_warning: Mutex::new(None),
            slow_commit_count: AtomicU64::new(0),
            path_too_long_reported: AtomicBool::new(false),
            fatal_error_reported: AtomicBool::new(false),
        }
    }

    pub fn slow_commit_count(&self) -> u64 {
        self.slow_commit_count.load(Ordering::SeqCst)
    }

    /// Records a slow local commit. Returns true when a stateful warning was
    /// emitted.
    pub fn on_slow_commit(&self) -> bool {
        self.on_slow_commit_at(Instant::now())
    }

    fn on_slow_commit_at(&self, now: Instant) -> bool {
        self.slow_commit_count.fetch_add(1, Ordering::SeqCst);

        let mut window = lock(&self.slow_commits);
        window.push_back(now);
        if window.len() > self.window_size {
            window.pop_front();
        }
        if window.len() < self.window_size {
            return false;
        }

        let oldest = *window.front().expect("non-empty window");
        if now.duration_since(oldest) > self.threshold {
            return false;
        }
        drop(window);

        let mut last = lock(&self.last_warning);
        if let Some(at) = *last {
            if now.duration_since(at) < self.threshold / 2 {
                return false;
            }
        }
        *last = Some(now);

        log::warn!(
            "health: {} slow commits within {:?}",
            self.window_size,
            self.threshold
        );
        true
    }

    pub fn report_path_too_long(&self, path: &str) {
        if !self.path_too_long_reported.swap(true, Ordering::SeqCst) {
            log::warn!("health: store path too long: {}", path);
        }
    }

    pub fn report_fatal_error(&self, detail: &str) {
        if !self.fatal_error_reported.swap(true, Ordering::SeqCst) {
            log::warn!("health: fatal store error: {}", detail);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn warning_requires_a_full_fast_window() {
        let tracker = HealthTracker::new(Duration::from_secs(60), 3);
        let base = Instant::now();

        assert!(!tracker.on_slow_commit_at(base));
        assert!(!tracker.on_slow_commit_at(base + Duration::from_secs(1)));
        // Third slow commit fills the window inside the threshold.
        assert!(tracker.on_slow_commit_at(base + Duration::from_secs(2)));
        assert_eq!(tracker.slow_commit_count(), 3);
    }

    #[test]
    fn warning_is_rate_limited_to_half_threshold() {
        let tracker = HealthTracker::new(Duration::from_secs(60), 2);
        let base = Instant::now();

        assert!(!tracker.on_slow_commit_at(base));
        assert!(tracker.on_slow_commit_at(base + Duration::from_secs(1)));
        // Within threshold/2 of the last warning: suppressed.
        assert!(!tracker.on_slow_commit_at(base + Duration::from_secs(2)));
        // Past threshold/2: emitted again.
        assert!(tracker.on_slow_commit_at(base + Duration::from_secs(40)));
    }

    #[test]
    fn one_shot_reports_fire_once() {
        let tracker = HealthTracker::new(Duration::from_secs(1), 2);
        tracker.report_path_too_long("/very/long");
        tracker.report_path_too_long("/very/long");
        tracker.report_fatal_error("corrupt");
        tracker.report_fatal_error("corrupt");
    }
}
