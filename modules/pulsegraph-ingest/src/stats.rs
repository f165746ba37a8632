use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::Shutdown;

/// Pipeline counters, shared by every worker.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    admitted: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Stream events, before expansion.
    pub received: u64,
    pub admitted: u64,
    /// Filtered out, or already stored.
    pub ignored: u64,
    pub failed: u64,
    pub malformed: u64,
}

impl StatsSnapshot {
    pub fn delta_since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.saturating_sub(earlier.received),
            admitted: self.admitted.saturating_sub(earlier.admitted),
            ignored: self.ignored.saturating_sub(earlier.ignored),
            failed: self.failed.saturating_sub(earlier.failed),
            malformed: self.malformed.saturating_sub(earlier.malformed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} admitted={} ignored={} failed={} malformed={}",
            self.received, self.admitted, self.ignored, self.failed, self.malformed
        )
    }
}

/// What one tick observed.
#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub totals: StatsSnapshot,
    pub delta: StatsSnapshot,
    pub elapsed: Duration,
}

impl TickReport {
    pub fn stalled(&self) -> bool {
        self.delta.received == 0
    }

    /// Per-second rate of a delta counter over this tick.
    pub fn rate(&self, count: u64) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        count as f64 / secs
    }

    pub fn log(&self) {
        if self.stalled() {
            warn!(
                elapsed_secs = self.elapsed.as_secs(),
                totals = %self.totals,
                "No events received since last tick, stream may be stalled"
            );
            return;
        }
        info!(
            events = self.delta.received,
            per_sec = %format!("{:.2}", self.rate(self.delta.received)),
            "Events"
        );
        info!(
            admitted = self.delta.admitted,
            per_sec = %format!("{:.2}", self.rate(self.delta.admitted)),
            "Admitted"
        );
        info!(
            ignored = self.delta.ignored,
            per_sec = %format!("{:.2}", self.rate(self.delta.ignored)),
            "Ignored"
        );
        if self.delta.failed > 0 || self.delta.malformed > 0 {
            warn!(
                failed = self.delta.failed,
                malformed = self.delta.malformed,
                "Records not projected"
            );
        }
    }
}

/// Logs counter deltas on a fixed tick. Never touches the pipeline.
pub struct StatsReporter {
    stats: Arc<IngestStats>,
    tick: Duration,
    last: StatsSnapshot,
    last_at: Instant,
}

impl StatsReporter {
    pub fn new(stats: Arc<IngestStats>, tick: Duration) -> Self {
        let last = stats.snapshot();
        Self {
            stats,
            tick,
            last,
            last_at: Instant::now(),
        }
    }

    /// Compare the counters against the previous tick.
    pub fn tick_report(&mut self) -> TickReport {
        let now = Instant::now();
        let totals = self.stats.snapshot();
        let report = TickReport {
            totals,
            delta: totals.delta_since(&self.last),
            elapsed: now.duration_since(self.last_at),
        };
        self.last = totals;
        self.last_at = now;
        report
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.tick);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => self.tick_report().log(),
            }
        }
        debug!("Stats reporter stopped");
    }
}
