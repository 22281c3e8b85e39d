//! Build progress tracking.
//!
//! Progress is a tree of allocations that sums to 1.0: the root hands out
//! fractional shares to phases, phases subdivide across their units (layers,
//! blobs). Completions are atomic adds on a fixed-point counter, so step
//! workers never contend on a lock, and a throttled emitter turns updates
//! into log lines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Fixed-point scale: this many ticks represent 100%.
const SCALE: u64 = 1_000_000_000;

/// Minimum interval between emitted progress lines.
const EMIT_INTERVAL_MS: u64 = 200;

/// Root progress meter shared by all allocations.
pub struct ProgressTracker {
    done: AtomicU64,
    last_emit_ms: AtomicU64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicU64::new(0),
            last_emit_ms: AtomicU64::new(0),
            started: Instant::now(),
        })
    }

    /// Hand out `fraction` of the whole meter, split across `units` equal
    /// completions.
    pub fn allocate(self: &Arc<Self>, fraction: f64, units: u64) -> Allocation {
        Allocation {
            tracker: Arc::clone(self),
            total_ticks: (fraction.clamp(0.0, 1.0) * SCALE as f64) as u64,
            units: units.max(1),
            consumed: AtomicU64::new(0),
        }
    }

    /// Current progress in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        self.done.load(Ordering::Relaxed) as f64 / SCALE as f64
    }

    fn add_ticks(&self, ticks: u64) {
        let done = self.done.fetch_add(ticks, Ordering::Relaxed) + ticks;
        self.maybe_emit(done);
    }

    fn maybe_emit(&self, done: u64) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_emit_ms.load(Ordering::Relaxed);
        let due = now_ms.saturating_sub(last) >= EMIT_INTERVAL_MS || done >= SCALE;
        if !due {
            return;
        }
        if self
            .last_emit_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(
                percent = format!("{:.1}", (done.min(SCALE) as f64 / SCALE as f64) * 100.0),
                "Build progress"
            );
        }
    }
}

/// A share of the meter, subdivided into equal units.
pub struct Allocation {
    tracker: Arc<ProgressTracker>,
    total_ticks: u64,
    units: u64,
    consumed: AtomicU64,
}

impl Allocation {
    /// Mark one unit done.
    pub fn complete_unit(&self) {
        self.complete(1);
    }

    /// Mark `n` units done. Completions past the allocation's unit count are
    /// ignored, keeping the meter at or below 100%.
    pub fn complete(&self, n: u64) {
        let before = self.consumed.fetch_add(n, Ordering::Relaxed);
        let counted = n.min(self.units.saturating_sub(before));
        if counted > 0 {
            self.tracker.add_ticks(self.total_ticks / self.units * counted);
        }
    }

    /// Split off a child allocation covering `fraction` of this share.
    pub fn child(&self, fraction: f64, units: u64) -> Allocation {
        Allocation {
            tracker: Arc::clone(&self.tracker),
            total_ticks: (self.total_ticks as f64 * fraction.clamp(0.0, 1.0) / self.units as f64)
                as u64,
            units: units.max(1),
            consumed: AtomicU64::new(0),
        }
    }
}
