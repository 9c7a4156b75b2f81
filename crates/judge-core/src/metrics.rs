//! Serving metrics for the judge.
//!
//! Two pieces:
//! - [`SlidingWindow`]: rolling latency / availability / error statistics over
//!   the last `window_seconds`, reported by `/metrics` and used as
//!   `perf_judge` evidence for the judge's own SLO.
//! - [`Counters`]: lightweight atomic process counters. Incremented silently
//!   at the call site; [`Counters::flush`] emits them as one `info!` event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::clock::Clock;

// ---------------------------------------------------------------------------
// Sliding window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Sample {
    ts: f64,
    latency_ms: f64,
    status: u16,
    sig_err: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowInfo {
    pub seconds: u64,
}

/// Snapshot of the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSummary {
    pub latency_ms: LatencySummary,
    pub availability: f64,
    pub error_rate: f64,
    pub signature_error_rate: f64,
    pub count: usize,
    pub window: WindowInfo,
}

/// Rolling request statistics.
#[derive(Debug)]
pub struct SlidingWindow {
    window_seconds: u64,
    clock: Arc<dyn Clock>,
    samples: Mutex<VecDeque<Sample>>,
}

impl SlidingWindow {
    pub fn new(window_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_seconds,
            clock,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Record one finished request.
    pub fn observe(&self, latency_ms: f64, status_code: u16, signature_error: bool) {
        let now = self.clock.epoch_secs();
        let cutoff = now - self.window_seconds as f64;
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.push_back(Sample {
            ts: now,
            latency_ms,
            status: status_code,
            sig_err: signature_error,
        });
        while samples.front().is_some_and(|s| s.ts < cutoff) {
            samples.pop_front();
        }
    }

    /// Percentiles and rates over the current window.
    pub fn summary(&self) -> WindowSummary {
        let cutoff = self.clock.epoch_secs() - self.window_seconds as f64;
        let live: Vec<Sample> = {
            let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
            samples.iter().filter(|s| s.ts >= cutoff).copied().collect()
        };
        let window = WindowInfo {
            seconds: self.window_seconds,
        };

        if live.is_empty() {
            return WindowSummary {
                latency_ms: LatencySummary {
                    p50: 0.0,
                    p95: 0.0,
                    p99: 0.0,
                },
                availability: 1.0,
                error_rate: 0.0,
                signature_error_rate: 0.0,
                count: 0,
                window,
            };
        }

        let mut latencies: Vec<f64> = live.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        let n = live.len() as f64;
        let server_errors = live.iter().filter(|s| s.status >= 500).count() as f64;
        let errors = live
            .iter()
            .filter(|s| s.status >= 500 || s.status == 429)
            .count() as f64;
        let sig_errors = live.iter().filter(|s| s.sig_err).count() as f64;

        WindowSummary {
            latency_ms: LatencySummary {
                p50: round_to(percentile(&latencies, 0.50), 2),
                p95: round_to(percentile(&latencies, 0.95), 2),
                p99: round_to(percentile(&latencies, 0.99), 2),
            },
            availability: round_to(1.0 - server_errors / n, 6),
            error_rate: round_to(errors / n, 6),
            signature_error_rate: round_to(sig_errors / n, 6),
            count: live.len(),
            window,
        }
    }
}

/// Linear interpolation between order statistics, `k = (len - 1) * q`.
/// `sorted` must be ascending and non-empty.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = (sorted.len() - 1) as f64 * q;
    let lo = k.floor() as usize;
    let hi = k.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (k - lo as f64)
}

fn round_to(x: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (x * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Process counters owned by the service.
#[derive(Debug, Default)]
pub struct Counters {
    requests: AtomicU64,
    decisions_pass: AtomicU64,
    decisions_fail: AtomicU64,
    rejected_invalid: AtomicU64,
    rejected_auth: AtomicU64,
    rejected_replay: AtomicU64,
    rejected_authz: AtomicU64,
    replay_backend_failures: AtomicU64,
    key_rotations: AtomicU64,
    key_refresh_failures: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub decisions_pass: u64,
    pub decisions_fail: u64,
    pub rejected_invalid: u64,
    pub rejected_auth: u64,
    pub rejected_replay: u64,
    pub rejected_authz: u64,
    pub replay_backend_failures: u64,
    pub key_rotations: u64,
    pub key_refresh_failures: u64,
}

fn bump(counter: &AtomicU64, metric: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric, "counter incremented");
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        bump(&self.requests, "requests");
    }

    pub fn inc_decision(&self, passed: bool) {
        if passed {
            bump(&self.decisions_pass, "decisions_pass");
        } else {
            bump(&self.decisions_fail, "decisions_fail");
        }
    }

    pub fn inc_rejected_invalid(&self) {
        bump(&self.rejected_invalid, "rejected_invalid");
    }

    pub fn inc_rejected_auth(&self) {
        bump(&self.rejected_auth, "rejected_auth");
    }

    pub fn inc_rejected_replay(&self) {
        bump(&self.rejected_replay, "rejected_replay");
    }

    pub fn inc_rejected_authz(&self) {
        bump(&self.rejected_authz, "rejected_authz");
    }

    pub fn inc_replay_backend_failures(&self) {
        bump(&self.replay_backend_failures, "replay_backend_failures");
    }

    pub fn inc_key_rotations(&self) {
        bump(&self.key_rotations, "key_rotations");
    }

    pub fn inc_key_refresh_failures(&self) {
        bump(&self.key_refresh_failures, "key_refresh_failures");
    }

    pub fn replay_backend_failures(&self) -> u64 {
        self.replay_backend_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            requests: load(&self.requests),
            decisions_pass: load(&self.decisions_pass),
            decisions_fail: load(&self.decisions_fail),
            rejected_invalid: load(&self.rejected_invalid),
            rejected_auth: load(&self.rejected_auth),
            rejected_replay: load(&self.rejected_replay),
            rejected_authz: load(&self.rejected_authz),
            replay_backend_failures: load(&self.replay_backend_failures),
            key_rotations: load(&self.key_rotations),
            key_refresh_failures: load(&self.key_refresh_failures),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (shutdown, periodic tick) rather than per request.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            requests = s.requests,
            decisions_pass = s.decisions_pass,
            decisions_fail = s.decisions_fail,
            rejected_invalid = s.rejected_invalid,
            rejected_auth = s.rejected_auth,
            rejected_replay = s.rejected_replay,
            rejected_authz = s.rejected_authz,
            replay_backend_failures = s.replay_backend_failures,
            key_rotations = s.key_rotations,
            key_refresh_failures = s.key_refresh_failures,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn window(secs: u64) -> (SlidingWindow, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        (SlidingWindow::new(secs, clock.clone()), clock)
    }

    #[test]
    fn empty_window_defaults() {
        let (w, _) = window(300);
        let s = w.summary();
        assert_eq!(s.count, 0);
        assert_eq!(s.availability, 1.0);
        assert_eq!(s.error_rate, 0.0);
        assert_eq!(s.latency_ms.p95, 0.0);
        assert_eq!(s.window.seconds, 300);
    }

    #[test]
    fn percentile_interpolates() {
        let v = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&v, 0.5), 25.0);
        assert_eq!(percentile(&v, 0.0), 10.0);
        assert_eq!(percentile(&v, 1.0), 40.0);
        assert_eq!(percentile(&[7.0], 0.99), 7.0);
    }

    #[test]
    fn rates_and_rounding() {
        let (w, _) = window(300);
        w.observe(10.0, 200, false);
        w.observe(20.0, 500, false);
        w.observe(30.0, 429, true);
        let s = w.summary();
        assert_eq!(s.count, 3);
        assert_eq!(s.availability, 0.666667);
        assert_eq!(s.error_rate, 0.666667);
        assert_eq!(s.signature_error_rate, 0.333333);
        assert_eq!(s.latency_ms.p50, 20.0);
        assert_eq!(s.latency_ms.p95, 29.0);
    }

    #[test]
    fn old_samples_expire() {
        let (w, clock) = window(60);
        w.observe(100.0, 200, false);
        clock.advance_secs(61);
        assert_eq!(w.summary().count, 0);
        w.observe(5.0, 200, false);
        let s = w.summary();
        assert_eq!(s.count, 1);
        assert_eq!(s.latency_ms.p99, 5.0);
    }

    #[test]
    fn counters_increment() {
        let c = Counters::new();
        c.inc_requests();
        c.inc_requests();
        c.inc_decision(true);
        c.inc_decision(false);
        c.inc_rejected_replay();
        let s = c.snapshot();
        assert_eq!(s.requests, 2);
        assert_eq!(s.decisions_pass, 1);
        assert_eq!(s.decisions_fail, 1);
        assert_eq!(s.rejected_replay, 1);
        assert_eq!(s.key_rotations, 0);
    }
}
