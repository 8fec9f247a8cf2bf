// crates/retrovue-core/src/clock.rs
//
// MasterClock: the process-wide authoritative time source. Channels never
// adjust it (no NTP/PTP steering here, SPEC_FULL.md §1 Non-goals) — they only
// read it. Injected as a shared handle rather than a global, per SPEC_FULL.md
// §9 "Global mutable state -> explicit injection".

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::PlayoutError;

/// Shared, read-only (from a channel's perspective) time source.
pub trait MasterClock: Send + Sync {
    /// Current UTC time in microseconds. Strictly monotonic across any two
    /// calls on one instance.
    fn now_utc_us(&self) -> i64;

    /// Monotonic steady-clock reading in seconds.
    fn now_monotonic_s(&self) -> f64;

    /// Deterministic mapping from a scheduled PTS to the UTC deadline at
    /// which the frame is due. Stable across repeated calls with the same
    /// `pts_us`; strictly increasing in `pts_us`.
    fn scheduled_to_utc_us(&self, pts_us: i64) -> Result<i64, PlayoutError>;

    /// Reported drift, in parts-per-million.
    fn drift_ppm(&self) -> f64;

    /// Suspend the caller until `now_utc_us() >= deadline_us`, or until
    /// `cancel` is observed set — checked at least every 10 ms.
    fn wait_until_utc_us(&self, deadline_us: i64, cancel: &AtomicBool);
}

/// Real wall-clock-backed implementation.
pub struct RealClock {
    epoch_instant: Instant,
    epoch_utc_us: i64,
    rate_ppm: AtomicI64,
    last_returned: AtomicI64,
}

impl RealClock {
    pub fn new() -> Self {
        let epoch_utc_us = utc_now_us();
        RealClock {
            epoch_instant: Instant::now(),
            epoch_utc_us,
            rate_ppm: AtomicI64::new(0),
            last_returned: AtomicI64::new(i64::MIN),
        }
    }

    pub fn set_rate_ppm(&self, rate_ppm: f64) {
        self.rate_ppm
            .store((rate_ppm * 1_000.0) as i64, Ordering::Relaxed);
    }

    fn rate_ppm_f64(&self) -> f64 {
        self.rate_ppm.load(Ordering::Relaxed) as f64 / 1_000.0
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

fn utc_now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

impl MasterClock for RealClock {
    fn now_utc_us(&self) -> i64 {
        let elapsed = self.epoch_instant.elapsed();
        let raw = self.epoch_utc_us + elapsed.as_micros() as i64;
        // Enforce strict monotonicity even if the underlying SystemTime/
        // Instant pairing ever produces a non-increasing reading (e.g. under
        // heavy scheduling jitter) — callers depend on this guarantee.
        let mut prev = self.last_returned.load(Ordering::Relaxed);
        loop {
            let next = raw.max(prev + 1);
            match self.last_returned.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn now_monotonic_s(&self) -> f64 {
        self.epoch_instant.elapsed().as_secs_f64()
    }

    fn scheduled_to_utc_us(&self, pts_us: i64) -> Result<i64, PlayoutError> {
        scheduled_to_utc_us(self.epoch_utc_us, pts_us, self.rate_ppm_f64())
    }

    fn drift_ppm(&self) -> f64 {
        self.rate_ppm_f64()
    }

    fn wait_until_utc_us(&self, deadline_us: i64, cancel: &AtomicBool) {
        const POLL: Duration = Duration::from_millis(2);
        while !cancel.load(Ordering::Relaxed) {
            let now = self.now_utc_us();
            if now >= deadline_us {
                return;
            }
            let remaining_us = (deadline_us - now).max(0) as u64;
            let sleep_for = POLL.min(Duration::from_micros(remaining_us));
            std::thread::sleep(sleep_for);
        }
    }
}

/// Deterministic PTS -> UTC mapping shared by `RealClock` and `TestClock`.
///
/// `epoch_utc_us + pts_us * (1 + rate_ppm * 1e-6)`.
pub fn scheduled_to_utc_us(
    epoch_utc_us: i64,
    pts_us: i64,
    rate_ppm: f64,
) -> Result<i64, PlayoutError> {
    let scaled = pts_us as f64 * (1.0 + rate_ppm * 1e-6);
    let value = epoch_utc_us as f64 + scaled;
    if !value.is_finite() || value > i64::MAX as f64 || value < i64::MIN as f64 {
        return Err(PlayoutError::InvalidTime {
            reason: format!("scheduled_to_utc_us overflow for pts_us={pts_us}"),
        });
    }
    Ok(value.round() as i64)
}

/// Explicitly-advanceable clock for deterministic tests. No wall-clock waits:
/// `wait_until_utc_us` returns as soon as the caller has advanced `now` past
/// the deadline (or returns immediately if already past).
pub struct TestClock {
    inner: Mutex<TestClockState>,
}

struct TestClockState {
    now_utc_us: i64,
    epoch_utc_us: i64,
    rate_ppm: f64,
}

impl TestClock {
    pub fn new(epoch_utc_us: i64) -> Arc<Self> {
        Arc::new(TestClock {
            inner: Mutex::new(TestClockState {
                now_utc_us: epoch_utc_us,
                epoch_utc_us,
                rate_ppm: 0.0,
            }),
        })
    }

    pub fn with_rate_ppm(epoch_utc_us: i64, rate_ppm: f64) -> Arc<Self> {
        let clock = TestClock::new(epoch_utc_us);
        clock.set_rate_ppm(rate_ppm);
        clock
    }

    pub fn set_now(&self, now_utc_us: i64) {
        self.inner.lock().unwrap().now_utc_us = now_utc_us;
    }

    pub fn advance_microseconds(&self, delta_us: i64) {
        let mut state = self.inner.lock().unwrap();
        state.now_utc_us += delta_us;
    }

    pub fn set_rate_ppm(&self, rate_ppm: f64) {
        self.inner.lock().unwrap().rate_ppm = rate_ppm;
    }
}

impl MasterClock for TestClock {
    fn now_utc_us(&self) -> i64 {
        self.inner.lock().unwrap().now_utc_us
    }

    fn now_monotonic_s(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        (state.now_utc_us - state.epoch_utc_us) as f64 / 1_000_000.0
    }

    fn scheduled_to_utc_us(&self, pts_us: i64) -> Result<i64, PlayoutError> {
        let state = self.inner.lock().unwrap();
        scheduled_to_utc_us(state.epoch_utc_us, pts_us, state.rate_ppm)
    }

    fn drift_ppm(&self) -> f64 {
        self.inner.lock().unwrap().rate_ppm
    }

    fn wait_until_utc_us(&self, deadline_us: i64, cancel: &AtomicBool) {
        // Tests drive time explicitly via advance_microseconds/set_now; a
        // real wait here would deadlock since nothing else advances it.
        // Busy-poll with no sleep so a test thread driving the clock from
        // another thread is observed promptly, same cancellation contract
        // as RealClock.
        loop {
            if cancel.load(Ordering::Relaxed) || self.now_utc_us() >= deadline_us {
                return;
            }
            std::thread::yield_now();
        }
    }
}
