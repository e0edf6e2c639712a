use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    /// How long an admitted half-open trial holds the circuit before another
    /// caller may try.
    pub trial_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            trial_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open { retry_in_ms: u64 },
    HalfOpen,
}

/// Health of one backend.
///
/// `failure_threshold` failures inside `failure_window` open the circuit for
/// `cooldown`. Afterwards exactly one caller is admitted (half-open): a success
/// closes the circuit, a failure re-opens it immediately. The admitted caller
/// claims the slot by pushing `open_until_ms` out by `trial_timeout`, so a
/// trial that never reports back frees the slot again. All state is atomic;
/// times are milliseconds since `epoch`.
pub struct CircuitBreaker {
    config: BreakerConfig,
    epoch: Instant,
    window_start_ms: AtomicU64,
    failures: AtomicU32,
    /// 0 while closed
    open_until_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            window_start_ms: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 keeps a trip at the epoch distinguishable from "closed"
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Read-only: closed, or half-open with the trial slot free.
    pub fn is_available(&self) -> bool {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        open_until == 0 || self.now_ms() >= open_until
    }

    /// Admit one call. Always succeeds while closed; in half-open only the
    /// caller that wins the compare-exchange gets through.
    pub fn try_admit(&self) -> bool {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        if open_until == 0 {
            return true;
        }
        let now = self.now_ms();
        if now < open_until {
            return false;
        }
        let trial_until = now + self.config.trial_timeout.as_millis() as u64;
        self.open_until_ms
            .compare_exchange(open_until, trial_until, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn state(&self) -> BreakerState {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        let now = self.now_ms();
        if open_until == 0 {
            BreakerState::Closed
        } else if now >= open_until {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open {
                retry_in_ms: open_until - now,
            }
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.open_until_ms.store(0, Ordering::Release);
    }

    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let now = self.now_ms();
        let cooldown = self.config.cooldown.as_millis() as u64;

        if self.open_until_ms.load(Ordering::Acquire) != 0 {
            // Failed half-open trial, or a late failure while open.
            self.open_until_ms.store(now + cooldown, Ordering::Release);
            self.failures.store(0, Ordering::Release);
            return true;
        }

        let window = self.config.failure_window.as_millis() as u64;
        let window_start = self.window_start_ms.load(Ordering::Acquire);
        let failures = if now.saturating_sub(window_start) > window || window_start == 0 {
            self.window_start_ms.store(now, Ordering::Release);
            self.failures.store(1, Ordering::Release);
            1
        } else {
            self.failures.fetch_add(1, Ordering::AcqRel) + 1
        };

        if failures >= self.config.failure_threshold {
            let tripped = self
                .open_until_ms
                .compare_exchange(0, now + cooldown, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            self.failures.store(0, Ordering::Release);
            return tripped;
        }
        false
    }
}
