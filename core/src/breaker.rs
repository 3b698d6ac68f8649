//! Per-endpoint circuit breaker shared by every caller of a provider.
//!
//! State and the time the circuit last opened live in one atomic word, so a
//! transition and its timestamp are decided together by a single
//! compare-and-set. Losing a race is a no-op.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const NEVER: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast without touching the network.
    Open,
    /// One probe call is allowed to decide the next state.
    HalfOpen,
}

impl BreakerState {
    fn code(self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

fn pack(state: BreakerState, opened_at_ms: i64) -> u64 {
    ((opened_at_ms.max(0) as u64) << 2) | state.code()
}

fn unpack(word: u64) -> (BreakerState, i64) {
    (BreakerState::from_code(word & 0b11), (word >> 2) as i64)
}

fn to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NEVER {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    /// Consecutive counted failures that open the circuit
    pub threshold: u32,
    /// Time spent open before a probe is allowed
    pub cooldown: ChronoDuration,
    /// A failure older than this no longer extends the streak
    pub window: ChronoDuration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: ChronoDuration::seconds(60),
            window: ChronoDuration::seconds(300),
        }
    }
}

/// Permission to make one call. Hand it back through `record_*`.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    Normal,
    Probe,
}

/// A permit bound to its breaker. Settle it with `succeed` or `fail`; a
/// half-open permit dropped unsettled (the caller's future was cancelled)
/// counts as a failed half-open call, so the slot is released and the circuit
/// re-opens for another cooldown.
#[must_use]
#[derive(Debug)]
pub struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    permit: CallPermit,
    settled: bool,
}

impl AdmittedCall<'_> {
    pub fn permit(&self) -> CallPermit {
        self.permit
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.permit);
    }

    pub fn fail(mut self, counted: bool) {
        self.settled = true;
        self.breaker.record_failure(self.permit, counted);
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if self.settled || self.permit == CallPermit::Normal {
            return;
        }
        tracing::warn!(endpoint = %self.breaker.endpoint, "half-open call abandoned before it settled");
        self.breaker.record_failure(self.permit, true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejected {
    pub state: BreakerState,
    pub retry_after_secs: u64,
}

/// Operator-facing snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthStatus {
    pub endpoint: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    pub times_opened: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub probe_successes: u64,
    pub probe_failures: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    settings: BreakerSettings,
    word: AtomicU64,
    probe_in_flight: AtomicBool,
    consecutive_failures: AtomicU32,
    last_counted_failure_ms: AtomicI64,
    last_success_ms: AtomicI64,
    last_failure_ms: AtomicI64,
    times_opened: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
    probe_successes: AtomicU64,
    probe_failures: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            word: AtomicU64::new(pack(BreakerState::Closed, 0)),
            probe_in_flight: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_counted_failure_ms: AtomicI64::new(NEVER),
            last_success_ms: AtomicI64::new(NEVER),
            last_failure_ms: AtomicI64::new(NEVER),
            times_opened: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            probe_successes: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> BreakerState {
        unpack(self.word.load(Ordering::SeqCst)).0
    }

    /// Like [`Self::try_acquire`], but the permit settles itself if dropped.
    pub fn admit(&self) -> Result<AdmittedCall<'_>, BreakerRejected> {
        let permit = self.try_acquire()?;
        Ok(AdmittedCall {
            breaker: self,
            permit,
            settled: false,
        })
    }

    pub fn try_acquire(&self) -> Result<CallPermit, BreakerRejected> {
        self.try_acquire_at(Utc::now())
    }

    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> Result<CallPermit, BreakerRejected> {
        let now_ms = now.timestamp_millis();
        loop {
            let word = self.word.load(Ordering::SeqCst);
            match unpack(word) {
                (BreakerState::Closed, _) => return Ok(CallPermit::Normal),
                (BreakerState::Open, opened_at_ms) => {
                    let cooldown_ms = self.settings.cooldown.num_milliseconds();
                    let elapsed_ms = now_ms - opened_at_ms;
                    if elapsed_ms < cooldown_ms {
                        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                        let remaining_ms = (cooldown_ms - elapsed_ms).max(0);
                        return Err(BreakerRejected {
                            state: BreakerState::Open,
                            retry_after_secs: ((remaining_ms + 999) / 1000).max(1) as u64,
                        });
                    }
                    if self
                        .word
                        .compare_exchange(
                            word,
                            pack(BreakerState::HalfOpen, opened_at_ms),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        tracing::info!(endpoint = %self.endpoint, "circuit half-open; admitting one probe");
                    }
                }
                (BreakerState::HalfOpen, _) => {
                    if self
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return Ok(CallPermit::Probe);
                    }
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    return Err(BreakerRejected {
                        state: BreakerState::HalfOpen,
                        retry_after_secs: 1,
                    });
                }
            }
        }
    }

    pub fn record_success(&self, permit: CallPermit) {
        self.record_success_at(permit, Utc::now());
    }

    pub fn record_success_at(&self, permit: CallPermit, now: DateTime<Utc>) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms
            .store(now.timestamp_millis(), Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);

        if permit == CallPermit::Probe {
            let word = self.word.load(Ordering::SeqCst);
            if unpack(word).0 == BreakerState::HalfOpen
                && self
                    .word
                    .compare_exchange(
                        word,
                        pack(BreakerState::Closed, 0),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                tracing::info!(endpoint = %self.endpoint, "circuit closed after successful probe");
            }
            self.probe_in_flight.store(false, Ordering::SeqCst);
        }
    }

    /// Record a failed call. `counted` is false for failures that must not move
    /// the breaker (malformed payloads); they only touch reporting counters.
    pub fn record_failure(&self, permit: CallPermit, counted: bool) {
        self.record_failure_at(permit, counted, Utc::now());
    }

    pub fn record_failure_at(&self, permit: CallPermit, counted: bool, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_ms, Ordering::SeqCst);

        if !counted {
            if permit == CallPermit::Probe {
                self.probe_in_flight.store(false, Ordering::SeqCst);
            }
            return;
        }

        let previous = self.last_counted_failure_ms.swap(now_ms, Ordering::SeqCst);
        let window_ms = self.settings.window.num_milliseconds();
        let streak = if previous != NEVER && now_ms - previous > window_ms {
            self.consecutive_failures.store(1, Ordering::SeqCst);
            1
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
        };

        let word = self.word.load(Ordering::SeqCst);
        match (permit, unpack(word).0) {
            (CallPermit::Probe, BreakerState::HalfOpen) => {
                if self
                    .word
                    .compare_exchange(
                        word,
                        pack(BreakerState::Open, now_ms),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(endpoint = %self.endpoint, "probe failed; circuit re-opened");
                }
            }
            (CallPermit::Normal, BreakerState::Closed) if streak >= self.settings.threshold => {
                if self
                    .word
                    .compare_exchange(
                        word,
                        pack(BreakerState::Open, now_ms),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        consecutive_failures = streak,
                        threshold = self.settings.threshold,
                        "circuit opened"
                    );
                }
            }
            _ => {}
        }

        if permit == CallPermit::Probe {
            self.probe_in_flight.store(false, Ordering::SeqCst);
        }
    }

    /// Health-check outcome. Updates reporting timestamps only; never the streak
    /// or the state.
    pub fn record_probe_at(&self, healthy: bool, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        if healthy {
            self.probe_successes.fetch_add(1, Ordering::Relaxed);
            self.last_success_ms.store(now_ms, Ordering::SeqCst);
        } else {
            self.probe_failures.fetch_add(1, Ordering::Relaxed);
            self.last_failure_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        let (state, opened_at_ms) = unpack(self.word.load(Ordering::SeqCst));
        HealthStatus {
            endpoint: self.endpoint.clone(),
            state,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_success_at: to_datetime(self.last_success_ms.load(Ordering::SeqCst)),
            last_failure_at: to_datetime(self.last_failure_ms.load(Ordering::SeqCst)),
            opened_at: match state {
                BreakerState::Closed => None,
                _ => to_datetime(opened_at_ms),
            },
            times_opened: self.times_opened.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            probe_successes: self.probe_successes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}
