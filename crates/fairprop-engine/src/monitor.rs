//! Latency monitor and circuit breaker.
//!
//! Tracks whether recent calls met the latency budget and moves between
//! three states:
//!
//! - `HEALTHY`: full batching.
//! - `DEGRADED`: batching off, stricter sequence cap.
//! - `RECOVERING`: a fraction of traffic probes normal batching.
//!
//! Predictions are valid in every state; only latency and throughput change.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum HealthState {
    Healthy = 0,
    Degraded = 1,
    Recovering = 2,
}

impl HealthState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Degraded,
            2 => Self::Recovering,
            _ => Self::Healthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Recovering => "RECOVERING",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the scheduler should serve one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// May wait in the micro-window and share a forward pass.
    pub batching: bool,
    /// Stricter token window for this request.
    pub cap: Option<usize>,
    /// The monitor forced the fallback path.
    pub degraded: bool,
}

impl Admission {
    const NORMAL: Self = Self {
        batching: true,
        cap: None,
        degraded: false,
    };
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub state: HealthState,
    pub samples: usize,
    pub over_budget: usize,
    pub transitions: u64,
}

struct Window {
    /// One flag per recent call: did it exceed the budget.
    over_budget: VecDeque<bool>,
    over_count: usize,
    state: HealthState,
    last_violation: Option<Instant>,
    /// Consecutive in-budget calls while RECOVERING.
    streak: u32,
}

impl Window {
    fn push(&mut self, over: bool, capacity: usize) {
        if self.over_budget.len() == capacity
            && let Some(true) = self.over_budget.pop_front()
        {
            self.over_count -= 1;
        }
        self.over_budget.push_back(over);
        if over {
            self.over_count += 1;
        }
    }

    fn clear(&mut self) {
        self.over_budget.clear();
        self.over_count = 0;
    }
}

pub struct LatencyMonitor {
    config: MonitorConfig,
    /// Mirror of `window.state`, written only under the lock.
    state: AtomicU8,
    window: Mutex<Window>,
    admitted: AtomicU64,
    transitions: AtomicU64,
}

impl LatencyMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let window = Window {
            over_budget: VecDeque::with_capacity(config.window_size),
            over_count: 0,
            state: HealthState::Healthy,
            last_violation: None,
            streak: 0,
        };
        Self {
            config,
            state: AtomicU8::new(HealthState::Healthy as u8),
            window: Mutex::new(window),
            admitted: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> HealthState {
        self.state_at(Instant::now())
    }

    /// Current state, applying the DEGRADED cool-down as of `now`.
    pub fn state_at(&self, now: Instant) -> HealthState {
        let current = HealthState::from_u8(self.state.load(Ordering::Acquire));
        if current != HealthState::Degraded {
            return current;
        }
        let mut window = self.window.lock();
        self.cool_down(&mut window, now);
        window.state
    }

    pub fn record(&self, latency: Duration) {
        self.record_at(latency, Instant::now());
    }

    /// Feed one completed call's latency observed at `now`.
    pub fn record_at(&self, latency: Duration, now: Instant) {
        let over = latency > self.config.latency_budget();
        let mut window = self.window.lock();
        self.cool_down(&mut window, now);

        window.push(over, self.config.window_size);
        if over {
            window.last_violation = Some(now);
        }

        match window.state {
            HealthState::Healthy => {
                let samples = window.over_budget.len();
                let fraction = window.over_count as f64 / samples as f64;
                if samples >= self.config.min_samples && fraction > self.config.trip_fraction {
                    warn!(
                        over_budget = window.over_count,
                        samples,
                        budget_ms = self.config.latency_budget_ms,
                        "latency budget exceeded, entering degraded mode"
                    );
                    self.transition(&mut window, HealthState::Degraded);
                }
            }
            HealthState::Degraded => {}
            HealthState::Recovering => {
                if over {
                    warn!(
                        latency_ms = latency.as_secs_f64() * 1000.0,
                        "violation while probing, back to degraded mode"
                    );
                    self.transition(&mut window, HealthState::Degraded);
                } else {
                    window.streak += 1;
                    if window.streak >= self.config.recovery_calls {
                        self.transition(&mut window, HealthState::Healthy);
                    }
                }
            }
        }
    }

    /// Decide how the next request is served.
    pub fn admit(&self) -> Admission {
        let fallback = Admission {
            batching: false,
            cap: Some(self.config.degraded_max_sequence_length),
            degraded: true,
        };
        match self.state() {
            HealthState::Healthy => Admission::NORMAL,
            HealthState::Degraded => fallback,
            HealthState::Recovering => {
                let n = self.admitted.fetch_add(1, Ordering::Relaxed);
                if n % self.config.probe_interval() == 0 {
                    Admission::NORMAL
                } else {
                    fallback
                }
            }
        }
    }

    /// Enter DEGRADED immediately, as if the budget had just been blown.
    pub fn force_degraded(&self) {
        let mut window = self.window.lock();
        window.last_violation = Some(Instant::now());
        if window.state != HealthState::Degraded {
            warn!("degraded mode forced");
            self.transition(&mut window, HealthState::Degraded);
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.state();
        let window = self.window.lock();
        MonitorSnapshot {
            state,
            samples: window.over_budget.len(),
            over_budget: window.over_count,
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    fn cool_down(&self, window: &mut Window, now: Instant) {
        if window.state != HealthState::Degraded {
            return;
        }
        let quiet = window
            .last_violation
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.cooldown());
        if quiet {
            info!(
                probe_fraction = self.config.probe_fraction,
                "cool-down elapsed, probing with batching"
            );
            self.transition(window, HealthState::Recovering);
        }
    }

    fn transition(&self, window: &mut Window, to: HealthState) {
        let from = window.state;
        window.state = to;
        window.streak = 0;
        if to != HealthState::Degraded {
            window.clear();
        }
        self.state.store(to as u8, Ordering::Release);
        self.transitions.fetch_add(1, Ordering::Relaxed);
        if to == HealthState::Healthy {
            info!(%from, "latency recovered, full batching restored");
        }
    }
}

impl std::fmt::Debug for LatencyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyMonitor")
            .field("state", &HealthState::from_u8(self.state.load(Ordering::Acquire)))
            .field("config", &self.config)
            .finish()
    }
}
