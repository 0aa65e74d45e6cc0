//! Latency Governor
//!
//! Times every pipeline stage into HDR histograms and, once per
//! evaluation interval, judges the interval's end-to-end p99 against the
//! configured target and ceiling:
//!
//! ```text
//!            p99 > target for N intervals      p99 > ceiling
//!  Nominal ─────────────────────────────► Degraded ─────────► Critical
//!     ▲                                       │                   │
//!     └──────── p99 <= target for M intervals ┴───────────────────┘
//! ```
//!
//! The state machine escalates at most one step per evaluation. The
//! current state lives in an atomic so other threads can observe it
//! without touching the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::stats::{EngineStats, Stage, new_histogram};

/// Degradation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GovernorState {
    /// Full analytics
    Nominal = 0,
    /// Reduced classification and hidden estimation
    Degraded = 1,
    /// Non-priority analytics shed
    Critical = 2,
}

impl GovernorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => GovernorState::Nominal,
            1 => GovernorState::Degraded,
            _ => GovernorState::Critical,
        }
    }
}

/// What a symbol's pipeline should do for the next update
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Directives {
    /// Classify every N-th update
    pub classification_stride: u32,
    /// Fraction of the feature window handed to the model
    pub window_scale: f64,
    /// Skip the hidden-liquidity estimator
    pub skip_hidden: bool,
    /// Skip all analytics (book still maintained)
    pub shed: bool,
}

/// Lock-free view of a governor's state
#[derive(Debug, Clone)]
pub struct GovernorHandle {
    state: Arc<AtomicU8>,
}

impl GovernorHandle {
    /// Current state
    #[must_use]
    pub fn state(&self) -> GovernorState {
        GovernorState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// State before the evaluation
    pub previous: GovernorState,
    /// State after the evaluation
    pub state: GovernorState,
    /// End-to-end p99 of the interval, nanoseconds
    pub p99_ns: u64,
    /// Samples in the interval
    pub samples: u64,
}

impl Evaluation {
    /// Whether the state changed
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != self.state
    }
}

#[derive(Debug, Clone)]
struct Thresholds {
    target_ns: u64,
    ceiling_ns: u64,
    interval: Duration,
    sustain: u32,
    cooldown: u32,
    min_samples: u64,
    base_stride: u32,
    stride_factor: u32,
    window_scale: f64,
}

impl Thresholds {
    fn from_config(config: &EngineConfig) -> Self {
        let g = &config.governor;
        Self {
            target_ns: config.latency_target_p99_us.saturating_mul(1_000),
            ceiling_ns: config.latency_ceiling_us.saturating_mul(1_000),
            interval: Duration::from_millis(g.evaluation_interval_ms),
            sustain: g.sustain_intervals,
            cooldown: g.cooldown_intervals,
            min_samples: g.min_samples,
            base_stride: config.classification_stride,
            stride_factor: g.degraded_stride_factor,
            window_scale: g.degraded_window_scale,
        }
    }
}

/// Per-worker latency governor
pub struct LatencyGovernor {
    thresholds: Thresholds,
    state: Arc<AtomicU8>,
    interval: Vec<Histogram<u64>>,
    over_target: u32,
    within_target: u32,
    last_evaluation: Instant,
    stats: Arc<EngineStats>,
}

impl LatencyGovernor {
    /// Governor starting in `Nominal`
    ///
    /// # Errors
    /// Returns `Histogram` if the stage histograms cannot be allocated
    pub fn new(config: &EngineConfig, stats: Arc<EngineStats>, now: Instant) -> Result<Self, EngineError> {
        let interval = (0..Stage::COUNT).map(|_| new_histogram()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            thresholds: Thresholds::from_config(config),
            state: Arc::new(AtomicU8::new(GovernorState::Nominal as u8)),
            interval,
            over_target: 0,
            within_target: 0,
            last_evaluation: now,
            stats,
        })
    }

    /// Pick up new thresholds; the current state and counters are kept
    pub fn apply_config(&mut self, config: &EngineConfig) {
        self.thresholds = Thresholds::from_config(config);
    }

    /// Observer handle
    #[must_use]
    pub fn handle(&self) -> GovernorHandle {
        GovernorHandle { state: Arc::clone(&self.state) }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> GovernorState {
        GovernorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Record one stage latency
    #[inline]
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX).max(1);
        if let Some(hist) = self.interval.get_mut(stage as usize) {
            let _ = hist.record(nanos);
        }
    }

    /// Directives for a symbol under the current state
    #[must_use]
    pub fn directives(&self, priority: bool) -> Directives {
        let t = &self.thresholds;
        let degraded = Directives {
            classification_stride: t.base_stride.saturating_mul(t.stride_factor).max(1),
            window_scale: t.window_scale,
            skip_hidden: !priority,
            shed: false,
        };
        match self.state() {
            GovernorState::Nominal => Directives {
                classification_stride: t.base_stride.max(1),
                window_scale: 1.0,
                skip_hidden: false,
                shed: false,
            },
            GovernorState::Degraded => degraded,
            GovernorState::Critical if priority => degraded,
            GovernorState::Critical => Directives { shed: true, skip_hidden: true, ..degraded },
        }
    }

    /// Evaluate if the interval has elapsed; returns the outcome when it did
    pub fn maybe_evaluate(&mut self, now: Instant) -> Option<Evaluation> {
        if now.saturating_duration_since(self.last_evaluation) < self.thresholds.interval {
            return None;
        }
        Some(self.evaluate(now))
    }

    /// Judge the current interval and start a new one
    pub fn evaluate(&mut self, now: Instant) -> Evaluation {
        self.last_evaluation = now;

        let total = &self.interval[Stage::Total as usize];
        let samples = total.len();
        let p99_ns = if samples == 0 { 0 } else { total.value_at_quantile(0.99) };
        // Too few samples to judge: treat as within target
        let p99_judged = if samples < self.thresholds.min_samples { 0 } else { p99_ns };

        let previous = self.state();
        let next = self.transition(previous, p99_judged);

        self.stats.absorb_latency(&self.interval);
        for hist in &mut self.interval {
            hist.reset();
        }

        if next != previous {
            self.state.store(next as u8, Ordering::Release);
            self.stats.record_governor_transition();
            if previous == GovernorState::Nominal && next == GovernorState::Degraded {
                self.stats.record_governor_degradation();
            }
            match next {
                GovernorState::Nominal => info!(p99_ns, samples, from = ?previous, "Latency governor recovered"),
                _ => warn!(p99_ns, samples, from = ?previous, to = ?next, "Latency governor degrading"),
            }
        } else {
            debug!(p99_ns, samples, state = ?next, "Latency governor evaluation");
        }

        Evaluation { previous, state: next, p99_ns, samples }
    }

    fn transition(&mut self, state: GovernorState, p99_ns: u64) -> GovernorState {
        let t = &self.thresholds;
        let over_target = p99_ns > t.target_ns;

        if over_target {
            self.within_target = 0;
        } else {
            self.over_target = 0;
        }

        match state {
            GovernorState::Nominal if over_target => {
                self.over_target += 1;
                if self.over_target >= t.sustain {
                    self.over_target = 0;
                    GovernorState::Degraded
                } else {
                    GovernorState::Nominal
                }
            }
            GovernorState::Nominal => GovernorState::Nominal,
            GovernorState::Degraded if p99_ns > t.ceiling_ns => GovernorState::Critical,
            GovernorState::Degraded | GovernorState::Critical if over_target => state,
            GovernorState::Degraded | GovernorState::Critical => {
                self.within_target += 1;
                if self.within_target >= t.cooldown {
                    self.within_target = 0;
                    GovernorState::Nominal
                } else {
                    state
                }
            }
        }
    }
}
