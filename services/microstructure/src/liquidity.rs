//! Liquidity Metrics Calculator
//!
//! Derives visible liquidity, imbalance, spread statistics, depth and a
//! composite 0-100 score from a [`BookState`]. The calculation itself is
//! pure; the only history it needs, the trailing spread series, is kept
//! per symbol in a [`SpreadWindow`] the caller owns and passes in.
//!
//! Spread statistics are kept per one-second bucket with Welford's
//! online algorithm and merged across buckets with Chan's parallel
//! combination, so evicting an old second is O(1) and nothing ever
//! stores individual samples.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use services_common::constants::time::NANOS_PER_SEC;
use services_common::{Symbol, Ts};

use crate::book::BookState;
use crate::config::{EngineConfig, ScoreWeights};
use crate::events::Side;

/// Online mean/variance accumulator (Welford)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    /// Empty accumulator
    #[must_use]
    pub const fn new() -> Self {
        Self { count: 0, mean: 0.0, m2: 0.0 }
    }

    /// Add one sample; non-finite samples are ignored
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Combine two accumulators (Chan et al.)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn merge(&self, other: &Self) -> Self {
        if self.count == 0 {
            return *other;
        }
        if other.count == 0 {
            return *self;
        }
        let count = self.count + other.count;
        let n = count as f64;
        let (na, nb) = (self.count as f64, other.count as f64);
        let delta = other.mean - self.mean;
        Self {
            count,
            mean: self.mean + delta * nb / n,
            m2: self.m2 + other.m2 + delta * delta * na * nb / n,
        }
    }

    /// Number of samples
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Sample mean (0 when empty)
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance (0 with fewer than two samples)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0)
    }

    /// Population standard deviation
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Coefficient of variation (0 when the mean is 0)
    #[must_use]
    pub fn coefficient_of_variation(&self) -> f64 {
        if self.mean.abs() < f64::EPSILON {
            return 0.0;
        }
        self.std_dev() / self.mean.abs()
    }

    /// Whether the accumulator holds only finite values
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.m2.is_finite()
    }
}

#[derive(Debug, Clone)]
struct SpreadBucket {
    second: u64,
    stats: RunningStats,
}

/// Trailing per-second spread statistics for one symbol
#[derive(Debug, Clone)]
pub struct SpreadWindow {
    buckets: VecDeque<SpreadBucket>,
    window_secs: u64,
}

impl SpreadWindow {
    /// Window covering the trailing `window_secs` seconds
    #[must_use]
    pub fn new(window_secs: u64) -> Self {
        let window_secs = window_secs.max(1);
        Self {
            buckets: VecDeque::with_capacity(usize::try_from(window_secs).unwrap_or(usize::MAX).min(4096)),
            window_secs,
        }
    }

    /// Change the window length; excess history is evicted on the next observation
    pub fn set_window_secs(&mut self, window_secs: u64) {
        self.window_secs = window_secs.max(1);
    }

    /// Record a spread (ticks) observed at `ts`.
    ///
    /// Samples older than the newest bucket are folded into the newest
    /// bucket rather than reopening history.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&mut self, spread_ticks: i64, ts: Ts) {
        let second = ts.as_nanos() / NANOS_PER_SEC;
        match self.buckets.back_mut() {
            Some(bucket) if bucket.second >= second => bucket.stats.push(spread_ticks as f64),
            _ => {
                let mut stats = RunningStats::new();
                stats.push(spread_ticks as f64);
                self.buckets.push_back(SpreadBucket { second, stats });
            }
        }
        self.evict(second);
    }

    /// Drop buckets that fell out of the window as of `ts` without recording
    pub fn advance(&mut self, ts: Ts) {
        self.evict(ts.as_nanos() / NANOS_PER_SEC);
    }

    fn evict(&mut self, now_second: u64) {
        let oldest_kept = now_second.saturating_sub(self.window_secs - 1);
        while self.buckets.front().is_some_and(|b| b.second < oldest_kept) {
            self.buckets.pop_front();
        }
    }

    /// Statistics merged across all retained buckets
    #[must_use]
    pub fn stats(&self) -> RunningStats {
        self.buckets.iter().fold(RunningStats::new(), |acc, b| acc.merge(&b.stats))
    }

    /// Buckets currently retained
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Forget all history
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Explicit trust flags attached to every metrics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuality {
    /// Values were carried over rather than recomputed
    pub stale: bool,
    /// The book is waiting to resynchronize after a gap
    pub resyncing: bool,
    /// The book is crossed or locked
    pub crossed: bool,
    /// The hidden estimate was not refreshed for this update
    pub hidden_skipped: bool,
}

impl MetricQuality {
    /// No caveats
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !(self.stale || self.resyncing || self.crossed || self.hidden_skipped)
    }
}

/// Immutable liquidity snapshot for one symbol at one sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityMetrics {
    /// Symbol
    pub symbol: Symbol,
    /// Book sequence the metrics reflect
    pub sequence: u64,
    /// Exchange time of that sequence
    pub timestamp: Ts,
    /// Bid + ask size within the depth window
    pub visible_liquidity: u64,
    /// Bid size within the depth window
    pub bid_liquidity: u64,
    /// Ask size within the depth window
    pub ask_liquidity: u64,
    /// Estimated undisplayed size
    pub hidden_liquidity_estimate: f64,
    /// (bid - ask) / (bid + ask), in [-1, 1]
    pub imbalance: f64,
    /// Mean spread in ticks over the time window
    pub avg_spread: f64,
    /// Spread standard deviation in ticks over the time window
    pub spread_volatility: f64,
    /// Levels inside the depth window, both sides
    pub depth: usize,
    /// Composite score in [0, 100]
    pub liquidity_score: f64,
    /// Trust flags
    pub quality: MetricQuality,
}

impl LiquidityMetrics {
    /// Same metrics marked as carried over
    #[must_use]
    pub fn into_stale(mut self) -> Self {
        self.quality.stale = true;
        self
    }
}

/// Order book imbalance in [-1, 1]; 0 when both sides are empty
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn imbalance(bid: u64, ask: u64) -> f64 {
    let total = bid as f64 + ask as f64;
    if total <= 0.0 {
        return 0.0;
    }
    ((bid as f64 - ask as f64) / total).clamp(-1.0, 1.0)
}

/// Composite liquidity score in [0, 100]
#[must_use]
pub fn liquidity_score(weights: &ScoreWeights, liquidity: f64, avg_spread: f64, spread_volatility: f64) -> f64 {
    let total_weight = weights.liquidity + weights.spread + weights.volatility;
    if !(total_weight.is_finite() && total_weight > 0.0) {
        return 0.0;
    }

    let saturate = |value: f64, half_point: f64| {
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        value / (value + half_point)
    };
    let inverse = |value: f64, half_point: f64| {
        let value = if value.is_finite() { value.max(0.0) } else { f64::MAX };
        1.0 / (1.0 + value / half_point)
    };

    let score = weights.liquidity * saturate(liquidity, weights.liquidity_half_point)
        + weights.spread * inverse(avg_spread, weights.spread_half_point)
        + weights.volatility * inverse(spread_volatility, weights.volatility_half_point);

    let score = 100.0 * score / total_weight;
    if score.is_finite() { score.clamp(0.0, 100.0) } else { 0.0 }
}

/// Stateless metrics calculator parameterised by the active config
#[derive(Debug, Clone)]
pub struct LiquidityCalculator {
    depth_window: usize,
    weights: ScoreWeights,
}

impl LiquidityCalculator {
    /// Calculator for an explicit depth window and weights
    #[must_use]
    pub fn new(depth_window: usize, weights: ScoreWeights) -> Self {
        Self { depth_window: depth_window.max(1), weights }
    }

    /// Calculator built from the engine configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.depth_window, config.score_weights.clone())
    }

    /// Depth window in levels per side
    #[must_use]
    pub fn depth_window(&self) -> usize {
        self.depth_window
    }

    /// Bid + ask size inside the depth window
    #[must_use]
    pub fn visible_liquidity(&self, state: &BookState) -> u64 {
        let (bid, _) = state.side_liquidity(Side::Bid, self.depth_window);
        let (ask, _) = state.side_liquidity(Side::Ask, self.depth_window);
        bid.saturating_add(ask)
    }

    /// Feed the spread of `state` into `window` when it is meaningful
    pub fn observe_spread(state: &BookState, window: &mut SpreadWindow) {
        let now = state.last_update_time();
        match state.spread_ticks() {
            Some(spread) if !state.is_crossed() => window.record(spread, now),
            _ => window.advance(now),
        }
    }

    /// Compute a metrics snapshot
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(&self, state: &BookState, spreads: &SpreadWindow, hidden_estimate: f64) -> LiquidityMetrics {
        let (bid_liquidity, bid_levels) = state.side_liquidity(Side::Bid, self.depth_window);
        let (ask_liquidity, ask_levels) = state.side_liquidity(Side::Ask, self.depth_window);
        let visible_liquidity = bid_liquidity.saturating_add(ask_liquidity);

        let hidden = if hidden_estimate.is_finite() { hidden_estimate.max(0.0) } else { 0.0 };

        let spread_stats = spreads.stats();
        let avg_spread = spread_stats.mean();
        let spread_volatility = spread_stats.std_dev();

        let liquidity_score =
            liquidity_score(&self.weights, visible_liquidity as f64 + hidden, avg_spread, spread_volatility);

        LiquidityMetrics {
            symbol: state.symbol(),
            sequence: state.last_sequence(),
            timestamp: state.last_update_time(),
            visible_liquidity,
            bid_liquidity,
            ask_liquidity,
            hidden_liquidity_estimate: hidden,
            imbalance: imbalance(bid_liquidity, ask_liquidity),
            avg_spread,
            spread_volatility,
            depth: bid_levels + ask_levels,
            liquidity_score,
            quality: MetricQuality { crossed: state.is_crossed(), ..MetricQuality::default() },
        }
    }
}
