//! Hidden-Liquidity Estimator
//!
//! Estimates undisplayed size from replenishment evidence. Each price
//! level is watched for *episodes*: the displayed size is drawn down
//! (depletion) and then either restored to near its peak within the
//! refill window (success) or not (failure). Episodes update a
//! Beta-Bernoulli posterior per level:
//!
//! ```text
//! p(iceberg)        = α / (α + β)           posterior mean, capped
//! expected refills  = p / (1 - p)
//! multiplier        = Σ wᵢ·oddsᵢ / Σ wᵢ     over levels with enough episodes
//! wᵢ                = mean refill size × 1/(1 + cv(refill size))
//! hidden estimate   = visible × min(multiplier, max_multiplier)
//! ```
//!
//! The output is always finite and non-negative. Contradictory input at
//! a level (timestamps moving backwards, non-finite statistics) resets
//! that level instead of poisoning the estimate.

use ahash::AHashMap;
use services_common::{Px, Ts};
use tracing::debug;

use crate::book::BookDelta;
use crate::config::HiddenConfig;
use crate::events::Side;
use crate::liquidity::RunningStats;

#[derive(Debug, Clone)]
struct LevelTracker {
    size: u64,
    peak: u64,
    last_ts: Ts,
    depleted_at: Option<Ts>,
    alpha: f64,
    beta: f64,
    episodes: u32,
    refill_sizes: RunningStats,
    refill_latency_ns: RunningStats,
    last_touch: u64,
}

impl LevelTracker {
    fn new(config: &HiddenConfig, ts: Ts, touch: u64) -> Self {
        Self {
            size: 0,
            peak: 0,
            last_ts: ts,
            depleted_at: None,
            alpha: config.prior_alpha,
            beta: config.prior_beta,
            episodes: 0,
            refill_sizes: RunningStats::new(),
            refill_latency_ns: RunningStats::new(),
            last_touch: touch,
        }
    }

    fn probability(&self, cap: f64) -> f64 {
        let p = self.alpha / (self.alpha + self.beta);
        if p.is_finite() { p.clamp(0.0, cap) } else { 0.0 }
    }

    fn expire(&mut self, now: Ts, window_ns: u64) {
        if let Some(depleted_at) = self.depleted_at {
            if now.nanos_since(depleted_at) > window_ns {
                self.beta += 1.0;
                self.episodes = self.episodes.saturating_add(1);
                self.depleted_at = None;
                self.peak = self.size;
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn observe(&mut self, config: &HiddenConfig, new_size: u64, ts: Ts) {
        self.expire(ts, config.refill_window_ns());

        match self.depleted_at {
            Some(depleted_at) => {
                let refill_floor = self.peak as f64 * (1.0 - config.refill_tolerance);
                if new_size > self.size && new_size as f64 >= refill_floor {
                    self.alpha += 1.0;
                    self.episodes = self.episodes.saturating_add(1);
                    self.refill_sizes.push((new_size - self.size) as f64);
                    self.refill_latency_ns.push(ts.nanos_since(depleted_at) as f64);
                    self.depleted_at = None;
                    self.peak = self.peak.max(new_size);
                }
            }
            None => {
                self.peak = self.peak.max(new_size);
                let depletion_ceiling = self.peak as f64 * (1.0 - config.depletion_ratio);
                if self.peak > 0 && (new_size as f64) <= depletion_ceiling {
                    self.depleted_at = Some(ts);
                }
            }
        }

        self.size = new_size;
        self.last_ts = ts;
    }

    fn is_consistent(&self) -> bool {
        self.alpha.is_finite() && self.beta.is_finite() && self.refill_sizes.is_finite() && self.refill_latency_ns.is_finite()
    }
}

/// Per-level posterior view, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelEstimate {
    /// Side of the level
    pub side: Side,
    /// Price of the level
    pub price: Px,
    /// Posterior mean iceberg probability (capped)
    pub probability: f64,
    /// Completed depletion episodes
    pub episodes: u32,
    /// Mean size restored per refill
    pub mean_refill: f64,
    /// Mean depletion-to-refill latency in nanoseconds
    pub mean_refill_latency_ns: f64,
}

/// Stateful Beta-Bernoulli estimator for one symbol
#[derive(Debug, Clone)]
pub struct HiddenLiquidityEstimator {
    config: HiddenConfig,
    levels: AHashMap<(Side, Px), LevelTracker>,
    touch: u64,
    last_estimate: f64,
}

impl HiddenLiquidityEstimator {
    /// Empty estimator
    #[must_use]
    pub fn new(config: HiddenConfig) -> Self {
        Self { config, levels: AHashMap::new(), touch: 0, last_estimate: 0.0 }
    }

    /// Replace parameters; existing evidence is kept
    pub fn set_config(&mut self, config: HiddenConfig) {
        self.config = config;
        while self.levels.len() > self.config.max_tracked_levels {
            self.evict_lru();
        }
    }

    /// Forget all evidence
    pub fn reset(&mut self) {
        self.levels.clear();
        self.last_estimate = 0.0;
    }

    /// Levels currently tracked
    #[must_use]
    pub fn tracked_levels(&self) -> usize {
        self.levels.len()
    }

    /// Most recent estimate
    #[must_use]
    pub fn last_estimate(&self) -> f64 {
        self.last_estimate
    }

    /// Posterior view of one level
    #[must_use]
    pub fn level(&self, side: Side, price: Px) -> Option<LevelEstimate> {
        self.levels.get(&(side, price)).map(|t| LevelEstimate {
            side,
            price,
            probability: t.probability(self.config.max_probability),
            episodes: t.episodes,
            mean_refill: t.refill_sizes.mean(),
            mean_refill_latency_ns: t.refill_latency_ns.mean(),
        })
    }

    /// Feed one applied book change
    pub fn observe(&mut self, delta: &BookDelta) {
        if !delta.is_state_change() {
            return;
        }
        let key = (delta.side, delta.price);
        let ts = delta.exchange_time;
        self.touch = self.touch.wrapping_add(1);
        let touch = self.touch;

        if !self.levels.contains_key(&key) && self.levels.len() >= self.config.max_tracked_levels {
            self.evict_lru();
        }

        let config = &self.config;
        let tracker = self.levels.entry(key).or_insert_with(|| LevelTracker::new(config, ts, touch));

        if ts < tracker.last_ts || !tracker.is_consistent() {
            debug!(side = ?delta.side, price = %delta.price, "Resetting hidden-liquidity level on contradictory input");
            *tracker = LevelTracker::new(config, ts, touch);
        }

        tracker.last_touch = touch;
        tracker.observe(config, delta.new_size.as_u64(), ts);
    }

    /// Current estimate given the visible liquidity at `now`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&mut self, now: Ts, visible: u64) -> f64 {
        let window_ns = self.config.refill_window_ns();
        let cap = self.config.max_probability;
        let min_episodes = self.config.min_episodes;

        let mut weighted_odds = 0.0;
        let mut total_weight = 0.0;
        for tracker in self.levels.values_mut() {
            tracker.expire(now, window_ns);
            if tracker.episodes < min_episodes {
                continue;
            }
            let p = tracker.probability(cap);
            let odds = p / (1.0 - p);
            let weight = tracker.refill_sizes.mean() / (1.0 + tracker.refill_sizes.coefficient_of_variation());
            if odds.is_finite() && weight.is_finite() && weight > 0.0 {
                weighted_odds += weight * odds;
                total_weight += weight;
            }
        }

        let multiplier = if total_weight > 0.0 {
            (weighted_odds / total_weight).clamp(0.0, self.config.max_multiplier)
        } else {
            0.0
        };

        let estimate = visible as f64 * multiplier;
        self.last_estimate = if estimate.is_finite() { estimate.max(0.0) } else { 0.0 };
        self.last_estimate
    }

    /// Observe a batch of recent changes and return the updated estimate
    pub fn update(&mut self, recent: &[BookDelta], visible: u64) -> f64 {
        for delta in recent {
            self.observe(delta);
        }
        let now = recent.iter().map(|d| d.exchange_time).max().unwrap_or_default();
        self.estimate(now, visible)
    }

    fn evict_lru(&mut self) {
        let oldest = self.levels.iter().min_by_key(|(_, t)| t.last_touch).map(|(k, _)| *k);
        if let Some(key) = oldest {
            self.levels.remove(&key);
        }
    }
}
