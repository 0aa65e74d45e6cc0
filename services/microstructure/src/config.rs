//! Engine configuration
//!
//! TOML-backed, every field defaulted so a partial file (or no file) is
//! valid. Workers read the active configuration through a
//! [`ConfigHandle`]: reads are lock-free, writers validate and swap a
//! whole new snapshot in, so a reader sees either the old or the new
//! config and never a mix.
//!
//! ```text
//! Worker ──► handle.load() ──► Arc<EngineConfig> ──► read (never blocked)
//! Reload ──► parse + validate ──► handle.update() ──► atomic swap
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use services_common::Symbol;
use services_common::constants::time::NANOS_PER_MILLI;
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Liquidity score weights and saturation points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Weight of the total liquidity factor
    pub liquidity: f64,
    /// Weight of the inverse spread factor
    pub spread: f64,
    /// Weight of the inverse spread volatility factor
    pub volatility: f64,
    /// Liquidity (units) at which the liquidity factor reaches 0.5
    pub liquidity_half_point: f64,
    /// Average spread (ticks) at which the spread factor reaches 0.5
    pub spread_half_point: f64,
    /// Spread std-dev (ticks) at which the volatility factor reaches 0.5
    pub volatility_half_point: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            liquidity: 0.5,
            spread: 0.3,
            volatility: 0.2,
            liquidity_half_point: 10_000.0,
            spread_half_point: 100.0,
            volatility_half_point: 50.0,
        }
    }
}

/// Hidden-liquidity estimator parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiddenConfig {
    /// Beta prior alpha (refill pseudo-count)
    pub prior_alpha: f64,
    /// Beta prior beta (no-refill pseudo-count)
    pub prior_beta: f64,
    /// Fraction of the peak that must be consumed to count as depletion
    pub depletion_ratio: f64,
    /// Size within this fraction of the peak counts as a refill
    pub refill_tolerance: f64,
    /// Time allowed between depletion and refill
    pub refill_window_ms: u64,
    /// Episodes a level needs before it contributes to the estimate
    pub min_episodes: u32,
    /// Upper bound on per-level iceberg probability
    pub max_probability: f64,
    /// Upper bound on the hidden/visible multiplier
    pub max_multiplier: f64,
    /// Levels tracked per symbol before least recently touched eviction
    pub max_tracked_levels: usize,
}

impl Default for HiddenConfig {
    fn default() -> Self {
        Self {
            prior_alpha: 1.0,
            prior_beta: 4.0,
            depletion_ratio: 0.5,
            refill_tolerance: 0.25,
            refill_window_ms: 500,
            min_episodes: 3,
            max_probability: 0.95,
            max_multiplier: 5.0,
            max_tracked_levels: 256,
        }
    }
}

impl HiddenConfig {
    /// Refill window in nanoseconds, saturating for very large settings
    #[must_use]
    pub fn refill_window_ns(&self) -> u64 {
        self.refill_window_ms.saturating_mul(NANOS_PER_MILLI)
    }
}

/// Latency governor parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// How often the governor evaluates the interval histogram
    pub evaluation_interval_ms: u64,
    /// Consecutive over-target evaluations before degrading
    pub sustain_intervals: u32,
    /// Consecutive within-target evaluations before recovering
    pub cooldown_intervals: u32,
    /// Classification stride multiplier while degraded
    pub degraded_stride_factor: u32,
    /// Feature window length multiplier while degraded
    pub degraded_window_scale: f64,
    /// Minimum samples in an interval for it to be judged
    pub min_samples: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 100,
            sustain_intervals: 3,
            cooldown_intervals: 5,
            degraded_stride_factor: 4,
            degraded_window_scale: 0.5,
            min_samples: 16,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Price levels per side included in liquidity sums
    pub depth_window: usize,
    /// Trailing seconds of spread statistics
    pub time_window_secs: u64,
    /// Liquidity score weights
    pub score_weights: ScoreWeights,
    /// p99 end-to-end latency target
    pub latency_target_p99_us: u64,
    /// p99 latency beyond which the governor goes critical
    pub latency_ceiling_us: u64,
    /// Classify every N-th applied event per symbol
    pub classification_stride: u32,
    /// Feature vectors per classification window
    pub feature_window_len: usize,
    /// Events buffered per symbol while resynchronizing
    pub resync_buffer_capacity: usize,
    /// Hard timeout on one inference call
    pub inference_budget_us: u64,
    /// Worker threads (0 = available parallelism)
    pub workers: usize,
    /// Bounded inbound queue per worker
    pub input_queue_capacity: usize,
    /// Bounded queue of pending snapshot requests
    pub snapshot_request_capacity: usize,
    /// Symbols that keep analytics under load
    pub priority_symbols: Vec<u32>,
    /// Optional JSON model artifact; the built-in baseline is used if absent
    pub model_artifact: Option<PathBuf>,
    /// Hidden-liquidity estimator
    pub hidden: HiddenConfig,
    /// Latency governor
    pub governor: GovernorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            depth_window: 10,
            time_window_secs: 60,
            score_weights: ScoreWeights::default(),
            latency_target_p99_us: 100,
            latency_ceiling_us: 500,
            classification_stride: 8,
            feature_window_len: 32,
            resync_buffer_capacity: 1024,
            inference_budget_us: 250,
            workers: 0,
            input_queue_capacity: 65_536,
            snapshot_request_capacity: 1024,
            priority_symbols: Vec::new(),
            model_artifact: None,
            hidden: HiddenConfig::default(),
            governor: GovernorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns `Parse` for malformed TOML and `Invalid` for inconsistent values
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, otherwise as [`Self::from_toml_str`]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check cross-field consistency
    ///
    /// # Errors
    /// Returns `Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.depth_window == 0 {
            return invalid("depth_window must be at least 1");
        }
        if self.time_window_secs == 0 {
            return invalid("time_window_secs must be at least 1");
        }
        if self.latency_target_p99_us == 0 {
            return invalid("latency_target_p99_us must be positive");
        }
        if self.latency_ceiling_us < self.latency_target_p99_us {
            return invalid("latency_ceiling_us must be >= latency_target_p99_us");
        }
        if self.classification_stride == 0 {
            return invalid("classification_stride must be at least 1");
        }
        if self.feature_window_len == 0 {
            return invalid("feature_window_len must be at least 1");
        }
        if self.resync_buffer_capacity == 0 {
            return invalid("resync_buffer_capacity must be at least 1");
        }
        if self.inference_budget_us == 0 {
            return invalid("inference_budget_us must be positive");
        }
        if self.input_queue_capacity == 0 || self.snapshot_request_capacity == 0 {
            return invalid("queue capacities must be at least 1");
        }

        let w = &self.score_weights;
        let weights = [w.liquidity, w.spread, w.volatility];
        if weights.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return invalid("score weights must be finite and non-negative");
        }
        let half_points = [w.liquidity_half_point, w.spread_half_point, w.volatility_half_point];
        if half_points.iter().any(|x| !x.is_finite() || *x <= 0.0) {
            return invalid("score half points must be finite and positive");
        }

        let h = &self.hidden;
        if !(h.prior_alpha > 0.0 && h.prior_beta > 0.0) {
            return invalid("hidden prior parameters must be positive");
        }
        if !(h.depletion_ratio > 0.0 && h.depletion_ratio < 1.0) {
            return invalid("hidden.depletion_ratio must be in (0, 1)");
        }
        if !(h.refill_tolerance >= 0.0 && h.refill_tolerance < 1.0) {
            return invalid("hidden.refill_tolerance must be in [0, 1)");
        }
        if !(h.max_probability > 0.0 && h.max_probability < 1.0) {
            return invalid("hidden.max_probability must be in (0, 1)");
        }
        if !(h.max_multiplier.is_finite() && h.max_multiplier >= 0.0) {
            return invalid("hidden.max_multiplier must be finite and non-negative");
        }
        if h.refill_window_ms == 0 || h.max_tracked_levels == 0 {
            return invalid("hidden.refill_window_ms and hidden.max_tracked_levels must be positive");
        }

        let g = &self.governor;
        if g.evaluation_interval_ms == 0 || g.sustain_intervals == 0 || g.cooldown_intervals == 0 {
            return invalid("governor intervals must be positive");
        }
        if g.degraded_stride_factor == 0 {
            return invalid("governor.degraded_stride_factor must be at least 1");
        }
        if !(g.degraded_window_scale > 0.0 && g.degraded_window_scale <= 1.0) {
            return invalid("governor.degraded_window_scale must be in (0, 1]");
        }

        Ok(())
    }

    /// Worker count with 0 resolved to the machine's parallelism
    #[must_use]
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    /// Whether a symbol keeps analytics under load
    #[must_use]
    pub fn is_priority(&self, symbol: Symbol) -> bool {
        self.priority_symbols.contains(&symbol.id())
    }

    /// Latency target as a duration
    #[must_use]
    pub fn latency_target(&self) -> Duration {
        Duration::from_micros(self.latency_target_p99_us)
    }

    /// Latency ceiling as a duration
    #[must_use]
    pub fn latency_ceiling(&self) -> Duration {
        Duration::from_micros(self.latency_ceiling_us)
    }

    /// Inference budget as a duration
    #[must_use]
    pub fn inference_budget(&self) -> Duration {
        Duration::from_micros(self.inference_budget_us)
    }
}

/// Shared, atomically swappable configuration
#[derive(Debug)]
pub struct ConfigHandle {
    current: ArcSwap<EngineConfig>,
    generation: AtomicU64,
}

impl ConfigHandle {
    /// Handle seeded with a validated configuration
    ///
    /// # Errors
    /// Returns `Invalid` if the configuration fails validation
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { current: ArcSwap::from_pointee(config), generation: AtomicU64::new(0) })
    }

    /// Current configuration (lock-free)
    #[must_use]
    pub fn load(&self) -> Arc<EngineConfig> {
        self.current.load_full()
    }

    /// Bumped on every successful update
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Validate and publish a new configuration
    ///
    /// # Errors
    /// Returns `Invalid` and keeps the current configuration
    pub fn update(&self, config: EngineConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let previous = self.current.swap(Arc::new(config));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if previous.workers != self.current.load().workers {
            warn!("Worker count changes take effect on restart only");
        }
        info!(generation, "Configuration updated");
        Ok(generation)
    }

    /// Re-read a file and publish it if it parses and validates
    ///
    /// # Errors
    /// Returns the load error and keeps the current configuration
    pub fn reload_from(&self, path: &Path) -> Result<u64, ConfigError> {
        let config = EngineConfig::from_file(path)?;
        self.update(config)
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Poll a config file and hot-reload it when it changes.
///
/// Invalid files are logged and ignored. Returns when `shutdown` flips
/// to `true` or its sender is dropped.
pub async fn watch_file(
    handle: Arc<ConfigHandle>,
    path: PathBuf,
    poll: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_modified = modified_at(&path);
    info!(path = %path.display(), "Watching configuration file");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let modified = modified_at(&path);
                if modified == last_modified {
                    continue;
                }
                last_modified = modified;
                debug!(path = %path.display(), "Configuration file changed");
                match handle.reload_from(&path) {
                    Ok(generation) => info!(generation, path = %path.display(), "Configuration reloaded"),
                    Err(e) => warn!(error = %e, path = %path.display(), "Ignoring invalid configuration"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Configuration watcher stopping");
                    return;
                }
            }
        }
    }
}
