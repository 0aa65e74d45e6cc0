//! Frozen pattern models
//!
//! The classifier talks to models through [`PatternModel`]; concrete
//! models are injected at startup and can be swapped at runtime through
//! a [`ModelSlot`] without touching the hot path. The bundled model is a
//! multinomial logistic (softmax) layer over window summary statistics,
//! loaded from a JSON artifact.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use arc_swap::ArcSwap;
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::features::FEATURE_DIM;

/// Coarse liquidity regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LiquidityLevel {
    /// Thin book
    VeryLow,
    /// Below typical depth
    Low,
    /// Typical depth
    Medium,
    /// Above typical depth
    High,
    /// Deep book
    VeryHigh,
}

impl LiquidityLevel {
    /// Regime implied by a 0-100 liquidity score
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 80.0 => Self::VeryHigh,
            s if s >= 60.0 => Self::High,
            s if s >= 40.0 => Self::Medium,
            s if s >= 20.0 => Self::Low,
            _ => Self::VeryLow,
        }
    }

    /// Regime for a value against four ascending thresholds
    #[must_use]
    pub fn from_thresholds(value: f64, thresholds: &[f64; 4]) -> Self {
        match thresholds.iter().filter(|t| value >= **t).count() {
            0 => Self::VeryLow,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::VeryHigh,
        }
    }
}

/// Short-horizon microstructure pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternLabel {
    /// Nothing unusual
    Normal,
    /// Displayed size repeatedly replenished at one level
    IcebergOrder,
    /// Persistent pressure absorbed without price movement
    HiddenLiquidity,
    /// Rapid add/cancel churn
    QuoteStuffing,
    /// No classification available
    Unknown,
}

/// Raw model answer for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Liquidity regime
    pub liquidity_level: LiquidityLevel,
    /// Most likely pattern
    pub pattern_label: PatternLabel,
    /// Probability of the chosen pattern
    pub confidence: f64,
    /// Expected short-horizon mid volatility in ticks
    pub predicted_volatility: f64,
}

/// Identity and runtime contract of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model name
    pub name: String,
    /// Artifact version
    pub version: String,
    /// Feature vectors per input window (0 accepts the configured length)
    pub window_len: usize,
    /// Declared worst-case inference latency; 0 leaves the engine budget alone
    pub max_latency_us: u64,
}

impl ModelMetadata {
    /// Engine budget tightened to the declared worst case
    #[must_use]
    pub fn inference_budget(&self, engine_budget: Duration) -> Duration {
        match self.max_latency_us {
            0 => engine_budget,
            declared => engine_budget.min(Duration::from_micros(declared)),
        }
    }
}

/// Frozen inference model
pub trait PatternModel: Send + Sync {
    /// Classify a `rows x FEATURE_DIM` window, oldest row first
    fn infer(&self, window: ArrayView2<'_, f64>) -> Result<ModelOutput>;

    /// Model metadata
    fn metadata(&self) -> &ModelMetadata;
}

/// Summary statistics the softmax layer consumes
pub const SUMMARY_DIM: usize = 5;

/// Reduce a feature window to its summary vector:
/// mean |imbalance|, size dispersion, log spread, log momentum
/// volatility and size reversal rate.
#[must_use]
pub fn summarize(window: ArrayView2<'_, f64>) -> [f64; SUMMARY_DIM] {
    let rows = window.nrows();
    if rows == 0 || window.ncols() != FEATURE_DIM {
        return [0.0; SUMMARY_DIM];
    }
    let size = window.column(1);
    let spread = window.column(2);
    let imbalance = window.column(3);
    let momentum = window.column(4);

    let mean_abs_imbalance = imbalance.mapv(f64::abs).mean().unwrap_or(0.0);
    let mean_size = size.mean().unwrap_or(0.0);
    let size_cv = if mean_size > 0.0 { size.std(0.0) / mean_size } else { 0.0 };
    let log_spread = spread.mean().unwrap_or(0.0).max(0.0).ln_1p();
    let log_momentum_vol = momentum.std(0.0).ln_1p();

    let diffs: Vec<f64> = size.windows(2).into_iter().map(|w| w[1] - w[0]).filter(|d| *d != 0.0).collect();
    #[allow(clippy::cast_precision_loss)]
    let reversal_rate = if diffs.len() < 2 {
        0.0
    } else {
        let flips = diffs.windows(2).filter(|p| p[0].signum() != p[1].signum()).count();
        flips as f64 / (diffs.len() - 1) as f64
    };

    let summary = [mean_abs_imbalance, size_cv, log_spread, log_momentum_vol, reversal_rate];
    summary.map(|x| if x.is_finite() { x } else { 0.0 })
}

/// JSON artifact for [`SoftmaxPatternModel`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxArtifact {
    /// Model name
    pub name: String,
    /// Artifact version
    pub version: String,
    /// Feature vectors per input window
    pub window_len: usize,
    /// Expected worst-case inference latency
    pub max_latency_us: u64,
    /// Output classes, one per weight row
    pub labels: Vec<PatternLabel>,
    /// Per-class weights over the summary vector
    pub weights: Vec<[f64; SUMMARY_DIM]>,
    /// Per-class bias
    pub bias: Vec<f64>,
    /// Ascending mean-size thresholds for the liquidity regime
    pub liquidity_thresholds: [f64; 4],
    /// Multiplier from momentum std-dev to predicted volatility
    pub volatility_scale: f64,
}

impl SoftmaxArtifact {
    /// Hand-set baseline shipped with the engine
    #[must_use]
    pub fn baseline() -> Self {
        Self {
            name: "softmax-baseline".to_string(),
            version: "1.0.0".to_string(),
            window_len: 32,
            max_latency_us: 1_000,
            labels: vec![
                PatternLabel::Normal,
                PatternLabel::IcebergOrder,
                PatternLabel::HiddenLiquidity,
                PatternLabel::QuoteStuffing,
            ],
            weights: vec![
                [-1.0, -2.0, 0.0, -0.5, -2.0],
                [0.5, 3.0, 0.0, 0.0, 2.0],
                [3.0, 0.5, 0.0, -1.5, 0.0],
                [0.0, 0.5, 0.5, 0.5, 5.0],
            ],
            bias: vec![2.0, -1.0, -1.5, -3.5],
            liquidity_thresholds: [1_000.0, 5_000.0, 20_000.0, 100_000.0],
            volatility_scale: 1.0,
        }
    }

    /// Parse an artifact from JSON
    ///
    /// # Errors
    /// Returns an error for malformed JSON or an inconsistent artifact
    pub fn from_json(json: &str) -> Result<Self> {
        let artifact: Self = serde_json::from_str(json).context("Failed to parse model artifact")?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Read an artifact file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model artifact {}", path.display()))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.labels.is_empty(), "artifact has no labels");
        ensure!(
            self.labels.len() == self.weights.len() && self.labels.len() == self.bias.len(),
            "artifact has {} labels, {} weight rows and {} biases",
            self.labels.len(),
            self.weights.len(),
            self.bias.len()
        );
        let finite = self.weights.iter().flatten().chain(&self.bias).chain(&self.liquidity_thresholds);
        ensure!(finite.copied().all(f64::is_finite), "artifact contains non-finite parameters");
        ensure!(
            self.liquidity_thresholds.windows(2).all(|w| w[0] <= w[1]),
            "liquidity thresholds must be ascending"
        );
        ensure!(self.volatility_scale.is_finite() && self.volatility_scale >= 0.0, "invalid volatility scale");
        Ok(())
    }
}

/// Softmax layer over window summary statistics
#[derive(Debug, Clone)]
pub struct SoftmaxPatternModel {
    metadata: ModelMetadata,
    labels: Vec<PatternLabel>,
    weights: Array2<f64>,
    bias: Array1<f64>,
    liquidity_thresholds: [f64; 4],
    volatility_scale: f64,
}

impl SoftmaxPatternModel {
    /// Build from a validated artifact
    ///
    /// # Errors
    /// Returns an error if the artifact is inconsistent
    pub fn from_artifact(artifact: SoftmaxArtifact) -> Result<Self> {
        artifact.validate()?;
        let rows = artifact.weights.len();
        let flat: Vec<f64> = artifact.weights.iter().flatten().copied().collect();
        let weights = Array2::from_shape_vec((rows, SUMMARY_DIM), flat).context("Bad weight matrix shape")?;
        Ok(Self {
            metadata: ModelMetadata {
                name: artifact.name,
                version: artifact.version,
                window_len: artifact.window_len,
                max_latency_us: artifact.max_latency_us,
            },
            labels: artifact.labels,
            weights,
            bias: Array1::from(artifact.bias),
            liquidity_thresholds: artifact.liquidity_thresholds,
            volatility_scale: artifact.volatility_scale,
        })
    }

    /// Built-in baseline model
    ///
    /// # Errors
    /// Only if the baseline artifact itself is inconsistent
    pub fn baseline() -> Result<Self> {
        Self::from_artifact(SoftmaxArtifact::baseline())
    }

    /// Load from a JSON artifact file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_artifact(SoftmaxArtifact::load(path)?)
    }
}

impl PatternModel for SoftmaxPatternModel {
    fn infer(&self, window: ArrayView2<'_, f64>) -> Result<ModelOutput> {
        if window.nrows() == 0 {
            bail!("empty feature window");
        }
        if window.ncols() != FEATURE_DIM {
            bail!("feature dimension mismatch: expected {}, got {}", FEATURE_DIM, window.ncols());
        }

        let summary = Array1::from(summarize(window).to_vec());
        let logits = self.weights.dot(&summary) + &self.bias;
        let max = logits.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let exp = logits.mapv(|l| (l - max).exp());
        let total = exp.sum();
        if !(total.is_finite() && total > 0.0) {
            bail!("degenerate softmax");
        }

        let (best, probability) = exp
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, &e)| if e > acc.1 { (i, e) } else { acc });

        let mean_size = window.column(1).mean().unwrap_or(0.0);
        let momentum_vol = window.column(4).std(0.0);

        Ok(ModelOutput {
            liquidity_level: LiquidityLevel::from_thresholds(mean_size, &self.liquidity_thresholds),
            pattern_label: self.labels.get(best).copied().unwrap_or(PatternLabel::Unknown),
            confidence: (probability / total).clamp(0.0, 1.0),
            predicted_volatility: momentum_vol * self.volatility_scale,
        })
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

/// A model installed in a [`ModelSlot`]
pub struct LoadedModel {
    model: Arc<dyn PatternModel>,
    generation: u64,
}

impl LoadedModel {
    /// The model
    #[must_use]
    pub fn model(&self) -> &Arc<dyn PatternModel> {
        &self.model
    }

    /// Model metadata
    #[must_use]
    pub fn metadata(&self) -> &ModelMetadata {
        self.model.metadata()
    }

    /// Install counter, bumped on every swap
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("metadata", self.metadata())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Atomically swappable model reference shared by all workers
#[derive(Debug)]
pub struct ModelSlot {
    current: ArcSwap<LoadedModel>,
    generation: AtomicU64,
}

impl ModelSlot {
    /// Slot holding `model`
    #[must_use]
    pub fn new(model: Arc<dyn PatternModel>) -> Self {
        Self {
            current: ArcSwap::from_pointee(LoadedModel { model, generation: 0 }),
            generation: AtomicU64::new(0),
        }
    }

    /// Current model (lock-free)
    #[must_use]
    pub fn load(&self) -> Arc<LoadedModel> {
        self.current.load_full()
    }

    /// Install a new model; takes effect on the next classification
    pub fn swap(&self, model: Arc<dyn PatternModel>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let metadata = model.metadata().clone();
        self.current.store(Arc::new(LoadedModel { model, generation }));
        info!(name = %metadata.name, version = %metadata.version, generation, "Pattern model swapped");
        generation
    }
}
