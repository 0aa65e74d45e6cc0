//! # Order Book Microstructure Engine
//!
//! Real-time per-symbol book reconstruction and liquidity analytics:
//! - Sequence-checked book state with gap buffering and snapshot resync
//! - Visible liquidity, imbalance, spread statistics and a bounded score
//! - Bayesian hidden-liquidity estimate from level replenishment
//! - Pluggable pattern classification with a hard inference budget
//! - Latency governor that degrades analytics before breaching its target
//! - Non-blocking, drop-oldest fan-out to downstream consumers
//!
//! ## Threading
//!
//! Symbols are sharded over a fixed worker pool. A symbol is owned by one
//! worker, so its events are applied strictly in order without locks.
//! Configuration and the active model are swapped atomically and picked
//! up by workers between events.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod book;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod governor;
pub mod hidden;
pub mod liquidity;
pub mod model;
pub mod pipeline;
pub mod publisher;
pub mod sim;
pub mod stats;

// Re-exports for convenience
pub use crate::book::{BookDelta, BookState, BookStore, DeltaKind, PriceLevel, SyncStatus};
pub use crate::classifier::{ClassificationResult, ClassificationStatus, LowConfidenceReason, PatternClassifier};
pub use crate::config::{ConfigHandle, EngineConfig, GovernorConfig, HiddenConfig, ScoreWeights};
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::{BookError, ConfigError, EngineError, InferenceError};
pub use crate::events::{
    Action, BookSnapshot, LevelSnapshot, MicrostructureAlert, OrderBookEvent, Side, SnapshotRequest,
};
pub use crate::governor::{Directives, GovernorState, LatencyGovernor};
pub use crate::hidden::HiddenLiquidityEstimator;
pub use crate::liquidity::{LiquidityCalculator, LiquidityMetrics, MetricQuality, SpreadWindow};
pub use crate::model::{
    LiquidityLevel, ModelMetadata, ModelOutput, ModelSlot, PatternLabel, PatternModel, SoftmaxPatternModel,
};
pub use crate::publisher::{Publication, Publisher, Subscription};
pub use crate::sim::{FeedConfig, ReferenceBook, SyntheticFeed};
pub use crate::stats::{EngineStats, Stage, StatsSnapshot};
