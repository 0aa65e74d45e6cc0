//! Per-symbol processing pipeline
//!
//! A [`SymbolPipeline`] owns everything about one symbol: its book, the
//! trailing spread window, the hidden-liquidity estimator and the
//! feature window. It is only ever touched by the worker that owns the
//! symbol. Shared, per-worker machinery (governor, inference thread,
//! publisher, counters) is passed in through a [`WorkerContext`].

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Sender, TrySendError};
use services_common::{Symbol, Ts};
use tracing::{debug, warn};

use crate::book::{BookDelta, BookStore, SyncStatus};
use crate::classifier::{ClassificationStatus, InferenceRunner, LowConfidenceReason, PatternClassifier};
use crate::config::EngineConfig;
use crate::error::BookError;
use crate::events::{BookSnapshot, MicrostructureAlert, OrderBookEvent, SnapshotRequest};
use crate::governor::LatencyGovernor;
use crate::hidden::HiddenLiquidityEstimator;
use crate::liquidity::{LiquidityCalculator, LiquidityMetrics, SpreadWindow};
use crate::model::ModelSlot;
use crate::publisher::{Alerts, Publication, Publisher};
use crate::stats::{EngineStats, Stage};

/// Per-worker resources shared by all of the worker's symbols
pub struct WorkerContext {
    /// Active configuration snapshot
    pub config: Arc<EngineConfig>,
    /// Metrics calculator built from `config`
    pub calculator: LiquidityCalculator,
    /// Worker latency governor
    pub governor: LatencyGovernor,
    /// Worker inference thread
    pub runner: InferenceRunner,
    /// Shared model slot
    pub models: Arc<ModelSlot>,
    /// Output fan-out
    pub publisher: Publisher,
    /// Engine counters
    pub stats: Arc<EngineStats>,
    /// Snapshot requests to the feed collaborator
    pub snapshot_requests: Sender<SnapshotRequest>,
}

impl WorkerContext {
    /// Swap in a new configuration snapshot
    pub fn apply_config(&mut self, config: Arc<EngineConfig>) {
        self.calculator = LiquidityCalculator::from_config(&config);
        self.governor.apply_config(&config);
        self.config = config;
    }
}

/// Everything one symbol needs, owned by exactly one worker
pub struct SymbolPipeline {
    symbol: Symbol,
    store: BookStore,
    spreads: SpreadWindow,
    hidden: HiddenLiquidityEstimator,
    classifier: PatternClassifier,
    last_metrics: Option<LiquidityMetrics>,
    priority: bool,
    resyncing: bool,
    snapshot_requested: bool,
    hidden_paused: bool,
    shed: bool,
}

impl SymbolPipeline {
    /// Fresh pipeline for `symbol`
    #[must_use]
    pub fn new(symbol: Symbol, config: &EngineConfig) -> Self {
        Self {
            symbol,
            store: BookStore::new(symbol, config.resync_buffer_capacity),
            spreads: SpreadWindow::new(config.time_window_secs),
            hidden: HiddenLiquidityEstimator::new(config.hidden.clone()),
            classifier: PatternClassifier::new(config.feature_window_len),
            last_metrics: None,
            priority: config.is_priority(symbol),
            resyncing: false,
            snapshot_requested: false,
            hidden_paused: false,
            shed: false,
        }
    }

    /// Symbol
    #[must_use]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    /// Book store
    #[must_use]
    pub fn store(&self) -> &BookStore {
        &self.store
    }

    /// Latest metrics, if any were computed
    #[must_use]
    pub fn last_metrics(&self) -> Option<&LiquidityMetrics> {
        self.last_metrics.as_ref()
    }

    /// Pick up reloaded configuration
    pub fn apply_config(&mut self, config: &EngineConfig) {
        self.spreads.set_window_secs(config.time_window_secs);
        self.hidden.set_config(config.hidden.clone());
        self.priority = config.is_priority(self.symbol);
    }

    /// Process one inbound event and everything it unblocks
    pub fn on_event(&mut self, event: OrderBookEvent, ctx: &mut WorkerContext) {
        let started = Instant::now();
        let received = event.sequence();

        let applied = self.store.apply(event);
        ctx.governor.record(Stage::Book, started.elapsed());

        match applied {
            Ok(delta) => self.on_applied(&delta, started, ctx),
            Err(error) => self.on_rejected(&error, received, ctx),
        }
        self.drain_ready(ctx);
    }

    /// Restore the book from a snapshot and replay buffered events
    pub fn on_snapshot(&mut self, snapshot: &BookSnapshot, ctx: &mut WorkerContext) {
        match self.store.restore(snapshot) {
            Ok(outcome) => {
                ctx.stats.record_snapshot_applied();
                self.snapshot_requested = false;
                self.hidden.reset();
                self.classifier.reset();
                debug!(
                    symbol = %self.symbol,
                    sequence = outcome.sequence,
                    pending = outcome.pending,
                    "Replaying buffered events after snapshot"
                );
                self.drain_ready(ctx);
                if self.store.is_resyncing() {
                    // The buffer still starts past the snapshot; ask for the hole.
                    self.resyncing = true;
                    self.request_gap_fill(ctx);
                } else if self.resyncing {
                    // Nothing was replayed; announce recovery on its own.
                    self.resyncing = false;
                    let mut alerts = Alerts::new();
                    alerts.push(MicrostructureAlert::Resynchronized { sequence: self.store.state().last_sequence() });
                    self.publish_snapshot_state(alerts, ctx);
                }
            }
            Err(error) => {
                ctx.stats.record_book_error(&error);
                debug!(symbol = %self.symbol, error = %error, "Snapshot not applied");
            }
        }
    }

    fn drain_ready(&mut self, ctx: &mut WorkerContext) {
        while let Some(event) = self.store.pop_ready() {
            let started = Instant::now();
            let received = event.sequence();
            let applied = self.store.apply(event);
            ctx.governor.record(Stage::Book, started.elapsed());
            match applied {
                Ok(delta) => self.on_applied(&delta, started, ctx),
                Err(error) => self.on_rejected(&error, received, ctx),
            }
        }
    }

    fn on_rejected(&mut self, error: &BookError, received: u64, ctx: &mut WorkerContext) {
        ctx.stats.record_book_error(error);
        match error {
            BookError::SequenceGap { expected, received, .. } if !self.resyncing => {
                self.resyncing = true;
                self.request_snapshot(*expected, received.saturating_sub(1), ctx);
                let mut alerts = Alerts::new();
                alerts.push(MicrostructureAlert::SequenceGap { expected: *expected, received: *received });
                self.publish_carried_over(alerts, ctx);
            }
            BookError::SequenceGapUnrecoverable { .. } => {
                self.resyncing = true;
                if !self.snapshot_requested {
                    let expected = self.store.expected_sequence();
                    self.request_snapshot(expected, received.saturating_sub(1), ctx);
                }
            }
            BookError::SequenceGap { .. } if !self.snapshot_requested => {
                // Earlier request was not delivered or a snapshot left a hole
                self.request_gap_fill(ctx);
            }
            BookError::SequenceGap { .. } | BookError::StaleSequence { .. } => {}
            BookError::InvariantViolation { .. } | BookError::SymbolMismatch { .. } => {
                debug!(symbol = %self.symbol, error = %error, "Event rejected");
            }
        }
    }

    fn request_gap_fill(&mut self, ctx: &WorkerContext) {
        let from_sequence = self.store.expected_sequence();
        let to_sequence = self.store.first_buffered_sequence().map_or(from_sequence, |first| first.saturating_sub(1));
        self.request_snapshot(from_sequence, to_sequence, ctx);
    }

    fn request_snapshot(&mut self, from_sequence: u64, to_sequence: u64, ctx: &WorkerContext) {
        let request = SnapshotRequest {
            symbol: self.symbol,
            from_sequence,
            to_sequence: to_sequence.max(from_sequence),
            detected_at: Ts::now(),
        };
        match ctx.snapshot_requests.try_send(request) {
            Ok(()) => {
                self.snapshot_requested = true;
                ctx.stats.record_snapshot_request();
            }
            Err(TrySendError::Full(_)) => {
                ctx.stats.record_snapshot_request_dropped();
                warn!(symbol = %self.symbol, "Snapshot request queue full");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(symbol = %self.symbol, "No snapshot collaborator connected");
            }
        }
    }

    fn on_applied(&mut self, delta: &BookDelta, started: Instant, ctx: &mut WorkerContext) {
        ctx.stats.record_applied();

        let mut alerts = Alerts::new();
        if let Some(alert) = &delta.alert {
            ctx.stats.record_crossed();
            alerts.push(alert.clone());
        }
        if self.resyncing && self.store.status() == SyncStatus::Live {
            self.resyncing = false;
            self.snapshot_requested = false;
            alerts.push(MicrostructureAlert::Resynchronized { sequence: delta.sequence });
        }

        let directives = ctx.governor.directives(self.priority);
        if directives.shed {
            if !self.shed {
                self.shed = true;
                alerts.push(MicrostructureAlert::SymbolShed);
                debug!(symbol = %self.symbol, "Shedding analytics");
            }
            ctx.stats.record_shed();
            if !alerts.is_empty() {
                self.publish(Publication {
                    symbol: self.symbol,
                    sequence: delta.sequence,
                    timestamp: delta.exchange_time,
                    metrics: None,
                    classification: None,
                    alerts,
                    governor_state: ctx.governor.state(),
                }, ctx);
            }
            ctx.governor.record(Stage::Total, started.elapsed());
            return;
        }
        if self.shed {
            // History has a hole; start the derived state over.
            self.shed = false;
            self.hidden.reset();
            self.classifier.reset();
        }

        let state = self.store.state();

        let stage = Instant::now();
        LiquidityCalculator::observe_spread(state, &mut self.spreads);
        let visible = ctx.calculator.visible_liquidity(state);
        ctx.governor.record(Stage::Liquidity, stage.elapsed());

        let stage = Instant::now();
        let hidden_estimate = if directives.skip_hidden {
            self.hidden_paused = true;
            ctx.stats.record_hidden_skipped();
            self.hidden.last_estimate()
        } else {
            if self.hidden_paused {
                self.hidden_paused = false;
                self.hidden.reset();
            }
            self.hidden.observe(delta);
            self.hidden.estimate(delta.exchange_time, visible)
        };
        ctx.governor.record(Stage::Hidden, stage.elapsed());

        let stage = Instant::now();
        let mut metrics = ctx.calculator.compute(state, &self.spreads, hidden_estimate);
        metrics.quality.hidden_skipped = directives.skip_hidden;
        metrics.quality.resyncing = self.store.is_resyncing();
        ctx.governor.record(Stage::Liquidity, stage.elapsed());

        let stage = Instant::now();
        self.classifier.observe(state, &metrics);
        let model = ctx.models.load();
        self.classifier.sync_model(&model, ctx.config.feature_window_len);
        let classification = if self.classifier.due(directives.classification_stride) {
            let result = self.classifier.classify(
                &mut ctx.runner,
                &model,
                &metrics,
                directives.window_scale,
                model.metadata().inference_budget(ctx.config.inference_budget()),
            );
            match result.status {
                ClassificationStatus::Confident => ctx.stats.record_classification(),
                ClassificationStatus::LowConfidence(reason) => {
                    ctx.stats.record_low_confidence();
                    if reason == LowConfidenceReason::InferenceTimeout {
                        ctx.stats.record_inference_timeout();
                    }
                }
            }
            result
        } else {
            self.classifier.skipped(&metrics, &model.metadata().version, LowConfidenceReason::Throttled)
        };
        ctx.governor.record(Stage::Classify, stage.elapsed());

        self.last_metrics = Some(metrics.clone());

        let stage = Instant::now();
        self.publish(Publication {
            symbol: self.symbol,
            sequence: delta.sequence,
            timestamp: delta.exchange_time,
            metrics: Some(metrics),
            classification: Some(classification),
            alerts,
            governor_state: ctx.governor.state(),
        }, ctx);
        ctx.governor.record(Stage::Publish, stage.elapsed());
        ctx.governor.record(Stage::Total, started.elapsed());
    }

    /// Alert publication while the book cannot produce fresh analytics
    fn publish_carried_over(&self, alerts: Alerts, ctx: &WorkerContext) {
        let state = self.store.state();
        let metrics = self.last_metrics.clone().map(|m| {
            let mut m = m.into_stale();
            m.quality.resyncing = true;
            m
        });
        self.publish(Publication {
            symbol: self.symbol,
            sequence: state.last_sequence(),
            timestamp: state.last_update_time(),
            metrics,
            classification: None,
            alerts,
            governor_state: ctx.governor.state(),
        }, ctx);
    }

    /// Publication for a freshly restored book with no replayed events
    fn publish_snapshot_state(&mut self, alerts: Alerts, ctx: &WorkerContext) {
        let state = self.store.state();
        LiquidityCalculator::observe_spread(state, &mut self.spreads);
        let metrics = ctx.calculator.compute(state, &self.spreads, 0.0);
        self.last_metrics = Some(metrics.clone());
        self.publish(Publication {
            symbol: self.symbol,
            sequence: state.last_sequence(),
            timestamp: state.last_update_time(),
            metrics: Some(metrics),
            classification: None,
            alerts,
            governor_state: ctx.governor.state(),
        }, ctx);
    }

    fn publish(&self, publication: Publication, ctx: &WorkerContext) {
        ctx.publisher.publish(&publication);
        ctx.stats.record_publication();
    }
}
