//! Engine and worker pool
//!
//! Symbols are sharded across a fixed pool of worker threads by symbol
//! id, so every symbol is owned by exactly one worker and its events are
//! processed in arrival order. Each worker owns its symbols' pipelines,
//! its own latency governor and its own inference thread; the only
//! shared state is the configuration handle, the model slot, the
//! publisher queues and the statistics counters.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use services_common::Symbol;
use tracing::{debug, error, info, warn};

use crate::classifier::InferenceRunner;
use crate::config::{ConfigHandle, EngineConfig};
use crate::error::{EngineError, InferenceError};
use crate::events::{BookSnapshot, OrderBookEvent, SnapshotRequest};
use crate::governor::{GovernorHandle, GovernorState, LatencyGovernor};
use crate::liquidity::{LiquidityCalculator, LiquidityMetrics};
use crate::model::{ModelSlot, PatternModel, SoftmaxPatternModel};
use crate::pipeline::{SymbolPipeline, WorkerContext};
use crate::publisher::{Publisher, PublisherBuilder, Subscription};
use crate::stats::{EngineStats, StatsSnapshot};

enum WorkerMessage {
    Event(OrderBookEvent),
    Snapshot(BookSnapshot),
    DropSymbol(Symbol),
    Query(Symbol, Sender<Option<(BookSnapshot, Option<LiquidityMetrics>)>>),
    Barrier(Sender<()>),
    Shutdown,
}

struct Worker {
    id: usize,
    inbox: Receiver<WorkerMessage>,
    config: Arc<ConfigHandle>,
    generation: u64,
    ctx: WorkerContext,
    pipelines: AHashMap<Symbol, SymbolPipeline>,
}

impl Worker {
    fn run(mut self) {
        info!(worker = self.id, "Worker started");
        loop {
            let poll = self.poll_interval();
            match self.inbox.recv_timeout(poll) {
                Ok(WorkerMessage::Event(event)) => self.on_event(event),
                Ok(WorkerMessage::Snapshot(snapshot)) => self.on_snapshot(&snapshot),
                Ok(WorkerMessage::DropSymbol(symbol)) => {
                    if self.pipelines.remove(&symbol).is_some() {
                        info!(worker = self.id, symbol = %symbol, "Symbol dropped");
                    }
                }
                Ok(WorkerMessage::Query(symbol, reply)) => {
                    let answer = self
                        .pipelines
                        .get(&symbol)
                        .map(|p| (p.store().snapshot(), p.last_metrics().cloned()));
                    let _ = reply.send(answer);
                }
                Ok(WorkerMessage::Barrier(reply)) => {
                    let _ = reply.send(());
                }
                Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.refresh_config();
            if let Some(evaluation) = self.ctx.governor.maybe_evaluate(Instant::now()) {
                if evaluation.changed() {
                    debug!(worker = self.id, state = ?evaluation.state, p99_ns = evaluation.p99_ns, "Governor state changed");
                }
            }
        }

        // Fold the last partial interval into the cumulative histograms
        self.ctx.governor.evaluate(Instant::now());
        self.ctx.runner.shutdown();
        info!(worker = self.id, symbols = self.pipelines.len(), "Worker stopped");
    }

    fn on_event(&mut self, event: OrderBookEvent) {
        let pipeline = pipeline_for(&mut self.pipelines, event.symbol(), &self.ctx.config);
        pipeline.on_event(event, &mut self.ctx);
    }

    fn on_snapshot(&mut self, snapshot: &BookSnapshot) {
        let pipeline = pipeline_for(&mut self.pipelines, snapshot.symbol, &self.ctx.config);
        pipeline.on_snapshot(snapshot, &mut self.ctx);
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.ctx.config.governor.evaluation_interval_ms.max(1))
    }

    fn refresh_config(&mut self) {
        let generation = self.config.generation();
        if generation == self.generation {
            return;
        }
        self.generation = generation;
        let config = self.config.load();
        for pipeline in self.pipelines.values_mut() {
            pipeline.apply_config(&config);
        }
        self.ctx.apply_config(config);
        debug!(worker = self.id, generation, "Worker picked up configuration");
    }
}

fn pipeline_for<'a>(
    pipelines: &'a mut AHashMap<Symbol, SymbolPipeline>,
    symbol: Symbol,
    config: &EngineConfig,
) -> &'a mut SymbolPipeline {
    pipelines.entry(symbol).or_insert_with(|| {
        debug!(symbol = %symbol, "Creating pipeline");
        SymbolPipeline::new(symbol, config)
    })
}

/// Configures and starts an [`Engine`]
pub struct EngineBuilder {
    config: Arc<ConfigHandle>,
    publisher: PublisherBuilder,
    model: Option<Arc<dyn PatternModel>>,
}

impl EngineBuilder {
    /// Builder over a shared configuration handle
    #[must_use]
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self { config, publisher: PublisherBuilder::new(), model: None }
    }

    /// Register a downstream consumer
    pub fn subscribe(&mut self, name: impl Into<String>, capacity: usize) -> Subscription {
        self.publisher.subscribe(name, capacity)
    }

    /// Initial pattern model (defaults to the built-in baseline)
    #[must_use]
    pub fn model(mut self, model: Arc<dyn PatternModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Spawn the workers.
    ///
    /// Returns the engine and the receiving end of the snapshot request
    /// channel; the feed collaborator answers requests with
    /// [`Engine::submit_snapshot`].
    ///
    /// # Errors
    /// - `Spawn` if a worker or inference thread cannot be started
    /// - `Histogram` if latency histograms cannot be allocated
    /// - `Inference` if the baseline model cannot be built
    pub fn start(self) -> Result<(Engine, Receiver<SnapshotRequest>), EngineError> {
        let config = self.config.load();
        let workers = config.resolved_workers();
        let stats = Arc::new(EngineStats::new()?);
        let model: Arc<dyn PatternModel> = match self.model {
            Some(model) => model,
            None => {
                let baseline = SoftmaxPatternModel::baseline()
                    .map_err(|e| InferenceError::Model(e.to_string()))?;
                Arc::new(baseline)
            }
        };
        let models = Arc::new(ModelSlot::new(model));
        let publisher = self.publisher.build();
        let (snapshot_tx, snapshot_rx) = channel::bounded(config.snapshot_request_capacity);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        let mut governors = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = channel::bounded(config.input_queue_capacity);
            let governor = LatencyGovernor::new(&config, Arc::clone(&stats), Instant::now())?;
            governors.push(governor.handle());
            let ctx = WorkerContext {
                config: Arc::clone(&config),
                calculator: LiquidityCalculator::from_config(&config),
                governor,
                runner: InferenceRunner::spawn(&format!("micro-infer-{id}"))?,
                models: Arc::clone(&models),
                publisher: publisher.clone(),
                stats: Arc::clone(&stats),
                snapshot_requests: snapshot_tx.clone(),
            };
            let worker = Worker {
                id,
                inbox: rx,
                config: Arc::clone(&self.config),
                generation: self.config.generation(),
                ctx,
                pipelines: AHashMap::new(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("micro-worker-{id}"))
                .spawn(move || worker.run())?;
            senders.push(tx);
            handles.push(handle);
        }

        info!(workers, consumers = publisher.consumer_count(), "Microstructure engine started");

        Ok((
            Engine {
                senders,
                handles,
                governors,
                stats,
                config: self.config,
                models,
                publisher,
            },
            snapshot_rx,
        ))
    }
}

/// Running engine; dropping it shuts the workers down
pub struct Engine {
    senders: Vec<Sender<WorkerMessage>>,
    handles: Vec<JoinHandle<()>>,
    governors: Vec<GovernorHandle>,
    stats: Arc<EngineStats>,
    config: Arc<ConfigHandle>,
    models: Arc<ModelSlot>,
    publisher: Publisher,
}

impl Engine {
    /// Start configuring an engine
    #[must_use]
    pub fn builder(config: Arc<ConfigHandle>) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Worker count
    #[must_use]
    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Worker that owns `symbol`
    #[must_use]
    pub fn shard_of(&self, symbol: Symbol) -> usize {
        shard(symbol, self.senders.len())
    }

    fn sender(&self, symbol: Symbol) -> Result<(usize, &Sender<WorkerMessage>), EngineError> {
        let worker = self.shard_of(symbol);
        self.senders.get(worker).map(|tx| (worker, tx)).ok_or(EngineError::Shutdown)
    }

    /// Submit an event, waiting while the owning worker's queue is full
    ///
    /// # Errors
    /// Returns `Shutdown` if the worker is gone
    pub fn submit(&self, event: OrderBookEvent) -> Result<(), EngineError> {
        let (_, tx) = self.sender(event.symbol())?;
        self.stats.record_received();
        tx.send(WorkerMessage::Event(event)).map_err(|_| EngineError::Shutdown)
    }

    /// Submit an event without blocking
    ///
    /// # Errors
    /// - `QueueSaturated` if the owning worker's queue is full; the event is dropped
    /// - `Shutdown` if the worker is gone
    pub fn try_submit(&self, event: OrderBookEvent) -> Result<(), EngineError> {
        let (worker, tx) = self.sender(event.symbol())?;
        self.stats.record_received();
        match tx.try_send(WorkerMessage::Event(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.record_queue_full();
                Err(EngineError::QueueSaturated { worker })
            }
            Err(TrySendError::Disconnected(_)) => Err(EngineError::Shutdown),
        }
    }

    /// Hand a snapshot to the owning worker
    ///
    /// # Errors
    /// Returns `Shutdown` if the worker is gone
    pub fn submit_snapshot(&self, snapshot: BookSnapshot) -> Result<(), EngineError> {
        let (_, tx) = self.sender(snapshot.symbol)?;
        tx.send(WorkerMessage::Snapshot(snapshot)).map_err(|_| EngineError::Shutdown)
    }

    /// Forget a symbol; other symbols are unaffected
    ///
    /// # Errors
    /// Returns `Shutdown` if the worker is gone
    pub fn drop_symbol(&self, symbol: Symbol) -> Result<(), EngineError> {
        let (_, tx) = self.sender(symbol)?;
        tx.send(WorkerMessage::DropSymbol(symbol)).map_err(|_| EngineError::Shutdown)
    }

    /// Current book of `symbol` after everything submitted so far
    ///
    /// # Errors
    /// Returns `Shutdown` if the worker is gone
    pub fn book_snapshot(&self, symbol: Symbol) -> Result<Option<BookSnapshot>, EngineError> {
        Ok(self.query(symbol)?.map(|(snapshot, _)| snapshot))
    }

    /// Latest metrics of `symbol` after everything submitted so far
    ///
    /// # Errors
    /// Returns `Shutdown` if the worker is gone
    pub fn latest_metrics(&self, symbol: Symbol) -> Result<Option<LiquidityMetrics>, EngineError> {
        Ok(self.query(symbol)?.and_then(|(_, metrics)| metrics))
    }

    fn query(&self, symbol: Symbol) -> Result<Option<(BookSnapshot, Option<LiquidityMetrics>)>, EngineError> {
        let (_, tx) = self.sender(symbol)?;
        let (reply_tx, reply_rx) = channel::bounded(1);
        tx.send(WorkerMessage::Query(symbol, reply_tx)).map_err(|_| EngineError::Shutdown)?;
        reply_rx.recv().map_err(|_| EngineError::Shutdown)
    }

    /// Wait until every worker has processed everything submitted so far
    ///
    /// # Errors
    /// Returns `Shutdown` if a worker is gone
    pub fn sync(&self) -> Result<(), EngineError> {
        let mut replies = Vec::with_capacity(self.senders.len());
        for tx in &self.senders {
            let (reply_tx, reply_rx) = channel::bounded(1);
            tx.send(WorkerMessage::Barrier(reply_tx)).map_err(|_| EngineError::Shutdown)?;
            replies.push(reply_rx);
        }
        for reply in replies {
            reply.recv().map_err(|_| EngineError::Shutdown)?;
        }
        Ok(())
    }

    /// Atomically replace the pattern model; returns the new generation
    pub fn swap_model(&self, model: Arc<dyn PatternModel>) -> u64 {
        self.models.swap(model)
    }

    /// Model slot shared by the workers
    #[must_use]
    pub fn models(&self) -> &Arc<ModelSlot> {
        &self.models
    }

    /// Shared statistics
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Governor state per worker
    #[must_use]
    pub fn governor_states(&self) -> Vec<GovernorState> {
        self.governors.iter().map(GovernorHandle::state).collect()
    }

    /// Configuration handle
    #[must_use]
    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    /// Current configuration snapshot
    #[must_use]
    pub fn current_config(&self) -> Arc<EngineConfig> {
        self.config.load()
    }

    /// Output publisher
    #[must_use]
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Stop every worker after it drains its queue
    ///
    /// # Errors
    /// Returns `WorkerPanicked` for the first worker that panicked
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        for tx in &self.senders {
            let _ = tx.send(WorkerMessage::Shutdown);
        }
        self.senders.clear();

        let mut result = Ok(());
        for (worker, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                error!(worker, "Worker panicked");
                if result.is_ok() {
                    result = Err(EngineError::WorkerPanicked { worker });
                }
            }
        }
        if result.is_ok() && !self.governors.is_empty() {
            info!("Microstructure engine stopped");
        }
        self.governors.clear();
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        if let Err(e) = self.stop() {
            warn!(error = %e, "Engine stopped with errors");
        }
    }
}

/// Worker index owning `symbol` in a pool of `workers`
#[must_use]
pub fn shard(symbol: Symbol, workers: usize) -> usize {
    (symbol.id() as usize) % workers.max(1)
}
