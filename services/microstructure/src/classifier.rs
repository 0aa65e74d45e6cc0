//! Pattern Classifier Adapter
//!
//! Keeps one rolling [`FeatureWindow`] per symbol and asks the installed
//! [`PatternModel`] to classify it. Inference never runs on the worker
//! thread: each worker owns an [`InferenceRunner`], a helper thread fed
//! through a one-slot request channel. The worker waits at most the
//! inference budget for the answer; if the model is late the request is
//! abandoned and its eventual reply discarded by id.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use services_common::{Symbol, Ts};
use tracing::{debug, warn};

use crate::book::BookState;
use crate::error::InferenceError;
use crate::features::{FeatureVector, FeatureWindow};
use crate::liquidity::LiquidityMetrics;
use crate::model::{LiquidityLevel, LoadedModel, ModelOutput, PatternLabel};

/// Why a classification cannot be fully trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LowConfidenceReason {
    /// Feature window not yet full
    ColdStart,
    /// Model exceeded its budget
    InferenceTimeout,
    /// Previous request still running
    ModelBusy,
    /// Model returned an error
    ModelError,
    /// Skipped by the classification stride
    Throttled,
    /// Analytics shed under load
    Shed,
}

/// Trust status of a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationStatus {
    /// Fresh model output
    Confident,
    /// Substituted or degraded output
    LowConfidence(LowConfidenceReason),
}

impl ClassificationStatus {
    /// Whether this is a fresh model answer
    #[must_use]
    pub fn is_confident(&self) -> bool {
        matches!(self, ClassificationStatus::Confident)
    }
}

/// Classification published for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Symbol
    pub symbol: Symbol,
    /// Book sequence the classification was computed at
    pub sequence: u64,
    /// Liquidity regime
    pub liquidity_level: LiquidityLevel,
    /// Pattern
    pub pattern_label: PatternLabel,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Predicted short-horizon volatility in ticks
    pub predicted_volatility: f64,
    /// Exchange time of the classified update
    pub timestamp: Ts,
    /// Version of the model that produced it
    pub model_version: String,
    /// Trust status
    pub status: ClassificationStatus,
    /// Carried over from an earlier update
    pub stale: bool,
}

impl ClassificationResult {
    fn from_output(output: ModelOutput, metrics: &LiquidityMetrics, model_version: &str) -> Self {
        let confidence = if output.confidence.is_finite() { output.confidence.clamp(0.0, 1.0) } else { 0.0 };
        let predicted_volatility =
            if output.predicted_volatility.is_finite() { output.predicted_volatility.max(0.0) } else { 0.0 };
        Self {
            symbol: metrics.symbol,
            sequence: metrics.sequence,
            liquidity_level: output.liquidity_level,
            pattern_label: output.pattern_label,
            confidence,
            predicted_volatility,
            timestamp: metrics.timestamp,
            model_version: model_version.to_string(),
            status: ClassificationStatus::Confident,
            stale: false,
        }
    }

    /// Substitute result derived from the metrics alone
    #[must_use]
    pub fn low_confidence(metrics: &LiquidityMetrics, model_version: &str, reason: LowConfidenceReason) -> Self {
        Self {
            symbol: metrics.symbol,
            sequence: metrics.sequence,
            liquidity_level: LiquidityLevel::from_score(metrics.liquidity_score),
            pattern_label: PatternLabel::Unknown,
            confidence: 0.0,
            predicted_volatility: metrics.spread_volatility,
            timestamp: metrics.timestamp,
            model_version: model_version.to_string(),
            status: ClassificationStatus::LowConfidence(reason),
            stale: false,
        }
    }
}

struct InferenceRequest {
    id: u64,
    model: Arc<LoadedModel>,
    window: Array2<f64>,
}

struct InferenceResponse {
    id: u64,
    result: Result<ModelOutput, String>,
}

/// Per-worker inference thread with a hard per-call timeout
pub struct InferenceRunner {
    requests: Option<Sender<InferenceRequest>>,
    responses: Receiver<InferenceResponse>,
    handle: Option<JoinHandle<()>>,
    next_id: u64,
    outstanding: Option<u64>,
}

impl InferenceRunner {
    /// Spawn the inference thread
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (request_tx, request_rx) = channel::bounded::<InferenceRequest>(1);
        let (response_tx, response_rx) = channel::bounded::<InferenceResponse>(1);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_inference(&request_rx, &response_tx))?;

        Ok(Self {
            requests: Some(request_tx),
            responses: response_rx,
            handle: Some(handle),
            next_id: 0,
            outstanding: None,
        })
    }

    /// Whether an abandoned request is still being computed
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Run one inference, waiting at most `budget`.
    ///
    /// # Errors
    /// - `Busy` if an abandoned request has not finished yet
    /// - `Timeout` if the model does not answer within `budget`
    /// - `Model` if the model returns an error or panics
    /// - `Disconnected` if the inference thread is gone
    pub fn infer(
        &mut self,
        model: Arc<LoadedModel>,
        window: Array2<f64>,
        budget: Duration,
    ) -> Result<ModelOutput, InferenceError> {
        self.drain_abandoned()?;
        if self.outstanding.is_some() {
            return Err(InferenceError::Busy);
        }

        let requests = self.requests.as_ref().ok_or(InferenceError::Disconnected)?;
        self.next_id += 1;
        let id = self.next_id;

        match requests.try_send(InferenceRequest { id, model, window }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(InferenceError::Busy),
            Err(TrySendError::Disconnected(_)) => return Err(InferenceError::Disconnected),
        }

        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) if response.id == id => {
                    return response.result.map_err(InferenceError::Model);
                }
                Ok(response) => {
                    debug!(id = response.id, "Discarding late inference reply");
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.outstanding = Some(id);
                    #[allow(clippy::cast_possible_truncation)]
                    let budget_us = budget.as_micros() as u64;
                    return Err(InferenceError::Timeout { budget_us });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(InferenceError::Disconnected),
            }
        }
    }

    fn drain_abandoned(&mut self) -> Result<(), InferenceError> {
        loop {
            match self.responses.try_recv() {
                Ok(response) => {
                    if self.outstanding == Some(response.id) {
                        self.outstanding = None;
                    }
                    debug!(id = response.id, "Discarding late inference reply");
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(InferenceError::Disconnected),
            }
        }
    }

    /// Stop the inference thread and wait for it to finish its current call
    pub fn shutdown(&mut self) {
        self.requests.take();
        // Unblock a thread parked on sending a reply nobody will read
        while self.responses.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Inference thread panicked");
            }
        }
    }
}

impl Drop for InferenceRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_inference(requests: &Receiver<InferenceRequest>, responses: &Sender<InferenceResponse>) {
    for request in requests {
        let model = request.model.model();
        let result = match catch_unwind(AssertUnwindSafe(|| model.infer(request.window.view()))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("model panicked".to_string()),
        };
        if responses.send(InferenceResponse { id: request.id, result }).is_err() {
            break;
        }
    }
}

/// Per-symbol classification state
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    window: FeatureWindow,
    model_generation: Option<u64>,
    since_last: u32,
    last: Option<ClassificationResult>,
}

impl PatternClassifier {
    /// Classifier with an initial window length
    #[must_use]
    pub fn new(window_len: usize) -> Self {
        Self { window: FeatureWindow::new(window_len), model_generation: None, since_last: 0, last: None }
    }

    /// Rolling feature window
    #[must_use]
    pub fn window(&self) -> &FeatureWindow {
        &self.window
    }

    /// Last published fresh or substituted result
    #[must_use]
    pub fn last(&self) -> Option<&ClassificationResult> {
        self.last.as_ref()
    }

    /// Append the features of the latest update
    pub fn observe(&mut self, state: &BookState, metrics: &LiquidityMetrics) {
        let vector = FeatureVector::extract(state, metrics, self.window.last());
        self.window.push(vector);
    }

    /// Count one update against the stride; true when classification is due
    pub fn due(&mut self, stride: u32) -> bool {
        self.since_last = self.since_last.saturating_add(1);
        if self.since_last >= stride.max(1) {
            self.since_last = 0;
            return true;
        }
        false
    }

    /// Follow a model swap: resize the window to the new model's length,
    /// or to `configured_len` if the model accepts any length
    pub fn sync_model(&mut self, model: &LoadedModel, configured_len: usize) {
        if self.model_generation == Some(model.generation()) {
            return;
        }
        let window_len = match model.metadata().window_len {
            0 => configured_len,
            len => len,
        };
        if window_len != self.window.capacity() {
            debug!(from = self.window.capacity(), to = window_len, "Resizing feature window for model");
            self.window.resize(window_len);
        }
        self.model_generation = Some(model.generation());
    }

    /// Classify the current window.
    ///
    /// `window_scale` shrinks the rows handed to the model under load.
    /// Call [`Self::sync_model`] first after a model swap.
    /// Never fails: problems become a `LowConfidence` result.
    pub fn classify(
        &mut self,
        runner: &mut InferenceRunner,
        model: &Arc<LoadedModel>,
        metrics: &LiquidityMetrics,
        window_scale: f64,
        budget: Duration,
    ) -> ClassificationResult {
        let version = model.metadata().version.clone();

        let rows = effective_rows(self.window.capacity(), window_scale);
        if self.window.len() < rows {
            return self.record(ClassificationResult::low_confidence(metrics, &version, LowConfidenceReason::ColdStart));
        }

        let result = match runner.infer(Arc::clone(model), self.window.to_matrix(rows), budget) {
            Ok(output) => ClassificationResult::from_output(output, metrics, &version),
            Err(e) => {
                let reason = match e {
                    InferenceError::Timeout { .. } => LowConfidenceReason::InferenceTimeout,
                    InferenceError::Busy => LowConfidenceReason::ModelBusy,
                    InferenceError::Model(_) | InferenceError::Disconnected => LowConfidenceReason::ModelError,
                };
                warn!(symbol = %metrics.symbol, sequence = metrics.sequence, error = %e, "Classification degraded");
                ClassificationResult::low_confidence(metrics, &version, reason)
            }
        };
        self.record(result)
    }

    /// Result to publish when classification is skipped: the previous
    /// result marked stale, or a substitute carrying `reason`
    #[must_use]
    pub fn skipped(&self, metrics: &LiquidityMetrics, model_version: &str, reason: LowConfidenceReason) -> ClassificationResult {
        match &self.last {
            Some(last) => ClassificationResult { stale: true, ..last.clone() },
            None => ClassificationResult::low_confidence(metrics, model_version, reason),
        }
    }

    /// Forget history (window, stride position, last result)
    pub fn reset(&mut self) {
        self.window.clear();
        self.since_last = 0;
        self.last = None;
    }

    fn record(&mut self, result: ClassificationResult) -> ClassificationResult {
        self.last = Some(result.clone());
        result
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn effective_rows(window_len: usize, scale: f64) -> usize {
    let scale = if scale.is_finite() { scale.clamp(0.0, 1.0) } else { 1.0 };
    ((window_len as f64 * scale).ceil() as usize).clamp(1, window_len.max(1))
}
