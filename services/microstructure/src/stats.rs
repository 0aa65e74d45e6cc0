//! Engine statistics
//!
//! Lock-free counters shared by all workers plus cumulative per-stage
//! latency histograms. Workers fold their interval histograms in once
//! per governor evaluation, so the mutex here is off the per-event path.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BookError, EngineError};

/// Pipeline stage timed by the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Stage {
    /// Book State Store apply
    Book = 0,
    /// Liquidity metrics
    Liquidity = 1,
    /// Hidden-liquidity estimate
    Hidden = 2,
    /// Feature extraction and inference
    Classify = 3,
    /// Output publication
    Publish = 4,
    /// Whole event, ingest to publish
    Total = 5,
}

impl Stage {
    /// Number of stages
    pub const COUNT: usize = 6;

    /// All stages in pipeline order
    pub const ALL: [Stage; Self::COUNT] =
        [Stage::Book, Stage::Liquidity, Stage::Hidden, Stage::Classify, Stage::Publish, Stage::Total];

    /// Short label for reports
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Book => "book",
            Stage::Liquidity => "liquidity",
            Stage::Hidden => "hidden",
            Stage::Classify => "classify",
            Stage::Publish => "publish",
            Stage::Total => "total",
        }
    }
}

/// Latency histogram with 3 significant figures, auto-resizing
///
/// # Errors
/// Returns `Histogram` if the histogram cannot be allocated
pub fn new_histogram() -> Result<Histogram<u64>, EngineError> {
    Histogram::new(3).or_else(|_| Histogram::new(2)).map_err(|e| EngineError::Histogram(e.to_string()))
}

/// Latency percentiles for one stage, nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLatency {
    /// Samples
    pub count: u64,
    /// Minimum
    pub min: u64,
    /// Mean
    pub mean: u64,
    /// Median
    pub p50: u64,
    /// 99th percentile
    pub p99: u64,
    /// 99.9th percentile
    pub p999: u64,
    /// Maximum
    pub max: u64,
}

impl StageLatency {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_histogram(hist: &Histogram<u64>) -> Self {
        Self {
            count: hist.len(),
            min: hist.min(),
            mean: hist.mean() as u64,
            p50: hist.value_at_quantile(0.50),
            p99: hist.value_at_quantile(0.99),
            p999: hist.value_at_quantile(0.999),
            max: hist.max(),
        }
    }
}

/// Engine-wide counters
#[repr(align(64))]
pub struct EngineStats {
    started: Instant,

    events_received: AtomicU64,
    events_applied: AtomicU64,
    events_dropped_full: AtomicU64,

    sequence_gaps: AtomicU64,
    unrecoverable_gaps: AtomicU64,
    stale_events: AtomicU64,
    invariant_violations: AtomicU64,
    symbol_mismatches: AtomicU64,
    crossed_books: AtomicU64,
    snapshot_requests: AtomicU64,
    snapshot_requests_dropped: AtomicU64,
    snapshots_applied: AtomicU64,

    classifications: AtomicU64,
    low_confidence: AtomicU64,
    inference_timeouts: AtomicU64,
    hidden_skipped: AtomicU64,
    analytics_shed: AtomicU64,

    publications: AtomicU64,
    governor_transitions: AtomicU64,
    governor_degradations: AtomicU64,

    latency: Mutex<Vec<Histogram<u64>>>,
}

impl std::fmt::Debug for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStats").field("snapshot", &self.snapshot()).finish()
    }
}

macro_rules! counter {
    ($(#[$doc:meta] $name:ident => $field:ident),* $(,)?) => {
        $(
            #[$doc]
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl EngineStats {
    /// Zeroed statistics
    ///
    /// # Errors
    /// Returns `Histogram` if the latency histograms cannot be allocated
    pub fn new() -> Result<Self, EngineError> {
        let latency = (0..Stage::COUNT).map(|_| new_histogram()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            started: Instant::now(),
            events_received: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            events_dropped_full: AtomicU64::new(0),
            sequence_gaps: AtomicU64::new(0),
            unrecoverable_gaps: AtomicU64::new(0),
            stale_events: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            symbol_mismatches: AtomicU64::new(0),
            crossed_books: AtomicU64::new(0),
            snapshot_requests: AtomicU64::new(0),
            snapshot_requests_dropped: AtomicU64::new(0),
            snapshots_applied: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
            low_confidence: AtomicU64::new(0),
            inference_timeouts: AtomicU64::new(0),
            hidden_skipped: AtomicU64::new(0),
            analytics_shed: AtomicU64::new(0),
            publications: AtomicU64::new(0),
            governor_transitions: AtomicU64::new(0),
            governor_degradations: AtomicU64::new(0),
            latency: Mutex::new(latency),
        })
    }

    counter! {
        /// An event was accepted onto a worker queue
        record_received => events_received,
        /// An event changed (or confirmed) the book
        record_applied => events_applied,
        /// `try_submit` found the worker queue full
        record_queue_full => events_dropped_full,
        /// A crossed-book alert was raised
        record_crossed => crossed_books,
        /// A snapshot request was sent to the feed collaborator
        record_snapshot_request => snapshot_requests,
        /// The snapshot request queue was full
        record_snapshot_request_dropped => snapshot_requests_dropped,
        /// A snapshot restored a book
        record_snapshot_applied => snapshots_applied,
        /// A fresh classification was produced
        record_classification => classifications,
        /// A low-confidence classification was produced
        record_low_confidence => low_confidence,
        /// Inference exceeded its budget
        record_inference_timeout => inference_timeouts,
        /// The hidden estimator was skipped under load
        record_hidden_skipped => hidden_skipped,
        /// Analytics were shed for an update
        record_shed => analytics_shed,
        /// A publication was fanned out
        record_publication => publications,
        /// A governor changed state
        record_governor_transition => governor_transitions,
        /// A governor left `Nominal` for `Degraded`
        record_governor_degradation => governor_degradations,
    }

    /// Count a book error by kind
    pub fn record_book_error(&self, error: &BookError) {
        let counter = match error {
            BookError::SequenceGap { .. } => &self.sequence_gaps,
            BookError::SequenceGapUnrecoverable { .. } => &self.unrecoverable_gaps,
            BookError::StaleSequence { .. } => &self.stale_events,
            BookError::InvariantViolation { .. } => &self.invariant_violations,
            BookError::SymbolMismatch { .. } => &self.symbol_mismatches,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a worker's interval histograms into the cumulative ones
    pub fn absorb_latency(&self, interval: &[Histogram<u64>]) {
        let mut latency = self.latency.lock();
        for (total, sample) in latency.iter_mut().zip(interval) {
            let _ = total.add(sample);
        }
    }

    /// Point-in-time copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Acquire);
        let latency = {
            let hists = self.latency.lock();
            Stage::ALL
                .iter()
                .zip(hists.iter())
                .filter(|(_, h)| !h.is_empty())
                .map(|(stage, h)| (*stage, StageLatency::from_histogram(h)))
                .collect()
        };
        StatsSnapshot {
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            events_received: load(&self.events_received),
            events_applied: load(&self.events_applied),
            events_dropped_full: load(&self.events_dropped_full),
            sequence_gaps: load(&self.sequence_gaps),
            unrecoverable_gaps: load(&self.unrecoverable_gaps),
            stale_events: load(&self.stale_events),
            invariant_violations: load(&self.invariant_violations),
            symbol_mismatches: load(&self.symbol_mismatches),
            crossed_books: load(&self.crossed_books),
            snapshot_requests: load(&self.snapshot_requests),
            snapshot_requests_dropped: load(&self.snapshot_requests_dropped),
            snapshots_applied: load(&self.snapshots_applied),
            classifications: load(&self.classifications),
            low_confidence: load(&self.low_confidence),
            inference_timeouts: load(&self.inference_timeouts),
            hidden_skipped: load(&self.hidden_skipped),
            analytics_shed: load(&self.analytics_shed),
            publications: load(&self.publications),
            governor_transitions: load(&self.governor_transitions),
            governor_degradations: load(&self.governor_degradations),
            latency,
        }
    }
}

/// Serializable copy of [`EngineStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Milliseconds since the stats were created
    pub uptime_ms: u64,
    /// Events accepted onto worker queues
    pub events_received: u64,
    /// Events applied to a book
    pub events_applied: u64,
    /// Events rejected by `try_submit` on a full queue
    pub events_dropped_full: u64,
    /// Sequence gaps detected
    pub sequence_gaps: u64,
    /// Resync buffer overflows
    pub unrecoverable_gaps: u64,
    /// Duplicate or replayed events
    pub stale_events: u64,
    /// Events contradicting the book
    pub invariant_violations: u64,
    /// Events routed to the wrong book
    pub symbol_mismatches: u64,
    /// Crossed-book alerts raised
    pub crossed_books: u64,
    /// Snapshot requests sent
    pub snapshot_requests: u64,
    /// Snapshot requests lost to a full queue
    pub snapshot_requests_dropped: u64,
    /// Snapshots applied
    pub snapshots_applied: u64,
    /// Fresh classifications
    pub classifications: u64,
    /// Low-confidence classifications
    pub low_confidence: u64,
    /// Inference timeouts
    pub inference_timeouts: u64,
    /// Updates whose hidden estimate was skipped
    pub hidden_skipped: u64,
    /// Updates whose analytics were shed
    pub analytics_shed: u64,
    /// Publications fanned out
    pub publications: u64,
    /// Governor state changes
    pub governor_transitions: u64,
    /// Governor entries into `Degraded` from `Nominal`
    pub governor_degradations: u64,
    /// Cumulative per-stage latency
    pub latency: Vec<(Stage, StageLatency)>,
}

impl StatsSnapshot {
    /// Applied events per second of uptime
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn events_per_second(&self) -> f64 {
        if self.uptime_ms == 0 {
            return 0.0;
        }
        self.events_applied as f64 * 1000.0 / self.uptime_ms as f64
    }

    /// Latency for one stage, if any samples were recorded
    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageLatency> {
        self.latency.iter().find(|(s, _)| *s == stage).map(|(_, l)| l)
    }

    /// Human readable report
    #[must_use]
    pub fn format_report(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== Microstructure Engine ===");
        let _ = writeln!(
            report,
            "Events: {} received, {} applied, {} rejected on full queue ({:.0}/s)",
            self.events_received,
            self.events_applied,
            self.events_dropped_full,
            self.events_per_second()
        );
        let _ = writeln!(
            report,
            "Sequencing: {} gaps, {} unrecoverable, {} stale, {} violations",
            self.sequence_gaps, self.unrecoverable_gaps, self.stale_events, self.invariant_violations
        );
        let _ = writeln!(
            report,
            "Resync: {} requested, {} request drops, {} snapshots applied",
            self.snapshot_requests, self.snapshot_requests_dropped, self.snapshots_applied
        );
        let _ = writeln!(report, "Crossed books: {}", self.crossed_books);
        let _ = writeln!(
            report,
            "Classification: {} fresh, {} low confidence, {} timeouts",
            self.classifications, self.low_confidence, self.inference_timeouts
        );
        let _ = writeln!(
            report,
            "Load shedding: {} hidden skipped, {} shed, {} governor transitions ({} degradations)",
            self.hidden_skipped, self.analytics_shed, self.governor_transitions, self.governor_degradations
        );
        let _ = writeln!(report, "Publications: {}", self.publications);

        if !self.latency.is_empty() {
            let _ = writeln!(report, "\nLatency (ns):");
            for (stage, l) in &self.latency {
                let _ = writeln!(
                    report,
                    "  {:<10} n={:<9} p50: {}, p99: {}, p99.9: {}, max: {}",
                    stage.label(),
                    l.count,
                    l.p50,
                    l.p99,
                    l.p999,
                    l.max
                );
            }
        }
        report
    }
}
