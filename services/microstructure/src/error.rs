//! Error taxonomy
//!
//! Every error is scoped to one symbol or one subsystem. None of them is
//! fatal to the process: the engine logs, flags the affected output and
//! keeps going.

use services_common::Symbol;
use thiserror::Error;

/// Book State Store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookError {
    /// A sequence gap was detected; the book is resynchronizing
    #[error("{symbol}: sequence gap, expected {expected} got {received}")]
    SequenceGap {
        /// Symbol
        symbol: Symbol,
        /// Sequence the book expected next
        expected: u64,
        /// Sequence that arrived
        received: u64,
    },

    /// The resync buffer overflowed; only a snapshot can recover the book
    #[error("{symbol}: unrecoverable gap, discarded buffered sequence {discarded} (buffer capacity {capacity})")]
    SequenceGapUnrecoverable {
        /// Symbol
        symbol: Symbol,
        /// Oldest buffered sequence that was discarded
        discarded: u64,
        /// Buffer capacity
        capacity: usize,
    },

    /// Duplicate or replayed sequence, event dropped
    #[error("{symbol}: stale sequence {received} (last applied {last})")]
    StaleSequence {
        /// Symbol
        symbol: Symbol,
        /// Last applied sequence
        last: u64,
        /// Sequence that arrived
        received: u64,
    },

    /// Event contradicts the book (e.g. modify on a missing level)
    #[error("{symbol}: invariant violation at sequence {sequence}: {reason}")]
    InvariantViolation {
        /// Symbol
        symbol: Symbol,
        /// Sequence of the offending event
        sequence: u64,
        /// Human readable reason
        reason: String,
    },

    /// Event routed to the wrong book
    #[error("event for {received} applied to book of {expected}")]
    SymbolMismatch {
        /// Book symbol
        expected: Symbol,
        /// Event symbol
        received: Symbol,
    },
}

impl BookError {
    /// Short label for counters and logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            BookError::SequenceGap { .. } => "sequence_gap",
            BookError::SequenceGapUnrecoverable { .. } => "sequence_gap_unrecoverable",
            BookError::StaleSequence { .. } => "stale_sequence",
            BookError::InvariantViolation { .. } => "invariant_violation",
            BookError::SymbolMismatch { .. } => "symbol_mismatch",
        }
    }
}

/// Inference boundary errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// Model did not answer within its budget; the call was abandoned
    #[error("inference exceeded {budget_us}us budget")]
    Timeout {
        /// Budget in microseconds
        budget_us: u64,
    },

    /// Inference thread still working on an abandoned request
    #[error("inference runner busy")]
    Busy,

    /// The model itself failed
    #[error("model error: {0}")]
    Model(String),

    /// Inference thread is gone
    #[error("inference runner disconnected")]
    Disconnected,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for the config schema
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values are individually valid but inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine-level errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Book error surfaced through the engine
    #[error(transparent)]
    Book(#[from] BookError),

    /// Inference error surfaced through the engine
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Inbound queue for a worker is full
    #[error("worker {worker} inbound queue saturated")]
    QueueSaturated {
        /// Worker index
        worker: usize,
    },

    /// Engine has shut down
    #[error("engine is shut down")]
    Shutdown,

    /// A worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// A worker thread panicked
    #[error("worker {worker} panicked")]
    WorkerPanicked {
        /// Worker index
        worker: usize,
    },

    /// Latency histogram could not be created
    #[error("latency histogram: {0}")]
    Histogram(String),
}
