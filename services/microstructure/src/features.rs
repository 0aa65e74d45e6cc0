//! Rolling feature windows for pattern classification

use std::collections::VecDeque;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::book::BookState;
use crate::liquidity::LiquidityMetrics;

/// Columns of the model input matrix
pub const FEATURE_DIM: usize = 5;

/// Per-update feature vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Mid price in ticks
    pub price: f64,
    /// Visible liquidity inside the depth window
    pub size: f64,
    /// Spread in ticks (0 when one-sided or crossed)
    pub spread: f64,
    /// Book imbalance in [-1, 1]
    pub imbalance: f64,
    /// Mid change in ticks since the previous vector
    pub momentum: f64,
}

impl FeatureVector {
    /// Build from the book and its freshly computed metrics.
    ///
    /// One-sided books carry the previous mid forward so momentum stays 0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn extract(state: &BookState, metrics: &LiquidityMetrics, previous: Option<&FeatureVector>) -> Self {
        let previous_mid = previous.map(|p| p.price);
        let price = state.mid_ticks().or(previous_mid).unwrap_or(0.0);
        let momentum = previous_mid.map_or(0.0, |prev| price - prev);
        let spread = match state.spread_ticks() {
            Some(s) if s > 0 => s as f64,
            _ => 0.0,
        };
        Self {
            price,
            size: metrics.visible_liquidity as f64,
            spread,
            imbalance: metrics.imbalance,
            momentum,
        }
    }

    /// Row layout used in the model input matrix
    #[must_use]
    pub fn as_row(&self) -> [f64; FEATURE_DIM] {
        [self.price, self.size, self.spread, self.imbalance, self.momentum]
    }

    fn is_finite(&self) -> bool {
        self.as_row().iter().all(|x| x.is_finite())
    }
}

/// Fixed-capacity ring of feature vectors; appends evict the oldest
#[derive(Debug, Clone)]
pub struct FeatureWindow {
    vectors: VecDeque<FeatureVector>,
    capacity: usize,
}

impl FeatureWindow {
    /// Empty window holding at most `capacity` vectors
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { vectors: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append a vector; non-finite vectors are dropped
    pub fn push(&mut self, vector: FeatureVector) {
        if !vector.is_finite() {
            return;
        }
        if self.vectors.len() == self.capacity {
            self.vectors.pop_front();
        }
        self.vectors.push_back(vector);
    }

    /// Change capacity, keeping the most recent vectors
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        while self.vectors.len() > capacity {
            self.vectors.pop_front();
        }
        self.capacity = capacity;
    }

    /// Maximum vectors held
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Vectors currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Whether no vectors are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Whether the window has reached capacity
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.vectors.len() == self.capacity
    }

    /// Most recent vector
    #[must_use]
    pub fn last(&self) -> Option<&FeatureVector> {
        self.vectors.back()
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &FeatureVector> + '_ {
        self.vectors.iter()
    }

    /// Most recent `rows` vectors as a `rows x FEATURE_DIM` matrix, oldest first
    #[must_use]
    pub fn to_matrix(&self, rows: usize) -> Array2<f64> {
        let rows = rows.min(self.vectors.len());
        let skip = self.vectors.len() - rows;
        let mut matrix = Array2::zeros((rows, FEATURE_DIM));
        for (mut row, vector) in matrix.rows_mut().into_iter().zip(self.vectors.iter().skip(skip)) {
            for (cell, value) in row.iter_mut().zip(vector.as_row()) {
                *cell = value;
            }
        }
        matrix
    }

    /// Forget all vectors
    pub fn clear(&mut self) {
        self.vectors.clear();
    }
}
