//! Shared primitives for the microstructure services
//!
//! Fixed-point prices, integer sizes, nanosecond timestamps and symbol
//! identifiers. Everything downstream of the feed normalizer speaks in
//! these types so book arithmetic stays exact and deterministic.

pub mod constants;
pub mod types;

pub use types::{Px, Qty, Symbol, Ts};
