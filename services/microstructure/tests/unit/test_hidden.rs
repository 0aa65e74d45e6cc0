//! Hidden-Liquidity Estimator tests
//!
//! Deltas come from a real book so the estimator sees exactly what the
//! pipeline hands it.

use microstructure::book::{BookDelta, BookStore};
use microstructure::config::{EngineConfig, HiddenConfig};
use microstructure::events::{OrderBookEvent, Side};
use microstructure::hidden::HiddenLiquidityEstimator;
use microstructure::liquidity::LiquidityCalculator;

use crate::utils::{SYM, add, modify, px, ts};

const LEVEL: i64 = 10_000;

fn run(events: Vec<OrderBookEvent>) -> (f64, HiddenLiquidityEstimator) {
    let mut store = BookStore::new(SYM, 64);
    let mut estimator = HiddenLiquidityEstimator::new(HiddenConfig::default());
    let calculator = LiquidityCalculator::from_config(&EngineConfig::default());
    let mut estimate = 0.0;
    for event in events {
        let delta: BookDelta = store.apply(event).unwrap();
        estimator.observe(&delta);
        estimate = estimator.estimate(delta.exchange_time, calculator.visible_liquidity(store.state()));
    }
    (estimate, estimator)
}

/// Shown 50, filled down to 10, shown again at 50 then 48, five times over
fn replenishing_level() -> Vec<OrderBookEvent> {
    let mut events = vec![add(Side::Bid, LEVEL, 50, 1)];
    let mut seq = 1;
    for _ in 0..5 {
        for size in [10, 50, 10, 48] {
            seq += 1;
            events.push(modify(Side::Bid, LEVEL, size, seq));
        }
    }
    events
}

#[test]
fn test_replenishment_raises_estimate() {
    let (single, _) = run(vec![add(Side::Bid, LEVEL, 50, 1)]);
    let (repeated, estimator) = run(replenishing_level());

    assert_eq!(single, 0.0);
    assert!(repeated > single, "repeated refills should raise the estimate ({repeated} vs {single})");

    let level = estimator.level(Side::Bid, px(LEVEL)).unwrap();
    assert_eq!(level.episodes, 10);
    assert!(level.probability > 0.5);
    assert!(level.mean_refill > 0.0);
}

#[test]
fn test_estimate_bounded_by_multiplier() {
    let config = HiddenConfig { max_multiplier: 2.0, ..HiddenConfig::default() };
    let mut store = BookStore::new(SYM, 64);
    let mut estimator = HiddenLiquidityEstimator::new(config);
    let mut last = 0.0;
    let mut seq = 1;

    estimator.observe(&store.apply(add(Side::Ask, LEVEL, 100, seq)).unwrap());
    for _ in 0..50 {
        seq += 1;
        estimator.observe(&store.apply(modify(Side::Ask, LEVEL, 5, seq)).unwrap());
        seq += 1;
        let delta = store.apply(modify(Side::Ask, LEVEL, 100, seq)).unwrap();
        estimator.observe(&delta);
        last = estimator.estimate(delta.exchange_time, 100);
    }
    assert!(last > 0.0);
    assert!(last <= 200.0 + 1e-9);
}

#[test]
fn test_unanswered_depletion_lowers_probability() {
    let config = HiddenConfig { refill_window_ms: 5, ..HiddenConfig::default() };
    let mut estimator = HiddenLiquidityEstimator::new(config);
    let mut store = BookStore::new(SYM, 64);

    estimator.observe(&store.apply(add(Side::Bid, LEVEL, 100, 1)).unwrap());
    estimator.observe(&store.apply(modify(Side::Bid, LEVEL, 10, 2)).unwrap());
    let _ = estimator.estimate(ts(100), 10);

    let level = estimator.level(Side::Bid, px(LEVEL)).unwrap();
    assert_eq!(level.episodes, 1);
    // Prior Beta(1, 4) plus one failure
    assert!((level.probability - 1.0 / 6.0).abs() < 1e-12);
}

#[test]
fn test_reset_forgets_levels() {
    let (_, mut estimator) = run(replenishing_level());
    assert!(estimator.tracked_levels() > 0);
    estimator.reset();
    assert_eq!(estimator.tracked_levels(), 0);
    assert_eq!(estimator.last_estimate(), 0.0);
}

#[test]
fn test_huge_refill_window_is_accepted_and_safe() {
    let hidden = HiddenConfig { refill_window_ms: u64::MAX / 1_000, ..HiddenConfig::default() };
    let config = EngineConfig { hidden: hidden.clone(), ..EngineConfig::default() };
    assert!(config.validate().is_ok());
    assert_eq!(hidden.refill_window_ns(), u64::MAX);

    let mut store = BookStore::new(SYM, 64);
    let mut estimator = HiddenLiquidityEstimator::new(hidden);
    for event in replenishing_level() {
        let delta = store.apply(event).unwrap();
        estimator.observe(&delta);
        let estimate = estimator.estimate(delta.exchange_time, 50);
        assert!(estimate.is_finite() && estimate >= 0.0);
    }
    assert_eq!(estimator.level(Side::Bid, px(LEVEL)).unwrap().episodes, 10);
}
