//! Liquidity Metrics Calculator tests

use microstructure::book::BookStore;
use microstructure::config::{EngineConfig, ScoreWeights};
use microstructure::events::{OrderBookEvent, Side};
use microstructure::liquidity::{LiquidityCalculator, SpreadWindow, imbalance, liquidity_score};
use rstest::{fixture, rstest};
use services_common::Ts;

use crate::utils::{SYM, add, px};

#[fixture]
fn calculator() -> LiquidityCalculator {
    LiquidityCalculator::from_config(&EngineConfig { depth_window: 2, ..EngineConfig::default() })
}

#[rstest]
#[case(100, 0, 1.0)]
#[case(0, 100, -1.0)]
#[case(0, 0, 0.0)]
#[case(30, 10, 0.5)]
#[case(50, 50, 0.0)]
fn test_imbalance(#[case] bid: u64, #[case] ask: u64, #[case] expected: f64) {
    assert!((imbalance(bid, ask) - expected).abs() < 1e-12);
}

#[rstest]
fn test_metrics_over_depth_window(calculator: LiquidityCalculator) {
    let mut store = BookStore::new(SYM, 16);
    let mut spreads = SpreadWindow::new(60);
    let events = [
        add(Side::Bid, 10_000, 40, 1),
        add(Side::Bid, 9_990, 20, 2),
        add(Side::Bid, 9_980, 500, 3),
        add(Side::Ask, 10_010, 10, 4),
        add(Side::Ask, 10_020, 10, 5),
    ];
    for event in events {
        store.apply(event).unwrap();
        LiquidityCalculator::observe_spread(store.state(), &mut spreads);
    }

    let metrics = calculator.compute(store.state(), &spreads, 0.0);
    assert_eq!(metrics.bid_liquidity, 60);
    assert_eq!(metrics.ask_liquidity, 20);
    assert_eq!(metrics.visible_liquidity, 80);
    assert_eq!(calculator.visible_liquidity(store.state()), 80);
    assert_eq!(metrics.depth, 4);
    assert!((metrics.imbalance - 0.5).abs() < 1e-12);
    // Spread is 10 cents = 1000 ticks for both samples recorded once both sides existed
    assert!((metrics.avg_spread - 1_000.0).abs() < 1e-9);
    assert!(metrics.spread_volatility.abs() < 1e-9);
    assert!(metrics.quality.is_clean());
    assert_eq!(metrics.sequence, 5);
}

#[rstest]
fn test_hidden_estimate_raises_score(calculator: LiquidityCalculator) {
    let mut store = BookStore::new(SYM, 16);
    let spreads = SpreadWindow::new(60);
    store.apply(add(Side::Bid, 10_000, 100, 1)).unwrap();
    store.apply(add(Side::Ask, 10_010, 100, 2)).unwrap();

    let plain = calculator.compute(store.state(), &spreads, 0.0);
    let boosted = calculator.compute(store.state(), &spreads, 5_000.0);
    assert!(boosted.liquidity_score > plain.liquidity_score);
    assert_eq!(boosted.hidden_liquidity_estimate, 5_000.0);

    let sanitized = calculator.compute(store.state(), &spreads, f64::NAN);
    assert_eq!(sanitized.hidden_liquidity_estimate, 0.0);
}

#[test]
fn test_crossed_book_flagged_and_spread_skipped() {
    let mut store = BookStore::new(SYM, 16);
    let mut spreads = SpreadWindow::new(60);
    store.apply(add(Side::Ask, 10_050, 10, 1)).unwrap();
    store.apply(add(Side::Bid, 10_100, 10, 2)).unwrap();
    LiquidityCalculator::observe_spread(store.state(), &mut spreads);

    let metrics = LiquidityCalculator::from_config(&EngineConfig::default()).compute(store.state(), &spreads, 0.0);
    assert!(metrics.quality.crossed);
    assert_eq!(spreads.stats().count(), 0);
    assert_eq!(metrics.avg_spread, 0.0);
}

#[test]
fn test_spread_window_evicts_old_seconds() {
    let mut window = SpreadWindow::new(2);
    window.record(10, Ts::from_secs(100));
    window.record(20, Ts::from_secs(101));
    assert_eq!(window.bucket_count(), 2);
    window.record(30, Ts::from_secs(102));
    assert_eq!(window.bucket_count(), 2);
    assert!((window.stats().mean() - 25.0).abs() < 1e-12);
}

#[rstest]
fn test_one_sided_book_still_ages_out_spreads(calculator: LiquidityCalculator) {
    let mut store = BookStore::new(SYM, 16);
    let mut spreads = SpreadWindow::new(5);
    store.apply(OrderBookEvent::add(SYM, Side::Bid, px(10_000), 10, 1, Ts::from_secs(10))).unwrap();
    store.apply(OrderBookEvent::add(SYM, Side::Ask, px(10_100), 10, 2, Ts::from_secs(10))).unwrap();
    LiquidityCalculator::observe_spread(store.state(), &mut spreads);
    assert_eq!(spreads.bucket_count(), 1);

    // Ten minutes later the ask side empties; no new spread is recorded
    store.apply(OrderBookEvent::delete(SYM, Side::Ask, px(10_100), 3, Ts::from_secs(600))).unwrap();
    LiquidityCalculator::observe_spread(store.state(), &mut spreads);

    assert_eq!(spreads.bucket_count(), 0);
    let metrics = calculator.compute(store.state(), &spreads, 0.0);
    assert_eq!(metrics.avg_spread, 0.0);
    assert_eq!(metrics.spread_volatility, 0.0);
}

#[rstest]
#[case(0.0, 0.0, 0.0)]
#[case(1e12, 0.0, 0.0)]
#[case(0.0, 1e9, 1e9)]
#[case(f64::INFINITY, f64::NAN, -5.0)]
fn test_score_bounded(#[case] liquidity: f64, #[case] spread: f64, #[case] volatility: f64) {
    let score = liquidity_score(&ScoreWeights::default(), liquidity, spread, volatility);
    assert!((0.0..=100.0).contains(&score), "score {score} out of range");
}
