//! Configuration tests
//!
//! File loading goes through real temporary files; the hot-reload watcher
//! runs on a tokio runtime against one of them.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use microstructure::config::{ConfigHandle, EngineConfig, watch_file};
use microstructure::error::ConfigError;
use rstest::rstest;
use services_common::Symbol;
use tempfile::NamedTempFile;

const FULL: &str = r#"
depth_window = 5
time_window_secs = 30
latency_target_p99_us = 80
latency_ceiling_us = 400
classification_stride = 2
feature_window_len = 16
resync_buffer_capacity = 64
inference_budget_us = 150
workers = 2
priority_symbols = [1, 42]

[score_weights]
liquidity = 0.6
spread = 0.2
volatility = 0.2

[hidden]
prior_alpha = 2.0
min_episodes = 5

[governor]
evaluation_interval_ms = 50
sustain_intervals = 2
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_full_file() {
    let file = write_config(FULL);
    let config = EngineConfig::from_file(file.path()).unwrap();

    assert_eq!(config.depth_window, 5);
    assert_eq!(config.time_window_secs, 30);
    assert_eq!(config.latency_target(), Duration::from_micros(80));
    assert_eq!(config.latency_ceiling(), Duration::from_micros(400));
    assert_eq!(config.inference_budget(), Duration::from_micros(150));
    assert_eq!(config.resolved_workers(), 2);
    assert!(config.is_priority(Symbol::new(42)));
    assert!((config.score_weights.liquidity - 0.6).abs() < f64::EPSILON);
    // Unset keys inside a present table keep their defaults
    assert!((config.score_weights.spread_half_point - 100.0).abs() < f64::EPSILON);
    assert!((config.hidden.prior_alpha - 2.0).abs() < f64::EPSILON);
    assert_eq!(config.hidden.min_episodes, 5);
    assert_eq!(config.hidden.refill_window_ms, 500);
    assert_eq!(config.governor.sustain_intervals, 2);
    assert_eq!(config.governor.cooldown_intervals, 5);
}

#[test]
fn test_empty_file_is_defaults() {
    let file = write_config("");
    assert_eq!(EngineConfig::from_file(file.path()).unwrap(), EngineConfig::default());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[rstest]
#[case::bad_toml("depth_window = [", "parse")]
#[case::wrong_type("depth_window = \"ten\"", "parse")]
#[case::zero_depth("depth_window = 0", "depth_window")]
#[case::zero_stride("classification_stride = 0", "classification_stride")]
#[case::negative_weight("[score_weights]\nspread = -1.0", "score weights")]
#[case::probability_one("[hidden]\nmax_probability = 1.0", "max_probability")]
#[case::window_scale("[governor]\ndegraded_window_scale = 0.0", "degraded_window_scale")]
fn test_invalid_rejected(#[case] content: &str, #[case] mentions: &str) {
    let err = EngineConfig::from_toml_str(content).unwrap_err();
    assert!(err.to_string().contains(mentions), "{err} should mention {mentions}");
}

#[test]
fn test_round_trips_through_toml() {
    let config = EngineConfig::from_toml_str(FULL).unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    assert_eq!(EngineConfig::from_toml_str(&rendered).unwrap(), config);
}

#[test]
fn test_reload_from_file() {
    let handle = ConfigHandle::new(EngineConfig::default()).unwrap();
    let good = write_config("depth_window = 3");
    let bad = write_config("depth_window = 0");

    assert_eq!(handle.reload_from(good.path()).unwrap(), 1);
    assert_eq!(handle.load().depth_window, 3);

    assert!(handle.reload_from(bad.path()).is_err());
    assert_eq!(handle.generation(), 1);
    assert_eq!(handle.load().depth_window, 3);
}

#[test]
fn test_readers_see_whole_snapshots() {
    let handle = Arc::new(ConfigHandle::new(EngineConfig::default()).unwrap());
    let reader = {
        let handle = Arc::clone(&handle);
        std::thread::spawn(move || {
            for _ in 0..10_000 {
                let config = handle.load();
                // Updates below always move these two together
                assert_eq!(config.latency_ceiling_us, config.latency_target_p99_us * 5);
            }
        })
    };
    for target in 1..=200u64 {
        let config = EngineConfig {
            latency_target_p99_us: target,
            latency_ceiling_us: target * 5,
            ..EngineConfig::default()
        };
        handle.update(config).unwrap();
    }
    reader.join().unwrap();
    assert_eq!(handle.generation(), 200);
}

#[tokio::test]
async fn test_watcher_picks_up_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    std::fs::write(&path, "depth_window = 4").unwrap();

    let handle = Arc::new(ConfigHandle::new(EngineConfig::from_file(&path).unwrap()).unwrap());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let watcher = tokio::spawn(watch_file(Arc::clone(&handle), path.clone(), Duration::from_millis(10), shutdown_rx));

    // Let the watcher record the original modification time first
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Some filesystems only keep whole-second mtimes
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    std::fs::write(&path, "depth_window = 9").unwrap();

    let mut reloaded = false;
    for _ in 0..200 {
        if handle.load().depth_window == 9 {
            reloaded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reloaded, "watcher never reloaded the file");

    // An invalid edit is ignored
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    std::fs::write(&path, "depth_window = 0").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.load().depth_window, 9);

    shutdown_tx.send(true).unwrap();
    watcher.await.unwrap();
}
