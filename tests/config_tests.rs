// Integration tests for configuration loading and validation

mod common;

use common::{create_temp_config_path, create_test_config, xrp_grid};
use grid_engine::{ConfigError, EngineConfig, GridConfig, TradingError};
use serial_test::serial;
use std::fs;

#[test]
fn test_default_config_creation() {
    let config = create_test_config();

    assert_eq!(config.symbols.len(), 1);
    assert_eq!(config.symbols[0].symbol, "XRPUSDC");
    assert_eq!(config.strategy.ladder_depth, 3);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_file_round_trip() {
    let (_dir, path) = create_temp_config_path();
    let mut config = create_test_config();
    config.symbols.push(GridConfig::new("DOGEUSDC", 0.005, 0.008, 400.0, 10));
    config.risk.max_drawdown = 0.15;

    config.to_file(&path).expect("Failed to write config");
    let loaded = EngineConfig::from_file(&path).expect("Failed to load config");

    assert_eq!(loaded.symbols, config.symbols);
    assert_eq!(loaded.risk.max_drawdown, 0.15);
    assert_eq!(loaded.optimizer.take_profit, config.optimizer.take_profit);
    assert_eq!(loaded.exchange.api_key_env, "GRID_API_KEY");
}

#[test]
fn test_partial_file_takes_defaults() {
    let (_dir, path) = create_temp_config_path();
    fs::write(
        &path,
        r#"
[[symbols]]
symbol = "XRPUSDC"
take_profit_spacing = 0.004
grid_spacing = 0.006
initial_quantity = 30.0
leverage = 20
"#,
    )
    .unwrap();

    let loaded = EngineConfig::from_file(&path).expect("Failed to load config");
    assert_eq!(loaded.symbols, vec![xrp_grid()]);
    assert!(loaded.symbols[0].enabled);
    assert_eq!(loaded.risk.max_drawdown, 0.20);
    assert_eq!(loaded.selection.max_rotations_per_week, 2);
}

#[test]
fn test_load_or_create_writes_defaults() {
    let (_dir, path) = create_temp_config_path();
    assert!(!path.exists());

    let created = EngineConfig::load_or_create(&path).unwrap();
    assert!(path.exists());

    let reloaded = EngineConfig::load_or_create(&path).unwrap();
    assert_eq!(created.symbols, reloaded.symbols);
}

#[test]
fn test_missing_file_is_read_error() {
    let (_dir, path) = create_temp_config_path();
    let err = EngineConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::FileRead(_)));
}

#[test]
fn test_malformed_file_is_parse_error() {
    let (_dir, path) = create_temp_config_path();
    fs::write(&path, "[[symbols]\nsymbol = ").unwrap();

    let err = EngineConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let wrapped: TradingError = err.into();
    assert_eq!(wrapped.category(), "config");
}

#[test]
fn test_invalid_file_is_rejected_on_load() {
    let (_dir, path) = create_temp_config_path();
    let mut config = create_test_config();
    config.symbols[0].grid_spacing = 0.0;
    // to_file does not validate, from_file does
    config.to_file(&path).unwrap();

    let err = EngineConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_grid_validation_bounds() {
    assert!(xrp_grid().validate().is_ok());

    let cases = [
        GridConfig::new("", 0.004, 0.006, 30.0, 20),
        GridConfig::new("XRPUSDC", 0.0, 0.006, 30.0, 20),
        GridConfig::new("XRPUSDC", 1.0, 0.006, 30.0, 20),
        GridConfig::new("XRPUSDC", 0.004, -0.006, 30.0, 20),
        GridConfig::new("XRPUSDC", 0.004, 0.006, 0.0, 20),
        GridConfig::new("XRPUSDC", 0.004, 0.006, f64::INFINITY, 20),
        GridConfig::new("XRPUSDC", 0.004, 0.006, 30.0, 0),
        GridConfig::new("XRPUSDC", 0.004, 0.006, 30.0, 200),
    ];
    for grid in cases {
        assert!(grid.validate().is_err(), "{:?} should be rejected", grid);
    }
}

#[test]
fn test_engine_validation_failures() {
    let mut duplicate = create_test_config();
    duplicate.symbols.push(xrp_grid());
    assert!(duplicate.validate().is_err());

    let mut drawdown = create_test_config();
    drawdown.risk.max_drawdown = 1.5;
    assert!(drawdown.validate().is_err());

    let mut depth = create_test_config();
    depth.strategy.ladder_depth = 0;
    assert!(depth.validate().is_err());

    let mut retries = create_test_config();
    retries.gateway.retry_attempts = 0;
    assert!(retries.validate().is_err());

    let mut sweep = create_test_config();
    sweep.optimizer.grid_spacing.step = 0.0;
    assert!(sweep.validate().is_err());
}

#[test]
fn test_symbol_lookup_and_enabled_filter() {
    let mut config = create_test_config();
    let mut paused = GridConfig::new("ADAUSDC", 0.004, 0.006, 50.0, 10);
    paused.enabled = false;
    config.symbols.push(paused);

    assert!(config.symbol("ADAUSDC").is_some());
    assert!(config.symbol("BTCUSDC").is_none());
    let enabled: Vec<&str> = config.enabled_symbols().map(|g| g.symbol.as_str()).collect();
    assert_eq!(enabled, vec!["XRPUSDC"]);
}

#[test]
#[serial]
fn test_credentials_missing_env() {
    let mut config = create_test_config();
    config.exchange.api_key_env = "GRID_TEST_MISSING_KEY".to_string();
    std::env::remove_var("GRID_TEST_MISSING_KEY");

    match config.exchange.credentials() {
        Err(ConfigError::MissingEnv(name)) => assert_eq!(name, "GRID_TEST_MISSING_KEY"),
        other => panic!("expected MissingEnv, got {:?}", other.map(|_| ())),
    }
}

#[test]
#[serial]
fn test_credentials_read_from_env() {
    let mut config = create_test_config();
    config.exchange.api_key_env = "GRID_TEST_KEY".to_string();
    config.exchange.api_secret_env = "GRID_TEST_SECRET".to_string();
    config.exchange.passphrase_env = "GRID_TEST_PASSPHRASE".to_string();
    std::env::set_var("GRID_TEST_KEY", "k-123");
    std::env::set_var("GRID_TEST_SECRET", "s-456");
    std::env::set_var("GRID_TEST_PASSPHRASE", "phrase");

    let credentials = config.exchange.credentials().expect("credentials");
    assert_eq!(credentials.api_key, "k-123");
    assert_eq!(credentials.api_secret, "s-456");
    // Debug output never shows the secret
    assert!(!format!("{:?}", credentials).contains("s-456"));

    for name in ["GRID_TEST_KEY", "GRID_TEST_SECRET", "GRID_TEST_PASSPHRASE"] {
        std::env::remove_var(name);
    }
}
