// Configuration management for the grid engine

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::optimization::{ParamRange, RankMetric};
use crate::selection::ScoreWeights;

/// Per-symbol grid parameters. Immutable for the lifetime of one activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub symbol: String,
    pub take_profit_spacing: f64, // fraction of fill price
    pub grid_spacing: f64,        // fraction of anchor price
    pub initial_quantity: f64,
    pub leverage: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl GridConfig {
    pub fn new(symbol: &str, take_profit_spacing: f64, grid_spacing: f64, initial_quantity: f64, leverage: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            take_profit_spacing,
            grid_spacing,
            initial_quantity,
            leverage,
            enabled: true,
        }
    }

    /// Same symbol and sizing with different spacings, as used by the optimizer
    pub fn with_spacings(&self, take_profit_spacing: f64, grid_spacing: f64) -> Self {
        Self {
            take_profit_spacing,
            grid_spacing,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Validation("symbol must not be empty".to_string()));
        }

        if !(self.take_profit_spacing > 0.0 && self.take_profit_spacing < 1.0) {
            return Err(ConfigError::Validation(format!(
                "{}: take_profit_spacing must be in (0, 1), got {}",
                self.symbol, self.take_profit_spacing
            )));
        }

        if !(self.grid_spacing > 0.0 && self.grid_spacing < 1.0) {
            return Err(ConfigError::Validation(format!(
                "{}: grid_spacing must be in (0, 1), got {}",
                self.symbol, self.grid_spacing
            )));
        }

        if !(self.initial_quantity > 0.0) || !self.initial_quantity.is_finite() {
            return Err(ConfigError::Validation(format!(
                "{}: initial_quantity must be positive",
                self.symbol
            )));
        }

        if self.leverage == 0 || self.leverage > 125 {
            return Err(ConfigError::Validation(format!(
                "{}: leverage must be between 1 and 125, got {}",
                self.symbol, self.leverage
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub public_ws_url: String,
    pub private_ws_url: String,
    pub product_type: String,
    pub margin_coin: String,
    // Names of the environment variables holding credentials. The engine never stores secrets.
    pub api_key_env: String,
    pub api_secret_env: String,
    pub passphrase_env: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.bitget.com".to_string(),
            public_ws_url: "wss://ws.bitget.com/v2/ws/public".to_string(),
            private_ws_url: "wss://ws.bitget.com/v2/ws/private".to_string(),
            product_type: "USDT-FUTURES".to_string(),
            margin_coin: "USDT".to_string(),
            api_key_env: "GRID_API_KEY".to_string(),
            api_secret_env: "GRID_API_SECRET".to_string(),
            passphrase_env: "GRID_API_PASSPHRASE".to_string(),
        }
    }
}

/// API credentials resolved from the environment at startup
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .finish()
    }
}

impl ExchangeConfig {
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
        };

        Ok(Credentials {
            api_key: read(&self.api_key_env)?,
            api_secret: read(&self.api_secret_env)?,
            passphrase: read(&self.passphrase_env)?,
        })
    }
}

/// Ladder shape and inventory-control knobs shared by every symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub ladder_depth: usize,
    pub recenter_steps: f64,
    pub position_threshold_multiplier: f64,
    pub inventory_gamma: f64,
    pub quantity_gamma: f64,
    pub funding_bias: f64,
    pub funding_threshold: f64,
    pub max_skew_steps: f64,
    pub indicator_guard: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ladder_depth: 3,
            recenter_steps: 2.0,
            position_threshold_multiplier: 20.0,
            inventory_gamma: 0.1,
            quantity_gamma: 0.5,
            funding_bias: 0.2,
            funding_threshold: 0.0001,
            max_skew_steps: 1.0,
            indicator_guard: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_drawdown: f64,            // fraction of session peak equity
    pub drawdown_rearm_fraction: f64, // trigger re-arms below max_drawdown * this
    pub margin_threshold: f64,        // margin used / equity
    pub resync_tolerance: f64,        // relative equity drift before a forced resync
    pub trailing_enabled: bool,
    pub trailing_start_profit: f64,
    pub trailing_drawdown_pct: f64,
    pub trailing_min_drawdown: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown: 0.20,
            drawdown_rearm_fraction: 0.8,
            margin_threshold: 0.5,
            resync_tolerance: 0.005,
            trailing_enabled: false,
            trailing_start_profit: 5.0,
            trailing_drawdown_pct: 0.10,
            trailing_min_drawdown: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: f64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub account_snapshot_secs: u64,
    pub funding_refresh_secs: u64,
    pub stop_drain_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit_capacity: 10,
            rate_limit_refill_per_sec: 10.0,
            retry_attempts: 4,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            retry_multiplier: 2.0,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            account_snapshot_secs: 30,
            funding_refresh_secs: 300,
            stop_drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    pub initial_capital: f64,
    pub fee_rate: f64,
    pub max_bars_per_fetch: usize,
    pub interval_minutes: u32,
    pub settlement_asset: String,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: 1000.0,
            fee_rate: 0.0004,
            max_bars_per_fetch: 1000,
            interval_minutes: 15,
            settlement_asset: "USDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub take_profit: ParamRange,
    pub grid_spacing: ParamRange,
    pub max_drawdown: f64,
    pub workers: usize, // 0 = one per core
    /// Secondary ranking for reports; selection always uses ROI
    pub metric: Option<RankMetric>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            take_profit: ParamRange::new(0.002, 0.008, 0.001),
            grid_spacing: ParamRange::new(0.003, 0.010, 0.001),
            max_drawdown: 0.5,
            workers: 0,
            metric: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub weights: ScoreWeights,
    pub score_threshold: f64, // hysteresis margin in score points
    pub cooldown_hours: i64,
    pub max_rotations_per_week: u32,
    pub rejection_cooldown_hours: i64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            score_threshold: 15.0,
            cooldown_hours: 24,
            max_rotations_per_week: 2,
            rejection_cooldown_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub symbols: Vec<GridConfig>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub backtest: BacktestSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            symbols: vec![GridConfig::new("XRPUSDT", 0.004, 0.006, 30.0, 20)],
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            gateway: GatewayConfig::default(),
            status: StatusConfig::default(),
            backtest: BacktestSettings::default(),
            optimizer: OptimizerSettings::default(),
            selection: SelectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            tracing::info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    pub fn symbol(&self, symbol: &str) -> Option<&GridConfig> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }

    pub fn enabled_symbols(&self) -> impl Iterator<Item = &GridConfig> {
        self.symbols.iter().filter(|s| s.enabled)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, grid) in self.symbols.iter().enumerate() {
            grid.validate()?;
            if self.symbols[..i].iter().any(|other| other.symbol == grid.symbol) {
                return Err(ConfigError::Validation(format!("duplicate symbol {}", grid.symbol)));
            }
        }

        if self.strategy.ladder_depth == 0 {
            return Err(ConfigError::Validation("ladder_depth must be greater than 0".to_string()));
        }

        if self.strategy.recenter_steps <= 0.0 {
            return Err(ConfigError::Validation("recenter_steps must be positive".to_string()));
        }

        if !(self.risk.max_drawdown > 0.0 && self.risk.max_drawdown <= 1.0) {
            return Err(ConfigError::Validation("risk.max_drawdown must be in (0, 1]".to_string()));
        }

        if !(self.risk.drawdown_rearm_fraction > 0.0 && self.risk.drawdown_rearm_fraction <= 1.0) {
            return Err(ConfigError::Validation(
                "risk.drawdown_rearm_fraction must be in (0, 1]".to_string(),
            ));
        }

        if self.risk.margin_threshold <= 0.0 {
            return Err(ConfigError::Validation("risk.margin_threshold must be positive".to_string()));
        }

        if self.gateway.rate_limit_capacity == 0 || self.gateway.rate_limit_refill_per_sec <= 0.0 {
            return Err(ConfigError::Validation("gateway rate limit must be positive".to_string()));
        }

        if self.gateway.retry_attempts == 0 {
            return Err(ConfigError::Validation("gateway.retry_attempts must be at least 1".to_string()));
        }

        if self.status.channel_capacity == 0 {
            return Err(ConfigError::Validation("status.channel_capacity must be positive".to_string()));
        }

        if self.backtest.initial_capital <= 0.0 {
            return Err(ConfigError::Validation("backtest.initial_capital must be positive".to_string()));
        }

        if self.backtest.max_bars_per_fetch == 0 {
            return Err(ConfigError::Validation("backtest.max_bars_per_fetch must be positive".to_string()));
        }

        self.optimizer
            .take_profit
            .validate("optimizer.take_profit")
            .and_then(|_| self.optimizer.grid_spacing.validate("optimizer.grid_spacing"))
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable not set: {0}")]
    MissingEnv(String),
}
