//! Unified error handling for the grid engine
//!
//! Subsystems keep their own `thiserror` enums; this module folds them into a
//! single context-rich type for the CLI and the engine supervisor.

use std::fmt;
use std::io;

use crate::backtesting::engine::BacktestError;
use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::optimization::OptimizationError;
use crate::selection::SelectionError;

/// Main error type for the grid engine
#[derive(Debug)]
pub enum TradingError {
    // Configuration errors
    ConfigNotFound(String),
    ConfigParse(String),
    ConfigValidation(String),

    // Exchange / gateway errors
    Gateway(GatewayError),
    CredentialsMissing(String),

    // Controller errors
    SymbolNotFound(String),
    SymbolDegraded(String, String), // (symbol, reason)

    // Offline errors
    Backtest(String),
    Optimization(String),
    Selection(String),

    // IO errors
    FileRead(String),
    FileWrite(String),
    Serialization(String),

    // Runtime errors
    ChannelClosed(String),
    Internal(String),
}

impl TradingError {
    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            TradingError::ConfigNotFound(path) => {
                format!(
                    "Configuration file not found: {}\n\n\
                    💡 Quick fix:\n\
                    1. Run: grid-engine init\n\
                    2. Edit the [[symbols]] section\n\
                    3. Try again",
                    path
                )
            }
            TradingError::ConfigValidation(msg) => {
                format!(
                    "Configuration validation error: {}\n\n\
                    💡 Check config.toml for:\n\
                    - Spacing values between 0 and 1\n\
                    - Positive quantities\n\
                    - Leverage between 1 and 125",
                    msg
                )
            }
            TradingError::CredentialsMissing(var) => {
                format!(
                    "Exchange credentials missing: {} is not set\n\n\
                    💡 Export the API key, secret and passphrase variables\n\
                    named in [exchange], or use --paper",
                    var
                )
            }
            TradingError::Gateway(GatewayError::Authentication(msg)) => {
                format!(
                    "Exchange rejected the credentials: {}\n\n\
                    💡 Check:\n\
                    - API key has futures trading permission\n\
                    - Passphrase matches the key\n\
                    - System clock is in sync",
                    msg
                )
            }
            TradingError::Gateway(GatewayError::RateLimited(msg)) => {
                format!(
                    "Exchange rate limit exceeded: {}\n\n\
                    💡 Lower gateway.rate_limit_refill_per_sec or trade fewer symbols",
                    msg
                )
            }
            TradingError::SymbolDegraded(symbol, reason) => {
                format!(
                    "{} is degraded: {}\n\n\
                    💡 Entry placement is halted; positions are still monitored.\n\
                    Fix the cause, then stop and start the symbol again",
                    symbol, reason
                )
            }
            _ => self.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingError::Gateway(e) if e.is_transient())
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::ConfigNotFound(_)
            | TradingError::ConfigParse(_)
            | TradingError::ConfigValidation(_) => "config",

            TradingError::Gateway(_) | TradingError::CredentialsMissing(_) => "gateway",

            TradingError::SymbolNotFound(_) | TradingError::SymbolDegraded(_, _) => "controller",

            TradingError::Backtest(_)
            | TradingError::Optimization(_)
            | TradingError::Selection(_) => "offline",

            TradingError::FileRead(_)
            | TradingError::FileWrite(_)
            | TradingError::Serialization(_) => "io",

            TradingError::ChannelClosed(_) | TradingError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for TradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path)
            }
            TradingError::ConfigParse(msg) => {
                write!(f, "Configuration parse error: {}", msg)
            }
            TradingError::ConfigValidation(msg) => {
                write!(f, "Configuration validation error: {}", msg)
            }
            TradingError::Gateway(e) => write!(f, "Gateway error: {}", e),
            TradingError::CredentialsMissing(var) => {
                write!(f, "Missing exchange credential: {}", var)
            }
            TradingError::SymbolNotFound(symbol) => {
                write!(f, "Symbol not registered: {}", symbol)
            }
            TradingError::SymbolDegraded(symbol, reason) => {
                write!(f, "Symbol {} degraded: {}", symbol, reason)
            }
            TradingError::Backtest(msg) => write!(f, "Backtest failed: {}", msg),
            TradingError::Optimization(msg) => write!(f, "Optimization failed: {}", msg),
            TradingError::Selection(msg) => write!(f, "Coin selection failed: {}", msg),
            TradingError::FileRead(msg) => write!(f, "Failed to read file: {}", msg),
            TradingError::FileWrite(msg) => write!(f, "Failed to write file: {}", msg),
            TradingError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            TradingError::ChannelClosed(what) => write!(f, "Channel closed: {}", what),
            TradingError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for TradingError {}

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TradingError::FileRead(err.to_string()),
            io::ErrorKind::PermissionDenied => TradingError::FileWrite(err.to_string()),
            _ => TradingError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::ConfigParse(err.to_string())
    }
}

impl From<reqwest::Error> for TradingError {
    fn from(err: reqwest::Error) -> Self {
        TradingError::Gateway(GatewayError::from(err))
    }
}

impl From<ConfigError> for TradingError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::FileRead(msg) => TradingError::ConfigNotFound(msg),
            ConfigError::Parse(msg) => TradingError::ConfigParse(msg),
            ConfigError::Validation(msg) => TradingError::ConfigValidation(msg),
            ConfigError::FileWrite(msg) => TradingError::FileWrite(msg),
            ConfigError::Serialize(msg) => TradingError::Serialization(msg),
            ConfigError::MissingEnv(var) => TradingError::CredentialsMissing(var),
        }
    }
}

impl From<GatewayError> for TradingError {
    fn from(err: GatewayError) -> Self {
        TradingError::Gateway(err)
    }
}

impl From<BacktestError> for TradingError {
    fn from(err: BacktestError) -> Self {
        TradingError::Backtest(err.to_string())
    }
}

impl From<OptimizationError> for TradingError {
    fn from(err: OptimizationError) -> Self {
        TradingError::Optimization(err.to_string())
    }
}

impl From<SelectionError> for TradingError {
    fn from(err: SelectionError) -> Self {
        TradingError::Selection(err.to_string())
    }
}

/// Result type alias for engine operations
pub type TradingResult<T> = Result<T, TradingError>;
