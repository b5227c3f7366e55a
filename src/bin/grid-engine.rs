// Grid Engine - command line entry point
// Single binary for running, backtesting, optimizing and scoring grids

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use grid_engine::{EngineConfig, LoggingConfig, RankMetric, TradingError, TradingResult};

// Load command modules from cli directory
#[path = "../cli/backtest_commands.rs"]
mod backtest_commands;
#[path = "../cli/selection_commands.rs"]
mod selection_commands;
#[path = "../cli/trade_commands.rs"]
mod trade_commands;

#[derive(Parser)]
#[command(name = "grid-engine")]
#[command(version)]
#[command(about = "Grid trading engine for perpetual futures", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Where historical bars come from
#[derive(clap::Args, Debug, Clone)]
pub struct DataSource {
    /// CSV file with timestamp,open,high,low,close,volume rows
    #[arg(long, conflicts_with = "days")]
    pub csv: Option<PathBuf>,

    /// Fetch this many days of history from the exchange
    #[arg(long)]
    pub days: Option<i64>,

    /// Bar interval in minutes (defaults to the config value)
    #[arg(long)]
    pub interval: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the configured grids
    Run {
        /// Paper trade against live prices with a simulated exchange
        #[arg(long)]
        paper: bool,

        /// Starting capital for paper trading (defaults to the backtest capital)
        #[arg(long)]
        capital: Option<f64>,

        /// Only these symbols (comma-separated)
        #[arg(short, long)]
        symbols: Option<String>,

        /// Stop after this many minutes
        #[arg(short, long)]
        minutes: Option<f64>,
    },

    /// Replay history through one symbol's grid
    Backtest {
        /// Symbol from the config
        symbol: String,

        #[command(flatten)]
        source: DataSource,

        /// Override take-profit spacing
        #[arg(long)]
        tp: Option<f64>,

        /// Override grid spacing
        #[arg(long)]
        gs: Option<f64>,

        /// Write the result as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sweep take-profit and grid spacing for one symbol
    Optimize {
        /// Symbol from the config
        symbol: String,

        #[command(flatten)]
        source: DataSource,

        /// Maximum drawdown ceiling (fraction)
        #[arg(long)]
        max_drawdown: Option<f64>,

        /// Worker threads (0 = one per core)
        #[arg(long)]
        workers: Option<usize>,

        /// Extra ranking: roi, sharpe, sortino, calmar or profit_factor
        #[arg(long)]
        metric: Option<RankMetric>,

        /// How many top trials to print
        #[arg(long, default_value = "10")]
        top: usize,

        /// Write the full run as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Score and rank candidate symbols from CSV history
    Score {
        /// Candidates as SYMBOL=path.csv
        #[arg(required = true)]
        candidates: Vec<String>,

        /// Currently traded symbol, to check for a rotation
        #[arg(long)]
        current: Option<String>,

        /// Bar interval of the CSV files in minutes
        #[arg(long, default_value = "60")]
        interval: u32,
    },

    /// Show the configuration summary
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging settings come from the config when there is one
    let logging = EngineConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.verbose, &logging);

    if let Err(err) = dispatch(cli).await {
        error!("❌ {}", err);
        eprintln!("\n{}", err.user_message());
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> TradingResult<()> {
    match cli.command {
        // Init doesn't require config (it creates it)
        Commands::Init { force } => init_config(&cli.config, force),

        Commands::Status { json } => {
            let config = load_config(&cli.config)?;
            show_status(&config, json)
        }

        Commands::Run { paper, capital, symbols, minutes } => {
            let config = load_config(&cli.config)?;
            trade_commands::run_engine(&config, paper, capital, symbols, minutes).await
        }

        Commands::Backtest { symbol, source, tp, gs, output } => {
            let config = load_config(&cli.config)?;
            backtest_commands::run_backtest(&config, &symbol, &source, tp, gs, output).await
        }

        Commands::Optimize { symbol, source, max_drawdown, workers, metric, top, output } => {
            let config = load_config(&cli.config)?;
            backtest_commands::run_optimization(&config, &symbol, &source, max_drawdown, workers, metric, top, output)
                .await
        }

        Commands::Score { candidates, current, interval } => {
            let config = EngineConfig::from_file(&cli.config).unwrap_or_default();
            selection_commands::score_candidates(&config, &candidates, current.as_deref(), interval)
        }
    }
}

/// Load and validate the config, pointing at `init` when it is missing
fn load_config(path: &PathBuf) -> TradingResult<EngineConfig> {
    if !path.exists() {
        return Err(TradingError::ConfigNotFound(path.display().to_string()));
    }
    let config = EngineConfig::from_file(path)?;
    config.validate()?;
    info!("📁 Config: {}", path.display());
    Ok(config)
}

fn init_config(path: &PathBuf, force: bool) -> TradingResult<()> {
    if path.exists() && !force {
        warn!("⚠️  {} already exists, use --force to overwrite", path.display());
        return Ok(());
    }
    EngineConfig::default().to_file(path)?;
    info!("📝 Created {}", path.display());
    info!("💡 Next steps:");
    info!("   1. Edit the [[symbols]] section");
    info!("   2. Export the API key variables named in [exchange]");
    info!("   3. Run: grid-engine run --paper");
    Ok(())
}

fn show_status(config: &EngineConfig, json: bool) -> TradingResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("📊 Grid Engine Configuration");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🌐 Exchange: {} ({})", config.exchange.rest_url, config.exchange.product_type);
    let credentials = match config.exchange.credentials() {
        Ok(_) => "available",
        Err(_) => "missing (paper trading only)",
    };
    println!("🔑 Credentials: {}", credentials);
    println!("📈 Symbols:");
    for grid in &config.symbols {
        println!(
            "   {} {:<12} tp {:.4}  gs {:.4}  qty {}  x{}",
            if grid.enabled { "✅" } else { "⏸️ " },
            grid.symbol,
            grid.take_profit_spacing,
            grid.grid_spacing,
            grid.initial_quantity,
            grid.leverage
        );
    }
    println!(
        "🛡️  Risk: drawdown {:.0}%  margin {:.0}%  trailing {}",
        config.risk.max_drawdown * 100.0,
        config.risk.margin_threshold * 100.0,
        if config.risk.trailing_enabled { "on" } else { "off" }
    );
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    Ok(())
}
