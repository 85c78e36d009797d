//! Upbit ensemble trader - main entry point
//!
//! This binary provides six subcommands:
//! - collect: Pull minute candles into SQLite
//! - trade: Run the live trading loop
//! - optimize: Tune ensemble weights with the two-stage grid search
//! - backtest: Replay stored candles through the simulator
//! - import: Load candles from a CSV file
//! - run: Collect and trade in one loop

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "upbit-ensemble")]
#[command(about = "Ensemble trading for Upbit KRW markets with collection, optimization, and live trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull the latest minute candles into storage
    Collect {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds between collection passes
        #[arg(long, default_value = "60")]
        interval: u64,

        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Run live trading (CAUTION - REAL MONEY!)
    Trade {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds between trading cycles
        #[arg(long, default_value = "60")]
        interval: u64,

        /// Skip the startup countdown
        #[arg(long)]
        yes: bool,
    },

    /// Tune ensemble weights with the two-stage grid search
    Optimize {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker threads (0 = one per core)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Months of history to evaluate
        #[arg(short, long)]
        months: Option<u32>,
    },

    /// Replay stored candles through the backtester
    Backtest {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Months of history to replay
        #[arg(short, long)]
        months: Option<u32>,

        /// Signal threshold (overrides config file)
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Import candles from a CSV file
    Import {
        /// CSV file with ts,open,high,low,close,volume rows
        file: PathBuf,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Timeframe label to store the rows under
        #[arg(long)]
        timeframe: Option<String>,
    },

    /// Collect candles and trade in a single loop
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds between cycles
        #[arg(long, default_value = "60")]
        interval: u64,

        /// Skip the startup countdown
        #[arg(long)]
        yes: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // Log file naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // For the optimizer: log only to file, keep the console clean for
        // the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Collect { .. } => ("collect", false),
        Commands::Trade { .. } => ("trade", false),
        Commands::Optimize { .. } => ("optimize", true), // File-only for clean progress bar
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Import { .. } => ("import", false),
        Commands::Run { .. } => ("run", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    dotenv::dotenv().ok();

    match cli.command {
        Commands::Collect {
            config,
            interval,
            once,
        } => commands::collect::run(config, interval, once),

        Commands::Trade {
            config,
            interval,
            yes,
        } => commands::trade::run(config, interval, yes),

        Commands::Optimize {
            config,
            threads,
            months,
        } => commands::optimize::run(config, threads, months),

        Commands::Backtest {
            config,
            months,
            threshold,
        } => commands::backtest::run(config, months, threshold),

        Commands::Import {
            file,
            config,
            timeframe,
        } => commands::import::run(file, config, timeframe),

        Commands::Run {
            config,
            interval,
            yes,
        } => commands::run::run(config, interval, yes),
    }
}
