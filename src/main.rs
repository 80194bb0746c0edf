use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use engine::{
    commands::{
        compute_scores, export_market_data, generate_signals, import_market_data, run_all,
        show_signal, RunOptions,
    },
    context::AppContext,
    models::Timeframe,
};
use log::info;
use std::env;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "engine")]
#[command(about = "Breakout signal state machine and composite factor scoring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// First date to produce results for (YYYY-MM-DD). Scores default to the latest date only.
    #[arg(long, value_name = "DATE")]
    from: Option<NaiveDate>,
    /// Last date of history to use (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    to: Option<NaiveDate>,
    /// Run against a market data snapshot instead of the database
    #[arg(long = "data-file", value_name = "PATH")]
    data_file: Option<PathBuf>,
    /// Write the run summary (and snapshot results) as JSON
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Override the MAX_WORKERS setting
    #[arg(long = "max-workers", value_name = "N")]
    max_workers: Option<usize>,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            from: args.from,
            to: args.to,
            data_file: args.data_file,
            output: args.output,
            max_workers: args.max_workers,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Replay bar history through the signal state machine and store the latest state per symbol
    GenerateSignals {
        /// Comma separated timeframes (daily, weekly, monthly)
        #[arg(long = "timeframe", value_delimiter = ',', default_values_t = Timeframe::ALL.to_vec())]
        timeframes: Vec<Timeframe>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Normalize raw factors cross-sectionally and store composite scores
    ComputeScores {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Generate signals for every timeframe, then compute composite scores
    RunAll {
        /// Comma separated timeframes (daily, weekly, monthly)
        #[arg(long = "timeframe", value_delimiter = ',', default_values_t = Timeframe::ALL.to_vec())]
        timeframes: Vec<Timeframe>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Export bars, raw factors and engine settings to a snapshot file for offline runs
    ExportMarketData {
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Load bars and raw factors from a snapshot file into the database
    ImportMarketData {
        /// Snapshot file to import
        #[arg(short, long = "input", value_name = "PATH")]
        input: Option<PathBuf>,
    },
    /// Print the stored signal state, transitions and composite score of a symbol
    ShowSignal {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value_t = Timeframe::Daily)]
        timeframe: Timeframe,
        /// Score date (YYYY-MM-DD). Defaults to the state's as-of date.
        #[arg(long, value_name = "DATE")]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline runs, pass --data-file with a market data snapshot."
        ));
    }
    let app_context = AppContext::initialize(database_url).await?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting engine");

    match command {
        Commands::GenerateSignals { timeframes, run } => {
            let timeframes = dedup_timeframes(timeframes)?;
            generate_signals::run(&app_context, &timeframes, &run.into()).await?;
        }
        Commands::ComputeScores { run } => {
            compute_scores::run(&app_context, &run.into()).await?;
        }
        Commands::RunAll { timeframes, run } => {
            let timeframes = dedup_timeframes(timeframes)?;
            run_all::run(&app_context, &timeframes, &run.into()).await?;
        }
        Commands::ExportMarketData { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            export_market_data::run(&app_context, &output_path).await?;
        }
        Commands::ImportMarketData { input } => {
            let input_path = input.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            import_market_data::run(&app_context, &input_path).await?;
        }
        Commands::ShowSignal {
            symbol,
            timeframe,
            date,
        } => {
            show_signal::run(&app_context, &symbol, timeframe, date).await?;
        }
    }

    Ok(())
}

fn dedup_timeframes(mut timeframes: Vec<Timeframe>) -> Result<Vec<Timeframe>> {
    timeframes.sort();
    timeframes.dedup();
    if timeframes.is_empty() {
        return Err(anyhow!("At least one --timeframe is required"));
    }
    Ok(timeframes)
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::GenerateSignals { run, .. }
        | Commands::ComputeScores { run }
        | Commands::RunAll { run, .. } => run.data_file.is_none(),
        Commands::ExportMarketData { .. }
        | Commands::ImportMarketData { .. }
        | Commands::ShowSignal { .. } => true,
    }
}
