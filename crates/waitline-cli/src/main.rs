//! Waitline CLI - entry point.

use std::process::ExitCode;

use clap::Parser;

use waitline_cli::{commands, Cli, Commands};
use waitline_core::observability::{init_logging_with_file, LogFormat};
use waitline_core::RootLayout;

/// Exit code for a failed pipeline step or validation.
const EXIT_STEP_FAILED: u8 = 1;
/// Exit code for lock contention.
const EXIT_LOCK_CONTENTION: u8 = 2;
/// Exit code for a fatal configuration error.
const EXIT_CONFIG_ERROR: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration errors abort before any state is written.
    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let layout = RootLayout::new(&config.output_base);
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_logging_with_file(format, &layout.logs(), command_name(&cli.command));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_STEP_FAILED);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Ingest(args) => commands::ingest::execute(args, &config, &layout).await,
            Commands::MergeStaging(args) => commands::merge::execute(args, &config, &layout),
            Commands::Index(args) => commands::index::execute(&args, &layout),
            Commands::TrainBatch(args) => commands::train::execute_batch(args, &config, &layout).await,
            Commands::TrainEntity(args) => commands::train::execute_entity(args, &config, &layout),
            Commands::BuildPostedAggregates(args) => {
                commands::aggregates::execute(&args, &layout)
            }
            Commands::Forecast(args) => commands::curves::execute_forecast(args, &layout),
            Commands::Backfill(args) => commands::curves::execute_backfill(args, &layout),
            Commands::Wti(args) => commands::wti::execute(args, &layout),
            Commands::PollLive(args) => commands::poll::execute(args, &config, &layout).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(classify_exit(&e))
        }
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Ingest(_) => "ingest",
        Commands::MergeStaging(_) => "merge_staging",
        Commands::Index(_) => "index",
        Commands::TrainBatch(_) => "train_batch",
        Commands::TrainEntity(_) => "train_entity",
        Commands::BuildPostedAggregates(_) => "build_posted_aggregates",
        Commands::Forecast(_) => "forecast",
        Commands::Backfill(_) => "backfill",
        Commands::Wti(_) => "wti",
        Commands::PollLive(_) => "poll_live",
    }
}

/// Maps an error chain to the documented exit codes.
fn classify_exit(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if let Some(core) = cause.downcast_ref::<waitline_core::Error>() {
            return match core {
                waitline_core::Error::LockContention { .. } => EXIT_LOCK_CONTENTION,
                waitline_core::Error::Config { .. } => EXIT_CONFIG_ERROR,
                _ => EXIT_STEP_FAILED,
            };
        }
    }
    EXIT_STEP_FAILED
}
