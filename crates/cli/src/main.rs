//! sandbox - run test binaries in an ephemeral cluster environment
//!
//! The same binary plays the three parts: `run` on the developer machine,
//! `serve` and `clean-after-delay` inside the environment.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod signal;

/// sandbox - run test binaries in an ephemeral cluster environment
#[derive(Parser, Debug)]
#[command(name = "sandbox")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the tests, run them in a new environment and delete it
    Run(commands::run::RunArgs),

    /// Run the server that executes test binaries
    Serve(commands::serve::ServeArgs),

    /// Delete the environment after a delay, unless stopped first
    CleanAfterDelay(commands::clean::CleanArgs),
}

const CRATES: [&str; 5] = [
    "sandbox",
    "sandbox_core",
    "sandbox_cluster",
    "sandbox_server",
    "sandbox_runner",
];

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let default_filter = CRATES
        .iter()
        .map(|name| format!("{}={}", name, level))
        .chain(std::iter::once(format!("tower_http={}", level)))
        .collect::<Vec<_>>()
        .join(",");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Logs go to stderr, stdout carries the output of the tests
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::CleanAfterDelay(args) => commands::clean::run(args).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
