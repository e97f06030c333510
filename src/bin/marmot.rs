// src/bin/marmot.rs

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use marmot::cli::{Cli, Commands};
use marmot::commands;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file, function } => commands::run::run_file(&file, &function, cli.release),
        Commands::Check { file } => commands::check::check_file(&file, cli.release),
        Commands::Test { file } => commands::test::test_file(&file, cli.release),
    }
}
