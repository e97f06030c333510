// src/cli/args.rs

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stack-typed VM module compiler and runtime
#[derive(Parser)]
#[command(name = "marmot")]
#[command(version)]
#[command(about = "Compile and run stack-typed VM text modules", long_about = None)]
pub struct Cli {
    /// Optimize generated code (disables IR verification)
    #[arg(long, global = true)]
    pub release: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a text module and invoke an exported function
    #[command(visible_alias = "r")]
    Run {
        /// Path to the module source
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Name of the exported function to invoke
        #[arg(value_name = "FUNCTION")]
        function: String,
    },
    /// Parse and compile a module without running it
    #[command(visible_alias = "c")]
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Run the assert_eq assertions in a file
    #[command(visible_alias = "t")]
    Test {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}
