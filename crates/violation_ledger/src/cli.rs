use clap::{ArgAction, Parser, Subcommand};

use crate::check::{CheckArgs, run_check};
use crate::error::Result;
use crate::logging::init_logging;
use crate::reporter::{ReportArgs, run_report};
use crate::store::SCHEMA;

#[derive(Debug, Parser)]
#[command(
    name = "violation_ledger",
    about = "Attribute sandbox syscall violations to tests and report on the collected ledger",
    version
)]
pub struct Cli {
    /// Raise log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Summarize violations recorded in an existing store.
    Report(ReportArgs),

    /// Validate collector options and show the resulting sandbox policy.
    Check(CheckArgs),

    /// Print the store schema.
    Schema,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli)
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Report(args) => run_report(args),
        Commands::Check(args) => run_check(args),
        Commands::Schema => {
            println!("{}", SCHEMA.trim());
            Ok(())
        }
    }
}
