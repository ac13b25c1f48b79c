pub mod commands;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "mesa",
    about = "Mesa operator CLI",
    long_about = "Operate the reservation store: migrations, demo data, TTL purges, config inspection, and readiness checks.",
    after_help = "Examples:\n  mesa doctor --json\n  mesa seed --start 2025-06-03 --days 3\n  mesa purge"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load deterministic demo reservations and verify them")]
    Seed {
        #[arg(long, help = "First day to seed (YYYY-MM-DD, defaults to today)")]
        start: Option<NaiveDate>,
        #[arg(long, default_value_t = commands::seed::DEFAULT_SEED_DAYS, help = "Number of days to seed")]
        days: u32,
    },
    #[command(about = "Reclaim cancelled and completed reservations past their retention")]
    Purge,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config and store connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed { start, days } => commands::seed::run(start, days),
        Command::Purge => commands::purge::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
