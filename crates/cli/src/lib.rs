pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "exportdesk",
    about = "Exportdesk operator CLI",
    long_about = "Operate the deal orchestration runtime: preflight, migrations, config inspection, \
                  journey inspection, stale task reaping and safety checks.",
    after_help = "Examples:\n  exportdesk doctor --json\n  exportdesk journey J-1234\n  exportdesk safety-check \"pay via western union\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run startup preflight checks and return structured status output")]
    Start,
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, workflow catalog, safety rules and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List built-in workflow definitions and their steps")]
    Workflows,
    #[command(about = "Run the negotiation safety filter over a message")]
    SafetyCheck {
        text: String,
        #[arg(long, help = "Exit with an error code when the verdict is block")]
        fail_on_block: bool,
    },
    #[command(about = "Show a deal journey with its history and verify the history replays")]
    Journey { journey_id: String },
    #[command(about = "Fail claims older than the configured claim timeout")]
    Reap,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start => commands::start::run(),
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Workflows => commands::workflows::run(),
        Command::SafetyCheck { text, fail_on_block } => {
            commands::safety::run(&text, fail_on_block)
        }
        Command::Journey { journey_id } => commands::journey::run(&journey_id),
        Command::Reap => commands::reap::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
