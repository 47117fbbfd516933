pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "leadline",
    about = "Leadline operator CLI",
    long_about = "Operate leadline migrations, readiness checks, and one-shot query-agent runs.",
    after_help = "Examples:\n  leadline migrate\n  leadline doctor --json\n  leadline ask \"上周新增了多少家长？\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Validate config and database connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run the query agent once against the configured database")]
    Ask {
        #[arg(help = "Natural-language question, e.g. 上周新增了多少家长？")]
        question: String,
        #[arg(long, help = "Print the full action/observation trace")]
        trace: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Ask { question, trace } => commands::ask::run(&question, trace),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
