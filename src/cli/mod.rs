//! CLI command definitions and handlers

pub mod run;

use clap::{Parser, Subcommand};

/// Vetta - automated technical interview orchestrator
///
/// Drives a live voice interview session with real-time code monitoring
/// and claim verification against the candidate's ingested background.
#[derive(Parser, Debug)]
#[command(name = "vetta")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level
    #[arg(long, global = true, value_parser = ["DEBUG", "INFO", "WARN", "ERROR"])]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an interview session and run it to completion
    Run(RunArgs),

    /// Show the status of the running session
    Status,

    /// Stop the running session and print its outcome
    Stop,

    /// Rebuild an outcome document from a recorded session directory
    Consolidate(ConsolidateArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Candidate identifier (names the ingestion artifacts under DATA_ROOT)
    #[arg(long)]
    pub candidate: String,

    /// Interview mode
    #[arg(long, default_value = "challenging", value_parser = ["friendly", "challenging"])]
    pub mode: String,

    /// Session duration in seconds (defaults to INTERVIEW_MAX_DURATION)
    #[arg(long)]
    pub duration: Option<u64>,

    /// Question to load in the remote editor
    #[arg(long, default_value = "1")]
    pub question: String,
}

#[derive(Parser, Debug)]
pub struct ConsolidateArgs {
    /// Session id to consolidate
    #[arg(long)]
    pub session: String,
}

/// Exit code mapping: 0 success, 1 user error, 2 internal error.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    let message = format!("{error:#}");
    if message.contains("AlreadyRunning")
        || message.contains("InvalidInput")
        || message.contains("No session listening")
        || message.contains("Missing session.json")
        || message.contains("unknown mode")
    {
        1
    } else {
        2
    }
}

/// Dispatch a parsed command.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => run::run(args).await,
        Command::Status => run::status().await,
        Command::Stop => run::stop().await,
        Command::Consolidate(args) => run::consolidate(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_args_parse() {
        let cli = Cli::parse_from([
            "vetta", "run", "--candidate", "c-42", "--mode", "friendly", "--duration", "600",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.candidate, "c-42");
                assert_eq!(args.mode, "friendly");
                assert_eq!(args.duration, Some(600));
                assert_eq!(args.question, "1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn user_errors_map_to_exit_one() {
        assert_eq!(
            exit_code_for(&anyhow::anyhow!("AlreadyRunning: busy")),
            1
        );
        assert_eq!(exit_code_for(&anyhow::anyhow!("socket exploded")), 2);
    }
}
