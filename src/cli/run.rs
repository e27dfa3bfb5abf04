//! Command handlers

use super::{ConsolidateArgs, RunArgs};
use crate::config::Config;
use crate::consolidate;
use crate::session::{self, control, CandidateProfile, InterviewMode, SessionDeps};
use anyhow::Result;
use std::path::PathBuf;

fn control_socket(config: &Config) -> PathBuf {
    config.data_root.join("run").join("control.sock")
}

/// `vetta run` — drive a full session and print the outcome summary.
pub async fn run(args: RunArgs) -> Result<()> {
    let config = Config::load().await?;
    let mode: InterviewMode = args.mode.parse()?;
    let deps = SessionDeps::from_config(&config)?;
    let candidate = CandidateProfile {
        id: args.candidate.clone(),
        display_name: args.candidate.clone(),
    };

    let outcome = session::run_session(
        config.clone(),
        candidate,
        mode,
        args.duration,
        args.question,
        deps,
    )
    .await?;

    println!("Session {} {}", outcome.session_id, outcome.status);
    println!(
        "  overall {:.1} ({}), code {:.1}, communication {:.1}",
        outcome.scores.overall, outcome.recommendation, outcome.code_score,
        outcome.communication_score
    );
    println!(
        "  turns {}, lies {}, nudges {}",
        outcome.turns.len(),
        outcome.lies.len(),
        outcome.nudges.len()
    );
    println!(
        "  outcome: {}",
        config
            .session_dir(&outcome.session_id)
            .join("outcome.json")
            .display()
    );

    if outcome.status == "failed" {
        anyhow::bail!(
            "session failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// `vetta status` — query the running session over the control socket.
pub async fn status() -> Result<()> {
    let config = Config::load().await?;
    let reply = control::request(&control_socket(&config), "status").await?;
    println!("{reply}");
    Ok(())
}

/// `vetta stop` — stop the running session and print its outcome.
pub async fn stop() -> Result<()> {
    let config = Config::load().await?;
    let reply = control::request(&control_socket(&config), "stop").await?;
    println!("{reply}");
    Ok(())
}

/// `vetta consolidate` — rebuild an outcome from a session directory.
pub async fn consolidate(args: ConsolidateArgs) -> Result<()> {
    let config = Config::load().await?;
    let session_dir = config.session_dir(&args.session);
    let outcome = consolidate::consolidate_from_dir(&session_dir).await?;
    let path = consolidate::write_outcome(&session_dir, &outcome).await?;
    println!(
        "Consolidated {}: {:.1} ({}) -> {}",
        outcome.session_id,
        outcome.scores.overall,
        outcome.recommendation,
        path.display()
    );
    Ok(())
}
