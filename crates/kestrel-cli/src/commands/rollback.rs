//! `kestrel rollback` — restore the previous revision, or list revisions.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;

use kestrel_core::{CancelSignal, Revision};
use kestrel_rollout::{RollbackManager, RollbackOutcome};

use crate::env::Environment;

#[derive(Debug, Args)]
pub struct RollbackArgs {
    /// Target environment.
    #[arg(long)]
    pub env: String,
    /// Component to roll back.
    #[arg(long)]
    pub component: String,
    /// Print the revision history and exit without changing anything.
    #[arg(long)]
    pub history: bool,
    /// Seconds to wait for the restored revision to become ready.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,
}

pub async fn execute(env: &Environment, args: &RollbackArgs, mut cancel: CancelSignal) -> Result<()> {
    env.preflight().await?;
    let target = env.component(&args.component);
    let manager = RollbackManager::new(env.client.clone());

    if args.history {
        let history = manager
            .history(&target)
            .await
            .with_context(|| format!("reading revision history of {target}"))?;
        print!("{}", format_history(&history));
        return Ok(());
    }

    match manager
        .rollback(&target, Duration::from_secs(args.timeout), &mut cancel)
        .await
    {
        RollbackOutcome::Succeeded { restored } => {
            println!(
                "{} rolled back to revision {} ({})",
                args.component, restored.revision, restored.image
            );
            Ok(())
        }
        RollbackOutcome::Failed(reason) => {
            bail!("rollback of {} failed: {reason}", args.component)
        }
        RollbackOutcome::Cancelled => bail!("rollback of {} cancelled", args.component),
    }
}

/// One line per revision, newest last; the live revision is marked.
pub fn format_history(history: &[Revision]) -> String {
    if history.is_empty() {
        return "no revisions recorded\n".to_string();
    }
    let mut out = format!("{:<4}{:<10}{:<22}{}\n", "", "REVISION", "CREATED", "IMAGE");
    for (i, rev) in history.iter().enumerate() {
        let marker = if i + 1 == history.len() { "*" } else { "" };
        out.push_str(&format!(
            "{:<4}{:<10}{:<22}{}\n",
            marker,
            rev.revision,
            rev.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
            rev.image
        ));
    }
    out
}
