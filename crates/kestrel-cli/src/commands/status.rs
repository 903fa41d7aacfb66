//! `kestrel status` — show a component's observed state. Read-only.

use anyhow::{Context, Result};
use clap::Args;

use kestrel_core::WorkloadStatus;
use kestrel_health::{Readiness, assess};

use crate::env::Environment;

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Target environment.
    #[arg(long)]
    pub env: String,
    /// Component to inspect.
    #[arg(long)]
    pub component: String,
    /// Print the raw status as JSON.
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(env: &Environment, args: &StatusArgs) -> Result<()> {
    env.preflight().await?;
    let target = env.component(&args.component);
    let status = env
        .client
        .get_status(&target)
        .await
        .with_context(|| format!("reading status of {target}"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", format_status(&args.component, &status));
    }
    Ok(())
}

pub fn format_status(component: &str, status: &WorkloadStatus) -> String {
    let verdict = match assess(status) {
        Readiness::Ready => "ready".to_string(),
        Readiness::Progressing { reason } => format!("progressing ({reason})"),
        Readiness::Stalled { reason } => format!("stalled ({reason})"),
    };
    let mut out = format!("{component}: {verdict}\n");
    out.push_str(&format!(
        "  image:      {}\n",
        status.image.as_deref().unwrap_or("unknown")
    ));
    out.push_str(&format!(
        "  replicas:   {} desired, {} updated, {} available\n",
        status.desired_replicas, status.updated_replicas, status.available_replicas
    ));
    out.push_str(&format!(
        "  generation: {} (observed {})\n",
        status.generation, status.observed_generation
    ));
    for c in &status.conditions {
        out.push_str(&format!("  {:<12}{:?}", c.kind, c.status));
        if let Some(reason) = &c.reason {
            out.push_str(&format!(" {reason}"));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{Condition, ConditionStatus};

    #[test]
    fn reports_progress_reason() {
        let status = WorkloadStatus {
            desired_replicas: 3,
            available_replicas: 2,
            updated_replicas: 1,
            generation: 4,
            observed_generation: 4,
            image: Some("repo/api:v2".to_string()),
            conditions: vec![
                Condition::new("Available", ConditionStatus::False)
                    .with_reason("MinimumReplicasUnavailable"),
            ],
        };
        let text = format_status("api", &status);
        assert!(text.starts_with("api: progressing (1 of 3 replicas updated)"));
        assert!(text.contains("repo/api:v2"));
        assert!(text.contains("Available   False MinimumReplicasUnavailable"));
    }
}
