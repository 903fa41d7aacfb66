//! `kestrel update` — roll a component to a new image.
//!
//! Exits 0 only when the new image is ready. A rollback that restored the
//! previous revision is still a failed update.

use anyhow::{Result, bail};
use clap::Args;
use tracing::info;

use kestrel_core::{CancelSignal, RolloutRequest};
use kestrel_rollout::{Outcome, RolloutCoordinator};

use crate::env::Environment;

#[derive(Debug, Args)]
pub struct UpdateArgs {
    /// Target environment.
    #[arg(long)]
    pub env: String,
    /// Component to update.
    #[arg(long)]
    pub component: String,
    /// New container image.
    #[arg(long)]
    pub image: String,
    /// Seconds to wait for the new image to become ready.
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,
    /// Extra pods allowed above the desired count during the update.
    #[arg(long, default_value_t = 1)]
    pub max_surge: u32,
    /// Pods allowed to be unavailable during the update.
    #[arg(long, default_value_t = 0)]
    pub max_unavailable: u32,
}

impl UpdateArgs {
    pub fn request(&self, env: &Environment) -> RolloutRequest {
        RolloutRequest {
            max_surge: self.max_surge,
            max_unavailable: self.max_unavailable,
            ..RolloutRequest::new(&env.name, env.component(&self.component), &self.image)
                .with_timeout_secs(self.timeout)
        }
    }
}

/// Run the update and return its outcome.
pub async fn run(env: &Environment, args: &UpdateArgs, cancel: CancelSignal) -> Result<Outcome> {
    env.preflight().await?;
    let req = args.request(env);
    info!(
        component = %req.component,
        image = %req.target_image,
        timeout_secs = req.timeout_secs,
        "starting update"
    );
    Ok(RolloutCoordinator::new(env.client.clone())
        .update(&req, cancel)
        .await)
}

pub async fn execute(env: &Environment, args: &UpdateArgs, cancel: CancelSignal) -> Result<()> {
    match run(env, args, cancel).await? {
        Outcome::Ready => {
            println!("{} is ready on {}", args.component, args.image);
            Ok(())
        }
        Outcome::RolledBack { reason } => {
            bail!("update of {} rolled back: {reason}", args.component)
        }
        Outcome::Failed(reason) => bail!("update of {} failed: {reason}", args.component),
        Outcome::Cancelled => bail!(
            "update of {} cancelled; the image patch may already be applied",
            args.component
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kestrel_cluster::{ImageBehavior, SimCluster};
    use kestrel_core::{KestrelConfig, cancel};

    use crate::env::Prerequisite;

    fn setup() -> (Environment, SimCluster) {
        let config: KestrelConfig = toml::from_str(
            r#"
[project]
name = "shop"

[components.api]
container = "server"
image = "repo/api:v1"
"#,
        )
        .unwrap();
        let sim = SimCluster::from_config(&config, "dev");
        let env = Environment::with_client(config, "dev", Arc::new(sim.clone()));
        (env, sim)
    }

    fn args(image: &str, timeout: u64) -> UpdateArgs {
        UpdateArgs {
            env: "dev".to_string(),
            component: "api".to_string(),
            image: image.to_string(),
            timeout,
            max_surge: 2,
            max_unavailable: 1,
        }
    }

    #[test]
    fn request_carries_budget_and_container() {
        let (env, _) = setup();
        let req = args("repo/api:v2", 60).request(&env);
        assert_eq!(req.timeout_secs, 60);
        assert_eq!(req.max_surge, 2);
        assert_eq!(req.max_unavailable, 1);
        assert_eq!(req.namespace(), "shop-dev");
        assert_eq!(req.image_patch().container, "server");
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_update_is_ready_after_ten_seconds() {
        let (env, sim) = setup();
        let outcome = run(&env, &args("repo/api:v2", 60), cancel::never())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ready);
        assert_eq!(sim.undo_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_image_exits_with_error() {
        let (env, sim) = setup();
        sim.set_behavior("repo/api:bad", ImageBehavior::Never);

        let err = execute(&env, &args("repo/api:bad", 30), cancel::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rolled back"));
        assert!(err.downcast_ref::<Prerequisite>().is_none());
        assert_eq!(sim.undo_calls(), 1);
        assert_eq!(sim.current_image(&env.component("api")).as_deref(), Some("repo/api:v1"));
    }

    #[tokio::test]
    async fn unreachable_cluster_exits_with_prerequisite() {
        let (env, sim) = setup();
        sim.set_unreachable(true);
        let err = execute(&env, &args("repo/api:v2", 60), cancel::never())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Prerequisite>().is_some());
        assert_eq!(sim.patch_calls(), 0);
    }
}
