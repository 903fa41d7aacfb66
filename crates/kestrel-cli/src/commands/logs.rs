//! `kestrel logs` — stream logs of a component or a pod.

use anyhow::{Result, bail};
use clap::Args;

use kestrel_core::{LogOptions, LogSource};

use crate::env::Environment;

#[derive(Debug, Args)]
#[command(group = clap::ArgGroup::new("source").required(true).args(["component", "pod"]))]
pub struct LogsArgs {
    /// Target environment.
    #[arg(long)]
    pub env: String,
    /// Component whose workload logs to stream.
    #[arg(long)]
    pub component: Option<String>,
    /// A single pod to stream.
    #[arg(long)]
    pub pod: Option<String>,
    /// Keep streaming new lines until interrupted.
    #[arg(short, long)]
    pub follow: bool,
    /// Number of recent lines to start with.
    #[arg(long, default_value_t = 100)]
    pub tail: u32,
    /// Logs of the previous container instance.
    #[arg(long)]
    pub previous: bool,
}

impl LogsArgs {
    pub fn source(&self, env: &Environment) -> Result<LogSource> {
        match (&self.component, &self.pod) {
            (Some(component), None) => Ok(LogSource::Component(env.component(component))),
            (None, Some(pod)) => Ok(LogSource::Pod {
                namespace: env.namespace.clone(),
                name: pod.clone(),
            }),
            _ => bail!("exactly one of --component or --pod is required"),
        }
    }

    pub fn options(&self) -> LogOptions {
        LogOptions {
            follow: self.follow,
            tail: self.tail,
            previous: self.previous,
        }
    }
}

pub async fn execute(env: &Environment, args: &LogsArgs) -> Result<()> {
    env.preflight().await?;
    let source = args.source(env)?;

    let sessions = env.session_manager();
    sessions.install_interrupt_handler();
    let mut handle = sessions
        .open_log_stream(source, args.options(), None)
        .await?;
    handle.closed().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kestrel_cluster::SimCluster;
    use kestrel_core::KestrelConfig;

    fn env() -> Environment {
        let config: KestrelConfig = toml::from_str(
            r#"
[environments.dev]
namespace = "team-a"

[components.api]
deployment = "api-server"
"#,
        )
        .unwrap();
        Environment::with_client(config, "dev", Arc::new(SimCluster::new()))
    }

    fn args(component: Option<&str>, pod: Option<&str>) -> LogsArgs {
        LogsArgs {
            env: "dev".to_string(),
            component: component.map(str::to_string),
            pod: pod.map(str::to_string),
            follow: true,
            tail: 20,
            previous: false,
        }
    }

    #[test]
    fn component_source_uses_deployment_name() {
        let source = args(Some("api"), None).source(&env()).unwrap();
        match source {
            LogSource::Component(c) => {
                assert_eq!(c.namespace, "team-a");
                assert_eq!(c.name, "api-server");
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn pod_source_uses_environment_namespace() {
        let source = args(None, Some("api-7d9f-x2")).source(&env()).unwrap();
        assert_eq!(
            source,
            LogSource::Pod {
                namespace: "team-a".to_string(),
                name: "api-7d9f-x2".to_string()
            }
        );
    }

    #[test]
    fn options_follow_flags() {
        let opts = args(Some("api"), None).options();
        assert!(opts.follow);
        assert_eq!(opts.tail, 20);
    }

    #[test]
    fn both_sources_rejected() {
        assert!(args(Some("api"), Some("p")).source(&env()).is_err());
    }
}
