//! `kestrel port-forward` — forward a local port to a service or pod.

use anyhow::{Result, bail};
use clap::Args;

use kestrel_core::{ForwardTarget, TargetKind};

use crate::env::Environment;

#[derive(Debug, Args)]
#[command(group = clap::ArgGroup::new("target").required(true).args(["service", "component", "pod"]))]
pub struct PortForwardArgs {
    /// Target environment.
    #[arg(long)]
    pub env: String,
    /// Service to forward to.
    #[arg(long)]
    pub service: Option<String>,
    /// Forward to the service of a configured component.
    #[arg(long)]
    pub component: Option<String>,
    /// Forward to one pod; requires --pod-port.
    #[arg(long, requires = "pod_port")]
    pub pod: Option<String>,
    /// Remote port. Defaults to the configured component port.
    #[arg(long)]
    pub pod_port: Option<u16>,
    /// Local port. Without it the first free port of the configured range
    /// is used.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub local_port: Option<u16>,
}

impl PortForwardArgs {
    pub fn target(&self, env: &Environment) -> Result<ForwardTarget> {
        let namespace = env.namespace.clone();
        let target = match (&self.service, &self.component, &self.pod) {
            (Some(service), None, None) => {
                // Use the port of a component exposing this service, if any.
                let configured = env
                    .config
                    .components
                    .keys()
                    .map(|name| env.config.component(name))
                    .find(|c| &c.service == service)
                    .map(|c| c.port);
                ForwardTarget {
                    namespace,
                    kind: TargetKind::Service,
                    name: service.clone(),
                    remote_port: self.pod_port.or(configured).unwrap_or(80),
                }
            }
            (None, Some(component), None) => {
                let resolved = env.config.component(component);
                ForwardTarget {
                    namespace,
                    kind: TargetKind::Service,
                    name: resolved.service,
                    remote_port: self.pod_port.unwrap_or(resolved.port),
                }
            }
            (None, None, Some(pod)) => {
                let Some(port) = self.pod_port else {
                    bail!("--pod requires --pod-port");
                };
                ForwardTarget {
                    namespace,
                    kind: TargetKind::Pod,
                    name: pod.clone(),
                    remote_port: port,
                }
            }
            _ => bail!("exactly one of --service, --component, or --pod is required"),
        };
        Ok(target)
    }
}

pub async fn execute(env: &Environment, args: &PortForwardArgs) -> Result<()> {
    env.preflight().await?;
    let target = args.target(env)?;

    let sessions = env.session_manager();
    sessions.install_interrupt_handler();
    let mut handle = sessions
        .open_port_forward(target.clone(), args.local_port)
        .await?;
    if let Some(port) = handle.local_port {
        println!("Forwarding 127.0.0.1:{port} -> {target}");
    }
    handle.closed().await;
    Ok(())
}
