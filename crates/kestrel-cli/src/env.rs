//! One resolved environment: configuration, namespace, and cluster client.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tracing::{info, warn};

use kestrel_cluster::{KubectlClient, SimCluster};
use kestrel_core::cancel::{self, CancelSignal};
use kestrel_core::{ClientError, ClusterClient, ComponentRef, KestrelConfig};
use kestrel_session::SessionManager;

/// A missing prerequisite: no cluster connectivity or an absent namespace.
/// Exits with code 2.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Prerequisite(pub String);

pub struct Environment {
    pub name: String,
    pub namespace: String,
    pub config: KestrelConfig,
    pub client: Arc<dyn ClusterClient>,
}

impl Environment {
    /// Load `kestrel.toml` (defaults if absent) and pick a client.
    pub fn load(config_path: &Path, env: &str, simulate: bool) -> anyhow::Result<Self> {
        let config = KestrelConfig::load_or_default(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;

        let client: Arc<dyn ClusterClient> = if simulate {
            info!(env, "using simulated cluster");
            Arc::new(SimCluster::from_config(&config, env))
        } else {
            Arc::new(KubectlClient::new(&config.cluster))
        };
        Ok(Self::with_client(config, env, client))
    }

    pub fn with_client(config: KestrelConfig, env: &str, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            name: env.to_string(),
            namespace: config.namespace_for(env),
            config,
            client,
        }
    }

    pub fn component(&self, name: &str) -> ComponentRef {
        self.config.component_ref(&self.name, name)
    }

    /// Confirm the cluster is reachable and the namespace exists.
    pub async fn preflight(&self) -> anyhow::Result<()> {
        match self.client.check_namespace(&self.namespace).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => {
                Err(Prerequisite(format!("cannot reach cluster: {e}")).into())
            }
            Err(ClientError::NamespaceNotFound(ns)) => Err(Prerequisite(format!(
                "namespace {ns} for environment {} does not exist",
                self.name
            ))
            .into()),
            Err(e) => Err(anyhow::Error::new(e).context("namespace check failed")),
        }
    }

    pub fn session_manager(&self) -> SessionManager {
        SessionManager::from_config(self.client.clone(), &self.config.sessions)
    }
}

/// A cancellation signal fired by Ctrl-C.
pub fn cancel_on_interrupt() -> CancelSignal {
    let (tx, rx) = cancel::cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            let _ = tx.send(true);
        }
    });
    rx
}
