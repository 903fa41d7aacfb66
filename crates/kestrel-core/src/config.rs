//! kestrel.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::types::ComponentRef;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub components: HashMap<String, ComponentConfig>,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Path or name of the kubectl binary.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    pub context: Option<String>,
    pub kubeconfig: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            context: None,
            kubeconfig: None,
        }
    }
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub deployment: Option<String>,
    pub container: Option<String>,
    pub service: Option<String>,
    pub port: Option<u16>,
    /// Image the simulated cluster starts with.
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// First local port tried when none is requested.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Number of candidate ports scanned from `base_port`.
    #[serde(default = "default_port_range")]
    pub port_range: u16,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_range: default_port_range(),
        }
    }
}

fn default_base_port() -> u16 {
    8000
}

fn default_port_range() -> u16 {
    100
}

/// A component with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedComponent {
    pub name: String,
    pub deployment: String,
    pub container: String,
    pub service: String,
    pub port: u16,
}

impl KestrelConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: KestrelConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.sessions.port_range == 0 {
            return Err(ConfigError::Invalid(
                "sessions.port_range must be at least 1".to_string(),
            ));
        }
        if self.sessions.base_port == 0 {
            return Err(ConfigError::Invalid(
                "sessions.base_port must not be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Namespace for an environment: explicit, then `<project>-<env>`, then `<env>`.
    pub fn namespace_for(&self, env: &str) -> String {
        if let Some(ns) = self
            .environments
            .get(env)
            .and_then(|e| e.namespace.as_ref())
        {
            return ns.clone();
        }
        match &self.project.name {
            Some(project) => format!("{project}-{env}"),
            None => env.to_string(),
        }
    }

    /// Component settings with defaults applied.
    pub fn component(&self, name: &str) -> ResolvedComponent {
        let cfg = self.components.get(name).cloned().unwrap_or_default();
        let deployment = cfg.deployment.unwrap_or_else(|| name.to_string());
        ResolvedComponent {
            name: name.to_string(),
            container: cfg.container.unwrap_or_else(|| deployment.clone()),
            service: cfg.service.unwrap_or_else(|| name.to_string()),
            port: cfg.port.unwrap_or(80),
            deployment,
        }
    }

    /// Address of a component in an environment.
    pub fn component_ref(&self, env: &str, name: &str) -> ComponentRef {
        let resolved = self.component(name);
        ComponentRef::new(&self.namespace_for(env), &resolved.deployment)
            .with_container(&resolved.container)
    }
}
