//! `kestrel watch` — follow logs of several components at once.
//!
//! Every component gets its own log session; lines are prefixed with the
//! component name. A component whose stream cannot be opened is reported
//! and skipped. Ctrl-C closes every session.

use anyhow::{Result, bail};
use clap::Args;
use tracing::warn;

use kestrel_core::{LogOptions, LogSource};

use crate::env::Environment;

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Target environment.
    #[arg(long)]
    pub env: String,
    /// Components to follow. Defaults to every configured component.
    #[arg(long = "component")]
    pub components: Vec<String>,
    /// Number of recent lines to start each stream with.
    #[arg(long, default_value_t = 10)]
    pub tail: u32,
}

impl WatchArgs {
    /// Components to follow, sorted and deduplicated.
    pub fn selected(&self, env: &Environment) -> Vec<String> {
        let mut names: Vec<String> = if self.components.is_empty() {
            env.config.components.keys().cloned().collect()
        } else {
            self.components.clone()
        };
        names.sort();
        names.dedup();
        names
    }
}

pub async fn execute(env: &Environment, args: &WatchArgs) -> Result<()> {
    env.preflight().await?;
    let names = args.selected(env);
    if names.is_empty() {
        bail!("no components to watch; pass --component or configure [components]");
    }

    let sessions = env.session_manager();
    sessions.install_interrupt_handler();
    let options = LogOptions {
        follow: true,
        tail: args.tail,
        previous: false,
    };

    let mut handles = Vec::with_capacity(names.len());
    for name in &names {
        let source = LogSource::Component(env.component(name));
        match sessions
            .open_log_stream(source, options.clone(), Some(name.clone()))
            .await
        {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!(component = %name, error = %e, "cannot follow logs"),
        }
    }
    if handles.is_empty() {
        bail!("no log stream could be opened");
    }

    for mut handle in handles {
        handle.closed().await;
    }
    Ok(())
}
