//! kestrel — image rollouts with automatic rollback, plus log tails and
//! port forwards, for one environment at a time.
//!
//! # Exit codes
//!
//! - `0` success
//! - `1` failure, including an update that was rolled back or cancelled
//! - `2` missing prerequisite: cluster unreachable or namespace absent

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod env;

use env::{Environment, Prerequisite, cancel_on_interrupt};

#[derive(Parser)]
#[command(
    name = "kestrel",
    about = "kestrel — deployment rollouts and ephemeral sessions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the project configuration.
    #[arg(long, global = true, default_value = "kestrel.toml")]
    config: PathBuf,
    /// Run against an in-memory cluster seeded from the configuration.
    #[arg(long, global = true)]
    simulate: bool,
    /// Format of diagnostic logs on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Roll a component to a new image; roll back if it never becomes ready.
    Update(commands::update::UpdateArgs),
    /// Restore a component's previous revision, or list its revisions.
    Rollback(commands::rollback::RollbackArgs),
    /// Stream logs of a component or pod.
    Logs(commands::logs::LogsArgs),
    /// Forward a local port to a service, component, or pod.
    PortForward(commands::forward::PortForwardArgs),
    /// Show the observed state of a component.
    Status(commands::status::StatusArgs),
    /// Follow logs of several components at once.
    Watch(commands::watch::WatchArgs),
}

impl Commands {
    fn env(&self) -> &str {
        match self {
            Commands::Update(a) => &a.env,
            Commands::Rollback(a) => &a.env,
            Commands::Logs(a) => &a.env,
            Commands::PortForward(a) => &a.env,
            Commands::Status(a) => &a.env,
            Commands::Watch(a) => &a.env,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kestrel=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let env = Environment::load(&cli.config, cli.command.env(), cli.simulate)?;

    match &cli.command {
        Commands::Update(args) => {
            commands::update::execute(&env, args, cancel_on_interrupt()).await
        }
        Commands::Rollback(args) => {
            commands::rollback::execute(&env, args, cancel_on_interrupt()).await
        }
        Commands::Logs(args) => commands::logs::execute(&env, args).await,
        Commands::PortForward(args) => commands::forward::execute(&env, args).await,
        Commands::Status(args) => commands::status::execute(&env, args).await,
        Commands::Watch(args) => commands::watch::execute(&env, args).await,
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<Prerequisite>().is_some() {
        2
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
