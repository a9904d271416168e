//! `bay` — the Shipyard Neo control-plane daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use bay_config::BayConfig;
use bay_core::Store;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bay")]
#[command(about = "Secure sandbox orchestrator for AI agents")]
#[command(version)]
struct Cli {
    /// Path to the config file (falls back to $BAY_CONFIG, then ./bay.toml,
    /// then built-in defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control-plane server.
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Run one garbage-collection cycle and exit.
    Gc {
        /// Restrict to specific tasks (default: every enabled task).
        tasks: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print a documented default configuration.
    Template,
}

fn load_config(cli: &Cli) -> anyhow::Result<BayConfig> {
    match &cli.config {
        Some(path) => BayConfig::load(path).context("loading config"),
        None => BayConfig::discover_and_load().context("loading config"),
    }
}

async fn build_state(config: BayConfig) -> anyhow::Result<bay_gateway::AppState> {
    let config = Arc::new(config);
    let store = Arc::new(
        Store::connect(&config.database.url)
            .await
            .context("connecting to the database")?,
    );
    let driver = bay_driver::create_driver(&config)
        .await
        .context("constructing the container driver")?;
    driver
        .ping()
        .await
        .context("the container substrate is not reachable")?;
    Ok(bay_gateway::state::build_state(config, store, driver))
}

async fn serve(config: BayConfig) -> anyhow::Result<()> {
    for warning in config.validation_warnings() {
        warn!("{warning}");
    }

    let state = build_state(config).await?;
    let shutdown = CancellationToken::new();

    if state.config.gc.enabled {
        let gc = Arc::clone(&state.gc);
        let token = shutdown.clone();
        tokio::spawn(gc.run_loop(token));
    } else {
        info!("gc disabled by config");
    }

    // SIGINT / SIGTERM drain the server and stop the GC loop.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut term) => {
                        tokio::select! {
                            _ = ctrl_c => {}
                            _ = term.recv() => {}
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "no SIGTERM handler; relying on ctrl-c");
                        let _ = ctrl_c.await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("shutdown requested");
            shutdown.cancel();
        });
    }

    bay_gateway::start(state, shutdown).await
}

async fn gc_once(config: BayConfig, tasks: Vec<String>) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let only = (!tasks.is_empty()).then_some(tasks);
    let reports = state
        .gc
        .run_once(only.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Config {
            command: ConfigCommand::Template,
        } => {
            print!(
                "{}",
                bay_config::template::default_config_template(config.server.port)
            );
            Ok(())
        }
        Command::Gc { tasks } => gc_once(config, tasks).await,
    }
}
