use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetmon_agent::config::AgentConfig;
use fleetmon_agent::context::AgentContext;
use fleetmon_agent::{maintenance, netwatch, power, reporting, tasks, updater};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::info;

/// Fleetmon - fleet monitoring agent for managed lab machines.
#[derive(Parser, Debug)]
#[command(name = "fleetmon-agent", version, about)]
struct Cli {
    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the fleet server to open a support ticket for this machine.
    Support,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetmon_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Some(Command::Support) => request_support(config).await,
        None => run_agent(config).await,
    }
}

/// One-shot support mode: report the machine and print the server's answer.
async fn request_support(config: AgentConfig) -> Result<()> {
    let ctx = AgentContext::new(config)?;
    let message = reporting::send_support_request(&ctx).await?;
    println!("{message}");
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let Some(_instance_lock) = tasks::acquire_instance_lock(config.agent.single_instance_port)
    else {
        info!("Another agent instance is already running, exiting");
        return Ok(());
    };

    power::keep_awake();
    maintenance::ensure_autostart().await;

    let ctx = AgentContext::new(config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %ctx.config.server.base_url,
        machine = %ctx.machine_id,
        "Starting Fleetmon agent"
    );

    let (shutdown, _) = broadcast::channel(8);

    let duties = vec![
        tasks::spawn_supervised("registration", &shutdown, {
            let ctx = ctx.clone();
            move || {
                let ctx = ctx.clone();
                async move { reporting::register(&ctx).await }
            }
        }),
        tasks::spawn_supervised("telemetry", &shutdown, {
            let ctx = ctx.clone();
            move || reporting::telemetry_loop(ctx.clone())
        }),
        tasks::spawn_supervised("network", &shutdown, {
            let ctx = ctx.clone();
            move || netwatch::probe_loop(ctx.clone())
        }),
        tasks::spawn_supervised("updater", &shutdown, {
            let ctx = ctx.clone();
            move || updater::update_loop(ctx.clone())
        }),
        tasks::spawn_supervised("curfew", &shutdown, {
            let ctx = ctx.clone();
            move || power::curfew_loop(ctx.clone())
        }),
        tasks::spawn_supervised("restore-point", &shutdown, {
            let ctx = ctx.clone();
            move || maintenance::restore_point_loop(ctx.clone())
        }),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;

    info!("Shutdown requested");
    let _ = shutdown.send(());
    futures::future::join_all(duties).await;

    info!("Fleetmon agent stopped");
    Ok(())
}
