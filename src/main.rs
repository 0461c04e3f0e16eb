//! Beadwork - motivation-driven multi-agent orchestrator
//!
//! By default runs the full orchestrator: motivation engine, dispatcher,
//! worker pool, and (when enabled) the webhook ingress.  `tick` drives a
//! single heartbeat for externally-scheduled deployments.

use anyhow::Result;
use beadwork::config::Config;
use beadwork::motivation::defaults::{all_roles, default_motivations};
use beadwork::orchestrator::Orchestrator;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "beadwork", version, about = "Motivation-driven multi-agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator loops (default)
    Run,
    /// Drive one heartbeat: an engine tick plus a dispatch pass
    Tick {
        /// Restrict the dispatch pass to one project
        #[arg(long)]
        project: Option<String>,
    },
    /// Print the built-in motivation catalog
    Motivations,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Local .env for developer workflows; real environment wins.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load().await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let orchestrator = std::sync::Arc::new(Orchestrator::new(config)?);

            let for_signal = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                    for_signal.shutdown();
                }
            });

            orchestrator.run().await
        }

        Command::Tick { project } => {
            let orchestrator = Orchestrator::new(config)?;
            let tick = orchestrator.tick_motivations().await;
            let dispatch = orchestrator.dispatch_once(project.as_deref()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "tick": tick,
                    "dispatch": dispatch,
                }))?
            );
            Ok(())
        }

        Command::Motivations => {
            for role in all_roles() {
                println!("{role}:");
                for m in default_motivations()
                    .iter()
                    .filter(|m| m.agent_role.as_deref() == Some(role.as_str()))
                {
                    println!(
                        "  {:<40} {:?}/{:?} priority={} cooldown={}",
                        m.name,
                        m.kind,
                        m.condition,
                        m.priority,
                        humantime::format_duration(m.cooldown)
                    );
                }
            }
            Ok(())
        }
    }
}
