mod factories;

use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use relaygate_channels::registered_types;
use relaygate_common::config;
use relaygate_gateway::Gateway;
use relaygate_matcher::HashEmbeddingService;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relaygate", about = "Relaygate — multi-channel conversational message gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Explicit config file path (overrides discovery).
    #[arg(long, global = true, env = "RELAYGATE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and every configured channel (default when no subcommand is given).
    Serve,
    /// List channel types registered with the factory registry.
    Channels,
}

fn load_config(cli: &Cli) -> relaygate_common::config::GatewayConfig {
    match &cli.config {
        Some(path) => config::load_config(path).unwrap_or_else(|e| {
            error!(path = %path.display(), error = %e, "failed to load config, using defaults");
            config::GatewayConfig::default()
        }),
        None => config::discover_and_load(),
    }
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    factories::register_builtin_factories();

    let cfg = load_config(&cli);
    let idle_ttl = cfg
        .session_idle_ttl_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(30 * 60));

    let gateway = Gateway::with_idle_ttl("realtime", Arc::new(HashEmbeddingService::default()), idle_ttl).await;

    gateway
        .set_on_message(Arc::new(|msg, _sink| {
            Box::pin(async move {
                info!(session = %msg.session_id, "no onMessage callback wired; echoing inbound content");
                Ok((msg.content, String::new()))
            })
        }))
        .await;

    let lifecycle = CancellationToken::new();
    let manager = gateway.channel_manager().clone();
    let inbound: relaygate_channels::InboundHandler = {
        let gateway = gateway.clone();
        Arc::new(move |msg| {
            let gateway = gateway.clone();
            Box::pin(async move { gateway.handle_message(msg).await })
        })
    };

    let configs: Vec<(String, std::collections::HashMap<String, serde_json::Value>)> = cfg
        .enabled_channels
        .iter()
        .filter_map(|name| {
            cfg.channels.get(name).and_then(|c| {
                if c.enabled { Some((name.clone(), c.config.clone())) } else { None }
            })
        })
        .collect();

    let failures = manager.create_channels_from_config(&configs, inbound, lifecycle.clone()).await;
    for (name, err) in &failures {
        error!(channel = %name, error = %err, "channel failed to start");
    }

    info!(channels = manager.count().await, "relaygate gateway running");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
    }

    if let Err(e) = gateway.shutdown(Duration::from_secs(5)).await {
        error!(error = %e, "gateway shutdown did not complete cleanly");
    }

    Ok(())
}

fn print_channel_types() {
    factories::register_builtin_factories();
    let types = registered_types();
    if types.is_empty() {
        println!("No channel types registered.");
        return;
    }
    for t in types {
        println!("  {t}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    relaygate_common::logging::init_tracing(&cli.log_level, cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "relaygate starting");

    match cli.command {
        None | Some(Commands::Serve) => serve(cli).await,
        Some(Commands::Channels) => {
            print_channel_types();
            Ok(())
        },
    }
}
