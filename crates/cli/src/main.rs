mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use beacon_broker::backends::redis::connect_with_retry;
use beacon_broker::{Directory, MemoryDirectory, MemoryTransport, RedisDirectory, RedisTransport, Transport};
use beacon_core::{Config, ConfigValidator};
use beacon_gateway::{GatewayNode, IdentityVerifier, JwtVerifier};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

fn init_tracing(dev: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if dev {
            EnvFilter::new("beacon=debug,beacon_gateway=debug,beacon_broker=debug,warn")
        } else {
            EnvFilter::new("beacon=info,beacon_gateway=info,beacon_broker=info,warn")
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dev = matches!(cli.command, Some(Commands::Serve { dev: true, .. }));
    init_tracing(dev);

    match cli.command {
        Some(Commands::ConfigSample { output }) => {
            let path = output.unwrap_or_else(|| PathBuf::from("./beacon.sample.yaml"));
            Config::sample().save(&path)?;
            println!("Sample config written to {}", path.display());
        }
        Some(Commands::CheckConfig) => {
            let config = Config::load(&cli.config_path)?;
            ConfigValidator::validate(&config)?;
            println!("Configuration OK");
            println!("  gateway: {} (instance {})", config.gateway.bind_addr(), config.gateway.instance_id);
            println!("  redis:   {}", config.redis.url);
            println!("  topics:  {}", config.broker.inbound_topics().join(", "));
        }
        Some(Commands::Serve {
            host, port, memory, ..
        }) => {
            let mut config = Config::load(&cli.config_path)?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            serve(config, memory).await?;
        }
        None => {
            let config = Config::load(&cli.config_path)?;
            serve(config, false).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config, memory: bool) -> Result<()> {
    ConfigValidator::validate(&config)?;

    let (transport, directory): (Arc<dyn Transport>, Arc<dyn Directory>) = if memory {
        tracing::warn!("Using in-process broker; backend services are unreachable");
        (Arc::new(MemoryTransport::new()), Arc::new(MemoryDirectory::new()))
    } else {
        let (client, conn) = connect_with_retry(&config.redis.url, config.redis.connect_attempts)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis.url))?;
        let directory = RedisDirectory::new(conn.clone(), config.redis.online_users_key.clone());
        (
            Arc::new(RedisTransport::new(client, conn)),
            Arc::new(directory),
        )
    };

    let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::from_config(&config.auth));

    info!(
        instance_id = %config.gateway.instance_id,
        addr = %config.gateway.bind_addr(),
        "Starting beacon gateway"
    );
    let node = GatewayNode::start(config, transport, directory, verifier, None).await?;

    let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    let mut degraded = false;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
            _ = health.tick() => {
                let now = node.is_degraded();
                if now && !degraded {
                    tracing::warn!("Broker connection lost, presence events may be dropped until it recovers");
                } else if !now && degraded {
                    info!("Broker connection recovered");
                }
                degraded = now;
            }
        }
    }

    node.shutdown();
    Ok(())
}
