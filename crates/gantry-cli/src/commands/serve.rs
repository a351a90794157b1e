//! Gateway server command

use crate::commands::route_line;
use crate::config::{find_service, load_descriptor_pool, CliConfig};
use anyhow::{Context, Result};
use clap::Args;
use gantry_client::Channel;
use gantry_gateway::Gateway;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Gateway configuration file (YAML)
    #[arg(short, long, default_value = "gateway.yaml")]
    pub config: PathBuf,

    /// Listen address; overrides the configuration file
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let config = CliConfig::load(&args.config)?;
    let pool = load_descriptor_pool(&config.descriptor_set)?;
    if config.services.is_empty() {
        warn!("No services configured in {}", args.config.display());
    }

    let mut builder = Gateway::builder().config(config.gateway.clone());
    for service in &config.services {
        let descriptor = find_service(&pool, &service.name)?;
        let endpoint = service.endpoint()?;
        let channel = Channel::dial(endpoint, service.dial.clone())
            .await
            .with_context(|| format!("Failed to dial {} for {}", service.upstream, service.name))?;
        info!("Connected to {} for {}", service.upstream, service.name);
        builder = builder.register_remote(channel, descriptor);
    }
    let gateway = builder.build()?;
    for route in gateway.routes() {
        info!("{}", route_line(route));
    }

    let listen = args.listen.unwrap_or(config.listen);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    gateway
        .serve_with_shutdown(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", err);
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
