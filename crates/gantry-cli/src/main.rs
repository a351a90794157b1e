//! Gantry gateway CLI.
//!
//! Provides commands for:
//! - serve: Run the gateway in front of configured RPC servers
//! - routes: Print the route table of services in a descriptor set

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{routes, serve};
use config::ConfigError;
use gantry_client::DialError;
use gantry_gateway::RegistrationError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "HTTP/REST gateway for Gantry RPC services", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve configured services over HTTP
    Serve(serve::ServeArgs),
    /// Print the route table
    Routes(routes::RoutesArgs),
}

/// 2 for configuration and registration errors, 3 for dial errors
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() || cause.is::<RegistrationError>() {
            return 2;
        }
        if cause.is::<DialError>() {
            return 3;
        }
    }
    1
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Serve(args) => serve::run(args).await,
        Commands::Routes(args) => routes::run(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}
