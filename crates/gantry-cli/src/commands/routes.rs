//! Route table command

use crate::commands::route_line;
use crate::config::{find_service, load_descriptor_pool};
use anyhow::Result;
use clap::Args;
use gantry_gateway::Gateway;
use gantry_server::ServiceContract;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct RoutesArgs {
    /// Path to file descriptor set (.pb or .binpb file)
    #[arg(short, long)]
    pub descriptor_set: PathBuf,

    /// Fully qualified service name; may be repeated
    #[arg(short, long = "service", required = true)]
    pub services: Vec<String>,
}

/// Compile the routes of the given services and print them
///
/// Nothing is dialed; routes are checked exactly as `serve` checks them.
pub fn run(args: RoutesArgs) -> Result<()> {
    let pool = load_descriptor_pool(&args.descriptor_set)?;
    let mut builder = Gateway::builder();
    for name in &args.services {
        let service = find_service(&pool, name)?;
        builder = builder.register_contract(ServiceContract::new(service));
    }
    let gateway = builder.build()?;

    for route in gateway.routes() {
        println!("{}", route_line(route));
    }
    Ok(())
}
