use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fednode")]
#[command(about = "Federated analysis node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node: API server, job queue and worker pool
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the API server to (overrides the config file)
    #[arg(long)]
    pub address: Option<SocketAddr>,

    /// Path to the TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}
