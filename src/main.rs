mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use fednode::api;
use fednode::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = match args.config {
                Some(path) => Config::load_from_path(path)?,
                None => Config::load()?,
            };
            api::run(config, args.address).await?;
        }
    }

    Ok(())
}
