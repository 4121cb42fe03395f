pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod index;
pub mod matrix;
pub mod model;
pub mod service;
pub mod store;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{BuildArgs, ServeArgs};
use crate::service::QueryService;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "puzzle-search",
    version,
    about = "Similarity search over fused chess-puzzle embeddings"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the IVF index artifact from a vector matrix and metadata
    Build(BuildArgs),
    /// Serve similarity queries over HTTP
    Serve(ServeArgs),
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Build(args) => index::run_build(args.into_options()),
        Commands::Serve(args) => {
            let config = args.into_config();
            let service = QueryService::open(&config)?;
            http::serve(service, config.listen).await
        }
    }
}
