//! enrichflow CLI: queue-driven content enrichment and status reporting.
//!
//! Ingests content submissions, generates titles, descriptions and tags with
//! an LLM, and reports every terminal status to a webhook.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
