//! runbook CLI: local driver for the documentation ingestion pipeline.
//!
//! Registers domains, then crawls, resumes, clusters and re-ingests them by
//! draining an in-process step engine.

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
