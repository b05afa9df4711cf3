mod cli;
mod codec;
mod config;
mod daemon;
mod error;
mod logging;
mod model;
mod notifier;
mod pidfile;
mod reconciler;
mod remote;
mod retry;
mod tunnel;
mod watcher;
mod webhook;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.verbose)?;
    cli::execute(cli).await
}
