use anyhow::Context;
use clap::Parser;
use station_aggregator::cli::{run, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await.context("station-aggregator failed")
}
