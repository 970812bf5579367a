use anyhow::Result;
use autopilot_cli::{init_tracing, run_cli, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    run_cli(cli).await
}
