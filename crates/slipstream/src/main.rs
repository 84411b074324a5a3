mod slipstream;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = slipstream::config::Cli::parse();
    slipstream::run(cli).await
}
