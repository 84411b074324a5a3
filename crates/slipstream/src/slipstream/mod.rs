pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub async fn run(cli: config::Cli) -> anyhow::Result<()> {
    app::run(cli).await
}
