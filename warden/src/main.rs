use clap::Parser;
use warden::tracing_support::init_subscriber_with_config;
use warden::{daemon, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber_with_config(cli.tracing_config());
    daemon::run(cli).await
}
