//! ctr-remote CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ctr_remote_cli::commands::{dispatch, Cli};
use ctr_remote_cli::output::describe_error;
use ctr_remote_core::RemoteConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match RemoteConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", describe_error(&e));
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over --log-level, which wins over the config file
    let level = cli.log_level.unwrap_or(config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter())),
        )
        .with_target(false)
        .init();

    if let Err(e) = dispatch(cli, config).await {
        eprintln!("{}", describe_error(e.as_ref()));
        std::process::exit(1);
    }
}
