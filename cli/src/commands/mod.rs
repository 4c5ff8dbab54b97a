//! CLI command definitions and dispatch.

mod commit;
mod gc;
mod images;
mod info;
mod login;
mod rm;
mod rollback;
mod rpull;
mod snapshots;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ctr_remote_core::{LogLevel, RemoteConfig};
use ctr_remote_runtime::{OciRegistryClient, RegistryAuth, RemotePuller};

/// ctr-remote: pull images lazily for a remote snapshotter.
#[derive(Parser)]
#[command(name = "ctr-remote", version, about)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Config file (default: $CTR_REMOTE_CONFIG or ~/.ctr-remote/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Pull an image, fetching only bootstraps for lazy layers
    Rpull(rpull::RpullArgs),
    /// Commit a pulled image's snapshot chain
    Commit(commit::CommitArgs),
    /// Abandon a pulled image's uncommitted snapshots
    Rollback(rollback::RollbackArgs),
    /// List pulled images
    Images(images::ImagesArgs),
    /// List snapshots
    Snapshots(snapshots::SnapshotsArgs),
    /// Remove an image and the snapshots no other image uses
    Rm(rm::RmArgs),
    /// Delete unreferenced content and abandoned snapshots
    Gc(gc::GcArgs),
    /// Show state summary
    Info(info::InfoArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
}

/// Open the puller over the configured state root.
///
/// Only `rpull` talks to a registry; other commands pass `None`.
pub(crate) fn open_puller(
    config: &RemoteConfig,
    registry: Option<&str>,
    plain_http: bool,
) -> Result<RemotePuller, Box<dyn std::error::Error>> {
    let mut insecure = config.insecure_registries.clone();
    let auth = match registry {
        Some(registry) => {
            if plain_http && !insecure.iter().any(|r| r == registry) {
                insecure.push(registry.to_string());
            }
            RegistryAuth::from_credential_store(&config.credentials_path(), registry)
        }
        None => RegistryAuth::anonymous(),
    };

    let mut config = config.clone();
    config.insecure_registries = insecure.clone();
    let client = Arc::new(OciRegistryClient::new(auth, &insecure));
    Ok(RemotePuller::open(&config, client)?)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Rpull(args) => rpull::execute(args, &config).await,
        Command::Commit(args) => commit::execute(args, &config).await,
        Command::Rollback(args) => rollback::execute(args, &config).await,
        Command::Images(args) => images::execute(args, &config).await,
        Command::Snapshots(args) => snapshots::execute(args, &config).await,
        Command::Rm(args) => rm::execute(args, &config).await,
        Command::Gc(args) => gc::execute(args, &config).await,
        Command::Info(args) => info::execute(args, &config).await,
        Command::Login(args) => login::execute(args, &config).await,
    }
}
