//! `ctr-remote rpull` command.

use clap::Args;
use ctr_remote_core::RemoteConfig;
use ctr_remote_runtime::ImageReference;
use tokio_util::sync::CancellationToken;

use crate::output;

#[derive(Args)]
pub struct RpullArgs {
    /// Image reference (e.g., "alpine:latest", "ghcr.io/org/image:tag")
    pub image: String,

    /// Reach the image's registry over plain HTTP
    #[arg(long)]
    pub plain_http: bool,

    /// Leave the snapshot chain prepared but uncommitted
    #[arg(long)]
    pub no_commit: bool,

    /// Resolve against the registry even if the image is already prepared
    #[arg(long)]
    pub force: bool,

    /// Only print the mount
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: RpullArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.image)?;
    let puller = super::open_puller(config, Some(&reference.registry), args.plain_http)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling pull");
            on_interrupt.cancel();
        }
    });

    if !args.quiet {
        println!("Pulling {}...", reference);
    }
    let result = if args.force {
        puller.force_pull(&args.image, &cancel).await
    } else {
        puller.pull(&args.image, &cancel).await
    };
    watcher.abort();
    let result = result?;

    if !args.no_commit {
        puller.commit(&result.reference).await?;
    }

    if args.quiet {
        println!("{}", result.mount);
        return Ok(());
    }

    if result.cached {
        println!("Already prepared: {}", result.reference);
    } else {
        println!(
            "Fetched {} object(s), {} ({} of {} layers lazy)",
            result.blobs_fetched,
            output::format_bytes(result.bytes_fetched),
            result.lazy_layers,
            result.layers
        );
        println!(
            "Snapshots: {} prepared, {} reused",
            result.snapshots_prepared, result.snapshots_reused
        );
    }
    println!("Digest: {}", result.manifest_digest);
    println!("Snapshot: {}", result.mount.snapshot);
    println!("Mount: {}", result.mount);
    if args.no_commit {
        println!("Left uncommitted; run `ctr-remote commit {}` once the mount is in use", result.reference);
    } else {
        println!("Committed");
    }
    Ok(())
}
