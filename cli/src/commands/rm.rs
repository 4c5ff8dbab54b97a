//! `ctr-remote rm` command: remove images and their unshared snapshots.

use clap::Args;
use ctr_remote_core::{RemoteConfig, RemoteError};

#[derive(Args)]
pub struct RmArgs {
    /// Image references to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore images that are not recorded
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = super::open_puller(config, None, false)?;

    let mut errors: Vec<String> = Vec::new();
    for reference in &args.images {
        match puller.remove(reference).await {
            Ok(removed) => {
                println!("Removed: {reference} ({} snapshots)", removed.len());
            }
            Err(RemoteError::ImageNotFound(_)) if args.force => continue,
            Err(e) => errors.push(format!("{reference}: [{}] {e}", e.stage())),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}
