//! `ctr-remote rollback` command.

use clap::Args;
use ctr_remote_core::RemoteConfig;

#[derive(Args)]
pub struct RollbackArgs {
    /// Image reference
    pub image: String,
}

pub async fn execute(args: RollbackArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = super::open_puller(config, None, false)?;
    let abandoned = puller.rollback(&args.image).await?;
    println!("Rolled back: {} ({abandoned} snapshots abandoned)", args.image);
    Ok(())
}
