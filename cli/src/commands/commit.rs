//! `ctr-remote commit` command.

use clap::Args;
use ctr_remote_core::RemoteConfig;

#[derive(Args)]
pub struct CommitArgs {
    /// Image reference
    pub image: String,
}

pub async fn execute(args: CommitArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = super::open_puller(config, None, false)?;
    let record = puller.commit(&args.image).await?;
    println!("Committed: {} ({} snapshots)", record.reference, record.chain.len());
    Ok(())
}
