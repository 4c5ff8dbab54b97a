//! `ctr-remote gc` command.

use clap::Args;
use ctr_remote_core::RemoteConfig;

use crate::output;

#[derive(Args)]
pub struct GcArgs {
    /// List every removed digest and snapshot
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn execute(args: GcArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = super::open_puller(config, None, false)?;
    let report = puller.gc().await?;

    if args.verbose {
        for digest in &report.content_removed {
            println!("content  {}", output::short_digest(digest.as_str()));
        }
        for id in &report.snapshots_removed {
            println!("snapshot {}", output::short_digest(id));
        }
    }
    println!(
        "Removed {} content object(s) and {} snapshot(s)",
        report.content_removed.len(),
        report.snapshots_removed.len()
    );
    Ok(())
}
