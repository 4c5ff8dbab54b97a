//! `ctr-remote snapshots` command.

use clap::Args;
use ctr_remote_core::labels::{LABEL_CHAIN, LABEL_KIND};
use ctr_remote_core::RemoteConfig;

use crate::output;

#[derive(Args)]
pub struct SnapshotsArgs {
    /// Only show snapshot ids
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: SnapshotsArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = super::open_puller(config, None, false)?;
    let snapshots = puller.snapshots().await?;

    if args.quiet {
        for snapshot in &snapshots {
            println!("{}", snapshot.id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["ID", "PARENT", "STATE", "KIND", "IMAGE", "CREATED"]);
    for snapshot in &snapshots {
        table.add_row(&[
            output::short_digest(&snapshot.id),
            snapshot
                .parent
                .as_deref()
                .map(output::short_digest)
                .unwrap_or_default(),
            snapshot.state.to_string(),
            snapshot.label(LABEL_KIND).unwrap_or("-").to_string(),
            snapshot
                .label(LABEL_CHAIN)
                .map(output::short_digest)
                .unwrap_or_default(),
            output::format_ago(&snapshot.created_at),
        ]);
    }
    println!("{table}");
    Ok(())
}
