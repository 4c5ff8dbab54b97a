//! `ctr-remote info` command.

use clap::Args;
use ctr_remote_core::RemoteConfig;

use crate::output;

#[derive(Args)]
pub struct InfoArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: InfoArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = super::open_puller(config, None, false)?;
    let info = puller.info().await?;

    if args.json {
        let value = serde_json::json!({
            "version": info.version,
            "root": info.root,
            "images": info.images,
            "content_objects": info.content_objects,
            "content_bytes": info.content_bytes,
            "snapshots": info.snapshots,
            "max_concurrent_fetches": config.max_concurrent_fetches,
            "insecure_registries": config.insecure_registries,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("ctr-remote version {}", info.version);
    println!("State root: {}", info.root.display());
    println!("Images: {}", info.images);
    println!(
        "Content: {} object(s) ({})",
        info.content_objects,
        output::format_bytes(info.content_bytes)
    );
    let total: usize = info.snapshots.values().sum();
    let states: Vec<String> = info
        .snapshots
        .iter()
        .map(|(state, count)| format!("{count} {state}"))
        .collect();
    if states.is_empty() {
        println!("Snapshots: 0");
    } else {
        println!("Snapshots: {} ({})", total, states.join(", "));
    }
    println!("Max concurrent fetches: {}", config.max_concurrent_fetches);
    Ok(())
}
