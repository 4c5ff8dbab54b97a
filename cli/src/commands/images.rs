//! `ctr-remote images` command.

use clap::Args;
use ctr_remote_core::RemoteConfig;
use ctr_remote_runtime::{ImageRecord, ImageReference};

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, config: &RemoteConfig) -> Result<(), Box<dyn std::error::Error>> {
    let puller = super::open_puller(config, None, false)?;
    let images = puller.images().await;

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "DIGEST", "LAYERS", "STATE", "PULLED"]);
    for image in &images {
        let row = ImageRow::from_record(image);
        table.add_row(&[
            &row.repository,
            &row.tag,
            &row.digest,
            &row.layers,
            &row.state,
            &row.pulled,
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Pre-computed display fields for a single image row.
struct ImageRow {
    repository: String,
    tag: String,
    digest: String,
    layers: String,
    state: String,
    pulled: String,
}

impl ImageRow {
    fn from_record(image: &ImageRecord) -> Self {
        let (repository, tag) = match ImageReference::parse(&image.reference) {
            Ok(r) => {
                let tag = r.tag.clone().unwrap_or_else(|| "<none>".to_string());
                (r.source(), tag)
            }
            Err(_) => (image.reference.clone(), "<none>".to_string()),
        };

        Self {
            repository,
            tag,
            digest: output::short_digest(image.manifest_digest.as_str()),
            layers: image.layers.len().to_string(),
            state: if image.committed { "committed" } else { "prepared" }.to_string(),
            pulled: output::format_ago(&image.pulled_at),
        }
    }
}
