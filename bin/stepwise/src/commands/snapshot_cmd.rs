use std::path::Path;
use stepwise_browser::{SnapshotBuilder, SnapshotOptions};

pub async fn run(file: &Path, include_hidden: bool) -> anyhow::Result<()> {
    let markup = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;

    let builder = SnapshotBuilder::new(SnapshotOptions { include_hidden });
    let tree = builder.build(Some(&markup))?;
    println!("{}", tree.to_json_pretty()?);
    Ok(())
}
