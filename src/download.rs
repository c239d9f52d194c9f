use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::info;

use crate::config::DownloadArgs;
use crate::provider::{OnnxProvider, ProviderSettings};

/// Fetches the model into `args.output`. The file only appears once it has
/// been fully written.
pub fn download(args: &DownloadArgs) -> Result<()> {
    info!(url = %args.url, output = %args.output.display(), "Downloading model");

    let mut response = reqwest::blocking::get(&args.url)
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("failed to fetch {}", args.url))?;

    let mut staging = NamedTempFile::new_in(parent_dir(&args.output))
        .context("failed to create staging file")?;
    let bytes = response
        .copy_to(&mut staging)
        .context("failed to write model")?;
    staging
        .persist(&args.output)
        .with_context(|| format!("failed to move model to {}", args.output.display()))?;
    info!(bytes, "Model saved");

    if args.verify {
        let provider = OnnxProvider::load(&ProviderSettings {
            model: args.output.clone(),
            labels: None,
            task: None,
            imgsz: args.imgsz,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            top_k: None,
        })?;
        info!(classes = provider.names().len(), "Model loaded successfully");
    }

    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}
