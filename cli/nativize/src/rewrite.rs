//! `nativize <input> <output>`: load, rewrite, save.

use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use nativize_image::ImageFile;
use nativize_rewrite::{rewrite, RewriteConfig, RewriteReport};

use crate::ReportFormat;

/// Rewrite the image at `input` into `output`. Nothing is written when the
/// rewrite fails.
pub fn run(input: &Path, output: &Path, config: Option<&Path>) -> Result<RewriteReport> {
    let config = match config {
        Some(path) => RewriteConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RewriteConfig::default(),
    };

    let image =
        ImageFile::load(input).with_context(|| format!("reading {}", input.display()))?;
    info!(
        "loaded {} ({} types, {} import stubs)",
        input.display(),
        image.module.types.len(),
        image.module.import_stub_count()
    );

    let result = rewrite(image.module, &config)
        .with_context(|| format!("rewriting {}", input.display()))?;
    for warning in &result.report.warnings {
        warn!("{warning}");
    }

    ImageFile::new(result.module)
        .save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!("wrote {}", output.display());

    Ok(result.report)
}

pub fn render(report: &RewriteReport, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Text => Ok(report.to_string()),
        ReportFormat::Json => report.to_json().context("serializing report"),
    }
}
