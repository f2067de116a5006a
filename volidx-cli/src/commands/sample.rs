//! Sample mode: build first-stage index entries into a sample index file.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;
use volidx_core::{parse_sample_specifications, DefaultVolumeLoader, IndexBuilder};

use crate::utils::load_index_specification;

/// Execute sample mode.
pub fn execute(
    index_spec_path: &Path,
    sample_spec_path: &Path,
    sample_index_path: &Path,
    quiet: bool,
) -> Result<()> {
    // Both specifications are parsed before any volume is touched
    let spec = load_index_specification(index_spec_path)?;
    let samples = parse_sample_specifications(sample_spec_path).with_context(|| {
        format!(
            "Failed to parse sample specification {}",
            sample_spec_path.display()
        )
    })?;
    info!(samples = samples.len(), "Parsed sample specification");

    let (file, report) = IndexBuilder::new(&spec, DefaultVolumeLoader)
        .build_sample_index_file(&samples)
        .context("Failed to build sample index")?;

    file.write_to_path(sample_index_path).with_context(|| {
        format!(
            "Failed to write sample index file {}",
            sample_index_path.display()
        )
    })?;
    info!(
        path = %sample_index_path.display(),
        entries = file.entries.len(),
        digest = %file.digest_hex(),
        "Sample index saved"
    );

    if !quiet {
        let bits = file.layout.fingerprint_bits()?;
        for skipped in &report.skipped {
            eprintln!(
                "{}",
                format!("Skipped sample {}: {}", skipped.sample_id, skipped.reason).yellow()
            );
        }
        eprintln!("{}", "Sample index written".green().bold());
        eprintln!("   {} {}", "File:".dimmed(), sample_index_path.display());
        eprintln!("   {} {}", "Entries:".dimmed(), file.entries.len());
        eprintln!("   {} {}", "Other space:".dimmed(), report.ineligible);
        eprintln!("   {} {} bits", "Fingerprint:".dimmed(), bits);
    }

    Ok(())
}
