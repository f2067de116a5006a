//! Index mode: merge a sample index file into the consolidated index.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;
use volidx_core::{append_to_consolidated_index, IndexConfig, IndexLayout, SampleIndexFile};

use crate::utils::load_index_specification;

/// Execute index mode.
pub fn execute(index_spec_path: &Path, sample_index_path: &Path, quiet: bool) -> Result<()> {
    let spec = load_index_specification(index_spec_path)?;
    let file = SampleIndexFile::read_from_path(sample_index_path).with_context(|| {
        format!(
            "Failed to read sample index file {}",
            sample_index_path.display()
        )
    })?;

    let layout = IndexLayout::from_spec(&spec);
    layout.check_compatible(&file.layout).with_context(|| {
        format!(
            "Sample index {} was built under a different specification",
            sample_index_path.display()
        )
    })?;

    let entries = if file.layout.space == spec.space {
        file.entries
    } else {
        info!(
            sample_space = %file.layout.space,
            index_space = %spec.space,
            entries = file.entries.len(),
            "Sample index space does not match; no entries merged"
        );
        Vec::new()
    };

    let config = IndexConfig::from_env();
    let index_path = config.index_path(&spec.root_path);
    let summary = append_to_consolidated_index(&entries, &layout, &index_path, &config)
        .with_context(|| {
            format!(
                "Failed to update consolidated index {}",
                index_path.display()
            )
        })?;

    if !quiet {
        eprintln!("{}", "Consolidated index updated".green().bold());
        eprintln!("   {} {}", "Index:".dimmed(), index_path.display());
        eprintln!("   {} {}", "Appended:".dimmed(), summary.appended);
        eprintln!("   {} {}", "Replaced:".dimmed(), summary.replaced);
        eprintln!("   {} {}", "Total entries:".dimmed(), summary.total);
    }

    Ok(())
}
