//! Search mode: rank consolidated index entries against a query volume.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use volidx_core::{search_query_file, DefaultVolumeLoader, IndexConfig, SearchHit};

use crate::utils::load_index_specification;
use crate::OutputFormat;

/// JSON document printed with `-format json`.
#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a Path,
    max_hits: usize,
    hits: &'a [SearchHit],
}

/// Execute search mode.
pub fn execute(
    index_spec_path: &Path,
    query: &Path,
    max_hits: usize,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let spec = load_index_specification(index_spec_path)?;
    let config = IndexConfig::from_env();

    let hits = search_query_file(query, &spec, DefaultVolumeLoader, max_hits, &config)
        .with_context(|| format!("Search failed for query {}", query.display()))?;

    // Results are printed only once the whole scan has succeeded
    let mut stdout = std::io::stdout().lock();
    match format {
        OutputFormat::Text => {
            for hit in &hits {
                writeln!(stdout, "{} {:.6}", hit.sample_id, hit.score)
                    .context("Failed to write results")?;
            }
        }
        OutputFormat::Json => {
            let output = SearchOutput {
                query,
                max_hits,
                hits: &hits,
            };
            serde_json::to_writer_pretty(&mut stdout, &output)
                .context("Failed to serialize results to JSON")?;
            writeln!(stdout).context("Failed to write results")?;
        }
    }

    if !quiet && hits.is_empty() {
        eprintln!("{}", "No matching samples in the index".yellow());
    }

    Ok(())
}
