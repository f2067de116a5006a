//! volidx-core - Volume indexing and similarity search for microscopy stacks
//!
//! This crate builds compact binary fingerprints of large 3D/4D image volumes
//! and answers nearest-neighbour queries against a consolidated index of them.
//!
//! # Pipeline
//!
//! - Parse an [`IndexSpecification`] and [`SampleSpecification`]s from
//!   `key=value` files
//! - Load voxel buffers through a [`VolumeLoader`] (Vaa3D raw stacks, image
//!   slice stacks, or in memory)
//! - Subsample by block maximum and binarize into a packed [`Fingerprint`]
//! - Merge [`IndexEntry`] records into the consolidated index file
//! - Rank index entries against a query by normalized Hamming similarity
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use volidx_core::{
//!     append_to_consolidated_index, parse_index_specification, parse_sample_specifications,
//!     search_query_file, DefaultVolumeLoader, IndexBuilder, IndexConfig, IndexLayout,
//! };
//!
//! # fn example() -> volidx_core::Result<()> {
//! let config = IndexConfig::from_env();
//! let spec = parse_index_specification(Path::new("index.spec"))?;
//! let samples = parse_sample_specifications(Path::new("samples.spec"))?;
//!
//! let report = IndexBuilder::new(&spec, DefaultVolumeLoader).build_samples(&samples)?;
//! append_to_consolidated_index(
//!     &report.entries,
//!     &IndexLayout::from_spec(&spec),
//!     &config.index_path(&spec.root_path),
//!     &config,
//! )?;
//!
//! for hit in search_query_file(Path::new("query.v3draw"), &spec, DefaultVolumeLoader, 10, &config)? {
//!     println!("{} {:.6}", hit.sample_id, hit.score);
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod search;
pub mod spec;
pub mod store;
pub mod volume;

// Re-export main types for convenience
pub use builder::{build_first_stage_index, BuildReport, IndexBuilder, SkippedSample};
pub use config::{IndexConfig, DEFAULT_INDEX_FILE_NAME};
pub use entry::{IndexEntry, IndexLayout, SampleIndexFile, SAMPLE_INDEX_FORMAT_VERSION};
pub use error::{Result, VolumeIndexError};
pub use fingerprint::{binarize, hamming_distance, subsample, subsample_and_threshold, Fingerprint};
pub use search::{rank_entries, search, search_fingerprint, search_query_file, SearchHit};
pub use spec::{
    parse_index_specification, parse_sample_specification, parse_sample_specifications,
    FingerprintSource, FragmentSpecification, IndexSpecification, SampleSpecification,
};
pub use store::{append_to_consolidated_index, AppendSummary, ConsolidatedIndex, IndexLock};
pub use volume::{
    load_volume, validate_image_size, DefaultVolumeLoader, Dims, InMemoryLoader, VolumeLoader,
    VoxelBuffer,
};
