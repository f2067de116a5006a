//! Volume fingerprints.
//!
//! A fingerprint is the binarized, subsampled form of a volume: one bit per
//! `unit³` block, set when the brightest voxel of the block exceeds the index
//! threshold. Build and search share this module so both sides pack bits the
//! same way.
//!
//! # Components
//!
//! - **Sampling**: block-max subsampling and threshold binarization.
//! - **Binary fingerprints**: packed bit vectors with Hamming distance and
//!   normalized similarity.

pub mod binary;
pub mod sampling;

pub use binary::*;
pub use sampling::*;
