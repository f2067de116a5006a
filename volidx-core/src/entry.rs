use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tracing::warn;

use crate::error::{Result, VolumeIndexError};
use crate::fingerprint::Fingerprint;
use crate::spec::{fingerprint_bits_for, IndexSpecification, SampleSpecification};

/// Current sample index file format version.
pub const SAMPLE_INDEX_FORMAT_VERSION: u16 = 1;

/// The parts of an index specification that decide whether two fingerprints
/// are comparable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLayout {
    /// Coordinate space of every entry
    pub space: String,
    /// Full-resolution volume size
    pub pixel: [u32; 3],
    /// Subsampling unit
    pub index_unit: u32,
    /// Intensity bit depth
    pub bit_depth: u8,
    /// Binarization threshold
    pub binary_threshold: u32,
}

impl IndexLayout {
    pub fn from_spec(spec: &IndexSpecification) -> Self {
        Self {
            space: spec.space.clone(),
            pixel: spec.pixel,
            index_unit: spec.index_unit,
            bit_depth: spec.bit_depth,
            binary_threshold: spec.binary_threshold,
        }
    }

    /// Fails with `InvalidSpecification` for a layout no index can hold.
    pub fn fingerprint_bits(&self) -> Result<u64> {
        fingerprint_bits_for(self.pixel, self.index_unit)
    }

    pub fn fingerprint_len(&self) -> Result<usize> {
        Ok(self.fingerprint_bits()?.div_ceil(8) as usize)
    }

    /// Check that fingerprints built under `other` can share an index with
    /// ours. Space is not compared here; eligibility by space is a filter,
    /// not an error.
    pub fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.pixel != other.pixel
            || self.index_unit != other.index_unit
            || self.bit_depth != other.bit_depth
        {
            return Err(VolumeIndexError::IncompatibleIndex(format!(
                "layout pixel={:?} unit={} bits={} does not match pixel={:?} unit={} bits={}",
                other.pixel,
                other.index_unit,
                other.bit_depth,
                self.pixel,
                self.index_unit,
                self.bit_depth
            )));
        }
        if self.binary_threshold != other.binary_threshold {
            warn!(
                expected = self.binary_threshold,
                actual = other.binary_threshold,
                "Binary thresholds differ; similarity scores may be skewed"
            );
        }
        Ok(())
    }
}

/// First-stage index entry: one sample's fingerprint plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub sample_id: i64,
    pub owner: String,
    pub alignment_result_id: i64,
    /// Alignment quality
    pub ncc_score: f64,
    pub fingerprint: Fingerprint,
}

impl IndexEntry {
    pub fn for_sample(sample: &SampleSpecification, fingerprint: Fingerprint) -> Self {
        Self {
            sample_id: sample.sample_id,
            owner: sample.owner.clone(),
            alignment_result_id: sample.alignment_result_id,
            ncc_score: sample.ncc_score,
            fingerprint,
        }
    }
}

/// The file written by a sample build and merged into the consolidated index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleIndexFile {
    pub format_version: u16,
    /// Unix timestamp (milliseconds) of the build
    pub created_at_ms: u64,
    pub layout: IndexLayout,
    pub entries: Vec<IndexEntry>,
    /// SHA3-256 over layout and entries
    pub digest: [u8; 32],
}

impl SampleIndexFile {
    pub fn new(layout: IndexLayout, entries: Vec<IndexEntry>) -> Self {
        let digest = compute_digest(&layout, &entries);
        Self {
            format_version: SAMPLE_INDEX_FORMAT_VERSION,
            created_at_ms: Utc::now().timestamp_millis() as u64,
            layout,
            entries,
            digest,
        }
    }

    /// Check version and digest, then that every fingerprint fits the layout
    /// with its padding bits clear.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SAMPLE_INDEX_FORMAT_VERSION {
            return Err(VolumeIndexError::Serialization(format!(
                "unsupported sample index version {}",
                self.format_version
            )));
        }
        if compute_digest(&self.layout, &self.entries) != self.digest {
            return Err(VolumeIndexError::Serialization(
                "sample index digest mismatch".into(),
            ));
        }
        let bits = self
            .layout
            .fingerprint_bits()
            .map_err(|e| VolumeIndexError::Serialization(e.to_string()))?;
        for entry in &self.entries {
            if entry.fingerprint.bit_len() != bits {
                return Err(VolumeIndexError::Serialization(format!(
                    "sample {} has a {}-bit fingerprint, layout needs {bits}",
                    entry.sample_id,
                    entry.fingerprint.bit_len()
                )));
            }
            entry.fingerprint.validate().map_err(|e| {
                VolumeIndexError::Serialization(format!("sample {}: {e}", entry.sample_id))
            })?;
        }
        Ok(())
    }

    /// Hex digest for logging.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Serialize the sample index to CBOR bytes.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| VolumeIndexError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize and validate a sample index from CBOR bytes.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let file: Self = ciborium::from_reader(bytes)
            .map_err(|e| VolumeIndexError::Serialization(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn write_to_path(&self, path: &std::path::Path) -> Result<()> {
        std::fs::write(path, self.to_cbor()?)?;
        Ok(())
    }

    pub fn read_from_path(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_cbor(&bytes)
    }
}

fn compute_digest(layout: &IndexLayout, entries: &[IndexEntry]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(layout.space.as_bytes());
    for p in layout.pixel {
        hasher.update(p.to_le_bytes());
    }
    hasher.update(layout.index_unit.to_le_bytes());
    hasher.update([layout.bit_depth]);
    hasher.update(layout.binary_threshold.to_le_bytes());
    for entry in entries {
        hasher.update(entry.sample_id.to_le_bytes());
        hasher.update(entry.owner.as_bytes());
        hasher.update(entry.alignment_result_id.to_le_bytes());
        hasher.update(entry.ncc_score.to_le_bytes());
        hasher.update(entry.fingerprint.bit_len().to_le_bytes());
        hasher.update(entry.fingerprint.as_bytes());
    }
    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    digest
}
