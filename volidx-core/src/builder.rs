//! First-stage index construction.
//!
//! Turns sample specifications into [`IndexEntry`] fingerprints. Only samples
//! aligned to the index's space are eligible; others are left out without
//! error. A sample whose volume cannot be loaded, has the wrong size, or is
//! too large to allocate is skipped with a logged reason and the batch goes on.

use tracing::{debug, info, warn};

use crate::entry::{IndexEntry, IndexLayout, SampleIndexFile};
use crate::error::{Result, VolumeIndexError};
use crate::fingerprint::{fingerprint_volume, Fingerprint};
use crate::spec::{FingerprintSource, IndexSpecification, SampleSpecification};
use crate::volume::VolumeLoader;

/// Fragment masks mark labelled voxels with any nonzero value.
const FRAGMENT_MASK_THRESHOLD: u32 = 0;

/// A sample left out of a build, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSample {
    pub sample_id: i64,
    pub reason: String,
}

/// Outcome of building a batch of samples.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Entries built, in sample order
    pub entries: Vec<IndexEntry>,
    /// Eligible samples that failed to build
    pub skipped: Vec<SkippedSample>,
    /// Samples excluded because their space differs from the index
    pub ineligible: usize,
}

/// Builds fingerprints for one index specification.
pub struct IndexBuilder<'a, L> {
    spec: &'a IndexSpecification,
    loader: L,
}

impl<'a, L: VolumeLoader> IndexBuilder<'a, L> {
    pub fn new(spec: &'a IndexSpecification, loader: L) -> Self {
        Self { spec, loader }
    }

    pub fn spec(&self) -> &IndexSpecification {
        self.spec
    }

    /// Whether `sample` is aligned to the index's space.
    pub fn is_eligible(&self, sample: &SampleSpecification) -> bool {
        sample.space == self.spec.space
    }

    /// Push `sample` onto `eligible` if its space matches the index.
    pub fn add_alignment_if_matching_space<'s>(
        &self,
        sample: &'s SampleSpecification,
        eligible: &mut Vec<&'s SampleSpecification>,
    ) -> bool {
        if self.is_eligible(sample) {
            eligible.push(sample);
            true
        } else {
            debug!(
                sample_id = sample.sample_id,
                sample_space = %sample.space,
                index_space = %self.spec.space,
                "Sample space does not match index; excluded"
            );
            false
        }
    }

    /// Fingerprint one sample.
    pub fn build_first_stage_index(&self, sample: &SampleSpecification) -> Result<IndexEntry> {
        let fingerprint = match self.spec.source {
            FingerprintSource::Signal => self.signal_fingerprint(sample)?,
            FingerprintSource::Fragments => self.fragment_fingerprint(sample)?,
        };
        debug!(
            sample_id = sample.sample_id,
            set_bits = fingerprint.count_ones(),
            "Built first-stage index entry"
        );
        Ok(IndexEntry::for_sample(sample, fingerprint))
    }

    fn signal_fingerprint(&self, sample: &SampleSpecification) -> Result<Fingerprint> {
        let volume = self.loader.load(&sample.consolidated_signal_path)?;
        fingerprint_volume(&volume, self.spec, self.spec.binary_threshold)
    }

    fn fragment_fingerprint(&self, sample: &SampleSpecification) -> Result<Fingerprint> {
        if sample.fragments.is_empty() {
            return Err(VolumeIndexError::Load(format!(
                "sample {} lists no fragment masks",
                sample.sample_id
            )));
        }
        let mut combined = Fingerprint::zeroed(self.spec.fingerprint_bits()?);
        for fragment in &sample.fragments {
            let mask = self.loader.load(&fragment.mask_path)?;
            let fingerprint = fingerprint_volume(&mask, self.spec, FRAGMENT_MASK_THRESHOLD)?;
            combined.union_with(&fingerprint)?;
        }
        Ok(combined)
    }

    /// Build every eligible sample, skipping the ones that fail per sample.
    ///
    /// Errors that are not specific to one sample abort the batch.
    pub fn build_samples(&self, samples: &[SampleSpecification]) -> Result<BuildReport> {
        let mut eligible = Vec::with_capacity(samples.len());
        for sample in samples {
            self.add_alignment_if_matching_space(sample, &mut eligible);
        }

        let mut report = BuildReport {
            ineligible: samples.len() - eligible.len(),
            ..Default::default()
        };

        for sample in eligible {
            match self.build_first_stage_index(sample) {
                Ok(entry) => report.entries.push(entry),
                Err(e) if e.is_per_sample() => {
                    warn!(sample_id = sample.sample_id, error = %e, "Skipping sample");
                    report.skipped.push(SkippedSample {
                        sample_id: sample.sample_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            built = report.entries.len(),
            skipped = report.skipped.len(),
            ineligible = report.ineligible,
            "Built sample index"
        );
        Ok(report)
    }

    /// Build `samples` into a sample index file ready to write.
    pub fn build_sample_index_file(
        &self,
        samples: &[SampleSpecification],
    ) -> Result<(SampleIndexFile, BuildReport)> {
        let mut report = self.build_samples(samples)?;
        let entries = std::mem::take(&mut report.entries);
        let file = SampleIndexFile::new(IndexLayout::from_spec(self.spec), entries);
        Ok((file, report))
    }
}

/// Fingerprint one sample under `spec`.
pub fn build_first_stage_index<L: VolumeLoader>(
    sample: &SampleSpecification,
    spec: &IndexSpecification,
    loader: L,
) -> Result<IndexEntry> {
    IndexBuilder::new(spec, loader).build_first_stage_index(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::FragmentSpecification;
    use crate::volume::{Dims, InMemoryLoader, VoxelBuffer};
    use std::path::PathBuf;

    fn spec(source: FingerprintSource) -> IndexSpecification {
        IndexSpecification {
            space: "JFRC2010".into(),
            optical: [1.0; 3],
            pixel: [8, 8, 4],
            index_unit: 2,
            bit_depth: 8,
            binary_threshold: 20,
            root_path: PathBuf::from("/tmp/index"),
            source,
        }
    }

    fn sample(sample_id: i64, space: &str, signal: &str) -> SampleSpecification {
        SampleSpecification {
            sample_id,
            owner: "nerna".into(),
            alignment_result_id: 0,
            space: space.into(),
            aligned_stack_id: 0,
            ncc_score: 0.7,
            neuron_separation_id: 0,
            consolidated_label_path: None,
            consolidated_signal_path: PathBuf::from(signal),
            fragments: Vec::new(),
        }
    }

    fn cluster_volume(origin: [usize; 3], value: u16) -> VoxelBuffer {
        let mut buffer = VoxelBuffer::zeroed(Dims::new(8, 8, 4, 1), 8).unwrap();
        buffer.fill_region(origin, [2, 2, 2], 0, value);
        buffer
    }

    #[test]
    fn test_signal_entry_marks_cluster_blocks() {
        let spec = spec(FingerprintSource::Signal);
        let loader = InMemoryLoader::new().with_volume("a", cluster_volume([2, 2, 0], 200));
        let entry = build_first_stage_index(&sample(1, "JFRC2010", "a"), &spec, &loader).unwrap();

        assert_eq!(entry.sample_id, 1);
        assert_eq!(entry.fingerprint.bit_len(), 32);
        assert_eq!(entry.fingerprint.count_ones(), 1);
        // block (1, 1, 0) -> bit 1 + 4 * 1
        assert!(entry.fingerprint.get(5));
    }

    #[test]
    fn test_dim_voxels_below_threshold_are_clear() {
        let spec = spec(FingerprintSource::Signal);
        let loader = InMemoryLoader::new().with_volume("a", cluster_volume([0, 0, 0], 20));
        let entry = build_first_stage_index(&sample(1, "JFRC2010", "a"), &spec, &loader).unwrap();
        assert_eq!(entry.fingerprint.count_ones(), 0);
    }

    #[test]
    fn test_fragments_are_unioned_at_zero_threshold() {
        let spec = spec(FingerprintSource::Fragments);
        let loader = InMemoryLoader::new()
            .with_volume("m0", cluster_volume([0, 0, 0], 1))
            .with_volume("m1", cluster_volume([6, 6, 2], 1));
        let mut s = sample(1, "JFRC2010", "unused");
        s.fragments = vec![
            FragmentSpecification {
                fragment_id: 10,
                index: 0,
                mask_path: PathBuf::from("m0"),
            },
            FragmentSpecification {
                fragment_id: 11,
                index: 1,
                mask_path: PathBuf::from("m1"),
            },
        ];

        let entry = build_first_stage_index(&s, &spec, &loader).unwrap();
        assert_eq!(entry.fingerprint.count_ones(), 2);
        assert!(entry.fingerprint.get(0));
        assert!(entry.fingerprint.get(31));
    }

    #[test]
    fn test_batch_excludes_other_spaces_and_skips_failures() {
        let spec = spec(FingerprintSource::Signal);
        let mut wrong_size = VoxelBuffer::zeroed(Dims::new(8, 8, 5, 1), 8).unwrap();
        wrong_size.set(0, 0, 0, 0, 255);
        let loader = InMemoryLoader::new()
            .with_volume("good", cluster_volume([0, 0, 0], 200))
            .with_volume("other", cluster_volume([0, 0, 0], 200))
            .with_volume("wrong", wrong_size);
        let samples = vec![
            sample(1, "JFRC2010", "good"),
            sample(2, "JRC2018", "other"),
            sample(3, "JFRC2010", "wrong"),
            sample(4, "JFRC2010", "missing"),
        ];

        let builder = IndexBuilder::new(&spec, &loader);
        let report = builder.build_samples(&samples).unwrap();
        let built: Vec<i64> = report.entries.iter().map(|e| e.sample_id).collect();
        let skipped: Vec<i64> = report.skipped.iter().map(|s| s.sample_id).collect();
        assert_eq!(built, vec![1]);
        assert_eq!(skipped, vec![3, 4]);
        assert_eq!(report.ineligible, 1);
    }

    #[test]
    fn test_add_alignment_if_matching_space() {
        let spec = spec(FingerprintSource::Signal);
        let builder = IndexBuilder::new(&spec, InMemoryLoader::new());
        let matching = sample(1, "JFRC2010", "a");
        let other = sample(2, "JRC2018", "b");
        let mut eligible = Vec::new();
        assert!(builder.add_alignment_if_matching_space(&matching, &mut eligible));
        assert!(!builder.add_alignment_if_matching_space(&other, &mut eligible));
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].sample_id, 1);
    }
}
