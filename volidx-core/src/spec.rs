//! Index and sample specification files.
//!
//! Both files are line oriented `key=value` text. Blank lines and lines
//! starting with `#` are skipped, unknown keys are ignored so newer writers can
//! add fields without breaking older readers.
//!
//! ```text
//! space=JFRC2010
//! pixel_x=1024
//! pixel_y=512
//! pixel_z=218
//! index_unit=4
//! bits=8
//! threshold=20
//! root=/data/volume-index
//! ```
//!
//! Relative paths inside a specification file resolve against the directory
//! holding that file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, VolumeIndexError};

/// Bit depths a volume may carry.
pub const SUPPORTED_BIT_DEPTHS: [u8; 2] = [8, 16];

/// Largest packed fingerprint the consolidated index header can record.
pub const MAX_FINGERPRINT_LEN: u64 = u32::MAX as u64;

/// Which volumes a sample fingerprint is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FingerprintSource {
    /// The consolidated signal volume, thresholded at the binary threshold.
    #[default]
    Signal,
    /// The union of all fragment masks.
    Fragments,
}

impl FingerprintSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Fragments => "fragments",
        }
    }
}

impl FromStr for FingerprintSource {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "signal" => Ok(Self::Signal),
            "fragments" | "fragment" => Ok(Self::Fragments),
            _ => Err(()),
        }
    }
}

/// Layout shared by every entry of one index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpecification {
    /// Coordinate space identifier; samples must match it to be indexed
    pub space: String,
    /// Physical size of one voxel along x, y, z
    pub optical: [f64; 3],
    /// Expected volume size in voxels along x, y, z
    pub pixel: [u32; 3],
    /// Edge length of the cubic block reduced to one fingerprint voxel
    pub index_unit: u32,
    /// Intensity bit depth (8 or 16)
    pub bit_depth: u8,
    /// Voxels brighter than this become set bits
    pub binary_threshold: u32,
    /// Directory holding the consolidated index
    pub root_path: PathBuf,
    /// Which volumes feed the fingerprint
    pub source: FingerprintSource,
}

impl IndexSpecification {
    /// Parse specification text. `origin` names the file for diagnostics and
    /// anchors relative paths.
    pub fn parse_str(text: &str, origin: &Path) -> Result<Self> {
        let mut space = None;
        let mut optical = [1.0f64; 3];
        let mut pixel = [None::<u32>; 3];
        let mut index_unit = None;
        let mut bit_depth = None;
        let mut binary_threshold = None;
        let mut root_path = None;
        let mut source = FingerprintSource::default();

        for line in KeyValueLines::new(text) {
            let line = line?;
            match line.key {
                "space" => space = Some(line.value.to_string()),
                "optical_x" => optical[0] = line.parse()?,
                "optical_y" => optical[1] = line.parse()?,
                "optical_z" => optical[2] = line.parse()?,
                "pixel_x" => pixel[0] = Some(line.parse()?),
                "pixel_y" => pixel[1] = Some(line.parse()?),
                "pixel_z" => pixel[2] = Some(line.parse()?),
                "index_unit" => index_unit = Some(line.parse()?),
                "bits" => bit_depth = Some(line.parse()?),
                "threshold" => binary_threshold = Some(line.parse()?),
                "root" => root_path = Some(resolve_path(origin, line.value)),
                "index_source" => {
                    source = line.value.parse().map_err(|_| line.malformed())?;
                }
                other => debug!(key = other, "Ignoring unknown index specification key"),
            }
        }

        let missing = |field| VolumeIndexError::MissingField {
            field,
            source_path: origin.to_path_buf(),
        };

        let spec = Self {
            space: space.filter(|s| !s.is_empty()).ok_or_else(|| missing("space"))?,
            optical,
            pixel: [
                pixel[0].ok_or_else(|| missing("pixel_x"))?,
                pixel[1].ok_or_else(|| missing("pixel_y"))?,
                pixel[2].ok_or_else(|| missing("pixel_z"))?,
            ],
            index_unit: index_unit.ok_or_else(|| missing("index_unit"))?,
            bit_depth: bit_depth.ok_or_else(|| missing("bits"))?,
            binary_threshold: binary_threshold.ok_or_else(|| missing("threshold"))?,
            root_path: root_path.ok_or_else(|| missing("root"))?,
            source,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check the cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(VolumeIndexError::InvalidSpecification(msg));

        if self.pixel.contains(&0) {
            return invalid(format!("pixel dimensions must be positive: {:?}", self.pixel));
        }
        if self.optical.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return invalid(format!("optical resolution must be positive: {:?}", self.optical));
        }
        if self.index_unit == 0 {
            return invalid("index_unit must be at least 1".into());
        }
        if self.pixel.iter().any(|&p| p < self.index_unit) {
            return invalid(format!(
                "index_unit {} exceeds a pixel dimension {:?}",
                self.index_unit, self.pixel
            ));
        }
        self.fingerprint_bits()?;
        if !SUPPORTED_BIT_DEPTHS.contains(&self.bit_depth) {
            return invalid(format!("unsupported bit depth {}", self.bit_depth));
        }
        if self.binary_threshold > self.max_intensity() {
            return invalid(format!(
                "threshold {} exceeds the {}-bit maximum {}",
                self.binary_threshold,
                self.bit_depth,
                self.max_intensity()
            ));
        }
        if self.pixel.iter().any(|&p| p % self.index_unit != 0) {
            warn!(
                pixel = ?self.pixel,
                unit = self.index_unit,
                "Pixel dimensions are not divisible by the index unit; remainder voxels are truncated"
            );
        }
        Ok(())
    }

    /// Largest intensity representable at this bit depth.
    pub fn max_intensity(&self) -> u32 {
        (1u32 << self.bit_depth) - 1
    }

    /// Fingerprint grid size: each pixel dimension divided by the unit, rounded down.
    pub fn subsampled_dims(&self) -> [u32; 3] {
        self.pixel.map(|p| p / self.index_unit)
    }

    /// Number of meaningful bits in a fingerprint.
    pub fn fingerprint_bits(&self) -> Result<u64> {
        fingerprint_bits_for(self.pixel, self.index_unit)
    }

    /// Packed fingerprint length in bytes.
    pub fn fingerprint_len(&self) -> Result<usize> {
        Ok(self.fingerprint_bits()?.div_ceil(8) as usize)
    }
}

/// Fingerprint bit count for a volume of `pixel` voxels reduced by `unit`.
///
/// Fails with `InvalidSpecification` when the unit is zero, the count
/// overflows, or the packed length exceeds [`MAX_FINGERPRINT_LEN`].
pub fn fingerprint_bits_for(pixel: [u32; 3], unit: u32) -> Result<u64> {
    if unit == 0 {
        return Err(VolumeIndexError::InvalidSpecification(
            "index_unit must be at least 1".into(),
        ));
    }
    let too_large = || {
        VolumeIndexError::InvalidSpecification(format!(
            "fingerprint for pixel={pixel:?} unit={unit} is too large for the index format"
        ))
    };
    let bits = pixel
        .iter()
        .try_fold(1u64, |acc, &p| acc.checked_mul(u64::from(p / unit)))
        .ok_or_else(too_large)?;
    if bits.div_ceil(8) > MAX_FINGERPRINT_LEN {
        return Err(too_large());
    }
    Ok(bits)
}

impl fmt::Display for IndexSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "space={}", self.space)?;
        writeln!(f, "optical_x={}", self.optical[0])?;
        writeln!(f, "optical_y={}", self.optical[1])?;
        writeln!(f, "optical_z={}", self.optical[2])?;
        writeln!(f, "pixel_x={}", self.pixel[0])?;
        writeln!(f, "pixel_y={}", self.pixel[1])?;
        writeln!(f, "pixel_z={}", self.pixel[2])?;
        writeln!(f, "index_unit={}", self.index_unit)?;
        writeln!(f, "bits={}", self.bit_depth)?;
        writeln!(f, "threshold={}", self.binary_threshold)?;
        writeln!(f, "root={}", self.root_path.display())?;
        writeln!(f, "index_source={}", self.source.as_str())
    }
}

/// One labelled fragment of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpecification {
    pub fragment_id: i64,
    /// Ordinal within the owning sample
    pub index: u32,
    pub mask_path: PathBuf,
}

/// Metadata and volume paths for one aligned sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSpecification {
    pub sample_id: i64,
    pub owner: String,
    pub alignment_result_id: i64,
    pub space: String,
    pub aligned_stack_id: i64,
    pub ncc_score: f64,
    pub neuron_separation_id: i64,
    pub consolidated_label_path: Option<PathBuf>,
    pub consolidated_signal_path: PathBuf,
    pub fragments: Vec<FragmentSpecification>,
}

impl SampleSpecification {
    /// Parse every sample record in `text`, sorted by ascending sample id.
    pub fn parse_all(text: &str, origin: &Path) -> Result<Vec<Self>> {
        let mut samples = Self::parse_records(text, origin)?;
        samples.sort_by_key(|s| s.sample_id);
        Ok(samples)
    }

    /// Sample records in file order.
    fn parse_records(text: &str, origin: &Path) -> Result<Vec<Self>> {
        let mut drafts: Vec<SampleDraft> = Vec::new();

        for line in KeyValueLines::new(text) {
            let line = line?;
            if line.key == "sampleId" {
                drafts.push(SampleDraft {
                    sample_id: Some(line.parse()?),
                    ..Default::default()
                });
                continue;
            }

            if drafts.is_empty() {
                drafts.push(SampleDraft::default());
            }
            let Some(draft) = drafts.last_mut() else {
                continue;
            };

            match line.key {
                "owner" => draft.owner = line.value.to_string(),
                "alignmentResultId" | "aligmentResultId" => {
                    draft.alignment_result_id = line.parse()?
                }
                "space" => draft.space = Some(line.value.to_string()),
                "alignedStackId" => draft.aligned_stack_id = line.parse()?,
                "nccScore" => draft.ncc_score = line.parse()?,
                "neuronSeparationId" | "neuronSeparationid" => {
                    draft.neuron_separation_id = line.parse()?
                }
                "consolidatedLabelPath" => {
                    draft.consolidated_label_path = Some(resolve_path(origin, line.value))
                }
                "consolidatedSignalPath" => {
                    draft.consolidated_signal_path = Some(resolve_path(origin, line.value))
                }
                "fragmentId" => draft.fragments.push(FragmentDraft {
                    fragment_id: line.parse()?,
                    index: None,
                    mask_path: None,
                }),
                "index" | "maskPath" => {
                    let fragment = draft.fragments.last_mut().ok_or_else(|| line.malformed())?;
                    if line.key == "index" {
                        fragment.index = Some(line.parse()?);
                    } else {
                        fragment.mask_path = Some(resolve_path(origin, line.value));
                    }
                }
                other => debug!(key = other, "Ignoring unknown sample specification key"),
            }
        }

        drafts
            .into_iter()
            .map(|draft| draft.finish(origin))
            .collect()
    }

    /// Parse the first sample record in `text`, in file order.
    pub fn parse_str(text: &str, origin: &Path) -> Result<Self> {
        Self::parse_records(text, origin)?
            .into_iter()
            .next()
            .ok_or_else(|| VolumeIndexError::MissingField {
                field: "sampleId",
                source_path: origin.to_path_buf(),
            })
    }
}

impl fmt::Display for SampleSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sampleId={}", self.sample_id)?;
        writeln!(f, "owner={}", self.owner)?;
        writeln!(f, "alignmentResultId={}", self.alignment_result_id)?;
        writeln!(f, "space={}", self.space)?;
        writeln!(f, "alignedStackId={}", self.aligned_stack_id)?;
        writeln!(f, "nccScore={}", self.ncc_score)?;
        writeln!(f, "neuronSeparationId={}", self.neuron_separation_id)?;
        if let Some(label) = &self.consolidated_label_path {
            writeln!(f, "consolidatedLabelPath={}", label.display())?;
        }
        writeln!(
            f,
            "consolidatedSignalPath={}",
            self.consolidated_signal_path.display()
        )?;
        for fragment in &self.fragments {
            writeln!(f, "fragmentId={}", fragment.fragment_id)?;
            writeln!(f, "index={}", fragment.index)?;
            writeln!(f, "maskPath={}", fragment.mask_path.display())?;
        }
        Ok(())
    }
}

/// Read and parse an index specification file.
pub fn parse_index_specification(path: &Path) -> Result<IndexSpecification> {
    let text = std::fs::read_to_string(path)?;
    IndexSpecification::parse_str(&text, path)
}

/// Read and parse the first sample record, in file order, of a sample
/// specification file.
pub fn parse_sample_specification(path: &Path) -> Result<SampleSpecification> {
    let text = std::fs::read_to_string(path)?;
    SampleSpecification::parse_str(&text, path)
}

/// Read and parse every sample in a sample specification file.
pub fn parse_sample_specifications(path: &Path) -> Result<Vec<SampleSpecification>> {
    let text = std::fs::read_to_string(path)?;
    SampleSpecification::parse_all(&text, path)
}

#[derive(Default)]
struct SampleDraft {
    sample_id: Option<i64>,
    owner: String,
    alignment_result_id: i64,
    space: Option<String>,
    aligned_stack_id: i64,
    ncc_score: f64,
    neuron_separation_id: i64,
    consolidated_label_path: Option<PathBuf>,
    consolidated_signal_path: Option<PathBuf>,
    fragments: Vec<FragmentDraft>,
}

struct FragmentDraft {
    fragment_id: i64,
    index: Option<u32>,
    mask_path: Option<PathBuf>,
}

impl SampleDraft {
    fn finish(self, origin: &Path) -> Result<SampleSpecification> {
        let missing = |field| VolumeIndexError::MissingField {
            field,
            source_path: origin.to_path_buf(),
        };

        let fragments = self
            .fragments
            .into_iter()
            .enumerate()
            .map(|(position, fragment)| {
                Ok(FragmentSpecification {
                    fragment_id: fragment.fragment_id,
                    index: fragment.index.unwrap_or(position as u32),
                    mask_path: fragment.mask_path.ok_or_else(|| missing("maskPath"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SampleSpecification {
            sample_id: self.sample_id.ok_or_else(|| missing("sampleId"))?,
            owner: self.owner,
            alignment_result_id: self.alignment_result_id,
            space: self.space.ok_or_else(|| missing("space"))?,
            aligned_stack_id: self.aligned_stack_id,
            ncc_score: self.ncc_score,
            neuron_separation_id: self.neuron_separation_id,
            consolidated_label_path: self.consolidated_label_path,
            consolidated_signal_path: self
                .consolidated_signal_path
                .ok_or_else(|| missing("consolidatedSignalPath"))?,
            fragments,
        })
    }
}

/// A single `key=value` line with its position in the file.
struct KeyValueLine<'a> {
    number: usize,
    raw: &'a str,
    key: &'a str,
    value: &'a str,
}

impl KeyValueLine<'_> {
    fn malformed(&self) -> VolumeIndexError {
        VolumeIndexError::MalformedValue {
            field: self.key.to_string(),
            line_number: self.number,
            line: self.raw.to_string(),
        }
    }

    fn parse<T: FromStr>(&self) -> Result<T> {
        self.value.parse().map_err(|_| self.malformed())
    }
}

struct KeyValueLines<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl<'a> KeyValueLines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate(),
        }
    }
}

impl<'a> Iterator for KeyValueLines<'a> {
    type Item = Result<KeyValueLine<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        for (index, raw) in self.lines.by_ref() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let number = index + 1;
            return Some(match trimmed.split_once('=') {
                Some((key, value)) => Ok(KeyValueLine {
                    number,
                    raw: trimmed,
                    key: key.trim(),
                    value: value.trim(),
                }),
                None => Err(VolumeIndexError::MalformedValue {
                    field: trimmed.to_string(),
                    line_number: number,
                    line: trimmed.to_string(),
                }),
            });
        }
        None
    }
}

fn resolve_path(origin: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    match origin.parent() {
        Some(base) if path.is_relative() && !base.as_os_str().is_empty() => base.join(path),
        _ => path,
    }
}
