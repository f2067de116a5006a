//! The consolidated (second-stage) index.
//!
//! One file per index root holding a header and fixed-size records, see
//! [`format`]. Readers take a snapshot by reading the header once at open.
//! Writers serialize through an [`IndexLock`] and never modify the live file:
//! every append writes a complete new file next to it and renames it into
//! place, so a failed or interrupted append leaves the previous index intact.

pub mod format;
pub mod lock;

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::entry::{IndexEntry, IndexLayout};
use crate::error::{Result, VolumeIndexError};

pub use format::{decode_record, encode_record, IndexHeader, INDEX_MAGIC};
pub use lock::IndexLock;

/// Read handle on a consolidated index file.
#[derive(Debug)]
pub struct ConsolidatedIndex {
    path: PathBuf,
    header: IndexHeader,
    reader: BufReader<File>,
}

impl ConsolidatedIndex {
    /// Open an index and check that its length agrees with its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = IndexHeader::read_from(&mut reader)?;

        let expected = header.expected_file_len().ok_or_else(|| {
            VolumeIndexError::IndexCorruption(format!(
                "entry count {} overflows the file size",
                header.entry_count
            ))
        })?;
        if expected != file_len {
            return Err(VolumeIndexError::IndexCorruption(format!(
                "{} declares {} entries ({expected} bytes) but holds {file_len} bytes",
                path.display(),
                header.entry_count
            )));
        }

        debug!(
            path = %path.display(),
            entries = header.entry_count,
            fingerprint_len = header.fingerprint_len,
            "Opened consolidated index"
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn len(&self) -> u64 {
        self.header.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.header.entry_count == 0
    }

    /// Iterate over every record in file order.
    ///
    /// Damaged records yield an `Err` and iteration continues; an I/O error
    /// ends the iteration after being yielded.
    pub fn entries(&mut self) -> Result<Entries<'_>> {
        self.reader
            .seek(SeekFrom::Start(self.header.record_offset(0)))?;
        Ok(Entries {
            record: vec![0; self.header.record_len()],
            remaining: self.header.entry_count,
            index: self,
        })
    }

    /// Read record `index` by seeking directly to it.
    pub fn read_entry(&mut self, index: u64) -> Result<IndexEntry> {
        if index >= self.header.entry_count {
            return Err(VolumeIndexError::IndexCorruption(format!(
                "entry {index} is out of range ({} entries)",
                self.header.entry_count
            )));
        }
        self.reader
            .seek(SeekFrom::Start(self.header.record_offset(index)))?;
        let mut record = vec![0; self.header.record_len()];
        self.reader.read_exact(&mut record)?;
        decode_record(&record, &self.header)
    }

    /// Read every record, failing on the first damaged one.
    pub fn read_all(&mut self) -> Result<Vec<IndexEntry>> {
        self.entries()?.collect()
    }
}

/// Sequential record iterator returned by [`ConsolidatedIndex::entries`].
pub struct Entries<'a> {
    index: &'a mut ConsolidatedIndex,
    record: Vec<u8>,
    remaining: u64,
}

impl Iterator for Entries<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if let Err(e) = self.index.reader.read_exact(&mut self.record) {
            self.remaining = 0;
            return Some(Err(e.into()));
        }
        Some(decode_record(&self.record, &self.index.header))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// What an append changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendSummary {
    /// New sample ids added at the end
    pub appended: usize,
    /// Existing sample ids whose record was replaced in place
    pub replaced: usize,
    /// Entries in the index after the append
    pub total: u64,
}

/// Merge `entries` into the consolidated index at `index_path`.
///
/// Creates the index (and its directory) if absent. A sample id already in
/// the index has its record replaced in place; new ids are appended in the
/// order given, and when the same id appears twice in `entries` the last one
/// wins. The index is rewritten to a temporary file and renamed over the old
/// one under an exclusive lock, so the header's entry count always matches the
/// records on disk.
pub fn append_to_consolidated_index(
    entries: &[IndexEntry],
    layout: &IndexLayout,
    index_path: &Path,
    config: &IndexConfig,
) -> Result<AppendSummary> {
    let parent = index_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let _lock = IndexLock::acquire(index_path, config.lock_timeout, config.lock_poll_interval)?;

    let mut existing = if index_path.exists() {
        let index = ConsolidatedIndex::open(index_path)?;
        if index.header().layout.space != layout.space {
            return Err(VolumeIndexError::IncompatibleIndex(format!(
                "{} indexes space '{}', not '{}'",
                index_path.display(),
                index.header().layout.space,
                layout.space
            )));
        }
        index.header().layout.check_compatible(layout)?;
        Some(index)
    } else {
        None
    };

    let mut header = match &existing {
        Some(index) => index.header().clone(),
        None => IndexHeader::new(layout.clone())?,
    };

    // Last occurrence of each sample id in the batch.
    let latest: HashMap<i64, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.sample_id, i))
        .collect();
    let mut encoded: HashMap<i64, Vec<u8>> = HashMap::with_capacity(latest.len());
    for (&sample_id, &i) in &latest {
        encoded.insert(sample_id, encode_record(&entries[i], header.fingerprint_len)?);
    }

    let temp_path = temp_path_for(index_path);
    let result = write_merged(
        &temp_path,
        &mut header,
        existing.as_mut(),
        entries,
        &latest,
        &encoded,
    )
    .and_then(|summary| {
        std::fs::rename(&temp_path, index_path)?;
        sync_dir(parent)?;
        Ok(summary)
    });

    match result {
        Ok(summary) => {
            info!(
                path = %index_path.display(),
                appended = summary.appended,
                replaced = summary.replaced,
                total = summary.total,
                "Updated consolidated index"
            );
            Ok(summary)
        }
        Err(e) => {
            if temp_path.exists() {
                if let Err(cleanup) = std::fs::remove_file(&temp_path) {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp index");
                }
            }
            Err(e)
        }
    }
}

fn write_merged(
    temp_path: &Path,
    header: &mut IndexHeader,
    existing: Option<&mut ConsolidatedIndex>,
    entries: &[IndexEntry],
    latest: &HashMap<i64, usize>,
    encoded: &HashMap<i64, Vec<u8>>,
) -> Result<AppendSummary> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)?;
    let mut writer = BufWriter::new(file);

    // Provisional header; rewritten with the final count once records are out.
    header.write_to(&mut writer)?;

    let mut summary = AppendSummary::default();
    let mut written: HashSet<i64> = HashSet::new();
    let mut count = 0u64;

    if let Some(index) = existing {
        let record_len = index.header().record_len();
        let old_count = index.header().entry_count;
        let start = index.header().record_offset(0);
        index.reader.seek(SeekFrom::Start(start))?;
        let mut record = vec![0u8; record_len];
        for _ in 0..old_count {
            index.reader.read_exact(&mut record)?;
            let replacement = format::record_sample_id(&record)
                .filter(|id| !written.contains(id))
                .and_then(|id| encoded.get(&id).map(|bytes| (id, bytes)));
            match replacement {
                Some((id, bytes)) => {
                    writer.write_all(bytes)?;
                    written.insert(id);
                    summary.replaced += 1;
                }
                None => writer.write_all(&record)?,
            }
            count += 1;
        }
    }

    for (i, entry) in entries.iter().enumerate() {
        if latest.get(&entry.sample_id) != Some(&i) || written.contains(&entry.sample_id) {
            continue;
        }
        if let Some(bytes) = encoded.get(&entry.sample_id) {
            writer.write_all(bytes)?;
            written.insert(entry.sample_id);
            summary.appended += 1;
            count += 1;
        }
    }

    header.entry_count = count;
    summary.total = count;

    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;
    header.write_to(&mut file)?;
    file.sync_all()?;
    Ok(summary)
}

fn temp_path_for(index_path: &Path) -> PathBuf {
    let mut name = index_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use std::time::Duration;
    use tempfile::TempDir;

    fn layout() -> IndexLayout {
        IndexLayout {
            space: "JFRC2010".into(),
            pixel: [8, 8, 8],
            index_unit: 2,
            bit_depth: 8,
            binary_threshold: 20,
        }
    }

    fn entry(sample_id: i64, bits: &[u64]) -> IndexEntry {
        let mut fingerprint = Fingerprint::zeroed(layout().fingerprint_bits().unwrap());
        for &b in bits {
            fingerprint.set(b);
        }
        IndexEntry {
            sample_id,
            owner: format!("owner{sample_id}"),
            alignment_result_id: sample_id * 10,
            ncc_score: 0.5,
            fingerprint,
        }
    }

    fn config() -> IndexConfig {
        IndexConfig {
            lock_timeout: Duration::from_millis(100),
            lock_poll_interval: Duration::from_millis(5),
            ..IndexConfig::default()
        }
    }

    #[test]
    fn test_append_creates_index_and_reads_back_in_order() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("consolidated.vidx");
        let written = vec![entry(3, &[1]), entry(1, &[2, 40]), entry(2, &[63])];

        let summary = append_to_consolidated_index(&written, &layout(), &path, &config()).unwrap();
        assert_eq!(summary.appended, 3);
        assert_eq!(summary.total, 3);

        let mut index = ConsolidatedIndex::open(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.read_all().unwrap(), written);
        assert_eq!(index.read_entry(1).unwrap(), written[1]);
        assert!(!IndexLock::lock_path(&path).exists());
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_second_append_extends_and_replaces() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("consolidated.vidx");
        append_to_consolidated_index(&[entry(1, &[0]), entry(2, &[1])], &layout(), &path, &config())
            .unwrap();

        let summary =
            append_to_consolidated_index(&[entry(2, &[5]), entry(4, &[6])], &layout(), &path, &config())
                .unwrap();
        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.appended, 1);
        assert_eq!(summary.total, 3);

        let all = ConsolidatedIndex::open(&path).unwrap().read_all().unwrap();
        let ids: Vec<i64> = all.iter().map(|e| e.sample_id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
        assert!(all[1].fingerprint.get(5));
        assert!(!all[1].fingerprint.get(1));
    }

    #[test]
    fn test_duplicate_ids_in_batch_keep_last() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("consolidated.vidx");
        append_to_consolidated_index(&[entry(7, &[1]), entry(7, &[2])], &layout(), &path, &config())
            .unwrap();
        let all = ConsolidatedIndex::open(&path).unwrap().read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].fingerprint.get(2));
    }

    #[test]
    fn test_truncated_file_is_corruption_and_blocks_append() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("consolidated.vidx");
        append_to_consolidated_index(&[entry(1, &[0]), entry(2, &[1])], &layout(), &path, &config())
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 10);
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            ConsolidatedIndex::open(&path),
            Err(VolumeIndexError::IndexCorruption(_))
        ));
        assert!(matches!(
            append_to_consolidated_index(&[entry(3, &[2])], &layout(), &path, &config()),
            Err(VolumeIndexError::IndexCorruption(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_incompatible_layout_leaves_index_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("consolidated.vidx");
        append_to_consolidated_index(&[entry(1, &[0])], &layout(), &path, &config()).unwrap();
        let before = std::fs::read(&path).unwrap();

        let mut other = layout();
        other.index_unit = 4;
        let mut small = entry(2, &[]);
        small.fingerprint = Fingerprint::zeroed(other.fingerprint_bits().unwrap());
        assert!(matches!(
            append_to_consolidated_index(&[small], &other, &path, &config()),
            Err(VolumeIndexError::IncompatibleIndex(_))
        ));

        let mut other_space = layout();
        other_space.space = "JRC2018".into();
        assert!(matches!(
            append_to_consolidated_index(&[entry(3, &[1])], &other_space, &path, &config()),
            Err(VolumeIndexError::IncompatibleIndex(_))
        ));

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_damaged_record_is_skippable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("consolidated.vidx");
        append_to_consolidated_index(&[entry(1, &[0]), entry(2, &[1])], &layout(), &path, &config())
            .unwrap();

        let mut index = ConsolidatedIndex::open(&path).unwrap();
        let offset = index.header().record_offset(0) as usize + 30;
        drop(index);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[offset] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        index = ConsolidatedIndex::open(&path).unwrap();
        let results: Vec<_> = index.entries().unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(VolumeIndexError::IndexCorruption(_))));
        assert_eq!(results[1].as_ref().unwrap().sample_id, 2);
    }

    #[test]
    fn test_held_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("consolidated.vidx");
        let _held = IndexLock::acquire(&path, Duration::from_millis(10), Duration::from_millis(1))
            .unwrap();
        assert!(matches!(
            append_to_consolidated_index(&[entry(1, &[0])], &layout(), &path, &config()),
            Err(VolumeIndexError::LockTimeout { .. })
        ));
        assert!(!path.exists());
    }
}
