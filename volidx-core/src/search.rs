//! Top-K similarity search over a consolidated index.
//!
//! The query is fingerprinted exactly as samples are at build time, then every
//! record is scored by normalized Hamming similarity while a heap bounded at
//! `max_hits` keeps the best candidates seen so far.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::entry::{IndexEntry, IndexLayout};
use crate::error::{Result, VolumeIndexError};
use crate::fingerprint::{fingerprint_volume, similarity_from_distance, Fingerprint};
use crate::spec::IndexSpecification;
use crate::store::ConsolidatedIndex;
use crate::volume::{VolumeLoader, VoxelBuffer};

/// One ranked match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub sample_id: i64,
    pub owner: String,
    pub alignment_result_id: i64,
    /// Normalized Hamming similarity in `[0, 1]`
    pub score: f64,
}

/// A scored entry. Greater means a better match: more agreeing bits, then the
/// smaller sample id.
#[derive(Debug)]
struct Candidate {
    matching_bits: u64,
    sample_id: i64,
    owner: String,
    alignment_result_id: i64,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.matching_bits
            .cmp(&other.matching_bits)
            .then_with(|| other.sample_id.cmp(&self.sample_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Bounded collection of the best `capacity` candidates.
///
/// A min-heap on match quality: the root is the weakest kept candidate, so a
/// new candidate only has to beat the root to get in.
struct TopHits {
    capacity: usize,
    heap: BinaryHeap<Reverse<Candidate>>,
}

impl TopHits {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.min(1024) + 1),
        }
    }

    fn offer(&mut self, candidate: Candidate) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(candidate));
            return;
        }
        if let Some(Reverse(weakest)) = self.heap.peek() {
            if candidate > *weakest {
                self.heap.pop();
                self.heap.push(Reverse(candidate));
            }
        }
    }

    /// Best first.
    fn into_hits(self, bit_len: u64) -> Vec<SearchHit> {
        // Ascending `Reverse` order is descending match quality.
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(c)| SearchHit {
                sample_id: c.sample_id,
                owner: c.owner,
                alignment_result_id: c.alignment_result_id,
                score: similarity_from_distance(bit_len - c.matching_bits, bit_len),
            })
            .collect()
    }
}

/// Rank `entries` against `query`, keeping at most `max_hits`.
///
/// Damaged records and fingerprints of a different length are logged and
/// skipped. Any other error (an I/O failure mid-scan) aborts the ranking.
pub fn rank_entries<I>(query: &Fingerprint, entries: I, max_hits: usize) -> Result<Vec<SearchHit>>
where
    I: IntoIterator<Item = Result<IndexEntry>>,
{
    let mut top = TopHits::new(max_hits);
    let mut scanned = 0u64;
    let mut skipped = 0u64;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e @ (VolumeIndexError::IndexCorruption(_) | VolumeIndexError::IncompatibleIndex(_))) => {
                warn!(error = %e, "Skipping unreadable index entry");
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let Ok(matching_bits) = query.matching_bits(&entry.fingerprint) else {
            warn!(
                sample_id = entry.sample_id,
                entry_bits = entry.fingerprint.bit_len(),
                query_bits = query.bit_len(),
                "Skipping entry with mismatched fingerprint length"
            );
            skipped += 1;
            continue;
        };

        scanned += 1;
        top.offer(Candidate {
            matching_bits,
            sample_id: entry.sample_id,
            owner: entry.owner,
            alignment_result_id: entry.alignment_result_id,
        });
    }

    debug!(scanned, skipped, max_hits, "Ranked index entries");
    Ok(top.into_hits(query.bit_len()))
}

/// Fingerprint a query volume the same way samples are fingerprinted.
///
/// A query whose size does not match the specification fails with
/// `DimensionMismatch`.
pub fn query_fingerprint(query: &VoxelBuffer, spec: &IndexSpecification) -> Result<Fingerprint> {
    fingerprint_volume(query, spec, spec.binary_threshold)
}

/// Scan the consolidated index at `index_path` for the best matches to a
/// precomputed query fingerprint.
pub fn search_fingerprint(
    query: &Fingerprint,
    spec: &IndexSpecification,
    index_path: &Path,
    max_hits: usize,
) -> Result<Vec<SearchHit>> {
    let mut index = ConsolidatedIndex::open(index_path)?;
    let header_layout = &index.header().layout;
    let expected = IndexLayout::from_spec(spec);

    if header_layout.space != expected.space {
        warn!(
            index_space = %header_layout.space,
            spec_space = %expected.space,
            "Index space differs from the specification"
        );
    }
    if index.header().fingerprint_len as usize != query.len_bytes() {
        warn!(
            index_len = index.header().fingerprint_len,
            query_len = query.len_bytes(),
            entries = index.len(),
            "Index fingerprints do not match the query length; skipping all entries"
        );
        return Ok(Vec::new());
    }
    if let Err(e) = expected.check_compatible(header_layout) {
        warn!(error = %e, "Index layout differs from the specification");
    }

    let entry_count = index.len();
    let hits = rank_entries(query, index.entries()?, max_hits)?;
    info!(
        path = %index_path.display(),
        entries = entry_count,
        hits = hits.len(),
        "Search complete"
    );
    Ok(hits)
}

/// Search the consolidated index under `index_root` with a query volume.
pub fn search(
    query: &VoxelBuffer,
    spec: &IndexSpecification,
    index_root: &Path,
    max_hits: usize,
    config: &IndexConfig,
) -> Result<Vec<SearchHit>> {
    let fingerprint = query_fingerprint(query, spec)?;
    search_fingerprint(&fingerprint, spec, &config.index_path(index_root), max_hits)
}

/// Load the query volume at `query_path` and search the specification's
/// index. The decoded volume is dropped before the scan starts.
pub fn search_query_file<L: VolumeLoader>(
    query_path: &Path,
    spec: &IndexSpecification,
    loader: L,
    max_hits: usize,
    config: &IndexConfig,
) -> Result<Vec<SearchHit>> {
    let fingerprint = {
        let volume = loader.load(query_path)?;
        query_fingerprint(&volume, spec)?
    };
    debug!(
        query = %query_path.display(),
        set_bits = fingerprint.count_ones(),
        "Computed query fingerprint"
    );
    search_fingerprint(
        &fingerprint,
        spec,
        &config.index_path(&spec.root_path),
        max_hits,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(bits: &[u64]) -> Fingerprint {
        let mut fp = Fingerprint::zeroed(16);
        for &bit in bits {
            fp.set(bit);
        }
        fp
    }

    fn entry(sample_id: i64, bits: &[u64]) -> Result<IndexEntry> {
        Ok(IndexEntry {
            sample_id,
            owner: format!("owner{sample_id}"),
            alignment_result_id: 0,
            ncc_score: 0.0,
            fingerprint: fingerprint(bits),
        })
    }

    #[test]
    fn test_ranks_by_score_then_sample_id() {
        let query = fingerprint(&[0, 1, 2, 3]);
        let entries = vec![
            entry(7, &[0, 1]),
            entry(3, &[0, 1, 2, 3]),
            entry(5, &[0, 1]),
            entry(1, &[8, 9]),
        ];

        let hits = rank_entries(&query, entries, 10).unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.sample_id).collect();
        assert_eq!(ids, vec![3, 5, 7, 1]);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].score, 14.0 / 16.0);
        assert_eq!(hits[3].score, 10.0 / 16.0);
    }

    #[test]
    fn test_bounded_to_max_hits() {
        let query = fingerprint(&[0]);
        let entries = (0..50).map(|id| entry(id, &[(id % 16) as u64]));

        let hits = rank_entries(&query, entries, 3).unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.sample_id).collect();
        // Ids 0, 16, 32, 48 match exactly; the smallest three win the tie.
        assert_eq!(ids, vec![0, 16, 32]);

        assert!(rank_entries(&query, vec![entry(1, &[0])], 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_skips_mismatched_and_damaged_entries() {
        let query = fingerprint(&[0]);
        let short = Ok(IndexEntry {
            sample_id: 2,
            owner: String::new(),
            alignment_result_id: 0,
            ncc_score: 0.0,
            fingerprint: Fingerprint::zeroed(8),
        });
        let entries = vec![
            entry(1, &[0]),
            short,
            Err(VolumeIndexError::IndexCorruption("record 2 checksum".into())),
            entry(4, &[1]),
        ];

        let hits = rank_entries(&query, entries, 10).unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.sample_id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_io_error_aborts_ranking() {
        let query = fingerprint(&[0]);
        let entries = vec![
            entry(1, &[0]),
            Err(VolumeIndexError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ))),
        ];
        assert!(matches!(
            rank_entries(&query, entries, 10),
            Err(VolumeIndexError::Io(_))
        ));
    }
}
