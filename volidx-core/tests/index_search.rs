//! End-to-end tests for building, merging, and searching an index.
//!
//! Volumes are written to disk as Vaa3D raw stacks so the loader, the
//! fingerprint pipeline, and the consolidated index file are all exercised.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use volidx_core::volume::write_v3draw;
use volidx_core::{
    append_to_consolidated_index, parse_index_specification, parse_sample_specifications,
    search_query_file, ConsolidatedIndex, DefaultVolumeLoader, Dims, IndexBuilder, IndexConfig,
    IndexLayout, IndexSpecification, SampleIndexFile, VolumeIndexError, VoxelBuffer,
};

/// Bright cluster intensity in sample signal volumes.
const SIGNAL: u16 = 200;

/// Write `key=value` spec text for a 100x100x50 index rooted at `root`.
fn write_index_spec(dir: &Path, root: &str) -> PathBuf {
    let path = dir.join("index.spec");
    fs::write(
        &path,
        format!(
            "# test index\nspace=JFRC2010\noptical_x=0.62\noptical_y=0.62\noptical_z=1.0\n\
             pixel_x=100\npixel_y=100\npixel_z=50\nindex_unit=2\nbits=8\nthreshold=20\nroot={root}\n"
        ),
    )
    .unwrap();
    path
}

/// 100x100x50 8-bit volume, zero except for a 4x4x4 cluster at `origin`.
fn cluster_volume(origin: [usize; 3], value: u16) -> VoxelBuffer {
    let mut buffer = VoxelBuffer::zeroed(Dims::new(100, 100, 50, 1), 8).unwrap();
    buffer.fill_region(origin, [4, 4, 4], 0, value);
    buffer
}

fn write_volume(dir: &Path, name: &str, buffer: &VoxelBuffer) -> PathBuf {
    let path = dir.join(name);
    write_v3draw(&path, buffer).unwrap();
    path
}

fn sample_record(sample_id: i64, space: &str, signal: &str) -> String {
    format!(
        "sampleId={sample_id}\nowner=nerna\nalignmentResultId={}\nspace={space}\n\
         alignedStackId=7\nnccScore=0.81\nneuronSeparationId=3\nconsolidatedSignalPath={signal}\n",
        sample_id * 100
    )
}

/// Parse specs, build every sample, and merge them into the index.
fn build_index(dir: &Path, samples_text: &str) -> (IndexSpecification, IndexConfig) {
    let spec = parse_index_specification(&write_index_spec(dir, "index")).unwrap();
    let samples_path = dir.join("samples.spec");
    fs::write(&samples_path, samples_text).unwrap();
    let samples = parse_sample_specifications(&samples_path).unwrap();

    let config = IndexConfig::default();
    let (file, report) = IndexBuilder::new(&spec, DefaultVolumeLoader)
        .build_sample_index_file(&samples)
        .unwrap();
    assert!(report.skipped.is_empty(), "unexpected skips: {:?}", report.skipped);

    // Through the sample index file, as the CLI does between modes
    let sample_index = dir.join("samples.vsi");
    file.write_to_path(&sample_index).unwrap();
    let file = SampleIndexFile::read_from_path(&sample_index).unwrap();

    append_to_consolidated_index(
        &file.entries,
        &file.layout,
        &config.index_path(&spec.root_path),
        &config,
    )
    .unwrap();
    (spec, config)
}

#[test]
fn test_cluster_query_finds_its_sample_first() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    write_volume(dir, "a.v3draw", &cluster_volume([40, 40, 20], SIGNAL));
    let (spec, config) = build_index(dir, &sample_record(1, "JFRC2010", "a.v3draw"));

    // The query is a mask of just the cluster
    let query = write_volume(dir, "query.v3draw", &cluster_volume([40, 40, 20], 255));
    let hits = search_query_file(&query, &spec, DefaultVolumeLoader, 10, &config).unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].sample_id, 1);
    assert!(hits[0].score > 0.9, "score was {}", hits[0].score);
    assert_eq!(hits[0].owner, "nerna");
}

#[test]
fn test_self_match_scores_one_at_rank_zero() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let a = cluster_volume([11, 13, 17], SIGNAL);
    write_volume(dir, "a.v3draw", &a);
    write_volume(dir, "b.v3draw", &cluster_volume([70, 70, 40], SIGNAL));
    let samples = sample_record(1, "JFRC2010", "a.v3draw") + &sample_record(2, "JFRC2010", "b.v3draw");
    let (spec, config) = build_index(dir, &samples);

    let hits = volidx_core::search(&a, &spec, &spec.root_path, 10, &config).unwrap();
    assert_eq!(hits[0].sample_id, 1);
    assert_eq!(hits[0].score, 1.0);
}

#[test]
fn test_disjoint_clusters_rank_matching_sample_above_other() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    write_volume(dir, "a.v3draw", &cluster_volume([10, 10, 10], SIGNAL));
    write_volume(dir, "b.v3draw", &cluster_volume([60, 60, 30], SIGNAL));
    // B has the smaller id so a tie would put it first
    let samples = sample_record(5, "JFRC2010", "a.v3draw") + &sample_record(2, "JFRC2010", "b.v3draw");
    let (spec, config) = build_index(dir, &samples);

    let query = write_volume(dir, "query.v3draw", &cluster_volume([10, 10, 10], SIGNAL));
    let hits = search_query_file(&query, &spec, DefaultVolumeLoader, 10, &config).unwrap();
    let ids: Vec<i64> = hits.iter().map(|h| h.sample_id).collect();
    assert_eq!(ids, vec![5, 2]);
    assert!(hits[0].score > hits[1].score);
}

#[test]
fn test_results_sorted_and_bounded_by_max_hits() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let mut samples = String::new();
    for id in 1..=6i64 {
        let origin = [(id as usize) * 12, 20, 10];
        write_volume(dir, &format!("s{id}.v3draw"), &cluster_volume(origin, SIGNAL));
        samples += &sample_record(id, "JFRC2010", &format!("s{id}.v3draw"));
    }
    let (spec, config) = build_index(dir, &samples);

    let query = write_volume(dir, "query.v3draw", &cluster_volume([36, 20, 10], SIGNAL));
    let hits = search_query_file(&query, &spec, DefaultVolumeLoader, 4, &config).unwrap();

    assert_eq!(hits.len(), 4);
    assert_eq!(hits[0].sample_id, 3);
    for pair in hits.windows(2) {
        assert!(
            pair[0].score > pair[1].score
                || (pair[0].score == pair[1].score && pair[0].sample_id < pair[1].sample_id)
        );
    }
}

#[test]
fn test_consolidated_index_round_trips_in_written_order() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    for id in [3i64, 1, 2] {
        let origin = [(id as usize) * 20, 0, 0];
        write_volume(dir, &format!("s{id}.v3draw"), &cluster_volume(origin, SIGNAL));
    }
    let spec = parse_index_specification(&write_index_spec(dir, "index")).unwrap();
    let config = IndexConfig::default();
    let index_path = config.index_path(&spec.root_path);
    let builder = IndexBuilder::new(&spec, DefaultVolumeLoader);

    // Three separate appends, one sample each
    let mut written = Vec::new();
    for id in [3i64, 1, 2] {
        let samples_path = dir.join(format!("s{id}.spec"));
        fs::write(&samples_path, sample_record(id, "JFRC2010", &format!("s{id}.v3draw"))).unwrap();
        let samples = parse_sample_specifications(&samples_path).unwrap();
        let report = builder.build_samples(&samples).unwrap();
        append_to_consolidated_index(&report.entries, &IndexLayout::from_spec(&spec), &index_path, &config)
            .unwrap();
        written.extend(report.entries);
    }

    let mut index = ConsolidatedIndex::open(&index_path).unwrap();
    let read: Vec<(i64, Vec<u8>)> = index
        .read_all()
        .unwrap()
        .into_iter()
        .map(|e| (e.sample_id, e.fingerprint.into_bytes()))
        .collect();
    let expected: Vec<(i64, Vec<u8>)> = written
        .into_iter()
        .map(|e| (e.sample_id, e.fingerprint.into_bytes()))
        .collect();
    assert_eq!(read, expected);
    assert_eq!(index.header().layout, IndexLayout::from_spec(&spec));
}

#[test]
fn test_other_space_never_reaches_the_index() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    write_volume(dir, "a.v3draw", &cluster_volume([0, 0, 0], SIGNAL));
    write_volume(dir, "b.v3draw", &cluster_volume([50, 50, 20], SIGNAL));
    let samples = sample_record(1, "JFRC2010", "a.v3draw") + &sample_record(2, "JRC2018_UNISEX", "b.v3draw");
    let (spec, config) = build_index(dir, &samples);

    let mut index = ConsolidatedIndex::open(&config.index_path(&spec.root_path)).unwrap();
    let ids: Vec<i64> = index.read_all().unwrap().iter().map(|e| e.sample_id).collect();
    assert_eq!(ids, vec![1]);
}

#[test]
fn test_query_of_wrong_size_is_dimension_mismatch() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    write_volume(dir, "a.v3draw", &cluster_volume([0, 0, 0], SIGNAL));
    let (spec, config) = build_index(dir, &sample_record(1, "JFRC2010", "a.v3draw"));

    let small = VoxelBuffer::zeroed(Dims::new(50, 50, 25, 1), 8).unwrap();
    let query = write_volume(dir, "small.v3draw", &small);
    assert!(matches!(
        search_query_file(&query, &spec, DefaultVolumeLoader, 10, &config),
        Err(VolumeIndexError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_missing_pixel_x_is_missing_field() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("broken.spec");
    fs::write(
        &path,
        "space=JFRC2010\npixel_y=100\npixel_z=50\nindex_unit=2\nbits=8\nthreshold=20\nroot=index\n",
    )
    .unwrap();

    match parse_index_specification(&path) {
        Err(VolumeIndexError::MissingField { field, .. }) => assert_eq!(field, "pixel_x"),
        other => panic!("expected MissingField, got {other:?}"),
    }
}
