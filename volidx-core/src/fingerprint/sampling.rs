//! Block-max subsampling and threshold binarization.
//!
//! Each output voxel `(i, j, k)` of [`subsample`] is the maximum of the
//! `unit³` block starting at `(i·unit, j·unit, k·unit)`, so a single bright
//! voxel survives reduction.
//! Output extent along each axis is `floor(dim / unit)`; voxels in a trailing
//! partial block are dropped, never padded.

use tracing::debug;

use crate::error::{Result, VolumeIndexError};
use crate::spec::IndexSpecification;
use crate::volume::{validate_image_size, Dims, VoxelBuffer};

use super::binary::Fingerprint;

/// Output extent of one axis after subsampling, truncating the remainder.
pub fn divide_dimension_by_unit(size: usize, unit: usize) -> usize {
    if unit == 0 {
        0
    } else {
        size / unit
    }
}

/// Reduce the spatial extent of `buffer` by `unit`, keeping the brightest
/// voxel of each block. Channels are reduced independently.
pub fn subsample(buffer: &VoxelBuffer, unit: usize) -> Result<VoxelBuffer> {
    if unit == 0 {
        return Err(VolumeIndexError::InvalidSpecification(
            "subsampling unit must be at least 1".into(),
        ));
    }
    if unit == 1 {
        return Ok(buffer.clone());
    }

    let src = buffer.dims();
    let out_dims = Dims::new(
        divide_dimension_by_unit(src.x, unit),
        divide_dimension_by_unit(src.y, unit),
        divide_dimension_by_unit(src.z, unit),
        src.c,
    );
    let mut out = VoxelBuffer::zeroed(out_dims, buffer.bit_depth())?;

    for c in 0..src.c {
        for z in 0..out_dims.z * unit {
            let zo = z / unit;
            for y in 0..out_dims.y * unit {
                let yo = y / unit;
                for xo in 0..out_dims.x {
                    let block_max = (xo * unit..(xo + 1) * unit)
                        .map(|x| buffer.get(x, y, z, c))
                        .max()
                        .unwrap_or(0);
                    if block_max > out.get(xo, yo, zo, c) {
                        out.set(xo, yo, zo, c, block_max);
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Pack one bit per voxel: set iff the brightest channel exceeds `threshold`.
///
/// An intensity equal to the threshold yields a clear bit.
pub fn binarize(buffer: &VoxelBuffer, threshold: u32) -> Fingerprint {
    let dims = buffer.dims();
    let mut fingerprint = Fingerprint::zeroed(dims.spatial_len() as u64);
    for c in 0..dims.c {
        for (p, &v) in buffer.channel(c).iter().enumerate() {
            if u32::from(v) > threshold {
                fingerprint.set(p as u64);
            }
        }
    }
    fingerprint
}

/// Subsample then binarize, the way the index was built.
pub fn subsample_and_threshold(
    buffer: &VoxelBuffer,
    unit: usize,
    threshold: u32,
) -> Result<Fingerprint> {
    let reduced = subsample(buffer, unit)?;
    Ok(binarize(&reduced, threshold))
}

/// Fingerprint a volume under an index specification.
///
/// Validates the volume size first; the result always has
/// `spec.fingerprint_bits()` bits.
pub fn fingerprint_volume(
    buffer: &VoxelBuffer,
    spec: &IndexSpecification,
    threshold: u32,
) -> Result<Fingerprint> {
    validate_image_size(buffer, spec)?;
    let fingerprint = subsample_and_threshold(buffer, spec.index_unit as usize, threshold)?;
    debug!(
        bits = fingerprint.bit_len(),
        set = fingerprint.count_ones(),
        "Computed fingerprint"
    );
    Ok(fingerprint)
}
