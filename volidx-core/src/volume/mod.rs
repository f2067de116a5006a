//! Voxel buffers and the loaders that produce them.
//!
//! The indexing core only needs a 4D (x, y, z, channel) intensity buffer with
//! known dimensions. Where that buffer comes from is behind the
//! [`VolumeLoader`] trait:
//!
//! - **Vaa3D raw stacks** (`.v3draw`, `.raw`) via [`V3dRawLoader`]
//! - **2D image slices** (a directory of PNG/TIFF planes, or one image) via
//!   `SliceStackLoader` when the `image-slices` feature is enabled
//! - **In-memory buffers** via [`InMemoryLoader`], for tests and embedding

pub mod memory;
#[cfg(feature = "image-slices")]
pub mod slices;
pub mod v3draw;

use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::error::{Result, VolumeIndexError};
use crate::spec::IndexSpecification;

pub use memory::InMemoryLoader;
#[cfg(feature = "image-slices")]
pub use slices::SliceStackLoader;
pub use v3draw::{write_v3draw, V3dRawLoader};

/// Volume extent along x, y, z and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dims {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub c: usize,
}

impl Dims {
    pub const fn new(x: usize, y: usize, z: usize, c: usize) -> Self {
        Self { x, y, z, c }
    }

    /// Voxels in one channel.
    pub fn spatial_len(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Voxels across all channels, or `None` on overflow.
    pub fn checked_len(&self) -> Option<usize> {
        self.x
            .checked_mul(self.y)?
            .checked_mul(self.z)?
            .checked_mul(self.c)
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}x{}", self.x, self.y, self.z, self.c)
    }
}

/// Owned intensity buffer, x varying fastest, then y, z, channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelBuffer {
    dims: Dims,
    bit_depth: u8,
    data: Vec<u16>,
}

impl VoxelBuffer {
    /// Allocate an all-zero buffer. Allocation failure is reported instead of
    /// aborting so an oversized volume only costs its own sample.
    pub fn zeroed(dims: Dims, bit_depth: u8) -> Result<Self> {
        let len = dims.checked_len().ok_or(VolumeIndexError::Allocation { bytes: usize::MAX })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| VolumeIndexError::Allocation {
                bytes: len.saturating_mul(std::mem::size_of::<u16>()),
            })?;
        data.resize(len, 0);
        Ok(Self {
            dims,
            bit_depth,
            data,
        })
    }

    /// Wrap existing samples; `data.len()` must match `dims`.
    pub fn from_vec(dims: Dims, bit_depth: u8, data: Vec<u16>) -> Result<Self> {
        if dims.checked_len() != Some(data.len()) {
            return Err(VolumeIndexError::Load(format!(
                "buffer holds {} voxels but dimensions {} need {:?}",
                data.len(),
                dims,
                dims.checked_len()
            )));
        }
        Ok(Self {
            dims,
            bit_depth,
            data,
        })
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn data(&self) -> &[u16] {
        &self.data
    }

    /// All voxels of channel `c`.
    pub fn channel(&self, c: usize) -> &[u16] {
        let len = self.dims.spatial_len();
        &self.data[c * len..(c + 1) * len]
    }

    #[inline]
    fn offset(&self, x: usize, y: usize, z: usize, c: usize) -> usize {
        ((c * self.dims.z + z) * self.dims.y + y) * self.dims.x + x
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize, c: usize) -> u16 {
        self.data[self.offset(x, y, z, c)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, c: usize, value: u16) {
        let offset = self.offset(x, y, z, c);
        self.data[offset] = value;
    }

    /// Set every voxel of a box in channel `c`, clipped to the volume.
    pub fn fill_region(&mut self, origin: [usize; 3], size: [usize; 3], c: usize, value: u16) {
        let end = [
            (origin[0] + size[0]).min(self.dims.x),
            (origin[1] + size[1]).min(self.dims.y),
            (origin[2] + size[2]).min(self.dims.z),
        ];
        let width = end[0].saturating_sub(origin[0]);
        if width == 0 {
            return;
        }
        for z in origin[2]..end[2] {
            for y in origin[1]..end[1] {
                let row = self.offset(origin[0], y, z, c);
                self.data[row..row + width].fill(value);
            }
        }
    }
}

/// Source of voxel buffers.
pub trait VolumeLoader {
    fn load(&self, path: &Path) -> Result<VoxelBuffer>;
}

impl<L: VolumeLoader + ?Sized> VolumeLoader for &L {
    fn load(&self, path: &Path) -> Result<VoxelBuffer> {
        (**self).load(path)
    }
}

/// Picks a loader from the shape of the path.
///
/// Directories are read as slice stacks, `.v3draw` and `.raw` files as Vaa3D
/// raw stacks, and anything else as a single 2D image.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVolumeLoader;

impl VolumeLoader for DefaultVolumeLoader {
    fn load(&self, path: &Path) -> Result<VoxelBuffer> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("v3draw" | "raw") if !path.is_dir() => V3dRawLoader.load(path),
            _ => load_image_volume(path),
        }
    }
}

/// Load the volume at `path` with [`DefaultVolumeLoader`].
pub fn load_volume(path: &Path) -> Result<VoxelBuffer> {
    DefaultVolumeLoader.load(path)
}

#[cfg(feature = "image-slices")]
fn load_image_volume(path: &Path) -> Result<VoxelBuffer> {
    SliceStackLoader.load(path)
}

#[cfg(not(feature = "image-slices"))]
fn load_image_volume(path: &Path) -> Result<VoxelBuffer> {
    Err(VolumeIndexError::Load(format!(
        "{} is not a raw stack and image slice support is disabled",
        path.display()
    )))
}

/// Check that a loaded volume has the spatial size the index expects.
pub fn validate_image_size(buffer: &VoxelBuffer, spec: &IndexSpecification) -> Result<()> {
    let actual = buffer.dims();
    let expected = Dims::new(
        spec.pixel[0] as usize,
        spec.pixel[1] as usize,
        spec.pixel[2] as usize,
        actual.c,
    );
    if actual != expected {
        return Err(VolumeIndexError::DimensionMismatch { expected, actual });
    }
    if buffer.bit_depth() != spec.bit_depth {
        debug!(
            volume_bits = buffer.bit_depth(),
            index_bits = spec.bit_depth,
            "Volume bit depth differs from the index specification"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::FingerprintSource;
    use std::path::PathBuf;

    fn spec(pixel: [u32; 3]) -> IndexSpecification {
        IndexSpecification {
            space: "JFRC2010".into(),
            optical: [1.0; 3],
            pixel,
            index_unit: 1,
            bit_depth: 8,
            binary_threshold: 20,
            root_path: PathBuf::from("/tmp/index"),
            source: FingerprintSource::Signal,
        }
    }

    #[test]
    fn test_offset_is_x_fastest() {
        let mut buffer = VoxelBuffer::zeroed(Dims::new(3, 2, 2, 2), 8).unwrap();
        buffer.set(1, 0, 0, 0, 7);
        buffer.set(0, 1, 0, 0, 8);
        buffer.set(0, 0, 1, 0, 9);
        buffer.set(0, 0, 0, 1, 10);
        assert_eq!(buffer.data()[1], 7);
        assert_eq!(buffer.data()[3], 8);
        assert_eq!(buffer.data()[6], 9);
        assert_eq!(buffer.data()[12], 10);
        assert_eq!(buffer.channel(1)[0], 10);
    }

    #[test]
    fn test_fill_region_clips() {
        let mut buffer = VoxelBuffer::zeroed(Dims::new(4, 4, 4, 1), 8).unwrap();
        buffer.fill_region([2, 2, 2], [4, 4, 4], 0, 200);
        let set = buffer.data().iter().filter(|&&v| v == 200).count();
        assert_eq!(set, 8);
        assert_eq!(buffer.get(3, 3, 3, 0), 200);
        assert_eq!(buffer.get(1, 3, 3, 0), 0);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let result = VoxelBuffer::from_vec(Dims::new(2, 2, 2, 1), 8, vec![0; 7]);
        assert!(matches!(result, Err(VolumeIndexError::Load(_))));
    }

    #[test]
    fn test_zeroed_reports_overflow_as_allocation_failure() {
        let dims = Dims::new(usize::MAX, 2, 1, 1);
        assert!(matches!(
            VoxelBuffer::zeroed(dims, 8),
            Err(VolumeIndexError::Allocation { .. })
        ));
    }

    #[test]
    fn test_validate_image_size() {
        let buffer = VoxelBuffer::zeroed(Dims::new(10, 8, 4, 2), 8).unwrap();
        assert!(validate_image_size(&buffer, &spec([10, 8, 4])).is_ok());

        let err = validate_image_size(&buffer, &spec([10, 8, 5])).unwrap_err();
        match err {
            VolumeIndexError::DimensionMismatch { expected, actual } => {
                assert_eq!(expected, Dims::new(10, 8, 5, 2));
                assert_eq!(actual, Dims::new(10, 8, 4, 2));
            }
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_load_volume_dispatches_raw_stacks_by_extension() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut buffer = VoxelBuffer::zeroed(Dims::new(4, 3, 2, 1), 8).unwrap();
        buffer.set(3, 2, 1, 0, 77);
        let path = temp.path().join("stack.v3draw");
        write_v3draw(&path, &buffer).unwrap();

        assert_eq!(load_volume(&path).unwrap(), buffer);
        assert!(matches!(
            load_volume(&temp.path().join("absent.v3draw")),
            Err(VolumeIndexError::Load(_))
        ));
    }
}
