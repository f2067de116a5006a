//! Volumes assembled from 2D image planes.
//!
//! A directory is read as a Z stack: every PNG or TIFF file in it, sorted by
//! file name, becomes one plane. A single image file becomes a one-plane
//! volume. Colour images are reduced to luma; 16-bit images keep their depth.

use std::path::{Path, PathBuf};

use image::{ColorType, DynamicImage};
use tracing::debug;

use crate::error::{Result, VolumeIndexError};

use super::{Dims, VolumeLoader, VoxelBuffer};

const SLICE_EXTENSIONS: [&str; 3] = ["png", "tif", "tiff"];

/// Loads slice directories and single 2D images.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceStackLoader;

impl VolumeLoader for SliceStackLoader {
    fn load(&self, path: &Path) -> Result<VoxelBuffer> {
        let planes = if path.is_dir() {
            list_slices(path)?
        } else {
            vec![path.to_path_buf()]
        };
        if planes.is_empty() {
            return Err(VolumeIndexError::Load(format!(
                "{} contains no image slices",
                path.display()
            )));
        }

        let mut buffer: Option<VoxelBuffer> = None;
        for (z, plane_path) in planes.iter().enumerate() {
            let image = image::open(plane_path).map_err(|e| {
                VolumeIndexError::Load(format!("{}: {e}", plane_path.display()))
            })?;
            let bit_depth = luma_depth(&image);
            let (width, height) = (image.width() as usize, image.height() as usize);

            if buffer.is_none() {
                buffer = Some(VoxelBuffer::zeroed(
                    Dims::new(width, height, planes.len(), 1),
                    bit_depth,
                )?);
            }
            let Some(target) = buffer.as_mut() else {
                continue;
            };
            let dims = target.dims();
            if (dims.x, dims.y) != (width, height) || target.bit_depth() != bit_depth {
                return Err(VolumeIndexError::Load(format!(
                    "slice {} is {width}x{height} at {bit_depth} bits, expected {}x{} at {} bits",
                    plane_path.display(),
                    dims.x,
                    dims.y,
                    target.bit_depth()
                )));
            }

            let plane_len = width * height;
            let plane = &mut target.data[z * plane_len..(z + 1) * plane_len];
            if bit_depth == 16 {
                plane.copy_from_slice(image.to_luma16().as_raw());
            } else {
                for (dst, &v) in plane.iter_mut().zip(image.to_luma8().as_raw().iter()) {
                    *dst = u16::from(v);
                }
            }
        }

        let buffer = buffer.ok_or_else(|| {
            VolumeIndexError::Load(format!("{} produced no planes", path.display()))
        })?;
        debug!(path = %path.display(), dims = %buffer.dims(), "Loaded slice stack");
        Ok(buffer)
    }
}

fn list_slices(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut slices = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| listing_error(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| listing_error(dir, e))?.path();
        let is_slice = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SLICE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_slice && path.is_file() {
            slices.push(path);
        }
    }
    slices.sort();
    Ok(slices)
}

/// A slice directory that cannot be listed fails only the sample it belongs to.
fn listing_error(dir: &Path, e: std::io::Error) -> VolumeIndexError {
    VolumeIndexError::Load(format!("{}: {e}", dir.display()))
}

fn luma_depth(image: &DynamicImage) -> u8 {
    match image.color() {
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => 16,
        _ => 8,
    }
}
