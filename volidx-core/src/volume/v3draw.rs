//! Vaa3D raw stack format.
//!
//! Layout: the 24 byte magic `raw_image_stack_by_hpeng`, one endianness byte
//! (`L` or `B`), a u16 datatype (1 = 8-bit, 2 = 16-bit), four dimensions
//! (x, y, z, channel) stored either as u32 or, in older files, as u16, then
//! the samples with x varying fastest.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{Result, VolumeIndexError};

use super::{Dims, VolumeLoader, VoxelBuffer};

const MAGIC: &[u8; 24] = b"raw_image_stack_by_hpeng";
const PREFIX_LEN: u64 = 24 + 1 + 2;
const CHUNK_VOXELS: usize = 1 << 16;

/// Loads `.v3draw` stacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct V3dRawLoader;

impl VolumeLoader for V3dRawLoader {
    fn load(&self, path: &Path) -> Result<VoxelBuffer> {
        let load_err = |msg: String| VolumeIndexError::Load(format!("{}: {msg}", path.display()));

        let file = File::open(path).map_err(|e| load_err(e.to_string()))?;
        let file_len = file.metadata().map_err(|e| load_err(e.to_string()))?.len();
        let mut reader = BufReader::new(file);

        let mut prefix = [0u8; PREFIX_LEN as usize];
        reader
            .read_exact(&mut prefix)
            .map_err(|_| load_err("truncated header".into()))?;
        if &prefix[..24] != MAGIC {
            return Err(load_err("not a v3draw stack (bad magic)".into()));
        }
        let little_endian = match prefix[24] {
            b'L' => true,
            b'B' => false,
            other => return Err(load_err(format!("unknown endianness byte {other:#04x}"))),
        };
        let read_u16 = |b: [u8; 2]| {
            if little_endian {
                u16::from_le_bytes(b)
            } else {
                u16::from_be_bytes(b)
            }
        };
        let read_u32 = |b: [u8; 4]| {
            if little_endian {
                u32::from_le_bytes(b)
            } else {
                u32::from_be_bytes(b)
            }
        };

        let (bytes_per_voxel, bit_depth) = match read_u16([prefix[25], prefix[26]]) {
            1 => (1usize, 8u8),
            2 => (2, 16),
            4 => return Err(load_err("32-bit float stacks are not supported".into())),
            other => return Err(load_err(format!("unknown datatype {other}"))),
        };

        let expected_len = |header_len: u64, dims: &Dims| {
            dims.checked_len()
                .and_then(|n| (n as u64).checked_mul(bytes_per_voxel as u64))
                .and_then(|n| n.checked_add(header_len))
        };

        let mut dim_bytes = [0u8; 16];
        reader
            .read_exact(&mut dim_bytes[..8])
            .map_err(|_| load_err("truncated header".into()))?;
        let short = Dims::new(
            read_u16([dim_bytes[0], dim_bytes[1]]) as usize,
            read_u16([dim_bytes[2], dim_bytes[3]]) as usize,
            read_u16([dim_bytes[4], dim_bytes[5]]) as usize,
            read_u16([dim_bytes[6], dim_bytes[7]]) as usize,
        );

        let dims = if expected_len(PREFIX_LEN + 8, &short) == Some(file_len) {
            debug!(path = %path.display(), "Reading legacy v3draw with 16-bit dimensions");
            short
        } else {
            reader
                .read_exact(&mut dim_bytes[8..])
                .map_err(|_| load_err("truncated header".into()))?;
            let word = |i: usize| {
                read_u32([
                    dim_bytes[i],
                    dim_bytes[i + 1],
                    dim_bytes[i + 2],
                    dim_bytes[i + 3],
                ]) as usize
            };
            let long = Dims::new(word(0), word(4), word(8), word(12));
            if expected_len(PREFIX_LEN + 16, &long) != Some(file_len) {
                return Err(load_err(format!(
                    "file length {file_len} does not match dimensions {long}"
                )));
            }
            long
        };

        let mut buffer = VoxelBuffer::zeroed(dims, bit_depth)?;
        let total = buffer.data.len();
        let mut chunk = vec![0u8; CHUNK_VOXELS * bytes_per_voxel];
        let mut filled = 0;
        while filled < total {
            let count = (total - filled).min(CHUNK_VOXELS);
            let bytes = &mut chunk[..count * bytes_per_voxel];
            reader
                .read_exact(bytes)
                .map_err(|e| load_err(e.to_string()))?;
            let target = &mut buffer.data[filled..filled + count];
            if bytes_per_voxel == 1 {
                for (dst, &b) in target.iter_mut().zip(bytes.iter()) {
                    *dst = u16::from(b);
                }
            } else {
                for (dst, pair) in target.iter_mut().zip(bytes.chunks_exact(2)) {
                    *dst = read_u16([pair[0], pair[1]]);
                }
            }
            filled += count;
        }

        debug!(path = %path.display(), dims = %dims, bit_depth, "Loaded v3draw stack");
        Ok(buffer)
    }
}

/// Write `buffer` as a little-endian v3draw stack with u32 dimensions.
///
/// 8-bit buffers clamp intensities above 255.
pub fn write_v3draw(path: &Path, buffer: &VoxelBuffer) -> Result<()> {
    let dims = buffer.dims();
    let datatype: u16 = if buffer.bit_depth() <= 8 { 1 } else { 2 };

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(MAGIC)?;
    writer.write_all(b"L")?;
    writer.write_all(&datatype.to_le_bytes())?;
    for d in [dims.x, dims.y, dims.z, dims.c] {
        let d = u32::try_from(d).map_err(|_| {
            VolumeIndexError::Serialization(format!("dimension {d} does not fit a v3draw header"))
        })?;
        writer.write_all(&d.to_le_bytes())?;
    }

    if datatype == 1 {
        let bytes: Vec<u8> = buffer
            .data()
            .iter()
            .map(|&v| u8::try_from(v).unwrap_or(u8::MAX))
            .collect();
        writer.write_all(&bytes)?;
    } else {
        for &v in buffer.data() {
            writer.write_all(&v.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}
