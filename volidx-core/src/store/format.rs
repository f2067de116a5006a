//! On-disk layout of the consolidated index.
//!
//! All integers are little-endian.
//!
//! ```text
//! header:  magic "VIDX" | version u16 | space_len u16 | space bytes
//!          | pixel_x u32 | pixel_y u32 | pixel_z u32 | unit u32 | bits u8
//!          | threshold u32 | fingerprint_len u32 | entry_count u64 | crc32 u32
//! record:  sample_id i64 | alignment_result_id i64 | ncc_score f64
//!          | owner [u8; 64] | fingerprint_len u32 | fingerprint bytes | crc32 u32
//! ```
//!
//! Records are fixed size for a given header, so record `i` starts at
//! `header_len + i * record_len`.

use std::io::{Read, Write};

use crate::entry::{IndexEntry, IndexLayout};
use crate::error::{Result, VolumeIndexError};
use crate::fingerprint::Fingerprint;

pub const INDEX_MAGIC: [u8; 4] = *b"VIDX";
pub const INDEX_FORMAT_VERSION: u16 = 1;

/// Bytes reserved for the owner name in each record.
pub const OWNER_FIELD_LEN: usize = 64;

/// Record bytes other than the fingerprint itself.
pub const RECORD_OVERHEAD: usize = 8 + 8 + 8 + OWNER_FIELD_LEN + 4 + 4;

const HEADER_FIXED_LEN: usize = 4 + 2 + 2 + 12 + 4 + 1 + 4 + 4 + 8 + 4;

/// Header of a consolidated index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub layout: IndexLayout,
    /// Packed fingerprint bytes per record
    pub fingerprint_len: u32,
    /// Number of records following the header
    pub entry_count: u64,
}

impl IndexHeader {
    /// Header for an empty index with this layout.
    pub fn new(layout: IndexLayout) -> Result<Self> {
        let packed = layout.fingerprint_len()?;
        let fingerprint_len = u32::try_from(packed).map_err(|_| {
            VolumeIndexError::InvalidSpecification(format!(
                "fingerprint of {packed} bytes is too large for the index format"
            ))
        })?;
        if layout.space.len() > u16::MAX as usize {
            return Err(VolumeIndexError::InvalidSpecification(
                "space name is too long".into(),
            ));
        }
        Ok(Self {
            layout,
            fingerprint_len,
            entry_count: 0,
        })
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_FIXED_LEN + self.layout.space.len()
    }

    pub fn record_len(&self) -> usize {
        RECORD_OVERHEAD + self.fingerprint_len as usize
    }

    /// File length implied by the header, or `None` on overflow.
    pub fn expected_file_len(&self) -> Option<u64> {
        (self.record_len() as u64)
            .checked_mul(self.entry_count)?
            .checked_add(self.encoded_len() as u64)
    }

    /// Byte offset of record `index`.
    pub fn record_offset(&self, index: u64) -> u64 {
        self.encoded_len() as u64 + index * self.record_len() as u64
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.layout.space.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.layout.space.as_bytes());
        for p in self.layout.pixel {
            buf.extend_from_slice(&p.to_le_bytes());
        }
        buf.extend_from_slice(&self.layout.index_unit.to_le_bytes());
        buf.push(self.layout.bit_depth);
        buf.extend_from_slice(&self.layout.binary_threshold.to_le_bytes());
        buf.extend_from_slice(&self.fingerprint_len.to_le_bytes());
        buf.extend_from_slice(&self.entry_count.to_le_bytes());

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        writer.write_all(&buf)?;
        Ok(buf.len())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut prefix = [0u8; 8];
        read_header_bytes(&mut reader, &mut prefix)?;
        if prefix[..4] != INDEX_MAGIC {
            return Err(VolumeIndexError::IndexCorruption(format!(
                "invalid magic {:?}",
                &prefix[..4]
            )));
        }
        let version = u16::from_le_bytes([prefix[4], prefix[5]]);
        if version != INDEX_FORMAT_VERSION {
            return Err(VolumeIndexError::IndexCorruption(format!(
                "unsupported index version {version}"
            )));
        }
        let space_len = u16::from_le_bytes([prefix[6], prefix[7]]) as usize;

        let mut rest = vec![0u8; space_len + HEADER_FIXED_LEN - 8 - 4];
        read_header_bytes(&mut reader, &mut rest)?;
        let mut crc_bytes = [0u8; 4];
        read_header_bytes(&mut reader, &mut crc_bytes)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prefix);
        hasher.update(&rest);
        let crc_actual = hasher.finalize();
        let crc_expected = u32::from_le_bytes(crc_bytes);
        if crc_actual != crc_expected {
            return Err(VolumeIndexError::IndexCorruption(format!(
                "header CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})"
            )));
        }

        let space = String::from_utf8(rest[..space_len].to_vec()).map_err(|_| {
            VolumeIndexError::IndexCorruption("space name is not valid UTF-8".into())
        })?;
        let mut cursor = FieldCursor::new(&rest[space_len..]);
        let pixel = [cursor.u32(), cursor.u32(), cursor.u32()];
        let index_unit = cursor.u32();
        let bit_depth = cursor.u8();
        let binary_threshold = cursor.u32();
        let fingerprint_len = cursor.u32();
        let entry_count = cursor.u64();

        let layout = IndexLayout {
            space,
            pixel,
            index_unit,
            bit_depth,
            binary_threshold,
        };
        let packed = layout
            .fingerprint_len()
            .map_err(|e| VolumeIndexError::IndexCorruption(format!("recorded layout: {e}")))?;
        if packed != fingerprint_len as usize {
            return Err(VolumeIndexError::IndexCorruption(format!(
                "fingerprint length {fingerprint_len} does not match the recorded layout"
            )));
        }

        Ok(Self {
            layout,
            fingerprint_len,
            entry_count,
        })
    }
}

/// Encode one record for an index whose fingerprints are `fingerprint_len` bytes.
pub fn encode_record(entry: &IndexEntry, fingerprint_len: u32) -> Result<Vec<u8>> {
    let fingerprint = entry.fingerprint.as_bytes();
    if fingerprint.len() != fingerprint_len as usize {
        return Err(VolumeIndexError::IncompatibleIndex(format!(
            "sample {} has a {}-byte fingerprint, index records hold {fingerprint_len}",
            entry.sample_id,
            fingerprint.len()
        )));
    }

    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + fingerprint.len());
    buf.extend_from_slice(&entry.sample_id.to_le_bytes());
    buf.extend_from_slice(&entry.alignment_result_id.to_le_bytes());
    buf.extend_from_slice(&entry.ncc_score.to_le_bytes());
    buf.extend_from_slice(&owner_field(&entry.owner));
    buf.extend_from_slice(&fingerprint_len.to_le_bytes());
    buf.extend_from_slice(fingerprint);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Sample id of an encoded record, without validating the rest.
pub fn record_sample_id(record: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = record.get(..8)?.try_into().ok()?;
    Some(i64::from_le_bytes(bytes))
}

/// Decode one record read under `header`.
///
/// A CRC mismatch is `IndexCorruption`; a record declaring a different
/// fingerprint length is `IncompatibleIndex`. Both only concern this record.
pub fn decode_record(record: &[u8], header: &IndexHeader) -> Result<IndexEntry> {
    if record.len() != header.record_len() {
        return Err(VolumeIndexError::IndexCorruption(format!(
            "record is {} bytes, expected {}",
            record.len(),
            header.record_len()
        )));
    }
    let (body, crc_bytes) = record.split_at(record.len() - 4);
    let crc_expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if crc32fast::hash(body) != crc_expected {
        let id = record_sample_id(record).unwrap_or_default();
        return Err(VolumeIndexError::IndexCorruption(format!(
            "record CRC mismatch for sample {id}"
        )));
    }

    let mut cursor = FieldCursor::new(body);
    let sample_id = cursor.u64() as i64;
    let alignment_result_id = cursor.u64() as i64;
    let ncc_score = f64::from_bits(cursor.u64());
    let owner_raw = cursor.bytes(OWNER_FIELD_LEN);
    let owner_len = owner_raw
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(OWNER_FIELD_LEN);
    let owner = String::from_utf8(owner_raw[..owner_len].to_vec()).map_err(|_| {
        VolumeIndexError::IndexCorruption(format!("owner of sample {sample_id} is not UTF-8"))
    })?;
    let stored_len = cursor.u32();
    if stored_len != header.fingerprint_len {
        return Err(VolumeIndexError::IncompatibleIndex(format!(
            "sample {sample_id} declares a {stored_len}-byte fingerprint, index holds {}",
            header.fingerprint_len
        )));
    }
    let fingerprint = header
        .layout
        .fingerprint_bits()
        .and_then(|bits| Fingerprint::from_bytes(cursor.bytes(stored_len as usize).to_vec(), bits))
        .map_err(|e| VolumeIndexError::IndexCorruption(format!("sample {sample_id}: {e}")))?;

    Ok(IndexEntry {
        sample_id,
        owner,
        alignment_result_id,
        ncc_score,
        fingerprint,
    })
}

/// Owner name zero-padded to the fixed field, truncated at a char boundary.
fn owner_field(owner: &str) -> [u8; OWNER_FIELD_LEN] {
    let mut end = owner.len().min(OWNER_FIELD_LEN);
    while !owner.is_char_boundary(end) {
        end -= 1;
    }
    let mut field = [0u8; OWNER_FIELD_LEN];
    field[..end].copy_from_slice(&owner.as_bytes()[..end]);
    field
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            VolumeIndexError::IndexCorruption("truncated header".into())
        }
        _ => VolumeIndexError::Io(e),
    })
}

/// Sequential little-endian field reader over a slice whose length was
/// already checked.
struct FieldCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u8(&mut self) -> u8 {
        self.bytes(1)[0]
    }

    fn u32(&mut self) -> u32 {
        let b = self.bytes(4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn u64(&mut self) -> u64 {
        let b = self.bytes(8);
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}
