//! Packed binary fingerprints.
//!
//! # Bit order
//!
//! Bit `p` covers the fingerprint voxel `(x, y, z)` with
//! `p = x + nx * (y + ny * z)`, i.e. x varies fastest, then y, then z. Bit `p`
//! lives in byte `p / 8` at position `p % 8`, least significant bit first.
//! Trailing bits of the last byte are always zero. This layout is what the
//! sample index files and the consolidated index store on disk.
//!
//! # Usage
//!
//! ```
//! use volidx_core::fingerprint::Fingerprint;
//!
//! let mut a = Fingerprint::zeroed(16);
//! let mut b = Fingerprint::zeroed(16);
//! a.set(3);
//! b.set(3);
//! b.set(9);
//! assert_eq!(a.hamming_distance(&b).unwrap(), 1);
//! assert_eq!(a.similarity(&b).unwrap(), 15.0 / 16.0);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, VolumeIndexError};

/// A packed bit vector with a known number of meaningful bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// The packed bits, `ceil(bit_len / 8)` bytes
    bytes: Vec<u8>,
    /// Number of meaningful bits
    bit_len: u64,
}

impl Fingerprint {
    /// All-zero fingerprint of `bit_len` bits.
    pub fn zeroed(bit_len: u64) -> Self {
        Self {
            bytes: vec![0; packed_len(bit_len)],
            bit_len,
        }
    }

    /// Wrap packed bytes, checking the length and that padding bits are clear.
    pub fn from_bytes(bytes: Vec<u8>, bit_len: u64) -> Result<Self> {
        let fingerprint = Self { bytes, bit_len };
        fingerprint.validate()?;
        Ok(fingerprint)
    }

    /// Check the packed length and that padding bits are clear.
    ///
    /// Deserialized fingerprints skip [`Fingerprint::from_bytes`], so readers
    /// of serialized documents call this themselves.
    pub fn validate(&self) -> Result<()> {
        let bit_len = self.bit_len;
        if self.bytes.len() != packed_len(bit_len) {
            return Err(VolumeIndexError::Serialization(format!(
                "fingerprint of {bit_len} bits needs {} bytes, got {}",
                packed_len(bit_len),
                self.bytes.len()
            )));
        }
        let tail_bits = (bit_len % 8) as u32;
        if let Some(&last) = self.bytes.last() {
            if tail_bits != 0 && last >> tail_bits != 0 {
                return Err(VolumeIndexError::Serialization(
                    "fingerprint padding bits are set".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn bit_len(&self) -> u64 {
        self.bit_len
    }

    /// Packed length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn get(&self, bit: u64) -> bool {
        debug_assert!(bit < self.bit_len);
        self.bytes[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u64) {
        debug_assert!(bit < self.bit_len);
        self.bytes[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.bytes.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Number of differing bits.
    ///
    /// # Returns
    ///
    /// - `Ok(distance)` if both fingerprints have the same bit length
    /// - `Err` if the lengths differ or either is empty
    pub fn hamming_distance(&self, other: &Self) -> Result<u64> {
        if self.bit_len != other.bit_len {
            return Err(VolumeIndexError::IncompatibleIndex(format!(
                "cannot compare a {}-bit fingerprint with a {}-bit fingerprint",
                self.bit_len, other.bit_len
            )));
        }
        hamming_distance(&self.bytes, &other.bytes).ok_or_else(|| {
            VolumeIndexError::IncompatibleIndex("cannot compare empty fingerprints".into())
        })
    }

    /// Number of bits that agree.
    pub fn matching_bits(&self, other: &Self) -> Result<u64> {
        Ok(self.bit_len - self.hamming_distance(other)?)
    }

    /// Fraction of agreeing bits, in `[0, 1]`.
    pub fn similarity(&self, other: &Self) -> Result<f64> {
        let distance = self.hamming_distance(other)?;
        Ok(similarity_from_distance(distance, self.bit_len))
    }

    /// Set every bit that is set in `other`.
    pub fn union_with(&mut self, other: &Self) -> Result<()> {
        if self.bit_len != other.bit_len {
            return Err(VolumeIndexError::IncompatibleIndex(format!(
                "cannot merge a {}-bit fingerprint into a {}-bit fingerprint",
                other.bit_len, self.bit_len
            )));
        }
        for (a, b) in self.bytes.iter_mut().zip(other.bytes.iter()) {
            *a |= b;
        }
        Ok(())
    }

    /// Get the packed bytes as a hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// Bytes needed to pack `bit_len` bits.
pub fn packed_len(bit_len: u64) -> usize {
    bit_len.div_ceil(8) as usize
}

/// Compute Hamming distance between two packed byte arrays.
///
/// # Returns
///
/// The number of differing bits, or `None` if either array is empty or the
/// lengths differ. Fingerprints of different lengths come from different
/// index layouts and are never comparable.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> Option<u64> {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return None;
    }

    Some(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x ^ y).count_ones() as u64)
            .sum(),
    )
}

/// Normalized Hamming similarity: matching bits over total bits.
pub fn similarity_from_distance(distance: u64, bit_len: u64) -> f64 {
    if bit_len == 0 {
        return 0.0;
    }
    (bit_len - distance.min(bit_len)) as f64 / bit_len as f64
}
