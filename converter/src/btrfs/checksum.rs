// Btrfs checksum verification.
//
// CRITICAL: btrfs CRC32c is the RFC 3720 convention (seed ~0, final
// invert) and the stored digest is the already-inverted value,
// little-endian, in the first bytes of a 32-byte checksum slot.

use blake2::Blake2b;
use blake2::digest::consts::U32;
use blake2::digest::Digest;
use sha2::Sha256;
use std::hash::Hasher;
use twox_hash::XxHash64;

use fsmorph_core::ConvertError;

type Blake2b256 = Blake2b<U32>;

/// Checksum slot size in superblocks and node headers.
pub const CSUM_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc32c,
    XxHash64,
    Sha256,
    Blake2b,
}

impl ChecksumKind {
    pub fn from_raw(raw: u16) -> Result<Self, ConvertError> {
        match raw {
            0 => Ok(ChecksumKind::Crc32c),
            1 => Ok(ChecksumKind::XxHash64),
            2 => Ok(ChecksumKind::Sha256),
            3 => Ok(ChecksumKind::Blake2b),
            other => Err(ConvertError::unsupported(format!(
                "btrfs checksum type {}",
                other
            ))),
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            ChecksumKind::Crc32c => 4,
            ChecksumKind::XxHash64 => 8,
            ChecksumKind::Sha256 => 32,
            ChecksumKind::Blake2b => 32,
        }
    }
}

/// One-shot RFC 3720 CRC32c.
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Continue a CRC32c over more data; `prev` is a finalized value from
/// `crc32c` or an earlier `crc32c_continue` (the pre-inversion is
/// handled internally).
pub fn crc32c_continue(prev: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(prev, data)
}

pub fn xxhash64(data: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(data);
    h.finish()
}

/// Compute the digest for `kind` into a zero-padded 32-byte slot.
pub fn compute(kind: ChecksumKind, data: &[u8]) -> [u8; CSUM_SIZE] {
    let mut out = [0u8; CSUM_SIZE];
    match kind {
        ChecksumKind::Crc32c => out[..4].copy_from_slice(&crc32c(data).to_le_bytes()),
        ChecksumKind::XxHash64 => out[..8].copy_from_slice(&xxhash64(data).to_le_bytes()),
        ChecksumKind::Sha256 => out.copy_from_slice(&Sha256::digest(data)),
        ChecksumKind::Blake2b => out.copy_from_slice(&Blake2b256::digest(data)),
    }
    out
}

/// Verify `data` against the stored digest prefix.
pub fn verify(kind: ChecksumKind, stored: &[u8], data: &[u8]) -> bool {
    let size = kind.digest_size();
    if stored.len() < size {
        return false;
    }
    let computed = compute(kind, data);
    stored[..size] == computed[..size]
}
