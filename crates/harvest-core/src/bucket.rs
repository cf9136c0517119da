//! Bucketing
//!
//! Records are sharded by `u64_le(sha256(utf8(key))[..8]) % bucket_count`. The result
//! depends only on the key and the count, so the same logical entity always lands in
//! the same bucket across processes and restarts.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub fn get_bucket(bucket_count: u32, key: &str) -> Result<u32> {
    if bucket_count == 0 {
        return Err(Error::InvalidBucketCount);
    }

    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_le_bytes(prefix);

    Ok((hash % u64::from(bucket_count)) as u32)
}
