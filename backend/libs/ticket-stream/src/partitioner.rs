//! Key-to-partition mapping.
//!
//! The hash is part of the wire contract: any tool that re-partitions the
//! topic must use FNV-1a 32-bit over the key bytes, read as a signed 32-bit
//! integer, modulo the partition count, negated when negative.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{StreamError, StreamResult};
use crate::record::OrderKey;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a, 32-bit.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// What to do with a record whose order key is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmptyKeyPolicy {
    /// Refuse to publish; the record has no ordering guarantee to offer.
    #[default]
    Reject,
    /// Spread keyless records over all partitions. Such records are unordered.
    RoundRobin,
}

#[derive(Debug, Default)]
pub struct HashPartitioner {
    empty_key_policy: EmptyKeyPolicy,
    next: AtomicU32,
}

impl HashPartitioner {
    pub fn new(empty_key_policy: EmptyKeyPolicy) -> Self {
        Self {
            empty_key_policy,
            next: AtomicU32::new(0),
        }
    }

    pub fn empty_key_policy(&self) -> EmptyKeyPolicy {
        self.empty_key_policy
    }

    pub fn partition_for(&self, key: &OrderKey, partitions: i32) -> StreamResult<i32> {
        if partitions <= 0 {
            return Err(StreamError::Config(format!(
                "topic has {} partitions",
                partitions
            )));
        }

        if key.is_empty() {
            return match self.empty_key_policy {
                EmptyKeyPolicy::Reject => Err(StreamError::InvalidRecord(
                    "order key must not be empty".to_string(),
                )),
                EmptyKeyPolicy::RoundRobin => {
                    let n = self.next.fetch_add(1, Ordering::Relaxed);
                    Ok((n % partitions as u32) as i32)
                }
            };
        }

        Ok(hash_partition(&key.as_key_bytes(), partitions))
    }
}

fn hash_partition(key: &[u8], partitions: i32) -> i32 {
    let partition = (fnv1a_32(key) as i32) % partitions;
    if partition < 0 {
        -partition
    } else {
        partition
    }
}
