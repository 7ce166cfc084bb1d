//! Partition selection.
//!
//! A [`PartitionResolver`] rotates over ordinals `1..=N`. The owning
//! [`PartitionSet`] maps ordinal *i* to the *i*-th partition number it was
//! built with, so every resolved target is a member of the set no matter how
//! the partition numbers themselves are laid out.

use crate::error::{ClientError, Result};
use siphasher::sip::SipHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor over `1..=count`.
///
/// Safe to share between foreground calls and background loops: the cursor
/// advances with a single atomic read-modify-write.
#[derive(Debug)]
pub struct PartitionResolver {
    count: usize,
    cursor: AtomicUsize,
}

impl PartitionResolver {
    /// A resolver over `count` ordinals. A count of 0 behaves like 1.
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Next ordinal in rotating order, starting at 1.
    pub fn resolve(&self) -> u32 {
        if self.count == 1 {
            return 1;
        }
        let count = self.count;
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % count))
            .unwrap_or_else(|c| c);
        previous as u32 + 1
    }
}

/// Hash a partition key onto an ordinal in `1..=count`.
///
/// The same key always maps to the same ordinal for a given count.
pub fn partition_from_key(key: &str, count: usize) -> u32 {
    let count = count.max(1) as u64;
    let mut hasher = SipHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % count) as u32 + 1
}

/// The partitions assigned to a producer or consumer, plus its resolver.
///
/// An empty set describes an unpartitioned station.
#[derive(Debug)]
pub struct PartitionSet {
    partitions: Vec<u32>,
    resolver: PartitionResolver,
}

impl PartitionSet {
    pub fn new(partitions: Vec<u32>) -> Self {
        let resolver = PartitionResolver::new(partitions.len());
        Self {
            partitions,
            resolver,
        }
    }

    pub fn unpartitioned() -> Self {
        Self::new(Vec::new())
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn contains(&self, partition: u32) -> bool {
        self.partitions.contains(&partition)
    }

    /// Partition number at a 1-based ordinal.
    pub fn partition_at(&self, ordinal: u32) -> Option<u32> {
        let index = (ordinal as usize).checked_sub(1)?;
        self.partitions.get(index).copied()
    }

    /// Next partition in round-robin order, `None` when unpartitioned.
    pub fn next(&self) -> Option<u32> {
        if self.partitions.is_empty() {
            return None;
        }
        self.partition_at(self.resolver.resolve())
    }

    pub fn for_key(&self, key: &str) -> Option<u32> {
        if self.partitions.is_empty() {
            return None;
        }
        self.partition_at(partition_from_key(key, self.partitions.len()))
    }

    /// Pick the target partition.
    ///
    /// Precedence: explicit number (must be a member) > key > round robin.
    /// Supplying both a non-blank key and a number is an error. Returns
    /// `None` for an unpartitioned station.
    pub fn select(
        &self,
        station: &str,
        key: Option<&str>,
        number: Option<u32>,
    ) -> Result<Option<u32>> {
        let key = key.filter(|k| !k.trim().is_empty());
        if key.is_some() && number.is_some() {
            return Err(ClientError::AmbiguousPartitionSelector);
        }

        if let Some(partition) = number {
            if !self.contains(partition) {
                return Err(ClientError::InvalidPartition {
                    partition,
                    station: station.to_string(),
                });
            }
            return Ok(Some(partition));
        }

        if let Some(key) = key {
            return Ok(self.for_key(key));
        }

        Ok(self.next())
    }
}
