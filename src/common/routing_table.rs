//! Kademlia routing table with dynamic bucket splitting

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{
    Admission, Contact, Distance, Id, InsertResult, KBucket, DEFAULT_K,
    DEFAULT_REPLACEMENT_CACHE_SIZE, ID_BITS,
};
use crate::{Error, Result};

/// Consecutive failed requests before a contact is evicted.
pub const DEFAULT_MAX_FAILURES: u8 = 2;

#[derive(Debug, Clone)]
/// Kademlia routing table
///
/// An ordered sequence of [KBucket]s partitioning the distance space from the
/// local id. The first bucket covers `[0, 2^m)` and owns the local id, every
/// following bucket covers `[2^i, 2^(i+1))` for `m <= i < 160`.
///
/// Only the first bucket ever splits, so resolution grows near the local id.
pub struct RoutingTable {
    id: Id,
    k: usize,
    replacement_cache_size: usize,
    max_failures: u8,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            k: DEFAULT_K,
            replacement_cache_size: DEFAULT_REPLACEMENT_CACHE_SIZE,
            max_failures: DEFAULT_MAX_FAILURES,
            buckets: vec![KBucket::new(id)],
        }
    }

    // === Options ===

    /// Set the k-bucket size, at least 1. Resets the table.
    pub fn with_bucket_size(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self.reset();
        self
    }

    /// Set the replacement cache size of each bucket. Resets the table.
    pub fn with_replacement_cache_size(mut self, size: usize) -> Self {
        self.replacement_cache_size = size;
        self.reset();
        self
    }

    pub fn with_max_failures(mut self, max_failures: u8) -> Self {
        self.max_failures = max_failures;
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Buckets ordered by ascending distance range.
    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Position of the bucket covering `distance`.
    pub fn bucket_index_of(&self, distance: &Distance) -> usize {
        let owning_upper = self.buckets[0].range().upper();

        match distance.bucket_index() {
            Ok(index) if index >= owning_upper => 1 + (index - owning_upper) as usize,
            _ => 0,
        }
    }

    // === Public Methods ===

    /// Insert a contact, probing the least recently seen contact of a full
    /// bucket with `probe` (returns true if it is alive).
    pub fn insert(
        &mut self,
        contact: Contact,
        mut probe: impl FnMut(&Contact) -> bool,
    ) -> Result<InsertResult> {
        match self.try_insert(contact.clone())? {
            Admission::Done(result) => Ok(result),
            Admission::Probe { least_recent } => {
                let alive = probe(&least_recent);
                self.complete_probe(contact, &least_recent.id, alive)
            }
        }
    }

    /// First phase of [Self::insert].
    ///
    /// Splits the owning bucket as long as it is the full target of the
    /// insertion, and asks for a probe when a bucket that can't split is full.
    pub fn try_insert(&mut self, contact: Contact) -> Result<Admission> {
        if contact.id == self.id {
            return Err(Error::SelfInsert);
        }

        let distance = self.id.distance(&contact.id);

        loop {
            let index = self.bucket_index_of(&distance);
            let admission = self.buckets[index].try_insert(contact.clone())?;

            if index == 0 && matches!(admission, Admission::Probe { .. }) {
                if let Some(bit) = self.buckets[0].range().split_bit() {
                    self.split_owning_bucket(bit)?;
                    continue;
                }
            }

            return Ok(admission);
        }
    }

    /// Second phase of [Self::insert], after probing `probed`.
    pub fn complete_probe(
        &mut self,
        candidate: Contact,
        probed: &Id,
        alive: bool,
    ) -> Result<InsertResult> {
        if candidate.id == self.id {
            return Err(Error::SelfInsert);
        }

        let index = self.bucket_index_of(&self.id.distance(&candidate.id));

        self.buckets[index].complete_probe(candidate, probed, alive)
    }

    /// Remove a contact from this routing table.
    pub fn remove(&mut self, id: &Id) -> Result<Contact> {
        if *id == self.id {
            return Err(Error::NotFound(*id));
        }

        let index = self.bucket_index_of(&self.id.distance(id));

        self.buckets[index].remove(id)
    }

    /// Report a failed request to a contact, returns the contact if it got evicted.
    pub fn record_failure(&mut self, id: &Id) -> Option<Contact> {
        if *id == self.id {
            return None;
        }

        let index = self.bucket_index_of(&self.id.distance(id));

        self.buckets[index].record_failure(id, self.max_failures)
    }

    /// Return up to `count` contacts closest to `target`, sorted by distance,
    /// ties broken by ascending id.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let start = self.bucket_index_of(&self.id.distance(target));

        // The bucket covering the target holds the closest contacts, all the
        // buckets below it are equally far, and each bucket above it is further
        // than the one before.
        let mut closest: Vec<&Contact> = self.buckets[start].iter().collect();

        if closest.len() < count {
            for bucket in &self.buckets[..start] {
                closest.extend(bucket.iter());
            }
        }

        for bucket in &self.buckets[start + 1..] {
            if closest.len() >= count {
                break;
            }
            closest.extend(bucket.iter());
        }

        closest.sort_by(|a, b| {
            target
                .cmp_distance(&a.id, &b.id)
                .then_with(|| a.id.cmp(&b.id))
        });

        closest.into_iter().take(count).cloned().collect()
    }

    /// A random id within the range of the bucket at `index`, to look up when
    /// refreshing that bucket.
    pub fn refresh_bucket(&self, index: usize) -> Result<Id> {
        let bucket = self
            .buckets
            .get(index)
            .ok_or(Error::BucketIndexOutOfRange(index))?;

        Ok(self.id.at_distance(&bucket.range().random_distance()))
    }

    /// Indexes of buckets that saw no activity for `interval`.
    pub fn stale_buckets(&self, now: Instant, interval: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.is_stale(now, interval))
            .map(|(index, _)| index)
            .collect()
    }

    /// Mark the bucket covering `target` as recently looked up.
    pub fn touch(&mut self, target: &Id, now: Instant) {
        let index = self.bucket_index_of(&self.id.distance(target));

        self.buckets[index].touch(now);
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        let index = self.bucket_index_of(&self.id.distance(id));

        self.buckets[index].get(id)
    }

    /// Returns an iterator over the contacts in this routing table.
    pub fn nodes(&self) -> impl Iterator<Item = &Contact> + '_ {
        self.buckets.iter().flat_map(KBucket::iter)
    }

    /// Export an owned vector of contacts from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<Contact> {
        self.nodes().cloned().collect()
    }

    /// Verify bucket ranges are contiguous, disjoint and cover `[0, 2^160)`.
    pub fn check_partition(&self) -> Result<()> {
        let mut previous_upper = None;

        for bucket in &self.buckets {
            let range = bucket.range();

            if range.lower() != previous_upper {
                return Err(Error::BrokenPartition(format!(
                    "bucket {} does not start where the previous one ended",
                    range
                )));
            }

            if previous_upper.is_some() && Some(range.upper()) != range.lower().map(|l| l + 1) {
                return Err(Error::BrokenPartition(format!(
                    "bucket {} spans more than one distance bit",
                    range
                )));
            }

            previous_upper = Some(range.upper());
        }

        if previous_upper != Some(ID_BITS) || self.buckets.len() > ID_BITS as usize {
            return Err(Error::BrokenPartition(format!(
                "{} buckets ending at {:?}",
                self.buckets.len(),
                previous_upper
            )));
        }

        Ok(())
    }

    // === Private Methods ===

    fn split_owning_bucket(&mut self, bit: u8) -> Result<()> {
        let (low, high) = self.buckets[0].split(bit)?;

        self.buckets.splice(0..1, [low, high]);
        self.check_partition()?;

        debug!(bit, buckets = self.buckets.len(), "Split owning bucket");

        Ok(())
    }

    fn reset(&mut self) {
        self.buckets = vec![KBucket::new(self.id)
            .with_size(self.k)
            .with_replacement_cache_size(self.replacement_cache_size)];
    }
}

/// Cloneable handle to a [RoutingTable] shared between lookups, request
/// handling and maintenance.
///
/// Splits happen entirely under the write lock, so readers observe either the
/// table before a split or after it.
#[derive(Debug, Clone)]
pub struct SharedRoutingTable(Arc<RwLock<RoutingTable>>);

impl SharedRoutingTable {
    pub fn new(table: RoutingTable) -> Self {
        SharedRoutingTable(Arc::new(RwLock::new(table)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<RoutingTable> for SharedRoutingTable {
    fn from(table: RoutingTable) -> Self {
        SharedRoutingTable::new(table)
    }
}
