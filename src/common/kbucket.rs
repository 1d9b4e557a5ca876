//! Kbuckets
use std::{
    fmt::{self, Debug, Display, Formatter},
    slice::Iter,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{debug, trace};

use crate::common::{Contact, Distance, Id, ID_BITS, ID_SIZE};
use crate::{Error, Result};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K: usize = 20;
/// Default size of the replacement cache of each bucket.
pub const DEFAULT_REPLACEMENT_CACHE_SIZE: usize = DEFAULT_K / 4;

/// Half open range of distances (from the local id) covered by a [KBucket].
///
/// Either `[0, 2^upper)`, the range owning the local id itself,
/// or `[2^(upper - 1), 2^upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    lower: Option<u8>,
    upper: u8,
}

impl BucketRange {
    /// The whole id space `[0, 2^160)`.
    pub fn full() -> Self {
        BucketRange {
            lower: None,
            upper: ID_BITS,
        }
    }

    /// `[2^index, 2^(index + 1))`, every distance whose bucket index is `index`.
    pub fn leaf(index: u8) -> Self {
        debug_assert!(index < ID_BITS);

        BucketRange {
            lower: Some(index),
            upper: index + 1,
        }
    }

    // === Getters ===

    /// Exponent of the inclusive lower bound, `None` for zero.
    pub fn lower(&self) -> Option<u8> {
        self.lower
    }

    /// Exponent of the exclusive upper bound.
    pub fn upper(&self) -> u8 {
        self.upper
    }

    /// Whether this range contains the distance zero, i.e. the local id.
    pub fn owns_local(&self) -> bool {
        self.lower.is_none()
    }

    // === Public Methods ===

    pub fn contains(&self, distance: &Distance) -> bool {
        match distance.bucket_index() {
            Err(_) => self.lower.is_none(),
            Ok(index) => index < self.upper && self.lower.map_or(true, |lower| index >= lower),
        }
    }

    /// The distance bit a split of this range partitions on, if it can split.
    pub fn split_bit(&self) -> Option<u8> {
        if self.owns_local() && self.upper >= 2 {
            Some(self.upper - 1)
        } else {
            None
        }
    }

    /// A random non zero distance within this range.
    pub fn random_distance(&self) -> Distance {
        let mut rng = rand::thread_rng();
        let mut distance = Distance(rng.gen::<[u8; ID_SIZE]>());

        distance.truncate_bits(self.upper);

        match self.lower {
            Some(lower) => distance.set_bit(lower),
            None if distance.is_zero() => distance.set_bit(0),
            None => {}
        }

        distance
    }

    fn halves(&self) -> Option<(BucketRange, BucketRange)> {
        self.split_bit().map(|bit| {
            (
                BucketRange {
                    lower: None,
                    upper: bit,
                },
                BucketRange::leaf(bit),
            )
        })
    }
}

impl Display for BucketRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.lower {
            Some(lower) => write!(f, "[2^{}, 2^{})", lower, self.upper),
            None => write!(f, "[0, 2^{})", self.upper),
        }
    }
}

/// Outcome of inserting a contact into a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// New contact appended as the most recently seen.
    Inserted,
    /// Known contact moved to the most recently seen position.
    Updated,
    /// The least recently seen contact failed its liveness probe and was
    /// evicted in favor of the new one.
    Replaced(Contact),
    /// The bucket is full of live contacts. The new contact was placed in the
    /// replacement cache if it has any room at all.
    Rejected { cached: bool },
}

/// First phase of an insertion, see [KBucket::try_insert].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Done(InsertResult),
    /// The bucket is full, probe `least_recent` and call [KBucket::complete_probe].
    Probe { least_recent: Contact },
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Clone)]
pub struct KBucket {
    /// Distances are measured from this id.
    local: Id,
    range: BucketRange,
    /// K (as in k-bucket) is the maximum number of contacts in a k-bucket.
    k: usize,
    replacement_cache_size: usize,
    /// Contacts in the k-bucket, sorted by the least recently seen.
    nodes: Vec<Contact>,
    /// Candidates displaced from a full bucket, oldest first.
    replacements: Vec<Contact>,
    /// Keep track of the last time this bucket or any of its contacts were updated.
    last_updated: Instant,
}

impl KBucket {
    /// Create an empty bucket covering the whole id space around `local`.
    pub fn new(local: Id) -> Self {
        KBucket {
            local,
            range: BucketRange::full(),
            k: DEFAULT_K,
            replacement_cache_size: DEFAULT_REPLACEMENT_CACHE_SIZE,
            nodes: Vec::with_capacity(DEFAULT_K),
            replacements: Vec::new(),
            last_updated: Instant::now(),
        }
    }

    // === Options ===

    pub fn with_range(mut self, range: BucketRange) -> Self {
        self.range = range;
        self
    }

    /// Set the bucket capacity, at least 1.
    pub fn with_size(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self.nodes = Vec::with_capacity(self.k);
        self
    }

    pub fn with_replacement_cache_size(mut self, size: usize) -> Self {
        self.replacement_cache_size = size;
        self
    }

    // === Getters ===

    pub fn range(&self) -> &BucketRange {
        &self.range
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.nodes.iter()
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.nodes.iter().find(|node| node.id == *id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    /// Candidates waiting for a slot, oldest first.
    pub fn replacements(&self) -> &[Contact] {
        &self.replacements
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    // === Public Methods ===

    /// Insert `contact`, calling `probe` on the least recently seen contact if
    /// the bucket is full. `probe` returns true if that contact is still alive.
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

    /// Insert without probing. A full bucket is left untouched and the caller
    /// is asked to probe its least recently seen contact.
    pub fn try_insert(&mut self, contact: Contact) -> Result<Admission> {
        self.check_range(&contact.id)?;

        if let Some(index) = self.position(&contact.id) {
            self.update(index, contact);

            Ok(Admission::Done(InsertResult::Updated))
        } else if !self.is_full() {
            self.push(contact);

            Ok(Admission::Done(InsertResult::Inserted))
        } else {
            Ok(Admission::Probe {
                least_recent: self.nodes[0].clone(),
            })
        }
    }

    /// Finish an insertion after probing `probed`.
    ///
    /// The bucket may have changed while the probe was in flight, so the
    /// candidate is re-admitted from scratch if there is room for it now.
    pub fn complete_probe(
        &mut self,
        candidate: Contact,
        probed: &Id,
        alive: bool,
    ) -> Result<InsertResult> {
        self.check_range(&candidate.id)?;

        if let Some(index) = self.position(&candidate.id) {
            self.update(index, candidate);
            return Ok(InsertResult::Updated);
        }

        if !self.is_full() {
            self.push(candidate);
            return Ok(InsertResult::Inserted);
        }

        match self.position(probed) {
            Some(index) if !alive => {
                let evicted = self.nodes.remove(index);
                debug!(evicted = ?evicted.id, added = ?candidate.id, "Evicted unresponsive contact");

                self.push(candidate);

                Ok(InsertResult::Replaced(evicted))
            }
            Some(index) => {
                let mut responsive = self.nodes.remove(index);
                let address = responsive.address;
                responsive.seen(address, Instant::now());
                self.nodes.push(responsive);

                let cached = self.cache(candidate);

                Ok(InsertResult::Rejected { cached })
            }
            None => {
                let cached = self.cache(candidate);

                Ok(InsertResult::Rejected { cached })
            }
        }
    }

    /// Remove a contact, promoting the newest replacement candidate into its slot.
    pub fn remove(&mut self, id: &Id) -> Result<Contact> {
        let index = self.position(id).ok_or(Error::NotFound(*id))?;
        let removed = self.nodes.remove(index);

        self.promote();

        Ok(removed)
    }

    /// Count a failed request to `id`, evicting it once it failed `max_failures`
    /// times in a row. Returns the evicted contact.
    pub fn record_failure(&mut self, id: &Id, max_failures: u8) -> Option<Contact> {
        let Some(index) = self.position(id) else {
            // Unverified candidates don't get second chances.
            self.replacements.retain(|candidate| candidate.id != *id);
            return None;
        };

        if self.nodes[index].failed() < max_failures {
            return None;
        }

        let evicted = self.nodes.remove(index);
        debug!(evicted = ?evicted.id, failures = evicted.failures(), "Evicted failing contact");

        self.promote();

        Some(evicted)
    }

    /// Split a bucket owning the local id's range at `owner_bit_index`.
    ///
    /// Returns `(low, high)` where `low` covers `[0, 2^bit)` and keeps owning
    /// the local id, and `high` covers `[2^bit, 2^(bit + 1))`.
    pub fn split(&self, owner_bit_index: u8) -> Result<(KBucket, KBucket)> {
        let (low_range, high_range) = match self.range.halves() {
            Some(halves) if self.range.split_bit() == Some(owner_bit_index) => halves,
            _ => return Err(Error::UnsplittableBucket(owner_bit_index)),
        };

        let mut low = self.empty(low_range);
        let mut high = self.empty(high_range);

        for node in &self.nodes {
            if self.local.distance(&node.id).bit(owner_bit_index) {
                high.nodes.push(node.clone());
            } else {
                low.nodes.push(node.clone());
            }
        }

        for candidate in &self.replacements {
            if self.local.distance(&candidate.id).bit(owner_bit_index) {
                high.replacements.push(candidate.clone());
            } else {
                low.replacements.push(candidate.clone());
            }
        }

        trace!(from = %self.range, low = low.len(), high = high.len(), "Split bucket");

        Ok((low, high))
    }

    /// Owned copy of the contacts, most recently seen last.
    pub fn snapshot(&self) -> Vec<Contact> {
        self.nodes.clone()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_updated = now;
    }

    /// Whether nothing happened in this bucket for `interval`.
    pub fn is_stale(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_updated) >= interval
    }

    // === Private Methods ===

    fn check_range(&self, id: &Id) -> Result<()> {
        let distance = self.local.distance(id);

        if distance.is_zero() {
            return Err(Error::SelfInsert);
        }

        if !self.range.contains(&distance) {
            return Err(Error::OutOfRange {
                distance,
                range: self.range.to_string(),
            });
        }

        Ok(())
    }

    fn position(&self, id: &Id) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == *id)
    }

    fn update(&mut self, index: usize, incoming: Contact) {
        let mut existing = self.nodes.remove(index);
        existing.seen(incoming.address, incoming.last_seen());

        self.nodes.push(existing);
        self.last_updated = Instant::now();
    }

    fn push(&mut self, contact: Contact) {
        self.replacements.retain(|candidate| candidate.id != contact.id);
        self.nodes.push(contact);
        self.last_updated = Instant::now();
    }

    fn cache(&mut self, candidate: Contact) -> bool {
        if self.replacement_cache_size == 0 {
            return false;
        }

        self.replacements.retain(|c| c.id != candidate.id);

        if self.replacements.len() >= self.replacement_cache_size {
            self.replacements.remove(0);
        }

        self.replacements.push(candidate);

        true
    }

    fn promote(&mut self) {
        if self.is_full() {
            return;
        }

        if let Some(candidate) = self.replacements.pop() {
            debug!(promoted = ?candidate.id, "Promoted replacement candidate");

            let index = self
                .nodes
                .partition_point(|node| node.last_seen() <= candidate.last_seen());
            self.nodes.insert(index, candidate);
        }
    }

    fn empty(&self, range: BucketRange) -> KBucket {
        KBucket {
            local: self.local,
            range,
            k: self.k,
            replacement_cache_size: self.replacement_cache_size,
            nodes: Vec::with_capacity(self.k),
            replacements: Vec::new(),
            last_updated: self.last_updated,
        }
    }
}

impl Debug for KBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KBucket{{ range: {}, nodes: {}, replacements: {} }}",
            self.range,
            self.nodes.len(),
            self.replacements.len()
        )
    }
}
