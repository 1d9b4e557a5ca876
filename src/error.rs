//! Main Crate Error

use std::time::Duration;

use crate::common::{Distance, Id};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Kadcore crate error enum.
pub enum Error {
    /// Id bytes were not exactly [ID_SIZE](crate::common::ID_SIZE) long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id string was not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Bucket index of a zero distance, i.e. comparing an id against itself.
    #[error("Distance is zero and has no bucket index")]
    InvalidDistance,

    /// Attempt to route the local node's own id.
    #[error("Can not insert the local id into its own routing table")]
    SelfInsert,

    /// The contact or key is not known.
    #[error("Not found: {0}")]
    NotFound(Id),

    /// A contact was handed to a bucket that doesn't cover its distance.
    #[error("Distance {distance:?} is outside of bucket range {range}")]
    OutOfRange {
        /// Distance from the local id to the contact.
        distance: Distance,
        /// Display form of the bucket range.
        range: String,
    },

    /// Only the bucket covering the local id's own range may split, and only
    /// while it covers more than a single distance bit.
    #[error("Bucket can not be split at bit {0}")]
    UnsplittableBucket(u8),

    /// No bucket at this index.
    #[error("No bucket at index {0}")]
    BucketIndexOutOfRange(usize),

    /// Bucket ranges no longer partition the id space. Unrecoverable.
    #[error("Routing table partition is broken: {0}")]
    BrokenPartition(String),

    /// The remote node did not answer in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport level failure reported by the [Transport](crate::rpc::Transport).
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
