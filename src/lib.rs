#![doc = include_str!("../README.md")]

// Public modules
mod common;

mod dht;
mod error;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod storage;

pub use crate::common::{
    Admission, BucketRange, Contact, Distance, HashProvider, Id, InsertResult, KBucket,
    RoutingTable, Sha1HashProvider, SharedRoutingTable, DEFAULT_K, DEFAULT_MAX_FAILURES,
    DEFAULT_REPLACEMENT_CACHE_SIZE, ID_BITS, ID_SIZE,
};
pub use bytes::Bytes;
pub use dht::{Dht, MaintenanceReport};
pub use error::{Error, Result};
pub use rpc::Config;
