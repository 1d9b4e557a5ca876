//! Miscellaneous common structs used throughout the library.

mod contact;
mod hash;
mod id;
mod kbucket;
mod routing_table;

pub use contact::*;
pub use hash::*;
pub use id::*;
pub use kbucket::*;
pub use routing_table::*;
