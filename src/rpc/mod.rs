//! Kademlia RPC layer: messages, the transport seam and iterative lookups.

mod closest_nodes;
mod config;
mod iterative_query;
mod lookup;
mod messages;
mod transport;

pub use closest_nodes::ClosestNodes;
pub use config::*;
pub use iterative_query::{LookupResult, LookupStatus, QueryState};
pub use lookup::{CancellationToken, LookupCoordinator, StoreOutcome, ValueLookup};
pub use messages::{Reply, Request};
pub use transport::Transport;
