//! Request and reply kinds exchanged between nodes.
//!
//! Encoding them on the wire is up to the [Transport](super::Transport).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::{Contact, Id};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    FindNode { target: Id },
    FindValue { key: Id },
    Store { key: Id, value: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Answer to a [Request::Ping].
    Pong,
    /// Closest contacts the responder knows to the requested target.
    Nodes(Vec<Contact>),
    /// The value stored under a [Request::FindValue] key.
    Value(Bytes),
    /// Acknowledgment of a [Request::Store].
    Stored,
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::FindNode { .. } => "find_node",
            Request::FindValue { .. } => "find_value",
            Request::Store { .. } => "store",
        }
    }
}
