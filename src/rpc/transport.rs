use std::time::Duration;

use crate::common::Contact;
use crate::rpc::{Reply, Request};
use crate::Result;

/// Delivers requests to remote nodes.
///
/// Implementations own the sockets and the wire format. `send` blocks until a
/// reply arrives, fails with [Error::Timeout](crate::Error::Timeout) once
/// `timeout` elapsed, or with [Error::Transport](crate::Error::Transport) for
/// anything else.
///
/// Lookups call `send` from several threads at once.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: &Contact, request: Request, timeout: Duration) -> Result<Reply>;
}
