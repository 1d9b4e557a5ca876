//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::common::Id;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Contact entry in Kademlia routing table
pub struct Contact {
    pub id: Id,
    pub address: SocketAddr,
    /// Last successful exchange with this contact.
    #[serde(skip, default = "Instant::now")]
    last_seen: Instant,
    /// Consecutive failed requests since the last successful exchange.
    #[serde(skip)]
    failures: u8,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    /// Creates a contact with random Id and an unspecified address.
    pub fn random() -> Contact {
        Contact::new(
            Id::random(),
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(),
        )
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    // === Public Methods ===

    /// Record a successful exchange, adopting the address the peer used.
    pub fn seen(&mut self, address: SocketAddr, at: Instant) {
        self.address = address;
        self.last_seen = at;
        self.failures = 0;
    }

    /// Record a failed request and return the new count of consecutive failures.
    pub fn failed(&mut self) -> u8 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Contact {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seen_resets_failures() {
        let mut contact = Contact::random();

        assert_eq!(contact.failed(), 1);
        assert_eq!(contact.failed(), 2);

        let address: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let now = Instant::now();
        contact.seen(address, now);

        assert_eq!(contact.failures(), 0);
        assert_eq!(contact.address(), address);
        assert_eq!(contact.last_seen(), now);
    }
}
