//! Answering incoming requests.

use std::time::Duration;

use tracing::trace;

use crate::common::{Contact, Id, RoutingTable, DEFAULT_K};
use crate::rpc::{Reply, Request, EXPIRE_INTERVAL};
use crate::storage::{Origin, Storage};

/// Dht server that can handle incoming rpc requests
pub trait Server: std::fmt::Debug + Send + Sync {
    /// Handle an incoming request from `from` and return the reply to send back.
    ///
    /// Called with the routing table read lock held, thus it needs to be fast
    /// and must not touch the network.
    fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        storage: &mut dyn Storage,
        from: &Contact,
        request: Request,
    ) -> Reply;
}

#[derive(Debug, Clone)]
/// Default implementation of [Server] trait.
///
/// Answers the four Kademlia requests, without any rate-limiting or blocking.
pub struct DefaultServer {
    /// Number of contacts returned to FIND_NODE and FIND_VALUE requests.
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// Time to live of values received through STORE requests.
    ///
    /// Defaults to [EXPIRE_INTERVAL]
    pub ttl: Duration,
}

impl Default for DefaultServer {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            ttl: EXPIRE_INTERVAL,
        }
    }
}

impl DefaultServer {
    fn closest(&self, routing_table: &RoutingTable, from: &Contact, target: &Id) -> Reply {
        // Ask for one more in case the requester is among them.
        let nodes = routing_table
            .find_closest(target, self.k + 1)
            .into_iter()
            .filter(|node| node.id != from.id)
            .take(self.k)
            .collect();

        Reply::Nodes(nodes)
    }
}

impl Server for DefaultServer {
    fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        storage: &mut dyn Storage,
        from: &Contact,
        request: Request,
    ) -> Reply {
        trace!(from = ?from.id, kind = request.kind(), "Handling request");

        match request {
            Request::Ping => Reply::Pong,
            Request::FindNode { target } => self.closest(routing_table, from, &target),
            Request::FindValue { key } => match storage.get(&key) {
                Ok(value) => Reply::Value(value),
                Err(_) => self.closest(routing_table, from, &key),
            },
            Request::Store { key, value } => {
                storage.put(key, value, self.ttl, Origin::Replica);

                Reply::Stored
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::storage::MemoryStorage;

    fn setup() -> (RoutingTable, MemoryStorage, DefaultServer) {
        let mut table = RoutingTable::new(Id::random());
        for _ in 0..30 {
            let _ = table.insert(Contact::random(), |_| true);
        }

        (table, MemoryStorage::default(), DefaultServer::default())
    }

    #[test]
    fn ping() {
        let (table, mut storage, mut server) = setup();

        let reply = server.handle_request(&table, &mut storage, &Contact::random(), Request::Ping);

        assert_eq!(reply, Reply::Pong);
    }

    #[test]
    fn find_node_excludes_requester() {
        let (table, mut storage, mut server) = setup();
        let requester = table.to_owned_nodes()[0].clone();

        let reply = server.handle_request(
            &table,
            &mut storage,
            &requester,
            Request::FindNode {
                target: requester.id,
            },
        );

        match reply {
            Reply::Nodes(nodes) => {
                assert_eq!(nodes.len(), table.size().min(DEFAULT_K + 1) - 1);
                assert!(!nodes.contains(&requester));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn store_then_find_value() {
        let (table, mut storage, mut server) = setup();
        let from = Contact::random();
        let key = Id::random();

        let reply = server.handle_request(&table, &mut storage, &from, Request::FindValue { key });
        assert!(matches!(reply, Reply::Nodes(_)));

        let reply = server.handle_request(
            &table,
            &mut storage,
            &from,
            Request::Store {
                key,
                value: Bytes::from_static(b"value"),
            },
        );
        assert_eq!(reply, Reply::Stored);

        let reply = server.handle_request(&table, &mut storage, &from, Request::FindValue { key });
        assert_eq!(reply, Reply::Value(Bytes::from_static(b"value")));

        assert_eq!(storage.entries(Origin::Replica).len(), 1);
    }
}
