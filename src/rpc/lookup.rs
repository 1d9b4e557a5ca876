//! Iterative lookups over a [Transport].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::iterative_query::{IterativeQuery, LookupResult};
use super::{Config, Reply, Request, Transport};
use crate::common::{
    Admission, BucketRange, Contact, Id, InsertResult, SharedRoutingTable, ID_BITS,
};
use crate::{Error, Result};

/// Extra time a round waits past the request timeout for transports that
/// report their own timeouts a bit late.
const ROUND_SLACK: Duration = Duration::from_millis(50);

/// Cooperative cancellation of a running lookup, checked between rounds.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ValueLookup {
    /// The value, if any node returned it.
    pub value: Option<Bytes>,
    /// The node that returned the value.
    pub holder: Option<Contact>,
    /// The closest node without the value that accepted a copy of it.
    pub cached_at: Option<Contact>,
    pub lookup: LookupResult,
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub key: Id,
    /// Nodes that acknowledged the store.
    pub stored_at: Vec<Contact>,
    /// Nodes that failed to acknowledge it.
    pub failed: Vec<Contact>,
    /// The lookup that found the nodes closest to `key`.
    pub lookup: LookupResult,
}

/// Runs lookups and single requests on behalf of the local node, keeping the
/// routing table up to date with every node that answers or fails.
#[derive(Debug)]
pub struct LookupCoordinator<T: Transport> {
    local: Id,
    table: SharedRoutingTable,
    transport: Arc<T>,
    config: Config,
}

struct Traversal {
    query: IterativeQuery,
    value: Option<(Contact, Bytes)>,
}

impl<T: Transport> LookupCoordinator<T> {
    pub fn new(table: SharedRoutingTable, transport: Arc<T>, config: Config) -> Self {
        let local = *table.read().id();

        Self {
            local,
            table,
            transport,
            config,
        }
    }

    // === Getters ===

    pub fn local_id(&self) -> &Id {
        &self.local
    }

    pub fn routing_table(&self) -> &SharedRoutingTable {
        &self.table
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // === Public Methods ===

    /// Returns true if `contact` answered within the request timeout.
    pub fn ping(&self, contact: &Contact) -> bool {
        match self
            .transport
            .send(contact, Request::Ping, self.config.request_timeout)
        {
            Ok(Reply::Pong) => true,
            Ok(reply) => {
                debug!(from = ?contact.id, ?reply, "Unexpected reply to ping");
                true
            }
            Err(error) => {
                trace!(to = ?contact.id, ?error, "Ping failed");
                false
            }
        }
    }

    /// Insert a contact into the routing table, probing the least recently
    /// seen contact of a full bucket without holding the table lock.
    pub fn insert_contact(&self, contact: Contact) -> Result<InsertResult> {
        let admission = self.table.write().try_insert(contact.clone())?;

        match admission {
            Admission::Done(result) => Ok(result),
            Admission::Probe { least_recent } => {
                let alive = self.ping(&least_recent);

                self.table
                    .write()
                    .complete_probe(contact, &least_recent.id, alive)
            }
        }
    }

    /// Populate the routing table from `seeds`, look up the local id, then
    /// refresh every bucket range further away than the closest neighbour.
    ///
    /// Returns the result of the local id lookup.
    pub fn bootstrap(&self, seeds: impl IntoIterator<Item = Contact>) -> LookupResult {
        for seed in seeds {
            if let Err(error) = self.insert_contact(seed) {
                debug!(?error, "Ignoring bootstrap contact");
            }
        }

        let result = self.find_node(self.local);

        let nearest = result
            .closest
            .first()
            .and_then(|contact| self.local.distance(&contact.id).bucket_index().ok());

        let mut refreshed = 0;

        if let Some(nearest) = nearest {
            for index in nearest + 1..ID_BITS {
                let target = self
                    .local
                    .at_distance(&BucketRange::leaf(index).random_distance());

                self.find_node(target);
                refreshed += 1;
            }
        }

        debug!(
            size = self.table.read().size(),
            status = ?result.status,
            refreshed,
            "Bootstrapped"
        );

        result
    }

    /// Find the k closest nodes to `target`.
    pub fn find_node(&self, target: Id) -> LookupResult {
        self.find_node_with(target, &CancellationToken::default())
    }

    pub fn find_node_with(&self, target: Id, cancel: &CancellationToken) -> LookupResult {
        self.traverse(target, Request::FindNode { target }, cancel)
            .query
            .into_result()
    }

    /// Find the value stored under `key`, or the k closest nodes to it.
    ///
    /// A found value is also stored at the closest node that answered
    /// without it.
    pub fn find_value(&self, key: Id) -> ValueLookup {
        self.find_value_with(key, &CancellationToken::default())
    }

    pub fn find_value_with(&self, key: Id, cancel: &CancellationToken) -> ValueLookup {
        let Traversal { query, value } = self.traverse(key, Request::FindValue { key }, cancel);

        let mut cached_at = None;

        if let Some((_, value)) = &value {
            if let Some(closest) = query.responders().nodes().first() {
                let request = Request::Store {
                    key,
                    value: value.clone(),
                };

                match self
                    .transport
                    .send(closest, request, self.config.request_timeout)
                {
                    Ok(_) => {
                        trace!(?key, at = ?closest.id, "Cached value on path");
                        cached_at = Some(closest.clone());
                    }
                    Err(error) => {
                        debug!(?key, at = ?closest.id, ?error, "Failed to cache value on path");
                    }
                }
            }
        }

        let (holder, value) = match value {
            Some((holder, value)) => (Some(holder), Some(value)),
            None => (None, None),
        };

        ValueLookup {
            value,
            holder,
            cached_at,
            lookup: query.into_result(),
        }
    }

    /// Store `value` at the k closest nodes to `key`.
    pub fn store_value(&self, key: Id, value: Bytes) -> StoreOutcome {
        let lookup = self.find_node(key);

        let mut stored_at = Vec::new();
        let mut failed = Vec::new();

        let request = Request::Store { key, value };

        for (contact, reply) in self.dispatch(lookup.closest.clone(), &request) {
            match reply {
                Ok(_) => {
                    self.seen(&contact);
                    stored_at.push(contact);
                }
                Err(error) => {
                    warn!(?key, to = ?contact.id, ?error, "Failed to store value");
                    self.table.write().record_failure(&contact.id);
                    failed.push(contact);
                }
            }
        }

        debug!(
            ?key,
            stored = stored_at.len(),
            failed = failed.len(),
            "Stored value"
        );

        StoreOutcome {
            key,
            stored_at,
            failed,
            lookup,
        }
    }

    // === Private Methods ===

    fn traverse(&self, target: Id, request: Request, cancel: &CancellationToken) -> Traversal {
        let seeds = {
            let mut table = self.table.write();
            table.touch(&target, Instant::now());
            table.find_closest(&target, self.config.k)
        };

        debug!(?target, kind = request.kind(), seeds = seeds.len(), "Starting lookup");

        let mut query = IterativeQuery::new(self.local, target, self.config.k, self.config.alpha);
        query.seed(seeds);

        let mut value = None;

        loop {
            if cancel.is_cancelled() {
                debug!(?target, "Lookup cancelled");
                query.cancel();
                break;
            }

            let batch = query.next_round();
            if batch.is_empty() {
                break;
            }

            for (contact, reply) in self.dispatch(batch, &request) {
                match reply {
                    Ok(Reply::Nodes(nodes)) => {
                        self.seen(&contact);
                        query.add_reply(&contact, nodes);
                    }
                    Ok(Reply::Value(found)) => {
                        self.seen(&contact);
                        if value.is_none() {
                            value = Some((contact, found));
                        }
                    }
                    Ok(reply) => {
                        debug!(from = ?contact.id, ?reply, "Unexpected reply to lookup");
                        self.seen(&contact);
                        query.add_reply(&contact, Vec::new());
                    }
                    Err(error) => {
                        debug!(to = ?contact.id, ?error, "Lookup request failed");
                        self.table.write().record_failure(&contact.id);
                        query.add_failure(&contact.id);
                    }
                }
            }

            if value.is_some() {
                query.converge();
                break;
            }

            if query.finish_round().is_done() {
                break;
            }
        }

        Traversal { query, value }
    }

    /// Send `request` to every contact in parallel and collect the replies in
    /// the same order. Contacts that didn't reply in time get [Error::Timeout].
    fn dispatch(&self, batch: Vec<Contact>, request: &Request) -> Vec<(Contact, Result<Reply>)> {
        let timeout = self.config.request_timeout;
        let (sender, receiver) = flume::bounded(batch.len());

        for (index, contact) in batch.iter().enumerate() {
            let sender = sender.clone();
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            let contact = contact.clone();

            thread::spawn(move || {
                trace!(to = ?contact.id, kind = request.kind(), "Sending request");

                let reply = transport.send(&contact, request, timeout);

                // The round may be over already.
                let _ = sender.send((index, reply));
            });
        }
        drop(sender);

        let deadline = Instant::now() + timeout + ROUND_SLACK;
        let mut replies: Vec<Option<Result<Reply>>> = batch.iter().map(|_| None).collect();
        let mut pending = batch.len();

        while pending > 0 {
            match receiver.recv_deadline(deadline) {
                Ok((index, reply)) => {
                    replies[index] = Some(reply);
                    pending -= 1;
                }
                Err(_) => break,
            }
        }

        batch
            .into_iter()
            .zip(replies)
            .map(|(contact, reply)| {
                (
                    contact,
                    reply.unwrap_or_else(|| Err(Error::Timeout(timeout))),
                )
            })
            .collect()
    }

    /// Refresh a contact that just answered us.
    fn seen(&self, contact: &Contact) {
        let fresh = Contact::new(contact.id, contact.address);

        if let Err(error) = self.insert_contact(fresh) {
            trace!(?error, id = ?contact.id, "Could not add responding contact");
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::{HashMap, HashSet};
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use super::*;
    use crate::common::{BucketRange, RoutingTable};
    use crate::rpc::LookupStatus;

    /// Answers every lookup with the nodes it was told about, records stores.
    #[derive(Debug, Default)]
    struct MockTransport {
        peers: HashMap<Id, Vec<Contact>>,
        values: HashMap<Id, Bytes>,
        offline: HashSet<Id>,
        /// Peers that answer long after any request timeout.
        slow: HashSet<Id>,
        stores: Mutex<Vec<(Id, Id)>>,
        requests: Mutex<usize>,
    }

    impl Transport for MockTransport {
        fn send(&self, to: &Contact, request: Request, timeout: Duration) -> Result<Reply> {
            *self.requests.lock().unwrap() += 1;

            if self.offline.contains(&to.id) {
                return Err(Error::Timeout(timeout));
            }

            if self.slow.contains(&to.id) {
                thread::sleep(SLOW_REPLY);
            }

            Ok(match request {
                Request::Ping => Reply::Pong,
                Request::FindNode { .. } => {
                    Reply::Nodes(self.peers.get(&to.id).cloned().unwrap_or_default())
                }
                Request::FindValue { .. } => match self.values.get(&to.id) {
                    Some(value) => Reply::Value(value.clone()),
                    None => Reply::Nodes(self.peers.get(&to.id).cloned().unwrap_or_default()),
                },
                Request::Store { key, .. } => {
                    self.stores.lock().unwrap().push((to.id, key));
                    Reply::Stored
                }
            })
        }
    }

    const SLOW_REPLY: Duration = Duration::from_millis(1500);

    fn contact(port: u16) -> Contact {
        Contact::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn coordinator(transport: MockTransport) -> LookupCoordinator<MockTransport> {
        let config = Config {
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        };

        LookupCoordinator::new(
            RoutingTable::new(Id::random()).into(),
            Arc::new(transport),
            config,
        )
    }

    #[test]
    fn empty_table_is_exhausted() {
        let coordinator = coordinator(MockTransport::default());

        let result = coordinator.find_node(Id::random());

        assert_eq!(result.status, LookupStatus::Exhausted);
        assert!(result.closest.is_empty());
        assert_eq!(*coordinator.transport().requests.lock().unwrap(), 0);
    }

    #[test]
    fn find_node_discovers_through_peers() {
        let seed = contact(1);
        let hidden: Vec<_> = (2..10).map(contact).collect();

        let mut transport = MockTransport::default();
        transport.peers.insert(seed.id, hidden.clone());

        let coordinator = coordinator(transport);
        coordinator.insert_contact(seed.clone()).unwrap();

        let result = coordinator.find_node(hidden[0].id);

        assert_eq!(result.status, LookupStatus::Converged);
        assert_eq!(result.closest.len(), hidden.len() + 1);
        assert_eq!(result.closest[0], hidden[0]);
        assert_eq!(result.rounds, 2);

        assert!(coordinator.routing_table().read().contains(&hidden[0].id));
    }

    #[test]
    fn failed_nodes_are_dropped() {
        let seed = contact(1);
        let dead = contact(2);

        let mut transport = MockTransport::default();
        transport.peers.insert(seed.id, vec![dead.clone()]);
        transport.offline.insert(dead.id);

        let coordinator = coordinator(transport);
        coordinator.insert_contact(seed.clone()).unwrap();

        let result = coordinator.find_node(dead.id);

        assert_eq!(result.closest, vec![seed]);
        // Failures alone never converge, the lookup runs out of candidates.
        assert_eq!(result.status, LookupStatus::Exhausted);
    }

    #[test]
    fn find_value_caches_on_path() {
        let near = contact(1);
        let holder = contact(2);
        let key = holder.id;

        let mut transport = MockTransport::default();
        transport.peers.insert(near.id, vec![holder.clone()]);
        transport.values.insert(holder.id, Bytes::from_static(b"hello"));

        let coordinator = coordinator(transport);
        coordinator.insert_contact(near.clone()).unwrap();

        let lookup = coordinator.find_value(key);

        assert_eq!(lookup.value, Some(Bytes::from_static(b"hello")));
        assert_eq!(lookup.holder, Some(holder));
        assert_eq!(lookup.cached_at, Some(near.clone()));
        assert_eq!(lookup.lookup.status, LookupStatus::Converged);

        let stores = coordinator.transport().stores.lock().unwrap();
        assert_eq!(*stores, vec![(near.id, key)]);
    }

    #[test]
    fn find_value_without_value() {
        let seed = contact(1);

        let coordinator = coordinator(MockTransport::default());
        coordinator.insert_contact(seed.clone()).unwrap();

        let lookup = coordinator.find_value(Id::random());

        assert!(lookup.value.is_none());
        assert!(lookup.cached_at.is_none());
        assert_eq!(lookup.lookup.closest, vec![seed]);
    }

    #[test]
    fn store_value_at_closest() {
        let peers: Vec<_> = (1..6).map(contact).collect();

        let mut transport = MockTransport::default();
        transport.offline.insert(peers[0].id);

        let coordinator = coordinator(transport);
        for peer in &peers {
            coordinator.insert_contact(peer.clone()).unwrap();
        }

        // The offline peer is the closest, it fails during the lookup and
        // never receives the value.
        let key = peers[0].id;
        let outcome = coordinator.store_value(key, Bytes::from_static(b"v"));

        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.stored_at.len(), 4);
        assert!(!outcome.stored_at.contains(&peers[0]));

        let stores = coordinator.transport().stores.lock().unwrap();
        assert_eq!(stores.len(), 4);
        assert!(stores.iter().all(|(to, stored)| *to != key && *stored == key));
    }

    #[test]
    fn late_reply_does_not_block_round() {
        let fast = contact(1);
        let slow = contact(2);

        let mut transport = MockTransport::default();
        transport.slow.insert(slow.id);

        let coordinator = coordinator(transport);
        coordinator.insert_contact(fast.clone()).unwrap();
        coordinator.insert_contact(slow.clone()).unwrap();

        let timeout = coordinator.config().request_timeout;

        let start = Instant::now();
        let result = coordinator.find_node(slow.id);
        let elapsed = start.elapsed();

        assert!(elapsed >= timeout, "round ended before the deadline: {elapsed:?}");
        assert!(elapsed < SLOW_REPLY / 2, "round waited for the late reply: {elapsed:?}");
        assert_eq!(result.closest, vec![fast.clone()]);
        assert_eq!(result.status, LookupStatus::Converged);
        assert_eq!(result.rounds, 1);

        let start = Instant::now();
        let replies = coordinator.dispatch(vec![slow.clone(), fast.clone()], &Request::Ping);

        assert!(start.elapsed() < timeout + ROUND_SLACK + Duration::from_millis(200));
        assert_eq!(replies[0], (slow, Err(Error::Timeout(timeout))));
        assert_eq!(replies[1], (fast, Ok(Reply::Pong)));
    }

    #[test]
    fn bootstrap_refreshes_further_buckets() {
        let mut transport = MockTransport::default();
        let local = Id::random();

        let at_leaf = |index: u8, port: u16| {
            Contact::new(
                local.at_distance(&BucketRange::leaf(index).random_distance()),
                SocketAddr::from(([127, 0, 0, 1], port)),
            )
        };

        let seed = at_leaf(150, 1);
        let far = at_leaf(159, 2);
        transport.peers.insert(seed.id, vec![far.clone()]);

        let coordinator = LookupCoordinator::new(
            RoutingTable::new(local).into(),
            Arc::new(transport),
            Config {
                request_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );

        let result = coordinator.bootstrap(vec![seed.clone()]);

        assert_eq!(result.closest, vec![seed.clone(), far.clone()]);
        assert_eq!(result.status, LookupStatus::Converged);

        // Only the lookup into the far range ever queries `far`.
        let table = coordinator.routing_table().read();
        assert!(table.contains(&seed.id));
        assert!(table.contains(&far.id));
    }

    #[test]
    fn cancelled_before_first_round() {
        let coordinator = coordinator(MockTransport::default());
        coordinator.insert_contact(contact(1)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = coordinator.find_node_with(Id::random(), &cancel);

        assert_eq!(result.status, LookupStatus::Cancelled);
        assert_eq!(result.rounds, 0);
    }

    #[test]
    fn full_bucket_probe_keeps_live_contact() {
        let table = RoutingTable::new(Id::random()).with_bucket_size(1);
        let coordinator = LookupCoordinator::new(
            table.into(),
            Arc::new(MockTransport::default()),
            Config::default(),
        );

        let local = *coordinator.local_id();
        let far = |byte: u8| {
            let mut bytes = [0; 20];
            bytes[0] = byte;
            Contact::new(
                local.at_distance(&crate::common::Distance(bytes)),
                SocketAddr::from(([127, 0, 0, 1], byte as u16)),
            )
        };

        let first = far(0x80);
        let second = far(0x81);

        coordinator.insert_contact(first.clone()).unwrap();
        let result = coordinator.insert_contact(second).unwrap();

        assert_eq!(result, InsertResult::Rejected { cached: true });
        assert!(coordinator.routing_table().read().contains(&first.id));
    }
}
