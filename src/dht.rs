//! Dht node.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{Contact, HashProvider, Id, RoutingTable, Sha1HashProvider, SharedRoutingTable};
use crate::rpc::{Config, LookupCoordinator, LookupResult, Reply, Request, StoreOutcome, Transport};
use crate::scheduler::Scheduler;
use crate::server::{DefaultServer, Server};
use crate::storage::{MemoryStorage, Origin, Storage};

/// What a call to [Dht::tick] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Number of buckets refreshed with a lookup.
    pub refreshed: usize,
    /// Number of replica values sent to the nodes closest to their keys.
    pub replicated: usize,
    /// Number of locally published values published again.
    pub republished: usize,
    /// Number of expired values dropped.
    pub swept: usize,
}

/// A Kademlia node: routing table, lookups, local storage and maintenance.
///
/// Incoming requests are handed to [Dht::handle_request] by whatever owns
/// the sockets, outgoing ones go through the [Transport].
#[derive(Debug)]
pub struct Dht<T: Transport> {
    local: Contact,
    table: SharedRoutingTable,
    lookups: LookupCoordinator<T>,
    hasher: Box<dyn HashProvider>,
    storage: Mutex<Box<dyn Storage>>,
    server: Mutex<Box<dyn Server>>,
    scheduler: Mutex<Scheduler>,
    config: Config,
}

impl<T: Transport> Dht<T> {
    pub fn new(local: Contact, transport: Arc<T>, mut config: Config) -> Self {
        config.k = config.k.max(1);

        let table: SharedRoutingTable = RoutingTable::new(local.id)
            .with_bucket_size(config.k)
            .with_replacement_cache_size(config.replacement_cache_size)
            .with_max_failures(config.max_failures)
            .into();

        let server = DefaultServer {
            k: config.k,
            ttl: config.expire_interval,
        };

        Dht {
            lookups: LookupCoordinator::new(table.clone(), transport, config.clone()),
            table,
            hasher: Box::new(Sha1HashProvider),
            storage: Mutex::new(Box::new(MemoryStorage::new(config.storage_capacity))),
            server: Mutex::new(Box::new(server)),
            scheduler: Mutex::new(Scheduler::new(&config)),
            local,
            config,
        }
    }

    // === Options ===

    /// Replace the default [MemoryStorage].
    pub fn with_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Mutex::new(Box::new(storage));
        self
    }

    /// Replace the [DefaultServer].
    pub fn with_server(mut self, server: impl Server + 'static) -> Self {
        self.server = Mutex::new(Box::new(server));
        self
    }

    /// Replace the [Sha1HashProvider] used by [Dht::put_hashed].
    pub fn with_hasher(mut self, hasher: impl HashProvider + 'static) -> Self {
        self.hasher = Box::new(hasher);
        self
    }

    // === Getters ===

    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn id(&self) -> &Id {
        &self.local.id
    }

    pub fn routing_table(&self) -> &SharedRoutingTable {
        &self.table
    }

    pub fn lookups(&self) -> &LookupCoordinator<T> {
        &self.lookups
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // === Public Methods ===

    /// Answer a request received from `from`, after adding it to the routing table.
    pub fn handle_request(&self, from: Contact, request: Request) -> Reply {
        if from.id != self.local.id {
            if let Err(error) = self.lookups.insert_contact(from.clone()) {
                trace!(?error, from = ?from.id, "Could not add requester");
            }
        }

        let table = self.table.read();
        let mut storage = lock(&self.storage);

        lock(&self.server).handle_request(&table, storage.as_mut(), &from, request)
    }

    pub fn bootstrap(&self, seeds: impl IntoIterator<Item = Contact>) -> LookupResult {
        self.lookups.bootstrap(seeds)
    }

    pub fn find_node(&self, target: Id) -> LookupResult {
        self.lookups.find_node(target)
    }

    /// Publish `value` under `key`, keeping a copy that gets republished
    /// as long as this node runs.
    pub fn put(&self, key: Id, value: Bytes) -> StoreOutcome {
        lock(&self.storage).put(
            key,
            value.clone(),
            self.config.expire_interval,
            Origin::Published,
        );

        self.lookups.store_value(key, value)
    }

    /// Publish `value` under the hash of its content, see [Dht::with_hasher].
    pub fn put_hashed(&self, value: Bytes) -> StoreOutcome {
        let key = self.hasher.generate_id(&value);

        self.put(key, value)
    }

    /// Get the value stored under `key`, locally or from the network.
    pub fn get(&self, key: &Id) -> Option<Bytes> {
        if let Ok(value) = lock(&self.storage).get(key) {
            return Some(value);
        }

        self.lookups.find_value(*key).value
    }

    /// Run the maintenance tasks due at `now`.
    pub fn tick(&self, now: Instant) -> MaintenanceReport {
        let (tasks, refresh_targets) = {
            let table = self.table.read();
            let tasks = lock(&self.scheduler).due(now, &table);

            let targets: Vec<Id> = tasks
                .buckets_to_refresh
                .iter()
                .filter_map(|index| table.refresh_bucket(*index).ok())
                .collect();

            (tasks, targets)
        };

        let mut report = MaintenanceReport::default();

        for target in refresh_targets {
            self.lookups.find_node(target);
            report.refreshed += 1;
        }

        if tasks.replicate {
            let replicas = lock(&self.storage).entries(Origin::Replica);

            for (key, value) in replicas {
                self.lookups.store_value(key, value);
                report.replicated += 1;
            }
        }

        if tasks.republish {
            let published = lock(&self.storage).entries(Origin::Published);

            for (key, value) in published {
                lock(&self.storage).put(
                    key,
                    value.clone(),
                    self.config.expire_interval,
                    Origin::Published,
                );
                self.lookups.store_value(key, value);
                report.republished += 1;
            }
        }

        if tasks.sweep {
            report.swept = lock(&self.storage).sweep_expired(now);
        }

        if report != MaintenanceReport::default() {
            debug!(?report, "Maintenance");
        }

        report
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
