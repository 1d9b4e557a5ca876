//! State of a single iterative lookup.

use std::collections::HashSet;

use tracing::{debug, trace};

use super::ClosestNodes;
use crate::common::{Contact, Distance, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Waiting for the initial candidates from the routing table.
    Seeding,
    /// Rounds of requests are in progress.
    Querying,
    /// A round brought nothing closer, or a value was found.
    Converged,
    /// Every candidate in the shortlist was queried.
    Exhausted,
    /// Aborted between rounds.
    Cancelled,
}

impl QueryState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            QueryState::Converged | QueryState::Exhausted | QueryState::Cancelled
        )
    }
}

/// How a lookup ended. None of these are errors, a lookup always returns the
/// best contacts it found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Converged,
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LookupResult {
    pub target: Id,
    /// Up to k closest contacts known when the lookup ended, closest first.
    pub closest: Vec<Contact>,
    pub status: LookupStatus,
    /// Number of request rounds sent.
    pub rounds: usize,
}

/// An iterative process of concurrently sending a request to the closest known nodes to
/// the target, merging closer nodes discovered in the responses, and
/// repeating this process until no closer nodes are found.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    local: Id,
    k: usize,
    alpha: usize,
    /// The k closest candidates known so far.
    shortlist: ClosestNodes,
    /// Nodes that answered with more nodes.
    responders: ClosestNodes,
    queried: HashSet<Id>,
    failed: HashSet<Id>,
    state: QueryState,
    rounds: usize,
    /// Closest distance known when the current round started.
    best_before_round: Option<Distance>,
    round_replied: bool,
}

impl IterativeQuery {
    pub fn new(local: Id, target: Id, k: usize, alpha: usize) -> Self {
        trace!(?target, "New Query");

        Self {
            local,
            k,
            alpha,
            shortlist: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),
            queried: HashSet::new(),
            failed: HashSet::new(),
            state: QueryState::Seeding,
            rounds: 0,
            best_before_round: None,
            round_replied: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.shortlist.target()
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn shortlist(&self) -> &ClosestNodes {
        &self.shortlist
    }

    /// Nodes that answered without the value we looked for, closest first.
    pub fn responders(&self) -> &ClosestNodes {
        &self.responders
    }

    // === Public Methods ===

    /// Initialize the shortlist with the closest nodes from the routing table.
    pub fn seed(&mut self, seeds: Vec<Contact>) {
        for node in seeds {
            self.add_candidate(node);
        }
        self.shortlist.truncate(self.k);

        self.state = QueryState::Querying;
    }

    /// Pick the next up to alpha closest unqueried candidates and mark them queried.
    ///
    /// An empty batch means the query is done, possibly because it just got exhausted.
    pub fn next_round(&mut self) -> Vec<Contact> {
        if self.state.is_done() {
            return Vec::new();
        }

        let batch: Vec<Contact> = self
            .shortlist
            .nodes()
            .iter()
            .filter(|node| !self.queried.contains(&node.id))
            .take(self.alpha)
            .cloned()
            .collect();

        if batch.is_empty() {
            self.state = QueryState::Exhausted;
            debug!(target = ?self.target(), rounds = self.rounds, "Query exhausted");
            return batch;
        }

        for node in &batch {
            self.queried.insert(node.id);
        }

        self.best_before_round = self.shortlist.closest_distance();
        self.round_replied = false;
        self.rounds += 1;

        batch
    }

    /// Merge the nodes a queried node replied with.
    pub fn add_reply(&mut self, from: &Contact, candidates: Vec<Contact>) {
        self.round_replied = true;
        self.responders.add(from.clone());

        for candidate in candidates {
            self.add_candidate(candidate);
        }

        self.shortlist.truncate(self.k);
    }

    /// A queried node timed out or errored, it can't be among the results.
    pub fn add_failure(&mut self, id: &Id) {
        self.failed.insert(*id);
        self.shortlist.remove(id);
    }

    /// Decide whether the round that just completed warrants another one.
    pub fn finish_round(&mut self) -> QueryState {
        if self.state.is_done() || !self.round_replied {
            // Nothing learned, try the next candidates.
            return self.state;
        }

        let improved = match (self.shortlist.closest_distance(), self.best_before_round) {
            (Some(now), Some(before)) => now < before,
            _ => false,
        };

        if !improved {
            self.state = QueryState::Converged;
            debug!(target = ?self.target(), rounds = self.rounds, "Query converged");
        }

        self.state
    }

    /// End the query early, e.g. when the value was found.
    pub fn converge(&mut self) {
        self.state = QueryState::Converged;
    }

    pub fn cancel(&mut self) {
        self.state = QueryState::Cancelled;
    }

    pub fn into_result(self) -> LookupResult {
        let status = match self.state {
            QueryState::Converged => LookupStatus::Converged,
            QueryState::Cancelled => LookupStatus::Cancelled,
            _ => LookupStatus::Exhausted,
        };

        LookupResult {
            target: self.shortlist.target(),
            closest: self.shortlist.into_iter().collect(),
            status,
            rounds: self.rounds,
        }
    }

    // === Private Methods ===

    fn add_candidate(&mut self, node: Contact) {
        if node.id == self.local || self.failed.contains(&node.id) {
            return;
        }

        self.shortlist.add(node);
    }
}
