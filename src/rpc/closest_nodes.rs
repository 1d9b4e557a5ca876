use std::{cmp::Ordering, vec::IntoIter};

use crate::common::{Contact, Distance, Id};

/// Contacts sorted by their distance to a target, without duplicates.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Contact>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Contact] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Distance of the closest node to the target.
    pub fn closest_distance(&self) -> Option<Distance> {
        self.nodes.first().map(|node| node.id.distance(&self.target))
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_ok()
    }

    // === Public Methods ===

    /// Add a node in its sorted position, returns false if it was already there.
    pub fn add(&mut self, node: Contact) -> bool {
        match self.position(&node.id) {
            Err(pos) => {
                self.nodes.insert(pos, node);
                true
            }
            Ok(_) => false,
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        self.position(id).ok().map(|pos| self.nodes.remove(pos))
    }

    /// Keep only the `count` closest nodes.
    pub fn truncate(&mut self, count: usize) {
        self.nodes.truncate(count);
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Result<usize, usize> {
        let seek = id.distance(&self.target);

        self.nodes.binary_search_by(|probe| {
            if probe.id == *id {
                Ordering::Equal
            } else {
                probe.id.distance(&self.target).cmp(&seek)
            }
        })
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Contact;
    type IntoIter = IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add() {
        let target = Id::random();

        let mut closest_nodes = ClosestNodes::new(target);

        for _ in 0..10 {
            let node = Contact::random();
            assert!(closest_nodes.add(node.clone()));
            assert!(!closest_nodes.add(node));
        }

        assert_eq!(closest_nodes.nodes().len(), 10);

        let distances = closest_nodes
            .nodes()
            .iter()
            .map(|n| n.id.distance(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
        assert_eq!(closest_nodes.closest_distance(), sorted.first().copied());
    }

    #[test]
    fn remove_and_truncate() {
        let target = Id::random();
        let mut closest_nodes = ClosestNodes::new(target);

        let nodes: Vec<_> = (0..5).map(|_| Contact::random()).collect();
        for node in &nodes {
            closest_nodes.add(node.clone());
        }

        let removed = nodes[2].clone();
        assert_eq!(closest_nodes.remove(&removed.id), Some(removed.clone()));
        assert!(!closest_nodes.contains(&removed.id));
        assert_eq!(closest_nodes.remove(&removed.id), None);

        closest_nodes.truncate(2);
        assert_eq!(closest_nodes.len(), 2);
    }
}
