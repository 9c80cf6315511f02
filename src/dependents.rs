//! Bidirectional bookkeeping of which entities depend on which.
//!
//! The graph only changes through [`DependencyGraph::add_edge`] and
//! [`DependencyGraph::remove_edge`], which always update both ends, so that
//! `b ∈ a.depends_on ⇔ a ∈ b.depended_by` holds after every call.
use serde::{Deserialize, Serialize};

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::BuildHasherDefault;

use seahash::SeaHasher;

use crate::identity::Uid;

pub type UidHasher = BuildHasherDefault<SeaHasher>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependents {
    depends_on: BTreeSet<Uid>,
    depended_by: BTreeSet<Uid>,
}

impl Dependents {
    pub fn new(depends_on: BTreeSet<Uid>, depended_by: BTreeSet<Uid>) -> Self {
        Self { depends_on, depended_by }
    }
    pub fn depends_on(&self) -> &BTreeSet<Uid> {
        &self.depends_on
    }
    pub fn depended_by(&self) -> &BTreeSet<Uid> {
        &self.depended_by
    }
    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty() && self.depended_by.is_empty()
    }
}

// An edge as seen from both of its ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Asymmetry {
    pub from: Uid,
    pub to: Uid,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<Uid, Dependents, UidHasher>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    pub fn contains(&self, uid: &Uid) -> bool {
        self.nodes.contains_key(uid)
    }
    pub fn dependents(&self, uid: &Uid) -> Option<&Dependents> {
        self.nodes.get(uid)
    }

    // Returns false if the node was already present.
    pub(crate) fn insert_node(&mut self, uid: Uid) -> bool {
        match self.nodes.entry(uid) {
            Entry::Vacant(e) => {
                e.insert(Dependents::default());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Removes a node nobody depends on, dropping its outgoing edges from
    /// the nodes it depended on. Returns the removed node, or `None` if it is
    /// absent or still depended on.
    pub(crate) fn remove_node(&mut self, uid: &Uid) -> Option<Dependents> {
        if self.nodes.get(uid).is_none_or(|d| !d.depended_by.is_empty()) {
            return None;
        }
        let removed = self.nodes.remove(uid)?;
        for target in &removed.depends_on {
            if let Some(node) = self.nodes.get_mut(target) {
                node.depended_by.remove(uid);
            }
        }
        Some(removed)
    }

    /// Adds `from -> to` on both ends. Both nodes must exist; returns false
    /// when either is missing or the edge is already there.
    pub(crate) fn add_edge(&mut self, from: Uid, to: Uid) -> bool {
        if !self.contains(&from) || !self.contains(&to) {
            return false;
        }
        if self.nodes.get(&from).is_some_and(|d| d.depends_on.contains(&to)) {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(&from) {
            node.depends_on.insert(to);
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            node.depended_by.insert(from);
        }
        true
    }

    /// Removes `from -> to` from both ends; false if there was no such edge.
    pub(crate) fn remove_edge(&mut self, from: Uid, to: Uid) -> bool {
        let removed = self.nodes.get_mut(&from).is_some_and(|d| d.depends_on.remove(&to));
        if removed {
            if let Some(node) = self.nodes.get_mut(&to) {
                node.depended_by.remove(&from);
            }
        }
        removed
    }

    /// Whether `to` can be reached from `from` by following `depends_on`
    /// edges. Every node reaches itself.
    pub fn reaches(&self, from: Uid, to: Uid) -> bool {
        from == to || self.reachable([from]).contains(&to)
    }

    /// Every node reachable from `roots` by following `depends_on` edges,
    /// roots included. Roots that are not in the graph are ignored.
    pub fn reachable(&self, roots: impl IntoIterator<Item = Uid>) -> BTreeSet<Uid> {
        self.walk(roots, |node| &node.depends_on)
    }

    /// The nodes lying on some path from `from` to `to`, both ends included.
    /// Adding the edge `to -> from` would put exactly these nodes on a
    /// cycle. Empty when `to` cannot be reached.
    pub fn between(&self, from: Uid, to: Uid) -> BTreeSet<Uid> {
        let ahead = self.reachable([from]);
        if !ahead.contains(&to) {
            return BTreeSet::new();
        }
        let behind = self.walk([to], |node| &node.depended_by);
        ahead.intersection(&behind).copied().collect()
    }

    fn walk<'a>(
        &'a self,
        roots: impl IntoIterator<Item = Uid>,
        next: impl Fn(&'a Dependents) -> &'a BTreeSet<Uid>,
    ) -> BTreeSet<Uid> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<Uid> = roots.into_iter().filter(|uid| self.contains(uid)).collect();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(next(node).iter().filter(|uid| !seen.contains(*uid)));
            }
        }
        seen
    }

    /// Every edge recorded on only one of its ends.
    pub fn asymmetries(&self) -> Vec<Asymmetry> {
        let mut found = Vec::new();
        for (uid, node) in &self.nodes {
            for to in &node.depends_on {
                if !self.nodes.get(to).is_some_and(|d| d.depended_by.contains(uid)) {
                    found.push(Asymmetry { from: *uid, to: *to });
                }
            }
            for from in &node.depended_by {
                if !self.nodes.get(from).is_some_and(|d| d.depends_on.contains(uid)) {
                    found.push(Asymmetry { from: *from, to: *uid });
                }
            }
        }
        found
    }
    pub fn is_symmetric(&self) -> bool {
        self.asymmetries().is_empty()
    }
}
