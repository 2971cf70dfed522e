//! Group membership snapshots.

use cohort_proto::{NodeId, SubgroupId, SubgroupTypeId, ViewId};
use std::collections::BTreeMap;

/// Delivery mode of a shard's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Totally-ordered delivery to every member.
    Ordered,
    /// Raw delivery with no ordering promise.
    Raw,
}

/// A partition of a subgroup with its own channel.
#[derive(Debug, Clone)]
pub struct Shard {
    pub members: Vec<NodeId>,
    pub mode: Mode,
    /// `senders[i]` is true iff `members[i]` may send on this shard.
    pub senders: Vec<bool>,
}

impl Shard {
    pub fn ordered(members: Vec<NodeId>) -> Shard {
        let senders = vec![true; members.len()];
        Shard {
            members,
            mode: Mode::Ordered,
            senders,
        }
    }
}

/// Shard layout of one subgroup within a view.
#[derive(Debug, Clone)]
pub struct SubgroupLayout {
    pub type_id: SubgroupTypeId,
    pub shards: Vec<Shard>,
}

/// A numbered, immutable snapshot of group membership and subgroup layout.
#[derive(Debug, Clone)]
pub struct View {
    pub vid: ViewId,
    /// Ordered list of all members of the group.
    pub members: Vec<NodeId>,
    pub subgroups: BTreeMap<SubgroupId, SubgroupLayout>,
    /// Nodes that failed out of the previous view.
    pub failed: Vec<NodeId>,
}

impl View {
    pub fn new(vid: ViewId, members: Vec<NodeId>) -> View {
        View {
            vid,
            members,
            subgroups: BTreeMap::new(),
            failed: Vec::new(),
        }
    }

    /// Adds a single-shard ordered subgroup; the common case in tests and
    /// small deployments.
    pub fn with_subgroup(
        mut self,
        subgroup: SubgroupId,
        type_id: SubgroupTypeId,
        members: Vec<NodeId>,
    ) -> View {
        self.subgroups.insert(
            subgroup,
            SubgroupLayout {
                type_id,
                shards: vec![Shard::ordered(members)],
            },
        );
        self
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    /// All members of a subgroup, across its shards, in layout order.
    pub fn members_of(&self, subgroup: SubgroupId) -> Vec<NodeId> {
        match self.subgroups.get(&subgroup) {
            Some(layout) => layout
                .shards
                .iter()
                .flat_map(|s| s.members.iter().copied())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn subgroup_contains(&self, subgroup: SubgroupId, node: NodeId) -> bool {
        self.subgroups
            .get(&subgroup)
            .is_some_and(|layout| layout.shards.iter().any(|s| s.members.contains(&node)))
    }
}
