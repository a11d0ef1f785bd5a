//! # quorum
//!
//! why: decide when a set of nodes is enough to elect a leader or commit an entry
//! relations: consulted by state.rs for votes and commit index, by replication.rs for read-index rounds
//! what: Voter, Quorum policies, commit index computation

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::{NodeId, Seq};

/// a node counted towards a quorum, with the group label it reported
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Voter {
    pub id: NodeId,
    pub group: Option<String>,
}

impl Voter {
    pub fn new(id: NodeId, group: Option<String>) -> Self {
        Self { id, group }
    }
}

type Predicate = dyn Fn(&[Voter]) -> bool + Send + Sync;

/// Quorum policy
#[derive(Clone, Default)]
pub enum Quorum {
    /// strict majority of the known nodes
    #[default]
    Majority,
    /// at least this many distinct nodes
    Size(usize),
    /// arbitrary predicate over the voters (leader or candidate included)
    Custom(Arc<Predicate>),
}

impl Quorum {
    pub fn custom(predicate: impl Fn(&[Voter]) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// voters must span at least `n` distinct groups
    pub fn distinct_groups(n: usize) -> Self {
        Self::custom(move |voters| {
            let groups: HashSet<&str> = voters.iter().filter_map(|v| v.group.as_deref()).collect();
            groups.len() >= n
        })
    }

    /// number of distinct nodes needed, when the policy is size based
    fn required(&self, cluster_size: usize) -> Option<usize> {
        match self {
            Self::Majority => Some(cluster_size / 2 + 1),
            Self::Size(n) => Some(*n),
            Self::Custom(_) => None,
        }
    }

    pub fn is_satisfied(&self, voters: &[Voter], cluster_size: usize) -> bool {
        match self {
            Self::Custom(predicate) => predicate(voters),
            _ => {
                let distinct: HashSet<NodeId> = voters.iter().map(|v| v.id).collect();
                self.required(cluster_size)
                    .is_some_and(|needed| distinct.len() >= needed)
            }
        }
    }

    /// highest index replicated on a qualifying set of nodes
    ///
    /// every qualifying set contains the leader; its value is the minimum
    /// match index among its members and the result is the maximum over
    /// all sets. size-based policies reduce to picking the n-th highest
    /// match index. `None` when no set qualifies.
    pub fn commit_index(
        &self,
        leader: &Voter,
        leader_index: Seq,
        followers: &[(Voter, Seq)],
        cluster_size: usize,
    ) -> Option<Seq> {
        match self.required(cluster_size) {
            Some(needed) => {
                if needed == 0 {
                    return Some(leader_index);
                }
                let mut indexes: Vec<Seq> = followers.iter().map(|(_, seq)| *seq).collect();
                indexes.push(leader_index);
                indexes.sort_unstable_by(|a, b| b.cmp(a));
                indexes.get(needed - 1).copied()
            }
            None => self.enumerate(leader, leader_index, followers),
        }
    }

    fn enumerate(
        &self,
        leader: &Voter,
        leader_index: Seq,
        followers: &[(Voter, Seq)],
    ) -> Option<Seq> {
        // followers beyond what a u64 mask holds are not enumerated
        let n = followers.len().min(63);
        let mut best: Option<Seq> = None;
        let mut voters = Vec::with_capacity(n + 1);
        for mask in 0u64..(1u64 << n) {
            voters.clear();
            voters.push(leader.clone());
            let mut low = leader_index;
            for (i, (voter, seq)) in followers.iter().take(n).enumerate() {
                if mask & (1 << i) != 0 {
                    voters.push(voter.clone());
                    low = low.min(*seq);
                }
            }
            if best.is_some_and(|b| b >= low) {
                continue;
            }
            if self.is_satisfied(&voters, 0) {
                best = Some(low);
            }
        }
        best
    }
}

impl fmt::Debug for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Majority => f.write_str("Majority"),
            Self::Size(n) => f.debug_tuple("Size").field(n).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
