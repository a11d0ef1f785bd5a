//! # state
//!
//! why: keep every consensus rule as plain synchronous state transitions
//! relations: owned by node.rs behind a short mutex; election.rs and replication.rs drive it with i/o results
//! what: NodeState enum, RaftState (term, role, votes, replication cursors, commit/apply watermarks)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::event::NodeStatus;
use crate::message::ErrorCode;
use crate::quorum::{Quorum, Voter};
use crate::{NodeId, Seq, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// leader-side replication cursor for one follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    /// next index to send
    pub next: Seq,
    /// highest index known replicated
    pub matched: Seq,
    /// consecutive mismatch replies
    pub mismatches: usize,
}

impl Progress {
    fn new(next: Seq) -> Self {
        Self {
            next,
            matched: -1,
            mismatches: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RaftState {
    pub id: NodeId,
    pub group: Option<String>,
    pub role: NodeState,
    pub term: Term,
    /// confirmed leader, or the candidate this node granted its vote to
    pub leader: Option<NodeId>,
    /// `leader` has sent an append in this term; false for a vote designate
    pub leader_confirmed: bool,
    pub voted_for: Option<NodeId>,
    /// granted votes with the group each voter reported
    pub votes: HashMap<NodeId, Option<String>>,
    /// group labels learned from vote replies
    pub groups: HashMap<NodeId, Option<String>>,
    pub progress: BTreeMap<NodeId, Progress>,
    /// followers with an append rpc outstanding
    pub inflight: HashSet<NodeId>,
    pub commit: Seq,
    pub applied: Seq,
    pub last_index: Seq,
    pub last_term: Term,
    /// index of this leader's first entry in its term
    pub term_start: Option<Seq>,
    /// leader only: the commit index is known to cover every earlier term
    pub established: bool,
    pub last_contact: Instant,
}

impl RaftState {
    pub fn new(id: NodeId, group: Option<String>) -> Self {
        Self {
            id,
            group,
            role: NodeState::Follower,
            term: 0,
            leader: None,
            leader_confirmed: false,
            voted_for: None,
            votes: HashMap::new(),
            groups: HashMap::new(),
            progress: BTreeMap::new(),
            inflight: HashSet::new(),
            commit: -1,
            applied: -1,
            last_index: -1,
            last_term: 0,
            term_start: None,
            established: false,
            last_contact: Instant::now(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role,
            term: self.term,
            leader: self.leader,
            followers: self.progress.keys().copied().collect(),
            last_index: self.last_index,
            commit: self.commit,
            applied: self.applied,
        }
    }

    /// the parts of the state whose change is announced as a `Change` event
    pub fn shape(&self) -> (NodeState, Term, Option<NodeId>, usize) {
        (self.role, self.term, self.leader, self.progress.len())
    }

    pub fn is_leader_in(&self, term: Term) -> bool {
        self.role == NodeState::Leader && self.term == term
    }

    pub fn touch(&mut self) {
        self.last_contact = Instant::now();
    }

    pub fn set_tail(&mut self, last_index: Seq, last_term: Term) {
        self.last_index = last_index;
        self.last_term = last_term;
    }

    pub fn voter(&self) -> Voter {
        Voter::new(self.id, self.group.clone())
    }

    // -- roles --

    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.term {
            self.voted_for = None;
        }
        self.term = term;
        self.role = NodeState::Follower;
        self.leader = leader;
        self.leader_confirmed = leader.is_some();
        self.votes.clear();
        self.progress.clear();
        self.inflight.clear();
        self.term_start = None;
        self.established = false;
    }

    /// become a candidate in a fresh term that outranks the log, voting for self
    pub fn start_election(&mut self) -> Term {
        self.term = self.term.max(self.last_term) + 1;
        self.role = NodeState::Candidate;
        self.leader = None;
        self.leader_confirmed = false;
        self.voted_for = Some(self.id);
        self.progress.clear();
        self.inflight.clear();
        self.term_start = None;
        self.established = false;
        self.votes.clear();
        self.votes.insert(self.id, self.group.clone());
        self.touch();
        self.term
    }

    /// take over replication; `next = last + 1` and `match = -1` for every peer
    ///
    /// a log with nothing past the known commit index needs no no-op entry
    pub fn become_leader(&mut self, peers: impl IntoIterator<Item = NodeId>) {
        self.role = NodeState::Leader;
        self.leader = Some(self.id);
        self.leader_confirmed = true;
        self.votes.clear();
        self.inflight.clear();
        self.term_start = None;
        self.established = self.commit >= self.last_index;
        let next = self.last_index + 1;
        self.progress = peers.into_iter().map(|p| (p, Progress::new(next))).collect();
    }

    // -- votes --

    /// decide a vote request; the boolean is whether the vote is granted
    pub fn handle_vote_request(
        &mut self,
        from: NodeId,
        term: Term,
        prev_term: Term,
        prev_index: Seq,
    ) -> Result<bool> {
        if prev_index < -1 {
            return Err(RaftError::Malformed(format!("prev_index {prev_index}")));
        }
        if term == self.term && self.leader == Some(from) {
            self.touch();
            return Ok(true);
        }
        if term > self.term {
            self.become_follower(term, None);
        }
        if term < self.last_term || term < self.term {
            return Ok(false);
        }
        if self.leader.is_some() || self.voted_for.is_some_and(|v| v != from) {
            return Ok(false);
        }
        let up_to_date = prev_term > self.last_term
            || (prev_term == self.last_term && prev_index >= self.last_index);
        if !up_to_date {
            return Ok(false);
        }

        self.role = NodeState::Follower;
        self.leader = Some(from);
        self.leader_confirmed = false;
        self.voted_for = Some(from);
        self.votes.clear();
        self.progress.clear();
        self.inflight.clear();
        self.touch();
        Ok(true)
    }

    /// count a vote reply; true once the votes reach quorum
    pub fn record_vote(
        &mut self,
        from: NodeId,
        term: Term,
        granted: bool,
        group: Option<String>,
        quorum: &Quorum,
        cluster_size: usize,
    ) -> bool {
        self.groups.insert(from, group.clone());
        if !granted || self.role != NodeState::Candidate || self.term != term {
            return false;
        }
        self.votes.insert(from, group);
        self.has_quorum(quorum, cluster_size)
    }

    pub fn has_quorum(&self, quorum: &Quorum, cluster_size: usize) -> bool {
        let voters: Vec<Voter> = self
            .votes
            .iter()
            .map(|(id, group)| Voter::new(*id, group.clone()))
            .collect();
        quorum.is_satisfied(&voters, cluster_size)
    }

    // -- follower side --

    /// admit an append from `from`, adopting newer terms and new leaders
    ///
    /// an append in the current term comes from that term's only leader, so
    /// it replaces a candidate this node merely voted for
    pub fn accept_append(&mut self, from: NodeId, term: Term) -> Result<(), ErrorCode> {
        if term < self.term {
            return Err(ErrorCode::StaleTerm);
        }
        if term > self.term {
            self.become_follower(term, Some(from));
        } else {
            match self.role {
                NodeState::Leader => return Err(ErrorCode::LeaderMismatch),
                NodeState::Candidate => self.become_follower(term, Some(from)),
                NodeState::Follower => match self.leader {
                    Some(leader) if leader != from && self.leader_confirmed => {
                        return Err(ErrorCode::LeaderMismatch)
                    }
                    _ => {
                        self.leader = Some(from);
                        self.leader_confirmed = true;
                    }
                },
            }
        }
        self.touch();
        Ok(())
    }

    /// adopt the leader's commit index, capped at what this append verified
    pub fn follow_commit(&mut self, leader_commit: Seq, verified: Seq) -> Option<Seq> {
        let commit = leader_commit.min(verified);
        if commit > self.commit {
            self.commit = commit;
            Some(commit)
        } else {
            None
        }
    }

    // -- leader side --

    /// account for entries appended to the local log in `term`
    pub fn record_append(&mut self, first: Seq, last: Seq, term: Term) {
        self.last_index = last;
        self.last_term = term;
        if self.is_leader_in(term) {
            self.term_start.get_or_insert(first);
        }
    }

    pub fn ack(&mut self, peer: NodeId, seq: Seq) {
        if let Some(p) = self.progress.get_mut(&peer) {
            p.matched = p.matched.max(seq);
            p.next = seq + 1;
            p.mismatches = 0;
        }
    }

    /// step a follower's cursor back after a mismatch
    ///
    /// one index at a time, or straight to the follower's hinted tail when
    /// that is lower; after `max_scan` misses in a row start over from 0
    pub fn mismatch(&mut self, peer: NodeId, hint: Option<Seq>, max_scan: usize) {
        let Some(p) = self.progress.get_mut(&peer) else {
            return;
        };
        p.mismatches += 1;
        if p.mismatches >= max_scan {
            p.next = 0;
            p.mismatches = 0;
            return;
        }
        let mut next = p.next - 1;
        if let Some(hint) = hint {
            next = next.min(hint + 1);
        }
        p.next = next.max(0);
    }

    /// recompute the commit index; `Some` when it advanced
    ///
    /// only indexes from this leader's own term are committed directly
    pub fn advance_commit(&mut self, quorum: &Quorum, cluster_size: usize) -> Option<Seq> {
        if self.role != NodeState::Leader {
            return None;
        }
        let start = self.term_start?;
        let followers: Vec<(Voter, Seq)> = self
            .progress
            .iter()
            .map(|(id, p)| {
                let group = self.groups.get(id).cloned().flatten();
                (Voter::new(*id, group), p.matched)
            })
            .collect();
        let candidate = quorum.commit_index(&self.voter(), self.last_index, &followers, cluster_size)?;
        if candidate > self.commit && candidate >= start {
            self.commit = candidate;
            self.established = true;
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId) -> RaftState {
        RaftState::new(id, None)
    }

    // -- initialization --

    #[test]
    fn new_node_starts_as_follower() {
        let st = node(1);
        assert_eq!(st.role, NodeState::Follower);
        assert_eq!(st.term, 0);
        assert_eq!(st.voted_for, None);
        assert_eq!(st.commit, -1);
        assert_eq!(st.applied, -1);
        assert_eq!(st.last_index, -1);
    }

    // -- election --

    #[test]
    fn start_election_becomes_candidate() {
        let mut st = node(1);
        let term = st.start_election();

        assert_eq!(st.role, NodeState::Candidate);
        assert_eq!(term, 1);
        assert_eq!(st.voted_for, Some(1));
        assert!(st.votes.contains_key(&1));
    }

    #[test]
    fn election_term_outranks_the_log() {
        let mut st = node(1);
        st.term = 2;
        st.set_tail(10, 5);

        assert_eq!(st.start_election(), 6);
    }

    #[test]
    fn majority_vote_wins_election() {
        let mut st = node(1);
        let term = st.start_election();

        assert!(!st.has_quorum(&Quorum::Majority, 3));
        assert!(st.record_vote(2, term, true, None, &Quorum::Majority, 3));
    }

    #[test]
    fn rejected_votes_dont_count() {
        let mut st = node(1);
        let term = st.start_election();

        assert!(!st.record_vote(2, term, false, None, &Quorum::Majority, 3));
        assert_eq!(st.votes.len(), 1);
    }

    #[test]
    fn stale_vote_response_ignored() {
        let mut st = node(1);
        let old = st.start_election();
        st.start_election();

        assert!(!st.record_vote(2, old, true, None, &Quorum::Majority, 3));
    }

    #[test]
    fn vote_replies_teach_groups() {
        let mut st = node(1);
        let term = st.start_election();
        st.record_vote(2, term, false, Some("west".into()), &Quorum::Majority, 3);

        assert_eq!(st.groups.get(&2), Some(&Some("west".to_string())));
    }

    // -- vote requests --

    #[test]
    fn grant_vote_to_valid_candidate() {
        let mut st = node(1);
        assert!(st.handle_vote_request(2, 1, 0, -1).unwrap());
        assert_eq!(st.term, 1);
        assert_eq!(st.leader, Some(2));
        assert_eq!(st.voted_for, Some(2));
    }

    #[test]
    fn reject_vote_for_lower_term() {
        let mut st = node(1);
        st.term = 5;
        assert!(!st.handle_vote_request(2, 4, 0, -1).unwrap());
        assert_eq!(st.term, 5);
    }

    #[test]
    fn reject_vote_behind_log_term() {
        let mut st = node(1);
        st.set_tail(3, 4);
        assert!(!st.handle_vote_request(2, 3, 4, 3).unwrap());
    }

    #[test]
    fn higher_term_request_steps_down_even_when_rejected() {
        let mut st = node(1);
        st.start_election();
        st.set_tail(5, 1);

        let granted = st.handle_vote_request(2, 7, 0, -1).unwrap();

        assert!(!granted);
        assert_eq!(st.role, NodeState::Follower);
        assert_eq!(st.term, 7);
        assert_eq!(st.leader, None);
    }

    #[test]
    fn reject_second_candidate_in_same_term() {
        let mut st = node(1);
        assert!(st.handle_vote_request(2, 1, 0, -1).unwrap());
        assert!(!st.handle_vote_request(3, 1, 0, -1).unwrap());
    }

    #[test]
    fn candidate_does_not_vote_for_rival() {
        let mut st = node(1);
        let term = st.start_election();
        assert!(!st.handle_vote_request(2, term, 0, -1).unwrap());
        assert_eq!(st.role, NodeState::Candidate);
    }

    #[test]
    fn repeated_request_from_designate_is_granted() {
        let mut st = node(1);
        assert!(st.handle_vote_request(2, 1, 0, -1).unwrap());
        assert!(st.handle_vote_request(2, 1, 0, -1).unwrap());
    }

    #[test]
    fn reject_candidate_with_shorter_log_same_term() {
        let mut st = node(1);
        st.set_tail(4, 1);
        assert!(!st.handle_vote_request(2, 2, 1, 3).unwrap());
    }

    #[test]
    fn grant_vote_to_candidate_with_higher_term_log() {
        let mut st = node(1);
        st.set_tail(9, 1);
        assert!(st.handle_vote_request(2, 3, 2, 0).unwrap());
    }

    #[test]
    fn malformed_vote_request_is_an_error() {
        let mut st = node(1);
        assert!(matches!(
            st.handle_vote_request(2, 1, 0, -2),
            Err(RaftError::Malformed(_))
        ));
    }

    // -- leader state --

    #[test]
    fn become_leader_initializes_cursors() {
        let mut st = node(1);
        st.set_tail(4, 1);
        st.start_election();
        st.become_leader([2, 3]);

        assert_eq!(st.role, NodeState::Leader);
        assert_eq!(st.leader, Some(1));
        for peer in [2, 3] {
            assert_eq!(st.progress[&peer], Progress::new(5));
            assert_eq!(st.progress[&peer].matched, -1);
        }
    }

    #[test]
    fn leader_with_uncommitted_tail_is_not_established() {
        let mut st = node(1);
        st.set_tail(4, 1);
        st.commit = 2;
        st.start_election();
        st.become_leader([2, 3]);
        assert!(!st.established);

        let mut fresh = node(1);
        fresh.start_election();
        fresh.become_leader([2, 3]);
        assert!(fresh.established);
    }

    #[test]
    fn mismatch_steps_back_one() {
        let mut st = node(1);
        st.set_tail(9, 1);
        st.become_leader([2]);

        st.mismatch(2, None, 64);

        assert_eq!(st.progress[&2].next, 9);
    }

    #[test]
    fn mismatch_jumps_to_hinted_tail() {
        let mut st = node(1);
        st.set_tail(9, 1);
        st.become_leader([2]);

        st.mismatch(2, Some(2), 64);

        assert_eq!(st.progress[&2].next, 3);
    }

    #[test]
    fn bounded_conflict_scan_resyncs_from_zero() {
        let mut st = node(1);
        st.set_tail(99, 1);
        st.become_leader([2]);

        for _ in 0..3 {
            st.mismatch(2, None, 3);
        }

        assert_eq!(st.progress[&2].next, 0);
        assert_eq!(st.progress[&2].mismatches, 0);
    }

    #[test]
    fn ack_advances_cursor_and_resets_scan() {
        let mut st = node(1);
        st.set_tail(9, 1);
        st.become_leader([2]);
        st.mismatch(2, None, 64);

        st.ack(2, 6);

        assert_eq!(st.progress[&2].matched, 6);
        assert_eq!(st.progress[&2].next, 7);
        assert_eq!(st.progress[&2].mismatches, 0);
    }

    // -- commit --

    #[test]
    fn commit_on_majority_replication() {
        let mut st = node(1);
        st.start_election();
        st.become_leader([2, 3]);
        st.record_append(0, 2, st.term);
        st.ack(2, 1);

        assert_eq!(st.advance_commit(&Quorum::Majority, 3), Some(1));
        assert_eq!(st.commit, 1);
    }

    #[test]
    fn no_commit_without_quorum() {
        let mut st = node(1);
        st.start_election();
        st.become_leader([2, 3, 4, 5]);
        st.record_append(0, 2, st.term);
        st.ack(2, 2);

        assert_eq!(st.advance_commit(&Quorum::Majority, 5), None);
    }

    #[test]
    fn cannot_commit_entries_from_previous_term() {
        let mut st = node(1);
        st.set_tail(4, 1);
        st.start_election();
        st.become_leader([2, 3]);
        st.ack(2, 4);

        // nothing appended in this term yet
        assert_eq!(st.advance_commit(&Quorum::Majority, 3), None);

        st.record_append(5, 5, st.term);
        assert_eq!(st.advance_commit(&Quorum::Majority, 3), None);

        st.ack(3, 5);
        assert_eq!(st.advance_commit(&Quorum::Majority, 3), Some(5));
        assert!(st.established);
    }

    #[test]
    fn commit_never_moves_backwards() {
        let mut st = node(1);
        st.start_election();
        st.become_leader([2, 3]);
        st.record_append(0, 3, st.term);
        st.ack(2, 3);
        st.advance_commit(&Quorum::Majority, 3);

        st.progress.get_mut(&2).unwrap().matched = 1;

        assert_eq!(st.advance_commit(&Quorum::Majority, 3), None);
        assert_eq!(st.commit, 3);
    }

    // -- append handling --

    #[test]
    fn reject_append_with_lower_term() {
        let mut st = node(1);
        st.term = 3;
        assert_eq!(st.accept_append(2, 2), Err(ErrorCode::StaleTerm));
    }

    #[test]
    fn candidate_steps_down_on_append() {
        let mut st = node(1);
        let term = st.start_election();

        st.accept_append(2, term).unwrap();

        assert_eq!(st.role, NodeState::Follower);
        assert_eq!(st.leader, Some(2));
    }

    #[test]
    fn second_leader_in_term_is_rejected() {
        let mut st = node(1);
        st.accept_append(2, 1).unwrap();
        assert_eq!(st.accept_append(3, 1), Err(ErrorCode::LeaderMismatch));
    }

    #[test]
    fn append_overrides_the_candidate_voted_for() {
        let mut st = node(1);
        assert!(st.handle_vote_request(2, 1, 0, -1).unwrap());
        assert!(!st.leader_confirmed);

        st.accept_append(3, 1).unwrap();

        assert_eq!(st.leader, Some(3));
        assert!(st.leader_confirmed);
        assert_eq!(st.voted_for, Some(2));
        assert_eq!(st.accept_append(2, 1), Err(ErrorCode::LeaderMismatch));
    }

    #[test]
    fn leader_adopts_newer_term_from_append() {
        let mut st = node(1);
        st.start_election();
        st.become_leader([2, 3]);

        st.accept_append(2, 9).unwrap();

        assert_eq!(st.role, NodeState::Follower);
        assert_eq!(st.term, 9);
        assert!(st.progress.is_empty());
    }

    #[test]
    fn follower_commit_capped_at_verified_index() {
        let mut st = node(1);
        assert_eq!(st.follow_commit(10, 4), Some(4));
        assert_eq!(st.follow_commit(3, 8), None);
        assert_eq!(st.commit, 4);
    }

    #[test]
    fn term_never_decreases() {
        let mut st = node(1);
        st.accept_append(2, 5).unwrap();
        let _ = st.accept_append(3, 4);
        st.handle_vote_request(3, 2, 0, -1).unwrap();
        assert_eq!(st.term, 5);
    }
}
