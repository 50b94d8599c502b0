//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management
//! what: NodeState enum, RaftNode struct, election / replication / commit rules
//!
//! the node is synchronous and owns no timers or sockets. the caller (raft-server)
//! feeds it inbound rpcs and replies, sends what it returns, and persists
//! whenever [`RaftNode::take_dirty`] reports a change to term, vote or log.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::log::{Log, LogEntry};
use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, RequestVoteArgs, RequestVoteReply,
};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// The fields raft must write to stable storage before answering an rpc
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<u64>,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    pub log: Log,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the hosting service
    pub last_applied: u64,
    /// Leader we last accepted AppendEntries from in this term
    pub leader_id: Option<u64>,
    /// Peers that granted us a vote in the current election
    pub votes_received: Vec<u64>,
    // leader only, rebuilt on every election win
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,
    dirty: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::restore(id, cluster_nodes, PersistentState::default())
    }

    /// Rebuild a node from what was persisted before a restart
    pub fn restore(id: u64, cluster_nodes: Vec<u64>, persisted: PersistentState) -> Self {
        Self {
            id,
            cluster_nodes,
            state: NodeState::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: Log::from_entries(persisted.log),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            dirty: false,
        }
    }

    /// every cluster member except this node
    pub fn peers(&self) -> Vec<u64> {
        self.cluster_nodes
            .iter()
            .copied()
            .filter(|&p| p != self.id)
            .collect()
    }

    /// strict majority of the cluster, self included
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.entries().to_vec(),
        }
    }

    /// true once after any change to term, vote or log
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Check if a candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_term = self.last_log_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_log_index())
    }

    fn update_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.dirty = true;
        }
    }

    /// adopt `term` if newer and fall back to follower
    ///
    /// voted_for survives when `term` equals the current term.
    pub fn become_follower(&mut self, term: u64) {
        self.update_term(term);
        if self.state != NodeState::Follower {
            tracing::info!(
                node_id = self.id,
                term = self.current_term,
                from = %self.state,
                "stepping down to follower"
            );
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Start a new election, returning the request to broadcast
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        self.dirty = true;

        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            "starting election"
        );

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        // single-member cluster
        if self.has_quorum() {
            self.become_leader();
        }
        args
    }

    fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.peers() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }

        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            last_log_index = next - 1,
            "became leader"
        );
    }

    /// Handle an incoming RequestVote.
    ///
    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term < self.current_term {
            return (
                RequestVoteReply {
                    term: self.current_term,
                    vote_granted: false,
                },
                false,
            );
        }
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let free = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let granted = free && self.is_log_up_to_date(args.last_log_index, args.last_log_term);
        if granted && self.voted_for != Some(args.candidate_id) {
            self.voted_for = Some(args.candidate_id);
            self.dirty = true;
        }

        tracing::debug!(
            node_id = self.id,
            candidate = args.candidate_id,
            term = args.term,
            granted,
            "RequestVote handled"
        );

        (
            RequestVoteReply {
                term: self.current_term,
                vote_granted: granted,
            },
            granted,
        )
    }

    /// Handle a reply to a RequestVote we sent in `requested_term`.
    ///
    /// Returns true only on the call that wins the election.
    pub fn handle_vote_response(
        &mut self,
        peer: u64,
        requested_term: u64,
        reply: &RequestVoteReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if self.state != NodeState::Candidate || self.current_term != requested_term {
            tracing::debug!(
                node_id = self.id,
                peer_id = peer,
                requested_term,
                term = self.current_term,
                "discarding stale vote reply"
            );
            return false;
        }
        if !reply.vote_granted {
            return false;
        }
        if !self.votes_received.contains(&peer) {
            self.votes_received.push(peer);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    /// Append a client command if we are leader, returning (index, term)
    pub fn append_entry(&mut self, command: Vec<u8>) -> Option<(u64, u64)> {
        if !self.is_leader() {
            return None;
        }
        let index = self.log.append(self.current_term, command);
        self.dirty = true;
        tracing::debug!(
            node_id = self.id,
            index,
            term = self.current_term,
            "appended command"
        );
        // commits at once when there are no peers to wait for
        self.advance_commit_index();
        Some((index, self.current_term))
    }

    /// Build the AppendEntries for `peer`, carrying everything from its next_index
    pub fn create_append_entries(&self, peer: u64) -> Option<AppendEntriesArgs> {
        if !self.is_leader() {
            return None;
        }
        let last = self.last_log_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;
        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    /// Handle an incoming AppendEntries.
    ///
    /// Returns the reply and whether the election timer should be reset.
    pub fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
    ) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            return (AppendEntriesReply::rejected(self.current_term), false);
        }
        self.become_follower(args.term);
        self.leader_id = Some(args.leader_id);

        match self.log.term_at(args.prev_log_index) {
            None => {
                let reply = AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    conflict_term: None,
                    conflict_index: self.last_log_index() + 1,
                };
                return (reply, true);
            }
            Some(term) if term != args.prev_log_term => {
                let reply = AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    conflict_term: Some(term),
                    conflict_index: self.log.first_index_of_term(term, args.prev_log_index),
                };
                return (reply, true);
            }
            Some(_) => {}
        }

        if self.log.merge(args.prev_log_index, &args.entries) {
            self.dirty = true;
            tracing::debug!(
                node_id = self.id,
                entries = args.entries.len(),
                last_log_index = self.last_log_index(),
                "appended entries from leader"
            );
        }

        if args.leader_commit > self.commit_index {
            let commit = args.leader_commit.min(args.last_index());
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }

        (AppendEntriesReply::accepted(self.current_term), true)
    }

    /// Handle a reply to the AppendEntries `sent` to `peer`.
    ///
    /// Returns true if the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        peer: u64,
        sent: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> bool {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return false;
        }
        if !self.is_leader() || self.current_term != sent.term {
            return false;
        }

        if reply.success {
            let matched = self.match_index.entry(peer).or_insert(0);
            if sent.last_index() > *matched {
                *matched = sent.last_index();
            }
            let matched = *matched;
            let next = self.next_index.entry(peer).or_insert(matched + 1);
            if *next < matched + 1 {
                *next = matched + 1;
            }
            return self.advance_commit_index();
        }

        let hinted = match reply.conflict_term {
            Some(term) => self
                .log
                .last_index_of_term(term)
                .map(|i| i + 1)
                .unwrap_or(reply.conflict_index),
            None if reply.conflict_index > 0 => reply.conflict_index,
            None => sent.prev_log_index,
        };
        let floor = self.match_index.get(&peer).copied().unwrap_or(0) + 1;
        let target = hinted.clamp(floor, self.last_log_index() + 1);
        let next = self.next_index.entry(peer).or_insert(target);
        if target < *next {
            tracing::debug!(
                node_id = self.id,
                peer_id = peer,
                from = *next,
                to = target,
                "backing off next_index"
            );
            *next = target;
        }
        false
    }

    /// Move commit_index to the highest current-term index held by a majority
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let quorum = self.quorum_size();
        let mut n = self.last_log_index();
        while n > self.commit_index {
            match self.log.term_at(n) {
                Some(term) if term == self.current_term => {
                    let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
                    if replicas >= quorum {
                        tracing::debug!(
                            node_id = self.id,
                            commit_index = n,
                            "advanced commit index"
                        );
                        self.commit_index = n;
                        return true;
                    }
                }
                // older terms only commit underneath a current-term entry
                _ => break,
            }
            n -= 1;
        }
        false
    }

    /// Committed entries not yet handed to the hosting service, in order
    pub fn entries_to_apply(&self) -> Vec<ApplyMsg> {
        self.log
            .slice(self.last_applied, self.commit_index)
            .iter()
            .map(ApplyMsg::from)
            .collect()
    }

    /// Record that `index` was delivered
    pub fn mark_applied(&mut self, index: u64) {
        if index > self.last_applied && index <= self.commit_index {
            self.last_applied = index;
        }
    }
}
