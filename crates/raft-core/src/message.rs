//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: used by node.rs for state transitions, carried by raft-server transports
//! what: RequestVote / AppendEntries args and replies, ApplyMsg for the hosting service

use serde::{Deserialize, Serialize};

use crate::LogEntry;

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// receiver's current term, for the candidate to update itself
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesArgs {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// index of the last entry this request covers
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

/// Response to AppendEntries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// term of the follower's entry at prev_log_index, None if its log is too short
    pub conflict_term: Option<u64>,
    /// where the leader should retry from
    pub conflict_index: u64,
}

impl AppendEntriesReply {
    pub fn accepted(term: u64) -> Self {
        Self {
            term,
            success: true,
            conflict_term: None,
            conflict_index: 0,
        }
    }

    pub fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_term: None,
            conflict_index: 0,
        }
    }
}

/// A committed entry handed to the hosting service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyMsg {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

impl From<&LogEntry> for ApplyMsg {
    fn from(entry: &LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            command: entry.command.clone(),
        }
    }
}
