//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-server's async runtime, persisted through raft-storage
//! what: state machine, election logic, log management, message types

pub mod log;
pub mod message;
pub mod node;

pub use log::{Log, LogEntry};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, RequestVoteArgs, RequestVoteReply,
};
pub use node::{NodeState, PersistentState, RaftNode};
