//! # transport
//!
//! why: keep the raft runtime independent of how rpcs travel
//! relations: called by raft.rs for outbound rpcs, implemented by network.rs
//! what: Transport trait, TransportError

use async_trait::async_trait;
use thiserror::Error;

use raft_core::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

/// Client side of the two raft rpcs.
///
/// Implementations may drop, delay or reorder calls. The caller bounds every
/// call with its own timeout, so an implementation is free to hang.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Either end is cut off from the network
    #[error("peer unreachable")]
    Disconnected,
    /// The request or its reply was lost
    #[error("message dropped")]
    Dropped,
    /// Request timed out
    #[error("rpc timed out")]
    Timeout,
    /// Target node not found
    #[error("node {0} not found")]
    NodeNotFound(u64),
    /// The target refused to answer (shut down or failed to persist)
    #[error("rejected by peer: {0}")]
    Rejected(String),
}
