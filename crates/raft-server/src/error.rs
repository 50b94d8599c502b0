//! # error
//!
//! why: one error type for every fallible call on the raft handle
//! relations: wraps raft-storage and transport.rs errors
//! what: RaftError, Result alias

use raft_storage::StorageError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("raft node has been shut down")]
    Shutdown,

    #[error("persistence failed: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, RaftError>;
