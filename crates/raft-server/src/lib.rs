//! # raft-server
//!
//! why: run raft-core as a live server on tokio
//! relations: drives raft-core, persists through raft-storage
//! what: Raft handle, config, election timer, Transport seam, in-process LocalNetwork

pub mod config;
pub mod error;
pub mod network;
pub mod raft;
pub mod timer;
pub mod transport;

pub use config::{ConfigArgs, RaftConfig};
pub use error::{RaftError, Result};
pub use network::{LocalNetwork, LocalTransport};
pub use raft::{NodeStatus, Raft};
pub use transport::{Transport, TransportError};

pub use raft_core::{ApplyMsg, NodeState};
