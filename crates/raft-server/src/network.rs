//! # network
//!
//! why: run whole clusters in one process, with partitions and message loss
//! relations: implements transport.rs, routes into raft.rs handles; used by tests and the demo
//! what: LocalNetwork (partitions, unreliable mode, rpc counters), LocalTransport
//!
//! Each server sends through a [`LocalTransport`] bound to its own id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use raft_core::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

use crate::raft::Raft;
use crate::transport::{Transport, TransportError};

/// share of requests (and separately of replies) lost when unreliable
const DROP_RATE: f64 = 0.1;
/// upper bound on the random delay added when unreliable
const MAX_DELAY_MS: u64 = 27;

#[derive(Default)]
struct NetworkState {
    nodes: RwLock<HashMap<u64, Raft>>,
    connected: RwLock<HashSet<u64>>,
    unreliable: AtomicBool,
    rpc_total: AtomicU64,
    rpc_by_node: RwLock<HashMap<u64, u64>>,
}

/// Shared registry of servers. Cheap to clone.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<NetworkState>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the server `from`; hand it to [`Raft::new`]
    pub fn transport(&self, from: u64) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            from,
        })
    }

    /// Make a server reachable. Replaces any previous handle under the same id.
    pub async fn register(&self, raft: Raft) {
        let id = raft.id();
        self.state.nodes.write().await.insert(id, raft);
        self.state.connected.write().await.insert(id);
        tracing::debug!(node_id = id, "registered with local network");
    }

    /// Kill and forget a server
    pub async fn remove(&self, id: u64) -> Option<Raft> {
        self.state.connected.write().await.remove(&id);
        let raft = self.state.nodes.write().await.remove(&id);
        if let Some(raft) = &raft {
            raft.kill();
        }
        raft
    }

    pub async fn connect(&self, id: u64) {
        tracing::debug!(node_id = id, "connecting");
        self.state.connected.write().await.insert(id);
    }

    /// Cut a server off; it keeps running but every rpc to or from it fails
    pub async fn disconnect(&self, id: u64) {
        tracing::debug!(node_id = id, "disconnecting");
        self.state.connected.write().await.remove(&id);
    }

    pub async fn is_connected(&self, id: u64) -> bool {
        self.state.connected.read().await.contains(&id)
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.state.unreliable.store(unreliable, Ordering::Relaxed);
    }

    pub fn is_unreliable(&self) -> bool {
        self.state.unreliable.load(Ordering::Relaxed)
    }

    pub async fn get(&self, id: u64) -> Option<Raft> {
        self.state.nodes.read().await.get(&id).cloned()
    }

    /// Every registered server, ordered by id
    pub async fn nodes(&self) -> Vec<Raft> {
        let registry = self.state.nodes.read().await;
        let mut nodes: Vec<Raft> = registry.values().cloned().collect();
        drop(registry);
        nodes.sort_by_key(Raft::id);
        nodes
    }

    /// Connected server claiming leadership in the highest term, if any
    pub async fn leader(&self) -> Option<Raft> {
        let mut best: Option<(u64, Raft)> = None;
        for raft in self.nodes().await {
            if raft.is_killed() || !self.is_connected(raft.id()).await {
                continue;
            }
            let (term, is_leader) = raft.get_state().await;
            if is_leader && best.as_ref().map_or(true, |(t, _)| term > *t) {
                best = Some((term, raft));
            }
        }
        best.map(|(_, raft)| raft)
    }

    /// rpcs attempted across the whole network
    pub fn rpc_count(&self) -> u64 {
        self.state.rpc_total.load(Ordering::Relaxed)
    }

    /// rpcs sent by one server
    pub async fn rpc_count_for(&self, id: u64) -> u64 {
        let counts = self.state.rpc_by_node.read().await;
        counts.get(&id).copied().unwrap_or(0)
    }

    /// Kill every server and drop the registry
    pub async fn shutdown(&self) {
        let mut registry = self.state.nodes.write().await;
        let nodes: Vec<Raft> = registry.drain().map(|(_, raft)| raft).collect();
        drop(registry);
        for raft in nodes {
            raft.kill();
        }
        self.state.connected.write().await.clear();
    }

    async fn record(&self, from: u64) {
        self.state.rpc_total.fetch_add(1, Ordering::Relaxed);
        let mut counts = self.state.rpc_by_node.write().await;
        *counts.entry(from).or_insert(0) += 1;
    }

    /// find the target if both ends are up, after the unreliable delay/drop
    async fn route(&self, from: u64, target: u64) -> Result<Raft, TransportError> {
        self.record(from).await;
        if !self.is_connected(from).await || !self.is_connected(target).await {
            return Err(TransportError::Disconnected);
        }
        if self.is_unreliable() {
            let (delay, drop) = roll();
            tokio::time::sleep(delay).await;
            if drop {
                return Err(TransportError::Dropped);
            }
        }
        self.get(target).await.ok_or(TransportError::NodeNotFound(target))
    }

    /// decide whether a reply makes it back to `from`
    async fn deliver_reply<T>(
        &self,
        from: u64,
        target: u64,
        reply: T,
    ) -> Result<T, TransportError> {
        if !self.is_connected(from).await || !self.is_connected(target).await {
            return Err(TransportError::Disconnected);
        }
        if self.is_unreliable() && roll().1 {
            return Err(TransportError::Dropped);
        }
        Ok(reply)
    }
}

/// random delay and whether to drop
fn roll() -> (Duration, bool) {
    let mut rng = rand::thread_rng();
    let delay = Duration::from_millis(rng.gen_range(0..=MAX_DELAY_MS));
    (delay, rng.gen_bool(DROP_RATE))
}

/// [`Transport`] that calls straight into the target's [`Raft`] handle
pub struct LocalTransport {
    network: LocalNetwork,
    from: u64,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        let raft = self.network.route(self.from, target).await?;
        let reply = raft
            .request_vote(args)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.network.deliver_reply(self.from, target, reply).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        let raft = self.network.route(self.from, target).await?;
        let reply = raft
            .append_entries(args)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.network.deliver_reply(self.from, target, reply).await
    }
}
