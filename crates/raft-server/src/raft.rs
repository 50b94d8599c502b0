//! # raft
//!
//! why: drive the pure raft state machine with real timers, rpcs and durable writes
//! relations: wraps raft-core's RaftNode, persists through raft-storage, talks over transport.rs
//! what: Raft handle, NodeStatus, election / leader / apply tasks
//!
//! Tasks per server:
//! - election loop: sleeps until the election deadline, starts elections
//! - apply loop: hands committed entries to the host over the apply channel
//! - leader loop: one per won term, broadcasts AppendEntries every heartbeat
//! - one short-lived task per outbound rpc
//!
//! Every task takes the lock only around synchronous state changes and never
//! across a network call.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, NodeState, RaftNode, RequestVoteArgs,
    RequestVoteReply,
};
use raft_storage::Storage;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::timer::ElectionTimer;
use crate::transport::{Transport, TransportError};

/// Point-in-time view of a server, for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: u64,
    pub term: u64,
    pub state: NodeState,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

/// Everything the lock protects
struct Core {
    node: RaftNode,
    timer: ElectionTimer,
    storage: Box<dyn Storage>,
}

struct Inner {
    id: u64,
    peers: Vec<u64>,
    config: RaftConfig,
    core: Mutex<Core>,
    transport: Arc<dyn Transport>,
    apply_notify: Notify,
    replicate_notify: Notify,
    shutdown: CancellationToken,
}

/// Handle to a running raft server. Cheap to clone.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

impl Raft {
    /// Start a server.
    ///
    /// `cluster` lists every member, `id` included. Persisted state is loaded
    /// from `storage`; committed entries are sent on `apply_tx` in index order.
    /// Background tasks are spawned on the current tokio runtime and the
    /// handle is returned immediately.
    pub fn new(
        id: u64,
        cluster: Vec<u64>,
        transport: Arc<dyn Transport>,
        storage: Box<dyn Storage>,
        apply_tx: mpsc::Sender<ApplyMsg>,
        config: RaftConfig,
    ) -> Result<Self> {
        config.validate()?;
        let persisted = storage.load_state()?.unwrap_or_default();
        let node = RaftNode::restore(id, cluster, persisted);

        tracing::info!(
            node_id = id,
            term = node.current_term,
            voted_for = ?node.voted_for,
            log_len = node.log.len(),
            "starting raft server"
        );

        let inner = Arc::new(Inner {
            id,
            peers: node.peers(),
            config: config.clone(),
            core: Mutex::new(Core {
                node,
                timer: ElectionTimer::new(
                    config.election_timeout_min,
                    config.election_timeout_max,
                ),
                storage,
            }),
            transport,
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_election_loop(inner.clone()));
        tokio::spawn(run_apply_loop(inner.clone(), apply_tx));

        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// (current term, whether this server believes it is leader)
    pub async fn get_state(&self) -> (u64, bool) {
        let core = self.inner.core.lock().await;
        (core.node.current_term, core.node.is_leader())
    }

    pub async fn status(&self) -> NodeStatus {
        let core = self.inner.core.lock().await;
        let node = &core.node;
        NodeStatus {
            id: node.id,
            term: node.current_term,
            state: node.state,
            leader_id: node.leader_id,
            commit_index: node.commit_index,
            last_applied: node.last_applied,
            last_log_index: node.last_log_index(),
        }
    }

    /// Propose a command.
    ///
    /// Returns (index, term, is_leader). When not leader the call fails fast
    /// with `is_leader == false` and index 0. Being leader only means the
    /// entry was appended locally; it may still be lost if leadership is.
    pub async fn start(&self, command: Vec<u8>) -> Result<(u64, u64, bool)> {
        self.ensure_alive()?;
        let mut core = self.inner.core.lock().await;
        let before = core.node.commit_index;
        let Some((index, term)) = core.node.append_entry(command) else {
            return Ok((0, core.node.current_term, false));
        };
        self.inner.persist(&mut core)?;
        let committed = core.node.commit_index > before;
        drop(core);

        if committed {
            self.inner.apply_notify.notify_one();
        }
        self.inner.replicate_notify.notify_one();
        Ok((index, term, true))
    }

    /// Inbound RequestVote
    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        self.ensure_alive()?;
        let mut core = self.inner.core.lock().await;
        let (reply, reset) = core.node.handle_vote_request(&args);
        if reset {
            core.timer.reset();
        }
        self.inner.persist(&mut core)?;
        Ok(reply)
    }

    /// Inbound AppendEntries
    pub async fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        self.ensure_alive()?;
        let mut core = self.inner.core.lock().await;
        let before = core.node.commit_index;
        let (reply, reset) = core.node.handle_append_entries(&args);
        if reset {
            core.timer.reset();
        }
        self.inner.persist(&mut core)?;
        let committed = core.node.commit_index > before;
        drop(core);

        if committed {
            self.inner.apply_notify.notify_one();
        }
        Ok(reply)
    }

    /// Stop every task. Idempotent; later rpcs are refused.
    pub fn kill(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(node_id = self.inner.id, "shutting down raft server");
        }
        self.inner.shutdown.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_killed() {
            return Err(RaftError::Shutdown);
        }
        Ok(())
    }
}

impl Inner {
    /// write through term/vote/log if they changed; a failed write stops the node
    fn persist(&self, core: &mut Core) -> Result<()> {
        if !core.node.take_dirty() {
            return Ok(());
        }
        let state = core.node.persistent_state();
        if let Err(e) = core.storage.save_state(&state) {
            tracing::error!(
                node_id = self.id,
                error = %e,
                "failed to persist raft state, stopping"
            );
            self.shutdown.cancel();
            return Err(e.into());
        }
        Ok(())
    }

    /// run an outbound rpc, giving up after `rpc_timeout`
    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, TransportError>>,
    ) -> Result<T> {
        let reply = tokio::time::timeout(self.config.rpc_timeout, call)
            .await
            .unwrap_or(Err(TransportError::Timeout))?;
        Ok(reply)
    }

    fn broadcast_request_vote(self: &Arc<Self>, args: RequestVoteArgs) {
        for &peer in &self.peers {
            let inner = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                let call = inner.transport.request_vote(peer, args.clone());
                let reply = match inner.bounded(call).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::trace!(
                            node_id = inner.id,
                            peer_id = peer,
                            error = %e,
                            "RequestVote failed"
                        );
                        return;
                    }
                };
                if inner.shutdown.is_cancelled() {
                    return;
                }

                let mut core = inner.core.lock().await;
                let won = core.node.handle_vote_response(peer, args.term, &reply);
                if inner.persist(&mut core).is_err() {
                    return;
                }
                drop(core);

                if won {
                    inner.spawn_leader_loop(args.term);
                }
            });
        }
    }

    /// heartbeat / replication loop for one leadership term
    fn spawn_leader_loop(self: &Arc<Self>, term: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = inner.replicate_notify.notified() => {}
                }
                if !inner.broadcast_append_entries(term).await {
                    break;
                }
            }
            tracing::debug!(node_id = inner.id, term, "leader loop stopped");
        });
    }

    /// send each peer its AppendEntries; false once we no longer lead `term`
    async fn broadcast_append_entries(self: &Arc<Self>, term: u64) -> bool {
        let core = self.core.lock().await;
        if !core.node.is_leader() || core.node.current_term != term {
            return false;
        }
        let requests: Vec<(u64, AppendEntriesArgs)> = self
            .peers
            .iter()
            .filter_map(|&peer| {
                core.node
                    .create_append_entries(peer)
                    .map(|args| (peer, args))
            })
            .collect();
        drop(core);

        for (peer, args) in requests {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.send_append_entries(peer, args).await });
        }
        true
    }

    async fn send_append_entries(&self, peer: u64, args: AppendEntriesArgs) {
        let call = self.transport.append_entries(peer, args.clone());
        let reply = match self.bounded(call).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::trace!(
                    node_id = self.id,
                    peer_id = peer,
                    error = %e,
                    "AppendEntries failed"
                );
                return;
            }
        };
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut core = self.core.lock().await;
        let committed = core.node.handle_append_entries_response(peer, &args, &reply);
        if self.persist(&mut core).is_err() {
            return;
        }
        drop(core);

        if committed {
            self.apply_notify.notify_one();
        }
    }
}

async fn run_election_loop(inner: Arc<Inner>) {
    loop {
        let deadline = inner.core.lock().await.timer.deadline();
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let mut core = inner.core.lock().await;
        // reset by leader activity while we slept
        if !core.timer.is_expired() {
            continue;
        }
        core.timer.reset();
        if core.node.is_leader() {
            continue;
        }

        let args = core.node.start_election();
        if inner.persist(&mut core).is_err() {
            break;
        }
        let won = core.node.is_leader();
        drop(core);

        if won {
            inner.spawn_leader_loop(args.term);
        } else {
            inner.broadcast_request_vote(args);
        }
    }
    tracing::debug!(node_id = inner.id, "election loop stopped");
}

async fn run_apply_loop(inner: Arc<Inner>, apply_tx: mpsc::Sender<ApplyMsg>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.apply_notify.notified() => {}
        }

        let pending = inner.core.lock().await.node.entries_to_apply();
        for msg in pending {
            let index = msg.index;
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                sent = apply_tx.send(msg) => {
                    if sent.is_err() {
                        tracing::warn!(
                            node_id = inner.id,
                            "apply channel closed, no longer delivering"
                        );
                        return;
                    }
                }
            }
            inner.core.lock().await.node.mark_applied(index);
        }
    }
    tracing::debug!(node_id = inner.id, "apply loop stopped");
}
