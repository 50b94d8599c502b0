//! Shared harness for cluster tests: starts servers on a [`LocalNetwork`],
//! records what each one applies and offers polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use raft_server::{ApplyMsg, LocalNetwork, Raft, RaftConfig};
use raft_storage::InMemoryStorage;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Timings short enough to keep tests quick, still 3 heartbeats per timeout
pub fn fast_config() -> RaftConfig {
    RaftConfig::default()
        .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_rpc_timeout(Duration::from_millis(100))
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub ids: Vec<u64>,
    pub config: RaftConfig,
    storages: HashMap<u64, InMemoryStorage>,
    applied: HashMap<u64, Arc<Mutex<Vec<ApplyMsg>>>>,
}

impl TestCluster {
    pub async fn new(size: u64) -> Self {
        init_tracing();
        let ids: Vec<u64> = (1..=size).collect();
        let mut cluster = Self {
            network: LocalNetwork::new(),
            storages: ids.iter().map(|&id| (id, InMemoryStorage::new())).collect(),
            ids: ids.clone(),
            config: fast_config(),
            applied: HashMap::new(),
        };
        for id in ids {
            cluster.start_node(id).await;
        }
        cluster
    }

    /// Boot (or reboot) a server from whatever its storage holds
    pub async fn start_node(&mut self, id: u64) {
        let (tx, mut rx) = mpsc::channel(self.config.apply_buffer);
        let storage = self.storages.entry(id).or_default().clone();
        let raft = Raft::new(
            id,
            self.ids.clone(),
            self.network.transport(id),
            Box::new(storage),
            tx,
            self.config.clone(),
        )
        .expect("raft server starts");

        // a rebooted server replays its log from index 1
        let applied = Arc::new(Mutex::new(Vec::new()));
        self.applied.insert(id, Arc::clone(&applied));
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let mut log = applied.lock().unwrap();
                assert_eq!(
                    msg.index,
                    log.len() as u64 + 1,
                    "server {id} applied out of order"
                );
                log.push(msg);
            }
        });

        self.network.register(raft).await;
    }

    pub async fn crash(&mut self, id: u64) {
        self.network.remove(id).await;
    }

    pub async fn restart(&mut self, id: u64) {
        self.crash(id).await;
        self.start_node(id).await;
    }

    pub async fn node(&self, id: u64) -> Raft {
        self.network.get(id).await.expect("node registered")
    }

    pub fn applied(&self, id: u64) -> Vec<ApplyMsg> {
        self.applied
            .get(&id)
            .map(|log| log.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Panics if two connected servers claim leadership of the same term
    pub async fn check_one_leader_per_term(&self) {
        let mut leaders: HashMap<u64, u64> = HashMap::new();
        for raft in self.network.nodes().await {
            if !self.network.is_connected(raft.id()).await {
                continue;
            }
            let (term, is_leader) = raft.get_state().await;
            if is_leader {
                if let Some(other) = leaders.insert(term, raft.id()) {
                    panic!("term {term} has two leaders: {other} and {}", raft.id());
                }
            }
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<Raft> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.check_one_leader_per_term().await;
            if let Some(leader) = self.network.leader().await {
                return Some(leader);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// How many servers applied `index`; panics if they disagree on the command
    pub fn committed_count(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        let mut count = 0;
        let mut command: Option<Vec<u8>> = None;
        for log in self.applied.values() {
            let log = log.lock().unwrap();
            let Some(msg) = log.get(index as usize - 1) else {
                continue;
            };
            if let Some(seen) = &command {
                assert_eq!(
                    seen, &msg.command,
                    "servers applied different commands at {index}"
                );
            }
            command = Some(msg.command.clone());
            count += 1;
        }
        (count, command)
    }

    /// Submit `command` through whichever server leads and wait until
    /// `expected` servers applied it. Returns its index.
    pub async fn one(&self, command: &[u8], expected: usize, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let mut submitted = None;
            for raft in self.network.nodes().await {
                if !self.network.is_connected(raft.id()).await {
                    continue;
                }
                if let Ok((index, _, true)) = raft.start(command.to_vec()).await {
                    submitted = Some(index);
                    break;
                }
            }

            if let Some(index) = submitted {
                let wait_until = Instant::now() + Duration::from_secs(2);
                while Instant::now() < wait_until {
                    let (count, applied) = self.committed_count(index);
                    if count >= expected && applied.as_deref() == Some(command) {
                        return index;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            } else {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("agreement on {:?} not reached", String::from_utf8_lossy(command));
    }

    pub async fn shutdown(&self) {
        self.network.shutdown().await;
    }
}
