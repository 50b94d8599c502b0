//! # local-cluster
//!
//! why: watch a raft cluster elect a leader and replicate, without any network setup
//! relations: runs raft-server's Raft handles over LocalNetwork with in-memory storage
//! what: clap-driven demo binary; `RUST_LOG` controls log output

use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use raft_server::{ApplyMsg, ConfigArgs, LocalNetwork, Raft};
use raft_storage::InMemoryStorage;

#[derive(Parser, Debug)]
#[command(name = "local-cluster")]
#[command(version)]
#[command(about = "Run an in-process raft cluster and replicate a few commands")]
struct Args {
    /// Number of servers in the cluster
    #[arg(
        long,
        env = "RAFT_CLUSTER_SIZE",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    cluster_size: u64,

    /// Commands to submit once a leader is elected (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "set x = 1,set y = 2,del x")]
    commands: Vec<String>,

    #[command(flatten)]
    raft: ConfigArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.raft.into_config()?;
    let cluster: Vec<u64> = (1..=args.cluster_size).collect();

    let network = LocalNetwork::new();
    let mut receivers: Vec<(u64, mpsc::Receiver<ApplyMsg>)> = Vec::new();
    for &id in &cluster {
        let (tx, rx) = mpsc::channel(config.apply_buffer);
        let raft = Raft::new(
            id,
            cluster.clone(),
            network.transport(id),
            Box::new(InMemoryStorage::new()),
            tx,
            config.clone(),
        )?;
        network.register(raft).await;
        receivers.push((id, rx));
    }

    let leader = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(leader) = network.leader().await {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .map_err(|_| "no leader elected within 5s")?;

    let (term, _) = leader.get_state().await;
    tracing::info!(leader_id = leader.id(), term, "leader elected");

    for command in &args.commands {
        let (index, term, is_leader) = leader.start(command.as_bytes().to_vec()).await?;
        tracing::info!(index, term, is_leader, command = %command, "submitted");
    }

    tokio::time::sleep(config.heartbeat_interval * 5).await;

    for (id, rx) in &mut receivers {
        while let Ok(msg) = rx.try_recv() {
            tracing::info!(
                node_id = *id,
                index = msg.index,
                term = msg.term,
                command = %String::from_utf8_lossy(&msg.command),
                "applied"
            );
        }
    }

    for raft in network.nodes().await {
        let status = raft.status().await;
        tracing::info!(
            node_id = status.id,
            state = %status.state,
            term = status.term,
            commit_index = status.commit_index,
            last_applied = status.last_applied,
            "final status"
        );
    }

    network.shutdown().await;
    Ok(())
}
