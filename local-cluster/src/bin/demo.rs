//! Runs a small cluster in-process: writes some keys, grows the cluster, swaps a founder out
//! and crashes a random node along the way.

use color_eyre::eyre::Result;
use rand::seq::SliceRandom;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use jointraft_local_cluster::LocalCluster;
use jointraft_raft::EngineConfig;

const NODE_COUNT: usize = 3;

fn init_tracing() {
    if std::env::var_os("TOKIO_CONSOLE").is_some() {
        console_subscriber::init();
        return;
    }
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let engine = EngineConfig {
        snapshot_threshold: 8,
        ..EngineConfig::default()
    };
    engine.validate()?;
    let mut cluster = LocalCluster::new(NODE_COUNT, engine).await?;

    let client = cluster.client();
    for i in 0..10 {
        let previous = client.set(&format!("key-{i}"), &format!("value-{i}")).await?;
        info!(key = i, ?previous, "Stored");
    }

    let newcomer = cluster.add_node().await?;
    let mut members: Vec<usize> = (1..NODE_COUNT).collect();
    members.push(newcomer);
    info!(?members, "Replacing node-0");
    cluster
        .client()
        .change_configuration(cluster.change_request(&members)?)
        .await?;

    let victim = *members
        .choose(&mut rand::thread_rng())
        .unwrap_or(&newcomer);
    info!(slot = victim, "Crashing");
    cluster.crash(victim).await?;

    let mut client = cluster.client();
    client.set_members(
        members
            .iter()
            .map(|slot| cluster.id(*slot))
            .collect::<Result<Vec<_>>>()?,
    );
    for i in 10..20 {
        client.set(&format!("key-{i}"), &format!("value-{i}")).await?;
    }
    info!(value = ?client.get("key-15").await?, "Read back key-15");

    cluster.restart(victim).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    for node in cluster.summaries().await {
        match node.raft {
            Some(raft) => info!(
                slot = node.slot,
                id = %node.id,
                state = %raft.state,
                term = raft.term,
                commit_index = raft.commit_index,
                snapshot_index = raft.snapshot_index,
                keys = cluster.kv(node.slot)?.entries().len(),
                "Final state"
            ),
            None => info!(slot = node.slot, id = %node.id, "Dead"),
        }
    }

    cluster.shutdown().await
}
