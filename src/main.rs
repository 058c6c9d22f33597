//! Demo embedding binary: wires up an `Engine` from a populated `Config`
//! and runs until interrupted. Stands in for "the embedding database
//! server process" spec.md treats as an external collaborator — this
//! binary does no SQL parsing, query execution, or admin CLI of its own,
//! it only exercises the control surface `spec.md` §6 defines.
//!
//! Grounded on the teacher's `main.rs` (tracing-subscriber init, config
//! construction, `tokio::signal::ctrl_c()` shutdown).

use raft_kv_core::config::{ClusterMember, ClusterState, Config};
use raft_kv_core::Engine;
use std::env;

fn config_from_env() -> Config {
    let mut config = Config::default();

    if let Ok(name) = env::var("RAFT_NODE_NAME") {
        config.name = name;
    }
    if let Ok(dir) = env::var("RAFT_DATA_DIR") {
        config.data_dir = dir;
    }
    if let Ok(host) = env::var("RAFT_LISTEN_HOST") {
        config.listen_peer_host = host;
    }
    if let Ok(port) = env::var("RAFT_LISTEN_PORT") {
        if let Ok(port) = port.parse() {
            config.listen_peer_port = port;
        }
    }
    if let Ok(members) = env::var("RAFT_CLUSTER") {
        // "name1=host1:port1,name2=host2:port2,..."
        let parsed: Vec<ClusterMember> = members
            .split(',')
            .filter_map(|entry| {
                let (name, hostport) = entry.split_once('=')?;
                let (host, port) = hostport.rsplit_once(':')?;
                Some(ClusterMember::new(name, host, port.parse().ok()?))
            })
            .collect();
        if !parsed.is_empty() {
            config.initial_cluster = parsed;
        }
    }
    if env::var("RAFT_EXISTING_CLUSTER").is_ok() {
        config.initial_cluster_state = ClusterState::Existing;
    }

    config
}

#[tokio::main]
async fn main() {
    let config = config_from_env();

    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        name = %config.name,
        data_dir = %config.data_dir,
        "starting raft-kv-node"
    );

    let mut engine = match Engine::init(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "engine initialization failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.start().await {
        tracing::error!(error = %e, "engine failed to start");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c, shutting down anyway");
    }

    tracing::info!("shutdown signal received, stopping engine");
    if let Err(e) = engine.stop().await {
        tracing::error!(error = %e, "engine failed to stop cleanly");
        std::process::exit(1);
    }
}
