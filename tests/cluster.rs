//! Integration tests standing up real `Engine`s wired over real TCP
//! (localhost), exercising the scenarios spec.md §8 names. Port numbers
//! are reserved the way the teacher's network test helpers do: bind an
//! ephemeral listener, read back its assigned port, then drop it.

use raft_kv_core::config::{ClusterMember, ClusterState, Config};
use raft_kv_core::Engine;
use std::time::Duration;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn cluster_config(name: &str, members: &[ClusterMember], data_dir: &std::path::Path) -> Config {
    let me = members.iter().find(|m| m.name == name).unwrap();
    let mut config = Config::default();
    config.name = name.to_string();
    config.initial_cluster = members.to_vec();
    config.initial_cluster_state = ClusterState::New;
    config.data_dir = data_dir.join(name).to_string_lossy().to_string();
    config.listen_peer_host = "127.0.0.1".to_string();
    config.listen_peer_port = me.port;
    config.election_timeout_ms = 300;
    config.heartbeat_interval_ms = 50;
    config.propose_timeout_ms = 3_000;
    config
}

async fn wait_for_leader(engines: &[Engine], timeout: Duration) -> Option<usize> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (i, e) in engines.iter().enumerate() {
            if e.is_leader().await {
                return Some(i);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn s1_single_node_bootstraps_and_proposes() {
    let dir = tempfile::tempdir().unwrap();
    let members = vec![ClusterMember::new("a", "127.0.0.1", free_port())];
    let mut engine = Engine::init(cluster_config("a", &members, dir.path())).unwrap();
    engine.start().await.unwrap();

    let leader = wait_for_leader(std::slice::from_ref(&engine), Duration::from_millis(500)).await;
    assert!(leader.is_some(), "single node must become leader quickly");
    assert_eq!(engine.current_term().await, 1);

    // The new leader's own empty barrier entry (index 1) commits and
    // applies on its own, without waiting for a real proposal.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let applied_before = engine.applied_index();
    assert_eq!(applied_before, 1);

    let index = engine.propose(b"x".to_vec()).await.unwrap();
    assert_eq!(index, applied_before + 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.applied_index(), index);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn s2_three_node_election_and_write_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let members = vec![
        ClusterMember::new("a", "127.0.0.1", free_port()),
        ClusterMember::new("b", "127.0.0.1", free_port()),
        ClusterMember::new("c", "127.0.0.1", free_port()),
    ];

    let mut engines = Vec::new();
    for m in &members {
        let mut e = Engine::init(cluster_config(&m.name, &members, dir.path())).unwrap();
        e.start().await.unwrap();
        engines.push(e);
    }

    let leader_idx = wait_for_leader(&engines, Duration::from_secs(5)).await;
    assert!(leader_idx.is_some(), "a leader must be elected within 5s");
    let leader_idx = leader_idx.unwrap();

    let mut leaders = 0;
    for e in &engines {
        if e.is_leader().await {
            leaders += 1;
        }
    }
    assert_eq!(leaders, 1, "exactly one node reports leader");

    engines[leader_idx].kv_put("k", "v").await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    for (i, e) in engines.iter().enumerate() {
        if i != leader_idx {
            assert_eq!(e.kv_get("k"), Some("v".to_string()), "follower {i} should have replicated write");
        }
    }

    for mut e in engines {
        e.stop().await.unwrap();
    }
}

#[tokio::test]
async fn s3_leader_failure_new_leader_then_rejoin_catches_up() {
    let dir = tempfile::tempdir().unwrap();
    let members = vec![
        ClusterMember::new("a", "127.0.0.1", free_port()),
        ClusterMember::new("b", "127.0.0.1", free_port()),
        ClusterMember::new("c", "127.0.0.1", free_port()),
    ];

    let mut engines = Vec::new();
    for m in &members {
        let mut e = Engine::init(cluster_config(&m.name, &members, dir.path())).unwrap();
        e.start().await.unwrap();
        engines.push(e);
    }

    let first_leader = wait_for_leader(&engines, Duration::from_secs(5)).await.unwrap();

    // Kill the leader.
    engines[first_leader].stop().await.unwrap();

    let survivors: Vec<usize> = (0..engines.len()).filter(|&i| i != first_leader).collect();
    let deadline = Duration::from_secs(5);
    let start = tokio::time::Instant::now();
    let mut new_leader = None;
    while tokio::time::Instant::now() - start < deadline {
        for &i in &survivors {
            if engines[i].is_leader().await {
                new_leader = Some(i);
                break;
            }
        }
        if new_leader.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let new_leader = new_leader.expect("a survivor must become leader");
    assert_ne!(new_leader, first_leader);

    engines[new_leader].kv_put("k2", "v2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Restart the original leader by reopening its durable state. This is
    // the real restart path (spec.md's `RAFT_EXISTING_CLUSTER`): membership
    // must be recovered from the persisted log, not re-derived from
    // `initial_cluster` as a fresh bootstrap would.
    let mut rejoined_config = cluster_config(&members[first_leader].name, &members, dir.path());
    rejoined_config.initial_cluster_state = ClusterState::Existing;
    let mut rejoined = Engine::init(rejoined_config).unwrap();
    rejoined.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rejoined.kv_get("k2"), Some("v2".to_string()));

    rejoined.stop().await.unwrap();
    for &i in &survivors {
        engines[i].stop().await.unwrap();
    }
}

#[tokio::test]
async fn s5_membership_change_propagates_to_cluster_state() {
    let dir = tempfile::tempdir().unwrap();
    let members = vec![
        ClusterMember::new("a", "127.0.0.1", free_port()),
        ClusterMember::new("b", "127.0.0.1", free_port()),
        ClusterMember::new("c", "127.0.0.1", free_port()),
    ];
    let d_addr = format!("127.0.0.1:{}", free_port());

    let mut engines = Vec::new();
    for m in &members {
        let mut e = Engine::init(cluster_config(&m.name, &members, dir.path())).unwrap();
        e.start().await.unwrap();
        engines.push(e);
    }

    let leader_idx = wait_for_leader(&engines, Duration::from_secs(5)).await.unwrap();

    engines[leader_idx]
        .propose_conf_change(raft_kv_core::raft::types::ConfChangeOp::AddVoter, 4, Some(d_addr))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let state_path = dir.path().join(&members[leader_idx].name).join("cluster_state.json");
    let raw = tokio::fs::read_to_string(&state_path).await.unwrap();
    let snapshot: raft_kv_core::observer::ClusterStateSnapshot = serde_json::from_str(&raw).unwrap();
    assert!(
        snapshot.nodes.iter().any(|n| n.id == 4),
        "added node 4 must appear in cluster_state.json's nodes[] within 2s"
    );

    // A second conf change proposed while the first hasn't been observed as
    // fully settled should either succeed in order or be rejected as
    // in-flight; it must never corrupt the membership set.
    let second = engines[leader_idx]
        .propose_conf_change(raft_kv_core::raft::types::ConfChangeOp::AddVoter, 5, Some("127.0.0.1:1".into()))
        .await;
    assert!(second.is_ok() || matches!(second, Err(raft_kv_core::RaftError::ConfChangeInFlight)));

    for mut e in engines {
        e.stop().await.unwrap();
    }
}

#[tokio::test]
async fn membership_change_survives_restart_via_existing_cluster_state() {
    let dir = tempfile::tempdir().unwrap();
    let members = vec![
        ClusterMember::new("a", "127.0.0.1", free_port()),
        ClusterMember::new("b", "127.0.0.1", free_port()),
        ClusterMember::new("c", "127.0.0.1", free_port()),
    ];
    let d_addr = format!("127.0.0.1:{}", free_port());

    let mut engines = Vec::new();
    for m in &members {
        let mut e = Engine::init(cluster_config(&m.name, &members, dir.path())).unwrap();
        e.start().await.unwrap();
        engines.push(e);
    }

    let leader_idx = wait_for_leader(&engines, Duration::from_secs(5)).await.unwrap();
    engines[leader_idx]
        .propose_conf_change(raft_kv_core::raft::types::ConfChangeOp::AddVoter, 4, Some(d_addr))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Stop and reopen node "a" on the real restart path: without replaying
    // ConfChange entries from the persisted log, `build_node` would either
    // refuse to start (no stored snapshot ConfState) or silently forget
    // node 4 ever joined.
    let a_idx = members.iter().position(|m| m.name == "a").unwrap();
    engines[a_idx].stop().await.unwrap();

    let mut reopened_config = cluster_config("a", &members, dir.path());
    reopened_config.initial_cluster_state = ClusterState::Existing;
    let mut reopened = Engine::init(reopened_config).unwrap();
    reopened.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let state_path = dir.path().join("a").join("cluster_state.json");
    let raw = tokio::fs::read_to_string(&state_path).await.unwrap();
    let snapshot: raft_kv_core::observer::ClusterStateSnapshot = serde_json::from_str(&raw).unwrap();
    assert!(
        snapshot.nodes.iter().any(|n| n.id == 4),
        "node 4's membership must survive a real restart of node 'a'"
    );

    reopened.stop().await.unwrap();
    for (i, e) in engines.iter_mut().enumerate() {
        if i != a_idx {
            e.stop().await.unwrap();
        }
    }
}

#[tokio::test]
async fn s6_crash_between_persist_and_apply_recovers_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let members = vec![ClusterMember::new("a", "127.0.0.1", free_port())];
    let node_dir = dir.path().join("a");

    let hello_index = {
        let mut engine = Engine::init(cluster_config("a", &members, dir.path())).unwrap();
        engine.start().await.unwrap();
        wait_for_leader(std::slice::from_ref(&engine), Duration::from_millis(500)).await;
        let index = engine.propose(b"hello".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await.unwrap();
        index
    };

    assert!(node_dir.join("node_1_state.json").exists());

    // Reopening re-elects a leader, which appends its own barrier entry on
    // top of whatever was recovered — applied_index must be at least as
    // high as the recovered "hello" entry, never lower (P5 monotonicity),
    // and the recovered log must still contain it.
    let mut reopened_config = cluster_config("a", &members, dir.path());
    reopened_config.initial_cluster_state = ClusterState::Existing;
    let mut reopened = Engine::init(reopened_config).unwrap();
    reopened.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(reopened.applied_index() >= hello_index);
    reopened.stop().await.unwrap();
}
