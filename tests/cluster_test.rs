use std::net::Ipv4Addr;
use std::sync::Arc;

use netcluster::cluster::ClusterOrchestrator;
use netcluster::config::ClusterConfig;
use netcluster::engine::RootNamespaceEngine;
use netcluster::error::ClusterError;
use netcluster::placement::PlacerKind;
use netcluster::remote::mock::{ScriptedRunner, Transport};
use netcluster::remote::CommandRunner;
use netcluster::server::{Server, ServerRegistry};
use netcluster::topology::linear;

fn cluster(runner: &Arc<ScriptedRunner>, remote: &[&str], placement: PlacerKind) -> ClusterOrchestrator {
    let config = ClusterConfig {
        placement,
        handshake_timeout_secs: 1,
        ..ClusterConfig::default()
    };
    let mut servers = vec![Server::localhost("mn")];
    for (i, name) in remote.iter().enumerate() {
        servers.push(Server::new(name, Ipv4Addr::new(10, 0, 0, i as u8 + 2), "mn"));
    }
    let registry = ServerRegistry::from_servers(servers, "mn".to_string());
    ClusterOrchestrator::new(config, registry, runner.clone(), Box::new(RootNamespaceEngine::new()))
}

#[test]
fn test_precheck_failure_stops_before_placement() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.fail_server("b");
    let mut cluster = cluster(&runner, &["b", "c"], PlacerKind::SwitchBin);

    match cluster.start(linear(3).unwrap()) {
        Err(ClusterError::PrecheckFailed { failures }) => {
            let servers: Vec<&str> = failures.iter().map(|f| f.server.as_str()).collect();
            assert_eq!(servers, vec!["b"]);
            assert!(failures[0].stderr.contains("Connection refused"));
        }
        other => panic!("expected PrecheckFailed, got {:?}", other),
    }

    assert!(cluster.placement().is_empty());
    assert!(!cluster.is_running());
    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.command == "true" && c.server != "localhost"));
}

#[test]
fn test_precheck_message_names_every_server() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.fail_server("b");
    runner.fail_server("c");
    let mut cluster = cluster(&runner, &["b", "c"], PlacerKind::SwitchBin);

    let message = cluster.start(linear(2).unwrap()).unwrap_err().to_string();
    assert!(message.contains("2 server(s)"));
    assert!(message.contains("  b: ssh mn@10.0.0.2 sudo true"));
    assert!(message.contains("  c: ssh mn@10.0.0.3 sudo true"));
    assert!(message.contains("Make sure that the above ssh commands work correctly"));
}

#[test]
fn test_failed_tunnel_rolls_back_everything() {
    let runner = Arc::new(ScriptedRunner::new());
    // h1-s1 comes up, h2-s2 never answers
    runner.push_transport(Transport::Handshake);
    runner.push_transport(Transport::Silent);
    let mut cluster = cluster(&runner, &["b"], PlacerKind::RoundRobin);

    let result = cluster.start(linear(2).unwrap());
    assert!(matches!(result, Err(ClusterError::TunnelHandshakeFailed { .. })));

    assert!(!cluster.is_running());
    assert!(cluster.links().is_empty());
    assert!(cluster.nodes().is_empty());
    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 2);
    for process in &spawned {
        assert!(!process.is_running(), "{} still running", process.command());
        assert_eq!(process.terminate_calls(), 1);
    }
    assert!(runner.interfaces("b", None).is_empty());
    assert!(runner.interfaces("localhost", None).is_empty());
}

#[test]
fn test_local_only_cluster_uses_pairs() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut cluster = cluster(&runner, &[], PlacerKind::SwitchBin);
    cluster.start(linear(3).unwrap()).unwrap();

    assert_eq!(cluster.placement_report(), "localhost: c0 h1 s1 h2 s2 h3 s3");
    assert!(cluster.status().iter().all(|(_, s)| s.to_string() == "OK"));
    assert!(runner.spawned().is_empty());
    assert!(runner
        .commands_on("localhost")
        .contains(&"ovs-vsctl --may-exist add-br s1".to_string()));

    cluster.stop().unwrap();
    assert!(runner
        .commands_on("localhost")
        .contains(&"ovs-vsctl --if-exists del-br s3".to_string()));
}

#[test]
fn test_drop_tears_down() {
    let runner = Arc::new(ScriptedRunner::new());
    {
        let mut cluster = cluster(&runner, &["b"], PlacerKind::RoundRobin);
        cluster.start(linear(2).unwrap()).unwrap();
        assert!(runner.spawned().iter().all(|p| p.is_running()));
    }
    assert!(runner.spawned().iter().all(|p| !p.is_running()));
}

#[test]
fn test_cancel_mid_start_still_rolls_back() {
    let runner = Arc::new(ScriptedRunner::new());
    // the second tunnel is cancelled while renaming its carrier on b
    runner.cancel_on("b", "name h2-eth0");
    let mut cluster = cluster(&runner, &["b"], PlacerKind::RoundRobin);

    let result = cluster.start(linear(2).unwrap());
    assert!(matches!(result, Err(ClusterError::Cancelled { .. })));
    assert!(runner.is_cancelled());

    assert!(!cluster.is_running());
    assert!(cluster.links().is_empty());
    assert!(cluster.nodes().is_empty());
    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 2);
    assert!(spawned.iter().all(|p| !p.is_running()));
    assert!(runner.interfaces("b", None).is_empty());
    assert!(runner.interfaces("localhost", None).is_empty());
    for switch in ["s1", "s2"] {
        assert!(runner
            .commands_on("localhost")
            .contains(&format!("ovs-vsctl --if-exists del-br {}", switch)));
    }
}
