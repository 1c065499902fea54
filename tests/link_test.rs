use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netcluster::error::ClusterError;
use netcluster::link::{LinkEndpoint, LinkKind, LinkProvisioner, LinkStatus, TunnelSettings};
use netcluster::remote::mock::{ScriptedRunner, Transport};
use netcluster::remote::{ProcessStatus, RetryConfig};
use netcluster::server::Server;

fn server(name: &str, last: u8) -> Server {
    Server::new(name, Ipv4Addr::new(10, 0, 0, last), "mn")
}

fn quick_settings() -> TunnelSettings {
    TunnelSettings {
        handshake_timeout: Duration::from_millis(150),
        migration: RetryConfig::fixed(3, 1),
    }
}

fn provisioner(runner: &Arc<ScriptedRunner>) -> LinkProvisioner {
    LinkProvisioner::new(runner.clone(), quick_settings())
}

#[test]
fn test_silent_handshake_leaves_no_transport() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.push_transport(Transport::Silent);
    let links = provisioner(&runner);

    let started = Instant::now();
    let result = links.establish(
        LinkEndpoint::new("h1", server("a", 1), "h1-eth0"),
        LinkEndpoint::new("s1", server("b", 2), "s1-eth1"),
    );
    match result {
        Err(ClusterError::TunnelHandshakeFailed {
            initiator, peer, ..
        }) => {
            assert_eq!(initiator, "a");
            assert_eq!(peer, "b");
        }
        other => panic!("expected TunnelHandshakeFailed, got {:?}", other.map(|l| l.to_string())),
    }
    assert!(started.elapsed() >= Duration::from_millis(150));

    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 1);
    assert!(!spawned[0].is_running());
    assert_eq!(spawned[0].terminate_calls(), 1);
    assert!(runner.interfaces("a", None).is_empty());
    assert!(runner.interfaces("b", None).is_empty());
}

#[test]
fn test_tunnel_teardown_is_idempotent() {
    let runner = Arc::new(ScriptedRunner::new());
    let links = provisioner(&runner);
    let link = links
        .establish(
            LinkEndpoint::new("h1", server("b", 2), "h1-eth0"),
            LinkEndpoint::new("s1", Server::localhost("mn"), "s1-eth1"),
        )
        .unwrap();
    assert_eq!(link.kind(), LinkKind::Tunnel);
    assert!(link.status().to_string().starts_with("Tunnel Running ("));

    links.teardown(&link).unwrap();
    links.teardown(&link).unwrap();
    assert!(link.is_torn_down());

    let spawned = runner.spawned();
    assert_eq!(spawned[0].terminate_calls(), 1);
    assert!(!spawned[0].is_running());
    assert_eq!(link.status().to_string(), "Tunnel EXITED 143");
    assert!(runner.interfaces("b", None).is_empty());
    assert!(runner.interfaces("localhost", None).is_empty());
}

#[test]
fn test_transport_exit_shows_in_status() {
    let runner = Arc::new(ScriptedRunner::new());
    let links = provisioner(&runner);
    let link = links
        .establish(
            LinkEndpoint::new("h1", server("a", 1), "h1-eth0"),
            LinkEndpoint::new("h2", server("b", 2), "h2-eth0"),
        )
        .unwrap();

    runner.spawned()[0].exit(255);
    match link.status() {
        LinkStatus::Tunnel { status, .. } => assert_eq!(status, ProcessStatus::Exited(255)),
        other => panic!("expected tunnel status, got {}", other),
    }

    // already exited, nothing left to terminate
    links.teardown(&link).unwrap();
    assert_eq!(runner.spawned()[0].terminate_calls(), 0);
}

#[test]
fn test_migration_retries_then_gives_up() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.stick_interface("b", "tap9", 3);
    let links = provisioner(&runner);

    let result = links.establish(
        LinkEndpoint::new("h1", server("b", 2), "h1-eth0").with_namespace(700),
        LinkEndpoint::new("s1", Server::localhost("mn"), "s1-eth1"),
    );
    match result {
        Err(ClusterError::InterfaceMigrationFailed {
            server,
            interface,
            node,
            attempts,
        }) => {
            assert_eq!(server, "b");
            assert_eq!(interface, "tap9");
            assert_eq!(node, "h1");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected InterfaceMigrationFailed, got {:?}", other.map(|l| l.to_string())),
    }
    assert!(!runner.spawned()[0].is_running());
}

#[test]
fn test_migration_recovers_within_bound() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.stick_interface("b", "tap9", 2);
    let links = provisioner(&runner);

    let link = links
        .establish(
            LinkEndpoint::new("h1", server("b", 2), "h1-eth0").with_namespace(700),
            LinkEndpoint::new("s1", Server::localhost("mn"), "s1-eth1"),
        )
        .unwrap();
    assert_eq!(runner.interfaces("b", Some(700)), vec!["h1-eth0"]);
    let moves = runner
        .commands_on("b")
        .iter()
        .filter(|c| c.as_str() == "ip link set tap9 netns 700")
        .count();
    assert_eq!(moves, 3);
    links.teardown(&link).unwrap();
}

#[test]
fn test_local_pair_never_spawns() {
    let runner = Arc::new(ScriptedRunner::new());
    let links = provisioner(&runner);
    let link = links
        .establish(
            LinkEndpoint::new("h1", Server::localhost("mn"), "h1-eth0"),
            LinkEndpoint::new("s1", Server::localhost("mn"), "s1-eth1"),
        )
        .unwrap();

    assert_eq!(link.kind(), LinkKind::LocalPair);
    assert_eq!(link.status(), LinkStatus::Ok);
    assert!(runner.spawned().is_empty());
    assert_eq!(runner.interfaces("localhost", None), vec!["h1-eth0", "s1-eth1"]);
}
