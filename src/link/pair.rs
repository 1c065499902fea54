use log::debug;

use super::LinkEndpoint;
use crate::error::Result;
use crate::link::interfaces;
use crate::remote::{CommandRunner, RetryConfig, RunOptions};
use crate::server::Server;

/// The `ip link add` command for a veth pair between two endpoints.
pub fn add_command(a: &LinkEndpoint, b: &LinkEndpoint) -> String {
    let mut command = format!("ip link add name {}", a.interface);
    if let Some(address) = &a.address {
        command.push_str(&format!(" address {}", address));
    }
    command.push_str(&format!(" type veth peer name {}", b.interface));
    if let Some(address) = &b.address {
        command.push_str(&format!(" address {}", address));
    }
    command
}

/// Creates a veth pair on `server` and moves each end into its node.
///
/// Stale interfaces with the requested names are deleted first, both in the
/// root namespace and in the endpoint namespaces.
pub fn create_pair(
    runner: &dyn CommandRunner,
    server: &Server,
    a: &LinkEndpoint,
    b: &LinkEndpoint,
    retry: &RetryConfig,
) -> Result<()> {
    for end in [a, b] {
        interfaces::delete_stale(runner, server, None, &end.interface)?;
        if end.namespace.is_some() {
            interfaces::delete_stale(runner, server, end.namespace, &end.interface)?;
        }
    }

    debug!("Creating {} <-> {} on {}", a.interface, b.interface, server);
    runner.run_checked(server, &add_command(a, b), RunOptions::root())?;

    for end in [a, b] {
        if let Some(pid) = end.namespace {
            interfaces::move_to_namespace(runner, server, &end.interface, &end.node, pid, retry)?;
        }
    }
    Ok(())
}

/// Deletes the pair through one of its ends.
pub fn delete_pair(runner: &dyn CommandRunner, server: &Server, a: &LinkEndpoint) -> Result<bool> {
    interfaces::delete_stale(runner, server, a.namespace, &a.interface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::ScriptedRunner;

    #[test]
    fn test_add_command() {
        let a = LinkEndpoint::new("h1", Server::localhost("mn"), "h1-eth0")
            .with_address("00:00:00:00:00:01");
        let b = LinkEndpoint::new("s1", Server::localhost("mn"), "s1-eth1");
        assert_eq!(
            add_command(&a, &b),
            "ip link add name h1-eth0 address 00:00:00:00:00:01 type veth peer name s1-eth1"
        );
    }

    #[test]
    fn test_pair_replaces_stale_interfaces() {
        let runner = ScriptedRunner::new();
        let server = Server::localhost("mn");
        runner.add_interface("localhost", None, "h1-eth0");

        let a = LinkEndpoint::new("h1", server.clone(), "h1-eth0").with_namespace(40);
        let b = LinkEndpoint::new("s1", server.clone(), "s1-eth1");
        create_pair(&runner, &server, &a, &b, &RetryConfig::fixed(3, 1)).unwrap();

        assert_eq!(runner.interfaces("localhost", None), vec!["s1-eth1"]);
        assert_eq!(runner.interfaces("localhost", Some(40)), vec!["h1-eth0"]);
    }
}
