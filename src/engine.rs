//! The seam to the per-server emulation engine.
//!
//! Creating namespaces, running host shells and driving switches belongs to
//! the engine. The cluster only needs to know where each node ended up and
//! whether interfaces must be moved into a namespace.

use log::{debug, info, warn};
use std::collections::HashMap;

use crate::error::Result;
use crate::remote::{CommandRunner, OvsVersionCache, RunOptions};
use crate::server::{Server, ServerRegistry};
use crate::topology::{NodeRole, Topology, VirtualNode};

/// Default OpenFlow controller port.
pub const CONTROLLER_PORT: u16 = 6653;

/// Where a materialised node lives on its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHandle {
    /// Process whose network namespace the node uses.
    pub pid: Option<u32>,
    pub in_namespace: bool,
}

impl NodeHandle {
    /// A node living in its server's root namespace.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn namespace(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            in_namespace: true,
        }
    }

    /// The pid to `nsenter` for commands inside the node, if any.
    pub fn namespace_pid(&self) -> Option<u32> {
        if self.in_namespace {
            self.pid
        } else {
            None
        }
    }

    /// Wraps `command` so it runs inside the node's namespace.
    pub fn wrap(&self, command: &str) -> String {
        match self.namespace_pid() {
            Some(pid) => in_namespace(pid, command),
            None => command.to_string(),
        }
    }
}

/// `command` run inside the network namespace of `pid`.
pub fn in_namespace(pid: u32, command: &str) -> String {
    format!("nsenter -t {} -n {}", pid, command)
}

/// Shared services handed to the engine.
pub struct EngineContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub registry: &'a ServerRegistry,
    pub ovs: &'a OvsVersionCache,
}

impl EngineContext<'_> {
    /// The server a placed node runs on.
    pub fn server_of(&self, node: &VirtualNode) -> Result<&Server> {
        match &node.config.server {
            Some(name) => self.registry.resolve(name),
            None => Ok(self.registry.local()),
        }
    }
}

/// An emulation engine capable of running nodes on any cluster server.
pub trait EmulationEngine: Send {
    /// Materialises `node` on the server recorded in its configuration.
    fn add_node(&mut self, node: &VirtualNode, ctx: &EngineContext<'_>) -> Result<NodeHandle>;

    /// Called once every node and link exists.
    fn start(&mut self, topology: &Topology, ctx: &EngineContext<'_>) -> Result<()>;

    /// Stops every node added so far. Must be safe to call more than once.
    fn stop(&mut self, ctx: &EngineContext<'_>) -> Result<()>;
}

/// Keeps every node in its server's root namespace and runs switches as
/// Open vSwitch bridges.
#[derive(Debug, Default)]
pub struct RootNamespaceEngine {
    /// Switch name to server name
    switches: Vec<(String, String)>,
}

impl RootNamespaceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_switch(&mut self, node: &VirtualNode, server: &Server, ctx: &EngineContext<'_>) -> Result<()> {
        let name = node.name();
        ctx.runner.run_checked(
            server,
            &format!("ovs-vsctl --may-exist add-br {}", name),
            RunOptions::root(),
        )?;
        if ctx.ovs.is_old(ctx.runner, server)? {
            warn!("{} runs an OVS older than 1.10; {} stays on OpenFlow 1.0", server, name);
        } else {
            ctx.runner.run_checked(
                server,
                &format!("ovs-vsctl set bridge {} protocols=OpenFlow10,OpenFlow13", name),
                RunOptions::root(),
            )?;
        }
        self.switches.push((name.to_string(), server.name().to_string()));
        Ok(())
    }
}

impl EmulationEngine for RootNamespaceEngine {
    fn add_node(&mut self, node: &VirtualNode, ctx: &EngineContext<'_>) -> Result<NodeHandle> {
        let server = ctx.server_of(node)?;
        match node.role() {
            NodeRole::Switch => self.add_switch(node, server, ctx)?,
            NodeRole::Host | NodeRole::Controller => {
                debug!("{} stays in the root namespace of {}", node.name(), server)
            }
        }
        Ok(NodeHandle::root())
    }

    fn start(&mut self, topology: &Topology, ctx: &EngineContext<'_>) -> Result<()> {
        let switch_server: HashMap<&str, &str> = self
            .switches
            .iter()
            .map(|(s, server)| (s.as_str(), server.as_str()))
            .collect();

        for link in topology.resolved_links() {
            for (node, intf) in [(&link.node1, &link.intf1), (&link.node2, &link.intf2)] {
                let Some(server) = topology.node(node).map(|n| ctx.server_of(n)).transpose()? else {
                    continue;
                };
                if switch_server.contains_key(node.as_str()) {
                    ctx.runner.run_checked(
                        server,
                        &format!("ovs-vsctl --may-exist add-port {} {}", node, intf),
                        RunOptions::root(),
                    )?;
                }
                ctx.runner
                    .run_checked(server, &format!("ip link set {} up", intf), RunOptions::root())?;
            }
        }

        let controller = topology
            .controllers()
            .first()
            .and_then(|c| topology.node(c))
            .and_then(|c| c.config.server_ip);
        if let Some(ip) = controller {
            for (switch, server) in &self.switches {
                let server = ctx.registry.resolve(server)?;
                ctx.runner.run_checked(
                    server,
                    &format!("ovs-vsctl set-controller {} tcp:{}:{}", switch, ip, CONTROLLER_PORT),
                    RunOptions::root(),
                )?;
            }
        }
        info!("*** Started {} switches", self.switches.len());
        Ok(())
    }

    fn stop(&mut self, ctx: &EngineContext<'_>) -> Result<()> {
        for (switch, server) in self.switches.drain(..).rev() {
            let server = ctx.registry.resolve(&server)?;
            let result = ctx.runner.run(
                server,
                &format!("ovs-vsctl --if-exists del-br {}", switch),
                RunOptions::root(),
            )?;
            if !result.is_success() {
                warn!("Failed to delete {} on {}: {}", switch, server, result.stderr.trim());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::ScriptedRunner;
    use crate::topology::linear;
    use std::net::Ipv4Addr;

    #[test]
    fn test_namespace_wrapping() {
        assert_eq!(NodeHandle::root().wrap("ip link show"), "ip link show");
        assert_eq!(
            NodeHandle::namespace(42).wrap("ip link show"),
            "nsenter -t 42 -n ip link show"
        );
        let outside = NodeHandle {
            pid: Some(7),
            in_namespace: false,
        };
        assert_eq!(outside.namespace_pid(), None);
    }

    #[test]
    fn test_root_engine_lifecycle() {
        let runner = ScriptedRunner::new();
        let registry = ServerRegistry::from_servers(
            vec![
                Server::localhost("mn"),
                Server::new("b", Ipv4Addr::new(10, 0, 0, 2), "mn"),
            ],
            "mn".to_string(),
        );
        let ovs = OvsVersionCache::new();
        let ctx = EngineContext {
            runner: &runner,
            registry: &registry,
            ovs: &ovs,
        };

        let mut topo = linear(1).unwrap();
        topo.node_mut("s1").unwrap().config.server = Some("b".to_string());
        topo.node_mut("c0").unwrap().config.server_ip = Some(Ipv4Addr::LOCALHOST);

        let mut engine = RootNamespaceEngine::new();
        for node in topo.nodes().to_vec() {
            assert_eq!(engine.add_node(&node, &ctx).unwrap(), NodeHandle::root());
        }
        engine.start(&topo, &ctx).unwrap();
        engine.stop(&ctx).unwrap();
        engine.stop(&ctx).unwrap();

        let on_b = runner.commands_on("b");
        assert_eq!(on_b[0], "ovs-vsctl --may-exist add-br s1");
        assert!(on_b.contains(&"ovs-vsctl --may-exist add-port s1 s1-eth1".to_string()));
        assert!(on_b.contains(&"ovs-vsctl set-controller s1 tcp:127.0.0.1:6653".to_string()));
        assert_eq!(
            on_b.iter().filter(|c| c.contains("del-br")).count(),
            1
        );
        assert!(runner
            .commands_on("localhost")
            .contains(&"ip link set h1-eth0 up".to_string()));
    }
}
