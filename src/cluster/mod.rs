//! Cluster start and teardown.
//!
//! `ClusterOrchestrator::start` runs the phases in a fixed order: server
//! precheck, placement, node creation through the engine, link creation.
//! Nothing is created on any server before the precheck and placement have
//! both succeeded, and a failure in a later phase tears down whatever was
//! already built.

use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::engine::{EmulationEngine, EngineContext};
use crate::error::{Error, Result};
use crate::link::{Link, LinkEndpoint, LinkKind, LinkProvisioner, LinkStatus, TunnelSettings};
use crate::node::RemoteNode;
use crate::placement::{compute_placement, Placement};
use crate::remote::{precheck, Cleanup, CommandRunner, ConnectionCache, OvsVersionCache};
use crate::server::ServerRegistry;
use crate::topology::Topology;

pub struct ClusterOrchestrator {
    config: ClusterConfig,
    registry: ServerRegistry,
    runner: Arc<dyn CommandRunner>,
    engine: Box<dyn EmulationEngine>,
    provisioner: LinkProvisioner,
    ovs: OvsVersionCache,
    connections: Option<Arc<ConnectionCache>>,
    placement: Placement,
    topology: Option<Topology>,
    nodes: Vec<RemoteNode>,
    links: Vec<Link>,
}

impl ClusterOrchestrator {
    pub fn new(
        config: ClusterConfig,
        registry: ServerRegistry,
        runner: Arc<dyn CommandRunner>,
        engine: Box<dyn EmulationEngine>,
    ) -> Self {
        let provisioner = LinkProvisioner::new(runner.clone(), TunnelSettings::from_config(&config));
        Self {
            config,
            registry,
            runner,
            engine,
            provisioner,
            ovs: OvsVersionCache::new(),
            connections: None,
            placement: Placement::new(),
            topology: None,
            nodes: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Cache of shared ssh connections to clear at teardown.
    pub fn with_connections(mut self, connections: Arc<ConnectionCache>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// The placed topology of a running cluster.
    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    pub fn nodes(&self) -> &[RemoteNode] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn is_running(&self) -> bool {
        self.topology.is_some()
    }

    /// Checks every remote server, reporting all failures at once.
    pub fn precheck(&self) -> Result<()> {
        precheck(self.runner.as_ref(), &self.registry)
    }

    /// Computes the placement and records server, address and control path
    /// in every node's configuration.
    pub fn place(&mut self, topology: &mut Topology) -> Result<()> {
        info!("*** Placing nodes");
        let placement = compute_placement(self.config.placement, &self.registry, topology)?;
        for (node, server) in placement.entries() {
            let server = self.registry.resolve(server)?;
            if let Some(node) = topology.node_mut(node) {
                node.config.server = Some(server.name().to_string());
                node.config.server_ip = Some(server.ip());
                node.config.control_path = server.control_path().map(String::from);
            }
        }
        self.placement = placement;
        Ok(())
    }

    /// The realisation each link of a placed topology would get.
    pub fn plan(&self, topology: &Topology) -> Result<Vec<(String, LinkKind)>> {
        let server_of = |node: &str| {
            let name = self
                .placement
                .server_of(node)
                .ok_or_else(|| Error::UnplacedNode {
                    node: node.to_string(),
                })?;
            self.registry.resolve(name)
        };
        topology
            .resolved_links()
            .into_iter()
            .map(|link| {
                let kind = LinkKind::decide(server_of(link.node1.as_str())?, server_of(link.node2.as_str())?);
                Ok((
                    format!("{}:{} <-> {}:{}", link.node1, link.intf1, link.node2, link.intf2),
                    kind,
                ))
            })
            .collect()
    }

    /// Builds the whole cluster. On failure everything already created is
    /// removed again.
    pub fn start(&mut self, mut topology: Topology) -> Result<()> {
        if self.is_running() {
            return Err(Error::Config("The cluster is already running".to_string()));
        }
        if self.config.precheck {
            self.precheck()?;
        }
        self.place(&mut topology)?;

        if let Err(e) = self.build(&topology) {
            error!("Cluster start failed: {}", e);
            self.teardown();
            return Err(e);
        }
        info!(
            "*** Cluster up: {} nodes on {} servers, {} links",
            self.nodes.len(),
            self.registry.len(),
            self.links.len()
        );
        self.topology = Some(topology);
        Ok(())
    }

    fn build(&mut self, topology: &Topology) -> Result<()> {
        let ctx = EngineContext {
            runner: self.runner.as_ref(),
            registry: &self.registry,
            ovs: &self.ovs,
        };

        info!("*** Adding nodes");
        for node in topology.nodes() {
            let server = ctx.server_of(node)?.clone();
            let handle = self.engine.add_node(node, &ctx)?;
            self.nodes.push(RemoteNode::new(
                node.clone(),
                server,
                handle,
                self.runner.clone(),
            ));
        }

        info!("*** Adding links");
        let nodes: HashMap<&str, &RemoteNode> =
            self.nodes.iter().map(|n| (n.name(), n)).collect();
        let endpoint = |node: &str, intf: &str, addr: Option<&str>| {
            nodes
                .get(node)
                .map(|n| LinkEndpoint::from_node(n, intf, addr))
                .ok_or_else(|| Error::Topology(format!("Link end {} was never added", node)))
        };
        for link in topology.resolved_links() {
            let a = endpoint(link.node1.as_str(), link.intf1.as_str(), link.addr1.as_deref())?;
            let b = endpoint(link.node2.as_str(), link.intf2.as_str(), link.addr2.as_deref())?;
            let link = self.provisioner.establish(a, b)?;
            self.links.push(link);
        }

        self.engine.start(topology, &ctx)
    }

    /// Status of every link, in creation order.
    pub fn status(&self) -> Vec<(String, LinkStatus)> {
        self.links
            .iter()
            .map(|link| (link.to_string(), link.status()))
            .collect()
    }

    /// One `server: node node ...` line per server.
    pub fn placement_report(&self) -> String {
        self.placement.report(&self.registry.names())
    }

    /// Removes every link and node. Runs even after the runner has been
    /// cancelled.
    fn teardown(&mut self) {
        let links = std::mem::take(&mut self.links);
        if !links.is_empty() {
            info!("*** Removing {} links", links.len());
        }
        for link in links.iter().rev() {
            if let Err(e) = self.provisioner.teardown(link) {
                warn!("Failed to remove {}: {}", link, e);
            }
        }

        let cleanup = Cleanup::new(self.runner.as_ref());
        let ctx = EngineContext {
            runner: &cleanup,
            registry: &self.registry,
            ovs: &self.ovs,
        };
        if let Err(e) = self.engine.stop(&ctx) {
            warn!("Failed to stop nodes: {}", e);
        }
        self.nodes.clear();
        if let Some(connections) = &self.connections {
            connections.clear();
        }
    }

    /// Tears the cluster down. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        if self.topology.take().is_some() {
            info!("*** Stopping cluster");
        }
        self.teardown();
        Ok(())
    }
}

impl Drop for ClusterOrchestrator {
    fn drop(&mut self) {
        if !self.links.is_empty() || self.topology.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RootNamespaceEngine;
    use crate::placement::PlacerKind;
    use crate::remote::mock::ScriptedRunner;
    use crate::server::Server;
    use crate::topology::linear;
    use std::net::Ipv4Addr;

    fn orchestrator(runner: Arc<ScriptedRunner>) -> ClusterOrchestrator {
        let config = ClusterConfig {
            placement: PlacerKind::RoundRobin,
            ..ClusterConfig::default()
        };
        let registry = ServerRegistry::from_servers(
            vec![
                Server::localhost("mn"),
                Server::new("b", Ipv4Addr::new(10, 0, 0, 2), "mn"),
            ],
            "mn".to_string(),
        );
        ClusterOrchestrator::new(config, registry, runner, Box::new(RootNamespaceEngine::new()))
    }

    #[test]
    fn test_plan_follows_placement() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut cluster = orchestrator(runner.clone());
        let mut topo = linear(2).unwrap();
        cluster.place(&mut topo).unwrap();

        // round robin over c0 h1 s1 h2 s2
        assert_eq!(cluster.placement_report(), "localhost: c0 s1 s2\nb: h1 h2");
        assert_eq!(topo.node("h1").unwrap().config.server_ip, Some(Ipv4Addr::new(10, 0, 0, 2)));

        let plan = cluster.plan(&topo).unwrap();
        let kinds: Vec<LinkKind> = plan.iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, vec![LinkKind::Tunnel, LinkKind::Tunnel, LinkKind::LocalPair]);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_start_and_stop() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut cluster = orchestrator(runner.clone());
        cluster.start(linear(2).unwrap()).unwrap();

        let status: Vec<String> = cluster.status().into_iter().map(|(_, s)| s.to_string()).collect();
        assert_eq!(status.len(), 3);
        assert!(status[0].starts_with("Tunnel Running"));
        assert_eq!(status[2], "OK");

        cluster.stop().unwrap();
        cluster.stop().unwrap();
        assert!(!cluster.is_running());
        assert!(runner.spawned().iter().all(|p| !p.is_running()));
        assert!(runner.spawned().iter().all(|p| p.terminate_calls() == 1));
    }
}
