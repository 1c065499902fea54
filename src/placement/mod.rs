//! Node placement strategies.
//!
//! A placer is built once per cluster start from the full server list and
//! topology, then asked for the server of every node before any node is
//! instantiated. Returning `None` leaves the node on the local machine.

mod host_switch_bin;
mod simple;
mod switch_bin;

pub use host_switch_bin::HostSwitchBinPlacer;
pub use simple::{DefaultPlacer, RandomPlacer, RoundRobinPlacer};
pub use switch_bin::SwitchBinPlacer;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::server::{normalize_server_name, ServerRegistry};
use crate::topology::{NodeRole, Topology};

/// Maps node names to server names.
pub trait Placer {
    /// Returns the server for `node`, or `None` to keep it local.
    fn place(&mut self, node: &str) -> Result<Option<String>>;
}

/// Which placer a cluster run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacerKind {
    Default,
    Random,
    RoundRobin,
    #[default]
    SwitchBin,
    HostSwitchBin,
}

impl PlacerKind {
    pub const ALL: [PlacerKind; 5] = [
        PlacerKind::Default,
        PlacerKind::Random,
        PlacerKind::RoundRobin,
        PlacerKind::SwitchBin,
        PlacerKind::HostSwitchBin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlacerKind::Default => "default",
            PlacerKind::Random => "random",
            PlacerKind::RoundRobin => "round-robin",
            PlacerKind::SwitchBin => "switch-bin",
            PlacerKind::HostSwitchBin => "host-switch-bin",
        }
    }

    /// Constructs the placer. Eager placers may fail here.
    pub fn build(&self, input: &PlacementInput) -> Result<Box<dyn Placer>> {
        Ok(match self {
            PlacerKind::Default => Box::new(DefaultPlacer),
            PlacerKind::Random => Box::new(RandomPlacer::new(input)?),
            PlacerKind::RoundRobin => Box::new(RoundRobinPlacer::new(input)?),
            PlacerKind::SwitchBin => Box::new(SwitchBinPlacer::new(input)?),
            PlacerKind::HostSwitchBin => Box::new(HostSwitchBinPlacer::new(input)?),
        })
    }
}

impl fmt::Display for PlacerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        PlacerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = PlacerKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown placer '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

/// Everything a placer may look at.
#[derive(Debug, Clone)]
pub struct PlacementInput {
    pub servers: Vec<String>,
    pub nodes: Vec<(String, NodeRole)>,
    pub links: Vec<(String, String)>,
    roles: HashMap<String, NodeRole>,
}

impl PlacementInput {
    pub fn new(
        servers: Vec<String>,
        nodes: Vec<(String, NodeRole)>,
        links: Vec<(String, String)>,
    ) -> Self {
        let roles = nodes.iter().cloned().collect();
        Self {
            servers,
            nodes,
            links,
            roles,
        }
    }

    pub fn from_topology(servers: Vec<String>, topo: &Topology) -> Self {
        let nodes = topo
            .nodes()
            .iter()
            .map(|n| (n.name().to_string(), n.role()))
            .collect();
        let links = topo
            .links()
            .iter()
            .map(|l| (l.node1.clone(), l.node2.clone()))
            .collect();
        Self::new(servers, nodes, links)
    }

    pub fn role(&self, node: &str) -> Option<NodeRole> {
        self.roles.get(node).copied()
    }

    /// Node names with the given role, in topology order.
    pub fn with_role(&self, role: NodeRole) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, r)| *r == role)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub(crate) fn require_servers(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config(
                "Placement needs at least one server".to_string(),
            ));
        }
        Ok(())
    }
}

/// The server assignment of every node of one cluster run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: &str, server: &str) {
        match self.index.get(node) {
            Some(&i) => self.entries[i].1 = server.to_string(),
            None => {
                self.index.insert(node.to_string(), self.entries.len());
                self.entries.push((node.to_string(), server.to_string()));
            }
        }
    }

    pub fn server_of(&self, node: &str) -> Option<&str> {
        self.index.get(node).map(|&i| self.entries[i].1.as_str())
    }

    /// `(node, server)` pairs in placement order.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Node names grouped per server, in server-list order. Servers used by
    /// the placement but missing from `servers` follow at the end.
    pub fn by_server(&self, servers: &[String]) -> Vec<(String, Vec<String>)> {
        let mut order: Vec<&String> = servers.iter().collect();
        for (_, server) in &self.entries {
            if !order.contains(&server) {
                order.push(server);
            }
        }
        order
            .into_iter()
            .map(|server| {
                let nodes = self
                    .entries
                    .iter()
                    .filter(|(_, s)| s == server)
                    .map(|(n, _)| n.clone())
                    .collect();
                (server.clone(), nodes)
            })
            .collect()
    }

    /// One `server: node node ...` line per server.
    pub fn report(&self, servers: &[String]) -> String {
        self.by_server(servers)
            .into_iter()
            .map(|(server, nodes)| format!("{}: {}", server, nodes.join(" ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs `kind` over the whole topology.
///
/// A server already set in a node's configuration is kept; everything else
/// is asked of the placer, with `None` meaning the local server. Every
/// server named must exist in `registry`.
pub fn compute_placement(
    kind: PlacerKind,
    registry: &ServerRegistry,
    topo: &Topology,
) -> Result<Placement> {
    let input = PlacementInput::from_topology(registry.names(), topo);
    let mut placer = kind.build(&input)?;
    info!("Placing {} nodes with the {} placer", topo.nodes().len(), kind);

    let mut placement = Placement::new();
    for node in topo.nodes() {
        let server = match &node.config.server {
            Some(preset) => registry.resolve(&normalize_server_name(Some(preset)))?,
            None => match placer.place(node.name())? {
                Some(name) => registry.resolve(&normalize_server_name(Some(name.as_str())))?,
                None => registry.local(),
            },
        };
        debug!("{} -> {}", node.name(), server.name());
        placement.insert(node.name(), server.name());
    }
    Ok(placement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use std::net::Ipv4Addr;

    fn registry(names: &[&str]) -> ServerRegistry {
        let servers = names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                if *n == "localhost" {
                    Server::localhost("u")
                } else {
                    Server::new(n, Ipv4Addr::new(10, 0, 0, i as u8 + 1), "u")
                }
            })
            .collect();
        ServerRegistry::from_servers(servers, "u".to_string())
    }

    #[test]
    fn test_placer_kind_parse() {
        assert_eq!("switch-bin".parse::<PlacerKind>(), Ok(PlacerKind::SwitchBin));
        assert_eq!("round-robin".parse::<PlacerKind>(), Ok(PlacerKind::RoundRobin));
        let err = "best".parse::<PlacerKind>().unwrap_err();
        assert!(err.contains("host-switch-bin"));
        for kind in PlacerKind::ALL {
            assert_eq!(kind.to_string().parse::<PlacerKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_default_placer_keeps_everything_local() {
        let topo = crate::topology::linear(2).unwrap();
        let placement =
            compute_placement(PlacerKind::Default, &registry(&["localhost", "b"]), &topo)
                .unwrap();
        assert_eq!(placement.len(), topo.nodes().len());
        assert!(placement.entries().iter().all(|(_, s)| s == "localhost"));
    }

    #[test]
    fn test_default_placer_without_localhost_entry() {
        let topo = crate::topology::linear(2).unwrap();
        let placement =
            compute_placement(PlacerKind::Default, &registry(&["a", "b"]), &topo).unwrap();
        assert_eq!(placement.len(), topo.nodes().len());
        assert!(placement.entries().iter().all(|(_, s)| s == "localhost"));
        assert_eq!(
            placement.report(&["a".to_string(), "b".to_string()]),
            "a: \nb: \nlocalhost: c0 h1 s1 h2 s2"
        );
    }

    #[test]
    fn test_preset_server_wins() {
        let mut topo = crate::topology::linear(2).unwrap();
        topo.node_mut("h2").unwrap().config.server = Some("b".to_string());
        let placement =
            compute_placement(PlacerKind::Default, &registry(&["localhost", "b"]), &topo)
                .unwrap();
        assert_eq!(placement.server_of("h2"), Some("b"));
        assert_eq!(placement.server_of("h1"), Some("localhost"));
    }

    #[test]
    fn test_preset_unknown_server_rejected() {
        let mut topo = crate::topology::linear(1).unwrap();
        topo.node_mut("h1").unwrap().config.server = Some("zz".to_string());
        let result = compute_placement(PlacerKind::Default, &registry(&["localhost"]), &topo);
        assert!(matches!(result, Err(Error::UnknownServer { .. })));
    }

    #[test]
    fn test_report_groups_by_server() {
        let mut placement = Placement::new();
        placement.insert("h1", "a");
        placement.insert("s1", "a");
        placement.insert("h2", "b");
        let servers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(placement.report(&servers), "a: h1 s1\nb: h2\nc: ");
    }
}
