//! Virtual network topologies.
//!
//! A topology is an ordered list of named nodes, each tagged with its role,
//! plus an ordered list of undirected links. The role is fixed when a node
//! is added and is never inferred later from name sets.

mod generators;

pub use generators::{linear, tree};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

/// What a virtual node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Host,
    Switch,
    Controller,
}

/// Per-node configuration. Placement fills in the server fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Pre-set or placed server name
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default, skip_serializing)]
    pub server_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing)]
    pub control_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNode {
    name: String,
    role: NodeRole,
    pub config: NodeConfig,
}

impl VirtualNode {
    pub fn new(name: &str, role: NodeRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            config: NodeConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }
}

/// An undirected link between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub node1: String,
    pub node2: String,
    /// Interface name on `node1`; derived from the port number if absent
    #[serde(default)]
    pub intf1: Option<String>,
    #[serde(default)]
    pub intf2: Option<String>,
    /// Hardware address for `intf1`
    #[serde(default)]
    pub addr1: Option<String>,
    #[serde(default)]
    pub addr2: Option<String>,
}

impl LinkSpec {
    pub fn new(node1: &str, node2: &str) -> Self {
        Self {
            node1: node1.to_string(),
            node2: node2.to_string(),
            intf1: None,
            intf2: None,
            addr1: None,
            addr2: None,
        }
    }
}

/// A link with both interface names settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLink {
    pub node1: String,
    pub intf1: String,
    pub addr1: Option<String>,
    pub node2: String,
    pub intf2: String,
    pub addr2: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: Vec<VirtualNode>,
    index: HashMap<String, usize>,
    links: Vec<LinkSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str, role: NodeRole) -> Result<&mut VirtualNode> {
        if name.is_empty() {
            return Err(Error::Topology("Node names must not be empty".to_string()));
        }
        if self.index.contains_key(name) {
            return Err(Error::Topology(format!("Duplicate node name '{}'", name)));
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(VirtualNode::new(name, role));
        let last = self.nodes.len() - 1;
        Ok(&mut self.nodes[last])
    }

    pub fn add_host(&mut self, name: &str) -> Result<()> {
        self.add_node(name, NodeRole::Host).map(|_| ())
    }

    pub fn add_switch(&mut self, name: &str) -> Result<()> {
        self.add_node(name, NodeRole::Switch).map(|_| ())
    }

    pub fn add_controller(&mut self, name: &str) -> Result<()> {
        self.add_node(name, NodeRole::Controller).map(|_| ())
    }

    pub fn add_link(&mut self, node1: &str, node2: &str) -> Result<()> {
        self.add_link_spec(LinkSpec::new(node1, node2))
    }

    pub fn add_link_spec(&mut self, link: LinkSpec) -> Result<()> {
        for end in [&link.node1, &link.node2] {
            if !self.index.contains_key(end.as_str()) {
                return Err(Error::Topology(format!(
                    "Link {} <-> {} refers to unknown node '{}'",
                    link.node1, link.node2, end
                )));
            }
        }
        if link.node1 == link.node2 {
            return Err(Error::Topology(format!(
                "Link from {} to itself is not allowed",
                link.node1
            )));
        }
        self.links.push(link);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&VirtualNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut VirtualNode> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    pub fn role_of(&self, name: &str) -> Option<NodeRole> {
        self.node(name).map(|n| n.role())
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[VirtualNode] {
        &self.nodes
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    fn names_with_role(&self, role: NodeRole) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.role() == role)
            .map(|n| n.name().to_string())
            .collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.names_with_role(NodeRole::Host)
    }

    pub fn switches(&self) -> Vec<String> {
        self.names_with_role(NodeRole::Switch)
    }

    pub fn controllers(&self) -> Vec<String> {
        self.names_with_role(NodeRole::Controller)
    }

    pub fn links(&self) -> &[LinkSpec] {
        &self.links
    }

    /// Settles interface names for every link.
    ///
    /// Unnamed interfaces are called `<node>-eth<port>`; host ports count
    /// from 0 and switch ports from 1.
    pub fn resolved_links(&self) -> Vec<ResolvedLink> {
        let mut next_port: HashMap<String, u32> = HashMap::new();
        let mut take_port = |node: &str, role: Option<NodeRole>| -> String {
            let first = match role {
                Some(NodeRole::Switch) => 1,
                _ => 0,
            };
            let port = next_port.entry(node.to_string()).or_insert(first);
            let name = format!("{}-eth{}", node, port);
            *port += 1;
            name
        };

        self.links
            .iter()
            .map(|link| {
                let intf1 = match &link.intf1 {
                    Some(name) => name.clone(),
                    None => take_port(&link.node1, self.role_of(&link.node1)),
                };
                let intf2 = match &link.intf2 {
                    Some(name) => name.clone(),
                    None => take_port(&link.node2, self.role_of(&link.node2)),
                };
                ResolvedLink {
                    node1: link.node1.clone(),
                    intf1,
                    addr1: link.addr1.clone(),
                    node2: link.node2.clone(),
                    intf2,
                    addr2: link.addr2.clone(),
                }
            })
            .collect()
    }

    /// Parses the YAML topology format used by the command line.
    ///
    /// ```yaml
    /// controllers: [c0]
    /// switches: [s1]
    /// hosts:
    ///   - h1
    ///   - { name: h2, server: ubuntu2 }
    /// links:
    ///   - { node1: h1, node2: s1 }
    ///   - { node1: h2, node2: s1, intf1: h2-eth0, addr1: "00:00:00:00:00:02" }
    /// ```
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let file: TopologyFile = serde_yaml::from_str(contents)
            .map_err(|e| Error::Topology(format!("Failed to parse topology: {}", e)))?;

        let mut topo = Topology::new();
        let groups = [
            (NodeRole::Controller, file.controllers),
            (NodeRole::Switch, file.switches),
            (NodeRole::Host, file.hosts),
        ];
        for (role, entries) in groups {
            for entry in entries {
                let (name, server) = entry.into_parts();
                let node = topo.add_node(&name, role)?;
                node.config.server = server;
            }
        }
        for link in file.links {
            topo.add_link_spec(link)?;
        }
        Ok(topo)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read topology file {}: {}", path.display(), e),
            ))
        })?;
        Self::from_yaml_str(&contents)
    }
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    controllers: Vec<NodeEntry>,
    #[serde(default)]
    switches: Vec<NodeEntry>,
    #[serde(default)]
    hosts: Vec<NodeEntry>,
    #[serde(default)]
    links: Vec<LinkSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        server: Option<String>,
    },
}

impl NodeEntry {
    fn into_parts(self) -> (String, Option<String>) {
        match self {
            NodeEntry::Name(name) => (name, None),
            NodeEntry::Detailed { name, server } => (name, server),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_partition_in_order() {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        topo.add_host("h1").unwrap();
        topo.add_controller("c0").unwrap();
        topo.add_host("h2").unwrap();

        assert_eq!(topo.hosts(), vec!["h1", "h2"]);
        assert_eq!(topo.switches(), vec!["s1"]);
        assert_eq!(topo.controllers(), vec!["c0"]);
        assert_eq!(topo.role_of("c0"), Some(NodeRole::Controller));
        assert_eq!(topo.role_of("h9"), None);
    }

    #[test]
    fn test_duplicate_and_dangling_rejected() {
        let mut topo = Topology::new();
        topo.add_host("h1").unwrap();
        assert!(topo.add_switch("h1").is_err());
        assert!(topo.add_link("h1", "s9").is_err());
        assert!(topo.add_link("h1", "h1").is_err());
        assert!(topo.links().is_empty());
    }

    #[test]
    fn test_resolved_interface_names() {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        topo.add_host("h1").unwrap();
        topo.add_host("h2").unwrap();
        topo.add_link("h1", "s1").unwrap();
        topo.add_link("h2", "s1").unwrap();

        let links = topo.resolved_links();
        assert_eq!(links[0].intf1, "h1-eth0");
        assert_eq!(links[0].intf2, "s1-eth1");
        assert_eq!(links[1].intf1, "h2-eth0");
        assert_eq!(links[1].intf2, "s1-eth2");
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
controllers: [c0]
switches: [s1]
hosts:
  - h1
  - { name: h2, server: ubuntu2 }
links:
  - { node1: h1, node2: s1 }
  - { node1: h2, node2: s1, intf1: left, addr1: "00:00:00:00:00:02" }
"#;
        let topo = Topology::from_yaml_str(yaml).unwrap();
        assert_eq!(topo.node_names(), vec!["c0", "s1", "h1", "h2"]);
        assert_eq!(
            topo.node("h2").unwrap().config.server.as_deref(),
            Some("ubuntu2")
        );
        let links = topo.resolved_links();
        assert_eq!(links[1].intf1, "left");
        assert_eq!(links[1].addr1.as_deref(), Some("00:00:00:00:00:02"));
    }

    #[test]
    fn test_from_yaml_rejects_unknown_link_end() {
        let yaml = "hosts: [h1]\nlinks:\n  - { node1: h1, node2: s1 }\n";
        assert!(matches!(
            Topology::from_yaml_str(yaml),
            Err(Error::Topology(_))
        ));
    }
}
