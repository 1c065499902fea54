use log::debug;
use std::collections::HashMap;

use super::{PlacementInput, Placer};
use crate::error::{Error, Result};
use crate::topology::NodeRole;

/// Bins switches evenly across servers, then controllers the same way, and
/// co-locates every host with the switch it is linked to.
///
/// The whole placement is computed at construction, since the host
/// co-location step needs to see every link first.
#[derive(Debug)]
pub struct SwitchBinPlacer {
    placement: HashMap<String, String>,
}

impl SwitchBinPlacer {
    pub fn new(input: &PlacementInput) -> Result<Self> {
        input.require_servers()?;

        let mut placement: HashMap<String, String> =
            bin(&input.with_role(NodeRole::Switch), &input.servers)
                .into_iter()
                .collect();
        placement.extend(bin(&input.with_role(NodeRole::Controller), &input.servers));

        // Last switch link listed wins.
        let mut switch_for: HashMap<&str, &str> = HashMap::new();
        for (a, b) in &input.links {
            match (input.role(a), input.role(b)) {
                (Some(NodeRole::Host), Some(NodeRole::Switch)) => {
                    switch_for.insert(a, b);
                }
                (Some(NodeRole::Switch), Some(NodeRole::Host)) => {
                    switch_for.insert(b, a);
                }
                _ => {}
            }
        }

        for host in input.with_role(NodeRole::Host) {
            if placement.contains_key(&host) {
                continue;
            }
            let server = switch_for
                .get(host.as_str())
                .and_then(|switch| placement.get(*switch))
                .cloned()
                .ok_or_else(|| Error::IsolatedHost { host: host.clone() })?;
            debug!("Co-locating {} on {}", host, server);
            placement.insert(host, server);
        }

        Ok(Self { placement })
    }

    pub fn placement(&self) -> &HashMap<String, String> {
        &self.placement
    }
}

impl Placer for SwitchBinPlacer {
    fn place(&mut self, node: &str) -> Result<Option<String>> {
        self.placement
            .get(node)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::UnplacedNode {
                node: node.to_string(),
            })
    }
}

/// Zips `nodes` against a ticket list in which every server appears
/// `floor(len / servers)` times, the first `len % servers` servers once more.
fn bin(nodes: &[String], servers: &[String]) -> Vec<(String, String)> {
    let base = nodes.len() / servers.len();
    let remainder = nodes.len() % servers.len();
    let tickets = servers
        .iter()
        .enumerate()
        .flat_map(|(i, server)| {
            let size = if i < remainder { base + 1 } else { base };
            std::iter::repeat(server.clone()).take(size)
        });
    nodes.iter().cloned().zip(tickets).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::PlacementInput;
    use crate::topology::{tree, Topology};

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bin_sizes() {
        let nodes: Vec<String> = (1..=7).map(|i| format!("s{}", i)).collect();
        let binned = bin(&nodes, &servers(&["a", "b", "c"]));
        let on = |s: &str| binned.iter().filter(|(_, server)| server == s).count();
        assert_eq!((on("a"), on("b"), on("c")), (3, 2, 2));
        assert_eq!(binned[0], ("s1".to_string(), "a".to_string()));
        assert_eq!(binned[6], ("s7".to_string(), "c".to_string()));
    }

    #[test]
    fn test_bins_differ_by_at_most_one() {
        for depth in 1..4 {
            for fanout in 1..4 {
                for n in 1..5 {
                    let mut topo = tree(depth, fanout).unwrap();
                    topo.add_controller("c1").unwrap();
                    topo.add_controller("c2").unwrap();
                    let names: Vec<String> = (0..n).map(|i| format!("srv{}", i)).collect();
                    let input = PlacementInput::from_topology(names.clone(), &topo);
                    let placer = SwitchBinPlacer::new(&input).unwrap();
                    assert_eq!(placer.placement().len(), topo.nodes().len());

                    for group in [topo.switches(), topo.controllers()] {
                        let sizes: Vec<usize> = names
                            .iter()
                            .map(|server| {
                                group
                                    .iter()
                                    .filter(|n| placer.placement()[*n] == *server)
                                    .count()
                            })
                            .collect();
                        let max = sizes.iter().max().unwrap();
                        let min = sizes.iter().min().unwrap();
                        assert!(max - min <= 1, "uneven bins {:?}", sizes);
                    }
                }
            }
        }
    }

    #[test]
    fn test_switches_and_controllers_binned_separately() {
        let mut topo = Topology::new();
        topo.add_controller("c0").unwrap();
        topo.add_switch("s1").unwrap();
        topo.add_switch("s2").unwrap();
        let input = PlacementInput::from_topology(servers(&["a", "b"]), &topo);
        let placer = SwitchBinPlacer::new(&input).unwrap();
        assert_eq!(placer.placement()["s1"], "a");
        assert_eq!(placer.placement()["s2"], "b");
        assert_eq!(placer.placement()["c0"], "a");
    }

    #[test]
    fn test_host_follows_last_listed_switch() {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        topo.add_switch("s2").unwrap();
        topo.add_host("h1").unwrap();
        topo.add_link("h1", "s1").unwrap();
        topo.add_link("s2", "h1").unwrap();

        let input = PlacementInput::from_topology(servers(&["a", "b"]), &topo);
        let mut placer = SwitchBinPlacer::new(&input).unwrap();
        assert_eq!(placer.place("s1").unwrap().as_deref(), Some("a"));
        assert_eq!(placer.place("s2").unwrap().as_deref(), Some("b"));
        assert_eq!(placer.place("h1").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_isolated_host_is_fatal() {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        topo.add_host("h1").unwrap();
        topo.add_host("h2").unwrap();
        topo.add_link("h1", "s1").unwrap();
        topo.add_link("h1", "h2").unwrap();

        let input = PlacementInput::from_topology(servers(&["a"]), &topo);
        match SwitchBinPlacer::new(&input) {
            Err(Error::IsolatedHost { host }) => assert_eq!(host, "h2"),
            other => panic!("expected IsolatedHost, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_of_unknown_node_is_an_error() {
        let topo = tree(1, 2).unwrap();
        let input = PlacementInput::from_topology(servers(&["a"]), &topo);
        let mut placer = SwitchBinPlacer::new(&input).unwrap();
        assert!(matches!(
            placer.place("h99"),
            Err(Error::UnplacedNode { .. })
        ));
    }
}
