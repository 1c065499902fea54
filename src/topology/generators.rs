use super::Topology;
use crate::error::{Error, Result};

/// Name of the controller every generated topology carries.
const CONTROLLER: &str = "c0";

/// `k` switches in a chain, one host hanging off each switch.
pub fn linear(k: usize) -> Result<Topology> {
    if k == 0 {
        return Err(Error::Topology(
            "A linear topology needs at least one switch".to_string(),
        ));
    }
    let mut topo = Topology::new();
    topo.add_controller(CONTROLLER)?;
    let mut last_switch: Option<String> = None;
    for i in 1..=k {
        let host = format!("h{}", i);
        let switch = format!("s{}", i);
        topo.add_host(&host)?;
        topo.add_switch(&switch)?;
        topo.add_link(&host, &switch)?;
        if let Some(prev) = &last_switch {
            topo.add_link(&switch, prev)?;
        }
        last_switch = Some(switch);
    }
    Ok(topo)
}

/// A full tree of switches of the given depth and fanout with hosts at
/// the leaves. Depth 0 is a single host.
pub fn tree(depth: usize, fanout: usize) -> Result<Topology> {
    if fanout == 0 {
        return Err(Error::Topology("Tree fanout must be at least 1".to_string()));
    }
    let mut topo = Topology::new();
    topo.add_controller(CONTROLLER)?;
    let mut counters = (1usize, 1usize);
    add_subtree(&mut topo, depth, fanout, &mut counters)?;
    Ok(topo)
}

fn add_subtree(
    topo: &mut Topology,
    depth: usize,
    fanout: usize,
    counters: &mut (usize, usize),
) -> Result<String> {
    if depth == 0 {
        let host = format!("h{}", counters.0);
        counters.0 += 1;
        topo.add_host(&host)?;
        return Ok(host);
    }
    let switch = format!("s{}", counters.1);
    counters.1 += 1;
    topo.add_switch(&switch)?;
    for _ in 0..fanout {
        let child = add_subtree(topo, depth - 1, fanout, counters)?;
        topo.add_link(&switch, &child)?;
    }
    Ok(switch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear() {
        let topo = linear(3).unwrap();
        assert_eq!(topo.hosts(), vec!["h1", "h2", "h3"]);
        assert_eq!(topo.switches(), vec!["s1", "s2", "s3"]);
        assert_eq!(topo.controllers(), vec!["c0"]);
        // three host links plus two switch-switch links
        assert_eq!(topo.links().len(), 5);
        assert!(linear(0).is_err());
    }

    #[test]
    fn test_tree_sizes() {
        let topo = tree(2, 3).unwrap();
        assert_eq!(topo.switches().len(), 1 + 3);
        assert_eq!(topo.hosts().len(), 9);
        assert_eq!(topo.links().len(), 3 + 9);
        assert_eq!(topo.switches()[0], "s1");
        // children are wired before their parent link
        assert_eq!(topo.links()[0].node1, "s2");
        assert_eq!(topo.links()[0].node2, "h1");
        assert_eq!(topo.links()[3].node1, "s1");
        assert_eq!(topo.links()[3].node2, "s2");
    }

    #[test]
    fn test_tree_depth_zero_is_single_host() {
        let topo = tree(0, 2).unwrap();
        assert_eq!(topo.hosts(), vec!["h1"]);
        assert!(topo.switches().is_empty());
    }
}
