use log::warn;
use std::collections::HashMap;

use super::{PlacementInput, Placer};
use crate::error::Result;
use crate::topology::NodeRole;

/// Cursor over the server list for one role.
#[derive(Debug, Clone, Copy)]
struct Bin {
    size: usize,
    server: usize,
    filled: usize,
}

/// Bins hosts, switches and controllers independently into equal-size
/// buckets by arrival order. Links may end up crossing servers.
#[derive(Debug)]
pub struct HostSwitchBinPlacer {
    servers: Vec<String>,
    roles: HashMap<String, NodeRole>,
    bins: HashMap<NodeRole, Bin>,
}

impl HostSwitchBinPlacer {
    pub fn new(input: &PlacementInput) -> Result<Self> {
        input.require_servers()?;
        let count = input.servers.len();
        let bins = [NodeRole::Host, NodeRole::Switch, NodeRole::Controller]
            .into_iter()
            .map(|role| {
                let size = (input.with_role(role).len() / count).max(1);
                (
                    role,
                    Bin {
                        size,
                        server: 0,
                        filled: 0,
                    },
                )
            })
            .collect();
        Ok(Self {
            servers: input.servers.clone(),
            roles: input.nodes.iter().cloned().collect(),
            bins,
        })
    }
}

impl Placer for HostSwitchBinPlacer {
    fn place(&mut self, node: &str) -> Result<Option<String>> {
        let bin = match self.roles.get(node).and_then(|role| self.bins.get_mut(role)) {
            Some(bin) => bin,
            None => {
                warn!(
                    "{} is not a known host, switch or controller; placing it on {}",
                    node, self.servers[0]
                );
                return Ok(Some(self.servers[0].clone()));
            }
        };
        let server = self.servers[bin.server].clone();
        bin.filled += 1;
        if bin.filled >= bin.size {
            bin.filled = 0;
            bin.server = (bin.server + 1) % self.servers.len();
        }
        Ok(Some(server))
    }
}
