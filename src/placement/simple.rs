use rand::seq::SliceRandom;

use super::{PlacementInput, Placer};
use crate::error::{Error, Result};

/// Leaves every node on the local server.
#[derive(Debug, Default)]
pub struct DefaultPlacer;

impl Placer for DefaultPlacer {
    fn place(&mut self, _node: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Uniformly random server per call. Only useful for load-insensitive tests.
#[derive(Debug)]
pub struct RandomPlacer {
    servers: Vec<String>,
}

impl RandomPlacer {
    pub fn new(input: &PlacementInput) -> Result<Self> {
        input.require_servers()?;
        Ok(Self {
            servers: input.servers.clone(),
        })
    }
}

impl Placer for RandomPlacer {
    fn place(&mut self, _node: &str) -> Result<Option<String>> {
        let server = self
            .servers
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::Config("Placement needs at least one server".to_string()))?;
        Ok(Some(server.clone()))
    }
}

/// Cycles through the server list, one node per call, ignoring topology.
#[derive(Debug)]
pub struct RoundRobinPlacer {
    servers: Vec<String>,
    next: usize,
}

impl RoundRobinPlacer {
    pub fn new(input: &PlacementInput) -> Result<Self> {
        input.require_servers()?;
        Ok(Self {
            servers: input.servers.clone(),
            next: 0,
        })
    }
}

impl Placer for RoundRobinPlacer {
    fn place(&mut self, _node: &str) -> Result<Option<String>> {
        let server = self.servers[self.next].clone();
        self.next = (self.next + 1) % self.servers.len();
        Ok(Some(server))
    }
}
