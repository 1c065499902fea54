pub mod config;
pub mod place;
pub mod precheck;
pub mod up;

use anyhow::{anyhow, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use netcluster::config::ClusterConfig;
use netcluster::placement::PlacerKind;
use netcluster::topology::{linear, tree, Topology};

/// Loads the configuration from `--config` or the default location.
pub fn load_config(path: Option<&Path>) -> Result<ClusterConfig> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow!(
                    "Configuration file not found: {}\n\nCreate one with: netcluster --config {} config init",
                    path.display(),
                    path.display()
                ));
            }
            ClusterConfig::load_from(path)?
        }
        None => ClusterConfig::load()?,
    };
    Ok(config)
}

pub fn config_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => ClusterConfig::default_path()
            .ok_or_else(|| anyhow!("Could not determine the configuration directory")),
    }
}

/// `DEPTH,FANOUT` for the tree generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    pub depth: usize,
    pub fanout: usize,
}

impl FromStr for TreeShape {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (depth, fanout) = s
            .split_once(',')
            .ok_or_else(|| format!("expected DEPTH,FANOUT, got '{}'", s))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid number '{}': {}", v, e))
        };
        Ok(TreeShape {
            depth: parse(depth)?,
            fanout: parse(fanout)?,
        })
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct TopologySource {
    /// YAML topology file
    #[arg(long, value_name = "FILE")]
    pub topology: Option<PathBuf>,

    /// Tree topology of the given depth and fanout
    #[arg(long, value_name = "D,F")]
    pub tree: Option<TreeShape>,

    /// Chain of K switches with one host each
    #[arg(long, value_name = "K")]
    pub linear: Option<usize>,
}

impl TopologySource {
    pub fn build(&self) -> Result<Topology> {
        let topo = if let Some(path) = &self.topology {
            Topology::load(path)?
        } else if let Some(shape) = self.tree {
            tree(shape.depth, shape.fanout)?
        } else if let Some(k) = self.linear {
            linear(k)?
        } else {
            return Err(anyhow!("One of --topology, --tree or --linear is required"));
        };
        Ok(topo)
    }
}

#[derive(Args, Debug)]
pub struct TopologyArgs {
    #[command(flatten)]
    pub source: TopologySource,

    /// Placement strategy, overriding the configuration
    #[arg(long, value_name = "KIND")]
    pub placer: Option<PlacerKind>,
}

impl TopologyArgs {
    pub fn apply(&self, config: &mut ClusterConfig) {
        if let Some(kind) = self.placer {
            config.placement = kind;
        }
    }
}
