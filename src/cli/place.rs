use anyhow::Result;
use clap::Args;
use std::path::Path;
use std::sync::Arc;

use netcluster::cluster::ClusterOrchestrator;
use netcluster::engine::RootNamespaceEngine;
use netcluster::remote::{CancellationToken, ConnectionCache, SshExecutor};
use netcluster::server::ServerRegistry;

use super::{load_config, TopologyArgs};

#[derive(Args)]
#[command(about = "Show where each node would run and how each link would be built")]
pub struct PlaceCommand {
    #[command(flatten)]
    pub topology: TopologyArgs,
}

impl PlaceCommand {
    pub fn execute(&self, path: Option<&Path>) -> Result<()> {
        let mut config = load_config(path)?;
        self.topology.apply(&mut config);
        let mut topo = self.topology.source.build()?;

        let registry = ServerRegistry::from_config(&config)?;
        let executor = SshExecutor::new(Arc::new(ConnectionCache::new()), CancellationToken::new());
        let placer = config.placement;
        let mut cluster = ClusterOrchestrator::new(
            config,
            registry,
            Arc::new(executor),
            Box::new(RootNamespaceEngine::new()),
        );

        cluster.place(&mut topo)?;
        println!("Placement ({}):", placer);
        for line in cluster.placement_report().lines() {
            println!("  {}", line);
        }

        let plan = cluster.plan(&topo)?;
        println!();
        println!("Links ({}):", plan.len());
        for (link, kind) in &plan {
            println!("  {}: {}", link, kind);
        }

        Ok(())
    }
}
