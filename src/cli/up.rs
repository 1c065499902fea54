use anyhow::Result;
use clap::Args;
use log::{info, warn};
use std::io::BufRead;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netcluster::cluster::ClusterOrchestrator;
use netcluster::engine::RootNamespaceEngine;
use netcluster::link::LinkStatus;
use netcluster::remote::{
    clear_interrupt, install_interrupt_handler, interrupted, CancellationToken, ConnectionCache,
    ProcessStatus, SshExecutor,
};
use netcluster::server::ServerRegistry;

use super::{load_config, TopologyArgs};

#[derive(Args)]
#[command(about = "Build the cluster, wait for Enter or Ctrl-C, then tear it down")]
pub struct UpCommand {
    #[command(flatten)]
    pub topology: TopologyArgs,

    /// Skip the server reachability check
    #[arg(long)]
    pub no_precheck: bool,
}

impl UpCommand {
    pub fn execute(&self, path: Option<&Path>) -> Result<()> {
        let mut config = load_config(path)?;
        self.topology.apply(&mut config);
        if self.no_precheck {
            config.precheck = false;
        }
        let topo = self.topology.source.build()?;

        install_interrupt_handler()?;
        let registry = ServerRegistry::from_config(&config)?;
        let connections = Arc::new(ConnectionCache::new());
        let executor = SshExecutor::new(connections.clone(), CancellationToken::follow_interrupts());
        let mut cluster = ClusterOrchestrator::new(
            config,
            registry,
            Arc::new(executor),
            Box::new(RootNamespaceEngine::new()),
        )
        .with_connections(connections);

        cluster.start(topo)?;

        println!("Placement:");
        for line in cluster.placement_report().lines() {
            println!("  {}", line);
        }
        println!();
        println!("Links:");
        for (link, status) in cluster.status() {
            println!("  {}: {}", link, status);
        }
        println!();
        println!("Cluster is up. Press Enter or Ctrl-C to tear it down.");

        wait_for_exit();
        if interrupted() {
            info!("Interrupted");
        }
        clear_interrupt();

        let dead: Vec<String> = cluster
            .status()
            .into_iter()
            .filter(|(_, status)| {
                matches!(
                    status,
                    LinkStatus::Tunnel {
                        status: ProcessStatus::Exited(_),
                        ..
                    }
                )
            })
            .map(|(link, status)| format!("{}: {}", link, status))
            .collect();
        for line in &dead {
            warn!("{}", line);
        }

        cluster.stop()?;
        println!("Cluster stopped.");
        Ok(())
    }
}

fn wait_for_exit() {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        let _ = tx.send(());
    });
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) if interrupted() => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }
}
