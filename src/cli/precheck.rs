use anyhow::{anyhow, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;

use netcluster::error::ClusterError;
use netcluster::remote::{diagnose_ssh_error, precheck, CancellationToken, ConnectionCache, SshExecutor};
use netcluster::server::ServerRegistry;

use super::load_config;

#[derive(Args)]
#[command(about = "Check that every configured server accepts ssh and sudo")]
pub struct PrecheckCommand {}

impl PrecheckCommand {
    pub fn execute(&self, path: Option<&Path>) -> Result<()> {
        let config = load_config(path)?;
        let registry = ServerRegistry::from_config(&config)?;
        let executor = SshExecutor::new(Arc::new(ConnectionCache::new()), CancellationToken::new());

        let remote = registry.remote().count();
        if remote == 0 {
            println!("No remote servers configured; nothing to check.");
            return Ok(());
        }

        match precheck(&executor, &registry) {
            Ok(()) => {
                println!("All {} remote server(s) are reachable.", remote);
                Ok(())
            }
            Err(ClusterError::PrecheckFailed { failures }) => {
                println!("{} of {} server(s) failed:", failures.len(), remote);
                for failure in &failures {
                    println!();
                    println!("  ✗ {}", failure.server);
                    println!("    Command: {}", failure.command);
                    if !failure.stderr.trim().is_empty() {
                        println!("    Error: {}", failure.stderr.trim());
                    }
                    if let Ok(server) = registry.get(&failure.server) {
                        for hint in diagnose_ssh_error(&failure.stderr, server) {
                            println!("    {}", hint);
                        }
                    }
                }
                Err(anyhow!("Precheck failed for {} server(s)", failures.len()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
