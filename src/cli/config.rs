//! CLI command for managing the cluster configuration.

use anyhow::Result;
use clap::{Args, Subcommand};
use std::net::Ipv4Addr;
use std::path::Path;

use netcluster::config::{ClusterConfig, ServerConfig};
use netcluster::server::{find_server_ip, LOCALHOST};

use super::{config_path, load_config};

#[derive(Args)]
#[command(about = "Manage the cluster configuration")]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Initialize a new configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Add a server, or update its address if it is already listed
    AddServer {
        /// Hostname, IP address or "localhost"
        name: String,

        /// Address to use instead of resolving the name
        #[arg(long)]
        ip: Option<Ipv4Addr>,
    },

    /// Remove a server from the cluster
    RemoveServer {
        /// Name of the server to remove
        name: String,
    },
}

impl ConfigCommand {
    pub fn execute(&self, path: Option<&Path>) -> Result<()> {
        match &self.action {
            ConfigAction::Show => self.show_config(path),
            ConfigAction::Path => self.show_path(path),
            ConfigAction::Init { force } => self.init_config(path, *force),
            ConfigAction::AddServer { name, ip } => self.add_server(path, name, *ip),
            ConfigAction::RemoveServer { name } => self.remove_server(path, name),
        }
    }

    fn show_config(&self, path: Option<&Path>) -> Result<()> {
        let config = load_config(path)?;

        if config.is_local_only() {
            println!("Only localhost is configured; the cluster runs on this machine.");
            println!();
            println!("To add servers, run:");
            println!("  netcluster config add-server <name> [--ip <address>]");
            println!();
        }

        let yaml = serde_yaml::to_string(&config)?;
        println!("{}", yaml);

        Ok(())
    }

    fn show_path(&self, path: Option<&Path>) -> Result<()> {
        let path = config_path(path)?;
        println!("Configuration file path: {}", path.display());
        if path.exists() {
            println!("Status: File exists");
        } else {
            println!("Status: File does not exist");
        }
        Ok(())
    }

    fn init_config(&self, path: Option<&Path>, force: bool) -> Result<()> {
        let path = config_path(path)?;

        if path.exists() && !force {
            println!("Configuration file already exists at: {}", path.display());
            println!("Use --force to overwrite");
            return Ok(());
        }

        ClusterConfig::default().save_to(&path)?;

        println!("Created configuration file at: {}", path.display());
        println!();
        println!("Add the servers taking part in the cluster:");
        println!("  netcluster config add-server server2.example.com");
        println!("  netcluster config add-server ubuntu2 --ip 192.168.94.129");

        Ok(())
    }

    fn add_server(&self, path: Option<&Path>, name: &str, ip: Option<Ipv4Addr>) -> Result<()> {
        let target = config_path(path)?;
        let mut config = ClusterConfig::load_from(&target)?;

        if config.servers.iter().any(|s| s.name == name) {
            println!("Warning: Server '{}' already exists, updating...", name);
        }

        if ip.is_none() && name != LOCALHOST && find_server_ip(name).is_none() {
            println!(
                "Warning: '{}' does not resolve to an IPv4 address; pass --ip or fix name resolution before starting",
                name
            );
        }

        let mut server = ServerConfig::new(name);
        if let Some(ip) = ip {
            server = server.with_ip(ip);
        }
        config.set_server(server);
        config.save_to(&target)?;

        println!("Added server '{}'", name);
        println!("Configuration saved to: {}", target.display());

        Ok(())
    }

    fn remove_server(&self, path: Option<&Path>, name: &str) -> Result<()> {
        let target = config_path(path)?;
        let mut config = ClusterConfig::load_from(&target)?;

        if config.remove_server(name).is_none() {
            println!("Server '{}' not found", name);
            return Ok(());
        }
        config.validate()?;
        config.save_to(&target)?;
        println!("Removed server '{}'", name);

        Ok(())
    }
}
