//! Physical server identities.
//!
//! Servers are resolved once when the cluster starts and are immutable for
//! the rest of the run. `localhost` is a sentinel meaning "this machine,
//! no SSH".

use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};

/// Name of the sentinel server that stands for this machine.
pub const LOCALHOST: &str = "localhost";

/// A physical server taking part in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Server {
    name: String,
    ip: Ipv4Addr,
    user: String,
    control_path: Option<String>,
}

impl Server {
    pub fn new(name: &str, ip: Ipv4Addr, user: &str) -> Self {
        Self {
            name: normalize_server_name(Some(name)),
            ip,
            user: user.to_string(),
            control_path: None,
        }
    }

    /// The sentinel server for this machine.
    pub fn localhost(user: &str) -> Self {
        Self::new(LOCALHOST, Ipv4Addr::LOCALHOST, user)
    }

    /// Builder method to enable a shared ssh connection with this pattern.
    pub fn with_control_path(mut self, pattern: Option<String>) -> Self {
        self.control_path = pattern;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn control_path(&self) -> Option<&str> {
        self.control_path.as_deref()
    }

    pub fn is_local(&self) -> bool {
        self.name == LOCALHOST
    }

    /// The ssh destination (`user@ip`).
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.ip)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Maps a missing or empty server name to the `localhost` sentinel.
pub fn normalize_server_name(name: Option<&str>) -> String {
    match name {
        Some(n) if !n.trim().is_empty() => n.trim().to_string(),
        _ => LOCALHOST.to_string(),
    }
}

/// Returns the IPv4 address of a server.
///
/// An address literal embedded in the name wins; otherwise the name is
/// resolved and the first IPv4 result is used.
pub fn find_server_ip(server: &str) -> Option<Ipv4Addr> {
    if server == LOCALHOST {
        return Some(Ipv4Addr::LOCALHOST);
    }

    let literal = server
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find_map(|token| token.parse::<Ipv4Addr>().ok());
    if literal.is_some() {
        return literal;
    }

    match (server, 22).to_socket_addrs() {
        Ok(addrs) => addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .next(),
        Err(e) => {
            debug!("Failed to resolve {}: {}", server, e);
            None
        }
    }
}

/// Tries to return the logged-in (usually non-root) user.
pub fn find_user() -> String {
    if let Ok(user) = std::env::var("SUDO_USER") {
        if !user.is_empty() {
            return user;
        }
    }
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
        return user.name;
    }
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

/// The ordered, resolved server list of one cluster run.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    servers: Vec<Server>,
    by_name: HashMap<String, usize>,
    user: String,
    local: Server,
}

impl ServerRegistry {
    /// Resolves every configured server once.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        let user = config.user.clone().unwrap_or_else(find_user);
        let pattern = config.control_path.pattern();

        let mut servers = Vec::with_capacity(config.servers.len());
        for entry in &config.servers {
            let name = normalize_server_name(Some(&entry.name));
            let ip = match entry.ip.or_else(|| find_server_ip(&name)) {
                Some(ip) => ip,
                None => {
                    return Err(Error::Config(format!(
                        "Could not resolve an IPv4 address for server '{}'\n\n\
                         Suggestions:\n\
                         • Check the name resolves: getent ahostsv4 {}\n\
                         • Or set `ip:` for this server in the configuration",
                        name, name
                    )))
                }
            };
            let server = Server::new(&name, ip, &user);
            let server = if server.is_local() {
                server
            } else {
                server.with_control_path(pattern.clone())
            };
            debug!("Server {} resolved to {}", name, ip);
            servers.push(server);
        }

        Ok(Self::from_servers(servers, user))
    }

    /// Builds a registry from already-resolved servers.
    pub fn from_servers(servers: Vec<Server>, user: String) -> Self {
        let by_name = servers
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_string(), i))
            .collect();
        let local = servers
            .iter()
            .find(|s| s.name() == LOCALHOST)
            .cloned()
            .unwrap_or_else(|| Server::localhost(&user));
        Self {
            servers,
            by_name,
            user,
            local,
        }
    }

    pub fn get(&self, name: &str) -> Result<&Server> {
        self.by_name
            .get(name)
            .map(|&i| &self.servers[i])
            .ok_or_else(|| Error::UnknownServer {
                server: name.to_string(),
            })
    }

    /// The server a node lands on when placement leaves it unassigned.
    pub fn local(&self) -> &Server {
        &self.local
    }

    /// Like `get`, but `localhost` always resolves, listed or not.
    pub fn resolve(&self, name: &str) -> Result<&Server> {
        if name == LOCALHOST {
            return Ok(self.local());
        }
        self.get(name)
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name().to_string()).collect()
    }

    /// Servers reached over ssh.
    pub fn remote(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| !s.is_local())
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlPath, ServerConfig};

    #[test]
    fn test_normalize_server_name() {
        assert_eq!(normalize_server_name(None), "localhost");
        assert_eq!(normalize_server_name(Some("")), "localhost");
        assert_eq!(normalize_server_name(Some(" ubuntu2 ")), "ubuntu2");
    }

    #[test]
    fn test_find_server_ip_literal() {
        assert_eq!(
            find_server_ip("192.168.94.129"),
            Some(Ipv4Addr::new(192, 168, 94, 129))
        );
        assert_eq!(
            find_server_ip("node-10.0.0.7"),
            Some(Ipv4Addr::new(10, 0, 0, 7))
        );
        assert_eq!(find_server_ip("localhost"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_server_destination() {
        let server = Server::new("ubuntu2", Ipv4Addr::new(10, 0, 0, 2), "mininet");
        assert_eq!(server.destination(), "mininet@10.0.0.2");
        assert!(!server.is_local());
        assert!(Server::localhost("mininet").is_local());
    }

    #[test]
    fn test_registry_from_config() {
        let mut config = ClusterConfig::default();
        config.user = Some("mininet".to_string());
        config.control_path = ControlPath::Enabled(true);
        config.set_server(ServerConfig::new("10.0.0.2"));

        let registry = ServerRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["localhost", "10.0.0.2"]);
        assert_eq!(registry.remote().count(), 1);

        let remote = registry.get("10.0.0.2").unwrap();
        assert_eq!(remote.user(), "mininet");
        assert!(remote.control_path().is_some());
        assert!(registry.get("localhost").unwrap().control_path().is_none());
        assert!(matches!(
            registry.get("ubuntu9"),
            Err(Error::UnknownServer { .. })
        ));
    }

    #[test]
    fn test_registry_local_fallback() {
        let registry = ServerRegistry::from_servers(
            vec![Server::new("a", Ipv4Addr::new(10, 0, 0, 1), "u")],
            "u".to_string(),
        );
        assert!(registry.local().is_local());
        assert_eq!(registry.resolve("localhost").unwrap().name(), "localhost");
        assert!(registry.get("localhost").is_err());
        assert!(matches!(
            registry.resolve("b"),
            Err(Error::UnknownServer { .. })
        ));
    }
}
