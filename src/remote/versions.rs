use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::remote::executor::{CommandRunner, RunOptions};
use crate::server::Server;

/// First Open vSwitch release with OpenFlow 1.3 support.
const MODERN_OVS: (u32, u32) = (1, 10);

/// Caches the `ovs-vsctl` version reported by each server.
#[derive(Debug, Default)]
pub struct OvsVersionCache {
    versions: Mutex<HashMap<String, String>>,
}

impl OvsVersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `major.minor` version installed on `server`, queried once.
    pub fn version(&self, runner: &dyn CommandRunner, server: &Server) -> Result<String> {
        let mut versions = self.versions.lock().map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "Failed to acquire version cache lock: {}",
                e
            )))
        })?;
        if let Some(version) = versions.get(server.name()) {
            return Ok(version.clone());
        }

        let result = runner.run_checked(server, "ovs-vsctl --version", RunOptions::root())?;
        let version = parse_version(&result.stdout).ok_or_else(|| {
            Error::Config(format!(
                "Could not parse an OVS version on {} from: {}",
                server,
                result.stdout.trim()
            ))
        })?;
        debug!("{} runs OVS {}", server, version);
        versions.insert(server.name().to_string(), version.clone());
        Ok(version)
    }

    /// Whether `server` runs an OVS release older than 1.10.
    pub fn is_old(&self, runner: &dyn CommandRunner, server: &Server) -> Result<bool> {
        let version = self.version(runner, server)?;
        Ok(split_version(&version).is_some_and(|v| v < MODERN_OVS))
    }
}

/// First `digits.digits` run found in `text`.
pub fn parse_version(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            return Some(text[start..end].to_string());
        }
    }
    None
}

fn split_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::ScriptedRunner;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("ovs-vsctl (Open vSwitch) 2.17.9\nDB Schema 8.3.0"),
            Some("2.17".to_string())
        );
        assert_eq!(parse_version("version 1.9"), Some("1.9".to_string()));
        assert_eq!(parse_version("no numbers 42 here"), None);
    }

    #[test]
    fn test_old_ovs_and_caching() {
        let runner = ScriptedRunner::new();
        let server = Server::new("s1", Ipv4Addr::new(10, 0, 0, 1), "mn");
        runner.respond("s1", "ovs-vsctl --version", "ovs-vsctl (Open vSwitch) 1.9.3\n");

        let cache = OvsVersionCache::new();
        assert!(cache.is_old(&runner, &server).unwrap());
        assert!(cache.is_old(&runner, &server).unwrap());
        assert_eq!(runner.commands_on("s1").len(), 1);
    }

    #[test]
    fn test_modern_ovs() {
        let runner = ScriptedRunner::new();
        let server = Server::localhost("mn");
        runner.respond("localhost", "ovs-vsctl --version", "ovs-vsctl (Open vSwitch) 1.10.0\n");
        assert!(!OvsVersionCache::new().is_old(&runner, &server).unwrap());
    }
}
