//! Shared ssh control channels.
//!
//! When a control path is configured every ssh invocation towards a server
//! multiplexes over one master connection per `(purpose, server)` pair.
//! The cache only hands out control socket paths; the master itself is
//! started by the first ssh client that uses the path (`ControlMaster=auto`).

use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::server::Server;

/// What a channel is used for. Commands run with and without a terminal
/// get separate masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    Command,
    Interactive,
}

impl ChannelPurpose {
    fn suffix(self) -> &'static str {
        match self {
            ChannelPurpose::Command => "",
            ChannelPurpose::Interactive => ".tty",
        }
    }
}

/// A control socket path handed to ssh with `-o ControlPath=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlChannel {
    pub path: String,
}

impl ControlChannel {
    /// The ssh options that attach a client to this channel.
    pub fn ssh_options(&self) -> [String; 4] {
        [
            "-o".to_string(),
            format!("ControlPath={}", self.path),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
        ]
    }
}

/// Thread-safe cache of control channels keyed by purpose and server name.
#[derive(Debug, Default)]
pub struct ConnectionCache {
    channels: RwLock<HashMap<(ChannelPurpose, String), ControlChannel>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel for `server`, creating its socket directory on
    /// first use. Servers without a control path get `None`.
    pub fn channel(
        &self,
        purpose: ChannelPurpose,
        server: &Server,
    ) -> Result<Option<ControlChannel>> {
        let pattern = match server.control_path() {
            Some(pattern) => pattern,
            None => return Ok(None),
        };
        let key = (purpose, server.name().to_string());

        {
            let channels = self
                .channels
                .read()
                .map_err(|e| lock_error("read", e))?;
            if let Some(channel) = channels.get(&key) {
                return Ok(Some(channel.clone()));
            }
        }

        let mut channels = self
            .channels
            .write()
            .map_err(|e| lock_error("write", e))?;
        // another thread may have won the race
        if let Some(channel) = channels.get(&key) {
            return Ok(Some(channel.clone()));
        }

        let path = expand_path(&format!("{}{}", pattern, purpose.suffix()));
        if let Some(dir) = Path::new(&path).parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                info!("Creating ssh control directory {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        debug!("New {:?} control channel for {}: {}", purpose, server, path);
        let channel = ControlChannel { path };
        channels.insert(key, channel.clone());
        Ok(Some(channel))
    }

    pub fn len(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every channel. Called at cluster teardown.
    pub fn clear(&self) {
        if let Ok(mut channels) = self.channels.write() {
            if !channels.is_empty() {
                debug!("Dropping {} control channels", channels.len());
            }
            channels.clear();
        }
    }
}

fn lock_error<T>(kind: &str, e: std::sync::PoisonError<T>) -> Error {
    Error::Io(std::io::Error::other(format!(
        "Failed to acquire connection cache {} lock: {}",
        kind, e
    )))
}

/// Expands a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn server(name: &str, dir: &TempDir) -> Server {
        let pattern = dir.path().join("mn").join("%r@%h:%p");
        Server::new(name, Ipv4Addr::new(10, 0, 0, 2), "mn")
            .with_control_path(Some(pattern.to_string_lossy().into_owned()))
    }

    #[test]
    fn test_no_control_path_means_no_channel() {
        let cache = ConnectionCache::new();
        let plain = Server::new("s1", Ipv4Addr::new(10, 0, 0, 2), "mn");
        assert_eq!(cache.channel(ChannelPurpose::Command, &plain).unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_channel_is_created_once() {
        let dir = TempDir::new().unwrap();
        let cache = ConnectionCache::new();
        let s1 = server("s1", &dir);

        let first = cache.channel(ChannelPurpose::Command, &s1).unwrap().unwrap();
        let second = cache.channel(ChannelPurpose::Command, &s1).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        assert!(dir.path().join("mn").is_dir());

        let tty = cache
            .channel(ChannelPurpose::Interactive, &s1)
            .unwrap()
            .unwrap();
        assert!(tty.path.ends_with(".tty"));
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_first_use() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ConnectionCache::new());
        let s1 = server("s1", &dir);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = cache.clone();
                let s1 = s1.clone();
                scope.spawn(move || {
                    cache.channel(ChannelPurpose::Command, &s1).unwrap();
                });
            }
        });
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/tmp/x"), "/tmp/x");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_path("~/.ssh/mn/%r@%h:%p"),
                home.join(".ssh/mn/%r@%h:%p").to_string_lossy().into_owned()
            );
        }
    }
}
