//! Realisation of topology links.
//!
//! A link becomes a veth pair when both ends share a server and a tunnel
//! otherwise. See [`LinkProvisioner`].

pub mod interfaces;
pub mod pair;
mod provisioner;
pub mod tunnel;

pub use provisioner::LinkProvisioner;
pub use tunnel::{CarrierLocks, Tunnel, TunnelSettings};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::node::{RemoteExecutable, RemoteNode};
use crate::remote::ProcessStatus;
use crate::server::Server;

/// One end of a link, already placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEndpoint {
    pub node: String,
    pub server: Server,
    pub interface: String,
    pub address: Option<String>,
    /// Pid whose namespace the interface must end up in
    pub namespace: Option<u32>,
}

impl LinkEndpoint {
    pub fn new(node: &str, server: Server, interface: &str) -> Self {
        Self {
            node: node.to_string(),
            server,
            interface: interface.to_string(),
            address: None,
            namespace: None,
        }
    }

    pub fn from_node(node: &RemoteNode, interface: &str, address: Option<&str>) -> Self {
        Self {
            node: node.name().to_string(),
            server: node.server().clone(),
            interface: interface.to_string(),
            address: address.map(String::from),
            namespace: node.handle().namespace_pid(),
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn with_namespace(mut self, pid: u32) -> Self {
        self.namespace = Some(pid);
        self
    }
}

impl fmt::Display for LinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}@{}", self.node, self.interface, self.server)
    }
}

/// Which realisation a pair of servers calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    LocalPair,
    RemotePair,
    Tunnel,
}

impl LinkKind {
    pub fn decide(a: &Server, b: &Server) -> Self {
        if a.is_local() && b.is_local() {
            LinkKind::LocalPair
        } else if a.name() == b.name() {
            LinkKind::RemotePair
        } else {
            LinkKind::Tunnel
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            LinkKind::LocalPair => "local pair",
            LinkKind::RemotePair => "remote pair",
            LinkKind::Tunnel => "tunnel",
        })
    }
}

#[derive(Debug)]
pub enum LinkRealization {
    LocalPair,
    RemotePair(Server),
    Tunnel(Tunnel),
}

impl LinkRealization {
    pub fn kind(&self) -> LinkKind {
        match self {
            LinkRealization::LocalPair => LinkKind::LocalPair,
            LinkRealization::RemotePair(_) => LinkKind::RemotePair,
            LinkRealization::Tunnel(_) => LinkKind::Tunnel,
        }
    }
}

/// Health of a link as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Ok,
    Tunnel {
        pid: u32,
        command: String,
        status: ProcessStatus,
    },
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkStatus::Ok => f.write_str("OK"),
            LinkStatus::Tunnel {
                pid,
                command,
                status: ProcessStatus::Running,
            } => write!(f, "Tunnel Running ({}: {})", pid, command),
            LinkStatus::Tunnel {
                status: ProcessStatus::Exited(code),
                ..
            } => write!(f, "Tunnel EXITED {}", code),
        }
    }
}

/// An established link.
#[derive(Debug)]
pub struct Link {
    pub endpoint1: LinkEndpoint,
    pub endpoint2: LinkEndpoint,
    pub realization: LinkRealization,
    torn_down: AtomicBool,
}

impl Link {
    pub fn new(endpoint1: LinkEndpoint, endpoint2: LinkEndpoint, realization: LinkRealization) -> Self {
        Self {
            endpoint1,
            endpoint2,
            realization,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.realization.kind()
    }

    pub fn status(&self) -> LinkStatus {
        match &self.realization {
            LinkRealization::Tunnel(tunnel) => LinkStatus::Tunnel {
                pid: tunnel.pid(),
                command: tunnel.command().to_string(),
                status: tunnel.status(),
            },
            _ => LinkStatus::Ok,
        }
    }

    /// Marks the link torn down. Returns false if it already was.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.endpoint1.node, self.endpoint1.interface, self.endpoint2.node, self.endpoint2.interface
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_decision_table() {
        let local = Server::localhost("mn");
        let a = Server::new("a", Ipv4Addr::new(10, 0, 0, 1), "mn");
        let b = Server::new("b", Ipv4Addr::new(10, 0, 0, 2), "mn");

        assert_eq!(LinkKind::decide(&local, &local), LinkKind::LocalPair);
        assert_eq!(LinkKind::decide(&a, &a), LinkKind::RemotePair);
        assert_eq!(LinkKind::decide(&a, &b), LinkKind::Tunnel);
        assert_eq!(LinkKind::decide(&local, &b), LinkKind::Tunnel);
        assert_eq!(LinkKind::decide(&b, &local), LinkKind::Tunnel);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(LinkStatus::Ok.to_string(), "OK");
        let running = LinkStatus::Tunnel {
            pid: 4242,
            command: "ssh -n -o Tunnel=Ethernet -w 9:9 mn@10.0.0.2 echo @".to_string(),
            status: ProcessStatus::Running,
        };
        assert_eq!(
            running.to_string(),
            "Tunnel Running (4242: ssh -n -o Tunnel=Ethernet -w 9:9 mn@10.0.0.2 echo @)"
        );
        let exited = LinkStatus::Tunnel {
            pid: 4242,
            command: String::new(),
            status: ProcessStatus::Exited(255),
        };
        assert_eq!(exited.to_string(), "Tunnel EXITED 255");
    }
}
