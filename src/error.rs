use thiserror::Error;

/// A single server that failed the startup reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecheckFailure {
    pub server: String,
    pub command: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Server {server} is unreachable (command: {command}): {stderr}")]
    ServerUnreachable {
        server: String,
        command: String,
        stderr: String,
    },

    #[error("Server precheck failed for {} server(s):\n{}\n{}", .failures.len(), format_failures(.failures), PRECHECK_HINTS)]
    PrecheckFailed { failures: Vec<PrecheckFailure> },

    #[error("Command failed on {server} with exit code {exit_code}: {command}\n{stderr}")]
    RemoteCommandFailed {
        server: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Unknown server '{server}' (not in the cluster server list)")]
    UnknownServer { server: String },

    #[error("Cannot place isolated host {host}: it has no link to any switch")]
    IsolatedHost { host: String },

    #[error("Node {node} was not enumerated when the placement was computed")]
    UnplacedNode { node: String },

    #[error("Tunnel setup failed on {server}: {reason}")]
    TunnelSetupFailed { server: String, reason: String },

    #[error("Tunnel handshake from {initiator} to {peer} failed ({received}); command was: {command}\n{output}")]
    TunnelHandshakeFailed {
        initiator: String,
        peer: String,
        command: String,
        received: String,
        output: String,
    },

    #[error("Could not move {interface} into the namespace of {node} on {server} after {attempts} attempts")]
    InterfaceMigrationFailed {
        server: String,
        interface: String,
        node: String,
        attempts: u32,
    },

    #[error("Could not rename {interface} to {new_name} on {server}")]
    InterfaceRenameFailed {
        server: String,
        interface: String,
        new_name: String,
    },

    #[error("Cancelled while running on {server}: {command}")]
    Cancelled { server: String, command: String },
}

const PRECHECK_HINTS: &str = "\
*** Make sure that the above ssh commands work correctly.\n\
*** You may also need to clean up stale state on all servers, and/or\n\
*** run with sudo -E.";

fn format_failures(failures: &[PrecheckFailure]) -> String {
    failures
        .iter()
        .map(|f| {
            let stderr = f.stderr.trim();
            if stderr.is_empty() {
                format!("  {}: {}", f.server, f.command)
            } else {
                format!("  {}: {} ({})", f.server, f.command, stderr)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Error = ClusterError;
pub type Result<T> = std::result::Result<T, Error>;
