//! Interface primitives shared by pairs and tunnels.

use log::{debug, warn};

use crate::engine::in_namespace;
use crate::error::{Error, Result};
use crate::remote::{retry_with_backoff, CommandRunner, RetryConfig, RunOptions};
use crate::server::Server;

fn scoped(namespace: Option<u32>, command: &str) -> String {
    match namespace {
        Some(pid) => in_namespace(pid, command),
        None => command.to_string(),
    }
}

/// Interface names from `ip link show` output, without `@peer` suffixes.
pub fn parse_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| line.split(':').nth(1))
        .map(|name| name.trim())
        .map(|name| name.split('@').next().unwrap_or(name).to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Lists the interfaces of a namespace on `server` (`None` is the root namespace).
pub fn list(runner: &dyn CommandRunner, server: &Server, namespace: Option<u32>) -> Result<Vec<String>> {
    let result = runner.run_checked(server, &scoped(namespace, "ip link show"), RunOptions::root())?;
    Ok(parse_listing(&result.stdout))
}

pub fn exists(
    runner: &dyn CommandRunner,
    server: &Server,
    namespace: Option<u32>,
    name: &str,
) -> Result<bool> {
    Ok(list(runner, server, namespace)?.iter().any(|n| n == name))
}

/// Deletes `name` if present. Returns whether anything was deleted.
pub fn delete_stale(
    runner: &dyn CommandRunner,
    server: &Server,
    namespace: Option<u32>,
    name: &str,
) -> Result<bool> {
    let result = runner.run(
        server,
        &scoped(namespace, &format!("ip link delete {}", name)),
        RunOptions::root(),
    )?;
    if result.is_success() {
        debug!("Deleted stale {} on {}", name, server);
    }
    Ok(result.is_success())
}

/// Moves `interface` from the root namespace of `server` into the namespace
/// of `pid`, verifying each attempt by listing the root namespace.
pub fn move_to_namespace(
    runner: &dyn CommandRunner,
    server: &Server,
    interface: &str,
    node: &str,
    pid: u32,
    retry: &RetryConfig,
) -> Result<()> {
    let failed = || Error::InterfaceMigrationFailed {
        server: server.name().to_string(),
        interface: interface.to_string(),
        node: node.to_string(),
        attempts: retry.attempts(),
    };
    let command = format!("ip link set {} netns {}", interface, pid);
    let operation = format!("moving {} into {} on {}", interface, node, server);

    retry_with_backoff(
        retry,
        || {
            let result = runner.run(server, &command, RunOptions::root())?;
            if !result.is_success() {
                warn!("{} on {}: {}", command, server, result.stderr.trim());
            }
            if exists(runner, server, None, interface)? {
                Err(failed())
            } else {
                Ok(())
            }
        },
        &operation,
    )
    .map_err(|e| match e {
        Error::InterfaceMigrationFailed { .. } => failed(),
        other => other,
    })
}

/// Renames `interface` inside its namespace and optionally sets its
/// hardware address, then checks the new name is listed.
pub fn rename(
    runner: &dyn CommandRunner,
    server: &Server,
    namespace: Option<u32>,
    interface: &str,
    new_name: &str,
    address: Option<&str>,
) -> Result<()> {
    let failed = || Error::InterfaceRenameFailed {
        server: server.name().to_string(),
        interface: interface.to_string(),
        new_name: new_name.to_string(),
    };
    let mut command = format!("ip link set {} name {}", interface, new_name);
    if let Some(address) = address {
        command.push_str(&format!(" address {}", address));
    }
    let result = runner.run(server, &scoped(namespace, &command), RunOptions::root())?;
    if !result.is_success() {
        warn!("{} on {}: {}", command, server, result.stderr.trim());
        return Err(failed());
    }
    if !exists(runner, server, namespace, new_name)? {
        return Err(failed());
    }
    Ok(())
}
