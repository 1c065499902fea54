//! Startup reachability check.

use log::{debug, info};
use rayon::prelude::*;

use crate::error::{Error, PrecheckFailure, Result};
use crate::remote::executor::{CommandRunner, RunOptions};
use crate::server::{Server, ServerRegistry};

/// Probes passwordless root access on the target.
pub const PRECHECK_COMMAND: &str = "true";

/// Verifies that one server accepts non-interactive ssh and `sudo`.
pub fn check_server(runner: &dyn CommandRunner, server: &Server) -> Result<()> {
    let command = format!("ssh {} sudo {}", server.destination(), PRECHECK_COMMAND);
    debug!("Checking {}", server);
    let unreachable = |stderr: String| Error::ServerUnreachable {
        server: server.name().to_string(),
        command: command.clone(),
        stderr,
    };
    match runner.run(server, PRECHECK_COMMAND, RunOptions::root()) {
        Ok(result) if result.is_success() => Ok(()),
        Ok(result) => Err(unreachable(result.stderr)),
        Err(Error::Cancelled { server, command }) => Err(Error::Cancelled { server, command }),
        Err(e) => Err(unreachable(e.to_string())),
    }
}

/// Checks every remote server in parallel and reports all failures at once.
pub fn precheck(runner: &dyn CommandRunner, registry: &ServerRegistry) -> Result<()> {
    let remote: Vec<&Server> = registry.remote().collect();
    if remote.is_empty() {
        return Ok(());
    }
    info!("*** Checking {} servers", remote.len());

    let results: Vec<Result<()>> = remote
        .par_iter()
        .map(|server| check_server(runner, server))
        .collect();

    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::ServerUnreachable {
                server,
                command,
                stderr,
            }) => failures.push(PrecheckFailure {
                server,
                command,
                stderr,
            }),
            Err(e) => return Err(e),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::PrecheckFailed { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::ScriptedRunner;
    use std::net::Ipv4Addr;

    fn registry() -> ServerRegistry {
        ServerRegistry::from_servers(
            vec![
                Server::localhost("mn"),
                Server::new("s1", Ipv4Addr::new(10, 0, 0, 1), "mn"),
                Server::new("s2", Ipv4Addr::new(10, 0, 0, 2), "mn"),
                Server::new("s3", Ipv4Addr::new(10, 0, 0, 3), "mn"),
            ],
            "mn".to_string(),
        )
    }

    #[test]
    fn test_all_reachable() {
        let runner = ScriptedRunner::new();
        precheck(&runner, &registry()).unwrap();
        // localhost is never probed
        assert!(runner.commands_on("localhost").is_empty());
        assert_eq!(runner.commands_on("s2"), vec!["true"]);
    }

    #[test]
    fn test_every_failure_is_reported() {
        let runner = ScriptedRunner::new();
        runner.fail_server("s1");
        runner.fail_server("s3");
        match precheck(&runner, &registry()) {
            Err(Error::PrecheckFailed { failures }) => {
                let names: Vec<&str> = failures.iter().map(|f| f.server.as_str()).collect();
                assert_eq!(names, vec!["s1", "s3"]);
                assert!(failures[0].command.contains("mn@10.0.0.1"));
                assert!(failures[0].stderr.contains("Connection refused"));
            }
            other => panic!("expected PrecheckFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_local_only_cluster_skips_checks() {
        let runner = ScriptedRunner::new();
        let registry = ServerRegistry::from_servers(vec![Server::localhost("mn")], "mn".to_string());
        precheck(&runner, &registry).unwrap();
        assert!(runner.calls().is_empty());
    }
}
