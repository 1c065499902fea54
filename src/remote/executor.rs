//! Command execution on cluster servers.
//!
//! Every command goes through the system `ssh` binary unless the target is
//! `localhost`. Commands intended for the root namespace run under
//! `sudo -E`; the ssh client itself runs as the logged-in user so that
//! agent forwarding and their keys keep working.

use log::debug;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::remote::cancel::CancellationToken;
use crate::remote::connections::{ChannelPurpose, ConnectionCache};
use crate::remote::process::{exit_code, terminate_group, ChildProcess, SpawnedProcess};
use crate::server::Server;

/// Base options of every ssh invocation.
const SSH_BASE: [&str; 6] = [
    "ssh",
    "-q",
    "-o",
    "BatchMode=yes",
    "-o",
    "ForwardAgent=yes",
];

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a command is run on its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Run with root privileges on the target.
    pub as_root: bool,
    /// Allocate a remote terminal (`ssh -tt`).
    pub attach_tty: bool,
}

impl RunOptions {
    pub fn root() -> Self {
        Self {
            as_root: true,
            attach_tty: false,
        }
    }

    pub fn user() -> Self {
        Self {
            as_root: false,
            attach_tty: false,
        }
    }

    pub fn with_tty(mut self) -> Self {
        self.attach_tty = true;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::root()
    }
}

/// Result of executing a command.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Exit code (0 for success)
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands on servers. Implemented by [`SshExecutor`] and by the
/// scripted runner used in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion and captures its output.
    fn run(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult>;

    /// Starts `command` and returns immediately with its piped stdout and stderr.
    fn spawn(&self, server: &Server, command: &str, opts: RunOptions)
        -> Result<Box<dyn ChildProcess>>;

    /// Whether blocking work started through this runner should stop.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Runs a teardown command. Unlike `run`, this still executes after the
    /// runner has been cancelled.
    fn run_cleanup(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult> {
        self.run(server, command, opts)
    }

    /// Like [`CommandRunner::run`], failing on a non-zero exit code.
    fn run_checked(
        &self,
        server: &Server,
        command: &str,
        opts: RunOptions,
    ) -> Result<ExecutionResult> {
        let result = self.run(server, command, opts)?;
        if result.is_success() {
            Ok(result)
        } else {
            Err(Error::RemoteCommandFailed {
                server: server.name().to_string(),
                command: command.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }
}

/// Routes every `run` of the wrapped runner through `run_cleanup`, so code
/// written against [`CommandRunner`] can be reused for rollback.
pub struct Cleanup<'a> {
    inner: &'a dyn CommandRunner,
}

impl<'a> Cleanup<'a> {
    pub fn new(inner: &'a dyn CommandRunner) -> Self {
        Self { inner }
    }
}

impl CommandRunner for Cleanup<'_> {
    fn run(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult> {
        self.inner.run_cleanup(server, command, opts)
    }

    fn spawn(
        &self,
        server: &Server,
        command: &str,
        opts: RunOptions,
    ) -> Result<Box<dyn ChildProcess>> {
        self.inner.spawn(server, command, opts)
    }

    fn run_cleanup(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult> {
        self.inner.run_cleanup(server, command, opts)
    }
}

/// Executes commands through the system ssh client.
pub struct SshExecutor {
    connections: Arc<ConnectionCache>,
    cancel: CancellationToken,
}

impl SshExecutor {
    pub fn new(connections: Arc<ConnectionCache>, cancel: CancellationToken) -> Self {
        Self {
            connections,
            cancel,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionCache> {
        &self.connections
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The full argv that runs `command` on `server`.
    pub fn build_argv(&self, server: &Server, command: &str, opts: RunOptions) -> Result<Vec<String>> {
        let words: Vec<String> = command.split_whitespace().map(String::from).collect();
        if words.is_empty() {
            return Err(Error::Config(format!("Empty command for {}", server)));
        }

        if server.is_local() {
            if opts.as_root {
                return Ok(words);
            }
            let mut argv = sudo_as(server.user());
            argv.extend(words);
            return Ok(argv);
        }

        let mut argv = sudo_as(server.user());
        argv.extend(SSH_BASE.iter().map(|s| s.to_string()));
        if opts.attach_tty {
            argv.push("-tt".to_string());
        }
        let purpose = if opts.attach_tty {
            ChannelPurpose::Interactive
        } else {
            ChannelPurpose::Command
        };
        if let Some(channel) = self.connections.channel(purpose, server)? {
            argv.extend(channel.ssh_options());
        }
        argv.push(server.destination());
        if opts.as_root {
            argv.push("sudo".to_string());
            argv.push("-E".to_string());
        }
        argv.extend(words);
        Ok(argv)
    }

    fn start(&self, server: &Server, command: &str, opts: RunOptions) -> Result<Child> {
        let argv = self.build_argv(server, command, opts)?;
        debug!("[{}] {}", server, argv.join(" "));
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // keep terminal signals away from remote commands
            .process_group(0)
            .spawn()?;
        Ok(child)
    }
}

fn sudo_as(user: &str) -> Vec<String> {
    ["sudo", "-E", "-u", user]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

impl SshExecutor {
    fn execute(
        &self,
        server: &Server,
        command: &str,
        opts: RunOptions,
        cancellable: bool,
    ) -> Result<ExecutionResult> {
        let cancelled = || Error::Cancelled {
            server: server.name().to_string(),
            command: command.to_string(),
        };
        if cancellable && self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let mut child = self.start(server, command, opts)?;
        let _in_flight = cancellable.then(|| self.cancel.track(child.id()));
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if cancellable && self.cancel.is_cancelled() {
                terminate_group(child.id())?;
                let _ = child.wait();
                let _ = stdout.join();
                let _ = stderr.join();
                return Err(cancelled());
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let result = ExecutionResult {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            exit_code: exit_code(status),
        };
        debug!("[{}] {} exited with {}", server, command, result.exit_code);
        Ok(result)
    }
}

impl CommandRunner for SshExecutor {
    fn run(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult> {
        self.execute(server, command, opts, true)
    }

    fn spawn(
        &self,
        server: &Server,
        command: &str,
        opts: RunOptions,
    ) -> Result<Box<dyn ChildProcess>> {
        let child = self.start(server, command, opts)?;
        Ok(Box::new(SpawnedProcess::new(child)))
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn run_cleanup(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult> {
        self.execute(server, command, opts, false)
    }
}
