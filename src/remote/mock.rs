//! Scripted command runner for hermetic tests.
//!
//! `ScriptedRunner` records every command and answers from, in order: a
//! per-server outage, one-shot command failures, canned responses, and a
//! small simulation of `ip link` state per server (root namespace plus one
//! namespace per pid). Spawned processes are [`ScriptedProcess`]es whose
//! transport behaviour is queued with [`ScriptedRunner::push_transport`].
//! Once cancelled, `run` fails with `Cancelled` while `run_cleanup` keeps
//! answering.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::remote::executor::{CommandRunner, ExecutionResult, RunOptions};
use crate::remote::process::ChildProcess;
use crate::server::Server;

/// One command seen by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub server: String,
    pub command: String,
    pub opts: RunOptions,
    pub spawned: bool,
}

/// How the next spawned process behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Writes the handshake byte and stays up until terminated.
    Handshake,
    /// Writes these bytes and stays up until terminated.
    Reply(Vec<u8>),
    /// Never writes anything.
    Silent,
    /// Exits immediately.
    Exit { code: i32, stderr: String },
}

#[derive(Debug)]
struct CommandFailure {
    server: String,
    needle: String,
    remaining: u32,
    exit_code: i32,
    stderr: String,
}

#[derive(Debug, Default)]
struct Network {
    root: BTreeSet<String>,
    namespaces: HashMap<u32, BTreeSet<String>>,
}

impl Network {
    fn space(&mut self, namespace: Option<u32>) -> &mut BTreeSet<String> {
        match namespace {
            Some(pid) => self.namespaces.entry(pid).or_default(),
            None => &mut self.root,
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<RecordedCall>,
    down: HashSet<String>,
    failures: Vec<CommandFailure>,
    responses: HashMap<(String, String), String>,
    networks: HashMap<String, Network>,
    stuck: HashMap<(String, String), u32>,
    transports: VecDeque<Transport>,
    spawned: Vec<ProcessProbe>,
    next_pid: u32,
    cancelled: bool,
    cancel_on: Option<(String, String)>,
}

/// A [`CommandRunner`] that never touches the system.
#[derive(Default)]
pub struct ScriptedRunner {
    state: Mutex<State>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every command on `server` fails like an unreachable ssh peer.
    pub fn fail_server(&self, server: &str) {
        self.state().down.insert(server.to_string());
    }

    /// The next `times` commands on `server` containing `needle` exit with `exit_code`.
    pub fn fail_command(&self, server: &str, needle: &str, times: u32, exit_code: i32, stderr: &str) {
        self.state().failures.push(CommandFailure {
            server: server.to_string(),
            needle: needle.to_string(),
            remaining: times,
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    /// Answers `command` on `server` with `stdout`.
    pub fn respond(&self, server: &str, command: &str, stdout: &str) {
        self.state()
            .responses
            .insert((server.to_string(), command.to_string()), stdout.to_string());
    }

    /// The next `times` namespace moves of `interface` on `server` succeed
    /// without moving anything.
    pub fn stick_interface(&self, server: &str, interface: &str, times: u32) {
        self.state()
            .stuck
            .insert((server.to_string(), interface.to_string()), times);
    }

    /// Adds an interface to a namespace (`None` for the root namespace).
    pub fn add_interface(&self, server: &str, namespace: Option<u32>, name: &str) {
        self.state()
            .networks
            .entry(server.to_string())
            .or_default()
            .space(namespace)
            .insert(name.to_string());
    }

    /// Interfaces currently in a namespace of `server`.
    pub fn interfaces(&self, server: &str, namespace: Option<u32>) -> Vec<String> {
        self.state()
            .networks
            .entry(server.to_string())
            .or_default()
            .space(namespace)
            .iter()
            .cloned()
            .collect()
    }

    /// Cancels the runner.
    pub fn cancel(&self) {
        self.state().cancelled = true;
    }

    /// Cancels the runner when a command on `server` containing `needle`
    /// is run. That command already fails with `Cancelled`.
    pub fn cancel_on(&self, server: &str, needle: &str) {
        self.state().cancel_on = Some((server.to_string(), needle.to_string()));
    }

    pub fn push_transport(&self, transport: Transport) {
        self.state().transports.push_back(transport);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Commands run or spawned on `server`, in order.
    pub fn commands_on(&self, server: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.server == server)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn spawned(&self) -> Vec<ProcessProbe> {
        self.state().spawned.clone()
    }

    fn record(state: &mut State, server: &Server, command: &str, opts: RunOptions, spawned: bool) {
        state.calls.push(RecordedCall {
            server: server.name().to_string(),
            command: command.to_string(),
            opts,
            spawned,
        });
    }
}

fn unreachable(server: &Server) -> ExecutionResult {
    ExecutionResult {
        stdout: String::new(),
        stderr: format!("ssh: connect to host {} port 22: Connection refused", server.ip()),
        exit_code: 255,
    }
}

fn failed(stderr: &str, exit_code: i32) -> ExecutionResult {
    ExecutionResult {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

/// Splits `nsenter -t PID -n <rest>` into the pid and the inner command.
fn split_namespace(command: &str) -> (Option<u32>, &str) {
    let words: Vec<&str> = command.splitn(5, ' ').collect();
    if let ["nsenter", "-t", pid, "-n", rest] = words.as_slice() {
        if let Ok(pid) = pid.parse() {
            return (Some(pid), rest);
        }
    }
    (None, command)
}

fn listing(names: &BTreeSet<String>) -> String {
    let mut out = String::from(
        "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN\n    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00\n",
    );
    for (i, name) in names.iter().enumerate() {
        out.push_str(&format!(
            "{}: {}: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN\n    link/ether 00:00:00:00:00:00 brd ff:ff:ff:ff:ff:ff\n",
            i + 2,
            name
        ));
    }
    out
}

fn simulate(state: &mut State, server: &str, command: &str) -> ExecutionResult {
    let (namespace, inner) = split_namespace(command);
    let words: Vec<&str> = inner.split_whitespace().collect();
    let missing = |name: &str| failed(&format!("Cannot find device \"{}\"", name), 1);

    match words.as_slice() {
        ["ip", "link", "show"] => {
            let network = state.networks.entry(server.to_string()).or_default();
            ExecutionResult::ok(&listing(network.space(namespace)))
        }
        ["ip", "link", "delete" | "del", name] => {
            let network = state.networks.entry(server.to_string()).or_default();
            if network.space(namespace).remove(*name) {
                ExecutionResult::ok("")
            } else {
                missing(name)
            }
        }
        ["ip", "tuntap", "add", "dev", name, ..] => {
            let network = state.networks.entry(server.to_string()).or_default();
            network.space(namespace).insert(name.to_string());
            ExecutionResult::ok("")
        }
        ["ip", "link", "set", name, "netns", pid] => {
            let key = (server.to_string(), name.to_string());
            if let Some(remaining) = state.stuck.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return ExecutionResult::ok("");
                }
            }
            let Ok(pid) = pid.parse::<u32>() else {
                return failed("Invalid \"netns\" value", 1);
            };
            let network = state.networks.entry(server.to_string()).or_default();
            if !network.space(namespace).remove(*name) {
                return missing(name);
            }
            network.space(Some(pid)).insert(name.to_string());
            ExecutionResult::ok("")
        }
        ["ip", "link", "set", name, "name", new_name, ..] => {
            let network = state.networks.entry(server.to_string()).or_default();
            let space = network.space(namespace);
            if !space.remove(*name) {
                return missing(name);
            }
            space.insert(new_name.to_string());
            ExecutionResult::ok("")
        }
        ["ip", "link", "add", "name", first, rest @ ..] if rest.contains(&"veth") => {
            let peer = rest
                .windows(3)
                .find(|w| w[0] == "peer" && w[1] == "name")
                .map(|w| w[2]);
            let Some(peer) = peer else {
                return failed("veth peer name is required", 1);
            };
            let network = state.networks.entry(server.to_string()).or_default();
            let space = network.space(namespace);
            if space.contains(*first) || space.contains(peer) {
                return failed("RTNETLINK answers: File exists", 2);
            }
            space.insert(first.to_string());
            space.insert(peer.to_string());
            ExecutionResult::ok("")
        }
        ["ovs-vsctl", "--version"] => ExecutionResult::ok("ovs-vsctl (Open vSwitch) 2.17.9\n"),
        _ => ExecutionResult::ok(""),
    }
}

impl ScriptedRunner {
    fn answer(
        &self,
        server: &Server,
        command: &str,
        opts: RunOptions,
        cancellable: bool,
    ) -> Result<ExecutionResult> {
        let mut state = self.state();
        Self::record(&mut state, server, command, opts, false);

        if cancellable {
            let trigger = state
                .cancel_on
                .as_ref()
                .is_some_and(|(s, needle)| s == server.name() && command.contains(needle.as_str()));
            if trigger {
                state.cancel_on = None;
                state.cancelled = true;
            }
            if state.cancelled {
                return Err(Error::Cancelled {
                    server: server.name().to_string(),
                    command: command.to_string(),
                });
            }
        }
        if state.down.contains(server.name()) {
            return Ok(unreachable(server));
        }
        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.server == server.name() && f.remaining > 0 && command.contains(&f.needle))
        {
            failure.remaining -= 1;
            return Ok(failed(&failure.stderr, failure.exit_code));
        }
        if let Some(stdout) = state
            .responses
            .get(&(server.name().to_string(), command.to_string()))
        {
            return Ok(ExecutionResult::ok(stdout));
        }
        Ok(simulate(&mut state, server.name(), command))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult> {
        self.answer(server, command, opts, true)
    }

    fn spawn(
        &self,
        server: &Server,
        command: &str,
        opts: RunOptions,
    ) -> Result<Box<dyn ChildProcess>> {
        let mut state = self.state();
        Self::record(&mut state, server, command, opts, true);

        let transport = if state.down.contains(server.name()) {
            Transport::Exit {
                code: 255,
                stderr: unreachable(server).stderr,
            }
        } else {
            state.transports.pop_front().unwrap_or(Transport::Handshake)
        };
        state.next_pid += 1;
        let process = ScriptedProcess::new(10_000 + state.next_pid, command, transport);
        state.spawned.push(process.probe());
        Ok(Box::new(process))
    }

    fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    fn run_cleanup(&self, server: &Server, command: &str, opts: RunOptions) -> Result<ExecutionResult> {
        self.answer(server, command, opts, false)
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    exit: Option<i32>,
    terminate_calls: u32,
}

type Gate = Arc<(Mutex<Lifecycle>, Condvar)>;

fn lifecycle(gate: &Gate) -> MutexGuard<'_, Lifecycle> {
    match gate.0.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Serves its bytes, then blocks until the process exits.
struct GatedReader {
    data: Cursor<Vec<u8>>,
    gate: Gate,
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.read(buf)?;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        let mut state = lifecycle(&self.gate);
        while state.exit.is_none() {
            state = match self.gate.1.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        Ok(0)
    }
}

/// A fake long-lived process.
pub struct ScriptedProcess {
    pid: u32,
    gate: Gate,
    command: String,
    stdout: Option<GatedReader>,
    stderr: Option<GatedReader>,
}

impl ScriptedProcess {
    pub fn new(pid: u32, command: &str, transport: Transport) -> Self {
        let gate: Gate = Arc::new((Mutex::new(Lifecycle::default()), Condvar::new()));
        let (stdout, stderr) = match transport {
            Transport::Handshake => (b"@\n".to_vec(), Vec::new()),
            Transport::Reply(bytes) => (bytes, Vec::new()),
            Transport::Silent => (Vec::new(), Vec::new()),
            Transport::Exit { code, stderr } => {
                lifecycle(&gate).exit = Some(code);
                (Vec::new(), stderr.into_bytes())
            }
        };
        let reader = |bytes: Vec<u8>| GatedReader {
            data: Cursor::new(bytes),
            gate: gate.clone(),
        };
        Self {
            pid,
            command: command.to_string(),
            stdout: Some(reader(stdout)),
            stderr: Some(reader(stderr)),
            gate,
        }
    }

    pub fn probe(&self) -> ProcessProbe {
        ProcessProbe {
            pid: self.pid,
            command: self.command.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl ChildProcess for ScriptedProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout.take().map(|r| Box::new(r) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stderr.take().map(|r| Box::new(r) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(lifecycle(&self.gate).exit)
    }

    fn wait(&mut self) -> io::Result<i32> {
        let mut state = lifecycle(&self.gate);
        loop {
            if let Some(code) = state.exit {
                return Ok(code);
            }
            state = match self.gate.1.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        let mut state = lifecycle(&self.gate);
        state.terminate_calls += 1;
        if state.exit.is_none() {
            state.exit = Some(128 + 15);
        }
        self.gate.1.notify_all();
        Ok(())
    }
}

/// Observes a [`ScriptedProcess`] after it has been handed out.
#[derive(Clone)]
pub struct ProcessProbe {
    pid: u32,
    command: String,
    gate: Gate,
}

impl ProcessProbe {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_running(&self) -> bool {
        lifecycle(&self.gate).exit.is_none()
    }

    pub fn terminate_calls(&self) -> u32 {
        lifecycle(&self.gate).terminate_calls
    }

    /// Makes the process exit on its own, as if the transport died.
    pub fn exit(&self, code: i32) {
        lifecycle(&self.gate).exit = Some(code);
        self.gate.1.notify_all();
    }
}

impl std::fmt::Debug for ProcessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProbe")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("running", &self.is_running())
            .finish()
    }
}
