//! Ethernet-over-ssh tunnels between two servers.
//!
//! Both servers get a tap carrier named [`CARRIER`]. The initiator then
//! starts `ssh -w` towards the peer, which binds both carriers to tunnel
//! [`TUNNEL_ID`] and echoes [`SENTINEL`] once the channel is up. Only then
//! are the carriers moved into their nodes and renamed.

use log::{debug, error, info};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::LinkEndpoint;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::link::interfaces;
use crate::remote::{ChildProcess, Cleanup, CommandRunner, ProcessStatus, RetryConfig, RunOptions};
use crate::server::Server;

/// Name of the carrier interface before it is renamed.
pub const CARRIER: &str = "tap9";
/// Tunnel device number on both ends (`-w 9:9`).
pub const TUNNEL_ID: u32 = 9;
/// Byte the transport writes once the tunnel is up.
pub const SENTINEL: u8 = b'@';

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const CANCEL_POLL: Duration = Duration::from_millis(50);

type Reader = Box<dyn Read + Send>;

fn poisoned<T>(server: &str, e: PoisonError<T>) -> Error {
    Error::TunnelSetupFailed {
        server: server.to_string(),
        reason: format!("carrier lock poisoned: {}", e),
    }
}

/// One lock per server, held while that server's carrier name is in use.
#[derive(Debug, Default)]
pub struct CarrierLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CarrierLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, server: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|e| poisoned(server, e))?;
        Ok(locks.entry(server.to_string()).or_default().clone())
    }
}

/// Timing knobs of the tunnel protocol.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub handshake_timeout: Duration,
    pub migration: RetryConfig,
}

impl TunnelSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            migration: RetryConfig::fixed(config.migration.attempts, config.migration.delay_ms),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            migration: RetryConfig::fixed(3, 10),
        }
    }
}

enum TransportState {
    Live(Box<dyn ChildProcess>),
    Stopped(i32),
}

/// A running tunnel. Owns the transport process.
pub struct Tunnel {
    initiator: Server,
    peer: Server,
    command: String,
    pid: u32,
    state: Mutex<TransportState>,
    // held open so the transport never writes into a closed pipe
    stdout: Mutex<Option<Reader>>,
}

impl Tunnel {
    pub fn initiator(&self) -> &Server {
        &self.initiator
    }

    pub fn peer(&self) -> &Server {
        &self.peer
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => e.into_inner(),
        };
        match &mut *state {
            TransportState::Stopped(code) => ProcessStatus::Exited(*code),
            TransportState::Live(process) => match process.try_wait() {
                Ok(Some(code)) => ProcessStatus::Exited(code),
                Ok(None) | Err(_) => ProcessStatus::Running,
            },
        }
    }

    /// Terminates the transport if it is still running. Returns whether
    /// this call stopped it; later calls do nothing.
    pub fn terminate(&self) -> Result<bool> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => e.into_inner(),
        };
        let code = match &mut *state {
            TransportState::Stopped(_) => return Ok(false),
            TransportState::Live(process) => match process.try_wait()? {
                Some(code) => code,
                None => {
                    process.terminate()?;
                    process.wait()?
                }
            },
        };
        debug!("Tunnel {} -> {} stopped ({})", self.initiator, self.peer, code);
        *state = TransportState::Stopped(code);
        if let Ok(mut stdout) = self.stdout.lock() {
            stdout.take();
        }
        Ok(true)
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("initiator", &self.initiator.name())
            .field("peer", &self.peer.name())
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

/// Orders the ends so a local endpoint, if any, initiates. Otherwise the
/// first endpoint does.
pub fn initiator_first<'a>(
    a: &'a LinkEndpoint,
    b: &'a LinkEndpoint,
) -> (&'a LinkEndpoint, &'a LinkEndpoint) {
    if b.server.is_local() && !a.server.is_local() {
        (b, a)
    } else {
        (a, b)
    }
}

/// The transport started on the initiator.
pub fn transport_command(peer: &Server) -> String {
    format!(
        "ssh -n -o Tunnel=Ethernet -w {}:{} {} echo {}",
        TUNNEL_ID,
        TUNNEL_ID,
        peer.destination(),
        SENTINEL as char
    )
}

fn create_carrier(runner: &dyn CommandRunner, server: &Server) -> Result<()> {
    let setup_failed = |reason: String| Error::TunnelSetupFailed {
        server: server.name().to_string(),
        reason,
    };
    interfaces::delete_stale(runner, server, None, CARRIER)?;
    runner
        .run_checked(
            server,
            &format!("ip tuntap add dev {} mode tap user {}", CARRIER, server.user()),
            RunOptions::root(),
        )
        .map_err(|e| setup_failed(e.to_string()))?;
    if !interfaces::exists(runner, server, None, CARRIER)? {
        return Err(setup_failed(format!("{} is missing after creation", CARRIER)));
    }
    Ok(())
}

fn create_carriers(runner: &dyn CommandRunner, a: &Server, b: &Server) -> Result<()> {
    let (on_a, on_b) = thread::scope(|scope| {
        let handle = scope.spawn(|| create_carrier(runner, a));
        let on_b = create_carrier(runner, b);
        (handle.join(), on_b)
    });
    on_a.map_err(|_| Error::TunnelSetupFailed {
        server: a.name().to_string(),
        reason: "carrier creation panicked".to_string(),
    })??;
    on_b
}

/// Best-effort removal of everything the tunnel may have left on one end.
/// Runs even when the runner has been cancelled.
fn discard(runner: &dyn CommandRunner, end: &LinkEndpoint) {
    let cleanup = Cleanup::new(runner);
    let runner: &dyn CommandRunner = &cleanup;
    let _ = interfaces::delete_stale(runner, &end.server, None, CARRIER);
    if end.namespace.is_some() {
        let _ = interfaces::delete_stale(runner, &end.server, end.namespace, CARRIER);
    }
    let _ = interfaces::delete_stale(runner, &end.server, end.namespace, &end.interface);
}

type ReadResult = (io::Result<Option<u8>>, Reader);

fn read_one(mut stdout: Reader) -> mpsc::Receiver<ReadResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut byte = [0u8; 1];
        let read = match stdout.read_exact(&mut byte) {
            Ok(()) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        };
        let _ = tx.send((read, stdout));
    });
    rx
}

fn drain(reader: Option<Reader>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = reader.read_to_end(&mut bytes);
        let _ = tx.send(bytes);
    });
    let bytes = rx.recv_timeout(DRAIN_TIMEOUT).unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

struct HandshakeFailure {
    received: String,
    output: String,
    cancelled: bool,
}

/// Waits for the sentinel byte, giving up early once `runner` is cancelled.
/// On failure the process is stopped and its remaining output collected.
fn handshake(
    runner: &dyn CommandRunner,
    process: &mut dyn ChildProcess,
    timeout: Duration,
) -> std::result::Result<Reader, HandshakeFailure> {
    let Some(stdout) = process.take_stdout() else {
        let _ = process.terminate();
        return Err(HandshakeFailure {
            received: "transport has no stdout".to_string(),
            output: String::new(),
            cancelled: false,
        });
    };
    let pending = read_one(stdout);

    let deadline = Instant::now() + timeout;
    let mut cancelled = false;
    let outcome = loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match pending.recv_timeout(left.min(CANCEL_POLL)) {
            Err(RecvTimeoutError::Timeout) if !left.is_zero() => {
                if runner.is_cancelled() {
                    cancelled = true;
                    break Err(RecvTimeoutError::Timeout);
                }
            }
            other => break other,
        }
    };

    let (received, reader) = match outcome {
        Ok((Ok(Some(SENTINEL)), reader)) => return Ok(reader),
        Ok((Ok(Some(byte)), reader)) => (
            format!("received {:?} instead of {:?}", byte as char, SENTINEL as char),
            Some(reader),
        ),
        Ok((Ok(None), reader)) => (
            "transport exited before the handshake".to_string(),
            Some(reader),
        ),
        Ok((Err(e), reader)) => (format!("read failed: {}", e), Some(reader)),
        Err(RecvTimeoutError::Timeout) if cancelled => ("cancelled".to_string(), None),
        Err(RecvTimeoutError::Timeout) => (format!("no handshake within {:?}", timeout), None),
        Err(RecvTimeoutError::Disconnected) => ("handshake reader vanished".to_string(), None),
    };

    if !matches!(process.try_wait(), Ok(Some(_))) {
        let _ = process.terminate();
    }
    let _ = process.wait();
    // a blocked reader is released once the process is gone
    let reader = reader.or_else(|| pending.recv_timeout(DRAIN_TIMEOUT).ok().map(|(_, r)| r));

    let stdout = drain(reader);
    let stderr = drain(process.take_stderr());
    let output = [stdout, stderr]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    Err(HandshakeFailure {
        received,
        output,
        cancelled,
    })
}

fn place_carriers(
    runner: &dyn CommandRunner,
    settings: &TunnelSettings,
    ends: [&LinkEndpoint; 2],
) -> Result<()> {
    for end in ends {
        if let Some(pid) = end.namespace {
            interfaces::move_to_namespace(
                runner,
                &end.server,
                CARRIER,
                &end.node,
                pid,
                &settings.migration,
            )?;
        }
    }
    for end in ends {
        interfaces::rename(
            runner,
            &end.server,
            end.namespace,
            CARRIER,
            &end.interface,
            end.address.as_deref(),
        )?;
    }
    Ok(())
}

/// Runs the whole tunnel protocol between two endpoints on different servers.
pub fn establish_tunnel(
    runner: &dyn CommandRunner,
    locks: &CarrierLocks,
    settings: &TunnelSettings,
    a: &LinkEndpoint,
    b: &LinkEndpoint,
) -> Result<Tunnel> {
    let (init, peer) = initiator_first(a, b);
    if init.server.name() == peer.server.name() {
        return Err(Error::TunnelSetupFailed {
            server: init.server.name().to_string(),
            reason: "both ends are on the same server".to_string(),
        });
    }

    // lock in name order so concurrent tunnels cannot deadlock
    let (low, high) = if init.server.name() < peer.server.name() {
        (&init.server, &peer.server)
    } else {
        (&peer.server, &init.server)
    };
    let low_lock = locks.lock_for(low.name())?;
    let high_lock = locks.lock_for(high.name())?;
    let _low = low_lock.lock().map_err(|e| poisoned(low.name(), e))?;
    let _high = high_lock.lock().map_err(|e| poisoned(high.name(), e))?;

    info!(
        "*** Tunnel {}:{} ({}) <-> {}:{} ({})",
        init.node, init.interface, init.server, peer.node, peer.interface, peer.server
    );

    if let Err(e) = create_carriers(runner, &init.server, &peer.server) {
        discard(runner, init);
        discard(runner, peer);
        return Err(e);
    }

    let command = transport_command(&peer.server);
    let mut process = match runner.spawn(&init.server, &command, RunOptions::user()) {
        Ok(process) => process,
        Err(e) => {
            discard(runner, init);
            discard(runner, peer);
            return Err(e);
        }
    };

    let stdout = match handshake(runner, process.as_mut(), settings.handshake_timeout) {
        Ok(stdout) => stdout,
        Err(failure) if failure.cancelled => {
            discard(runner, init);
            discard(runner, peer);
            return Err(Error::Cancelled {
                server: init.server.name().to_string(),
                command,
            });
        }
        Err(failure) => {
            error!(
                "Tunnel handshake {} -> {} failed: {}",
                init.server, peer.server, failure.received
            );
            discard(runner, init);
            discard(runner, peer);
            return Err(Error::TunnelHandshakeFailed {
                initiator: init.server.name().to_string(),
                peer: peer.server.name().to_string(),
                command,
                received: failure.received,
                output: failure.output,
            });
        }
    };

    let tunnel = Tunnel {
        initiator: init.server.clone(),
        peer: peer.server.clone(),
        pid: process.id(),
        command,
        state: Mutex::new(TransportState::Live(process)),
        stdout: Mutex::new(Some(stdout)),
    };

    if let Err(e) = place_carriers(runner, settings, [init, peer]) {
        let _ = tunnel.terminate();
        discard(runner, init);
        discard(runner, peer);
        return Err(e);
    }
    Ok(tunnel)
}
