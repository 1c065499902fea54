//! Cancellation of blocking remote operations.
//!
//! Remote commands are spawned in their own process group, so an interrupt
//! at the terminal never reaches them directly. Instead the token is
//! threaded through every blocking call: cancelling it terminates whatever
//! is in flight and makes the next poll return `Cancelled`.

use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::collections::HashSet;
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::remote::process::terminate_group;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT into every token created with `follow_interrupts`.
pub fn install_interrupt_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { sigaction(Signal::SIGINT, &action) }
        .map_err(|e| Error::Io(std::io::Error::from(e)))?;
    Ok(())
}

/// Whether SIGINT arrived since the last [`clear_interrupt`].
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Forgets a delivered SIGINT so teardown commands can still run.
pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

struct Inner {
    cancelled: AtomicBool,
    follow_interrupts: bool,
    in_flight: Mutex<HashSet<u32>>,
}

/// Shared cancellation flag plus the process groups currently blocking on it.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A token that is also cancelled by SIGINT once
    /// [`install_interrupt_handler`] has run.
    pub fn follow_interrupts() -> Self {
        Self::build(true)
    }

    fn build(follow_interrupts: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                follow_interrupts,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || (self.inner.follow_interrupts && INTERRUPTED.load(Ordering::SeqCst))
    }

    /// Cancels the token and terminates every tracked process group.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Ok(pids) = self.inner.in_flight.lock() {
            if !pids.is_empty() {
                warn!("Terminating {} in-flight remote commands", pids.len());
            }
            for pid in pids.iter() {
                if let Err(e) = terminate_group(*pid) {
                    warn!("Failed to terminate process group {}: {}", pid, e);
                }
            }
        }
    }

    /// Tracks `pid` until the returned guard is dropped.
    pub fn track(&self, pid: u32) -> InFlight {
        if let Ok(mut pids) = self.inner.in_flight.lock() {
            pids.insert(pid);
        }
        debug!("Tracking in-flight process {}", pid);
        InFlight {
            token: self.clone(),
            pid,
        }
    }

    /// Returns the number of tracked processes.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Untracks a process when dropped.
pub struct InFlight {
    token: CancellationToken,
    pid: u32,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut pids) = self.token.inner.in_flight.lock() {
            pids.remove(&self.pid);
        }
    }
}
