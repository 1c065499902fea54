//! Bounded retries for racy interface operations, and ssh failure hints.
//!
//! Moving a freshly created interface into a namespace can race with the
//! kernel finishing its setup, so the link code retries it a few times.

use crate::error::{Error, Result};
use crate::server::Server;
use log::{debug, warn};
use std::thread;
use std::time::Duration;

/// How often, and how far apart, an operation is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Tries in total, the first one included
    pub attempts: u32,
    /// Pause before each retry
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(3, 10)
    }
}

impl RetryConfig {
    /// `attempts` tries in total, `delay_ms` apart.
    pub fn fixed(attempts: u32, delay_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            delay: Duration::from_millis(delay_ms),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

/// Runs `operation` until it succeeds or the attempts are used up, sleeping
/// `config.delay` between tries. Returns the last error. A cancellation is
/// returned at once.
pub fn retry_with_backoff<T, F>(config: &RetryConfig, mut operation: F, what: &str) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = config.attempts();
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}/{}", what, attempt, attempts);
                }
                return Ok(value);
            }
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) if attempt >= attempts => {
                debug!("{} failed {} times, giving up: {}", what, attempts, e);
                return Err(e);
            }
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                thread::sleep(config.delay);
                attempt += 1;
            }
        }
    }
}

/// Troubleshooting suggestions for a failed ssh invocation, based on its stderr.
pub fn diagnose_ssh_error(stderr: &str, server: &Server) -> Vec<String> {
    let error_str = stderr.to_lowercase();
    let destination = server.destination();

    let mut suggestions = Vec::new();

    if error_str.contains("connection refused")
        || error_str.contains("connection timed out")
        || error_str.contains("no route to host")
        || error_str.contains("could not resolve")
    {
        suggestions.push(format!("• Verify that {} ({}) is reachable", server, server.ip()));
        suggestions.push("• Check that sshd is running on port 22".to_string());
    }

    if error_str.contains("permission denied") || error_str.contains("publickey") {
        suggestions.push(format!(
            "• Verify that {} can log in without a password (ssh {} true)",
            server.user(),
            destination
        ));
        suggestions.push("• Verify your SSH agent is running (ssh-add -l)".to_string());
    }

    if error_str.contains("host key") || error_str.contains("known_hosts") {
        suggestions.push(format!(
            "• Add the host to known_hosts: ssh-keyscan {} >> ~/.ssh/known_hosts",
            server.ip()
        ));
    }

    if error_str.contains("sudo") || error_str.contains("password is required") {
        suggestions.push(format!(
            "• Allow {} to run sudo without a password on {}",
            server.user(),
            server
        ));
    }

    if suggestions.is_empty() {
        suggestions.push(format!("• Test the connection manually: ssh {} sudo true", destination));
    }

    suggestions
}
