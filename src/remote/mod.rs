//! Command execution on the physical servers of a cluster.
//!
//! Everything that touches a server goes through a [`CommandRunner`]:
//! the ssh-backed [`SshExecutor`] in production, the scripted runner of the
//! `testing` feature in tests.

pub mod cancel;
pub mod connections;
pub mod executor;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod precheck;
pub mod process;
pub mod retry;
pub mod versions;

pub use cancel::{clear_interrupt, install_interrupt_handler, interrupted, CancellationToken};
pub use connections::{ChannelPurpose, ConnectionCache, ControlChannel};
pub use executor::{Cleanup, CommandRunner, ExecutionResult, RunOptions, SshExecutor};
pub use precheck::precheck;
pub use process::{ChildProcess, ProcessStatus, SpawnedProcess};
pub use retry::{diagnose_ssh_error, retry_with_backoff, RetryConfig};
pub use versions::OvsVersionCache;
