//! Long-lived child processes started on a server.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{self, Read};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};

/// Whether a child is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(i32),
}

/// A spawned process whose output can be consumed incrementally.
pub trait ChildProcess: Send {
    fn id(&self) -> u32;

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Exit code if the process has finished, without blocking.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    fn wait(&mut self) -> io::Result<i32>;

    /// Asks the process (and its process group) to exit.
    fn terminate(&mut self) -> io::Result<()>;

    fn status(&mut self) -> io::Result<ProcessStatus> {
        Ok(match self.try_wait()? {
            Some(code) => ProcessStatus::Exited(code),
            None => ProcessStatus::Running,
        })
    }
}

/// Exit code of a finished process; signals map to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Sends SIGTERM to the process group led by `pid`. A group that is
/// already gone is not an error.
pub fn terminate_group(pid: u32) -> io::Result<()> {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// A process spawned through `std::process`, leading its own process group.
pub struct SpawnedProcess {
    child: Child,
}

impl SpawnedProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ChildProcess for SpawnedProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn wait(&mut self) -> io::Result<i32> {
        Ok(exit_code(self.child.wait()?))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        terminate_group(self.child.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    #[test]
    fn test_exit_code_of_finished_process() {
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let mut process = SpawnedProcess::new(child);
        assert_eq!(process.wait().unwrap(), 3);
        assert_eq!(process.status().unwrap(), ProcessStatus::Exited(3));
        // already exited, nothing to signal
        process.terminate().unwrap();
    }

    #[test]
    fn test_terminate_running_group() {
        let child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let mut process = SpawnedProcess::new(child);
        assert_eq!(process.status().unwrap(), ProcessStatus::Running);
        process.terminate().unwrap();
        assert_eq!(process.wait().unwrap(), 128 + 15);
    }
}
