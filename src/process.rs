//! External process abstraction.
//!
//! Publishing and consuming are delegated to an external client (kafkacat).
//! This module defines the seam the rest of the crate uses to run it:
//!
//! - [`ProcessLauncher`]: Trait for starting a process from an executable and
//!   arguments
//! - [`ProcessHandle`]: Event stream of a running process
//! - [`ProcessEvent`]: Output, diagnostic output and termination events
//!
//! [`CommandLauncher`] runs real processes through `tokio::process`, while
//! [`RecordingLauncher`] records launches and replays scripted events for
//! tests.

mod command;
mod recording;

use tokio::sync::mpsc;

pub use command::CommandLauncher;
pub use recording::{Launch, RecordingLauncher};

/// Trait implemented by process spawning backends.
///
/// Launchers are injected into the [`Producer`](crate::Producer) at
/// construction time so the spawn mechanism can be swapped without touching
/// any other component.
#[async_trait::async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start `executable` with `args` and return a handle on its events.
    async fn launch(&self, executable: &str, args: &[String]) -> std::io::Result<ProcessHandle>;
}

/// Event reported by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A line written to standard output.
    Stdout(String),
    /// A line written to standard error.
    Stderr(String),
    /// The process terminated. Always the last event.
    Exited(ExitStatus),
}

/// Termination status of a process.
///
/// `code` is `None` when the process was killed by a signal or its status
/// could not be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus {
    code: Option<i32>,
}

impl ExitStatus {
    /// Status of a process that exited with `code`.
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Status of a process whose exit code is unknown.
    pub fn unknown() -> Self {
        Self { code: None }
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// `true` when the process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code}"),
            None => write!(f, "unknown"),
        }
    }
}

/// Handle on a launched process.
///
/// Events are delivered in the order the process produced them, with
/// [`ProcessEvent::Exited`] last. Dropping the handle tells the launcher
/// nobody is listening anymore; [`CommandLauncher`] kills the process in that
/// case.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    events: mpsc::Receiver<ProcessEvent>,
}

impl ProcessHandle {
    /// Wrap an event channel fed by a launcher backend.
    pub fn new(pid: Option<u32>, events: mpsc::Receiver<ProcessEvent>) -> Self {
        Self { pid, events }
    }

    /// OS process id, when the backend runs a real process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the backend has nothing more to report.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }
}
