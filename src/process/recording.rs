use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::process::{ExitStatus, ProcessEvent, ProcessHandle, ProcessLauncher};

type Script = Arc<dyn Fn(&Launch) -> Vec<ProcessEvent> + Send + Sync>;

/// In-memory launcher for tests.
///
/// Every launch is recorded together with a snapshot of the file named by its
/// last argument, taken at launch time. No process is started; events are
/// either replayed from a script or emitted by the test through
/// [`Launch::emit`].
///
/// - [`RecordingLauncher::new`]: every process exits with code zero
/// - [`RecordingLauncher::replaying`]: every process reports the given events
/// - [`RecordingLauncher::scripted`]: events are computed per launch
/// - [`RecordingLauncher::manual`]: events are emitted by the test
#[derive(Clone)]
pub struct RecordingLauncher {
    launches: Arc<Mutex<Vec<Launch>>>,
    script: Option<Script>,
}

impl RecordingLauncher {
    /// Launcher whose processes exit successfully right away.
    pub fn new() -> Self {
        Self::replaying(vec![ProcessEvent::Exited(ExitStatus::from_code(0))])
    }

    /// Launcher whose processes all report `events`.
    pub fn replaying(events: Vec<ProcessEvent>) -> Self {
        Self::scripted(move |_| events.clone())
    }

    /// Launcher computing the events of each process from its launch.
    pub fn scripted<F>(script: F) -> Self
    where
        F: Fn(&Launch) -> Vec<ProcessEvent> + Send + Sync + 'static,
    {
        Self {
            launches: Arc::default(),
            script: Some(Arc::new(script)),
        }
    }

    /// Launcher whose processes stay alive until the test emits their events.
    pub fn manual() -> Self {
        Self {
            launches: Arc::default(),
            script: None,
        }
    }

    /// Return every launch recorded so far, oldest first.
    pub async fn launches(&self) -> Vec<Launch> {
        self.launches.lock().await.clone()
    }
}

impl Default for RecordingLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// A launch recorded by [`RecordingLauncher`].
#[derive(Debug, Clone)]
pub struct Launch {
    /// Executable that was requested.
    pub executable: String,
    /// Arguments that were passed.
    pub args: Vec<String>,
    /// Contents of the file named by the last argument when the process was
    /// launched, if it named a readable file.
    pub staged: Option<String>,
    control: Option<mpsc::Sender<ProcessEvent>>,
}

impl Launch {
    /// Value following `flag` in the arguments, e.g. `-t` for the topic.
    pub fn arg(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }

    /// Report `event` from a process launched by a manual launcher.
    ///
    /// Returns `false` when the launcher is not manual or nobody listens to
    /// the process anymore.
    pub async fn emit(&self, event: ProcessEvent) -> bool {
        match &self.control {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ProcessLauncher for RecordingLauncher {
    async fn launch(&self, executable: &str, args: &[String]) -> std::io::Result<ProcessHandle> {
        let staged = match args.last() {
            Some(path) => tokio::fs::read_to_string(path).await.ok(),
            None => None,
        };

        let mut launch = Launch {
            executable: executable.to_owned(),
            args: args.to_vec(),
            staged,
            control: None,
        };

        let rx = match &self.script {
            Some(script) => {
                let events = script(&launch);
                let (tx, rx) = mpsc::channel(events.len().max(1));
                for event in events {
                    // Capacity covers every scripted event
                    let _ = tx.try_send(event);
                }
                rx
            }
            None => {
                let (tx, rx) = mpsc::channel(16);
                launch.control = Some(tx);
                rx
            }
        };

        tracing::debug!(executable, ?args, "Recorded process launch");
        self.launches.lock().await.push(launch);

        Ok(ProcessHandle::new(None, rx))
    }
}
