use std::process::Stdio;

use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};

use crate::process::{ExitStatus, ProcessEvent, ProcessHandle, ProcessLauncher};

/// Launcher running real processes through `tokio::process`.
///
/// Standard output and standard error are piped and read line by line. Lines
/// are decoded lossily: invalid UTF-8 is replaced, never dropped. The
/// termination event is sent once both streams are drained, so no output is
/// reported after [`ProcessEvent::Exited`].
///
/// If the [`ProcessHandle`] is dropped before the process exits, the process
/// is killed.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    channel_size: usize,
}

impl CommandLauncher {
    /// Create a launcher with the default event buffer.
    pub fn new() -> Self {
        Self { channel_size: 64 }
    }

    /// Set the number of events buffered before the process is back-pressured.
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProcessLauncher for CommandLauncher {
    #[tracing::instrument(skip(self))]
    async fn launch(&self, executable: &str, args: &[String]) -> std::io::Result<ProcessHandle> {
        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

        let (tx, rx) = mpsc::channel(self.channel_size);

        tokio::spawn(async move {
            let run = async {
                tokio::join!(
                    forward_lines(stdout, &tx, ProcessEvent::Stdout),
                    forward_lines(stderr, &tx, ProcessEvent::Stderr),
                );
                match child.wait().await {
                    Ok(status) => ExitStatus::from(status),
                    Err(error) => {
                        tracing::error!(?error, pid, "Failed to collect process status");
                        ExitStatus::unknown()
                    }
                }
            };

            tokio::select! {
                status = run => {
                    let _ = tx.send(ProcessEvent::Exited(status)).await;
                }
                // Handle dropped; `child` is killed when this task returns
                _ = tx.closed() => {
                    tracing::debug!(pid, "Process handle dropped, killing process");
                }
            }
        });

        Ok(ProcessHandle::new(pid, rx))
    }
}

async fn forward_lines<R>(
    reader: R,
    tx: &mpsc::Sender<ProcessEvent>,
    event: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let line = decode_line(&buf);
                if tx.send(event(line)).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                tracing::warn!(?error, "Failed to read process output");
                return;
            }
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect(mut handle: ProcessHandle) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn reports_output_then_exit_status() {
        let handle = CommandLauncher::new()
            .launch(
                "sh",
                &["-c".to_owned(), "echo out; echo err >&2; exit 3".to_owned()],
            )
            .await
            .unwrap();

        assert!(handle.pid().is_some());

        let events = collect(handle).await;

        assert!(events.contains(&ProcessEvent::Stdout("out".into())));
        assert!(events.contains(&ProcessEvent::Stderr("err".into())));
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.last(),
            Some(&ProcessEvent::Exited(ExitStatus::from_code(3)))
        );
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_stop_the_reader() {
        let handle = CommandLauncher::new()
            .launch(
                "sh",
                &[
                    "-c".to_owned(),
                    r"printf 'bad \377 byte\n' >&2; echo 'broker down' >&2; exit 0".to_owned(),
                ],
            )
            .await
            .unwrap();

        let events = collect(handle).await;

        assert_eq!(
            events,
            vec![
                ProcessEvent::Stderr("bad \u{FFFD} byte".into()),
                ProcessEvent::Stderr("broker down".into()),
                ProcessEvent::Exited(ExitStatus::from_code(0)),
            ]
        );
    }

    #[test]
    fn decode_line_strips_line_endings() {
        assert_eq!(decode_line(b"out\r\n"), "out");
        assert_eq!(decode_line(b"last"), "last");
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn missing_executable_fails_to_launch() {
        let result = CommandLauncher::new()
            .launch("/nonexistent/elytron-test-binary", &[])
            .await;

        assert!(result.is_err());
    }
}
