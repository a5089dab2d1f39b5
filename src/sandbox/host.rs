use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{ExecutionError, ExecutionRecord, Executor};

/// How long to keep reading output after the child is gone. A descendant
/// that inherited the pipe can keep it open past this point; whatever was
/// read by then is what gets logged.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// `ETXTBSY` means someone still has the artifact open for writing,
/// usually the dropper finishing its copy.
const BUSY_RETRIES: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runs artifacts directly on the host.
///
/// The child gets no arguments, a null stdin, and inherits the sentinel's
/// working directory and environment. Stdout and stderr share one pipe so
/// the captured stream keeps the order the child wrote in. Each artifact
/// leads its own process group, which is killed as a whole on timeout.
pub struct HostExecutor {
    timeout: Duration,
}

impl HostExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(&self, path: &Path) -> ExecutionRecord {
        let (reader, writer) = match std::io::pipe() {
            Ok(pair) => pair,
            Err(e) => return ExecutionRecord::failure(Vec::new(), ExecutionError::Launch(e)),
        };
        let mut receiver = match pipe::Receiver::from_owned_fd(OwnedFd::from(reader)) {
            Ok(receiver) => receiver,
            Err(e) => return ExecutionRecord::failure(Vec::new(), ExecutionError::Launch(e)),
        };

        // The command owns the parent's copies of the write end; it has to be
        // dropped right after spawning or the reader never sees EOF.
        let spawned = {
            let mut command = Command::new(path);
            command
                .stdin(Stdio::null())
                .process_group(0)
                .kill_on_drop(true);
            match writer.try_clone() {
                Ok(stderr) => {
                    command.stdout(writer).stderr(stderr);
                    spawn_when_ready(&mut command, path).await
                }
                Err(e) => Err(e),
            }
        };

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return ExecutionRecord::failure(Vec::new(), ExecutionError::Launch(e)),
        };
        debug!("Spawned {} (pid {:?})", path.display(), child.id());

        let mut output = Vec::new();
        let error = {
            let reading = drain(&mut receiver, &mut output);
            tokio::pin!(reading);
            let mut drained = false;

            let waited = tokio::time::timeout(self.timeout, async {
                loop {
                    tokio::select! {
                        status = child.wait() => break status,
                        _ = &mut reading, if !drained => drained = true,
                    }
                }
            })
            .await;

            let error = match waited {
                Ok(Ok(status)) => status_error(status),
                Ok(Err(e)) => Some(ExecutionError::Wait(e)),
                Err(_) => {
                    kill_group(&mut child, path).await;
                    Some(ExecutionError::TimedOut(self.timeout))
                }
            };

            if !drained && tokio::time::timeout(DRAIN_GRACE, &mut reading).await.is_err() {
                warn!(
                    "Output pipe of {} still open {}s after exit, logging what was read",
                    path.display(),
                    DRAIN_GRACE.as_secs()
                );
            }
            error
        };

        match error {
            None => ExecutionRecord::success(output),
            Some(e) => ExecutionRecord::failure(output, e),
        }
    }

    fn description(&self) -> String {
        format!("host, no isolation (timeout {}s)", self.timeout.as_secs())
    }
}

/// Spawns `command`, retrying for a short while if the file is still
/// open for writing somewhere.
async fn spawn_when_ready(command: &mut Command, path: &Path) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Err(e) if e.kind() == std::io::ErrorKind::ExecutableFileBusy && attempt < BUSY_RETRIES => {
                attempt += 1;
                debug!("{} is busy, retrying ({attempt}/{BUSY_RETRIES})", path.display());
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

/// Reads the pipe until EOF. Cancel-safe: bytes read so far stay in `sink`.
async fn drain(receiver: &mut pipe::Receiver, sink: &mut Vec<u8>) {
    let mut chunk = [0u8; 8192];
    loop {
        match receiver.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading child output: {e}");
                break;
            }
        }
    }
}

/// SIGKILLs the artifact's whole process group, then reaps the leader.
async fn kill_group(child: &mut Child, path: &Path) {
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!("Failed to kill process group of {}: {e}", path.display());
        }
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill {} after timeout: {e}", path.display());
    }
}

fn status_error(status: ExitStatus) -> Option<ExecutionError> {
    use std::os::unix::process::ExitStatusExt;

    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(ExecutionError::Exit(code));
    }
    if let Some(signal) = status.signal() {
        return Some(ExecutionError::Signal(signal));
    }
    Some(ExecutionError::Exit(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Instant;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_successful_run_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "a.exe", "echo hello");
        let record = HostExecutor::new(Duration::from_secs(10)).execute(&path).await;
        assert!(record.error.is_none(), "unexpected error: {:?}", record.error);
        assert_eq!(record.output_text(), "hello\n");
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_are_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "mix.exe", "echo one\necho two >&2\necho three");
        let record = HostExecutor::new(Duration::from_secs(10)).execute(&path).await;
        assert_eq!(record.output_text(), "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "c.exe", "echo boom >&2\nexit 1");
        let record = HostExecutor::new(Duration::from_secs(10)).execute(&path).await;
        assert_eq!(record.output_text(), "boom\n");
        assert!(matches!(record.error, Some(ExecutionError::Exit(1))));
    }

    #[tokio::test]
    async fn test_killed_by_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "sig.exe", "kill -9 $$");
        let record = HostExecutor::new(Duration::from_secs(10)).execute(&path).await;
        assert!(matches!(record.error, Some(ExecutionError::Signal(9))));
    }

    #[tokio::test]
    async fn test_not_executable_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.exe");
        std::fs::write(&path, "not a program").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let record = HostExecutor::new(Duration::from_secs(10)).execute(&path).await;
        assert!(record.output.is_empty());
        assert!(matches!(record.error, Some(ExecutionError::Launch(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let record = HostExecutor::new(Duration::from_secs(10))
            .execute(&dir.path().join("gone.exe"))
            .await;
        assert!(matches!(record.error, Some(ExecutionError::Launch(_))));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "hang.exe", "echo started\nexec sleep 30");
        let started = Instant::now();
        let record = HostExecutor::new(Duration::from_millis(300)).execute(&path).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(record.output_text(), "started\n");
        match record.error {
            Some(ExecutionError::TimedOut(limit)) => assert_eq!(limit, Duration::from_millis(300)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let path = write_script(
            dir.path(),
            "spawner.exe",
            &format!("(sleep 1; touch '{}')\nwait", marker.display()),
        );
        let record = HostExecutor::new(Duration::from_millis(200)).execute(&path).await;
        assert!(matches!(record.error, Some(ExecutionError::TimedOut(_))));

        // The subshell would have created the file by now if it survived
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "descendant outlived the timeout kill");
    }

    #[test]
    fn test_background_descendant_does_not_hold_up_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "daemon.exe", "echo hi\nsleep 6 &");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let started = Instant::now();
        let record = rt.block_on(HostExecutor::new(Duration::from_secs(10)).execute(&path));
        assert!(record.error.is_none(), "unexpected error: {:?}", record.error);
        assert_eq!(record.output_text(), "hi\n");
        assert!(started.elapsed() < DRAIN_GRACE + Duration::from_secs(2));

        let dropping = Instant::now();
        drop(rt);
        assert!(dropping.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_busy_artifact_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "busy.exe", "echo ready");
        // An open write handle makes exec fail with ETXTBSY
        let handle = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            drop(handle);
        });

        let record = HostExecutor::new(Duration::from_secs(10)).execute(&path).await;
        assert!(record.error.is_none(), "unexpected error: {:?}", record.error);
        assert_eq!(record.output_text(), "ready\n");
    }

    #[test]
    fn test_description_mentions_timeout() {
        let executor = HostExecutor::new(Duration::from_secs(42));
        assert!(executor.description().contains("42s"));
    }
}
