use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::reader;
use crate::error::{Result, StampError};

/// How long `stop` waits for a graceful exit before killing.
const STOP_GRACE: Duration = Duration::from_secs(2);

const STAY_OPEN_ARGS: [&str; 4] = ["-stay_open", "True", "-@", "-"];
const END_SESSION: &[u8] = b"-stay_open\nFalse\n";

/// A live exiftool process in `-stay_open` mode.
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) lines: UnboundedReceiver<String>,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn abort_readers(&self) {
        self.reader.abort();
        self.stderr.abort();
    }
}

/// Keeps zero or one exiftool process alive.
///
/// The process is started lazily by [`ensure_started`](Self::ensure_started)
/// and respawned the same way after [`restart_after_failure`](Self::restart_after_failure);
/// callers cannot tell a first start from a restart.
pub struct ProcessSupervisor {
    program: PathBuf,
    version: String,
    handle: Option<ProcessHandle>,
    spawned: u64,
}

impl ProcessSupervisor {
    /// Probe `program -ver` and build a supervisor with no process running.
    ///
    /// A missing or broken exiftool is fatal here and is not retried.
    pub async fn new(program: impl Into<PathBuf>, probe_timeout: Duration) -> Result<Self> {
        let program = program.into();
        let version = probe_version(&program, probe_timeout).await?;
        log::info!("ExifTool {version} loaded: {}", program.display());
        Ok(Self {
            program,
            version,
            handle: None,
            spawned: 0,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.spawned
    }

    pub fn is_running(&mut self) -> bool {
        self.handle.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    /// Return the live handle, spawning a process if there is none.
    pub fn ensure_started(&mut self) -> Result<&mut ProcessHandle> {
        if !self.is_running() {
            if let Some(dead) = self.handle.take() {
                log::warn!("exiftool (pid {:?}) exited unexpectedly; respawning", dead.pid);
                dead.abort_readers();
            }
            let handle = self.spawn()?;
            self.handle = Some(handle);
        }
        self.handle
            .as_mut()
            .ok_or_else(|| StampError::Protocol("exiftool handle missing after spawn".into()))
    }

    /// End the session gracefully, killing the process if it lingers.
    /// Safe to call when nothing is running.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        log::debug!("Stopping exiftool (pid {:?})", handle.pid);
        let end_session = async {
            handle.stdin.write_all(END_SESSION).await?;
            handle.stdin.flush().await
        };
        let _ = tokio::time::timeout(STOP_GRACE, end_session).await;

        match tokio::time::timeout(STOP_GRACE, handle.child.wait()).await {
            Ok(Ok(status)) => log::debug!("exiftool exited with {status}"),
            _ => {
                log::warn!("exiftool (pid {:?}) did not exit; killing", handle.pid);
                let _ = handle.child.kill().await;
            }
        }
        handle.abort_readers();
    }

    /// Kill the process (ignoring errors) and forget it. The next
    /// `ensure_started` spawns a fresh one.
    pub async fn restart_after_failure(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            log::warn!("Killing exiftool (pid {:?}) after failure", handle.pid);
            let _ = handle.child.kill().await;
            handle.abort_readers();
        }
    }

    fn spawn(&mut self) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&self.program);
        cmd.args(STAY_OPEN_ARGS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StampError::Protocol("exiftool stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StampError::Protocol("exiftool stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StampError::Protocol("exiftool stderr not captured".into()))?;

        let (lines, reader) = reader::spawn_stdout_reader(stdout, pid);
        let stderr = reader::spawn_stderr_logger(stderr, pid);

        self.spawned += 1;
        log::debug!("exiftool started in stay_open mode (pid {pid:?})");

        Ok(ProcessHandle {
            pid,
            child,
            stdin,
            lines,
            reader,
            stderr,
        })
    }
}

async fn probe_version(program: &Path, timeout: Duration) -> Result<String> {
    let unavailable = |reason: String| StampError::ProcessUnavailable {
        path: program.to_path_buf(),
        reason,
    };

    let mut cmd = Command::new(program);
    cmd.arg("-ver")
        .stdin(Stdio::null())
        .kill_on_drop(true);
    hide_console(&mut cmd);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| unavailable(format!("version probe timed out after {timeout:?}")))?
        .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(unavailable(format!("-ver exited with {}", output.status)));
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        return Err(unavailable("-ver printed nothing".into()));
    }
    Ok(version)
}

#[cfg(windows)]
fn hide_console(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_cmd: &mut Command) {}
