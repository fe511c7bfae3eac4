use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::batch::Unit;
use super::reader::{Line, classify};
use super::supervisor::ProcessSupervisor;
use crate::error::{Result, StampError};
use crate::item::BatchResult;

/// Adaptive batch timeout: `max(floor, units * per_unit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub floor: Duration,
    pub per_unit: Duration,
}

impl TimeoutPolicy {
    pub fn for_units(&self, units: usize) -> Duration {
        let scaled = self
            .per_unit
            .checked_mul(u32::try_from(units).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);
        self.floor.max(scaled)
    }
}

/// Output exiftool printed for one unit, before its ready sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutput {
    pub target: PathBuf,
    pub lines: Vec<String>,
}

impl UnitOutput {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The error exiftool reported for this unit, if any.
    pub fn error(&self) -> Option<String> {
        let failed = self.lines.iter().any(|line| {
            let line = line.trim();
            line.contains("weren't updated due to errors") || line.starts_with("Error")
        });
        failed.then(|| {
            self.lines
                .iter()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("; ")
        })
    }

    pub fn is_ok(&self) -> bool {
        self.error().is_none()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

struct Session {
    supervisor: ProcessSupervisor,
    next_seq: u64,
}

/// Sole writer to exiftool's stdin.
///
/// One lock covers the whole send/await cycle, so concurrent callers queue
/// and each call's sentinels can only belong to that call.
pub struct ExecutionCoordinator {
    session: Mutex<Session>,
    timeouts: TimeoutPolicy,
    executions: AtomicU64,
}

impl ExecutionCoordinator {
    pub fn new(supervisor: ProcessSupervisor, timeouts: TimeoutPolicy) -> Self {
        Self {
            session: Mutex::new(Session {
                supervisor,
                next_seq: 1,
            }),
            timeouts,
            executions: AtomicU64::new(0),
        }
    }

    pub fn timeouts(&self) -> TimeoutPolicy {
        self.timeouts
    }

    /// Number of non-empty [`execute`](Self::execute) calls so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Send `units` and collect one output block per unit, in order.
    ///
    /// On timeout or desync the process is killed before returning, and the
    /// whole call fails: which units finished before the hang is unknowable.
    pub async fn execute(&self, units: &[Unit]) -> Result<Vec<UnitOutput>> {
        if units.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = self.session.lock().await;
        self.executions.fetch_add(1, Ordering::Relaxed);
        let first_seq = session.next_seq;
        session.next_seq += units.len() as u64;

        let mut script = String::new();
        for (offset, unit) in units.iter().enumerate() {
            unit.render(first_seq + offset as u64, &mut script);
        }

        let budget = self.timeouts.for_units(units.len());
        let outcome = exchange(&mut session.supervisor, &script, units, first_seq, budget).await;

        if let Err(ref e) = outcome {
            log::error!("exiftool batch of {} unit(s) failed: {e}", units.len());
            session.supervisor.restart_after_failure().await;
        }
        outcome
    }

    /// [`execute`](Self::execute) reduced to counts: every completed unit is a
    /// success, a failed call is `units` failures.
    pub async fn execute_counted(&self, units: &[Unit]) -> BatchResult {
        match self.execute(units).await {
            Ok(outputs) => BatchResult {
                success: outputs.len(),
                failed: 0,
            },
            Err(_) => BatchResult::all_failed(units.len()),
        }
    }

    /// End the exiftool session.
    pub async fn shutdown(&self) {
        self.session.lock().await.supervisor.stop().await;
    }

    pub async fn spawn_count(&self) -> u64 {
        self.session.lock().await.supervisor.spawn_count()
    }

    pub async fn version(&self) -> String {
        self.session.lock().await.supervisor.version().to_string()
    }
}

async fn exchange(
    supervisor: &mut ProcessSupervisor,
    script: &str,
    units: &[Unit],
    first_seq: u64,
    budget: Duration,
) -> Result<Vec<UnitOutput>> {
    let timed_out = || StampError::Timeout {
        units: units.len(),
        waited: budget,
    };
    let now = Instant::now();
    let deadline = now
        .checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));

    let handle = supervisor.ensure_started()?;
    // A stalled process stops draining stdin; once the pipe fills, the write
    // itself blocks, so it shares the reply deadline.
    let send = async {
        handle.stdin.write_all(script.as_bytes()).await?;
        handle.stdin.flush().await
    };
    tokio::time::timeout_at(deadline, send)
        .await
        .map_err(|_| timed_out())??;

    let mut outputs = Vec::with_capacity(units.len());
    let mut pending = Vec::new();

    while outputs.len() < units.len() {
        // A closed queue means the process died; it is handled like a timeout.
        let line = match tokio::time::timeout_at(deadline, handle.lines.recv()).await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return Err(timed_out()),
        };

        match classify(&line) {
            Line::Ready(seq) => {
                let expected = first_seq + outputs.len() as u64;
                if seq != Some(expected) {
                    return Err(StampError::Desync {
                        expected: format!("{{ready{expected}}}"),
                        got: line.clone(),
                    });
                }
                let unit = &units[outputs.len()];
                log::debug!("exiftool unit {expected} done: {}", unit.target().display());
                outputs.push(UnitOutput {
                    target: unit.target().to_path_buf(),
                    lines: std::mem::take(&mut pending),
                });
            }
            Line::Output(text) => pending.push(text.to_string()),
        }
    }

    Ok(outputs)
}
