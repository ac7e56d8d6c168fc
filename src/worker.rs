//! C5 SensorWorker, Supervisor-side half: spawning, liveness, RSS
//! enforcement, and the reconfigure/restart protocol (spec.md §4.5).
//!
//! Process isolation is required: each worker is a real OS process, spawned
//! by fork/exec'ing this same binary's hidden `sensor-run` subcommand
//! (REDESIGN FLAGS §9), never hosted in the Supervisor's address space.

use crate::error::WorkerError;
use crate::model::DataPoint;
use crate::registry;
use anyhow::{Context, Result};
use serde::Serialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// The reserved exit code a worker uses to signal "timed out" rather than
/// a generic crash, matched by the Supervisor's restart-reason logging.
pub const SENSOR_TIMEOUT_EXITCODE: i32 = 22;

#[derive(Debug, Clone)]
pub struct SpawnArgs {
    pub sensor_kind: String,
    pub config_id: String,
    pub target: String,
    pub target_id: String,
    pub config: serde_json::Value,
    pub memory_limit: u64,
    /// Path to the Spool database, so the isolated worker process can open
    /// its own `SensorStorage` handle (spec.md §4.2, C2).
    pub db_path: std::path::PathBuf,
}

#[derive(Debug, Serialize)]
struct Reconfigure {
    config: serde_json::Value,
}

pub struct WorkerHandle {
    pub args: SpawnArgs,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub async fn terminate(&mut self) -> Result<()> {
        self.child.start_kill().ok();
        Ok(())
    }

    /// Pushes a new config down the worker's single-slot stdin mailbox.
    /// Only meaningful for periodic sensors; event-driven sensors are
    /// reconfigured by terminate + respawn instead (spec.md §4.5).
    pub async fn reconfigure(&mut self, config: serde_json::Value) -> Result<()> {
        if let Some(stdin) = self.stdin.as_mut() {
            let mut line = serde_json::to_vec(&Reconfigure { config })?;
            line.push(b'\n');
            stdin.write_all(&line).await?;
        }
        Ok(())
    }
}

/// Spawns a worker process and a reader task that forwards its produced
/// DataPoints onto the shared multi-producer queue the Receiver drains.
pub fn spawn_worker(
    self_exe: &std::path::Path,
    args: SpawnArgs,
    results_tx: mpsc::Sender<DataPoint>,
) -> Result<WorkerHandle> {
    if registry::lookup(&args.sensor_kind).is_none() {
        return Err(WorkerError::UnknownKind(args.sensor_kind.clone()).into());
    }

    let mut command = Command::new(self_exe);
    command
        .arg("sensor-run")
        .arg("--kind")
        .arg(&args.sensor_kind)
        .arg("--config-id")
        .arg(&args.config_id)
        .arg("--target")
        .arg(&args.target)
        .arg("--target-id")
        .arg(&args.target_id)
        .arg("--config-json")
        .arg(args.config.to_string())
        .arg("--db-path")
        .arg(&args.db_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command.spawn().context("spawning sensor worker process")?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take().context("worker stdout not piped")?;

    let config_id = args.config_id.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<DataPoint>(&line) {
                        Ok(point) => {
                            if results_tx.try_send(point).is_err() {
                                tracing::warn!(%config_id, "result queue full, dropping point");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(%config_id, %err, "worker emitted an unparseable line");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%config_id, %err, "reading worker stdout failed");
                    break;
                }
            }
        }
    });

    Ok(WorkerHandle {
        args,
        child,
        stdin,
    })
}

/// Distinguishes "timed out" (exit code 22) from a generic crash for the
/// Supervisor's restart log line (spec.md §4.8, §8 scenario 5).
pub fn restart_reason(status: std::process::ExitStatus) -> &'static str {
    match status.code() {
        Some(SENSOR_TIMEOUT_EXITCODE) => "timed out",
        _ => "died",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_args(sensor_kind: &str) -> SpawnArgs {
        SpawnArgs {
            sensor_kind: sensor_kind.to_string(),
            config_id: "abcd".to_string(),
            target: "localhost".to_string(),
            target_id: "lh".to_string(),
            config: serde_json::json!({"sampling_period": 60}),
            memory_limit: 256 * 1024 * 1024,
            db_path: std::path::PathBuf::from("/tmp/does-not-matter.db"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn restart_reason_distinguishes_timeout_from_a_generic_crash() {
        use std::os::unix::process::ExitStatusExt;

        let timed_out = std::process::ExitStatus::from_raw(SENSOR_TIMEOUT_EXITCODE << 8);
        assert_eq!(restart_reason(timed_out), "timed out");

        let crashed = std::process::ExitStatus::from_raw(1 << 8);
        assert_eq!(restart_reason(crashed), "died");
    }

    #[test]
    fn spawn_worker_rejects_an_unknown_sensor_kind() {
        let (results_tx, _results_rx) = mpsc::channel(1);
        let result = spawn_worker(
            std::path::Path::new("/bin/true"),
            spawn_args("not_a_real_sensor_kind"),
            results_tx,
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_worker_spawns_a_real_child_process() {
        let (results_tx, _results_rx) = mpsc::channel(1);
        let mut handle = spawn_worker(
            std::path::Path::new("/bin/true"),
            spawn_args("uptime"),
            results_tx,
        )
        .expect("uptime is a registered sensor kind");

        assert!(handle.pid().is_some());
        handle.terminate().await.unwrap();
    }
}
