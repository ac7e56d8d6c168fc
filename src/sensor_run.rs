//! C5 SensorWorker, child-side half: the body that runs once this binary is
//! re-exec'd as `sentry-agent sensor-run ...`. One sensor instance per
//! process; crashes, infinite loops, or OOM here cannot touch the
//! Supervisor (spec.md §4.5).
//!
//! Individual sensor bodies are out of scope (spec.md §1); `do_run` below
//! is a minimal stand-in that still exercises the worker's real contract:
//! monotonic scheduling, timeout, result validation, reconfiguration, and
//! orphan detection.

use crate::model::{CommonSensorConfig, DataPoint, Value};
use crate::registry::{self, SensorKind};
use crate::sensor_storage::SensorStorage;
use crate::spool::spawn_spool_thread;
use crate::worker::SENSOR_TIMEOUT_EXITCODE;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::Instant;

pub struct RunArgs {
    pub sensor_kind: String,
    pub config_id: String,
    pub config: serde_json::Value,
    pub db_path: PathBuf,
}

/// Entry point called from `main.rs` for the hidden `sensor-run` subcommand.
/// Never returns on success for event-driven kinds; periodic kinds run
/// until the parent process disappears or the watch channel closes.
pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let kind = registry::lookup(&args.sensor_kind)
        .ok_or_else(|| anyhow::anyhow!("unknown sensor kind `{}`", args.sensor_kind))?;

    install_signal_handlers();
    let parent_pid_at_start = parent_pid();

    // Each isolated worker process opens its own Spool connection (same file,
    // same actor-thread shape as the Supervisor's) so it can read/write its
    // own per-sensor storage entry across the process boundary (spec.md §4.2).
    let spool = spawn_spool_thread(args.db_path.clone())?;
    let storage = SensorStorage::new(spool, &args.sensor_kind, &args.config_id);

    let (config_tx, config_rx) = watch::channel(args.config.clone());
    spawn_stdin_reader(config_tx);

    if kind.periodic {
        run_periodic(kind, &args.config_id, config_rx, parent_pid_at_start, &storage).await
    } else {
        run_event_driven(kind, &args.config_id, args.config, &storage).await
    }
}

fn install_signal_handlers() {
    #[cfg(unix)]
    {
        // Workers ignore interactive interrupts so a terminal-wide Ctrl-C
        // does not kill them out from under the Supervisor; SIGTERM keeps
        // its default (process-terminating) disposition.
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_IGN);
        }
    }
}

fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::getppid() as u32 }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Reads reconfigure lines pushed by the Supervisor on our stdin and
/// publishes them through a single-slot watch channel -- the async
/// equivalent of the spec's per-worker single-slot mailbox.
fn spawn_stdin_reader(config_tx: watch::Sender<serde_json::Value>) {
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            #[derive(serde::Deserialize)]
            struct Reconfigure {
                config: serde_json::Value,
            }
            match serde_json::from_str::<Reconfigure>(&line) {
                Ok(msg) => {
                    let _ = config_tx.send(msg.config);
                }
                Err(err) => tracing::warn!(%err, "unparseable reconfigure message"),
            }
        }
    });
}

async fn run_periodic(
    kind: &'static SensorKind,
    config_id: &str,
    mut config_rx: watch::Receiver<serde_json::Value>,
    parent_pid_at_start: u32,
    storage: &SensorStorage,
) -> anyhow::Result<()> {
    loop {
        // Atomically swap in whatever config is current at the top of this
        // tick; `borrow_and_update` clears the "changed" flag for us.
        let config = config_rx.borrow_and_update().clone();
        let common = CommonSensorConfig::from_json(&config);
        let sampling_period = Duration::from_secs(common.sampling_period.unwrap_or(60));
        let run_timeout = Duration::from_secs(common.run_timeout.unwrap_or(30));

        let tick_start = Instant::now();
        let outcome = tokio::time::timeout(run_timeout, do_run(kind, storage)).await;
        match outcome {
            Err(_elapsed) => {
                // Distinguished exit code so the Supervisor logs "timed out"
                // instead of "died" (spec.md §4.5, §8 scenario 5).
                std::process::exit(SENSOR_TIMEOUT_EXITCODE);
            }
            Ok(produced) => {
                emit(kind, config_id, produced).await?;
            }
        }

        let elapsed = tick_start.elapsed();
        let sleep_for = sampling_period.checked_sub(elapsed).unwrap_or_else(|| {
            tracing::warn!(config_id, "sensor run is behind schedule, running immediately");
            Duration::ZERO
        });
        tokio::time::sleep(sleep_for).await;

        if parent_pid() != parent_pid_at_start {
            // Orphan protection: our parent changed out from under us.
            return Ok(());
        }
    }
}

async fn run_event_driven(
    kind: &'static SensorKind,
    config_id: &str,
    config: serde_json::Value,
    storage: &SensorStorage,
) -> anyhow::Result<()> {
    let _ = config;
    loop {
        let produced = do_run(kind, storage).await;
        emit(kind, config_id, produced).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Stand-in sensor body: individual sensor implementations are out of
/// scope. Each registered kind emits a plausible reading on its declared
/// streams so the worker's scheduling/validation/emission contract is
/// exercised end to end, including a genuine round trip through the
/// per-sensor storage entry (spec.md §4.2).
async fn do_run(kind: &SensorKind, storage: &SensorStorage) -> Vec<(&'static str, Value)> {
    if let Err(err) = record_run(storage).await {
        tracing::warn!(%err, "failed to update sensor storage");
    }

    match kind.name {
        "uptime" => {
            let uptime_secs = System::uptime() as i64;
            vec![("uptime", Value::Duration(uptime_secs))]
        }
        "loadavg" => {
            let load = System::load_average();
            vec![
                ("load1", Value::Float(load.one)),
                ("load5", Value::Float(load.five)),
                ("load15", Value::Float(load.fifteen)),
            ]
        }
        "check_http" => vec![
            ("status_code", Value::Integer(0)),
            ("latency_ms", Value::Float(0.0)),
        ],
        "netstat" => vec![("connections", Value::Integer(0))],
        _ => Vec::new(),
    }
}

/// Bumps this sensor's persisted run counter, the minimal genuine
/// read-modify-write a sensor body performs against its storage entry.
async fn record_run(storage: &SensorStorage) -> anyhow::Result<()> {
    let mut state = storage.load().await?;
    let count = state.get("run_count").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
    state["run_count"] = serde_json::json!(count);
    storage.save(state).await?;
    Ok(())
}

/// Validates each produced (stream, value) pair against the sensor kind's
/// declared contract, routing failures onto the `error` stream instead of
/// dropping them silently (spec.md §4.5).
fn build_datapoints(
    kind: &SensorKind,
    config_id: &str,
    produced: Vec<(&'static str, Value)>,
) -> Vec<DataPoint> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    produced
        .into_iter()
        .map(|(stream, value)| match registry::validate_stream_value(kind, stream, &value) {
            Ok(datatype) => DataPoint {
                config_id: config_id.to_string(),
                stream_name: stream.to_string(),
                datatype,
                value,
                timestamp_ms: now_ms,
            },
            Err(reason) => DataPoint {
                config_id: config_id.to_string(),
                stream_name: crate::model::IMPLICIT_ERROR_STREAM.to_string(),
                datatype: crate::model::DataType::String,
                value: Value::String(reason),
                timestamp_ms: now_ms,
            },
        })
        .collect()
}

async fn emit(
    kind: &SensorKind,
    config_id: &str,
    produced: Vec<(&'static str, Value)>,
) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    for point in build_datapoints(kind, config_id, produced) {
        let mut line = serde_json::to_vec(&point)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
    }
    stdout.flush().await?;
    Ok(())
}

/// Runs a sensor kind's body exactly once in-process, without forking a
/// worker or installing signal handlers. Backs the `test-sensors` CLI
/// command (spec.md §6).
pub async fn test_once(sensor_kind: &str, config_id: &str, db_path: &std::path::Path) -> anyhow::Result<Vec<DataPoint>> {
    let kind = registry::lookup(sensor_kind)
        .ok_or_else(|| anyhow::anyhow!("unknown sensor kind `{sensor_kind}`"))?;
    let spool = spawn_spool_thread(db_path.to_path_buf())?;
    let storage = SensorStorage::new(spool, sensor_kind, config_id);
    let produced = do_run(kind, &storage).await;
    Ok(build_datapoints(kind, config_id, produced))
}
