//! C8 Supervisor: owns the Spool/Transport, starts Receiver and Shipper,
//! runs the clock-sync precheck, and drives the per-second main loop that
//! diffs the remote config against running workers (spec.md §4.8).

use crate::config::{load_agent_config, save_agent_config, Settings};
use crate::model::{AgentConfig, DataPoint, DataType, ReservedSensors, Value};
use crate::registry;
use crate::sensor_storage::SensorStorage;
use crate::spool::SpoolHandle;
use crate::transport::Transport;
use crate::worker::{self, SpawnArgs, WorkerHandle};
use anyhow::{bail, Context, Result};
use sha2::Digest;
use std::collections::HashMap;
use std::path::PathBuf;
use sysinfo::{Pid, System};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

const CONFIG_REFETCH_TICKS: u32 = 60;
const CLOCK_SYNC_ATTEMPTS: u32 = 5;
const CLOCK_SYNC_RETRY_DELAY: Duration = Duration::from_secs(10);
const CONFIG_FETCH_ATTEMPTS: u32 = 5;

pub struct Supervisor {
    settings: Settings,
    self_exe: PathBuf,
    spool: SpoolHandle,
    transport: Transport,
    results_tx: mpsc::Sender<DataPoint>,
    workers: HashMap<String, WorkerHandle>,
    reserved: ReservedSensors,
    applied_config_digest: SensorStorage,
    /// The descriptor last applied to each running worker, so
    /// `diff_and_apply` can skip reconfigure/respawn when nothing actually
    /// changed (spec.md §8 P7: re-applying the same config is a no-op).
    last_applied: HashMap<String, crate::model::SensorDescriptor>,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        self_exe: PathBuf,
        spool: SpoolHandle,
        transport: Transport,
        results_tx: mpsc::Sender<DataPoint>,
    ) -> Self {
        let applied_config_digest = SensorStorage::new(spool.clone(), "_supervisor", "agent_config");
        Self {
            settings,
            self_exe,
            spool,
            transport,
            results_tx,
            workers: HashMap::new(),
            reserved: ReservedSensors::default(),
            applied_config_digest,
            last_applied: HashMap::new(),
        }
    }

    /// Emits a DataPoint for one of the two reserved sensors (`_error`,
    /// `_conf_applied`) if the remote config assigned it a `config_id`
    /// (spec.md §3: reserved sensors route internal notifications, not
    /// sensor-produced results).
    fn emit_reserved(&self, config_id: &Option<String>, stream: &str, value: Value) {
        let Some(config_id) = config_id.clone() else {
            return;
        };
        let datatype = match &value {
            Value::String(_) => DataType::String,
            Value::Bool(_) => DataType::Bool,
            _ => DataType::String,
        };
        let point = DataPoint {
            config_id,
            stream_name: stream.to_string(),
            datatype,
            value,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        if self.results_tx.try_send(point).is_err() {
            tracing::warn!("result queue full, dropped a reserved-sensor notification");
        }
    }

    pub async fn fetch_remote_config(&self) -> Result<AgentConfig> {
        fetch_remote_config(&self.transport).await
    }

    /// Validates and persists `config`, applying it against the running
    /// workers. An invalid config is rejected and the last valid one kept
    /// (spec.md §7 "Config invalid").
    pub async fn apply_remote_config(&mut self, mut config: AgentConfig) {
        if let Err(reason) = config.validate() {
            tracing::error!(%reason, "rejected invalid remote config, keeping the last valid one");
            self.emit_reserved(&self.reserved.error_id.clone(), "error", Value::String(reason));
            return;
        }
        self.reserved = config.extract_reserved();
        if let Err(err) = save_agent_config(&self.settings.config_path, &config) {
            tracing::error!(%err, "failed to persist agent config");
        }

        // diff_and_apply always runs: it is idempotent against the live
        // worker map, which starts empty on every process restart even when
        // the persisted config digest is unchanged from last run.
        self.diff_and_apply(&config).await;

        let digest = hex::encode(sha2::Sha256::digest(
            serde_json::to_vec(&config).unwrap_or_default(),
        ));
        let previous = self
            .applied_config_digest
            .load()
            .await
            .ok()
            .and_then(|v| v.get("digest").and_then(|d| d.as_str()).map(str::to_string));
        if previous.as_deref() != Some(digest.as_str()) {
            if let Err(err) = self
                .applied_config_digest
                .save(serde_json::json!({ "digest": digest }))
                .await
            {
                tracing::warn!(%err, "failed to persist applied config digest");
            }
            self.emit_reserved(
                &self.reserved.config_applied_id.clone(),
                "status",
                Value::Bool(true),
            );
        }
    }

    pub fn load_persisted_config(&mut self) -> AgentConfig {
        let mut config = load_agent_config(&self.settings.config_path);
        self.reserved = config.extract_reserved();
        config
    }

    /// Adds/removes/reconfigures workers to match `want` (spec.md §4.8).
    /// A descriptor unchanged since the last call is left entirely alone --
    /// no reconfigure message, no terminate, no respawn (spec.md §8 P7:
    /// re-applying an identical config is a no-op), mirroring
    /// `original_source/whmonit/client/agent.py`'s per-sensor `config !=
    /// self.config` gate.
    async fn diff_and_apply(&mut self, want: &AgentConfig) {
        let want_map = want.by_config_id();

        let have_ids: Vec<String> = self.workers.keys().cloned().collect();
        for config_id in &have_ids {
            if !want_map.contains_key(config_id.as_str()) {
                if let Some(mut worker) = self.workers.remove(config_id) {
                    tracing::info!(%config_id, "sensor removed from config, terminating worker");
                    let _ = worker.terminate().await;
                }
                self.last_applied.remove(config_id);
            }
        }

        for (config_id, descriptor) in want_map.iter() {
            let kind = match registry::lookup(&descriptor.sensor) {
                Some(kind) => kind,
                None => {
                    tracing::error!(sensor = %descriptor.sensor, "unknown sensor kind, skipping");
                    continue;
                }
            };

            let unchanged = self.last_applied.get(*config_id) == Some(*descriptor);
            if unchanged && self.workers.contains_key(*config_id) {
                continue;
            }

            if let Some(worker) = self.workers.get_mut(*config_id) {
                if kind.periodic {
                    if let Err(err) = worker.reconfigure(descriptor.config.clone()).await {
                        tracing::error!(%err, %config_id, "failed to push reconfigure");
                    }
                    self.last_applied.insert((*config_id).to_string(), (*descriptor).clone());
                    continue;
                } else {
                    // Event-driven: reconfiguration means terminate + respawn.
                    let _ = worker.terminate().await;
                    self.workers.remove(*config_id);
                }
            }

            let common = crate::model::CommonSensorConfig::from_json(&descriptor.config);
            let spawn_args = SpawnArgs {
                sensor_kind: descriptor.sensor.clone(),
                config_id: descriptor.config_id.clone(),
                target: descriptor.target.clone(),
                target_id: descriptor.target_id.clone(),
                config: descriptor.config.clone(),
                memory_limit: common.memory_limit.unwrap_or(256 * 1024 * 1024),
                db_path: self.settings.db_path.clone(),
            };
            match worker::spawn_worker(&self.self_exe, spawn_args, self.results_tx.clone()) {
                Ok(handle) => {
                    tracing::info!(config_id = %config_id, sensor = %descriptor.sensor, "spawned sensor worker");
                    self.workers.insert((*config_id).to_string(), handle);
                    self.last_applied.insert((*config_id).to_string(), (*descriptor).clone());
                }
                Err(err) => tracing::error!(%err, %config_id, "failed to spawn sensor worker"),
            }
        }
    }

    /// The per-second main loop: periodic config refetch, RSS enforcement,
    /// and liveness/restart (spec.md §4.8). Returns once a shutdown signal
    /// has been observed.
    pub async fn run_main_loop(mut self) -> Result<()> {
        let mut tick = interval(Duration::from_secs(1));
        let mut ticks_until_refetch = 0u32;
        let mut system = System::new_all();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received, cleaning up");
                    break;
                }
            }

            if ticks_until_refetch == 0 {
                match self.fetch_remote_config().await {
                    Ok(config) => self.apply_remote_config(config).await,
                    Err(err) => tracing::error!(%err, "periodic remote config fetch failed"),
                }
                if let Ok(status) = self.spool.status().await {
                    tracing::debug!(backlog_rows = status.backlog_rows, "spool backlog");
                }
                ticks_until_refetch = CONFIG_REFETCH_TICKS;
            }
            ticks_until_refetch -= 1;

            self.enforce_memory_limits(&mut system).await;
            self.restart_dead_workers().await;
        }

        self.cleanup().await;
        Ok(())
    }

    async fn enforce_memory_limits(&mut self, system: &mut System) {
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let mut over_limit = Vec::new();
        for (config_id, worker) in self.workers.iter() {
            if worker.args.memory_limit == 0 {
                continue;
            }
            let Some(pid) = worker.pid() else { continue };
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                if process.memory() > worker.args.memory_limit {
                    over_limit.push(config_id.clone());
                }
            }
        }
        for config_id in over_limit {
            if let Some(worker) = self.workers.get_mut(&config_id) {
                tracing::warn!(%config_id, "worker exceeded memory_limit, terminating");
                let _ = worker.terminate().await;
            }
        }
    }

    async fn restart_dead_workers(&mut self) {
        let mut to_restart = Vec::new();
        for (config_id, worker) in self.workers.iter_mut() {
            if let Ok(Some(status)) = worker.try_wait().await {
                let reason = worker::restart_reason(status);
                tracing::error!(%config_id, reason, "sensor worker exited");
                to_restart.push(config_id.clone());
            }
        }
        for config_id in to_restart {
            if let Some(worker) = self.workers.remove(&config_id) {
                match worker::spawn_worker(&self.self_exe, worker.args.clone(), self.results_tx.clone()) {
                    Ok(handle) => {
                        self.workers.insert(config_id, handle);
                    }
                    Err(err) => tracing::error!(%err, %config_id, "failed to respawn sensor worker"),
                }
            }
        }
    }

    async fn cleanup(&mut self) {
        for (config_id, worker) in self.workers.iter_mut() {
            tracing::info!(%config_id, "stopping worker");
            let _ = worker.terminate().await;
        }
    }
}

/// Standalone clock-sync precheck, usable before a Supervisor exists (the
/// startup sequence runs this ahead of spawning any workers, spec.md §4.8).
pub async fn clock_sync_precheck(transport: &Transport, skew_bound: Duration) -> Result<()> {
    for attempt in 1..=CLOCK_SYNC_ATTEMPTS {
        match transport.get("/time/").await {
            Ok(resp) if resp.outcome() == crate::transport::Outcome::Success => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&resp.body).context("parsing /time/ response")?;
                let collector_now: i64 = parsed
                    .get("timestamp")
                    .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or(v.as_i64()))
                    .context("missing timestamp in /time/ response")?;
                let agent_now = chrono::Utc::now().timestamp_millis();
                let skew = (agent_now - collector_now).unsigned_abs();
                if skew > skew_bound.as_millis() as u64 {
                    bail!(
                        "clock skew {}ms exceeds bound {}ms, refusing to run",
                        skew,
                        skew_bound.as_millis()
                    );
                }
                return Ok(());
            }
            _ if attempt < CLOCK_SYNC_ATTEMPTS => {
                tokio::time::sleep(CLOCK_SYNC_RETRY_DELAY).await;
            }
            _ => bail!("could not reach collector for clock sync after {CLOCK_SYNC_ATTEMPTS} attempts"),
        }
    }
    bail!("clock sync precheck failed")
}

/// Standalone remote-config fetch, shared by the Supervisor's periodic
/// refetch and the one-shot `get-config` CLI command.
pub async fn fetch_remote_config(transport: &Transport) -> Result<AgentConfig> {
    for attempt in 1..=CONFIG_FETCH_ATTEMPTS {
        match transport.get("/agent_config/").await {
            Ok(resp) if resp.outcome() == crate::transport::Outcome::Success => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&resp.body).context("parsing /agent_config/ response")?;
                let config: AgentConfig = serde_json::from_value(
                    parsed.get("config").cloned().context("missing config field")?,
                )
                .context("deserializing remote config")?;
                return Ok(config);
            }
            _ if attempt < CONFIG_FETCH_ATTEMPTS => {
                tokio::time::sleep(CLOCK_SYNC_RETRY_DELAY).await;
            }
            _ => bail!("could not fetch remote config after {CONFIG_FETCH_ATTEMPTS} attempts"),
        }
    }
    bail!("remote config fetch failed")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SensorDescriptor;
    use crate::spool::spawn_spool_thread;
    use tempfile::TempDir;

    /// `/bin/true` stands in for the agent binary: it exits immediately
    /// without speaking the `sensor-run` stdout protocol, which is fine for
    /// these tests since they only assert on spawn/reconfigure/terminate
    /// call counts, never on produced DataPoints.
    fn test_supervisor(dir: &TempDir) -> Supervisor {
        let settings = Settings {
            config_path: dir.path().join("agentconfig.yaml"),
            webapi_url: "https://127.0.0.1:0".to_string(),
            agent_id: "test-agent".to_string(),
            hostname: "test-host".to_string(),
            db_path: dir.path().join("spool.db"),
            certs_dir: dir.path().to_path_buf(),
            clock_skew_bound: Duration::from_secs(600),
        };
        let spool = spawn_spool_thread(settings.db_path.clone()).unwrap();
        let transport = Transport::new(
            settings.webapi_url.clone(),
            settings.agent_id.clone(),
            settings.certs_dir.clone(),
        )
        .unwrap();
        let (results_tx, _results_rx) = mpsc::channel(16);
        Supervisor::new(settings, PathBuf::from("/bin/true"), spool, transport, results_tx)
    }

    fn descriptor(config_id: &str) -> SensorDescriptor {
        SensorDescriptor {
            sensor: "uptime".to_string(),
            config_id: config_id.to_string(),
            target: "localhost".to_string(),
            target_id: "lh".to_string(),
            config: serde_json::json!({"sampling_period": 60}),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reapplying_the_same_config_spawns_nothing_the_second_time() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        let config = AgentConfig { sensors: vec![descriptor("abcd")] };

        supervisor.diff_and_apply(&config).await;
        assert_eq!(supervisor.workers.len(), 1);
        let pid_before = supervisor.workers.get("abcd").unwrap().pid();

        // Re-applying an identical descriptor must not respawn the worker
        // (spec.md §8 P7).
        supervisor.diff_and_apply(&config).await;
        assert_eq!(supervisor.workers.len(), 1);
        let pid_after = supervisor.workers.get("abcd").unwrap().pid();
        assert_eq!(pid_before, pid_after);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn changing_a_periodic_descriptor_reconfigures_in_place_without_respawning() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        let mut config = AgentConfig { sensors: vec![descriptor("abcd")] };
        supervisor.diff_and_apply(&config).await;
        let pid_before = supervisor.workers.get("abcd").unwrap().pid();

        config.sensors[0].config = serde_json::json!({"sampling_period": 120});
        supervisor.diff_and_apply(&config).await;
        let pid_after = supervisor.workers.get("abcd").unwrap().pid();
        assert_eq!(pid_before, pid_after, "periodic sensors reconfigure via stdin, not respawn");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn removing_a_sensor_terminates_its_worker_and_forgets_it() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        let config = AgentConfig { sensors: vec![descriptor("abcd")] };
        supervisor.diff_and_apply(&config).await;
        assert_eq!(supervisor.workers.len(), 1);

        supervisor.diff_and_apply(&AgentConfig::default()).await;
        assert!(supervisor.workers.is_empty());
        assert!(supervisor.last_applied.is_empty());
    }
}
