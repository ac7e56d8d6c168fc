//! C2 SensorStorage: per-sensor persistent key-value map backed directly by
//! the Spool connection (REDESIGN FLAGS §9: direct per-worker access to the
//! Spool DB under a per-key lock, chosen over a cross-process proxy dict
//! since storage already round-trips through the Spool on shutdown).

use crate::spool::SpoolHandle;
use anyhow::Result;

/// `sensor_kind + ':' + config_id`, matching the key shape the original
/// agent used for its storage dict names.
pub fn storage_key(sensor_kind: &str, config_id: &str) -> String {
    format!("{sensor_kind}:{config_id}")
}

#[derive(Clone)]
pub struct SensorStorage {
    spool: SpoolHandle,
    key: String,
}

impl SensorStorage {
    pub fn new(spool: SpoolHandle, sensor_kind: &str, config_id: &str) -> Self {
        Self {
            spool,
            key: storage_key(sensor_kind, config_id),
        }
    }

    /// Loads the stored map, defaulting to empty on first access or on a
    /// corrupt blob (the Spool layer already handles the corrupt-JSON reset).
    pub async fn load(&self) -> Result<serde_json::Value> {
        Ok(self
            .spool
            .get_storage(&self.key)
            .await?
            .unwrap_or_else(|| serde_json::json!({})))
    }

    pub async fn save(&self, value: serde_json::Value) -> Result<()> {
        self.spool.upsert_storage(&self.key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::spawn_spool_thread;
    use tempfile::TempDir;

    #[tokio::test]
    async fn first_access_defaults_to_empty_object() {
        let dir = TempDir::new().unwrap();
        let spool = spawn_spool_thread(dir.path().join("spool.db")).unwrap();
        let storage = SensorStorage::new(spool, "uptime", "abc");
        assert_eq!(storage.load().await.unwrap(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let spool = spawn_spool_thread(dir.path().join("spool.db")).unwrap();
        let storage = SensorStorage::new(spool, "uptime", "abc");
        storage.save(serde_json::json!({"n": 3})).await.unwrap();
        assert_eq!(storage.load().await.unwrap(), serde_json::json!({"n": 3}));
    }
}
