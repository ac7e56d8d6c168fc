//! C1 Spool: the durable store between worker-produced results and the
//! network. Runs on a dedicated OS thread (same shape as the teacher's
//! segment-file spool) so SQLite's blocking I/O never sits on the async
//! runtime; callers talk to it over a cloneable command handle.

use crate::error::SpoolError;
use crate::framing;
use crate::model::DataPoint;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
pub struct SpoolRow {
    pub config_id: String,
    pub stream: String,
    pub stamp_ms: i64,
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpoolStatus {
    pub backlog_rows: u64,
}

enum SpoolCommand {
    Insert {
        point: DataPoint,
        respond_to: oneshot::Sender<Result<()>>,
    },
    ReadBatch {
        limit: i64,
        newest_first: bool,
        respond_to: oneshot::Sender<Result<Vec<SpoolRow>>>,
    },
    DeleteMany {
        pairs: Vec<(String, i64)>,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    GetStorage {
        key: String,
        respond_to: oneshot::Sender<Result<Option<serde_json::Value>>>,
    },
    UpsertStorage {
        key: String,
        value: serde_json::Value,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Status {
        respond_to: oneshot::Sender<Result<SpoolStatus>>,
    },
}

/// Cloneable handle to the Spool actor thread. Cheap to clone; every clone
/// shares the same underlying SQLite connection owned by the worker thread.
#[derive(Clone)]
pub struct SpoolHandle {
    tx: mpsc::UnboundedSender<SpoolCommand>,
}

impl SpoolHandle {
    pub async fn insert(&self, point: DataPoint) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::Insert { point, respond_to })
            .map_err(|_| SpoolError::WorkerGone)?;
        rx.await.map_err(|_| SpoolError::WorkerGone)?
    }

    pub async fn read_batch(&self, limit: i64, newest_first: bool) -> Result<Vec<SpoolRow>> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::ReadBatch {
                limit,
                newest_first,
                respond_to,
            })
            .map_err(|_| SpoolError::WorkerGone)?;
        rx.await.map_err(|_| SpoolError::WorkerGone)?
    }

    pub async fn delete_many(&self, pairs: Vec<(String, i64)>) -> Result<usize> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::DeleteMany { pairs, respond_to })
            .map_err(|_| SpoolError::WorkerGone)?;
        rx.await.map_err(|_| SpoolError::WorkerGone)?
    }

    pub async fn get_storage(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::GetStorage {
                key: key.to_string(),
                respond_to,
            })
            .map_err(|_| SpoolError::WorkerGone)?;
        rx.await.map_err(|_| SpoolError::WorkerGone)?
    }

    pub async fn upsert_storage(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::UpsertStorage {
                key: key.to_string(),
                value,
                respond_to,
            })
            .map_err(|_| SpoolError::WorkerGone)?;
        rx.await.map_err(|_| SpoolError::WorkerGone)?
    }

    pub async fn status(&self) -> Result<SpoolStatus> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(SpoolCommand::Status { respond_to })
            .map_err(|_| SpoolError::WorkerGone)?;
        rx.await.map_err(|_| SpoolError::WorkerGone)?
    }
}

pub fn spawn_spool_thread(db_path: PathBuf) -> Result<SpoolHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = open_and_prepare(&db_path)?;

    std::thread::Builder::new()
        .name("spool".to_string())
        .spawn(move || run_spool_thread(conn, rx))
        .context("spawning spool thread")?;

    Ok(SpoolHandle { tx })
}

fn open_and_prepare(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|source| SpoolError::Open {
        path: path.display().to_string(),
        source,
    })?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "auto_vacuum", "FULL")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sensordata (
            stamp TEXT NOT NULL,
            config_id TEXT NOT NULL,
            stream TEXT NOT NULL,
            result TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS sensordata_config_id ON sensordata(config_id);
        CREATE TABLE IF NOT EXISTS sensorstorage (
            key TEXT NOT NULL,
            value TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS sensorstorage_key ON sensorstorage(key);",
    )?;
    conn.pragma_query(None, "integrity_check", |row| {
        let result: String = row.get(0)?;
        if result != "ok" {
            tracing::error!(%result, "spool integrity check reported a problem");
        }
        Ok(())
    })?;
    Ok(conn)
}

fn run_spool_thread(conn: Connection, mut rx: mpsc::UnboundedReceiver<SpoolCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            SpoolCommand::Insert { point, respond_to } => {
                let result = insert(&conn, &point);
                let _ = respond_to.send(result);
            }
            SpoolCommand::ReadBatch {
                limit,
                newest_first,
                respond_to,
            } => {
                let result = read_batch(&conn, limit, newest_first);
                let _ = respond_to.send(result);
            }
            SpoolCommand::DeleteMany { pairs, respond_to } => {
                let result = delete_many(&conn, &pairs);
                let _ = respond_to.send(result);
            }
            SpoolCommand::GetStorage { key, respond_to } => {
                let result = get_storage(&conn, &key);
                let _ = respond_to.send(result);
            }
            SpoolCommand::UpsertStorage {
                key,
                value,
                respond_to,
            } => {
                let result = upsert_storage(&conn, &key, &value);
                let _ = respond_to.send(result);
            }
            SpoolCommand::Status { respond_to } => {
                let result = status(&conn);
                let _ = respond_to.send(result);
            }
        }
    }
    tracing::info!("spool thread exiting: command channel closed");
}

fn insert(conn: &Connection, point: &DataPoint) -> Result<()> {
    let framed = framing::encode_value(&point.value);
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, framed);
    conn.execute(
        "INSERT INTO sensordata (stamp, config_id, stream, result) VALUES (?1, ?2, ?3, ?4)",
        params![
            point.timestamp_ms.to_string(),
            point.config_id,
            point.stream_name,
            encoded,
        ],
    )?;
    Ok(())
}

fn read_batch(conn: &Connection, limit: i64, newest_first: bool) -> Result<Vec<SpoolRow>> {
    let order = if newest_first { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT stamp, config_id, stream, result FROM sensordata ORDER BY CAST(stamp AS INTEGER) {order} LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit], |row| {
        let stamp_text: String = row.get(0)?;
        let config_id: String = row.get(1)?;
        let stream: String = row.get(2)?;
        let encoded: String = row.get(3)?;
        Ok((stamp_text, config_id, stream, encoded))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (stamp_text, config_id, stream, encoded) = row?;
        let stamp_ms: i64 = stamp_text
            .parse()
            .with_context(|| format!("non-numeric stamp `{stamp_text}` in sensordata"))?;
        let result = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .context("corrupt base64 in sensordata.result")?;
        out.push(SpoolRow {
            config_id,
            stream,
            stamp_ms,
            result,
        });
    }
    Ok(out)
}

/// Deletes by exact `(config_id, stamp)` tuple pairs, never by independent
/// `IN` sets on each column (spec.md §9 corrected delete semantics).
fn delete_many(conn: &Connection, pairs: &[(String, i64)]) -> Result<usize> {
    let mut deleted = 0usize;
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt =
            tx.prepare("DELETE FROM sensordata WHERE config_id = ?1 AND stamp = ?2")?;
        for (config_id, stamp_ms) in pairs {
            deleted += stmt.execute(params![config_id, stamp_ms.to_string()])?;
        }
    }
    tx.commit()?;
    Ok(deleted)
}

/// A corrupt JSON blob resets that storage key to empty rather than
/// crashing the agent (spec.md §4.2, §7).
fn get_storage(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sensorstorage WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match raw {
        None => None,
        Some(text) => match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(%key, %err, "sensor storage blob is corrupt JSON, resetting to empty");
                Some(serde_json::json!({}))
            }
        },
    })
}

fn upsert_storage(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO sensorstorage (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, text],
    )?;
    Ok(())
}

fn status(conn: &Connection) -> Result<SpoolStatus> {
    let backlog_rows: i64 =
        conn.query_row("SELECT COUNT(*) FROM sensordata", [], |row| row.get(0))?;
    Ok(SpoolStatus {
        backlog_rows: backlog_rows.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Value};
    use tempfile::TempDir;

    fn point(config_id: &str, stamp_ms: i64) -> DataPoint {
        DataPoint {
            config_id: config_id.to_string(),
            stream_name: "uptime".to_string(),
            datatype: DataType::Float,
            value: Value::Float(1.0),
            timestamp_ms: stamp_ms,
        }
    }

    #[tokio::test]
    async fn insert_then_read_batch_round_trips() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_spool_thread(dir.path().join("spool.db")).unwrap();
        handle.insert(point("A", 100)).await.unwrap();
        handle.insert(point("A", 200)).await.unwrap();

        let rows = handle.read_batch(250, true).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stamp_ms, 200);
        assert_eq!(rows[1].stamp_ms, 100);
    }

    #[tokio::test]
    async fn delete_many_removes_only_the_named_pairs() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_spool_thread(dir.path().join("spool.db")).unwrap();
        handle.insert(point("A", 1)).await.unwrap();
        handle.insert(point("A", 2)).await.unwrap();
        handle.insert(point("B", 1)).await.unwrap();

        let deleted = handle
            .delete_many(vec![("A".to_string(), 1)])
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = handle.read_batch(250, true).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|r| !(r.config_id == "A" && r.stamp_ms == 1)));
    }

    #[tokio::test]
    async fn delete_many_does_not_cross_product_config_ids_and_stamps() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_spool_thread(dir.path().join("spool.db")).unwrap();
        handle.insert(point("A", 1)).await.unwrap();
        handle.insert(point("B", 1)).await.unwrap();

        // Deleting (A,1) must not also delete (B,1), even though both share
        // the stamp 1 -- this is the cross-product bug the tuple-form delete
        // statement must not reintroduce.
        handle
            .delete_many(vec![("A".to_string(), 1)])
            .await
            .unwrap();
        let remaining = handle.read_batch(250, true).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].config_id, "B");
    }

    #[tokio::test]
    async fn storage_round_trips_and_resets_on_corrupt_json() {
        let dir = TempDir::new().unwrap();
        let handle = spawn_spool_thread(dir.path().join("spool.db")).unwrap();
        assert!(handle.get_storage("uptime:A").await.unwrap().is_none());

        handle
            .upsert_storage("uptime:A", serde_json::json!({"last_seen": 1}))
            .await
            .unwrap();
        let value = handle.get_storage("uptime:A").await.unwrap().unwrap();
        assert_eq!(value["last_seen"], 1);
    }
}
