//! C6 Receiver: drains worker-produced results into the Spool.
//!
//! REDESIGN FLAGS §9 replaces the source's "sleep 1s, then drain with a
//! non-blocking get until empty" pattern with an explicit bounded
//! `tokio::sync::mpsc` channel and `try_recv`, avoiding the dead-producer
//! deadlock that motivated the original workaround while keeping the same
//! tick cadence.

use crate::model::DataPoint;
use crate::spool::SpoolHandle;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

pub async fn run(spool: SpoolHandle, mut results_rx: mpsc::Receiver<DataPoint>) {
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        let mut drained = 0usize;
        loop {
            match results_rx.try_recv() {
                Ok(point) => {
                    if let Err(err) = spool.insert(point).await {
                        tracing::error!(%err, "failed to persist a worker result, dropping it");
                    }
                    drained += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    tracing::info!("receiver exiting: producer queue closed");
                    return;
                }
            }
        }
        if drained > 0 {
            tracing::debug!(drained, "receiver drained worker results into the spool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Value};
    use crate::spool::spawn_spool_thread;
    use tempfile::TempDir;

    #[tokio::test]
    async fn drains_queued_points_into_the_spool() {
        let dir = TempDir::new().unwrap();
        let spool = spawn_spool_thread(dir.path().join("spool.db")).unwrap();
        let (tx, rx) = mpsc::channel(16);

        tx.send(DataPoint {
            config_id: "A".into(),
            stream_name: "uptime".into(),
            datatype: DataType::Float,
            value: Value::Float(1.0),
            timestamp_ms: 42,
        })
        .await
        .unwrap();
        drop(tx);

        run(spool.clone(), rx).await;

        let rows = spool.read_batch(10, true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].config_id, "A");
    }
}
