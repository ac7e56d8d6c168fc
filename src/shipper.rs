//! C7 Shipper: pulls from the Spool, ships batches, deletes on ack,
//! honoring partial acknowledgement and adaptive pacing (spec.md §4.7).

use crate::error::TransportError;
use crate::spool::SpoolHandle;
use crate::transport::{Outcome, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const BATCH_LIMIT: i64 = 250;
const PACE_STEP_MS: i64 = 200;
const PACE_MIN_MS: i64 = 200;
const PACE_MAX_MS: i64 = 1000;
const GROW_THRESHOLD_ROWS: usize = 200;
const SHRINK_THRESHOLD_ROWS: usize = 160;
const MAX_CONFAILS: u32 = 200;

#[derive(Debug, Clone, Copy)]
pub struct PacingState {
    sleep_ms: i64,
}

impl Default for PacingState {
    fn default() -> Self {
        Self { sleep_ms: PACE_MAX_MS }
    }
}

impl PacingState {
    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms as u64)
    }

    /// Adaptive pacing step: bigger batches mean we are behind, so ship
    /// more often; smaller batches mean we can back off (spec.md §4.7, P6).
    pub fn on_batch(&mut self, rows: usize) {
        if rows > GROW_THRESHOLD_ROWS {
            self.sleep_ms = (self.sleep_ms - PACE_STEP_MS).max(PACE_MIN_MS);
            if self.sleep_ms == PACE_MIN_MS {
                tracing::info!("shipper at maximum capacity (sleeptime floor reached)");
            }
        } else if rows < SHRINK_THRESHOLD_ROWS {
            self.sleep_ms = (self.sleep_ms + PACE_STEP_MS).min(PACE_MAX_MS);
        }
    }
}

#[derive(Debug, Serialize)]
struct Chunk {
    config_id: String,
    stream: String,
    stamp: i64,
    result: String,
}

#[derive(Debug, Deserialize)]
struct AckBody {
    status: String,
    /// Newer shape: `{"status":"ERROR_PARTIAL_STORE","reason":[[cid,stamp],...]}`.
    #[serde(default)]
    reason: Option<Vec<(String, i64)>>,
    /// Older shape: `{"status":"Not_all_saved","data":[[cid,stamp],...]}`.
    #[serde(default)]
    data: Option<Vec<(String, i64)>>,
}

/// What to delete after a response, or `None` if nothing should be deleted
/// (spec.md §4.3, §4.7, §7: transient failures never delete).
fn decide_delete(outcome: Outcome, body: &str, pairs: &[(String, i64)]) -> Option<Vec<(String, i64)>> {
    match outcome {
        Outcome::NoConnection | Outcome::Transient => None,
        Outcome::Rejected => Some(pairs.to_vec()),
        Outcome::Success => match serde_json::from_str::<AckBody>(body) {
            Ok(ack) if ack.status == "ERROR_PARTIAL_STORE" => {
                Some(ack.reason.unwrap_or_default())
            }
            Ok(ack) if ack.status == "Not_all_saved" => Some(ack.data.unwrap_or_default()),
            Ok(_) => Some(pairs.to_vec()),
            Err(_) => {
                tracing::error!(%body, "store_data ack body did not parse; not deleting");
                None
            }
        },
    }
}

pub struct Shipper {
    spool: SpoolHandle,
    transport: Transport,
    newest_first: bool,
    pacing: PacingState,
    confails: u32,
}

impl Shipper {
    pub fn new(spool: SpoolHandle, transport: Transport, newest_first: bool) -> Self {
        Self {
            spool,
            transport,
            newest_first,
            pacing: PacingState::default(),
            confails: 0,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::time::sleep(self.pacing.sleep()).await;
            if let Err(err) = self.ship_one_batch().await {
                tracing::error!(%err, "shipper batch failed");
            }
        }
    }

    async fn ship_one_batch(&mut self) -> anyhow::Result<()> {
        let rows = self.spool.read_batch(BATCH_LIMIT, self.newest_first).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let pairs: Vec<(String, i64)> = rows
            .iter()
            .map(|r| (r.config_id.clone(), r.stamp_ms))
            .collect();
        let chunks: Vec<Chunk> = rows
            .iter()
            .map(|r| Chunk {
                config_id: r.config_id.clone(),
                stream: r.stream.clone(),
                stamp: r.stamp_ms,
                result: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &r.result),
            })
            .collect();
        let body = serde_json::to_vec(&chunks)?;

        let row_count = rows.len();
        match self.transport.put("/store_data", &body).await {
            Err(TransportError::NoConnection) => {
                self.confails = (self.confails + 1).min(MAX_CONFAILS);
                tracing::warn!(confails = self.confails, "no connection to collector");
            }
            Err(err) => {
                tracing::error!(%err, "store_data request failed");
            }
            Ok(resp) => {
                let outcome = resp.outcome();
                if let Some(to_delete) = decide_delete(outcome, &resp.body, &pairs) {
                    let deleted = self.spool.delete_many(to_delete).await?;
                    tracing::debug!(deleted, status = %resp.status, "shipper deleted acknowledged rows");
                }
                self.pacing.on_batch(row_count);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_decreases_on_large_batches_and_floors_at_minimum() {
        let mut pacing = PacingState::default();
        for _ in 0..10 {
            pacing.on_batch(201);
        }
        assert_eq!(pacing.sleep(), Duration::from_millis(PACE_MIN_MS as u64));
    }

    #[test]
    fn pacing_increases_on_small_batches_and_ceils_at_maximum() {
        let mut pacing = PacingState { sleep_ms: PACE_MIN_MS };
        for _ in 0..10 {
            pacing.on_batch(0);
        }
        assert_eq!(pacing.sleep(), Duration::from_millis(PACE_MAX_MS as u64));
    }

    #[test]
    fn pacing_is_monotonic_for_non_decreasing_batch_sizes() {
        let mut pacing = PacingState::default();
        let before = pacing.sleep();
        pacing.on_batch(250);
        let after = pacing.sleep();
        assert!(after <= before);
    }

    #[test]
    fn decide_delete_on_plain_ok_deletes_everything() {
        let pairs = vec![("A".to_string(), 1)];
        let result = decide_delete(Outcome::Success, r#"{"status":"OK"}"#, &pairs);
        assert_eq!(result, Some(pairs));
    }

    #[test]
    fn decide_delete_on_newer_partial_ack_shape_deletes_only_reason() {
        let pairs = vec![("A".to_string(), 1), ("A".to_string(), 3)];
        let body = r#"{"status":"ERROR_PARTIAL_STORE","reason":[["A",1]]}"#;
        let result = decide_delete(Outcome::Success, body, &pairs);
        assert_eq!(result, Some(vec![("A".to_string(), 1)]));
    }

    #[test]
    fn decide_delete_on_older_partial_ack_shape_deletes_only_data() {
        let pairs = vec![("A".to_string(), 1), ("A".to_string(), 3)];
        let body = r#"{"status":"Not_all_saved","data":[["A",3]]}"#;
        let result = decide_delete(Outcome::Success, body, &pairs);
        assert_eq!(result, Some(vec![("A".to_string(), 3)]));
    }

    #[test]
    fn decide_delete_on_rejected_deletes_all_to_avoid_head_of_line_poisoning() {
        let pairs = vec![("A".to_string(), 1)];
        let result = decide_delete(Outcome::Rejected, "not json", &pairs);
        assert_eq!(result, Some(pairs));
    }

    #[test]
    fn decide_delete_on_transient_or_no_connection_deletes_nothing() {
        let pairs = vec![("A".to_string(), 1)];
        assert_eq!(decide_delete(Outcome::Transient, "", &pairs), None);
        assert_eq!(decide_delete(Outcome::NoConnection, "", &pairs), None);
    }

    #[test]
    fn decide_delete_on_unparseable_success_body_deletes_nothing() {
        let pairs = vec![("A".to_string(), 1)];
        assert_eq!(decide_delete(Outcome::Success, "not json", &pairs), None);
    }
}
