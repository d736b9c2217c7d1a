// trustgate/src/quota/generator.rs
//
// The downstream signal generator. The AI call itself lives elsewhere; this
// crate only sees the trait. QueuedGenerator hands jobs to a worker through
// generation_queue.jsonl.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::SignalError;
use crate::events::SubscriptionTier;
use crate::sink::JsonlSink;

pub type SignalPayload = serde_json::Value;

#[async_trait]
pub trait SignalGenerator: Send + Sync {
    async fn generate_signal(
        &self,
        timeframe: &str,
        tier: SubscriptionTier,
        user_id: &str,
    ) -> Result<SignalPayload, SignalError>;
}

pub struct QueuedGenerator {
    sink: JsonlSink,
}

impl QueuedGenerator {
    pub const FILE_NAME: &'static str = "generation_queue.jsonl";

    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { sink: JsonlSink::new(output_dir.into().join(Self::FILE_NAME)) }
    }
}

/// SHA256[:8] over user, timeframe and enqueue instant.
fn job_id(user_id: &str, timeframe: &str, nanos: i64) -> String {
    let mut h = Sha256::new();
    h.update(user_id.as_bytes());
    h.update(b"|");
    h.update(timeframe.as_bytes());
    h.update(b"|");
    h.update(nanos.to_be_bytes());
    hex::encode(&h.finalize()[..8])
}

#[async_trait]
impl SignalGenerator for QueuedGenerator {
    async fn generate_signal(
        &self,
        timeframe: &str,
        tier: SubscriptionTier,
        user_id: &str,
    ) -> Result<SignalPayload, SignalError> {
        let timeframe = timeframe.trim();
        if timeframe.is_empty() {
            return Err(SignalError("timeframe is required".into()));
        }
        let now = Utc::now();
        let id = job_id(user_id, timeframe, now.timestamp_nanos_opt().unwrap_or_default());
        let job = json!({
            "jobId":     id,
            "userId":    user_id,
            "tier":      tier,
            "timeframe": timeframe,
            "queuedAt":  now,
        });
        self.sink
            .append(&job)
            .await
            .map_err(|e| SignalError(format!("queue write failed: {e}")))?;
        Ok(json!({ "status": "queued", "jobId": id, "timeframe": timeframe }))
    }
}
