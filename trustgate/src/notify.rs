// trustgate/src/notify.rs
//
// Account-blocked notifications. Delivery is best-effort: the enforcer logs a
// failure and carries on.
//
//   OutboxNotifier — appends notices to notification_outbox.jsonl for a mail worker
//   LogNotifier    — info! only

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::NotifyError;
use crate::sink::JsonlSink;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_account_blocked(
        &self,
        email: &str,
        first_name: Option<&str>,
        reason: &str,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedNotice {
    pub email: String,
    pub greeting: String,
    pub reason: String,
    pub queued_at: DateTime<Utc>,
}

impl BlockedNotice {
    pub fn new(email: &str, first_name: Option<&str>, reason: &str) -> Self {
        let greeting = match first_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => format!("Hi {name},"),
            None => "Hi,".to_string(),
        };
        Self {
            email: email.to_string(),
            greeting,
            reason: reason.to_string(),
            queued_at: Utc::now(),
        }
    }
}

pub struct OutboxNotifier {
    sink: JsonlSink,
}

impl OutboxNotifier {
    pub const FILE_NAME: &'static str = "notification_outbox.jsonl";

    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { sink: JsonlSink::new(output_dir.into().join(Self::FILE_NAME)) }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send_account_blocked(
        &self,
        email: &str,
        first_name: Option<&str>,
        reason: &str,
    ) -> Result<(), NotifyError> {
        if !email.contains('@') {
            return Err(NotifyError::Delivery(format!("not an email address: {email:?}")));
        }
        self.sink.append(&BlockedNotice::new(email, first_name, reason)).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_account_blocked(
        &self,
        email: &str,
        first_name: Option<&str>,
        reason: &str,
    ) -> Result<(), NotifyError> {
        info!(email, first_name = first_name.unwrap_or(""), reason, "ACCOUNT_BLOCKED notice");
        Ok(())
    }
}
