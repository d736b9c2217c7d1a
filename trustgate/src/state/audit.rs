// trustgate/src/state/audit.rs
//
// Security event sinks.
//   JsonlAuditLog  — append-only security_events.jsonl, one event per line
//   MemoryAuditLog — keeps events in process (CLI summaries, tests)

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::AuditLog;
use crate::error::StoreError;
use crate::events::SecurityEvent;
use crate::sink::JsonlSink;

pub struct JsonlAuditLog {
    sink: JsonlSink,
}

impl JsonlAuditLog {
    pub const FILE_NAME: &'static str = "security_events.jsonl";

    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { sink: JsonlSink::new(output_dir.into().join(Self::FILE_NAME)) }
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn log_security_event(&self, event: SecurityEvent) -> Result<(), StoreError> {
        self.sink.append(&event).await?;
        debug!(event_type = %event.event_type, severity = %event.severity, "security event written");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event_type == event_type).count()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn log_security_event(&self, event: SecurityEvent) -> Result<(), StoreError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_types, Severity};
    use chrono::Utc;

    fn event(kind: &str) -> SecurityEvent {
        SecurityEvent {
            user_id: Some("u1".into()),
            event_type: kind.into(),
            ip_address: "10.0.0.1".into(),
            details: serde_json::json!({ "devices": ["a", "b"] }),
            severity: Severity::High,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_log_counts_by_type() {
        let log = MemoryAuditLog::new();
        log.log_security_event(event(event_types::SHARING_DETECTED_ALLOWED)).await.unwrap();
        log.log_security_event(event(event_types::SHARING_DETECTED_ALLOWED)).await.unwrap();
        log.log_security_event(event(event_types::MULTIPLE_FREE_ACCOUNTS_BLOCKED)).await.unwrap();
        assert_eq!(log.count(event_types::SHARING_DETECTED_ALLOWED), 2);
        assert_eq!(log.events().len(), 3);
    }

    #[tokio::test]
    async fn jsonl_log_round_trips_events() {
        let dir = std::env::temp_dir().join(format!("trustgate-audit-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let _ = tokio::fs::remove_file(dir.join(JsonlAuditLog::FILE_NAME)).await;

        let log = JsonlAuditLog::new(&dir);
        log.log_security_event(event(event_types::SIMULTANEOUS_MULTI_DEVICE_BLOCKED)).await.unwrap();

        let raw = tokio::fs::read_to_string(dir.join(JsonlAuditLog::FILE_NAME)).await.unwrap();
        let back: SecurityEvent = serde_json::from_str(raw.trim_end()).unwrap();
        assert_eq!(back.event_type, event_types::SIMULTANEOUS_MULTI_DEVICE_BLOCKED);
        assert_eq!(back.severity, Severity::High);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
