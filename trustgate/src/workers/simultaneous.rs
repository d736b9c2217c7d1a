// trustgate/src/workers/simultaneous.rs
//
// Simultaneous-access detector. Narrow on purpose: only the last 5 minutes of
// one user's activity, only distinct device ids. Pure over the fetched list,
// so repeated calls over unchanged sessions agree.

use chrono::{DateTime, Duration, Utc};

use super::distinct_devices;
use crate::config::DetectionConfig;
use crate::error::StoreError;
use crate::events::{SessionRecord, SimultaneousAccess};
use crate::state::SessionStore;

pub fn detect(
    sessions: &[SessionRecord],
    user_id: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> SimultaneousAccess {
    let since = now - window;
    let recent: Vec<&SessionRecord> = sessions
        .iter()
        .filter(|s| s.user_id == user_id && s.last_activity >= since)
        .collect();
    let devices = distinct_devices(&recent);

    SimultaneousAccess {
        is_simultaneous: devices.len() > 1,
        device_count: devices.len(),
        devices,
    }
}

pub async fn analyze(
    user_id: &str,
    store: &dyn SessionStore,
    cfg: &DetectionConfig,
    now: DateTime<Utc>,
) -> Result<SimultaneousAccess, StoreError> {
    let window = cfg.simultaneous_window();
    let sessions = store.get_user_sessions(user_id, now - window).await?;
    Ok(detect(&sessions, user_id, now, window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn distinct_devices_inside_window() {
        let store = InMemoryStore::new(5);
        let cfg = DetectionConfig::default();
        store.update_session_activity("u1", Some("d1"), "10.0.0.1", "UA", None, t0() - Duration::minutes(10)).await.unwrap();
        store.update_session_activity("u1", Some("d2"), "10.0.0.2", "UA", None, t0() - Duration::minutes(4)).await.unwrap();
        store.update_session_activity("u1", Some("d3"), "10.0.0.3", "UA", None, t0()).await.unwrap();
        store.update_session_activity("u1", None, "10.0.0.4", "UA", None, t0()).await.unwrap();

        let found = analyze("u1", &store, &cfg, t0()).await.unwrap();
        assert!(found.is_simultaneous);
        assert_eq!(found.device_count, 2);
        assert_eq!(found.devices, vec!["d2".to_string(), "d3".to_string()]);

        let again = analyze("u1", &store, &cfg, t0() + Duration::seconds(30)).await.unwrap();
        assert_eq!(again, found);
    }

    #[tokio::test]
    async fn one_device_many_ips_is_not_simultaneous() {
        let store = InMemoryStore::new(5);
        store.update_session_activity("u1", Some("d1"), "10.0.0.1", "UA", None, t0()).await.unwrap();
        store.update_session_activity("u1", Some("d1"), "10.9.0.1", "UA", None, t0()).await.unwrap();

        let found = analyze("u1", &store, &DetectionConfig::default(), t0()).await.unwrap();
        assert!(!found.is_simultaneous);
        assert_eq!(found.device_count, 1);
    }
}
