// trustgate/src/workers/multi_account.rs
//
// Multiple free accounts driven from one device within 5 minutes.
// Paid accounts sharing a device are tolerated and never counted.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::DetectionConfig;
use crate::error::StoreError;
use crate::events::{MultiAccountFinding, SubscriptionTier};
use crate::state::{AccountStore, SessionStore};

pub async fn analyze(
    device_id: Option<&str>,
    sessions: &dyn SessionStore,
    accounts: &dyn AccountStore,
    cfg: &DetectionConfig,
    now: DateTime<Utc>,
) -> Result<MultiAccountFinding, StoreError> {
    let Some(device_id) = device_id else {
        return Ok(MultiAccountFinding::default());
    };

    let recent = sessions.get_device_sessions(device_id, now - cfg.simultaneous_window()).await?;
    let users: BTreeSet<String> = recent.into_iter().map(|s| s.user_id).collect();

    let mut free = Vec::new();
    for user_id in users {
        match accounts.get_user(&user_id).await? {
            Some(u) if u.subscription_tier == SubscriptionTier::Free => free.push(user_id),
            Some(_) => {}
            None => debug!(user_id = %user_id, device_id, "session owner has no account row"),
        }
    }

    Ok(MultiAccountFinding {
        has_multiple_free_accounts: free.len() > 1,
        free_account_count: free.len(),
        user_ids: free,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UserTrustState;
    use crate::state::InMemoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    async fn seed(store: &InMemoryStore, user: &str, tier: SubscriptionTier, device: &str, at: DateTime<Utc>) {
        store.upsert_user(UserTrustState::new(user, tier));
        store.update_session_activity(user, Some(device), "10.0.0.1", "UA", None, at).await.unwrap();
    }

    #[tokio::test]
    async fn two_free_accounts_on_one_device() {
        let store = InMemoryStore::default();
        seed(&store, "b", SubscriptionTier::Free, "dev", t0()).await;
        seed(&store, "a", SubscriptionTier::Free, "dev", t0() - Duration::minutes(2)).await;
        seed(&store, "p", SubscriptionTier::Pro, "dev", t0()).await;
        seed(&store, "old", SubscriptionTier::Free, "dev", t0() - Duration::minutes(20)).await;

        let f = analyze(Some("dev"), &store, &store, &DetectionConfig::default(), t0()).await.unwrap();
        assert!(f.has_multiple_free_accounts);
        assert_eq!(f.free_account_count, 2);
        assert_eq!(f.user_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn paid_accounts_and_unknown_devices_are_ignored() {
        let store = InMemoryStore::default();
        seed(&store, "s", SubscriptionTier::Starter, "dev", t0()).await;
        seed(&store, "p", SubscriptionTier::Pro, "dev", t0()).await;
        seed(&store, "f", SubscriptionTier::Free, "dev", t0()).await;

        let cfg = DetectionConfig::default();
        let f = analyze(Some("dev"), &store, &store, &cfg, t0()).await.unwrap();
        assert!(!f.has_multiple_free_accounts);
        assert_eq!(f.free_account_count, 1);

        let none = analyze(None, &store, &store, &cfg, t0()).await.unwrap();
        assert_eq!(none, MultiAccountFinding::default());
    }
}
