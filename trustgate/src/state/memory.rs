// trustgate/src/state/memory.rs
//
// In-process account + session store.
// DashMap = sharded concurrent HashMap — safe across tokio tasks with no global mutex.
//
// Every mutation runs while holding the row's shard write guard. That is the
// in-process equivalent of a conditional `UPDATE ... WHERE <guard>`: the guard
// is evaluated against the row as it is now, never against a copy some caller
// read earlier. Guards are never held across an await.
//
// Layout:
//   users        user_id    → UserTrustState
//   sessions     user_id    → Vec<SessionRecord>   (never deleted, only deactivated)
//   device_idx   device_id  → user_ids seen on that device
//   session_idx  session_id → user_id

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{AccountStore, SessionStore};
use crate::config::{DetectionConfig, TierTable};
use crate::error::StoreError;
use crate::events::{
    DeviceFingerprint, GenerationTicket, SessionRecord, UserTrustState, UserUpdate,
};

pub struct InMemoryStore {
    users:       DashMap<String, UserTrustState>,
    sessions:    DashMap<String, Vec<SessionRecord>>,
    device_idx:  DashMap<String, HashSet<String>>,
    session_idx: DashMap<u64, String>,
    next_session: AtomicU64,
    max_active_sessions: usize,

    pub total_requests: AtomicU64,
}

impl InMemoryStore {
    pub fn new(max_active_sessions: usize) -> Self {
        Self {
            users:        DashMap::new(),
            sessions:     DashMap::new(),
            device_idx:   DashMap::new(),
            session_idx:  DashMap::new(),
            next_session: AtomicU64::new(1),
            max_active_sessions: max_active_sessions.max(1),
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn upsert_user(&self, user: UserTrustState) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn load_users(&self, users: impl IntoIterator<Item = UserTrustState>) -> usize {
        let mut n = 0;
        for user in users {
            self.upsert_user(user);
            n += 1;
        }
        n
    }

    pub fn n_users(&self) -> usize { self.users.len() }

    pub fn n_sessions(&self) -> usize {
        self.sessions.iter().map(|s| s.len()).sum()
    }

    pub fn n_active_sessions(&self) -> usize {
        self.sessions.iter().map(|s| s.iter().filter(|r| r.is_active).count()).sum()
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    fn record_activity(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        ip_address: &str,
        user_agent: &str,
        fingerprint: Option<&DeviceFingerprint>,
        at: DateTime<Utc>,
    ) -> SessionRecord {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let record = {
            let mut entry = self.sessions.entry(user_id.to_string()).or_default();
            let sessions = entry.value_mut();

            let existing = sessions
                .iter_mut()
                .find(|s| s.is_active && s.ip_address == ip_address);

            match existing {
                Some(s) => {
                    s.last_activity = s.last_activity.max(at);
                    s.user_agent = user_agent.to_string();
                    if device_id.is_some() {
                        s.device_id = device_id.map(str::to_string);
                    }
                    if let Some(fp) = fingerprint {
                        s.device_fingerprint = Some(fp.clone());
                    }
                    s.clone()
                }
                None => {
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    let record = SessionRecord {
                        id,
                        user_id:            user_id.to_string(),
                        device_id:          device_id.map(str::to_string),
                        ip_address:         ip_address.to_string(),
                        user_agent:         user_agent.to_string(),
                        device_fingerprint: fingerprint.cloned(),
                        is_active:          true,
                        created_at:         at,
                        last_activity:      at,
                    };
                    sessions.push(record.clone());
                    self.session_idx.insert(id, user_id.to_string());

                    let evicted = evict_oldest(sessions, self.max_active_sessions);
                    if !evicted.is_empty() {
                        debug!(user_id, ?evicted, "session ceiling reached, evicted oldest");
                    }
                    record
                }
            }
        };

        if let Some(device) = device_id {
            self.device_idx
                .entry(device.to_string())
                .or_default()
                .insert(user_id.to_string());
        }
        record
    }

    fn user_sessions_since(&self, user_id: &str, since: DateTime<Utc>) -> Vec<SessionRecord> {
        let mut out: Vec<SessionRecord> = self
            .sessions
            .get(user_id)
            .map(|s| s.iter().filter(|r| r.last_activity >= since).cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|r| (r.last_activity, r.id));
        out
    }

    fn device_sessions_since(&self, device_id: &str, since: DateTime<Utc>) -> Vec<SessionRecord> {
        let users: Vec<String> = self
            .device_idx
            .get(device_id)
            .map(|u| u.iter().cloned().collect())
            .unwrap_or_default();

        let mut out = Vec::new();
        for user in users {
            if let Some(sessions) = self.sessions.get(&user) {
                out.extend(
                    sessions
                        .iter()
                        .filter(|r| r.device_id.as_deref() == Some(device_id) && r.last_activity >= since)
                        .cloned(),
                );
            }
        }
        out.sort_by_key(|r| (r.last_activity, r.id));
        out
    }

    fn deactivate_session(&self, session_id: u64) -> bool {
        let owner = match self.session_idx.get(&session_id) {
            Some(o) => o.clone(),
            None => return false,
        };
        let Some(mut sessions) = self.sessions.get_mut(&owner) else {
            return false;
        };
        match sessions.iter_mut().find(|s| s.id == session_id && s.is_active) {
            Some(s) => {
                s.is_active = false;
                true
            }
            None => false,
        }
    }

    fn deactivate_all(&self, user_id: &str) -> usize {
        let Some(mut sessions) = self.sessions.get_mut(user_id) else {
            return 0;
        };
        let mut n = 0;
        for s in sessions.iter_mut().filter(|s| s.is_active) {
            s.is_active = false;
            n += 1;
        }
        n
    }

    fn deactivate_oldest(&self, user_id: &str, keep_count: usize) -> usize {
        self.sessions
            .get_mut(user_id)
            .map(|mut s| evict_oldest(s.value_mut(), keep_count).len())
            .unwrap_or(0)
    }

    // ── Accounts ──────────────────────────────────────────────────────────────

    fn apply_update(&self, user_id: &str, update: UserUpdate) -> Result<UserTrustState, StoreError> {
        let mut user = self.users.get_mut(user_id).ok_or_else(|| not_found(user_id))?;
        if let Some(tier) = update.subscription_tier {
            user.subscription_tier = tier;
        }
        if let Some(email) = update.email {
            user.email = Some(email);
        }
        if let Some(name) = update.first_name {
            user.first_name = Some(name);
        }
        Ok(user.clone())
    }

    fn reset_if_stale(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        zone: FixedOffset,
    ) -> Result<bool, StoreError> {
        let mut user = self.users.get_mut(user_id).ok_or_else(|| not_found(user_id))?;
        let today = at.with_timezone(&zone).date_naive();
        let stale = user
            .last_credit_reset
            .map(|r| r.with_timezone(&zone).date_naive() != today)
            .unwrap_or(true);
        if !stale {
            return Ok(false);
        }
        user.daily_credits = 0;
        user.last_generation_time = None;
        user.last_credit_reset = Some(at);
        Ok(true)
    }

    fn consume(
        &self,
        user_id: &str,
        tiers: &TierTable,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationTicket>, StoreError> {
        let mut user = self.users.get_mut(user_id).ok_or_else(|| not_found(user_id))?;
        let limits = tiers.limits_for(user.subscription_tier);

        let under_limit = limits.daily_limit.map(|l| user.daily_credits < l).unwrap_or(true);
        let cooled_down = user
            .last_generation_time
            .map(|t| t <= now - limits.cooldown())
            .unwrap_or(true);
        if !(under_limit && cooled_down) {
            return Ok(None);
        }

        let ticket = GenerationTicket {
            user_id:                  user_id.to_string(),
            tier:                     user.subscription_tier,
            previous_credits:         user.daily_credits,
            previous_generation_time: user.last_generation_time,
            committed_at:             now,
        };
        user.daily_credits += 1;
        user.monthly_credits += 1;
        user.last_generation_time = Some(now);
        Ok(Some(ticket))
    }

    fn compensate(&self, ticket: &GenerationTicket) -> Result<(), StoreError> {
        let mut user = self
            .users
            .get_mut(&ticket.user_id)
            .ok_or_else(|| not_found(&ticket.user_id))?;
        // A daily reset in between already wiped this credit.
        if user.daily_credits > ticket.previous_credits {
            user.daily_credits -= 1;
        }
        user.monthly_credits = user.monthly_credits.saturating_sub(1);
        if user.last_generation_time == Some(ticket.committed_at) {
            user.last_generation_time = ticket.previous_generation_time;
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DetectionConfig::default().max_active_sessions)
    }
}

/// Deactivate all but the `keep` most recently active sessions. Equal
/// `last_activity` is broken by id, so the later write survives.
fn evict_oldest(sessions: &mut [SessionRecord], keep: usize) -> Vec<u64> {
    let mut active: Vec<usize> = sessions
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_active)
        .map(|(i, _)| i)
        .collect();
    if active.len() <= keep {
        return Vec::new();
    }
    active.sort_by_key(|&i| Reverse((sessions[i].last_activity, sessions[i].id)));
    active[keep..]
        .iter()
        .map(|&i| {
            sessions[i].is_active = false;
            sessions[i].id
        })
        .collect()
}

fn not_found(user_id: &str) -> StoreError {
    StoreError::NotFound { entity: "user", id: user_id.to_string() }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn get_user_sessions(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.user_sessions_since(user_id, since))
    }

    async fn get_device_sessions(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.device_sessions_since(device_id, since))
    }

    async fn update_session_activity(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        ip_address: &str,
        user_agent: &str,
        fingerprint: Option<&DeviceFingerprint>,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError> {
        Ok(self.record_activity(user_id, device_id, ip_address, user_agent, fingerprint, at))
    }

    async fn terminate_user_session(&self, session_id: u64) -> Result<bool, StoreError> {
        Ok(self.deactivate_session(session_id))
    }

    async fn terminate_all_user_sessions(&self, user_id: &str) -> Result<usize, StoreError> {
        Ok(self.deactivate_all(user_id))
    }

    async fn terminate_oldest_user_sessions(
        &self,
        user_id: &str,
        keep_count: usize,
    ) -> Result<usize, StoreError> {
        Ok(self.deactivate_oldest(user_id, keep_count))
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserTrustState>, StoreError> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn update_user(&self, user_id: &str, update: UserUpdate) -> Result<UserTrustState, StoreError> {
        self.apply_update(user_id, update)
    }

    async fn reset_daily_credits(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        zone: FixedOffset,
    ) -> Result<bool, StoreError> {
        self.reset_if_stale(user_id, at, zone)
    }

    async fn try_consume_generation(
        &self,
        user_id: &str,
        tiers: &TierTable,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationTicket>, StoreError> {
        self.consume(user_id, tiers, now)
    }

    async fn revert_generation(&self, ticket: &GenerationTicket) -> Result<(), StoreError> {
        self.compensate(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SubscriptionTier;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn same_ip_updates_existing_session() {
        let store = InMemoryStore::new(2);
        let a = store
            .update_session_activity("u1", Some("d1"), "10.0.0.1", "UA", None, t0())
            .await
            .unwrap();
        let b = store
            .update_session_activity("u1", Some("d2"), "10.0.0.1", "UA2", None, t0() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.device_id.as_deref(), Some("d2"));
        assert_eq!(b.last_activity, t0() + Duration::minutes(1));
        assert_eq!(store.n_sessions(), 1);
    }

    #[tokio::test]
    async fn last_activity_never_moves_backwards() {
        let store = InMemoryStore::new(2);
        store.update_session_activity("u1", None, "10.0.0.1", "UA", None, t0()).await.unwrap();
        let s = store
            .update_session_activity("u1", None, "10.0.0.1", "UA", None, t0() - Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(s.last_activity, t0());
    }

    #[tokio::test]
    async fn ceiling_evicts_oldest_sessions() {
        let store = InMemoryStore::new(2);
        for (i, ip) in ["10.0.0.1", "10.0.0.2", "10.0.0.3"].iter().enumerate() {
            store
                .update_session_activity("u1", Some("d"), ip, "UA", None, t0() + Duration::minutes(i as i64))
                .await
                .unwrap();
        }
        assert_eq!(store.n_active_sessions(), 2);

        let all = store.get_user_sessions("u1", t0()).await.unwrap();
        assert_eq!(all.len(), 3, "evicted sessions stay visible to activity queries");
        assert!(!all[0].is_active);
        assert!(all[1].is_active && all[2].is_active);
    }

    #[tokio::test]
    async fn device_sessions_span_users() {
        let store = InMemoryStore::new(2);
        store.update_session_activity("u1", Some("shared"), "10.0.0.1", "UA", None, t0()).await.unwrap();
        store.update_session_activity("u2", Some("shared"), "10.0.0.9", "UA", None, t0()).await.unwrap();
        store.update_session_activity("u3", Some("other"), "10.0.0.9", "UA", None, t0()).await.unwrap();

        let on_device = store.get_device_sessions("shared", t0()).await.unwrap();
        let users: HashSet<_> = on_device.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(users, HashSet::from(["u1", "u2"]));

        let later = store.get_device_sessions("shared", t0() + Duration::seconds(1)).await.unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn terminate_operations() {
        let store = InMemoryStore::new(5);
        let mut ids = Vec::new();
        for (i, ip) in ["10.0.0.1", "10.0.0.2", "10.0.0.3"].iter().enumerate() {
            let s = store
                .update_session_activity("u1", None, ip, "UA", None, t0() + Duration::minutes(i as i64))
                .await
                .unwrap();
            ids.push(s.id);
        }
        assert!(store.terminate_user_session(ids[1]).await.unwrap());
        assert!(!store.terminate_user_session(ids[1]).await.unwrap());
        assert_eq!(store.terminate_oldest_user_sessions("u1", 1).await.unwrap(), 1);
        assert_eq!(store.n_active_sessions(), 1);
        assert_eq!(store.terminate_all_user_sessions("u1").await.unwrap(), 1);
        assert_eq!(store.n_active_sessions(), 0);
        assert_eq!(store.terminate_all_user_sessions("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_user_changes_profile_only() {
        let store = InMemoryStore::default();
        let mut user = UserTrustState::new("u1", SubscriptionTier::Free);
        user.daily_credits = 2;
        store.upsert_user(user);

        let updated = store
            .update_user(
                "u1",
                UserUpdate { subscription_tier: Some(SubscriptionTier::Pro), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(updated.subscription_tier, SubscriptionTier::Pro);
        assert_eq!(updated.daily_credits, 2);

        let missing = store.update_user("ghost", UserUpdate::default()).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn reset_applies_once_per_reference_day() {
        let store = InMemoryStore::default();
        let zone = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let mut user = UserTrustState::new("u1", SubscriptionTier::Free);
        user.daily_credits = 2;
        user.last_generation_time = Some(t0());
        user.last_credit_reset = Some(t0());
        store.upsert_user(user);

        // 09:00 UTC and 17:00 UTC on the same day are both 2 March in UTC+05:30.
        assert!(!store.reset_daily_credits("u1", t0() + Duration::hours(8), zone).await.unwrap());
        // 19:00 UTC is already 3 March 00:30 in UTC+05:30.
        assert!(store.reset_daily_credits("u1", t0() + Duration::hours(10), zone).await.unwrap());

        let u = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(u.daily_credits, 0);
        assert_eq!(u.last_generation_time, None);
        assert!(!store.reset_daily_credits("u1", t0() + Duration::hours(11), zone).await.unwrap());
    }
}
