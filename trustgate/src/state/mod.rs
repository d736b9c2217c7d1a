// trustgate/src/state/mod.rs
//
// Collaborator interfaces the trust core consumes. Every call is I/O in a
// real deployment, so every call is async. The only shared mutable resource
// is the account/session store, and it is only ever mutated through the
// narrowly scoped conditional operations below. Callers never read a row,
// change it in memory and write it back.

pub mod audit;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};

use crate::config::TierTable;
use crate::error::StoreError;
use crate::events::{
    DeviceFingerprint, GenerationTicket, SecurityEvent, SessionRecord, UserTrustState, UserUpdate,
};

pub use audit::{JsonlAuditLog, MemoryAuditLog};
pub use memory::InMemoryStore;

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserTrustState>, StoreError>;

    async fn update_user(&self, user_id: &str, update: UserUpdate) -> Result<UserTrustState, StoreError>;

    /// Zero `daily_credits` and clear `last_generation_time`, but only if the
    /// stored `last_credit_reset` falls on a different calendar day in `zone`
    /// than `at`. Returns whether the reset applied.
    async fn reset_daily_credits(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        zone: FixedOffset,
    ) -> Result<bool, StoreError>;

    /// Compare-and-swap credit consumption. Increments daily and monthly
    /// credits and stamps `last_generation_time = now` only if, on the stored
    /// row, `daily_credits < limit` and the cooldown has elapsed. Limits come
    /// from the stored tier. `None` means the guard failed and nothing changed.
    async fn try_consume_generation(
        &self,
        user_id: &str,
        tiers: &TierTable,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationTicket>, StoreError>;

    /// Compensate one committed credit after a downstream failure. Reverses
    /// only this ticket's increment, whatever else committed in between.
    async fn revert_generation(&self, ticket: &GenerationTicket) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Sessions of `user_id` with activity at or after `since`, oldest first.
    async fn get_user_sessions(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// Sessions on `device_id` (any user) with activity at or after `since`.
    async fn get_device_sessions(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// Upsert by active (user, IP) and evict the oldest active sessions above
    /// the store's ceiling.
    async fn update_session_activity(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        ip_address: &str,
        user_agent: &str,
        fingerprint: Option<&DeviceFingerprint>,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StoreError>;

    async fn terminate_user_session(&self, session_id: u64) -> Result<bool, StoreError>;

    /// Deactivate every active session of the user. Returns how many changed.
    async fn terminate_all_user_sessions(&self, user_id: &str) -> Result<usize, StoreError>;

    /// Keep the `keep_count` most recently active sessions, deactivate the rest.
    async fn terminate_oldest_user_sessions(
        &self,
        user_id: &str,
        keep_count: usize,
    ) -> Result<usize, StoreError>;
}

/// Append-only security event log. Safe for concurrent writers.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log_security_event(&self, event: SecurityEvent) -> Result<(), StoreError>;
}
