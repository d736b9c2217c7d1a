// trustgate/src/quota/gate.rs
//
// Signal-generation gate.
//
//   precheck  advisory, on a snapshot; store errors fail OPEN
//   commit    daily reset + conditional consume on the stored row; store errors fail CLOSED
//   generate  precheck → commit → generator; a generator failure reverts the credit
//
// Nothing here reads a counter, changes it and writes it back. The only
// writes are the store's conditional operations, so two concurrent requests
// for one account can never both take the last credit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::generator::{SignalGenerator, SignalPayload};
use super::{classify_rejection, cooldown_remaining, minutes_remaining, needs_daily_reset, next_reset, precheck};
use crate::config::QuotaConfig;
use crate::error::{GenerationError, StoreError};
use crate::events::{GenerationTicket, SubscriptionTier};
use crate::state::AccountStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReceipt {
    pub ticket: GenerationTicket,
    pub signal: SignalPayload,
}

/// Read-only view of where an account stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub daily_limit: Option<u32>,
    pub credits_used: u32,
    /// `None` = unbounded.
    pub credits_remaining: Option<u32>,
    pub cooldown_minutes_remaining: i64,
    pub can_generate: bool,
    pub next_reset: DateTime<Utc>,
}

pub struct GenerationGate {
    accounts: Arc<dyn AccountStore>,
    quota:    QuotaConfig,
}

impl GenerationGate {
    pub fn new(accounts: Arc<dyn AccountStore>, quota: QuotaConfig) -> Self {
        Self { accounts, quota }
    }

    fn store_error(user_id: &str, e: StoreError) -> GenerationError {
        match e {
            StoreError::NotFound { .. } => GenerationError::UnknownUser(user_id.to_string()),
            other => GenerationError::Unavailable(other),
        }
    }

    /// Advisory check. Only a definite rejection on a readable row stops the
    /// request here; the commit re-checks everything on the stored row anyway.
    pub async fn precheck(&self, user_id: &str, now: DateTime<Utc>) -> Result<(), GenerationError> {
        let user = match self.accounts.get_user(user_id).await {
            Ok(Some(u)) => u,
            Ok(None) => return Err(GenerationError::UnknownUser(user_id.to_string())),
            Err(e) => {
                warn!(user_id, error = %e, "quota pre-check unavailable, deferring to commit");
                return Ok(());
            }
        };
        if needs_daily_reset(&user, now, self.quota.reference_zone()) {
            return Ok(());
        }
        precheck(&user, self.quota.tiers.limits_for(user.subscription_tier), now)
    }

    pub async fn commit(&self, user_id: &str, now: DateTime<Utc>) -> Result<GenerationTicket, GenerationError> {
        let zone = self.quota.reference_zone();
        let reset = self
            .accounts
            .reset_daily_credits(user_id, now, zone)
            .await
            .map_err(|e| Self::store_error(user_id, e))?;
        if reset {
            debug!(user_id, "daily credits reset");
        }

        let consumed = self
            .accounts
            .try_consume_generation(user_id, &self.quota.tiers, now)
            .await
            .map_err(|e| Self::store_error(user_id, e))?;

        if let Some(ticket) = consumed {
            info!(user_id, tier = %ticket.tier, credits = ticket.previous_credits + 1, "generation credit committed");
            return Ok(ticket);
        }

        let user = self
            .accounts
            .get_user(user_id)
            .await
            .map_err(|e| Self::store_error(user_id, e))?
            .ok_or_else(|| GenerationError::UnknownUser(user_id.to_string()))?;
        let rejection = classify_rejection(&user, self.quota.tiers.limits_for(user.subscription_tier), now);
        debug!(user_id, %rejection, "generation commit rejected");
        Err(rejection)
    }

    pub async fn revert(&self, ticket: &GenerationTicket) -> Result<(), GenerationError> {
        self.accounts
            .revert_generation(ticket)
            .await
            .map_err(|e| Self::store_error(&ticket.user_id, e))
    }

    pub async fn generate<G: SignalGenerator + ?Sized>(
        &self,
        user_id: &str,
        timeframe: &str,
        generator: &G,
        now: DateTime<Utc>,
    ) -> Result<GenerationReceipt, GenerationError> {
        self.precheck(user_id, now).await?;
        let ticket = self.commit(user_id, now).await?;

        match generator.generate_signal(timeframe, ticket.tier, user_id).await {
            Ok(signal) => Ok(GenerationReceipt { ticket, signal }),
            Err(e) => {
                warn!(user_id, timeframe, error = %e, "signal generation failed, reverting credit");
                if let Err(revert_err) = self.revert(&ticket).await {
                    error!(user_id, error = %revert_err, "credit revert failed");
                }
                Err(GenerationError::GenerationFailed(e))
            }
        }
    }

    pub async fn status(&self, user_id: &str, now: DateTime<Utc>) -> Result<QuotaStatus, GenerationError> {
        let user = self
            .accounts
            .get_user(user_id)
            .await
            .map_err(|e| Self::store_error(user_id, e))?
            .ok_or_else(|| GenerationError::UnknownUser(user_id.to_string()))?;

        let zone = self.quota.reference_zone();
        let limits = self.quota.tiers.limits_for(user.subscription_tier);

        // A stale row is reported as it will look right after its reset.
        let (used, last) = if needs_daily_reset(&user, now, zone) {
            (0, None)
        } else {
            (user.daily_credits, user.last_generation_time)
        };
        let cooldown = cooldown_remaining(last, limits.cooldown(), now).unwrap_or_else(Duration::zero);
        let remaining = limits.daily_limit.map(|l| l.saturating_sub(used));

        Ok(QuotaStatus {
            user_id: user.id,
            tier: user.subscription_tier,
            daily_limit: limits.daily_limit,
            credits_used: used,
            credits_remaining: remaining,
            cooldown_minutes_remaining: minutes_remaining(cooldown),
            can_generate: remaining != Some(0) && cooldown <= Duration::zero(),
            next_reset: next_reset(now, zone),
        })
    }
}
