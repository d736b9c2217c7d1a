// trustgate/src/engine/policy.rs
//
// Tiered enforcement policy. First matching rule wins:
//
//   1. simultaneous devices > tier threshold  → TERMINATE every session of the user
//   2. >1 free accounts on the request device → RESTRICT this request only
//   3. scorer says sharing                    → ALLOW, audit for review
//   4. otherwise                              → ALLOW
//
// Punitive rules need a narrow deterministic signal plus a tier-aware
// threshold. The fuzzy confidence score never blocks on its own.
//
// Rule 2 denies the request but leaves existing sessions alive. That asymmetry
// with rule 1 is kept as is pending product confirmation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::dispatcher::Dispatcher;
use crate::config::DetectionConfig;
use crate::error::StoreError;
use crate::events::{
    EnforcementOutcome, MultiAccountFinding, RequestContext, SharingDetectionResult,
    SimultaneousAccess, SubscriptionTier,
};
use crate::state::{AccountStore, SessionStore};
use crate::workers::{multi_account, simultaneous};

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    TerminateAll { access: SimultaneousAccess, threshold: usize },
    RestrictRequest { finding: MultiAccountFinding },
    Monitor,
    Allow,
}

/// Rule 1 on its own, so the multi-account lookup only runs when it misses.
pub fn simultaneous_rule(
    access: &SimultaneousAccess,
    tier: SubscriptionTier,
    cfg: &DetectionConfig,
) -> Option<PolicyDecision> {
    let threshold = cfg.device_threshold(tier);
    (access.is_simultaneous && access.device_count > threshold).then(|| PolicyDecision::TerminateAll {
        access: access.clone(),
        threshold,
    })
}

/// Rules 2 to 4, evaluated once rule 1 did not fire.
pub fn fallback_rules(finding: &MultiAccountFinding, scored: &SharingDetectionResult) -> PolicyDecision {
    if finding.has_multiple_free_accounts && finding.free_account_count > 1 {
        PolicyDecision::RestrictRequest { finding: finding.clone() }
    } else if scored.is_sharing {
        PolicyDecision::Monitor
    } else {
        PolicyDecision::Allow
    }
}

pub struct PolicyEnforcer {
    sessions:   Arc<dyn SessionStore>,
    accounts:   Arc<dyn AccountStore>,
    dispatcher: Dispatcher,
    cfg:        DetectionConfig,
}

impl PolicyEnforcer {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        accounts: Arc<dyn AccountStore>,
        dispatcher: Dispatcher,
        cfg: DetectionConfig,
    ) -> Self {
        Self { sessions, accounts, dispatcher, cfg }
    }

    pub async fn decide(
        &self,
        req: &RequestContext,
        tier: SubscriptionTier,
        scored: &SharingDetectionResult,
        now: DateTime<Utc>,
    ) -> Result<PolicyDecision, StoreError> {
        let access = simultaneous::analyze(&req.user_id, self.sessions.as_ref(), &self.cfg, now).await?;
        if let Some(decision) = simultaneous_rule(&access, tier, &self.cfg) {
            return Ok(decision);
        }

        let finding = multi_account::analyze(
            req.device_id.as_deref(),
            self.sessions.as_ref(),
            self.accounts.as_ref(),
            &self.cfg,
            now,
        )
        .await?;
        Ok(fallback_rules(&finding, scored))
    }

    /// Decide, then apply side effects. Session-termination failures propagate;
    /// audit and notification failures do not.
    pub async fn enforce(
        &self,
        req: &RequestContext,
        scored: &SharingDetectionResult,
        now: DateTime<Utc>,
    ) -> Result<EnforcementOutcome, StoreError> {
        let user = self.accounts.get_user(&req.user_id).await?;
        // No account row: judged as free.
        let tier = user.as_ref().map(|u| u.subscription_tier).unwrap_or_default();

        let decision = self.decide(req, tier, scored, now).await?;
        debug!(user_id = %req.user_id, ?decision, "policy decision");
        if matches!(decision, PolicyDecision::Allow) {
            return Ok(EnforcementOutcome::allow());
        }
        self.dispatcher.dispatch(&decision, req, user.as_ref(), scored, now).await
    }

    pub fn prune_alerts(&self, now: DateTime<Utc>) -> usize {
        self.dispatcher.prune_alerts(now)
    }
}
