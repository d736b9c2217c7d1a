// trustgate/src/engine/guard.rs
//
// Single entry point for request middleware:
//   record activity → fetch 24h sessions → score → enforce → attach outcome
//
// Fails open. Any store error yields the safe default (not sharing, not
// blocked): availability wins over strict enforcement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::dispatcher::Dispatcher;
use super::policy::PolicyEnforcer;
use crate::config::DetectionConfig;
use crate::error::StoreError;
use crate::events::{normalize_device_id, RequestContext, SharingDetectionResult};
use crate::notify::Notifier;
use crate::state::{AccountStore, AuditLog, SessionStore};
use crate::workers::confidence::score_sessions;

pub struct SharingGuard {
    sessions: Arc<dyn SessionStore>,
    enforcer: PolicyEnforcer,
    cfg:      DetectionConfig,
}

impl SharingGuard {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        accounts: Arc<dyn AccountStore>,
        audit: Arc<dyn AuditLog>,
        notifier: Arc<dyn Notifier>,
        cfg: DetectionConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(sessions.clone(), audit, notifier, cfg.alert_cooldown());
        let enforcer = PolicyEnforcer::new(sessions.clone(), accounts, dispatcher, cfg.clone());
        Self { sessions, enforcer, cfg }
    }

    /// Housekeeping for the per-user alert cooldown.
    pub fn prune_alerts(&self, now: DateTime<Utc>) -> usize {
        self.enforcer.prune_alerts(now)
    }

    pub async fn detect_and_enforce(&self, req: &RequestContext) -> SharingDetectionResult {
        self.detect_and_enforce_at(req, Utc::now()).await
    }

    pub async fn detect_and_enforce_at(
        &self,
        req: &RequestContext,
        now: DateTime<Utc>,
    ) -> SharingDetectionResult {
        match self.run(req, now).await {
            Ok(result) => result,
            Err(e) => {
                error!(user_id = %req.user_id, error = %e, "sharing detection failed, allowing request");
                SharingDetectionResult::safe_default()
            }
        }
    }

    async fn run(
        &self,
        req: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<SharingDetectionResult, StoreError> {
        let mut req = req.clone();
        req.device_id = normalize_device_id(req.device_id.as_deref());

        self.sessions
            .update_session_activity(
                &req.user_id,
                req.device_id.as_deref(),
                &req.ip_address,
                &req.user_agent,
                req.fingerprint.as_ref(),
                now,
            )
            .await?;

        let recent = self
            .sessions
            .get_user_sessions(&req.user_id, now - self.cfg.activity_window())
            .await?;
        let mut result = score_sessions(&recent, req.device_id.as_deref(), &self.cfg);

        let outcome = self.enforcer.enforce(&req, &result, now).await?;
        if outcome.blocked {
            info!(
                user_id = %req.user_id,
                action = %outcome.action,
                confidence = result.confidence,
                reason = %result.reason,
                "request blocked"
            );
        }
        result.enforcement = Some(outcome);
        Ok(result)
    }
}
