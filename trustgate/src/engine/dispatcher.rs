// trustgate/src/engine/dispatcher.rs
//
// Applies a policy decision.
// On TERMINATE: deactivates every session of the user, audits, notifies.
// On RESTRICT:  audits, notifies. Sessions stay alive, only this request is denied.
// On MONITOR:   audits, allows.
// Audit and notification are best-effort; only session termination can fail
// the dispatch. They are also rate limited per (user, event type): sessions
// stay listed for the whole detection window after a termination, so every
// follow-up request re-fires the same rule.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use super::policy::PolicyDecision;
use crate::error::StoreError;
use crate::events::{
    event_types, EnforcementAction, EnforcementOutcome, RequestContext, SecurityEvent, Severity,
    SharingDetectionResult, UserTrustState,
};
use crate::notify::Notifier;
use crate::state::{AuditLog, SessionStore};

pub const RESTRICT_MESSAGE: &str =
    "Multiple free accounts detected on this device. Upgrade to a paid plan to keep using it.";

pub struct Dispatcher {
    sessions:       Arc<dyn SessionStore>,
    audit:          Arc<dyn AuditLog>,
    notifier:       Arc<dyn Notifier>,
    alert_cooldown: Duration,
    last_alert:     DashMap<(String, &'static str), DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditLog>,
        notifier: Arc<dyn Notifier>,
        alert_cooldown: Duration,
    ) -> Self {
        Self { sessions, audit, notifier, alert_cooldown, last_alert: DashMap::new() }
    }

    /// Claims the alert slot for `(user_id, event_type)`. Check and stamp
    /// happen under one entry lock, so concurrent requests cannot both win.
    pub fn should_alert(&self, user_id: &str, event_type: &'static str, now: DateTime<Utc>) -> bool {
        match self.last_alert.entry((user_id.to_string(), event_type)) {
            Entry::Occupied(mut e) => {
                if now - *e.get() < self.alert_cooldown {
                    return false;
                }
                e.insert(now);
                true
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }

    /// Drops stamps older than the cooldown. Returns how many were dropped.
    pub fn prune_alerts(&self, now: DateTime<Utc>) -> usize {
        let before = self.last_alert.len();
        let cooldown = self.alert_cooldown;
        self.last_alert.retain(|_, t| now - *t < cooldown);
        before.saturating_sub(self.last_alert.len())
    }

    pub async fn dispatch(
        &self,
        decision: &PolicyDecision,
        req: &RequestContext,
        user: Option<&UserTrustState>,
        scored: &SharingDetectionResult,
        now: DateTime<Utc>,
    ) -> Result<EnforcementOutcome, StoreError> {
        let tier = user.map(|u| u.subscription_tier).unwrap_or_default();

        match decision {
            // ── TERMINATE ─────────────────────────────────────────────────────
            PolicyDecision::TerminateAll { access, threshold } => {
                let terminated = self.sessions.terminate_all_user_sessions(&req.user_id).await?;
                let message = format!(
                    "Account blocked: {} devices used at the same time (limit {} on the {} plan). \
                     All sessions have been signed out.",
                    access.device_count, threshold, tier
                );
                if self.should_alert(&req.user_id, event_types::SIMULTANEOUS_MULTI_DEVICE_BLOCKED, now) {
                    info!(
                        user_id = %req.user_id,
                        devices = access.device_count,
                        threshold,
                        terminated,
                        "TERMINATE simultaneous multi-device access"
                    );
                    self.record(SecurityEvent {
                        user_id:    Some(req.user_id.clone()),
                        event_type: event_types::SIMULTANEOUS_MULTI_DEVICE_BLOCKED.into(),
                        ip_address: req.ip_address.clone(),
                        details: json!({
                            "devices":            access.devices,
                            "deviceCount":        access.device_count,
                            "subscriptionTier":   tier,
                            "threshold":          threshold,
                            "action":             EnforcementAction::Terminate,
                            "sessionsTerminated": terminated,
                            "userAgent":          req.user_agent,
                        }),
                        severity:  Severity::Critical,
                        timestamp: now,
                    })
                    .await;
                    self.notify(user, &message).await;
                } else {
                    debug!(user_id = %req.user_id, terminated, "TERMINATE repeat, alert suppressed");
                }

                Ok(EnforcementOutcome {
                    action: EnforcementAction::Terminate,
                    message,
                    blocked: true,
                    sessions_terminated: Some(access.device_count),
                })
            }

            // ── RESTRICT ──────────────────────────────────────────────────────
            PolicyDecision::RestrictRequest { finding } => {
                if self.should_alert(&req.user_id, event_types::MULTIPLE_FREE_ACCOUNTS_BLOCKED, now) {
                    info!(
                        user_id = %req.user_id,
                        device_id = req.device_id.as_deref().unwrap_or(""),
                        free_accounts = finding.free_account_count,
                        "RESTRICT multiple free accounts on one device"
                    );
                    self.record(SecurityEvent {
                        user_id:    Some(req.user_id.clone()),
                        event_type: event_types::MULTIPLE_FREE_ACCOUNTS_BLOCKED.into(),
                        ip_address: req.ip_address.clone(),
                        details: json!({
                            "deviceId":         req.device_id,
                            "freeAccountCount": finding.free_account_count,
                            "userIds":          finding.user_ids,
                            "action":           EnforcementAction::Restrict,
                        }),
                        severity:  Severity::High,
                        timestamp: now,
                    })
                    .await;
                    self.notify(user, RESTRICT_MESSAGE).await;
                }

                Ok(EnforcementOutcome {
                    action: EnforcementAction::Restrict,
                    message: RESTRICT_MESSAGE.into(),
                    blocked: true,
                    sessions_terminated: None,
                })
            }

            // ── MONITOR ───────────────────────────────────────────────────────
            PolicyDecision::Monitor => {
                if self.should_alert(&req.user_id, event_types::SHARING_DETECTED_ALLOWED, now) {
                    self.record(SecurityEvent {
                        user_id:    Some(req.user_id.clone()),
                        event_type: event_types::SHARING_DETECTED_ALLOWED.into(),
                        ip_address: req.ip_address.clone(),
                        details: json!({
                            "confidence":        scored.confidence,
                            "reason":            scored.reason,
                            "activeSessions":    scored.active_sessions,
                            "suspiciousDevices": scored.suspicious_devices,
                            "fingerprint":       req.fingerprint.as_ref().map(|f| f.digest()),
                            "action":            EnforcementAction::Allow,
                        }),
                        severity:  Severity::Medium,
                        timestamp: now,
                    })
                    .await;
                }
                Ok(EnforcementOutcome::allow())
            }

            PolicyDecision::Allow => Ok(EnforcementOutcome::allow()),
        }
    }

    async fn record(&self, event: SecurityEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.audit.log_security_event(event).await {
            warn!(event_type = %event_type, error = %e, "audit write failed");
        }
    }

    async fn notify(&self, user: Option<&UserTrustState>, reason: &str) {
        let Some(user) = user else { return };
        let Some(email) = user.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            return;
        };
        if let Err(e) = self
            .notifier
            .send_account_blocked(email, user.first_name.as_deref(), reason)
            .await
        {
            warn!(user_id = %user.id, error = %e, "account-blocked notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::notify::LogNotifier;
    use crate::state::{InMemoryStore, MemoryAuditLog};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(InMemoryStore::default()),
            Arc::new(MemoryAuditLog::new()),
            Arc::new(LogNotifier),
            Duration::minutes(5),
        )
    }

    #[test]
    fn alert_cooldown_per_user_and_event_type() {
        let d = dispatcher();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let blocked = event_types::SIMULTANEOUS_MULTI_DEVICE_BLOCKED;

        assert!(d.should_alert("u1", blocked, t0));
        assert!(!d.should_alert("u1", blocked, t0 + Duration::seconds(10)));
        assert!(!d.should_alert("u1", blocked, t0 + Duration::seconds(299)));
        assert!(d.should_alert("u2", blocked, t0 + Duration::seconds(10)));
        assert!(d.should_alert("u1", event_types::SHARING_DETECTED_ALLOWED, t0));
        assert!(d.should_alert("u1", blocked, t0 + Duration::minutes(5)));
    }

    #[test]
    fn prune_drops_only_expired_stamps() {
        let d = dispatcher();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        d.should_alert("old", event_types::SHARING_DETECTED_ALLOWED, t0);
        d.should_alert("new", event_types::SHARING_DETECTED_ALLOWED, t0 + Duration::minutes(4));

        assert_eq!(d.prune_alerts(t0 + Duration::minutes(6)), 1);
        assert_eq!(d.prune_alerts(t0 + Duration::minutes(6)), 0);
        assert!(!d.should_alert("new", event_types::SHARING_DETECTED_ALLOWED, t0 + Duration::minutes(6)));
        assert!(d.should_alert("old", event_types::SHARING_DETECTED_ALLOWED, t0 + Duration::minutes(6)));
    }
}
