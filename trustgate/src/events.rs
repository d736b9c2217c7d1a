// trustgate/src/events.rs
//
// Shared domain types flowing through Trustgate.
//
//   SessionRecord          — one row per observed (user, device, IP) activity burst
//   UserTrustState         — the account fields the sharing and quota logic reads
//   SharingDetectionResult — transient scorer output, enforcement attached later
//   SecurityEvent          — append-only audit record
//
// Records serialize camelCase: that is the shape the session store and the
// HTTP layer already speak.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const UNKNOWN_DEVICE: &str = "unknown";

/// Normalize a client-supplied device id header. Missing, blank and the
/// literal "unknown" all collapse to `None`.
pub fn normalize_device_id(raw: Option<&str>) -> Option<String> {
    match raw.map(str::trim) {
        None | Some("") => None,
        Some(id) if id.eq_ignore_ascii_case(UNKNOWN_DEVICE) => None,
        Some(id) => Some(id.to_string()),
    }
}

// ── Subscription tiers ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Starter,
    Pro,
    Admin,
}

impl SubscriptionTier {
    /// Paying customers. Admin accounts are not billed and are not "paid".
    pub fn is_paid(self) -> bool {
        matches!(self, Self::Starter | Self::Pro)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Starter => write!(f, "starter"),
            Self::Pro => write!(f, "pro"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

// ── Device fingerprint ────────────────────────────────────────────────────────
// Collected by the browser client. Older clients only ever sent their device
// id as a bare string, which still shows up in stored sessions.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceFingerprint {
    Legacy(String),
    Structured(FingerprintBlob),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintBlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webgl_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_concurrency: Option<u32>,
    /// Anything else the client chose to send. Kept, never compared.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl FingerprintBlob {
    /// The fixed comparison field set, in a stable order. Empty strings count
    /// as absent.
    pub fn comparable_fields(&self) -> [Option<String>; 9] {
        let s = |v: &Option<String>| v.as_ref().filter(|x| !x.trim().is_empty()).cloned();
        [
            s(&self.browser),
            s(&self.os),
            s(&self.screen_resolution),
            s(&self.timezone),
            s(&self.language),
            s(&self.platform),
            s(&self.canvas_fingerprint),
            s(&self.webgl_fingerprint),
            self.hardware_concurrency.map(|n| n.to_string()),
        ]
    }
}

impl DeviceFingerprint {
    pub fn structured(&self) -> Option<&FingerprintBlob> {
        match self {
            Self::Structured(blob) => Some(blob),
            Self::Legacy(_) => None,
        }
    }

    /// SHA256[:8] over the comparable fields. A stable digest for audit records,
    /// so raw fingerprint material never lands in logs.
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut h = Sha256::new();
        match self {
            Self::Legacy(raw) => {
                h.update(b"legacy:");
                h.update(raw.as_bytes());
            }
            Self::Structured(blob) => {
                for field in blob.comparable_fields() {
                    h.update(field.unwrap_or_default().as_bytes());
                    h.update(b"|");
                }
            }
        }
        hex::encode(&h.finalize()[..8])
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: u64,
    pub user_id: String,
    pub device_id: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub device_fingerprint: Option<DeviceFingerprint>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    pub fn fingerprint_blob(&self) -> Option<&FingerprintBlob> {
        self.device_fingerprint.as_ref().and_then(DeviceFingerprint::structured)
    }
}

/// One inbound authenticated request as seen by the middleware.
/// `device_id` is the client header value, trusted as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub fingerprint: Option<DeviceFingerprint>,
}

impl RequestContext {
    pub fn new(
        user_id: impl Into<String>,
        device_id: Option<&str>,
        ip_address: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: normalize_device_id(device_id),
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: DeviceFingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

// ── Accounts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrustState {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
    #[serde(default)]
    pub daily_credits: u32,
    #[serde(default)]
    pub monthly_credits: u32,
    #[serde(default)]
    pub last_generation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_credit_reset: Option<DateTime<Utc>>,
}

impl UserTrustState {
    pub fn new(id: impl Into<String>, tier: SubscriptionTier) -> Self {
        Self {
            id: id.into(),
            email: None,
            first_name: None,
            subscription_tier: tier,
            daily_credits: 0,
            monthly_credits: 0,
            last_generation_time: None,
            last_credit_reset: None,
        }
    }
}

/// Partial profile update. Credit counters are deliberately absent: they only
/// move through the conditional quota operations on `AccountStore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    pub subscription_tier: Option<SubscriptionTier>,
    pub email: Option<String>,
    pub first_name: Option<String>,
}

/// Receipt for one committed generation credit. Carries the pre-commit values
/// the compensating revert needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTicket {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub previous_credits: u32,
    pub previous_generation_time: Option<DateTime<Utc>>,
    pub committed_at: DateTime<Utc>,
}

// ── Detection types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimultaneousAccess {
    pub is_simultaneous: bool,
    pub device_count: usize,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiAccountFinding {
    pub has_multiple_free_accounts: bool,
    pub free_account_count: usize,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    Allow,
    Restrict,
    Terminate,
}

impl std::fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Restrict => write!(f, "RESTRICT"),
            Self::Terminate => write!(f, "TERMINATE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementOutcome {
    pub action: EnforcementAction,
    pub message: String,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_terminated: Option<usize>,
}

impl EnforcementOutcome {
    pub fn allow() -> Self {
        Self {
            action: EnforcementAction::Allow,
            message: "Access allowed".into(),
            blocked: false,
            sessions_terminated: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingDetectionResult {
    pub is_sharing: bool,
    pub reason: String,
    pub confidence: f64,
    pub active_sessions: usize,
    pub suspicious_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement: Option<EnforcementOutcome>,
}

impl SharingDetectionResult {
    /// Returned whenever detection itself fails: never sharing, never blocked.
    pub fn safe_default() -> Self {
        Self {
            is_sharing: false,
            reason: "Detection unavailable".into(),
            confidence: 0.0,
            active_sessions: 0,
            suspicious_devices: Vec::new(),
            enforcement: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.enforcement.as_ref().map(|e| e.blocked).unwrap_or(false)
    }

    /// The structured 403 body for the HTTP layer, present iff blocked.
    pub fn rejection(&self) -> Option<Rejection> {
        let enforcement = self.enforcement.as_ref().filter(|e| e.blocked)?;
        Some(Rejection {
            message: enforcement.message.clone(),
            reason: self.reason.clone(),
            confidence: self.confidence,
            enforcement: enforcement.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub message: String,
    pub reason: String,
    pub confidence: f64,
    pub enforcement: EnforcementOutcome,
}

impl Rejection {
    pub const STATUS: u16 = 403;
}

// ── Audit records ─────────────────────────────────────────────────────────────

pub mod event_types {
    pub const SIMULTANEOUS_MULTI_DEVICE_BLOCKED: &str = "simultaneous_multi_device_blocked";
    pub const MULTIPLE_FREE_ACCOUNTS_BLOCKED: &str = "multiple_free_accounts_blocked";
    pub const SHARING_DETECTED_ALLOWED: &str = "sharing_detected_allowed";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub user_id: Option<String>,
    pub event_type: String,
    pub ip_address: String,
    pub details: serde_json::Value,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_normalization() {
        assert_eq!(normalize_device_id(None), None);
        assert_eq!(normalize_device_id(Some("  ")), None);
        assert_eq!(normalize_device_id(Some("Unknown")), None);
        assert_eq!(normalize_device_id(Some(" dev-1 ")), Some("dev-1".into()));
    }

    #[test]
    fn fingerprint_accepts_legacy_string_and_blob() {
        let legacy: DeviceFingerprint = serde_json::from_str("\"dev-abc\"").unwrap();
        assert_eq!(legacy, DeviceFingerprint::Legacy("dev-abc".into()));
        assert!(legacy.structured().is_none());

        let blob: DeviceFingerprint = serde_json::from_str(
            r#"{"browser":"Chrome","screenResolution":"1920x1080","hardwareConcurrency":8,"touch":true}"#,
        )
        .unwrap();
        let b = blob.structured().expect("structured blob");
        assert_eq!(b.screen_resolution.as_deref(), Some("1920x1080"));
        assert_eq!(b.hardware_concurrency, Some(8));
        assert_eq!(b.extra.get("touch"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn fingerprint_digest_ignores_free_form_fields() {
        let mut a = FingerprintBlob { browser: Some("Firefox".into()), ..Default::default() };
        let b = a.clone();
        a.extra.insert("battery".into(), serde_json::json!(0.5));
        assert_eq!(
            DeviceFingerprint::Structured(a).digest(),
            DeviceFingerprint::Structured(b).digest()
        );
    }

    #[test]
    fn rejection_only_when_blocked() {
        let mut result = SharingDetectionResult::safe_default();
        assert!(result.rejection().is_none());

        result.enforcement = Some(EnforcementOutcome::allow());
        assert!(result.rejection().is_none());

        result.enforcement = Some(EnforcementOutcome {
            action: EnforcementAction::Restrict,
            message: "restricted".into(),
            blocked: true,
            sessions_terminated: None,
        });
        let body = result.rejection().expect("blocked result has a rejection body");
        assert_eq!(body.message, "restricted");
        assert_eq!(body.enforcement.action, EnforcementAction::Restrict);
    }
}
