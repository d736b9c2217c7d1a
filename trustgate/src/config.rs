// trustgate/src/config.rs
//
// Runtime configuration. Every section has serde defaults, so a config file
// only needs the keys it changes:
//
//   { "quota": { "referenceUtcOffsetSecs": 0 }, "throttle": { "maxRequests": 120 } }

use std::path::Path;

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::events::SubscriptionTier;

/// Calendar days for daily credits roll over in this zone, not UTC and not
/// server-local. UTC+05:30 has no DST, so a fixed offset is exact.
pub const DEFAULT_REFERENCE_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

// ── Detection ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectionConfig {
    /// Pairwise device similarity above which two sessions are one cluster.
    pub similarity_threshold: f64,
    /// Scorer confidence above which a user counts as sharing.
    pub sharing_confidence_threshold: f64,
    /// Sessions tolerated by analysis before sharing is forced.
    pub analysis_session_ceiling: usize,
    /// Active sessions kept per user at write time; older ones are evicted.
    pub max_active_sessions: usize,
    /// Distinct devices / IPs / browsers / OSes tolerated by the scorer.
    pub distinct_signal_threshold: usize,
    pub activity_window_secs: i64,
    pub simultaneous_window_secs: i64,
    pub bucket_secs: i64,
    /// Minimum gap between two audit records / notifications of the same kind
    /// for one user. The decision itself still applies on every request.
    pub alert_cooldown_secs: i64,
    /// Simultaneous-device thresholds; enforcement needs strictly more.
    pub paid_device_threshold: usize,
    pub free_device_threshold: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold:         0.7,
            sharing_confidence_threshold: 0.8,
            analysis_session_ceiling:     5,
            max_active_sessions:          2,
            distinct_signal_threshold:    2,
            activity_window_secs:         24 * 60 * 60,
            simultaneous_window_secs:     5 * 60,
            bucket_secs:                  5 * 60,
            alert_cooldown_secs:          5 * 60,
            paid_device_threshold:        3,
            free_device_threshold:        5,
        }
    }
}

impl DetectionConfig {
    pub fn activity_window(&self) -> Duration {
        Duration::seconds(self.activity_window_secs)
    }

    pub fn simultaneous_window(&self) -> Duration {
        Duration::seconds(self.simultaneous_window_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::seconds(self.alert_cooldown_secs)
    }

    pub fn device_threshold(&self, tier: SubscriptionTier) -> usize {
        if tier.is_paid() { self.paid_device_threshold } else { self.free_device_threshold }
    }
}

// ── Generation quotas ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierLimits {
    /// `None` = unbounded.
    pub daily_limit: Option<u32>,
    pub cooldown_minutes: i64,
}

impl TierLimits {
    pub fn cooldown(&self) -> Duration {
        Duration::minutes(self.cooldown_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub free:    TierLimits,
    pub starter: TierLimits,
    pub pro:     TierLimits,
    pub admin:   TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free:    TierLimits { daily_limit: Some(2),  cooldown_minutes: 90 },
            starter: TierLimits { daily_limit: Some(10), cooldown_minutes: 30 },
            pro:     TierLimits { daily_limit: None,     cooldown_minutes: 15 },
            admin:   TierLimits { daily_limit: None,     cooldown_minutes: 0 },
        }
    }
}

impl TierTable {
    pub fn limits_for(&self, tier: SubscriptionTier) -> TierLimits {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Starter => self.starter,
            SubscriptionTier::Pro => self.pro,
            SubscriptionTier::Admin => self.admin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaConfig {
    pub reference_utc_offset_secs: i32,
    pub tiers: TierTable,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reference_utc_offset_secs: DEFAULT_REFERENCE_OFFSET_SECS,
            tiers: TierTable::default(),
        }
    }
}

impl QuotaConfig {
    pub fn reference_zone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.reference_utc_offset_secs)
            .or_else(|| FixedOffset::east_opt(DEFAULT_REFERENCE_OFFSET_SECS))
            .unwrap_or_else(|| Utc.fix())
    }
}

// ── Request throttle ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottleConfig {
    pub max_requests: u64,
    pub window_secs: i64,
    pub sweep_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { max_requests: 60, window_secs: 60, sweep_interval_secs: 300 }
    }
}

// ── Top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub quota:     QuotaConfig,
    pub throttle:  ThrottleConfig,
}

impl Config {
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p).await,
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if FixedOffset::east_opt(self.quota.reference_utc_offset_secs).is_none() {
            return Err(ConfigError::Invalid(format!(
                "quota.referenceUtcOffsetSecs out of range: {}",
                self.quota.reference_utc_offset_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.detection.similarity_threshold) {
            return Err(ConfigError::Invalid("detection.similarityThreshold must be in [0, 1]".into()));
        }
        if self.detection.max_active_sessions == 0 {
            return Err(ConfigError::Invalid("detection.maxActiveSessions must be at least 1".into()));
        }
        if self.detection.bucket_secs <= 0
            || self.detection.activity_window_secs <= 0
            || self.detection.simultaneous_window_secs <= 0
            || self.detection.alert_cooldown_secs < 0
            || self.throttle.window_secs <= 0
        {
            return Err(ConfigError::Invalid("window lengths must be positive and alertCooldownSecs non-negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "quota": { "tiers": { "free": { "dailyLimit": 3, "cooldownMinutes": 60 } } } }"#)
                .unwrap();
        assert_eq!(cfg.quota.tiers.free.daily_limit, Some(3));
        assert_eq!(cfg.quota.tiers.starter.daily_limit, Some(10));
        assert_eq!(cfg.quota.reference_utc_offset_secs, DEFAULT_REFERENCE_OFFSET_SECS);
        assert_eq!(cfg.detection.max_active_sessions, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tier_thresholds() {
        let d = DetectionConfig::default();
        assert_eq!(d.device_threshold(SubscriptionTier::Starter), 3);
        assert_eq!(d.device_threshold(SubscriptionTier::Pro), 3);
        assert_eq!(d.device_threshold(SubscriptionTier::Free), 5);
        assert_eq!(d.device_threshold(SubscriptionTier::Admin), 5);
    }

    #[test]
    fn out_of_range_offset_rejected() {
        let mut cfg = Config::default();
        cfg.quota.reference_utc_offset_secs = 90_000;
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.quota.reference_zone().local_minus_utc(), DEFAULT_REFERENCE_OFFSET_SECS);
    }

    #[test]
    fn non_positive_detection_windows_rejected() {
        for secs in [0, -300] {
            let mut cfg = Config::default();
            cfg.detection.simultaneous_window_secs = secs;
            assert!(cfg.validate().is_err());

            let mut cfg = Config::default();
            cfg.detection.activity_window_secs = secs;
            assert!(cfg.validate().is_err());
        }
        let mut cfg = Config::default();
        cfg.detection.alert_cooldown_secs = -1;
        assert!(cfg.validate().is_err());
        cfg.detection.alert_cooldown_secs = 0;
        assert!(cfg.validate().is_ok());
    }
}
