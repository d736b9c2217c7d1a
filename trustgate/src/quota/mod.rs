// trustgate/src/quota/mod.rs
//
// Generation quota arithmetic. Pure functions over a snapshot of the account
// row; the only writes happen in the store's conditional operations.
//
// Daily credits roll over at midnight in the configured reference zone, never
// at UTC midnight and never at server-local midnight.

pub mod gate;
pub mod generator;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::config::TierLimits;
use crate::error::GenerationError;
use crate::events::UserTrustState;

pub use gate::{GenerationGate, GenerationReceipt, QuotaStatus};
pub use generator::{QueuedGenerator, SignalGenerator, SignalPayload};

pub fn reference_date(at: DateTime<Utc>, zone: FixedOffset) -> NaiveDate {
    at.with_timezone(&zone).date_naive()
}

/// Whether the stored reset instant is on an earlier reference-zone day.
/// A row that was never reset always needs one.
pub fn needs_daily_reset(user: &UserTrustState, now: DateTime<Utc>, zone: FixedOffset) -> bool {
    match user.last_credit_reset {
        Some(last) => reference_date(last, zone) != reference_date(now, zone),
        None => true,
    }
}

/// Next reference-zone midnight after `now`, as a UTC instant.
pub fn next_reset(now: DateTime<Utc>, zone: FixedOffset) -> DateTime<Utc> {
    let tomorrow = reference_date(now, zone) + Duration::days(1);
    let local_midnight = tomorrow.and_time(NaiveTime::MIN);
    Utc.from_utc_datetime(&(local_midnight - Duration::seconds(zone.local_minus_utc() as i64)))
}

pub fn cooldown_remaining(
    last_generation: Option<DateTime<Utc>>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let ready_at = last_generation? + cooldown;
    (now < ready_at).then(|| ready_at - now)
}

/// Whole minutes, rounded up, never 0 for a positive remainder.
pub fn minutes_remaining(remaining: Duration) -> i64 {
    if remaining <= Duration::zero() {
        return 0;
    }
    ((remaining.num_seconds() + 59) / 60).max(1)
}

/// Advisory check against a snapshot. The limit is checked before the cooldown.
pub fn precheck(user: &UserTrustState, limits: TierLimits, now: DateTime<Utc>) -> Result<(), GenerationError> {
    if let Some(limit) = limits.daily_limit {
        if user.daily_credits >= limit {
            return Err(GenerationError::LimitReached { limit });
        }
    }
    if let Some(left) = cooldown_remaining(user.last_generation_time, limits.cooldown(), now) {
        return Err(GenerationError::CooldownActive { minutes_remaining: minutes_remaining(left) });
    }
    Ok(())
}

/// Explain a failed conditional commit from a fresh read of the row. If the
/// fresh row would pass, some other request changed it in between.
pub fn classify_rejection(user: &UserTrustState, limits: TierLimits, now: DateTime<Utc>) -> GenerationError {
    match precheck(user, limits, now) {
        Err(e) => e,
        Ok(()) => GenerationError::RaceLost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TierTable, DEFAULT_REFERENCE_OFFSET_SECS};
    use crate::events::SubscriptionTier;
    use assert_matches::assert_matches;

    fn zone() -> FixedOffset {
        FixedOffset::east_opt(DEFAULT_REFERENCE_OFFSET_SECS).unwrap()
    }

    #[test]
    fn reference_day_is_not_utc_day() {
        // 2026-03-02 19:00 UTC is 2026-03-03 00:30 in UTC+05:30.
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).unwrap();
        assert_eq!(reference_date(at, zone()), NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
        assert_eq!(reference_date(at, FixedOffset::east_opt(0).unwrap()), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }

    #[test]
    fn next_reset_is_reference_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        // 2026-03-03 00:00 +05:30 == 2026-03-02 18:30 UTC
        assert_eq!(next_reset(now, zone()), Utc.with_ymd_and_hms(2026, 3, 2, 18, 30, 0).unwrap());
    }

    #[test]
    fn reset_needed_across_reference_midnight() {
        let mut user = UserTrustState::new("u", SubscriptionTier::Free);
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 18, 0, 0).unwrap();
        assert!(needs_daily_reset(&user, now, zone()));
        user.last_credit_reset = Some(now);
        assert!(!needs_daily_reset(&user, now + Duration::minutes(29), zone()));
        assert!(needs_daily_reset(&user, now + Duration::minutes(31), zone()));
    }

    #[test]
    fn minutes_round_up() {
        assert_eq!(minutes_remaining(Duration::seconds(1)), 1);
        assert_eq!(minutes_remaining(Duration::seconds(60)), 1);
        assert_eq!(minutes_remaining(Duration::seconds(61)), 2);
        assert_eq!(minutes_remaining(Duration::minutes(89)), 89);
        assert_eq!(minutes_remaining(Duration::zero()), 0);
    }

    #[test]
    fn limit_wins_over_cooldown() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let free = TierTable::default().free;
        let mut user = UserTrustState::new("u", SubscriptionTier::Free);
        assert!(precheck(&user, free, now).is_ok());

        user.last_generation_time = Some(now - Duration::minutes(30));
        assert_matches!(precheck(&user, free, now), Err(GenerationError::CooldownActive { minutes_remaining: 60 }));

        user.daily_credits = 2;
        assert_matches!(precheck(&user, free, now), Err(GenerationError::LimitReached { limit: 2 }));
    }

    #[test]
    fn fresh_row_that_passes_means_race_lost() {
        let now = Utc::now();
        let user = UserTrustState::new("u", SubscriptionTier::Pro);
        assert_matches!(classify_rejection(&user, TierTable::default().pro, now), GenerationError::RaceLost);
    }
}
