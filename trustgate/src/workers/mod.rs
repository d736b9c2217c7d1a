pub mod confidence;
pub mod fingerprint;
pub mod multi_account;
pub mod simultaneous;

use std::collections::BTreeSet;

use crate::events::SessionRecord;

/// Scores are kept to 4 decimals so threshold comparisons are deterministic.
pub(crate) fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Distinct known device ids across `sessions`, sorted.
pub(crate) fn distinct_devices(sessions: &[&SessionRecord]) -> Vec<String> {
    sessions
        .iter()
        .filter_map(|s| s.device_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
