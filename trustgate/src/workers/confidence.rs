// trustgate/src/workers/confidence.rs
//
// Sharing confidence scorer over one user's last-24h sessions.
//
// Signals (additive, capped at 1.0):
//   >2 devices          +0.3      >2 browsers        +0.2
//   >2 IPs              +0.2      >2 OS families     +0.3
//   simultaneous bucket +0.4      suspicious cluster +0.6
//   sessions > ceiling  +0.5
//
// The score is observability only. Blocking decisions live in the policy
// enforcer and rely on the narrow 5-minute detectors.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::fingerprint::{browser_family, device_similarity, os_family};
use super::round4;
use crate::config::DetectionConfig;
use crate::events::{SessionRecord, SharingDetectionResult};

const C_DEVICES:      f64 = 0.3;
const C_IPS:          f64 = 0.2;
const C_SIMULTANEOUS: f64 = 0.4;
const C_CEILING:      f64 = 0.5;
const C_BROWSERS:     f64 = 0.2;
const C_OSES:         f64 = 0.3;
const C_SUSPICIOUS:   f64 = 0.6;

pub const REASON_UNUSUAL: &str = "Unusual access patterns detected";
pub const REASON_NONE:    &str = "No suspicious activity";

/// Greedy clustering: each ungrouped session seeds a cluster and absorbs every
/// later ungrouped session scoring strictly above the threshold against it.
/// A multi-member cluster containing a device other than the requester's marks
/// all its members' devices suspicious.
fn suspicious_clusters(
    sessions: &[SessionRecord],
    current_device: Option<&str>,
    threshold: f64,
) -> (bool, Vec<String>) {
    let mut grouped = vec![false; sessions.len()];
    let mut found = false;
    let mut devices: Vec<String> = Vec::new();

    for i in 0..sessions.len() {
        if grouped[i] {
            continue;
        }
        grouped[i] = true;
        let mut cluster = vec![i];
        for j in (i + 1)..sessions.len() {
            if !grouped[j] && device_similarity(&sessions[i], &sessions[j]) > threshold {
                grouped[j] = true;
                cluster.push(j);
            }
        }
        if cluster.len() < 2 {
            continue;
        }
        if cluster.iter().any(|&k| sessions[k].device_id.as_deref() != current_device) {
            found = true;
            for &k in &cluster {
                if let Some(d) = &sessions[k].device_id {
                    if !devices.contains(d) {
                        devices.push(d.clone());
                    }
                }
            }
        }
    }
    (found, devices)
}

/// Wall-clock buckets of `last_activity`; counts buckets with more than one
/// distinct device or IP.
fn simultaneous_buckets(sessions: &[SessionRecord], bucket_secs: i64) -> usize {
    let mut map: BTreeMap<i64, (HashSet<&str>, HashSet<&str>)> = BTreeMap::new();
    for s in sessions {
        let key = s.last_activity.timestamp().div_euclid(bucket_secs.max(1));
        let slot = map.entry(key).or_default();
        if let Some(d) = s.device_id.as_deref() {
            slot.0.insert(d);
        }
        slot.1.insert(s.ip_address.as_str());
    }
    map.values().filter(|(devices, ips)| devices.len() > 1 || ips.len() > 1).count()
}

pub fn score_sessions(
    sessions: &[SessionRecord],
    current_device: Option<&str>,
    cfg: &DetectionConfig,
) -> SharingDetectionResult {
    let n = sessions.len();
    let limit = cfg.distinct_signal_threshold;

    let (suspicious, suspicious_devices) =
        suspicious_clusters(sessions, current_device, cfg.similarity_threshold);

    let devices:  HashSet<&str> = sessions.iter().filter_map(|s| s.device_id.as_deref()).collect();
    let ips:      HashSet<&str> = sessions.iter().map(|s| s.ip_address.as_str()).collect();
    let browsers: HashSet<_>    = sessions.iter().filter_map(|s| browser_family(&s.user_agent)).collect();
    let oses:     HashSet<_>    = sessions.iter().filter_map(|s| os_family(&s.user_agent)).collect();

    let simultaneous = simultaneous_buckets(sessions, cfg.bucket_secs);
    let over_ceiling = n > cfg.analysis_session_ceiling;

    let mut confidence = 0.0f64;
    if devices.len() > limit      { confidence += C_DEVICES; }
    if ips.len() > limit          { confidence += C_IPS; }
    if simultaneous > 0           { confidence += C_SIMULTANEOUS; }
    if over_ceiling               { confidence += C_CEILING; }
    if browsers.len() > limit     { confidence += C_BROWSERS; }
    if oses.len() > limit         { confidence += C_OSES; }
    if suspicious                 { confidence += C_SUSPICIOUS; }
    let confidence = round4(confidence.min(1.0));

    let is_sharing = confidence > cfg.sharing_confidence_threshold || over_ceiling;

    let mut reasons: Vec<String> = Vec::new();
    if over_ceiling {
        reasons.push(format!("Too many active sessions ({n})"));
    }
    if devices.len() > limit {
        reasons.push(format!("Multiple devices ({})", devices.len()));
    }
    if ips.len() > limit {
        reasons.push(format!("Multiple IP addresses ({})", ips.len()));
    }
    if simultaneous > 0 {
        reasons.push(format!(
            "Simultaneous access detected ({} overlapping windows)",
            simultaneous
        ));
    }
    if suspicious {
        reasons.push("Suspicious device fingerprints".to_string());
    }
    if browsers.len() > limit {
        reasons.push(format!("Multiple browsers ({})", browsers.len()));
    }

    let reason = if !reasons.is_empty() {
        reasons.join(", ")
    } else if is_sharing {
        REASON_UNUSUAL.to_string()
    } else {
        REASON_NONE.to_string()
    };

    debug!(
        sessions = n,
        devices = devices.len(),
        ips = ips.len(),
        simultaneous_buckets = simultaneous,
        confidence,
        "sharing score"
    );

    SharingDetectionResult {
        is_sharing,
        reason,
        confidence,
        active_sessions: n,
        suspicious_devices,
        enforcement: None,
    }
}
