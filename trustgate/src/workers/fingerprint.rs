// trustgate/src/workers/fingerprint.rs
//
// Device comparator: how likely two session records come from the same device.
//
//   user agent   exact 0.4 | same browser AND OS family 0.2
//   IP           exact 0.3 | same /24 0.1
//   fingerprint  matching / comparable fields, weight 0.3 (only if both carry a blob)
//
// The result is divided by the weight actually evaluated, so a pair with no
// fingerprint is scored out of 0.7 and a pair with one out of 1.0. Identical
// records score 1.0, records sharing nothing score 0.0.

use std::net::Ipv4Addr;

use crate::events::SessionRecord;

use super::round4;

pub const SIMILARITY_THRESHOLD: f64 = 0.7;

const W_UA_EXACT:  f64 = 0.4;
const W_UA_COARSE: f64 = 0.2;
const W_IP_EXACT:  f64 = 0.3;
const W_IP_SUBNET: f64 = 0.1;
const W_FP:        f64 = 0.3;

// ── User-agent families ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Windows,
    Mac,
    Linux,
    Android,
    Ios,
}

/// Edge UAs also claim Chrome and Safari, Chrome UAs also claim Safari:
/// the more specific token is checked first.
pub fn browser_family(ua: &str) -> Option<BrowserFamily> {
    if ua.contains("Edg") {
        Some(BrowserFamily::Edge)
    } else if ua.contains("Chrome") || ua.contains("CriOS") {
        Some(BrowserFamily::Chrome)
    } else if ua.contains("Firefox") || ua.contains("FxiOS") {
        Some(BrowserFamily::Firefox)
    } else if ua.contains("Safari") {
        Some(BrowserFamily::Safari)
    } else {
        None
    }
}

/// iOS UAs say "like Mac OS X", Android UAs say "Linux".
pub fn os_family(ua: &str) -> Option<OsFamily> {
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        Some(OsFamily::Ios)
    } else if ua.contains("Android") {
        Some(OsFamily::Android)
    } else if ua.contains("Windows") {
        Some(OsFamily::Windows)
    } else if ua.contains("Mac OS") || ua.contains("Macintosh") {
        Some(OsFamily::Mac)
    } else if ua.contains("Linux") || ua.contains("X11") {
        Some(OsFamily::Linux)
    } else {
        None
    }
}

pub fn coarse_ua_match(a: &str, b: &str) -> bool {
    match (browser_family(a), browser_family(b), os_family(a), os_family(b)) {
        (Some(ba), Some(bb), Some(oa), Some(ob)) => ba == bb && oa == ob,
        _ => false,
    }
}

// ── IP prefix ─────────────────────────────────────────────────────────────────

pub fn subnet_24(ip: &str) -> Option<[u8; 3]> {
    let addr: Ipv4Addr = ip.trim().parse().ok()?;
    let o = addr.octets();
    Some([o[0], o[1], o[2]])
}

pub fn same_subnet_24(a: &str, b: &str) -> bool {
    match (subnet_24(a), subnet_24(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

// ── Scoring ───────────────────────────────────────────────────────────────────

// Equal strings are an exact match even when empty: a client that never sends
// the header still looks like itself.
fn ua_score(a: &str, b: &str) -> f64 {
    if a == b {
        W_UA_EXACT
    } else if coarse_ua_match(a, b) {
        W_UA_COARSE
    } else {
        0.0
    }
}

fn ip_score(a: &str, b: &str) -> f64 {
    let (a, b) = (a.trim(), b.trim());
    if a == b {
        W_IP_EXACT
    } else if same_subnet_24(a, b) {
        W_IP_SUBNET
    } else {
        0.0
    }
}

/// Fraction of matching fields among those present in both blobs. `None` when
/// either record has no structured blob or no field is present in both.
fn fingerprint_score(a: &SessionRecord, b: &SessionRecord) -> Option<f64> {
    let (fa, fb) = (a.fingerprint_blob()?, b.fingerprint_blob()?);
    let mut comparable = 0usize;
    let mut matching = 0usize;
    for (x, y) in fa.comparable_fields().iter().zip(fb.comparable_fields().iter()) {
        if let (Some(x), Some(y)) = (x, y) {
            comparable += 1;
            if x == y {
                matching += 1;
            }
        }
    }
    (comparable > 0).then(|| matching as f64 / comparable as f64)
}

pub fn device_similarity(a: &SessionRecord, b: &SessionRecord) -> f64 {
    let mut score  = ua_score(&a.user_agent, &b.user_agent) + ip_score(&a.ip_address, &b.ip_address);
    let mut weight = W_UA_EXACT + W_IP_EXACT;

    if let Some(fp) = fingerprint_score(a, b) {
        score  += fp * W_FP;
        weight += W_FP;
    }
    round4((score / weight).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceFingerprint, FingerprintBlob};
    use chrono::Utc;

    const CHROME_WIN: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
    const CHROME_WIN_OLD: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0 Safari/537.36";
    const EDGE_WIN: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36 Edg/124.0";
    const SAFARI_IOS: &str =
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";
    const FIREFOX_ANDROID: &str = "Mozilla/5.0 (Android 14; Mobile; rv:125.0) Gecko/125.0 Firefox/125.0";

    fn session(ua: &str, ip: &str, fp: Option<FingerprintBlob>) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: 1,
            user_id: "u1".into(),
            device_id: Some("d1".into()),
            ip_address: ip.into(),
            user_agent: ua.into(),
            device_fingerprint: fp.map(DeviceFingerprint::Structured),
            is_active: true,
            created_at: now,
            last_activity: now,
        }
    }

    fn blob() -> FingerprintBlob {
        FingerprintBlob {
            browser: Some("Chrome".into()),
            os: Some("Windows".into()),
            screen_resolution: Some("1920x1080".into()),
            timezone: Some("Asia/Kolkata".into()),
            canvas_fingerprint: Some("c4nv45".into()),
            hardware_concurrency: Some(8),
            ..Default::default()
        }
    }

    #[test]
    fn families_resolve_specific_tokens_first() {
        assert_eq!(browser_family(EDGE_WIN), Some(BrowserFamily::Edge));
        assert_eq!(browser_family(CHROME_WIN), Some(BrowserFamily::Chrome));
        assert_eq!(browser_family(SAFARI_IOS), Some(BrowserFamily::Safari));
        assert_eq!(browser_family(FIREFOX_ANDROID), Some(BrowserFamily::Firefox));
        assert_eq!(browser_family("curl/8.4.0"), None);

        assert_eq!(os_family(SAFARI_IOS), Some(OsFamily::Ios));
        assert_eq!(os_family(FIREFOX_ANDROID), Some(OsFamily::Android));
        assert_eq!(os_family(CHROME_WIN), Some(OsFamily::Windows));
    }

    #[test]
    fn identical_records_score_one() {
        let a = session(CHROME_WIN, "203.0.113.7", Some(blob()));
        assert_eq!(device_similarity(&a, &a.clone()), 1.0);

        let bare = session(CHROME_WIN, "203.0.113.7", None);
        assert_eq!(device_similarity(&bare, &bare.clone()), 1.0);

        // No User-Agent header at all.
        let no_ua = session("", "10.0.0.1", None);
        assert_eq!(device_similarity(&no_ua, &no_ua.clone()), 1.0);

        let nothing = session("", "", None);
        assert_eq!(device_similarity(&nothing, &nothing.clone()), 1.0);
    }

    #[test]
    fn missing_user_agent_on_one_side_does_not_match() {
        let a = session("", "10.0.0.1", None);
        let b = session(CHROME_WIN, "10.0.0.1", None);
        // 0.3 / 0.7
        assert_eq!(device_similarity(&a, &b), 0.4286);
    }

    #[test]
    fn disjoint_records_score_zero() {
        let a = session(CHROME_WIN, "203.0.113.7", Some(blob()));
        let other = FingerprintBlob {
            browser: Some("Safari".into()),
            os: Some("iOS".into()),
            screen_resolution: Some("390x844".into()),
            timezone: Some("Europe/London".into()),
            canvas_fingerprint: Some("zzz".into()),
            hardware_concurrency: Some(6),
            ..Default::default()
        };
        let b = session(SAFARI_IOS, "198.51.100.20", Some(other));
        assert_eq!(device_similarity(&a, &b), 0.0);
    }

    #[test]
    fn coarse_ua_and_subnet_match_without_fingerprint() {
        let a = session(CHROME_WIN, "203.0.113.7", None);
        let b = session(CHROME_WIN_OLD, "203.0.113.99", None);
        // (0.2 + 0.1) / 0.7
        assert_eq!(device_similarity(&a, &b), 0.4286);
        assert!(device_similarity(&a, &b) < SIMILARITY_THRESHOLD);
    }

    #[test]
    fn legacy_fingerprint_is_not_compared() {
        let mut a = session(CHROME_WIN, "203.0.113.7", None);
        a.device_fingerprint = Some(DeviceFingerprint::Legacy("d1".into()));
        let b = session(CHROME_WIN, "203.0.113.7", Some(blob()));
        assert_eq!(device_similarity(&a, &b), 1.0);
    }

    #[test]
    fn fingerprint_only_counts_shared_fields() {
        let mut partial = blob();
        partial.canvas_fingerprint = None;
        partial.timezone = Some("UTC".into());
        let a = session(CHROME_WIN, "203.0.113.7", Some(blob()));
        let b = session(CHROME_WIN, "203.0.113.7", Some(partial));
        // 5 shared fields, 4 match: (0.4 + 0.3 + 0.3 * 0.8) / 1.0
        assert_eq!(device_similarity(&a, &b), 0.94);
    }

    #[test]
    fn subnet_parse() {
        assert_eq!(subnet_24("10.1.2.3"), Some([10, 1, 2]));
        assert_eq!(subnet_24("::1"), None);
        assert!(!same_subnet_24("10.1.2.3", "10.1.3.3"));
    }
}
