//! Best-effort user-agent classification.
//!
//! Rules are plain case-insensitive substring checks evaluated in order, the
//! first hit wins. The mapping is total and deterministic: the identity cache
//! relies on one raw string always producing the same triple.

use crate::models::{DeviceType, UserAgentIdentity};

pub const UNKNOWN: &str = "Unknown";

const OS_RULES: &[(&[&str], &str)] = &[
    (&["windows"], "Windows"),
    (&["android"], "Android"),
    (&["iphone", "ipad", "ipod"], "iOS"),
    (&["macintosh", "mac os"], "macOS"),
    (&["cros "], "Chrome OS"),
    (&["linux"], "Linux"),
];

// Edge and Opera carry "chrome" too, and Chrome carries "safari".
const BROWSER_RULES: &[(&[&str], &str)] = &[
    (&["edg"], "Edge"),
    (&["opr/", "opera"], "Opera"),
    (&["msie", "trident"], "Internet Explorer"),
    (&["firefox", "fxios"], "Firefox"),
    (&["chrome", "crios"], "Chrome"),
    (&["safari"], "Safari"),
];

const TABLET_TOKENS: &[&str] = &["ipad", "tablet"];
const MOBILE_TOKENS: &[&str] = &["mobile", "android", "iphone", "ipod"];

fn first_match(ua: &str, rules: &[(&[&str], &'static str)]) -> &'static str {
    rules
        .iter()
        .find(|(tokens, _)| tokens.iter().any(|t| ua.contains(t)))
        .map_or(UNKNOWN, |(_, name)| *name)
}

fn contains_any(ua: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|t| ua.contains(t))
}

pub fn classify_os(raw: &str) -> &'static str {
    first_match(&raw.to_lowercase(), OS_RULES)
}

pub fn classify_browser(raw: &str) -> &'static str {
    first_match(&raw.to_lowercase(), BROWSER_RULES)
}

pub fn classify_device(raw: &str) -> DeviceType {
    if raw.trim().is_empty() {
        return DeviceType::Unknown;
    }
    let ua = raw.to_lowercase();
    if contains_any(&ua, TABLET_TOKENS) {
        DeviceType::Tablet
    } else if contains_any(&ua, MOBILE_TOKENS) {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

/// Maps a raw user-agent string to its identity. Never fails.
pub fn normalize(raw: &str) -> UserAgentIdentity {
    if raw.trim().is_empty() {
        return UserAgentIdentity {
            raw: raw.to_owned(),
            os: UNKNOWN.to_owned(),
            browser: UNKNOWN.to_owned(),
            device_type: DeviceType::Unknown,
        };
    }
    UserAgentIdentity {
        raw: raw.to_owned(),
        os: classify_os(raw).to_owned(),
        browser: classify_browser(raw).to_owned(),
        device_type: classify_device(raw),
    }
}
