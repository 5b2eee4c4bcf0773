//! Device profiling: user-agent parsing and fingerprint derivation.

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::models::{DeviceInput, DeviceProfile};

/// Derive a device profile from raw client signals.
///
/// The fingerprint is deterministic over the user agent plus client hints,
/// so the same browser on the same machine keys the same trust-cache slot.
pub fn build_profile(input: &DeviceInput) -> DeviceProfile {
    let platform = parse_platform(&input.user_agent);

    DeviceProfile {
        device: parse_device(&input.user_agent).to_string(),
        os: parse_os(&input.user_agent).to_string(),
        browser: parse_browser(&input.user_agent).to_string(),
        platform: platform.to_string(),
        fingerprint: fingerprint(input, platform),
        user_agent: input.user_agent.clone(),
        ip_address: input.ip_address.clone(),
        last_seen: Utc::now(),
    }
}

/// Stable 16-hex-char fingerprint over user agent and client hints.
pub fn fingerprint(input: &DeviceInput, platform: &str) -> String {
    let parts = [
        Some(input.user_agent.as_str()),
        input.screen_resolution.as_deref(),
        input.timezone.as_deref(),
        input.language.as_deref(),
        Some(platform),
    ];
    let joined = parts
        .iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("|");

    let digest = hex::encode(Sha256::digest(joined.as_bytes()));
    digest[..16].to_string()
}

pub fn parse_device(user_agent: &str) -> &'static str {
    if ["Mobile", "Android", "iPhone", "iPad"]
        .iter()
        .any(|m| user_agent.contains(m))
    {
        return "Mobile";
    }
    if user_agent.contains("Tablet") {
        return "Tablet";
    }
    "Desktop"
}

pub fn parse_os(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows NT 10.0") {
        return "Windows 10";
    }
    if user_agent.contains("Windows NT") {
        return "Windows";
    }
    if user_agent.contains("Mac OS X") {
        return "macOS";
    }
    if user_agent.contains("Android") {
        return "Android";
    }
    if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        return "iOS";
    }
    if user_agent.contains("Linux") {
        return "Linux";
    }
    "Unknown"
}

pub fn parse_browser(user_agent: &str) -> &'static str {
    if user_agent.contains("Edge/") {
        return "Edge";
    }
    if user_agent.contains("Chrome/") {
        return "Chrome";
    }
    if user_agent.contains("Firefox/") {
        return "Firefox";
    }
    if user_agent.contains("Safari/") && !user_agent.contains("Chrome") {
        return "Safari";
    }
    "Unknown"
}

pub fn parse_platform(user_agent: &str) -> &'static str {
    if user_agent.contains("Win") {
        return "Windows";
    }
    if user_agent.contains("Mac") {
        return "Macintosh";
    }
    if user_agent.contains("Linux") {
        return "Linux";
    }
    if user_agent.contains("X11") {
        return "Unix";
    }
    "Unknown"
}

/// Whether the address falls in a private or loopback range.
pub fn is_private_ip(ip: &str) -> bool {
    if ip.starts_with("10.") || ip.starts_with("192.168.") || ip.starts_with("127.") {
        return true;
    }
    if ip == "::1" || ip == "localhost" {
        return true;
    }
    if let Some(rest) = ip.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next() {
            if let Ok(octet) = second.parse::<u8>() {
                return (16..=31).contains(&octet);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKTOP_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
    const MOBILE_UA: &str =
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15";

    #[test]
    fn test_user_agent_parsing() {
        assert_eq!(parse_device(DESKTOP_UA), "Desktop");
        assert_eq!(parse_os(DESKTOP_UA), "Windows 10");
        assert_eq!(parse_browser(DESKTOP_UA), "Chrome");

        assert_eq!(parse_device(MOBILE_UA), "Mobile");
        assert_eq!(parse_os(MOBILE_UA), "iOS");
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let input = DeviceInput {
            user_agent: DESKTOP_UA.to_string(),
            ip_address: "203.0.113.9".to_string(),
            screen_resolution: Some("1920x1080".to_string()),
            timezone: Some("America/New_York".to_string()),
            language: Some("en-US".to_string()),
        };
        let a = build_profile(&input);
        let b = build_profile(&input);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 16);

        let other = DeviceInput {
            timezone: Some("Europe/Berlin".to_string()),
            ..input
        };
        assert_ne!(build_profile(&other).fingerprint, a.fingerprint);
    }

    #[test]
    fn test_private_ip_ranges() {
        assert!(is_private_ip("10.0.0.5"));
        assert!(is_private_ip("192.168.1.20"));
        assert!(is_private_ip("172.16.0.1"));
        assert!(is_private_ip("172.31.255.1"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(!is_private_ip("172.32.0.1"));
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("203.0.113.9"));
    }
}
