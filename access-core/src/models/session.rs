//! Session model - device-tracked authenticated sessions with risk flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::Severity;

/// Raw device signals supplied by the client at session creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInput {
    pub user_agent: String,
    pub ip_address: String,
    pub screen_resolution: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
}

/// Device profile derived from a [`DeviceInput`].
///
/// The fingerprint is a stable hash over user-agent-derived fields plus
/// client hints. It is a trust cache key, not a security boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device: String,
    pub os: String,
    pub browser: String,
    pub platform: String,
    pub fingerprint: String,
    pub user_agent: String,
    pub ip_address: String,
    pub last_seen: DateTime<Utc>,
}

/// Resolved location of a session's source IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    pub region: String,
    pub city: String,
    pub coordinates: Option<(f64, f64)>,
}

/// Categories of anomalies flagged on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFlagKind {
    NewDevice,
    NewLocation,
    UnusualActivity,
    ConcurrentSession,
    SuspiciousIp,
}

impl SessionFlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionFlagKind::NewDevice => "new_device",
            SessionFlagKind::NewLocation => "new_location",
            SessionFlagKind::UnusualActivity => "unusual_activity",
            SessionFlagKind::ConcurrentSession => "concurrent_session",
            SessionFlagKind::SuspiciousIp => "suspicious_ip",
        }
    }
}

/// Append-only audit marker attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFlag {
    pub kind: SessionFlagKind,
    pub severity: Severity,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionFlag {
    pub fn new(kind: SessionFlagKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Session entity.
///
/// Owns exactly one refresh credential at a time; `refresh_hash` is the
/// sha256 of the currently valid refresh credential. Rotation replaces it,
/// it is never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub device: DeviceProfile,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub risk_score: u8,
    pub flags: Vec<SessionFlag>,
    pub location: Option<GeoLocation>,
    pub refresh_hash: String,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Record an anomaly. Flags only accumulate, and each one raises the
    /// risk score monotonically (capped at 100).
    pub fn add_flag(&mut self, flag: SessionFlag) {
        self.flags.push(flag);
        self.risk_score = self.risk_score.saturating_add(20).min(100);
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_activity = now;
        self.device.last_seen = now;
    }
}

/// Options accepted by session creation.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Extend the session to the refresh-credential lifetime.
    pub remember_me: bool,
    /// Skip the unseen-device risk signal (e.g. right after enrollment).
    pub bypass_device_check: bool,
    /// Client-supplied coordinates for the location-anomaly heuristic.
    pub geo_location: Option<(f64, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            device: DeviceProfile {
                device: "Desktop".to_string(),
                os: "Linux".to_string(),
                browser: "Firefox".to_string(),
                platform: "Linux".to_string(),
                fingerprint: "abcd1234abcd1234".to_string(),
                user_agent: "Mozilla/5.0".to_string(),
                ip_address: "10.0.0.2".to_string(),
                last_seen: Utc::now(),
            },
            created_at: Utc::now(),
            last_activity: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
            is_active: true,
            risk_score: 0,
            flags: Vec::new(),
            location: None,
            refresh_hash: "hash".to_string(),
        }
    }

    #[test]
    fn test_flags_accumulate_and_cap_risk() {
        let mut session = sample_session();
        for _ in 0..7 {
            session.add_flag(SessionFlag::new(
                SessionFlagKind::UnusualActivity,
                Severity::High,
                "spike",
            ));
        }
        assert_eq!(session.flags.len(), 7);
        assert_eq!(session.risk_score, 100);
    }

    #[test]
    fn test_expiry_comparison() {
        let mut session = sample_session();
        assert!(!session.is_expired());
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(session.is_expired());
    }
}
