use serde::Deserialize;
use std::env;

/// Configuration for the whole security core.
///
/// `Default` carries the shipped tunables; `from_env` overlays environment
/// variables for deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    pub tokens: TokenConfig,
    pub sessions: SessionConfig,
    pub guard: GuardConfig,
    pub mfa: MfaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// HS256 signing secret for access credentials.
    pub secret: String,
    pub access_token_expiry_minutes: i64,
    /// Advise a refresh when less than this much validity remains.
    pub refresh_advice_window_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub session_timeout_hours: i64,
    pub refresh_timeout_days: i64,
    pub enable_location_tracking: bool,
    pub enable_device_fingerprinting: bool,
    /// Risk score above which creation is audited at high severity.
    pub high_risk_audit_threshold: u8,
    /// Risk score above which an out-of-band alert is dispatched.
    pub alert_threshold: u8,
    /// Validations within the trailing minute that mark a session suspicious.
    pub suspicious_activity_per_minute: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    /// Fallback window applied when no rule matches is the catch-all rule;
    /// these two fields size the default rule table's catch-all entry.
    pub default_window_secs: u64,
    pub default_max_requests: u32,
    pub lockout: LockoutConfig,
    pub ip_blocking: IpBlockConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    pub max_attempts: u32,
    pub lockout_duration_minutes: i64,
    /// Grow the lockout exponentially with repeated failures.
    pub progressive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpBlockConfig {
    pub enabled: bool,
    /// Failed-login attempts from one IP before it is blocked.
    pub suspicious_threshold: u32,
    pub auto_block_minutes: i64,
    /// Suspicious events from one IP before it is blocked automatically.
    pub auto_block_event_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    pub issuer: String,
    pub challenge_expiry_minutes: i64,
    pub max_concurrent_challenges: usize,
    pub max_attempts: u32,
    pub sms_code_length: usize,
    pub sms_max_attempts: u32,
    pub email_code_length: usize,
    pub email_max_attempts: u32,
    pub backup_code_length: usize,
    pub backup_code_count: usize,
    pub totp_digits: usize,
    pub totp_period: u64,
    pub totp_skew: u8,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tokens: TokenConfig {
                secret: "insecure-dev-secret".to_string(),
                access_token_expiry_minutes: 60,
                refresh_advice_window_minutes: 5,
            },
            sessions: SessionConfig {
                max_concurrent_sessions: 5,
                session_timeout_hours: 24,
                refresh_timeout_days: 30,
                enable_location_tracking: true,
                enable_device_fingerprinting: true,
                high_risk_audit_threshold: 70,
                alert_threshold: 80,
                suspicious_activity_per_minute: 50,
            },
            guard: GuardConfig {
                default_window_secs: 15 * 60,
                default_max_requests: 1000,
                lockout: LockoutConfig {
                    max_attempts: 5,
                    lockout_duration_minutes: 30,
                    progressive: true,
                },
                ip_blocking: IpBlockConfig {
                    enabled: true,
                    suspicious_threshold: 20,
                    auto_block_minutes: 60,
                    auto_block_event_threshold: 100,
                },
            },
            mfa: MfaConfig {
                issuer: "access-core".to_string(),
                challenge_expiry_minutes: 5,
                max_concurrent_challenges: 3,
                max_attempts: 3,
                sms_code_length: 6,
                sms_max_attempts: 3,
                email_code_length: 8,
                email_max_attempts: 3,
                backup_code_length: 8,
                backup_code_count: 10,
                totp_digits: 6,
                totp_period: 30,
                totp_skew: 1,
            },
        }
    }
}

impl CoreConfig {
    /// Load configuration from the environment, falling back to the shipped
    /// defaults for anything unset. The signing secret has no fallback.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let mut config = CoreConfig::default();

        config.tokens.secret = env::var("ACCESS_TOKEN_SECRET")
            .map_err(|_| anyhow::anyhow!("ACCESS_TOKEN_SECRET must be set"))?;
        config.tokens.access_token_expiry_minutes =
            get_env_parse("ACCESS_TOKEN_EXPIRY_MINUTES", 60)?;

        config.sessions.max_concurrent_sessions = get_env_parse("MAX_CONCURRENT_SESSIONS", 5)?;
        config.sessions.session_timeout_hours = get_env_parse("SESSION_TIMEOUT_HOURS", 24)?;
        config.sessions.refresh_timeout_days = get_env_parse("REFRESH_TIMEOUT_DAYS", 30)?;

        config.guard.lockout.max_attempts = get_env_parse("LOCKOUT_MAX_ATTEMPTS", 5)?;
        config.guard.lockout.lockout_duration_minutes =
            get_env_parse("LOCKOUT_DURATION_MINUTES", 30)?;
        config.guard.lockout.progressive = get_env_parse("LOCKOUT_PROGRESSIVE", true)?;
        config.guard.ip_blocking.auto_block_minutes = get_env_parse("IP_AUTO_BLOCK_MINUTES", 60)?;

        config.mfa.issuer = env::var("MFA_ISSUER").unwrap_or(config.mfa.issuer);

        Ok(config)
    }
}

/// Parse an environment variable, falling back to `default` when unset.
fn get_env_parse<T>(name: &str, default: T) -> Result<T, anyhow::Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_shipped_tunables() {
        let config = CoreConfig::default();
        assert_eq!(config.sessions.max_concurrent_sessions, 5);
        assert_eq!(config.guard.lockout.max_attempts, 5);
        assert_eq!(config.mfa.challenge_expiry_minutes, 5);
        assert_eq!(config.mfa.max_concurrent_challenges, 3);
        assert_eq!(config.tokens.access_token_expiry_minutes, 60);
    }
}
