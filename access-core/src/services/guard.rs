//! Request guard: rate limiting, IP blocking, and account lockout.
//!
//! Consulted first on every request. All three stores are in-memory with
//! sweep-based expiry; losing them on restart is an accepted tradeoff.
//! Every outcome is a value, never an error.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::GuardConfig;
use crate::models::{SecurityEvent, SecurityEventKind, Severity};

use super::audit::AuditService;

/// Sweep cadences per store.
const RATE_LIMIT_SWEEP_SECS: u64 = 5 * 60;
const IP_BLOCK_SWEEP_SECS: u64 = 60;
const SUSPICIOUS_SWEEP_SECS: u64 = 60 * 60;
/// Suspicious-activity buckets idle longer than this are dropped.
const SUSPICIOUS_RETENTION_HOURS: i64 = 24;
/// Idle time after which a bucket's event count restarts.
const SUSPICIOUS_RESET_SECS: i64 = 60 * 60;
/// IP failed-login attempts are counted within this window.
const IP_ATTEMPT_WINDOW_SECS: i64 = 60 * 60;

/// Per-endpoint throttling rule. The longest matching endpoint prefix wins.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub endpoint: String,
    pub window_secs: u64,
    pub max_requests: u32,
    /// Key the counter by authenticated user instead of source IP.
    pub by_user: bool,
}

impl RateLimitRule {
    pub fn new(endpoint: &str, window_secs: u64, max_requests: u32, by_user: bool) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            window_secs,
            max_requests,
            by_user,
        }
    }
}

/// Identity of the request being screened, as resolved by the outer layer.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub ip: String,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome of screening one request.
#[derive(Debug, Clone)]
pub enum GuardVerdict {
    Allow,
    /// The source IP is on the blocklist. Rejected before any other check.
    Blocked { reason: String },
    /// The endpoint's rate limit was exceeded. The counter is not reset.
    Throttled {
        limit: u32,
        current: u32,
        window_reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardVerdict::Allow)
    }

    /// HTTP-equivalent status for the outer layer.
    pub fn status(&self) -> u16 {
        match self {
            GuardVerdict::Allow => 200,
            GuardVerdict::Blocked { .. } => 403,
            GuardVerdict::Throttled { .. } => 429,
        }
    }
}

/// Which lockout track an identifier belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockoutKind {
    /// Account-level, keyed by email.
    Email,
    /// Source-level, keyed by IP.
    Ip,
}

/// Result of reporting a failed login.
#[derive(Debug, Clone)]
pub struct LockoutStatus {
    pub locked: bool,
    pub lock_duration_secs: Option<u64>,
    pub attempts_remaining: Option<u32>,
}

/// Snapshot of the guard's in-memory state.
#[derive(Debug, Clone)]
pub struct GuardStats {
    pub rate_limit_entries: usize,
    pub blocked_ips: usize,
    pub active_lockouts: usize,
    pub suspicious_sources: usize,
}

/// Typed counter key: (rule endpoint, identifier).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateLimitKey(String, String);

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct IpBlock {
    blocked_until: DateTime<Utc>,
    reason: String,
}

#[derive(Debug, Clone)]
struct ActivityBucket {
    events: u64,
    last_event: DateTime<Utc>,
    minute_count: u32,
    minute_started: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockoutKey(LockoutKind, String);

#[derive(Debug, Clone)]
struct LockoutEntry {
    attempts: u32,
    locked_until: Option<DateTime<Utc>>,
    /// IP-track attempts age out; account-track attempts persist until
    /// cleared by a successful login.
    window_reset_at: Option<DateTime<Utc>>,
}

struct GuardState {
    config: GuardConfig,
    audit: AuditService,
    rules: Vec<RateLimitRule>,
    rate_limits: DashMap<RateLimitKey, RateLimitEntry>,
    ip_blocks: DashMap<String, IpBlock>,
    suspicious: DashMap<String, ActivityBucket>,
    lockouts: DashMap<LockoutKey, LockoutEntry>,
}

pub struct SecurityGuard {
    state: Arc<GuardState>,
    sweepers: Vec<JoinHandle<()>>,
}

impl SecurityGuard {
    /// Build the guard with the default rule table and start its sweepers.
    /// Must be called within a tokio runtime.
    pub fn new(config: GuardConfig, audit: AuditService) -> Self {
        let rules = default_rules(&config);
        Self::with_rules(config, audit, rules)
    }

    pub fn with_rules(config: GuardConfig, audit: AuditService, rules: Vec<RateLimitRule>) -> Self {
        let state = Arc::new(GuardState {
            config,
            audit,
            rules,
            rate_limits: DashMap::new(),
            ip_blocks: DashMap::new(),
            suspicious: DashMap::new(),
            lockouts: DashMap::new(),
        });

        let sweepers = vec![
            Self::spawn_rate_limit_sweeper(state.clone()),
            Self::spawn_ip_block_sweeper(state.clone()),
            Self::spawn_suspicious_sweeper(state.clone()),
        ];

        tracing::info!(rules = state.rules.len(), "Security guard initialized");
        Self { state, sweepers }
    }

    pub fn shutdown(&self) {
        for task in &self.sweepers {
            task.abort();
        }
    }

    /// Screen a request. Check order: IP blocklist, rate limit, then
    /// suspicious-activity scoring on requests that pass.
    pub fn evaluate(&self, identity: &RequestIdentity, endpoint: &str) -> GuardVerdict {
        let state = &self.state;

        if state.config.ip_blocking.enabled && self.is_ip_blocked(&identity.ip) {
            state.audit.report(
                SecurityEvent::new(SecurityEventKind::IpBlocked, Severity::High, "request_denied")
                    .actor(&identity.ip)
                    .resource(endpoint)
                    .outcome("denied")
                    .meta("reason", json!("Blocked IP attempted access")),
            );
            return GuardVerdict::Blocked {
                reason: "Access denied".to_string(),
            };
        }

        if let Some(rule) = self.match_rule(endpoint) {
            let identifier = match (&identity.user_id, rule.by_user) {
                (Some(user_id), true) => format!("user_{}", user_id),
                _ => identity.ip.clone(),
            };

            let now = Utc::now();
            let key = RateLimitKey(rule.endpoint.clone(), identifier.clone());
            let (count, window_reset_at) = {
                let mut entry = state.rate_limits.entry(key).or_insert_with(|| {
                    RateLimitEntry {
                        count: 0,
                        window_reset_at: now + Duration::seconds(rule.window_secs as i64),
                    }
                });
                if entry.window_reset_at <= now {
                    // The window resets wholesale; there is no decay.
                    entry.count = 0;
                    entry.window_reset_at = now + Duration::seconds(rule.window_secs as i64);
                }
                entry.count += 1;
                (entry.count, entry.window_reset_at)
            };

            if count > rule.max_requests {
                let retry_after_secs = (window_reset_at - now).num_seconds().max(1) as u64;
                state.audit.report(
                    SecurityEvent::new(
                        SecurityEventKind::RateLimitExceeded,
                        Severity::Medium,
                        "request_throttled",
                    )
                    .actor(&identifier)
                    .resource(endpoint)
                    .outcome("throttled")
                    .meta("limit", json!(rule.max_requests))
                    .meta("current", json!(count))
                    .meta("window_reset_at", json!(window_reset_at)),
                );
                return GuardVerdict::Throttled {
                    limit: rule.max_requests,
                    current: count,
                    window_reset_at,
                    retry_after_secs,
                };
            }
        }

        self.score_suspicious_activity(identity, endpoint);
        GuardVerdict::Allow
    }

    /// Record a failed login attempt for an identifier and report whether it
    /// is now locked out.
    pub fn handle_failed_login(&self, identifier: &str, kind: LockoutKind) -> LockoutStatus {
        let state = &self.state;
        let now = Utc::now();

        match kind {
            LockoutKind::Email => {
                let max_attempts = state.config.lockout.max_attempts;
                let key = LockoutKey(kind, identifier.to_string());
                let (attempts, locked_until) = {
                    let mut entry = state.lockouts.entry(key).or_insert_with(|| LockoutEntry {
                        attempts: 0,
                        locked_until: None,
                        window_reset_at: None,
                    });
                    entry.attempts += 1;
                    if entry.attempts >= max_attempts {
                        let duration = self.lockout_duration(entry.attempts);
                        entry.locked_until = Some(now + duration);
                    }
                    (entry.attempts, entry.locked_until)
                };

                if let Some(locked_until) = locked_until {
                    let duration_secs = (locked_until - now).num_seconds().max(0) as u64;
                    state.audit.report(
                        SecurityEvent::new(
                            SecurityEventKind::AccountLockout,
                            Severity::High,
                            "account_locked",
                        )
                        .actor(identifier)
                        .outcome("locked")
                        .meta("attempts", json!(attempts))
                        .meta("lock_duration_secs", json!(duration_secs)),
                    );
                    tracing::warn!(
                        identifier = %identifier,
                        attempts = attempts,
                        "Account locked out"
                    );
                    return LockoutStatus {
                        locked: true,
                        lock_duration_secs: Some(duration_secs),
                        attempts_remaining: Some(max_attempts.saturating_sub(attempts)),
                    };
                }

                LockoutStatus {
                    locked: false,
                    lock_duration_secs: None,
                    attempts_remaining: Some(max_attempts.saturating_sub(attempts)),
                }
            }
            LockoutKind::Ip => {
                let threshold = state.config.ip_blocking.suspicious_threshold;
                let key = LockoutKey(kind, identifier.to_string());
                let attempts = {
                    let mut entry = state.lockouts.entry(key).or_insert_with(|| LockoutEntry {
                        attempts: 0,
                        locked_until: None,
                        window_reset_at: Some(now + Duration::seconds(IP_ATTEMPT_WINDOW_SECS)),
                    });
                    if matches!(entry.window_reset_at, Some(reset) if reset <= now) {
                        entry.attempts = 0;
                        entry.window_reset_at =
                            Some(now + Duration::seconds(IP_ATTEMPT_WINDOW_SECS));
                    }
                    entry.attempts += 1;
                    entry.attempts
                };

                if attempts >= threshold {
                    self.block_ip(identifier, "Excessive failed login attempts", None);
                    let duration_secs =
                        (state.config.ip_blocking.auto_block_minutes * 60).max(0) as u64;
                    return LockoutStatus {
                        locked: true,
                        lock_duration_secs: Some(duration_secs),
                        attempts_remaining: Some(0),
                    };
                }

                LockoutStatus {
                    locked: false,
                    lock_duration_secs: None,
                    attempts_remaining: Some(threshold.saturating_sub(attempts)),
                }
            }
        }
    }

    /// Reset an identifier's failure counter (successful login or explicit
    /// clear).
    pub fn clear_failed_attempts(&self, identifier: &str, kind: LockoutKind) {
        self.state
            .lockouts
            .remove(&LockoutKey(kind, identifier.to_string()));
    }

    /// Whether an identifier is currently locked out.
    pub fn is_locked_out(&self, identifier: &str, kind: LockoutKind) -> bool {
        let key = LockoutKey(kind, identifier.to_string());
        match self.state.lockouts.get(&key) {
            Some(entry) => matches!(entry.locked_until, Some(until) if until > Utc::now()),
            None => false,
        }
    }

    /// Put an IP on the blocklist. `duration` defaults to the configured
    /// auto-block duration.
    pub fn block_ip(&self, ip: &str, reason: &str, duration: Option<Duration>) {
        let state = &self.state;
        let duration = duration
            .unwrap_or_else(|| Duration::minutes(state.config.ip_blocking.auto_block_minutes));
        state.ip_blocks.insert(
            ip.to_string(),
            IpBlock {
                blocked_until: Utc::now() + duration,
                reason: reason.to_string(),
            },
        );

        state.audit.report(
            SecurityEvent::new(SecurityEventKind::IpBlocked, Severity::High, "ip_blocked")
                .actor(ip)
                .meta("reason", json!(reason))
                .meta("duration_secs", json!(duration.num_seconds())),
        );
        tracing::warn!(ip = %ip, reason = %reason, "IP blocked");
    }

    pub fn unblock_ip(&self, ip: &str) {
        self.state.ip_blocks.remove(ip);
        tracing::info!(ip = %ip, "IP unblocked");
    }

    /// Blocklist lookup with lazy expiry.
    pub fn is_ip_blocked(&self, ip: &str) -> bool {
        let expired = match self.state.ip_blocks.get(ip) {
            Some(block) => block.blocked_until <= Utc::now(),
            None => return false,
        };
        if expired {
            self.state.ip_blocks.remove(ip);
            return false;
        }
        true
    }

    pub fn stats(&self) -> GuardStats {
        let now = Utc::now();
        GuardStats {
            rate_limit_entries: self.state.rate_limits.len(),
            blocked_ips: self.state.ip_blocks.len(),
            active_lockouts: self
                .state
                .lockouts
                .iter()
                .filter(|e| matches!(e.value().locked_until, Some(until) if until > now))
                .count(),
            suspicious_sources: self.state.suspicious.len(),
        }
    }

    /// Most specific configured rule: longest matching endpoint prefix.
    fn match_rule(&self, endpoint: &str) -> Option<&RateLimitRule> {
        self.state
            .rules
            .iter()
            .filter(|rule| endpoint.starts_with(&rule.endpoint))
            .max_by_key(|rule| rule.endpoint.len())
    }

    fn lockout_duration(&self, attempts: u32) -> Duration {
        let lockout = &self.state.config.lockout;
        let base = Duration::minutes(lockout.lockout_duration_minutes);
        if !lockout.progressive {
            return base;
        }

        // 30min, 1h, 2h, 4h, ... capped at 48x (roughly a day).
        let exponent = attempts.saturating_sub(lockout.max_attempts).min(6);
        let multiplier = (1u32 << exponent).min(48);
        base * multiplier as i32
    }

    /// Track per-IP request volume and flag suspicious patterns. Runs on
    /// every allowed request; may auto-block but never denies the current
    /// one.
    fn score_suspicious_activity(&self, identity: &RequestIdentity, endpoint: &str) {
        let state = &self.state;
        let now = Utc::now();

        let bucket = {
            let mut entry = state
                .suspicious
                .entry(identity.ip.clone())
                .or_insert_with(|| ActivityBucket {
                    events: 0,
                    last_event: now,
                    minute_count: 0,
                    minute_started: now,
                });
            if (now - entry.last_event).num_seconds() > SUSPICIOUS_RESET_SECS {
                entry.events = 0;
                entry.minute_count = 0;
                entry.minute_started = now;
            }
            if (now - entry.minute_started).num_seconds() >= 60 {
                entry.minute_count = 0;
                entry.minute_started = now;
            }
            entry.events += 1;
            entry.minute_count += 1;
            entry.last_event = now;
            entry.clone()
        };

        let ua = identity.user_agent.as_deref().unwrap_or("");
        let ua_lower = ua.to_lowercase();
        let mut patterns: Vec<&str> = Vec::new();

        if bucket.minute_count > 50 {
            patterns.push("rapid_requests");
        }
        if ua.is_empty()
            || ua.len() < 10
            || ua_lower.contains("bot")
            || ua_lower.contains("crawler")
            || ua_lower.contains("spider")
        {
            patterns.push("suspicious_user_agent");
        }
        if endpoint.contains("auth") && bucket.events > 10 {
            patterns.push("auth_endpoint_abuse");
        }

        if patterns.is_empty() {
            return;
        }

        state.audit.report(
            SecurityEvent::new(
                SecurityEventKind::SuspiciousActivity,
                Severity::Medium,
                "suspicious_activity",
            )
            .actor(&identity.ip)
            .resource(endpoint)
            .meta("user_agent", json!(ua))
            .meta("event_count", json!(bucket.events))
            .meta("patterns", json!(patterns)),
        );

        if bucket.events > state.config.ip_blocking.auto_block_event_threshold {
            self.block_ip(&identity.ip, "Automated suspicious activity detected", None);
        }
    }

    fn spawn_rate_limit_sweeper(state: Arc<GuardState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(RATE_LIMIT_SWEEP_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                state
                    .rate_limits
                    .retain(|_, entry| entry.window_reset_at > now);
                // IP-track lockout windows age out alongside.
                state.lockouts.retain(|key, entry| {
                    if key.0 != LockoutKind::Ip {
                        return true;
                    }
                    let window_open = matches!(entry.window_reset_at, Some(reset) if reset > now);
                    let still_locked = matches!(entry.locked_until, Some(until) if until > now);
                    window_open || still_locked
                });
            }
        })
    }

    fn spawn_ip_block_sweeper(state: Arc<GuardState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(IP_BLOCK_SWEEP_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                state.ip_blocks.retain(|_, block| block.blocked_until > now);
            }
        })
    }

    fn spawn_suspicious_sweeper(state: Arc<GuardState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(SUSPICIOUS_SWEEP_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - Duration::hours(SUSPICIOUS_RETENTION_HOURS);
                state
                    .suspicious
                    .retain(|_, bucket| bucket.last_event > cutoff);
            }
        })
    }
}

impl Drop for SecurityGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Default rule table. Authentication endpoints are tight, the catch-all is
/// sized by config.
fn default_rules(config: &GuardConfig) -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new("/api/auth/login", 15 * 60, 5, false),
        RateLimitRule::new("/api/auth/register", 60 * 60, 3, false),
        RateLimitRule::new("/api/auth/forgot-password", 60 * 60, 3, false),
        RateLimitRule::new("/api/auth/mfa", 15 * 60, 10, true),
        RateLimitRule::new("/api/trades", 60, 10, true),
        RateLimitRule::new("/api/waivers", 60, 20, true),
        RateLimitRule::new(
            "/api",
            config.default_window_secs,
            config.default_max_requests,
            false,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::services::audit::{AuditService, MemoryAuditSink};

    fn test_guard(rules: Vec<RateLimitRule>) -> SecurityGuard {
        let config = CoreConfig::default().guard;
        let audit = AuditService::new(Arc::new(MemoryAuditSink::new()));
        SecurityGuard::with_rules(config, audit, rules)
    }

    #[tokio::test]
    async fn test_longest_prefix_rule_wins() {
        let guard = test_guard(vec![
            RateLimitRule::new("/api", 60, 100, false),
            RateLimitRule::new("/api/auth/login", 60, 2, false),
        ]);

        let rule = guard.match_rule("/api/auth/login").unwrap();
        assert_eq!(rule.max_requests, 2);

        let rule = guard.match_rule("/api/leagues").unwrap();
        assert_eq!(rule.max_requests, 100);

        assert!(guard.match_rule("/health").is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_throttles_without_reset() {
        let guard = test_guard(vec![RateLimitRule::new("/api/trades", 60, 3, false)]);
        let identity = RequestIdentity {
            ip: "203.0.113.7".to_string(),
            user_id: None,
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".to_string()),
        };

        for _ in 0..3 {
            assert!(guard.evaluate(&identity, "/api/trades").is_allowed());
        }

        match guard.evaluate(&identity, "/api/trades") {
            GuardVerdict::Throttled {
                limit,
                current,
                retry_after_secs,
                ..
            } => {
                assert_eq!(limit, 3);
                assert_eq!(current, 4);
                assert!(retry_after_secs > 0);
            }
            other => panic!("expected throttle, got {:?}", other),
        }

        // Still throttled: rejection does not reset the counter.
        assert!(!guard.evaluate(&identity, "/api/trades").is_allowed());
    }

    #[tokio::test]
    async fn test_by_user_identifier() {
        let guard = test_guard(vec![RateLimitRule::new("/api/waivers", 60, 1, true)]);
        let alice = RequestIdentity {
            ip: "203.0.113.7".to_string(),
            user_id: Some("alice".to_string()),
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".to_string()),
        };
        let bob = RequestIdentity {
            user_id: Some("bob".to_string()),
            ..alice.clone()
        };

        assert!(guard.evaluate(&alice, "/api/waivers").is_allowed());
        assert!(!guard.evaluate(&alice, "/api/waivers").is_allowed());
        // Same IP, different user: separate counter.
        assert!(guard.evaluate(&bob, "/api/waivers").is_allowed());
    }

    #[tokio::test]
    async fn test_blocked_ip_rejected_before_rate_limit() {
        let guard = test_guard(vec![RateLimitRule::new("/api", 60, 100, false)]);
        guard.block_ip("10.0.0.5", "Security test", None);

        let identity = RequestIdentity {
            ip: "10.0.0.5".to_string(),
            user_id: None,
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".to_string()),
        };
        match guard.evaluate(&identity, "/api/leagues") {
            GuardVerdict::Blocked { .. } => {}
            other => panic!("expected block, got {:?}", other),
        }
        assert_eq!(guard.evaluate(&identity, "/api/leagues").status(), 403);

        guard.unblock_ip("10.0.0.5");
        assert!(guard.evaluate(&identity, "/api/leagues").is_allowed());
    }

    #[tokio::test]
    async fn test_progressive_lockout_duration() {
        let guard = test_guard(Vec::new());

        // At the threshold the base duration applies, then it doubles.
        assert_eq!(guard.lockout_duration(5), Duration::minutes(30));
        assert_eq!(guard.lockout_duration(6), Duration::minutes(60));
        assert_eq!(guard.lockout_duration(7), Duration::minutes(120));
        // Capped at 48x (~24h).
        assert_eq!(guard.lockout_duration(30), Duration::minutes(30 * 48));
    }

    #[tokio::test]
    async fn test_account_lockout_and_clear() {
        let guard = test_guard(Vec::new());

        for i in 1..5 {
            let status = guard.handle_failed_login("user@example.com", LockoutKind::Email);
            assert!(!status.locked);
            assert_eq!(status.attempts_remaining, Some(5 - i));
        }

        let status = guard.handle_failed_login("user@example.com", LockoutKind::Email);
        assert!(status.locked);
        assert!(status.lock_duration_secs.unwrap() > 0);
        assert!(guard.is_locked_out("user@example.com", LockoutKind::Email));

        guard.clear_failed_attempts("user@example.com", LockoutKind::Email);
        assert!(!guard.is_locked_out("user@example.com", LockoutKind::Email));
        let status = guard.handle_failed_login("user@example.com", LockoutKind::Email);
        assert_eq!(status.attempts_remaining, Some(4));
    }

    #[tokio::test]
    async fn test_ip_track_blocks_at_threshold() {
        let guard = test_guard(Vec::new());

        let mut locked = false;
        for _ in 0..20 {
            locked = guard
                .handle_failed_login("198.51.100.4", LockoutKind::Ip)
                .locked;
        }
        assert!(locked);
        assert!(guard.is_ip_blocked("198.51.100.4"));
    }
}
