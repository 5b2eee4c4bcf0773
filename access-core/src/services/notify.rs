//! Notification and geolocation collaborators.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::models::GeoLocation;

/// Delivery channel for out-of-band messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationChannel {
    Sms,
    Email,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Sms => "sms",
            NotificationChannel::Email => "email",
        }
    }
}

/// Outbound message dispatcher (MFA codes, high-risk-session alerts).
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        channel: NotificationChannel,
        target: &str,
        payload: &str,
    ) -> Result<(), anyhow::Error>;
}

/// IP geolocation collaborator.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self, ip: &str) -> Result<Option<GeoLocation>, anyhow::Error>;
}

/// Captures dispatched messages for assertions.
#[derive(Default)]
pub struct MemoryDispatcher {
    sent: Mutex<Vec<(NotificationChannel, String, String)>>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(NotificationChannel, String, String)> {
        self.sent.lock().expect("dispatcher mutex poisoned").clone()
    }
}

#[async_trait]
impl NotificationDispatcher for MemoryDispatcher {
    async fn send(
        &self,
        channel: NotificationChannel,
        target: &str,
        payload: &str,
    ) -> Result<(), anyhow::Error> {
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("dispatcher mutex poisoned: {}", e))?
            .push((channel, target.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Resolver that always answers with a fixed location (or nothing).
#[derive(Default)]
pub struct StaticGeoResolver {
    location: Option<GeoLocation>,
}

impl StaticGeoResolver {
    pub fn new(location: Option<GeoLocation>) -> Self {
        Self { location }
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, _ip: &str) -> Result<Option<GeoLocation>, anyhow::Error> {
        Ok(self.location.clone())
    }
}
