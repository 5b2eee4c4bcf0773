//! Audit pipeline: fire-and-forget delivery of security events.
//!
//! Every decision the core makes is reported here. Recording must never
//! block or fail the decision itself, so writes happen on a detached task
//! and failures are only logged.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::models::SecurityEvent;

/// Durable event log collaborator.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: SecurityEvent) -> Result<(), anyhow::Error>;
}

/// Non-blocking front door to the audit sink.
#[derive(Clone)]
pub struct AuditService {
    sink: Arc<dyn AuditSink>,
}

impl AuditService {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Record an event asynchronously. Sink failures are logged and dropped.
    pub fn report(&self, event: SecurityEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let kind = event.kind;
            if let Err(e) = sink.record(event).await {
                tracing::error!(
                    error = %e,
                    event_kind = kind.as_str(),
                    "Failed to write security audit event"
                );
            }
        });
    }
}

/// In-memory sink used by tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .expect("audit sink mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: SecurityEvent) -> Result<(), anyhow::Error> {
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("audit sink mutex poisoned: {}", e))?
            .push(event);
        Ok(())
    }
}
