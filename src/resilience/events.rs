//! Circuit breaker transition events and their sinks.
//!
//! Every breaker state change is emitted as a [`BreakerEvent`] so operators can
//! see when a circuit opens, admits a trial call or closes. The default sink writes events
//! through `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use super::circuit_breaker::CircuitState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub service_name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub failure_count: u32,
    /// Cooldown applied when the transition opened the circuit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl BreakerEvent {
    pub fn opened(&self) -> bool {
        self.to == CircuitState::Open
    }
}

/// Destination for breaker events.
///
/// Called outside the breaker's critical section; implementations must not
/// block for long.
pub trait BreakerEventSink: Send + Sync {
    fn emit(&self, event: &BreakerEvent);
}

/// Drops every event.
pub struct NoopEventSink;

impl BreakerEventSink for NoopEventSink {
    fn emit(&self, _: &BreakerEvent) {}
}

/// Logs events through `tracing` (default sink).
pub struct TracingEventSink;

impl BreakerEventSink for TracingEventSink {
    fn emit(&self, event: &BreakerEvent) {
        if event.opened() {
            warn!(
                service = event.service_name.as_str(),
                from = ?event.from,
                to = ?event.to,
                failure_count = event.failure_count,
                cooldown_ms = event.cooldown_ms.unwrap_or(0),
                "circuit breaker opened"
            );
        } else {
            info!(
                service = event.service_name.as_str(),
                from = ?event.from,
                to = ?event.to,
                failure_count = event.failure_count,
                "circuit breaker transition"
            );
        }
    }
}

/// Keeps the most recent events in memory; useful for tests and status pages.
pub struct InMemoryEventSink {
    events: RwLock<Vec<BreakerEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max.max(1),
        }
    }

    pub fn events(&self) -> Vec<BreakerEvent> {
        match self.events.read() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_for(&self, service: &str) -> Vec<BreakerEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.service_name == service)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BreakerEventSink for InMemoryEventSink {
    fn emit(&self, event: &BreakerEvent) {
        let mut events = match self.events.write() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
        if events.len() > self.max_events {
            events.remove(0);
        }
    }
}

/// Fans events out to several sinks.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn BreakerEventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(mut self, sink: Arc<dyn BreakerEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl BreakerEventSink for CompositeEventSink {
    fn emit(&self, event: &BreakerEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

pub fn tracing_sink() -> Arc<dyn BreakerEventSink> {
    Arc::new(TracingEventSink)
}
