//! Lifecycle events published for the rest of the platform.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dynsched_id::{InstanceId, ProjectId, UserId};
use serde::Serialize;
use tracing::info;

use crate::models::SchedulerData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ServiceStarted,
    ServiceStopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentationEvent {
    pub metrics: Metric,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub instance_id: InstanceId,
    pub service_key: String,
    pub service_tag: String,
    pub user_agent: String,
    pub emitted_at: DateTime<Utc>,
}

impl InstrumentationEvent {
    pub fn new(metrics: Metric, data: &SchedulerData) -> Self {
        Self {
            metrics,
            user_id: data.user_id,
            project_id: data.project_id,
            instance_id: data.instance_id,
            service_key: data.key.clone(),
            service_tag: data.version.clone(),
            user_agent: data.request_user_agent.clone(),
            emitted_at: Utc::now(),
        }
    }
}

/// Outbound event sink. Publishing is best effort.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: InstrumentationEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: InstrumentationEvent) {
        info!(
            metrics = ?event.metrics,
            instance_id = %event.instance_id,
            user_id = %event.user_id,
            project_id = %event.project_id,
            service_key = %event.service_key,
            service_tag = %event.service_tag,
            "Instrumentation event"
        );
    }
}

/// Keeps events in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: std::sync::Mutex<Vec<InstrumentationEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InstrumentationEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, metrics: Metric) -> usize {
        self.events().iter().filter(|e| e.metrics == metrics).count()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: InstrumentationEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
