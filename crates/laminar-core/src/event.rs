//! Lifecycle events fanned out to monitoring subscribers.

use serde::Serialize;

use crate::run::RunState;

/// A lifecycle event, serialized as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    JobQueued(QueuedPayload),
    JobStarted(StartedPayload),
    JobCompleted(CompletedPayload),
}

impl Event {
    pub fn job_name(&self) -> &str {
        match self {
            Event::JobQueued(p) => &p.name,
            Event::JobStarted(p) => &p.name,
            Event::JobCompleted(p) => &p.name,
        }
    }

    pub fn number(&self) -> i64 {
        match self {
            Event::JobQueued(p) => p.number,
            Event::JobStarted(p) => p.number,
            Event::JobCompleted(p) => p.number,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedPayload {
    pub name: String,
    pub number: i64,
    pub result: RunState,
    pub queue_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedPayload {
    pub name: String,
    pub number: i64,
    pub queued: i64,
    pub started: i64,
    pub queue_index: usize,
    pub reason: String,
    /// Estimated completion time, from the previous duration if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etc: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPayload {
    pub name: String,
    pub number: i64,
    pub queued: i64,
    pub started: i64,
    pub completed: i64,
    pub result: RunState,
    pub reason: String,
    pub artifacts: Vec<ArtifactPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPayload {
    pub url: String,
    pub filename: String,
    pub size: i64,
}
