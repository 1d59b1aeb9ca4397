//! Reconciliation event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::holder::ModelKind;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a reconciliation event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileEventKind {
    /// A delta was applied to one of the three models.
    ModelUpdate,
    ChangeStarted,
    ChangeCompleted,
    ChangeFailed,
}

impl ReconcileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelUpdate => "model_update",
            Self::ChangeStarted => "change_started",
            Self::ChangeCompleted => "change_completed",
            Self::ChangeFailed => "change_failed",
        }
    }
}

/// One entry in an engine's event stream.
///
/// Events are totally ordered per engine; across engines no ordering is
/// guaranteed, so consumers of the merged stream key on `root_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    /// Root entity (job) the emitting engine owns.
    pub root_id: String,
    pub kind: ReconcileEventKind,
    pub model: ModelKind,
    /// Human-readable description of the change or delta.
    pub summary: String,
    pub error: Option<String>,
}

impl ReconcileEvent {
    pub fn new(
        root_id: impl Into<String>,
        kind: ReconcileEventKind,
        model: ModelKind,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            root_id: root_id.into(),
            kind,
            model,
            summary: summary.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.kind, ReconcileEventKind::ChangeFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_construction() {
        let event = ReconcileEvent::new(
            "job-1",
            ReconcileEventKind::ChangeFailed,
            ModelKind::None,
            "persist task t-1",
        )
        .with_error("store update timeout");

        assert!(event.is_failure());
        assert_eq!(event.root_id, "job-1");
        assert_eq!(event.error.as_deref(), Some("store update timeout"));
    }

    #[test]
    fn test_serde_round_trip() {
        let event = ReconcileEvent::new(
            "job-1",
            ReconcileEventKind::ModelUpdate,
            ModelKind::Running,
            "task t-1 -> launched",
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: ReconcileEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
