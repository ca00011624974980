//! The closed set of domain events the backend pushes to clients.
//!
//! Each event travels as a JSON object whose `type` field holds a dotted
//! kind such as `task.status_changed`; the remaining fields are the
//! per-kind payload. Kinds this crate does not know decode into
//! [`DomainEvent::Unknown`] instead of failing, so a newer server never
//! breaks an older client.

use crate::{deserialize_id, SessionStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    TaskDeleted,
    SessionStarted,
    SessionEnded,
    PhaseCompleted,
    PhaseContinuing,
    WorkspaceCreated,
    WorkspaceMerged,
    WorkspaceDeleted,
    ReviewCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::TaskCreated,
        EventKind::TaskUpdated,
        EventKind::TaskStatusChanged,
        EventKind::TaskDeleted,
        EventKind::SessionStarted,
        EventKind::SessionEnded,
        EventKind::PhaseCompleted,
        EventKind::PhaseContinuing,
        EventKind::WorkspaceCreated,
        EventKind::WorkspaceMerged,
        EventKind::WorkspaceDeleted,
        EventKind::ReviewCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task.created",
            EventKind::TaskUpdated => "task.updated",
            EventKind::TaskStatusChanged => "task.status_changed",
            EventKind::TaskDeleted => "task.deleted",
            EventKind::SessionStarted => "session.started",
            EventKind::SessionEnded => "session.ended",
            EventKind::PhaseCompleted => "phase.completed",
            EventKind::PhaseContinuing => "phase.continuing",
            EventKind::WorkspaceCreated => "workspace.created",
            EventKind::WorkspaceMerged => "workspace.merged",
            EventKind::WorkspaceDeleted => "workspace.deleted",
            EventKind::ReviewCompleted => "review.completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim();
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown event kind: {normalized}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusChanged {
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStarted {
    #[serde(deserialize_with = "deserialize_id")]
    pub session_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnded {
    #[serde(deserialize_with = "deserialize_id")]
    pub session_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownEvent {
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    TaskCreated(TaskRef),
    TaskUpdated(TaskRef),
    TaskStatusChanged(TaskStatusChanged),
    TaskDeleted(TaskRef),
    SessionStarted(SessionStarted),
    SessionEnded(SessionEnded),
    PhaseCompleted(PhaseProgress),
    PhaseContinuing(PhaseProgress),
    WorkspaceCreated(WorkspaceChange),
    WorkspaceMerged(WorkspaceChange),
    WorkspaceDeleted(WorkspaceChange),
    ReviewCompleted(TaskRef),
    Unknown(UnknownEvent),
}

impl DomainEvent {
    /// `None` for events whose kind this client does not recognise.
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            DomainEvent::TaskCreated(_) => EventKind::TaskCreated,
            DomainEvent::TaskUpdated(_) => EventKind::TaskUpdated,
            DomainEvent::TaskStatusChanged(_) => EventKind::TaskStatusChanged,
            DomainEvent::TaskDeleted(_) => EventKind::TaskDeleted,
            DomainEvent::SessionStarted(_) => EventKind::SessionStarted,
            DomainEvent::SessionEnded(_) => EventKind::SessionEnded,
            DomainEvent::PhaseCompleted(_) => EventKind::PhaseCompleted,
            DomainEvent::PhaseContinuing(_) => EventKind::PhaseContinuing,
            DomainEvent::WorkspaceCreated(_) => EventKind::WorkspaceCreated,
            DomainEvent::WorkspaceMerged(_) => EventKind::WorkspaceMerged,
            DomainEvent::WorkspaceDeleted(_) => EventKind::WorkspaceDeleted,
            DomainEvent::ReviewCompleted(_) => EventKind::ReviewCompleted,
            DomainEvent::Unknown(_) => return None,
        };
        Some(kind)
    }

    pub fn kind_str(&self) -> &str {
        match self {
            DomainEvent::Unknown(unknown) => &unknown.kind,
            other => other.kind().map(|kind| kind.as_str()).unwrap_or_default(),
        }
    }

    /// Task the event is about, when the payload names one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            DomainEvent::TaskCreated(p)
            | DomainEvent::TaskUpdated(p)
            | DomainEvent::TaskDeleted(p)
            | DomainEvent::ReviewCompleted(p) => Some(&p.task_id),
            DomainEvent::TaskStatusChanged(p) => Some(&p.task_id),
            DomainEvent::SessionStarted(p) => Some(&p.task_id),
            DomainEvent::SessionEnded(p) => Some(&p.task_id),
            DomainEvent::PhaseCompleted(p) | DomainEvent::PhaseContinuing(p) => Some(&p.task_id),
            DomainEvent::WorkspaceCreated(p)
            | DomainEvent::WorkspaceMerged(p)
            | DomainEvent::WorkspaceDeleted(p) => p.task_id.as_deref(),
            DomainEvent::Unknown(unknown) => unknown.payload.get("task_id").and_then(Value::as_str),
        }
    }

    /// Decode an event object. The kind comes from its `type` field, or from
    /// `fallback_kind` when the object carries none (SSE names the event in
    /// the frame header instead).
    pub fn from_value(
        value: Value,
        fallback_kind: Option<&str>,
    ) -> Result<Self, serde_json::Error> {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => match fallback_kind {
                Some(kind) if !kind.trim().is_empty() => kind.trim().to_string(),
                _ => return Err(serde::de::Error::missing_field("type")),
            },
        };
        if !value.is_object() {
            return Err(serde::de::Error::custom("event must be a JSON object"));
        }

        let Ok(known) = kind.parse::<EventKind>() else {
            return Ok(DomainEvent::Unknown(UnknownEvent {
                kind,
                payload: value,
            }));
        };

        Ok(match known {
            EventKind::TaskCreated => DomainEvent::TaskCreated(payload(value)?),
            EventKind::TaskUpdated => DomainEvent::TaskUpdated(payload(value)?),
            EventKind::TaskStatusChanged => DomainEvent::TaskStatusChanged(payload(value)?),
            EventKind::TaskDeleted => DomainEvent::TaskDeleted(payload(value)?),
            EventKind::SessionStarted => DomainEvent::SessionStarted(payload(value)?),
            EventKind::SessionEnded => DomainEvent::SessionEnded(payload(value)?),
            EventKind::PhaseCompleted => DomainEvent::PhaseCompleted(payload(value)?),
            EventKind::PhaseContinuing => DomainEvent::PhaseContinuing(payload(value)?),
            EventKind::WorkspaceCreated => DomainEvent::WorkspaceCreated(payload(value)?),
            EventKind::WorkspaceMerged => DomainEvent::WorkspaceMerged(payload(value)?),
            EventKind::WorkspaceDeleted => DomainEvent::WorkspaceDeleted(payload(value)?),
            EventKind::ReviewCompleted => DomainEvent::ReviewCompleted(payload(value)?),
        })
    }

    pub fn to_value(&self) -> Value {
        let body = match self {
            DomainEvent::TaskCreated(p)
            | DomainEvent::TaskUpdated(p)
            | DomainEvent::TaskDeleted(p)
            | DomainEvent::ReviewCompleted(p) => serde_json::to_value(p),
            DomainEvent::TaskStatusChanged(p) => serde_json::to_value(p),
            DomainEvent::SessionStarted(p) => serde_json::to_value(p),
            DomainEvent::SessionEnded(p) => serde_json::to_value(p),
            DomainEvent::PhaseCompleted(p) | DomainEvent::PhaseContinuing(p) => {
                serde_json::to_value(p)
            }
            DomainEvent::WorkspaceCreated(p)
            | DomainEvent::WorkspaceMerged(p)
            | DomainEvent::WorkspaceDeleted(p) => serde_json::to_value(p),
            DomainEvent::Unknown(unknown) => Ok(unknown.payload.clone()),
        };
        let mut map = match body {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert("type".to_string(), Value::from(self.kind_str()));
        Value::Object(map)
    }
}

fn payload<T: DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

impl Serialize for DomainEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DomainEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        DomainEvent::from_value(value, None).map_err(serde::de::Error::custom)
    }
}
