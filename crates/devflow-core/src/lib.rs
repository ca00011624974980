use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod events;
pub mod protocol;

pub use events::{DomainEvent, EventKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Kanban column a task sits in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Backlog,
    Pending,
    #[serde(alias = "in-progress", alias = "inprogress")]
    InProgress,
    #[serde(alias = "ai_review")]
    Review,
    #[serde(alias = "human-review")]
    HumanReview,
    Done,
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "backlog" => Ok(TaskStatus::Backlog),
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" | "in-progress" | "inprogress" => Ok(TaskStatus::InProgress),
            "review" | "ai_review" => Ok(TaskStatus::Review),
            "human_review" | "human-review" => Ok(TaskStatus::HumanReview),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// One agent run against a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub task_id: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub summary: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub severity: FindingSeverity,
    pub title: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

/// Deserialize an ID that can be either a string or a number into a String
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_accepts_numeric_id_and_keeps_unknown_fields() {
        let task: Task = serde_json::from_str(
            r#"{"id": 42, "title": "Wire login", "status": "in-progress", "roadmap_id": "001"}"#,
        )
        .expect("parse task");
        assert_eq!(task.id, "42");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.extra.get("roadmap_id"), Some(&Value::from("001")));
    }

    #[test]
    fn status_parsing_accepts_aliases() {
        assert_eq!("ai_review".parse::<TaskStatus>(), Ok(TaskStatus::Review));
        assert_eq!("Canceled".parse::<TaskStatus>(), Ok(TaskStatus::Cancelled));
        assert!("shipped".parse::<TaskStatus>().is_err());
        assert_eq!(TaskStatus::HumanReview.to_string(), "human_review");
    }

    #[test]
    fn session_status_follows_success_flag() {
        assert_eq!(SessionStatus::from_success(true), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_success(false), SessionStatus::Failed);
    }
}
