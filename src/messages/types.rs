use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form state mapping carried by status reports.
pub type GlobalState = serde_json::Map<String, serde_json::Value>;

/// A unit of work pulled from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub task_buffer: String,
}

impl Task {
    pub fn new(task_buffer: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            task_buffer: task_buffer.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub user_message: String,
}

/// Outcome of a task, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

impl TaskResult {
    pub fn success(task_id: Uuid, data: impl Into<String>) -> Self {
        Self {
            task_id,
            data: data.into(),
            error_details: None,
        }
    }

    pub fn failure(task_id: Uuid, code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            task_id,
            data: message.clone(),
            error_details: Some(ErrorDetails {
                code: code.to_string(),
                user_message: message,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_details.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Success,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Success => write!(f, "success"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// One observed task completion, reported in the next status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: Uuid,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
}

impl TaskTransition {
    pub fn from_result(result: &TaskResult) -> Self {
        Self {
            task_id: result.task_id,
            state: if result.is_error() {
                TaskState::Failed
            } else {
                TaskState::Success
            },
            timestamp: Utc::now(),
        }
    }
}

/// Periodic health/state snapshot of an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EPStatusReport {
    pub endpoint_id: Uuid,
    pub global_state: GlobalState,
    pub task_statuses: Vec<TaskTransition>,
}

/// Transport-level wrapper placed on the results path by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub task_id: Option<String>,
    pub message: Vec<u8>,
}

impl QueueMessage {
    pub fn new(task_id: Option<String>, message: Vec<u8>) -> Self {
        Self { task_id, message }
    }
}
