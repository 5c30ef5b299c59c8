//! Wire encoding for everything that crosses the broker.
//!
//! Payloads are JSON objects tagged by `message_type`. Anything that does not
//! decode as one of the known kinds is carried as [`Message::Raw`] and passed
//! through untouched.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MessageError;
use crate::messages::types::{EPStatusReport, Task, TaskResult};

/// Closed set of payloads the interchange understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Task(Task),
    Result(TaskResult),
    StatusReport(EPStatusReport),
    Raw(Vec<u8>),
}

#[derive(Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum WireMessage {
    Task(Task),
    Result(TaskResult),
    EpStatusReport(EPStatusReport),
}

#[derive(Serialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum WireRef<'a> {
    Task(&'a Task),
    Result(&'a TaskResult),
    EpStatusReport(&'a EPStatusReport),
}

impl Message {
    /// Decode a payload. Never fails: unknown payloads become `Raw`.
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<WireMessage>(bytes) {
            Ok(wire) => wire.into(),
            Err(_) => Message::Raw(bytes.to_vec()),
        }
    }

    /// Decode a payload that must be a task.
    pub fn decode_task(bytes: &[u8]) -> Result<Task, MessageError> {
        match Message::from(serde_json::from_slice::<WireMessage>(bytes)?) {
            Message::Task(task) => Ok(task),
            other => Err(MessageError::UnexpectedKind {
                expected: "task",
                found: other.kind(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let wire = match self {
            Message::Task(task) => WireRef::Task(task),
            Message::Result(result) => WireRef::Result(result),
            Message::StatusReport(report) => WireRef::EpStatusReport(report),
            Message::Raw(bytes) => return Ok(bytes.clone()),
        };
        serde_json::to_vec(&wire)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Task(_) => "task",
            Message::Result(_) => "result",
            Message::StatusReport(_) => "ep_status_report",
            Message::Raw(_) => "raw",
        }
    }

    /// Best-effort recovery of a `task_id` field from a payload that failed
    /// to decode.
    pub fn recover_task_id(bytes: &[u8]) -> Option<Uuid> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        value.get("task_id")?.as_str()?.parse().ok()
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Task(task) => Message::Task(task),
            WireMessage::Result(result) => Message::Result(result),
            WireMessage::EpStatusReport(report) => Message::StatusReport(report),
        }
    }
}

impl From<Task> for Message {
    fn from(task: Task) -> Self {
        Message::Task(task)
    }
}

impl From<TaskResult> for Message {
    fn from(result: TaskResult) -> Self {
        Message::Result(result)
    }
}

impl From<EPStatusReport> for Message {
    fn from(report: EPStatusReport) -> Self {
        Message::StatusReport(report)
    }
}
