use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::interchange::IdleState;

/// Where the human-visible status string goes.
///
/// `annotation` is empty while active, otherwise an idle countdown such as
/// `[idle; shut down in 4s]`.
pub trait StatusReporter: Send + Sync {
    fn set_status(&self, annotation: &str);
}

/// Default reporter: logs status changes and remembers the current title.
///
/// The OS process title is left untouched. The title is visible in the debug
/// log and, through [`StatusSnapshot::annotation`], on the dashboard. Install
/// a custom [`StatusReporter`] to publish it elsewhere.
pub struct LogStatusReporter {
    base: String,
    current: Mutex<String>,
}

impl LogStatusReporter {
    pub fn new(endpoint_id: Uuid) -> Self {
        let base = format!("endpoint-interchange {}", endpoint_id);
        Self {
            current: Mutex::new(base.clone()),
            base,
        }
    }

    pub fn title(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl StatusReporter for LogStatusReporter {
    fn set_status(&self, annotation: &str) {
        let title = if annotation.is_empty() {
            self.base.clone()
        } else {
            format!("{} {}", self.base, annotation)
        };
        tracing::debug!(status = %title, "Process status");
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = title;
    }
}

/// Running totals kept by the interchange. Also merged into every status
/// report's `global_state`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub tasks_received: u64,
    pub tasks_submitted: u64,
    pub submit_failures: u64,
    pub malformed_tasks: u64,
    pub results_forwarded: u64,
    pub status_reports_relayed: u64,
    pub status_reports_published: u64,
}

/// Point-in-time view served by the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub endpoint_id: Uuid,
    pub state: IdleState,
    pub idle_heartbeats: u32,
    pub annotation: String,
    pub running: bool,
    #[serde(flatten)]
    pub counters: Counters,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(endpoint_id: Uuid) -> Self {
        Self {
            endpoint_id,
            state: IdleState::Active,
            idle_heartbeats: 0,
            annotation: String::new(),
            running: false,
            counters: Counters::default(),
            updated_at: Utc::now(),
        }
    }
}
