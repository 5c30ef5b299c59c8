use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Configuration for the shell-backed reference engine.
#[derive(Debug, Clone)]
pub struct ShellEngineConfig {
    /// Shell used to run each task buffer (`<shell> -c <buffer>`)
    pub shell: String,
    /// Maximum number of tasks running at once
    pub max_workers: usize,
    /// Kill a task that runs longer than this
    pub task_timeout: Option<Duration>,
}

impl Default for ShellEngineConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            max_workers: 4,
            task_timeout: None,
        }
    }
}

/// Retry and buffering behaviour of the broker transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Extra attempts a publish gets after a transient failure.
    pub publish_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Capacity of the pending task hand-off between subscriber and loop.
    pub pending_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            publish_retries: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            pending_capacity: 1024,
        }
    }
}

/// Longest accepted heartbeat period (one year).
pub const MAX_HEARTBEAT_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Heartbeat cadence and idle shutdown thresholds.
///
/// `idle_heartbeats_soft == 0` disables idle shutdown altogether.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub heartbeat_period: Duration,
    pub idle_heartbeats_soft: u32,
    pub idle_heartbeats_hard: Option<u32>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(30),
            idle_heartbeats_soft: 0,
            idle_heartbeats_hard: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn new(heartbeat_period: Duration) -> Self {
        Self {
            heartbeat_period,
            ..Default::default()
        }
    }

    pub fn with_soft_limit(mut self, idle_heartbeats_soft: u32) -> Self {
        self.idle_heartbeats_soft = idle_heartbeats_soft;
        self
    }

    pub fn with_hard_limit(mut self, idle_heartbeats_hard: u32) -> Self {
        self.idle_heartbeats_hard = Some(idle_heartbeats_hard);
        self
    }

    pub fn idle_detection_enabled(&self) -> bool {
        self.idle_heartbeats_soft > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_period > MAX_HEARTBEAT_PERIOD {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_period",
                message: format!(
                    "must not exceed {}s (got {}s)",
                    MAX_HEARTBEAT_PERIOD.as_secs(),
                    self.heartbeat_period.as_secs_f64()
                ),
            });
        }
        match self.idle_heartbeats_hard {
            Some(_) if !self.idle_detection_enabled() => Err(ConfigError::InvalidValue {
                key: "idle_heartbeats_hard",
                message: "requires idle_heartbeats_soft to be set".to_string(),
            }),
            Some(hard) if hard <= self.idle_heartbeats_soft => Err(ConfigError::InvalidValue {
                key: "idle_heartbeats_hard",
                message: format!(
                    "must exceed idle_heartbeats_soft ({} <= {})",
                    hard, self.idle_heartbeats_soft
                ),
            }),
            _ => Ok(()),
        }
    }
}

/// Where a queue lives on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub connection_url: String,
    pub queue: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub routing_key: Option<String>,
}

impl QueueInfo {
    pub fn new(connection_url: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            connection_url: connection_url.into(),
            queue: queue.into(),
            exchange: String::new(),
            routing_key: None,
        }
    }

    /// Routing key used when publishing; defaults to the queue name.
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.queue)
    }
}

/// Registration info as handed over by the broker handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegInfo {
    pub task_queue_info: Option<QueueInfo>,
    pub result_queue_info: Option<QueueInfo>,
}

impl RegInfo {
    pub fn new(task_queue_info: QueueInfo, result_queue_info: QueueInfo) -> Self {
        Self {
            task_queue_info: Some(task_queue_info),
            result_queue_info: Some(result_queue_info),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn into_registration(self) -> Result<Registration, ConfigError> {
        let task_queue = self
            .task_queue_info
            .ok_or(ConfigError::MissingRegistration("task_queue_info"))?;
        let result_queue = self
            .result_queue_info
            .ok_or(ConfigError::MissingRegistration("result_queue_info"))?;
        Ok(Registration {
            task_queue,
            result_queue,
        })
    }
}

/// Validated registration: both queues are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub task_queue: QueueInfo,
    pub result_queue: QueueInfo,
}

#[derive(Debug, Clone)]
pub struct InterchangeConfig {
    pub endpoint_id: Uuid,
    pub heartbeat: HeartbeatConfig,
    /// Refuse to run (and later, stop) unless this is our parent process.
    pub parent_pid: Option<u32>,
    /// Upper bound on messages taken from each queue per tick.
    pub drain_limit: usize,
    /// Time allowed for the final flush on a graceful shutdown.
    pub flush_timeout: Duration,
    pub transport: TransportConfig,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for InterchangeConfig {
    fn default() -> Self {
        Self {
            endpoint_id: Uuid::new_v4(),
            heartbeat: HeartbeatConfig::default(),
            parent_pid: None,
            drain_limit: 256,
            flush_timeout: Duration::from_secs(10),
            transport: TransportConfig::default(),
            dashboard_addr: None,
        }
    }
}

impl InterchangeConfig {
    pub fn new(endpoint_id: Uuid) -> Self {
        Self {
            endpoint_id,
            ..Default::default()
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_parent_pid(mut self, parent_pid: u32) -> Self {
        self.parent_pid = Some(parent_pid);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "drain_limit",
                message: "must be at least 1".to_string(),
            });
        }
        if self.transport.pending_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pending_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        self.heartbeat.validate()
    }
}
