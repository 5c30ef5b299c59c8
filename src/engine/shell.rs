use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ShellEngineConfig;
use crate::engine::ExecutionEngine;
use crate::error::EngineError;
use crate::messages::{GlobalState, Message, QueueMessage, Task, TaskResult};

/// Runs each task buffer as `<shell> -c <buffer>`.
///
/// Stdout becomes the result data; a non-zero exit, a spawn failure or a
/// timeout becomes a failed result carrying stderr or the error text.
pub struct ShellEngine {
    config: ShellEngineConfig,
    running: Option<Running>,
}

struct Running {
    endpoint_id: Uuid,
    results: mpsc::UnboundedSender<QueueMessage>,
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
    /// Tasks not yet answered. Whoever removes an id owns its result.
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    cancel: CancellationToken,
}

fn claim(in_flight: &Mutex<HashSet<Uuid>>, task_id: &Uuid) -> bool {
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(task_id)
}

fn send_result(results: &mpsc::UnboundedSender<QueueMessage>, result: TaskResult) {
    let task_id = result.task_id;
    match Message::Result(result).encode() {
        Ok(bytes) => {
            let envelope = QueueMessage::new(Some(task_id.to_string()), bytes);
            if results.send(envelope).is_err() {
                tracing::warn!(task_id = %task_id, "Results channel closed, result dropped");
            }
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Failed to encode result");
        }
    }
}

impl ShellEngine {
    pub fn new(config: ShellEngineConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    /// Execute one task to completion on the current task.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        run_command(&self.config, task).await
    }
}

async fn run_command(config: &ShellEngineConfig, task: &Task) -> TaskResult {
    tracing::info!(task_id = %task.task_id, shell = %config.shell, "Executing task");

    let child = Command::new(&config.shell)
        .arg("-c")
        .arg(&task.task_buffer)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match config.task_timeout {
        Some(limit) => match tokio::time::timeout(limit, child).await {
            Ok(output) => output,
            Err(_) => {
                tracing::warn!(task_id = %task.task_id, timeout_ms = limit.as_millis() as u64, "Task timed out");
                return TaskResult::failure(
                    task.task_id,
                    "timeout",
                    format!("Task exceeded time limit of {:?}", limit),
                );
            }
        },
        None => child.await,
    };

    process_output(task.task_id, output)
}

fn process_output(
    task_id: Uuid,
    result: Result<std::process::Output, std::io::Error>,
) -> TaskResult {
    match result {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code();

            tracing::info!(
                task_id = %task_id,
                success = output.status.success(),
                exit_code = ?exit_code,
                "Task completed"
            );

            if output.status.success() {
                TaskResult::success(task_id, stdout)
            } else if stderr.is_empty() {
                TaskResult::failure(task_id, "exit_code", format!("Exit code: {:?}", exit_code))
            } else {
                TaskResult::failure(task_id, "exit_code", stderr)
            }
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Task execution failed");
            TaskResult::failure(task_id, "spawn_failed", e.to_string())
        }
    }
}

impl ExecutionEngine for ShellEngine {
    fn start(
        &mut self,
        endpoint_id: Uuid,
        results: mpsc::UnboundedSender<QueueMessage>,
    ) -> Result<(), EngineError> {
        let workers = self.config.max_workers.max(1);
        self.running = Some(Running {
            endpoint_id,
            results,
            permits: Arc::new(Semaphore::new(workers)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
        });
        tracing::info!(endpoint_id = %endpoint_id, workers, "Shell engine started");
        Ok(())
    }

    fn submit(&mut self, task: Task) -> Result<(), EngineError> {
        let running = self.running.as_ref().ok_or(EngineError::NotStarted)?;
        if running.cancel.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        if task.task_buffer.trim().is_empty() {
            return Err(EngineError::Rejected {
                task_id: task.task_id,
                reason: "empty task buffer".to_string(),
            });
        }

        let config = self.config.clone();
        let permits = Arc::clone(&running.permits);
        let outstanding = Arc::clone(&running.outstanding);
        let completed = Arc::clone(&running.completed);
        let in_flight = Arc::clone(&running.in_flight);
        let cancel = running.cancel.clone();
        let results = running.results.clone();
        outstanding.fetch_add(1, Ordering::SeqCst);
        in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.task_id);

        tokio::spawn(async move {
            let task_id = task.task_id;
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = async {
                    let _permit = permits.acquire_owned().await.ok()?;
                    Some(run_command(&config, &task).await)
                } => result,
            };
            outstanding.fetch_sub(1, Ordering::SeqCst);

            if !claim(&in_flight, &task_id) {
                tracing::debug!(task_id = %task_id, "Task already answered as cancelled");
                return;
            }
            let Some(result) = result else {
                tracing::debug!(task_id = %task_id, "Task abandoned on shutdown");
                return;
            };
            completed.fetch_add(1, Ordering::SeqCst);
            send_result(&results, result);
        });
        Ok(())
    }

    fn snapshot(&self) -> GlobalState {
        let mut state = GlobalState::new();
        state.insert("engine_type".into(), json!("ShellEngine"));
        state.insert("total_workers".into(), json!(self.config.max_workers));
        if let Some(running) = &self.running {
            state.insert(
                "idle_workers".into(),
                json!(running.permits.available_permits()),
            );
            state.insert(
                "outstanding_tasks".into(),
                json!(running.outstanding.load(Ordering::SeqCst)),
            );
            state.insert(
                "completed_tasks".into(),
                json!(running.completed.load(Ordering::SeqCst)),
            );
        }
        state
    }

    fn cancel_in_flight(&mut self) -> usize {
        let Some(running) = &self.running else {
            return 0;
        };
        running.cancel.cancel();
        let cancelled: Vec<Uuid> = running
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for task_id in &cancelled {
            send_result(
                &running.results,
                TaskResult::failure(
                    *task_id,
                    "endpoint_shutdown",
                    "Endpoint shut down while the task was running",
                ),
            );
        }
        if !cancelled.is_empty() {
            tracing::warn!(cancelled = cancelled.len(), "Cancelled tasks still running");
        }
        cancelled.len()
    }

    fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.permits.close();
            tracing::info!(
                endpoint_id = %running.endpoint_id,
                outstanding = running.outstanding.load(Ordering::SeqCst),
                "Shell engine shut down"
            );
        }
    }
}
