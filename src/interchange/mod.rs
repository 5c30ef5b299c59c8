//! The interchange: bridges the broker and an execution engine.
//!
//! Tasks arrive from the task queue via a [`Subscriber`] running on its own
//! task. The main loop submits them to the engine, relays whatever the engine
//! puts on the results channel to the result queue, publishes periodic
//! status reports and runs the idle state machine.
//!
//! # Loop
//!
//! Each iteration wakes on the heartbeat deadline, on quiesce, or as soon as
//! work arrives, then:
//!
//! 1. Drains up to `drain_limit` pending tasks into the engine
//! 2. Drains up to `drain_limit` results to the result queue
//! 3. Feeds the idle tracker (activity, or an idle heartbeat)
//! 4. Publishes a status report once per heartbeat period
//! 5. Exits if a shutdown condition was recorded or quiesce was requested
//!
//! # Shutdown
//!
//! The subscriber is stopped first so no new work arrives. A graceful
//! shutdown then flushes outstanding results within `flush_timeout`; a forced
//! one (hard idle limit) skips the flush. Either way a final status report
//! with `heartbeat_period = 0` is the last thing published, then the engine
//! is shut down.

pub mod idle;
pub mod parent;
pub mod status;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{InterchangeConfig, RegInfo, Registration};
use crate::dashboard::{self, DashboardState};
use crate::engine::ExecutionEngine;
use crate::error::{ConfigError, InterchangeError, TransportError};
use crate::messages::{
    EPStatusReport, GlobalState, Message, QueueMessage, TaskResult, TaskTransition,
};
use crate::transport::{Connector, Publisher, Subscriber, SubscriberHandle};

pub use idle::{IdleState, IdleTracker, IdleVerdict};
pub use parent::{OsParent, ParentGuard, ParentMismatch, ParentProbe};
pub use status::{Counters, LogStatusReporter, StatusReporter, StatusSnapshot};

const SUBSCRIBER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Why [`Interchange::start`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Quiesced,
    IdleSoft,
    IdleHard,
    ParentGone,
    /// The expected parent was not our parent at startup; nothing was started.
    ParentMismatch,
}

impl ShutdownReason {
    /// Forced shutdowns skip the final result flush.
    pub fn is_forced(&self) -> bool {
        matches!(self, ShutdownReason::IdleHard)
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Quiesced => write!(f, "quiesced"),
            ShutdownReason::IdleSoft => write!(f, "idle_soft"),
            ShutdownReason::IdleHard => write!(f, "idle_hard"),
            ShutdownReason::ParentGone => write!(f, "parent_gone"),
            ShutdownReason::ParentMismatch => write!(f, "parent_mismatch"),
        }
    }
}

enum Wake {
    Tick,
    Quiesce,
    Task(Vec<u8>),
    Result(QueueMessage),
}

pub struct Interchange {
    config: InterchangeConfig,
    registration: Registration,
    connector: Arc<dyn Connector>,
    engine: Box<dyn ExecutionEngine>,
    reporter: Arc<dyn StatusReporter>,
    parent: ParentGuard,
    quiesce: CancellationToken,

    pending_tx: mpsc::Sender<Vec<u8>>,
    pending_rx: mpsc::Receiver<Vec<u8>>,
    results_tx: mpsc::UnboundedSender<QueueMessage>,
    results_rx: mpsc::UnboundedReceiver<QueueMessage>,
    status_tx: watch::Sender<StatusSnapshot>,

    idle: IdleTracker,
    annotation: String,
    active_since_tick: bool,
    terminal: Option<ShutdownReason>,
    counters: Counters,
    /// Last `global_state` the engine reported about itself.
    engine_state: GlobalState,
    task_statuses: Vec<TaskTransition>,
    /// Payloads whose publish failed transiently, in publish order.
    backlog: VecDeque<Vec<u8>>,
    started: Instant,
}

impl Interchange {
    /// Fails if either queue is missing from `reg_info` or the config is
    /// inconsistent.
    pub fn new(
        config: InterchangeConfig,
        reg_info: RegInfo,
        connector: Arc<dyn Connector>,
        engine: Box<dyn ExecutionEngine>,
    ) -> Result<Self, ConfigError> {
        let registration = reg_info.into_registration()?;
        config.validate()?;

        let (pending_tx, pending_rx) = mpsc::channel(config.transport.pending_capacity);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(StatusSnapshot::new(config.endpoint_id));

        Ok(Self {
            registration,
            connector,
            engine,
            reporter: Arc::new(LogStatusReporter::new(config.endpoint_id)),
            parent: ParentGuard::new(config.parent_pid, Box::new(OsParent)),
            quiesce: CancellationToken::new(),
            pending_tx,
            pending_rx,
            results_tx,
            results_rx,
            status_tx,
            idle: IdleTracker::new(&config.heartbeat),
            annotation: String::new(),
            active_since_tick: false,
            terminal: None,
            counters: Counters::default(),
            engine_state: GlobalState::new(),
            task_statuses: Vec::new(),
            backlog: VecDeque::new(),
            started: Instant::now(),
            config,
        })
    }

    pub fn with_status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_parent_probe(mut self, probe: Box<dyn ParentProbe>) -> Self {
        self.parent = ParentGuard::new(self.config.parent_pid, probe);
        self
    }

    /// Cancelling `token` asks the loop to shut down gracefully.
    pub fn with_quiesce(mut self, token: CancellationToken) -> Self {
        self.quiesce = token;
        self
    }

    pub fn quiesce_signal(&self) -> CancellationToken {
        self.quiesce.clone()
    }

    pub fn endpoint_id(&self) -> Uuid {
        self.config.endpoint_id
    }

    /// Feeds the pending-task channel directly, as the subscriber does.
    pub fn pending_task_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.pending_tx.clone()
    }

    /// The channel the engine publishes results on.
    pub fn results_sender(&self) -> mpsc::UnboundedSender<QueueMessage> {
        self.results_tx.clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Run until a shutdown condition, then tear down.
    ///
    /// Returns `Err` only for configuration, engine startup or fatal
    /// transport failures.
    pub async fn start(mut self) -> Result<ShutdownReason, InterchangeError> {
        if let Err(mismatch) = self.parent.verify() {
            tracing::warn!(
                "Interchange parent ({}) is not our parent ({}); refusing to start",
                mismatch.expected,
                mismatch.actual
            );
            return Ok(ShutdownReason::ParentMismatch);
        }

        let mut publisher = Publisher::new(
            Arc::clone(&self.connector),
            self.registration.result_queue.clone(),
            &self.config.transport,
        );
        if let Err(e) = publisher.connect().await {
            if e.is_fatal() {
                return Err(e.into());
            }
            tracing::warn!(error = %e, "Result queue unavailable, will retry on first publish");
        }

        if let Err(e) = self
            .engine
            .start(self.config.endpoint_id, self.results_tx.clone())
        {
            publisher.close().await;
            return Err(e.into());
        }

        let mut subscriber = Some(
            Subscriber::new(
                Arc::clone(&self.connector),
                self.registration.task_queue.clone(),
                self.pending_tx.clone(),
                &self.config.transport,
            )
            .spawn(),
        );
        let dashboard = self.spawn_dashboard();

        tracing::info!(
            endpoint_id = %self.config.endpoint_id,
            task_queue = %self.registration.task_queue.queue,
            result_queue = %self.registration.result_queue.queue,
            heartbeat_period_s = self.config.heartbeat.heartbeat_period.as_secs_f64(),
            idle_heartbeats_soft = self.config.heartbeat.idle_heartbeats_soft,
            idle_heartbeats_hard = ?self.config.heartbeat.idle_heartbeats_hard,
            "Interchange started"
        );
        self.publish_snapshot(true);

        let result = match self.main_loop(&mut publisher, &mut subscriber).await {
            Ok(reason) => self
                .shutdown(reason, &mut publisher, subscriber.take())
                .await
                .map(|()| reason),
            Err(e) => {
                tracing::error!(error = %e, "Interchange failed");
                self.abort(&mut publisher, subscriber.take()).await;
                Err(e)
            }
        };

        if let Some(token) = dashboard {
            token.cancel();
        }
        self.publish_snapshot(false);
        result
    }

    fn spawn_dashboard(&self) -> Option<CancellationToken> {
        let addr = self.config.dashboard_addr?;
        let token = self.quiesce.child_token();
        let state = DashboardState::new(self.status_tx.subscribe());
        let shutdown = token.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::run_dashboard(addr, state, shutdown).await {
                tracing::error!(error = %e, %addr, "Dashboard server failed");
            }
        });
        Some(token)
    }

    async fn main_loop(
        &mut self,
        publisher: &mut Publisher,
        subscriber: &mut Option<SubscriberHandle>,
    ) -> Result<ShutdownReason, InterchangeError> {
        let period = self.config.heartbeat.heartbeat_period;
        let mut next_tick = Instant::now() + period;
        let mut last_report = Instant::now();

        loop {
            let wake = self.wait(next_tick).await;
            let tick = matches!(wake, Wake::Tick);
            if tick {
                next_tick = Instant::now() + period;
            }

            self.check_parent();
            self.check_subscriber(subscriber).await?;
            self.retry_backlog(publisher).await?;

            let (first_task, first_result) = match wake {
                Wake::Task(payload) => (Some(payload), None),
                Wake::Result(message) => (None, Some(message)),
                Wake::Tick | Wake::Quiesce => (None, None),
            };
            let tasks = self.drain_tasks(first_task);
            let (results, result_reason) = self.drain_results(first_result, publisher).await?;

            if tasks > 0 || results > 0 {
                let reason = if tasks > 0 {
                    "task received"
                } else {
                    result_reason
                };
                self.active_since_tick = true;
                if self.idle.record_activity(reason) {
                    self.set_annotation(String::new());
                }
            } else if tick && !self.active_since_tick {
                self.on_idle_tick();
            }
            if tick {
                self.active_since_tick = false;
            }

            if last_report.elapsed() >= period {
                self.publish_report(publisher, false).await?;
                last_report = Instant::now();
            }
            self.publish_snapshot(true);

            if let Some(reason) = self.terminal {
                return Ok(reason);
            }
            if self.quiesce.is_cancelled() {
                tracing::info!("Quiesce requested");
                return Ok(ShutdownReason::Quiesced);
            }
        }
    }

    async fn wait(&mut self, deadline: Instant) -> Wake {
        tokio::select! {
            biased;
            _ = self.quiesce.cancelled() => Wake::Quiesce,
            Some(payload) = self.pending_rx.recv() => Wake::Task(payload),
            Some(message) = self.results_rx.recv() => Wake::Result(message),
            _ = tokio::time::sleep_until(deadline) => Wake::Tick,
        }
    }

    fn check_parent(&mut self) {
        if self.terminal.is_some() {
            return;
        }
        if let Err(mismatch) = self.parent.verify() {
            tracing::warn!(
                "Parent ({}) has gone away; initiating shut down",
                mismatch.expected
            );
            self.terminal = Some(ShutdownReason::ParentGone);
        }
    }

    async fn check_subscriber(
        &mut self,
        subscriber: &mut Option<SubscriberHandle>,
    ) -> Result<(), InterchangeError> {
        if !subscriber
            .as_ref()
            .is_some_and(SubscriberHandle::is_finished)
        {
            return Ok(());
        }
        let Some(handle) = subscriber.take() else {
            return Ok(());
        };
        match handle.join().await {
            Ok(()) => {
                tracing::warn!("Task subscriber stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Task subscriber failed");
                Err(e.into())
            }
        }
    }

    fn drain_tasks(&mut self, first: Option<Vec<u8>>) -> usize {
        let mut next = first;
        let mut drained = 0;
        while drained < self.config.drain_limit {
            let payload = match next.take() {
                Some(payload) => payload,
                None => match self.pending_rx.try_recv() {
                    Ok(payload) => payload,
                    Err(_) => break,
                },
            };
            drained += 1;
            self.counters.tasks_received += 1;
            self.dispatch_task(payload);
        }
        drained
    }

    fn dispatch_task(&mut self, payload: Vec<u8>) {
        let task = match Message::decode_task(&payload) {
            Ok(task) => task,
            Err(e) => {
                let task_id = Message::recover_task_id(&payload);
                tracing::error!(task_id = ?task_id, error = %e, "Malformed task received");
                self.counters.malformed_tasks += 1;
                self.route_result(TaskResult::failure(
                    task_id.unwrap_or_else(Uuid::nil),
                    "malformed_task",
                    format!("Failed to decode task: {}", e),
                ));
                return;
            }
        };

        let task_id = task.task_id;
        match self.engine.submit(task) {
            Ok(()) => {
                self.counters.tasks_submitted += 1;
                tracing::debug!(task_id = %task_id, "Task submitted");
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to start task");
                self.counters.submit_failures += 1;
                self.route_result(TaskResult::failure(
                    task_id,
                    "submission_failed",
                    format!("Failed to start task {}: {}", task_id, e),
                ));
            }
        }
    }

    /// Put a locally produced result on the results path so it is published
    /// like any engine result.
    fn route_result(&self, result: TaskResult) {
        let task_id = result.task_id;
        match Message::Result(result).encode() {
            Ok(bytes) => {
                let message = QueueMessage::new(Some(task_id.to_string()), bytes);
                if self.results_tx.send(message).is_err() {
                    tracing::error!(task_id = %task_id, "Results channel closed, result dropped");
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to encode result");
            }
        }
    }

    async fn drain_results(
        &mut self,
        first: Option<QueueMessage>,
        publisher: &mut Publisher,
    ) -> Result<(usize, &'static str), TransportError> {
        let mut next = first;
        let mut drained = 0;
        let mut reason = "result received";
        while drained < self.config.drain_limit {
            let message = match next.take() {
                Some(message) => message,
                None => match self.results_rx.try_recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            let relayed = self.relay(message, publisher).await?;
            if drained == 0 {
                reason = relayed;
            }
            drained += 1;
        }
        Ok((drained, reason))
    }

    /// Publish one message from the results path unchanged, noting what it
    /// was on the way.
    async fn relay(
        &mut self,
        message: QueueMessage,
        publisher: &mut Publisher,
    ) -> Result<&'static str, TransportError> {
        let reason = match Message::decode(&message.message) {
            Message::StatusReport(report) => {
                tracing::debug!(
                    task_statuses = report.task_statuses.len(),
                    "Relaying engine status report"
                );
                self.engine_state = report.global_state;
                self.counters.status_reports_relayed += 1;
                "status report received"
            }
            Message::Result(result) => {
                self.task_statuses.push(TaskTransition::from_result(&result));
                self.counters.results_forwarded += 1;
                "result received"
            }
            other => {
                tracing::debug!(
                    kind = other.kind(),
                    task_id = ?message.task_id,
                    "Forwarding unrecognised payload"
                );
                self.counters.results_forwarded += 1;
                "result received"
            }
        };
        self.send(publisher, message.message).await?;
        Ok(reason)
    }

    /// Publish, deferring on transient failure. Once anything is deferred,
    /// later payloads queue behind it to keep publish order.
    async fn send(
        &mut self,
        publisher: &mut Publisher,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if !self.backlog.is_empty() {
            self.backlog.push_back(payload);
            return Ok(());
        }
        match publisher.publish(&payload).await {
            Ok(()) => Ok(()),
            Err(TransportError::Transient(e)) => {
                tracing::warn!(error = %e, "Publish deferred until the broker recovers");
                self.backlog.push_back(payload);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn retry_backlog(&mut self, publisher: &mut Publisher) -> Result<(), TransportError> {
        while let Some(payload) = self.backlog.front() {
            match publisher.publish(payload).await {
                Ok(()) => {
                    self.backlog.pop_front();
                }
                Err(TransportError::Transient(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn on_idle_tick(&mut self) {
        match self.idle.record_idle_tick() {
            IdleVerdict::Untracked => {}
            IdleVerdict::Counting { annotation } => self.set_annotation(annotation),
            IdleVerdict::Shutdown { annotation, forced } => {
                self.set_annotation(annotation);
                self.terminal.get_or_insert(if forced {
                    ShutdownReason::IdleHard
                } else {
                    ShutdownReason::IdleSoft
                });
            }
        }
    }

    fn set_annotation(&mut self, annotation: String) {
        self.reporter.set_status(&annotation);
        self.annotation = annotation;
    }

    fn build_report(&mut self, heartbeat_period: Value) -> EPStatusReport {
        let mut global_state = self.engine.snapshot();
        global_state.extend(self.engine_state.clone());
        if let Ok(Value::Object(counters)) = serde_json::to_value(&self.counters) {
            global_state.extend(counters);
        }
        global_state.insert("heartbeat_period".into(), heartbeat_period);
        global_state.insert("interchange_state".into(), json!(self.idle.state()));
        global_state.insert("idle_heartbeats".into(), json!(self.idle.idle_ticks()));
        global_state.insert("uptime_s".into(), json!(self.started.elapsed().as_secs()));
        global_state.extend(env_details());

        EPStatusReport {
            endpoint_id: self.config.endpoint_id,
            global_state,
            task_statuses: std::mem::take(&mut self.task_statuses),
        }
    }

    async fn publish_report(
        &mut self,
        publisher: &mut Publisher,
        final_report: bool,
    ) -> Result<(), TransportError> {
        let period = if final_report {
            json!(0)
        } else {
            period_value(self.config.heartbeat.heartbeat_period)
        };
        let report = self.build_report(period);
        let payload = match Message::StatusReport(report).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode status report");
                return Ok(());
            }
        };
        self.send(publisher, payload).await?;
        self.counters.status_reports_published += 1;
        tracing::debug!(final_report, "Status report published");
        Ok(())
    }

    fn publish_snapshot(&self, running: bool) {
        self.status_tx.send_replace(StatusSnapshot {
            endpoint_id: self.config.endpoint_id,
            state: self.idle.state(),
            idle_heartbeats: self.idle.idle_ticks(),
            annotation: self.annotation.clone(),
            running,
            counters: self.counters.clone(),
            updated_at: Utc::now(),
        });
    }

    async fn shutdown(
        &mut self,
        reason: ShutdownReason,
        publisher: &mut Publisher,
        subscriber: Option<SubscriberHandle>,
    ) -> Result<(), InterchangeError> {
        tracing::info!(reason = %reason, "Interchange shutting down");
        if let Some(handle) = subscriber {
            if let Err(e) = handle.stop(SUBSCRIBER_STOP_TIMEOUT).await {
                tracing::warn!(error = %e, "Subscriber stopped with error");
            }
        }

        let result = self.final_publish(reason, publisher).await;
        publisher.close().await;
        self.engine.shutdown();
        tracing::info!(reason = %reason, "Interchange stopped");
        result.map_err(InterchangeError::from)
    }

    async fn final_publish(
        &mut self,
        reason: ShutdownReason,
        publisher: &mut Publisher,
    ) -> Result<(), TransportError> {
        if reason.is_forced() {
            if !self.backlog.is_empty() {
                tracing::warn!(
                    dropped = self.backlog.len(),
                    "Forced shutdown, dropping unpublished messages"
                );
                self.backlog.clear();
            }
        } else {
            self.engine.cancel_in_flight();
            self.fail_stranded_tasks();
            let deadline = Instant::now() + self.config.flush_timeout;
            let flushed = tokio::time::timeout_at(deadline, self.flush_results(publisher)).await;
            match flushed {
                Ok(result) => result?,
                Err(_) => tracing::warn!(
                    unpublished = self.backlog.len(),
                    "Timed out flushing results"
                ),
            }
        }

        self.publish_report(publisher, true).await?;
        if !self.backlog.is_empty() {
            self.retry_backlog(publisher).await?;
            if !self.backlog.is_empty() {
                tracing::error!(
                    unpublished = self.backlog.len(),
                    "Messages lost at shutdown"
                );
            }
        }
        Ok(())
    }

    /// Tasks taken off the broker but never submitted get a failed result.
    fn fail_stranded_tasks(&mut self) {
        let mut stranded = 0;
        while let Ok(payload) = self.pending_rx.try_recv() {
            let task_id = Message::recover_task_id(&payload).unwrap_or_else(Uuid::nil);
            self.route_result(TaskResult::failure(
                task_id,
                "endpoint_shutdown",
                "Endpoint shut down before the task was started",
            ));
            stranded += 1;
        }
        if stranded > 0 {
            tracing::warn!(stranded, "Failing tasks that were never started");
        }
    }

    async fn flush_results(&mut self, publisher: &mut Publisher) -> Result<(), TransportError> {
        while !self.backlog.is_empty() {
            self.retry_backlog(publisher).await?;
        }
        while let Ok(message) = self.results_rx.try_recv() {
            self.relay(message, publisher).await?;
        }
        while !self.backlog.is_empty() {
            self.retry_backlog(publisher).await?;
        }
        Ok(())
    }

    async fn abort(&mut self, publisher: &mut Publisher, subscriber: Option<SubscriberHandle>) {
        if let Some(handle) = subscriber {
            if let Err(e) = handle.stop(SUBSCRIBER_STOP_TIMEOUT).await {
                tracing::debug!(error = %e, "Subscriber stopped with error");
            }
        }
        publisher.close().await;
        self.engine.shutdown();
    }
}

/// Whole-second periods report as integers.
fn period_value(period: Duration) -> Value {
    if period.subsec_nanos() == 0 {
        json!(period.as_secs())
    } else {
        json!(period.as_secs_f64())
    }
}

fn env_details() -> GlobalState {
    let mut details = GlobalState::new();
    details.insert("os".into(), json!(std::env::consts::OS));
    details.insert("arch".into(), json!(std::env::consts::ARCH));
    details.insert(
        "interchange_version".into(),
        json!(env!("CARGO_PKG_VERSION")),
    );
    details
}
