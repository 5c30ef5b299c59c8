//! Interchange loop tests.
//!
//! Clock-driven tests run on a paused tokio clock, so heartbeats advance
//! instantly and deterministically.


use std::sync::Arc;
use std::time::Duration;

use endpoint_interchange::config::{InterchangeConfig, RegInfo};
use endpoint_interchange::engine::ShellEngine;
use endpoint_interchange::error::{ConfigError, InterchangeError};
use endpoint_interchange::interchange::{Interchange, ShutdownReason};
use endpoint_interchange::messages::{EPStatusReport, Message, QueueMessage, Task, TaskResult};
use endpoint_interchange::transport::MemoryBroker;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use test_harness::{
    drain_queue, publish, publish_task, reg_info, status_reports, task_results, test_config,
    EngineMode, FakeEngine, FakeParent, LogCapture, RecordingStatus, RESULT_QUEUE, TASK_QUEUE,
};

const SECOND: Duration = Duration::from_secs(1);

fn build(
    config: InterchangeConfig,
    broker: &MemoryBroker,
    engine: &FakeEngine,
    status: &RecordingStatus,
) -> Interchange {
    Interchange::new(
        config,
        reg_info(),
        Arc::new(broker.clone()),
        Box::new(engine.clone()),
    )
    .unwrap()
    .with_status_reporter(Arc::new(status.clone()))
}

// =============================================================================
// Idle state machine
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_soft_idle_counts_down_and_shuts_down() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let interchange = build(test_config(SECOND, 5, None), &broker, &engine, &status);
    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::IdleSoft);
    assert_eq!(
        status.updates(),
        vec![
            "[idle; shut down in 4s]",
            "[idle; shut down in 3s]",
            "[idle; shut down in 2s]",
            "[idle; shut down in 1s]",
            "[idle; shut down in 0s]",
        ]
    );
    assert_eq!(
        logs.count("In idle state due to idle_heartbeats_soft, shut down in 4 seconds."),
        1
    );
    assert_eq!(logs.count("Idle heartbeats reached.  Shutting down."), 1);
    assert_eq!(logs.count("HARD limit"), 0);
    assert_eq!(logs.count("Possibly idle"), 0);
    assert!(engine.was_shut_down());
}

#[tokio::test(start_paused = true)]
async fn test_hard_idle_forces_shutdown() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let interchange = build(test_config(SECOND, 2, Some(4)), &broker, &engine, &status);
    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::IdleHard);
    assert_eq!(
        status.updates(),
        vec![
            "[possibly idle; shut down in 3s]",
            "[possibly idle; shut down in 2s]",
            "[possibly idle; shut down in 1s]",
            "[possibly idle; shut down in 0s]",
        ]
    );
    assert_eq!(
        logs.count("Possibly idle due to idle_heartbeats_hard, shut down in 1 seconds."),
        1
    );
    let hard = logs.lines_containing("HARD limit");
    assert_eq!(hard.len(), 1);
    assert!(hard[0].contains("WARN"), "unexpected level: {}", hard[0]);
    assert_eq!(logs.count("In idle state"), 0);

    // Even a forced shutdown ends with the final report.
    let reports = status_reports(&drain_queue(&broker, RESULT_QUEUE).await);
    let last = reports.last().expect("final report");
    assert_eq!(last.global_state["heartbeat_period"], json!(0));
}

#[tokio::test(start_paused = true)]
async fn test_result_moves_interchange_back_to_active() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let interchange = build(test_config(SECOND, 1, Some(3)), &broker, &engine, &status);
    let results = interchange.results_sender();
    let task_id = Uuid::new_v4();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let bytes = Message::Result(TaskResult::success(task_id, "late"))
            .encode()
            .unwrap();
        results
            .send(QueueMessage::new(Some(task_id.to_string()), bytes))
            .unwrap();
    });

    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::IdleHard);
    assert_eq!(
        status.updates(),
        vec![
            "[possibly idle; shut down in 2s]",
            "",
            "[possibly idle; shut down in 2s]",
            "[possibly idle; shut down in 1s]",
            "[possibly idle; shut down in 0s]",
        ]
    );
    assert_eq!(logs.count("Moved to active state"), 1);
    assert_eq!(logs.count("Moved to active state due to result received"), 1);

    let payloads = drain_queue(&broker, RESULT_QUEUE).await;
    let results = task_results(&payloads);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, task_id);

    // The forwarded result shows up as a transition in a later report.
    let transitions: Vec<Uuid> = status_reports(&payloads)
        .iter()
        .flat_map(|r| r.task_statuses.iter().map(|t| t.task_id))
        .collect();
    assert_eq!(transitions, vec![task_id]);
}

#[tokio::test(start_paused = true)]
async fn test_task_moves_interchange_back_to_active() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let interchange = build(test_config(SECOND, 1, Some(3)), &broker, &engine, &status);
    let task = Task::new("echo wake up");
    let sender = broker.clone();
    let late = task.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        publish_task(&sender, &late).await;
    });

    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::IdleHard);
    assert_eq!(
        status.updates(),
        vec![
            "[possibly idle; shut down in 2s]",
            "",
            "[possibly idle; shut down in 2s]",
            "[possibly idle; shut down in 1s]",
            "[possibly idle; shut down in 0s]",
        ]
    );
    assert_eq!(logs.count("Moved to active state"), 1);
    assert_eq!(logs.count("Moved to active state due to task received"), 1);
    let submitted: Vec<Uuid> = engine.submitted().iter().map(|t| t.task_id).collect();
    assert_eq!(submitted, vec![task.task_id]);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_status_report_resets_idle_count() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let interchange = build(test_config(SECOND, 1, Some(3)), &broker, &engine, &status);
    let inbound = EPStatusReport {
        endpoint_id: interchange.endpoint_id(),
        global_state: serde_json::Map::new(),
        task_statuses: vec![],
    };
    let results = interchange.results_sender();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let bytes = Message::StatusReport(inbound).encode().unwrap();
        results.send(QueueMessage::new(None, bytes)).unwrap();
    });

    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::IdleHard);
    assert_eq!(
        status.updates(),
        vec![
            "[possibly idle; shut down in 2s]",
            "",
            "[possibly idle; shut down in 2s]",
            "[possibly idle; shut down in 1s]",
            "[possibly idle; shut down in 0s]",
        ]
    );
    assert_eq!(logs.count("Moved to active state"), 1);
    assert_eq!(
        logs.count("Moved to active state due to status report received"),
        1
    );

    // Our own reports carry `interchange_state`; the relayed one does not.
    let idle_counts: Vec<_> = status_reports(&drain_queue(&broker, RESULT_QUEUE).await)
        .iter()
        .filter(|r| r.global_state.contains_key("interchange_state"))
        .map(|r| r.global_state["idle_heartbeats"].clone())
        .collect();
    assert_eq!(&idle_counts[..2], &[json!(1), json!(0)]);
    assert_eq!(idle_counts.last(), Some(&json!(3)));
}

#[tokio::test(start_paused = true)]
async fn test_zero_period_ticks_back_to_back() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let interchange = build(test_config(Duration::ZERO, 3, None), &broker, &engine, &status);
    let started = tokio::time::Instant::now();
    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::IdleSoft);
    assert!(started.elapsed() < SECOND, "no waiting between ticks");
    assert_eq!(
        status.updates(),
        vec![
            "[idle; shut down in 0s]",
            "[idle; shut down in 0s]",
            "[idle; shut down in 0s]",
        ]
    );
    assert_eq!(
        logs.count("In idle state due to idle_heartbeats_soft, shut down in 0 seconds."),
        1
    );
    assert_eq!(logs.count("Idle heartbeats reached.  Shutting down."), 1);

    // A report goes out on every tick, plus the final one.
    let reports = status_reports(&drain_queue(&broker, RESULT_QUEUE).await);
    assert_eq!(reports.len(), 4);
    assert!(reports
        .iter()
        .all(|r| r.global_state["heartbeat_period"] == json!(0)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_detection_disabled_when_soft_is_zero() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();
    let quiesce = CancellationToken::new();

    let interchange = build(test_config(SECOND, 0, None), &broker, &engine, &status)
        .with_quiesce(quiesce.clone());
    let stopper = quiesce.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        stopper.cancel();
    });

    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::Quiesced);
    assert!(status.updates().is_empty());
}

// =============================================================================
// Status reports
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_periodic_reports_and_final_report() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();
    let quiesce = CancellationToken::new();

    let interchange = build(test_config(SECOND, 0, None), &broker, &engine, &status)
        .with_quiesce(quiesce.clone());
    let endpoint_id = interchange.endpoint_id();
    let stopper = quiesce.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        stopper.cancel();
    });

    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::Quiesced);

    let reports = status_reports(&drain_queue(&broker, RESULT_QUEUE).await);
    let periods: Vec<_> = reports
        .iter()
        .map(|r| r.global_state["heartbeat_period"].clone())
        .collect();
    assert_eq!(periods, vec![json!(1), json!(1), json!(0)]);

    let last = reports.last().unwrap();
    assert_eq!(last.endpoint_id, endpoint_id);
    assert_eq!(last.global_state["engine_type"], "FakeEngine");
    assert_eq!(last.global_state["os"], json!(std::env::consts::OS));
    assert!(last.global_state.contains_key("interchange_version"));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_status_report_republished_before_own_report() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();
    let quiesce = CancellationToken::new();

    let interchange = build(test_config(SECOND, 0, None), &broker, &engine, &status)
        .with_quiesce(quiesce.clone());

    let mut engine_state = serde_json::Map::new();
    engine_state.insert("managers".into(), json!(3));
    engine_state.insert("heartbeat_period".into(), json!(99));
    let inbound = EPStatusReport {
        endpoint_id: interchange.endpoint_id(),
        global_state: engine_state,
        task_statuses: vec![],
    };
    let inbound_bytes = Message::StatusReport(inbound).encode().unwrap();
    interchange
        .results_sender()
        .send(QueueMessage::new(None, inbound_bytes.clone()))
        .unwrap();
    quiesce.cancel();

    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::Quiesced);

    let payloads = drain_queue(&broker, RESULT_QUEUE).await;
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0], inbound_bytes, "republished byte-for-byte");

    let own = status_reports(&payloads[1..]);
    assert_eq!(own.len(), 1);
    // Engine-reported state carries over; interchange keys win.
    assert_eq!(own[0].global_state["managers"], json!(3));
    assert_eq!(own[0].global_state["heartbeat_period"], json!(0));
    assert_eq!(own[0].global_state["status_reports_relayed"], json!(1));
}

// =============================================================================
// Task routing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_tasks_reach_engine_and_are_acked() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Echo);
    let status = RecordingStatus::default();

    let tasks: Vec<Task> = (0..5).map(|i| Task::new(format!("echo {}", i))).collect();
    for task in &tasks {
        publish_task(&broker, task).await;
    }

    let interchange = build(test_config(SECOND, 2, None), &broker, &engine, &status);
    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::IdleSoft);

    let submitted: Vec<Uuid> = engine.submitted().iter().map(|t| t.task_id).collect();
    let expected: Vec<Uuid> = tasks.iter().map(|t| t.task_id).collect();
    assert_eq!(submitted, expected);
    assert_eq!(broker.queue_len(TASK_QUEUE), 0);
    assert_eq!(broker.unacked_len(TASK_QUEUE), 0);

    let results = task_results(&drain_queue(&broker, RESULT_QUEUE).await);
    let answered: Vec<Uuid> = results.iter().map(|r| r.task_id).collect();
    assert_eq!(answered, expected);
}

#[tokio::test(start_paused = true)]
async fn test_submission_failure_becomes_failed_result() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Reject);
    let status = RecordingStatus::default();

    let task = Task::new("echo never");
    publish_task(&broker, &task).await;

    let interchange = build(test_config(SECOND, 2, None), &broker, &engine, &status);
    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::IdleSoft);

    let results = task_results(&drain_queue(&broker, RESULT_QUEUE).await);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, task.task_id);
    let details = results[0].error_details.as_ref().unwrap();
    assert_eq!(details.code, "submission_failed");
    assert!(details.user_message.contains("engine full"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_tasks_become_failed_results() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let known_id = Uuid::new_v4();
    let missing_buffer = json!({ "message_type": "task", "task_id": known_id.to_string() });
    publish(&broker, TASK_QUEUE, missing_buffer.to_string().as_bytes()).await;
    publish(&broker, TASK_QUEUE, b"definitely not json").await;

    let interchange = build(test_config(SECOND, 2, None), &broker, &engine, &status);
    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::IdleSoft);

    assert!(engine.submitted().is_empty());
    let results = task_results(&drain_queue(&broker, RESULT_QUEUE).await);
    let ids: Vec<Uuid> = results.iter().map(|r| r.task_id).collect();
    assert_eq!(ids, vec![known_id, Uuid::nil()]);
    assert!(results
        .iter()
        .all(|r| r.error_details.as_ref().unwrap().code == "malformed_task"));
    assert_eq!(logs.count("Malformed task received"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stranded_tasks_are_failed_on_graceful_shutdown() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();
    let quiesce = CancellationToken::new();

    let mut config = test_config(SECOND, 0, None);
    config.drain_limit = 1;
    let interchange =
        build(config, &broker, &engine, &status).with_quiesce(quiesce.clone());
    let first = Task::new("echo first");
    let stranded = Task::new("echo late");
    let pending = interchange.pending_task_sender();
    for task in [&first, &stranded] {
        pending
            .send(Message::Task(task.clone()).encode().unwrap())
            .await
            .unwrap();
    }
    // One drain of one task, then quiesce: the second never reaches the engine.
    quiesce.cancel();

    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::Quiesced);

    let submitted: Vec<Uuid> = engine.submitted().iter().map(|t| t.task_id).collect();
    assert_eq!(submitted, vec![first.task_id]);
    let payloads = drain_queue(&broker, RESULT_QUEUE).await;
    let results = task_results(&payloads);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, stranded.task_id);
    assert_eq!(
        results[0].error_details.as_ref().unwrap().code,
        "endpoint_shutdown"
    );
    // The final report is still the last thing published.
    assert!(matches!(
        Message::decode(payloads.last().unwrap()),
        Message::StatusReport(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_running_tasks_are_failed_on_graceful_shutdown() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Hold);
    let status = RecordingStatus::default();
    let quiesce = CancellationToken::new();

    let interchange = build(test_config(SECOND, 0, None), &broker, &engine, &status)
        .with_quiesce(quiesce.clone());
    let task = Task::new("sleep 600");
    interchange
        .pending_task_sender()
        .send(Message::Task(task.clone()).encode().unwrap())
        .await
        .unwrap();
    quiesce.cancel();

    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::Quiesced);

    assert_eq!(engine.submitted().len(), 1);
    let payloads = drain_queue(&broker, RESULT_QUEUE).await;
    let results = task_results(&payloads);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, task.task_id);
    assert_eq!(
        results[0].error_details.as_ref().unwrap().code,
        "endpoint_shutdown"
    );
    assert!(matches!(
        Message::decode(payloads.last().unwrap()),
        Message::StatusReport(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_forced_shutdown_does_not_cancel_running_tasks() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Hold);
    let status = RecordingStatus::default();

    let task = Task::new("sleep 600");
    publish_task(&broker, &task).await;

    let interchange = build(test_config(SECOND, 1, Some(2)), &broker, &engine, &status);
    assert_eq!(interchange.start().await.unwrap(), ShutdownReason::IdleHard);

    assert_eq!(engine.submitted().len(), 1);
    let results = task_results(&drain_queue(&broker, RESULT_QUEUE).await);
    assert!(results.is_empty());
}

// =============================================================================
// Parent liveness and startup
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_refuses_to_start_under_wrong_parent() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    // Our own pid is never our parent.
    let config = test_config(SECOND, 0, None).with_parent_pid(std::process::id());
    let interchange = build(config, &broker, &engine, &status);
    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::ParentMismatch);
    assert_eq!(logs.count("refusing to start"), 1);
    assert!(!engine.was_started());
    assert_eq!(broker.consumer_count(TASK_QUEUE), 0);
    assert_eq!(broker.queue_len(RESULT_QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parent_gone_shuts_down_gracefully() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();
    let parent = FakeParent::new(4242);

    let config = test_config(SECOND, 0, None).with_parent_pid(4242);
    let interchange =
        build(config, &broker, &engine, &status).with_parent_probe(Box::new(parent.clone()));
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        parent.set(1);
    });

    let reason = interchange.start().await.unwrap();

    assert_eq!(reason, ShutdownReason::ParentGone);
    assert_eq!(logs.count("Parent (4242) has gone away"), 1);
    assert_eq!(logs.count("refusing to start"), 0);
    assert!(engine.was_shut_down());

    let reports = status_reports(&drain_queue(&broker, RESULT_QUEUE).await);
    assert_eq!(
        reports.last().unwrap().global_state["heartbeat_period"],
        json!(0)
    );
}

#[tokio::test]
async fn test_start_requires_registration() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);

    let result = Interchange::new(
        test_config(SECOND, 0, None),
        RegInfo::default(),
        Arc::new(broker.clone()),
        Box::new(engine),
    );

    assert!(matches!(
        result,
        Err(ConfigError::MissingRegistration("task_queue_info"))
    ));
}

#[tokio::test]
async fn test_invalid_idle_limits_are_rejected() {
    let broker = MemoryBroker::new();
    let engine = FakeEngine::new(EngineMode::Record);

    let result = Interchange::new(
        test_config(SECOND, 5, Some(3)),
        reg_info(),
        Arc::new(broker.clone()),
        Box::new(engine),
    );

    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_refused_broker_is_fatal() {
    let broker = MemoryBroker::new();
    broker.refuse_connections("bad credentials");
    let engine = FakeEngine::new(EngineMode::Record);
    let status = RecordingStatus::default();

    let interchange = build(test_config(SECOND, 0, None), &broker, &engine, &status);
    let err = interchange.start().await.unwrap_err();

    assert!(matches!(err, InterchangeError::Transport(e) if e.is_fatal()));
}

// =============================================================================
// End to end with the shell engine
// =============================================================================

#[tokio::test]
async fn test_shell_engine_round_trip() {
    let broker = MemoryBroker::new();
    let quiesce = CancellationToken::new();
    let task = Task::new("echo round-trip");
    publish_task(&broker, &task).await;

    let interchange = Interchange::new(
        test_config(Duration::from_millis(50), 0, None),
        reg_info(),
        Arc::new(broker.clone()),
        Box::new(ShellEngine::new(Default::default())),
    )
    .unwrap()
    .with_quiesce(quiesce.clone());

    let watcher = broker.clone();
    let driver = async move {
        // The result is published once the shell task finishes.
        for _ in 0..200 {
            if watcher.queue_len(RESULT_QUEUE) > 0 {
                let results = task_results(&drain_queue(&watcher, RESULT_QUEUE).await);
                if !results.is_empty() {
                    quiesce.cancel();
                    return results;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        quiesce.cancel();
        Vec::new()
    };

    let (reason, results) = tokio::join!(interchange.start(), driver);

    assert_eq!(reason.unwrap(), ShutdownReason::Quiesced);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, task.task_id);
    assert_eq!(results[0].data, "round-trip\n");
}
