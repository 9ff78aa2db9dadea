//! 编排层集成测试：通过 Hive 装配完整组件，用脚本化传输代替真实 Worker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use hive::config::{AppConfig, FallbackSection, NotificationSection};
use hive::fallback::FallbackSynthesizer;
use hive::notify::{MemoryNotificationSink, Notification, NotificationEmitter, NotificationSink};
use hive::reconciler::apply_transition;
use hive::store::{MemoryTaskStore, StatusUpdate, TaskStore, Transition};
use hive::transport::{MockReply, MockTransport};
use hive::{Hive, Task, TaskKind, TaskStatus};
use serde_json::json;
use tokio::time::Instant;

async fn hive_with(mock: &Arc<MockTransport>, config: AppConfig) -> Hive {
    Hive::builder(config)
        .with_transport(mock.clone())
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_meeting_qa_falls_back_when_worker_unreachable() {
    let mock = Arc::new(MockTransport::new());
    mock.route("/meeting-qa", vec![MockReply::NetworkError]);
    let hive = hive_with(&mock, AppConfig::default()).await;

    let started = Instant::now();
    let (outcome, handle) = hive
        .submit_tracked(
            TaskKind::MeetingQa,
            "user_1",
            "meeting_7",
            json!({"meetingId": "meeting_7", "question": "What are the action items?"}),
        )
        .await
        .unwrap();
    handle.unwrap().await.unwrap();

    let task = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt, 3);
    let result = task.result.unwrap();
    assert_eq!(result["confidence"], 0.75);
    assert_eq!(result["fallback"], true);
    assert!(result["answer"].as_str().unwrap().contains("action items"));
    assert!(task.error.is_some());
    assert_eq!(mock.calls_to("/meeting-qa"), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    let inbox = hive.inbox().list("user_1").await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].title, "Preliminary answer available");
}

#[tokio::test(start_paused = true)]
async fn test_meeting_qa_falls_back_when_worker_vanishes_after_accepting() {
    let mock = Arc::new(MockTransport::new());
    mock.route("/meeting-qa", vec![MockReply::json(200, json!({"result": {"status": "queued"}}))]);
    mock.route("/job/*", vec![MockReply::NetworkError]);
    let mut config = AppConfig::default();
    config.reconcile.stuck_timeout_secs = 60;
    let hive = hive_with(&mock, config).await;

    let started = Instant::now();
    let (outcome, handle) = hive
        .submit_tracked(
            TaskKind::MeetingQa,
            "user_1",
            "meeting_8",
            json!({"meetingId": "meeting_8", "question": "What did we decide?"}),
        )
        .await
        .unwrap();
    handle.unwrap().await.unwrap();

    let task = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let result = task.result.unwrap();
    assert_eq!(result["fallback"], true);
    assert_eq!(result["status"], "fallback");
    assert_eq!(result["confidence"], 0.75);
    assert!(task.error.unwrap().contains("Worker unavailable"));
    assert_eq!(mock.calls_to("/job/*"), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    let inbox = hive.inbox().list("user_1").await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].title, "Preliminary answer available");
}

#[tokio::test(start_paused = true)]
async fn test_stuck_meeting_qa_gets_fallback_at_deadline() {
    let mock = Arc::new(MockTransport::new());
    mock.route("/meeting-qa", vec![MockReply::json(200, json!({"result": {"status": "running"}}))]);
    mock.route("/job/*", vec![MockReply::json(200, json!({"status": "running"}))]);
    let mut config = AppConfig::default();
    config.reconcile.poll_interval_ms = 1_000;
    config.reconcile.stuck_timeout_secs = 30;
    let hive = hive_with(&mock, config).await;

    let (outcome, handle) = hive
        .submit_tracked(
            TaskKind::MeetingQa,
            "user_1",
            "meeting_9",
            json!({"meetingId": "meeting_9", "question": "Give me a recap"}),
        )
        .await
        .unwrap();
    handle.unwrap().await.unwrap();

    let task = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.result.unwrap()["fallback"], true);
    assert!(task.error.unwrap().contains("within 30s"));
}

struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn deliver(&self, _notification: Notification) -> anyhow::Result<()> {
        anyhow::bail!("push gateway down")
    }
}

#[tokio::test]
async fn test_failed_delivery_keeps_task_terminal() {
    let mock = Arc::new(MockTransport::new());
    mock.route(
        "/extract-action-items",
        vec![MockReply::json(200, json!([{"title": "Book venue", "assignee": "lee"}]))],
    );
    let hive = Hive::builder(AppConfig::default())
        .with_transport(mock.clone())
        .with_sink(Arc::new(FailingSink))
        .build()
        .await
        .unwrap();

    let (outcome, handle) = hive
        .submit_tracked(
            TaskKind::ActionItemExtraction,
            "user_1",
            "meeting_3",
            json!({"meetingId": "meeting_3", "question": "What are the todos?"}),
        )
        .await
        .unwrap();
    handle.unwrap().await.unwrap();

    let task = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.unwrap()["actionItems"][0]["description"], "Book venue");
    assert!(task.error.is_none());
    assert!(hive.store().list_in_flight().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_commit_summary_reuses_task() {
    let mock = Arc::new(MockTransport::new());
    mock.route(
        "/process-commit-summary",
        vec![MockReply::json(200, json!({"status": "done", "result": {"summary": "Refactor parser"}}))],
    );
    let hive = hive_with(&mock, AppConfig::default()).await;
    let payload = json!({"commitData": {"sha": "9f2c1e", "message": "refactor"}, "changes": []});

    let (first, handle) = hive
        .submit_tracked(TaskKind::CommitSummary, "user_1", "repo_42", payload.clone())
        .await
        .unwrap();
    handle.unwrap().await.unwrap();

    // SHA 大小写不同仍是同一内容
    let second = hive
        .submit(
            TaskKind::CommitSummary,
            "user_1",
            "repo_42",
            json!({"commitData": {"sha": "9F2C1E"}}),
        )
        .await
        .unwrap();

    assert_eq!(first.task_id, second.task_id);
    assert!(second.deduplicated);
    assert_eq!(second.status, TaskStatus::Completed);
    assert_eq!(second.result, Some(json!({"summary": "Refactor parser"})));
    assert_eq!(mock.calls_to("/process-commit-summary"), 1);

    // 不同仓库是不同的任务
    let other = hive
        .submit(TaskKind::CommitSummary, "user_1", "repo_43", payload)
        .await
        .unwrap();
    assert_ne!(other.task_id, first.task_id);
}

#[tokio::test]
async fn test_concurrent_submissions_create_one_task() {
    let mock = Arc::new(MockTransport::new());
    mock.route("/process-commit-summary", vec![MockReply::Hang]);
    let hive = hive_with(&mock, AppConfig::default()).await;
    let payload = json!({"commitData": {"sha": "abc"}});

    let mut joins = Vec::new();
    for _ in 0..8 {
        let h = hive.clone();
        let p = payload.clone();
        joins.push(tokio::spawn(async move {
            h.submit(TaskKind::CommitSummary, "user_1", "repo_1", p).await.unwrap()
        }));
    }
    let mut ids = Vec::new();
    for j in joins {
        ids.push(j.await.unwrap());
    }

    assert_eq!(ids.iter().filter(|o| !o.deduplicated).count(), 1);
    assert!(ids.iter().all(|o| o.task_id == ids[0].task_id));
    assert_eq!(hive.list_for_owner("user_1").await.unwrap().len(), 1);
    hive.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_upload_survives_two_busy_responses() {
    let mock = Arc::new(MockTransport::new());
    mock.route(
        "/upload-url",
        vec![MockReply::json(
            200,
            json!({"uploadUrl": "http://storage.local/b2/put/1", "authorizationToken": "auth", "fileName": "notes.md"}),
        )],
    );
    mock.route(
        "/b2/put/1",
        vec![MockReply::status(503), MockReply::status(503), MockReply::status(200)],
    );
    let hive = hive_with(&mock, AppConfig::default()).await;
    let content = base64::engine::general_purpose::STANDARD.encode(b"# Notes\n");

    let started = Instant::now();
    let (outcome, handle) = hive
        .submit_tracked(
            TaskKind::AttachmentUpload,
            "user_1",
            "project_1",
            json!({"fileName": "notes.md", "content": content, "contentType": "text/markdown"}),
        )
        .await
        .unwrap();
    handle.unwrap().await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(3));
    let task = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt, 3);
    assert!(task.error.is_none());

    let result = task.result.unwrap();
    let claim = hive
        .verify_download_token(result["downloadToken"].as_str().unwrap())
        .unwrap();
    assert_eq!(claim.attachment_id, task.id);

    let puts: Vec<_> = mock
        .requests()
        .into_iter()
        .filter(|r| r.url.ends_with("/b2/put/1"))
        .collect();
    assert_eq!(puts.len(), 3);
    assert!(puts.iter().all(|r| *r == puts[0]));
    assert_eq!(puts[0].header("Content-Type"), Some("text/markdown"));
}

#[tokio::test(start_paused = true)]
async fn test_genuine_result_after_fallback_is_discarded() {
    let mock = Arc::new(MockTransport::new());
    mock.route("/meeting-qa", vec![MockReply::status(503)]);
    let hive = hive_with(&mock, AppConfig::default()).await;

    let (outcome, handle) = hive
        .submit_tracked(
            TaskKind::MeetingQa,
            "user_1",
            "m1",
            json!({"meetingId": "m1", "question": "What did we decide?"}),
        )
        .await
        .unwrap();
    handle.unwrap().await.unwrap();
    let fallback = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(fallback.status, TaskStatus::Failed);

    // Worker 迟到的真实结果
    let late = hive
        .store()
        .transition(&outcome.task_id, StatusUpdate::completed(json!({"answer": "late"})))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(late, Transition::Rejected(_)));
    assert_eq!(hive.reconcile(&outcome.task_id).await.unwrap(), TaskStatus::Failed);
    assert_eq!(mock.calls_to("/job/*"), 0);

    let after = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(after.result, fallback.result);
    assert_eq!(hive.inbox().list("user_1").await.len(), 1);
}

#[tokio::test]
async fn test_late_fallback_after_genuine_result_is_noop() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let notifier = NotificationEmitter::new(sink.clone(), NotificationSection::default());

    let task = Task::new(
        TaskKind::MeetingQa,
        "user_1",
        "m1",
        "key".to_string(),
        json!({"meetingId": "m1", "question": "Any deadlines?"}),
    );
    let id = task.id.clone();
    store.insert_or_get(task).await.unwrap();
    apply_transition(&store, &notifier, &id, StatusUpdate::processing()).await.unwrap();
    apply_transition(&store, &notifier, &id, StatusUpdate::completed(json!({"answer": "Friday"})))
        .await
        .unwrap();

    let synth = FallbackSynthesizer::new(FallbackSection::default());
    let written = synth
        .apply(&store, &notifier, &id, "Any deadlines?", "worker unavailable")
        .await
        .unwrap();
    assert!(written.is_none());

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result, Some(json!({"answer": "Friday"})));
    assert!(stored.error.is_none());
    assert_eq!(sink.list("user_1").await.len(), 1);
}

#[tokio::test]
async fn test_racing_terminal_writers_notify_once() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let sink = Arc::new(MemoryNotificationSink::new());
    let notifier = NotificationEmitter::new(sink.clone(), NotificationSection::default());

    let task = Task::new(
        TaskKind::ActionItemExtraction,
        "user_1",
        "m1",
        "key".to_string(),
        json!({"meetingId": "m1", "question": "todo"}),
    );
    let id = task.id.clone();
    store.insert_or_get(task).await.unwrap();

    let mut joins = Vec::new();
    for i in 0..12 {
        let store = store.clone();
        let notifier = notifier.clone();
        let id = id.clone();
        joins.push(tokio::spawn(async move {
            let update = if i % 2 == 0 {
                StatusUpdate::completed(json!({"actionItems": [], "writer": i}))
            } else {
                StatusUpdate::failed(format!("writer {i}"))
            };
            apply_transition(&store, &notifier, &id, update).await.unwrap()
        }));
    }
    let mut applied = 0;
    for j in joins {
        if matches!(j.await.unwrap(), Transition::Applied(_)) {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(sink.list("user_1").await.len(), 1);
}

#[tokio::test]
async fn test_status_never_moves_backward() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let task = Task::new(
        TaskKind::CommitSummary,
        "user_1",
        "repo",
        "key".to_string(),
        json!({"commitData": {"sha": "1"}}),
    );
    let id = task.id.clone();
    store.insert_or_get(task).await.unwrap();

    let mut observed = vec![TaskStatus::Pending];
    for update in [
        StatusUpdate::processing(),
        StatusUpdate::completed(json!("done")),
        StatusUpdate::processing(),
        StatusUpdate::failed("late error"),
    ] {
        let t = store.transition(&id, update).await.unwrap().unwrap();
        if matches!(t, Transition::Applied(_)) {
            observed.push(t.task().status);
        }
    }
    assert_eq!(
        observed,
        vec![TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Completed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stuck_task_is_force_failed() {
    let mock = Arc::new(MockTransport::new());
    mock.route("/process-commit-summary", vec![MockReply::json(202, json!({"status": "queued"}))]);
    mock.route("/job/*", vec![MockReply::json(200, json!({"status": "running"}))]);
    let mut config = AppConfig::default();
    config.reconcile.poll_interval_ms = 1_000;
    config.reconcile.stuck_timeout_secs = 30;
    let hive = hive_with(&mock, config).await;

    let (outcome, handle) = hive
        .submit_tracked(TaskKind::CommitSummary, "user_1", "repo", json!({"commitData": {"sha": "dead"}}))
        .await
        .unwrap();
    handle.unwrap().await.unwrap();

    let task = hive.get(&outcome.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("30s"));
    assert_eq!(mock.calls_to("/job/*"), 30);

    // 失败任务不再占用幂等键，可重新提交
    let retry = hive
        .submit(TaskKind::CommitSummary, "user_1", "repo", json!({"commitData": {"sha": "dead"}}))
        .await
        .unwrap();
    assert!(!retry.deduplicated);
    assert_ne!(retry.task_id, outcome.task_id);
    hive.shutdown();
}
