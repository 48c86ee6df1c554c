//! Queue delivery loop and cron scheduler integration tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use legion::queue::QueueStatus;
use legion::sdk::mock::MockSdkFactory;
use legion::sdk::SdkFactory;
use legion::session::CreateSessionParams;
use legion::utils::unix_timestamp;
use legion::{LegionConfig, LegionSystem};

async fn setup() -> (TempDir, LegionSystem, Arc<MockSdkFactory>) {
    let dir = TempDir::new().unwrap();
    let config = LegionConfig {
        data_dir: dir.path().join("data"),
        delivery_poll_ms: 50,
        ..LegionConfig::default()
    };
    let factory = Arc::new(MockSdkFactory::new());
    let mut system = LegionSystem::new(config, Arc::clone(&factory) as Arc<dyn SdkFactory>);
    system.start().await.unwrap();
    (dir, system, factory)
}

async fn wait_until_sent(system: &LegionSystem, sid: &str, queue_id: &str) {
    for _ in 0..200 {
        let sent = system
            .coordinator
            .queues()
            .get_queue(sid)
            .await
            .iter()
            .any(|i| i.queue_id == queue_id && i.status == QueueStatus::Sent);
        if sent {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("queue item {} was never delivered", queue_id);
}

#[tokio::test]
async fn test_delivery_loop_sends_queued_message_when_idle() {
    let (_dir, mut system, factory) = setup().await;
    let project = system
        .coordinator
        .create_project("p1", std::path::Path::new("/tmp/p1"))
        .await
        .unwrap();
    let info = system
        .coordinator
        .create_session(
            &project.project_id,
            CreateSessionParams {
                name: Some("worker".to_string()),
                ..CreateSessionParams::default()
            },
        )
        .await
        .unwrap();
    let sid = info.session_id;
    system.coordinator.start_session(&sid).await.unwrap();

    let item = system
        .coordinator
        .enqueue_message(&sid, "queued hello", false, None)
        .await
        .unwrap();

    // The delivery loop picks it up once the session is idle.
    wait_until_sent(&system, &sid, &item.queue_id).await;

    let handle = factory.handle(&sid).await.unwrap();
    let sent = handle.sent_messages.lock().await.clone();
    assert!(sent.contains(&"queued hello".to_string()));

    system.shutdown().await;
}

#[tokio::test]
async fn test_queue_not_delivered_to_stopped_session() {
    let (_dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("p1", std::path::Path::new("/tmp/p1"))
        .await
        .unwrap();
    let info = system
        .coordinator
        .create_session(
            &project.project_id,
            CreateSessionParams {
                name: Some("sleeper".to_string()),
                ..CreateSessionParams::default()
            },
        )
        .await
        .unwrap();
    let sid = info.session_id;

    let item = system
        .coordinator
        .enqueue_message(&sid, "wait for me", false, None)
        .await
        .unwrap();

    // Session never started: several poll intervals later the item is
    // still pending on disk.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let queue = system.coordinator.queues().get_queue(&sid).await;
    let stored = queue.iter().find(|i| i.queue_id == item.queue_id).unwrap();
    assert_eq!(stored.status, QueueStatus::Pending);

    system.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_fire_enqueues_formatted_prompt() {
    let (_dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("p1", std::path::Path::new("/tmp/p1"))
        .await
        .unwrap();
    let legion_id = project.project_id.clone();
    let info = system
        .coordinator
        .create_session(
            &legion_id,
            CreateSessionParams {
                name: Some("scheduled".to_string()),
                ..CreateSessionParams::default()
            },
        )
        .await
        .unwrap();
    let sid = info.session_id;

    let schedule = system
        .coordinator
        .schedules()
        .create_schedule(
            &legion_id,
            &sid,
            "scheduled",
            "status check",
            "* * * * *",
            "status?",
            false,
            3,
            3600,
        )
        .await
        .unwrap();

    // Pull the next fire into the past and tick.
    system
        .coordinator
        .schedules()
        .apply(&schedule.schedule_id, |s| {
            s.next_run = Some(unix_timestamp() - 1.0);
        })
        .await
        .unwrap();
    system.scheduler.tick().await;

    // A pending queue item with the formatted prompt exists (the
    // session is not started, so the delivery loop leaves it alone).
    let pending = system.coordinator.queues().get_pending(&sid).await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0]
        .content
        .starts_with("**[Scheduled Task: status check]**"));
    assert!(pending[0].content.contains("status?"));

    let updated = system
        .coordinator
        .schedules()
        .get_schedule(&schedule.schedule_id)
        .await
        .unwrap();
    assert_eq!(updated.execution_count, 1);
    assert_eq!(updated.failure_count, 0);
    assert_eq!(updated.last_status.as_deref(), Some("queued"));
    assert!(updated.next_run.unwrap() > unix_timestamp());

    // The execution record links back to the queue item.
    let history = system
        .coordinator
        .schedules()
        .get_history(&legion_id, Some(&schedule.schedule_id), 10, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "queued");
    assert_eq!(history[0].queue_id.as_deref(), Some(pending[0].queue_id.as_str()));
    assert_eq!(history[0].minion_state, "created");

    system.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_fire_failure_backs_off_then_pauses() {
    let (_dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("p1", std::path::Path::new("/tmp/p1"))
        .await
        .unwrap();
    let legion_id = project.project_id.clone();

    // Schedule bound to a minion that does not exist: every fire fails.
    let schedule = system
        .coordinator
        .schedules()
        .create_schedule(
            &legion_id,
            "no-such-minion",
            "ghost",
            "doomed",
            "* * * * *",
            "hello?",
            false,
            1,
            3600,
        )
        .await
        .unwrap();

    // First failure: retry with backoff.
    system
        .coordinator
        .schedules()
        .apply(&schedule.schedule_id, |s| {
            s.next_run = Some(unix_timestamp() - 1.0);
        })
        .await
        .unwrap();
    system.scheduler.tick().await;

    let after_first = system
        .coordinator
        .schedules()
        .get_schedule(&schedule.schedule_id)
        .await
        .unwrap();
    assert_eq!(after_first.failure_count, 1);
    assert_eq!(after_first.status, legion::scheduler::ScheduleStatus::Active);
    let backoff = after_first.next_run.unwrap() - unix_timestamp();
    assert!(backoff > 50.0 && backoff <= 61.0, "first retry ~60s out, got {}", backoff);

    // Second failure exceeds max_retries: schedule pauses.
    system
        .coordinator
        .schedules()
        .apply(&schedule.schedule_id, |s| {
            s.next_run = Some(unix_timestamp() - 1.0);
        })
        .await
        .unwrap();
    system.scheduler.tick().await;

    let after_second = system
        .coordinator
        .schedules()
        .get_schedule(&schedule.schedule_id)
        .await
        .unwrap();
    assert_eq!(after_second.status, legion::scheduler::ScheduleStatus::Paused);
    assert!(after_second.next_run.is_none());

    let history = system
        .coordinator
        .schedules()
        .get_history(&legion_id, None, 10, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    // Newest first: the terminal failure, then the retry.
    assert_eq!(history[0].status, "failed");
    assert_eq!(history[1].status, "retry");

    system.shutdown().await;
}

#[tokio::test]
async fn test_requeue_delivers_before_older_pending() {
    let (_dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("p1", std::path::Path::new("/tmp/p1"))
        .await
        .unwrap();
    let info = system
        .coordinator
        .create_session(
            &project.project_id,
            CreateSessionParams {
                name: Some("requeue".to_string()),
                ..CreateSessionParams::default()
            },
        )
        .await
        .unwrap();
    let sid = info.session_id;
    let session_dir = system.coordinator.sessions().session_directory(&sid);

    let first = system
        .coordinator
        .enqueue_message(&sid, "first", false, None)
        .await
        .unwrap();
    system
        .coordinator
        .enqueue_message(&sid, "second", false, None)
        .await
        .unwrap();

    system
        .coordinator
        .queues()
        .mark_failed(&sid, &session_dir, &first.queue_id, "sdk down")
        .await
        .unwrap();

    let requeued = system
        .coordinator
        .queues()
        .requeue(&sid, &session_dir, &first.queue_id, 100)
        .await
        .unwrap()
        .unwrap();

    let next = system.coordinator.queues().peek_next(&sid).await.unwrap();
    assert_eq!(next.queue_id, requeued.queue_id);
    assert_eq!(next.content, "first");

    system.shutdown().await;
}
