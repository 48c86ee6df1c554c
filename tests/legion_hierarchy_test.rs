//! Multi-agent integration tests: spawn/dispose under parent
//! authority, cascading deletion with archival, and channel broadcast
//! fan-out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use legion::sdk::mock::MockSdkFactory;
use legion::sdk::SdkFactory;
use legion::{LegionConfig, LegionSystem};

async fn setup() -> (TempDir, LegionSystem, Arc<MockSdkFactory>) {
    let dir = TempDir::new().unwrap();
    let config = LegionConfig {
        data_dir: dir.path().join("data"),
        delivery_poll_ms: 50,
        auto_start_timeout_secs: 5,
        ..LegionConfig::default()
    };
    let factory = Arc::new(MockSdkFactory::new());
    let mut system = LegionSystem::new(config, Arc::clone(&factory) as Arc<dyn SdkFactory>);
    system.start().await.unwrap();
    (dir, system, factory)
}

async fn read_jsonl(path: &std::path::Path) -> Vec<Value> {
    if !path.exists() {
        return Vec::new();
    }
    tokio::fs::read_to_string(path)
        .await
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn test_spawn_builds_hierarchy_and_horde() {
    let (_dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("legion-l", std::path::Path::new("/tmp/l"))
        .await
        .unwrap();

    let a = system
        .overseer
        .create_minion_for_user(
            &project.project_id,
            "Atlas",
            "Coordinator",
            "",
            vec!["planning".to_string()],
        )
        .await
        .unwrap();
    system.coordinator.start_session(&a).await.unwrap();

    let b = system
        .overseer
        .spawn_minion(&a, "Boreas", "Researcher", "research things", vec!["research".to_string()], vec![])
        .await
        .unwrap();

    let parent = system.coordinator.sessions().get_session(&a).await.unwrap();
    assert!(parent.is_overseer);
    assert_eq!(parent.child_minion_ids, vec![b.clone()]);

    let child = system.coordinator.sessions().get_session(&b).await.unwrap();
    assert_eq!(child.parent_overseer_id.as_deref(), Some(a.as_str()));
    assert_eq!(child.overseer_level, 1);
    assert_eq!(child.horde_id, parent.horde_id);
    assert!(child.horde_id.is_some());

    // Both registered for discovery.
    assert_eq!(system.coordinator.capabilities().find("research"), vec![b.clone()]);
    assert_eq!(system.coordinator.capabilities().find("planning"), vec![a.clone()]);

    // Duplicate name is rejected.
    let dup = system
        .overseer
        .spawn_minion(&a, "Boreas", "Another", "", vec![], vec![])
        .await;
    assert!(dup.is_err());

    system.shutdown().await;
}

#[tokio::test]
async fn test_cascading_deletion_archives_each_level() {
    let (dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("legion-l", std::path::Path::new("/tmp/l"))
        .await
        .unwrap();
    let legion_id = project.project_id.clone();

    let a = system
        .overseer
        .create_minion_for_user(&legion_id, "Atlas", "", "", vec!["alpha".to_string()])
        .await
        .unwrap();
    system.coordinator.start_session(&a).await.unwrap();
    let b = system
        .overseer
        .spawn_minion(&a, "Boreas", "", "", vec!["beta".to_string()], vec![])
        .await
        .unwrap();
    let c = system
        .overseer
        .spawn_minion(&b, "Crios", "", "", vec!["gamma".to_string()], vec![])
        .await
        .unwrap();

    let descendants = system.coordinator.delete_session(&a).await.unwrap();
    assert_eq!(descendants, 2);

    // Everyone is gone, including the emptied project.
    for sid in [&a, &b, &c] {
        assert!(system.coordinator.sessions().get_session(sid).await.is_none());
    }
    assert!(system
        .coordinator
        .projects()
        .get_project(&legion_id)
        .await
        .is_none());

    // No capability references survive.
    for keyword in ["alpha", "beta", "gamma"] {
        assert!(system.coordinator.capabilities().find(keyword).is_empty());
    }

    // Each level archived with the right cascade accounting.
    let a_archives = system.coordinator.archive().list_archives(&a).await.unwrap();
    assert_eq!(a_archives.len(), 1);
    assert_eq!(a_archives[0].1.descendants_count, 2);
    assert_eq!(a_archives[0].1.reason, "user_deleted");

    let b_archives = system.coordinator.archive().list_archives(&b).await.unwrap();
    assert_eq!(b_archives[0].1.descendants_count, 1);
    assert_eq!(b_archives[0].1.reason, "cascade_disposal");

    let c_archives = system.coordinator.archive().list_archives(&c).await.unwrap();
    assert_eq!(c_archives[0].1.descendants_count, 0);
    assert_eq!(c_archives[0].1.reason, "cascade_disposal");

    // Archives carry the copied session data.
    let archive_root = dir.path().join("data").join("archives").join("minions");
    assert!(archive_root.join(&a).exists());

    system.shutdown().await;
}

#[tokio::test]
async fn test_dispose_requires_parent_authority() {
    let (_dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("legion-l", std::path::Path::new("/tmp/l"))
        .await
        .unwrap();

    let a = system
        .overseer
        .create_minion_for_user(&project.project_id, "Atlas", "", "", vec![])
        .await
        .unwrap();
    system.coordinator.start_session(&a).await.unwrap();
    let b = system
        .overseer
        .spawn_minion(&a, "Boreas", "", "", vec![], vec![])
        .await
        .unwrap();
    let _c = system
        .overseer
        .spawn_minion(&b, "Crios", "", "", vec![], vec![])
        .await
        .unwrap();

    // Atlas cannot dispose its grandchild directly.
    assert!(system.overseer.dispose_minion(&a, "Crios").await.is_err());

    // Boreas disposes its own child.
    let (disposed_id, descendants) = system.overseer.dispose_minion(&b, "Crios").await.unwrap();
    assert_eq!(descendants, 0);
    assert!(system
        .coordinator
        .sessions()
        .get_session(&disposed_id)
        .await
        .is_none());

    // Boreas is no longer an overseer.
    let b_info = system.coordinator.sessions().get_session(&b).await.unwrap();
    assert!(!b_info.is_overseer);
    assert!(b_info.child_minion_ids.is_empty());

    system.shutdown().await;
}

#[tokio::test]
async fn test_channel_broadcast_excludes_sender() {
    let (dir, mut system, factory) = setup().await;
    let project = system
        .coordinator
        .create_project("legion-l", std::path::Path::new("/tmp/l"))
        .await
        .unwrap();
    let legion_id = project.project_id.clone();

    let mut sids = Vec::new();
    for name in ["Atlas", "Boreas", "Crios"] {
        let sid = system
            .overseer
            .create_minion_for_user(&legion_id, name, "", "", vec![])
            .await
            .unwrap();
        system.coordinator.start_session(&sid).await.unwrap();
        sids.push(sid);
    }
    let (a, b, c) = (sids[0].clone(), sids[1].clone(), sids[2].clone());

    let channel = system
        .coordinator
        .channels()
        .create_channel(&legion_id, "#planning", "planning talk", "planning", sids.clone(), None)
        .await
        .unwrap();

    let comm = legion::legion::Comm {
        from_minion_id: Some(a.clone()),
        from_minion_name: Some("Atlas".to_string()),
        to_channel_id: Some(channel.channel_id.clone()),
        summary: "hi".to_string(),
        content: "hi".to_string(),
        comm_type: legion::legion::CommType::Info,
        ..legion::legion::Comm::default()
    };
    let comm_id = comm.comm_id.clone();
    assert!(system.comm_router.route_comm(comm).await.unwrap());

    // Give the recipient turns a moment to run.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let legion_dir = dir.path().join("data").join("legions").join(&legion_id);

    // Timeline shows three persisted copies sharing one comm_id.
    let timeline = read_jsonl(&legion_dir.join("timeline.jsonl")).await;
    let copies: Vec<&Value> = timeline
        .iter()
        .filter(|record| record["comm_id"] == comm_id.as_str())
        .collect();
    assert_eq!(copies.len(), 3, "one channel copy plus two recipient copies");

    // Recipient logs got one copy each; the sender's log has only the
    // outgoing channel copy.
    for recipient in [&b, &c] {
        let log = read_jsonl(&legion_dir.join("minions").join(recipient).join("comms.jsonl")).await;
        assert_eq!(log.iter().filter(|r| r["comm_id"] == comm_id.as_str()).count(), 1);
    }
    let sender_log = read_jsonl(&legion_dir.join("minions").join(&a).join("comms.jsonl")).await;
    assert_eq!(
        sender_log
            .iter()
            .filter(|r| r["comm_id"] == comm_id.as_str())
            .count(),
        1
    );

    // The channel log holds the original broadcast.
    let channel_log = read_jsonl(
        &legion_dir
            .join("channels")
            .join(&channel.channel_id)
            .join("comms.jsonl"),
    )
    .await;
    assert_eq!(channel_log.len(), 1);

    // B and C each received one formatted delivery; A received none.
    let b_messages = factory.handle(&b).await.unwrap().sent_messages.lock().await.clone();
    assert_eq!(b_messages.len(), 1);
    assert!(b_messages[0].contains("from Minion #Atlas"));
    assert!(b_messages[0].contains("hi"));
    let c_messages = factory.handle(&c).await.unwrap().sent_messages.lock().await.clone();
    assert_eq!(c_messages.len(), 1);
    let a_messages = factory.handle(&a).await.unwrap().sent_messages.lock().await.clone();
    assert!(a_messages.is_empty(), "the sender never receives its own broadcast");

    system.shutdown().await;
}

#[tokio::test]
async fn test_comm_to_missing_minion_yields_system_error_comm() {
    let (dir, mut system, _factory) = setup().await;
    let project = system
        .coordinator
        .create_project("legion-l", std::path::Path::new("/tmp/l"))
        .await
        .unwrap();
    let legion_id = project.project_id.clone();

    let a = system
        .overseer
        .create_minion_for_user(&legion_id, "Atlas", "", "", vec![])
        .await
        .unwrap();
    system.coordinator.start_session(&a).await.unwrap();

    let comm = legion::legion::Comm {
        from_minion_id: Some(a.clone()),
        from_minion_name: Some("Atlas".to_string()),
        to_minion_id: Some("00000000-dead-beef-0000-000000000000".to_string()),
        content: "anyone there?".to_string(),
        comm_type: legion::legion::CommType::Question,
        ..legion::legion::Comm::default()
    };
    let failed_id = comm.comm_id.clone();
    let delivered = system.comm_router.route_comm(comm).await.unwrap();
    assert!(!delivered);

    // The sender got a system error comm referencing the failed comm.
    let sender_log = read_jsonl(
        &dir.path()
            .join("data")
            .join("legions")
            .join(&legion_id)
            .join("minions")
            .join(&a)
            .join("comms.jsonl"),
    )
    .await;
    let error_comm = sender_log
        .iter()
        .find(|r| r["comm_type"] == "system")
        .expect("system error comm persisted");
    assert_eq!(error_comm["in_reply_to"], failed_id.as_str());

    system.shutdown().await;
}
