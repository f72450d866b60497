//! Integration tests for the agent coordinator

mod common;

use ai_agent_common::{
    AgentStatus, CoordinationError, FirePolicy, LockRequestStatus, MemoryStore, NewTask,
    StateStore, Task, TaskStatus,
};
use ai_agent_coordinator::{SessionPoll, StatusEventType};
use common::{build, build_with_store, config, id, paths, ScriptedBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_dispatch_skips_task_whose_files_are_locked() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.hire("bob", "dev").await.unwrap();
    coordinator.hire("carol", "reviewer").await.unwrap();
    coordinator
        .lock_files("carol", &paths(&["shared.rs"]), "review")
        .await
        .unwrap();

    coordinator
        .submit_task(
            NewTask::new("touch shared")
                .with_id("T1")
                .with_priority(5)
                .with_role("dev")
                .with_files(["shared.rs"]),
        )
        .await
        .unwrap();
    coordinator
        .submit_task(
            NewTask::new("touch other")
                .with_id("T2")
                .with_priority(1)
                .with_role("dev")
                .with_files(["other.rs"]),
        )
        .await
        .unwrap();

    let summary = coordinator.tick().await.unwrap();
    assert_eq!(summary.dispatched, vec![id("T2")]);

    let t1 = coordinator.task_status(&id("T1")).await.unwrap();
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(t1.skipped, 1);
    assert_eq!(coordinator.locks_for("alice").len(), 1);
    assert!(coordinator.locks_for("bob").is_empty());
    assert_eq!(
        coordinator.agent("bob").await.unwrap().status,
        AgentStatus::Idle
    );

    coordinator.release_files("carol", None).await;
    let summary = coordinator.tick().await.unwrap();
    assert_eq!(summary.dispatched, vec![id("T1")]);
    assert_eq!(
        coordinator.task_status(&id("T1")).await.unwrap().assigned_agent.as_deref(),
        Some("bob")
    );
}

#[tokio::test]
async fn test_completion_releases_then_dispatches_dependent_immediately() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    let mut events = coordinator.subscribe();

    coordinator.hire("alice", "dev").await.unwrap();
    coordinator
        .submit_task(NewTask::new("schema").with_id("T1").with_files(["db/schema.sql"]))
        .await
        .unwrap();
    coordinator
        .submit_task(
            NewTask::new("migration")
                .with_id("T2")
                .depends_on(["T1"])
                .with_files(["db/schema.sql"]),
        )
        .await
        .unwrap();
    coordinator.tick().await.unwrap();

    let ready = coordinator
        .complete_task("alice", &id("T1"), Some("schema written".into()))
        .await
        .unwrap();
    assert_eq!(ready, vec![id("T2")]);

    // dispatched without waiting for another tick
    let t2 = coordinator.task_status(&id("T2")).await.unwrap();
    assert_eq!(t2.status, TaskStatus::Running);
    assert_eq!(t2.assigned_agent.as_deref(), Some("alice"));
    let t1 = coordinator.task_status(&id("T1")).await.unwrap();
    assert_eq!(t1.result.as_deref(), Some("schema written"));

    let locks = coordinator.list_locks();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].path, PathBuf::from("/repo/db/schema.sql"));
    assert!(locks[0].description.contains("T2"));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push((event.event_type, event.task_id));
    }
    let completed = kinds
        .iter()
        .position(|k| *k == (StatusEventType::TaskCompleted, Some(id("T1"))))
        .unwrap();
    let assigned = kinds
        .iter()
        .position(|k| *k == (StatusEventType::TaskAssigned, Some(id("T2"))))
        .unwrap();
    assert!(completed < assigned);
}

#[tokio::test]
async fn test_tick_applies_worker_results_and_cascades_failure() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.hire("bob", "dev").await.unwrap();
    coordinator
        .submit_task(NewTask::new("lib").with_id("T1").with_files(["src/lib.rs"]))
        .await
        .unwrap();
    coordinator
        .submit_task(NewTask::new("tests").with_id("T2").with_files(["tests/it.rs"]))
        .await
        .unwrap();
    coordinator
        .submit_task(NewTask::new("release").with_id("T3").depends_on(["T2"]))
        .await
        .unwrap();

    assert_eq!(coordinator.tick().await.unwrap().dispatched.len(), 2);

    backend.set_poll("T2", SessionPoll::running(Some(10), Some("tests red")));
    coordinator.tick().await.unwrap();

    backend.set_poll("T1", SessionPoll::finished(Some("ok".into())));
    backend.set_poll("T2", SessionPoll::failed("exit status 1"));
    let summary = coordinator.tick().await.unwrap();
    assert_eq!(summary.completed, vec![id("T1")]);
    assert_eq!(summary.failed, vec![id("T2")]);

    let t2 = coordinator.task_status(&id("T2")).await.unwrap();
    assert_eq!(t2.status, TaskStatus::Failed);
    let failure = t2.failure.unwrap();
    assert!(failure.contains("exit status 1"));
    assert!(failure.contains("tests red"));

    let t3 = coordinator.task_status(&id("T3")).await.unwrap();
    assert_eq!(t3.status, TaskStatus::Failed);
    assert!(t3.failure.unwrap().contains("T2"));

    assert!(coordinator.list_locks().is_empty());
    for agent in coordinator.list_agents().await {
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.current_task, None);
    }
}

#[tokio::test]
async fn test_fire_requeues_task_and_releases_every_lock() {
    let backend = ScriptedBackend::new();
    let (coordinator, store) = build(backend.clone(), config());
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator
        .lock_files("alice", &paths(&["NOTES.md"]), "scratch")
        .await
        .unwrap();
    coordinator
        .submit_task(NewTask::new("parser").with_id("T1").with_files(["src/parser.rs"]))
        .await
        .unwrap();
    coordinator.tick().await.unwrap();
    assert_eq!(coordinator.locks_for("alice").len(), 2);

    let task = coordinator.fire("alice").await.unwrap();
    assert_eq!(task, Some(id("T1")));
    assert_eq!(backend.cancels_of("T1"), 1);
    assert!(coordinator.list_locks().is_empty());
    assert!(coordinator.agent("alice").await.is_none());

    let t1 = coordinator.task_status(&id("T1")).await.unwrap();
    assert_eq!(t1.status, TaskStatus::Ready);
    assert_eq!(t1.assigned_agent, None);

    let persisted = store.load().await.unwrap();
    assert!(persisted.agents.is_empty());
    assert!(persisted.locks.is_empty());

    coordinator.hire("bob", "dev").await.unwrap();
    assert_eq!(coordinator.tick().await.unwrap().dispatched, vec![id("T1")]);
}

#[tokio::test]
async fn test_fire_with_fail_cascade_policy() {
    let mut config = config();
    config.coordinator.fire_policy = FirePolicy::FailCascade;
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend, config);

    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.submit_task(NewTask::new("a").with_id("T1")).await.unwrap();
    coordinator
        .submit_task(NewTask::new("b").with_id("T2").depends_on(["T1"]))
        .await
        .unwrap();
    coordinator.tick().await.unwrap();

    coordinator.fire("alice").await.unwrap();
    for task in ["T1", "T2"] {
        let task = coordinator.task_status(&id(task)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
    assert!(coordinator
        .task_status(&id("T1"))
        .await
        .unwrap()
        .failure
        .unwrap()
        .contains("fired"));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_progress_counts_as_no_progress_until_stuck() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.submit_task(NewTask::new("build").with_id("T1")).await.unwrap();
    coordinator.tick().await.unwrap();

    backend.set_poll("T1", SessionPoll::running(Some(40), None));
    coordinator.tick().await.unwrap();
    coordinator.tick().await.unwrap();
    coordinator.tick().await.unwrap();
    assert_eq!(coordinator.heartbeat(&id("T1")).unwrap().no_progress_count, 2);
    assert!(!coordinator.on_progress("alice", Some(40), None).await.unwrap());
    assert_eq!(coordinator.heartbeat(&id("T1")).unwrap().no_progress_count, 3);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(coordinator.stuck_detector().await.unwrap().is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    coordinator.tick().await.unwrap();
    assert_eq!(coordinator.stuck_detector().await.unwrap(), vec![id("T1")]);
    assert_eq!(
        coordinator.task_status(&id("T1")).await.unwrap().status,
        TaskStatus::Stuck
    );
    assert_eq!(backend.nudged.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_responsive_worker_fails_after_bounded_recovery() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    let mut events = coordinator.subscribe();
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator
        .submit_task(NewTask::new("hang").with_id("T1").with_files(["src/main.rs"]))
        .await
        .unwrap();
    coordinator.tick().await.unwrap();

    backend.set_poll("T1", SessionPoll::running(Some(40), Some("resolving deps")));
    coordinator.tick().await.unwrap();

    for round in 1..=2 {
        tokio::time::advance(Duration::from_secs(61)).await;
        coordinator.stuck_detector().await.unwrap();
        assert_eq!(
            coordinator.task_status(&id("T1")).await.unwrap().status,
            TaskStatus::Stuck
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        coordinator.stuck_detector().await.unwrap();
        assert_eq!(backend.starts_of("T1"), round + 1);
        let task = coordinator.task_status(&id("T1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.restarts, round as u32);
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    coordinator.stuck_detector().await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    coordinator.stuck_detector().await.unwrap();

    let task = coordinator.task_status(&id("T1")).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let failure = task.failure.unwrap();
    assert!(failure.contains("Recovery exhausted"));
    assert!(failure.contains("last note: resolving deps"));

    assert_eq!(backend.starts_of("T1"), 3);
    assert_eq!(backend.nudged.lock().len(), 3);
    assert_eq!(backend.cancels_of("T1"), 3);
    assert!(coordinator.list_locks().is_empty());
    assert_eq!(coordinator.agent("alice").await.unwrap().status, AgentStatus::Idle);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= event.event_type == StatusEventType::TaskFailed;
    }
    assert!(failed);
}

#[tokio::test]
async fn test_backend_refusal_takes_agent_offline() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    backend.refuse_starts(true);
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator
        .submit_task(NewTask::new("a").with_id("T1").with_files(["a.rs"]))
        .await
        .unwrap();

    assert!(coordinator.tick().await.unwrap().dispatched.is_empty());
    assert_eq!(coordinator.agent("alice").await.unwrap().status, AgentStatus::Offline);
    assert_eq!(
        coordinator.task_status(&id("T1")).await.unwrap().status,
        TaskStatus::Ready
    );
    assert!(coordinator.list_locks().is_empty());

    // offline agents get nothing
    backend.refuse_starts(false);
    assert!(coordinator.tick().await.unwrap().dispatched.is_empty());

    coordinator.bring_online("alice").await.unwrap();
    assert_eq!(coordinator.tick().await.unwrap().dispatched, vec![id("T1")]);
}

#[tokio::test]
async fn test_restore_resumes_in_flight_work() {
    let store = Arc::new(MemoryStore::new());
    let first = build_with_store(ScriptedBackend::new(), config(), store.clone());
    first.hire("alice", "dev").await.unwrap();
    first.hire("bob", "dev").await.unwrap();
    first
        .submit_task(NewTask::new("a").with_id("T1").with_files(["a.rs"]))
        .await
        .unwrap();
    first
        .submit_task(NewTask::new("b").with_id("T2").depends_on(["T1"]))
        .await
        .unwrap();
    first.tick().await.unwrap();

    let mut ghost = Task::from_new(NewTask::new("orphan").with_id("G1"), 10);
    ghost.status = TaskStatus::Running;
    ghost.assigned_agent = Some("ghost".into());
    store.put_task(&ghost).await.unwrap();

    let backend = ScriptedBackend::new();
    let second = build_with_store(backend.clone(), config(), store.clone());
    let summary = second.restore().await.unwrap();
    assert_eq!(summary.agents, 2);
    assert_eq!(summary.locks, 1);
    assert_eq!(summary.resumed, vec![id("T1")]);
    assert_eq!(summary.requeued, vec![id("G1")]);

    let owner = second.task_status(&id("T1")).await.unwrap().assigned_agent.unwrap();
    assert_eq!(second.list_locks()[0].owner, owner);
    assert_eq!(
        second.task_status(&id("G1")).await.unwrap().status,
        TaskStatus::Ready
    );

    second.tick().await.unwrap();
    assert_eq!(backend.starts_of("T1"), 1);
    assert_eq!(backend.started.lock()[0].0, owner);
    assert_eq!(
        second.task_status(&id("T1")).await.unwrap().status,
        TaskStatus::Running
    );
    assert_eq!(backend.starts_of("G1"), 1);

    second.complete_task(&owner, &id("T1"), None).await.unwrap();
    assert_eq!(
        second.task_status(&id("T2")).await.unwrap().status,
        TaskStatus::Running
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_loops_drive_plan_to_completion() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    backend.set_poll("T1", SessionPoll::finished(None));
    backend.set_poll("T2", SessionPoll::finished(None));

    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.submit_task(NewTask::new("a").with_id("T1")).await.unwrap();
    coordinator
        .submit_task(NewTask::new("b").with_id("T2").depends_on(["T1"]))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handles = coordinator.run(shutdown.clone());

    tokio::time::timeout(Duration::from_secs(60), async {
        while !coordinator.all_tasks_terminal().await {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    for task in coordinator.list_tasks().await {
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_help_request_and_unknown_agents() {
    let (coordinator, _) = build(ScriptedBackend::new(), config());
    let mut events = coordinator.subscribe();
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.request_help("alice", "which schema version?").await.unwrap();

    let mut help = None;
    while let Ok(event) = events.try_recv() {
        if event.event_type == StatusEventType::HelpRequested {
            help = Some(event);
        }
    }
    let help = help.unwrap();
    assert_eq!(help.agent_id.as_deref(), Some("alice"));
    assert!(help.message.contains("schema version"));

    assert!(coordinator.request_help("nobody", "hi").await.is_err());
    assert!(coordinator.fire("nobody").await.is_err());
    assert!(coordinator
        .lock_files("nobody", &paths(&["a.rs"]), "x")
        .await
        .is_err());
}

#[tokio::test]
async fn test_retry_failed_task() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config());
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.submit_task(NewTask::new("flaky").with_id("T1")).await.unwrap();
    coordinator.tick().await.unwrap();
    coordinator.fail_task("alice", &id("T1"), "network").await.unwrap();

    let task = coordinator.retry_task(&id("T1")).await.unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(coordinator.tick().await.unwrap().dispatched, vec![id("T1")]);
    assert_eq!(backend.starts_of("T1"), 2);
}

#[tokio::test]
async fn test_fire_withdraws_pending_file_requests() {
    let (coordinator, _) = build(ScriptedBackend::new(), config());
    let mut events = coordinator.subscribe();
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.hire("bob", "dev").await.unwrap();
    coordinator
        .lock_files("alice", &paths(&["a.py"]), "edit")
        .await
        .unwrap();
    let request = coordinator
        .request_file("bob", &PathBuf::from("a.py"), "fix import")
        .await
        .unwrap();

    coordinator.fire("bob").await.unwrap();
    assert_eq!(
        coordinator.locks().get_request(request).unwrap().status,
        LockRequestStatus::Withdrawn
    );
    assert!(coordinator.pending_requests_for("alice").is_empty());

    let err = coordinator
        .approve_request(request, Some("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::AlreadyResolved { .. }));
    let locks = coordinator.list_locks();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].owner, "alice");

    let mut withdrawn = false;
    while let Ok(event) = events.try_recv() {
        withdrawn |= event.event_type == StatusEventType::LockRequestResolved
            && event.agent_id.as_deref() == Some("bob");
    }
    assert!(withdrawn);
}

#[tokio::test]
async fn test_approve_rejects_requester_who_is_not_hired() {
    let (coordinator, _) = build(ScriptedBackend::new(), config());
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator
        .lock_files("alice", &paths(&["a.py"]), "edit")
        .await
        .unwrap();
    let request = coordinator
        .locks()
        .request_file("ghost", &PathBuf::from("a.py"), "x")
        .await
        .unwrap();

    let err = coordinator.approve_request(request, None).await.unwrap_err();
    assert!(matches!(err, CoordinationError::NotFound { .. }));
    assert_eq!(coordinator.list_locks()[0].owner, "alice");
    assert_eq!(
        coordinator.locks().get_request(request).unwrap().status,
        LockRequestStatus::Pending
    );
}

#[tokio::test]
async fn test_finishing_a_task_keeps_locks_taken_before_dispatch() {
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend, config());
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator
        .lock_files("alice", &paths(&["NOTES.md"]), "scratch")
        .await
        .unwrap();

    for (task, file) in [("T1", "src/a.rs"), ("T2", "src/b.rs")] {
        coordinator
            .submit_task(NewTask::new("edit").with_id(task).with_files(["NOTES.md", file]))
            .await
            .unwrap();
    }

    assert_eq!(coordinator.tick().await.unwrap().dispatched.len(), 1);
    assert_eq!(coordinator.locks_for("alice").len(), 2);
    let first = coordinator.agent("alice").await.unwrap().current_task.unwrap();
    coordinator.complete_task("alice", &first, None).await.unwrap();

    let second = coordinator.agent("alice").await.unwrap().current_task.unwrap();
    assert_ne!(first, second);
    coordinator.fail_task("alice", &second, "compile error").await.unwrap();

    let locks = coordinator.locks_for("alice");
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].path, PathBuf::from("/repo/NOTES.md"));
    assert_eq!(locks[0].description, "scratch");
}

#[tokio::test(start_paused = true)]
async fn test_stuck_detector_keeps_going_after_one_task_errors() {
    let mut config = config();
    config.coordinator.max_hard_restarts = 0;
    let backend = ScriptedBackend::new();
    let (coordinator, _) = build(backend.clone(), config);
    coordinator.hire("alice", "dev").await.unwrap();
    coordinator.hire("bob", "dev").await.unwrap();
    for (task, file) in [("T1", "a.rs"), ("T2", "b.rs")] {
        coordinator
            .submit_task(NewTask::new("hang").with_id(task).with_files([file]))
            .await
            .unwrap();
    }
    assert_eq!(coordinator.tick().await.unwrap().dispatched.len(), 2);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(coordinator.stuck_detector().await.unwrap().len(), 2);

    // Finished behind the coordinator's back, so failing it is refused
    coordinator.scheduler().mark_completed(&id("T1")).await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    let acted = coordinator.stuck_detector().await.unwrap();
    assert_eq!(acted, vec![id("T2")]);

    let t2 = coordinator.task_status(&id("T2")).await.unwrap();
    assert_eq!(t2.status, TaskStatus::Failed);
    assert!(t2.failure.unwrap().contains("Recovery exhausted"));
    assert_eq!(
        coordinator.task_status(&id("T1")).await.unwrap().status,
        TaskStatus::Completed
    );
    for agent in ["alice", "bob"] {
        assert_eq!(coordinator.agent(agent).await.unwrap().status, AgentStatus::Idle);
    }
    assert!(coordinator.list_locks().is_empty());
}
