//! Resource-exhaustion escalation through the category engine, end to
//! end against a scripted worker.
mod common;

use common::MockWorker;
use std::time::Duration;
use taskswarm::config::ManagerConfig;
use taskswarm::{Manager, ResourceSummary, Task, TaskResultCode};

fn test_config() -> ManagerConfig {
    let mut c = ManagerConfig::default();
    c.manager.port = 0;
    c
}

async fn wait_for_task(m: &mut Manager, secs: u64) -> Option<Task> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if let Some(t) = m.wait(Some(Duration::from_millis(500))).await {
            return Some(t);
        }
    }
    None
}

const RESOURCE_EXHAUSTION: i64 = 16;

#[tokio::test]
async fn test_exhaustion_escalates_first_to_max_allocation() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    m.specify_category_first_allocation_guess(
        "big",
        ResourceSummary {
            cores: Some(1),
            memory: Some(1024),
            ..Default::default()
        },
    );
    let id = m.submit(Task::new("analyze").with_category("big")).unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;

        // first attempt runs with the category's first allocation
        let d1 = w.expect_dispatch().await;
        assert_eq!(d1.task_id, id);
        assert_eq!(d1.field("cores"), Some("1"));
        assert_eq!(d1.field("memory"), Some("1024"));
        w.send_result(RESOURCE_EXHAUSTION, 9, b"", 5000, id).await;
        w.expect_kill(id).await;

        // the retry escalates to the maximum: the whole worker
        let d2 = w.expect_dispatch().await;
        assert_eq!(d2.task_id, id);
        assert_eq!(d2.field("cores"), Some("4"));
        assert_eq!(d2.field("memory"), Some("4096"));
        w.send_result(0, 0, b"fits now\n", 5000, id).await;
        w.expect_kill(id).await;
        w
    });

    let done = wait_for_task(&mut m, 15).await.expect("task completes");
    assert_eq!(done.id, id);
    assert_eq!(done.result, TaskResultCode::Success);
    assert_eq!(done.try_count, 2);
    assert_eq!(done.exhausted_attempts, 1);
    assert_eq!(done.stdout(), "fits now\n");
    assert_eq!(m.stats().tasks_exhausted_attempts, 1);

    worker.await.unwrap();
}

#[tokio::test]
async fn test_exhaustion_at_max_fails_the_task() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    m.specify_category_first_allocation_guess(
        "big",
        ResourceSummary {
            memory: Some(512),
            ..Default::default()
        },
    );
    let id = m.submit(Task::new("analyze").with_category("big")).unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;

        let d1 = w.expect_dispatch().await;
        assert_eq!(d1.field("memory"), Some("512"));
        w.send_result(RESOURCE_EXHAUSTION, 9, b"", 5000, id).await;
        w.expect_kill(id).await;

        // still not enough at the maximum allocation
        let d2 = w.expect_dispatch().await;
        assert_eq!(d2.field("memory"), Some("4096"));
        w.send_result(RESOURCE_EXHAUSTION, 9, b"", 5000, id).await;
        w.expect_kill(id).await;
        w
    });

    // no further escalation is possible: the task comes back exhausted
    let done = wait_for_task(&mut m, 15).await.expect("task is returned");
    assert_eq!(done.id, id);
    assert_eq!(done.result, TaskResultCode::ResourceExhaustion);
    assert_eq!(done.try_count, 2);
    assert_eq!(done.exhausted_attempts, 2);

    worker.await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retry_jumps_the_ready_queue() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    m.specify_category_first_allocation_guess(
        "big",
        ResourceSummary {
            memory: Some(1024),
            ..Default::default()
        },
    );

    let big = m.submit(Task::new("big-task").with_category("big")).unwrap();
    // a backlog of ordinary tasks behind it
    let filler_a = m.submit(Task::new("filler-a")).unwrap();
    let filler_b = m.submit(Task::new("filler-b")).unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;

        let d1 = w.expect_dispatch().await;
        assert_eq!(d1.task_id, big);
        w.send_result(RESOURCE_EXHAUSTION, 9, b"", 5000, big).await;
        w.expect_kill(big).await;

        // the exhausted retry is dispatched before the fillers
        let d2 = w.expect_dispatch().await;
        assert_eq!(d2.task_id, big, "exhausted retry bypasses the backlog");
        w.send_result(0, 0, b"", 5000, big).await;
        w.expect_kill(big).await;

        for _ in 0..2 {
            let d = w.expect_dispatch().await;
            assert!(d.task_id == filler_a || d.task_id == filler_b);
            w.send_result(0, 0, b"", 1000, d.task_id).await;
            w.expect_kill(d.task_id).await;
        }
        w
    });

    let mut done_ids = Vec::new();
    for _ in 0..3 {
        let t = wait_for_task(&mut m, 15).await.expect("tasks complete");
        done_ids.push(t.id);
    }
    done_ids.sort_unstable();
    assert_eq!(done_ids, vec![big, filler_a, filler_b]);
    assert!(m.empty());

    worker.await.unwrap();
}
