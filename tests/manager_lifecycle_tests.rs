//! End-to-end manager lifecycle: dispatch, retrieval, caching, worker
//! disconnect, and cancellation, driven against a scripted worker.
mod common;

use common::MockWorker;
use std::time::Duration;
use taskswarm::config::ManagerConfig;
use taskswarm::core::file::{FileFlags, TaskFile};
use taskswarm::{Manager, Task, TaskResultCode, TaskState};

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

/// Drive the event loop for roughly the given wall time.
async fn drive(m: &mut Manager, millis: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
    while tokio::time::Instant::now() < deadline {
        let _ = m.wait(Some(Duration::from_millis(100))).await;
    }
}

#[tokio::test]
async fn test_happy_path_returns_stdout() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let id = m.submit(Task::new("echo hi")).unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        let d = w.expect_dispatch().await;
        assert_eq!(d.task_id, id);
        assert_eq!(d.command, "echo hi");
        assert_eq!(d.field("category"), Some("default"));
        w.send_result(0, 0, b"hi\n", 1000, id).await;
        w.expect_kill(id).await;
        w
    });

    let done = wait_for_task(&mut m, 10).await.expect("task completes");
    assert_eq!(done.id, id);
    assert_eq!(done.result, TaskResultCode::Success);
    assert_eq!(done.exit_code, 0);
    assert_eq!(done.stdout(), "hi\n");
    assert_eq!(done.try_count, 1);
    assert_eq!(m.task_state(id), TaskState::Done);

    let s = m.stats();
    assert_eq!(s.tasks_done, 1);
    assert_eq!(s.tasks_failed, 0);
    assert_eq!(s.tasks_dispatched, 1);

    // a completed task is returned exactly once
    assert!(m.empty());
    assert!(m.wait(Some(Duration::from_millis(200))).await.is_none());

    worker.await.unwrap();
}

#[tokio::test]
async fn test_output_file_is_fetched_back() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("result.txt");

    let mut m = Manager::bind(test_config()).await.unwrap();
    let task = Task::new("produce").with_output(TaskFile::local(
        &out_path,
        "result.txt",
        FileFlags::default(),
    ));
    let id = m.submit(task).unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        let d = w.expect_dispatch().await;
        assert!(d.lines.iter().any(|l| l.starts_with("outfile ")));
        w.send_result(0, 0, b"", 1000, id).await;
        w.serve_get_file("result.txt", b"payload bytes").await;
        w.expect_kill(id).await;
        // the uncacheable output is dropped from the worker afterwards
        w.expect_unlink().await;
        w
    });

    let done = wait_for_task(&mut m, 10).await.expect("task completes");
    assert_eq!(done.result, TaskResultCode::Success);
    assert_eq!(std::fs::read(&out_path).unwrap(), b"payload bytes");
    assert_eq!(done.bytes_received, 13);

    worker.await.unwrap();
}

#[tokio::test]
async fn test_missing_output_marks_task_without_aborting() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("never.txt");

    let mut m = Manager::bind(test_config()).await.unwrap();
    let task = Task::new("produce").with_output(TaskFile::local(
        &out_path,
        "never.txt",
        FileFlags::default(),
    ));
    let id = m.submit(task).unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        let d = w.expect_dispatch().await;
        w.send_result(0, 0, b"", 1000, d.task_id).await;
        w.serve_get_missing("never.txt", 2).await;
        w.expect_kill(d.task_id).await;
        w.expect_unlink().await;
        w
    });

    let done = wait_for_task(&mut m, 10).await.expect("task completes");
    assert_eq!(done.id, id);
    assert_eq!(done.result, TaskResultCode::OutputMissing);
    assert!(!out_path.exists());

    worker.await.unwrap();
}

#[tokio::test]
async fn test_cached_input_is_sent_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("shared.dat");
    let content = vec![7u8; 1024];
    std::fs::write(&input_path, &content).unwrap();

    let cached = FileFlags {
        cache: true,
        ..Default::default()
    };
    let input_a = TaskFile::local(&input_path, "shared.dat", cached);
    let input_b = TaskFile::local(&input_path, "shared.dat", cached);
    assert_eq!(input_a.cache_name, input_b.cache_name);

    let mut m = Manager::bind(test_config()).await.unwrap();
    let first = m.submit(Task::new("consume 1").with_input(input_a)).unwrap();
    let second = m.submit(Task::new("consume 2").with_input(input_b)).unwrap();
    let port = m.port();

    let expected = content.clone();
    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;

        let d1 = w.expect_dispatch().await;
        assert_eq!(d1.puts.len(), 1, "first task stages the input");
        assert_eq!(d1.puts[0].1, expected);
        assert!(d1.lines.iter().any(|l| l.starts_with("infile ")));
        w.send_result(0, 0, b"", 1000, d1.task_id).await;
        w.expect_kill(d1.task_id).await;

        let d2 = w.expect_dispatch().await;
        assert!(d2.puts.is_empty(), "second task reuses the cached copy");
        w.send_result(0, 0, b"", 1000, d2.task_id).await;
        w.expect_kill(d2.task_id).await;
        w
    });

    let done1 = wait_for_task(&mut m, 10).await.expect("first completes");
    let done2 = wait_for_task(&mut m, 10).await.expect("second completes");
    let mut ids = [done1.id, done2.id];
    ids.sort_unstable();
    assert_eq!(ids, [first, second]);

    // the input crossed the wire exactly once
    assert_eq!(m.stats().bytes_sent, content.len() as i64);

    worker.await.unwrap();
}

#[tokio::test]
async fn test_worker_disconnect_requeues_running_tasks() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let small = |cmd: &str| {
        Task::new(cmd)
            .with_cores(1)
            .with_memory(512)
            .with_disk(100)
    };
    let a = m.submit(small("first")).unwrap();
    let b = m.submit(small("second")).unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node2", 4, 4096, 10000).await;
        let d1 = w.expect_dispatch().await;
        let d2 = w.expect_dispatch().await;
        assert_ne!(d1.task_id, d2.task_id);
        // vanish mid-run
        drop(w);
    });

    // the manager notices the dead connection and requeues both tasks
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while m.stats().workers_removed < 1 && tokio::time::Instant::now() < deadline {
        let _ = m.wait(Some(Duration::from_millis(200))).await;
    }
    worker.await.unwrap();

    let s = m.stats();
    assert_eq!(s.workers_removed, 1);
    assert_eq!(s.tasks_waiting, 2);
    assert_eq!(m.task_state(a), TaskState::Ready);
    assert_eq!(m.task_state(b), TaskState::Ready);

    // try counts survive the requeue
    let ta = m.cancel_by_id(a).await.unwrap();
    let tb = m.cancel_by_id(b).await.unwrap();
    assert_eq!(ta.try_count, 1);
    assert_eq!(tb.try_count, 1);
}

#[tokio::test]
async fn test_cancel_running_task_kills_it_on_the_worker() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let id = m.submit(Task::new("sleep 600")).unwrap();
    let port = m.port();

    let (dispatched_tx, mut dispatched_rx) = tokio::sync::oneshot::channel();
    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        let d = w.expect_dispatch().await;
        dispatched_tx.send(d.task_id).unwrap();
        w.expect_kill(d.task_id).await;
        w
    });

    // drive the loop until the task is on the worker
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let tid = loop {
        assert!(tokio::time::Instant::now() < deadline, "dispatch timed out");
        let _ = m.wait(Some(Duration::from_millis(100))).await;
        if let Ok(tid) = dispatched_rx.try_recv() {
            break tid;
        }
    };
    assert_eq!(tid, id);
    assert_eq!(m.task_state(id), TaskState::Running);

    let t = m.cancel_by_id(id).await.expect("cancel returns the task");
    assert_eq!(t.id, id);
    assert_eq!(m.task_state(id), TaskState::Canceled);
    assert_eq!(m.stats().tasks_cancelled, 1);

    // cancelling again is a no-op
    assert!(m.cancel_by_id(id).await.is_none());

    drive(&mut m, 200).await;
    worker.await.unwrap();
}
