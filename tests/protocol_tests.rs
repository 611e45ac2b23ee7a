//! Wire-protocol behaviors: keepalive, status surfaces, watched-file
//! updates, forsaken results, and stale-result tolerance.
mod common;

use common::MockWorker;
use std::time::Duration;
use taskswarm::config::ManagerConfig;
use taskswarm::core::file::{FileFlags, TaskFile};
use taskswarm::{Manager, Task, TaskResultCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_config() -> ManagerConfig {
    let mut c = ManagerConfig::default();
    c.manager.port = 0;
    c
}

async fn drive(m: &mut Manager, millis: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
    while tokio::time::Instant::now() < deadline {
        let _ = m.wait(Some(Duration::from_millis(100))).await;
    }
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

#[tokio::test]
async fn test_keepalive_check_and_unresponsive_removal() {
    let mut config = test_config();
    config.timeouts.keepalive_interval = 1;
    config.timeouts.keepalive_timeout = 2;
    let mut m = Manager::bind(config).await.unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        // answer the first keepalive check
        w.expect_prefix("check").await;
        w.send("alive\n").await;
        // ignore the second one and linger until removed
        w.expect_prefix("check").await;
        tokio::time::sleep(Duration::from_secs(8)).await;
        w
    });

    // worker joins and survives the first check
    drive(&mut m, 2500).await;
    assert_eq!(m.stats().workers_connected, 1);
    assert_eq!(m.stats().workers_lost, 0);

    // after ignoring a check past the timeout, the worker is removed
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while m.stats().workers_lost < 1 && tokio::time::Instant::now() < deadline {
        let _ = m.wait(Some(Duration::from_millis(200))).await;
    }
    let s = m.stats();
    assert_eq!(s.workers_lost, 1);
    assert_eq!(s.workers_connected, 0);

    worker.abort();
}

#[tokio::test]
async fn test_http_get_serves_queue_status() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    m.submit(Task::new("pending")).unwrap();
    let port = m.port();

    let client = tokio::spawn(async move {
        let mut s = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        s.write_all(b"GET /queue_status HTTP/1.1\r\nHost: test\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        s.read_to_string(&mut body).await.unwrap();
        body
    });

    drive(&mut m, 1000).await;
    let body = client.await.unwrap();
    assert!(body.starts_with("HTTP/1.1 200 OK\n"));
    assert!(body.contains("Connection: close"));
    assert!(body.contains("\"tasks_waiting\":1"));

    // the status client is not a lost worker
    assert_eq!(m.stats().workers_lost, 0);
    assert_eq!(m.stats().workers_connected, 0);
}

#[tokio::test]
async fn test_plain_status_request_returns_json() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    let client = tokio::spawn(async move {
        let mut s = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        s.write_all(b"queue_status\n").await.unwrap();
        let mut body = String::new();
        s.read_to_string(&mut body).await.unwrap();
        body
    });

    drive(&mut m, 1000).await;
    let body = client.await.unwrap();
    let doc: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
    assert_eq!(doc[0]["type"], "wq_master");
}

#[tokio::test]
async fn test_watched_file_update_streams_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("progress.log");

    let mut m = Manager::bind(test_config()).await.unwrap();
    let task = Task::new("long-run").with_output(TaskFile::local(
        &out_path,
        "progress.log",
        FileFlags {
            watch: true,
            ..Default::default()
        },
    ));
    let id = m.submit(task).unwrap();
    let port = m.port();

    let (updated_tx, mut updated_rx) = tokio::sync::oneshot::channel();
    let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        let d = w.expect_dispatch().await;
        assert!(d.lines.iter().any(|l| l.contains("progress.log")));

        // stream a tail update while the task is still running
        w.send("available_results\n").await;
        w.expect_prefix("send_results").await;
        w.send(&format!("update {} progress.log 0 5\n", id)).await;
        w.send_bytes(b"hello").await;
        w.send("end\n").await;
        updated_tx.send(()).unwrap();

        finish_rx.await.unwrap();
        w.send_result(0, 0, b"", 1000, id).await;
        w.serve_get_file("progress.log", b"hello world").await;
        w.expect_kill(id).await;
        w.expect_unlink().await;
        w
    });

    // drive until the update has been applied
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no update arrived");
        let _ = m.wait(Some(Duration::from_millis(100))).await;
        if updated_rx.try_recv().is_ok() {
            break;
        }
    }
    drive(&mut m, 300).await;
    assert_eq!(std::fs::read(&out_path).unwrap(), b"hello");

    finish_tx.send(()).unwrap();
    let done = wait_for_task(&mut m, 10).await.expect("task completes");
    assert_eq!(done.result, TaskResultCode::Success);
    assert_eq!(std::fs::read(&out_path).unwrap(), b"hello world");

    worker.await.unwrap();
}

#[tokio::test]
async fn test_forsaken_task_is_redispatched_without_blame() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let id = m.submit(Task::new("work")).unwrap();
    let port = m.port();

    const FORSAKEN: i64 = 40;
    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        let d1 = w.expect_dispatch().await;
        // the worker never ran it
        w.send("available_results\n").await;
        w.expect_prefix("send_results").await;
        w.send(&format!("result {} 0 0 0 {}\n", FORSAKEN, d1.task_id))
            .await;
        w.send("end\n").await;

        // the manager tries again, no questions asked
        let d2 = w.expect_dispatch().await;
        assert_eq!(d2.task_id, d1.task_id);
        w.send_result(0, 0, b"done\n", 1000, d2.task_id).await;
        w.expect_kill(d2.task_id).await;
        w
    });

    let done = wait_for_task(&mut m, 10).await.expect("task completes");
    assert_eq!(done.id, id);
    assert_eq!(done.result, TaskResultCode::Success);
    assert_eq!(done.try_count, 2);
    // forsaken attempts carry no failure result and no worker blame
    assert_eq!(m.stats().workers_lost, 0);

    worker.await.unwrap();
}

#[tokio::test]
async fn test_stale_result_for_unknown_task_is_drained() {
    let mut m = Manager::bind(test_config()).await.unwrap();
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = MockWorker::join(port, "node1", 4, 4096, 10000).await;
        // a result for a task this manager never assigned
        w.send("available_results\n").await;
        w.expect_prefix("send_results").await;
        w.send("result 0 0 5 1000 999\n").await;
        w.send_bytes(b"STALE").await;
        w.send("end\n").await;
        // the connection stays healthy afterwards
        w.send("alive\n").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        w
    });

    drive(&mut m, 1500).await;
    let s = m.stats();
    assert_eq!(s.workers_connected, 1);
    assert_eq!(s.workers_lost, 0);
    assert_eq!(s.tasks_with_results, 0);

    worker.abort();
}
