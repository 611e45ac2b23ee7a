//! Shared test support: a scripted worker speaking the wire protocol
//! over real TCP against a manager under test.
#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read/write deadline for every scripted step.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// One task description as received by the worker.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// `put` uploads that preceded the description: (cache name, bytes).
    pub puts: Vec<(String, Vec<u8>)>,
    pub task_id: u64,
    pub command: String,
    /// All other description lines (category, cores, infile, ...).
    pub lines: Vec<String>,
}

impl Dispatch {
    /// The value of a single-token description line such as `cores 4`.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|l| l.strip_prefix(&format!("{} ", key)))
    }
}

/// A scripted worker: connects, speaks the protocol, and asserts on what
/// the manager sends.
pub struct MockWorker {
    stream: TcpStream,
    buf: Vec<u8>,
    pub hostname: String,
}

impl MockWorker {
    pub async fn connect(port: u16, hostname: &str) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to manager");
        MockWorker {
            stream,
            buf: Vec::new(),
            hostname: hostname.to_string(),
        }
    }

    pub async fn send(&mut self, text: &str) {
        tokio::time::timeout(STEP_TIMEOUT, self.stream.write_all(text.as_bytes()))
            .await
            .expect("send timeout")
            .expect("send");
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        tokio::time::timeout(STEP_TIMEOUT, self.stream.write_all(bytes))
            .await
            .expect("send timeout")
            .expect("send");
    }

    pub async fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                return String::from_utf8(line).expect("utf8 line");
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(STEP_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("read timeout")
                .expect("read");
            assert!(n > 0, "manager closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            let mut chunk = [0u8; 4096];
            let got = tokio::time::timeout(STEP_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("read timeout")
                .expect("read");
            assert!(got > 0, "manager closed the connection");
            self.buf.extend_from_slice(&chunk[..got]);
        }
        self.buf.drain(..n).collect()
    }

    /// Read one line and assert its prefix.
    pub async fn expect_prefix(&mut self, prefix: &str) -> String {
        let line = self.read_line().await;
        assert!(
            line.starts_with(prefix),
            "expected line starting with '{}', got '{}'",
            prefix,
            line
        );
        line
    }

    /// Complete the protocol hello.
    pub async fn hello(&mut self) {
        let line = format!(
            "taskswarm 11 {} linux x86_64 {}\n",
            self.hostname,
            env!("CARGO_PKG_VERSION")
        );
        self.send(&line).await;
    }

    /// Report resources and finish with the tag, making this worker
    /// eligible for dispatch.
    pub async fn advertise(&mut self, cores: i64, memory_mb: i64, disk_mb: i64) {
        let report = format!(
            "resource workers 1 1 1\n\
             resource cores {c} {c} {c}\n\
             resource memory {m} {m} {m}\n\
             resource disk {d} {d} {d}\n\
             resource gpus 0 0 0\n\
             resource tag 1\n",
            c = cores,
            m = memory_mb,
            d = disk_mb
        );
        self.send(&report).await;
    }

    /// Shorthand: connect, hello, advertise.
    pub async fn join(port: u16, hostname: &str, cores: i64, memory_mb: i64, disk_mb: i64) -> Self {
        let mut w = MockWorker::connect(port, hostname).await;
        w.hello().await;
        w.advertise(cores, memory_mb, disk_mb).await;
        w
    }

    /// Receive one task dispatch: any `put` uploads, then the
    /// description through its `end` marker.
    pub async fn expect_dispatch(&mut self) -> Dispatch {
        let mut d = Dispatch::default();

        // uploads precede the task description
        let task_line = loop {
            let line = self.read_line().await;
            if let Some(rest) = line.strip_prefix("put ") {
                let mut it = rest.split_whitespace();
                let name = it.next().expect("put name").to_string();
                let size: usize = it.next().expect("put size").parse().expect("put size");
                let bytes = self.read_exact(size).await;
                d.puts.push((name, bytes));
            } else if line.starts_with("task ") {
                break line;
            } else {
                panic!("unexpected line before task description: '{}'", line);
            }
        };
        d.task_id = task_line
            .strip_prefix("task ")
            .and_then(|s| s.parse().ok())
            .expect("task id");

        loop {
            let line = self.read_line().await;
            if line == "end" {
                break;
            }
            if let Some(n) = line.strip_prefix("cmd ") {
                let n: usize = n.parse().expect("cmd length");
                d.command = String::from_utf8(self.read_exact(n).await).expect("cmd utf8");
            } else if let Some(n) = line.strip_prefix("coprocess ") {
                let n: usize = n.parse().expect("coprocess length");
                self.read_exact(n).await;
            } else if let Some(n) = line.strip_prefix("env ") {
                let n: usize = n.parse().expect("env length");
                self.read_exact(n).await;
                self.read_line().await; // trailing newline after the payload
            } else {
                d.lines.push(line);
            }
        }
        d
    }

    /// Announce and deliver one result record, draining the
    /// `send_results` handshake.
    pub async fn send_result(&mut self, status: i64, exit: i64, stdout: &[u8], exec_usec: u64, task_id: u64) {
        self.send("available_results\n").await;
        self.expect_prefix("send_results").await;
        let header = format!(
            "result {} {} {} {} {}\n",
            status,
            exit,
            stdout.len(),
            exec_usec,
            task_id
        );
        self.send(&header).await;
        self.send_bytes(stdout).await;
        self.send("end\n").await;
    }

    /// Serve one `get` request with a single file frame.
    pub async fn serve_get_file(&mut self, remote_name: &str, content: &[u8]) {
        self.expect_prefix("get ").await;
        let frame = format!("file {} {} 0644\n", remote_name, content.len());
        self.send(&frame).await;
        self.send_bytes(content).await;
    }

    /// Serve one `get` request with a `missing` frame.
    pub async fn serve_get_missing(&mut self, remote_name: &str, errno: i64) {
        self.expect_prefix("get ").await;
        self.send(&format!("missing {} {}\n", remote_name, errno)).await;
    }

    /// Consume the `kill` sent after output retrieval.
    pub async fn expect_kill(&mut self, task_id: u64) {
        let line = self.expect_prefix("kill ").await;
        assert_eq!(line, format!("kill {}", task_id));
    }

    /// Consume one `unlink` for an uncacheable object.
    pub async fn expect_unlink(&mut self) -> String {
        self.expect_prefix("unlink ").await
    }
}
