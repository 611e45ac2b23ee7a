//! Connected-worker records: declared resources, committed task boxes,
//! the per-worker file cache index, and transfer history.
use crate::core::resources::{ResourceSummary, Resources};
use crate::net::connection::Connection;
use std::collections::{HashMap, HashSet};

/// What kind of peer is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Connected but has not completed the protocol hello yet.
    Unknown,
    /// A live task-executing worker.
    Worker,
    /// A status client (wq_status, browser); disconnected after replying.
    Status,
}

/// One entry in a worker's file cache index.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// `file`, `piece`, `buffer`, `url`, or `cmd`.
    pub kind: &'static str,
    pub size: i64,
    /// mtime of the manager-side source when staged, epoch seconds.
    pub mtime: i64,
    /// Time the worker spent materializing the object, microseconds.
    pub transfer_time: u64,
}

/// Counters a worker reports about itself through `info` messages, plus
/// the slots the manager accumulates when the worker leaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerReportedStats {
    pub workers_joined: i64,
    pub workers_removed: i64,
    pub tasks_waiting: i64,
    pub tasks_running: i64,
    pub time_send: u64,
    pub time_receive: u64,
    pub time_workers_execute: u64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
}

/// A connected worker and everything the manager knows about it.
pub struct Worker {
    pub id: u64,
    pub conn: Connection,
    pub addrport: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub kind: WorkerKind,
    /// Stable id the worker reports about itself (`info worker-id`).
    pub worker_uuid: Option<String>,
    pub factory_name: Option<String>,
    /// Transfer server address the worker advertises for peer fetches.
    pub transfer_addr: Option<(String, u16)>,

    pub draining: bool,
    /// Set when this worker triggered fast-abort; a second trigger in a
    /// row blocks the host.
    pub fast_abort_alarm: bool,

    pub resources: Resources,
    pub features: HashSet<String>,
    /// cache name -> entry, for every object believed present on the worker.
    pub cache: HashMap<String, CacheEntry>,

    pub current_tasks: HashSet<u64>,
    /// Exact resources committed per running task.
    pub task_boxes: HashMap<u64, ResourceSummary>,

    pub finished_tasks: i64,
    pub total_tasks_complete: i64,
    /// Execution time of completed tasks, microseconds.
    pub total_task_time: u64,
    pub total_bytes_transferred: i64,
    /// Transfer wall time, microseconds; used for bandwidth estimation.
    pub total_transfer_time: u64,

    /// Connection time, microseconds since the epoch.
    pub start_time: u64,
    /// Wall-clock deadline the worker declared, epoch seconds. -1 unknown.
    pub end_time: i64,
    pub last_msg_recv_time: u64,
    pub last_update_msg_time: u64,

    pub stats: WorkerReportedStats,
}

impl Worker {
    pub fn new(id: u64, conn: Connection, now_usec: u64) -> Self {
        let addrport = conn.peer_addrport();
        Worker {
            id,
            conn,
            addrport,
            hostname: "unknown".to_string(),
            os: "unknown".to_string(),
            arch: "unknown".to_string(),
            version: "unknown".to_string(),
            kind: WorkerKind::Unknown,
            worker_uuid: None,
            factory_name: None,
            transfer_addr: None,
            draining: false,
            fast_abort_alarm: false,
            resources: Resources::new(),
            features: HashSet::new(),
            cache: HashMap::new(),
            current_tasks: HashSet::new(),
            task_boxes: HashMap::new(),
            finished_tasks: 0,
            total_tasks_complete: 0,
            total_task_time: 0,
            total_bytes_transferred: 0,
            total_transfer_time: 0,
            start_time: now_usec,
            end_time: -1,
            last_msg_recv_time: now_usec,
            last_update_msg_time: now_usec,
            stats: WorkerReportedStats::default(),
        }
    }

    /// True once the worker has said hello and reported its resources.
    pub fn is_ready(&self) -> bool {
        self.kind == WorkerKind::Worker && self.resources.tag >= 0
    }

    /// Recompute committed resources from the task boxes.
    ///
    /// Keeps the invariant that `resources.*.inuse` equals the sum of the
    /// per-task boxes on this worker.
    pub fn count_committed_resources(&mut self) {
        let mut cores = 0;
        let mut memory = 0;
        let mut disk = 0;
        let mut gpus = 0;
        for b in self.task_boxes.values() {
            cores += b.cores.unwrap_or(0);
            memory += b.memory.unwrap_or(0);
            disk += b.disk.unwrap_or(0);
            gpus += b.gpus.unwrap_or(0);
        }
        self.resources.cores.inuse = cores;
        self.resources.memory.inuse = memory;
        self.resources.disk.inuse = disk;
        self.resources.gpus.inuse = gpus;
    }

    /// Total bytes of this task's cached inputs already on the worker.
    pub fn cached_input_bytes(&self, inputs: &[crate::core::file::TaskFile]) -> i64 {
        inputs
            .iter()
            .filter(|f| f.flags.cache && f.is_manager_staged())
            .filter_map(|f| self.cache.get(&f.cache_name))
            .map(|e| e.size)
            .sum()
    }

    /// Observed transfer rate in bytes/sec, when at least one second of
    /// transfer history exists.
    pub fn observed_transfer_rate(&self) -> Option<f64> {
        if self.total_transfer_time > 1_000_000 {
            Some(1_000_000.0 * self.total_bytes_transferred as f64 / self.total_transfer_time as f64)
        } else {
            None
        }
    }

    /// Mean completion time (execute + transfer) per finished task, in
    /// microseconds. Used by the TIME scheduling policy.
    pub fn mean_task_time(&self) -> Option<f64> {
        if self.total_tasks_complete > 0 {
            Some(
                (self.total_task_time + self.total_transfer_time) as f64
                    / self.total_tasks_complete as f64,
            )
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file::{FileFlags, TaskFile};

    async fn test_worker() -> Worker {
        let (conn, _client) = crate::net::connection::test_pair().await;
        Worker::new(1, conn, 0)
    }

    #[tokio::test]
    async fn test_count_committed_resources_sums_boxes() {
        let mut w = test_worker().await;
        w.task_boxes.insert(
            1,
            ResourceSummary {
                cores: Some(2),
                memory: Some(512),
                disk: Some(100),
                ..Default::default()
            },
        );
        w.task_boxes.insert(
            2,
            ResourceSummary {
                cores: Some(1),
                memory: Some(256),
                ..Default::default()
            },
        );
        w.count_committed_resources();
        assert_eq!(w.resources.cores.inuse, 3);
        assert_eq!(w.resources.memory.inuse, 768);
        assert_eq!(w.resources.disk.inuse, 100);
        assert_eq!(w.resources.gpus.inuse, 0);
    }

    #[tokio::test]
    async fn test_cached_input_bytes_counts_only_cached_present_files() {
        let mut w = test_worker().await;
        let cached = TaskFile::local(
            "/data/a",
            "a",
            FileFlags {
                cache: true,
                ..Default::default()
            },
        );
        let uncached = TaskFile::local("/data/b", "b", FileFlags::default());
        w.cache.insert(
            cached.cache_name.clone(),
            CacheEntry {
                kind: "file",
                size: 1000,
                mtime: 0,
                transfer_time: 0,
            },
        );
        let inputs = vec![cached, uncached];
        assert_eq!(w.cached_input_bytes(&inputs), 1000);
    }

    #[tokio::test]
    async fn test_transfer_rate_needs_history() {
        let mut w = test_worker().await;
        assert!(w.observed_transfer_rate().is_none());
        w.total_bytes_transferred = 10_000_000;
        w.total_transfer_time = 2_000_000;
        let rate = w.observed_transfer_rate().unwrap();
        assert!((rate - 5_000_000.0).abs() < 1.0);
    }
}
