//! Manager-wide statistics counters.
//!
//! Cumulative counters accumulate over the lifetime of the manager;
//! instantaneous fields are filled in when a snapshot is taken. Stats of
//! disconnected workers are accumulated separately and merged into
//! reported totals.
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ManagerStats {
    // instantaneous worker counts
    pub workers_connected: i64,
    pub workers_init: i64,
    pub workers_idle: i64,
    pub workers_busy: i64,
    /// Workers able to run the largest waiting task.
    pub workers_able: i64,

    // cumulative worker counters
    pub workers_joined: i64,
    pub workers_removed: i64,
    pub workers_released: i64,
    pub workers_idled_out: i64,
    pub workers_blocked: i64,
    pub workers_fast_aborted: i64,
    pub workers_lost: i64,

    // instantaneous task counts
    pub tasks_waiting: i64,
    pub tasks_on_workers: i64,
    pub tasks_running: i64,
    pub tasks_with_results: i64,

    // cumulative task counters
    pub tasks_submitted: i64,
    pub tasks_dispatched: i64,
    pub tasks_done: i64,
    pub tasks_failed: i64,
    pub tasks_cancelled: i64,
    pub tasks_exhausted_attempts: i64,

    // manager time accounting, microseconds
    pub time_when_started: u64,
    pub time_send: u64,
    pub time_receive: u64,
    pub time_send_good: u64,
    pub time_receive_good: u64,
    pub time_status_msgs: u64,
    pub time_internal: u64,
    pub time_polling: u64,
    pub time_application: u64,

    // worker time accounting, microseconds
    pub time_workers_execute: u64,
    pub time_workers_execute_good: u64,
    pub time_workers_execute_exhaustion: u64,

    // transfer volume
    pub bytes_sent: i64,
    pub bytes_received: i64,
    /// Effective manager bandwidth, MB/s.
    pub bandwidth: f64,

    // capacity estimates from recent task reports
    pub capacity_tasks: i64,
    pub capacity_cores: i64,
    pub capacity_memory: i64,
    pub capacity_disk: i64,
    pub capacity_instantaneous: i64,
    pub capacity_weighted: i64,
    pub manager_load: f64,

    // aggregate worker resources
    pub total_cores: i64,
    pub total_memory: i64,
    pub total_disk: i64,
    pub committed_cores: i64,
    pub committed_memory: i64,
    pub committed_disk: i64,
    pub max_cores: i64,
    pub max_memory: i64,
    pub max_disk: i64,
    pub min_cores: i64,
    pub min_memory: i64,
    pub min_disk: i64,
}

impl ManagerStats {
    /// Fold the counters of a departed worker into this accumulator.
    pub fn absorb_worker(&mut self, w: &crate::core::worker::WorkerReportedStats) {
        self.workers_joined += w.workers_joined;
        self.workers_removed += w.workers_removed;
        self.time_send += w.time_send;
        self.time_receive += w.time_receive;
        self.time_workers_execute += w.time_workers_execute;
        self.bytes_sent += w.bytes_sent;
        self.bytes_received += w.bytes_received;
    }

    /// Observed manager transfer rate in bytes/sec, when at least one
    /// second of transfer history exists.
    pub fn observed_transfer_rate(&self) -> Option<f64> {
        let bytes = self.bytes_sent + self.bytes_received;
        let time = self.time_send + self.time_receive;
        if time > 1_000_000 {
            Some(1_000_000.0 * bytes as f64 / time as f64)
        } else {
            None
        }
    }
}

/// Report of one completed task, kept for capacity estimation.
#[derive(Debug, Clone, Copy)]
pub struct TaskReport {
    /// Transfer time (commit plus retrieval), microseconds.
    pub time_transfer: u64,
    /// Execution time of the last attempt, microseconds.
    pub time_execute: u64,
    pub cores: i64,
    pub memory: i64,
    pub disk: i64,
}

/// Estimate how many concurrent tasks the manager could sustain given the
/// observed ratio of execution time to manager-side transfer time.
pub fn compute_capacity(reports: &[TaskReport], stats: &mut ManagerStats) {
    let mut total_transfer: u64 = 0;
    let mut total_execute: u64 = 0;
    let mut total_cores: i64 = 0;
    let mut total_memory: i64 = 0;
    let mut total_disk: i64 = 0;

    for r in reports {
        total_transfer += r.time_transfer;
        total_execute += r.time_execute;
        total_cores += r.cores;
        total_memory += r.memory;
        total_disk += r.disk;
    }

    if reports.is_empty() || total_transfer == 0 {
        return;
    }

    let n = reports.len() as i64;
    let capacity = (total_execute / total_transfer) as i64;
    stats.capacity_tasks = capacity;
    stats.capacity_cores = capacity * total_cores / n;
    stats.capacity_memory = capacity * total_memory / n;
    stats.capacity_disk = capacity * total_disk / n;
    stats.capacity_instantaneous = capacity;
    stats.capacity_weighted = capacity;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_from_reports() {
        let reports = vec![
            TaskReport {
                time_transfer: 1_000_000,
                time_execute: 10_000_000,
                cores: 2,
                memory: 1024,
                disk: 100,
            };
            4
        ];
        let mut s = ManagerStats::default();
        compute_capacity(&reports, &mut s);
        assert_eq!(s.capacity_tasks, 10);
        assert_eq!(s.capacity_cores, 20);
        assert_eq!(s.capacity_memory, 10240);
    }

    #[test]
    fn test_capacity_without_history_is_untouched() {
        let mut s = ManagerStats::default();
        compute_capacity(&[], &mut s);
        assert_eq!(s.capacity_tasks, 0);
    }

    #[test]
    fn test_observed_rate_requires_history() {
        let mut s = ManagerStats::default();
        assert!(s.observed_transfer_rate().is_none());
        s.bytes_sent = 5_000_000;
        s.time_send = 1_000_000;
        s.time_receive = 1_000_000;
        let rate = s.observed_transfer_rate().unwrap();
        assert!((rate - 2_500_000.0).abs() < 1.0);
    }
}
