//! Persisted logs: the space-separated stats log and the transaction log.
//!
//! Both are append-only, line-buffered, and written only from the event
//! loop. The stats log starts with a `#` header naming every column in
//! order; the transaction log records manager, worker, category, task,
//! and transfer events with a timestamp and pid prefix.
use crate::core::stats::ManagerStats;
use crate::error::SwarmResult;
use std::io::Write;
use std::path::Path;

const STATS_COLUMNS: &[&str] = &[
    "timestamp",
    "workers_connected",
    "workers_init",
    "workers_idle",
    "workers_busy",
    "workers_able",
    "workers_joined",
    "workers_removed",
    "workers_released",
    "workers_idled_out",
    "workers_blocked",
    "workers_fast_aborted",
    "workers_lost",
    "tasks_waiting",
    "tasks_on_workers",
    "tasks_running",
    "tasks_with_results",
    "tasks_submitted",
    "tasks_dispatched",
    "tasks_done",
    "tasks_failed",
    "tasks_cancelled",
    "tasks_exhausted_attempts",
    "time_send",
    "time_receive",
    "time_send_good",
    "time_receive_good",
    "time_status_msgs",
    "time_internal",
    "time_polling",
    "time_application",
    "time_workers_execute",
    "time_workers_execute_good",
    "time_workers_execute_exhaustion",
    "bytes_sent",
    "bytes_received",
    "bandwidth",
    "capacity_tasks",
    "capacity_cores",
    "capacity_memory",
    "capacity_disk",
    "capacity_instantaneous",
    "capacity_weighted",
    "manager_load",
    "total_cores",
    "total_memory",
    "total_disk",
    "committed_cores",
    "committed_memory",
    "committed_disk",
    "max_cores",
    "max_memory",
    "max_disk",
    "min_cores",
    "min_memory",
    "min_disk",
];

/// The line-oriented performance log, one snapshot per line.
pub struct StatsLog {
    file: std::fs::File,
}

impl StatsLog {
    pub fn create<P: AsRef<Path>>(path: P) -> SwarmResult<Self> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "# {}", STATS_COLUMNS.join(" "))?;
        file.flush()?;
        Ok(StatsLog { file })
    }

    pub fn append(&mut self, now_usec: u64, s: &ManagerStats) -> SwarmResult<()> {
        let line = format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {:.6} {} {} {} {} {} {} {:.6} {} {} {} {} {} {} {} {} {} {} {} {}",
            now_usec,
            s.workers_connected,
            s.workers_init,
            s.workers_idle,
            s.workers_busy,
            s.workers_able,
            s.workers_joined,
            s.workers_removed,
            s.workers_released,
            s.workers_idled_out,
            s.workers_blocked,
            s.workers_fast_aborted,
            s.workers_lost,
            s.tasks_waiting,
            s.tasks_on_workers,
            s.tasks_running,
            s.tasks_with_results,
            s.tasks_submitted,
            s.tasks_dispatched,
            s.tasks_done,
            s.tasks_failed,
            s.tasks_cancelled,
            s.tasks_exhausted_attempts,
            s.time_send,
            s.time_receive,
            s.time_send_good,
            s.time_receive_good,
            s.time_status_msgs,
            s.time_internal,
            s.time_polling,
            s.time_application,
            s.time_workers_execute,
            s.time_workers_execute_good,
            s.time_workers_execute_exhaustion,
            s.bytes_sent,
            s.bytes_received,
            s.bandwidth,
            s.capacity_tasks,
            s.capacity_cores,
            s.capacity_memory,
            s.capacity_disk,
            s.capacity_instantaneous,
            s.capacity_weighted,
            s.manager_load,
            s.total_cores,
            s.total_memory,
            s.total_disk,
            s.committed_cores,
            s.committed_memory,
            s.committed_disk,
            s.max_cores,
            s.max_memory,
            s.max_disk,
            s.min_cores,
            s.min_memory,
            s.min_disk,
        );
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// The transaction log: one record per state transition.
pub struct TransactionLog {
    file: std::fs::File,
    pid: u32,
}

impl TransactionLog {
    pub fn create<P: AsRef<Path>>(path: P, now_usec: u64) -> SwarmResult<Self> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        for line in [
            "# time manager_pid MANAGER START|END",
            "# time manager_pid WORKER worker_id host:port CONNECTION",
            "# time manager_pid WORKER worker_id host:port DISCONNECTION (UNKNOWN|IDLE_OUT|FAST_ABORT|FAILURE|STATUS_WORKER|EXPLICIT)",
            "# time manager_pid WORKER worker_id RESOURCES {resources}",
            "# time manager_pid CATEGORY name MAX {resources_max_per_task}",
            "# time manager_pid CATEGORY name MIN {resources_min_per_task_per_worker}",
            "# time manager_pid CATEGORY name FIRST (FIXED|MAX|MIN_WASTE|MAX_THROUGHPUT) {resources_requested}",
            "# time manager_pid TASK taskid WAITING category_name (FIRST_RESOURCES|MAX_RESOURCES) {resources_requested}",
            "# time manager_pid TASK taskid RUNNING worker_address (FIRST_RESOURCES|MAX_RESOURCES) {resources_allocated}",
            "# time manager_pid TASK taskid WAITING_RETRIEVAL worker_address",
            "# time manager_pid TASK taskid (RETRIEVED|DONE) (SUCCESS|SIGNAL|END_TIME|FORSAKEN|MAX_RETRIES|MAX_WALL_TIME|UNKNOWN|RESOURCE_EXHAUSTION) exit_code {limits_exceeded} {resources_measured}",
            "# time manager_pid TRANSFER (INPUT|OUTPUT) taskid cache_flag sizeinmb walltime filename",
            "",
        ] {
            writeln!(file, "{}", line)?;
        }
        let mut log = TransactionLog {
            file,
            pid: std::process::id(),
        };
        log.write(now_usec, "MANAGER START")?;
        Ok(log)
    }

    /// Append one record with the timestamp and pid prefix.
    pub fn write(&mut self, now_usec: u64, record: &str) -> SwarmResult<()> {
        writeln!(self.file, "{} {} {}", now_usec, self.pid, record)?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_log_header_matches_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.log");
        let mut log = StatsLog::create(&path).unwrap();
        log.append(123456, &ManagerStats::default()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("# timestamp workers_connected"));
        let data = lines.next().unwrap();
        // one value per named column
        assert_eq!(
            data.split_whitespace().count(),
            header.split_whitespace().count() - 1
        );
        assert!(data.starts_with("123456 "));
    }

    #[test]
    fn test_transaction_log_records_start_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let mut log = TransactionLog::create(&path, 1000).unwrap();
        log.write(2000, "TASK 1 WAITING default FIRST_RESOURCES {}")
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("MANAGER START"));
        let task_line = text
            .lines()
            .find(|l| l.contains("TASK 1 WAITING"))
            .unwrap();
        assert!(task_line.starts_with("2000 "));
    }
}
