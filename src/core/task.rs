//! Task records, lifecycle states, and result codes.
//!
//! A [`Task`] is built by the embedding application, submitted to a
//! [`crate::Manager`], and handed back once it reaches a terminal state.
//! The manager tracks the authoritative state in its own maps; the fields
//! here record the definition, timing, and outcome of the task itself.
use crate::core::file::{FileFlags, TaskFile};
use crate::core::resources::ResourceSummary;
use serde::Serialize;

/// Lifecycle state of a task inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Not yet known to the manager.
    Unknown,
    /// Queued, waiting for a fitting worker.
    Ready,
    /// Committed to a worker and executing.
    Running,
    /// The worker reported a result; outputs not yet fetched.
    WaitingRetrieval,
    /// Outputs fetched; waiting to be returned through `wait`.
    Retrieved,
    /// Returned to the application.
    Done,
    /// Removed by an application cancel request.
    Canceled,
}

impl TaskState {
    /// Log and wire spelling of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Unknown => "UNKNOWN",
            TaskState::Ready => "WAITING",
            TaskState::Running => "RUNNING",
            TaskState::WaitingRetrieval => "WAITING_RETRIEVAL",
            TaskState::Retrieved => "RETRIEVED",
            TaskState::Done => "DONE",
            TaskState::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Canceled | TaskState::Unknown
        )
    }
}

/// Outcome of a task attempt as reported to the application.
///
/// The low three bits are the legacy missing-input/output/stdout codes;
/// every other condition uses the upper bits and takes precedence over
/// them (see [`Task::update_result`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i64)]
pub enum TaskResultCode {
    Success = 0,
    InputMissing = 1,
    OutputMissing = 2,
    StdoutMissing = 4,
    Signal = 1 << 3,
    ResourceExhaustion = 2 << 3,
    TaskTimeout = 3 << 3,
    Unknown = 4 << 3,
    Forsaken = 5 << 3,
    MaxRetries = 6 << 3,
    MaxWallTime = 7 << 3,
    DiskFull = 8 << 3,
    MonitorError = 9 << 3,
    OutputTransferError = 10 << 3,
}

impl TaskResultCode {
    pub fn from_code(code: i64) -> TaskResultCode {
        match code {
            0 => TaskResultCode::Success,
            1 => TaskResultCode::InputMissing,
            2 => TaskResultCode::OutputMissing,
            4 => TaskResultCode::StdoutMissing,
            8 => TaskResultCode::Signal,
            16 => TaskResultCode::ResourceExhaustion,
            24 => TaskResultCode::TaskTimeout,
            40 => TaskResultCode::Forsaken,
            48 => TaskResultCode::MaxRetries,
            56 => TaskResultCode::MaxWallTime,
            64 => TaskResultCode::DiskFull,
            72 => TaskResultCode::MonitorError,
            80 => TaskResultCode::OutputTransferError,
            _ => TaskResultCode::Unknown,
        }
    }

    /// Log spelling of the result.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskResultCode::Success => "SUCCESS",
            TaskResultCode::InputMissing => "INPUT_MISS",
            TaskResultCode::OutputMissing => "OUTPUT_MISS",
            TaskResultCode::StdoutMissing => "STDOUT_MISS",
            TaskResultCode::Signal => "SIGNAL",
            TaskResultCode::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            TaskResultCode::TaskTimeout => "END_TIME",
            TaskResultCode::Unknown => "UNKNOWN",
            TaskResultCode::Forsaken => "FORSAKEN",
            TaskResultCode::MaxRetries => "MAX_RETRIES",
            TaskResultCode::MaxWallTime => "MAX_WALL_TIME",
            TaskResultCode::DiskFull => "DISK_FULL",
            TaskResultCode::MonitorError => "MONITOR_ERROR",
            TaskResultCode::OutputTransferError => "OUTPUT_TRANSFER_ERROR",
        }
    }

}

/// Which category allocation the next attempt of a task should request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationLevel {
    /// The learned (or guessed) first allocation.
    First,
    /// The category's maximum allocation.
    Max,
    /// No further escalation is possible; the task is failed.
    Error,
}

impl AllocationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationLevel::First => "FIRST_RESOURCES",
            AllocationLevel::Max | AllocationLevel::Error => "MAX_RESOURCES",
        }
    }
}

/// A unit of work: one command with its files, environment, and resource
/// request.
///
/// Build with [`Task::new`] and the `with_*` methods, then hand to
/// [`crate::Manager::submit`]. After completion the same record comes back
/// through [`crate::Manager::wait`] with the result fields filled in.
#[derive(Debug, Clone)]
pub struct Task {
    /// Assigned at submit time; 0 beforehand.
    pub id: u64,
    pub tag: Option<String>,
    pub command: String,
    pub coprocess: Option<String>,
    pub category: String,
    pub inputs: Vec<TaskFile>,
    pub outputs: Vec<TaskFile>,
    pub env: Vec<(String, String)>,
    pub features: Vec<String>,
    pub priority: f64,
    /// 0 means unlimited retries.
    pub max_retries: u32,
    /// Minimum seconds of worker lifetime required to accept this task.
    pub min_running_time: i64,
    pub resources_requested: ResourceSummary,
    pub resources_allocated: ResourceSummary,
    pub resources_measured: Option<ResourceSummary>,
    /// Dimensions reported over their limit on the last exhausted attempt.
    pub limits_exceeded: Option<ResourceSummary>,

    pub resource_request: AllocationLevel,
    pub try_count: u32,
    pub exhausted_attempts: u32,
    pub fast_abort_count: u32,

    pub result: TaskResultCode,
    pub exit_code: i64,
    /// Captured stdout, possibly truncated (see result code).
    pub output: Option<Vec<u8>>,
    /// Hostname of the last worker that ran the task.
    pub hostname: Option<String>,
    /// addr:port of the last worker that ran the task.
    pub addrport: Option<String>,

    // Timestamps in microseconds since the epoch; 0 when not reached.
    pub time_when_submitted: u64,
    pub time_when_commit_start: u64,
    pub time_when_commit_end: u64,
    pub time_when_retrieval: u64,
    pub time_when_done: u64,
    /// Execution time of the last attempt, in microseconds.
    pub time_workers_execute_last: u64,
    /// Execution time summed over all attempts.
    pub time_workers_execute_all: u64,
    pub time_workers_execute_failure: u64,
    pub time_workers_execute_exhaustion: u64,

    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub bytes_transferred: i64,
}

impl Task {
    /// Create a task running the given shell command.
    pub fn new<S: Into<String>>(command: S) -> Self {
        Task {
            id: 0,
            tag: None,
            command: command.into(),
            coprocess: None,
            category: "default".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: Vec::new(),
            features: Vec::new(),
            priority: 0.0,
            max_retries: 0,
            min_running_time: 0,
            resources_requested: ResourceSummary::new(),
            resources_allocated: ResourceSummary::new(),
            resources_measured: None,
            limits_exceeded: None,
            resource_request: AllocationLevel::First,
            try_count: 0,
            exhausted_attempts: 0,
            fast_abort_count: 0,
            result: TaskResultCode::Unknown,
            exit_code: -1,
            output: None,
            hostname: None,
            addrport: None,
            time_when_submitted: 0,
            time_when_commit_start: 0,
            time_when_commit_end: 0,
            time_when_retrieval: 0,
            time_when_done: 0,
            time_workers_execute_last: 0,
            time_workers_execute_all: 0,
            time_workers_execute_failure: 0,
            time_workers_execute_exhaustion: 0,
            bytes_sent: 0,
            bytes_received: 0,
            bytes_transferred: 0,
        }
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_category<S: Into<String>>(mut self, category: S) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_coprocess<S: Into<String>>(mut self, name: S) -> Self {
        self.coprocess = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_cores(mut self, cores: i64) -> Self {
        self.resources_requested.cores = Some(cores);
        self
    }

    pub fn with_memory(mut self, megabytes: i64) -> Self {
        self.resources_requested.memory = Some(megabytes);
        self
    }

    pub fn with_disk(mut self, megabytes: i64) -> Self {
        self.resources_requested.disk = Some(megabytes);
        self
    }

    pub fn with_gpus(mut self, gpus: i64) -> Self {
        self.resources_requested.gpus = Some(gpus);
        self
    }

    pub fn with_wall_time(mut self, seconds: i64) -> Self {
        self.resources_requested.wall_time = Some(seconds);
        self
    }

    pub fn with_end_time(mut self, epoch_seconds: i64) -> Self {
        self.resources_requested.end = Some(epoch_seconds);
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_feature<S: Into<String>>(mut self, feature: S) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn with_input(mut self, file: TaskFile) -> Self {
        self.inputs.push(file);
        self
    }

    pub fn with_output(mut self, file: TaskFile) -> Self {
        self.outputs.push(file);
        self
    }

    /// Shorthand for a cached local input file staged under the same name.
    pub fn with_input_file<S: AsRef<str>>(self, path: S) -> Self {
        let name = path.as_ref().to_string();
        self.with_input(TaskFile::local(
            &name,
            &name,
            FileFlags {
                cache: true,
                ..Default::default()
            },
        ))
    }

    /// Shorthand for an uncached local output fetched back to the same name.
    pub fn with_output_file<S: AsRef<str>>(self, path: S) -> Self {
        let name = path.as_ref().to_string();
        self.with_output(TaskFile::local(&name, &name, FileFlags::default()))
    }

    /// Captured stdout decoded as UTF-8, lossily.
    pub fn stdout(&self) -> String {
        self.output
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// True when the last attempt succeeded with exit code zero.
    pub fn succeeded(&self) -> bool {
        self.result == TaskResultCode::Success && self.exit_code == 0
    }

    /// Merge a new result code into the task.
    ///
    /// Upper-bit results clobber the legacy missing-file codes; a missing
    /// input is never downgraded by a later missing output; the legacy
    /// codes never overwrite an upper-bit result already present.
    pub fn update_result(&mut self, new_result: TaskResultCode) {
        let upper_bits = |r: TaskResultCode| (r as i64) & !0x7 != 0;
        if upper_bits(new_result) {
            self.result = new_result;
        } else if self.result != TaskResultCode::Unknown && upper_bits(self.result) {
            // keep the more specific result already recorded
        } else if new_result == TaskResultCode::InputMissing {
            self.result = new_result;
        } else if new_result == TaskResultCode::OutputMissing {
            // a missing input is never downgraded to a missing output
            if self.result != TaskResultCode::InputMissing {
                self.result = new_result;
            }
        } else if self.result != TaskResultCode::InputMissing
            && self.result != TaskResultCode::OutputMissing
        {
            self.result = new_result;
        }
    }

    /// Clear per-attempt state before a retry, or everything accumulated
    /// across attempts when `full` (a fresh resubmission of a used task).
    pub fn clean(&mut self, full: bool) {
        self.time_when_commit_start = 0;
        self.time_when_commit_end = 0;
        self.time_when_retrieval = 0;
        self.time_workers_execute_last = 0;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.bytes_transferred = 0;
        self.output = None;
        self.hostname = None;
        self.addrport = None;

        if full {
            self.resource_request = AllocationLevel::First;
            self.try_count = 0;
            self.exhausted_attempts = 0;
            self.fast_abort_count = 0;
            self.time_when_submitted = 0;
            self.time_when_done = 0;
            self.time_workers_execute_all = 0;
            self.time_workers_execute_failure = 0;
            self.time_workers_execute_exhaustion = 0;
            self.resources_allocated = ResourceSummary::new();
            self.resources_measured = None;
            self.limits_exceeded = None;
        }

        // If the result is never updated again, the attempt counts as failed.
        self.result = TaskResultCode::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_round_trip() {
        for code in [0, 1, 2, 4, 8, 16, 24, 40, 48, 56, 64, 72, 80] {
            let r = TaskResultCode::from_code(code);
            assert_eq!(r as i64, code);
        }
        assert_eq!(TaskResultCode::from_code(999), TaskResultCode::Unknown);
    }

    #[test]
    fn test_update_result_upper_bits_clobber_legacy() {
        let mut t = Task::new("true");
        t.update_result(TaskResultCode::StdoutMissing);
        t.update_result(TaskResultCode::ResourceExhaustion);
        assert_eq!(t.result, TaskResultCode::ResourceExhaustion);

        // legacy codes do not overwrite an upper-bit result
        t.update_result(TaskResultCode::OutputMissing);
        assert_eq!(t.result, TaskResultCode::ResourceExhaustion);
    }

    #[test]
    fn test_update_result_missing_output_overrides_success() {
        let mut t = Task::new("true");
        t.result = TaskResultCode::Success;
        t.update_result(TaskResultCode::OutputMissing);
        assert_eq!(t.result, TaskResultCode::OutputMissing);
    }

    #[test]
    fn test_update_result_input_missing_not_downgraded() {
        let mut t = Task::new("true");
        t.update_result(TaskResultCode::InputMissing);
        t.update_result(TaskResultCode::StdoutMissing);
        assert_eq!(t.result, TaskResultCode::InputMissing);
    }

    #[test]
    fn test_clean_partial_keeps_try_count() {
        let mut t = Task::new("true");
        t.try_count = 3;
        t.time_when_commit_start = 42;
        t.output = Some(b"x".to_vec());
        t.clean(false);
        assert_eq!(t.try_count, 3);
        assert_eq!(t.time_when_commit_start, 0);
        assert!(t.output.is_none());
        assert_eq!(t.result, TaskResultCode::Unknown);
    }

    #[test]
    fn test_clean_full_resets_attempt_state() {
        let mut t = Task::new("true");
        t.try_count = 3;
        t.fast_abort_count = 1;
        t.resource_request = AllocationLevel::Max;
        t.clean(true);
        assert_eq!(t.try_count, 0);
        assert_eq!(t.fast_abort_count, 0);
        assert_eq!(t.resource_request, AllocationLevel::First);
    }

    #[test]
    fn test_builder_sets_request_fields() {
        let t = Task::new("echo hi")
            .with_cores(4)
            .with_memory(1024)
            .with_tag("stage1")
            .with_feature("singularity");
        assert_eq!(t.resources_requested.cores, Some(4));
        assert_eq!(t.resources_requested.memory, Some(1024));
        assert_eq!(t.tag.as_deref(), Some("stage1"));
        assert_eq!(t.features, vec!["singularity".to_string()]);
        assert_eq!(t.category, "default");
    }
}
