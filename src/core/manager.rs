//! The manager: accepts workers, dispatches tasks, stages files, and
//! returns completed tasks to the embedding application.
//!
//! One [`Manager`] owns all authoritative state: the task table with its
//! per-state collections, the worker table with each worker's connection,
//! the category engine, the blocklist, and the factory table. Everything
//! is mutated from a single event loop driven inside [`Manager::wait`],
//! so none of it needs locking. The only suspension points are the
//! readiness poll over the listening socket and worker connections,
//! deadline-bound bulk transfers, and the catalog client.
use crate::config::ManagerConfig;
use crate::core::blocklist::Blocklist;
use crate::core::category::{AllocationMode, Category};
use crate::core::factory::FactoryTable;
use crate::core::file::{FileKind, TaskFile};
use crate::core::logs::{StatsLog, TransactionLog};
use crate::core::resources::{ResourceSummary, Resources};
use crate::core::scheduler::{
    self, SchedulePolicy, SchedulerOpts, XorShift64, CORES_BIT, DISK_BIT, GPUS_BIT, MEMORY_BIT,
};
use crate::core::stats::{compute_capacity, ManagerStats, TaskReport};
use crate::core::task::{AllocationLevel, Task, TaskResultCode, TaskState};
use crate::core::worker::{CacheEntry, Worker, WorkerKind};
use crate::error::{SwarmError, SwarmResult};
use crate::net::catalog::CatalogClient;
use crate::net::connection::{Connection, TransferRate};
use crate::net::http;
use crate::net::message::{
    parse_result_header, parse_transfer_frame, parse_watch_update, parse_worker_line, url_encode,
    ResultHeader, TransferFrame, WatchUpdate, WorkerLine,
};
use crate::net::transfer::{self, OpOutcome};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

/// Largest stdout kept per task; anything beyond is drained and the task
/// gets a STDOUT_MISSING result.
pub const MAX_TASK_STDOUT_STORAGE: i64 = 1 << 30;

/// New connections accepted per poll round.
const MAX_NEW_WORKERS: usize = 10;

/// Interval between warnings about ready tasks too large for the pool.
const LARGE_TASK_CHECK_INTERVAL: u64 = 180_000_000;

/// Owner reported to the catalog and status tools.
static OWNER: Lazy<String> =
    Lazy::new(|| std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()));

/// Why a worker left the pool, for stats and the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unknown,
    IdleOut,
    FastAbort,
    Failure,
    StatusWorker,
    Explicit,
}

impl DisconnectReason {
    fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Unknown => "UNKNOWN",
            DisconnectReason::IdleOut => "IDLE_OUT",
            DisconnectReason::FastAbort => "FAST_ABORT",
            DisconnectReason::Failure => "FAILURE",
            DisconnectReason::StatusWorker => "STATUS_WORKER",
            DisconnectReason::Explicit => "EXPLICIT",
        }
    }
}

/// Classification of one received worker line after side effects ran.
enum RecvOutcome {
    Processed,
    Disconnect(DisconnectReason),
    NotProcessed(String),
    Failure,
}

fn now_usec() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

fn now_secs() -> u64 {
    now_usec() / 1_000_000
}

/// Send one control line to a worker, logging it.
async fn send_msg(w: &mut Worker, msg: &str, deadline: Instant) -> SwarmResult<()> {
    debug!("tx to {} ({}): {}", w.hostname, w.addrport, msg.trim_end());
    w.conn.send(msg, deadline).await
}

/// Substitute `$OS` and `$ARCH` in a local input path with what the
/// worker reported about itself.
fn expand_env_names(w: &Worker, path: &str) -> String {
    if !path.contains('$') {
        return path.to_string();
    }
    path.replace("$ARCH", &w.arch).replace("$OS", &w.os)
}

/// A persistent task-queue manager bound to one listening port.
///
/// Typical embedding:
///
/// ```no_run
/// # async fn example() -> taskswarm::Result<()> {
/// use taskswarm::{config::ManagerConfig, Manager, Task};
///
/// let mut config = ManagerConfig::default();
/// config.manager.port = 0; // ephemeral
/// let mut m = Manager::bind(config).await?;
/// m.submit(Task::new("echo hello"))?;
/// while !m.empty() {
///     if let Some(done) = m.wait(Some(std::time::Duration::from_secs(5))).await {
///         println!("task {} finished: {}", done.id, done.stdout());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Manager {
    config: ManagerConfig,
    listener: TcpListener,
    port: u16,
    name: Option<String>,
    password: Option<String>,
    tls: Option<tokio_rustls::TlsAcceptor>,
    policy: SchedulePolicy,
    instance_id: String,

    next_task_id: u64,
    next_worker_id: u64,

    tasks: HashMap<u64, Task>,
    task_state: HashMap<u64, TaskState>,
    ready_list: VecDeque<u64>,
    /// task id -> worker id currently running it.
    worker_task_map: HashMap<u64, u64>,

    workers: HashMap<u64, Worker>,
    workers_with_results: HashSet<u64>,

    categories: HashMap<String, Category>,
    blocklist: Blocklist,
    factories: FactoryTable,
    fetch_factory: bool,

    stats: ManagerStats,
    stats_disconnected: ManagerStats,
    task_reports: VecDeque<TaskReport>,
    max_task_resources_requested: ResourceSummary,

    catalog: Option<CatalogClient>,
    catalog_last_update: u64,

    stats_log: Option<StatsLog>,
    txn_log: Option<TransactionLog>,
    time_last_log_stats: u64,

    busy_waiting: bool,
    link_poll_end: u64,
    time_last_wait: u64,
    time_last_large_tasks_check: u64,
    wait_for_workers: usize,

    rng: XorShift64,
    pending_hook: Option<Box<dyn FnMut() -> bool + Send>>,
    password_warned: bool,
}

impl Manager {
    /// Bind the listening port and construct the manager.
    pub async fn bind(config: ManagerConfig) -> SwarmResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.manager.port)).await?;
        let port = listener.local_addr()?.port();

        let tls = match (&config.manager.ssl_key, &config.manager.ssl_cert) {
            (Some(key), Some(cert)) => Some(crate::net::connection::tls_acceptor(
                &key.to_string_lossy(),
                &cert.to_string_lossy(),
            )?),
            _ => None,
        };

        let password = config.read_password()?;
        let policy: SchedulePolicy = config
            .scheduler
            .policy
            .parse()
            .map_err(SwarmError::config)?;

        let now = now_usec();
        let stats_log = match &config.logs.stats_log {
            Some(path) => Some(StatsLog::create(path)?),
            None => None,
        };
        let txn_log = match &config.logs.transaction_log {
            Some(path) => Some(TransactionLog::create(path, now)?),
            None => None,
        };

        let mut stats = ManagerStats::default();
        stats.time_when_started = now;

        let mut categories = HashMap::new();
        let mut default_category = Category::new("default");
        default_category.fast_abort = config.fast_abort.multiplier;
        categories.insert("default".to_string(), default_category);

        let wait_for_workers = config.scheduler.wait_for_workers;

        info!("manager listening on port {}", port);

        Ok(Manager {
            name: config.manager.name.clone(),
            config,
            listener,
            port,
            password,
            tls,
            policy,
            instance_id: uuid::Uuid::new_v4().to_string(),
            next_task_id: 1,
            next_worker_id: 1,
            tasks: HashMap::new(),
            task_state: HashMap::new(),
            ready_list: VecDeque::new(),
            worker_task_map: HashMap::new(),
            workers: HashMap::new(),
            workers_with_results: HashSet::new(),
            categories,
            blocklist: Blocklist::new(),
            factories: FactoryTable::new(),
            fetch_factory: false,
            stats,
            stats_disconnected: ManagerStats::default(),
            task_reports: VecDeque::new(),
            max_task_resources_requested: ResourceSummary::new(),
            catalog: None,
            catalog_last_update: 0,
            stats_log,
            txn_log,
            time_last_log_stats: 0,
            busy_waiting: false,
            link_poll_end: 0,
            time_last_wait: 0,
            time_last_large_tasks_check: 0,
            wait_for_workers,
            rng: XorShift64(now | 1),
            pending_hook: None,
            password_warned: false,
        })
    }

    /// Port workers should connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Project name advertised to the catalog, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the project name; enables catalog advertisement.
    pub fn specify_name<S: Into<String>>(&mut self, name: S) {
        self.name = Some(name.into());
        self.catalog = None; // rebuilt on the next advertisement
    }

    /// Set the shared password workers must prove they know.
    pub fn specify_password<S: Into<String>>(&mut self, password: S) {
        self.password = Some(password.into());
    }

    /// Change the scheduling policy for subsequent dispatches.
    pub fn specify_policy(&mut self, policy: SchedulePolicy) {
        self.policy = policy;
    }

    /// Replace the catalog host list.
    pub fn specify_catalog_hosts(&mut self, hosts: &str) {
        self.config.manager.catalog_hosts = hosts.to_string();
        self.catalog = None;
    }

    /// Install the hook polled between events so the embedder can handle
    /// signals; returning true makes the active `wait` return early.
    pub fn set_pending_hook<F: FnMut() -> bool + Send + 'static>(&mut self, hook: F) {
        self.pending_hook = Some(Box::new(hook));
    }

    /// Activate fast abort for every category without an explicit
    /// multiplier. Negative disables, zero is invalid.
    pub fn activate_fast_abort(&mut self, multiplier: f64) -> SwarmResult<()> {
        self.activate_fast_abort_category("default", multiplier)
    }

    /// Activate fast abort for one category.
    pub fn activate_fast_abort_category(
        &mut self,
        category: &str,
        multiplier: f64,
    ) -> SwarmResult<()> {
        if multiplier == 0.0 {
            return Err(SwarmError::config("fast abort multiplier must be nonzero"));
        }
        self.category_mut(category).fast_abort = multiplier;
        Ok(())
    }

    /// Set the allocation mode of a category.
    pub fn specify_category_mode(&mut self, category: &str, mode: AllocationMode) {
        self.category_mut(category).mode = mode;
    }

    /// Declare the per-task ceiling for a category.
    pub fn specify_category_max_resources(&mut self, category: &str, r: ResourceSummary) {
        self.category_mut(category).max_allocation_user = r;
    }

    /// Declare the per-task floor for a category.
    pub fn specify_category_min_resources(&mut self, category: &str, r: ResourceSummary) {
        self.category_mut(category).min_allocation_user = r;
    }

    /// Seed the first-allocation guess used before enough samples exist.
    pub fn specify_category_first_allocation_guess(&mut self, category: &str, r: ResourceSummary) {
        self.category_mut(category).first_allocation_guess = r;
    }

    /// Mark every worker on a host as draining (or clear it). Draining
    /// workers receive no new tasks and are released once idle.
    pub fn specify_draining_by_hostname(&mut self, hostname: &str, drain: bool) -> usize {
        let mut n = 0;
        for w in self.workers.values_mut() {
            if w.hostname == hostname {
                w.draining = drain;
                n += 1;
            }
        }
        n
    }

    /// Block a host from receiving tasks for `timeout` seconds.
    pub fn block_host_with_timeout(&mut self, hostname: &str, timeout: u64) {
        self.stats.workers_blocked += 1;
        debug!("blocking host {} for {} seconds", hostname, timeout);
        self.blocklist.block(hostname, Some(timeout), now_secs());
    }

    /// Block a host indefinitely.
    pub fn block_host(&mut self, hostname: &str) {
        self.stats.workers_blocked += 1;
        debug!("blocking host {} indefinitely", hostname);
        self.blocklist.block(hostname, None, now_secs());
    }

    /// Release one host from the blocklist.
    pub fn unblock_host(&mut self, hostname: &str) {
        self.blocklist.unblock(hostname);
    }

    /// Release every blocked host, including indefinite blocks.
    pub fn unblock_all(&mut self) {
        self.blocklist.release_all();
    }

    /// Adjust one runtime tunable by name.
    pub fn tune(&mut self, name: &str, value: f64) -> SwarmResult<()> {
        match name {
            "resource-submit-multiplier" => {
                self.config.scheduler.resource_submit_multiplier = value.max(1.0)
            }
            "force-proportional-resources" => {
                self.config.scheduler.force_proportional_resources = value > 0.0
            }
            "keepalive-interval" => self.config.timeouts.keepalive_interval = value as u64,
            "keepalive-timeout" => self.config.timeouts.keepalive_timeout = value as u64,
            "short-timeout" => self.config.timeouts.short_timeout = (value as u64).max(1),
            "min-transfer-timeout" => {
                self.config.timeouts.minimum_transfer_timeout = value as u64
            }
            "transfer-outlier-factor" => {
                self.config.timeouts.transfer_outlier_factor = value.max(1.0)
            }
            "default-transfer-rate" => {
                self.config.timeouts.default_transfer_rate = value.max(1.0)
            }
            "fast-abort-multiplier" => self.activate_fast_abort(value)?,
            "hungry-minimum" => self.config.scheduler.hungry_minimum = value as i64,
            "wait-for-workers" => self.wait_for_workers = value as usize,
            "catalog-update-interval" => {
                self.config.manager.catalog_update_interval = (value as u64).max(1)
            }
            _ => return Err(SwarmError::config(format!("unknown tuning knob: {}", name))),
        }
        Ok(())
    }

    fn category_mut(&mut self, name: &str) -> &mut Category {
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| Category::new(name))
    }

    fn scheduler_opts(&self) -> SchedulerOpts {
        SchedulerOpts {
            policy: self.policy,
            submit_multiplier: self.config.scheduler.resource_submit_multiplier,
            force_proportional: self.config.scheduler.force_proportional_resources,
        }
    }

    fn short_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.config.timeouts.short_timeout)
    }

    fn long_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.config.timeouts.long_timeout)
    }

    /// Bandwidth context for transfers to or from one worker.
    fn transfer_rate(&self, w: &Worker) -> TransferRate {
        TransferRate {
            worker_rate: w.observed_transfer_rate(),
            queue_rate: self.stats.observed_transfer_rate(),
            default_rate: self.config.timeouts.default_transfer_rate,
            outlier_factor: self.config.timeouts.transfer_outlier_factor,
            minimum_timeout: Duration::from_secs(self.config.timeouts.minimum_transfer_timeout),
        }
    }

    // ------------------------------------------------------------------
    // submission and the application-facing queue API
    // ------------------------------------------------------------------

    /// Submit a task. Returns its id, unique across the manager's life.
    ///
    /// A task handle that already ran to completion may be submitted
    /// again; it gets a fresh id and zeroed timing. Resubmitting a task
    /// that is still in flight is an application error.
    pub fn submit(&mut self, mut t: Task) -> SwarmResult<u64> {
        if t.id > 0 {
            let state = self
                .task_state
                .get(&t.id)
                .copied()
                .unwrap_or(TaskState::Unknown);
            if !state.is_terminal() {
                return Err(SwarmError::invalid_task(format!(
                    "task {} was already submitted and is not in a final state",
                    t.id
                )));
            }
            t.clean(true);
        }
        if t.command.is_empty() {
            return Err(SwarmError::invalid_task("task has no command"));
        }

        t.id = self.next_task_id;
        self.next_task_id += 1;

        self.category_mut(&t.category);
        t.time_when_submitted = now_usec();
        self.stats.tasks_submitted += 1;
        self.max_task_resources_requested
            .merge_max(&t.resources_requested);

        let id = t.id;
        self.change_task_state(&mut t, TaskState::Ready);
        self.tasks.insert(id, t);
        Ok(id)
    }

    /// Wait up to `timeout` for a task to complete; `None` waits until
    /// one does. Runs the event loop while waiting.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Option<Task> {
        self.wait_internal(timeout, None).await
    }

    /// Like [`Manager::wait`], returning only tasks with the given tag.
    pub async fn wait_for_tag(&mut self, tag: &str, timeout: Option<Duration>) -> Option<Task> {
        self.wait_internal(timeout, Some(tag)).await
    }

    /// True when no task is ready, running, or waiting to be returned.
    pub fn empty(&self) -> bool {
        !self.task_state.values().any(|s| {
            matches!(
                s,
                TaskState::Ready
                    | TaskState::Running
                    | TaskState::WaitingRetrieval
                    | TaskState::Retrieved
            )
        })
    }

    /// True when the queue could use more submitted tasks to keep the
    /// connected workers busy.
    pub fn hungry(&self) -> bool {
        let queued = self
            .task_state
            .values()
            .filter(|s| matches!(s, TaskState::Ready | TaskState::Running))
            .count() as i64;
        let workers = self
            .workers
            .values()
            .filter(|w| w.kind == WorkerKind::Worker)
            .count() as i64;
        queued < self.config.scheduler.hungry_minimum.max(2 * workers)
    }

    /// State of a task by id.
    pub fn task_state(&self, task_id: u64) -> TaskState {
        self.task_state
            .get(&task_id)
            .copied()
            .unwrap_or(TaskState::Unknown)
    }

    /// Cancel a task by id. Returns the task when it was still live;
    /// a second cancel of the same id returns `None`.
    pub async fn cancel_by_id(&mut self, task_id: u64) -> Option<Task> {
        match self.task_state(task_id) {
            TaskState::Ready | TaskState::Retrieved => {
                let mut t = self.tasks.remove(&task_id)?;
                self.change_task_state(&mut t, TaskState::Canceled);
                self.stats.tasks_cancelled += 1;
                Some(t)
            }
            TaskState::Running | TaskState::WaitingRetrieval => {
                self.cancel_task_on_worker(task_id, TaskState::Canceled)
                    .await;
                let t = self.tasks.remove(&task_id)?;
                self.stats.tasks_cancelled += 1;
                Some(t)
            }
            _ => None,
        }
    }

    /// Cancel the first live task carrying the given tag.
    pub async fn cancel_by_tag(&mut self, tag: &str) -> Option<Task> {
        let id = self
            .tasks
            .iter()
            .filter(|(id, t)| {
                t.tag.as_deref() == Some(tag) && !self.task_state(**id).is_terminal()
            })
            .map(|(id, _)| *id)
            .min()?;
        self.cancel_by_id(id).await
    }

    /// Cancel every live task, returning the reaped records.
    pub async fn cancel_all(&mut self) -> Vec<Task> {
        let ids: Vec<u64> = self
            .task_state
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::new();
        for id in ids {
            if let Some(t) = self.cancel_by_id(id).await {
                out.push(t);
            }
        }
        out
    }

    /// Gracefully release up to `n` idle workers (all of them when 0).
    pub async fn shut_down_workers(&mut self, n: usize) -> usize {
        let mut ids: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, w)| w.current_tasks.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if n > 0 {
            ids.truncate(n);
        }
        let mut released = 0;
        for wid in ids {
            if self.shut_down_worker(wid).await {
                released += 1;
            }
        }
        released
    }

    /// Release every connected worker, requeuing anything they ran.
    pub async fn release_all_workers(&mut self) {
        let ids: Vec<u64> = self.workers.keys().copied().collect();
        for wid in ids {
            if let Some(mut w) = self.workers.remove(&wid) {
                let deadline = self.short_deadline();
                let _ = send_msg(&mut w, "release\n", deadline).await;
                self.finish_remove_worker(w, DisconnectReason::Explicit);
                self.stats.workers_released += 1;
            }
        }
    }

    /// Current statistics snapshot with instantaneous fields filled in.
    pub fn stats(&self) -> ManagerStats {
        let mut s = self.stats;

        // merge counters accumulated from departed workers
        s.bytes_sent += self.stats_disconnected.bytes_sent;
        s.bytes_received += self.stats_disconnected.bytes_received;
        s.time_send += self.stats_disconnected.time_send;
        s.time_receive += self.stats_disconnected.time_receive;
        s.time_workers_execute += self.stats_disconnected.time_workers_execute;

        s.workers_connected = 0;
        s.workers_init = 0;
        s.workers_idle = 0;
        s.workers_busy = 0;
        for w in self.workers.values() {
            match w.kind {
                WorkerKind::Worker if w.resources.tag >= 0 => {
                    s.workers_connected += 1;
                    if w.current_tasks.is_empty() {
                        s.workers_idle += 1;
                    } else {
                        s.workers_busy += 1;
                    }
                }
                WorkerKind::Status => {}
                _ => s.workers_init += 1,
            }
        }

        s.tasks_waiting = 0;
        s.tasks_running = 0;
        s.tasks_with_results = 0;
        for state in self.task_state.values() {
            match state {
                TaskState::Ready => s.tasks_waiting += 1,
                TaskState::Running => s.tasks_running += 1,
                TaskState::WaitingRetrieval => s.tasks_with_results += 1,
                _ => {}
            }
        }
        s.tasks_on_workers = s.tasks_running + s.tasks_with_results;

        // workers able to ever hold the largest request seen
        let want = &self.max_task_resources_requested;
        s.workers_able = self
            .workers
            .values()
            .filter(|w| w.resources.tag >= 0)
            .filter(|w| {
                w.resources.cores.total >= want.cores.unwrap_or(0)
                    && w.resources.memory.total >= want.memory.unwrap_or(0)
                    && w.resources.disk.total >= want.disk.unwrap_or(0)
                    && w.resources.gpus.total >= want.gpus.unwrap_or(0)
            })
            .count() as i64;

        let agg = self.aggregate_resources();
        s.total_cores = agg.cores.total;
        s.total_memory = agg.memory.total;
        s.total_disk = agg.disk.total;
        s.committed_cores = agg.cores.inuse;
        s.committed_memory = agg.memory.inuse;
        s.committed_disk = agg.disk.inuse;
        s.max_cores = self.workers.values().map(|w| w.resources.cores.total).max().unwrap_or(0);
        s.max_memory = self.workers.values().map(|w| w.resources.memory.total).max().unwrap_or(0);
        s.max_disk = self.workers.values().map(|w| w.resources.disk.total).max().unwrap_or(0);
        s.min_cores = self.workers.values().map(|w| w.resources.cores.total).min().unwrap_or(0);
        s.min_memory = self.workers.values().map(|w| w.resources.memory.total).min().unwrap_or(0);
        s.min_disk = self.workers.values().map(|w| w.resources.disk.total).min().unwrap_or(0);

        s.bandwidth = self
            .stats
            .observed_transfer_rate()
            .map(|r| r / 1_000_000.0)
            .unwrap_or(0.0);

        let reports: Vec<TaskReport> = self.task_reports.iter().copied().collect();
        compute_capacity(&reports, &mut s);

        s
    }

    fn aggregate_resources(&self) -> Resources {
        let mut total = Resources::new();
        total.clear();
        for w in self.workers.values() {
            if w.resources.tag >= 0 {
                total.add(&w.resources);
            }
        }
        total
    }

    // ------------------------------------------------------------------
    // the event loop
    // ------------------------------------------------------------------

    async fn wait_internal(&mut self, timeout: Option<Duration>, tag: Option<&str>) -> Option<Task> {
        let entered = now_usec();
        if self.time_last_wait > 0 {
            self.stats.time_application += entered.saturating_sub(self.time_last_wait);
        } else {
            self.stats.time_application +=
                entered.saturating_sub(self.stats.time_when_started);
        }

        self.print_password_warning();

        let stoptime = timeout.map(|d| Instant::now() + d);
        let mut events = 0u32;
        let mut returned: Option<Task> = None;

        loop {
            if let Some(st) = stoptime {
                if Instant::now() >= st {
                    break;
                }
            }

            // completed task to hand back?
            if returned.is_none() {
                if let Some(id) = self.find_retrieved(tag) {
                    if let Some(mut t) = self.tasks.remove(&id) {
                        self.change_task_state(&mut t, TaskState::Done);
                        events += 1;
                        returned = Some(t);
                        break;
                    }
                }
            }

            if self.name.is_some() {
                self.update_catalog(false).await;
            }

            if self.poll_active_workers(stoptime).await > 0 {
                // at least one worker was removed; keep going so task
                // retrieval stays the top priority
                events += 1;
            }

            self.busy_waiting = false;

            let t0 = now_usec();
            let received = self.receive_one_task().await;
            self.stats.time_receive += now_usec().saturating_sub(t0);
            if received {
                events += 1;
                self.compute_manager_load(true);
                continue;
            }

            let t0 = now_usec();
            let expired = self.expire_waiting_tasks();
            self.stats.time_internal += now_usec().saturating_sub(t0);
            if expired > 0 {
                events += 1;
                self.compute_manager_load(true);
                continue;
            }
            self.compute_manager_load(false);

            if self.workers.len() >= self.wait_for_workers {
                if self.wait_for_workers > 0 {
                    debug!("target number of workers reached ({})", self.wait_for_workers);
                    self.wait_for_workers = 0;
                }
                let t0 = now_usec();
                let sent = self.send_one_task().await;
                self.stats.time_send += now_usec().saturating_sub(t0);
                if sent {
                    events += 1;
                    continue;
                }
            }

            let t0 = now_usec();
            self.ask_for_workers_updates().await;
            self.stats.time_status_msgs += now_usec().saturating_sub(t0);

            let t0 = now_usec();
            let mut removed = self.abort_slow_workers().await;
            removed += self.abort_drained_workers().await;
            self.blocklist.release_due(now_secs());
            self.stats.time_internal += now_usec().saturating_sub(t0);
            if removed > 0 {
                events += 1;
                continue;
            }

            if let Some(hook) = &mut self.pending_hook {
                if hook() {
                    events += 1;
                    break;
                }
            }

            if events > 0 && self.queue_drained() {
                break;
            }

            self.print_large_tasks_warning();

            // nothing happened this round; let the next poll block briefly
            self.busy_waiting = true;
        }

        if events > 0 {
            self.log_queue_stats(true);
        }
        self.time_last_wait = now_usec();
        returned
    }

    /// Exponentially weighted share of loop iterations that moved a task.
    fn compute_manager_load(&mut self, task_activity: bool) {
        let alpha = 0.05;
        let activity = if task_activity { 1.0 } else { 0.0 };
        self.stats.manager_load = (1.0 - alpha) * self.stats.manager_load + alpha * activity;
    }

    fn find_retrieved(&self, tag: Option<&str>) -> Option<u64> {
        self.task_state
            .iter()
            .filter(|(_, s)| **s == TaskState::Retrieved)
            .map(|(id, _)| *id)
            .filter(|id| match tag {
                None => true,
                Some(tag) => self
                    .tasks
                    .get(id)
                    .map(|t| t.tag.as_deref() == Some(tag))
                    .unwrap_or(false),
            })
            .min()
    }

    fn queue_drained(&self) -> bool {
        !self.task_state.values().any(|s| {
            matches!(
                s,
                TaskState::Ready | TaskState::Running | TaskState::WaitingRetrieval
            )
        })
    }

    /// Wait for readiness on the listener and every worker connection,
    /// then handle what woke us. Returns the number of workers removed
    /// for failure.
    async fn poll_active_workers(&mut self, stoptime: Option<Instant>) -> usize {
        enum PollEvent {
            Accepted(TcpStream, SocketAddr),
            Ready(u64),
            Timeout,
        }

        let t0 = now_usec();
        let mut msec: u64 = if self.busy_waiting { 1000 } else { 0 };
        if let Some(st) = stoptime {
            let remain = st.saturating_duration_since(Instant::now()).as_millis() as u64;
            msec = msec.min(remain);
        }

        let event = {
            let buffered = self
                .workers
                .iter()
                .find(|(_, w)| w.conn.has_buffered())
                .map(|(id, _)| *id);
            match buffered {
                Some(id) => PollEvent::Ready(id),
                None => {
                    let mut readiness: Vec<
                        std::pin::Pin<Box<dyn std::future::Future<Output = u64> + Send + '_>>,
                    > = Vec::with_capacity(self.workers.len());
                    for (id, w) in &self.workers {
                        let id = *id;
                        let conn = &w.conn;
                        readiness.push(Box::pin(async move {
                            conn.readiness().await;
                            id
                        }));
                    }
                    let listener = &self.listener;
                    tokio::select! {
                        biased;
                        res = listener.accept() => match res {
                            Ok((stream, addr)) => PollEvent::Accepted(stream, addr),
                            Err(e) => {
                                warn!("accept failed: {}", e);
                                PollEvent::Timeout
                            }
                        },
                        id = async {
                            if readiness.is_empty() {
                                std::future::pending::<u64>().await
                            } else {
                                futures::future::select_all(readiness).await.0
                            }
                        } => PollEvent::Ready(id),
                        _ = tokio::time::sleep(Duration::from_millis(msec)) => PollEvent::Timeout,
                    }
                }
            }
        };
        self.link_poll_end = now_usec();
        self.stats.time_polling += self.link_poll_end.saturating_sub(t0);

        let t1 = now_usec();
        let mut failed = 0;
        match event {
            PollEvent::Accepted(stream, addr) => {
                self.add_worker(stream, addr).await;
                // take any connections already pending, up to a cap
                use futures::FutureExt;
                for _ in 1..MAX_NEW_WORKERS {
                    match self.listener.accept().now_or_never() {
                        Some(Ok((stream, addr))) => self.add_worker(stream, addr).await,
                        _ => break,
                    }
                }
            }
            PollEvent::Ready(id) => {
                if self.handle_worker(id).await {
                    failed += 1;
                }
            }
            PollEvent::Timeout => {}
        }

        failed += self.drain_available_results().await;
        self.stats.time_status_msgs += now_usec().saturating_sub(t1);
        failed
    }

    /// Accept one incoming connection: optional TLS wrap, then the
    /// password challenge, then a fresh worker record.
    async fn add_worker(&mut self, stream: TcpStream, addr: SocketAddr) {
        debug!("worker {} connected", addr);
        let deadline = self.short_deadline();

        let mut conn = match &self.tls {
            Some(acceptor) => {
                match Connection::wrap_tls(stream, addr, acceptor, deadline).await {
                    Ok(c) => {
                        debug!("worker {} completed ssl connection", addr);
                        c
                    }
                    Err(e) => {
                        debug!("worker {} failed ssl connection: {}", addr, e);
                        return;
                    }
                }
            }
            None => Connection::new(stream, addr),
        };

        if let Some(password) = self.password.clone() {
            debug!("worker {} authenticating", addr);
            match conn.authenticate(&password, deadline).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("worker {} presented the wrong password", addr);
                    return;
                }
                Err(e) => {
                    debug!("worker {} failed authentication: {}", addr, e);
                    return;
                }
            }
        }

        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let w = Worker::new(id, conn, now_usec());
        self.workers.insert(id, w);
    }

    /// Handle one readable worker. Returns true when the worker was
    /// removed for failure.
    async fn handle_worker(&mut self, wid: u64) -> bool {
        let Some(mut w) = self.workers.remove(&wid) else {
            return false;
        };
        match self.recv_worker_msg(&mut w).await {
            RecvOutcome::Processed => {
                self.workers.insert(wid, w);
                false
            }
            RecvOutcome::Disconnect(reason) => {
                self.finish_remove_worker(w, reason);
                false
            }
            RecvOutcome::NotProcessed(line) => {
                debug!("invalid message from worker {}: {}", wid, line);
                self.stats.workers_lost += 1;
                self.finish_remove_worker(w, DisconnectReason::Failure);
                true
            }
            RecvOutcome::Failure => {
                debug!("failed to read from worker {}", wid);
                self.stats.workers_lost += 1;
                self.finish_remove_worker(w, DisconnectReason::Failure);
                true
            }
        }
    }

    /// Read one line from a worker and classify it, absorbing status
    /// updates as side effects.
    async fn recv_worker_msg(&mut self, w: &mut Worker) -> RecvOutcome {
        let deadline = self.short_deadline();
        let line = match w.conn.read_line(deadline).await {
            Ok(l) => l,
            Err(_) => return RecvOutcome::Failure,
        };
        w.last_msg_recv_time = now_usec();
        debug!("rx from {} ({}): {}", w.hostname, w.addrport, line);

        match parse_worker_line(&line) {
            WorkerLine::Alive => RecvOutcome::Processed,
            WorkerLine::Hello {
                protocol,
                hostname,
                os,
                arch,
                version,
            } => self.process_hello(w, protocol, hostname, os, arch, version),
            WorkerLine::StatusRequest(request) => self.process_status_request(w, &request).await,
            WorkerLine::HttpGet(path) => self.process_http_request(w, &path).await,
            WorkerLine::AvailableResults => {
                self.workers_with_results.insert(w.id);
                RecvOutcome::Processed
            }
            WorkerLine::Resource { name, resource } => {
                if w.resources.update_dimension(&name, resource) {
                    RecvOutcome::Processed
                } else {
                    RecvOutcome::Failure
                }
            }
            WorkerLine::ResourceTag(tag) => {
                w.resources.tag = tag;
                w.count_committed_resources();
                self.write_transaction_worker_resources(w);
                RecvOutcome::Processed
            }
            WorkerLine::Feature(feature) => {
                debug!("feature found: {}", feature);
                w.features.insert(feature);
                RecvOutcome::Processed
            }
            WorkerLine::Info { field, value } => self.process_info(w, &field, &value).await,
            WorkerLine::CacheUpdate {
                cache_name,
                size,
                transfer_time,
            } => {
                if let Some(entry) = w.cache.get_mut(&cache_name) {
                    entry.size = size;
                    entry.transfer_time = transfer_time;
                }
                RecvOutcome::Processed
            }
            WorkerLine::CacheInvalid { cache_name, length } => {
                let deadline = self.long_deadline();
                match w.conn.read_exact(length, deadline).await {
                    Ok(message) => {
                        debug!(
                            "{} ({}) invalidated {} with error: {}",
                            w.hostname,
                            w.addrport,
                            cache_name,
                            String::from_utf8_lossy(&message)
                        );
                        w.cache.remove(&cache_name);
                        RecvOutcome::Processed
                    }
                    Err(_) => RecvOutcome::Failure,
                }
            }
            WorkerLine::TransferAddress { host, port } => {
                w.transfer_addr = Some((host, port));
                RecvOutcome::Processed
            }
            WorkerLine::Auth => {
                warn!(
                    "worker ({}) is attempting to use a password, but none is configured",
                    w.addrport
                );
                RecvOutcome::Failure
            }
            WorkerLine::LegacyReady => {
                warn!(
                    "worker ({}) is an older worker that is not compatible with this manager",
                    w.addrport
                );
                RecvOutcome::Failure
            }
            WorkerLine::NameQuery => {
                debug!("sending project name to worker ({})", w.addrport);
                let deadline = self.short_deadline();
                let reply = format!("{}\n", self.name.as_deref().unwrap_or(""));
                match w.conn.send(&reply, deadline).await {
                    Ok(_) => RecvOutcome::Processed,
                    Err(_) => RecvOutcome::Failure,
                }
            }
            WorkerLine::Other(line) => RecvOutcome::NotProcessed(line),
        }
    }

    /// Keep absorbing status updates until a line the caller must see.
    async fn recv_retry(&mut self, w: &mut Worker) -> RecvOutcome {
        loop {
            match self.recv_worker_msg(w).await {
                RecvOutcome::Processed => continue,
                other => return other,
            }
        }
    }

    fn process_hello(
        &mut self,
        w: &mut Worker,
        protocol: i64,
        hostname: String,
        os: String,
        arch: String,
        version: String,
    ) -> RecvOutcome {
        if protocol != crate::PROTOCOL_VERSION {
            warn!(
                "rejecting worker ({}) using protocol {}; this manager speaks protocol {}",
                w.addrport,
                protocol,
                crate::PROTOCOL_VERSION
            );
            self.block_host(&hostname);
            return RecvOutcome::Failure;
        }

        w.hostname = hostname;
        w.os = os;
        w.arch = arch;
        w.version = version;
        w.kind = WorkerKind::Worker;

        self.stats.workers_joined += 1;
        debug!(
            "{} ({}) running taskswarm {} on {} ({}) is ready",
            w.hostname, w.addrport, w.version, w.os, w.arch
        );
        if w.version != crate::VERSION {
            debug!(
                "warning: worker {} ({}) is version {}, manager is version {}",
                w.hostname,
                w.addrport,
                w.version,
                crate::VERSION
            );
        }
        RecvOutcome::Processed
    }

    async fn process_info(&mut self, w: &mut Worker, field: &str, value: &str) -> RecvOutcome {
        match field {
            "workers_joined" => w.stats.workers_joined = value.parse().unwrap_or(0),
            "workers_removed" => w.stats.workers_removed = value.parse().unwrap_or(0),
            "tasks_waiting" => w.stats.tasks_waiting = value.parse().unwrap_or(0),
            "tasks_running" => w.stats.tasks_running = value.parse().unwrap_or(0),
            "time_send" => w.stats.time_send = value.parse().unwrap_or(0),
            "time_receive" => w.stats.time_receive = value.parse().unwrap_or(0),
            "time_execute" => w.stats.time_workers_execute = value.parse().unwrap_or(0),
            "bytes_sent" => w.stats.bytes_sent = value.parse().unwrap_or(0),
            "bytes_received" => w.stats.bytes_received = value.parse().unwrap_or(0),
            "idle-disconnecting" => {
                self.stats.workers_idled_out += 1;
                return RecvOutcome::Disconnect(DisconnectReason::IdleOut);
            }
            "end_of_resource_update" => {
                w.count_committed_resources();
                self.write_transaction_worker_resources(w);
            }
            "worker-id" => {
                w.worker_uuid = Some(value.to_string());
                self.write_transaction(&format!(
                    "WORKER {} {}  CONNECTION",
                    value, w.addrport
                ));
                // one record per worker identity: a reconnecting worker
                // replaces its stale predecessor
                let stale = self
                    .workers
                    .iter()
                    .find(|(_, other)| other.worker_uuid.as_deref() == Some(value))
                    .map(|(id, _)| *id);
                if let Some(stale_id) = stale {
                    if let Some(mut old) = self.workers.remove(&stale_id) {
                        debug!(
                            "replacing stale worker {} ({}) with new connection",
                            old.hostname, old.addrport
                        );
                        let deadline = self.short_deadline();
                        let _ = send_msg(&mut old, "exit\n", deadline).await;
                        self.finish_remove_worker(old, DisconnectReason::Explicit);
                        self.stats.workers_released += 1;
                    }
                }
            }
            "worker-end-time" => {
                w.end_time = value.parse::<i64>().unwrap_or(0).max(0);
            }
            "from-factory" => {
                self.fetch_factory = true;
                w.factory_name = Some(value.to_string());
                let over_cap = {
                    let f = self.factories.get_or_create(value);
                    f.connected_workers + 1 > f.max_workers
                };
                if over_cap {
                    let deadline = self.short_deadline();
                    let _ = send_msg(w, "exit\n", deadline).await;
                    self.stats.workers_released += 1;
                    return RecvOutcome::Disconnect(DisconnectReason::Explicit);
                }
                if let Some(f) = self.factories.get_mut(value) {
                    f.connected_workers += 1;
                }
            }
            // info messages are optional; unknown fields are fine
            _ => {}
        }
        RecvOutcome::Processed
    }

    async fn process_status_request(&mut self, w: &mut Worker, request: &str) -> RecvOutcome {
        let doc = self.construct_status_message(request);
        w.kind = WorkerKind::Status;
        w.hostname = "QUEUE_STATUS".to_string();
        let Some(doc) = doc else {
            debug!("unknown status request: '{}'", request);
            return RecvOutcome::Failure;
        };
        let deadline = self.long_deadline();
        match w.conn.send(&format!("{}\n", doc), deadline).await {
            Ok(_) => RecvOutcome::Disconnect(DisconnectReason::StatusWorker),
            Err(_) => RecvOutcome::Failure,
        }
    }

    async fn process_http_request(&mut self, w: &mut Worker, path: &str) -> RecvOutcome {
        let deadline = self.short_deadline();
        w.kind = WorkerKind::Status;
        w.hostname = "QUEUE_STATUS".to_string();
        if http::consume_headers(&mut w.conn, deadline).await.is_err() {
            return RecvOutcome::Failure;
        }
        let result = if path == "/" {
            http::respond_index(&mut w.conn, deadline).await
        } else {
            match self.construct_status_message(path.trim_start_matches('/')) {
                Some(doc) => http::respond_json(&mut w.conn, &doc, deadline).await,
                None => http::respond_not_found(&mut w.conn, deadline).await,
            }
        };
        match result {
            Ok(_) => RecvOutcome::Disconnect(DisconnectReason::StatusWorker),
            Err(_) => RecvOutcome::Failure,
        }
    }

    // ------------------------------------------------------------------
    // dispatch
    // ------------------------------------------------------------------

    /// Walk the ready queue once in priority order and dispatch the
    /// first task with a fitting worker. Returns true when one was sent.
    async fn send_one_task(&mut self) -> bool {
        let now = now_usec();
        let ready: Vec<u64> = self.ready_list.iter().copied().collect();
        let opts = self.scheduler_opts();
        let mut rng = self.rng.clone();

        for tid in ready {
            let choice = {
                let Some(t) = self.tasks.get(&tid) else {
                    continue;
                };
                if let Some(start) = t.resources_requested.start {
                    if (start as u64) * 1_000_000 > now {
                        continue;
                    }
                }
                let Some(c) = self.categories.get(&t.category) else {
                    continue;
                };
                scheduler::find_best_worker(
                    &self.workers,
                    t,
                    c,
                    &opts,
                    &self.blocklist,
                    &self.factories,
                    now_secs(),
                    &mut rng,
                )
            };
            if let Some(wid) = choice {
                self.rng = rng;
                self.commit_task_to_worker(wid, tid).await;
                return true;
            }
        }
        self.rng = rng;
        false
    }

    async fn commit_task_to_worker(&mut self, wid: u64, tid: u64) {
        let Some(mut w) = self.workers.remove(&wid) else {
            return;
        };
        let Some(mut t) = self.tasks.remove(&tid) else {
            self.workers.insert(wid, w);
            return;
        };

        t.hostname = Some(w.hostname.clone());
        t.addrport = Some(w.addrport.clone());
        t.time_when_commit_start = now_usec();
        let result = self.start_one_task(&mut w, &mut t).await;
        t.time_when_commit_end = now_usec();

        w.current_tasks.insert(tid);
        self.worker_task_map.insert(tid, wid);
        self.change_task_state(&mut t, TaskState::Running);
        t.try_count += 1;
        self.stats.tasks_dispatched += 1;
        w.count_committed_resources();

        self.tasks.insert(tid, t);
        self.workers.insert(wid, w);

        if result != OpOutcome::Success {
            debug!("failed to send task {} to worker {}", tid, wid);
            self.handle_failure(wid, tid, result).await;
        }
    }

    /// Send the inputs and the task description to a worker.
    async fn start_one_task(&mut self, w: &mut Worker, t: &mut Task) -> OpOutcome {
        let opts = self.scheduler_opts();
        let limits = {
            let c = self
                .categories
                .get(&t.category)
                .cloned()
                .unwrap_or_else(|| Category::new(&t.category));
            scheduler::task_worker_box(t, &c, w, &opts)
        };

        let result = self.send_input_files(w, t).await;
        if result != OpOutcome::Success {
            return result;
        }

        let deadline = self.short_deadline();

        macro_rules! tx {
            ($($arg:tt)*) => {
                if send_msg(w, &format!($($arg)*), deadline).await.is_err() {
                    return OpOutcome::WorkerFailure;
                }
            };
        }

        tx!("task {}\n", t.id);
        tx!("cmd {}\n", t.command.len());
        if w.conn.write_all(t.command.as_bytes(), deadline).await.is_err() {
            return OpOutcome::WorkerFailure;
        }
        debug!("{}", t.command);

        if let Some(coprocess) = &t.coprocess {
            tx!("coprocess {}\n", coprocess.len());
            if w.conn
                .write_all(coprocess.as_bytes(), deadline)
                .await
                .is_err()
            {
                return OpOutcome::WorkerFailure;
            }
        }

        tx!("category {}\n", t.category);
        tx!("cores {}\n", limits.cores.unwrap_or(0));
        tx!("gpus {}\n", limits.gpus.unwrap_or(0));
        tx!("memory {}\n", limits.memory.unwrap_or(0));
        tx!("disk {}\n", limits.disk.unwrap_or(0));

        if let Some(end) = limits.end.or(t.resources_requested.end) {
            if end > 0 {
                tx!("end_time {}\n", end * 1_000_000);
            }
        }
        if let Some(wall) = limits.wall_time.or(t.resources_requested.wall_time) {
            if wall > 0 {
                tx!("wall_time {}\n", wall * 1_000_000);
            }
        }

        for (k, v) in &t.env {
            let var = format!("{}={}", k, v);
            tx!("env {}\n", var.len());
            if w.conn.write_all(var.as_bytes(), deadline).await.is_err() {
                return OpOutcome::WorkerFailure;
            }
            if w.conn.write_all(b"\n", deadline).await.is_err() {
                return OpOutcome::WorkerFailure;
            }
        }

        for f in &t.inputs {
            if f.kind == FileKind::Directory {
                tx!("dir {}\n", f.remote_name);
            } else {
                tx!(
                    "infile {} {} {}\n",
                    f.cache_name,
                    url_encode(&f.remote_name),
                    f.flags.to_wire()
                );
            }
        }
        for f in &t.outputs {
            tx!(
                "outfile {} {} {}\n",
                f.cache_name,
                url_encode(&f.remote_name),
                f.flags.to_wire()
            );
        }

        if send_msg(w, "end\n", deadline).await.is_err() {
            return OpOutcome::WorkerFailure;
        }

        w.task_boxes.insert(t.id, limits);
        t.resources_allocated.merge_override(&limits);
        debug!("{} ({}) busy on '{}'", w.hostname, w.addrport, t.command);
        OpOutcome::Success
    }

    /// Stage every input of a task, skipping objects already cached.
    async fn send_input_files(&mut self, w: &mut Worker, t: &mut Task) -> OpOutcome {
        // every local input must exist before anything is sent
        for f in &t.inputs {
            if let FileKind::Local(path) | FileKind::Piece { path, .. } = &f.kind {
                let expanded = expand_env_names(w, &path.to_string_lossy());
                if std::fs::symlink_metadata(&expanded).is_err() {
                    debug!("could not stat input {}", expanded);
                    t.update_result(TaskResultCode::InputMissing);
                    return OpOutcome::AppFailure;
                }
            }
        }

        for f in t.inputs.clone() {
            let result = self.send_input_file(w, t, &f).await;
            if result != OpOutcome::Success {
                return result;
            }
        }
        OpOutcome::Success
    }

    async fn send_input_file(&mut self, w: &mut Worker, t: &mut Task, f: &TaskFile) -> OpOutcome {
        let rate = self.transfer_rate(w);
        let open_time = now_usec();
        let mut total_bytes: i64 = 0;

        let result = match &f.kind {
            FileKind::Buffer(data) => {
                if w.cache.contains_key(&f.cache_name) {
                    OpOutcome::Success
                } else {
                    debug!(
                        "{} ({}) needs literal as {}",
                        w.hostname, w.addrport, f.remote_name
                    );
                    let r = match transfer::send_buffer(&mut w.conn, data, &f.cache_name, &rate)
                        .await
                    {
                        Ok(r) => r,
                        Err(_) => OpOutcome::WorkerFailure,
                    };
                    if r == OpOutcome::Success {
                        total_bytes = data.len() as i64;
                        if f.flags.cache {
                            w.cache.insert(
                                f.cache_name.clone(),
                                CacheEntry {
                                    kind: f.kind.tag(),
                                    size: data.len() as i64,
                                    mtime: now_secs() as i64,
                                    transfer_time: 0,
                                },
                            );
                        }
                    }
                    r
                }
            }
            FileKind::Url(source) => {
                self.send_special_if_not_cached(w, f, "puturl", source).await
            }
            FileKind::Command(cmd) => {
                self.send_special_if_not_cached(w, f, "putcmd", cmd).await
            }
            FileKind::Directory => OpOutcome::Success,
            FileKind::Local(path) | FileKind::Piece { path, .. } => {
                let expanded = expand_env_names(w, &path.to_string_lossy());
                self.send_item_if_not_cached(w, t, f, Path::new(&expanded), &mut total_bytes)
                    .await
            }
        };

        if result == OpOutcome::Success {
            let elapsed = now_usec().saturating_sub(open_time).max(1);
            if total_bytes > 0 {
                t.bytes_sent += total_bytes;
                t.bytes_transferred += total_bytes;
                w.total_bytes_transferred += total_bytes;
                w.total_transfer_time += elapsed;
                self.stats.bytes_sent += total_bytes;
                self.write_transaction_transfer(t.id, f, total_bytes, elapsed, "INPUT");
                debug!(
                    "{} ({}) received {:.2} MB in {:.2}s",
                    w.hostname,
                    w.addrport,
                    total_bytes as f64 / 1_000_000.0,
                    elapsed as f64 / 1_000_000.0
                );
            }
        } else {
            debug!(
                "{} ({}) failed to receive input {} ({} bytes sent)",
                w.hostname, w.addrport, f.remote_name, total_bytes
            );
            if result == OpOutcome::AppFailure {
                t.update_result(TaskResultCode::InputMissing);
            }
        }
        result
    }

    /// Forward a URL or producer-command input the worker fetches
    /// itself, unless its object is already cached there.
    async fn send_special_if_not_cached(
        &mut self,
        w: &mut Worker,
        f: &TaskFile,
        keyword: &str,
        source: &str,
    ) -> OpOutcome {
        if w.cache.contains_key(&f.cache_name) {
            return OpOutcome::Success;
        }
        debug!(
            "{} ({}) will fetch {} via {}",
            w.hostname, w.addrport, f.remote_name, keyword
        );
        let deadline = self.short_deadline();
        let msg = format!(
            "{} {} {} {} 0777\n",
            keyword,
            url_encode(source),
            f.cache_name,
            f.length
        );
        if send_msg(w, &msg, deadline).await.is_err() {
            return OpOutcome::WorkerFailure;
        }
        if f.flags.cache {
            w.cache.insert(
                f.cache_name.clone(),
                CacheEntry {
                    kind: f.kind.tag(),
                    size: f.length,
                    mtime: now_secs() as i64,
                    transfer_time: 0,
                },
            );
        }
        OpOutcome::Success
    }

    /// Stream a local item unless the worker already caches it. A cached
    /// copy whose source changed locally is left alone: the task runs
    /// with the older version.
    async fn send_item_if_not_cached(
        &mut self,
        w: &mut Worker,
        t: &mut Task,
        f: &TaskFile,
        expanded: &Path,
        total_bytes: &mut i64,
    ) -> OpOutcome {
        let info = match std::fs::symlink_metadata(expanded) {
            Ok(i) => i,
            Err(e) => {
                debug!("cannot stat file {}: {}", expanded.display(), e);
                return OpOutcome::AppFailure;
            }
        };
        let mtime = info
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let size = info.len() as i64;

        if let Some(entry) = w.cache.get(&f.cache_name) {
            if entry.mtime != mtime || entry.size != size {
                warn!(
                    "file {} changed locally; task {} will run with an older cached version",
                    expanded.display(),
                    t.id
                );
            }
            return OpOutcome::Success;
        }

        debug!(
            "{} ({}) needs file {} as '{}'",
            w.hostname,
            w.addrport,
            expanded.display(),
            f.cache_name
        );
        let rate = self.transfer_rate(w);
        let result = match transfer::send_named_item(&mut w.conn, f, expanded, &rate, total_bytes)
            .await
        {
            Ok(r) => r,
            Err(_) => OpOutcome::WorkerFailure,
        };

        if result == OpOutcome::Success && f.flags.cache {
            w.cache.insert(
                f.cache_name.clone(),
                CacheEntry {
                    kind: f.kind.tag(),
                    size,
                    mtime,
                    transfer_time: 0,
                },
            );
        }
        result
    }

    // ------------------------------------------------------------------
    // retrieval
    // ------------------------------------------------------------------

    /// Ask every worker that announced results to send them.
    async fn drain_available_results(&mut self) -> usize {
        let ids: Vec<u64> = self.workers_with_results.drain().collect();
        let mut failed = 0;
        for wid in ids {
            let Some(mut w) = self.workers.remove(&wid) else {
                continue;
            };
            match self.get_available_results(&mut w).await {
                OpOutcome::Success => {
                    self.workers.insert(wid, w);
                }
                _ => {
                    self.stats.workers_lost += 1;
                    self.finish_remove_worker(w, DisconnectReason::Failure);
                    failed += 1;
                }
            }
        }
        failed
    }

    async fn get_available_results(&mut self, w: &mut Worker) -> OpOutcome {
        let deadline = self.short_deadline();
        if send_msg(w, "send_results -1\n", deadline).await.is_err() {
            return OpOutcome::WorkerFailure;
        }
        debug!("reading result(s) from {} ({})", w.hostname, w.addrport);

        loop {
            let line = match self.recv_retry(w).await {
                RecvOutcome::NotProcessed(line) => line,
                _ => return OpOutcome::WorkerFailure,
            };
            if let Some(header) = parse_result_header(&line) {
                if self.get_result(w, header).await != OpOutcome::Success {
                    return OpOutcome::WorkerFailure;
                }
            } else if let Some(update) = parse_watch_update(&line) {
                if self.get_watch_update(w, update).await != OpOutcome::Success {
                    return OpOutcome::WorkerFailure;
                }
            } else if line == "end" {
                return OpOutcome::Success;
            } else {
                debug!(
                    "{} ({}): sent invalid response to send_results: {}",
                    w.hostname, w.addrport, line
                );
                return OpOutcome::WorkerFailure;
            }
        }
    }

    /// Receive one `result` record: status, exit code, and stdout.
    async fn get_result(&mut self, w: &mut Worker, h: ResultHeader) -> OpOutcome {
        let rate = self.transfer_rate(w);

        let known = w.current_tasks.contains(&h.task_id) && self.tasks.contains_key(&h.task_id);
        if !known {
            debug!(
                "unknown task result from {} ({}): no task {} assigned; ignoring",
                w.hostname, w.addrport, h.task_id
            );
            let deadline = rate.deadline_for(h.stdout_length);
            if w.conn.drain(h.stdout_length, deadline).await.is_err() {
                return OpOutcome::WorkerFailure;
            }
            return OpOutcome::Success;
        }
        let mut t = match self.tasks.remove(&h.task_id) {
            Some(t) => t,
            None => return OpOutcome::Success,
        };

        if TaskResultCode::from_code(h.status) == TaskResultCode::Forsaken {
            // the worker never ran it: resubmit without penalty
            self.delete_uncacheable_inputs(w, &t).await;
            self.reap_task_from_worker(w, &mut t, TaskState::Ready);
            self.tasks.insert(h.task_id, t);
            return OpOutcome::Success;
        }

        let observed = now_usec().saturating_sub(t.time_when_commit_end);
        t.time_workers_execute_last = observed.min(h.execution_time);
        t.time_workers_execute_all += t.time_workers_execute_last;

        let mut keep = h.stdout_length.min(MAX_TASK_STDOUT_STORAGE);
        if h.stdout_length > MAX_TASK_STDOUT_STORAGE {
            warn!(
                "stdout of task {} requires {} bytes of storage; only {} bytes will be kept",
                h.task_id, h.stdout_length, MAX_TASK_STDOUT_STORAGE
            );
            t.update_result(TaskResultCode::StdoutMissing);
        }

        let mut output = Vec::new();
        if output.try_reserve_exact(keep as usize).is_err() {
            // cannot hold the buffer at all: drop the whole payload
            warn!(
                "allocating {} bytes for stdout of task {} failed",
                keep, h.task_id
            );
            let deadline = rate.deadline_for(h.stdout_length);
            if w.conn.drain(h.stdout_length, deadline).await.is_err() {
                self.tasks.insert(h.task_id, t);
                return OpOutcome::WorkerFailure;
            }
            keep = 0;
            t.update_result(TaskResultCode::StdoutMissing);
        }

        if keep > 0 {
            debug!(
                "receiving stdout of task {} (size: {} bytes) from {} ({})",
                h.task_id, keep, w.hostname, w.addrport
            );
            let deadline = rate.deadline_for(keep);
            match w.conn.read_exact(keep as usize, deadline).await {
                Ok(bytes) => output = bytes,
                Err(_) => {
                    self.tasks.insert(h.task_id, t);
                    return OpOutcome::WorkerFailure;
                }
            }

            if h.stdout_length > keep {
                let deadline = rate.deadline_for(h.stdout_length - keep);
                if w.conn.drain(h.stdout_length - keep, deadline).await.is_err() {
                    self.tasks.insert(h.task_id, t);
                    return OpOutcome::WorkerFailure;
                }
                let marker = format!(
                    "\n>>>>>> STDOUT TRUNCATED AFTER THIS POINT.\n>>>>>> MAXIMUM OF {} BYTES REACHED, {} BYTES TRUNCATED.",
                    MAX_TASK_STDOUT_STORAGE,
                    h.stdout_length - keep
                );
                let start = output.len().saturating_sub(marker.len());
                output.truncate(start);
                output.extend_from_slice(marker.as_bytes());
            }
        }

        t.output = Some(output);
        t.result = TaskResultCode::from_code(h.status);
        t.exit_code = h.exit_code;

        self.stats.time_workers_execute += t.time_workers_execute_last;
        w.finished_tasks += 1;

        self.change_task_state(&mut t, TaskState::WaitingRetrieval);
        self.tasks.insert(h.task_id, t);
        OpOutcome::Success
    }

    /// Apply a watched-file tail update to the local copy of an output.
    async fn get_watch_update(&mut self, w: &mut Worker, u: WatchUpdate) -> OpOutcome {
        let rate = self.transfer_rate(w);

        let local = self
            .tasks
            .get(&u.task_id)
            .filter(|_| w.current_tasks.contains(&u.task_id))
            .and_then(|t| {
                t.outputs
                    .iter()
                    .find(|f| f.remote_name == u.path)
                    .and_then(|f| match &f.kind {
                        FileKind::Local(path) => Some(path.clone()),
                        _ => None,
                    })
            });

        let Some(local) = local else {
            // a stale update for a cancelled task or unwatched file
            debug!(
                "{} ({}) sent output for unwatched file {}",
                w.hostname, w.addrport, u.path
            );
            let deadline = rate.deadline_for(u.length);
            return match w.conn.drain(u.length, deadline).await {
                Ok(_) => OpOutcome::Success,
                Err(_) => OpOutcome::WorkerFailure,
            };
        };

        match transfer::apply_watch_update(&mut w.conn, &local, u.offset, u.length, &rate).await {
            Ok(_) => OpOutcome::Success,
            Err(_) => OpOutcome::WorkerFailure,
        }
    }

    /// Fetch outputs of one task waiting for retrieval. Returns true
    /// when a task was processed.
    async fn receive_one_task(&mut self) -> bool {
        let Some((&tid, _)) = self
            .task_state
            .iter()
            .find(|(_, s)| **s == TaskState::WaitingRetrieval)
        else {
            return false;
        };
        let Some(&wid) = self.worker_task_map.get(&tid) else {
            return false;
        };
        self.fetch_output_from_worker(wid, tid).await;

        // a factory worker over its cap is released once idle
        if let Some(w) = self.workers.get(&wid) {
            if let Some(factory) = w.factory_name.clone() {
                if self.factories.over_cap(&factory)
                    && self
                        .workers
                        .get(&wid)
                        .map(|w| w.current_tasks.is_empty())
                        .unwrap_or(false)
                {
                    debug!("final task received from over-cap factory worker, shutting down");
                    self.shut_down_worker(wid).await;
                }
            }
        }
        true
    }

    async fn fetch_output_from_worker(&mut self, wid: u64, tid: u64) {
        let Some(mut w) = self.workers.remove(&wid) else {
            return;
        };
        let Some(mut t) = self.tasks.remove(&tid) else {
            self.workers.insert(wid, w);
            return;
        };

        t.time_when_retrieval = now_usec();
        let result = self.get_output_files(&mut w, &mut t).await;

        if result == OpOutcome::AppFailure {
            debug!("failed to receive output of task {} (task error)", tid);
            self.handle_app_failure(&mut w, &mut t).await;
            t.time_when_done = now_usec();
            self.tasks.insert(tid, t);
            self.workers.insert(wid, w);
            return;
        }
        if result != OpOutcome::Success {
            debug!(
                "failed to receive output from worker {} ({})",
                w.hostname, w.addrport
            );
            t.time_when_done = now_usec();
            self.tasks.insert(tid, t);
            self.finish_remove_worker(w, DisconnectReason::Failure);
            return;
        }

        self.delete_uncacheable_files(&mut w, &t).await;

        t.time_when_done = now_usec();
        self.accumulate_task(&t);

        self.reap_task_from_worker(&mut w, &mut t, TaskState::Retrieved);
        w.finished_tasks -= 1;
        w.total_tasks_complete += 1;

        // a finished task is evidence the worker itself is not slow
        w.fast_abort_alarm = false;

        if t.result == TaskResultCode::ResourceExhaustion {
            t.exhausted_attempts += 1;
            self.stats.tasks_exhausted_attempts += 1;
            t.time_workers_execute_exhaustion += t.time_workers_execute_last;
            self.stats.time_workers_execute_exhaustion += t.time_workers_execute_last;

            let next = {
                let c = self.category_mut(&t.category.clone());
                c.next_level(t.resource_request, true, t.resources_measured.as_ref())
            };
            if next == AllocationLevel::Error {
                debug!("task {} failed given max resource exhaustion", tid);
            } else {
                debug!("task {} resubmitted using new resource allocation", tid);
                t.resource_request = next;
                self.change_task_state(&mut t, TaskState::Ready);
                self.tasks.insert(tid, t);
                self.workers.insert(wid, w);
                return;
            }
        } else if t.result == TaskResultCode::Success && t.exit_code == 0 {
            self.stats.time_workers_execute_good += t.time_workers_execute_last;
        }

        if t.result == TaskResultCode::Success && t.time_workers_execute_last < 1_000_000 {
            match t.exit_code {
                126 => warn!(
                    "task {} ran for a very short time and exited with code 126; \
                     its command is likely not executable",
                    tid
                ),
                127 => warn!(
                    "task {} ran for a very short time and exited with code 127; \
                     its command was likely not found on the worker",
                    tid
                ),
                139 => warn!(
                    "task {} ran for a very short time and exited with code 139 (segfault)",
                    tid
                ),
                _ => {}
            }
        }

        self.add_task_report(&t);
        if w.total_tasks_complete > 0 {
            debug!(
                "{} ({}) done in {:.2}s total tasks {} average {:.2}s",
                w.hostname,
                w.addrport,
                (t.time_when_done.saturating_sub(t.time_when_commit_start)) as f64 / 1_000_000.0,
                w.total_tasks_complete,
                (w.total_task_time / w.total_tasks_complete as u64) as f64 / 1_000_000.0
            );
        }

        self.tasks.insert(tid, t);
        self.workers.insert(wid, w);
    }

    async fn get_output_files(&mut self, w: &mut Worker, t: &mut Task) -> OpOutcome {
        let task_succeeded = t.result == TaskResultCode::Success && t.exit_code == 0;
        let mut result = OpOutcome::Success;

        for f in t.outputs.clone() {
            // only file objects are fetched; other kinds stay worker-side
            if !matches!(f.kind, FileKind::Local(_)) {
                continue;
            }
            if f.flags.failure_only && task_succeeded {
                continue;
            }
            if f.flags.success_only && !task_succeeded {
                continue;
            }
            let r = self.get_output_file(w, t, &f).await;
            if r == OpOutcome::WorkerFailure {
                result = r;
                break;
            }
            result = r;
        }

        // the worker no longer needs the task sandbox
        let deadline = self.short_deadline();
        let _ = send_msg(w, &format!("kill {}\n", t.id), deadline).await;
        result
    }

    async fn get_output_file(&mut self, w: &mut Worker, t: &mut Task, f: &TaskFile) -> OpOutcome {
        let FileKind::Local(local_path) = &f.kind else {
            return OpOutcome::Success;
        };
        let local_path = local_path.clone();
        let mut total_bytes: i64 = 0;
        let open_time = now_usec();

        debug!(
            "{} ({}) sending back {} to {}",
            w.hostname,
            w.addrport,
            f.cache_name,
            local_path.display()
        );
        let deadline = self.short_deadline();
        if send_msg(w, &format!("get {} 1\n", f.cache_name), deadline)
            .await
            .is_err()
        {
            return OpOutcome::WorkerFailure;
        }

        let result = self
            .get_any(w, t, None, Some(&local_path), &mut total_bytes)
            .await;
        let sum_time = now_usec().saturating_sub(open_time);

        if total_bytes > 0 {
            self.stats.bytes_received += total_bytes;
            t.bytes_received += total_bytes;
            t.bytes_transferred += total_bytes;
            w.total_bytes_transferred += total_bytes;
            w.total_transfer_time += sum_time;
            debug!(
                "{} ({}) sent {:.2} MB in {:.2}s",
                w.hostname,
                w.addrport,
                total_bytes as f64 / 1_000_000.0,
                sum_time as f64 / 1_000_000.0
            );
            self.write_transaction_transfer(t.id, f, total_bytes, sum_time, "OUTPUT");
        }

        // a transfer failure sends the task elsewhere, a storage failure
        // is on the manager
        match result {
            OpOutcome::AppFailure => {
                t.update_result(TaskResultCode::OutputMissing);
            }
            OpOutcome::ManagerFailure => {
                t.update_result(TaskResultCode::OutputTransferError);
            }
            _ => {}
        }

        if result == OpOutcome::Success && f.flags.cache {
            if let Ok(info) = std::fs::metadata(&local_path) {
                let mtime = info
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                w.cache.insert(
                    f.cache_name.clone(),
                    CacheEntry {
                        kind: f.kind.tag(),
                        size: info.len() as i64,
                        mtime,
                        transfer_time: sum_time,
                    },
                );
            }
        }

        result
    }

    /// Receive one item of a streamed tree by reading its header frame
    /// and pulling the payload. `forced` overrides the local name at the
    /// top level; inner items land inside `dirname`.
    async fn get_any(
        &mut self,
        w: &mut Worker,
        t: &mut Task,
        dirname: Option<&Path>,
        forced: Option<&Path>,
        total: &mut i64,
    ) -> OpOutcome {
        let line = match self.recv_retry(w).await {
            RecvOutcome::NotProcessed(line) => line,
            _ => return OpOutcome::WorkerFailure,
        };
        let Some(frame) = parse_transfer_frame(&line) else {
            debug!(
                "{} ({}): sent invalid response to get: {}",
                w.hostname, w.addrport, line
            );
            return OpOutcome::WorkerFailure;
        };

        let local_for = |name: &str| -> PathBuf {
            match (forced, dirname) {
                (Some(p), _) => p.to_path_buf(),
                (None, Some(d)) => d.join(name),
                (None, None) => PathBuf::from(name),
            }
        };

        match frame {
            TransferFrame::File { name, size, mode } => {
                let rate = self.transfer_rate(w);
                let path = local_for(&name);
                match transfer::receive_file_payload(&mut w.conn, &path, size, mode, &rate).await {
                    Ok(OpOutcome::Success) => {
                        *total += size;
                        OpOutcome::Success
                    }
                    Ok(r) => r,
                    Err(_) => OpOutcome::WorkerFailure,
                }
            }
            TransferFrame::Symlink { name, length } => {
                let rate = self.transfer_rate(w);
                let path = local_for(&name);
                match transfer::receive_symlink_payload(&mut w.conn, &path, length, &rate).await {
                    Ok(OpOutcome::Success) => {
                        *total += length as i64;
                        OpOutcome::Success
                    }
                    Ok(r) => r,
                    Err(_) => OpOutcome::WorkerFailure,
                }
            }
            TransferFrame::Dir { name } => {
                let path = local_for(&name);
                self.get_dir_contents(w, t, &path, total).await
            }
            TransferFrame::Missing { name, errno } => {
                // one missing output does not abort the rest
                debug!(
                    "{} ({}): could not access requested file {} (errno {})",
                    w.hostname, w.addrport, name, errno
                );
                t.update_result(TaskResultCode::OutputMissing);
                OpOutcome::Success
            }
            TransferFrame::End => OpOutcome::EndOfList,
        }
    }

    /// Receive a directory's items until the `end` frame. Boxed so the
    /// mutual recursion with [`Manager::get_any`] has a finite type.
    fn get_dir_contents<'a>(
        &'a mut self,
        w: &'a mut Worker,
        t: &'a mut Task,
        dirname: &'a Path,
        total: &'a mut i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = OpOutcome> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = std::fs::create_dir_all(dirname) {
                debug!("unable to create {}: {}", dirname.display(), e);
                return OpOutcome::AppFailure;
            }
            loop {
                let r = self.get_any(w, t, Some(dirname), None, total).await;
                match r {
                    OpOutcome::Success => continue,
                    OpOutcome::EndOfList => return OpOutcome::Success,
                    other => return other,
                }
            }
        })
    }

    /// Feed a completed task into its category's statistics.
    fn accumulate_task(&mut self, t: &Task) {
        let success = t.result == TaskResultCode::Success && t.exit_code == 0;
        let exhausted = t.result == TaskResultCode::ResourceExhaustion;
        let time_send = t.time_when_commit_end.saturating_sub(t.time_when_commit_start);
        let time_receive = t.time_when_done.saturating_sub(t.time_when_retrieval);
        if success {
            self.stats.time_send_good += time_send;
            self.stats.time_receive_good += time_receive;
        }
        let c = self.category_mut(&t.category.clone());
        c.accumulate(
            t.resources_measured.as_ref(),
            success,
            exhausted,
            t.time_workers_execute_last,
            time_send,
            time_receive,
        );
        self.write_transaction_category(&t.category.clone());
    }

    fn add_task_report(&mut self, t: &Task) {
        let report = TaskReport {
            time_transfer: t
                .time_when_commit_end
                .saturating_sub(t.time_when_commit_start)
                + t.time_when_done.saturating_sub(t.time_when_retrieval),
            time_execute: t.time_workers_execute_last,
            cores: t.resources_allocated.cores.unwrap_or(0),
            memory: t.resources_allocated.memory.unwrap_or(0),
            disk: t.resources_allocated.disk.unwrap_or(0),
        };
        let cap = 50usize.max(2 * self.workers.len());
        if self.task_reports.len() >= cap {
            self.task_reports.pop_front();
        }
        self.task_reports.push_back(report);
    }

    // ------------------------------------------------------------------
    // failure handling and the state machine
    // ------------------------------------------------------------------

    async fn handle_failure(&mut self, wid: u64, tid: u64, kind: OpOutcome) {
        if kind == OpOutcome::AppFailure {
            let Some(mut w) = self.workers.remove(&wid) else {
                return;
            };
            let Some(mut t) = self.tasks.remove(&tid) else {
                self.workers.insert(wid, w);
                return;
            };
            self.handle_app_failure(&mut w, &mut t).await;
            self.tasks.insert(tid, t);
            self.workers.insert(wid, w);
        } else if let Some(w) = self.workers.remove(&wid) {
            self.finish_remove_worker(w, DisconnectReason::Failure);
        }
    }

    /// The task definition is bad: return it to the application without
    /// punishing the worker.
    async fn handle_app_failure(&mut self, w: &mut Worker, t: &mut Task) {
        self.reap_task_from_worker(w, t, TaskState::Retrieved);
        // the application may resubmit with different outputs; drop what
        // this attempt left behind
        if t.time_when_commit_end > 0 {
            let outputs = t.outputs.clone();
            for f in outputs {
                self.delete_worker_file(w, &f.cache_name).await;
            }
        }
    }

    async fn delete_worker_file(&mut self, w: &mut Worker, cache_name: &str) {
        let deadline = self.short_deadline();
        let _ = send_msg(w, &format!("unlink {}\n", cache_name), deadline).await;
        w.cache.remove(cache_name);
    }

    async fn delete_uncacheable_inputs(&mut self, w: &mut Worker, t: &Task) {
        for f in t.inputs.clone() {
            if !f.flags.cache {
                self.delete_worker_file(w, &f.cache_name).await;
            }
        }
    }

    async fn delete_uncacheable_files(&mut self, w: &mut Worker, t: &Task) {
        for f in t.inputs.iter().chain(t.outputs.iter()).cloned().collect::<Vec<_>>() {
            if !f.flags.cache {
                self.delete_worker_file(w, &f.cache_name).await;
            }
        }
    }

    /// Detach a task from its worker and move it to a new state,
    /// decommitting the resources it held.
    fn reap_task_from_worker(&mut self, w: &mut Worker, t: &mut Task, new_state: TaskState) {
        match self.worker_task_map.get(&t.id) {
            Some(&wid) if wid == w.id => {
                w.total_task_time += t.time_workers_execute_last;
            }
            _ => {
                debug!(
                    "cannot reap task {}; it is not being run by {} ({})",
                    t.id, w.hostname, w.addrport
                );
            }
        }
        w.task_boxes.remove(&t.id);
        w.current_tasks.remove(&t.id);
        self.worker_task_map.remove(&t.id);
        self.change_task_state(t, new_state);
        w.count_committed_resources();
    }

    /// Move a task between states, maintaining the per-state collections
    /// and the logs. The task is temporarily out of the task table.
    fn change_task_state(&mut self, t: &mut Task, new_state: TaskState) {
        let old_state = self
            .task_state
            .insert(t.id, new_state)
            .unwrap_or(TaskState::Unknown);

        if old_state == TaskState::Ready {
            self.ready_list.retain(|&id| id != t.id);
        }

        debug!(
            "task {} state change: {} to {}",
            t.id,
            old_state.as_str(),
            new_state.as_str()
        );

        match new_state {
            TaskState::Ready => {
                self.push_task_to_ready_list(t);
            }
            TaskState::Done => {
                self.stats.tasks_done += 1;
                if t.result != TaskResultCode::Success {
                    self.stats.tasks_failed += 1;
                }
            }
            _ => {}
        }

        self.write_transaction_task(t, new_state);
        self.log_queue_stats(false);
    }

    /// Queue a task for dispatch. Resource-exhaustion resubmissions jump
    /// to the head so large tasks do not starve behind the backlog; all
    /// other tasks are ordered by priority, ties by submission order.
    fn push_task_to_ready_list(&mut self, t: &mut Task) {
        if t.result == TaskResultCode::ResourceExhaustion {
            self.ready_list.push_front(t.id);
        } else {
            let pos = self
                .ready_list
                .iter()
                .position(|id| {
                    self.tasks
                        .get(id)
                        .map(|other| other.priority < t.priority)
                        .unwrap_or(false)
                })
                .unwrap_or(self.ready_list.len());
            self.ready_list.insert(pos, t.id);
        }
        // a reused handle starts the next attempt clean
        t.clean(false);
    }

    /// Drop ready tasks that can no longer run: past their wall-clock
    /// deadline, or out of retries.
    fn expire_waiting_tasks(&mut self) -> usize {
        let now = now_secs() as i64;
        let ids: Vec<u64> = self.ready_list.iter().copied().collect();
        let mut expired = 0;
        for tid in ids {
            let Some(mut t) = self.tasks.remove(&tid) else {
                continue;
            };
            let past_deadline = matches!(t.resources_requested.end, Some(end) if end > 0 && end <= now);
            let out_of_retries = t.max_retries > 0 && t.try_count > t.max_retries;
            if past_deadline {
                t.update_result(TaskResultCode::TaskTimeout);
                self.change_task_state(&mut t, TaskState::Retrieved);
                expired += 1;
            } else if out_of_retries {
                t.update_result(TaskResultCode::MaxRetries);
                self.change_task_state(&mut t, TaskState::Retrieved);
                expired += 1;
            }
            self.tasks.insert(tid, t);
        }
        expired
    }

    // ------------------------------------------------------------------
    // worker lifecycle
    // ------------------------------------------------------------------

    /// Remove a worker: requeue everything it ran, decommit resources,
    /// drop its cache index, and record the departure.
    fn finish_remove_worker(&mut self, mut w: Worker, reason: DisconnectReason) {
        debug!("worker {} ({}) removed", w.hostname, w.addrport);
        if w.kind == WorkerKind::Worker {
            self.stats.workers_removed += 1;
        }
        self.write_transaction_worker_leaving(&w, reason);

        let now = now_usec();
        let tids: Vec<u64> = w.current_tasks.iter().copied().collect();
        for tid in tids {
            let Some(mut t) = self.tasks.remove(&tid) else {
                continue;
            };
            if t.time_when_commit_end >= t.time_when_commit_start {
                let delta = now.saturating_sub(t.time_when_commit_end);
                t.time_workers_execute_failure += delta;
                t.time_workers_execute_all += delta;
            }
            t.clean(false);
            self.reap_task_from_worker(&mut w, &mut t, TaskState::Ready);
            self.tasks.insert(tid, t);
        }

        self.workers_with_results.remove(&w.id);
        self.stats_disconnected.absorb_worker(&w.stats);

        if let Some(factory) = &w.factory_name {
            if let Some(f) = self.factories.get_mut(factory) {
                f.connected_workers -= 1;
            }
        }

        debug!("{} workers connected in total now", self.workers.len());
    }

    /// Send `exit` and remove the worker.
    async fn shut_down_worker(&mut self, wid: u64) -> bool {
        let Some(mut w) = self.workers.remove(&wid) else {
            return false;
        };
        let deadline = self.short_deadline();
        let _ = send_msg(&mut w, "exit\n", deadline).await;
        self.finish_remove_worker(w, DisconnectReason::Explicit);
        self.stats.workers_released += 1;
        true
    }

    /// Send keepalive checks to quiet workers and drop the unresponsive.
    async fn ask_for_workers_updates(&mut self) {
        if self.config.timeouts.keepalive_interval == 0 {
            return;
        }
        let now = now_usec();
        let interval = self.config.timeouts.keepalive_interval;
        let timeout = self.config.timeouts.keepalive_timeout;

        let ids: Vec<u64> = self.workers.keys().copied().collect();
        for wid in ids {
            let Some(mut w) = self.workers.remove(&wid) else {
                continue;
            };

            // a connection that never completed the protocol hello only
            // gets the keepalive timeout to do so
            if w.hostname == "unknown" {
                if now.saturating_sub(w.start_time) / 1_000_000 >= timeout {
                    debug!(
                        "removing worker ({}): hasn't sent its initialization in more than {} s",
                        w.addrport, timeout
                    );
                    self.stats.workers_lost += 1;
                    self.finish_remove_worker(w, DisconnectReason::Failure);
                    continue;
                }
                self.workers.insert(wid, w);
                continue;
            }

            if w.last_msg_recv_time > w.last_update_msg_time {
                // the worker replied since the last check; due for another?
                let elapsed = now.saturating_sub(w.last_update_msg_time) / 1_000_000;
                if elapsed >= interval {
                    let deadline = self.short_deadline();
                    if send_msg(&mut w, "check\n", deadline).await.is_err() {
                        debug!(
                            "failed to send keepalive check to worker {} ({})",
                            w.hostname, w.addrport
                        );
                        self.finish_remove_worker(w, DisconnectReason::Failure);
                        continue;
                    }
                    debug!("sent keepalive check to worker {} ({})", w.hostname, w.addrport);
                    w.last_update_msg_time = now;
                }
            } else if self.link_poll_end > w.last_update_msg_time
                && self.link_poll_end.saturating_sub(w.last_update_msg_time) / 1_000_000 >= timeout
            {
                debug!(
                    "removing worker {} ({}): hasn't responded to keepalive check for more than {} s",
                    w.hostname, w.addrport, timeout
                );
                self.stats.workers_lost += 1;
                self.finish_remove_worker(w, DisconnectReason::Failure);
                continue;
            }
            self.workers.insert(wid, w);
        }
    }

    /// Kill tasks running far past their category's average, and block
    /// the host of a worker that is slow twice in a row.
    async fn abort_slow_workers(&mut self) -> usize {
        let mut fast_abort_active = false;
        for c in self.categories.values_mut() {
            c.update_average_task_time();
            if c.fast_abort > 0.0 {
                fast_abort_active = true;
            }
        }
        if !fast_abort_active {
            return 0;
        }
        let default_multiplier = self
            .categories
            .get("default")
            .map(|c| c.fast_abort)
            .unwrap_or(-1.0);

        let current = now_usec();
        let mut removed = 0;
        let running: Vec<(u64, u64)> = self
            .worker_task_map
            .iter()
            .map(|(tid, wid)| (*tid, *wid))
            .collect();

        for (tid, wid) in running {
            let Some((runtime, average, multiplier, fast_abort_count)) = ({
                self.tasks.get(&tid).and_then(|t| {
                    let c = self.categories.get(&t.category)?;
                    if c.fast_abort == 0.0 {
                        return None;
                    }
                    let multiplier = if c.fast_abort > 0.0 {
                        c.fast_abort
                    } else if default_multiplier > 0.0 {
                        default_multiplier
                    } else {
                        return None;
                    };
                    if c.average_task_time < 1 {
                        return None;
                    }
                    Some((
                        current.saturating_sub(t.time_when_commit_start),
                        c.average_task_time,
                        multiplier,
                        t.fast_abort_count,
                    ))
                })
            }) else {
                continue;
            };

            if (runtime as f64) < average as f64 * (multiplier + fast_abort_count as f64) {
                continue;
            }

            debug!("task {} is taking too long; removing from worker", tid);
            self.cancel_task_on_worker(tid, TaskState::Ready).await;
            if let Some(t) = self.tasks.get_mut(&tid) {
                t.fast_abort_count += 1;
                // one task may not mark two different workers as suspect
                if t.fast_abort_count > 1 {
                    continue;
                }
            }

            let alarm = self
                .workers
                .get(&wid)
                .map(|w| w.fast_abort_alarm)
                .unwrap_or(false);
            if alarm {
                // second slow task in a row: the worker is the problem
                let host = self.workers.get(&wid).map(|w| w.hostname.clone());
                if let Some(host) = host {
                    debug!(
                        "removing worker {}: takes too long to execute tasks \
                         (runtime {:.2}s, category average {:.2}s)",
                        host,
                        runtime as f64 / 1_000_000.0,
                        average as f64 / 1_000_000.0
                    );
                    self.block_host_with_timeout(
                        &host,
                        self.config.fast_abort.slow_worker_blocklist_timeout,
                    );
                }
                if let Some(w) = self.workers.remove(&wid) {
                    self.finish_remove_worker(w, DisconnectReason::FastAbort);
                    self.stats.workers_fast_aborted += 1;
                    removed += 1;
                }
            } else if let Some(w) = self.workers.get_mut(&wid) {
                w.fast_abort_alarm = true;
            }
        }
        removed
    }

    /// Release draining workers that have gone idle.
    async fn abort_drained_workers(&mut self) -> usize {
        let ids: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, w)| w.draining && w.current_tasks.is_empty())
            .map(|(id, _)| *id)
            .collect();
        let mut removed = 0;
        for wid in ids {
            if self.shut_down_worker(wid).await {
                removed += 1;
            }
        }
        removed
    }

    /// Kill a running task on its worker and move it to `new_state`.
    /// The ack is not awaited; state is reaped immediately.
    async fn cancel_task_on_worker(&mut self, tid: u64, new_state: TaskState) -> bool {
        let Some(&wid) = self.worker_task_map.get(&tid) else {
            return false;
        };
        let Some(mut w) = self.workers.remove(&wid) else {
            return false;
        };
        let Some(mut t) = self.tasks.remove(&tid) else {
            self.workers.insert(wid, w);
            return false;
        };

        let deadline = self.short_deadline();
        let _ = send_msg(&mut w, &format!("kill {}\n", tid), deadline).await;

        // partial outputs are worthless; uncacheable inputs go with them
        self.delete_uncacheable_inputs(&mut w, &t).await;
        let outputs = t.outputs.clone();
        for f in outputs {
            self.delete_worker_file(&mut w, &f.cache_name).await;
        }

        self.reap_task_from_worker(&mut w, &mut t, new_state);
        self.tasks.insert(tid, t);
        self.workers.insert(wid, w);
        true
    }

    // ------------------------------------------------------------------
    // catalog and status reporting
    // ------------------------------------------------------------------

    async fn update_catalog(&mut self, force: bool) {
        let now = now_secs();
        if !force
            && now.saturating_sub(self.catalog_last_update)
                < self.config.manager.catalog_update_interval
        {
            return;
        }
        if self.catalog.is_none() {
            self.catalog = CatalogClient::new(&self.config.manager.catalog_hosts).ok();
        }
        let Some(client) = self.catalog.clone() else {
            return;
        };

        let full = self.queue_status_json();
        let lean = self.queue_lean_json();
        debug!(
            "advertising manager status to the catalog server(s) at {}",
            self.config.manager.catalog_hosts
        );
        client.advertise(&full, &lean).await;

        if self.fetch_factory {
            self.update_catalog_factories(&client).await;
        }
        self.catalog_last_update = now;
    }

    async fn update_catalog_factories(&mut self, client: &CatalogClient) {
        let names = self.factories.names();
        if names.is_empty() {
            return;
        }
        debug!("retrieving factory info from catalog server(s)");
        self.factories.begin_catalog_round();
        let records = client.query_factories(&names).await;
        for rec in records {
            if self.factories.apply_catalog_update(&rec.name, rec.max_workers) {
                self.trim_factory_workers(&rec.name).await;
            }
        }
        for name in self.factories.drop_stale() {
            debug!("dropped stale factory {}", name);
        }
    }

    /// Release idle workers of a factory until it is back under its cap.
    async fn trim_factory_workers(&mut self, factory: &str) {
        let mut trimmed = 0;
        loop {
            if !self.factories.over_cap(factory) {
                break;
            }
            let idle = self
                .workers
                .iter()
                .find(|(_, w)| {
                    w.factory_name.as_deref() == Some(factory) && w.current_tasks.is_empty()
                })
                .map(|(id, _)| *id);
            match idle {
                Some(wid) => {
                    self.shut_down_worker(wid).await;
                    trimmed += 1;
                }
                None => break,
            }
        }
        debug!("trimmed {} workers from {}", trimmed, factory);
    }

    /// Full catalog advertisement object.
    fn queue_status_json(&self) -> serde_json::Value {
        let s = self.stats();
        let mut obj = serde_json::Map::new();
        obj.insert("type".into(), "wq_master".into());
        if let Some(name) = &self.name {
            obj.insert("project".into(), name.clone().into());
        }
        obj.insert(
            "starttime".into(),
            (self.stats.time_when_started / 1_000_000).into(),
        );
        obj.insert("owner".into(), OWNER.clone().into());
        obj.insert("version".into(), crate::VERSION.into());
        obj.insert("port".into(), self.port.into());
        obj.insert("priority".into(), self.config.manager.priority.into());
        obj.insert("manager_id".into(), self.instance_id.clone().into());
        obj.insert("ssl".into(), self.tls.is_some().into());

        obj.insert("workers".into(), s.workers_connected.into());
        obj.insert("workers_connected".into(), s.workers_connected.into());
        obj.insert("workers_init".into(), s.workers_init.into());
        obj.insert("workers_idle".into(), s.workers_idle.into());
        obj.insert("workers_busy".into(), s.workers_busy.into());
        obj.insert("workers_able".into(), s.workers_able.into());
        obj.insert("workers_joined".into(), s.workers_joined.into());
        obj.insert("workers_removed".into(), s.workers_removed.into());
        obj.insert("workers_released".into(), s.workers_released.into());
        obj.insert("workers_idled_out".into(), s.workers_idled_out.into());
        obj.insert("workers_fast_aborted".into(), s.workers_fast_aborted.into());
        obj.insert("workers_lost".into(), s.workers_lost.into());
        if let Some(blocked) = self.blocklist.to_json() {
            obj.insert("workers_blocked".into(), blocked);
        }

        obj.insert("tasks_waiting".into(), s.tasks_waiting.into());
        obj.insert("tasks_on_workers".into(), s.tasks_on_workers.into());
        obj.insert("tasks_running".into(), s.tasks_running.into());
        obj.insert("tasks_with_results".into(), s.tasks_with_results.into());
        obj.insert("tasks_submitted".into(), s.tasks_submitted.into());
        obj.insert("tasks_dispatched".into(), s.tasks_dispatched.into());
        obj.insert("tasks_done".into(), s.tasks_done.into());
        obj.insert("tasks_failed".into(), s.tasks_failed.into());
        obj.insert("tasks_cancelled".into(), s.tasks_cancelled.into());
        obj.insert("tasks_complete".into(), s.tasks_done.into());
        obj.insert(
            "tasks_exhausted_attempts".into(),
            s.tasks_exhausted_attempts.into(),
        );

        obj.insert("bytes_sent".into(), s.bytes_sent.into());
        obj.insert("bytes_received".into(), s.bytes_received.into());
        obj.insert("bandwidth".into(), s.bandwidth.into());
        obj.insert("capacity_tasks".into(), s.capacity_tasks.into());
        obj.insert("capacity_cores".into(), s.capacity_cores.into());
        obj.insert("capacity_memory".into(), s.capacity_memory.into());
        obj.insert("capacity_disk".into(), s.capacity_disk.into());
        obj.insert("capacity_weighted".into(), s.capacity_weighted.into());
        obj.insert("manager_load".into(), s.manager_load.into());

        self.aggregate_resources().to_json_fields(&mut obj);
        obj.insert("categories".into(), self.categories_json());

        serde_json::Value::Object(obj)
    }

    /// Lean advertisement: only what factories and the status tools need.
    fn queue_lean_json(&self) -> serde_json::Value {
        let s = self.stats();
        serde_json::json!({
            "type": "wq_master",
            "project": self.name.clone().unwrap_or_default(),
            "starttime": self.stats.time_when_started / 1_000_000,
            "port": self.port,
            "priority": self.config.manager.priority,
            "owner": OWNER.clone(),
            "version": crate::VERSION,
            "ssl": self.tls.is_some(),
            "manager_id": self.instance_id,
            "tasks_waiting": s.tasks_waiting,
            "tasks_on_workers": s.tasks_on_workers,
            "tasks_running": s.tasks_running,
            "tasks_complete": s.tasks_done,
            "workers": s.workers_connected,
            "workers_connected": s.workers_connected,
            "workers_busy": s.workers_busy,
            "capacity_weighted": s.capacity_weighted,
        })
    }

    fn categories_json(&self) -> serde_json::Value {
        let mut out = Vec::new();
        for (name, c) in &self.categories {
            let waiting = self.count_category_state(name, TaskState::Ready);
            let running = self.count_category_state(name, TaskState::Running);
            out.push(serde_json::json!({
                "category": name,
                "allocation_mode": c.mode.as_str(),
                "tasks_waiting": waiting,
                "tasks_running": running,
                "tasks_done": c.stats.tasks_done,
                "tasks_failed": c.stats.tasks_failed,
                "first_allocation": c.first_allocation().to_json(),
                "max_allocation": c.max_allocation().to_json(),
                "average_task_time_us": c.average_task_time,
            }));
        }
        serde_json::Value::Array(out)
    }

    fn count_category_state(&self, category: &str, state: TaskState) -> usize {
        self.task_state
            .iter()
            .filter(|(_, s)| **s == state)
            .filter(|(id, _)| {
                self.tasks
                    .get(id)
                    .map(|t| t.category == category)
                    .unwrap_or(false)
            })
            .count()
    }

    fn worker_json(&self, w: &Worker) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("hostname".into(), w.hostname.clone().into());
        obj.insert("address_port".into(), w.addrport.clone().into());
        obj.insert("os".into(), w.os.clone().into());
        obj.insert("arch".into(), w.arch.clone().into());
        obj.insert("version".into(), w.version.clone().into());
        obj.insert("draining".into(), w.draining.into());
        obj.insert(
            "current_tasks".into(),
            w.current_tasks.iter().copied().collect::<Vec<u64>>().into(),
        );
        obj.insert("total_tasks_complete".into(), w.total_tasks_complete.into());
        if let Some(f) = &w.factory_name {
            obj.insert("factory_name".into(), f.clone().into());
        }
        w.resources.to_json_fields(&mut obj);
        serde_json::Value::Object(obj)
    }

    fn task_json(&self, t: &Task, state: TaskState) -> serde_json::Value {
        serde_json::json!({
            "taskid": t.id,
            "state": state.as_str(),
            "command": t.command,
            "category": t.category,
            "tag": t.tag,
            "result": t.result.as_str(),
            "exit_code": t.exit_code,
            "try_count": t.try_count,
            "priority": t.priority,
            "host": t.hostname,
            "address_port": t.addrport,
            "time_when_submitted": t.time_when_submitted,
            "time_when_commit_start": t.time_when_commit_start,
            "time_when_commit_end": t.time_when_commit_end,
            "current_time": now_usec(),
            "resources_requested": t.resources_requested.to_json(),
            "resources_allocated": t.resources_allocated.to_json(),
        })
    }

    /// Build the JSON document for one status endpoint.
    fn construct_status_message(&self, request: &str) -> Option<serde_json::Value> {
        match request {
            "queue_status" | "queue" | "resources_status" => {
                Some(serde_json::Value::Array(vec![self.queue_status_json()]))
            }
            "task_status" | "tasks" => Some(serde_json::Value::Array(
                self.tasks
                    .iter()
                    .map(|(id, t)| self.task_json(t, self.task_state(*id)))
                    .collect(),
            )),
            "worker_status" | "workers" => Some(serde_json::Value::Array(
                self.workers
                    .values()
                    .filter(|w| w.hostname != "unknown" && w.kind == WorkerKind::Worker)
                    .map(|w| self.worker_json(w))
                    .collect(),
            )),
            "wable_status" | "categories" => Some(self.categories_json()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // diagnostics and logs
    // ------------------------------------------------------------------

    fn print_password_warning(&mut self) {
        if self.password_warned {
            return;
        }
        self.password_warned = true;
        if self.password.is_none() && self.name.is_some() {
            warn!("this manager is visible to the public; set a password to restrict workers");
        }
        if self.tls.is_none() {
            warn!("using plain-text communication with workers; configure a key and cert to encrypt");
        }
    }

    /// Periodically report ready tasks that fit no connected worker.
    fn print_large_tasks_warning(&mut self) {
        let current = now_usec();
        if current.saturating_sub(self.time_last_large_tasks_check) < LARGE_TASK_CHECK_INTERVAL {
            return;
        }
        self.time_last_large_tasks_check = current;
        if self.workers.is_empty() {
            return;
        }

        let opts = self.scheduler_opts();
        let mut unfit_core = 0;
        let mut unfit_mem = 0;
        let mut unfit_disk = 0;
        let mut unfit_gpu = 0;
        for tid in &self.ready_list {
            let Some(t) = self.tasks.get(tid) else {
                continue;
            };
            let Some(c) = self.categories.get(&t.category) else {
                continue;
            };
            let bits = scheduler::task_larger_than_any_worker(&self.workers, t, c, &opts);
            if bits & CORES_BIT != 0 {
                unfit_core += 1;
            }
            if bits & MEMORY_BIT != 0 {
                unfit_mem += 1;
            }
            if bits & DISK_BIT != 0 {
                unfit_disk += 1;
            }
            if bits & GPUS_BIT != 0 {
                unfit_gpu += 1;
            }
        }

        if unfit_core + unfit_mem + unfit_disk + unfit_gpu > 0 {
            warn!("there are waiting tasks that cannot fit any currently connected worker:");
            if unfit_core > 0 {
                warn!("    {} waiting task(s) need more cores than any worker has", unfit_core);
            }
            if unfit_mem > 0 {
                warn!("    {} waiting task(s) need more memory than any worker has", unfit_mem);
            }
            if unfit_disk > 0 {
                warn!("    {} waiting task(s) need more disk than any worker has", unfit_disk);
            }
            if unfit_gpu > 0 {
                warn!("    {} waiting task(s) need more gpus than any worker has", unfit_gpu);
            }
        }
    }

    fn log_queue_stats(&mut self, force: bool) {
        let now = now_usec();
        if !force && now.saturating_sub(self.time_last_log_stats) < 1_000_000 {
            return;
        }
        self.time_last_log_stats = now;
        let snapshot = self.stats();
        if let Some(log) = &mut self.stats_log {
            if let Err(e) = log.append(now, &snapshot) {
                warn!("could not write stats log: {}", e);
            }
        }
    }

    fn write_transaction(&mut self, record: &str) {
        if let Some(log) = &mut self.txn_log {
            if let Err(e) = log.write(now_usec(), record) {
                warn!("could not write transaction log: {}", e);
            }
        }
    }

    fn write_transaction_task(&mut self, t: &Task, state: TaskState) {
        if self.txn_log.is_none() {
            return;
        }
        let record = match state {
            TaskState::Ready => format!(
                "TASK {} WAITING {} {} {}",
                t.id,
                t.category,
                t.resource_request.as_str(),
                t.resources_requested.to_json()
            ),
            TaskState::Running => {
                let addr = t.addrport.as_deref().unwrap_or("worker-info-not-available");
                format!(
                    "TASK {} RUNNING {} {} {}",
                    t.id,
                    addr,
                    t.resource_request.as_str(),
                    t.resources_allocated.to_json()
                )
            }
            TaskState::WaitingRetrieval => {
                let addr = t.addrport.as_deref().unwrap_or("worker-info-not-available");
                format!("TASK {} WAITING_RETRIEVAL {}", t.id, addr)
            }
            TaskState::Retrieved | TaskState::Done => {
                let limits = t
                    .limits_exceeded
                    .map(|l| l.to_json().to_string())
                    .unwrap_or_else(|| "{}".to_string());
                let measured = t
                    .resources_measured
                    .map(|m| m.to_json().to_string())
                    .unwrap_or_else(|| "{}".to_string());
                format!(
                    "TASK {} {} {} {} {} {}",
                    t.id,
                    state.as_str(),
                    t.result.as_str(),
                    t.exit_code,
                    limits,
                    measured
                )
            }
            TaskState::Canceled => format!("TASK {} CANCELED", t.id),
            TaskState::Unknown => return,
        };
        self.write_transaction(&record);
    }

    fn write_transaction_category(&mut self, name: &str) {
        if self.txn_log.is_none() {
            return;
        }
        let Some(c) = self.categories.get(name) else {
            return;
        };
        let records = [
            format!("CATEGORY {} MAX {}", name, c.max_allocation().to_json()),
            format!(
                "CATEGORY {} MIN {}",
                name,
                c.min_allocation_user.to_json()
            ),
            format!(
                "CATEGORY {} FIRST {} {}",
                name,
                c.mode.as_str(),
                c.first_allocation().to_json()
            ),
        ];
        for r in records {
            self.write_transaction(&r);
        }
    }

    fn write_transaction_worker_leaving(&mut self, w: &Worker, reason: DisconnectReason) {
        let id = w.worker_uuid.clone().unwrap_or_else(|| w.addrport.clone());
        self.write_transaction(&format!(
            "WORKER {} {}  DISCONNECTION {}",
            id,
            w.addrport,
            reason.as_str()
        ));
    }

    fn write_transaction_worker_resources(&mut self, w: &Worker) {
        let id = w.worker_uuid.clone().unwrap_or_else(|| w.addrport.clone());
        let resources = serde_json::json!({
            "cores": w.resources.cores.total,
            "memory": w.resources.memory.total,
            "disk": w.resources.disk.total,
        });
        self.write_transaction(&format!("WORKER {} RESOURCES {}", id, resources));
    }

    fn write_transaction_transfer(
        &mut self,
        task_id: u64,
        f: &TaskFile,
        size_bytes: i64,
        time_usec: u64,
        direction: &str,
    ) {
        if self.txn_log.is_none() {
            return;
        }
        self.write_transaction(&format!(
            "TRANSFER {} {} {} {:.6} {:.6} {}",
            direction,
            task_id,
            if f.flags.cache { 1 } else { 0 },
            size_bytes as f64 / 1_000_000.0,
            time_usec as f64 / 1_000_000.0,
            f.remote_name
        ));
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.write_transaction("MANAGER END");
    }
}
