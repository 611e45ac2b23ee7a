//! Worker selection: the fit predicate, proportional resource boxing,
//! and the five dispatch policies.
use crate::core::blocklist::Blocklist;
use crate::core::category::{AllocationMode, Category};
use crate::core::factory::FactoryTable;
use crate::core::resources::{overcommitted_total, ResourceSummary};
use crate::core::task::Task;
use crate::core::worker::Worker;
use serde::Serialize;
use std::collections::HashMap;

/// How the manager picks a worker for the next ready task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulePolicy {
    /// First fitting worker in table order.
    Fcfs,
    /// Prefer the worker holding the most bytes of the task's cached inputs.
    Files,
    /// Prefer the worker with the lowest mean task completion time.
    Time,
    /// Prefer the worker with the most free resources.
    WorstFit,
    /// Uniform choice over fitting workers.
    Random,
}

impl std::str::FromStr for SchedulePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fcfs" => Ok(SchedulePolicy::Fcfs),
            "files" => Ok(SchedulePolicy::Files),
            "time" => Ok(SchedulePolicy::Time),
            "worst" | "worst-fit" => Ok(SchedulePolicy::WorstFit),
            "random" | "rand" => Ok(SchedulePolicy::Random),
            other => Err(format!("unknown scheduling policy: {}", other)),
        }
    }
}

/// Scheduler tuning shared across policies.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOpts {
    pub policy: SchedulePolicy,
    /// Overcommit factor for cores/memory/gpus; disk never overcommits.
    pub submit_multiplier: f64,
    /// Scale unspecified dimensions so an integer number of tasks tile
    /// the worker.
    pub force_proportional: bool,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        SchedulerOpts {
            policy: SchedulePolicy::Fcfs,
            submit_multiplier: 1.0,
            force_proportional: false,
        }
    }
}

/// Tiny deterministic generator for the RANDOM policy; the manager seeds
/// it once at startup.
#[derive(Debug, Clone)]
pub struct XorShift64(pub u64);

impl XorShift64 {
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0.max(1);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

pub const CORES_BIT: u8 = 1 << 0;
pub const MEMORY_BIT: u8 = 1 << 1;
pub const DISK_BIT: u8 = 1 << 2;
pub const GPUS_BIT: u8 = 1 << 3;

/// Compute the resource box a task would occupy on a worker.
///
/// Starts from the category allocation for the task's request level. When
/// the category does not learn allocations (FIXED) or proportional mode is
/// forced, unspecified dimensions scale with the largest specified
/// proportion of the worker; otherwise unspecified dimensions take the
/// whole worker. The result never drops below the task's explicit request
/// or the category floor.
pub fn task_worker_box(
    t: &Task,
    c: &Category,
    w: &Worker,
    opts: &SchedulerOpts,
) -> ResourceSummary {
    let max = c.allocation(t.resource_request, &t.resources_requested);
    let mut floor = t.resources_requested;
    floor.merge_max(&c.min_allocation_user);

    let mut limits = ResourceSummary::new();
    limits.merge_override(&max);

    let wr = &w.resources;
    let mut use_whole_worker = true;

    if opts.force_proportional || c.mode == AllocationMode::Fixed {
        let mut max_proportion: f64 = -1.0;
        for (lim, largest) in [
            (limits.cores, wr.cores.largest),
            (limits.memory, wr.memory.largest),
            (limits.disk, wr.disk.largest),
            (limits.gpus, wr.gpus.largest),
        ] {
            if largest > 0 {
                if let Some(l) = lim {
                    max_proportion = max_proportion.max(l as f64 / largest as f64);
                }
            }
        }

        // above 1 the task does not fit this worker anyway; let the fit
        // check reject it against the whole-worker box
        if max_proportion > 1.0 {
            use_whole_worker = true;
        } else if max_proportion > 0.0 {
            use_whole_worker = false;

            let mut p = max_proportion;
            if opts.force_proportional {
                // an integer number of tasks must tile the worker
                p = 1.0 / (1.0 / p).floor();
            }

            let scaled = |largest: i64| ((largest as f64 * p).floor() as i64).max(1);

            if opts.force_proportional || limits.cores.is_none() {
                limits.cores = Some(if limits.gpus.unwrap_or(0) > 0 {
                    0
                } else {
                    scaled(wr.cores.largest)
                });
            }
            if limits.gpus.is_none() {
                limits.gpus = Some(0);
            }
            if opts.force_proportional || limits.memory.is_none() {
                limits.memory = Some(scaled(wr.memory.largest));
            }
            if opts.force_proportional || limits.disk.is_none() {
                limits.disk = Some(scaled(wr.disk.largest));
            }
        }
    }

    if limits.cores.unwrap_or(0) < 1
        && limits.gpus.unwrap_or(0) < 1
        && limits.memory.unwrap_or(0) < 1
        && limits.disk.unwrap_or(0) < 1
    {
        use_whole_worker = true;
    }

    let meets_largest = |lim: Option<i64>, largest: i64| matches!(lim, Some(v) if v > 0 && v >= largest);
    if meets_largest(limits.cores, wr.cores.largest)
        || meets_largest(limits.gpus, wr.gpus.largest)
        || meets_largest(limits.memory, wr.memory.largest)
        || meets_largest(limits.disk, wr.disk.largest)
    {
        use_whole_worker = true;
    }

    if use_whole_worker {
        if limits.cores.unwrap_or(0) <= 0 {
            limits.cores = Some(if limits.gpus.unwrap_or(0) > 0 {
                0
            } else {
                wr.cores.largest
            });
        }
        if limits.gpus.unwrap_or(0) <= 0 {
            limits.gpus = Some(0);
        }
        if limits.memory.unwrap_or(0) <= 0 {
            limits.memory = Some(wr.memory.largest);
        }
        if limits.disk.unwrap_or(0) <= 0 {
            limits.disk = Some(wr.disk.largest);
        }
    }

    limits.merge_max(&floor);
    limits
}

/// The fit predicate: can this worker take this task right now?
pub fn worker_fits(
    w: &Worker,
    t: &Task,
    c: &Category,
    opts: &SchedulerOpts,
    blocklist: &Blocklist,
    factories: &FactoryTable,
    now_secs: u64,
) -> bool {
    // worker must have reported resources and at least one worker slot
    if w.resources.tag < 0 || w.resources.workers.total < 1 {
        return false;
    }

    if w.draining {
        return false;
    }

    if let Some(f) = &w.factory_name {
        if factories.over_cap(f) {
            return false;
        }
    }

    if blocklist.is_blocked(&w.hostname) {
        return false;
    }

    let b = task_worker_box(t, c, w, opts);
    let r = &w.resources;

    // disk is never overcommitted
    if r.disk.inuse + b.disk.unwrap_or(0) > r.disk.total {
        return false;
    }
    for (need, res) in [
        (b.cores.unwrap_or(0), &r.cores),
        (b.memory.unwrap_or(0), &r.memory),
        (b.gpus.unwrap_or(0), &r.gpus),
    ] {
        if need > res.total
            || res.inuse + need > overcommitted_total(res.total, opts.submit_multiplier)
        {
            return false;
        }
    }

    // the worker's declared end time must leave room for the task
    if w.end_time > 0 {
        if let Some(end) = t.resources_requested.end {
            if w.end_time < end {
                return false;
            }
        }
        if t.min_running_time > 0 && w.end_time - (now_secs as i64) < t.min_running_time {
            return false;
        }
    }

    t.features.iter().all(|f| w.features.contains(f))
}

/// Pick the best worker for a task under the configured policy.
/// Returns the worker id, or None when nothing fits.
pub fn find_best_worker(
    workers: &HashMap<u64, Worker>,
    t: &Task,
    c: &Category,
    opts: &SchedulerOpts,
    blocklist: &Blocklist,
    factories: &FactoryTable,
    now_secs: u64,
    rng: &mut XorShift64,
) -> Option<u64> {
    let fitting = || {
        workers
            .values()
            .filter(|w| worker_fits(w, t, c, opts, blocklist, factories, now_secs))
    };

    match opts.policy {
        SchedulePolicy::Fcfs => fitting().next().map(|w| w.id),
        SchedulePolicy::Files => fitting()
            .map(|w| (w.cached_input_bytes(&t.inputs), w.id))
            .max_by_key(|&(bytes, _)| bytes)
            .map(|(_, id)| id),
        SchedulePolicy::Time => {
            let best = fitting()
                .filter_map(|w| w.mean_task_time().map(|mt| (mt, w.id)))
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, id)| id);
            best.or_else(|| fitting().next().map(|w| w.id))
        }
        SchedulePolicy::WorstFit => fitting()
            .map(|w| {
                let r = &w.resources;
                (
                    (
                        r.cores.total - r.cores.inuse,
                        r.memory.total - r.memory.inuse,
                        r.disk.total - r.disk.inuse,
                        r.gpus.total - r.gpus.inuse,
                    ),
                    w.id,
                )
            })
            .max_by_key(|&(free, _)| free)
            .map(|(_, id)| id),
        SchedulePolicy::Random => {
            let ids: Vec<u64> = fitting().map(|w| w.id).collect();
            if ids.is_empty() {
                None
            } else {
                Some(ids[(rng.next_u64() % ids.len() as u64) as usize])
            }
        }
    }
}

/// Which dimensions of a task exceed a worker's total capacity. Zero
/// means the task could run there once resources free up.
pub fn task_larger_than_worker(t: &Task, c: &Category, w: &Worker, opts: &SchedulerOpts) -> u8 {
    if w.resources.tag < 0 {
        return 0;
    }
    let b = task_worker_box(t, c, w, opts);
    let mut set = 0;
    if w.resources.cores.total < b.cores.unwrap_or(0) {
        set |= CORES_BIT;
    }
    if w.resources.memory.total < b.memory.unwrap_or(0) {
        set |= MEMORY_BIT;
    }
    if w.resources.disk.total < b.disk.unwrap_or(0) {
        set |= DISK_BIT;
    }
    if w.resources.gpus.total < b.gpus.unwrap_or(0) {
        set |= GPUS_BIT;
    }
    set
}

/// Dimensions for which no connected worker could ever hold the task.
/// Zero when at least one worker is large enough.
pub fn task_larger_than_any_worker(
    workers: &HashMap<u64, Worker>,
    t: &Task,
    c: &Category,
    opts: &SchedulerOpts,
) -> u8 {
    let mut bits = 0;
    for w in workers.values() {
        let set = task_larger_than_worker(t, c, w, opts);
        if set == 0 {
            return 0;
        }
        bits |= set;
    }
    bits
}
