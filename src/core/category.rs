//! Per-category resource statistics and allocation learning.
//!
//! Every completed task feeds its measured peak usage into its category.
//! From the accumulated samples the category derives two allocations: the
//! `first` allocation requested on a fresh attempt, and the `max`
//! allocation used after a resource-exhaustion retry. The mode controls
//! how the first allocation is chosen.
use crate::core::resources::ResourceSummary;
use crate::core::task::AllocationLevel;
use serde::Serialize;

/// How a category picks the first allocation for new tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationMode {
    /// No learning: tasks run with whatever they explicitly request.
    Fixed,
    /// First attempt already uses the maximum allocation.
    Max,
    /// Pick the first allocation minimizing expected wasted resources.
    MinWaste,
    /// Pick the first allocation maximizing expected task throughput.
    MaxThroughput,
}

impl AllocationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationMode::Fixed => "FIXED",
            AllocationMode::Max => "MAX",
            AllocationMode::MinWaste => "MIN_WASTE",
            AllocationMode::MaxThroughput => "MAX_THROUGHPUT",
        }
    }
}

/// Samples required before a learned first allocation is trusted.
const MIN_SAMPLES: usize = 10;

/// Bound on retained samples; older samples age out first.
const MAX_SAMPLES: usize = 512;

/// Completed tasks required before fast-abort may trigger.
pub const FAST_ABORT_MIN_SAMPLES: u64 = 10;

/// Aggregate execution statistics a category keeps for fast-abort and
/// capacity reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryStats {
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub tasks_exhausted_attempts: u64,
    /// Sums over successful tasks, microseconds.
    pub time_workers_execute_good: u64,
    pub time_send_good: u64,
    pub time_receive_good: u64,
}

/// One task category: accumulated usage history and allocation policy.
#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub mode: AllocationMode,
    /// Fast-abort multiplier: negative inherits the default category,
    /// zero disables, positive activates.
    pub fast_abort: f64,
    /// User-declared ceiling per task.
    pub max_allocation_user: ResourceSummary,
    /// User-declared floor per task.
    pub min_allocation_user: ResourceSummary,
    /// User-provided guess used before enough samples exist.
    pub first_allocation_guess: ResourceSummary,
    /// Largest usage observed in any single task.
    pub max_seen: ResourceSummary,
    /// Peak usage of recent completed tasks.
    samples: Vec<ResourceSummary>,
    pub stats: CategoryStats,
    /// Mean completion time over finished tasks, microseconds. Recomputed
    /// by the fast-abort sweep; zero when below the sample floor.
    pub average_task_time: u64,
}

impl Category {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Category {
            name: name.into(),
            mode: AllocationMode::Fixed,
            fast_abort: -1.0,
            max_allocation_user: ResourceSummary::new(),
            min_allocation_user: ResourceSummary::new(),
            first_allocation_guess: ResourceSummary::new(),
            max_seen: ResourceSummary::new(),
            samples: Vec::new(),
            stats: CategoryStats::default(),
            average_task_time: 0,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record one completed task: measured peak usage plus timing used by
    /// the fast-abort heuristic.
    pub fn accumulate(
        &mut self,
        measured: Option<&ResourceSummary>,
        success: bool,
        exhausted: bool,
        time_execute: u64,
        time_send: u64,
        time_receive: u64,
    ) {
        if let Some(m) = measured {
            self.max_seen.merge_max(m);
            if self.samples.len() == MAX_SAMPLES {
                self.samples.remove(0);
            }
            self.samples.push(*m);
        }
        if exhausted {
            self.stats.tasks_exhausted_attempts += 1;
        }
        if success {
            self.stats.tasks_done += 1;
            self.stats.time_workers_execute_good += time_execute;
            self.stats.time_send_good += time_send;
            self.stats.time_receive_good += time_receive;
        } else {
            self.stats.tasks_failed += 1;
        }
    }

    /// Recompute the mean completion time; zero below the sample floor.
    pub fn update_average_task_time(&mut self) {
        if self.stats.tasks_done < FAST_ABORT_MIN_SAMPLES {
            self.average_task_time = 0;
        } else {
            self.average_task_time = (self.stats.time_workers_execute_good
                + self.stats.time_send_good
                + self.stats.time_receive_good)
                / self.stats.tasks_done;
        }
    }

    /// The hard ceiling for this category: the user cap, filled in from
    /// the largest usage seen.
    pub fn max_allocation(&self) -> ResourceSummary {
        let mut m = self.max_seen;
        m.merge_override(&self.max_allocation_user);
        m
    }

    /// The allocation to request on a fresh attempt.
    pub fn first_allocation(&self) -> ResourceSummary {
        match self.mode {
            AllocationMode::Fixed => self.first_allocation_guess,
            AllocationMode::Max => {
                let mut m = self.max_allocation();
                m.merge_max(&self.first_allocation_guess);
                m
            }
            AllocationMode::MinWaste | AllocationMode::MaxThroughput => {
                if self.samples.len() < MIN_SAMPLES {
                    return self.first_allocation_guess;
                }
                let mut alloc = self.first_allocation_guess;
                alloc.cores = self.learn_dimension(|s| s.cores).or(alloc.cores);
                alloc.memory = self.learn_dimension(|s| s.memory).or(alloc.memory);
                alloc.disk = self.learn_dimension(|s| s.disk).or(alloc.disk);
                alloc.gpus = self.learn_dimension(|s| s.gpus).or(alloc.gpus);
                alloc
            }
        }
    }

    /// Choose one dimension's first allocation from the sample history.
    ///
    /// Candidates are the distinct observed values. A task whose usage
    /// exceeds the candidate wastes the whole first attempt and retries at
    /// the maximum; scoring differs by mode:
    /// MIN_WASTE minimizes total allocated-but-unused resources,
    /// MAX_THROUGHPUT minimizes expected allocation cost per completed
    /// task (smaller allocations pack more tasks per worker).
    fn learn_dimension<F>(&self, get: F) -> Option<i64>
    where
        F: Fn(&ResourceSummary) -> Option<i64>,
    {
        let mut values: Vec<i64> = self.samples.iter().filter_map(&get).collect();
        if values.len() < MIN_SAMPLES {
            return None;
        }
        values.sort_unstable();
        let max = *values.last().unwrap();
        let n = values.len() as f64;

        let mut best: Option<(f64, i64)> = None;
        let mut candidates = values.clone();
        candidates.dedup();
        for a in candidates {
            let fits = values.iter().filter(|&&v| v <= a).count() as f64;
            let fails = n - fits;
            let score = match self.mode {
                AllocationMode::MinWaste => {
                    // waste below the cut plus a full wasted attempt above it
                    let under: i64 = values.iter().filter(|&&v| v <= a).map(|&v| a - v).sum();
                    let over: i64 = values.iter().filter(|&&v| v > a).map(|&v| a + (max - v)).sum();
                    (under + over) as f64
                }
                AllocationMode::MaxThroughput => (a as f64 * n + max as f64 * fails) / n,
                _ => unreachable!(),
            };
            match best {
                Some((s, _)) if s <= score => {}
                _ => best = Some((score, a)),
            }
        }
        best.map(|(_, a)| a)
    }

    /// Allocation a task should request at the given level, combined with
    /// its explicit request (the larger of the two wins per dimension) and
    /// never below the category floor.
    pub fn allocation(&self, level: AllocationLevel, explicit: &ResourceSummary) -> ResourceSummary {
        let mut base = match level {
            AllocationLevel::First => self.first_allocation(),
            AllocationLevel::Max | AllocationLevel::Error => self.max_allocation(),
        };
        base.merge_max(explicit);
        base.merge_max(&self.min_allocation_user);
        base
    }

    /// Next allocation level after an attempt, escalating on resource
    /// exhaustion and failing once the maximum has been exhausted or the
    /// measured usage broke the user-declared ceiling.
    pub fn next_level(
        &self,
        current: AllocationLevel,
        exhausted: bool,
        measured: Option<&ResourceSummary>,
    ) -> AllocationLevel {
        if !exhausted {
            return current;
        }
        if let Some(m) = measured {
            if m.exceeds(&self.max_allocation_user) {
                return AllocationLevel::Error;
            }
        }
        match current {
            AllocationLevel::First => AllocationLevel::Max,
            AllocationLevel::Max | AllocationLevel::Error => AllocationLevel::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(v: i64) -> ResourceSummary {
        ResourceSummary {
            memory: Some(v),
            ..Default::default()
        }
    }

    fn learning_category(mode: AllocationMode, usages: &[i64]) -> Category {
        let mut c = Category::new("test");
        c.mode = mode;
        for &u in usages {
            c.accumulate(Some(&mem(u)), true, false, 1_000_000, 0, 0);
        }
        c
    }

    #[test]
    fn test_max_allocation_prefers_user_cap() {
        let mut c = Category::new("caps");
        c.accumulate(Some(&mem(900)), true, false, 0, 0, 0);
        assert_eq!(c.max_allocation().memory, Some(900));
        c.max_allocation_user.memory = Some(4096);
        assert_eq!(c.max_allocation().memory, Some(4096));
    }

    #[test]
    fn test_first_allocation_needs_samples() {
        let c = learning_category(AllocationMode::MinWaste, &[100; 5]);
        // below the sample floor, falls back to the user guess (unset here)
        assert_eq!(c.first_allocation().memory, None);
    }

    #[test]
    fn test_min_waste_picks_dominant_usage() {
        // ten tasks use ~100 MB, two outliers use 1000 MB: allocating 100
        // wastes two retries; allocating 1000 wastes 900 MB ten times.
        let mut usages = vec![100; 10];
        usages.extend([1000, 1000]);
        let c = learning_category(AllocationMode::MinWaste, &usages);
        assert_eq!(c.first_allocation().memory, Some(100));
    }

    #[test]
    fn test_max_throughput_prefers_small_allocations() {
        let mut usages = vec![50; 15];
        usages.extend([400]);
        let c = learning_category(AllocationMode::MaxThroughput, &usages);
        assert_eq!(c.first_allocation().memory, Some(50));
    }

    #[test]
    fn test_mode_max_starts_at_ceiling() {
        let mut c = learning_category(AllocationMode::Max, &[128, 256]);
        c.max_allocation_user.memory = Some(2048);
        assert_eq!(c.first_allocation().memory, Some(2048));
    }

    #[test]
    fn test_next_level_escalates_then_fails() {
        let c = Category::new("esc");
        assert_eq!(
            c.next_level(AllocationLevel::First, true, None),
            AllocationLevel::Max
        );
        assert_eq!(
            c.next_level(AllocationLevel::Max, true, None),
            AllocationLevel::Error
        );
        assert_eq!(
            c.next_level(AllocationLevel::First, false, None),
            AllocationLevel::First
        );
    }

    #[test]
    fn test_next_level_fails_past_user_ceiling() {
        let mut c = Category::new("cap");
        c.max_allocation_user.memory = Some(512);
        let measured = mem(700);
        assert_eq!(
            c.next_level(AllocationLevel::First, true, Some(&measured)),
            AllocationLevel::Error
        );
    }

    #[test]
    fn test_allocation_respects_explicit_request() {
        let mut c = learning_category(AllocationMode::MinWaste, &[100; 12]);
        c.min_allocation_user.cores = Some(1);
        let explicit = ResourceSummary {
            memory: Some(300),
            ..Default::default()
        };
        let a = c.allocation(AllocationLevel::First, &explicit);
        // explicit request larger than the learned value wins
        assert_eq!(a.memory, Some(300));
        assert_eq!(a.cores, Some(1));
    }

    #[test]
    fn test_average_task_time_floor() {
        let mut c = Category::new("avg");
        for _ in 0..9 {
            c.accumulate(None, true, false, 10_000_000, 0, 0);
        }
        c.update_average_task_time();
        assert_eq!(c.average_task_time, 0);
        c.accumulate(None, true, false, 10_000_000, 0, 0);
        c.update_average_task_time();
        assert_eq!(c.average_task_time, 10_000_000);
    }
}
