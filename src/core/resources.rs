//! Resource accounting for workers and tasks.
//!
//! Each resource dimension carries four integers: `total` (capacity),
//! `inuse` (committed by the manager), and `smallest`/`largest` (the
//! min/max instance size observed in the aggregate). A worker reports one
//! [`Resource`] per dimension; the manager aggregates them across the
//! connected pool and checks task requests against them.
use serde::Serialize;

/// One resource dimension as reported by a worker or aggregated by the
/// manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Resource {
    /// Amount currently committed to running tasks.
    pub inuse: i64,
    /// Declared capacity.
    pub total: i64,
    /// Smallest single instance observed in the aggregate.
    pub smallest: i64,
    /// Largest single instance observed in the aggregate.
    pub largest: i64,
}

impl Resource {
    fn add(&mut self, other: &Resource) {
        self.inuse += other.inuse;
        self.total += other.total;
        self.smallest = self.smallest.min(other.smallest);
        self.largest = self.largest.max(other.largest);
    }
}

/// The full set of resource dimensions tracked per worker.
///
/// `tag` is negative until the worker has completed at least one resource
/// report; a worker without a tag is not eligible for dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct Resources {
    pub tag: i64,
    pub workers: Resource,
    pub cores: Resource,
    pub memory: Resource,
    pub disk: Resource,
    pub gpus: Resource,
}

impl Default for Resources {
    fn default() -> Self {
        Self::new()
    }
}

impl Resources {
    pub fn new() -> Self {
        Resources {
            tag: -1,
            workers: Resource::default(),
            cores: Resource::default(),
            memory: Resource::default(),
            disk: Resource::default(),
            gpus: Resource::default(),
        }
    }

    /// Replace one dimension from a worker report, preserving the `inuse`
    /// amount the manager has committed.
    pub fn update_dimension(&mut self, name: &str, r: Resource) -> bool {
        let slot = match name {
            "cores" => &mut self.cores,
            "memory" => &mut self.memory,
            "disk" => &mut self.disk,
            "gpus" => &mut self.gpus,
            "workers" => &mut self.workers,
            _ => return false,
        };
        let inuse = slot.inuse;
        *slot = r;
        slot.inuse = inuse;
        true
    }

    /// Sum another worker's resources into this aggregate.
    pub fn add(&mut self, other: &Resources) {
        self.workers.add(&other.workers);
        self.cores.add(&other.cores);
        self.memory.add(&other.memory);
        self.disk.add(&other.disk);
        self.gpus.add(&other.gpus);
    }

    pub fn clear(&mut self) {
        *self = Resources::new();
        self.tag = 0;
    }

    /// Flatten into `<name>_inuse`/`<name>_total`/... fields for status
    /// and catalog JSON.
    pub fn to_json_fields(&self, obj: &mut serde_json::Map<String, serde_json::Value>) {
        for (name, r) in [
            ("workers", &self.workers),
            ("cores", &self.cores),
            ("memory", &self.memory),
            ("disk", &self.disk),
            ("gpus", &self.gpus),
        ] {
            obj.insert(format!("{}_inuse", name), r.inuse.into());
            obj.insert(format!("{}_total", name), r.total.into());
            obj.insert(format!("{}_smallest", name), r.smallest.into());
            obj.insert(format!("{}_largest", name), r.largest.into());
        }
    }
}

/// Effective capacity of one dimension under the configured overcommit
/// multiplier. Disk is never overcommitted; callers pass 1.0 for it.
pub fn overcommitted_total(total: i64, multiplier: f64) -> i64 {
    if multiplier <= 1.0 {
        total
    } else {
        (total as f64 * multiplier).ceil() as i64
    }
}

/// Per-task resource request or measurement. `None` means unspecified.
///
/// `wall_time` is in seconds of allowed runtime; `start` and `end` are
/// wall-clock epoch seconds bounding when the task may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    pub cores: Option<i64>,
    pub memory: Option<i64>,
    pub disk: Option<i64>,
    pub gpus: Option<i64>,
    pub wall_time: Option<i64>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl ResourceSummary {
    pub fn new() -> Self {
        ResourceSummary::default()
    }

    /// Take every field the other summary specifies.
    pub fn merge_override(&mut self, other: &ResourceSummary) {
        for (dst, src) in self.fields_mut().into_iter().zip(other.fields()) {
            if src.is_some() {
                *dst = src;
            }
        }
    }

    /// Keep the maximum of each specified field.
    pub fn merge_max(&mut self, other: &ResourceSummary) {
        for (dst, src) in self.fields_mut().into_iter().zip(other.fields()) {
            *dst = match (*dst, src) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (None, Some(b)) => Some(b),
                (a, None) => a,
            };
        }
    }

    fn fields(&self) -> [Option<i64>; 7] {
        [
            self.cores,
            self.memory,
            self.disk,
            self.gpus,
            self.wall_time,
            self.start,
            self.end,
        ]
    }

    fn fields_mut(&mut self) -> [&mut Option<i64>; 7] {
        [
            &mut self.cores,
            &mut self.memory,
            &mut self.disk,
            &mut self.gpus,
            &mut self.wall_time,
            &mut self.start,
            &mut self.end,
        ]
    }

    /// True when no core dimension (cores/memory/disk/gpus) is specified.
    pub fn is_unspecified(&self) -> bool {
        self.cores.is_none() && self.memory.is_none() && self.disk.is_none() && self.gpus.is_none()
    }

    /// Render the core dimensions as a compact JSON object, omitting
    /// unspecified fields. Used by the transaction log.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (name, v) in [
            ("cores", self.cores),
            ("memory", self.memory),
            ("disk", self.disk),
            ("gpus", self.gpus),
            ("wall_time", self.wall_time),
            ("end", self.end),
        ] {
            if let Some(v) = v {
                obj.insert(name.to_string(), v.into());
            }
        }
        serde_json::Value::Object(obj)
    }

    /// True when any specified dimension of `self` exceeds the same
    /// dimension of `limit` (unspecified limits never bound).
    pub fn exceeds(&self, limit: &ResourceSummary) -> bool {
        for (v, l) in self.fields().into_iter().zip(limit.fields()) {
            if let (Some(v), Some(l)) = (v, l) {
                if v > l {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(total: i64) -> Resource {
        Resource {
            inuse: 0,
            total,
            smallest: total,
            largest: total,
        }
    }

    #[test]
    fn test_aggregate_sums_totals_and_tracks_extremes() {
        let mut a = Resources::new();
        a.clear();
        let mut w1 = Resources::new();
        w1.cores = res(4);
        w1.memory = res(4096);
        let mut w2 = Resources::new();
        w2.cores = res(16);
        w2.memory = res(1024);

        a.add(&w1);
        a.add(&w2);

        assert_eq!(a.cores.total, 20);
        assert_eq!(a.memory.total, 5120);
        assert_eq!(a.cores.largest, 16);
        assert_eq!(a.memory.smallest, 0); // cleared aggregate starts at zero
    }

    #[test]
    fn test_update_dimension_preserves_inuse() {
        let mut r = Resources::new();
        r.cores.inuse = 3;
        assert!(r.update_dimension("cores", res(8)));
        assert_eq!(r.cores.total, 8);
        assert_eq!(r.cores.inuse, 3);
        assert!(!r.update_dimension("quantum", res(1)));
    }

    #[test]
    fn test_overcommit_rounds_up_and_ignores_submultiplier() {
        assert_eq!(overcommitted_total(4, 1.0), 4);
        assert_eq!(overcommitted_total(4, 2.0), 8);
        assert_eq!(overcommitted_total(3, 1.5), 5);
        assert_eq!(overcommitted_total(4, 0.5), 4);
    }

    #[test]
    fn test_summary_merge_override_and_max() {
        let mut a = ResourceSummary {
            cores: Some(1),
            memory: None,
            ..Default::default()
        };
        let b = ResourceSummary {
            cores: Some(4),
            memory: Some(1024),
            ..Default::default()
        };
        let mut m = a;
        m.merge_max(&b);
        assert_eq!(m.cores, Some(4));
        assert_eq!(m.memory, Some(1024));

        a.merge_override(&b);
        assert_eq!(a.cores, Some(4));
        assert_eq!(a.memory, Some(1024));
    }

    #[test]
    fn test_summary_exceeds() {
        let measured = ResourceSummary {
            memory: Some(2048),
            ..Default::default()
        };
        let limit = ResourceSummary {
            memory: Some(1024),
            ..Default::default()
        };
        assert!(measured.exceeds(&limit));
        assert!(!limit.exceeds(&measured));
        assert!(!measured.exceeds(&ResourceSummary::default()));
    }
}
