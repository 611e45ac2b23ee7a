//! Records for worker factories the manager has seen.
//!
//! A factory launches workers under a shared name and advertises a cap on
//! how many may run. The manager counts connected workers per factory,
//! refuses dispatch beyond the cap, and trims idle workers when the cap
//! shrinks.
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FactoryInfo {
    pub name: String,
    pub connected_workers: i64,
    pub max_workers: i64,
    /// Set while the factory was present in the latest catalog query.
    pub seen_at_catalog: bool,
}

#[derive(Debug, Default)]
pub struct FactoryTable {
    factories: HashMap<String, FactoryInfo>,
}

impl FactoryTable {
    pub fn new() -> Self {
        FactoryTable::default()
    }

    pub fn get(&self, name: &str) -> Option<&FactoryInfo> {
        self.factories.get(name)
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut FactoryInfo {
        self.factories
            .entry(name.to_string())
            .or_insert_with(|| FactoryInfo {
                name: name.to_string(),
                connected_workers: 0,
                max_workers: i64::MAX,
                seen_at_catalog: false,
            })
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FactoryInfo> {
        self.factories.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<FactoryInfo> {
        self.factories.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Clear the seen flag before a catalog query round.
    pub fn begin_catalog_round(&mut self) {
        for f in self.factories.values_mut() {
            f.seen_at_catalog = false;
        }
    }

    /// Apply one catalog record. Returns true when the cap shrank and
    /// idle workers of this factory should be trimmed.
    pub fn apply_catalog_update(&mut self, name: &str, max_workers: Option<i64>) -> bool {
        let Some(f) = self.factories.get_mut(name) else {
            log::debug!("factory {} not recorded", name);
            return false;
        };
        f.seen_at_catalog = true;
        if let Some(m) = max_workers {
            let shrank = m < f.max_workers;
            f.max_workers = m;
            return shrank;
        }
        false
    }

    /// Drop factories absent from the last query round with no workers
    /// connected. Returns the dropped names.
    pub fn drop_stale(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .factories
            .values()
            .filter(|f| !f.seen_at_catalog && f.connected_workers < 1)
            .map(|f| f.name.clone())
            .collect();
        for name in &stale {
            self.factories.remove(name);
        }
        stale
    }

    /// True when the factory is at or over its cap.
    pub fn over_cap(&self, name: &str) -> bool {
        self.factories
            .get(name)
            .map(|f| f.connected_workers > f.max_workers)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_round_drops_stale_factories() {
        let mut t = FactoryTable::new();
        t.get_or_create("alive").connected_workers = 2;
        t.get_or_create("gone");

        t.begin_catalog_round();
        t.apply_catalog_update("alive", Some(8));

        let dropped = t.drop_stale();
        assert_eq!(dropped, vec!["gone".to_string()]);
        assert!(t.get("alive").is_some());
    }

    #[test]
    fn test_unseen_factory_with_workers_survives() {
        let mut t = FactoryTable::new();
        t.get_or_create("busy").connected_workers = 1;
        t.begin_catalog_round();
        assert!(t.drop_stale().is_empty());
    }

    #[test]
    fn test_cap_shrink_requests_trim() {
        let mut t = FactoryTable::new();
        let f = t.get_or_create("f1");
        f.max_workers = 10;
        f.connected_workers = 6;
        assert!(t.apply_catalog_update("f1", Some(4)));
        assert!(t.over_cap("f1"));
        assert!(!t.apply_catalog_update("f1", Some(20)));
    }
}
