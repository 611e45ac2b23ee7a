//! Host blocklist with timed release.
//!
//! Hosts land here when the application blocks them explicitly, when a
//! worker speaks the wrong protocol version, or when fast-abort decides a
//! worker is slow. Entries may expire at a deadline or persist until
//! released.
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub blocked: bool,
    /// Times this host went from active to blocked.
    pub times_blocked: u32,
    /// Epoch seconds at which the block lifts; `None` blocks indefinitely.
    pub release_at: Option<u64>,
}

/// Hostname -> block state.
#[derive(Debug, Default)]
pub struct Blocklist {
    hosts: HashMap<String, BlockEntry>,
}

impl Blocklist {
    pub fn new() -> Self {
        Blocklist::default()
    }

    /// Block a host, optionally releasing it after `timeout` seconds.
    /// Returns true when the host went from active to blocked.
    pub fn block(&mut self, hostname: &str, timeout: Option<u64>, now: u64) -> bool {
        let entry = self.hosts.entry(hostname.to_string()).or_insert(BlockEntry {
            blocked: false,
            times_blocked: 0,
            release_at: None,
        });
        let newly = !entry.blocked;
        if newly {
            entry.times_blocked += 1;
        }
        entry.blocked = true;
        entry.release_at = timeout.map(|t| now + t);
        newly
    }

    pub fn unblock(&mut self, hostname: &str) -> bool {
        self.hosts.remove(hostname).is_some()
    }

    pub fn is_blocked(&self, hostname: &str) -> bool {
        self.hosts.get(hostname).map(|e| e.blocked).unwrap_or(false)
    }

    /// Release every host whose deadline has passed. Indefinite blocks
    /// stay. Returns the released hostnames.
    pub fn release_due(&mut self, now: u64) -> Vec<String> {
        let due: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, e)| e.blocked && matches!(e.release_at, Some(t) if t <= now))
            .map(|(h, _)| h.clone())
            .collect();
        for host in &due {
            self.hosts.remove(host);
        }
        due
    }

    /// Release everything, including indefinite blocks.
    pub fn release_all(&mut self) {
        self.hosts.clear();
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Blocked hostnames for the catalog advertisement.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        if self.hosts.is_empty() {
            return None;
        }
        Some(serde_json::Value::Array(
            self.hosts
                .iter()
                .filter(|(_, e)| e.blocked)
                .map(|(h, _)| serde_json::Value::String(h.clone()))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_and_expiry() {
        let mut b = Blocklist::new();
        assert!(b.block("badhost", Some(60), 1000));
        assert!(b.is_blocked("badhost"));

        // not due yet
        assert!(b.release_due(1059).is_empty());
        assert!(b.is_blocked("badhost"));

        // due at the deadline
        let released = b.release_due(1060);
        assert_eq!(released, vec!["badhost".to_string()]);
        assert!(!b.is_blocked("badhost"));
    }

    #[test]
    fn test_indefinite_block_survives_sweep() {
        let mut b = Blocklist::new();
        b.block("forever", None, 0);
        assert!(b.release_due(u64::MAX).is_empty());
        assert!(b.is_blocked("forever"));
        b.release_all();
        assert!(!b.is_blocked("forever"));
    }

    #[test]
    fn test_times_blocked_counts_transitions() {
        let mut b = Blocklist::new();
        assert!(b.block("h", Some(10), 0));
        // blocking an already-blocked host is not a new transition
        assert!(!b.block("h", Some(20), 0));
        b.unblock("h");
        assert!(b.block("h", None, 0));
    }
}
