//! The minfree target table used by the legacy kill strategy.

use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Maximum number of (minfree, adjustment) pairs.
pub const MAX_TARGETS: usize = 6;

/// Updates arriving closer together than this are dropped to resist
/// malicious or misbehaving control clients.
const UPDATE_MIN_INTERVAL: Duration = Duration::from_millis(1000);

/// One free-memory threshold and the kill floor it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Free-memory threshold in pages.
    pub minfree_pages: i32,
    /// OOM adjustment floor engaged below that threshold.
    pub oom_adj: i32,
}

/// Ordered target list with rate-limited replacement.
#[derive(Debug, Default)]
pub struct TargetTable {
    entries: SmallVec<[Target; MAX_TARGETS]>,
    last_update: Option<Instant>,
}

impl TargetTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the table.
    ///
    /// Returns `false` when the update is rejected: empty or oversized
    /// lists, or a second update within the rate-limit window.
    pub fn update(&mut self, targets: &[Target], now: Instant) -> bool {
        if targets.is_empty() || targets.len() > MAX_TARGETS {
            return false;
        }
        if let Some(last) = self.last_update {
            if now.duration_since(last) < UPDATE_MIN_INTERVAL {
                tracing::warn!("ignoring frequent target table update");
                return false;
            }
        }
        self.last_update = Some(now);
        self.entries.clear();
        self.entries.extend_from_slice(targets);
        true
    }

    /// Current entries.
    pub fn entries(&self) -> &[Target] {
        &self.entries
    }

    /// Match current memory state against the table.
    ///
    /// Returns the kill floor of the first entry whose threshold both free
    /// counts fall below, with the threshold that matched.
    pub fn min_score_for(&self, other_free: i64, other_file: i64) -> Option<(i32, i32)> {
        self.entries
            .iter()
            .find(|t| other_free < t.minfree_pages as i64 && other_file < t.minfree_pages as i64)
            .map(|t| (t.oom_adj, t.minfree_pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<Target> {
        vec![
            Target { minfree_pages: 4096, oom_adj: 900 },
            Target { minfree_pages: 8192, oom_adj: 600 },
            Target { minfree_pages: 16384, oom_adj: 200 },
        ]
    }

    #[test]
    fn test_update_and_match() {
        let mut table = TargetTable::new();
        assert!(table.update(&targets(), Instant::now()));
        assert_eq!(table.entries().len(), 3);

        // Plenty free: no match.
        assert_eq!(table.min_score_for(100000, 100000), None);
        // Below the first threshold on both counts.
        assert_eq!(table.min_score_for(1000, 2000), Some((900, 4096)));
        // Only one count below threshold: first entry skipped.
        assert_eq!(table.min_score_for(5000, 2000), Some((600, 8192)));
    }

    #[test]
    fn test_rate_limit() {
        let mut table = TargetTable::new();
        let now = Instant::now();
        assert!(table.update(&targets(), now));
        // A second update inside the window is a no-op.
        let second = vec![Target { minfree_pages: 1, oom_adj: 0 }];
        assert!(!table.update(&second, now + Duration::from_millis(300)));
        assert_eq!(table.entries().len(), 3);
        // After the window it goes through.
        assert!(table.update(&second, now + Duration::from_millis(1100)));
        assert_eq!(table.entries().len(), 1);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let mut table = TargetTable::new();
        assert!(!table.update(&[], Instant::now()));
        let many = vec![Target { minfree_pages: 1, oom_adj: 0 }; MAX_TARGETS + 1];
        assert!(!table.update(&many, Instant::now()));
    }
}
