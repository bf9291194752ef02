//! `/proc/vmstat` parsing.

use super::{match_field, FileReader};
use crate::error::Result;

const FILE: &str = "/proc/vmstat";

const FIELD_NAMES: [&str; 9] = [
    "nr_free_pages",
    "nr_inactive_file",
    "nr_active_file",
    "workingset_refault",
    "workingset_refault_file",
    "pgscan_kswapd",
    "pgscan_direct",
    "pgscan_direct_throttle",
    "pgrefill",
];

/// Snapshot of the vmstat counters the decision engine needs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStat {
    /// nr_free_pages.
    pub nr_free_pages: i64,
    /// nr_inactive_file.
    pub nr_inactive_file: i64,
    /// nr_active_file.
    pub nr_active_file: i64,
    /// workingset_refault (pre-5.9 kernels).
    pub workingset_refault: i64,
    /// workingset_refault_file (5.9+ kernels).
    pub workingset_refault_file: i64,
    /// pgscan_kswapd.
    pub pgscan_kswapd: i64,
    /// pgscan_direct.
    pub pgscan_direct: i64,
    /// pgscan_direct_throttle.
    pub pgscan_direct_throttle: i64,
    /// pgrefill.
    pub pgrefill: i64,
}

impl VmStat {
    /// Parse vmstat content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut arr = [0i64; FIELD_NAMES.len()];
        for line in content.lines() {
            let mut tokens = line.split_whitespace();
            let (Some(name), Some(value)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            if let Some((idx, val)) = match_field(name, value, &FIELD_NAMES, FILE)? {
                arr[idx] = val;
            }
        }
        Ok(Self {
            nr_free_pages: arr[0],
            nr_inactive_file: arr[1],
            nr_active_file: arr[2],
            workingset_refault: arr[3],
            workingset_refault_file: arr[4],
            pgscan_kswapd: arr[5],
            pgscan_direct: arr[6],
            pgscan_direct_throttle: arr[7],
            pgrefill: arr[8],
        })
    }

    /// File-backed refault counter, whichever spelling this kernel uses.
    ///
    /// `workingset_refault` was renamed `workingset_refault_file` in 5.9.
    pub fn refault_file(&self) -> i64 {
        if self.workingset_refault != 0 {
            self.workingset_refault
        } else {
            self.workingset_refault_file
        }
    }

    /// Size of the file LRU in pages.
    pub fn file_lru(&self) -> i64 {
        self.nr_inactive_file + self.nr_active_file
    }
}

/// Cached reader bound to `/proc/vmstat`.
pub struct VmStatReader {
    reader: FileReader,
}

impl VmStatReader {
    /// Create the reader against the live procfs.
    pub fn new() -> Self {
        Self { reader: FileReader::new(FILE, FILE) }
    }

    /// Re-read and parse.
    pub fn read(&mut self) -> Result<VmStat> {
        VmStat::parse(self.reader.read()?)
    }
}

impl Default for VmStatReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let vs = VmStat::parse(
            "nr_free_pages 12345\n\
             nr_inactive_file 2000\n\
             nr_active_file 1000\n\
             nr_mapped 999\n\
             workingset_refault_file 777\n\
             pgscan_kswapd 10\n\
             pgscan_direct 20\n\
             pgrefill 30\n",
        )
        .unwrap();
        assert_eq!(vs.nr_free_pages, 12345);
        assert_eq!(vs.file_lru(), 3000);
        assert_eq!(vs.refault_file(), 777);
        assert_eq!(vs.pgscan_direct, 20);
    }

    #[test]
    fn test_refault_prefers_old_spelling() {
        let vs = VmStat::parse("workingset_refault 5\nworkingset_refault_file 9\n").unwrap();
        assert_eq!(vs.refault_file(), 5);
    }
}
