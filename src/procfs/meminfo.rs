//! `/proc/meminfo` parsing.

use super::{match_field, FileReader};
use crate::error::Result;

const FILE: &str = "/proc/meminfo";

/// Parsed fields, in file units of kB converted to pages.
const FIELD_NAMES: [&str; 19] = [
    "MemFree:",
    "Cached:",
    "SwapCached:",
    "Buffers:",
    "Shmem:",
    "Unevictable:",
    "SwapTotal:",
    "SwapFree:",
    "Active(anon):",
    "Inactive(anon):",
    "Active(file):",
    "Inactive(file):",
    "SReclaimable:",
    "SUnreclaim:",
    "KernelStack:",
    "PageTables:",
    "ION_heap:",
    "ION_heap_pool:",
    "CmaFree:",
];

/// Snapshot of `/proc/meminfo`, all values in pages unless noted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    /// MemFree.
    pub nr_free_pages: i64,
    /// Cached.
    pub cached: i64,
    /// SwapCached.
    pub swap_cached: i64,
    /// Buffers.
    pub buffers: i64,
    /// Shmem.
    pub shmem: i64,
    /// Unevictable.
    pub unevictable: i64,
    /// SwapTotal.
    pub total_swap: i64,
    /// SwapFree.
    pub free_swap: i64,
    /// Active(anon).
    pub active_anon: i64,
    /// Inactive(anon).
    pub inactive_anon: i64,
    /// Active(file).
    pub active_file: i64,
    /// Inactive(file).
    pub inactive_file: i64,
    /// SReclaimable.
    pub sreclaimable: i64,
    /// SUnreclaim.
    pub sunreclaimable: i64,
    /// KernelStack.
    pub kernel_stack: i64,
    /// PageTables.
    pub page_tables: i64,
    /// ION_heap.
    pub ion_heap: i64,
    /// ION_heap_pool.
    pub ion_heap_pool: i64,
    /// CmaFree.
    pub cma_free: i64,
    /// Computed: Cached + SwapCached + Buffers.
    pub nr_file_pages: i64,
    /// Computed: MemFree + Inactive(file).
    pub easy_available: i64,
    /// GPU memory total in kB, filled in from the accounting map.
    pub total_gpu_kb: i64,
}

impl MemInfo {
    /// Parse meminfo content, converting kB values to pages.
    pub fn parse(content: &str, page_k: i64) -> Result<Self> {
        let mut arr = [0i64; FIELD_NAMES.len()];
        for line in content.lines() {
            let mut tokens = line.split_whitespace();
            let (Some(name), Some(value)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            if let Some((idx, val)) = match_field(name, value, &FIELD_NAMES, FILE)? {
                arr[idx] = val / page_k;
            }
        }

        let mut mi = Self {
            nr_free_pages: arr[0],
            cached: arr[1],
            swap_cached: arr[2],
            buffers: arr[3],
            shmem: arr[4],
            unevictable: arr[5],
            total_swap: arr[6],
            free_swap: arr[7],
            active_anon: arr[8],
            inactive_anon: arr[9],
            active_file: arr[10],
            inactive_file: arr[11],
            sreclaimable: arr[12],
            sunreclaimable: arr[13],
            kernel_stack: arr[14],
            page_tables: arr[15],
            ion_heap: arr[16],
            ion_heap_pool: arr[17],
            cma_free: arr[18],
            ..Default::default()
        };
        mi.nr_file_pages = mi.cached + mi.swap_cached + mi.buffers;
        mi.easy_available = mi.nr_free_pages + mi.inactive_file;
        Ok(mi)
    }

    /// The parsed fields in file order, for the kill event record.
    pub fn record_fields(&self) -> [i64; FIELD_NAMES.len()] {
        [
            self.nr_free_pages,
            self.cached,
            self.swap_cached,
            self.buffers,
            self.shmem,
            self.unevictable,
            self.total_swap,
            self.free_swap,
            self.active_anon,
            self.inactive_anon,
            self.active_file,
            self.inactive_file,
            self.sreclaimable,
            self.sunreclaimable,
            self.kernel_stack,
            self.page_tables,
            self.ion_heap,
            self.ion_heap_pool,
            self.cma_free,
        ]
    }
}

/// Cached reader bound to `/proc/meminfo`.
pub struct MemInfoReader {
    reader: FileReader,
    page_k: i64,
}

impl MemInfoReader {
    /// Create the reader against the live procfs.
    pub fn new() -> Self {
        Self {
            reader: FileReader::new(FILE, FILE),
            page_k: crate::page_k(),
        }
    }

    /// Re-read and parse.
    pub fn read(&mut self) -> Result<MemInfo> {
        let content = self.reader.read()?;
        MemInfo::parse(content, self.page_k)
    }
}

impl Default for MemInfoReader {
    fn default() -> Self {
        Self::new()
    }
}
