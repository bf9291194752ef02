//! Property store and derived daemon configuration.
//!
//! The platform exposes tunables through a flat `key = value` property file.
//! The file is re-read on startup and whenever an `UPDATE_PROPS` command
//! arrives, so every value lives behind [`Config::from_store`] rather than
//! being cached ad hoc.

use crate::{PERCEPTIBLE_APP_ADJ, PREVIOUS_APP_ADJ, OOM_SCORE_ADJ_MAX};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default location of the property file.
pub const DEFAULT_PROPERTIES_PATH: &str = "/etc/lowmemd.properties";
/// Environment variable overriding the property file location.
pub const PROPERTIES_ENV: &str = "LOWMEMD_PROPERTIES";

/// Swap-free low threshold default, percent of total swap.
const DEF_LOW_SWAP: i32 = 10;
/// Thrashing limit defaults.
const DEF_THRASHING: i64 = 100;
const DEF_THRASHING_LOWRAM: i64 = 30;
/// Thrashing limit decay defaults.
const DEF_THRASHING_DECAY: i64 = 10;
const DEF_THRASHING_DECAY_LOWRAM: i64 = 50;
/// PSI partial-stall defaults, milliseconds within a 1-second window.
const DEF_PARTIAL_STALL: i32 = 70;
const DEF_PARTIAL_STALL_LOWRAM: i32 = 200;
/// PSI complete-stall default.
const DEF_COMPLETE_STALL: i32 = 700;
/// Direct-reclaim stuck threshold default (0 = disabled).
const DEF_DIRECT_RECL_THRESH_MS: u64 = 0;
/// Swap compression ratio default.
const DEF_SWAP_COMP_RATIO: i64 = 1;

/// Flat string key-value store backing all runtime tunables.
#[derive(Debug, Default, Clone)]
pub struct PropertyStore {
    values: HashMap<String, String>,
}

impl PropertyStore {
    /// Create an empty store (all getters return defaults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from the default path, honoring the `LOWMEMD_PROPERTIES`
    /// override. A missing file yields an empty store.
    pub fn load_default() -> Self {
        let path = std::env::var(PROPERTIES_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PROPERTIES_PATH));
        Self::load(&path).unwrap_or_default()
    }

    /// Load properties from `path`.
    ///
    /// Lines are `key = value`; `#` starts a comment; malformed lines are
    /// skipped.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse property file content.
    pub fn parse(content: &str) -> Self {
        let mut values = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { values }
    }

    /// Set a property programmatically.
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Raw string lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Boolean property: `1`/`true`/`on` are true, `0`/`false`/`off` false.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("1") | Some("true") | Some("on") => true,
            Some("0") | Some("false") | Some("off") => false,
            _ => default,
        }
    }

    /// 32-bit integer property.
    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// 64-bit integer property.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Path property.
    pub fn get_path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get(key).unwrap_or(default))
    }
}

fn clamp_i32(low: i32, high: i32, value: i32) -> i32 {
    value.max(low).min(high)
}

/// All tunables derived from the property store in one snapshot.
///
/// Rebuilt wholesale on `UPDATE_PROPS`; handlers take it by reference so a
/// rebuild is a single swap.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-level OOM floors for the legacy strategy (low, medium, critical).
    pub level_oomadj: [i32; 3],
    /// Verbose kill-decision logging.
    pub debug_process_killing: bool,
    /// Legacy strategy: allow upgrading pressure level when swapping hard.
    pub enable_pressure_upgrade: bool,
    /// Legacy strategy: mem/memsw percent below which level is upgraded.
    pub upgrade_pressure: i64,
    /// Legacy strategy: mem/memsw percent above which events are ignored.
    pub downgrade_pressure: i64,
    /// Device is configured as low-RAM.
    pub low_ram_device: bool,
    /// Always pick the heaviest task in a bucket instead of the oldest.
    pub kill_heaviest_task: bool,
    /// Minimum gap between kills; we wait this long for a victim to die.
    pub kill_timeout_ms: u64,
    /// Floor used when the min watermark is still breached right after a kill.
    pub pressure_after_kill_min_score: i32,
    /// Engage legacy minfree-target matching.
    pub use_minfree_levels: bool,
    /// Per-application memory cgroups are in use.
    pub per_app_memcg: bool,
    /// Swap-low threshold as percent of total swap.
    pub swap_free_low_percentage: i32,
    /// Medium PSI trigger threshold (partial stall), ms per 1-s window.
    pub psi_partial_stall_ms: i32,
    /// Critical PSI trigger threshold (complete stall), ms per 1-s window.
    pub psi_complete_stall_ms: i32,
    /// Thrashing percentage above which thrashing-driven kills begin.
    pub thrashing_limit_pct: i64,
    /// Percent by which the thrashing limit decays after a thrashing kill.
    pub thrashing_limit_decay_pct: i64,
    /// Thrashing percentage above which perceptible apps become eligible.
    pub thrashing_critical_pct: i64,
    /// Kill when swap utilization exceeds this percentage.
    pub swap_util_max: i32,
    /// Post-thrashing file cache floor in kB (0 = disabled).
    pub filecache_min_kb: i64,
    /// PSI full-stall avg10 above which the system counts as stalled.
    pub stall_limit_critical: i64,
    /// Prefer PSI triggers over legacy memcg eventfds.
    pub use_psi: bool,
    /// Use the watermark/thrashing decision engine instead of the legacy one.
    pub use_new_strategy: bool,
    /// Do not arm monitors until boot has completed.
    pub delay_monitors_until_boot: bool,
    /// Stuck-in-direct-reclaim threshold in ms (0 = disabled).
    pub direct_reclaim_threshold_ms: u64,
    /// Multiplier on easily-available memory for swap accounting (0 = ignore).
    pub swap_compression_ratio: i64,
    /// Floor for the plain low-memory fallback kill.
    pub lowmem_min_oom_score: i32,
    /// Root of the v1 memory cgroup controller.
    pub memcg_root: PathBuf,
    /// Kernel memory-event stream endpoint.
    pub memevents_path: PathBuf,
    /// GPU memory accounting map path.
    pub gpumem_path: PathBuf,
    /// The system has finished booting.
    pub boot_completed: bool,
}

impl Config {
    /// Build a configuration snapshot from the property store.
    pub fn from_store(props: &PropertyStore) -> Self {
        let low_ram_device = props.get_bool("low_ram", false);
        let use_minfree_levels = props.get_bool("use_minfree_levels", false);
        let thrashing_limit_pct = props
            .get_i64(
                "thrashing_limit",
                if low_ram_device { DEF_THRASHING_LOWRAM } else { DEF_THRASHING },
            )
            .max(0);

        Self {
            // Low-level pressure events are disabled by default.
            level_oomadj: [
                props.get_i32("low", OOM_SCORE_ADJ_MAX + 1),
                props.get_i32("medium", 800),
                props.get_i32("critical", 0),
            ],
            debug_process_killing: props.get_bool("debug", false),
            enable_pressure_upgrade: props.get_bool("critical_upgrade", false),
            upgrade_pressure: props.get_i64("upgrade_pressure", 100),
            downgrade_pressure: props.get_i64("downgrade_pressure", 100),
            low_ram_device,
            kill_heaviest_task: props.get_bool("kill_heaviest_task", false),
            kill_timeout_ms: props.get_i64("kill_timeout_ms", 100).max(0) as u64,
            pressure_after_kill_min_score: props.get_i32("pressure_after_kill_min_score", 0),
            use_minfree_levels,
            per_app_memcg: props.get_bool("per_app_memcg", low_ram_device),
            swap_free_low_percentage: clamp_i32(
                0,
                100,
                props.get_i32("swap_free_low_percentage", DEF_LOW_SWAP),
            ),
            psi_partial_stall_ms: props.get_i32(
                "psi_partial_stall_ms",
                if low_ram_device { DEF_PARTIAL_STALL_LOWRAM } else { DEF_PARTIAL_STALL },
            ),
            psi_complete_stall_ms: props.get_i32("psi_complete_stall_ms", DEF_COMPLETE_STALL),
            thrashing_limit_pct,
            thrashing_limit_decay_pct: props
                .get_i64(
                    "thrashing_limit_decay",
                    if low_ram_device { DEF_THRASHING_DECAY_LOWRAM } else { DEF_THRASHING_DECAY },
                )
                .clamp(0, 100),
            thrashing_critical_pct: props
                .get_i64("thrashing_limit_critical", thrashing_limit_pct * 3)
                .max(0),
            swap_util_max: clamp_i32(0, 100, props.get_i32("swap_util_max", 100)),
            filecache_min_kb: props.get_i64("filecache_min_kb", 0),
            stall_limit_critical: props.get_i64("stall_limit_critical", 100),
            use_psi: props.get_bool("use_psi", true),
            use_new_strategy: props.get_bool(
                "use_new_strategy",
                low_ram_device || !use_minfree_levels,
            ),
            delay_monitors_until_boot: props.get_bool("delay_monitors_until_boot", false),
            direct_reclaim_threshold_ms: props
                .get_i64("direct_reclaim_threshold_ms", DEF_DIRECT_RECL_THRESH_MS as i64)
                .max(0) as u64,
            swap_compression_ratio: props
                .get_i64("swap_compression_ratio", DEF_SWAP_COMP_RATIO)
                .max(0),
            lowmem_min_oom_score: props
                .get_i32("lowmem_min_oom_score", PREVIOUS_APP_ADJ + 1)
                .max(PERCEPTIBLE_APP_ADJ + 1),
            memcg_root: props.get_path("memcg_root", "/sys/fs/cgroup/memory"),
            memevents_path: props.get_path("memevents_path", "/sys/fs/bpf/lowmemd/memevents"),
            gpumem_path: props.get_path("gpumem_path", "/sys/fs/bpf/map_gpuMem_gpu_mem_total_map"),
            boot_completed: props.get_bool("boot_completed", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_store(&PropertyStore::new())
    }
}
