//! The legacy memcg-based kill strategy.
//!
//! Used on v1 cgroup hierarchies when the watermark/thrashing engine is
//! disabled. Decisions come from memcg usage ratios and, optionally, the
//! minfree target table; the victim walk itself is shared with the new
//! strategy.

use crate::pressure::PressureLevel;
use crate::procfs::MemInfo;
use crate::props::Config;
use crate::targets::TargetTable;
use crate::OOM_SCORE_ADJ_MAX;
use std::time::{Duration, Instant};

/// Failed-kill reports are rate limited to one per this interval.
const FAIL_REPORT_INTERVAL: Duration = Duration::from_millis(1000);

/// Inputs for one legacy decision.
#[derive(Debug, Clone, Copy)]
pub struct LegacyInputs {
    /// Pressure level after eventfd promotion.
    pub level: PressureLevel,
    /// Fresh meminfo.
    pub mi: MemInfo,
    /// `totalreserve_pages` from zoneinfo.
    pub totalreserve_pages: i64,
    /// `memory.usage_in_bytes`, when readable.
    pub mem_usage: Option<i64>,
    /// `memory.memsw.usage_in_bytes`, when readable.
    pub memsw_usage: Option<i64>,
    /// Tick time.
    pub now: Instant,
}

/// What the legacy strategy decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyDecision {
    /// No kill this tick.
    Ignore,
    /// Kill at or above the floor.
    Kill {
        /// Minimum OOM adjustment of eligible victims.
        min_score_adj: i32,
        /// The minfree threshold that matched, when target matching ran.
        minfree_pages: Option<i32>,
        /// Free pages minus reserves at decision time.
        other_free: i64,
        /// Spare file-cache pages at decision time.
        other_file: i64,
    },
}

/// Legacy decision state.
pub struct LegacyEngine {
    min_free_pages_seen: Option<i64>,
    max_free_pages_seen: Option<i64>,
    last_report_at: Option<Instant>,
    report_skip_count: u64,
}

impl LegacyEngine {
    /// Fresh state.
    pub fn new() -> Self {
        Self {
            min_free_pages_seen: None,
            max_free_pages_seen: None,
            last_report_at: None,
            report_skip_count: 0,
        }
    }

    /// Run one legacy decision.
    pub fn evaluate(
        &mut self,
        config: &Config,
        targets: &TargetTable,
        inputs: &LegacyInputs,
    ) -> LegacyDecision {
        let mi = inputs.mi;
        let mut level = inputs.level;

        if config.use_minfree_levels {
            let other_free = mi.nr_free_pages - inputs.totalreserve_pages;
            let spare = mi.shmem + mi.unevictable + mi.swap_cached;
            let other_file =
                if mi.nr_file_pages > spare { mi.nr_file_pages - spare } else { 0 };

            return match targets.min_score_for(other_free, other_file) {
                Some((min_score_adj, minfree)) => LegacyDecision::Kill {
                    min_score_adj,
                    minfree_pages: Some(minfree),
                    other_free,
                    other_file,
                },
                None => {
                    if config.debug_process_killing && !targets.entries().is_empty() {
                        tracing::info!(
                            level = level.name(),
                            free_pages = other_free,
                            cache_pages = other_file,
                            "ignoring pressure event above minfree limits"
                        );
                    }
                    LegacyDecision::Ignore
                }
            };
        }

        if level == PressureLevel::Low {
            self.record_low_pressure_levels(config, &mi);
        }

        if config.level_oomadj[level as usize] > OOM_SCORE_ADJ_MAX {
            // This pressure level is not monitored.
            return LegacyDecision::Ignore;
        }

        // Without memcg statistics the level's floor applies as-is.
        if let (Some(mem_usage), Some(memsw_usage)) = (inputs.mem_usage, inputs.memsw_usage) {
            if memsw_usage > 0 {
                let mem_pressure = mem_usage * 100 / memsw_usage;

                if config.enable_pressure_upgrade
                    && level != PressureLevel::Critical
                    && mem_pressure < config.upgrade_pressure
                {
                    // Swapping too hard; treat as the next level up.
                    level = level.upgraded();
                    if config.debug_process_killing {
                        tracing::info!(level = level.name(), "pressure event upgraded");
                    }
                }

                let swap_ok = crate::evaluator::free_swap(&mi, config.swap_compression_ratio)
                    >= mi.total_swap * i64::from(config.swap_free_low_percentage) / 100;
                if swap_ok {
                    if mem_pressure > config.downgrade_pressure {
                        if config.debug_process_killing {
                            tracing::info!(level = level.name(), "ignoring pressure event");
                        }
                        return LegacyDecision::Ignore;
                    } else if level == PressureLevel::Critical
                        && mem_pressure > config.upgrade_pressure
                    {
                        level = level.downgraded();
                        if config.debug_process_killing {
                            tracing::info!("downgraded critical pressure event");
                        }
                    }
                }
            }
        }

        // Free up enough memory to leave the pressure envelope observed at
        // low-pressure events.
        if !config.low_ram_device {
            if let Some(max_seen) = self.max_free_pages_seen {
                if mi.nr_free_pages >= max_seen {
                    if config.debug_process_killing {
                        tracing::info!(
                            free_pages = mi.nr_free_pages,
                            watermark = max_seen,
                            "ignoring pressure, more memory available than watermark"
                        );
                    }
                    return LegacyDecision::Ignore;
                }
            }
        }

        LegacyDecision::Kill {
            min_score_adj: config.level_oomadj[level as usize],
            minfree_pages: None,
            other_free: mi.nr_free_pages,
            other_file: 0,
        }
    }

    /// Track the free-memory envelope at low-pressure events.
    fn record_low_pressure_levels(&mut self, config: &Config, mi: &MemInfo) {
        let free = mi.nr_free_pages;
        if self.min_free_pages_seen.map(|min| free < min).unwrap_or(true) {
            if config.debug_process_killing {
                tracing::info!(
                    from = self.min_free_pages_seen.unwrap_or(-1),
                    to = free,
                    "low pressure min memory update"
                );
            }
            self.min_free_pages_seen = Some(free);
        }
        // Free memory occasionally spikes on stale low-pressure events;
        // ignore jumps of more than 10% over the recorded maximum.
        let accept = match self.max_free_pages_seen {
            None => true,
            Some(max) => free > max && free - max < max / 10,
        };
        if accept {
            if config.debug_process_killing {
                tracing::info!(
                    from = self.max_free_pages_seen.unwrap_or(-1),
                    to = free,
                    "low pressure max memory update"
                );
            }
            self.max_free_pages_seen = Some(free);
        }
    }

    /// Record a kill attempt's result, with rate-limited failure reports.
    ///
    /// Returns true when the outcome should be logged.
    pub fn note_result(&mut self, pages_freed: i64, now: Instant) -> bool {
        if pages_freed == 0 {
            if let Some(last) = self.last_report_at {
                if now.duration_since(last) < FAIL_REPORT_INTERVAL {
                    self.report_skip_count += 1;
                    return false;
                }
            }
        }
        if self.report_skip_count > 0 {
            tracing::info!(count = self.report_skip_count, "suppressed failed kill reports");
            self.report_skip_count = 0;
        }
        self.last_report_at = Some(now);
        true
    }
}

impl Default for LegacyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::PropertyStore;
    use crate::targets::Target;

    fn meminfo(free: i64) -> MemInfo {
        MemInfo {
            nr_free_pages: free,
            total_swap: 100000,
            free_swap: 50000,
            easy_available: 100000,
            nr_file_pages: 30000,
            shmem: 5000,
            ..Default::default()
        }
    }

    fn base_inputs(level: PressureLevel, mi: MemInfo) -> LegacyInputs {
        LegacyInputs {
            level,
            mi,
            totalreserve_pages: 2000,
            mem_usage: None,
            memsw_usage: None,
            now: Instant::now(),
        }
    }

    #[test]
    fn test_minfree_matching() {
        let mut props = PropertyStore::new();
        props.set("use_minfree_levels", "true");
        let config = Config::from_store(&props);

        let mut targets = TargetTable::new();
        targets.update(
            &[
                Target { minfree_pages: 4096, oom_adj: 900 },
                Target { minfree_pages: 16384, oom_adj: 200 },
            ],
            Instant::now(),
        );

        let mut engine = LegacyEngine::new();
        // other_free = 3000 - 2000 = 1000 < 4096, other_file = 25000... too
        // big for the first target, matches nothing on file.
        let decision =
            engine.evaluate(&config, &targets, &base_inputs(PressureLevel::Medium, meminfo(3000)));
        assert_eq!(decision, LegacyDecision::Ignore);

        // Shrink the file cache so both counts fall under the first target.
        let mut mi = meminfo(3000);
        mi.nr_file_pages = 6000;
        let decision =
            engine.evaluate(&config, &targets, &base_inputs(PressureLevel::Medium, mi));
        match decision {
            LegacyDecision::Kill { min_score_adj, minfree_pages, other_free, other_file } => {
                assert_eq!(min_score_adj, 900);
                assert_eq!(minfree_pages, Some(4096));
                assert_eq!(other_free, 1000);
                assert_eq!(other_file, 1000);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_unmonitored_level_ignored() {
        let config = Config::default();
        let targets = TargetTable::new();
        let mut engine = LegacyEngine::new();
        // Low level floor defaults above the adjustment maximum.
        let decision =
            engine.evaluate(&config, &targets, &base_inputs(PressureLevel::Low, meminfo(3000)));
        assert_eq!(decision, LegacyDecision::Ignore);
    }

    #[test]
    fn test_downgrade_ignores_event() {
        let mut props = PropertyStore::new();
        props.set("downgrade_pressure", "60");
        let config = Config::from_store(&props);
        let targets = TargetTable::new();
        let mut engine = LegacyEngine::new();

        // Plenty of swap and mem/memsw ratio above downgrade_pressure.
        let mut inputs = base_inputs(PressureLevel::Medium, meminfo(3000));
        inputs.mem_usage = Some(90);
        inputs.memsw_usage = Some(100);
        assert_eq!(engine.evaluate(&config, &targets, &inputs), LegacyDecision::Ignore);
    }

    #[test]
    fn test_upgrade_on_heavy_swapping() {
        let mut props = PropertyStore::new();
        props.set("critical_upgrade", "true");
        props.set("upgrade_pressure", "50");
        props.set("medium", "800");
        props.set("critical", "100");
        let config = Config::from_store(&props);
        let targets = TargetTable::new();
        let mut engine = LegacyEngine::new();

        // Ratio below upgrade_pressure upgrades medium to critical, but
        // swap is ample so the swap gate must not ignore (ratio is below
        // downgrade threshold of 100 too).
        let mut inputs = base_inputs(PressureLevel::Medium, meminfo(3000));
        inputs.mem_usage = Some(40);
        inputs.memsw_usage = Some(100);
        match engine.evaluate(&config, &targets, &inputs) {
            LegacyDecision::Kill { min_score_adj, .. } => assert_eq!(min_score_adj, 100),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_free_memory_envelope() {
        let mut props = PropertyStore::new();
        props.set("medium", "800");
        let config = Config::from_store(&props);
        let targets = TargetTable::new();
        let mut engine = LegacyEngine::new();

        // A low event records the envelope.
        let low = base_inputs(PressureLevel::Low, meminfo(50000));
        engine.evaluate(&config, &targets, &low);

        // A medium event with more free memory than the envelope is noise.
        let decision =
            engine.evaluate(&config, &targets, &base_inputs(PressureLevel::Medium, meminfo(60000)));
        assert_eq!(decision, LegacyDecision::Ignore);

        // Less free memory than the envelope kills at the level floor.
        let decision =
            engine.evaluate(&config, &targets, &base_inputs(PressureLevel::Medium, meminfo(1000)));
        match decision {
            LegacyDecision::Kill { min_score_adj, .. } => assert_eq!(min_score_adj, 800),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_fail_report_rate_limit() {
        let mut engine = LegacyEngine::new();
        let t0 = Instant::now();
        assert!(engine.note_result(0, t0));
        assert!(!engine.note_result(0, t0 + Duration::from_millis(100)));
        // A successful kill always reports.
        assert!(engine.note_result(50, t0 + Duration::from_millis(200)));
        assert!(engine.note_result(0, t0 + Duration::from_millis(1300)));
    }
}
