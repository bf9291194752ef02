//! The pressure-driven kill decision engine.
//!
//! Every pressure event or polling tick runs through [`Engine::run_tick`],
//! which derives the reclaim state, thrashing percentage, watermark breach
//! and swap condition, then walks a fixed precedence list of kill clauses.
//! The first matching clause names the kill reason and the minimum OOM
//! adjustment of eligible victims; dispatching the kill is delegated through
//! [`VictimKiller`] so the walk over the registry stays out of the decision
//! logic.

use crate::evaluator::{ThrashingWindow, WatermarkLevel, ZoneWatermarks};
use crate::evaluator::{free_swap, swap_utilization};
use crate::pressure::PressureLevel;
use crate::procfs::{MemInfo, VmStat};
use crate::props::Config;
use crate::{PERCEPTIBLE_APP_ADJ, PSI_POLL_PERIOD_LONG_MS, PSI_POLL_PERIOD_SHORT_MS};
use std::time::{Duration, Instant};

/// Reason codes for vendor-requested kills start here.
pub const VENDOR_KILL_REASON_BASE: i32 = 1000;
/// Highest vendor reason code accepted.
pub const VENDOR_KILL_REASON_END: i32 = 1999;

/// Why a process was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// Min watermark still breached right after a kill completed.
    PressureAfterKill,
    /// Complete PSI stall; the device risks becoming unresponsive.
    NotResponding,
    /// Swap is low and the page cache is thrashing.
    LowSwapAndThrashing,
    /// Both free memory and swap are low.
    LowMemAndSwap,
    /// Free memory is low and swap utilization is excessive.
    LowMemAndSwapUtil,
    /// Free memory is low and the page cache is thrashing.
    LowMemAndThrashing,
    /// Direct reclaim is running and the page cache is thrashing.
    DirectReclaimAndThrashing,
    /// A task has been stuck in direct reclaim too long.
    DirectReclaimStuck,
    /// File cache collapsed below its floor after a thrashing episode.
    LowFileCacheAfterThrashing,
    /// Plain low-memory fallback.
    LowMem,
    /// Vendor-injected kill with a vendor-defined reason code.
    Vendor(i32),
}

impl KillReason {
    /// Numeric code for the wire protocol and the kill record.
    pub fn code(self) -> i32 {
        match self {
            KillReason::PressureAfterKill => 0,
            KillReason::NotResponding => 1,
            KillReason::LowSwapAndThrashing => 2,
            KillReason::LowMemAndSwap => 3,
            KillReason::LowMemAndSwapUtil => 4,
            KillReason::LowMemAndThrashing => 5,
            KillReason::DirectReclaimAndThrashing => 6,
            KillReason::DirectReclaimStuck => 7,
            KillReason::LowFileCacheAfterThrashing => 8,
            KillReason::LowMem => 9,
            KillReason::Vendor(code) => VENDOR_KILL_REASON_BASE + code,
        }
    }

    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            KillReason::PressureAfterKill => "pressure_after_kill",
            KillReason::NotResponding => "not_responding",
            KillReason::LowSwapAndThrashing => "low_swap_and_thrashing",
            KillReason::LowMemAndSwap => "low_mem_and_swap",
            KillReason::LowMemAndSwapUtil => "low_mem_and_swap_util",
            KillReason::LowMemAndThrashing => "low_mem_and_thrashing",
            KillReason::DirectReclaimAndThrashing => "direct_recl_and_thrashing",
            KillReason::DirectReclaimStuck => "direct_recl_stuck",
            KillReason::LowFileCacheAfterThrashing => "low_filecache_after_thrashing",
            KillReason::LowMem => "low_mem",
            KillReason::Vendor(_) => "vendor",
        }
    }
}

/// What woke the engine.
#[derive(Debug, Clone, Copy)]
pub enum EventOrigin {
    /// A PSI trigger or a scheduled polling tick (`events == 0`).
    Psi {
        /// Level of the trigger that fired, or of the polled handler.
        level: PressureLevel,
        /// Non-zero for a real trigger, zero for a polling wakeup.
        events: u32,
    },
    /// A vendor kill request from the memory-event stream.
    Vendor {
        /// Vendor reason code, offset onto [`VENDOR_KILL_REASON_BASE`].
        reason: i32,
        /// Floor supplied by the vendor.
        min_oom_score_adj: i32,
    },
}

/// Reclaim activity derived for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimState {
    /// No reclaim observed.
    None,
    /// kswapd is scanning.
    Kswapd,
    /// An allocating task is reclaiming synchronously.
    Direct,
}

/// Reclaim facts delivered by the memory-event stream, when it is running.
#[derive(Debug, Clone, Copy)]
pub struct MemEventsState {
    /// How long ago direct reclaim began, if it is still running.
    pub direct_reclaim_since: Option<Duration>,
    /// Whether kswapd is awake.
    pub kswapd_active: bool,
}

/// Everything the engine reads for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickInputs {
    /// What woke us.
    pub origin: EventOrigin,
    /// Fresh vmstat counters.
    pub vs: VmStat,
    /// Fresh meminfo.
    pub mi: MemInfo,
    /// Current aggregated zone watermarks.
    pub watermarks: ZoneWatermarks,
    /// Memory full-stall avg10, when PSI data is readable.
    pub psi_mem_full_avg10: Option<f32>,
    /// Reclaim facts from the event stream; `None` falls back to vmstat
    /// deltas.
    pub memevents: Option<MemEventsState>,
    /// Tick time.
    pub now: Instant,
}

/// A kill the engine decided on.
#[derive(Debug, Clone)]
pub struct KillCall {
    /// Why.
    pub reason: KillReason,
    /// Only processes at or above this adjustment are eligible.
    pub min_oom_score_adj: i32,
    /// Human-readable explanation for the kill log.
    pub desc: String,
    /// Thrashing percentage at decision time.
    pub thrashing_pct: i64,
    /// Peak thrashing since the last kill.
    pub max_thrashing: i64,
    /// Wakeup bookkeeping at decision time, for the kill record.
    pub wakeup: WakeupInfo,
}

/// Performs the registry walk and the actual kill.
pub trait VictimKiller {
    /// Kill one eligible process. Returns pages freed, 0 when no candidate
    /// qualified, or negative on failure.
    fn kill(&mut self, call: &KillCall, mi: &MemInfo) -> i64;
}

/// Wakeup bookkeeping attached to kill records.
#[derive(Debug, Default, Clone, Copy)]
pub struct WakeupInfo {
    /// When the last real pressure event fired.
    pub last_event_at: Option<Instant>,
    /// When the handler last ran.
    pub last_wakeup_at: Option<Instant>,
    /// The wakeup before that.
    pub prev_wakeup_at: Option<Instant>,
    /// Polling wakeups since the last real event.
    pub wakeups_since_event: u32,
    /// Wakeups skipped while a kill was still in flight.
    pub skipped_wakeups: u32,
}

impl WakeupInfo {
    pub(crate) fn record(&mut self, now: Instant, is_event: bool) {
        self.prev_wakeup_at = self.last_wakeup_at;
        self.last_wakeup_at = Some(now);
        if is_event {
            self.last_event_at = Some(now);
            self.wakeups_since_event = 0;
            self.skipped_wakeups = 0;
        } else {
            self.wakeups_since_event += 1;
        }
    }
}

/// Polling directive produced by a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Pages freed by a kill this tick (0 = no kill).
    pub pages_freed: i64,
    /// Whether a kill was dispatched successfully.
    pub killed: bool,
    /// Start (or restart) the polling window.
    pub start_polling: bool,
    /// Polling cadence to use.
    pub poll_interval_ms: u64,
}

impl TickOutcome {
    fn quiet() -> Self {
        Self {
            pages_freed: 0,
            killed: false,
            start_polling: false,
            poll_interval_ms: PSI_POLL_PERIOD_LONG_MS,
        }
    }
}

/// The watermark/swap/thrashing decision engine.
pub struct Engine {
    killing: bool,
    thrashing: Option<ThrashingWindow>,
    prev_workingset_refault: i64,
    init_pgscan_direct: i64,
    init_pgscan_kswapd: i64,
    init_pgrefill: i64,
    prev_level: PressureLevel,
    check_filecache: bool,
    wakeup: WakeupInfo,
    event_count: u64,
}

impl Engine {
    /// Fresh engine state.
    pub fn new() -> Self {
        Self {
            killing: false,
            thrashing: None,
            prev_workingset_refault: 0,
            init_pgscan_direct: 0,
            init_pgscan_kswapd: 0,
            init_pgrefill: 0,
            prev_level: PressureLevel::Low,
            check_filecache: false,
            wakeup: WakeupInfo::default(),
            event_count: 0,
        }
    }

    /// Wakeup bookkeeping for the kill record.
    pub fn wakeup(&self) -> &WakeupInfo {
        &self.wakeup
    }

    /// Pressure events and polling ticks handled so far.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Note a wakeup that was skipped because a kill is still in flight.
    pub fn record_skipped_wakeup(&mut self) {
        self.wakeup.skipped_wakeups += 1;
    }

    /// Run one decision tick. See the module docs for the flow.
    pub fn run_tick(
        &mut self,
        config: &Config,
        inputs: &TickInputs,
        killer: &mut dyn VictimKiller,
    ) -> TickOutcome {
        let TickInputs { origin, vs, mi, watermarks, now, .. } = *inputs;
        self.event_count += 1;

        let events = match origin {
            EventOrigin::Psi { level, events } => {
                if events > 0 {
                    // Ignore a lower event arriving within the first polling
                    // window.
                    if level < self.prev_level {
                        if config.debug_process_killing {
                            tracing::info!(
                                level = level.name(),
                                "ignoring pressure event; occurred too soon"
                            );
                        }
                        return TickOutcome::quiet();
                    }
                    self.prev_level = level;
                } else {
                    // First polling window is over; reset the event level.
                    self.prev_level = PressureLevel::Low;
                }
                self.wakeup.record(now, events > 0);
                events
            }
            EventOrigin::Vendor { .. } => 0,
        };

        if config.debug_process_killing {
            match origin {
                EventOrigin::Psi { level, .. } => tracing::info!(
                    level = level.name(),
                    count = self.event_count,
                    "memory pressure event triggered"
                ),
                EventOrigin::Vendor { .. } => {
                    tracing::info!(count = self.event_count, "vendor kill event triggered")
                }
            }
        }

        // Reset accounting after a completed kill.
        let mut cycle_after_kill = false;
        if self.killing {
            self.killing = false;
            cycle_after_kill = true;
            if let Some(window) = self.thrashing.as_mut() {
                window.reset_after_kill(&vs, now);
            }
        }

        // Swap condition.
        let free_swap_pages = free_swap(&mi, config.swap_compression_ratio);
        let swap_low_threshold = if config.swap_free_low_percentage > 0 {
            mi.total_swap * i64::from(config.swap_free_low_percentage) / 100
        } else {
            0
        };
        let swap_is_low = swap_low_threshold > 0 && free_swap_pages < swap_low_threshold;

        // Reclaim state, preferring event-stream facts over vmstat deltas.
        let (in_direct_reclaim, in_kswapd_reclaim, direct_reclaim_duration) =
            match inputs.memevents {
                Some(state) => (
                    state.direct_reclaim_since.is_some(),
                    state.kswapd_active,
                    state.direct_reclaim_since,
                ),
                None => (
                    vs.pgscan_direct != self.init_pgscan_direct,
                    vs.pgscan_kswapd != self.init_pgscan_kswapd
                        || vs.pgrefill != self.init_pgrefill,
                    None,
                ),
            };
        let reclaim = if in_direct_reclaim {
            self.init_pgscan_direct = vs.pgscan_direct;
            self.init_pgscan_kswapd = vs.pgscan_kswapd;
            self.init_pgrefill = vs.pgrefill;
            ReclaimState::Direct
        } else if in_kswapd_reclaim {
            self.init_pgscan_kswapd = vs.pgscan_kswapd;
            self.init_pgrefill = vs.pgrefill;
            ReclaimState::Kswapd
        } else {
            ReclaimState::None
        };

        let refault = vs.refault_file();
        if reclaim == ReclaimState::None
            && refault == self.prev_workingset_refault
            && matches!(origin, EventOrigin::Psi { .. })
        {
            // Neither reclaiming nor thrashing; wait for the stats to move.
            return self.no_kill_outcome(events, swap_is_low, reclaim);
        }
        self.prev_workingset_refault = refault;

        let window = self
            .thrashing
            .get_or_insert_with(|| ThrashingWindow::new(&vs, now, config.thrashing_limit_pct));
        let thrashing = window.advance(&vs, now, config.thrashing_limit_pct);
        let thrashing_limit = window.limit;
        let max_thrashing = window.max_thrashing;

        let wmark = watermarks.lowest_breached(&mi);
        let critical_stall = inputs
            .psi_mem_full_avg10
            .map(|avg10| avg10 > config.stall_limit_critical as f32)
            .unwrap_or(false);

        let mut cut_thrashing_limit = false;
        let page_k = crate::page_k();
        let mut swap_util = 0;

        // The first matching clause decides, in strict precedence order.
        let decided: Option<(KillReason, i32, String)> = if let EventOrigin::Vendor {
            reason,
            min_oom_score_adj,
        } = origin
        {
            if !(0..=VENDOR_KILL_REASON_END - VENDOR_KILL_REASON_BASE).contains(&reason)
                || min_oom_score_adj < 0
            {
                tracing::error!(reason, min_oom_score_adj, "invalid vendor kill request");
                return TickOutcome::quiet();
            }
            Some((
                KillReason::Vendor(reason),
                min_oom_score_adj,
                format!("vendor kill with reason {reason}, min_score_adj {min_oom_score_adj}"),
            ))
        } else if cycle_after_kill && wmark < WatermarkLevel::Low {
            // A kill just completed yet the device is still under the min
            // watermark; the workload is allocating faster than we free.
            Some((
                KillReason::PressureAfterKill,
                config.pressure_after_kill_min_score,
                "min watermark is breached even after kill".to_string(),
            ))
        } else if matches!(origin, EventOrigin::Psi { level: PressureLevel::Critical, .. })
            && events != 0
        {
            Some((KillReason::NotResponding, 0, "device is not responding".to_string()))
        } else if swap_is_low && thrashing > config.thrashing_limit_pct {
            let min = if wmark > WatermarkLevel::Min && thrashing < config.thrashing_critical_pct
            {
                PERCEPTIBLE_APP_ADJ + 1
            } else {
                0
            };
            self.check_filecache = true;
            Some((
                KillReason::LowSwapAndThrashing,
                min,
                format!(
                    "device is low on swap ({}kB < {}kB) and thrashing ({thrashing}%)",
                    free_swap_pages * page_k,
                    swap_low_threshold * page_k
                ),
            ))
        } else if swap_is_low && wmark < WatermarkLevel::High {
            let min = if wmark > WatermarkLevel::Min && thrashing < config.thrashing_critical_pct
            {
                PERCEPTIBLE_APP_ADJ + 1
            } else {
                0
            };
            Some((
                KillReason::LowMemAndSwap,
                min,
                format!(
                    "{} watermark is breached and swap is low ({}kB < {}kB)",
                    breached_name(wmark),
                    free_swap_pages * page_k,
                    swap_low_threshold * page_k
                ),
            ))
        } else if wmark < WatermarkLevel::High && config.swap_util_max < 100 && {
            swap_util = swap_utilization(&mi, free_swap_pages);
            swap_util > config.swap_util_max
        } {
            // Heavily swapped anon but swap itself is fine: unswappable
            // allocations are the real pressure.
            Some((
                KillReason::LowMemAndSwapUtil,
                0,
                format!(
                    "{} watermark is breached and swap utilization is high ({swap_util}% > {}%)",
                    breached_name(wmark),
                    config.swap_util_max
                ),
            ))
        } else if wmark < WatermarkLevel::High && thrashing > thrashing_limit {
            cut_thrashing_limit = true;
            self.check_filecache = true;
            let min = if thrashing < config.thrashing_critical_pct {
                PERCEPTIBLE_APP_ADJ + 1
            } else {
                0
            };
            Some((
                KillReason::LowMemAndThrashing,
                min,
                format!(
                    "{} watermark is breached and thrashing ({thrashing}%)",
                    breached_name(wmark)
                ),
            ))
        } else if reclaim == ReclaimState::Direct && thrashing > thrashing_limit {
            cut_thrashing_limit = true;
            self.check_filecache = true;
            let min = if thrashing < config.thrashing_critical_pct {
                PERCEPTIBLE_APP_ADJ + 1
            } else {
                0
            };
            Some((
                KillReason::DirectReclaimAndThrashing,
                min,
                format!("device is in direct reclaim and thrashing ({thrashing}%)"),
            ))
        } else if reclaim == ReclaimState::Direct
            && config.direct_reclaim_threshold_ms > 0
            && direct_reclaim_duration
                .map(|d| d.as_millis() as u64 > config.direct_reclaim_threshold_ms)
                .unwrap_or(false)
        {
            Some((
                KillReason::DirectReclaimStuck,
                0,
                format!(
                    "device is stuck in direct reclaim ({}ms > {}ms)",
                    direct_reclaim_duration.map(|d| d.as_millis()).unwrap_or(0),
                    config.direct_reclaim_threshold_ms
                ),
            ))
        } else if self.check_filecache {
            let file_lru_kb = vs.file_lru() * page_k;
            if file_lru_kb < config.filecache_min_kb {
                Some((
                    KillReason::LowFileCacheAfterThrashing,
                    PERCEPTIBLE_APP_ADJ + 1,
                    format!(
                        "filecache is low ({file_lru_kb}kB < {}kB) after thrashing",
                        config.filecache_min_kb
                    ),
                ))
            } else {
                self.check_filecache = false;
                None
            }
        } else {
            None
        };

        // Cached-app fallback when nothing above matched.
        let decided = decided.or_else(|| {
            if wmark < WatermarkLevel::High {
                Some((
                    KillReason::LowMem,
                    config.lowmem_min_oom_score,
                    format!("{} watermark is breached", breached_name(wmark)),
                ))
            } else {
                None
            }
        });

        let mut pages_freed = 0;
        if let Some((reason, mut min_oom_score_adj, desc)) = decided {
            if critical_stall {
                // The whole system is stalled; perceptibles become fair game.
                min_oom_score_adj = 0;
            }
            let call = KillCall {
                reason,
                min_oom_score_adj,
                desc,
                thrashing_pct: thrashing,
                max_thrashing,
                wakeup: self.wakeup,
            };
            pages_freed = killer.kill(&call, &mi);
            if pages_freed > 0 {
                self.killing = true;
                if let Some(window) = self.thrashing.as_mut() {
                    window.max_thrashing = 0;
                    if cut_thrashing_limit {
                        // Tighten the limit until the system stops
                        // thrashing; restored at the next window boundary.
                        window.cut_limit(config.thrashing_limit_decay_pct);
                    }
                }
            }
        }

        let mut outcome = self.no_kill_outcome(events, swap_is_low, reclaim);
        outcome.pages_freed = pages_freed.max(0);
        outcome.killed = pages_freed > 0;
        outcome
    }

    /// Polling directive shared by the kill and no-kill exits.
    fn no_kill_outcome(
        &self,
        events: u32,
        swap_is_low: bool,
        reclaim: ReclaimState,
    ) -> TickOutcome {
        // Extend polling through direct reclaim and kills, but not through
        // kswapd activity, which can run for a long time without real
        // pressure.
        let start_polling =
            events > 0 || self.killing || reclaim == ReclaimState::Direct;
        let poll_interval_ms = if swap_is_low || self.killing {
            PSI_POLL_PERIOD_SHORT_MS
        } else {
            PSI_POLL_PERIOD_LONG_MS
        };
        TickOutcome { pages_freed: 0, killed: false, start_polling, poll_interval_ms }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn breached_name(wmark: WatermarkLevel) -> &'static str {
    if wmark < WatermarkLevel::Low {
        "min"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::PropertyStore;

    struct RecordingKiller {
        calls: Vec<KillCall>,
        pages_freed: i64,
    }

    impl RecordingKiller {
        fn new(pages_freed: i64) -> Self {
            Self { calls: Vec::new(), pages_freed }
        }

        fn last(&self) -> &KillCall {
            self.calls.last().expect("no kill dispatched")
        }
    }

    impl VictimKiller for RecordingKiller {
        fn kill(&mut self, call: &KillCall, _mi: &MemInfo) -> i64 {
            self.calls.push(call.clone());
            self.pages_freed
        }
    }

    fn config() -> Config {
        let mut props = PropertyStore::new();
        props.set("filecache_min_kb", "0");
        Config::from_store(&props)
    }

    fn watermarks() -> ZoneWatermarks {
        ZoneWatermarks { high: 3000, low: 2000, min: 1000 }
    }

    /// Free memory chosen to breach the given watermark level.
    fn meminfo_at(wmark: WatermarkLevel) -> MemInfo {
        let free = match wmark {
            WatermarkLevel::Min => 500,
            WatermarkLevel::Low => 1500,
            WatermarkLevel::High => 2500,
            WatermarkLevel::None => 50000,
        };
        MemInfo {
            nr_free_pages: free,
            total_swap: 500000,
            free_swap: 250000,
            easy_available: 500000,
            active_anon: 100000,
            inactive_anon: 100000,
            shmem: 10000,
            ..Default::default()
        }
    }

    fn inputs(origin: EventOrigin, vs: VmStat, mi: MemInfo, now: Instant) -> TickInputs {
        TickInputs {
            origin,
            vs,
            mi,
            watermarks: watermarks(),
            psi_mem_full_avg10: None,
            memevents: None,
            now,
        }
    }

    fn medium_event() -> EventOrigin {
        EventOrigin::Psi { level: PressureLevel::Medium, events: 1 }
    }

    /// Scenario: fresh medium pressure with plenty of swap and no
    /// reclaim/thrashing movement. No kill; polling starts at the long
    /// interval.
    #[test]
    fn test_fresh_pressure_no_kill() {
        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(0);
        let now = Instant::now();
        let out = engine.run_tick(
            &config(),
            &inputs(medium_event(), VmStat::default(), meminfo_at(WatermarkLevel::None), now),
            &mut killer,
        );
        assert!(killer.calls.is_empty());
        assert!(!out.killed);
        assert!(out.start_polling);
        assert_eq!(out.poll_interval_ms, PSI_POLL_PERIOD_LONG_MS);
    }

    /// Scenario: swap nearly gone while the cache thrashes hard. Reason is
    /// low-swap-and-thrashing with the perceptible floor, and polling drops
    /// to the short interval.
    #[test]
    fn test_low_swap_and_thrashing() {
        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(100);
        let t0 = Instant::now();

        // Prime the thrashing baseline.
        let vs0 = VmStat {
            workingset_refault_file: 1000,
            nr_inactive_file: 99,
            pgscan_kswapd: 1,
            ..Default::default()
        };
        let mut mi = meminfo_at(WatermarkLevel::None);
        engine.run_tick(&config(), &inputs(medium_event(), vs0, mi, t0), &mut killer);
        assert!(killer.calls.is_empty());

        // 150% thrashing with free swap at 5% of total.
        mi.free_swap = 25000;
        mi.easy_available = 25000;
        let vs1 = VmStat {
            workingset_refault_file: 1150,
            nr_inactive_file: 99,
            pgscan_kswapd: 2,
            ..Default::default()
        };
        let out = engine.run_tick(
            &config(),
            &inputs(medium_event(), vs1, mi, t0 + Duration::from_millis(500)),
            &mut killer,
        );
        let call = killer.last();
        assert_eq!(call.reason, KillReason::LowSwapAndThrashing);
        assert_eq!(call.min_oom_score_adj, PERCEPTIBLE_APP_ADJ + 1);
        assert!(out.killed);
        assert_eq!(out.poll_interval_ms, PSI_POLL_PERIOD_SHORT_MS);
    }

    /// Scenario: critical PSI event while the full-stall average is over the
    /// limit. Reason is not-responding and the floor is forced to 0.
    #[test]
    fn test_critical_stall_forces_floor() {
        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(50);
        let now = Instant::now();
        let vs = VmStat { pgscan_kswapd: 1, ..Default::default() };
        let mut tick = inputs(
            EventOrigin::Psi { level: PressureLevel::Critical, events: 1 },
            vs,
            meminfo_at(WatermarkLevel::None),
            now,
        );
        tick.psi_mem_full_avg10 = Some(150.0);
        engine.run_tick(&config(), &tick, &mut killer);
        let call = killer.last();
        assert_eq!(call.reason, KillReason::NotResponding);
        assert_eq!(call.min_oom_score_adj, 0);
    }

    /// Scenario: the previous kill completed but free memory is still under
    /// the min watermark.
    #[test]
    fn test_pressure_after_kill() {
        let mut props = PropertyStore::new();
        props.set("pressure_after_kill_min_score", "300");
        let config = Config::from_store(&props);

        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(100);
        let t0 = Instant::now();

        // A successful kill leaves `killing` set.
        let vs = VmStat { pgscan_kswapd: 1, ..Default::default() };
        let mut tick = inputs(
            EventOrigin::Psi { level: PressureLevel::Critical, events: 1 },
            vs,
            meminfo_at(WatermarkLevel::Min),
            t0,
        );
        engine.run_tick(&config, &tick, &mut killer);
        assert!(engine.killing);

        // Next polling tick still sees min breached.
        tick.origin = EventOrigin::Psi { level: PressureLevel::Critical, events: 0 };
        tick.vs.pgscan_kswapd = 2;
        tick.now = t0 + Duration::from_millis(50);
        engine.run_tick(&config, &tick, &mut killer);
        let call = killer.last();
        assert_eq!(call.reason, KillReason::PressureAfterKill);
        assert_eq!(call.min_oom_score_adj, 300);
    }

    /// Scenario: the event stream reports direct reclaim running for longer
    /// than the configured threshold, with no other signal.
    #[test]
    fn test_direct_reclaim_stuck() {
        let mut props = PropertyStore::new();
        props.set("direct_reclaim_threshold_ms", "500");
        let config = Config::from_store(&props);

        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(10);
        let mut tick = inputs(
            medium_event(),
            VmStat::default(),
            meminfo_at(WatermarkLevel::None),
            Instant::now(),
        );
        tick.memevents = Some(MemEventsState {
            direct_reclaim_since: Some(Duration::from_millis(600)),
            kswapd_active: false,
        });
        engine.run_tick(&config, &tick, &mut killer);
        let call = killer.last();
        assert_eq!(call.reason, KillReason::DirectReclaimStuck);
        assert_eq!(call.min_oom_score_adj, 0);
    }

    /// Vendor events bypass the derived clauses entirely.
    #[test]
    fn test_vendor_kill() {
        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(10);
        let tick = inputs(
            EventOrigin::Vendor { reason: 3, min_oom_score_adj: 500 },
            VmStat { pgscan_kswapd: 1, ..Default::default() },
            meminfo_at(WatermarkLevel::None),
            Instant::now(),
        );
        engine.run_tick(&config(), &tick, &mut killer);
        let call = killer.last();
        assert_eq!(call.reason, KillReason::Vendor(3));
        assert_eq!(call.reason.code(), VENDOR_KILL_REASON_BASE + 3);
        assert_eq!(call.min_oom_score_adj, 500);
    }

    /// A malformed vendor request is dropped.
    #[test]
    fn test_vendor_kill_invalid() {
        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(10);
        let tick = inputs(
            EventOrigin::Vendor { reason: -1, min_oom_score_adj: 500 },
            VmStat { pgscan_kswapd: 1, ..Default::default() },
            meminfo_at(WatermarkLevel::None),
            Instant::now(),
        );
        engine.run_tick(&config(), &tick, &mut killer);
        assert!(killer.calls.is_empty());
    }

    /// Low-memory fallback picks the configured floor.
    #[test]
    fn test_low_mem_fallback() {
        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(10);
        let tick = inputs(
            medium_event(),
            VmStat { pgscan_kswapd: 1, ..Default::default() },
            meminfo_at(WatermarkLevel::High),
            Instant::now(),
        );
        engine.run_tick(&config(), &tick, &mut killer);
        let call = killer.last();
        assert_eq!(call.reason, KillReason::LowMem);
        assert_eq!(call.min_oom_score_adj, config().lowmem_min_oom_score);
    }

    /// Swap-util clause fires only when configured below 100.
    #[test]
    fn test_swap_util() {
        let mut props = PropertyStore::new();
        props.set("swap_util_max", "30");
        let config = Config::from_store(&props);

        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(10);
        let mut mi = meminfo_at(WatermarkLevel::High);
        // Most swappable memory is already swapped out.
        mi.total_swap = 500000;
        mi.free_swap = 100000;
        mi.easy_available = 500000;
        mi.active_anon = 50000;
        mi.inactive_anon = 50000;
        mi.shmem = 0;
        let tick = inputs(
            medium_event(),
            VmStat { pgscan_kswapd: 1, ..Default::default() },
            mi,
            Instant::now(),
        );
        engine.run_tick(&config, &tick, &mut killer);
        assert_eq!(killer.last().reason, KillReason::LowMemAndSwapUtil);
    }

    /// A lower-level event inside the polling window is ignored.
    #[test]
    fn test_level_gating() {
        let mut engine = Engine::new();
        let mut killer = RecordingKiller::new(0);
        let t0 = Instant::now();
        let vs = VmStat { pgscan_kswapd: 1, ..Default::default() };

        engine.run_tick(
            &config(),
            &inputs(medium_event(), vs, meminfo_at(WatermarkLevel::None), t0),
            &mut killer,
        );
        let out = engine.run_tick(
            &config(),
            &inputs(
                EventOrigin::Psi { level: PressureLevel::Low, events: 1 },
                vs,
                meminfo_at(WatermarkLevel::None),
                t0 + Duration::from_millis(100),
            ),
            &mut killer,
        );
        // Ignored outright: no polling restart either.
        assert!(!out.start_polling);
        // A polling tick resets the remembered level.
        engine.run_tick(
            &config(),
            &inputs(
                EventOrigin::Psi { level: PressureLevel::Medium, events: 0 },
                vs,
                meminfo_at(WatermarkLevel::None),
                t0 + Duration::from_millis(200),
            ),
            &mut killer,
        );
        assert_eq!(engine.prev_level, PressureLevel::Low);
    }

    /// Identical fixed inputs always select the same clause.
    #[test]
    fn test_decision_determinism() {
        for _ in 0..3 {
            let mut engine = Engine::new();
            let mut killer = RecordingKiller::new(10);
            let mut mi = meminfo_at(WatermarkLevel::Low);
            mi.free_swap = 10000;
            mi.easy_available = 10000;
            let tick = inputs(
                medium_event(),
                VmStat { pgscan_kswapd: 1, ..Default::default() },
                mi,
                Instant::now(),
            );
            engine.run_tick(&config(), &tick, &mut killer);
            assert_eq!(killer.last().reason, KillReason::LowMemAndSwap);
        }
    }
}
