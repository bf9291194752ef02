//! Derived memory-state signals: zone watermarks, swap accounting and the
//! thrashing window.

use crate::procfs::{MemInfo, VmStat, ZoneInfo, ZoneInfoReader};
use crate::error::Result;
use std::time::{Duration, Instant};

/// Thrashing counters reset at this boundary; also the decay window.
pub const THRASHING_RESET_INTERVAL: Duration = Duration::from_millis(1000);

/// Zone watermark refresh period when the kernel cannot notify us.
const WATERMARK_REFRESH_PERIOD: Duration = Duration::from_secs(60);

/// Which aggregated watermark current free memory falls below.
///
/// Ordered from worst to best: `Min < Low < High < None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatermarkLevel {
    /// Below the min watermark; allocation stalls are imminent.
    Min,
    /// Below the low watermark; kswapd is working.
    Low,
    /// Below the high watermark.
    High,
    /// No watermark breached.
    None,
}

impl WatermarkLevel {
    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            WatermarkLevel::Min => "min",
            WatermarkLevel::Low => "low",
            WatermarkLevel::High => "high",
            WatermarkLevel::None => "none",
        }
    }
}

/// Zone watermarks aggregated across populated zones, pages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZoneWatermarks {
    /// Sum of per-zone high watermark plus max protection.
    pub high: i64,
    /// Sum of per-zone low watermark plus max protection.
    pub low: i64,
    /// Sum of per-zone min watermark plus max protection.
    pub min: i64,
}

impl ZoneWatermarks {
    /// Aggregate watermarks from parsed zoneinfo.
    pub fn from_zoneinfo(zi: &ZoneInfo) -> Self {
        let mut wm = Self::default();
        for zone in zi.populated_zones() {
            wm.high += zone.max_protection + zone.high;
            wm.low += zone.max_protection + zone.low;
            wm.min += zone.max_protection + zone.min;
        }
        wm
    }

    /// Lowest watermark breached by current free memory, CMA excluded.
    pub fn lowest_breached(&self, mi: &MemInfo) -> WatermarkLevel {
        let nr_free_pages = mi.nr_free_pages - mi.cma_free;
        if nr_free_pages < self.min {
            WatermarkLevel::Min
        } else if nr_free_pages < self.low {
            WatermarkLevel::Low
        } else if nr_free_pages < self.high {
            WatermarkLevel::High
        } else {
            WatermarkLevel::None
        }
    }
}

/// Cached watermarks with refresh policy.
///
/// Zoneinfo is re-parsed on first use, when the kernel event stream reports
/// a zoneinfo update, or every 60 seconds when that event is unsupported.
pub struct WatermarkState {
    watermarks: ZoneWatermarks,
    updated_at: Option<Instant>,
}

impl WatermarkState {
    /// Create an uninitialized state; the first [`Self::current`] call
    /// parses zoneinfo.
    pub fn new() -> Self {
        Self { watermarks: ZoneWatermarks::default(), updated_at: None }
    }

    /// Drop the cache so the next query re-parses.
    pub fn force_refresh(&mut self) {
        self.updated_at = None;
    }

    /// Get watermarks, refreshing per policy.
    pub fn current(
        &mut self,
        reader: &mut ZoneInfoReader,
        now: Instant,
        update_events_supported: bool,
    ) -> Result<ZoneWatermarks> {
        let stale = match self.updated_at {
            None => true,
            Some(at) => {
                !update_events_supported && now.duration_since(at) > WATERMARK_REFRESH_PERIOD
            }
        };
        if stale {
            self.refresh(reader, now)?;
        }
        Ok(self.watermarks)
    }

    /// Re-parse zoneinfo immediately (kernel told us it changed).
    pub fn refresh(&mut self, reader: &mut ZoneInfoReader, now: Instant) -> Result<()> {
        let zi = reader.read()?;
        self.watermarks = ZoneWatermarks::from_zoneinfo(&zi);
        self.updated_at = Some(now);
        Ok(())
    }
}

impl Default for WatermarkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Usable free swap in pages.
///
/// With zram the raw SwapFree overstates what is usable because compressed
/// swap competes with the memory being freed, so the value is capped at
/// easily-available memory scaled by the configured compression ratio. A
/// ratio of 0 disables the cap.
pub fn free_swap(mi: &MemInfo, compression_ratio: i64) -> i64 {
    if compression_ratio != 0 {
        mi.free_swap.min(mi.easy_available * compression_ratio)
    } else {
        mi.free_swap
    }
}

/// Percentage of swappable memory already swapped out.
pub fn swap_utilization(mi: &MemInfo, free_swap: i64) -> i32 {
    let swap_used = mi.total_swap - free_swap;
    let total_swappable = mi.active_anon + mi.inactive_anon + mi.shmem + swap_used;
    if total_swappable > 0 {
        ((swap_used * 100) / total_swappable) as i32
    } else {
        0
    }
}

/// Per-cycle thrashing accounting.
///
/// Thrashing is the percentage of the file LRU refaulted since the window
/// baseline. Baselines reset after every kill and at 1-second boundaries;
/// growth measured in a finished window carries into the next with geometric
/// decay by window count, except when the finished window was over the limit
/// with no victim available, in which case it is preserved so a later
/// arrival of an eligible process still triggers a kill.
pub struct ThrashingWindow {
    base_file_lru: i64,
    init_ws_refault: i64,
    reset_at: Instant,
    prev_growth: i64,
    /// Currently effective thrashing limit, decayed after thrashing kills.
    pub limit: i64,
    /// Largest thrashing percentage seen since the last kill.
    pub max_thrashing: i64,
}

impl ThrashingWindow {
    /// Start accounting with current counters as the baseline.
    pub fn new(vs: &VmStat, now: Instant, limit: i64) -> Self {
        Self {
            base_file_lru: vs.file_lru(),
            init_ws_refault: vs.refault_file(),
            reset_at: now,
            prev_growth: 0,
            limit,
            max_thrashing: 0,
        }
    }

    /// Reset the baseline after a completed kill.
    pub fn reset_after_kill(&mut self, vs: &VmStat, now: Instant) {
        self.base_file_lru = vs.file_lru();
        self.init_ws_refault = vs.refault_file();
        self.reset_at = now;
        self.prev_growth = 0;
    }

    /// Advance the window and return the current thrashing percentage.
    ///
    /// `base_limit` restores the configured limit at window boundaries after
    /// decay.
    pub fn advance(&mut self, vs: &VmStat, now: Instant, base_limit: i64) -> i64 {
        let refault = vs.refault_file();
        let since_reset = now.duration_since(self.reset_at);
        let mut thrashing;

        if since_reset > THRASHING_RESET_INTERVAL {
            let windows_passed =
                (since_reset.as_millis() / THRASHING_RESET_INTERVAL.as_millis()) as u32;
            self.prev_growth =
                (refault - self.init_ws_refault) * 100 / (self.base_file_lru + 1);
            // Decay carried growth unless the window we just crossed was
            // over the limit, which means no eligible victim existed and the
            // counter must survive to trigger a kill once one appears.
            if windows_passed > 1 || self.prev_growth < self.limit {
                self.prev_growth >>= windows_passed.min(62);
            }
            self.base_file_lru = vs.file_lru();
            self.init_ws_refault = refault;
            self.reset_at = now;
            self.limit = base_limit;
            thrashing = 0;
        } else {
            thrashing = (refault - self.init_ws_refault) * 100 / (self.base_file_lru + 1);
        }

        thrashing += self.prev_growth;
        if thrashing > self.max_thrashing {
            self.max_thrashing = thrashing;
        }
        thrashing
    }

    /// Decay the limit after a successful thrashing-driven kill.
    pub fn cut_limit(&mut self, decay_pct: i64) {
        self.limit = self.limit * (100 - decay_pct) / 100;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfs::ZoneInfo;

    fn meminfo(free: i64, cma: i64) -> MemInfo {
        MemInfo { nr_free_pages: free, cma_free: cma, ..Default::default() }
    }

    #[test]
    fn test_watermark_aggregation() {
        let zi = ZoneInfo::parse(
            "Node 0, zone Normal\n\
             \x20 per-node stats\n\
             \x20     nr_inactive_file 0\n\
             \x20     nr_active_file 0\n\
             \x20 pages free 500\n\
             \x20       min 100\n\
             \x20       low 200\n\
             \x20       high 300\n\
             \x20       present 1000\n\
             \x20       protection: (0, 50)\n",
        )
        .unwrap();
        let wm = ZoneWatermarks::from_zoneinfo(&zi);
        assert_eq!(wm, ZoneWatermarks { high: 350, low: 250, min: 150 });
    }

    #[test]
    fn test_lowest_breached() {
        let wm = ZoneWatermarks { high: 300, low: 200, min: 100 };
        assert_eq!(wm.lowest_breached(&meminfo(50, 0)), WatermarkLevel::Min);
        assert_eq!(wm.lowest_breached(&meminfo(150, 0)), WatermarkLevel::Low);
        assert_eq!(wm.lowest_breached(&meminfo(250, 0)), WatermarkLevel::High);
        assert_eq!(wm.lowest_breached(&meminfo(400, 0)), WatermarkLevel::None);
        // CMA pages do not count as free.
        assert_eq!(wm.lowest_breached(&meminfo(250, 200)), WatermarkLevel::Min);
    }

    #[test]
    fn test_watermark_ordering() {
        assert!(WatermarkLevel::Min < WatermarkLevel::Low);
        assert!(WatermarkLevel::Low < WatermarkLevel::High);
        assert!(WatermarkLevel::High < WatermarkLevel::None);
    }

    #[test]
    fn test_free_swap_compression_cap() {
        let mi = MemInfo {
            free_swap: 10000,
            easy_available: 3000,
            ..Default::default()
        };
        assert_eq!(free_swap(&mi, 1), 3000);
        assert_eq!(free_swap(&mi, 2), 6000);
        // Ratio 0 ignores available memory entirely.
        assert_eq!(free_swap(&mi, 0), 10000);
    }

    #[test]
    fn test_swap_utilization() {
        let mi = MemInfo {
            total_swap: 1000,
            active_anon: 300,
            inactive_anon: 200,
            shmem: 100,
            ..Default::default()
        };
        // 900 used out of 900 + 600 swappable.
        assert_eq!(swap_utilization(&mi, 100), 60);
        // Denominator of zero yields zero.
        let empty = MemInfo::default();
        assert_eq!(swap_utilization(&empty, 0), 0);
    }

    fn vmstat(refault: i64, file_lru: i64) -> VmStat {
        VmStat {
            workingset_refault_file: refault,
            nr_inactive_file: file_lru,
            nr_active_file: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_thrashing_within_window() {
        let t0 = Instant::now();
        let mut window = ThrashingWindow::new(&vmstat(1000, 99), t0, 100);
        // 100 refaults against a 99-page file LRU: 100%.
        let pct = window.advance(&vmstat(1100, 99), t0 + Duration::from_millis(500), 100);
        assert_eq!(pct, 100);
        assert_eq!(window.max_thrashing, 100);
    }

    #[test]
    fn test_thrashing_decay_across_windows() {
        let t0 = Instant::now();
        let mut window = ThrashingWindow::new(&vmstat(1000, 99), t0, 100);
        // Below-limit growth in the first window decays by one shift.
        let pct = window.advance(&vmstat(1050, 99), t0 + Duration::from_millis(1500), 100);
        assert_eq!(pct, 25);
    }

    #[test]
    fn test_thrashing_preserved_when_over_limit() {
        let t0 = Instant::now();
        let mut window = ThrashingWindow::new(&vmstat(1000, 99), t0, 100);
        // 150% growth crossed exactly one window while over the limit:
        // preserved, not decayed.
        let pct = window.advance(&vmstat(1150, 99), t0 + Duration::from_millis(1500), 100);
        assert_eq!(pct, 150);
    }

    #[test]
    fn test_thrashing_reset_after_kill() {
        let t0 = Instant::now();
        let mut window = ThrashingWindow::new(&vmstat(1000, 99), t0, 100);
        window.advance(&vmstat(1100, 99), t0 + Duration::from_millis(500), 100);
        window.reset_after_kill(&vmstat(1100, 99), t0 + Duration::from_millis(600));
        let pct = window.advance(&vmstat(1100, 99), t0 + Duration::from_millis(700), 100);
        assert_eq!(pct, 0);
    }

    #[test]
    fn test_cut_limit() {
        let t0 = Instant::now();
        let mut window = ThrashingWindow::new(&VmStat::default(), t0, 100);
        window.cut_limit(10);
        assert_eq!(window.limit, 90);
        window.cut_limit(10);
        assert_eq!(window.limit, 81);
    }
}
