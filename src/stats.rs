//! Kill event records and metrics.

use crate::engine::WakeupInfo;
use crate::procfs::{MemInfo, PsiData, PsiKind};
use metrics::{counter, gauge, Unit};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const KILLS_TOTAL: &str = "lowmemd_kills_total";
const PAGES_FREED: &str = "lowmemd_pages_freed_total";
const SKIPPED_WAKEUPS: &str = "lowmemd_skipped_wakeups_total";
const WATCHDOG_KILLS: &str = "lowmemd_watchdog_kills_total";
const POLLING_ACTIVE: &str = "lowmemd_polling_active";

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Describe metrics once at startup; later calls are no-ops.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    metrics::describe_counter!(KILLS_TOTAL, Unit::Count, "Processes killed, by reason");
    metrics::describe_counter!(PAGES_FREED, Unit::Count, "Pages freed by kills");
    metrics::describe_counter!(
        SKIPPED_WAKEUPS,
        Unit::Count,
        "Wakeups skipped while a kill was in flight"
    );
    metrics::describe_counter!(WATCHDOG_KILLS, Unit::Count, "Emergency kills by the watchdog");
    metrics::describe_gauge!(POLLING_ACTIVE, Unit::Count, "Whether pressure polling is active");
}

/// Record a completed kill.
pub fn record_kill(reason: &'static str, pages_freed: i64) {
    counter!(KILLS_TOTAL, "reason" => reason).increment(1);
    counter!(PAGES_FREED).increment(pages_freed.max(0) as u64);
}

/// Record a wakeup skipped because the previous victim is still dying.
pub fn record_skipped_wakeup() {
    counter!(SKIPPED_WAKEUPS).increment(1);
}

/// Record an emergency kill from the watchdog.
pub fn record_watchdog_kill() {
    counter!(WATCHDOG_KILLS).increment(1);
}

/// Track the polling state for dashboards.
pub fn record_polling_active(active: bool) {
    gauge!(POLLING_ACTIVE).set(if active { 1.0 } else { 0.0 });
}

/// The ordered kill event record shipped to the statistics pipeline.
///
/// Field order is fixed; consumers index into the line positionally.
#[derive(Debug, Clone)]
pub struct KillRecord {
    /// Victim pid.
    pub pid: i32,
    /// Victim uid.
    pub uid: u32,
    /// Victim adjustment.
    pub oom_adj: i32,
    /// Floor the walk used.
    pub min_oom_adj: i32,
    /// Victim RSS in kB.
    pub rss_kb: i64,
    /// Kill reason code.
    pub reason_code: i32,
    /// All meminfo fields in kB, file order.
    pub meminfo_kb: [i64; 19],
    /// ms between the last real pressure event and the kill.
    pub since_event_ms: i64,
    /// ms between the previous wakeup and the kill.
    pub since_prev_wakeup_ms: i64,
    /// Polling wakeups since the last real event.
    pub wakeups_since_event: u32,
    /// Wakeups skipped while a previous kill was in flight.
    pub skipped_wakeups: u32,
    /// Victim swap usage in kB.
    pub swap_kb: i64,
    /// Total GPU memory in kB.
    pub total_gpu_kb: i64,
    /// Thrashing percentage at decision time.
    pub thrashing: i64,
    /// Peak thrashing since the previous kill.
    pub max_thrashing: i64,
    /// avg10 values: mem-some, mem-full, io-some, io-full, cpu-some.
    pub psi_avg10: [f32; 5],
}

impl KillRecord {
    /// Assemble a record from its sources.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        pid: i32,
        uid: u32,
        oom_adj: i32,
        min_oom_adj: i32,
        rss_kb: i64,
        swap_kb: i64,
        reason_code: i32,
        thrashing: i64,
        max_thrashing: i64,
        mi: &MemInfo,
        wakeup: &WakeupInfo,
        psi: Option<&PsiData>,
        now: Instant,
    ) -> Self {
        let page_k = crate::page_k();
        let mut meminfo_kb = mi.record_fields();
        for field in &mut meminfo_kb {
            *field *= page_k;
        }
        let elapsed_ms =
            |at: Option<Instant>| at.map(|t| now.duration_since(t).as_millis() as i64).unwrap_or(0);
        let avg10 = |stats: &crate::procfs::ResourceStats, kind: PsiKind| stats[kind as usize].avg10;

        Self {
            pid,
            uid,
            oom_adj,
            min_oom_adj,
            rss_kb,
            reason_code,
            meminfo_kb,
            since_event_ms: elapsed_ms(wakeup.last_event_at),
            since_prev_wakeup_ms: elapsed_ms(wakeup.prev_wakeup_at),
            wakeups_since_event: wakeup.wakeups_since_event,
            skipped_wakeups: wakeup.skipped_wakeups,
            swap_kb,
            total_gpu_kb: mi.total_gpu_kb,
            thrashing,
            max_thrashing,
            psi_avg10: psi
                .map(|pd| {
                    [
                        avg10(&pd.mem, PsiKind::Some),
                        avg10(&pd.mem, PsiKind::Full),
                        avg10(&pd.io, PsiKind::Some),
                        avg10(&pd.io, PsiKind::Full),
                        avg10(&pd.cpu, PsiKind::Some),
                    ]
                })
                .unwrap_or([0.0; 5]),
        }
    }

    /// Positional encoding, space separated.
    pub fn to_line(&self) -> String {
        use std::fmt::Write;
        let mut line = String::with_capacity(256);
        let _ = write!(
            line,
            "{} {} {} {} {} {}",
            self.pid, self.uid, self.oom_adj, self.min_oom_adj, self.rss_kb, self.reason_code
        );
        for field in &self.meminfo_kb {
            let _ = write!(line, " {field}");
        }
        let _ = write!(
            line,
            " {} {} {} {} {} {} {} {}",
            self.since_event_ms,
            self.since_prev_wakeup_ms,
            self.wakeups_since_event,
            self.skipped_wakeups,
            self.swap_kb,
            self.total_gpu_kb,
            self.thrashing,
            self.max_thrashing
        );
        for value in &self.psi_avg10 {
            let _ = write!(line, " {value:.2}");
        }
        line
    }

    /// Emit the record into the log stream.
    pub fn emit(&self) {
        tracing::info!(target: "lowmemd::killinfo", record = %self.to_line(), "kill record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_field_count_and_order() {
        let mi = MemInfo { nr_free_pages: 100, cma_free: 7, ..Default::default() };
        let wakeup = WakeupInfo::default();
        let record = KillRecord::assemble(
            1234, 1000, 900, 201, 4096, 512, 2, 150, 180, &mi, &wakeup, None,
            Instant::now(),
        );
        let line = record.to_line();
        let fields: Vec<&str> = line.split(' ').collect();
        // 6 process fields + 19 meminfo + 4 wakeup + 4 memory extras + 5 psi.
        assert_eq!(fields.len(), 6 + 19 + 4 + 4 + 5);
        assert_eq!(fields[0], "1234");
        assert_eq!(fields[5], "2");
        // First meminfo field is free memory in kB.
        assert_eq!(fields[6], (100 * crate::page_k()).to_string());
        // Last meminfo field is CmaFree.
        assert_eq!(fields[24], (7 * crate::page_k()).to_string());
        // max-thrashing sits right before the five PSI values.
        assert_eq!(fields[32], "180");
    }

    #[test]
    fn test_psi_values_present() {
        let mut psi = PsiData::default();
        psi.mem[PsiKind::Full as usize].avg10 = 12.5;
        let record = KillRecord::assemble(
            1, 0, 0, 0, 0, 0, 0, 0, 0,
            &MemInfo::default(),
            &WakeupInfo::default(),
            Some(&psi),
            Instant::now(),
        );
        assert_eq!(record.psi_avg10[1], 12.5);
        assert!(record.to_line().contains("12.50"));
    }
}
