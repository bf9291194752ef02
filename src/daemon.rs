//! The daemon object and its single-threaded reactor.
//!
//! One epoll loop demultiplexes control-socket traffic, pressure triggers,
//! death notifications, reaper failures and the periodic polling that
//! follows a pressure event. All registry mutation, kill decisions and
//! control handling happen here; the reaper and watchdog threads talk back
//! exclusively through file descriptors and the shared registry lock.
//!
//! Polling follows the PSI trigger contract: triggers fire at most once per
//! window, so after an event the reactor re-runs the active pressure
//! handler on a timer (10 ms under kill/swap pressure, 100 ms otherwise)
//! and stops one full window after the last qualifying event. While a
//! victim's death notification is pending, polling pauses; it resumes when
//! the process-fd signals, the reaper reports failure, or the kill timeout
//! lapses.

use crate::control::{self, AsyncEvent, Command, ProcPrio, MAX_DATA_CONN, MAX_PACKET_BYTES};
use crate::engine::{
    Engine, EventOrigin, KillCall, MemEventsState, TickInputs, VictimKiller, WakeupInfo,
};
use crate::error::{Error, Result};
use crate::evaluator::WatermarkState;
use crate::killcnt::KillCounts;
use crate::legacy::{LegacyDecision, LegacyEngine, LegacyInputs};
use crate::pressure::psi::{PsiThreshold, DEFAULT_THRESHOLDS};
use crate::pressure::{memcg, MemEvent, MemEventListener, MemcgMonitor, PressureLevel, PsiMonitor};
use crate::procfs::{
    proc_cmdline_name, proc_statm_rss, proc_status, write_oom_score_adj, FileReader, GpuMemReader,
    MemInfo, MemInfoReader, OomAdjWrite, PsiData, PsiKind, PsiReaders, VmStatReader,
    ZoneInfoReader,
};
use crate::props::{Config, PropertyStore};
use crate::reaper::Reaper;
use crate::registry::{ProcessRecord, Registry};
use crate::stats::{self, KillRecord};
use crate::targets::TargetTable;
use crate::watchdog::{self, Watchdog};
use crate::{
    OOM_SCORE_ADJ_MAX, PERCEPTIBLE_APP_ADJ, PSI_POLL_PERIOD_SHORT_MS, PSI_WINDOW_MS,
};
use rustix::event::epoll;
use rustix::fd::{AsFd, OwnedFd};
use smallvec::SmallVec;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

const MAX_EPOLL_EVENTS: usize = 16;

// Epoll token space.
const TOKEN_CTRL_LISTEN: u64 = 1;
const TOKEN_REAPER_FAIL: u64 = 2;
const TOKEN_MEMEVENTS: u64 = 3;
const TOKEN_DEATH_WAIT: u64 = 4;
const TOKEN_DATA_BASE: u64 = 0x100;
const TOKEN_PSI_BASE: u64 = 0x200;
const TOKEN_MEMCG_BASE: u64 = 0x300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    CtrlListen,
    ReaperFail,
    MemEvents,
    DeathWait,
    DataConn(usize),
    PsiMonitor(PressureLevel),
    MemcgMonitor(PressureLevel),
}

impl Token {
    fn decode(raw: u64) -> Option<Token> {
        match raw {
            TOKEN_CTRL_LISTEN => Some(Token::CtrlListen),
            TOKEN_REAPER_FAIL => Some(Token::ReaperFail),
            TOKEN_MEMEVENTS => Some(Token::MemEvents),
            TOKEN_DEATH_WAIT => Some(Token::DeathWait),
            raw if (TOKEN_DATA_BASE..TOKEN_DATA_BASE + MAX_DATA_CONN as u64).contains(&raw) => {
                Some(Token::DataConn((raw - TOKEN_DATA_BASE) as usize))
            }
            raw if (TOKEN_PSI_BASE..TOKEN_PSI_BASE + 3).contains(&raw) => Some(
                Token::PsiMonitor(PressureLevel::from_index((raw - TOKEN_PSI_BASE) as usize)),
            ),
            raw if (TOKEN_MEMCG_BASE..TOKEN_MEMCG_BASE + 3).contains(&raw) => Some(
                Token::MemcgMonitor(PressureLevel::from_index((raw - TOKEN_MEMCG_BASE) as usize)),
            ),
            _ => None,
        }
    }

    fn encode(self) -> u64 {
        match self {
            Token::CtrlListen => TOKEN_CTRL_LISTEN,
            Token::ReaperFail => TOKEN_REAPER_FAIL,
            Token::MemEvents => TOKEN_MEMEVENTS,
            Token::DeathWait => TOKEN_DEATH_WAIT,
            Token::DataConn(idx) => TOKEN_DATA_BASE + idx as u64,
            Token::PsiMonitor(level) => TOKEN_PSI_BASE + level as u64,
            Token::MemcgMonitor(level) => TOKEN_MEMCG_BASE + level as u64,
        }
    }
}

/// Which pressure handler periodic polling re-invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollSource {
    /// New-strategy engine tick at the given level.
    Engine(PressureLevel),
    /// Legacy tick driven by a PSI monitor.
    LegacyPsi(PressureLevel),
    /// Legacy tick driven by a memcg eventfd.
    LegacyMemcg(PressureLevel),
}

impl PollSource {
    fn level(self) -> PressureLevel {
        match self {
            PollSource::Engine(level)
            | PollSource::LegacyPsi(level)
            | PollSource::LegacyMemcg(level) => level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollingUpdate {
    DoNotChange,
    Start,
    Pause,
    Resume,
}

struct PollState {
    handler: Option<PollSource>,
    paused: Option<PollSource>,
    pending: Option<PollSource>,
    update: PollingUpdate,
    interval_ms: u64,
    poll_start: Instant,
    last_poll: Instant,
}

impl PollState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            handler: None,
            paused: None,
            pending: None,
            update: PollingUpdate::DoNotChange,
            interval_ms: crate::PSI_POLL_PERIOD_LONG_MS,
            poll_start: now,
            last_poll: now,
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Outstanding wait for a victim's death.
enum DeathWait {
    /// Process-fd registered with the reactor; EPOLLIN means it died.
    Pidfd {
        pid: i32,
        fd: OwnedFd,
    },
    /// No process-fd support; `/proc/<pid>` existence is polled instead.
    PidCheck {
        pid: i32,
    },
}

struct DataConn {
    stream: UnixStream,
    peer_pid: i32,
    event_mask: u32,
}

/// Everything passed to the single kill path, from either strategy.
struct KillJob {
    min_oom_score_adj: i32,
    reason_code: i32,
    reason_name: &'static str,
    desc: String,
    thrashing: i64,
    max_thrashing: i64,
    wakeup: WakeupInfo,
}

impl KillJob {
    fn from_call(call: &KillCall) -> Self {
        Self {
            min_oom_score_adj: call.min_oom_score_adj,
            reason_code: call.reason.code(),
            reason_name: call.reason.name(),
            desc: call.desc.clone(),
            thrashing: call.thrashing_pct,
            max_thrashing: call.max_thrashing,
            wakeup: call.wakeup,
        }
    }
}

/// Hook consulted before each kill; a positive return means that many pages
/// were freed elsewhere and the kill can be skipped.
pub type FreeMemoryHook = Box<dyn FnMut(i32, i64, i32, i32) -> i64 + Send>;

/// The lowmemd daemon.
pub struct Daemon {
    config: Arc<Config>,
    epoll: OwnedFd,

    registry: Arc<RwLock<Registry>>,
    killcnt: KillCounts,
    targets: TargetTable,
    engine: Engine,
    legacy: LegacyEngine,
    legacy_wakeup: WakeupInfo,

    meminfo: MemInfoReader,
    vmstat: VmStatReader,
    zoneinfo: ZoneInfoReader,
    psi_readers: PsiReaders,
    gpumem: GpuMemReader,
    watermarks: WatermarkState,
    mem_usage_reader: Option<FileReader>,
    memsw_usage_reader: Option<FileReader>,

    psi_monitors: Vec<PsiMonitor>,
    memcg_monitors: Vec<MemcgMonitor>,
    use_psi_monitors: bool,
    monitors_initialized: bool,
    boot_completed_handled: bool,
    memevents: Option<MemEventListener>,
    direct_reclaim_started: Option<Instant>,
    kswapd_started: Option<Instant>,

    listener: UnixListener,
    data_conns: [Option<DataConn>; MAX_DATA_CONN],

    reaper: Arc<Reaper>,
    reaper_fail_fd: OwnedFd,
    death_wait: Option<DeathWait>,
    last_kill_at: Option<Instant>,
    pidfd_supported: bool,
    free_hook: Option<FreeMemoryHook>,

    watchdog: Watchdog,
    poll: PollState,
    page_k: i64,
}

impl Daemon {
    /// Build the daemon: bind the control socket, spawn the reaper and
    /// watchdog, probe optional kernel features, and arm monitors unless
    /// they are deferred past boot.
    pub fn new(props: &PropertyStore) -> Result<Self> {
        let config = Arc::new(Config::from_store(props));
        stats::init_metrics();

        let epoll_fd = epoll::create(epoll::CreateFlags::CLOEXEC)?;

        let socket_path = control::socket_path();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .map_err(|err| Error::Init(format!("cannot bind {}: {err}", socket_path.display())))?;
        listener.set_nonblocking(true)?;
        epoll::add(
            &epoll_fd,
            &listener,
            epoll::EventData::new_u64(Token::CtrlListen.encode()),
            epoll::EventFlags::IN,
        )?;

        let (reaper, reaper_fail_fd) = Reaper::new()?;
        let reaper = Arc::new(reaper);
        epoll::add(
            &epoll_fd,
            &reaper_fail_fd,
            epoll::EventData::new_u64(Token::ReaperFail.encode()),
            epoll::EventFlags::IN,
        )?;

        let registry = Arc::new(RwLock::new(Registry::new()));
        let wd_registry = Arc::clone(&registry);
        let wd_reaper = Arc::clone(&reaper);
        let watchdog = Watchdog::spawn(move || {
            stats::record_watchdog_kill();
            watchdog::emergency_kill(&wd_registry, &wd_reaper);
        })
        .map_err(|err| Error::Init(format!("cannot start watchdog: {err}")))?;

        let pidfd_supported = rustix::process::pidfd_open(
            rustix::process::getpid(),
            rustix::process::PidfdFlags::empty(),
        )
        .is_ok();
        tracing::info!(supported = pidfd_supported, "process-fd death notification");

        // Zoneinfo is the largest file we read; one warm-up read sizes its
        // buffer before any pressure hits.
        let mut zoneinfo = ZoneInfoReader::new();
        if let Err(err) = zoneinfo.warm_up() {
            tracing::error!(%err, "cannot prime zoneinfo reader");
        }

        let gpumem = GpuMemReader::new(&config.gpumem_path);

        let mut daemon = Self {
            epoll: epoll_fd,
            registry,
            killcnt: KillCounts::new(),
            targets: TargetTable::new(),
            engine: Engine::new(),
            legacy: LegacyEngine::new(),
            legacy_wakeup: WakeupInfo::default(),
            meminfo: MemInfoReader::new(),
            vmstat: VmStatReader::new(),
            zoneinfo,
            psi_readers: PsiReaders::new(),
            gpumem,
            watermarks: WatermarkState::new(),
            mem_usage_reader: None,
            memsw_usage_reader: None,
            psi_monitors: Vec::new(),
            memcg_monitors: Vec::new(),
            use_psi_monitors: false,
            monitors_initialized: false,
            boot_completed_handled: false,
            memevents: None,
            direct_reclaim_started: None,
            kswapd_started: None,
            listener,
            data_conns: std::array::from_fn(|_| None),
            reaper,
            reaper_fail_fd,
            death_wait: None,
            last_kill_at: None,
            pidfd_supported,
            free_hook: None,
            watchdog,
            poll: PollState::new(),
            page_k: crate::page_k(),
            config,
        };

        if !daemon.config.delay_monitors_until_boot || daemon.config.boot_completed {
            daemon.init_monitors()?;
        } else {
            tracing::info!("pressure monitors deferred until boot completes");
        }

        Ok(daemon)
    }

    /// Install the free-memory-before-kill hook.
    pub fn set_free_memory_hook(&mut self, hook: FreeMemoryHook) {
        self.free_hook = Some(hook);
    }

    /// The reactor loop. Never returns except on a fatal epoll error.
    pub fn run(&mut self) -> Result<()> {
        let mut events = epoll::EventVec::with_capacity(MAX_EPOLL_EVENTS);
        loop {
            events.clear();

            if let Some(source) = self.poll.handler {
                let poll_now = if self.poll.update == PollingUpdate::Resume {
                    // Just resumed; fire the handler without waiting.
                    true
                } else {
                    let now = Instant::now();
                    let elapsed = now.duration_since(self.poll.last_poll);
                    let delay = self.poll.interval().saturating_sub(elapsed);
                    if !self.wait(&mut events, delay.as_millis() as i32)? {
                        continue;
                    }
                    Instant::now().duration_since(self.poll.last_poll) >= self.poll.interval()
                };
                if poll_now {
                    self.call_poll_handler(source);
                }
            } else if let Some(remaining_ms) = self.kill_wait_remaining_ms() {
                let timed_out = if remaining_ms > 0 {
                    if !self.wait(&mut events, remaining_ms.min(i32::MAX as i64) as i32)? {
                        continue;
                    }
                    events.iter().next().is_none()
                } else {
                    true
                };
                if timed_out {
                    // Death notification never came; give up the wait.
                    self.stop_death_wait(false);
                    if self.poll.paused.is_some() {
                        self.poll.update = PollingUpdate::Resume;
                        self.resume_polling(Instant::now());
                    }
                }
            } else if !self.wait(&mut events, -1)? {
                continue;
            }

            // First pass: hangups. Dropped control connections must be
            // reclaimed before new-connection events so a drop-and-reconnect
            // in one cycle lands in a clean slot.
            let hangups: SmallVec<[u64; MAX_EPOLL_EVENTS]> = events
                .iter()
                .filter(|ev| { let flags = ev.flags; flags.contains(epoll::EventFlags::HUP) })
                .map(|ev| ev.data.u64())
                .collect();
            for raw in &hangups {
                match Token::decode(*raw) {
                    Some(Token::DeathWait) => self.call_handler(Token::DeathWait),
                    Some(Token::DataConn(idx)) => {
                        tracing::info!("control data connection dropped");
                        self.watchdog.start();
                        self.close_data_conn(idx);
                        self.watchdog.stop();
                    }
                    _ => {}
                }
            }

            // Second pass: everything readable.
            let ready: SmallVec<[(u64, bool); MAX_EPOLL_EVENTS]> = events
                .iter()
                .map(|ev| { let flags = ev.flags; (ev.data.u64(), flags.contains(epoll::EventFlags::ERR)) })
                .collect();
            for (raw, had_err) in ready {
                if had_err {
                    tracing::debug!(token = raw, "EPOLLERR on event source");
                }
                if hangups.contains(&raw) {
                    continue;
                }
                if let Some(token) = Token::decode(raw) {
                    self.call_handler(token);
                }
            }
        }
    }

    /// `epoll_wait` absorbing EINTR; false means retry the loop.
    fn wait(&self, events: &mut epoll::EventVec, timeout_ms: i32) -> Result<bool> {
        match epoll::wait(&self.epoll, events, timeout_ms) {
            Ok(()) => Ok(true),
            Err(rustix::io::Errno::INTR) => Ok(false),
            Err(err) => {
                tracing::error!(%err, "epoll_wait failed");
                Err(err.into())
            }
        }
    }

    fn kill_wait_remaining_ms(&self) -> Option<i64> {
        if self.config.kill_timeout_ms == 0 || !self.is_waiting_for_kill() {
            return None;
        }
        let elapsed = self
            .last_kill_at
            .map(|at| at.elapsed().as_millis() as i64)
            .unwrap_or(i64::MAX);
        Some(self.config.kill_timeout_ms as i64 - elapsed)
    }

    /// Run one handler under the watchdog, then apply its polling request.
    fn dispatch_guarded<F: FnOnce(&mut Self) -> Option<PollSource>>(&mut self, f: F) {
        self.watchdog.start();
        self.poll.update = PollingUpdate::DoNotChange;
        self.poll.pending = None;

        let source = f(self);

        let now = Instant::now();
        if source.is_some() && self.poll.handler == source {
            self.poll.last_poll = now;
        }
        match self.poll.update {
            PollingUpdate::Start => {
                // Poll for one PSI window after the event; triggers are rate
                // limited to one per window.
                if let Some(pending) = self.poll.pending.take() {
                    self.poll.handler = Some(pending);
                    self.poll.poll_start = now;
                    self.poll.last_poll = now;
                    stats::record_polling_active(true);
                }
            }
            PollingUpdate::Pause => {
                self.poll.paused = self.poll.handler.take();
            }
            PollingUpdate::Resume => self.resume_polling(now),
            PollingUpdate::DoNotChange => {
                if self.poll.handler.is_some()
                    && now.duration_since(self.poll.poll_start)
                        > Duration::from_millis(PSI_WINDOW_MS)
                {
                    // Polled for a full window without a qualifying event.
                    self.poll.handler = None;
                    stats::record_polling_active(false);
                }
            }
        }
        self.watchdog.stop();
    }

    fn call_handler(&mut self, token: Token) {
        self.dispatch_guarded(|daemon| daemon.dispatch(token));
    }

    fn call_poll_handler(&mut self, source: PollSource) {
        self.dispatch_guarded(|daemon| {
            match source {
                PollSource::Engine(level) => {
                    daemon.pressure_tick_new(
                        EventOrigin::Psi { level, events: 0 },
                        PollSource::Engine(level),
                    );
                }
                PollSource::LegacyPsi(level) | PollSource::LegacyMemcg(level) => {
                    daemon.pressure_tick_legacy(source, level, 0);
                }
            }
            Some(source)
        });
    }

    fn resume_polling(&mut self, now: Instant) {
        if let Some(paused) = self.poll.paused.take() {
            self.poll.handler = Some(paused);
            stats::record_polling_active(true);
        }
        self.poll.poll_start = now;
        self.poll.interval_ms = PSI_POLL_PERIOD_SHORT_MS;
    }

    /// Route one epoll event. Returns the poll source the event maps to, so
    /// the wrapper can update poll bookkeeping.
    fn dispatch(&mut self, token: Token) -> Option<PollSource> {
        match token {
            Token::CtrlListen => {
                self.handle_ctrl_connect();
                None
            }
            Token::DataConn(idx) => {
                self.handle_ctrl_data(idx);
                None
            }
            Token::PsiMonitor(level) => {
                if self.config.use_new_strategy {
                    let source = PollSource::Engine(level);
                    self.pressure_tick_new(EventOrigin::Psi { level, events: 1 }, source);
                    Some(source)
                } else {
                    let source = PollSource::LegacyPsi(level);
                    self.pressure_tick_legacy(source, level, 1);
                    Some(source)
                }
            }
            Token::MemcgMonitor(level) => {
                let level = memcg::promote_level(&self.memcg_monitors, level);
                let source = PollSource::LegacyMemcg(level);
                self.pressure_tick_legacy(source, level, 1);
                Some(source)
            }
            Token::MemEvents => {
                self.handle_memevents();
                None
            }
            Token::ReaperFail => {
                self.handle_reaper_failure();
                None
            }
            Token::DeathWait => {
                // The victim is gone.
                self.stop_death_wait(true);
                self.poll.update = PollingUpdate::Resume;
                None
            }
        }
    }

    // ---- death wait ----

    fn is_kill_pending(&self) -> bool {
        match &self.death_wait {
            Some(DeathWait::Pidfd { .. }) => true,
            Some(DeathWait::PidCheck { pid }) => {
                std::path::Path::new(&format!("/proc/{pid}")).exists()
            }
            None => false,
        }
    }

    fn is_waiting_for_kill(&self) -> bool {
        matches!(self.death_wait, Some(DeathWait::Pidfd { .. }))
    }

    fn start_death_wait(&mut self, pid: i32, pidfd: Option<OwnedFd>) {
        if self.death_wait.is_some() {
            tracing::error!("new kill while a death wait is still armed");
            self.stop_death_wait(false);
        }
        match pidfd {
            Some(fd) if self.pidfd_supported => {
                match epoll::add(
                    &self.epoll,
                    &fd,
                    epoll::EventData::new_u64(Token::DeathWait.encode()),
                    epoll::EventFlags::IN,
                ) {
                    Ok(()) => self.death_wait = Some(DeathWait::Pidfd { pid, fd }),
                    Err(err) => {
                        tracing::error!(pid, %err, "cannot register process-fd for death wait");
                    }
                }
            }
            _ => self.death_wait = Some(DeathWait::PidCheck { pid }),
        }
    }

    fn stop_death_wait(&mut self, finished: bool) {
        let Some(wait) = self.death_wait.take() else {
            return;
        };
        if self.config.debug_process_killing {
            let elapsed_ms =
                self.last_kill_at.map(|at| at.elapsed().as_millis()).unwrap_or_default();
            if finished {
                tracing::info!(elapsed_ms, "process got killed");
            } else {
                tracing::info!(elapsed_ms, "stopped waiting for process kill");
            }
        }
        if let DeathWait::Pidfd { fd, .. } = wait {
            if let Err(err) = epoll::delete(&self.epoll, &fd) {
                tracing::error!(%err, "cannot deregister death-wait fd");
            }
        }
    }

    fn handle_reaper_failure(&mut self) {
        // Drain the pipe so epoll can sleep again.
        let mut buf = [0u8; 4];
        while let Ok(4) = rustix::io::read(&self.reaper_fail_fd, &mut buf) {
            let pid = i32::from_ne_bytes(buf);
            tracing::error!(pid, "reaper reported kill failure");
        }
        self.stop_death_wait(false);
        self.poll.update = PollingUpdate::Resume;
    }

    // ---- pressure handling: new strategy ----

    fn pressure_tick_new(&mut self, origin: EventOrigin, source: PollSource) {
        let now = Instant::now();

        let kill_pending = self.is_kill_pending();
        if kill_pending && within_kill_timeout(self.config.kill_timeout_ms, self.last_kill_at) {
            // Still killing; check back shortly.
            self.engine.record_skipped_wakeup();
            stats::record_skipped_wakeup();
            if self.is_waiting_for_kill() {
                self.poll.update = PollingUpdate::Pause;
            } else {
                self.poll.update = PollingUpdate::Start;
                self.poll.pending = Some(source);
                self.poll.interval_ms = PSI_POLL_PERIOD_SHORT_MS;
            }
            return;
        }
        self.stop_death_wait(!kill_pending);

        let vs = match self.vmstat.read() {
            Ok(vs) => vs,
            Err(err) => {
                tracing::error!(%err, "cannot parse vmstat");
                return;
            }
        };
        let mut mi = match self.meminfo.read() {
            Ok(mi) => mi,
            Err(err) => {
                tracing::error!(%err, "cannot parse meminfo");
                return;
            }
        };
        mi.total_gpu_kb = self.gpumem.total_kb();

        let update_events_supported = self
            .memevents
            .as_ref()
            .map(|listener| listener.update_zoneinfo_supported)
            .unwrap_or(false);
        let watermarks =
            match self.watermarks.current(&mut self.zoneinfo, now, update_events_supported) {
                Ok(wm) => wm,
                Err(err) => {
                    tracing::error!(%err, "cannot derive zone watermarks");
                    return;
                }
            };

        let psi_mem_full_avg10 = self
            .psi_readers
            .read_mem()
            .ok()
            .map(|stats| stats[PsiKind::Full as usize].avg10);

        let memevents = self.memevents.as_ref().map(|_| MemEventsState {
            direct_reclaim_since: self.direct_reclaim_started.map(|at| now.duration_since(at)),
            kswapd_active: self.kswapd_started.is_some(),
        });

        let inputs = TickInputs {
            origin,
            vs,
            mi,
            watermarks,
            psi_mem_full_avg10,
            memevents,
            now,
        };

        // The engine calls back into the daemon for the registry walk, so it
        // is temporarily moved out.
        let config = Arc::clone(&self.config);
        let mut engine = std::mem::take(&mut self.engine);
        let outcome = engine.run_tick(&config, &inputs, self);
        self.engine = engine;

        if self.is_waiting_for_kill() {
            // Hold polling until the victim's death notification.
            self.poll.update = PollingUpdate::Pause;
            return;
        }
        self.poll.interval_ms = outcome.poll_interval_ms;
        if outcome.start_polling {
            self.poll.update = PollingUpdate::Start;
            self.poll.pending = Some(source);
        }
    }

    // ---- pressure handling: legacy strategy ----

    fn pressure_tick_legacy(&mut self, source: PollSource, level: PressureLevel, events: u32) {
        let now = Instant::now();
        self.legacy_wakeup.record(now, events > 0);

        if self.config.kill_timeout_ms > 0
            && within_kill_timeout(self.config.kill_timeout_ms, self.last_kill_at)
        {
            if self.is_kill_pending() {
                self.legacy_wakeup.skipped_wakeups += 1;
                stats::record_skipped_wakeup();
                return;
            }
            self.stop_death_wait(true);
        } else {
            self.stop_death_wait(false);
        }

        if self.use_psi_monitors && events > 0 {
            // Take over polling only for a more critical event.
            let more_critical =
                self.poll.handler.map(|cur| level > cur.level()).unwrap_or(true);
            if more_critical {
                self.poll.update = PollingUpdate::Start;
                self.poll.pending = Some(source);
                self.poll.interval_ms = PSI_POLL_PERIOD_SHORT_MS;
            }
        }

        let mut mi = match self.meminfo.read() {
            Ok(mi) => mi,
            Err(err) => {
                tracing::error!(%err, "cannot parse meminfo");
                return;
            }
        };
        mi.total_gpu_kb = self.gpumem.total_kb();
        let zi = match self.zoneinfo.read() {
            Ok(zi) => zi,
            Err(err) => {
                tracing::error!(%err, "cannot parse zoneinfo");
                return;
            }
        };

        let inputs = LegacyInputs {
            level,
            mi,
            totalreserve_pages: zi.totalreserve_pages,
            mem_usage: self.read_memcg_usage(false),
            memsw_usage: self.read_memcg_usage(true),
            now,
        };
        let config = Arc::clone(&self.config);
        let decision = self.legacy.evaluate(&config, &self.targets, &inputs);

        if let LegacyDecision::Kill { min_score_adj, minfree_pages, other_free, other_file } =
            decision
        {
            let job = KillJob {
                min_oom_score_adj: min_score_adj,
                reason_code: -1,
                reason_name: "legacy",
                desc: format!("{} pressure level", level.name()),
                thrashing: 0,
                max_thrashing: 0,
                wakeup: self.legacy_wakeup,
            };
            let pages_freed = self.find_and_kill(&job, &mi);
            if self.legacy.note_result(pages_freed, now) {
                if let Some(minfree) = minfree_pages {
                    tracing::info!(
                        reclaimed_kb = pages_freed * self.page_k,
                        cache_kb = other_file * self.page_k,
                        free_kb = other_free * self.page_k,
                        minfree_kb = i64::from(minfree) * self.page_k,
                        min_score_adj,
                        "reclaimed below minfree level"
                    );
                } else {
                    tracing::info!(
                        reclaimed_kb = pages_freed * self.page_k,
                        min_score_adj,
                        "reclaimed at pressure level"
                    );
                }
            }
        }

        if self.is_waiting_for_kill() {
            self.poll.update = PollingUpdate::Pause;
        }
    }

    fn read_memcg_usage(&mut self, memsw: bool) -> Option<i64> {
        if self.config.use_minfree_levels {
            return None;
        }
        let root = &self.config.memcg_root;
        let reader = if memsw {
            self.memsw_usage_reader.get_or_insert_with(|| {
                FileReader::new(root.join("memory.memsw.usage_in_bytes"), "memsw.usage")
            })
        } else {
            self.mem_usage_reader.get_or_insert_with(|| {
                FileReader::new(root.join("memory.usage_in_bytes"), "memory.usage")
            })
        };
        let usage = reader.read().ok().and_then(|s| s.trim().parse::<i64>().ok())?;
        // Zero usage means the controller is not accounting.
        (usage > 0).then_some(usage)
    }

    // ---- memory-event stream ----

    fn handle_memevents(&mut self) {
        let now = Instant::now();
        let events = {
            let Some(listener) = self.memevents.as_mut() else {
                return;
            };
            match listener.read_events() {
                Ok(events) => events,
                Err(err) => {
                    // Fail open: treat as "not in direct reclaim".
                    self.direct_reclaim_started = None;
                    tracing::error!(%err, "cannot fetch memory events");
                    return;
                }
            }
        };

        for event in events {
            match event {
                MemEvent::DirectReclaimBegin => self.direct_reclaim_started = Some(now),
                MemEvent::DirectReclaimEnd => self.direct_reclaim_started = None,
                MemEvent::KswapdWake => self.kswapd_started = Some(now),
                MemEvent::KswapdSleep => self.kswapd_started = None,
                MemEvent::UpdateZoneinfo => {
                    if let Err(err) = self.watermarks.refresh(&mut self.zoneinfo, now) {
                        tracing::error!(%err, "cannot refresh watermarks");
                    }
                }
                MemEvent::VendorKill { reason, min_oom_score_adj } => {
                    self.pressure_tick_new(
                        EventOrigin::Vendor { reason, min_oom_score_adj },
                        PollSource::Engine(PressureLevel::Medium),
                    );
                }
            }
        }
    }

    // ---- victim selection and kill dispatch ----

    fn find_and_kill(&mut self, job: &KillJob, mi: &MemInfo) -> i64 {
        let mut choose_heaviest = self.config.kill_heaviest_task;

        for adj in (job.min_oom_score_adj..=OOM_SCORE_ADJ_MAX).rev() {
            if !choose_heaviest && adj <= PERCEPTIBLE_APP_ADJ {
                // Having to kill something the user can see, prefer the
                // biggest win to keep the victim count down.
                choose_heaviest = true;
            }
            loop {
                let victim = {
                    let mut registry =
                        self.registry.write().unwrap_or_else(|e| e.into_inner());
                    if choose_heaviest {
                        let mut scan =
                            registry.heaviest(adj, &mut |pid| proc_statm_rss(pid));
                        for dead in scan.dead.drain(..) {
                            registry.remove(dead);
                        }
                        scan.victim
                    } else {
                        registry.tail(adj).map(|record| record.pid)
                    }
                };
                let Some(pid) = victim else {
                    break;
                };
                let freed = self.kill_one_process(pid, job, mi);
                if freed > 0 {
                    return freed;
                }
                if freed == 0 {
                    // Killed but nothing measurable came back; move on to
                    // the next bucket.
                    break;
                }
                // The candidate was stale; retry within the bucket.
            }
        }
        0
    }

    /// Kill `pid`. Returns pages freed, or negative when the record was
    /// stale and has been dropped (the caller retries with the next one).
    fn kill_one_process(&mut self, pid: i32, job: &KillJob, mi: &MemInfo) -> i64 {
        let now = Instant::now();

        let (uid, oom_adj, valid) = {
            let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
            match registry.get(pid) {
                Some(record) => (record.uid, record.oom_adj, record.is_valid()),
                None => return -1,
            }
        };
        if !valid {
            self.remove_record(pid);
            return -1;
        }

        let Some(status) = proc_status(pid) else {
            self.remove_record(pid);
            return -1;
        };
        if status.tgid != i64::from(pid) {
            tracing::error!(pid, tgid = status.tgid, "possible pid reuse, dropping record");
            self.remove_record(pid);
            return -1;
        }
        // Zombies have no RSS/swap fields; nothing left to free.
        let (Some(rss_kb), Some(swap_kb)) = (status.rss_kb, status.swap_kb) else {
            self.remove_record(pid);
            return -1;
        };
        let Some(taskname) = proc_cmdline_name(pid) else {
            self.remove_record(pid);
            return -1;
        };

        if let Some(hook) = self.free_hook.as_mut() {
            let freed_pages = hook(pid, rss_kb / self.page_k, oom_adj, job.reason_code);
            if freed_pages > 0 {
                // Memory was freed elsewhere; the record stays.
                tracing::info!(
                    pid,
                    freed_kb = freed_pages * self.page_k,
                    "skipping kill, memory freed elsewhere"
                );
                return freed_pages;
            }
        }

        let pidfd = {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.get_mut(pid).and_then(|record| record.pidfd.take())
        };
        self.start_death_wait(pid, pidfd);

        let kill_fd = match &self.death_wait {
            Some(DeathWait::Pidfd { fd, .. }) => Some(fd.as_fd()),
            _ => None,
        };
        if let Err(err) = self.reaper.kill(pid, kill_fd) {
            tracing::error!(pid, %err, "kill failed");
            self.stop_death_wait(false);
            self.remove_record(pid);
            return -1;
        }

        self.last_kill_at = Some(now);
        self.killcnt.increment(oom_adj);

        tracing::info!(
            task = %taskname,
            pid,
            uid,
            oom_score_adj = oom_adj,
            rss_kb,
            swap_kb,
            reason = %job.desc,
            "killed process"
        );

        let psi = self.read_psi_data();
        KillRecord::assemble(
            pid,
            uid,
            oom_adj,
            job.min_oom_score_adj,
            rss_kb,
            swap_kb,
            job.reason_code,
            job.thrashing,
            job.max_thrashing,
            mi,
            &job.wakeup,
            psi.as_ref(),
            now,
        )
        .emit();
        stats::record_kill(job.reason_name, rss_kb / self.page_k);

        let free_mem_kb = mi.nr_free_pages * self.page_k;
        let free_swap_kb =
            crate::evaluator::free_swap(mi, self.config.swap_compression_ratio) * self.page_k;
        self.notify_subscribers(
            AsyncEvent::Kill,
            &control::encode_kill_notification(pid, uid, rss_kb),
        );
        self.notify_subscribers(
            AsyncEvent::Stat,
            &control::encode_kill_stat(
                uid,
                oom_adj,
                job.min_oom_score_adj,
                free_mem_kb,
                free_swap_kb,
                job.reason_code,
                job.thrashing,
                job.max_thrashing,
            ),
        );

        self.remove_record(pid);
        rss_kb / self.page_k
    }

    fn read_psi_data(&mut self) -> Option<PsiData> {
        let mem = self.psi_readers.read_mem().ok()?;
        Some(PsiData {
            mem,
            io: self.psi_readers.read_io().unwrap_or_default(),
            cpu: self.psi_readers.read_cpu().unwrap_or_default(),
        })
    }

    /// Remove a record; its process-fd closes unless the death wait took it.
    fn remove_record(&mut self, pid: i32) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.remove(pid);
    }

    // ---- control socket ----

    fn handle_ctrl_connect(&mut self) {
        let free_idx = match self.data_conns.iter().position(|conn| conn.is_none()) {
            Some(idx) => idx,
            None => {
                // All slots busy: drop everyone and let them reconnect
                // rather than letting idle clients starve the socket.
                for idx in 0..MAX_DATA_CONN {
                    self.close_data_conn(idx);
                }
                0
            }
        };

        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                tracing::error!(%err, "control socket accept failed");
                return;
            }
        };
        let peer_pid = match peer_cred(&stream) {
            Ok((pid, _uid)) => pid,
            Err(err) => {
                tracing::error!(%err, "cannot read peer credentials");
                return;
            }
        };

        if let Err(err) = epoll::add(
            &self.epoll,
            &stream,
            epoll::EventData::new_u64(Token::DataConn(free_idx).encode()),
            epoll::EventFlags::IN,
        ) {
            tracing::error!(%err, "cannot register control data connection");
            return;
        }
        tracing::info!(peer_pid, "control data connection established");
        self.data_conns[free_idx] = Some(DataConn { stream, peer_pid, event_mask: 0 });
    }

    fn close_data_conn(&mut self, idx: usize) {
        let Some(conn) = self.data_conns[idx].take() else {
            return;
        };
        tracing::info!("closing control data connection");
        if let Err(err) = epoll::delete(&self.epoll, &conn.stream) {
            tracing::warn!(%err, "cannot deregister data connection");
        }
        // Records of the departed registrant become claimable by others.
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.remove_claims(conn.peer_pid);
    }

    fn handle_ctrl_data(&mut self, idx: usize) {
        enum ReadOutcome {
            Data(usize, i32),
            Closed,
            Retry,
        }

        let mut buf = [0u8; MAX_PACKET_BYTES];
        let outcome = {
            let Some(conn) = self.data_conns[idx].as_mut() else {
                return;
            };
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    tracing::info!("EOF on control data socket");
                    ReadOutcome::Closed
                }
                Ok(len) => ReadOutcome::Data(len, conn.peer_pid),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => ReadOutcome::Retry,
                Err(err) => {
                    tracing::error!(%err, "control data socket read failed");
                    ReadOutcome::Closed
                }
            }
        };
        let (len, peer_pid) = match outcome {
            ReadOutcome::Data(len, peer_pid) => (len, peer_pid),
            ReadOutcome::Closed => {
                self.close_data_conn(idx);
                return;
            }
            ReadOutcome::Retry => return,
        };

        let command = match control::decode_words(&buf[..len]).and_then(|w| {
            control::parse_command(&w)
        }) {
            Ok(command) => command,
            Err(err) => {
                // Malformed packets are logged and dropped; the connection
                // stays usable.
                tracing::error!(%err, "bad control packet");
                return;
            }
        };
        self.handle_command(idx, peer_pid, command);
    }

    fn handle_command(&mut self, idx: usize, peer_pid: i32, command: Command) {
        match command {
            Command::Target(targets) => {
                self.targets.update(&targets, Instant::now());
            }
            Command::ProcPrio(params) => self.apply_proc_prio(&params, peer_pid),
            Command::ProcsPrio(list) => {
                for params in &list {
                    self.apply_proc_prio(params, peer_pid);
                }
            }
            Command::ProcRemove { pid } => self.cmd_procremove(pid, peer_pid),
            Command::ProcPurge => self.cmd_procpurge(peer_pid),
            Command::GetKillCnt { min_adj, max_adj } => {
                let count = self.killcnt.query(min_adj, max_adj) as i32;
                self.reply(idx, &[control::cmd::GETKILLCNT, count]);
            }
            Command::Subscribe(event) => {
                if let Some(conn) = self.data_conns[idx].as_mut() {
                    conn.event_mask |= event.mask_bit();
                }
            }
            Command::UpdateProps => {
                let result = if self.update_props() { 0 } else { -1 };
                self.reply(idx, &[control::cmd::UPDATE_PROPS, result]);
                if result == 0 {
                    tracing::info!("properties reinitialized");
                } else {
                    // The running configuration cannot be realized anymore;
                    // exit so the supervisor restarts us cleanly.
                    tracing::error!("new configuration is not supported, exiting");
                    std::process::exit(1);
                }
            }
            Command::BootCompleted => {
                let result = self.cmd_boot_completed();
                self.reply(idx, &[control::cmd::BOOT_COMPLETED, result]);
            }
            Command::StartMonitoring => self.cmd_start_monitoring(),
        }
    }

    fn reply(&mut self, idx: usize, words: &[i32]) {
        use std::io::Write;
        let bytes = control::encode_words(words);
        if let Some(conn) = self.data_conns[idx].as_mut() {
            if let Err(err) = conn.stream.write_all(&bytes) {
                tracing::error!(%err, "control data socket write failed");
            }
        }
    }

    fn notify_subscribers(&mut self, event: AsyncEvent, bytes: &[u8]) {
        use std::io::Write;
        for conn in self.data_conns.iter_mut().flatten() {
            if conn.event_mask & event.mask_bit() != 0 {
                if let Err(err) = conn.stream.write_all(bytes) {
                    tracing::warn!(%err, "cannot push notification to subscriber");
                }
            }
        }
    }

    fn apply_proc_prio(&mut self, params: &ProcPrio, registrant: i32) {
        // Only thread-group leaders may be registered.
        if let Some(status) = proc_status(params.pid) {
            if status.tgid != i64::from(params.pid) {
                tracing::error!(
                    pid = params.pid,
                    tgid = status.tgid,
                    "refusing to register a non-leader thread"
                );
                return;
            }
        }

        match write_oom_score_adj(params.pid, params.oom_adj) {
            OomAdjWrite::Done => {}
            // The file vanishing means the process is already dead.
            OomAdjWrite::ProcessDead => return,
            OomAdjWrite::Failed => return,
        }

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if registry.get(params.pid).is_some() {
            if !registry.claim(params.pid, registrant) {
                tracing::error!(
                    registrant,
                    pid = params.pid,
                    "client attempts to modify a process registered by another client"
                );
                return;
            }
            registry.set_adjustment(params.pid, params.oom_adj);
            return;
        }

        let pidfd = if self.pidfd_supported {
            match rustix::process::Pid::from_raw(params.pid)
                .ok_or(rustix::io::Errno::INVAL)
                .and_then(|pid| {
                    rustix::process::pidfd_open(pid, rustix::process::PidfdFlags::empty())
                }) {
                Ok(fd) => Some(fd),
                Err(err) => {
                    tracing::error!(pid = params.pid, %err, "pidfd_open failed");
                    return;
                }
            }
        } else {
            None
        };
        registry.insert(ProcessRecord::new(
            params.pid,
            params.uid,
            params.oom_adj,
            registrant,
            pidfd,
        ));
    }

    fn cmd_procremove(&mut self, pid: i32, registrant: i32) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if registry.get(pid).is_none() {
            return;
        }
        if !registry.claim(pid, registrant) {
            tracing::error!(
                registrant,
                pid,
                "client attempts to unregister a process registered by another client"
            );
            return;
        }
        registry.remove(pid);
    }

    fn cmd_procpurge(&mut self, registrant: i32) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        for pid in registry.purgeable_pids(registrant) {
            registry.remove(pid);
        }
    }

    fn cmd_boot_completed(&mut self) -> i32 {
        if self.boot_completed_handled {
            return 1;
        }
        match self.init_memevents() {
            Ok(()) => {
                tracing::info!("using memory events for reclaim detection");
            }
            Err(err) => {
                tracing::info!(%err, "using vmstat fallback for reclaim detection");
                self.disable_direct_reclaim_threshold();
            }
        }
        self.boot_completed_handled = true;
        0
    }

    fn cmd_start_monitoring(&mut self) {
        if self.monitors_initialized {
            return;
        }
        if !self.boot_completed_handled && !self.config.boot_completed {
            tracing::error!("cannot start monitoring before boot completes");
            return;
        }
        if let Err(err) = self.init_monitors() {
            tracing::error!(%err, "cannot initialize monitors, exiting");
            std::process::exit(1);
        }
        tracing::info!("initialized monitors after boot completed");
    }

    fn update_props(&mut self) -> bool {
        let props = PropertyStore::load_default();
        self.config = Arc::new(Config::from_store(&props));
        self.mem_usage_reader = None;
        self.memsw_usage_reader = None;
        self.gpumem = GpuMemReader::new(&self.config.gpumem_path);

        if self.monitors_initialized {
            // Rebuild the whole pressure-source set under the new settings.
            self.destroy_monitors();
            if self.init_monitors().is_err() {
                return false;
            }
        }
        if self.config.direct_reclaim_threshold_ms > 0 && self.memevents.is_none() {
            tracing::warn!("kernel support for direct_reclaim_threshold_ms not found");
            self.disable_direct_reclaim_threshold();
        }
        true
    }

    fn disable_direct_reclaim_threshold(&mut self) {
        if self.config.direct_reclaim_threshold_ms > 0 {
            let mut config = (*self.config).clone();
            config.direct_reclaim_threshold_ms = 0;
            self.config = Arc::new(config);
        }
    }

    // ---- monitor lifecycle ----

    fn init_monitors(&mut self) -> Result<()> {
        self.use_psi_monitors = self.config.use_psi && self.init_psi_monitors().is_ok();
        if !self.use_psi_monitors {
            self.init_memcg_monitors().map_err(|err| {
                Error::Init(format!("no memory pressure event support: {err}"))
            })?;
        }
        if self.use_psi_monitors {
            tracing::info!("using psi monitors for memory pressure detection");
        } else {
            tracing::info!("using memcg eventfds for memory pressure detection");
        }
        self.monitors_initialized = true;
        Ok(())
    }

    fn init_psi_monitors(&mut self) -> Result<()> {
        // The legacy strategy needs memcg v1 statistics to steer decisions.
        if !self.config.use_new_strategy
            && !self.config.memcg_root.join("memory.pressure_level").exists()
        {
            return Err(Error::Unsupported("legacy strategy requires a v1 memcg hierarchy"));
        }

        let thresholds: [Option<PsiThreshold>; 3] = if self.config.use_new_strategy {
            [
                // Low level stays dark under the new strategy.
                None,
                Some(PsiThreshold {
                    kind: PsiKind::Some,
                    threshold_ms: self.config.psi_partial_stall_ms.max(0) as u32,
                }),
                Some(PsiThreshold {
                    kind: PsiKind::Full,
                    threshold_ms: self.config.psi_complete_stall_ms.max(0) as u32,
                }),
            ]
        } else {
            [
                Some(DEFAULT_THRESHOLDS[0]),
                Some(DEFAULT_THRESHOLDS[1]),
                Some(DEFAULT_THRESHOLDS[2]),
            ]
        };

        let mut monitors: Vec<PsiMonitor> = Vec::new();
        for level in PressureLevel::ALL {
            let Some(threshold) = thresholds[level as usize] else {
                continue;
            };
            if threshold.threshold_ms == 0 {
                continue;
            }
            let monitor = match PsiMonitor::new(level, threshold) {
                Ok(monitor) => monitor,
                Err(err) => {
                    // Roll back what we armed so far.
                    for prior in &monitors {
                        let _ = epoll::delete(&self.epoll, &prior.fd());
                    }
                    return Err(err);
                }
            };
            epoll::add(
                &self.epoll,
                &monitor.fd(),
                epoll::EventData::new_u64(Token::PsiMonitor(level).encode()),
                epoll::EventFlags::PRI,
            )?;
            monitors.push(monitor);
        }
        self.psi_monitors = monitors;
        Ok(())
    }

    fn init_memcg_monitors(&mut self) -> Result<()> {
        let mut monitors = Vec::new();
        for level in PressureLevel::ALL {
            let monitor = MemcgMonitor::arm(&self.config.memcg_root, level)?;
            epoll::add(
                &self.epoll,
                &monitor.fd(),
                epoll::EventData::new_u64(Token::MemcgMonitor(level).encode()),
                epoll::EventFlags::IN,
            )?;
            monitors.push(monitor);
        }
        self.memcg_monitors = monitors;
        Ok(())
    }

    fn destroy_monitors(&mut self) {
        for monitor in self.psi_monitors.drain(..) {
            let _ = epoll::delete(&self.epoll, &monitor.fd());
        }
        for monitor in self.memcg_monitors.drain(..) {
            let _ = epoll::delete(&self.epoll, &monitor.fd());
        }
        self.monitors_initialized = false;
        self.poll.handler = None;
        self.poll.paused = None;
    }

    fn init_memevents(&mut self) -> Result<()> {
        if self.memevents.is_some() {
            return Ok(());
        }
        let listener = MemEventListener::open(&self.config.memevents_path)?;
        epoll::add(
            &self.epoll,
            &listener.fd(),
            epoll::EventData::new_u64(Token::MemEvents.encode()),
            epoll::EventFlags::IN,
        )?;
        self.direct_reclaim_started = None;
        self.kswapd_started = None;
        self.memevents = Some(listener);
        Ok(())
    }
}

impl VictimKiller for Daemon {
    fn kill(&mut self, call: &KillCall, mi: &MemInfo) -> i64 {
        self.find_and_kill(&KillJob::from_call(call), mi)
    }
}

fn within_kill_timeout(timeout_ms: u64, last_kill_at: Option<Instant>) -> bool {
    match last_kill_at {
        None => false,
        Some(at) => {
            timeout_ms == 0 || at.elapsed() < Duration::from_millis(timeout_ms)
        }
    }
}

/// Peer credentials of a connected control client.
fn peer_cred(stream: &UnixStream) -> std::io::Result<(i32, u32)> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: cred is a properly sized out-parameter for SO_PEERCRED.
    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((cred.pid, cred.uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let tokens = [
            Token::CtrlListen,
            Token::ReaperFail,
            Token::MemEvents,
            Token::DeathWait,
            Token::DataConn(0),
            Token::DataConn(2),
            Token::PsiMonitor(PressureLevel::Low),
            Token::PsiMonitor(PressureLevel::Critical),
            Token::MemcgMonitor(PressureLevel::Medium),
        ];
        for token in tokens {
            assert_eq!(Token::decode(token.encode()), Some(token));
        }
        assert_eq!(Token::decode(0), None);
        assert_eq!(Token::decode(0x999), None);
    }

    #[test]
    fn test_within_kill_timeout() {
        assert!(!within_kill_timeout(100, None));
        let now = Instant::now();
        assert!(within_kill_timeout(10_000, Some(now)));
        // Timeout of zero means "forever" while a kill is pending.
        assert!(within_kill_timeout(0, Some(now)));
    }

    #[test]
    fn test_poll_state_defaults() {
        let poll = PollState::new();
        assert!(poll.handler.is_none());
        assert!(poll.paused.is_none());
        assert_eq!(poll.update, PollingUpdate::DoNotChange);
        assert_eq!(poll.interval_ms, crate::PSI_POLL_PERIOD_LONG_MS);
    }

    #[test]
    fn test_poll_source_level() {
        assert_eq!(PollSource::Engine(PressureLevel::Medium).level(), PressureLevel::Medium);
        assert_eq!(
            PollSource::LegacyMemcg(PressureLevel::Critical).level(),
            PressureLevel::Critical
        );
    }
}
