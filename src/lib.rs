//! # lowmemd
//!
//! A userspace low-memory killer daemon for Linux.
//!
//! lowmemd watches kernel memory-pressure signals (PSI triggers, legacy
//! memcg eventfds, or a kernel memory-event stream), keeps a priority-ordered
//! registry of killable processes, and proactively kills the least important
//! one before the kernel OOM killer has to step in.
//!
//! ## Architecture
//!
//! - **Single-threaded reactor**: all registry mutation, control-socket
//!   handling and kill decisions run on one epoll loop ([`daemon`]).
//! - **Pressure sources**: PSI monitors, memcg eventfds and a memory-event
//!   stream ([`pressure`]) feed the decision engine ([`engine`]).
//! - **Side threads by fd only**: a reaper worker ([`reaper`]) reports kill
//!   failures through a pipe, and a watchdog ([`watchdog`]) supervises every
//!   handler invocation with a 2-second deadline.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lowmemd::daemon::Daemon;
//! use lowmemd::props::PropertyStore;
//!
//! let props = PropertyStore::load_default();
//! let mut daemon = Daemon::new(&props)?;
//! daemon.run()
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod killcnt;
pub mod legacy;
pub mod pressure;
pub mod procfs;
pub mod props;
pub mod reaper;
pub mod registry;
pub mod stats;
pub mod targets;
pub mod watchdog;

pub use error::{Error, Result};

/// Lowest OOM adjustment a process can carry.
pub const OOM_SCORE_ADJ_MIN: i32 = -1000;
/// Highest OOM adjustment a process can carry.
pub const OOM_SCORE_ADJ_MAX: i32 = 1000;

/// Adjustment above which a process is considered user-perceptible.
pub const PERCEPTIBLE_APP_ADJ: i32 = 200;
/// Adjustment of the previously used foreground app.
pub const PREVIOUS_APP_ADJ: i32 = 700;

/// PSI trigger tracking window. Triggers fire at most once per window, so
/// after an event we poll memory state for this long.
pub const PSI_WINDOW_MS: u64 = 1000;
/// Polling period while pressure is high (during/after a kill, low swap).
pub const PSI_POLL_PERIOD_SHORT_MS: u64 = 10;
/// Polling period while pressure is moderate.
pub const PSI_POLL_PERIOD_LONG_MS: u64 = 100;

/// Map an OOM adjustment to its bucket slot.
#[inline]
pub fn adj_to_slot(adj: i32) -> usize {
    (adj - OOM_SCORE_ADJ_MIN) as usize
}

/// Number of adjustment bucket slots.
pub const ADJ_SLOT_COUNT: usize = (OOM_SCORE_ADJ_MAX - OOM_SCORE_ADJ_MIN + 1) as usize;

/// Runtime page size in bytes.
#[inline]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Runtime page size in kilobytes.
#[inline]
pub fn page_k() -> i64 {
    (rustix::param::page_size() / 1024) as i64
}
