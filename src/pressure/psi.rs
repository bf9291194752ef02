//! PSI trigger monitors.
//!
//! A trigger is armed by writing `<some|full> <threshold_us> <window_us>` to
//! `/proc/pressure/memory`; the kernel then raises `POLLPRI` on that
//! descriptor whenever the stall time within the sliding window crosses the
//! threshold, at most once per window.

use super::PressureLevel;
use crate::error::{Error, Result};
use crate::procfs::PsiKind;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{open, Mode, OFlags};

const PSI_MEMORY_PATH: &str = "/proc/pressure/memory";

/// Trigger configuration for one pressure level.
#[derive(Debug, Clone, Copy)]
pub struct PsiThreshold {
    /// Stall kind the trigger watches.
    pub kind: PsiKind,
    /// Stall time within the window that fires the trigger, ms.
    pub threshold_ms: u32,
}

/// Default thresholds for the legacy strategy, by level.
pub const DEFAULT_THRESHOLDS: [PsiThreshold; 3] = [
    PsiThreshold { kind: PsiKind::Some, threshold_ms: 70 },
    PsiThreshold { kind: PsiKind::Some, threshold_ms: 100 },
    PsiThreshold { kind: PsiKind::Full, threshold_ms: 70 },
];

/// An armed PSI trigger descriptor.
pub struct PsiMonitor {
    fd: OwnedFd,
    level: PressureLevel,
}

impl PsiMonitor {
    /// Arm a trigger with a window of [`crate::PSI_WINDOW_MS`].
    pub fn new(level: PressureLevel, threshold: PsiThreshold) -> Result<Self> {
        Self::new_at(PSI_MEMORY_PATH, level, threshold)
    }

    fn new_at(path: &str, level: PressureLevel, threshold: PsiThreshold) -> Result<Self> {
        let fd = open(
            path,
            OFlags::WRONLY | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| {
            Error::Init(format!("cannot open {path} for {} trigger: {err}", level.name()))
        })?;

        let kind = match threshold.kind {
            PsiKind::Some => "some",
            PsiKind::Full => "full",
        };
        let config = format!(
            "{kind} {} {}",
            u64::from(threshold.threshold_ms) * 1000,
            crate::PSI_WINDOW_MS * 1000
        );
        rustix::io::write(&fd, config.as_bytes()).map_err(|err| {
            Error::Init(format!("cannot arm {} psi trigger ({config:?}): {err}", level.name()))
        })?;

        Ok(Self { fd, level })
    }

    /// Level this monitor reports.
    pub fn level(&self) -> PressureLevel {
        self.level
    }

    /// The trigger descriptor, for epoll registration with `POLLPRI`.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
